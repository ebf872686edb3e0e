// =============================================================================
// Task Supervisor — restart long-lived tasks with backoff
// =============================================================================
//
// Every engine loop runs under a supervisor. On failure: log, count, sleep
// an exponentially backed-off delay with jitter, restart. A task that
// survived ten minutes gets its failure counter reset. Critical tasks that
// keep dying trip the auto-pause callback instead of being allowed to
// thrash while trades are open. The process itself never crashes from a
// supervised task.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use tracing::{error, info, warn};

const BACKOFF_BASE_SECONDS: f64 = 2.0;
const BACKOFF_CAP_SECONDS: f64 = 30.0;
/// A run longer than this counts as healthy and resets the failure counter.
const HEALTHY_RUN_SECONDS: u64 = 600;
/// Critical tasks trip the pause callback at this many consecutive failures.
pub const CRITICAL_FAILURE_THRESHOLD: u32 = 3;

/// Restart delay for the n-th consecutive failure (1-based), jittered.
fn backoff_with_jitter(failures: u32) -> Duration {
    let base = (BACKOFF_BASE_SECONDS * 2f64.powi(failures.saturating_sub(1) as i32))
        .min(BACKOFF_CAP_SECONDS);
    let jitter: f64 = rand::thread_rng().gen_range(0.0..1.0);
    Duration::from_secs_f64(base + jitter)
}

/// Run `task` forever under restart supervision.
///
/// * `task` is a factory producing one run of the loop; returning Ok means
///   a graceful stop (the supervisor exits), returning Err means a crash
///   (the supervisor restarts after backoff).
/// * `critical` tasks invoke `on_critical_failure` once their consecutive
///   failure count reaches the threshold.
pub async fn supervise<F, Fut, C>(
    name: &'static str,
    critical: bool,
    running: Arc<AtomicBool>,
    on_critical_failure: C,
    task: F,
) where
    F: Fn() -> Fut,
    Fut: Future<Output = anyhow::Result<()>>,
    C: Fn(&'static str),
{
    let mut failures: u32 = 0;
    info!(task = name, critical, "supervised task started");

    while running.load(Ordering::SeqCst) {
        let started = Instant::now();
        match task().await {
            Ok(()) => {
                info!(task = name, "supervised task stopped cleanly");
                return;
            }
            Err(e) => {
                if started.elapsed().as_secs() >= HEALTHY_RUN_SECONDS {
                    failures = 0;
                }
                failures += 1;
                error!(
                    task = name,
                    failures,
                    error = %e,
                    "supervised task failed"
                );

                if critical && failures >= CRITICAL_FAILURE_THRESHOLD {
                    warn!(task = name, failures, "critical task failure threshold reached");
                    on_critical_failure(name);
                }

                if !running.load(Ordering::SeqCst) {
                    break;
                }
                let delay = backoff_with_jitter(failures);
                warn!(task = name, delay_s = delay.as_secs_f64(), "restarting after backoff");
                tokio::time::sleep(delay).await;
            }
        }
    }
    info!(task = name, "supervised task shut down");
}
