// =============================================================================
// Online Learner — incremental logistic model fed by closed trades
// =============================================================================
//
// SGD with log loss over standardized features. Design goals mirror the
// batch gate's failure posture: never block trading, fail to None, persist
// so learning survives restarts.
//
//   * The scaler keeps running mean/variance and freezes after 200 samples
//     so late distribution drift cannot silently reshape old weights.
//   * predict_proba abstains (None) until `min_updates_before_predict`
//     labeled examples have been absorbed.
//   * State saves atomically every `save_every_updates` updates.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

const LEARNING_RATE: f64 = 0.05;
const L2_PENALTY: f64 = 0.0005;
const SCALER_FREEZE_SAMPLES: usize = 200;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Scaler {
    mean: Vec<f64>,
    /// Sum of squared deviations (Welford M2).
    m2: Vec<f64>,
    count: usize,
}

impl Scaler {
    fn new(dim: usize) -> Self {
        Self {
            mean: vec![0.0; dim],
            m2: vec![0.0; dim],
            count: 0,
        }
    }

    fn partial_fit(&mut self, x: &[f64]) {
        self.count += 1;
        let n = self.count as f64;
        for i in 0..x.len() {
            let delta = x[i] - self.mean[i];
            self.mean[i] += delta / n;
            self.m2[i] += delta * (x[i] - self.mean[i]);
        }
    }

    fn transform(&self, x: &[f64]) -> Vec<f64> {
        x.iter()
            .enumerate()
            .map(|(i, v)| {
                let var = if self.count > 1 {
                    self.m2[i] / (self.count as f64 - 1.0)
                } else {
                    0.0
                };
                let std = var.max(0.0).sqrt();
                if std > 1e-12 {
                    (v - self.mean[i]) / std
                } else {
                    v - self.mean[i]
                }
            })
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct State {
    feature_names: Vec<String>,
    weights: Vec<f64>,
    bias: f64,
    scaler: Scaler,
    updates: usize,
    seen: usize,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct OnlineStats {
    pub seen: usize,
    pub updates: usize,
    pub ready: bool,
}

pub struct OnlineLearner {
    path: PathBuf,
    min_updates_before_predict: usize,
    save_every_updates: usize,
    state: Mutex<State>,
}

impl OnlineLearner {
    pub fn new(
        path: impl Into<PathBuf>,
        feature_names: &[&str],
        min_updates_before_predict: usize,
        save_every_updates: usize,
    ) -> Self {
        let path = path.into();
        let dim = feature_names.len();
        let fresh = State {
            feature_names: feature_names.iter().map(|s| s.to_string()).collect(),
            weights: vec![0.0; dim],
            bias: 0.0,
            scaler: Scaler::new(dim),
            updates: 0,
            seen: 0,
        };

        // Best-effort restore; a stale artifact with different features is
        // discarded rather than misapplied.
        let state = match load_state(&path) {
            Ok(Some(saved)) if saved.feature_names == fresh.feature_names => {
                info!(path = %path.display(), updates = saved.updates, "online model restored");
                saved
            }
            Ok(Some(_)) => {
                warn!(path = %path.display(), "online model feature set changed; starting fresh");
                fresh
            }
            Ok(None) => fresh,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "online model load failed (non-fatal)");
                fresh
            }
        };

        Self {
            path,
            min_updates_before_predict: min_updates_before_predict.max(1),
            save_every_updates: save_every_updates.max(1),
            state: Mutex::new(state),
        }
    }

    fn vectorize(names: &[String], features: &HashMap<String, f64>) -> Vec<f64> {
        names
            .iter()
            .map(|n| {
                let v = features.get(n).copied().unwrap_or(0.0);
                if v.is_finite() {
                    v
                } else {
                    0.0
                }
            })
            .collect()
    }

    /// Probability of a win, or None while the model is still warming up.
    pub fn predict_proba(&self, features: &HashMap<String, f64>) -> Option<f64> {
        let state = self.state.lock();
        if state.updates < self.min_updates_before_predict {
            return None;
        }
        let x = Self::vectorize(&state.feature_names, features);
        let xs = state.scaler.transform(&x);
        let z = state.bias
            + state
                .weights
                .iter()
                .zip(xs.iter())
                .map(|(w, v)| w * v)
                .sum::<f64>();
        let p = 1.0 / (1.0 + (-z).exp());
        if p.is_finite() {
            Some(p.clamp(0.0, 1.0))
        } else {
            None
        }
    }

    /// Absorb one labeled example. `label > 0` means the trade won.
    pub fn update(&self, features: &HashMap<String, f64>, label: f64) {
        let y = if label > 0.0 { 1.0 } else { 0.0 };
        let mut state = self.state.lock();

        let x = Self::vectorize(&state.feature_names, features);
        if state.seen < SCALER_FREEZE_SAMPLES {
            state.scaler.partial_fit(&x);
        }
        let xs = state.scaler.transform(&x);

        let z = state.bias
            + state
                .weights
                .iter()
                .zip(xs.iter())
                .map(|(w, v)| w * v)
                .sum::<f64>();
        let p = 1.0 / (1.0 + (-z).exp());
        let gradient = p - y;

        for i in 0..state.weights.len() {
            let step = gradient * xs[i] + L2_PENALTY * state.weights[i];
            state.weights[i] -= LEARNING_RATE * step;
        }
        state.bias -= LEARNING_RATE * gradient;

        state.seen += 1;
        state.updates += 1;

        if state.updates % self.save_every_updates == 0 {
            if let Err(e) = save_state(&self.path, &state) {
                warn!(error = %e, "online model save failed (non-fatal)");
            } else {
                debug!(updates = state.updates, "online model saved");
            }
        }
    }

    /// Persist immediately (shutdown path).
    pub fn force_save(&self) {
        let state = self.state.lock();
        if let Err(e) = save_state(&self.path, &state) {
            warn!(error = %e, "online model force-save failed");
        }
    }

    pub fn stats(&self) -> OnlineStats {
        let state = self.state.lock();
        OnlineStats {
            seen: state.seen,
            updates: state.updates,
            ready: state.updates >= self.min_updates_before_predict,
        }
    }
}

fn load_state(path: &Path) -> Result<Option<State>> {
    if !path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let state =
        serde_json::from_str(&content).with_context(|| format!("failed to parse {}", path.display()))?;
    Ok(Some(state))
}

fn save_state(path: &Path, state: &State) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let content = serde_json::to_string(state).context("failed to serialize online model")?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, &content).with_context(|| format!("failed to write {}", tmp.display()))?;
    std::fs::rename(&tmp, path).with_context(|| format!("failed to rename {}", tmp.display()))?;
    Ok(())
}
