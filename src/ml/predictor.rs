// =============================================================================
// Batch Predictor — disk-trained probability gate
// =============================================================================
//
// Loads two artifacts published by the trainer:
//   * normalization.json — {feature_names, mean[], std[], seed}
//   * trade_predictor.json — {weights[], bias} logistic coefficients over the
//     normalized features, in normalization order
//
// The predictor reorders incoming feature dicts to match `feature_names`.
// With either artifact missing it returns the neutral probability 0.5, so a
// fresh install trades on strategy confidence alone.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Normalization artifact shared by trainer and predictor. The mean/std are
/// fit on the training split only; `seed` documents the split.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Normalization {
    pub feature_names: Vec<String>,
    pub mean: Vec<f64>,
    pub std: Vec<f64>,
    #[serde(default)]
    pub seed: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogisticModel {
    pub weights: Vec<f64>,
    #[serde(default)]
    pub bias: f64,
}

pub struct BatchPredictor {
    normalization: Option<Normalization>,
    model: Option<LogisticModel>,
}

impl BatchPredictor {
    /// Load artifacts best-effort: a missing or malformed file logs a warning
    /// and leaves the predictor in its neutral state.
    pub fn load(model_path: impl AsRef<Path>, normalization_path: impl AsRef<Path>) -> Self {
        let normalization = match read_json::<Normalization>(normalization_path.as_ref()) {
            Ok(n) => {
                if n.feature_names.len() == n.mean.len() && n.mean.len() == n.std.len() {
                    info!(
                        features = n.feature_names.len(),
                        seed = n.seed,
                        "normalization loaded"
                    );
                    Some(n)
                } else {
                    warn!("normalization artifact has mismatched lengths; ignoring");
                    None
                }
            }
            Err(e) => {
                info!(error = %e, "no normalization artifact; predictor neutral");
                None
            }
        };

        let model = match read_json::<LogisticModel>(model_path.as_ref()) {
            Ok(m) => match &normalization {
                Some(n) if m.weights.len() == n.feature_names.len() => {
                    info!(weights = m.weights.len(), "batch model loaded");
                    Some(m)
                }
                Some(_) => {
                    warn!("batch model weight count does not match normalization; ignoring");
                    None
                }
                None => None,
            },
            Err(e) => {
                info!(error = %e, "no batch model artifact; predictor neutral");
                None
            }
        };

        Self {
            normalization,
            model,
        }
    }

    /// A predictor that always answers 0.5.
    pub fn absent() -> Self {
        Self {
            normalization: None,
            model: None,
        }
    }

    pub fn is_model_loaded(&self) -> bool {
        self.model.is_some() && self.normalization.is_some()
    }

    /// Probability of a winning trade given the feature dict. Returns 0.5
    /// when no model is loaded or the score is non-finite.
    pub fn predict(&self, features: &HashMap<String, f64>) -> f64 {
        let (Some(norm), Some(model)) = (&self.normalization, &self.model) else {
            return 0.5;
        };

        let mut z = model.bias;
        for (i, name) in norm.feature_names.iter().enumerate() {
            let raw = features.get(name).copied().unwrap_or(0.0);
            let raw = if raw.is_finite() { raw } else { 0.0 };
            let std = if norm.std[i].abs() > 1e-12 { norm.std[i] } else { 1.0 };
            let x = (raw - norm.mean[i]) / std;
            z += model.weights[i] * x;
        }

        let p = 1.0 / (1.0 + (-z).exp());
        if p.is_finite() {
            p.clamp(0.0, 1.0)
        } else {
            0.5
        }
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("failed to parse {}", path.display()))
}
