use rand::{rngs::StdRng, Rng, SeedableRng};
use rand_distr::{Distribution, Poisson, StandardNormal};
use serde::{Deserialize, Serialize};
use strum::IntoEnumIterator;
use tracing::{debug, info};

use super::models::{Direction, Features, Prediction};
use super::oracle::{ModelOracle, OracleError};

const CLASSES: usize = 3;
const FEATURES: usize = 3;

/// Running mean and variance per feature (Welford)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunningScaler {
    count: f64,
    mean: [f64; FEATURES],
    m2: [f64; FEATURES],
}

impl RunningScaler {
    pub fn update(&mut self, x: &[f64; FEATURES]) {
        self.count += 1.0;
        for j in 0..FEATURES {
            let delta = x[j] - self.mean[j];
            self.mean[j] += delta / self.count;
            self.m2[j] += delta * (x[j] - self.mean[j]);
        }
    }

    pub fn transform(&self, x: &[f64; FEATURES]) -> [f64; FEATURES] {
        let mut z = [0.0; FEATURES];
        for j in 0..FEATURES {
            let std = if self.count > 1.0 {
                (self.m2[j] / self.count).sqrt()
            } else {
                0.0
            };
            let std = if std < 1e-9 { 1.0 } else { std };
            z[j] = (x[j] - self.mean[j]) / std;
        }
        z
    }
}

/// Multinomial logistic regression trained by weighted SGD on standardized features
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SoftmaxRegression {
    weights: [[f64; FEATURES]; CLASSES],
    bias: [f64; CLASSES],
    scaler: RunningScaler,
    learning_rate: f64,
    l2: f64,
}

impl Default for SoftmaxRegression {
    fn default() -> Self {
        Self {
            weights: [[0.0; FEATURES]; CLASSES],
            bias: [0.0; CLASSES],
            scaler: RunningScaler::default(),
            learning_rate: 0.05,
            l2: 1e-4,
        }
    }
}

impl SoftmaxRegression {
    pub fn from_json(bytes: &[u8]) -> Result<Self, OracleError> {
        serde_json::from_slice(bytes).map_err(|e| OracleError::Unavailable(e.to_string()))
    }

    /// Cold-start model fit on synthetic rounds labeled by [`heuristic_label`],
    /// `per_class` samples of each direction
    pub fn bootstrap(per_class: usize, seed: u64) -> Self {
        let samples = synthetic_samples(per_class, seed);
        let mut model = Self::default();

        for sample in &samples {
            model.scaler.update(&sample.0.as_array());
        }
        for _ in 0..5 {
            for (features, label) in &samples {
                model.step(features, *label, 1.0);
            }
        }

        info!(samples = samples.len(), "Bootstrapped difficulty model");
        model
    }

    fn probabilities(&self, z: &[f64; FEATURES]) -> [f64; CLASSES] {
        let mut logits = [0.0; CLASSES];
        for k in 0..CLASSES {
            logits[k] = self.bias[k]
                + self.weights[k]
                    .iter()
                    .zip(z.iter())
                    .map(|(w, x)| w * x)
                    .sum::<f64>();
        }

        let max = logits.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        let mut probs = [0.0; CLASSES];
        let mut total = 0.0;
        for k in 0..CLASSES {
            probs[k] = (logits[k] - max).exp();
            total += probs[k];
        }
        for p in probs.iter_mut() {
            *p /= total;
        }
        probs
    }

    fn step(&mut self, features: &Features, label: Direction, weight: f64) {
        let z = self.scaler.transform(&features.as_array());
        let probs = self.probabilities(&z);
        let rate = self.learning_rate * weight;

        for k in 0..CLASSES {
            let target = if k == label.label() { 1.0 } else { 0.0 };
            let grad = probs[k] - target;
            for j in 0..FEATURES {
                self.weights[k][j] -= rate * (grad * z[j] + self.l2 * self.weights[k][j]);
            }
            self.bias[k] -= rate * grad;
        }
    }
}

fn validate(features: &Features) -> Result<(), OracleError> {
    if !features.is_finite() {
        return Err(OracleError::InvalidFeatures(
            "features must be finite".to_string(),
        ));
    }
    if !(0.0..=1.0).contains(&features.accuracy) {
        return Err(OracleError::InvalidFeatures(
            "accuracy must be within [0, 1]".to_string(),
        ));
    }
    if features.avg_time_secs < 0.0 || features.hint_rate < 0.0 {
        return Err(OracleError::InvalidFeatures(
            "time and hints must not be negative".to_string(),
        ));
    }
    Ok(())
}

impl ModelOracle for SoftmaxRegression {
    fn predict(&self, features: &Features) -> Result<Prediction, OracleError> {
        validate(features)?;
        let probabilities = self.probabilities(&self.scaler.transform(&features.as_array()));

        let best = probabilities
            .iter()
            .enumerate()
            .fold(0, |best, (k, p)| if *p > probabilities[best] { k } else { best });
        let label = Direction::from_label(best)
            .ok_or_else(|| OracleError::Unavailable(format!("class {} out of range", best)))?;

        Ok(Prediction {
            label,
            probabilities,
        })
    }

    fn learn(
        &mut self,
        features: &Features,
        label: Direction,
        weight: f64,
    ) -> Result<(), OracleError> {
        validate(features)?;
        if !weight.is_finite() || weight <= 0.0 {
            return Err(OracleError::InvalidFeatures(format!(
                "sample weight must be positive, got {}",
                weight
            )));
        }

        self.scaler.update(&features.as_array());
        self.step(features, label, weight);
        debug!(label = %label, weight, "Model updated");
        Ok(())
    }

    fn export(&self) -> Result<Vec<u8>, OracleError> {
        serde_json::to_vec(self).map_err(|e| OracleError::Persistence(e.to_string()))
    }
}

/// Labels a round from its raw per-round hint count, or discards it as ambiguous
pub fn heuristic_label(accuracy: f64, avg_time_secs: f64, hints: u32) -> Option<Direction> {
    if accuracy >= 0.9 && avg_time_secs <= 5.0 && hints <= 1 {
        Some(Direction::Up)
    } else if (0.6..=0.75).contains(&accuracy)
        && (7.0..=10.0).contains(&avg_time_secs)
        && (2..=3).contains(&hints)
    {
        Some(Direction::Same)
    } else if accuracy <= 0.4 && avg_time_secs >= 13.0 && hints >= 4 {
        Some(Direction::Down)
    } else if accuracy < 0.4 && avg_time_secs < 6.0 && hints <= 1 {
        // fast and wrong: guessing
        Some(Direction::Same)
    } else {
        None
    }
}

/// Questions per synthetic round, used to turn hint counts into hint rates
const SYNTHETIC_ROUND_SIZE: f64 = 10.0;

fn synthetic_samples(per_class: usize, seed: u64) -> Vec<(Features, Direction)> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut buckets: [Vec<Features>; CLASSES] = [Vec::new(), Vec::new(), Vec::new()];
    let max_draws = per_class.saturating_mul(2000).max(1);

    for _ in 0..max_draws {
        if buckets.iter().all(|b| b.len() >= per_class) {
            break;
        }

        let accuracy: f64 = rng.random();
        let mean_time = 10.0 + (0.5 - accuracy) * 12.0;
        let noise: f64 = rng.sample(StandardNormal);
        let avg_time_secs = (mean_time + noise * 4.0).abs();
        let Ok(hint_counts) = Poisson::new((2.5 - 2.5 * accuracy).max(0.2)) else {
            continue;
        };
        let hints = (hint_counts.sample(&mut rng) as u32).min(10);

        let Some(label) = heuristic_label(accuracy, avg_time_secs, hints) else {
            continue;
        };
        let bucket = &mut buckets[label.label()];
        if bucket.len() < per_class {
            bucket.push(Features {
                accuracy,
                avg_time_secs,
                hint_rate: f64::from(hints) / SYNTHETIC_ROUND_SIZE,
            });
        }
    }

    // Interleave classes so no class dominates a stretch of updates
    let mut samples = Vec::new();
    let longest = buckets.iter().map(Vec::len).max().unwrap_or(0);
    for i in 0..longest {
        for direction in Direction::iter() {
            if let Some(features) = buckets[direction.label()].get(i) {
                samples.push((*features, direction));
            }
        }
    }
    samples
}
