//! Softmax classifier over standardized feature vectors.
//!
//! Classification is a pure function of `(features, model, config)` and has no
//! suspension point. Inputs far from every class centroid are reported as
//! [`UNKNOWN_LABEL`] instead of a confident guess.

use crate::catalog::{self, AlgorithmFamily, UNKNOWN_LABEL};
use crate::error::{TrainingError, TrainingResult};
use crate::features::FeatureVector;
use crate::registry::{Model, ModelId};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

const MIN_SCALE: f64 = 1e-12;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    /// Probabilities within this distance of the maximum are considered tied.
    pub tie_epsilon: f64,
    /// Upper bound (percent) on the confidence reported for `Unknown`.
    pub unknown_confidence_cap: f64,
    /// Multiplier applied to the model's out-of-distribution radius.
    pub ood_factor: f64,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self { tie_epsilon: 1e-6, unknown_confidence_cap: 50.0, ood_factor: 2.0 }
    }
}

/// Trained parameters. `weights[k]` holds one weight per feature followed by
/// the bias for label `k`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelParams {
    pub feature_mean: Vec<f64>,
    pub feature_scale: Vec<f64>,
    pub weights: Vec<Vec<f64>>,
    pub centroids: Vec<Vec<f64>>,
    pub ood_radius: f64,
}

impl ModelParams {
    #[must_use]
    pub fn standardize(&self, values: &[f64]) -> Vec<f64> {
        values
            .iter()
            .zip(self.feature_mean.iter().zip(&self.feature_scale))
            .map(|(x, (mean, scale))| (x - mean) / scale)
            .collect()
    }

    #[must_use]
    pub fn probabilities(&self, standardized: &[f64]) -> Vec<f64> {
        softmax(&logits(&self.weights, standardized))
    }

    /// Euclidean distance to the closest label centroid.
    #[must_use]
    pub fn nearest_centroid_distance(&self, standardized: &[f64]) -> f64 {
        self.centroids.iter().map(|c| distance(c, standardized)).fold(f64::INFINITY, f64::min)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelProbability {
    pub label: String,
    /// Percent, 0..=100.
    pub probability: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationResult {
    pub label: String,
    /// Percent, 0..=100.
    pub confidence: f64,
    pub distribution: Vec<LabelProbability>,
    pub model_id: ModelId,
    pub family: Option<AlgorithmFamily>,
    pub out_of_distribution: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matches_expected: Option<bool>,
}

impl ClassificationResult {
    #[must_use]
    pub fn probability_of(&self, label: &str) -> Option<f64> {
        self.distribution.iter().find(|e| e.label == label).map(|e| e.probability)
    }
}

/// Classify a feature vector against a model.
///
/// Ties within `config.tie_epsilon` of the maximum are resolved to the
/// lexically smallest label. An out-of-distribution input gets top label
/// `Unknown` and the model labels share the remaining mass.
pub fn classify(
    features: &FeatureVector,
    model: &Model,
    config: &ClassifierConfig,
    known_algorithm: Option<&str>,
) -> TrainingResult<ClassificationResult> {
    if features.version != model.feature_version || features.values.len() != model.params.feature_mean.len() {
        return Err(TrainingError::IncompatibleFeatures { expected: model.feature_version, found: features.version });
    }

    let z = model.params.standardize(&features.values);
    let probs = model.params.probabilities(&z);
    let distance = model.params.nearest_centroid_distance(&z);
    let out_of_distribution = distance > config.ood_factor * model.params.ood_radius;

    let (label, confidence, mut distribution) = if out_of_distribution {
        unknown_distribution(&model.labels, &probs, config.unknown_confidence_cap)
    } else {
        let top = tie_broken_argmax(&model.labels, &probs, config.tie_epsilon);
        let distribution = model
            .labels
            .iter()
            .zip(&probs)
            .map(|(label, p)| LabelProbability { label: label.clone(), probability: p * 100.0 })
            .collect();
        (model.labels[top].clone(), probs[top] * 100.0, distribution)
    };

    distribution.sort_by(|a, b| {
        b.probability.partial_cmp(&a.probability).unwrap_or(Ordering::Equal).then_with(|| a.label.cmp(&b.label))
    });
    // Entries ahead of the chosen label are within the tie epsilon of it.
    if let Some(pos) = distribution.iter().position(|e| e.label == label) {
        distribution[..=pos].rotate_right(1);
    }

    let expected_label = known_algorithm.map(catalog::canonical_label).filter(|l| !l.is_empty());
    let matches_expected = expected_label.as_ref().map(|expected| expected.eq_ignore_ascii_case(&label));

    Ok(ClassificationResult {
        family: catalog::family_of(&label),
        label,
        confidence,
        distribution,
        model_id: model.id.clone(),
        out_of_distribution,
        expected_label,
        matches_expected,
    })
}

fn tie_broken_argmax(labels: &[String], probs: &[f64], epsilon: f64) -> usize {
    let max = probs.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    probs
        .iter()
        .enumerate()
        .filter(|(_, p)| max - **p <= epsilon)
        .map(|(i, _)| i)
        .min_by(|a, b| labels[*a].cmp(&labels[*b]))
        .unwrap_or(0)
}

fn unknown_distribution(labels: &[String], probs: &[f64], cap: f64) -> (String, f64, Vec<LabelProbability>) {
    let k = labels.len().max(1) as f64;
    let unknown = (cap / 100.0 * 0.9).max(1.0 / (k + 1.0) + 1e-3).min(1.0);
    let rest = 1.0 - unknown;

    // Largest label share must stay below `unknown`: rest * q_max < unknown.
    let p_max = probs.iter().copied().fold(0.0, f64::max);
    let uniform = 1.0 / k;
    let lambda = if rest <= 0.0 || p_max - uniform <= f64::EPSILON {
        1.0
    } else {
        ((unknown / rest - uniform) / (p_max - uniform) * 0.5).clamp(0.0, 1.0)
    };

    let mut distribution = vec![LabelProbability { label: UNKNOWN_LABEL.to_string(), probability: unknown * 100.0 }];
    distribution.extend(labels.iter().zip(probs).map(|(label, p)| LabelProbability {
        label: label.clone(),
        probability: rest * lambda.mul_add(*p, (1.0 - lambda) * uniform) * 100.0,
    }));

    (UNKNOWN_LABEL.to_string(), unknown * 100.0, distribution)
}

fn logits(weights: &[Vec<f64>], x: &[f64]) -> Vec<f64> {
    weights
        .iter()
        .map(|w| {
            let bias = w.get(x.len()).copied().unwrap_or(0.0);
            w.iter().zip(x).fold(bias, |acc, (wi, xi)| wi.mul_add(*xi, acc))
        })
        .collect()
}

fn softmax(logits: &[f64]) -> Vec<f64> {
    let max = logits.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let exps: Vec<f64> = logits.iter().map(|l| (l - max).exp()).collect();
    let sum: f64 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

fn distance(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum::<f64>().sqrt()
}

/// Per-feature mean and population standard deviation.
///
/// Constant features get scale 1 so they never divide by zero.
#[must_use]
pub fn fit_standardization(rows: &[&[f64]], width: usize) -> (Vec<f64>, Vec<f64>) {
    let n = rows.len().max(1) as f64;
    let mut mean = vec![0.0; width];
    for row in rows {
        for (m, x) in mean.iter_mut().zip(row.iter()) {
            *m += x / n;
        }
    }

    let mut scale = vec![0.0; width];
    for row in rows {
        for ((s, x), m) in scale.iter_mut().zip(row.iter()).zip(&mean) {
            *s += (x - m) * (x - m) / n;
        }
    }
    for s in &mut scale {
        *s = s.sqrt();
        if *s < MIN_SCALE {
            *s = 1.0;
        }
    }
    (mean, scale)
}

/// Mean standardized vector per label.
#[must_use]
pub fn label_centroids(inputs: &[Vec<f64>], targets: &[usize], label_count: usize) -> Vec<Vec<f64>> {
    let width = inputs.first().map_or(0, Vec::len);
    let mut sums = vec![vec![0.0; width]; label_count];
    let mut counts = vec![0usize; label_count];
    for (x, &t) in inputs.iter().zip(targets) {
        counts[t] += 1;
        for (s, v) in sums[t].iter_mut().zip(x) {
            *s += v;
        }
    }
    for (sum, count) in sums.iter_mut().zip(counts) {
        if count > 0 {
            sum.iter_mut().for_each(|s| *s /= count as f64);
        }
    }
    sums
}

/// Training-manifold radius: the larger of the widest class spread and half
/// the mean distance between centroids.
#[must_use]
pub fn manifold_radius(inputs: &[Vec<f64>], targets: &[usize], centroids: &[Vec<f64>]) -> f64 {
    let spread = inputs.iter().zip(targets).map(|(x, &t)| distance(x, &centroids[t])).fold(0.0, f64::max);

    let mut pair_sum = 0.0;
    let mut pairs = 0usize;
    for (i, a) in centroids.iter().enumerate() {
        for b in &centroids[i + 1..] {
            pair_sum += distance(a, b);
            pairs += 1;
        }
    }
    let separation = if pairs == 0 { 0.0 } else { pair_sum / pairs as f64 / 2.0 };

    spread.max(separation)
}

/// Full-batch gradient descent on multinomial cross-entropy with L2.
#[derive(Debug)]
pub struct SoftmaxFitter {
    inputs: Vec<Vec<f64>>,
    targets: Vec<usize>,
    weights: Vec<Vec<f64>>,
    learning_rate: f64,
    l2: f64,
}

impl SoftmaxFitter {
    /// `inputs` must already be standardized. `initial` warm-starts the
    /// weights and must have the same shape as the zero initialisation.
    #[must_use]
    pub fn new(
        inputs: Vec<Vec<f64>>,
        targets: Vec<usize>,
        label_count: usize,
        learning_rate: f64,
        l2: f64,
        initial: Option<Vec<Vec<f64>>>,
    ) -> Self {
        let width = inputs.first().map_or(0, Vec::len) + 1;
        let weights = initial
            .filter(|w| w.len() == label_count && w.iter().all(|row| row.len() == width))
            .unwrap_or_else(|| vec![vec![0.0; width]; label_count]);
        Self { inputs, targets, weights, learning_rate, l2 }
    }

    /// One epoch. Returns the mean cross-entropy before the update.
    pub fn step(&mut self) -> f64 {
        let n = self.inputs.len().max(1) as f64;
        let width = self.weights.first().map_or(0, Vec::len);
        let mut grad = vec![vec![0.0; width]; self.weights.len()];
        let mut loss = 0.0;

        for (x, &target) in self.inputs.iter().zip(&self.targets) {
            let probs = softmax(&logits(&self.weights, x));
            loss -= probs[target].max(f64::MIN_POSITIVE).ln() / n;
            for (k, (g, p)) in grad.iter_mut().zip(&probs).enumerate() {
                let err = p - if k == target { 1.0 } else { 0.0 };
                for (gi, xi) in g.iter_mut().zip(x) {
                    *gi += err * xi / n;
                }
                if let Some(bias) = g.last_mut() {
                    *bias += err / n;
                }
            }
        }

        let bias_index = width.saturating_sub(1);
        for (w, g) in self.weights.iter_mut().zip(&grad) {
            for (i, (wi, gi)) in w.iter_mut().zip(g).enumerate() {
                let penalty = if i == bias_index { 0.0 } else { self.l2 * *wi };
                *wi -= self.learning_rate * (gi + penalty);
            }
        }

        loss
    }

    #[must_use]
    pub fn weights(&self) -> &[Vec<f64>] {
        &self.weights
    }

    #[must_use]
    pub fn into_weights(self) -> Vec<Vec<f64>> {
        self.weights
    }
}

/// Fraction of rows whose argmax prediction equals the target.
#[must_use]
pub fn accuracy(params: &ModelParams, labels: &[String], rows: &[(&FeatureVector, usize)], config: &ClassifierConfig) -> f64 {
    if rows.is_empty() {
        return 0.0;
    }
    let correct = rows
        .iter()
        .filter(|(fv, target)| {
            let probs = params.probabilities(&params.standardize(&fv.values));
            tie_broken_argmax(labels, &probs, config.tie_epsilon) == *target
        })
        .count();
    correct as f64 / rows.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::DatasetId;
    use crate::features::{FEATURE_COUNT, FEATURE_VERSION};
    use crate::registry::{Provenance, ValidationMethod, ValidationReport};
    use chrono::Utc;

    fn vector(fill: f64) -> FeatureVector {
        FeatureVector { version: FEATURE_VERSION, values: vec![fill; FEATURE_COUNT] }
    }

    fn model_with(labels: &[&str], weights: Vec<Vec<f64>>, centroids: Vec<Vec<f64>>, radius: f64) -> Model {
        let params = ModelParams {
            feature_mean: vec![0.0; FEATURE_COUNT],
            feature_scale: vec![1.0; FEATURE_COUNT],
            weights,
            centroids,
            ood_radius: radius,
        };
        Model::new(
            labels.iter().map(|s| (*s).to_string()).collect(),
            params,
            Provenance { dataset_fingerprint: DatasetId("fp".to_string()), base_model: None, sample_count: 2 },
            ValidationReport { accuracy: 1.0, method: ValidationMethod::HoldOut, evaluated: 2, min_accuracy: 0.5 },
        )
        .unwrap()
    }

    fn biased_weights(biases: &[f64]) -> Vec<Vec<f64>> {
        biases
            .iter()
            .map(|b| {
                let mut w = vec![0.0; FEATURE_COUNT + 1];
                w[FEATURE_COUNT] = *b;
                w
            })
            .collect()
    }

    fn total(result: &ClassificationResult) -> f64 {
        result.distribution.iter().map(|e| e.probability).sum()
    }

    #[test]
    fn test_distribution_sums_to_100_and_top_is_max() {
        let model = model_with(&["AES", "RSA", "DES"], biased_weights(&[0.3, 1.2, -0.4]), vec![vec![0.0; FEATURE_COUNT]], 1.0);
        let result = classify(&vector(0.1), &model, &ClassifierConfig::default(), None).unwrap();

        assert!((total(&result) - 100.0).abs() < 1e-9);
        assert_eq!(result.label, "RSA");
        assert_eq!(result.distribution[0].label, "RSA");
        assert!((result.confidence - result.distribution[0].probability).abs() < 1e-12);
        assert_eq!(result.family, Some(AlgorithmFamily::Asymmetric));
        assert!(!result.out_of_distribution);
    }

    #[test]
    fn test_ties_go_to_lexically_smallest_label() {
        let model = model_with(&["RSA", "AES"], biased_weights(&[0.0, 0.0]), vec![vec![0.0; FEATURE_COUNT]], 1.0);
        let result = classify(&vector(0.0), &model, &ClassifierConfig::default(), None).unwrap();
        assert_eq!(result.label, "AES");
        assert!((result.confidence - 50.0).abs() < 1e-9);
        assert_eq!(result.distribution[0].label, "AES");
    }

    #[test]
    fn test_near_tie_puts_chosen_label_first() {
        let model = model_with(&["RSA", "AES"], biased_weights(&[0.01, 0.0]), vec![vec![0.0; FEATURE_COUNT]], 1.0);
        let config = ClassifierConfig { tie_epsilon: 0.01, ..ClassifierConfig::default() };
        let result = classify(&vector(0.0), &model, &config, None).unwrap();

        assert_eq!(result.label, "AES");
        assert_eq!(result.distribution[0].label, "AES");
        assert!((result.confidence - result.distribution[0].probability).abs() < 1e-12);
        assert!(result.distribution[1].probability > result.confidence);
        assert!((total(&result) - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_far_input_is_unknown_below_cap() {
        let model = model_with(&["AES", "RSA"], biased_weights(&[5.0, 0.0]), vec![vec![0.0; FEATURE_COUNT]], 0.1);
        let config = ClassifierConfig::default();
        let result = classify(&vector(10.0), &model, &config, None).unwrap();

        assert!(result.out_of_distribution);
        assert_eq!(result.label, UNKNOWN_LABEL);
        assert!(result.confidence < config.unknown_confidence_cap);
        assert_eq!(result.distribution[0].label, UNKNOWN_LABEL);
        assert!(result.distribution[1].probability < result.confidence);
        assert!((total(&result) - 100.0).abs() < 1e-9);
        assert_eq!(result.family, None);
    }

    #[test]
    fn test_known_algorithm_hint_is_compared() {
        let model = model_with(&["AES", "RSA"], biased_weights(&[2.0, 0.0]), vec![vec![0.0; FEATURE_COUNT]], 1.0);
        let result = classify(&vector(0.0), &model, &ClassifierConfig::default(), Some("aes")).unwrap();
        assert_eq!(result.expected_label.as_deref(), Some("AES"));
        assert_eq!(result.matches_expected, Some(true));
    }

    #[test]
    fn test_rejects_mismatched_layout() {
        let model = model_with(&["AES", "RSA"], biased_weights(&[0.0, 0.0]), vec![vec![0.0; FEATURE_COUNT]], 1.0);
        let stale = FeatureVector { version: 0, values: vec![0.0; 4] };
        assert!(matches!(
            classify(&stale, &model, &ClassifierConfig::default(), None),
            Err(TrainingError::IncompatibleFeatures { .. })
        ));
    }

    #[test]
    fn test_fitter_separates_two_clusters() {
        let inputs = vec![vec![-1.0, 0.0], vec![-1.2, 0.1], vec![1.0, 0.0], vec![1.1, -0.1]];
        let targets = vec![0, 0, 1, 1];
        let mut fitter = SoftmaxFitter::new(inputs.clone(), targets, 2, 0.5, 1e-3, None);

        let first = fitter.step();
        let mut last = first;
        for _ in 0..100 {
            last = fitter.step();
        }
        assert!(last < first);

        let weights = fitter.into_weights();
        let p = softmax(&logits(&weights, &inputs[3]));
        assert!(p[1] > 0.9);
    }

    #[test]
    fn test_constant_features_get_unit_scale() {
        let a = [1.0, 2.0];
        let b = [1.0, 4.0];
        let (mean, scale) = fit_standardization(&[&a, &b], 2);
        assert_eq!(mean, vec![1.0, 3.0]);
        assert_eq!(scale, vec![1.0, 1.0]);
    }

    #[test]
    fn test_manifold_radius_covers_training_points() {
        let inputs = vec![vec![0.0, 0.0], vec![2.0, 0.0], vec![10.0, 0.0]];
        let targets = vec![0, 0, 1];
        let centroids = label_centroids(&inputs, &targets, 2);
        assert_eq!(centroids[0], vec![1.0, 0.0]);
        let radius = manifold_radius(&inputs, &targets, &centroids);
        assert!((radius - 4.5).abs() < 1e-12);
    }
}
