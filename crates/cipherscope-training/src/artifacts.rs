use crate::classifier::ModelParams;
use crate::error::TrainingResult;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Integrity record for a persisted model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactChecksum {
    pub algorithm: String,
    pub digest: String,
}

impl ArtifactChecksum {
    #[must_use]
    pub fn sha256(digest: String) -> Self {
        Self { algorithm: "sha256".to_string(), digest }
    }
}

/// Checksum over the label set and the serialized parameters.
pub fn checksum_model(labels: &[String], params: &ModelParams) -> TrainingResult<ArtifactChecksum> {
    let mut hasher = Sha256::new();
    for label in labels {
        hasher.update(label.as_bytes());
        hasher.update([0u8]);
    }
    hasher.update(serde_json::to_vec(params)?);
    Ok(ArtifactChecksum::sha256(hex::encode(hasher.finalize())))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(bias: f64) -> ModelParams {
        ModelParams {
            feature_mean: vec![0.0],
            feature_scale: vec![1.0],
            weights: vec![vec![0.0, bias]],
            centroids: vec![vec![0.0]],
            ood_radius: 1.0,
        }
    }

    #[test]
    fn test_checksum_changes_with_params() {
        let labels = vec!["AES".to_string()];
        let a = checksum_model(&labels, &params(0.1)).unwrap();
        let b = checksum_model(&labels, &params(0.2)).unwrap();
        assert_ne!(a, b);
        assert_eq!(a, checksum_model(&labels, &params(0.1)).unwrap());
    }

    #[test]
    fn test_checksum_survives_json_roundtrip() {
        let p = params(0.1 + 0.2);
        let restored: ModelParams = serde_json::from_slice(&serde_json::to_vec(&p).unwrap()).unwrap();
        let labels = vec!["AES".to_string()];
        assert_eq!(checksum_model(&labels, &p).unwrap(), checksum_model(&labels, &restored).unwrap());
    }
}
