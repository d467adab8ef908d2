//! Built-in algorithm names.
//!
//! Custom labels are allowed; the catalogue only fixes spelling for the
//! algorithms people commonly upload and attaches a family to them.

use serde::{Deserialize, Serialize};

/// Label reported for inputs outside the training manifold. Never trainable.
pub const UNKNOWN_LABEL: &str = "Unknown";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlgorithmFamily {
    Symmetric,
    Asymmetric,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KnownAlgorithm {
    pub name: &'static str,
    pub aliases: &'static [&'static str],
    pub family: AlgorithmFamily,
}

pub const KNOWN_ALGORITHMS: &[KnownAlgorithm] = &[
    KnownAlgorithm { name: "AES", aliases: &["aes-128", "aes-256", "rijndael"], family: AlgorithmFamily::Symmetric },
    KnownAlgorithm { name: "DES", aliases: &[], family: AlgorithmFamily::Symmetric },
    KnownAlgorithm { name: "3DES", aliases: &["tdes", "triple-des", "des3"], family: AlgorithmFamily::Symmetric },
    KnownAlgorithm { name: "Blowfish", aliases: &[], family: AlgorithmFamily::Symmetric },
    KnownAlgorithm { name: "KASUMI", aliases: &[], family: AlgorithmFamily::Symmetric },
    KnownAlgorithm { name: "PRESENT", aliases: &[], family: AlgorithmFamily::Symmetric },
    KnownAlgorithm { name: "RSA", aliases: &[], family: AlgorithmFamily::Asymmetric },
    KnownAlgorithm { name: "ElGamal", aliases: &["el-gamal"], family: AlgorithmFamily::Asymmetric },
];

#[must_use]
pub fn lookup(label: &str) -> Option<&'static KnownAlgorithm> {
    let label = label.trim();
    KNOWN_ALGORITHMS.iter().find(|alg| {
        alg.name.eq_ignore_ascii_case(label) || alg.aliases.iter().any(|a| a.eq_ignore_ascii_case(label))
    })
}

/// Catalogue spelling for known algorithms, the trimmed input otherwise.
#[must_use]
pub fn canonical_label(label: &str) -> String {
    lookup(label).map_or_else(|| label.trim().to_string(), |alg| alg.name.to_string())
}

#[must_use]
pub fn family_of(label: &str) -> Option<AlgorithmFamily> {
    lookup(label).map(|alg| alg.family)
}

#[must_use]
pub fn is_reserved(label: &str) -> bool {
    label.trim().eq_ignore_ascii_case(UNKNOWN_LABEL)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_label_uses_catalogue_spelling() {
        assert_eq!(canonical_label("aes"), "AES");
        assert_eq!(canonical_label(" elgamal "), "ElGamal");
        assert_eq!(canonical_label("triple-des"), "3DES");
    }

    #[test]
    fn test_custom_label_is_trimmed_only() {
        assert_eq!(canonical_label("  Serpent "), "Serpent");
        assert_eq!(family_of("Serpent"), None);
    }

    #[test]
    fn test_families() {
        assert_eq!(family_of("RSA"), Some(AlgorithmFamily::Asymmetric));
        assert_eq!(family_of("blowfish"), Some(AlgorithmFamily::Symmetric));
    }

    #[test]
    fn test_unknown_is_reserved() {
        assert!(is_reserved("unknown"));
        assert!(!is_reserved("AES"));
    }
}
