use crate::catalog;
use crate::validator::{self, Rejection};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::Arc;

/// Stable identifier for a dataset (content hash).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DatasetId(pub String);

impl fmt::Display for DatasetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatasetFormat {
    Csv,
    Json,
    Txt,
}

impl DatasetFormat {
    /// Parse a declared format or file extension (`"csv"`, `".JSON"`, ...).
    #[must_use]
    pub fn parse(declared: &str) -> Option<Self> {
        let normalized = declared.trim().trim_start_matches('.').to_ascii_lowercase();
        match normalized.as_str() {
            "csv" => Some(Self::Csv),
            "json" => Some(Self::Json),
            "txt" => Some(Self::Txt),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Csv => "csv",
            Self::Json => "json",
            Self::Txt => "txt",
        }
    }
}

impl fmt::Display for DatasetFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An immutable, validated upload.
///
/// Only constructible through [`Dataset::validated`], so holding one means the
/// size, format and content checks already passed.
#[derive(Debug, Clone)]
pub struct Dataset {
    id: DatasetId,
    format: DatasetFormat,
    bytes: Arc<[u8]>,
    label: Option<String>,
}

impl Dataset {
    pub fn validated(
        bytes: impl Into<Arc<[u8]>>,
        declared_format: &str,
        size_limit: u64,
        label: Option<&str>,
    ) -> Result<Self, Rejection> {
        let bytes: Arc<[u8]> = bytes.into();
        let format = validator::validate(&bytes, declared_format, size_limit)?;
        let id = compute_dataset_id(format, &bytes);
        Ok(Self { id, format, bytes, label: label.map(catalog::canonical_label) })
    }

    #[must_use]
    pub fn id(&self) -> &DatasetId {
        &self.id
    }

    #[must_use]
    pub fn format(&self) -> DatasetFormat {
        self.format
    }

    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    #[must_use]
    pub fn size(&self) -> u64 {
        self.bytes.len() as u64
    }

    #[must_use]
    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    /// Decode the sample byte stream the features are computed over.
    #[must_use]
    pub fn payload(&self) -> Vec<u8> {
        decode_payload(self.format, &self.bytes)
    }
}

/// A dataset paired with the algorithm label it was captured from.
#[derive(Debug, Clone)]
pub struct LabeledDataset {
    pub dataset: Dataset,
    pub label: String,
}

impl LabeledDataset {
    #[must_use]
    pub fn new(dataset: Dataset, label: &str) -> Self {
        Self { dataset, label: catalog::canonical_label(label) }
    }
}

#[must_use]
pub fn compute_dataset_id(format: DatasetFormat, bytes: &[u8]) -> DatasetId {
    let mut hasher = Sha256::new();
    hasher.update(format.as_str().as_bytes());
    hasher.update([0u8]);
    hasher.update(bytes);
    DatasetId(hex::encode(hasher.finalize()))
}

/// Combined fingerprint of several datasets, order-independent.
#[must_use]
pub fn combined_fingerprint<'a>(ids: impl IntoIterator<Item = &'a DatasetId>) -> DatasetId {
    let mut sorted: Vec<&DatasetId> = ids.into_iter().collect();
    sorted.sort();

    let mut hasher = Sha256::new();
    for id in sorted {
        hasher.update(id.0.as_bytes());
        hasher.update(b"\n");
    }
    DatasetId(hex::encode(hasher.finalize()))
}

/// Turn an upload into the raw sample bytes.
///
/// Hex-looking text is decoded, anything else is taken verbatim. The result is
/// a pure function of `(format, bytes)`.
#[must_use]
pub fn decode_payload(format: DatasetFormat, bytes: &[u8]) -> Vec<u8> {
    match format {
        DatasetFormat::Txt => {
            let compact: Vec<u8> = bytes.iter().copied().filter(|b| !b.is_ascii_whitespace()).collect();
            decode_field(&compact)
        }
        DatasetFormat::Csv => {
            let mut out = Vec::with_capacity(bytes.len());
            let mut reader = csv::ReaderBuilder::new().has_headers(false).flexible(true).from_reader(bytes);
            for record in reader.byte_records().flatten() {
                for field in &record {
                    out.extend(decode_field(field.trim_ascii()));
                }
            }
            out
        }
        DatasetFormat::Json => {
            let mut out = Vec::with_capacity(bytes.len() / 2);
            if let Ok(value) = serde_json::from_slice::<serde_json::Value>(bytes) {
                flatten_json(&value, &mut out);
            }
            out
        }
    }
}

fn decode_field(field: &[u8]) -> Vec<u8> {
    let digits = field.strip_prefix(b"0x").unwrap_or(field);
    if !digits.is_empty() && digits.len() % 2 == 0 && digits.iter().all(u8::is_ascii_hexdigit) {
        if let Ok(decoded) = hex::decode(digits) {
            return decoded;
        }
    }
    field.to_vec()
}

fn flatten_json(value: &serde_json::Value, out: &mut Vec<u8>) {
    match value {
        serde_json::Value::String(s) => out.extend(decode_field(s.trim().as_bytes())),
        serde_json::Value::Number(n) => {
            if let Some(byte) = n.as_u64().and_then(|v| u8::try_from(v).ok()) {
                out.push(byte);
            }
        }
        serde_json::Value::Array(items) => items.iter().for_each(|v| flatten_json(v, out)),
        serde_json::Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            entries.into_iter().for_each(|(_, v)| flatten_json(v, out));
        }
        serde_json::Value::Bool(_) | serde_json::Value::Null => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dataset_id_stable_for_same_content() {
        let a = compute_dataset_id(DatasetFormat::Csv, b"00,ff\n");
        let b = compute_dataset_id(DatasetFormat::Csv, b"00,ff\n");
        assert_eq!(a, b);
        assert_ne!(a, compute_dataset_id(DatasetFormat::Txt, b"00,ff\n"));
    }

    #[test]
    fn test_validated_dataset_keeps_canonical_label() {
        let ds = Dataset::validated(b"00112233".to_vec(), "txt", 1024, Some("aes")).unwrap();
        assert_eq!(ds.label(), Some("AES"));
        assert_eq!(ds.size(), 8);
        assert_eq!(ds.format(), DatasetFormat::Txt);
    }

    #[test]
    fn test_txt_hex_payload_is_decoded() {
        let bytes = decode_payload(DatasetFormat::Txt, b"de ad\nbe ef\n");
        assert_eq!(bytes, vec![0xde, 0xad, 0xbe, 0xef]);
    }

    #[test]
    fn test_txt_plain_payload_is_verbatim() {
        let bytes = decode_payload(DatasetFormat::Txt, b"hello");
        assert_eq!(bytes, b"hello".to_vec());
    }

    #[test]
    fn test_csv_fields_decoded_in_order() {
        let bytes = decode_payload(DatasetFormat::Csv, b"0x0102, zz\n0304,ab\n");
        assert_eq!(bytes, vec![0x01, 0x02, b'z', b'z', 0x03, 0x04, 0xab]);
    }

    #[test]
    fn test_bare_hex_prefix_is_not_decoded_to_nothing() {
        assert_eq!(decode_payload(DatasetFormat::Txt, b"0x"), b"0x".to_vec());
        let err = Dataset::validated(b"ab,0x\n".to_vec(), "csv", 1024, Some("AES")).unwrap_err();
        assert_eq!(err.code(), "malformed_content");
    }

    #[test]
    fn test_json_payload_flattens_values() {
        let bytes = decode_payload(DatasetFormat::Json, br#"{"b": [1, 2, 300], "a": "ff"}"#);
        assert_eq!(bytes, vec![0xff, 1, 2]);
    }

    #[test]
    fn test_combined_fingerprint_ignores_order() {
        let a = DatasetId("a".to_string());
        let b = DatasetId("b".to_string());
        assert_eq!(combined_fingerprint([&a, &b]), combined_fingerprint([&b, &a]));
    }
}
