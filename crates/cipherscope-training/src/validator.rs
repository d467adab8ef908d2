//! Dataset validation.
//!
//! Checks run in a fixed order (size, format, content) and the first failure
//! wins. Nothing here allocates beyond what the parsers need and nothing is
//! retained, so callers can reject uploads before a job exists.

use crate::dataset::DatasetFormat;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Reason a payload was refused by [`validate`].
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Rejection {
    #[error("file size {size} bytes exceeds the {limit} byte limit")]
    FileTooLarge { size: u64, limit: u64 },

    #[error("unsupported format '{declared}' (supported: csv, json, txt)")]
    UnsupportedFormat { declared: String },

    #[error("content is not well-formed {format}: {detail}")]
    MalformedContent { format: DatasetFormat, detail: String },
}

impl Rejection {
    /// Stable reason code for presentation layers.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::FileTooLarge { .. } => "file_too_large",
            Self::UnsupportedFormat { .. } => "unsupported_format",
            Self::MalformedContent { .. } => "malformed_content",
        }
    }
}

/// Validate `bytes` against a declared format and a size limit.
///
/// Returns the parsed format on success.
pub fn validate(bytes: &[u8], declared_format: &str, size_limit: u64) -> Result<DatasetFormat, Rejection> {
    let size = bytes.len() as u64;
    if size > size_limit {
        return Err(Rejection::FileTooLarge { size, limit: size_limit });
    }

    let format = DatasetFormat::parse(declared_format)
        .ok_or_else(|| Rejection::UnsupportedFormat { declared: declared_format.trim().to_string() })?;

    check_content(bytes, format)
        .map_err(|detail| Rejection::MalformedContent { format, detail })?;

    Ok(format)
}

fn check_content(bytes: &[u8], format: DatasetFormat) -> Result<(), String> {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Err("payload is empty".to_string());
    }

    match format {
        DatasetFormat::Csv => check_csv(bytes),
        DatasetFormat::Json => {
            let value = serde_json::from_slice::<serde_json::Value>(bytes).map_err(|e| e.to_string())?;
            if has_bare_hex_prefix(&value) {
                return Err(EMPTY_HEX_FIELD.to_string());
            }
            Ok(())
        }
        DatasetFormat::Txt => {
            let text = std::str::from_utf8(bytes).map_err(|e| format!("invalid UTF-8: {e}"))?;
            let compact: Vec<u8> = text.bytes().filter(|b| !b.is_ascii_whitespace()).collect();
            if is_bare_hex_prefix(&compact) {
                return Err(EMPTY_HEX_FIELD.to_string());
            }
            Ok(())
        }
    }
}

const EMPTY_HEX_FIELD: &str = "hex field has a 0x prefix but no digits";

fn is_bare_hex_prefix(field: &[u8]) -> bool {
    field == b"0x"
}

fn has_bare_hex_prefix(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::String(s) => is_bare_hex_prefix(s.trim().as_bytes()),
        serde_json::Value::Array(items) => items.iter().any(has_bare_hex_prefix),
        serde_json::Value::Object(map) => map.values().any(has_bare_hex_prefix),
        _ => false,
    }
}

fn check_csv(bytes: &[u8]) -> Result<(), String> {
    let mut reader = csv::ReaderBuilder::new().has_headers(false).flexible(false).from_reader(bytes);

    let mut records = 0usize;
    for record in reader.byte_records() {
        let record = record.map_err(|e| e.to_string())?;
        records += 1;
        if record.iter().any(|field| is_bare_hex_prefix(field.trim_ascii())) {
            return Err(format!("record {records}: {EMPTY_HEX_FIELD}"));
        }
    }

    if records == 0 {
        return Err("no records".to_string());
    }
    Ok(())
}
