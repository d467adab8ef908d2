//! Classify command implementation.

use crate::commands::progress::{ensure_completed, follow, print_failure};
use anyhow::{Context, Result};
use cipherscope_core::training::ClassificationResult;
use cipherscope_core::{CipherScope, JobResult};
use colored::Colorize;
use std::path::{Path, PathBuf};

const SHOWN_LABELS: usize = 5;

pub async fn execute(
    service: &CipherScope,
    owner: Option<&str>,
    file: PathBuf,
    format: Option<String>,
    known_algorithm: Option<String>,
    json_output: bool,
) -> Result<()> {
    let format = format.or_else(|| extension_of(&file)).unwrap_or_else(|| "txt".to_string());
    let bytes = std::fs::read(&file).with_context(|| format!("Failed to read {}", file.display()))?;

    let id = service.submit_classification_as(owner, bytes, &format, known_algorithm.as_deref())?;
    let status = follow(service, &id, !json_output).await?;

    if json_output {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return ensure_completed(&status);
    }

    match &status.result {
        Some(JobResult::Classification(result)) => print_result(result),
        _ => print_failure(&status),
    }
    ensure_completed(&status)
}

fn extension_of(path: &Path) -> Option<String> {
    path.extension().and_then(|e| e.to_str()).map(str::to_ascii_lowercase)
}

fn print_result(result: &ClassificationResult) {
    println!();
    let label = if result.out_of_distribution { result.label.yellow() } else { result.label.green() };
    println!("  {} {} ({:.1}%)", "Algorithm:".bold(), label.bold(), result.confidence);
    if let Some(family) = result.family {
        println!("  {} {}", "Family:".bold(), format!("{family:?}").to_lowercase().cyan());
    }
    if result.out_of_distribution {
        println!("  {}", "Sample is far from everything the model was trained on.".yellow());
    }
    if let (Some(expected), Some(matches)) = (&result.expected_label, result.matches_expected) {
        let verdict = if matches { "matches".green() } else { "differs".red() };
        println!("  {} {} ({})", "Expected:".bold(), expected, verdict);
    }

    println!();
    for entry in result.distribution.iter().take(SHOWN_LABELS) {
        let width = (entry.probability / 5.0).round() as usize;
        println!("  {:<12} {:>6.2}% {}", entry.label, entry.probability, "█".repeat(width).cyan());
    }
    println!();
    println!("  {}", format!("model {}", result.model_id).dimmed());
    println!();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_from_extension() {
        assert_eq!(extension_of(Path::new("capture.CSV")).as_deref(), Some("csv"));
        assert_eq!(extension_of(Path::new("capture")), None);
    }
}
