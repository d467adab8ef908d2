//! Training command implementation.

use crate::commands::progress::{ensure_completed, follow, print_failure};
use crate::commands::types::SampleArg;
use anyhow::{Context, Result};
use cipherscope_core::training::{ModelId, TrainingRequest, TrainingSample};
use cipherscope_core::{CipherScope, JobResult};
use colored::Colorize;

pub async fn execute(
    service: &CipherScope,
    owner: Option<&str>,
    samples: Vec<SampleArg>,
    base_model: Option<String>,
    activate: bool,
    json_output: bool,
) -> Result<()> {
    let mut loaded = Vec::with_capacity(samples.len());
    for sample in samples {
        let bytes = std::fs::read(&sample.path).with_context(|| format!("Failed to read {}", sample.path.display()))?;
        let format = sample
            .path
            .extension()
            .and_then(|e| e.to_str())
            .map_or_else(|| "txt".to_string(), str::to_ascii_lowercase);
        loaded.push(TrainingSample::new(sample.label, format, bytes));
    }

    let mut request = TrainingRequest::new(loaded);
    if let Some(base) = base_model {
        request = request.with_base_model(ModelId::from(base.as_str()));
    }

    let id = service.submit_training_as(owner, request)?;
    let status = follow(service, &id, !json_output).await?;

    let summary = match &status.result {
        Some(JobResult::Training(summary)) => Some(summary),
        _ => None,
    };
    if activate {
        if let Some(summary) = summary {
            service.activate_model(&summary.model_id)?;
        }
    }

    if json_output {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return ensure_completed(&status);
    }

    match summary {
        Some(summary) => {
            println!();
            println!("{}", "Training complete".bold().green());
            println!("  Model:    {} (v{})", summary.model_id.to_string().cyan(), summary.version);
            println!("  Labels:   {}", summary.labels.join(", "));
            println!(
                "  Accuracy: {:.1}% ({:?}, {} held out)",
                summary.accuracy * 100.0,
                summary.method,
                summary.holdout_samples
            );
            if activate {
                println!("  {}", "Activated".green());
            } else {
                println!();
                println!("  {}", format!("Use: cipherscope models activate {}", summary.model_id).dimmed());
            }
            println!();
        }
        None => print_failure(&status),
    }
    ensure_completed(&status)
}
