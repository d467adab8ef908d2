//! Models command implementation.

use super::types::ModelsCommand;
use anyhow::{Context, Result};
use cipherscope_core::training::{Model, ModelId};
use cipherscope_core::CipherScope;
use colored::Colorize;
use serde_json::json;

/// Execute the models command.
pub fn execute(service: &CipherScope, command: ModelsCommand) -> Result<()> {
    match command {
        ModelsCommand::List { json } => list_models(service, json),
        ModelsCommand::Show { model_id, json } => show_model(service, &ModelId::from(model_id.as_str()), json),
        ModelsCommand::Activate { model_id } => {
            let id = ModelId::from(model_id.as_str());
            service.activate_model(&id)?;
            println!("{} Active model is now {}", "✓".green(), id.to_string().cyan());
            Ok(())
        }
        ModelsCommand::Deactivate => {
            service.deactivate_model()?;
            println!("{} No model is active", "✓".green());
            Ok(())
        }
    }
}

fn summary_json(model: &Model, active: bool) -> serde_json::Value {
    json!({
        "id": model.id,
        "version": model.version,
        "labels": model.labels,
        "accuracy": model.validation.accuracy,
        "validation_method": model.validation.method,
        "activatable": model.is_activatable(),
        "active": active,
        "created_at": model.created_at,
    })
}

fn list_models(service: &CipherScope, json_output: bool) -> Result<()> {
    let models = service.list_models();
    let active = service.active_model().map(|m| m.id.clone());

    if json_output {
        let out: Vec<_> = models.iter().map(|m| summary_json(m, active.as_ref() == Some(&m.id))).collect();
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    println!("{}", format!("Models ({})", models.len()).bold().cyan());
    println!();

    if models.is_empty() {
        println!("  {}", "No models registered yet.".dimmed());
        println!("  {}", "Tip: cipherscope train --sample AES=aes.csv --sample RSA=rsa.txt".dimmed());
        println!();
        return Ok(());
    }

    println!("  {:<2} {:<38} {:<4} {:<9} {}", "", "ID", "Ver", "Accuracy", "Labels");
    println!("  {}", "─".repeat(80));
    for model in &models {
        let marker = if active.as_ref() == Some(&model.id) { "*".green().bold() } else { " ".normal() };
        let accuracy = format!("{:.1}%", model.validation.accuracy * 100.0);
        let accuracy = if model.is_activatable() { accuracy.green() } else { accuracy.red() };
        println!(
            "  {:<2} {:<38} {:<4} {:<9} {}",
            marker,
            model.id.to_string(),
            model.version,
            accuracy,
            model.labels.join(", ").dimmed()
        );
    }
    println!();
    Ok(())
}

fn show_model(service: &CipherScope, id: &ModelId, json_output: bool) -> Result<()> {
    let model = service.registry().get(id).with_context(|| format!("Model not found: {id}"))?;
    let active = service.active_model().is_some_and(|m| m.id == model.id);

    if json_output {
        let mut value = summary_json(&model, active);
        value["provenance"] = json!(model.provenance);
        value["feature_version"] = json!(model.feature_version);
        value["checksum"] = json!(model.checksum);
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    println!();
    println!("{} {}", "Model".bold(), model.id.to_string().cyan());
    println!("  Version:    {}", model.version);
    println!("  Labels:     {}", model.labels.join(", "));
    println!(
        "  Validation: {:.1}% {:?} over {} samples (min {:.1}%)",
        model.validation.accuracy * 100.0,
        model.validation.method,
        model.validation.evaluated,
        model.validation.min_accuracy * 100.0
    );
    println!("  Samples:    {}", model.provenance.sample_count);
    if let Some(base) = &model.provenance.base_model {
        println!("  Base model: {base}");
    }
    println!("  Created:    {}", model.created_at.format("%Y-%m-%d %H:%M:%S UTC"));
    println!("  Active:     {}", if active { "yes".green() } else { "no".normal() });
    println!();
    Ok(())
}
