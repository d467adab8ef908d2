//! Jobs command implementation.

use super::types::JobsCommand;
use anyhow::{anyhow, Result};
use cipherscope_core::{CipherScope, Feedback, JobId, JobResult, JobState, JobStatus};
use colored::{ColoredString, Colorize};

pub fn execute(service: &CipherScope, command: JobsCommand) -> Result<()> {
    match command {
        JobsCommand::List { json } => list_jobs(service, json),
        JobsCommand::Show { job_id, json } => show_job(service, &JobId::from(job_id.as_str()), json),
        JobsCommand::Feedback { job_id, rating } => {
            let rating: Feedback = rating.parse().map_err(|e: String| anyhow!(e))?;
            let id = JobId::from(job_id.as_str());
            service.submit_feedback(&id, rating)?;
            println!("{} Feedback recorded for {}", "✓".green(), id.to_string().cyan());
            Ok(())
        }
    }
}

fn colored_state(state: &JobState) -> ColoredString {
    let text = state.to_string();
    match state {
        JobState::Completed => text.green(),
        JobState::Failed(_) => text.red(),
        JobState::Cancelled => text.yellow(),
        _ => text.cyan(),
    }
}

fn list_jobs(service: &CipherScope, json_output: bool) -> Result<()> {
    let jobs = service.job_history()?;

    if json_output {
        println!("{}", serde_json::to_string_pretty(&jobs)?);
        return Ok(());
    }

    println!();
    println!("{}", format!("Jobs ({})", jobs.len()).bold().cyan());
    println!();
    if jobs.is_empty() {
        println!("  {}", "No jobs recorded.".dimmed());
        println!();
        return Ok(());
    }

    println!("  {:<38} {:<9} {:<28} {}", "ID", "Kind", "State", "Created");
    println!("  {}", "─".repeat(96));
    for job in &jobs {
        println!(
            "  {:<38} {:<9} {:<28} {}",
            job.id.to_string(),
            job.kind.to_string(),
            colored_state(&job.state),
            job.created_at.format("%Y-%m-%d %H:%M:%S").to_string().dimmed()
        );
    }
    println!();
    Ok(())
}

fn show_job(service: &CipherScope, id: &JobId, json_output: bool) -> Result<()> {
    let status: JobStatus = service.get_job_status(id)?;

    if json_output {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    println!();
    println!("{} {}", "Job".bold(), status.id.to_string().cyan());
    println!("  Kind:     {}", status.kind);
    if let Some(owner) = &status.owner {
        println!("  Owner:    {owner}");
    }
    println!("  State:    {}", colored_state(&status.state));
    println!("  Progress: {:.0}%", status.progress);
    if let Some(reason) = &status.failure {
        println!("  Reason:   {} ({})", reason, reason.code().dimmed());
    }
    match &status.result {
        Some(JobResult::Classification(result)) => {
            println!("  Result:   {} ({:.1}%)", result.label.green(), result.confidence);
        }
        Some(JobResult::Training(summary)) => {
            println!("  Model:    {} ({:.1}% accuracy)", summary.model_id, summary.accuracy * 100.0);
        }
        None => {}
    }
    println!();
    Ok(())
}
