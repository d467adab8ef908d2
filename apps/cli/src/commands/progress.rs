//! Waiting on a job with a progress bar.

use anyhow::{bail, Result};
use cipherscope_core::{CipherScope, JobId, JobState, JobStatus};
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Wait for `id` to finish. Ctrl-C requests cancellation and keeps waiting
/// until the job observes it.
pub async fn follow(service: &CipherScope, id: &JobId, show_bar: bool) -> Result<JobStatus> {
    let bar = if show_bar { ProgressBar::new(100) } else { ProgressBar::hidden() };
    bar.set_style(
        ProgressStyle::with_template("{spinner:.cyan} [{bar:30.cyan/blue}] {pos:>3}% {msg}")?.progress_chars("=> "),
    );
    bar.enable_steady_tick(POLL_INTERVAL);

    let mut ticker = tokio::time::interval(POLL_INTERVAL);
    let mut cancel_sent = false;
    let wait = service.wait_for_job(id);
    tokio::pin!(wait);

    let status = loop {
        tokio::select! {
            status = &mut wait => break status?,
            _ = ticker.tick() => {
                if let Ok(status) = service.get_job_status(id) {
                    bar.set_position(status.progress.round() as u64);
                    bar.set_message(status.state.to_string());
                }
            }
            signal = tokio::signal::ctrl_c(), if !cancel_sent => {
                signal?;
                cancel_sent = true;
                bar.set_message("cancelling");
                service.cancel_job(id)?;
            }
        }
    };

    bar.finish_and_clear();
    Ok(status)
}

/// Turn a non-completed job into an error for the process exit code.
pub fn ensure_completed(status: &JobStatus) -> Result<()> {
    match &status.state {
        JobState::Completed => Ok(()),
        JobState::Cancelled => bail!("job {} was cancelled", status.id),
        JobState::Failed(reason) => bail!("job {} failed [{}]: {}", status.id, reason.code(), reason),
        other => bail!("job {} is still {}", status.id, other),
    }
}

pub fn print_failure(status: &JobStatus) {
    if let Some(reason) = &status.failure {
        eprintln!("{} {} ({})", "✗".red(), reason.to_string().red(), reason.code().dimmed());
    } else if status.state == JobState::Cancelled {
        eprintln!("{} {}", "✗".yellow(), "cancelled".yellow());
    }
}
