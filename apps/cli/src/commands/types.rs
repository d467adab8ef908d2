//! Command type definitions shared between main.rs and tests.

use clap::Subcommand;
use std::path::PathBuf;

#[derive(Subcommand, Debug, Clone)]
pub enum ModelsCommand {
    /// List registered models
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show one model's labels, validation and provenance
    Show {
        /// Model ID
        model_id: String,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Make a model the one classification uses
    Activate {
        /// Model ID
        model_id: String,
    },

    /// Clear the active model
    Deactivate,
}

#[derive(Subcommand, Debug, Clone)]
pub enum JobsCommand {
    /// List jobs recorded in the data directory, newest first
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show a job's status and result
    Show {
        /// Job ID
        job_id: String,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Rate a completed classification
    Feedback {
        /// Job ID
        job_id: String,

        /// up or down
        rating: String,
    },
}

/// One `LABEL=PATH` training sample argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleArg {
    pub label: String,
    pub path: PathBuf,
}

impl std::str::FromStr for SampleArg {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (label, path) = s.split_once('=').ok_or_else(|| format!("expected LABEL=PATH, got '{s}'"))?;
        let label = label.trim();
        if label.is_empty() || path.trim().is_empty() {
            return Err(format!("expected LABEL=PATH, got '{s}'"));
        }
        Ok(Self { label: label.to_string(), path: PathBuf::from(path.trim()) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_arg_parse() {
        let arg: SampleArg = "AES=data/aes.csv".parse().unwrap();
        assert_eq!(arg.label, "AES");
        assert_eq!(arg.path, PathBuf::from("data/aes.csv"));

        assert!("no-separator".parse::<SampleArg>().is_err());
        assert!("=path".parse::<SampleArg>().is_err());
        assert!("AES=".parse::<SampleArg>().is_err());
    }
}
