//! CLI command definitions.

use clap::Subcommand;
use std::path::PathBuf;

#[derive(Subcommand)]
pub enum Commands {
    /// Parse a pipeline and print its tree
    Validate {
        /// Path to pipeline file
        #[arg(default_value = "strata.pipeline.yml")]
        path: PathBuf,
    },

    /// Run a pipeline on this machine
    Run {
        /// Path to pipeline file
        #[arg(default_value = "strata.pipeline.yml")]
        path: PathBuf,

        /// Job variable, repeatable
        #[arg(short = 'e', long = "var", value_name = "KEY=VALUE", value_parser = parse_var)]
        vars: Vec<(String, String)>,

        /// Directory step workspaces are created in
        #[arg(long, default_value = ".strata/workspace")]
        workspace: PathBuf,
    },

    /// Run the scheduler against NATS
    Serve,
}

fn parse_var(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected KEY=VALUE, got '{}'", raw)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_var() {
        assert_eq!(
            parse_var("FLOW_BRANCH=feature=x"),
            Ok(("FLOW_BRANCH".to_string(), "feature=x".to_string()))
        );
        assert_eq!(parse_var("EMPTY="), Ok(("EMPTY".to_string(), String::new())));
        assert!(parse_var("novalue").is_err());
        assert!(parse_var("=value").is_err());
    }
}
