//! CLI argument parsing using clap 4.x derive macros

pub mod config;
pub mod engine;

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

/// Execute autonomous agent triggers against a ledger snapshot
#[derive(Parser, Debug)]
#[command(name = "aa-engine")]
#[command(author, about, long_about = None)]
#[command(version = concat!(env!("CARGO_PKG_VERSION"), " (", env!("GIT_HASH"), ")"))]
#[command(propagate_version = true)]
pub struct Cli {
    /// The command to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Configuration file (TOML); `AA_ENGINE__*` variables override it
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Handle every queued trigger once and print the responses
    Drain {
        /// Ledger snapshot (JSON)
        snapshot: PathBuf,

        /// Formula evaluator used by templates
        #[arg(short, long, value_enum, default_value_t = EvaluatorKind::Script)]
        evaluator: EvaluatorKind,

        /// Print the drain report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Keep draining whenever new triggers are announced, until Ctrl-C
    Run {
        /// Ledger snapshot (JSON)
        snapshot: PathBuf,

        /// Formula evaluator used by templates
        #[arg(short, long, value_enum, default_value_t = EvaluatorKind::Script)]
        evaluator: EvaluatorKind,
    },

    /// Manage configuration
    Config {
        #[command(subcommand)]
        cmd: ConfigCommand,
    },
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Print the effective configuration
    Show,

    /// Load and validate the configuration
    Check,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvaluatorKind {
    /// Built-in expression language
    Script,
    /// Reject every formula
    Null,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drain_defaults_to_the_script_evaluator() {
        let cli = Cli::parse_from(["aa-engine", "drain", "ledger.json"]);
        match cli.command {
            Commands::Drain {
                snapshot,
                evaluator,
                json,
            } => {
                assert_eq!(snapshot, PathBuf::from("ledger.json"));
                assert_eq!(evaluator, EvaluatorKind::Script);
                assert!(!json);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn config_flag_is_global() {
        let cli = Cli::parse_from(["aa-engine", "config", "show", "--config", "engine.toml"]);
        assert_eq!(cli.config, Some(PathBuf::from("engine.toml")));
        assert!(matches!(
            cli.command,
            Commands::Config {
                cmd: ConfigCommand::Show
            }
        ));
    }
}
