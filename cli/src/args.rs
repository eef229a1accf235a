//! CLI argument definitions.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use fenceref_engine::TaskPriority;

/// Resolve inline `@[type:value]` references and count the tokens they add.
#[derive(Parser, Debug)]
#[command(name = "fenceref")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Config file to use instead of ~/.fenceref/config.toml
    #[arg(short, long, global = true, env = "FENCEREF_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Print the text with every reference replaced by its content
    Resolve {
        /// Input file; stdin when omitted or "-"
        path: Option<PathBuf>,

        /// Print the full resolution result as JSON
        #[arg(long)]
        json: bool,
    },

    /// Count tokens in the text as written
    Count {
        /// Input file; stdin when omitted or "-"
        path: Option<PathBuf>,
    },

    /// Drop cached reference content
    Invalidate {
        /// Reference signature such as `var:name` or `@[file:docs/a.md]`
        #[arg(required_unless_present = "all", conflicts_with = "all")]
        signature: Option<String>,

        /// Drop every cached reference
        #[arg(long)]
        all: bool,
    },

    /// Re-resolve files as fence blocks and report their token totals
    Refresh {
        /// One block per file
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        #[arg(long, value_enum, default_value_t = PriorityArg::Interactive)]
        priority: PriorityArg,
    },
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriorityArg {
    Interactive,
    Global,
    Passive,
}

impl From<PriorityArg> for TaskPriority {
    fn from(arg: PriorityArg) -> Self {
        match arg {
            PriorityArg::Interactive => TaskPriority::Interactive,
            PriorityArg::Global => TaskPriority::Global,
            PriorityArg::Passive => TaskPriority::Passive,
        }
    }
}
