//! CLI argument definitions for coffer.
//!
//! All `clap` structures live here so that `main.rs` stays focused on
//! dispatching subcommands.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use coffer_store::EntityKind;

/// coffer -- JSON document storage for guild economies.
#[derive(Parser)]
#[command(
    name = "coffer",
    version,
    about = "coffer -- dot-path JSON document storage",
    long_about = "Read and mutate a flat-file JSON document by dot-separated path, or \
                  work with per-guild documents in the SQLite store through the cache."
)]
pub struct Cli {
    /// TOML configuration file.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// JSON data file (overrides the configuration).
    #[arg(long, global = true)]
    pub file: Option<PathBuf>,

    /// SQLite database (overrides the configuration).
    #[arg(long, global = true)]
    pub db: Option<PathBuf>,

    /// Reason recorded on change events.
    #[arg(long, global = true)]
    pub reason: Option<String>,

    /// Log at debug level.
    #[arg(long, short, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Print the value at a path (`null` when absent).
    Get { path: String },

    /// Assign a value. VALUE is parsed as JSON, falling back to a string.
    Set { path: String, value: String },

    /// Add to the number at a path.
    Add {
        path: String,
        #[arg(allow_negative_numbers = true)]
        amount: f64,
    },

    /// Subtract from the number at a path.
    Subtract {
        path: String,
        #[arg(allow_negative_numbers = true)]
        amount: f64,
    },

    /// Append a value to the array at a path.
    Push { path: String, value: String },

    /// Remove the first element equal to a value from the array at a path.
    Pull { path: String, value: String },

    /// Remove the key at a path.
    Delete { path: String },

    /// Print the whole document.
    Dump,

    /// Work with documents in the SQLite store.
    Doc {
        #[command(subcommand)]
        action: DocAction,
    },
}

#[derive(Subcommand)]
pub enum DocAction {
    /// Print a document, or the value at `--path` inside it.
    Get {
        kind: EntityKind,
        guild: String,
        #[arg(long, short)]
        member: Option<String>,
        #[arg(long, short)]
        path: Option<String>,
    },

    /// Assign a value inside a document.
    Set {
        kind: EntityKind,
        guild: String,
        path: String,
        value: String,
        #[arg(long, short)]
        member: Option<String>,
    },

    /// Add to the number at a path inside a document.
    Add {
        kind: EntityKind,
        guild: String,
        path: String,
        #[arg(allow_negative_numbers = true)]
        amount: f64,
        #[arg(long, short)]
        member: Option<String>,
    },

    /// Delete a whole document.
    Remove {
        kind: EntityKind,
        guild: String,
        #[arg(long, short)]
        member: Option<String>,
    },
}
