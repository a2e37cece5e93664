use clap::{Parser, Subcommand};
use mf_core::{JobKind, Priority};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "mediaforge")]
#[command(author, version, about = "Media conversion job orchestrator")]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Convert a single file
    Convert {
        /// Input file to convert
        #[arg(required = true)]
        input: PathBuf,

        /// Job kind (image-convert, audio-convert, video-convert,
        /// audio-extract, thumbnail, analyze)
        #[arg(short, long)]
        kind: JobKind,

        /// Conversion parameter as key=value; repeatable
        #[arg(short, long = "param", value_parser = parse_param)]
        params: Vec<(String, serde_json::Value)>,

        /// Queue the job even if it is small enough to run inline
        #[arg(long = "async")]
        force_async: bool,

        /// Queue priority (high, normal, low)
        #[arg(long, default_value = "normal")]
        priority: Priority,

        /// Deduplicate against earlier submissions with the same key
        #[arg(long)]
        idempotency_key: Option<String>,

        /// Where to write the result (defaults next to the input)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Convert several files with one parameter set
    Batch {
        /// Input files, converted in order
        #[arg(required = true)]
        inputs: Vec<PathBuf>,

        /// Job kind shared by every input
        #[arg(short, long)]
        kind: JobKind,

        /// Conversion parameter as key=value; repeatable
        #[arg(short, long = "param", value_parser = parse_param)]
        params: Vec<(String, serde_json::Value)>,

        /// Queue every child even if small enough to run inline
        #[arg(long = "async")]
        force_async: bool,

        /// Directory for the results
        #[arg(short, long)]
        output_dir: PathBuf,
    },

    /// Check that required external tools are available
    CheckTools,

    /// Validate configuration file
    Validate {
        /// Config file to validate (uses default if not specified)
        #[arg(value_name = "CONFIG")]
        file: Option<PathBuf>,
    },

    /// Display version information
    Version,
}

/// Parse `key=value`. Values that read as JSON (numbers, booleans, quoted
/// strings) keep their type; anything else is a plain string.
pub fn parse_param(s: &str) -> Result<(String, serde_json::Value), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{s}'"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("missing parameter name in '{s}'"));
    }
    let value = serde_json::from_str(value.trim())
        .unwrap_or_else(|_| serde_json::Value::String(value.trim().to_string()));
    Ok((key.to_string(), value))
}
