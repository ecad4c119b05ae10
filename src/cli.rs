//! Command-line interface definitions.
//!
//! ```bash
//! # Store a value for an hour, tagged with the node it was rendered from
//! filecache render set page:1 "<html>" --expire-in 1h --tag node:5
//!
//! # Read it back (exit code 2 on a miss)
//! filecache render get page:1
//!
//! # Drop everything rendered from node 5
//! filecache render invalidate-tags node:5
//!
//! # Incremental cleanup, verbose
//! filecache -v render gc --max-items 500
//! ```

use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// File-backed key/value cache with tag invalidation.
#[derive(Debug, Parser)]
#[command(name = "filecache")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Increase verbosity level (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Configuration file (defaults to the platform config directory)
    #[arg(long, value_name = "PATH", global = true, env = "FILECACHE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Report errors as JSON on stderr
    #[arg(long, global = true)]
    pub json_errors: bool,

    /// Output format for reports (stats, gc)
    #[arg(long, value_enum, default_value = "text", global = true)]
    pub output: OutputFormat,

    /// Cache bin to operate on
    #[arg(value_name = "BIN")]
    pub bin: String,

    /// Operation to run
    #[command(subcommand)]
    pub command: Commands,
}

/// Operations on a bin.
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Print the payload stored under a key
    Get(GetArgs),
    /// Store a payload under a key
    Set(SetArgs),
    /// Remove keys
    Delete(KeysArgs),
    /// Mark keys invalid without removing them
    Invalidate(KeysArgs),
    /// Invalidate every item carrying any of the given tags
    InvalidateTags(TagsArgs),
    /// Invalidate every item in the bin
    InvalidateAll,
    /// Remove every item in the bin
    DeleteAll(DeleteAllArgs),
    /// Remove expired, invalidated and corrupt files
    Gc(GcArgs),
    /// Show what the bin contains
    Stats,
    /// Delete the bin directory and everything in it
    RemoveBin,
}

#[derive(Debug, Args)]
pub struct GetArgs {
    /// Key to read
    pub key: String,

    /// Also return expired or invalidated items
    #[arg(long)]
    pub allow_invalid: bool,
}

#[derive(Debug, Args)]
pub struct SetArgs {
    /// Key to write
    pub key: String,

    /// Payload (read from stdin when neither VALUE nor --file is given)
    #[arg(conflicts_with = "file")]
    pub value: Option<String>,

    /// Read the payload from a file
    #[arg(long, value_name = "PATH")]
    pub file: Option<PathBuf>,

    /// Time to live (e.g. 90, 30s, 15m, 2h, 7d); permanent if omitted
    #[arg(long, value_name = "TTL", value_parser = parse_ttl)]
    pub expire_in: Option<u64>,

    /// Tag the item (can be specified multiple times)
    #[arg(short, long = "tag", value_name = "TAG")]
    pub tags: Vec<String>,
}

#[derive(Debug, Args)]
pub struct KeysArgs {
    /// Keys to operate on
    #[arg(required = true, value_name = "KEY")]
    pub keys: Vec<String>,
}

#[derive(Debug, Args)]
pub struct TagsArgs {
    /// Tags to invalidate
    #[arg(required = true, value_name = "TAG")]
    pub tags: Vec<String>,
}

#[derive(Debug, Args)]
pub struct DeleteAllArgs {
    /// Also reset tag counters and the bin epoch
    #[arg(long)]
    pub wipe: bool,
}

#[derive(Debug, Args)]
pub struct GcArgs {
    /// Maximum number of files to examine (0 = no limit)
    #[arg(long, value_name = "N")]
    pub max_items: Option<usize>,

    /// Maximum time to spend in milliseconds (0 = no limit)
    #[arg(long, value_name = "MS")]
    pub max_millis: Option<u64>,
}

/// Output format for reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text
    Text,
    /// JSON for scripting
    Json,
}

/// Parse a time-to-live into seconds.
///
/// Accepts a plain number of seconds or a number followed by `s`, `m`, `h`
/// or `d`.
///
/// ```
/// use filecache::cli::parse_ttl;
///
/// assert_eq!(parse_ttl("90").unwrap(), 90);
/// assert_eq!(parse_ttl("15m").unwrap(), 900);
/// assert_eq!(parse_ttl("2h").unwrap(), 7200);
/// ```
///
/// # Errors
///
/// Returns an error for empty input, non-numeric values, unknown units and
/// values that overflow.
pub fn parse_ttl(s: &str) -> Result<u64, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("TTL cannot be empty".to_string());
    }

    let (num_str, unit) = match s.find(|c: char| !c.is_ascii_digit()) {
        Some(idx) => (&s[..idx], s[idx..].trim().to_lowercase()),
        None => (s, String::new()),
    };

    let num: u64 = num_str
        .parse()
        .map_err(|_| format!("Invalid number: '{num_str}'"))?;

    let multiplier: u64 = match unit.as_str() {
        "" | "s" => 1,
        "m" => 60,
        "h" => 3_600,
        "d" => 86_400,
        _ => return Err(format!("Unknown time unit: '{unit}'")),
    };

    num.checked_mul(multiplier)
        .ok_or_else(|| format!("TTL too large: '{s}'"))
}
