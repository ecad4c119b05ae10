//! Glue between the command line and the cache store.

use std::fs;
use std::io::{self, Read, Write};
use std::time::Duration;

use anyhow::{Context, Result};
use bytesize::ByteSize;

use crate::cache::{Expiration, FileCacheStore, GcBudget};
use crate::cli::{Cli, Commands, GcArgs, OutputFormat, SetArgs};
use crate::config::Settings;
use crate::error::ExitCode;
use crate::resolver::FileCacheFactory;

/// Run a parsed command line.
///
/// Logging is expected to be initialized by the caller.
///
/// # Errors
///
/// Configuration, storage and output errors, wrapped with context. Use
/// [`ExitCode::for_error`] to map them to an exit status.
pub fn run_app(cli: Cli) -> Result<ExitCode> {
    let settings = match cli.config.as_deref() {
        Some(path) => Settings::load(Some(path)),
        None => Settings::load_default(),
    }
    .context("Failed to load configuration")?;

    let factory = FileCacheFactory::from_settings(settings)?;
    let store = factory
        .get(&cli.bin)
        .with_context(|| format!("Failed to open cache bin '{}'", cli.bin))?;

    let stdout = io::stdout();
    let mut out = stdout.lock();
    let code = execute(&store, cli.command, cli.output, &mut out)?;
    out.flush().context("Failed to flush output")?;
    Ok(code)
}

/// Execute one command against `store`, writing results to `out`.
pub fn execute<W: Write>(
    store: &FileCacheStore,
    command: Commands,
    format: OutputFormat,
    out: &mut W,
) -> Result<ExitCode> {
    match command {
        Commands::Get(args) => match store.get(&args.key, args.allow_invalid) {
            Some(hit) => {
                if !hit.valid {
                    log::warn!("'{}' is expired or invalidated", args.key);
                }
                out.write_all(hit.payload())
                    .context("Failed to write payload")?;
                Ok(ExitCode::Success)
            }
            None => {
                log::info!("Miss: '{}'", args.key);
                Ok(ExitCode::Miss)
            }
        },
        Commands::Set(args) => {
            set(store, args)?;
            Ok(ExitCode::Success)
        }
        Commands::Delete(args) => {
            store
                .delete_multiple(&args.keys)
                .context("Failed to delete keys")?;
            log::info!("Deleted {} key(s)", args.keys.len());
            Ok(ExitCode::Success)
        }
        Commands::Invalidate(args) => {
            store
                .invalidate_multiple(&args.keys)
                .context("Failed to invalidate keys")?;
            log::info!("Invalidated {} key(s)", args.keys.len());
            Ok(ExitCode::Success)
        }
        Commands::InvalidateTags(args) => {
            let tags: Vec<&str> = args.tags.iter().map(String::as_str).collect();
            store
                .invalidate_tags(&tags)
                .context("Failed to invalidate tags")?;
            log::info!("Invalidated tag(s): {}", args.tags.join(", "));
            Ok(ExitCode::Success)
        }
        Commands::InvalidateAll => {
            store
                .invalidate_all()
                .context("Failed to invalidate bin")?;
            log::info!("Invalidated all items in '{}'", store.bin());
            Ok(ExitCode::Success)
        }
        Commands::DeleteAll(args) => {
            let removed = if args.wipe {
                store.wipe()
            } else {
                store.delete_all()
            }
            .context("Failed to delete items")?;
            log::info!("Removed {} item(s) from '{}'", removed, store.bin());
            Ok(ExitCode::Success)
        }
        Commands::Gc(args) => gc(store, &args, format, out),
        Commands::Stats => {
            let stats = store.stats().context("Failed to read bin")?;
            match format {
                OutputFormat::Json => {
                    serde_json::to_writer_pretty(&mut *out, &stats)?;
                    writeln!(out)?;
                }
                OutputFormat::Text => {
                    writeln!(out, "Bin:         {}", store.bin())?;
                    writeln!(out, "Directory:   {}", store.directory().display())?;
                    writeln!(out, "Items:       {}", stats.items)?;
                    writeln!(out, "  valid:       {}", stats.valid)?;
                    writeln!(out, "  expired:     {}", stats.expired)?;
                    writeln!(out, "  invalidated: {}", stats.invalidated)?;
                    writeln!(out, "  corrupt:     {}", stats.corrupt)?;
                    writeln!(out, "Temp files:  {}", stats.temp_files)?;
                    writeln!(out, "Size:        {}", ByteSize::b(stats.bytes))?;
                }
            }
            Ok(ExitCode::Success)
        }
        Commands::RemoveBin => {
            store.remove_bin().context("Failed to remove bin")?;
            Ok(ExitCode::Success)
        }
    }
}

fn set(store: &FileCacheStore, args: SetArgs) -> Result<()> {
    let payload = match (args.value, &args.file) {
        (Some(value), _) => value.into_bytes(),
        (None, Some(path)) => fs::read(path)
            .with_context(|| format!("Failed to read payload from {}", path.display()))?,
        (None, None) => {
            let mut buf = Vec::new();
            io::stdin()
                .read_to_end(&mut buf)
                .context("Failed to read payload from stdin")?;
            buf
        }
    };

    let expiration = args
        .expire_in
        .map(|secs| Expiration::after(Duration::from_secs(secs)))
        .unwrap_or_default();
    let tags: Vec<&str> = args.tags.iter().map(String::as_str).collect();

    log::debug!(
        "Storing {} under '{}' ({:?}, {} tag(s))",
        ByteSize::b(payload.len() as u64),
        args.key,
        expiration,
        tags.len()
    );
    store
        .set(&args.key, payload, expiration, &tags)
        .with_context(|| format!("Failed to store '{}'", args.key))
}

fn gc<W: Write>(
    store: &FileCacheStore,
    args: &GcArgs,
    format: OutputFormat,
    out: &mut W,
) -> Result<ExitCode> {
    let mut budget: GcBudget = store.options().gc_budget;
    if let Some(max_items) = args.max_items {
        budget.max_items = (max_items > 0).then_some(max_items);
    }
    if let Some(max_millis) = args.max_millis {
        budget.max_duration = (max_millis > 0).then(|| Duration::from_millis(max_millis));
    }

    let report = store
        .garbage_collection_with(&budget)
        .context("Garbage collection failed")?;

    match format {
        OutputFormat::Json => {
            serde_json::to_writer_pretty(&mut *out, &report)?;
            writeln!(out)?;
        }
        OutputFormat::Text => {
            writeln!(
                out,
                "Scanned {} file(s), removed {} (expired {}, invalidated {}, corrupt {}, temp {})",
                report.scanned,
                report.removed(),
                report.removed_expired,
                report.removed_invalidated,
                report.removed_corrupt,
                report.removed_temp
            )?;
            if !report.complete {
                writeln!(out, "Budget exhausted; run again to continue")?;
            }
            for error in &report.errors {
                writeln!(out, "error: {error}")?;
            }
        }
    }

    if report.errors.is_empty() {
        Ok(ExitCode::Success)
    } else {
        Ok(ExitCode::PartialFailure)
    }
}
