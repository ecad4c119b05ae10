//! filecache - file-backed key/value cache
//!
//! Each cache bin is a directory holding one file per item. Items can expire,
//! be invalidated individually, by tag, or for the whole bin, and are
//! cleaned up by incremental garbage collection. Several processes may share
//! a bin safely.
//!
//! ```no_run
//! use filecache::config::Settings;
//! use filecache::resolver::FileCacheFactory;
//! use filecache::cache::Expiration;
//! use std::time::Duration;
//!
//! let factory = FileCacheFactory::from_settings(Settings::load_default()?)?;
//! let render = factory.get("render")?;
//!
//! render.set("page:1", "<html>", Expiration::after(Duration::from_secs(60)), &["node:5"])?;
//! if let Some(hit) = render.get("page:1", false) {
//!     println!("{} bytes", hit.payload().len());
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod app;
pub mod cache;
pub mod cli;
pub mod config;
pub mod error;
pub mod key;
pub mod logging;
pub mod resolver;

pub use app::run_app;
