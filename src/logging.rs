//! Tracing setup for hosts embedding the core.

use anyhow::Context;
use tracing::Level;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use crate::errors::Result;

/// Maps a `-v` count to the default level. `RUST_LOG` still wins.
pub fn level_for(verbosity: u8) -> Level {
    match verbosity {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    }
}

pub fn env_filter(verbosity: u8) -> EnvFilter {
    EnvFilter::builder()
        .with_default_directive(level_for(verbosity).into())
        .from_env_lossy()
}

/// Installs a global fmt subscriber. Fails if one is already installed.
pub fn init_tracing(verbosity: u8) -> Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(env_filter(verbosity))
        .with_target(false)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")?;
    Ok(())
}
