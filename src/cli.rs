//! Process surface shared by the daemon binaries.

use std::io;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use clap::Parser;

use crate::error::Result;
use crate::reactor::{self, Daemon};

#[derive(Debug, Parser)]
#[command(version, about)]
pub struct Args {
    /// JSON configuration file. Defaults apply when omitted or missing.
    #[arg(short, long)]
    pub config: Option<PathBuf>,
}

/// Logs to stderr, filtered by `RUST_LOG` (default `info`).
pub fn init_logging() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
}

/// Flag raised by SIGTERM or SIGINT.
pub fn stop_flag() -> io::Result<Arc<AtomicBool>> {
    let stop = Arc::new(AtomicBool::new(false));

    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&stop))?;
    signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&stop))?;

    Ok(stop)
}

/// Runs a daemon until SIGTERM or SIGINT.
pub fn serve<D: Daemon>(daemon: &mut D) -> Result<()> {
    let stop = stop_flag()?;

    reactor::run(daemon, &stop)?;

    log::info!("stopped");

    Ok(())
}
