use clap::Parser;

use packtun::cli::{self, Args};
use packtun::config::{self, ProxydConfig};

fn main() -> packtun::Result<()> {
    let args = Args::parse();

    cli::init_logging();

    let config: ProxydConfig = config::load(args.config.as_deref())?;
    let mut daemon = packtun::proxyd::Proxyd::new(config)?;

    cli::serve(&mut daemon)
}
