use clap::Parser;

use packtun::cli::{self, Args};
use packtun::config::{self, TunConfig};

fn main() -> packtun::Result<()> {
    let args = Args::parse();

    cli::init_logging();

    let config: TunConfig = config::load(args.config.as_deref())?;
    let mut daemon = packtun::tun::Tun::new(config)?;

    cli::serve(&mut daemon)
}
