use clap::Parser;

use packtun::cli::{self, Args};
use packtun::config::{self, UdpdConfig};

fn main() -> packtun::Result<()> {
    let args = Args::parse();

    cli::init_logging();

    let config: UdpdConfig = config::load(args.config.as_deref())?;
    let mut daemon = packtun::udpd::Udpd::new(config)?;

    cli::serve(&mut daemon)
}
