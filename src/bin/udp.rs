use clap::Parser;

use packtun::cli::{self, Args};
use packtun::config::{self, UdpConfig};

fn main() -> packtun::Result<()> {
    let args = Args::parse();

    cli::init_logging();

    let config: UdpConfig = config::load(args.config.as_deref())?;
    let mut daemon = packtun::udp::Udp::new(config)?;

    cli::serve(&mut daemon)
}
