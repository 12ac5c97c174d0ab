use clap::Parser;

use packtun::cli::{self, Args};
use packtun::config::{self, ProxyConfig};

fn main() -> packtun::Result<()> {
    let args = Args::parse();

    cli::init_logging();

    let config: ProxyConfig = config::load(args.config.as_deref())?;
    let mut daemon = packtun::proxy::Proxy::new(config)?;

    cli::serve(&mut daemon)
}
