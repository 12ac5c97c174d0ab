use clap::Parser;

use packtun::cli::{self, Args};
use packtun::config::{self, TundConfig};

fn main() -> packtun::Result<()> {
    let args = Args::parse();

    cli::init_logging();

    let config: TundConfig = config::load(args.config.as_deref())?;
    let mut daemon = packtun::tund::Tund::new(config)?;

    cli::serve(&mut daemon)
}
