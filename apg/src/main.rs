use anyhow::Result;
use apg::cli::{gmm, ring, Cli, Commands};
use clap::Parser;

fn main() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();

    match &cli.command {
        Commands::Gmm(args) => {
            gmm::run(args)?;
        }
        Commands::Ring(args) => {
            ring::run(args)?;
        }
    }

    Ok(())
}
