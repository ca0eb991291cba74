use clap::Parser;
use holderscan::cli::{Cli, run_command};
use holderscan::env::setup_tracing;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv_override().ok();

    let cli = Cli::parse();
    setup_tracing(&cli.env);

    run_command(cli.env, cli.command).await
}
