//! herd - pre-forking HTTP service supervisor

mod cli;

use anyhow::{Context, Result};
use clap::Parser;
use herd::{cluster, logging, server};
use owo_colors::{OwoColorize, Stream::Stderr};

use cli::Cli;

fn main() {
    let cli = Cli::parse();
    logging::init(cli.log_config());

    if let Err(e) = run(&cli) {
        eprintln!(
            "{}: {}",
            "error"
                .if_supports_color(Stderr, |text| text.red())
                .if_supports_color(Stderr, |text| text.bold()),
            e
        );
        for cause in e.chain().skip(1) {
            eprintln!(
                "  {}: {}",
                "caused by".if_supports_color(Stderr, |text| text.yellow()),
                cause
            );
        }
        std::process::exit(1);
    }
}

/// Start the runtime and hand control to the cluster, which either supervises
/// workers or serves the application in this process.
fn run(cli: &Cli) -> Result<()> {
    let options = cli.cluster_options();
    let runtime = tokio::runtime::Runtime::new().context("Failed to create Tokio runtime")?;

    runtime.block_on(async {
        let worker_options = options.clone();
        cluster::run(&options, || async move {
            server::run_server(&worker_options).await?;
            Ok::<(), anyhow::Error>(())
        })
        .await
    })
}
