use std::process;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::error;
use tracing_subscriber::EnvFilter;

use nfd_master::cli::{
    dry_run, format_desired_state, format_gc_report, format_prune_summary, format_report_sent, gc,
    prune, report, serve, Cli, Commands,
};
use nfd_master::service::shutdown_signal;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize logging
    let filter = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .init();

    if let Err(e) = run(cli.command).await {
        error!("{:#}", e);
        eprintln!("Error: {:#}", e);
        process::exit(1);
    }
}

async fn run(command: Commands) -> anyhow::Result<()> {
    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        token.cancel();
    });

    match command {
        Commands::Serve(args) => serve(&args, shutdown).await,
        Commands::Prune(args) => {
            let pruned = prune(&args).await?;
            print!("{}", format_prune_summary(pruned));
            Ok(())
        }
        Commands::DryRun(args) => {
            let (node, state) = dry_run(&args).await?;
            print!("{}", format_desired_state(&node, &state, args.output)?);
            Ok(())
        }
        Commands::Report(args) => {
            let request = report(&args).await?;
            print!("{}", format_report_sent(&request, &args.server));
            Ok(())
        }
        Commands::Gc(args) => {
            if let Some(report) = gc(&args, shutdown).await? {
                print!("{}", format_gc_report(&report));
            }
            Ok(())
        }
    }
}
