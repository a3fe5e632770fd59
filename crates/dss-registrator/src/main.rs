//! DSS Registrator - Main entry point

use dss_common::logging::{init_logging, LogConfig, LogLevel, LogOutput, ENV_PREFIX};
use dss_registrator::handler::handler_for;
use dss_registrator::recovery::recover_dead_transactions;
use dss_registrator::scanner::DropBoxScanner;
use dss_registrator::{Cli, Commands, EngineContext, RegistratorConfig, TopLevelRegistrator};
use clap::Parser;
use std::process;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if cli.markdown_help {
        println!("{}", clap_markdown::help_markdown::<Cli>());
        return;
    }

    let Some(command) = cli.command.as_ref() else {
        eprintln!("Error: A subcommand is required");
        eprintln!();
        eprintln!("For more information, try '--help'.");
        process::exit(2);
    };

    let log_config = LogConfig::default()
        .with_level(if cli.verbose { LogLevel::Debug } else { LogLevel::Info })
        .with_output(LogOutput::Console)
        .with_file_prefix("dss-registrator");

    // DSS_LOG_* variables take precedence
    let log_config = match log_config.clone().overlay_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Warning: ignoring {}* settings: {:#}", ENV_PREFIX, e);
            log_config
        },
    };

    let _guard = match init_logging(&log_config) {
        Ok(guard) => Some(guard),
        Err(e) => {
            eprintln!("Warning: logging disabled: {}", e);
            None
        },
    };

    match execute_command(command).await {
        Ok(true) => {},
        Ok(false) => process::exit(1),
        Err(e) => {
            error!(error = %e, "Command failed");
            eprintln!("Error: {:#}", e);
            process::exit(1);
        },
    }
}

/// Cancel `token` on ctrl-c
fn install_shutdown_handler(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Shutdown requested");
            token.cancel();
        }
    });
}

/// Execute the CLI command; `Ok(false)` means it ran but did not succeed
async fn execute_command(command: &Commands) -> anyhow::Result<bool> {
    let config = RegistratorConfig::load()?;
    let handler = handler_for(config.drop_box.handler);

    let shutdown = CancellationToken::new();
    install_shutdown_handler(shutdown.clone());
    let ctx = EngineContext::builder(config).shutdown(shutdown).build()?;

    match command {
        Commands::Run => {
            let registrator = Arc::new(TopLevelRegistrator::new(Arc::clone(&ctx), handler));
            let report = registrator.start().await?;
            info!(
                rolled_back = report.rolled_back.len(),
                completed = report.completed.len(),
                "Startup recovery done"
            );
            DropBoxScanner::new(Arc::clone(&registrator)).run().await?;
            Ok(!registrator.is_stopped() || ctx.is_shutting_down())
        },

        Commands::Process { path } => {
            let registrator = TopLevelRegistrator::new(ctx, handler);
            registrator.start().await?;
            match registrator.handle(path).await {
                Some(outcome) => {
                    println!("{}", serde_json::to_string_pretty(&outcome)?);
                    Ok(outcome.succeeded)
                },
                None => {
                    eprintln!("Nothing registered for '{}'", path.display());
                    Ok(false)
                },
            }
        },

        Commands::Recover => {
            ctx.ensure_directories()?;
            let report = recover_dead_transactions(&ctx).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(true)
        },

        Commands::Check => {
            let registrator = TopLevelRegistrator::new(ctx, handler);
            registrator.check().await?;
            println!("OK");
            Ok(true)
        },
    }
}
