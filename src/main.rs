mod cli;
mod config;
mod crypto;
mod deploy;
mod docker;
mod error;
mod graph;
mod notify;
mod output;
mod reconcile;
mod registry;
mod runtime;
mod secrets;
mod ssh;
mod state;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use cli::{Cli, Command, EnvAction, StateAction};
use config::ProjectConfig;
use runtime::Runtime;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Setup tracing
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
        .without_time()
        .init();

    if let Err(err) = dispatch(cli).await {
        output::error(&format!("{:#}", err));
        std::process::exit(error::exit_code_for(&err));
    }
}

async fn dispatch(cli: Cli) -> Result<()> {
    let project_root = std::env::current_dir()?;
    let config_path = cli.config.as_deref();
    let server_filter = cli.server.clone();
    let load_config = || -> Result<ProjectConfig> {
        let config = ProjectConfig::load(config_path, &project_root)?;
        // --server must name a configured server before any SSH happens.
        if let Some(server) = &server_filter {
            config.server(server)?;
        }
        Ok(config)
    };

    match cli.command {
        Command::Init => {
            cli::init::run(&project_root)?;
        }

        Command::Deploy { skip_build, yes } => {
            let runtime = Runtime::for_cli(cli.host_key_mode)?;
            cli::deploy::run(
                runtime,
                load_config()?,
                &cli.env,
                project_root,
                skip_build,
                yes,
            )
            .await?;
        }

        Command::Rollback { id } => {
            let runtime = Runtime::for_cli(cli.host_key_mode)?;
            cli::rollback::run(runtime, load_config()?, &cli.env, project_root, id.as_deref())
                .await?;
        }

        Command::Scale { targets } => {
            let runtime = Runtime::for_cli(cli.host_key_mode)?;
            cli::scale::run(runtime, load_config()?, &cli.env, project_root, &targets).await?;
        }

        Command::Stop { service } => {
            let runtime = Runtime::for_cli(cli.host_key_mode)?;
            cli::service_cmd::run(
                runtime,
                load_config()?,
                &cli.env,
                project_root,
                service.as_deref(),
                cli::service_cmd::Action::Stop,
            )
            .await?;
        }

        Command::Start { service } => {
            let runtime = Runtime::for_cli(cli.host_key_mode)?;
            cli::service_cmd::run(
                runtime,
                load_config()?,
                &cli.env,
                project_root,
                service.as_deref(),
                cli::service_cmd::Action::Start,
            )
            .await?;
        }

        Command::Ps => {
            let runtime = Runtime::for_cli(cli.host_key_mode)?;
            cli::ps::run(runtime, load_config()?, &cli.env).await?;
        }

        Command::History { limit, status } => {
            cli::history::run(
                load_config()?,
                &cli.env,
                &project_root,
                limit,
                status.as_deref(),
            )
            .await?;
        }

        Command::State { action } => {
            let config = load_config()?;
            match action {
                StateAction::Pull => {
                    let runtime = Runtime::for_cli(cli.host_key_mode)?;
                    cli::state_cmd::pull(runtime, config, &cli.env, &project_root).await?;
                }
                StateAction::Status => {
                    let runtime = Runtime::for_cli(cli.host_key_mode)?;
                    cli::state_cmd::status(runtime, config, &cli.env, &project_root).await?;
                }
                StateAction::Export { output } => {
                    cli::state_cmd::export(config, &project_root, &output).await?;
                }
                StateAction::Import { input } => {
                    cli::state_cmd::import(&project_root, &input).await?;
                }
            }
        }

        Command::Drift { watch, interval } => {
            let runtime = Runtime::for_cli(cli.host_key_mode)?;
            cli::drift_cmd::run(
                runtime,
                load_config()?,
                &cli.env,
                &project_root,
                watch,
                interval,
            )
            .await?;
        }

        Command::Env { action } => {
            let runtime = Runtime::for_cli(cli.host_key_mode)?;
            let config = load_config()?;
            match action {
                EnvAction::Push => {
                    cli::env_cmd::push(runtime, config, &cli.env, &project_root).await?;
                }
                EnvAction::Pull => {
                    cli::env_cmd::pull(runtime, config, &cli.env, &project_root).await?;
                }
            }
        }

        Command::Destroy { purge_all, yes } => {
            let runtime = Runtime::for_cli(cli.host_key_mode)?;
            cli::destroy::run(
                runtime,
                load_config()?,
                &cli.env,
                project_root,
                purge_all,
                yes,
            )
            .await?;
        }
    }

    Ok(())
}
