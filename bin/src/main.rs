#![allow(clippy::cognitive_complexity)]
use std::process::ExitCode;

use anyhow::{Context, Result};
use tokio::runtime::Builder;
use tracing::{debug, error, info, warn};

mod cli;
mod trace;

use cli::{Command, Parser};
use config::CoordinationConfig;
use etcd_coordination::{CoordinationClient, MemoryCluster, StatusCode};

fn main() -> Result<ExitCode> {
    let dotenv = dotenv::dotenv();
    // parses from cli or environment var
    let config = cli::Config::parse();
    trace::init(&config.coord_log, config.log_format)?;
    if let Err(err) = dotenv {
        debug!(?err, ".env file not loaded");
    }
    debug!(?config);

    let rt = Builder::new_multi_thread()
        .thread_name(&config.thread_name)
        .enable_all()
        .build()?;

    match rt.block_on(run(config)) {
        Ok(code) => Ok(code),
        Err(err) => {
            error!(?err, "exited with error");
            Err(err)
        }
    }
}

fn load_config(config: &cli::Config) -> Result<CoordinationConfig> {
    let coord = match &config.config_path {
        Some(path) => {
            debug!(path = %path.display(), "parsing coordination config");
            CoordinationConfig::parse(path)?
        }
        None => CoordinationConfig::default(),
    };
    config.apply(coord)
}

async fn run(config: cli::Config) -> Result<ExitCode> {
    let coord = load_config(&config)?;
    let client = if config.memory {
        info!("using in-process memory store, nothing is persisted");
        CoordinationClient::with_connector(coord, MemoryCluster::new())
    } else {
        CoordinationClient::new(coord)
    };

    client
        .connect()
        .await
        .context("failed to initialize coordination client")?;
    let result = execute(&client, config.command).await;
    client.close().await;
    result
}

fn exit_code(status: StatusCode) -> ExitCode {
    println!("{status}");
    if status.is_ok() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

async fn execute(client: &CoordinationClient, command: Command) -> Result<ExitCode> {
    match command {
        Command::Get { key, default } => {
            let value = match default {
                Some(default) => client.get_string(&key, &default).await,
                None => client
                    .get(&key)
                    .await
                    .with_context(|| format!("failed to read {key}"))?,
            };
            println!("{value}");
        }
        Command::GetInt { key, default } => {
            let value = match default {
                Some(default) => client.get_int(&key, default).await,
                None => client
                    .get_i32(&key)
                    .await
                    .with_context(|| format!("failed to read {key}"))?,
            };
            println!("{value}");
        }
        Command::GetInt64 { key, default } => {
            let value = match default {
                Some(default) => client.get_int64(&key, default).await,
                None => client
                    .get_i64(&key)
                    .await
                    .with_context(|| format!("failed to read {key}"))?,
            };
            println!("{value}");
        }
        Command::SetInt64 { key, value } => {
            return Ok(exit_code(client.set_int64(&key, value).await));
        }
        Command::Lock { name, hold } => {
            let guard = client
                .lock(&name)
                .await
                .with_context(|| format!("failed to acquire lock {name}"))?;
            info!(name = %name, ?hold, "holding lock");
            tokio::select! {
                _ = tokio::time::sleep(hold) => {}
                res = tokio::signal::ctrl_c() => {
                    if let Err(err) = res {
                        warn!(?err, "failed to listen for ctrl-c");
                    } else {
                        info!("ctrl-c received, releasing lock early");
                    }
                }
            }
            return Ok(exit_code(client.unlock(guard).await));
        }
    }
    Ok(ExitCode::SUCCESS)
}
