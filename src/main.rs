use std::process::ExitCode;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

mod cli;
mod color;
mod config;
mod config_file;
mod engine;
mod options;
mod output;
mod ratelimit;
mod render;
mod run;
mod tail;
mod target;
mod watch;

use engine::docker::DockerEngine;
use engine::ContainerEngine;

#[tokio::main]
async fn main() -> ExitCode {
    let (matches, mut args) = match cli::parse_command_line() {
        Ok(parsed) => parsed,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(args.verbosity.clone()),
    )
    .init();

    if let Err(e) = cli::apply_config_and_validate(&matches, &mut args) {
        eprintln!("{e}");
        return ExitCode::FAILURE;
    }

    let config = match config::TailfinConfig::from_args(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };

    let engine = match DockerEngine::connect() {
        Ok(engine) => engine,
        Err(e) => {
            eprintln!("failed to connect to the container engine: {e}");
            return ExitCode::FAILURE;
        }
    };
    if let Err(e) = engine.ping().await {
        eprintln!("container engine is unreachable: {e}");
        return ExitCode::FAILURE;
    }

    // One root cancellation scope; Ctrl-C tears down the watcher and every
    // tail, and the supervisor drains before returning.
    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("interrupted, shutting down");
            signal_cancel.cancel();
        }
    });

    let result = run::run(
        Arc::new(engine),
        config,
        output::Sink::stdout(),
        output::Sink::stderr(),
        cancel,
    )
    .await;

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{e}");
            ExitCode::FAILURE
        }
    }
}
