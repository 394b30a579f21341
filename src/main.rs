mod config;
mod engine;
mod error;

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;

use tracing_subscriber::filter::{LevelFilter, Targets};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use config::{CommonConfig, Roster};
use engine::{Engine, EngineOptions};
use engine::events::EVENTS_TARGET;
use error::EngineError;

#[derive(Debug, Parser)]
#[command(author, version, about = "Shares one file across a fixed roster of peers")]
struct Args {
    /// This peer's id, as listed in PeerInfo.cfg.
    peer_id: u32,

    /// Directory holding Common.cfg and PeerInfo.cfg.
    #[arg(long, default_value = ".")]
    config_dir: PathBuf,

    /// Where peer_<id>/ and the event log live.
    #[arg(long, default_value = ".")]
    work_dir: PathBuf,

    /// Seconds to wait for a remote handshake.
    #[arg(long, default_value_t = 10)]
    handshake_timeout: u64,

    /// Extra attempts when dialing a peer that isn't up yet.
    #[arg(long, default_value_t = 3)]
    connect_retries: u32,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let events_file = tracing_appender::rolling::never(&args.work_dir, format!("log_peer_{}.log", args.peer_id));
    let (events_writer, _events_guard) = tracing_appender::non_blocking(events_file);

    let console_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::builder().with_default_directive(LevelFilter::INFO.into()).from_env_lossy())
    ;

    let events_layer = fmt::layer()
        .with_writer(events_writer)
        .with_ansi(false)
        .with_target(false)
        .with_level(false)
        .with_filter(Targets::new().with_target(EVENTS_TARGET, LevelFilter::INFO))
    ;

    tracing_subscriber::registry()
        .with(console_layer)
        .with(events_layer)
        .init()
    ;

    match start(args).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(130),
        Err(e) => {
            tracing::error!("{e}");
            ExitCode::FAILURE
        }
    }
}

async fn start(args: Args) -> Result<bool, EngineError> {
    let common = CommonConfig::load(&args.config_dir)?;
    let roster = Roster::load(&args.config_dir)?;

    let options = EngineOptions {
        work_dir: args.work_dir,
        handshake_timeout: Duration::from_secs(args.handshake_timeout),
        connect_retries: args.connect_retries,
    };

    let engine = Engine::init(args.peer_id, &common, &roster, options).await?;
    Ok(engine.run().await)
}
