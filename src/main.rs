use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use urtorrent::cli;
use urtorrent::engine::{Engine, Listener};
use urtorrent::metainfo::Metainfo;
use urtorrent::peer::PeerId;
use urtorrent::tracker::Agent;

#[derive(Parser, Debug)]
#[command(
    name = "urtorrent",
    version,
    about = "A BitTorrent-compatible peer-to-peer file transfer client"
)]
struct Args {
    /// Port to listen on for peer connections
    port: u16,

    /// Path to the .torrent file
    torrent: PathBuf,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{err}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let listener =
        Listener::bind(args.port).map_err(|_| format!("cannot bind port: {}", args.port))?;

    let meta = Arc::new(Metainfo::open(&args.torrent)?);
    let peer_id = PeerId::generate();

    let agent = Arc::new(Agent::new(meta.clone(), peer_id, args.port)?);
    agent.start().await?;

    let engine = Engine::new(meta, peer_id, agent)?;
    engine.start(listener);

    cli::run(engine.clone()).await?;
    engine.shutdown().await;
    Ok(())
}
