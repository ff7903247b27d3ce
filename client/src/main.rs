use clap::Parser;
use client::game::{ExitReason, GameLoop};
use client::input::RandomWalk;
use client::network::NetworkClient;
use client::rendering::LogRenderer;
use log::{info, warn};
use shared::{PlayerId, DEFAULT_PORT};
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server address to connect to
    #[arg(short = 's', long, default_value_t = format!("127.0.0.1:{}", DEFAULT_PORT))]
    server: String,

    /// Display name (the server picks one when left empty)
    #[arg(short = 'n', long, default_value = "")]
    name: String,

    /// Ask for a specific player id
    #[arg(short = 'i', long)]
    id: Option<PlayerId>,

    /// Frames per second of the input/render loop
    #[arg(short = 'f', long, default_value = "30")]
    fps: u32,

    /// Seed for the random walk, for reproducible runs
    #[arg(long)]
    seed: Option<u64>,

    /// Leave after this many seconds instead of running until the server goes away
    #[arg(short = 'd', long)]
    duration_secs: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    info!("Starting client...");
    info!("Connecting to: {}", args.server);

    let network = NetworkClient::connect(&args.server, &args.name, args.id).await?;

    let mut game = GameLoop::new(
        network,
        LogRenderer::new(),
        RandomWalk::new(args.seed),
        args.fps,
    );
    if let Some(secs) = args.duration_secs {
        game = game.with_duration(Duration::from_secs(secs));
    }

    match game.run().await? {
        ExitReason::ConnectionLost(reason) => warn!("Disconnected from server: {}", reason),
        ExitReason::Quit | ExitReason::DurationElapsed => info!("Left the game"),
    }

    Ok(())
}
