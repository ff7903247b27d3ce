use clap::Parser;
use log::{error, info};
use server::config::{Args, ServerConfig};
use server::network::Server;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config = ServerConfig::from(args);

    info!("Starting server on {}", config.bind_addr);
    info!(
        "Broadcast rate: {:.1} Hz, max players: {}",
        config.broadcast_rate(),
        config.max_players
    );

    let server = Server::bind(config).await?;
    let handle = server.handle();
    let mut server_task = tokio::spawn(server.run());

    tokio::select! {
        result = &mut server_task => {
            match result {
                Ok(Err(e)) => error!("Server stopped: {}", e),
                Err(e) => error!("Server task panicked: {}", e),
                Ok(Ok(())) => {}
            }
            return Ok(());
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down gracefully...");
        }
    }

    handle.shutdown();
    match server_task.await {
        Ok(result) => result?,
        Err(e) => error!("Server task panicked: {}", e),
    }

    Ok(())
}
