use log::info;
use padcast_collab::{ServerConfig, SyncServer};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = ServerConfig::from_env()?;
    info!("Starting padcast on {}", config.bind_addr);
    if let Some(root) = &config.web_root {
        info!("Serving pages from {}", root.display());
    }

    let server = SyncServer::new(config);
    server
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                log::error!("Failed to listen for Ctrl-C: {e}");
                std::future::pending::<()>().await;
            }
            info!("Ctrl-C received");
        })
        .await?;

    info!("Server stopped");
    Ok(())
}
