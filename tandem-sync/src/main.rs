use tandem_sync::{ServerConfig, SyncServer};

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = match ServerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            log::error!("{e}");
            std::process::exit(2);
        }
    };

    if config.jwt_secret.is_none() && !config.dev_mode {
        log::warn!("JWT_SECRET is not set and SYNC_DEV_MODE is off: every connection will be rejected");
    }
    if config.dev_mode {
        log::warn!("Development mode: unauthenticated connections are admitted");
    }

    let server: SyncServer = SyncServer::new(config);
    if let Err(e) = server.run().await {
        log::error!("Server stopped: {e}");
        std::process::exit(1);
    }
}
