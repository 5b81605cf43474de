use log::*;
use st_daemon::daemon::DaemonServer;
use st_daemon::database::DbClient;
use std::sync::Arc;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let mut builder = pretty_env_logger::formatted_timed_builder();
    builder.parse_filters(&std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()));
    builder.init();

    let db = match DbClient::connect().await {
        Ok(db) => db,
        Err(e) => {
            error!("Failed to open database: {}", e);
            std::process::exit(1);
        }
    };

    let server = Arc::new(DaemonServer::new(&db));
    if let Err(e) = server.run().await {
        error!("Daemon exited with error: {}", e);
        std::process::exit(1);
    }
}
