//! Tandem sync server binary.
//!
//! ```text
//! tandem-server [addr]     # defaults to 0.0.0.0:8000
//! tandem-server 9000       # a bare port binds 0.0.0.0:9000
//! ```
//!
//! Set `TANDEM_TOKEN` to require a shared secret on connect. Logging is
//! controlled through `RUST_LOG` as usual.

use log::info;
use tandem_sync::{ServerConfig, SyncServer};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let mut config = ServerConfig::default();
    if let Some(arg) = std::env::args().nth(1) {
        config.bind_addr = if arg.chars().all(|c| c.is_ascii_digit()) {
            format!("0.0.0.0:{arg}")
        } else {
            arg
        };
    }
    if let Ok(token) = std::env::var("TANDEM_TOKEN") {
        if !token.is_empty() {
            info!("Connect token required");
            config.token = Some(token);
        }
    }

    info!("Starting Tandem sync server on {}", config.bind_addr);
    SyncServer::new(config).run().await
}
