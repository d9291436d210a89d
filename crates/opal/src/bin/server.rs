use log::{LevelFilter, SetLoggerError, error, info, logger};
use opal_log::OpalLogger;
use opaline::FileServer;
use std::net::SocketAddr;

use opal::config;

#[tokio::main]
async fn main() -> Result<(), SetLoggerError> {
    OpalLogger::init(LevelFilter::Debug)?;

    let config = match config::handle_server() {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {e}");
            logger().flush();
            std::process::exit(1);
        }
    };

    // Validated on load, so this parse cannot fail.
    let addr: SocketAddr = match config.network.bind.parse() {
        Ok(addr) => addr,
        Err(e) => {
            error!("Invalid bind address '{}': {e}", config.network.bind);
            logger().flush();
            std::process::exit(1);
        }
    };

    let server = match FileServer::bind(addr, config.transfer.max_winsize).await {
        Ok(server) => server,
        Err(e) => {
            error!("Failed to bind {addr}: {e}");
            logger().flush();
            std::process::exit(1);
        }
    };

    info!(
        "serving files on {addr} with a sender window of {} datagrams",
        config.transfer.max_winsize
    );
    if let Err(e) = server.run().await {
        error!("server terminated: {e}");
        logger().flush();
        std::process::exit(1);
    }

    Ok(())
}
