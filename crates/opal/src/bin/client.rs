use log::{LevelFilter, SetLoggerError, error, info, logger};
use opal_log::OpalLogger;
use opaline::{ClientParams, FileClient};
use std::net::SocketAddr;

use opal::config;

#[tokio::main]
async fn main() -> Result<(), SetLoggerError> {
    // Log to stderr at debug level; stdout carries the file content.
    OpalLogger::init(LevelFilter::Debug)?;

    let config = match config::handle_client() {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {e}");
            logger().flush();
            std::process::exit(1);
        }
    };

    let server: SocketAddr = match config.network.server.parse() {
        Ok(addr) => addr,
        Err(e) => {
            error!("Invalid server address '{}': {e}", config.network.server);
            logger().flush();
            std::process::exit(1);
        }
    };

    let mut params = ClientParams::new(server, config.transfer.filename.clone());
    params.rcv_win = config.transfer.rcv_win;
    params.seed = config.sim.seed;
    params.loss_probability = config.sim.loss_probability;
    params.mean_print_micros = config.sim.mean_print_micros;

    info!(
        "requesting \"{}\" from {server} (rcv_win={}, p={}, seed={})",
        config.transfer.filename, params.rcv_win, params.loss_probability, params.seed
    );

    let client = match FileClient::connect(params).await {
        Ok(client) => client,
        Err(e) => {
            error!("Failed to reach {server}: {e}");
            logger().flush();
            std::process::exit(1);
        }
    };

    match client.run(std::io::stdout()).await {
        Ok(stats) => {
            info!(
                "transfer complete: {} segments delivered, final ack #{}, {} simulated drops",
                stats.delivered, stats.final_ack, stats.dropped
            );
        }
        Err(e) => {
            error!("transfer failed: {e}");
            logger().flush();
            std::process::exit(1);
        }
    }

    logger().flush();
    Ok(())
}
