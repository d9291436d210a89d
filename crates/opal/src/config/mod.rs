use error::{ConfigError, Result};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::fs;
use std::io::Write;
use std::net::SocketAddr;
use std::path::Path;
use std::str::FromStr;

pub mod error;

const SERVER_CONFIG_FILE: &str = "server.toml";
const CLIENT_CONFIG_FILE: &str = "client.toml";

#[derive(Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub network: ServerNetworkConfig,
    pub transfer: ServerTransferConfig,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerNetworkConfig {
    /// Well-known address file requests arrive on.
    pub bind: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerTransferConfig {
    /// Maximum sender window, in datagrams.
    pub max_winsize: u16,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub network: ClientNetworkConfig,
    pub transfer: ClientTransferConfig,
    pub sim: SimConfig,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientNetworkConfig {
    /// Server address, `IP:PORT`.
    pub server: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientTransferConfig {
    pub filename: String,
    /// Receive window, in datagrams.
    pub rcv_win: u16,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    /// Seed for the loss model and the print pacer.
    pub seed: u64,
    /// Per-datagram drop probability, in [0, 1].
    pub loss_probability: f64,
    /// Mean inter-print interval in microseconds.
    pub mean_print_micros: u32,
}

impl Default for ServerNetworkConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:9877".to_string(),
        }
    }
}

impl Default for ServerTransferConfig {
    fn default() -> Self {
        Self { max_winsize: 16 }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            network: ServerNetworkConfig::default(),
            transfer: ServerTransferConfig::default(),
        }
    }
}

impl Default for ClientNetworkConfig {
    fn default() -> Self {
        Self {
            server: "127.0.0.1:9877".to_string(),
        }
    }
}

impl Default for ClientTransferConfig {
    fn default() -> Self {
        Self {
            filename: "file.txt".to_string(),
            rcv_win: 16,
        }
    }
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            seed: 0,
            loss_probability: 0.0,
            mean_print_micros: 1000,
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            network: ClientNetworkConfig::default(),
            transfer: ClientTransferConfig::default(),
            sim: SimConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Result<()> {
        if SocketAddr::from_str(&self.network.bind).is_err() {
            return Err(ConfigError::Validation(format!(
                "Invalid bind address format: '{}'. Expected format like 'IP:PORT'.",
                self.network.bind
            )));
        }
        if self.transfer.max_winsize == 0 {
            return Err(ConfigError::Validation(
                "Maximum sender window must be greater than 0.".to_string(),
            ));
        }
        Ok(())
    }
}

impl ClientConfig {
    pub fn validate(&self) -> Result<()> {
        if SocketAddr::from_str(&self.network.server).is_err() {
            return Err(ConfigError::Validation(format!(
                "Invalid server address format: '{}'. Expected format like 'IP:PORT'.",
                self.network.server
            )));
        }
        if self.transfer.filename.trim().is_empty() {
            return Err(ConfigError::Validation(
                "Filename cannot be empty.".to_string(),
            ));
        }
        if self.transfer.rcv_win == 0 {
            return Err(ConfigError::Validation(
                "Receive window must be greater than 0.".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.sim.loss_probability) {
            return Err(ConfigError::Validation(format!(
                "Loss probability {} is outside [0, 1].",
                self.sim.loss_probability
            )));
        }
        if self.sim.mean_print_micros == 0 {
            return Err(ConfigError::Validation(
                "Mean print interval must be greater than 0.".to_string(),
            ));
        }
        Ok(())
    }
}

pub fn handle_server() -> Result<ServerConfig> {
    let config: ServerConfig = load_or_create(Path::new(SERVER_CONFIG_FILE))?;
    config.validate()?;
    Ok(config)
}

pub fn handle_client() -> Result<ClientConfig> {
    let config: ClientConfig = load_or_create(Path::new(CLIENT_CONFIG_FILE))?;
    config.validate()?;
    Ok(config)
}

fn load_or_create<T>(path: &Path) -> Result<T>
where
    T: Serialize + DeserializeOwned + Default,
{
    if path.exists() {
        let config_content = fs::read_to_string(path)?;
        Ok(toml::from_str(&config_content)?)
    } else {
        let config = T::default();
        save(&config, path)?;
        Ok(config)
    }
}

fn save<T: Serialize>(config: &T, path: &Path) -> Result<()> {
    let config_content = toml::to_string_pretty(config)?;
    let mut file = fs::File::create(path)?;
    file.write_all(config_content.as_bytes())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        ServerConfig::default().validate().unwrap();
        ClientConfig::default().validate().unwrap();
    }

    #[test]
    fn bad_addresses_are_rejected() {
        let mut server = ServerConfig::default();
        server.network.bind = "not-an-address".to_string();
        assert!(matches!(
            server.validate(),
            Err(ConfigError::Validation(_))
        ));
    }

    #[test]
    fn loss_probability_must_be_a_probability() {
        let mut client = ClientConfig::default();
        client.sim.loss_probability = 1.5;
        assert!(client.validate().is_err());
        client.sim.loss_probability = -0.1;
        assert!(client.validate().is_err());
        client.sim.loss_probability = 0.3;
        assert!(client.validate().is_ok());
    }

    #[test]
    fn partial_files_fall_back_to_defaults() {
        let config: ClientConfig = toml::from_str("[sim]\nseed = 7\n").unwrap();
        assert_eq!(config.sim.seed, 7);
        assert_eq!(config.transfer.rcv_win, 16);
    }
}
