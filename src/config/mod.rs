use std::env;
use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;
use std::time::Duration;

use rand::Rng;

use crate::directory::{DirectoryConfig, DEFAULT_REQUEST_TIMEOUT_SECS};
use crate::error::{Result, RoomError};
use crate::room::{JoinRequest, RoomOptions};
use crate::session::Uid;

pub struct Config {
    pub server: ServerConfig,
    pub session: SessionConfig,
    pub directory: DirectoryConfig,
    /// Mount the in-memory membership backend next to the room routes
    pub serve_directory: bool,
    pub room: RoomOptions,
}

pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

pub struct SessionConfig {
    pub app_id: String,
    pub channel: String,
    pub token: Option<String>,
    pub uid: Uid,
    pub display_name: String,
}

impl SessionConfig {
    pub fn join_request(&self) -> JoinRequest {
        JoinRequest {
            app_id: self.app_id.clone(),
            channel: self.channel.clone(),
            token: self.token.clone(),
            uid: Some(self.uid.clone()),
            display_name: self.display_name.clone(),
        }
    }
}

fn required(key: &str) -> Result<String> {
    match env::var(key) {
        Ok(value) if !value.is_empty() => Ok(value),
        _ => Err(RoomError::MissingConfiguration(key.to_string())),
    }
}

fn parsed_or<T: FromStr>(key: &str, default: T) -> Result<T> {
    match env::var(key) {
        Ok(value) => value
            .parse()
            .map_err(|_| RoomError::InvalidConfiguration(format!("{}={}", key, value))),
        Err(_) => Ok(default),
    }
}

fn random_uid() -> Uid {
    let mut rng = rand::thread_rng();
    Uid::new(format!("{:06}", rng.gen_range(100000..999999)))
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();

        let server = ServerConfig {
            host: env::var("SERVER_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: parsed_or("SERVER_PORT", 8080)?,
        };

        let session = SessionConfig {
            app_id: required("SESSION_APP_ID")?,
            channel: required("SESSION_CHANNEL")?,
            token: env::var("SESSION_TOKEN").ok().filter(|t| !t.is_empty()),
            uid: env::var("SESSION_UID")
                .ok()
                .filter(|u| !u.is_empty())
                .map(Uid::from)
                .unwrap_or_else(random_uid),
            display_name: required("SESSION_DISPLAY_NAME")?,
        };

        let directory = DirectoryConfig {
            base_url: env::var("DIRECTORY_URL")
                .unwrap_or_else(|_| format!("http://127.0.0.1:{}", server.port)),
            request_timeout_secs: parsed_or("DIRECTORY_TIMEOUT_SECS", DEFAULT_REQUEST_TIMEOUT_SECS)?,
        };

        let defaults = RoomOptions::default();
        let room = RoomOptions {
            reconcile_interval: Duration::from_secs(parsed_or(
                "RECONCILE_INTERVAL_SECS",
                defaults.reconcile_interval.as_secs(),
            )?),
            prune_stale: parsed_or("RECONCILE_PRUNE_STALE", defaults.prune_stale)?,
            call_timeout: Duration::from_secs(parsed_or(
                "SESSION_CALL_TIMEOUT_SECS",
                defaults.call_timeout.as_secs(),
            )?),
            unload_grace: Duration::from_millis(parsed_or(
                "UNLOAD_GRACE_MS",
                defaults.unload_grace.as_millis() as u64,
            )?),
            lobby_path: env::var("LOBBY_PATH").unwrap_or(defaults.lobby_path),
        };

        if room.reconcile_interval.is_zero() {
            return Err(RoomError::InvalidConfiguration(
                "RECONCILE_INTERVAL_SECS must be positive".to_string(),
            ));
        }

        Ok(Self {
            server,
            session,
            directory,
            serve_directory: parsed_or("DIRECTORY_SERVE", true)?,
            room,
        })
    }

    pub fn bind_address(&self) -> ([u8; 4], u16) {
        let ip_addr = self.parse_host_to_ipv4();
        (ip_addr.octets(), self.server.port)
    }

    fn parse_host_to_ipv4(&self) -> Ipv4Addr {
        if let Ok(addr) = self.server.host.parse::<IpAddr>() {
            match addr {
                IpAddr::V4(ipv4) => return ipv4,
                IpAddr::V6(_) => {
                    tracing::warn!(
                        host = %self.server.host,
                        "IPv6 address provided but only IPv4 supported, using 0.0.0.0"
                    );
                    return Ipv4Addr::UNSPECIFIED;
                }
            }
        }

        match self.server.host.as_str() {
            "localhost" => Ipv4Addr::LOCALHOST,
            "" => Ipv4Addr::UNSPECIFIED,
            _ => {
                tracing::warn!(
                    host = %self.server.host,
                    "Unable to parse host as IPv4, using 0.0.0.0"
                );
                Ipv4Addr::UNSPECIFIED
            }
        }
    }
}
