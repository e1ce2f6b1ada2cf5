use std::{env, fs, net::SocketAddr, path::PathBuf, str::FromStr};

use serde::{Deserialize, Serialize};
use webrtc::ice_transport::ice_server::RTCIceServer;

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub http: Http,
    #[serde(default)]
    pub record: Record,
    #[serde(default)]
    pub log: Log,
    #[serde(default = "default_ice_servers")]
    pub ice_servers: Vec<IceServer>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Http {
    #[serde(default = "default_http_listen")]
    pub listen: SocketAddr,
    #[serde(default = "default_http_cors")]
    pub cors: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Record {
    /// Directory the finished `.webm` files land in.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    /// `fname` hints at or above this length are ignored.
    #[serde(default = "default_max_fname_len")]
    pub max_fname_len: usize,
    /// Target duration of one WebM cluster.
    #[serde(default = "default_cluster_ms")]
    pub cluster_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Log {
    #[serde(default = "default_log_level")]
    pub level: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IceServer {
    #[serde(default)]
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub credential: String,
}

impl From<IceServer> for RTCIceServer {
    fn from(val: IceServer) -> Self {
        RTCIceServer {
            urls: val.urls,
            username: val.username,
            credential: val.credential,
            ..Default::default()
        }
    }
}

impl IceServer {
    fn validate(&self) -> anyhow::Result<()> {
        for url in &self.urls {
            let is_turn = url.starts_with("turn:") || url.starts_with("turns:");
            if is_turn && (self.username.is_empty() || self.credential.is_empty()) {
                anyhow::bail!("turn server {} requires username and credential", url);
            }
        }
        Ok(())
    }
}

pub fn default_ice_servers() -> Vec<IceServer> {
    vec![IceServer {
        urls: vec!["stun:stun.l.google.com:19302".to_string()],
        username: "".to_string(),
        credential: "".to_string(),
    }]
}

fn default_http_listen() -> SocketAddr {
    SocketAddr::from_str(&format!(
        "0.0.0.0:{}",
        env::var("PORT").unwrap_or(String::from("8888"))
    ))
    .expect("invalid listen address")
}

fn default_http_cors() -> bool {
    true
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("/tmp")
}

fn default_max_fname_len() -> usize {
    64
}

fn default_cluster_ms() -> u64 {
    1000
}

fn default_log_level() -> String {
    env::var("LOG_LEVEL").unwrap_or_else(|_| {
        if cfg!(debug_assertions) {
            "debug".to_string()
        } else {
            "info".to_string()
        }
    })
}

impl Default for Http {
    fn default() -> Self {
        Self {
            listen: default_http_listen(),
            cors: default_http_cors(),
        }
    }
}

impl Default for Record {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            max_fname_len: default_max_fname_len(),
            cluster_ms: default_cluster_ms(),
        }
    }
}

impl Default for Log {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    pub fn parse(path: Option<String>) -> Self {
        let result = fs::read_to_string(path.unwrap_or(String::from("rtc2webm.toml")))
            .or(fs::read_to_string("/etc/rtc2webm/config.toml"))
            .unwrap_or("".to_string());
        let cfg: Self = toml::from_str(result.as_str()).expect("config parse error");
        match cfg.validate() {
            Ok(_) => cfg,
            Err(err) => panic!("config validate [{}]", err),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        for ice_server in self.ice_servers.iter() {
            ice_server
                .validate()
                .map_err(|e| anyhow::anyhow!("ice_server error : {}", e))?;
        }
        if self.record.max_fname_len == 0 {
            anyhow::bail!("record.max_fname_len must be positive");
        }
        Ok(())
    }
}
