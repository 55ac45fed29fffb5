use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Config, Environment, File};
use serde::Deserialize;

use crate::error::ChatResult;

const MAX_ATTACHMENT_SIZE: u64 = 100 * 1024 * 1024; // 100MB

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default = "default_bind_address")]
    pub bind_address: SocketAddr,
    #[serde(default = "default_static_dir")]
    pub static_dir: PathBuf,
    #[serde(default)]
    pub tls_cert_path: Option<PathBuf>,
    #[serde(default)]
    pub tls_key_path: Option<PathBuf>,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    #[serde(default = "default_typing_expiry_ms")]
    pub typing_expiry_ms: u64,
    #[serde(default = "default_typing_throttle_ms")]
    pub typing_throttle_ms: u64,
    #[serde(default = "default_max_attachment_bytes")]
    pub max_attachment_bytes: u64,
}

impl Settings {
    /// Reads `okr_chat.toml` (optional) and `OKR_CHAT__*` environment overrides.
    pub fn load() -> ChatResult<Self> {
        let settings = Config::builder()
            .add_source(File::with_name("okr_chat").required(false))
            .add_source(Environment::with_prefix("OKR_CHAT").separator("__"))
            .build()?
            .try_deserialize::<Settings>()?;
        Ok(settings)
    }

    pub fn typing_expiry(&self) -> Duration {
        Duration::from_millis(self.typing_expiry_ms)
    }

    pub fn typing_throttle(&self) -> Duration {
        Duration::from_millis(self.typing_throttle_ms)
    }

    /// Certificate and key paths, when both are configured.
    pub fn tls_paths(&self) -> Option<(&Path, &Path)> {
        match (&self.tls_cert_path, &self.tls_key_path) {
            (Some(cert), Some(key)) => Some((cert.as_path(), key.as_path())),
            _ => None,
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            bind_address: default_bind_address(),
            static_dir: default_static_dir(),
            tls_cert_path: None,
            tls_key_path: None,
            page_size: default_page_size(),
            typing_expiry_ms: default_typing_expiry_ms(),
            typing_throttle_ms: default_typing_throttle_ms(),
            max_attachment_bytes: default_max_attachment_bytes(),
        }
    }
}

fn default_bind_address() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 2052))
}

fn default_static_dir() -> PathBuf {
    PathBuf::from("public")
}

fn default_page_size() -> usize {
    50
}

fn default_typing_expiry_ms() -> u64 {
    4_000
}

fn default_typing_throttle_ms() -> u64 {
    2_000
}

fn default_max_attachment_bytes() -> u64 {
    MAX_ATTACHMENT_SIZE
}
