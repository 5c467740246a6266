//! Static configuration and the credential loader that fetches dynamic
//! values (ICE servers, MQTT broker list) once per process and caches them.

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::warn;

use crate::envelope::Platform;
use crate::error::FacadeError;
use crate::webrtc_peer::IceServerConfig;

/// Static, caller-supplied configuration for one facade instance.
#[derive(Debug, Clone)]
pub struct Config {
    pub display_name: String,
    pub platform: Platform,
    /// Overrides the credential loader's broker list when non-empty.
    pub static_mqtt_brokers: Vec<String>,
    /// Overrides the credential loader's ICE server list when non-empty.
    pub static_ice_servers: Vec<IceServerConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            display_name: "Anonymous".to_string(),
            platform: Platform::Linux,
            static_mqtt_brokers: Vec::new(),
            static_ice_servers: Vec::new(),
        }
    }
}

/// Source of dynamically-fetched values the facade needs before it can
/// join a room. Failures are logged and tolerated — same-host signaling
/// still works with no brokers and the default STUN-only ICE config.
#[async_trait]
pub trait CredentialLoader: Send + Sync {
    async fn ice_servers(&self) -> Result<Vec<IceServerConfig>, FacadeError>;
    async fn mqtt_brokers(&self) -> Result<Vec<String>, FacadeError>;
}

/// `reqwest`-backed default implementation: GETs two JSON endpoints once
/// and caches the results for the rest of the process's life.
pub struct HttpCredentialLoader {
    client: reqwest::Client,
    ice_servers_url: String,
    mqtt_brokers_url: String,
    cached_ice: RwLock<Option<Vec<IceServerConfig>>>,
    cached_brokers: RwLock<Option<Vec<String>>>,
}

impl HttpCredentialLoader {
    pub fn new(ice_servers_url: String, mqtt_brokers_url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            ice_servers_url,
            mqtt_brokers_url,
            cached_ice: RwLock::new(None),
            cached_brokers: RwLock::new(None),
        }
    }
}

#[derive(serde::Deserialize)]
struct IceServerEntry {
    urls: Vec<String>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    credential: Option<String>,
}

#[derive(serde::Deserialize)]
struct BrokerEntry {
    url: String,
}

#[async_trait]
impl CredentialLoader for HttpCredentialLoader {
    async fn ice_servers(&self) -> Result<Vec<IceServerConfig>, FacadeError> {
        if let Some(cached) = self.cached_ice.read().await.clone() {
            return Ok(cached);
        }
        let entries: Vec<IceServerEntry> = self
            .client
            .get(&self.ice_servers_url)
            .send()
            .await
            .map_err(|e| FacadeError::CredentialLoad(e.to_string()))?
            .json()
            .await
            .map_err(|e| FacadeError::CredentialLoad(e.to_string()))?;

        let servers: Vec<IceServerConfig> = entries
            .into_iter()
            .map(|e| IceServerConfig { urls: e.urls, username: e.username, credential: e.credential })
            .collect();
        *self.cached_ice.write().await = Some(servers.clone());
        Ok(servers)
    }

    async fn mqtt_brokers(&self) -> Result<Vec<String>, FacadeError> {
        if let Some(cached) = self.cached_brokers.read().await.clone() {
            return Ok(cached);
        }
        let entries: Vec<BrokerEntry> = self
            .client
            .get(&self.mqtt_brokers_url)
            .send()
            .await
            .map_err(|e| FacadeError::CredentialLoad(e.to_string()))?
            .json()
            .await
            .map_err(|e| FacadeError::CredentialLoad(e.to_string()))?;

        let urls: Vec<String> = entries.into_iter().map(|e| e.url).collect();
        *self.cached_brokers.write().await = Some(urls.clone());
        Ok(urls)
    }
}

/// Resolve the effective broker/ICE lists for a join: config overrides win,
/// otherwise fall back to the loader, tolerating its failure.
pub async fn resolve_brokers(config: &Config, loader: &dyn CredentialLoader) -> Vec<String> {
    if !config.static_mqtt_brokers.is_empty() {
        return config.static_mqtt_brokers.clone();
    }
    match loader.mqtt_brokers().await {
        Ok(brokers) => brokers,
        Err(e) => {
            warn!("mqtt broker list load failed, continuing with none: {e}");
            Vec::new()
        }
    }
}

pub async fn resolve_ice_servers(config: &Config, loader: &dyn CredentialLoader) -> Vec<IceServerConfig> {
    if !config.static_ice_servers.is_empty() {
        return config.static_ice_servers.clone();
    }
    match loader.ice_servers().await {
        Ok(servers) => servers,
        Err(e) => {
            warn!("ice server list load failed, falling back to default stun: {e}");
            Vec::new()
        }
    }
}
