use {serde::Deserialize, std::time::Duration};

/// Configuration of the share manager.
///
/// The address and credential options describe how the embedding service
/// reaches the blob store; the library parses and validates them and hands
/// them back through accessors, the store driver itself lives with the
/// embedder.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Config {
    /// Address of the blob-store front-end.
    pub gateway_addr: String,

    /// Address of the blob-store data plane. Defaults to the gateway.
    #[serde(default)]
    pub provider_addr: Option<String>,

    /// Identity under which the manager authenticates to the blob store.
    pub service_user_id: String,
    pub service_user_idp: String,

    /// Credential for the service user.
    pub machine_auth_apikey: String,

    /// How long synced created/received indices are trusted before the next
    /// blob-store round-trip. Zero syncs on every read.
    #[serde(with = "humantime_serde", default = "default_ttl")]
    pub ttl: Duration,
}

fn default_ttl() -> Duration {
    Duration::from_secs(30)
}

impl Config {
    pub fn provider_addr(&self) -> &str {
        self.provider_addr.as_deref().unwrap_or(&self.gateway_addr)
    }
}
