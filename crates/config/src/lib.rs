use config::{Config, ConfigError, Environment};
use serde::{Deserialize, Serialize};

/// Top-level settings for the gateway process.
///
/// Every field can be overridden from the environment with the `VOXGATE`
/// prefix and `__` as the nesting separator, e.g.
/// `VOXGATE__SERVER__PORT=9443` or `VOXGATE__ADMISSION__FREE_LIMIT=10`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub heartbeat: HeartbeatSettings,
    #[serde(default)]
    pub admission: AdmissionSettings,
    #[serde(default)]
    pub auth: AuthSettings,
    #[serde(default)]
    pub providers: ProviderSettings,
    #[serde(default)]
    pub usage: UsageSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    pub host: String,
    /// WebSocket gateway port. Deliberately separate from the regular
    /// request/response API so the two can be scaled and fronted
    /// independently (sticky routing applies only to this one).
    pub port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 9090,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatSettings {
    /// Interval between liveness sweeps. A connection that misses two
    /// consecutive sweeps is force-closed.
    pub interval_secs: u64,
}

impl Default for HeartbeatSettings {
    fn default() -> Self {
        Self { interval_secs: 30 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionSettings {
    /// Fixed admission window length in seconds.
    pub window_secs: u64,
    /// Cap on admitted units of work across all identities per window.
    pub global_limit: u32,
    pub free_limit: u32,
    pub pro_limit: u32,
    pub enterprise_limit: u32,
    /// Interval between stale-window sweeps.
    pub sweep_interval_secs: u64,
}

impl Default for AdmissionSettings {
    fn default() -> Self {
        Self {
            window_secs: 60,
            global_limit: 1000,
            free_limit: 20,
            pro_limit: 120,
            enterprise_limit: 600,
            sweep_interval_secs: 300,
        }
    }
}

impl AdmissionSettings {
    /// Resolves the per-window limit for a plan tier. Unknown tiers get
    /// the free limit.
    pub fn limit_for_plan(&self, plan: &str) -> u32 {
        match plan {
            "pro" => self.pro_limit,
            "enterprise" => self.enterprise_limit,
            _ => self.free_limit,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthSettings {
    pub jwt_secret: String,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            jwt_secret: "dev-secret-change-me".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderSettings {
    pub deepgram_api_key: Option<String>,
    pub deepgram_url: String,
    pub openai_api_key: Option<String>,
    pub openai_base_url: String,
    /// Model used by the batch transcription adapter.
    pub whisper_model: String,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            deepgram_api_key: None,
            deepgram_url: "wss://api.deepgram.com/v1/listen".to_string(),
            openai_api_key: None,
            openai_base_url: "https://api.openai.com/v1".to_string(),
            whisper_model: "whisper-1".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UsageSettings {
    /// Endpoint that receives usage records as JSON POSTs. When unset,
    /// records are kept in memory only.
    pub sink_url: Option<String>,
}

impl Settings {
    pub fn load() -> Result<Self, ConfigError> {
        let cfg = Config::builder()
            .add_source(Environment::with_prefix("VOXGATE").separator("__"))
            .build()?;
        cfg.try_deserialize()
    }
}
