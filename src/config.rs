use jsonwebtoken::Algorithm;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::{
    error::{AdmissionError, Result},
    tier::Tier,
};

const MINUTE_MS: u64 = 60 * 1000;
const HOUR_MS: u64 = 60 * MINUTE_MS;

/// Top-level admission settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub token: TokenSettings,
    pub identity: IdentitySettings,
    pub tiers: TierSettings,
    pub classes: ClassSettings,
    /// Use the resolved tier's quota for the general bucket instead of the
    /// `general` class policy
    pub tiered_general: bool,
    pub store: StoreSettings,
    pub server: ServerSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            token: TokenSettings::default(),
            identity: IdentitySettings::default(),
            tiers: TierSettings::default(),
            classes: ClassSettings::default(),
            tiered_general: true,
            store: StoreSettings::default(),
            server: ServerSettings::default(),
        }
    }
}

/// Bearer token verification settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenSettings {
    pub secret: String,
    pub algorithm: Algorithm,
    pub clock_skew_tolerance_ms: u64,
    /// Lifetime of tokens minted by the issuer
    pub token_ttl_secs: u64,
}

impl Default for TokenSettings {
    fn default() -> Self {
        Self {
            secret: "your-secret-key-change-this".to_string(),
            algorithm: Algorithm::HS256,
            clock_skew_tolerance_ms: 0,
            token_ttl_secs: 7 * 24 * 3600,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentitySettings {
    /// Take the caller address from `X-Forwarded-For` when present
    pub trust_proxy_header: bool,
}

/// Request quota for one window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quota {
    pub limit: u64,
    pub window_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierOverride {
    pub subject: String,
    pub tier: Tier,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TierSettings {
    pub quotas: BTreeMap<Tier, Quota>,
    /// 0 disables tier caching
    pub cache_ttl_ms: u64,
    pub lookup_timeout_ms: u64,
    /// Static account tiers served by the built-in lookup
    pub overrides: Vec<TierOverride>,
}

impl Default for TierSettings {
    fn default() -> Self {
        let quotas = [
            (Tier::Free, 20),
            (Tier::Basic, 100),
            (Tier::Premium, 500),
            (Tier::Enterprise, 10_000),
        ]
        .into_iter()
        .map(|(tier, limit)| (tier, Quota { limit, window_ms: HOUR_MS }))
        .collect();

        Self {
            quotas,
            cache_ttl_ms: MINUTE_MS,
            lookup_timeout_ms: 2_000,
            overrides: Vec::new(),
        }
    }
}

/// Rate-limit class of the target endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointClass {
    General,
    Auth,
    Upload,
    Ai,
}

impl EndpointClass {
    pub const ALL: [EndpointClass; 4] = [
        EndpointClass::General,
        EndpointClass::Auth,
        EndpointClass::Upload,
        EndpointClass::Ai,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EndpointClass::General => "general",
            EndpointClass::Auth => "auth",
            EndpointClass::Upload => "upload",
            EndpointClass::Ai => "ai",
        }
    }
}

/// Fixed limit attached to an endpoint class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassPolicy {
    pub window_ms: u64,
    pub max_per_window: u64,
    /// Successful downstream outcomes are rolled back out of the count
    #[serde(default)]
    pub skip_successful_requests: bool,
}

impl ClassPolicy {
    pub fn quota(&self) -> Quota {
        Quota {
            limit: self.max_per_window,
            window_ms: self.window_ms,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassSettings {
    pub general: ClassPolicy,
    pub auth: ClassPolicy,
    pub upload: ClassPolicy,
    pub ai: ClassPolicy,
}

impl ClassSettings {
    pub fn policy(&self, class: EndpointClass) -> &ClassPolicy {
        match class {
            EndpointClass::General => &self.general,
            EndpointClass::Auth => &self.auth,
            EndpointClass::Upload => &self.upload,
            EndpointClass::Ai => &self.ai,
        }
    }
}

impl Default for ClassSettings {
    fn default() -> Self {
        Self {
            general: ClassPolicy {
                window_ms: 15 * MINUTE_MS,
                max_per_window: 100,
                skip_successful_requests: false,
            },
            auth: ClassPolicy {
                window_ms: 15 * MINUTE_MS,
                max_per_window: 5,
                skip_successful_requests: true,
            },
            upload: ClassPolicy {
                window_ms: HOUR_MS,
                max_per_window: 10,
                skip_successful_requests: false,
            },
            ai: ClassPolicy {
                window_ms: HOUR_MS,
                max_per_window: 50,
                skip_successful_requests: false,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Memory,
    Redis,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    pub backend: StoreBackend,
    /// Counters untouched for this long are evicted from memory
    pub idle_eviction_ms: u64,
    pub redis_url: String,
    pub key_prefix: String,
    pub connection_timeout_ms: u64,
    pub command_timeout_ms: u64,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            idle_eviction_ms: 2 * HOUR_MS,
            redis_url: "redis://localhost:6379".to_string(),
            key_prefix: "admission".to_string(),
            connection_timeout_ms: 5_000,
            command_timeout_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub listen: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8080".to_string(),
        }
    }
}

impl Settings {
    /// Layer an optional YAML file and `ADMISSION__*` environment variables
    /// over the built-in defaults, then validate.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("ADMISSION")
                .separator("__")
                .try_parsing(true),
        );

        let settings: Settings = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| AdmissionError::Config(format!("Failed to load settings: {}", e)))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Reject configurations that would otherwise fail at request time.
    pub fn validate(&self) -> Result<()> {
        if self.token.secret.is_empty() {
            return Err(AdmissionError::Config("token secret must not be empty".to_string()));
        }
        if !matches!(
            self.token.algorithm,
            Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512
        ) {
            return Err(AdmissionError::Config(format!(
                "unsupported token algorithm {:?}, expected an HMAC algorithm",
                self.token.algorithm
            )));
        }

        for tier in Tier::ALL {
            let quota = self.tiers.quotas.get(&tier).ok_or_else(|| {
                AdmissionError::Config(format!("tier quota for {} is missing", tier))
            })?;
            check_quota(&format!("tier {}", tier), quota)?;
        }

        let mut longest_window = self.tiers.quotas.values().map(|q| q.window_ms).max().unwrap_or(0);
        for class in EndpointClass::ALL {
            let quota = self.classes.policy(class).quota();
            check_quota(&format!("class {}", class.as_str()), &quota)?;
            longest_window = longest_window.max(quota.window_ms);
        }

        if self.tiers.lookup_timeout_ms == 0 {
            return Err(AdmissionError::Config("tier lookup timeout must be positive".to_string()));
        }
        if self.store.idle_eviction_ms < longest_window {
            return Err(AdmissionError::Config(format!(
                "idle eviction ({}ms) is shorter than the longest window ({}ms)",
                self.store.idle_eviction_ms, longest_window
            )));
        }
        if self.store.backend == StoreBackend::Redis && self.store.redis_url.is_empty() {
            return Err(AdmissionError::Config("redis backend requires redis_url".to_string()));
        }
        Ok(())
    }

    pub fn tier_quota(&self, tier: Tier) -> Quota {
        // validate() guarantees every tier is present
        self.tiers
            .quotas
            .get(&tier)
            .copied()
            .unwrap_or(Quota { limit: 0, window_ms: HOUR_MS })
    }
}

fn check_quota(name: &str, quota: &Quota) -> Result<()> {
    if quota.limit == 0 {
        return Err(AdmissionError::Config(format!("{} limit must be positive", name)));
    }
    if quota.window_ms == 0 {
        return Err(AdmissionError::Config(format!("{} window must be positive", name)));
    }
    Ok(())
}

/// Load settings from a YAML string
pub fn load_config_from_yaml(yaml: &str) -> Result<Settings> {
    let settings: Settings = serde_yaml::from_str(yaml)?;
    settings.validate()?;
    Ok(settings)
}

/// Load settings from a YAML file
pub fn load_config_from_file(path: &str) -> Result<Settings> {
    let content = std::fs::read_to_string(path)?;
    load_config_from_yaml(&content)
}
