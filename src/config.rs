use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::{
    error::{GatekeeperError, Result},
    identity::Scope,
    policy::{FixedWindowPolicy, RoutePolicy, TokenBucketPolicy, DEFAULT_IDLE_TTL},
    redis::RedisConfig,
    shared::DEFAULT_KEY_PREFIX,
};

/// Service settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default = "default_http_addr")]
    pub http_addr: String,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    /// Capacity of the local deny cache for shared limiters; 0 disables it
    #[serde(default)]
    pub local_deny_cache_size: u64,
    #[serde(default)]
    pub redis: Option<RedisSettings>,
    /// Applied to every request before any route limit
    #[serde(default)]
    pub global: Option<LimitSettings>,
    #[serde(default)]
    pub routes: Vec<RouteSettings>,
}

/// Shared store connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisSettings {
    pub url: String,
    #[serde(default = "default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
    #[serde(default = "default_expire_nx")]
    pub expire_nx: bool,
}

/// A limit and the identity it is keyed on
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitSettings {
    pub scope: Scope,
    pub token_bucket: Option<TokenBucketSettings>,
    pub fixed_window: Option<FixedWindowSettings>,
}

/// A limit bound to one path
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteSettings {
    pub path: String,
    pub scope: Scope,
    pub token_bucket: Option<TokenBucketSettings>,
    pub fixed_window: Option<FixedWindowSettings>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenBucketSettings {
    pub rate_per_second: f64,
    pub burst: u32,
    #[serde(default = "default_idle_ttl_secs")]
    pub idle_ttl_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixedWindowSettings {
    pub limit: u32,
    pub window_secs: u64,
}

/// Validated limit ready for limiter selection
#[derive(Debug, Clone)]
pub struct CompiledLimit {
    /// `None` for the global limit
    pub path: Option<String>,
    pub scope: Scope,
    pub policy: RoutePolicy,
}

fn default_http_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_sweep_interval_secs() -> u64 {
    60
}

fn default_key_prefix() -> String {
    DEFAULT_KEY_PREFIX.to_string()
}

fn default_connection_timeout_ms() -> u64 {
    5_000
}

fn default_command_timeout_ms() -> u64 {
    100
}

fn default_expire_nx() -> bool {
    true
}

fn default_idle_ttl_secs() -> u64 {
    DEFAULT_IDLE_TTL.as_secs()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            http_addr: default_http_addr(),
            sweep_interval_secs: default_sweep_interval_secs(),
            key_prefix: default_key_prefix(),
            local_deny_cache_size: 0,
            redis: None,
            global: None,
            routes: Vec::new(),
        }
    }
}

impl Settings {
    /// Load settings from an optional file, overridden by `GATEKEEPER__*` environment variables
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("GATEKEEPER")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let settings: Settings = builder.build()?.try_deserialize()?;
        Ok(settings)
    }

    /// Parse settings from a YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn redis_config(&self) -> Option<RedisConfig> {
        self.redis.as_ref().map(|redis| RedisConfig {
            url: redis.url.clone(),
            connection_timeout: Duration::from_millis(redis.connection_timeout_ms),
            command_timeout: Duration::from_millis(redis.command_timeout_ms),
            expire_nx: redis.expire_nx,
        })
    }

    /// Validate every limit. Any invalid policy is fatal.
    pub fn compile(&self) -> Result<Vec<CompiledLimit>> {
        if self.sweep_interval_secs == 0 {
            return Err(GatekeeperError::Config(
                "sweep_interval_secs must be greater than zero".to_string(),
            ));
        }

        let mut limits = Vec::with_capacity(self.routes.len() + 1);

        if let Some(global) = &self.global {
            limits.push(CompiledLimit {
                path: None,
                scope: global.scope,
                policy: compile_policy(
                    "global",
                    global.token_bucket.as_ref(),
                    global.fixed_window.as_ref(),
                )?,
            });
        }

        for route in &self.routes {
            if !route.path.starts_with('/') {
                return Err(GatekeeperError::Config(format!(
                    "route path must start with '/': {}",
                    route.path
                )));
            }
            if limits.iter().any(|l| l.path.as_deref() == Some(route.path.as_str())) {
                return Err(GatekeeperError::Config(format!(
                    "duplicate route: {}",
                    route.path
                )));
            }

            limits.push(CompiledLimit {
                path: Some(route.path.clone()),
                scope: route.scope,
                policy: compile_policy(
                    &route.path,
                    route.token_bucket.as_ref(),
                    route.fixed_window.as_ref(),
                )?,
            });
        }

        Ok(limits)
    }
}

fn compile_policy(
    name: &str,
    token_bucket: Option<&TokenBucketSettings>,
    fixed_window: Option<&FixedWindowSettings>,
) -> Result<RoutePolicy> {
    let context = |e: GatekeeperError| match e {
        GatekeeperError::InvalidPolicy(msg) => GatekeeperError::InvalidPolicy(format!("{}: {}", name, msg)),
        other => other,
    };

    let bucket = token_bucket
        .map(|tb| {
            TokenBucketPolicy::new(
                tb.rate_per_second,
                tb.burst,
                Duration::from_secs(tb.idle_ttl_secs),
            )
        })
        .transpose()
        .map_err(context)?;
    let window = fixed_window
        .map(|fw| FixedWindowPolicy::new(fw.limit, Duration::from_secs(fw.window_secs)))
        .transpose()
        .map_err(context)?;

    RoutePolicy::new(bucket, window).map_err(context)
}
