use std::net::IpAddr;
use std::num::{NonZeroU32, NonZeroU64};

use axum::http::{header::HeaderName, Method};
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub listen_addr: String,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub cors: CorsConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8080".to_string(),
            rate_limit: RateLimitConfig::default(),
            cors: CorsConfig::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RateLimitConfig {
    #[serde(default = "RateLimitConfig::default_enabled")]
    pub enabled: bool,
    #[serde(default = "RateLimitConfig::default_window_ms")]
    pub window_ms: NonZeroU64,
    #[serde(default = "RateLimitConfig::default_extract_limit")]
    pub extract: RouteLimitConfig,
    #[serde(default = "RateLimitConfig::default_confirm_limit")]
    pub confirm: RouteLimitConfig,
    #[serde(default)]
    pub proxy_mode: ProxyMode,
    #[serde(default)]
    pub trusted_proxies: Vec<IpAddr>,
}

impl RateLimitConfig {
    fn default_enabled() -> bool {
        true
    }

    fn default_window_ms() -> NonZeroU64 {
        NonZeroU64::new(60_000).expect("non-zero window defaults to 60000ms")
    }

    fn default_extract_limit() -> RouteLimitConfig {
        RouteLimitConfig::extract_defaults()
    }

    fn default_confirm_limit() -> RouteLimitConfig {
        RouteLimitConfig::confirm_defaults()
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: Self::default_enabled(),
            window_ms: Self::default_window_ms(),
            extract: Self::default_extract_limit(),
            confirm: Self::default_confirm_limit(),
            proxy_mode: ProxyMode::Off,
            trusted_proxies: Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RouteLimitConfig {
    #[serde(default = "RouteLimitConfig::default_requests")]
    pub max_requests: NonZeroU32,
    #[serde(default = "RouteLimitConfig::default_burst")]
    pub burst: NonZeroU32,
}

impl RouteLimitConfig {
    fn default_requests() -> NonZeroU32 {
        NonZeroU32::new(1).expect("default requests bound must be non-zero")
    }

    fn default_burst() -> NonZeroU32 {
        NonZeroU32::new(1).expect("default burst bound must be non-zero")
    }

    fn extract_defaults() -> Self {
        Self {
            max_requests: NonZeroU32::new(20).expect("extract default must be non-zero"),
            burst: NonZeroU32::new(20).expect("extract burst must be non-zero"),
        }
    }

    fn confirm_defaults() -> Self {
        Self {
            max_requests: NonZeroU32::new(30).expect("confirm default must be non-zero"),
            burst: NonZeroU32::new(30).expect("confirm burst must be non-zero"),
        }
    }
}

impl Default for RouteLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: Self::default_requests(),
            burst: Self::default_burst(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct CorsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub allow_origins: Vec<String>,
    #[serde(default = "CorsConfig::default_allow_methods")]
    pub allow_methods: Vec<String>,
    #[serde(default = "CorsConfig::default_allow_headers")]
    pub allow_headers: Vec<String>,
    #[serde(default)]
    pub expose_headers: Vec<String>,
    #[serde(default)]
    pub allow_credentials: bool,
    #[serde(default = "CorsConfig::default_max_age_secs")]
    pub max_age_secs: u64,
}

impl CorsConfig {
    fn default_allow_methods() -> Vec<String> {
        vec!["GET".to_string(), "POST".to_string(), "OPTIONS".to_string()]
    }

    fn default_allow_headers() -> Vec<String> {
        vec![
            "authorization".to_string(),
            "content-type".to_string(),
            "x-actor-id".to_string(),
        ]
    }

    fn default_max_age_secs() -> u64 {
        600
    }
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            allow_origins: Vec::new(),
            allow_methods: Self::default_allow_methods(),
            allow_headers: Self::default_allow_headers(),
            expose_headers: Vec::new(),
            allow_credentials: false,
            max_age_secs: Self::default_max_age_secs(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProxyMode {
    #[default]
    Off,
    XForwardedFor,
    Forwarded,
}

pub fn parse_method(method: &str) -> Result<Method, String> {
    Method::from_bytes(method.as_bytes())
        .map_err(|_| format!("invalid HTTP method `{method}` in CORS allow_methods"))
}

pub fn parse_header(name: &str) -> Result<HeaderName, String> {
    HeaderName::from_bytes(name.as_bytes())
        .map_err(|_| format!("invalid HTTP header `{name}` in CORS configuration"))
}
