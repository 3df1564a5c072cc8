//! Webphone configuration
//!
//! All options are fixed at construction time and validated by
//! [`WebphoneConfig::validate`] before the webphone first touches the
//! gateway. Configuration can be assembled in code or loaded from TOML:
//!
//! ```rust
//! use webphone_core::client::config::{DebugLevel, WebphoneConfig};
//!
//! let config = WebphoneConfig::from_toml_str(r#"
//!     register_timeout_secs = 20
//!     debug = "minimal"
//!
//!     [gateway]
//!     server = "gateway.example.com"
//!     port = 8989
//!     endpoint = "/janus"
//!     protocol = "wss"
//!
//!     [[ice_servers]]
//!     urls = "stun:stun.example.com:3478"
//! "#).unwrap();
//!
//! assert_eq!(config.gateway_url().unwrap(), "wss://gateway.example.com:8989/janus");
//! assert_eq!(config.debug, DebugLevel::Minimal);
//! ```

use serde::{Deserialize, Deserializer, Serialize};
use url::Url;

use crate::client::recovery::ReconnectPolicy;
use crate::error::{WebphoneError, WebphoneResult};
use crate::gateway::SessionConfig;
use crate::registration::SipIdentity;

/// Default seconds to wait for a registration response
pub const DEFAULT_REGISTER_TIMEOUT_SECS: u64 = 30;

const SUPPORTED_PROTOCOLS: &[&str] = &["ws", "wss", "http", "https"];

/// Address of the media gateway
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub server: String,
    pub port: u16,
    /// Path of the gateway API, e.g. `/janus`
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    /// `ws`, `wss`, `http` or `https`
    #[serde(default = "default_protocol")]
    pub protocol: String,
}

fn default_endpoint() -> String {
    "/janus".to_string()
}

fn default_protocol() -> String {
    "wss".to_string()
}

impl GatewayConfig {
    pub fn new(server: impl Into<String>, port: u16) -> Self {
        Self {
            server: server.into(),
            port,
            endpoint: default_endpoint(),
            protocol: default_protocol(),
        }
    }

    /// `protocol://server:port/endpoint`
    pub fn url(&self) -> String {
        format!("{}://{}:{}{}", self.protocol, self.server, self.port, self.endpoint)
    }
}

/// STUN/TURN server handed to the gateway session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    #[serde(deserialize_with = "one_or_many")]
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }

    pub fn turn(
        url: impl Into<String>,
        username: impl Into<String>,
        credential: impl Into<String>,
    ) -> Self {
        Self {
            urls: vec![url.into()],
            username: Some(username.into()),
            credential: Some(credential.into()),
        }
    }
}

fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(url) => vec![url],
        OneOrMany::Many(urls) => urls,
    })
}

/// Log level understood by the gateway library
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GatewayLogLevel {
    Error,
    Warn,
    Log,
    Vdebug,
    Debug,
    Trace,
}

/// Debug verbosity
///
/// Accepts `true`/`false`, `"all"`, `"minimal"` or a list of gateway log
/// levels. `Minimal` enables this crate's own logging but keeps the gateway
/// library quiet.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(try_from = "RawDebugLevel")]
pub enum DebugLevel {
    #[default]
    Off,
    Minimal,
    All,
    Levels(Vec<GatewayLogLevel>),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawDebugLevel {
    Flag(bool),
    Named(String),
    Levels(Vec<GatewayLogLevel>),
}

impl TryFrom<RawDebugLevel> for DebugLevel {
    type Error = String;

    fn try_from(raw: RawDebugLevel) -> Result<Self, Self::Error> {
        match raw {
            RawDebugLevel::Flag(true) => Ok(DebugLevel::All),
            RawDebugLevel::Flag(false) => Ok(DebugLevel::Off),
            RawDebugLevel::Named(name) => match name.as_str() {
                "all" => Ok(DebugLevel::All),
                "minimal" => Ok(DebugLevel::Minimal),
                "off" | "none" => Ok(DebugLevel::Off),
                other => Err(format!("unknown debug level '{}'", other)),
            },
            RawDebugLevel::Levels(levels) => Ok(DebugLevel::Levels(levels)),
        }
    }
}

impl DebugLevel {
    /// Level passed to the gateway library's `initialize`
    pub fn for_gateway(&self) -> DebugLevel {
        match self {
            DebugLevel::Minimal => DebugLevel::Off,
            other => other.clone(),
        }
    }

    /// `tracing` filter directive for this crate
    pub fn log_filter(&self) -> &'static str {
        match self {
            DebugLevel::Off => "webphone_core=off",
            DebugLevel::Minimal => "webphone_core=info",
            DebugLevel::All => "webphone_core=trace",
            DebugLevel::Levels(levels) => match levels.iter().max() {
                Some(GatewayLogLevel::Trace) => "webphone_core=trace",
                Some(GatewayLogLevel::Debug) | Some(GatewayLogLevel::Vdebug) => {
                    "webphone_core=debug"
                }
                Some(GatewayLogLevel::Log) => "webphone_core=info",
                Some(GatewayLogLevel::Warn) => "webphone_core=warn",
                Some(GatewayLogLevel::Error) => "webphone_core=error",
                None => "webphone_core=off",
            },
        }
    }
}

/// Complete webphone configuration
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct WebphoneConfig {
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub ice_servers: Vec<IceServer>,
    #[serde(default)]
    pub with_credentials: bool,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub api_secret: Option<String>,
    /// Outbound proxy URI; defaults to `sip:<domain>:<port>` of the identity
    #[serde(default)]
    pub proxy: Option<String>,
    /// Seconds without a registration response before the session is reset
    #[serde(default = "default_register_timeout")]
    pub register_timeout_secs: u64,
    #[serde(default)]
    pub debug: DebugLevel,
    /// Register this identity as soon as the SIP handle is attached
    #[serde(default)]
    pub auto_register: Option<SipIdentity>,
    #[serde(default)]
    pub reconnect: ReconnectPolicy,
}

fn default_register_timeout() -> u64 {
    DEFAULT_REGISTER_TIMEOUT_SECS
}

impl WebphoneConfig {
    pub fn new(gateway: GatewayConfig) -> Self {
        Self {
            gateway,
            ice_servers: Vec::new(),
            with_credentials: false,
            token: None,
            api_secret: None,
            proxy: None,
            register_timeout_secs: DEFAULT_REGISTER_TIMEOUT_SECS,
            debug: DebugLevel::Off,
            auto_register: None,
            reconnect: ReconnectPolicy::default(),
        }
    }

    pub fn from_toml_str(source: &str) -> WebphoneResult<Self> {
        let config: WebphoneConfig = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Gateway URL, checked to be well formed
    pub fn gateway_url(&self) -> WebphoneResult<String> {
        let raw = self.gateway.url();
        Url::parse(&raw)
            .map_err(|e| WebphoneError::invalid_configuration("gateway", e.to_string()))?;
        Ok(raw)
    }

    pub fn validate(&self) -> WebphoneResult<()> {
        if self.gateway.server.trim().is_empty() {
            return Err(WebphoneError::invalid_configuration(
                "gateway.server",
                "must not be empty",
            ));
        }
        if self.gateway.port == 0 {
            return Err(WebphoneError::invalid_configuration(
                "gateway.port",
                "must not be zero",
            ));
        }
        if !SUPPORTED_PROTOCOLS.contains(&self.gateway.protocol.as_str()) {
            return Err(WebphoneError::invalid_configuration(
                "gateway.protocol",
                format!("'{}' is not one of ws, wss, http, https", self.gateway.protocol),
            ));
        }
        if !self.gateway.endpoint.starts_with('/') {
            return Err(WebphoneError::invalid_configuration(
                "gateway.endpoint",
                "must start with '/'",
            ));
        }
        if self.register_timeout_secs == 0 {
            return Err(WebphoneError::invalid_configuration(
                "register_timeout_secs",
                "must be greater than zero",
            ));
        }
        if let Some(server) = self.ice_servers.iter().find(|s| s.urls.is_empty()) {
            return Err(WebphoneError::invalid_configuration(
                "ice_servers",
                format!("server without urls ({:?})", server.username),
            ));
        }
        if let Some(identity) = &self.auto_register {
            if identity.authuser.is_empty() || identity.domain.is_empty() {
                return Err(WebphoneError::invalid_configuration(
                    "auto_register",
                    "authuser and domain are required",
                ));
            }
        }
        self.gateway_url()?;
        Ok(())
    }

    /// Parameters for `GatewayClient::open_session`
    pub fn session_config(&self) -> WebphoneResult<SessionConfig> {
        Ok(SessionConfig {
            server: self.gateway_url()?,
            ice_servers: self.ice_servers.clone(),
            with_credentials: self.with_credentials,
            token: self.token.clone(),
            api_secret: self.api_secret.clone(),
        })
    }
}
