//! Builder for [`Webphone`] instances
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use webphone_core::{GatewayConfig, WebphoneBuilder, WebphoneConfig};
//! # use webphone_core::{GatewayClient, WebphoneResult};
//! # fn example(gateway: Arc<dyn GatewayClient>) -> WebphoneResult<()> {
//! let config = WebphoneConfig::new(GatewayConfig::new("gateway.example.com", 8989));
//! let phone = WebphoneBuilder::new(config)
//!     .gateway(gateway)
//!     .register_timeout_secs(15)
//!     .online(true)
//!     .build()?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use super::config::{DebugLevel, IceServer, WebphoneConfig};
use super::recovery::ReconnectPolicy;
use super::Webphone;
use crate::error::{WebphoneError, WebphoneResult};
use crate::gateway::{GatewayClient, MediaSink};
use crate::registration::SipIdentity;

/// Capacity of the observer broadcast channel
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Fluent construction of a [`Webphone`]
pub struct WebphoneBuilder {
    config: WebphoneConfig,
    gateway: Option<Arc<dyn GatewayClient>>,
    local_media: Option<Arc<dyn MediaSink>>,
    remote_media: Option<Arc<dyn MediaSink>>,
    online: bool,
    event_capacity: usize,
}

impl WebphoneBuilder {
    pub fn new(config: WebphoneConfig) -> Self {
        Self {
            config,
            gateway: None,
            local_media: None,
            remote_media: None,
            online: true,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }

    /// Gateway library to drive (required)
    pub fn gateway(mut self, gateway: Arc<dyn GatewayClient>) -> Self {
        self.gateway = Some(gateway);
        self
    }

    /// Output for the local capture stream
    pub fn local_media_sink(mut self, sink: Arc<dyn MediaSink>) -> Self {
        self.local_media = Some(sink);
        self
    }

    /// Output for the remote stream
    pub fn remote_media_sink(mut self, sink: Arc<dyn MediaSink>) -> Self {
        self.remote_media = Some(sink);
        self
    }

    /// Host network state at startup
    pub fn online(mut self, online: bool) -> Self {
        self.online = online;
        self
    }

    pub fn ice_server(mut self, server: IceServer) -> Self {
        self.config.ice_servers.push(server);
        self
    }

    pub fn register_timeout_secs(mut self, seconds: u64) -> Self {
        self.config.register_timeout_secs = seconds;
        self
    }

    pub fn debug(mut self, level: DebugLevel) -> Self {
        self.config.debug = level;
        self
    }

    pub fn auto_register(mut self, identity: SipIdentity) -> Self {
        self.config.auto_register = Some(identity);
        self
    }

    pub fn reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.config.reconnect = policy;
        self
    }

    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    /// Validate the configuration and create the webphone.
    ///
    /// Nothing touches the gateway until [`Webphone::start`].
    pub fn build(self) -> WebphoneResult<Webphone> {
        self.config.validate()?;
        let gateway = self.gateway.ok_or_else(|| {
            WebphoneError::invalid_configuration("gateway", "a gateway client is required")
        })?;
        if self.event_capacity == 0 {
            return Err(WebphoneError::invalid_configuration(
                "event_capacity",
                "must be greater than zero",
            ));
        }

        Ok(Webphone::new(
            self.config,
            gateway,
            self.local_media,
            self.remote_media,
            self.online,
            self.event_capacity,
        ))
    }
}
