//! # webphone-core
//!
//! Signaling orchestration for a browser-style SIP webphone layered on a
//! WebRTC media gateway with a SIP plugin.
//!
//! The crate does not parse SIP, negotiate ICE or move media. It decides
//! *when* the gateway should do those things and tracks the resulting state
//! on three axes:
//!
//! - **Connectivity** ([`ConnectivityState`]): the gateway session and the
//!   attached SIP handle, re-bootstrapped on network recovery.
//! - **Registration** ([`RegistrationState`]): REGISTER/UNREGISTER with a
//!   one-second retry timer and a self-healing timeout.
//! - **Extension** ([`ExtensionState`]): presence plus the single active
//!   [`CallSession`].
//!
//! The gateway itself is consumed through the async traits in [`gateway`];
//! its lifecycle notifications are fed back through a generation-stamped
//! [`gateway::GatewayEventSink`], so notifications from a torn-down session
//! never touch the current state.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use webphone_core::{
//!     ExtensionState, GatewayConfig, SipIdentity, WebphoneBuilder, WebphoneConfig, WebphoneEvent,
//! };
//!
//! # use webphone_core::{GatewayClient, WebphoneResult};
//! # async fn example(gateway: Arc<dyn GatewayClient>) -> WebphoneResult<()> {
//! let config = WebphoneConfig::new(GatewayConfig::new("gateway.example.com", 8989));
//! let phone = WebphoneBuilder::new(config).gateway(gateway).build()?;
//! let mut events = phone.subscribe();
//! phone.start().await;
//!
//! phone.register(SipIdentity::new("1000", "secret", "pbx.example.com", 5060)).await?;
//! while let Ok(event) = events.recv().await {
//!     if let WebphoneEvent::ExtensionChanged(change) = event {
//!         if change.current == ExtensionState::Idle {
//!             phone.start_call("1001").await?;
//!             break;
//!         }
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod call;
pub mod client;
pub mod error;
pub mod events;
pub mod gateway;
pub mod logging;
pub mod messages;
pub mod registration;

pub use call::{CallDirection, CallId, CallSession, ExtensionState, InCallStatus};
pub use client::config::{DebugLevel, GatewayConfig, IceServer};
pub use client::recovery::ReconnectPolicy;
pub use client::{ConnectivityState, Webphone, WebphoneBuilder, WebphoneConfig};
pub use error::{ErrorKind, ErrorRecord, WebphoneError, WebphoneResult};
pub use events::{StateChange, WebphoneEvent};
pub use gateway::{
    GatewayClient, GatewayError, GatewayEvent, GatewayEventSink, GatewaySession, Jsep, MediaFlags,
    MediaSink, MediaStream, PluginHandle,
};
pub use registration::{RegistrationState, SipIdentity, Transport};

/// webphone-core version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
