//! Client session for the Helix gateway WebSocket protocol.
//!
//! [`GatewaySession`] owns one connection and keeps it alive: it answers the
//! server's `connect.challenge`, performs the `connect` handshake, correlates
//! request/response frames by id, fans inbound events out to subscribers in
//! receipt order and reconnects with exponential backoff after any close.
//!
//! ```rust,ignore
//! use helix_gateway::{GatewaySession, SessionConfig, methods};
//!
//! let session = GatewaySession::new(SessionConfig::default());
//! session.events().subscribe(|event| println!("{}", event.name()));
//! session.start();
//!
//! let snapshot = session.request(methods::APPROVALS_SNAPSHOT, serde_json::json!({})).await?;
//! ```

pub mod backoff;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod methods;
pub mod protocol;
pub mod session;

pub use backoff::{BackoffConfig, ReconnectScheduler};
pub use dispatch::{EventBus, SequenceStats, SubscriptionId};
pub use error::{GatewayError, Result, TransportError};
pub use events::{
    ApprovalRequested, ApprovalResolved, Challenge, GatewayEvent, NodeInvokeRequest, Shutdown,
};
pub use protocol::{ErrorShape, HandshakeConfig, HelloOk, PROTOCOL_VERSION};
pub use session::{ConnectionState, GatewaySession, SessionConfig, SessionObserver};
