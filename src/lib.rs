//! kapsule-dbus-conn - D-Bus connection core.
//!
//! This crate implements the client and server side of a D-Bus connection:
//! the SASL authentication handshake (EXTERNAL, DBUS_COOKIE_SHA1, ANONYMOUS),
//! the message pump that correlates calls with replies over a single stream,
//! and the object path dispatch table that routes incoming calls, including
//! prefix-based fallback objects.

pub mod address;
pub mod auth;
pub mod codec;
pub mod command;
pub mod config;
pub mod connection;
pub mod cookie;
pub mod dispatch;
pub mod error;
pub mod match_rules;
pub mod mechanism;
pub mod message;
pub mod pump;
pub mod serial_map;

pub use auth::{AuthNegotiator, AuthOutcome, HandshakeState, Role};
pub use command::{AuthScheme, Command};
pub use config::ConnectionConfig;
pub use connection::Connection;
pub use cookie::CookieStore;
pub use dispatch::{DispatchTable, ObjectHandler};
pub use error::{Error, Result};
pub use pump::ConnectionPump;
