//! Error types for kapsule-dbus-conn.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::command::AuthScheme;

/// Result type alias for kapsule-dbus-conn operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur on a D-Bus connection.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// D-Bus error from zbus.
    #[error("D-Bus error: {0}")]
    DBus(#[from] zbus::Error),

    /// Authentication error.
    #[error("Authentication error: {0}")]
    Auth(#[from] AuthError),

    /// Keyring error.
    #[error("Keyring error: {0}")]
    Cookie(#[from] CookieError),

    /// Method call error.
    #[error("Call error: {0}")]
    Call(#[from] CallError),

    /// Object dispatch error.
    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    /// Message framing or parsing error.
    #[error("Message error: {0}")]
    Message(#[from] MessageError),

    /// Bus address error.
    #[error("Address error: {0}")]
    Address(#[from] AddressError),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Authentication-related errors.
#[derive(Debug, Error)]
pub enum AuthError {
    /// The peer rejected the mechanism we tried.
    #[error("Authentication mechanism rejected: {0}")]
    MechanismRejected(AuthScheme),

    /// Every mechanism both sides support has failed.
    #[error("No authentication mechanisms left to try")]
    Exhausted,

    /// The peer sent a line that cannot be parsed or is out of sequence.
    #[error("Authentication protocol violation: {0}")]
    ProtocolViolation(String),

    /// The DBUS_COOKIE_SHA1 secret could not be located.
    #[error("No cookie {id} in keyring context {context}")]
    CookieNotFound { context: String, id: u64 },

    /// Expected the null byte at the start of authentication.
    #[error("Expected null byte at start of authentication")]
    ExpectedNullByte,

    /// Invalid authentication data format.
    #[error("Invalid auth data: {0}")]
    InvalidData(String),

    /// Authentication timeout.
    #[error("Authentication timed out")]
    Timeout,
}

/// Errors raised by the cookie keyring.
#[derive(Debug, Error)]
pub enum CookieError {
    /// Reading or writing the keyring failed.
    #[error("Keyring I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The lock file could not be removed after a write.
    #[error("Failed to remove keyring lock {path}: {source}")]
    LockRemoval {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The temporary keyring file could not replace the original.
    #[error("Failed to move {from} over {to}: {source}")]
    Rename {
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },

    /// The context name is not usable as a keyring file name.
    #[error("Invalid keyring context: {0:?}")]
    InvalidContext(String),

    /// No home directory to place the keyring in.
    #[error("Cannot determine home directory for the keyring")]
    MissingHomeDirectory,
}

/// Errors returned to callers waiting on a method reply.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CallError {
    /// No reply arrived within the timeout.
    #[error("No reply within {0:?}")]
    Timeout(Duration),

    /// The connection is (or became) disconnected.
    #[error("Not connected")]
    NotConnected,

    /// A call with this serial is already waiting for its reply.
    #[error("Serial {0} already has a pending call")]
    DuplicateSerial(u32),

    /// The peer answered with an error reply.
    #[error("{name}: {message}")]
    Remote { name: String, message: String },
}

/// Errors raised by the object dispatch table.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The object path is malformed.
    #[error("Invalid object path: {0:?}")]
    InvalidPath(String),
}

/// Message-related errors.
#[derive(Debug, Error)]
pub enum MessageError {
    /// First header byte is neither 'l' nor 'B'.
    #[error("Invalid endianness marker: {0:#04x}")]
    InvalidEndianness(u8),

    /// Declared message length exceeds the protocol maximum.
    #[error("Message of {0} bytes exceeds the maximum size")]
    TooLarge(u64),

    /// Message body deserialization failed.
    #[error("Failed to deserialize message body: {0}")]
    DeserializeFailed(String),

    /// Message body serialization failed.
    #[error("Failed to serialize message body: {0}")]
    SerializeFailed(String),

    /// Message references file descriptors the connection cannot carry.
    #[error("Message carries {0} file descriptor(s), fd passing is not supported")]
    UnixFdsUnsupported(u32),
}

/// Bus address errors.
#[derive(Debug, Error)]
pub enum AddressError {
    /// The address string is malformed.
    #[error("Malformed address {0:?}")]
    Malformed(String),

    /// The transport is not supported.
    #[error("Unsupported transport: {0}")]
    UnsupportedTransport(String),

    /// A required key is missing.
    #[error("Address {address:?} is missing key {key}")]
    MissingKey { address: String, key: &'static str },
}

impl From<zbus::zvariant::Error> for Error {
    fn from(err: zbus::zvariant::Error) -> Self {
        Error::Message(MessageError::DeserializeFailed(err.to_string()))
    }
}
