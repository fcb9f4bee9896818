//! D-Bus message utilities.
//!
//! [`Envelope`] is the view of a message the pump and match rules work with;
//! the builders create replies to zbus messages.

use std::fmt;

use zbus::message::{Message, Type as MessageType};
use zbus::names::BusName;
use zbus::zvariant::Type;

use crate::error::{MessageError, Result};

/// The four D-Bus message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    MethodCall,
    MethodReturn,
    Error,
    Signal,
}

impl MessageKind {
    /// Name used in match rules (`type='signal'`).
    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::MethodCall => "method_call",
            MessageKind::MethodReturn => "method_return",
            MessageKind::Error => "error",
            MessageKind::Signal => "signal",
        }
    }

    /// Parse a match-rule type name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "method_call" => Some(MessageKind::MethodCall),
            "method_return" => Some(MessageKind::MethodReturn),
            "error" => Some(MessageKind::Error),
            "signal" => Some(MessageKind::Signal),
            _ => None,
        }
    }

    /// Replies are correlated to calls by serial.
    pub fn is_reply(self) -> bool {
        matches!(self, MessageKind::MethodReturn | MessageKind::Error)
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Header view of a message.
pub trait Envelope {
    /// The message type.
    fn kind(&self) -> MessageKind;

    /// Get the serial number of the message.
    fn serial(&self) -> u32;

    /// Get the reply serial of the message (for replies).
    fn reply_serial(&self) -> Option<u32>;

    /// Get the path of the message.
    fn path_str(&self) -> Option<String>;

    /// Get the interface of the message.
    fn interface_str(&self) -> Option<String>;

    /// Get the member (method/signal name) of the message.
    fn member_str(&self) -> Option<String>;

    /// Get the sender of the message.
    fn sender_str(&self) -> Option<String>;

    /// Get the destination of the message.
    fn destination_str(&self) -> Option<String>;
}

impl Envelope for Message {
    fn kind(&self) -> MessageKind {
        match self.primary_header().msg_type() {
            MessageType::MethodCall => MessageKind::MethodCall,
            MessageType::MethodReturn => MessageKind::MethodReturn,
            MessageType::Error => MessageKind::Error,
            MessageType::Signal => MessageKind::Signal,
        }
    }

    fn serial(&self) -> u32 {
        self.primary_header().serial_num().get()
    }

    fn reply_serial(&self) -> Option<u32> {
        self.header().reply_serial().map(|n| n.get())
    }

    fn path_str(&self) -> Option<String> {
        self.header().path().map(|p| p.to_string())
    }

    fn interface_str(&self) -> Option<String> {
        self.header().interface().map(|i| i.to_string())
    }

    fn member_str(&self) -> Option<String> {
        self.header().member().map(|m| m.to_string())
    }

    fn sender_str(&self) -> Option<String> {
        self.header().sender().map(|s| s.to_string())
    }

    fn destination_str(&self) -> Option<String> {
        self.header().destination().map(|d| d.to_string())
    }
}

/// Whether `msg` is a call to `org.freedesktop.DBus.Introspectable.Introspect`.
pub fn is_introspect_call<E: Envelope>(msg: &E) -> bool {
    msg.kind() == MessageKind::MethodCall
        && msg.interface_str().as_deref() == Some(INTROSPECTABLE_INTERFACE)
        && msg.member_str().as_deref() == Some("Introspect")
}

/// Interface answered by the dispatch table itself.
pub const INTROSPECTABLE_INTERFACE: &str = "org.freedesktop.DBus.Introspectable";

/// Builder for creating D-Bus method return messages.
pub struct MethodReturnBuilder {
    original: Message,
    destination: Option<String>,
}

impl MethodReturnBuilder {
    /// Create a new method return builder from an original message.
    pub fn new(original: &Message) -> Self {
        Self {
            original: original.clone(),
            destination: None,
        }
    }

    /// Set the destination of the reply.
    pub fn destination(mut self, dest: impl Into<String>) -> Self {
        self.destination = Some(dest.into());
        self
    }

    /// Build the reply message with the given body.
    pub fn build<B: serde::Serialize + Type>(self, body: &B) -> Result<Message> {
        let mut builder = Message::method_return(&self.original.header())?;

        if let Some(dest) = &self.destination {
            let bus_name: BusName = dest
                .as_str()
                .try_into()
                .map_err(|e| MessageError::SerializeFailed(format!("Invalid destination: {}", e)))?;
            builder = builder.destination(bus_name)?;
        }

        Ok(builder.build(body)?)
    }

    /// Build an empty reply message.
    pub fn build_empty(self) -> Result<Message> {
        self.build(&())
    }
}

/// Builder for creating D-Bus error messages.
pub struct ErrorBuilder {
    original: Message,
    destination: Option<String>,
    error_name: String,
}

impl ErrorBuilder {
    /// Create a new error builder from an original message.
    pub fn new(original: &Message, error_name: impl Into<String>) -> Self {
        Self {
            original: original.clone(),
            destination: None,
            error_name: error_name.into(),
        }
    }

    /// Set the destination of the error.
    pub fn destination(mut self, dest: impl Into<String>) -> Self {
        self.destination = Some(dest.into());
        self
    }

    /// Build the error message with a message body.
    pub fn build(self, message: &str) -> Result<Message> {
        let error_name: zbus::names::ErrorName = self
            .error_name
            .as_str()
            .try_into()
            .map_err(|e| MessageError::SerializeFailed(format!("Invalid error name: {}", e)))?;

        let mut builder = Message::error(&self.original.header(), error_name)?;

        if let Some(dest) = &self.destination {
            let bus_name: BusName = dest
                .as_str()
                .try_into()
                .map_err(|e| MessageError::SerializeFailed(format!("Invalid destination: {}", e)))?;
            builder = builder.destination(bus_name)?;
        }

        Ok(builder.build(&(message,))?)
    }
}

/// Read the first string argument of a message body, as carried by error
/// replies and Introspect returns.
pub fn first_string_arg(msg: &Message) -> Option<String> {
    msg.body().deserialize::<(String,)>().ok().map(|(s,)| s)
}

/// Common D-Bus error names.
pub mod error_names {
    pub const UNKNOWN_METHOD: &str = "org.freedesktop.DBus.Error.UnknownMethod";
    pub const UNKNOWN_OBJECT: &str = "org.freedesktop.DBus.Error.UnknownObject";
    pub const FAILED: &str = "org.freedesktop.DBus.Error.Failed";
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call() -> Message {
        Message::method_call("/org/example/Obj", "Ping")
            .unwrap()
            .interface("org.example.Peer")
            .unwrap()
            .destination("org.example.Service")
            .unwrap()
            .build(&())
            .unwrap()
    }

    #[test]
    fn test_envelope_accessors() {
        let msg = call();
        assert_eq!(msg.kind(), MessageKind::MethodCall);
        assert_eq!(msg.path_str().as_deref(), Some("/org/example/Obj"));
        assert_eq!(msg.interface_str().as_deref(), Some("org.example.Peer"));
        assert_eq!(msg.member_str().as_deref(), Some("Ping"));
        assert_eq!(msg.destination_str().as_deref(), Some("org.example.Service"));
        assert_eq!(msg.reply_serial(), None);
        assert!(!is_introspect_call(&msg));
    }

    #[test]
    fn test_reply_builders() {
        let msg = call();

        let reply = MethodReturnBuilder::new(&msg).build(&("pong",)).unwrap();
        assert_eq!(reply.kind(), MessageKind::MethodReturn);
        assert_eq!(reply.reply_serial(), Some(msg.serial()));
        assert_eq!(first_string_arg(&reply).as_deref(), Some("pong"));

        let err = ErrorBuilder::new(&msg, error_names::FAILED).build("nope").unwrap();
        assert_eq!(err.kind(), MessageKind::Error);
        assert_eq!(err.reply_serial(), Some(msg.serial()));
        assert_eq!(first_string_arg(&err).as_deref(), Some("nope"));

        assert!(ErrorBuilder::new(&msg, "not an error name").build("x").is_err());
    }

    #[test]
    fn test_kind_names() {
        for kind in [
            MessageKind::MethodCall,
            MessageKind::MethodReturn,
            MessageKind::Error,
            MessageKind::Signal,
        ] {
            assert_eq!(MessageKind::from_name(kind.as_str()), Some(kind));
        }
        assert_eq!(MessageKind::from_name("bogus"), None);
        assert!(MessageKind::Error.is_reply());
        assert!(!MessageKind::Signal.is_reply());
    }
}
