//! Wire codec seam.
//!
//! The pump only needs to turn bytes into messages and back, and to ask a few
//! questions of each message ([`Envelope`]). [`ZbusCodec`] is the real D-Bus
//! implementation; tests plug in simpler ones.

use tracing::trace;
use zbus::message::{self, Message};
use zbus::zvariant::{serialized, Endian};

use crate::error::MessageError;
use crate::message::{error_names, Envelope, ErrorBuilder, MethodReturnBuilder};

/// Largest message D-Bus allows (128 MiB).
pub const MAX_MESSAGE_SIZE: u64 = 128 * 1024 * 1024;

/// Size of the fixed part of a D-Bus message header.
const FIXED_HEADER_LEN: usize = 16;

/// Encodes and decodes messages for one connection.
pub trait Codec: Clone + Send + Sync + 'static {
    /// The message type carried by this codec.
    type Message: Envelope + Clone + Send + Sync + 'static;

    /// Serialize a message.
    fn encode(&self, msg: &Self::Message) -> Result<Vec<u8>, MessageError>;

    /// Decode one message from the front of `buf`.
    ///
    /// Returns `Ok(None)` if `buf` does not yet hold a complete message,
    /// otherwise the message and the number of bytes it occupied.
    fn decode(&self, buf: &[u8]) -> Result<Option<(Self::Message, usize)>, MessageError>;

    /// Error reply for a call that no object handles.
    fn unknown_object(&self, _call: &Self::Message) -> Option<Self::Message> {
        None
    }

    /// Reply carrying introspection XML for `call`.
    fn introspect_reply(&self, _call: &Self::Message, _xml: &str) -> Option<Self::Message> {
        None
    }
}

/// D-Bus binary protocol via zbus.
#[derive(Debug, Clone, Copy, Default)]
pub struct ZbusCodec;

impl ZbusCodec {
    /// Total length of the message starting at `header`, or `None` if the
    /// fixed header is incomplete.
    pub fn frame_len(header: &[u8]) -> Result<Option<usize>, MessageError> {
        if header.len() < FIXED_HEADER_LEN {
            return Ok(None);
        }

        // Byte 0: endianness ('l' = little, 'B' = big)
        // Bytes 4-7: body length (u32)
        // Bytes 12-15: array of header fields length (u32)
        let read_u32 = |at: usize| {
            let raw = [header[at], header[at + 1], header[at + 2], header[at + 3]];
            match header[0] {
                b'l' => Ok(u32::from_le_bytes(raw)),
                b'B' => Ok(u32::from_be_bytes(raw)),
                other => Err(MessageError::InvalidEndianness(other)),
            }
        };
        let body_len = read_u32(4)? as u64;
        let fields_len = read_u32(12)? as u64;

        // Header fields are aligned to 8 bytes
        let fields_len_padded = (fields_len + 7) & !7;
        let total = FIXED_HEADER_LEN as u64 + fields_len_padded + body_len;
        if total > MAX_MESSAGE_SIZE {
            return Err(MessageError::TooLarge(total));
        }
        Ok(Some(total as usize))
    }
}

impl Codec for ZbusCodec {
    type Message = Message;

    fn encode(&self, msg: &Message) -> Result<Vec<u8>, MessageError> {
        check_no_fds(msg)?;
        Ok(msg.data().bytes().to_vec())
    }

    fn decode(&self, buf: &[u8]) -> Result<Option<(Message, usize)>, MessageError> {
        let Some(total) = Self::frame_len(buf)? else {
            return Ok(None);
        };
        if buf.len() < total {
            return Ok(None);
        }

        let endian = if buf[0] == b'l' { Endian::Little } else { Endian::Big };
        let context = serialized::Context::new_dbus(endian, 0);
        let data = serialized::Data::new(buf[..total].to_vec(), context);

        // SAFETY: fds are never attached to the data we decode here
        let msg = unsafe { Message::from_bytes(data) }
            .map_err(|e| MessageError::DeserializeFailed(e.to_string()))?;
        check_no_fds(&msg)?;

        trace!(
            serial = msg.serial(),
            msg_type = ?msg.primary_header().msg_type(),
            path = ?msg.path_str(),
            member = ?msg.member_str(),
            "Decoded message"
        );
        Ok(Some((msg, total)))
    }

    fn unknown_object(&self, call: &Message) -> Option<Message> {
        if call.primary_header().flags().contains(message::Flags::NoReplyExpected) {
            return None;
        }
        let path = call.path_str().unwrap_or_default();
        ErrorBuilder::new(call, error_names::UNKNOWN_OBJECT)
            .build(&format!("No such object path '{}'", path))
            .ok()
    }

    fn introspect_reply(&self, call: &Message, xml: &str) -> Option<Message> {
        MethodReturnBuilder::new(call).build(&(xml,)).ok()
    }
}

/// The pump moves plain bytes, so a message that references file descriptors
/// cannot be carried intact.
fn check_no_fds(msg: &Message) -> Result<(), MessageError> {
    match msg.header().unix_fds() {
        Some(n) if n > 0 => Err(MessageError::UnixFdsUnsupported(n)),
        _ => Ok(()),
    }
}
