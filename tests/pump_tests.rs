//! Integration tests for the connection pump.
//!
//! A tiny line-based codec stands in for the D-Bus wire format so the peer
//! side of the stream can be scripted by hand.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, Lines, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, RwLock};
use tokio::time::timeout;

use kapsule_dbus_conn::codec::Codec;
use kapsule_dbus_conn::dispatch::{DispatchTable, Handler};
use kapsule_dbus_conn::error::{CallError, MessageError};
use kapsule_dbus_conn::match_rules::MatchRule;
use kapsule_dbus_conn::pump::CLOSE_FLUSH_TIMEOUT;
use kapsule_dbus_conn::message::{Envelope, MessageKind, INTROSPECTABLE_INTERFACE};
use kapsule_dbus_conn::{ConnectionPump, Error};

const TEST_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq)]
struct Line {
    kind: MessageKind,
    serial: u32,
    reply_to: Option<u32>,
    path: String,
    interface: String,
    member: String,
    body: String,
}

impl Line {
    fn call(serial: u32, path: &str, member: &str) -> Self {
        Self {
            kind: MessageKind::MethodCall,
            serial,
            reply_to: None,
            path: path.to_string(),
            interface: "org.example.Test".to_string(),
            member: member.to_string(),
            body: String::new(),
        }
    }

    fn signal(serial: u32, path: &str, member: &str) -> Self {
        Self {
            kind: MessageKind::Signal,
            ..Self::call(serial, path, member)
        }
    }

    fn reply(serial: u32, to: &Line, body: &str) -> Self {
        Self {
            kind: MessageKind::MethodReturn,
            serial,
            reply_to: Some(to.serial),
            path: String::new(),
            interface: String::new(),
            member: String::new(),
            body: body.to_string(),
        }
    }

    fn error(serial: u32, to: &Line, body: &str) -> Self {
        Self {
            kind: MessageKind::Error,
            ..Self::reply(serial, to, body)
        }
    }

    fn encode(&self) -> String {
        let kind = match self.kind {
            MessageKind::MethodCall => "c",
            MessageKind::MethodReturn => "r",
            MessageKind::Error => "e",
            MessageKind::Signal => "s",
        };
        let reply_to = self.reply_to.map_or("-".to_string(), |s| s.to_string());
        let field = |s: &str| if s.is_empty() { "-".to_string() } else { s.to_string() };
        format!(
            "{} {} {} {} {} {} {}\n",
            kind,
            self.serial,
            reply_to,
            field(&self.path),
            field(&self.interface),
            field(&self.member),
            field(&hex::encode(&self.body)),
        )
    }

    fn decode(text: &str) -> Option<Self> {
        let parts: Vec<&str> = text.trim_end().split(' ').collect();
        let [kind, serial, reply_to, path, interface, member, body] = parts.as_slice() else {
            return None;
        };
        let field = |s: &str| if s == "-" { String::new() } else { s.to_string() };
        Some(Self {
            kind: match *kind {
                "c" => MessageKind::MethodCall,
                "r" => MessageKind::MethodReturn,
                "e" => MessageKind::Error,
                "s" => MessageKind::Signal,
                _ => return None,
            },
            serial: serial.parse().ok()?,
            reply_to: reply_to.parse().ok(),
            path: field(path),
            interface: field(interface),
            member: field(member),
            body: String::from_utf8(hex::decode(field(body)).ok()?).ok()?,
        })
    }
}

impl Envelope for Line {
    fn kind(&self) -> MessageKind {
        self.kind
    }

    fn serial(&self) -> u32 {
        self.serial
    }

    fn reply_serial(&self) -> Option<u32> {
        self.reply_to
    }

    fn path_str(&self) -> Option<String> {
        (!self.path.is_empty()).then(|| self.path.clone())
    }

    fn interface_str(&self) -> Option<String> {
        (!self.interface.is_empty()).then(|| self.interface.clone())
    }

    fn member_str(&self) -> Option<String> {
        (!self.member.is_empty()).then(|| self.member.clone())
    }

    fn sender_str(&self) -> Option<String> {
        None
    }

    fn destination_str(&self) -> Option<String> {
        None
    }
}

#[derive(Debug, Clone, Copy)]
struct LineCodec;

impl Codec for LineCodec {
    type Message = Line;

    fn encode(&self, msg: &Line) -> Result<Vec<u8>, MessageError> {
        Ok(msg.encode().into_bytes())
    }

    fn decode(&self, buf: &[u8]) -> Result<Option<(Line, usize)>, MessageError> {
        let Some(end) = buf.iter().position(|b| *b == b'\n') else {
            return Ok(None);
        };
        let text = std::str::from_utf8(&buf[..end])
            .map_err(|e| MessageError::DeserializeFailed(e.to_string()))?;
        let line = Line::decode(text)
            .ok_or_else(|| MessageError::DeserializeFailed(text.to_string()))?;
        Ok(Some((line, end + 1)))
    }

    fn unknown_object(&self, call: &Line) -> Option<Line> {
        Some(Line::error(0, call, "UnknownObject"))
    }

    fn introspect_reply(&self, call: &Line, xml: &str) -> Option<Line> {
        Some(Line::reply(0, call, xml))
    }
}

/// The scripted far end of the stream.
struct Peer {
    lines: Lines<BufReader<ReadHalf<DuplexStream>>>,
    writer: WriteHalf<DuplexStream>,
}

impl Peer {
    async fn recv(&mut self) -> Option<Line> {
        let line = timeout(TEST_TIMEOUT, self.lines.next_line())
            .await
            .expect("Peer read timed out")
            .expect("Peer read failed")?;
        Some(Line::decode(&line).expect("Pump wrote an undecodable line"))
    }

    async fn send(&mut self, msg: &Line) {
        self.writer.write_all(msg.encode().as_bytes()).await.unwrap();
        self.writer.flush().await.unwrap();
    }
}

fn start_with(buffered: Vec<u8>) -> (ConnectionPump<LineCodec>, Peer) {
    let (ours, theirs) = tokio::io::duplex(64 * 1024);
    let dispatch = Arc::new(RwLock::new(DispatchTable::new()));
    let pump = ConnectionPump::start(ours, LineCodec, buffered, dispatch);

    let (read_half, writer) = tokio::io::split(theirs);
    let peer = Peer {
        lines: BufReader::new(read_half).lines(),
        writer,
    };
    (pump, peer)
}

fn start() -> (ConnectionPump<LineCodec>, Peer) {
    start_with(Vec::new())
}

fn handler(tag: &'static str) -> Handler<Line> {
    Arc::new(move |path: &str, call: &Line| Some(Line::reply(0, call, &format!("{}:{}", tag, path))))
}

// ============================================================================
// Calls and replies
// ============================================================================

#[tokio::test]
async fn test_call_receives_reply() {
    let (pump, mut peer) = start();

    let call = Line::call(1, "/obj", "Ping");
    let peer_task = tokio::spawn(async move {
        let received = peer.recv().await.unwrap();
        assert_eq!(received, Line::call(1, "/obj", "Ping"));
        peer.send(&Line::reply(100, &received, "pong")).await;
        peer
    });

    let reply = pump.call(&call).await.unwrap();
    assert_eq!(reply.body, "pong");
    assert_eq!(reply.reply_to, Some(1));
    assert_eq!(pump.pending_calls().await, 0);
    peer_task.await.unwrap();
}

#[tokio::test]
async fn test_replies_correlate_by_serial_not_order() {
    let (pump, mut peer) = start();

    let peer_task = tokio::spawn(async move {
        let first = peer.recv().await.unwrap();
        let second = peer.recv().await.unwrap();
        // answer in reverse order
        peer.send(&Line::reply(100, &second, &format!("for {}", second.serial))).await;
        peer.send(&Line::reply(101, &first, &format!("for {}", first.serial))).await;
        peer
    });

    let a = Line::call(10, "/a", "A");
    let b = Line::call(11, "/b", "B");
    let (ra, rb) = tokio::join!(pump.call(&a), pump.call(&b));
    assert_eq!(ra.unwrap().body, "for 10");
    assert_eq!(rb.unwrap().body, "for 11");
    peer_task.await.unwrap();
}

#[tokio::test]
async fn test_error_reply_is_returned_as_reply() {
    let (pump, mut peer) = start();

    let peer_task = tokio::spawn(async move {
        let call = peer.recv().await.unwrap();
        peer.send(&Line::error(5, &call, "nope")).await;
        peer
    });

    let reply = pump.call(&Line::call(3, "/x", "Fail")).await.unwrap();
    assert_eq!(reply.kind, MessageKind::Error);
    assert_eq!(reply.body, "nope");
    peer_task.await.unwrap();
}

#[tokio::test]
async fn test_timeout_then_late_reply_is_discarded() {
    let (pump, mut peer) = start();

    let call = Line::call(7, "/slow", "Wait");
    let started = tokio::time::Instant::now();
    let err = pump
        .call_with_timeout(&call, Duration::from_millis(50))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Call(CallError::Timeout(_))), "got {err:?}");
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(pump.pending_calls().await, 0);

    // The call is still on the wire; answer it late
    let received = peer.recv().await.unwrap();
    peer.send(&Line::reply(100, &received, "too late")).await;

    // Connection keeps working
    let peer_task = tokio::spawn(async move {
        let next = peer.recv().await.unwrap();
        peer.send(&Line::reply(101, &next, "on time")).await;
        peer
    });
    let reply = pump.call(&Line::call(8, "/slow", "Again")).await.unwrap();
    assert_eq!(reply.body, "on time");
    assert!(pump.is_connected());
    peer_task.await.unwrap();
}

#[tokio::test]
async fn test_duplicate_serial_rejected() {
    let (pump, _peer) = start();
    let pump = Arc::new(pump);

    let first = {
        let pump = pump.clone();
        tokio::spawn(async move {
            pump.call_with_timeout(&Line::call(9, "/a", "A"), Duration::from_millis(300))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let err = pump.call(&Line::call(9, "/a", "A")).await.unwrap_err();
    assert!(matches!(err, Error::Call(CallError::DuplicateSerial(9))), "got {err:?}");
    assert!(first.await.unwrap().is_err());
}

// ============================================================================
// Disconnection
// ============================================================================

#[tokio::test]
async fn test_disconnect_releases_blocked_callers() {
    let (pump, mut peer) = start();
    let pump = Arc::new(pump);

    let waiting = {
        let pump = pump.clone();
        tokio::spawn(async move { pump.call(&Line::call(1, "/a", "Hang")).await })
    };

    // Peer sees the call, then goes away
    peer.recv().await.unwrap();
    drop(peer);

    let err = timeout(TEST_TIMEOUT, waiting).await.unwrap().unwrap().unwrap_err();
    assert!(matches!(err, Error::Call(CallError::NotConnected)), "got {err:?}");

    timeout(TEST_TIMEOUT, pump.wait_disconnected()).await.unwrap();
    assert!(!pump.is_connected());

    // New calls fail without blocking
    let err = timeout(Duration::from_millis(100), pump.call(&Line::call(2, "/a", "Late")))
        .await
        .expect("Call after disconnect must not block")
        .unwrap_err();
    assert!(matches!(err, Error::Call(CallError::NotConnected)));
    assert!(pump.send(&Line::signal(3, "/a", "X")).await.is_err());
}

#[tokio::test]
async fn test_garbage_from_peer_disconnects() {
    let (pump, mut peer) = start();
    peer.writer.write_all(b"this is not a message\n").await.unwrap();

    timeout(TEST_TIMEOUT, pump.wait_disconnected()).await.unwrap();
    assert!(!pump.is_connected());
}

// ============================================================================
// Writer ordering and close
// ============================================================================

#[tokio::test]
async fn test_wire_order_matches_submission_order() {
    let (pump, mut peer) = start();

    for serial in 1..=200 {
        pump.send(&Line::signal(serial, "/seq", "Tick")).await.unwrap();
    }
    for serial in 1..=200 {
        assert_eq!(peer.recv().await.unwrap().serial, serial);
    }
}

#[tokio::test]
async fn test_close_flushes_queue_and_ends_stream() {
    let (pump, mut peer) = start();

    for serial in 1..=20 {
        pump.send(&Line::signal(serial, "/bye", "Tick")).await.unwrap();
    }
    pump.close().await;
    assert!(!pump.is_connected());

    let mut seen = 0;
    while let Some(line) = peer.recv().await {
        seen += 1;
        assert_eq!(line.serial, seen);
    }
    assert_eq!(seen, 20);
}

#[tokio::test]
async fn test_close_gives_up_on_stalled_peer() {
    // The peer stays connected but never reads
    let (pump, _peer) = start();

    for serial in 1..=32 {
        let big = Line {
            body: "x".repeat(8 * 1024),
            ..Line::signal(serial, "/stall", "Tick")
        };
        pump.send(&big).await.unwrap();
    }

    let started = tokio::time::Instant::now();
    timeout(CLOSE_FLUSH_TIMEOUT + TEST_TIMEOUT, pump.close())
        .await
        .expect("close must not hang on a stalled peer");
    assert!(started.elapsed() >= CLOSE_FLUSH_TIMEOUT);
    assert!(!pump.is_connected());
    timeout(TEST_TIMEOUT, pump.wait_disconnected()).await.unwrap();
}

// ============================================================================
// Inbound routing
// ============================================================================

#[tokio::test]
async fn test_inbound_calls_are_dispatched() {
    let (pump, mut peer) = start();
    let exact = handler("exact");
    let fallback = handler("fallback");
    {
        let mut table = pump.dispatch().write().await;
        table.register("/a/b", &exact, "").unwrap();
        table.add_fallback("/a", &fallback).unwrap();
    }

    let to_exact = Line::call(1, "/a/b", "Frob");
    peer.send(&to_exact).await;
    let reply = peer.recv().await.unwrap();
    assert_eq!(reply.reply_to, Some(1));
    assert_eq!(reply.body, "exact:/a/b");

    peer.send(&Line::call(2, "/a/b/c", "Frob")).await;
    assert_eq!(peer.recv().await.unwrap().body, "fallback:/a/b/c");

    peer.send(&Line::call(3, "/elsewhere", "Frob")).await;
    let reply = peer.recv().await.unwrap();
    assert_eq!(reply.kind, MessageKind::Error);
    assert_eq!(reply.reply_to, Some(3));
}

#[tokio::test]
async fn test_introspect_answered_from_table() {
    let (pump, mut peer) = start();
    let obj = handler("obj");
    {
        let mut table = pump.dispatch().write().await;
        table.register("/a", &obj, "<interface name=\"org.example.Test\"/>\n").unwrap();
        table.register("/a/child", &obj, "").unwrap();
    }

    let mut call = Line::call(4, "/a", "Introspect");
    call.interface = INTROSPECTABLE_INTERFACE.to_string();
    peer.send(&call).await;

    let reply = peer.recv().await.unwrap();
    assert_eq!(reply.kind, MessageKind::MethodReturn);
    assert_eq!(
        reply.body,
        "<node name=\"/a\">\n<interface name=\"org.example.Test\"/>\n<node name=\"child\"/>\n</node>"
    );
}

#[tokio::test]
async fn test_dropped_handler_is_unknown_object() {
    let (pump, mut peer) = start();
    let obj = handler("obj");
    pump.dispatch().write().await.register("/gone", &obj, "").unwrap();
    drop(obj);

    peer.send(&Line::call(5, "/gone", "Frob")).await;
    assert_eq!(peer.recv().await.unwrap().kind, MessageKind::Error);
}

#[tokio::test]
async fn test_signals_reach_matching_observers() {
    let (pump, mut peer) = start();
    let (tx, mut rx) = mpsc::unbounded_channel();

    let id = pump
        .subscribe(MatchRule::signals().with_member("Changed"), move |signal: &Line| {
            let _ = tx.send(signal.serial);
        })
        .await;

    peer.send(&Line::signal(1, "/a", "Other")).await;
    peer.send(&Line::signal(2, "/a", "Changed")).await;
    assert_eq!(timeout(TEST_TIMEOUT, rx.recv()).await.unwrap(), Some(2));

    assert!(pump.unsubscribe(id).await);
    assert!(!pump.unsubscribe(id).await);
    peer.send(&Line::signal(3, "/a", "Changed")).await;
    // Observer is gone, and with it the sender
    assert_eq!(timeout(TEST_TIMEOUT, rx.recv()).await.unwrap(), None);
}

#[tokio::test]
async fn test_buffered_handshake_bytes_are_decoded_first() {
    // A call that arrived together with the end of the handshake
    let buffered = Line::call(42, "/early", "Frob").encode().into_bytes();
    let (_pump, mut peer) = start_with(buffered);

    let reply = peer.recv().await.unwrap();
    assert_eq!(reply.kind, MessageKind::Error);
    assert_eq!(reply.reply_to, Some(42));

    // Then the stream itself
    peer.send(&Line::call(43, "/late", "Frob")).await;
    assert_eq!(peer.recv().await.unwrap().reply_to, Some(43));
}
