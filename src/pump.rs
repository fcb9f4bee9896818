//! The message pump of an authenticated connection.
//!
//! After the handshake the transport is split in two. A reader task decodes
//! complete messages and routes them: replies to the waiting caller, method
//! calls to the [`DispatchTable`], signals to subscribed observers. A writer
//! task drains a FIFO of encoded frames, so bytes hit the wire in the order
//! they were submitted.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, trace, warn};

use crate::codec::Codec;
use crate::dispatch::DispatchTable;
use crate::error::{CallError, Result};
use crate::match_rules::MatchRule;
use crate::message::{is_introspect_call, Envelope, MessageKind};
use crate::serial_map::SerialMap;

/// Default timeout for method calls.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(20);

/// How long [`ConnectionPump::close`] waits for queued messages to drain.
pub const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

/// Read buffer size for the reader task.
const READ_CHUNK_SIZE: usize = 16 * 1024;

/// Callback invoked for each matching signal.
pub type SignalCallback<M> = Arc<dyn Fn(&M) + Send + Sync>;

/// Shared dispatch table handle.
pub type SharedDispatch<M> = Arc<RwLock<DispatchTable<M>>>;

enum Outgoing {
    Frame(Vec<u8>),
    Stop,
}

struct Observer<M> {
    id: u64,
    rule: MatchRule,
    callback: SignalCallback<M>,
}

/// State shared between the pump handle and its two tasks.
struct Shared<C: Codec> {
    codec: C,
    pending: Mutex<SerialMap<C::Message>>,
    dispatch: SharedDispatch<C::Message>,
    observers: Mutex<Vec<Observer<C::Message>>>,
    closed: watch::Sender<bool>,
}

impl<C: Codec> Shared<C> {
    /// One-way transition to disconnected. Wakes every blocked caller.
    async fn disconnect(&self) {
        let released = self.pending.lock().await.disconnect();
        let was_closed = self.closed.send_replace(true);
        if !was_closed {
            debug!(released_calls = released, "Connection disconnected");
        }
    }

    fn enqueue(&self, outgoing: &mpsc::UnboundedSender<Outgoing>, msg: &C::Message) {
        match self.codec.encode(msg) {
            Ok(frame) => {
                if outgoing.send(Outgoing::Frame(frame)).is_err() {
                    debug!(serial = msg.serial(), "Writer gone, dropping message");
                }
            }
            Err(e) => error!(serial = msg.serial(), error = %e, "Failed to encode message"),
        }
    }

    async fn handle_incoming(&self, msg: C::Message, outgoing: &mpsc::UnboundedSender<Outgoing>) {
        match msg.kind() {
            MessageKind::MethodReturn | MessageKind::Error => {
                let Some(reply_serial) = msg.reply_serial() else {
                    warn!(serial = msg.serial(), "Reply without reply serial");
                    return;
                };
                if !self.pending.lock().await.resolve(reply_serial, msg) {
                    trace!(reply_serial, "Discarding reply with no pending call");
                }
            }
            MessageKind::MethodCall => self.dispatch_call(msg, outgoing).await,
            MessageKind::Signal => self.notify_observers(&msg).await,
        }
    }

    async fn dispatch_call(&self, call: C::Message, outgoing: &mpsc::UnboundedSender<Outgoing>) {
        let path = call.path_str().unwrap_or_default();

        let (builtin, handler) = {
            let table = self.dispatch.read().await;
            let builtin = if is_introspect_call(&call) {
                table
                    .introspect(&path)
                    .and_then(|xml| self.codec.introspect_reply(&call, &xml))
            } else {
                None
            };
            let handler = match builtin {
                Some(_) => None,
                None => table.lookup(&path),
            };
            (builtin, handler)
        };

        let reply = match (builtin, handler) {
            (Some(reply), _) => {
                trace!(path = %path, "Answered Introspect from dispatch table");
                Some(reply)
            }
            (None, Some(handler)) => {
                trace!(path = %path, member = ?call.member_str(), serial = call.serial(), "Dispatching call");
                handler.handle(&path, &call)
            }
            (None, None) => {
                debug!(path = %path, member = ?call.member_str(), "No object at path");
                self.codec.unknown_object(&call)
            }
        };

        if let Some(reply) = reply {
            self.enqueue(outgoing, &reply);
        }
    }

    async fn notify_observers(&self, signal: &C::Message) {
        let callbacks: Vec<SignalCallback<C::Message>> = self
            .observers
            .lock()
            .await
            .iter()
            .filter(|o| o.rule.matches(signal))
            .map(|o| o.callback.clone())
            .collect();

        trace!(
            member = ?signal.member_str(),
            observers = callbacks.len(),
            "Delivering signal"
        );
        for callback in callbacks {
            callback(signal);
        }
    }
}

/// Reader and writer tasks of one connection, plus the call correlation table.
pub struct ConnectionPump<C: Codec> {
    shared: Arc<Shared<C>>,
    outgoing: mpsc::UnboundedSender<Outgoing>,
    reader: Mutex<Option<JoinHandle<()>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
    next_observer: AtomicU64,
    call_timeout: Duration,
}

impl<C: Codec> ConnectionPump<C> {
    /// Take over `transport` and start the reader and writer tasks.
    ///
    /// `buffered` holds bytes the handshake already read past `BEGIN`; they are
    /// decoded before anything else.
    pub fn start<T>(
        transport: T,
        codec: C,
        buffered: Vec<u8>,
        dispatch: SharedDispatch<C::Message>,
    ) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (closed, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            codec,
            pending: Mutex::new(SerialMap::new()),
            dispatch,
            observers: Mutex::new(Vec::new()),
            closed,
        });

        let (read_half, write_half) = tokio::io::split(transport);
        let (outgoing, queue) = mpsc::unbounded_channel();

        let reader = tokio::spawn(read_loop(shared.clone(), read_half, buffered, outgoing.clone()));
        let writer = tokio::spawn(write_loop(shared.clone(), write_half, queue));

        Self {
            shared,
            outgoing,
            reader: Mutex::new(Some(reader)),
            writer: Mutex::new(Some(writer)),
            next_observer: AtomicU64::new(1),
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }

    /// Override the default call timeout.
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// The default call timeout.
    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    /// The dispatch table inbound calls are routed through.
    pub fn dispatch(&self) -> &SharedDispatch<C::Message> {
        &self.shared.dispatch
    }

    /// Whether the connection is still up.
    pub fn is_connected(&self) -> bool {
        !*self.shared.closed.borrow()
    }

    /// Resolves once the connection is disconnected.
    pub async fn wait_disconnected(&self) {
        let mut closed = self.shared.closed.subscribe();
        // Err means the sender is gone, which only happens once we are torn down.
        let _ = closed.wait_for(|closed| *closed).await;
    }

    /// Queue a message without waiting for a reply.
    pub async fn send(&self, msg: &C::Message) -> Result<()> {
        if !self.is_connected() {
            return Err(CallError::NotConnected.into());
        }
        let frame = self.shared.codec.encode(msg)?;
        self.outgoing
            .send(Outgoing::Frame(frame))
            .map_err(|_| CallError::NotConnected)?;
        trace!(serial = msg.serial(), kind = %msg.kind(), "Queued message");
        Ok(())
    }

    /// Send a method call and wait for its reply with the default timeout.
    pub async fn call(&self, msg: &C::Message) -> Result<C::Message> {
        self.call_with_timeout(msg, self.call_timeout).await
    }

    /// Send a method call and wait up to `timeout` for its reply.
    ///
    /// The reply may be an error message; it is returned as-is. A timeout
    /// does not cancel the call on the wire, a late reply is dropped.
    pub async fn call_with_timeout(&self, msg: &C::Message, timeout: Duration) -> Result<C::Message> {
        let serial = msg.serial();
        let frame = self.shared.codec.encode(msg)?;
        let reply = self.shared.pending.lock().await.insert(serial)?;

        if self.outgoing.send(Outgoing::Frame(frame)).is_err() {
            self.shared.pending.lock().await.remove(serial);
            return Err(CallError::NotConnected.into());
        }
        trace!(serial, member = ?msg.member_str(), "Waiting for reply");

        match tokio::time::timeout(timeout, reply).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(CallError::NotConnected.into()),
            Err(_) => {
                let waited = self.shared.pending.lock().await.remove(serial).map(|call| call.age());
                debug!(
                    serial,
                    timeout_ms = timeout.as_millis() as u64,
                    waited = ?waited,
                    "Call timed out"
                );
                Err(CallError::Timeout(timeout).into())
            }
        }
    }

    /// Deliver signals matching `rule` to `callback`. Returns an id for
    /// [`unsubscribe`](Self::unsubscribe).
    pub async fn subscribe<F>(&self, rule: MatchRule, callback: F) -> u64
    where
        F: Fn(&C::Message) + Send + Sync + 'static,
    {
        let id = self.next_observer.fetch_add(1, Ordering::Relaxed);
        debug!(id, rule = %rule, "Adding signal observer");
        self.shared.observers.lock().await.push(Observer {
            id,
            rule,
            callback: Arc::new(callback),
        });
        id
    }

    /// Remove a signal observer.
    pub async fn unsubscribe(&self, id: u64) -> bool {
        let mut observers = self.shared.observers.lock().await;
        let before = observers.len();
        observers.retain(|o| o.id != id);
        observers.len() != before
    }

    /// Number of calls waiting for a reply.
    pub async fn pending_calls(&self) -> usize {
        self.shared.pending.lock().await.len()
    }

    /// Flush queued messages, stop both tasks and mark the connection closed.
    ///
    /// The flush is given [`CLOSE_FLUSH_TIMEOUT`]; whatever has not reached the
    /// peer by then is dropped.
    pub async fn close(&self) {
        let _ = self.outgoing.send(Outgoing::Stop);
        if let Some(mut writer) = self.writer.lock().await.take() {
            match tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, &mut writer).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "Writer task ended abnormally"),
                Err(_) => {
                    warn!(
                        timeout_ms = CLOSE_FLUSH_TIMEOUT.as_millis() as u64,
                        "Peer not draining, abandoning queued messages"
                    );
                    writer.abort();
                }
            }
        }
        if let Some(reader) = self.reader.lock().await.take() {
            reader.abort();
        }
        self.shared.disconnect().await;
    }
}

impl<C: Codec> Drop for ConnectionPump<C> {
    fn drop(&mut self) {
        for task in [self.reader.get_mut().take(), self.writer.get_mut().take()]
            .into_iter()
            .flatten()
        {
            task.abort();
        }
    }
}

async fn read_loop<C, R>(
    shared: Arc<Shared<C>>,
    mut reader: R,
    mut buf: Vec<u8>,
    outgoing: mpsc::UnboundedSender<Outgoing>,
) where
    C: Codec,
    R: AsyncRead + Unpin,
{
    let mut chunk = vec![0u8; READ_CHUNK_SIZE];

    'read: loop {
        loop {
            match shared.codec.decode(&buf) {
                Ok(Some((msg, used))) => {
                    buf.drain(..used);
                    shared.handle_incoming(msg, &outgoing).await;
                }
                Ok(None) => break,
                Err(e) => {
                    error!(error = %e, "Undecodable message, dropping connection");
                    break 'read;
                }
            }
        }

        match reader.read(&mut chunk).await {
            Ok(0) => {
                debug!("Peer closed the connection");
                break;
            }
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
            Err(e) => {
                warn!(error = %e, "Error reading from transport");
                break;
            }
        }
    }

    shared.disconnect().await;
}

async fn write_loop<C, W>(shared: Arc<Shared<C>>, mut writer: W, mut queue: mpsc::UnboundedReceiver<Outgoing>)
where
    C: Codec,
    W: AsyncWrite + Unpin,
{
    while let Some(item) = queue.recv().await {
        match item {
            Outgoing::Frame(frame) => {
                if let Err(e) = write_frame(&mut writer, &frame).await {
                    warn!(error = %e, "Error writing to transport");
                    shared.disconnect().await;
                    return;
                }
            }
            Outgoing::Stop => {
                queue.close();
                let mut flushed = 0usize;
                while let Ok(item) = queue.try_recv() {
                    let Outgoing::Frame(frame) = item else {
                        continue;
                    };
                    if let Err(e) = write_frame(&mut writer, &frame).await {
                        debug!(error = %e, "Abandoning flush on close");
                        break;
                    }
                    flushed += 1;
                }
                if let Err(e) = writer.shutdown().await {
                    trace!(error = %e, "Shutdown of write half failed");
                }
                debug!(flushed, "Writer stopped");
                return;
            }
        }
    }
}

async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &[u8]) -> std::io::Result<()> {
    writer.write_all(frame).await?;
    writer.flush().await
}
