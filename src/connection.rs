//! A D-Bus connection: handshake, then message pump and object exports.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};
use zbus::message::Message;
use zbus::zvariant::DynamicType;

use crate::address::{Address, Listener, Transport};
use crate::auth::{AuthNegotiator, AuthOutcome};
use crate::codec::ZbusCodec;
use crate::command::AuthScheme;
use crate::config::ConnectionConfig;
use crate::dispatch::{DispatchTable, Handler, ObjectHandler};
use crate::error::{AddressError, AuthError, CallError, Error, Result};
use crate::match_rules::MatchRule;
use crate::message::{first_string_arg, Envelope, MessageKind};
use crate::pump::ConnectionPump;

/// Well-known name of the bus daemon.
pub const BUS_NAME: &str = "org.freedesktop.DBus";
/// Object path of the bus daemon.
pub const BUS_PATH: &str = "/org/freedesktop/DBus";

/// An authenticated connection to a bus or a peer.
pub struct Connection {
    pump: ConnectionPump<ZbusCodec>,
    guid: String,
    mechanism: AuthScheme,
    unix_fd: bool,
    peer_uid: Option<u32>,
    unique_name: OnceLock<String>,
    /// Owning handles for exported objects; the dispatch table only holds weak ones.
    objects: Mutex<HashMap<String, Handler<Message>>>,
    fallbacks: Mutex<HashMap<String, Handler<Message>>>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("guid", &self.guid)
            .field("mechanism", &self.mechanism)
            .field("unix_fd", &self.unix_fd)
            .field("unique_name", &self.unique_name.get())
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Connect to the first reachable entry of a `;`-separated address list.
    pub async fn connect(address: &str, config: &ConnectionConfig) -> Result<Self> {
        Self::connect_any(Address::parse_list(address)?, config).await
    }

    /// Connect to the session bus named by `DBUS_SESSION_BUS_ADDRESS`.
    pub async fn session(config: &ConnectionConfig) -> Result<Self> {
        let conn = Self::connect_any(Address::session()?, config).await?;
        conn.hello().await?;
        Ok(conn)
    }

    async fn connect_any(addresses: Vec<Address>, config: &ConnectionConfig) -> Result<Self> {
        let mut last_err = None;
        for addr in addresses {
            match addr.connect().await {
                Ok(transport) => {
                    info!(address = %addr, "Connected, authenticating");
                    let conn = Self::client(transport, config).await?;
                    if let Some(expected) = addr.guid() {
                        if expected != conn.guid {
                            conn.close().await;
                            return Err(AuthError::ProtocolViolation(format!(
                                "Server GUID {} does not match address GUID {}",
                                conn.guid, expected
                            ))
                            .into());
                        }
                    }
                    return Ok(conn);
                }
                Err(e) => {
                    debug!(address = %addr, error = %e, "Address unreachable");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| AddressError::Malformed("empty address list".to_string()).into()))
    }

    /// Accept one peer on `listener` and authenticate it as server.
    pub async fn accept(listener: &Listener, config: &ConnectionConfig, guid: &str) -> Result<Self> {
        let transport = listener.accept().await?;
        Self::server(transport, config, guid).await
    }

    /// Authenticate as client over an already connected transport.
    pub async fn client(mut transport: Transport, config: &ConnectionConfig) -> Result<Self> {
        let negotiator = AuthNegotiator::client()
            .with_mechanisms(config.mechanisms.iter().copied())
            .with_unix_fd(config.negotiate_unix_fd && transport.supports_unix_fd())
            .with_keyring(config.cookie_store());
        let outcome = negotiate(&negotiator, &mut transport, config.auth_timeout()).await?;
        Ok(Self::start(transport, outcome, None, config))
    }

    /// Authenticate as server over an already connected transport.
    pub async fn server(mut transport: Transport, config: &ConnectionConfig, guid: &str) -> Result<Self> {
        let peer_uid = transport.peer_uid();
        let negotiator = AuthNegotiator::server_with_guid(guid)
            .with_mechanisms(config.mechanisms.iter().copied())
            .with_unix_fd(config.negotiate_unix_fd && transport.supports_unix_fd())
            .with_peer_uid(peer_uid)
            .with_keyring(config.cookie_store());
        let outcome = negotiate(&negotiator, &mut transport, config.auth_timeout()).await?;
        Ok(Self::start(transport, outcome, peer_uid, config))
    }

    fn start(transport: Transport, outcome: AuthOutcome, peer_uid: Option<u32>, config: &ConnectionConfig) -> Self {
        let dispatch = Arc::new(RwLock::new(DispatchTable::new()));
        let pump = ConnectionPump::start(transport, ZbusCodec, outcome.buffered_data, dispatch)
            .with_call_timeout(config.call_timeout());

        Self {
            pump,
            guid: outcome.guid,
            mechanism: outcome.mechanism,
            unix_fd: outcome.unix_fd,
            peer_uid: outcome.uid.or(peer_uid),
            unique_name: OnceLock::new(),
            objects: Mutex::new(HashMap::new()),
            fallbacks: Mutex::new(HashMap::new()),
        }
    }

    /// Server GUID of this connection.
    pub fn guid(&self) -> &str {
        &self.guid
    }

    /// Mechanism the handshake settled on.
    pub fn mechanism(&self) -> AuthScheme {
        self.mechanism
    }

    /// Whether fd passing was agreed.
    pub fn unix_fd(&self) -> bool {
        self.unix_fd
    }

    /// UID of the peer, when known.
    pub fn peer_uid(&self) -> Option<u32> {
        self.peer_uid
    }

    /// Unique name assigned by the bus, after [`hello`](Self::hello).
    pub fn unique_name(&self) -> Option<&str> {
        self.unique_name.get().map(String::as_str)
    }

    /// The underlying pump.
    pub fn pump(&self) -> &ConnectionPump<ZbusCodec> {
        &self.pump
    }

    /// Register with a bus daemon and learn our unique name.
    pub async fn hello(&self) -> Result<String> {
        if let Some(name) = self.unique_name.get() {
            return Ok(name.clone());
        }
        let reply = self
            .call_method(Some(BUS_NAME), BUS_PATH, Some(BUS_NAME), "Hello", &())
            .await?;
        let (name,): (String,) = reply.body().deserialize()?;
        info!(unique_name = %name, "Registered on bus");
        Ok(self.unique_name.get_or_init(|| name).clone())
    }

    /// Call a method and wait for its reply. Error replies become
    /// [`CallError::Remote`].
    pub async fn call_method<B>(
        &self,
        destination: Option<&str>,
        path: &str,
        interface: Option<&str>,
        member: &str,
        body: &B,
    ) -> Result<Message>
    where
        B: serde::Serialize + DynamicType,
    {
        let mut builder = Message::method_call(path, member)?;
        if let Some(destination) = destination {
            builder = builder.destination(destination)?;
        }
        if let Some(interface) = interface {
            builder = builder.interface(interface)?;
        }
        let call = builder.build(body)?;

        let reply = self.pump.call(&call).await?;
        if reply.kind() == MessageKind::Error {
            let name = reply
                .header()
                .error_name()
                .map(|n| n.to_string())
                .unwrap_or_default();
            let message = first_string_arg(&reply).unwrap_or_default();
            return Err(CallError::Remote { name, message }.into());
        }
        Ok(reply)
    }

    /// Call with an explicit timeout instead of the configured default.
    pub async fn call_with_timeout(&self, call: &Message, timeout: Duration) -> Result<Message> {
        self.pump.call_with_timeout(call, timeout).await
    }

    /// Emit a signal.
    pub async fn emit_signal<B>(&self, path: &str, interface: &str, member: &str, body: &B) -> Result<()>
    where
        B: serde::Serialize + DynamicType,
    {
        let signal = Message::signal(path, interface, member)?.build(body)?;
        self.pump.send(&signal).await
    }

    /// Send any message without waiting for a reply.
    pub async fn send(&self, msg: &Message) -> Result<()> {
        self.pump.send(msg).await
    }

    /// Export `handler` at exactly `path`.
    pub async fn export<H>(&self, path: &str, handler: H, introspection: impl Into<String>) -> Result<()>
    where
        H: ObjectHandler<Message> + 'static,
    {
        let handler: Handler<Message> = Arc::new(handler);
        self.pump
            .dispatch()
            .write()
            .await
            .register(path, &handler, introspection)?;
        self.objects.lock().await.insert(path.to_string(), handler);
        Ok(())
    }

    /// Stop exporting the object at `path`.
    pub async fn unexport(&self, path: &str) -> Result<bool> {
        self.pump.dispatch().write().await.unregister(path)?;
        Ok(self.objects.lock().await.remove(path).is_some())
    }

    /// Export `handler` for `path` and everything below it.
    pub async fn export_fallback<H>(&self, path: &str, handler: H) -> Result<()>
    where
        H: ObjectHandler<Message> + 'static,
    {
        let handler: Handler<Message> = Arc::new(handler);
        self.pump.dispatch().write().await.add_fallback(path, &handler)?;
        self.fallbacks.lock().await.insert(path.to_string(), handler);
        Ok(())
    }

    /// Remove the fallback registered at `path`.
    pub async fn unexport_fallback(&self, path: &str) -> Result<bool> {
        let removed = self.pump.dispatch().write().await.remove_fallback(path)?;
        self.fallbacks.lock().await.remove(path);
        Ok(removed)
    }

    /// Introspection listing for `path`, as served to peers.
    pub async fn introspect_local(&self, path: &str) -> Option<String> {
        self.pump.dispatch().read().await.introspect(path)
    }

    /// Deliver signals matching `rule` to `callback`.
    pub async fn subscribe<F>(&self, rule: MatchRule, callback: F) -> u64
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        self.pump.subscribe(rule, callback).await
    }

    /// Remove a signal subscription.
    pub async fn unsubscribe(&self, id: u64) -> bool {
        self.pump.unsubscribe(id).await
    }

    /// Whether the connection is still up.
    pub fn is_connected(&self) -> bool {
        self.pump.is_connected()
    }

    /// Resolves once the connection is gone.
    pub async fn wait_disconnected(&self) {
        self.pump.wait_disconnected().await
    }

    /// Flush and close.
    pub async fn close(&self) {
        self.pump.close().await;
        self.objects.lock().await.clear();
        self.fallbacks.lock().await.clear();
    }
}

async fn negotiate(negotiator: &AuthNegotiator, transport: &mut Transport, timeout: Duration) -> Result<AuthOutcome> {
    match tokio::time::timeout(timeout, negotiator.negotiate(transport)).await {
        Ok(Ok(outcome)) => Ok(outcome),
        Ok(Err(e)) => {
            warn!(role = ?negotiator.role(), error = %e, "Authentication failed");
            Err(e)
        }
        Err(_) => {
            warn!(role = ?negotiator.role(), timeout_ms = timeout.as_millis() as u64, "Authentication timed out");
            Err(Error::Auth(AuthError::Timeout))
        }
    }
}
