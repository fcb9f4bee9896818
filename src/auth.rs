//! D-Bus SASL authentication handling.
//!
//! Both roles share one [`Handshake`] value; the role selects which transition
//! function ([`Handshake::client_step`] or [`Handshake::server_step`]) consumes
//! each received line. Line I/O lives in [`AuthNegotiator::negotiate`].

use std::io::ErrorKind;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::command::{AuthScheme, Command, SchemeSet};
use crate::cookie::CookieStore;
use crate::error::{AuthError, Result};
use crate::mechanism::{
    encode_uid, external_verify, sha1_client_response, sha1_server_challenge, sha1_server_verify,
    Sha1Challenge, Verdict,
};

/// Upper bound on received lines per negotiation.
pub const MAX_HANDSHAKE_LINES: usize = 64;
/// Upper bound on a single handshake line.
const MAX_LINE_LENGTH: usize = 16 * 1024;

/// Which end of the handshake we are.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// Handshake progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Initial,
    WaitAuth,
    WaitData,
    WaitOk,
    WaitReject,
    WaitBegin,
    NegotiateFd,
    Authenticated,
    Finished,
    Failed,
}

impl HandshakeState {
    /// FINISHED and FAILED admit no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, HandshakeState::Finished | HandshakeState::Failed)
    }
}

/// Result of successful authentication.
#[derive(Debug, Clone)]
pub struct AuthOutcome {
    /// Whether both sides agreed to pass file descriptors.
    pub unix_fd: bool,
    /// The server GUID (received as client, our own as server).
    pub guid: String,
    /// The mechanism that succeeded.
    pub mechanism: AuthScheme,
    /// The authenticated UID, when the server learnt one.
    pub uid: Option<u32>,
    /// Any data that was buffered during auth but belongs to the D-Bus message stream.
    pub buffered_data: Vec<u8>,
}

/// Runs the SASL handshake for either role.
#[derive(Debug, Clone)]
pub struct AuthNegotiator {
    role: Role,
    mechanisms: SchemeSet,
    guid: String,
    unix_fd: bool,
    local_uid: u32,
    peer_uid: Option<u32>,
    cookies: CookieStore,
}

impl AuthNegotiator {
    fn new(role: Role, guid: String) -> Self {
        let cookies = CookieStore::user_default().unwrap_or_else(|e| {
            warn!(error = %e, "No user keyring, using the temp directory");
            CookieStore::new(std::env::temp_dir().join(".dbus-keyrings"))
        });
        Self {
            role,
            mechanisms: AuthScheme::all(),
            guid,
            unix_fd: false,
            local_uid: nix::unistd::getuid().as_raw(),
            peer_uid: None,
            cookies,
        }
    }

    /// Client-side negotiator offering every mechanism.
    pub fn client() -> Self {
        Self::new(Role::Client, String::new())
    }

    /// Server-side negotiator with a random GUID.
    pub fn server() -> Self {
        Self::new(Role::Server, generate_guid())
    }

    /// Server-side negotiator with a specific GUID.
    pub fn server_with_guid(guid: impl Into<String>) -> Self {
        Self::new(Role::Server, guid.into())
    }

    /// Restrict the mechanisms offered (server) or attempted (client).
    pub fn with_mechanisms(mut self, mechanisms: impl IntoIterator<Item = AuthScheme>) -> Self {
        self.mechanisms = mechanisms
            .into_iter()
            .filter(|s| *s != AuthScheme::None)
            .collect();
        self
    }

    /// Whether this end can pass file descriptors on the transport.
    pub fn with_unix_fd(mut self, supported: bool) -> Self {
        self.unix_fd = supported;
        self
    }

    /// The kernel-verified UID of the peer, if the transport provides one.
    pub fn with_peer_uid(mut self, uid: Option<u32>) -> Self {
        self.peer_uid = uid;
        self
    }

    /// Keyring used by DBUS_COOKIE_SHA1.
    pub fn with_cookie_store(mut self, store: CookieStore) -> Self {
        self.cookies = store;
        self
    }

    /// Use `store` if given, otherwise keep the current keyring.
    pub fn with_keyring(self, store: Option<CookieStore>) -> Self {
        match store {
            Some(store) => self.with_cookie_store(store),
            None => self,
        }
    }

    /// Override the local UID (claimed by clients, compared by servers).
    pub fn with_local_uid(mut self, uid: u32) -> Self {
        self.local_uid = uid;
        self
    }

    /// Get the server GUID.
    pub fn guid(&self) -> &str {
        &self.guid
    }

    /// Get the role.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Perform the handshake on `stream`.
    ///
    /// On error the stream is unusable and should be closed.
    pub async fn negotiate<S>(&self, stream: &mut S) -> Result<AuthOutcome>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut handshake = Handshake::new(self);
        let mut reader = BufReader::new(stream);

        match self.role {
            Role::Client => {
                // Linux attaches SCM credentials to the first byte on its own.
                let opening = handshake.start();
                let stream = reader.get_mut();
                stream.write_all(&[0u8]).await?;
                write_commands(stream, &opening).await?;
            }
            Role::Server => {
                let mut null_byte = [0u8; 1];
                reader.read_exact(&mut null_byte).await?;
                if null_byte[0] != 0 {
                    return Err(AuthError::ExpectedNullByte.into());
                }
                trace!("Received null byte");
                handshake.start();
            }
        }

        let mut lines = 0usize;
        while !handshake.state.is_terminal() {
            lines += 1;
            if lines > MAX_HANDSHAKE_LINES {
                return Err(
                    AuthError::ProtocolViolation("Too many handshake lines".to_string()).into(),
                );
            }

            let line = read_line(&mut reader).await?;
            trace!(role = ?self.role, state = ?handshake.state, line = %line, "Received auth line");
            let command: Command = line
                .parse()
                .map_err(|e: crate::command::ParseCommandError| AuthError::ProtocolViolation(e.0))?;

            let replies = handshake.step(command).await?;
            write_commands(reader.get_mut(), &replies).await?;
        }

        // The client may have sent D-Bus messages immediately after BEGIN,
        // and BufReader may have read them into its internal buffer.
        let buffered_data = reader.buffer().to_vec();
        debug!(
            role = ?self.role,
            mechanism = %handshake.current,
            unix_fd = handshake.unix_fd,
            buffered_bytes = buffered_data.len(),
            "Authentication successful"
        );

        Ok(AuthOutcome {
            unix_fd: handshake.unix_fd,
            guid: handshake.guid,
            mechanism: handshake.current,
            uid: handshake.uid,
            buffered_data,
        })
    }
}

/// One handshake in progress.
#[derive(Debug)]
pub struct Handshake<'a> {
    config: &'a AuthNegotiator,
    state: HandshakeState,
    current: AuthScheme,
    failed: SchemeSet,
    unix_fd: bool,
    guid: String,
    uid: Option<u32>,
    sha1: Option<Sha1Challenge>,
}

impl<'a> Handshake<'a> {
    /// Fresh handshake in the INITIAL state.
    pub fn new(config: &'a AuthNegotiator) -> Self {
        let guid = match config.role {
            Role::Client => String::new(),
            Role::Server => config.guid.clone(),
        };
        Self {
            config,
            state: HandshakeState::Initial,
            current: AuthScheme::None,
            failed: SchemeSet::new(),
            unix_fd: false,
            guid,
            uid: None,
            sha1: None,
        }
    }

    /// Current state.
    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Whether fd passing was agreed.
    pub fn unix_fd(&self) -> bool {
        self.unix_fd
    }

    /// Leave INITIAL. Returns the lines a client opens with.
    pub fn start(&mut self) -> Vec<Command> {
        match self.config.role {
            Role::Client => {
                self.state = HandshakeState::WaitData;
                vec![Command::Auth {
                    mechanism: None,
                    initial_response: None,
                }]
            }
            Role::Server => {
                self.uid = None;
                self.state = HandshakeState::WaitAuth;
                Vec::new()
            }
        }
    }

    /// Feed one received command; returns the lines to send back.
    pub async fn step(&mut self, command: Command) -> Result<Vec<Command>> {
        if self.state.is_terminal() {
            return Ok(Vec::new());
        }
        let result = match self.config.role {
            Role::Client => self.client_step(command).await,
            Role::Server => self.server_step(command).await,
        };
        if result.is_err() {
            self.state = HandshakeState::Failed;
        }
        result
    }

    fn fail(&mut self, err: AuthError) -> Result<Vec<Command>> {
        self.state = HandshakeState::Failed;
        Err(err.into())
    }

    /// Mark the current mechanism failed and try the next one the server offers.
    fn retry(&mut self, offered_by_server: &SchemeSet) -> Result<Vec<Command>> {
        if self.current != AuthScheme::None {
            debug!(error = %AuthError::MechanismRejected(self.current), "Trying next mechanism");
        }
        self.failed.insert(self.current);

        let next = offered_by_server
            .intersection(&self.config.mechanisms)
            .copied()
            .find(|s| !self.failed.contains(s));

        let Some(next) = next else {
            return self.fail(AuthError::Exhausted);
        };

        self.current = next;
        self.state = HandshakeState::WaitData;
        let initial_response = match next {
            AuthScheme::External | AuthScheme::CookieSha1 => Some(encode_uid(self.config.local_uid)),
            _ => None,
        };
        debug!(mechanism = %next, "Trying mechanism");
        Ok(vec![Command::auth(next, initial_response)])
    }

    fn after_ok(&mut self, guid: String) -> Vec<Command> {
        self.guid = guid;
        self.state = HandshakeState::Authenticated;
        if self.config.unix_fd {
            trace!("Asking for file descriptor support");
            self.state = HandshakeState::NegotiateFd;
            vec![Command::NegotiateUnixFd]
        } else {
            self.state = HandshakeState::Finished;
            vec![Command::Begin]
        }
    }

    /// Client transition function.
    pub async fn client_step(&mut self, command: Command) -> Result<Vec<Command>> {
        match (self.state, command) {
            (HandshakeState::WaitData, Command::Data(challenge)) => {
                let response = match self.current {
                    AuthScheme::CookieSha1 => {
                        let challenge = challenge.unwrap_or_default();
                        sha1_client_response(&self.config.cookies, &challenge).await
                    }
                    AuthScheme::External | AuthScheme::Anonymous => Ok(String::new()),
                    AuthScheme::None => Err(AuthError::ProtocolViolation(
                        "DATA before any mechanism was chosen".to_string(),
                    )),
                };
                match response {
                    Ok(data) => {
                        self.state = HandshakeState::WaitOk;
                        Ok(vec![Command::Data((!data.is_empty()).then_some(data))])
                    }
                    Err(e) => {
                        debug!(mechanism = %self.current, error = %e, "Challenge failed");
                        Ok(vec![Command::Error(Some(e.to_string()))])
                    }
                }
            }
            (HandshakeState::WaitData, Command::Rejected(offered)) => self.retry(&offered),
            (HandshakeState::WaitData, Command::Ok(guid)) => Ok(self.after_ok(guid)),
            (HandshakeState::WaitData, Command::Error(_)) => {
                self.state = HandshakeState::WaitReject;
                Ok(vec![Command::Cancel])
            }
            (HandshakeState::WaitOk, Command::Ok(guid)) => Ok(self.after_ok(guid)),
            (HandshakeState::WaitOk, Command::Rejected(offered)) => self.retry(&offered),
            (HandshakeState::WaitOk, _) => {
                self.state = HandshakeState::WaitReject;
                Ok(vec![Command::Cancel])
            }
            (HandshakeState::WaitReject, Command::Rejected(offered)) => self.retry(&offered),
            (HandshakeState::WaitReject, other) => self.fail(AuthError::ProtocolViolation(format!(
                "Expected REJECTED after CANCEL, got {}",
                other.verb()
            ))),
            (HandshakeState::NegotiateFd, Command::AgreeUnixFd) => {
                trace!("File descriptors supported by server");
                self.unix_fd = true;
                self.state = HandshakeState::Finished;
                Ok(vec![Command::Begin])
            }
            (HandshakeState::NegotiateFd, Command::Error(_)) => {
                trace!("File descriptors not supported by server");
                self.unix_fd = false;
                self.state = HandshakeState::Finished;
                Ok(vec![Command::Begin])
            }
            (state, other) => {
                if state == HandshakeState::WaitData {
                    Ok(vec![Command::Error(Some("Got invalid command".to_string()))])
                } else {
                    self.fail(AuthError::ProtocolViolation(format!(
                        "Unexpected {} in state {:?}",
                        other.verb(),
                        state
                    )))
                }
            }
        }
    }

    fn rejected(&mut self) -> Vec<Command> {
        self.current = AuthScheme::None;
        self.sha1 = None;
        self.state = HandshakeState::WaitAuth;
        vec![Command::rejected(&self.config.mechanisms)]
    }

    fn accepted(&mut self) -> Vec<Command> {
        self.state = HandshakeState::WaitBegin;
        vec![Command::Ok(self.guid.clone())]
    }

    async fn server_auth(&mut self, mechanism: Option<String>, data: Option<String>) -> Vec<Command> {
        let scheme = mechanism
            .as_deref()
            .and_then(AuthScheme::from_wire_name)
            .filter(|s| self.config.mechanisms.contains(s));
        let Some(scheme) = scheme else {
            if let Some(name) = mechanism {
                warn!(mechanism = %name, "Unsupported auth mechanism");
            }
            return self.rejected();
        };
        self.current = scheme;

        match scheme {
            AuthScheme::Anonymous => self.accepted(),
            AuthScheme::External => match data {
                Some(data) => self.server_data(Some(data)).await,
                None => {
                    // busctl/systemd style: empty challenge, UID in the DATA reply
                    self.state = HandshakeState::WaitData;
                    vec![Command::Data(None)]
                }
            },
            AuthScheme::CookieSha1 => match sha1_server_challenge(&self.config.cookies).await {
                Ok((state, payload)) => {
                    self.sha1 = Some(state);
                    self.state = HandshakeState::WaitData;
                    vec![Command::Data(Some(payload))]
                }
                Err(e) => {
                    warn!(error = %e, "Could not issue SHA1 challenge");
                    self.rejected()
                }
            },
            AuthScheme::None => self.rejected(),
        }
    }

    async fn server_data(&mut self, data: Option<String>) -> Vec<Command> {
        let verdict = match self.current {
            AuthScheme::External => match data {
                Some(claim) => external_verify(&claim, self.config.local_uid, self.config.peer_uid),
                None => match self.config.peer_uid {
                    Some(uid) if uid == self.config.local_uid => Verdict::Ok,
                    _ => Verdict::Reject,
                },
            },
            AuthScheme::CookieSha1 => match (&self.sha1, data) {
                (Some(state), Some(data)) => sha1_server_verify(state, &data),
                _ => Verdict::Error,
            },
            AuthScheme::Anonymous => Verdict::Ok,
            AuthScheme::None => Verdict::Error,
        };

        match verdict {
            Verdict::Ok => {
                if self.current == AuthScheme::External {
                    self.uid = Some(self.config.peer_uid.unwrap_or(self.config.local_uid));
                }
                debug!(mechanism = %self.current, uid = ?self.uid, "Client authenticated");
                self.accepted()
            }
            Verdict::Continue(payload) => {
                self.state = HandshakeState::WaitData;
                vec![Command::Data(Some(payload))]
            }
            Verdict::Reject | Verdict::Error => self.rejected(),
        }
    }

    /// Server transition function.
    pub async fn server_step(&mut self, command: Command) -> Result<Vec<Command>> {
        match (self.state, command) {
            (
                HandshakeState::WaitAuth | HandshakeState::WaitData,
                Command::Auth {
                    mechanism,
                    initial_response,
                },
            ) => Ok(self.server_auth(mechanism, initial_response).await),
            (HandshakeState::WaitData, Command::Data(data)) => Ok(self.server_data(data).await),
            (
                HandshakeState::WaitAuth | HandshakeState::WaitData | HandshakeState::WaitBegin,
                Command::Error(_) | Command::Cancel,
            ) => Ok(self.rejected()),
            (HandshakeState::WaitBegin, Command::Begin) => {
                self.state = HandshakeState::Finished;
                Ok(Vec::new())
            }
            (HandshakeState::WaitBegin, Command::NegotiateUnixFd) => {
                debug!("File descriptor negotiation requested");
                self.unix_fd = self.config.unix_fd;
                if self.unix_fd {
                    Ok(vec![Command::AgreeUnixFd])
                } else {
                    Ok(vec![Command::Error(Some("Unix fd passing not supported".to_string()))])
                }
            }
            (HandshakeState::WaitAuth | HandshakeState::WaitData, Command::Begin) => self.fail(
                AuthError::ProtocolViolation("BEGIN before authentication".to_string()),
            ),
            (HandshakeState::WaitAuth | HandshakeState::WaitData, _) => {
                Ok(vec![Command::Error(Some("Got invalid command".to_string()))])
            }
            (state, other) => self.fail(AuthError::ProtocolViolation(format!(
                "Unexpected {} in state {:?}",
                other.verb(),
                state
            ))),
        }
    }
}

async fn write_commands<W: AsyncWrite + Unpin>(stream: &mut W, commands: &[Command]) -> Result<()> {
    if commands.is_empty() {
        return Ok(());
    }
    for command in commands {
        trace!(line = %command, "Sending auth line");
        stream.write_all(command.to_line().as_bytes()).await?;
    }
    stream.flush().await?;
    Ok(())
}

/// Read a line from the stream (terminated by \r\n).
async fn read_line<R: tokio::io::AsyncBufRead + Unpin>(reader: &mut R) -> std::io::Result<String> {
    let mut raw = Vec::new();
    let n = (&mut *reader)
        .take(MAX_LINE_LENGTH as u64)
        .read_until(b'\n', &mut raw)
        .await?;

    if n == 0 {
        return Err(std::io::Error::new(
            ErrorKind::UnexpectedEof,
            "Stream unexpectedly short (broken pipe)",
        ));
    }
    if raw.last() != Some(&b'\n') {
        return Err(std::io::Error::new(ErrorKind::InvalidData, "Auth line too long"));
    }

    raw.retain(|b| *b != b'\0' && *b != b'\r' && *b != b'\n');
    String::from_utf8(raw).map_err(|e| std::io::Error::new(ErrorKind::InvalidData, e))
}

/// Generate a random GUID for the D-Bus server.
pub fn generate_guid() -> String {
    // D-Bus GUIDs are 32 hex characters
    Uuid::new_v4().as_simple().to_string()
}
