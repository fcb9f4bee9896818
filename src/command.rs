//! Lines of the SASL handshake sub-protocol.
//!
//! Before binary message mode begins, both peers exchange CRLF-terminated
//! ASCII lines of the form `VERB [arg...]`. Binary payloads travel hex-encoded.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::trace;

/// An authentication mechanism.
///
/// Declaration order is client preference order, so iterating a
/// [`SchemeSet`] yields the mechanism to try next first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum AuthScheme {
    /// Pseudo mechanism used before any `AUTH` has been sent.
    #[serde(rename = "NONE")]
    None,
    /// Credentials passed by the kernel on Unix sockets.
    #[serde(rename = "EXTERNAL")]
    External,
    /// Shared secret from the per-user keyring.
    #[serde(rename = "DBUS_COOKIE_SHA1")]
    CookieSha1,
    /// No authentication at all.
    #[serde(rename = "ANONYMOUS")]
    Anonymous,
}

/// A set of mechanisms, used both for "offered" and "failed so far".
pub type SchemeSet = BTreeSet<AuthScheme>;

impl AuthScheme {
    /// Mechanisms that can actually be negotiated.
    pub const REAL: [AuthScheme; 3] = [
        AuthScheme::External,
        AuthScheme::CookieSha1,
        AuthScheme::Anonymous,
    ];

    /// The mechanism name used on the wire.
    pub fn wire_name(self) -> &'static str {
        match self {
            AuthScheme::None => "NONE",
            AuthScheme::External => "EXTERNAL",
            AuthScheme::CookieSha1 => "DBUS_COOKIE_SHA1",
            AuthScheme::Anonymous => "ANONYMOUS",
        }
    }

    /// Look up a real mechanism by its wire name.
    pub fn from_wire_name(name: &str) -> Option<Self> {
        Self::REAL.into_iter().find(|s| s.wire_name() == name)
    }

    /// All real mechanisms.
    pub fn all() -> SchemeSet {
        Self::REAL.into_iter().collect()
    }
}

impl fmt::Display for AuthScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.wire_name())
    }
}

/// One parsed handshake line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `AUTH [mechanism [initial-response]]`. The mechanism is kept as sent so
    /// a server can reject names it does not know.
    Auth {
        mechanism: Option<String>,
        initial_response: Option<String>,
    },
    /// `DATA [hex]`.
    Data(Option<String>),
    /// `REJECTED mech...`. Unknown mechanism names are dropped.
    Rejected(SchemeSet),
    /// `OK <guid>`.
    Ok(String),
    /// `BEGIN`.
    Begin,
    /// `CANCEL`.
    Cancel,
    /// `ERROR [explanation]`.
    Error(Option<String>),
    /// `NEGOTIATE_UNIX_FD`.
    NegotiateUnixFd,
    /// `AGREE_UNIX_FD`.
    AgreeUnixFd,
}

/// Reason a line could not be parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseCommandError(pub String);

impl fmt::Display for ParseCommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for ParseCommandError {}

impl Command {
    /// `AUTH <mechanism> [initial-response]`.
    pub fn auth(scheme: AuthScheme, initial_response: Option<String>) -> Self {
        Command::Auth {
            mechanism: Some(scheme.wire_name().to_string()),
            initial_response,
        }
    }

    /// `REJECTED` listing the given mechanisms.
    pub fn rejected(schemes: &SchemeSet) -> Self {
        Command::Rejected(schemes.iter().copied().filter(|s| *s != AuthScheme::None).collect())
    }

    /// The verb of this command.
    pub fn verb(&self) -> &'static str {
        match self {
            Command::Auth { .. } => "AUTH",
            Command::Data(_) => "DATA",
            Command::Rejected(_) => "REJECTED",
            Command::Ok(_) => "OK",
            Command::Begin => "BEGIN",
            Command::Cancel => "CANCEL",
            Command::Error(_) => "ERROR",
            Command::NegotiateUnixFd => "NEGOTIATE_UNIX_FD",
            Command::AgreeUnixFd => "AGREE_UNIX_FD",
        }
    }

    /// Serialize as a CRLF-terminated wire line.
    pub fn to_line(&self) -> String {
        format!("{}\r\n", self)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.verb())?;
        match self {
            Command::Auth {
                mechanism,
                initial_response,
            } => {
                if let Some(mech) = mechanism {
                    write!(f, " {}", mech)?;
                    if let Some(data) = initial_response {
                        write!(f, " {}", data)?;
                    }
                }
            }
            Command::Data(Some(data)) | Command::Error(Some(data)) => write!(f, " {}", data)?,
            Command::Rejected(mechs) => {
                for mech in mechs {
                    write!(f, " {}", mech)?;
                }
            }
            Command::Ok(guid) => write!(f, " {}", guid)?,
            _ => {}
        }
        Ok(())
    }
}

impl FromStr for Command {
    type Err = ParseCommandError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        if !line.is_ascii() {
            return Err(ParseCommandError(format!("Non-ASCII line: {:?}", line)));
        }

        let (verb, rest) = match line.split_once(' ') {
            Some((verb, rest)) => (verb, rest.trim()),
            None => (line, ""),
        };
        let mut args = rest.split_whitespace();
        let no_args = |cmd: Command| {
            if rest.is_empty() {
                Ok(cmd)
            } else {
                Err(ParseCommandError(format!("{} takes no arguments", verb)))
            }
        };

        let command = match verb {
            "AUTH" => {
                let mechanism = args.next().map(str::to_string);
                let initial_response = args.next().map(str::to_string);
                if args.next().is_some() {
                    return Err(ParseCommandError("Too many AUTH arguments".to_string()));
                }
                Command::Auth {
                    mechanism,
                    initial_response,
                }
            }
            "DATA" => {
                let data = args.next().map(str::to_string);
                if args.next().is_some() {
                    return Err(ParseCommandError("Too many DATA arguments".to_string()));
                }
                Command::Data(data)
            }
            "REJECTED" => {
                Command::Rejected(args.filter_map(AuthScheme::from_wire_name).collect())
            }
            "OK" => {
                let guid = args
                    .next()
                    .ok_or_else(|| ParseCommandError("OK without server GUID".to_string()))?;
                Command::Ok(guid.to_string())
            }
            "ERROR" => Command::Error((!rest.is_empty()).then(|| rest.to_string())),
            "BEGIN" => no_args(Command::Begin)?,
            "CANCEL" => no_args(Command::Cancel)?,
            "NEGOTIATE_UNIX_FD" => no_args(Command::NegotiateUnixFd)?,
            "AGREE_UNIX_FD" => no_args(Command::AgreeUnixFd)?,
            other => return Err(ParseCommandError(format!("Invalid command {:?}", other))),
        };

        trace!(command = ?command, "Parsed auth command");
        Ok(command)
    }
}
