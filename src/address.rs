//! Bus addresses and the byte transports behind them.
//!
//! Addresses use the D-Bus syntax `transport:key=value,key=value`, several of
//! which may be joined with `;`. Supported transports are `unix:path=` and
//! `tcp:host=,port=`.

use std::fmt;
use std::io;
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::str::FromStr;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use tracing::{debug, info, warn};

use crate::error::{AddressError, Result};

/// Environment variable holding the session bus address.
pub const SESSION_BUS_ENV: &str = "DBUS_SESSION_BUS_ADDRESS";

/// One parsed bus address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    Unix {
        path: PathBuf,
        guid: Option<String>,
    },
    Tcp {
        host: String,
        port: u16,
        guid: Option<String>,
    },
}

impl Address {
    /// Parse a `;`-separated address list. Empty entries are skipped.
    pub fn parse_list(s: &str) -> std::result::Result<Vec<Address>, AddressError> {
        let addresses = s
            .split(';')
            .filter(|entry| !entry.trim().is_empty())
            .map(str::parse)
            .collect::<std::result::Result<Vec<_>, _>>()?;
        if addresses.is_empty() {
            return Err(AddressError::Malformed(s.to_string()));
        }
        Ok(addresses)
    }

    /// Address list of the session bus, from the environment.
    pub fn session() -> std::result::Result<Vec<Address>, AddressError> {
        let value = std::env::var(SESSION_BUS_ENV)
            .map_err(|_| AddressError::Malformed(format!("{} is not set", SESSION_BUS_ENV)))?;
        Self::parse_list(&value)
    }

    /// GUID the server is expected to announce, if the address carries one.
    pub fn guid(&self) -> Option<&str> {
        match self {
            Address::Unix { guid, .. } | Address::Tcp { guid, .. } => guid.as_deref(),
        }
    }

    /// Open a client stream to this address.
    pub async fn connect(&self) -> Result<Transport> {
        debug!(address = %self, "Connecting");
        let transport = match self {
            Address::Unix { path, .. } => Transport::Unix(UnixStream::connect(path).await?),
            Address::Tcp { host, port, .. } => {
                let stream = TcpStream::connect((host.as_str(), *port)).await?;
                stream.set_nodelay(true)?;
                Transport::Tcp(stream)
            }
        };
        Ok(transport)
    }

    /// Bind a listener at this address.
    ///
    /// A stale Unix socket file at the path is removed first.
    pub async fn bind(&self) -> Result<Listener> {
        let listener = match self {
            Address::Unix { path, .. } => {
                match std::fs::symlink_metadata(path) {
                    Ok(meta) if meta.file_type().is_socket() => {
                        warn!(path = %path.display(), "Removing existing socket file");
                        std::fs::remove_file(path)?;
                    }
                    Ok(_) => {
                        return Err(io::Error::new(
                            io::ErrorKind::AlreadyExists,
                            format!("{} exists and is not a socket", path.display()),
                        )
                        .into());
                    }
                    Err(_) => {}
                }
                Listener::Unix {
                    listener: UnixListener::bind(path)?,
                    path: path.clone(),
                }
            }
            Address::Tcp { host, port, .. } => {
                Listener::Tcp(TcpListener::bind((host.as_str(), *port)).await?)
            }
        };
        info!(address = %self, "Listening");
        Ok(listener)
    }
}

/// Undo D-Bus address value escaping (`%xx`).
fn unescape(value: &str, address: &str) -> std::result::Result<String, AddressError> {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = value
                .get(i + 1..i + 3)
                .ok_or_else(|| AddressError::Malformed(address.to_string()))?;
            let byte = u8::from_str_radix(hex, 16)
                .map_err(|_| AddressError::Malformed(address.to_string()))?;
            out.push(byte);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).map_err(|_| AddressError::Malformed(address.to_string()))
}

impl FromStr for Address {
    type Err = AddressError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let s = s.trim();
        let (transport, params) = s
            .split_once(':')
            .ok_or_else(|| AddressError::Malformed(s.to_string()))?;

        let mut pairs = Vec::new();
        for pair in params.split(',').filter(|p| !p.is_empty()) {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| AddressError::Malformed(s.to_string()))?;
            pairs.push((key, unescape(value, s)?));
        }
        let get = |key: &str| {
            pairs
                .iter()
                .find(|(k, _)| *k == key)
                .map(|(_, v)| v.clone())
        };
        let guid = get("guid");

        match transport {
            "unix" => {
                if get("abstract").is_some() || get("tmpdir").is_some() || get("dir").is_some() {
                    return Err(AddressError::UnsupportedTransport(format!(
                        "unix without path ({})",
                        s
                    )));
                }
                let path = get("path").ok_or_else(|| AddressError::MissingKey {
                    address: s.to_string(),
                    key: "path",
                })?;
                Ok(Address::Unix {
                    path: PathBuf::from(path),
                    guid,
                })
            }
            "tcp" => {
                let host = get("host").unwrap_or_else(|| "localhost".to_string());
                let port = get("port")
                    .ok_or_else(|| AddressError::MissingKey {
                        address: s.to_string(),
                        key: "port",
                    })?
                    .parse()
                    .map_err(|_| AddressError::Malformed(s.to_string()))?;
                Ok(Address::Tcp { host, port, guid })
            }
            other => Err(AddressError::UnsupportedTransport(other.to_string())),
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Unix { path, .. } => write!(f, "unix:path={}", path.display())?,
            Address::Tcp { host, port, .. } => write!(f, "tcp:host={},port={}", host, port)?,
        }
        if let Some(guid) = self.guid() {
            write!(f, ",guid={}", guid)?;
        }
        Ok(())
    }
}

/// A connected byte stream.
#[derive(Debug)]
pub enum Transport {
    Unix(UnixStream),
    Tcp(TcpStream),
}

impl Transport {
    /// UID of the process on the other end, as reported by the kernel.
    pub fn peer_uid(&self) -> Option<u32> {
        match self {
            Transport::Unix(stream) => stream.peer_cred().ok().map(|cred| cred.uid()),
            Transport::Tcp(_) => None,
        }
    }

    /// Whether file descriptors can be passed over this transport.
    ///
    /// Always false: frames go out as plain bytes without SCM_RIGHTS data.
    pub fn supports_unix_fd(&self) -> bool {
        false
    }
}

impl AsyncRead for Transport {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Unix(s) => Pin::new(s).poll_read(cx, buf),
            Transport::Tcp(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Transport {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Transport::Unix(s) => Pin::new(s).poll_write(cx, buf),
            Transport::Tcp(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Unix(s) => Pin::new(s).poll_flush(cx),
            Transport::Tcp(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Unix(s) => Pin::new(s).poll_shutdown(cx),
            Transport::Tcp(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// A bound listener.
#[derive(Debug)]
pub enum Listener {
    Unix { listener: UnixListener, path: PathBuf },
    Tcp(TcpListener),
}

impl Listener {
    /// Accept the next connection.
    pub async fn accept(&self) -> Result<Transport> {
        let transport = match self {
            Listener::Unix { listener, .. } => Transport::Unix(listener.accept().await?.0),
            Listener::Tcp(listener) => {
                let (stream, peer) = listener.accept().await?;
                debug!(peer = %peer, "Accepted TCP connection");
                stream.set_nodelay(true)?;
                Transport::Tcp(stream)
            }
        };
        Ok(transport)
    }

    /// Socket path, for Unix listeners.
    pub fn path(&self) -> Option<&Path> {
        match self {
            Listener::Unix { path, .. } => Some(path),
            Listener::Tcp(_) => None,
        }
    }

    /// Address clients can connect to.
    pub fn local_address(&self) -> Result<Address> {
        match self {
            Listener::Unix { path, .. } => Ok(Address::Unix {
                path: path.clone(),
                guid: None,
            }),
            Listener::Tcp(listener) => {
                let local = listener.local_addr()?;
                Ok(Address::Tcp {
                    host: local.ip().to_string(),
                    port: local.port(),
                    guid: None,
                })
            }
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Listener::Unix { path, .. } = self {
            let _ = std::fs::remove_file(path);
        }
    }
}
