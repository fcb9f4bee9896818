//! kapsule-dbus-conn - D-Bus peer connection tool.
//!
//! Serves a minimal peer-to-peer D-Bus object, or connects to one (or to a bus)
//! to ping it and read its introspection data.

use std::path::PathBuf;
use std::time::Instant;

use clap::{Parser, Subcommand};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use zbus::message::Message;

use kapsule_dbus_conn::address::Address;
use kapsule_dbus_conn::auth::generate_guid;
use kapsule_dbus_conn::message::{
    error_names, first_string_arg, Envelope, ErrorBuilder, MethodReturnBuilder, INTROSPECTABLE_INTERFACE,
};
use kapsule_dbus_conn::{Connection, ConnectionConfig, Result};

const PEER_INTERFACE: &str = "org.freedesktop.DBus.Peer";

/// D-Bus peer connection tool.
#[derive(Parser, Debug)]
#[command(name = "kapsule-dbus-conn")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TOML configuration file.
    #[arg(long, short = 'c', global = true)]
    config: Option<PathBuf>,

    /// Log level filter (e.g., "debug", "info", "warn", "error").
    #[arg(long, short = 'v', default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Listen for peers and answer Ping on every object path.
    Serve {
        /// Address to listen on, e.g. "unix:path=/tmp/peer.sock".
        #[arg(long, short = 'l')]
        listen: String,
    },
    /// Ping a peer or bus.
    Ping {
        /// Address to connect to. Defaults to DBUS_SESSION_BUS_ADDRESS.
        #[arg(long, short = 'a')]
        address: Option<String>,

        /// Destination name (for bus connections).
        #[arg(long, short = 'd')]
        destination: Option<String>,

        /// Object path to ping.
        #[arg(long, short = 'p', default_value = "/")]
        path: String,
    },
    /// Print the introspection data of an object.
    Introspect {
        /// Address to connect to. Defaults to DBUS_SESSION_BUS_ADDRESS.
        #[arg(long, short = 'a')]
        address: Option<String>,

        /// Destination name (for bus connections).
        #[arg(long, short = 'd')]
        destination: Option<String>,

        /// Object path to introspect.
        #[arg(long, short = 'p', default_value = "/")]
        path: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up tracing/logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .init();

    let config = match &args.config {
        Some(path) => ConnectionConfig::from_file(path)?,
        None => ConnectionConfig::default(),
    }
    .with_env()?;
    debug!(config = ?config, "Loaded configuration");

    match args.command {
        Command::Serve { listen } => serve(&listen, config).await,
        Command::Ping {
            address,
            destination,
            path,
        } => {
            let conn = open(address, &config).await?;
            let started = Instant::now();
            conn.call_method(destination.as_deref(), &path, Some(PEER_INTERFACE), "Ping", &())
                .await?;
            println!("Pong from {} in {:?}", path, started.elapsed());
            conn.close().await;
            Ok(())
        }
        Command::Introspect {
            address,
            destination,
            path,
        } => {
            let conn = open(address, &config).await?;
            let reply = conn
                .call_method(
                    destination.as_deref(),
                    &path,
                    Some(INTROSPECTABLE_INTERFACE),
                    "Introspect",
                    &(),
                )
                .await?;
            println!("{}", first_string_arg(&reply).unwrap_or_default());
            conn.close().await;
            Ok(())
        }
    }
}

/// Connect to `address`, or to the session bus (with Hello) when absent.
async fn open(address: Option<String>, config: &ConnectionConfig) -> Result<Connection> {
    match address {
        Some(address) => Connection::connect(&address, config).await,
        None => Connection::session(config).await,
    }
}

/// Answers `org.freedesktop.DBus.Peer.Ping` anywhere below `/`.
fn peer_object(_path: &str, call: &Message) -> Option<Message> {
    let reply = match (call.interface_str().as_deref(), call.member_str().as_deref()) {
        (Some(PEER_INTERFACE) | None, Some("Ping")) => MethodReturnBuilder::new(call).build_empty(),
        (_, member) => ErrorBuilder::new(call, error_names::UNKNOWN_METHOD)
            .build(&format!("No such method {}", member.unwrap_or_default())),
    };
    match reply {
        Ok(reply) => Some(reply),
        Err(e) => {
            warn!(error = %e, "Failed to build reply");
            None
        }
    }
}

async fn serve(listen: &str, config: ConnectionConfig) -> Result<()> {
    let address: Address = listen.parse()?;
    let listener = address.bind().await?;
    let guid = address.guid().map(str::to_string).unwrap_or_else(generate_guid);

    info!(listen = %address, guid = %guid, "Starting kapsule-dbus-conn");

    // Handle shutdown signals
    let shutdown = async {
        tokio::signal::ctrl_c().await.ok();
        info!("Received shutdown signal");
    };
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let transport = match accepted {
                    Ok(transport) => transport,
                    Err(e) => {
                        error!(error = %e, "Error accepting peer connection");
                        continue;
                    }
                };
                let config = config.clone();
                let guid = guid.clone();
                tokio::spawn(async move {
                    let conn = match Connection::server(transport, &config, &guid).await {
                        Ok(conn) => conn,
                        Err(e) => {
                            warn!(error = %e, "Peer failed to authenticate");
                            return;
                        }
                    };
                    if let Err(e) = conn.export_fallback("/", peer_object).await {
                        error!(error = %e, "Failed to export peer object");
                        return;
                    }
                    info!(peer_uid = ?conn.peer_uid(), mechanism = %conn.mechanism(), "Peer connected");
                    conn.wait_disconnected().await;
                    info!(peer_uid = ?conn.peer_uid(), "Peer disconnected");
                });
            }
            _ = &mut shutdown => {
                info!("Shutting down");
                return Ok(());
            }
        }
    }
}
