//! Integration tests for the D-Bus SASL handshake.
//!
//! These tests verify the complete authentication flow including:
//! - Client and server negotiators talking to each other
//! - Mechanism fallback and exhaustion
//! - FD passing negotiation
//! - Raw-protocol clients (systemd/busctl style) against the server
//! - Protocol violations

use std::time::Duration;

use tempfile::tempdir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::time::timeout;

use kapsule_dbus_conn::auth::{generate_guid, AuthNegotiator, MAX_HANDSHAKE_LINES};
use kapsule_dbus_conn::error::AuthError;
use kapsule_dbus_conn::mechanism::encode_uid;
use kapsule_dbus_conn::{AuthScheme, CookieStore, Error};

const TEST_TIMEOUT: Duration = Duration::from_secs(5);

fn current_uid() -> u32 {
    nix::unistd::getuid().as_raw()
}

fn server(mechanisms: &[AuthScheme]) -> AuthNegotiator {
    AuthNegotiator::server()
        .with_mechanisms(mechanisms.iter().copied())
        .with_peer_uid(Some(current_uid()))
}

fn client(mechanisms: &[AuthScheme]) -> AuthNegotiator {
    AuthNegotiator::client().with_mechanisms(mechanisms.iter().copied())
}

/// Helper to read a line response from the stream.
async fn read_response(stream: &mut UnixStream) -> String {
    let mut buf = vec![0u8; 256];
    let mut response = String::new();

    loop {
        let n = stream.read(&mut buf).await.expect("Failed to read response");
        if n == 0 {
            panic!("Unexpected EOF while reading response");
        }
        response.push_str(&String::from_utf8_lossy(&buf[..n]));
        if response.contains('\n') {
            break;
        }
    }

    response.trim_end_matches('\n').trim_end_matches('\r').to_string()
}

async fn send_line(stream: &mut UnixStream, line: &str) {
    stream
        .write_all(format!("{}\r\n", line).as_bytes())
        .await
        .expect("Failed to write line");
    stream.flush().await.expect("Failed to flush");
}

// ============================================================================
// Negotiator against negotiator
// ============================================================================

#[tokio::test]
async fn test_default_client_picks_external() {
    let (mut a, mut b) = UnixStream::pair().unwrap();
    let srv = server(&AuthScheme::REAL);
    let cli = AuthNegotiator::client();

    let (server_result, client_result) = timeout(TEST_TIMEOUT, async {
        tokio::join!(srv.negotiate(&mut a), cli.negotiate(&mut b))
    })
    .await
    .expect("Handshake timed out");

    let server_outcome = server_result.unwrap();
    let client_outcome = client_result.unwrap();

    assert_eq!(server_outcome.mechanism, AuthScheme::External);
    assert_eq!(client_outcome.mechanism, AuthScheme::External);
    assert_eq!(client_outcome.guid, srv.guid());
    assert_eq!(server_outcome.uid, Some(current_uid()));
    assert!(!client_outcome.unix_fd);
}

#[tokio::test]
async fn test_anonymous() {
    let (mut a, mut b) = UnixStream::pair().unwrap();
    let srv = server(&[AuthScheme::Anonymous]);
    let cli = client(&[AuthScheme::Anonymous]);

    let (server_result, client_result) = tokio::join!(srv.negotiate(&mut a), cli.negotiate(&mut b));

    assert_eq!(server_result.unwrap().mechanism, AuthScheme::Anonymous);
    let outcome = client_result.unwrap();
    assert_eq!(outcome.mechanism, AuthScheme::Anonymous);
    assert_eq!(outcome.uid, None);
}

#[tokio::test]
async fn test_cookie_sha1_with_shared_keyring() {
    let dir = tempdir().unwrap();
    let store = CookieStore::new(dir.path().join("keyrings"));
    let (mut a, mut b) = UnixStream::pair().unwrap();
    let srv = server(&[AuthScheme::CookieSha1]).with_cookie_store(store.clone());
    let cli = client(&[AuthScheme::CookieSha1]).with_cookie_store(store);

    let (server_result, client_result) = timeout(TEST_TIMEOUT, async {
        tokio::join!(srv.negotiate(&mut a), cli.negotiate(&mut b))
    })
    .await
    .expect("Handshake timed out");

    assert_eq!(server_result.unwrap().mechanism, AuthScheme::CookieSha1);
    assert_eq!(client_result.unwrap().mechanism, AuthScheme::CookieSha1);
    assert!(dir.path().join("keyrings").join("org_freedesktop_general").exists());
}

#[tokio::test]
async fn test_fallback_when_first_choice_unsupported() {
    let (mut a, mut b) = UnixStream::pair().unwrap();
    let srv = server(&[AuthScheme::Anonymous]);
    let cli = client(&[AuthScheme::External, AuthScheme::Anonymous]);

    let (server_result, client_result) = tokio::join!(srv.negotiate(&mut a), cli.negotiate(&mut b));
    server_result.unwrap();
    assert_eq!(client_result.unwrap().mechanism, AuthScheme::Anonymous);
}

#[tokio::test]
async fn test_external_wrong_kernel_uid_falls_back() {
    let (mut a, mut b) = UnixStream::pair().unwrap();
    let srv = AuthNegotiator::server()
        .with_mechanisms([AuthScheme::External, AuthScheme::Anonymous])
        .with_peer_uid(Some(current_uid().wrapping_add(1)));
    let cli = AuthNegotiator::client();

    let (server_result, client_result) = tokio::join!(srv.negotiate(&mut a), cli.negotiate(&mut b));
    assert_eq!(server_result.unwrap().mechanism, AuthScheme::Anonymous);
    assert_eq!(client_result.unwrap().mechanism, AuthScheme::Anonymous);
}

#[tokio::test]
async fn test_no_common_mechanism_exhausts() {
    let (mut a, mut b) = UnixStream::pair().unwrap();
    let srv = server(&[AuthScheme::External]);
    let cli = client(&[AuthScheme::Anonymous]);

    // the server never finishes on its own; run it in the background
    let server_task = tokio::spawn(async move { srv.negotiate(&mut a).await });
    let client_result = timeout(TEST_TIMEOUT, cli.negotiate(&mut b)).await;

    let err = client_result.expect("Client should not hang").unwrap_err();
    assert!(matches!(err, Error::Auth(AuthError::Exhausted)), "got {err:?}");

    drop(b);
    let server_result = timeout(TEST_TIMEOUT, server_task).await.unwrap().unwrap();
    assert!(server_result.is_err(), "Server must fail once the client hangs up");
}

#[tokio::test]
async fn test_fd_negotiation_agreed() {
    let (mut a, mut b) = UnixStream::pair().unwrap();
    let srv = server(&[AuthScheme::External]).with_unix_fd(true);
    let cli = client(&[AuthScheme::External]).with_unix_fd(true);

    let (server_result, client_result) = tokio::join!(srv.negotiate(&mut a), cli.negotiate(&mut b));
    assert!(server_result.unwrap().unix_fd);
    assert!(client_result.unwrap().unix_fd);
}

#[tokio::test]
async fn test_fd_negotiation_refused() {
    let (mut a, mut b) = UnixStream::pair().unwrap();
    let srv = server(&[AuthScheme::External]).with_unix_fd(false);
    let cli = client(&[AuthScheme::External]).with_unix_fd(true);

    let (server_result, client_result) = tokio::join!(srv.negotiate(&mut a), cli.negotiate(&mut b));
    assert!(!server_result.unwrap().unix_fd);
    assert!(!client_result.unwrap().unix_fd);
}

// ============================================================================
// Raw protocol clients against the server
// ============================================================================

#[tokio::test]
async fn test_raw_external_with_initial_response() {
    let (mut a, mut b) = UnixStream::pair().unwrap();
    let guid = generate_guid();
    let srv = AuthNegotiator::server_with_guid(guid.clone())
        .with_mechanisms([AuthScheme::External])
        .with_peer_uid(Some(current_uid()))
        .with_unix_fd(true);

    let server_task = tokio::spawn(async move { srv.negotiate(&mut a).await });

    b.write_all(&[0u8]).await.unwrap();
    send_line(&mut b, &format!("AUTH EXTERNAL {}", encode_uid(current_uid()))).await;
    assert_eq!(read_response(&mut b).await, format!("OK {}", guid));

    send_line(&mut b, "NEGOTIATE_UNIX_FD").await;
    assert_eq!(read_response(&mut b).await, "AGREE_UNIX_FD");

    // BEGIN and the first message bytes arrive together
    b.write_all(b"BEGIN\r\nl\x01\x00\x01").await.unwrap();

    let outcome = timeout(TEST_TIMEOUT, server_task).await.unwrap().unwrap().unwrap();
    assert!(outcome.unix_fd);
    assert_eq!(outcome.buffered_data, b"l\x01\x00\x01");
}

#[tokio::test]
async fn test_raw_external_challenge_response() {
    let (mut a, mut b) = UnixStream::pair().unwrap();
    let srv = server(&[AuthScheme::External]);
    let guid = srv.guid().to_string();

    let server_task = tokio::spawn(async move { srv.negotiate(&mut a).await });

    b.write_all(&[0u8]).await.unwrap();
    send_line(&mut b, "AUTH EXTERNAL").await;
    assert_eq!(read_response(&mut b).await, "DATA");

    // empty DATA: authenticate as whoever the kernel says we are
    send_line(&mut b, "DATA").await;
    assert_eq!(read_response(&mut b).await, format!("OK {}", guid));
    send_line(&mut b, "BEGIN").await;

    let outcome = timeout(TEST_TIMEOUT, server_task).await.unwrap().unwrap().unwrap();
    assert_eq!(outcome.uid, Some(current_uid()));
    assert!(outcome.buffered_data.is_empty());
}

#[tokio::test]
async fn test_raw_unknown_mechanism_then_anonymous() {
    let (mut a, mut b) = UnixStream::pair().unwrap();
    let srv = server(&[AuthScheme::Anonymous]);
    let server_task = tokio::spawn(async move { srv.negotiate(&mut a).await });

    b.write_all(&[0u8]).await.unwrap();
    send_line(&mut b, "AUTH KERBEROS_V4 abcd").await;
    assert_eq!(read_response(&mut b).await, "REJECTED ANONYMOUS");

    send_line(&mut b, "AUTH ANONYMOUS").await;
    assert!(read_response(&mut b).await.starts_with("OK "));
    send_line(&mut b, "BEGIN").await;

    let outcome = timeout(TEST_TIMEOUT, server_task).await.unwrap().unwrap().unwrap();
    assert_eq!(outcome.mechanism, AuthScheme::Anonymous);
}

#[tokio::test]
async fn test_missing_null_byte() {
    let (mut a, mut b) = UnixStream::pair().unwrap();
    let srv = server(&[AuthScheme::Anonymous]);
    let server_task = tokio::spawn(async move { srv.negotiate(&mut a).await });

    send_line(&mut b, "AUTH ANONYMOUS").await;

    let err = timeout(TEST_TIMEOUT, server_task).await.unwrap().unwrap().unwrap_err();
    assert!(matches!(err, Error::Auth(AuthError::ExpectedNullByte)), "got {err:?}");
}

#[tokio::test]
async fn test_unparseable_line_is_protocol_violation() {
    let (mut a, mut b) = UnixStream::pair().unwrap();
    let srv = server(&[AuthScheme::Anonymous]);
    let server_task = tokio::spawn(async move { srv.negotiate(&mut a).await });

    b.write_all(&[0u8]).await.unwrap();
    send_line(&mut b, "HELLO THERE").await;

    let err = timeout(TEST_TIMEOUT, server_task).await.unwrap().unwrap().unwrap_err();
    assert!(matches!(err, Error::Auth(AuthError::ProtocolViolation(_))), "got {err:?}");
}

#[tokio::test]
async fn test_begin_before_auth_fails() {
    let (mut a, mut b) = UnixStream::pair().unwrap();
    let srv = server(&[AuthScheme::Anonymous]);
    let server_task = tokio::spawn(async move { srv.negotiate(&mut a).await });

    b.write_all(&[0u8]).await.unwrap();
    send_line(&mut b, "BEGIN").await;

    let result = timeout(TEST_TIMEOUT, server_task).await.unwrap().unwrap();
    assert!(result.is_err());
}

#[tokio::test]
async fn test_line_limit_bounds_handshake() {
    let (mut a, mut b) = UnixStream::pair().unwrap();
    let srv = server(&[AuthScheme::Anonymous]);
    let server_task = tokio::spawn(async move { srv.negotiate(&mut a).await });

    // Each stray DATA gets an ERROR and leaves the server waiting
    let mut flood = vec![0u8];
    for _ in 0..=MAX_HANDSHAKE_LINES {
        flood.extend_from_slice(b"DATA\r\n");
    }
    b.write_all(&flood).await.unwrap();

    let err = timeout(TEST_TIMEOUT, server_task).await.unwrap().unwrap().unwrap_err();
    assert!(matches!(err, Error::Auth(AuthError::ProtocolViolation(_))), "got {err:?}");
}

// ============================================================================
// Raw server against the client
// ============================================================================

#[tokio::test]
async fn test_client_rejects_garbage_from_server() {
    let (mut a, mut b) = UnixStream::pair().unwrap();
    let cli = client(&[AuthScheme::Anonymous]);
    let client_task = tokio::spawn(async move { cli.negotiate(&mut b).await });

    let mut first = [0u8; 1];
    a.read_exact(&mut first).await.unwrap();
    assert_eq!(first[0], 0);
    assert_eq!(read_response(&mut a).await, "AUTH");

    send_line(&mut a, "WHATEVER").await;

    let err = timeout(TEST_TIMEOUT, client_task).await.unwrap().unwrap().unwrap_err();
    assert!(matches!(err, Error::Auth(AuthError::ProtocolViolation(_))), "got {err:?}");
}

#[tokio::test]
async fn test_client_answers_error_with_cancel() {
    let (mut a, mut b) = UnixStream::pair().unwrap();
    let cli = client(&[AuthScheme::External, AuthScheme::Anonymous]);
    let client_task = tokio::spawn(async move { cli.negotiate(&mut b).await });

    let mut first = [0u8; 1];
    a.read_exact(&mut first).await.unwrap();
    assert_eq!(read_response(&mut a).await, "AUTH");

    send_line(&mut a, "REJECTED EXTERNAL ANONYMOUS").await;
    assert!(read_response(&mut a).await.starts_with("AUTH EXTERNAL "));

    send_line(&mut a, "ERROR").await;
    assert_eq!(read_response(&mut a).await, "CANCEL");

    send_line(&mut a, "REJECTED EXTERNAL ANONYMOUS").await;
    assert_eq!(read_response(&mut a).await, "AUTH ANONYMOUS");

    send_line(&mut a, "OK 0123456789abcdef0123456789abcdef").await;
    assert_eq!(read_response(&mut a).await, "BEGIN");

    let outcome = timeout(TEST_TIMEOUT, client_task).await.unwrap().unwrap().unwrap();
    assert_eq!(outcome.mechanism, AuthScheme::Anonymous);
    assert_eq!(outcome.guid, "0123456789abcdef0123456789abcdef");
}
