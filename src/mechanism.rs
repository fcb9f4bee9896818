//! Mechanism-specific pieces of the handshake: challenge responders for the
//! client side and response verifiers for the server side.

use std::time::{SystemTime, UNIX_EPOCH};

use rand::{Rng, RngCore};
use sha1::{Digest, Sha1};
use tracing::{debug, trace};

use crate::cookie::{CookieStore, COOKIE_CONTEXT, LOCK_TIMEOUT};
use crate::error::AuthError;

/// Server-side state of an in-flight DBUS_COOKIE_SHA1 exchange.
#[derive(Debug, Clone)]
pub struct Sha1Challenge {
    pub context: String,
    pub id: u64,
    pub challenge: String,
    pub secret: String,
}

/// Outcome of running a server-side verifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Authenticated.
    Ok,
    /// Send `DATA <payload>` and wait for the client's answer.
    Continue(String),
    /// Credentials refused; offer the mechanism list again.
    Reject,
    /// The client's data was malformed or wrong.
    Error,
}

/// Encode a UID as hex for D-Bus auth.
pub fn encode_uid(uid: u32) -> String {
    hex::encode(uid.to_string())
}

/// Parse a hex-encoded UID.
pub fn parse_hex_uid(hex: &str) -> Result<u32, AuthError> {
    decode_hex_str(hex)?
        .parse::<u32>()
        .map_err(|e| AuthError::InvalidData(format!("Invalid UID: {}", e)))
}

/// Decode hex into a UTF-8 string.
pub fn decode_hex_str(data: &str) -> Result<String, AuthError> {
    let bytes = hex::decode(data).map_err(|e| AuthError::InvalidData(format!("Invalid hex: {}", e)))?;
    String::from_utf8(bytes).map_err(|e| AuthError::InvalidData(format!("Invalid UTF-8: {}", e)))
}

fn sha1_hex(data: &[u8]) -> String {
    hex::encode(Sha1::digest(data))
}

/// Random low-order bits of a cookie id.
const COOKIE_ID_RANDOM_BITS: u32 = 10;

/// Cookie id for a key minted at `millis`. Servers minting in the same
/// millisecond still pick distinct ids.
fn new_cookie_id(millis: u64) -> u64 {
    let low = rand::thread_rng().gen_range(0..1u64 << COOKIE_ID_RANDOM_BITS);
    (millis << COOKIE_ID_RANDOM_BITS) | low
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// `hex(SHA1("<server>:<client>:<secret>"))`, the proof both sides compute.
pub fn sha1_response_hash(server_challenge: &str, client_challenge: &str, secret: &str) -> String {
    sha1_hex(format!("{}:{}:{}", server_challenge, client_challenge, secret).as_bytes())
}

/// Client side: answer a `DATA` challenge for DBUS_COOKIE_SHA1.
///
/// The challenge decodes to `"<context> <cookie-id> <server-challenge>"`; the
/// returned payload is `hex("<client-challenge> <hash>")`.
pub async fn sha1_client_response(store: &CookieStore, challenge_hex: &str) -> Result<String, AuthError> {
    let decoded = decode_hex_str(challenge_hex)?;
    let parts: Vec<&str> = decoded.split(' ').collect();
    let [context, id, server_challenge] = parts.as_slice() else {
        return Err(AuthError::InvalidData(format!(
            "Expected 3 challenge fields, got {}",
            parts.len()
        )));
    };
    let id: u64 = id
        .parse()
        .map_err(|e| AuthError::InvalidData(format!("Invalid cookie id: {}", e)))?;

    let mut random = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut random);
    let client_challenge = sha1_hex(&random);

    let secret = store
        .find_with_retry(context, id, LOCK_TIMEOUT)
        .await
        .map_err(|e| AuthError::InvalidData(e.to_string()))?
        .ok_or_else(|| AuthError::CookieNotFound {
            context: context.to_string(),
            id,
        })?;

    let hash = sha1_response_hash(server_challenge, &client_challenge, &secret);
    trace!(context = %context, id = id, "Answered SHA1 challenge");
    Ok(hex::encode(format!("{} {}", client_challenge, hash)))
}

/// Server side: mint and persist a cookie, returning the challenge to send.
pub async fn sha1_server_challenge(store: &CookieStore) -> Result<(Sha1Challenge, String), AuthError> {
    let millis = unix_millis();
    let id = new_cookie_id(millis);
    let mut random = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut random);
    let challenge = sha1_hex(&random[..8]);
    let secret = sha1_hex(&random[8..]);

    let writer = store.clone();
    let context = COOKIE_CONTEXT.to_string();
    let timestamp = (millis / 1000) as i64;
    let stored_secret = secret.clone();
    tokio::task::spawn_blocking(move || writer.add(&context, id, timestamp, &stored_secret))
        .await
        .map_err(|e| AuthError::InvalidData(format!("Keyring task failed: {}", e)))?
        .map_err(|e| AuthError::InvalidData(e.to_string()))?;

    debug!(context = %COOKIE_CONTEXT, id = id, "Sending SHA1 challenge");
    let payload = hex::encode(format!("{} {} {}", COOKIE_CONTEXT, id, challenge));
    Ok((
        Sha1Challenge {
            context: COOKIE_CONTEXT.to_string(),
            id,
            challenge,
            secret,
        },
        payload,
    ))
}

/// Server side: check the client's `hex("<client-challenge> <hash>")`.
pub fn sha1_server_verify(state: &Sha1Challenge, data_hex: &str) -> Verdict {
    let Ok(decoded) = decode_hex_str(data_hex) else {
        return Verdict::Error;
    };
    let Some((client_challenge, hash)) = decoded.split_once(' ') else {
        return Verdict::Error;
    };
    let expected = sha1_response_hash(&state.challenge, client_challenge, &state.secret);
    debug!(remote = %hash, local = %expected, "Verifying SHA1 response");
    if expected.eq_ignore_ascii_case(hash.trim()) {
        Verdict::Ok
    } else {
        Verdict::Error
    }
}

/// Server side EXTERNAL check.
///
/// The claimed UID must match our own UID and, when the kernel told us who
/// is on the other end of the socket, that UID as well.
pub fn external_verify(claimed_hex: &str, local_uid: u32, kernel_uid: Option<u32>) -> Verdict {
    let Ok(claimed) = decode_hex_str(claimed_hex) else {
        return Verdict::Reject;
    };
    let claimed = claimed.trim();
    let local_ok = claimed.eq_ignore_ascii_case(&local_uid.to_string());
    let kernel_ok = kernel_uid.map_or(true, |k| claimed.eq_ignore_ascii_case(&k.to_string()));
    if local_ok && kernel_ok {
        Verdict::Ok
    } else {
        debug!(claimed = %claimed, local_uid, kernel_uid = ?kernel_uid, "EXTERNAL uid mismatch");
        Verdict::Reject
    }
}
