//! Per-user keyring for the DBUS_COOKIE_SHA1 mechanism.
//!
//! The keyring is a directory (normally `~/.dbus-keyrings`) holding one file
//! per context. Each line is `<id> <unix-timestamp> <hex-secret>`. Writers
//! serialize through a `<context>.lock` file and publish via `<context>.temp`.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tracing::{debug, trace, warn};

use crate::error::CookieError;

/// How long writers poll for the lock file, and readers for a fresh cookie.
pub const LOCK_TIMEOUT: Duration = Duration::from_millis(1000);
/// Lifetime servers assume for a freshly minted key.
pub const NEW_KEY_TIMEOUT_SECONDS: i64 = 60 * 5;
/// Cookies older than this are never accepted.
pub const EXPIRE_KEYS_TIMEOUT_SECONDS: i64 = NEW_KEY_TIMEOUT_SECONDS + 60 * 2;
/// Cookies this far in the future indicate clock skew and are refused.
pub const MAX_TIME_TRAVEL_SECONDS: i64 = 60 * 5;
/// Entries older than this (relative to a new entry) are pruned on append.
pub const COOKIE_TIMEOUT_SECONDS: i64 = 240;
/// Context used when this crate acts as the SHA1 server.
pub const COOKIE_CONTEXT: &str = "org_freedesktop_general";

const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// A single keyring entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cookie {
    pub context: String,
    pub id: u64,
    pub created_at: i64,
    pub secret: String,
}

impl Cookie {
    /// Parse one keyring line. Malformed lines yield `None`.
    pub fn parse_line(context: &str, line: &str) -> Option<Self> {
        let mut parts = line.split(' ');
        let id = parts.next()?.parse().ok()?;
        let created_at = parts.next()?.parse().ok()?;
        let secret = parts.next()?;
        if secret.is_empty() || parts.next().is_some() {
            return None;
        }
        Some(Self {
            context: context.to_string(),
            id,
            created_at,
            secret: secret.to_string(),
        })
    }

    /// Whether the cookie may be used at `now` (unix seconds).
    pub fn is_valid_at(&self, now: i64) -> bool {
        self.created_at >= 0
            && self.created_at <= now + MAX_TIME_TRAVEL_SECONDS
            && now - self.created_at <= EXPIRE_KEYS_TIMEOUT_SECONDS
    }

    fn to_line(&self) -> String {
        format!("{} {} {}", self.id, self.created_at, self.secret)
    }
}

/// Current time in unix seconds.
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Access to a keyring directory.
#[derive(Debug, Clone)]
pub struct CookieStore {
    dir: PathBuf,
    lock_timeout: Duration,
}

impl CookieStore {
    /// Keyring rooted at `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            lock_timeout: LOCK_TIMEOUT,
        }
    }

    /// The current user's keyring, `~/.dbus-keyrings`.
    pub fn user_default() -> Result<Self, CookieError> {
        let home = dirs::home_dir().ok_or(CookieError::MissingHomeDirectory)?;
        Ok(Self::new(home.join(".dbus-keyrings")))
    }

    /// Override how long [`add`](Self::add) polls for the lock file.
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// The keyring directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn context_path(&self, context: &str, suffix: &str) -> Result<PathBuf, CookieError> {
        validate_context(context)?;
        Ok(self.dir.join(format!("{}{}", context, suffix)))
    }

    /// Look up a valid secret for `id` in `context`.
    pub fn find(&self, context: &str, id: u64) -> Result<Option<String>, CookieError> {
        self.find_at(context, id, unix_now())
    }

    /// [`find`](Self::find) against an explicit clock.
    pub fn find_at(&self, context: &str, id: u64, now: i64) -> Result<Option<String>, CookieError> {
        let path = self.context_path(context, "")?;
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let found = contents
            .lines()
            .filter_map(|line| Cookie::parse_line(context, line))
            .find(|cookie| cookie.id == id && cookie.is_valid_at(now))
            .map(|cookie| cookie.secret);

        trace!(context = %context, id = id, found = found.is_some(), "Keyring lookup");
        Ok(found)
    }

    /// Poll [`find`](Self::find) until the cookie shows up or `wait` elapses.
    ///
    /// The peer may have written the cookie just before sending its challenge.
    pub async fn find_with_retry(
        &self,
        context: &str,
        id: u64,
        wait: Duration,
    ) -> Result<Option<String>, CookieError> {
        let start = Instant::now();
        loop {
            if let Some(secret) = self.find(context, id)? {
                return Ok(Some(secret));
            }
            if start.elapsed() >= wait {
                return Ok(None);
            }
            tokio::time::sleep(LOCK_POLL_INTERVAL).await;
        }
    }

    /// Append a cookie, pruning stale entries.
    ///
    /// Blocks while polling for the lock file; call from a blocking context.
    pub fn add(&self, context: &str, id: u64, timestamp: i64, secret: &str) -> Result<(), CookieError> {
        let cookie_path = self.context_path(context, "")?;
        let lock_path = self.context_path(context, ".lock")?;
        let temp_path = self.context_path(context, ".temp")?;

        ensure_keyring_dir(&self.dir)?;

        if !acquire_lock(&lock_path, self.lock_timeout) {
            warn!(
                lock = %lock_path.display(),
                "Could not acquire keyring lock, writing anyway"
            );
        }

        let written = write_locked(context, id, timestamp, secret, &cookie_path, &temp_path);
        let released = fs::remove_file(&lock_path).map_err(|source| CookieError::LockRemoval {
            path: lock_path.clone(),
            source,
        });
        // A write error wins over a failed lock removal
        let entries = written?;
        released?;

        debug!(context = %context, id = id, entries, "Stored cookie");
        Ok(())
    }
}

/// Rewrite the keyring with stale entries pruned and the new cookie appended.
/// Caller holds the lock. Returns the number of entries written.
fn write_locked(
    context: &str,
    id: u64,
    timestamp: i64,
    secret: &str,
    cookie_path: &Path,
    temp_path: &Path,
) -> Result<usize, CookieError> {
    let mut lines: Vec<String> = match fs::read_to_string(cookie_path) {
        Ok(contents) => contents
            .lines()
            .filter(|line| match Cookie::parse_line(context, line) {
                Some(cookie) => timestamp - cookie.created_at < COOKIE_TIMEOUT_SECONDS,
                None => {
                    debug!(line = %line, "Dropping malformed keyring line");
                    false
                }
            })
            .map(str::to_string)
            .collect(),
        Err(e) if e.kind() == ErrorKind::NotFound => Vec::new(),
        Err(e) => return Err(e.into()),
    };

    let cookie = Cookie {
        context: context.to_string(),
        id,
        created_at: timestamp,
        secret: secret.to_string(),
    };
    lines.push(cookie.to_line());

    let mut temp = fs::File::create(temp_path)?;
    for line in &lines {
        writeln!(temp, "{}", line)?;
    }
    temp.sync_all()?;
    drop(temp);

    if let Err(first) = fs::rename(temp_path, cookie_path) {
        debug!(error = %first, "Rename over keyring failed, deleting original first");
        if let Err(e) = fs::remove_file(cookie_path) {
            if e.kind() != ErrorKind::NotFound {
                return Err(CookieError::Rename {
                    from: temp_path.to_path_buf(),
                    to: cookie_path.to_path_buf(),
                    source: e,
                });
            }
        }
        fs::rename(temp_path, cookie_path).map_err(|source| CookieError::Rename {
            from: temp_path.to_path_buf(),
            to: cookie_path.to_path_buf(),
            source,
        })?;
    }
    Ok(lines.len())
}

/// Context names become file names; refuse anything that could escape the keyring.
fn validate_context(context: &str) -> Result<(), CookieError> {
    let bad = context.is_empty()
        || context
            .chars()
            .any(|c| c == '/' || c == '\\' || c == '.' || c.is_whitespace() || c.is_control());
    if bad {
        return Err(CookieError::InvalidContext(context.to_string()));
    }
    Ok(())
}

fn ensure_keyring_dir(dir: &Path) -> Result<(), CookieError> {
    if dir.is_dir() {
        return Ok(());
    }
    fs::create_dir_all(dir)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(dir, fs::Permissions::from_mode(0o700))?;
    }
    Ok(())
}

/// Poll for exclusive creation of the lock file. Returns whether it was created.
fn acquire_lock(path: &Path, timeout: Duration) -> bool {
    let start = Instant::now();
    loop {
        match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(_) => return true,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
            Err(e) => {
                warn!(lock = %path.display(), error = %e, "Cannot create keyring lock");
                return false;
            }
        }
        if start.elapsed() >= timeout {
            return false;
        }
        std::thread::sleep(LOCK_POLL_INTERVAL);
    }
}
