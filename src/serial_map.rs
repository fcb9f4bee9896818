//! Serial number mapping for correlating D-Bus replies.
//!
//! Every outstanding call registers a [`PendingCall`] under the serial it was
//! sent with. The reader resolves it when a reply carrying that serial as its
//! reply serial arrives; the caller removes it again on timeout. Whichever
//! happens first wins, the other is a no-op.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::oneshot;

use crate::error::CallError;

/// Information about a pending method call.
#[derive(Debug)]
pub struct PendingCall<M> {
    /// The serial the call was sent with.
    pub serial: u32,
    /// When the call was made.
    pub created_at: Instant,
    slot: oneshot::Sender<M>,
}

impl<M> PendingCall<M> {
    /// Time since the call was registered.
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }
}

/// Outstanding calls keyed by serial.
#[derive(Debug)]
pub struct SerialMap<M> {
    pending: HashMap<u32, PendingCall<M>>,
    connected: bool,
}

impl<M> Default for SerialMap<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M> SerialMap<M> {
    /// Create an empty, connected map.
    pub fn new() -> Self {
        Self {
            pending: HashMap::new(),
            connected: true,
        }
    }

    /// Register a call and get the receiver its reply will be delivered on.
    pub fn insert(&mut self, serial: u32) -> Result<oneshot::Receiver<M>, CallError> {
        if !self.connected {
            return Err(CallError::NotConnected);
        }
        if self.pending.contains_key(&serial) {
            return Err(CallError::DuplicateSerial(serial));
        }

        let (slot, rx) = oneshot::channel();
        self.pending.insert(
            serial,
            PendingCall {
                serial,
                created_at: Instant::now(),
                slot,
            },
        );
        Ok(rx)
    }

    /// Deliver a reply. Returns `false` if nothing was waiting on `serial`.
    pub fn resolve(&mut self, serial: u32, reply: M) -> bool {
        match self.pending.remove(&serial) {
            // The waiter may have given up between removal and send; that is fine.
            Some(call) => {
                let _ = call.slot.send(reply);
                true
            }
            None => false,
        }
    }

    /// Drop a pending call without resolving it.
    pub fn remove(&mut self, serial: u32) -> Option<PendingCall<M>> {
        self.pending.remove(&serial)
    }

    /// Mark the map disconnected and release every waiter.
    ///
    /// Dropping the result slots wakes the receivers with an error, which
    /// callers map to [`CallError::NotConnected`]. Returns how many were waiting.
    pub fn disconnect(&mut self) -> usize {
        self.connected = false;
        let released = self.pending.len();
        self.pending.clear();
        released
    }

    /// Whether new calls are accepted.
    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Get the number of pending calls.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Check if there are no pending calls.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serial_map_insert_resolve() {
        let mut map = SerialMap::new();

        let mut rx = map.insert(100).unwrap();
        assert_eq!(map.len(), 1);

        assert!(map.resolve(100, "reply"));
        assert_eq!(rx.try_recv().unwrap(), "reply");

        // Should be removed now
        assert!(map.is_empty());
        assert!(!map.resolve(100, "again"));
    }

    #[test]
    fn test_duplicate_serial_rejected() {
        let mut map: SerialMap<()> = SerialMap::new();
        let _rx = map.insert(7).unwrap();
        assert_eq!(map.insert(7).unwrap_err(), CallError::DuplicateSerial(7));
    }

    #[test]
    fn test_resolve_after_remove_is_noop() {
        let mut map = SerialMap::new();
        let _rx = map.insert(5).unwrap();

        std::thread::sleep(Duration::from_millis(5));
        let call = map.remove(5).unwrap();
        assert_eq!(call.serial, 5);
        assert!(call.age() >= Duration::from_millis(5));
        assert!(!map.resolve(5, 1u8));
    }

    #[test]
    fn test_resolve_after_waiter_dropped() {
        let mut map = SerialMap::new();
        let rx = map.insert(9).unwrap();
        drop(rx);
        assert!(map.resolve(9, ()));
    }

    #[test]
    fn test_disconnect_wakes_waiters() {
        let mut map: SerialMap<u32> = SerialMap::new();
        let mut first = map.insert(1).unwrap();
        let mut second = map.insert(2).unwrap();

        assert_eq!(map.disconnect(), 2);
        assert!(!map.is_connected());
        assert!(first.try_recv().is_err());
        assert!(second.try_recv().is_err());

        // No new calls after disconnect
        assert_eq!(map.insert(3).unwrap_err(), CallError::NotConnected);
    }
}
