//! Server-wide uid -> connection registry & broadcast fabric (Module I).
//!
//! Replaces source's hand-rolled FNV-1a hash table (`uid_to_context`,
//! string-keyed, tombstoned, resized at load-factor thresholds) with a
//! `DashMap` keyed directly by the numeric uid (DESIGN.md Open Question
//! #12). This is the one structural piece the teacher codebase's own
//! `state.rs` modeled for its (entirely different) channel/session concept;
//! the shape -- a concurrent map from identity to a handle carrying an
//! outbound sender -- is kept, the content behind it is not.

use dashmap::DashMap;

use ptserver_protocol::framer::Frame;
use ptserver_protocol::wire::packet;

use crate::context::OutTx;

/// What the registry needs to reach a logged-in connection: just a sender,
/// since the connection's own task owns everything else.
#[derive(Clone)]
pub struct ConnectionHandle {
    pub out: OutTx,
}

/// Process-wide handle->uid map plus the unconditional broadcast primitive.
pub struct Registry {
    by_uid: DashMap<u32, ConnectionHandle>,
}

impl Registry {
    pub fn new() -> Self {
        Registry { by_uid: DashMap::new() }
    }

    pub fn is_online(&self, uid: u32) -> bool {
        self.by_uid.contains_key(&uid)
    }

    pub fn online_count(&self) -> usize {
        self.by_uid.len()
    }

    /// Registers `uid` as live, returning the handle it replaced (if any) so
    /// the caller can kick the incumbent -- this is the multi-login path
    /// (§8 property 5): the newcomer always wins the slot.
    pub fn login(&self, uid: u32, handle: ConnectionHandle) -> Option<ConnectionHandle> {
        self.by_uid.insert(uid, handle)
    }

    pub fn logout(&self, uid: u32) {
        self.by_uid.remove(&uid);
    }

    /// Sends `frame` to `uid` if currently online. Returns whether it was
    /// delivered (the caller typically falls back to offline-message spooling
    /// when this is `false`).
    pub fn send(&self, uid: u32, frame: Frame) -> bool {
        match self.by_uid.get(&uid) {
            Some(handle) => {
                let _ = handle.out.send(frame);
                true
            }
            None => false,
        }
    }

    /// Evicts `uid` with a `SERVER_DISCONNECT` carrying `message`, used both
    /// for multi-login eviction and administrative kicks.
    pub fn kick(&self, uid: u32, message: &str) {
        if let Some((_, handle)) = self.by_uid.remove(&uid) {
            let _ = handle.out.send(Frame::new(packet::SERVER_DISCONNECT, message.as_bytes().to_vec()));
        }
    }

    /// Source's `broadcast(pkt)`: every live, logged-in connection, no room
    /// scoping. Wired to `PACKET_ANNOUNCEMENT` (§4.9) rather than left dead.
    pub fn broadcast(&self, frame: Frame) {
        for entry in self.by_uid.iter() {
            let _ = entry.value().out.send(frame.clone());
        }
    }

    /// Sends `frame` to every uid in `members` except `exclude`, skipping
    /// anyone not currently online. Used by room broadcast and non-admin
    /// filtering (the caller pre-filters `members` by admin status as needed).
    pub fn broadcast_to(&self, members: &[u32], exclude: u32, frame: Frame) {
        for &uid in members {
            if uid == exclude {
                continue;
            }
            self.send(uid, frame.clone());
        }
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn handle() -> (ConnectionHandle, mpsc::UnboundedReceiver<Frame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ConnectionHandle { out: tx }, rx)
    }

    #[test]
    fn multi_login_returns_incumbent() {
        let reg = Registry::new();
        let (h1, _rx1) = handle();
        let (h2, _rx2) = handle();
        assert!(reg.login(42, h1).is_none());
        assert!(reg.login(42, h2).is_some());
        assert!(reg.is_online(42));
    }

    #[test]
    fn broadcast_reaches_all_but_not_logged_out() {
        let reg = Registry::new();
        let (h1, mut rx1) = handle();
        let (h2, mut rx2) = handle();
        reg.login(1, h1);
        reg.login(2, h2);
        reg.logout(2);
        reg.broadcast(Frame::empty(packet::ANNOUNCEMENT));
        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_err());
    }
}
