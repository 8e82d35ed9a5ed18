//! Connection context & flow state machine (Module H, state half).
//!
//! Source's `pt_context` is one big struct holding the socket, in/out
//! buffers, the installed flow's function pointer plus its predecessor, and
//! every piece of per-session state (challenge, codebook, cached user row,
//! `ctx->time`). The socket and buffers are owned by the task in
//! `handler.rs` instead (they don't need to live on this struct once the
//! read/write loops are plain `async fn`s); everything else lives here.

use std::net::SocketAddr;
use std::time::Instant;

use rand::Rng;
use tokio::sync::mpsc;

use ptserver_protocol::framer::Frame;
use ptserver_protocol::obfuscate::Obfuscator;
use ptserver_protocol::wire::{self, packet};

use crate::model::user::User;

/// Which handler is installed on a connection. `transition_to`/`transition_fro`
/// below realize source's function-pointer swap plus its single-slot
/// `prev_on_packet` stash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Login,
    Registration,
    PasswordReset,
    General,
}

pub type OutTx = mpsc::UnboundedSender<Frame>;

/// Per-connection state. One instance per live socket, owned by its task.
pub struct ConnectionState {
    pub peer: SocketAddr,
    pub flow: Flow,
    prev_flow: Option<Flow>,

    pub protocol_version: u16,
    /// Session-unique value in `[1, CHALLENGE_MAX]`, the seed of the ginger
    /// index and the input to the v8.2+ codebook generation.
    pub challenge: u16,
    pub obfuscator: Obfuscator,

    /// `UID_ALL` until `INITIAL_STATUS`/`LOGIN` resolve a real uid.
    pub uid: u32,
    pub user: Option<User>,
    pub status: u32,
    pub status_msg: Option<String>,
    pub device_id: Option<String>,
    /// Client's server-visible IP, byte-swapped to little-endian on login.
    pub server_ip: Option<u32>,
    pub ccban_level: u32,

    /// Kept apart from `obfuscator`'s LCG seed -- see DESIGN.md Open Question
    /// #7: sharing one field (as source's `ctx->time` did) would let a PING
    /// silently perturb in-flight obfuscation state.
    pub last_ping: Instant,

    pub disconnect: bool,
    out: OutTx,
}

impl ConnectionState {
    pub fn new(peer: SocketAddr, out: OutTx) -> Self {
        let challenge = rand::thread_rng().gen_range(1..=wire::CHALLENGE_MAX);
        ConnectionState {
            peer,
            flow: Flow::Login,
            prev_flow: None,
            protocol_version: 0,
            challenge,
            obfuscator: Obfuscator::new(seed_from_clock()),
            uid: wire::UID_ALL,
            user: None,
            status: wire::STATUS_OFFLINE,
            status_msg: None,
            device_id: None,
            server_ip: None,
            ccban_level: 0,
            last_ping: Instant::now(),
            disconnect: false,
            out,
        }
    }

    pub fn send(&self, frame: Frame) {
        let _ = self.out.send(frame);
    }

    /// A cloned handle to this connection's outbound sender, for registering
    /// with the process-wide registry once login succeeds.
    pub fn out_handle(&self) -> OutTx {
        self.out.clone()
    }

    pub fn send_return_code(&self, code: u16, msg: &str) {
        self.send(Frame::new(packet::RETURN_CODE, build_return_code_body(code, msg)));
    }

    pub fn is_v82_plus(&self) -> bool {
        self.protocol_version >= wire::PROTOCOL_VERSION_82
    }

    pub fn is_legacy_v5(&self) -> bool {
        matches!(self.protocol_version, wire::PROTOCOL_VERSION_50 | wire::PROTOCOL_VERSION_51)
    }

    /// Installs `flow`, stashing the current one (source's `transition_to`).
    pub fn transition_to(&mut self, flow: Flow) {
        self.prev_flow = Some(self.flow);
        self.flow = flow;
    }

    /// Pops the stashed flow, falling back to `General` if there was none
    /// (source's `transition_fro`; every caller that pops has already
    /// transitioned in from somewhere, so this fallback is only reached if
    /// state is corrupt, in which case `General` is the safest handler).
    pub fn transition_fro(&mut self) {
        self.flow = self.prev_flow.take().unwrap_or(Flow::General);
    }

    /// Kick: enqueue `SERVER_DISCONNECT` and mark for teardown. The caller
    /// (`handler.rs`) is responsible for letting the writer drain before
    /// actually closing the socket.
    pub fn kick(&mut self, message: &str) {
        self.send(Frame::new(packet::SERVER_DISCONNECT, message.as_bytes().to_vec()));
        self.disconnect = true;
    }
}

fn seed_from_clock() -> u32 {
    use std::time::{SystemTime, UNIX_EPOCH};
    let d = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
    d.as_nanos() as u32 ^ d.as_secs() as u32
}

/// `[pkt_type:u16 BE][code:u16 BE][msg]`, per the Error & Disconnect section.
pub fn build_return_code_body(code: u16, msg: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(2 + msg.len());
    out.extend_from_slice(&code.to_be_bytes());
    out.extend_from_slice(msg.as_bytes());
    out
}

/// Reads a big-endian `u32` out of `body[off..off+4]`, or `None` if short.
pub fn read_u32_be(body: &[u8], off: usize) -> Option<u32> {
    body.get(off..off + 4).map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
}

pub fn read_u16_be(body: &[u8], off: usize) -> Option<u16> {
    body.get(off..off + 2).map(|b| u16::from_be_bytes([b[0], b[1]]))
}
