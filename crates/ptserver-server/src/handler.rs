//! Per-connection accept/read loop & teardown (Module I, connection half).
//!
//! Source drives every connection through one `select()`-based reactor
//! thread, dispatching to the installed flow's function pointer as packets
//! arrive and writing replies back through the same fd. Here each
//! connection gets its own task, split into a read loop (this function) and
//! a writer task drained from an `mpsc` channel -- the teacher's `tcp.rs`
//! shape, stripped of TLS (source spoke raw framed TCP; see DESIGN.md).

use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{info, warn};

use ptserver_protocol::framer::{read_frame, write_frame, Frame};
use ptserver_protocol::wire::{self, packet};

use crate::context::ConnectionState;
use crate::db::{self, Db};
use crate::flows::{self, login};
use crate::model::room;
use crate::registry::Registry;

/// Handles one accepted TCP connection start to finish: opens a dedicated
/// read-only DB handle, spawns the writer task, runs the read/dispatch loop
/// until disconnect, then tears down room membership and registry presence.
pub async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    db: Arc<Db>,
    db_path: Arc<Path>,
    registry: Arc<Registry>,
    active_connections: Arc<AtomicU32>,
) {
    let _guard = ConnectionCountGuard(active_connections);

    let reader = match db::open_reader(&db_path) {
        Ok(c) => c,
        Err(e) => {
            warn!(%peer, error = %e, "failed to open reader connection for new client");
            return;
        }
    };

    let (read_half, mut write_half) = stream.into_split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Frame>();

    let writer_peer = peer;
    let writer_handle = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            if let Err(e) = write_frame(&mut write_half, &frame).await {
                warn!(peer = %writer_peer, error = %e, "write error, closing connection");
                break;
            }
        }
    });

    let mut state = ConnectionState::new(peer, out_tx);
    login::enter(&state);

    let mut read_half = read_half;
    loop {
        let frame = match read_frame(&mut read_half).await {
            Ok(Some(f)) => f,
            Ok(None) => break,
            Err(e) => {
                warn!(%peer, error = %e, "frame read error, closing connection");
                break;
            }
        };

        if let Err(e) = flows::dispatch(&mut state, &frame, &reader, &db, &registry).await {
            warn!(%peer, uid = state.uid, error = %e, "error dispatching packet");
        }

        if state.disconnect {
            break;
        }
    }

    teardown(&state, &reader, &db, &registry).await;
    writer_handle.abort();
    info!(%peer, uid = state.uid, "connection closed");
}

/// Drops registry presence and every room membership row left behind by a
/// connection that never sent `ROOM_LEAVE` -- the common case, since clients
/// close the socket outright rather than leaving rooms one by one first.
async fn teardown(state: &ConnectionState, reader: &rusqlite::Connection, db: &Db, registry: &Registry) {
    if state.uid == wire::UID_ALL || wire::uid_is_error(state.uid) {
        return;
    }
    registry.logout(state.uid);

    let rooms = room::rooms_for_user(reader, state.uid);
    if rooms.is_empty() {
        return;
    }

    let uid = state.uid;
    let rooms_for_commit = rooms.clone();
    let result = db
        .with_tx(|tx| {
            for rid in &rooms_for_commit {
                room::leave_room(tx, *rid, uid)?;
            }
            Ok(())
        })
        .await;
    if let Err(e) = result {
        warn!(uid, error = %e, "failed to clear room membership on disconnect");
    }

    for rid in rooms {
        let members = room::room_members(reader, rid);
        registry.broadcast_to(&members, uid, Frame::new(packet::ROOM_USER_LEFT, uid.to_be_bytes().to_vec()));
    }
}

/// Decrements the process-wide connection counter when a connection task
/// ends, however it ends (clean disconnect, read error, or reader-open
/// failure before the loop even starts).
struct ConnectionCountGuard(Arc<AtomicU32>);

impl Drop for ConnectionCountGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}
