//! Connection flows (Module H, behavior half): login, registration,
//! password reset, general. Each module owns the packet types declared for
//! its flow in `original_source/src/server_*.c`; anything else arriving
//! while that flow is installed is logged and dropped (§3 invariants).

pub mod general;
pub mod login;
pub mod password_reset;
pub mod registration;

use rusqlite::Connection;
use tracing::trace;

use ptserver_protocol::framer::Frame;
use ptserver_protocol::wire::packet;

use crate::context::{ConnectionState, Flow};
use crate::db::Db;
use crate::registry::Registry;

/// Routes one inbound frame to the handler for the currently installed flow.
/// `CLIENT_DISCONNECT` is handled uniformly regardless of flow (§3).
pub async fn dispatch(
    state: &mut ConnectionState,
    frame: &Frame,
    reader: &Connection,
    db: &Db,
    registry: &Registry,
) -> anyhow::Result<()> {
    if frame.ptype == packet::CLIENT_DISCONNECT {
        state.disconnect = true;
        return Ok(());
    }

    match state.flow {
        Flow::Login => login::handle(state, frame, reader, db, registry).await,
        Flow::Registration => registration::handle(state, frame, reader, db, registry).await,
        Flow::PasswordReset => password_reset::handle(state, frame, reader, db, registry).await,
        Flow::General => general::handle(state, frame, reader, db, registry).await,
    }
}

/// Logs an unexpected-for-this-flow packet and drops it, matching source's
/// "unexpected packet dump" behavior without actually echoing the bytes
/// (which could be a partially-decoded secret).
pub(crate) fn log_unexpected(flow: Flow, ptype: u16) {
    trace!(?flow, ptype = format!("0x{ptype:04x}"), "packet not accepted by current flow, dropping");
}
