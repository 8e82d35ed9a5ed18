//! General flow -- the bulk of post-login traffic. Grounded on
//! `original_source/src/server_general.c`; room moderation delegates to
//! `model::room` (§4.6), buddy/status bookkeeping to `model::buddy` (§4.5).

use rusqlite::Connection;

use ptserver_protocol::record::RecordBuf;
use ptserver_protocol::wire::{self, packet, uid_is_error, STATUSMSG_MAX};
use ptserver_protocol::framer::Frame;

use crate::context::{read_u32_be, ConnectionState, Flow};
use crate::db::Db;
use crate::model::{buddy, room, user};
use crate::registry::Registry;

use super::log_unexpected;

/// Packet types accepted but never given any effect -- acknowledged at the
/// wire level only (checksum/version handshakes, the anti-piracy "user
/// fucker" probe, etc; §4.8).
const SILENTLY_IGNORED: &[u16] = &[
    packet::CHECKSUMS,
    packet::NEW_CHECKSUMS,
    packet::VERSION_INFO,
    packet::VERSIONS,
    packet::CLIENT_HELLO,
    packet::USER_FUCKER_STATUS,
    packet::REGISTRY_INT_VALUE,
    packet::INCOMPATIBLE_3P_APP,
    packet::SEND_GLOBAL_NUMBERS,
    packet::PING,
];

pub async fn enter(state: &mut ConnectionState, reader: &Connection, _db: &Db, registry: &Registry) -> anyhow::Result<()> {
    let uid = state.uid;
    let Some(u) = user::lookup_user(reader, uid)? else { return Ok(()) };

    let ip_bytes = state.server_ip.unwrap_or(0).to_le_bytes();
    let challenge = state.challenge;
    let ei_body = state.obfuscator.encode(1, challenge, &ip_bytes, &mut rand::thread_rng()).unwrap_or_default();
    // source's smtp credential field was never wired up server-side either.
    let smtp_body = state.obfuscator.encode(2, challenge, b"smtp-stub", &mut rand::thread_rng()).unwrap_or_default();

    let mut rec = RecordBuf::new();
    rec.append_field("nickname", &u.nickname)
        .append_field("email", &u.email)
        .append_field("first", &u.first)
        .append_field("last", &u.last)
        .append_field("privacy", &u.privacy.to_string())
        .append_field("paid1", &u.paid1.to_string())
        .append_field("ei", &String::from_utf8_lossy(&ei_body))
        .append_field("smtp", &String::from_utf8_lossy(&smtp_body));
    state.send(Frame::new(packet::USER_DATA, rec.into_inner()));

    for target in [b'C', b'G'] {
        let mut body = Vec::with_capacity(5);
        body.extend_from_slice(&0x7fffu32.to_be_bytes());
        body.push(target);
        state.send(Frame::new(packet::BANNER_INTERVAL, body));
    }

    state.send(Frame::new(packet::CATEGORY_LIST, list_categories(reader)));
    if state.is_v82_plus() {
        state.send(Frame::new(packet::SUBCATEGORY_LIST, list_subcategories(reader)));
    }

    state.send(Frame::new(packet::BUDDY_LIST, buddies_record(reader, uid)));
    state.send(Frame::new(packet::BLOCKED_BUDDIES, blocked_record(reader, uid)));

    for b in buddy::buddy_list(reader, uid) {
        let status = visible_status(reader, registry, uid, b.uid);
        state.send(Frame::new(packet::BUDDY_STATUSCHANGE, status_change_body(b.uid, status, None)));
    }
    broadcast_status(state, reader, registry);

    deliver_offline_messages(state, reader, uid).await?;
    Ok(())
}

fn list_categories(reader: &Connection) -> Vec<u8> {
    let mut stmt = reader.prepare("SELECT code, value FROM categories ORDER BY code").expect("static query");
    let rows = stmt
        .query_map([], |r| Ok((r.get::<_, i64>(0)? as u32, r.get::<_, String>(1)?)))
        .map(|rows| rows.filter_map(Result::ok).collect::<Vec<_>>())
        .unwrap_or_default();
    let mut out = RecordBuf::new();
    for (code, name) in rows {
        let mut rec = RecordBuf::new();
        rec.append_field("code", &code.to_string()).append_field("name", &name);
        out.append_record(rec.as_bytes());
    }
    out.into_inner()
}

fn list_subcategories(reader: &Connection) -> Vec<u8> {
    let mut stmt = reader.prepare("SELECT subcatg, catg, name FROM subcategories").expect("static query");
    let rows = stmt
        .query_map([], |r| Ok((r.get::<_, i64>(0)? as u32, r.get::<_, i64>(1)? as u32, r.get::<_, String>(2)?)))
        .map(|rows| rows.filter_map(Result::ok).collect::<Vec<_>>())
        .unwrap_or_default();
    let mut out = RecordBuf::new();
    for (sc, catg, name) in rows {
        let mut rec = RecordBuf::new();
        rec.append_field("subcatg", &sc.to_string()).append_field("catg", &catg.to_string()).append_field("name", &name);
        out.append_record(rec.as_bytes());
    }
    out.into_inner()
}

fn buddies_record(reader: &Connection, uid: u32) -> Vec<u8> {
    let mut out = RecordBuf::new();
    for b in buddy::buddy_list(reader, uid) {
        let mut rec = RecordBuf::new();
        rec.append_field("uid", &b.uid.to_string())
            .append_field("display", b.display.as_deref().unwrap_or(""))
            .append_field("nickname", &b.nickname)
            .append_field("first", &b.first)
            .append_field("last", &b.last)
            .append_field("email", &b.email);
        out.append_record(rec.as_bytes());
    }
    out.into_inner()
}

fn blocked_record(reader: &Connection, uid: u32) -> Vec<u8> {
    let mut out = RecordBuf::new();
    for b in buddy::block_list(reader, uid) {
        let mut rec = RecordBuf::new();
        rec.append_field("uid", &b.uid.to_string()).append_field("nickname", &b.nickname);
        out.append_record(rec.as_bytes());
    }
    out.into_inner()
}

fn reverse_buddy_uids(reader: &Connection, uid: u32) -> Vec<u32> {
    let mut stmt = reader.prepare("SELECT uid FROM buddylist WHERE buddy=?1").expect("static query");
    stmt.query_map([uid], |r| r.get::<_, i64>(0).map(|v| v as u32))
        .map(|rows| rows.filter_map(Result::ok).collect())
        .unwrap_or_default()
}

async fn deliver_offline_messages(state: &ConnectionState, reader: &Connection, uid: u32) -> anyhow::Result<()> {
    let mut stmt = reader
        .prepare("SELECT from_uid, msg FROM offline_messages WHERE to_uid=?1 ORDER BY tstamp ASC")
        .expect("static query");
    let rows: Vec<(u32, String)> = stmt
        .query_map([uid], |r| Ok((r.get::<_, i64>(0)? as u32, r.get::<_, String>(1)?)))
        .map(|rows| rows.filter_map(Result::ok).collect())
        .unwrap_or_default();
    for (from_uid, msg) in rows {
        let mut body = Vec::with_capacity(4 + msg.len());
        body.extend_from_slice(&from_uid.to_be_bytes());
        body.extend_from_slice(msg.as_bytes());
        state.send(Frame::new(packet::IM_IN, body));
    }
    Ok(())
}

pub async fn handle(
    state: &mut ConnectionState,
    frame: &Frame,
    reader: &Connection,
    db: &Db,
    registry: &Registry,
) -> anyhow::Result<()> {
    if SILENTLY_IGNORED.contains(&frame.ptype) {
        return Ok(());
    }

    match frame.ptype {
        packet::GET_PRIVACY => {
            if let Some(u) = &state.user {
                state.send(Frame::new(packet::VERIFY_PRIVACY, vec![u.privacy as u8]));
            }
        }
        packet::SET_PRIVACY => {
            if let Some(&privacy) = frame.body.first() {
                let uid = state.uid;
                db.with_tx(|tx| Ok(user::user_set_privacy(tx, uid, privacy as char)?)).await?;
                if let Some(u) = &mut state.user {
                    u.privacy = privacy as char;
                }
                state.send(Frame::new(packet::VERIFY_PRIVACY, vec![privacy]));
            }
        }

        packet::LIST_CATEGORY | packet::NEW_LIST_CATEGORY => {
            // LIST_CATEGORY carries the category id at bytes 8-11; NEW_LIST_CATEGORY
            // (PT8+) carries it at bytes 0-3 (server_general.c:247-281).
            let catid = if frame.ptype == packet::LIST_CATEGORY {
                read_u32_be(&frame.body, 8)
            } else {
                read_u32_be(&frame.body, 0)
            };
            let Some(catid) = catid else { return Ok(()) };

            if catid == 0 || catid == wire::ALL_CATEGORIES {
                let mut out = RecordBuf::new();
                for (id, count) in room::room_counts_by_category(reader) {
                    let mut rec = RecordBuf::new();
                    rec.append_field("id", &id.to_string()).append_field("count", &count.to_string());
                    out.append_record(rec.as_bytes());
                }
                state.send(Frame::new(packet::CATEGORY_COUNTS, out.into_inner()));
            } else {
                let mut out = RecordBuf::new();
                for r in room::rooms_for_category(reader, state.protocol_version, catid) {
                    let mut rec = RecordBuf::new();
                    rec.append_field("id", &r.id.to_string()).append_field("name", &r.name);
                    out.append_record(rec.as_bytes());
                }
                let ptype = if state.is_v82_plus() && catid != wire::CATEGORY_TOP && catid != wire::CATEGORY_FEATURED {
                    packet::NEW_ROOM_LIST
                } else {
                    packet::ROOM_LIST
                };
                state.send(Frame::new(ptype, out.into_inner()));
            }
        }
        packet::LIST_SUBCATEGORY => {
            // Category id at bytes 0-3, subcategory id at bytes 4-7
            // (server_general.c:283-302).
            let (Some(catid), Some(scid)) = (read_u32_be(&frame.body, 0), read_u32_be(&frame.body, 4)) else {
                return Ok(());
            };
            let mut out = RecordBuf::new();
            for r in room::rooms_for_subcategory(reader, catid, scid) {
                let mut rec = RecordBuf::new();
                rec.append_field("id", &r.id.to_string()).append_field("name", &r.name);
                out.append_record(rec.as_bytes());
            }
            state.send(Frame::new(packet::SUBCATEGORY_ROOM_LIST, out.into_inner()));
        }

        packet::CHANGE_STATUS => {
            let Some(status) = read_u32_be(&frame.body, 0) else { return Ok(()) };
            let msg = if state.is_v82_plus() {
                frame.body.get(4..).map(|b| {
                    let s = String::from_utf8_lossy(b).to_string();
                    s.chars().take(STATUSMSG_MAX).collect::<String>()
                })
            } else {
                None
            };
            state.status = status;
            state.status_msg = msg.clone();
            broadcast_status(state, reader, registry);
        }

        packet::SET_BUDDY_DISPLAY_NAME => {
            let Some(target) = read_u32_be(&frame.body, 0) else { return Ok(()) };
            let display = String::from_utf8_lossy(frame.body.get(4..).unwrap_or(&[])).to_string();
            let uid = state.uid;
            db.with_tx(|tx| Ok(buddy::set_buddy_display(tx, uid, target, &display)?)).await?;
        }

        packet::ADD_BUDDY => {
            let Some(target) = read_u32_be(&frame.body, 0) else { return Ok(()) };
            let uid = state.uid;
            db.with_tx(|tx| Ok(buddy::add_buddy(tx, uid, target)?)).await?;
            let status = visible_status(reader, registry, uid, target);
            state.send(Frame::new(packet::BUDDY_STATUSCHANGE, status_change_body(target, status, None)));
        }
        packet::REMOVE_BUDDY => {
            let Some(target) = read_u32_be(&frame.body, 0) else { return Ok(()) };
            let uid = state.uid;
            db.with_tx(|tx| Ok(buddy::remove_buddy(tx, uid, target)?)).await?;
            state.send(Frame::new(packet::BUDDY_REMOVED, target.to_be_bytes().to_vec()));
        }
        packet::BLOCK_BUDDY => {
            let Some(target) = read_u32_be(&frame.body, 0) else { return Ok(()) };
            let uid = state.uid;
            db.with_tx(|tx| Ok(buddy::block_buddy(tx, uid, target)?)).await?;
            state.send(Frame::new(packet::BLOCK_RESPONSE, block_response_body(target, 1, "Success")));
            state.send(Frame::new(
                packet::BUDDY_STATUSCHANGE,
                status_change_body(target, wire::STATUS_BLOCKED, None),
            ));
        }
        packet::UNBLOCK_BUDDY => {
            let Some(target) = read_u32_be(&frame.body, 0) else { return Ok(()) };
            let uid = state.uid;
            db.with_tx(|tx| Ok(buddy::unblock_buddy(tx, uid, target)?)).await?;
            state.send(Frame::new(packet::BLOCK_RESPONSE, block_response_body(target, 0, "Success")));
        }

        packet::SEARCH_USER => {
            let Some(&field_byte) = frame.body.first() else { return Ok(()) };
            let partial = String::from_utf8_lossy(frame.body.get(1..).unwrap_or(&[])).to_string();
            let field = match field_byte {
                b'n' => "nickname",
                b'e' => "email",
                b'f' => "first",
                b'l' => "last",
                _ => "nickname",
            };
            let mut out = RecordBuf::new();
            for u in user::search_users(reader, field, &partial) {
                let mut rec = RecordBuf::new();
                rec.append_field("uid", &u.uid.to_string()).append_field("nickname", &u.nickname);
                out.append_record(rec.as_bytes());
            }
            state.send(Frame::new(packet::SEARCH_RESULTS, out.into_inner()));
        }
        packet::SEARCH_ROOM => {
            let partial = String::from_utf8_lossy(&frame.body).to_string();
            let mut out = RecordBuf::new();
            for r in room::search_rooms(reader, &partial) {
                let mut rec = RecordBuf::new();
                rec.append_field("id", &r.id.to_string()).append_field("name", &r.name);
                out.append_record(rec.as_bytes());
            }
            state.send(Frame::new(packet::ROOM_SEARCH_RESULTS, out.into_inner()));
        }

        packet::IM_OUT => handle_im_out(state, frame, reader, db, registry).await?,
        packet::ROOM_MESSAGE_OUT => handle_room_message(state, frame, reader, db, registry).await?,
        packet::NUDGE_OUT => handle_nudge(state, frame, reader, registry)?,

        packet::ROOM_JOIN | packet::ROOM_JOIN_AS_ADMIN | packet::ROOM_JOIN_AS_ADMIN2 => {
            handle_room_join(state, frame, reader, db, registry).await?
        }
        packet::ROOM_CREATE => handle_room_create(state, frame, db).await?,
        packet::ROOM_CLOSE => handle_room_close(state, frame, reader, db, registry).await?,
        packet::ROOM_LEAVE => handle_room_leave(state, frame, reader, db, registry).await?,

        packet::ROOM_HAND_UP | packet::ROOM_HAND_DOWN => {
            let Some(rid) = read_u32_be(&frame.body, 0) else { return Ok(()) };
            let uid = state.uid;
            let on = frame.ptype == packet::ROOM_HAND_UP;
            db.with_tx(|tx| Ok(room::raise_hand(tx, rid, uid, on)?)).await?;
            let ptype = if on { packet::ROOM_USER_HAND_UP } else { packet::ROOM_USER_HAND_DOWN };
            let members = room::room_members(reader, rid);
            registry.broadcast_to(&members, uid, Frame::new(ptype, uid.to_be_bytes().to_vec()));
        }

        packet::ROOM_SET_ALL_MICS => {
            let (Some(rid), Some(&on)) = (read_u32_be(&frame.body, 0), frame.body.get(4)) else { return Ok(()) };
            let actor = state.uid;
            let ok = db.with_tx(|tx| Ok(room::set_all_mics(tx, rid, actor, on != 0)?)).await?;
            if ok {
                let members = room::room_members(reader, rid);
                registry.broadcast_to(&members, actor, Frame::new(packet::ROOM_SET_MIC, vec![on]));
            }
        }
        packet::ROOM_LOWER_ALL_HANDS => {
            let Some(rid) = read_u32_be(&frame.body, 0) else { return Ok(()) };
            let actor = state.uid;
            let ok = db.with_tx(|tx| Ok(room::lower_all_hands(tx, rid, actor)?)).await?;
            if ok {
                let members = room::room_members(reader, rid);
                registry.broadcast_to(&members, actor, Frame::empty(packet::ROOM_LOWER_ALL_HANDS));
            }
        }
        packet::ROOM_NEW_USER_MIC => {
            let (Some(rid), Some(&on)) = (read_u32_be(&frame.body, 0), frame.body.get(4)) else { return Ok(()) };
            let actor = state.uid;
            db.with_tx(|tx| Ok(room::new_user_mic(tx, rid, actor, on != 0)?)).await?;
        }
        packet::ROOM_MUTE => {
            let (Some(rid), Some(&on)) = (read_u32_be(&frame.body, 0), frame.body.get(4)) else { return Ok(()) };
            let uid = state.uid;
            db.with_tx(|tx| Ok(room::mute_self(tx, rid, uid, on != 0)?)).await?;
            let members = room::room_members(reader, rid);
            registry.broadcast_to(&members, uid, Frame::new(packet::ROOM_USER_MUTE, uid.to_be_bytes().to_vec()));
        }

        packet::ROOM_SET_TOPIC => {
            let Some(rid) = read_u32_be(&frame.body, 0) else { return Ok(()) };
            let topic = String::from_utf8_lossy(frame.body.get(4..).unwrap_or(&[])).to_string();
            let actor = state.uid;
            let ok = db.with_tx(|tx| Ok(room::room_topic(tx, rid, actor, &topic)?)).await?;
            if ok {
                let mut body = Vec::new();
                body.extend_from_slice(&rid.to_be_bytes());
                body.extend_from_slice(&actor.to_be_bytes());
                body.extend_from_slice(topic.as_bytes());
                let members = room::room_members(reader, rid);
                registry.broadcast_to(&members, actor, Frame::new(packet::ROOM_TOPIC, body));
            }
        }

        packet::ROOM_BAN_USER => handle_ban(state, frame, reader, db, registry, false).await?,
        packet::ROOM_BAN_NICK => handle_ban(state, frame, reader, db, registry, true).await?,
        packet::ROOM_UNBAN_USER => {
            let (Some(rid), Some(uid)) = (read_u32_be(&frame.body, 0), read_u32_be(&frame.body, 4)) else {
                return Ok(());
            };
            let actor = state.uid;
            db.with_tx(|tx| Ok(room::unban_user(tx, rid, uid, actor)?)).await?;
        }
        packet::ROOM_BOUNCE_USER | packet::ROOM_BOUNCE_REASON => {
            let (Some(rid), Some(target)) = (read_u32_be(&frame.body, 0), read_u32_be(&frame.body, 4)) else {
                return Ok(());
            };
            let reason = String::from_utf8_lossy(frame.body.get(8..).unwrap_or(&[])).to_string();
            let actor = state.uid;
            let ok = db.with_tx(|tx| Ok(room::bounce_user(tx, rid, target, actor, &reason)?)).await?;
            if ok {
                registry.send(target, Frame::new(packet::ROOM_CLOSED, b"You have been removed from this room.".to_vec()));
            }
        }
        packet::ROOM_UNBOUNCE_USER => {
            let (Some(rid), Some(uid)) = (read_u32_be(&frame.body, 0), read_u32_be(&frame.body, 4)) else {
                return Ok(());
            };
            let actor = state.uid;
            db.with_tx(|tx| Ok(room::unbounce_user(tx, rid, uid, actor)?)).await?;
        }
        packet::ROOM_REDDOT_USER | packet::ROOM_UNREDDOT_USER => {
            let (Some(rid), Some(uid)) = (read_u32_be(&frame.body, 0), read_u32_be(&frame.body, 4)) else {
                return Ok(());
            };
            let actor = state.uid;
            let on = frame.ptype == packet::ROOM_REDDOT_USER;
            db.with_tx(|tx| Ok(room::reddot_user(tx, rid, uid, actor, on)?)).await?;
        }
        packet::ROOM_REDDOT_TEXT => {
            let (Some(rid), Some(&on)) = (read_u32_be(&frame.body, 0), frame.body.get(4)) else { return Ok(()) };
            let actor = state.uid;
            db.with_tx(|tx| Ok(room::reddot_text(tx, rid, actor, on != 0)?)).await?;
        }
        packet::ROOM_REDDOT_VIDEO => {
            let (Some(rid), Some(&on)) = (read_u32_be(&frame.body, 0), frame.body.get(4)) else { return Ok(()) };
            let actor = state.uid;
            db.with_tx(|tx| Ok(room::reddot_video(tx, rid, actor, on != 0)?)).await?;
        }

        packet::ANNOUNCEMENT => {
            if state.user.as_ref().is_some_and(|u| u.admin || u.sup) {
                registry.broadcast(Frame::new(packet::ANNOUNCEMENT, frame.body.to_vec()));
            }
        }

        other => log_unexpected(Flow::General, other),
    }
    Ok(())
}

fn visible_status(reader: &Connection, registry: &Registry, uid: u32, target: u32) -> u32 {
    if buddy::i_blocked_user(reader, uid, target) {
        return wire::STATUS_BLOCKED;
    }
    if registry.is_online(target) {
        wire::STATUS_ONLINE
    } else {
        wire::STATUS_OFFLINE
    }
}

fn status_change_body(uid: u32, status: u32, msg: Option<&str>) -> Vec<u8> {
    let mut body = Vec::with_capacity(8);
    body.extend_from_slice(&uid.to_be_bytes());
    body.extend_from_slice(&status.to_be_bytes());
    if let Some(m) = msg {
        body.extend_from_slice(m.as_bytes());
    }
    body
}

fn block_response_body(uid: u32, disposition: u8, msg: &str) -> Vec<u8> {
    let mut body = Vec::with_capacity(5 + msg.len());
    body.extend_from_slice(&uid.to_be_bytes());
    body.push(disposition);
    body.extend_from_slice(msg.as_bytes());
    body
}

/// Sends our new status to every reverse-buddy (peers who have us listed),
/// skipping anyone who has blocked us (§4.5).
fn broadcast_status(state: &ConnectionState, reader: &Connection, registry: &Registry) {
    let uid = state.uid;
    for peer in reverse_buddy_uids(reader, uid) {
        if buddy::user_blocked_me(reader, uid, peer) {
            continue;
        }
        let msg = if state.status != wire::STATUS_ONLINE { state.status_msg.as_deref() } else { None };
        registry.send(peer, Frame::new(packet::BUDDY_STATUSCHANGE, status_change_body(uid, state.status, msg)));
    }
}

async fn handle_im_out(
    state: &ConnectionState,
    frame: &Frame,
    reader: &Connection,
    db: &Db,
    registry: &Registry,
) -> anyhow::Result<()> {
    let Some(target) = read_u32_be(&frame.body, 0) else { return Ok(()) };
    let msg = String::from_utf8_lossy(frame.body.get(4..).unwrap_or(&[])).to_string();
    let sender = state.uid;

    if uid_is_error(target) || buddy::i_blocked_user(reader, target, sender) {
        return Ok(());
    }

    let mut body = Vec::with_capacity(4 + msg.len());
    body.extend_from_slice(&sender.to_be_bytes());
    body.extend_from_slice(msg.as_bytes());

    if registry.send(target, Frame::new(packet::IM_IN, body)) {
        return Ok(());
    }

    db.with_tx(|tx| {
        tx.execute(
            "INSERT INTO offline_messages(from_uid, to_uid, tstamp, msg) VALUES(?1, ?2, datetime('now','subsec'), ?3)",
            rusqlite::params![sender, target, msg],
        )?;
        Ok(())
    })
    .await?;
    Ok(())
}

async fn handle_room_message(
    state: &ConnectionState,
    frame: &Frame,
    reader: &Connection,
    db: &Db,
    registry: &Registry,
) -> anyhow::Result<()> {
    let Some(rid) = read_u32_be(&frame.body, 0) else { return Ok(()) };
    let text = String::from_utf8_lossy(frame.body.get(4..).unwrap_or(&[])).to_string();
    let uid = state.uid;

    if let Some(cmd) = room::parse_room_command(&text) {
        return handle_room_command(state, rid, cmd, reader, db, registry).await;
    }

    if room::user_is_invisible(reader, rid, uid) {
        return Ok(());
    }
    let Some(r) = room::lookup_room(reader, rid) else { return Ok(()) };
    if r.text_reddotted && !room::user_is_room_admin(reader, rid, uid) {
        return Ok(());
    }

    let mut body = Vec::with_capacity(4 + text.len());
    body.extend_from_slice(&uid.to_be_bytes());
    body.extend_from_slice(text.as_bytes());
    let members = room::room_members(reader, rid);
    registry.broadcast_to(&members, uid, Frame::new(packet::ROOM_MESSAGE_IN, body));
    Ok(())
}

async fn handle_room_command(
    state: &ConnectionState,
    rid: u32,
    cmd: room::RoomCommand,
    reader: &Connection,
    db: &Db,
    registry: &Registry,
) -> anyhow::Result<()> {
    let actor = state.uid;
    match cmd {
        room::RoomCommand::Topic(topic) => {
            let ok = db.with_tx(|tx| Ok(room::room_topic(tx, rid, actor, &topic)?)).await?;
            if ok {
                let mut body = Vec::new();
                body.extend_from_slice(&rid.to_be_bytes());
                body.extend_from_slice(&actor.to_be_bytes());
                body.extend_from_slice(topic.as_bytes());
                let members = room::room_members(reader, rid);
                registry.broadcast_to(&members, actor, Frame::new(packet::ROOM_TOPIC, body));
            }
        }
        room::RoomCommand::Whisper { target, message } => {
            let target_uid = user::lookup_uid(reader, &target);
            if let Some(validated) = room::whisper_target(reader, rid, actor, target_uid) {
                let mut to_target = Vec::new();
                to_target.extend_from_slice(&actor.to_be_bytes());
                to_target.extend_from_slice(format!("<whisper from you>{message}").as_bytes());
                registry.send(validated, Frame::new(packet::ROOM_MESSAGE_IN, to_target));

                let mut echo = Vec::new();
                echo.extend_from_slice(&actor.to_be_bytes());
                echo.extend_from_slice(format!("<whisper to {target}>{message}").as_bytes());
                state.send(Frame::new(packet::ROOM_MESSAGE_IN, echo));
            }
        }
        room::RoomCommand::Ban(target) => {
            let target_uid = user::lookup_uid(reader, &target);
            let ok = db.with_tx(|tx| Ok(room::ban_user(tx, rid, target_uid, actor)?)).await?;
            if ok {
                registry.send(target_uid, Frame::new(packet::ROOM_CLOSED, b"You have been banned from this room.".to_vec()));
            }
        }
        room::RoomCommand::Bounce { target, reason } => {
            let target_uid = user::lookup_uid(reader, &target);
            let ok = db.with_tx(|tx| Ok(room::bounce_user(tx, rid, target_uid, actor, &reason)?)).await?;
            if ok {
                registry.send(target_uid, Frame::new(packet::ROOM_CLOSED, b"You have been removed from this room.".to_vec()));
            }
        }
        room::RoomCommand::MicsOn => {
            let ok = db.with_tx(|tx| Ok(room::set_all_mics(tx, rid, actor, true)?)).await?;
            if ok {
                let members = room::room_members(reader, rid);
                registry.broadcast_to(&members, actor, Frame::new(packet::ROOM_SET_MIC, vec![1]));
            }
        }
        room::RoomCommand::MicsOff => {
            let ok = db.with_tx(|tx| Ok(room::set_all_mics(tx, rid, actor, false)?)).await?;
            if ok {
                let members = room::room_members(reader, rid);
                registry.broadcast_to(&members, actor, Frame::new(packet::ROOM_SET_MIC, vec![0]));
            }
        }
    }
    Ok(())
}

fn handle_nudge(state: &ConnectionState, frame: &Frame, reader: &Connection, registry: &Registry) -> anyhow::Result<()> {
    let Some(&kind) = frame.body.first() else { return Ok(()) };
    let Some(id) = read_u32_be(&frame.body, 1) else { return Ok(()) };
    let uid = state.uid;

    if kind == 0 {
        if !state.is_v82_plus() {
            return Ok(());
        }
        registry.send(id, Frame::new(packet::NUDGE_IN, uid.to_be_bytes().to_vec()));
    } else {
        let members = room::room_members(reader, id);
        registry.broadcast_to(&members, uid, Frame::new(packet::NUDGE_IN, uid.to_be_bytes().to_vec()));
    }
    Ok(())
}

async fn handle_room_join(
    state: &mut ConnectionState,
    frame: &Frame,
    reader: &Connection,
    db: &Db,
    registry: &Registry,
) -> anyhow::Result<()> {
    let Some(rid) = read_u32_be(&frame.body, 0) else { return Ok(()) };
    let uid = state.uid;

    if room::is_banned(reader, rid, uid) {
        state.send(Frame::new(packet::ROOM_CLOSED, b"You are banned from this room.".to_vec()));
        return Ok(());
    }
    let Some(r) = room::lookup_room(reader, rid) else { return Ok(()) };

    let needs_code = frame.ptype == packet::ROOM_JOIN_AS_ADMIN || frame.ptype == packet::ROOM_JOIN_AS_ADMIN2;
    if needs_code {
        let Some(code) = read_u32_be(&frame.body, 4) else { return Ok(()) };
        if code != r.code {
            state.send_return_code(0x01, "Incorrect room admin code.");
            return Ok(());
        }
    } else if let Some(pw) = &r.password {
        let supplied = String::from_utf8_lossy(frame.body.get(4..).unwrap_or(&[])).to_string();
        if &supplied != pw {
            state.send_return_code(0x01, "Incorrect room password.");
            return Ok(());
        }
    }

    db.with_tx(|tx| Ok(room::join_room(tx, rid, uid, r.mike)?)).await?;
    state.send(Frame::new(packet::ROOM_JOINED, rid.to_be_bytes().to_vec()));
    let members = room::room_members(reader, rid);
    registry.broadcast_to(&members, uid, Frame::new(packet::ROOM_USER_JOINED, uid.to_be_bytes().to_vec()));
    Ok(())
}

async fn handle_room_create(state: &ConnectionState, frame: &Frame, db: &Db) -> anyhow::Result<()> {
    let Some(catg) = read_u32_be(&frame.body, 0) else { return Ok(()) };
    let rest = String::from_utf8_lossy(frame.body.get(4..).unwrap_or(&[])).to_string();
    let mut parts = rest.splitn(2, '\n');
    let name = parts.next().unwrap_or("New Room").to_string();
    let password = parts.next().filter(|s| !s.is_empty()).map(str::to_string);
    let owner = state.uid;

    let rid = db.with_tx(|tx| Ok(room::create_room(tx, owner, catg, &name, password.as_deref())?)).await?;
    state.send(Frame::new(packet::ROOM_JOINED, rid.to_be_bytes().to_vec()));
    Ok(())
}

async fn handle_room_close(
    state: &ConnectionState,
    frame: &Frame,
    reader: &Connection,
    db: &Db,
    registry: &Registry,
) -> anyhow::Result<()> {
    let Some(rid) = read_u32_be(&frame.body, 0) else { return Ok(()) };
    let actor = state.uid;
    if !room::user_is_room_admin(reader, rid, actor) {
        return Ok(());
    }
    let members = room::room_members(reader, rid);
    registry.broadcast_to(&members, actor, Frame::new(packet::ROOM_CLOSED, b"This room has been closed.".to_vec()));
    state.send(Frame::new(packet::ROOM_CLOSED, b"This room has been closed.".to_vec()));

    db.with_tx(|tx| {
        for &uid in &members {
            room::leave_room(tx, rid, uid)?;
        }
        Ok(())
    })
    .await?;
    Ok(())
}

async fn handle_room_leave(
    state: &ConnectionState,
    frame: &Frame,
    reader: &Connection,
    db: &Db,
    registry: &Registry,
) -> anyhow::Result<()> {
    let Some(rid) = read_u32_be(&frame.body, 0) else { return Ok(()) };
    let uid = state.uid;
    db.with_tx(|tx| Ok(room::leave_room(tx, rid, uid)?)).await?;
    let members = room::room_members(reader, rid);
    registry.broadcast_to(&members, uid, Frame::new(packet::ROOM_USER_LEFT, uid.to_be_bytes().to_vec()));
    Ok(())
}

async fn handle_ban(
    state: &ConnectionState,
    frame: &Frame,
    reader: &Connection,
    db: &Db,
    registry: &Registry,
    by_nickname: bool,
) -> anyhow::Result<()> {
    let Some(rid) = read_u32_be(&frame.body, 0) else { return Ok(()) };
    let target = if by_nickname {
        let nick = String::from_utf8_lossy(frame.body.get(4..).unwrap_or(&[])).to_string();
        user::lookup_uid(reader, &nick)
    } else {
        match read_u32_be(&frame.body, 4) {
            Some(u) => u,
            None => return Ok(()),
        }
    };
    let actor = state.uid;
    let ok = db.with_tx(|tx| Ok(room::ban_user(tx, rid, target, actor)?)).await?;
    if ok {
        registry.send(target, Frame::new(packet::ROOM_CLOSED, b"You have been banned from this room.".to_vec()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use tokio::sync::mpsc;

    use crate::db::Db;
    use crate::model::user::User;
    use crate::registry::ConnectionHandle;

    use super::*;

    struct TestDb {
        _dir: tempfile::TempDir,
        db: Db,
        reader: Connection,
    }

    fn test_db() -> TestDb {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.db");
        let db = Db::open(&path).unwrap();
        let reader = crate::db::open_reader(&path).unwrap();
        TestDb { _dir: dir, db, reader }
    }

    fn new_state() -> (ConnectionState, mpsc::UnboundedReceiver<Frame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let peer: SocketAddr = "127.0.0.1:4003".parse().unwrap();
        (ConnectionState::new(peer, tx), rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Frame>) -> Vec<Frame> {
        let mut out = Vec::new();
        while let Ok(f) = rx.try_recv() {
            out.push(f);
        }
        out
    }

    async fn new_user(t: &TestDb, nick: &str) -> u32 {
        t.db
            .with_tx(|tx| Ok(user::register_user(tx, &User { nickname: nick.into(), ..Default::default() })?))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn get_privacy_returns_current_value() {
        let t = test_db();
        let (mut state, mut rx) = new_state();
        state.user = Some(User { privacy: 'Y', ..Default::default() });
        let frame = Frame::empty(packet::GET_PRIVACY);
        handle(&mut state, &frame, &t.reader, &t.db, &Registry::new()).await.unwrap();
        let reply = drain(&mut rx).pop().unwrap();
        assert_eq!(reply.ptype, packet::VERIFY_PRIVACY);
        assert_eq!(reply.body, vec![b'Y']);
    }

    #[tokio::test]
    async fn set_privacy_persists_and_echoes() {
        let t = test_db();
        let uid = new_user(&t, "privacyuser").await;
        let (mut state, mut rx) = new_state();
        state.uid = uid;
        state.user = Some(User { uid, nickname: "privacyuser".into(), privacy: 'Y', ..Default::default() });

        let frame = Frame::new(packet::SET_PRIVACY, vec![b'N']);
        handle(&mut state, &frame, &t.reader, &t.db, &Registry::new()).await.unwrap();

        assert_eq!(state.user.as_ref().unwrap().privacy, 'N');
        let stored = user::lookup_user(&t.reader, uid).unwrap().unwrap();
        assert_eq!(stored.privacy, 'N');
        let reply = drain(&mut rx).pop().unwrap();
        assert_eq!(reply.ptype, packet::VERIFY_PRIVACY);
        assert_eq!(reply.body, vec![b'N']);
    }

    #[tokio::test]
    async fn add_buddy_inserts_row_and_sends_status_change() {
        let t = test_db();
        let uid = new_user(&t, "alice").await;
        let buddy_uid = new_user(&t, "bob").await;
        let (mut state, mut rx) = new_state();
        state.uid = uid;

        let frame = Frame::new(packet::ADD_BUDDY, buddy_uid.to_be_bytes().to_vec());
        handle(&mut state, &frame, &t.reader, &t.db, &Registry::new()).await.unwrap();

        assert!(buddy::buddy_uids(&t.reader, uid).contains(&buddy_uid));
        let reply = drain(&mut rx).pop().unwrap();
        assert_eq!(reply.ptype, packet::BUDDY_STATUSCHANGE);
    }

    #[tokio::test]
    async fn im_out_is_suppressed_when_target_blocked_sender() {
        let t = test_db();
        let sender = new_user(&t, "carl").await;
        let target = new_user(&t, "dana").await;
        t.db.with_tx(|tx| Ok(buddy::block_buddy(tx, target, sender)?)).await.unwrap();

        let (mut state, _rx) = new_state();
        state.uid = sender;
        let mut body = Vec::new();
        body.extend_from_slice(&target.to_be_bytes());
        body.extend_from_slice(b"hi there");
        let frame = Frame::new(packet::IM_OUT, body);

        handle(&mut state, &frame, &t.reader, &t.db, &Registry::new()).await.unwrap();

        let count: i64 = t.reader.query_row("SELECT count(*) FROM offline_messages WHERE to_uid=?1", [target], |r| r.get(0)).unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn im_out_spools_offline_message_when_target_not_connected() {
        let t = test_db();
        let sender = new_user(&t, "erin").await;
        let target = new_user(&t, "frank").await;

        let (mut state, _rx) = new_state();
        state.uid = sender;
        let mut body = Vec::new();
        body.extend_from_slice(&target.to_be_bytes());
        body.extend_from_slice(b"hi there");
        let frame = Frame::new(packet::IM_OUT, body);

        handle(&mut state, &frame, &t.reader, &t.db, &Registry::new()).await.unwrap();

        let count: i64 = t.reader.query_row("SELECT count(*) FROM offline_messages WHERE to_uid=?1", [target], |r| r.get(0)).unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn room_create_then_join_adds_membership() {
        let t = test_db();
        let owner = new_user(&t, "ownie").await;
        let (mut state, mut rx) = new_state();
        state.uid = owner;

        let create_frame = Frame::new(packet::ROOM_CREATE, {
            let mut body = 1u32.to_be_bytes().to_vec();
            body.extend_from_slice(b"My Room");
            body
        });
        handle(&mut state, &create_frame, &t.reader, &t.db, &Registry::new()).await.unwrap();
        let joined = drain(&mut rx).pop().unwrap();
        assert_eq!(joined.ptype, packet::ROOM_JOINED);
        let rid = u32::from_be_bytes(joined.body[..4].try_into().unwrap());

        let joiner = new_user(&t, "joinie").await;
        state.uid = joiner;
        let join_frame = Frame::new(packet::ROOM_JOIN, rid.to_be_bytes().to_vec());
        handle(&mut state, &join_frame, &t.reader, &t.db, &Registry::new()).await.unwrap();

        assert!(room::user_in_room(&t.reader, rid, joiner));
    }

    #[tokio::test]
    async fn room_leave_removes_membership_and_broadcasts() {
        let t = test_db();
        let owner = new_user(&t, "leavowner").await;
        let rid = t.db.with_tx(|tx| Ok(room::create_room(tx, owner, 1, "Leave Room", None)?)).await.unwrap();
        t.db.with_tx(|tx| Ok(room::join_room(tx, rid, owner, false)?)).await.unwrap();

        let (mut state, mut rx) = new_state();
        state.uid = owner;
        let frame = Frame::new(packet::ROOM_LEAVE, rid.to_be_bytes().to_vec());
        handle(&mut state, &frame, &t.reader, &t.db, &Registry::new()).await.unwrap();

        assert!(!room::user_in_room(&t.reader, rid, owner));
        let reply = drain(&mut rx).pop().unwrap();
        assert_eq!(reply.ptype, packet::ROOM_USER_LEFT);
    }

    #[tokio::test]
    async fn announcement_is_dropped_for_non_staff() {
        let t = test_db();
        let sender = new_user(&t, "plainuser").await;
        let listener = new_user(&t, "listener").await;

        let registry = Registry::new();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        registry.login(listener, ConnectionHandle { out: out_tx });

        let (mut state, _rx) = new_state();
        state.uid = sender;
        state.user = Some(User { uid: sender, admin: false, sup: false, ..Default::default() });

        let frame = Frame::new(packet::ANNOUNCEMENT, b"hello everyone".to_vec());
        handle(&mut state, &frame, &t.reader, &t.db, &registry).await.unwrap();

        assert!(out_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn announcement_is_broadcast_for_admin() {
        let t = test_db();
        let sender = new_user(&t, "adminuser").await;
        let listener = new_user(&t, "listener2").await;

        let registry = Registry::new();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        registry.login(listener, ConnectionHandle { out: out_tx });

        let (mut state, _rx) = new_state();
        state.uid = sender;
        state.user = Some(User { uid: sender, admin: true, sup: false, ..Default::default() });

        let frame = Frame::new(packet::ANNOUNCEMENT, b"hello everyone".to_vec());
        handle(&mut state, &frame, &t.reader, &t.db, &registry).await.unwrap();

        let reply = out_rx.try_recv().unwrap();
        assert_eq!(reply.ptype, packet::ANNOUNCEMENT);
        assert_eq!(reply.body, b"hello everyone");
    }

    #[tokio::test]
    async fn list_category_all_sends_category_counts() {
        let t = test_db();
        let (mut state, mut rx) = new_state();
        let frame = Frame::new(packet::NEW_LIST_CATEGORY, wire::ALL_CATEGORIES.to_be_bytes().to_vec());
        handle(&mut state, &frame, &t.reader, &t.db, &Registry::new()).await.unwrap();
        let reply = drain(&mut rx).pop().unwrap();
        assert_eq!(reply.ptype, packet::CATEGORY_COUNTS);
    }

    #[tokio::test]
    async fn list_category_one_sends_room_list() {
        let t = test_db();
        let owner = new_user(&t, "roomie").await;
        t.db.with_tx(|tx| Ok(room::create_room(tx, owner, 0x7601, "Listed Room", None)?)).await.unwrap();

        let (mut state, mut rx) = new_state();
        let frame = Frame::new(packet::NEW_LIST_CATEGORY, 0x7601u32.to_be_bytes().to_vec());
        handle(&mut state, &frame, &t.reader, &t.db, &Registry::new()).await.unwrap();
        let reply = drain(&mut rx).pop().unwrap();
        assert_eq!(reply.ptype, packet::ROOM_LIST);
        assert!(String::from_utf8_lossy(&reply.body).contains("Listed Room"));
    }

    #[tokio::test]
    async fn list_subcategory_reads_catid_then_scid() {
        let t = test_db();
        let owner = new_user(&t, "subroomie").await;
        let rid = t.db.with_tx(|tx| Ok(room::create_room(tx, owner, 0x7601, "Sub Room", None)?)).await.unwrap();
        t.db.with_tx(|tx| {
            tx.execute("UPDATE rooms SET subcatg=1 WHERE id=?1", [rid])?;
            Ok(())
        })
        .await
        .unwrap();

        let (mut state, mut rx) = new_state();
        let mut body = 0x7601u32.to_be_bytes().to_vec();
        body.extend_from_slice(&1u32.to_be_bytes());
        let frame = Frame::new(packet::LIST_SUBCATEGORY, body);
        handle(&mut state, &frame, &t.reader, &t.db, &Registry::new()).await.unwrap();
        let reply = drain(&mut rx).pop().unwrap();
        assert_eq!(reply.ptype, packet::SUBCATEGORY_ROOM_LIST);
        assert!(String::from_utf8_lossy(&reply.body).contains("Sub Room"));
    }

    #[tokio::test]
    async fn entering_general_flow_emits_buddy_statuses() {
        let t = test_db();
        let uid = new_user(&t, "enterer").await;
        let buddy_uid = new_user(&t, "enterbuddy").await;
        t.db.with_tx(|tx| Ok(buddy::add_buddy(tx, uid, buddy_uid)?)).await.unwrap();

        let (mut state, mut rx) = new_state();
        state.uid = uid;
        enter(&mut state, &t.reader, &t.db, &Registry::new()).await.unwrap();

        let replies = drain(&mut rx);
        let status_changes: Vec<_> = replies.iter().filter(|f| f.ptype == packet::BUDDY_STATUSCHANGE).collect();
        assert!(status_changes.iter().any(|f| f.body.starts_with(&buddy_uid.to_be_bytes())));
    }
}
