//! Room module (Module F).
//!
//! Grounded on `original_source/src/room.c`/`room.h`. This module owns room
//! persistence and membership predicates; actual packet fanout to connected
//! sockets is the caller's job (`registry.rs`/`flows::general`), since this
//! crate keeps "who is connected" out of the database layer entirely.
//!
//! `user_in_room` here is **not** source's `return 1 || !!db_get_count(...)`
//! — that `1 ||` short-circuit made every membership check vacuously true,
//! silently defeating every ban/bounce/admin/whisper guard built on top of
//! it. Fixed per the corresponding design-note resolution.

use ptserver_protocol::wire::{CATEGORY_FEATURED, CATEGORY_TOP, PROTOCOL_VERSION_82, ROOM_TYPE_ANONYMOUS};
use rusqlite::{Connection, OptionalExtension, Transaction};

#[derive(Debug, Clone)]
pub struct Room {
    pub id: u32,
    pub catg: u32,
    pub subcatg: Option<u32>,
    pub lang: String,
    pub rating: char,
    pub voice: bool,
    pub private: bool,
    pub locked: bool,
    pub color: String,
    pub name: String,
    pub mike: bool,
    pub text_reddotted: bool,
    pub video_reddotted: bool,
    pub topic: Option<String>,
    pub topic_setter: Option<u32>,
    pub code: u32,
    pub password: Option<String>,
    pub room_type: u32,
}

fn row_to_room(r: &rusqlite::Row) -> rusqlite::Result<Room> {
    Ok(Room {
        id: r.get::<_, i64>(0)? as u32,
        catg: r.get::<_, i64>(1)? as u32,
        subcatg: r.get::<_, Option<i64>>(2)?.map(|v| v as u32),
        lang: r.get(3)?,
        rating: r.get::<_, String>(4)?.chars().next().unwrap_or('A'),
        voice: r.get(5)?,
        private: r.get(6)?,
        locked: r.get(7)?,
        color: r.get(8)?,
        name: r.get(9)?,
        mike: r.get(10)?,
        text_reddotted: r.get(11)?,
        video_reddotted: r.get(12)?,
        topic: r.get(13)?,
        topic_setter: r.get::<_, Option<i64>>(14)?.map(|v| v as u32),
        code: r.get(15)?,
        password: r.get(16)?,
        room_type: r.get::<_, i64>(17)? as u32,
    })
}

const ROOM_COLS: &str =
    "id, catg, subcatg, lang, r, v, p, l, c, nm, mike, text, video, topic, topic_setter, code, password, rtype";

pub fn lookup_room(db: &Connection, rid: u32) -> Option<Room> {
    db.query_row(&format!("SELECT {ROOM_COLS} FROM rooms WHERE id=?1"), [rid], row_to_room)
        .optional()
        .ok()
        .flatten()
}

/// Room population counts grouped by category, including the two virtual
/// categories (capped at 5, same as source's `MIN(5, COUNT(DISTINCT id))`).
pub fn room_counts_by_category(db: &Connection) -> Vec<(u32, i64)> {
    let sql = format!(
        "SELECT {CATEGORY_TOP} AS id, (SELECT MIN(5, COUNT(DISTINCT id)) FROM rooms) AS cnt
         UNION
         SELECT {CATEGORY_FEATURED} AS id, (SELECT MIN(5, COUNT(DISTINCT id)) FROM rooms) AS cnt
         UNION
         SELECT catg AS id, COUNT(*) AS cnt FROM rooms
         WHERE catg NOT IN ({CATEGORY_TOP},{CATEGORY_FEATURED}) GROUP BY catg"
    );
    let mut stmt = db.prepare(&sql).expect("static query");
    stmt.query_map([], |r| Ok((r.get::<_, i64>(0)? as u32, r.get::<_, i64>(1)?)))
        .map(|rows| rows.filter_map(Result::ok).collect())
        .unwrap_or_default()
}

/// Rooms within an ordinary category, or the synthesized lists for the two
/// virtual categories (top-5 by population, featured-5 by creation time).
///
/// `protocol_version` gates the ordinary-category projection the way source's
/// `rooms_for_category(db_r, protocol_version, catid)` does: 8.2+ clients get
/// subcategories listed separately (via `rooms_for_subcategory`), so their
/// plain category listing excludes rooms that belong to one.
pub fn rooms_for_category(db: &Connection, protocol_version: u16, catid: u32) -> Vec<Room> {
    let sql = if catid == CATEGORY_TOP {
        format!(
            "SELECT {ROOM_COLS} FROM rooms
             ORDER BY (SELECT COUNT(uid) FROM room_users WHERE id=rooms.id) DESC LIMIT 5"
        )
    } else if catid == CATEGORY_FEATURED {
        format!("SELECT {ROOM_COLS} FROM rooms ORDER BY created ASC LIMIT 5")
    } else if protocol_version >= PROTOCOL_VERSION_82 {
        format!("SELECT {ROOM_COLS} FROM rooms WHERE catg=?1 AND subcatg IS NULL ORDER BY nm ASC")
    } else {
        format!("SELECT {ROOM_COLS} FROM rooms WHERE catg=?1 ORDER BY nm ASC")
    };

    let mut stmt = match db.prepare(&sql) {
        Ok(s) => s,
        Err(_) => return Vec::new(),
    };
    let rows = if catid == CATEGORY_TOP || catid == CATEGORY_FEATURED {
        stmt.query_map([], row_to_room)
    } else {
        stmt.query_map([catid], row_to_room)
    };
    rows.map(|rows| rows.filter_map(Result::ok).collect()).unwrap_or_default()
}

pub fn rooms_for_subcategory(db: &Connection, catid: u32, scid: u32) -> Vec<Room> {
    let sql = format!("SELECT {ROOM_COLS} FROM rooms WHERE catg=?1 AND subcatg=?2 ORDER BY nm DESC");
    let mut stmt = match db.prepare(&sql) {
        Ok(s) => s,
        Err(_) => return Vec::new(),
    };
    stmt.query_map([catid, scid], row_to_room).map(|rows| rows.filter_map(Result::ok).collect()).unwrap_or_default()
}

pub fn search_rooms(db: &Connection, partial: &str) -> Vec<Room> {
    let sql = format!("SELECT {ROOM_COLS} FROM rooms WHERE nm LIKE '%' || ?1 || '%' LIMIT 50");
    let mut stmt = match db.prepare(&sql) {
        Ok(s) => s,
        Err(_) => return Vec::new(),
    };
    stmt.query_map([partial], row_to_room).map(|rows| rows.filter_map(Result::ok).collect()).unwrap_or_default()
}

pub fn create_room(tx: &Transaction, owner: u32, catg: u32, name: &str, password: Option<&str>) -> rusqlite::Result<u32> {
    tx.execute(
        "INSERT INTO rooms(catg, nm, password, topic_setter, created)
         VALUES(?1, ?2, ?3, ?4, datetime('now','subsec'))",
        rusqlite::params![catg, name, password, owner],
    )?;
    let rid = tx.last_insert_rowid() as u32;
    tx.execute(
        "INSERT INTO room_users(id, uid, mic, pub) VALUES(?1, ?2, 1, 'Y')",
        [rid, owner],
    )?;
    Ok(rid)
}

pub fn user_in_room(db: &Connection, rid: u32, uid: u32) -> bool {
    let count: i64 = db
        .query_row("SELECT count(*) FROM room_users WHERE id=?1 AND uid=?2", [rid, uid], |r| r.get(0))
        .unwrap_or(0);
    count != 0
}

pub fn user_is_invisible(db: &Connection, rid: u32, uid: u32) -> bool {
    let count: i64 = db
        .query_row(
            "SELECT count(*) FROM room_users WHERE id=?1 AND uid=?2 AND invis=1",
            [rid, uid],
            |r| r.get(0),
        )
        .unwrap_or(0);
    count != 0
}

pub fn user_is_room_admin(db: &Connection, rid: u32, uid: u32) -> bool {
    let is_setter: i64 = db
        .query_row(
            "SELECT count(*) FROM rooms WHERE id=?1 AND topic_setter=?2",
            [rid, uid],
            |r| r.get(0),
        )
        .unwrap_or(0);
    is_setter != 0 && user_in_room(db, rid, uid)
}

pub fn join_room(tx: &Transaction, rid: u32, uid: u32, mic: bool) -> rusqlite::Result<()> {
    tx.execute(
        "INSERT INTO room_users(id, uid, mic) VALUES(?1, ?2, ?3) ON CONFLICT DO NOTHING",
        rusqlite::params![rid, uid, mic],
    )?;
    Ok(())
}

pub fn leave_room(tx: &Transaction, rid: u32, uid: u32) -> rusqlite::Result<()> {
    tx.execute("DELETE FROM room_users WHERE id=?1 AND uid=?2", [rid, uid])?;
    Ok(())
}

pub fn room_members(db: &Connection, rid: u32) -> Vec<u32> {
    let mut stmt = db.prepare("SELECT uid FROM room_users WHERE id=?1").expect("static query");
    stmt.query_map([rid], |r| r.get::<_, i64>(0).map(|v| v as u32))
        .map(|rows| rows.filter_map(Result::ok).collect())
        .unwrap_or_default()
}

/// Every room `uid` currently occupies, for connection-teardown cleanup.
pub fn rooms_for_user(db: &Connection, uid: u32) -> Vec<u32> {
    let mut stmt = db.prepare("SELECT id FROM room_users WHERE uid=?1").expect("static query");
    stmt.query_map([uid], |r| r.get::<_, i64>(0).map(|v| v as u32))
        .map(|rows| rows.filter_map(Result::ok).collect())
        .unwrap_or_default()
}

pub fn is_banned(db: &Connection, rid: u32, uid: u32) -> bool {
    let count: i64 = db
        .query_row("SELECT count(*) FROM room_bans WHERE id=?1 AND uid=?2", [rid, uid], |r| r.get(0))
        .unwrap_or(0);
    count != 0
}

pub fn is_bounced(db: &Connection, rid: u32, uid: u32) -> bool {
    let count: i64 = db
        .query_row("SELECT count(*) FROM room_bounces WHERE id=?1 AND uid=?2", [rid, uid], |r| r.get(0))
        .unwrap_or(0);
    count != 0
}

/// Returns `Some(())` if `actor` was a room admin and the ban was recorded;
/// `None` if the guard failed (source's `if (!do_ban || !user_is_room_admin...) return;`).
pub fn ban_user(tx: &Transaction, rid: u32, uid: u32, actor: u32) -> rusqlite::Result<bool> {
    if !user_is_room_admin(tx, rid, actor) {
        return Ok(false);
    }
    tx.execute(
        "INSERT INTO room_bans(id, uid, banner, ts) VALUES(?1, ?2, ?3, datetime('now','subsec'))
         ON CONFLICT DO NOTHING",
        [rid, uid, actor],
    )?;
    leave_room(tx, rid, uid)?;
    Ok(true)
}

pub fn unban_user(tx: &Transaction, rid: u32, uid: u32, actor: u32) -> rusqlite::Result<bool> {
    if !user_is_room_admin(tx, rid, actor) {
        return Ok(false);
    }
    tx.execute("DELETE FROM room_bans WHERE id=?1 AND uid=?2", [rid, uid])?;
    Ok(true)
}

pub fn bounce_user(tx: &Transaction, rid: u32, uid: u32, actor: u32, reason: &str) -> rusqlite::Result<bool> {
    if !user_is_room_admin(tx, rid, actor) {
        return Ok(false);
    }
    tx.execute(
        "INSERT INTO room_bounces(id, uid, bouncer, reason, ts) VALUES(?1, ?2, ?3, ?4, datetime('now','subsec'))
         ON CONFLICT DO NOTHING",
        rusqlite::params![rid, uid, actor, reason],
    )?;
    leave_room(tx, rid, uid)?;
    Ok(true)
}

pub fn unbounce_user(tx: &Transaction, rid: u32, uid: u32, actor: u32) -> rusqlite::Result<bool> {
    if !user_is_room_admin(tx, rid, actor) {
        return Ok(false);
    }
    tx.execute("DELETE FROM room_bounces WHERE id=?1 AND uid=?2", [rid, uid])?;
    Ok(true)
}

pub fn reddot_user(tx: &Transaction, rid: u32, uid: u32, actor: u32, on: bool) -> rusqlite::Result<bool> {
    if !user_is_room_admin(tx, rid, actor) {
        return Ok(false);
    }
    tx.execute(
        "UPDATE room_users SET reddot=?1 WHERE id=?2 AND uid=?3",
        rusqlite::params![on, rid, uid],
    )?;
    Ok(true)
}

pub fn user_is_reddotted(db: &Connection, rid: u32, uid: u32) -> bool {
    let count: i64 = db
        .query_row(
            "SELECT count(*) FROM room_users WHERE id=?1 AND uid=?2 AND reddot=1",
            [rid, uid],
            |r| r.get(0),
        )
        .unwrap_or(0);
    count != 0
}

pub fn set_all_mics(tx: &Transaction, rid: u32, actor: u32, on: bool) -> rusqlite::Result<bool> {
    if !user_is_room_admin(tx, rid, actor) {
        return Ok(false);
    }
    tx.execute("UPDATE room_users SET mic=?1 WHERE id=?2", rusqlite::params![on, rid])?;
    Ok(true)
}

pub fn new_user_mic(tx: &Transaction, rid: u32, actor: u32, on: bool) -> rusqlite::Result<bool> {
    if !user_is_room_admin(tx, rid, actor) {
        return Ok(false);
    }
    tx.execute("UPDATE rooms SET mike=?1 WHERE id=?2", rusqlite::params![on, rid])?;
    Ok(true)
}

pub fn raise_hand(tx: &Transaction, rid: u32, uid: u32, on: bool) -> rusqlite::Result<()> {
    tx.execute("UPDATE room_users SET req=?1 WHERE id=?2 AND uid=?3", rusqlite::params![on, rid, uid])?;
    Ok(())
}

/// Self-service mic toggle. Unlike every other mutator in this module,
/// source never gates this one on `user_is_room_admin` -- it is the user
/// muting/unmuting their own mic, preserved as such (DESIGN.md Open
/// Question #8).
pub fn mute_self(tx: &Transaction, rid: u32, uid: u32, on: bool) -> rusqlite::Result<()> {
    tx.execute("UPDATE room_users SET mic=?1 WHERE id=?2 AND uid=?3", rusqlite::params![on, rid, uid])?;
    Ok(())
}

pub fn lower_all_hands(tx: &Transaction, rid: u32, actor: u32) -> rusqlite::Result<bool> {
    if !user_is_room_admin(tx, rid, actor) {
        return Ok(false);
    }
    tx.execute("UPDATE room_users SET req=0 WHERE id=?1", [rid])?;
    Ok(true)
}

pub fn room_topic(tx: &Transaction, rid: u32, actor: u32, topic: &str) -> rusqlite::Result<bool> {
    if !user_is_room_admin(tx, rid, actor) {
        return Ok(false);
    }
    tx.execute(
        "UPDATE rooms SET topic=?1, topic_setter=?2 WHERE id=?3",
        rusqlite::params![topic, actor, rid],
    )?;
    Ok(true)
}

pub fn reddot_text(tx: &Transaction, rid: u32, actor: u32, on: bool) -> rusqlite::Result<bool> {
    if !user_is_room_admin(tx, rid, actor) {
        return Ok(false);
    }
    tx.execute("UPDATE rooms SET text=?1 WHERE id=?2", rusqlite::params![on, rid])?;
    Ok(true)
}

pub fn reddot_video(tx: &Transaction, rid: u32, actor: u32, on: bool) -> rusqlite::Result<bool> {
    if !user_is_room_admin(tx, rid, actor) {
        return Ok(false);
    }
    tx.execute("UPDATE rooms SET video=?1 WHERE id=?2", rusqlite::params![on, rid])?;
    Ok(true)
}

/// Validates a whisper target against the source's guard chain: target must
/// be an existing, present, non-invisible room member, and the whisperer
/// must not themselves be invisible. Anonymous rooms refuse whispers
/// outright -- source left this as a `TODO`, never enforced (DESIGN.md Open
/// Question #3). Returns the target's uid on success.
pub fn whisper_target(db: &Connection, rid: u32, actor: u32, target_uid: u32) -> Option<u32> {
    if ptserver_protocol::wire::uid_is_error(target_uid) || !user_in_room(db, rid, target_uid) {
        return None;
    }
    if lookup_room(db, rid).is_some_and(|r| r.room_type == ROOM_TYPE_ANONYMOUS) {
        return None;
    }
    if user_is_invisible(db, rid, target_uid) || user_is_invisible(db, rid, actor) {
        return None;
    }
    if target_uid == actor {
        return None;
    }
    Some(target_uid)
}

/// A parsed room slash command (`room_command` in source).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoomCommand {
    Topic(String),
    Whisper { target: String, message: String },
    Ban(String),
    Bounce { target: String, reason: String },
    MicsOn,
    MicsOff,
}

/// Parses a `/command args` string, mirroring source's `strtok(s, " ")` +
/// `strtok(NULL, "<")` split (first space separates command from args; a
/// leading `<` in the remainder is where source's client-side markup began,
/// so the args run up to the first `<`).
pub fn parse_room_command(buf: &str) -> Option<RoomCommand> {
    let buf = buf.trim_start();
    let rest = buf.strip_prefix('/')?;
    let mut split = rest.splitn(2, ' ');
    let cmd = split.next()?;
    let args = split.next()?.split('<').next()?.trim();
    if args.is_empty() {
        return None;
    }

    match cmd.chars().next()? {
        't' => Some(RoomCommand::Topic(args.to_string())),
        'w' => {
            let (target, msg) = args.split_once(':')?;
            Some(RoomCommand::Whisper { target: target.trim().to_string(), message: msg.trim().to_string() })
        }
        'b' => {
            if let Some((target, reason)) = args.split_once(':') {
                Some(RoomCommand::Bounce { target: target.trim().to_string(), reason: reason.trim().to_string() })
            } else {
                Some(RoomCommand::Ban(args.to_string()))
            }
        }
        'm' => match args {
            "on" => Some(RoomCommand::MicsOn),
            "off" => Some(RoomCommand::MicsOff),
            _ => None,
        },
        _ => None,
    }
}
