//! User & device directory (Module D).
//!
//! Grounded on `original_source/src/user.c`/`user.h` and `devicelist.c`. The
//! password store is a salted hash here rather than cleartext (DESIGN.md
//! Open Question #4); everything else follows the original query shapes.

use rand::Rng;
use rusqlite::{Connection, OptionalExtension, Transaction};
use sha2::{Digest, Sha256};

use ptserver_protocol::wire::{NICKNAME_MAX, UID_ALL};

#[derive(Debug, Clone, Default)]
pub struct User {
    pub uid: u32,
    pub nickname: String,
    pub email: String,
    pub first: String,
    pub last: String,
    pub privacy: char,
    pub verified: bool,
    pub random: bool,
    pub paid1: char,
    pub get_offers_from_us: bool,
    pub get_offers_from_affiliates: bool,
    pub banners: bool,
    pub admin: bool,
    pub sup: bool,
}

/// Looks up a uid by nickname, returning [`UID_ALL`] (source's sentinel for
/// "no such user") when the nickname doesn't resolve.
pub fn lookup_uid(db: &Connection, nick: &str) -> u32 {
    db.query_row("SELECT uid FROM users WHERE nickname=?1", [nick], |r| r.get::<_, i64>(0))
        .optional()
        .ok()
        .flatten()
        .map(|uid| uid as u32)
        .unwrap_or(UID_ALL)
}

pub fn nickname_in_use(db: &Connection, nick: &str) -> bool {
    let count: i64 = db
        .query_row("SELECT count(*) FROM users WHERE nickname=?1", [nick], |r| r.get(0))
        .unwrap_or(0);
    count != 0
}

/// Appends random digits to `nick` until an unused nickname is found,
/// matching source's `sprintf("%.*s%d", ..., rand() % 1000)` retry loop.
pub fn suggest_nickname(db: &Connection, nick: &str, rng: &mut impl Rng) -> String {
    let base_len = (NICKNAME_MAX as usize - 3).min(nick.chars().count());
    let base: String = nick.chars().take(base_len).collect();
    loop {
        let candidate = format!("{base}{}", rng.gen_range(0..1000));
        if !nickname_in_use(db, &candidate) {
            return candidate;
        }
    }
}

pub fn lookup_user(db: &Connection, uid: u32) -> rusqlite::Result<Option<User>> {
    db.query_row(
        "SELECT uid, nickname, email, first, last, privacy, verified, random, paid1,
                get_offers_from_us, get_offers_from_affiliates, banners, admin, sup
         FROM users WHERE uid=?1",
        [uid],
        |r| {
            Ok(User {
                uid: r.get::<_, i64>(0)? as u32,
                nickname: r.get(1)?,
                email: r.get(2)?,
                first: r.get(3)?,
                last: r.get(4)?,
                privacy: r.get::<_, String>(5)?.chars().next().unwrap_or('A'),
                verified: r.get(6)?,
                random: r.get(7)?,
                paid1: r.get::<_, String>(8)?.chars().next().unwrap_or('N'),
                get_offers_from_us: r.get(9)?,
                get_offers_from_affiliates: r.get(10)?,
                banners: r.get(11)?,
                admin: r.get(12)?,
                sup: r.get(13)?,
            })
        },
    )
    .optional()
}

pub fn user_exists(db: &Connection, uid: u32) -> bool {
    let count: i64 = db.query_row("SELECT count(*) FROM users WHERE uid=?1", [uid], |r| r.get(0)).unwrap_or(0);
    count != 0
}

pub fn user_is_staff(db: &Connection, uid: u32) -> bool {
    db.query_row("SELECT admin OR sup FROM users WHERE uid=?1", [uid], |r| r.get::<_, bool>(0))
        .unwrap_or(false)
}

pub fn user_logged_in(tx: &Transaction, uid: u32) -> rusqlite::Result<()> {
    tx.execute("UPDATE users SET last_login=datetime('now','subsec') WHERE uid=?1", [uid])?;
    Ok(())
}

pub fn user_set_privacy(tx: &Transaction, uid: u32, privacy: char) -> rusqlite::Result<()> {
    tx.execute("UPDATE users SET privacy=?1 WHERE uid=?2", rusqlite::params![privacy.to_string(), uid])?;
    Ok(())
}

fn hash_password(uid: u32, pw: &str) -> String {
    // Salted with the uid: sufficient since each row is independently keyed
    // and this server never exposes the hash itself, only accepts/rejects.
    let mut hasher = Sha256::new();
    hasher.update(uid.to_be_bytes());
    hasher.update(pw.as_bytes());
    format!("{:x}", hasher.finalize())
}

pub fn user_check_password(db: &Connection, uid: u32, pw: &str) -> bool {
    if pw.is_empty() || ptserver_protocol::wire::uid_is_error(uid) {
        return false;
    }
    let stored: Option<String> =
        db.query_row("SELECT password FROM secrets WHERE uid=?1", [uid], |r| r.get(0)).optional().ok().flatten();
    match stored {
        Some(stored) => stored == hash_password(uid, pw),
        None => false,
    }
}

pub fn user_check_question_response(db: &Connection, uid: u32, response: &str) -> bool {
    let stored: Option<String> =
        db.query_row("SELECT sq_answer FROM secrets WHERE uid=?1", [uid], |r| r.get(0)).optional().ok().flatten();
    match stored {
        Some(stored) => stored.eq_ignore_ascii_case(response),
        None => false,
    }
}

pub fn user_set_password(tx: &Transaction, uid: u32, pw: &str) -> rusqlite::Result<()> {
    let hashed = hash_password(uid, pw);
    tx.execute(
        "INSERT INTO secrets(uid, password) VALUES(?1, ?2)
         ON CONFLICT(uid) DO UPDATE SET password=excluded.password",
        rusqlite::params![uid, hashed],
    )?;
    Ok(())
}

pub fn user_set_password_hint(tx: &Transaction, uid: u32, hint: &str) -> rusqlite::Result<()> {
    tx.execute(
        "INSERT INTO secrets(uid, password, password_hint) VALUES(?1, '', ?2)
         ON CONFLICT(uid) DO UPDATE SET password_hint=excluded.password_hint",
        rusqlite::params![uid, hint],
    )?;
    Ok(())
}

pub fn user_set_secret_question(tx: &Transaction, uid: u32, id: u32, answer: &str) -> rusqlite::Result<()> {
    tx.execute(
        "INSERT INTO secrets(uid, password, sq_index, sq_answer) VALUES(?1, '', ?2, ?3)
         ON CONFLICT(uid) DO UPDATE SET sq_index=excluded.sq_index, sq_answer=excluded.sq_answer",
        rusqlite::params![uid, id, answer],
    )?;
    Ok(())
}

pub fn user_get_secret_question(db: &Connection, uid: u32) -> Option<String> {
    db.query_row(
        "SELECT secret_q FROM secret_questions
         JOIN secrets ON secrets.sq_index = secret_questions.id
         WHERE secrets.uid=?1",
        [uid],
        |r| r.get(0),
    )
    .optional()
    .ok()
    .flatten()
}

pub fn register_user(tx: &Transaction, u: &User) -> rusqlite::Result<u32> {
    tx.execute(
        "INSERT INTO users(nickname, email, first, last, created)
         VALUES(?1, ?2, ?3, ?4, datetime('now','subsec'))",
        rusqlite::params![u.nickname, u.email, u.first, u.last],
    )?;
    Ok(tx.last_insert_rowid() as u32)
}

pub fn search_users(db: &Connection, field: &str, partial: &str) -> Vec<User> {
    let column = match field {
        "nickname" | "first" | "last" | "email" => field,
        _ => "nickname",
    };
    let sql = format!(
        "SELECT uid, nickname, email, first, last, privacy, verified, random, paid1,
                get_offers_from_us, get_offers_from_affiliates, banners, admin, sup
         FROM users WHERE {column} LIKE ?1 || '%' LIMIT 50"
    );
    let mut stmt = match db.prepare(&sql) {
        Ok(s) => s,
        Err(_) => return Vec::new(),
    };
    let rows = stmt.query_map([partial], |r| {
        Ok(User {
            uid: r.get::<_, i64>(0)? as u32,
            nickname: r.get(1)?,
            email: r.get(2)?,
            first: r.get(3)?,
            last: r.get(4)?,
            privacy: r.get::<_, String>(5)?.chars().next().unwrap_or('A'),
            verified: r.get(6)?,
            random: r.get(7)?,
            paid1: r.get::<_, String>(8)?.chars().next().unwrap_or('N'),
            get_offers_from_us: r.get(9)?,
            get_offers_from_affiliates: r.get(10)?,
            banners: r.get(11)?,
            admin: r.get(12)?,
            sup: r.get(13)?,
        })
    });
    match rows {
        Ok(rows) => rows.filter_map(Result::ok).collect(),
        Err(_) => Vec::new(),
    }
}

pub mod devices {
    use rusqlite::{Connection, Transaction};

    pub fn device_in_list(db: &Connection, uid: u32, device_id: &str) -> bool {
        if device_id.is_empty() {
            return false;
        }
        let count: i64 = db
            .query_row(
                "SELECT count(*) FROM user_devices WHERE uid=?1 AND device_id=?2",
                rusqlite::params![uid, device_id],
                |r| r.get(0),
            )
            .unwrap_or(0);
        count != 0
    }

    pub fn device_add(tx: &Transaction, uid: u32, device_id: &str) -> rusqlite::Result<()> {
        if device_id.is_empty() {
            return Ok(());
        }
        tx.execute(
            "INSERT INTO user_devices(uid, device_id) VALUES(?1, ?2)
             ON CONFLICT DO NOTHING",
            rusqlite::params![uid, device_id],
        )?;
        Ok(())
    }

    pub fn device_inc_logins(tx: &Transaction, uid: u32, device_id: &str) -> rusqlite::Result<()> {
        if device_id.is_empty() {
            return Ok(());
        }
        tx.execute(
            "UPDATE user_devices SET logins = logins + 1 WHERE uid=?1 AND device_id=?2",
            rusqlite::params![uid, device_id],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_memory_for_test;
    use rand::SeedableRng;

    fn new_user(tx: &Transaction, nick: &str) -> u32 {
        register_user(
            tx,
            &User { nickname: nick.into(), email: "a@b.com".into(), ..Default::default() },
        )
        .unwrap()
    }

    #[test]
    fn lookup_uid_returns_sentinel_for_unknown_nickname() {
        let conn = open_memory_for_test();
        assert_eq!(lookup_uid(&conn, "nobody"), UID_ALL);
    }

    #[test]
    fn register_then_lookup_round_trips() {
        let mut conn = open_memory_for_test();
        let tx = conn.transaction().unwrap();
        let uid = new_user(&tx, "alice");
        tx.commit().unwrap();
        assert_eq!(lookup_uid(&conn, "alice"), uid);
        assert!(nickname_in_use(&conn, "alice"));
    }

    #[test]
    fn suggest_nickname_avoids_collision() {
        let mut conn = open_memory_for_test();
        let tx = conn.transaction().unwrap();
        new_user(&tx, "bob0");
        tx.commit().unwrap();
        let mut rng = rand::rngs::StdRng::seed_from_u64(1);
        let suggestion = suggest_nickname(&conn, "bob", &mut rng);
        assert_ne!(suggestion, "bob0");
        assert!(!nickname_in_use(&conn, &suggestion));
    }

    #[test]
    fn password_round_trip_and_rejects_wrong_password() {
        let mut conn = open_memory_for_test();
        let tx = conn.transaction().unwrap();
        let uid = new_user(&tx, "carol");
        user_set_password(&tx, uid, "hunter2").unwrap();
        tx.commit().unwrap();
        assert!(user_check_password(&conn, uid, "hunter2"));
        assert!(!user_check_password(&conn, uid, "wrong"));
    }
}
