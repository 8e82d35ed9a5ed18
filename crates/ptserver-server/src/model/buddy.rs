//! Buddy & presence module (Module E).
//!
//! Grounded on `original_source/src/buddylist.c`/`buddylist.h`. Fanout
//! (`do_broadcast_status`/`send_buddy_status` walking the live registry) is
//! left to the caller in `registry.rs`; this module only owns persistence
//! and the plain predicates.

use rusqlite::{Connection, OptionalExtension, Transaction};

#[derive(Debug, Clone)]
pub struct BuddyRow {
    pub uid: u32,
    pub display: Option<String>,
    pub nickname: String,
    pub first: String,
    pub last: String,
    pub email: String,
    pub verified: bool,
    pub paid1: char,
    pub admin: bool,
    pub sup: bool,
}

fn row_to_buddy(r: &rusqlite::Row) -> rusqlite::Result<BuddyRow> {
    Ok(BuddyRow {
        uid: r.get::<_, i64>(0)? as u32,
        display: r.get(1)?,
        nickname: r.get(2)?,
        first: r.get(3)?,
        last: r.get(4)?,
        email: r.get(5)?,
        verified: r.get(6)?,
        paid1: r.get::<_, String>(7)?.chars().next().unwrap_or('N'),
        admin: r.get(8)?,
        sup: r.get(9)?,
    })
}

pub fn buddy_list(db: &Connection, uid: u32) -> Vec<BuddyRow> {
    let mut stmt = db
        .prepare(
            "SELECT users.uid, display, nickname, first, last, email, verified, paid1, admin, sup
             FROM buddylist JOIN users ON users.uid = buddylist.buddy
             WHERE buddylist.uid = ?1",
        )
        .expect("static query");
    stmt.query_map([uid], row_to_buddy).map(|rows| rows.filter_map(Result::ok).collect()).unwrap_or_default()
}

pub fn block_list(db: &Connection, uid: u32) -> Vec<BuddyRow> {
    let mut stmt = db
        .prepare(
            "SELECT users.uid, NULL, nickname, first, last, email, verified, paid1, admin, sup
             FROM blocklist JOIN users ON users.uid = blocklist.buddy
             WHERE blocklist.uid = ?1",
        )
        .expect("static query");
    stmt.query_map([uid], row_to_buddy).map(|rows| rows.filter_map(Result::ok).collect()).unwrap_or_default()
}

pub fn buddy_uids(db: &Connection, uid: u32) -> Vec<u32> {
    let mut stmt = db.prepare("SELECT buddy FROM buddylist WHERE uid = ?1").expect("static query");
    stmt.query_map([uid], |r| r.get::<_, i64>(0).map(|v| v as u32))
        .map(|rows| rows.filter_map(Result::ok).collect())
        .unwrap_or_default()
}

pub fn set_buddy_display(tx: &Transaction, uid: u32, buddy: u32, display: &str) -> rusqlite::Result<()> {
    tx.execute(
        "UPDATE buddylist SET display=?1 WHERE uid=?2 AND buddy=?3",
        rusqlite::params![display, uid, buddy],
    )?;
    Ok(())
}

pub fn add_buddy(tx: &Transaction, uid: u32, buddy: u32) -> rusqlite::Result<()> {
    tx.execute(
        "INSERT INTO buddylist(uid, buddy) VALUES(?1, ?2) ON CONFLICT DO NOTHING",
        [uid, buddy],
    )?;
    Ok(())
}

pub fn remove_buddy(tx: &Transaction, uid: u32, buddy: u32) -> rusqlite::Result<()> {
    tx.execute("DELETE FROM buddylist WHERE uid=?1 AND buddy=?2", [uid, buddy])?;
    Ok(())
}

pub fn block_buddy(tx: &Transaction, uid: u32, buddy: u32) -> rusqlite::Result<()> {
    tx.execute(
        "INSERT INTO blocklist(uid, buddy) VALUES(?1, ?2) ON CONFLICT DO NOTHING",
        [uid, buddy],
    )?;
    Ok(())
}

pub fn unblock_buddy(tx: &Transaction, uid: u32, buddy: u32) -> rusqlite::Result<()> {
    tx.execute("DELETE FROM blocklist WHERE uid=?1 AND buddy=?2", [uid, buddy])?;
    Ok(())
}

/// Non-zero if `uid` is on `other`'s blocklist (i.e. `other` blocked `uid`).
pub fn user_blocked_me(db: &Connection, uid: u32, other: u32) -> bool {
    let count: i64 = db
        .query_row(
            "SELECT count(*) FROM blocklist WHERE uid=?1 AND buddy=?2",
            [other, uid],
            |r| r.get(0),
        )
        .unwrap_or(0);
    count != 0
}

/// Non-zero if `uid` has blocked `other`.
pub fn i_blocked_user(db: &Connection, uid: u32, other: u32) -> bool {
    let count: i64 = db
        .query_row(
            "SELECT count(*) FROM blocklist WHERE uid=?1 AND buddy=?2",
            [uid, other],
            |r| r.get(0),
        )
        .unwrap_or(0);
    count != 0
}

pub fn nickname_of(db: &Connection, uid: u32) -> Option<String> {
    db.query_row("SELECT nickname FROM users WHERE uid=?1", [uid], |r| r.get(0)).optional().ok().flatten()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_memory_for_test;

    fn new_user(tx: &Transaction, nick: &str) -> u32 {
        tx.execute("INSERT INTO users(nickname,email) VALUES(?1,'a@b.com')", [nick]).unwrap();
        tx.last_insert_rowid() as u32
    }

    #[test]
    fn add_buddy_then_list_contains_it() {
        let mut conn = open_memory_for_test();
        let tx = conn.transaction().unwrap();
        let a = new_user(&tx, "alice");
        let b = new_user(&tx, "bob");
        add_buddy(&tx, a, b).unwrap();
        tx.commit().unwrap();
        let list = buddy_list(&conn, a);
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].uid, b);
    }

    #[test]
    fn block_asymmetry_blocker_vs_blockee() {
        let mut conn = open_memory_for_test();
        let tx = conn.transaction().unwrap();
        let a = new_user(&tx, "alice");
        let b = new_user(&tx, "bob");
        block_buddy(&tx, a, b).unwrap();
        tx.commit().unwrap();
        assert!(i_blocked_user(&conn, a, b));
        assert!(user_blocked_me(&conn, b, a));
        assert!(!i_blocked_user(&conn, b, a));
        assert!(!user_blocked_me(&conn, a, b));
    }

    #[test]
    fn remove_buddy_clears_row() {
        let mut conn = open_memory_for_test();
        let tx = conn.transaction().unwrap();
        let a = new_user(&tx, "alice");
        let b = new_user(&tx, "bob");
        add_buddy(&tx, a, b).unwrap();
        remove_buddy(&tx, a, b).unwrap();
        tx.commit().unwrap();
        assert!(buddy_list(&conn, a).is_empty());
    }
}
