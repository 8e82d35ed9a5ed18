//! Persistence adapter (Module C).
//!
//! Source speaks to SQLite through a small hand-rolled C API (`db_open`,
//! `db_prepare`/`db_bind`/`db_do_prepared`, `db_exec` with a row callback).
//! `rusqlite` already gives typed, RAII'd prepared statements and row
//! iteration, so this module skips reproducing that indirection and exposes
//! typed functions directly; the schema, PRAGMAs, seed rows and the
//! "commit-even-on-error" per-packet transaction policy are preserved.

use std::path::Path;

use rusqlite::Connection;
use tokio::sync::Mutex;
use tracing::{error, warn};

pub mod buddy;
pub mod room;
pub mod user;

/// SQLite's `application_id` header field, used to fingerprint our own
/// database files so we refuse to open something foreign.
pub const APPLICATION_ID: i64 = 0x5054_dead;

const SCHEMA: &[&str] = &[
    "CREATE TABLE users(
        uid                        INTEGER PRIMARY KEY AUTOINCREMENT,
        nickname                   TEXT NOT NULL COLLATE NOCASE UNIQUE,
        email                      TEXT NOT NULL COLLATE NOCASE,
        first                      TEXT NOT NULL DEFAULT '',
        last                       TEXT NOT NULL DEFAULT '',
        privacy                    TEXT NOT NULL DEFAULT 'A',
        verified                   INTEGER NOT NULL DEFAULT 0,
        random                     INTEGER NOT NULL DEFAULT 0,
        paid1                      TEXT NOT NULL DEFAULT 'N',
        get_offers_from_us         INTEGER NOT NULL DEFAULT 1,
        get_offers_from_affiliates INTEGER NOT NULL DEFAULT 1,
        banners                    INTEGER NOT NULL DEFAULT 0,
        admin                      INTEGER NOT NULL DEFAULT 0,
        sup                        INTEGER NOT NULL DEFAULT 0,
        created                    TEXT NOT NULL DEFAULT '',
        last_login                 TEXT
    )",
    "INSERT INTO users(nickname,email,first,last) VALUES('nxuser', 'root@localhost', 'Nonexistent', 'User')",
    "CREATE TABLE user_devices(
        uid       INTEGER REFERENCES users,
        device_id TEXT NOT NULL COLLATE NOCASE DEFAULT '',
        logins    INTEGER NOT NULL DEFAULT 0,
        PRIMARY KEY(uid, device_id)
    )",
    "CREATE TABLE secret_questions(
        id       INTEGER PRIMARY KEY AUTOINCREMENT,
        secret_q TEXT NOT NULL
    )",
    "INSERT INTO secret_questions VALUES(0, 'What is the answer to the question of life, the universe, and everything?')",
    "INSERT INTO secret_questions VALUES(1, 'What is the name of the street where you grew up?')",
    "INSERT INTO secret_questions VALUES(2, 'What is the name of your favorite restaraunt?')",
    "INSERT INTO secret_questions VALUES(3, 'What is the name of your favorite cartoon character?')",
    "INSERT INTO secret_questions VALUES(4, 'What is the name of your favorite fictional character?')",
    "INSERT INTO secret_questions VALUES(5, 'What is the title of your favorite book?')",
    "INSERT INTO secret_questions VALUES(6, 'Where did you go on your first date?')",
    "INSERT INTO secret_questions VALUES(7, 'What is your favorite Pet''s name?')",
    "INSERT INTO secret_questions VALUES(8, 'What is the your best friends last name?')",
    "INSERT INTO secret_questions VALUES(9, 'What is the your dream occupation?')",
    "CREATE TABLE secrets(
        uid           INTEGER PRIMARY KEY REFERENCES users,
        password      TEXT NOT NULL,
        sq_index      INTEGER REFERENCES secret_questions,
        sq_answer     TEXT COLLATE NOCASE,
        password_hint TEXT COLLATE NOCASE
    )",
    "CREATE TABLE banlevel(
        uid   INTEGER PRIMARY KEY REFERENCES users,
        level INTEGER NOT NULL DEFAULT 0
    )",
    "CREATE TABLE buddylist(
        uid     INTEGER REFERENCES users,
        buddy   INTEGER REFERENCES users,
        display TEXT,
        PRIMARY KEY(uid, buddy)
    )",
    "CREATE TABLE blocklist(
        uid   INTEGER REFERENCES users,
        buddy INTEGER REFERENCES users,
        PRIMARY KEY(uid, buddy)
    )",
    "CREATE TABLE categories(
        code  INTEGER PRIMARY KEY,
        value TEXT NOT NULL
    )",
    "CREATE TABLE subcategories(
        subcatg INTEGER PRIMARY KEY AUTOINCREMENT,
        catg    INTEGER REFERENCES categories,
        disp    INTEGER DEFAULT 1,
        name    TEXT NOT NULL
    )",
    "INSERT INTO categories VALUES(0x7530, 'Top Rooms')",
    "INSERT INTO categories VALUES(0x7594, 'Featured Rooms')",
    "INSERT INTO categories VALUES(0x7601, 'Paltalk Help Rooms')",
    "INSERT INTO categories VALUES(0x7602, 'Paltalk Radio')",
    "INSERT INTO categories VALUES(0x7603, 'Distance Learning')",
    "INSERT INTO categories VALUES(0x7604, 'Meet New Friends')",
    "INSERT INTO categories VALUES(0x7605, 'Love and Romance')",
    "INSERT INTO categories VALUES(0x7606, 'Social Issues')",
    "INSERT INTO categories VALUES(0x7607, 'By Language: Europe')",
    "INSERT INTO categories VALUES(0x7608, 'By Language: Arabic')",
    "INSERT INTO categories VALUES(0x7609, 'By Language: Spanish & Portugese')",
    "INSERT INTO categories VALUES(0x760a, 'By Language: Asia & The Far East')",
    "INSERT INTO categories VALUES(0x760b, 'By Language: Middle East')",
    "INSERT INTO categories VALUES(0x760c, 'By Language: India & Pakistan')",
    "INSERT INTO categories VALUES(0x760d, 'By Language / Nationality / Other')",
    "INSERT INTO categories VALUES(0x760e, 'African American')",
    "INSERT INTO categories VALUES(0x760f, 'Welcome Brazil')",
    "INSERT INTO categories VALUES(0x7610, 'Early Teens (13 - 17 ONLY) - NO ADULTS')",
    "INSERT INTO categories VALUES(0x7611, 'Young Adults (18+)')",
    "INSERT INTO categories VALUES(0x7612, 'Religious')",
    "INSERT INTO categories VALUES(0x7613, 'Christianity')",
    "INSERT INTO categories VALUES(0x7614, 'Islam')",
    "INSERT INTO categories VALUES(0x7615, 'Judaism')",
    "INSERT INTO categories VALUES(0x7616, 'Health Related / Parenting')",
    "INSERT INTO categories VALUES(0x7617, 'Computers - Hi Tech')",
    "INSERT INTO categories VALUES(0x7618, 'Sports and Hobbies')",
    "INSERT INTO categories VALUES(0x7619, 'Business and Finance')",
    "INSERT INTO categories VALUES(0x761a, 'Music')",
    "INSERT INTO categories VALUES(0x761b, 'Miscellaneous')",
    "INSERT INTO categories VALUES(0x761c, 'Adult Oriented')",
    "CREATE TABLE rooms(
        id           INTEGER PRIMARY KEY AUTOINCREMENT,
        catg         INTEGER REFERENCES categories,
        subcatg      INTEGER REFERENCES subcategories,
        lang         TEXT NOT NULL DEFAULT 'all',
        r            TEXT NOT NULL DEFAULT 'A',
        v            INTEGER DEFAULT 0,
        p            INTEGER DEFAULT 0,
        l            INTEGER DEFAULT 0,
        c            TEXT NOT NULL DEFAULT '000000000',
        nm           TEXT,
        mike         INTEGER DEFAULT 1,
        text         INTEGER DEFAULT 0,
        video        INTEGER DEFAULT 0,
        topic        TEXT,
        topic_setter INTEGER REFERENCES users,
        code         INTEGER DEFAULT 0,
        password     TEXT,
        created      TEXT NOT NULL DEFAULT '',
        rtype        INTEGER NOT NULL DEFAULT 0
    )",
    "INSERT INTO rooms(id,catg,r,v,p,l,c,nm) VALUES(0x01c2, 0x7601, 'G', 1, 0, 0, '000000000', 'Welcome New Users')",
    "INSERT INTO rooms(id,catg,r,v,p,l,c,nm) VALUES(0x0258, 0x7601, 'G', 1, 0, 0, '000000000', 'Paltalk Support')",
    "UPDATE rooms SET created=datetime('now','subsec')",
    "CREATE TABLE room_bans(
        id     INTEGER REFERENCES rooms,
        uid    INTEGER REFERENCES users,
        banner INTEGER REFERENCES users,
        ts     TEXT NOT NULL DEFAULT '',
        PRIMARY KEY(id, uid)
    )",
    "CREATE TABLE room_bounces(
        id      INTEGER REFERENCES rooms,
        uid     INTEGER REFERENCES users,
        bouncer INTEGER REFERENCES users,
        reason  TEXT DEFAULT '',
        ts      TEXT NOT NULL DEFAULT '',
        PRIMARY KEY(id, uid)
    )",
    "CREATE TABLE room_users(
        id    INTEGER REFERENCES rooms,
        uid   INTEGER REFERENCES users,
        req   INTEGER DEFAULT 0,
        mic   INTEGER DEFAULT 0,
        pub   TEXT DEFAULT 'N',
        away  INTEGER DEFAULT 0,
        invis INTEGER DEFAULT 0,
        reddot INTEGER DEFAULT 0,
        PRIMARY KEY(id, uid)
    )",
    "CREATE TABLE offline_messages(
        from_uid INTEGER REFERENCES users,
        to_uid   INTEGER REFERENCES users,
        tstamp   TEXT NOT NULL,
        msg      TEXT NOT NULL,
        PRIMARY KEY(from_uid, to_uid, tstamp)
    )",
    "CREATE TABLE user_complaints(
        id           INTEGER PRIMARY KEY AUTOINCREMENT,
        complaintant INTEGER REFERENCES users,
        subject      INTEGER REFERENCES users,
        complaint    TEXT
    )",
    "CREATE TRIGGER IF NOT EXISTS users_delete BEFORE DELETE ON users BEGIN
        DELETE FROM secrets WHERE uid=OLD.uid;
        DELETE FROM buddylist WHERE uid=OLD.uid OR buddy=OLD.uid;
        DELETE FROM blocklist WHERE uid=OLD.uid OR buddy=OLD.uid;
    END",
    "CREATE TRIGGER IF NOT EXISTS category_delete BEFORE DELETE ON categories BEGIN
        DELETE FROM rooms WHERE catg=OLD.code;
        DELETE FROM subcategories WHERE catg=OLD.code;
    END",
    "CREATE TRIGGER IF NOT EXISTS subcategory_delete BEFORE DELETE ON subcategories BEGIN
        UPDATE rooms SET subcatg=0 WHERE subcatg=OLD.subcatg;
    END",
];

/// Connection-level PRAGMAs applied to every handle (reader or writer).
/// `room_users` is a real, shared table here rather than source's
/// per-connection `TEMPORARY` one (see the Open Question resolution in
/// DESIGN.md): many tokio tasks share this one process, so there is no
/// longer a single connection lifetime to scope a temp table to.
fn apply_pragmas(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "PRAGMA foreign_keys = ON;
         PRAGMA journal_mode = WAL;
         PRAGMA synchronous = NORMAL;",
    )
}

fn bootstrap_if_empty(conn: &Connection) -> anyhow::Result<()> {
    let page_count: i64 = conn.query_row("PRAGMA page_count", [], |r| r.get(0))?;
    if page_count != 0 {
        return Ok(());
    }

    let tx = conn.unchecked_transaction()?;
    for stmt in SCHEMA {
        tx.execute_batch(stmt)?;
    }
    tx.pragma_update(None, "application_id", APPLICATION_ID)?;
    tx.commit()?;
    Ok(())
}

fn check_application_id(conn: &Connection) -> anyhow::Result<()> {
    let id: i64 = conn.query_row("PRAGMA application_id", [], |r| r.get(0))?;
    if id != 0 && id != APPLICATION_ID {
        anyhow::bail!("database file has application_id 0x{id:x}, not ours (0x{APPLICATION_ID:x})");
    }
    Ok(())
}

/// Opens the writable connection, creating and seeding the schema if the
/// file is empty.
pub fn open_writer(path: &Path) -> anyhow::Result<Connection> {
    let conn = Connection::open(path)?;
    apply_pragmas(&conn)?;
    bootstrap_if_empty(&conn)?;
    check_application_id(&conn)?;
    Ok(conn)
}

/// Opens a read-only connection against the same file, for a single
/// connection's non-mutating lookups.
pub fn open_reader(path: &Path) -> anyhow::Result<Connection> {
    let conn = Connection::open_with_flags(path, rusqlite::OpenFlags::SQLITE_OPEN_READ_ONLY)?;
    apply_pragmas(&conn)?;
    check_application_id(&conn)?;
    Ok(conn)
}

/// Process-wide handle to the writable connection, serialized behind a
/// mutex (SQLite only allows one writer at a time regardless; this makes
/// that explicit rather than relying on implicit single-threaded dispatch
/// the way source's one-event-loop model did).
pub struct Db {
    pub write: Mutex<Connection>,
}

impl Db {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        Ok(Db { write: Mutex::new(open_writer(path)?) })
    }

    /// Runs `f` inside a write transaction that commits unconditionally on
    /// return, even if `f` itself reported an error. This is a deliberately
    /// preserved quirk (source wraps every inbound packet the same way) --
    /// a failed statement inside a handler degrades that one operation
    /// gracefully rather than rolling back unrelated work already done in
    /// the same packet's handling.
    pub async fn with_tx<T>(
        &self,
        f: impl FnOnce(&rusqlite::Transaction) -> anyhow::Result<T>,
    ) -> anyhow::Result<T> {
        let mut conn = self.write.lock().await;
        let tx = conn.unchecked_transaction()?;
        let result = f(&tx);
        if let Err(e) = &result {
            warn!(error = %e, "packet handler reported an error; committing anyway");
        }
        if let Err(e) = tx.commit() {
            error!(error = %e, "failed to commit packet transaction");
        }
        result
    }
}

#[cfg(test)]
pub(crate) fn open_memory_for_test() -> Connection {
    let conn = Connection::open_in_memory().unwrap();
    apply_pragmas(&conn).unwrap();
    bootstrap_if_empty(&conn).unwrap();
    conn
}
