//! Registration flow. Grounded on `original_source/src/server_registration.c`.

use rusqlite::Connection;

use ptserver_protocol::framer::Frame;
use ptserver_protocol::obfuscate::Codebook;
use ptserver_protocol::record::each_field_kv;
use ptserver_protocol::wire::{packet, NICKNAME_MAX};

use crate::context::ConnectionState;
use crate::db::Db;
use crate::model::user::{self, User};
use crate::registry::Registry;

use super::log_unexpected;
use crate::context::Flow;

/// Sent on transition into this flow. v5 clients have their registration
/// dialog suppressed client-side, so source fabricates a `RETURN_CODE`
/// instead of the real `DO_REGISTRATION` prompt (§4.8).
pub fn enter(state: &mut ConnectionState) {
    if state.is_legacy_v5() {
        state.send_return_code(0x00, "Please register at www.paltalk.com.");
        return;
    }

    let mut body = Vec::new();
    body.extend_from_slice(&state.challenge.to_be_bytes());
    if state.is_v82_plus() {
        let cb = Codebook::generate(&mut rand::thread_rng());
        body.extend_from_slice(&cb.cb1_offset.to_be_bytes());
        body.extend_from_slice(&cb.cb2_step.to_be_bytes());
        body.extend_from_slice(&cb.cb3_step.to_be_bytes());
        while body.len() < 16 {
            body.push(0);
        }
        state.obfuscator.set_codebook(cb);
    }
    state.send(Frame::new(packet::DO_REGISTRATION, body));
}

pub async fn handle(
    state: &mut ConnectionState,
    frame: &Frame,
    reader: &Connection,
    db: &Db,
    _registry: &Registry,
) -> anyhow::Result<()> {
    match frame.ptype {
        packet::REGISTRATION_CHALLENGE => {
            if let Some(decoded) = state.obfuscator.decode(1, state.challenge, &frame.body) {
                if let Ok(n) = String::from_utf8_lossy(&decoded).trim().parse::<u32>() {
                    state.challenge = (1 + n) as u16;
                }
            }
        }

        packet::REGISTRATION_INFO => handle_registration_info(state, frame, reader, db).await?,

        packet::REGISTRATION_ADINFO => {
            let body = String::from_utf8_lossy(&frame.body);
            if body.contains("&success=1") {
                state.transition_fro();
            }
            // else: tolerated no-op, PT8 clients may resend this harmlessly.
        }

        packet::PT5_REGISTRATION => handle_pt5_registration(state, frame, db).await?,

        other => log_unexpected(Flow::Registration, other),
    }
    Ok(())
}

async fn handle_registration_info(
    state: &mut ConnectionState,
    frame: &Frame,
    reader: &Connection,
    db: &Db,
) -> anyhow::Result<()> {
    let text = String::from_utf8_lossy(&frame.body).to_string();
    let fields: Vec<&str> = text.split('\n').collect();
    if fields.len() < 5 {
        state.send(Frame::empty(packet::REGISTRATION_FAILED));
        return Ok(());
    }

    let decode = |enc: &str| -> String {
        state
            .obfuscator
            .decode(2, state.challenge, enc.as_bytes())
            .map(|v| String::from_utf8_lossy(&v).to_string())
            .unwrap_or_default()
    };

    let nickname_raw = decode(fields[0]);
    let password = decode(fields[1]);
    let email = decode(fields[2]);
    let sq_index: u32 = fields.get(3).and_then(|f| f.parse().ok()).unwrap_or(0);
    let sq_answer = fields.get(4).map(|f| decode(f)).unwrap_or_default();
    let first = fields.get(5).unwrap_or(&"").to_string();
    let last = fields.get(6).unwrap_or(&"").to_string();

    let nickname: String = nickname_raw.chars().take(NICKNAME_MAX).collect();
    let valid_charset = nickname.chars().next().is_some_and(|c| c.is_ascii_alphanumeric());
    if nickname.is_empty() || !valid_charset {
        state.send(Frame::empty(packet::REGISTRATION_FAILED));
        return Ok(());
    }

    if user::nickname_in_use(reader, &nickname) {
        let mut rng = rand::thread_rng();
        let suggestion = user::suggest_nickname(reader, &nickname, &mut rng);
        let mut body = Vec::new();
        body.extend_from_slice(suggestion.as_bytes());
        state.send(Frame::new(packet::REGISTRATION_NAME_IN_USE, body));
        return Ok(());
    }

    let uid = db
        .with_tx(|tx| {
            let uid = user::register_user(tx, &User { nickname: nickname.clone(), email, first, last, ..Default::default() })?;
            user::user_set_password(tx, uid, &password)?;
            if !sq_answer.is_empty() {
                user::user_set_secret_question(tx, uid, sq_index, &sq_answer)?;
            }
            Ok(uid)
        })
        .await;

    match uid {
        Ok(uid) => {
            let mut body = Vec::with_capacity(4);
            body.extend_from_slice(&uid.to_be_bytes());
            state.send(Frame::new(packet::REGISTRATION_SUCCESS, body));
            state.transition_fro();
        }
        Err(_) => state.send(Frame::empty(packet::REGISTRATION_FAILED)),
    }
    Ok(())
}

async fn handle_pt5_registration(state: &mut ConnectionState, frame: &Frame, db: &Db) -> anyhow::Result<()> {
    let text = String::from_utf8_lossy(&frame.body).to_string();
    let mut nickname = String::new();
    let mut password = String::new();
    let mut email = String::new();
    let mut first = String::new();
    let mut last = String::new();

    each_field_kv(&text, |k, v| {
        let v = v.unwrap_or("").to_string();
        match k {
            "nickname" => nickname = v,
            "password" => password = v,
            "email" => email = v,
            "first" => first = v,
            "last" => last = v,
            _ => {}
        }
    });

    if nickname.is_empty() {
        state.send_return_code(0x01, "Missing nickname.");
        return Ok(());
    }

    let uid = db
        .with_tx(|tx| {
            let uid = user::register_user(tx, &User { nickname: nickname.clone(), email, first, last, ..Default::default() })?;
            user::user_set_password(tx, uid, &password)?;
            Ok(uid)
        })
        .await;

    match uid {
        Ok(_uid) => {
            state.send_return_code(0x00, "Registration successful.");
            state.send(Frame::empty(packet::PT5_SEND_LOGIN));
            state.transition_fro();
        }
        Err(_) => state.send_return_code(0x01, "Registration failed."),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use tokio::sync::mpsc;

    use crate::db::Db;

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
        let peer: SocketAddr = "127.0.0.1:4001".parse().unwrap();
        (ConnectionState::new(peer, tx), rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Frame>) -> Vec<Frame> {
        let mut out = Vec::new();
        while let Ok(f) = rx.try_recv() {
            out.push(f);
        }
        out
    }

    #[test]
    fn v5_client_gets_return_code_instead_of_prompt() {
        let (mut state, mut rx) = new_state();
        state.protocol_version = ptserver_protocol::wire::PROTOCOL_VERSION_50;
        enter(&mut state);
        let frame = drain(&mut rx).pop().unwrap();
        assert_eq!(frame.ptype, packet::RETURN_CODE);
    }

    #[test]
    fn pt8_client_gets_do_registration_prompt() {
        let (mut state, mut rx) = new_state();
        state.protocol_version = ptserver_protocol::wire::PROTOCOL_VERSION_82;
        enter(&mut state);
        let frame = drain(&mut rx).pop().unwrap();
        assert_eq!(frame.ptype, packet::DO_REGISTRATION);
    }

    #[tokio::test]
    async fn registration_info_creates_user_and_transitions() {
        let t = test_db();
        let (mut state, mut rx) = new_state();
        state.flow = crate::context::Flow::Registration;

        let mut rng = rand::thread_rng();
        let enc = |s: &str| state.obfuscator.encode(2, state.challenge, s.as_bytes(), &mut rng).unwrap();
        let nick = enc("newuser1");
        let pw = enc("s3cret");
        let email = enc("new@example.com");

        let mut body = Vec::new();
        body.extend_from_slice(&nick);
        body.push(b'\n');
        body.extend_from_slice(&pw);
        body.push(b'\n');
        body.extend_from_slice(&email);
        body.push(b'\n');
        body.extend_from_slice(b"0");
        body.push(b'\n');
        // no secret-question answer
        let frame = Frame::new(packet::REGISTRATION_INFO, body);

        handle(&mut state, &frame, &t.reader, &t.db, &Registry::new()).await.unwrap();

        assert!(user::nickname_in_use(&t.reader, "newuser1"));
        let frames = drain(&mut rx);
        assert!(frames.iter().any(|f| f.ptype == packet::REGISTRATION_SUCCESS));
    }

    #[tokio::test]
    async fn registration_info_rejects_short_body() {
        let t = test_db();
        let (mut state, mut rx) = new_state();
        let frame = Frame::new(packet::REGISTRATION_INFO, b"too\nshort".to_vec());
        handle(&mut state, &frame, &t.reader, &t.db, &Registry::new()).await.unwrap();
        let frame = drain(&mut rx).pop().unwrap();
        assert_eq!(frame.ptype, packet::REGISTRATION_FAILED);
    }

    #[tokio::test]
    async fn pt5_registration_requires_nickname() {
        let t = test_db();
        let (mut state, mut rx) = new_state();
        let frame = Frame::new(packet::PT5_REGISTRATION, b"email=x@example.com".to_vec());
        handle(&mut state, &frame, &t.reader, &t.db, &Registry::new()).await.unwrap();
        let frame = drain(&mut rx).pop().unwrap();
        assert_eq!(frame.ptype, packet::RETURN_CODE);
    }
}
