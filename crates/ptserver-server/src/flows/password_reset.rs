//! Password-reset flow. Grounded on `original_source/src/server_password_reset.c`.

use rusqlite::Connection;

use ptserver_protocol::framer::Frame;
use ptserver_protocol::wire::packet;

use crate::context::{read_u16_be, ConnectionState, Flow};
use crate::db::Db;
use crate::model::user;
use crate::registry::Registry;

use super::log_unexpected;

pub fn enter(state: &ConnectionState) {
    let body = (state.challenge as u32 + 0x1fd).to_string().into_bytes();
    state.send(Frame::new(packet::RESET_PASSWORD, body));
}

pub async fn handle(
    state: &mut ConnectionState,
    frame: &Frame,
    reader: &Connection,
    db: &Db,
    _registry: &Registry,
) -> anyhow::Result<()> {
    match frame.ptype {
        packet::NEW_PASSWORD => {
            let text = String::from_utf8_lossy(&frame.body).to_string();
            let mut parts = text.splitn(2, '\n');
            let Some(old_enc) = parts.next() else { return Ok(()) };
            let new_enc = parts.next().unwrap_or("");

            let old_ok = state
                .obfuscator
                .decode(1, state.challenge, old_enc.as_bytes())
                .map(|v| user::user_check_password(reader, state.uid, &String::from_utf8_lossy(&v)))
                .unwrap_or(false);

            if !old_ok {
                state.send_return_code(0x63, "The password you entered is incorrect.");
                return Ok(());
            }

            let Some(new_bytes) = state.obfuscator.decode(1, 0, new_enc.as_bytes()) else {
                state.send_return_code(0x63, "Could not read the new password.");
                return Ok(());
            };
            let new_password = String::from_utf8_lossy(&new_bytes).to_string();
            let uid = state.uid;
            db.with_tx(|tx| Ok(user::user_set_password(tx, uid, &new_password)?)).await?;
            state.send_return_code(0x00, "Password updated.");
            state.transition_fro();
        }

        packet::PASSWORD_HINT => {
            let Some(qid) = read_u16_be(&frame.body, 0) else { return Ok(()) };
            let rest = String::from_utf8_lossy(frame.body.get(2..).unwrap_or(&[])).to_string();
            let mut parts = rest.splitn(2, '\n');
            let answer = parts.next().unwrap_or("").to_string();
            let hint = parts.next().unwrap_or("").to_string();

            let uid = state.uid;
            db.with_tx(|tx| {
                user::user_set_secret_question(tx, uid, qid as u32, &answer)?;
                user::user_set_password_hint(tx, uid, &hint)?;
                Ok(())
            })
            .await?;
            state.transition_fro();
        }

        other => log_unexpected(Flow::PasswordReset, other),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use tokio::sync::mpsc;

    use crate::context::Flow;
    use crate::db::Db;
    use crate::model::user::User;
    use crate::registry::Registry;

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
        let peer: SocketAddr = "127.0.0.1:4002".parse().unwrap();
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
    fn enter_sends_reset_password_with_offset_challenge() {
        let (state, mut rx) = new_state();
        let expected = (state.challenge as u32 + 0x1fd).to_string();
        enter(&state);
        let frame = drain(&mut rx).pop().unwrap();
        assert_eq!(frame.ptype, packet::RESET_PASSWORD);
        assert_eq!(String::from_utf8_lossy(&frame.body), expected);
    }

    #[tokio::test]
    async fn new_password_rejects_wrong_old_password() {
        let t = test_db();
        let uid = t
            .db
            .with_tx(|tx| {
                let uid = user::register_user(tx, &User { nickname: "carol".into(), ..Default::default() })?;
                user::user_set_password(tx, uid, "oldpass")?;
                Ok(uid)
            })
            .await
            .unwrap();

        let (mut state, mut rx) = new_state();
        state.uid = uid;

        let mut rng = rand::thread_rng();
        let old_enc = state.obfuscator.encode(1, state.challenge, b"not-the-old-password", &mut rng).unwrap();
        let new_enc = state.obfuscator.encode(1, 0, b"newpass", &mut rng).unwrap();

        let mut body = Vec::new();
        body.extend_from_slice(&old_enc);
        body.push(b'\n');
        body.extend_from_slice(&new_enc);
        let frame = Frame::new(packet::NEW_PASSWORD, body);

        handle(&mut state, &frame, &t.reader, &t.db, &Registry::new()).await.unwrap();

        assert!(user::user_check_password(&t.reader, uid, "oldpass"));
        let frame = drain(&mut rx).pop().unwrap();
        assert_eq!(frame.ptype, packet::RETURN_CODE);
    }

    #[tokio::test]
    async fn new_password_updates_on_correct_old_password() {
        let t = test_db();
        let uid = t
            .db
            .with_tx(|tx| {
                let uid = user::register_user(tx, &User { nickname: "dave".into(), ..Default::default() })?;
                user::user_set_password(tx, uid, "oldpass")?;
                Ok(uid)
            })
            .await
            .unwrap();

        let (mut state, mut rx) = new_state();
        state.uid = uid;
        state.transition_to(Flow::PasswordReset);

        let mut rng = rand::thread_rng();
        let old_enc = state.obfuscator.encode(1, state.challenge, b"oldpass", &mut rng).unwrap();
        let new_enc = state.obfuscator.encode(1, 0, b"newpass", &mut rng).unwrap();

        let mut body = Vec::new();
        body.extend_from_slice(&old_enc);
        body.push(b'\n');
        body.extend_from_slice(&new_enc);
        let frame = Frame::new(packet::NEW_PASSWORD, body);

        handle(&mut state, &frame, &t.reader, &t.db, &Registry::new()).await.unwrap();

        assert!(user::user_check_password(&t.reader, uid, "newpass"));
        assert!(!user::user_check_password(&t.reader, uid, "oldpass"));
        assert_eq!(state.flow, Flow::Login);
        let frames = drain(&mut rx);
        assert!(frames.iter().any(|f| f.ptype == packet::RETURN_CODE));
    }

    #[tokio::test]
    async fn password_hint_stores_question_and_hint() {
        let t = test_db();
        let uid = t
            .db
            .with_tx(|tx| Ok(user::register_user(tx, &User { nickname: "erin".into(), ..Default::default() })?))
            .await
            .unwrap();

        let (mut state, _rx) = new_state();
        state.uid = uid;
        state.transition_to(Flow::PasswordReset);

        let mut body = Vec::new();
        body.extend_from_slice(&2u16.to_be_bytes());
        body.extend_from_slice(b"my favorite answer\nwhat's my hint?");
        let frame = Frame::new(packet::PASSWORD_HINT, body);

        handle(&mut state, &frame, &t.reader, &t.db, &Registry::new()).await.unwrap();

        assert!(user::user_check_question_response(&t.reader, uid, "my favorite answer"));
        assert_eq!(state.flow, Flow::Login);
    }
}
