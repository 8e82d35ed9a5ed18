//! Login flow. Grounded on `original_source/src/server_login.c`.

use rand::Rng;
use rusqlite::Connection;

use ptserver_protocol::framer::Frame;
use ptserver_protocol::obfuscate::Codebook;
use ptserver_protocol::wire::{self, packet, uid_is_error};

use crate::context::{read_u32_be, ConnectionState, Flow};
use crate::db::Db;
use crate::model::user;
use crate::registry::{ConnectionHandle, Registry};

use super::{general, log_unexpected, registration};

/// Sent the moment a connection is accepted, before any packet arrives.
pub fn enter(state: &ConnectionState) {
    state.send(Frame::empty(packet::HELLO));
}

pub async fn handle(
    state: &mut ConnectionState,
    frame: &Frame,
    reader: &Connection,
    db: &Db,
    registry: &Registry,
) -> anyhow::Result<()> {
    match frame.ptype {
        packet::CLIENT_HELLO | packet::OLD_CLIENT_HELLO => {
            state.protocol_version = frame.version;
            state.send(Frame::new(packet::HELLO, b"Hello-From:PaLTaLK".to_vec()));
        }

        packet::GET_UID => {
            let nick = String::from_utf8_lossy(&frame.body).trim_end_matches('\0').to_string();
            let uid = if nick.eq_ignore_ascii_case("newuser") {
                wire::UID_NEWUSER
            } else {
                user::lookup_uid(reader, &nick)
            };
            let mut rec = ptserver_protocol::record::RecordBuf::new();
            rec.append_field("uid", &uid.to_string()).append_field("nickname", &nick);
            state.send(Frame::new(packet::UID_RESPONSE, rec.into_inner()));
        }

        packet::INITIAL_STATUS | packet::INITIAL_STATUS_2 => {
            handle_initial_status(state, frame, reader)?;
        }

        packet::LOGIN => {
            handle_login(state, frame, reader, db, registry).await?;
        }

        packet::UID_FONTDEPTH_ETC => {
            if let Some(level) = read_u32_be(&frame.body, 0) {
                if level != 0 && level != state.ccban_level {
                    state.send(Frame::new(packet::CLIENT_CONTROL, vec![1u8]));
                    state.ccban_level = level;
                } else if level == 0 && state.ccban_level != 0 {
                    state.send(Frame::new(packet::CLIENT_CONTROL, vec![0u8]));
                    state.ccban_level = 0;
                }
            }
            state.transition_to(Flow::General);
            general::enter(state, reader, db, registry).await?;
        }

        packet::REGISTRATION | packet::PT5_REGISTRATION => {
            state.transition_to(Flow::Registration);
            registration::enter(state);
            if frame.ptype == packet::PT5_REGISTRATION {
                // v5 reconnects straight into the new flow with the same packet.
                Box::pin(registration::handle(state, frame, reader, db, registry)).await?;
            }
        }

        other => log_unexpected(Flow::Login, other),
    }
    Ok(())
}

fn handle_initial_status(state: &mut ConnectionState, frame: &Frame, reader: &Connection) -> anyhow::Result<()> {
    let Some(uid) = read_u32_be(&frame.body, 0) else { return Ok(()) };
    let status = read_u32_be(&frame.body, 4).unwrap_or(wire::STATUS_ONLINE);
    let device_enc = frame.body.get(8..).unwrap_or(&[]);

    if uid_is_error(uid) {
        state.send_return_code(0x01, "Unknown user.");
        state.kick("Unknown user.");
        return Ok(());
    }

    let device_challenge = (uid % 0x37) as u16;
    let device_id = state
        .obfuscator
        .decode(1, device_challenge, device_enc)
        .map(|v| String::from_utf8_lossy(&v).trim_end_matches('\0').to_string())
        .unwrap_or_default();

    let Some(found) = user::lookup_user(reader, uid)? else {
        state.send_return_code(0x01, "Unknown user.");
        state.kick("Unknown user.");
        return Ok(());
    };

    let known_device = user::devices::device_in_list(reader, uid, &device_id);
    let secret_q = if known_device { None } else { user::user_get_secret_question(reader, uid) };

    state.uid = uid;
    state.status = status;
    state.device_id = Some(device_id);
    state.user = Some(found);

    let body = build_challenge_body(state, known_device, secret_q.as_deref());
    state.send(Frame::new(packet::CHALLENGE, body));
    Ok(())
}

fn build_challenge_body(state: &mut ConnectionState, known_device: bool, secret_q: Option<&str>) -> Vec<u8> {
    let mut body = Vec::new();

    if state.is_v82_plus() {
        let cb = Codebook::generate(&mut rand::thread_rng());
        body.extend_from_slice(&cb.cb1_offset.to_be_bytes());
        body.extend_from_slice(&cb.cb2_step.to_be_bytes());
        body.extend_from_slice(&cb.cb3_step.to_be_bytes());
        while body.len() < 14 {
            body.push(0);
        }
        state.obfuscator.set_codebook(cb);
    }

    for _ in 0..4 {
        body.push(b'0' + rand::thread_rng().gen_range(0..10u8));
    }
    let nnn = (state.challenge as u32 + 0x1fd).to_string();
    body.extend_from_slice(nnn.as_bytes());

    if !known_device {
        if let Some(q) = secret_q {
            body.push(b'\n');
            body.extend_from_slice(q.as_bytes());
        }
    }
    body
}

async fn handle_login(
    state: &mut ConnectionState,
    frame: &Frame,
    reader: &Connection,
    db: &Db,
    registry: &Registry,
) -> anyhow::Result<()> {
    let Some(uid) = read_u32_be(&frame.body, 0) else { return Ok(()) };
    if uid != state.uid {
        state.send_return_code(0x63, "Session mismatch.");
        return Ok(());
    }

    let rest = String::from_utf8_lossy(frame.body.get(4..).unwrap_or(&[])).to_string();
    let mut parts = rest.split('\n');
    let Some(pw_enc) = parts.next() else { return Ok(()) };
    let ip_enc = parts.next().unwrap_or("");
    let answer_enc = parts.next();
    let add_flag = parts.next();

    let Some(password_bytes) = state.obfuscator.decode(1, state.challenge, pw_enc.as_bytes()) else {
        state.send_return_code(0x63, "The password you entered is incorrect.");
        return Ok(());
    };
    let password = String::from_utf8_lossy(&password_bytes).to_string();

    if !user::user_check_password(reader, uid, &password) {
        state.send_return_code(0x63, "The password you entered is incorrect.");
        return Ok(());
    }

    if let Some(ip_bytes) = state.obfuscator.decode(2, state.challenge, ip_enc.as_bytes()) {
        if ip_bytes.len() == 4 {
            let be = u32::from_be_bytes([ip_bytes[0], ip_bytes[1], ip_bytes[2], ip_bytes[3]]);
            state.server_ip = Some(be.swap_bytes());
        }
    }

    let device_id = state.device_id.clone().unwrap_or_default();
    let answer_ok = match (answer_enc, &state.obfuscator) {
        (Some(enc), obf) => obf
            .decode(1, state.challenge, enc.as_bytes())
            .map(|v| user::user_check_question_response(reader, uid, &String::from_utf8_lossy(&v)))
            .unwrap_or(false),
        (None, _) => true,
    };
    let should_add_device = add_flag == Some("add") && answer_ok;

    db.with_tx(|tx| {
        if should_add_device {
            user::devices::device_add(tx, uid, &device_id)?;
        }
        user::devices::device_inc_logins(tx, uid, &device_id)?;
        user::user_logged_in(tx, uid)?;
        Ok(())
    })
    .await?;

    registry.kick(uid, "You have logged in from another location.");
    registry.login(uid, ConnectionHandle { out: state.out_handle() });

    state.uid = uid;
    state.send(Frame::empty(packet::LOGIN_SUCCESS));
    state.transition_to(Flow::General);
    general::enter(state, reader, db, registry).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use tokio::sync::mpsc;

    use crate::db::Db;
    use crate::model::user::User;

    use super::*;

    /// A writer `Db` plus a reader `Connection` pointed at the same backing
    /// file, the same split every real connection uses.
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
        let peer: SocketAddr = "127.0.0.1:4000".parse().unwrap();
        (ConnectionState::new(peer, tx), rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Frame>) -> Vec<Frame> {
        let mut out = Vec::new();
        while let Ok(f) = rx.try_recv() {
            out.push(f);
        }
        out
    }

    #[tokio::test]
    async fn get_uid_resolves_newuser_sentinel() {
        let t = test_db();
        let (mut state, mut rx) = new_state();
        let frame = Frame::new(packet::GET_UID, b"newuser".to_vec());
        handle(&mut state, &frame, &t.reader, &t.db, &Registry::new()).await.unwrap();
        let sent = drain(&mut rx).pop().unwrap();
        assert_eq!(sent.ptype, packet::UID_RESPONSE);
        assert!(String::from_utf8_lossy(&sent.body).contains(&wire::UID_NEWUSER.to_string()));
    }

    #[test]
    fn initial_status_rejects_unknown_uid() {
        let t = test_db();
        let (mut state, mut rx) = new_state();
        let mut body = Vec::new();
        body.extend_from_slice(&999u32.to_be_bytes());
        body.extend_from_slice(&wire::STATUS_ONLINE.to_be_bytes());
        let frame = Frame::new(packet::INITIAL_STATUS, body);
        handle_initial_status(&mut state, &frame, &t.reader).unwrap();
        assert!(state.disconnect);
        let frames = drain(&mut rx);
        assert!(frames.iter().any(|f| f.ptype == packet::RETURN_CODE));
        assert!(frames.iter().any(|f| f.ptype == packet::SERVER_DISCONNECT));
    }

    #[tokio::test]
    async fn full_login_accepts_correct_password_and_enters_general() {
        let t = test_db();
        let uid = t
            .db
            .with_tx(|tx| {
                let uid = crate::model::user::register_user(
                    tx,
                    &User { nickname: "alice".into(), email: "a@example.com".into(), ..Default::default() },
                )?;
                crate::model::user::user_set_password(tx, uid, "hunter2")?;
                Ok(uid)
            })
            .await
            .unwrap();

        let (mut state, mut rx) = new_state();
        state.uid = uid;

        let mut rng = rand::thread_rng();
        let pw_enc = state.obfuscator.encode(1, state.challenge, b"hunter2", &mut rng).unwrap();

        let mut body = Vec::new();
        body.extend_from_slice(&uid.to_be_bytes());
        body.extend_from_slice(&pw_enc);
        let frame = Frame::new(packet::LOGIN, body);

        let registry = Registry::new();
        handle(&mut state, &frame, &t.reader, &t.db, &registry).await.unwrap();

        assert_eq!(state.flow, Flow::General);
        assert!(registry.is_online(uid));
        let frames = drain(&mut rx);
        assert!(frames.iter().any(|f| f.ptype == packet::LOGIN_SUCCESS));
    }

    #[tokio::test]
    async fn full_login_rejects_wrong_password() {
        let t = test_db();
        let uid = t
            .db
            .with_tx(|tx| {
                let uid = crate::model::user::register_user(
                    tx,
                    &User { nickname: "bob".into(), email: "b@example.com".into(), ..Default::default() },
                )?;
                crate::model::user::user_set_password(tx, uid, "correct-horse")?;
                Ok(uid)
            })
            .await
            .unwrap();

        let (mut state, mut rx) = new_state();
        state.uid = uid;

        let mut rng = rand::thread_rng();
        let pw_enc = state.obfuscator.encode(1, state.challenge, b"wrong-password", &mut rng).unwrap();

        let mut body = Vec::new();
        body.extend_from_slice(&uid.to_be_bytes());
        body.extend_from_slice(&pw_enc);
        let frame = Frame::new(packet::LOGIN, body);

        let registry = Registry::new();
        handle(&mut state, &frame, &t.reader, &t.db, &registry).await.unwrap();

        assert_eq!(state.flow, Flow::Login);
        assert!(!registry.is_online(uid));
        let frames = drain(&mut rx);
        assert!(frames.iter().any(|f| f.ptype == packet::RETURN_CODE));
    }
}
