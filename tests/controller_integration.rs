//! Exercises the [`tor_control::Controller`] façade's command
//! formatting and state machine against a mock daemon, complementing
//! the pure formatting unit tests in `src/controller.rs`.

use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

use tor_control::{Controller, Error};

fn mock_daemon() -> (Controller, DuplexStream) {
    let (client, daemon) = tokio::io::duplex(8192);
    let (read_half, write_half) = tokio::io::split(client);
    let controller = Controller::new(Box::new(read_half), Box::new(write_half));
    (controller, daemon)
}

async fn read_command_line(daemon: &mut DuplexStream) -> String {
    let mut buf = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        let n = daemon.read(&mut byte).await.expect("daemon read");
        assert_ne!(n, 0, "stream closed before a full line arrived");
        buf.push(byte[0]);
        if buf.ends_with(b"\r\n") {
            buf.truncate(buf.len() - 2);
            return String::from_utf8(buf).unwrap();
        }
    }
}

async fn send_line(daemon: &mut DuplexStream, line: &str) {
    daemon.write_all(line.as_bytes()).await.unwrap();
    daemon.write_all(b"\r\n").await.unwrap();
}

/// Non-AUTHENTICATE commands are rejected locally, before any bytes are
/// written, while the connection is still `Fresh`.
#[tokio::test]
async fn commands_before_authenticate_are_rejected_locally() {
    let (controller, _daemon) = mock_daemon();

    let err = controller.getinfo(&["version"]).await.unwrap_err();
    assert!(matches!(err, Error::InvalidArgument { .. }));
}

/// `authenticate` with an empty secret sends a bare `AUTHENTICATE `, and
/// a successful reply unlocks the rest of the command surface.
#[tokio::test]
async fn authenticate_with_empty_secret_then_getinfo() {
    let (controller, mut daemon) = mock_daemon();

    let client = {
        let controller = controller.clone();
        tokio::spawn(async move { controller.authenticate(b"").await })
    };
    assert_eq!(read_command_line(&mut daemon).await, "AUTHENTICATE ");
    send_line(&mut daemon, "250 OK").await;
    client.await.unwrap().unwrap();

    let client = {
        let controller = controller.clone();
        tokio::spawn(async move { controller.getinfo_single("version").await })
    };
    assert_eq!(read_command_line(&mut daemon).await, "GETINFO version");
    send_line(&mut daemon, "250-version=Tor 0.4.8.9").await;
    send_line(&mut daemon, "250 OK").await;
    assert_eq!(client.await.unwrap().unwrap(), "Tor 0.4.8.9");
}

/// `authenticate` with a non-empty secret hex-encodes it.
#[tokio::test]
async fn authenticate_hex_encodes_secret() {
    let (controller, mut daemon) = mock_daemon();

    let client = {
        let controller = controller.clone();
        tokio::spawn(async move { controller.authenticate(&[0xDE, 0xAD, 0xBE, 0xEF]).await })
    };
    assert_eq!(read_command_line(&mut daemon).await, "AUTHENTICATE deadbeef");
    send_line(&mut daemon, "250 OK").await;
    client.await.unwrap().unwrap();
}

/// `setevents` rejects an unknown event name before writing anything.
#[tokio::test]
async fn setevents_rejects_unknown_event_without_writing() {
    let (controller, mut daemon) = mock_daemon();

    let client = {
        let controller = controller.clone();
        tokio::spawn(async move { controller.authenticate(b"").await })
    };
    assert_eq!(read_command_line(&mut daemon).await, "AUTHENTICATE ");
    send_line(&mut daemon, "250 OK").await;
    client.await.unwrap().unwrap();

    let err = controller.setevents(&["CIRC", "NOT_A_REAL_EVENT"]).await.unwrap_err();
    assert!(matches!(err, Error::InvalidArgument { .. }));
}

/// `setconf` quotes values containing spaces and leaves bare-key resets
/// unquoted.
#[tokio::test]
async fn setconf_formats_mixed_pairs() {
    let (controller, mut daemon) = mock_daemon();

    let client = {
        let controller = controller.clone();
        tokio::spawn(async move { controller.authenticate(b"").await })
    };
    assert_eq!(read_command_line(&mut daemon).await, "AUTHENTICATE ");
    send_line(&mut daemon, "250 OK").await;
    client.await.unwrap().unwrap();

    let client = {
        let controller = controller.clone();
        tokio::spawn(async move {
            let pairs: Vec<(&str, Option<&str>)> = vec![("Nickname", Some("My Node")), ("BadOption", None)];
            controller.setconf(&pairs).await
        })
    };
    assert_eq!(
        read_command_line(&mut daemon).await,
        "SETCONF Nickname=\"My Node\" BadOption"
    );
    send_line(&mut daemon, "250 OK").await;
    client.await.unwrap().unwrap();
}

/// `closecircuit` only appends `IFUNUSED` when requested.
#[tokio::test]
async fn closecircuit_appends_ifunused_conditionally() {
    let (controller, mut daemon) = mock_daemon();

    let client = {
        let controller = controller.clone();
        tokio::spawn(async move { controller.authenticate(b"").await })
    };
    assert_eq!(read_command_line(&mut daemon).await, "AUTHENTICATE ");
    send_line(&mut daemon, "250 OK").await;
    client.await.unwrap().unwrap();

    let client = {
        let controller = controller.clone();
        tokio::spawn(async move { controller.closecircuit("7", true).await })
    };
    assert_eq!(read_command_line(&mut daemon).await, "CLOSECIRCUIT 7 IFUNUSED");
    send_line(&mut daemon, "250 OK").await;
    client.await.unwrap().unwrap();
}
