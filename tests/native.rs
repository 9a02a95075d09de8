use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use wsengine::{
    frame::encode_frame, native, CloseInfo, Connection, ConnectionRequest, ConnectionResponse,
    Handler, Handshake, Message, OpCode, Options,
};

#[derive(Default)]
struct Echo {
    messages: Vec<Message>,
    close: Option<CloseInfo>,
}

impl Handler for Echo {
    fn on_message(&mut self, conn: &mut Connection, message: Message) {
        let _ = conn.send_message(message.payload.clone(), message.is_binary);
        self.messages.push(message);
    }

    fn on_close(&mut self, _conn: &mut Connection, info: &CloseInfo) {
        self.close = Some(info.clone());
    }
}

/// Sends a greeting on open and closes once it comes back.
#[derive(Default)]
struct Greeter {
    replies: Vec<Message>,
    close: Option<CloseInfo>,
}

impl Handler for Greeter {
    fn on_open(&mut self, conn: &mut Connection, _handshake: &Handshake) {
        conn.send_message("hello there", false).unwrap();
    }

    fn on_message(&mut self, conn: &mut Connection, message: Message) {
        self.replies.push(message);
        conn.send_close(Some(1000), Some("bye")).unwrap();
    }

    fn on_close(&mut self, _conn: &mut Connection, info: &CloseInfo) {
        self.close = Some(info.clone());
    }
}

fn init_logging() {
    let _ = simple_logger::SimpleLogger::new()
        .with_level(log::LevelFilter::Debug)
        .init();
}

fn server_handshake() -> Handshake {
    Handshake::Server(ConnectionRequest::default())
}

async fn read_exact(stream: &mut DuplexStream, len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await.unwrap();
    buf
}

#[tokio::test]
async fn test_echo_over_duplex() -> anyhow::Result<()> {
    init_logging();
    let (server_io, mut peer) = tokio::io::duplex(4096);
    let server = tokio::spawn(native::serve(
        server_io,
        None,
        Options::server(),
        Echo::default(),
        server_handshake(),
        None,
    ));

    let mask = [1, 2, 3, 4];
    peer.write_all(&encode_frame(OpCode::Text, true, 0, b"hello", Some(mask)))
        .await?;
    assert_eq!(read_exact(&mut peer, 7).await, b"\x81\x05hello");

    peer.write_all(&encode_frame(OpCode::Close, true, 0, &[0x03, 0xE8], Some(mask)))
        .await?;
    assert_eq!(read_exact(&mut peer, 4).await, b"\x88\x02\x03\xe8");

    // the server drops the transport after the closing handshake
    let mut rest = Vec::new();
    peer.read_to_end(&mut rest).await?;
    assert!(rest.is_empty());

    let echo = server.await??;
    assert_eq!(echo.messages, vec![Message::text("hello")]);
    let close = echo.close.unwrap();
    assert!(close.was_clean);
    assert_eq!(close.code, Some(1000));
    Ok(())
}

#[tokio::test]
async fn test_client_and_server_engines() {
    let (server_io, client_io) = tokio::io::duplex(4096);

    let server = tokio::spawn(native::serve(
        server_io,
        None,
        Options::server(),
        Echo::default(),
        server_handshake(),
        None,
    ));
    let client = tokio::spawn(native::serve(
        client_io,
        None,
        Options::client(),
        Greeter::default(),
        Handshake::Client(ConnectionResponse::default()),
        None,
    ));

    let (server, client) = tokio::time::timeout(Duration::from_secs(5), async {
        (server.await.unwrap().unwrap(), client.await.unwrap().unwrap())
    })
    .await
    .expect("connections did not close");

    assert_eq!(client.replies, vec![Message::text("hello there")]);
    assert_eq!(server.messages, vec![Message::text("hello there")]);

    let client_close = client.close.unwrap();
    assert!(client_close.was_clean);
    assert!(client_close.closed_by_me);

    let server_close = server.close.unwrap();
    assert!(server_close.was_clean);
    assert_eq!(server_close.code, Some(1000));
    assert_eq!(server_close.reason.as_deref(), Some("bye"));
}

#[tokio::test]
async fn test_auto_ping_timeout_drops_connection() {
    let (server_io, mut peer) = tokio::io::duplex(4096);
    let options = Options::server().with_auto_ping(
        Duration::from_millis(20),
        Some(Duration::from_millis(50)),
    );
    let server = tokio::spawn(native::serve(
        server_io,
        None,
        options,
        Echo::default(),
        server_handshake(),
        None,
    ));

    // the ping arrives and is never answered
    let ping = read_exact(&mut peer, 6).await;
    assert_eq!(ping[..2], [0x89, 0x04]);

    let echo = tokio::time::timeout(Duration::from_secs(5), server)
        .await
        .expect("server did not drop the connection")
        .unwrap()
        .unwrap();
    let close = echo.close.unwrap();
    assert!(!close.was_clean);
    assert!(close.reason.unwrap().contains("ping timeout"));
}

#[tokio::test]
async fn test_peer_disconnect() {
    let (server_io, peer) = tokio::io::duplex(4096);
    let server = tokio::spawn(native::serve(
        server_io,
        None,
        Options::server(),
        Echo::default(),
        server_handshake(),
        None,
    ));

    drop(peer);

    let echo = server.await.unwrap().unwrap();
    let close = echo.close.unwrap();
    assert!(!close.was_clean);
    assert_eq!(close.code, Some(1006));
}
