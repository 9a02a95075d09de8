use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use bytes::Bytes;
use wsengine::{
    frame::encode_frame,
    options::DeflateOptions,
    CloseInfo, Connection, ConnectionRequest, ConnectionResponse, ConnectionState, Factory,
    Handler, Handshake, Message, OpCode, Options, PerMessageCompress, PerMessageDeflate, Reactor,
    Role, SendOptions, TimerHandle, TimerKind, TimerToken, Transport, WebSocketEngine,
    WebSocketError,
};

#[derive(Debug, Default)]
struct Wire {
    writes: Vec<Bytes>,
    closed: bool,
    aborted: bool,
}

#[derive(Clone, Default)]
struct FakeTransport(Arc<Mutex<Wire>>);

impl FakeTransport {
    fn writes(&self) -> Vec<Bytes> {
        self.0.lock().unwrap().writes.clone()
    }

    fn take_writes(&self) -> Vec<u8> {
        let mut wire = self.0.lock().unwrap();
        wire.writes.drain(..).flat_map(|b| b.to_vec()).collect()
    }

    fn closed(&self) -> bool {
        self.0.lock().unwrap().closed
    }

    fn aborted(&self) -> bool {
        self.0.lock().unwrap().aborted
    }
}

impl Transport for FakeTransport {
    fn write(&mut self, data: Bytes) {
        self.0.lock().unwrap().writes.push(data);
    }

    fn close(&mut self) {
        self.0.lock().unwrap().closed = true;
    }

    fn abort(&mut self) {
        self.0.lock().unwrap().aborted = true;
    }
}

#[derive(Clone, Default)]
struct FakeReactor(Arc<Mutex<Vec<(Duration, TimerToken)>>>);

struct FakeHandle;

impl TimerHandle for FakeHandle {
    fn cancel(&mut self) {}
}

impl FakeReactor {
    /// The latest token scheduled for `kind`.
    fn token(&self, kind: TimerKind) -> TimerToken {
        self.0
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(_, token)| token.kind == kind)
            .map(|(_, token)| *token)
            .unwrap_or_else(|| panic!("no {kind:?} timer scheduled"))
    }

    fn scheduled(&self, kind: TimerKind) -> usize {
        self.0
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, token)| token.kind == kind)
            .count()
    }
}

impl Reactor for FakeReactor {
    fn call_later(&mut self, delay: Duration, token: TimerToken) -> Box<dyn TimerHandle> {
        self.0.lock().unwrap().push((delay, token));
        Box::new(FakeHandle)
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Event {
    Open,
    Message(Message),
    Ping(Bytes),
    Pong(Bytes),
    Close(CloseInfo),
}

#[derive(Clone, Default)]
struct Recorder(Arc<Mutex<Vec<Event>>>);

impl Recorder {
    fn events(&self) -> Vec<Event> {
        self.0.lock().unwrap().clone()
    }

    fn messages(&self) -> Vec<Message> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                Event::Message(message) => Some(message),
                _ => None,
            })
            .collect()
    }

    fn close_info(&self) -> CloseInfo {
        self.events()
            .into_iter()
            .find_map(|event| match event {
                Event::Close(info) => Some(info),
                _ => None,
            })
            .expect("on_close was not called")
    }
}

impl Handler for Recorder {
    fn on_open(&mut self, _conn: &mut Connection, _handshake: &Handshake) {
        self.0.lock().unwrap().push(Event::Open);
    }

    fn on_message(&mut self, _conn: &mut Connection, message: Message) {
        self.0.lock().unwrap().push(Event::Message(message));
    }

    fn on_ping(&mut self, conn: &mut Connection, payload: Bytes) {
        self.0.lock().unwrap().push(Event::Ping(payload.clone()));
        let _ = conn.send_pong(payload);
    }

    fn on_pong(&mut self, _conn: &mut Connection, payload: Bytes) {
        self.0.lock().unwrap().push(Event::Pong(payload));
    }

    fn on_close(&mut self, _conn: &mut Connection, info: &CloseInfo) {
        self.0.lock().unwrap().push(Event::Close(info.clone()));
    }
}

struct Harness {
    engine: WebSocketEngine<Recorder>,
    transport: FakeTransport,
    reactor: FakeReactor,
    events: Recorder,
}

impl Harness {
    fn new(options: Options) -> Self {
        let transport = FakeTransport::default();
        let reactor = FakeReactor::default();
        let events = Recorder::default();
        let engine = WebSocketEngine::new(
            options,
            Box::new(transport.clone()),
            Box::new(reactor.clone()),
            events.clone(),
        )
        .unwrap();

        Self {
            engine,
            transport,
            reactor,
            events,
        }
    }

    fn open(options: Options) -> Self {
        Self::open_with(options, None)
    }

    fn open_with(options: Options, compression: Option<Box<dyn PerMessageCompress>>) -> Self {
        let mut harness = Self::new(options);
        harness.engine.connection_made();
        let handshake = match harness.engine.connection().role() {
            Role::Server => Handshake::Server(ConnectionRequest::default()),
            Role::Client => Handshake::Client(ConnectionResponse::default()),
        };
        harness.engine.open(&handshake, compression).unwrap();
        harness
    }

    fn conn(&mut self) -> &mut Connection {
        self.engine.connection_mut()
    }

    fn fire(&mut self, kind: TimerKind) {
        let token = self.reactor.token(kind);
        self.engine.timer_fired(token);
    }

    fn lose(&mut self) -> CloseInfo {
        self.engine.connection_lost();
        self.events.close_info()
    }
}

const MASK: [u8; 4] = [0x37, 0xfa, 0x21, 0x3d];

/// A frame as a client sends it.
fn masked(opcode: OpCode, fin: bool, payload: &[u8]) -> Bytes {
    encode_frame(opcode, fin, 0, payload, Some(MASK))
}

#[test]
fn test_unmasked_frame_fails_server() {
    let mut server = Harness::open(Options::server());
    server.engine.data_received(b"\x81\x05Hello");

    assert!(server.events.messages().is_empty());
    assert!(server.transport.aborted());
    assert_eq!(server.engine.connection().state(), ConnectionState::Closed);

    let info = server.lose();
    assert!(!info.was_clean);
    assert!(info.failed_by_me);
    assert_eq!(info.code, Some(1006));
    assert!(info.reason.unwrap().contains("uncleanly"));
}

#[test]
fn test_fragmented_message_delivered_once() {
    let mut client = Harness::open(Options::client());
    client.engine.data_received(b"\x01\x03abc");
    assert!(client.events.messages().is_empty());

    client.engine.data_received(b"\x80\x03def");
    assert_eq!(client.events.messages(), vec![Message::text("abcdef")]);
}

#[test]
fn test_byte_by_byte_delivery() {
    let mut server = Harness::open(Options::server());
    let mut wire = masked(OpCode::Text, false, b"Hel").to_vec();
    wire.extend_from_slice(&masked(OpCode::Ping, true, b"p"));
    wire.extend_from_slice(&masked(OpCode::Continuation, true, b"lo"));

    for byte in wire {
        server.engine.data_received(&[byte]);
    }

    assert_eq!(
        server.events.events(),
        vec![
            Event::Open,
            Event::Ping(Bytes::from_static(b"p")),
            Event::Message(Message::text("Hello")),
        ]
    );
    // the pong is written before the message completes
    assert_eq!(&server.transport.writes()[0][..], b"\x8a\x01p");
}

#[test]
fn test_close_is_echoed_and_server_drops() {
    let mut server = Harness::open(Options::server());
    server
        .engine
        .data_received(&masked(OpCode::Close, true, &[0x03, 0xE8]));

    assert_eq!(server.transport.take_writes(), b"\x88\x02\x03\xe8");
    assert!(server.transport.closed());
    assert!(!server.transport.aborted());

    let info = server.lose();
    assert!(info.was_clean);
    assert_eq!(info.code, Some(1000));
    assert_eq!(info.reason, None);
    assert!(!info.closed_by_me);
    assert!(info.dropped_by_me);
}

#[test]
fn test_echo_close_code_reason() {
    let mut server = Harness::open(Options::server().with_echo_close_code_reason(true));
    server
        .engine
        .data_received(&masked(OpCode::Close, true, b"\x0f\xa0bye"));

    assert_eq!(server.transport.take_writes(), b"\x88\x05\x0f\xa0bye");
    let info = server.lose();
    assert_eq!(info.code, Some(4000));
    assert_eq!(info.reason.as_deref(), Some("bye"));
}

#[test]
fn test_client_waits_for_server_drop() {
    let mut client = Harness::open(Options::client());
    client.engine.data_received(b"\x88\x02\x03\xe8");

    // the echo is masked
    let echo = client.transport.take_writes();
    assert_eq!(echo[..2], [0x88, 0x82]);
    assert!(!client.transport.closed());
    assert_eq!(client.reactor.scheduled(TimerKind::ServerConnectionDrop), 1);

    client.fire(TimerKind::ServerConnectionDrop);
    assert!(client.transport.aborted());

    let info = client.lose();
    assert!(info.was_clean);
    assert_eq!(info.code, Some(1000));
}

#[test]
fn test_local_close_handshake() {
    let mut server = Harness::open(Options::server());
    server.conn().send_close(Some(1000), Some("done")).unwrap();
    assert_eq!(server.engine.connection().state(), ConnectionState::Closing);
    assert_eq!(server.transport.take_writes(), b"\x88\x06\x03\xe8done");

    // already closing
    server.conn().send_close(Some(1000), None).unwrap();
    assert!(server.transport.take_writes().is_empty());
    assert!(matches!(
        server.conn().send_message("late", false),
        Err(WebSocketError::ConnectionClosed)
    ));

    server
        .engine
        .data_received(&masked(OpCode::Close, true, &[0x03, 0xE8]));
    assert!(server.transport.aborted());

    let info = server.lose();
    assert!(info.was_clean);
    assert!(info.closed_by_me);
}

#[test]
fn test_close_handshake_timeout() {
    let mut server = Harness::open(Options::server());
    server.conn().send_close(Some(3001), None).unwrap();
    server.fire(TimerKind::CloseHandshake);

    assert!(server.transport.aborted());
    let info = server.lose();
    assert!(!info.was_clean);
    assert!(info.closed_by_me);
    assert!(info.reason.unwrap().contains("closing handshake timeout"));
}

#[test]
fn test_send_close_after_closed() {
    let mut server = Harness::open(Options::server());
    server.engine.data_received(b"\x81\x05Hello");
    server.lose();

    assert!(matches!(
        server.conn().send_close(Some(1000), None),
        Err(WebSocketError::ConnectionClosed)
    ));
    assert!(matches!(
        server.conn().send_close(None, None),
        Err(WebSocketError::ConnectionClosed)
    ));
}

#[test]
fn test_send_close_validation() {
    let mut server = Harness::open(Options::server());
    assert!(matches!(
        server.conn().send_close(Some(1001), None),
        Err(WebSocketError::InvalidCloseCode(1001))
    ));
    assert!(matches!(
        server.conn().send_close(Some(2999), None),
        Err(WebSocketError::InvalidCloseCode(2999))
    ));
    assert!(matches!(
        server.conn().send_close(None, Some("why")),
        Err(WebSocketError::CloseReasonWithoutCode)
    ));
    assert_eq!(server.engine.connection().state(), ConnectionState::Open);

    let long = "x".repeat(200);
    server.conn().send_close(Some(4999), Some(&long)).unwrap();
    let written = server.transport.take_writes();
    // 2 byte code + 123 byte reason
    assert_eq!(written[1], 125);
}

#[test]
fn test_invalid_close_code_fails_connection() {
    let mut server = Harness::open(Options::server().with_fail_by_drop(false));
    // 1005 must never appear on the wire
    server
        .engine
        .data_received(&masked(OpCode::Close, true, &[0x03, 0xED]));

    let written = server.transport.take_writes();
    assert_eq!(written[0], 0x88);
    assert_eq!(u16::from_be_bytes([written[2], written[3]]), 1002);
    assert_eq!(server.engine.connection().state(), ConnectionState::Closing);
}

#[test]
fn test_message_too_large() {
    let options = Options::server()
        .with_fail_by_drop(false)
        .with_max_frame_payload_size(0)
        .with_max_message_payload_size(4);
    let mut server = Harness::open(options);

    server
        .engine
        .data_received(&masked(OpCode::Binary, true, b"0123456789"));
    assert!(server.events.messages().is_empty());

    let written = server.transport.take_writes();
    assert_eq!(written[0], 0x88);
    assert_eq!(u16::from_be_bytes([written[2], written[3]]), 1009);

    // the peer answers, the handshake completes cleanly
    server
        .engine
        .data_received(&masked(OpCode::Close, true, &[0x03, 0xF1]));
    let info = server.lose();
    assert!(info.was_clean);
    assert!(info.failed_by_me);
    assert_eq!(info.code, Some(1009));
}

#[test]
fn test_frame_too_large() {
    let options = Options::server()
        .with_fail_by_drop(false)
        .with_max_frame_payload_size(4);
    let mut server = Harness::open(options);

    server
        .engine
        .data_received(&masked(OpCode::Binary, true, b"01234"));
    let written = server.transport.take_writes();
    assert_eq!(u16::from_be_bytes([written[2], written[3]]), 1008);
}

#[test]
fn test_invalid_utf8_fails_with_1007() {
    let mut server = Harness::open(Options::server().with_fail_by_drop(false));
    server
        .engine
        .data_received(&masked(OpCode::Text, true, b"\xce\xba\xff"));

    let written = server.transport.take_writes();
    assert_eq!(u16::from_be_bytes([written[2], written[3]]), 1007);
    assert!(server.events.messages().is_empty());
}

#[test]
fn test_failed_message_continuations_skipped() {
    let options = Options::server()
        .with_fail_by_drop(false)
        .with_max_frame_payload_size(0)
        .with_max_message_payload_size(4);
    let mut server = Harness::open(options);

    server
        .engine
        .data_received(&masked(OpCode::Binary, false, b"abc"));
    server
        .engine
        .data_received(&masked(OpCode::Continuation, false, b"def"));
    let written = server.transport.take_writes();
    assert_eq!(u16::from_be_bytes([written[2], written[3]]), 1009);
    assert_eq!(server.engine.connection().state(), ConnectionState::Closing);

    // the rest of the message still frames correctly and is dropped
    server
        .engine
        .data_received(&masked(OpCode::Continuation, true, b"ghi"));
    assert_eq!(server.engine.connection().state(), ConnectionState::Closing);
    assert!(!server.transport.aborted());

    server
        .engine
        .data_received(&masked(OpCode::Close, true, &[0x03, 0xF1]));
    assert!(server.events.messages().is_empty());
    let info = server.lose();
    assert!(info.was_clean);
    assert!(info.failed_by_me);
    assert_eq!(info.code, Some(1009));
}

#[test]
fn test_failed_frame_split_across_reads() {
    let options = Options::server()
        .with_fail_by_drop(false)
        .with_max_frame_payload_size(0)
        .with_max_message_payload_size(4);
    let mut server = Harness::open(options);

    let mut wire = masked(OpCode::Binary, true, b"0123456789").to_vec();
    wire.extend_from_slice(&masked(OpCode::Close, true, &[0x03, 0xE8]));
    let (head, tail) = wire.split_at(8);
    server.engine.data_received(head);
    assert_eq!(server.engine.connection().state(), ConnectionState::Closing);
    server.engine.data_received(tail);

    let info = server.lose();
    assert!(info.was_clean);
    assert_eq!(info.code, Some(1000));
}

#[test]
fn test_nothing_processed_after_failure() {
    let mut server = Harness::open(Options::server().with_fail_by_drop(false));
    let mut wire = masked(OpCode::Continuation, true, b"x").to_vec();
    wire.extend_from_slice(&masked(OpCode::Text, true, b"ignored"));
    server.engine.data_received(&wire);
    server
        .engine
        .data_received(&masked(OpCode::Text, true, b"also ignored"));

    assert!(server.events.messages().is_empty());
}

#[test]
fn test_ping_is_answered() {
    let mut server = Harness::open(Options::server());
    server.engine.data_received(&masked(OpCode::Ping, true, b"hi"));
    assert_eq!(server.transport.take_writes(), b"\x8a\x02hi");
}

#[test]
fn test_fragmented_send() {
    let mut server = Harness::open(Options::server());
    server
        .conn()
        .send_message_with(
            "abcdefg",
            SendOptions {
                fragment_size: Some(3),
                ..Default::default()
            },
        )
        .unwrap();
    assert_eq!(
        server.transport.take_writes(),
        b"\x01\x03abc\x00\x03def\x80\x01g"
    );

    // exact multiple: no empty trailing frame
    server
        .conn()
        .send_message_with(
            b"abcdef",
            SendOptions {
                is_binary: true,
                fragment_size: Some(3),
                ..Default::default()
            },
        )
        .unwrap();
    assert_eq!(server.transport.take_writes(), b"\x02\x03abc\x80\x03def");

    assert!(matches!(
        server.conn().send_message_with(
            "x",
            SendOptions {
                fragment_size: Some(0),
                ..Default::default()
            }
        ),
        Err(WebSocketError::InvalidFragmentSize)
    ));
}

#[test]
fn test_auto_fragment_size() {
    let mut server = Harness::open(Options::server().with_auto_fragment_size(2));
    server.conn().send_message("abc", false).unwrap();
    assert_eq!(server.transport.take_writes(), b"\x01\x02ab\x80\x01c");
}

#[test]
fn test_sync_sends_are_paced() {
    let mut server = Harness::open(Options::server());
    let sync = SendOptions {
        sync: true,
        ..Default::default()
    };
    server.conn().send_message_with("one", sync).unwrap();
    server.conn().send_message_with("two", sync).unwrap();

    assert_eq!(server.transport.writes().len(), 1);
    assert_eq!(server.engine.connection().queued_writes(), 1);

    server.fire(TimerKind::SendQueue);
    let writes = server.transport.writes();
    assert_eq!(writes.len(), 2);
    assert_eq!(&writes[1][..], b"\x81\x03two");

    // the queue is empty now; the next firing ends the pacing loop
    server.fire(TimerKind::SendQueue);
    server.conn().send_message("three", false).unwrap();
    assert_eq!(server.transport.writes().len(), 3);
}

#[test]
fn test_control_payload_limits() {
    let mut server = Harness::open(Options::server());
    assert!(matches!(
        server.conn().send_ping(vec![0u8; 126]),
        Err(WebSocketError::ControlPayloadTooLarge(126))
    ));
    server.conn().send_ping(vec![0u8; 125]).unwrap();
}

#[test]
fn test_send_before_open() {
    let mut server = Harness::new(Options::server());
    server.engine.connection_made();
    assert!(matches!(
        server.conn().send_message("early", false),
        Err(WebSocketError::ConnectionClosed)
    ));
    assert!(matches!(
        server.conn().send_close(Some(1000), None),
        Err(WebSocketError::ConnectionClosed)
    ));
}

#[test]
fn test_open_handshake_timeout() {
    let mut server = Harness::new(Options::server());
    server.engine.connection_made();
    server.fire(TimerKind::OpenHandshake);

    assert!(server.transport.aborted());
    let info = server.lose();
    assert!(!info.was_clean);
    assert!(info.reason.unwrap().contains("opening handshake timeout"));
    assert!(!server.events.events().contains(&Event::Open));
}

#[test]
fn test_stale_timer_is_ignored() {
    let mut server = Harness::open(Options::server());
    // the open handshake timer was cancelled by open()
    server.fire(TimerKind::OpenHandshake);
    assert!(!server.transport.aborted());
    assert!(server.engine.connection().is_open());
}

#[test]
fn test_bytes_before_open_are_processed_on_open() {
    let mut server = Harness::new(Options::server());
    server.engine.connection_made();
    server
        .engine
        .data_received(&masked(OpCode::Text, true, b"early"));
    assert!(server.events.messages().is_empty());

    let handshake = Handshake::Server(ConnectionRequest::default());
    server.engine.open(&handshake, None).unwrap();
    assert_eq!(server.events.messages(), vec![Message::text("early")]);
    assert!(server.engine.connection().stats().preopen_incoming_octets_wire_level > 0);
}

#[test]
fn test_auto_ping_answered() {
    let options =
        Options::server().with_auto_ping(Duration::from_secs(10), Some(Duration::from_secs(2)));
    let mut server = Harness::open(options);
    assert_eq!(server.reactor.scheduled(TimerKind::AutoPing), 1);

    server.fire(TimerKind::AutoPing);
    let ping = server.transport.take_writes();
    assert_eq!(ping[0], 0x89);
    let len = (ping[1] & 0x7f) as usize;
    assert_eq!(len, 4);
    let payload = ping[2..2 + len].to_vec();

    let timeout = server.reactor.token(TimerKind::AutoPingTimeout);
    server
        .engine
        .data_received(&masked(OpCode::Pong, true, &payload));
    assert!(server
        .events
        .events()
        .contains(&Event::Pong(Bytes::from(payload))));

    // the timeout was cancelled, the next ping scheduled
    server.engine.timer_fired(timeout);
    assert!(!server.transport.aborted());
    assert_eq!(server.reactor.scheduled(TimerKind::AutoPing), 2);
}

#[test]
fn test_auto_ping_timeout() {
    let options =
        Options::client().with_auto_ping(Duration::from_secs(10), Some(Duration::from_secs(2)));
    let mut client = Harness::open(options);

    client.fire(TimerKind::AutoPing);
    client.fire(TimerKind::AutoPingTimeout);
    assert!(client.transport.aborted());

    let info = client.lose();
    assert!(!info.was_clean);
    assert_eq!(info.code, Some(1006));
    assert!(info.reason.unwrap().contains("ping timeout"));
}

#[test]
fn test_peer_drop_without_close() {
    let mut client = Harness::open(Options::client());
    let info = client.lose();
    assert!(!info.was_clean);
    assert!(!info.dropped_by_me);
    assert!(info
        .reason
        .unwrap()
        .contains("peer dropped the TCP connection"));

    // on_close fires once
    client.engine.connection_lost();
    let closes = client
        .events
        .events()
        .into_iter()
        .filter(|event| matches!(event, Event::Close(_)))
        .count();
    assert_eq!(closes, 1);
}

#[test]
fn test_client_masks_and_server_unmasks() {
    let mut client = Harness::open(Options::client());
    let mut server = Harness::open(Options::server());

    client.conn().send_message("over the wire", false).unwrap();
    let wire = client.transport.take_writes();
    assert_ne!(wire[1] & 0x80, 0);

    server.engine.data_received(&wire);
    assert_eq!(server.events.messages(), vec![Message::text("over the wire")]);
}

#[test]
fn test_compression_end_to_end() {
    let deflate = DeflateOptions::default();
    let server_factory = Factory::new(
        Options::server().with_compression(deflate.clone()),
        Recorder::default,
    )
    .unwrap();
    let client_factory = Factory::new(
        Options::client().with_compression(deflate),
        Recorder::default,
    )
    .unwrap();

    let offer = client_factory.offer().unwrap();
    let request = ConnectionRequest::default()
        .with_extensions_header(&offer)
        .unwrap();
    let acceptance = server_factory.accept(&request).unwrap();
    let header = acceptance.extensions_header.clone().unwrap();
    let response = ConnectionResponse::default()
        .with_extensions_header(&header)
        .unwrap();
    let client_codec = client_factory.accept_response(&response).unwrap();
    assert!(client_codec.is_some());

    let mut server = Harness::new(server_factory.options().clone());
    server.engine.connection_made();
    server
        .engine
        .open(&Handshake::Server(request), acceptance.compression)
        .unwrap();

    let mut client = Harness::new(client_factory.options().clone());
    client.engine.connection_made();
    client
        .engine
        .open(&Handshake::Client(response), client_codec)
        .unwrap();
    assert_eq!(
        client.engine.connection().extension_in_use(),
        Some("permessage-deflate")
    );

    let text = "compress me ".repeat(50);
    client.conn().send_message(&text, false).unwrap();
    client.conn().send_message(&text, false).unwrap();
    let wire = client.transport.take_writes();
    assert_ne!(wire[0] & 0x40, 0, "RSV1 set on compressed message");
    assert!(wire.len() < text.len());

    server.engine.data_received(&wire);
    assert_eq!(
        server.events.messages(),
        vec![Message::text(text.clone()), Message::text(text.clone())]
    );

    // uncompressed message on a compressed connection
    server
        .conn()
        .send_message_with(
            "plain",
            SendOptions {
                no_compress: true,
                ..Default::default()
            },
        )
        .unwrap();
    let wire = server.transport.take_writes();
    assert_eq!(wire, b"\x81\x05plain");
    client.engine.data_received(&wire);
    assert_eq!(client.events.messages(), vec![Message::text("plain")]);

    let stats = client.engine.connection().stats();
    assert!(stats.outgoing_octets_websocket_level < stats.outgoing_octets_app_level);
}

#[test]
fn test_compressed_frame_without_negotiation() {
    let mut client = Harness::open(Options::client());
    client.engine.data_received(b"\xc1\x01x");
    assert!(client.transport.aborted());
    assert!(client.events.messages().is_empty());
}

#[test]
fn test_drop_connection_flushes_queue() {
    let mut server = Harness::open(Options::server());
    let sync = SendOptions {
        sync: true,
        ..Default::default()
    };
    server.conn().send_message_with("a", sync).unwrap();
    server.conn().send_message_with("b", sync).unwrap();
    server.conn().drop_connection(false);

    assert_eq!(server.transport.take_writes(), b"\x81\x01a\x81\x01b");
    assert!(server.transport.closed());

    let info = server.lose();
    assert!(!info.was_clean);
    assert!(info.dropped_by_me);
}

#[test]
fn test_proxy_state() {
    let mut client = Harness::new(Options::client().with_proxy("proxy.local:3128"));
    client.engine.connection_made();
    assert_eq!(
        client.engine.connection().state(),
        ConnectionState::ProxyConnecting
    );
    client.conn().proxy_connected().unwrap();
    assert_eq!(client.engine.connection().state(), ConnectionState::Connecting);
}

#[test]
fn test_prepared_message() {
    let prepared = wsengine::PreparedMessage::new(b"broadcast", false, false);
    let mut first = Harness::open(Options::server());
    let mut second = Harness::open(Options::server());

    first.conn().send_prepared_message(&prepared).unwrap();
    second.conn().send_prepared_message(&prepared).unwrap();
    assert_eq!(first.transport.take_writes(), b"\x81\x09broadcast");
    assert_eq!(second.transport.take_writes(), b"\x81\x09broadcast");
    assert_eq!(first.engine.connection().stats().outgoing_websocket_messages, 1);
}

#[test]
fn test_raw_frame_chopped() {
    let mut server = Harness::open(Options::server());
    let mut frame = wsengine::RawFrame::new(OpCode::Binary, &b"abcd"[..]);
    frame.chopsize = Some(2);
    server.conn().send_frame(frame).unwrap();

    // header and payload leave in 2 byte writes, one per reactor turn
    assert_eq!(&server.transport.writes()[0][..], b"\x82\x04");
    server.fire(TimerKind::SendQueue);
    server.fire(TimerKind::SendQueue);
    assert_eq!(server.transport.take_writes(), b"\x82\x04abcd");
}

#[cfg(feature = "json")]
#[test]
fn test_send_json() {
    let mut server = Harness::open(Options::server());
    server
        .conn()
        .send_json(&serde_json::json!({ "event": "ping" }))
        .unwrap();

    let wire = server.transport.take_writes();
    let mut client = Harness::open(Options::client());
    client.engine.data_received(&wire);
    let value: serde_json::Value = client.events.messages()[0].json().unwrap();
    assert_eq!(value["event"], "ping");
}

fn deflate(role: Role) -> Box<dyn PerMessageCompress> {
    Box::new(PerMessageDeflate::new(role, Default::default(), 6).unwrap())
}

#[test]
fn test_any_fragmentation_reassembles() {
    let text = "fragments of ünïcödé text ".repeat(4);
    for compressed in [false, true] {
        let mut client = Harness::open_with(Options::client(), compressed.then(|| deflate(Role::Client)));
        let mut server = Harness::open_with(Options::server(), compressed.then(|| deflate(Role::Server)));

        for size in 1..=text.len() {
            let send = SendOptions {
                fragment_size: Some(size),
                ..Default::default()
            };
            client.conn().send_message_with(&text, send).unwrap();
            server.engine.data_received(&client.transport.take_writes());
        }

        let messages = server.events.messages();
        assert_eq!(messages.len(), text.len(), "compressed={compressed}");
        for message in messages {
            assert_eq!(message, Message::text(text.clone()), "compressed={compressed}");
        }
        assert_eq!(server.engine.connection().state(), ConnectionState::Open);
    }
}
