//! The connection state machine.
//!
//! A [`Connection`] owns everything about one WebSocket: the inbound buffer and frame
//! decoder, the message assembler, the compression codec, the send queue and the timers.
//! It never blocks and never calls the application; inbound events are pulled with
//! [`Connection::next_inbound`] by the [`WebSocketEngine`](crate::WebSocketEngine), which
//! dispatches them to the handler.
use bytes::{Bytes, BytesMut};

use crate::{
    close::{encode_close_payload, truncate_reason, CloseCode, CloseInfo, ClosePayload},
    codec::{FrameDecoder, FrameEvent, HeaderPolicy},
    compression::PerMessageCompress,
    frame::{data_opcode, encode_frame, random_mask, FrameHeader, OpCode, PreparedMessage, MAX_CONTROL_PAYLOAD, RSV1},
    message::{Message, MessageAssembler},
    options::{Options, Role},
    scheduler::{Enqueued, SendScheduler, QUEUED_WRITE_DELAY},
    stats::TrafficStats,
    transport::{Reactor, TimerKind, TimerToken, Timers, Transport},
    Result, WebSocketError,
};

const REASON_PEER_DROPPED: &str =
    "peer dropped the TCP connection without previous WebSocket closing handshake";
const REASON_OPEN_TIMEOUT: &str =
    "WebSocket opening handshake timeout (peer did not finish the opening handshake in time)";
const REASON_CLOSE_TIMEOUT: &str =
    "WebSocket closing handshake timeout (peer did not finish the closing handshake in time)";
const REASON_SERVER_DROP_TIMEOUT: &str =
    "WebSocket closing handshake timeout (server did not drop TCP connection in time)";
const REASON_PING_TIMEOUT: &str =
    "WebSocket ping timeout (peer did not respond with pong in time)";
const REASON_DROPPED_LOCALLY: &str = "connection was dropped locally";

/// Lifecycle of a connection. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    ProxyConnecting,
    Open,
    Closing,
    Closed,
}

/// An inbound event for the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Message(Message),
    Ping(Bytes),
    Pong(Bytes),
}

/// Per-message send settings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SendOptions {
    pub is_binary: bool,
    /// Split into frames of at most this size. Overrides [`Options::auto_fragment_size`].
    pub fragment_size: Option<usize>,
    /// Pace every frame of the message as a separate transport write.
    pub sync: bool,
    /// Send uncompressed even when compression is active.
    pub no_compress: bool,
}

/// A frame sent as is, for testing peers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    pub opcode: OpCode,
    pub payload: Bytes,
    pub fin: bool,
    pub rsv: u8,
    /// Masking key; one is generated when `None` and the role masks.
    pub mask: Option<[u8; 4]>,
    /// Split the encoded frame into transport writes of this size.
    pub chopsize: Option<usize>,
    pub sync: bool,
}

impl RawFrame {
    pub fn new(opcode: OpCode, payload: impl Into<Bytes>) -> Self {
        Self {
            opcode,
            payload: payload.into(),
            fin: true,
            rsv: 0,
            mask: None,
            chopsize: None,
            sync: false,
        }
    }
}

/// One WebSocket connection.
pub struct Connection {
    options: Options,
    state: ConnectionState,
    transport: Box<dyn Transport>,
    reactor: Box<dyn Reactor>,
    timers: Timers,
    scheduler: SendScheduler,
    decoder: FrameDecoder,
    assembler: MessageAssembler,
    compression: Option<Box<dyn PerMessageCompress>>,
    inbound: BytesMut,
    control: BytesMut,
    in_control_frame: bool,
    frame_open: bool,
    last_data_fin: bool,
    discarding: bool,
    failed: bool,
    halted: bool,
    stats: TrafficStats,
    peer: Option<String>,

    was_clean: bool,
    was_not_clean_reason: Option<String>,
    closed_by_me: bool,
    failed_by_me: bool,
    dropped_by_me: bool,
    local_close_code: Option<u16>,
    local_close_reason: Option<String>,
    remote_close_code: Option<u16>,
    remote_close_reason: Option<String>,
    close_info: Option<CloseInfo>,
    auto_ping_pending: Option<Bytes>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("role", &self.options.role)
            .field("state", &self.state)
            .field("peer", &self.peer)
            .field("timers", &self.timers)
            .field("queued", &self.scheduler.len())
            .finish_non_exhaustive()
    }
}

impl Connection {
    pub fn new(options: Options, transport: Box<dyn Transport>, reactor: Box<dyn Reactor>) -> Result<Self> {
        options.validate()?;

        let assembler = MessageAssembler::new(
            options.utf8_validate_incoming,
            options.max_frame_payload_size,
            options.max_message_payload_size,
        );

        Ok(Self {
            options,
            state: ConnectionState::Connecting,
            transport,
            reactor,
            timers: Timers::default(),
            scheduler: SendScheduler::new(),
            decoder: FrameDecoder::new(),
            assembler,
            compression: None,
            inbound: BytesMut::with_capacity(4096),
            control: BytesMut::new(),
            in_control_frame: false,
            frame_open: false,
            last_data_fin: true,
            discarding: false,
            failed: false,
            halted: false,
            stats: TrafficStats::default(),
            peer: None,
            was_clean: false,
            was_not_clean_reason: None,
            closed_by_me: false,
            failed_by_me: false,
            dropped_by_me: false,
            local_close_code: None,
            local_close_reason: None,
            remote_close_code: None,
            remote_close_reason: None,
            close_info: None,
            auto_ping_pending: None,
        })
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == ConnectionState::Open
    }

    pub fn role(&self) -> Role {
        self.options.role
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn peer(&self) -> Option<&str> {
        self.peer.as_deref()
    }

    pub fn stats(&self) -> &TrafficStats {
        &self.stats
    }

    pub fn reset_stats(&mut self) {
        self.stats.reset();
    }

    /// Name of the negotiated compression extension.
    pub fn extension_in_use(&self) -> Option<&'static str> {
        self.compression.as_ref().map(|codec| codec.extension_name())
    }

    /// How the connection ended, once the transport is gone.
    pub fn close_info(&self) -> Option<&CloseInfo> {
        self.close_info.as_ref()
    }

    /// Code and reason of the close frame received from the peer.
    pub fn remote_close(&self) -> (Option<u16>, Option<&str>) {
        (self.remote_close_code, self.remote_close_reason.as_deref())
    }

    /// Code and reason of the close frame we sent.
    pub fn local_close(&self) -> (Option<u16>, Option<&str>) {
        (self.local_close_code, self.local_close_reason.as_deref())
    }

    /// Number of writes waiting in the send queue.
    pub fn queued_writes(&self) -> usize {
        self.scheduler.len()
    }

    /// The transport is up and the opening handshake starts.
    pub fn connection_made(&mut self) {
        self.state = if self.options.role == Role::Client && self.options.proxy.is_some() {
            ConnectionState::ProxyConnecting
        } else {
            ConnectionState::Connecting
        };
        self.peer = self.transport.remote_address();
        self.transport.set_no_delay(self.options.tcp_no_delay);

        if let Some(timeout) = self.options.open_handshake_timeout {
            self.timers
                .arm(self.reactor.as_mut(), TimerKind::OpenHandshake, timeout);
        }

        log::debug!(
            "{} connection made (peer={:?}, state={:?})",
            self.options.role,
            self.peer,
            self.state
        );
    }

    /// The proxy tunnel is established; the opening handshake follows.
    pub fn proxy_connected(&mut self) -> Result<()> {
        if self.state != ConnectionState::ProxyConnecting {
            return Err(WebSocketError::ConnectionClosed);
        }
        self.state = ConnectionState::Connecting;
        Ok(())
    }

    /// Writes opening handshake bytes produced by the HTTP layer.
    pub fn write_handshake(&mut self, data: Bytes) -> Result<()> {
        match self.state {
            ConnectionState::Connecting | ConnectionState::ProxyConnecting => {
                self.write_wire(data);
                Ok(())
            }
            _ => Err(WebSocketError::ConnectionClosed),
        }
    }

    /// The opening handshake completed: the connection is open.
    pub fn open(&mut self, compression: Option<Box<dyn PerMessageCompress>>) -> Result<()> {
        if !matches!(
            self.state,
            ConnectionState::Connecting | ConnectionState::ProxyConnecting
        ) {
            return Err(WebSocketError::ConnectionClosed);
        }

        self.timers.cancel(TimerKind::OpenHandshake);
        self.compression = compression.map(|mut codec| {
            codec.set_max_message_size(self.options.max_message_payload_size);
            codec
        });
        self.state = ConnectionState::Open;

        if let Some(interval) = self.options.auto_ping_interval {
            self.timers
                .arm(self.reactor.as_mut(), TimerKind::AutoPing, interval);
        }

        log::debug!(
            "{} connection open (peer={:?}, extension={:?})",
            self.options.role,
            self.peer,
            self.extension_in_use()
        );
        Ok(())
    }

    /// Buffers bytes received from the transport.
    pub fn feed(&mut self, data: &[u8]) {
        if self.state == ConnectionState::Open || self.state == ConnectionState::Closing {
            self.stats.incoming_octets_wire_level += data.len() as u64;
        } else {
            self.stats.preopen_incoming_octets_wire_level += data.len() as u64;
        }
        if self.options.log_octets {
            log::trace!("{} RX octets: {:02x?}", self.options.role, data);
        }

        if !self.halted && self.state != ConnectionState::Closed {
            self.inbound.extend_from_slice(data);
        }
    }

    /// Processes buffered bytes until the next event for the application.
    ///
    /// Returns `None` when more bytes are needed, or when inbound processing stopped
    /// because the connection is closed or the peer's close frame was received. After a
    /// failure only a close frame from the peer is still acted upon.
    pub fn next_inbound(&mut self) -> Option<Inbound> {
        loop {
            if self.halted
                || !matches!(
                    self.state,
                    ConnectionState::Open | ConnectionState::Closing
                )
            {
                return None;
            }

            let policy = self.header_policy();
            let event = match self.decoder.decode(&mut self.inbound, &policy) {
                Ok(Some(event)) => event,
                Ok(None) => return None,
                Err(err) => {
                    // frame boundaries are lost
                    self.decoder.reset();
                    self.inbound.clear();
                    self.frame_open = false;
                    self.in_control_frame = false;
                    self.fail_connection(err);
                    return None;
                }
            };

            match self.on_frame_event(event) {
                Ok(Some(inbound)) => return Some(inbound),
                Ok(None) => {}
                Err(err) => {
                    self.fail_connection(err);
                    return None;
                }
            }
        }
    }

    fn header_policy(&self) -> HeaderPolicy {
        let (require_mask, reject_mask) = match self.options.role {
            Role::Server => (self.options.require_masked_client_frames, false),
            Role::Client => (false, !self.options.accept_masked_server_frames),
        };

        HeaderPolicy {
            require_mask,
            reject_mask,
            compression: self.compression.is_some(),
            // a failed message still has continuation frames to skip
            inside_message: self.assembler.inside_message() || (self.failed && !self.last_data_fin),
        }
    }

    fn on_frame_event(&mut self, event: FrameEvent) -> Result<Option<Inbound>> {
        match event {
            FrameEvent::Begin(header) => {
                self.stats.incoming_websocket_frames += 1;
                self.stats.incoming_octets_websocket_level += header.payload_len;
                if self.options.log_frames {
                    log_frame(self.options.role, "RX", &header);
                }

                self.frame_open = true;
                self.in_control_frame = header.opcode.is_control();
                if !self.in_control_frame {
                    self.last_data_fin = header.fin;
                }
                // once failed, only a close frame is still of interest
                self.discarding = self.failed && header.opcode != OpCode::Close;
                if self.in_control_frame {
                    self.control.clear();
                } else if !self.discarding {
                    self.assembler.begin_frame(&header, &mut self.compression)?;
                }
                Ok(None)
            }
            FrameEvent::Data(chunk) => {
                if self.discarding {
                    return Ok(None);
                }
                if self.in_control_frame {
                    self.control.unsplit(chunk);
                } else {
                    self.assembler.frame_data(&chunk, &mut self.compression)?;
                }
                Ok(None)
            }
            FrameEvent::End(header) => {
                self.frame_open = false;
                if std::mem::take(&mut self.discarding) {
                    self.in_control_frame = false;
                    return Ok(None);
                }
                if self.in_control_frame {
                    self.in_control_frame = false;
                    let payload = self.control.split().freeze();
                    return self.on_control_frame(header.opcode, payload);
                }

                let message = self.assembler.end_frame(header.fin, &mut self.compression)?;
                Ok(message.map(|message| {
                    self.stats.incoming_websocket_messages += 1;
                    self.stats.incoming_octets_app_level += message.payload.len() as u64;
                    Inbound::Message(message)
                }))
            }
        }
    }

    fn on_control_frame(&mut self, opcode: OpCode, payload: Bytes) -> Result<Option<Inbound>> {
        match opcode {
            OpCode::Close => {
                self.on_close_frame(&payload)?;
                Ok(None)
            }
            OpCode::Ping => Ok(Some(Inbound::Ping(payload))),
            OpCode::Pong => {
                if self.auto_ping_pending.as_ref() == Some(&payload) {
                    log::trace!("{} auto ping answered", self.options.role);
                    self.auto_ping_pending = None;
                    self.timers.cancel(TimerKind::AutoPingTimeout);
                    if let Some(interval) = self.options.auto_ping_interval {
                        self.timers
                            .arm(self.reactor.as_mut(), TimerKind::AutoPing, interval);
                    }
                }
                Ok(Some(Inbound::Pong(payload)))
            }
            _ => Err(WebSocketError::InvalidOpCode(u8::from(opcode))),
        }
    }

    fn on_close_frame(&mut self, payload: &[u8]) -> Result<()> {
        let close = ClosePayload::parse(payload)?;
        log::debug!(
            "{} received close frame (code={:?}, reason={:?})",
            self.options.role,
            close.code,
            close.reason
        );

        self.remote_close_code = close.code;
        self.remote_close_reason = close.reason;
        // nothing the peer sends after its close frame is processed
        self.halted = true;

        match self.state {
            ConnectionState::Closing => {
                // the peer answered our close
                self.was_clean = true;
                self.timers.cancel(TimerKind::CloseHandshake);
                match self.options.role {
                    Role::Server => self.drop_transport(true),
                    Role::Client => self.arm_server_drop_timer(),
                }
            }
            ConnectionState::Open => {
                self.was_clean = true;
                if self.options.echo_close_code_reason {
                    let code = self.remote_close_code;
                    let reason = self.remote_close_reason.clone();
                    self.send_close_frame(code, reason.as_deref(), true)?;
                } else {
                    self.send_close_frame(Some(CloseCode::Normal.into()), None, true)?;
                }

                match self.options.role {
                    Role::Server => self.drop_transport(false),
                    Role::Client => self.arm_server_drop_timer(),
                }
            }
            _ => {}
        }

        Ok(())
    }

    fn arm_server_drop_timer(&mut self) {
        if let Some(timeout) = self.options.server_connection_drop_timeout {
            self.timers
                .arm(self.reactor.as_mut(), TimerKind::ServerConnectionDrop, timeout);
        }
    }

    /// Fails the connection because of a peer violation.
    ///
    /// With fail-by-drop the transport is dropped right away. Otherwise a close frame
    /// carrying the error's close code is sent, unless we are already closing, in which
    /// case the transport is dropped. Afterwards only a close frame from the peer is
    /// acted upon.
    fn fail_connection(&mut self, err: WebSocketError) {
        let code = err.close_code();
        let reason = err.to_string();
        log::debug!(
            "{} failing connection with {code}: {reason}",
            self.options.role
        );

        self.failed_by_me = true;
        self.failed = true;
        self.assembler.reset();
        // skip what is left of the offending frame
        self.discarding = self.frame_open;

        if self.options.fail_by_drop {
            self.was_not_clean_reason = Some(reason);
            self.drop_transport(true);
        } else if self.state == ConnectionState::Open {
            // the closing handshake may still complete; the timer bounds it
            if let Err(err) = self.send_close_frame(Some(code.into()), Some(&reason), false) {
                log::debug!("failed to send close frame: {err}");
                self.drop_transport(true);
            }
        } else {
            self.was_not_clean_reason = Some(reason);
            self.drop_transport(true);
        }
    }

    /// Drops the transport. `abort` discards pending writes, otherwise the send queue
    /// is flushed first.
    pub fn drop_connection(&mut self, abort: bool) {
        if self.state != ConnectionState::Closed && !self.was_clean && self.was_not_clean_reason.is_none() {
            self.was_not_clean_reason = Some(REASON_DROPPED_LOCALLY.to_string());
        }
        self.drop_transport(abort);
    }

    fn drop_transport(&mut self, abort: bool) {
        if self.state == ConnectionState::Closed {
            return;
        }

        log::debug!(
            "{} dropping connection (abort={abort}, peer={:?})",
            self.options.role,
            self.peer
        );
        self.dropped_by_me = true;
        self.state = ConnectionState::Closed;
        self.timers.cancel(TimerKind::SendQueue);

        let pending = self.scheduler.drain();
        if abort {
            self.transport.abort();
        } else {
            for entry in pending {
                self.write_wire(entry.bytes);
            }
            self.transport.close();
        }
    }

    /// Handles an expired timer. Stale and cancelled timers are ignored.
    pub fn on_timer(&mut self, token: TimerToken) {
        if !self.timers.fire(token) {
            return;
        }

        match token.kind {
            TimerKind::OpenHandshake => {
                if matches!(
                    self.state,
                    ConnectionState::Connecting | ConnectionState::ProxyConnecting
                ) {
                    log::warn!("{} {REASON_OPEN_TIMEOUT}", self.options.role);
                    self.drop_unclean(REASON_OPEN_TIMEOUT);
                }
            }
            TimerKind::CloseHandshake => {
                if self.state == ConnectionState::Closing {
                    log::warn!("{} {REASON_CLOSE_TIMEOUT}", self.options.role);
                    self.drop_unclean(REASON_CLOSE_TIMEOUT);
                }
            }
            TimerKind::ServerConnectionDrop => {
                if self.state != ConnectionState::Closed {
                    log::warn!("{} {REASON_SERVER_DROP_TIMEOUT}", self.options.role);
                    self.drop_transport(true);
                }
            }
            TimerKind::AutoPing => self.send_auto_ping(),
            TimerKind::AutoPingTimeout => {
                log::warn!("{} {REASON_PING_TIMEOUT}", self.options.role);
                self.drop_unclean(REASON_PING_TIMEOUT);
            }
            TimerKind::SendQueue => self.pump_send_queue(),
        }
    }

    fn drop_unclean(&mut self, reason: &str) {
        self.was_clean = false;
        self.was_not_clean_reason = Some(reason.to_string());
        self.drop_transport(true);
    }

    fn send_auto_ping(&mut self) {
        if self.state != ConnectionState::Open {
            return;
        }

        let payload: Vec<u8> = (0..self.options.auto_ping_size)
            .map(|_| rand::random::<u8>())
            .collect();
        let payload = Bytes::from(payload);

        if let Err(err) = self.send_control(OpCode::Ping, &payload) {
            log::debug!("failed to send auto ping: {err}");
            return;
        }
        self.auto_ping_pending = Some(payload);

        if let Some(timeout) = self.options.auto_ping_timeout {
            self.timers
                .arm(self.reactor.as_mut(), TimerKind::AutoPingTimeout, timeout);
        }
    }

    /// The transport is gone. Returns how the connection ended, the first time only.
    pub fn connection_lost(&mut self) -> Option<CloseInfo> {
        if self.close_info.is_some() {
            return None;
        }

        self.timers.cancel_all();
        self.scheduler.drain();
        self.state = ConnectionState::Closed;
        self.halted = true;

        let info = if self.was_clean {
            CloseInfo {
                was_clean: true,
                code: self.remote_close_code,
                reason: self.remote_close_reason.clone(),
                closed_by_me: self.closed_by_me,
                failed_by_me: self.failed_by_me,
                dropped_by_me: self.dropped_by_me,
            }
        } else {
            let reason = self
                .was_not_clean_reason
                .as_deref()
                .unwrap_or(REASON_PEER_DROPPED);
            CloseInfo {
                was_clean: false,
                code: Some(CloseCode::Abnormal.into()),
                reason: Some(format!("connection was closed uncleanly ({reason})")),
                closed_by_me: self.closed_by_me,
                failed_by_me: self.failed_by_me,
                dropped_by_me: self.dropped_by_me,
            }
        };

        log::debug!("{} connection lost: {info:?}", self.options.role);
        self.close_info = Some(info.clone());
        Some(info)
    }

    /// Starts the closing handshake.
    ///
    /// `code` must be 1000 or within 3000-4999, and a reason requires a code. The
    /// reason is truncated to 123 bytes. Does nothing when already closing, and fails
    /// with [`WebSocketError::ConnectionClosed`] once closed.
    pub fn send_close(&mut self, code: Option<u16>, reason: Option<&str>) -> Result<()> {
        if let Some(code) = code {
            if !CloseCode::from(code).is_sendable() {
                return Err(WebSocketError::InvalidCloseCode(code));
            }
        } else if reason.is_some() {
            return Err(WebSocketError::CloseReasonWithoutCode);
        }

        match self.state {
            ConnectionState::Open => self.send_close_frame(code, reason, false),
            ConnectionState::Closing => Ok(()),
            ConnectionState::Closed
            | ConnectionState::Connecting
            | ConnectionState::ProxyConnecting => Err(WebSocketError::ConnectionClosed),
        }
    }

    fn send_close_frame(&mut self, code: Option<u16>, reason: Option<&str>, is_reply: bool) -> Result<()> {
        let reason = reason.map(truncate_reason);
        let payload = encode_close_payload(code, reason);
        self.send_control(OpCode::Close, &payload)?;

        self.local_close_code = code;
        self.local_close_reason = reason.map(str::to_owned);
        self.closed_by_me = !is_reply;
        self.state = ConnectionState::Closing;

        if !is_reply {
            if let Some(timeout) = self.options.close_handshake_timeout {
                self.timers
                    .arm(self.reactor.as_mut(), TimerKind::CloseHandshake, timeout);
            }
        }
        Ok(())
    }

    /// Sends a message as a single frame, or fragmented by [`Options::auto_fragment_size`].
    pub fn send_message(&mut self, payload: impl AsRef<[u8]>, is_binary: bool) -> Result<()> {
        self.send_message_with(
            payload,
            SendOptions {
                is_binary,
                ..Default::default()
            },
        )
    }

    /// Sends a message with explicit fragmentation, pacing and compression settings.
    pub fn send_message_with(&mut self, payload: impl AsRef<[u8]>, send: SendOptions) -> Result<()> {
        if self.state != ConnectionState::Open {
            return Err(WebSocketError::ConnectionClosed);
        }

        let payload = payload.as_ref();
        let fragment_size = match send.fragment_size {
            Some(0) => return Err(WebSocketError::InvalidFragmentSize),
            Some(size) => Some(size),
            None if self.options.auto_fragment_size > 0 => Some(self.options.auto_fragment_size),
            None => None,
        };

        self.stats.outgoing_websocket_messages += 1;
        self.stats.outgoing_octets_app_level += payload.len() as u64;

        let (payload, rsv) = match &mut self.compression {
            Some(codec) if !send.no_compress => {
                codec.start_compress_message();
                let mut compressed = BytesMut::from(&codec.compress_message_data(payload)?[..]);
                compressed.extend_from_slice(&codec.end_compress_message()?);
                (compressed.freeze(), RSV1)
            }
            _ => (Bytes::copy_from_slice(payload), 0),
        };

        let opcode = data_opcode(send.is_binary);
        let size = fragment_size.unwrap_or(usize::MAX).max(1);

        let mut offset: usize = 0;
        let mut first = true;
        loop {
            let end = offset.saturating_add(size);
            let done = end >= payload.len();
            let chunk = &payload[offset..end.min(payload.len())];

            let (frame_opcode, frame_rsv) = if first {
                (opcode, rsv)
            } else {
                (OpCode::Continuation, 0)
            };
            self.send_frame_internal(frame_opcode, done, frame_rsv, chunk, None, send.sync, None)?;

            first = false;
            offset = end;
            if done {
                break;
            }
        }

        Ok(())
    }

    /// Sends a UTF-8 text message.
    pub fn send_text(&mut self, text: &str) -> Result<()> {
        self.send_message(text, false)
    }

    /// Serializes `value` as JSON and sends it as a text message.
    #[cfg(feature = "json")]
    #[cfg_attr(docsrs, doc(cfg(feature = "json")))]
    pub fn send_json<T: serde::Serialize>(&mut self, value: &T) -> Result<()> {
        let payload = serde_json::to_vec(value)?;
        self.send_message(payload, false)
    }

    /// Sends a message encoded ahead of time.
    pub fn send_prepared_message(&mut self, prepared: &PreparedMessage) -> Result<()> {
        if self.state != ConnectionState::Open {
            return Err(WebSocketError::ConnectionClosed);
        }

        let frame = match (&self.compression, &prepared.deflated) {
            (Some(codec), Some(deflated)) if codec.accepts_prepared() => deflated.clone(),
            _ => prepared.plain.clone(),
        };

        self.stats.outgoing_websocket_messages += 1;
        self.stats.outgoing_websocket_frames += 1;
        self.stats.outgoing_octets_app_level += prepared.payload_len as u64;
        self.send_data(frame, false, None)
    }

    pub fn send_ping(&mut self, payload: impl AsRef<[u8]>) -> Result<()> {
        self.send_control_checked(OpCode::Ping, payload.as_ref())
    }

    pub fn send_pong(&mut self, payload: impl AsRef<[u8]>) -> Result<()> {
        self.send_control_checked(OpCode::Pong, payload.as_ref())
    }

    fn send_control_checked(&mut self, opcode: OpCode, payload: &[u8]) -> Result<()> {
        if self.state != ConnectionState::Open {
            return Err(WebSocketError::ConnectionClosed);
        }
        self.send_control(opcode, payload)
    }

    fn send_control(&mut self, opcode: OpCode, payload: &[u8]) -> Result<()> {
        if payload.len() > MAX_CONTROL_PAYLOAD {
            return Err(WebSocketError::ControlPayloadTooLarge(payload.len()));
        }
        self.send_frame_internal(opcode, true, 0, payload, None, false, None)
    }

    /// Sends a frame without any of the checks applied to messages.
    pub fn send_frame(&mut self, frame: RawFrame) -> Result<()> {
        if self.state == ConnectionState::Closed {
            return Err(WebSocketError::ConnectionClosed);
        }
        self.send_frame_internal(
            frame.opcode,
            frame.fin,
            frame.rsv,
            &frame.payload,
            frame.mask,
            frame.sync,
            frame.chopsize,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn send_frame_internal(
        &mut self,
        opcode: OpCode,
        fin: bool,
        rsv: u8,
        payload: &[u8],
        mask: Option<[u8; 4]>,
        sync: bool,
        chopsize: Option<usize>,
    ) -> Result<()> {
        let mask = mask.or_else(|| self.options.mask_outgoing().then(random_mask));
        let bytes = encode_frame(opcode, fin, rsv, payload, mask);

        self.stats.outgoing_websocket_frames += 1;
        self.stats.outgoing_octets_websocket_level += payload.len() as u64;
        if self.options.log_frames {
            let header = FrameHeader {
                opcode,
                fin,
                rsv,
                payload_len: payload.len() as u64,
                mask,
            };
            log_frame(self.options.role, "TX", &header);
        }

        self.send_data(bytes, sync, chopsize)
    }

    fn send_data(&mut self, bytes: Bytes, sync: bool, chopsize: Option<usize>) -> Result<()> {
        match self.scheduler.enqueue(bytes, sync, chopsize)? {
            Enqueued::WriteNow(bytes) => self.write_wire(bytes),
            Enqueued::Queued => {
                if self.scheduler.trigger() {
                    self.pump_send_queue();
                }
            }
        }
        Ok(())
    }

    /// Writes one queued entry and schedules the next.
    fn pump_send_queue(&mut self) {
        let Some(entry) = self.scheduler.pop() else {
            return;
        };

        if self.state != ConnectionState::Closed {
            self.write_wire(entry.bytes);
        }
        self.timers
            .arm(self.reactor.as_mut(), TimerKind::SendQueue, QUEUED_WRITE_DELAY);
    }

    fn write_wire(&mut self, bytes: Bytes) {
        if matches!(
            self.state,
            ConnectionState::Connecting | ConnectionState::ProxyConnecting
        ) {
            self.stats.preopen_outgoing_octets_wire_level += bytes.len() as u64;
        } else {
            self.stats.outgoing_octets_wire_level += bytes.len() as u64;
        }
        if self.options.log_octets {
            log::trace!("{} TX octets: {:02x?}", self.options.role, &bytes[..]);
        }
        self.transport.write(bytes);
    }
}

fn log_frame(role: Role, direction: &str, header: &FrameHeader) {
    log::trace!(
        "{role} {direction} frame: opcode={:?} fin={} rsv={} len={} masked={}",
        header.opcode,
        header.fin,
        header.rsv,
        header.payload_len,
        header.mask.is_some()
    );
}
