//! The application-facing side: handlers, the engine that drives them, and the factory
//! that builds engines for new connections.
use bytes::Bytes;

use crate::{
    close::CloseInfo,
    compression::PerMessageCompress,
    extensions::ExtensionRegistry,
    handshake::{self, ConnectionRequest, ConnectionResponse, Handshake, ServerAcceptance},
    message::Message,
    options::Options,
    protocol::{Connection, Inbound},
    transport::{Reactor, TimerToken, Transport},
    Result,
};

/// Application callbacks.
///
/// Every callback receives the [`Connection`] so it can send, close or drop from within.
/// Callbacks run on the reactor thread and must not block.
pub trait Handler: Send {
    /// The opening handshake completed.
    fn on_open(&mut self, _conn: &mut Connection, _handshake: &Handshake) {}

    /// A complete data message arrived.
    fn on_message(&mut self, _conn: &mut Connection, _message: Message) {}

    /// A ping arrived. Answers with a pong carrying the same payload unless overridden.
    fn on_ping(&mut self, conn: &mut Connection, payload: Bytes) {
        if conn.is_open() {
            if let Err(err) = conn.send_pong(payload) {
                log::debug!("failed to answer ping: {err}");
            }
        }
    }

    fn on_pong(&mut self, _conn: &mut Connection, _payload: Bytes) {}

    /// The transport closed. Called exactly once, after every other callback.
    fn on_close(&mut self, _conn: &mut Connection, _info: &CloseInfo) {}
}

/// Binds a [`Connection`] to its [`Handler`] and turns reactor callbacks into handler calls.
pub struct WebSocketEngine<H> {
    conn: Connection,
    handler: H,
}

impl<H: Handler> WebSocketEngine<H> {
    pub fn new(
        options: Options,
        transport: Box<dyn Transport>,
        reactor: Box<dyn Reactor>,
        handler: H,
    ) -> Result<Self> {
        Ok(Self {
            conn: Connection::new(options, transport, reactor)?,
            handler,
        })
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn connection_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }

    pub fn into_handler(self) -> H {
        self.handler
    }

    /// The transport is connected.
    pub fn connection_made(&mut self) {
        self.conn.connection_made();
    }

    /// The opening handshake completed. Bytes received before this point are processed now.
    pub fn open(
        &mut self,
        handshake: &Handshake,
        compression: Option<Box<dyn PerMessageCompress>>,
    ) -> Result<()> {
        self.conn.open(compression)?;
        self.handler.on_open(&mut self.conn, handshake);
        self.dispatch();
        Ok(())
    }

    /// Bytes arrived from the transport.
    pub fn data_received(&mut self, data: &[u8]) {
        self.conn.feed(data);
        self.dispatch();
    }

    /// A timer scheduled through the [`Reactor`] expired.
    pub fn timer_fired(&mut self, token: TimerToken) {
        self.conn.on_timer(token);
    }

    /// The transport is gone, for whatever reason.
    pub fn connection_lost(&mut self) {
        if let Some(info) = self.conn.connection_lost() {
            self.handler.on_close(&mut self.conn, &info);
        }
    }

    fn dispatch(&mut self) {
        while let Some(event) = self.conn.next_inbound() {
            match event {
                Inbound::Message(message) => self.handler.on_message(&mut self.conn, message),
                Inbound::Ping(payload) => self.handler.on_ping(&mut self.conn, payload),
                Inbound::Pong(payload) => self.handler.on_pong(&mut self.conn, payload),
            }
        }
    }
}

/// Creates a handler for each new connection.
pub trait HandlerFactory: Send + Sync {
    type Handler: Handler;

    fn create_handler(&self) -> Self::Handler;
}

impl<F, H> HandlerFactory for F
where
    F: Fn() -> H + Send + Sync,
    H: Handler,
{
    type Handler = H;

    fn create_handler(&self) -> H {
        self()
    }
}

/// Shared configuration for every connection of a server or client.
///
/// Holds the options, the extension registry and the handler factory, and performs
/// extension negotiation for the opening handshakes.
pub struct Factory<F> {
    options: Options,
    registry: ExtensionRegistry,
    handlers: F,
}

impl<F: HandlerFactory> Factory<F> {
    pub fn new(options: Options, handlers: F) -> Result<Self> {
        options.validate()?;
        Ok(Self {
            options,
            registry: ExtensionRegistry::default(),
            handlers,
        })
    }

    /// Replaces the extension registry.
    pub fn with_registry(self, registry: ExtensionRegistry) -> Self {
        Self { registry, ..self }
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn registry(&self) -> &ExtensionRegistry {
        &self.registry
    }

    /// Builds the engine for a new transport.
    pub fn build_engine(
        &self,
        transport: Box<dyn Transport>,
        reactor: Box<dyn Reactor>,
    ) -> Result<WebSocketEngine<F::Handler>> {
        WebSocketEngine::new(
            self.options.clone(),
            transport,
            reactor,
            self.handlers.create_handler(),
        )
    }

    /// Server side: checks the request and selects the compression extension.
    pub fn accept(&self, request: &ConnectionRequest) -> Result<ServerAcceptance> {
        handshake::negotiate_server(request, &self.options, &self.registry)
    }

    /// Client side: the `Sec-WebSocket-Extensions` value to offer.
    pub fn offer(&self) -> Option<String> {
        handshake::client_extensions_header(&self.options, &self.registry)
    }

    /// Client side: validates the extensions the server accepted.
    pub fn accept_response(
        &self,
        response: &ConnectionResponse,
    ) -> Result<Option<Box<dyn PerMessageCompress>>> {
        handshake::negotiate_client(response, &self.options, &self.registry)
    }
}
