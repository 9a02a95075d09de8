//! Values produced by the HTTP opening handshake, and extension negotiation on them.
//!
//! Parsing the upgrade request and response is left to the HTTP layer. It fills a
//! [`ConnectionRequest`] or [`ConnectionResponse`], and the functions here pick the
//! compression extension from their `Sec-WebSocket-Extensions` values.
use std::fmt;

use crate::{
    compression::PerMessageCompress,
    extensions::{parse_extensions, Extension, ExtensionRegistry},
    options::Options,
    Result, WebSocketError,
};

/// What a server learned from the client's upgrade request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionRequest {
    /// Peer address as reported by the transport.
    pub peer: Option<String>,
    pub host: Option<String>,
    pub path: String,
    /// Query parameters, in order.
    pub params: Vec<(String, String)>,
    pub origin: Option<String>,
    /// Requested subprotocols, in order of preference.
    pub protocols: Vec<String>,
    /// Offered extensions, in order of preference.
    pub extensions: Vec<Extension>,
    pub headers: Vec<(String, String)>,
}

impl ConnectionRequest {
    /// Adds the extensions of one `Sec-WebSocket-Extensions` header value.
    pub fn with_extensions_header(mut self, value: &str) -> Result<Self> {
        self.extensions.extend(parse_extensions(value)?);
        Ok(self)
    }

    pub fn with_origin(self, origin: impl Into<String>) -> Self {
        Self {
            origin: Some(origin.into()),
            ..self
        }
    }
}

/// What a client learned from the server's upgrade response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionResponse {
    pub peer: Option<String>,
    /// Selected subprotocol.
    pub protocol: Option<String>,
    /// Accepted extensions.
    pub extensions: Vec<Extension>,
    pub headers: Vec<(String, String)>,
}

impl ConnectionResponse {
    /// Adds the extensions of one `Sec-WebSocket-Extensions` header value.
    pub fn with_extensions_header(mut self, value: &str) -> Result<Self> {
        self.extensions.extend(parse_extensions(value)?);
        Ok(self)
    }
}

/// The completed opening handshake, as seen by either side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Handshake {
    Server(ConnectionRequest),
    Client(ConnectionResponse),
}

impl Handshake {
    pub fn peer(&self) -> Option<&str> {
        match self {
            Self::Server(request) => request.peer.as_deref(),
            Self::Client(response) => response.peer.as_deref(),
        }
    }
}

/// Server side result of negotiation.
#[derive(Default)]
pub struct ServerAcceptance {
    /// Value for the `Sec-WebSocket-Extensions` response header, if any.
    pub extensions_header: Option<String>,
    pub compression: Option<Box<dyn PerMessageCompress>>,
}

impl fmt::Debug for ServerAcceptance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerAcceptance")
            .field("extensions_header", &self.extensions_header)
            .field("compression", &self.compression.is_some())
            .finish()
    }
}

/// Checks the origin and picks an extension from the client's offers.
///
/// An origin outside [`Options::allowed_origins`] fails the handshake. Offers the
/// server cannot satisfy are declined silently.
pub fn negotiate_server(
    request: &ConnectionRequest,
    options: &Options,
    registry: &ExtensionRegistry,
) -> Result<ServerAcceptance> {
    if !options.is_origin_allowed(request.origin.as_deref()) {
        let origin = request.origin.clone().unwrap_or_default();
        log::debug!("rejecting handshake from origin {origin:?}");
        return Err(WebSocketError::OriginNotAllowed(origin));
    }

    let Some(accepted) = registry.accept_offers(&request.extensions, options)? else {
        return Ok(ServerAcceptance::default());
    };

    Ok(ServerAcceptance {
        extensions_header: Some(accepted.response),
        compression: Some(accepted.codec),
    })
}

/// `Sec-WebSocket-Extensions` value a client sends with its upgrade request.
pub fn client_extensions_header(options: &Options, registry: &ExtensionRegistry) -> Option<String> {
    registry.client_offer_header(options)
}

/// Validates what the server accepted and builds the compression codec.
///
/// The client must fail the connection when this returns an error.
pub fn negotiate_client(
    response: &ConnectionResponse,
    options: &Options,
    registry: &ExtensionRegistry,
) -> Result<Option<Box<dyn PerMessageCompress>>> {
    registry.accept_response(&response.extensions, options)
}
