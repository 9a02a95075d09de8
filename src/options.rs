//! Connection configuration.
use std::{fmt, sync::Arc, time::Duration};

use crate::{
    extensions::{
        PerMessageDeflateOffer, PerMessageDeflateOfferAccept, PerMessageDeflateResponse,
        PerMessageDeflateResponseAccept,
    },
    Result, WebSocketError,
};

/// Default maximum payload of a single incoming frame: 1 MiB.
pub const MAX_FRAME_PAYLOAD: usize = 1024 * 1024;

/// Default maximum payload of an incoming message: 2 MiB.
pub const MAX_MESSAGE_PAYLOAD: usize = 2 * 1024 * 1024;

/// The role the connection is taking.
///
/// Clients mask every frame they send, servers do not.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Role {
    Server,
    Client,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Server => write!(f, "server"),
            Self::Client => write!(f, "client"),
        }
    }
}

/// Server side hook choosing which permessage-deflate offer to accept.
pub type AcceptOfferFn =
    Arc<dyn Fn(&[PerMessageDeflateOffer]) -> Option<PerMessageDeflateOfferAccept> + Send + Sync>;

/// Client side hook accepting or refusing the server's permessage-deflate response.
pub type AcceptResponseFn = Arc<
    dyn Fn(&PerMessageDeflateResponse) -> Option<PerMessageDeflateResponseAccept> + Send + Sync,
>;

/// Configuration of permessage-deflate (RFC 7692).
///
/// The flags and window sizes describe what this endpoint prefers. A client turns them
/// into its offer, a server merges them with the offer it receives. The hooks replace that
/// default behavior entirely.
#[derive(Clone)]
pub struct DeflateOptions {
    /// Compression level, 0 (store) to 9 (best). Default 6.
    pub level: u32,

    /// The server drops its compression context after every message.
    pub server_no_context_takeover: bool,

    /// The client drops its compression context after every message.
    pub client_no_context_takeover: bool,

    /// Window the server compresses with, 8 to 15. Values below 15 need the `zlib` feature.
    pub server_max_window_bits: Option<u8>,

    /// Window the client compresses with, 8 to 15. Values below 15 need the `zlib` feature.
    pub client_max_window_bits: Option<u8>,

    /// zlib memory level, 1 to 9. Validated and recorded; the deflate backend picks its own.
    pub mem_level: Option<u8>,

    /// Client side: explicit offers, most preferred first. Empty means one offer built
    /// from the fields above.
    pub offers: Vec<PerMessageDeflateOffer>,

    /// Server side: replaces the default offer selection.
    pub accept_offer: Option<AcceptOfferFn>,

    /// Client side: replaces the default response acceptance.
    pub accept_response: Option<AcceptResponseFn>,
}

impl Default for DeflateOptions {
    fn default() -> Self {
        Self {
            level: 6,
            server_no_context_takeover: false,
            client_no_context_takeover: false,
            server_max_window_bits: None,
            client_max_window_bits: None,
            mem_level: None,
            offers: Vec::new(),
            accept_offer: None,
            accept_response: None,
        }
    }
}

impl fmt::Debug for DeflateOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeflateOptions")
            .field("level", &self.level)
            .field("server_no_context_takeover", &self.server_no_context_takeover)
            .field("client_no_context_takeover", &self.client_no_context_takeover)
            .field("server_max_window_bits", &self.server_max_window_bits)
            .field("client_max_window_bits", &self.client_max_window_bits)
            .field("mem_level", &self.mem_level)
            .field("offers", &self.offers)
            .field("accept_offer", &self.accept_offer.is_some())
            .field("accept_response", &self.accept_response.is_some())
            .finish()
    }
}

/// Configuration options for a WebSocket connection.
///
/// Use [`Options::server`] or [`Options::client`] to get the defaults of a role, then
/// adjust with the `with_*` methods.
#[derive(Debug, Clone)]
pub struct Options {
    /// Which end of the connection this is.
    pub role: Role,

    /// Validate text messages as UTF-8 while they arrive. Default: `true`.
    pub utf8_validate_incoming: bool,

    /// Mask outgoing frames as the role requires. Default: `true`.
    ///
    /// Disabling this produces non-compliant client traffic and exists for testing peers.
    pub apply_mask: bool,

    /// Largest accepted frame payload, `0` for no limit. Exceeding it fails with 1008.
    ///
    /// Default: 1 MiB ([`MAX_FRAME_PAYLOAD`]).
    pub max_frame_payload_size: usize,

    /// Largest accepted message payload, `0` for no limit. Exceeding it fails with 1009.
    ///
    /// Default: 2 MiB ([`MAX_MESSAGE_PAYLOAD`]).
    pub max_message_payload_size: usize,

    /// Split outgoing messages into frames of at most this size, `0` to send one frame.
    pub auto_fragment_size: usize,

    /// Drop the transport right away when the peer violates the protocol instead of
    /// sending a close frame first. Default: `true`.
    pub fail_by_drop: bool,

    /// Echo the peer's close code and reason instead of 1000. Default: `false`.
    pub echo_close_code_reason: bool,

    /// Time allowed for the opening handshake to complete. Default: 5 seconds.
    pub open_handshake_timeout: Option<Duration>,

    /// Time allowed for the peer to answer our close frame. Default: 1 second.
    pub close_handshake_timeout: Option<Duration>,

    /// Time a client waits for the server to drop the transport after the closing
    /// handshake. Default: 1 second.
    pub server_connection_drop_timeout: Option<Duration>,

    /// Set TCP_NODELAY on the transport. Default: `true`.
    pub tcp_no_delay: bool,

    /// Send a ping after this much time. Default: disabled.
    pub auto_ping_interval: Option<Duration>,

    /// Drop the connection when a ping is not answered in time. Default: disabled.
    pub auto_ping_timeout: Option<Duration>,

    /// Size of the random ping payload, 4 to 125. Default: 4.
    pub auto_ping_size: usize,

    /// Server: reject unmasked client frames. Default: `true`.
    pub require_masked_client_frames: bool,

    /// Server: mask outgoing frames. Default: `false`.
    pub mask_server_frames: bool,

    /// Client: mask outgoing frames. Default: `true`.
    pub mask_client_frames: bool,

    /// Client: accept masked frames from the server. Default: `false`.
    pub accept_masked_server_frames: bool,

    /// Origins accepted by a server, with `*` matching any run of characters.
    /// Empty accepts every origin.
    pub allowed_origins: Vec<String>,

    /// Client: proxy the transport connects through before the opening handshake.
    pub proxy: Option<String>,

    /// permessage-deflate configuration, `None` to disable compression.
    pub compression: Option<DeflateOptions>,

    /// Log every octet sent and received at trace level.
    pub log_octets: bool,

    /// Log every frame sent and received at trace level.
    pub log_frames: bool,
}

impl Options {
    /// Defaults for the server side of a connection.
    pub fn server() -> Self {
        Self {
            role: Role::Server,
            utf8_validate_incoming: true,
            apply_mask: true,
            max_frame_payload_size: MAX_FRAME_PAYLOAD,
            max_message_payload_size: MAX_MESSAGE_PAYLOAD,
            auto_fragment_size: 0,
            fail_by_drop: true,
            echo_close_code_reason: false,
            open_handshake_timeout: Some(Duration::from_secs(5)),
            close_handshake_timeout: Some(Duration::from_secs(1)),
            server_connection_drop_timeout: Some(Duration::from_secs(1)),
            tcp_no_delay: true,
            auto_ping_interval: None,
            auto_ping_timeout: None,
            auto_ping_size: 4,
            require_masked_client_frames: true,
            mask_server_frames: false,
            mask_client_frames: true,
            accept_masked_server_frames: false,
            allowed_origins: Vec::new(),
            proxy: None,
            compression: None,
            log_octets: false,
            log_frames: false,
        }
    }

    /// Defaults for the client side of a connection.
    pub fn client() -> Self {
        Self {
            role: Role::Client,
            ..Self::server()
        }
    }

    /// Checks every value for its valid range.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(WebSocketError::InvalidOption(msg));

        if !(4..=125).contains(&self.auto_ping_size) {
            return invalid(format!(
                "auto_ping_size must be within 4..=125, got {}",
                self.auto_ping_size
            ));
        }
        for (name, timeout) in [
            ("open_handshake_timeout", self.open_handshake_timeout),
            ("close_handshake_timeout", self.close_handshake_timeout),
            ("server_connection_drop_timeout", self.server_connection_drop_timeout),
            ("auto_ping_interval", self.auto_ping_interval),
            ("auto_ping_timeout", self.auto_ping_timeout),
        ] {
            if timeout == Some(Duration::ZERO) {
                return invalid(format!("{name} must be greater than zero"));
            }
        }
        if self.max_frame_payload_size > 0
            && self.max_message_payload_size > 0
            && self.max_frame_payload_size > self.max_message_payload_size
        {
            return invalid(format!(
                "max_frame_payload_size ({}) exceeds max_message_payload_size ({})",
                self.max_frame_payload_size, self.max_message_payload_size
            ));
        }
        if self.proxy.is_some() && self.role == Role::Server {
            return invalid("proxy is only valid for clients".to_string());
        }

        if let Some(deflate) = &self.compression {
            if deflate.level > 9 {
                return invalid(format!("compression level {} exceeds 9", deflate.level));
            }
            for bits in [deflate.server_max_window_bits, deflate.client_max_window_bits]
                .into_iter()
                .flatten()
            {
                if !(8..=15).contains(&bits) {
                    return invalid(format!("window bits {bits} out of range 8..=15"));
                }
                if !cfg!(feature = "zlib") && bits < 15 {
                    return invalid(format!("window bits {bits} require the zlib feature"));
                }
            }
            if let Some(level) = deflate.mem_level {
                if !(1..=9).contains(&level) {
                    return invalid(format!("mem level {level} out of range 1..=9"));
                }
            }
        }

        Ok(())
    }

    /// Whether outgoing frames are masked.
    pub fn mask_outgoing(&self) -> bool {
        self.apply_mask
            && match self.role {
                Role::Server => self.mask_server_frames,
                Role::Client => self.mask_client_frames,
            }
    }

    /// Whether `origin` matches one of [`Options::allowed_origins`].
    pub fn is_origin_allowed(&self, origin: Option<&str>) -> bool {
        if self.allowed_origins.is_empty() {
            return true;
        }
        let Some(origin) = origin else {
            return false;
        };
        let origin = origin.to_ascii_lowercase();
        self.allowed_origins
            .iter()
            .any(|pattern| wildcard_match(&pattern.to_ascii_lowercase(), &origin))
    }

    pub fn with_utf8_validation(self, enabled: bool) -> Self {
        Self {
            utf8_validate_incoming: enabled,
            ..self
        }
    }

    /// Sets the frame payload limit, `0` for no limit.
    pub fn with_max_frame_payload_size(self, size: usize) -> Self {
        Self {
            max_frame_payload_size: size,
            ..self
        }
    }

    /// Sets the message payload limit, `0` for no limit.
    pub fn with_max_message_payload_size(self, size: usize) -> Self {
        Self {
            max_message_payload_size: size,
            ..self
        }
    }

    pub fn with_auto_fragment_size(self, size: usize) -> Self {
        Self {
            auto_fragment_size: size,
            ..self
        }
    }

    pub fn with_fail_by_drop(self, enabled: bool) -> Self {
        Self {
            fail_by_drop: enabled,
            ..self
        }
    }

    pub fn with_echo_close_code_reason(self, enabled: bool) -> Self {
        Self {
            echo_close_code_reason: enabled,
            ..self
        }
    }

    pub fn with_open_handshake_timeout(self, timeout: Option<Duration>) -> Self {
        Self {
            open_handshake_timeout: timeout,
            ..self
        }
    }

    pub fn with_close_handshake_timeout(self, timeout: Option<Duration>) -> Self {
        Self {
            close_handshake_timeout: timeout,
            ..self
        }
    }

    pub fn with_server_connection_drop_timeout(self, timeout: Option<Duration>) -> Self {
        Self {
            server_connection_drop_timeout: timeout,
            ..self
        }
    }

    pub fn with_tcp_no_delay(self, enabled: bool) -> Self {
        Self {
            tcp_no_delay: enabled,
            ..self
        }
    }

    /// Enables keepalive: a ping every `interval`, and a drop when the pong does not
    /// arrive within `timeout`.
    pub fn with_auto_ping(self, interval: Duration, timeout: Option<Duration>) -> Self {
        Self {
            auto_ping_interval: Some(interval),
            auto_ping_timeout: timeout,
            ..self
        }
    }

    pub fn with_auto_ping_size(self, size: usize) -> Self {
        Self {
            auto_ping_size: size,
            ..self
        }
    }

    pub fn with_allowed_origins<I, S>(self, origins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            allowed_origins: origins.into_iter().map(Into::into).collect(),
            ..self
        }
    }

    pub fn with_proxy(self, proxy: impl Into<String>) -> Self {
        Self {
            proxy: Some(proxy.into()),
            ..self
        }
    }

    /// Enables permessage-deflate.
    pub fn with_compression(self, deflate: DeflateOptions) -> Self {
        Self {
            compression: Some(deflate),
            ..self
        }
    }

    pub fn without_compression(self) -> Self {
        Self {
            compression: None,
            ..self
        }
    }

    /// Sets the compression level, enabling compression with defaults if needed.
    pub fn with_compression_level(self, level: u32) -> Self {
        let mut compression = self.compression.unwrap_or_default();
        compression.level = level;
        Self {
            compression: Some(compression),
            ..self
        }
    }

    /// Asks for the server to drop its compression context between messages.
    pub fn server_no_context_takeover(self) -> Self {
        let mut compression = self.compression.unwrap_or_default();
        compression.server_no_context_takeover = true;
        Self {
            compression: Some(compression),
            ..self
        }
    }

    /// Asks for the client to drop its compression context between messages.
    pub fn client_no_context_takeover(self) -> Self {
        let mut compression = self.compression.unwrap_or_default();
        compression.client_no_context_takeover = true;
        Self {
            compression: Some(compression),
            ..self
        }
    }

    pub fn with_frame_logging(self, frames: bool, octets: bool) -> Self {
        Self {
            log_frames: frames,
            log_octets: octets,
            ..self
        }
    }
}

/// Matches `text` against `pattern`, where `*` matches any run of characters.
fn wildcard_match(pattern: &str, text: &str) -> bool {
    let mut parts = pattern.split('*');
    let Some(first) = parts.next() else {
        return text.is_empty();
    };
    let Some(mut rest) = text.strip_prefix(first) else {
        return false;
    };

    let parts: Vec<&str> = parts.collect();
    let Some((last, middle)) = parts.split_last() else {
        // no wildcard at all
        return rest.is_empty();
    };

    for part in middle {
        match rest.find(part) {
            Some(at) => rest = &rest[at + part.len()..],
            None => return false,
        }
    }

    rest.len() >= last.len() && rest.ends_with(last)
}
