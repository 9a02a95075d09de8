//! `Sec-WebSocket-Extensions` parsing and permessage-deflate negotiation.
//!
//! Negotiation is driven through an explicit [`ExtensionRegistry`] so embedders can add
//! their own per-message compression without touching global state.
use std::{collections::HashSet, fmt, sync::Arc};

use nom::{
    branch::alt,
    bytes::complete::{take_while, take_while1},
    character::complete::{char, space0},
    combinator::opt,
    multi::{many0, separated_list1},
    sequence::{delimited, pair, preceded},
    IResult, Parser,
};

use crate::{
    compression::{
        PerMessageCompress, PerMessageDeflate, PerMessageDeflateParams, DEFAULT_WINDOW_BITS,
        PERMESSAGE_DEFLATE,
    },
    options::{DeflateOptions, Options},
    Result, WebSocketError,
};

/// One `name[=value]` parameter of an extension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtensionParam {
    pub name: String,
    pub value: Option<String>,
}

/// One extension of a `Sec-WebSocket-Extensions` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extension {
    pub name: String,
    pub params: Vec<ExtensionParam>,
}

fn is_token_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || "!#$%&'*+-.^_`|~".contains(c)
}

fn token(input: &str) -> IResult<&str, &str> {
    take_while1(is_token_char).parse(input)
}

fn quoted(input: &str) -> IResult<&str, &str> {
    delimited(char('"'), take_while(|c| c != '"'), char('"')).parse(input)
}

fn ws<'a, O, F>(inner: F) -> impl Parser<&'a str, Output = O, Error = nom::error::Error<&'a str>>
where
    F: Parser<&'a str, Output = O, Error = nom::error::Error<&'a str>>,
{
    delimited(space0, inner, space0)
}

fn param(input: &str) -> IResult<&str, ExtensionParam> {
    let (input, (name, value)) = pair(
        ws(token),
        opt(preceded(char('='), ws(alt((quoted, token))))),
    )
    .parse(input)?;

    Ok((
        input,
        ExtensionParam {
            name: name.to_ascii_lowercase(),
            value: value.map(str::to_owned),
        },
    ))
}

fn extension(input: &str) -> IResult<&str, Extension> {
    let (input, (name, params)) =
        pair(ws(token), many0(preceded(char(';'), param))).parse(input)?;

    Ok((
        input,
        Extension {
            name: name.to_ascii_lowercase(),
            params,
        },
    ))
}

/// Parses a `Sec-WebSocket-Extensions` header value into its extensions, in order.
pub fn parse_extensions(header: &str) -> Result<Vec<Extension>> {
    let invalid = || WebSocketError::InvalidExtension(header.to_string());

    let (rest, extensions) = separated_list1(char(','), extension)
        .parse(header)
        .map_err(|_| invalid())?;
    if !rest.trim().is_empty() {
        return Err(invalid());
    }

    Ok(extensions)
}

fn parse_window_bits(name: &str, value: &str) -> Result<u8> {
    match value.parse::<u8>() {
        Ok(bits) if (8..=15).contains(&bits) => Ok(bits),
        _ => Err(WebSocketError::InvalidExtension(format!(
            "invalid value {value:?} for {name}"
        ))),
    }
}

fn check_unique<'a>(seen: &mut HashSet<&'a str>, param: &'a ExtensionParam) -> Result<()> {
    if !seen.insert(param.name.as_str()) {
        return Err(WebSocketError::InvalidExtension(format!(
            "duplicate parameter {}",
            param.name
        )));
    }
    Ok(())
}

fn flag(param: &ExtensionParam) -> Result<()> {
    match param.value {
        None => Ok(()),
        Some(_) => Err(WebSocketError::InvalidExtension(format!(
            "{} takes no value",
            param.name
        ))),
    }
}

fn required_bits(param: &ExtensionParam) -> Result<u8> {
    match &param.value {
        Some(value) => parse_window_bits(&param.name, value),
        None => Err(WebSocketError::InvalidExtension(format!(
            "{} requires a value",
            param.name
        ))),
    }
}

/// A permessage-deflate offer, as sent by a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PerMessageDeflateOffer {
    /// The client supports `client_no_context_takeover` in the response.
    pub accept_no_context_takeover: bool,
    /// The client supports `client_max_window_bits` in the response.
    pub accept_max_window_bits: bool,
    /// Window the client announces it will use at most, `0` when not announced.
    pub client_max_window_bits: u8,
    /// The client asks the server not to keep its compression context.
    pub request_no_context_takeover: bool,
    /// Window the client asks the server to compress with, `0` for no request.
    pub request_max_window_bits: u8,
}

impl PerMessageDeflateOffer {
    pub fn parse(params: &[ExtensionParam]) -> Result<Self> {
        let mut offer = Self::default();
        let mut seen = HashSet::new();

        for param in params {
            check_unique(&mut seen, param)?;
            match param.name.as_str() {
                "client_max_window_bits" => {
                    offer.accept_max_window_bits = true;
                    if let Some(value) = &param.value {
                        offer.client_max_window_bits = parse_window_bits(&param.name, value)?;
                    }
                }
                "client_no_context_takeover" => {
                    flag(param)?;
                    offer.accept_no_context_takeover = true;
                }
                "server_max_window_bits" => {
                    offer.request_max_window_bits = required_bits(param)?;
                }
                "server_no_context_takeover" => {
                    flag(param)?;
                    offer.request_no_context_takeover = true;
                }
                other => {
                    return Err(WebSocketError::InvalidExtension(format!(
                        "unknown offer parameter {other}"
                    )))
                }
            }
        }

        Ok(offer)
    }
}

impl fmt::Display for PerMessageDeflateOffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{PERMESSAGE_DEFLATE}")?;
        if self.accept_no_context_takeover {
            write!(f, "; client_no_context_takeover")?;
        }
        if self.accept_max_window_bits {
            if self.client_max_window_bits != 0 {
                write!(f, "; client_max_window_bits={}", self.client_max_window_bits)?;
            } else {
                write!(f, "; client_max_window_bits")?;
            }
        }
        if self.request_no_context_takeover {
            write!(f, "; server_no_context_takeover")?;
        }
        if self.request_max_window_bits != 0 {
            write!(f, "; server_max_window_bits={}", self.request_max_window_bits)?;
        }
        Ok(())
    }
}

/// The server's acceptance of a client offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PerMessageDeflateOfferAccept {
    pub offer: PerMessageDeflateOffer,
    /// Ask the client to drop its compression context between messages.
    pub request_no_context_takeover: bool,
    /// Ask the client to compress with this window, `0` for no request.
    pub request_max_window_bits: u8,
    /// The server drops its compression context between messages.
    pub no_context_takeover: bool,
    /// Window the server compresses with, `0` for the default.
    pub window_bits: u8,
    /// Memory level of the server's compressor, `0` for the default.
    pub mem_level: u8,
}

impl PerMessageDeflateOfferAccept {
    /// Accepts `offer` as is, honoring what it requests from the server.
    pub fn new(offer: PerMessageDeflateOffer) -> Self {
        Self {
            offer,
            request_no_context_takeover: false,
            request_max_window_bits: 0,
            no_context_takeover: offer.request_no_context_takeover,
            window_bits: offer.request_max_window_bits,
            mem_level: 0,
        }
    }

    /// Checks the acceptance against the offer it answers.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(WebSocketError::InvalidExtension(msg.to_string()));

        if self.request_no_context_takeover && !self.offer.accept_no_context_takeover {
            return invalid("client does not support client_no_context_takeover");
        }
        if self.request_max_window_bits != 0 && !self.offer.accept_max_window_bits {
            return invalid("client does not support client_max_window_bits");
        }
        if self.offer.request_no_context_takeover && !self.no_context_takeover {
            return invalid("client requires server_no_context_takeover");
        }
        if self.offer.request_max_window_bits != 0
            && (self.window_bits == 0 || self.window_bits > self.offer.request_max_window_bits)
        {
            return invalid("client requires a smaller server_max_window_bits");
        }
        for bits in [self.request_max_window_bits, self.window_bits] {
            if bits != 0 && !(8..=15).contains(&bits) {
                return invalid("window bits out of range 8..=15");
            }
        }
        if self.mem_level != 0 && !(1..=9).contains(&self.mem_level) {
            return invalid("mem level out of range 1..=9");
        }
        Ok(())
    }

    /// The parameters both sides will use.
    pub fn params(&self) -> PerMessageDeflateParams {
        let client_bits = match (self.request_max_window_bits, self.offer.client_max_window_bits) {
            (0, 0) => DEFAULT_WINDOW_BITS,
            (0, offered) => offered,
            (requested, _) => requested,
        };

        PerMessageDeflateParams {
            server_no_context_takeover: self.no_context_takeover,
            client_no_context_takeover: self.request_no_context_takeover,
            server_max_window_bits: nonzero_or(self.window_bits, DEFAULT_WINDOW_BITS),
            client_max_window_bits: client_bits,
            mem_level: nonzero_or(self.mem_level, crate::compression::DEFAULT_MEM_LEVEL),
        }
    }
}

impl fmt::Display for PerMessageDeflateOfferAccept {
    /// Formats the response extension string sent back to the client.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{PERMESSAGE_DEFLATE}")?;
        if self.no_context_takeover {
            write!(f, "; server_no_context_takeover")?;
        }
        if self.window_bits != 0 {
            write!(f, "; server_max_window_bits={}", self.window_bits)?;
        }
        if self.request_no_context_takeover {
            write!(f, "; client_no_context_takeover")?;
        }
        if self.request_max_window_bits != 0 {
            write!(f, "; client_max_window_bits={}", self.request_max_window_bits)?;
        }
        Ok(())
    }
}

/// A permessage-deflate response, as sent by a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PerMessageDeflateResponse {
    /// Window the client must compress with, `0` when not constrained.
    pub client_max_window_bits: u8,
    pub client_no_context_takeover: bool,
    /// Window the server compresses with, `0` when not announced.
    pub server_max_window_bits: u8,
    pub server_no_context_takeover: bool,
}

impl PerMessageDeflateResponse {
    pub fn parse(params: &[ExtensionParam]) -> Result<Self> {
        let mut response = Self::default();
        let mut seen = HashSet::new();

        for param in params {
            check_unique(&mut seen, param)?;
            match param.name.as_str() {
                "client_max_window_bits" => {
                    response.client_max_window_bits = required_bits(param)?;
                }
                "client_no_context_takeover" => {
                    flag(param)?;
                    response.client_no_context_takeover = true;
                }
                "server_max_window_bits" => {
                    response.server_max_window_bits = required_bits(param)?;
                }
                "server_no_context_takeover" => {
                    flag(param)?;
                    response.server_no_context_takeover = true;
                }
                other => {
                    return Err(WebSocketError::InvalidExtension(format!(
                        "unknown response parameter {other}"
                    )))
                }
            }
        }

        Ok(response)
    }
}

/// The client's acceptance of a server response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PerMessageDeflateResponseAccept {
    pub response: PerMessageDeflateResponse,
    /// The client drops its compression context even if not asked to.
    pub no_context_takeover: bool,
    /// Window the client compresses with, `0` for what the response says.
    pub window_bits: u8,
    /// Memory level of the client's compressor, `0` for the default.
    pub mem_level: u8,
}

impl PerMessageDeflateResponseAccept {
    pub fn new(response: PerMessageDeflateResponse) -> Self {
        Self {
            response,
            no_context_takeover: response.client_no_context_takeover,
            window_bits: 0,
            mem_level: 0,
        }
    }

    pub fn params(&self) -> PerMessageDeflateParams {
        let response = &self.response;
        let client_bits = match (self.window_bits, response.client_max_window_bits) {
            (0, 0) => DEFAULT_WINDOW_BITS,
            (0, required) => required,
            (own, 0) => own,
            (own, required) => own.min(required),
        };

        PerMessageDeflateParams {
            server_no_context_takeover: response.server_no_context_takeover,
            client_no_context_takeover: response.client_no_context_takeover
                || self.no_context_takeover,
            server_max_window_bits: nonzero_or(
                response.server_max_window_bits,
                DEFAULT_WINDOW_BITS,
            ),
            client_max_window_bits: client_bits,
            mem_level: nonzero_or(self.mem_level, crate::compression::DEFAULT_MEM_LEVEL),
        }
    }
}

#[inline]
fn nonzero_or(value: u8, default: u8) -> u8 {
    if value == 0 {
        default
    } else {
        value
    }
}

/// Server side outcome of extension negotiation.
pub struct AcceptedExtension {
    /// Value for the `Sec-WebSocket-Extensions` response header.
    pub response: String,
    pub codec: Box<dyn PerMessageCompress>,
}

impl fmt::Debug for AcceptedExtension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AcceptedExtension")
            .field("response", &self.response)
            .finish_non_exhaustive()
    }
}

/// A per-message compression extension that can be negotiated.
pub trait ExtensionFactory: Send + Sync {
    /// Lowercase extension name.
    fn name(&self) -> &'static str;

    /// Client side: extension strings to offer, most preferred first.
    fn client_offers(&self, options: &Options) -> Vec<String>;

    /// Server side: picks one of the client's offers for this extension, if any.
    fn accept_offers(
        &self,
        offers: &[&[ExtensionParam]],
        options: &Options,
    ) -> Result<Option<AcceptedExtension>>;

    /// Client side: validates the server's response and builds the codec.
    fn accept_response(
        &self,
        params: &[ExtensionParam],
        options: &Options,
    ) -> Result<Box<dyn PerMessageCompress>>;
}

/// permessage-deflate negotiation driven by [`DeflateOptions`].
#[derive(Debug, Default, Clone, Copy)]
pub struct DeflateExtension;

impl DeflateExtension {
    fn default_offer(deflate: &DeflateOptions) -> PerMessageDeflateOffer {
        PerMessageDeflateOffer {
            accept_no_context_takeover: true,
            accept_max_window_bits: cfg!(feature = "zlib"),
            client_max_window_bits: 0,
            request_no_context_takeover: deflate.server_no_context_takeover,
            request_max_window_bits: deflate.server_max_window_bits.unwrap_or(0),
        }
    }

    /// Merges an offer with the server's own preferences.
    fn default_accept(
        deflate: &DeflateOptions,
        offers: &[PerMessageDeflateOffer],
    ) -> Option<PerMessageDeflateOfferAccept> {
        offers.iter().find_map(|offer| {
            let mut accept = PerMessageDeflateOfferAccept::new(*offer);

            accept.no_context_takeover |= deflate.server_no_context_takeover;
            if let Some(bits) = deflate.server_max_window_bits {
                accept.window_bits = match accept.window_bits {
                    0 => bits,
                    requested => requested.min(bits),
                };
            }
            if deflate.client_no_context_takeover && offer.accept_no_context_takeover {
                accept.request_no_context_takeover = true;
            }
            if let Some(bits) = deflate.client_max_window_bits {
                if offer.accept_max_window_bits {
                    accept.request_max_window_bits = bits;
                }
            }
            accept.mem_level = deflate.mem_level.unwrap_or(0);

            // without zlib the compressor always uses the full window
            if !cfg!(feature = "zlib") && accept.window_bits != 0 && accept.window_bits < 15 {
                return None;
            }

            accept.validate().ok().map(|_| accept)
        })
    }

    fn default_accept_response(
        deflate: &DeflateOptions,
        response: &PerMessageDeflateResponse,
    ) -> Option<PerMessageDeflateResponseAccept> {
        if !cfg!(feature = "zlib")
            && response.client_max_window_bits != 0
            && response.client_max_window_bits < 15
        {
            return None;
        }

        let mut accept = PerMessageDeflateResponseAccept::new(*response);
        accept.no_context_takeover |= deflate.client_no_context_takeover;
        accept.window_bits = deflate.client_max_window_bits.unwrap_or(0);
        accept.mem_level = deflate.mem_level.unwrap_or(0);
        Some(accept)
    }
}

impl ExtensionFactory for DeflateExtension {
    fn name(&self) -> &'static str {
        PERMESSAGE_DEFLATE
    }

    fn client_offers(&self, options: &Options) -> Vec<String> {
        let Some(deflate) = &options.compression else {
            return Vec::new();
        };

        if deflate.offers.is_empty() {
            vec![Self::default_offer(deflate).to_string()]
        } else {
            deflate.offers.iter().map(ToString::to_string).collect()
        }
    }

    fn accept_offers(
        &self,
        offers: &[&[ExtensionParam]],
        options: &Options,
    ) -> Result<Option<AcceptedExtension>> {
        let Some(deflate) = &options.compression else {
            return Ok(None);
        };

        // offers with parameters we do not understand are declined
        let offers: Vec<PerMessageDeflateOffer> = offers
            .iter()
            .filter_map(|params| match PerMessageDeflateOffer::parse(params) {
                Ok(offer) => Some(offer),
                Err(err) => {
                    log::debug!("declining permessage-deflate offer: {err}");
                    None
                }
            })
            .collect();
        if offers.is_empty() {
            return Ok(None);
        }

        let accept = match &deflate.accept_offer {
            Some(callback) => callback(offers.as_slice()),
            None => Self::default_accept(deflate, &offers),
        };
        let Some(accept) = accept else {
            return Ok(None);
        };
        accept.validate()?;

        let codec = PerMessageDeflate::new(options.role, accept.params(), deflate.level)?;
        Ok(Some(AcceptedExtension {
            response: accept.to_string(),
            codec: Box::new(codec),
        }))
    }

    fn accept_response(
        &self,
        params: &[ExtensionParam],
        options: &Options,
    ) -> Result<Box<dyn PerMessageCompress>> {
        let Some(deflate) = &options.compression else {
            return Err(WebSocketError::InvalidExtension(
                "server accepted permessage-deflate which was not offered".to_string(),
            ));
        };

        let response = PerMessageDeflateResponse::parse(params)?;
        let accept = match &deflate.accept_response {
            Some(callback) => callback(&response),
            None => Self::default_accept_response(deflate, &response),
        };
        let Some(accept) = accept else {
            return Err(WebSocketError::InvalidExtension(
                "permessage-deflate response declined".to_string(),
            ));
        };

        let codec = PerMessageDeflate::new(options.role, accept.params(), deflate.level)?;
        Ok(Box::new(codec))
    }
}

/// Extensions known to a factory, looked up by name.
#[derive(Clone)]
pub struct ExtensionRegistry {
    factories: Vec<Arc<dyn ExtensionFactory>>,
}

impl Default for ExtensionRegistry {
    /// A registry holding permessage-deflate.
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(Arc::new(DeflateExtension));
        registry
    }
}

impl fmt::Debug for ExtensionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.factories.iter().map(|factory| factory.name()))
            .finish()
    }
}

impl ExtensionRegistry {
    pub fn empty() -> Self {
        Self {
            factories: Vec::new(),
        }
    }

    /// Adds an extension, replacing one with the same name.
    pub fn register(&mut self, factory: Arc<dyn ExtensionFactory>) {
        self.factories.retain(|known| known.name() != factory.name());
        self.factories.push(factory);
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn ExtensionFactory>> {
        self.factories.iter().find(|factory| factory.name() == name)
    }

    /// Client side: the `Sec-WebSocket-Extensions` value to send, if anything is offered.
    pub fn client_offer_header(&self, options: &Options) -> Option<String> {
        let offers: Vec<String> = self
            .factories
            .iter()
            .flat_map(|factory| factory.client_offers(options))
            .collect();

        (!offers.is_empty()).then(|| offers.join(", "))
    }

    /// Server side: accepts at most one extension from the client's offers.
    ///
    /// Extensions are tried in the order the client first offered them.
    pub fn accept_offers(
        &self,
        extensions: &[Extension],
        options: &Options,
    ) -> Result<Option<AcceptedExtension>> {
        let mut names: Vec<&str> = Vec::new();
        for extension in extensions {
            if !names.contains(&extension.name.as_str()) {
                names.push(&extension.name);
            }
        }

        for name in names {
            let Some(factory) = self.get(name) else {
                log::debug!("ignoring unknown extension {name}");
                continue;
            };

            let offers: Vec<&[ExtensionParam]> = extensions
                .iter()
                .filter(|extension| extension.name == name)
                .map(|extension| extension.params.as_slice())
                .collect();

            if let Some(accepted) = factory.accept_offers(&offers, options)? {
                log::debug!("accepted extension: {}", accepted.response);
                return Ok(Some(accepted));
            }
        }

        Ok(None)
    }

    /// Client side: builds the codec for what the server accepted.
    ///
    /// Fails when the server accepted an unknown extension or more than one.
    pub fn accept_response(
        &self,
        extensions: &[Extension],
        options: &Options,
    ) -> Result<Option<Box<dyn PerMessageCompress>>> {
        match extensions {
            [] => Ok(None),
            [extension] => {
                let factory = self.get(&extension.name).ok_or_else(|| {
                    WebSocketError::InvalidExtension(format!(
                        "server accepted unknown extension {}",
                        extension.name
                    ))
                })?;
                factory
                    .accept_response(&extension.params, options)
                    .map(Some)
            }
            _ => Err(WebSocketError::InvalidExtension(
                "server accepted more than one extension".to_string(),
            )),
        }
    }
}
