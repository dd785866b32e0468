use std::fmt;

use rmpv::Value;

use crate::wire::codec::{CodecError, MessageEnvelope, WireCodec};
use crate::wire::envelope::{
    parse_string, AckEnvelope, ClientAddress, ContentQueryEnvelope, EntityError, EnvelopeError,
    RequestEnvelope, ResponseEnvelope, BAD_REQUEST_CODE, CLIENT_ADDRESS_KEY,
    PROTOCOL_VERSION, PROTOCOL_VERSION_KEY,
};
use crate::wire::handshake::bad_request;

/// Transport tag naming the broker endpoint a frame is addressed at.
pub const ROUTE_KEY: &str = "Route";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Route {
    /// Client request receiver.
    Request,
    /// Ack server, addressed by `Ack-Server-Address`.
    Ack,
    /// Content provider second phase.
    Content,
    /// Binds the connection as response sink for a `Client-Address`.
    Listen,
}

impl Route {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "Request" => Some(Self::Request),
            "Ack" => Some(Self::Ack),
            "Content" => Some(Self::Content),
            "Listen" => Some(Self::Listen),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Request => "Request",
            Self::Ack => "Ack",
            Self::Content => "Content",
            Self::Listen => "Listen",
        }
    }
}

#[derive(Debug, PartialEq)]
pub enum InboundAction {
    Request(RequestEnvelope),
    Ack(AckEnvelope),
    ContentQuery(ContentQueryEnvelope),
    Listen { client_address: ClientAddress },
}

#[derive(Debug)]
pub enum SessionError {
    /// The byte stream itself is broken; nothing can be answered.
    Codec(CodecError),
    Envelope {
        route: Route,
        client_address: Option<ClientAddress>,
        source: EnvelopeError,
    },
    ProtocolViolation {
        client_address: Option<ClientAddress>,
        code: String,
        message: String,
    },
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Codec(source) => write!(f, "session codec error: {source}"),
            Self::Envelope { route, source, .. } => {
                write!(f, "invalid {} envelope: {source}", route.as_str())
            }
            Self::ProtocolViolation { code, message, .. } => {
                write!(f, "session protocol violation ({code}): {message}")
            }
        }
    }
}

impl std::error::Error for SessionError {}

impl SessionError {
    /// `400` answer for this failure when the sender can be answered at all.
    ///
    /// Malformed requests are answered only when a `Client-Address` could be recovered; content
    /// queries are answered in place. Acks, listens and broken streams get no response.
    pub fn rejection(&self) -> Option<ResponseEnvelope> {
        match self {
            Self::Codec(_) => None,
            Self::Envelope {
                route: Route::Request,
                client_address: Some(_),
                source,
            }
            | Self::Envelope {
                route: Route::Content,
                source,
                ..
            } => Some(bad_request(source.to_entity_error())),
            Self::Envelope { .. } => None,
            Self::ProtocolViolation {
                client_address: Some(_),
                code,
                message,
            } => Some(bad_request(EntityError::new(code.clone(), message.clone()))),
            Self::ProtocolViolation { .. } => None,
        }
    }
}

pub fn evaluate_inbound_frame(codec: &WireCodec, frame: &[u8]) -> Result<InboundAction, SessionError> {
    let raw = codec.decode_frame(frame).map_err(SessionError::Codec)?;
    let route = parse_route(&raw)?;

    let envelope_error = |source: EnvelopeError| SessionError::Envelope {
        route,
        client_address: RequestEnvelope::peek_client_address(&raw),
        source,
    };

    match route {
        Route::Request => RequestEnvelope::from_raw(&raw)
            .map(InboundAction::Request)
            .map_err(envelope_error),
        Route::Ack => AckEnvelope::from_raw(&raw)
            .map(InboundAction::Ack)
            .map_err(envelope_error),
        Route::Content => ContentQueryEnvelope::from_raw(&raw)
            .map(InboundAction::ContentQuery)
            .map_err(envelope_error),
        Route::Listen => parse_listen(&raw)
            .map(|client_address| InboundAction::Listen { client_address })
            .map_err(envelope_error),
    }
}

/// Adds the `Route` tag and frames the envelope; the client-side half of the transport.
pub fn encode_routed_frame(
    codec: &WireCodec,
    route: Route,
    mut raw: MessageEnvelope,
) -> Result<Vec<u8>, CodecError> {
    raw.insert(ROUTE_KEY.to_owned(), Value::String(route.as_str().into()));
    codec.encode_frame(&raw)
}

pub fn listen_envelope(client_address: &ClientAddress) -> MessageEnvelope {
    let mut raw = MessageEnvelope::new();
    raw.insert(
        PROTOCOL_VERSION_KEY.to_owned(),
        Value::String(PROTOCOL_VERSION.into()),
    );
    raw.insert(
        CLIENT_ADDRESS_KEY.to_owned(),
        Value::String(client_address.as_str().into()),
    );
    raw
}

fn parse_route(raw: &MessageEnvelope) -> Result<Route, SessionError> {
    let violation = |message: String| SessionError::ProtocolViolation {
        client_address: RequestEnvelope::peek_client_address(raw),
        code: BAD_REQUEST_CODE.to_owned(),
        message,
    };

    let Some(value) = raw.get(ROUTE_KEY) else {
        return Err(violation(format!("missing transport tag '{ROUTE_KEY}'")));
    };
    let Some(text) = value.as_str() else {
        return Err(violation(format!("transport tag '{ROUTE_KEY}' must be a string")));
    };
    Route::parse(text).ok_or_else(|| violation(format!("unknown route '{text}'")))
}

fn parse_listen(raw: &MessageEnvelope) -> Result<ClientAddress, EnvelopeError> {
    let version = parse_string(raw.get(PROTOCOL_VERSION_KEY), PROTOCOL_VERSION_KEY)?;
    if version != PROTOCOL_VERSION {
        return Err(EnvelopeError::UnsupportedProtocolVersion { actual: version });
    }
    ClientAddress::new(parse_string(raw.get(CLIENT_ADDRESS_KEY), CLIENT_ADDRESS_KEY)?)
}
