use std::fmt;

use crate::wire::codec::{CodecError, WireCodec};
use crate::wire::envelope::{EntityError, PayloadMap, ResponseEnvelope, ServerTag, StatusCode};

pub const CONTENT_PROVIDER_AUTHORITY: &str = "ppp-broker.proxy_content_provider";
pub const CONTENT_URI_SCHEME: &str = "content://";

pub const AUTHORIZATION_DENIED_CODE: &str = "AuthorizationDenied";
pub const UNKNOWN_OPERATION_CODE: &str = "UnknownOperation";
pub const FLOW_MISMATCH_CODE: &str = "FlowMismatch";
pub const CLIENT_DORMANT_CODE: &str = "ClientDormant";
pub const CAPABILITY_FAILED_CODE: &str = "CapabilityFailed";
pub const CONTENT_NOT_FOUND_CODE: &str = "ContentNotFound";
pub const INTERNAL_ERROR_CODE: &str = "InternalError";

/// The three PPP handshakes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandshakeFlow {
    /// One response carrying the resource, then Close.
    OneShot,
    /// Entity-less authorization, then acknowledged resource responses.
    Ongoing,
    /// Authorization carrying a `Uri-Path`, then a second request to the content provider.
    Content,
}

impl HandshakeFlow {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::OneShot => "one_shot",
            Self::Ongoing => "ongoing",
            Self::Content => "content",
        }
    }
}

#[derive(Debug)]
pub enum HandshakeError {
    Codec(CodecError),
}

impl fmt::Display for HandshakeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Codec(source) => write!(f, "handshake codec error: {source}"),
        }
    }
}

impl std::error::Error for HandshakeError {}

pub fn encode_response_frame(
    codec: &WireCodec,
    response: ResponseEnvelope,
) -> Result<Vec<u8>, HandshakeError> {
    codec
        .encode_frame(&response.into_raw())
        .map_err(HandshakeError::Codec)
}

pub fn bad_request(error: EntityError) -> ResponseEnvelope {
    ResponseEnvelope::failure(StatusCode::BadRequest, ServerTag::AuthorizationService, error)
}

pub fn denied(reason: Option<String>) -> ResponseEnvelope {
    ResponseEnvelope::failure(
        StatusCode::Forbidden,
        ServerTag::AuthorizationService,
        EntityError::new(
            AUTHORIZATION_DENIED_CODE,
            reason.unwrap_or_else(|| "request denied by user".to_owned()),
        ),
    )
}

pub fn one_shot_granted(body: PayloadMap) -> ResponseEnvelope {
    ResponseEnvelope::ok_close(ServerTag::AuthorizationService, body)
}

/// Close pushed to a client that stopped acknowledging.
pub fn dormant_close(server: ServerTag) -> ResponseEnvelope {
    ResponseEnvelope::failure(
        StatusCode::Unauthorized,
        server,
        EntityError::new(
            CLIENT_DORMANT_CODE,
            "no acknowledgement received within the ack window",
        ),
    )
}

/// Close pushed when a stream's capability fails mid-flight; shaped like the dormancy close.
pub fn capability_failed_close(server: ServerTag, message: impl Into<String>) -> ResponseEnvelope {
    ResponseEnvelope::failure(
        StatusCode::BadRequest,
        server,
        EntityError::new(CAPABILITY_FAILED_CODE, message),
    )
}

/// Unknown, expired or already consumed content nonce.
pub fn content_not_found(uri_path: &str) -> ResponseEnvelope {
    ResponseEnvelope::failure(
        StatusCode::BadRequest,
        ServerTag::ContentProvider,
        EntityError::new(
            CONTENT_NOT_FOUND_CODE,
            format!("no authorized content request for '{uri_path}'"),
        ),
    )
}

pub fn content_uri(nonce: &str) -> String {
    format!("{CONTENT_URI_SCHEME}{CONTENT_PROVIDER_AUTHORITY}/{nonce}")
}

/// Extracts the nonce from a full content URI or returns a bare nonce unchanged.
/// URIs naming another authority yield `None`.
pub fn nonce_from_uri_path(uri_path: &str) -> Option<&str> {
    let nonce = match uri_path.strip_prefix(CONTENT_URI_SCHEME) {
        Some(rest) => rest
            .strip_prefix(CONTENT_PROVIDER_AUTHORITY)?
            .strip_prefix('/')?,
        None => uri_path.trim_start_matches('/'),
    };

    (!nonce.is_empty() && !nonce.contains('/')).then_some(nonce)
}
