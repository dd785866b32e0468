use std::collections::BTreeMap;
use std::fmt;

use rmpv::Value;
use uuid::Uuid;

use crate::wire::codec::{CodecError, MessageEnvelope, WireCodec};

pub const PROTOCOL_VERSION: &str = "PPP/0.1";

pub const PROTOCOL_VERSION_KEY: &str = "Protocol-Version";
pub const CLIENT_ADDRESS_KEY: &str = "Client-Address";
pub const ENTITY_BODY_KEY: &str = "Entity-Body";
pub const ENTITY_ERROR_KEY: &str = "Entity-Error";
pub const STATUS_CODE_KEY: &str = "Status-Code";
pub const CONNECTION_KEY: &str = "Connection";
pub const SERVER_KEY: &str = "Server";
pub const SENDER_IDENTITY_KEY: &str = "Sender-Identity";
pub const TYPE_KEY: &str = "Type";
pub const REQUEST_PARAMS_KEY: &str = "Request-Params";
pub const OP_CODE_KEY: &str = "Op-Code";
pub const ARGS_KEY: &str = "Args";
pub const REQUEST_REASON_KEY: &str = "Request-Reason";
pub const ACK_SERVER_ADDRESS_KEY: &str = "Ack-Server-Address";
pub const URI_PATH_KEY: &str = "Uri-Path";
pub const ERROR_CODE_KEY: &str = "Code";
pub const ERROR_MESSAGE_KEY: &str = "Message";
pub const CLOSE_VALUE: &str = "Close";

pub const BAD_REQUEST_CODE: &str = "BadRequest";

pub type PayloadMap = BTreeMap<String, Value>;

#[derive(Debug)]
pub enum EnvelopeError {
    MissingField { field: &'static str },
    InvalidFieldType { field: &'static str, expected: &'static str },
    EmptyField { field: &'static str },
    UnsupportedProtocolVersion { actual: String },
    UnknownRequestType { value: String },
    UnknownStatusCode { code: i64 },
    UnknownServerTag { value: String },
    MapKeyMustBeUtf8String { field: &'static str },
    Codec(CodecError),
}

impl fmt::Display for EnvelopeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingField { field } => write!(f, "missing envelope field '{field}'"),
            Self::InvalidFieldType { field, expected } => {
                write!(f, "invalid field type for '{field}', expected {expected}")
            }
            Self::EmptyField { field } => write!(f, "field '{field}' must not be empty"),
            Self::UnsupportedProtocolVersion { actual } => write!(
                f,
                "unsupported protocol version '{actual}', expected '{PROTOCOL_VERSION}'"
            ),
            Self::UnknownRequestType { value } => {
                write!(f, "unknown request type '{value}', expected Simple or Content")
            }
            Self::UnknownStatusCode { code } => write!(f, "unknown status code {code}"),
            Self::UnknownServerTag { value } => write!(f, "unknown server tag '{value}'"),
            Self::MapKeyMustBeUtf8String { field } => {
                write!(f, "map keys in '{field}' must be UTF-8 strings")
            }
            Self::Codec(source) => write!(f, "envelope codec error: {source}"),
        }
    }
}

impl std::error::Error for EnvelopeError {}

impl EnvelopeError {
    /// Every decode failure is a client protocol error answered with `400`.
    pub fn to_entity_error(&self) -> EntityError {
        EntityError::new(BAD_REQUEST_CODE, self.to_string())
    }
}

/// Opaque, unguessable token a client listens on for responses.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientAddress(String);

impl ClientAddress {
    pub fn new(raw: impl Into<String>) -> Result<Self, EnvelopeError> {
        let raw = raw.into();
        if raw.trim().is_empty() {
            return Err(EnvelopeError::EmptyField {
                field: CLIENT_ADDRESS_KEY,
            });
        }
        Ok(Self(raw))
    }

    /// 122 random bits, rendered without dashes.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestType {
    Simple,
    Content,
}

impl RequestType {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "Simple" => Some(Self::Simple),
            "Content" => Some(Self::Content),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Simple => "Simple",
            Self::Content => "Content",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct RequestParams {
    pub operation: String,
    pub arguments: PayloadMap,
}

impl RequestParams {
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            arguments: PayloadMap::new(),
        }
    }

    pub fn with_arg(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.arguments.insert(name.into(), value.into());
        self
    }

    pub fn arg_str(&self, name: &str) -> Option<&str> {
        self.arguments.get(name).and_then(Value::as_str)
    }

    pub fn arg_u64(&self, name: &str) -> Option<u64> {
        self.arguments.get(name).and_then(Value::as_u64)
    }

    fn from_value(value: Option<&Value>) -> Result<Self, EnvelopeError> {
        let params = parse_map(value, REQUEST_PARAMS_KEY)?;
        let operation = parse_string(params.get(OP_CODE_KEY), OP_CODE_KEY)?;
        if operation.is_empty() {
            return Err(EnvelopeError::EmptyField { field: OP_CODE_KEY });
        }

        let arguments = match params.get(ARGS_KEY) {
            None | Some(Value::Nil) => PayloadMap::new(),
            Some(value) => parse_map(Some(value), ARGS_KEY)?,
        };

        Ok(Self {
            operation,
            arguments,
        })
    }

    fn into_value(self) -> Value {
        let mut params = PayloadMap::new();
        params.insert(OP_CODE_KEY.to_owned(), Value::String(self.operation.into()));
        if !self.arguments.is_empty() {
            params.insert(ARGS_KEY.to_owned(), map_value(self.arguments));
        }
        map_value(params)
    }
}

/// A client request as received by the request receiver.
#[derive(Clone, Debug, PartialEq)]
pub struct RequestEnvelope {
    pub client_address: Option<ClientAddress>,
    pub sender_identity: String,
    pub request_type: RequestType,
    pub params: RequestParams,
    pub reason: Option<String>,
}

impl RequestEnvelope {
    pub fn new(
        client_address: Option<ClientAddress>,
        sender_identity: impl Into<String>,
        request_type: RequestType,
        params: RequestParams,
    ) -> Self {
        Self {
            client_address,
            sender_identity: sender_identity.into(),
            request_type,
            params,
            reason: None,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn operation(&self) -> &str {
        &self.params.operation
    }

    pub fn from_raw(raw: &MessageEnvelope) -> Result<Self, EnvelopeError> {
        validate_protocol_version(raw)?;
        let client_address = parse_optional_string(raw.get(CLIENT_ADDRESS_KEY), CLIENT_ADDRESS_KEY)?
            .map(ClientAddress::new)
            .transpose()?;

        let body = parse_map(raw.get(ENTITY_BODY_KEY), ENTITY_BODY_KEY)?;
        let sender_identity = parse_string(body.get(SENDER_IDENTITY_KEY), SENDER_IDENTITY_KEY)?;
        if sender_identity.is_empty() {
            return Err(EnvelopeError::EmptyField {
                field: SENDER_IDENTITY_KEY,
            });
        }

        let raw_type = parse_string(body.get(TYPE_KEY), TYPE_KEY)?;
        let request_type = RequestType::parse(&raw_type)
            .ok_or(EnvelopeError::UnknownRequestType { value: raw_type })?;
        let params = RequestParams::from_value(body.get(REQUEST_PARAMS_KEY))?;
        let reason = parse_optional_string(body.get(REQUEST_REASON_KEY), REQUEST_REASON_KEY)?;

        Ok(Self {
            client_address,
            sender_identity,
            request_type,
            params,
            reason,
        })
    }

    /// Best-effort address extraction from a request that failed to decode.
    pub fn peek_client_address(raw: &MessageEnvelope) -> Option<ClientAddress> {
        raw.get(CLIENT_ADDRESS_KEY)
            .and_then(Value::as_str)
            .and_then(|text| ClientAddress::new(text).ok())
    }

    pub fn into_raw(self) -> MessageEnvelope {
        let mut raw = MessageEnvelope::new();
        raw.insert(
            PROTOCOL_VERSION_KEY.to_owned(),
            Value::String(PROTOCOL_VERSION.into()),
        );
        if let Some(client_address) = self.client_address {
            raw.insert(
                CLIENT_ADDRESS_KEY.to_owned(),
                Value::String(client_address.0.into()),
            );
        }

        let mut body = PayloadMap::new();
        body.insert(
            SENDER_IDENTITY_KEY.to_owned(),
            Value::String(self.sender_identity.into()),
        );
        body.insert(
            TYPE_KEY.to_owned(),
            Value::String(self.request_type.as_str().into()),
        );
        body.insert(REQUEST_PARAMS_KEY.to_owned(), self.params.into_value());
        if let Some(reason) = self.reason {
            body.insert(REQUEST_REASON_KEY.to_owned(), Value::String(reason.into()));
        }
        raw.insert(ENTITY_BODY_KEY.to_owned(), map_value(body));

        raw
    }

    /// MessagePack payload without the frame header, as persisted by the ongoing store.
    pub fn encode(&self, codec: &WireCodec) -> Result<Vec<u8>, EnvelopeError> {
        codec
            .encode_payload(&self.clone().into_raw())
            .map_err(EnvelopeError::Codec)
    }

    pub fn decode(codec: &WireCodec, payload: &[u8]) -> Result<Self, EnvelopeError> {
        let raw = codec.decode_payload(payload).map_err(EnvelopeError::Codec)?;
        Self::from_raw(&raw)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatusCode {
    Ok,
    BadRequest,
    Unauthorized,
    Forbidden,
}

impl StatusCode {
    pub fn code(self) -> i64 {
        match self {
            Self::Ok => 200,
            Self::BadRequest => 400,
            Self::Unauthorized => 401,
            Self::Forbidden => 403,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            200 => Some(Self::Ok),
            400 => Some(Self::BadRequest),
            401 => Some(Self::Unauthorized),
            403 => Some(Self::Forbidden),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Connection {
    Close,
    KeepOpen,
}

/// Service that produced a response.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ServerTag {
    AuthorizationService,
    LocationService,
    GpsStatusService,
    NmeaService,
    ContentProvider,
}

impl ServerTag {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AuthorizationService => "AuthorizationService",
            Self::LocationService => "LocationService",
            Self::GpsStatusService => "GpsStatusService",
            Self::NmeaService => "NmeaService",
            Self::ContentProvider => "ContentProvider",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "AuthorizationService" => Some(Self::AuthorizationService),
            "LocationService" => Some(Self::LocationService),
            "GpsStatusService" => Some(Self::GpsStatusService),
            "NmeaService" => Some(Self::NmeaService),
            "ContentProvider" => Some(Self::ContentProvider),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EntityError {
    pub code: String,
    pub message: String,
}

impl EntityError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }

    fn into_value(self) -> Value {
        let mut map = PayloadMap::new();
        map.insert(ERROR_CODE_KEY.to_owned(), Value::String(self.code.into()));
        map.insert(
            ERROR_MESSAGE_KEY.to_owned(),
            Value::String(self.message.into()),
        );
        map_value(map)
    }

    fn from_value(value: Option<&Value>) -> Result<Self, EnvelopeError> {
        let map = parse_map(value, ENTITY_ERROR_KEY)?;
        Ok(Self {
            code: parse_string(map.get(ERROR_CODE_KEY), ERROR_CODE_KEY)?,
            message: parse_string(map.get(ERROR_MESSAGE_KEY), ERROR_MESSAGE_KEY)?,
        })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum ResponseEntity {
    /// Only the ongoing authorization response carries no entity.
    None,
    Body(PayloadMap),
    Error(EntityError),
}

/// A broker response. Constructors are the only way to build one, so the status, connection
/// directive and entity always agree.
#[derive(Clone, Debug, PartialEq)]
pub struct ResponseEnvelope {
    status: StatusCode,
    connection: Connection,
    server: ServerTag,
    entity: ResponseEntity,
}

impl ResponseEnvelope {
    /// One-shot success and second-phase content reads.
    pub fn ok_close(server: ServerTag, body: PayloadMap) -> Self {
        Self {
            status: StatusCode::Ok,
            connection: Connection::Close,
            server,
            entity: ResponseEntity::Body(body),
        }
    }

    /// Ongoing authorization: `200`, connection kept open, no entity.
    pub fn stream_authorized() -> Self {
        Self {
            status: StatusCode::Ok,
            connection: Connection::KeepOpen,
            server: ServerTag::AuthorizationService,
            entity: ResponseEntity::None,
        }
    }

    pub fn resource(server: ServerTag, mut body: PayloadMap, ack_server_address: &str) -> Self {
        body.insert(
            ACK_SERVER_ADDRESS_KEY.to_owned(),
            Value::String(ack_server_address.into()),
        );
        Self {
            status: StatusCode::Ok,
            connection: Connection::KeepOpen,
            server,
            entity: ResponseEntity::Body(body),
        }
    }

    pub fn content_authorized(uri_path: impl Into<String>) -> Self {
        let mut body = PayloadMap::new();
        body.insert(URI_PATH_KEY.to_owned(), Value::String(uri_path.into().into()));
        Self::ok_close(ServerTag::AuthorizationService, body)
    }

    /// Normal stream termination: final `200` with `Stream-Ended` and Close.
    pub fn stream_ended(server: ServerTag) -> Self {
        let mut body = PayloadMap::new();
        body.insert("Stream-Ended".to_owned(), Value::Boolean(true));
        Self::ok_close(server, body)
    }

    /// Any failure: error entity and Close.
    pub fn failure(status: StatusCode, server: ServerTag, error: EntityError) -> Self {
        Self {
            status,
            connection: Connection::Close,
            server,
            entity: ResponseEntity::Error(error),
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn connection(&self) -> Connection {
        self.connection
    }

    pub fn server(&self) -> ServerTag {
        self.server
    }

    pub fn entity(&self) -> &ResponseEntity {
        &self.entity
    }

    pub fn body(&self) -> Option<&PayloadMap> {
        match &self.entity {
            ResponseEntity::Body(body) => Some(body),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&EntityError> {
        match &self.entity {
            ResponseEntity::Error(error) => Some(error),
            _ => None,
        }
    }

    pub fn is_close(&self) -> bool {
        self.connection == Connection::Close
    }

    pub fn into_raw(self) -> MessageEnvelope {
        let mut raw = MessageEnvelope::new();
        raw.insert(
            PROTOCOL_VERSION_KEY.to_owned(),
            Value::String(PROTOCOL_VERSION.into()),
        );
        raw.insert(
            STATUS_CODE_KEY.to_owned(),
            Value::Integer(self.status.code().into()),
        );
        if self.connection == Connection::Close {
            raw.insert(CONNECTION_KEY.to_owned(), Value::String(CLOSE_VALUE.into()));
        }
        raw.insert(
            SERVER_KEY.to_owned(),
            Value::String(self.server.as_str().into()),
        );
        match self.entity {
            ResponseEntity::None => {}
            ResponseEntity::Body(body) => {
                raw.insert(ENTITY_BODY_KEY.to_owned(), map_value(body));
            }
            ResponseEntity::Error(error) => {
                raw.insert(ENTITY_ERROR_KEY.to_owned(), error.into_value());
            }
        }
        raw
    }

    /// Client-side parse, used by tooling and tests.
    pub fn from_raw(raw: &MessageEnvelope) -> Result<Self, EnvelopeError> {
        validate_protocol_version(raw)?;
        let code = parse_i64(raw.get(STATUS_CODE_KEY), STATUS_CODE_KEY)?;
        let status = StatusCode::from_code(code).ok_or(EnvelopeError::UnknownStatusCode { code })?;

        let connection = match parse_optional_string(raw.get(CONNECTION_KEY), CONNECTION_KEY)? {
            Some(value) if value == CLOSE_VALUE => Connection::Close,
            _ => Connection::KeepOpen,
        };

        let raw_server = parse_string(raw.get(SERVER_KEY), SERVER_KEY)?;
        let server = ServerTag::parse(&raw_server)
            .ok_or(EnvelopeError::UnknownServerTag { value: raw_server })?;

        let entity = match (raw.get(ENTITY_BODY_KEY), raw.get(ENTITY_ERROR_KEY)) {
            (Some(body), None) => ResponseEntity::Body(parse_map(Some(body), ENTITY_BODY_KEY)?),
            (None, Some(error)) => ResponseEntity::Error(EntityError::from_value(Some(error))?),
            (None, None) => ResponseEntity::None,
            (Some(_), Some(_)) => {
                return Err(EnvelopeError::InvalidFieldType {
                    field: ENTITY_ERROR_KEY,
                    expected: "absent when Entity-Body is present",
                })
            }
        };

        Ok(Self {
            status,
            connection,
            server,
            entity,
        })
    }
}

/// Acknowledgement of a resource response, addressed at the broker's ack server address.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AckEnvelope {
    pub client_address: ClientAddress,
    pub ack_server_address: String,
}

impl AckEnvelope {
    pub fn from_raw(raw: &MessageEnvelope) -> Result<Self, EnvelopeError> {
        validate_protocol_version(raw)?;
        let client_address =
            ClientAddress::new(parse_string(raw.get(CLIENT_ADDRESS_KEY), CLIENT_ADDRESS_KEY)?)?;
        let ack_server_address =
            parse_string(raw.get(ACK_SERVER_ADDRESS_KEY), ACK_SERVER_ADDRESS_KEY)?;
        Ok(Self {
            client_address,
            ack_server_address,
        })
    }

    pub fn into_raw(self) -> MessageEnvelope {
        let mut raw = MessageEnvelope::new();
        raw.insert(
            PROTOCOL_VERSION_KEY.to_owned(),
            Value::String(PROTOCOL_VERSION.into()),
        );
        raw.insert(
            CLIENT_ADDRESS_KEY.to_owned(),
            Value::String(self.client_address.0.into()),
        );
        raw.insert(
            ACK_SERVER_ADDRESS_KEY.to_owned(),
            Value::String(self.ack_server_address.into()),
        );
        raw
    }
}

/// Second-phase content read presented to the content provider.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContentQueryEnvelope {
    pub uri_path: String,
}

impl ContentQueryEnvelope {
    pub fn from_raw(raw: &MessageEnvelope) -> Result<Self, EnvelopeError> {
        validate_protocol_version(raw)?;
        let uri_path = parse_string(raw.get(URI_PATH_KEY), URI_PATH_KEY)?;
        if uri_path.is_empty() {
            return Err(EnvelopeError::EmptyField {
                field: URI_PATH_KEY,
            });
        }
        Ok(Self { uri_path })
    }

    pub fn into_raw(self) -> MessageEnvelope {
        let mut raw = MessageEnvelope::new();
        raw.insert(
            PROTOCOL_VERSION_KEY.to_owned(),
            Value::String(PROTOCOL_VERSION.into()),
        );
        raw.insert(URI_PATH_KEY.to_owned(), Value::String(self.uri_path.into()));
        raw
    }
}

pub fn map_value(map: PayloadMap) -> Value {
    Value::Map(
        map.into_iter()
            .map(|(key, value)| (Value::String(key.into()), value))
            .collect(),
    )
}

fn validate_protocol_version(raw: &MessageEnvelope) -> Result<(), EnvelopeError> {
    let version = parse_string(raw.get(PROTOCOL_VERSION_KEY), PROTOCOL_VERSION_KEY)?;
    if version != PROTOCOL_VERSION {
        return Err(EnvelopeError::UnsupportedProtocolVersion { actual: version });
    }
    Ok(())
}

fn parse_i64(value: Option<&Value>, field: &'static str) -> Result<i64, EnvelopeError> {
    let value = value.ok_or(EnvelopeError::MissingField { field })?;
    value.as_i64().ok_or(EnvelopeError::InvalidFieldType {
        field,
        expected: "int",
    })
}

pub(crate) fn parse_string(value: Option<&Value>, field: &'static str) -> Result<String, EnvelopeError> {
    let value = value.ok_or(EnvelopeError::MissingField { field })?;
    value
        .as_str()
        .map(str::to_owned)
        .ok_or(EnvelopeError::InvalidFieldType {
            field,
            expected: "string",
        })
}

fn parse_optional_string(
    value: Option<&Value>,
    field: &'static str,
) -> Result<Option<String>, EnvelopeError> {
    match value {
        None | Some(Value::Nil) => Ok(None),
        Some(value) => parse_string(Some(value), field).map(Some),
    }
}

fn parse_map(value: Option<&Value>, field: &'static str) -> Result<PayloadMap, EnvelopeError> {
    let value = value.ok_or(EnvelopeError::MissingField { field })?;
    let Value::Map(entries) = value else {
        return Err(EnvelopeError::InvalidFieldType {
            field,
            expected: "map",
        });
    };

    let mut map = PayloadMap::new();
    for (key, value) in entries {
        let Some(text) = key.as_str() else {
            return Err(EnvelopeError::MapKeyMustBeUtf8String { field });
        };
        map.insert(text.to_owned(), value.clone());
    }

    Ok(map)
}

#[cfg(test)]
mod tests {
    use rmpv::Value;

    use crate::wire::codec::{CodecConfig, MessageEnvelope, WireCodec};

    use super::{
        map_value, AckEnvelope, ClientAddress, Connection, ContentQueryEnvelope, EntityError,
        EnvelopeError, PayloadMap, RequestEnvelope, RequestParams, RequestType, ResponseEntity,
        ResponseEnvelope, ServerTag, StatusCode, ACK_SERVER_ADDRESS_KEY, CONNECTION_KEY,
        ENTITY_BODY_KEY, ENTITY_ERROR_KEY, PROTOCOL_VERSION_KEY, REQUEST_PARAMS_KEY,
        SENDER_IDENTITY_KEY, TYPE_KEY, URI_PATH_KEY,
    };

    fn location_request() -> RequestEnvelope {
        RequestEnvelope::new(
            Some(ClientAddress::new("c0ffee").expect("address should be valid")),
            "com.example.maps",
            RequestType::Simple,
            RequestParams::new("RequestLocationUpdates").with_arg("min_time_ms", 250_u64),
        )
        .with_reason("show you on the map")
    }

    fn body_of(raw: &mut MessageEnvelope) -> Vec<(Value, Value)> {
        match raw.remove(ENTITY_BODY_KEY) {
            Some(Value::Map(entries)) => entries,
            other => panic!("entity body should be a map, got {other:?}"),
        }
    }

    #[test]
    fn request_survives_encode_and_decode() {
        let codec = WireCodec::new(CodecConfig::default());
        let request = location_request();

        let bytes = request.encode(&codec).expect("request should encode");
        let decoded = RequestEnvelope::decode(&codec, &bytes).expect("request should decode");

        assert_eq!(decoded, request);
        assert_eq!(decoded.params.arg_u64("min_time_ms"), Some(250));
    }

    #[test]
    fn fire_and_forget_request_has_no_client_address() {
        let mut request = location_request();
        request.client_address = None;
        request.reason = None;

        let decoded =
            RequestEnvelope::from_raw(&request.clone().into_raw()).expect("request should parse");
        assert!(decoded.client_address.is_none());
        assert!(decoded.reason.is_none());
    }

    #[test]
    fn each_missing_required_field_is_a_protocol_error() {
        let mut raw = location_request().into_raw();
        raw.remove(PROTOCOL_VERSION_KEY);
        assert!(matches!(
            RequestEnvelope::from_raw(&raw),
            Err(EnvelopeError::MissingField {
                field: PROTOCOL_VERSION_KEY
            })
        ));

        let mut raw = location_request().into_raw();
        raw.remove(ENTITY_BODY_KEY);
        assert!(matches!(
            RequestEnvelope::from_raw(&raw),
            Err(EnvelopeError::MissingField {
                field: ENTITY_BODY_KEY
            })
        ));

        for required in [SENDER_IDENTITY_KEY, TYPE_KEY, REQUEST_PARAMS_KEY] {
            let mut raw = location_request().into_raw();
            let body: Vec<(Value, Value)> = body_of(&mut raw)
                .into_iter()
                .filter(|(key, _)| key.as_str() != Some(required))
                .collect();
            raw.insert(ENTITY_BODY_KEY.to_owned(), Value::Map(body));

            let err = RequestEnvelope::from_raw(&raw).expect_err("missing field should fail");
            assert!(
                matches!(err, EnvelopeError::MissingField { field } if field == required),
                "unexpected error for {required}: {err}"
            );
        }
    }

    #[test]
    fn rejects_missing_op_code_other_versions_and_unknown_types() {
        let mut raw = location_request().into_raw();
        let mut body: PayloadMap = body_of(&mut raw)
            .into_iter()
            .map(|(key, value)| (key.as_str().unwrap_or_default().to_owned(), value))
            .collect();
        body.insert(REQUEST_PARAMS_KEY.to_owned(), map_value(PayloadMap::new()));
        raw.insert(ENTITY_BODY_KEY.to_owned(), map_value(body.clone()));
        assert!(matches!(
            RequestEnvelope::from_raw(&raw),
            Err(EnvelopeError::MissingField { field: "Op-Code" })
        ));

        let mut raw = location_request().into_raw();
        raw.insert(
            PROTOCOL_VERSION_KEY.to_owned(),
            Value::String("PPP/0.2".into()),
        );
        assert!(matches!(
            RequestEnvelope::from_raw(&raw),
            Err(EnvelopeError::UnsupportedProtocolVersion { .. })
        ));

        body.insert(TYPE_KEY.to_owned(), Value::String("Broadcast".into()));
        body.insert(
            REQUEST_PARAMS_KEY.to_owned(),
            RequestParams::new("Query").into_value(),
        );
        let mut raw = location_request().into_raw();
        raw.insert(ENTITY_BODY_KEY.to_owned(), map_value(body));
        let err = RequestEnvelope::from_raw(&raw).expect_err("unknown type should fail");
        assert!(matches!(err, EnvelopeError::UnknownRequestType { .. }));
        assert_eq!(err.to_entity_error().code, "BadRequest");
    }

    #[test]
    fn peeks_client_address_from_malformed_request() {
        let mut raw = location_request().into_raw();
        raw.remove(ENTITY_BODY_KEY);

        assert_eq!(
            RequestEnvelope::peek_client_address(&raw).map(|addr| addr.to_string()),
            Some("c0ffee".to_owned())
        );
        assert!(ClientAddress::new("  ").is_err());
    }

    #[test]
    fn generated_addresses_are_long_and_distinct() {
        let first = ClientAddress::generate();
        let second = ClientAddress::generate();
        assert_ne!(first, second);
        assert_eq!(first.as_str().len(), 32);
    }

    #[test]
    fn response_constructors_keep_body_error_exclusive() {
        let stream = ResponseEnvelope::stream_authorized();
        assert_eq!(stream.status(), StatusCode::Ok);
        assert_eq!(stream.connection(), Connection::KeepOpen);
        assert_eq!(stream.entity(), &ResponseEntity::None);
        assert!(!stream.clone().into_raw().contains_key(CONNECTION_KEY));

        let denied = ResponseEnvelope::failure(
            StatusCode::Forbidden,
            ServerTag::AuthorizationService,
            EntityError::new("AuthorizationDenied", "user said no"),
        );
        let raw = denied.clone().into_raw();
        assert!(raw.contains_key(ENTITY_ERROR_KEY));
        assert!(!raw.contains_key(ENTITY_BODY_KEY));
        assert_eq!(
            raw.get(CONNECTION_KEY),
            Some(&Value::String("Close".into()))
        );
        assert_eq!(ResponseEnvelope::from_raw(&raw).expect("parse"), denied);

        let resource =
            ResponseEnvelope::resource(ServerTag::LocationService, PayloadMap::new(), "ack-1");
        let raw = resource.clone().into_raw();
        assert!(!raw.contains_key(ENTITY_ERROR_KEY));
        assert_eq!(
            resource
                .body()
                .and_then(|body| body.get(ACK_SERVER_ADDRESS_KEY)),
            Some(&Value::String("ack-1".into()))
        );
        assert_eq!(ResponseEnvelope::from_raw(&raw).expect("parse"), resource);
    }

    #[test]
    fn content_authorization_carries_only_uri_path() {
        let response = ResponseEnvelope::content_authorized("content://authority/n0nce");
        let body = response.body().expect("content response has a body");

        assert_eq!(body.len(), 1);
        assert_eq!(
            body.get(URI_PATH_KEY),
            Some(&Value::String("content://authority/n0nce".into()))
        );
        assert!(response.is_close());
        assert_eq!(response.server(), ServerTag::AuthorizationService);
    }

    #[test]
    fn ack_and_content_query_parse_required_fields() {
        let ack = AckEnvelope {
            client_address: ClientAddress::new("c1").expect("address should be valid"),
            ack_server_address: "srv".to_owned(),
        };
        assert_eq!(
            AckEnvelope::from_raw(&ack.clone().into_raw()).expect("ack should parse"),
            ack
        );

        let mut raw = ack.into_raw();
        raw.remove(ACK_SERVER_ADDRESS_KEY);
        assert!(matches!(
            AckEnvelope::from_raw(&raw),
            Err(EnvelopeError::MissingField { .. })
        ));

        let query = ContentQueryEnvelope {
            uri_path: "n0nce".to_owned(),
        };
        assert_eq!(
            ContentQueryEnvelope::from_raw(&query.clone().into_raw()).expect("query should parse"),
            query
        );
        let empty = ContentQueryEnvelope {
            uri_path: String::new(),
        };
        assert!(matches!(
            ContentQueryEnvelope::from_raw(&empty.into_raw()),
            Err(EnvelopeError::EmptyField { .. })
        ));
    }
}
