use std::collections::BTreeMap;
use std::fmt;
use std::io::Cursor;

use rmpv::{Integer, Value};

use crate::config::AppConfig;

pub const FRAME_HEADER_SIZE_BYTES: usize = 4;
pub const DEFAULT_MAX_ENVELOPE_SIZE_BYTES: usize = 1024 * 1024;
pub const HARD_MAX_ENVELOPE_SIZE_BYTES: usize = 16 * 1024 * 1024;

pub type MessageEnvelope = BTreeMap<String, Value>;

#[derive(Debug)]
pub enum CodecError {
    InvalidConfiguredLimit { configured: usize, hard_max: usize },
    PayloadTooLarge { size: usize, limit: usize },
    FrameTooShort { size: usize },
    FrameLengthMismatch { declared: usize, actual_payload: usize },
    ProtocolZeroLength,
    ProtocolLengthTooLarge { length: usize, limit: usize },
    MessagePackEncode(rmpv::encode::Error),
    MessagePackDecode(rmpv::decode::Error),
    TrailingDataInPayload,
    EnvelopeMustBeMap,
    MapKeyMustBeUtf8String,
    ExtensionTypeNotAllowed,
    IntegerOutOfRange,
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidConfiguredLimit {
                configured,
                hard_max,
            } => write!(
                f,
                "wire.max_envelope_size_bytes must be between 1 and {hard_max}, got {configured}"
            ),
            Self::PayloadTooLarge { size, limit } => {
                write!(f, "payload size {size} exceeds limit {limit}")
            }
            Self::FrameTooShort { size } => {
                write!(f, "frame size {size} is smaller than 4-byte header")
            }
            Self::FrameLengthMismatch {
                declared,
                actual_payload,
            } => write!(
                f,
                "frame length mismatch: declared {declared} bytes, actual payload {actual_payload} bytes"
            ),
            Self::ProtocolZeroLength => {
                write!(f, "protocol error: frame length cannot be zero")
            }
            Self::ProtocolLengthTooLarge { length, limit } => write!(
                f,
                "protocol error: frame length {length} exceeds max {limit}"
            ),
            Self::MessagePackEncode(source) => write!(f, "messagepack encode error: {source}"),
            Self::MessagePackDecode(source) => write!(f, "messagepack decode error: {source}"),
            Self::TrailingDataInPayload => write!(f, "payload contains trailing MessagePack data"),
            Self::EnvelopeMustBeMap => write!(f, "message envelope must be a map"),
            Self::MapKeyMustBeUtf8String => write!(f, "map keys must be UTF-8 strings"),
            Self::ExtensionTypeNotAllowed => {
                write!(f, "MessagePack extension values are not allowed")
            }
            Self::IntegerOutOfRange => write!(f, "integer value must fit in signed int64"),
        }
    }
}

impl std::error::Error for CodecError {}

#[derive(Clone, Copy, Debug)]
pub struct CodecConfig {
    pub max_envelope_size_bytes: usize,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            max_envelope_size_bytes: DEFAULT_MAX_ENVELOPE_SIZE_BYTES,
        }
    }
}

/// Length-prefixed MessagePack codec: `u32` big-endian payload length, then one map.
#[derive(Clone, Copy, Debug)]
pub struct WireCodec {
    max_envelope_size_bytes: usize,
}

impl WireCodec {
    pub fn new(config: CodecConfig) -> Self {
        Self {
            max_envelope_size_bytes: config.max_envelope_size_bytes,
        }
    }

    pub fn from_app_config(app_config: &AppConfig) -> Result<Self, CodecError> {
        let configured = app_config.wire.max_envelope_size_bytes;
        if configured == 0 || configured > HARD_MAX_ENVELOPE_SIZE_BYTES {
            return Err(CodecError::InvalidConfiguredLimit {
                configured,
                hard_max: HARD_MAX_ENVELOPE_SIZE_BYTES,
            });
        }

        Ok(Self::new(CodecConfig {
            max_envelope_size_bytes: configured,
        }))
    }

    pub fn max_envelope_size_bytes(&self) -> usize {
        self.max_envelope_size_bytes
    }

    pub fn encode_frame(&self, envelope: &MessageEnvelope) -> Result<Vec<u8>, CodecError> {
        let payload = self.encode_payload(envelope)?;

        let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE_BYTES + payload.len());
        let len = payload.len() as u32;
        frame.extend_from_slice(&len.to_be_bytes());
        frame.extend_from_slice(&payload);
        Ok(frame)
    }

    pub fn decode_frame(&self, frame: &[u8]) -> Result<MessageEnvelope, CodecError> {
        if frame.len() < FRAME_HEADER_SIZE_BYTES {
            return Err(CodecError::FrameTooShort { size: frame.len() });
        }

        let declared_len = self.declared_length(frame)?;
        let payload = &frame[FRAME_HEADER_SIZE_BYTES..];
        if payload.len() != declared_len {
            return Err(CodecError::FrameLengthMismatch {
                declared: declared_len,
                actual_payload: payload.len(),
            });
        }

        self.decode_payload(payload)
    }

    pub fn encode_payload(&self, envelope: &MessageEnvelope) -> Result<Vec<u8>, CodecError> {
        let mut map_pairs = Vec::with_capacity(envelope.len());

        for (key, value) in envelope {
            validate_value(value)?;
            map_pairs.push((Value::String(key.as_str().into()), value.clone()));
        }

        let mut encoded = Vec::new();
        rmpv::encode::write_value(&mut encoded, &Value::Map(map_pairs))
            .map_err(CodecError::MessagePackEncode)?;

        if encoded.len() > self.max_envelope_size_bytes {
            return Err(CodecError::PayloadTooLarge {
                size: encoded.len(),
                limit: self.max_envelope_size_bytes,
            });
        }

        Ok(encoded)
    }

    pub fn decode_payload(&self, payload: &[u8]) -> Result<MessageEnvelope, CodecError> {
        if payload.is_empty() {
            return Err(CodecError::ProtocolZeroLength);
        }
        if payload.len() > self.max_envelope_size_bytes {
            return Err(CodecError::PayloadTooLarge {
                size: payload.len(),
                limit: self.max_envelope_size_bytes,
            });
        }

        let mut cursor = Cursor::new(payload);
        let value = rmpv::decode::read_value(&mut cursor).map_err(CodecError::MessagePackDecode)?;
        if cursor.position() as usize != payload.len() {
            return Err(CodecError::TrailingDataInPayload);
        }

        parse_envelope(value)
    }

    fn declared_length(&self, header: &[u8]) -> Result<usize, CodecError> {
        let declared_len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
        if declared_len == 0 {
            return Err(CodecError::ProtocolZeroLength);
        }
        if declared_len > self.max_envelope_size_bytes {
            return Err(CodecError::ProtocolLengthTooLarge {
                length: declared_len,
                limit: self.max_envelope_size_bytes,
            });
        }
        Ok(declared_len)
    }
}

/// Reassembles complete frames from a byte stream that may split or coalesce them.
#[derive(Debug, Default)]
pub struct FrameAccumulator {
    buffer: Vec<u8>,
}

impl FrameAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Returns the next complete frame (header included), `Ok(None)` while incomplete.
    ///
    /// A header declaring an invalid length is an unrecoverable stream error; the caller is
    /// expected to drop the connection.
    pub fn next_frame(&mut self, codec: &WireCodec) -> Result<Option<Vec<u8>>, CodecError> {
        if self.buffer.len() < FRAME_HEADER_SIZE_BYTES {
            return Ok(None);
        }

        let declared_len = codec.declared_length(&self.buffer)?;
        let total = FRAME_HEADER_SIZE_BYTES + declared_len;
        if self.buffer.len() < total {
            return Ok(None);
        }

        let rest = self.buffer.split_off(total);
        let frame = std::mem::replace(&mut self.buffer, rest);
        Ok(Some(frame))
    }
}

fn parse_envelope(value: Value) -> Result<MessageEnvelope, CodecError> {
    let Value::Map(entries) = value else {
        return Err(CodecError::EnvelopeMustBeMap);
    };

    let mut envelope = MessageEnvelope::new();
    for (key, value) in entries {
        let key = parse_key(&key)?;
        validate_value(&value)?;
        envelope.insert(key, value);
    }

    Ok(envelope)
}

fn parse_key(key: &Value) -> Result<String, CodecError> {
    match key.as_str() {
        Some(text) => Ok(text.to_owned()),
        None => Err(CodecError::MapKeyMustBeUtf8String),
    }
}

// Floats are allowed: location samples carry coordinates.
fn validate_value(value: &Value) -> Result<(), CodecError> {
    match value {
        Value::Nil
        | Value::Boolean(_)
        | Value::String(_)
        | Value::Binary(_)
        | Value::F32(_)
        | Value::F64(_) => Ok(()),
        Value::Integer(number) => validate_integer(number),
        Value::Array(values) => values.iter().try_for_each(validate_value),
        Value::Map(entries) => {
            for (key, value) in entries {
                parse_key(key)?;
                validate_value(value)?;
            }
            Ok(())
        }
        Value::Ext(_, _) => Err(CodecError::ExtensionTypeNotAllowed),
    }
}

fn validate_integer(number: &Integer) -> Result<(), CodecError> {
    if number.as_i64().is_some() {
        return Ok(());
    }

    match number.as_u64() {
        Some(value) if value <= i64::MAX as u64 => Ok(()),
        _ => Err(CodecError::IntegerOutOfRange),
    }
}

/// Renders a MessagePack value as JSON for log payloads. Binary becomes a byte array.
pub fn rmpv_value_to_json(value: &Value) -> serde_json::Value {
    match value {
        Value::Nil => serde_json::Value::Null,
        Value::Boolean(v) => serde_json::Value::Bool(*v),
        Value::Integer(v) => match (v.as_i64(), v.as_u64()) {
            (Some(raw), _) => serde_json::json!(raw),
            (None, Some(raw)) => serde_json::json!(raw),
            (None, None) => serde_json::Value::Null,
        },
        Value::F32(v) => serde_json::json!(v),
        Value::F64(v) => serde_json::json!(v),
        Value::String(v) => serde_json::json!(v.as_str().unwrap_or_default()),
        Value::Binary(v) => serde_json::json!(v),
        Value::Array(values) => {
            serde_json::Value::Array(values.iter().map(rmpv_value_to_json).collect())
        }
        Value::Map(entries) => {
            let mut map = serde_json::Map::new();
            for (key, value) in entries {
                let key = key
                    .as_str()
                    .map(str::to_owned)
                    .unwrap_or_else(|| key.to_string());
                map.insert(key, rmpv_value_to_json(value));
            }
            serde_json::Value::Object(map)
        }
        Value::Ext(_, _) => serde_json::Value::Null,
    }
}

#[cfg(test)]
mod tests {
    use rmpv::Value;
    use serde_json::json;

    use crate::config::AppConfig;

    use super::{
        rmpv_value_to_json, CodecConfig, CodecError, FrameAccumulator, MessageEnvelope, WireCodec,
        FRAME_HEADER_SIZE_BYTES,
    };

    fn codec() -> WireCodec {
        WireCodec::new(CodecConfig::default())
    }

    fn sample_envelope() -> MessageEnvelope {
        let mut envelope = MessageEnvelope::new();
        envelope.insert("Route".to_owned(), Value::String("Request".into()));
        envelope.insert("Protocol-Version".to_owned(), Value::String("PPP/0.1".into()));
        envelope.insert("Latitude".to_owned(), Value::F64(52.2297));
        envelope.insert("Count".to_owned(), Value::from(42_i64));
        envelope
    }

    #[test]
    fn frame_encode_decode_keeps_floats_and_strings() {
        let frame = codec()
            .encode_frame(&sample_envelope())
            .expect("frame should encode");
        let decoded = codec().decode_frame(&frame).expect("frame should decode");

        assert_eq!(decoded, sample_envelope());
    }

    #[test]
    fn rejects_extension_values_and_oversized_unsigned_integers() {
        let mut envelope = MessageEnvelope::new();
        envelope.insert("ext".to_owned(), Value::Ext(1, vec![1, 2, 3]));
        assert!(matches!(
            codec().encode_frame(&envelope),
            Err(CodecError::ExtensionTypeNotAllowed)
        ));

        let mut envelope = MessageEnvelope::new();
        envelope.insert(
            "tooBig".to_owned(),
            Value::Integer((i64::MAX as u64 + 1).into()),
        );
        assert!(matches!(
            codec().encode_frame(&envelope),
            Err(CodecError::IntegerOutOfRange)
        ));
    }

    #[test]
    fn rejects_zero_length_and_oversized_frames() {
        let small = WireCodec::new(CodecConfig {
            max_envelope_size_bytes: 16,
        });

        assert!(matches!(
            small.decode_frame(&[0, 0, 0, 0]),
            Err(CodecError::ProtocolZeroLength)
        ));
        assert!(matches!(
            small.decode_frame(&17_u32.to_be_bytes()),
            Err(CodecError::ProtocolLengthTooLarge { length: 17, .. })
        ));

        let mut envelope = MessageEnvelope::new();
        envelope.insert("blob".to_owned(), Value::Binary(vec![0x41; 32]));
        assert!(matches!(
            small.encode_frame(&envelope),
            Err(CodecError::PayloadTooLarge { .. })
        ));
    }

    #[test]
    fn rejects_non_string_keys_and_trailing_data() {
        let value = Value::Map(vec![(Value::from(1_i64), Value::String("x".into()))]);
        let mut payload = Vec::new();
        rmpv::encode::write_value(&mut payload, &value).expect("test payload should encode");
        assert!(matches!(
            codec().decode_payload(&payload),
            Err(CodecError::MapKeyMustBeUtf8String)
        ));

        let mut payload = Vec::new();
        rmpv::encode::write_value(&mut payload, &Value::Map(vec![]))
            .expect("first object should encode");
        rmpv::encode::write_value(&mut payload, &Value::Nil).expect("second object should encode");
        assert!(matches!(
            codec().decode_payload(&payload),
            Err(CodecError::TrailingDataInPayload)
        ));
    }

    #[test]
    fn configured_limit_is_validated() {
        let mut app_config = AppConfig::default();
        app_config.wire.max_envelope_size_bytes = 0;
        assert!(matches!(
            WireCodec::from_app_config(&app_config),
            Err(CodecError::InvalidConfiguredLimit { .. })
        ));

        app_config.wire.max_envelope_size_bytes = 4096;
        let codec = WireCodec::from_app_config(&app_config).expect("limit should be accepted");
        assert_eq!(codec.max_envelope_size_bytes(), 4096);
    }

    #[test]
    fn accumulator_splits_coalesced_and_partial_frames() {
        let codec = codec();
        let first = codec
            .encode_frame(&sample_envelope())
            .expect("first frame should encode");
        let mut second_envelope = MessageEnvelope::new();
        second_envelope.insert("Route".to_owned(), Value::String("Ack".into()));
        let second = codec
            .encode_frame(&second_envelope)
            .expect("second frame should encode");

        let mut stream = first.clone();
        stream.extend_from_slice(&second);
        let split_at = first.len() + FRAME_HEADER_SIZE_BYTES + 1;

        let mut accumulator = FrameAccumulator::new();
        accumulator.push(&stream[..2]);
        assert!(accumulator.next_frame(&codec).expect("partial header is fine").is_none());
        accumulator.push(&stream[2..split_at]);

        let frame = accumulator
            .next_frame(&codec)
            .expect("first frame should parse")
            .expect("first frame should be complete");
        assert_eq!(frame, first);
        assert!(accumulator.next_frame(&codec).expect("partial is fine").is_none());

        accumulator.push(&stream[split_at..]);
        let frame = accumulator
            .next_frame(&codec)
            .expect("second frame should parse")
            .expect("second frame should be complete");
        assert_eq!(frame, second);
        assert_eq!(accumulator.buffered_len(), 0);
    }

    #[test]
    fn accumulator_reports_invalid_declared_length() {
        let codec = WireCodec::new(CodecConfig {
            max_envelope_size_bytes: 8,
        });
        let mut accumulator = FrameAccumulator::new();
        accumulator.push(&1024_u32.to_be_bytes());

        assert!(matches!(
            accumulator.next_frame(&codec),
            Err(CodecError::ProtocolLengthTooLarge { .. })
        ));
    }

    #[test]
    fn renders_messagepack_values_as_json() {
        let value = Value::Map(vec![
            (Value::String("Op-Code".into()), Value::String("Query".into())),
            (
                Value::String("Args".into()),
                Value::Map(vec![(Value::String("min_time_ms".into()), Value::from(250_i64))]),
            ),
            (Value::String("Blob".into()), Value::Binary(vec![1, 2])),
        ]);

        assert_eq!(
            rmpv_value_to_json(&value),
            json!({"Op-Code":"Query","Args":{"min_time_ms":250},"Blob":[1,2]})
        );
    }
}
