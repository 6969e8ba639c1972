// AWS binary event-stream codec.
//
// Frame layout: 4-byte big-endian total length, 4-byte big-endian headers
// length, 4-byte prelude CRC, headers, payload, 4-byte message CRC.
// Each header is {1-byte name length, name, 1-byte value type, 2-byte
// big-endian value length, value}; value type 7 is a UTF-8 string, every
// other type is carried as opaque bytes.
//
// CRC validation is advisory: the upstream occasionally emits frames with
// stale checksums, so a mismatch is logged and decoding continues.

use serde_json::Value;

/// Header value type tag for UTF-8 strings.
pub const HEADER_TYPE_STRING: u8 = 7;

/// Event type used when a frame carries no `:event-type` header.
pub const DEFAULT_EVENT_TYPE: &str = "assistantResponseEvent";

const PRELUDE_LEN: usize = 12;
const MIN_FRAME_LEN: usize = PRELUDE_LEN + 4;

// ============================================================================
// Frame model
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderValue {
    String(String),
    /// Non-string header values are parsed but not interpreted.
    Opaque { value_type: u8, bytes: Vec<u8> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventHeader {
    pub name: String,
    pub value: HeaderValue,
}

impl EventHeader {
    pub fn string(name: impl Into<String>, value: impl Into<String>) -> Self {
        EventHeader {
            name: name.into(),
            value: HeaderValue::String(value.into()),
        }
    }
}

/// A decoded wire frame: headers plus raw payload bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub headers: Vec<EventHeader>,
    pub payload: Vec<u8>,
}

impl Frame {
    /// The `:event-type` header, defaulting when absent.
    pub fn event_type(&self) -> &str {
        for header in &self.headers {
            if header.name == ":event-type" {
                if let HeaderValue::String(s) = &header.value {
                    return s;
                }
            }
        }
        DEFAULT_EVENT_TYPE
    }
}

/// A frame reduced to the pair the rest of the relay consumes.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedEvent {
    pub event_type: String,
    pub payload: Value,
}

/// Result of decoding a buffer. `corrupt` means a prelude advertised a
/// length beyond the remaining buffer (or the trailing bytes could not hold
/// a frame); the events decoded before that point are still returned.
#[derive(Debug, Clone, Default)]
pub struct DecodeOutcome {
    pub events: Vec<DecodedEvent>,
    pub corrupt: bool,
}

// ============================================================================
// Decoding
// ============================================================================

/// Decode every frame in `buf`. Stops at the first corrupt prelude and
/// returns the frames decoded so far together with a corruption flag.
pub fn decode_frames(buf: &[u8]) -> (Vec<Frame>, bool) {
    let mut frames = Vec::new();
    let mut offset = 0usize;

    while offset < buf.len() {
        let remaining = &buf[offset..];
        if remaining.len() < MIN_FRAME_LEN {
            // Trailing bytes too short for a prelude: truncated stream.
            return (frames, true);
        }

        let total_len = read_u32(&remaining[0..4]) as usize;
        let headers_len = read_u32(&remaining[4..8]) as usize;
        let prelude_crc = read_u32(&remaining[8..12]);

        if total_len < MIN_FRAME_LEN
            || total_len > remaining.len()
            || headers_len > total_len - MIN_FRAME_LEN
        {
            return (frames, true);
        }

        let computed_prelude = crc32(&remaining[0..8]);
        if computed_prelude != prelude_crc {
            log::debug!(
                "event-stream prelude CRC mismatch at offset {} (got {:#010x}, computed {:#010x})",
                offset,
                prelude_crc,
                computed_prelude
            );
        }

        let headers_end = PRELUDE_LEN + headers_len;
        let payload_end = total_len - 4;
        let headers = match parse_headers(&remaining[PRELUDE_LEN..headers_end]) {
            Some(h) => h,
            None => return (frames, true),
        };
        let payload = remaining[headers_end..payload_end].to_vec();

        let message_crc = read_u32(&remaining[payload_end..total_len]);
        let computed_message = crc32(&remaining[0..payload_end]);
        if computed_message != message_crc {
            log::debug!(
                "event-stream message CRC mismatch at offset {} (got {:#010x}, computed {:#010x})",
                offset,
                message_crc,
                computed_message
            );
        }

        frames.push(Frame { headers, payload });
        offset += total_len;
    }

    (frames, false)
}

/// Decode a buffer into `(event_type, payload)` pairs. Payloads are parsed
/// as JSON when possible, otherwise carried as `{"text": raw}`.
pub fn decode_events(buf: &[u8]) -> DecodeOutcome {
    let (frames, corrupt) = decode_frames(buf);
    let events = frames
        .into_iter()
        .map(|frame| {
            let payload = match serde_json::from_slice::<Value>(&frame.payload) {
                Ok(value) => value,
                Err(_) => serde_json::json!({
                    "text": String::from_utf8_lossy(&frame.payload).into_owned(),
                }),
            };
            DecodedEvent {
                event_type: frame.event_type().to_string(),
                payload,
            }
        })
        .collect();
    DecodeOutcome { events, corrupt }
}

fn parse_headers(mut buf: &[u8]) -> Option<Vec<EventHeader>> {
    let mut headers = Vec::new();
    while !buf.is_empty() {
        let name_len = *buf.first()? as usize;
        if buf.len() < 1 + name_len + 3 {
            return None;
        }
        let name = String::from_utf8_lossy(&buf[1..1 + name_len]).into_owned();
        let value_type = buf[1 + name_len];
        let value_len = u16::from_be_bytes([buf[2 + name_len], buf[3 + name_len]]) as usize;
        let value_start = 4 + name_len;
        if buf.len() < value_start + value_len {
            return None;
        }
        let value_bytes = &buf[value_start..value_start + value_len];
        let value = if value_type == HEADER_TYPE_STRING {
            HeaderValue::String(String::from_utf8_lossy(value_bytes).into_owned())
        } else {
            HeaderValue::Opaque {
                value_type,
                bytes: value_bytes.to_vec(),
            }
        };
        headers.push(EventHeader { name, value });
        buf = &buf[value_start + value_len..];
    }
    Some(headers)
}

// ============================================================================
// Encoding
// ============================================================================

/// Encode a single frame with valid CRCs. Used to build fixtures and by the
/// round-trip tests; the relay itself only decodes.
pub fn encode_frame(headers: &[EventHeader], payload: &[u8]) -> Vec<u8> {
    let mut header_bytes = Vec::new();
    for header in headers {
        let (value_type, value_bytes): (u8, &[u8]) = match &header.value {
            HeaderValue::String(s) => (HEADER_TYPE_STRING, s.as_bytes()),
            HeaderValue::Opaque { value_type, bytes } => (*value_type, bytes.as_slice()),
        };
        header_bytes.push(header.name.len() as u8);
        header_bytes.extend_from_slice(header.name.as_bytes());
        header_bytes.push(value_type);
        header_bytes.extend_from_slice(&(value_bytes.len() as u16).to_be_bytes());
        header_bytes.extend_from_slice(value_bytes);
    }

    let total_len = (MIN_FRAME_LEN + header_bytes.len() + payload.len()) as u32;
    let mut out = Vec::with_capacity(total_len as usize);
    out.extend_from_slice(&total_len.to_be_bytes());
    out.extend_from_slice(&(header_bytes.len() as u32).to_be_bytes());
    let prelude_crc = crc32(&out);
    out.extend_from_slice(&prelude_crc.to_be_bytes());
    out.extend_from_slice(&header_bytes);
    out.extend_from_slice(payload);
    let message_crc = crc32(&out);
    out.extend_from_slice(&message_crc.to_be_bytes());
    out
}

/// Encode an event with the conventional `:event-type` and JSON payload
/// headers.
pub fn encode_event(event_type: &str, payload: &Value) -> Vec<u8> {
    let headers = vec![
        EventHeader::string(":event-type", event_type),
        EventHeader::string(":content-type", "application/json"),
        EventHeader::string(":message-type", "event"),
    ];
    let body = serde_json::to_vec(payload).unwrap_or_default();
    encode_frame(&headers, &body)
}

// ============================================================================
// CRC32 (IEEE), bitwise
// ============================================================================

fn crc32(data: &[u8]) -> u32 {
    let mut crc = 0xFFFF_FFFFu32;
    for &byte in data {
        crc ^= byte as u32;
        for _ in 0..8 {
            let mask = (crc & 1).wrapping_neg();
            crc = (crc >> 1) ^ (0xEDB8_8320 & mask);
        }
    }
    !crc
}

fn read_u32(buf: &[u8]) -> u32 {
    u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]])
}
