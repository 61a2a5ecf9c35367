//! JSON frames exchanged over the robot data channel.
//!
//! Each frame is one UTF-8 JSON object `{ "topic"?, "type", "data"? }`.
//! The `type` field selects a [`MessageKind`]; frames whose type is not in
//! the closed set are rejected by [`Frame::parse`] and never dispatched.

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Closed set of message kinds understood by the firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    /// Challenge/response exchange before the session is authorized.
    #[serde(rename = "validation")]
    Validation,
    /// Subscribe to a topic stream.
    #[serde(rename = "subscribe")]
    Subscribe,
    /// Unsubscribe from a topic stream.
    #[serde(rename = "unsubscribe")]
    Unsubscribe,
    /// Generic topic message.
    #[serde(rename = "msg")]
    Msg,
    /// Request.
    #[serde(rename = "req")]
    Req,
    /// Response.
    #[serde(rename = "res")]
    Res,
    /// Video control.
    #[serde(rename = "vid")]
    Video,
    /// Audio control.
    #[serde(rename = "aud")]
    Audio,
    /// Error report.
    #[serde(rename = "err")]
    Error,
    /// Keepalive.
    #[serde(rename = "heartbeat")]
    Heartbeat,
    /// Transport-internal request.
    #[serde(rename = "rtc_inner_req")]
    InnerRequest,
    /// Transport report.
    #[serde(rename = "rtc_report")]
    Report,
    /// An error was raised on the robot.
    #[serde(rename = "add_error")]
    AddError,
    /// An error was cleared on the robot.
    #[serde(rename = "rm_error")]
    RemoveError,
    /// Full error list.
    #[serde(rename = "errors")]
    Errors,
}

impl MessageKind {
    /// Every kind, in wire-table order.
    pub const ALL: [Self; 15] = [
        Self::Validation,
        Self::Subscribe,
        Self::Unsubscribe,
        Self::Msg,
        Self::Req,
        Self::Res,
        Self::Video,
        Self::Audio,
        Self::Error,
        Self::Heartbeat,
        Self::InnerRequest,
        Self::Report,
        Self::AddError,
        Self::RemoveError,
        Self::Errors,
    ];

    /// The literal `type` string used on the wire.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::Subscribe => "subscribe",
            Self::Unsubscribe => "unsubscribe",
            Self::Msg => "msg",
            Self::Req => "req",
            Self::Res => "res",
            Self::Video => "vid",
            Self::Audio => "aud",
            Self::Error => "err",
            Self::Heartbeat => "heartbeat",
            Self::InnerRequest => "rtc_inner_req",
            Self::Report => "rtc_report",
            Self::AddError => "add_error",
            Self::RemoveError => "rm_error",
            Self::Errors => "errors",
        }
    }

    /// Looks up a kind by its wire string.
    ///
    /// # Examples
    ///
    /// ```
    /// use qlink_common::frame::MessageKind;
    ///
    /// assert_eq!(MessageKind::from_wire("vid"), Some(MessageKind::Video));
    /// assert_eq!(MessageKind::from_wire("video"), None);
    /// ```
    #[must_use]
    pub fn from_wire(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == s)
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `header.identity` of a request payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    /// Correlation id echoed back in the response.
    pub id: u32,
    /// Command code from the catalogue.
    #[serde(rename = "api_id", default, skip_serializing_if = "Option::is_none")]
    pub command_code: Option<u32>,
    /// Identity fields this crate does not interpret, kept for the wire.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// `header` of a request payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestHeader {
    /// Request identity.
    pub identity: Identity,
    /// Other header members (`policy`, ...), kept for the wire.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Payload of a request/response style command.
///
/// `parameter` is always a string on the wire: structured parameters are
/// JSON-encoded before they get here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestPayload {
    /// Request header carrying the identity.
    pub header: RequestHeader,
    /// JSON-encoded parameters, or empty.
    pub parameter: String,
    /// Other payload members, kept for the wire.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// The `data` member of a frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Payload {
    /// Plain string payload (validation challenges, switch values).
    Text(String),
    /// Request payload with identity header and string parameter.
    Request(RequestPayload),
    /// Free-form JSON object.
    Map(Map<String, Value>),
    /// Any other JSON value (arrays from `errors`, numbers). Forwarded untouched.
    Other(Value),
}

impl Payload {
    /// Returns the nested `header.identity.id`, if present.
    #[must_use]
    pub fn correlation_id(&self) -> Option<u32> {
        match self {
            Self::Request(req) => Some(req.header.identity.id),
            Self::Map(map) => map
                .get("header")
                .and_then(|h| h.get("identity"))
                .and_then(|i| i.get("id"))
                .and_then(Value::as_u64)
                .and_then(|id| u32::try_from(id).ok()),
            Self::Text(_) | Self::Other(_) => None,
        }
    }

    /// Returns the payload as a string slice when it is a [`Payload::Text`].
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Converts the payload into a plain JSON value.
    #[must_use]
    pub fn into_value(self) -> Value {
        match self {
            Self::Text(s) => Value::String(s),
            Self::Map(m) => Value::Object(m),
            Self::Other(v) => v,
            Self::Request(req) => serde_json::to_value(req).unwrap_or(Value::Null),
        }
    }
}

/// Keepalive payload. Field names follow the firmware.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    /// UTC wall-clock time as `YYYY-MM-DD HH:MM:SS`.
    #[serde(rename = "timeInStr")]
    pub time_in_str: String,
    /// Seconds since the Unix epoch.
    #[serde(rename = "timeInNum")]
    pub time_in_num: i64,
}

impl Heartbeat {
    /// Builds the heartbeat payload for the given instant.
    ///
    /// # Examples
    ///
    /// ```
    /// use chrono::{TimeZone, Utc};
    /// use qlink_common::frame::Heartbeat;
    ///
    /// let hb = Heartbeat::at(Utc.with_ymd_and_hms(2024, 3, 9, 7, 5, 1).unwrap());
    /// assert_eq!(hb.time_in_str, "2024-03-09 07:05:01");
    /// assert_eq!(hb.time_in_num, 1_709_967_901);
    /// ```
    #[must_use]
    pub fn at(now: DateTime<Utc>) -> Self {
        Self {
            time_in_str: now.format("%Y-%m-%d %H:%M:%S").to_string(),
            time_in_num: now.timestamp(),
        }
    }
}

/// Errors raised while turning inbound text into a [`Frame`].
#[derive(Debug, Error)]
pub enum FrameError {
    /// The text is not a JSON frame object.
    #[error("malformed frame: {0}")]
    Json(#[from] serde_json::Error),
    /// The `type` field is not a known [`MessageKind`].
    #[error("unknown message type: {0}")]
    UnknownKind(String),
}

/// One message unit on the data channel.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Frame {
    /// Topic path, when the message is topic-scoped.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    /// Message kind (`type` on the wire).
    #[serde(rename = "type")]
    pub kind: MessageKind,
    /// Message payload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Payload>,
}

#[derive(Deserialize)]
struct WireFrame {
    #[serde(default)]
    topic: Option<String>,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Option<Payload>,
}

impl Frame {
    /// Creates a frame from its parts.
    #[must_use]
    pub fn new(kind: MessageKind, topic: Option<String>, data: Option<Payload>) -> Self {
        Self { topic, kind, data }
    }

    /// Creates a validation reply frame.
    #[must_use]
    pub fn validation(reply: String) -> Self {
        Self::new(MessageKind::Validation, None, Some(Payload::Text(reply)))
    }

    /// Creates a heartbeat frame for the given instant.
    #[must_use]
    pub fn heartbeat(now: DateTime<Utc>) -> Self {
        let data = match serde_json::to_value(Heartbeat::at(now)) {
            Ok(Value::Object(map)) => Some(Payload::Map(map)),
            _ => None,
        };
        Self::new(MessageKind::Heartbeat, None, data)
    }

    /// Creates a request frame carrying an identity header.
    ///
    /// `params` is JSON-encoded into the `parameter` string; `None` leaves
    /// it empty.
    ///
    /// # Examples
    ///
    /// ```
    /// use qlink_common::frame::{Frame, MessageKind};
    /// use serde_json::json;
    ///
    /// let frame = Frame::request("rt/api/vui/request", 7, Some(1007), Some(&json!({"time": 1})));
    /// assert_eq!(frame.kind, MessageKind::Msg);
    /// assert_eq!(frame.correlation_id(), Some(7));
    /// let wire = frame.to_json().unwrap();
    /// assert!(wire.contains(r#""parameter":"{\"time\":1}""#));
    /// ```
    #[must_use]
    pub fn request(topic: &str, id: u32, command_code: Option<u32>, params: Option<&Value>) -> Self {
        let parameter = params.map(Value::to_string).unwrap_or_default();
        let payload = RequestPayload {
            header: RequestHeader {
                identity: Identity {
                    id,
                    command_code,
                    extra: Map::new(),
                },
                extra: Map::new(),
            },
            parameter,
            extra: Map::new(),
        };
        Self::new(
            MessageKind::Msg,
            Some(topic.to_string()),
            Some(Payload::Request(payload)),
        )
    }

    /// Parses inbound text into a frame.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::Json`] if the text is not a frame object and
    /// [`FrameError::UnknownKind`] if the `type` is outside the closed set.
    pub fn parse(text: &str) -> Result<Self, FrameError> {
        let wire: WireFrame = serde_json::from_str(text)?;
        let kind = MessageKind::from_wire(&wire.kind).ok_or(FrameError::UnknownKind(wire.kind))?;
        Ok(Self {
            topic: wire.topic,
            kind,
            data: wire.data,
        })
    }

    /// Serializes the frame to wire text.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::Json`] if a payload value cannot be encoded.
    pub fn to_json(&self) -> Result<String, FrameError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Returns the nested correlation id, if the payload carries one.
    #[must_use]
    pub fn correlation_id(&self) -> Option<u32> {
        self.data.as_ref().and_then(Payload::correlation_id)
    }

    /// Returns the topic, or an empty string when absent.
    #[must_use]
    pub fn topic_str(&self) -> &str {
        self.topic.as_deref().unwrap_or("")
    }

    /// Replaces a structured `parameter` inside a map payload with its JSON
    /// string, so that wire payloads never carry raw parameter objects.
    ///
    /// Request payloads already hold a string and are left alone.
    pub fn normalize(&mut self) {
        if let Some(Payload::Map(map)) = &mut self.data {
            if let Some(param) = map.get_mut("parameter") {
                if param.is_object() {
                    *param = Value::String(param.to_string());
                }
            }
        }
    }
}

/// Generates a request correlation id: `(epoch_ms mod 2^31) + uniform[0, 1000)`.
///
/// Not globally unique. Two ids generated in the same millisecond collide
/// with probability 1/1000.
#[must_use]
pub fn correlation_id() -> u32 {
    let millis = Utc::now().timestamp_millis().rem_euclid(1 << 31);
    let jitter: u32 = rand::thread_rng().gen_range(0..1000);
    u32::try_from(millis).unwrap_or(0) + jitter
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_validation_challenge() {
        let frame = Frame::parse(r#"{"type":"validation","data":"abc123"}"#).unwrap();
        assert_eq!(frame.kind, MessageKind::Validation);
        assert_eq!(frame.topic, None);
        assert_eq!(frame.data.unwrap().as_text(), Some("abc123"));
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let err = Frame::parse(r#"{"type":"teleport","data":"x"}"#).unwrap_err();
        assert!(matches!(err, FrameError::UnknownKind(ref k) if k == "teleport"));
    }

    #[test]
    fn missing_type_is_json_error() {
        let err = Frame::parse(r#"{"topic":"rt/x"}"#).unwrap_err();
        assert!(matches!(err, FrameError::Json(_)));
    }

    #[test]
    fn garbage_is_json_error() {
        assert!(matches!(Frame::parse("not json"), Err(FrameError::Json(_))));
    }

    #[test]
    fn response_map_exposes_correlation_id() {
        let text = r#"{"type":"res","topic":"rt/api/sport/response","data":{"header":{"identity":{"id":42,"api_id":1004},"status":{"code":0}},"data":""}}"#;
        let frame = Frame::parse(text).unwrap();
        assert!(matches!(frame.data, Some(Payload::Map(_))));
        assert_eq!(frame.correlation_id(), Some(42));
        assert_eq!(frame.topic_str(), "rt/api/sport/response");
    }

    #[test]
    fn request_payload_round_trips_as_request() {
        let frame = Frame::request("rt/api/sport/request", 9, Some(1004), Some(&json!({})));
        let parsed = Frame::parse(&frame.to_json().unwrap()).unwrap();
        assert_eq!(parsed, frame);
        assert!(matches!(parsed.data, Some(Payload::Request(_))));
    }

    #[test]
    fn request_without_params_has_empty_parameter() {
        let frame = Frame::request("rt/api/sport/request", 1, None, None);
        let Some(Payload::Request(req)) = frame.data else {
            panic!("expected request payload");
        };
        assert!(req.parameter.is_empty());
        assert_eq!(req.header.identity.command_code, None);
    }

    #[test]
    fn absent_topic_and_data_are_omitted_on_the_wire() {
        let frame = Frame::new(MessageKind::Heartbeat, None, None);
        assert_eq!(frame.to_json().unwrap(), r#"{"type":"heartbeat"}"#);
    }

    #[test]
    fn request_payload_keeps_members_it_does_not_model() {
        let text = r#"{"topic":"rt/api/sport/request","type":"msg","data":{"header":{"identity":{"id":1,"api_id":1004,"seq":5},"policy":{"priority":1}},"parameter":"{}","binary":[1,2]}}"#;
        let frame = Frame::parse(text).unwrap();
        assert!(matches!(frame.data, Some(Payload::Request(_))));
        assert_eq!(frame.correlation_id(), Some(1));
        let wire: Value = serde_json::from_str(&frame.to_json().unwrap()).unwrap();
        let sent: Value = serde_json::from_str(text).unwrap();
        assert_eq!(wire, sent);
    }

    #[test]
    fn normalize_stringifies_structured_parameter() {
        let mut frame = Frame::parse(
            r#"{"type":"msg","topic":"rt/api/vui/request","data":{"header":{"identity":{"id":3,"api_id":1007}},"parameter":{"color":"red"}}}"#,
        )
        .unwrap();
        frame.normalize();
        let Some(Payload::Map(map)) = &frame.data else {
            panic!("expected map payload");
        };
        assert_eq!(map["parameter"], json!("{\"color\":\"red\"}"));
    }

    #[test]
    fn array_payload_is_kept_as_other() {
        let frame = Frame::parse(r#"{"type":"errors","data":[[1700000000,100,1]]}"#).unwrap();
        assert!(matches!(frame.data, Some(Payload::Other(Value::Array(_)))));
        assert_eq!(frame.correlation_id(), None);
    }

    #[test]
    fn heartbeat_frame_has_firmware_field_names() {
        let frame = Frame::heartbeat(Utc::now());
        let wire: Value = serde_json::from_str(&frame.to_json().unwrap()).unwrap();
        assert_eq!(wire["type"], "heartbeat");
        assert!(wire["data"]["timeInStr"].is_string());
        assert!(wire["data"]["timeInNum"].is_i64());
    }

    #[test]
    fn every_kind_round_trips_through_its_wire_name() {
        for kind in MessageKind::ALL {
            assert_eq!(MessageKind::from_wire(kind.as_str()), Some(kind));
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{}\"", kind.as_str()));
        }
    }

    #[test]
    fn correlation_ids_stay_in_range() {
        for _ in 0..100 {
            let id = correlation_id();
            assert!(id < (1u32 << 31) + 1000);
        }
    }
}
