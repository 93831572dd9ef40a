//! This module contains the envelope types traded between the
//! Manager and its peers, and the classification rules the
//! dispatcher applies to every inbound envelope.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Map, Value};

use crate::hub::communication::serialize;
use crate::hub::error::*;

/// The reserved `uuid` carried by Service originated notifications.
///
/// The empty string is already taken by handshake prompts and admin
/// replies, so notifications use a dedicated sentinel the Client's
/// reply classifier compares against.
pub const NOTIFICATION_UUID: &str = "notification";

/// The attribute a peer requests to disconnect gracefully.
pub const DISCONNECT_ATTRIBUTE: &str = "__disconnect__";

/// The Service name addressing the Manager itself.
pub const MANAGER_SERVICE: &str = "Manager";

/// A single JSON envelope, terminator delimited on the wire,
/// carrying a request, reply, error or notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attribute: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<Value>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub kwargs: Map<String, Value>,
    // an explicit `null` result must remain distinguishable from an
    // absent key, since the presence of the key is what classifies
    // an envelope as a reply
    #[serde(
        default,
        deserialize_with = "deserialize_some",
        skip_serializing_if = "Option::is_none"
    )]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub traceback: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requester: Option<String>,
    #[serde(default)]
    pub uuid: String,
    #[serde(default)]
    pub error: bool,
}

fn deserialize_some<'de, D>(deserializer: D) -> std::result::Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

/// The category the dispatcher assigns to an inbound envelope.
///
/// The rules apply in declaration order; see `classify`.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum MessageClass {
    /// A reply from a Service, to be forwarded to its requester.
    ServiceReply,
    /// A Service originated notification, to be fanned out to the
    /// Service's link set.
    Notification,
    /// A request addressed to the Manager itself.
    ManagerRequest,
    /// A graceful disconnect request.
    Disconnect,
    /// A request to be forwarded to a named Service.
    ServiceRequest,
}

/// Classifies an inbound envelope.
pub fn classify(envelope: &Envelope) -> MessageClass {
    if envelope.result.is_some() || envelope.error {
        if envelope.uuid == NOTIFICATION_UUID {
            MessageClass::Notification
        } else {
            MessageClass::ServiceReply
        }
    } else if envelope.service.as_deref() == Some(MANAGER_SERVICE) {
        MessageClass::ManagerRequest
    } else if envelope.attribute.as_deref() == Some(DISCONNECT_ATTRIBUTE) {
        MessageClass::Disconnect
    } else {
        MessageClass::ServiceRequest
    }
}

/// The kinds of failures that cross the wire inside error envelopes.
///
/// Stamped as `"<Kind>: <detail>"` into the `message` field, so a
/// peer in any language can match on the prefix.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum WireErrorKind {
    AuthFailure,
    HandshakeTimeout,
    IdentityInvalid,
    ServiceNotFound,
    LinkSaturated,
    RequestFailed,
    TransportLost,
    ProtocolError,
    PermissionDenied,
}

impl WireErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            WireErrorKind::AuthFailure => "AuthFailure",
            WireErrorKind::HandshakeTimeout => "HandshakeTimeout",
            WireErrorKind::IdentityInvalid => "IdentityInvalid",
            WireErrorKind::ServiceNotFound => "ServiceNotFound",
            WireErrorKind::LinkSaturated => "LinkSaturated",
            WireErrorKind::RequestFailed => "RequestFailed",
            WireErrorKind::TransportLost => "TransportLost",
            WireErrorKind::ProtocolError => "ProtocolError",
            WireErrorKind::PermissionDenied => "PermissionDenied",
        }
    }
}

impl Envelope {
    fn empty() -> Self {
        Self {
            service: None,
            attribute: None,
            args: Vec::new(),
            kwargs: Map::new(),
            result: None,
            message: None,
            traceback: Vec::new(),
            requester: None,
            uuid: String::new(),
            error: false,
        }
    }

    /// Builds a request envelope, Client to Service.
    pub fn request(
        service: &str,
        attribute: &str,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
        uuid: &str,
    ) -> Self {
        Self {
            service: Some(service.into()),
            attribute: Some(attribute.into()),
            args,
            kwargs,
            uuid: uuid.into(),
            ..Self::empty()
        }
    }

    /// Builds a reply envelope carrying `result`.
    pub fn reply(result: Value, requester: &str, uuid: &str) -> Self {
        Self {
            result: Some(result),
            requester: Some(requester.into()),
            uuid: uuid.into(),
            ..Self::empty()
        }
    }

    /// Builds an error envelope with message `"<kind>: <detail>"`.
    pub fn error_reply(kind: WireErrorKind, detail: &str, requester: &str, uuid: &str) -> Self {
        Self {
            result: Some(Value::Null),
            message: Some(format!("{}: {}", kind.as_str(), detail)),
            requester: Some(requester.into()),
            uuid: uuid.into(),
            error: true,
            ..Self::empty()
        }
    }

    /// Builds an error envelope whose message is already fully
    /// formed.
    pub fn error_message(message: String, requester: &str, uuid: &str) -> Self {
        Self {
            result: Some(Value::Null),
            message: Some(message),
            requester: Some(requester.into()),
            uuid: uuid.into(),
            error: true,
            ..Self::empty()
        }
    }

    /// Attaches a rendered traceback to an error envelope.
    pub fn with_traceback(mut self, traceback: Vec<String>) -> Self {
        self.traceback = traceback;
        self
    }

    /// Builds a Service originated notification envelope.
    pub fn notification(service: &str, args: Vec<Value>, kwargs: Map<String, Value>) -> Self {
        Self {
            service: Some(service.into()),
            result: Some(json!([args, kwargs])),
            uuid: NOTIFICATION_UUID.into(),
            ..Self::empty()
        }
    }

    /// Builds a handshake prompt, Manager to peer.
    ///
    /// Prompts carry an empty `uuid` so they never correlate with a
    /// pending request on the peer.
    pub fn prompt(attribute: &str, requester: &str) -> Self {
        Self {
            attribute: Some(attribute.into()),
            requester: Some(requester.into()),
            ..Self::empty()
        }
    }

    /// Builds a graceful disconnect request.
    pub fn disconnect() -> Self {
        Self {
            service: Some("self".into()),
            attribute: Some(DISCONNECT_ATTRIBUTE.into()),
            ..Self::empty()
        }
    }

    /// Serializes this envelope into wire bytes, terminator excluded.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let value = serde_json::to_value(self).wrapped(ErrorKind::CommunicationMessage)?;
        serialize::serialize(&value)
    }

    /// Deserializes an envelope from wire bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let value = serialize::deserialize(bytes)?;
        Self::from_value(value)
    }

    /// Converts a decoded JSON value into an envelope.
    pub fn from_value(value: Value) -> Result<Self> {
        serde_json::from_value(value).wrapped(ErrorKind::CommunicationMessage)
    }

    /// Splits a notification `result` payload into its args and
    /// kwargs halves; a payload of any other shape is delivered as a
    /// single positional argument.
    pub fn notification_payload(&self) -> (Vec<Value>, Map<String, Value>) {
        let result = match &self.result {
            Some(r) => r,
            None => return (Vec::new(), Map::new()),
        };
        if let Value::Array(items) = result {
            if items.len() == 2 {
                if let (Value::Array(args), Value::Object(kwargs)) = (&items[0], &items[1]) {
                    return (args.clone(), kwargs.clone());
                }
            }
        }
        (vec![result.clone()], Map::new())
    }
}

/// The identity a Client declares during the handshake.
#[derive(Debug, Clone)]
pub struct ClientIdentity {
    pub name: String,
    pub language: String,
    pub os: String,
}

/// The identity a Service declares during the handshake.
#[derive(Debug, Clone)]
pub struct ServiceIdentity {
    pub name: String,
    /// Attribute catalog: method name to signature string, or plain
    /// value for value attributes.
    pub attributes: Map<String, Value>,
    pub address: Option<String>,
    pub language: String,
    pub os: String,
    /// A value less than or equal to zero means unlimited.
    pub max_clients: i64,
}

/// A validated peer identity, either role.
#[derive(Debug, Clone)]
pub enum PeerIdentity {
    Client(ClientIdentity),
    Service(ServiceIdentity),
}

fn string_field(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(Value::as_str).map(String::from)
}

impl PeerIdentity {
    /// Validates the identity reply of a peer.
    ///
    /// Rejections: unknown `type`, missing required keys.
    pub fn from_value(value: &Value) -> Result<Self> {
        let kind = string_field(value, "type")
            .ok_or_else(|| Error::wrapped(ErrorKind::IdentityInvalid, "Missing 'type' key"))?;
        match kind.to_ascii_lowercase().as_str() {
            "client" => {
                let name = string_field(value, "name").ok_or_else(|| {
                    Error::wrapped(ErrorKind::IdentityInvalid, "Missing 'name' key")
                })?;
                Ok(PeerIdentity::Client(ClientIdentity {
                    name,
                    language: string_field(value, "language").unwrap_or_else(unknown),
                    os: string_field(value, "os").unwrap_or_else(unknown),
                }))
            }
            "service" => {
                let name = string_field(value, "name").ok_or_else(|| {
                    Error::wrapped(ErrorKind::IdentityInvalid, "Missing 'name' key")
                })?;
                let attributes = value
                    .get("attributes")
                    .and_then(Value::as_object)
                    .cloned()
                    .ok_or_else(|| {
                        Error::wrapped(ErrorKind::IdentityInvalid, "Missing 'attributes' key")
                    })?;
                Ok(PeerIdentity::Service(ServiceIdentity {
                    name,
                    attributes,
                    address: string_field(value, "address"),
                    language: string_field(value, "language").unwrap_or_else(unknown),
                    os: string_field(value, "os").unwrap_or_else(unknown),
                    max_clients: value
                        .get("max_clients")
                        .and_then(Value::as_i64)
                        .unwrap_or(-1),
                }))
            }
            other => Err(Error::wrapped(
                ErrorKind::IdentityInvalid,
                format!(
                    "Unknown connection type {:?}. Must be \"client\" or \"service\"",
                    other
                ),
            )),
        }
    }
}

fn unknown() -> String {
    "unknown".into()
}

impl ClientIdentity {
    pub fn to_value(&self) -> Value {
        json!({
            "type": "client",
            "name": self.name,
            "language": self.language,
            "os": self.os,
        })
    }
}

impl ServiceIdentity {
    pub fn to_value(&self) -> Value {
        json!({
            "type": "service",
            "name": self.name,
            "attributes": self.attributes,
            "language": self.language,
            "os": self.os,
            "max_clients": self.max_clients,
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_classify_in_order() {
        let request = Envelope::request("Echo", "echo", vec![json!(1)], Map::new(), "u-1");
        assert_eq!(classify(&request), MessageClass::ServiceRequest);

        let manager = Envelope::request(MANAGER_SERVICE, "identity", vec![], Map::new(), "u-2");
        assert_eq!(classify(&manager), MessageClass::ManagerRequest);

        let reply = Envelope::reply(json!(3), "localhost:5", "u-1");
        assert_eq!(classify(&reply), MessageClass::ServiceReply);

        let notification = Envelope::notification("Hb", vec![json!(1)], Map::new());
        assert_eq!(classify(&notification), MessageClass::Notification);

        let disconnect = Envelope::disconnect();
        assert_eq!(classify(&disconnect), MessageClass::Disconnect);

        // an error envelope addressed at "Manager" still classifies
        // as a reply; the reply rule runs first
        let mut error = Envelope::error_reply(WireErrorKind::RequestFailed, "boom", "x", "u-3");
        error.service = Some(MANAGER_SERVICE.into());
        assert_eq!(classify(&error), MessageClass::ServiceReply);
    }

    #[test]
    fn test_null_result_still_classifies_as_reply() {
        let bytes = b"{\"result\": null, \"requester\": \"localhost:4\", \"uuid\": \"u\", \"error\": false}";
        let envelope = Envelope::decode(&bytes[..]).unwrap();
        assert_eq!(envelope.result, Some(Value::Null));
        assert_eq!(classify(&envelope), MessageClass::ServiceReply);
    }

    #[test]
    fn test_coalesced_buffer_decodes_to_the_same_sequence() {
        use crate::hub::communication::framing::{Framer, TERMINATION};

        let first = Envelope::request("Echo", "echo", vec![json!(1)], Map::new(), "u-1");
        let second = Envelope::reply(json!("ok"), "localhost:5", "u-2");

        let mut buffer = first.encode().unwrap();
        buffer.extend_from_slice(TERMINATION);
        buffer.extend_from_slice(&second.encode().unwrap());
        buffer.extend_from_slice(TERMINATION);

        // one coalesced packet frames into the same envelope
        // sequence that separate packets would have produced
        let mut framer = Framer::new();
        framer.feed(&buffer);
        let mut decoded = Vec::new();
        while let Some(frame) = framer.next_frame() {
            decoded.push(Envelope::decode(&frame).unwrap());
        }
        assert_eq!(decoded, vec![first, second]);
    }

    #[test]
    fn test_encode_decode_round_trip() {
        let mut kwargs = Map::new();
        kwargs.insert("x".into(), json!(4));
        let envelope = Envelope::request("Echo", "echo", vec![json!(1), json!(2)], kwargs, "u-9");
        let bytes = envelope.encode().unwrap();
        assert_eq!(Envelope::decode(&bytes).unwrap(), envelope);
    }

    #[test]
    fn test_error_reply_message_prefix() {
        let envelope =
            Envelope::error_reply(WireErrorKind::ServiceNotFound, "no such thing", "c", "u");
        assert!(envelope.error);
        assert_eq!(
            envelope.message.as_deref(),
            Some("ServiceNotFound: no such thing")
        );
        assert_eq!(envelope.result, Some(Value::Null));
    }

    #[test]
    fn test_identity_rejections() {
        assert!(PeerIdentity::from_value(&json!({"name": "x"})).is_err());
        assert!(PeerIdentity::from_value(&json!({"type": "router", "name": "x"})).is_err());
        assert!(PeerIdentity::from_value(&json!({"type": "client"})).is_err());
        assert!(PeerIdentity::from_value(&json!({"type": "service", "name": "S"})).is_err());
    }

    #[test]
    fn test_identity_type_case_insensitive() {
        let id = PeerIdentity::from_value(&json!({"type": "CLIENT", "name": "cli"})).unwrap();
        match id {
            PeerIdentity::Client(c) => {
                assert_eq!(c.name, "cli");
                assert_eq!(c.language, "unknown");
            }
            _ => panic!("expected a client identity"),
        }
    }

    #[test]
    fn test_notification_payload_shape() {
        let mut kwargs = Map::new();
        kwargs.insert("a".into(), json!(1));
        let n = Envelope::notification("Hb", vec![json!(7)], kwargs.clone());
        let (args, kw) = n.notification_payload();
        assert_eq!(args, vec![json!(7)]);
        assert_eq!(kw, kwargs);

        let bare = Envelope::reply(json!(42), "", NOTIFICATION_UUID);
        let (args, kw) = bare.notification_payload();
        assert_eq!(args, vec![json!(42)]);
        assert!(kw.is_empty());
    }
}
