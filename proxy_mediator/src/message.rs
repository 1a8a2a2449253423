//! Generic agent message with `@type`/`@id` header and decorators.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

/// Document URI under which all supported protocols are defined.
pub const DOC_URI: &str = "did:sov:BzCbsNYhMrjHiqZDTUASHg;spec/";

/// Compose a canonical message type identifier.
pub fn message_type(protocol: &str, version: &str, name: &str) -> String {
    format!("{DOC_URI}{protocol}/{version}/{name}")
}

#[derive(Error, Debug)]
pub enum MessageError {
    #[error("message is not valid JSON")]
    Parse(#[source] serde_json::Error),
    #[error("malformed `{msg_type}` message")]
    MalformedBody {
        msg_type: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("message body must be a JSON object")]
    NotAnObject,
    #[error("could not serialize message")]
    Serialize(#[source] serde_json::Error),
}

/// Verkeys attached to an inbound message after unpacking. Outbound and
/// locally built messages leave these unset.
#[derive(Debug, Clone, Default)]
pub struct MessageMeta {
    /// Recipient key the envelope was addressed to.
    pub recipient: Option<String>,
    /// Sender verkey, when the envelope authenticated one.
    pub sender: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "@type")]
    msg_type: String,
    #[serde(rename = "@id")]
    id: String,
    #[serde(flatten)]
    fields: Map<String, Value>,
    #[serde(skip)]
    pub meta: MessageMeta,
}

impl Message {
    pub fn new(msg_type: impl Into<String>) -> Self {
        Self {
            msg_type: msg_type.into(),
            id: Uuid::new_v4().to_string(),
            fields: Map::new(),
            meta: MessageMeta::default(),
        }
    }

    /// Build a message whose body fields come from a serializable value.
    pub fn build<T: Serialize>(
        msg_type: impl Into<String>,
        body: &T,
    ) -> Result<Self, MessageError> {
        let msg_type = msg_type.into();
        let value = serde_json::to_value(body).map_err(|source| MessageError::MalformedBody {
            msg_type: msg_type.clone(),
            source,
        })?;
        let Value::Object(fields) = value else {
            return Err(MessageError::NotAnObject);
        };
        Ok(Self {
            msg_type,
            id: Uuid::new_v4().to_string(),
            fields,
            meta: MessageMeta::default(),
        })
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, MessageError> {
        serde_json::from_slice(bytes).map_err(MessageError::Parse)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, MessageError> {
        serde_json::to_vec(self).map_err(|source| MessageError::MalformedBody {
            msg_type: self.msg_type.clone(),
            source,
        })
    }

    pub fn msg_type(&self) -> &str {
        &self.msg_type
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Decode the body fields into a typed form.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, MessageError> {
        serde_json::from_value(Value::Object(self.fields.clone())).map_err(|source| {
            MessageError::MalformedBody {
                msg_type: self.msg_type.clone(),
                source,
            }
        })
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    pub fn set_field(&mut self, name: impl Into<String>, value: Value) {
        self.fields.insert(name.into(), value);
    }

    /// Attach a `~thread` decorator referencing `thid`.
    pub fn with_thread(mut self, thid: &str) -> Self {
        self.fields
            .insert("~thread".to_owned(), serde_json::json!({ "thid": thid }));
        self
    }

    pub fn thread_id(&self) -> Option<&str> {
        self.fields.get("~thread")?.get("thid")?.as_str()
    }

    /// Attach a `~transport` decorator requesting replies on the same
    /// transport connection.
    pub fn set_return_route_all(&mut self) {
        self.fields.insert(
            "~transport".to_owned(),
            serde_json::json!({ "return_route": "all" }),
        );
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Greeting {
        content: String,
    }

    #[test]
    fn build_and_decode_round_trip() {
        let message = Message::build(
            message_type("basicmessage", "1.0", "message"),
            &Greeting {
                content: "hello".to_owned(),
            },
        )
        .unwrap();

        assert_eq!(
            message.msg_type(),
            "did:sov:BzCbsNYhMrjHiqZDTUASHg;spec/basicmessage/1.0/message"
        );
        let decoded: Greeting = message.decode().unwrap();
        assert_eq!(decoded.content, "hello");
    }

    #[test]
    fn serialized_form_carries_at_fields() {
        let message = Message::new(message_type("trust_ping", "1.0", "ping"));
        let value: Value = serde_json::from_slice(&message.to_bytes().unwrap()).unwrap();
        assert_eq!(
            value.get("@type").and_then(Value::as_str),
            Some("did:sov:BzCbsNYhMrjHiqZDTUASHg;spec/trust_ping/1.0/ping")
        );
        assert!(value.get("@id").is_some());
    }

    #[test]
    fn thread_decorator() {
        let message = Message::new("type").with_thread("thread-1");
        assert_eq!(message.thread_id(), Some("thread-1"));
    }

    #[test]
    fn return_route_decorator() {
        let mut message = Message::new("type");
        message.set_return_route_all();
        assert_eq!(
            message.field("~transport"),
            Some(&json!({ "return_route": "all" }))
        );
    }

    #[test]
    fn scalar_body_is_rejected() {
        assert!(matches!(
            Message::build("type", &42),
            Err(MessageError::NotAnObject)
        ));
    }
}
