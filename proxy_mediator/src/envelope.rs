//! Outer-envelope inspection.
//!
//! A packed message is routed to a connection by reading the recipient key
//! identifiers out of its `protected` header. Inspection never decrypts and
//! never checks signatures; it only answers "who is this addressed to".

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crypto;

#[derive(Error, Debug)]
pub enum EnvelopeError {
    #[error("packed message is not a valid envelope")]
    Malformed(#[source] serde_json::Error),
    #[error("protected header is not valid base64")]
    ProtectedEncoding,
}

/// The outer form of a packed message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackedEnvelope {
    pub protected: String,
    pub iv: String,
    pub ciphertext: String,
    pub tag: String,
}

/// The base64url-decoded content of the `protected` field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Protected {
    pub enc: String,
    pub typ: String,
    pub alg: String,
    pub recipients: Vec<Recipient>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recipient {
    pub encrypted_key: String,
    pub header: RecipientHeader,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecipientHeader {
    pub kid: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iv: Option<String>,
}

/// Extract the ordered recipient key identifiers from a packed message.
pub fn recipients_of(packed: &[u8]) -> Result<Vec<String>, EnvelopeError> {
    // Only the recipient headers are needed here; ignore the rest of the
    // envelope so inspection also works on envelopes missing payload
    // fields.
    #[derive(Deserialize)]
    struct Outer {
        protected: String,
    }

    let outer: Outer = serde_json::from_slice(packed).map_err(EnvelopeError::Malformed)?;
    let protected = crypto::b64_decode(&outer.protected)
        .map_err(|_| EnvelopeError::ProtectedEncoding)?;
    let protected: Protected =
        serde_json::from_slice(&protected).map_err(EnvelopeError::Malformed)?;

    Ok(protected
        .recipients
        .into_iter()
        .map(|recipient| recipient.header.kid)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{b64_encode, create_keypair, pack_message};

    #[test]
    fn recipients_of_packed_message() {
        let (vk_one, _) = create_keypair();
        let (vk_two, _) = create_keypair();

        let packed = pack_message(b"payload", &[vk_one, vk_two], None).unwrap();
        let recipients = recipients_of(&packed).unwrap();
        assert_eq!(
            recipients,
            vec![
                crate::crypto::b58_encode(vk_one.as_bytes()),
                crate::crypto::b58_encode(vk_two.as_bytes()),
            ]
        );
    }

    #[test]
    fn rejects_non_json() {
        assert!(matches!(
            recipients_of(b"definitely not an envelope"),
            Err(EnvelopeError::Malformed(_))
        ));
    }

    #[test]
    fn rejects_missing_protected() {
        assert!(recipients_of(br#"{"iv": "abc"}"#).is_err());
    }

    #[test]
    fn rejects_protected_without_recipients() {
        let protected = b64_encode(br#"{"enc": "x", "typ": "JWM/1.0", "alg": "Anoncrypt"}"#);
        let packed = format!(r#"{{"protected": "{protected}"}}"#);
        assert!(recipients_of(packed.as_bytes()).is_err());
    }

    #[test]
    fn accepts_padded_base64() {
        let protected = base64::Engine::encode(
            &base64::engine::general_purpose::URL_SAFE,
            br#"{"enc":"x","typ":"JWM/1.0","alg":"Anoncrypt","recipients":[{"encrypted_key":"","header":{"kid":"abc"}}]}"#,
        );
        let packed = format!(r#"{{"protected": "{protected}"}}"#);
        assert_eq!(recipients_of(packed.as_bytes()).unwrap(), vec!["abc"]);
    }
}
