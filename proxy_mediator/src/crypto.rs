//! Keypairs, packed-envelope encryption, and signed message fields.
//!
//! Messages travel in a JWM-style envelope: the payload is sealed with a
//! fresh content encryption key under XChaCha20-Poly1305, and the CEK is
//! wrapped once per recipient via X25519 ECDH over the recipients' Ed25519
//! keys. Authcrypt wraps with the sender's static key and seals the sender
//! verkey into the recipient header; anoncrypt wraps with an ephemeral key
//! and leaves no sender trace. The `protected` header rides as AAD on the
//! payload so it cannot be swapped without breaking the tag.

use base64::{
    alphabet,
    engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig},
    Engine,
};
use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    Key, XChaCha20Poly1305, XNonce,
};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::envelope::{PackedEnvelope, Protected, Recipient, RecipientHeader};

/// URL-safe base64, no padding on encode, padding-indifferent on decode.
const B64: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new()
        .with_encode_padding(false)
        .with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

const ENVELOPE_ENC: &str = "xchacha20poly1305_ietf";
const ENVELOPE_TYP: &str = "JWM/1.0";
const ALG_AUTHCRYPT: &str = "Authcrypt";
const ALG_ANONCRYPT: &str = "Anoncrypt";

pub const SIGNATURE_TYPE: &str =
    "did:sov:BzCbsNYhMrjHiqZDTUASHg;spec/signature/1.0/ed25519Sha512_single";

const NONCE_LEN: usize = 24;
const KEY_LEN: usize = 32;
const TAG_LEN: usize = 16;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("envelope is not valid JSON")]
    EnvelopeParse(#[source] serde_json::Error),
    #[error("envelope field is not valid base64")]
    Base64(#[from] base64::DecodeError),
    #[error("`{0}` is not a valid base58 key")]
    Base58(String),
    #[error("`{0}` is not a valid Ed25519 verification key")]
    InvalidKey(String),
    #[error("message is not addressed to this key")]
    RecipientNotFound,
    #[error("encryption failed")]
    Encryption,
    #[error("decryption failed")]
    Decryption,
    #[error("signature did not verify")]
    Verification,
    #[error("malformed signed field")]
    MalformedSignedField,
    #[error("could not serialize envelope")]
    Serialize(#[source] serde_json::Error),
}

/// Generate a fresh Ed25519 keypair.
pub fn create_keypair() -> (VerifyingKey, SigningKey) {
    let signing = SigningKey::generate(&mut OsRng);
    (signing.verifying_key(), signing)
}

pub fn b58_encode(bytes: impl AsRef<[u8]>) -> String {
    bs58::encode(bytes.as_ref()).into_string()
}

pub fn b58_decode(value: &str) -> Result<Vec<u8>, CryptoError> {
    bs58::decode(value)
        .into_vec()
        .map_err(|_| CryptoError::Base58(value.to_owned()))
}

pub fn b64_encode(bytes: impl AsRef<[u8]>) -> String {
    B64.encode(bytes.as_ref())
}

pub fn b64_decode(value: &str) -> Result<Vec<u8>, CryptoError> {
    Ok(B64.decode(value)?)
}

pub fn verkey_from_b58(value: &str) -> Result<VerifyingKey, CryptoError> {
    let bytes: [u8; KEY_LEN] = b58_decode(value)?
        .try_into()
        .map_err(|_| CryptoError::InvalidKey(value.to_owned()))?;
    VerifyingKey::from_bytes(&bytes).map_err(|_| CryptoError::InvalidKey(value.to_owned()))
}

/// DIDs are derived from the first sixteen bytes of the verification key.
pub fn did_from_verkey(verkey: &VerifyingKey) -> String {
    format!("did:sov:{}", b58_encode(&verkey.as_bytes()[..16]))
}

fn x25519_public(verkey: &VerifyingKey) -> x25519_dalek::PublicKey {
    x25519_dalek::PublicKey::from(verkey.to_montgomery().to_bytes())
}

fn x25519_secret(sigkey: &SigningKey) -> x25519_dalek::StaticSecret {
    x25519_dalek::StaticSecret::from(sigkey.to_scalar_bytes())
}

fn aead_encrypt(
    key: &[u8; KEY_LEN],
    nonce: &[u8],
    plaintext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .encrypt(
            XNonce::from_slice(nonce),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| CryptoError::Encryption)
}

fn aead_decrypt(
    key: &[u8; KEY_LEN],
    nonce: &[u8],
    ciphertext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .decrypt(
            XNonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| CryptoError::Decryption)
}

fn random_bytes<const N: usize>() -> [u8; N] {
    let mut bytes = [0u8; N];
    OsRng.fill_bytes(&mut bytes);
    bytes
}

/// Seal `plaintext` to a recipient with an ephemeral X25519 key.
///
/// Layout: ephemeral public key (32) || nonce (24) || ciphertext.
fn seal(plaintext: &[u8], recipient: &VerifyingKey) -> Result<Vec<u8>, CryptoError> {
    let ephemeral = x25519_dalek::StaticSecret::random_from_rng(OsRng);
    let ephemeral_public = x25519_dalek::PublicKey::from(&ephemeral);
    let shared = ephemeral.diffie_hellman(&x25519_public(recipient));
    let nonce = random_bytes::<NONCE_LEN>();

    let mut sealed = ephemeral_public.as_bytes().to_vec();
    sealed.extend_from_slice(&nonce);
    sealed.extend_from_slice(&aead_encrypt(shared.as_bytes(), &nonce, plaintext, &[])?);
    Ok(sealed)
}

fn unseal(sealed: &[u8], sigkey: &SigningKey) -> Result<Vec<u8>, CryptoError> {
    if sealed.len() < KEY_LEN + NONCE_LEN + TAG_LEN {
        return Err(CryptoError::Decryption);
    }
    let (ephemeral_public, rest) = sealed.split_at(KEY_LEN);
    let (nonce, ciphertext) = rest.split_at(NONCE_LEN);

    let ephemeral_public: [u8; KEY_LEN] = ephemeral_public
        .try_into()
        .map_err(|_| CryptoError::Decryption)?;
    let shared = x25519_secret(sigkey).diffie_hellman(&x25519_dalek::PublicKey::from(
        ephemeral_public,
    ));
    aead_decrypt(shared.as_bytes(), nonce, ciphertext, &[])
}

/// Pack `payload` for `to_verkeys`. With `from` the envelope is authcrypt
/// and the recipients learn (and can authenticate) the sender verkey;
/// without it the envelope is anoncrypt.
pub fn pack_message(
    payload: &[u8],
    to_verkeys: &[VerifyingKey],
    from: Option<(&VerifyingKey, &SigningKey)>,
) -> Result<Vec<u8>, CryptoError> {
    let cek = random_bytes::<KEY_LEN>();

    let mut recipients = Vec::with_capacity(to_verkeys.len());
    for their_verkey in to_verkeys {
        let recipient = match from {
            Some((sender_verkey, sender_sigkey)) => {
                let shared =
                    x25519_secret(sender_sigkey).diffie_hellman(&x25519_public(their_verkey));
                let nonce = random_bytes::<NONCE_LEN>();
                let encrypted_key = aead_encrypt(shared.as_bytes(), &nonce, &cek, &[])?;
                let sender_b58 = b58_encode(sender_verkey.as_bytes());
                Recipient {
                    encrypted_key: b64_encode(encrypted_key),
                    header: RecipientHeader {
                        kid: b58_encode(their_verkey.as_bytes()),
                        sender: Some(b64_encode(seal(sender_b58.as_bytes(), their_verkey)?)),
                        iv: Some(b64_encode(nonce)),
                    },
                }
            }
            None => Recipient {
                encrypted_key: b64_encode(seal(&cek, their_verkey)?),
                header: RecipientHeader {
                    kid: b58_encode(their_verkey.as_bytes()),
                    sender: None,
                    iv: None,
                },
            },
        };
        recipients.push(recipient);
    }

    let protected = Protected {
        enc: ENVELOPE_ENC.to_owned(),
        typ: ENVELOPE_TYP.to_owned(),
        alg: if from.is_some() {
            ALG_AUTHCRYPT.to_owned()
        } else {
            ALG_ANONCRYPT.to_owned()
        },
        recipients,
    };
    let protected_b64 = b64_encode(serde_json::to_vec(&protected).map_err(CryptoError::Serialize)?);

    let nonce = random_bytes::<NONCE_LEN>();
    let mut ciphertext = aead_encrypt(&cek, &nonce, payload, protected_b64.as_bytes())?;
    let tag = ciphertext.split_off(ciphertext.len() - TAG_LEN);

    let envelope = PackedEnvelope {
        protected: protected_b64,
        iv: b64_encode(nonce),
        ciphertext: b64_encode(ciphertext),
        tag: b64_encode(tag),
    };
    serde_json::to_vec(&envelope).map_err(CryptoError::Serialize)
}

/// Unpack a message addressed to `verkey`, returning the payload, the
/// sender verkey (authcrypt only), and the recipient key the message was
/// addressed to.
pub fn unpack_message(
    packed: &[u8],
    verkey: &VerifyingKey,
    sigkey: &SigningKey,
) -> Result<(Vec<u8>, Option<String>, String), CryptoError> {
    let envelope: PackedEnvelope =
        serde_json::from_slice(packed).map_err(CryptoError::EnvelopeParse)?;
    let protected: Protected = serde_json::from_slice(&b64_decode(&envelope.protected)?)
        .map_err(CryptoError::EnvelopeParse)?;

    let own_kid = b58_encode(verkey.as_bytes());
    let recipient = protected
        .recipients
        .iter()
        .find(|recipient| recipient.header.kid == own_kid)
        .ok_or(CryptoError::RecipientNotFound)?;

    let (cek, sender_verkey) = match protected.alg.as_str() {
        ALG_AUTHCRYPT => {
            let sender_sealed = recipient
                .header
                .sender
                .as_deref()
                .ok_or(CryptoError::RecipientNotFound)?;
            let key_nonce = recipient
                .header
                .iv
                .as_deref()
                .ok_or(CryptoError::RecipientNotFound)?;

            let sender_b58 = String::from_utf8(unseal(&b64_decode(sender_sealed)?, sigkey)?)
                .map_err(|_| CryptoError::Decryption)?;
            let sender_verkey = verkey_from_b58(&sender_b58)?;

            let shared = x25519_secret(sigkey).diffie_hellman(&x25519_public(&sender_verkey));
            let cek = aead_decrypt(
                shared.as_bytes(),
                &b64_decode(key_nonce)?,
                &b64_decode(&recipient.encrypted_key)?,
                &[],
            )?;
            (cek, Some(sender_b58))
        }
        _ => {
            let cek = unseal(&b64_decode(&recipient.encrypted_key)?, sigkey)?;
            (cek, None)
        }
    };
    let cek: [u8; KEY_LEN] = cek.try_into().map_err(|_| CryptoError::Decryption)?;

    let mut ciphertext = b64_decode(&envelope.ciphertext)?;
    ciphertext.extend_from_slice(&b64_decode(&envelope.tag)?);
    let payload = aead_decrypt(
        &cek,
        &b64_decode(&envelope.iv)?,
        &ciphertext,
        envelope.protected.as_bytes(),
    )?;

    Ok((payload, sender_verkey, own_kid))
}

/// A signed message field of type `ed25519Sha512_single`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SignedField {
    #[serde(rename = "@type")]
    pub field_type: String,
    pub signer: String,
    pub sig_data: String,
    pub signature: String,
}

/// Sign `value`, prefixing the serialized form with an 8-byte big-endian
/// UTC timestamp as the signed-field convention requires.
pub fn sign_message_field<T: Serialize>(
    value: &T,
    signer_b58: &str,
    sigkey: &SigningKey,
) -> Result<SignedField, CryptoError> {
    let timestamp = chrono::Utc::now().timestamp().unsigned_abs();
    let mut sig_data = timestamp.to_be_bytes().to_vec();
    sig_data.extend_from_slice(&serde_json::to_vec(value).map_err(CryptoError::Serialize)?);

    let signature = sigkey.sign(&sig_data);

    Ok(SignedField {
        field_type: SIGNATURE_TYPE.to_owned(),
        signer: signer_b58.to_owned(),
        sig_data: b64_encode(sig_data),
        signature: b64_encode(signature.to_bytes()),
    })
}

/// Verify a signed field and return the signer verkey and embedded value.
pub fn verify_signed_message_field(field: &SignedField) -> Result<(String, Value), CryptoError> {
    let verkey = verkey_from_b58(&field.signer)?;
    let sig_data = b64_decode(&field.sig_data)?;
    let signature = Signature::from_slice(&b64_decode(&field.signature)?)
        .map_err(|_| CryptoError::Verification)?;

    verkey
        .verify(&sig_data, &signature)
        .map_err(|_| CryptoError::Verification)?;

    if sig_data.len() < 8 {
        return Err(CryptoError::MalformedSignedField);
    }
    let value = serde_json::from_slice(&sig_data[8..])
        .map_err(|_| CryptoError::MalformedSignedField)?;
    Ok((field.signer.clone(), value))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::test_init;

    #[test]
    fn authcrypt_pack_unpack() {
        test_init();
        let (sender_vk, sender_sk) = create_keypair();
        let (recip_vk, recip_sk) = create_keypair();

        let packed = pack_message(
            b"{\"@type\": \"test\"}",
            &[recip_vk],
            Some((&sender_vk, &sender_sk)),
        )
        .unwrap();

        let (payload, sender, recipient) =
            unpack_message(&packed, &recip_vk, &recip_sk).unwrap();
        assert_eq!(payload, b"{\"@type\": \"test\"}");
        assert_eq!(sender, Some(b58_encode(sender_vk.as_bytes())));
        assert_eq!(recipient, b58_encode(recip_vk.as_bytes()));
    }

    #[test]
    fn anoncrypt_pack_unpack() {
        test_init();
        let (recip_vk, recip_sk) = create_keypair();

        let packed = pack_message(b"hidden sender", &[recip_vk], None).unwrap();
        let (payload, sender, _) = unpack_message(&packed, &recip_vk, &recip_sk).unwrap();
        assert_eq!(payload, b"hidden sender");
        assert_eq!(sender, None);
    }

    #[test]
    fn unpack_rejects_wrong_recipient() {
        test_init();
        let (recip_vk, _) = create_keypair();
        let (other_vk, other_sk) = create_keypair();

        let packed = pack_message(b"not for you", &[recip_vk], None).unwrap();
        assert!(matches!(
            unpack_message(&packed, &other_vk, &other_sk),
            Err(CryptoError::RecipientNotFound)
        ));
    }

    #[test]
    fn unpack_rejects_tampered_payload() {
        test_init();
        let (recip_vk, recip_sk) = create_keypair();

        let packed = pack_message(b"payload", &[recip_vk], None).unwrap();
        let mut envelope: PackedEnvelope = serde_json::from_slice(&packed).unwrap();
        envelope.ciphertext = b64_encode(b"tampered");
        let tampered = serde_json::to_vec(&envelope).unwrap();

        assert!(matches!(
            unpack_message(&tampered, &recip_vk, &recip_sk),
            Err(CryptoError::Decryption)
        ));
    }

    #[test]
    fn signed_field_round_trip() {
        test_init();
        let (vk, sk) = create_keypair();
        let signer = b58_encode(vk.as_bytes());
        let block = json!({"DID": "did:sov:example", "key": "value"});

        let field = sign_message_field(&block, &signer, &sk).unwrap();
        assert_eq!(field.field_type, SIGNATURE_TYPE);

        let (recovered_signer, recovered) = verify_signed_message_field(&field).unwrap();
        assert_eq!(recovered_signer, signer);
        assert_eq!(recovered, block);
    }

    #[test]
    fn signed_field_rejects_wrong_signer() {
        test_init();
        let (_, sk) = create_keypair();
        let (other_vk, _) = create_keypair();
        let block = json!({"DID": "did:sov:example"});

        // Claimed signer differs from the key that actually signed.
        let field =
            sign_message_field(&block, &b58_encode(other_vk.as_bytes()), &sk).unwrap();
        assert!(matches!(
            verify_signed_message_field(&field),
            Err(CryptoError::Verification)
        ));
    }

    #[test]
    fn did_is_derived_from_verkey_prefix() {
        let (vk, _) = create_keypair();
        let did = did_from_verkey(&vk);
        assert!(did.starts_with("did:sov:"));
        let decoded = b58_decode(did.trim_start_matches("did:sov:")).unwrap();
        assert_eq!(decoded, vk.as_bytes()[..16]);
    }
}
