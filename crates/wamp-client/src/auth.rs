//! Pluggable authenticators for the WAMP opening handshake.
//!
//! A session announces the methods of its authenticators in HELLO. When the
//! router answers with a CHALLENGE, the first authenticator accepting the
//! method computes the AUTHENTICATE signature.

use std::fmt;
use std::num::NonZeroU32;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use ed25519_dalek::{Signer, SigningKey, VerifyingKey};
use ring::{hmac, pbkdf2};
use serde_json::Value;
use wamp_core::error::{WampError, WampResult};
use wamp_core::messages::Dict;

/// A CHALLENGE received from the router.
#[derive(Debug, Clone, PartialEq)]
pub struct Challenge {
    pub method: String,
    pub extra: Dict,
}

impl Challenge {
    fn text(&self, key: &str) -> Option<&str> {
        self.extra.get(key).and_then(Value::as_str)
    }
}

/// Answer to a challenge, sent as AUTHENTICATE.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Credentials {
    pub signature: String,
    pub extra: Dict,
}

impl Credentials {
    pub fn new(signature: impl Into<String>) -> Self {
        Self {
            signature: signature.into(),
            extra: Dict::new(),
        }
    }
}

/// Produces credentials for one authentication method.
pub trait Authenticator: Send + Sync {
    /// Method name announced in HELLO (`ticket`, `wampcra`, ...).
    fn method(&self) -> &str;

    /// Whether this authenticator answers a challenge for `method`.
    fn accepts_method(&self, method: &str) -> bool {
        self.method() == method
    }

    /// The `authid` to announce, if any.
    fn authid(&self) -> Option<&str> {
        None
    }

    /// The `authextra` to announce, if any.
    fn authextra(&self) -> Option<Dict> {
        None
    }

    fn compute_credentials(&self, challenge: &Challenge) -> WampResult<Credentials>;
}

// ── Anonymous ────────────────────────────────────────────────────────

/// No credentials. Routers normally welcome anonymous sessions directly.
#[derive(Debug, Clone, Default)]
pub struct AnonymousAuth {
    authid: Option<String>,
}

impl AnonymousAuth {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_authid(authid: impl Into<String>) -> Self {
        Self {
            authid: Some(authid.into()),
        }
    }
}

impl Authenticator for AnonymousAuth {
    fn method(&self) -> &str {
        "anonymous"
    }

    fn authid(&self) -> Option<&str> {
        self.authid.as_deref()
    }

    fn compute_credentials(&self, _challenge: &Challenge) -> WampResult<Credentials> {
        Ok(Credentials::default())
    }
}

// ── Ticket ───────────────────────────────────────────────────────────

/// Static ticket (password-like token) authentication.
#[derive(Clone)]
pub struct TicketAuth {
    authid: String,
    ticket: String,
}

impl TicketAuth {
    pub fn new(authid: impl Into<String>, ticket: impl Into<String>) -> Self {
        Self {
            authid: authid.into(),
            ticket: ticket.into(),
        }
    }
}

impl fmt::Debug for TicketAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TicketAuth")
            .field("authid", &self.authid)
            .finish_non_exhaustive()
    }
}

impl Authenticator for TicketAuth {
    fn method(&self) -> &str {
        "ticket"
    }

    fn authid(&self) -> Option<&str> {
        Some(&self.authid)
    }

    fn compute_credentials(&self, _challenge: &Challenge) -> WampResult<Credentials> {
        Ok(Credentials::new(self.ticket.clone()))
    }
}

// ── WAMP-CRA ─────────────────────────────────────────────────────────

/// Challenge-response authentication with a shared secret.
#[derive(Clone)]
pub struct CraAuth {
    authid: String,
    secret: String,
}

impl CraAuth {
    pub fn new(authid: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            authid: authid.into(),
            secret: secret.into(),
        }
    }

    /// The HMAC key: the raw secret, or a salted PBKDF2 derivation of it
    /// when the challenge carries `salt`, `iterations` and `keylen`.
    fn signing_key(&self, challenge: &Challenge) -> WampResult<Vec<u8>> {
        let Some(salt) = challenge.text("salt") else {
            return Ok(self.secret.as_bytes().to_vec());
        };
        let number = |key: &str, default: u64| {
            challenge
                .extra
                .get(key)
                .and_then(Value::as_u64)
                .unwrap_or(default)
        };

        let iterations = number("iterations", 1000);
        let iterations = u32::try_from(iterations)
            .ok()
            .and_then(NonZeroU32::new)
            .ok_or_else(|| {
                WampError::AuthFailed(format!("wampcra: unsupported iteration count {iterations}"))
            })?;
        let keylen = number("keylen", 32);
        let keylen = usize::try_from(keylen)
            .ok()
            .filter(|len| (1..=1024).contains(len))
            .ok_or_else(|| {
                WampError::AuthFailed(format!("wampcra: unsupported key length {keylen}"))
            })?;

        let mut derived = vec![0u8; keylen];
        pbkdf2::derive(
            pbkdf2::PBKDF2_HMAC_SHA256,
            iterations,
            salt.as_bytes(),
            self.secret.as_bytes(),
            &mut derived,
        );
        Ok(BASE64.encode(derived).into_bytes())
    }
}

impl fmt::Debug for CraAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CraAuth")
            .field("authid", &self.authid)
            .finish_non_exhaustive()
    }
}

impl Authenticator for CraAuth {
    fn method(&self) -> &str {
        "wampcra"
    }

    fn authid(&self) -> Option<&str> {
        Some(&self.authid)
    }

    fn compute_credentials(&self, challenge: &Challenge) -> WampResult<Credentials> {
        let text = challenge
            .text("challenge")
            .ok_or_else(|| WampError::AuthFailed("wampcra: challenge missing".into()))?;
        let key = hmac::Key::new(hmac::HMAC_SHA256, &self.signing_key(challenge)?);
        let tag = hmac::sign(&key, text.as_bytes());
        Ok(Credentials::new(BASE64.encode(tag.as_ref())))
    }
}

// ── Cryptosign ───────────────────────────────────────────────────────

/// Ed25519 public-key authentication.
pub struct CryptosignAuth {
    authid: String,
    signing_key: SigningKey,
}

impl CryptosignAuth {
    pub fn new(authid: impl Into<String>, signing_key: SigningKey) -> Self {
        Self {
            authid: authid.into(),
            signing_key,
        }
    }

    /// Build from a hex-encoded 32-byte private seed.
    pub fn from_hex_seed(authid: impl Into<String>, seed: &str) -> WampResult<Self> {
        let bytes = hex::decode(seed.trim())
            .map_err(|e| WampError::AuthFailed(format!("cryptosign: invalid seed hex: {e}")))?;
        let bytes: [u8; 32] = bytes.try_into().map_err(|_| {
            WampError::AuthFailed("cryptosign: invalid seed length (expected 32 bytes)".into())
        })?;
        Ok(Self::new(authid, SigningKey::from_bytes(&bytes)))
    }

    /// Generate a fresh random key.
    pub fn generate(authid: impl Into<String>) -> Self {
        let mut csprng = rand::thread_rng();
        Self::new(authid, SigningKey::generate(&mut csprng))
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// Hex of the raw 32-byte public key, as announced in `authextra`.
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.verifying_key().to_bytes())
    }
}

impl fmt::Debug for CryptosignAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CryptosignAuth")
            .field("authid", &self.authid)
            .field("pubkey", &self.public_key_hex())
            .finish()
    }
}

impl Authenticator for CryptosignAuth {
    fn method(&self) -> &str {
        "cryptosign"
    }

    fn authid(&self) -> Option<&str> {
        Some(&self.authid)
    }

    fn authextra(&self) -> Option<Dict> {
        let mut extra = Dict::new();
        extra.insert("pubkey".into(), Value::String(self.public_key_hex()));
        Some(extra)
    }

    fn compute_credentials(&self, challenge: &Challenge) -> WampResult<Credentials> {
        let text = challenge
            .text("challenge")
            .ok_or_else(|| WampError::AuthFailed("cryptosign: challenge missing".into()))?;
        let message = hex::decode(text)
            .map_err(|e| WampError::AuthFailed(format!("cryptosign: invalid challenge hex: {e}")))?;

        let signature = self.signing_key.sign(&message);
        let mut signed = signature.to_bytes().to_vec();
        signed.extend_from_slice(&message);
        Ok(Credentials::new(hex::encode(signed)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::{Signature, Verifier};
    use serde_json::json;
    use wamp_core::to_dict;

    fn challenge(method: &str, extra: Value) -> Challenge {
        Challenge {
            method: method.into(),
            extra: to_dict(extra),
        }
    }

    #[test]
    fn default_accepts_only_own_method() {
        let auth = TicketAuth::new("joe", "secret!!!");
        assert!(auth.accepts_method("ticket"));
        assert!(!auth.accepts_method("wampcra"));
    }

    #[test]
    fn ticket_signature_is_the_ticket() {
        let auth = TicketAuth::new("joe", "secret!!!");
        let creds = auth
            .compute_credentials(&challenge("ticket", json!({})))
            .unwrap();
        assert_eq!(creds.signature, "secret!!!");
        assert_eq!(auth.authid(), Some("joe"));
    }

    #[test]
    fn anonymous_answers_empty() {
        let creds = AnonymousAuth::new()
            .compute_credentials(&challenge("anonymous", json!({})))
            .unwrap();
        assert!(creds.signature.is_empty());
    }

    // Expected values computed with Python's hashlib.pbkdf2_hmac and hmac.

    #[test]
    fn cra_signature_is_base64_hmac() {
        let auth = CraAuth::new("peter", "secret1");
        let creds = auth
            .compute_credentials(&challenge("wampcra", json!({"challenge": "hello"})))
            .unwrap();
        assert_eq!(creds.signature, "qgeRM+qADhP46mwcgXTueDVLIA/izmrF6GXTqQCA1t0=");
    }

    #[test]
    fn cra_salted_key_is_pbkdf2_derived() {
        let auth = CraAuth::new("peter", "secret1");
        let salted = challenge(
            "wampcra",
            json!({"challenge": "c", "salt": "salt123", "iterations": 100, "keylen": 32}),
        );
        assert_eq!(
            auth.signing_key(&salted).unwrap(),
            b"prq7+YkJ1/KlW1X0YczMH8E8z7oCXX/N/ixnRmOLK48="
        );
        assert_eq!(
            auth.compute_credentials(&salted).unwrap().signature,
            "IiD+bJkfZ6zX411GCL1XP8K+sYBsFbTQIc16/1emEtA="
        );
    }

    #[test]
    fn cra_salted_defaults_and_short_key() {
        let auth = CraAuth::new("peter", "secret1");
        // iterations defaults to 1000.
        let salted = challenge("wampcra", json!({"challenge": "c", "salt": "salt123", "keylen": 16}));
        assert_eq!(auth.signing_key(&salted).unwrap(), b"64xfzBvZhGDT7PB0bQwDeA==");
        assert_eq!(
            auth.compute_credentials(&salted).unwrap().signature,
            "p1ka9c0j3q9PestV/ajy2LRMQzuq+WyH6K+6fvmfbnk="
        );
    }

    #[test]
    fn cra_out_of_range_parameters_fail() {
        let auth = CraAuth::new("peter", "secret1");
        for extra in [
            json!({"challenge": "c", "salt": "s", "iterations": 4_294_967_297u64}),
            json!({"challenge": "c", "salt": "s", "iterations": 0}),
            json!({"challenge": "c", "salt": "s", "keylen": 0}),
            json!({"challenge": "c", "salt": "s", "keylen": 4_294_967_328u64}),
        ] {
            let err = auth.compute_credentials(&challenge("wampcra", extra)).unwrap_err();
            assert!(matches!(err, WampError::AuthFailed(_)), "{err}");
        }
    }

    #[test]
    fn cra_without_challenge_fails() {
        let err = CraAuth::new("peter", "secret1")
            .compute_credentials(&challenge("wampcra", json!({})))
            .unwrap_err();
        assert!(matches!(err, WampError::AuthFailed(_)));
    }

    #[test]
    fn cryptosign_signature_verifies() {
        let auth = CryptosignAuth::generate("alice");
        let nonce = [7u8; 32];
        let creds = auth
            .compute_credentials(&challenge(
                "cryptosign",
                json!({"challenge": hex::encode(nonce)}),
            ))
            .unwrap();

        let raw = hex::decode(&creds.signature).unwrap();
        assert_eq!(raw.len(), 64 + 32);
        assert_eq!(&raw[64..], &nonce);

        let signature = Signature::from_slice(&raw[..64]).unwrap();
        assert!(auth.verifying_key().verify(&nonce, &signature).is_ok());
    }

    #[test]
    fn cryptosign_announces_pubkey() {
        let seed = "4d57d97a68f555696620a6d849c0ce582568518d729eb753dc7c732de2804510";
        let auth = CryptosignAuth::from_hex_seed("alice", seed).unwrap();
        let extra = auth.authextra().unwrap();
        assert_eq!(
            extra.get("pubkey").and_then(Value::as_str),
            Some(auth.public_key_hex().as_str())
        );
        assert_eq!(auth.public_key_hex().len(), 64);
    }

    #[test]
    fn cryptosign_rejects_bad_seed() {
        assert!(CryptosignAuth::from_hex_seed("alice", "abcd").is_err());
        assert!(CryptosignAuth::from_hex_seed("alice", "zz").is_err());
    }
}
