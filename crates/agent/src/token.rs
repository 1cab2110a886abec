//! Signed resumable tokens.
//!
//! A token carries the entire run payload across HTTP requests so that
//! resume is stateless: `base64url(envelope) + "." + base64url(mac)` where
//! the MAC is HMAC-SHA256 over the serialized envelope. Tokens older than
//! the configured TTL are rejected.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use indexmap::IndexMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use time::OffsetDateTime;

type HmacSha256 = Hmac<Sha256>;

const DEV_SECRET: &str = "dev-secret";
const DEFAULT_TTL_SECONDS: u64 = 900;

/// One prior message in the IDE conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HistoryMessage {
    pub role: String,
    pub content: String,
}

/// Verified content of a run stream token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunTokenPayload {
    pub user_id: String,
    #[serde(default)]
    pub message_history: Vec<HistoryMessage>,
    pub query: String,
    pub project: IndexMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

/// Verified content of a play stream token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayTokenPayload {
    pub user_id: String,
    pub project: IndexMap<String, String>,
    pub entry_path: String,
    #[serde(default)]
    pub runtime: Option<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TokenError {
    #[error("invalid token")]
    Invalid,
    #[error("token expired")]
    Expired,
}

#[derive(Serialize, Deserialize)]
struct Envelope<T> {
    payload: T,
    issued_at: i64,
}

/// Signs and verifies stream tokens with a process-wide secret.
pub struct TokenSigner {
    key: Vec<u8>,
    ttl: Duration,
}

impl TokenSigner {
    pub fn new(secret: impl Into<Vec<u8>>, ttl: Duration) -> Self {
        Self {
            key: secret.into(),
            ttl,
        }
    }

    /// Read `SSE_SECRET` (falling back to `JWT_SECRET`, then a development
    /// default) and `RUN_STORE_TTL_SECONDS` from the environment.
    pub fn from_env() -> Self {
        let secret = std::env::var("SSE_SECRET")
            .or_else(|_| std::env::var("JWT_SECRET"))
            .unwrap_or_else(|_| DEV_SECRET.to_string());
        let ttl = std::env::var("RUN_STORE_TTL_SECONDS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(DEFAULT_TTL_SECONDS);
        Self::new(secret.into_bytes(), Duration::from_secs(ttl))
    }

    pub fn sign<T: Serialize>(&self, payload: &T) -> Result<String, TokenError> {
        self.sign_at(payload, OffsetDateTime::now_utc().unix_timestamp())
    }

    fn sign_at<T: Serialize>(&self, payload: &T, issued_at: i64) -> Result<String, TokenError> {
        let envelope = Envelope { payload, issued_at };
        let body = serde_json::to_vec(&envelope).map_err(|_| TokenError::Invalid)?;
        let mut mac = HmacSha256::new_from_slice(&self.key).map_err(|_| TokenError::Invalid)?;
        mac.update(&body);
        let tag = mac.finalize().into_bytes();
        Ok(format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(&body),
            URL_SAFE_NO_PAD.encode(tag)
        ))
    }

    pub fn verify<T: DeserializeOwned>(&self, token: &str) -> Result<T, TokenError> {
        let (body_b64, tag_b64) = token.split_once('.').ok_or(TokenError::Invalid)?;
        let body = URL_SAFE_NO_PAD
            .decode(body_b64)
            .map_err(|_| TokenError::Invalid)?;
        let tag = URL_SAFE_NO_PAD
            .decode(tag_b64)
            .map_err(|_| TokenError::Invalid)?;

        let mut mac = HmacSha256::new_from_slice(&self.key).map_err(|_| TokenError::Invalid)?;
        mac.update(&body);
        mac.verify_slice(&tag).map_err(|_| TokenError::Invalid)?;

        let envelope: Envelope<T> =
            serde_json::from_slice(&body).map_err(|_| TokenError::Invalid)?;
        let age = OffsetDateTime::now_utc().unix_timestamp() - envelope.issued_at;
        if age < 0 || age as u64 > self.ttl.as_secs() {
            return Err(TokenError::Expired);
        }
        Ok(envelope.payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indexmap::indexmap;

    fn signer() -> TokenSigner {
        TokenSigner::new(b"test-secret".to_vec(), Duration::from_secs(900))
    }

    fn run_payload() -> RunTokenPayload {
        RunTokenPayload {
            user_id: "u1".into(),
            message_history: vec![HistoryMessage {
                role: "user".into(),
                content: "hi".into(),
            }],
            query: "make f return 2".into(),
            project: indexmap! {
                "main.py".to_string() => "def f():\n    return 1\n".to_string(),
            },
            model: Some("openai/gpt-5".into()),
        }
    }

    // ── Round trip ─────────────────────────────────────────────────────

    #[test]
    fn sign_verify_round_trips() {
        let s = signer();
        let token = s.sign(&run_payload()).unwrap();
        let back: RunTokenPayload = s.verify(&token).unwrap();
        assert_eq!(back.user_id, "u1");
        assert_eq!(back.query, "make f return 2");
        assert_eq!(back.project["main.py"], "def f():\n    return 1\n");
        assert_eq!(back.model.as_deref(), Some("openai/gpt-5"));
    }

    #[test]
    fn play_payload_round_trips() {
        let s = signer();
        let payload = PlayTokenPayload {
            user_id: "u1".into(),
            project: indexmap! { "app.py".to_string() => "print(1)\n".to_string() },
            entry_path: "app.py".into(),
            runtime: None,
            env: HashMap::from([("PORT".to_string(), "8000".to_string())]),
        };
        let token = s.sign(&payload).unwrap();
        let back: PlayTokenPayload = s.verify(&token).unwrap();
        assert_eq!(back.entry_path, "app.py");
        assert_eq!(back.env["PORT"], "8000");
    }

    // ── Tamper resistance ──────────────────────────────────────────────

    #[test]
    fn any_single_byte_mutation_fails_verification() {
        let s = signer();
        let token = s.sign(&run_payload()).unwrap();
        let bytes = token.as_bytes();
        for i in 0..bytes.len() {
            let mut mutated = bytes.to_vec();
            // Flip to a different base64url character to keep decodability
            // plausible; verification must still reject.
            mutated[i] = if mutated[i] == b'A' { b'B' } else { b'A' };
            let mutated = String::from_utf8(mutated).unwrap();
            if mutated == token {
                continue;
            }
            let res: Result<RunTokenPayload, _> = s.verify(&mutated);
            assert!(res.is_err(), "mutation at byte {} was accepted", i);
        }
    }

    #[test]
    fn wrong_key_fails_verification() {
        let token = signer().sign(&run_payload()).unwrap();
        let other = TokenSigner::new(b"other-secret".to_vec(), Duration::from_secs(900));
        let res: Result<RunTokenPayload, _> = other.verify(&token);
        assert_eq!(res.unwrap_err(), TokenError::Invalid);
    }

    #[test]
    fn garbage_tokens_are_invalid() {
        let s = signer();
        for junk in ["", "abc", "a.b.c", "!!!.###"] {
            let res: Result<RunTokenPayload, _> = s.verify(junk);
            assert_eq!(res.unwrap_err(), TokenError::Invalid);
        }
    }

    // ── TTL ────────────────────────────────────────────────────────────

    #[test]
    fn expired_tokens_are_rejected() {
        let s = signer();
        let stale = OffsetDateTime::now_utc().unix_timestamp() - 901;
        let token = s.sign_at(&run_payload(), stale).unwrap();
        let res: Result<RunTokenPayload, _> = s.verify(&token);
        assert_eq!(res.unwrap_err(), TokenError::Expired);
    }

    #[test]
    fn future_issued_tokens_are_rejected() {
        let s = signer();
        let future = OffsetDateTime::now_utc().unix_timestamp() + 3600;
        let token = s.sign_at(&run_payload(), future).unwrap();
        let res: Result<RunTokenPayload, _> = s.verify(&token);
        assert_eq!(res.unwrap_err(), TokenError::Expired);
    }

    #[test]
    fn fresh_tokens_pass_ttl_check() {
        let s = signer();
        let token = s.sign(&run_payload()).unwrap();
        assert!(s.verify::<RunTokenPayload>(&token).is_ok());
    }
}
