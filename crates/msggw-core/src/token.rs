//! Token verification and token-status lookup.
//!
//! Tokens are issued elsewhere; the gateway only checks them. A token is the
//! hex encoding of `[8-byte BE expiry][32-byte HMAC-SHA256]`, where the MAC
//! covers `expiry || user_id || 0x00 || platform_id (BE)`. A structurally
//! valid token may still be rejected by the [`TokenStore`] when it has been
//! kicked or is unknown to the store.

use crate::error::{GatewayError, GatewayResult};
use crate::long_conn::ConnFuture;
use ring::hmac;
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{SystemTime, UNIX_EPOCH};

const EXPIRY_LEN: usize = 8;
const TAG_LEN: usize = 32;
const TOKEN_LEN: usize = EXPIRY_LEN + TAG_LEN;

pub const NORMAL_TOKEN: i32 = 0;
pub const INVALID_TOKEN: i32 = 1;
pub const KICKED_TOKEN: i32 = 2;
pub const EXPIRED_TOKEN: i32 = 3;

/// Revocation state of an issued token, as recorded by the token store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenStatus {
    Normal,
    Kicked,
    Other(i32),
}

impl TokenStatus {
    pub fn from_code(code: i32) -> Self {
        match code {
            NORMAL_TOKEN => TokenStatus::Normal,
            KICKED_TOKEN => TokenStatus::Kicked,
            other => TokenStatus::Other(other),
        }
    }
}

/// Structural / cryptographic token check.
pub trait TokenVerifier: Send + Sync {
    fn verify(&self, token: &str, user_id: &str, platform_id: i32) -> GatewayResult<()>;
}

/// Lookup of token statuses for a user on a platform.
///
/// Implementations are shared by every connection task and must tolerate
/// concurrent calls.
pub trait TokenStore: Send + Sync {
    /// Map from token string to status code for `(user_id, platform_id)`.
    fn get_tokens<'a>(
        &'a self,
        user_id: &'a str,
        platform_id: i32,
    ) -> ConnFuture<'a, GatewayResult<HashMap<String, i32>>>;
}

/// Decide whether `token` may proceed given the statuses from the store.
pub fn check_token_status(tokens: &HashMap<String, i32>, token: &str) -> GatewayResult<()> {
    match tokens.get(token).copied().map(TokenStatus::from_code) {
        Some(TokenStatus::Normal) => Ok(()),
        Some(TokenStatus::Kicked) => Err(GatewayError::TokenKicked),
        Some(TokenStatus::Other(code)) => {
            Err(GatewayError::TokenUnknown(format!("token status is {code}")))
        }
        None => Err(GatewayError::TokenNotExist),
    }
}

/// HMAC-SHA256 verifier sharing its secret with the token issuer.
pub struct HmacTokenVerifier {
    secret: Vec<u8>,
}

impl HmacTokenVerifier {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
        }
    }
}

impl TokenVerifier for HmacTokenVerifier {
    fn verify(&self, token: &str, user_id: &str, platform_id: i32) -> GatewayResult<()> {
        verify_token(&self.secret, user_id, platform_id, token)
    }
}

/// Create a token for `user_id` on `platform_id`, valid for `ttl_secs`.
pub fn create_token(secret: &[u8], user_id: &str, platform_id: i32, ttl_secs: u64) -> String {
    create_token_with_expiry(secret, user_id, platform_id, unix_secs() + ttl_secs)
}

fn create_token_with_expiry(secret: &[u8], user_id: &str, platform_id: i32, expiry: u64) -> String {
    let key = hmac::Key::new(hmac::HMAC_SHA256, secret);
    let tag = hmac::sign(&key, &signed_data(expiry, user_id, platform_id));

    let mut token = Vec::with_capacity(TOKEN_LEN);
    token.extend_from_slice(&expiry.to_be_bytes());
    token.extend_from_slice(tag.as_ref());
    hex::encode(token)
}

/// Verify a token against the user and platform it claims to belong to.
pub fn verify_token(secret: &[u8], user_id: &str, platform_id: i32, token: &str) -> GatewayResult<()> {
    let raw = hex::decode(token)
        .map_err(|e| GatewayError::TokenMalformed(format!("token is not hex: {e}")))?;
    if raw.len() != TOKEN_LEN {
        return Err(GatewayError::TokenMalformed(format!(
            "invalid token length: expected {TOKEN_LEN}, got {}",
            raw.len()
        )));
    }

    let mut expiry_bytes = [0u8; EXPIRY_LEN];
    expiry_bytes.copy_from_slice(&raw[..EXPIRY_LEN]);
    let expiry = u64::from_be_bytes(expiry_bytes);

    if unix_secs() > expiry {
        return Err(GatewayError::TokenExpired);
    }

    let key = hmac::Key::new(hmac::HMAC_SHA256, secret);
    hmac::verify(&key, &signed_data(expiry, user_id, platform_id), &raw[EXPIRY_LEN..])
        .map_err(|_| GatewayError::TokenInvalid("token does not match user or platform".into()))
}

/// Generate a random 32-byte secret.
pub fn generate_secret() -> GatewayResult<Vec<u8>> {
    use ring::rand::{SecureRandom, SystemRandom};
    let rng = SystemRandom::new();
    let mut secret = vec![0u8; 32];
    rng.fill(&mut secret)
        .map_err(|_| GatewayError::Other("system RNG failure".into()))?;
    Ok(secret)
}

fn signed_data(expiry: u64, user_id: &str, platform_id: i32) -> Vec<u8> {
    let mut data = Vec::with_capacity(EXPIRY_LEN + user_id.len() + 5);
    data.extend_from_slice(&expiry.to_be_bytes());
    data.extend_from_slice(user_id.as_bytes());
    data.push(0);
    data.extend_from_slice(&platform_id.to_be_bytes());
    data
}

fn unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// In-process token store, used for development and tests.
#[derive(Debug, Default)]
pub struct MemoryTokenStore {
    tokens: RwLock<HashMap<(String, i32), HashMap<String, i32>>>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_token_status(&self, user_id: &str, platform_id: i32, token: &str, status: i32) {
        let mut tokens = self.tokens.write().unwrap_or_else(|e| e.into_inner());
        tokens
            .entry((user_id.to_string(), platform_id))
            .or_default()
            .insert(token.to_string(), status);
    }

    pub fn remove_token(&self, user_id: &str, platform_id: i32, token: &str) {
        let mut tokens = self.tokens.write().unwrap_or_else(|e| e.into_inner());
        if let Some(m) = tokens.get_mut(&(user_id.to_string(), platform_id)) {
            m.remove(token);
        }
    }

    fn snapshot(&self, user_id: &str, platform_id: i32) -> HashMap<String, i32> {
        let tokens = self.tokens.read().unwrap_or_else(|e| e.into_inner());
        tokens
            .get(&(user_id.to_string(), platform_id))
            .cloned()
            .unwrap_or_default()
    }
}

impl TokenStore for MemoryTokenStore {
    fn get_tokens<'a>(
        &'a self,
        user_id: &'a str,
        platform_id: i32,
    ) -> ConnFuture<'a, GatewayResult<HashMap<String, i32>>> {
        Box::pin(async move { Ok(self.snapshot(user_id, platform_id)) })
    }
}
