//! Login tokens.
//!
//! A token is `sessionId;userName;issueTimeSec;` encrypted with AES-256-CBC
//! under a process-local key, a fresh random IV per token, zero padding, and
//! base64 text encoding. The key lives in `./.depi_session_key`, generated
//! on first start.

use std::fs;
use std::io::Write;
use std::path::Path;

use aes::cipher::block_padding::ZeroPadding;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::RngCore;
use thiserror::Error;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

const BLOCK_SIZE: usize = 16;
pub const KEY_FILE: &str = ".depi_session_key";

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TokenError {
    #[error("invalid token: {reason}")]
    Invalid { reason: &'static str },

    #[error("token expired")]
    Expired,

    #[error("token key unavailable: {0}")]
    Key(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenClaims {
    pub session_id: String,
    pub user: String,
    pub issued_at_secs: i64,
}

pub struct TokenCodec {
    key: [u8; 32],
}

impl TokenCodec {
    pub fn new(key: [u8; 32]) -> Self {
        TokenCodec { key }
    }

    /// Load the key file, generating 32 random bytes with mode 0700 when it
    /// does not exist yet.
    pub fn load_or_create(path: &Path) -> Result<Self, TokenError> {
        if path.exists() {
            let bytes = fs::read(path).map_err(|e| TokenError::Key(e.to_string()))?;
            let key: [u8; 32] = bytes
                .try_into()
                .map_err(|_| TokenError::Key("key file is not 32 bytes".to_string()))?;
            return Ok(TokenCodec { key });
        }

        let mut key = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut key);

        let mut options = fs::OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o700);
        }
        let mut file = options
            .open(path)
            .map_err(|e| TokenError::Key(e.to_string()))?;
        file.write_all(&key)
            .map_err(|e| TokenError::Key(e.to_string()))?;
        Ok(TokenCodec { key })
    }

    pub fn generate(&self, session_id: &str, user: &str, issued_at_secs: i64) -> String {
        let payload = format!("{session_id};{user};{issued_at_secs};");

        let mut iv = [0u8; BLOCK_SIZE];
        rand::thread_rng().fill_bytes(&mut iv);

        let ciphertext = Aes256CbcEnc::new(&self.key.into(), &iv.into())
            .encrypt_padded_vec_mut::<ZeroPadding>(payload.as_bytes());

        let mut out = Vec::with_capacity(BLOCK_SIZE + ciphertext.len());
        out.extend_from_slice(&iv);
        out.extend_from_slice(&ciphertext);
        BASE64.encode(out)
    }

    pub fn decode(&self, token: &str) -> Result<TokenClaims, TokenError> {
        let data = BASE64.decode(token).map_err(|_| TokenError::Invalid {
            reason: "not valid base64",
        })?;
        if data.len() < 2 * BLOCK_SIZE || (data.len() - BLOCK_SIZE) % BLOCK_SIZE != 0 {
            return Err(TokenError::Invalid {
                reason: "truncated ciphertext",
            });
        }
        let (iv, ciphertext) = data.split_at(BLOCK_SIZE);
        let iv: [u8; BLOCK_SIZE] = iv.try_into().map_err(|_| TokenError::Invalid {
            reason: "bad initialization vector",
        })?;

        let plaintext = Aes256CbcDec::new(&self.key.into(), &iv.into())
            .decrypt_padded_vec_mut::<ZeroPadding>(ciphertext)
            .map_err(|_| TokenError::Invalid {
                reason: "bad padding",
            })?;
        let text = String::from_utf8(plaintext).map_err(|_| TokenError::Invalid {
            reason: "not valid utf-8",
        })?;
        let text = text.trim_end_matches('\0');

        let mut parts = text.split(';');
        let session_id = parts.next().unwrap_or_default();
        let user = parts.next().unwrap_or_default();
        let timestamp = parts.next().ok_or(TokenError::Invalid {
            reason: "missing fields",
        })?;
        if session_id.is_empty() || user.is_empty() {
            return Err(TokenError::Invalid {
                reason: "missing fields",
            });
        }
        let issued_at_secs: i64 = timestamp.parse().map_err(|_| TokenError::Invalid {
            reason: "unparseable timestamp",
        })?;

        Ok(TokenClaims {
            session_id: session_id.to_string(),
            user: user.to_string(),
            issued_at_secs,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec() -> TokenCodec {
        TokenCodec::new([7u8; 32])
    }

    #[test]
    fn roundtrip_preserves_claims() {
        let codec = codec();
        let token = codec.generate("session-1", "mark", 1_700_000_000);
        let claims = codec.decode(&token).expect("decode");
        assert_eq!(claims.session_id, "session-1");
        assert_eq!(claims.user, "mark");
        assert_eq!(claims.issued_at_secs, 1_700_000_000);
    }

    #[test]
    fn tokens_differ_per_issue() {
        let codec = codec();
        let a = codec.generate("s", "u", 1);
        let b = codec.generate("s", "u", 1);
        // random IV per token
        assert_ne!(a, b);
        assert_eq!(codec.decode(&a).unwrap(), codec.decode(&b).unwrap());
    }

    #[test]
    fn garbage_is_invalid() {
        let codec = codec();
        assert!(matches!(
            codec.decode("not-base64!!"),
            Err(TokenError::Invalid { .. })
        ));
        assert!(matches!(
            codec.decode(&BASE64.encode([1u8; 8])),
            Err(TokenError::Invalid { .. })
        ));
    }

    #[test]
    fn wrong_key_fails_to_parse() {
        let token = codec().generate("session-1", "mark", 123);
        let other = TokenCodec::new([9u8; 32]);
        assert!(other.decode(&token).is_err());
    }

    #[test]
    fn key_file_roundtrip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join(KEY_FILE);
        let first = TokenCodec::load_or_create(&path).expect("create key");
        let second = TokenCodec::load_or_create(&path).expect("reload key");
        let token = first.generate("s", "u", 5);
        assert!(second.decode(&token).is_ok());
    }
}
