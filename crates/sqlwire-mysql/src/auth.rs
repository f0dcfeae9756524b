//! MySQL authentication plugins.
//!
//! Plugins are looked up by the name the server advertises:
//! - `mysql_native_password`: SHA1-based (MySQL < 8.0 default)
//! - `caching_sha2_password`: SHA256-based (MySQL 8.0+ default)
//! - `sha256_password`: password sent RSA-encrypted
//! - `mysql_clear_password`: cleartext, only when explicitly enabled
//!
//! # mysql_native_password
//!
//! ```text
//! SHA1(password) XOR SHA1(seed + SHA1(SHA1(password)))
//! ```
//!
//! # caching_sha2_password
//!
//! Fast auth (if cached on server):
//! ```text
//! XOR(SHA256(password), SHA256(SHA256(SHA256(password)) + seed))
//! ```
//!
//! Full auth over a plain TCP connection encrypts the password with the
//! server's RSA public key (OAEP padding).

use rand::rngs::OsRng;
use rsa::RsaPublicKey;
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::pkcs8::DecodePublicKey;
use sha1::Sha1;
use sha2::{Digest, Sha256};
use sqlwire_core::{AuthError, AuthErrorKind};

/// Well-known authentication plugin names.
pub mod plugins {
    pub const MYSQL_NATIVE_PASSWORD: &str = "mysql_native_password";
    pub const CACHING_SHA2_PASSWORD: &str = "caching_sha2_password";
    pub const SHA256_PASSWORD: &str = "sha256_password";
    pub const MYSQL_CLEAR_PASSWORD: &str = "mysql_clear_password";
}

/// Status bytes carried in AuthMoreData (0x01) packets.
pub mod caching_sha2 {
    /// Client asks for the server's RSA public key
    pub const REQUEST_PUBLIC_KEY: u8 = 0x02;
    /// Fast auth succeeded; an OK packet follows
    pub const FAST_AUTH_SUCCESS: u8 = 0x03;
    /// Scramble not cached; full password exchange required
    pub const PERFORM_FULL_AUTH: u8 = 0x04;
}

/// A supported authentication plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthPlugin {
    NativePassword,
    CachingSha2Password,
    Sha256Password,
    ClearPassword,
}

impl AuthPlugin {
    /// Look up a plugin by its protocol name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            plugins::MYSQL_NATIVE_PASSWORD => Some(Self::NativePassword),
            plugins::CACHING_SHA2_PASSWORD => Some(Self::CachingSha2Password),
            plugins::SHA256_PASSWORD => Some(Self::Sha256Password),
            plugins::MYSQL_CLEAR_PASSWORD => Some(Self::ClearPassword),
            _ => None,
        }
    }

    /// Resolve the plugin the server asked for.
    ///
    /// Unknown plugins, and the cleartext plugin unless allowed, fail with
    /// `UnsupportedPlugin`.
    pub fn negotiate(name: &str, allow_cleartext: bool) -> Result<Self, AuthError> {
        match Self::from_name(name) {
            Some(Self::ClearPassword) if !allow_cleartext => Err(AuthError {
                kind: AuthErrorKind::UnsupportedPlugin(name.to_string()),
                message: "cleartext password plugin requested but not enabled".to_string(),
                code: None,
            }),
            Some(plugin) => Ok(plugin),
            None => Err(AuthError {
                kind: AuthErrorKind::UnsupportedPlugin(name.to_string()),
                message: format!("authentication plugin '{name}' is not supported"),
                code: None,
            }),
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::NativePassword => plugins::MYSQL_NATIVE_PASSWORD,
            Self::CachingSha2Password => plugins::CACHING_SHA2_PASSWORD,
            Self::Sha256Password => plugins::SHA256_PASSWORD,
            Self::ClearPassword => plugins::MYSQL_CLEAR_PASSWORD,
        }
    }

    /// First auth response for this plugin.
    ///
    /// `sha256_password` either encrypts straight away with a configured key
    /// or sends `0x01` to ask the server for its key.
    pub fn initial_response(
        self,
        password: &str,
        seed: &[u8],
        server_public_key: Option<&[u8]>,
    ) -> Result<Vec<u8>, AuthError> {
        match self {
            Self::NativePassword => Ok(mysql_native_password(password, seed)),
            Self::CachingSha2Password => Ok(caching_sha2_password(password, seed)),
            Self::ClearPassword => Ok(clear_password(password)),
            Self::Sha256Password => {
                if password.is_empty() {
                    Ok(Vec::new())
                } else if let Some(key) = server_public_key {
                    rsa_encrypt_password(password, seed, key)
                } else {
                    Ok(vec![0x01])
                }
            }
        }
    }
}

/// Compute the mysql_native_password response.
///
/// Returns an empty response for an empty password.
pub fn mysql_native_password(password: &str, auth_data: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return vec![];
    }

    let seed = &auth_data[..auth_data.len().min(20)];

    let stage1: [u8; 20] = Sha1::digest(password.as_bytes()).into();
    let stage2: [u8; 20] = Sha1::digest(stage1).into();

    let mut hasher = Sha1::new();
    hasher.update(seed);
    hasher.update(stage2);
    let stage3: [u8; 20] = hasher.finalize().into();

    stage1.iter().zip(stage3.iter()).map(|(a, b)| a ^ b).collect()
}

/// Compute the caching_sha2_password fast-auth response.
///
/// Returns an empty response for an empty password.
pub fn caching_sha2_password(password: &str, auth_data: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return vec![];
    }

    // Servers may send the 20-byte scramble followed by a NUL
    let seed = if auth_data.len() == 21 && auth_data.last() == Some(&0) {
        &auth_data[..20]
    } else {
        auth_data
    };

    let password_hash: [u8; 32] = Sha256::digest(password.as_bytes()).into();
    let password_hash_hash: [u8; 32] = Sha256::digest(password_hash).into();

    let mut hasher = Sha256::new();
    hasher.update(password_hash_hash);
    hasher.update(seed);
    let scramble: [u8; 32] = hasher.finalize().into();

    password_hash
        .iter()
        .zip(scramble.iter())
        .map(|(a, b)| a ^ b)
        .collect()
}

/// NUL-terminated cleartext password.
pub fn clear_password(password: &str) -> Vec<u8> {
    let mut out = password.as_bytes().to_vec();
    out.push(0);
    out
}

/// Encrypt the password with the server's RSA public key.
///
/// The NUL-terminated password is XORed with the rotating seed, then
/// encrypted with OAEP(SHA1). Accepts SPKI and PKCS#1 PEM keys.
pub fn rsa_encrypt_password(
    password: &str,
    seed: &[u8],
    public_key_pem: &[u8],
) -> Result<Vec<u8>, AuthError> {
    if seed.is_empty() {
        return Err(full_auth_error("empty auth seed"));
    }

    let mut pw = clear_password(password);
    for (i, b) in pw.iter_mut().enumerate() {
        *b ^= seed[i % seed.len()];
    }

    let pem = std::str::from_utf8(public_key_pem)
        .map_err(|e| full_auth_error(format!("public key is not valid PEM: {e}")))?;
    let pem = pem.trim_end_matches('\0').trim();

    let key = RsaPublicKey::from_public_key_pem(pem)
        .or_else(|_| RsaPublicKey::from_pkcs1_pem(pem))
        .map_err(|e| full_auth_error(format!("failed to parse RSA public key: {e}")))?;

    key.encrypt(&mut OsRng, rsa::Oaep::new::<Sha1>(), &pw)
        .map_err(|e| full_auth_error(format!("RSA encryption failed: {e}")))
}

fn full_auth_error(message: impl Into<String>) -> AuthError {
    AuthError {
        kind: AuthErrorKind::FullAuthUnavailable,
        message: message.into(),
        code: None,
    }
}
