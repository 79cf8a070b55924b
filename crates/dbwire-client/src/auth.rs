//! Authentication plugins and credential supply.
//!
//! This module implements the authentication methods the server may ask for:
//! - `mysql_native_password`: SHA1-based
//! - `caching_sha2_password`: SHA256-based, with a full-auth fallback
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
//! Full auth sends the password in clear over TLS, or RSA-encrypted with
//! the server's public key otherwise.
//!
//! Credentials come from a [`CredentialPlugin`], called once per handshake
//! so that reconnects pick up rotated secrets.

use std::fmt::Debug;

use sha1::Sha1;
use sha2::{Digest, Sha256};

use rand::rngs::OsRng;

use rsa::RsaPublicKey;
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::pkcs8::DecodePublicKey;

use crate::config::HostAddress;
use dbwire_core::error::{ConnectionError, ConnectionErrorKind};
use dbwire_core::{Error, Result};

/// Well-known authentication plugin names.
pub mod plugins {
    /// SHA1-based authentication (legacy default)
    pub const MYSQL_NATIVE_PASSWORD: &str = "mysql_native_password";
    /// SHA256-based authentication with server-side cache
    pub const CACHING_SHA2_PASSWORD: &str = "caching_sha2_password";
    /// RSA-based SHA256 authentication
    pub const SHA256_PASSWORD: &str = "sha256_password";
    /// Cleartext password (TLS only)
    pub const MYSQL_CLEAR_PASSWORD: &str = "mysql_clear_password";
}

/// Response codes for caching_sha2_password protocol.
pub mod caching_sha2 {
    /// Request for public key (client sends 0x02)
    pub const REQUEST_PUBLIC_KEY: u8 = 0x02;
    /// Fast auth success
    pub const FAST_AUTH_SUCCESS: u8 = 0x03;
    /// Full auth needed (switch to secure channel or RSA)
    pub const PERFORM_FULL_AUTH: u8 = 0x04;
}

/// A user name and secret for one handshake.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub user: String,
    pub password: Option<String>,
}

impl Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .finish()
    }
}

impl Credentials {
    pub fn new(user: impl Into<String>, password: Option<String>) -> Self {
        Self {
            user: user.into(),
            password,
        }
    }

    fn secret(&self) -> &str {
        self.password.as_deref().unwrap_or("")
    }
}

/// Supplies credentials and computes authentication responses.
///
/// The default `auth_response` covers the built-in plugins; implementors
/// override it to answer custom plugins.
pub trait CredentialPlugin: Send + Sync + Debug {
    /// Credentials for a handshake with `host`.
    fn credentials(&self, host: &HostAddress) -> Result<Credentials>;

    /// Scramble the secret for `plugin` with the server's `seed`.
    ///
    /// `secure` is true when the channel is TLS-protected.
    fn auth_response(
        &self,
        plugin: &str,
        seed: &[u8],
        credentials: &Credentials,
        secure: bool,
    ) -> Result<Vec<u8>> {
        compute_auth_response(plugin, seed, credentials, secure)
    }
}

/// The default plugin: a fixed user name and password.
#[derive(Debug, Clone, Default)]
pub struct PasswordCredentials {
    credentials: Credentials,
}

impl PasswordCredentials {
    pub fn new(user: impl Into<String>, password: Option<String>) -> Self {
        Self {
            credentials: Credentials::new(user, password),
        }
    }
}

impl CredentialPlugin for PasswordCredentials {
    fn credentials(&self, _host: &HostAddress) -> Result<Credentials> {
        Ok(self.credentials.clone())
    }
}

/// Compute the first authentication response for a built-in plugin.
pub fn compute_auth_response(
    plugin: &str,
    seed: &[u8],
    credentials: &Credentials,
    secure: bool,
) -> Result<Vec<u8>> {
    let password = credentials.secret();
    match plugin {
        plugins::MYSQL_NATIVE_PASSWORD => Ok(mysql_native_password(password, seed)),
        plugins::CACHING_SHA2_PASSWORD => Ok(caching_sha2_password(password, seed)),
        plugins::MYSQL_CLEAR_PASSWORD | plugins::SHA256_PASSWORD if secure => {
            let mut result = password.as_bytes().to_vec();
            result.push(0);
            Ok(result)
        }
        plugins::SHA256_PASSWORD if password.is_empty() => Ok(vec![0]),
        // Ask for the public key, encrypted password follows
        plugins::SHA256_PASSWORD => Ok(vec![1]),
        plugins::MYSQL_CLEAR_PASSWORD => Err(auth_error(
            "mysql_clear_password requires a TLS connection",
        )),
        other => Err(auth_error(format!(
            "Unsupported authentication plugin '{other}'"
        ))),
    }
}

/// Compute mysql_native_password authentication response.
///
/// Returns the 20-byte response, or an empty vec if the password is empty.
pub fn mysql_native_password(password: &str, auth_data: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return vec![];
    }

    let seed = if auth_data.len() > 20 {
        &auth_data[..20]
    } else {
        auth_data
    };

    let mut hasher = Sha1::new();
    hasher.update(password.as_bytes());
    let stage1: [u8; 20] = hasher.finalize().into();

    let mut hasher = Sha1::new();
    hasher.update(stage1);
    let stage2: [u8; 20] = hasher.finalize().into();

    let mut hasher = Sha1::new();
    hasher.update(seed);
    hasher.update(stage2);
    let stage3: [u8; 20] = hasher.finalize().into();

    stage1
        .iter()
        .zip(stage3.iter())
        .map(|(a, b)| a ^ b)
        .collect()
}

/// Compute caching_sha2_password fast authentication response.
///
/// Returns the 32-byte response, or an empty vec if the password is empty.
pub fn caching_sha2_password(password: &str, auth_data: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return vec![];
    }

    // 20-byte scramble plus NUL
    let seed = if auth_data.len() == 21 && auth_data.last() == Some(&0) {
        &auth_data[..20]
    } else {
        auth_data
    };

    let mut hasher = Sha256::new();
    hasher.update(password.as_bytes());
    let password_hash: [u8; 32] = hasher.finalize().into();

    let mut hasher = Sha256::new();
    hasher.update(password_hash);
    let password_hash_hash: [u8; 32] = hasher.finalize().into();

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

/// Full-auth response for caching_sha2_password/sha256_password.
///
/// Over TLS this is the NUL-terminated cleartext password. Otherwise the
/// caller must first fetch the server's public key and use
/// [`sha256_password_rsa`].
pub fn full_auth_cleartext(credentials: &Credentials) -> Vec<u8> {
    let mut result = credentials.secret().as_bytes().to_vec();
    result.push(0);
    result
}

/// Encrypt the password with the server's RSA public key.
///
/// The NUL-terminated password is XORed with the rotating seed, then
/// encrypted with OAEP (or PKCS#1 v1.5 for old servers).
pub fn sha256_password_rsa(
    password: &str,
    seed: &[u8],
    public_key_pem: &[u8],
    use_oaep: bool,
) -> Result<Vec<u8>> {
    if seed.is_empty() {
        return Err(auth_error("Authentication seed is empty"));
    }

    let mut pw = password.as_bytes().to_vec();
    pw.push(0);
    for (i, b) in pw.iter_mut().enumerate() {
        *b ^= seed[i % seed.len()];
    }

    let pem = std::str::from_utf8(public_key_pem)
        .map_err(|e| auth_error(format!("Public key is not valid UTF-8 PEM: {e}")))?;

    let pub_key = RsaPublicKey::from_public_key_pem(pem)
        .or_else(|_| RsaPublicKey::from_pkcs1_pem(pem))
        .map_err(|e| auth_error(format!("Failed to parse RSA public key PEM: {e}")))?;

    if use_oaep {
        pub_key
            .encrypt(&mut OsRng, rsa::Oaep::new::<Sha1>(), &pw)
            .map_err(|e| auth_error(format!("RSA OAEP encryption failed: {e}")))
    } else {
        pub_key
            .encrypt(&mut OsRng, rsa::Pkcs1v15Encrypt, &pw)
            .map_err(|e| auth_error(format!("RSA PKCS1v1.5 encryption failed: {e}")))
    }
}

pub(crate) fn auth_error(message: impl Into<String>) -> Error {
    Error::Connection(ConnectionError {
        kind: ConnectionErrorKind::Authentication,
        message: message.into(),
        source: None,
    })
}
