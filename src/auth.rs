//! Authentication credentials.
//!
//! Credentials are applied once per connect: the handshake reads the
//! server's `INFO`, and when a nonce is present and a signer is configured,
//! the nonce is signed and the signature carried in `CONNECT`.

use std::{fmt, sync::Arc};

use thiserror::Error;

/// Failure to sign a server-supplied nonce.
#[derive(Debug, Error)]
#[error("nonce signing failed: {0}")]
pub struct SignatureError(pub String);

/// Signs server-supplied nonces with a client key pair.
///
/// The returned signature must already be encoded in the textual form the
/// server expects; the engine embeds it verbatim in the handshake.
pub trait NonceSigner: Send + Sync {
    /// Textual public key identifying the signing key pair.
    fn public_key(&self) -> String;

    /// Sign `nonce`.
    ///
    /// # Errors
    ///
    /// Returns a [`SignatureError`] when the key material is unavailable or
    /// signing fails.
    fn sign(&self, nonce: &[u8]) -> Result<String, SignatureError>;
}

/// Credential material supplied to the handshake.
#[derive(Clone, Default)]
pub enum Credentials {
    /// Anonymous connection.
    #[default]
    None,
    /// Username and password.
    UserPass {
        /// Account username.
        user: String,
        /// Account password.
        pass: String,
    },
    /// Bearer token.
    Token(String),
    /// Public-key challenge: the server nonce is signed on every connect.
    Signer(Arc<dyn NonceSigner>),
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("Credentials::None"),
            Self::UserPass { user, .. } => f
                .debug_struct("Credentials::UserPass")
                .field("user", user)
                .finish_non_exhaustive(),
            Self::Token(_) => f.write_str("Credentials::Token(..)"),
            Self::Signer(signer) => f
                .debug_struct("Credentials::Signer")
                .field("public_key", &signer.public_key())
                .finish(),
        }
    }
}
