//! Credential and token handling.
//!
//! Tokens are ciphertext at rest and decrypted per-operation in process
//! memory only. Short-lived bearer JWTs carry user and workspace ids;
//! OAuth rendezvous sessions pair a CLI-initiated authorization with its
//! provider callback.

pub mod credentials;
pub mod crypto;
pub mod jwt;
pub mod session;

pub use credentials::{ShopifyCredentialStore, ShopRecord, SlackCredentials};
pub use crypto::TokenCipher;
pub use jwt::{BearerToken, JwtIssuer};
pub use session::{Session, SessionTable};
