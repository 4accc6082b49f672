//! # relay-proxy
//!
//! Loopback credential-substitution proxy. The agent process only ever sees
//! a per-session placeholder; the real upstream credential stays in this
//! process, held as a `SecretString`.

pub mod credential;
pub mod proxy;

pub use credential::{ENV_API_KEY, ENV_AUTH_TOKEN, ENV_BASE_URL};
pub use proxy::{CredentialProxy, ProxySettings};
