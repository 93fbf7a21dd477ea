//! Secret handling utilities.
//!
//! Re-exports secrecy types used for the database URL and mail API key.

pub use secrecy::{ExposeSecret, SecretString};
