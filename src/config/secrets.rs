//! Secret handling utilities.
//!
//! Re-exports the secrecy types the binary needs to unwrap the
//! database URL right before connecting.

pub use secrecy::{ExposeSecret, SecretString};
