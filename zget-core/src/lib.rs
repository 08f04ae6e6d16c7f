//! # zget-core
//!
//! Shared building blocks for zget, the password-protected local-network
//! file drop.
//!
//! This crate provides the types used by [`zget-engine`] and the `zget`
//! binary.
//!
//! ## Responsibilities
//!
//! - **Identity**: maps a filename to the hex service identity both peers
//!   rendezvous on over DNS-SD (`<identity>._zget._http._tcp.local.`).
//!
//! - **Cipher suites**: the password-authenticated (SPAKE2 +
//!   ChaCha20-Poly1305) and bypass postures, their key exchange and the
//!   sealed stream transforms.
//!
//! - **Discovery seams**: the set-once discovery record and the browser /
//!   registry traits implemented by the engine's mDNS and in-memory backends.
//!
//! - **Wire helpers**: header names, URL path encoding, key-exchange header
//!   encoding.
//!
//! - **Filesystem helpers**: temp-file write with atomic rename.
//!
//! - **Configuration and errors**: the TOML config file and the error
//!   taxonomy callers match on.

pub mod cipher;
pub mod config;
pub mod discovery;
pub mod error;
pub mod fs;
pub mod identity;
pub mod wire;

pub use cipher::{Ciphersuite, negotiate};
pub use error::{CipherError, ZgetError};
pub use identity::{SERVICE_TYPE, ServiceIdentity};
