//! Shared value types for the Flare alert relay. Everything here is plain
//! data: the server, the client harness and the persistence adapters all agree
//! on these shapes without copying them across crates.

pub mod credential;
pub mod identity;
pub mod message;
pub mod token;

pub use credential::{digest_secret, CredentialRecord};
pub use identity::{Identity, IdentityError};
pub use message::{format_timestamp, now_timestamp, ChatMessage, InboundFrame, TIMESTAMP_FORMAT};
pub use token::{SessionClaims, TokenValidationError};
