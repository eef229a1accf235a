//! Core domain types for fenceref.
//!
//! This crate contains pure domain types with no IO, no async, and minimal dependencies.
//! Everything here can be used from any layer of the application.

// Pedantic lint configuration - these are intentional design choices
#![allow(clippy::missing_errors_doc)] // Result-returning functions are self-explanatory
#![allow(clippy::missing_panics_doc)] // Panics are documented in assertions

mod block;
mod config;
mod error;
mod ids;
mod parser;
mod reference;

pub use block::FenceBlock;
pub use config::{
    AllowedDirectory, ApiEndpointConfig, AuthType, PersistentVariable, RateLimit, RateLimitPolicy,
};
pub use error::{ErrorKind, ResolveError};
pub use ids::BlockId;
pub use parser::{
    ParsedToken, ReferenceGroup, contains_references, group_references, parse_references,
};
pub use reference::{
    GitHubIssueRef, PathRejection, Reference, ReferenceKind, Signature, SignatureParseError,
    normalize_relative_path,
};
