//! Formid - Rust-native file format identification engine
//!
//! This library compiles format databases (extensions, MIME types, container
//! structure, byte signatures, text classes and XML roots) into pluggable
//! matchers, and runs identification sessions that combine their evidence.
//! Sessions are driven by the [`Engine`]: each loaded [`Identifier`] gets a
//! fresh [`Recorder`] per session, matcher stages are skipped once every
//! recorder is satisfied, and each hit is claimed by at most one identifier.

pub mod bytematcher;
pub mod config;
pub mod containermatcher;
pub mod core;
pub mod engine;
pub mod error;
pub mod format;
pub mod identifier;
pub mod loader;
pub mod namematcher;
pub mod persist;
pub mod priority;
pub mod registry;
pub mod source;
pub mod textmatcher;
pub mod xmlmatcher;

#[cfg(feature = "async")]
pub mod async_loader;

#[cfg(test)]
mod comprehensive_tests;

// Re-export main types for convenience
#[cfg(feature = "async")]
pub use async_loader::{
    identify_file_async, load_database_from_file_async, load_database_from_xml_async,
    load_engine_from_file_async, load_multiple_databases_async,
};
pub use bytematcher::{Anchor, ByteMatcher, BytePattern, ByteSignature};
pub use config::{Config, Multi};
pub use containermatcher::{ContainerEntry, ContainerKind, ContainerMatcher, ContainerSignature};
pub use crate::core::{
    Archive, Hit, Identification, IdentificationSender, Identifier, Matcher, MatcherType,
    Recorder, SignatureSet,
};
pub use engine::{Engine, EngineBuilder, IdentificationStream, Identified, Matchers, SessionSummary};
pub use error::{FormidError, FormidResult, PersistError};
pub use format::{DatabaseInfo, Format, FormatDatabase};
pub use identifier::{FormatIdentification, FormatIdentifier, FormatRecorder};
pub use loader::{load_database_from_file, load_database_from_xml};
pub use namematcher::{ExtensionMatcher, MimeMatcher};
pub use persist::LoadSaver;
pub use priority::PriorityList;
pub use registry::{IdentifierLoader, Registry, FORMAT_REGISTRY, REGISTRY_CAPACITY};
pub use source::Buffer;
pub use textmatcher::{TextClass, TextMatcher};
pub use xmlmatcher::{XmlMatcher, XmlSignature};
