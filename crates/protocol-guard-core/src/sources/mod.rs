//! Protocol sources
//!
//! Trait-based interfaces for the primary protocol store and the lower
//! fidelity local index consulted when the store is failing.
//!
//! - **Primary store**: any `ProtocolSource` implementation supplied by the host
//! - **Local index**: a `LocalIndexLoader` wrapped in `LazyLocalIndex`, loaded once
//! - **File index**: `FileProtocolIndex`, a JSON/YAML backed index usable as either

pub mod file;
pub mod traits;

pub use file::{FileIndexLoader, FileProtocolIndex};
pub use traits::{LazyLocalIndex, LocalIndexLoader, ProtocolSource, SourceHealth};
