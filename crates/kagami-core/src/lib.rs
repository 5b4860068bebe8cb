//! Domain layer for the kagami local synchronization engine.
//!
//! Everything in this crate is synchronous: the collection/entry/media tree
//! mirrored from the remote tracker, the local dependency inventory types,
//! snapshot records, reference-key fingerprints, the pure differ, and the
//! SQLite-backed store. The async engine lives in `kagami-engine`.

pub mod assets;
pub mod diff;
pub mod error;
pub mod models;
pub mod refkey;
pub mod storage;

pub use error::KagamiError;
