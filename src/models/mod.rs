//! Core data models for the deposit pipeline.
//!
//! These types describe the local side (the record map of a package), the
//! remote side (draft records, file manifests, metadata) and the report that
//! collects the outcome of every step. They serialize as JSON via `serde`.

pub mod mapping;
pub mod metadata;
pub mod record;
pub mod report;
