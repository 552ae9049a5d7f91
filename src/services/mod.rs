//! Deposit pipeline services.
//!
//! Leaf components (checksums, file keys, record maps, bag checks) are plain
//! functions; everything that talks to the repository goes through the
//! [`repository::Repository`] trait.

pub mod bag_validator;
pub mod checksum;
pub mod deposit_service;
pub mod doi;
pub mod file_keys;
pub mod gate;
pub mod integrity;
pub mod invenio_client;
pub mod journal;
pub mod link_fixer;
pub mod mapping_service;
pub mod memory_repository;
pub mod metadata_reader;
pub mod mirror;
pub mod repository;
pub mod uploader;

#[cfg(test)]
pub(crate) mod test_support;
