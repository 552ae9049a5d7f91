//! Deposit local BagIt packages into an InvenioRDM repository as a tree of
//! linked records, and mirror published trees back to disk.

pub mod config;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod routes;
pub mod services;
