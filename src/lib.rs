//! ACME DNS-01 certificate issuance.
//!
//! A run places an order, publishes one `_acme-challenge` TXT record per requested
//! domain, validates the domains one after another, saves the issued chain and
//! removes every record it published.

pub mod config;
pub mod domain;
pub mod issuance;
pub mod notify;
pub mod storage;
