//! Beame credentials - hierarchical X.509 provisioning for edge clients
//!
//! Credentials form a three-tier tree: a developer owns apps, and an app
//! owns edge clients. Each tier lives in its own directory nested under its
//! parent and can only be minted once every ancestor's key and certificate
//! are present locally.
//!
//! # Architecture
//!
//! Creating an edge client is a fixed pipeline:
//! - Hostnames are validated before any I/O
//! - The hierarchy gate proves the developer and app exist on disk
//! - A registration proxy is picked from the load-balancer directory
//! - The app registers the new edge client and receives its hostname and uid
//! - A CSR is generated locally, signed remotely, and the result is saved
//! - The edge credential is reloaded and its status recomputed
//!
//! # Modules
//!
//! - [`hierarchy`] - Hostname validation, chains, paths, and the hierarchy gate
//! - [`credential`] - Credential records and their derived status
//! - [`edge`] - Edge client registration and certificate issuance
//! - [`proxy`] - Registration proxy selection
//! - [`api`] - Remote request/response types and collaborator traits
//! - [`pki`] - CSR generation and certificate inspection
//! - [`store`] - Credential file persistence
//! - [`config`] - Provisioning configuration
//! - [`retry`] - Backoff for repeatable steps
//! - [`error`] - Error types

#![deny(missing_docs)]

pub mod api;
pub mod config;
pub mod credential;
pub mod edge;
pub mod error;
pub mod hierarchy;
pub mod pki;
pub mod proxy;
pub mod retry;
pub mod store;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;
