//! DSS Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared types, utilities, and error handling for the data store server
//! registration workspace.
//!
//! # Overview
//!
//! - **Error Handling**: `DssError` and the `ErrorClass` taxonomy every
//!   registration failure is mapped onto
//! - **Checksums**: file and directory-tree digests used for stored content
//! - **Logging**: `tracing` subscriber setup shared by all binaries
//! - **Types**: data set codes and entity identifiers
//!
//! # Example
//!
//! ```no_run
//! use dss_common::{checksum, Result};
//!
//! fn fingerprint(path: &str) -> Result<()> {
//!     let digest = checksum::compute_tree_checksum(path)?;
//!     println!("Tree checksum: {}", digest);
//!     Ok(())
//! }
//! ```

pub mod checksum;
pub mod error;
pub mod logging;
pub mod types;

// Re-export commonly used types
pub use error::{DssError, ErrorClass, Result};
