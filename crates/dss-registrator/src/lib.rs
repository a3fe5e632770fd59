//! DSS Registrator Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Drop-box registration engine: turns incoming deliveries into data sets,
//! moves them into a content-addressed store and records them in a remote
//! metadata registry, all or nothing.
//!
//! # Overview
//!
//! - **Registrator**: one delivery at a time, commit or abort, stop on
//!   interruption, dead-transaction recovery on startup
//! - **Service**: all transactions of one delivery, error aggregation, undo
//!   policy, registration log, clean-up action
//! - **Transactions**: staged storage with a persisted rollback stack and one
//!   atomic registry call
//! - **Scanner**: polls the drop box for settled deliveries or marker files

pub mod config;
pub mod context;
pub mod dataset_file;
pub mod details;
pub mod error;
pub mod fs_ops;
pub mod handler;
pub mod hooks;
pub mod marker;
pub mod notify;
pub mod outcome;
pub mod policy;
pub mod recovery;
pub mod registration_log;
pub mod registrator;
pub mod registry;
pub mod rollback;
pub mod scanner;
pub mod service;
pub mod storage;
pub mod transaction;

// Re-export commonly used types
pub use config::RegistratorConfig;
pub use context::EngineContext;
pub use error::{RegistrationError, Result};
pub use outcome::DeliveryOutcome;
pub use registrator::TopLevelRegistrator;
pub use service::RegistrationService;
pub use transaction::{Transaction, TransactionId};

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// DSS Registrator - drop-box registration engine
#[derive(Parser, Debug)]
#[command(name = "dss-registrator")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Print the CLI reference as markdown and exit
    #[arg(long, hide = true)]
    pub markdown_help: bool,
}

/// Available CLI commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Recover dead transactions, then watch the drop box until ctrl-c
    Run,

    /// Register a single delivery and print its outcome as JSON
    Process {
        /// Delivery (or is-finished marker) to register
        path: PathBuf,
    },

    /// Recover transactions left behind by a crashed process
    Recover,

    /// Check configuration, directories and the registry connection
    Check,
}
