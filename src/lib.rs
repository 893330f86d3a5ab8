//! Stateful, sandboxed evaluation of numeric code cells.
//!
//! Each session owns one worker process (this binary started as
//! `mathcell worker`) holding a persistent namespace. Submitted code is
//! statically validated against a [`security::SecurityPolicy`] before it runs.

pub mod config;
pub mod error;
pub mod http_server;
pub mod lang;
pub mod manager;
pub mod metrics;
pub mod sandbox;
pub mod security;
pub mod session;
pub mod state;
pub mod worker;

pub use config::Settings;
pub use error::CellError;
pub use manager::SessionManager;
pub use session::{Session, SessionSnapshot, WorkerResult};
