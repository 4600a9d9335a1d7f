//! # relay-core
//!
//! Core abstractions for the Relay background job queue.
//!
//! This crate provides the foundational types used across all Relay
//! components:
//!
//! - **Identifiers**: Strongly-typed ULIDs for jobs, chains, and events
//! - **Tenancy**: The opaque partition key that scopes every record
//! - **Error Types**: Shared error definitions and result types
//! - **Observability**: Logging bootstrap and span constructors
//!
//! ## Crate Boundary
//!
//! `relay-core` is the only crate allowed to define shared primitives. The
//! queue engine (`relay-queue`) builds on these contracts; nothing in this
//! crate knows about job statuses, leases, or stores.
//!
//! ## Example
//!
//! ```rust
//! use relay_core::prelude::*;
//!
//! let tenant = TenantId::new("acme-academy").unwrap();
//! let job_id = JobId::generate();
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod id;
pub mod observability;
pub mod tenant;

/// Prelude module for convenient imports.
///
/// # Example
///
/// ```rust
/// use relay_core::prelude::*;
/// ```
pub mod prelude {
    pub use crate::error::{Error, Result};
    pub use crate::id::{ChainId, JobId};
    pub use crate::tenant::TenantId;
}

// Re-export key types at crate root for ergonomics
pub use error::{Error, Result};
pub use id::{ChainId, JobId};
pub use observability::{init_logging, LogFormat};
pub use tenant::TenantId;
