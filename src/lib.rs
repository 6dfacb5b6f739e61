//! rbac-sync - keeps ClusterRoleBindings in sync with declared identity bindings
//!
//! Bindings are declared in annotated ConfigMaps as a role plus a list of typed
//! user identifiers (sub-account ids, emails). Every convergence pass re-reads
//! those declarations, resolves each identifier to the canonical principal name
//! through the cloud identity service, and converges the managed
//! ClusterRoleBindings on the cluster to match.
//!
//! # Modules
//!
//! - [`binding`] - Desired/managed binding types and the management marker
//! - [`source`] - ConfigMap parsing and the reflector-backed configuration source
//! - [`identity`] - Identity service abstraction and the Tencent Cloud client
//! - [`resolver`] - Concurrent, rate-limited identifier resolution
//! - [`reconciler`] - Add/update/delete planning and ownership-safe apply
//! - [`coalescer`] - Debounce of change notifications into convergence passes
//! - [`controller`] - Wiring of watch events, coalescer, and the pass pipeline
//! - [`config`] - Runtime configuration
//! - [`retry`] - Bounded retry with backoff
//! - [`error`] - Error types

#![deny(missing_docs)]

pub mod binding;
pub mod coalescer;
pub mod config;
pub mod controller;
pub mod error;
pub mod identity;
pub mod reconciler;
pub mod resolver;
pub mod retry;
pub mod source;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Default Configuration Constants
// =============================================================================

/// Default interval between forced convergence passes, in seconds
pub const DEFAULT_RESYNC_INTERVAL_SECS: u64 = 300;

/// Default quiet period after the last change before a pass runs, in milliseconds
pub const DEFAULT_DEBOUNCE_MILLIS: u64 = 1000;

/// Default request rate against the identity service, per worker
pub const DEFAULT_REQUESTS_PER_SECOND: u32 = 5;

/// Number of cache readiness attempts before giving up
pub const CACHE_SYNC_ATTEMPTS: u32 = 5;

/// Field manager name used for API writes
pub const FIELD_MANAGER: &str = "rbac-sync";
