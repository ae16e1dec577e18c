//! Volume resize lifecycle for CSI volumes.
//!
//! A claim requests more capacity, the [`intake`] validates the request, the
//! [`reconciler`] drives the [`expander`] which grows the backing volume in the
//! storage [`backend`], and the [`node`] resizer grows the filesystem of attached
//! volumes. All progress is published through the claim status held by the
//! [`store`].

/// The CSI plugin's name.
pub use utils::CSI_PLUGIN_NAME;

/// Storage backend clients.
pub mod backend;
/// Synchronous claim capacity updates.
pub mod capacity;
/// Resize configuration.
pub mod config;
/// Explicit component context.
pub mod context;
/// Error taxonomy.
pub mod error;
/// Controller side volume expansion.
pub mod expander;
/// Filesystem type definitions.
pub mod filesystem;
/// Admission of resize requests.
pub mod intake;
/// Volume concurrency limiter.
pub mod limiter;
/// Node side filesystem resize.
pub mod node;
/// Controller side resize state machine.
pub mod reconciler;
/// Orchestrator object store.
pub mod store;
/// Claim and volume data model.
pub mod types;
/// Capacity units and conversions.
pub mod units;
/// Bounded polling helpers.
pub mod wait;

pub use error::Error;
