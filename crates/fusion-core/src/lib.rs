//! Shared primitives used by every other crate in the workspace: the stable
//! error taxonomy, the `AssetRef`/`VerRef`/`TaskId` identifiers, a monotonic
//! clock handle, and the on-disk configuration loaders.
//!
//! Nothing in this crate talks to a socket or touches the asset graph; it is
//! the "ubiquitous" layer the daemon and its tests both depend on.

pub mod config;
pub mod error;
pub mod ids;
pub mod time;

pub use error::{ErrorCategory, FusionError, Result};
pub use ids::{AssetRef, TaskId, VerRef};
pub use time::Clock;
