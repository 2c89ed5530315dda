//! # drydock-id
//!
//! Typed identifiers used across the reconciliation engine.
//!
//! Two families of ids exist:
//!
//! - **Generated ids** are minted by the director itself (agent ids handed to
//!   freshly created VMs, task and lock-owner ids). They use the prefixed
//!   format `{prefix}_{ulid}` and parse strictly.
//! - **Cloud ids** ("cids") are opaque strings assigned by the infrastructure
//!   API for VMs, disks and stemcells. The director never interprets them; it
//!   only stores and echoes them back, so they wrap a `String` and reject only
//!   the empty string.
//!
//! Both are typed so a disk cid can never be passed where a VM cid is expected.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
