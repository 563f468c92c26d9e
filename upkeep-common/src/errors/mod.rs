//! Error catalog and failure taxonomy for upkeep.
//!
//! [`ErrorCode`] gives every user-facing failure a stable `UPK-Exxx`
//! code with remediation steps; [`ErrorKind`] is the tagged taxonomy the
//! git layer and branch processor use to decide between retrying,
//! recording a per-branch error and aborting the repository run.

pub mod catalog;
pub mod kind;

pub use catalog::{ErrorCategory, ErrorCode, ErrorEntry};
pub use kind::ErrorKind;
