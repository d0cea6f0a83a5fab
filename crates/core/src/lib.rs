//! `forgegen-core`: value types shared by the generation engine.
//!
//! This crate holds identifiers, family tokens and validation errors. It has no
//! threads, no IO and no knowledge of how jobs are run.

pub mod error;
pub mod family;
pub mod id;

pub use error::{CoreError, CoreResult};
pub use family::FamilyToken;
pub use id::{JobId, JobTreeId, ManagerId};
