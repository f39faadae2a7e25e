//! The DIMSE SCP engine: association acceptance and the C-ECHO, C-FIND and
//! C-MOVE services. C-MOVE translates to WADO-RS downloads forwarded as
//! C-STORE sub-operations.

pub mod cecho;
pub mod cfind;
pub mod cmove;
pub mod cstore;
pub mod engine;

pub use cmove::{AssociationKey, MoveOutcome};
pub use engine::{ScpContext, ScpEngine, ScpError};
