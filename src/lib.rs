//! A DICOM Query/Retrieve SCP gateway: legacy DIMSE clients (C-ECHO, C-FIND,
//! C-MOVE) are served from modern HTTP backends, an MHD FHIR endpoint for
//! study manifests and a WADO-RS endpoint for instance bytes.

pub mod aet;
pub mod cache;
pub mod config;
pub mod dimse;
pub mod gateway;
pub mod metadata;
pub mod mhd;
pub mod scp;
pub mod types;
pub mod wado;

pub use gateway::{Gateway, GatewayStatus};

/// The AE title this gateway uses when none is configured.
pub const DEFAULT_AET: &str = "MADOSCP";
