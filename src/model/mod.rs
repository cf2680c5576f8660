//! Data model shared by the resolver, the transfer pipeline and the orchestrator.

pub mod types;

pub use types::{
    BackendKind, HostCredential, LogSpec, ResolvedPath, Secret, Target, TransferOutcome,
    TransferRecord,
};
