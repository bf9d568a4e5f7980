//! Core data models for the upload engine.
//!
//! `MediaResource` maps to a catalog table via `sqlx::FromRow`; `UploadSession` is
//! assembled by the metadata store from the session and part tables. Both serialize
//! as JSON via `serde`.

pub mod resource;
pub mod session;

pub use resource::{MediaResource, ResourceMetadata};
pub use session::{
    ChunkSpec, PartRange, PartRecord, Progress, ProgressUnit, ProviderHandle, SessionState,
    MAX_PARTS, SessionStatus, UploadSession, Variant, plan_parts,
};
