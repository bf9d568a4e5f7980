//! Upload engine services: persistence, session coordination, chunk transfer and the
//! facade the HTTP layer and CLI share.

pub mod coordinator;
pub mod locks;
pub mod metadata_store;
pub mod retry;
pub mod transfer_client;
pub mod upload_service;

pub use coordinator::{SessionCoordinator, UploadCoordinator};
pub use metadata_store::MetadataStore;
pub use retry::RetryPolicy;
pub use transfer_client::ChunkTransferClient;
pub use upload_service::UploadService;
