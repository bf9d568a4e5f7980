#![allow(dead_code)]

pub mod provider;

use media_upload::{
    db,
    models::Variant,
    providers::{self, ProviderSettings, SharedAdapter},
    services::{
        ChunkTransferClient, MetadataStore, RetryPolicy, UploadCoordinator, UploadService,
    },
};
use provider::{API_KEY, MockProvider};
use sqlx::SqlitePool;
use std::{io::Write, sync::Arc, time::Duration};
use tempfile::NamedTempFile;

pub const MIB: u64 = 1024 * 1024;

pub async fn memory_pool() -> Arc<SqlitePool> {
    Arc::new(db::connect_in_memory().await.expect("in-memory sqlite"))
}

/// Short delays so retry paths finish quickly.
pub fn fast_policy() -> RetryPolicy {
    RetryPolicy {
        max_attempts_per_chunk: 4,
        backoff_base: Duration::from_millis(10),
        backoff_cap: Duration::from_millis(50),
        attempt_timeout: Duration::from_secs(10),
        session_timeout: Duration::from_secs(3600),
    }
}

pub fn adapter(
    provider: &MockProvider,
    variant: Variant,
    chunk_size: u64,
    policy: &RetryPolicy,
) -> SharedAdapter {
    providers::build_adapter(
        variant,
        ProviderSettings {
            base_url: provider.base_url.clone(),
            api_key: Some(API_KEY.into()),
            chunk_size,
            request_timeout: policy.attempt_timeout,
        },
    )
    .expect("adapter")
}

pub async fn service(
    provider: &MockProvider,
    variant: Variant,
    chunk_size: u64,
    policy: RetryPolicy,
) -> UploadService {
    let adapter = adapter(provider, variant, chunk_size, &policy);
    UploadService::new(memory_pool().await, adapter, policy)
}

/// Coordinator and client wired by hand, for tests that need to act between
/// session creation and the transfer.
pub struct Engine {
    pub coordinator: Arc<UploadCoordinator>,
    pub client: ChunkTransferClient,
    pub pool: Arc<SqlitePool>,
}

pub async fn engine(
    provider: &MockProvider,
    variant: Variant,
    chunk_size: u64,
    policy: RetryPolicy,
) -> Engine {
    let pool = memory_pool().await;
    let adapter = adapter(provider, variant, chunk_size, &policy);
    let coordinator = Arc::new(UploadCoordinator::new(
        MetadataStore::new(pool.clone()),
        adapter.clone(),
        policy.session_timeout,
    ));
    let client = ChunkTransferClient::new(coordinator.clone(), adapter, policy);
    Engine {
        coordinator,
        client,
        pool,
    }
}

/// Deterministic, non-repeating-per-chunk content.
pub fn pattern(len: u64) -> Vec<u8> {
    (0..len).map(|i| ((i * 31 + i / 7919) % 251) as u8).collect()
}

pub fn source_file(bytes: &[u8]) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("temp file");
    file.write_all(bytes).expect("write source");
    file.flush().expect("flush source");
    file
}

pub async fn count_rows(pool: &SqlitePool, table: &str) -> i64 {
    sqlx::query_scalar::<_, i64>(&format!("SELECT COUNT(*) FROM {table}"))
        .fetch_one(pool)
        .await
        .expect("count rows")
}
