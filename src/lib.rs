//! Resumable chunked media uploads to third-party hosting providers.
//!
//! A local file is split into bounded chunks and sent to a provider-assigned
//! destination. Interrupted transfers resume by re-issuing the destination of the
//! failed part or by replaying from the last provider-confirmed offset. The final
//! provider object reference lands on a local catalog row.

pub mod config;
pub mod db;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod providers;
pub mod routes;
pub mod services;
