//! Tracking ingestion: turns analytics hits into stored visits and actions.

pub mod action;
pub mod archive;
pub mod config;
pub mod db;
pub mod errors;
pub mod metrics_defs;
pub mod model;
pub mod request;
pub mod request_set;
pub mod response;
pub mod service;
pub mod store;
#[cfg(test)]
mod testutils;
pub mod tracker;
pub mod visit;

pub use errors::{Result, TrackerError};
pub use request::{ClientInfo, TrackingRequest};
pub use request_set::RequestBatch;
pub use response::TrackerResponse;
pub use tracker::{BatchOutcome, Tracker, TrackerEnv};

use service::{ServiceError, TrackerService};
use shared::admin_service::AdminService;
use shared::http::run_http_service;
use std::sync::Arc;

/// Serves tracking hits and the admin probes until a listener fails.
pub async fn run(config: config::Config) -> std::result::Result<(), ServiceError> {
    let env = Arc::new(TrackerEnv::from_config(&config));

    match env.sites.warm() {
        Ok(count) => tracing::info!(count, "loaded site settings"),
        Err(err) => tracing::warn!(error = %err, "could not preload site settings"),
    }

    let tracker_task = run_http_service(
        &config.listener.host,
        config.listener.port,
        TrackerService::new(env.clone()),
    );

    let connector = env.connector.clone();
    let admin_service = AdminService::new(move || {
        let connector = connector.clone();
        async move {
            match connector.connect().await {
                Ok(store) => store.ping().await.is_ok(),
                Err(_) => false,
            }
        }
    });
    let admin_task = run_http_service::<_, ServiceError>(
        &config.admin_listener.host,
        config.admin_listener.port,
        admin_service,
    );

    tokio::try_join!(tracker_task, admin_task)?;
    Ok(())
}
