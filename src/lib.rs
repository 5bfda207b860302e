//! # nga-mirror
//!
//! Self-hosted mirror service for NGA forum threads.
//!
//! The service keeps a local, browsable copy of selected discussion threads
//! by repeatedly driving an external single-shot downloader (ngapost2md)
//! and serving the rendered markdown plus attachments over HTTP. Around
//! that core it tracks per-thread refresh schedules with retry budgets,
//! follows subscribed authors to enrol their new threads, forwards
//! cloud-storage share links to transfer providers, and repairs broken
//! cached images.
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use nga_mirror::{Config, Mirror, ProgramDownloader, run_with_shutdown};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut config = Config::default();
//!     config.downloader.topic_root = Some("ngapost2md".into());
//!
//!     let program = ProgramDownloader::new(&config.downloader.program)?;
//!     let net = program.bootstrap().await?;
//!
//!     let mirror = Mirror::new(config, net, Arc::new(program)).await?;
//!     mirror.start();
//!
//!     tokio::spawn(nga_mirror::api::start_api_server(mirror.clone()));
//!     run_with_shutdown(mirror).await;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// REST API module
pub mod api;
/// Shared key-value collections
pub mod collection;
/// Configuration types
pub mod config;
/// Downloader child-process adapter
pub mod downloader;
/// Error types
pub mod error;
/// The mirror core (store, worker, lifecycle, subscriptions)
pub mod mirror;
/// Asset-repair pipeline
pub mod repair;
/// Sandboxed filesystem roots
pub mod sandbox;
/// Cron scheduler
pub mod schedule;
/// Smiley cache
pub mod smile;
/// The Topic aggregate
pub mod topic;
/// Transfer pipeline and providers
pub mod transfer;
/// Core types
pub mod types;
/// User-info cache
pub mod users;
/// Utility functions
pub mod utils;

// Re-export commonly used types
pub use config::{Config, SmileMode};
pub use downloader::{DownOutcome, Downloader, NetConfig, ProgramDownloader};
pub use error::{Error, Result, ToHttpStatus};
pub use mirror::Mirror;
pub use sandbox::RootDir;
pub use schedule::CronScheduler;
pub use topic::{Topic, TopicView};
pub use types::{Metadata, TopicId, TransferRecord, TransferStatus, UserRecord};

/// Run until a termination signal (or an in-process stop) arrives, then shut
/// the mirror down.
///
/// - **Unix:** listens for SIGTERM and SIGINT, with fallbacks if signal
///   registration fails.
/// - **Windows/other:** listens for Ctrl+C via `tokio::signal::ctrl_c()`.
pub async fn run_with_shutdown(mirror: Mirror) {
    let stop = mirror.stop_token();
    tokio::select! {
        _ = wait_for_signal() => {}
        _ = stop.cancelled() => {
            tracing::info!("received in-process stop signal");
        }
    }
    mirror.shutdown().await;
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    // Signal registration may fail in restricted environments (containers,
    // tests); fall back stepwise rather than give up.
    match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
        (Ok(mut sigterm), Ok(mut sigint)) => {
            tokio::select! {
                _ = sigterm.recv() => tracing::info!("received SIGTERM"),
                _ = sigint.recv() => tracing::info!("received SIGINT"),
            }
        }
        (Ok(mut sigterm), Err(e)) => {
            tracing::warn!(error = %e, "no SIGINT handler, waiting for SIGTERM only");
            sigterm.recv().await;
        }
        (Err(e), Ok(mut sigint)) => {
            tracing::warn!(error = %e, "no SIGTERM handler, waiting for SIGINT only");
            sigint.recv().await;
        }
        (Err(_), Err(_)) => {
            tracing::error!("could not register signal handlers, using ctrl_c fallback");
            tokio::signal::ctrl_c().await.ok();
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for Ctrl+C");
    }
}
