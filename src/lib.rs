//! # nozomi-dl
//!
//! Client for a static search index that is only reachable through HTTP
//! byte-range requests, plus a bounded-concurrency downloader that packs an
//! item's files into a reproducible ZIP archive.
//!
//! ## How lookups work
//!
//! - Each index is a B-tree published as plain files; nodes are read one range
//!   request at a time and walked client-side ([`btree`])
//! - Queries combine term lookups with AND, OR and NOT ([`query`], [`search`])
//! - Resource URLs are derived from a routing table that rotates and must be
//!   re-parsed from a script when downloads start failing ([`obfuscation`])
//!
//! ## Quick Start
//!
//! ```no_run
//! use nozomi_dl::{Config, NozomiClient, cancel_on_signal};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = NozomiClient::new(Config::default())?;
//!
//!     let cancel = CancellationToken::new();
//!     tokio::spawn(cancel_on_signal(cancel.clone()));
//!
//!     let mut events = client.subscribe();
//!     tokio::spawn(async move {
//!         while let Ok(event) = events.recv().await {
//!             println!("Event: {:?}", event);
//!         }
//!     });
//!
//!     for id in client.search("female:glasses -male:beard").await? {
//!         client.download_to(id, std::path::Path::new("out"), &cancel).await?;
//!     }
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Deterministic ZIP output
pub mod archive;
/// Remote B-tree reader
pub mod btree;
/// Session facade
pub mod client;
/// Configuration types
pub mod config;
/// Error types
pub mod error;
/// Ranged HTTP fetching
pub mod fetch;
/// Item records
pub mod gallery;
/// Sorted ID lists and data-blob records
pub mod nozomi;
/// Resource URL derivation
pub mod obfuscation;
/// Bounded-concurrency retrieval
pub mod pipeline;
/// Query parsing
pub mod query;
/// Retry logic with increasing backoff
pub mod retry;
/// Query evaluation
pub mod search;
/// Core types and events
pub mod types;
/// Index version tokens
pub mod versions;

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod test_helpers;

// Re-export commonly used types
pub use client::NozomiClient;
pub use config::Config;
pub use error::{Error, Result};
pub use gallery::Gallery;
pub use nozomi::NozomiState;
pub use pipeline::Retrieved;
pub use search::SearchOptions;
pub use types::{Event, FileManifestEntry, ItemId, ResultOrder, ResultSet};

/// Cancel `token` when the process receives a termination signal
///
/// - **Unix:** listens for SIGTERM and SIGINT, with fallbacks if signal registration fails.
/// - **Windows/other:** listens for Ctrl+C via `tokio::signal::ctrl_c()`.
///
/// Spawn it next to a retrieval so Ctrl+C aborts in-flight downloads instead of
/// killing the process mid-write.
///
/// # Example
///
/// ```no_run
/// use nozomi_dl::cancel_on_signal;
/// use tokio_util::sync::CancellationToken;
///
/// # async fn example() {
/// let cancel = CancellationToken::new();
/// tokio::spawn(cancel_on_signal(cancel.clone()));
/// # }
/// ```
pub async fn cancel_on_signal(token: tokio_util::sync::CancellationToken) {
    tokio::select! {
        _ = wait_for_signal() => {
            tracing::info!("Cancelling in-flight work");
            token.cancel();
        }
        _ = token.cancelled() => {}
    }
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    // Registration fails in some sandboxes; fall back to ctrl_c there
    match (
        signal(SignalKind::terminate()),
        signal(SignalKind::interrupt()),
    ) {
        (Ok(mut term), Ok(mut int)) => {
            let name = tokio::select! {
                _ = term.recv() => "SIGTERM",
                _ = int.recv() => "SIGINT",
            };
            tracing::info!(signal = name, "Received termination signal");
        }
        (term, int) => {
            let error = term.err().or(int.err()).map(|e| e.to_string());
            tracing::warn!(error = ?error, "Signal registration failed, waiting for ctrl_c");
            tokio::signal::ctrl_c().await.ok();
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for Ctrl+C");
        std::future::pending::<()>().await;
    }
    tracing::info!("Received Ctrl+C");
}
