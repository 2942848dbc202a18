//! Market Feed Port (Driven Port)
//!
//! One batched quote request against the upstream REST API. Retry, rate
//! limiting, and auth live behind this port; the scanner only sees a batch
//! that either resolved or did not.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::domain::market::{QuoteSample, Symbol};

/// Batched quote fetch failure.
#[derive(Debug, thiserror::Error)]
pub enum FeedError {
    /// The request failed after the transport exhausted its recovery options.
    #[error("feed unavailable: {0}")]
    Unavailable(String),

    /// Authentication failed even after a forced token refresh. Retrying
    /// with the same credentials cannot recover.
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    /// Shutdown was requested while the request was in flight.
    #[error("request cancelled")]
    Cancelled,
}

/// Port for batched REST market data.
#[async_trait]
pub trait MarketFeed: Send + Sync {
    /// Fetch current quotes for up to one batch of symbols.
    ///
    /// Symbols the upstream did not return data for are simply absent from
    /// the result.
    async fn fetch_batch(
        &self,
        symbols: &[Symbol],
    ) -> Result<HashMap<Symbol, QuoteSample>, FeedError>;
}
