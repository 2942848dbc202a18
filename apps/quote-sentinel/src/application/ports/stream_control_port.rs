//! Stream Control Port (Driven Port)
//!
//! How the rebalance loop drives the live WebSocket feed: read the set of
//! symbols currently subscribed, and apply a subscribe/unsubscribe plan.

use std::collections::BTreeSet;

use async_trait::async_trait;

use crate::domain::hotset::RebalancePlan;
use crate::domain::market::Symbol;

/// Stream control failure.
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    /// The plan was refused without being applied, e.g. because it would
    /// exceed the subscription capacity. The connection stays up.
    #[error("plan rejected: {reason}")]
    Rejected {
        /// Why the plan was refused.
        reason: String,
    },

    /// The stream task has shut down.
    #[error("stream control channel closed")]
    Closed,
}

/// Port for driving the live subscription set.
#[async_trait]
pub trait StreamControl: Send + Sync {
    /// Symbols currently subscribed on the live feed.
    fn current(&self) -> BTreeSet<Symbol>;

    /// Apply a rebalance plan. Rejected plans leave the current set intact.
    async fn apply(&self, plan: RebalancePlan) -> Result<(), ControlError>;
}
