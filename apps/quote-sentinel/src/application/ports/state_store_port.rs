//! State Store Port (Driven Port)
//!
//! Durable state that must survive restarts: the active subscription set,
//! per-symbol cooldowns, last observed prices, and the scan universe.
//!
//! All writes are advisory from the pipeline's point of view: a failed
//! persistence call is reported to the caller, which logs it and carries on
//! with in-memory state rather than halting ingestion.

use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rust_decimal::Decimal;

use crate::domain::market::{CooldownReason, Symbol, SymbolInfo};

/// State store failure.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The underlying database rejected the operation.
    #[error("database error: {0}")]
    Database(String),

    /// A stored value could not be decoded.
    #[error("corrupt stored value for {key}: {detail}")]
    Corrupt {
        /// Logical key of the unreadable row.
        key: String,
        /// What failed to decode.
        detail: String,
    },
}

/// Port for durable pipeline state.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Load the subscription set persisted by the last run.
    async fn load_subscriptions(&self) -> Result<BTreeSet<Symbol>, StoreError>;

    /// Replace the persisted subscription set.
    async fn save_subscriptions(&self, symbols: &BTreeSet<Symbol>) -> Result<(), StoreError>;

    /// Record a cooldown expiry for one (symbol, reason) pair.
    async fn set_cooldown(
        &self,
        symbol: &str,
        reason: &CooldownReason,
        until: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// All cooldowns of the given reason that are still active at `now`.
    async fn active_cooldowns(
        &self,
        reason: &CooldownReason,
        now: DateTime<Utc>,
    ) -> Result<Vec<(Symbol, DateTime<Utc>)>, StoreError>;

    /// Record the most recent observed price for a symbol.
    async fn set_last_price(
        &self,
        symbol: &str,
        price: Decimal,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Most recent observed price for a symbol, if any.
    async fn last_price(&self, symbol: &str)
    -> Result<Option<(Decimal, DateTime<Utc>)>, StoreError>;

    /// The full scan universe with reference data.
    async fn load_universe(&self) -> Result<Vec<SymbolInfo>, StoreError>;
}

/// In-memory implementation for testing.
#[derive(Debug, Default)]
pub struct InMemoryStateStore {
    subscriptions: RwLock<BTreeSet<Symbol>>,
    cooldowns: RwLock<HashMap<(Symbol, String), DateTime<Utc>>>,
    last_prices: RwLock<HashMap<Symbol, (Decimal, DateTime<Utc>)>>,
    universe: RwLock<Vec<SymbolInfo>>,
}

impl InMemoryStateStore {
    /// Create an empty in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the scan universe.
    pub fn set_universe(&self, universe: Vec<SymbolInfo>) {
        *self.universe.write() = universe;
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn load_subscriptions(&self) -> Result<BTreeSet<Symbol>, StoreError> {
        Ok(self.subscriptions.read().clone())
    }

    async fn save_subscriptions(&self, symbols: &BTreeSet<Symbol>) -> Result<(), StoreError> {
        *self.subscriptions.write() = symbols.clone();
        Ok(())
    }

    async fn set_cooldown(
        &self,
        symbol: &str,
        reason: &CooldownReason,
        until: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.cooldowns
            .write()
            .insert((symbol.to_string(), reason.key()), until);
        Ok(())
    }

    async fn active_cooldowns(
        &self,
        reason: &CooldownReason,
        now: DateTime<Utc>,
    ) -> Result<Vec<(Symbol, DateTime<Utc>)>, StoreError> {
        let key = reason.key();
        Ok(self
            .cooldowns
            .read()
            .iter()
            .filter(|((_, r), until)| *r == key && **until > now)
            .map(|((symbol, _), until)| (symbol.clone(), *until))
            .collect())
    }

    async fn set_last_price(
        &self,
        symbol: &str,
        price: Decimal,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.last_prices
            .write()
            .insert(symbol.to_string(), (price, at));
        Ok(())
    }

    async fn last_price(
        &self,
        symbol: &str,
    ) -> Result<Option<(Decimal, DateTime<Utc>)>, StoreError> {
        Ok(self.last_prices.read().get(symbol).copied())
    }

    async fn load_universe(&self) -> Result<Vec<SymbolInfo>, StoreError> {
        Ok(self.universe.read().clone())
    }
}
