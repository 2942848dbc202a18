//! Turso State Store
//!
//! Durable implementation of [`StateStore`] on a local Turso database.
//! Holds the symbol universe, the persisted subscription set, cooldown
//! expiries, and last observed prices, so a restart resumes where the
//! previous process left off.

use std::collections::BTreeSet;
use std::path::Path;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use turso::{Builder, Connection, Database, Value};

use crate::application::ports::{StateStore, StoreError};
use crate::domain::market::{CooldownReason, Symbol, SymbolInfo};

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS subscriptions (
        code TEXT PRIMARY KEY
    )",
    "CREATE TABLE IF NOT EXISTS cooldowns (
        code TEXT NOT NULL,
        reason TEXT NOT NULL,
        until TEXT NOT NULL,
        PRIMARY KEY (code, reason)
    )",
    "CREATE TABLE IF NOT EXISTS last_price (
        code TEXT PRIMARY KEY,
        price TEXT NOT NULL,
        observed_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS universe (
        code TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        ma25 TEXT
    )",
];

/// State store backed by a local Turso database file.
pub struct TursoStateStore {
    conn: Connection,
}

impl TursoStateStore {
    /// Open (or create) the database at `path` and apply the schema.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_string_lossy().to_string();
        let db: Database = Builder::new_local(&path)
            .build()
            .await
            .map_err(to_store_error)?;
        let conn = db.connect().map_err(to_store_error)?;
        for statement in SCHEMA {
            conn.execute(statement, ()).await.map_err(to_store_error)?;
        }
        Ok(Self { conn })
    }

    /// Replace the symbol universe wholesale.
    ///
    /// Used by startup seeding; the scan loop only reads.
    pub async fn replace_universe(&self, universe: &[SymbolInfo]) -> Result<(), StoreError> {
        self.conn
            .execute("DELETE FROM universe", ())
            .await
            .map_err(to_store_error)?;
        for info in universe {
            let ma25 = info.ma25.map(|d| d.to_string());
            self.conn
                .execute(
                    "INSERT OR REPLACE INTO universe (code, name, ma25) VALUES (?1, ?2, ?3)",
                    (info.code.clone(), info.name.clone(), ma25),
                )
                .await
                .map_err(to_store_error)?;
        }
        Ok(())
    }
}

#[async_trait]
impl StateStore for TursoStateStore {
    async fn load_subscriptions(&self) -> Result<BTreeSet<Symbol>, StoreError> {
        let mut rows = self
            .conn
            .query("SELECT code FROM subscriptions", ())
            .await
            .map_err(to_store_error)?;
        let mut set = BTreeSet::new();
        while let Some(row) = rows.next().await.map_err(to_store_error)? {
            set.insert(text_column(&row, 0, "subscriptions.code")?);
        }
        Ok(set)
    }

    async fn save_subscriptions(&self, symbols: &BTreeSet<Symbol>) -> Result<(), StoreError> {
        self.conn
            .execute("DELETE FROM subscriptions", ())
            .await
            .map_err(to_store_error)?;
        for symbol in symbols {
            self.conn
                .execute(
                    "INSERT OR REPLACE INTO subscriptions (code) VALUES (?1)",
                    (symbol.clone(),),
                )
                .await
                .map_err(to_store_error)?;
        }
        Ok(())
    }

    async fn set_cooldown(
        &self,
        symbol: &str,
        reason: &CooldownReason,
        until: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.conn
            .execute(
                "INSERT OR REPLACE INTO cooldowns (code, reason, until) VALUES (?1, ?2, ?3)",
                (symbol.to_string(), reason.key(), until.to_rfc3339()),
            )
            .await
            .map_err(to_store_error)?;
        Ok(())
    }

    async fn active_cooldowns(
        &self,
        reason: &CooldownReason,
        now: DateTime<Utc>,
    ) -> Result<Vec<(Symbol, DateTime<Utc>)>, StoreError> {
        let mut rows = self
            .conn
            .query(
                "SELECT code, until FROM cooldowns WHERE reason = ?1",
                (reason.key(),),
            )
            .await
            .map_err(to_store_error)?;
        let mut active = Vec::new();
        while let Some(row) = rows.next().await.map_err(to_store_error)? {
            let code = text_column(&row, 0, "cooldowns.code")?;
            let until = timestamp_column(&row, 1, "cooldowns.until")?;
            if until > now {
                active.push((code, until));
            }
        }
        Ok(active)
    }

    async fn set_last_price(
        &self,
        symbol: &str,
        price: Decimal,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.conn
            .execute(
                "INSERT OR REPLACE INTO last_price (code, price, observed_at)
                 VALUES (?1, ?2, ?3)",
                (symbol.to_string(), price.to_string(), at.to_rfc3339()),
            )
            .await
            .map_err(to_store_error)?;
        Ok(())
    }

    async fn last_price(
        &self,
        symbol: &str,
    ) -> Result<Option<(Decimal, DateTime<Utc>)>, StoreError> {
        let mut rows = self
            .conn
            .query(
                "SELECT price, observed_at FROM last_price WHERE code = ?1",
                (symbol.to_string(),),
            )
            .await
            .map_err(to_store_error)?;
        let Some(row) = rows.next().await.map_err(to_store_error)? else {
            return Ok(None);
        };
        let raw_price = text_column(&row, 0, "last_price.price")?;
        let price = Decimal::from_str(&raw_price).map_err(|e| StoreError::Corrupt {
            key: format!("last_price.price[{symbol}]"),
            detail: e.to_string(),
        })?;
        let at = timestamp_column(&row, 1, "last_price.observed_at")?;
        Ok(Some((price, at)))
    }

    async fn load_universe(&self) -> Result<Vec<SymbolInfo>, StoreError> {
        let mut rows = self
            .conn
            .query("SELECT code, name, ma25 FROM universe ORDER BY code", ())
            .await
            .map_err(to_store_error)?;
        let mut universe = Vec::new();
        while let Some(row) = rows.next().await.map_err(to_store_error)? {
            let code = text_column(&row, 0, "universe.code")?;
            let name = text_column(&row, 1, "universe.name")?;
            let ma25 = match row.get_value(2).map_err(to_store_error)? {
                Value::Null => None,
                Value::Text(raw) => {
                    Some(Decimal::from_str(&raw).map_err(|e| StoreError::Corrupt {
                        key: format!("universe.ma25[{code}]"),
                        detail: e.to_string(),
                    })?)
                }
                other => {
                    return Err(StoreError::Corrupt {
                        key: format!("universe.ma25[{code}]"),
                        detail: format!("unexpected value {other:?}"),
                    });
                }
            };
            universe.push(SymbolInfo { code, name, ma25 });
        }
        Ok(universe)
    }
}

fn to_store_error(e: turso::Error) -> StoreError {
    StoreError::Database(e.to_string())
}

fn text_column(row: &turso::Row, index: usize, key: &str) -> Result<String, StoreError> {
    match row.get_value(index).map_err(to_store_error)? {
        Value::Text(text) => Ok(text),
        other => Err(StoreError::Corrupt {
            key: key.to_string(),
            detail: format!("expected text, got {other:?}"),
        }),
    }
}

fn timestamp_column(
    row: &turso::Row,
    index: usize,
    key: &str,
) -> Result<DateTime<Utc>, StoreError> {
    let raw = text_column(row, index, key)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt {
            key: key.to_string(),
            detail: e.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    async fn open_temp() -> (tempfile::TempDir, TursoStateStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = TursoStateStore::open(dir.path().join("state.db"))
            .await
            .unwrap();
        (dir, store)
    }

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[tokio::test]
    async fn subscriptions_round_trip() {
        let (_dir, store) = open_temp().await;
        assert!(store.load_subscriptions().await.unwrap().is_empty());

        let set = BTreeSet::from(["005930".to_string(), "000660".to_string()]);
        store.save_subscriptions(&set).await.unwrap();
        assert_eq!(store.load_subscriptions().await.unwrap(), set);

        // A second save replaces, never merges.
        let smaller = BTreeSet::from(["005930".to_string()]);
        store.save_subscriptions(&smaller).await.unwrap();
        assert_eq!(store.load_subscriptions().await.unwrap(), smaller);
    }

    #[tokio::test]
    async fn cooldowns_filter_by_reason_and_expiry() {
        let (_dir, store) = open_temp().await;
        let symbol = "005930".to_string();
        store
            .set_cooldown(&symbol, &CooldownReason::Resubscribe, t(180))
            .await
            .unwrap();
        store
            .set_cooldown(
                &"000660".to_string(),
                &CooldownReason::Resubscribe,
                t(-10),
            )
            .await
            .unwrap();

        let active = store
            .active_cooldowns(&CooldownReason::Resubscribe, t(0))
            .await
            .unwrap();
        assert_eq!(active, vec![(symbol.clone(), t(180))]);

        // Different reason key, same symbol.
        let alerts = store
            .active_cooldowns(
                &CooldownReason::Alert(crate::domain::market::AlertKind::DisparityBelow),
                t(0),
            )
            .await
            .unwrap();
        assert!(alerts.is_empty());
    }

    #[tokio::test]
    async fn cooldown_upsert_extends_expiry() {
        let (_dir, store) = open_temp().await;
        let symbol = "005930".to_string();
        store
            .set_cooldown(&symbol, &CooldownReason::Resubscribe, t(60))
            .await
            .unwrap();
        store
            .set_cooldown(&symbol, &CooldownReason::Resubscribe, t(300))
            .await
            .unwrap();

        let active = store
            .active_cooldowns(&CooldownReason::Resubscribe, t(100))
            .await
            .unwrap();
        assert_eq!(active, vec![(symbol, t(300))]);
    }

    #[tokio::test]
    async fn last_price_round_trip() {
        let (_dir, store) = open_temp().await;
        let symbol = "005930".to_string();
        assert!(store.last_price(&symbol).await.unwrap().is_none());

        store
            .set_last_price(&symbol, dec!(71300), t(5))
            .await
            .unwrap();
        assert_eq!(
            store.last_price(&symbol).await.unwrap(),
            Some((dec!(71300), t(5)))
        );
    }

    #[tokio::test]
    async fn universe_round_trip_with_optional_ma25() {
        let (_dir, store) = open_temp().await;
        store
            .replace_universe(&[
                SymbolInfo {
                    code: "005930".to_string(),
                    name: "삼성전자".to_string(),
                    ma25: Some(dec!(70100.5)),
                },
                SymbolInfo {
                    code: "000660".to_string(),
                    name: "SK하이닉스".to_string(),
                    ma25: None,
                },
            ])
            .await
            .unwrap();

        let universe = store.load_universe().await.unwrap();
        assert_eq!(universe.len(), 2);
        assert_eq!(universe[0].code, "000660");
        assert_eq!(universe[0].ma25, None);
        assert_eq!(universe[1].ma25, Some(dec!(70100.5)));
    }
}
