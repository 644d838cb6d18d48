//! Durable trade ledger backed by SQLite. Every buy/sell fill is recorded
//! idempotently (by `(account, event_id)`) and folded into a running
//! `positions` row per `(account, nft_id)`.

use crate::model::{PositionStatus, TradeEvent, TradeKind};
use rust_decimal::Decimal;
use sqlx::sqlite::{SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use tokio::sync::Mutex;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProfitStats {
    pub buy_count: i64,
    pub sell_count: i64,
    pub total_buy: Decimal,
    pub total_sell: Decimal,
    pub total_fee: Decimal,
    /// `total_sell - total_buy - total_fee` over the window's events.
    pub net_profit: Decimal,
    /// `Σ(sell_price - buy_price)` over positions closed within the window.
    pub realized_profit: Decimal,
}

#[derive(Debug, Clone)]
pub struct RecentEvent {
    pub account: String,
    pub kind: TradeKind,
    pub nft_id: String,
    pub gift_name: String,
    pub price: Decimal,
    pub ts: i64,
}

pub struct TradeLedger {
    pool: SqlitePool,
    // Serializes writers the way the original's threading.Lock did; sqlx's
    // sqlite pool doesn't itself guarantee one writer at a time.
    write_lock: Mutex<()>,
}

impl TradeLedger {
    pub async fn open(path: &str) -> Result<Self, sqlx::Error> {
        let (url, max_connections) = if path == ":memory:" {
            ("sqlite::memory:".to_string(), 1)
        } else {
            (format!("sqlite://{}?mode=rwc", path), 4)
        };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(&url)
            .await?;
        let ledger = Self { pool, write_lock: Mutex::new(()) };
        ledger.migrate().await?;
        Ok(ledger)
    }

    async fn migrate(&self) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS events (
                account TEXT NOT NULL,
                event_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                nft_id TEXT NOT NULL,
                gift_name TEXT NOT NULL,
                model TEXT NOT NULL,
                background TEXT NOT NULL,
                price TEXT NOT NULL,
                fee TEXT NOT NULL,
                ts INTEGER NOT NULL,
                PRIMARY KEY (account, event_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS positions (
                account TEXT NOT NULL,
                nft_id TEXT NOT NULL,
                gift_name TEXT NOT NULL,
                model TEXT NOT NULL,
                background TEXT NOT NULL,
                buy_price TEXT NOT NULL,
                buy_ts INTEGER NOT NULL,
                sell_price TEXT NOT NULL,
                sell_ts INTEGER NOT NULL,
                status TEXT NOT NULL,
                PRIMARY KEY (account, nft_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Inserts the event if `(account, event_id)` hasn't been seen before,
    /// then upserts the matching position. Returns `true` if a new row was
    /// inserted (the caller uses this to avoid double-counting stats).
    pub async fn record_trade(&self, event: &TradeEvent) -> Result<bool, sqlx::Error> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            "INSERT OR IGNORE INTO events
             (account, event_id, kind, nft_id, gift_name, model, background, price, fee, ts)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&event.account)
        .bind(&event.event_id)
        .bind(event.kind.as_str())
        .bind(&event.nft_id)
        .bind(&event.gift_name)
        .bind(&event.model)
        .bind(&event.background)
        .bind(event.price.to_string())
        .bind(event.fee.to_string())
        .bind(event.ts)
        .execute(&mut *tx)
        .await?
        .rows_affected()
            > 0;

        if inserted {
            match event.kind {
                TradeKind::Buy => {
                    sqlx::query(
                        r#"
                        INSERT INTO positions
                            (account, nft_id, gift_name, model, background, buy_price, buy_ts, sell_price, sell_ts, status)
                        VALUES (?, ?, ?, ?, ?, ?, ?, '0', 0, 'open')
                        ON CONFLICT(account, nft_id) DO UPDATE SET
                            gift_name = excluded.gift_name,
                            model = excluded.model,
                            background = excluded.background,
                            buy_price = excluded.buy_price,
                            buy_ts = excluded.buy_ts,
                            sell_price = '0',
                            sell_ts = 0,
                            status = 'open'
                        "#,
                    )
                    .bind(&event.account)
                    .bind(&event.nft_id)
                    .bind(&event.gift_name)
                    .bind(&event.model)
                    .bind(&event.background)
                    .bind(event.price.to_string())
                    .bind(event.ts)
                    .execute(&mut *tx)
                    .await?;
                }
                TradeKind::Sell => {
                    sqlx::query(
                        r#"
                        INSERT INTO positions
                            (account, nft_id, gift_name, model, background, buy_price, buy_ts, sell_price, sell_ts, status)
                        VALUES (?, ?, ?, ?, ?, '0', 0, ?, ?, 'closed')
                        ON CONFLICT(account, nft_id) DO UPDATE SET
                            sell_price = excluded.sell_price,
                            sell_ts = excluded.sell_ts,
                            status = 'closed'
                        "#,
                    )
                    .bind(&event.account)
                    .bind(&event.nft_id)
                    .bind(&event.gift_name)
                    .bind(&event.model)
                    .bind(&event.background)
                    .bind(event.price.to_string())
                    .bind(event.ts)
                    .execute(&mut *tx)
                    .await?;
                }
            }
        }

        tx.commit().await?;
        Ok(inserted)
    }

    pub async fn get_profit_stats(&self, account: &str, since_ts: Option<i64>) -> Result<ProfitStats, sqlx::Error> {
        let since = since_ts.unwrap_or(0);
        let rows = sqlx::query("SELECT kind, price, fee FROM events WHERE account = ? AND ts >= ?")
            .bind(account)
            .bind(since)
            .fetch_all(&self.pool)
            .await?;

        let mut stats = ProfitStats::default();
        for row in &rows {
            let kind: String = row.get("kind");
            let price: Decimal = parse_row_decimal(row, "price")?;
            let fee: Decimal = parse_row_decimal(row, "fee")?;
            stats.total_fee += fee;
            if kind == "buy" {
                stats.buy_count += 1;
                stats.total_buy += price;
            } else {
                stats.sell_count += 1;
                stats.total_sell += price;
            }
        }
        stats.net_profit = stats.total_sell - stats.total_buy - stats.total_fee;

        let closed_rows = sqlx::query(
            "SELECT buy_price, sell_price FROM positions WHERE account = ? AND status = 'closed' AND sell_ts >= ?",
        )
        .bind(account)
        .bind(since)
        .fetch_all(&self.pool)
        .await?;
        for row in &closed_rows {
            let buy_price: Decimal = parse_row_decimal(row, "buy_price")?;
            let sell_price: Decimal = parse_row_decimal(row, "sell_price")?;
            stats.realized_profit += sell_price - buy_price;
        }

        Ok(stats)
    }

    pub async fn get_recent_events(&self, account: &str, limit: i64) -> Result<Vec<RecentEvent>, sqlx::Error> {
        let rows = sqlx::query(
            "SELECT account, kind, nft_id, gift_name, price, ts FROM events
             WHERE account = ? ORDER BY ts DESC LIMIT ?",
        )
        .bind(account)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let kind_str: String = row.get("kind");
                Ok(RecentEvent {
                    account: row.get("account"),
                    kind: if kind_str == "buy" { TradeKind::Buy } else { TradeKind::Sell },
                    nft_id: row.get("nft_id"),
                    gift_name: row.get("gift_name"),
                    price: parse_row_decimal(row, "price")?,
                    ts: row.get("ts"),
                })
            })
            .collect()
    }

    pub async fn get_open_positions(&self, account: &str) -> Result<Vec<crate::model::Position>, sqlx::Error> {
        let rows = sqlx::query(
            "SELECT * FROM positions WHERE account = ? AND status = 'open' ORDER BY buy_ts DESC",
        )
        .bind(account)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(crate::model::Position {
                    account: row.get("account"),
                    nft_id: row.get("nft_id"),
                    gift_name: row.get("gift_name"),
                    model: row.get("model"),
                    background: row.get("background"),
                    buy_price: parse_row_decimal(row, "buy_price")?,
                    buy_ts: row.get("buy_ts"),
                    sell_price: parse_row_decimal(row, "sell_price")?,
                    sell_ts: row.get("sell_ts"),
                    status: PositionStatus::Open,
                })
            })
            .collect()
    }

    pub async fn get_buy_price(&self, account: &str, nft_id: &str) -> Result<Option<Decimal>, sqlx::Error> {
        let row = sqlx::query("SELECT buy_price FROM positions WHERE account = ? AND nft_id = ?")
            .bind(account)
            .bind(nft_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| parse_row_decimal(&r, "buy_price")).transpose()
    }
}

fn parse_row_decimal(row: &SqliteRow, col: &str) -> Result<Decimal, sqlx::Error> {
    let text: String = row.get(col);
    text.parse::<Decimal>()
        .map_err(|e| sqlx::Error::Decode(Box::new(e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn buy(account: &str, nft_id: &str, event_id: &str, price: Decimal, ts: i64) -> TradeEvent {
        TradeEvent {
            account: account.into(),
            event_id: event_id.into(),
            kind: TradeKind::Buy,
            nft_id: nft_id.into(),
            gift_name: "Gift".into(),
            model: "m".into(),
            background: "b".into(),
            price,
            fee: Decimal::ZERO,
            ts,
        }
    }

    #[tokio::test]
    async fn record_trade_is_idempotent() {
        let ledger = TradeLedger::open(":memory:").await.unwrap();
        let event = buy("acc1", "n1", "e1", dec!(1.00), 100);
        assert!(ledger.record_trade(&event).await.unwrap());
        assert!(!ledger.record_trade(&event).await.unwrap());

        let stats = ledger.get_profit_stats("acc1", None).await.unwrap();
        assert_eq!(stats.buy_count, 1);
        assert_eq!(stats.total_buy, dec!(1.00));
    }

    #[tokio::test]
    async fn buy_then_sell_closes_position() {
        let ledger = TradeLedger::open(":memory:").await.unwrap();
        ledger.record_trade(&buy("acc1", "n1", "e1", dec!(1.00), 100)).await.unwrap();

        let sell = TradeEvent {
            account: "acc1".into(),
            event_id: "e2".into(),
            kind: TradeKind::Sell,
            nft_id: "n1".into(),
            gift_name: "Gift".into(),
            model: "m".into(),
            background: "b".into(),
            price: dec!(1.50),
            fee: dec!(0.05),
            ts: 200,
        };
        ledger.record_trade(&sell).await.unwrap();

        let open = ledger.get_open_positions("acc1").await.unwrap();
        assert!(open.is_empty());

        let stats = ledger.get_profit_stats("acc1", None).await.unwrap();
        assert_eq!(stats.net_profit, dec!(0.45));
        assert_eq!(stats.realized_profit, dec!(0.50));
    }

    #[tokio::test]
    async fn get_buy_price_reflects_last_buy() {
        let ledger = TradeLedger::open(":memory:").await.unwrap();
        ledger.record_trade(&buy("acc1", "n1", "e1", dec!(2.00), 100)).await.unwrap();
        assert_eq!(ledger.get_buy_price("acc1", "n1").await.unwrap(), Some(dec!(2.00)));
        assert_eq!(ledger.get_buy_price("acc1", "missing").await.unwrap(), None);
    }
}
