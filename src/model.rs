//! Domain types shared across the config loader, strategy, ledger, and
//! worker layers.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;

pub const PRICE_STEP: Decimal = Decimal::from_parts(1, 0, 0, false, 2);

/// A conjunction of optional filters over a listing/inventory item.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleSelector {
    pub collection_ids: BTreeSet<String>,
    pub gift_names: BTreeSet<String>,
    pub name_contains: BTreeSet<String>,
    pub models: BTreeSet<String>,
    pub backgrounds: BTreeSet<String>,
    pub only_recent_seconds: Option<i64>,
}

impl RuleSelector {
    /// Stable string key over the normalized parts; used as a map key for
    /// order-rule de-duplication.
    pub fn fingerprint(&self) -> String {
        let join = |set: &BTreeSet<String>| set.iter().cloned().collect::<Vec<_>>().join(",");
        format!(
            "{}|{}|{}|{}|{}|{}",
            join(&self.collection_ids),
            join(&self.gift_names),
            join(&self.name_contains),
            join(&self.models),
            join(&self.backgrounds),
            self.only_recent_seconds.unwrap_or(0)
        )
    }

    pub fn matches_name(&self, name: &str) -> bool {
        let n = name.trim().to_lowercase();
        if !self.gift_names.is_empty() && !self.gift_names.contains(&n) {
            return false;
        }
        if !self.name_contains.is_empty() && !self.name_contains.iter().any(|part| n.contains(part))
        {
            return false;
        }
        true
    }

    pub fn matches_collection(&self, collection_id: &str) -> bool {
        if self.collection_ids.is_empty() {
            return true;
        }
        self.collection_ids.contains(&collection_id.trim().to_lowercase())
    }

    pub fn matches_traits(&self, model: &str, background: &str) -> bool {
        if !self.models.is_empty() && !self.models.contains(&model.trim().to_lowercase()) {
            return false;
        }
        if !self.backgrounds.is_empty()
            && !self.backgrounds.contains(&background.trim().to_lowercase())
        {
            return false;
        }
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleMode {
    Offer,
    Order,
}

#[derive(Debug, Clone)]
pub struct OfferOrderRule {
    pub name: String,
    pub enabled: bool,
    pub mode: RuleMode,
    pub selector: RuleSelector,
    pub offer_factor: Decimal,
    pub min_offer: Decimal,
    pub max_offer: Option<Decimal>,
    pub min_ask: Option<Decimal>,
    pub max_ask: Option<Decimal>,
    pub min_floor: Option<Decimal>,
    pub max_floor: Option<Decimal>,
    pub max_listing_to_floor: Decimal,
    pub min_discount_pct: Option<Decimal>,
    pub max_discount_pct: Option<Decimal>,
    pub outbid_step: Decimal,
    pub bump_if_outbid: bool,
    pub skip_crafted: bool,
    pub expiration_days: i64,
    pub expiration_seconds: Option<i64>,
    pub max_actions_per_cycle: i64,
}

#[derive(Debug, Clone)]
pub struct SellRule {
    pub name: String,
    pub enabled: bool,
    pub selector: RuleSelector,
    pub markup_pct: Decimal,
    pub floor_undercut_step: Decimal,
    pub min_sell_price: Option<Decimal>,
    pub max_sell_price: Option<Decimal>,
    pub auto_reprice_below_floor: bool,
    pub reprice_step: Decimal,
    pub expiration_days: i64,
    pub expiration_seconds: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct LiquiditySettings {
    pub enabled: bool,
    pub min_recent_sales: i64,
    pub min_sell_through: Decimal,
    pub max_floor_to_last_sale: Option<Decimal>,
}

impl Default for LiquiditySettings {
    fn default() -> Self {
        Self {
            enabled: true,
            min_recent_sales: 2,
            min_sell_through: Decimal::new(2, 2),
            max_floor_to_last_sale: Some(Decimal::new(18, 1)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    pub dry_run: bool,
    pub idle_poll_interval: f64,
    pub hot_poll_interval: f64,
    pub hot_cycles: u32,
    pub request_timeout: f64,
    pub search_limit: u32,
    pub warm_start: bool,
    pub seen_cache_size: usize,
    pub seen_break_streak: u32,
    pub max_new_per_cycle: usize,
    pub max_offers_per_cycle: usize,
    pub activity_poll_every_sec: f64,
    pub inventory_poll_every_sec: f64,
    pub orders_poll_every_sec: f64,
    pub listings_poll_every_sec: f64,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            dry_run: true,
            idle_poll_interval: 0.9,
            hot_poll_interval: 0.25,
            hot_cycles: 6,
            request_timeout: 6.0,
            search_limit: 60,
            warm_start: true,
            seen_cache_size: 10_000,
            seen_break_streak: 2,
            max_new_per_cycle: 40,
            max_offers_per_cycle: 8,
            activity_poll_every_sec: 20.0,
            inventory_poll_every_sec: 15.0,
            orders_poll_every_sec: 12.0,
            listings_poll_every_sec: 12.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ApiRoutes {
    pub search_listings: String,
    pub create_offer: String,
    pub my_offers: String,
    pub cancel_offer: String,
    pub create_order: String,
    pub my_orders: String,
    pub cancel_order: String,
    pub inventory: String,
    pub create_listing: String,
    pub my_listings: String,
    pub update_listing: String,
    pub cancel_listing: String,
    pub recent_sales: String,
    pub activity: String,
}

impl Default for ApiRoutes {
    fn default() -> Self {
        Self {
            search_listings: "/nfts/search".into(),
            create_offer: "/offers/".into(),
            my_offers: "/offers/my".into(),
            cancel_offer: "/offers/{offer_id}".into(),
            create_order: "/orders/".into(),
            my_orders: "/orders/my".into(),
            cancel_order: "/orders/{order_id}".into(),
            inventory: "/users/me/nfts".into(),
            create_listing: "/listings/".into(),
            my_listings: "/listings/my".into(),
            update_listing: "/listings/{listing_id}".into(),
            cancel_listing: "/listings/{listing_id}".into(),
            recent_sales: "/sales/recent".into(),
            activity: "/activity/me".into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AccountConfig {
    pub name: String,
    pub auth: String,
}

#[derive(Debug, Clone, Default)]
pub struct TelegramSettings {
    pub enabled: bool,
    pub token: String,
    pub chat_ids: BTreeSet<i64>,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub api_base: String,
    pub routes: ApiRoutes,
    pub accounts: Vec<AccountConfig>,
    pub runtime: RuntimeSettings,
    pub liquidity: LiquiditySettings,
    pub offer_rules: Vec<OfferOrderRule>,
    pub order_rules: Vec<OfferOrderRule>,
    pub sell_rules: Vec<SellRule>,
    pub state_db_path: String,
    pub telegram: TelegramSettings,
}

#[derive(Debug, Clone)]
pub struct MarketListing {
    pub nft_id: String,
    pub name: String,
    pub collection_id: String,
    pub tg_id: String,
    pub ask_price: Option<Decimal>,
    pub floor_price: Option<Decimal>,
    pub listed_at_ts: Option<i64>,
    pub model: String,
    pub background: String,
    pub is_crafted: bool,
    pub raw: Value,
}

#[derive(Debug, Clone)]
pub struct InventoryGift {
    pub nft_id: String,
    pub name: String,
    pub collection_id: String,
    pub model: String,
    pub background: String,
    pub listed: bool,
    pub raw: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    Offer,
    Order,
    Listing,
}

#[derive(Debug, Clone)]
pub struct ManagedAction {
    pub key: String,
    pub kind: ActionKind,
    pub rule_name: String,
    pub remote_id: Option<String>,
    pub nft_id: Option<String>,
    pub selector_key: String,
    pub price: Decimal,
    pub cap_price: Option<Decimal>,
    pub created_ts: i64,
    pub expires_ts: Option<i64>,
    pub extra: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeKind {
    Buy,
    Sell,
}

impl TradeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeKind::Buy => "buy",
            TradeKind::Sell => "sell",
        }
    }
}

#[derive(Debug, Clone)]
pub struct TradeEvent {
    pub account: String,
    pub event_id: String,
    pub kind: TradeKind,
    pub nft_id: String,
    pub gift_name: String,
    pub model: String,
    pub background: String,
    pub price: Decimal,
    pub fee: Decimal,
    pub ts: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionStatus {
    Open,
    Closed,
}

#[derive(Debug, Clone)]
pub struct Position {
    pub account: String,
    pub nft_id: String,
    pub gift_name: String,
    pub model: String,
    pub background: String,
    pub buy_price: Decimal,
    pub buy_ts: i64,
    pub sell_price: Decimal,
    pub sell_ts: i64,
    pub status: PositionStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_stable_for_equal_selectors() {
        let mut a = RuleSelector::default();
        a.collection_ids.insert("c1".into());
        let mut b = RuleSelector::default();
        b.collection_ids.insert("c1".into());
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn fingerprint_differs_on_different_selector() {
        let mut a = RuleSelector::default();
        a.collection_ids.insert("c1".into());
        let mut b = RuleSelector::default();
        b.collection_ids.insert("c2".into());
        assert_ne!(a.fingerprint(), b.fingerprint());
    }
}
