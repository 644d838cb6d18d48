//! Per-account trading engine. One `AccountWorker` owns one account's
//! in-memory state (seen cache, action table, liquidity cache, poll clocks)
//! exclusively — no locking is required because nothing else touches it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use indexmap::IndexSet;
use log::{info, warn};
use rust_decimal::Decimal;
use serde_json::{json, Value};
use tokio::sync::mpsc::Sender;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::ledger::TradeLedger;
use crate::market_api::{parse_inventory_item, parse_listing, parse_trade_event, MarketApi};
use crate::model::{
    AccountConfig, ActionKind, LiquiditySettings, ManagedAction, MarketListing, OfferOrderRule,
    RuntimeSettings, SellRule,
};
use crate::money::quantize2;
use crate::strategy::{
    compute_bump_price, compute_reprice_below_floor, compute_sell_price, evaluate_offer_price,
    evaluate_order_price, infer_competitor_price, infer_remote_id, pass_liquidity,
    selector_matches_inventory, selector_matches_listing, selector_to_order_payload,
};
use crate::time::now_ts;

const LIQUIDITY_CACHE_TTL: Duration = Duration::from_secs(45);
const NET_ERR_BACKOFF_FLOOR: f64 = 1.0;

pub struct WorkerRules {
    pub offer_rules: Vec<OfferOrderRule>,
    pub order_rules: Vec<OfferOrderRule>,
    pub sell_rules: Vec<SellRule>,
    pub liquidity: LiquiditySettings,
    pub runtime: RuntimeSettings,
}

#[derive(Clone, Copy)]
struct LiquiditySnapshot {
    recent_sales: i64,
    last_sale: Option<Decimal>,
}

pub struct AccountWorker {
    account: AccountConfig,
    api: Arc<dyn MarketApi>,
    ledger: Arc<TradeLedger>,
    rules: WorkerRules,
    notifier: Sender<String>,
    status: Arc<StdMutex<String>>,
    cancel: CancellationToken,

    seen: IndexSet<String>,
    actions: HashMap<String, ManagedAction>,
    liquidity_cache: HashMap<String, (LiquiditySnapshot, Instant)>,
    last_orders_poll: Option<Instant>,
    last_inventory_poll: Option<Instant>,
    last_listings_poll: Option<Instant>,
    last_activity_poll: Option<Instant>,
    burst_left: u32,
}

impl AccountWorker {
    pub fn new(
        account: AccountConfig,
        api: Arc<dyn MarketApi>,
        ledger: Arc<TradeLedger>,
        rules: WorkerRules,
        notifier: Sender<String>,
        status: Arc<StdMutex<String>>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            account,
            api,
            ledger,
            rules,
            notifier,
            status,
            cancel,
            seen: IndexSet::new(),
            actions: HashMap::new(),
            liquidity_cache: HashMap::new(),
            last_orders_poll: None,
            last_inventory_poll: None,
            last_listings_poll: None,
            last_activity_poll: None,
            burst_left: 0,
        }
    }

    fn set_status(&self, text: impl Into<String>) {
        let text = text.into();
        info!("[{}] {}", self.account.name, text);
        *self.status.lock().unwrap() = text;
    }

    fn notify(&self, text: impl Into<String>) {
        let text = format!("[{}] {}", self.account.name, text.into());
        if self.notifier.try_send(text).is_err() {
            warn!("[{}] notification queue full, dropping message", self.account.name);
        }
    }

    pub async fn run(mut self) {
        self.set_status("booting");

        self.set_status("auth");
        if let Err(e) = self.api.check_auth().await {
            self.set_status(format!("auth_fail:{e}"));
            return;
        }

        self.set_status("warm_start");
        if let Err(e) = self.warm_start().await {
            warn!("[{}] warm start failed: {e}", self.account.name);
        }

        loop {
            if self.cancel.is_cancelled() {
                self.set_status("stopped");
                return;
            }

            let cycle_start = Instant::now();
            match self.run_cycle().await {
                Ok(had_activity) => {
                    if had_activity {
                        self.burst_left = self.rules.runtime.hot_cycles;
                    }
                    self.set_status(format!(
                        "running seen={} actions={} burst={}",
                        self.seen.len(),
                        self.actions.len(),
                        self.burst_left
                    ));
                }
                Err(e) => {
                    self.set_status(format!("net_err:{e}"));
                    let backoff = self.rules.runtime.idle_poll_interval.max(NET_ERR_BACKOFF_FLOOR);
                    if self.wait_or_cancel(Duration::from_secs_f64(backoff)).await {
                        self.set_status("stopped");
                        return;
                    }
                    continue;
                }
            }

            let target = if self.burst_left > 0 {
                self.burst_left -= 1;
                self.rules.runtime.hot_poll_interval
            } else {
                self.rules.runtime.idle_poll_interval
            };
            let elapsed = cycle_start.elapsed().as_secs_f64();
            let remaining = (target - elapsed).max(0.0);
            if self.wait_or_cancel(Duration::from_secs_f64(remaining)).await {
                self.set_status("stopped");
                return;
            }
        }
    }

    /// Sleeps for `duration` unless cancellation arrives first. Returns
    /// `true` if cancellation fired.
    async fn wait_or_cancel(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = sleep(duration) => false,
            _ = self.cancel.cancelled() => true,
        }
    }

    async fn warm_start(&mut self) -> Result<(), crate::errors::PortalError> {
        let listings = self.fetch_listings().await?;
        if self.rules.runtime.warm_start {
            for listing in &listings {
                self.seen_insert(&listing.nft_id);
            }
        }
        Ok(())
    }

    async fn fetch_listings(&self) -> Result<Vec<MarketListing>, crate::errors::PortalError> {
        let mut params = HashMap::new();
        params.insert("limit".to_string(), self.rules.runtime.search_limit.to_string());
        params.insert("status".to_string(), "listed".to_string());
        params.insert("exclude_bundled".to_string(), "true".to_string());
        params.insert("sort".to_string(), "newest".to_string());
        let raw = self.api.search_listings(&params).await?;
        Ok(raw.iter().filter_map(parse_listing).collect())
    }

    fn seen_insert(&mut self, id: &str) -> bool {
        if self.seen.contains(id) {
            return false;
        }
        let cap = self.rules.runtime.seen_cache_size.max(1);
        if self.seen.len() >= cap {
            self.seen.shift_remove_index(0);
        }
        self.seen.insert(id.to_string());
        true
    }

    fn trait_key(collection_id: &str, model: &str, background: &str) -> String {
        format!(
            "{}|{}|{}",
            collection_id.trim().to_lowercase(),
            model.trim().to_lowercase(),
            background.trim().to_lowercase()
        )
    }

    /// Runs one full §4.6 cycle. Returns whether any new listings or offers
    /// occurred (drives the hot-poll burst counter).
    async fn run_cycle(&mut self) -> Result<bool, crate::errors::PortalError> {
        let listings = self.fetch_listings().await?;

        let mut floor_by_traits: HashMap<String, Decimal> = HashMap::new();
        let mut active_count: HashMap<String, i64> = HashMap::new();
        let mut floor_by_nft: HashMap<String, Decimal> = HashMap::new();
        for listing in &listings {
            let key = Self::trait_key(&listing.collection_id, &listing.model, &listing.background);
            if let Some(ask) = listing.ask_price {
                floor_by_traits
                    .entry(key.clone())
                    .and_modify(|min| {
                        if ask < *min {
                            *min = ask;
                        }
                    })
                    .or_insert(ask);
            }
            *active_count.entry(key).or_insert(0) += 1;
            if let Some(floor) = listing.floor_price {
                floor_by_nft.insert(listing.nft_id.clone(), floor);
            }
        }

        let mut new_listings = Vec::new();
        let mut consecutive_seen = 0u32;
        for listing in &listings {
            if listing.nft_id.is_empty() {
                continue;
            }
            if self.seen_insert(&listing.nft_id) {
                new_listings.push(listing.clone());
                consecutive_seen = 0;
                if new_listings.len() >= self.rules.runtime.max_new_per_cycle {
                    break;
                }
            } else {
                consecutive_seen += 1;
                if self.rules.runtime.seen_break_streak > 0 && consecutive_seen >= self.rules.runtime.seen_break_streak {
                    break;
                }
            }
        }

        let mut had_activity = !new_listings.is_empty();

        had_activity |= self
            .place_new_offers(&new_listings, &floor_by_traits, &active_count)
            .await?;
        self.place_or_refresh_orders(&listings).await?;

        if self.due(self.last_orders_poll, self.rules.runtime.orders_poll_every_sec) {
            self.sync_offer_outbids().await?;
            self.sync_order_outbids().await?;
            self.last_orders_poll = Some(Instant::now());
        }

        self.auto_cancel_expired().await?;

        if self.due(self.last_inventory_poll, self.rules.runtime.inventory_poll_every_sec) {
            self.process_inventory(&floor_by_traits).await?;
            self.last_inventory_poll = Some(Instant::now());
        }

        if self.due(self.last_listings_poll, self.rules.runtime.listings_poll_every_sec) {
            self.reprice_listings(&floor_by_traits).await?;
            self.last_listings_poll = Some(Instant::now());
        }

        if self.due(self.last_activity_poll, self.rules.runtime.activity_poll_every_sec) {
            self.ingest_activity().await?;
            self.last_activity_poll = Some(Instant::now());
        }

        let _ = floor_by_nft;
        Ok(had_activity)
    }

    fn due(&self, last: Option<Instant>, every_sec: f64) -> bool {
        match last {
            None => true,
            Some(t) => t.elapsed().as_secs_f64() >= every_sec,
        }
    }

    async fn get_liquidity_snapshot(&mut self, trait_key: &str, collection_id: &str, model: &str, background: &str) -> Result<LiquiditySnapshot, crate::errors::PortalError> {
        if let Some((snapshot, seen_at)) = self.liquidity_cache.get(trait_key) {
            if seen_at.elapsed() < LIQUIDITY_CACHE_TTL {
                return Ok(*snapshot);
            }
        }
        let sales = self.api.recent_sales(collection_id).await?;
        let matching: Vec<_> = sales
            .iter()
            .filter(|raw| {
                raw.get("model").and_then(Value::as_str).map(|m| m.eq_ignore_ascii_case(model)).unwrap_or(true)
                    && raw
                        .get("background")
                        .and_then(Value::as_str)
                        .map(|b| b.eq_ignore_ascii_case(background))
                        .unwrap_or(true)
            })
            .collect();
        let last_sale = matching
            .first()
            .and_then(|raw| crate::money::parse_decimal(raw.get("price")));
        let snapshot = LiquiditySnapshot {
            recent_sales: matching.len() as i64,
            last_sale,
        };
        self.liquidity_cache.insert(trait_key.to_string(), (snapshot, Instant::now()));
        Ok(snapshot)
    }

    async fn place_new_offers(
        &mut self,
        new_listings: &[MarketListing],
        floor_by_traits: &HashMap<String, Decimal>,
        active_count: &HashMap<String, i64>,
    ) -> Result<bool, crate::errors::PortalError> {
        let mut placed_any = false;
        let mut placed_this_cycle = 0usize;
        for listing in new_listings {
            if placed_this_cycle >= self.rules.runtime.max_offers_per_cycle {
                break;
            }
            let rules = self.rules.offer_rules.clone();
            for rule in rules.iter().filter(|r| r.enabled) {
                if !selector_matches_listing(&rule.selector, listing) {
                    continue;
                }
                let (price, reason) = evaluate_offer_price(listing, rule);
                let Some(price) = price else {
                    continue;
                };
                let trait_key = Self::trait_key(&listing.collection_id, &listing.model, &listing.background);
                let liquidity = self
                    .get_liquidity_snapshot(&trait_key, &listing.collection_id, &listing.model, &listing.background)
                    .await?;
                let floor_for_key = floor_by_traits.get(&trait_key).copied();
                if !pass_liquidity(
                    &self.rules.liquidity,
                    floor_for_key,
                    liquidity.recent_sales,
                    *active_count.get(&trait_key).unwrap_or(&0),
                    liquidity.last_sale,
                ) {
                    continue;
                }

                let key = format!("offer:{}:{}", listing.nft_id, rule.name);
                if self.actions.contains_key(&key) {
                    break;
                }

                let ask = listing.ask_price.unwrap_or(price);
                let mut cap_price = quantize2(ask - rule.outbid_step);
                if let Some(max_offer) = rule.max_offer {
                    cap_price = cap_price.min(max_offer);
                }

                match self.place_offer(&key, listing, rule, price, cap_price).await {
                    Ok(()) => {
                        placed_any = true;
                        placed_this_cycle += 1;
                    }
                    Err(e) => warn!("[{}] place_offer failed for {}: {e}", self.account.name, listing.nft_id),
                }
                let _ = reason;
                break;
            }
        }
        Ok(placed_any)
    }

    async fn place_offer(
        &mut self,
        key: &str,
        listing: &MarketListing,
        rule: &OfferOrderRule,
        price: Decimal,
        cap_price: Decimal,
    ) -> Result<(), crate::errors::PortalError> {
        let now = now_ts();
        let expires_ts = Some(now + rule.expiration_days * 86_400);

        let remote_id = if self.rules.runtime.dry_run {
            format!("dry-{key}")
        } else {
            let payload = json!({
                "nft_id": listing.nft_id,
                "price": crate::money::format_price(price),
                "expiration_days": rule.expiration_days,
            });
            let response = self.api.create_offer(&payload).await?;
            let id = infer_remote_id(&response, &["offer_id", "id"]);
            if id.is_empty() {
                format!("dry-{key}")
            } else {
                id
            }
        };

        self.actions.insert(
            key.to_string(),
            ManagedAction {
                key: key.to_string(),
                kind: ActionKind::Offer,
                rule_name: rule.name.clone(),
                remote_id: Some(remote_id),
                nft_id: Some(listing.nft_id.clone()),
                selector_key: String::new(),
                price,
                cap_price: Some(cap_price),
                created_ts: now,
                expires_ts,
                extra: Value::Null,
            },
        );
        self.notify(format!("offer {} on {} at {}", rule.name, listing.nft_id, price));
        Ok(())
    }

    async fn place_or_refresh_orders(&mut self, listings: &[MarketListing]) -> Result<(), crate::errors::PortalError> {
        let rules = self.rules.order_rules.clone();
        for rule in rules.iter().filter(|r| r.enabled) {
            let matching: Vec<&MarketListing> = listings
                .iter()
                .filter(|listing| selector_matches_listing(&rule.selector, listing))
                .collect();
            if matching.is_empty() {
                continue;
            }
            let floor = matching
                .iter()
                .filter_map(|listing| listing.floor_price.or(listing.ask_price))
                .min();
            let Some(floor) = floor else { continue };
            let (price, _reason) = evaluate_order_price(Some(floor), rule);
            let Some(price) = price else { continue };

            let key = format!("order:{}:{}", rule.name, rule.selector.fingerprint());
            let existing_price = self.actions.get(&key).map(|a| a.price);
            match existing_price {
                None => {
                    if let Err(e) = self.create_order(&key, rule, price).await {
                        warn!("[{}] create_order failed for {}: {e}", self.account.name, key);
                    }
                }
                Some(current) if current < price => {
                    if let Err(e) = self.replace_order(&key, rule, price).await {
                        warn!("[{}] replace_order failed for {}: {e}", self.account.name, key);
                    }
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    async fn create_order(&mut self, key: &str, rule: &OfferOrderRule, price: Decimal) -> Result<(), crate::errors::PortalError> {
        let now = now_ts();
        let payload_map = selector_to_order_payload(&rule.selector);
        let remote_id = if self.rules.runtime.dry_run {
            format!("dry-{key}")
        } else {
            let mut payload = json!(payload_map);
            payload["price"] = json!(crate::money::format_price(price));
            payload["expiration_days"] = json!(rule.expiration_days);
            let response = self.api.create_order(&payload).await?;
            let id = infer_remote_id(&response, &["order_id", "id"]);
            if id.is_empty() {
                format!("dry-{key}")
            } else {
                id
            }
        };

        self.actions.insert(
            key.to_string(),
            ManagedAction {
                key: key.to_string(),
                kind: ActionKind::Order,
                rule_name: rule.name.clone(),
                remote_id: Some(remote_id),
                nft_id: None,
                selector_key: rule.selector.fingerprint(),
                price,
                cap_price: None,
                created_ts: now,
                expires_ts: Some(now + rule.expiration_days * 86_400),
                extra: Value::Null,
            },
        );
        self.notify(format!("order {} at {}", rule.name, price));
        Ok(())
    }

    async fn replace_order(&mut self, key: &str, rule: &OfferOrderRule, price: Decimal) -> Result<(), crate::errors::PortalError> {
        self.cancel_action(key, true).await?;
        self.create_order(key, rule, price).await
    }

    /// `cancel_remote → local pop → create`, in that order; a failed remote
    /// cancel leaves the action in place.
    async fn cancel_action(&mut self, key: &str, remote_only: bool) -> Result<(), crate::errors::PortalError> {
        let Some(action) = self.actions.get(key).cloned() else {
            return Ok(());
        };
        if !self.rules.runtime.dry_run {
            if let Some(remote_id) = action.remote_id.as_deref().filter(|id| !id.starts_with("dry-")) {
                match action.kind {
                    ActionKind::Offer => self.api.cancel_offer(remote_id).await?,
                    ActionKind::Order => self.api.cancel_order(remote_id).await?,
                    ActionKind::Listing => self.api.cancel_listing(remote_id).await?,
                }
            }
        }
        self.actions.remove(key);
        if remote_only {
            // caller immediately recreates under the same key
        }
        Ok(())
    }

    async fn sync_offer_outbids(&mut self) -> Result<(), crate::errors::PortalError> {
        let rows = self.api.my_offers().await?;
        let by_nft: HashMap<String, &Value> = rows
            .iter()
            .filter_map(|row| row.get("nft_id").and_then(Value::as_str).map(|id| (id.to_string(), row)))
            .collect();

        let keys: Vec<String> = self
            .actions
            .iter()
            .filter(|(_, a)| a.kind == ActionKind::Offer)
            .map(|(k, _)| k.clone())
            .collect();

        for key in keys {
            let Some(action) = self.actions.get(&key) else { continue };
            let Some(nft_id) = action.nft_id.clone() else { continue };
            let Some(row) = by_nft.get(&nft_id) else { continue };
            let rule = self.rules.offer_rules.iter().find(|r| r.name == action.rule_name);
            let Some(rule) = rule else { continue };
            if !rule.bump_if_outbid {
                continue;
            }
            let competitor = infer_competitor_price(row, &["offer_price", "price"]);
            let target = compute_bump_price(action.price, competitor, rule.outbid_step, action.cap_price);
            let Some(target) = target else { continue };

            if self.rules.runtime.dry_run {
                if let Some(action) = self.actions.get_mut(&key) {
                    action.price = target;
                }
                continue;
            }
            let cap_price = action.cap_price;
            let rule = rule.clone();
            let listing = MarketListing {
                nft_id: nft_id.clone(),
                name: String::new(),
                collection_id: String::new(),
                tg_id: String::new(),
                ask_price: None,
                floor_price: None,
                listed_at_ts: None,
                model: String::new(),
                background: String::new(),
                is_crafted: false,
                raw: Value::Null,
            };
            if self.cancel_action(&key, true).await.is_ok() {
                if let Err(e) = self.place_offer(&key, &listing, &rule, target, cap_price.unwrap_or(target)).await {
                    warn!("[{}] bump re-place failed: {e}", self.account.name);
                }
            }
        }
        Ok(())
    }

    async fn sync_order_outbids(&mut self) -> Result<(), crate::errors::PortalError> {
        let rows = self.api.my_orders().await?;
        let by_remote: HashMap<String, &Value> = rows
            .iter()
            .filter_map(|row| row.get("id").and_then(Value::as_str).map(|id| (id.to_string(), row)))
            .collect();

        let keys: Vec<String> = self
            .actions
            .iter()
            .filter(|(_, a)| a.kind == ActionKind::Order)
            .map(|(k, _)| k.clone())
            .collect();

        for key in keys {
            let Some(action) = self.actions.get(&key) else { continue };
            let Some(remote_id) = action.remote_id.clone() else { continue };
            let Some(row) = by_remote.get(&remote_id) else { continue };
            let rule = self.rules.order_rules.iter().find(|r| r.name == action.rule_name).cloned();
            let Some(rule) = rule else { continue };
            if !rule.bump_if_outbid {
                continue;
            }
            let competitor = infer_competitor_price(row, &["order_price", "price"]);
            let target = compute_bump_price(action.price, competitor, rule.outbid_step, None);
            let Some(target) = target else { continue };

            if self.rules.runtime.dry_run {
                if let Some(action) = self.actions.get_mut(&key) {
                    action.price = target;
                }
                continue;
            }
            if self.cancel_action(&key, true).await.is_ok() {
                if let Err(e) = self.create_order(&key, &rule, target).await {
                    warn!("[{}] order bump re-place failed: {e}", self.account.name);
                }
            }
        }
        Ok(())
    }

    async fn auto_cancel_expired(&mut self) -> Result<(), crate::errors::PortalError> {
        let now = now_ts();
        let expired: Vec<String> = self
            .actions
            .iter()
            .filter(|(_, a)| a.expires_ts.map(|e| e <= now).unwrap_or(false))
            .map(|(k, _)| k.clone())
            .collect();
        for key in expired {
            self.cancel_action(&key, false).await?;
        }
        Ok(())
    }

    async fn process_inventory(&mut self, floor_by_traits: &HashMap<String, Decimal>) -> Result<(), crate::errors::PortalError> {
        let inventory_raw = self.api.inventory().await?;
        let listed_raw = self.api.my_listings().await?;
        let listed_nfts: std::collections::HashSet<String> = listed_raw
            .iter()
            .filter_map(|row| row.get("nft_id").and_then(Value::as_str).map(str::to_string))
            .collect();

        let gifts: Vec<_> = inventory_raw.iter().filter_map(parse_inventory_item).collect();
        for gift in gifts {
            if gift.listed || listed_nfts.contains(&gift.nft_id) {
                continue;
            }
            let rule = self
                .rules
                .sell_rules
                .iter()
                .find(|r| r.enabled && selector_matches_inventory(&r.selector, &gift))
                .cloned();
            let Some(rule) = rule else { continue };

            let trait_key = Self::trait_key(&gift.collection_id, &gift.model, &gift.background);
            let floor = floor_by_traits.get(&trait_key).copied();
            let buy_price = self.ledger.get_buy_price(&self.account.name, &gift.nft_id).await.ok().flatten();
            let (price, _reason) = compute_sell_price(floor, buy_price, &rule);
            let Some(price) = price else { continue };

            let key = format!("listing:{}:{}", gift.nft_id, rule.name);
            if self.actions.contains_key(&key) {
                continue;
            }
            let now = now_ts();
            let remote_id = if self.rules.runtime.dry_run {
                format!("dry-{key}")
            } else {
                let payload = json!({
                    "nft_id": gift.nft_id,
                    "price": crate::money::format_price(price),
                    "expiration_days": rule.expiration_days,
                });
                match self.api.create_listing(&payload).await {
                    Ok(response) => {
                        let id = infer_remote_id(&response, &["listing_id", "id"]);
                        if id.is_empty() { format!("dry-{key}") } else { id }
                    }
                    Err(e) => {
                        warn!("[{}] create_listing failed for {}: {e}", self.account.name, gift.nft_id);
                        continue;
                    }
                }
            };

            self.actions.insert(
                key.clone(),
                ManagedAction {
                    key: key.clone(),
                    kind: ActionKind::Listing,
                    rule_name: rule.name.clone(),
                    remote_id: Some(remote_id),
                    nft_id: Some(gift.nft_id.clone()),
                    selector_key: String::new(),
                    price,
                    cap_price: None,
                    created_ts: now,
                    expires_ts: Some(now + rule.expiration_days * 86_400),
                    extra: Value::Null,
                },
            );
            self.notify(format!("listing {} for {} at {}", rule.name, gift.nft_id, price));
        }
        Ok(())
    }

    async fn reprice_listings(&mut self, floor_by_traits: &HashMap<String, Decimal>) -> Result<(), crate::errors::PortalError> {
        let listed_raw = self.api.my_listings().await?;
        for raw in &listed_raw {
            let Some(listing) = parse_listing(raw) else { continue };
            let Some(current_price) = listing.ask_price else { continue };

            let rule = self
                .rules
                .sell_rules
                .iter()
                .find(|r| r.enabled && selector_matches_listing(&r.selector, &listing))
                .cloned();
            let Some(rule) = rule else { continue };
            if !rule.auto_reprice_below_floor {
                continue;
            }

            let buy_price = self.ledger.get_buy_price(&self.account.name, &listing.nft_id).await.ok().flatten();
            let min_price = match (rule.min_sell_price, buy_price) {
                (Some(min_sell), Some(buy)) => {
                    let buy_floor = quantize2(buy * (Decimal::ONE + rule.markup_pct / Decimal::ONE_HUNDRED));
                    Some(min_sell.max(buy_floor))
                }
                (Some(min_sell), None) => Some(min_sell),
                (None, Some(buy)) => Some(quantize2(buy * (Decimal::ONE + rule.markup_pct / Decimal::ONE_HUNDRED))),
                (None, None) => None,
            };

            let trait_key = Self::trait_key(&listing.collection_id, &listing.model, &listing.background);
            let competitor_floor = floor_by_traits.get(&trait_key).copied();
            let target = compute_reprice_below_floor(competitor_floor, current_price, rule.reprice_step, min_price);
            let Some(target) = target else { continue };

            let remote_id = infer_remote_id(raw, &["listing_id", "id"]);
            if !self.rules.runtime.dry_run {
                if remote_id.is_empty() {
                    continue;
                }
                let payload = json!({"price": crate::money::format_price(target)});
                if let Err(e) = self.api.update_listing(&remote_id, &payload).await {
                    warn!("[{}] update_listing failed for {}: {e}", self.account.name, listing.nft_id);
                    continue;
                }
            }

            let key = format!("listing:{}:{}", listing.nft_id, rule.name);
            if let Some(action) = self.actions.get_mut(&key) {
                action.price = target;
            }
        }
        Ok(())
    }

    async fn ingest_activity(&mut self) -> Result<(), crate::errors::PortalError> {
        let since = self.last_activity_poll.map(|_| now_ts() - 86_400);
        let rows = self.api.activity(since).await?;
        for raw in rows {
            let Some(event) = parse_trade_event(&raw, &self.account.name) else {
                continue;
            };
            match self.ledger.record_trade(&event).await {
                Ok(true) => {
                    self.notify(format!(
                        "{} {} at {}",
                        event.kind.as_str(),
                        event.nft_id,
                        event.price
                    ));
                }
                Ok(false) => {}
                Err(e) => warn!("[{}] record_trade failed: {e}", self.account.name),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trait_key_is_case_insensitive() {
        let a = AccountWorker::trait_key("C1", "Model", "Background");
        let b = AccountWorker::trait_key("c1", "model", "background");
        assert_eq!(a, b);
    }
}
