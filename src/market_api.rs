//! HTTP client for the marketplace's trading API. `MarketApi` is the seam
//! the worker trades through; `PortalApiClient` is the reqwest-backed
//! implementation used in production, a mock implementation backs tests.

use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use rust_decimal::Decimal;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

use crate::errors::{PortalError, PortalResult};
use crate::model::{ApiRoutes, InventoryGift, MarketListing, TradeEvent, TradeKind};
use crate::money::parse_decimal;
use crate::time::{now_ts, parse_unix_ts};

#[async_trait]
pub trait MarketApi: Send + Sync {
    async fn search_listings(&self, params: &HashMap<String, String>) -> PortalResult<Vec<Value>>;
    async fn create_offer(&self, payload: &Value) -> PortalResult<Value>;
    async fn my_offers(&self) -> PortalResult<Vec<Value>>;
    async fn cancel_offer(&self, offer_id: &str) -> PortalResult<()>;
    async fn create_order(&self, payload: &Value) -> PortalResult<Value>;
    async fn my_orders(&self) -> PortalResult<Vec<Value>>;
    async fn cancel_order(&self, order_id: &str) -> PortalResult<()>;
    async fn inventory(&self) -> PortalResult<Vec<Value>>;
    async fn create_listing(&self, payload: &Value) -> PortalResult<Value>;
    async fn my_listings(&self) -> PortalResult<Vec<Value>>;
    async fn update_listing(&self, listing_id: &str, payload: &Value) -> PortalResult<Value>;
    async fn cancel_listing(&self, listing_id: &str) -> PortalResult<()>;
    async fn recent_sales(&self, collection_id: &str) -> PortalResult<Vec<Value>>;
    async fn activity(&self, since_ts: Option<i64>) -> PortalResult<Vec<Value>>;

    /// Cheap reachability probe used at worker startup.
    async fn check_auth(&self) -> PortalResult<()> {
        self.my_offers().await?;
        Ok(())
    }
}

/// Maps a raw search-listings row into the typed domain model. Returns
/// `None` (never an error) for rows missing an id, matching the original's
/// "never propagate untyped maps past the client layer" parsing style.
pub fn parse_listing(raw: &Value) -> Option<MarketListing> {
    let nft_id = raw
        .get("nft_id")
        .or_else(|| raw.get("id"))
        .and_then(Value::as_str)?
        .trim()
        .to_string();
    if nft_id.is_empty() {
        return None;
    }
    Some(MarketListing {
        nft_id,
        name: str_field(raw, &["name", "gift_name"]),
        collection_id: str_field(raw, &["collection_id"]),
        tg_id: str_field(raw, &["tg_id"]),
        ask_price: parse_decimal(raw.get("price").or_else(|| raw.get("ask_price"))),
        floor_price: parse_decimal(raw.get("floor_price")),
        listed_at_ts: parse_unix_ts(raw.get("listed_at").or_else(|| raw.get("created_at"))),
        model: str_field(raw, &["model"]),
        background: str_field(raw, &["background"]),
        is_crafted: raw.get("is_crafted").and_then(Value::as_bool).unwrap_or(false),
        raw: raw.clone(),
    })
}

pub fn parse_inventory_item(raw: &Value) -> Option<InventoryGift> {
    let nft_id = raw
        .get("nft_id")
        .or_else(|| raw.get("id"))
        .and_then(Value::as_str)?
        .trim()
        .to_string();
    if nft_id.is_empty() {
        return None;
    }
    Some(InventoryGift {
        nft_id,
        name: str_field(raw, &["name", "gift_name"]),
        collection_id: str_field(raw, &["collection_id"]),
        model: str_field(raw, &["model"]),
        background: str_field(raw, &["background"]),
        listed: raw.get("listed").and_then(Value::as_bool).unwrap_or(false),
        raw: raw.clone(),
    })
}

pub fn parse_trade_event(raw: &Value, account: &str) -> Option<TradeEvent> {
    let event_id = raw
        .get("id")
        .or_else(|| raw.get("event_id"))
        .and_then(Value::as_str)?
        .trim()
        .to_string();
    if event_id.is_empty() {
        return None;
    }
    let type_str = raw.get("type").and_then(Value::as_str).unwrap_or("").to_lowercase();
    let kind = if type_str.contains("buy") || type_str.contains("purchase") {
        TradeKind::Buy
    } else if type_str.contains("sell") {
        TradeKind::Sell
    } else {
        return None;
    };
    Some(TradeEvent {
        account: account.to_string(),
        event_id,
        kind,
        nft_id: str_field(raw, &["nft_id"]),
        gift_name: str_field(raw, &["gift_name", "name"]),
        model: str_field(raw, &["model"]),
        background: str_field(raw, &["background"]),
        price: parse_decimal(raw.get("price")).unwrap_or(Decimal::ZERO),
        fee: parse_decimal(raw.get("fee")).unwrap_or(Decimal::ZERO),
        ts: parse_unix_ts(raw.get("ts").or_else(|| raw.get("timestamp"))).unwrap_or_else(now_ts),
    })
}

fn str_field(raw: &Value, keys: &[&str]) -> String {
    for key in keys {
        if let Some(v) = raw.get(key).and_then(Value::as_str) {
            return v.to_string();
        }
    }
    String::new()
}

pub struct PortalApiClient {
    client: Client,
    base_url: String,
    routes: ApiRoutes,
    auth: String,
}

impl PortalApiClient {
    pub fn new(base_url: String, routes: ApiRoutes, auth: String, timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .expect("failed to build http client");
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            routes,
            auth,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn headers(&self) -> HashMap<String, String> {
        let mut headers = HashMap::new();
        headers.insert("Authorization".into(), format!("Bearer {}", self.auth));
        headers.insert("X-Request-Id".into(), Uuid::new_v4().to_string());
        headers.insert("Content-Type".into(), "application/json".into());
        headers.insert("Accept".into(), "application/json, text/plain, */*".into());
        headers.insert("Origin".into(), "https://portals.tg".into());
        headers.insert("Referer".into(), "https://portals.tg/".into());
        headers.insert(
            "User-Agent".into(),
            "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/144.0.0.0 Safari/537.36"
                .into(),
        );
        headers
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        query: Option<&HashMap<String, String>>,
        body: Option<&Value>,
    ) -> PortalResult<Value> {
        let url = self.url(path);
        let mut request = self.client.request(method, &url);
        for (key, value) in self.headers() {
            request = request.header(key, value);
        }
        if let Some(q) = query {
            request = request.query(q);
        }
        if let Some(b) = body {
            request = request.json(b);
        }

        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(raise_for_error(status, &text));
        }
        Ok(json_or_text(&text))
    }

    fn fill(template: &str, placeholder: &str, id: &str) -> String {
        template.replace(placeholder, id)
    }
}

fn raise_for_error(status: StatusCode, text: &str) -> PortalError {
    let message = serde_json::from_str::<Value>(text)
        .ok()
        .and_then(|v| v.get("message").and_then(|m| m.as_str()).map(str::to_string))
        .unwrap_or_else(|| text.to_string());
    PortalError::Transport {
        code: status.as_str().to_string(),
        message,
    }
}

fn json_or_text(text: &str) -> Value {
    serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string()))
}

/// Marketplace responses wrap lists under varying keys; this tries them in
/// order and falls back to treating the whole body as the array.
fn extract_list(value: Value) -> Vec<Value> {
    if let Value::Array(items) = &value {
        return items.clone();
    }
    for key in ["items", "data", "results", "listings", "offers", "orders", "sales", "activity"] {
        if let Some(Value::Array(items)) = value.get(key) {
            return items.clone();
        }
    }
    Vec::new()
}

pub fn format_price(value: rust_decimal::Decimal) -> String {
    crate::money::format_price(value)
}

#[async_trait]
impl MarketApi for PortalApiClient {
    async fn search_listings(&self, params: &HashMap<String, String>) -> PortalResult<Vec<Value>> {
        let value = self
            .send(Method::GET, &self.routes.search_listings, Some(params), None)
            .await?;
        Ok(extract_list(value))
    }

    async fn create_offer(&self, payload: &Value) -> PortalResult<Value> {
        self.send(Method::POST, &self.routes.create_offer, None, Some(payload))
            .await
    }

    async fn my_offers(&self) -> PortalResult<Vec<Value>> {
        let value = self.send(Method::GET, &self.routes.my_offers, None, None).await?;
        Ok(extract_list(value))
    }

    async fn cancel_offer(&self, offer_id: &str) -> PortalResult<()> {
        let path = Self::fill(&self.routes.cancel_offer, "{offer_id}", offer_id);
        self.send(Method::DELETE, &path, None, None).await?;
        Ok(())
    }

    async fn create_order(&self, payload: &Value) -> PortalResult<Value> {
        self.send(Method::POST, &self.routes.create_order, None, Some(payload))
            .await
    }

    async fn my_orders(&self) -> PortalResult<Vec<Value>> {
        let value = self.send(Method::GET, &self.routes.my_orders, None, None).await?;
        Ok(extract_list(value))
    }

    async fn cancel_order(&self, order_id: &str) -> PortalResult<()> {
        let path = Self::fill(&self.routes.cancel_order, "{order_id}", order_id);
        self.send(Method::DELETE, &path, None, None).await?;
        Ok(())
    }

    async fn inventory(&self) -> PortalResult<Vec<Value>> {
        let value = self.send(Method::GET, &self.routes.inventory, None, None).await?;
        Ok(extract_list(value))
    }

    async fn create_listing(&self, payload: &Value) -> PortalResult<Value> {
        self.send(Method::POST, &self.routes.create_listing, None, Some(payload))
            .await
    }

    async fn my_listings(&self) -> PortalResult<Vec<Value>> {
        let value = self.send(Method::GET, &self.routes.my_listings, None, None).await?;
        Ok(extract_list(value))
    }

    async fn update_listing(&self, listing_id: &str, payload: &Value) -> PortalResult<Value> {
        let path = Self::fill(&self.routes.update_listing, "{listing_id}", listing_id);
        self.send(Method::PATCH, &path, None, Some(payload)).await
    }

    async fn cancel_listing(&self, listing_id: &str) -> PortalResult<()> {
        let path = Self::fill(&self.routes.cancel_listing, "{listing_id}", listing_id);
        self.send(Method::DELETE, &path, None, None).await?;
        Ok(())
    }

    async fn recent_sales(&self, collection_id: &str) -> PortalResult<Vec<Value>> {
        let mut query = HashMap::new();
        query.insert("collection_id".to_string(), collection_id.to_string());
        let value = self
            .send(Method::GET, &self.routes.recent_sales, Some(&query), None)
            .await?;
        Ok(extract_list(value))
    }

    async fn activity(&self, since_ts: Option<i64>) -> PortalResult<Vec<Value>> {
        let mut query = HashMap::new();
        if let Some(ts) = since_ts {
            query.insert("since".to_string(), ts.to_string());
        }
        let value = self
            .send(Method::GET, &self.routes.activity, Some(&query), None)
            .await?;
        Ok(extract_list(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn extract_list_prefers_items_key() {
        let value = json!({"items": [{"a": 1}], "data": []});
        assert_eq!(extract_list(value), vec![json!({"a": 1})]);
    }

    #[test]
    fn extract_list_handles_bare_array() {
        let value = json!([{"a": 1}, {"a": 2}]);
        assert_eq!(extract_list(value).len(), 2);
    }

    #[test]
    fn fill_replaces_placeholder() {
        assert_eq!(
            PortalApiClient::fill("/offers/{offer_id}", "{offer_id}", "abc"),
            "/offers/abc"
        );
    }

    #[test]
    fn parse_listing_rejects_missing_id() {
        assert!(parse_listing(&json!({"name": "Gift"})).is_none());
    }

    #[test]
    fn parse_listing_reads_price_and_traits() {
        let listing = parse_listing(&json!({
            "nft_id": "n1",
            "name": "Gift",
            "collection_id": "c1",
            "price": "1.50",
            "floor_price": "1.40",
            "model": "m1",
            "background": "b1",
            "is_crafted": true
        }))
        .unwrap();
        assert_eq!(listing.nft_id, "n1");
        assert_eq!(listing.ask_price, Some(rust_decimal_macros::dec!(1.50)));
        assert!(listing.is_crafted);
    }

    #[test]
    fn parse_trade_event_classifies_buy_and_sell() {
        let buy = parse_trade_event(&json!({"id": "e1", "type": "buy", "price": "1.00"}), "acc1").unwrap();
        assert_eq!(buy.kind, TradeKind::Buy);
        let sell = parse_trade_event(&json!({"id": "e2", "type": "sale_sell", "price": "1.00"}), "acc1").unwrap();
        assert_eq!(sell.kind, TradeKind::Sell);
        assert!(parse_trade_event(&json!({"id": "e3", "type": "transfer"}), "acc1").is_none());
    }
}
