//! Loads the strategy document, accounts file, and auth source into an
//! immutable [`AppConfig`]. Bridges the legacy `rules[]` strategy shape,
//! clamps runtime knobs into their floors, and resolves per-account auth.

use std::collections::BTreeSet;
use std::env;
use std::fs;
use std::path::Path;

use rust_decimal::Decimal;
use serde_json::Value;

use crate::errors::{PortalError, PortalResult};
use crate::model::{
    AccountConfig, ApiRoutes, AppConfig, LiquiditySettings, OfferOrderRule, RuleMode, RuleSelector,
    RuntimeSettings, SellRule, TelegramSettings,
};
use crate::money::parse_decimal;

const MIN_EXPIRATION_DAYS: i64 = 1;
const MAX_EXPIRATION_DAYS: i64 = 30;
const FAST_POLL_FLOOR: f64 = 0.05;
const SLOW_POLL_FLOOR: f64 = 3.0;

pub struct LoadArgs {
    pub strategy_file: String,
    pub accounts_file: Option<String>,
    pub auth_file: Option<String>,
    pub api_base_override: Option<String>,
    pub state_db_override: Option<String>,
    pub telegram_token_override: Option<String>,
    pub telegram_chat_ids_override: Option<String>,
    pub telegram_enabled_override: Option<bool>,
}

fn to_decimal(value: &Value, field: &str) -> PortalResult<Decimal> {
    parse_decimal(Some(value))
        .ok_or_else(|| PortalError::Config(format!("field '{field}' is not a valid decimal")))
}

fn to_optional_decimal(value: Option<&Value>, field: &str) -> PortalResult<Option<Decimal>> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(v) => to_decimal(v, field).map(Some),
    }
}

fn to_bool(value: Option<&Value>, default: bool) -> bool {
    match value {
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => matches!(s.to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Some(Value::Number(n)) => n.as_i64().map(|i| i != 0).unwrap_or(default),
        _ => default,
    }
}

fn normalize_list(value: Option<&Value>) -> BTreeSet<String> {
    let mut out = BTreeSet::new();
    match value {
        Some(Value::Array(items)) => {
            for item in items {
                if let Some(s) = item.as_str() {
                    let s = s.trim().to_lowercase();
                    if !s.is_empty() {
                        out.insert(s);
                    }
                }
            }
        }
        Some(Value::String(s)) => {
            let s = s.trim().to_lowercase();
            if !s.is_empty() {
                out.insert(s);
            }
        }
        _ => {}
    }
    out
}

fn parse_selector(value: &Value) -> RuleSelector {
    RuleSelector {
        collection_ids: normalize_list(value.get("collection_ids")),
        gift_names: normalize_list(value.get("gift_names")),
        name_contains: normalize_list(value.get("name_contains")),
        models: normalize_list(value.get("models")),
        backgrounds: normalize_list(value.get("backgrounds")),
        only_recent_seconds: value.get("only_recent_seconds").and_then(Value::as_i64),
    }
}

fn clamp_expiration_days(raw: Option<i64>) -> i64 {
    raw.unwrap_or(MAX_EXPIRATION_DAYS)
        .clamp(MIN_EXPIRATION_DAYS, MAX_EXPIRATION_DAYS)
}

fn check_min_max(min: Option<Decimal>, max: Option<Decimal>, field: &str) -> PortalResult<()> {
    if let (Some(min), Some(max)) = (min, max) {
        if min > max {
            return Err(PortalError::Config(format!("{field}: min is greater than max")));
        }
    }
    Ok(())
}

fn parse_offer_rule(value: &Value, mode: RuleMode, defaults: Option<&Value>) -> PortalResult<OfferOrderRule> {
    let merged = merge_defaults(value, defaults);
    let name = merged
        .get("name")
        .and_then(Value::as_str)
        .unwrap_or(if mode == RuleMode::Offer { "default_offer_rule" } else { "default_order_rule" })
        .to_string();

    let offer_factor = to_decimal(merged.get("offer_factor").unwrap_or(&Value::from(0.8)), "offer_factor")?;
    if offer_factor <= Decimal::ZERO {
        return Err(PortalError::Config(format!("rule '{name}': offer_factor must be > 0")));
    }
    let min_offer = to_decimal(merged.get("min_offer").unwrap_or(&Value::from(0.01)), "min_offer")?;
    let max_offer = to_optional_decimal(merged.get("max_offer"), "max_offer")?;
    check_min_max(Some(min_offer), max_offer, "min_offer/max_offer")?;

    let min_ask = to_optional_decimal(merged.get("min_ask"), "min_ask")?;
    let max_ask = to_optional_decimal(merged.get("max_ask"), "max_ask")?;
    check_min_max(min_ask, max_ask, "min_ask/max_ask")?;

    let min_floor = to_optional_decimal(merged.get("min_floor"), "min_floor")?;
    let max_floor = to_optional_decimal(merged.get("max_floor"), "max_floor")?;
    check_min_max(min_floor, max_floor, "min_floor/max_floor")?;

    let max_listing_to_floor = to_decimal(
        merged.get("max_listing_to_floor").unwrap_or(&Value::from(1.25)),
        "max_listing_to_floor",
    )?;
    if max_listing_to_floor <= Decimal::ZERO {
        return Err(PortalError::Config(format!(
            "rule '{name}': max_listing_to_floor must be > 0"
        )));
    }

    let min_discount_pct = to_optional_decimal(merged.get("min_discount_pct"), "min_discount_pct")?;
    let max_discount_pct = to_optional_decimal(merged.get("max_discount_pct"), "max_discount_pct")?;
    check_min_max(min_discount_pct, max_discount_pct, "min_discount_pct/max_discount_pct")?;

    let outbid_step = to_decimal(merged.get("outbid_step").unwrap_or(&Value::from(0.01)), "outbid_step")?;
    let expiration_days = clamp_expiration_days(merged.get("expiration_days").and_then(Value::as_i64));

    Ok(OfferOrderRule {
        name,
        enabled: to_bool(merged.get("enabled"), true),
        mode,
        selector: parse_selector(&merged),
        offer_factor,
        min_offer,
        max_offer,
        min_ask,
        max_ask,
        min_floor,
        max_floor,
        max_listing_to_floor,
        min_discount_pct,
        max_discount_pct,
        outbid_step,
        bump_if_outbid: to_bool(merged.get("bump_if_outbid"), true),
        skip_crafted: to_bool(merged.get("skip_crafted"), mode == RuleMode::Offer),
        expiration_days,
        expiration_seconds: merged.get("expiration_seconds").and_then(Value::as_i64),
        max_actions_per_cycle: merged.get("max_actions_per_cycle").and_then(Value::as_i64).unwrap_or(4),
    })
}

fn parse_sell_rule(value: &Value) -> PortalResult<SellRule> {
    let name = value.get("name").and_then(Value::as_str).unwrap_or("default_sell_rule").to_string();
    let min_sell_price = to_optional_decimal(value.get("min_sell_price"), "min_sell_price")?;
    let max_sell_price = to_optional_decimal(value.get("max_sell_price"), "max_sell_price")?;
    check_min_max(min_sell_price, max_sell_price, "min_sell_price/max_sell_price")?;

    Ok(SellRule {
        name,
        enabled: to_bool(value.get("enabled"), true),
        selector: parse_selector(value),
        markup_pct: to_decimal(value.get("markup_pct").unwrap_or(&Value::from(5.0)), "markup_pct")?,
        floor_undercut_step: to_decimal(
            value.get("floor_undercut_step").unwrap_or(&Value::from(0.01)),
            "floor_undercut_step",
        )?,
        min_sell_price,
        max_sell_price,
        auto_reprice_below_floor: to_bool(value.get("auto_reprice_below_floor"), true),
        reprice_step: to_decimal(value.get("reprice_step").unwrap_or(&Value::from(0.01)), "reprice_step")?,
        expiration_days: clamp_expiration_days(value.get("expiration_days").and_then(Value::as_i64)),
        expiration_seconds: value.get("expiration_seconds").and_then(Value::as_i64),
    })
}

fn parse_runtime(value: Option<&Value>) -> PortalResult<RuntimeSettings> {
    let defaults = RuntimeSettings::default();
    let value = value.cloned().unwrap_or(Value::Object(Default::default()));

    let clamp_fast = |v: f64| v.max(FAST_POLL_FLOOR);
    let clamp_slow = |v: f64| v.max(SLOW_POLL_FLOOR);

    Ok(RuntimeSettings {
        dry_run: to_bool(value.get("dry_run"), defaults.dry_run),
        idle_poll_interval: clamp_fast(value.get("idle_poll_interval").and_then(Value::as_f64).unwrap_or(defaults.idle_poll_interval)),
        hot_poll_interval: clamp_fast(value.get("hot_poll_interval").and_then(Value::as_f64).unwrap_or(defaults.hot_poll_interval)),
        hot_cycles: value.get("hot_cycles").and_then(Value::as_u64).map(|v| v as u32).unwrap_or(defaults.hot_cycles),
        request_timeout: clamp_slow(value.get("request_timeout").and_then(Value::as_f64).unwrap_or(defaults.request_timeout)),
        search_limit: value.get("search_limit").and_then(Value::as_u64).map(|v| v as u32).unwrap_or(defaults.search_limit),
        warm_start: to_bool(value.get("warm_start"), defaults.warm_start),
        seen_cache_size: value.get("seen_cache_size").and_then(Value::as_u64).map(|v| v as usize).unwrap_or(defaults.seen_cache_size),
        seen_break_streak: value.get("seen_break_streak").and_then(Value::as_u64).map(|v| v as u32).unwrap_or(defaults.seen_break_streak),
        max_new_per_cycle: value.get("max_new_per_cycle").and_then(Value::as_u64).map(|v| v as usize).unwrap_or(defaults.max_new_per_cycle),
        max_offers_per_cycle: value.get("max_offers_per_cycle").and_then(Value::as_u64).map(|v| v as usize).unwrap_or(defaults.max_offers_per_cycle),
        activity_poll_every_sec: clamp_slow(value.get("activity_poll_every_sec").and_then(Value::as_f64).unwrap_or(defaults.activity_poll_every_sec)),
        inventory_poll_every_sec: clamp_slow(value.get("inventory_poll_every_sec").and_then(Value::as_f64).unwrap_or(defaults.inventory_poll_every_sec)),
        orders_poll_every_sec: clamp_slow(value.get("orders_poll_every_sec").and_then(Value::as_f64).unwrap_or(defaults.orders_poll_every_sec)),
        listings_poll_every_sec: clamp_slow(value.get("listings_poll_every_sec").and_then(Value::as_f64).unwrap_or(defaults.listings_poll_every_sec)),
    })
}

fn parse_liquidity(value: Option<&Value>) -> PortalResult<LiquiditySettings> {
    let defaults = LiquiditySettings::default();
    let value = match value {
        Some(v) => v.clone(),
        None => return Ok(defaults),
    };
    Ok(LiquiditySettings {
        enabled: to_bool(value.get("enabled"), defaults.enabled),
        min_recent_sales: value.get("min_recent_sales").and_then(Value::as_i64).unwrap_or(defaults.min_recent_sales),
        min_sell_through: to_optional_decimal(value.get("min_sell_through"), "min_sell_through")?.unwrap_or(defaults.min_sell_through),
        max_floor_to_last_sale: to_optional_decimal(value.get("max_floor_to_last_sale"), "max_floor_to_last_sale")?
            .or(defaults.max_floor_to_last_sale),
    })
}

fn parse_routes(value: Option<&Value>) -> ApiRoutes {
    let defaults = ApiRoutes::default();
    let value = match value {
        Some(v) => v.clone(),
        None => return defaults,
    };
    let field = |key: &str, default: &str| {
        value.get(key).and_then(Value::as_str).map(str::to_string).unwrap_or_else(|| default.to_string())
    };
    ApiRoutes {
        search_listings: field("search_listings", &defaults.search_listings),
        create_offer: field("create_offer", &defaults.create_offer),
        my_offers: field("my_offers", &defaults.my_offers),
        cancel_offer: field("cancel_offer", &defaults.cancel_offer),
        create_order: field("create_order", &defaults.create_order),
        my_orders: field("my_orders", &defaults.my_orders),
        cancel_order: field("cancel_order", &defaults.cancel_order),
        inventory: field("inventory", &defaults.inventory),
        create_listing: field("create_listing", &defaults.create_listing),
        my_listings: field("my_listings", &defaults.my_listings),
        update_listing: field("update_listing", &defaults.update_listing),
        cancel_listing: field("cancel_listing", &defaults.cancel_listing),
        recent_sales: field("recent_sales", &defaults.recent_sales),
        activity: field("activity", &defaults.activity),
    }
}

fn parse_telegram(
    value: Option<&Value>,
    token_override: Option<String>,
    chat_ids_override: Option<String>,
    enabled_override: Option<bool>,
) -> TelegramSettings {
    let value = value.cloned().unwrap_or(Value::Object(Default::default()));
    let token = token_override
        .or_else(|| value.get("token").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_default();

    let mut chat_ids: BTreeSet<i64> = BTreeSet::new();
    if let Some(raw) = chat_ids_override {
        for part in raw.split(',') {
            if let Ok(id) = part.trim().parse::<i64>() {
                chat_ids.insert(id);
            }
        }
    } else if let Some(Value::Array(items)) = value.get("chat_ids") {
        for item in items {
            if let Some(id) = item.as_i64() {
                chat_ids.insert(id);
            }
        }
    }

    let enabled = enabled_override.unwrap_or_else(|| to_bool(value.get("enabled"), !token.is_empty()));

    TelegramSettings { enabled, token, chat_ids }
}

fn resolve_auth(inline: Option<&str>, env_key: Option<&str>, auth_file: Option<&str>) -> PortalResult<String> {
    if let Some(auth) = inline {
        if !auth.trim().is_empty() {
            return Ok(auth.trim().to_string());
        }
    }
    if let Some(key) = env_key {
        if let Ok(val) = env::var(key) {
            if !val.trim().is_empty() {
                return Ok(val.trim().to_string());
            }
        }
    }
    if let Ok(val) = env::var("PORTAL_AUTH") {
        if !val.trim().is_empty() {
            return Ok(val.trim().to_string());
        }
    }
    if let Some(path) = auth_file {
        if let Ok(contents) = fs::read_to_string(path) {
            let trimmed = contents.trim();
            if !trimmed.is_empty() {
                return Ok(trimmed.to_string());
            }
        }
    }
    Err(PortalError::Config("could not resolve auth from env, inline value, or auth file".into()))
}

fn parse_accounts(value: Option<&Value>, auth_file: Option<&str>) -> PortalResult<Vec<AccountConfig>> {
    let accounts_value = value.and_then(|v| v.get("accounts")).cloned();
    match accounts_value {
        Some(Value::Array(items)) if !items.is_empty() => items
            .iter()
            .map(|item| {
                let name = item.get("name").and_then(Value::as_str).unwrap_or("main").to_string();
                let inline = item.get("auth").and_then(Value::as_str);
                let env_key = item.get("auth_env").and_then(Value::as_str);
                let auth = resolve_auth(inline, env_key, auth_file)?;
                Ok(AccountConfig { name, auth })
            })
            .collect(),
        _ => {
            let auth = resolve_auth(None, None, auth_file)?;
            Ok(vec![AccountConfig { name: "main".to_string(), auth }])
        }
    }
}

fn merge_defaults(item: &Value, defaults: Option<&Value>) -> Value {
    let mut merged = defaults.cloned().unwrap_or(Value::Object(Default::default()));
    if let (Value::Object(base), Value::Object(overrides)) = (&mut merged, item) {
        for (k, v) in overrides {
            base.insert(k.clone(), v.clone());
        }
    }
    merged
}

/// Rewrites the legacy `rules[]` + `global_offer`/`global_filters`/`defaults`
/// shape into the modern `offer_rules`/`order_rules`/`sell_rules` arrays.
fn legacy_strategy_bridge(doc: &Value) -> Value {
    let has_modern = doc.get("offer_rules").is_some() || doc.get("order_rules").is_some() || doc.get("sell_rules").is_some();
    if has_modern {
        return doc.clone();
    }
    let Some(Value::Array(rules)) = doc.get("rules") else {
        return doc.clone();
    };

    let defaults = doc.get("defaults").cloned().unwrap_or(Value::Object(Default::default()));
    let global_offer = doc.get("global_offer").cloned().unwrap_or(Value::Object(Default::default()));
    let global_filters = doc.get("global_filters").cloned();

    let mut offer_rules = Vec::new();
    for rule in rules {
        let mut merged = merge_defaults(rule, Some(&defaults));
        merged = merge_defaults(&merged, Some(&global_offer));
        if let (Value::Object(obj), Some(Value::Object(filters))) = (&mut merged, global_filters.as_ref()) {
            for key in ["collection_ids", "gift_names", "name_contains", "models", "backgrounds"] {
                if !obj.contains_key(key) {
                    if let Some(v) = filters.get(key) {
                        obj.insert(key.to_string(), v.clone());
                    }
                }
            }
        }
        offer_rules.push(merged);
    }
    if offer_rules.is_empty() {
        offer_rules.push(defaults.clone());
    }

    let mut out = doc.clone();
    if let Value::Object(obj) = &mut out {
        obj.insert("offer_rules".to_string(), Value::Array(offer_rules));
    }
    out
}

pub fn load_app_config(args: LoadArgs) -> PortalResult<AppConfig> {
    let strategy_path = Path::new(&args.strategy_file);
    if !strategy_path.parent().map(|p| p.as_os_str().is_empty() || p.exists()).unwrap_or(true) {
        return Err(PortalError::Config(format!(
            "strategy file directory does not exist: {}",
            args.strategy_file
        )));
    }
    let raw = fs::read_to_string(strategy_path)
        .map_err(|e| PortalError::Config(format!("cannot read strategy file: {e}")))?;
    let doc: Value = serde_json::from_str(&raw).map_err(|e| PortalError::Config(format!("invalid strategy json: {e}")))?;
    let doc = legacy_strategy_bridge(&doc);

    let defaults = doc.get("defaults");
    let offer_rules = match doc.get("offer_rules") {
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| parse_offer_rule(item, RuleMode::Offer, defaults))
            .collect::<PortalResult<Vec<_>>>()?,
        _ => Vec::new(),
    };
    let order_rules = match doc.get("order_rules") {
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| parse_offer_rule(item, RuleMode::Order, defaults))
            .collect::<PortalResult<Vec<_>>>()?,
        _ => Vec::new(),
    };
    let sell_rules = match doc.get("sell_rules") {
        Some(Value::Array(items)) => items.iter().map(parse_sell_rule).collect::<PortalResult<Vec<_>>>()?,
        _ => Vec::new(),
    };

    let runtime = parse_runtime(doc.get("runtime"))?;
    let liquidity = parse_liquidity(doc.get("liquidity"))?;
    let routes = parse_routes(doc.get("api").and_then(|a| a.get("routes")));

    let api_base = args
        .api_base_override
        .or_else(|| env::var("PORTAL_API_BASE").ok())
        .or_else(|| doc.get("api").and_then(|a| a.get("base")).and_then(Value::as_str).map(str::to_string))
        .ok_or_else(|| PortalError::Config("no api base configured".into()))?;

    let state_db_path = args
        .state_db_override
        .or_else(|| env::var("STATE_DB_PATH").ok())
        .unwrap_or_else(|| "portal-sniper.sqlite3".to_string());

    let accounts_doc = match &args.accounts_file {
        Some(path) => {
            let raw = fs::read_to_string(path).map_err(|e| PortalError::Config(format!("cannot read accounts file: {e}")))?;
            Some(serde_json::from_str::<Value>(&raw).map_err(|e| PortalError::Config(format!("invalid accounts json: {e}")))?)
        }
        None => None,
    };
    let accounts = parse_accounts(accounts_doc.as_ref(), args.auth_file.as_deref())?;

    let telegram = parse_telegram(
        doc.get("telegram"),
        args.telegram_token_override,
        args.telegram_chat_ids_override,
        args.telegram_enabled_override,
    );

    Ok(AppConfig {
        api_base,
        routes,
        accounts,
        runtime,
        liquidity,
        offer_rules,
        order_rules,
        sell_rules,
        state_db_path,
        telegram,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_temp(contents: &str) -> tempfile_like::TempPath {
        tempfile_like::TempPath::with_contents(contents)
    }

    mod tempfile_like {
        use std::io::Write;
        use std::path::PathBuf;

        pub struct TempPath {
            path: PathBuf,
        }

        impl TempPath {
            pub fn with_contents(contents: &str) -> Self {
                let mut path = std::env::temp_dir();
                path.push(format!("portal-sniper-test-{}.json", rand_suffix()));
                let mut file = std::fs::File::create(&path).unwrap();
                file.write_all(contents.as_bytes()).unwrap();
                Self { path }
            }

            pub fn as_str(&self) -> String {
                self.path.to_string_lossy().to_string()
            }
        }

        impl Drop for TempPath {
            fn drop(&mut self) {
                let _ = std::fs::remove_file(&self.path);
            }
        }

        fn rand_suffix() -> u64 {
            use std::time::{SystemTime, UNIX_EPOCH};
            use std::sync::atomic::{AtomicU64, Ordering};
            static COUNTER: AtomicU64 = AtomicU64::new(0);
            let nanos = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().subsec_nanos() as u64;
            nanos ^ COUNTER.fetch_add(1, Ordering::Relaxed)
        }
    }

    #[test]
    fn clamps_expiration_days() {
        assert_eq!(clamp_expiration_days(Some(0)), 1);
        assert_eq!(clamp_expiration_days(Some(90)), 30);
        assert_eq!(clamp_expiration_days(Some(10)), 10);
    }

    #[test]
    fn legacy_bridge_builds_offer_rules_from_rules_list() {
        let doc = serde_json::json!({
            "defaults": {"offer_factor": 0.7, "min_offer": 0.05},
            "global_offer": {"outbid_step": 0.02},
            "rules": [{"name": "r1", "collection_ids": ["c1"]}]
        });
        let bridged = legacy_strategy_bridge(&doc);
        let rules = bridged.get("offer_rules").unwrap().as_array().unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].get("name").unwrap(), "r1");
    }

    #[test]
    fn load_app_config_resolves_end_to_end_and_requires_auth() {
        // Exercised in one test (rather than two) to avoid two tests racing
        // on the shared PORTAL_AUTH process environment variable.
        let strategy = write_temp(r#"{"api": {"base": "https://example.test"}}"#);
        env::remove_var("PORTAL_AUTH");
        let missing_auth = load_app_config(LoadArgs {
            strategy_file: strategy.as_str(),
            accounts_file: None,
            auth_file: None,
            api_base_override: None,
            state_db_override: None,
            telegram_token_override: None,
            telegram_chat_ids_override: None,
            telegram_enabled_override: None,
        });
        assert!(missing_auth.is_err());

        let strategy = write_temp(
            r#"{
                "api": {"base": "https://example.test"},
                "offer_rules": [{"name": "r1", "offer_factor": 0.8, "min_offer": 0.1}],
                "runtime": {"idle_poll_interval": 0.01}
            }"#,
        );
        env::set_var("PORTAL_AUTH", "test-token");
        let config = load_app_config(LoadArgs {
            strategy_file: strategy.as_str(),
            accounts_file: None,
            auth_file: None,
            api_base_override: None,
            state_db_override: None,
            telegram_token_override: None,
            telegram_chat_ids_override: None,
            telegram_enabled_override: None,
        })
        .unwrap();
        env::remove_var("PORTAL_AUTH");

        assert_eq!(config.api_base, "https://example.test");
        assert_eq!(config.offer_rules.len(), 1);
        assert_eq!(config.accounts.len(), 1);
        assert_eq!(config.accounts[0].auth, "test-token");
        assert!(config.runtime.idle_poll_interval >= FAST_POLL_FLOOR);
    }
}
