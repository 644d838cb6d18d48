//! Pure price/selector algebra. No I/O, no mutable worker state — every
//! function here takes its inputs and returns a decision.

use crate::model::{
    InventoryGift, LiquiditySettings, MarketListing, OfferOrderRule, RuleSelector, SellRule,
};
use crate::money::quantize2;
use crate::time::now_ts;
use rust_decimal::Decimal;
use serde_json::Value;
use std::collections::HashMap;

pub fn selector_matches_listing(selector: &RuleSelector, listing: &MarketListing) -> bool {
    if !selector.matches_collection(&listing.collection_id) {
        return false;
    }
    if !selector.matches_name(&listing.name) {
        return false;
    }
    if !selector.matches_traits(&listing.model, &listing.background) {
        return false;
    }
    if let (Some(window), Some(listed_at)) = (selector.only_recent_seconds, listing.listed_at_ts) {
        if window > 0 && now_ts() - listed_at > window {
            return false;
        }
    }
    true
}

pub fn selector_matches_inventory(selector: &RuleSelector, gift: &InventoryGift) -> bool {
    selector.matches_collection(&gift.collection_id)
        && selector.matches_name(&gift.name)
        && selector.matches_traits(&gift.model, &gift.background)
}

pub fn pass_liquidity(
    liquidity: &LiquiditySettings,
    listing_floor_price: Option<Decimal>,
    recent_sales_count: i64,
    total_active_listings: i64,
    last_sale_price: Option<Decimal>,
) -> bool {
    if !liquidity.enabled {
        return true;
    }
    if recent_sales_count < liquidity.min_recent_sales {
        return false;
    }
    if total_active_listings > 0 {
        let sell_through = Decimal::from(recent_sales_count) / Decimal::from(total_active_listings);
        if sell_through < liquidity.min_sell_through {
            return false;
        }
    }
    if let (Some(max_ratio), Some(last_sale)) = (liquidity.max_floor_to_last_sale, last_sale_price) {
        if let Some(floor) = listing_floor_price {
            if last_sale > Decimal::ZERO {
                let ratio = floor / last_sale;
                if ratio > max_ratio {
                    return false;
                }
            }
        }
    }
    true
}

fn apply_discount_bounds(
    price: Decimal,
    floor: Decimal,
    min_discount_pct: Option<Decimal>,
    max_discount_pct: Option<Decimal>,
) -> Decimal {
    let mut out = price;
    if let Some(min_discount) = min_discount_pct {
        let cap = floor * (Decimal::ONE - (min_discount / Decimal::ONE_HUNDRED));
        out = out.min(cap);
    }
    if let Some(max_discount) = max_discount_pct {
        let min_price = floor * (Decimal::ONE - (max_discount / Decimal::ONE_HUNDRED));
        out = out.max(min_price);
    }
    out
}

/// Returns `(price, reason)`; `reason` is `"ok"` on success, else a stable
/// rejection tag (see §8 scenarios in spec.md).
pub fn evaluate_offer_price(listing: &MarketListing, rule: &OfferOrderRule) -> (Option<Decimal>, &'static str) {
    let ask = match listing.ask_price {
        Some(a) => a,
        None => return (None, "missing_prices"),
    };
    let floor = listing.floor_price.unwrap_or(ask);

    if ask <= Decimal::ZERO || floor <= Decimal::ZERO {
        return (None, "invalid_prices");
    }
    if rule.skip_crafted && listing.is_crafted {
        return (None, "crafted");
    }
    if let Some(min_ask) = rule.min_ask {
        if ask < min_ask {
            return (None, "ask_below_min");
        }
    }
    if let Some(max_ask) = rule.max_ask {
        if ask > max_ask {
            return (None, "ask_above_max");
        }
    }
    if let Some(min_floor) = rule.min_floor {
        if floor < min_floor {
            return (None, "floor_below_min");
        }
    }
    if let Some(max_floor) = rule.max_floor {
        if floor > max_floor {
            return (None, "floor_above_max");
        }
    }
    if ask > floor * rule.max_listing_to_floor {
        return (None, "ask_far_from_floor");
    }

    let mut candidate = quantize2(floor * rule.offer_factor);
    candidate = quantize2(apply_discount_bounds(
        candidate,
        floor,
        rule.min_discount_pct,
        rule.max_discount_pct,
    ));

    let max_allowed = quantize2(ask - rule.outbid_step);
    if max_allowed <= Decimal::ZERO {
        return (None, "max_allowed_lte_zero");
    }
    if candidate > max_allowed {
        candidate = max_allowed;
    }
    if let Some(max_offer) = rule.max_offer {
        if candidate > max_offer {
            candidate = quantize2(max_offer);
        }
    }
    if candidate < rule.min_offer {
        return (None, "below_min_offer");
    }
    if candidate <= Decimal::ZERO {
        return (None, "candidate_lte_zero");
    }
    (Some(candidate), "ok")
}

pub fn evaluate_order_price(
    listing_floor: Option<Decimal>,
    rule: &OfferOrderRule,
) -> (Option<Decimal>, &'static str) {
    let floor = match listing_floor {
        Some(f) if f > Decimal::ZERO => f,
        _ => return (None, "missing_floor"),
    };
    if let Some(min_floor) = rule.min_floor {
        if floor < min_floor {
            return (None, "floor_below_min");
        }
    }
    if let Some(max_floor) = rule.max_floor {
        if floor > max_floor {
            return (None, "floor_above_max");
        }
    }

    let mut candidate = quantize2(floor * rule.offer_factor);
    candidate = quantize2(apply_discount_bounds(
        candidate,
        floor,
        rule.min_discount_pct,
        rule.max_discount_pct,
    ));
    if let Some(max_offer) = rule.max_offer {
        if candidate > max_offer {
            candidate = quantize2(max_offer);
        }
    }
    if candidate < rule.min_offer {
        return (None, "below_min_offer");
    }
    if candidate <= Decimal::ZERO {
        return (None, "candidate_lte_zero");
    }
    (Some(candidate), "ok")
}

pub fn compute_bump_price(
    own_price: Decimal,
    competitor_price: Option<Decimal>,
    step: Decimal,
    cap_price: Option<Decimal>,
) -> Option<Decimal> {
    let competitor_price = competitor_price?;
    if competitor_price < own_price {
        return None;
    }
    let bumped = quantize2(competitor_price + step);
    if bumped <= own_price {
        return None;
    }
    if let Some(cap) = cap_price {
        if bumped > cap {
            return None;
        }
    }
    Some(bumped)
}

pub fn compute_sell_price(
    floor_price: Option<Decimal>,
    buy_price: Option<Decimal>,
    sell_rule: &SellRule,
) -> (Option<Decimal>, &'static str) {
    if floor_price.is_none() && buy_price.is_none() {
        return (None, "missing_floor_and_buy");
    }
    let mut candidate = match floor_price {
        Some(floor) if floor > Decimal::ZERO => {
            floor * (Decimal::ONE + (sell_rule.markup_pct / Decimal::ONE_HUNDRED))
        }
        _ => buy_price.unwrap_or(Decimal::ZERO),
    };
    candidate = quantize2(candidate);

    if let Some(min_sell) = sell_rule.min_sell_price {
        if candidate < min_sell {
            candidate = quantize2(min_sell);
        }
    }
    if let Some(max_sell) = sell_rule.max_sell_price {
        if candidate > max_sell {
            candidate = quantize2(max_sell);
        }
    }
    if candidate <= Decimal::ZERO {
        return (None, "candidate_lte_zero");
    }
    (Some(candidate), "ok")
}

pub fn compute_reprice_below_floor(
    competitor_floor: Option<Decimal>,
    current_price: Decimal,
    step: Decimal,
    min_price: Option<Decimal>,
) -> Option<Decimal> {
    let competitor_floor = competitor_floor?;
    let target = quantize2(competitor_floor - step);
    if target <= Decimal::ZERO {
        return None;
    }
    if target >= current_price {
        return None;
    }
    if let Some(min_price) = min_price {
        if target < min_price {
            return None;
        }
    }
    Some(target)
}

const COMPETITOR_PRICE_KEYS: &[&str] = &[
    "top_offer_price",
    "best_offer_price",
    "highest_offer_price",
    "top_order_price",
    "best_order_price",
    "highest_order_price",
    "best_bid",
];

pub fn infer_competitor_price(item: &Value, own_price_keys: &[&str]) -> Option<Decimal> {
    use crate::money::parse_decimal;
    for key in COMPETITOR_PRICE_KEYS {
        if let Some(v) = parse_decimal(item.get(key)) {
            return Some(v);
        }
    }
    for own_key in own_price_keys {
        if let Some(nested) = item.get(own_key) {
            for key in COMPETITOR_PRICE_KEYS {
                if let Some(v) = parse_decimal(nested.get(key)) {
                    return Some(v);
                }
            }
        }
    }
    None
}

pub fn infer_remote_id(payload: &Value, keys: &[&str]) -> String {
    for key in keys {
        if let Some(v) = payload.get(key) {
            let text = value_to_trimmed_string(v);
            if !text.is_empty() {
                return text;
            }
        }
    }
    for section_key in ["offer", "order", "listing", "result", "data"] {
        if let Some(sec) = payload.get(section_key) {
            for key in keys {
                if let Some(v) = sec.get(key) {
                    let text = value_to_trimmed_string(v);
                    if !text.is_empty() {
                        return text;
                    }
                }
            }
            if let Some(v) = sec.get("id") {
                let text = value_to_trimmed_string(v);
                if !text.is_empty() {
                    return text;
                }
            }
        }
    }
    String::new()
}

fn value_to_trimmed_string(v: &Value) -> String {
    match v {
        Value::String(s) => s.trim().to_string(),
        Value::Null => String::new(),
        other => other.to_string().trim_matches('"').to_string(),
    }
}

pub fn selector_to_order_payload(selector: &RuleSelector) -> HashMap<String, String> {
    let mut payload = HashMap::new();
    if let Some(v) = selector.collection_ids.iter().next() {
        payload.insert("collection_id".to_string(), v.clone());
    }
    if let Some(v) = selector.gift_names.iter().next() {
        payload.insert("gift_name".to_string(), v.clone());
    }
    if let Some(v) = selector.models.iter().next() {
        payload.insert("model".to_string(), v.clone());
    }
    if let Some(v) = selector.backgrounds.iter().next() {
        payload.insert("background".to_string(), v.clone());
    }
    payload
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::RuleMode;
    use rust_decimal_macros::dec;
    use serde_json::json;

    fn base_rule() -> OfferOrderRule {
        OfferOrderRule {
            name: "r1".into(),
            enabled: true,
            mode: RuleMode::Offer,
            selector: RuleSelector::default(),
            offer_factor: dec!(0.8),
            min_offer: dec!(0.10),
            max_offer: None,
            min_ask: None,
            max_ask: None,
            min_floor: None,
            max_floor: None,
            max_listing_to_floor: dec!(1.25),
            min_discount_pct: None,
            max_discount_pct: None,
            outbid_step: dec!(0.01),
            bump_if_outbid: true,
            skip_crafted: true,
            expiration_days: 7,
            expiration_seconds: None,
            max_actions_per_cycle: 4,
        }
    }

    fn base_listing() -> MarketListing {
        MarketListing {
            nft_id: "n1".into(),
            name: "Gift".into(),
            collection_id: "c1".into(),
            tg_id: "t1".into(),
            ask_price: Some(dec!(1.00)),
            floor_price: Some(dec!(1.00)),
            listed_at_ts: None,
            model: "m1".into(),
            background: "b1".into(),
            is_crafted: false,
            raw: json!({}),
        }
    }

    #[test]
    fn scenario_1_offer_on_underpriced_listing() {
        let (price, reason) = evaluate_offer_price(&base_listing(), &base_rule());
        assert_eq!(reason, "ok");
        assert_eq!(price, Some(dec!(0.80)));
        let cap = quantize2(base_listing().ask_price.unwrap() - base_rule().outbid_step);
        assert_eq!(cap, dec!(0.99));
    }

    #[test]
    fn scenario_2_reject_crafted() {
        let mut listing = base_listing();
        listing.is_crafted = true;
        let (price, reason) = evaluate_offer_price(&listing, &base_rule());
        assert_eq!(price, None);
        assert_eq!(reason, "crafted");
    }

    #[test]
    fn scenario_3_reject_ask_far_from_floor() {
        let mut listing = base_listing();
        listing.ask_price = Some(dec!(2.00));
        listing.floor_price = Some(dec!(1.00));
        let (price, reason) = evaluate_offer_price(&listing, &base_rule());
        assert_eq!(price, None);
        assert_eq!(reason, "ask_far_from_floor");
    }

    #[test]
    fn scenario_4_order_on_collection_floor() {
        let mut rule = base_rule();
        rule.mode = RuleMode::Order;
        rule.offer_factor = dec!(0.5);
        let (price, reason) = evaluate_order_price(Some(dec!(4.50)), &rule);
        assert_eq!(reason, "ok");
        assert_eq!(price, Some(dec!(2.25)));
    }

    #[test]
    fn scenario_5_outbid_bump() {
        let bumped = compute_bump_price(dec!(0.80), Some(dec!(0.85)), dec!(0.01), Some(dec!(0.99)));
        assert_eq!(bumped, Some(dec!(0.86)));
        let capped = compute_bump_price(dec!(0.80), Some(dec!(0.85)), dec!(0.01), Some(dec!(0.85)));
        assert_eq!(capped, None);
    }

    #[test]
    fn scenario_7_reprice_below_floor() {
        let target = compute_reprice_below_floor(Some(dec!(4.80)), dec!(5.00), dec!(0.01), None);
        assert_eq!(target, Some(dec!(4.79)));
    }

    #[test]
    fn order_price_null_on_zero_floor() {
        let (price, _) = evaluate_order_price(Some(Decimal::ZERO), &base_rule());
        assert_eq!(price, None);
        let (price, _) = evaluate_order_price(None, &base_rule());
        assert_eq!(price, None);
    }

    #[test]
    fn liquidity_gate_admits_everything_when_disabled_bounds() {
        let liquidity = LiquiditySettings {
            enabled: true,
            min_recent_sales: 0,
            min_sell_through: Decimal::ZERO,
            max_floor_to_last_sale: None,
        };
        assert!(pass_liquidity(&liquidity, Some(dec!(1.00)), 0, 0, None));
    }

    #[test]
    fn offer_price_is_always_quantized_and_bounded() {
        let rule = base_rule();
        let listing = base_listing();
        let (price, _) = evaluate_offer_price(&listing, &rule);
        let p = price.unwrap();
        assert!(p >= rule.min_offer);
        assert!(p <= listing.ask_price.unwrap() - rule.outbid_step);
        assert_eq!(quantize2(p), p);
    }
}
