//! Migration of older play records to the current schema.
//!
//! Runs on the raw JSON value before typed deserialization, so the schema
//! module never has to know about historical shapes. Returns the list of
//! rewrites applied so the store can log them.

use serde_json::{json, Map, Value};

/// Upgrade `record` in place. Unknown keys are left untouched; they ride
/// along in the play's `extra` map.
pub fn migrate(record: &mut Value) -> Vec<String> {
    let mut applied = Vec::new();
    let Some(obj) = record.as_object_mut() else {
        return applied;
    };

    // Records written before SHORT support carry no position_side.
    if !obj.contains_key("position_side") {
        obj.insert("position_side".into(), json!("LONG"));
        applied.push("defaulted position_side to LONG".into());
    }

    // Early records stored take_profit / stop_loss as bare premium numbers.
    if let Some(tp) = obj.get("take_profit") {
        if let Some(premium) = tp.as_f64() {
            obj.insert(
                "take_profit".into(),
                json!({ "mode": "Single", "premium": premium }),
            );
            applied.push("lifted scalar take_profit into spec".into());
        }
    }
    if let Some(sl) = obj.get("stop_loss") {
        if let Some(premium) = sl.as_f64() {
            obj.insert(
                "stop_loss".into(),
                json!({ "mode": "STOP", "premium": premium }),
            );
            applied.push("lifted scalar stop_loss into spec".into());
        }
    }

    // A transitional shape kept TP/SL premiums at the top level.
    lift_top_level_premium(obj, "tp_price", "take_profit", &mut applied);
    lift_top_level_premium(obj, "sl_price", "stop_loss", &mut applied);

    // Trailing was once a top-level flag; absence means disabled, which the
    // current schema expresses by omitting the trailing block entirely.
    if obj.remove("trailing_enabled") == Some(json!(false)) {
        applied.push("dropped legacy trailing_enabled=false flag".into());
    }

    applied
}

fn lift_top_level_premium(
    obj: &mut Map<String, Value>,
    legacy_key: &str,
    spec_key: &str,
    applied: &mut Vec<String>,
) {
    let Some(premium) = obj.get(legacy_key).and_then(Value::as_f64) else {
        return;
    };
    obj.remove(legacy_key);
    let spec = obj
        .entry(spec_key.to_string())
        .or_insert_with(|| json!({}));
    if let Some(spec_obj) = spec.as_object_mut() {
        if !spec_obj.contains_key("premium") {
            spec_obj.insert("premium".into(), json!(premium));
            applied.push(format!("moved {legacy_key} into {spec_key}.premium"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_record() -> Value {
        json!({
            "id": "p1",
            "name": "legacy",
            "strategy_tag": "swings",
            "created_at": "2024-03-01T14:30:00Z",
            "state": "NEW",
            "instrument": {
                "symbol": "SPY",
                "occ_symbol": "SPY   250620C00500000",
                "side": "CALL",
                "strike": 500.0,
                "expiration": "2025-06-20"
            },
            "order_action": "BTO",
            "contracts": 1,
            "entry": { "target_stock_price": 500.0, "buffer": 0.5 }
        })
    }

    #[test]
    fn missing_position_side_defaults_long() {
        let mut record = minimal_record();
        let applied = migrate(&mut record);
        assert_eq!(record["position_side"], json!("LONG"));
        assert!(applied.iter().any(|a| a.contains("position_side")));

        let play: crate::play::Play = serde_json::from_value(record).unwrap();
        assert_eq!(play.position_side, crate::play::PositionSide::Long);
    }

    #[test]
    fn existing_position_side_untouched() {
        let mut record = minimal_record();
        record["position_side"] = json!("SHORT");
        record["order_action"] = json!("STO");
        let applied = migrate(&mut record);
        assert_eq!(record["position_side"], json!("SHORT"));
        assert!(applied.is_empty());
    }

    #[test]
    fn scalar_take_profit_lifted() {
        let mut record = minimal_record();
        record["take_profit"] = json!(3.0);
        migrate(&mut record);
        assert_eq!(record["take_profit"]["premium"], json!(3.0));
        assert_eq!(record["take_profit"]["mode"], json!("Single"));
        assert!(serde_json::from_value::<crate::play::Play>(record).is_ok());
    }

    #[test]
    fn top_level_tp_sl_prices_moved() {
        let mut record = minimal_record();
        record["tp_price"] = json!(3.0);
        record["sl_price"] = json!(1.0);
        migrate(&mut record);
        assert!(record.get("tp_price").is_none());
        assert!(record.get("sl_price").is_none());
        assert_eq!(record["take_profit"]["premium"], json!(3.0));
        assert_eq!(record["stop_loss"]["premium"], json!(1.0));
    }

    #[test]
    fn missing_trailing_block_means_disabled() {
        let mut record = minimal_record();
        migrate(&mut record);
        let play: crate::play::Play = serde_json::from_value(record).unwrap();
        assert!(play.take_profit.trailing.is_none());
        assert!(play.stop_loss.trailing.is_none());
    }

    #[test]
    fn migrated_record_validates() {
        let mut record = minimal_record();
        record["take_profit"] = json!(3.0);
        migrate(&mut record);
        let play: crate::play::Play = serde_json::from_value(record).unwrap();
        play.validate_record().unwrap();
    }
}
