//! Extracts a monetary cost from a heterogeneous engine response envelope.

use serde_json::Value;

/// Pull a non-negative cost out of a step result envelope.
///
/// Resolution order: `cost` -> `totalCost` -> `total_cost` -> sum of values
/// in a `costs` map -> `0`. String numerics are coerced; negative results
/// are clamped to zero.
pub fn extract_cost(envelope: &Value) -> f64 {
    let obj = match envelope.as_object() {
        Some(obj) => obj,
        None => return 0.0,
    };

    for key in ["cost", "totalCost", "total_cost"] {
        if let Some(v) = obj.get(key) {
            if let Some(n) = coerce_number(v) {
                return n.max(0.0);
            }
        }
    }

    if let Some(costs) = obj.get("costs").and_then(Value::as_object) {
        let sum: f64 = costs.values().filter_map(coerce_number).sum();
        return sum.max(0.0);
    }

    0.0
}

/// Coerce a JSON value to an `f64`, accepting numerics and numeric strings.
fn coerce_number(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn prefers_cost_field() {
        let env = json!({"cost": 0.5, "totalCost": 9.0});
        assert_eq!(extract_cost(&env), 0.5);
    }

    #[test]
    fn falls_back_to_total_cost_camel() {
        let env = json!({"totalCost": 1.25});
        assert_eq!(extract_cost(&env), 1.25);
    }

    #[test]
    fn falls_back_to_total_cost_snake() {
        let env = json!({"total_cost": 2.0});
        assert_eq!(extract_cost(&env), 2.0);
    }

    #[test]
    fn sums_costs_map_when_nothing_else_present() {
        let env = json!({"costs": {"api": 1.0, "compute": 0.5}});
        assert_eq!(extract_cost(&env), 1.5);
    }

    #[test]
    fn defaults_to_zero() {
        let env = json!({"found": 12});
        assert_eq!(extract_cost(&env), 0.0);
    }

    #[test]
    fn coerces_string_numerics() {
        let env = json!({"cost": "0.30"});
        assert_eq!(extract_cost(&env), 0.30);
    }

    #[test]
    fn clamps_negative_to_zero() {
        let env = json!({"cost": -5.0});
        assert_eq!(extract_cost(&env), 0.0);
    }

    #[test]
    fn non_object_envelope_is_zero() {
        assert_eq!(extract_cost(&json!([1, 2, 3])), 0.0);
        assert_eq!(extract_cost(&Value::Null), 0.0);
    }
}
