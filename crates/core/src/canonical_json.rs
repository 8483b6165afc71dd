use serde_json::Value;

/// Serializes a JSON value with sorted object keys and no insignificant
/// whitespace, so equal documents always produce identical bytes.
pub fn to_canonical_string(value: &Value) -> String {
    let mut out = String::new();
    write_value(value, &mut out);
    out
}

fn write_value(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|(left, _), (right, _)| left.cmp(right));
            out.push('{');
            for (idx, (key, item)) in entries.into_iter().enumerate() {
                if idx > 0 {
                    out.push(',');
                }
                write_scalar(&Value::String(key.clone()), out);
                out.push(':');
                write_value(item, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (idx, item) in items.iter().enumerate() {
                if idx > 0 {
                    out.push(',');
                }
                write_value(item, out);
            }
            out.push(']');
        }
        scalar => write_scalar(scalar, out),
    }
}

fn write_scalar(value: &Value, out: &mut String) {
    // serde_json's compact output already escapes strings and formats numbers.
    out.push_str(&value.to_string());
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sorts_keys_at_every_depth() {
        let value = json!({
            "b": 1,
            "a": {"z": true, "m": [ {"y": null, "x": "s"} ]},
        });
        assert_eq!(
            to_canonical_string(&value),
            r#"{"a":{"m":[{"x":"s","y":null}],"z":true},"b":1}"#
        );
    }

    #[test]
    fn key_order_in_source_does_not_matter() {
        let first: Value = serde_json::from_str(r#"{"amount":"10","uuid":"u-1"}"#).unwrap();
        let second: Value = serde_json::from_str(r#"{ "uuid" : "u-1", "amount" : "10" }"#).unwrap();
        assert_eq!(to_canonical_string(&first), to_canonical_string(&second));
    }

    #[test]
    fn escapes_strings() {
        let value = json!({"note": "line\n\"quoted\""});
        assert_eq!(to_canonical_string(&value), r#"{"note":"line\n\"quoted\""}"#);
    }
}
