//! Recursive masking of sensitive values in dynamic JSON payloads.
//!
//! Masked values appear in response echoes and logs; the real values are
//! still used for the outbound call.

use serde_json::Value;

const SENSITIVE_KEYS: [&str; 6] = [
    "token",
    "authorization",
    "cookie",
    "api_key",
    "apikey",
    "password",
];

fn mask_value(value: &Value) -> Value {
    if value.is_null() {
        return Value::Null;
    }
    let text = match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    let chars: Vec<char> = text.chars().collect();
    if chars.len() <= 4 {
        return Value::String("****".to_string());
    }
    let head: String = chars[..2].iter().collect();
    let tail: String = chars[chars.len() - 2..].iter().collect();
    Value::String(format!("{head}***{tail}"))
}

/// Mask any key whose lower-cased name is sensitive, recursing into nested
/// objects and arrays.
pub fn mask_json(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| {
                    if SENSITIVE_KEYS.contains(&k.to_lowercase().as_str()) {
                        (k.clone(), mask_value(v))
                    } else {
                        (k.clone(), mask_json(v))
                    }
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(mask_json).collect()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn masks_sensitive_keys_case_insensitively() {
        let masked = mask_json(&json!({
            "url": "https://example.com",
            "Token": "supersecretvalue",
            "API_KEY": "abcd",
        }));
        assert_eq!(masked["url"], "https://example.com");
        assert_eq!(masked["Token"], "su***ue");
        assert_eq!(masked["API_KEY"], "****");
    }

    #[test]
    fn masks_nested_objects_and_arrays() {
        let masked = mask_json(&json!({
            "outer": {"password": "longpassword"},
            "list": [{"cookie": "chocolate-chip"}],
        }));
        assert_eq!(masked["outer"]["password"], "lo***rd");
        assert_eq!(masked["list"][0]["cookie"], "ch***ip");
    }

    #[test]
    fn masks_non_string_values_via_repr() {
        let masked = mask_json(&json!({"token": 1234567}));
        assert_eq!(masked["token"], "12***67");
        let masked = mask_json(&json!({"token": null}));
        assert_eq!(masked["token"], Value::Null);
    }
}
