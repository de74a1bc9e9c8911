use serde_json::{Map, Value as Json};

/// Deterministic JSON text: sorted keys, two-space indentation
pub fn json_dumps(value: &Json) -> String {
    let sorted = sort_keys(value);
    // serializing an in-memory Value cannot fail
    serde_json::to_string_pretty(&sorted).unwrap_or_default()
}

/// JSON text followed by a newline, as stored in buffers
pub fn json_buffer(value: &Json) -> Vec<u8> {
    let mut text = json_dumps(value);
    text.push('\n');
    text.into_bytes()
}

fn sort_keys(value: &Json) -> Json {
    match value {
        Json::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut sorted = Map::new();
            for key in keys {
                sorted.insert(key.clone(), sort_keys(&map[key]));
            }
            Json::Object(sorted)
        }
        Json::Array(items) => Json::Array(items.iter().map(sort_keys).collect()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_keys_are_sorted() {
        let value = json!({"b": 1, "a": {"d": [1, 2], "c": null}});
        assert_eq!(
            json_dumps(&value),
            "{\n  \"a\": {\n    \"c\": null,\n    \"d\": [\n      1,\n      2\n    ]\n  },\n  \"b\": 1\n}"
        );
    }

    #[test]
    fn test_scalars() {
        assert_eq!(json_buffer(&json!(2)), b"2\n");
        assert_eq!(json_buffer(&json!("x")), b"\"x\"\n");
        assert_eq!(json_buffer(&json!({})), b"{}\n");
        assert_eq!(json_buffer(&json!([])), b"[]\n");
    }
}
