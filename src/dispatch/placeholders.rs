//! `{key}` substitution in step configs from the settings store.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::{Captures, Regex};
use serde_json::Value;

use crate::error::Result;
use crate::jobs::JsonMap;
use crate::store::Database;

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{([A-Za-z0-9_.\-]+)\}").unwrap());

/// Replace `{key}` in every string of `config` with the setting `key`.
///
/// Unknown keys are left untouched and returned so the caller can log
/// them.
pub async fn resolve_placeholders(
    store: &dyn Database,
    config: &JsonMap,
) -> Result<(JsonMap, Vec<String>)> {
    let mut keys = Vec::new();
    for value in config.values() {
        collect_keys(value, &mut keys);
    }
    keys.sort();
    keys.dedup();

    let mut found = HashMap::new();
    let mut missing = Vec::new();
    for key in keys {
        match store.get_setting(&key).await? {
            Some(value) => {
                found.insert(key, value);
            }
            None => missing.push(key),
        }
    }

    let resolved = config
        .iter()
        .map(|(k, v)| (k.clone(), substitute(v, &found)))
        .collect();
    Ok((resolved, missing))
}

fn collect_keys(value: &Value, keys: &mut Vec<String>) {
    match value {
        Value::String(s) => keys.extend(
            PLACEHOLDER
                .captures_iter(s)
                .map(|caps| caps[1].to_string()),
        ),
        Value::Array(items) => items.iter().for_each(|v| collect_keys(v, keys)),
        Value::Object(map) => map.values().for_each(|v| collect_keys(v, keys)),
        _ => {}
    }
}

fn substitute(value: &Value, found: &HashMap<String, String>) -> Value {
    match value {
        Value::String(s) => {
            let replaced = PLACEHOLDER.replace_all(s, |caps: &Captures<'_>| {
                found
                    .get(&caps[1])
                    .cloned()
                    .unwrap_or_else(|| caps[0].to_string())
            });
            Value::String(replaced.into_owned())
        }
        Value::Array(items) => Value::Array(items.iter().map(|v| substitute(v, found)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), substitute(v, found)))
                .collect(),
        ),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn substitutes_nested_strings_and_reports_missing() {
        let store = MemoryStore::new();
        store.set_setting("api.base", "https://news.example").await.unwrap();
        store.set_setting("region", "eu").await.unwrap();

        let config = json!({
            "url": "{api.base}/feed?region={region}",
            "extra": ["{region}", 3, {"token": "{secret_token}"}],
            "depth": 2
        });
        let (resolved, missing) =
            resolve_placeholders(&store, config.as_object().unwrap()).await.unwrap();

        assert_eq!(resolved["url"], json!("https://news.example/feed?region=eu"));
        assert_eq!(resolved["extra"], json!(["eu", 3, {"token": "{secret_token}"}]));
        assert_eq!(resolved["depth"], json!(2));
        assert_eq!(missing, vec!["secret_token".to_string()]);
    }

    #[tokio::test]
    async fn config_without_placeholders_is_unchanged() {
        let store = MemoryStore::new();
        let config = json!({"query": "rust", "limit": 10});
        let (resolved, missing) =
            resolve_placeholders(&store, config.as_object().unwrap()).await.unwrap();
        assert_eq!(Value::Object(resolved), config);
        assert!(missing.is_empty());
    }
}
