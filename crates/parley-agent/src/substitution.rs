//! `${NAME}` substitution in tool-server configs. Variables come from the
//! merged map of user secrets and process environment; lookup is
//! case-insensitive. A value with an unresolved placeholder drops its
//! entire containing key from the resolved config.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([A-Za-z0-9_]+)\}").expect("valid placeholder regex"));

/// Merge user secrets over the process environment.
pub fn merged_vars(secrets: &HashMap<String, String>) -> HashMap<String, String> {
    let mut vars: HashMap<String, String> = std::env::vars().collect();
    vars.extend(secrets.iter().map(|(k, v)| (k.clone(), v.clone())));
    vars
}

pub fn resolve_config(
    config: &HashMap<String, serde_json::Value>,
    vars: &HashMap<String, String>,
) -> HashMap<String, serde_json::Value> {
    let lowered: HashMap<String, &String> =
        vars.iter().map(|(k, v)| (k.to_lowercase(), v)).collect();

    config
        .iter()
        .filter_map(|(key, value)| {
            let mut unresolved = false;
            let resolved = resolve_value(value, &lowered, &mut unresolved);
            if unresolved {
                tracing::debug!("dropping config key {key}: unresolved placeholder");
                None
            } else {
                Some((key.clone(), resolved))
            }
        })
        .collect()
}

fn resolve_value(
    value: &serde_json::Value,
    vars: &HashMap<String, &String>,
    unresolved: &mut bool,
) -> serde_json::Value {
    match value {
        serde_json::Value::String(s) => {
            let replaced = PLACEHOLDER.replace_all(s, |caps: &regex::Captures| {
                match vars.get(&caps[1].to_lowercase()) {
                    Some(v) => (*v).clone(),
                    None => {
                        *unresolved = true;
                        caps[0].to_string()
                    }
                }
            });
            serde_json::Value::String(replaced.into_owned())
        }
        serde_json::Value::Array(items) => serde_json::Value::Array(
            items
                .iter()
                .map(|item| resolve_value(item, vars, unresolved))
                .collect(),
        ),
        serde_json::Value::Object(map) => serde_json::Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), resolve_value(v, vars, unresolved)))
                .collect(),
        ),
        other => other.clone(),
    }
}
