use std::{path::Path, sync::OnceLock};

use anyhow::{Context, bail};
use regex::Regex;
use serde::Deserialize;
use toml::Value;

use crate::Config;

pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read configuration from {}", path.display()))?;

    let mut raw_config: Value = toml::from_str(&content)?;
    expand_env_strings(&mut Vec::new(), &mut raw_config)?;

    let config = Config::deserialize(raw_config)?;
    validate(&config)?;

    Ok(config)
}

fn env_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\{\{\s*env\.([A-Za-z_][A-Za-z0-9_]*)\s*\}\}").unwrap())
}

/// Walks the raw TOML tree and substitutes `{{ env.VAR }}` placeholders in
/// string values. Missing variables are an error naming the config path.
fn expand_env_strings(path: &mut Vec<String>, value: &mut Value) -> anyhow::Result<()> {
    match value {
        Value::String(s) => {
            if !s.contains("{{") {
                return Ok(());
            }

            let mut expanded = String::with_capacity(s.len());
            let mut last = 0;

            for capture in env_pattern().captures_iter(s) {
                let whole = capture.get(0).unwrap();
                let name = &capture[1];

                let var = std::env::var(name).with_context(|| {
                    format!("environment variable '{name}' referenced at {} is not set", path.join("."))
                })?;

                expanded.push_str(&s[last..whole.start()]);
                expanded.push_str(&var);
                last = whole.end();
            }

            expanded.push_str(&s[last..]);
            *s = expanded;
        }
        Value::Table(table) => {
            for (key, entry) in table.iter_mut() {
                path.push(key.clone());
                expand_env_strings(path, entry)?;
                path.pop();
            }
        }
        Value::Array(entries) => {
            for (i, entry) in entries.iter_mut().enumerate() {
                path.push(i.to_string());
                expand_env_strings(path, entry)?;
                path.pop();
            }
        }
        _ => {}
    }

    Ok(())
}

fn validate(config: &Config) -> anyhow::Result<()> {
    for (name, provider) in &config.providers {
        if name.is_empty() {
            bail!("provider names must not be empty");
        }

        if let Some(base_url) = &provider.base_url
            && !base_url.starts_with("http://")
            && !base_url.starts_with("https://")
        {
            bail!("provider '{name}' has a base_url that is not an http(s) URL");
        }
    }

    if config.turn.max_tool_iterations == 0 {
        bail!("turn.max_tool_iterations must be at least 1");
    }

    Ok(())
}
