use std::collections::BTreeMap;

use regex::Regex;

/// Substitutes `$NAME` placeholders in step arguments. Registered pairs are
/// replaced first (longest name first, so `$PACKAGE_DIR` wins over a
/// hypothetical `$PACKAGE`), then process environment variables; an unset
/// environment variable is left untouched.
#[derive(Debug, Clone)]
pub struct ArgumentExpander {
    registered: BTreeMap<String, String>,
    expand_environment: bool,
    env_pattern: Regex,
}

impl Default for ArgumentExpander {
    fn default() -> Self {
        Self::new(true)
    }
}

impl ArgumentExpander {
    pub fn new(expand_environment: bool) -> Self {
        Self {
            registered: BTreeMap::new(),
            expand_environment,
            env_pattern: Regex::new(r"\$\{?([A-Za-z_][A-Za-z0-9_]*)\}?")
                .expect("environment placeholder pattern is valid"),
        }
    }

    /// Register that `$KEY` should expand to `value`.
    pub fn register_expansion(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.registered.insert(key.into(), value.into());
    }

    pub fn expand(&self, argument: &str) -> String {
        let mut out = argument.to_string();

        let mut keys: Vec<&String> = self.registered.keys().collect();
        keys.sort_by_key(|key| std::cmp::Reverse(key.len()));
        for key in keys {
            out = out.replace(&format!("${key}"), &self.registered[key]);
        }

        if self.expand_environment {
            out = self
                .env_pattern
                .replace_all(&out, |caps: &regex::Captures<'_>| {
                    match std::env::var(&caps[1]) {
                        Ok(value) => value,
                        Err(_) => caps[0].to_string(),
                    }
                })
                .into_owned();
        }

        out
    }

    pub fn expand_all(&self, arguments: &[String]) -> Vec<String> {
        arguments.iter().map(|arg| self.expand(arg)).collect()
    }
}
