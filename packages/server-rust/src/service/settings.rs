//! Settings lookup: a typed value by name, or the caller's default.

use std::collections::HashMap;
use std::str::FromStr;

use tracing::warn;

/// Prefix of environment variables read by [`EnvSettings`].
pub const ENV_PREFIX: &str = "MESHBUS_";

/// Source of named settings.
///
/// Implementors only provide the raw lookup; typed access with defaults is
/// layered on top.
pub trait SettingsProvider: Send + Sync {
    /// Raw value of `name`, if set.
    fn lookup(&self, name: &str) -> Option<String>;

    fn get_string(&self, name: &str, default: &str) -> String {
        self.lookup(name).unwrap_or_else(|| default.to_string())
    }

    fn get_u64(&self, name: &str, default: u64) -> u64 {
        parse_or(name, self.lookup(name), default)
    }

    fn get_usize(&self, name: &str, default: usize) -> usize {
        parse_or(name, self.lookup(name), default)
    }

    fn get_bool(&self, name: &str, default: bool) -> bool {
        parse_or(name, self.lookup(name), default)
    }
}

impl dyn SettingsProvider + '_ {
    /// Typed lookup of `name`, falling back to `default` when the setting is
    /// missing or does not parse.
    pub fn get_setting<T: FromStr>(&self, name: &str, default: T) -> T {
        parse_or(name, self.lookup(name), default)
    }
}

fn parse_or<T: FromStr>(name: &str, raw: Option<String>, default: T) -> T {
    match raw {
        None => default,
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!(target: "meshbus::esb", setting = name, value = %raw, "unparsable setting, using default");
            default
        }),
    }
}

// ---------------------------------------------------------------------------
// Providers
// ---------------------------------------------------------------------------

/// Provider with no settings: every lookup yields the default.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSettings;

impl SettingsProvider for NoopSettings {
    fn lookup(&self, _name: &str) -> Option<String> {
        None
    }
}

/// Reads `MESHBUS_<NAME>` from the process environment, where `<NAME>` is the
/// setting name in upper snake case (`serviceCallCapacity` ->
/// `MESHBUS_SERVICE_CALL_CAPACITY`).
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvSettings;

impl EnvSettings {
    #[must_use]
    pub fn variable_name(name: &str) -> String {
        let mut out = String::with_capacity(ENV_PREFIX.len() + name.len() + 4);
        out.push_str(ENV_PREFIX);
        let mut prev_lower = false;
        for ch in name.chars() {
            if ch == '-' || ch == '.' || ch == ' ' {
                out.push('_');
                prev_lower = false;
                continue;
            }
            if ch.is_ascii_uppercase() && prev_lower {
                out.push('_');
            }
            prev_lower = ch.is_ascii_lowercase() || ch.is_ascii_digit();
            out.push(ch.to_ascii_uppercase());
        }
        out
    }
}

impl SettingsProvider for EnvSettings {
    fn lookup(&self, name: &str) -> Option<String> {
        std::env::var(Self::variable_name(name)).ok()
    }
}

/// Fixed in-memory settings, for embedding and tests.
#[derive(Debug, Clone, Default)]
pub struct StaticSettings {
    values: HashMap<String, String>,
}

impl StaticSettings {
    pub fn new<K, V, I>(entries: I) -> Self
    where
        K: Into<String>,
        V: Into<String>,
        I: IntoIterator<Item = (K, V)>,
    {
        Self {
            values: entries
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

impl SettingsProvider for StaticSettings {
    fn lookup(&self, name: &str) -> Option<String> {
        self.values.get(name).cloned()
    }
}
