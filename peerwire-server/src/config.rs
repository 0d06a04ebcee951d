//! Load config from file and environment.

use serde::Deserialize;
use std::path::PathBuf;

/// Server configuration. File: ~/.config/peerwire/config.toml or
/// /etc/peerwire/config.toml.
/// Env overrides: PEERWIRE_LISTEN_ADDR, PEERWIRE_MAX_FRAME_LEN.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// TCP listen address (default 127.0.0.1:0, a random free port).
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Maximum message payload length in bytes (default 16 MiB).
    #[serde(default = "default_max_frame_len")]
    pub max_frame_len: u32,
}

fn default_listen_addr() -> String {
    "127.0.0.1:0".to_string()
}
fn default_max_frame_len() -> u32 {
    peerwire_core::wire::DEFAULT_MAX_FRAME_LEN
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            max_frame_len: default_max_frame_len(),
        }
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_default();
    if let Ok(s) = std::env::var("PEERWIRE_LISTEN_ADDR") {
        if !s.is_empty() {
            c.listen_addr = s;
        }
    }
    if let Ok(s) = std::env::var("PEERWIRE_MAX_FRAME_LEN") {
        if let Ok(n) = s.parse::<u32>() {
            c.max_frame_len = n;
        }
    }
    c
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/peerwire/config.toml"));
    }
    out.push(PathBuf::from("/etc/peerwire/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    for p in config_paths() {
        if p.exists() {
            if let Ok(s) = std::fs::read_to_string(&p) {
                if let Ok(c) = toml::from_str::<Config>(&s) {
                    return Some(c);
                }
            }
            break;
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let c = Config::default();
        assert_eq!(c.listen_addr, "127.0.0.1:0");
        assert_eq!(c.max_frame_len, peerwire_core::wire::DEFAULT_MAX_FRAME_LEN);
    }

    #[test]
    fn toml_overrides_defaults() {
        let c: Config = toml::from_str("listen_addr = \"0.0.0.0:7000\"").unwrap();
        assert_eq!(c.listen_addr, "0.0.0.0:7000");
        assert_eq!(c.max_frame_len, peerwire_core::wire::DEFAULT_MAX_FRAME_LEN);
    }
}
