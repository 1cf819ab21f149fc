//! File configuration for the `dlcache` binary.
//!
//! Reads an optional `config.toml` holding a small `key = value` subset of
//! TOML. Command-line flags override any value set here.

use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};

const APP_DIR: &str = "dlcache";
const CONFIG_FILE: &str = "config.toml";

/// Values read from the config file. Unset keys stay `None`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileConfig {
    /// Enables the on-disk cache.
    pub cache: Option<bool>,
    /// Serve a possibly stale cached file when a refresh fails.
    pub continue_on_error: Option<bool>,
    /// Cache directory used instead of the per-URL default.
    pub cache_dir: Option<PathBuf>,
    /// TCP connect timeout, seconds.
    pub connect_timeout_secs: Option<u64>,
    /// Whole-request timeout, seconds.
    pub read_timeout_secs: Option<u64>,
}

impl FileConfig {
    fn validate(&self) -> Result<()> {
        for (field, value) in [
            ("connect_timeout_secs", self.connect_timeout_secs),
            ("read_timeout_secs", self.read_timeout_secs),
        ] {
            if let Some(value) = value
                && !(1..=3600).contains(&value)
            {
                bail!("Invalid config value for `{field}`: {value}. Expected range: 1..=3600");
            }
        }
        if let Some(dir) = &self.cache_dir
            && dir.as_os_str().is_empty()
        {
            bail!("Invalid config value for `cache_dir`: must not be empty");
        }
        Ok(())
    }
}

/// A config plus where it came from.
#[derive(Debug, Clone, Default)]
pub struct LoadedConfig {
    pub path: Option<PathBuf>,
    pub config: FileConfig,
    pub loaded_from_file: bool,
}

/// Loads the config from the default location. A missing file is not an error.
pub fn load_default_file_config() -> Result<LoadedConfig> {
    let Some(path) = resolve_default_config_path() else {
        return Ok(LoadedConfig::default());
    };
    if !path.is_file() {
        return Ok(LoadedConfig {
            path: Some(path),
            ..LoadedConfig::default()
        });
    }
    let config = load_file_config(&path)?;
    Ok(LoadedConfig {
        path: Some(path),
        config,
        loaded_from_file: true,
    })
}

/// `$XDG_CONFIG_HOME/dlcache/config.toml`, else `$HOME/.config/dlcache/config.toml`.
fn resolve_default_config_path() -> Option<PathBuf> {
    if let Some(xdg) = env_var_non_empty_os("XDG_CONFIG_HOME") {
        return Some(PathBuf::from(xdg).join(APP_DIR).join(CONFIG_FILE));
    }
    env_var_non_empty_os("HOME").map(|home| {
        PathBuf::from(home)
            .join(".config")
            .join(APP_DIR)
            .join(CONFIG_FILE)
    })
}

pub(crate) fn env_var_non_empty_os(key: &str) -> Option<OsString> {
    std::env::var_os(key).filter(|value| !value.is_empty())
}

fn load_file_config(path: &Path) -> Result<FileConfig> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file '{}'", path.display()))?;
    parse_config_str(&raw)
        .with_context(|| format!("Failed to parse config file '{}'", path.display()))
}

fn parse_config_str(raw: &str) -> Result<FileConfig> {
    let mut cfg = FileConfig::default();
    for (line_index, raw_line) in raw.lines().enumerate() {
        let line_no = line_index + 1;
        let line = strip_inline_comment(raw_line).trim();
        if line.is_empty() {
            continue;
        }

        let Some((raw_key, raw_value)) = line.split_once('=') else {
            bail!("Invalid config syntax on line {line_no}: expected key = value");
        };
        let key = raw_key.trim();
        let value = raw_value.trim();

        match key {
            "cache" => {
                cfg.cache = Some(
                    parse_boolean(value)
                        .with_context(|| format!("Invalid `cache` value on line {line_no}"))?,
                );
            }
            "continue_on_error" => {
                cfg.continue_on_error = Some(parse_boolean(value).with_context(|| {
                    format!("Invalid `continue_on_error` value on line {line_no}")
                })?);
            }
            "cache_dir" => {
                let parsed = parse_string_literal(value)
                    .with_context(|| format!("Invalid `cache_dir` value on line {line_no}"))?;
                cfg.cache_dir = Some(PathBuf::from(parsed));
            }
            "connect_timeout_secs" => {
                cfg.connect_timeout_secs = Some(parse_integer_u64(value).with_context(|| {
                    format!("Invalid `connect_timeout_secs` value on line {line_no}")
                })?);
            }
            "read_timeout_secs" => {
                cfg.read_timeout_secs = Some(parse_integer_u64(value).with_context(|| {
                    format!("Invalid `read_timeout_secs` value on line {line_no}")
                })?);
            }
            unknown => {
                bail!("Unknown configuration key: '{unknown}' on line {line_no}");
            }
        }
    }
    cfg.validate()?;
    Ok(cfg)
}

fn strip_inline_comment(line: &str) -> &str {
    let mut in_string = false;
    for (index, ch) in line.char_indices() {
        match ch {
            '"' => in_string = !in_string,
            '#' if !in_string => return &line[..index],
            _ => {}
        }
    }
    line
}

fn parse_string_literal(raw_value: &str) -> Result<String> {
    let Some(inner) = raw_value
        .strip_prefix('"')
        .and_then(|rest| rest.strip_suffix('"'))
    else {
        bail!("Expected double-quoted string");
    };
    Ok(inner.to_string())
}

fn parse_integer_u64(raw_value: &str) -> Result<u64> {
    let token = raw_value.trim();
    if token.is_empty() {
        bail!("Expected integer value");
    }
    if token.starts_with('-') {
        bail!("Expected non-negative integer");
    }
    Ok(token.parse::<u64>()?)
}

fn parse_boolean(raw_value: &str) -> Result<bool> {
    match raw_value.trim() {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => bail!("Expected 'true' or 'false'"),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config_all_fields() {
        let cfg = parse_config_str(
            r#"
            # dlcache settings
            cache = true
            continue_on_error = false   # fail hard
            cache_dir = "/var/cache/dl#1"
            connect_timeout_secs = 10
            read_timeout_secs = 600
            "#,
        )
        .unwrap();
        assert_eq!(cfg.cache, Some(true));
        assert_eq!(cfg.continue_on_error, Some(false));
        assert_eq!(cfg.cache_dir, Some(PathBuf::from("/var/cache/dl#1")));
        assert_eq!(cfg.connect_timeout_secs, Some(10));
        assert_eq!(cfg.read_timeout_secs, Some(600));
    }

    #[test]
    fn test_parse_config_partial_fields_leaves_rest_unset() {
        let cfg = parse_config_str("cache = false\n").unwrap();
        assert_eq!(cfg.cache, Some(false));
        assert_eq!(cfg.continue_on_error, None);
        assert_eq!(cfg.cache_dir, None);
    }

    #[test]
    fn test_parse_config_empty_is_default() {
        assert_eq!(parse_config_str("").unwrap(), FileConfig::default());
        assert_eq!(parse_config_str("# only a comment\n\n").unwrap(), FileConfig::default());
    }

    #[test]
    fn test_parse_config_unknown_key_reports_line() {
        let err = parse_config_str("cache = true\nconcurrency = 4\n").unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("concurrency"), "got: {msg}");
        assert!(msg.contains("line 2"), "got: {msg}");
    }

    #[test]
    fn test_parse_config_missing_equals_is_syntax_error() {
        let err = parse_config_str("cache true\n").unwrap_err();
        assert!(err.to_string().contains("line 1"));
    }

    #[test]
    fn test_parse_config_bad_boolean() {
        let err = parse_config_str("cache = yes\n").unwrap_err();
        assert!(format!("{err:#}").contains("Expected 'true' or 'false'"));
    }

    #[test]
    fn test_parse_config_unquoted_cache_dir_rejected() {
        assert!(parse_config_str("cache_dir = /tmp/x\n").is_err());
    }

    #[test]
    fn test_parse_config_timeout_out_of_range() {
        let err = parse_config_str("read_timeout_secs = 0\n").unwrap_err();
        assert!(err.to_string().contains("1..=3600"), "got: {err}");
        assert!(parse_config_str("connect_timeout_secs = 3601\n").is_err());
        assert!(parse_config_str("connect_timeout_secs = -1\n").is_err());
    }

    #[test]
    fn test_load_file_config_reads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        fs::write(&path, "continue_on_error = true\n").unwrap();
        let cfg = load_file_config(&path).unwrap();
        assert_eq!(cfg.continue_on_error, Some(true));
    }

    #[test]
    fn test_load_file_config_error_names_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        fs::write(&path, "bogus = 1\n").unwrap();
        let err = load_file_config(&path).unwrap_err();
        assert!(err.to_string().contains(CONFIG_FILE), "got: {err}");
    }
}
