//! Loading [`DatamanConfig`] from the environment and installing the
//! process-wide tracing subscriber.

use std::{
    env, fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, anyhow};
use dataman_core::config::DatamanConfig;
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Path to a TOML or JSON configuration file.
pub const CONFIG_PATH_ENV: &str = "DATAMAN_CONFIG_PATH";
/// Inline JSON configuration.
pub const CONFIG_JSON_ENV: &str = "DATAMAN_CONFIG_JSON";

const DEFAULT_FILES: &[&str] = &["dataman.toml", "dataman.json"];

/// Where the active configuration came from.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConfigSource {
    #[default]
    Default,
    EnvPath(PathBuf),
    EnvInline,
    File(PathBuf),
}

/// Loads the configuration using the process environment.
///
/// Evaluation order:
/// 1) `$DATAMAN_CONFIG_PATH` (TOML or JSON file),
/// 2) `$DATAMAN_CONFIG_JSON` (inline JSON),
/// 3) `dataman.toml` or `dataman.json` in the working directory,
/// 4) defaults.
///
/// The result is validated before it is returned.
pub fn load_from_env() -> anyhow::Result<(DatamanConfig, ConfigSource)> {
    let cwd = env::current_dir().context("failed to resolve working directory")?;
    load_with(|name| env::var(name).ok(), &cwd)
}

/// [`load_from_env`] with an explicit variable lookup and base directory.
pub fn load_with(
    lookup: impl Fn(&str) -> Option<String>,
    base: &Path,
) -> anyhow::Result<(DatamanConfig, ConfigSource)> {
    let (config, source) = resolve(lookup, base)?;
    config
        .validate()
        .with_context(|| format!("invalid dataman config from {source:?}"))?;
    info!(source = ?source, "dataman configuration loaded");
    Ok((config, source))
}

fn resolve(
    lookup: impl Fn(&str) -> Option<String>,
    base: &Path,
) -> anyhow::Result<(DatamanConfig, ConfigSource)> {
    if let Some(path_str) = lookup(CONFIG_PATH_ENV)
        && !path_str.trim().is_empty()
    {
        let path = PathBuf::from(path_str);
        let config = load_from_file(&path)?;
        return Ok((config, ConfigSource::EnvPath(path)));
    }

    if let Some(raw) = lookup(CONFIG_JSON_ENV)
        && !raw.trim().is_empty()
    {
        let parsed = parse_json(&raw)
            .with_context(|| format!("failed to parse {CONFIG_JSON_ENV}"))?;
        return Ok((parsed, ConfigSource::EnvInline));
    }

    if let Some(path) = find_default_file(base) {
        let config = load_from_file(&path)?;
        return Ok((config, ConfigSource::File(path)));
    }

    Ok((DatamanConfig::default(), ConfigSource::Default))
}

pub fn load_from_file(path: &Path) -> anyhow::Result<DatamanConfig> {
    let contents = fs::read_to_string(path).with_context(|| {
        format!("failed to read dataman config from {}", path.display())
    })?;

    match path.extension().and_then(|ext| ext.to_str()) {
        Some("json") => parse_json(&contents).with_context(|| {
            format!("invalid dataman config {}", path.display())
        }),
        Some("toml") => toml::from_str(&contents).map_err(|err| {
            anyhow!("invalid dataman config {}: {}", path.display(), err)
        }),
        _ => parse_from_str(&contents, &path.display().to_string()),
    }
}

/// Parses `contents` as TOML, falling back to JSON.
pub fn parse_from_str(
    contents: &str,
    origin: &str,
) -> anyhow::Result<DatamanConfig> {
    toml::from_str(contents).or_else(|toml_err| {
        serde_json::from_str(contents).map_err(|json_err| {
            anyhow!(
                "failed to parse dataman config {}: toml error: {}; json error: {}",
                origin,
                toml_err,
                json_err
            )
        })
    })
}

pub fn parse_json(raw: &str) -> anyhow::Result<DatamanConfig> {
    serde_json::from_str(raw)
        .map_err(|err| anyhow!("invalid dataman config json: {err}"))
}

fn find_default_file(base: &Path) -> Option<PathBuf> {
    DEFAULT_FILES
        .iter()
        .map(|name| base.join(name))
        .find(|path| path.exists())
}

/// Installs a fmt subscriber filtered by `RUST_LOG`, or by
/// `default_filter` when the variable is unset or invalid.
pub fn init_tracing(default_filter: &str) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .with_context(|| format!("invalid log filter {default_filter:?}"))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .context("a global tracing subscriber is already installed")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> + use<> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name: &str| map.get(name).cloned()
    }

    #[test]
    fn defaults_when_nothing_is_configured() {
        let dir = tempdir().expect("tempdir");
        let (config, source) = load_with(vars(&[]), dir.path()).expect("load");
        assert_eq!(source, ConfigSource::Default);
        assert_eq!(config, DatamanConfig::default());
    }

    #[test]
    fn env_path_wins_over_inline_json_and_default_file() {
        let dir = tempdir().expect("tempdir");
        let explicit = dir.path().join("explicit.toml");
        fs::write(&explicit, "[cache]\ncapacity = 7\n").expect("write");
        fs::write(dir.path().join("dataman.toml"), "[cache]\ncapacity = 9\n")
            .expect("write default");

        let explicit_str = explicit.display().to_string();
        let lookup = vars(&[
            (CONFIG_PATH_ENV, explicit_str.as_str()),
            (CONFIG_JSON_ENV, r#"{"cache":{"capacity":3}}"#),
        ]);
        let (config, source) = load_with(lookup, dir.path()).expect("load");
        assert_eq!(source, ConfigSource::EnvPath(explicit));
        assert_eq!(config.cache.capacity, 7);
    }

    #[test]
    fn inline_json_wins_over_default_file() {
        let dir = tempdir().expect("tempdir");
        fs::write(dir.path().join("dataman.toml"), "[cache]\ncapacity = 9\n")
            .expect("write default");

        let lookup = vars(&[(
            CONFIG_JSON_ENV,
            r#"{"executor":{"workers":3},"cache":{"lookahead":2}}"#,
        )]);
        let (config, source) = load_with(lookup, dir.path()).expect("load");
        assert_eq!(source, ConfigSource::EnvInline);
        assert_eq!(config.executor.workers, 3);
        assert_eq!(config.cache.lookahead, 2);
        assert_eq!(config.cache.capacity, 1000);
    }

    #[test]
    fn default_file_is_found_in_base_directory() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("dataman.toml");
        fs::write(
            &path,
            "[cache]\ngrace_period_ms = 1000\nextensions = [\"fits\"]\n\n[watermark]\npath = \"state/watermark.json\"\n",
        )
        .expect("write");

        let (config, source) = load_with(vars(&[]), dir.path()).expect("load");
        assert_eq!(source, ConfigSource::File(path));
        assert_eq!(config.cache.grace_period_ms, 1000);
        assert_eq!(config.cache.extensions, vec!["fits".to_string()]);
        assert_eq!(
            config.watermark.path,
            Some(PathBuf::from("state/watermark.json"))
        );
    }

    #[test]
    fn blank_variables_are_ignored() {
        let dir = tempdir().expect("tempdir");
        let lookup = vars(&[(CONFIG_PATH_ENV, "  "), (CONFIG_JSON_ENV, "")]);
        let (_, source) = load_with(lookup, dir.path()).expect("load");
        assert_eq!(source, ConfigSource::Default);
    }

    #[test]
    fn invalid_values_are_rejected() {
        let dir = tempdir().expect("tempdir");
        let lookup = vars(&[(CONFIG_JSON_ENV, r#"{"cache":{"capacity":0}}"#)]);
        let err = load_with(lookup, dir.path()).expect_err("zero capacity");
        assert!(format!("{err:#}").contains("capacity"));
    }

    #[test]
    fn unknown_extension_tries_toml_then_json() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("dataman.conf");
        fs::write(&path, r#"{"cache":{"capacity":12}}"#).expect("write");
        let config = load_from_file(&path).expect("json fallback");
        assert_eq!(config.cache.capacity, 12);

        fs::write(&path, "not = [valid").expect("write");
        assert!(load_from_file(&path).is_err());
    }
}
