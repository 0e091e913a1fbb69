//! Configuration for the engine.
//!
//! Values come from an optional TOML settings file, overridden by
//! `FLUXWARDEN_*` environment variables. Invalid values never stop the
//! engine: they are corrected or dropped and the correction is recorded in
//! [`Config::adjustments`] so it can be reported once after logging starts.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use fluxwarden_sealing::SealingMode;
use serde::Deserialize;
use tracing::{info, warn};

use crate::logging::Subsystem;

/// Lowest automation interval the scheduler will run with.
pub const MIN_AUTOMATION_INTERVAL: Duration = Duration::from_secs(60);

/// Default timeout for every network call.
pub const DEFAULT_NETWORK_TIMEOUT: Duration = Duration::from_secs(10);

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Hosts to scan, in order (host order determines `IPnn` labels).
    pub scan_hosts: Vec<String>,

    /// Disallowed workload name fragments.
    pub target_prefixes: Vec<String>,

    /// Interval between automation cycles (never below the floor).
    pub automation_interval: Duration,

    /// Verbose logging including raw control-plane payloads.
    pub debug: bool,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Discovery probe timeout.
    pub probe_timeout: Duration,

    /// Timeout for list/remove calls.
    pub request_timeout: Duration,

    /// Credential sealing mode.
    pub sealing_mode: SealingMode,

    /// Base64 AES-256 key for sealing; a per-process key is used when absent.
    pub sealing_key: Option<String>,

    /// Corrections applied while loading.
    pub adjustments: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            scan_hosts: Vec::new(),
            target_prefixes: Vec::new(),
            automation_interval: MIN_AUTOMATION_INTERVAL,
            debug: false,
            log_level: "info".to_string(),
            probe_timeout: DEFAULT_NETWORK_TIMEOUT,
            request_timeout: DEFAULT_NETWORK_TIMEOUT,
            sealing_mode: SealingMode::Auto,
            sealing_key: None,
            adjustments: Vec::new(),
        }
    }
}

/// On-disk settings file.
///
/// ```toml
/// [general]
/// scan_hosts = ["10.0.0.5", "10.0.0.6"]
/// target_app_prefixes = ["foo", "bar"]
/// automation_interval_seconds = 90
/// debug = false
/// ```
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct SettingsFile {
    pub general: GeneralSettings,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct GeneralSettings {
    pub scan_hosts: Option<Vec<String>>,
    pub target_app_prefixes: Option<Vec<String>>,
    pub automation_interval_seconds: Option<i64>,
    pub debug: Option<bool>,
    pub log_level: Option<String>,
    pub probe_timeout_seconds: Option<u64>,
    pub request_timeout_seconds: Option<u64>,
    pub sealing: Option<String>,
}

impl SettingsFile {
    /// Parse settings from TOML text.
    pub fn parse(contents: &str) -> Result<Self> {
        toml::from_str(contents).context("invalid settings TOML")
    }

    /// Read and parse a settings file.
    pub fn read(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings from {}", path.display()))?;
        Self::parse(&contents).with_context(|| format!("Failed to parse {}", path.display()))
    }
}

impl Config {
    /// Load configuration from an optional settings file and the process
    /// environment.
    pub fn load(settings_path: Option<&Path>) -> Result<Self> {
        let file = settings_path.map(SettingsFile::read).transpose()?;
        Ok(Self::from_sources(file, |key| std::env::var(key).ok()))
    }

    /// Build configuration from a settings file and an environment lookup.
    pub fn from_sources<F>(file: Option<SettingsFile>, env: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let general = file.unwrap_or_default().general;
        let mut config = Config::default();
        let mut adjustments = Vec::new();

        let raw_hosts = env("FLUXWARDEN_SCAN_HOSTS")
            .map(|v| split_list(&v))
            .or(general.scan_hosts)
            .unwrap_or_default();
        config.scan_hosts = validate_hosts(raw_hosts, &mut adjustments);

        config.target_prefixes = env("FLUXWARDEN_TARGET_PREFIXES")
            .map(|v| split_list(&v))
            .or(general.target_app_prefixes)
            .unwrap_or_default()
            .into_iter()
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .collect();

        let interval_secs = match env("FLUXWARDEN_AUTOMATION_INTERVAL_SECS") {
            Some(raw) => match raw.trim().parse::<i64>() {
                Ok(secs) => Some(secs),
                Err(_) => {
                    adjustments.push(format!(
                        "automation interval '{raw}' is not a number; using {}s",
                        MIN_AUTOMATION_INTERVAL.as_secs()
                    ));
                    None
                }
            },
            None => general.automation_interval_seconds,
        };
        if let Some(secs) = interval_secs {
            let requested = u64::try_from(secs).unwrap_or(0);
            let (interval, raised) = clamp_interval(requested);
            if raised {
                adjustments.push(format!(
                    "automation interval {secs}s is below the {}s floor; using {}s",
                    MIN_AUTOMATION_INTERVAL.as_secs(),
                    interval.as_secs()
                ));
            }
            config.automation_interval = interval;
        }

        config.debug = env("FLUXWARDEN_DEBUG")
            .map(|v| parse_flag(&v))
            .or(general.debug)
            .unwrap_or(false);

        config.log_level = env("FLUXWARDEN_LOG_LEVEL")
            .or(general.log_level)
            .unwrap_or_else(|| "info".to_string());

        config.probe_timeout = timeout_from(
            env("FLUXWARDEN_PROBE_TIMEOUT_SECS"),
            general.probe_timeout_seconds,
            "probe timeout",
            &mut adjustments,
        );
        config.request_timeout = timeout_from(
            env("FLUXWARDEN_REQUEST_TIMEOUT_SECS"),
            general.request_timeout_seconds,
            "request timeout",
            &mut adjustments,
        );

        config.sealing_mode = match env("FLUXWARDEN_SEALING").or(general.sealing) {
            None => SealingMode::Auto,
            Some(raw) => match raw.trim().to_lowercase().as_str() {
                "auto" | "on" | "true" | "1" => SealingMode::Auto,
                "off" | "disabled" | "false" | "0" => SealingMode::Disabled,
                _ => {
                    adjustments.push(format!("unknown sealing mode '{raw}'; using auto"));
                    SealingMode::Auto
                }
            },
        };
        config.sealing_key = env("FLUXWARDEN_SEALING_KEY").filter(|k| !k.trim().is_empty());

        config.adjustments = adjustments;
        config
    }

    /// Log the loaded configuration and every correction applied to it.
    pub fn report(&self) {
        info!(
            subsystem = %Subsystem::Main,
            scan_hosts = ?self.scan_hosts,
            target_prefixes = ?self.target_prefixes,
            automation_interval_secs = self.automation_interval.as_secs(),
            debug = self.debug,
            "Configuration loaded"
        );
        for adjustment in &self.adjustments {
            warn!(subsystem = %Subsystem::Main, "Configuration adjusted: {adjustment}");
        }
        if self.target_prefixes.is_empty() {
            warn!(
                subsystem = %Subsystem::Main,
                "No target prefixes configured; automation will never remove anything"
            );
        }
    }
}

/// Apply the interval floor. Returns the effective interval and whether it
/// was raised.
pub fn clamp_interval(requested_secs: u64) -> (Duration, bool) {
    let requested = Duration::from_secs(requested_secs);
    if requested < MIN_AUTOMATION_INTERVAL {
        (MIN_AUTOMATION_INTERVAL, true)
    } else {
        (requested, false)
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn parse_flag(raw: &str) -> bool {
    raw == "1" || raw.trim().to_lowercase() == "true"
}

fn timeout_from(
    env_value: Option<String>,
    file_value: Option<u64>,
    label: &str,
    adjustments: &mut Vec<String>,
) -> Duration {
    let secs = match env_value {
        Some(raw) => match raw.trim().parse::<u64>() {
            Ok(secs) => Some(secs),
            Err(_) => {
                adjustments.push(format!("{label} '{raw}' is not a number; using default"));
                None
            }
        },
        None => file_value,
    };

    match secs {
        Some(0) => {
            adjustments.push(format!("{label} of 0s is not allowed; using default"));
            DEFAULT_NETWORK_TIMEOUT
        }
        Some(secs) => Duration::from_secs(secs),
        None => DEFAULT_NETWORK_TIMEOUT,
    }
}

/// Keep hosts that form a valid `http://{host}/` origin without a port.
fn validate_hosts(raw: Vec<String>, adjustments: &mut Vec<String>) -> Vec<String> {
    let mut hosts: Vec<String> = Vec::with_capacity(raw.len());

    for host in raw {
        let host = host.trim().to_string();
        if host.is_empty() {
            continue;
        }

        let valid = reqwest::Url::parse(&format!("http://{host}/"))
            .map(|url| url.host_str().is_some() && url.port().is_none() && url.path() == "/")
            .unwrap_or(false);

        if !valid {
            adjustments.push(format!("dropping malformed scan host '{host}'"));
            continue;
        }
        if hosts.contains(&host) {
            adjustments.push(format!("dropping duplicate scan host '{host}'"));
            continue;
        }
        hosts.push(host);
    }

    hosts
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use rstest::rstest;

    use super::*;

    fn from_env(vars: &[(&str, &str)]) -> Config {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_sources(None, |key| vars.get(key).cloned())
    }

    #[rstest]
    #[case(30, 60, true)]
    #[case(60, 60, false)]
    #[case(90, 90, false)]
    #[case(0, 60, true)]
    fn test_clamp_interval(#[case] input: u64, #[case] expected: u64, #[case] raised: bool) {
        let (interval, was_raised) = clamp_interval(input);
        assert_eq!(interval, Duration::from_secs(expected));
        assert_eq!(was_raised, raised);
    }

    #[test]
    fn test_defaults() {
        let config = from_env(&[]);
        assert!(config.scan_hosts.is_empty());
        assert_eq!(config.automation_interval, MIN_AUTOMATION_INTERVAL);
        assert_eq!(config.probe_timeout, Duration::from_secs(10));
        assert_eq!(config.request_timeout, Duration::from_secs(10));
        assert_eq!(config.sealing_mode, SealingMode::Auto);
        assert!(config.adjustments.is_empty());
    }

    #[test]
    fn test_interval_below_floor_is_reported() {
        let config = from_env(&[("FLUXWARDEN_AUTOMATION_INTERVAL_SECS", "30")]);
        assert_eq!(config.automation_interval, Duration::from_secs(60));
        assert_eq!(config.adjustments.len(), 1);
        assert!(config.adjustments[0].contains("below the 60s floor"));
    }

    #[test]
    fn test_interval_not_a_number() {
        let config = from_env(&[("FLUXWARDEN_AUTOMATION_INTERVAL_SECS", "soon")]);
        assert_eq!(config.automation_interval, Duration::from_secs(60));
        assert_eq!(config.adjustments.len(), 1);
    }

    #[test]
    fn test_hosts_and_prefixes_are_split() {
        let config = from_env(&[
            ("FLUXWARDEN_SCAN_HOSTS", "10.0.0.5, 10.0.0.6,,"),
            ("FLUXWARDEN_TARGET_PREFIXES", "foo, bar ,"),
        ]);
        assert_eq!(config.scan_hosts, vec!["10.0.0.5", "10.0.0.6"]);
        assert_eq!(config.target_prefixes, vec!["foo", "bar"]);
    }

    #[test]
    fn test_malformed_hosts_dropped() {
        let config = from_env(&[(
            "FLUXWARDEN_SCAN_HOSTS",
            "10.0.0.5,bad host,10.0.0.7:16127,http://x/y,10.0.0.5,[::1]",
        )]);
        assert_eq!(config.scan_hosts, vec!["10.0.0.5", "[::1]"]);
        assert_eq!(config.adjustments.len(), 4);
    }

    #[test]
    fn test_settings_file_with_env_override() {
        let file = SettingsFile::parse(
            r#"
            [general]
            scan_hosts = ["192.168.1.10"]
            target_app_prefixes = ["foo"]
            automation_interval_seconds = 120
            debug = true
            sealing = "off"
            "#,
        )
        .unwrap();

        let config = Config::from_sources(Some(file), |key| match key {
            "FLUXWARDEN_TARGET_PREFIXES" => Some("bar".to_string()),
            _ => None,
        });

        assert_eq!(config.scan_hosts, vec!["192.168.1.10"]);
        assert_eq!(config.target_prefixes, vec!["bar"]);
        assert_eq!(config.automation_interval, Duration::from_secs(120));
        assert!(config.debug);
        assert_eq!(config.sealing_mode, SealingMode::Disabled);
    }

    #[test]
    fn test_settings_file_invalid_toml() {
        assert!(SettingsFile::parse("[general\nscan_hosts = ").is_err());
    }

    #[test]
    fn test_load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.toml");
        std::fs::write(&path, "[general]\ntarget_app_prefixes = [\"qux\"]\n").unwrap();

        let file = SettingsFile::read(&path).unwrap();
        assert_eq!(
            file.general.target_app_prefixes,
            Some(vec!["qux".to_string()])
        );
        assert!(SettingsFile::read(&dir.path().join("missing.toml")).is_err());
    }

    #[test]
    fn test_zero_timeout_corrected() {
        let config = from_env(&[("FLUXWARDEN_PROBE_TIMEOUT_SECS", "0")]);
        assert_eq!(config.probe_timeout, DEFAULT_NETWORK_TIMEOUT);
        assert_eq!(config.adjustments.len(), 1);
    }
}
