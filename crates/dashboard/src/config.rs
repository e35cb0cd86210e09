//! TOML config file loading and validation, with a handful of environment
//! overrides for the values that usually differ per deployment.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub broker: BrokerConfig,
    pub engine: EngineConfig,
    pub advisory: AdvisoryConfig,
    pub web: WebConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// `mqtt://`, `mqtts://`, `ws://` or `wss://` endpoint.
    pub url: String,
    pub client_id_prefix: String,
    pub topic_prefix: String,
    pub keep_alive_secs: u64,
    pub reconnect_ms: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            url: "wss://broker.hivemq.com:8884/mqtt".to_string(),
            client_id_prefix: "agrohygra-web".to_string(),
            topic_prefix: "agrohygra".to_string(),
            keep_alive_secs: 60,
            reconnect_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub log_capacity: usize,
    pub recency_window_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            log_capacity: crate::state::DEFAULT_LOG_CAPACITY,
            recency_window_ms: 1500,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AdvisoryConfig {
    pub base_url: String,
    pub model: String,
    /// Name of the environment variable holding the API key.
    pub api_key_env: String,
    pub debounce_secs: u64,
    pub timeout_secs: u64,
    pub temperature: f32,
    pub max_tokens: u32,
    pub referer: String,
    pub title: String,
}

impl Default for AdvisoryConfig {
    fn default() -> Self {
        Self {
            base_url: "https://openrouter.ai/api/v1".to_string(),
            model: "google/gemini-2.5-flash-lite".to_string(),
            api_key_env: "OPENROUTER_API_KEY".to_string(),
            debounce_secs: 30,
            timeout_secs: 30,
            temperature: 0.7,
            max_tokens: 300,
            referer: "http://localhost:8080".to_string(),
            title: "AgroHygra Smart Agriculture".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WebConfig {
    pub port: u16,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self { port: 8080 }
    }
}

// ---------------------------------------------------------------------------
// Broker endpoint
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Tcp,
    Tls,
    Ws,
    Wss,
}

/// A parsed broker URL.  `url` is kept verbatim because websocket transports
/// take the full URL as the broker address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerEndpoint {
    pub transport: TransportKind,
    pub host: String,
    pub port: u16,
    pub url: String,
}

impl BrokerEndpoint {
    pub fn parse(url: &str) -> Result<Self> {
        let (scheme, rest) = url
            .split_once("://")
            .with_context(|| format!("broker url must include a scheme: {url:?}"))?;

        let (transport, default_port) = match scheme.to_ascii_lowercase().as_str() {
            "mqtt" | "tcp" => (TransportKind::Tcp, 1883),
            "mqtts" | "ssl" => (TransportKind::Tls, 8883),
            "ws" => (TransportKind::Ws, 80),
            "wss" => (TransportKind::Wss, 443),
            other => bail!("unsupported broker scheme {other:?} in {url:?}"),
        };

        let authority = rest.split('/').next().unwrap_or_default();
        if authority.is_empty() {
            bail!("broker url has no host: {url:?}");
        }
        let (host, port) = match authority.rsplit_once(':') {
            Some((h, p)) => {
                let port = p
                    .parse::<u16>()
                    .with_context(|| format!("invalid broker port {p:?} in {url:?}"))?;
                (h.to_string(), port)
            }
            None => (authority.to_string(), default_port),
        };
        if host.is_empty() {
            bail!("broker url has no host: {url:?}");
        }

        Ok(Self {
            transport,
            host,
            port,
            url: url.to_string(),
        })
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate every section.  Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        if let Err(e) = BrokerEndpoint::parse(&self.broker.url) {
            errors.push(format!("broker.url: {e}"));
        }
        if self.broker.client_id_prefix.trim().is_empty() {
            errors.push("broker.client_id_prefix is empty".to_string());
        }
        if self.broker.topic_prefix.trim().is_empty() {
            errors.push("broker.topic_prefix is empty".to_string());
        }
        if self.broker.topic_prefix.contains(|c: char| c == '+' || c == '#') {
            errors.push(format!(
                "broker.topic_prefix {:?} must not contain wildcards",
                self.broker.topic_prefix
            ));
        }
        if self.broker.keep_alive_secs < 5 {
            errors.push(format!(
                "broker.keep_alive_secs must be at least 5, got {}",
                self.broker.keep_alive_secs
            ));
        }
        if self.broker.reconnect_ms == 0 {
            errors.push("broker.reconnect_ms must be positive".to_string());
        }

        if self.engine.log_capacity == 0 {
            errors.push("engine.log_capacity must be positive".to_string());
        }
        if self.engine.recency_window_ms == 0 {
            errors.push("engine.recency_window_ms must be positive".to_string());
        }

        if !self.advisory.base_url.starts_with("http://")
            && !self.advisory.base_url.starts_with("https://")
        {
            errors.push(format!(
                "advisory.base_url {:?} must be an http(s) url",
                self.advisory.base_url
            ));
        }
        if self.advisory.model.trim().is_empty() {
            errors.push("advisory.model is empty".to_string());
        }
        if self.advisory.timeout_secs == 0 {
            errors.push("advisory.timeout_secs must be positive".to_string());
        }
        if !(0.0..=2.0).contains(&self.advisory.temperature) {
            errors.push(format!(
                "advisory.temperature {} out of range [0.0, 2.0]",
                self.advisory.temperature
            ));
        }
        if self.advisory.max_tokens == 0 {
            errors.push("advisory.max_tokens must be positive".to_string());
        }

        if self.web.port == 0 {
            errors.push("web.port must be non-zero".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    pub fn endpoint(&self) -> Result<BrokerEndpoint> {
        BrokerEndpoint::parse(&self.broker.url)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.broker.reconnect_ms)
    }

    pub fn recency_window(&self) -> Duration {
        Duration::from_millis(self.engine.recency_window_ms)
    }

    pub fn debounce_window(&self) -> Duration {
        Duration::from_secs(self.advisory.debounce_secs)
    }

    /// The advisory API key, read from the configured environment variable.
    pub fn advisory_api_key(&self) -> Option<String> {
        std::env::var(&self.advisory.api_key_env)
            .ok()
            .filter(|k| !k.trim().is_empty())
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(url) = std::env::var("MQTT_URL") {
            self.broker.url = url;
        }
        if let Ok(port) = std::env::var("WEB_PORT") {
            self.web.port = port
                .parse()
                .context("WEB_PORT must be a valid port number")?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML config file.
pub fn load(path: &str) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    let config: Config =
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?;
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

/// Load `path` if it exists (defaults otherwise), then apply environment
/// overrides and validate the result.
pub fn load_or_default(path: &str) -> Result<Config> {
    let mut config = if Path::new(path).exists() {
        load(path)?
    } else {
        tracing::info!(path, "config file not found, using defaults");
        Config::default()
    };
    config.apply_env()?;
    config.validate()?;
    Ok(config)
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    /// Assert validation fails and the error message contains `needle`.
    fn assert_validation_err(cfg: &Config, needle: &str) {
        let err = cfg.validate().unwrap_err();
        let msg = format!("{err:#}");
        assert!(
            msg.contains(needle),
            "expected error containing {needle:?}, got: {msg}"
        );
    }

    // -- Parsing ----------------------------------------------------------

    #[test]
    fn parse_empty_config_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.broker.url, "wss://broker.hivemq.com:8884/mqtt");
        assert_eq!(config.broker.topic_prefix, "agrohygra");
        assert_eq!(config.engine.log_capacity, 50);
        assert_eq!(config.engine.recency_window_ms, 1500);
        assert_eq!(config.advisory.debounce_secs, 30);
        assert_eq!(config.web.port, 8080);
        config.validate().unwrap();
    }

    #[test]
    fn parse_partial_config() {
        let toml_str = r#"
[broker]
url = "mqtt://192.168.1.10"
topic_prefix = "greenhouse"

[advisory]
debounce_secs = 10
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.broker.url, "mqtt://192.168.1.10");
        assert_eq!(config.broker.topic_prefix, "greenhouse");
        assert_eq!(config.broker.keep_alive_secs, 60);
        assert_eq!(config.debounce_window(), Duration::from_secs(10));
        config.validate().unwrap();
    }

    // -- Endpoint ---------------------------------------------------------

    #[test]
    fn endpoint_wss_with_path() {
        let ep = BrokerEndpoint::parse("wss://broker.hivemq.com:8884/mqtt").unwrap();
        assert_eq!(ep.transport, TransportKind::Wss);
        assert_eq!(ep.host, "broker.hivemq.com");
        assert_eq!(ep.port, 8884);
        assert_eq!(ep.url, "wss://broker.hivemq.com:8884/mqtt");
    }

    #[test]
    fn endpoint_default_ports() {
        assert_eq!(BrokerEndpoint::parse("mqtt://h").unwrap().port, 1883);
        assert_eq!(BrokerEndpoint::parse("mqtts://h").unwrap().port, 8883);
        assert_eq!(BrokerEndpoint::parse("ws://h/mqtt").unwrap().port, 80);
        assert_eq!(BrokerEndpoint::parse("wss://h/mqtt").unwrap().port, 443);
    }

    #[test]
    fn endpoint_rejects_bad_input() {
        assert!(BrokerEndpoint::parse("broker.hivemq.com").is_err());
        assert!(BrokerEndpoint::parse("http://h").is_err());
        assert!(BrokerEndpoint::parse("mqtt://").is_err());
        assert!(BrokerEndpoint::parse("mqtt://h:notaport").is_err());
        assert!(BrokerEndpoint::parse("mqtt://:1883").is_err());
    }

    // -- Validation -------------------------------------------------------

    #[test]
    fn bad_broker_url_rejected() {
        let mut cfg = Config::default();
        cfg.broker.url = "ftp://x".into();
        assert_validation_err(&cfg, "unsupported broker scheme");
    }

    #[test]
    fn wildcard_topic_prefix_rejected() {
        let mut cfg = Config::default();
        cfg.broker.topic_prefix = "farm/#".into();
        assert_validation_err(&cfg, "must not contain wildcards");
    }

    #[test]
    fn short_keep_alive_rejected() {
        let mut cfg = Config::default();
        cfg.broker.keep_alive_secs = 2;
        assert_validation_err(&cfg, "keep_alive_secs must be at least 5");
    }

    #[test]
    fn temperature_out_of_range_rejected() {
        let mut cfg = Config::default();
        cfg.advisory.temperature = 3.5;
        assert_validation_err(&cfg, "advisory.temperature");
    }

    #[test]
    fn multiple_errors_reported_together() {
        let mut cfg = Config::default();
        cfg.engine.log_capacity = 0;
        cfg.broker.reconnect_ms = 0;
        cfg.advisory.base_url = "openrouter.ai".into();

        let msg = format!("{:#}", cfg.validate().unwrap_err());
        assert!(msg.contains("3 errors"), "got: {msg}");
        assert!(msg.contains("log_capacity"));
        assert!(msg.contains("reconnect_ms"));
        assert!(msg.contains("advisory.base_url"));
    }

    #[test]
    fn load_missing_file_errors() {
        let err = load("/nonexistent/dashboard.toml").unwrap_err();
        assert!(format!("{err:#}").contains("failed to read config"));
    }

    #[test]
    fn example_config_is_valid() {
        let cfg: Config = toml::from_str(include_str!("../../../dashboard.example.toml")).unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.broker.url, "wss://broker.hivemq.com:8884/mqtt");
        assert_eq!(cfg.engine.log_capacity, 50);
        assert_eq!(cfg.debounce_window(), Duration::from_secs(30));
    }
}
