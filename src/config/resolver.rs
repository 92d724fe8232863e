//! Resolution of the effective configuration.
//!
//! The effective configuration is built in three layers, each deep-merged
//! over the previous one: the hardcoded defaults, the server's
//! `config.json`, and the client's dotted-path overrides.

use crate::api::requests::ConfigRequest;
use crate::api::Client;
use crate::config::Config;
use crate::errors::SpeedTestError;
use crate::retry::retry_async;
use log::{debug, info, warn};
use serde_json::{Map, Value};
use url::Url;

/// Deep-merge `overlay` into `base`.
///
/// Arrays concatenate, objects merge recursively, anything else in
/// `overlay` replaces the value in `base`.
pub fn deep_merge(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (Value::Array(base), Value::Array(overlay)) => {
            base.extend(overlay);
        }
        (base, overlay) => *base = overlay,
    }
}

/// Expand a map keyed by dotted paths into a nested object.
///
/// `{"download.duration": 20}` becomes `{"download": {"duration": 20}}`.
/// Keys sharing a prefix are merged together.
pub fn expand_dotted(overrides: &Map<String, Value>) -> Value {
    let mut expanded = Value::Object(Map::new());

    for (path, value) in overrides {
        let nested = path
            .split('.')
            .rev()
            .fold(value.clone(), |value, key| {
                let mut object = Map::new();
                object.insert(key.to_string(), value);
                Value::Object(object)
            });
        deep_merge(&mut expanded, nested);
    }

    expanded
}

/// Parse a `key=value` command line override.
///
/// The value is read as JSON when it parses (`20`, `true`, `"ws"`), and as
/// a plain string otherwise (`websocket`).
pub fn parse_override(raw: &str) -> Result<(String, Value), SpeedTestError> {
    let (key, value) = raw.split_once('=').ok_or_else(|| {
        SpeedTestError::config(format!(
            "override {:?} is not of the form key=value",
            raw
        ))
    })?;

    let key = key.trim();
    if key.is_empty() || key.split('.').any(str::is_empty) {
        return Err(SpeedTestError::config(format!(
            "override {:?} has an invalid key",
            raw
        )));
    }

    let value = serde_json::from_str(value.trim())
        .unwrap_or_else(|_| Value::String(value.trim().to_string()));

    Ok((key.to_string(), value))
}

/// Builds the effective configuration for a server.
pub struct ConfigResolver {
    server: Url,
    overrides: Map<String, Value>,
}

impl ConfigResolver {
    pub fn new(server: Url) -> Self {
        Self { server, overrides: Map::new() }
    }

    pub fn with_overrides(mut self, overrides: Map<String, Value>) -> Self {
        self.overrides.extend(overrides);
        self
    }

    pub fn with_override(
        mut self,
        key: impl Into<String>,
        value: Value,
    ) -> Self {
        self.overrides.insert(key.into(), value);
        self
    }

    /// Fetch the server configuration and resolve the effective one.
    ///
    /// A transport failure fetching `config.json` is a `ConfigLoad` error.
    /// A body that is not a JSON object is ignored and the defaults apply.
    pub async fn load(&self) -> Result<Config, SpeedTestError> {
        let defaults = Config::for_server(&self.server);
        let client = Client::new(self.server.clone(), defaults.timeout())
            .map_err(|e| {
                SpeedTestError::config_load("could not build HTTP client")
                    .with_source(e)
            })?;

        info!("Loading configuration from {}", self.server);
        let body = retry_async(&defaults.retry, "config fetch", || {
            client.fetch(ConfigRequest)
        })
        .await
        .map_err(|e| {
            SpeedTestError::config_load(format!(
                "could not load configuration file (config.json): {}",
                e.last_error
            ))
            .with_source(e)
        })?;

        let server = match serde_json::from_str::<Value>(&body) {
            Ok(value @ Value::Object(_)) => Some(value),
            Ok(_) | Err(_) => {
                warn!("config.json is not a JSON object, using defaults");
                None
            }
        };

        Self::resolve(&defaults, server, &self.overrides)
    }

    /// Merge the layers and validate the result.
    pub fn resolve(
        defaults: &Config,
        server: Option<Value>,
        overrides: &Map<String, Value>,
    ) -> Result<Config, SpeedTestError> {
        let mut merged = serde_json::to_value(defaults).map_err(|e| {
            SpeedTestError::config("could not serialize defaults")
                .with_source(e)
        })?;

        if let Some(server) = server {
            deep_merge(&mut merged, server);
        }
        if !overrides.is_empty() {
            debug!("Applying {} configuration overrides", overrides.len());
            deep_merge(&mut merged, expand_dotted(overrides));
        }

        let config: Config = serde_json::from_value(merged).map_err(|e| {
            SpeedTestError::config(format!("invalid configuration: {}", e))
                .with_source(e)
        })?;
        config.validate()?;

        Ok(config)
    }

    /// Apply dotted overrides on top of an already resolved configuration.
    pub fn apply_overrides(
        config: &Config,
        overrides: &Map<String, Value>,
    ) -> Result<Config, SpeedTestError> {
        Self::resolve(config, None, overrides)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn map(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected an object"),
        }
    }

    #[test]
    fn test_dotted_override_keeps_siblings() {
        let mut base = json!({"download": {"duration": 10, "streams": 6}});
        let overrides = map(json!({"download.duration": 20}));

        deep_merge(&mut base, expand_dotted(&overrides));

        assert_eq!(base, json!({"download": {"duration": 20, "streams": 6}}));
    }

    #[test]
    fn test_expand_dotted_merges_shared_prefixes() {
        let overrides = map(json!({
            "download.duration": 20,
            "download.streams": 2,
            "ignore": true
        }));

        assert_eq!(
            expand_dotted(&overrides),
            json!({"download": {"duration": 20, "streams": 2}, "ignore": true})
        );
    }

    #[test]
    fn test_deep_merge_concatenates_arrays() {
        let mut base = json!({"servers": ["a"], "name": "x"});
        deep_merge(&mut base, json!({"servers": ["b"], "name": "y"}));
        assert_eq!(base, json!({"servers": ["a", "b"], "name": "y"}));
    }

    #[test]
    fn test_deep_merge_scalar_replaces_object() {
        let mut base = json!({"latency": {"count": 3}});
        deep_merge(&mut base, json!({"latency": 5}));
        assert_eq!(base, json!({"latency": 5}));
    }

    #[test]
    fn test_parse_override() {
        assert_eq!(
            parse_override("download.duration=20").unwrap(),
            ("download.duration".to_string(), json!(20))
        );
        assert_eq!(
            parse_override("latency.mode=websocket").unwrap(),
            ("latency.mode".to_string(), json!("websocket"))
        );
        assert_eq!(
            parse_override("upload.ignoreErrors = false").unwrap(),
            ("upload.ignoreErrors".to_string(), json!(false))
        );
        assert!(parse_override("download.duration").is_err());
        assert!(parse_override("download..duration=1").is_err());
    }

    #[test]
    fn test_resolve_layers() {
        let defaults = Config::default();
        let server = json!({"download": {"duration": 15000, "streams": 4}});
        let overrides = map(json!({"download.duration": 20000}));

        let config =
            ConfigResolver::resolve(&defaults, Some(server), &overrides)
                .unwrap();

        assert_eq!(config.download.duration, 20_000);
        assert_eq!(config.download.streams, 4);
        assert_eq!(config.download.path, "download");
        assert_eq!(config.upload, defaults.upload);
    }

    #[test]
    fn test_resolve_rejects_invalid_values() {
        let overrides = map(json!({"upload.streams": 0}));
        let error =
            ConfigResolver::resolve(&Config::default(), None, &overrides)
                .unwrap_err();
        assert!(error.message.contains("upload.streams"));

        let overrides = map(json!({"latency.duration": "soon"}));
        assert!(ConfigResolver::resolve(&Config::default(), None, &overrides)
            .is_err());
    }

    #[test]
    fn test_apply_overrides_to_resolved_config() {
        let config = Config::default();
        let overrides =
            map(json!({"latency.mode": "xhr", "latency.count": 10}));

        let updated =
            ConfigResolver::apply_overrides(&config, &overrides).unwrap();

        assert_eq!(updated.latency.mode, crate::config::Mode::Http);
        assert_eq!(updated.latency.count, Some(10));
        assert_eq!(updated.download, config.download);
    }

    #[tokio::test]
    async fn test_load_fails_when_server_unreachable() {
        let server = Url::parse("http://127.0.0.1:9/").unwrap();
        let resolver = ConfigResolver::new(server)
            .with_override("download.duration", json!(1000));

        let error = resolver.load().await.unwrap_err();
        assert_eq!(error.kind, crate::errors::ErrorKind::ConfigLoad);
    }
}
