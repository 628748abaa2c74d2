use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{debug, warn};
use serde::Serialize;
use serde_json::{json, Map, Value};
use url::Url;

use crate::catalogue::user_configurable_defaults;
use crate::diagnostics::{parse_flag, Diagnostics};
use crate::error::{PipelineError, Result};
use crate::poller::PollPolicy;
use crate::workflow::DEFAULT_WORKFLOW_NAME;

pub const SETTINGS_FILE: &str = "comfyui-settings.json";
pub const CONFIG_FILE: &str = "config.env";
pub const WORKFLOWS_DIR: &str = "workflows";
pub const DEFAULT_BASE_URL: &str = "http://localhost:8188";

const KEY_BASE_URL: &str = "COMFYUI_BASE_URL";
const KEY_API_KEY: &str = "COMFYUI_API_KEY";
const KEY_DEBUG: &str = "DEBUG_MODE";
const KEY_WORKFLOW: &str = "workflow";
const KEY_PROJECT_BASE_PATH: &str = "PROJECT_BASE_PATH";
const KEY_SERVER_PORT: &str = "SERVER_PORT";
const KEY_IMAGE_KEY: &str = "IMAGESERVER_IMAGE_KEY";
const KEY_HTTP_URL: &str = "VarHttpUrl";
const KEY_POLL_ATTEMPTS: &str = "COMFYUI_POLL_ATTEMPTS";
const KEY_POLL_INTERVAL: &str = "COMFYUI_POLL_INTERVAL_MS";

/// Settings-file fields that configure the connection rather than a
/// placeholder, with the operational key each one feeds.
const SETTINGS_FIELDS: [(&str, &str); 3] = [
    ("serverUrl", KEY_BASE_URL),
    ("apiKey", KEY_API_KEY),
    ("workflow", KEY_WORKFLOW),
];

/// Variables the process environment is allowed to override.
const ENVIRONMENT_KEYS: &[&str] = &[
    KEY_BASE_URL,
    KEY_API_KEY,
    KEY_DEBUG,
    KEY_PROJECT_BASE_PATH,
    KEY_SERVER_PORT,
    KEY_IMAGE_KEY,
    KEY_HTTP_URL,
    KEY_POLL_ATTEMPTS,
    KEY_POLL_INTERVAL,
];

/// Where a configuration value came from, lowest priority first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Source {
    Default,
    EnvFile,
    Settings,
    Environment,
    Request,
}

/// Snapshot of the process environment taken once at start-up.
#[derive(Debug, Clone, Default)]
pub struct Environment {
    vars: HashMap<String, String>,
}

impl Environment {
    pub fn from_process() -> Self {
        let vars = ENVIRONMENT_KEYS
            .iter()
            .filter_map(|key| std::env::var(key).ok().map(|v| (key.to_string(), v)))
            .collect();
        Self { vars }
    }

    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            vars: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }
}

/// Persisted user settings (`comfyui-settings.json`).
#[derive(Debug, Clone)]
pub struct SettingsStore {
    path: PathBuf,
}

impl SettingsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the settings document. A missing or unreadable file is empty.
    pub async fn load(&self) -> Map<String, Value> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Map::new(),
            Err(err) => {
                warn!("Failed to read {}: {}", self.path.display(), err);
                return Map::new();
            }
        };
        match serde_json::from_str::<Value>(&raw) {
            Ok(Value::Object(map)) => map,
            Ok(_) => {
                warn!("{} is not a JSON object; ignoring it", self.path.display());
                Map::new()
            }
            Err(err) => {
                warn!("Failed to parse {}: {}", self.path.display(), err);
                Map::new()
            }
        }
    }

    pub async fn get(&self, key: &str) -> Option<Value> {
        self.load().await.remove(key)
    }

    /// Stores `value` under `key`; returns whether the file changed.
    pub async fn set(&self, key: &str, value: Value) -> Result<bool> {
        let mut settings = self.load().await;
        if settings.get(key) == Some(&value) {
            return Ok(false);
        }
        settings.insert(key.to_string(), value);
        self.save(&settings).await?;
        Ok(true)
    }

    pub async fn export(&self) -> Value {
        Value::Object(self.load().await)
    }

    async fn save(&self, settings: &Map<String, Value>) -> Result<()> {
        let failure = |err: String| {
            PipelineError::Configuration(format!(
                "Failed to save settings to {}: {}",
                self.path.display(),
                err
            ))
        };
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| failure(e.to_string()))?;
        }
        let body = serde_json::to_string_pretty(settings).map_err(|e| failure(e.to_string()))?;
        tokio::fs::write(&self.path, body)
            .await
            .map_err(|e| failure(e.to_string()))
    }
}

/// Files the plugin reads its configuration from.
#[derive(Debug, Clone)]
pub struct ConfigSources {
    pub settings: SettingsStore,
    pub env_file: PathBuf,
    pub workflows_dir: PathBuf,
}

impl ConfigSources {
    /// Standard layout of a plugin directory.
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self {
            settings: SettingsStore::new(dir.join(SETTINGS_FILE)),
            env_file: dir.join(CONFIG_FILE),
            workflows_dir: dir.join(WORKFLOWS_DIR),
        }
    }
}

/// Placeholder values after the defaults -> settings -> request merge.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EffectiveParameters {
    values: Map<String, Value>,
    sources: BTreeMap<String, Source>,
}

impl EffectiveParameters {
    pub fn merge(
        defaults: &Map<String, Value>,
        settings: &Map<String, Value>,
        request: &Map<String, Value>,
    ) -> Self {
        let mut params = Self::default();
        params.layer(Source::Default, defaults);
        params.layer(Source::Settings, settings);
        params.layer(Source::Request, request);
        params
    }

    fn layer(&mut self, source: Source, tier: &Map<String, Value>) {
        for (key, value) in tier {
            self.values.insert(key.clone(), value.clone());
            self.sources.insert(key.clone(), source);
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn source_of(&self, key: &str) -> Option<Source> {
        self.sources.get(key).copied()
    }

    pub fn values(&self) -> &Map<String, Value> {
        &self.values
    }

    pub fn provenance(&self) -> &BTreeMap<String, Source> {
        &self.sources
    }
}

/// Connection settings for the job server.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub workflow: String,
    pub debug: bool,
    pub poll: PollPolicy,
}

/// Local artifact storage and the image server that publishes it.
#[derive(Debug, Clone, PartialEq)]
pub struct StorageConfig {
    pub project_base_path: PathBuf,
    pub server_port: String,
    pub image_key: String,
    pub http_url: String,
}

impl StorageConfig {
    pub fn image_dir(&self) -> PathBuf {
        self.project_base_path.join("image").join(crate::artifact::IMAGE_SUBDIR)
    }

    /// URL template with a `{path}` slot for the image server relative path.
    pub fn url_template(&self) -> String {
        format!(
            "{}:{}/pw={}/images/{{path}}",
            self.http_url.trim_end_matches('/'),
            self.server_port,
            self.image_key
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub params: EffectiveParameters,
}

/// Operational key/value tiers, lowest priority first.
struct Layers {
    tiers: Vec<(Source, HashMap<String, String>)>,
}

impl Layers {
    fn get(&self, key: &str) -> Option<(&str, Source)> {
        self.tiers.iter().rev().find_map(|(source, tier)| {
            tier.get(key)
                .map(|v| v.trim())
                .filter(|v| !v.is_empty())
                .map(|v| (v, *source))
        })
    }

    fn value(&self, key: &str) -> Option<&str> {
        self.get(key).map(|(v, _)| v)
    }
}

pub fn normalize_base_url_str(value: &str) -> Result<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Ok(DEFAULT_BASE_URL.to_string());
    }
    let mut url = Url::parse(trimmed).map_err(|err| {
        PipelineError::Configuration(format!("Invalid base URL '{}': {}", trimmed, err))
    })?;
    url.set_path("");
    url.set_query(None);
    let normalized = url.to_string().trim_end_matches('/').to_string();
    if normalized.is_empty() {
        Ok(DEFAULT_BASE_URL.to_string())
    } else {
        Ok(normalized)
    }
}

fn parse_number<T: std::str::FromStr>(layers: &Layers, key: &str, fallback: T) -> Result<T> {
    match layers.get(key) {
        None => Ok(fallback),
        Some((raw, source)) => raw.parse::<T>().map_err(|_| {
            PipelineError::Configuration(format!(
                "{} must be a positive number, got '{}' from {:?}",
                key, raw, source
            ))
        }),
    }
}

/// Merges built-in defaults, `config.env`, persisted settings, the process
/// environment and request parameters.
#[derive(Debug, Clone)]
pub struct ConfigResolver {
    sources: ConfigSources,
    env: Environment,
    diagnostics: Diagnostics,
}

impl ConfigResolver {
    pub fn new(sources: ConfigSources, env: Environment, diagnostics: Diagnostics) -> Self {
        Self {
            sources,
            env,
            diagnostics,
        }
    }

    pub fn sources(&self) -> &ConfigSources {
        &self.sources
    }

    async fn read_env_file(&self) -> HashMap<String, String> {
        let path = &self.sources.env_file;
        let raw = match tokio::fs::read_to_string(path).await {
            Ok(raw) => raw,
            Err(err) => {
                if err.kind() != std::io::ErrorKind::NotFound {
                    warn!("Failed to read {}: {}", path.display(), err);
                }
                return HashMap::new();
            }
        };
        let mut values = HashMap::new();
        for item in dotenvy::from_read_iter(raw.as_bytes()) {
            match item {
                Ok((key, value)) => {
                    values.insert(key, value);
                }
                Err(err) => warn!("Skipping malformed line in {}: {}", path.display(), err),
            }
        }
        values
    }

    async fn layers(&self, settings: &Map<String, Value>) -> Layers {
        let defaults = HashMap::from([
            (KEY_BASE_URL.to_string(), DEFAULT_BASE_URL.to_string()),
            (KEY_DEBUG.to_string(), "false".to_string()),
            (KEY_WORKFLOW.to_string(), DEFAULT_WORKFLOW_NAME.to_string()),
        ]);

        let mut from_settings = HashMap::new();
        for (field, key) in SETTINGS_FIELDS {
            if let Some(value) = settings.get(field).and_then(Value::as_str) {
                from_settings.insert(key.to_string(), value.to_string());
            }
        }

        let from_env = ENVIRONMENT_KEYS
            .iter()
            .filter_map(|key| self.env.get(key).map(|v| (key.to_string(), v.to_string())))
            .collect();

        Layers {
            tiers: vec![
                (Source::Default, defaults),
                (Source::EnvFile, self.read_env_file().await),
                (Source::Settings, from_settings),
                (Source::Environment, from_env),
            ],
        }
    }

    fn server_from(&self, layers: &Layers) -> Result<ServerConfig> {
        let base_url = normalize_base_url_str(layers.value(KEY_BASE_URL).unwrap_or_default())?;
        let defaults = PollPolicy::default();
        let max_attempts: u32 = parse_number(layers, KEY_POLL_ATTEMPTS, defaults.max_attempts)?;
        let interval_ms: u64 = parse_number(
            layers,
            KEY_POLL_INTERVAL,
            defaults.interval.as_millis() as u64,
        )?;
        if max_attempts == 0 {
            return Err(PipelineError::Configuration(format!(
                "{} must be at least 1",
                KEY_POLL_ATTEMPTS
            )));
        }
        if let Some((_, source)) = layers.get(KEY_BASE_URL) {
            debug!("Using server URL {} from {:?}", base_url, source);
        }
        Ok(ServerConfig {
            base_url,
            api_key: layers.value(KEY_API_KEY).map(str::to_string),
            workflow: layers
                .value(KEY_WORKFLOW)
                .unwrap_or(DEFAULT_WORKFLOW_NAME)
                .to_string(),
            debug: layers.value(KEY_DEBUG).map(parse_flag).unwrap_or(false),
            poll: PollPolicy {
                max_attempts,
                interval: Duration::from_millis(interval_ms),
            },
        })
    }

    fn storage_from(&self, layers: &Layers) -> Result<StorageConfig> {
        let required = [KEY_PROJECT_BASE_PATH, KEY_SERVER_PORT, KEY_IMAGE_KEY, KEY_HTTP_URL];
        let missing: Vec<&str> = required
            .iter()
            .copied()
            .filter(|key| layers.value(key).is_none())
            .collect();
        if !missing.is_empty() {
            return Err(PipelineError::Configuration(format!(
                "Missing environment variables: {}",
                missing.join(", ")
            )));
        }
        let value = |key: &str| layers.value(key).unwrap_or_default().to_string();
        Ok(StorageConfig {
            project_base_path: PathBuf::from(value(KEY_PROJECT_BASE_PATH)),
            server_port: value(KEY_SERVER_PORT),
            image_key: value(KEY_IMAGE_KEY),
            http_url: value(KEY_HTTP_URL),
        })
    }

    /// Server connection settings only; storage fields are not required.
    pub async fn server(&self) -> Result<ServerConfig> {
        let settings = self.sources.settings.load().await;
        let layers = self.layers(&settings).await;
        self.server_from(&layers)
    }

    pub async fn resolve(&self, request: &Map<String, Value>) -> Result<ResolvedConfig> {
        let settings = self.sources.settings.load().await;
        let layers = self.layers(&settings).await;

        let mut server = self.server_from(&layers)?;
        let storage = self.storage_from(&layers)?;

        if let Some(name) = request
            .get(KEY_WORKFLOW)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
        {
            server.workflow = name.to_string();
        }

        let overrides: Map<String, Value> = settings
            .into_iter()
            .filter(|(key, _)| !SETTINGS_FIELDS.iter().any(|(field, _)| *field == key.as_str()))
            .collect();
        let params = EffectiveParameters::merge(&default_parameters(), &overrides, request);
        self.diagnostics.dump_json(
            "Merged parameters",
            &json!({ "values": params.values(), "sources": params.provenance() }),
        );

        Ok(ResolvedConfig {
            server,
            storage,
            params,
        })
    }
}

/// Built-in placeholder values: every user-configurable default plus the
/// standard negative prompt.
pub fn default_parameters() -> Map<String, Value> {
    let mut defaults = user_configurable_defaults();
    if let Some(negative) = crate::catalogue::default_value("negative_prompt") {
        defaults.insert("negative_prompt".into(), negative);
    }
    defaults
}
