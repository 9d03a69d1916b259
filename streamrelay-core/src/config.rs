//! Settings for a relay run. They are read once at startup from a JSON document that is either a
//! file (`--config` or `STREAMRELAY_CONFIG_FILE`) or base64 encoded in `STREAMRELAY_CONFIG`.
//! Every section is optional; an empty document relays stdin to the log target.

use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use base64::Engine;
use base64::prelude::BASE64_STANDARD;
use serde::Deserialize;

use crate::Error;
use crate::Result;

const ENV_CONFIG: &str = "STREAMRELAY_CONFIG";
const ENV_CONFIG_FILE: &str = "STREAMRELAY_CONFIG_FILE";

const DEFAULT_BATCH_SIZE: usize = 50;
const DEFAULT_READ_TIMEOUT_MS: u64 = 1000;
const DEFAULT_MAX_MESSAGE_SIZE_BYTES: usize = 1024 * 1024;
const DEFAULT_CONCURRENT_WRITES: usize = 50;
const DEFAULT_ENTRYPOINT: &str = "main";
const DEFAULT_JS_TIMEOUT_SEC: u64 = 15;
const DEFAULT_LUA_TIMEOUT_SEC: u64 = 5;
const DEFAULT_METRICS_PORT: u16 = 2112;
const DEFAULT_REPORTER_TIMEOUT_SEC: u64 = 5;
const DEFAULT_APP_NAME: &str = "streamrelay";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub target: TargetConfig,
    #[serde(default)]
    pub failure_target: FailureTargetConfig,
    #[serde(default)]
    pub transform: Vec<TransformConfig>,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub stats: StatsConfig,
    #[serde(default)]
    pub metadata_reporter: Option<MetadataReporterConfig>,
    #[serde(default)]
    pub concurrent_writes: ConcurrentWrites,
    #[serde(default)]
    pub app: AppInfo,
}

impl Settings {
    /// Resolves the configuration: an explicit path wins, then the file env var, then the base64
    /// env var. With none of them set the defaults are used.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let settings = if let Some(path) = path {
            Self::from_file(path)?
        } else if let Ok(path) = env::var(ENV_CONFIG_FILE) {
            Self::from_file(Path::new(&path))?
        } else if let Ok(encoded) = env::var(ENV_CONFIG) {
            Self::from_base64(&encoded)?
        } else {
            Self::default()
        };
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("reading config file {}: {e}", path.display()))
        })?;
        Self::from_json(&raw)
    }

    pub fn from_base64(encoded: &str) -> Result<Self> {
        let decoded = BASE64_STANDARD
            .decode(encoded.trim().as_bytes())
            .map_err(|e| Error::Config(format!("decoding {ENV_CONFIG}: {e}")))?;
        let raw = String::from_utf8(decoded)
            .map_err(|e| Error::Config(format!("{ENV_CONFIG} is not utf-8: {e}")))?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(|e| Error::Config(format!("parsing config: {e}")))
    }

    pub fn validate(&self) -> Result<()> {
        if self.concurrent_writes.0 == 0 {
            return Err(Error::Config("concurrent_writes must be positive".to_string()));
        }
        if self.retry.max_attempts == 0 {
            return Err(Error::Config("retry.max_attempts must be positive".to_string()));
        }
        if self.stats.report_interval_sec == 0 {
            return Err(Error::Config(
                "stats.report_interval_sec must be positive".to_string(),
            ));
        }
        if let SourceConfig::Stdin(stdin) = &self.source
            && stdin.batch_size == 0
        {
            return Err(Error::Config("source batch_size must be positive".to_string()));
        }
        self.target.validate()?;
        self.failure_target.target.validate()?;
        for transform in &self.transform {
            transform.validate()?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct ConcurrentWrites(pub usize);

impl Default for ConcurrentWrites {
    fn default() -> Self {
        Self(DEFAULT_CONCURRENT_WRITES)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceConfig {
    Stdin(StdinConfig),
}

impl Default for SourceConfig {
    fn default() -> Self {
        SourceConfig::Stdin(StdinConfig::default())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StdinConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
}

impl Default for StdinConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            read_timeout_ms: DEFAULT_READ_TIMEOUT_MS,
        }
    }
}

impl StdinConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

/// Builtin targets.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetConfig {
    /// Writes every payload as a log line.
    Log {
        #[serde(default = "default_max_message_size_bytes")]
        max_message_size_bytes: usize,
    },
    /// Appends newline delimited payloads to a file.
    File {
        path: PathBuf,
        #[serde(default = "default_max_message_size_bytes")]
        max_message_size_bytes: usize,
    },
    /// Accepts and discards everything.
    Silent {},
}

impl Default for TargetConfig {
    fn default() -> Self {
        TargetConfig::Log {
            max_message_size_bytes: DEFAULT_MAX_MESSAGE_SIZE_BYTES,
        }
    }
}

impl TargetConfig {
    fn validate(&self) -> Result<()> {
        match self {
            TargetConfig::Log {
                max_message_size_bytes,
            }
            | TargetConfig::File {
                max_message_size_bytes,
                ..
            } if *max_message_size_bytes == 0 => Err(Error::Config(
                "max_message_size_bytes must be positive".to_string(),
            )),
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FailureTargetConfig {
    #[serde(default)]
    pub target: TargetConfig,
    #[serde(default)]
    pub format: FailureFormat,
}

/// How rejected messages are wrapped before they reach the failure target.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureFormat {
    /// Snowplow bad-row self-describing JSON.
    #[default]
    Snowplow,
}

/// One stage of the transformation chain, in the order given.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransformConfig {
    Js(JsEngineConfig),
    Lua(LuaEngineConfig),
    Base64Encode {},
    Base64Decode {},
    SpEnrichedToJson {},
    SpEnrichedSetPk(SpEnrichedSetPkConfig),
    SpEnrichedFilter(SpEnrichedFilterConfig),
    SpEnrichedFilterContext(SpEnrichedFilterContextConfig),
    SpEnrichedFilterUnstructEvent(SpEnrichedFilterUnstructEventConfig),
}

impl TransformConfig {
    fn validate(&self) -> Result<()> {
        match self {
            TransformConfig::Js(cfg) if cfg.timeout_sec == 0 => Err(Error::Config(
                "js transformation timeout_sec must be positive".to_string(),
            )),
            TransformConfig::Lua(cfg) if cfg.timeout_sec == 0 => Err(Error::Config(
                "lua transformation timeout_sec must be positive".to_string(),
            )),
            _ => Ok(()),
        }
    }
}

/// Inline script source, or a path to read it from. Exactly one must be set.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ScriptSource {
    #[serde(default)]
    pub script: Option<String>,
    #[serde(default)]
    pub script_path: Option<PathBuf>,
}

impl ScriptSource {
    pub fn inline(script: impl Into<String>) -> Self {
        Self {
            script: Some(script.into()),
            script_path: None,
        }
    }

    pub fn load(&self) -> Result<String> {
        match (&self.script, &self.script_path) {
            (Some(script), None) => Ok(script.clone()),
            (None, Some(path)) => std::fs::read_to_string(path).map_err(|e| {
                Error::Config(format!("reading script {}: {e}", path.display()))
            }),
            (Some(_), Some(_)) => Err(Error::Config(
                "only one of script and script_path may be set".to_string(),
            )),
            (None, None) => Err(Error::Config(
                "one of script or script_path is required".to_string(),
            )),
        }
    }

    /// Name used for the compiled chunk in error messages.
    pub fn name(&self) -> String {
        self.script_path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "inline".to_string())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct JsEngineConfig {
    #[serde(flatten)]
    pub source: ScriptSource,
    #[serde(default = "default_entrypoint")]
    pub entrypoint: String,
    #[serde(default = "default_js_timeout_sec")]
    pub timeout_sec: u64,
    #[serde(default)]
    pub snowplow_mode: bool,
    #[serde(default)]
    pub remove_nulls: bool,
}

impl JsEngineConfig {
    pub fn new(source: ScriptSource) -> Self {
        Self {
            source,
            entrypoint: DEFAULT_ENTRYPOINT.to_string(),
            timeout_sec: DEFAULT_JS_TIMEOUT_SEC,
            snowplow_mode: false,
            remove_nulls: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LuaEngineConfig {
    #[serde(flatten)]
    pub source: ScriptSource,
    #[serde(default = "default_entrypoint")]
    pub entrypoint: String,
    #[serde(default = "default_lua_timeout_sec")]
    pub timeout_sec: u64,
    /// Restricts the interpreter to the string, table, math and utf8 libraries.
    #[serde(default = "default_true")]
    pub sandbox: bool,
    #[serde(default)]
    pub snowplow_mode: bool,
}

impl LuaEngineConfig {
    pub fn new(source: ScriptSource) -> Self {
        Self {
            source,
            entrypoint: DEFAULT_ENTRYPOINT.to_string(),
            timeout_sec: DEFAULT_LUA_TIMEOUT_SEC,
            sandbox: true,
            snowplow_mode: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SpEnrichedSetPkConfig {
    pub atomic_field: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SpEnrichedFilterConfig {
    pub atomic_field: String,
    pub regex: String,
    #[serde(default)]
    pub filter_action: FilterAction,
}

/// Filters on a field inside every context with the given shredded name, e.g.
/// `contexts_nl_basjes_yauaa_context_1`. The event passes the regex when any value matches.
#[derive(Debug, Clone, Deserialize)]
pub struct SpEnrichedFilterContextConfig {
    pub context_full_name: String,
    pub custom_field_path: String,
    pub regex: String,
    #[serde(default)]
    pub filter_action: FilterAction,
}

/// Filters on a field inside the unstructured event. Events with another name, or a version not
/// matching `unstruct_event_version_regex`, are matched as having no value.
#[derive(Debug, Clone, Deserialize)]
pub struct SpEnrichedFilterUnstructEventConfig {
    pub unstruct_event_name: String,
    #[serde(default = "default_version_regex")]
    pub unstruct_event_version_regex: String,
    pub custom_field_path: String,
    pub regex: String,
    #[serde(default)]
    pub filter_action: FilterAction,
}

fn default_version_regex() -> String {
    ".*".to_string()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterAction {
    /// Keep messages whose field matches, filter the rest.
    #[default]
    Keep,
    /// Filter messages whose field matches.
    Drop,
}

/// Exponential backoff for target writes. The delay doubles every attempt and is stretched by up
/// to 50% jitter.
#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u16,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl RetryConfig {
    pub const FACTOR: f64 = 2.0;
    pub const JITTER: f64 = 0.5;
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StatsConfig {
    /// Length of the reporting window.
    #[serde(default = "default_report_interval_sec")]
    pub report_interval_sec: u64,
    /// How long the observer waits for a result before re-checking the flush deadline.
    #[serde(default = "default_buffer_timeout_ms")]
    pub buffer_timeout_ms: u64,
    /// Port of the prometheus `/metrics` endpoint. `null` disables it.
    #[serde(default = "default_metrics_port")]
    pub metrics_port: Option<u16>,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            report_interval_sec: default_report_interval_sec(),
            buffer_timeout_ms: default_buffer_timeout_ms(),
            metrics_port: default_metrics_port(),
        }
    }
}

impl StatsConfig {
    pub fn report_interval(&self) -> Duration {
        Duration::from_secs(self.report_interval_sec)
    }

    pub fn buffer_timeout(&self) -> Duration {
        Duration::from_millis(self.buffer_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetadataReporterConfig {
    pub endpoint: String,
    #[serde(default)]
    pub tags: HashMap<String, String>,
    #[serde(default = "default_reporter_timeout_sec")]
    pub timeout_sec: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppInfo {
    #[serde(default = "default_app_name")]
    pub name: String,
    #[serde(default = "default_app_version")]
    pub version: String,
}

impl Default for AppInfo {
    fn default() -> Self {
        Self {
            name: default_app_name(),
            version: default_app_version(),
        }
    }
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

fn default_read_timeout_ms() -> u64 {
    DEFAULT_READ_TIMEOUT_MS
}

fn default_max_message_size_bytes() -> usize {
    DEFAULT_MAX_MESSAGE_SIZE_BYTES
}

fn default_entrypoint() -> String {
    DEFAULT_ENTRYPOINT.to_string()
}

fn default_js_timeout_sec() -> u64 {
    DEFAULT_JS_TIMEOUT_SEC
}

fn default_lua_timeout_sec() -> u64 {
    DEFAULT_LUA_TIMEOUT_SEC
}

fn default_true() -> bool {
    true
}

fn default_max_attempts() -> u16 {
    5
}

fn default_initial_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    60_000
}

fn default_report_interval_sec() -> u64 {
    1
}

fn default_buffer_timeout_ms() -> u64 {
    1000
}

fn default_metrics_port() -> Option<u16> {
    Some(DEFAULT_METRICS_PORT)
}

fn default_reporter_timeout_sec() -> u64 {
    DEFAULT_REPORTER_TIMEOUT_SEC
}

fn default_app_name() -> String {
    DEFAULT_APP_NAME.to_string()
}

fn default_app_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}
