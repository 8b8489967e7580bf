//! Task, manager and component configuration
//!
//! All types are serde-serializable; [`ManagerConfig::from_file`] loads TOML, YAML or JSON,
//! detecting the format from the file extension.

use crate::error::{KestrelError, KestrelResult};
use crate::scheduling::{ContinuousMode, SchedulingKind};
use crate::state::MIN_HISTORY;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_STATE_TABLE_SIZE: usize = 256;
pub const DEFAULT_MAILBOX_SIZE: usize = 64;
pub const DEFAULT_INITIALIZATION_TIMEOUT_MS: u64 = 3000;

fn default_state_table_size() -> usize {
    DEFAULT_STATE_TABLE_SIZE
}

fn default_mailbox_size() -> usize {
    DEFAULT_MAILBOX_SIZE
}

fn default_initialization_timeout_ms() -> u64 {
    DEFAULT_INITIALIZATION_TIMEOUT_MS
}

/// Real-time scheduling for a task thread (Linux only)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RealtimeConfig {
    /// SCHED_FIFO priority, 1-99
    pub priority: i32,
    /// CPU core to pin the thread to
    #[serde(default)]
    pub cpu: Option<usize>,
}

/// Configuration of one task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskConfig {
    pub name: String,
    #[serde(default)]
    pub kind: SchedulingKind,
    /// Rows of state table history
    #[serde(default = "default_state_table_size")]
    pub state_table_size: usize,
    /// Capacity of each mailbox
    #[serde(default = "default_mailbox_size")]
    pub mailbox_size: usize,
    #[serde(default)]
    pub realtime: Option<RealtimeConfig>,
    /// How long `create_and_wait`-style helpers wait for READY
    #[serde(default = "default_initialization_timeout_ms")]
    pub initialization_timeout_ms: u64,
    /// Upper bound for blocking calls made through this task's required interfaces
    #[serde(default)]
    pub blocking_timeout_ms: Option<u64>,
}

impl TaskConfig {
    fn with_kind(name: &str, kind: SchedulingKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
            state_table_size: DEFAULT_STATE_TABLE_SIZE,
            mailbox_size: DEFAULT_MAILBOX_SIZE,
            realtime: None,
            initialization_timeout_ms: DEFAULT_INITIALIZATION_TIMEOUT_MS,
            blocking_timeout_ms: None,
        }
    }

    pub fn periodic(name: &str, period: Duration) -> Self {
        Self::with_kind(
            name,
            SchedulingKind::Periodic {
                period_ms: period.as_secs_f64() * 1000.0,
            },
        )
    }

    pub fn continuous(name: &str, mode: ContinuousMode) -> Self {
        Self::with_kind(name, SchedulingKind::Continuous { mode })
    }

    pub fn with_state_table_size(mut self, rows: usize) -> Self {
        self.state_table_size = rows;
        self
    }

    pub fn with_mailbox_size(mut self, capacity: usize) -> Self {
        self.mailbox_size = capacity;
        self
    }

    pub fn with_realtime(mut self, priority: i32, cpu: Option<usize>) -> Self {
        self.realtime = Some(RealtimeConfig { priority, cpu });
        self
    }

    pub fn with_initialization_timeout(mut self, timeout: Duration) -> Self {
        self.initialization_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_blocking_timeout(mut self, timeout: Duration) -> Self {
        self.blocking_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn period(&self) -> Option<Duration> {
        match self.kind {
            SchedulingKind::Periodic { period_ms } => {
                Some(Duration::from_nanos((period_ms.max(0.0) * 1e6).round() as u64))
            }
            SchedulingKind::Continuous { .. } => None,
        }
    }

    pub fn initialization_timeout(&self) -> Duration {
        Duration::from_millis(self.initialization_timeout_ms)
    }

    pub fn blocking_timeout(&self) -> Option<Duration> {
        self.blocking_timeout_ms.map(Duration::from_millis)
    }

    pub fn validate(&self) -> KestrelResult<()> {
        if self.name.is_empty() {
            return Err(KestrelError::config("task name must not be empty"));
        }
        if let SchedulingKind::Periodic { period_ms } = self.kind {
            if period_ms <= 0.0 || !period_ms.is_finite() {
                return Err(KestrelError::config(format!(
                    "task '{}': period must be positive, got {} ms",
                    self.name, period_ms
                )));
            }
        }
        if self.state_table_size < MIN_HISTORY {
            return Err(KestrelError::config(format!(
                "task '{}': state_table_size must be at least {}",
                self.name, MIN_HISTORY
            )));
        }
        if self.mailbox_size == 0 {
            return Err(KestrelError::config(format!(
                "task '{}': mailbox_size must be at least 1",
                self.name
            )));
        }
        if let Some(rt) = &self.realtime {
            if !(1..=99).contains(&rt.priority) {
                return Err(KestrelError::config(format!(
                    "task '{}': real-time priority must be between 1 and 99",
                    self.name
                )));
            }
            if let Some(cpu) = rt.cpu {
                if cpu >= num_cpus::get() {
                    return Err(KestrelError::config(format!(
                        "task '{}': CPU {} does not exist ({} available)",
                        self.name,
                        cpu,
                        num_cpus::get()
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Ordered key/value parameters delivered to `Component::configure`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ComponentParams {
    values: BTreeMap<String, Value>,
}

impl ComponentParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get<T: for<'de> Deserialize<'de>>(&self, key: &str) -> Option<T> {
        let value = self.values.get(key)?;
        serde_json::from_value(value.clone()).ok()
    }

    pub fn get_or<T: for<'de> Deserialize<'de>>(&self, key: &str, default: T) -> T {
        self.get(key).unwrap_or(default)
    }

    pub fn set<T: Serialize>(&mut self, key: &str, value: T) -> KestrelResult<()> {
        self.values
            .insert(key.to_string(), serde_json::to_value(value)?);
        Ok(())
    }

    /// Chainable `set` for building parameters in code
    pub fn with<T: Serialize>(mut self, key: &str, value: T) -> KestrelResult<Self> {
        self.set(key, value)?;
        Ok(self)
    }

    pub fn has(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.values.remove(key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.values.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn as_map(&self) -> &BTreeMap<String, Value> {
        &self.values
    }
}

/// One required-to-provided connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    pub client: String,
    pub required: String,
    pub server: String,
    pub provided: String,
}

impl ConnectionConfig {
    pub fn new(client: &str, required: &str, server: &str, provided: &str) -> Self {
        Self {
            client: client.to_string(),
            required: required.to_string(),
            server: server.to_string(),
            provided: provided.to_string(),
        }
    }
}

/// Component parameters and connections for a whole process
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ManagerConfig {
    #[serde(default)]
    pub components: BTreeMap<String, ComponentParams>,
    #[serde(default)]
    pub connections: Vec<ConnectionConfig>,
}

impl ManagerConfig {
    /// Load from a file, detecting the format from the extension
    pub fn from_file<P: AsRef<Path>>(path: P) -> KestrelResult<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            KestrelError::config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;

        match path.extension().and_then(|s| s.to_str()) {
            Some("toml") => Self::from_toml(&contents),
            Some("yaml") | Some("yml") => Self::from_yaml(&contents),
            Some("json") => Self::from_json(&contents),
            _ => Self::from_toml(&contents)
                .or_else(|_| Self::from_yaml(&contents))
                .or_else(|_| Self::from_json(&contents)),
        }
    }

    pub fn from_toml(contents: &str) -> KestrelResult<Self> {
        toml::from_str(contents)
            .map_err(|e| KestrelError::config(format!("Failed to parse TOML: {}", e)))
    }

    pub fn from_yaml(contents: &str) -> KestrelResult<Self> {
        serde_yaml::from_str(contents)
            .map_err(|e| KestrelError::config(format!("Failed to parse YAML: {}", e)))
    }

    pub fn from_json(contents: &str) -> KestrelResult<Self> {
        serde_json::from_str(contents)
            .map_err(|e| KestrelError::config(format!("Failed to parse JSON: {}", e)))
    }

    pub fn params_for(&self, component: &str) -> Option<&ComponentParams> {
        self.components.get(component)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_config_defaults() {
        let config = TaskConfig::periodic("ctrl", Duration::from_millis(10));
        assert_eq!(config.state_table_size, DEFAULT_STATE_TABLE_SIZE);
        assert_eq!(config.mailbox_size, DEFAULT_MAILBOX_SIZE);
        assert_eq!(config.period(), Some(Duration::from_millis(10)));
        assert_eq!(config.initialization_timeout(), Duration::from_secs(3));
        assert!(config.validate().is_ok());

        let config = TaskConfig::continuous("io", ContinuousMode::FromSignal);
        assert_eq!(config.period(), None);
    }

    #[test]
    fn test_task_config_validation() {
        assert!(TaskConfig::periodic("zero", Duration::ZERO).validate().is_err());
        assert!(TaskConfig::periodic("small", Duration::from_millis(1))
            .with_state_table_size(1)
            .validate()
            .is_err());
        assert!(TaskConfig::periodic("mb", Duration::from_millis(1))
            .with_mailbox_size(0)
            .validate()
            .is_err());
        assert!(TaskConfig::periodic("rt", Duration::from_millis(1))
            .with_realtime(120, None)
            .validate()
            .is_err());
    }

    #[test]
    fn test_task_config_from_yaml() {
        let yaml = r#"
name: arm
kind:
  type: periodic
  period_ms: 5.0
mailbox_size: 16
realtime:
  priority: 80
"#;
        let config: TaskConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.period(), Some(Duration::from_millis(5)));
        assert_eq!(config.mailbox_size, 16);
        assert_eq!(config.state_table_size, DEFAULT_STATE_TABLE_SIZE);
        assert_eq!(config.realtime, Some(RealtimeConfig { priority: 80, cpu: None }));
    }

    #[test]
    fn test_params() {
        let mut params = ComponentParams::new().with("gain", 2.5).unwrap();
        params.set("label", "left").unwrap();
        assert_eq!(params.get::<f64>("gain"), Some(2.5));
        assert_eq!(params.get_or("missing", 7u32), 7);
        assert_eq!(params.get::<u32>("label"), None);
        assert!(params.has("label"));
        assert_eq!(params.keys(), vec!["gain", "label"]);
        assert!(params.remove("gain").is_some());
        assert_eq!(params.len(), 1);
    }

    #[test]
    fn test_manager_config_formats() {
        let toml = r#"
[components.arm]
gain = 1.5

[[connections]]
client = "arm"
required = "Sensor"
server = "camera"
provided = "Frames"
"#;
        let config = ManagerConfig::from_toml(toml).unwrap();
        assert_eq!(config.params_for("arm").unwrap().get::<f64>("gain"), Some(1.5));
        assert_eq!(
            config.connections,
            vec![ConnectionConfig::new("arm", "Sensor", "camera", "Frames")]
        );

        let json = serde_json::to_string(&config).unwrap();
        assert_eq!(ManagerConfig::from_json(&json).unwrap(), config);
        assert!(ManagerConfig::from_toml("components = 3").is_err());
    }
}
