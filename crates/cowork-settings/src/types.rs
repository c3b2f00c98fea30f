//! Settings sections.
//!
//! All sections deserialize with `#[serde(default)]`, so a partial user file
//! only needs the keys it overrides.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings object (`~/.cowork/settings.json`).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CoworkSettings {
    /// Agent subprocess launch settings.
    pub agent: AgentSettings,
    /// Session lifecycle settings.
    pub session: SessionSettings,
    /// Permission tunnel settings.
    pub permissions: PermissionSettings,
    /// Replicated document settings.
    pub document: DocumentSettings,
    /// Logging settings.
    pub logging: LoggingSettings,
}

impl CoworkSettings {
    /// Reject combinations that would make the runtime misbehave.
    pub fn validate(&self) -> Result<()> {
        if self.agent.executable.trim().is_empty() {
            return Err(SettingsError::InvalidValue(
                "agent.executable must not be empty".into(),
            ));
        }
        if self.session.idle_timeout_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "session.idleTimeoutMs must be greater than zero".into(),
            ));
        }
        if self.session.watchdog_interval_ms == 0
            || self.session.watchdog_interval_ms > self.session.idle_timeout_ms
        {
            return Err(SettingsError::InvalidValue(
                "session.watchdogIntervalMs must be in 1..=idleTimeoutMs".into(),
            ));
        }
        if self.permissions.response_timeout_ms == Some(0) {
            return Err(SettingsError::InvalidValue(
                "permissions.responseTimeoutMs must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

/// How the agent subprocess is launched.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentSettings {
    /// Agent CLI executable (name on `PATH` or absolute path).
    pub executable: String,
    /// Model passed to the agent when the caller does not choose one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_model: Option<String>,
    /// Agent permission mode (`default`, `plan`, `acceptEdits`, ...).
    pub permission_mode: String,
    /// Extra arguments appended verbatim.
    pub extra_args: Vec<String>,
    /// Identifier recorded on session records; defaults to the host name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub machine_id: Option<String>,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            executable: "claude".to_string(),
            default_model: None,
            permission_mode: "default".to_string(),
            extra_args: Vec::new(),
            machine_id: None,
        }
    }
}

impl AgentSettings {
    /// Configured machine id, else `$HOSTNAME`, else `"local"`.
    #[must_use]
    pub fn resolved_machine_id(&self) -> String {
        self.machine_id
            .clone()
            .or_else(|| std::env::var("HOSTNAME").ok().filter(|h| !h.is_empty()))
            .unwrap_or_else(|| "local".to_string())
    }
}

/// Session lifecycle timing.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionSettings {
    /// Silence after which a session is failed with `idle timeout`.
    pub idle_timeout_ms: u64,
    /// How often the idle watchdog checks.
    pub watchdog_interval_ms: u64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            idle_timeout_ms: 300_000,
            watchdog_interval_ms: 30_000,
        }
    }
}

impl SessionSettings {
    /// Idle timeout as a `Duration`.
    #[must_use]
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    /// Watchdog period as a `Duration`.
    #[must_use]
    pub fn watchdog_interval(&self) -> Duration {
        Duration::from_millis(self.watchdog_interval_ms)
    }
}

/// Permission tunnel behaviour.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PermissionSettings {
    /// Deny automatically when no decision arrives in time. `None` waits forever.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_timeout_ms: Option<u64>,
    /// Tools allowed without asking.
    pub auto_approve_tools: Vec<String>,
    /// Extra glob patterns whose paths raise risk to high.
    pub protected_paths: Vec<String>,
}

impl Default for PermissionSettings {
    fn default() -> Self {
        Self {
            response_timeout_ms: None,
            auto_approve_tools: vec![
                "Read".to_string(),
                "Glob".to_string(),
                "Grep".to_string(),
                "LS".to_string(),
                "TodoWrite".to_string(),
            ],
            protected_paths: Vec::new(),
        }
    }
}

impl PermissionSettings {
    /// Response timeout as a `Duration`.
    #[must_use]
    pub fn response_timeout(&self) -> Option<Duration> {
        self.response_timeout_ms.map(Duration::from_millis)
    }
}

/// Replicated document settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DocumentSettings {
    /// Schema epoch baked into document ids.
    pub schema_epoch: u32,
}

impl Default for DocumentSettings {
    fn default() -> Self {
        Self { schema_epoch: 1 }
    }
}

/// Logging output.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default filter when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON lines instead of compact text.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
