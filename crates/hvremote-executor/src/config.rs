//! Executor configuration.

use std::{fmt, time::Duration};

use hvremote_transport::UploadConfig;
use serde::{Deserialize, Serialize};

/// Credentials of the principal elevated scripts run as.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Elevation {
    pub user: String,
    pub password: String,
}

impl Elevation {
    /// Create elevation credentials.
    #[must_use]
    pub fn new(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Elevation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Elevation")
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Script executor configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Remote directory uploaded scripts are written to.
    pub script_dir: String,
    /// Upload limits and temp directory.
    pub upload: UploadConfig,
    /// Run every script through a scheduled task as this principal.
    pub elevation: Option<Elevation>,
    /// Delay between status polls of an elevated task.
    #[serde(with = "hvremote_core::duration_secs")]
    pub poll_interval: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            script_dir: "%TEMP%".to_string(),
            upload: UploadConfig::default(),
            elevation: None,
            poll_interval: Duration::from_secs(1),
        }
    }
}

impl ExecutorConfig {
    /// Set the script directory.
    #[must_use]
    pub fn script_dir(mut self, dir: impl Into<String>) -> Self {
        self.script_dir = dir.into();
        self
    }

    /// Set the upload configuration.
    #[must_use]
    pub fn upload(mut self, upload: UploadConfig) -> Self {
        self.upload = upload;
        self
    }

    /// Elevate every script.
    #[must_use]
    pub fn elevation(mut self, elevation: Elevation) -> Self {
        self.elevation = Some(elevation);
        self
    }

    /// Set the elevated task poll interval.
    #[must_use]
    pub const fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// A unique, unresolved path for an uploaded script.
    #[must_use]
    pub fn script_path(&self) -> String {
        format!(
            "{}\\hvremote-{}.ps1",
            self.script_dir.trim_end_matches('\\'),
            uuid::Uuid::new_v4().simple()
        )
    }
}
