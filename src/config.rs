// =============================================================================
// Operational Settings — hot-reloadable preferences with atomic save
// =============================================================================
//
// Small key/value preferences for the engine: target symbols, board-lock
// timeout, and the active strategy slot.  Strategy scripts themselves are
// plain text blobs stored one file per slot under the data directory.
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash.  All fields carry `#[serde(default)]` so that adding new fields
// never breaks loading an older settings file.
// =============================================================================

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

/// Number of strategy-script slots available.
pub const SCRIPT_SLOTS: usize = 4;

/// Placeholder script written into a slot that has never been saved.
const DEFAULT_SCRIPT: &str = r#"out["Price:SMA 20"] = sma(closes, 20);"#;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_symbols() -> Vec<String> {
    vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()]
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

// =============================================================================
// BoardLock
// =============================================================================

/// How long the board may sit idle before it locks itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BoardLockTimeout {
    #[default]
    Never,
    #[serde(rename = "10_SECOND")]
    TenSeconds,
    #[serde(rename = "1_MINUTE")]
    OneMinute,
    #[serde(rename = "10_MINUTE")]
    TenMinutes,
    #[serde(rename = "1_HOUR")]
    OneHour,
}

impl BoardLockTimeout {
    /// Idle seconds after which the board locks, or `None` for never.
    pub fn idle_secs(&self) -> Option<u64> {
        match self {
            BoardLockTimeout::Never => None,
            BoardLockTimeout::TenSeconds => Some(10),
            BoardLockTimeout::OneMinute => Some(60),
            BoardLockTimeout::TenMinutes => Some(600),
            BoardLockTimeout::OneHour => Some(3600),
        }
    }
}

// =============================================================================
// Settings
// =============================================================================

/// Operational preferences persisted across sessions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Symbols the engine ingests and computes indicators for.
    #[serde(default = "default_symbols")]
    pub target_symbols: Vec<String>,

    /// Idle timeout after which the board locks.
    #[serde(default)]
    pub board_lock: BoardLockTimeout,

    /// Active strategy-script slot (0-based).
    #[serde(default)]
    pub strategy_slot: usize,

    /// Root directory for persisted candle tables and script slots.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            target_symbols: default_symbols(),
            board_lock: BoardLockTimeout::Never,
            strategy_slot: 0,
            data_dir: default_data_dir(),
        }
    }
}

impl Settings {
    /// Load settings from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read settings from {}", path.display()))?;

        let settings: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse settings from {}", path.display()))?;

        info!(
            path = %path.display(),
            symbols = ?settings.target_symbols,
            "settings loaded"
        );

        Ok(settings)
    }

    /// Persist the current settings to `path` using an atomic write (write to
    /// `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content =
            serde_json::to_string_pretty(self).context("failed to serialise settings to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp settings to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp settings to {}", path.display()))?;

        info!(path = %path.display(), "settings saved (atomic)");
        Ok(())
    }

    fn script_path(&self, slot: usize) -> PathBuf {
        self.data_dir.join(format!("strategy_{slot}.rhai"))
    }

    /// Read the script text stored in `slot`, falling back to a minimal
    /// sample when the slot has never been saved.
    pub fn load_script(&self, slot: usize) -> Result<String> {
        anyhow::ensure!(slot < SCRIPT_SLOTS, "script slot {slot} out of range");
        let path = self.script_path(slot);
        if path.is_file() {
            std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read script slot from {}", path.display()))
        } else {
            Ok(DEFAULT_SCRIPT.to_string())
        }
    }

    /// Write `text` into `slot` atomically.
    pub fn save_script(&self, slot: usize, text: &str) -> Result<()> {
        anyhow::ensure!(slot < SCRIPT_SLOTS, "script slot {slot} out of range");
        std::fs::create_dir_all(&self.data_dir)
            .with_context(|| format!("failed to create {}", self.data_dir.display()))?;

        let path = self.script_path(slot);
        let tmp_path = path.with_extension("rhai.tmp");
        std::fs::write(&tmp_path, text)
            .with_context(|| format!("failed to write tmp script to {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, &path)
            .with_context(|| format!("failed to rename tmp script to {}", path.display()))?;
        Ok(())
    }
}

/// API credentials.  The secret is never logged or serialised.
#[derive(Clone, Default)]
pub struct ApiKeys {
    pub api_key: String,
    pub secret: String,
}

impl ApiKeys {
    /// Load keys from the environment (`MERIDIAN_API_KEY` /
    /// `MERIDIAN_API_SECRET`), defaulting to empty strings so that public
    /// endpoints keep working without credentials.
    pub fn from_env() -> Self {
        Self {
            api_key: std::env::var("MERIDIAN_API_KEY").unwrap_or_default(),
            secret: std::env::var("MERIDIAN_API_SECRET").unwrap_or_default(),
        }
    }
}

impl std::fmt::Debug for ApiKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiKeys")
            .field("api_key", &"<redacted>")
            .field("secret", &"<redacted>")
            .finish()
    }
}
