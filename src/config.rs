use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Tuning knobs for the cache and sync layer.
///
/// Every field has a default, so a missing config file yields a working
/// configuration. Durations are stored in the unit their name says to keep
/// the YAML surface flat.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Where the store databases live (defaults to the platform data dir).
  pub data_dir: Option<PathBuf>,

  /// Expiry window for the bills store.
  pub bills_expiry_hours: i64,
  /// Expiry window for the favorites side-cache. Favorites change more often
  /// relative to their low volume, so the window is much shorter.
  pub favorites_expiry_minutes: i64,

  /// Rows fetched by the initial "first page" load.
  pub initial_page_size: u64,
  /// Rows per background-fill page.
  pub fill_page_size: u64,
  /// Fill pages in flight at once.
  pub fill_fan_out: usize,
  /// Pause between fill page groups, yielding to the rest of the loop.
  pub fill_pause_ms: u64,

  /// Rows per write batch in `replace_all`.
  pub write_batch_size: usize,
  /// Write batches in flight at once.
  pub write_fan_out: usize,

  /// Remote/local gap beyond which the drift check invalidates.
  pub drift_threshold_minutes: i64,
  /// Minimum interval between drift checks.
  pub drift_check_interval_minutes: i64,
  /// Elapsed time since last recorded exit that starts a new session.
  pub session_gap_minutes: i64,
  /// Rolling window for the periodic forced sync.
  pub forced_sync_hours: i64,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      data_dir: None,
      bills_expiry_hours: 24,
      favorites_expiry_minutes: 30,
      initial_page_size: 1000,
      fill_page_size: 1000,
      fill_fan_out: 3,
      fill_pause_ms: 50,
      write_batch_size: 500,
      write_fan_out: 4,
      drift_threshold_minutes: 60,
      drift_check_interval_minutes: 5,
      session_gap_minutes: 30,
      forced_sync_hours: 24,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./billsync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/billsync/config.yaml
  ///
  /// A cache layer must keep working without a config file, so when nothing
  /// is found the defaults are used.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Ok(Self::default()),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("billsync.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("billsync").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    let config: Config = serde_yaml::from_str(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))?;

    Ok(config)
  }

  /// Resolve the data directory where the store databases live.
  pub fn data_dir(&self) -> Result<PathBuf> {
    if let Some(dir) = &self.data_dir {
      return Ok(dir.clone());
    }

    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("billsync"))
  }

  pub fn bills_db_path(&self) -> Result<PathBuf> {
    Ok(self.data_dir()?.join("bills.db"))
  }

  pub fn favorites_db_path(&self) -> Result<PathBuf> {
    Ok(self.data_dir()?.join("favorites.db"))
  }

  pub fn bills_expiry(&self) -> chrono::Duration {
    chrono::Duration::hours(self.bills_expiry_hours)
  }

  pub fn favorites_expiry(&self) -> chrono::Duration {
    chrono::Duration::minutes(self.favorites_expiry_minutes)
  }

  pub fn drift_threshold(&self) -> chrono::Duration {
    chrono::Duration::minutes(self.drift_threshold_minutes)
  }

  pub fn drift_check_interval(&self) -> chrono::Duration {
    chrono::Duration::minutes(self.drift_check_interval_minutes)
  }

  pub fn session_gap(&self) -> chrono::Duration {
    chrono::Duration::minutes(self.session_gap_minutes)
  }

  pub fn forced_sync_interval(&self) -> chrono::Duration {
    chrono::Duration::hours(self.forced_sync_hours)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn defaults_when_no_file_found() {
    let config = Config::default();
    assert_eq!(config.bills_expiry_hours, 24);
    assert_eq!(config.favorites_expiry_minutes, 30);
    assert_eq!(config.initial_page_size, 1000);
    assert_eq!(config.fill_fan_out, 3);
  }

  #[test]
  fn partial_yaml_fills_in_defaults() {
    let config: Config = serde_yaml::from_str("bills_expiry_hours: 48\n").unwrap();
    assert_eq!(config.bills_expiry_hours, 48);
    assert_eq!(config.favorites_expiry_minutes, 30);
    assert_eq!(config.write_batch_size, 500);
  }
}
