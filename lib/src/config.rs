use crate::{
  Error, Result, BLE_ACKNOWLEDGED_OVERHEAD, DEFAULT_INITIAL_WINDOW, DEFAULT_MAX_WINDOW, DEFAULT_MESSAGE_SIZE,
  RWCP_INITIAL_TIMEOUT_MS, RWCP_MAX_TIMEOUT_MS, RWCP_MAX_WINDOW,
};
use serde::{Deserialize, Serialize};
use std::{fs::read_to_string, path::Path, time::Duration};

/// Transfer settings chosen by the caller before starting an update.
#[serde_with::skip_serializing_none]
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct UpdateSettings {
  pub requested_message_size: usize,
  pub use_data_length_extension: bool,
  pub use_rwcp: bool,
  pub initial_window: u8,
  pub max_window: u8,
  /// iAP2 only
  pub expect_acks: bool,
  pub rwcp_timeouts: Option<RwcpTimeouts>,
}

impl Default for UpdateSettings {
  fn default() -> Self {
    Self {
      requested_message_size: DEFAULT_MESSAGE_SIZE,
      use_data_length_extension: true,
      use_rwcp: false,
      initial_window: DEFAULT_INITIAL_WINDOW,
      max_window: DEFAULT_MAX_WINDOW,
      expect_acks: false,
      rwcp_timeouts: None,
    }
  }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct RwcpTimeouts {
  pub initial_ms: u64,
  pub max_ms: u64,
}

impl Default for RwcpTimeouts {
  fn default() -> Self {
    Self {
      initial_ms: RWCP_INITIAL_TIMEOUT_MS,
      max_ms: RWCP_MAX_TIMEOUT_MS,
    }
  }
}

impl RwcpTimeouts {
  pub fn initial(&self) -> Duration {
    Duration::from_millis(self.initial_ms)
  }

  pub fn max(&self) -> Duration {
    Duration::from_millis(self.max_ms)
  }
}

impl UpdateSettings {
  /// Parse settings from a JSON document. Missing fields take their defaults.
  pub fn from_json(json: &str) -> Result<Self> {
    let this: UpdateSettings = serde_json::from_str(json)?;
    this.validate()?;
    Ok(this)
  }

  /// Load settings from a JSON file.
  ///
  /// # Parameters
  /// - `path`: [Path] to the settings file
  pub fn from_file(path: &Path) -> Result<Self> {
    let json = read_to_string(path)?;
    Self::from_json(&json)
  }

  pub fn validate(&self) -> Result<()> {
    if self.initial_window == 0 {
      return Err(Error::InvalidSettings("initial window must be at least 1".into()));
    }
    if self.initial_window > self.max_window {
      return Err(Error::InvalidSettings(format!(
        "initial window {} exceeds max window {}",
        self.initial_window, self.max_window
      )));
    }
    if self.max_window > RWCP_MAX_WINDOW {
      return Err(Error::InvalidSettings(format!(
        "max window {} exceeds {RWCP_MAX_WINDOW}",
        self.max_window
      )));
    }
    if self.requested_message_size < BLE_ACKNOWLEDGED_OVERHEAD + 2 {
      return Err(Error::InvalidSettings(format!(
        "requested message size {} leaves no room for data",
        self.requested_message_size
      )));
    }
    if let Some(timeouts) = &self.rwcp_timeouts {
      if timeouts.initial_ms == 0 || timeouts.initial_ms > timeouts.max_ms {
        return Err(Error::InvalidSettings(format!(
          "rwcp timeouts must satisfy 0 < initial ({}) <= max ({})",
          timeouts.initial_ms, timeouts.max_ms
        )));
      }
    }

    Ok(())
  }

  pub fn timeouts(&self) -> RwcpTimeouts {
    self.rwcp_timeouts.unwrap_or_default()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_empty_document_uses_defaults() {
    let settings = UpdateSettings::from_json("{}").expect("Failed to parse empty settings");
    assert_eq!(settings, UpdateSettings::default());
    assert_eq!(settings.requested_message_size, 0xFFFF);
    assert!(settings.use_data_length_extension);
    assert_eq!(settings.timeouts(), RwcpTimeouts::default());
  }

  #[test]
  fn test_windowed_settings() {
    let json = r#"
      {
        "requestedMessageSize": 512,
        "useRwcp": true,
        "initialWindow": 8,
        "maxWindow": 16,
        "rwcpTimeouts": {
          "initialMs": 50
        }
      }
    "#;

    let settings = UpdateSettings::from_json(json).expect("Failed to parse windowed settings");
    assert!(settings.use_rwcp);
    assert_eq!(settings.initial_window, 8);
    assert_eq!(settings.max_window, 16);
    assert_eq!(settings.timeouts().initial(), Duration::from_millis(50));
    assert_eq!(settings.timeouts().max(), Duration::from_millis(2000));
  }

  #[test]
  fn test_serialize_skips_none() {
    let json = serde_json::to_string(&UpdateSettings::default()).unwrap();
    assert!(json.contains("\"requestedMessageSize\":65535"));
    assert!(!json.contains("rwcpTimeouts"));
  }

  #[test]
  #[should_panic]
  fn test_window_larger_than_protocol_allows() {
    UpdateSettings::from_json(r#"{ "maxWindow": 33 }"#).expect("Failed to parse settings");
  }

  #[test]
  fn test_invalid_windows() {
    assert!(UpdateSettings::from_json(r#"{ "initialWindow": 0 }"#).is_err());
    assert!(UpdateSettings::from_json(r#"{ "initialWindow": 20, "maxWindow": 10 }"#).is_err());
    assert!(UpdateSettings::from_json(r#"{ "requestedMessageSize": 12 }"#).is_err());
    assert!(UpdateSettings::from_json(r#"{ "rwcpTimeouts": { "initialMs": 3000 } }"#).is_err());
  }

  #[test]
  fn test_missing_file() {
    let err = UpdateSettings::from_file(Path::new("/definitely/not/here.json")).unwrap_err();
    assert!(matches!(err, Error::IoError(_)));
  }
}
