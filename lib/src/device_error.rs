//! Error and warning codes reported by the device in `ERROR_WARN_IND`.

use lazy_static::lazy_static;
use std::{collections::HashMap, fmt};

/// How the engine reacts to a recoverable device error instead of aborting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Recovery {
  /// another update left a different file partially transferred
  ForceUpgrade,
  BatteryLow,
  /// the secondary earbud took over; treated as a pause
  Handover,
  /// the earbuds were not put in the case in time
  CaseTimeout,
}

#[derive(Debug, Clone)]
pub struct DeviceErrorInfo {
  pub name: &'static str,
  /// `None` means the error is fatal for the session
  pub recovery: Option<Recovery>,
}

macro_rules! fatal {
  ($name:expr) => {
    DeviceErrorInfo {
      name: $name,
      recovery: None,
    }
  };
}

lazy_static! {
    /// Known upgrade error codes
    pub static ref DEVICE_ERRORS: HashMap<u16, DeviceErrorInfo> = {
        let mut m = HashMap::new();
        m.insert(0x0010, fatal!("unknown id"));
        m.insert(0x0011, fatal!("bad length"));
        m.insert(0x0012, fatal!("wrong variant"));
        m.insert(0x0013, fatal!("wrong partition number"));
        m.insert(0x0014, fatal!("partition size mismatch"));
        m.insert(0x0015, fatal!("partition type not found"));
        m.insert(0x0016, fatal!("partition open failed"));
        m.insert(0x0017, fatal!("partition write failed"));
        m.insert(0x0018, fatal!("partition close failed"));
        m.insert(0x0019, fatal!("sfs validation failed"));
        m.insert(0x001A, fatal!("oem validation failed"));
        m.insert(0x001B, fatal!("update failed"));
        m.insert(0x001C, fatal!("app not ready"));
        m.insert(0x001D, fatal!("loader error"));
        m.insert(0x001E, fatal!("unexpected loader message"));
        m.insert(0x001F, fatal!("missing loader message"));
        m.insert(0x0021, DeviceErrorInfo {
            name: "battery low",
            recovery: Some(Recovery::BatteryLow),
        });
        m.insert(0x0022, fatal!("invalid sync id"));
        m.insert(0x0023, fatal!("in error state"));
        m.insert(0x0024, fatal!("no memory"));
        m.insert(0x0030, fatal!("bad length in partition parse"));
        m.insert(0x0031, fatal!("data too short"));
        m.insert(0x0032, fatal!("bad upgrade header"));
        m.insert(0x0033, fatal!("bad partition data"));
        m.insert(0x0034, fatal!("bad footer"));
        m.insert(0x0035, fatal!("partition erase failed"));
        m.insert(0x0038, fatal!("file too small"));
        m.insert(0x0039, fatal!("file too big"));
        m.insert(0x0040, fatal!("internal error"));
        m.insert(0x0050, fatal!("peer link failed"));
        m.insert(0x0071, fatal!("secondary earbud not connected"));
        m.insert(0x0072, DeviceErrorInfo {
            name: "handover in progress",
            recovery: Some(Recovery::Handover),
        });
        m.insert(0x0073, DeviceErrorInfo {
            name: "case placement timed out",
            recovery: Some(Recovery::CaseTimeout),
        });
        m.insert(0x0081, DeviceErrorInfo {
            name: "sync id is different",
            recovery: Some(Recovery::ForceUpgrade),
        });
        m
    };
}

/// Raw device error code. Unknown codes are carried as-is and treated as fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceErrorCode(pub u16);

impl DeviceErrorCode {
  pub fn info(&self) -> Option<&'static DeviceErrorInfo> {
    DEVICE_ERRORS.get(&self.0)
  }

  pub fn name(&self) -> &'static str {
    self.info().map(|info| info.name).unwrap_or("unknown")
  }

  pub fn recovery(&self) -> Option<Recovery> {
    self.info().and_then(|info| info.recovery)
  }

  pub fn is_recoverable(&self) -> bool {
    self.recovery().is_some()
  }
}

impl fmt::Display for DeviceErrorCode {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{:#06x} ({})", self.0, self.name())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_recoverable_codes() {
    assert_eq!(DeviceErrorCode(0x0081).recovery(), Some(Recovery::ForceUpgrade));
    assert_eq!(DeviceErrorCode(0x0021).recovery(), Some(Recovery::BatteryLow));
    assert_eq!(DeviceErrorCode(0x0072).recovery(), Some(Recovery::Handover));
    assert_eq!(DeviceErrorCode(0x0073).recovery(), Some(Recovery::CaseTimeout));
    assert_eq!(DEVICE_ERRORS.values().filter(|info| info.recovery.is_some()).count(), 4);
  }

  #[test]
  fn test_unknown_code_is_fatal() {
    let code = DeviceErrorCode(0xBEEF);
    assert!(!code.is_recoverable());
    assert_eq!(code.to_string(), "0xbeef (unknown)");
  }
}
