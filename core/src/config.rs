//! Runtime parameters for the packet engine
//!
//! The engine never owns persistent settings. It reads them through
//! [`ParamStore`], a read-only key/value view, and folds them into typed
//! configuration structs. Every struct has a `Default` holding the firmware
//! defaults, so a missing key is never an error.

use crate::error::{Result, TncError};
use std::collections::HashMap;
use std::time::Duration;

/// Read-only key/value access to stored parameters
pub trait ParamStore {
    fn get_str(&self, key: &str) -> Option<String>;

    fn get_u8(&self, key: &str) -> Option<u8> {
        self.get_str(key).and_then(|v| v.trim().parse().ok())
    }

    fn get_bool(&self, key: &str) -> Option<bool> {
        self.get_str(key)
            .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "on" | "yes"))
    }
}

/// In-memory parameter store
#[derive(Debug, Clone, Default)]
pub struct MemoryParams {
    values: HashMap<String, String>,
}

impl MemoryParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: &str, value: &str) {
        self.values.insert(key.to_string(), value.to_string());
    }

    /// Parse a `KEY=VALUE` assignment
    pub fn set_assignment(&mut self, assignment: &str) -> Result<()> {
        let (key, value) = assignment
            .split_once('=')
            .ok_or_else(|| TncError::InvalidConfig(format!("expected KEY=VALUE, got '{}'", assignment)))?;
        let key = key.trim();
        if key.is_empty() {
            return Err(TncError::InvalidConfig(format!("empty key in '{}'", assignment)));
        }
        self.set(key, value.trim());
        Ok(())
    }
}

impl ParamStore for MemoryParams {
    fn get_str(&self, key: &str) -> Option<String> {
        self.values.get(key).cloned()
    }
}

/// Buffer arena dimensions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArenaConfig {
    /// Number of slots in the pool
    pub slots: usize,
    /// Bytes per slot
    pub slot_size: usize,
}

impl Default for ArenaConfig {
    fn default() -> Self {
        Self {
            slots: 2048,
            slot_size: 32,
        }
    }
}

/// Channel access parameters for the framer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelAccess {
    /// Flags sent before the first frame
    pub txdelay: u8,
    /// Flags sent after the last frame
    pub txtail: u8,
    /// Maximum frames per transmission
    pub max_frames: u8,
    /// p-persistence threshold (0-255)
    pub persistence: u8,
    /// Wait between channel checks
    pub slot_time: Duration,
}

impl Default for ChannelAccess {
    fn default() -> Self {
        Self {
            txdelay: 10,
            txtail: 10,
            max_frames: 2,
            persistence: 80,
            slot_time: Duration::from_millis(100),
        }
    }
}

impl ChannelAccess {
    pub fn from_params(params: &dyn ParamStore) -> Self {
        let dfl = Self::default();
        Self {
            txdelay: params.get_u8("TXDELAY").unwrap_or(dfl.txdelay),
            txtail: params.get_u8("TXTAIL").unwrap_or(dfl.txtail),
            max_frames: params.get_u8("MAXFRAME").unwrap_or(dfl.max_frames).max(1),
            persistence: params.get_u8("PERSISTENCE").unwrap_or(dfl.persistence),
            // SLOTTIME is stored in units of 10 ms
            slot_time: params
                .get_u8("SLOTTIME")
                .map(|t| Duration::from_millis(t as u64 * 10))
                .unwrap_or(dfl.slot_time),
        }
    }
}

/// Own station and default addressing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StationConfig {
    pub mycall: String,
    pub dest: String,
    pub path: String,
}

impl Default for StationConfig {
    fn default() -> Self {
        Self {
            mycall: "NOCALL".to_string(),
            dest: "APAR40".to_string(),
            path: "WIDE1-1".to_string(),
        }
    }
}

impl StationConfig {
    pub fn from_params(params: &dyn ParamStore) -> Self {
        let dfl = Self::default();
        Self {
            mycall: params.get_str("MYCALL").unwrap_or(dfl.mycall),
            dest: params.get_str("DEST").unwrap_or(dfl.dest),
            path: params.get_str("DIGIPATH").unwrap_or(dfl.path),
        }
    }
}

/// Relay (digipeater) policy flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayConfig {
    /// Only react on the WIDE1-1 alias (fill-in digipeater)
    pub wide1_fill_in: bool,
    /// Preempt the path when a SAR alias is present
    pub sar_override: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            wide1_fill_in: true,
            sar_override: false,
        }
    }
}

impl RelayConfig {
    pub fn from_params(params: &dyn ParamStore) -> Self {
        let dfl = Self::default();
        Self {
            wide1_fill_in: params.get_bool("DIGI.WIDE1.on").unwrap_or(dfl.wide1_fill_in),
            sar_override: params.get_bool("DIGI.SAR.on").unwrap_or(dfl.sar_override),
        }
    }
}

/// Receiver tuning
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DemodConfig {
    /// Weight tone energies against their trailing average
    pub auto_balance: bool,
    /// Re-run a receive window through pre/de-emphasis when nothing decoded
    pub retry_filters: bool,
}

impl Default for DemodConfig {
    fn default() -> Self {
        Self {
            auto_balance: false,
            retry_filters: true,
        }
    }
}

impl DemodConfig {
    pub fn from_params(params: &dyn ParamStore) -> Self {
        let dfl = Self::default();
        Self {
            auto_balance: params.get_bool("AFSK.BALANCE.on").unwrap_or(dfl.auto_balance),
            retry_filters: params.get_bool("AFSK.RETRY.on").unwrap_or(dfl.retry_filters),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_without_params() {
        let params = MemoryParams::new();
        assert_eq!(ChannelAccess::from_params(&params), ChannelAccess::default());
        assert_eq!(StationConfig::from_params(&params), StationConfig::default());
        assert_eq!(RelayConfig::from_params(&params), RelayConfig::default());
    }

    #[test]
    fn test_channel_access_from_params() {
        let mut params = MemoryParams::new();
        params.set("TXDELAY", "30");
        params.set("SLOTTIME", "5");
        params.set("MAXFRAME", "0");
        let access = ChannelAccess::from_params(&params);
        assert_eq!(access.txdelay, 30);
        assert_eq!(access.slot_time, Duration::from_millis(50));
        assert_eq!(access.max_frames, 1);
        assert_eq!(access.txtail, 10);
    }

    #[test]
    fn test_bool_params() {
        let mut params = MemoryParams::new();
        params.set("DIGI.SAR.on", "true");
        params.set("DIGI.WIDE1.on", "0");
        let relay = RelayConfig::from_params(&params);
        assert!(relay.sar_override);
        assert!(!relay.wide1_fill_in);
    }

    #[test]
    fn test_assignment_parsing() {
        let mut params = MemoryParams::new();
        params.set_assignment("MYCALL = LA7ECA-9").unwrap();
        assert_eq!(params.get_str("MYCALL").as_deref(), Some("LA7ECA-9"));
        assert!(params.set_assignment("MYCALL").is_err());
        assert!(params.set_assignment("=x").is_err());
    }

    #[test]
    fn test_unparseable_number_falls_back() {
        let mut params = MemoryParams::new();
        params.set("TXTAIL", "lots");
        assert_eq!(ChannelAccess::from_params(&params).txtail, 10);
    }
}
