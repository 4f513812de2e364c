//! Driver configuration management

use crate::usb::device::DeviceOptions;
use crate::usb::manager::ManagerSettings;
use crate::usb::probe::BoardFilter;
use crate::usb::reset::ResetSequence;
use crate::usb::transfers::TransferTiming;
use anyhow::{Context, Result, anyhow};
use protocol::{ENCDAC_RESET, ENCDAC_RESET_ACK, MAX_BOARDS, USB_MAX_OUT_LEN};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DriverConfig {
    #[serde(default)]
    pub driver: DriverSettings,
    #[serde(default)]
    pub usb: UsbSettings,
    #[serde(default)]
    pub transfer: TransferSettings,
    #[serde(default)]
    pub reset: ResetSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverSettings {
    pub log_level: String,
    #[serde(default)]
    pub service_mode: bool,
}

impl Default for DriverSettings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            service_mode: false,
        }
    }
}

/// Which boards to drive
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsbSettings {
    /// Vendor id as hex, e.g. "0x04b4"
    pub vendor_id: String,
    /// Product id as hex, e.g. "0x4000"
    pub product_id: String,
    #[serde(default)]
    pub interface: u8,
    /// Registry capacity; serials must be below this
    #[serde(default = "UsbSettings::default_max_boards")]
    pub max_boards: usize,
    /// Bus rescan period when libusb lacks hot-plug support
    #[serde(default = "UsbSettings::default_rescan_interval")]
    pub rescan_interval_ms: u64,
}

impl Default for UsbSettings {
    fn default() -> Self {
        Self {
            vendor_id: "0x04b4".to_string(),
            product_id: "0x4000".to_string(),
            interface: 0,
            max_boards: Self::default_max_boards(),
            rescan_interval_ms: Self::default_rescan_interval(),
        }
    }
}

impl UsbSettings {
    fn default_max_boards() -> usize {
        MAX_BOARDS
    }

    fn default_rescan_interval() -> u64 {
        1000
    }
}

/// Transfer timing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferSettings {
    /// Bounded wait before the first read retrieval poll (0 disables)
    #[serde(default = "TransferSettings::default_read_wait")]
    pub read_wait_ms: u64,
    /// Pause before unlinking a busy channel on release
    #[serde(default = "TransferSettings::default_cancel_settle")]
    pub cancel_settle_ms: u64,
    /// Bound on waiting for unlinked requests to complete
    #[serde(default = "TransferSettings::default_cancel_timeout")]
    pub cancel_timeout_ms: u64,
    /// Length of one blocking bulk call
    #[serde(default = "TransferSettings::default_slice_timeout")]
    pub slice_timeout_ms: u64,
    /// Overall request limit; absent waits until cancelled
    #[serde(default)]
    pub transfer_timeout_ms: Option<u64>,
    /// Per-session write staging buffer
    #[serde(default = "TransferSettings::default_write_buffer_len")]
    pub write_buffer_len: usize,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            read_wait_ms: Self::default_read_wait(),
            cancel_settle_ms: Self::default_cancel_settle(),
            cancel_timeout_ms: Self::default_cancel_timeout(),
            slice_timeout_ms: Self::default_slice_timeout(),
            transfer_timeout_ms: None,
            write_buffer_len: Self::default_write_buffer_len(),
        }
    }
}

impl TransferSettings {
    fn default_read_wait() -> u64 {
        10
    }

    fn default_cancel_settle() -> u64 {
        5
    }

    fn default_cancel_timeout() -> u64 {
        100
    }

    fn default_slice_timeout() -> u64 {
        50
    }

    fn default_write_buffer_len() -> usize {
        1024
    }
}

/// Encoder/DAC reset sequence
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResetSettings {
    #[serde(default = "ResetSettings::default_delay")]
    pub step_delay_ms: u64,
    #[serde(default = "ResetSettings::default_delay")]
    pub busy_backoff_ms: u64,
    #[serde(default = "ResetSettings::default_fill_byte")]
    pub fill_byte: u8,
    #[serde(default = "ResetSettings::default_packet_len")]
    pub packet_len: usize,
    #[serde(default = "ResetSettings::default_ack_byte")]
    pub ack_byte: u8,
}

impl Default for ResetSettings {
    fn default() -> Self {
        Self {
            step_delay_ms: Self::default_delay(),
            busy_backoff_ms: Self::default_delay(),
            fill_byte: Self::default_fill_byte(),
            packet_len: Self::default_packet_len(),
            ack_byte: Self::default_ack_byte(),
        }
    }
}

impl ResetSettings {
    fn default_delay() -> u64 {
        10
    }

    fn default_fill_byte() -> u8 {
        ENCDAC_RESET
    }

    fn default_packet_len() -> usize {
        USB_MAX_OUT_LEN
    }

    fn default_ack_byte() -> u8 {
        ENCDAC_RESET_ACK
    }
}

impl DriverConfig {
    /// Load configuration from the specified path
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            p
        } else {
            // Try standard locations in order
            let candidates = vec![
                Self::default_path(),
                PathBuf::from("/etc/brl-usb/driver.toml"),
            ];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found, using defaults"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: DriverConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        config.validate()?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Load configuration or return defaults if not found
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Failed to load config: {}, using defaults", e);
                Self::default()
            }
        }
    }

    /// Save configuration to the specified path
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::info!("Saved configuration to: {}", path.display());
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("brl-usb").join("driver.toml")
        } else {
            PathBuf::from(".config/brl-usb/driver.toml")
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.driver.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.driver.log_level,
                valid_levels.join(", ")
            ));
        }

        parse_hex_id(&self.usb.vendor_id, "vendor_id")?;
        parse_hex_id(&self.usb.product_id, "product_id")?;

        if !(1..=MAX_BOARDS).contains(&self.usb.max_boards) {
            return Err(anyhow!(
                "Invalid max_boards {}, must be 1-{}",
                self.usb.max_boards,
                MAX_BOARDS
            ));
        }

        if !(1..=USB_MAX_OUT_LEN).contains(&self.reset.packet_len) {
            return Err(anyhow!(
                "Invalid reset packet_len {}, must be 1-{}",
                self.reset.packet_len,
                USB_MAX_OUT_LEN
            ));
        }

        if self.transfer.slice_timeout_ms == 0 {
            return Err(anyhow!("slice_timeout_ms must be greater than 0"));
        }

        Ok(())
    }

    /// Per-board timing and sizing
    pub fn device_options(&self) -> DeviceOptions {
        let transfer = &self.transfer;
        let reset = &self.reset;
        DeviceOptions {
            read_wait: Duration::from_millis(transfer.read_wait_ms),
            cancel_settle: Duration::from_millis(transfer.cancel_settle_ms),
            cancel_timeout: Duration::from_millis(transfer.cancel_timeout_ms),
            write_buffer_len: transfer.write_buffer_len,
            reset: ResetSequence {
                step_delay: Duration::from_millis(reset.step_delay_ms),
                busy_backoff: Duration::from_millis(reset.busy_backoff_ms),
                fill_byte: reset.fill_byte,
                packet_len: reset.packet_len,
                ack_byte: reset.ack_byte,
            },
        }
    }

    /// Discovery settings for the USB worker
    pub fn manager_settings(&self) -> Result<ManagerSettings> {
        Ok(ManagerSettings {
            filter: BoardFilter {
                vendor_id: parse_hex_id(&self.usb.vendor_id, "vendor_id")?,
                product_id: parse_hex_id(&self.usb.product_id, "product_id")?,
                interface: self.usb.interface,
            },
            timing: TransferTiming {
                slice_timeout: Duration::from_millis(self.transfer.slice_timeout_ms),
                transfer_timeout: self.transfer.transfer_timeout_ms.map(Duration::from_millis),
            },
            rescan_interval: Duration::from_millis(self.usb.rescan_interval_ms),
        })
    }
}

/// Parse a hex USB id such as "0x04b4"
fn parse_hex_id(id: &str, name: &str) -> Result<u16> {
    let hex_part = id
        .strip_prefix("0x")
        .or_else(|| id.strip_prefix("0X"))
        .ok_or_else(|| anyhow!("Invalid {} '{}', must start with '0x' (e.g., '0x04b4')", name, id))?;

    if hex_part.is_empty() || hex_part.len() > 4 {
        return Err(anyhow!(
            "Invalid {} '{}', hex part must be 1-4 digits",
            name,
            id
        ));
    }

    u16::from_str_radix(hex_part, 16)
        .map_err(|_| anyhow!("Invalid {} '{}', not a valid hex number", name, id))
}

/// Load from a user-supplied path, expanding `~`
pub fn load_config(path: &str) -> Result<DriverConfig> {
    let path_buf = PathBuf::from(shellexpand::tilde(path).as_ref());
    DriverConfig::load(Some(path_buf))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = DriverConfig::default();
        assert_eq!(config.driver.log_level, "info");
        assert_eq!(config.usb.max_boards, 99);
        assert_eq!(config.transfer.read_wait_ms, 10);
        assert!(config.transfer.transfer_timeout_ms.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_hex_id() {
        assert_eq!(parse_hex_id("0x04b4", "vid").unwrap(), 0x04b4);
        assert_eq!(parse_hex_id("0X4000", "pid").unwrap(), 0x4000);
        assert!(parse_hex_id("04b4", "vid").is_err());
        assert!(parse_hex_id("0x", "vid").is_err());
        assert!(parse_hex_id("0x12345", "vid").is_err());
        assert!(parse_hex_id("0xGHIJ", "vid").is_err());
    }

    #[test]
    fn test_validate_limits() {
        let mut config = DriverConfig::default();
        config.usb.max_boards = 100;
        assert!(config.validate().is_err());

        let mut config = DriverConfig::default();
        config.reset.packet_len = 0;
        assert!(config.validate().is_err());

        let mut config = DriverConfig::default();
        config.transfer.slice_timeout_ms = 0;
        assert!(config.validate().is_err());

        let mut config = DriverConfig::default();
        config.driver.log_level = "loud".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_device_options_conversion() {
        let mut config = DriverConfig::default();
        config.transfer.read_wait_ms = 0;
        config.reset.ack_byte = 0x42;

        let options = config.device_options();
        assert!(options.read_wait.is_zero());
        assert_eq!(options.cancel_timeout, Duration::from_millis(100));
        assert_eq!(options.reset.ack_byte, 0x42);
        assert_eq!(options.reset.fill_byte, 0x07);
    }

    #[test]
    fn test_manager_settings_conversion() {
        let mut config = DriverConfig::default();
        config.transfer.transfer_timeout_ms = Some(2000);

        let settings = config.manager_settings().unwrap();
        assert_eq!(settings.filter.vendor_id, 0x04b4);
        assert_eq!(settings.filter.product_id, 0x4000);
        assert_eq!(
            settings.timing.transfer_timeout,
            Some(Duration::from_secs(2))
        );
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: DriverConfig = toml::from_str(
            r#"
            [usb]
            vendor_id = "0x1234"
            product_id = "0x0001"
            "#,
        )
        .unwrap();

        assert_eq!(config.usb.max_boards, 99);
        assert_eq!(config.driver.log_level, "info");
        assert_eq!(config.reset.packet_len, 512);
    }
}
