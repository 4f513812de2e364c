//! Integration tests for configuration files
//!
//! Covers loading, saving and validating `driver.toml`:
//! - Full and partial files
//! - Save/load through a real file
//! - Invalid values rejected at load time

use driver::config::{DriverConfig, load_config};
use std::fs;
use std::time::Duration;
use tempfile::tempdir;

const FULL_CONFIG: &str = r#"
[driver]
log_level = "debug"
service_mode = true

[usb]
vendor_id = "0x04b4"
product_id = "0x4000"
interface = 1
max_boards = 32
rescan_interval_ms = 500

[transfer]
read_wait_ms = 0
cancel_settle_ms = 2
cancel_timeout_ms = 250
slice_timeout_ms = 20
transfer_timeout_ms = 3000
write_buffer_len = 2048

[reset]
step_delay_ms = 15
busy_backoff_ms = 30
fill_byte = 7
packet_len = 64
ack_byte = 11
"#;

#[test]
fn test_load_full_config() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("driver.toml");
    fs::write(&path, FULL_CONFIG).unwrap();

    let config = DriverConfig::load(Some(path)).unwrap();

    assert_eq!(config.driver.log_level, "debug");
    assert!(config.driver.service_mode);
    assert_eq!(config.usb.interface, 1);
    assert_eq!(config.usb.max_boards, 32);
    assert_eq!(config.transfer.transfer_timeout_ms, Some(3000));

    let options = config.device_options();
    assert!(options.read_wait.is_zero());
    assert_eq!(options.cancel_timeout, Duration::from_millis(250));
    assert_eq!(options.write_buffer_len, 2048);
    assert_eq!(options.reset.packet_len, 64);
    assert_eq!(options.reset.busy_backoff, Duration::from_millis(30));

    let settings = config.manager_settings().unwrap();
    assert_eq!(settings.filter.interface, 1);
    assert_eq!(settings.timing.slice_timeout, Duration::from_millis(20));
    assert_eq!(settings.rescan_interval, Duration::from_millis(500));
}

#[test]
fn test_save_and_reload() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("nested").join("driver.toml");

    let mut config = DriverConfig::default();
    config.usb.product_id = "0x4001".to_string();
    config.transfer.read_wait_ms = 25;
    config.save(&path).unwrap();

    let loaded = DriverConfig::load(Some(path)).unwrap();
    assert_eq!(loaded.usb.product_id, "0x4001");
    assert_eq!(loaded.transfer.read_wait_ms, 25);
    assert_eq!(loaded.reset.ack_byte, 0x0b);
}

#[test]
fn test_empty_file_is_all_defaults() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("driver.toml");
    fs::write(&path, "").unwrap();

    let config = load_config(path.to_str().unwrap()).unwrap();
    assert_eq!(config.driver.log_level, "info");
    assert_eq!(config.usb.vendor_id, "0x04b4");
    assert_eq!(config.usb.max_boards, 99);
}

#[test]
fn test_invalid_values_rejected() {
    let dir = tempdir().unwrap();
    let cases = [
        "[usb]\nvendor_id = \"04b4\"\nproduct_id = \"0x4000\"\n",
        "[usb]\nvendor_id = \"0x04b4\"\nproduct_id = \"0x4000\"\nmax_boards = 0\n",
        "[transfer]\nslice_timeout_ms = 0\n",
        "[reset]\npacket_len = 4096\n",
        "[driver]\nlog_level = \"chatty\"\n",
        "[reset]\nfill_byte = 300\n",
    ];

    for (i, content) in cases.iter().enumerate() {
        let path = dir.path().join(format!("bad{}.toml", i));
        fs::write(&path, content).unwrap();
        assert!(
            DriverConfig::load(Some(path)).is_err(),
            "case {} should be rejected",
            i
        );
    }
}

#[test]
fn test_missing_file() {
    let dir = tempdir().unwrap();
    assert!(DriverConfig::load(Some(dir.path().join("absent.toml"))).is_err());
}
