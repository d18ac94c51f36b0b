//! Station settings.
//!
//! A typed, read-only view over the station configuration, loaded through the
//! `config` crate from built-in defaults plus an optional TOML file. Optional
//! sub-flows (LED checking, HID checking, fluorescent-lamp timing, the bench
//! supply metrics sampler) are gated twice: by their own settings keys and by
//! the feature license list checked through [`Settings::supports_feature`].

use crate::error::RigResult;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// All tunables of the station, with defaults matching a stand-alone bench.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Operator-configurable delay (seconds) before work starts. Zero skips
    /// the countdown phase.
    pub program_delay: u64,

    /// Primary feature file directory. Unset is fatal to a run.
    pub feature_path1: Option<String>,
    /// Fallback feature file directory.
    pub feature_path2: Option<String>,
    pub search_timeout1_ms: u64,
    pub search_timeout2_ms: u64,
    pub read_timeout1_ms: u64,
    pub read_timeout2_ms: u64,

    /// Substring marking a feature file as a lighting-driver program.
    pub sol_file_pattern: String,
    /// Substring matched against serial port descriptors when locating the
    /// lighting-driver COM port.
    pub sol_com_pattern: String,
    pub sol_reset: bool,
    pub sol_reset_delay_ms: u64,

    /// Path the synthesized workflow file is written to. Unset is fatal to a
    /// non-lighting-driver run.
    pub workflow_file: Option<String>,
    pub workflow_verify: bool,
    pub workflow_identify_always: bool,
    pub workflow_multi_device: bool,
    pub workflow_check_device_model: bool,
    pub workflow_commission_all: bool,

    pub lpt_enabled: bool,
    pub lpt_file_pattern: String,
    pub lpt_start_timeout_ms: u64,
    pub lpt_read_port: u16,
    pub lpt_read_bit: u8,
    pub lpt_read_inverted: bool,
    pub lpt_write_port: u16,
    pub lpt_write_bit: u8,

    pub service_tag_print: bool,
    pub service_tag_printer: String,
    pub service_tag_label_code: String,

    pub glp2_enabled: bool,
    /// Submit the whole program as one compound instrument command instead of
    /// one command per step.
    pub glp2_all_in_one: bool,
    pub glp2_programming_delay_ms: u64,

    /// Number of LED scan slots enabled on the dashboard; zero disables LED
    /// checking regardless of the license.
    pub leds_enabled: u32,
    pub hids_enabled: u32,

    /// External state resources polled by the fluorescent-lamp monitor, one
    /// per lamp input.
    pub fl_resources: Vec<String>,

    pub prod_line: Option<String>,

    /// Licensed feature names (`glp2`, `sol`, `fl`, `led`, `hid`, `sdp`).
    pub features: Vec<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            program_delay: 0,
            feature_path1: None,
            feature_path2: None,
            search_timeout1_ms: 30_000,
            search_timeout2_ms: 30_000,
            read_timeout1_ms: 30_000,
            read_timeout2_ms: 30_000,
            sol_file_pattern: String::new(),
            sol_com_pattern: String::new(),
            sol_reset: false,
            sol_reset_delay_ms: 2000,
            workflow_file: None,
            workflow_verify: false,
            workflow_identify_always: false,
            workflow_multi_device: false,
            workflow_check_device_model: false,
            workflow_commission_all: false,
            lpt_enabled: false,
            lpt_file_pattern: String::new(),
            lpt_start_timeout_ms: 30_000,
            lpt_read_port: 0x379,
            lpt_read_bit: 5,
            lpt_read_inverted: false,
            lpt_write_port: 0x378,
            lpt_write_bit: 0,
            service_tag_print: false,
            service_tag_printer: String::new(),
            service_tag_label_code: String::new(),
            glp2_enabled: false,
            glp2_all_in_one: false,
            glp2_programming_delay_ms: 0,
            leds_enabled: 0,
            hids_enabled: 0,
            fl_resources: Vec::new(),
            prod_line: None,
            features: Vec::new(),
        }
    }
}

impl Settings {
    /// Load settings from defaults plus an optional TOML file.
    pub fn new(config_path: Option<&str>) -> RigResult<Self> {
        let mut builder = config::Config::builder()
            .add_source(config::Config::try_from(&Settings::default())?);

        if let Some(path) = config_path {
            builder = builder.add_source(config::File::with_name(path));
        }

        let settings: Settings = builder.build()?.try_deserialize()?;
        Ok(settings)
    }

    /// Feature license gate. A disabled feature scopes out its whole sub-flow
    /// even when the matching settings keys are set.
    pub fn supports_feature(&self, name: &str) -> bool {
        self.features.iter().any(|f| f == name)
    }

    pub fn search_timeout(&self, fallback: bool) -> Duration {
        let ms = if fallback {
            self.search_timeout2_ms
        } else {
            self.search_timeout1_ms
        };
        // Sub-100ms timeouts are treated as misconfiguration and widened.
        Duration::from_millis(ms.max(100))
    }

    pub fn read_timeout(&self, fallback: bool) -> Duration {
        let ms = if fallback {
            self.read_timeout2_ms
        } else {
            self.read_timeout1_ms
        };
        Duration::from_millis(ms.max(100))
    }

    pub fn sol_reset_delay(&self) -> Duration {
        Duration::from_millis(self.sol_reset_delay_ms.max(333))
    }

    /// Whether the acquired service tag should be printed after a remote run.
    pub fn should_print_service_tag(&self) -> bool {
        self.service_tag_print
            && !self.service_tag_printer.is_empty()
            && !self.service_tag_label_code.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_load() {
        let settings = Settings::new(None).unwrap();
        assert_eq!(settings.program_delay, 0);
        assert!(!settings.glp2_all_in_one);
        assert!(settings.feature_path1.is_none());
    }

    #[test]
    fn feature_gate() {
        let mut settings = Settings::default();
        assert!(!settings.supports_feature("glp2"));
        settings.features = vec!["glp2".into(), "fl".into()];
        assert!(settings.supports_feature("glp2"));
        assert!(settings.supports_feature("fl"));
        assert!(!settings.supports_feature("sol"));
    }

    #[test]
    fn timeout_floors() {
        let mut settings = Settings::default();
        settings.search_timeout1_ms = 5;
        settings.sol_reset_delay_ms = 10;
        assert_eq!(settings.search_timeout(false), Duration::from_millis(100));
        assert_eq!(settings.sol_reset_delay(), Duration::from_millis(333));
    }

    #[test]
    fn print_gate_requires_printer_and_label() {
        let mut settings = Settings::default();
        settings.service_tag_print = true;
        assert!(!settings.should_print_service_tag());
        settings.service_tag_printer = "zebra1".into();
        settings.service_tag_label_code = "^XA^FD{serviceTag}^XZ".into();
        assert!(settings.should_print_service_tag());
    }
}
