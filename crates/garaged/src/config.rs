//! TOML config file loading and validation: pin wiring, input polarity and
//! every controller timing.
//!
//! All fields have defaults matching the stock garage wiring, so an empty
//! file (or no file at all) yields a working configuration.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use crate::board::{Edge, Pull};

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub log_path: PathBuf,
    pub trace_path: Option<PathBuf>,
    pub reboot_command: Vec<String>,
    pub pins: PinsEntry,
    pub timing: TimingEntry,
}

/// BCM pin numbers and polarity of each role.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PinsEntry {
    pub relay: i64,
    pub internal_led: i64,
    pub external_led: i64,
    pub button: i64,
    pub gate: i64,
    pub relay_active_low: bool,
    pub button_active_low: bool,
    pub gate_active_low: bool,
    /// Bias applied to both inputs.
    pub input_pull: Pull,
    /// Which input edges schedule a debounce check.
    pub input_edge: Edge,
}

/// Every controller timing, in milliseconds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TimingEntry {
    pub react_delay_ms: i64,
    pub blink_on_ms: i64,
    pub blink_off_ms: i64,
    pub final_off_timeout_ms: i64,
    pub almost_off_blink_ms: i64,
    pub light_too_long_ms: i64,
    pub halt_hold_ms: i64,
    pub continue_hold_ms: i64,
    pub write_stats_ms: i64,
    pub display_time_left_ms: i64,
    pub display_blink_on_ms: i64,
    pub display_blink_off_ms: i64,
    pub display_period_ms: i64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_path: PathBuf::from("/var/log/garaged.log"),
            trace_path: None,
            reboot_command: vec!["reboot".to_string()],
            pins: PinsEntry::default(),
            timing: TimingEntry::default(),
        }
    }
}

impl Default for PinsEntry {
    fn default() -> Self {
        Self {
            relay: 25,
            internal_led: 5,
            external_led: 19,
            button: 0,
            gate: 1,
            relay_active_low: false,
            button_active_low: true,
            gate_active_low: true,
            input_pull: Pull::Off,
            input_edge: Edge::Both,
        }
    }
}

impl Default for TimingEntry {
    fn default() -> Self {
        Self {
            react_delay_ms: 100,
            blink_on_ms: 500,
            blink_off_ms: 1_500,
            final_off_timeout_ms: 12_000,
            almost_off_blink_ms: 300,
            light_too_long_ms: 20 * 60 * 1_000,
            halt_hold_ms: 7_000,
            continue_hold_ms: 1_200,
            write_stats_ms: 4 * 60 * 60 * 1_000,
            display_time_left_ms: 2_700,
            display_blink_on_ms: 70,
            display_blink_off_ms: 250,
            display_period_ms: 4 * 60 * 1_000,
        }
    }
}

// ---------------------------------------------------------------------------
// Runtime views
// ---------------------------------------------------------------------------

/// Controller timings as `Duration`s.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Timings {
    /// Debounce delay between an input edge and the re-check.
    pub react_delay: Duration,
    pub blink_on: Duration,
    pub blink_off: Duration,
    /// How long the light stays in AlmostOff before switching off.
    pub final_off_timeout: Duration,
    pub almost_off_blink: Duration,
    /// How long the light stays On before entering AlmostOff.
    pub light_too_long: Duration,
    /// Button hold that triggers a reboot.
    pub halt_hold: Duration,
    /// Holds longer than this restart the light timer instead of toggling.
    pub continue_hold: Duration,
    pub write_stats: Duration,
    pub display_time_left: Duration,
    pub display_blink_on: Duration,
    pub display_blink_off: Duration,
    /// One countdown tick.
    pub display_period: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        TimingEntry::default().to_timings()
    }
}

/// BCM pin assignment and polarity, validated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PinMap {
    pub relay: u8,
    pub internal_led: u8,
    pub external_led: u8,
    pub button: u8,
    pub gate: u8,
    pub relay_active_low: bool,
    pub button_active_low: bool,
    pub gate_active_low: bool,
    pub input_pull: Pull,
    pub input_edge: Edge,
}

impl Default for PinMap {
    fn default() -> Self {
        PinsEntry::default().to_pin_map()
    }
}

fn ms(v: i64) -> Duration {
    Duration::from_millis(v.max(0) as u64)
}

impl TimingEntry {
    pub fn to_timings(&self) -> Timings {
        Timings {
            react_delay: ms(self.react_delay_ms),
            blink_on: ms(self.blink_on_ms),
            blink_off: ms(self.blink_off_ms),
            final_off_timeout: ms(self.final_off_timeout_ms),
            almost_off_blink: ms(self.almost_off_blink_ms),
            light_too_long: ms(self.light_too_long_ms),
            halt_hold: ms(self.halt_hold_ms),
            continue_hold: ms(self.continue_hold_ms),
            write_stats: ms(self.write_stats_ms),
            display_time_left: ms(self.display_time_left_ms),
            display_blink_on: ms(self.display_blink_on_ms),
            display_blink_off: ms(self.display_blink_off_ms),
            display_period: ms(self.display_period_ms),
        }
    }

    fn named(&self) -> [(&'static str, i64); 13] {
        [
            ("react_delay_ms", self.react_delay_ms),
            ("blink_on_ms", self.blink_on_ms),
            ("blink_off_ms", self.blink_off_ms),
            ("final_off_timeout_ms", self.final_off_timeout_ms),
            ("almost_off_blink_ms", self.almost_off_blink_ms),
            ("light_too_long_ms", self.light_too_long_ms),
            ("halt_hold_ms", self.halt_hold_ms),
            ("continue_hold_ms", self.continue_hold_ms),
            ("write_stats_ms", self.write_stats_ms),
            ("display_time_left_ms", self.display_time_left_ms),
            ("display_blink_on_ms", self.display_blink_on_ms),
            ("display_blink_off_ms", self.display_blink_off_ms),
            ("display_period_ms", self.display_period_ms),
        ]
    }
}

impl PinsEntry {
    pub fn to_pin_map(&self) -> PinMap {
        PinMap {
            relay: self.relay as u8,
            internal_led: self.internal_led as u8,
            external_led: self.external_led as u8,
            button: self.button as u8,
            gate: self.gate as u8,
            relay_active_low: self.relay_active_low,
            button_active_low: self.button_active_low,
            gate_active_low: self.gate_active_low,
            input_pull: self.input_pull,
            input_edge: self.input_edge,
        }
    }

    fn named(&self) -> [(&'static str, i64); 5] {
        [
            ("relay", self.relay),
            ("internal_led", self.internal_led),
            ("external_led", self.external_led),
            ("button", self.button),
            ("gate", self.gate),
        ]
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Highest BCM GPIO exposed on the Raspberry Pi 40-pin header.  GPIO 0-1
/// (ID EEPROM) are allowed: the stock wiring uses them for the inputs.
const MAX_BCM_PIN: i64 = 27;

impl Config {
    /// Validate all entries. Returns `Ok(())` or an error describing every
    /// violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_general(&mut errors);
        self.validate_pins(&mut errors);
        self.validate_timing(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_general(&self, errors: &mut Vec<String>) {
        if self.log_path.as_os_str().is_empty() {
            errors.push("log_path is empty".to_string());
        }
        match self.reboot_command.first() {
            None => errors.push("reboot_command is empty".to_string()),
            Some(program) if program.trim().is_empty() => {
                errors.push("reboot_command program is empty".to_string())
            }
            Some(_) => {}
        }
        if let Some(p) = &self.trace_path {
            if p.as_os_str().is_empty() {
                errors.push("trace_path is empty (omit it to disable tracing)".to_string());
            }
        }
    }

    fn validate_pins(&self, errors: &mut Vec<String>) {
        let mut seen: HashSet<i64> = HashSet::new();
        for (role, pin) in self.pins.named() {
            if !(0..=MAX_BCM_PIN).contains(&pin) {
                errors.push(format!(
                    "pins.{role}: {pin} is not a valid BCM GPIO pin (allowed: 0-{MAX_BCM_PIN})"
                ));
            } else if !seen.insert(pin) {
                errors.push(format!(
                    "pins.{role}: gpio {pin} is already used by another role"
                ));
            }
        }
    }

    fn validate_timing(&self, errors: &mut Vec<String>) {
        let t = &self.timing;
        for (name, value) in t.named() {
            if value <= 0 {
                errors.push(format!("timing.{name} must be positive, got {value}"));
            }
        }

        // A hold must be able to finish as a "continue" before it reboots.
        if t.continue_hold_ms > 0 && t.halt_hold_ms > 0 && t.continue_hold_ms >= t.halt_hold_ms {
            errors.push(format!(
                "timing.continue_hold_ms ({}) must be less than halt_hold_ms ({})",
                t.continue_hold_ms, t.halt_hold_ms
            ));
        }
    }

    pub fn timings(&self) -> Timings {
        self.timing.to_timings()
    }

    pub fn pin_map(&self) -> PinMap {
        self.pins.to_pin_map()
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML config file.
pub fn load(path: &str) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    let config: Config =
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?;
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

/// Load `explicit` if given (mandatory), otherwise `fallback` if it exists,
/// otherwise built-in defaults.
pub fn load_or_default(explicit: Option<&str>, fallback: &str) -> Result<Config> {
    if let Some(path) = explicit {
        return load(path);
    }
    if std::path::Path::new(fallback).exists() {
        return load(fallback);
    }
    tracing::info!(path = fallback, "no config file, using built-in defaults");
    Ok(Config::default())
}

// ===========================================================================
// Tests
// ===========================================================================
