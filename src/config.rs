//! Scenario configuration: loading, parsing, and validation.
//!
//! Scenarios are JSON documents deserialized into [`ScenarioConfig`]. Every
//! field has a production default, so a scenario file only states what it
//! changes. Validation runs before the simulator is built; configuration
//! problems are the only fatal errors in the whole crate.

use std::fmt;
use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::channel::{Channel, ChannelDistribution, PhyModel};
use crate::lorawan::{self, DeviceClass};

/// Scenario loading or validation failure, fatal at startup.
#[derive(Debug)]
pub enum ConfigError {
    FileRead(String),
    Parse(String),
    Validation(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::FileRead(msg) => write!(f, "failed to read scenario file: {msg}"),
            ConfigError::Parse(msg) => write!(f, "failed to parse scenario JSON: {msg}"),
            ConfigError::Validation(msg) => write!(f, "invalid scenario: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {}

/// When nodes transmit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransmissionMode {
    /// Poisson traffic: exponential inter-arrival with mean `packet_interval`.
    #[default]
    Random,
    /// Fixed period with a uniformly random initial phase.
    Periodic,
}

/// Per-channel overrides; anything omitted keeps the [`Channel`] default.
#[derive(Debug, Clone, Deserialize)]
pub struct ChannelConfig {
    pub frequency_hz: f64,
    pub bandwidth_hz: Option<f64>,
    pub path_loss_exp: Option<f64>,
    pub shadowing_std: Option<f64>,
    pub fast_fading_std: Option<f64>,
    pub fine_fading_std: Option<f64>,
    pub noise_figure_db: Option<f64>,
    pub variable_noise_std: Option<f64>,
    pub capture_threshold_db: Option<f64>,
    pub phy_model: Option<PhyModel>,
}

impl ChannelConfig {
    pub fn new(frequency_hz: f64) -> Self {
        Self {
            frequency_hz,
            bandwidth_hz: None,
            path_loss_exp: None,
            shadowing_std: None,
            fast_fading_std: None,
            fine_fading_std: None,
            noise_figure_db: None,
            variable_noise_std: None,
            capture_threshold_db: None,
            phy_model: None,
        }
    }

    fn build(&self) -> Channel {
        let mut ch = Channel {
            frequency_hz: self.frequency_hz,
            ..Channel::default()
        };
        if let Some(v) = self.bandwidth_hz {
            ch.bandwidth_hz = v;
        }
        if let Some(v) = self.path_loss_exp {
            ch.path_loss_exp = v;
        }
        if let Some(v) = self.shadowing_std {
            ch.shadowing_std = v;
        }
        if let Some(v) = self.fast_fading_std {
            ch.fast_fading_std = v;
        }
        if let Some(v) = self.fine_fading_std {
            ch.fine_fading_std = v;
        }
        if let Some(v) = self.noise_figure_db {
            ch.noise_figure_db = v;
        }
        if let Some(v) = self.variable_noise_std {
            ch.variable_noise_std = v;
        }
        if let Some(v) = self.capture_threshold_db {
            ch.capture_threshold_db = v;
        }
        if let Some(v) = self.phy_model {
            ch.phy_model = v;
        }
        ch
    }
}

/// Complete description of one simulation run.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScenarioConfig {
    pub num_nodes: usize,
    pub num_gateways: usize,
    /// Side of the square deployment area (m).
    pub area_size: f64,
    pub transmission_mode: TransmissionMode,
    /// Mean (Random) or fixed (Periodic) spacing between uplinks (s).
    pub packet_interval: f64,
    /// Total uplink budget across all nodes; 0 means unbounded.
    pub packets_to_send: u64,
    pub adr_node: bool,
    pub adr_server: bool,
    /// Airtime fraction per hour, e.g. 0.01 for 1%. Absent disables the cap.
    pub duty_cycle: Option<f64>,
    pub mobility: bool,
    /// (min, max) node speed in m/s.
    pub mobility_speed: (f64, f64),
    /// Seconds between mobility steps.
    pub mobility_step: f64,
    pub channels: Vec<ChannelConfig>,
    pub channel_distribution: ChannelDistribution,
    /// Start every node at this SF instead of drawing uniformly from 7..=12.
    pub fixed_sf: Option<u8>,
    pub fixed_tx_power: Option<f64>,
    pub battery_capacity_j: Option<f64>,
    pub payload_size_bytes: usize,
    pub device_class: DeviceClass,
    pub nb_trans: u8,
    /// Enable the LoRaWAN security path (frames, MICs, OTAA activation).
    pub security: bool,
    /// Attach a join server and register every device with it.
    pub with_join_server: bool,
    pub join_eui: u64,
    pub net_id: u32,
    pub seed: Option<u64>,
    pub max_steps: Option<u64>,
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        Self {
            num_nodes: 10,
            num_gateways: 1,
            area_size: 1000.0,
            transmission_mode: TransmissionMode::Random,
            packet_interval: 60.0,
            packets_to_send: 0,
            adr_node: false,
            adr_server: false,
            duty_cycle: Some(0.01),
            mobility: true,
            mobility_speed: (2.0, 10.0),
            mobility_step: 1.0,
            channels: vec![ChannelConfig::new(868.1e6)],
            channel_distribution: ChannelDistribution::RoundRobin,
            fixed_sf: None,
            fixed_tx_power: None,
            battery_capacity_j: None,
            payload_size_bytes: 20,
            device_class: DeviceClass::A,
            nb_trans: 1,
            security: false,
            with_join_server: false,
            join_eui: 0x70B3_D57E_D000_0000,
            net_id: 0,
            seed: None,
            max_steps: None,
        }
    }
}

impl ScenarioConfig {
    /// A fully deterministic baseline: one quiet channel, no duty cycle, no
    /// mobility, fixed seed. The starting point for tests and regression
    /// scenarios.
    pub fn deterministic() -> Self {
        let mut channel = ChannelConfig::new(868.1e6);
        channel.shadowing_std = Some(0.0);
        Self {
            duty_cycle: None,
            mobility: false,
            channels: vec![channel],
            seed: Some(1),
            ..Self::default()
        }
    }

    /// Load a scenario from a JSON file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let data = fs::read_to_string(path)
            .map_err(|err| ConfigError::FileRead(format!("{}: {err}", path.display())))?;
        let config: Self =
            serde_json::from_str(&data).map_err(|err| ConfigError::Parse(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check every cross-field constraint. Called by `Simulator::new`.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Validation(msg));
        if self.num_nodes == 0 {
            return invalid("num_nodes must be at least 1".into());
        }
        if self.num_gateways == 0 {
            return invalid("num_gateways must be at least 1".into());
        }
        if self.area_size <= 0.0 {
            return invalid(format!("area_size must be positive, got {}", self.area_size));
        }
        if self.packet_interval <= 0.0 {
            return invalid(format!(
                "packet_interval must be positive, got {}",
                self.packet_interval
            ));
        }
        if let Some(sf) = self.fixed_sf {
            if !(7..=12).contains(&sf) {
                return invalid(format!("fixed_sf must be in 7..=12, got {sf}"));
            }
        }
        if let Some(power) = self.fixed_tx_power {
            if !(lorawan::TX_MIN_DBM..=lorawan::TX_MAX_DBM).contains(&power) {
                return invalid(format!(
                    "fixed_tx_power must be in {}..={} dBm, got {power}",
                    lorawan::TX_MIN_DBM,
                    lorawan::TX_MAX_DBM
                ));
            }
        }
        if let Some(duty) = self.duty_cycle {
            if duty <= 0.0 || duty > 1.0 {
                return invalid(format!("duty_cycle must be in (0, 1], got {duty}"));
            }
        }
        if self.channels.is_empty() {
            return invalid("at least one channel is required".into());
        }
        for ch in &self.channels {
            if ch.frequency_hz <= 0.0 {
                return invalid(format!(
                    "channel frequency must be positive, got {}",
                    ch.frequency_hz
                ));
            }
        }
        if self.payload_size_bytes == 0 {
            return invalid("payload_size_bytes must be positive".into());
        }
        if self.nb_trans == 0 || self.nb_trans > 15 {
            return invalid(format!("nb_trans must be in 1..=15, got {}", self.nb_trans));
        }
        if self.mobility {
            let (min, max) = self.mobility_speed;
            if min <= 0.0 || max < min {
                return invalid(format!(
                    "mobility_speed must satisfy 0 < min <= max, got ({min}, {max})"
                ));
            }
            if self.mobility_step <= 0.0 {
                return invalid("mobility_step must be positive".into());
            }
        }
        if let Some(battery) = self.battery_capacity_j {
            if battery <= 0.0 {
                return invalid(format!("battery_capacity_j must be positive, got {battery}"));
            }
        }
        Ok(())
    }

    /// Materialize the channel set.
    pub fn build_channels(&self) -> Vec<Channel> {
        self.channels.iter().map(ChannelConfig::build).collect()
    }
}
