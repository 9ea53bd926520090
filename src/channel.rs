//! Radio channel definitions and multi-channel distribution.
//!
//! A [`Channel`] bundles every parameter the PHY model needs: modulation
//! constants, propagation/fading standard deviations, receiver noise terms and
//! the per-SF sensitivity table. [`MultiChannel`] owns the channel set and
//! hands channels out to nodes, either round-robin or randomly, honoring the
//! 16-bit LoRaWAN channel mask.

use rand::Rng;
use serde::Deserialize;

use crate::phy::OmnetModel;

/// Which physical-layer flavor drives stochastic terms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PhyModel {
    /// FLoRa-style model: log-distance loss plus independent Gaussian terms.
    #[default]
    Flora,
    /// OMNeT-style model: adds correlated fine fading and slow noise drift.
    Omnet,
}

/// Receiver sensitivity (dBm) at 125 kHz for SF7..=SF12, SX1276 datasheet.
const SENSITIVITY_DBM: [f64; 6] = [-123.0, -126.0, -129.0, -132.0, -134.5, -137.0];

/// One radio channel and its propagation model parameters.
#[derive(Debug, Clone)]
pub struct Channel {
    pub frequency_hz: f64,
    pub bandwidth_hz: f64,
    /// Coding rate index, 1..=4 for 4/5..4/8.
    pub coding_rate: u32,
    pub preamble_symbols: f64,
    pub crc_enabled: bool,
    pub low_data_rate_optimization: bool,

    pub path_loss_exp: f64,
    /// Override for the reference path loss at 1 m; derived from the carrier
    /// frequency when absent.
    pub path_loss_d0: Option<f64>,
    pub system_loss_db: f64,
    pub shadowing_std: f64,
    pub fast_fading_std: f64,
    pub fine_fading_std: f64,
    pub time_variation_std: f64,
    pub tx_power_std: f64,

    pub tx_antenna_gain_db: f64,
    pub rx_antenna_gain_db: f64,
    pub cable_loss_db: f64,

    pub noise_figure_db: f64,
    pub interference_db: f64,
    pub noise_floor_std: f64,
    pub variable_noise_std: f64,

    pub rssi_offset_db: f64,
    pub snr_offset_db: f64,
    pub capture_threshold_db: f64,
    pub frequency_offset_hz: f64,
    pub sync_offset_s: f64,

    pub phy_model: PhyModel,
    pub(crate) omnet: OmnetModel,

    pub(crate) sensitivity_dbm: [f64; 6],
}

impl Default for Channel {
    fn default() -> Self {
        Self {
            frequency_hz: 868.1e6,
            bandwidth_hz: 125_000.0,
            coding_rate: 1,
            preamble_symbols: 8.0,
            crc_enabled: true,
            low_data_rate_optimization: false,
            path_loss_exp: 2.7,
            path_loss_d0: None,
            system_loss_db: 0.0,
            shadowing_std: 6.0,
            fast_fading_std: 0.0,
            fine_fading_std: 0.0,
            time_variation_std: 0.0,
            tx_power_std: 0.0,
            tx_antenna_gain_db: 0.0,
            rx_antenna_gain_db: 0.0,
            cable_loss_db: 0.0,
            noise_figure_db: 6.0,
            interference_db: 0.0,
            noise_floor_std: 0.0,
            variable_noise_std: 0.0,
            rssi_offset_db: 0.0,
            snr_offset_db: 0.0,
            capture_threshold_db: 6.0,
            frequency_offset_hz: 0.0,
            sync_offset_s: 0.0,
            phy_model: PhyModel::Flora,
            omnet: OmnetModel::default(),
            sensitivity_dbm: SENSITIVITY_DBM,
        }
    }
}

impl Channel {
    /// A quiet channel with every stochastic term disabled. Used by tests and
    /// scenarios that need a fully deterministic link.
    pub fn deterministic(frequency_hz: f64) -> Self {
        Self {
            frequency_hz,
            shadowing_std: 0.0,
            ..Self::default()
        }
    }

    /// LoRa symbol duration in seconds: `2^SF / BW`.
    pub fn symbol_time(&self, sf: u8) -> f64 {
        (1u64 << sf) as f64 / self.bandwidth_hz
    }

    /// Receiver sensitivity (dBm) for a spreading factor; out-of-range SFs
    /// report the SF12 floor.
    pub fn sensitivity_dbm(&self, sf: u8) -> f64 {
        let idx = (sf.clamp(7, 12) - 7) as usize;
        self.sensitivity_dbm[idx]
    }

    /// On-air duration of one frame (preamble + header + payload symbols).
    pub fn airtime(&self, sf: u8, payload_bytes: usize) -> f64 {
        let t_sym = self.symbol_time(sf);
        let preamble_time = (self.preamble_symbols + 4.25) * t_sym;

        // N_payload = 8 + max(ceil((8PL - 4SF + 28 + 16CRC - 20IH) / (4(SF - 2DE))) * (CR + 4), 0)
        let sf_f = f64::from(sf);
        let pl = payload_bytes as f64;
        let crc = if self.crc_enabled { 1.0 } else { 0.0 };
        let de = if self.low_data_rate_optimization || t_sym >= 0.016 {
            1.0
        } else {
            0.0
        };
        let ih = 0.0; // explicit header
        let cr = f64::from(self.coding_rate);

        let numerator = 8.0 * pl - 4.0 * sf_f + 28.0 + 16.0 * crc - 20.0 * ih;
        let denom = 4.0 * (sf_f - 2.0 * de);
        let payload_symbols = 8.0 + ((numerator / denom).ceil() * (cr + 4.0)).max(0.0);

        preamble_time + payload_symbols * t_sym
    }
}

/// Channel-to-node distribution policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChannelDistribution {
    #[default]
    RoundRobin,
    Random,
}

/// An ordered set of channels with a distribution policy.
pub struct MultiChannel {
    pub channels: Vec<Channel>,
    distribution: ChannelDistribution,
    cursor: usize,
}

impl MultiChannel {
    pub fn new(channels: Vec<Channel>, distribution: ChannelDistribution) -> Self {
        Self {
            channels,
            distribution,
            cursor: 0,
        }
    }

    /// Pick the next channel whose index bit is set in `mask`.
    ///
    /// Round-robin advances a cursor over the allowed subset; random draws
    /// uniformly from it. A mask that excludes every configured channel falls
    /// back to channel 0.
    pub fn select_mask<R: Rng>(&mut self, mask: u16, rng: &mut R) -> usize {
        let allowed: Vec<usize> = (0..self.channels.len().min(16))
            .filter(|i| mask & (1 << i) != 0)
            .collect();
        if allowed.is_empty() {
            return 0;
        }
        match self.distribution {
            ChannelDistribution::RoundRobin => {
                let pick = allowed[self.cursor % allowed.len()];
                self.cursor = (self.cursor + 1) % allowed.len();
                pick
            }
            ChannelDistribution::Random => allowed[rng.gen_range(0..allowed.len())],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn airtime_increases_with_payload_and_sf() {
        let ch = Channel::default();
        let t_small = ch.airtime(7, 10);
        let t_big = ch.airtime(7, 100);
        assert!(t_big > t_small);
        assert!(ch.airtime(9, 10) > t_small);
    }

    #[test]
    fn sf7_airtime_matches_reference_value() {
        // SF7/125kHz/CR4/5, 20-byte payload, CRC on: ~56.6 ms on-air
        let ch = Channel::default();
        let t = ch.airtime(7, 20);
        assert!((t - 0.056576).abs() < 1e-4, "airtime was {t}");
    }

    #[test]
    fn ldro_engages_for_slow_symbols() {
        let ch = Channel::default();
        // SF12 @ 125 kHz has T_sym = 32.8 ms, so LDRO must apply
        assert!(ch.symbol_time(12) >= 0.016);
        assert!(ch.airtime(12, 20) > ch.airtime(11, 20));
    }

    #[test]
    fn sensitivity_table_spans_sf_range() {
        let ch = Channel::default();
        assert_eq!(ch.sensitivity_dbm(7), -123.0);
        assert_eq!(ch.sensitivity_dbm(12), -137.0);
        // Clamped outside the LoRaWAN SF range
        assert_eq!(ch.sensitivity_dbm(13), -137.0);
    }

    #[test]
    fn round_robin_cycles_masked_channels() {
        let mut rng = StdRng::seed_from_u64(1);
        let channels = vec![
            Channel::deterministic(868.1e6),
            Channel::deterministic(868.3e6),
            Channel::deterministic(868.5e6),
        ];
        let mut mc = MultiChannel::new(channels, ChannelDistribution::RoundRobin);
        // Bit 1 cleared: only channels 0 and 2 are eligible
        let picks: Vec<usize> = (0..4).map(|_| mc.select_mask(0b101, &mut rng)).collect();
        assert_eq!(picks, vec![0, 2, 0, 2]);
    }

    #[test]
    fn empty_mask_falls_back_to_first_channel() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut mc = MultiChannel::new(
            vec![Channel::deterministic(868.1e6)],
            ChannelDistribution::Random,
        );
        assert_eq!(mc.select_mask(0, &mut rng), 0);
    }
}
