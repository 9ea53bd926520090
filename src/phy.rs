//! Physical-layer math.
//!
//! Contains helpers for:
//! - Log-distance path loss anchored at the carrier frequency
//! - Receiver noise floor (thermal + noise figure + interference, with
//!   optional Gaussian perturbation and OMNeT-style slow drift)
//! - RSSI/SNR computation with shadowing, fading and alignment penalties
//! - The capture decision between concurrent co-channel signals
//!
//! Units: power in dBm, distance in meters, time in seconds. Every stochastic
//! term samples from an explicit RNG handle so runs are reproducible per seed.

use rand::Rng;
use rand_distr::{Distribution, Normal};

use crate::channel::{Channel, PhyModel};

/// Boltzmann constant (J/K).
const BOLTZMANN: f64 = 1.380_649e-23;

/// State for the OMNeT-flavored correlated terms: fine fading and a slow
/// noise-floor drift, both first-order autoregressive processes.
#[derive(Debug, Clone)]
pub struct OmnetModel {
    /// AR(1) correlation of successive samples; 0 disables the memory.
    pub correlation: f64,
    /// Receiver temperature used for the thermal noise term (K).
    pub temperature_k: f64,
    fine_fading_state: f64,
    noise_state: f64,
}

impl Default for OmnetModel {
    fn default() -> Self {
        Self {
            correlation: 0.9,
            temperature_k: 293.0,
            fine_fading_state: 0.0,
            noise_state: 0.0,
        }
    }
}

impl OmnetModel {
    /// Thermal noise power in dBm over `bandwidth_hz` at `temperature_k`.
    pub fn thermal_noise_dbm(bandwidth_hz: f64, temperature_k: f64) -> f64 {
        10.0 * (BOLTZMANN * temperature_k * bandwidth_hz * 1000.0).log10()
    }

    /// Next correlated fine-fading sample (dB).
    pub fn fine_fading<R: Rng>(&mut self, std: f64, rng: &mut R) -> f64 {
        if std <= 0.0 {
            return 0.0;
        }
        let innovation = gauss(std, rng) * (1.0 - self.correlation * self.correlation).sqrt();
        self.fine_fading_state = self.correlation * self.fine_fading_state + innovation;
        self.fine_fading_state
    }

    /// Next slow noise-floor drift sample (dB).
    pub fn noise_variation<R: Rng>(&mut self, std: f64, rng: &mut R) -> f64 {
        if std <= 0.0 {
            return 0.0;
        }
        let innovation = gauss(std, rng) * (1.0 - self.correlation * self.correlation).sqrt();
        self.noise_state = self.correlation * self.noise_state + innovation;
        self.noise_state
    }
}

fn gauss<R: Rng>(std: f64, rng: &mut R) -> f64 {
    Normal::new(0.0, std)
        .expect("invalid normal sigma")
        .sample(rng)
}

/// Path loss (dB) at `distance` meters using the log-distance model.
///
/// The 1 m reference loss defaults to `32.45 + 20*log10(f_MHz) - 60` unless
/// the channel pins it explicitly. Distances under 1 m clamp to the reference
/// loss; non-positive distances report no loss at all.
pub fn path_loss(ch: &Channel, distance: f64) -> f64 {
    if distance <= 0.0 {
        return 0.0;
    }
    let pl_d0 = ch.path_loss_d0.unwrap_or_else(|| {
        let freq_mhz = ch.frequency_hz / 1e6;
        32.45 + 20.0 * freq_mhz.log10() - 60.0
    });
    pl_d0 + 10.0 * ch.path_loss_exp * distance.max(1.0).log10() + ch.system_loss_db
}

/// Receiver noise floor (dBm), optionally perturbed.
pub fn noise_floor<R: Rng>(ch: &mut Channel, rng: &mut R) -> f64 {
    let thermal = OmnetModel::thermal_noise_dbm(ch.bandwidth_hz, ch.omnet.temperature_k);
    let mut noise = thermal + ch.noise_figure_db + ch.interference_db;
    if ch.noise_floor_std > 0.0 {
        noise += gauss(ch.noise_floor_std, rng);
    }
    if ch.phy_model == PhyModel::Omnet {
        let std = ch.variable_noise_std;
        noise += ch.omnet.noise_variation(std, rng);
    }
    noise
}

/// SNR penalty (dB) for imperfect frequency/time alignment.
///
/// Returns +inf when the signal sits both outside half the bandwidth and more
/// than one symbol off: unrecoverable.
pub fn alignment_penalty(ch: &Channel, sf: Option<u8>) -> f64 {
    let freq_factor = ch.frequency_offset_hz.abs() / (ch.bandwidth_hz / 2.0);
    let symbol_time = match sf {
        Some(sf) => ch.symbol_time(sf),
        None => 1.0 / ch.bandwidth_hz,
    };
    let time_factor = ch.sync_offset_s.abs() / symbol_time;
    if freq_factor >= 1.0 && time_factor >= 1.0 {
        return f64::INFINITY;
    }
    10.0 * (1.0 + freq_factor * freq_factor + time_factor * time_factor).log10()
}

/// Sample `(rssi, snr)` for a transmission received over `distance` meters.
///
/// When `sf` is given the SNR includes the spreading gain `10*log10(2^SF)`.
pub fn compute_rssi<R: Rng>(
    ch: &mut Channel,
    tx_power_dbm: f64,
    distance: f64,
    sf: Option<u8>,
    rng: &mut R,
) -> (f64, f64) {
    let mut loss = path_loss(ch, distance);
    if ch.shadowing_std > 0.0 {
        loss += gauss(ch.shadowing_std, rng);
    }

    let mut rssi =
        tx_power_dbm + ch.tx_antenna_gain_db + ch.rx_antenna_gain_db - loss - ch.cable_loss_db;
    if ch.tx_power_std > 0.0 {
        rssi += gauss(ch.tx_power_std, rng);
    }
    if ch.fast_fading_std > 0.0 {
        rssi += gauss(ch.fast_fading_std, rng);
    }
    if ch.time_variation_std > 0.0 {
        rssi += gauss(ch.time_variation_std, rng);
    }
    if ch.phy_model == PhyModel::Omnet {
        let std = ch.fine_fading_std;
        rssi += ch.omnet.fine_fading(std, rng);
    }
    rssi += ch.rssi_offset_db;

    let mut snr = rssi - noise_floor(ch, rng) + ch.snr_offset_db;
    snr -= alignment_penalty(ch, sf);
    if let Some(sf) = sf {
        snr += 10.0 * ((1u64 << sf) as f64).log10();
    }
    (rssi, snr)
}

/// Capture decision for concurrent co-channel signals.
///
/// The single strongest signal wins if and only if it leads the runner-up by
/// at least `capture_threshold_db`; any tie or smaller lead loses everyone.
pub fn capture(rssi_list: &[f64], capture_threshold_db: f64) -> Vec<bool> {
    if rssi_list.is_empty() {
        return Vec::new();
    }
    let mut winners = vec![false; rssi_list.len()];
    let mut order: Vec<usize> = (0..rssi_list.len()).collect();
    order.sort_by(|&a, &b| rssi_list[b].total_cmp(&rssi_list[a]));
    if order.len() == 1 {
        winners[order[0]] = true;
        return winners;
    }
    if rssi_list[order[0]] - rssi_list[order[1]] >= capture_threshold_db {
        winners[order[0]] = true;
    }
    winners
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn quiet_channel() -> Channel {
        Channel::deterministic(868.1e6)
    }

    #[test]
    fn path_loss_monotonic_and_clamped() {
        let ch = quiet_channel();
        assert_eq!(path_loss(&ch, 0.0), 0.0);
        assert_eq!(path_loss(&ch, -5.0), 0.0);
        // Sub-meter distances clamp to the 1 m reference
        assert!((path_loss(&ch, 0.5) - path_loss(&ch, 1.0)).abs() < 1e-12);
        assert!(path_loss(&ch, 100.0) < path_loss(&ch, 1000.0));
    }

    #[test]
    fn reference_loss_derives_from_frequency() {
        let ch = quiet_channel();
        // PL0 = 32.45 + 20*log10(868.1) - 60 ≈ 31.2 dB
        let pl0 = path_loss(&ch, 1.0);
        assert!((pl0 - 31.21).abs() < 0.1, "PL0 was {pl0}");
    }

    #[test]
    fn noise_floor_matches_thermal_budget() {
        let mut ch = quiet_channel();
        let mut rng = StdRng::seed_from_u64(0);
        // -123 dBm thermal at 125 kHz plus the 6 dB noise figure
        let nf = noise_floor(&mut ch, &mut rng);
        assert!((nf + 117.0).abs() < 0.5, "noise floor was {nf}");
    }

    #[test]
    fn rssi_deterministic_without_fading() {
        let mut ch = quiet_channel();
        let mut rng = StdRng::seed_from_u64(0);
        let (r1, s1) = compute_rssi(&mut ch, 14.0, 100.0, None, &mut rng);
        let (r2, s2) = compute_rssi(&mut ch, 14.0, 100.0, None, &mut rng);
        assert_eq!(r1, r2);
        assert_eq!(s1, s2);
    }

    #[test]
    fn spreading_gain_applies_when_sf_given() {
        let mut ch = quiet_channel();
        let mut rng = StdRng::seed_from_u64(0);
        let (_, snr_plain) = compute_rssi(&mut ch, 14.0, 100.0, None, &mut rng);
        let (_, snr_sf7) = compute_rssi(&mut ch, 14.0, 100.0, Some(7), &mut rng);
        let gain = 10.0 * (128.0f64).log10();
        assert!((snr_sf7 - snr_plain - gain).abs() < 1e-9);
    }

    #[test]
    fn alignment_penalty_unrecoverable_when_both_factors_exceed_one() {
        let mut ch = quiet_channel();
        ch.frequency_offset_hz = ch.bandwidth_hz; // ff = 2
        ch.sync_offset_s = 1.0; // tf >> 1
        assert!(alignment_penalty(&ch, Some(7)).is_infinite());

        ch.sync_offset_s = 0.0;
        let p = alignment_penalty(&ch, Some(7));
        // 10*log10(1 + 2^2) ≈ 7 dB
        assert!((p - 6.99).abs() < 0.05, "penalty was {p}");
    }

    #[test]
    fn capture_requires_full_threshold_lead() {
        assert_eq!(capture(&[], 6.0), Vec::<bool>::new());
        assert_eq!(capture(&[-80.0], 6.0), vec![true]);
        // 6 dB lead: exactly at threshold, strongest wins
        assert_eq!(capture(&[-80.0, -86.0], 6.0), vec![true, false]);
        // 5 dB lead: nobody wins
        assert_eq!(capture(&[-80.0, -85.0], 6.0), vec![false, false]);
        // Tie: nobody wins
        assert_eq!(capture(&[-80.0, -80.0], 6.0), vec![false, false]);
    }

    #[test]
    fn fine_fading_varies_between_samples() {
        let mut ch = quiet_channel();
        ch.phy_model = PhyModel::Omnet;
        ch.fine_fading_std = 1.0;
        let mut rng = StdRng::seed_from_u64(0);
        let (r1, _) = compute_rssi(&mut ch, 14.0, 100.0, None, &mut rng);
        let (r2, _) = compute_rssi(&mut ch, 14.0, 100.0, None, &mut rng);
        assert_ne!(r1, r2);
    }

    #[test]
    fn noise_drift_raises_or_lowers_floor_over_time() {
        let mut ch = quiet_channel();
        ch.phy_model = PhyModel::Omnet;
        ch.variable_noise_std = 0.5;
        let mut rng = StdRng::seed_from_u64(3);
        let a = noise_floor(&mut ch, &mut rng);
        let b = noise_floor(&mut ch, &mut rng);
        assert_ne!(a, b);
    }
}
