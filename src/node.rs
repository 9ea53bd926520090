//! End-device state.
//!
//! A node carries its radio parameters (SF, power, channel mask), LoRaWAN
//! session state (keys, frame counters, activation), an energy model with an
//! optional battery, the rolling uplink history feeding ADR, and the Class
//! A/B/C receive-window bookkeeping.

use std::collections::VecDeque;

use log::debug;

use crate::geometry::Point;
use crate::lorawan::{
    self, DeviceClass, DownlinkFrame, JoinRequest, LoRaWanFrame, UplinkFrame,
    commands::LinkAdrReq, security,
};

/// Bounded length of the per-node uplink outcome history.
pub const HISTORY_LEN: usize = 20;

/// Coarse device activity used by the energy model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Idle,
    Tx,
    Rx,
    Processing,
    Sleep,
}

/// Current draw per state and RX-window geometry.
#[derive(Debug, Clone)]
pub struct EnergyProfile {
    pub voltage_v: f64,
    pub rx_current_a: f64,
    pub processing_current_a: f64,
    pub sleep_current_a: f64,
    pub idle_current_a: f64,
    /// How long a receive window keeps the radio listening (s).
    pub rx_window_duration: f64,
}

impl Default for EnergyProfile {
    fn default() -> Self {
        Self {
            voltage_v: 3.3,
            rx_current_a: 11.0e-3,
            processing_current_a: 2.8e-3,
            sleep_current_a: 1.0e-6,
            idle_current_a: 1.0e-6,
            rx_window_duration: 0.05,
        }
    }
}

/// Outcome of one finished uplink, as seen by the transmitting node.
#[derive(Debug, Clone, Copy)]
pub struct TxOutcome {
    pub snr: Option<f64>,
    pub rssi: Option<f64>,
    pub delivered: bool,
}

pub struct Node {
    pub id: u32,
    pub position: Point,
    pub initial_position: Point,
    pub initial_sf: u8,
    pub initial_tx_power_dbm: f64,

    pub sf: u8,
    pub tx_power_dbm: f64,
    pub chmask: u16,
    pub nb_trans: u8,
    pub(crate) nb_trans_left: u8,
    pub class: DeviceClass,
    /// Index into the simulator's `MultiChannel`.
    pub channel: usize,

    // LoRaWAN session state
    pub security_enabled: bool,
    pub activated: bool,
    pub app_key: [u8; 16],
    pub nwk_skey: [u8; 16],
    pub app_skey: [u8; 16],
    pub dev_addr: u32,
    pub join_eui: u64,
    pub dev_eui: u64,
    pub fcnt_up: u32,
    pub fcnt_down: u32,
    pub dev_nonce: u16,

    // Energy
    pub battery_capacity_j: Option<f64>,
    pub battery_remaining_j: f64,
    pub energy_consumed_j: f64,
    pub energy_tx_j: f64,
    pub energy_rx_j: f64,
    pub alive: bool,
    pub profile: EnergyProfile,
    pub state: NodeState,
    pub last_state_time: f64,

    // Counters and link history
    pub packets_sent: u64,
    pub packets_success: u64,
    pub packets_collision: u64,
    pub acks_received: u64,
    pub downlink_pending: u32,
    pub history: VecDeque<TxOutcome>,
    /// SNR samples collected server-side for the ADR step.
    pub snr_history: VecDeque<f64>,
    pub adr_ack_cnt: u32,
    pub adr_ack_requested: bool,

    // Receive windows and Class-B timing
    pub rx_delay: f64,
    pub ping_slot_periodicity: u8,
    pub last_beacon_time: Option<f64>,
    pub beacon_drift: f64,

    // Transmission in progress
    pub in_transmission: bool,
    pub current_end_time: Option<f64>,
    pub last_rssi: Option<f64>,
    pub last_snr: Option<f64>,
}

impl Node {
    pub fn new(
        id: u32,
        x: f64,
        y: f64,
        sf: u8,
        tx_power_dbm: f64,
        channel: usize,
        battery_capacity_j: Option<f64>,
    ) -> Self {
        Self {
            id,
            position: Point::new(x, y),
            initial_position: Point::new(x, y),
            initial_sf: sf,
            initial_tx_power_dbm: tx_power_dbm,
            sf,
            tx_power_dbm,
            chmask: 0xFFFF,
            nb_trans: 1,
            nb_trans_left: 0,
            class: DeviceClass::A,
            channel,
            security_enabled: false,
            activated: true,
            app_key: [0; 16],
            nwk_skey: [0; 16],
            app_skey: [0; 16],
            dev_addr: 0,
            join_eui: 0,
            dev_eui: u64::from(id),
            fcnt_up: 0,
            fcnt_down: 0,
            dev_nonce: 0,
            battery_capacity_j,
            battery_remaining_j: battery_capacity_j.unwrap_or(f64::INFINITY),
            energy_consumed_j: 0.0,
            energy_tx_j: 0.0,
            energy_rx_j: 0.0,
            alive: true,
            profile: EnergyProfile::default(),
            state: NodeState::Idle,
            last_state_time: 0.0,
            packets_sent: 0,
            packets_success: 0,
            packets_collision: 0,
            acks_received: 0,
            downlink_pending: 0,
            history: VecDeque::with_capacity(HISTORY_LEN),
            snr_history: VecDeque::with_capacity(HISTORY_LEN),
            adr_ack_cnt: 0,
            adr_ack_requested: false,
            rx_delay: 1.0,
            ping_slot_periodicity: 0,
            last_beacon_time: None,
            beacon_drift: 0.0,
            in_transmission: false,
            current_end_time: None,
            last_rssi: None,
            last_snr: None,
        }
    }

    /// Enable the security path: the node starts unactivated and emits join
    /// requests until it consumes a join accept.
    pub fn enable_security(&mut self, app_key: [u8; 16], join_eui: u64) {
        self.security_enabled = true;
        self.activated = false;
        self.app_key = app_key;
        self.join_eui = join_eui;
    }

    pub fn distance_to(&self, other: Point) -> f64 {
        crate::geometry::distance(self.position, other)
    }

    /// Class-A receive windows for a transmission ending at `tx_end`.
    pub fn schedule_receive_windows(&self, tx_end: f64) -> (f64, f64) {
        (
            lorawan::compute_rx1(tx_end, self.rx_delay),
            lorawan::compute_rx2(tx_end, self.rx_delay),
        )
    }

    /// Next Class-B ping slot at or after `now`.
    pub fn next_ping_slot_time(
        &self,
        now: f64,
        beacon_interval: f64,
        ping_slot_interval: f64,
        ping_slot_offset: f64,
    ) -> f64 {
        lorawan::next_ping_slot_time(
            now,
            beacon_interval,
            ping_slot_interval,
            ping_slot_offset,
            self.last_beacon_time.unwrap_or(0.0),
            self.beacon_drift,
        )
    }

    /// Build the next uplink frame, advancing counters.
    ///
    /// Returns `None` when the security path is disabled: the simulator then
    /// models the transmission purely at the PHY level.
    pub fn prepare_uplink(&mut self) -> Option<UplinkFrame> {
        if !self.security_enabled {
            return None;
        }
        if !self.activated {
            let nonce = self.dev_nonce;
            self.dev_nonce = self.dev_nonce.wrapping_add(1);
            let mut req = JoinRequest::new(self.join_eui, self.dev_eui, nonce);
            req.mic = Some(security::compute_join_mic(&self.app_key, &req.to_bytes()));
            return Some(UplinkFrame::Join(req));
        }
        let fcnt = self.fcnt_up;
        self.fcnt_up += 1;
        let mut frame = LoRaWanFrame::new(0x40, 0, fcnt, Vec::new(), false);
        frame.mic = Some(security::compute_mic(
            &self.nwk_skey,
            self.dev_addr,
            fcnt,
            security::DIR_UPLINK,
            &frame.payload,
        ));
        Some(UplinkFrame::Data(frame))
    }

    /// Consume one downlink frame popped from a gateway buffer.
    pub fn handle_downlink(&mut self, frame: DownlinkFrame) {
        self.downlink_pending = self.downlink_pending.saturating_sub(1);
        self.adr_ack_cnt = 0;
        self.adr_ack_requested = false;
        match frame {
            DownlinkFrame::Join(accept) => {
                self.dev_addr = accept.dev_addr;
                self.activated = true;
                debug!("node {}: activated with DevAddr {:#010x}", self.id, self.dev_addr);
            }
            DownlinkFrame::Data(frame) => {
                if frame.confirmed {
                    self.acks_received += 1;
                }
                let payload = match (&frame.encrypted_payload, self.security_enabled) {
                    (Some(enc), true) => security::encrypt_payload(
                        &self.app_skey,
                        self.dev_addr,
                        frame.fcnt,
                        security::DIR_DOWNLINK,
                        enc,
                    ),
                    _ => frame.payload.clone(),
                };
                if let Ok(req) = LinkAdrReq::from_bytes(&payload) {
                    self.apply_link_adr(&req);
                }
            }
        }
    }

    fn apply_link_adr(&mut self, req: &LinkAdrReq) {
        self.sf = lorawan::dr_to_sf(req.data_rate);
        let idx = (req.tx_power as usize).min(lorawan::TX_POWER_MAX_IDX);
        self.tx_power_dbm = lorawan::TX_POWER_INDEX_TO_DBM[idx];
        if req.ch_mask != 0 {
            self.chmask = req.ch_mask;
        }
        if req.nb_trans > 0 {
            self.nb_trans = req.nb_trans;
        }
        debug!(
            "node {}: LinkADRReq applied, SF{} @ {} dBm, nb_trans {}",
            self.id, self.sf, self.tx_power_dbm, self.nb_trans
        );
    }

    /// Deduct battery energy for the time spent in the current state.
    ///
    /// Transmit energy is charged explicitly at TX start, so the TX state
    /// draws nothing here.
    pub fn consume_until(&mut self, t: f64) {
        let elapsed = t - self.last_state_time;
        if elapsed > 0.0 {
            let current = match self.state {
                NodeState::Tx => 0.0,
                NodeState::Rx => self.profile.rx_current_a,
                NodeState::Processing => self.profile.processing_current_a,
                NodeState::Sleep => self.profile.sleep_current_a,
                NodeState::Idle => self.profile.idle_current_a,
            };
            self.add_energy(current * self.profile.voltage_v * elapsed, EnergyUse::Ambient);
        }
        self.last_state_time = self.last_state_time.max(t);
    }

    /// Charge `joules` against the battery; a drained battery kills the node.
    pub fn add_energy(&mut self, joules: f64, kind: EnergyUse) {
        self.energy_consumed_j += joules;
        match kind {
            EnergyUse::Tx => self.energy_tx_j += joules,
            EnergyUse::Rx => self.energy_rx_j += joules,
            EnergyUse::Ambient => {}
        }
        if self.battery_capacity_j.is_some() {
            self.battery_remaining_j -= joules;
            if self.battery_remaining_j <= 0.0 {
                self.battery_remaining_j = 0.0;
                if self.alive {
                    self.alive = false;
                    debug!("node {}: battery depleted", self.id);
                }
            }
        }
    }

    pub fn increment_sent(&mut self) {
        self.packets_sent += 1;
    }

    pub fn increment_success(&mut self) {
        self.packets_success += 1;
    }

    pub fn increment_collision(&mut self) {
        self.packets_collision += 1;
    }

    /// Append one uplink outcome, bounded to the last [`HISTORY_LEN`].
    pub fn push_history(&mut self, outcome: TxOutcome) {
        if self.history.len() >= HISTORY_LEN {
            self.history.pop_front();
        }
        self.history.push_back(outcome);
    }

    /// Append one server-side SNR sample, bounded to [`HISTORY_LEN`].
    pub fn push_snr(&mut self, snr: f64) {
        if self.snr_history.len() >= HISTORY_LEN {
            self.snr_history.pop_front();
        }
        self.snr_history.push_back(snr);
    }

    /// Lifetime packet delivery ratio.
    pub fn pdr(&self) -> f64 {
        if self.packets_sent == 0 {
            return 0.0;
        }
        self.packets_success as f64 / self.packets_sent as f64
    }

    /// Delivery ratio over the bounded history window.
    pub fn recent_pdr(&self) -> f64 {
        if self.history.is_empty() {
            return 0.0;
        }
        let delivered = self.history.iter().filter(|o| o.delivered).count();
        delivered as f64 / self.history.len() as f64
    }
}

/// Energy accounting bucket.
#[derive(Debug, Clone, Copy)]
pub enum EnergyUse {
    Tx,
    Rx,
    /// Sleep/processing/idle currents between events.
    Ambient,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node() -> Node {
        Node::new(1, 0.0, 0.0, 7, 14.0, 0, None)
    }

    #[test]
    fn receive_windows_follow_rx_delay() {
        let mut n = node();
        n.rx_delay = 3.0;
        let (rx1, rx2) = n.schedule_receive_windows(10.0);
        assert!((rx1 - 13.0).abs() < 1e-9);
        assert!((rx2 - 14.0).abs() < 1e-9);
    }

    #[test]
    fn history_is_bounded() {
        let mut n = node();
        for _ in 0..30 {
            n.push_history(TxOutcome {
                snr: None,
                rssi: None,
                delivered: true,
            });
        }
        assert_eq!(n.history.len(), HISTORY_LEN);
    }

    #[test]
    fn battery_depletion_kills_node() {
        let mut n = Node::new(1, 0.0, 0.0, 7, 14.0, 0, Some(1.0));
        n.add_energy(0.6, EnergyUse::Tx);
        assert!(n.alive);
        n.add_energy(0.6, EnergyUse::Tx);
        assert!(!n.alive);
        assert_eq!(n.battery_remaining_j, 0.0);
        // Further accounting must not resurrect or go negative
        n.add_energy(0.1, EnergyUse::Rx);
        assert_eq!(n.battery_remaining_j, 0.0);
        assert!(!n.alive);
    }

    #[test]
    fn consume_until_draws_state_current() {
        let mut n = node();
        n.state = NodeState::Sleep;
        n.last_state_time = 0.0;
        n.consume_until(100.0);
        let expected = n.profile.sleep_current_a * n.profile.voltage_v * 100.0;
        assert!((n.energy_consumed_j - expected).abs() < 1e-12);
        // Time never runs backwards
        n.consume_until(50.0);
        assert!((n.last_state_time - 100.0).abs() < 1e-12);
    }

    #[test]
    fn confirmed_downlink_counts_as_ack() {
        let mut n = node();
        n.downlink_pending = 1;
        let frame = LoRaWanFrame::new(0xA0, 0, 0, Vec::new(), true);
        n.handle_downlink(DownlinkFrame::Data(frame));
        assert_eq!(n.acks_received, 1);
        assert_eq!(n.downlink_pending, 0);
    }

    #[test]
    fn link_adr_command_retunes_radio() {
        let mut n = node();
        n.sf = 12;
        let req = LinkAdrReq {
            data_rate: 5, // SF7
            tx_power: 3,  // 10 dBm
            ch_mask: 0x00FF,
            nb_trans: 2,
        };
        let frame = LoRaWanFrame::new(0x60, 0, 0, req.to_bytes(), false);
        n.handle_downlink(DownlinkFrame::Data(frame));
        assert_eq!(n.sf, 7);
        assert_eq!(n.tx_power_dbm, 10.0);
        assert_eq!(n.chmask, 0x00FF);
        assert_eq!(n.nb_trans, 2);
    }

    #[test]
    fn join_accept_activates_device() {
        let mut n = node();
        n.enable_security([7; 16], 0x70B3D57ED0000000);
        assert!(!n.activated);
        let first = n.prepare_uplink();
        assert!(matches!(first, Some(UplinkFrame::Join(_))));
        n.handle_downlink(DownlinkFrame::Join(crate::lorawan::JoinAccept::new(
            1, 0, 0x2601_0001,
        )));
        assert!(n.activated);
        assert_eq!(n.dev_addr, 0x2601_0001);
        // Activated devices now emit MIC'd data frames with rising counters
        match n.prepare_uplink() {
            Some(UplinkFrame::Data(f)) => {
                assert_eq!(f.fcnt, 0);
                assert!(f.mic.is_some());
            }
            other => panic!("expected data frame, got {other:?}"),
        }
        assert_eq!(n.fcnt_up, 1);
    }
}
