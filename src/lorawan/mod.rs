//! Shared LoRaWAN definitions used by every other module.
//!
//! Contains:
//! - Regional/ADR constants (required SNR per SF, EU868 TX power index table)
//! - Frame types: data frames, join/rejoin requests, join accepts
//! - The downlink payload sum type accepted by the network server
//! - Receive-window, beacon and ping-slot timing helpers
//!
//! Submodules:
//! - `commands`: MAC command byte codecs with round-trip guarantees
//! - `security`: AES-128/CMAC primitives (MIC, session keys, payload crypto)

pub mod commands;
pub mod security;

use serde::Deserialize;

/// Installation margin applied by the server-side ADR algorithm (dB).
pub const MARGIN_DB: f64 = 15.0;

/// Packet error rate above which the node-side ADR backoff engages.
pub const PER_THRESHOLD: f64 = 0.1;

/// Lowest transmit power a device may be commanded to (dBm).
pub const TX_MIN_DBM: f64 = 2.0;

/// Highest transmit power a device may ramp up to (dBm).
pub const TX_MAX_DBM: f64 = 20.0;

/// Number of uplinks without any downlink before a device sets ADRACKReq.
pub const ADR_ACK_LIMIT: u32 = 64;

/// EU868 TX power index table: index 0 is maximum EIRP, each step is -2 dB.
pub const TX_POWER_INDEX_TO_DBM: [f64; 8] = [16.0, 14.0, 12.0, 10.0, 8.0, 6.0, 4.0, 2.0];

/// Highest valid index into [`TX_POWER_INDEX_TO_DBM`] (lowest power).
pub const TX_POWER_MAX_IDX: usize = TX_POWER_INDEX_TO_DBM.len() - 1;

/// Demodulation-floor SNR (dB) per spreading factor, from the SX127x datasheet.
pub fn required_snr(sf: u8) -> f64 {
    match sf {
        7 => -7.5,
        8 => -10.0,
        9 => -12.5,
        10 => -15.0,
        11 => -17.5,
        _ => -20.0,
    }
}

/// EU868 data rate for a spreading factor (SF12 -> DR0 ... SF7 -> DR5).
pub fn sf_to_dr(sf: u8) -> u8 {
    12u8.saturating_sub(sf.clamp(7, 12))
}

/// Spreading factor for an EU868 data rate (DR0 -> SF12 ... DR5 -> SF7).
pub fn dr_to_sf(dr: u8) -> u8 {
    (12u8.saturating_sub(dr)).clamp(7, 12)
}

/// Map a commanded power (dBm) to its EU868 index; unknown values map to 0.
pub fn dbm_to_tx_power_index(dbm: f64) -> usize {
    TX_POWER_INDEX_TO_DBM
        .iter()
        .position(|&p| (p - dbm).abs() < 0.5)
        .unwrap_or(0)
}

/// LoRaWAN device class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum DeviceClass {
    A,
    B,
    C,
}

/// A LoRaWAN MAC data frame, downlink or uplink.
///
/// The payload is kept in clear alongside its optional encrypted form so the
/// simulator can model the security path without forcing it on every run.
#[derive(Debug, Clone, PartialEq)]
pub struct LoRaWanFrame {
    pub mhdr: u8,
    pub fctrl: u8,
    pub fcnt: u32,
    pub payload: Vec<u8>,
    pub confirmed: bool,
    pub encrypted_payload: Option<Vec<u8>>,
    pub mic: Option<[u8; 4]>,
}

impl LoRaWanFrame {
    pub fn new(mhdr: u8, fctrl: u8, fcnt: u32, payload: Vec<u8>, confirmed: bool) -> Self {
        Self {
            mhdr,
            fctrl,
            fcnt,
            payload,
            confirmed,
            encrypted_payload: None,
            mic: None,
        }
    }
}

/// OTAA join request (MHDR 0x00).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinRequest {
    pub join_eui: u64,
    pub dev_eui: u64,
    pub dev_nonce: u16,
    pub mic: Option<[u8; 4]>,
}

impl JoinRequest {
    pub fn new(join_eui: u64, dev_eui: u64, dev_nonce: u16) -> Self {
        Self {
            join_eui,
            dev_eui,
            dev_nonce,
            mic: None,
        }
    }

    /// MIC-covered portion of the request: JoinEUI, DevEUI, DevNonce (LE).
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(18);
        out.extend_from_slice(&self.join_eui.to_le_bytes());
        out.extend_from_slice(&self.dev_eui.to_le_bytes());
        out.extend_from_slice(&self.dev_nonce.to_le_bytes());
        out
    }
}

/// OTAA rejoin request (type 0/1/2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RejoinRequest {
    pub rejoin_type: u8,
    pub net_id: u32,
    pub dev_eui: u64,
    pub rj_count: u16,
    pub mic: Option<[u8; 4]>,
}

impl RejoinRequest {
    pub fn new(rejoin_type: u8, net_id: u32, dev_eui: u64, rj_count: u16) -> Self {
        Self {
            rejoin_type,
            net_id,
            dev_eui,
            rj_count,
            mic: None,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(14);
        out.push(self.rejoin_type);
        out.extend_from_slice(&self.net_id.to_le_bytes()[..3]);
        out.extend_from_slice(&self.dev_eui.to_le_bytes());
        out.extend_from_slice(&self.rj_count.to_le_bytes());
        out
    }

    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < 14 {
            return None;
        }
        let net_id = u32::from_le_bytes([data[1], data[2], data[3], 0]);
        let dev_eui = u64::from_le_bytes(data[4..12].try_into().ok()?);
        let rj_count = u16::from_le_bytes([data[12], data[13]]);
        Some(Self {
            rejoin_type: data[0],
            net_id,
            dev_eui,
            rj_count,
            mic: None,
        })
    }
}

/// Join accept sent in response to a (re)join request.
///
/// `encrypted` holds the over-the-air form (AES decrypt of clear||MIC, so the
/// device recovers it with a single AES encrypt).
#[derive(Debug, Clone, PartialEq)]
pub struct JoinAccept {
    pub app_nonce: u32,
    pub net_id: u32,
    pub dev_addr: u32,
    pub encrypted: Option<Vec<u8>>,
    pub mic: Option<[u8; 4]>,
}

impl JoinAccept {
    pub fn new(app_nonce: u32, net_id: u32, dev_addr: u32) -> Self {
        Self {
            app_nonce,
            net_id,
            dev_addr,
            encrypted: None,
            mic: None,
        }
    }

    /// Clear-text frame: AppNonce (3) | NetID (3) | DevAddr (4), little endian.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(10);
        out.extend_from_slice(&self.app_nonce.to_le_bytes()[..3]);
        out.extend_from_slice(&self.net_id.to_le_bytes()[..3]);
        out.extend_from_slice(&self.dev_addr.to_le_bytes());
        out
    }
}

/// What a caller may hand to `NetworkServer::send_downlink`.
#[derive(Debug, Clone)]
pub enum Payload {
    /// Raw application bytes, wrapped into a data frame by the server.
    Raw(Vec<u8>),
    /// A pre-built data frame, sent as-is.
    Data(LoRaWanFrame),
    /// A join accept, sent as-is.
    Join(JoinAccept),
}

/// A frame sitting in a gateway downlink buffer, waiting for an RX window.
#[derive(Debug, Clone)]
pub enum DownlinkFrame {
    Data(LoRaWanFrame),
    Join(JoinAccept),
}

/// A frame travelling uplink from a device.
#[derive(Debug, Clone)]
pub enum UplinkFrame {
    Data(LoRaWanFrame),
    Join(JoinRequest),
    Rejoin(RejoinRequest),
}

/// First Class-A receive window.
pub fn compute_rx1(tx_end: f64, rx_delay: f64) -> f64 {
    tx_end + rx_delay
}

/// Second Class-A receive window, one second after RX1.
pub fn compute_rx2(tx_end: f64, rx_delay: f64) -> f64 {
    tx_end + rx_delay + 1.0
}

/// Next beacon emission time strictly after `after`.
///
/// The beacon period is stretched by the clock drift factor. Without a known
/// previous beacon the schedule is anchored at t=0.
pub fn next_beacon_time(after: f64, interval: f64, last_beacon: Option<f64>, drift: f64) -> f64 {
    let period = interval * (1.0 + drift);
    let anchor = last_beacon.unwrap_or(0.0);
    let k = ((after - anchor) / period).ceil().max(1.0);
    anchor + k * period
}

/// Next Class-B ping slot at or after `after`.
///
/// Slots sit at `beacon_epoch + offset + k * interval`, where the epoch is the
/// last beacon time scaled by the clock drift and advanced to the most recent
/// beacon period containing `after`.
pub fn next_ping_slot_time(
    after: f64,
    beacon_interval: f64,
    ping_slot_interval: f64,
    ping_slot_offset: f64,
    last_beacon: f64,
    drift: f64,
) -> f64 {
    let mut epoch = last_beacon * (1.0 + drift);
    if beacon_interval > 0.0 && after > epoch {
        epoch += ((after - epoch) / beacon_interval).floor() * beacon_interval;
    }
    let first = epoch + ping_slot_offset;
    if after <= first {
        return first;
    }
    let k = ((after - first) / ping_slot_interval).ceil();
    first + k * ping_slot_interval
}
