//! Network server: deduplication, activation, ADR and downlink dispatch.
//!
//! The server never holds references into the simulator; it works on node and
//! gateway slices passed per call (`ServerContext`) and refers to entities by
//! integer id. Recoverable failures (duplicates, bad MICs, replays, join
//! errors) are absorbed and at most logged, matching how a production NS
//! treats a noisy radio field.

use std::collections::{HashMap, HashSet};
use std::fmt;

use log::debug;
use rand::Rng;

use crate::channel::Channel;
use crate::downlink::DownlinkScheduler;
use crate::gateway::Gateway;
use crate::lorawan::{
    self, DeviceClass, DownlinkFrame, JoinAccept, JoinRequest, LoRaWanFrame, Payload,
    RejoinRequest, UplinkFrame, commands::LinkAdrReq, security,
};
use crate::node::Node;
use crate::phy;

/// Scheduled frames older than this at window time are drained at their
/// original slot first (missed beacon / clock skew tolerance).
const OVERDUE_TOLERANCE_S: f64 = 0.1;

/// Mutable world view the simulator lends to the server for one call.
pub struct ServerContext<'a> {
    pub nodes: &'a mut [Node],
    pub gateways: &'a mut [Gateway],
    pub channel: &'a mut Channel,
    pub now: f64,
}

/// Knobs for [`NetworkServer::send_downlink`].
#[derive(Debug, Clone, Default)]
pub struct DownlinkOptions {
    pub confirmed: bool,
    pub request_ack: bool,
    pub adr_command: Option<AdrCommand>,
    pub at_time: Option<f64>,
    /// Gateway to route through; defaults to the first one.
    pub gateway: Option<u32>,
}

/// Radio settings carried by a LinkADRReq downlink.
#[derive(Debug, Clone, Copy)]
pub struct AdrCommand {
    pub sf: u8,
    pub power_dbm: f64,
    pub ch_mask: u16,
    pub nb_trans: u8,
}

/// OTAA activation failure, absorbed by the network server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinError {
    UnknownDevEui,
    DuplicateDevNonce,
    BadMic,
}

impl fmt::Display for JoinError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JoinError::UnknownDevEui => write!(f, "unknown DevEUI"),
            JoinError::DuplicateDevNonce => write!(f, "DevNonce already used"),
            JoinError::BadMic => write!(f, "join MIC verification failed"),
        }
    }
}

impl std::error::Error for JoinError {}

/// OTAA activation authority: registered devices, nonce replay protection,
/// session key derivation.
pub struct JoinServer {
    pub net_id: u32,
    app_keys: HashMap<(u64, u64), [u8; 16]>,
    used_nonces: HashMap<(u64, u64), HashSet<u16>>,
    used_rejoin_counts: HashMap<u64, HashSet<u16>>,
    next_dev_addr: u32,
    app_nonce: u32,
}

impl JoinServer {
    pub fn new(net_id: u32) -> Self {
        Self {
            net_id,
            app_keys: HashMap::new(),
            used_nonces: HashMap::new(),
            used_rejoin_counts: HashMap::new(),
            next_dev_addr: 1,
            app_nonce: 0,
        }
    }

    pub fn register(&mut self, join_eui: u64, dev_eui: u64, app_key: [u8; 16]) {
        self.app_keys.insert((join_eui, dev_eui), app_key);
    }

    fn build_accept(&mut self, app_key: &[u8; 16], dev_nonce: u16) -> (JoinAccept, [u8; 16], [u8; 16]) {
        self.app_nonce = (self.app_nonce + 1) & 0xFF_FFFF;
        let dev_addr = self.next_dev_addr;
        self.next_dev_addr += 1;
        let (nwk_skey, app_skey) =
            security::derive_session_keys(app_key, dev_nonce, self.app_nonce, self.net_id);
        let mut accept = JoinAccept::new(self.app_nonce, self.net_id, dev_addr);
        let (encrypted, mic) = security::encrypt_join_accept(app_key, &accept);
        accept.encrypted = Some(encrypted);
        accept.mic = Some(mic);
        (accept, nwk_skey, app_skey)
    }

    /// Process a join request; errors on replayed nonces, unknown devices and
    /// bad MICs.
    pub fn handle_join(
        &mut self,
        req: &JoinRequest,
    ) -> Result<(JoinAccept, [u8; 16], [u8; 16]), JoinError> {
        let key = *self
            .app_keys
            .get(&(req.join_eui, req.dev_eui))
            .ok_or(JoinError::UnknownDevEui)?;
        match req.mic {
            Some(mic) if mic == security::compute_join_mic(&key, &req.to_bytes()) => {}
            _ => return Err(JoinError::BadMic),
        }
        let seen = self
            .used_nonces
            .entry((req.join_eui, req.dev_eui))
            .or_default();
        if !seen.insert(req.dev_nonce) {
            return Err(JoinError::DuplicateDevNonce);
        }
        Ok(self.build_accept(&key, req.dev_nonce))
    }

    /// Process a rejoin request; the device is looked up by DevEUI.
    pub fn handle_rejoin(
        &mut self,
        req: &RejoinRequest,
    ) -> Result<(JoinAccept, [u8; 16], [u8; 16]), JoinError> {
        let key = *self
            .app_keys
            .iter()
            .find(|((_, dev_eui), _)| *dev_eui == req.dev_eui)
            .map(|(_, key)| key)
            .ok_or(JoinError::UnknownDevEui)?;
        match req.mic {
            Some(mic) if mic == security::compute_join_mic(&key, &req.to_bytes()) => {}
            _ => return Err(JoinError::BadMic),
        }
        let seen = self.used_rejoin_counts.entry(req.dev_eui).or_default();
        if !seen.insert(req.rj_count) {
            return Err(JoinError::DuplicateDevNonce);
        }
        Ok(self.build_accept(&key, req.rj_count))
    }
}

pub struct NetworkServer {
    /// Event ids already delivered to the application.
    pub received_events: HashSet<u64>,
    /// First gateway that delivered each event.
    pub event_gateway: HashMap<u64, u32>,
    pub packets_received: u64,
    pub adr_enabled: bool,
    pub net_id: u32,
    pub scheduler: DownlinkScheduler,
    pub join_server: Option<JoinServer>,

    pub beacon_interval: f64,
    pub beacon_drift: f64,
    pub ping_slot_interval: f64,
    pub ping_slot_offset: f64,
    pub last_beacon_time: Option<f64>,

    next_dev_addr: u32,
    last_uplink_fcnt: HashMap<u32, u32>,
    /// Class-C receive windows the simulator must schedule.
    rx_window_requests: Vec<(u32, f64)>,
}

impl Default for NetworkServer {
    fn default() -> Self {
        Self::new()
    }
}

impl NetworkServer {
    pub fn new() -> Self {
        Self {
            received_events: HashSet::new(),
            event_gateway: HashMap::new(),
            packets_received: 0,
            adr_enabled: false,
            net_id: 0,
            scheduler: DownlinkScheduler::new(),
            join_server: None,
            beacon_interval: 128.0,
            beacon_drift: 0.0,
            ping_slot_interval: 1.0,
            ping_slot_offset: 2.0,
            last_beacon_time: None,
            next_dev_addr: 1,
            last_uplink_fcnt: HashMap::new(),
            rx_window_requests: Vec::new(),
        }
    }

    pub fn with_join_server(join_server: JoinServer) -> Self {
        Self {
            join_server: Some(join_server),
            ..Self::new()
        }
    }

    /// Record a beacon emission.
    pub fn notify_beacon(&mut self, time: f64) {
        self.last_beacon_time = Some(time);
    }

    /// Next beacon time after `after_time`.
    pub fn next_beacon_time(&self, after_time: f64) -> f64 {
        lorawan::next_beacon_time(
            after_time,
            self.beacon_interval,
            self.last_beacon_time,
            self.beacon_drift,
        )
    }

    /// RX windows requested by Class-C scheduling since the last call.
    pub fn take_rx_window_requests(&mut self) -> Vec<(u32, f64)> {
        std::mem::take(&mut self.rx_window_requests)
    }

    /// Process one uplink delivered by a gateway.
    ///
    /// Duplicates (same event heard by several gateways) are dropped here;
    /// this deduplication is load-bearing for every delivery metric.
    #[allow(clippy::too_many_arguments)]
    pub fn receive<R: Rng>(
        &mut self,
        event_id: u64,
        node_id: u32,
        gateway_id: u32,
        rssi: Option<f64>,
        frame: Option<UplinkFrame>,
        ctx: &mut ServerContext<'_>,
        rng: &mut R,
    ) {
        if self.received_events.contains(&event_id) {
            debug!("server: duplicate event {event_id} from node {node_id} ignored");
            return;
        }
        self.received_events.insert(event_id);
        self.event_gateway.insert(event_id, gateway_id);
        self.packets_received += 1;
        debug!("server: event {event_id} from node {node_id} via gateway {gateway_id}");

        if Self::node_index(ctx.nodes, node_id).is_none() {
            return;
        }

        match &frame {
            Some(UplinkFrame::Join(req)) if self.join_server.is_some() => {
                self.handle_join_request(ctx, node_id, gateway_id, *req);
                return;
            }
            Some(UplinkFrame::Rejoin(req)) if self.join_server.is_some() => {
                self.handle_rejoin_request(ctx, node_id, gateway_id, *req);
                return;
            }
            Some(UplinkFrame::Data(data)) => {
                if !self.validate_data_frame(ctx.nodes, node_id, data) {
                    return;
                }
            }
            _ => {}
        }

        let (activated, adr_ack) = {
            let node = Self::node(ctx.nodes, node_id);
            (node.activated, node.adr_ack_requested)
        };
        if !activated {
            self.activate(ctx, node_id, Some(gateway_id));
        }
        if adr_ack {
            // Device asked for proof of downlink connectivity
            self.send_downlink(
                ctx,
                node_id,
                Payload::Raw(Vec::new()),
                DownlinkOptions {
                    confirmed: true,
                    gateway: Some(gateway_id),
                    ..Default::default()
                },
            );
            Self::node_mut(ctx.nodes, node_id).adr_ack_requested = false;
        }

        if self.adr_enabled {
            if let Some(rssi) = rssi {
                self.adr_step(ctx, node_id, rssi, rng);
            }
        }
    }

    fn handle_join_request(
        &mut self,
        ctx: &mut ServerContext<'_>,
        node_id: u32,
        gateway_id: u32,
        req: JoinRequest,
    ) {
        let join_server = self.join_server.as_mut().expect("checked by caller");
        let (accept, nwk_skey, app_skey) = match join_server.handle_join(&req) {
            Ok(result) => result,
            Err(err) => {
                debug!("server: join request from node {node_id} rejected: {err}");
                return;
            }
        };
        let node = Self::node_mut(ctx.nodes, node_id);
        node.nwk_skey = nwk_skey;
        node.app_skey = app_skey;
        node.dev_addr = accept.dev_addr;
        node.activated = true;
        self.send_downlink(
            ctx,
            node_id,
            Payload::Join(accept),
            DownlinkOptions {
                gateway: Some(gateway_id),
                ..Default::default()
            },
        );
    }

    fn handle_rejoin_request(
        &mut self,
        ctx: &mut ServerContext<'_>,
        node_id: u32,
        gateway_id: u32,
        req: RejoinRequest,
    ) {
        let join_server = self.join_server.as_mut().expect("checked by caller");
        let (accept, nwk_skey, app_skey) = match join_server.handle_rejoin(&req) {
            Ok(result) => result,
            Err(err) => {
                debug!("server: rejoin request from node {node_id} rejected: {err}");
                return;
            }
        };
        let node = Self::node_mut(ctx.nodes, node_id);
        node.nwk_skey = nwk_skey;
        node.app_skey = app_skey;
        node.dev_addr = accept.dev_addr;
        self.send_downlink(
            ctx,
            node_id,
            Payload::Join(accept),
            DownlinkOptions {
                gateway: Some(gateway_id),
                ..Default::default()
            },
        );
    }

    /// MIC and frame-counter screening of a secured data frame.
    fn validate_data_frame(&mut self, nodes: &mut [Node], node_id: u32, frame: &LoRaWanFrame) -> bool {
        let node = Self::node(nodes, node_id);
        if !node.security_enabled {
            return true;
        }
        let mic_ok = frame.mic.is_some_and(|mic| {
            security::validate_mic(
                &node.nwk_skey,
                node.dev_addr,
                frame.fcnt,
                security::DIR_UPLINK,
                &frame.payload,
                &mic,
            )
        });
        if !mic_ok {
            debug!("server: bad MIC on uplink from node {node_id}, dropped");
            return false;
        }
        if let Some(&last) = self.last_uplink_fcnt.get(&node_id) {
            if frame.fcnt <= last {
                debug!(
                    "server: replayed fcnt {} (last {}) from node {node_id}, dropped",
                    frame.fcnt, last
                );
                return false;
            }
        }
        self.last_uplink_fcnt.insert(node_id, frame.fcnt);
        true
    }

    /// ABP-style activation performed server-side when a device without a
    /// join server shows up unactivated.
    fn activate(&mut self, ctx: &mut ServerContext<'_>, node_id: u32, gateway: Option<u32>) {
        let app_nonce = self.next_dev_addr & 0xFF_FFFF;
        let dev_addr = self.next_dev_addr;
        self.next_dev_addr += 1;

        let node = Self::node_mut(ctx.nodes, node_id);
        let dev_nonce = node.dev_nonce.wrapping_sub(1);
        let (nwk_skey, app_skey) =
            security::derive_session_keys(&node.app_key, dev_nonce, app_nonce, self.net_id);
        node.nwk_skey = nwk_skey;
        node.app_skey = app_skey;

        let mut accept = JoinAccept::new(app_nonce, self.net_id, dev_addr);
        if node.security_enabled {
            let (encrypted, mic) = security::encrypt_join_accept(&node.app_key, &accept);
            accept.encrypted = Some(encrypted);
            accept.mic = Some(mic);
        }
        self.send_downlink(
            ctx,
            node_id,
            Payload::Join(accept),
            DownlinkOptions {
                gateway,
                ..Default::default()
            },
        );
    }

    /// Server-side ADR: collect SNR samples and, once the window is full,
    /// command the best (SF, power) pair reachable within the link margin.
    fn adr_step<R: Rng>(
        &mut self,
        ctx: &mut ServerContext<'_>,
        node_id: u32,
        rssi: f64,
        rng: &mut R,
    ) {
        let noise = phy::noise_floor(ctx.channel, rng);
        let node = Self::node_mut(ctx.nodes, node_id);
        node.push_snr(rssi - noise);
        if node.snr_history.len() < crate::node::HISTORY_LEN {
            return;
        }

        let max_snr = node
            .snr_history
            .iter()
            .copied()
            .fold(f64::NEG_INFINITY, f64::max);
        let margin = max_snr - lorawan::required_snr(node.sf) - lorawan::MARGIN_DB;
        let mut nstep = (margin / 3.0).round() as i32;

        let mut sf = node.sf;
        let mut p_idx = lorawan::dbm_to_tx_power_index(node.tx_power_dbm);
        if nstep > 0 {
            while nstep > 0 && (sf > 7 || p_idx < lorawan::TX_POWER_MAX_IDX) {
                if sf > 7 {
                    sf -= 1;
                } else {
                    p_idx += 1;
                }
                nstep -= 1;
            }
        } else if nstep < 0 {
            while nstep < 0 && (p_idx > 0 || sf < 12) {
                if p_idx > 0 {
                    p_idx -= 1;
                } else {
                    sf += 1;
                }
                nstep += 1;
            }
        }

        let power = lorawan::TX_POWER_INDEX_TO_DBM[p_idx];
        if sf != node.sf || power != node.tx_power_dbm {
            debug!(
                "server ADR: node {node_id} SF{} @ {} dBm -> SF{sf} @ {power} dBm",
                node.sf, node.tx_power_dbm
            );
            let command = AdrCommand {
                sf,
                power_dbm: power,
                ch_mask: node.chmask,
                nb_trans: node.nb_trans,
            };
            node.snr_history.clear();
            self.send_downlink(
                ctx,
                node_id,
                Payload::Raw(Vec::new()),
                DownlinkOptions {
                    adr_command: Some(command),
                    ..Default::default()
                },
            );
        }
    }

    /// Queue a downlink for a node, routed by device class.
    pub fn send_downlink(
        &mut self,
        ctx: &mut ServerContext<'_>,
        node_id: u32,
        payload: Payload,
        opts: DownlinkOptions,
    ) {
        let gateway_id = match opts.gateway.or_else(|| ctx.gateways.first().map(|g| g.id)) {
            Some(id) => id,
            None => return,
        };
        let Some(node_idx) = Self::node_index(ctx.nodes, node_id) else {
            return;
        };
        let node = &mut ctx.nodes[node_idx];

        let fctrl = if opts.request_ack { 0x20 } else { 0 };
        let mhdr = if opts.confirmed { 0xA0 } else { 0x60 };
        let mut frame = match payload {
            Payload::Join(accept) => DownlinkFrame::Join(accept),
            Payload::Data(data) => DownlinkFrame::Data(data),
            Payload::Raw(bytes) => DownlinkFrame::Data(LoRaWanFrame::new(
                mhdr,
                fctrl,
                node.fcnt_down,
                bytes,
                opts.confirmed,
            )),
        };

        if let (Some(cmd), DownlinkFrame::Data(data)) = (&opts.adr_command, &mut frame) {
            data.payload = LinkAdrReq {
                data_rate: lorawan::sf_to_dr(cmd.sf),
                tx_power: lorawan::dbm_to_tx_power_index(cmd.power_dbm) as u8,
                ch_mask: cmd.ch_mask,
                nb_trans: cmd.nb_trans,
            }
            .to_bytes();
        }
        if node.security_enabled {
            if let DownlinkFrame::Data(data) = &mut frame {
                let encrypted = security::encrypt_payload(
                    &node.app_skey,
                    node.dev_addr,
                    node.fcnt_down,
                    security::DIR_DOWNLINK,
                    &data.payload,
                );
                data.mic = Some(security::compute_mic(
                    &node.nwk_skey,
                    node.dev_addr,
                    node.fcnt_down,
                    security::DIR_DOWNLINK,
                    &encrypted,
                ));
                data.encrypted_payload = Some(encrypted);
            }
        }
        node.fcnt_down += 1;
        node.downlink_pending += 1;

        let class = node.class;
        match (class, opts.at_time) {
            (DeviceClass::B, at_time) => {
                let after = at_time.unwrap_or(ctx.now);
                let node = &ctx.nodes[node_idx];
                self.scheduler.schedule_class_b(
                    node,
                    after,
                    frame,
                    gateway_id,
                    self.beacon_interval,
                    self.ping_slot_interval,
                    self.ping_slot_offset,
                );
            }
            (DeviceClass::C, Some(at_time)) => {
                self.scheduler
                    .schedule_class_c(node_id, at_time, frame, gateway_id);
                self.rx_window_requests.push((node_id, at_time));
            }
            (_, Some(at_time)) => {
                self.scheduler.schedule(node_id, at_time, frame, gateway_id);
            }
            (_, None) => {
                if let Some(gw) = ctx.gateways.iter_mut().find(|g| g.id == gateway_id) {
                    gw.buffer_downlink(node_id, frame);
                }
            }
        }
    }

    /// Move due scheduled frames into the gateway buffer for `node_id`.
    ///
    /// A head frame overdue by more than the tolerance (missed beacon, clock
    /// skew) is drained at its own scheduled time before current-time pops.
    pub fn deliver_scheduled(&mut self, node_id: u32, now: f64, gateways: &mut [Gateway]) {
        let buffer = |gateways: &mut [Gateway], frame: DownlinkFrame, gw_id: u32| {
            if let Some(gw) = gateways.iter_mut().find(|g| g.id == gw_id) {
                gw.buffer_downlink(node_id, frame);
            }
        };
        if let Some(next) = self.scheduler.next_time(node_id) {
            if next < now - OVERDUE_TOLERANCE_S {
                if let Some((frame, gw_id)) = self.scheduler.pop_ready(node_id, next) {
                    buffer(gateways, frame, gw_id);
                }
            }
        }
        while let Some((frame, gw_id)) = self.scheduler.pop_ready(node_id, now) {
            buffer(gateways, frame, gw_id);
        }
    }

    fn node_index(nodes: &[Node], node_id: u32) -> Option<usize> {
        nodes.iter().position(|n| n.id == node_id)
    }

    fn node<'b>(nodes: &'b [Node], node_id: u32) -> &'b Node {
        nodes
            .iter()
            .find(|n| n.id == node_id)
            .expect("node ids are stable for the whole run")
    }

    fn node_mut<'b>(nodes: &'b mut [Node], node_id: u32) -> &'b mut Node {
        nodes
            .iter_mut()
            .find(|n| n.id == node_id)
            .expect("node ids are stable for the whole run")
    }
}
