//! Gateway reception model.
//!
//! A gateway tracks every in-flight uplink per `(frequency, SF)` pair and
//! resolves capture/collision pairwise as new signals arrive. It also holds a
//! per-device FIFO of downlink frames waiting for the device's next receive
//! window.

use std::collections::{HashMap, VecDeque};

use log::debug;

use crate::geometry::Point;
use crate::lorawan::{DownlinkFrame, UplinkFrame};
use crate::phy;

/// One uplink currently on the air at this gateway.
#[derive(Debug, Clone)]
pub struct Reception {
    pub event_id: u64,
    pub node_id: u32,
    pub rssi: f64,
    pub end_time: f64,
    pub lost: bool,
    pub frame: Option<UplinkFrame>,
}

/// An uplink the gateway hands to the network server at transmission end.
#[derive(Debug)]
pub struct Delivery {
    pub node_id: u32,
    pub rssi: f64,
    pub frame: Option<UplinkFrame>,
}

pub struct Gateway {
    pub id: u32,
    pub position: Point,
    in_flight: HashMap<(u64, u8), Vec<Reception>>,
    downlink_buffer: HashMap<u32, VecDeque<DownlinkFrame>>,
}

impl Gateway {
    pub fn new(id: u32, x: f64, y: f64) -> Self {
        Self {
            id,
            position: Point::new(x, y),
            in_flight: HashMap::new(),
            downlink_buffer: HashMap::new(),
        }
    }

    /// Register an uplink arriving now and ending at `end_time`, resolving
    /// capture against every signal already in flight on the same slot.
    ///
    /// A signal marked lost never recovers, even if it later becomes the
    /// strongest survivor.
    #[allow(clippy::too_many_arguments)]
    pub fn start_reception(
        &mut self,
        event_id: u64,
        node_id: u32,
        sf: u8,
        rssi: f64,
        end_time: f64,
        capture_threshold_db: f64,
        now: f64,
        frequency_hz: f64,
        frame: Option<UplinkFrame>,
    ) {
        let slot = self
            .in_flight
            .entry((frequency_hz as u64, sf))
            .or_default();
        slot.push(Reception {
            event_id,
            node_id,
            rssi,
            end_time,
            lost: false,
            frame,
        });

        let contending: Vec<usize> = slot
            .iter()
            .enumerate()
            .filter(|(_, r)| r.end_time > now)
            .map(|(i, _)| i)
            .collect();
        if contending.len() < 2 {
            return;
        }

        let rssi_list: Vec<f64> = contending.iter().map(|&i| slot[i].rssi).collect();
        let winners = phy::capture(&rssi_list, capture_threshold_db);
        for (pos, &idx) in contending.iter().enumerate() {
            if !winners[pos] {
                if !slot[idx].lost {
                    debug!(
                        "gateway {}: event {} from node {} lost in collision",
                        self.id, slot[idx].event_id, slot[idx].node_id
                    );
                }
                slot[idx].lost = true;
            }
        }
    }

    /// Finalize an uplink: remove its in-flight record and, if it survived the
    /// contention, return the delivery the server should process.
    pub fn end_reception(&mut self, event_id: u64) -> Option<Delivery> {
        for slot in self.in_flight.values_mut() {
            if let Some(pos) = slot.iter().position(|r| r.event_id == event_id) {
                let reception = slot.remove(pos);
                if reception.lost {
                    return None;
                }
                return Some(Delivery {
                    node_id: reception.node_id,
                    rssi: reception.rssi,
                    frame: reception.frame,
                });
            }
        }
        None
    }

    /// Queue a downlink for a device, delivered at its next receive window.
    pub fn buffer_downlink(&mut self, node_id: u32, frame: DownlinkFrame) {
        self.downlink_buffer.entry(node_id).or_default().push_back(frame);
    }

    /// Pop the oldest pending downlink for a device, if any.
    pub fn pop_downlink(&mut self, node_id: u32) -> Option<DownlinkFrame> {
        self.downlink_buffer.get_mut(&node_id)?.pop_front()
    }

    /// Whether any downlink is still buffered for a device.
    pub fn has_pending_downlink(&self, node_id: u32) -> bool {
        self.downlink_buffer
            .get(&node_id)
            .is_some_and(|q| !q.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lorawan::LoRaWanFrame;

    const FREQ: f64 = 868.1e6;

    fn start(gw: &mut Gateway, event_id: u64, node_id: u32, rssi: f64) {
        gw.start_reception(event_id, node_id, 7, rssi, 1.0, 6.0, 0.0, FREQ, None);
    }

    #[test]
    fn lone_signal_is_delivered() {
        let mut gw = Gateway::new(0, 0.0, 0.0);
        start(&mut gw, 1, 10, -80.0);
        let delivery = gw.end_reception(1).expect("signal survived");
        assert_eq!(delivery.node_id, 10);
        assert_eq!(delivery.rssi, -80.0);
        assert!(gw.end_reception(1).is_none());
    }

    #[test]
    fn equal_signals_destroy_each_other() {
        let mut gw = Gateway::new(0, 0.0, 0.0);
        start(&mut gw, 1, 10, -80.0);
        start(&mut gw, 2, 11, -80.0);
        assert!(gw.end_reception(1).is_none());
        assert!(gw.end_reception(2).is_none());
    }

    #[test]
    fn strong_signal_captures_weak_one() {
        let mut gw = Gateway::new(0, 0.0, 0.0);
        start(&mut gw, 1, 10, -60.0);
        start(&mut gw, 2, 11, -90.0);
        assert!(gw.end_reception(1).is_some());
        assert!(gw.end_reception(2).is_none());
    }

    #[test]
    fn sub_threshold_lead_loses_both() {
        let mut gw = Gateway::new(0, 0.0, 0.0);
        start(&mut gw, 1, 10, -80.0);
        start(&mut gw, 2, 11, -84.0);
        assert!(gw.end_reception(1).is_none());
        assert!(gw.end_reception(2).is_none());
    }

    #[test]
    fn lost_signal_never_recovers() {
        let mut gw = Gateway::new(0, 0.0, 0.0);
        // Two equal signals kill each other; a later strong arrival must not
        // resurrect either of them.
        start(&mut gw, 1, 10, -80.0);
        start(&mut gw, 2, 11, -80.0);
        start(&mut gw, 3, 12, -50.0);
        assert!(gw.end_reception(1).is_none());
        assert!(gw.end_reception(2).is_none());
        assert!(gw.end_reception(3).is_some());
    }

    #[test]
    fn different_sf_slots_do_not_contend() {
        let mut gw = Gateway::new(0, 0.0, 0.0);
        gw.start_reception(1, 10, 7, -80.0, 1.0, 6.0, 0.0, FREQ, None);
        gw.start_reception(2, 11, 8, -80.0, 1.0, 6.0, 0.0, FREQ, None);
        assert!(gw.end_reception(1).is_some());
        assert!(gw.end_reception(2).is_some());
    }

    #[test]
    fn non_overlapping_signals_do_not_contend() {
        let mut gw = Gateway::new(0, 0.0, 0.0);
        gw.start_reception(1, 10, 7, -80.0, 1.0, 6.0, 0.0, FREQ, None);
        // First signal already ended by t = 2.0
        let first = gw.end_reception(1);
        gw.start_reception(2, 11, 7, -80.0, 3.0, 6.0, 2.0, FREQ, None);
        assert!(first.is_some());
        assert!(gw.end_reception(2).is_some());
    }

    #[test]
    fn downlink_buffer_is_fifo_per_node() {
        let mut gw = Gateway::new(0, 0.0, 0.0);
        let mk = |fcnt| DownlinkFrame::Data(LoRaWanFrame::new(0x60, 0, fcnt, vec![], false));
        gw.buffer_downlink(5, mk(0));
        gw.buffer_downlink(5, mk(1));
        assert!(gw.has_pending_downlink(5));
        match gw.pop_downlink(5) {
            Some(DownlinkFrame::Data(f)) => assert_eq!(f.fcnt, 0),
            other => panic!("unexpected downlink: {other:?}"),
        }
        match gw.pop_downlink(5) {
            Some(DownlinkFrame::Data(f)) => assert_eq!(f.fcnt, 1),
            other => panic!("unexpected downlink: {other:?}"),
        }
        assert!(!gw.has_pending_downlink(5));
        assert!(gw.pop_downlink(6).is_none());
    }
}
