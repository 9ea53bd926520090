//! Per-node downlink scheduling.
//!
//! The network server parks future downlinks here; the simulator's receive
//! windows drain them through the server back into gateway buffers. Class-B
//! entries are aligned to the device's ping-slot grid before insertion.

use std::collections::HashMap;

use crate::lorawan::DownlinkFrame;
use crate::node::Node;

/// A frame waiting to become deliverable.
#[derive(Debug)]
struct ScheduledDownlink {
    deliver_time: f64,
    seq: u64,
    frame: DownlinkFrame,
    gateway: u32,
}

/// Ordered future-downlink queues, one per node.
#[derive(Default)]
pub struct DownlinkScheduler {
    queues: HashMap<u32, Vec<ScheduledDownlink>>,
    seq: u64,
}

impl DownlinkScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a frame to become deliverable at `at_time`.
    ///
    /// Entries are kept sorted by `(deliver_time, seq)` so equal-time frames
    /// drain in scheduling order.
    pub fn schedule(&mut self, node_id: u32, at_time: f64, frame: DownlinkFrame, gateway: u32) {
        let seq = self.seq;
        self.seq += 1;
        let queue = self.queues.entry(node_id).or_default();
        let entry = ScheduledDownlink {
            deliver_time: at_time,
            seq,
            frame,
            gateway,
        };
        let pos = queue
            .iter()
            .position(|e| (e.deliver_time, e.seq) > (at_time, seq))
            .unwrap_or(queue.len());
        queue.insert(pos, entry);
    }

    /// Schedule on the node's Class-B ping-slot grid, at the first slot at or
    /// after `after`.
    #[allow(clippy::too_many_arguments)]
    pub fn schedule_class_b(
        &mut self,
        node: &Node,
        after: f64,
        frame: DownlinkFrame,
        gateway: u32,
        beacon_interval: f64,
        ping_slot_interval: f64,
        ping_slot_offset: f64,
    ) {
        let slot =
            node.next_ping_slot_time(after, beacon_interval, ping_slot_interval, ping_slot_offset);
        self.schedule(node.id, slot, frame, gateway);
    }

    /// Schedule a Class-C downlink at an exact time. The caller must also
    /// arrange a receive window at `at_time`.
    pub fn schedule_class_c(&mut self, node_id: u32, at_time: f64, frame: DownlinkFrame, gateway: u32) {
        self.schedule(node_id, at_time, frame, gateway);
    }

    /// Pop the earliest frame whose delivery time has arrived.
    pub fn pop_ready(&mut self, node_id: u32, now: f64) -> Option<(DownlinkFrame, u32)> {
        let queue = self.queues.get_mut(&node_id)?;
        if queue.first()?.deliver_time > now {
            return None;
        }
        let entry = queue.remove(0);
        Some((entry.frame, entry.gateway))
    }

    /// Delivery time of the node's next scheduled frame.
    pub fn next_time(&self, node_id: u32) -> Option<f64> {
        self.queues
            .get(&node_id)
            .and_then(|q| q.first())
            .map(|e| e.deliver_time)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lorawan::LoRaWanFrame;

    fn frame(fcnt: u32) -> DownlinkFrame {
        DownlinkFrame::Data(LoRaWanFrame::new(0x60, 0, fcnt, Vec::new(), false))
    }

    fn fcnt_of(frame: &DownlinkFrame) -> u32 {
        match frame {
            DownlinkFrame::Data(f) => f.fcnt,
            DownlinkFrame::Join(_) => panic!("unexpected join accept"),
        }
    }

    #[test]
    fn pop_ready_respects_deliver_time() {
        let mut sched = DownlinkScheduler::new();
        sched.schedule(1, 5.0, frame(0), 0);
        assert!(sched.pop_ready(1, 4.9).is_none());
        let (f, gw) = sched.pop_ready(1, 5.0).expect("frame is due");
        assert_eq!(fcnt_of(&f), 0);
        assert_eq!(gw, 0);
        assert!(sched.pop_ready(1, 100.0).is_none());
    }

    #[test]
    fn equal_times_drain_in_scheduling_order() {
        let mut sched = DownlinkScheduler::new();
        sched.schedule(1, 5.0, frame(0), 0);
        sched.schedule(1, 2.0, frame(1), 0);
        sched.schedule(1, 2.0, frame(2), 0);
        assert_eq!(sched.next_time(1), Some(2.0));
        assert_eq!(fcnt_of(&sched.pop_ready(1, 10.0).unwrap().0), 1);
        assert_eq!(fcnt_of(&sched.pop_ready(1, 10.0).unwrap().0), 2);
        assert_eq!(fcnt_of(&sched.pop_ready(1, 10.0).unwrap().0), 0);
    }

    #[test]
    fn class_b_aligns_to_ping_slots() {
        let mut sched = DownlinkScheduler::new();
        let mut node = Node::new(1, 0.0, 0.0, 7, 14.0, 0, None);
        node.last_beacon_time = Some(0.0);
        sched.schedule_class_b(&node, 0.2, frame(0), 0, 128.0, 1.0, 0.5);
        assert_eq!(sched.next_time(1), Some(0.5));
    }

    #[test]
    fn queues_are_independent_per_node() {
        let mut sched = DownlinkScheduler::new();
        sched.schedule(1, 1.0, frame(0), 0);
        sched.schedule(2, 1.0, frame(1), 0);
        assert_eq!(fcnt_of(&sched.pop_ready(1, 1.0).unwrap().0), 0);
        assert!(sched.pop_ready(1, 1.0).is_none());
        assert_eq!(fcnt_of(&sched.pop_ready(2, 1.0).unwrap().0), 1);
    }
}
