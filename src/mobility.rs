//! Smooth random-waypoint mobility.
//!
//! Each mobile node walks toward a random waypoint at a per-leg speed; when a
//! waypoint is reached a fresh one is drawn. Movement is applied in discrete
//! steps by the simulator's MOBILITY events, using the elapsed simulated time
//! since the node last moved.

use std::collections::HashMap;

use rand::Rng;

use crate::geometry::Point;
use crate::node::Node;

struct MobilityState {
    waypoint: Point,
    speed_mps: f64,
    last_move_time: f64,
}

pub struct SmoothMobility {
    area_size: f64,
    min_speed: f64,
    max_speed: f64,
    /// Interval between MOBILITY events (s).
    pub step: f64,
    states: HashMap<u32, MobilityState>,
}

impl SmoothMobility {
    pub fn new(area_size: f64, min_speed: f64, max_speed: f64) -> Self {
        Self {
            area_size,
            min_speed,
            max_speed,
            step: 1.0,
            states: HashMap::new(),
        }
    }

    fn draw_waypoint<R: Rng>(&self, rng: &mut R) -> Point {
        Point::new(
            rng.gen_range(0.0..self.area_size),
            rng.gen_range(0.0..self.area_size),
        )
    }

    /// Give a node an initial waypoint and speed.
    pub fn assign<R: Rng>(&mut self, node: &Node, rng: &mut R) {
        let waypoint = self.draw_waypoint(rng);
        let speed_mps = rng.gen_range(self.min_speed..=self.max_speed);
        self.states.insert(
            node.id,
            MobilityState {
                waypoint,
                speed_mps,
                last_move_time: 0.0,
            },
        );
    }

    /// Advance a node along its current leg up to `now`.
    pub fn move_node<R: Rng>(&mut self, node: &mut Node, now: f64, rng: &mut R) {
        let area = self.area_size;
        let min_speed = self.min_speed;
        let max_speed = self.max_speed;
        let Some(state) = self.states.get_mut(&node.id) else {
            return;
        };
        let elapsed = (now - state.last_move_time).max(0.0);
        state.last_move_time = now;

        let mut travel = state.speed_mps * elapsed;
        while travel > 0.0 {
            let dx = state.waypoint.x - node.position.x;
            let dy = state.waypoint.y - node.position.y;
            let leg = (dx * dx + dy * dy).sqrt();
            if leg <= travel {
                // Waypoint reached; start a new leg with fresh speed
                node.position = state.waypoint;
                travel -= leg;
                state.waypoint = Point::new(
                    rng.gen_range(0.0..area),
                    rng.gen_range(0.0..area),
                );
                state.speed_mps = rng.gen_range(min_speed..=max_speed);
                if leg == 0.0 {
                    break;
                }
            } else {
                node.position.x += dx / leg * travel;
                node.position.y += dy / leg * travel;
                travel = 0.0;
            }
        }
    }
}
