//! # LoRaWAN Network Simulator
//!
//! A discrete-event simulator for LoRaWAN uplink traffic: battery-powered end
//! devices transmit to one or more gateways over a shared radio channel, a
//! network server deduplicates multi-gateway deliveries and drives ADR, and a
//! downlink scheduler honors Class A/B/C receive-window semantics.
//!
//! ## Architecture
//!
//! The engine is single-threaded and cooperative: a global min-heap keyed on
//! `(time, event type, sequence id)` totally orders transmission starts/ends,
//! mobility steps and receive windows. Every event runs to completion, and
//! all randomness flows through one seeded RNG, so a run is reproducible from
//! its scenario alone.
//!
//! ## Module Organization
//!
//! - `simulator`: event union, min-heap loop, metrics and per-event log
//! - `phy`: pure PHY math (path loss, noise, RSSI/SNR, capture)
//! - `channel`: channel parameters, airtime, multi-channel distribution
//! - `gateway`: in-flight reception table and capture/collision resolution
//! - `node`: device state, energy model, receive-window bookkeeping
//! - `server`: deduplication, ADR, OTAA activation, downlink dispatch
//! - `downlink`: per-node future-downlink queues with ping-slot alignment
//! - `duty_cycle`: rolling one-hour regulatory airtime budget
//! - `mobility`: smooth random-waypoint movement
//! - `lorawan`: shared frame types, MAC command codecs, crypto primitives
//! - `config`: JSON scenario loading and validation

pub mod channel;
pub mod config;
pub mod downlink;
pub mod duty_cycle;
pub mod gateway;
pub mod geometry;
pub mod lorawan;
pub mod mobility;
pub mod node;
pub mod phy;
pub mod server;
pub mod simulator;

pub use channel::{Channel, ChannelDistribution, MultiChannel, PhyModel};
pub use config::{ConfigError, ScenarioConfig, TransmissionMode};
pub use gateway::Gateway;
pub use lorawan::DeviceClass;
pub use node::Node;
pub use server::{JoinServer, NetworkServer};
pub use simulator::{Event, EventType, Metrics, Simulator, TxResult};
