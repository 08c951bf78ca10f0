//! The tern event dispatch engine.
//!
//! A single-threaded, readiness-polled core that multiplexes IRC
//! server transports with a Unix control socket, turns inbound lines
//! into events, filters them through an ordered rule chain and fans
//! them out to plugins, hooks and watching control peers.
//!
//! The [`client`] module wires the pieces together; [`fsm`] holds the
//! protocol logic; [`net`] the reactor.
#![allow(clippy::type_complexity)]

pub mod client;
pub mod common;
pub mod fsm;
pub mod net;
