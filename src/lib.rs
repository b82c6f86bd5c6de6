//! jamlink - low latency jam session core
//!
//! provides the wire protocol, loss recovery and elastic audio buffering
//! for a multi participant jam session: clients push their audio to a
//! mixing room over UDP and get a personalized mix back, all inside a
//! few milliseconds.
extern crate json;

pub mod common;
pub mod server;
pub mod sound;
pub mod utils;
