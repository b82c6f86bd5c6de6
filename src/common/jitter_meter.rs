//! receive side link quality metering
//!
//! Three decaying counters track how the inbound stream is doing:
//! packets seen, packets lost (recovered or not) and packets damaged
//! (unrecoverable, replaced by silence).  Once the packet counter fills
//! its window all three are halved, so the numbers behave like a slow
//! EWMA and old trouble fades out.  Inter-arrival spacing feeds a
//! windowed sigma which is the jitter figure reported upward.
use std::fmt;

use crate::common::stream_time_stat::StreamTimeStat;

const DECAY_WINDOW: f32 = 256.0;
const ARRIVAL_WINDOW: usize = 64;

pub struct JitterMeter {
    packets: f32,
    loss: f32,
    damage: f32,
    arrival: StreamTimeStat,
    last_tick: Option<u16>,
}

impl JitterMeter {
    pub fn new() -> JitterMeter {
        JitterMeter {
            packets: 0.0,
            loss: 0.0,
            damage: 0.0,
            arrival: StreamTimeStat::new(ARRIVAL_WINDOW),
            last_tick: None,
        }
    }

    pub fn clear(&mut self) -> () {
        self.packets = 0.0;
        self.loss = 0.0;
        self.damage = 0.0;
        self.arrival.clear();
        self.last_tick = None;
    }

    /// a frame arrived, at the given millisecond tick
    pub fn rx_packet(&mut self, now: u16) -> () {
        self.packets += 1.0;
        if let Some(last) = self.last_tick {
            self.arrival.add_sample(now.wrapping_sub(last) as f64);
        }
        self.last_tick = Some(now);
        if self.packets >= DECAY_WINDOW {
            self.packets /= 2.0;
            self.loss /= 2.0;
            self.damage /= 2.0;
        }
    }

    /// a frame went missing.  Counted even when recovery conceals it.
    pub fn rx_loss(&mut self) -> () {
        self.loss += 1.0;
    }

    /// a frame was unrecoverable and got replaced with silence
    pub fn rx_damage(&mut self) -> () {
        self.damage += 1.0;
    }

    pub fn get_packets(&self) -> f32 {
        self.packets
    }
    pub fn get_loss(&self) -> f32 {
        self.loss
    }
    pub fn get_damage(&self) -> f32 {
        self.damage
    }
    /// sigma of the inter-arrival spacing in ticks
    pub fn get_jitter(&self) -> f64 {
        self.arrival.get_sigma()
    }
}

impl fmt::Display for JitterMeter {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{{ packets: {:.0}, loss: {:.0}, damage: {:.0}, jitter: {:.2} }}",
            self.packets,
            self.loss,
            self.damage,
            self.get_jitter()
        )
    }
}
