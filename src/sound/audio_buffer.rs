//! elastic per-stream audio buffering
//!
//! One AudioRingBuffer sits between the network and each consumer
//! channel.  It keeps a weighted histogram of its own post-pop depth
//! and uses that to decide when it is running deep enough to merge a
//! millisecond away (shrink) or starving and in need of a stretched
//! sample (grow).  Missing data is concealed by extrapolating the last
//! sample with a slow decay, and real audio fades back in over one
//! block so the splice is inaudible.
use crate::common::frame::{DEF_SAMPLES, SAMPLE_RATE, SEQ_MAX};

/// total ring capacity, two full sequence windows of audio
pub const MAX_SAMPLES: usize = SEQ_MAX as usize * 2 * DEF_SAMPLES;
const STAT_BUCKETS: usize = SEQ_MAX as usize * 2;
const FADE_SAMPLES: usize = DEF_SAMPLES;

pub struct AudioRingBuffer {
    samples: [f32; MAX_SAMPLES],
    stats: [f32; STAT_BUCKETS],
    last_sample: f32,
    consumer: usize,
    total: usize,
    limit: u16,
    fade_in: u16,
}

impl AudioRingBuffer {
    pub fn new() -> AudioRingBuffer {
        AudioRingBuffer {
            samples: [0.0; MAX_SAMPLES],
            stats: [0.0; STAT_BUCKETS],
            last_sample: 0.0,
            consumer: 0,
            total: 0,
            limit: 3,
            fade_in: FADE_SAMPLES as u16,
        }
    }

    pub fn clear(&mut self) -> () {
        self.samples = [0.0; MAX_SAMPLES];
        self.stats = [0.0; STAT_BUCKETS];
        self.last_sample = 0.0;
        self.consumer = 0;
        self.total = 0;
        // minimum depth target that still rides out one packet loss
        self.limit = 3;
        self.fade_in = FADE_SAMPLES as u16;
    }

    /// target depth in milliseconds of network jitter to absorb
    pub fn set_jitter_limit_ms(&mut self, limit: u16) -> () {
        self.limit = limit + 3;
    }

    pub fn total(&self) -> usize {
        self.total
    }

    fn first_busy_bucket(&self) -> usize {
        for x in 0..STAT_BUCKETS {
            if self.stats[x] >= 0.5 {
                return x;
            }
        }
        STAT_BUCKETS
    }

    /// 0 means starving, 1 is on target, 2 means plenty buffered.
    /// The consumer tick calls grow() after seeing 0 twice in a row.
    pub fn low_water(&self) -> u8 {
        let x = self.first_busy_bucket();
        if x < 2 {
            0
        } else if x > 2 {
            2
        } else {
            1
        }
    }

    /// same scan against the configured jitter limit
    pub fn high_water(&self) -> u8 {
        let x = self.first_busy_bucket();
        if x < self.limit as usize {
            0
        } else if x > self.limit as usize {
            2
        } else {
            1
        }
    }

    /// remove samples from the buffer, must be called periodically
    ///
    /// Underruns never fail.  The tail of the output gets a decaying
    /// extrapolation of the last real sample, the next real audio will
    /// be faded in, and the buffer is topped back up to one block so a
    /// single late packet cannot cause a second glitch right away.
    pub fn rem_samples(&mut self, dst: &mut [f32]) -> () {
        let mut num = dst.len();
        let underrun = num > self.total;

        // fill missing samples with the decayed last value
        if underrun {
            for x in self.total..num {
                self.last_sample -= self.last_sample / SAMPLE_RATE as f32;
                dst[x] = self.last_sample;
            }
            self.fade_in = FADE_SAMPLES as u16;
            num = self.total;
        }

        // account the depth left after this pop
        let mut index = (self.total - num) / DEF_SAMPLES;
        if index > STAT_BUCKETS - 1 {
            index = STAT_BUCKETS - 1;
        }
        self.stats[index] += 1.0;

        if self.stats[index] >= 256.0 {
            for x in 0..STAT_BUCKETS {
                self.stats[x] /= 2.0;
            }
            // the histogram peak sits above the jitter limit, give a
            // millisecond back
            if self.total >= num + DEF_SAMPLES && self.high_water() > 1 {
                self.shrink();
            }
        }

        for x in 0..num {
            dst[x] = self.samples[self.consumer];
            self.consumer = (self.consumer + 1) % MAX_SAMPLES;
        }
        self.total -= num;

        // refill a little after an underrun to avoid back to back hits
        if underrun {
            while self.total < DEF_SAMPLES {
                let producer = (self.consumer + self.total) % MAX_SAMPLES;
                self.last_sample -= self.last_sample / SAMPLE_RATE as f32;
                self.samples[producer] = self.last_sample;
                self.total += 1;
            }
        }
    }

    /// add samples, cross fading against the extrapolation when the
    /// stream is resuming after a gap
    pub fn add_samples(&mut self, src: &[f32]) -> () {
        let max = MAX_SAMPLES - self.total;
        let num = usize::min(src.len(), max);
        let mut producer = (self.consumer + self.total) % MAX_SAMPLES;

        for x in 0..num {
            if self.fade_in != 0 {
                let f = self.fade_in as f32 / FADE_SAMPLES as f32;
                self.last_sample -= self.last_sample / SAMPLE_RATE as f32;
                self.samples[producer] = src[x] * (1.0 - f) + self.last_sample * f;
                self.fade_in -= 1;
            } else {
                self.samples[producer] = src[x];
            }
            producer = (producer + 1) % MAX_SAMPLES;
        }
        if num != 0 {
            self.last_sample = self.samples[(producer + MAX_SAMPLES - 1) % MAX_SAMPLES];
            self.total += num;
        }
    }

    /// add a run of concealment samples in place of lost audio
    pub fn add_silence(&mut self, num: usize) -> () {
        let max = MAX_SAMPLES - self.total;
        let num = usize::min(num, max);
        let mut producer = (self.consumer + self.total) % MAX_SAMPLES;

        for _ in 0..num {
            self.last_sample -= self.last_sample / SAMPLE_RATE as f32;
            self.samples[producer] = self.last_sample;
            producer = (producer + 1) % MAX_SAMPLES;
        }
        if num != 0 {
            self.fade_in = FADE_SAMPLES as u16;
            self.total += num;
        }
    }

    /// stretch the buffer by one sample
    ///
    /// The last sample is split across two positions so the insert is a
    /// dispersion rather than a step.
    pub fn grow(&mut self) -> () {
        if self.total > 1 {
            let p0 = (self.consumer + self.total + MAX_SAMPLES - 1) % MAX_SAMPLES;
            let p1 = (self.consumer + self.total + MAX_SAMPLES - 2) % MAX_SAMPLES;
            let append = self.samples[p0];
            self.samples[p0] = (self.samples[p0] + self.samples[p1]) / 2.0;
            self.add_samples(&[append]);
        }
    }

    /// drop one millisecond of depth by cross fading the first block
    /// into the one after it
    pub fn shrink(&mut self) -> () {
        if self.total < DEF_SAMPLES {
            return;
        }
        for x in 0..DEF_SAMPLES {
            let factor = x as f32 * (1.0 / DEF_SAMPLES as f32);
            let p0 = self.consumer;
            let p1 = (self.consumer + DEF_SAMPLES) % MAX_SAMPLES;
            self.samples[p1] = self.samples[p0] * (1.0 - factor) + self.samples[p1] * factor;
            self.consumer = (self.consumer + 1) % MAX_SAMPLES;
            self.total -= 1;
        }
        // one millisecond less depth, slide the histogram with it
        for x in 0..STAT_BUCKETS - 1 {
            self.stats[x] = self.stats[x + 1];
        }
        self.stats[STAT_BUCKETS - 1] = 0.0;
    }

    #[cfg(test)]
    pub fn stat_bucket(&self, index: usize) -> f32 {
        self.stats[index]
    }
    #[cfg(test)]
    pub fn last_sample(&self) -> f32 {
        self.last_sample
    }
}

/// running peak meter with halving decay on read
pub struct AudioLevel {
    level: f32,
}

impl AudioLevel {
    pub fn new() -> AudioLevel {
        AudioLevel { level: 0.0 }
    }
    pub fn clear(&mut self) -> () {
        self.level = 0.0;
    }
    pub fn add_samples(&mut self, ptr: &[f32]) -> () {
        for v in ptr {
            let v = v.abs();
            if v > self.level {
                self.level = v;
            }
        }
        if self.level > 1.0 {
            self.level = 1.0;
        }
    }
    pub fn get_level(&mut self) -> f32 {
        let retval = self.level;
        self.level = retval / 2.0;
        retval
    }
}

/// logarithmic companding for level values on the wire
///
/// Keeps resolution where the ear wants it when a level meter value is
/// squeezed through a fader message.
pub fn level_encode(value: f32) -> f32 {
    let divisor = f32::ln(1.0 + 255.0);
    if value == 0.0 {
        0.0
    } else if value < 0.0 {
        -(f32::ln(1.0 - 255.0 * value) / divisor)
    } else {
        f32::ln(1.0 + 255.0 * value) / divisor
    }
}

pub fn level_decode(value: f32) -> f32 {
    let multiplier = 1.0 / 255.0;
    if value == 0.0 {
        0.0
    } else if value < 0.0 {
        -multiplier * (f32::powf(1.0 + 255.0, -value) - 1.0)
    } else {
        multiplier * (f32::powf(1.0 + 255.0, value) - 1.0)
    }
}

#[cfg(test)]
mod test_audio_buffer {
    use super::*;

    #[test]
    fn conservation() {
        let mut buf = AudioRingBuffer::new();
        let block = [0.1f32; 100];
        buf.add_samples(&block);
        assert_eq!(buf.total(), 100);
        buf.shrink();
        assert_eq!(buf.total(), 100 - DEF_SAMPLES);
        buf.grow();
        assert_eq!(buf.total(), 101 - DEF_SAMPLES);
        let mut out = [0f32; 20];
        buf.rem_samples(&mut out);
        assert_eq!(buf.total(), 81 - DEF_SAMPLES);
        buf.add_silence(10);
        assert_eq!(buf.total(), 91 - DEF_SAMPLES);
    }

    #[test]
    fn push_clamps_to_capacity() {
        let mut buf = AudioRingBuffer::new();
        let block = [0.1f32; MAX_SAMPLES + 100];
        buf.add_samples(&block);
        assert_eq!(buf.total(), MAX_SAMPLES);
        buf.add_silence(10);
        assert_eq!(buf.total(), MAX_SAMPLES);
    }

    #[test]
    fn underrun_conceals_and_refills() {
        let mut buf = AudioRingBuffer::new();
        let mut out = [9.9f32; DEF_SAMPLES];
        buf.rem_samples(&mut out);
        // nothing was buffered so the output is the decayed last sample,
        // which starts from zero
        for v in out {
            assert_eq!(v, 0.0);
        }
        // and the buffer topped itself up to one block
        assert_eq!(buf.total(), DEF_SAMPLES);
    }

    #[test]
    fn underrun_decay_is_smooth() {
        let mut buf = AudioRingBuffer::new();
        // leave a nonzero last sample behind
        let block = [0.8f32; DEF_SAMPLES];
        buf.add_samples(&block);
        let mut out = [0f32; DEF_SAMPLES];
        buf.rem_samples(&mut out);
        // now pop from empty and watch the tail decay
        let mut out = [0f32; DEF_SAMPLES];
        buf.rem_samples(&mut out);
        // the first block faded in from silence so the held value sits
        // just below the 0.8 input
        let mut prev = out[0];
        assert!(prev > 0.7 && prev < 0.8);
        for v in out.iter().skip(1) {
            assert!(*v > 0.0 && *v <= prev);
            // per sample step never exceeds the decay pole
            assert!((prev - *v).abs() <= prev / SAMPLE_RATE as f32 + 1e-7);
            prev = *v;
        }
    }

    #[test]
    fn fade_in_weight_is_monotonic() {
        let mut buf = AudioRingBuffer::new();
        // fresh buffer fades in from silence, so a constant input must
        // come out as a non decreasing ramp toward the input value
        let block = [1.0f32; FADE_SAMPLES + 8];
        buf.add_samples(&block);
        let mut out = [0f32; FADE_SAMPLES + 8];
        buf.rem_samples(&mut out);
        assert_eq!(out[0], 0.0);
        for x in 1..out.len() {
            assert!(out[x] >= out[x - 1]);
        }
        // fade complete, input passes through
        assert_eq!(out[FADE_SAMPLES], 1.0);
    }

    #[test]
    fn silence_sets_up_fade() {
        let mut buf = AudioRingBuffer::new();
        let block = [0.5f32; 2 * DEF_SAMPLES];
        buf.add_samples(&block);
        let mut out = [0f32; 2 * DEF_SAMPLES];
        buf.rem_samples(&mut out);
        buf.add_silence(DEF_SAMPLES);
        // audio after silence must not jump straight to full level
        let block = [0.9f32; DEF_SAMPLES];
        buf.add_samples(&block);
        let mut out = [0f32; 2 * DEF_SAMPLES];
        buf.rem_samples(&mut out);
        let first_real = out[DEF_SAMPLES];
        assert!(first_real < 0.9);
    }

    #[test]
    fn histogram_shrink_trigger() {
        let mut buf = AudioRingBuffer::new();
        // hold the buffer deep while popping until a bucket saturates
        let prefill = [0.2f32; 30 * DEF_SAMPLES];
        buf.add_samples(&prefill);
        let feed = [0.2f32; DEF_SAMPLES];
        let mut out = [0f32; DEF_SAMPLES];
        for _ in 0..255 {
            buf.add_samples(&feed);
            buf.rem_samples(&mut out);
        }
        assert_eq!(buf.total(), 30 * DEF_SAMPLES);
        // the 256th pop halves the stats and shrinks one block away
        buf.add_samples(&feed);
        buf.rem_samples(&mut out);
        assert_eq!(buf.total(), 29 * DEF_SAMPLES);
    }

    #[test]
    fn grow_disperses_the_step() {
        let mut buf = AudioRingBuffer::new();
        let mut buf2 = AudioRingBuffer::new();
        let ramp: Vec<f32> = (0..DEF_SAMPLES).map(|x| x as f32 / DEF_SAMPLES as f32).collect();
        buf.add_samples(&ramp);
        buf2.add_samples(&ramp);
        buf.grow();
        assert_eq!(buf.total(), buf2.total() + 1);
    }

    #[test]
    fn water_marks() {
        let mut buf = AudioRingBuffer::new();
        let mut out = [0f32; DEF_SAMPLES];
        // post-pop depth of zero lands in bucket zero, the starving case
        buf.add_samples(&[0.1f32; DEF_SAMPLES]);
        buf.rem_samples(&mut out);
        assert_eq!(buf.low_water(), 0);
        assert_eq!(buf.high_water(), 0);
        // park the depth around the fourth bucket and look again
        let mut buf = AudioRingBuffer::new();
        buf.add_samples(&[0.1f32; 5 * DEF_SAMPLES]);
        buf.rem_samples(&mut out);
        assert_eq!(buf.low_water(), 2);
        buf.set_jitter_limit_ms(6);
        assert_eq!(buf.high_water(), 0);
    }

    #[test]
    fn level_meter_decays_on_read() {
        let mut level = AudioLevel::new();
        level.add_samples(&[0.1, -0.6, 0.3]);
        assert_eq!(level.get_level(), 0.6);
        assert_eq!(level.get_level(), 0.3);
        level.add_samples(&[7.0]);
        assert_eq!(level.get_level(), 1.0);
    }

    #[test]
    fn level_companding_round_trip() {
        let mut v = -1.0f32;
        while v < 1.0 {
            let coded = level_encode(v);
            assert!(coded.abs() <= 1.0001);
            let back = level_decode(coded);
            assert!((back - v).abs() < 0.001, "level {} came back {}", v, back);
            v += 0.037;
        }
    }
}
