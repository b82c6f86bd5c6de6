//! float to packed PCM conversion for every wire sample width
//!
//! Samples on the wire are signed two's complement little-endian with
//! full range scaling, so a float in [-1.0, +1.0) maps onto the whole
//! integer range of the width.  24 bit values are sign extended when
//! read back.  The intermediate math runs in f64 so the 32 bit width
//! does not lose low bits to f32 rounding.

fn scale(v: f32, full: f64) -> f64 {
    (v as f64 * full).clamp(-full, full - 1.0)
}

pub fn encode_s8(v: f32) -> i8 {
    scale(v, 128.0) as i8
}

pub fn decode_s8(v: i8) -> f32 {
    (v as f64 / 128.0) as f32
}

pub fn encode_s16(v: f32) -> i16 {
    scale(v, 32768.0) as i16
}

pub fn decode_s16(v: i16) -> f32 {
    (v as f64 / 32768.0) as f32
}

pub fn encode_s24(v: f32) -> i32 {
    scale(v, 8_388_608.0) as i32
}

pub fn decode_s24(v: i32) -> f32 {
    (v as f64 / 8_388_608.0) as f32
}

pub fn encode_s32(v: f32) -> i32 {
    scale(v, 2_147_483_648.0) as i32
}

pub fn decode_s32(v: i32) -> f32 {
    (v as f64 / 2_147_483_648.0) as f32
}
