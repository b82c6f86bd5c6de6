//! inner packet encoding
//!
//! Frames carry a train of these.  Every packet starts with a four byte
//! header: length (in 4-byte units, header included), type, local
//! sequence and peer sequence.  Audio payloads are packed PCM, control
//! payloads are tiny fixed layouts.  All multi-byte integers are little
//! endian.
use byteorder::{ByteOrder, LittleEndian};
use num::FromPrimitive as _;
use num_derive::{FromPrimitive, ToPrimitive};

use crate::common::sample_codec;

/// largest single packet, limited by the one byte length field
pub const MAX_PKT: usize = 255 * 4;
pub const PKT_HEADER_SIZE: usize = 4;

/// every packet type on the wire
///
/// 1 through 8 are the audio carriers, bit width by channel count.
/// Types from ConfigureRequest up ride the reliable control path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
pub enum PacketType {
    End = 0,
    Audio8Bit1Ch = 1,
    Audio8Bit2Ch = 2,
    Audio16Bit1Ch = 3,
    Audio16Bit2Ch = 4,
    Audio24Bit1Ch = 5,
    Audio24Bit2Ch = 6,
    Audio32Bit1Ch = 7,
    Audio32Bit2Ch = 8,
    MidiPacket = 61,
    AudioSilence = 62,
    Ack = 63,
    ConfigureRequest = 64,
    PingRequest = 65,
    PingReply = 66,
    IconRequest = 67,
    NameRequest = 68,
    LyricsRequest = 69,
    LyricsReply = 70,
    ChatRequest = 71,
    ChatReply = 72,
    FaderGainRequest = 73,
    FaderGainReply = 74,
    FaderPanRequest = 75,
    FaderPanReply = 76,
    FaderBitsRequest = 77,
    FaderBitsReply = 78,
    FaderIconReply = 79,
    FaderNameReply = 80,
    FaderLevelReply = 81,
    FaderEqRequest = 82,
    FaderEqReply = 83,
    FaderDisconnectReply = 84,
    LocalGainReply = 85,
    LocalPanReply = 86,
    LocalEqReply = 87,
}

impl PacketType {
    pub fn is_audio(&self) -> bool {
        let v = *self as u8;
        v >= 1 && v <= 8
    }
    /// control types are retransmitted until acknowledged
    pub fn is_reliable(&self) -> bool {
        (*self as u8) >= PacketType::ConfigureRequest as u8
    }
    /// bytes one wire sample occupies, all channels included
    pub fn sample_stride(&self) -> usize {
        match self {
            PacketType::Audio8Bit1Ch => 1,
            PacketType::Audio8Bit2Ch => 2,
            PacketType::Audio16Bit1Ch => 2,
            PacketType::Audio16Bit2Ch => 4,
            PacketType::Audio24Bit1Ch => 3,
            PacketType::Audio24Bit2Ch => 6,
            PacketType::Audio32Bit1Ch => 4,
            PacketType::Audio32Bit2Ch => 8,
            _ => 0,
        }
    }
    pub fn is_stereo(&self) -> bool {
        matches!(
            self,
            PacketType::Audio8Bit2Ch
                | PacketType::Audio16Bit2Ch
                | PacketType::Audio24Bit2Ch
                | PacketType::Audio32Bit2Ch
        )
    }
}

/// borrowed view of one packet inside a frame
#[derive(Clone, Copy)]
pub struct Packet<'a> {
    buf: &'a [u8],
}

impl<'a> Packet<'a> {
    pub fn len_words(&self) -> usize {
        self.buf[0] as usize
    }
    pub fn num_bytes(&self) -> usize {
        self.len_words() * 4
    }
    pub fn type_code(&self) -> u8 {
        self.buf[1]
    }
    pub fn packet_type(&self) -> Option<PacketType> {
        PacketType::from_u8(self.buf[1])
    }
    pub fn local_seq(&self) -> u8 {
        self.buf[2]
    }
    pub fn peer_seq(&self) -> u8 {
        self.buf[3]
    }
    pub fn payload(&self) -> &'a [u8] {
        &self.buf[PKT_HEADER_SIZE..]
    }
    pub fn raw(&self) -> &'a [u8] {
        self.buf
    }

    pub fn get_s8(&self, offset: usize) -> i8 {
        self.payload()[offset] as i8
    }
    pub fn get_s16(&self, offset: usize) -> i16 {
        LittleEndian::read_i16(&self.payload()[offset..offset + 2])
    }
    pub fn get_s24(&self, offset: usize) -> i32 {
        LittleEndian::read_i24(&self.payload()[offset..offset + 3])
    }
    pub fn get_s32(&self, offset: usize) -> i32 {
        LittleEndian::read_i32(&self.payload()[offset..offset + 4])
    }

    /// the requested output format from a configure request
    pub fn get_configure(&self) -> Option<u8> {
        if self.len_words() >= 2 {
            Some(self.payload()[0])
        } else {
            None
        }
    }

    /// (packets, time_ms, password) from a ping request or reply
    pub fn get_ping(&self) -> Option<(u16, u16, u64)> {
        if self.len_words() >= 4 {
            let packets = self.get_s16(0) as u16;
            let time_ms = self.get_s16(2) as u16;
            let passwd =
                ((self.get_s32(4) as u32) as u64) | (((self.get_s32(8) as u32) as u64) << 32);
            Some((packets, time_ms, passwd))
        } else {
            None
        }
    }

    /// number of silent samples carried by a silence token
    pub fn get_silence(&self) -> Option<u32> {
        if self.len_words() >= 2 {
            Some(self.get_s32(0) as u32)
        } else {
            None
        }
    }

    /// length prefixed blob used by chat, lyrics, name and midi payloads
    pub fn get_raw_data(&self) -> Option<&'a [u8]> {
        let payload = self.payload();
        if payload.len() < 2 {
            return None;
        }
        let len = LittleEndian::read_u16(&payload[0..2]) as usize;
        if 2 + len > payload.len() {
            return None;
        }
        Some(&payload[2..2 + len])
    }

    /// (chan, index, values) from a fader gain/pan/level message
    pub fn get_fader_value(&self) -> Option<(u8, u8, Vec<f32>)> {
        let payload = self.payload();
        if payload.len() < 4 {
            return None;
        }
        let count = LittleEndian::read_u16(&payload[2..4]) as usize;
        if 4 + count * 4 > payload.len() {
            return None;
        }
        let mut values = Vec::with_capacity(count);
        for i in 0..count {
            values.push(LittleEndian::read_f32(&payload[4 + i * 4..8 + i * 4]));
        }
        Some((payload[0], payload[1], values))
    }

    /// (chan, index, data) from a fader name/icon/eq message
    pub fn get_fader_data(&self) -> Option<(u8, u8, &'a [u8])> {
        let payload = self.payload();
        if payload.len() < 4 {
            return None;
        }
        let len = LittleEndian::read_u16(&payload[2..4]) as usize;
        if 4 + len > payload.len() {
            return None;
        }
        Some((payload[0], payload[1], &payload[4..4 + len]))
    }

    /// unpack an audio payload into the two channel slices
    ///
    /// Mono formats fill `left` only.  Counts are clamped to what the
    /// destination can hold, anything beyond is dropped on the floor.
    /// Returns (samples, stereo) or None when this is not an audio packet.
    pub fn decode_audio(&self, left: &mut [f32], right: &mut [f32]) -> Option<(usize, bool)> {
        let ptype = self.packet_type()?;
        let stride = ptype.sample_stride();
        if stride == 0 {
            return None;
        }
        let payload = self.payload();
        let avail = payload.len() / stride;
        let stereo = ptype.is_stereo();
        let num = if stereo {
            usize::min(avail, usize::min(left.len(), right.len()))
        } else {
            usize::min(avail, left.len())
        };
        for x in 0..num {
            let off = x * stride;
            match ptype {
                PacketType::Audio8Bit1Ch => {
                    left[x] = sample_codec::decode_s8(self.get_s8(off));
                }
                PacketType::Audio8Bit2Ch => {
                    left[x] = sample_codec::decode_s8(self.get_s8(off));
                    right[x] = sample_codec::decode_s8(self.get_s8(off + 1));
                }
                PacketType::Audio16Bit1Ch => {
                    left[x] = sample_codec::decode_s16(self.get_s16(off));
                }
                PacketType::Audio16Bit2Ch => {
                    left[x] = sample_codec::decode_s16(self.get_s16(off));
                    right[x] = sample_codec::decode_s16(self.get_s16(off + 2));
                }
                PacketType::Audio24Bit1Ch => {
                    left[x] = sample_codec::decode_s24(self.get_s24(off));
                }
                PacketType::Audio24Bit2Ch => {
                    left[x] = sample_codec::decode_s24(self.get_s24(off));
                    right[x] = sample_codec::decode_s24(self.get_s24(off + 3));
                }
                PacketType::Audio32Bit1Ch => {
                    left[x] = sample_codec::decode_s32(self.get_s32(off));
                }
                PacketType::Audio32Bit2Ch => {
                    left[x] = sample_codec::decode_s32(self.get_s32(off));
                    right[x] = sample_codec::decode_s32(self.get_s32(off + 4));
                }
                _ => return None,
            }
        }
        Some((num, stereo))
    }
}

/// walks the packets inside a frame payload, stopping at the first END
/// sentinel or malformed header
pub struct PacketIter<'a> {
    buf: &'a [u8],
    offset: usize,
}

impl<'a> PacketIter<'a> {
    pub fn new(buf: &'a [u8]) -> PacketIter<'a> {
        PacketIter { buf, offset: 0 }
    }
}

impl<'a> Iterator for PacketIter<'a> {
    type Item = Packet<'a>;

    fn next(&mut self) -> Option<Packet<'a>> {
        if self.offset + PKT_HEADER_SIZE > self.buf.len() {
            return None;
        }
        let words = self.buf[self.offset] as usize;
        let type_code = self.buf[self.offset + 1];
        if words == 0 || type_code == 0 {
            return None;
        }
        let end = self.offset + words * 4;
        if end > self.buf.len() {
            return None;
        }
        let pkt = Packet {
            buf: &self.buf[self.offset..end],
        };
        self.offset = end;
        Some(pkt)
    }
}

fn words_for_payload(len: usize) -> usize {
    1 + (len + 3) / 4
}

/// one owned packet, sized for the worst case so entries can sit in the
/// outbound queue without further allocation
#[derive(Clone, Copy)]
pub struct PacketEntry {
    raw: [u8; MAX_PKT],
}

impl PacketEntry {
    pub fn new() -> PacketEntry {
        PacketEntry { raw: [0; MAX_PKT] }
    }

    fn with_header(words: usize, ptype: PacketType) -> PacketEntry {
        let mut entry = PacketEntry::new();
        entry.raw[0] = words as u8;
        entry.raw[1] = ptype as u8;
        entry
    }

    pub fn len_words(&self) -> usize {
        self.raw[0] as usize
    }
    pub fn num_bytes(&self) -> usize {
        self.len_words() * 4
    }
    pub fn type_code(&self) -> u8 {
        self.raw[1]
    }
    pub fn packet_type(&self) -> Option<PacketType> {
        PacketType::from_u8(self.raw[1])
    }
    pub fn local_seq(&self) -> u8 {
        self.raw[2]
    }
    pub fn set_local_seq(&mut self, seq: u8) -> () {
        self.raw[2] = seq;
    }
    pub fn peer_seq(&self) -> u8 {
        self.raw[3]
    }
    pub fn set_peer_seq(&mut self, seq: u8) -> () {
        self.raw[3] = seq;
    }
    /// the bytes that go into a frame
    pub fn bytes(&self) -> &[u8] {
        &self.raw[0..self.num_bytes()]
    }
    pub fn as_packet(&self) -> Packet {
        Packet {
            buf: self.bytes(),
        }
    }

    fn put_s16(&mut self, offset: usize, v: i16) -> () {
        let at = PKT_HEADER_SIZE + offset;
        LittleEndian::write_i16(&mut self.raw[at..at + 2], v);
    }
    fn put_s32(&mut self, offset: usize, v: i32) -> () {
        let at = PKT_HEADER_SIZE + offset;
        LittleEndian::write_i32(&mut self.raw[at..at + 4], v);
    }

    /// request the peer to send us audio in the given format
    pub fn configure(format: u8) -> PacketEntry {
        let mut entry = PacketEntry::with_header(2, PacketType::ConfigureRequest);
        entry.raw[PKT_HEADER_SIZE] = format;
        entry
    }

    pub fn ping(ptype: PacketType, packets: u16, time_ms: u16, passwd: u64) -> PacketEntry {
        let mut entry = PacketEntry::with_header(4, ptype);
        entry.put_s16(0, packets as i16);
        entry.put_s16(2, time_ms as i16);
        entry.put_s32(4, passwd as u32 as i32);
        entry.put_s32(8, (passwd >> 32) as u32 as i32);
        entry
    }

    /// a run of silent samples, carried as a bare count
    pub fn silence(samples: u32) -> PacketEntry {
        let mut entry = PacketEntry::with_header(2, PacketType::AudioSilence);
        entry.put_s32(0, samples as i32);
        entry
    }

    /// length prefixed blob, used for chat, lyrics, name and midi data
    pub fn raw_data(ptype: PacketType, data: &[u8]) -> Option<PacketEntry> {
        let words = words_for_payload(2 + data.len());
        if words > 255 {
            return None;
        }
        let mut entry = PacketEntry::with_header(words, ptype);
        LittleEndian::write_u16(
            &mut entry.raw[PKT_HEADER_SIZE..PKT_HEADER_SIZE + 2],
            data.len() as u16,
        );
        entry.raw[PKT_HEADER_SIZE + 2..PKT_HEADER_SIZE + 2 + data.len()].copy_from_slice(data);
        Some(entry)
    }

    pub fn midi(data: &[u8]) -> Option<PacketEntry> {
        Self::raw_data(PacketType::MidiPacket, data)
    }

    /// fader gain/pan/level carrier addressed by (chan, index)
    pub fn fader_value(ptype: PacketType, chan: u8, index: u8, values: &[f32]) -> Option<PacketEntry> {
        let words = words_for_payload(4 + values.len() * 4);
        if words > 255 {
            return None;
        }
        let mut entry = PacketEntry::with_header(words, ptype);
        entry.raw[PKT_HEADER_SIZE] = chan;
        entry.raw[PKT_HEADER_SIZE + 1] = index;
        LittleEndian::write_u16(
            &mut entry.raw[PKT_HEADER_SIZE + 2..PKT_HEADER_SIZE + 4],
            values.len() as u16,
        );
        for (i, v) in values.iter().enumerate() {
            let at = PKT_HEADER_SIZE + 4 + i * 4;
            LittleEndian::write_f32(&mut entry.raw[at..at + 4], *v);
        }
        Some(entry)
    }

    /// fader name/icon/eq carrier addressed by (chan, index)
    pub fn fader_data(ptype: PacketType, chan: u8, index: u8, data: &[u8]) -> Option<PacketEntry> {
        let words = words_for_payload(4 + data.len());
        if words > 255 {
            return None;
        }
        let mut entry = PacketEntry::with_header(words, ptype);
        entry.raw[PKT_HEADER_SIZE] = chan;
        entry.raw[PKT_HEADER_SIZE + 1] = index;
        LittleEndian::write_u16(
            &mut entry.raw[PKT_HEADER_SIZE + 2..PKT_HEADER_SIZE + 4],
            data.len() as u16,
        );
        entry.raw[PKT_HEADER_SIZE + 4..PKT_HEADER_SIZE + 4 + data.len()].copy_from_slice(data);
        Some(entry)
    }

    /// pack a block of samples in the requested wire format
    ///
    /// Mono formats read `left` only.  Returns None when the block would
    /// not fit a single packet.
    pub fn audio(ptype: PacketType, left: &[f32], right: &[f32]) -> Option<PacketEntry> {
        let stride = ptype.sample_stride();
        if stride == 0 {
            return None;
        }
        let num = left.len();
        let words = words_for_payload(num * stride);
        if words > 255 {
            return None;
        }
        let mut entry = PacketEntry::with_header(words, ptype);
        for x in 0..num {
            let at = PKT_HEADER_SIZE + x * stride;
            match ptype {
                PacketType::Audio8Bit1Ch => {
                    entry.raw[at] = sample_codec::encode_s8(left[x]) as u8;
                }
                PacketType::Audio8Bit2Ch => {
                    entry.raw[at] = sample_codec::encode_s8(left[x]) as u8;
                    entry.raw[at + 1] = sample_codec::encode_s8(right[x]) as u8;
                }
                PacketType::Audio16Bit1Ch => {
                    LittleEndian::write_i16(
                        &mut entry.raw[at..at + 2],
                        sample_codec::encode_s16(left[x]),
                    );
                }
                PacketType::Audio16Bit2Ch => {
                    LittleEndian::write_i16(
                        &mut entry.raw[at..at + 2],
                        sample_codec::encode_s16(left[x]),
                    );
                    LittleEndian::write_i16(
                        &mut entry.raw[at + 2..at + 4],
                        sample_codec::encode_s16(right[x]),
                    );
                }
                PacketType::Audio24Bit1Ch => {
                    LittleEndian::write_i24(
                        &mut entry.raw[at..at + 3],
                        sample_codec::encode_s24(left[x]),
                    );
                }
                PacketType::Audio24Bit2Ch => {
                    LittleEndian::write_i24(
                        &mut entry.raw[at..at + 3],
                        sample_codec::encode_s24(left[x]),
                    );
                    LittleEndian::write_i24(
                        &mut entry.raw[at + 3..at + 6],
                        sample_codec::encode_s24(right[x]),
                    );
                }
                PacketType::Audio32Bit1Ch => {
                    LittleEndian::write_i32(
                        &mut entry.raw[at..at + 4],
                        sample_codec::encode_s32(left[x]),
                    );
                }
                PacketType::Audio32Bit2Ch => {
                    LittleEndian::write_i32(
                        &mut entry.raw[at..at + 4],
                        sample_codec::encode_s32(left[x]),
                    );
                    LittleEndian::write_i32(
                        &mut entry.raw[at + 4..at + 8],
                        sample_codec::encode_s32(right[x]),
                    );
                }
                _ => return None,
            }
        }
        Some(entry)
    }
}
