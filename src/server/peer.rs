//! per participant state on the mixing server
//!
//! One of these per mixer slot.  The room thread locks a peer, moves
//! audio through it and releases the lock before touching the next
//! slot, so there is never more than one peer lock held at a time.
use num::FromPrimitive as _;
use std::net::{SocketAddr, UdpSocket};
use std::sync::mpsc;

use crate::common::box_error::BoxError;
use crate::common::event::PeerEvent;
use crate::common::frame::{Frame, DEF_SAMPLES};
use crate::common::input_reassembler::InputReassembler;
use crate::common::jitter_meter::JitterMeter;
use crate::common::output_packetizer::OutputPacketizer;
use crate::common::packet::{Packet, PacketEntry, PacketType};
use crate::sound::audio_buffer::{level_encode, AudioLevel, AudioRingBuffer};
use crate::utils::clip_float;

/// mixer slots one room can hold
pub const PEERS_MAX: usize = 16;

const DECODE_MAX: usize = 512;

pub struct ServerPeer {
    index: u8,
    address: Option<SocketAddr>,
    valid: bool,
    passwd: u64,
    last_heard: u128,
    input: InputReassembler,
    output: OutputPacketizer,
    meter: JitterMeter,
    in_audio: [AudioRingBuffer; 2],
    in_level: [AudioLevel; 2],
    out_buffer: [AudioRingBuffer; 2],
    name: String,
    icon: Vec<u8>,
    // what this participant wants from every source slot
    bits: [u8; PEERS_MAX],
    mix_gain: [f32; PEERS_MAX],
    mix_pan: [f32; PEERS_MAX],
    // base contribution of this participant into the room
    gain: f32,
    pan: f32,
    output_fmt: PacketType,
    events: mpsc::Sender<PeerEvent>,
}

impl ServerPeer {
    pub fn new(index: u8, events: mpsc::Sender<PeerEvent>) -> ServerPeer {
        ServerPeer {
            index,
            address: None,
            valid: false,
            passwd: 0,
            last_heard: 0,
            input: InputReassembler::new(),
            output: OutputPacketizer::new(events.clone()),
            meter: JitterMeter::new(),
            in_audio: [AudioRingBuffer::new(), AudioRingBuffer::new()],
            in_level: [AudioLevel::new(), AudioLevel::new()],
            out_buffer: [AudioRingBuffer::new(), AudioRingBuffer::new()],
            name: String::new(),
            icon: Vec::new(),
            bits: [0; PEERS_MAX],
            mix_gain: [1.0; PEERS_MAX],
            mix_pan: [0.0; PEERS_MAX],
            gain: 1.0,
            pan: 0.0,
            output_fmt: PacketType::AudioSilence,
            events,
        }
    }

    /// claim this slot for a new participant
    pub fn activate(
        &mut self,
        addr: SocketAddr,
        passwd: u64,
        fec_distance: u8,
        jitter_ms: u16,
        now_micros: u128,
    ) -> () {
        self.input.clear();
        self.output.init(fec_distance);
        self.meter.clear();
        for chan in 0..2 {
            self.in_audio[chan].clear();
            self.in_audio[chan].set_jitter_limit_ms(jitter_ms);
            self.in_level[chan].clear();
            self.out_buffer[chan].clear();
        }
        self.name = String::new();
        self.icon = Vec::new();
        self.bits = [0; PEERS_MAX];
        self.mix_gain = [1.0; PEERS_MAX];
        self.mix_pan = [0.0; PEERS_MAX];
        self.gain = 1.0;
        self.pan = 0.0;
        // until a configure arrives the downlink is silence tokens only
        self.output_fmt = PacketType::AudioSilence;
        self.valid = false;
        self.passwd = passwd;
        self.last_heard = now_micros;
        self.address = Some(addr);
    }

    /// free the slot.  Queued control packets die with the session.
    pub fn deactivate(&mut self) -> () {
        self.address = None;
        self.valid = false;
        self.input.clear();
        self.output.init(2);
    }

    pub fn is_active(&self) -> bool {
        self.address.is_some()
    }
    /// has this participant proven the room password yet
    pub fn is_valid(&self) -> bool {
        self.valid
    }
    pub fn index(&self) -> u8 {
        self.index
    }
    pub fn address(&self) -> Option<SocketAddr> {
        self.address
    }
    pub fn name(&self) -> &str {
        &self.name
    }
    pub fn icon(&self) -> &[u8] {
        &self.icon
    }
    pub fn gain(&self) -> f32 {
        self.gain
    }
    pub fn pan(&self) -> f32 {
        self.pan
    }
    pub fn mix_gain(&self, slot: usize) -> f32 {
        self.mix_gain[slot]
    }
    pub fn mix_pan(&self, slot: usize) -> f32 {
        self.mix_pan[slot]
    }
    /// bit zero of the slot byte mutes that source for this listener
    pub fn muted(&self, slot: usize) -> bool {
        self.bits[slot] & 1 != 0
    }
    pub fn last_heard(&self) -> u128 {
        self.last_heard
    }
    pub fn rx_stats(&self) -> (f32, f32, f64) {
        (
            self.meter.get_loss(),
            self.meter.get_damage(),
            self.meter.get_jitter(),
        )
    }

    /// current input peaks, companded for a level reply
    pub fn encoded_levels(&mut self) -> (f32, f32) {
        (
            level_encode(self.in_level[0].get_level()),
            level_encode(self.in_level[1].get_level()),
        )
    }

    pub fn receive(&mut self, frame: &Frame, now: u16, now_micros: u128) -> () {
        if self.address.is_none() {
            return;
        }
        self.last_heard = now_micros;
        self.input.receive(frame, &mut self.meter, now);
    }

    /// queue a reliable control packet toward this participant
    pub fn queue_control(&mut self, entry: PacketEntry) -> () {
        if self.address.is_some() {
            self.output.enqueue(entry);
        }
    }

    /// drain the reassembler into the input buffers and control plane
    pub fn audio_import(&mut self, now: u16) -> () {
        self.input.recover(&mut self.meter);
        loop {
            let frame = match self.input.next_frame(&mut self.meter) {
                Some(f) => f,
                None => break,
            };
            self.process_frame(&frame, now);
        }
    }

    /// pop one block of this participant's uplink audio for the mixer
    pub fn pop_input(&mut self, left: &mut [f32], right: &mut [f32]) -> () {
        self.in_audio[0].rem_samples(left);
        self.in_audio[1].rem_samples(right);
        self.in_level[0].add_samples(left);
        self.in_level[1].add_samples(right);
    }

    /// push this participant's personalized mix block
    pub fn queue_mix(&mut self, left: &[f32], right: &[f32]) -> () {
        self.out_buffer[0].add_samples(left);
        self.out_buffer[1].add_samples(right);
    }

    /// encode one downlink block and put this tick's frame on the wire
    pub fn audio_export(&mut self, sock: &UdpSocket, now: u16) -> Result<(), BoxError> {
        let addr = match self.address {
            Some(a) => a,
            None => return Ok(()),
        };
        let mut left = [0f32; DEF_SAMPLES];
        let mut right = [0f32; DEF_SAMPLES];
        self.out_buffer[0].rem_samples(&mut left);
        self.out_buffer[1].rem_samples(&mut right);
        let entry = if self.output_fmt == PacketType::AudioSilence {
            Some(PacketEntry::silence(DEF_SAMPLES as u32))
        } else {
            PacketEntry::audio(self.output_fmt, &left, &right)
        };
        if let Some(entry) = entry {
            self.output.append(&entry);
        }
        self.output.send(sock, addr, now)?;
        Ok(())
    }

    fn process_frame(&mut self, frame: &Frame, now: u16) -> () {
        for pkt in frame.packets() {
            let ptype = match pkt.packet_type() {
                Some(t) => t,
                None => continue,
            };
            if ptype.is_audio() {
                let mut l = [0f32; DECODE_MAX];
                let mut r = [0f32; DECODE_MAX];
                if let Some((num, stereo)) = pkt.decode_audio(&mut l, &mut r) {
                    if !stereo {
                        r[0..num].copy_from_slice(&l[0..num]);
                    }
                    self.in_audio[0].add_samples(&l[0..num]);
                    self.in_audio[1].add_samples(&r[0..num]);
                }
                continue;
            }
            match ptype {
                PacketType::AudioSilence => {
                    if let Some(num) = pkt.get_silence() {
                        self.in_audio[0].add_silence(num as usize);
                        self.in_audio[1].add_silence(num as usize);
                    }
                }
                PacketType::Ack => {
                    self.output.handle_ack(pkt.peer_seq(), now);
                }
                PacketType::MidiPacket => {
                    if let Some(data) = pkt.get_raw_data() {
                        let _ = self.events.send(PeerEvent::Midi(data.to_vec()));
                    }
                }
                _ => {
                    if ptype.is_reliable() {
                        if pkt.local_seq() == self.output.peer_seqno() {
                            self.output.request_ack();
                        } else {
                            self.output.set_peer_seqno(pkt.local_seq());
                            self.output.request_ack();
                            self.handle_control(ptype, &pkt, now);
                        }
                    }
                }
            }
        }
    }

    fn handle_control(&mut self, ptype: PacketType, pkt: &Packet, _now: u16) -> () {
        match ptype {
            PacketType::ConfigureRequest => {
                if let Some(code) = pkt.get_configure() {
                    if let Some(fmt) = PacketType::from_u8(code) {
                        if fmt.is_audio() || fmt == PacketType::AudioSilence {
                            self.output_fmt = fmt;
                        }
                    }
                }
            }
            PacketType::PingRequest => {
                if let Some((packets, time_ms, passwd)) = pkt.get_ping() {
                    if passwd == self.passwd {
                        let welcome = !self.valid;
                        self.valid = true;
                        // echo the timestamp so the sender can take RTT
                        self.queue_control(PacketEntry::ping(
                            PacketType::PingReply,
                            packets,
                            time_ms,
                            0,
                        ));
                        if welcome {
                            // tell the newcomer which mixer slot is theirs
                            if let Some(entry) = PacketEntry::fader_data(
                                PacketType::FaderBitsReply,
                                0,
                                self.index,
                                &[],
                            ) {
                                self.queue_control(entry);
                            }
                        }
                    }
                }
            }
            PacketType::NameRequest => {
                if let Some(data) = pkt.get_raw_data() {
                    self.name = String::from_utf8_lossy(data).to_string();
                    let _ = self.events.send(PeerEvent::FaderName {
                        chan: 0,
                        index: self.index,
                        name: self.name.clone(),
                    });
                }
            }
            PacketType::IconRequest => {
                if let Some(data) = pkt.get_raw_data() {
                    self.icon = data.to_vec();
                    let _ = self.events.send(PeerEvent::FaderIcon {
                        chan: 0,
                        index: self.index,
                        icon: self.icon.clone(),
                    });
                }
            }
            PacketType::ChatRequest => {
                if let Some(data) = pkt.get_raw_data() {
                    let text = String::from_utf8_lossy(data).to_string();
                    let _ = self.events.send(PeerEvent::Chat(text));
                }
            }
            PacketType::LyricsRequest => {
                if let Some(data) = pkt.get_raw_data() {
                    let text = String::from_utf8_lossy(data).to_string();
                    let _ = self.events.send(PeerEvent::Lyrics(text));
                }
            }
            PacketType::FaderGainRequest => {
                if let Some((_, index, values)) = pkt.get_fader_value() {
                    if let Some(gain) = values.first() {
                        if (index as usize) < PEERS_MAX {
                            self.mix_gain[index as usize] = gain.max(0.0);
                        }
                    }
                }
            }
            PacketType::FaderPanRequest => {
                if let Some((_, index, values)) = pkt.get_fader_value() {
                    if let Some(pan) = values.first() {
                        if (index as usize) < PEERS_MAX {
                            self.mix_pan[index as usize] = clip_float(*pan);
                        }
                    }
                }
            }
            PacketType::FaderBitsRequest => {
                if let Some((_, _, data)) = pkt.get_fader_data() {
                    let num = usize::min(data.len(), PEERS_MAX);
                    self.bits[0..num].copy_from_slice(&data[0..num]);
                }
            }
            PacketType::FaderEqRequest => {
                // the eq itself runs outside this crate, pass it along
                if let Some((chan, index, data)) = pkt.get_fader_data() {
                    let filter = String::from_utf8_lossy(data).to_string();
                    let _ = self
                        .events
                        .send(PeerEvent::FaderEq { chan, index, filter });
                }
            }
            _ => {}
        }
    }

    #[cfg(test)]
    pub fn process_frame_for_test(&mut self, frame: &Frame, now: u16) -> () {
        self.process_frame(frame, now);
    }
    #[cfg(test)]
    pub fn input_depth(&self) -> usize {
        self.in_audio[0].total()
    }
}

#[cfg(test)]
mod test_server_peer {
    use super::*;

    fn active_peer() -> (ServerPeer, mpsc::Receiver<PeerEvent>) {
        let (tx, rx) = mpsc::channel();
        let mut peer = ServerPeer::new(3, tx);
        let addr: SocketAddr = "127.0.0.1:9999".parse().unwrap();
        peer.activate(addr, 42, 2, 8, 0);
        (peer, rx)
    }

    fn control_frame(entry: PacketEntry, seq: u8) -> Frame {
        let mut entry = entry;
        entry.set_local_seq(seq);
        let mut frame = Frame::new();
        frame.append_bytes(0, entry.bytes());
        frame
    }

    #[test]
    fn ping_gate() {
        let (mut peer, _rx) = active_peer();
        assert!(!peer.is_valid());
        // wrong password is ignored
        let bad = PacketEntry::ping(PacketType::PingRequest, 0, 7, 13);
        peer.process_frame_for_test(&control_frame(bad, 1), 0);
        assert!(!peer.is_valid());
        // right password opens the gate
        let good = PacketEntry::ping(PacketType::PingRequest, 0, 7, 42);
        peer.process_frame_for_test(&control_frame(good, 2), 0);
        assert!(peer.is_valid());
    }

    #[test]
    fn configure_switches_downlink() {
        let (mut peer, _rx) = active_peer();
        assert_eq!(peer.output_fmt, PacketType::AudioSilence);
        let entry = PacketEntry::configure(PacketType::Audio24Bit2Ch as u8);
        peer.process_frame_for_test(&control_frame(entry, 1), 0);
        assert_eq!(peer.output_fmt, PacketType::Audio24Bit2Ch);
        // a junk format must not stick
        let entry = PacketEntry::configure(200);
        peer.process_frame_for_test(&control_frame(entry, 2), 0);
        assert_eq!(peer.output_fmt, PacketType::Audio24Bit2Ch);
    }

    #[test]
    fn name_request_relayed() {
        let (mut peer, rx) = active_peer();
        let entry = PacketEntry::raw_data(PacketType::NameRequest, b"flugelhorn").unwrap();
        peer.process_frame_for_test(&control_frame(entry, 1), 0);
        assert_eq!(peer.name(), "flugelhorn");
        match rx.try_recv().unwrap() {
            PeerEvent::FaderName { index, name, .. } => {
                assert_eq!(index, 3);
                assert_eq!(name, "flugelhorn");
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn fader_requests_shape_the_mix() {
        let (mut peer, _rx) = active_peer();
        let entry =
            PacketEntry::fader_value(PacketType::FaderGainRequest, 0, 5, &[0.5]).unwrap();
        peer.process_frame_for_test(&control_frame(entry, 1), 0);
        assert_eq!(peer.mix_gain(5), 0.5);
        let entry = PacketEntry::fader_value(PacketType::FaderPanRequest, 0, 5, &[-2.0]).unwrap();
        peer.process_frame_for_test(&control_frame(entry, 2), 0);
        assert_eq!(peer.mix_pan(5), -1.0);
        let mut bits = [0u8; PEERS_MAX];
        bits[7] = 1;
        let entry = PacketEntry::fader_data(PacketType::FaderBitsRequest, 0, 0, &bits).unwrap();
        peer.process_frame_for_test(&control_frame(entry, 3), 0);
        assert!(peer.muted(7));
        assert!(!peer.muted(6));
    }

    #[test]
    fn uplink_audio_lands_in_buffers() {
        let (mut peer, _rx) = active_peer();
        let samples = [0.3f32; DEF_SAMPLES];
        let entry = PacketEntry::audio(PacketType::Audio16Bit2Ch, &samples, &samples).unwrap();
        let mut frame = Frame::new();
        frame.append_bytes(0, entry.bytes());
        frame.set_sequence(0, 0);
        peer.process_frame_for_test(&frame, 0);
        assert_eq!(peer.input_depth(), DEF_SAMPLES);
    }
}
