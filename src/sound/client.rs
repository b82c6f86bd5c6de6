//! client side peer endpoint
//!
//! Owns both directions of one session with the mixing server: capture
//! flows in through [`sound_process`](ClientPeer::sound_process) and out
//! over UDP, the personalized mix comes back the other way.  The struct
//! is meant to live behind one Mutex; the sound thread and the network
//! thread each lock it briefly and never call out while holding it.
//! Everything the server tells us beyond audio is surfaced as
//! [`PeerEvent`] values on the channel given at construction.  On a
//! `PendingWatchdog` event the owner should fire off a ping to probe
//! whether the session is still alive.
use std::net::{SocketAddr, UdpSocket};
use std::sync::mpsc;

use crate::common::box_error::BoxError;
use crate::common::event::PeerEvent;
use crate::common::frame::{Frame, DEF_SAMPLES};
use crate::common::input_reassembler::InputReassembler;
use crate::common::jitter_meter::JitterMeter;
use crate::common::output_packetizer::OutputPacketizer;
use crate::common::packet::{Packet, PacketEntry, PacketType};
use crate::sound::audio_buffer::{level_decode, AudioLevel, AudioRingBuffer};
use crate::utils::pan_gains;

// largest sample count we will unpack from a single audio packet
const DECODE_MAX: usize = 512;

pub struct ClientPeer {
    address: Option<SocketAddr>,
    input: InputReassembler,
    output: OutputPacketizer,
    meter: JitterMeter,
    in_audio: [AudioRingBuffer; 2],
    in_level: [AudioLevel; 2],
    out_buffer: [AudioRingBuffer; 2],
    out_level: [AudioLevel; 2],
    in_gain: f32,
    in_pan: f32,
    output_fmt: PacketType,
    self_index: Option<u8>,
    low_water_strikes: u8,
    events: mpsc::Sender<PeerEvent>,
}

impl ClientPeer {
    pub fn new(events: mpsc::Sender<PeerEvent>) -> ClientPeer {
        ClientPeer {
            address: None,
            input: InputReassembler::new(),
            output: OutputPacketizer::new(events.clone()),
            meter: JitterMeter::new(),
            in_audio: [AudioRingBuffer::new(), AudioRingBuffer::new()],
            in_level: [AudioLevel::new(), AudioLevel::new()],
            out_buffer: [AudioRingBuffer::new(), AudioRingBuffer::new()],
            out_level: [AudioLevel::new(), AudioLevel::new()],
            in_gain: 1.0,
            in_pan: 0.0,
            output_fmt: PacketType::Audio16Bit2Ch,
            self_index: None,
            low_water_strikes: 0,
            events,
        }
    }

    /// start a session toward the server
    pub fn connect(&mut self, addr: SocketAddr, fec_distance: u8, jitter_ms: u16) -> () {
        self.input.clear();
        self.output.init(fec_distance);
        self.meter.clear();
        for chan in 0..2 {
            self.in_audio[chan].clear();
            self.in_audio[chan].set_jitter_limit_ms(jitter_ms);
            self.in_level[chan].clear();
            self.out_buffer[chan].clear();
            self.out_level[chan].clear();
        }
        self.self_index = None;
        self.low_water_strikes = 0;
        self.address = Some(addr);
    }

    /// tear the session down.  Anything still queued is dropped and
    /// later enqueues are ignored until the next connect.
    pub fn disconnect(&mut self) -> () {
        self.address = None;
        self.input.clear();
        self.output.init(2);
        self.meter.clear();
    }

    pub fn is_connected(&self) -> bool {
        self.address.is_some()
    }

    /// format of the audio we send toward the room.  AudioSilence mutes
    /// us without stopping the frame cadence.
    pub fn set_upload_format(&mut self, fmt: PacketType) -> () {
        if fmt.is_audio() || fmt == PacketType::AudioSilence {
            self.output_fmt = fmt;
        }
    }

    pub fn set_input_gain(&mut self, gain: f32) -> () {
        self.in_gain = gain;
    }
    pub fn set_input_pan(&mut self, pan: f32) -> () {
        self.in_pan = pan;
    }
    /// mixer slot the server says is ours, once known
    pub fn self_index(&self) -> Option<u8> {
        self.self_index
    }
    /// round trip of the last acknowledged control packet, in ticks
    pub fn ping_time(&self) -> u16 {
        self.output.ping_time()
    }
    pub fn rx_stats(&self) -> (f32, f32, f64) {
        (
            self.meter.get_loss(),
            self.meter.get_damage(),
            self.meter.get_jitter(),
        )
    }
    pub fn get_levels(&mut self) -> (f32, f32, f32, f32) {
        (
            self.in_level[0].get_level(),
            self.in_level[1].get_level(),
            self.out_level[0].get_level(),
            self.out_level[1].get_level(),
        )
    }

    /// hand a received datagram frame to the reassembler
    pub fn receive(&mut self, frame: &Frame, now: u16) -> () {
        if self.address.is_none() {
            return;
        }
        self.input.receive(frame, &mut self.meter, now);
    }

    /// enqueue one control packet, coalescing by type
    pub fn send_single_pkt(&mut self, entry: PacketEntry) -> () {
        if self.address.is_some() {
            self.output.enqueue(entry);
        }
    }

    pub fn set_name(&mut self, name: &str) -> () {
        if let Some(entry) = PacketEntry::raw_data(PacketType::NameRequest, name.as_bytes()) {
            self.send_single_pkt(entry);
        }
    }
    pub fn set_icon(&mut self, icon: &[u8]) -> () {
        if let Some(entry) = PacketEntry::raw_data(PacketType::IconRequest, icon) {
            self.send_single_pkt(entry);
        }
    }
    pub fn send_chat(&mut self, text: &str) -> () {
        if let Some(entry) = PacketEntry::raw_data(PacketType::ChatRequest, text.as_bytes()) {
            self.send_single_pkt(entry);
        }
    }
    /// ask the server to send our downlink in the given format
    pub fn configure_downlink(&mut self, fmt: PacketType) -> () {
        self.send_single_pkt(PacketEntry::configure(fmt as u8));
    }
    pub fn send_ping(&mut self, now: u16, passwd: u64) -> () {
        self.send_single_pkt(PacketEntry::ping(PacketType::PingRequest, 0, now, passwd));
    }
    /// adjust how loud mixer slot `index` is in our personalized mix
    pub fn set_fader_gain(&mut self, index: u8, gain: f32) -> () {
        if let Some(entry) =
            PacketEntry::fader_value(PacketType::FaderGainRequest, 0, index, &[gain])
        {
            self.send_single_pkt(entry);
        }
    }
    pub fn set_fader_pan(&mut self, index: u8, pan: f32) -> () {
        if let Some(entry) = PacketEntry::fader_value(PacketType::FaderPanRequest, 0, index, &[pan])
        {
            self.send_single_pkt(entry);
        }
    }
    /// per slot mute bits for our mix, one byte per mixer slot
    pub fn send_bits(&mut self, bits: &[u8]) -> () {
        if let Some(entry) = PacketEntry::fader_data(PacketType::FaderBitsRequest, 0, 0, bits) {
            self.send_single_pkt(entry);
        }
    }

    /// one millisecond of work: drain the reassembler, run the outbound
    /// elasticity policy and put this tick's frame on the wire
    pub fn tick(&mut self, sock: &UdpSocket, now: u16) -> Result<(), BoxError> {
        let addr = match self.address {
            Some(a) => a,
            None => return Ok(()),
        };

        self.input.recover(&mut self.meter);
        loop {
            let frame = match self.input.next_frame(&mut self.meter) {
                Some(f) => f,
                None => break,
            };
            self.process_frame(&frame, now);
        }

        // starving two ticks in a row earns the outbound buffers one
        // stretched sample
        let low = u8::min(
            self.out_buffer[0].low_water(),
            self.out_buffer[1].low_water(),
        );
        if low == 0 {
            self.low_water_strikes += 1;
            if self.low_water_strikes >= 2 {
                self.out_buffer[0].grow();
                self.out_buffer[1].grow();
                self.low_water_strikes = 0;
            }
        } else {
            self.low_water_strikes = 0;
        }

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

    /// feed the sound card block through the endpoint
    ///
    /// Capture goes toward the network with our gain and pan applied,
    /// playback is pulled from the elastic downlink buffers.
    pub fn sound_process(
        &mut self,
        in_l: &[f32],
        in_r: &[f32],
        out_l: &mut [f32],
        out_r: &mut [f32],
    ) -> () {
        let (pan_l, pan_r) = pan_gains(self.in_pan);
        let mut off = 0;
        while off < in_l.len() {
            let chunk = usize::min(in_l.len() - off, DEF_SAMPLES);
            let mut stage_l = [0f32; DEF_SAMPLES];
            let mut stage_r = [0f32; DEF_SAMPLES];
            for x in 0..chunk {
                stage_l[x] = in_l[off + x] * self.in_gain * pan_l;
                stage_r[x] = in_r[off + x] * self.in_gain * pan_r;
            }
            self.out_level[0].add_samples(&stage_l[0..chunk]);
            self.out_level[1].add_samples(&stage_r[0..chunk]);
            self.out_buffer[0].add_samples(&stage_l[0..chunk]);
            self.out_buffer[1].add_samples(&stage_r[0..chunk]);
            off += chunk;
        }
        self.in_audio[0].rem_samples(out_l);
        self.in_audio[1].rem_samples(out_r);
    }

    fn process_frame(&mut self, frame: &Frame, now: u16) -> () {
        for pkt in frame.packets() {
            let ptype = match pkt.packet_type() {
                Some(t) => t,
                None => continue, // unknown type, skip it
            };
            if ptype.is_audio() {
                let mut l = [0f32; DECODE_MAX];
                let mut r = [0f32; DECODE_MAX];
                if let Some((num, stereo)) = pkt.decode_audio(&mut l, &mut r) {
                    if !stereo {
                        r[0..num].copy_from_slice(&l[0..num]);
                    }
                    self.in_level[0].add_samples(&l[0..num]);
                    self.in_level[1].add_samples(&r[0..num]);
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
                            // duplicate of something we already took,
                            // the ack must have been lost
                            self.output.request_ack();
                        } else {
                            self.output.set_peer_seqno(pkt.local_seq());
                            self.output.request_ack();
                            self.handle_control(ptype, &pkt);
                        }
                    }
                }
            }
        }
    }

    fn handle_control(&mut self, ptype: PacketType, pkt: &Packet) -> () {
        match ptype {
            PacketType::PingReply => {
                if let Some((packets, time_ms, _)) = pkt.get_ping() {
                    let _ = self.events.send(PeerEvent::PingReply { packets, time_ms });
                }
            }
            PacketType::ChatReply => {
                if let Some(data) = pkt.get_raw_data() {
                    let text = String::from_utf8_lossy(data).to_string();
                    let _ = self.events.send(PeerEvent::Chat(text));
                }
            }
            PacketType::LyricsReply => {
                if let Some(data) = pkt.get_raw_data() {
                    let text = String::from_utf8_lossy(data).to_string();
                    let _ = self.events.send(PeerEvent::Lyrics(text));
                }
            }
            PacketType::FaderGainReply => {
                if let Some((chan, index, values)) = pkt.get_fader_value() {
                    if let Some(gain) = values.first() {
                        let _ = self.events.send(PeerEvent::FaderGain {
                            chan,
                            index,
                            gain: *gain,
                        });
                    }
                }
            }
            PacketType::FaderPanReply => {
                if let Some((chan, index, values)) = pkt.get_fader_value() {
                    if let Some(pan) = values.first() {
                        let _ = self.events.send(PeerEvent::FaderPan {
                            chan,
                            index,
                            pan: *pan,
                        });
                    }
                }
            }
            PacketType::FaderLevelReply => {
                if let Some((chan, index, values)) = pkt.get_fader_value() {
                    if values.len() >= 2 {
                        let _ = self.events.send(PeerEvent::FaderLevel {
                            chan,
                            index,
                            left: level_decode(values[0]),
                            right: level_decode(values[1]),
                        });
                    }
                }
            }
            PacketType::FaderNameReply => {
                if let Some((chan, index, data)) = pkt.get_fader_data() {
                    let name = String::from_utf8_lossy(data).to_string();
                    let _ = self.events.send(PeerEvent::FaderName { chan, index, name });
                }
            }
            PacketType::FaderIconReply => {
                if let Some((chan, index, data)) = pkt.get_fader_data() {
                    let _ = self.events.send(PeerEvent::FaderIcon {
                        chan,
                        index,
                        icon: data.to_vec(),
                    });
                }
            }
            PacketType::FaderEqReply => {
                if let Some((chan, index, data)) = pkt.get_fader_data() {
                    let filter = String::from_utf8_lossy(data).to_string();
                    let _ = self
                        .events
                        .send(PeerEvent::FaderEq { chan, index, filter });
                }
            }
            PacketType::FaderDisconnectReply => {
                if let Some((chan, index, _)) = pkt.get_fader_data() {
                    let _ = self.events.send(PeerEvent::FaderDisconnect { chan, index });
                }
            }
            PacketType::FaderBitsReply => {
                // repurposed by the server to tell us our own slot
                if let Some((chan, index, _)) = pkt.get_fader_data() {
                    self.self_index = Some(index);
                    let _ = self.events.send(PeerEvent::FaderSelf { chan, index });
                }
            }
            PacketType::LocalGainReply => {
                if let Some((_, _, values)) = pkt.get_fader_value() {
                    if let Some(gain) = values.first() {
                        let _ = self.events.send(PeerEvent::LocalGain(*gain));
                    }
                }
            }
            PacketType::LocalPanReply => {
                if let Some((_, _, values)) = pkt.get_fader_value() {
                    if let Some(pan) = values.first() {
                        let _ = self.events.send(PeerEvent::LocalPan(*pan));
                    }
                }
            }
            PacketType::LocalEqReply => {
                if let Some(data) = pkt.get_raw_data() {
                    let filter = String::from_utf8_lossy(data).to_string();
                    let _ = self.events.send(PeerEvent::LocalEq(filter));
                }
            }
            // requests are server bound, a client just acks them
            _ => {}
        }
    }
}

impl crate::sound::SoundCallback for ClientPeer {
    fn process(
        &mut self,
        in_a: &[f32],
        in_b: &[f32],
        out_a: &mut [f32],
        out_b: &mut [f32],
    ) -> Result<(), BoxError> {
        self.sound_process(in_a, in_b, out_a, out_b);
        Ok(())
    }
}
