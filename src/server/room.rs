//! the room: socket loop, millisecond tick and per peer mixing
//!
//! One thread drives everything.  Each pass drains the UDP socket into
//! the per peer reassemblers, then when the millisecond timer fires it
//! locks one peer at a time: first to import uplink audio, then to hand
//! every participant their personalized mix and this tick's outbound
//! frame.  No two peer locks are ever held together.
use log::{debug, info, warn};
use serde_json::json;
use std::io::ErrorKind;
use std::net::{SocketAddr, UdpSocket};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::common::box_error::BoxError;
use crate::common::config::Config;
use crate::common::event::PeerEvent;
use crate::common::frame::{Frame, DEF_SAMPLES, MAX_UDP};
use crate::common::packet::{PacketEntry, PacketType};
use crate::common::sock_with_tos;
use crate::common::stream_time_stat::{MicroTimer, TickClock};
use crate::server::peer::{ServerPeer, PEERS_MAX};
use crate::utils::{clip_float, pan_gains};

// silent peers are reaped after five seconds
const PEER_EXPIRE_MICROS: u128 = 5_000_000;
// ticks between level meter updates
const LEVEL_INTERVAL: u64 = 128;

pub struct Room {
    sock: UdpSocket,
    peers: Vec<Arc<Mutex<ServerPeer>>>,
    events: Vec<mpsc::Receiver<PeerEvent>>,
    passwd: u64,
    fec_distance: u8,
    jitter_ms: u16,
    level_slot: usize,
    tick_count: u64,
}

impl Room {
    pub fn new(
        sock: UdpSocket,
        passwd: u64,
        fec_distance: u8,
        jitter_ms: u16,
    ) -> Result<Room, BoxError> {
        sock.set_nonblocking(true)?;
        let mut peers = Vec::new();
        let mut events = Vec::new();
        for index in 0..PEERS_MAX {
            let (tx, rx) = mpsc::channel();
            peers.push(Arc::new(Mutex::new(ServerPeer::new(index as u8, tx))));
            events.push(rx);
        }
        Ok(Room {
            sock,
            peers,
            events,
            passwd,
            fec_distance,
            jitter_ms,
            level_slot: 0,
            tick_count: 0,
        })
    }

    /// drain everything waiting on the socket into the peer slots
    pub fn poll_socket(&mut self, now: u16, now_micros: u128) -> Result<(), BoxError> {
        let mut buf = [0u8; MAX_UDP + 1];
        loop {
            match self.sock.recv_from(&mut buf) {
                Ok((amt, src)) => {
                    match Frame::from_datagram(&buf[0..amt]) {
                        Some(frame) => self.route_frame(&frame, src, now, now_micros),
                        None => {
                            debug!("bad datagram size {} from {}", amt, src);
                        }
                    };
                }
                Err(e) => match e.kind() {
                    ErrorKind::WouldBlock => break,
                    _ => return Err(e.into()),
                },
            }
        }
        Ok(())
    }

    fn route_frame(&mut self, frame: &Frame, src: SocketAddr, now: u16, now_micros: u128) -> () {
        for peer in &self.peers {
            let mut locked = peer.lock().unwrap();
            if locked.address() == Some(src) {
                locked.receive(frame, now, now_micros);
                return;
            }
        }
        // newcomer, hand out a free slot
        for peer in &self.peers {
            let mut locked = peer.lock().unwrap();
            if !locked.is_active() {
                info!("peer {} joins slot {}", src, locked.index());
                locked.activate(src, self.passwd, self.fec_distance, self.jitter_ms, now_micros);
                locked.receive(frame, now, now_micros);
                return;
            }
        }
        warn!("room full, dropping {}", src);
    }

    /// one millisecond of room work
    pub fn tick(&mut self, now: u16, now_micros: u128) -> () {
        let mut blocks_l = [[0f32; DEF_SAMPLES]; PEERS_MAX];
        let mut blocks_r = [[0f32; DEF_SAMPLES]; PEERS_MAX];
        let mut live = [false; PEERS_MAX];
        let mut gains = [0f32; PEERS_MAX];
        let mut pans = [0f32; PEERS_MAX];

        // first pass: reap the silent, pull one uplink block from each
        for (slot, peer) in self.peers.iter().enumerate() {
            let mut locked = peer.lock().unwrap();
            if !locked.is_active() {
                continue;
            }
            if now_micros.saturating_sub(locked.last_heard()) > PEER_EXPIRE_MICROS {
                info!("slot {} went silent, dropping", slot);
                locked.deactivate();
                continue;
            }
            locked.audio_import(now);
            locked.pop_input(&mut blocks_l[slot], &mut blocks_r[slot]);
            live[slot] = locked.is_valid();
            gains[slot] = locked.gain();
            pans[slot] = locked.pan();
        }

        // level updates rotate through the slots at a slow cadence
        let mut level_entry: Option<PacketEntry> = None;
        if self.tick_count % LEVEL_INTERVAL == 0 {
            self.level_slot = (self.level_slot + 1) % PEERS_MAX;
            if live[self.level_slot] {
                let mut src = self.peers[self.level_slot].lock().unwrap();
                let (left, right) = src.encoded_levels();
                level_entry = PacketEntry::fader_value(
                    PacketType::FaderLevelReply,
                    0,
                    self.level_slot as u8,
                    &[left, right],
                );
            }
        }
        self.tick_count += 1;

        // second pass: personalized mix and this tick's frame out
        for (slot, peer) in self.peers.iter().enumerate() {
            let mut locked = peer.lock().unwrap();
            if !locked.is_active() {
                continue;
            }
            let mut mix_l = [0f32; DEF_SAMPLES];
            let mut mix_r = [0f32; DEF_SAMPLES];
            for src in 0..PEERS_MAX {
                if !live[src] || locked.muted(src) {
                    continue;
                }
                let gain = gains[src] * locked.mix_gain(src);
                let (pan_l, pan_r) = pan_gains(clip_float(pans[src] + locked.mix_pan(src)));
                for x in 0..DEF_SAMPLES {
                    mix_l[x] += blocks_l[src][x] * gain * pan_l;
                    mix_r[x] += blocks_r[src][x] * gain * pan_r;
                }
            }
            locked.queue_mix(&mix_l, &mix_r);
            if let Some(entry) = level_entry {
                locked.queue_control(entry);
            }
            if let Err(e) = locked.audio_export(&self.sock, now) {
                warn!("send to slot {} failed: {}", slot, e);
            }
        }

        self.drain_events();
    }

    fn drain_events(&mut self) -> () {
        for slot in 0..PEERS_MAX {
            loop {
                let event = match self.events[slot].try_recv() {
                    Ok(e) => e,
                    Err(_) => break,
                };
                match event {
                    PeerEvent::Chat(text) => {
                        if let Some(entry) =
                            PacketEntry::raw_data(PacketType::ChatReply, text.as_bytes())
                        {
                            self.broadcast(entry);
                        }
                    }
                    PeerEvent::Lyrics(text) => {
                        if let Some(entry) =
                            PacketEntry::raw_data(PacketType::LyricsReply, text.as_bytes())
                        {
                            self.broadcast(entry);
                        }
                    }
                    PeerEvent::FaderName { index, name, .. } => {
                        if let Some(entry) = PacketEntry::fader_data(
                            PacketType::FaderNameReply,
                            0,
                            index,
                            name.as_bytes(),
                        ) {
                            self.broadcast(entry);
                        }
                    }
                    PeerEvent::FaderIcon { index, icon, .. } => {
                        if let Some(entry) = PacketEntry::fader_data(
                            PacketType::FaderIconReply,
                            0,
                            index,
                            &icon,
                        ) {
                            self.broadcast(entry);
                        }
                    }
                    PeerEvent::FaderEq { index, filter, .. } => {
                        if let Some(entry) = PacketEntry::fader_data(
                            PacketType::FaderEqReply,
                            0,
                            index,
                            filter.as_bytes(),
                        ) {
                            self.broadcast(entry);
                        }
                    }
                    PeerEvent::PendingWatchdog => {
                        // probe whether the participant is still there
                        debug!("slot {} watchdog, sending keepalive", slot);
                        let mut locked = self.peers[slot].lock().unwrap();
                        locked.queue_control(PacketEntry::ping(PacketType::PingReply, 0, 0, 0));
                    }
                    PeerEvent::PendingTimeout => {
                        info!("slot {} timed out, dropping", slot);
                        self.peers[slot].lock().unwrap().deactivate();
                        if let Some(entry) = PacketEntry::fader_data(
                            PacketType::FaderDisconnectReply,
                            0,
                            slot as u8,
                            &[],
                        ) {
                            self.broadcast(entry);
                        }
                    }
                    other => {
                        debug!("slot {} event ignored: {:?}", slot, other);
                    }
                }
            }
        }
    }

    fn broadcast(&self, entry: PacketEntry) -> () {
        for peer in &self.peers {
            let mut locked = peer.lock().unwrap();
            if locked.is_active() {
                locked.queue_control(entry);
            }
        }
    }

    /// snapshot for the status channel
    pub fn status_json(&self) -> serde_json::Value {
        let mut peers = vec![];
        for (slot, peer) in self.peers.iter().enumerate() {
            let locked = peer.lock().unwrap();
            if !locked.is_active() {
                continue;
            }
            let (loss, damage, jitter) = locked.rx_stats();
            peers.push(json!({
                "slot": slot,
                "name": locked.name(),
                "valid": locked.is_valid(),
                "loss": loss,
                "damage": damage,
                "jitter": jitter,
            }));
        }
        json!({ "peers": peers })
    }
}

/// run a mixing room forever, configuration from settings.json
///
/// Status snapshots go out on the channel every couple of seconds so
/// the caller can log or forward them.
pub fn run(status_tx: mpsc::Sender<serde_json::Value>) -> Result<(), BoxError> {
    let mut config = Config::build();
    config.load_from_file()?;
    let port = config.get_port();
    let sock = sock_with_tos::new(port as u16)?;
    let mut room = Room::new(
        sock,
        config.get_password(),
        config.get_fec_distance()?,
        config.get_jitter_ms(),
    )?;
    info!("room listening on udp port {}", port);

    let clock = TickClock::new();
    let mut tick_timer = MicroTimer::new(clock.micros(), 1000);
    let mut status_timer = MicroTimer::new(clock.micros(), 2_000_000);

    loop {
        room.poll_socket(clock.ticks(), clock.micros())?;
        let now_micros = clock.micros();
        if tick_timer.expired(now_micros) {
            tick_timer.advance(1000);
            room.tick(clock.ticks(), now_micros);
        }
        if status_timer.expired(now_micros) {
            status_timer.reset(now_micros);
            let _ = status_tx.send(room.status_json());
        }
        std::thread::sleep(Duration::from_micros(200));
    }
}
