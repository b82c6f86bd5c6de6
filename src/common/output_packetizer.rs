//! outbound frame assembly, FEC masking and the reliable control path
//!
//! One frame leaves per tick.  Payload frames carry whatever was
//! appended since the last tick plus at most one reliable control
//! packet; every d_max payloads the XOR of the group goes out as a mask
//! frame so the receiver can rebuild a single loss.  Reliable packets
//! are resent every 64 ticks until acknowledged, with a watchdog event
//! at 1000 ticks and a timeout event at 2000.
use std::collections::VecDeque;
use std::net::{SocketAddr, UdpSocket};
use std::sync::mpsc;

use crate::common::box_error::BoxError;
use crate::common::event::PeerEvent;
use crate::common::frame::{Frame, SEQ_MAX};
use crate::common::packet::{PacketEntry, PacketType};

const RESEND_TICKS: u16 = 64;
const WATCHDOG_TICKS: u16 = 1000;
const TIMEOUT_TICKS: u16 = 2000;
/// counter value meaning "nothing outstanding, stop counting"
const PEND_INERT: u16 = 65535;

pub struct OutputPacketizer {
    current: Frame,
    mask: Frame,
    queue: VecDeque<PacketEntry>,
    pending: Option<PacketEntry>,
    start_time: u16,
    ping_time: u16,
    pend_count: u16,
    pend_seqno: u8,
    peer_seqno: u8,
    d_cur: u8,
    d_max: u8,
    seqno: u8,
    send_ack: bool,
    offset: usize,
    d_len: usize,
    events: mpsc::Sender<PeerEvent>,
}

impl OutputPacketizer {
    pub fn new(events: mpsc::Sender<PeerEvent>) -> OutputPacketizer {
        let mut pkt = OutputPacketizer {
            current: Frame::new(),
            mask: Frame::new(),
            queue: VecDeque::new(),
            pending: None,
            start_time: 0,
            ping_time: 0,
            pend_count: PEND_INERT,
            pend_seqno: 0,
            peer_seqno: 0,
            d_cur: 0,
            d_max: 0,
            seqno: 0,
            send_ack: false,
            offset: 0,
            d_len: 0,
            events,
        };
        pkt.init(2);
        pkt
    }

    /// reset all state, adopting a new mask distance
    pub fn init(&mut self, distance: u8) -> () {
        self.d_cur = 0;
        self.d_max = distance % SEQ_MAX;
        self.start_time = 0;
        self.ping_time = 0;
        self.pend_count = PEND_INERT;
        self.pend_seqno = 0;
        self.peer_seqno = 0;
        self.seqno = 0;
        self.send_ack = false;
        self.offset = 0;
        self.d_len = 0;
        self.current.clear();
        self.mask.clear();
        self.queue.clear();
        self.pending = None;
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// queue a control packet for reliable delivery
    ///
    /// If a packet of the same type is already waiting it is overwritten
    /// in place, so slow consumers only ever see the latest value of an
    /// idempotent control.
    pub fn enqueue(&mut self, entry: PacketEntry) -> () {
        for queued in self.queue.iter_mut() {
            if queued.type_code() == entry.type_code() {
                *queued = entry;
                return;
            }
        }
        self.queue.push_back(entry);
    }

    /// last sequence number seen from the peer, to be acknowledged
    pub fn peer_seqno(&self) -> u8 {
        self.peer_seqno
    }
    pub fn set_peer_seqno(&mut self, seqno: u8) -> () {
        self.peer_seqno = seqno;
    }
    /// ask for an ACK to ride on the next outbound frame
    pub fn request_ack(&mut self) -> () {
        self.send_ack = true;
    }

    /// the peer acknowledged a reliable sequence number
    pub fn handle_ack(&mut self, acked: u8, now: u16) -> () {
        if let Some(pending) = &self.pending {
            if pending.local_seq() == acked {
                self.pending = None;
                self.ping_time = now.wrapping_sub(self.start_time);
            }
        }
    }

    /// round trip of the last acknowledged control packet, in ticks
    pub fn ping_time(&self) -> u16 {
        self.ping_time
    }

    /// append unreliable data (audio, silence, midi) to the next frame
    pub fn append(&mut self, entry: &PacketEntry) -> bool {
        if self.current.append_bytes(self.offset, entry.bytes()) {
            self.offset += entry.num_bytes();
            true
        } else {
            false
        }
    }

    fn append_ack(&mut self) -> bool {
        let ack = [1u8, PacketType::Ack as u8, 0, self.peer_seqno];
        if self.current.append_bytes(self.offset, &ack) {
            self.offset += ack.len();
            true
        } else {
            false
        }
    }

    /// build the frame for this tick and advance the state machine
    ///
    /// Returns the frame and its payload length.  The caller puts it on
    /// the wire; nothing here allocates.
    pub fn assemble(&mut self, now: u16) -> (Frame, usize) {
        if self.d_cur == self.d_max {
            // finalize and emit the XOR mask frame
            self.mask.set_sequence(self.seqno, self.d_max);
            let frame = self.mask;
            let len = self.d_len;
            self.mask.clear();
            self.d_cur = 0;
            self.d_len = 0;
            return (frame, len);
        }

        if self.pending.is_none() {
            if let Some(mut entry) = self.queue.pop_front() {
                self.pend_seqno = self.pend_seqno.wrapping_add(1);
                entry.set_local_seq(self.pend_seqno);
                entry.set_peer_seq(self.peer_seqno);
                self.start_time = now;
                if self.append(&entry) {
                    // the control packet carries the peer seqno already
                    self.send_ack = false;
                }
                self.pending = Some(entry);
                self.pend_count = 1;
            } else if self.pend_count != PEND_INERT {
                self.pend_count += 1;
            }
        } else {
            if self.pend_count % RESEND_TICKS == 0 {
                let mut entry = self.pending.take().unwrap();
                entry.set_peer_seq(self.peer_seqno);
                if self.append(&entry) {
                    self.send_ack = false;
                }
                self.pending = Some(entry);
                self.pend_count += 1;
            } else if self.pend_count != PEND_INERT {
                self.pend_count += 1;
            }
        }

        if self.pend_count == WATCHDOG_TICKS {
            let _ = self.events.send(PeerEvent::PendingWatchdog);
        } else if self.pend_count == TIMEOUT_TICKS {
            let _ = self.events.send(PeerEvent::PendingTimeout);
            self.pend_count = PEND_INERT;
        }

        if self.send_ack && self.append_ack() {
            self.send_ack = false;
        }

        self.current.set_sequence(self.seqno, 0);
        let frame = self.current;
        let len = self.offset;
        self.mask.xor_with(&self.current);
        self.current.clear();
        self.seqno = (self.seqno + 1) % SEQ_MAX;
        self.d_cur += 1;
        if self.d_len < len {
            self.d_len = len;
        }
        self.offset = 0;
        (frame, len)
    }

    /// assemble this tick's frame and send it
    pub fn send(&mut self, sock: &UdpSocket, addr: SocketAddr, now: u16) -> Result<usize, BoxError> {
        let (frame, len) = self.assemble(now);
        Ok(sock.send_to(frame.wire_bytes(len), addr)?)
    }

    #[cfg(test)]
    pub fn pend_count(&self) -> u16 {
        self.pend_count
    }
    #[cfg(test)]
    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }
}
