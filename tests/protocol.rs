//! end to end exercises of the wire protocol and audio path
//!
//! These run a real client endpoint against a real server peer over
//! loopback UDP, with the test sitting in the middle so it can drop
//! frames on purpose.
use jamlink::common::event::PeerEvent;
use jamlink::common::frame::{Frame, DEF_SAMPLES};
use jamlink::common::packet::{PacketEntry, PacketType};
use jamlink::server::peer::ServerPeer;
use jamlink::sound::client::ClientPeer;
use std::net::{SocketAddr, UdpSocket};
use std::sync::mpsc;
use std::time::Duration;

fn local_sock() -> (UdpSocket, SocketAddr) {
    let sock = UdpSocket::bind("127.0.0.1:0").unwrap();
    sock.set_nonblocking(true).unwrap();
    let addr = sock.local_addr().unwrap();
    (sock, addr)
}

/// wait for the next datagram, loopback is fast but not instantaneous
fn recv_frame(sock: &UdpSocket) -> Option<Frame> {
    let mut buf = [0u8; 2048];
    for _ in 0..500 {
        match sock.recv_from(&mut buf) {
            Ok((amt, _)) => return Frame::from_datagram(&buf[0..amt]),
            Err(_) => std::thread::sleep(Duration::from_micros(100)),
        }
    }
    None
}

struct Link {
    client: ClientPeer,
    client_sock: UdpSocket,
    server: ServerPeer,
    server_sock: UdpSocket,
    server_events: mpsc::Receiver<PeerEvent>,
    client_events: mpsc::Receiver<PeerEvent>,
}

fn link_up(fec_distance: u8) -> Link {
    let (client_sock, client_addr) = local_sock();
    let (server_sock, server_addr) = local_sock();
    let (ctx, client_events) = mpsc::channel();
    let mut client = ClientPeer::new(ctx);
    client.connect(server_addr, fec_distance, 8);
    let (stx, server_events) = mpsc::channel();
    let mut server = ServerPeer::new(0, stx);
    server.activate(client_addr, 0, fec_distance, 8, 0);
    Link {
        client,
        client_sock,
        server,
        server_sock,
        server_events,
        client_events,
    }
}

#[test]
fn frame_round_trip_multiple_packets() {
    let samples = [0.25f32; DEF_SAMPLES];
    let audio = PacketEntry::audio(PacketType::Audio16Bit2Ch, &samples, &samples).unwrap();
    let chat = PacketEntry::raw_data(PacketType::ChatRequest, b"check one two").unwrap();
    let silence = PacketEntry::silence(48);

    let mut frame = Frame::new();
    let mut offset = 0;
    for entry in [&audio, &chat, &silence] {
        assert!(frame.append_bytes(offset, entry.bytes()));
        offset += entry.num_bytes();
    }
    frame.set_sequence(7, 0);

    // decoding walks back the identical packet train
    let kinds: Vec<PacketType> = frame.packets().map(|p| p.packet_type().unwrap()).collect();
    assert_eq!(
        kinds,
        vec![
            PacketType::Audio16Bit2Ch,
            PacketType::ChatRequest,
            PacketType::AudioSilence
        ]
    );
    let sizes: Vec<usize> = frame.packets().map(|p| p.num_bytes()).collect();
    assert_eq!(
        sizes,
        vec![audio.num_bytes(), chat.num_bytes(), silence.num_bytes()]
    );
}

// nominal cadence, zero loss: the far side hears exactly what was sent
#[test]
fn scenario_lossless_stereo() {
    let mut link = link_up(4);
    let in_l = [0.5f32; DEF_SAMPLES];
    let in_r = [-0.5f32; DEF_SAMPLES];
    let mut sink_l = [0f32; DEF_SAMPLES];
    let mut sink_r = [0f32; DEF_SAMPLES];

    // stage a few blocks of capture so the outbound buffer never sits
    // at the starvation mark
    for _ in 0..3 {
        link.client
            .sound_process(&in_l, &in_r, &mut sink_l, &mut sink_r);
    }

    let mut heard_l = Vec::new();
    let mut heard_r = Vec::new();
    for now in 0..150u16 {
        link.client
            .sound_process(&in_l, &in_r, &mut sink_l, &mut sink_r);
        link.client.tick(&link.client_sock, now).unwrap();
        let frame = recv_frame(&link.server_sock).unwrap();
        link.server.receive(&frame, now, now as u128);
        link.server.audio_import(now);
        let mut block_l = [0f32; DEF_SAMPLES];
        let mut block_r = [0f32; DEF_SAMPLES];
        link.server.pop_input(&mut block_l, &mut block_r);
        heard_l.extend_from_slice(&block_l);
        heard_r.extend_from_slice(&block_r);
    }

    // skip the startup fill and fade, then demand quantization accuracy
    let bound = 1.0 / 32768.0 + 1e-5;
    for x in heard_l.len() - 2000..heard_l.len() {
        assert!((heard_l[x] - 0.5).abs() < bound, "left sample {}", x);
        assert!((heard_r[x] + 0.5).abs() < bound, "right sample {}", x);
    }
    let (loss, damage, _) = link.server.rx_stats();
    assert!(loss <= 1.0); // one startup loss for the not yet seen mask slot
    assert_eq!(damage, 0.0);
}

// one in four payload frames dropped at redundancy four: every loss is
// recovered from the mask and nothing is concealed
#[test]
fn scenario_fec_recovers_single_loss() {
    let mut link = link_up(4);
    let in_l = [0.5f32; DEF_SAMPLES];
    let in_r = [-0.5f32; DEF_SAMPLES];
    let mut sink_l = [0f32; DEF_SAMPLES];
    let mut sink_r = [0f32; DEF_SAMPLES];
    for _ in 0..3 {
        link.client
            .sound_process(&in_l, &in_r, &mut sink_l, &mut sink_r);
    }

    let mut dropped = 0f32;
    for now in 0..100u16 {
        link.client
            .sound_process(&in_l, &in_r, &mut sink_l, &mut sink_r);
        link.client.tick(&link.client_sock, now).unwrap();
        let frame = recv_frame(&link.server_sock).unwrap();
        if frame.red_no() == 0 && frame.seq_no() % 4 == 1 {
            dropped += 1.0;
            continue;
        }
        link.server.receive(&frame, now, now as u128);
        link.server.audio_import(now);
        let mut block_l = [0f32; DEF_SAMPLES];
        let mut block_r = [0f32; DEF_SAMPLES];
        link.server.pop_input(&mut block_l, &mut block_r);
    }

    assert!(dropped > 10.0);
    let (loss, damage, _) = link.server.rx_stats();
    // the recovered frames still count as losses, plus the startup one
    assert_eq!(loss, dropped + 1.0);
    assert_eq!(damage, 0.0);
}

// two in four dropped: beyond what one mask can fix, the holes come out
// as nominal silence and the splice back to audio stays smooth
#[test]
fn scenario_double_loss_concealed() {
    let mut link = link_up(4);
    let in_l = [0.5f32; DEF_SAMPLES];
    let in_r = [0.5f32; DEF_SAMPLES];
    let mut sink_l = [0f32; DEF_SAMPLES];
    let mut sink_r = [0f32; DEF_SAMPLES];
    for _ in 0..3 {
        link.client
            .sound_process(&in_l, &in_r, &mut sink_l, &mut sink_r);
    }

    let mut dropped = 0f32;
    let mut heard = Vec::new();
    for now in 0..100u16 {
        link.client
            .sound_process(&in_l, &in_r, &mut sink_l, &mut sink_r);
        link.client.tick(&link.client_sock, now).unwrap();
        let frame = recv_frame(&link.server_sock).unwrap();
        if frame.red_no() == 0 && (frame.seq_no() % 4 == 1 || frame.seq_no() % 4 == 2) {
            dropped += 1.0;
            continue;
        }
        link.server.receive(&frame, now, now as u128);
        link.server.audio_import(now);
        let mut block_l = [0f32; DEF_SAMPLES];
        let mut block_r = [0f32; DEF_SAMPLES];
        link.server.pop_input(&mut block_l, &mut block_r);
        heard.extend_from_slice(&block_l);
    }

    assert!(dropped > 20.0);
    let (_, damage, _) = link.server.rx_stats();
    // exactly the unrecoverable frames were replaced by silence.  The
    // final group is still waiting for newer data when the run stops,
    // so its two holes have not been delivered yet.
    assert_eq!(damage, dropped - 2.0);
    // concealment plus fade in keeps the output free of jumps
    for x in 1..heard.len() {
        assert!(
            (heard[x] - heard[x - 1]).abs() < 0.02,
            "discontinuity at {}",
            x
        );
    }
}

// a dead peer: the reliable path barks at 1000 ticks and gives up at 2000
#[test]
fn scenario_watchdog_then_timeout() {
    let (client_sock, _) = local_sock();
    let (_dead_sock, dead_addr) = local_sock();
    let (tx, events) = mpsc::channel();
    let mut client = ClientPeer::new(tx);
    client.connect(dead_addr, 8, 8);
    client.send_chat("anyone home?");

    for now in 0..2600u16 {
        client.tick(&client_sock, now).unwrap();
    }

    let collected: Vec<PeerEvent> = events.try_iter().collect();
    assert_eq!(
        collected,
        vec![PeerEvent::PendingWatchdog, PeerEvent::PendingTimeout]
    );
}

// resending a reliable packet until its ack arrives delivers it once
#[test]
fn scenario_ack_idempotence() {
    let mut link = link_up(2);
    let in_l = [0.0f32; DEF_SAMPLES];
    let mut sink_l = [0f32; DEF_SAMPLES];
    let mut sink_r = [0f32; DEF_SAMPLES];

    link.client.send_chat("exactly once");
    for now in 0..220u16 {
        link.client
            .sound_process(&in_l, &in_l, &mut sink_l, &mut sink_r);
        link.client.tick(&link.client_sock, now).unwrap();
        let frame = recv_frame(&link.server_sock).unwrap();
        link.server.receive(&frame, now, now as u128);
        link.server.audio_import(now);
        let mut block_l = [0f32; DEF_SAMPLES];
        let mut block_r = [0f32; DEF_SAMPLES];
        link.server.pop_input(&mut block_l, &mut block_r);

        // hold all server traffic (and with it the acks) for a while to
        // force the client through several retransmissions
        link.server.audio_export(&link.server_sock, now).unwrap();
        let reply = recv_frame(&link.client_sock).unwrap();
        if now >= 150 {
            link.client.receive(&reply, now);
        }
    }

    let chats: Vec<String> = link
        .server_events
        .try_iter()
        .filter_map(|e| match e {
            PeerEvent::Chat(text) => Some(text),
            _ => None,
        })
        .collect();
    assert_eq!(chats, vec![String::from("exactly once")]);
    // no spurious events on the client side either
    assert!(link
        .client_events
        .try_iter()
        .all(|e| !matches!(e, PeerEvent::PendingTimeout)));
}

// the configure handshake switches the downlink format on the fly
#[test]
fn scenario_configure_downlink() {
    let mut link = link_up(2);
    let in_l = [0.25f32; DEF_SAMPLES];
    let mut sink_l = [0f32; DEF_SAMPLES];
    let mut sink_r = [0f32; DEF_SAMPLES];

    link.client.configure_downlink(PacketType::Audio16Bit2Ch);
    let mut saw_silence = false;
    let mut saw_audio = false;
    for now in 0..80u16 {
        link.client
            .sound_process(&in_l, &in_l, &mut sink_l, &mut sink_r);
        link.client.tick(&link.client_sock, now).unwrap();
        let frame = recv_frame(&link.server_sock).unwrap();
        link.server.receive(&frame, now, now as u128);
        link.server.audio_import(now);
        let mut block_l = [0f32; DEF_SAMPLES];
        let mut block_r = [0f32; DEF_SAMPLES];
        link.server.pop_input(&mut block_l, &mut block_r);
        link.server.queue_mix(&block_l, &block_r);
        link.server.audio_export(&link.server_sock, now).unwrap();
        let reply = recv_frame(&link.client_sock).unwrap();
        for pkt in reply.packets() {
            match pkt.packet_type() {
                Some(PacketType::AudioSilence) => saw_silence = true,
                Some(t) if t.is_audio() => saw_audio = true,
                _ => {}
            }
        }
        link.client.receive(&reply, now);
        link.client.tick(&link.client_sock, now).unwrap();
        // swallow the extra frame that tick pushed toward the server
        let _ = recv_frame(&link.server_sock);
    }
    // silence tokens before the configure took effect, real audio after
    assert!(saw_silence);
    assert!(saw_audio);
}
