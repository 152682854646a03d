use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, SystemTime},
};

use async_trait::async_trait;
use bytes::BytesMut;
use parking_lot::Mutex;
use tokio::{
    sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel},
    time::{sleep, timeout},
};

use codec::{
    rtcp::{
        Decoder, Packet,
        feedback::{FirEntry, FullIntraRequest, NackPair, PictureLossIndication, TransportLayerNack},
        remb::ReceiverEstimatedMaximumBitrate,
        report::{ReceiverReport, ReceptionReport, SenderReport},
    },
    rtp::RtpPacket,
};
use service::{
    Media, MediaKind, RtcpFeedback,
    time::{jiffies, time_to_ntp},
};
use sfu_server::{
    Config, DownConnection, DownTrack, Statistics, UpConnection,
    peers::{Peer, PeerRegistry},
    transport::{
        ConnectionState, IceCandidate, MediaSink, MediaSource, PeerConnection, TransportError,
    },
};

struct NoPeers;

impl PeerRegistry for NoPeers {
    fn peers(&self, _exclude: &str) -> Vec<Arc<dyn Peer>> {
        Vec::new()
    }
}

struct MockPeerConnection {
    rtcp: UnboundedSender<Vec<u8>>,
    remote_description: AtomicBool,
    candidates: Mutex<Vec<IceCandidate>>,
    closed: AtomicBool,
}

impl MockPeerConnection {
    fn new() -> (Arc<Self>, UnboundedReceiver<Vec<u8>>) {
        let (rtcp, receiver) = unbounded_channel();

        (
            Arc::new(Self {
                rtcp,
                remote_description: AtomicBool::new(true),
                candidates: Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
            }),
            receiver,
        )
    }
}

#[async_trait]
impl PeerConnection for MockPeerConnection {
    fn add_receive_transceiver(&self, _kind: MediaKind) -> Result<(), TransportError> {
        Ok(())
    }

    fn state(&self) -> ConnectionState {
        if self.closed.load(Ordering::Relaxed) {
            ConnectionState::Closed
        } else {
            ConnectionState::Connected
        }
    }

    fn remote_description_set(&self) -> bool {
        self.remote_description.load(Ordering::Relaxed)
    }

    fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        self.candidates.lock().push(candidate);
        Ok(())
    }

    async fn write_rtcp(&self, bytes: &[u8]) -> Result<(), TransportError> {
        self.rtcp
            .send(bytes.to_vec())
            .map_err(|_| TransportError::Closed)
    }
}

struct MockSource {
    rtp: tokio::sync::Mutex<UnboundedReceiver<Vec<u8>>>,
    rtcp: tokio::sync::Mutex<UnboundedReceiver<Vec<u8>>>,
}

impl MockSource {
    fn new() -> (Arc<Self>, UnboundedSender<Vec<u8>>, UnboundedSender<Vec<u8>>) {
        let (rtp_sender, rtp) = unbounded_channel();
        let (rtcp_sender, rtcp) = unbounded_channel();

        (
            Arc::new(Self {
                rtp: tokio::sync::Mutex::new(rtp),
                rtcp: tokio::sync::Mutex::new(rtcp),
            }),
            rtp_sender,
            rtcp_sender,
        )
    }
}

#[async_trait]
impl MediaSource for MockSource {
    async fn recv(&self, buffer: &mut [u8]) -> Result<usize, TransportError> {
        match self.rtp.lock().await.recv().await {
            Some(bytes) => {
                buffer[..bytes.len()].copy_from_slice(&bytes);
                Ok(bytes.len())
            }
            None => Err(TransportError::Closed),
        }
    }

    async fn recv_rtcp(&self, buffer: &mut [u8]) -> Result<usize, TransportError> {
        match self.rtcp.lock().await.recv().await {
            Some(bytes) => {
                buffer[..bytes.len()].copy_from_slice(&bytes);
                Ok(bytes.len())
            }
            None => Err(TransportError::Closed),
        }
    }
}

struct MockSink {
    sent: UnboundedSender<Vec<u8>>,
    rtcp: tokio::sync::Mutex<UnboundedReceiver<Vec<u8>>>,
}

impl MockSink {
    fn new() -> (Arc<Self>, UnboundedReceiver<Vec<u8>>, UnboundedSender<Vec<u8>>) {
        let (sent, sent_receiver) = unbounded_channel();
        let (rtcp_sender, rtcp) = unbounded_channel();

        (
            Arc::new(Self {
                sent,
                rtcp: tokio::sync::Mutex::new(rtcp),
            }),
            sent_receiver,
            rtcp_sender,
        )
    }
}

#[async_trait]
impl MediaSink for MockSink {
    async fn send(&self, bytes: &[u8]) -> Result<(), TransportError> {
        self.sent
            .send(bytes.to_vec())
            .map_err(|_| TransportError::Closed)
    }

    async fn recv_rtcp(&self, buffer: &mut [u8]) -> Result<usize, TransportError> {
        match self.rtcp.lock().await.recv().await {
            Some(bytes) => {
                buffer[..bytes.len()].copy_from_slice(&bytes);
                Ok(bytes.len())
            }
            None => Err(TransportError::Closed),
        }
    }
}

fn video() -> Media {
    Media {
        mime: "video/VP8".to_string(),
        kind: MediaKind::Video,
        clock_rate: 90000,
        feedback: vec![
            RtcpFeedback::Nack,
            RtcpFeedback::NackPli,
            RtcpFeedback::CcmFir,
        ],
    }
}

fn rtp(ssrc: u32, seqno: u16, timestamp: u32) -> Vec<u8> {
    let mut bytes = BytesMut::with_capacity(64);

    RtpPacket {
        marker: false,
        payload_kind: 96,
        sequence_number: seqno,
        timestamp,
        ssrc,
        payload: &seqno.to_be_bytes(),
    }
    .encode(&mut bytes);

    bytes.to_vec()
}

fn rtp_sized(ssrc: u32, seqno: u16, timestamp: u32, marker: bool, size: usize) -> Vec<u8> {
    let mut bytes = BytesMut::with_capacity(12 + size);

    RtpPacket {
        marker,
        payload_kind: 96,
        sequence_number: seqno,
        timestamp,
        ssrc,
        payload: &vec![0u8; size],
    }
    .encode(&mut bytes);

    bytes.to_vec()
}

/// Publish video packets at a steady rate until aborted; frame
/// boundaries every 30 packets keep the writer's drop recovery path
/// usable.
fn pump(sender: UnboundedSender<Vec<u8>>, every: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);

        let mut seqno = 0u16;
        loop {
            interval.tick().await;

            let marker = seqno % 30 == 29;
            let bytes = rtp_sized(TRACK_SSRC, seqno, seqno as u32 * 3000, marker, 1200);
            if sender.send(bytes).is_err() {
                break;
            }

            seqno = seqno.wrapping_add(1);
        }
    })
}

const TRACK_SSRC: u32 = 0x2222;
const DOWN_SSRC: u32 = 0x3333;

struct Session {
    up: Arc<UpConnection>,
    /// RTCP the core writes towards the publisher.
    up_rtcp: UnboundedReceiver<Vec<u8>>,
    /// RTP/RTCP the publisher feeds into the core.
    rtp_sender: UnboundedSender<Vec<u8>>,
    rtcp_sender: UnboundedSender<Vec<u8>>,
    down: Arc<DownConnection>,
    down_track: Arc<DownTrack>,
    /// RTCP the core writes towards the subscriber.
    down_rtcp: UnboundedReceiver<Vec<u8>>,
    /// RTP forwarded to the subscriber.
    sink_sent: UnboundedReceiver<Vec<u8>>,
    /// RTCP the subscriber feeds back on its track.
    sink_rtcp: UnboundedSender<Vec<u8>>,
}

/// One publisher with one video track and one subscriber on it.
async fn session() -> Session {
    let _ = simple_logger::init_with_level(log::Level::Info);

    let config = Arc::new(Config::default());
    let statistics = Statistics::default();

    let (up_pc, up_rtcp) = MockPeerConnection::new();
    let up = UpConnection::new(
        "publisher".to_string(),
        "camera".to_string(),
        up_pc,
        Arc::new(NoPeers),
        config.clone(),
        statistics.clone(),
    );

    let (source, rtp_sender, rtcp_sender) = MockSource::new();
    let track = up.on_track(source, TRACK_SSRC, "0", video());

    let (down_pc, down_rtcp) = MockPeerConnection::new();
    let down = DownConnection::new("subscriber".to_string(), down_pc, &up, config, statistics);

    let (sink, sink_sent, sink_rtcp) = MockSink::new();
    let down_track = down.subscribe(&track, sink, DOWN_SSRC).await;

    Session {
        up,
        up_rtcp,
        rtp_sender,
        rtcp_sender,
        down,
        down_track,
        down_rtcp,
        sink_sent,
        sink_rtcp,
    }
}

/// Drain `receiver` until a packet matches `pick`, or time out.
async fn wait_for_rtcp<T>(
    receiver: &mut UnboundedReceiver<Vec<u8>>,
    wait: Duration,
    pick: impl Fn(&Packet) -> Option<T>,
) -> Option<T> {
    timeout(wait, async {
        while let Some(bytes) = receiver.recv().await {
            for packet in Decoder::decode(&bytes).unwrap() {
                if let Some(it) = pick(&packet) {
                    return Some(it);
                }
            }
        }

        None
    })
    .await
    .ok()
    .flatten()
}

fn drain(receiver: &mut UnboundedReceiver<Vec<u8>>) {
    while receiver.try_recv().is_ok() {}
}

#[tokio::test]
async fn test_nack_triggered_recovery() {
    let mut session = session().await;
    assert_eq!(session.up.tracks().len(), 1);

    for seqno in 100..=130u16 {
        if (115..=117).contains(&seqno) {
            continue;
        }

        let _ = session.rtp_sender.send(rtp(TRACK_SSRC, seqno, 0));
    }

    let nacks = wait_for_rtcp(&mut session.up_rtcp, Duration::from_secs(2), |packet| {
        match packet {
            Packet::TransportLayerNack(nack) => Some(nack.nacks.clone()),
            _ => None,
        }
    })
    .await
    .expect("no nack emitted");

    assert_eq!(nacks.len(), 1);
    assert_eq!(nacks[0].packet_id, 115);
    assert_eq!(nacks[0].lost_packets, 0b11);

    // The publisher answers; the retransmissions reach the subscriber
    // like any other packet, rewritten onto the subscriber's SSRC.
    for seqno in 115..=117u16 {
        let _ = session.rtp_sender.send(rtp(TRACK_SSRC, seqno, 0));
    }

    let mut pending: Vec<u16> = vec![115, 116, 117];
    timeout(Duration::from_secs(2), async {
        while let Some(bytes) = session.sink_sent.recv().await {
            let packet = RtpPacket::decode(&bytes).unwrap();
            assert_eq!(packet.ssrc, DOWN_SSRC);
            pending.retain(|it| *it != packet.sequence_number);
            if pending.is_empty() {
                break;
            }
        }
    })
    .await
    .expect("retransmissions never reached the subscriber");
}

#[tokio::test]
async fn test_first_sr_propagates_at_once() {
    let mut session = session().await;

    let sent = SystemTime::now();
    let remote_rtp = 50_000u32;
    let mut bytes = BytesMut::new();
    SenderReport {
        ssrc: TRACK_SSRC,
        ntp_time: time_to_ntp(sent),
        rtp_time: remote_rtp,
        packet_count: 10,
        octet_count: 1000,
        reports: vec![],
    }
    .encode(&mut bytes);
    let _ = session.rtcp_sender.send(bytes.to_vec());

    // The down connection does not wait for its next tick; its SR maps
    // our wall clock onto the publisher's RTP timeline.
    let sr = wait_for_rtcp(
        &mut session.down_rtcp,
        Duration::from_millis(500),
        |packet| match packet {
            Packet::SenderReport(sr) => Some((sr.ssrc, sr.rtp_time, sr.ntp_time)),
            _ => None,
        },
    )
    .await
    .expect("no sender report within the fast-path window");

    assert_eq!(sr.0, DOWN_SSRC);

    // At 90 kHz, 500 ms of slack bounds the advance to 45000 units.
    let advance = sr.1.wrapping_sub(remote_rtp);
    assert!(advance < 45_000, "rtp advance {advance} out of range");

    let skew = sr.2.abs_diff(time_to_ntp(SystemTime::now()));
    assert!((skew >> 32) < 2, "ntp timestamp far from now");
}

#[tokio::test]
async fn test_pli_rate_limited() {
    let mut session = session().await;

    // The subscription itself requested a keyframe; let that quota
    // window pass and forget about it.
    sleep(Duration::from_millis(250)).await;
    drain(&mut session.up_rtcp);

    let mut bytes = BytesMut::new();
    PictureLossIndication {
        sender_ssrc: 0,
        media_ssrc: DOWN_SSRC,
    }
    .encode(&mut bytes);

    let _ = session.sink_rtcp.send(bytes.to_vec());
    sleep(Duration::from_millis(100)).await;
    let _ = session.sink_rtcp.send(bytes.to_vec());
    sleep(Duration::from_millis(300)).await;

    let mut plis = 0;
    while let Ok(written) = session.up_rtcp.try_recv() {
        for packet in Decoder::decode(&written).unwrap() {
            if matches!(packet, Packet::PictureLossIndication(_)) {
                plis += 1;
            }
        }
    }

    assert_eq!(plis, 1, "two PLIs 100 ms apart must collapse into one");
}

#[tokio::test]
async fn test_fir_seqno_discipline() {
    let mut session = session().await;

    // Get clear of the subscribe-time PLI; FIR has its own quota but
    // keep the log clean.
    sleep(Duration::from_millis(250)).await;
    drain(&mut session.up_rtcp);

    // The subscriber addresses the track it receives, by its own SSRC.
    let fir = |seqno: u8| {
        let mut bytes = BytesMut::new();
        FullIntraRequest {
            sender_ssrc: 0,
            media_ssrc: DOWN_SSRC,
            fir: vec![FirEntry {
                ssrc: DOWN_SSRC,
                sequence_number: seqno,
            }],
        }
        .encode(&mut bytes);
        bytes.to_vec()
    };

    let _ = session.sink_rtcp.send(fir(7));
    sleep(Duration::from_millis(50)).await;
    // Same command again: no counter advance, no emit.
    let _ = session.sink_rtcp.send(fir(7));
    sleep(Duration::from_millis(200)).await;
    // A new command: advance and emit.
    let _ = session.sink_rtcp.send(fir(8));
    sleep(Duration::from_millis(200)).await;

    let mut seqnos = Vec::new();
    while let Ok(written) = session.up_rtcp.try_recv() {
        for packet in Decoder::decode(&written).unwrap() {
            if let Packet::FullIntraRequest(fir) = packet {
                // Upstream the request targets the publisher's stream.
                assert_eq!(fir.fir[0].ssrc, TRACK_SSRC);
                seqnos.push(fir.fir[0].sequence_number);
            }
        }
    }

    assert_eq!(seqnos, vec![1, 2]);
}

#[tokio::test]
async fn test_remb_follows_subscriber_estimate() {
    let mut session = session().await;

    let mut bytes = BytesMut::new();
    ReceiverEstimatedMaximumBitrate {
        sender_ssrc: 0,
        bitrate: 300_000,
        ssrcs: vec![TRACK_SSRC],
    }
    .encode(&mut bytes);
    let _ = session.sink_rtcp.send(bytes.to_vec());

    // The 1 Hz up-sender folds the subscriber's estimate into the
    // REMB it reports to the publisher.
    let remb = wait_for_rtcp(&mut session.up_rtcp, Duration::from_secs(3), |packet| {
        match packet {
            Packet::ReceiverEstimatedMaximumBitrate(remb) => {
                Some((remb.bitrate, remb.ssrcs.clone()))
            }
            _ => None,
        }
    })
    .await
    .expect("no remb from the up sender");

    assert_eq!(remb.0, 300_000);
    assert_eq!(remb.1, vec![TRACK_SSRC]);
    assert_eq!(session.down.tracks().len(), 1);
}

#[tokio::test]
async fn test_receiver_report_counts_loss() {
    let mut session = session().await;

    for seqno in 0..50u16 {
        if seqno % 10 == 4 {
            continue;
        }

        let _ = session.rtp_sender.send(rtp(TRACK_SSRC, seqno, seqno as u32 * 3000));
    }

    // A tick may fire mid-burst; wait for the report that has seen the
    // whole of it.
    let report = wait_for_rtcp(&mut session.up_rtcp, Duration::from_secs(3), |packet| {
        match packet {
            Packet::ReceiverReport(rr)
                if !rr.reports.is_empty() && rr.reports[0].last_sequence_number == 49 =>
            {
                Some(rr.reports[0])
            }
            _ => None,
        }
    })
    .await
    .expect("no receiver report covering the burst");

    assert_eq!(report.ssrc, TRACK_SSRC);

    // 5 of 50 packets were dropped. NACKed packets that were never
    // retransmitted count against the expected total a second time, so
    // the cumulative loss is bounded rather than pinned.
    assert!(report.total_lost >= 5 && report.total_lost <= 9);
    assert!(report.fraction_lost as u32 <= 60);
}

#[tokio::test]
async fn test_loss_based_rate_control() {
    let mut session = session().await;

    let rr = |loss: u8| {
        let mut bytes = BytesMut::new();
        ReceiverReport {
            ssrc: 0,
            reports: vec![ReceptionReport {
                ssrc: DOWN_SSRC,
                fraction_lost: loss,
                ..ReceptionReport::default()
            }],
        }
        .encode(&mut bytes);
        bytes.to_vec()
    };

    // ~500 packets/s of real traffic keeps the subscriber saturated
    // against every budget this test walks through.
    let feeder = pump(session.rtp_sender.clone(), Duration::from_millis(2));

    // The first report finds a stale budget and resets it to the
    // initial rate; whether it probes on top depends on how much
    // traffic the first rate window happened to catch, so nothing is
    // pinned down yet.
    let _ = session.sink_rtcp.send(rr(0));
    sleep(Duration::from_millis(1200)).await;

    // A full window of traffic later the budget is demonstrably
    // saturated: a clean report grows it by exactly 269/256.
    let _ = session.sink_rtcp.send(rr(0));
    sleep(Duration::from_millis(150)).await;

    let r2 = session.down_track.max_bitrate(jiffies());
    assert!(
        r2 == 512_000 * 269 / 256 || r2 == 512_000 * 269 / 256 * 269 / 256,
        "unexpected budget after probing: {r2}"
    );

    // Heavy loss backs off by exactly (512 - loss) / 512.
    let _ = session.sink_rtcp.send(rr(30));
    sleep(Duration::from_millis(150)).await;

    let r3 = session.down_track.max_bitrate(jiffies());
    assert_eq!(r3, r2 * (512 - 30) / 512);

    // Once the loss clears, probing resumes from the reduced budget.
    sleep(Duration::from_millis(1050)).await;
    let _ = session.sink_rtcp.send(rr(0));
    sleep(Duration::from_millis(150)).await;

    let r4 = session.down_track.max_bitrate(jiffies());
    assert_eq!(r4, r3 * 269 / 256);

    feeder.abort();
}

#[tokio::test]
async fn test_cache_resizes_to_subscriber_rto() {
    let mut session = session().await;

    // Publish the clock so the down connection starts emitting sender
    // reports this test can echo back.
    let mut bytes = BytesMut::new();
    SenderReport {
        ssrc: TRACK_SSRC,
        ntp_time: time_to_ntp(SystemTime::now()),
        rtp_time: 1000,
        packet_count: 0,
        octet_count: 0,
        reports: vec![],
    }
    .encode(&mut bytes);
    let _ = session.rtcp_sender.send(bytes.to_vec());

    let first_ntp = wait_for_rtcp(&mut session.down_rtcp, Duration::from_secs(2), |packet| {
        match packet {
            Packet::SenderReport(sr) => Some(sr.ntp_time),
            _ => None,
        }
    })
    .await
    .expect("no downstream sender report");

    // Let 300 ms pass, then echo the latest SR with a zero DLSR: to
    // the core that reads as a long round trip, on top of 9000 units
    // of reported jitter (100 ms at 90 kHz).
    sleep(Duration::from_millis(300)).await;

    let mut lsr = (first_ntp >> 16) as u32;
    while let Ok(written) = session.down_rtcp.try_recv() {
        for packet in Decoder::decode(&written).unwrap() {
            if let Packet::SenderReport(sr) = packet {
                lsr = (sr.ntp_time >> 16) as u32;
            }
        }
    }

    let mut report = BytesMut::new();
    ReceiverReport {
        ssrc: 0,
        reports: vec![ReceptionReport {
            ssrc: DOWN_SSRC,
            jitter: 9000,
            last_sender_report: lsr,
            delay: 0,
            ..ReceptionReport::default()
        }],
    }
    .encode(&mut report);
    let _ = session.sink_rtcp.send(report.to_vec());

    // ~3 s of ~500 packets/s: the periodic up-sender re-fits the
    // retransmission cache to rate * rto * 4, far past its 256-slot
    // ceiling and a long way up from the 32 slots it starts with.
    let feeder = pump(session.rtp_sender.clone(), Duration::from_millis(2));
    sleep(Duration::from_millis(3000)).await;
    feeder.abort();
    sleep(Duration::from_millis(50)).await;

    let mut last = 0u16;
    while let Ok(bytes) = session.sink_sent.try_recv() {
        let packet = RtpPacket::decode(&bytes).unwrap();
        last = last.max(packet.sequence_number);
    }
    assert!(last > 400, "traffic never flowed: last={last}");

    // A 200-packet-old retransmission can only be served if the cache
    // actually grew; the starting size forgot it long ago.
    let target = last - 200;
    let mut nack = BytesMut::new();
    TransportLayerNack {
        sender_ssrc: 0,
        media_ssrc: DOWN_SSRC,
        nacks: vec![NackPair {
            packet_id: target,
            lost_packets: 0,
        }],
    }
    .encode(&mut nack);
    let _ = session.sink_rtcp.send(nack.to_vec());

    let ssrc = timeout(Duration::from_secs(1), async {
        while let Some(bytes) = session.sink_sent.recv().await {
            let packet = RtpPacket::decode(&bytes).unwrap();
            if packet.sequence_number == target {
                return packet.ssrc;
            }
        }

        0
    })
    .await
    .expect("no retransmission served from the resized cache");

    assert_eq!(ssrc, DOWN_SSRC);
}

#[tokio::test]
async fn test_ice_candidates_buffered_until_remote_description() {
    let config = Arc::new(Config::default());
    let statistics = Statistics::default();

    let (up_pc, _up_rtcp) = MockPeerConnection::new();
    up_pc.remote_description.store(false, Ordering::Relaxed);

    let up = UpConnection::new(
        "publisher".to_string(),
        "camera".to_string(),
        up_pc.clone(),
        Arc::new(NoPeers),
        config,
        statistics,
    );

    for index in 0..3 {
        up.add_ice_candidate(IceCandidate {
            candidate: format!("candidate:{index}"),
            mid: Some("0".to_string()),
        })
        .unwrap();
    }

    // Nothing reaches the peer connection until the remote description
    // is applied; then everything does, in arrival order.
    assert!(up_pc.candidates.lock().is_empty());

    up_pc.remote_description.store(true, Ordering::Relaxed);
    up.flush_ice_candidates().unwrap();

    let candidates = up_pc.candidates.lock();
    assert_eq!(candidates.len(), 3);
    assert_eq!(candidates[0].candidate, "candidate:0");
    assert_eq!(candidates[2].candidate, "candidate:2");
}
