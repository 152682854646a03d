use std::{
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use ahash::AHashMap;
use bytes::BytesMut;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};

use codec::{
    rtcp::{
        Decoder, Packet,
        feedback::{FirEntry, FullIntraRequest, NackPair, PictureLossIndication, TransportLayerNack},
        remb::ReceiverEstimatedMaximumBitrate,
        report::{ReceiverReport, ReceptionReport},
    },
    rtp::RtpPacket,
};
use service::{
    Error, Media, RtcpFeedback,
    cache::PacketCache,
    control::{self, FEEDBACK_INTERVAL, FirCounter, RateLimiter},
    jitter::Jitter,
    rate::Estimator,
    time::{JIFFIES_PER_SEC, jiffies},
};

use crate::{
    config::Config,
    peers::PeerRegistry,
    statistics::{Statistics, StatisticsReporter, Stats},
    transport::{ConnectionState, IceCandidate, MediaSource, PeerConnection, TransportError},
};

use super::{
    PACKET_BUFFER_SIZE, SERIAL_HALF,
    down::{DownConnection, DownTrack},
    next_track_id,
    writer::{Command, Forward, WriterPool},
};

/// Sequence gap, counted from the start of the reception window, past
/// which the ingest loop mines the window for NACKs.
const NACK_TRIGGER_GAP: u16 = 24;

#[derive(Default)]
struct SenderReportTiming {
    time: u64,
    ntp: u64,
    rtp: u32,
    seen: bool,
}

/// One inbound media stream.
///
/// Owns the retransmission cache and the jitter and rate estimates its
/// ingest reader maintains, plus the authoritative list of down tracks
/// subscribed to it.
pub struct UpTrack {
    id: u64,
    ssrc: u32,
    mid: String,
    media: Media,
    label: Mutex<String>,
    cname: Mutex<Option<String>>,
    cache: PacketCache,
    jitter: Jitter,
    rate: Estimator,
    sr: Mutex<SenderReportTiming>,
    pli_limit: RateLimiter,
    fir_limit: RateLimiter,
    fir_counter: FirCounter,
    subscribers: Mutex<Vec<Arc<DownTrack>>>,
    commands: mpsc::Sender<Command>,
    reader_done: watch::Receiver<bool>,
    connection: Weak<UpConnection>,
}

impl UpTrack {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    pub fn mid(&self) -> &str {
        &self.mid
    }

    pub fn media(&self) -> &Media {
        &self.media
    }

    pub fn label(&self) -> String {
        self.label.lock().clone()
    }

    pub fn cname(&self) -> Option<String> {
        self.cname.lock().clone()
    }

    pub fn connection(&self) -> Option<Arc<UpConnection>> {
        self.connection.upgrade()
    }

    pub(crate) fn cache(&self) -> &PacketCache {
        &self.cache
    }

    /// Read a cached packet back by sequence number; the
    /// retransmission path of subscribers.
    pub fn get_rtp(&self, seqno: u16, buffer: &mut [u8]) -> Option<usize> {
        self.cache.get(seqno, buffer)
    }

    /// Attach a subscriber: list first, then notify the ingest reader.
    /// The notify races the reader's termination, so subscribing to a
    /// track whose reader is gone is a no-op rather than a leak.
    pub async fn subscribe(&self, down: Arc<DownTrack>) {
        {
            let mut subscribers = self.subscribers.lock();
            if subscribers.iter().any(|it| it.id() == down.id()) {
                return;
            }

            subscribers.push(down.clone());
        }

        self.notify(Command::Add(down)).await;
    }

    /// Detach a subscriber; unknown ids are ignored.
    pub async fn unsubscribe(&self, id: u64) {
        {
            let mut subscribers = self.subscribers.lock();
            let count = subscribers.len();
            subscribers.retain(|it| it.id() != id);
            if subscribers.len() == count {
                return;
            }
        }

        self.notify(Command::Remove(id)).await;
    }

    async fn notify(&self, command: Command) {
        let mut done = self.reader_done.clone();

        tokio::select! {
            _ = self.commands.send(command) => {}
            _ = done.wait_for(|it| *it) => {}
        }
    }

    pub fn subscribers(&self) -> Vec<Arc<DownTrack>> {
        self.subscribers.lock().clone()
    }

    /// Record an upstream sender report; true if it is the first one
    /// this track has seen.
    fn set_sr(&self, time: u64, ntp: u64, rtp: u32) -> bool {
        let mut sr = self.sr.lock();
        let first = !sr.seen;
        *sr = SenderReportTiming {
            time,
            ntp,
            rtp,
            seen: true,
        };

        first
    }

    fn sr(&self) -> (u64, u64) {
        let sr = self.sr.lock();
        (sr.time, sr.ntp)
    }

    /// The publisher's clock mapping, if a sender report has pinned it
    /// already; late subscribers are seeded from this.
    pub(crate) fn time_offset(&self) -> Option<(u64, u32)> {
        let sr = self.sr.lock();
        sr.seen.then(|| (sr.ntp, sr.rtp))
    }
}

/// A publisher session: the up tracks of one peer connection, the
/// subscriber connections fed from them, and the 1 Hz receiver-report
/// loop that talks back to the publisher.
pub struct UpConnection {
    id: String,
    label: String,
    ssrc: u32,
    pc: Arc<dyn PeerConnection>,
    registry: Arc<dyn PeerRegistry>,
    config: Arc<Config>,
    statistics: Statistics,
    reporter: StatisticsReporter,
    labels: Mutex<AHashMap<String, String>>,
    tracks: Mutex<Vec<Arc<UpTrack>>>,
    local: Mutex<Vec<Weak<DownConnection>>>,
    pending_candidates: Mutex<Vec<IceCandidate>>,
    pushed: AtomicBool,
}

impl UpConnection {
    pub fn new(
        id: String,
        label: String,
        pc: Arc<dyn PeerConnection>,
        registry: Arc<dyn PeerRegistry>,
        config: Arc<Config>,
        statistics: Statistics,
    ) -> Arc<Self> {
        statistics.register(id.clone());
        log::info!("up connection open: id={}, label={}", id, label);

        let this = Arc::new(Self {
            reporter: statistics.get_reporter(),
            ssrc: rand::random(),
            id,
            label,
            pc,
            registry,
            config,
            statistics,
            labels: Mutex::new(AHashMap::new()),
            tracks: Mutex::new(Vec::new()),
            local: Mutex::new(Vec::new()),
            pending_candidates: Mutex::new(Vec::new()),
            pushed: AtomicBool::new(false),
        });

        tokio::spawn(rtcp_sender_loop(this.clone()));
        this
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn tracks(&self) -> Vec<Arc<UpTrack>> {
        self.tracks.lock().clone()
    }

    /// Install the (mid -> label) transceiver map from signaling and
    /// relabel the tracks already received.
    pub fn set_labels(self: &Arc<Self>, labels: AHashMap<String, String>) {
        {
            let mut guard = self.labels.lock();
            *guard = labels;
        }

        for track in self.tracks() {
            let label = self.labels.lock().get(&track.mid).cloned();
            if let Some(label) = label {
                *track.label.lock() = label;
            }
        }

        self.maybe_push();
    }

    /// A new inbound track was delivered by the transport. Spawns its
    /// ingest reader and RTCP listener, and announces the connection
    /// to peers once the transceiver map is fully populated.
    pub fn on_track(
        self: &Arc<Self>,
        source: Arc<dyn MediaSource>,
        ssrc: u32,
        mid: &str,
        media: Media,
    ) -> Arc<UpTrack> {
        let label = {
            let labels = self.labels.lock();
            match labels.get(mid) {
                Some(it) => it.clone(),
                None => {
                    // A label may still arrive with a later map; until
                    // then the track carries an empty one.
                    log::warn!("no label for track: conn={}, mid={}", self.id, mid);
                    String::new()
                }
            }
        };

        let (commands, command_receiver) = mpsc::channel(16);
        let (done_sender, reader_done) = watch::channel(false);

        let track = Arc::new(UpTrack {
            id: next_track_id(),
            jitter: Jitter::new(media.clock_rate),
            rate: Estimator::new(JIFFIES_PER_SEC),
            cache: PacketCache::new(32),
            ssrc,
            mid: mid.to_string(),
            media,
            label: Mutex::new(label),
            cname: Mutex::new(None),
            sr: Mutex::new(SenderReportTiming::default()),
            pli_limit: RateLimiter::new(FEEDBACK_INTERVAL),
            fir_limit: RateLimiter::new(FEEDBACK_INTERVAL),
            fir_counter: FirCounter::default(),
            subscribers: Mutex::new(Vec::new()),
            commands,
            reader_done,
            connection: Arc::downgrade(self),
        });

        self.tracks.lock().push(track.clone());
        log::info!(
            "up track open: conn={}, ssrc={}, mid={}",
            self.id,
            ssrc,
            mid
        );

        tokio::spawn(ingest_loop(
            self.clone(),
            track.clone(),
            source.clone(),
            command_receiver,
            done_sender,
        ));
        tokio::spawn(rtcp_listener_loop(self.clone(), track.clone(), source));

        self.maybe_push();
        track
    }

    /// Announce the connection to the peer set exactly once, when
    /// every transceiver in the map has produced its track. Peer code
    /// is called with no lock held.
    fn maybe_push(self: &Arc<Self>) {
        let complete = {
            let labels = self.labels.lock();
            let tracks = self.tracks.lock();
            !labels.is_empty() && tracks.len() == labels.len()
        };

        if !complete || self.pushed.swap(true, Ordering::SeqCst) {
            return;
        }

        let tracks = self.tracks();
        for peer in self.registry.peers(&self.id) {
            peer.push_connection(&self.id, self.clone(), tracks.clone(), &self.label);
        }

        log::info!(
            "up connection announced: id={}, tracks={}",
            self.id,
            tracks.len()
        );
    }

    pub(crate) fn remove_track(&self, id: u64) {
        self.tracks.lock().retain(|it| it.id != id);
    }

    pub(crate) fn add_local(&self, down: &Arc<DownConnection>) {
        self.local.lock().push(Arc::downgrade(down));
    }

    pub(crate) fn remove_local(&self, id: &str) {
        self.local.lock().retain(|it| match it.upgrade() {
            Some(conn) => conn.id() != id,
            None => false,
        });
    }

    pub(crate) fn local(&self) -> Vec<Arc<DownConnection>> {
        self.local.lock().iter().filter_map(Weak::upgrade).collect()
    }

    /// Queue or apply a trickled remote candidate, depending on
    /// whether the remote description exists yet.
    pub fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        if !self.pc.remote_description_set() {
            self.pending_candidates.lock().push(candidate);
            return Ok(());
        }

        self.pc.add_remote_candidate(candidate)
    }

    /// Flush queued candidates once the remote description is applied.
    /// Every candidate is attempted; the first failure is returned.
    pub fn flush_ice_candidates(&self) -> Result<(), TransportError> {
        let pending = std::mem::take(&mut *self.pending_candidates.lock());

        let mut result = Ok(());
        for candidate in pending {
            if let Err(e) = self.pc.add_remote_candidate(candidate) {
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }

        result
    }

    /// Ask the publisher for a keyframe.
    pub async fn send_pli(&self, track: &UpTrack) -> Result<(), Error> {
        if !track.media.supports(RtcpFeedback::NackPli) {
            return Err(Error::UnsupportedFeedback);
        }

        if !track.pli_limit.allow(jiffies()) {
            return Err(Error::RateLimited);
        }

        let mut bytes = BytesMut::with_capacity(12);
        PictureLossIndication {
            sender_ssrc: self.ssrc,
            media_ssrc: track.ssrc,
        }
        .encode(&mut bytes);

        self.write_rtcp(&bytes, Stats::PliPkts(1)).await;
        Ok(())
    }

    /// Ask the publisher for a keyframe, FIR flavour. The command
    /// counter advances before the capability and quota tests so the
    /// sequence stays monotone across suppressed sends.
    pub async fn send_fir(&self, track: &UpTrack, increment: bool) -> Result<(), Error> {
        let seqno = track.fir_counter.next(increment);

        if !track.media.supports(RtcpFeedback::CcmFir) {
            return Err(Error::UnsupportedFeedback);
        }

        if !track.fir_limit.allow(jiffies()) {
            return Err(Error::RateLimited);
        }

        let mut bytes = BytesMut::with_capacity(20);
        FullIntraRequest {
            sender_ssrc: self.ssrc,
            media_ssrc: 0,
            fir: vec![FirEntry {
                ssrc: track.ssrc,
                sequence_number: seqno,
            }],
        }
        .encode(&mut bytes);

        self.write_rtcp(&bytes, Stats::FirPkts(1)).await;
        Ok(())
    }

    /// Request retransmission of a run of sequence numbers. A codec
    /// without `nack` makes this a successful no-op.
    pub async fn send_nack(&self, track: &UpTrack, pivot: u16, lost: u16) -> Result<(), Error> {
        if !track.media.supports(RtcpFeedback::Nack) {
            return Ok(());
        }

        let pair = NackPair {
            packet_id: pivot,
            lost_packets: lost,
        };

        let mut bytes = BytesMut::with_capacity(16);
        TransportLayerNack {
            sender_ssrc: self.ssrc,
            media_ssrc: track.ssrc,
            nacks: vec![pair],
        }
        .encode(&mut bytes);

        if self.write_rtcp(&bytes, Stats::NackPkts(1)).await {
            track.cache.expect(pair.lost_count());
        }

        Ok(())
    }

    async fn write_rtcp(&self, bytes: &[u8], stat: Stats) -> bool {
        match self.pc.write_rtcp(bytes).await {
            Ok(()) => {
                self.reporter
                    .send(&self.id, &[stat, Stats::SendBytes(bytes.len())]);
                true
            }
            Err(e) => {
                if !e.is_closed() {
                    log::warn!("up connection rtcp write failed: id={}, err={}", self.id, e);
                }

                false
            }
        }
    }

    /// Re-fit a track's retransmission cache to the worst subscriber:
    /// it has to span the largest RTO (rtt + 4 * jitter) with room to
    /// spare, and no more.
    fn update_track_cache(&self, track: &UpTrack, now: u64) {
        let mut max_rto = 0u64;
        for down in track.subscribers() {
            let (_, jitter) = down.stats(now);
            let jitter = jitter as u64 * JIFFIES_PER_SEC / track.media.clock_rate as u64;
            max_rto = max_rto.max(down.rtt() + 4 * jitter);
        }

        let (_, packet_rate) = track.rate.estimate(now);
        track
            .cache
            .resize(control::cache_capacity(packet_rate, max_rto));
    }

    /// Drop the connection from the statistics registry; the loops
    /// wind down on their own when the transport reports closed.
    pub fn close(&self) {
        self.statistics.unregister(&self.id);
        log::info!("up connection close: id={}", self.id);
    }
}

/// The per-track ingest reader: decode, account, cache, mine NACKs,
/// fan out to the writer pool.
async fn ingest_loop(
    conn: Arc<UpConnection>,
    track: Arc<UpTrack>,
    source: Arc<dyn MediaSource>,
    mut commands: mpsc::Receiver<Command>,
    done: watch::Sender<bool>,
) {
    let mut pool = WriterPool::default();
    let mut buffer = vec![0u8; PACKET_BUFFER_SIZE];

    loop {
        let size = match source.recv(&mut buffer).await {
            Ok(it) => it,
            Err(e) => {
                if !e.is_closed() {
                    log::error!(
                        "up track read failed: conn={}, ssrc={}, err={}",
                        conn.id,
                        track.ssrc,
                        e
                    );
                }

                break;
            }
        };

        conn.reporter.send(
            &conn.id,
            &[Stats::ReceivedBytes(size), Stats::ReceivedPkts(1)],
        );

        let packet = match RtpPacket::decode(&buffer[..size]) {
            Ok(it) => it,
            Err(e) => {
                log::trace!("malformed rtp packet: conn={}, err={}", conn.id, e);
                conn.reporter.send(&conn.id, &[Stats::ErrorPkts(1)]);
                continue;
            }
        };

        let now = jiffies();
        track.rate.accumulate(size);
        track.jitter.accumulate(packet.timestamp, now);

        let (first, index) = track.cache.store(packet.sequence_number, &buffer[..size]);

        let gap = packet.sequence_number.wrapping_sub(first);
        if gap > NACK_TRIGGER_GAP && gap < SERIAL_HALF {
            if let Some((pivot, lost)) = track.cache.nack_get() {
                let _ = conn.send_nack(&track, pivot, lost).await;
            }
        }

        // Spread bursts over roughly half a packet interval.
        let (_, packet_rate) = track.rate.estimate(now);
        let delay = if packet_rate > 512 {
            JIFFIES_PER_SEC / packet_rate as u64 / 2
        } else {
            JIFFIES_PER_SEC / 1024
        };

        pool.forward(Forward {
            seqno: packet.sequence_number,
            index,
            delay,
            is_video: track.media.kind.is_video(),
            marker: packet.marker,
        });

        while let Ok(command) = commands.try_recv() {
            pool.apply(command, &track);
        }
    }

    // Closing the pool stops the workers; the done signal unblocks any
    // pending subscribe/unsubscribe notifier.
    drop(pool);
    let _ = done.send(true);

    conn.remove_track(track.id);
    log::info!("up track close: conn={}, ssrc={}", conn.id, track.ssrc);
}

/// The per-track RTCP listener on the receiver side: sender reports
/// and source descriptions from the publisher.
async fn rtcp_listener_loop(
    conn: Arc<UpConnection>,
    track: Arc<UpTrack>,
    source: Arc<dyn MediaSource>,
) {
    let mut buffer = vec![0u8; PACKET_BUFFER_SIZE];

    loop {
        let size = match source.recv_rtcp(&mut buffer).await {
            Ok(it) => it,
            Err(e) => {
                if !e.is_closed() {
                    log::error!("up track rtcp read failed: conn={}, err={}", conn.id, e);
                }

                break;
            }
        };

        let packets = match Decoder::decode(&buffer[..size]) {
            Ok(it) => it,
            Err(e) => {
                log::trace!("malformed rtcp packet: conn={}, err={}", conn.id, e);
                conn.reporter.send(&conn.id, &[Stats::ErrorPkts(1)]);
                continue;
            }
        };

        let mut first_sr = false;
        for packet in &packets {
            match packet {
                Packet::SenderReport(sr) => {
                    first_sr |= track.set_sr(jiffies(), sr.ntp_time, sr.rtp_time);
                    for down in track.subscribers() {
                        down.set_time_offset(sr.ntp_time, sr.rtp_time);
                    }
                }
                Packet::SourceDescription(sdes) => {
                    for chunk in &sdes.chunks {
                        if chunk.ssrc != track.ssrc {
                            continue;
                        }

                        if let Some(cname) = &chunk.cname {
                            *track.cname.lock() = Some(cname.clone());
                            for down in track.subscribers() {
                                down.set_cname(cname);
                            }
                        }
                    }
                }
                _ => {}
            }
        }

        // The first sender report pins the publisher's clock; push it
        // downstream at once instead of waiting for the next tick.
        if first_sr {
            for down in conn.local() {
                let _ = down.send_reports().await;
            }
        }
    }
}

/// The 1 Hz upstream feedback: one receiver report covering every
/// track, with a REMB for the tracks that do not carry their own
/// estimation.
async fn rtcp_sender_loop(conn: Arc<UpConnection>) {
    let mut interval = tokio::time::interval(Duration::from_secs(1));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        interval.tick().await;

        let tracks = conn.tracks();
        if tracks.is_empty() {
            if conn.pc.state() == ConnectionState::Closed {
                break;
            }

            continue;
        }

        let now = jiffies();
        let mut reports = Vec::with_capacity(tracks.len());
        let mut remb_ssrcs = Vec::with_capacity(tracks.len());

        for track in &tracks {
            conn.update_track_cache(track, now);

            let stats = track.cache.get_stats(true);
            let expected = stats.expected.max(1);
            let lost = stats.lost.min(expected - 1);

            let (sr_time, sr_ntp) = track.sr();
            let delay = if sr_time != 0 && now >= sr_time {
                ((now - sr_time) / (JIFFIES_PER_SEC / 65536)) as u32
            } else {
                0
            };

            reports.push(ReceptionReport {
                ssrc: track.ssrc,
                fraction_lost: ((lost * 256) / expected) as u8,
                total_lost: stats.total_lost,
                last_sequence_number: stats.extended_sequence_number,
                jitter: track.jitter.get(),
                last_sender_report: (sr_ntp >> 16) as u32,
                delay,
            });

            if !track.media.supports(RtcpFeedback::GoogRemb) {
                remb_ssrcs.push(track.ssrc);
            }
        }

        let mut bytes = BytesMut::with_capacity(128);
        ReceiverReport {
            ssrc: conn.ssrc,
            reports,
        }
        .encode(&mut bytes);

        if !remb_ssrcs.is_empty() {
            let mut target = u64::MAX;
            for down in conn.local() {
                target = target.min(down.max_bitrate(now));
            }

            if target != u64::MAX {
                ReceiverEstimatedMaximumBitrate {
                    sender_ssrc: conn.ssrc,
                    bitrate: target.max(conn.config.media.min_bitrate),
                    ssrcs: remb_ssrcs,
                }
                .encode(&mut bytes);
            }
        }

        let sent = conn.write_rtcp(&bytes, Stats::SendPkts(1)).await;
        if !sent && conn.pc.state() == ConnectionState::Closed {
            break;
        }
    }

    log::info!("up connection rtcp sender stop: id={}", conn.id);
}
