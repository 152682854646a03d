use std::{
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
    },
    time::{Duration, SystemTime},
};

use bytes::BytesMut;
use parking_lot::Mutex;

use codec::{
    rtcp::{Decoder, Packet, report::ReceptionReport, report::SenderReport, sdes::SourceDescription},
    rtp::RtpPacket,
};
use service::{
    Error, Media,
    cell::{BitrateCell, ReceiverStatsCell},
    control,
    rate::Estimator,
    time::{JIFFIES_PER_SEC, jiffies, ntp_to_time, rtp_units, time_to_ntp},
};

use crate::{
    config::Config,
    statistics::{Statistics, StatisticsReporter, Stats},
    transport::{ConnectionState, IceCandidate, MediaSink, PeerConnection, TransportError},
};

use super::{
    PACKET_BUFFER_SIZE, next_track_id,
    up::{UpConnection, UpTrack},
};

/// A clock mapping further out than this is nonsense, not drift.
const MAX_CLOCK_OFFSET: Duration = Duration::from_secs(3600);

/// One outbound media stream to a subscriber.
///
/// Holds the loss-driven send budget, the RTT estimate, the sender
/// report correlation state, and a handle on the up track it mirrors
/// for serving retransmissions.
pub struct DownTrack {
    id: u64,
    ssrc: u32,
    media: Media,
    up: Weak<UpTrack>,
    sink: Arc<dyn MediaSink>,
    rate: Estimator,
    stats: ReceiverStatsCell,
    max_bitrate: BitrateCell,
    /// Smoothed RTT in jiffies.
    rtt: AtomicU64,
    /// Timing of the last sender report we sent, for LSR correlation.
    sr_time: AtomicU64,
    sr_ntp: AtomicU64,
    /// The publisher's clock mapping, from its sender reports.
    remote_ntp: AtomicU64,
    remote_rtp: AtomicU32,
    cname: Mutex<Option<String>>,
    got_fir: AtomicBool,
    last_fir_seqno: AtomicU32,
    /// Lifetime totals reported in sender reports.
    packets: AtomicU32,
    octets: AtomicU32,
}

impl DownTrack {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    pub fn media(&self) -> &Media {
        &self.media
    }

    pub fn up(&self) -> Option<Arc<UpTrack>> {
        self.up.upgrade()
    }

    /// Send one packet to the subscriber, rewritten onto this track's
    /// own SSRC. Returns the number of bytes put on the wire.
    pub async fn write_rtp(&self, packet: &RtpPacket<'_>) -> Result<usize, TransportError> {
        let mut bytes = BytesMut::with_capacity(12 + packet.payload.len());
        RtpPacket {
            marker: packet.marker,
            payload_kind: packet.payload_kind,
            sequence_number: packet.sequence_number,
            timestamp: packet.timestamp,
            ssrc: self.ssrc,
            payload: packet.payload,
        }
        .encode(&mut bytes);

        self.sink.send(&bytes).await?;
        self.packets.fetch_add(1, Ordering::Relaxed);
        self.octets.fetch_add(bytes.len() as u32, Ordering::Relaxed);
        Ok(bytes.len())
    }

    pub fn accumulate(&self, bytes: usize) {
        self.rate.accumulate(bytes);
    }

    pub fn set_time_offset(&self, ntp: u64, rtp: u32) {
        self.remote_ntp.store(ntp, Ordering::Relaxed);
        self.remote_rtp.store(rtp, Ordering::Relaxed);
    }

    pub fn set_cname(&self, cname: &str) {
        *self.cname.lock() = Some(cname.to_string());
    }

    pub fn cname(&self) -> Option<String> {
        self.cname.lock().clone()
    }

    pub fn rtt(&self) -> u64 {
        self.rtt.load(Ordering::Relaxed)
    }

    pub fn stats(&self, now: u64) -> (u8, u32) {
        self.stats.get(now)
    }

    /// The loss-driven send budget; `u64::MAX` until a downstream
    /// report has established one.
    pub fn max_bitrate(&self, now: u64) -> u64 {
        self.max_bitrate.get(now)
    }

    /// Fetch a recent packet from the upstream cache, for serving this
    /// subscriber's retransmission requests.
    pub fn get_rtp(&self, seqno: u16, buffer: &mut [u8]) -> Option<usize> {
        self.up()?.get_rtp(seqno, buffer)
    }

    /// One downstream reception report: quality snapshot, send budget,
    /// and, when the LSR echo lines up, a round-trip sample.
    pub(crate) fn handle_report(&self, report: &ReceptionReport, now: u64) {
        self.stats.set(report.fraction_lost, report.jitter, now);

        let (bytes_per_sec, _) = self.rate.estimate(now);
        control::update_loss_rate(&self.max_bitrate, report.fraction_lost, bytes_per_sec, now);

        let sample = control::rtt_from_report(
            report,
            self.sr_time.load(Ordering::Relaxed),
            self.sr_ntp.load(Ordering::Relaxed),
            now,
        );

        if let Some(sample) = sample {
            control::update_rtt(&self.rtt, sample);
        }
    }
}

/// A subscriber session: the down tracks feeding one peer connection,
/// the REMB estimate it reports, and the 1 Hz sender-report loop.
pub struct DownConnection {
    id: String,
    up: Weak<UpConnection>,
    up_id: String,
    pc: Arc<dyn PeerConnection>,
    config: Arc<Config>,
    statistics: Statistics,
    reporter: StatisticsReporter,
    tracks: Mutex<Vec<Arc<DownTrack>>>,
    max_remb: BitrateCell,
    pending_candidates: Mutex<Vec<IceCandidate>>,
}

impl DownConnection {
    pub fn new(
        id: String,
        pc: Arc<dyn PeerConnection>,
        up: &Arc<UpConnection>,
        config: Arc<Config>,
        statistics: Statistics,
    ) -> Arc<Self> {
        statistics.register(id.clone());
        log::info!("down connection open: id={}, up={}", id, up.id());

        let this = Arc::new(Self {
            reporter: statistics.get_reporter(),
            up_id: up.id().to_string(),
            up: Arc::downgrade(up),
            id,
            pc,
            config,
            statistics,
            tracks: Mutex::new(Vec::new()),
            max_remb: BitrateCell::default(),
            pending_candidates: Mutex::new(Vec::new()),
        });

        up.add_local(&this);
        tokio::spawn(sender_loop(this.clone()));
        this
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn up_id(&self) -> &str {
        &self.up_id
    }

    pub fn tracks(&self) -> Vec<Arc<DownTrack>> {
        self.tracks.lock().clone()
    }

    /// Mirror one up track onto this subscriber. Spawns the track's
    /// RTCP listener and attaches it to the up track's writer pool;
    /// fresh video subscriptions request a keyframe at once instead of
    /// waiting for the next natural one.
    pub async fn subscribe(
        self: &Arc<Self>,
        up_track: &Arc<UpTrack>,
        sink: Arc<dyn MediaSink>,
        ssrc: u32,
    ) -> Arc<DownTrack> {
        let down = Arc::new(DownTrack {
            id: next_track_id(),
            media: up_track.media().clone(),
            up: Arc::downgrade(up_track),
            rate: Estimator::new(JIFFIES_PER_SEC),
            ssrc,
            sink,
            stats: ReceiverStatsCell::default(),
            max_bitrate: BitrateCell::default(),
            rtt: AtomicU64::new(0),
            sr_time: AtomicU64::new(0),
            sr_ntp: AtomicU64::new(0),
            remote_ntp: AtomicU64::new(0),
            remote_rtp: AtomicU32::new(0),
            cname: Mutex::new(up_track.cname()),
            got_fir: AtomicBool::new(false),
            last_fir_seqno: AtomicU32::new(0),
            packets: AtomicU32::new(0),
            octets: AtomicU32::new(0),
        });

        // A publisher that already sent its first SR will not repeat
        // it for us; seed the clock mapping from the stored one.
        if let Some((ntp, rtp)) = up_track.time_offset() {
            down.set_time_offset(ntp, rtp);
        }

        self.tracks.lock().push(down.clone());
        up_track.subscribe(down.clone()).await;
        tokio::spawn(rtcp_listener_loop(self.clone(), down.clone()));

        log::info!(
            "down track open: conn={}, ssrc={}, up_ssrc={}",
            self.id,
            ssrc,
            up_track.ssrc()
        );

        if down.media.kind.is_video() {
            if let Some(conn) = up_track.connection() {
                let _ = conn.send_pli(up_track).await;
            }
        }

        down
    }

    /// What this subscriber can take right now: its REMB capped by the
    /// sum of the per-track budgets, with configured defaults standing
    /// in for tracks that have not reported yet. `u64::MAX` when there
    /// is no information at all.
    pub fn max_bitrate(&self, now: u64) -> u64 {
        let mut total = 0u64;
        for track in self.tracks() {
            let rate = track.max_bitrate.get(now);
            total += if rate != u64::MAX {
                rate
            } else if track.media.kind.is_video() {
                self.config.media.video_default_bitrate
            } else {
                self.config.media.audio_default_bitrate
            };
        }

        let remb = self.max_remb.get(now);
        if total == 0 { remb } else { remb.min(total) }
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

    /// Emit one sender report (and CNAME, when known) per track whose
    /// upstream clock mapping is established. Returns how many tracks
    /// reported; zero means nothing was written at all.
    pub(crate) async fn send_reports(&self) -> Result<usize, TransportError> {
        let wall = SystemTime::now();
        let now = jiffies();
        let ntp = time_to_ntp(wall);

        let tracks = self.tracks();
        let mut bytes = BytesMut::with_capacity(128);
        let mut count = 0;

        for track in &tracks {
            let remote_ntp = track.remote_ntp.load(Ordering::Relaxed);
            if remote_ntp == 0 {
                // No sender report from the publisher yet.
                continue;
            }

            let Ok(elapsed) = wall.duration_since(ntp_to_time(remote_ntp)) else {
                continue;
            };
            if elapsed.is_zero() || elapsed > MAX_CLOCK_OFFSET {
                continue;
            }

            let rtp_time = track
                .remote_rtp
                .load(Ordering::Relaxed)
                .wrapping_add(rtp_units(elapsed, track.media.clock_rate) as u32);

            SenderReport {
                ssrc: track.ssrc,
                ntp_time: ntp,
                rtp_time,
                packet_count: track.packets.load(Ordering::Relaxed),
                octet_count: track.octets.load(Ordering::Relaxed),
                reports: vec![],
            }
            .encode(&mut bytes);

            track.sr_time.store(now, Ordering::Relaxed);
            track.sr_ntp.store(ntp, Ordering::Relaxed);

            if let Some(cname) = track.cname() {
                SourceDescription::cname(track.ssrc, &cname).encode(&mut bytes);
            }

            count += 1;
        }

        if count == 0 {
            return Ok(0);
        }

        self.pc.write_rtcp(&bytes).await?;
        self.reporter.send(
            &self.id,
            &[Stats::SendPkts(count), Stats::SendBytes(bytes.len())],
        );

        Ok(count)
    }

    /// Detach every track from its up track and leave the upstream
    /// connection's subscriber list. Safe to call more than once.
    pub async fn close(&self) {
        let tracks = std::mem::take(&mut *self.tracks.lock());
        for track in tracks {
            if let Some(up_track) = track.up() {
                up_track.unsubscribe(track.id).await;
            }
        }

        if let Some(up) = self.up.upgrade() {
            up.remove_local(&self.id);
        }

        self.statistics.unregister(&self.id);
        log::info!("down connection close: id={}", self.id);
    }
}

/// The per-track RTCP listener on the sender side: the subscriber's
/// keyframe requests, retransmission requests, reports and REMB.
async fn rtcp_listener_loop(conn: Arc<DownConnection>, track: Arc<DownTrack>) {
    let mut buffer = vec![0u8; PACKET_BUFFER_SIZE];
    let mut packet_buffer = vec![0u8; PACKET_BUFFER_SIZE];

    loop {
        let size = match track.sink.recv_rtcp(&mut buffer).await {
            Ok(it) => it,
            Err(e) => {
                if !e.is_closed() {
                    log::error!("down track rtcp read failed: conn={}, err={}", conn.id, e);
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

        for packet in &packets {
            match packet {
                Packet::PictureLossIndication(_) => {
                    let Some((up_track, up_conn)) = upstream(&track) else {
                        continue;
                    };

                    match up_conn.send_pli(&up_track).await {
                        Ok(()) | Err(Error::RateLimited) => {}
                        Err(e) => {
                            log::debug!("pli not forwarded: conn={}, err={}", conn.id, e)
                        }
                    }
                }
                Packet::FullIntraRequest(fir) => {
                    let Some(entry) = fir.fir.iter().find(|it| it.ssrc == track.ssrc) else {
                        log::warn!(
                            "fir for unknown ssrc: conn={}, ssrc={}",
                            conn.id,
                            fir.media_ssrc
                        );
                        continue;
                    };

                    // A repeat of the same command must not advance
                    // the upstream counter; a new one must, even if
                    // the send is then suppressed.
                    let seqno = entry.sequence_number as u32;
                    let first = !track.got_fir.swap(true, Ordering::Relaxed);
                    let last = track.last_fir_seqno.swap(seqno, Ordering::Relaxed);
                    let increment = first || last != seqno;

                    let Some((up_track, up_conn)) = upstream(&track) else {
                        continue;
                    };

                    if let Err(Error::UnsupportedFeedback) =
                        up_conn.send_fir(&up_track, increment).await
                    {
                        let _ = up_conn.send_pli(&up_track).await;
                    }
                }
                Packet::ReceiverEstimatedMaximumBitrate(remb) => {
                    conn.max_remb.set(remb.bitrate, jiffies());
                }
                Packet::ReceiverReport(rr) => {
                    let now = jiffies();
                    for report in &rr.reports {
                        if report.ssrc == track.ssrc {
                            track.handle_report(report, now);
                        }
                    }
                }
                Packet::SenderReport(sr) => {
                    let now = jiffies();
                    for report in &sr.reports {
                        if report.ssrc == track.ssrc {
                            track.handle_report(report, now);
                        }
                    }
                }
                Packet::TransportLayerNack(nack) => {
                    for pair in &nack.nacks {
                        for seqno in pair.sequence_numbers() {
                            let Some(length) = track.get_rtp(seqno, &mut packet_buffer)
                            else {
                                // Overwritten since; the subscriber
                                // will have to live with the loss.
                                continue;
                            };

                            let Ok(cached) = RtpPacket::decode(&packet_buffer[..length])
                            else {
                                continue;
                            };

                            match track.write_rtp(&cached).await {
                                Ok(size) => track.accumulate(size),
                                Err(e) if e.is_closed() => return,
                                Err(e) => log::trace!(
                                    "retransmission failed: conn={}, seqno={}, err={}",
                                    conn.id,
                                    seqno,
                                    e
                                ),
                            }
                        }
                    }
                }
                Packet::SourceDescription(_) => {}
            }
        }
    }
}

fn upstream(track: &DownTrack) -> Option<(Arc<UpTrack>, Arc<UpConnection>)> {
    let up_track = track.up()?;
    let up_conn = up_track.connection()?;
    Some((up_track, up_conn))
}

/// The 1 Hz downstream sender reports, carrying this side's clock and
/// the per-track totals.
async fn sender_loop(conn: Arc<DownConnection>) {
    let mut interval = tokio::time::interval(Duration::from_secs(1));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        interval.tick().await;

        match conn.send_reports().await {
            Ok(0) => {
                if conn.pc.state() == ConnectionState::Closed {
                    break;
                }
            }
            Ok(_) => {}
            Err(e) => {
                if e.is_closed() {
                    break;
                }

                log::warn!("down connection rtcp write failed: id={}, err={}", conn.id, e);
            }
        }
    }

    log::info!("down connection rtcp sender stop: id={}", conn.id);
}
