use std::sync::Arc;

use codec::rtp::RtpPacket;
use service::time::jiffies_to_duration;
use tokio::sync::mpsc::{self, error::TrySendError};

use super::{PACKET_BUFFER_SIZE, down::DownTrack, up::UpTrack};

/// Capacity of a subscriber's forwarding queue. A subscriber that
/// falls further behind than this loses packets; ingest is never
/// back-pressured.
const CHANNEL_SIZE: usize = 32;

/// One packet descriptor handed from the ingest reader to each
/// subscriber's writer. The payload stays in the track cache; workers
/// fetch it by slot and tolerate it having been overwritten meanwhile.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Forward {
    pub seqno: u16,
    pub index: u16,
    /// Soft inter-send pacing, in jiffies.
    pub delay: u64,
    pub is_video: bool,
    pub marker: bool,
}

pub(crate) enum Command {
    Add(Arc<DownTrack>),
    Remove(u64),
}

struct Writer {
    id: u64,
    sender: mpsc::Sender<Forward>,
    /// Resuming a video frame mid-way after a drop corrupts the rest
    /// of it; once a packet is lost to a full queue the writer skips
    /// until it has dropped through a marker.
    dropping: bool,
}

/// The per-track fan-out: one worker per subscribed down track, owned
/// and driven by the ingest reader. Dropping the pool closes every
/// queue; workers drain what is left and stop.
#[derive(Default)]
pub(crate) struct WriterPool {
    writers: Vec<Writer>,
}

impl WriterPool {
    pub fn apply(&mut self, command: Command, track: &Arc<UpTrack>) {
        match command {
            Command::Add(down) => {
                if self.writers.iter().any(|it| it.id == down.id()) {
                    return;
                }

                let (sender, receiver) = mpsc::channel(CHANNEL_SIZE);
                self.writers.push(Writer {
                    id: down.id(),
                    sender,
                    dropping: false,
                });

                tokio::spawn(writer_loop(track.clone(), down, receiver));
            }
            Command::Remove(id) => {
                self.writers.retain(|it| it.id != id);
            }
        }
    }

    pub fn forward(&mut self, forward: Forward) {
        self.writers.retain_mut(|writer| {
            if writer.dropping {
                if forward.marker {
                    writer.dropping = false;
                }

                return true;
            }

            match writer.sender.try_send(forward) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    if forward.is_video && !forward.marker {
                        writer.dropping = true;
                    }

                    true
                }
                Err(TrySendError::Closed(_)) => false,
            }
        });
    }
}

async fn writer_loop(
    track: Arc<UpTrack>,
    down: Arc<DownTrack>,
    mut receiver: mpsc::Receiver<Forward>,
) {
    let mut buffer = vec![0u8; PACKET_BUFFER_SIZE];

    while let Some(forward) = receiver.recv().await {
        let Some(length) = track.cache().get_at(forward.index, forward.seqno, &mut buffer) else {
            continue;
        };

        // Validated once on ingest, but the slot may have been
        // clobbered since the seqno check.
        let Ok(packet) = RtpPacket::decode(&buffer[..length]) else {
            continue;
        };

        match down.write_rtp(&packet).await {
            Ok(size) => down.accumulate(size),
            Err(e) if e.is_closed() => break,
            Err(e) => {
                log::warn!("down track write failed: id={}, err={}", down.id(), e);
                continue;
            }
        }

        if forward.delay > 0 {
            tokio::time::sleep(jiffies_to_duration(forward.delay)).await;
        }
    }
}
