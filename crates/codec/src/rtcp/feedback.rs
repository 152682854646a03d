use bytes::{BufMut, BytesMut};

use super::{Header, PacketKind, PSFB_FIR, PSFB_PLI, RTPFB_NACK};
use crate::Error;

/// # PLI: Picture Loss Indication
///
/// Informs the encoder side that some amount of encoded video was
/// lost; the sender is expected to answer with a keyframe. The FCI is
/// empty, the packet is just the two feedback SSRC words.
#[derive(Debug, Clone, Copy, Default)]
pub struct PictureLossIndication {
    pub sender_ssrc: u32,
    pub media_ssrc: u32,
}

impl PictureLossIndication {
    pub(crate) fn decode(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() < 8 {
            return Err(Error::InvalidInput);
        }

        Ok(Self {
            sender_ssrc: u32::from_be_bytes(bytes[0..4].try_into()?),
            media_ssrc: u32::from_be_bytes(bytes[4..8].try_into()?),
        })
    }

    /// # Test
    ///
    /// ```
    /// use bytes::BytesMut;
    /// use sfu_server_codec::rtcp::feedback::PictureLossIndication;
    ///
    /// let mut bytes = BytesMut::new();
    ///
    /// PictureLossIndication {
    ///     sender_ssrc: 0x1111,
    ///     media_ssrc: 0x2222,
    /// }
    /// .encode(&mut bytes);
    ///
    /// assert_eq!(
    ///     &bytes[..],
    ///     &[
    ///         0x81, 0xce, 0x00, 0x02, 0x00, 0x00, 0x11, 0x11, 0x00, 0x00,
    ///         0x22, 0x22,
    ///     ]
    /// );
    /// ```
    pub fn encode(&self, bytes: &mut BytesMut) {
        Header {
            padding: false,
            count: PSFB_PLI,
            kind: PacketKind::PSFB,
        }
        .encode(bytes, 8);

        bytes.put_u32(self.sender_ssrc);
        bytes.put_u32(self.media_ssrc);
    }
}

/// One FIR request entry: the target stream and the 8-bit command
/// sequence number that deduplicates retransmitted requests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FirEntry {
    pub ssrc: u32,
    pub sequence_number: u8,
}

/// # FIR: Full Intra Request
///
/// ```text
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                              SSRC                             |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// | Seq nr.       |    Reserved                                   |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
///
/// Like PLI a request for a keyframe, but addressed per SSRC with a
/// sequence number so a repeated (retransmitted) request is told apart
/// from a new one.
#[derive(Debug, Clone, Default)]
pub struct FullIntraRequest {
    pub sender_ssrc: u32,
    pub media_ssrc: u32,
    pub fir: Vec<FirEntry>,
}

impl FullIntraRequest {
    pub(crate) fn decode(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() < 8 || (bytes.len() - 8) % 8 != 0 {
            return Err(Error::InvalidInput);
        }

        let mut fir = Vec::with_capacity((bytes.len() - 8) / 8);
        for chunk in bytes[8..].chunks_exact(8) {
            fir.push(FirEntry {
                ssrc: u32::from_be_bytes(chunk[0..4].try_into()?),
                sequence_number: chunk[4],
            });
        }

        Ok(Self {
            sender_ssrc: u32::from_be_bytes(bytes[0..4].try_into()?),
            media_ssrc: u32::from_be_bytes(bytes[4..8].try_into()?),
            fir,
        })
    }

    pub fn encode(&self, bytes: &mut BytesMut) {
        Header {
            padding: false,
            count: PSFB_FIR,
            kind: PacketKind::PSFB,
        }
        .encode(bytes, 8 + self.fir.len() * 8);

        bytes.put_u32(self.sender_ssrc);
        bytes.put_u32(self.media_ssrc);

        for entry in &self.fir {
            bytes.put_u32(entry.ssrc);
            bytes.put_u8(entry.sequence_number);
            bytes.put_u8(0);
            bytes.put_u16(0);
        }
    }
}

/// A single NACK pair: the first lost sequence number and a bitmap of
/// the 16 following ones.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NackPair {
    pub packet_id: u16,
    pub lost_packets: u16,
}

impl NackPair {
    /// Number of sequence numbers this pair requests.
    pub fn lost_count(&self) -> u32 {
        1 + self.lost_packets.count_ones()
    }

    /// Every sequence number this pair requests, in order.
    ///
    /// # Test
    ///
    /// ```
    /// use sfu_server_codec::rtcp::feedback::NackPair;
    ///
    /// let pair = NackPair {
    ///     packet_id: 115,
    ///     lost_packets: 0b11,
    /// };
    ///
    /// let seqnos: Vec<u16> = pair.sequence_numbers().collect();
    /// assert_eq!(seqnos, vec![115, 116, 117]);
    /// ```
    pub fn sequence_numbers(&self) -> impl Iterator<Item = u16> {
        let pivot = self.packet_id;
        let bitmap = self.lost_packets;

        std::iter::once(pivot).chain((0..16u16).filter_map(move |i| {
            if bitmap & (1 << i) != 0 {
                Some(pivot.wrapping_add(i + 1))
            } else {
                None
            }
        }))
    }
}

/// # Generic NACK (transport layer feedback)
///
/// Requests retransmission of the listed sequence numbers, sixteen-plus
/// one per pair.
#[derive(Debug, Clone, Default)]
pub struct TransportLayerNack {
    pub sender_ssrc: u32,
    pub media_ssrc: u32,
    pub nacks: Vec<NackPair>,
}

impl TransportLayerNack {
    pub(crate) fn decode(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() < 8 || (bytes.len() - 8) % 4 != 0 {
            return Err(Error::InvalidInput);
        }

        let mut nacks = Vec::with_capacity((bytes.len() - 8) / 4);
        for chunk in bytes[8..].chunks_exact(4) {
            nacks.push(NackPair {
                packet_id: u16::from_be_bytes(chunk[0..2].try_into()?),
                lost_packets: u16::from_be_bytes(chunk[2..4].try_into()?),
            });
        }

        Ok(Self {
            sender_ssrc: u32::from_be_bytes(bytes[0..4].try_into()?),
            media_ssrc: u32::from_be_bytes(bytes[4..8].try_into()?),
            nacks,
        })
    }

    /// # Test
    ///
    /// ```
    /// use bytes::BytesMut;
    /// use sfu_server_codec::rtcp::{
    ///     Decoder, Packet,
    ///     feedback::{NackPair, TransportLayerNack},
    /// };
    ///
    /// let mut bytes = BytesMut::new();
    ///
    /// TransportLayerNack {
    ///     sender_ssrc: 0x1111,
    ///     media_ssrc: 0x2222,
    ///     nacks: vec![NackPair {
    ///         packet_id: 115,
    ///         lost_packets: 0b11,
    ///     }],
    /// }
    /// .encode(&mut bytes);
    ///
    /// let packets = Decoder::decode(&bytes).unwrap();
    /// let Packet::TransportLayerNack(nack) = &packets[0] else {
    ///     panic!()
    /// };
    ///
    /// assert_eq!(nack.nacks[0].packet_id, 115);
    /// assert_eq!(nack.nacks[0].lost_count(), 3);
    /// ```
    pub fn encode(&self, bytes: &mut BytesMut) {
        Header {
            padding: false,
            count: RTPFB_NACK,
            kind: PacketKind::RTPFB,
        }
        .encode(bytes, 8 + self.nacks.len() * 4);

        bytes.put_u32(self.sender_ssrc);
        bytes.put_u32(self.media_ssrc);

        for pair in &self.nacks {
            bytes.put_u16(pair.packet_id);
            bytes.put_u16(pair.lost_packets);
        }
    }
}
