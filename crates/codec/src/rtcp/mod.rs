pub mod feedback;
pub mod remb;
pub mod report;
pub mod sdes;

use bytes::BytesMut;
use num_enum::TryFromPrimitive;

use self::{
    feedback::{FullIntraRequest, PictureLossIndication, TransportLayerNack},
    remb::ReceiverEstimatedMaximumBitrate,
    report::{ReceiverReport, SenderReport},
    sdes::SourceDescription,
};

use super::Error;

const VERSION_MASK: u8 = 0b1100_0000;
const PADDING_MASK: u8 = 0b0010_0000;
const COUNT_MASK: u8 = 0b0001_1111;

/// RTCP packet type.
#[repr(u8)]
#[derive(TryFromPrimitive, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    SR = 200,
    RR = 201,
    SDES = 202,
    BYE = 203,
    APP = 204,
    RTPFB = 205,
    PSFB = 206,
}

/// RTCP fixed header.
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |V=2|P|  C/FMT  |      PT       |             length            |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
///
/// The count field doubles as the feedback message type (FMT) for the
/// RTPFB/PSFB packet classes.
pub struct Header {
    pub padding: bool,
    pub count: u8,
    pub kind: PacketKind,
}

impl Header {
    /// Length of the whole packet this header starts, in bytes.
    ///
    /// # Test
    ///
    /// ```
    /// use sfu_server_codec::rtcp::Header;
    ///
    /// let buffer = [
    ///     0x80, 0xc8, 0x00, 0x06, 0x79, 0x26, 0x69, 0x55, 0xe8, 0xe2,
    ///     0xe2, 0x17, 0xd4, 0x2f, 0x05, 0x91, 0x36, 0x01, 0xb0, 0xaf,
    ///     0x34, 0x85, 0x78, 0x5e, 0x2d, 0xbc, 0x2a, 0x98,
    /// ];
    ///
    /// assert_eq!(Header::peek_len(&buffer).unwrap(), 28);
    /// ```
    pub fn peek_len(bytes: &[u8]) -> Result<usize, Error> {
        if bytes.len() < 4 {
            return Err(Error::InvalidInput);
        }

        let words = u16::from_be_bytes([bytes[2], bytes[3]]) as usize;
        Ok((words + 1) * 4)
    }

    pub(crate) fn encode(&self, bytes: &mut BytesMut, body_len: usize) {
        debug_assert!(body_len % 4 == 0);

        bytes.extend_from_slice(&[
            (2 << 6) | if self.padding { PADDING_MASK } else { 0 } | (self.count & COUNT_MASK),
            self.kind as u8,
        ]);

        bytes.extend_from_slice(&((body_len / 4) as u16).to_be_bytes());
    }
}

/// Feedback message types carried in the FMT field.
const RTPFB_NACK: u8 = 1;
const PSFB_PLI: u8 = 1;
const PSFB_FIR: u8 = 4;
const PSFB_AFB: u8 = 15;

/// A decoded RTCP packet.
///
/// Only the packet types the forwarding core reacts to get a variant;
/// everything else in a compound packet is skipped by the decoder.
pub enum Packet {
    SenderReport(SenderReport),
    ReceiverReport(ReceiverReport),
    SourceDescription(SourceDescription),
    PictureLossIndication(PictureLossIndication),
    FullIntraRequest(FullIntraRequest),
    TransportLayerNack(TransportLayerNack),
    ReceiverEstimatedMaximumBitrate(ReceiverEstimatedMaximumBitrate),
}

impl Packet {
    pub fn encode(&self, bytes: &mut BytesMut) {
        match self {
            Self::SenderReport(it) => it.encode(bytes),
            Self::ReceiverReport(it) => it.encode(bytes),
            Self::SourceDescription(it) => it.encode(bytes),
            Self::PictureLossIndication(it) => it.encode(bytes),
            Self::FullIntraRequest(it) => it.encode(bytes),
            Self::TransportLayerNack(it) => it.encode(bytes),
            Self::ReceiverEstimatedMaximumBitrate(it) => it.encode(bytes),
        }
    }
}

/// RTCP compound packet decoder.
///
/// # Test
///
/// ```
/// use sfu_server_codec::rtcp::{Decoder, Packet};
///
/// let buffer = [
///     // PLI, sender 0x1111, media 0x2222
///     0x81, 0xce, 0x00, 0x02, 0x00, 0x00, 0x11, 0x11, 0x00, 0x00,
///     0x22, 0x22,
///     // empty RR, sender 0x3333
///     0x80, 0xc9, 0x00, 0x01, 0x00, 0x00, 0x33, 0x33,
/// ];
///
/// let packets = Decoder::decode(&buffer).unwrap();
/// assert_eq!(packets.len(), 2);
///
/// let Packet::PictureLossIndication(pli) = &packets[0] else {
///     panic!()
/// };
///
/// assert_eq!(pli.media_ssrc, 0x2222);
/// ```
pub struct Decoder;

impl Decoder {
    pub fn decode(mut bytes: &[u8]) -> Result<Vec<Packet>, Error> {
        let mut packets = Vec::with_capacity(2);

        while !bytes.is_empty() {
            let size = Header::peek_len(bytes)?;
            if bytes.len() < size {
                return Err(Error::InvalidInput);
            }

            if (bytes[0] & VERSION_MASK) >> 6 != 2 {
                return Err(Error::InvalidInput);
            }

            let padding = (bytes[0] & PADDING_MASK) != 0;
            let count = bytes[0] & COUNT_MASK;
            let kind = bytes[1];

            let mut body = &bytes[4..size];
            bytes = &bytes[size..];

            // A packet type this side does not know (XR and friends)
            // is stepped over; the rest of the compound is still
            // wanted.
            let Ok(kind) = PacketKind::try_from(kind) else {
                continue;
            };

            if padding && !body.is_empty() {
                let pad = body[body.len() - 1] as usize;
                if pad == 0 || pad > body.len() {
                    return Err(Error::InvalidInput);
                }

                body = &body[..body.len() - pad];
            }

            let packet = match (kind, count) {
                (PacketKind::SR, count) => {
                    Some(Packet::SenderReport(SenderReport::decode(body, count)?))
                }
                (PacketKind::RR, count) => {
                    Some(Packet::ReceiverReport(ReceiverReport::decode(body, count)?))
                }
                (PacketKind::SDES, count) => Some(Packet::SourceDescription(
                    SourceDescription::decode(body, count)?,
                )),
                (PacketKind::PSFB, PSFB_PLI) => Some(Packet::PictureLossIndication(
                    PictureLossIndication::decode(body)?,
                )),
                (PacketKind::PSFB, PSFB_FIR) => {
                    Some(Packet::FullIntraRequest(FullIntraRequest::decode(body)?))
                }
                (PacketKind::PSFB, PSFB_AFB) => ReceiverEstimatedMaximumBitrate::decode(body)?
                    .map(Packet::ReceiverEstimatedMaximumBitrate),
                (PacketKind::RTPFB, RTPFB_NACK) => Some(Packet::TransportLayerNack(
                    TransportLayerNack::decode(body)?,
                )),
                _ => None,
            };

            if let Some(packet) = packet {
                packets.push(packet);
            }
        }

        Ok(packets)
    }
}
