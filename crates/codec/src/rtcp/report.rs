use bytes::{BufMut, BytesMut};

use super::{Header, PacketKind};
use crate::Error;

/// A reception report block, shared by SR and RR.
///
/// ```text
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                 SSRC_1 (SSRC of first source)                 |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// | fraction lost |       cumulative number of packets lost       |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |           extended highest sequence number received           |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                      interarrival jitter                      |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                         last SR (LSR)                         |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                   delay since last SR (DLSR)                  |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReceptionReport {
    pub ssrc: u32,
    pub fraction_lost: u8,
    /// 24 bits on the wire.
    pub total_lost: u32,
    pub last_sequence_number: u32,
    pub jitter: u32,
    pub last_sender_report: u32,
    pub delay: u32,
}

impl ReceptionReport {
    pub(crate) const SIZE: usize = 24;

    pub(crate) fn decode(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() < Self::SIZE {
            return Err(Error::InvalidInput);
        }

        Ok(Self {
            ssrc: u32::from_be_bytes(bytes[0..4].try_into()?),
            fraction_lost: bytes[4],
            total_lost: u32::from_be_bytes([0, bytes[5], bytes[6], bytes[7]]),
            last_sequence_number: u32::from_be_bytes(bytes[8..12].try_into()?),
            jitter: u32::from_be_bytes(bytes[12..16].try_into()?),
            last_sender_report: u32::from_be_bytes(bytes[16..20].try_into()?),
            delay: u32::from_be_bytes(bytes[20..24].try_into()?),
        })
    }

    pub(crate) fn encode(&self, bytes: &mut BytesMut) {
        bytes.put_u32(self.ssrc);
        bytes.put_u8(self.fraction_lost);

        let lost = self.total_lost.min(0x00ff_ffff);
        bytes.put_u8((lost >> 16) as u8);
        bytes.put_u16(lost as u16);

        bytes.put_u32(self.last_sequence_number);
        bytes.put_u32(self.jitter);
        bytes.put_u32(self.last_sender_report);
        bytes.put_u32(self.delay);
    }
}

/// # SR: Sender Report RTCP Packet
///
/// Carries the sender's wall-clock / RTP-clock correlation and its
/// lifetime packet and octet counts, followed by the same reception
/// report blocks an RR carries.
#[derive(Debug, Clone, Default)]
pub struct SenderReport {
    pub ssrc: u32,
    pub ntp_time: u64,
    pub rtp_time: u32,
    pub packet_count: u32,
    pub octet_count: u32,
    pub reports: Vec<ReceptionReport>,
}

impl SenderReport {
    pub(crate) fn decode(bytes: &[u8], count: u8) -> Result<Self, Error> {
        if bytes.len() < 24 {
            return Err(Error::InvalidInput);
        }

        let mut reports = Vec::with_capacity(count as usize);
        for i in 0..count as usize {
            let offset = 24 + i * ReceptionReport::SIZE;
            if bytes.len() < offset + ReceptionReport::SIZE {
                return Err(Error::InvalidInput);
            }

            reports.push(ReceptionReport::decode(&bytes[offset..])?);
        }

        Ok(Self {
            ssrc: u32::from_be_bytes(bytes[0..4].try_into()?),
            ntp_time: u64::from_be_bytes(bytes[4..12].try_into()?),
            rtp_time: u32::from_be_bytes(bytes[12..16].try_into()?),
            packet_count: u32::from_be_bytes(bytes[16..20].try_into()?),
            octet_count: u32::from_be_bytes(bytes[20..24].try_into()?),
            reports,
        })
    }

    /// # Test
    ///
    /// ```
    /// use bytes::BytesMut;
    /// use sfu_server_codec::rtcp::{Decoder, Packet, report::SenderReport};
    ///
    /// let mut bytes = BytesMut::new();
    ///
    /// SenderReport {
    ///     ssrc: 0x902f9e2e,
    ///     ntp_time: 0xda8bd1fcdddda05a,
    ///     rtp_time: 0xaaf4edd5,
    ///     packet_count: 1568,
    ///     octet_count: 2714,
    ///     reports: vec![],
    /// }
    /// .encode(&mut bytes);
    ///
    /// let packets = Decoder::decode(&bytes).unwrap();
    /// let Packet::SenderReport(sr) = &packets[0] else { panic!() };
    ///
    /// assert_eq!(sr.ssrc, 0x902f9e2e);
    /// assert_eq!(sr.rtp_time, 0xaaf4edd5);
    /// assert_eq!(sr.packet_count, 1568);
    /// ```
    pub fn encode(&self, bytes: &mut BytesMut) {
        Header {
            padding: false,
            count: self.reports.len() as u8,
            kind: PacketKind::SR,
        }
        .encode(bytes, 24 + self.reports.len() * ReceptionReport::SIZE);

        bytes.put_u32(self.ssrc);
        bytes.put_u64(self.ntp_time);
        bytes.put_u32(self.rtp_time);
        bytes.put_u32(self.packet_count);
        bytes.put_u32(self.octet_count);

        for report in &self.reports {
            report.encode(bytes);
        }
    }
}

/// # RR: Receiver Report RTCP Packet
///
/// The format of the receiver report packet is the same as that of the
/// SR packet except that the packet type field contains the constant
/// 201 and the five words of sender information are omitted.
#[derive(Debug, Clone, Default)]
pub struct ReceiverReport {
    pub ssrc: u32,
    pub reports: Vec<ReceptionReport>,
}

impl ReceiverReport {
    pub(crate) fn decode(bytes: &[u8], count: u8) -> Result<Self, Error> {
        if bytes.len() < 4 {
            return Err(Error::InvalidInput);
        }

        let mut reports = Vec::with_capacity(count as usize);
        for i in 0..count as usize {
            let offset = 4 + i * ReceptionReport::SIZE;
            if bytes.len() < offset + ReceptionReport::SIZE {
                return Err(Error::InvalidInput);
            }

            reports.push(ReceptionReport::decode(&bytes[offset..])?);
        }

        Ok(Self {
            ssrc: u32::from_be_bytes(bytes[0..4].try_into()?),
            reports,
        })
    }

    /// # Test
    ///
    /// ```
    /// use bytes::BytesMut;
    /// use sfu_server_codec::rtcp::{
    ///     Decoder, Packet,
    ///     report::{ReceiverReport, ReceptionReport},
    /// };
    ///
    /// let mut bytes = BytesMut::new();
    ///
    /// ReceiverReport {
    ///     ssrc: 0x902f9e2e,
    ///     reports: vec![ReceptionReport {
    ///         ssrc: 0xbc5e9a40,
    ///         fraction_lost: 81,
    ///         total_lost: 85,
    ///         last_sequence_number: 0x0004045d,
    ///         jitter: 17,
    ///         last_sender_report: 0x16232589,
    ///         delay: 65536,
    ///     }],
    /// }
    /// .encode(&mut bytes);
    ///
    /// let packets = Decoder::decode(&bytes).unwrap();
    /// let Packet::ReceiverReport(rr) = &packets[0] else { panic!() };
    ///
    /// assert_eq!(rr.reports[0].fraction_lost, 81);
    /// assert_eq!(rr.reports[0].delay, 65536);
    /// ```
    pub fn encode(&self, bytes: &mut BytesMut) {
        Header {
            padding: false,
            count: self.reports.len() as u8,
            kind: PacketKind::RR,
        }
        .encode(bytes, 4 + self.reports.len() * ReceptionReport::SIZE);

        bytes.put_u32(self.ssrc);

        for report in &self.reports {
            report.encode(bytes);
        }
    }
}
