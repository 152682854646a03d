use bytes::{BufMut, BytesMut};

use super::Error;

const VERSION_MASK: u8 = 0b1100_0000;
const PADDING_MASK: u8 = 0b0010_0000;
const EXTENSION_MASK: u8 = 0b0001_0000;
const CSRC_COUNT_MASK: u8 = 0b0000_1111;
const MARKER_MASK: u8 = 0b1000_0000;
const PAYLOAD_KIND_MASK: u8 = 0b0111_1111;

/// The RTP Packet
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |V=2|P|X|  CC   |M|     PT      |       sequence number         |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                           timestamp                           |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |           synchronization source (SSRC) identifier            |
/// +=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+
/// |            contributing source (CSRC) identifiers             |
/// |                             ....                              |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
///
/// The forwarding core only needs the fixed header fields it routes
/// and accounts on; CSRC lists, header extensions and padding are
/// skipped on decode and never produced on encode.
pub struct RtpPacket<'a> {
    pub marker: bool,
    pub payload_kind: u8,
    pub sequence_number: u16,
    pub timestamp: u32,
    pub ssrc: u32,
    pub payload: &'a [u8],
}

impl<'a> RtpPacket<'a> {
    /// # Test
    ///
    /// ```
    /// use sfu_server_codec::rtp::RtpPacket;
    ///
    /// let buffer = [
    ///     0x80, 0xe0, 0x69, 0x8f, 0xd9, 0xc2, 0x93, 0xda, 0x1c, 0x64,
    ///     0x27, 0x82, 0x98, 0x36, 0xbe, 0x88, 0x9e,
    /// ];
    ///
    /// let packet = RtpPacket::decode(&buffer).unwrap();
    ///
    /// assert_eq!(packet.marker, true);
    /// assert_eq!(packet.payload_kind, 96);
    /// assert_eq!(packet.sequence_number, 27023);
    /// assert_eq!(packet.timestamp, 3653407706);
    /// assert_eq!(packet.ssrc, 476325762);
    /// assert_eq!(packet.payload, &[0x98, 0x36, 0xbe, 0x88, 0x9e]);
    /// ```
    pub fn decode(bytes: &'a [u8]) -> Result<Self, Error> {
        if bytes.len() < 12 {
            return Err(Error::InvalidInput);
        }

        if (bytes[0] & VERSION_MASK) >> 6 != 2 {
            return Err(Error::InvalidInput);
        }

        let padding = (bytes[0] & PADDING_MASK) != 0;
        let extension = (bytes[0] & EXTENSION_MASK) != 0;
        let csrc_count = (bytes[0] & CSRC_COUNT_MASK) as usize;

        let mut offset = 12 + csrc_count * 4;
        if bytes.len() < offset {
            return Err(Error::InvalidInput);
        }

        if extension {
            if bytes.len() < offset + 4 {
                return Err(Error::InvalidInput);
            }

            let words = u16::from_be_bytes(bytes[offset + 2..offset + 4].try_into()?) as usize;
            offset += 4 + words * 4;
            if bytes.len() < offset {
                return Err(Error::InvalidInput);
            }
        }

        let mut end = bytes.len();
        if padding {
            let pad = bytes[end - 1] as usize;
            if pad == 0 || pad > end - offset {
                return Err(Error::InvalidInput);
            }

            end -= pad;
        }

        Ok(Self {
            marker: (bytes[1] & MARKER_MASK) != 0,
            payload_kind: bytes[1] & PAYLOAD_KIND_MASK,
            sequence_number: u16::from_be_bytes(bytes[2..4].try_into()?),
            timestamp: u32::from_be_bytes(bytes[4..8].try_into()?),
            ssrc: u32::from_be_bytes(bytes[8..12].try_into()?),
            payload: &bytes[offset..end],
        })
    }

    /// # Test
    ///
    /// ```
    /// use bytes::BytesMut;
    /// use sfu_server_codec::rtp::RtpPacket;
    ///
    /// let mut bytes = BytesMut::with_capacity(1500);
    ///
    /// RtpPacket {
    ///     marker: false,
    ///     payload_kind: 111,
    ///     sequence_number: 100,
    ///     timestamp: 960,
    ///     ssrc: 0x1234,
    ///     payload: &[0xff, 0xfe],
    /// }
    /// .encode(&mut bytes);
    ///
    /// let packet = RtpPacket::decode(&bytes).unwrap();
    ///
    /// assert_eq!(packet.payload_kind, 111);
    /// assert_eq!(packet.sequence_number, 100);
    /// assert_eq!(packet.payload, &[0xff, 0xfe]);
    /// ```
    pub fn encode(&self, bytes: &mut BytesMut) {
        bytes.put_u8(2 << 6);
        bytes.put_u8(if self.marker { MARKER_MASK } else { 0 } | self.payload_kind);
        bytes.put_u16(self.sequence_number);
        bytes.put_u32(self.timestamp);
        bytes.put_u32(self.ssrc);
        bytes.extend_from_slice(self.payload);
    }
}
