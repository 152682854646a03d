use bytes::{BufMut, BytesMut};

use super::{Header, PacketKind, PSFB_AFB};
use crate::Error;

/// "REMB" in the application layer feedback identifier word.
const UNIQUE_IDENTIFIER: [u8; 4] = *b"REMB";

/// # REMB: Receiver Estimated Maximum Bitrate
///
/// ```text
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |  Unique identifier 'R' 'E' 'M' 'B'                            |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |  Num SSRC     | BR Exp    |  BR Mantissa                      |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |   SSRC feedback                                               |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
///
/// Application layer feedback (FMT 15) carrying the receiver's total
/// bitrate estimate as a 6-bit exponent and 18-bit mantissa, plus the
/// SSRCs the estimate covers.
#[derive(Debug, Clone, Default)]
pub struct ReceiverEstimatedMaximumBitrate {
    pub sender_ssrc: u32,
    pub bitrate: u64,
    pub ssrcs: Vec<u32>,
}

impl ReceiverEstimatedMaximumBitrate {
    /// An AFB packet that does not carry the REMB identifier decodes to
    /// `None` rather than an error: other application feedback may
    /// legitimately share FMT 15.
    pub(crate) fn decode(bytes: &[u8]) -> Result<Option<Self>, Error> {
        if bytes.len() < 16 {
            return Err(Error::InvalidInput);
        }

        if bytes[8..12] != UNIQUE_IDENTIFIER {
            return Ok(None);
        }

        let count = bytes[12] as usize;
        let exponent = bytes[13] >> 2;
        let mantissa = u32::from_be_bytes([0, bytes[13] & 0b11, bytes[14], bytes[15]]) as u64;

        if bytes.len() < 16 + count * 4 {
            return Err(Error::InvalidInput);
        }

        let mut ssrcs = Vec::with_capacity(count);
        for chunk in bytes[16..16 + count * 4].chunks_exact(4) {
            ssrcs.push(u32::from_be_bytes(chunk.try_into()?));
        }

        Ok(Some(Self {
            sender_ssrc: u32::from_be_bytes(bytes[0..4].try_into()?),
            bitrate: mantissa << exponent,
            ssrcs,
        }))
    }

    /// # Test
    ///
    /// ```
    /// use bytes::BytesMut;
    /// use sfu_server_codec::rtcp::{
    ///     Decoder, Packet, remb::ReceiverEstimatedMaximumBitrate,
    /// };
    ///
    /// let mut bytes = BytesMut::new();
    ///
    /// ReceiverEstimatedMaximumBitrate {
    ///     sender_ssrc: 1,
    ///     bitrate: 8927168,
    ///     ssrcs: vec![0x2222],
    /// }
    /// .encode(&mut bytes);
    ///
    /// let packets = Decoder::decode(&bytes).unwrap();
    /// let Packet::ReceiverEstimatedMaximumBitrate(remb) = &packets[0]
    /// else {
    ///     panic!()
    /// };
    ///
    /// assert_eq!(remb.bitrate, 8927168);
    /// assert_eq!(remb.ssrcs, vec![0x2222]);
    /// ```
    pub fn encode(&self, bytes: &mut BytesMut) {
        Header {
            padding: false,
            count: PSFB_AFB,
            kind: PacketKind::PSFB,
        }
        .encode(bytes, 16 + self.ssrcs.len() * 4);

        bytes.put_u32(self.sender_ssrc);
        bytes.put_u32(0);
        bytes.extend_from_slice(&UNIQUE_IDENTIFIER);

        let mut exponent = 0u8;
        let mut mantissa = self.bitrate;
        while mantissa >= (1 << 18) {
            mantissa >>= 1;
            exponent += 1;
        }

        bytes.put_u8(self.ssrcs.len() as u8);
        bytes.put_u8((exponent << 2) | ((mantissa >> 16) as u8 & 0b11));
        bytes.put_u16(mantissa as u16);

        for ssrc in &self.ssrcs {
            bytes.put_u32(*ssrc);
        }
    }
}
