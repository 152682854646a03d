use bytes::{BufMut, BytesMut};

use super::{Header, PacketKind};
use crate::Error;

const ITEM_END: u8 = 0;
const ITEM_CNAME: u8 = 1;

/// One source description chunk. Only the CNAME item is meaningful to
/// the forwarding core; other item types are skipped on decode.
#[derive(Debug, Clone, Default)]
pub struct Chunk {
    pub ssrc: u32,
    pub cname: Option<String>,
}

/// # SDES: Source Description RTCP Packet
///
/// ```text
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                          SSRC/CSRC_1                          |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |    CNAME=1    |     length    | user and domain name        ...
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
///
/// Each chunk is a list of items terminated by a zero octet and padded
/// to the next 32-bit boundary.
#[derive(Debug, Clone, Default)]
pub struct SourceDescription {
    pub chunks: Vec<Chunk>,
}

impl SourceDescription {
    pub fn cname(ssrc: u32, cname: &str) -> Self {
        Self {
            chunks: vec![Chunk {
                ssrc,
                cname: Some(cname.to_string()),
            }],
        }
    }

    pub(crate) fn decode(bytes: &[u8], count: u8) -> Result<Self, Error> {
        let mut chunks = Vec::with_capacity(count as usize);
        let mut offset = 0;

        for _ in 0..count {
            if bytes.len() < offset + 4 {
                return Err(Error::InvalidInput);
            }

            let mut chunk = Chunk {
                ssrc: u32::from_be_bytes(bytes[offset..offset + 4].try_into()?),
                cname: None,
            };

            offset += 4;
            loop {
                if bytes.len() < offset + 1 {
                    return Err(Error::InvalidInput);
                }

                let kind = bytes[offset];
                if kind == ITEM_END {
                    offset += 1;
                    break;
                }

                if bytes.len() < offset + 2 {
                    return Err(Error::InvalidInput);
                }

                let size = bytes[offset + 1] as usize;
                if bytes.len() < offset + 2 + size {
                    return Err(Error::InvalidInput);
                }

                if kind == ITEM_CNAME {
                    let text = std::str::from_utf8(&bytes[offset + 2..offset + 2 + size])?;
                    chunk.cname = Some(text.to_string());
                }

                offset += 2 + size;
            }

            // Chunks align on 32-bit boundaries.
            offset = (offset + 3) & !3;
            chunks.push(chunk);
        }

        Ok(Self { chunks })
    }

    /// # Test
    ///
    /// ```
    /// use bytes::BytesMut;
    /// use sfu_server_codec::rtcp::{Decoder, Packet, sdes::SourceDescription};
    ///
    /// let mut bytes = BytesMut::new();
    /// SourceDescription::cname(0x2222, "user@host").encode(&mut bytes);
    ///
    /// let packets = Decoder::decode(&bytes).unwrap();
    /// let Packet::SourceDescription(sdes) = &packets[0] else { panic!() };
    ///
    /// assert_eq!(sdes.chunks[0].ssrc, 0x2222);
    /// assert_eq!(sdes.chunks[0].cname.as_deref(), Some("user@host"));
    /// ```
    pub fn encode(&self, bytes: &mut BytesMut) {
        let mut body = 0;
        for chunk in &self.chunks {
            let items = chunk.cname.as_ref().map(|it| 2 + it.len()).unwrap_or(0);
            body += 4 + (items + 1 + 3) / 4 * 4;
        }

        Header {
            padding: false,
            count: self.chunks.len() as u8,
            kind: PacketKind::SDES,
        }
        .encode(bytes, body);

        for chunk in &self.chunks {
            bytes.put_u32(chunk.ssrc);

            let mut size = 0;
            if let Some(cname) = &chunk.cname {
                bytes.put_u8(ITEM_CNAME);
                bytes.put_u8(cname.len() as u8);
                bytes.extend_from_slice(cname.as_bytes());
                size = 2 + cname.len();
            }

            // Terminator plus alignment padding.
            for _ in 0..(size + 1 + 3) / 4 * 4 - size {
                bytes.put_u8(ITEM_END);
            }
        }
    }
}
