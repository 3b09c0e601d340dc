//! Datagram packet layout.
//!
//! ## Wire format (all integers big-endian)
//!
//! **Whole-frame packet** (5 byte header + payload), used when a frame fits
//! in one datagram:
//! ```text
//! type:           u8   (1)  = 0x01
//! length:         u32  (4)
//! payload:        [u8] (length)
//! ```
//!
//! **Chunk packet** (9 byte header + payload):
//! ```text
//! type:           u8   (1)  = 0x02
//! frame_id:       u16  (2)
//! chunk_id:       u16  (2)
//! total_chunks:   u16  (2)
//! payload_length: u16  (2)
//! payload:        [u8] (payload_length)
//! ```

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::LinkError;

/// Type byte of a whole-frame packet.
pub const PACKET_WHOLE: u8 = 0x01;
/// Type byte of a chunk packet.
pub const PACKET_CHUNK: u8 = 0x02;

/// Header size of a whole-frame packet.
pub const WHOLE_HEADER_SIZE: usize = 5;

/// Largest UDP payload an IPv4 datagram can carry.
pub const MAX_DATAGRAM: usize = 65_507;

/// Largest chunk payload that still fits [`MAX_DATAGRAM`]. The whole-frame
/// header is smaller, so whole-frame packets fit as well.
pub const MAX_CHUNK_PAYLOAD: usize = MAX_DATAGRAM - ChunkHeader::SIZE;

// ── ChunkHeader ──────────────────────────────────────────────────

/// Per-chunk metadata prepended to each chunk datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    pub frame_id: u16,
    pub chunk_id: u16,
    pub total_chunks: u16,
    pub payload_length: u16,
}

impl ChunkHeader {
    /// Encoded size on the wire, type byte included.
    pub const SIZE: usize = 9;

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0] = PACKET_CHUNK;
        buf[1..3].copy_from_slice(&self.frame_id.to_be_bytes());
        buf[3..5].copy_from_slice(&self.chunk_id.to_be_bytes());
        buf[5..7].copy_from_slice(&self.total_chunks.to_be_bytes());
        buf[7..9].copy_from_slice(&self.payload_length.to_be_bytes());
        buf
    }

    /// Parse and validate a chunk header.
    pub fn decode(data: &[u8]) -> Result<Self, LinkError> {
        let Some(raw) = data.get(..Self::SIZE) else {
            return Err(LinkError::MalformedPacket("chunk header too short"));
        };
        if raw[0] != PACKET_CHUNK {
            return Err(LinkError::MalformedPacket("not a chunk packet"));
        }
        let header = Self {
            frame_id: u16::from_be_bytes([raw[1], raw[2]]),
            chunk_id: u16::from_be_bytes([raw[3], raw[4]]),
            total_chunks: u16::from_be_bytes([raw[5], raw[6]]),
            payload_length: u16::from_be_bytes([raw[7], raw[8]]),
        };
        header.validate()?;
        Ok(header)
    }

    /// Reject headers that cannot belong to any frame.
    pub fn validate(&self) -> Result<(), LinkError> {
        if self.total_chunks == 0 {
            return Err(LinkError::MalformedPacket("total_chunks is zero"));
        }
        if self.chunk_id >= self.total_chunks {
            return Err(LinkError::MalformedPacket("chunk_id out of range"));
        }
        Ok(())
    }
}

// ── DatagramPacket ───────────────────────────────────────────────

/// A parsed frame datagram borrowing from the receive buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatagramPacket<'a> {
    Whole(&'a [u8]),
    Chunk {
        header: ChunkHeader,
        payload: &'a [u8],
    },
}

impl<'a> DatagramPacket<'a> {
    pub fn parse(datagram: &'a [u8]) -> Result<Self, LinkError> {
        match datagram.first() {
            Some(&PACKET_WHOLE) => {
                let Some(len) = datagram.get(1..WHOLE_HEADER_SIZE) else {
                    return Err(LinkError::MalformedPacket("whole-frame header too short"));
                };
                let len = u32::from_be_bytes([len[0], len[1], len[2], len[3]]) as usize;
                let payload = &datagram[WHOLE_HEADER_SIZE..];
                if payload.len() != len || len == 0 {
                    return Err(LinkError::MalformedPacket("whole-frame length mismatch"));
                }
                Ok(Self::Whole(payload))
            }
            Some(&PACKET_CHUNK) => {
                let header = ChunkHeader::decode(datagram)?;
                let end = ChunkHeader::SIZE + header.payload_length as usize;
                let Some(payload) = datagram.get(ChunkHeader::SIZE..end) else {
                    return Err(LinkError::MalformedPacket("chunk payload truncated"));
                };
                Ok(Self::Chunk { header, payload })
            }
            Some(_) => Err(LinkError::MalformedPacket("unknown packet type")),
            None => Err(LinkError::MalformedPacket("empty datagram")),
        }
    }
}

// ── Splitting ────────────────────────────────────────────────────

/// Split one frame into ready-to-send datagrams.
///
/// Payloads that fit `chunk_payload` go out as a single whole-frame packet
/// when `single_packet` is set.
pub fn split_frame(
    frame_id: u16,
    payload: &[u8],
    chunk_payload: usize,
    single_packet: bool,
) -> Result<Vec<Bytes>, LinkError> {
    let chunk_payload = chunk_payload.clamp(1, MAX_CHUNK_PAYLOAD);
    if payload.is_empty() {
        return Err(LinkError::MalformedPacket("empty frame"));
    }

    if single_packet && payload.len() <= chunk_payload {
        let mut pkt = BytesMut::with_capacity(WHOLE_HEADER_SIZE + payload.len());
        pkt.put_u8(PACKET_WHOLE);
        pkt.put_u32(payload.len() as u32);
        pkt.put_slice(payload);
        return Ok(vec![pkt.freeze()]);
    }

    let total = payload.len().div_ceil(chunk_payload);
    let total_chunks = u16::try_from(total).map_err(|_| LinkError::FrameTooLarge {
        size: payload.len(),
        max: chunk_payload * u16::MAX as usize,
    })?;

    let packets = payload
        .chunks(chunk_payload)
        .enumerate()
        .map(|(idx, data)| {
            let header = ChunkHeader {
                frame_id,
                chunk_id: idx as u16,
                total_chunks,
                payload_length: data.len() as u16,
            };
            let mut pkt = BytesMut::with_capacity(ChunkHeader::SIZE + data.len());
            pkt.put_slice(&header.encode());
            pkt.put_slice(data);
            pkt.freeze()
        })
        .collect();
    Ok(packets)
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_header_layout() {
        let header = ChunkHeader {
            frame_id: 0x0102,
            chunk_id: 3,
            total_chunks: 5,
            payload_length: 0x0400,
        };
        assert_eq!(header.encode(), [0x02, 0x01, 0x02, 0, 3, 0, 5, 0x04, 0x00]);
        assert_eq!(ChunkHeader::decode(&header.encode()).unwrap(), header);
    }

    #[test]
    fn chunk_header_too_short() {
        assert!(ChunkHeader::decode(&[0x02, 0, 1]).is_err());
    }

    #[test]
    fn chunk_id_out_of_range_is_malformed() {
        let raw = ChunkHeader {
            frame_id: 1,
            chunk_id: 5,
            total_chunks: 5,
            payload_length: 0,
        }
        .encode();
        assert!(matches!(
            ChunkHeader::decode(&raw),
            Err(LinkError::MalformedPacket(_))
        ));
    }

    #[test]
    fn zero_total_is_malformed() {
        let raw = [0x02, 0, 1, 0, 0, 0, 0, 0, 0];
        assert!(ChunkHeader::decode(&raw).is_err());
    }

    #[test]
    fn truncated_chunk_payload_is_malformed() {
        let mut raw = ChunkHeader {
            frame_id: 1,
            chunk_id: 0,
            total_chunks: 1,
            payload_length: 10,
        }
        .encode()
        .to_vec();
        raw.extend_from_slice(&[0u8; 4]);
        assert!(DatagramPacket::parse(&raw).is_err());
    }

    #[test]
    fn whole_frame_length_must_match() {
        assert_eq!(
            DatagramPacket::parse(&[0x01, 0, 0, 0, 2, 0xAA, 0xBB]).unwrap(),
            DatagramPacket::Whole(&[0xAA, 0xBB])
        );
        assert!(DatagramPacket::parse(&[0x01, 0, 0, 0, 3, 0xAA, 0xBB]).is_err());
        assert!(DatagramPacket::parse(&[0x01, 0, 0]).is_err());
        assert!(DatagramPacket::parse(&[0x7F, 1, 2]).is_err());
        assert!(DatagramPacket::parse(&[]).is_err());
    }

    #[test]
    fn split_uses_whole_packet_when_it_fits() {
        let packets = split_frame(9, &[1, 2, 3], 16, true).unwrap();
        assert_eq!(packets.len(), 1);
        assert_eq!(&packets[0][..], &[0x01, 0, 0, 0, 3, 1, 2, 3]);
    }

    #[test]
    fn split_chunks_cover_payload_in_order() {
        let payload: Vec<u8> = (0..=255u8).cycle().take(1000).collect();
        let packets = split_frame(7, &payload, 300, true).unwrap();
        assert_eq!(packets.len(), 4);

        let mut rebuilt = Vec::new();
        for (i, pkt) in packets.iter().enumerate() {
            match DatagramPacket::parse(pkt).unwrap() {
                DatagramPacket::Chunk { header, payload } => {
                    assert_eq!(header.frame_id, 7);
                    assert_eq!(header.chunk_id as usize, i);
                    assert_eq!(header.total_chunks, 4);
                    rebuilt.extend_from_slice(payload);
                }
                DatagramPacket::Whole(_) => panic!("expected chunk"),
            }
        }
        assert_eq!(rebuilt, payload);
    }

    #[test]
    fn split_without_single_packet_always_chunks() {
        let packets = split_frame(1, &[9; 10], 100, false).unwrap();
        assert!(matches!(
            DatagramPacket::parse(&packets[0]).unwrap(),
            DatagramPacket::Chunk { .. }
        ));
    }

    #[test]
    fn oversized_chunk_setting_stays_within_one_datagram() {
        let payload = vec![0x5Au8; 200_000];
        let packets = split_frame(3, &payload, usize::MAX, true).unwrap();
        assert_eq!(packets.len(), payload.len().div_ceil(MAX_CHUNK_PAYLOAD));
        assert!(packets.iter().all(|p| p.len() <= MAX_DATAGRAM));
        assert_eq!(packets[0].len(), MAX_DATAGRAM);

        let whole = split_frame(4, &payload[..MAX_CHUNK_PAYLOAD], u16::MAX as usize, true).unwrap();
        assert_eq!(whole.len(), 1);
        assert_eq!(whole[0].len(), WHOLE_HEADER_SIZE + MAX_CHUNK_PAYLOAD);
        assert!(whole[0].len() <= MAX_DATAGRAM);
    }

    #[test]
    fn split_rejects_too_many_chunks() {
        let payload = vec![0u8; u16::MAX as usize + 1];
        assert!(matches!(
            split_frame(0, &payload, 1, false),
            Err(LinkError::FrameTooLarge { .. })
        ));
    }
}
