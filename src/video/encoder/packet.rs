//! Encoded packet message
//!
//! One packet is published per encoded frame. Its byte encoding is a simple
//! little-endian record so subscribers in other processes can decode it.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::config::CodecVariant;
use crate::error::{EncoderError, Result};
use crate::video::device::BufferFlags;
use crate::video::frame::FrameExtra;

const PACKET_VERSION: u8 = 1;
/// version + frame_id + sof + eof + type + encode_id + segment_num + segment_id
/// + flags + len + has_header
const FIXED_LEN: usize = 1 + 4 + 8 + 8 + 1 + 4 + 4 + 4 + 4 + 4 + 1;

/// Bitstream kind carried by a packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodeType {
    /// Full-resolution HEVC stream
    FullHevc,
    /// Small H.264 preview stream
    QcameraH264,
}

impl EncodeType {
    fn to_byte(self) -> u8 {
        match self {
            EncodeType::FullHevc => 0,
            EncodeType::QcameraH264 => 1,
        }
    }

    fn from_byte(value: u8) -> Result<Self> {
        match value {
            0 => Ok(EncodeType::FullHevc),
            1 => Ok(EncodeType::QcameraH264),
            other => Err(EncoderError::Decode(format!("unknown encode type {}", other))),
        }
    }
}

impl From<CodecVariant> for EncodeType {
    fn from(codec: CodecVariant) -> Self {
        match codec {
            CodecVariant::Hevc => EncodeType::FullHevc,
            CodecVariant::H264 => EncodeType::QcameraH264,
        }
    }
}

/// One encoded frame with its capture metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedPacket {
    pub frame_id: u32,
    pub timestamp_sof: u64,
    pub timestamp_eof: u64,
    pub encode_type: EncodeType,
    /// Zero-based index of the frame within the segment
    pub encode_id: u32,
    pub segment_num: u32,
    pub segment_id: u32,
    pub flags: BufferFlags,
    pub len: u32,
    pub data: Bytes,
    /// Codec configuration, present on keyframes only
    pub header: Option<Bytes>,
}

impl EncodedPacket {
    pub fn new(
        extra: &FrameExtra,
        encode_type: EncodeType,
        encode_id: u32,
        segment_num: u32,
        flags: BufferFlags,
        data: Bytes,
        header: Option<Bytes>,
    ) -> Self {
        Self {
            frame_id: extra.frame_id,
            timestamp_sof: extra.timestamp_sof,
            timestamp_eof: extra.timestamp_eof,
            encode_type,
            encode_id,
            segment_num,
            segment_id: encode_id,
            flags,
            len: data.len() as u32,
            data,
            header,
        }
    }

    pub fn is_keyframe(&self) -> bool {
        self.flags.is_keyframe()
    }

    /// Serialize for publication
    pub fn encode(&self) -> Bytes {
        let header_len = self.header.as_ref().map_or(0, |h| 4 + h.len());
        let mut buf = BytesMut::with_capacity(FIXED_LEN + 4 + self.data.len() + header_len);
        buf.put_u8(PACKET_VERSION);
        buf.put_u32_le(self.frame_id);
        buf.put_u64_le(self.timestamp_sof);
        buf.put_u64_le(self.timestamp_eof);
        buf.put_u8(self.encode_type.to_byte());
        buf.put_u32_le(self.encode_id);
        buf.put_u32_le(self.segment_num);
        buf.put_u32_le(self.segment_id);
        buf.put_u32_le(self.flags.bits());
        buf.put_u32_le(self.len);
        buf.put_u32_le(self.data.len() as u32);
        buf.put_slice(&self.data);
        match &self.header {
            Some(header) => {
                buf.put_u8(1);
                buf.put_u32_le(header.len() as u32);
                buf.put_slice(header);
            }
            None => buf.put_u8(0),
        }
        buf.freeze()
    }

    /// Parse a published packet
    pub fn decode(mut buf: Bytes) -> Result<Self> {
        if buf.remaining() < FIXED_LEN + 4 {
            return Err(EncoderError::Decode(format!(
                "packet too short: {} bytes",
                buf.remaining()
            )));
        }
        let version = buf.get_u8();
        if version != PACKET_VERSION {
            return Err(EncoderError::Decode(format!(
                "unsupported packet version {}",
                version
            )));
        }
        let frame_id = buf.get_u32_le();
        let timestamp_sof = buf.get_u64_le();
        let timestamp_eof = buf.get_u64_le();
        let encode_type = EncodeType::from_byte(buf.get_u8())?;
        let encode_id = buf.get_u32_le();
        let segment_num = buf.get_u32_le();
        let segment_id = buf.get_u32_le();
        let flags = BufferFlags(buf.get_u32_le());
        let len = buf.get_u32_le();
        let data = take_chunk(&mut buf, "data")?;

        if buf.remaining() < 1 {
            return Err(EncoderError::Decode("missing header marker".to_string()));
        }
        let header = match buf.get_u8() {
            0 => None,
            1 => {
                if buf.remaining() < 4 {
                    return Err(EncoderError::Decode("truncated header length".to_string()));
                }
                Some(take_chunk(&mut buf, "header")?)
            }
            other => {
                return Err(EncoderError::Decode(format!(
                    "invalid header marker {}",
                    other
                )))
            }
        };

        Ok(Self {
            frame_id,
            timestamp_sof,
            timestamp_eof,
            encode_type,
            encode_id,
            segment_num,
            segment_id,
            flags,
            len,
            data,
            header,
        })
    }
}

fn take_chunk(buf: &mut Bytes, what: &str) -> Result<Bytes> {
    let len = buf.get_u32_le() as usize;
    if buf.remaining() < len {
        return Err(EncoderError::Decode(format!(
            "{} truncated: need {} bytes, have {}",
            what,
            len,
            buf.remaining()
        )));
    }
    Ok(buf.split_to(len))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keyframe() -> EncodedPacket {
        EncodedPacket::new(
            &FrameExtra::new(42, 1_000_000, 1_050_000_000),
            EncodeType::FullHevc,
            0,
            3,
            BufferFlags(BufferFlags::KEYFRAME),
            Bytes::from_static(&[0, 0, 0, 1, 0x26, 0x01, 0xaa]),
            Some(Bytes::from_static(&[0, 0, 0, 1, 0x40, 0x01])),
        )
    }

    #[test]
    fn test_new_fills_segment_fields() {
        let packet = keyframe();
        assert_eq!(packet.segment_id, packet.encode_id);
        assert_eq!(packet.len, 7);
        assert_eq!(packet.segment_num, 3);
        assert!(packet.is_keyframe());
    }

    #[test]
    fn test_encode_decode() {
        let packet = keyframe();
        let decoded = EncodedPacket::decode(packet.encode()).unwrap();
        assert_eq!(decoded, packet);

        let mut plain = keyframe();
        plain.header = None;
        plain.flags = BufferFlags::default();
        plain.encode_type = EncodeType::QcameraH264;
        assert_eq!(EncodedPacket::decode(plain.encode()).unwrap(), plain);
    }

    #[test]
    fn test_decode_rejects_truncated() {
        let encoded = keyframe().encode();
        assert!(EncodedPacket::decode(encoded.slice(..10)).is_err());
        assert!(EncodedPacket::decode(encoded.slice(..encoded.len() - 2)).is_err());

        let mut bad_version = encoded.to_vec();
        bad_version[0] = 9;
        assert!(EncodedPacket::decode(Bytes::from(bad_version)).is_err());
    }

    #[test]
    fn test_encode_type_from_codec() {
        assert_eq!(EncodeType::from(CodecVariant::Hevc), EncodeType::FullHevc);
        assert_eq!(EncodeType::from(CodecVariant::H264), EncodeType::QcameraH264);
    }
}
