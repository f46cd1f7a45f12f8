//! MLLP网络编解码器
//!
//! MLLP帧: <VT 0x0B> 报文 <FS 0x1C> <CR 0x0D>。部分仪器省略结尾CR,
//! 解码时两种形式都接受。

use bytes::{BufMut, BytesMut};
use lis_core::LisError;
use tokio_util::codec::{Decoder, Encoder};

const VT: u8 = 0x0B;
const FS: u8 = 0x1C;
const CR: u8 = 0x0D;
const LF: u8 = 0x0A;

/// MLLP帧编解码器
pub struct MllpCodec;

impl Decoder for MllpCodec {
    type Item = String;
    type Error = LisError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // 丢弃上一帧遗留的行结束符
        while src.first().map(|&b| b == CR || b == LF).unwrap_or(false) {
            let _ = src.split_to(1);
        }

        let fs_pos = match src.iter().position(|&b| b == FS) {
            Some(pos) => pos,
            None => return Ok(None), // 帧未收全, 继续缓冲
        };

        let end = if src.len() > fs_pos + 1 && src[fs_pos + 1] == CR {
            fs_pos + 2
        } else {
            fs_pos + 1
        };

        let frame = src.split_to(end);
        Ok(Some(String::from_utf8_lossy(&frame).into_owned()))
    }
}

impl Encoder<String> for MllpCodec {
    type Error = LisError;

    fn encode(&mut self, item: String, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.reserve(item.len() + 3);
        dst.put_u8(VT);
        dst.put_slice(item.as_bytes());
        dst.put_u8(FS);
        dst.put_u8(CR);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_single_frame() {
        let mut codec = MllpCodec;
        let mut buffer = BytesMut::from(&b"\x0BMSH|^~\\&|A\x1C\x0D"[..]);

        let frame = codec.decode(&mut buffer).unwrap().unwrap();
        assert_eq!(frame, "\x0BMSH|^~\\&|A\x1C\x0D");
        assert!(codec.decode(&mut buffer).unwrap().is_none());
    }

    #[test]
    fn test_decode_partial_then_complete() {
        let mut codec = MllpCodec;
        let mut buffer = BytesMut::from(&b"\x0BMSH|^~\\&"[..]);

        assert!(codec.decode(&mut buffer).unwrap().is_none());

        buffer.extend_from_slice(b"|A\x1C\x0D");
        let frame = codec.decode(&mut buffer).unwrap().unwrap();
        assert!(frame.contains("MSH|^~\\&|A"));
    }

    #[test]
    fn test_decode_two_frames_in_one_read() {
        let mut codec = MllpCodec;
        let mut buffer = BytesMut::from(&b"\x0BAAA\x1C\x0D\x0BBBB\x1C\x0D"[..]);

        let first = codec.decode(&mut buffer).unwrap().unwrap();
        let second = codec.decode(&mut buffer).unwrap().unwrap();
        assert!(first.contains("AAA"));
        assert!(second.contains("BBB"));
        assert!(codec.decode(&mut buffer).unwrap().is_none());
    }

    #[test]
    fn test_decode_frame_without_trailing_cr() {
        let mut codec = MllpCodec;
        let mut buffer = BytesMut::from(&b"\x0BCCC\x1C"[..]);

        let frame = codec.decode(&mut buffer).unwrap().unwrap();
        assert!(frame.contains("CCC"));
    }

    #[test]
    fn test_encode_wraps_mllp() {
        let mut codec = MllpCodec;
        let mut buffer = BytesMut::new();
        codec.encode("MSA|AA|1".to_string(), &mut buffer).unwrap();
        assert_eq!(&buffer[..], b"\x0BMSA|AA|1\x1C\x0D");
    }
}
