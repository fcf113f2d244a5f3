// Copyright 2020 The Exonum Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Frame layout of packets on the wire.
//!
//! Every frame is `[len: u32 LE][kind: u8][payload: len bytes]` where the
//! payload is produced by the serializer pluggable. The codec implements
//! the tokio framing traits, so stream transports can wrap a connection
//! in `Framed` directly; datagram-ish transports (and the in-process hub)
//! carry whole frames and use [`encode_frame`] / [`decode_frame`].

use anyhow::bail;
use byteorder::{ByteOrder, LittleEndian};
use bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use std::convert::TryFrom;
use std::mem;

use crate::packets::PacketKind;

/// Frame header length: the length prefix plus the kind byte.
pub const HEADER_LENGTH: usize = mem::size_of::<u32>() + 1;

/// Default cap on the encoded payload length.
pub const DEFAULT_MAX_FRAME_LEN: u32 = 4 * 1024 * 1024;

/// Codec of the frame layout.
#[derive(Debug, Clone, Copy)]
pub struct PacketCodec {
    /// Maximum accepted payload length (in bytes).
    max_frame_len: u32,
}

impl Default for PacketCodec {
    fn default() -> Self {
        Self {
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }
}

impl PacketCodec {
    /// Creates a codec with a custom payload cap.
    pub fn new(max_frame_len: u32) -> Self {
        Self { max_frame_len }
    }
}

impl Decoder for PacketCodec {
    type Item = (PacketKind, Vec<u8>);
    type Error = anyhow::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if buf.len() < HEADER_LENGTH {
            return Ok(None);
        }

        let len = LittleEndian::read_u32(buf) as usize;
        if len > self.max_frame_len as usize {
            bail!(
                "received frame is too long: payload_len = {}, allowed_len = {}",
                len,
                self.max_frame_len
            );
        }
        if buf.len() < HEADER_LENGTH + len {
            return Ok(None);
        }

        let kind = PacketKind::try_from(buf[mem::size_of::<u32>()])?;
        let frame = buf.split_to(HEADER_LENGTH + len);
        Ok(Some((kind, frame[HEADER_LENGTH..].to_vec())))
    }
}

impl Encoder<(PacketKind, Vec<u8>)> for PacketCodec {
    type Error = anyhow::Error;

    fn encode(
        &mut self,
        (kind, payload): (PacketKind, Vec<u8>),
        buf: &mut BytesMut,
    ) -> Result<(), Self::Error> {
        if payload.len() > self.max_frame_len as usize {
            bail!(
                "refusing to send frame longer than {} bytes (got {})",
                self.max_frame_len,
                payload.len()
            );
        }
        buf.reserve(HEADER_LENGTH + payload.len());
        let mut header = [0_u8; mem::size_of::<u32>()];
        LittleEndian::write_u32(&mut header, payload.len() as u32);
        buf.put_slice(&header);
        buf.put_u8(kind as u8);
        buf.put_slice(&payload);
        Ok(())
    }
}

/// Encodes one complete frame into a byte vector.
pub fn encode_frame(kind: PacketKind, payload: Vec<u8>) -> anyhow::Result<Vec<u8>> {
    let mut buf = BytesMut::new();
    PacketCodec::default().encode((kind, payload), &mut buf)?;
    Ok(buf.to_vec())
}

/// Decodes one complete frame from a byte slice.
pub fn decode_frame(frame: &[u8]) -> anyhow::Result<(PacketKind, Vec<u8>)> {
    let mut buf = BytesMut::from(frame);
    match PacketCodec::default().decode(&mut buf)? {
        Some(decoded) if buf.is_empty() => Ok(decoded),
        Some(_) => bail!("trailing bytes after a complete frame"),
        None => bail!("truncated frame: {} bytes", frame.len()),
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn frame_round_trip() {
        let payload = br#"{"ver":1,"sender":"node-1"}"#.to_vec();
        let frame = encode_frame(PacketKind::Heartbeat, payload.clone()).unwrap();
        let (kind, decoded) = decode_frame(&frame).unwrap();
        assert_eq!(kind, PacketKind::Heartbeat);
        assert_eq!(decoded, payload);
    }

    #[test]
    fn partial_frames_wait_for_more_bytes() {
        let frame = encode_frame(PacketKind::Info, vec![1, 2, 3, 4]).unwrap();
        let mut buf = BytesMut::from(&frame[..frame.len() - 1]);
        assert!(PacketCodec::default().decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn streamed_frames_decode_one_by_one() {
        let mut buf = BytesMut::new();
        let mut codec = PacketCodec::default();
        codec
            .encode((PacketKind::Request, vec![1]), &mut buf)
            .unwrap();
        codec
            .encode((PacketKind::Response, vec![2, 3]), &mut buf)
            .unwrap();

        let (kind, payload) = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!((kind, payload), (PacketKind::Request, vec![1]));
        let (kind, payload) = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!((kind, payload), (PacketKind::Response, vec![2, 3]));
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn oversized_frames_are_rejected() {
        let mut codec = PacketCodec::new(8);
        let mut buf = BytesMut::new();
        let err = codec
            .encode((PacketKind::Event, vec![0; 9]), &mut buf)
            .unwrap_err();
        assert!(err.to_string().contains("longer than"));

        // A forged length prefix is rejected on decode as well.
        let mut forged = BytesMut::new();
        let mut header = [0_u8; 4];
        LittleEndian::write_u32(&mut header, 100);
        forged.put_slice(&header);
        forged.put_u8(PacketKind::Event as u8);
        forged.put_slice(&[0; 100]);
        assert!(PacketCodec::new(8).decode(&mut forged).is_err());
    }

    #[test]
    fn unknown_kind_byte_is_rejected() {
        let mut buf = BytesMut::new();
        let mut header = [0_u8; 4];
        LittleEndian::write_u32(&mut header, 0);
        buf.put_slice(&header);
        buf.put_u8(42);
        assert!(PacketCodec::default().decode(&mut buf).is_err());
    }
}
