// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::collections::BTreeMap;
use std::io;
use std::io::Read;
use std::io::Write;
use std::mem;

use num_enum::IntoPrimitive;
use num_enum::TryFromPrimitive;
use static_assertions::const_assert;

use crate::prelude::*;

const_assert!(mem::size_of::<usize>() >= mem::size_of::<u32>());

pub const PROTOCOL_VERSION: u16 = 502;
const MAGIC: [u8; 4] = *b"PYRC";

// header: magic + version + type + flags + seq + serializer id
//         + annotations length + payload length + payload crc32
pub const HEADER_SIZE: usize = 4 + 2 + 2 + 2 + 4 + 2 + 4 + 4 + 4;

// Frames smaller than this stall on some socket stacks, so short replies are
// padded up to it with a PADD annotation.
const MIN_FRAME_SIZE: usize = 40;
const ANNOTATION_OVERHEAD: usize = 8;

pub const ANNOTATION_CORRELATION: &str = "CORR";
pub const ANNOTATION_STREAM: &str = "STRM";
pub const ANNOTATION_PADDING: &str = "PADD";

#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u16)]
pub enum MsgType {
    Connect = 1,
    ConnectOk = 2,
    ConnectFail = 3,
    Invoke = 4,
    Result = 5,
    Ping = 6,
}

pub mod flags {
    pub const COMPRESSED: u16 = 0x01;
    pub const EXCEPTION: u16 = 0x02;
    pub const ONEWAY: u16 = 0x04;
    pub const BATCH: u16 = 0x08;
    pub const ITEMSTREAMRESULT: u16 = 0x10;
}

/// Annotation keys are fixed-length 4-byte ASCII; unknown keys are carried
/// through untouched. BTreeMap keeps the wire order deterministic.
pub type Annotations = BTreeMap<String, Vec<u8>>;

trait Framed: Sized {
    fn framed_write<W: Write>(&self, stream: &mut W) -> io::Result<()>;
    fn framed_read<R: Read>(stream: &mut R) -> io::Result<Self>;
}

impl Framed for u16 {
    fn framed_write<W: Write>(&self, stream: &mut W) -> io::Result<()> {
        stream.write_all(&self.to_be_bytes())
    }

    fn framed_read<R: Read>(stream: &mut R) -> io::Result<Self> {
        let mut buf = [0u8; mem::size_of::<Self>()];
        stream.read_exact(&mut buf)?;
        Ok(Self::from_be_bytes(buf))
    }
}

impl Framed for u32 {
    fn framed_write<W: Write>(&self, stream: &mut W) -> io::Result<()> {
        stream.write_all(&self.to_be_bytes())
    }

    fn framed_read<R: Read>(stream: &mut R) -> io::Result<Self> {
        let mut buf = [0u8; mem::size_of::<Self>()];
        stream.read_exact(&mut buf)?;
        Ok(Self::from_be_bytes(buf))
    }
}

impl Framed for [u8; 4] {
    fn framed_write<W: Write>(&self, stream: &mut W) -> io::Result<()> {
        stream.write_all(self)
    }

    fn framed_read<R: Read>(stream: &mut R) -> io::Result<Self> {
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf)?;
        Ok(buf)
    }
}

/// One framed message, either direction. The payload stays opaque here;
/// codecs interpret it.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Message {
    pub msg_type: MsgType,
    pub flags: u16,
    pub seq: u32,
    pub serializer_id: u16,
    pub annotations: Annotations,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn new(
        msg_type: MsgType,
        flags: u16,
        seq: u32,
        serializer_id: u16,
        payload: Vec<u8>,
        annotations: Annotations,
    ) -> Self {
        Self {
            msg_type,
            flags,
            seq,
            serializer_id,
            annotations,
            payload,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut annotations = self.annotations.clone();
        let body_size: usize = annotations
            .iter()
            .map(|(_, v)| ANNOTATION_OVERHEAD + v.len())
            .sum::<usize>()
            + HEADER_SIZE
            + self.payload.len();
        if body_size < MIN_FRAME_SIZE {
            let pad = MIN_FRAME_SIZE.saturating_sub(body_size + ANNOTATION_OVERHEAD);
            annotations.insert(ANNOTATION_PADDING.to_owned(), vec![0; pad]);
        }

        let mut ann_block = Vec::new();
        for (key, value) in &annotations {
            let key: [u8; 4] = key
                .as_bytes()
                .try_into()
                .ok()
                .filter(|k: &[u8; 4]| k.is_ascii())
                .ok_or_else(|| {
                    anyhow!(PyroError::Protocol(format!(
                        "annotation key must be 4 ascii chars: {key:?}"
                    )))
                })?;
            key.framed_write(&mut ann_block).location(loc!())?;
            (value.len() as u32)
                .framed_write(&mut ann_block)
                .location(loc!())?;
            ann_block.extend_from_slice(value);
        }

        let mut out = Vec::with_capacity(HEADER_SIZE + ann_block.len() + self.payload.len());
        MAGIC.framed_write(&mut out).location(loc!())?;
        PROTOCOL_VERSION.framed_write(&mut out).location(loc!())?;
        u16::from(self.msg_type).framed_write(&mut out).location(loc!())?;
        self.flags.framed_write(&mut out).location(loc!())?;
        self.seq.framed_write(&mut out).location(loc!())?;
        self.serializer_id.framed_write(&mut out).location(loc!())?;
        (ann_block.len() as u32).framed_write(&mut out).location(loc!())?;
        (self.payload.len() as u32).framed_write(&mut out).location(loc!())?;
        crc32fast::hash(&self.payload)
            .framed_write(&mut out)
            .location(loc!())?;
        out.extend_from_slice(&ann_block);
        out.extend_from_slice(&self.payload);
        Ok(out)
    }

    /// Read one message, failing with `ProtocolError` when the frame is
    /// malformed or its type is not one of `expected`, and with
    /// `ConnectionClosedError` when the stream ends mid-frame.
    pub fn recv<R: Read>(stream: &mut R, expected: &[MsgType]) -> Result<Self> {
        let magic = <[u8; 4]>::framed_read(stream).map_err(recv_err)?;
        if magic != MAGIC {
            bail!(PyroError::Protocol("invalid message magic".into()));
        }
        let version = u16::framed_read(stream).map_err(recv_err)?;
        if version != PROTOCOL_VERSION {
            bail!(PyroError::Protocol(format!(
                "invalid protocol version: {version}, expected {PROTOCOL_VERSION}"
            )));
        }
        let raw_type = u16::framed_read(stream).map_err(recv_err)?;
        let msg_type = MsgType::try_from(raw_type).map_err(|_| {
            anyhow!(PyroError::Protocol(format!("unknown message type: {raw_type}")))
        })?;
        let flags = u16::framed_read(stream).map_err(recv_err)?;
        let seq = u32::framed_read(stream).map_err(recv_err)?;
        let serializer_id = u16::framed_read(stream).map_err(recv_err)?;
        let ann_size = u32::framed_read(stream).map_err(recv_err)? as usize;
        let payload_size = u32::framed_read(stream).map_err(recv_err)? as usize;
        let checksum = u32::framed_read(stream).map_err(recv_err)?;

        if !expected.contains(&msg_type) {
            bail!(PyroError::Protocol(format!(
                "invalid msg type {raw_type} received (expected one of {expected:?})"
            )));
        }

        let mut ann_block = vec![0; ann_size];
        stream.read_exact(&mut ann_block).map_err(recv_err)?;
        let annotations = parse_annotations(&ann_block).location(loc!())?;

        let mut payload = vec![0; payload_size];
        stream.read_exact(&mut payload).map_err(recv_err)?;
        if crc32fast::hash(&payload) != checksum {
            bail!(PyroError::Protocol("payload checksum mismatch".into()));
        }

        Ok(Self {
            msg_type,
            flags,
            seq,
            serializer_id,
            annotations,
            payload,
        })
    }
}

fn recv_err(err: io::Error) -> anyhow::Error {
    match err.kind() {
        io::ErrorKind::UnexpectedEof => {
            PyroError::ConnectionClosed("connection lost before a complete frame arrived".into())
                .into()
        },
        io::ErrorKind::ConnectionAborted => {
            PyroError::ConnectionClosed("receiving interrupted by shutdown".into()).into()
        },
        _ => PyroError::Communication(format!("error receiving frame: {err}")).into(),
    }
}

fn parse_annotations(block: &[u8]) -> Result<Annotations> {
    let mut annotations = Annotations::new();
    let mut rest = block;
    while !rest.is_empty() {
        if rest.len() < ANNOTATION_OVERHEAD {
            bail!(PyroError::Protocol("truncated annotation block".into()));
        }
        let (key, tail) = rest.split_at(4);
        let key = std::str::from_utf8(key)
            .ok()
            .filter(|k| k.is_ascii())
            .ok_or_else(|| anyhow!(PyroError::Protocol("non-ascii annotation key".into())))?;
        let (len, tail) = tail.split_at(4);
        let len = u32::from_be_bytes(len.try_into().unwrap()) as usize;
        if tail.len() < len {
            bail!(PyroError::Protocol("truncated annotation value".into()));
        }
        let (value, tail) = tail.split_at(len);
        annotations.insert(key.to_owned(), value.to_vec());
        rest = tail;
    }
    Ok(annotations)
}

pub fn log_wiredata(direction: &str, msg: &Message) {
    debug!(
        "wiredata {}: type={:?} flags={:#06x} seq={} serializer={} annotations={:?} payload={} bytes",
        direction,
        msg.msg_type,
        msg.flags,
        msg.seq,
        msg.serializer_id,
        msg.annotations.keys().collect::<Vec<_>>(),
        msg.payload.len(),
    );
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use proptest::prelude::*;

    use super::*;

    fn round_trip(msg: &Message, expected: &[MsgType]) -> Message {
        let bytes = msg.to_bytes().unwrap();
        Message::recv(&mut Cursor::new(bytes), expected).unwrap()
    }

    #[test]
    fn short_messages_are_padded_to_the_minimum_frame_size() {
        let msg = Message::new(MsgType::Ping, 0, 7, 2, b"pong".to_vec(), Annotations::new());
        let bytes = msg.to_bytes().unwrap();
        assert!(bytes.len() >= MIN_FRAME_SIZE);

        let received = Message::recv(&mut Cursor::new(bytes), &[MsgType::Ping]).unwrap();
        assert_eq!(received.seq, 7);
        assert_eq!(received.payload, b"pong");
        assert!(received.annotations.contains_key(ANNOTATION_PADDING));
    }

    #[test]
    fn annotations_survive_the_wire() {
        let mut annotations = Annotations::new();
        annotations.insert("CORR".to_owned(), vec![0xab; 16]);
        annotations.insert("XYZW".to_owned(), b"opaque".to_vec());
        let msg = Message::new(
            MsgType::Invoke,
            flags::ONEWAY,
            3,
            4,
            vec![1; 64],
            annotations.clone(),
        );
        let received = round_trip(&msg, &[MsgType::Invoke]);
        assert_eq!(received.annotations.get("CORR"), annotations.get("CORR"));
        // Unknown keys are preserved verbatim.
        assert_eq!(received.annotations.get("XYZW"), annotations.get("XYZW"));
    }

    #[test]
    fn bad_magic_is_a_protocol_error() {
        let msg = Message::new(MsgType::Ping, 0, 0, 2, vec![], Annotations::new());
        let mut bytes = msg.to_bytes().unwrap();
        bytes[0] = b'X';
        let err = Message::recv(&mut Cursor::new(bytes), &[MsgType::Ping]).unwrap_err();
        assert_eq!(crate::errors::wire_kind(&err), "ProtocolError");
    }

    #[test]
    fn version_mismatch_is_a_protocol_error() {
        let msg = Message::new(MsgType::Ping, 0, 0, 2, vec![], Annotations::new());
        let mut bytes = msg.to_bytes().unwrap();
        bytes[5] = 0xff;
        let err = Message::recv(&mut Cursor::new(bytes), &[MsgType::Ping]).unwrap_err();
        assert_eq!(crate::errors::wire_kind(&err), "ProtocolError");
    }

    #[test]
    fn unexpected_type_is_a_protocol_error() {
        let msg = Message::new(MsgType::Connect, 0, 0, 2, vec![], Annotations::new());
        let bytes = msg.to_bytes().unwrap();
        let err = Message::recv(&mut Cursor::new(bytes), &[MsgType::Invoke, MsgType::Ping])
            .unwrap_err();
        assert_eq!(crate::errors::wire_kind(&err), "ProtocolError");
    }

    #[test]
    fn corrupted_payload_fails_the_checksum() {
        let msg = Message::new(MsgType::Result, 0, 1, 2, vec![9; 80], Annotations::new());
        let mut bytes = msg.to_bytes().unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        let err = Message::recv(&mut Cursor::new(bytes), &[MsgType::Result]).unwrap_err();
        assert_eq!(crate::errors::wire_kind(&err), "ProtocolError");
    }

    #[test]
    fn truncated_frame_is_a_connection_closed_error() {
        let msg = Message::new(MsgType::Result, 0, 1, 2, vec![9; 80], Annotations::new());
        let mut bytes = msg.to_bytes().unwrap();
        bytes.truncate(bytes.len() - 10);
        let err = Message::recv(&mut Cursor::new(bytes), &[MsgType::Result]).unwrap_err();
        assert!(crate::errors::is_connection_closed(&err));
    }

    #[test]
    fn empty_stream_is_a_connection_closed_error() {
        let err = Message::recv(&mut Cursor::new(Vec::new()), &[MsgType::Invoke]).unwrap_err();
        assert!(crate::errors::is_connection_closed(&err));
    }

    #[test]
    fn oversized_annotation_key_is_rejected_on_send() {
        let mut annotations = Annotations::new();
        annotations.insert("TOOLONG".to_owned(), vec![]);
        let msg = Message::new(MsgType::Ping, 0, 0, 2, vec![], annotations);
        assert!(msg.to_bytes().is_err());
    }

    proptest! {
        #[test]
        fn header_fields_round_trip(
            flags in 0u16..32,
            seq in any::<u32>(),
            serializer_id in any::<u16>(),
            payload in proptest::collection::vec(any::<u8>(), 0..256),
        ) {
            let msg = Message::new(MsgType::Result, flags, seq, serializer_id, payload, Annotations::new());
            let received = round_trip(&msg, &[MsgType::Result]);
            prop_assert_eq!(received.flags, msg.flags);
            prop_assert_eq!(received.seq, msg.seq);
            prop_assert_eq!(received.serializer_id, msg.serializer_id);
            prop_assert_eq!(received.payload, msg.payload);
        }
    }
}
