use std::cmp::min;
use std::io::Result as IoResult;

use prost::bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt as _};

use super::error::{DecodeError, InvalidInput};
use super::flags::Flags;
use super::message::{Message, MessageType};

pub const MAX_DATA_LENGTH: usize = 4 << 20;
const HEADER_LENGTH: usize = 10;
const DISCARD_PAGE_SIZE: usize = 4 << 10;

/// A frame as it is written to the connection.
#[derive(Clone, Debug)]
pub struct Frame {
    pub id: u32,
    pub ty: MessageType,
    pub flags: Flags,
    pub payload: Bytes,
}

/// A frame as it is handed to the stream it belongs to.
///
/// Oversized payloads are dropped while reading, leaving a decode error in
/// their place.
#[derive(Clone, Debug)]
pub struct StreamFrame {
    pub ty: MessageType,
    pub flags: Flags,
    pub payload: Result<Bytes, DecodeError>,
}

impl Frame {
    pub fn new(id: u32, ty: MessageType, flags: Flags, payload: impl Into<Bytes>) -> Self {
        let payload = payload.into();
        Self {
            id,
            ty,
            flags,
            payload,
        }
    }

    pub fn message<Msg: Message>(id: u32, flags: Flags, message: &Msg) -> Self {
        Self::new(id, Msg::TYPE_ID, flags, message.encode_to_vec())
    }

    pub fn encode(&self) -> Result<Bytes, InvalidInput> {
        let length = self.payload.len();
        if length > MAX_DATA_LENGTH {
            let msg = format!("Oversized payload: {length} bytes > {MAX_DATA_LENGTH} bytes");
            return Err(msg.into());
        }

        let mut buf = BytesMut::with_capacity(HEADER_LENGTH + length);
        buf.put_u32(length as u32);
        buf.put_u32(self.id);
        buf.put_u8(u8::from(self.ty));
        buf.put_u8(self.flags.bits());
        buf.put_slice(&self.payload);

        Ok(buf.freeze())
    }
}

impl StreamFrame {
    /// Decodes the control message this frame carries.
    pub fn decode<Msg: Message>(&self) -> Result<Msg, DecodeError> {
        if self.ty != Msg::TYPE_ID {
            return Err(DecodeError::WrongType {
                expected: Msg::TYPE_ID,
                found: self.ty,
            });
        }
        self.decode_payload()
    }

    /// Decodes the payload as an element of a stream.
    pub fn decode_payload<Msg: prost::Message + Default>(&self) -> Result<Msg, DecodeError> {
        let bytes = self.payload.clone()?;
        Ok(Msg::decode(bytes)?)
    }
}

/// Reads the next frame.
///
/// A clean end of input before any header byte yields `None`.
pub async fn read_frame(
    readable: &mut (impl AsyncRead + Unpin),
) -> IoResult<Option<(u32, StreamFrame)>> {
    let mut header = [0u8; HEADER_LENGTH];
    let read = readable.read(&mut header).await?;
    if read == 0 {
        return Ok(None);
    }
    readable.read_exact(&mut header[read..]).await?;

    let mut buf = &header[..];
    let length = buf.get_u32() as usize;
    let id = buf.get_u32();
    let ty = MessageType::from(buf.get_u8());
    let flags = Flags::from_bits_retain(buf.get_u8());

    let payload = if length > MAX_DATA_LENGTH {
        discard_bytes(readable, length).await?;
        Err(DecodeError::Oversized(length))
    } else {
        let mut payload = BytesMut::zeroed(length);
        readable.read_exact(&mut payload).await?;
        Ok(payload.freeze())
    };

    Ok(Some((id, StreamFrame { ty, flags, payload })))
}

async fn discard_bytes(reader: &mut (impl AsyncRead + Unpin), mut n_bytes: usize) -> IoResult<()> {
    let mut buf = [0u8; DISCARD_PAGE_SIZE];
    while n_bytes > 0 {
        let bytes_to_read = min(buf.len(), n_bytes);
        let read = reader.read(&mut buf[..bytes_to_read]).await?;
        if read == 0 {
            return Err(std::io::ErrorKind::UnexpectedEof.into());
        }
        n_bytes -= read;
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use tokio::io::AsyncWriteExt as _;

    use super::*;
    use crate::types::message::Demand;

    #[tokio::test]
    async fn header_layout() {
        let frame = Frame::message(3, Flags::REMOTE_CLOSED, &Demand { credit: 1 });
        let bytes = frame.encode().unwrap();
        assert_eq!(&bytes[..], &[0, 0, 0, 2, 0, 0, 0, 3, 4, 1, 0x08, 0x01]);

        let (id, frame) = read_frame(&mut &bytes[..]).await.unwrap().unwrap();
        assert_eq!(id, 3);
        assert_eq!(frame.flags, Flags::REMOTE_CLOSED);
        assert_eq!(frame.decode::<Demand>().unwrap().credit, 1);
    }

    #[tokio::test]
    async fn oversized_payloads_are_skipped() {
        let (mut writer, mut reader) = tokio::io::duplex(64 << 10);
        let length = MAX_DATA_LENGTH + 1;

        tokio::spawn(async move {
            let mut header = BytesMut::new();
            header.put_u32(length as u32);
            header.put_u32(1);
            header.put_u8(3);
            header.put_u8(0);
            writer.write_all(&header).await.unwrap();
            writer.write_all(&vec![0u8; length]).await.unwrap();

            let next = Frame::message(5, Flags::empty(), &Demand { credit: 2 });
            writer.write_all(&next.encode().unwrap()).await.unwrap();
        });

        let (id, frame) = read_frame(&mut reader).await.unwrap().unwrap();
        assert_eq!(id, 1);
        assert_eq!(frame.payload.unwrap_err(), DecodeError::Oversized(length));

        let (id, frame) = read_frame(&mut reader).await.unwrap().unwrap();
        assert_eq!(id, 5);
        assert_eq!(frame.decode::<Demand>().unwrap().credit, 2);

        assert!(read_frame(&mut reader).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn wrong_type_does_not_decode() {
        let frame = Frame::message(1, Flags::empty(), &Demand { credit: 1 });
        let bytes = frame.encode().unwrap();
        let (_, frame) = read_frame(&mut &bytes[..]).await.unwrap().unwrap();
        let err = frame
            .decode::<crate::types::message::Cancel>()
            .unwrap_err();
        assert!(matches!(err, DecodeError::WrongType { .. }));
    }

    #[test]
    fn oversized_frames_do_not_encode() {
        let frame = Frame::new(
            1,
            MessageType::Data,
            Flags::empty(),
            vec![0u8; MAX_DATA_LENGTH + 1],
        );
        assert!(frame.encode().is_err());
    }
}
