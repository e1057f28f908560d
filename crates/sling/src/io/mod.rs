use std::collections::HashMap;
use std::io::{Error as IoError, ErrorKind as IoErrorKind, Result as IoResult};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use prost::bytes::Bytes;
use thiserror::Error;
use tokio::io::{split, AsyncRead, AsyncWrite, AsyncWriteExt as _};
use tokio::sync::mpsc::error::SendError as MpscSendError;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;

use crate::types::frame::read_frame;
use crate::types::{Cancel, Demand, Flags, Frame, InvalidInput, Message, MessageType};
use crate::types::{Request, Response, StreamFrame};
use crate::Status;

pub mod credit;
pub mod pump;

#[derive(Error, Debug)]
pub enum SendError {
    #[error("Io error: {0}")]
    Io(#[from] IoError),

    #[error("Invalid input: {0}")]
    InvalidInput(#[from] InvalidInput),
}

impl SendError {
    pub fn channel_closed() -> Self {
        SendError::Io(IoError::new(IoErrorKind::BrokenPipe, "Channel closed"))
    }
}

/// Queues encoded frames for the connection writer.
///
/// Sending never waits: flow control happens per stream through demand.
#[derive(Clone)]
pub struct MessageSender {
    tx: UnboundedSender<Bytes>,
}

impl MessageSender {
    fn new(mut writer: impl AsyncWrite + Unpin + Send + 'static) -> (Self, JoinHandle<IoResult<()>>) {
        let (tx, mut rx) = unbounded_channel::<Bytes>();
        let task = tokio::spawn(async move {
            while let Some(mut bytes) = rx.recv().await {
                // Errors writing bytes to the connection interrupt the loop
                writer.write_all_buf(&mut bytes).await?;
            }
            writer.shutdown().await
        });
        (Self { tx }, task)
    }

    pub fn send(&self, frame: &Frame) -> Result<(), SendError> {
        let bytes = frame.encode()?;
        self.tx
            .send(bytes)
            .map_err(|_| SendError::channel_closed())
    }

    fn stream(&self, id: u32) -> StreamSender {
        let tx = self.clone();
        StreamSender { id, tx }
    }
}

#[derive(Default)]
struct Registry {
    streams: HashMap<u32, UnboundedSender<StreamFrame>>,
    closed: bool,
}

#[derive(Clone, Default)]
struct Streams(Arc<Mutex<Registry>>);

impl Streams {
    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Unregisters a stream when the last reference to it goes away.
pub struct StreamGuard {
    id: u32,
    streams: Streams,
}

impl StreamGuard {
    pub fn id(&self) -> u32 {
        self.id
    }
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.streams.lock().streams.remove(&self.id);
    }
}

pub struct MessageReceiver {
    rx: UnboundedReceiver<(u32, StreamFrame)>,
    streams: Streams,
}

impl MessageReceiver {
    fn new(mut reader: impl AsyncRead + Unpin + Send + 'static) -> (Self, JoinHandle<IoResult<()>>) {
        let (tx, rx) = unbounded_channel();
        let task = tokio::spawn(async move {
            // Errors reading bytes from the connection interrupt the loop
            while let Some(frame) = read_frame(&mut reader).await? {
                if tx.send(frame).is_err() {
                    break;
                }
            }
            Ok(())
        });
        let streams = Streams::default();
        (Self { rx, streams }, task)
    }

    /// Routes incoming frames to their streams.
    ///
    /// Returns the frames that belong to no open stream. Once the connection
    /// is gone every open stream is closed and `None` is returned.
    pub async fn recv(&mut self) -> Option<(u32, StreamFrame)> {
        while let Some((id, frame)) = self.rx.recv().await {
            let stream_tx = self.streams.lock().streams.get(&id).cloned();

            let Some(stream_tx) = stream_tx else {
                // there was no stream for this id, return the message
                return Some((id, frame));
            };

            if let Err(MpscSendError(frame)) = stream_tx.send(frame) {
                // the stream is finishing, let the caller deal with the message
                return Some((id, frame));
            }
        }

        let mut registry = self.streams.lock();
        registry.closed = true;
        registry.streams.clear();
        None
    }

    fn stream(&mut self, id: u32) -> Option<StreamReceiver> {
        let (tx, rx) = unbounded_channel();
        let mut registry = self.streams.lock();
        if registry.streams.contains_key(&id) {
            return None;
        }
        if !registry.closed {
            // after the connection is gone, `tx` is dropped right away and
            // the stream reads as closed
            registry.streams.insert(id, tx);
        }
        drop(registry);
        let guard = Arc::new(StreamGuard {
            id,
            streams: self.streams.clone(),
        });
        Some(StreamReceiver { rx, guard })
    }
}

/// Both halves of a connection, as frames.
pub struct MessageIo {
    pub tx: MessageSender,
    pub rx: MessageReceiver,
    reader: JoinHandle<IoResult<()>>,
    writer: JoinHandle<IoResult<()>>,
}

impl MessageIo {
    pub fn new(connection: impl AsyncRead + AsyncWrite + Send + 'static) -> Self {
        let (reader, writer) = split(connection);

        let (rx, reader) = MessageReceiver::new(reader);
        let (tx, writer) = MessageSender::new(writer);

        Self {
            tx,
            rx,
            reader,
            writer,
        }
    }

    /// Registers stream `id`. Returns `None` if it is already open.
    pub fn stream(&mut self, id: u32) -> Option<StreamIo> {
        let rx = self.rx.stream(id)?;
        let tx = self.tx.stream(id);
        Some(StreamIo { tx, rx })
    }

    /// Stops reading, flushes everything queued so far and closes the
    /// connection.
    ///
    /// Every `StreamSender` should be gone by then, as the writer only stops
    /// once the last sender is dropped.
    pub async fn shutdown(self) -> IoResult<()> {
        let Self {
            tx,
            rx,
            reader,
            writer,
        } = self;
        drop(tx);
        drop(rx);
        reader.abort();
        let read = match reader.await {
            Ok(res) => res,
            Err(err) if err.is_cancelled() => Ok(()),
            Err(err) => Err(IoError::other(err)),
        };
        let written = writer.await.map_err(IoError::other)?;
        match (read, written) {
            (Err(err), _) if err.kind() != IoErrorKind::UnexpectedEof => Err(err),
            (_, Err(err)) if err.kind() != IoErrorKind::BrokenPipe => Err(err),
            _ => Ok(()),
        }
    }
}

/// Writes the frames of one stream.
#[derive(Clone)]
pub struct StreamSender {
    id: u32,
    tx: MessageSender,
}

impl StreamSender {
    pub fn id(&self) -> u32 {
        self.id
    }

    fn message<Msg: Message>(&self, flags: Flags, message: &Msg) -> Result<(), SendError> {
        self.tx.send(&Frame::message(self.id, flags, message))
    }

    pub fn request(&self, flags: Flags, request: &Request) -> Result<(), SendError> {
        self.message(flags, request)
    }

    pub fn respond(&self, payload: &impl prost::Message) -> Result<(), SendError> {
        self.message(Flags::empty(), &Response::ok(payload))
    }

    pub fn error(&self, status: Status) -> Result<(), SendError> {
        self.message(Flags::empty(), &Response::error(status))
    }

    pub fn data(&self, payload: &impl prost::Message) -> Result<(), SendError> {
        let frame = Frame::new(
            self.id,
            MessageType::Data,
            Flags::empty(),
            payload.encode_to_vec(),
        );
        self.tx.send(&frame)
    }

    /// Ends this side of the stream.
    pub fn close_data(&self) -> Result<(), SendError> {
        let frame = Frame::new(
            self.id,
            MessageType::Data,
            Flags::REMOTE_CLOSED | Flags::NO_DATA,
            Bytes::new(),
        );
        self.tx.send(&frame)
    }

    pub fn demand(&self, credit: u32) -> Result<(), SendError> {
        self.message(Flags::empty(), &Demand { credit })
    }

    pub fn cancel(&self) -> Result<(), SendError> {
        self.message(Flags::empty(), &Cancel {})
    }
}

/// Reads the frames routed to one stream.
pub struct StreamReceiver {
    rx: UnboundedReceiver<StreamFrame>,
    guard: Arc<StreamGuard>,
}

impl StreamReceiver {
    pub fn id(&self) -> u32 {
        self.guard.id()
    }

    /// The next frame, or `None` once the connection is gone.
    pub async fn recv(&mut self) -> Option<StreamFrame> {
        self.rx.recv().await
    }
}

pub struct StreamIo {
    pub tx: StreamSender,
    pub rx: StreamReceiver,
}

impl StreamIo {
    pub fn id(&self) -> u32 {
        self.tx.id()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn pair() -> (MessageIo, MessageIo) {
        let (a, b) = tokio::io::duplex(1024);
        (MessageIo::new(a), MessageIo::new(b))
    }

    #[tokio::test]
    async fn frames_are_routed_to_their_stream() {
        let (mut left, mut right) = pair();

        let mut stream = right.stream(1).unwrap();
        let sender = left.tx.stream(1);
        sender.demand(3).unwrap();
        left.tx.stream(3).cancel().unwrap();

        // stream 3 is not registered, so it reaches the connection loop
        let (id, frame) = right.rx.recv().await.unwrap();
        assert_eq!(id, 3);
        assert_eq!(frame.ty, MessageType::Cancel);

        let frame = stream.rx.recv().await.unwrap();
        assert_eq!(frame.decode::<Demand>().unwrap().credit, 3);
        assert!(right.stream(1).is_none());
    }

    #[tokio::test]
    async fn dropped_streams_are_unregistered() {
        let (_left, mut right) = pair();
        let stream = right.stream(5).unwrap();
        assert!(right.stream(5).is_none());
        drop(stream);
        assert!(right.stream(5).is_some());
    }

    #[tokio::test]
    async fn streams_close_with_the_connection() {
        let (left, mut right) = pair();
        let mut stream = right.stream(1).unwrap();

        left.shutdown().await.unwrap();

        assert!(right.rx.recv().await.is_none());
        assert!(stream.rx.recv().await.is_none());

        let mut late = right.stream(3).unwrap();
        assert!(late.rx.recv().await.is_none());
    }
}
