//! QUIC streams
//!
//! Streams are thin handles: outgoing data is framed by the owning
//! connection, incoming data is put back in order by a
//! [`ReceivedDataBuffer`] and handed to a [`StreamListener`].

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

use super::error::{ProtocolError, QuicError, Result};

/// Stream identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct StreamId(u64);

impl StreamId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn value(&self) -> u64 {
        self.0
    }

    /// The `n`th bidirectional stream opened by the given side.
    pub fn bidirectional(is_client: bool, n: u64) -> Self {
        Self(n << 2 | u64::from(!is_client))
    }

    pub fn is_client_initiated(&self) -> bool {
        (self.0 & 0x1) == 0
    }

    pub fn is_server_initiated(&self) -> bool {
        (self.0 & 0x1) == 1
    }

    pub fn is_bidirectional(&self) -> bool {
        (self.0 & 0x2) == 0
    }

    pub fn is_unidirectional(&self) -> bool {
        (self.0 & 0x2) == 2
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Application callbacks for incoming stream data.
#[async_trait]
pub trait StreamListener: Send + Sync {
    /// In-order data. `fin` is set on the call that reaches the end of the
    /// stream; it may carry no bytes.
    async fn on_data(&self, stream: &Stream, data: Bytes, fin: bool);

    async fn on_reset(&self, stream: &Stream, error_code: u64);
}

/// Listener that drops everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopStreamListener;

#[async_trait]
impl StreamListener for NoopStreamListener {
    async fn on_data(&self, stream: &Stream, data: Bytes, fin: bool) {
        debug!("Dropping {} bytes on stream {} (fin: {})", data.len(), stream.id(), fin);
    }

    async fn on_reset(&self, stream: &Stream, error_code: u64) {
        debug!("Stream {} reset with code {}", stream.id(), error_code);
    }
}

/// The connection side of a stream: turns writes into frames.
#[async_trait]
pub(crate) trait StreamSink: Send + Sync {
    async fn write_stream(&self, id: StreamId, offset: u64, data: Bytes, fin: bool) -> Result<()>;

    async fn reset_stream(&self, id: StreamId, error_code: u64, final_offset: u64) -> Result<()>;
}

#[derive(Debug, Default)]
struct SendState {
    offset: u64,
    finished: bool,
}

struct StreamInner {
    id: StreamId,
    sink: Weak<dyn StreamSink>,
    listener: Arc<dyn StreamListener>,
    send: Mutex<SendState>,
    received: Mutex<ReceivedDataBuffer>,
}

/// Handle to one stream of a connection. Cheap to clone.
#[derive(Clone)]
pub struct Stream {
    inner: Arc<StreamInner>,
}

impl Stream {
    fn new(id: StreamId, sink: Weak<dyn StreamSink>, listener: Arc<dyn StreamListener>) -> Self {
        Self {
            inner: Arc::new(StreamInner {
                id,
                sink,
                listener,
                send: Mutex::new(SendState::default()),
                received: Mutex::new(ReceivedDataBuffer::new()),
            }),
        }
    }

    pub fn id(&self) -> StreamId {
        self.inner.id
    }

    fn sink(&self) -> Result<Arc<dyn StreamSink>> {
        self.inner.sink.upgrade().ok_or(QuicError::ConnectionClosed)
    }

    /// Send `data` at the next stream offset. Nothing may be written after
    /// `fin`.
    pub async fn write(&self, data: impl Into<Bytes>, fin: bool) -> Result<()> {
        let data = data.into();
        let offset = {
            let mut send = self.inner.send.lock();
            if send.finished {
                return Err(QuicError::IllegalState(format!(
                    "stream {} already finished",
                    self.inner.id
                )));
            }
            let offset = send.offset;
            send.offset += data.len() as u64;
            send.finished = fin;
            offset
        };
        self.sink()?.write_stream(self.inner.id, offset, data, fin).await
    }

    /// Abandon the sending side.
    pub async fn reset(&self, error_code: u64) -> Result<()> {
        let final_offset = {
            let mut send = self.inner.send.lock();
            send.finished = true;
            send.offset
        };
        self.sink()?
            .reset_stream(self.inner.id, error_code, final_offset)
            .await
    }

    pub(crate) fn on_data(&self, offset: u64, data: Bytes, fin: bool) -> Option<StreamEvent> {
        let mut received = self.inner.received.lock();
        received.push(offset, data, fin);
        received.read().map(|(data, fin)| StreamEvent::Data {
            stream: self.clone(),
            data,
            fin,
        })
    }

    pub(crate) fn on_reset(&self, error_code: u64, final_offset: u64) -> Option<StreamEvent> {
        let mut received = self.inner.received.lock();
        if received.reset {
            return None;
        }
        received.reset = true;
        debug!("Stream {} reset at offset {}", self.inner.id, final_offset);
        Some(StreamEvent::Reset {
            stream: self.clone(),
            error_code,
        })
    }
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream").field("id", &self.inner.id).finish()
    }
}

/// Listener work collected while the connection is locked and delivered
/// once it is released.
#[derive(Debug)]
pub(crate) enum StreamEvent {
    Data { stream: Stream, data: Bytes, fin: bool },
    Reset { stream: Stream, error_code: u64 },
}

impl StreamEvent {
    pub(crate) async fn dispatch(self) {
        match self {
            StreamEvent::Data { stream, data, fin } => {
                let listener = stream.inner.listener.clone();
                listener.on_data(&stream, data, fin).await;
            }
            StreamEvent::Reset { stream, error_code } => {
                let listener = stream.inner.listener.clone();
                listener.on_reset(&stream, error_code).await;
            }
        }
    }
}

/// Per-connection stream registry.
pub struct Streams {
    is_client: bool,
    next_bidi: u64,
    streams: HashMap<StreamId, Stream>,
    sink: Weak<dyn StreamSink>,
}

impl Streams {
    pub(crate) fn new(is_client: bool, sink: Weak<dyn StreamSink>) -> Self {
        Self {
            is_client,
            next_bidi: 0,
            streams: HashMap::new(),
            sink,
        }
    }

    /// Open the next locally initiated bidirectional stream.
    pub fn open_stream(&mut self, listener: Arc<dyn StreamListener>) -> Stream {
        let id = StreamId::bidirectional(self.is_client, self.next_bidi);
        self.next_bidi += 1;
        let stream = Stream::new(id, self.sink.clone(), listener);
        self.streams.insert(id, stream.clone());
        debug!("Opened stream {}", id);
        stream
    }

    /// Look up a stream, creating it when the peer opened it.
    pub fn get_or_create(&mut self, id: StreamId, listener: Arc<dyn StreamListener>) -> Result<Stream> {
        if let Some(stream) = self.streams.get(&id) {
            return Ok(stream.clone());
        }
        let locally_initiated = id.is_client_initiated() == self.is_client;
        if locally_initiated {
            warn!("Peer used unopened local stream {}", id);
            return Err(ProtocolError::InvalidStreamId(id.value()).into());
        }
        let stream = Stream::new(id, self.sink.clone(), listener);
        self.streams.insert(id, stream.clone());
        debug!("Peer opened stream {}", id);
        Ok(stream)
    }

    pub fn get(&self, id: StreamId) -> Option<Stream> {
        self.streams.get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }
}

impl fmt::Debug for Streams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Streams")
            .field("is_client", &self.is_client)
            .field("streams", &self.streams.len())
            .finish()
    }
}

/// Offset-ordered reassembly of received stream data.
#[derive(Debug, Default)]
pub struct ReceivedDataBuffer {
    chunks: BTreeMap<u64, Bytes>,
    read_offset: u64,
    fin_offset: Option<u64>,
    fin_delivered: bool,
    reset: bool,
}

impl ReceivedDataBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, offset: u64, data: Bytes, fin: bool) {
        if fin {
            self.fin_offset = Some(offset + data.len() as u64);
        }
        let end = offset + data.len() as u64;
        if data.is_empty() || end <= self.read_offset {
            return;
        }
        // keep the longer chunk when the same offset arrives twice
        match self.chunks.get(&offset) {
            Some(existing) if existing.len() >= data.len() => {}
            _ => {
                self.chunks.insert(offset, data);
            }
        }
    }

    /// Take all contiguous data from the read offset. Returns `None` when
    /// there is nothing new to deliver.
    pub fn read(&mut self) -> Option<(Bytes, bool)> {
        let mut out = BytesMut::new();
        while let Some((&offset, _)) = self.chunks.first_key_value() {
            if offset > self.read_offset {
                break;
            }
            let Some((offset, chunk)) = self.chunks.pop_first() else {
                break;
            };
            let end = offset + chunk.len() as u64;
            if end > self.read_offset {
                let skip = (self.read_offset - offset) as usize;
                out.extend_from_slice(&chunk[skip..]);
                self.read_offset = end;
            }
        }

        let fin = !self.fin_delivered && self.fin_offset == Some(self.read_offset);
        if fin {
            self.fin_delivered = true;
        }
        if out.is_empty() && !fin {
            return None;
        }
        Some((out.freeze(), fin))
    }

    pub fn read_offset(&self) -> u64 {
        self.read_offset
    }

    pub fn is_finished(&self) -> bool {
        self.fin_delivered
    }
}
