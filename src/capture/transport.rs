//! The boundary to the external capture bus.
//!
//! The bus library owns its own thread; the core never calls into it
//! directly. Everything a stream sends travels as a message into the worker
//! thread, and everything the consumer does comes back as a
//! [`ConsumerEvent`] over a `calloop` channel the embedder inserts into its
//! event loop. No protocol state crosses this boundary.
//!
//! [`Loopback`] is a synchronous in-process stand-in for the bus, used by
//! the test suites to act as the consumer.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::sync::{mpsc, Arc, Mutex};
use std::thread::JoinHandle;

use tracing::{debug, trace};

use super::negotiate::{FormatChoice, NegotiationOffer};
use super::pool::{BufferBacking, BufferId};

/// What the consumer side of the bus did.
#[derive(Debug)]
pub enum ConsumerEvent {
    /// The consumer picked a format out of the current offer.
    Configure(FormatChoice),
    /// The consumer contributed a buffer to the pool.
    AddBuffer { backing: BufferBacking },
    /// The consumer withdrew a buffer.
    RemoveBuffer(BufferId),
    /// The consumer is done reading a delivered frame.
    ReleaseBuffer(BufferId),
    Pause,
    Resume,
    /// The consumer went away; the stream tears down.
    Disconnect,
}

/// A rendered frame crossing to the bus. For shared-memory buffers the
/// pixel copy rides along; DMA-BUF contents were shared out-of-band when
/// the buffer was added.
#[derive(Debug)]
pub struct FrameHandoff {
    pub buffer: BufferId,
    pub header: Vec<u8>,
    pub payload: Option<Vec<u8>>,
}

/// Receiving side of the bus, implemented by the embedder's bus bindings
/// (and by [`Loopback`] in tests). All methods run on the worker thread for
/// spawned connections.
pub trait FrameSink: Send {
    /// A stream appeared under `node_id`; consumer actions for it are to be
    /// sent through `events`.
    fn stream_added(&mut self, node_id: u32, events: calloop::channel::Sender<ConsumerEvent>);

    /// A new or revised format offer for the stream.
    fn offer(&mut self, node_id: u32, offer: NegotiationOffer);

    /// The pool registered a consumer buffer under `buffer`.
    fn buffer_added(&mut self, node_id: u32, buffer: BufferId);

    /// A frame was handed to the consumer.
    fn frame(&mut self, node_id: u32, frame: FrameHandoff);

    /// The stream is gone.
    fn stream_removed(&mut self, node_id: u32);
}

enum WorkerMessage {
    StreamAdded(u32, calloop::channel::Sender<ConsumerEvent>),
    Offer(u32, NegotiationOffer),
    BufferAdded(u32, BufferId),
    Frame(u32, FrameHandoff),
    StreamRemoved(u32),
    Shutdown,
}

enum Backend {
    /// Bus on its own thread, fed through an unbounded queue.
    Threaded {
        queue: mpsc::Sender<WorkerMessage>,
        thread: Option<JoinHandle<()>>,
    },
    /// Synchronous delivery, for tests.
    Direct { sink: Box<dyn FrameSink> },
}

struct ConnectionInner {
    backend: Backend,
    next_node: u32,
}

/// A live connection to the capture bus, shared by all streams and cached
/// weakly by [`CaptureState`](super::CaptureState).
pub struct CaptureConnection {
    inner: Mutex<ConnectionInner>,
}

impl fmt::Debug for CaptureConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock().unwrap();
        let kind = match inner.backend {
            Backend::Threaded { .. } => "threaded",
            Backend::Direct { .. } => "direct",
        };
        f.debug_struct("CaptureConnection")
            .field("backend", &kind)
            .field("next_node", &inner.next_node)
            .finish()
    }
}

impl CaptureConnection {
    /// Connect to the bus: spawn the worker thread owning `sink`.
    pub fn spawn(sink: Box<dyn FrameSink>) -> io::Result<Arc<Self>> {
        let (queue, rx) = mpsc::channel();
        let thread = std::thread::Builder::new()
            .name("capture-bus".into())
            .spawn(move || worker(rx, sink))?;
        Ok(Arc::new(CaptureConnection {
            inner: Mutex::new(ConnectionInner {
                backend: Backend::Threaded {
                    queue,
                    thread: Some(thread),
                },
                next_node: 1,
            }),
        }))
    }

    /// Synchronous connection without a worker thread.
    pub fn direct(sink: Box<dyn FrameSink>) -> Arc<Self> {
        Arc::new(CaptureConnection {
            inner: Mutex::new(ConnectionInner {
                backend: Backend::Direct { sink },
                next_node: 1,
            }),
        })
    }

    /// Register a stream on the bus, returning its link, its node id, and
    /// the channel carrying the consumer's actions back to the main loop.
    pub(crate) fn new_link(
        self: &Arc<Self>,
    ) -> (StreamLink, u32, calloop::channel::Channel<ConsumerEvent>) {
        let node_id = {
            let mut inner = self.inner.lock().unwrap();
            let id = inner.next_node;
            inner.next_node += 1;
            id
        };
        let (sender, channel) = calloop::channel::channel();
        self.send(WorkerMessage::StreamAdded(node_id, sender));
        let link = StreamLink {
            connection: Arc::clone(self),
            node_id,
        };
        (link, node_id, channel)
    }

    fn send(&self, message: WorkerMessage) {
        let mut inner = self.inner.lock().unwrap();
        match &mut inner.backend {
            Backend::Threaded { queue, .. } => {
                if queue.send(message).is_err() {
                    debug!("capture bus worker is gone");
                }
            }
            Backend::Direct { sink } => deliver(sink.as_mut(), message),
        }
    }
}

impl Drop for CaptureConnection {
    fn drop(&mut self) {
        let mut inner = self.inner.lock().unwrap();
        if let Backend::Threaded { queue, thread } = &mut inner.backend {
            let _ = queue.send(WorkerMessage::Shutdown);
            if let Some(thread) = thread.take() {
                let _ = thread.join();
            }
        }
    }
}

fn deliver(sink: &mut dyn FrameSink, message: WorkerMessage) {
    match message {
        WorkerMessage::StreamAdded(node, events) => sink.stream_added(node, events),
        WorkerMessage::Offer(node, offer) => sink.offer(node, offer),
        WorkerMessage::BufferAdded(node, buffer) => sink.buffer_added(node, buffer),
        WorkerMessage::Frame(node, frame) => sink.frame(node, frame),
        WorkerMessage::StreamRemoved(node) => sink.stream_removed(node),
        WorkerMessage::Shutdown => {}
    }
}

fn worker(rx: mpsc::Receiver<WorkerMessage>, mut sink: Box<dyn FrameSink>) {
    while let Ok(message) = rx.recv() {
        if matches!(message, WorkerMessage::Shutdown) {
            break;
        }
        deliver(sink.as_mut(), message);
    }
    trace!("capture bus worker exiting");
}

/// Per-stream handle to the bus. Everything is fire-and-forget; a dead bus
/// shows up as a consumer disconnect, never as an error here.
pub(crate) struct StreamLink {
    connection: Arc<CaptureConnection>,
    node_id: u32,
}

impl fmt::Debug for StreamLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamLink").field("node_id", &self.node_id).finish()
    }
}

impl StreamLink {
    pub fn node_id(&self) -> u32 {
        self.node_id
    }

    pub fn send_offer(&self, offer: NegotiationOffer) {
        self.connection.send(WorkerMessage::Offer(self.node_id, offer));
    }

    pub fn buffer_added(&self, buffer: BufferId) {
        self.connection
            .send(WorkerMessage::BufferAdded(self.node_id, buffer));
    }

    pub fn send_frame(&self, frame: FrameHandoff) {
        self.connection.send(WorkerMessage::Frame(self.node_id, frame));
    }

    pub fn close(&self) {
        self.connection
            .send(WorkerMessage::StreamRemoved(self.node_id));
    }
}

#[derive(Default)]
struct LoopbackShared {
    senders: HashMap<u32, calloop::channel::Sender<ConsumerEvent>>,
    offers: Vec<(u32, NegotiationOffer)>,
    buffers: Vec<(u32, BufferId)>,
    frames: Vec<(u32, FrameHandoff)>,
    removed: Vec<u32>,
}

/// In-process consumer stand-in. Create one with [`Loopback::new`], hand
/// the connection to the handler's `open_connection`, then drive streams by
/// injecting [`ConsumerEvent`]s and inspecting the recorded traffic.
#[derive(Clone, Default)]
pub struct Loopback {
    shared: Arc<Mutex<LoopbackShared>>,
}

impl fmt::Debug for Loopback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shared = self.shared.lock().unwrap();
        f.debug_struct("Loopback")
            .field("streams", &shared.senders.len())
            .field("frames", &shared.frames.len())
            .finish()
    }
}

struct LoopbackSink(Arc<Mutex<LoopbackShared>>);

impl FrameSink for LoopbackSink {
    fn stream_added(&mut self, node_id: u32, events: calloop::channel::Sender<ConsumerEvent>) {
        self.0.lock().unwrap().senders.insert(node_id, events);
    }

    fn offer(&mut self, node_id: u32, offer: NegotiationOffer) {
        self.0.lock().unwrap().offers.push((node_id, offer));
    }

    fn buffer_added(&mut self, node_id: u32, buffer: BufferId) {
        self.0.lock().unwrap().buffers.push((node_id, buffer));
    }

    fn frame(&mut self, node_id: u32, frame: FrameHandoff) {
        self.0.lock().unwrap().frames.push((node_id, frame));
    }

    fn stream_removed(&mut self, node_id: u32) {
        let mut shared = self.0.lock().unwrap();
        shared.senders.remove(&node_id);
        shared.removed.push(node_id);
    }
}

impl Loopback {
    /// A synchronous connection plus the handle for driving it.
    pub fn new() -> (Arc<CaptureConnection>, Loopback) {
        let loopback = Loopback::default();
        let sink = LoopbackSink(loopback.shared.clone());
        (CaptureConnection::direct(Box::new(sink)), loopback)
    }

    /// Act as the consumer: send an event to the stream under `node_id`.
    /// Returns `false` if the stream is unknown or already torn down.
    pub fn send(&self, node_id: u32, event: ConsumerEvent) -> bool {
        let shared = self.shared.lock().unwrap();
        match shared.senders.get(&node_id) {
            Some(sender) => sender.send(event).is_ok(),
            None => false,
        }
    }

    /// Offers recorded so far, oldest first. Consumed.
    pub fn take_offers(&self) -> Vec<(u32, NegotiationOffer)> {
        std::mem::take(&mut self.shared.lock().unwrap().offers)
    }

    /// Buffer registrations recorded so far. Consumed.
    pub fn take_buffers(&self) -> Vec<(u32, BufferId)> {
        std::mem::take(&mut self.shared.lock().unwrap().buffers)
    }

    /// Frames recorded so far, oldest first. Consumed.
    pub fn take_frames(&self) -> Vec<(u32, FrameHandoff)> {
        std::mem::take(&mut self.shared.lock().unwrap().frames)
    }

    /// Streams the bus saw disappear. Consumed.
    pub fn take_removed(&self) -> Vec<u32> {
        std::mem::take(&mut self.shared.lock().unwrap().removed)
    }
}
