//! Screen capture pipeline.
//!
//! Clients open capture streams on outputs, windows, or screen regions
//! through the `capture_manager` global. Frames do not travel over the
//! protocol transport: each stream gets a node on an external multimedia
//! bus, announced to the client as `created(node_id)`, and the pixel path
//! runs through that bus. The bus side lives on its own worker thread; the
//! compositor talks to it exclusively through a [`transport::StreamLink`],
//! so no protocol state is ever touched off the main loop.
//!
//! The compositor owns a [`CaptureState`] and implements [`CaptureHandler`]
//! on its global state. Scene integration happens through the
//! [`CaptureSource`] trait and its adapters in [`source`]; the embedder
//! drives the per-frame path by calling [`tick`] on every presentation tick
//! and feeds bus events back through [`consumer_event`].

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Weak};
use std::time::Duration;

use drm_fourcc::{DrmFourcc, DrmModifier};
use tracing::debug;

use crate::transport::{
    ClientId, GlobalId, Interface, ObjectId, Request, Transport,
};
use crate::utils::{Clock, Monotonic, Rectangle, Size};

pub(crate) mod frame;
pub(crate) mod negotiate;
pub(crate) mod pool;
mod session;
pub mod source;
mod stream;
pub mod transport;

pub use frame::{CursorBitmap, CursorMeta, DamageList, FrameDecodeError, FrameMeta};
pub use negotiate::{FormatCandidate, FormatChoice, NegotiationError, NegotiationOffer};
pub use pool::{BufferBacking, BufferId, BufferOwner, BufferPool, CaptureBuffer, DmabufPlane};
pub use source::{
    CaptureSource, CursorSnapshot, OutputFrames, OutputSource, RegionSource, WindowFrames,
    WindowSource,
};
pub use stream::{StreamError, StreamState};
pub use transport::{CaptureConnection, ConsumerEvent, FrameHandoff, FrameSink, Loopback};

pub(crate) use stream::Stream;

/// Opaque output handle, provided by the embedding compositor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OutputId(pub u64);

/// Opaque window handle, provided by the embedding compositor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WindowId(pub u64);

/// How the cursor appears in captured frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum CursorMode {
    /// Cursor neither rendered nor reported.
    Hidden = 1,
    /// Cursor composited into the buffer pixels.
    Embedded = 2,
    /// Buffer pixels are cursor-free; position, hotspot and bitmap travel
    /// in the frame metadata.
    Metadata = 4,
}

impl CursorMode {
    /// Parse the wire value.
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            1 => Some(CursorMode::Hidden),
            2 => Some(CursorMode::Embedded),
            4 => Some(CursorMode::Metadata),
            _ => None,
        }
    }
}

/// What a capture request points at, for authorization decisions.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CaptureTarget {
    Output(OutputId),
    Window(WindowId),
    Region { rect: Rectangle<i32>, scale: f64 },
}

/// Handler trait for the capture subsystem.
pub trait CaptureHandler: Sized + 'static {
    /// [`CaptureState`] getter.
    fn capture_state(&mut self) -> &mut CaptureState;

    /// Decide whether `client` may capture `target`. A denial fails the
    /// stream with a diagnostic; it is not a protocol error.
    fn permit_capture(&mut self, client: ClientId, target: &CaptureTarget) -> bool {
        let _ = (client, target);
        true
    }

    /// Build a source for a whole output, `None` if the output is unknown.
    fn output_source(&mut self, output: OutputId) -> Option<Box<dyn CaptureSource>>;

    /// Build a source for a window, `None` if the window is unknown.
    fn window_source(&mut self, window: WindowId) -> Option<Box<dyn CaptureSource>>;

    /// Build a source compositing the given global-coordinate region.
    fn region_source(&mut self, rect: Rectangle<i32>, scale: f64) -> Option<Box<dyn CaptureSource>>;

    /// Open a connection to the capture bus. Called lazily on the first
    /// stream and again whenever the cached connection died.
    fn open_connection(&mut self) -> io::Result<Arc<CaptureConnection>>;

    /// A stream went live; insert `events` into the event loop and feed
    /// everything it yields into [`consumer_event`] with this `node_id`.
    fn stream_ready(&mut self, node_id: u32, events: calloop::channel::Channel<ConsumerEvent>);

    /// Dry-run allocate a DMA-BUF with the given format to verify the
    /// modifier actually works on this device. The conservative default
    /// rejects, forcing renegotiation towards shared memory.
    fn dry_run_allocate(&mut self, fourcc: DrmFourcc, modifier: DrmModifier, size: Size<i32>) -> bool {
        let _ = (fourcc, modifier, size);
        false
    }

    /// Current cursor state in global coordinates, `None` while hidden.
    fn cursor_snapshot(&mut self) -> Option<CursorSnapshot> {
        None
    }

    /// DMA-BUF modifiers the renderer can produce for `fourcc`. An empty
    /// list offers only shared memory.
    fn render_modifiers(&mut self, fourcc: DrmFourcc) -> Vec<DrmModifier> {
        let _ = fourcc;
        Vec::new()
    }
}

/// Delegate state of the capture subsystem.
#[derive(Debug)]
pub struct CaptureState {
    pub(crate) streams: HashMap<ObjectId, Stream>,
    pub(crate) nodes: HashMap<u32, ObjectId>,
    pub(crate) connection: Weak<CaptureConnection>,
    pub(crate) clock: Clock<Monotonic>,
    pub(crate) negotiation_timeout: Duration,
    pub(crate) keepalive_interval: Option<Duration>,
    global: Option<GlobalId>,
}

impl Default for CaptureState {
    fn default() -> Self {
        Self::new()
    }
}

impl CaptureState {
    pub fn new() -> Self {
        CaptureState {
            streams: HashMap::new(),
            nodes: HashMap::new(),
            connection: Weak::new(),
            clock: Clock::new(),
            negotiation_timeout: Duration::from_secs(5),
            keepalive_interval: None,
            global: None,
        }
    }

    /// Override the format negotiation deadline (default 5 s). Consumers
    /// cannot influence this; it only bounds how long an unconfigured
    /// stream may linger.
    pub fn with_negotiation_timeout(mut self, timeout: Duration) -> Self {
        self.negotiation_timeout = timeout;
        self
    }

    /// Re-emit the previous frame after `interval` without damage, keeping
    /// slow consumers alive. Off by default.
    pub fn with_keepalive(mut self, interval: Duration) -> Self {
        self.keepalive_interval = Some(interval);
        self
    }

    /// Publish the `capture_manager` global.
    pub fn create_global(&mut self, transport: &mut Transport) {
        self.global = Some(transport.create_global(Interface::CaptureManager, 1));
    }

    /// The `capture_manager` global, once created.
    pub fn global(&self) -> Option<GlobalId> {
        self.global
    }

    /// Dropped-frame diagnostic counter of the stream behind `node_id`.
    pub fn dropped_frames(&self, node_id: u32) -> Option<u64> {
        let object = self.nodes.get(&node_id)?;
        self.streams.get(object).map(|s| s.dropped_frames())
    }

    /// State of the stream behind `node_id`.
    pub fn stream_state(&self, node_id: u32) -> Option<StreamState> {
        let object = self.nodes.get(&node_id)?;
        self.streams.get(object).map(|s| s.state())
    }

    pub(crate) fn connection<D>(state: &mut D) -> io::Result<Arc<CaptureConnection>>
    where
        D: CaptureHandler,
    {
        if let Some(connection) = state.capture_state().connection.upgrade() {
            return Ok(connection);
        }
        let connection = state.open_connection()?;
        state.capture_state().connection = Arc::downgrade(&connection);
        Ok(connection)
    }
}

/// Route a request for one of the capture interfaces.
pub(crate) fn handle_request<D>(
    transport: &mut Transport,
    state: &mut D,
    object: ObjectId,
    request: Request,
) where
    D: CaptureHandler,
{
    match request {
        Request::CaptureOutput {
            id,
            output,
            cursor_mode,
        } => session::capture(
            transport,
            state,
            object,
            id,
            CaptureTarget::Output(output),
            cursor_mode,
        ),
        Request::CaptureWindow {
            id,
            window,
            cursor_mode,
        } => session::capture(
            transport,
            state,
            object,
            id,
            CaptureTarget::Window(window),
            cursor_mode,
        ),
        Request::CaptureRegion {
            id,
            rect,
            scale,
            cursor_mode,
        } => session::capture(
            transport,
            state,
            object,
            id,
            CaptureTarget::Region { rect, scale },
            cursor_mode,
        ),
        Request::DestroyStream => {
            for destroyed in transport.destroy_object(object) {
                handle_destroyed(transport, state, destroyed.id, destroyed.interface);
            }
        }
        _ => unreachable!("non-capture request routed to the capture module"),
    }
}

/// Run the per-kind destructor for a destroyed capture object.
pub(crate) fn handle_destroyed<D>(
    transport: &mut Transport,
    state: &mut D,
    object: ObjectId,
    interface: Interface,
) where
    D: CaptureHandler,
{
    match interface {
        Interface::CaptureStream => session::stream_destroyed(transport, state, object),
        Interface::CaptureManager => {}
        _ => debug!(?object, ?interface, "non-capture object routed to capture destructor"),
    }
}

/// Apply one bus event to the stream behind `node_id`.
pub fn consumer_event<D>(
    transport: &mut Transport,
    state: &mut D,
    node_id: u32,
    event: ConsumerEvent,
) where
    D: CaptureHandler,
{
    stream::consumer_event(transport, state, node_id, event)
}

/// Drive every stream one presentation tick: damage collection, buffer
/// acquisition, render, and hand-off, exactly once per stream.
pub fn tick<D>(transport: &mut Transport, state: &mut D)
where
    D: CaptureHandler,
{
    stream::tick_all(transport, state)
}
