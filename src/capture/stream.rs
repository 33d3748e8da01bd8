//! The per-stream state machine and the per-tick frame path.
//!
//! A stream is `Idle` until its consumer configures a format, `Configured`
//! until the first buffer arrives, then `Streaming` (or `Paused` on
//! consumer request) until either side closes. Consumer disconnect, source
//! closure, and the client's destroy request all funnel into the same
//! teardown.
//!
//! Sequence numbers are strictly monotonic and gapless: a tick that drops
//! its frame because no buffer was free does not consume a sequence number.

use std::time::Duration;

use smallvec::smallvec;
use thiserror::Error;
use tracing::{debug, trace};

use crate::transport::{Event, ObjectId, Transport};
use crate::utils::{Monotonic, Point, Rectangle, Size, Time};

use super::frame::{CursorMeta, DamageList, FrameMeta};
use super::negotiate::{self, FormatChoice, NegotiationOffer};
use super::pool::{BufferBacking, BufferId, BufferOwner, BufferPool};
use super::source::CaptureSource;
use super::transport::{ConsumerEvent, FrameHandoff, StreamLink};
use super::{CaptureHandler, CursorMode};

/// Per-stream failures. Contained to the stream; the owning client is
/// never disconnected over them.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("render failed: {0}")]
    RenderFailed(String),
    #[error("source closed")]
    SourceClosed,
    #[error("buffer does not match the negotiated format")]
    BadBuffer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Waiting for the consumer to pick a format.
    Idle,
    /// Format agreed, waiting for buffers.
    Configured,
    Streaming,
    Paused,
    /// Terminal.
    Closed,
}

#[derive(Debug)]
pub(crate) struct Stream {
    object: ObjectId,
    link: StreamLink,
    source: Box<dyn CaptureSource>,
    cursor_mode: CursorMode,
    state: StreamState,
    offer: NegotiationOffer,
    format: Option<FormatChoice>,
    pool: BufferPool,
    sequence: u64,
    last_emit: Option<Time<Monotonic>>,
    /// Header of the last delivered frame, for keepalive re-emission.
    last_header: Option<(BufferId, Vec<u8>)>,
    last_cursor_pos: Option<Point<i32>>,
    last_cursor_hash: Option<u64>,
    created: Time<Monotonic>,
    negotiation_timeout: Duration,
}

impl Stream {
    pub(crate) fn new(
        object: ObjectId,
        link: StreamLink,
        source: Box<dyn CaptureSource>,
        cursor_mode: CursorMode,
        offer: NegotiationOffer,
        created: Time<Monotonic>,
        negotiation_timeout: Duration,
    ) -> Self {
        Stream {
            object,
            link,
            source,
            cursor_mode,
            state: StreamState::Idle,
            offer,
            format: None,
            pool: BufferPool::new(),
            sequence: 0,
            last_emit: None,
            last_header: None,
            last_cursor_pos: None,
            last_cursor_hash: None,
            created,
            negotiation_timeout,
        }
    }

    pub(crate) fn node_id(&self) -> u32 {
        self.link.node_id()
    }

    pub(crate) fn state(&self) -> StreamState {
        self.state
    }

    pub(crate) fn dropped_frames(&self) -> u64 {
        self.pool.dropped_frames()
    }

    pub(crate) fn send_offer(&self) {
        self.link.send_offer(self.offer.clone());
    }

    fn fail(&mut self, transport: &mut Transport, reason: &str) {
        debug!(object = ?self.object, reason, "capture stream failed");
        if transport.alive(self.object) {
            let _ = transport.post_event(
                self.object,
                Event::Failed {
                    reason: reason.to_string(),
                },
            );
        }
        self.close(transport);
    }

    fn close(&mut self, transport: &mut Transport) {
        if self.state == StreamState::Closed {
            return;
        }
        if transport.alive(self.object) {
            let _ = transport.post_event(self.object, Event::Closed);
        }
        self.state = StreamState::Closed;
    }
}

/// Remove the stream for `object`, run `f` with handler access, then
/// reinsert it unless it closed. Closed streams leave the node table and
/// tell the bus.
fn with_stream<D, R>(
    state: &mut D,
    object: ObjectId,
    f: impl FnOnce(&mut D, &mut Stream) -> R,
) -> Option<R>
where
    D: CaptureHandler,
{
    let mut stream = state.capture_state().streams.remove(&object)?;
    let result = f(state, &mut stream);
    if stream.state == StreamState::Closed {
        state.capture_state().nodes.remove(&stream.node_id());
        stream.link.close();
    } else {
        state.capture_state().streams.insert(object, stream);
    }
    Some(result)
}

pub(crate) fn consumer_event<D>(
    transport: &mut Transport,
    state: &mut D,
    node_id: u32,
    event: ConsumerEvent,
) where
    D: CaptureHandler,
{
    let Some(&object) = state.capture_state().nodes.get(&node_id) else {
        debug!(node_id, "consumer event for an unknown node");
        return;
    };
    let closed = with_stream(state, object, |state, stream| {
        match event {
            ConsumerEvent::Configure(choice) => configure(transport, state, stream, choice),
            ConsumerEvent::AddBuffer { backing } => add_buffer(stream, backing),
            ConsumerEvent::RemoveBuffer(id) => stream.pool.remove_buffer(id),
            ConsumerEvent::ReleaseBuffer(id) => stream.pool.release(id),
            ConsumerEvent::Pause => {
                if stream.state == StreamState::Streaming {
                    stream.state = StreamState::Paused;
                    stream.source.pause();
                }
            }
            ConsumerEvent::Resume => {
                if stream.state == StreamState::Paused {
                    stream.state = StreamState::Streaming;
                    stream.source.resume();
                }
            }
            ConsumerEvent::Disconnect => stream.close(transport),
        }
        stream.state == StreamState::Closed
    });
    if closed == Some(true) {
        for destroyed in transport.destroy_object(object) {
            super::handle_destroyed(transport, state, destroyed.id, destroyed.interface);
        }
    }
}

fn configure<D>(transport: &mut Transport, state: &mut D, stream: &mut Stream, choice: FormatChoice)
where
    D: CaptureHandler,
{
    if let Err(err) = negotiate::validate_choice(&stream.offer, &choice) {
        debug!(%err, "rejecting consumer format choice");
        stream.send_offer();
        return;
    }

    if let Some(modifier) = choice.modifier {
        if !state.dry_run_allocate(choice.fourcc, modifier, choice.size) {
            if negotiate::remove_modifier(&mut stream.offer, choice.fourcc, modifier) {
                stream.send_offer();
            } else {
                stream.fail(transport, "no format in common with the consumer");
            }
            return;
        }
    }

    trace!(object = ?stream.object, ?choice, "stream configured");
    stream.format = Some(choice);
    stream.pool = BufferPool::new();
    stream.state = StreamState::Configured;
}

fn add_buffer(stream: &mut Stream, backing: BufferBacking) {
    let Some(format) = stream.format else {
        debug!("buffer added to an unconfigured stream");
        return;
    };
    let stride = match &backing {
        BufferBacking::Shm { data } => {
            let stride = negotiate::shm_stride(format.fourcc, format.size.w);
            if data.len() < (stride as usize) * format.size.h.max(0) as usize {
                debug!("undersized shm buffer rejected");
                return;
            }
            stride
        }
        BufferBacking::Dmabuf { planes, .. } => match planes.first() {
            Some(plane) => plane.stride,
            None => {
                debug!("dmabuf without planes rejected");
                return;
            }
        },
    };
    let id = stream.pool.add_buffer(backing, format.size, stride, format.fourcc);
    stream.link.buffer_added(id);
    if stream.state == StreamState::Configured {
        stream.state = StreamState::Streaming;
    }
}

pub(crate) fn tick_all<D>(transport: &mut Transport, state: &mut D)
where
    D: CaptureHandler,
{
    let cap = state.capture_state();
    let now = cap.clock.now();
    let keepalive = cap.keepalive_interval;
    let objects: Vec<ObjectId> = cap.streams.keys().copied().collect();

    for object in objects {
        let closed = with_stream(state, object, |state, stream| {
            tick_stream(transport, state, stream, now, keepalive);
            stream.state == StreamState::Closed
        });
        if closed == Some(true) {
            for destroyed in transport.destroy_object(object) {
                super::handle_destroyed(transport, state, destroyed.id, destroyed.interface);
            }
        }
    }
}

#[profiling::function]
fn tick_stream<D>(
    transport: &mut Transport,
    state: &mut D,
    stream: &mut Stream,
    now: Time<Monotonic>,
    keepalive: Option<Duration>,
) where
    D: CaptureHandler,
{
    match stream.state {
        StreamState::Streaming => {}
        StreamState::Idle | StreamState::Configured => {
            if now.duration_since(stream.created) > stream.negotiation_timeout
                && stream.state == StreamState::Idle
            {
                stream.fail(transport, "negotiation timeout");
            }
            return;
        }
        StreamState::Paused | StreamState::Closed => return,
    }

    if stream.source.closed() {
        stream.close(transport);
        return;
    }

    let timestamp = stream.source.clock();
    let mut damage = stream.source.next_damage();
    if stream.sequence == 0 {
        // Nothing delivered yet; the consumer needs one full frame to
        // start from.
        damage = smallvec![Rectangle::from_size(stream.source.texture_size())];
    }

    let snapshot = if stream.cursor_mode != CursorMode::Hidden {
        state
            .cursor_snapshot()
            .filter(|s| stream.source.includes_cursor(s.position))
    } else {
        None
    };
    let mapped_pos = snapshot.as_ref().map(|s| stream.source.map_cursor(s.position));
    let bitmap_hash = snapshot
        .as_ref()
        .and_then(|s| s.bitmap.as_ref())
        .map(|b| b.content_hash());
    let cursor_changed = mapped_pos != stream.last_cursor_pos
        || (stream.cursor_mode == CursorMode::Metadata && bitmap_hash != stream.last_cursor_hash);

    if damage.is_empty() && !cursor_changed {
        // Keepalive: consumers time out on silent streams, so the previous
        // frame is re-emitted once the configured interval passed. Only
        // while the consumer still holds that buffer: once it was released
        // it may be mid-render again, and the stale header would alias an
        // in-flight write.
        if let (Some(interval), Some(last_emit), Some((buffer, header))) =
            (keepalive, stream.last_emit, stream.last_header.as_ref())
        {
            let held = stream
                .pool
                .get(*buffer)
                .is_some_and(|b| b.owner() == BufferOwner::Consumer);
            if held && now.duration_since(last_emit) >= interval {
                stream.link.send_frame(FrameHandoff {
                    buffer: *buffer,
                    header: header.clone(),
                    payload: None,
                });
                stream.last_emit = Some(now);
            }
        }
        return;
    }

    if stream.cursor_mode == CursorMode::Embedded && cursor_changed {
        // The cursor's old and new footprints need repainting even without
        // scene damage.
        let full = Rectangle::from_size(stream.source.texture_size());
        let footprint = |pos: Point<i32>| {
            let size = snapshot
                .as_ref()
                .and_then(|s| s.bitmap.as_ref())
                .map(|b| b.size)
                .unwrap_or_else(|| Size::from((64, 64)));
            let hotspot = snapshot.as_ref().map(|s| s.hotspot).unwrap_or_default();
            Rectangle::new(pos - hotspot, size).intersection(&full)
        };
        if let Some(rect) = stream.last_cursor_pos.and_then(|p| footprint(p)) {
            damage.push(rect);
        }
        if let Some(rect) = mapped_pos.and_then(|p| footprint(p)) {
            damage.push(rect);
        }
    }

    let Some(buffer) = stream.pool.acquire_free() else {
        trace!(object = ?stream.object, "no free buffer, dropping frame");
        stream.pool.record_drop();
        return;
    };
    let buffer_id = buffer.id();

    let embedded = if stream.cursor_mode == CursorMode::Embedded {
        snapshot.as_ref()
    } else {
        None
    };
    if let Err(err) = stream.source.render(buffer, &damage, embedded) {
        debug!(%err, "render failed, dropping frame");
        stream.pool.abandon(buffer_id);
        stream.pool.record_drop();
        return;
    }

    // Metadata mode always carries the cursor block; an off-source cursor
    // reads as position (-1, -1).
    let cursor_meta = if stream.cursor_mode == CursorMode::Metadata {
        Some(CursorMeta {
            position: mapped_pos.unwrap_or_else(|| Point::from((-1, -1))),
            hotspot: snapshot.as_ref().map(|s| s.hotspot).unwrap_or_default(),
            bitmap: match (bitmap_hash, stream.last_cursor_hash) {
                (Some(hash), Some(previous)) if hash == previous => None,
                _ => snapshot.as_ref().and_then(|s| s.bitmap.clone()),
            },
        })
    } else {
        None
    };

    let format = stream.format.expect("streaming without a negotiated format");
    let buffer = stream.pool.get(buffer_id).unwrap();
    let meta = FrameMeta {
        sequence: stream.sequence + 1,
        timestamp_ns: timestamp.as_nanos(),
        size: buffer.size(),
        stride: buffer.stride(),
        fourcc: format.fourcc,
        damage: normalize_damage(damage, buffer.size()),
        cursor: cursor_meta,
    };
    let header = meta.encode();
    let payload = buffer.shm_data().map(|d| d.to_vec());

    stream.pool.to_consumer(buffer_id);
    stream.link.send_frame(FrameHandoff {
        buffer: buffer_id,
        header: header.clone(),
        payload,
    });

    stream.sequence += 1;
    stream.last_emit = Some(now);
    stream.last_header = Some((buffer_id, header));
    stream.last_cursor_pos = mapped_pos;
    if bitmap_hash.is_some() {
        stream.last_cursor_hash = bitmap_hash;
    }
}

/// Clamp damage to the buffer and drop empty rects.
fn normalize_damage(damage: DamageList, size: Size<i32>) -> DamageList {
    let full = Rectangle::from_size(size);
    damage
        .into_iter()
        .filter_map(|rect| rect.intersection(&full))
        .filter(|rect| !rect.size.is_empty())
        .collect()
}

/// Teardown entry used by [`super::session`] when the wire object dies.
pub(crate) fn teardown<D>(transport: &mut Transport, state: &mut D, object: ObjectId)
where
    D: CaptureHandler,
{
    with_stream(state, object, |_, stream| {
        stream.close(transport);
    });
}
