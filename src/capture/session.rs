//! Stream setup and teardown.
//!
//! A failed setup never disconnects the client: the stream object is
//! created, told `failed(reason)` followed by `closed`, and left for the
//! client to destroy. Only a bad `new_id` is a protocol error.

use tracing::{debug, info};

use crate::transport::{Event, Interface, NewId, ObjectId, ProtocolError, Transport};

use super::negotiate;
use super::{CaptureHandler, CaptureState, CaptureTarget, CursorMode, Stream, stream};

pub(super) fn capture<D>(
    transport: &mut Transport,
    state: &mut D,
    manager: ObjectId,
    id: NewId,
    target: CaptureTarget,
    cursor_mode: CursorMode,
) where
    D: CaptureHandler,
{
    let object = match transport.create_child(manager, Interface::CaptureStream, id) {
        Ok(object) => object,
        Err(err) => {
            transport.post_error(
                manager,
                ProtocolError::InvalidNewId,
                format!("bad stream id: {err}"),
            );
            return;
        }
    };

    if !state.permit_capture(manager.client, &target) {
        debug!(client = ?manager.client, ?target, "capture denied");
        fail(transport, object, "capture not permitted");
        return;
    }

    let source = match target {
        CaptureTarget::Output(output) => state.output_source(output),
        CaptureTarget::Window(window) => state.window_source(window),
        CaptureTarget::Region { rect, scale } => state.region_source(rect, scale),
    };
    let source = match source {
        Some(source) => source,
        None => {
            fail(transport, object, "capture target does not exist");
            return;
        }
    };

    let connection = match CaptureState::connection(state) {
        Ok(connection) => connection,
        Err(err) => {
            fail(transport, object, &format!("capture bus unavailable: {err}"));
            return;
        }
    };
    let (link, node_id, events) = connection.new_link();

    let modifiers = state.render_modifiers(source.pixel_format());
    let offer = negotiate::offer_for(source.as_ref(), &modifiers);

    let cap = state.capture_state();
    let stream = Stream::new(
        object,
        link,
        source,
        cursor_mode,
        offer,
        cap.clock.now(),
        cap.negotiation_timeout,
    );

    let _ = transport.post_event(object, Event::Created { node_id });
    stream.send_offer();

    info!(?object, node_id, ?target, ?cursor_mode, "capture stream created");
    cap.streams.insert(object, stream);
    cap.nodes.insert(node_id, object);
    state.stream_ready(node_id, events);
}

pub(super) fn stream_destroyed<D>(transport: &mut Transport, state: &mut D, object: ObjectId)
where
    D: CaptureHandler,
{
    stream::teardown(transport, state, object);
}

fn fail(transport: &mut Transport, object: ObjectId, reason: &str) {
    let _ = transport.post_event(
        object,
        Event::Failed {
            reason: reason.to_string(),
        },
    );
    let _ = transport.post_event(object, Event::Closed);
}
