//! **Quench** is a library for building the data-transfer side of a
//! compositor: clipboard and primary selections, drag-and-drop, and screen
//! capture, as self-contained state machines over a small in-process
//! protocol transport.
//!
//! ## Structure
//!
//! The crate is split into four modules:
//!
//! - [`transport`]: the message broker. Clients own typed protocol objects
//!   with generation-checked ids; requests come in through [`dispatch`],
//!   events queue per client and are drained by the embedder's connection
//!   layer. A protocol error dooms the offending client without touching
//!   the others.
//! - [`selection`]: clipboard and primary selection, the privileged
//!   control-device interface, and the drag-and-drop grab, one
//!   [`SelectionState`](selection::SelectionState) for all seats.
//! - [`capture`]: output, window, and region capture streams. Pixels travel
//!   over an external multimedia bus rather than the transport; the
//!   embedder drives the frame path one [`capture::tick`] per presentation.
//! - [`utils`]: serials, clocks, and 2D geometry shared by the rest.
//!
//! The embedding compositor implements
//! [`SelectionHandler`](selection::SelectionHandler) and
//! [`CaptureHandler`](capture::CaptureHandler) on its global state and owns
//! the event loop; this crate never spawns threads behind its back except
//! for the capture bus worker, which only ever talks through a channel.

#![warn(missing_debug_implementations)]
#![allow(clippy::large_enum_variant)]

pub mod capture;
pub mod selection;
pub mod transport;
pub mod utils;

use tracing::debug;

use capture::CaptureHandler;
use selection::SelectionHandler;
use transport::{Interface, ObjectId, ProtocolError, Request, Transport};

/// Route one client request to the owning subsystem.
///
/// A request on an unknown object or one its interface does not carry is a
/// protocol error; the client is doomed and should be disconnected with
/// [`client_disconnected`] once its error event is flushed.
pub fn dispatch<D>(transport: &mut Transport, state: &mut D, object: ObjectId, request: Request)
where
    D: SelectionHandler + CaptureHandler,
{
    let interface = match transport.interface(object) {
        Ok(interface) => interface,
        Err(err) => {
            debug!(?object, %err, "request on a dead object");
            transport.post_error(
                object,
                ProtocolError::InvalidObject,
                "request on an unknown object",
            );
            return;
        }
    };
    if !request.valid_on(interface) {
        transport.post_error(
            object,
            ProtocolError::InvalidObject,
            format!("request not supported on {interface:?}"),
        );
        return;
    }
    let since = request.since(interface);
    if transport.version(object).is_ok_and(|version| version < since) {
        transport.post_error(
            object,
            ProtocolError::InvalidMethod,
            format!("request requires {interface:?} version {since}"),
        );
        return;
    }

    match interface {
        Interface::CaptureManager | Interface::CaptureStream => {
            capture::handle_request(transport, state, object, request)
        }
        _ => selection::handle_request(transport, state, object, request),
    }
}

/// Tear down everything a departing client owned, running the per-kind
/// destructors exactly as if each object had been destroyed individually.
pub fn client_disconnected<D>(transport: &mut Transport, state: &mut D, client: transport::ClientId)
where
    D: SelectionHandler + CaptureHandler,
{
    for destroyed in transport.disconnect_client(client) {
        match destroyed.interface {
            Interface::CaptureManager | Interface::CaptureStream => {
                capture::handle_destroyed(transport, state, destroyed.id, destroyed.interface)
            }
            _ => selection::handle_destroyed(transport, state, destroyed.id, destroyed.interface),
        }
    }
}
