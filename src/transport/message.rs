//! Typed messages crossing the transport.
//!
//! The broker is not a general purpose IPC bus: the set of interfaces it can
//! host is the closed [`Interface`](super::Interface) enum, and requests and
//! events are plain Rust enums. File descriptors travel through them as
//! [`OwnedFd`] values, transferring ownership on every crossing.

use std::os::fd::OwnedFd;

use crate::capture::{CursorMode, OutputId, WindowId};
use crate::selection::{DndAction, SurfaceId};
use crate::utils::{Point, Rectangle, Serial};

use super::{Interface, ObjectId};

/// A client-chosen id for an object created by a request.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct NewId(pub u32);

/// A request sent by a client to one of its objects.
///
/// Each variant is only valid on the interface noted in its documentation;
/// dispatching a request to an object of another interface is a protocol
/// violation and disconnects the client.
#[derive(Debug)]
pub enum Request {
    /// `seat_selection_manager` / `control_manager`: create a data source.
    CreateSource {
        /// Id for the new `data_source`
        id: NewId,
    },
    /// `seat_selection_manager`: obtain the data device for a seat.
    GetDevice {
        /// Id for the new `data_device`
        id: NewId,
        /// Seat the device is attached to
        seat: crate::selection::SeatId,
    },
    /// `control_manager`: obtain the privileged control device for a seat.
    GetControlDevice {
        /// Id for the new `control_device`
        id: NewId,
        /// Seat the device is attached to
        seat: crate::selection::SeatId,
    },

    /// `data_source`: append a mime type to the offered set.
    Offer {
        /// The advertised mime type
        mime_type: String,
    },
    /// `data_source`: set the supported and preferred drag-and-drop actions.
    SetSourceActions {
        /// Bitmask of supported actions
        dnd_actions: u32,
        /// Single preferred action
        preferred_action: u32,
    },
    /// `data_source`: destroy the source.
    DestroySource,

    /// `data_device`: start a drag-and-drop grab.
    StartDrag {
        /// The dragged content, `None` for a same-client drag
        source: Option<ObjectId>,
        /// Surface where the drag originates
        origin: SurfaceId,
        /// Optional drag icon surface
        icon: Option<SurfaceId>,
        /// Serial of the implicit grab that justifies the drag
        serial: Serial,
    },
    /// `data_device`: set the clipboard selection.
    SetSelection {
        /// The new source, `None` to clear
        source: Option<ObjectId>,
        /// Serial proving recent offer-setting privilege
        serial: Serial,
    },
    /// `data_device`: set the primary selection.
    SetPrimarySelection {
        /// The new source, `None` to clear
        source: Option<ObjectId>,
        /// Serial proving recent offer-setting privilege
        serial: Serial,
    },
    /// `data_device` / `control_device`: release the device.
    Release,

    /// `data_offer`: accept (or reject with `None`) a mime type.
    Accept {
        /// Serial of the enter event being answered
        serial: Serial,
        /// Accepted mime type, `None` rejects the offer
        mime_type: Option<String>,
    },
    /// `data_offer`: ask for the content in the given mime type.
    Receive {
        /// Requested mime type
        mime_type: String,
        /// Write end the source owner will write into
        fd: OwnedFd,
    },
    /// `data_offer`: conclude a successful drag-and-drop transfer.
    Finish,
    /// `data_offer`: set the actions the receiver supports.
    SetOfferActions {
        /// Bitmask of supported actions
        dnd_actions: u32,
        /// Single preferred action
        preferred_action: u32,
    },
    /// `data_offer`: destroy the offer.
    DestroyOffer,

    /// `control_device`: replace the clipboard selection, no serial needed.
    ControlSetSelection {
        /// The new source, `None` to clear
        source: Option<ObjectId>,
    },
    /// `control_device`: replace the primary selection, no serial needed.
    ControlSetPrimarySelection {
        /// The new source, `None` to clear
        source: Option<ObjectId>,
    },

    /// `capture_manager`: capture an output.
    CaptureOutput {
        /// Id for the new `capture_stream`
        id: NewId,
        /// The output to capture
        output: OutputId,
        /// Requested cursor mode
        cursor_mode: CursorMode,
    },
    /// `capture_manager`: capture a window.
    CaptureWindow {
        /// Id for the new `capture_stream`
        id: NewId,
        /// The window to capture
        window: WindowId,
        /// Requested cursor mode
        cursor_mode: CursorMode,
    },
    /// `capture_manager`: capture a screen region.
    CaptureRegion {
        /// Id for the new `capture_stream`
        id: NewId,
        /// The region in global compositor coordinates
        rect: Rectangle<i32>,
        /// Scale factor of the produced frames
        scale: f64,
        /// Requested cursor mode
        cursor_mode: CursorMode,
    },
    /// `capture_stream`: destroy the stream.
    DestroyStream,
}

impl Request {
    /// The interface this request may be dispatched to.
    ///
    /// Requests valid on several interfaces return the full admissible set.
    pub(crate) fn valid_on(&self, interface: Interface) -> bool {
        use Interface::*;
        match self {
            Request::CreateSource { .. } => {
                matches!(interface, SeatSelectionManager | ControlManager)
            }
            Request::GetDevice { .. } => interface == SeatSelectionManager,
            Request::GetControlDevice { .. } => interface == ControlManager,
            Request::Offer { .. } | Request::SetSourceActions { .. } | Request::DestroySource => {
                interface == DataSource
            }
            Request::StartDrag { .. }
            | Request::SetSelection { .. }
            | Request::SetPrimarySelection { .. } => interface == DataDevice,
            Request::Release => matches!(interface, DataDevice | ControlDevice),
            Request::Accept { .. }
            | Request::Receive { .. }
            | Request::Finish
            | Request::SetOfferActions { .. }
            | Request::DestroyOffer => interface == DataOffer,
            Request::ControlSetSelection { .. } | Request::ControlSetPrimarySelection { .. } => {
                interface == ControlDevice
            }
            Request::CaptureOutput { .. }
            | Request::CaptureWindow { .. }
            | Request::CaptureRegion { .. } => interface == CaptureManager,
            Request::DestroyStream => interface == CaptureStream,
        }
    }

    /// Minimal interface version required to send this request.
    ///
    /// The mirror of [`Event::since`]: a client bound below this version
    /// never learned the request exists, so sending it is a protocol error.
    pub(crate) fn since(&self, interface: Interface) -> u32 {
        match self {
            Request::Finish | Request::SetOfferActions { .. } => 3,
            Request::SetSourceActions { .. } => 3,
            // Control devices gained the primary selection in v2.
            Request::ControlSetPrimarySelection { .. }
                if interface == Interface::ControlDevice =>
            {
                2
            }
            _ => 1,
        }
    }
}

/// An event emitted by the compositor towards a client object.
#[derive(Debug)]
pub enum Event {
    // data_source
    /// A receiver asked for the content; write into `fd` and close it.
    Send {
        /// Requested mime type
        mime_type: String,
        /// Write end of the transfer pipe
        fd: OwnedFd,
    },
    /// The drop target accepted (or no longer accepts) a mime type.
    Target {
        /// Currently accepted mime type, if any
        mime_type: Option<String>,
    },
    /// The source is no longer in use and may be destroyed.
    Cancelled,
    /// The user dropped; `dnd_finished` or `cancelled` follows eventually.
    DndDropPerformed,
    /// The target finished the transfer.
    DndFinished,
    /// The negotiated drag-and-drop action changed.
    SourceAction {
        /// The newly negotiated action
        action: DndAction,
    },

    // data_device / control_device
    /// Announces an offer object about to be used by `selection` or `enter`.
    DataOffer {
        /// The freshly created `data_offer` object
        id: ObjectId,
    },
    /// A drag entered a surface of this client.
    Enter {
        /// Serial of this enter, to be used with `accept`
        serial: Serial,
        /// The entered surface
        surface: SurfaceId,
        /// Surface-local pointer position
        location: Point<f64>,
        /// The drag's offer, absent for source-less drags
        offer: Option<ObjectId>,
    },
    /// The drag left the surface it previously entered.
    Leave,
    /// Pointer motion during a drag.
    Motion {
        /// Timestamp in milliseconds
        time: u32,
        /// Surface-local pointer position
        location: Point<f64>,
    },
    /// The user dropped on the current surface.
    Drop,
    /// The clipboard selection changed.
    Selection {
        /// Offer for the new selection, `None` if cleared
        offer: Option<ObjectId>,
    },
    /// The primary selection changed.
    PrimarySelection {
        /// Offer for the new selection, `None` if cleared
        offer: Option<ObjectId>,
    },
    /// The control device was detached and will receive no further events.
    ControlFinished,

    // data_offer
    /// One mime type offered by the underlying source.
    Offer {
        /// The offered mime type
        mime_type: String,
    },
    /// The actions supported by the source side.
    SourceActions {
        /// Bitmask of source-supported actions
        actions: DndAction,
    },
    /// The negotiated drag-and-drop action changed.
    OfferAction {
        /// The newly negotiated action
        action: DndAction,
    },

    // capture_stream
    /// The stream is live on the capture transport under `node_id`.
    Created {
        /// Endpoint id on the capture transport
        node_id: u32,
    },
    /// Stream setup failed; `Closed` follows.
    Failed {
        /// Human readable diagnostic
        reason: String,
    },
    /// Terminal event; the stream is gone.
    Closed,
}

impl Event {
    /// Minimal interface version required to receive this event.
    pub(crate) fn since(&self, interface: Interface) -> u32 {
        match self {
            Event::SourceAction { .. } | Event::DndDropPerformed | Event::DndFinished => 3,
            Event::SourceActions { .. } | Event::OfferAction { .. } => 3,
            // Control devices gained the primary selection in v2.
            Event::PrimarySelection { .. } if interface == Interface::ControlDevice => 2,
            _ => 1,
        }
    }
}

/// A queued outbound message, drained by the embedder per client in FIFO order.
#[derive(Debug)]
pub enum OutboundMessage {
    /// A regular protocol event.
    Event {
        /// Receiving object
        object: ObjectId,
        /// The event payload
        event: Event,
    },
    /// A fatal protocol error; the client is disconnected after delivery.
    Error {
        /// Object the violation happened on
        object: ObjectId,
        /// Protocol error code
        code: u32,
        /// Human readable description
        message: String,
    },
}
