//! Selection and drag-and-drop handling.
//!
//! This module mediates data transfer between mutually distrusting clients:
//! regular clipboard and primary selections, privileged control devices
//! (clipboard managers), and the drag-and-drop grab lifecycle including the
//! action negotiation sub-protocol.
//!
//! The compositor owns a [`SelectionState`] and implements
//! [`SelectionHandler`] on its global state. Seats are registered with
//! [`SelectionState::new_seat`]; the input frontend reports keyboard focus
//! through [`SelectionState::set_clipboard_focus`] /
//! [`SelectionState::set_primary_focus`], button presses through
//! [`SelectionState::set_implicit_grab`], and pointer movement during a drag
//! through [`drag_motion`] / [`drag_button_released`].
//!
//! The compositor never sees the transferred bytes: a receiver's `receive`
//! request hands its file descriptor to the source owner as a `send` event
//! and is forgotten; the kernel pipe provides the backpressure. A receiver
//! reading from an offer whose source died observes EOF because the
//! compositor closes the descriptor without writing.

use std::collections::HashMap;

use tracing::debug;

use crate::transport::{ClientId, GlobalId, Interface, ObjectId, Request, Transport};
use crate::utils::{ids::id_gen, Point, Serial};

pub(crate) mod arena;
mod device;
mod dnd_grab;
mod offer;
mod seat_data;
mod source;

pub use dnd_grab::{drag_button_released, drag_motion, DragFocus, ToplevelAttachment};
pub(crate) use dnd_grab::DragState;
pub(crate) use offer::{OfferHandle, OfferInner, OfferKind};
pub(crate) use seat_data::SeatData;
pub(crate) use source::{SourceHandle, SourceInner, SourceState};

use arena::Arena;

/// The two selection slots a seat owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionTarget {
    /// The primary selection (select-to-copy, middle-click-to-paste).
    Primary,
    /// The regular clipboard selection.
    Clipboard,
}

bitflags::bitflags! {
    /// Possible drag-and-drop actions, as a wire-compatible bitmask.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DndAction: u32 {
        /// Copy the data to the destination.
        const COPY = 1;
        /// Move the data to the destination.
        const MOVE = 2;
        /// Ask the user which action to take.
        const ASK = 4;
    }
}

impl DndAction {
    /// Whether this value is a single action (or none), as required for
    /// `preferred_action` arguments.
    pub fn is_single(self) -> bool {
        self.bits().count_ones() <= 1
    }
}

/// An opaque surface handle, provided by the embedding compositor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SurfaceId(pub u64);

id_gen!(seat_ids);

/// A logical input-focus domain owning the selection slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SeatId(usize);

/// Handler trait for selections and drag-and-drop.
pub trait SelectionHandler: Sized + 'static {
    /// [`SelectionState`] getter.
    fn selection_state(&mut self) -> &mut SelectionState;

    /// A new selection was installed (or cleared) on the given seat slot.
    ///
    /// `mime_types` is `None` when the slot was cleared. Can be used to
    /// synchronize with an external clipboard (e.g. Xwayland).
    fn new_selection(&mut self, seat: SeatId, target: SelectionTarget, mime_types: Option<Vec<String>>) {
        let _ = (seat, target, mime_types);
    }

    /// Select the drag-and-drop action to advertise to source and target.
    ///
    /// `available` is the intersection of the actions both sides support,
    /// `preferred` the single action the target asked for. The returned
    /// value must be a single action or empty.
    fn action_choice(&mut self, available: DndAction, preferred: DndAction) -> DndAction {
        default_action_chooser(available, preferred)
    }

    /// A drag was started on the seat; `icon` is the drag icon surface the
    /// compositor should render at the pointer position.
    fn drag_started(&mut self, seat: SeatId, icon: Option<SurfaceId>) {
        let _ = (seat, icon);
    }

    /// The drag on the seat was dropped or cancelled; the icon can go away.
    /// If a toplevel rode the drag, `toplevel` says which one so the
    /// compositor can settle it at its final position.
    fn dropped(&mut self, seat: SeatId, toplevel: Option<ToplevelAttachment>) {
        let _ = (seat, toplevel);
    }
}

/// The default action-negotiation policy: honor the target's preference
/// when possible, fall back to `ask`, then pick by fixed `move > copy`
/// priority.
pub fn default_action_chooser(available: DndAction, preferred: DndAction) -> DndAction {
    if !preferred.is_empty() && available.contains(preferred) {
        preferred
    } else if available.contains(DndAction::ASK) {
        DndAction::ASK
    } else if available.contains(DndAction::MOVE) {
        DndAction::MOVE
    } else if available.contains(DndAction::COPY) {
        DndAction::COPY
    } else {
        DndAction::empty()
    }
}

/// Delegate state of the selection subsystem.
#[derive(Debug, Default)]
pub struct SelectionState {
    pub(crate) seats: HashMap<SeatId, SeatData>,
    pub(crate) sources: Arena<SourceInner>,
    pub(crate) offers: Arena<OfferInner>,
    pub(crate) source_by_object: HashMap<ObjectId, SourceHandle>,
    pub(crate) offer_by_object: HashMap<ObjectId, OfferHandle>,
    selection_global: Option<GlobalId>,
    control_global: Option<GlobalId>,
}

impl SelectionState {
    /// Create the state without any globals or seats.
    pub fn new() -> Self {
        Default::default()
    }

    /// Publish the `seat_selection_manager` and `control_manager` globals.
    pub fn create_globals(&mut self, transport: &mut Transport) {
        self.selection_global = Some(transport.create_global(Interface::SeatSelectionManager, 3));
        self.control_global = Some(transport.create_global(Interface::ControlManager, 2));
    }

    /// The `seat_selection_manager` global, once created.
    pub fn selection_global(&self) -> Option<GlobalId> {
        self.selection_global
    }

    /// The `control_manager` global, once created.
    pub fn control_global(&self) -> Option<GlobalId> {
        self.control_global
    }

    /// Register a new seat.
    pub fn new_seat(&mut self) -> SeatId {
        let id = SeatId(seat_ids::next());
        self.seats.insert(id, SeatData::new());
        id
    }

    pub(crate) fn seat(&self, seat: SeatId) -> Option<&SeatData> {
        self.seats.get(&seat)
    }

    pub(crate) fn seat_mut(&mut self, seat: SeatId) -> Option<&mut SeatData> {
        self.seats.get_mut(&seat)
    }

    /// Record the most recent implicit grab (button or touch press) on the
    /// seat. `start_drag` requests are validated against it.
    pub fn set_implicit_grab(
        &mut self,
        seat: SeatId,
        serial: Serial,
        surface: SurfaceId,
        client: ClientId,
    ) {
        if let Some(data) = self.seats.get_mut(&seat) {
            data.implicit_grab = Some(seat_data::GrabStart {
                serial,
                surface,
                client,
            });
        }
    }

    /// Change the client focused for the clipboard selection; `None` removes
    /// the focus. The newly focused client immediately receives the current
    /// selection state.
    pub fn set_clipboard_focus(
        &mut self,
        transport: &mut Transport,
        seat: SeatId,
        focus: Option<ClientId>,
    ) {
        if let Some(data) = self.seats.get_mut(&seat) {
            data.clipboard.focus = focus;
        }
        self.broadcast(transport, seat, SelectionTarget::Clipboard, false);
    }

    /// Change the client focused for the primary selection; `None` removes
    /// the focus.
    pub fn set_primary_focus(
        &mut self,
        transport: &mut Transport,
        seat: SeatId,
        focus: Option<ClientId>,
    ) {
        if let Some(data) = self.seats.get_mut(&seat) {
            data.primary.focus = focus;
        }
        self.broadcast(transport, seat, SelectionTarget::Primary, false);
    }

    /// Mime types of the current selection on the seat slot, if any.
    pub fn selection_mime_types(&self, seat: SeatId, target: SelectionTarget) -> Option<Vec<String>> {
        let data = self.seat(seat)?;
        let handle = data.slot(target).current?;
        let source = self.sources.get(handle)?;
        Some(source.mime_types.iter().cloned().collect())
    }

    /// Whether a drag is currently active on the seat.
    pub fn drag_active(&self, seat: SeatId) -> bool {
        self.seat(seat).map(|d| d.drag.is_some()).unwrap_or(false)
    }

    /// Icon surface of the active drag on the seat, if any. The compositor
    /// renders it at the pointer position for the duration of the grab.
    pub fn drag_icon(&self, seat: SeatId) -> Option<SurfaceId> {
        self.seat(seat)?.drag.as_ref()?.icon
    }

    /// Surface the active drag started on.
    pub fn drag_origin(&self, seat: SeatId) -> Option<SurfaceId> {
        self.seat(seat)?.drag.as_ref().map(|d| d.origin)
    }

    /// Toplevel attached to the active drag on the seat, if any. The
    /// compositor moves it with the pointer while the grab lasts.
    pub fn drag_toplevel(&self, seat: SeatId) -> Option<ToplevelAttachment> {
        self.seat(seat)?.drag.as_ref()?.toplevel
    }

    /// Attach a toplevel to a data source before (or during) a drag it
    /// backs. Returns `false` when `source` is not a live data source.
    pub fn attach_drag_toplevel(
        &mut self,
        source: ObjectId,
        toplevel: SurfaceId,
        offset: Point<i32>,
    ) -> bool {
        let Some(handle) = self.resolve_source(source) else {
            return false;
        };
        let attachment = ToplevelAttachment { toplevel, offset };
        let dragging = match self.sources.get_mut(handle) {
            Some(inner) => {
                inner.toplevel = Some(attachment);
                inner.used_for_drag
            }
            None => return false,
        };
        if let Some(seat) = dragging {
            if let Some(drag) = self.seat_mut(seat).and_then(|d| d.drag.as_mut()) {
                drag.toplevel = Some(attachment);
            }
        }
        true
    }

    pub(crate) fn resolve_source(&self, object: ObjectId) -> Option<SourceHandle> {
        self.source_by_object.get(&object).copied()
    }
}

/// Route a request for one of the selection interfaces.
///
/// The caller ([`crate::dispatch`]) has already checked that the request is
/// valid on the object's interface.
pub(crate) fn handle_request<D>(
    transport: &mut Transport,
    state: &mut D,
    object: ObjectId,
    request: Request,
) where
    D: SelectionHandler,
{
    match request {
        Request::CreateSource { id } => source::create_source(transport, state, object, id),
        Request::GetDevice { id, seat } => device::get_device(transport, state, object, id, seat),
        Request::GetControlDevice { id, seat } => {
            device::get_control_device(transport, state, object, id, seat)
        }
        Request::Offer { mime_type } => source::offer_mime(transport, state, object, mime_type),
        Request::SetSourceActions {
            dnd_actions,
            preferred_action,
        } => source::set_actions(transport, state, object, dnd_actions, preferred_action),
        Request::DestroySource => {
            for destroyed in transport.destroy_object(object) {
                handle_destroyed(transport, state, destroyed.id, destroyed.interface);
            }
        }
        Request::StartDrag {
            source,
            origin,
            icon,
            serial,
        } => dnd_grab::start_drag(transport, state, object, source, origin, icon, serial),
        Request::SetSelection { source, serial } => device::set_selection(
            transport,
            state,
            object,
            SelectionTarget::Clipboard,
            source,
            Some(serial),
        ),
        Request::SetPrimarySelection { source, serial } => device::set_selection(
            transport,
            state,
            object,
            SelectionTarget::Primary,
            source,
            Some(serial),
        ),
        Request::ControlSetSelection { source } => {
            device::set_selection(transport, state, object, SelectionTarget::Clipboard, source, None)
        }
        Request::ControlSetPrimarySelection { source } => {
            device::set_selection(transport, state, object, SelectionTarget::Primary, source, None)
        }
        Request::Release => {
            device::release(transport, state, object);
        }
        Request::Accept { serial, mime_type } => {
            offer::accept(transport, state, object, serial, mime_type)
        }
        Request::Receive { mime_type, fd } => offer::receive(transport, state, object, mime_type, fd),
        Request::Finish => offer::finish(transport, state, object),
        Request::SetOfferActions {
            dnd_actions,
            preferred_action,
        } => offer::set_actions(transport, state, object, dnd_actions, preferred_action),
        Request::DestroyOffer => {
            for destroyed in transport.destroy_object(object) {
                handle_destroyed(transport, state, destroyed.id, destroyed.interface);
            }
        }
        _ => unreachable!("non-selection request routed to the selection module"),
    }
}

/// Run the per-kind destructor for a destroyed selection object.
///
/// Called synchronously for every object destroyed by a `destroy` request or
/// a client disconnect, before the next dispatch.
pub(crate) fn handle_destroyed<D>(
    transport: &mut Transport,
    state: &mut D,
    object: ObjectId,
    interface: Interface,
) where
    D: SelectionHandler,
{
    match interface {
        Interface::DataSource => source::source_destroyed(transport, state, object),
        Interface::DataOffer => offer::offer_destroyed(transport, state, object),
        Interface::DataDevice | Interface::ControlDevice => {
            device::device_destroyed(transport, state, object)
        }
        Interface::SeatSelectionManager | Interface::ControlManager => {}
        _ => debug!(?object, ?interface, "non-selection object routed to selection destructor"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_chooser_prefers_target_preference() {
        let available = DndAction::COPY | DndAction::MOVE;
        assert_eq!(default_action_chooser(available, DndAction::COPY), DndAction::COPY);
        assert_eq!(default_action_chooser(available, DndAction::MOVE), DndAction::MOVE);
    }

    #[test]
    fn action_chooser_falls_back_to_ask() {
        let available = DndAction::COPY | DndAction::ASK;
        assert_eq!(default_action_chooser(available, DndAction::MOVE), DndAction::ASK);
    }

    #[test]
    fn action_chooser_fixed_priority() {
        let available = DndAction::COPY | DndAction::MOVE;
        assert_eq!(default_action_chooser(available, DndAction::empty()), DndAction::MOVE);
        assert_eq!(
            default_action_chooser(DndAction::COPY, DndAction::empty()),
            DndAction::COPY
        );
    }

    #[test]
    fn action_chooser_empty_intersection() {
        assert_eq!(
            default_action_chooser(DndAction::empty(), DndAction::COPY),
            DndAction::empty()
        );
    }

    #[test]
    fn action_chooser_is_idempotent() {
        let available = DndAction::COPY | DndAction::MOVE | DndAction::ASK;
        let first = default_action_chooser(available, DndAction::ASK);
        let second = default_action_chooser(available, DndAction::ASK);
        assert_eq!(first, second);
    }
}
