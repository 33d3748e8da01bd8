//! The source side of a transfer: mime advertisement, drag action masks and
//! the source lifecycle.

use indexmap::IndexSet;
use tracing::debug;

use crate::transport::{
    ClientId, Event, Interface, NewId, ObjectId, ProtocolError, Transport,
};

use super::arena::Handle;
use super::{DndAction, OfferKind, SeatId, SelectionHandler, SelectionTarget, ToplevelAttachment};

pub(crate) type SourceHandle = Handle<SourceInner>;

/// Which manager created a source. Sources are only usable on devices of the
/// matching flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SourceKind {
    Standard,
    Control,
}

/// Lifecycle of a source, one way: `Live` to `Accepted` and back is the only
/// reversible step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SourceState {
    Live,
    /// A drag target currently accepts one of its mime types.
    Accepted,
    Cancelled,
    Finished,
}

#[derive(Debug)]
pub(crate) struct SourceInner {
    pub object: ObjectId,
    pub client: ClientId,
    pub kind: SourceKind,
    pub mime_types: IndexSet<String>,
    pub dnd_actions: DndAction,
    pub preferred_action: DndAction,
    pub state: SourceState,
    /// Seat slot this source is installed in, if any.
    pub used_by: Option<(SeatId, SelectionTarget)>,
    /// Seat whose drag this source backs, if any.
    pub used_for_drag: Option<SeatId>,
    /// Toplevel that follows the pointer when this source backs a drag.
    pub toplevel: Option<ToplevelAttachment>,
}

impl SourceInner {
    pub fn alive(&self) -> bool {
        matches!(self.state, SourceState::Live | SourceState::Accepted)
    }
}

pub(crate) fn create_source<D>(
    transport: &mut Transport,
    state: &mut D,
    manager: ObjectId,
    id: NewId,
) where
    D: SelectionHandler,
{
    let kind = match transport.interface(manager) {
        Ok(Interface::SeatSelectionManager) => SourceKind::Standard,
        Ok(Interface::ControlManager) => SourceKind::Control,
        _ => return,
    };
    let object = match transport.create_child(manager, Interface::DataSource, id) {
        Ok(object) => object,
        Err(err) => {
            debug!(?err, "rejecting create_source");
            transport.post_error(manager, ProtocolError::InvalidNewId, "invalid new object id");
            return;
        }
    };
    let sel = state.selection_state();
    let handle = sel.sources.insert(SourceInner {
        object,
        client: object.client(),
        kind,
        mime_types: IndexSet::new(),
        dnd_actions: DndAction::empty(),
        preferred_action: DndAction::empty(),
        state: SourceState::Live,
        used_by: None,
        used_for_drag: None,
        toplevel: None,
    });
    sel.source_by_object.insert(object, handle);
}

pub(crate) fn offer_mime<D>(
    transport: &mut Transport,
    state: &mut D,
    object: ObjectId,
    mime_type: String,
) where
    D: SelectionHandler,
{
    let sel = state.selection_state();
    let Some(handle) = sel.resolve_source(object) else {
        return;
    };
    let Some(source) = sel.sources.get_mut(handle) else {
        return;
    };
    if !source.alive() {
        debug!(?object, "offer on a cancelled source");
        return;
    }
    if !source.mime_types.insert(mime_type.clone()) {
        return;
    }
    // Live offers replay the addition so receivers stay in sync.
    let targets: Vec<ObjectId> = sel
        .offers
        .iter()
        .filter(|(_, offer)| offer.source == handle && offer.active)
        .map(|(_, offer)| offer.object)
        .collect();
    for target in targets {
        let _ = transport.post_event(
            target,
            Event::Offer {
                mime_type: mime_type.clone(),
            },
        );
    }
}

pub(crate) fn set_actions<D>(
    transport: &mut Transport,
    state: &mut D,
    object: ObjectId,
    dnd_actions: u32,
    preferred_action: u32,
) where
    D: SelectionHandler,
{
    let Some(actions) = DndAction::from_bits(dnd_actions) else {
        transport.post_error(object, ProtocolError::InvalidAction, "unknown action bits");
        return;
    };
    let Some(preferred) = DndAction::from_bits(preferred_action) else {
        transport.post_error(object, ProtocolError::InvalidAction, "unknown action bits");
        return;
    };
    if !preferred.is_single() || (!preferred.is_empty() && !actions.contains(preferred)) {
        transport.post_error(
            object,
            ProtocolError::InvalidAction,
            "preferred action must be a single advertised action",
        );
        return;
    }

    let sel = state.selection_state();
    let Some(handle) = sel.resolve_source(object) else {
        return;
    };
    let Some(source) = sel.sources.get_mut(handle) else {
        return;
    };
    source.dnd_actions = actions;
    source.preferred_action = preferred;

    // A mid-drag change renegotiates with the current target.
    let dnd_offers: Vec<_> = sel
        .offers
        .handles()
        .into_iter()
        .filter(|&h| {
            sel.offers
                .get(h)
                .map(|o| o.source == handle && o.active && o.kind == OfferKind::Dnd)
                .unwrap_or(false)
        })
        .collect();
    for offer in dnd_offers {
        super::offer::renegotiate(transport, state, offer);
    }
}

pub(crate) fn source_destroyed<D>(transport: &mut Transport, state: &mut D, object: ObjectId)
where
    D: SelectionHandler,
{
    let sel = state.selection_state();
    let Some(handle) = sel.source_by_object.remove(&object) else {
        return;
    };
    let Some(inner) = sel.sources.remove(handle) else {
        return;
    };
    sel.deactivate_offers_of(handle);

    if let Some((seat, target)) = inner.used_by {
        if let Some(data) = sel.seat_mut(seat) {
            let slot = data.slot_mut(target);
            if slot.current == Some(handle) {
                slot.current = None;
            }
        }
        sel.broadcast(transport, seat, target, true);
        state.new_selection(seat, target, None);
    } else if let Some(seat) = inner.used_for_drag {
        super::dnd_grab::abort_drag(transport, state, seat);
    }
}
