//! The receiver side of a transfer.
//!
//! Offers are one-shot server-created objects. A selection offer dies with
//! the next selection change; a drag offer dies with the grab. `receive`
//! hands the receiver's pipe to the source owner and forgets it, so a dead
//! source simply closes the descriptor and the receiver reads EOF.

use std::os::unix::io::OwnedFd;

use tracing::debug;

use crate::transport::{ClientId, Event, ObjectId, ProtocolError, Transport};
use crate::utils::Serial;

use super::arena::Handle;
use super::source::SourceState;
use super::{DndAction, SelectionHandler, SelectionTarget, SourceHandle};

pub(crate) type OfferHandle = Handle<OfferInner>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OfferKind {
    Selection(SelectionTarget),
    Dnd,
}

#[derive(Debug)]
pub(crate) struct OfferInner {
    pub object: ObjectId,
    pub client: ClientId,
    pub device: ObjectId,
    pub source: SourceHandle,
    pub kind: OfferKind,
    /// Cleared when the backing source is replaced or dies, or when the drag
    /// focus moves away. An inactive offer silently drops `receive` pipes.
    pub active: bool,
    pub accepted: bool,
    pub accepted_mime: Option<String>,
    pub dropped: bool,
    pub finished: bool,
    pub target_actions: DndAction,
    pub target_preferred: DndAction,
    pub chosen_action: DndAction,
}

impl OfferInner {
    pub fn new_selection(
        object: ObjectId,
        client: ClientId,
        device: ObjectId,
        source: SourceHandle,
        target: SelectionTarget,
    ) -> Self {
        OfferInner {
            object,
            client,
            device,
            source,
            kind: OfferKind::Selection(target),
            active: true,
            // Selection offers need no accept step.
            accepted: true,
            accepted_mime: None,
            dropped: false,
            finished: false,
            target_actions: DndAction::empty(),
            target_preferred: DndAction::empty(),
            chosen_action: DndAction::empty(),
        }
    }

    pub fn new_dnd(
        object: ObjectId,
        client: ClientId,
        device: ObjectId,
        source: SourceHandle,
    ) -> Self {
        OfferInner {
            object,
            client,
            device,
            source,
            kind: OfferKind::Dnd,
            active: true,
            accepted: false,
            accepted_mime: None,
            dropped: false,
            finished: false,
            target_actions: DndAction::empty(),
            target_preferred: DndAction::empty(),
            chosen_action: DndAction::empty(),
        }
    }
}

fn resolve(state: &super::SelectionState, object: ObjectId) -> Option<OfferHandle> {
    state.offer_by_object.get(&object).copied()
}

pub(crate) fn accept<D>(
    transport: &mut Transport,
    state: &mut D,
    object: ObjectId,
    serial: Serial,
    mime_type: Option<String>,
) where
    D: SelectionHandler,
{
    // The serial is informational; staleness is already handled by the grab
    // lifecycle.
    let _ = serial;

    let sel = state.selection_state();
    let Some(handle) = resolve(sel, object) else {
        return;
    };
    let Some(offer) = sel.offers.get_mut(handle) else {
        return;
    };
    if offer.kind != OfferKind::Dnd || !offer.active {
        return;
    }
    if offer.finished {
        transport.post_error(object, ProtocolError::InvalidFinish, "accept after finish");
        return;
    }

    offer.accepted = mime_type.is_some();
    offer.accepted_mime = mime_type.clone();
    let source = offer.source;

    if let Some(source) = sel.sources.get_mut(source) {
        if let Some(ref mime) = mime_type {
            if !source.mime_types.contains(mime) {
                transport.post_error(
                    object,
                    ProtocolError::InvalidArgument,
                    "accept with a mime type the source never offered",
                );
                return;
            }
        }
        match (source.state, mime_type.is_some()) {
            (SourceState::Live, true) => source.state = SourceState::Accepted,
            (SourceState::Accepted, false) => source.state = SourceState::Live,
            _ => {}
        }
        if transport.alive(source.object) {
            let _ = transport.post_event(source.object, Event::Target { mime_type });
        }
    }
}

pub(crate) fn receive<D>(
    transport: &mut Transport,
    state: &mut D,
    object: ObjectId,
    mime_type: String,
    fd: OwnedFd,
) where
    D: SelectionHandler,
{
    let sel = state.selection_state();
    let Some(handle) = resolve(sel, object) else {
        return;
    };
    let Some(offer) = sel.offers.get(handle) else {
        return;
    };
    if offer.finished {
        transport.post_error(object, ProtocolError::InvalidFinish, "receive after finish");
        return;
    }
    if !offer.active {
        // Dropping the fd closes our end; the receiver reads EOF.
        debug!(?object, "receive on an inactive offer");
        return;
    }
    let Some(source) = sel.sources.get(offer.source) else {
        return;
    };
    if !source.alive() || !source.mime_types.contains(&mime_type) {
        return;
    }
    if transport.alive(source.object) {
        let _ = transport.post_event(source.object, Event::Send { mime_type, fd });
    }
}

pub(crate) fn finish<D>(transport: &mut Transport, state: &mut D, object: ObjectId)
where
    D: SelectionHandler,
{
    let sel = state.selection_state();
    let Some(handle) = resolve(sel, object) else {
        return;
    };
    let Some(offer) = sel.offers.get_mut(handle) else {
        return;
    };

    if offer.kind != OfferKind::Dnd {
        transport.post_error(object, ProtocolError::InvalidFinish, "finish on a selection offer");
        return;
    }
    if offer.finished {
        transport.post_error(object, ProtocolError::InvalidFinish, "finish called twice");
        return;
    }
    if !offer.active {
        transport.post_error(object, ProtocolError::InvalidFinish, "finish on an inactive offer");
        return;
    }
    if !offer.accepted {
        transport.post_error(object, ProtocolError::InvalidFinish, "finish without accept");
        return;
    }
    if !offer.dropped {
        transport.post_error(object, ProtocolError::InvalidFinish, "finish before drop");
        return;
    }
    if offer.chosen_action.is_empty() {
        transport.post_error(object, ProtocolError::InvalidFinish, "finish with no action agreed");
        return;
    }

    offer.finished = true;
    offer.active = false;
    let source = offer.source;
    if let Some(source) = sel.sources.get_mut(source) {
        source.state = SourceState::Finished;
        source.used_for_drag = None;
        if transport.alive(source.object) {
            let _ = transport.post_event(source.object, Event::DndFinished);
        }
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
    let Some(handle) = resolve(sel, object) else {
        return;
    };
    let Some(offer) = sel.offers.get_mut(handle) else {
        return;
    };
    if offer.kind != OfferKind::Dnd {
        transport.post_error(object, ProtocolError::InvalidAction, "set_actions on a selection offer");
        return;
    }
    offer.target_actions = actions;
    offer.target_preferred = preferred;

    renegotiate(transport, state, handle);
}

/// Recompute the negotiated action for a drag offer and notify both ends on
/// change.
pub(crate) fn renegotiate<D>(transport: &mut Transport, state: &mut D, handle: OfferHandle)
where
    D: SelectionHandler,
{
    let sel = state.selection_state();
    let Some(offer) = sel.offers.get(handle) else {
        return;
    };
    if !offer.active {
        return;
    }
    let Some(source) = sel.sources.get(offer.source) else {
        return;
    };

    let available = source.dnd_actions & offer.target_actions;
    let preferred = offer.target_preferred;
    let previous = offer.chosen_action;
    let offer_object = offer.object;
    let source_object = source.object;

    let chosen = state.action_choice(available, preferred);
    debug_assert!(chosen.is_single(), "action_choice must return one action or none");

    let sel = state.selection_state();
    if let Some(offer) = sel.offers.get_mut(handle) {
        offer.chosen_action = chosen;
    }
    if chosen != previous {
        let _ = transport.post_event(offer_object, Event::OfferAction { action: chosen });
        if transport.alive(source_object) {
            let _ = transport.post_event(source_object, Event::SourceAction { action: chosen });
        }
    }
}

pub(crate) fn offer_destroyed<D>(transport: &mut Transport, state: &mut D, object: ObjectId)
where
    D: SelectionHandler,
{
    let sel = state.selection_state();
    let Some(handle) = sel.offer_by_object.remove(&object) else {
        return;
    };
    let Some(inner) = sel.offers.remove(handle) else {
        return;
    };

    // The target destroying a dropped-but-unfinished offer aborts the
    // transfer.
    if inner.kind == OfferKind::Dnd && inner.dropped && !inner.finished {
        if let Some(source) = sel.sources.get_mut(inner.source) {
            if source.alive() {
                source.state = SourceState::Cancelled;
                source.used_for_drag = None;
                if transport.alive(source.object) {
                    let _ = transport.post_event(source.object, Event::Cancelled);
                }
            }
        }
    }

    // Mid-drag, the target may destroy the offer; the grab survives without
    // one.
    for data in sel.seats.values_mut() {
        if let Some(ref mut drag) = data.drag {
            if drag.offer == Some(handle) {
                drag.offer = None;
            }
        }
    }
}
