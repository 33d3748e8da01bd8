//! The drag-and-drop grab.
//!
//! A drag is owned by its seat and lives from a validated `start_drag` to
//! the button release. The pointer frontend feeds it through [`drag_motion`]
//! and [`drag_button_released`]; surface lookup and hit testing stay on the
//! compositor side, this module only tracks which client is under the
//! pointer and which offer represents the payload there.

use tracing::{debug, trace};

use crate::transport::{ClientId, Event, Interface, ObjectId, ProtocolError, Transport};
use crate::utils::{Point, Serial};

use super::device::DeviceKind;
use super::source::SourceKind;
use super::{
    OfferHandle, OfferInner, SeatId, SelectionHandler, SourceHandle, SurfaceId,
};

/// The surface currently under the pointer during a drag.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DragFocus {
    pub surface: SurfaceId,
    pub client: ClientId,
    /// Global position of the surface's top-left corner, for converting the
    /// pointer location to surface-local coordinates.
    pub surface_origin: Point<f64>,
}

/// A toplevel riding the drag: the compositor keeps the surface glued to
/// the pointer at `offset` for the duration of the grab and places it there
/// on release.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ToplevelAttachment {
    pub toplevel: SurfaceId,
    /// Pointer position relative to the surface's top-left corner.
    pub offset: Point<i32>,
}

/// Live grab state, owned by the seat.
#[derive(Debug)]
pub(crate) struct DragState {
    pub source: Option<SourceHandle>,
    pub origin: SurfaceId,
    pub origin_client: ClientId,
    pub icon: Option<SurfaceId>,
    pub toplevel: Option<ToplevelAttachment>,
    pub start_serial: Serial,
    pub focus: Option<DragFocus>,
    pub offer: Option<OfferHandle>,
}

pub(crate) fn start_drag<D>(
    transport: &mut Transport,
    state: &mut D,
    device: ObjectId,
    source: Option<ObjectId>,
    origin: SurfaceId,
    icon: Option<SurfaceId>,
    serial: Serial,
) where
    D: SelectionHandler,
{
    let sel = state.selection_state();
    let Some((seat, _)) = find_seat_of_device(sel, device) else {
        debug!(?device, "start_drag on an unregistered device");
        return;
    };
    let Some(data) = sel.seat_mut(seat) else {
        return;
    };

    // The grab claim must match the latest implicit grab: same serial, same
    // surface, same client. Anything else is a stale or forged claim and is
    // quietly dropped.
    let grab_ok = data.implicit_grab.map_or(false, |grab| {
        grab.serial == serial && grab.surface == origin && grab.client == device.client()
    });
    if !grab_ok {
        debug!(?seat, ?serial, "ignoring start_drag without a matching implicit grab");
        return;
    }
    if data.drag.is_some() {
        debug!(?seat, "ignoring start_drag during an active drag");
        return;
    }

    let handle = match source {
        Some(source_object) => match sel.resolve_source(source_object) {
            Some(handle) => Some(handle),
            None => {
                transport.post_error(
                    device,
                    ProtocolError::InvalidObject,
                    "start_drag with a dead source",
                );
                return;
            }
        },
        None => None,
    };

    let mut toplevel = None;
    if let Some(handle) = handle {
        let Some(inner) = sel.sources.get_mut(handle) else {
            return;
        };
        if inner.kind != SourceKind::Standard {
            transport.post_error(
                device,
                ProtocolError::InvalidSource,
                "control sources cannot back a drag",
            );
            return;
        }
        if inner.used_by.is_some() || inner.used_for_drag.is_some() {
            transport.post_error(
                device,
                ProtocolError::InvalidSource,
                "source is already in use",
            );
            return;
        }
        inner.used_for_drag = Some(seat);
        toplevel = inner.toplevel;
    }

    let data = sel.seat_mut(seat).unwrap();
    data.drag = Some(DragState {
        source: handle,
        origin,
        origin_client: device.client(),
        icon,
        toplevel,
        start_serial: serial,
        focus: None,
        offer: None,
    });

    state.drag_started(seat, icon);
}

/// Feed a pointer motion into the drag on `seat`.
///
/// `focus` is the surface under the pointer after compositor-side hit
/// testing (skipping the drag icon), `location` the pointer position in
/// global coordinates.
pub fn drag_motion<D>(
    transport: &mut Transport,
    state: &mut D,
    seat: SeatId,
    focus: Option<DragFocus>,
    location: Point<f64>,
    serial: Serial,
    time: u32,
) where
    D: SelectionHandler,
{
    let sel = state.selection_state();
    let Some(data) = sel.seat_mut(seat) else {
        return;
    };
    let Some(drag) = data.drag.as_ref() else {
        return;
    };

    let same_focus = match (&drag.focus, &focus) {
        (Some(old), Some(new)) => old.surface == new.surface,
        (None, None) => true,
        _ => false,
    };

    if same_focus {
        if let Some(current) = drag.focus {
            let local = location - current.surface_origin;
            let devices = client_data_devices(data, current.client);
            for device in devices {
                let _ = transport.post_event(
                    device,
                    Event::Motion {
                        time,
                        location: local,
                    },
                );
            }
        }
        return;
    }

    leave_current_focus(transport, sel, seat);
    enter_focus(transport, sel, seat, focus, location, serial);
}

/// End the drag on `seat`: deliver the drop if the target committed to it,
/// cancel otherwise.
pub fn drag_button_released<D>(
    transport: &mut Transport,
    state: &mut D,
    seat: SeatId,
    serial: Serial,
    time: u32,
) where
    D: SelectionHandler,
{
    trace!(?seat, ?serial, time, "drag button released");
    let sel = state.selection_state();
    let Some(data) = sel.seat_mut(seat) else {
        return;
    };
    let Some(drag) = data.drag.take() else {
        return;
    };

    let validated = match drag.source {
        // A sourceless drag has nothing to transfer; its release only ever
        // leaves the focus surface.
        None => false,
        Some(_) => drag
            .offer
            .and_then(|handle| sel.offers.get(handle))
            .map(|offer| offer.accepted && !offer.chosen_action.is_empty())
            .unwrap_or(false),
    };

    if validated {
        if let Some(offer) = drag.offer.and_then(|h| sel.offers.get(h)) {
            trace!(mime = ?offer.accepted_mime, action = ?offer.chosen_action, "drop validated");
        }
        if let Some(focus) = drag.focus {
            let devices = sel
                .seats
                .get(&seat)
                .map(|data| client_data_devices(data, focus.client))
                .unwrap_or_default();
            for device in devices {
                let _ = transport.post_event(device, Event::Drop);
            }
        }
        if let Some(handle) = drag.offer {
            if let Some(offer) = sel.offers.get_mut(handle) {
                offer.dropped = true;
            }
        }
        if let Some(source) = drag.source.and_then(|h| sel.sources.get(h)) {
            if transport.alive(source.object) {
                let _ = transport.post_event(source.object, Event::DndDropPerformed);
            }
        }
        // The source stays reserved until `finish` or a cancel settles the
        // transfer.
    } else {
        if let Some(handle) = drag.source {
            sel.cancel_source(transport, handle);
        }
        if let Some(focus) = drag.focus {
            let devices = sel
                .seats
                .get(&seat)
                .map(|data| client_data_devices(data, focus.client))
                .unwrap_or_default();
            for device in devices {
                let _ = transport.post_event(device, Event::Leave);
            }
        }
        if let Some(handle) = drag.offer {
            if let Some(offer) = sel.offers.get_mut(handle) {
                offer.active = false;
            }
        }
    }

    state.dropped(seat, drag.toplevel);
}

/// Tear down the drag without a drop, used when the backing source dies
/// mid-grab.
pub(crate) fn abort_drag<D>(transport: &mut Transport, state: &mut D, seat: SeatId)
where
    D: SelectionHandler,
{
    let sel = state.selection_state();
    leave_current_focus(transport, sel, seat);
    let Some(data) = sel.seat_mut(seat) else {
        return;
    };
    let Some(drag) = data.drag.take() else {
        return;
    };
    state.dropped(seat, drag.toplevel);
}

fn find_seat_of_device(
    state: &super::SelectionState,
    object: ObjectId,
) -> Option<(SeatId, DeviceKind)> {
    for (&seat, data) in &state.seats {
        if let Some(entry) = data.devices.iter().find(|e| e.object == object) {
            return Some((seat, entry.kind));
        }
    }
    None
}

fn client_data_devices(data: &super::SeatData, client: ClientId) -> Vec<ObjectId> {
    data.devices
        .iter()
        .filter(|e| e.kind == DeviceKind::DataDevice && e.client == client)
        .map(|e| e.object)
        .collect()
}

fn leave_current_focus(
    transport: &mut Transport,
    sel: &mut super::SelectionState,
    seat: SeatId,
) {
    let Some(data) = sel.seats.get_mut(&seat) else {
        return;
    };
    let Some(drag) = data.drag.as_mut() else {
        return;
    };
    let Some(old) = drag.focus.take() else {
        return;
    };
    let had_events = drag.source.is_some() || old.client == drag.origin_client;
    let stale_offer = drag.offer.take();

    if had_events {
        let devices = client_data_devices(data, old.client);
        for device in devices {
            let _ = transport.post_event(device, Event::Leave);
        }
    }
    if let Some(handle) = stale_offer {
        if let Some(offer) = sel.offers.get_mut(handle) {
            offer.active = false;
        }
    }
}

fn enter_focus(
    transport: &mut Transport,
    sel: &mut super::SelectionState,
    seat: SeatId,
    focus: Option<DragFocus>,
    location: Point<f64>,
    serial: Serial,
) {
    let Some(focus) = focus else {
        return;
    };
    let Some(data) = sel.seats.get_mut(&seat) else {
        return;
    };
    let Some(drag) = data.drag.as_ref() else {
        return;
    };

    let local = location - focus.surface_origin;

    let Some(source_handle) = drag.source else {
        // Without a source only the dragging client itself sees the grab.
        if focus.client != drag.origin_client {
            return;
        }
        let devices = client_data_devices(data, focus.client);
        if devices.is_empty() {
            return;
        }
        for device in &devices {
            let _ = transport.post_event(
                *device,
                Event::Enter {
                    serial,
                    surface: focus.surface,
                    location: local,
                    offer: None,
                },
            );
        }
        data.drag.as_mut().unwrap().focus = Some(focus);
        return;
    };

    let devices: Vec<_> = data
        .devices
        .iter()
        .filter(|e| e.kind == DeviceKind::DataDevice && e.client == focus.client)
        .map(|e| (e.object, e.version))
        .collect();
    if devices.is_empty() {
        return;
    }

    let Some(source) = sel.sources.get(source_handle) else {
        return;
    };
    if !source.alive() {
        return;
    }
    let mime_types: Vec<String> = source.mime_types.iter().cloned().collect();
    let source_actions = source.dnd_actions;

    // One offer object introduced on every data device of the target client.
    let (parent, version) = devices[0];
    let offer_object = match transport.create_server_object(
        focus.client,
        Interface::DataOffer,
        version,
        Some(parent),
    ) {
        Ok(object) => object,
        Err(err) => {
            debug!(?err, "failed to create drag offer");
            return;
        }
    };
    let offer_handle = sel.offers.insert(OfferInner::new_dnd(
        offer_object,
        focus.client,
        parent,
        source_handle,
    ));
    sel.offer_by_object.insert(offer_object, offer_handle);

    for (device, _) in &devices {
        let _ = transport.post_event(*device, Event::DataOffer { id: offer_object });
    }
    for mime_type in mime_types {
        let _ = transport.post_event(offer_object, Event::Offer { mime_type });
    }
    let _ = transport.post_event(
        offer_object,
        Event::SourceActions {
            actions: source_actions,
        },
    );
    for (device, _) in &devices {
        let _ = transport.post_event(
            *device,
            Event::Enter {
                serial,
                surface: focus.surface,
                location: local,
                offer: Some(offer_object),
            },
        );
    }

    let data = sel.seats.get_mut(&seat).unwrap();
    let drag = data.drag.as_mut().unwrap();
    drag.focus = Some(focus);
    drag.offer = Some(offer_handle);
}
