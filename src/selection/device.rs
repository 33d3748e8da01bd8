//! Device endpoints: focus-scoped data devices and privileged control
//! devices, plus the `set_selection` request family.

use tracing::debug;

use crate::transport::{
    ClientId, Event, Interface, NewId, ObjectId, ProtocolError, Transport,
};
use crate::utils::Serial;

use super::seat_data::SetSelectionOutcome;
use super::source::SourceKind;
use super::{SeatId, SelectionHandler, SelectionState, SelectionTarget};

/// What flavor of selection endpoint a device object is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DeviceKind {
    /// Regular per-seat device, scoped to keyboard focus.
    DataDevice,
    /// Control device, exempt from focus. One per client and seat.
    Control,
}

/// A device registered on a seat.
#[derive(Debug, Clone, Copy)]
pub(crate) struct DeviceEntry {
    pub object: ObjectId,
    pub client: ClientId,
    pub kind: DeviceKind,
    pub version: u32,
}

fn find_device(state: &SelectionState, object: ObjectId) -> Option<(SeatId, DeviceEntry)> {
    for (&seat, data) in &state.seats {
        if let Some(entry) = data.devices.iter().find(|e| e.object == object) {
            return Some((seat, *entry));
        }
    }
    None
}

pub(crate) fn get_device<D>(
    transport: &mut Transport,
    state: &mut D,
    manager: ObjectId,
    id: NewId,
    seat: SeatId,
) where
    D: SelectionHandler,
{
    if state.selection_state().seat(seat).is_none() {
        transport.post_error(manager, ProtocolError::InvalidArgument, "unknown seat");
        return;
    }
    let object = match transport.create_child(manager, Interface::DataDevice, id) {
        Ok(object) => object,
        Err(err) => {
            debug!(?err, "rejecting get_device");
            transport.post_error(manager, ProtocolError::InvalidNewId, "invalid new object id");
            return;
        }
    };
    let version = transport.version(object).unwrap_or(1);
    let sel = state.selection_state();
    if let Some(data) = sel.seat_mut(seat) {
        data.devices.push(DeviceEntry {
            object,
            client: object.client(),
            kind: DeviceKind::DataDevice,
            version,
        });
    }
}

pub(crate) fn get_control_device<D>(
    transport: &mut Transport,
    state: &mut D,
    manager: ObjectId,
    id: NewId,
    seat: SeatId,
) where
    D: SelectionHandler,
{
    let sel = state.selection_state();
    let Some(data) = sel.seat(seat) else {
        transport.post_error(manager, ProtocolError::InvalidArgument, "unknown seat");
        return;
    };
    let duplicate = data
        .devices
        .iter()
        .any(|e| e.kind == DeviceKind::Control && e.client == manager.client());
    if duplicate {
        transport.post_error(
            manager,
            ProtocolError::InvalidArgument,
            "client already has a control device for this seat",
        );
        return;
    }

    let object = match transport.create_child(manager, Interface::ControlDevice, id) {
        Ok(object) => object,
        Err(err) => {
            debug!(?err, "rejecting get_control_device");
            transport.post_error(manager, ProtocolError::InvalidNewId, "invalid new object id");
            return;
        }
    };
    let version = transport.version(object).unwrap_or(1);
    let entry = DeviceEntry {
        object,
        client: object.client(),
        kind: DeviceKind::Control,
        version,
    };

    let sel = state.selection_state();
    if let Some(data) = sel.seat_mut(seat) {
        data.devices.push(entry);
    }
    // Control devices see the current selections right away, without waiting
    // for the next change.
    sel.announce_to_device(transport, seat, SelectionTarget::Clipboard, &entry);
    if version >= 2 {
        sel.announce_to_device(transport, seat, SelectionTarget::Primary, &entry);
    }
}

/// `set_selection` on a data or control device.
///
/// `serial` is `Some` for data devices and `None` for control devices, which
/// need no proof of user intent.
pub(crate) fn set_selection<D>(
    transport: &mut Transport,
    state: &mut D,
    object: ObjectId,
    target: SelectionTarget,
    source: Option<ObjectId>,
    serial: Option<Serial>,
) where
    D: SelectionHandler,
{
    let sel = state.selection_state();
    let Some((seat, entry)) = find_device(sel, object) else {
        debug!(?object, "set_selection on an unregistered device");
        return;
    };

    let handle = match source {
        Some(source_object) => match sel.resolve_source(source_object) {
            Some(handle) => Some(handle),
            None => {
                transport.post_error(
                    object,
                    ProtocolError::InvalidObject,
                    "set_selection with a dead source",
                );
                return;
            }
        },
        None => None,
    };

    if let Some(handle) = handle {
        let Some(inner) = sel.sources.get(handle) else {
            return;
        };
        let expected_kind = match entry.kind {
            DeviceKind::DataDevice => SourceKind::Standard,
            DeviceKind::Control => SourceKind::Control,
        };
        if inner.kind != expected_kind {
            transport.post_error(
                object,
                ProtocolError::InvalidSource,
                "source was created by the wrong manager",
            );
            return;
        }
        if inner.used_for_drag.is_some() {
            transport.post_error(
                object,
                ProtocolError::InvalidSource,
                "source is in use by a drag",
            );
            return;
        }
        if let Some(used) = inner.used_by {
            if used != (seat, target) {
                transport.post_error(
                    object,
                    ProtocolError::InvalidSource,
                    "source is already offered elsewhere",
                );
                return;
            }
        }
    }

    match sel.set_selection(transport, seat, target, handle, serial) {
        SetSelectionOutcome::Installed => {
            let mime_types = state.selection_state().selection_mime_types(seat, target);
            state.new_selection(seat, target, mime_types);
        }
        SetSelectionOutcome::DragActive => {
            transport.post_error(
                object,
                ProtocolError::InvalidSource,
                "selection set while a drag is active",
            );
        }
        SetSelectionOutcome::CurrentReuse => {
            transport.post_error(
                object,
                ProtocolError::InvalidSource,
                "control device offered the selection back to the seat",
            );
        }
        SetSelectionOutcome::Ignored => {}
    }
}

pub(crate) fn release<D>(transport: &mut Transport, state: &mut D, object: ObjectId)
where
    D: SelectionHandler,
{
    if matches!(transport.interface(object), Ok(Interface::ControlDevice)) {
        let _ = transport.post_event(object, Event::ControlFinished);
    }
    for destroyed in transport.destroy_object(object) {
        super::handle_destroyed(transport, state, destroyed.id, destroyed.interface);
    }
}

pub(crate) fn device_destroyed<D>(_transport: &mut Transport, state: &mut D, object: ObjectId)
where
    D: SelectionHandler,
{
    let sel = state.selection_state();
    for data in sel.seats.values_mut() {
        data.devices.retain(|e| e.object != object);
    }
}
