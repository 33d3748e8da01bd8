//! Per-seat selection bookkeeping and the offer broadcast algorithm.

use tracing::{debug, trace};

use crate::transport::{ClientId, Event, Interface, Transport};
use crate::utils::Serial;

use super::device::{DeviceEntry, DeviceKind};
use super::{
    DragState, OfferInner, SelectionState, SelectionTarget, SourceHandle, SourceState, SurfaceId,
};

/// The most recent implicit grab on a seat, against which `start_drag`
/// requests are validated.
#[derive(Debug, Clone, Copy)]
pub(crate) struct GrabStart {
    pub serial: Serial,
    pub surface: SurfaceId,
    pub client: ClientId,
}

/// One selection slot of a seat.
#[derive(Debug, Default)]
pub(crate) struct SlotState {
    /// The source currently installed in this slot.
    pub current: Option<SourceHandle>,
    /// The client whose surfaces hold the relevant focus.
    pub focus: Option<ClientId>,
    /// Serial of the last accepted selection change; older serials are
    /// rejected silently so a stale async request cannot overwrite a fresh
    /// user action.
    pub last_serial: Option<Serial>,
}

/// Seat data shared across the clipboard and primary selections.
#[derive(Debug, Default)]
pub(crate) struct SeatData {
    pub devices: Vec<DeviceEntry>,
    pub clipboard: SlotState,
    pub primary: SlotState,
    pub drag: Option<DragState>,
    pub implicit_grab: Option<GrabStart>,
}

impl SeatData {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn slot(&self, target: SelectionTarget) -> &SlotState {
        match target {
            SelectionTarget::Clipboard => &self.clipboard,
            SelectionTarget::Primary => &self.primary,
        }
    }

    pub fn slot_mut(&mut self, target: SelectionTarget) -> &mut SlotState {
        match target {
            SelectionTarget::Clipboard => &mut self.clipboard,
            SelectionTarget::Primary => &mut self.primary,
        }
    }
}

/// Outcome of a `set_selection` style request.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum SetSelectionOutcome {
    /// The slot changed and was broadcast.
    Installed,
    /// The request was a no-op (same source, or silently rejected serial).
    Ignored,
    /// A control device re-used the seat's current source.
    CurrentReuse,
    /// A control device raced a live drag on the seat.
    DragActive,
}

impl SelectionState {
    /// Install `new_source` into the seat slot, with all the guard rails:
    /// serial staleness, idempotent re-set, cancellation of the replaced
    /// source, and the offer broadcast.
    ///
    /// `serial` is `None` for control devices, which are exempt from the
    /// proof-of-intent check but in exchange must not re-install the current
    /// source and must not race a drag.
    pub(crate) fn set_selection(
        &mut self,
        transport: &mut Transport,
        seat: super::SeatId,
        target: SelectionTarget,
        new_source: Option<SourceHandle>,
        serial: Option<Serial>,
    ) -> SetSelectionOutcome {
        let Some(data) = self.seats.get_mut(&seat) else {
            return SetSelectionOutcome::Ignored;
        };

        let from_control = serial.is_none();
        if from_control && data.drag.is_some() {
            return SetSelectionOutcome::DragActive;
        }

        let slot = data.slot_mut(target);
        if let (Some(serial), Some(last)) = (serial, slot.last_serial) {
            if !serial.is_no_older_than(&last) {
                trace!(?seat, ?target, "ignoring selection set with stale serial");
                return SetSelectionOutcome::Ignored;
            }
        }

        if slot.current == new_source {
            if from_control && new_source.is_some() {
                // A clipboard manager echoing the selection back would loop.
                return SetSelectionOutcome::CurrentReuse;
            }
            // Setting the same source twice is a no-op: no `cancelled`, no
            // re-broadcast.
            if let Some(serial) = serial {
                slot.last_serial = Some(serial);
            }
            return SetSelectionOutcome::Ignored;
        }

        let previous = slot.current;
        slot.current = new_source;
        if let Some(serial) = serial {
            slot.last_serial = Some(serial);
        }

        if let Some(previous) = previous {
            self.cancel_source(transport, previous);
        }
        if let Some(handle) = new_source {
            if let Some(source) = self.sources.get_mut(handle) {
                source.used_by = Some((seat, target));
            }
        }

        self.broadcast(transport, seat, target, true);
        SetSelectionOutcome::Installed
    }

    /// Transition a source to `cancelled`: notify its owner once, detach it
    /// from any slot and deactivate all outstanding offers backed by it.
    pub(crate) fn cancel_source(&mut self, transport: &mut Transport, handle: SourceHandle) {
        let Some(source) = self.sources.get_mut(handle) else {
            return;
        };
        if matches!(source.state, SourceState::Cancelled | SourceState::Finished) {
            return;
        }
        source.state = SourceState::Cancelled;
        source.used_by = None;
        let object = source.object;
        if transport.alive(object) {
            let _ = transport.post_event(object, Event::Cancelled);
        }
        self.deactivate_offers_of(handle);
    }

    pub(crate) fn deactivate_offers_of(&mut self, source: SourceHandle) {
        let stale: Vec<_> = self
            .offers
            .iter()
            .filter(|(_, offer)| offer.source == source)
            .map(|(handle, _)| handle)
            .collect();
        for handle in stale {
            if let Some(offer) = self.offers.get_mut(handle) {
                offer.active = false;
            }
        }
    }

    /// The offer broadcast algorithm.
    ///
    /// For every eligible device: create a fresh one-shot offer, announce it,
    /// replay the source's mime list on it, then point the device's selection
    /// at it. A `None` selection is announced as an unset.
    ///
    /// `update_control` distinguishes actual selection changes (control
    /// devices must hear about them regardless of focus) from mere focus
    /// changes (control devices already know the selection).
    pub(crate) fn broadcast(
        &mut self,
        transport: &mut Transport,
        seat: super::SeatId,
        target: SelectionTarget,
        mut update_control: bool,
    ) {
        let Some(data) = self.seats.get_mut(&seat) else {
            return;
        };

        // Clear the slot if its source died without a destroy request coming
        // through; every receiver is refreshed in that case.
        let slot = data.slot_mut(target);
        if let Some(current) = slot.current {
            if self.sources.get(current).is_none() {
                slot.current = None;
                update_control = true;
            }
        }

        let focus = slot.focus;
        let devices = data.devices.clone();

        for device in devices {
            let eligible = match device.kind {
                DeviceKind::DataDevice => focus == Some(device.client),
                DeviceKind::Control => {
                    // Control devices gained primary selection in v2.
                    update_control && (target != SelectionTarget::Primary || device.version >= 2)
                }
            };
            if eligible {
                self.announce_to_device(transport, seat, target, &device);
            }
        }
    }

    /// Announce the current source of a seat slot on a single device: fresh
    /// one-shot offer, mime replay, then the selection event itself.
    pub(crate) fn announce_to_device(
        &mut self,
        transport: &mut Transport,
        seat: super::SeatId,
        target: SelectionTarget,
        device: &DeviceEntry,
    ) {
        let current = self
            .seats
            .get(&seat)
            .and_then(|data| data.slot(target).current)
            .filter(|&handle| self.sources.get(handle).is_some());

        let Some(handle) = current else {
            let event = match target {
                SelectionTarget::Clipboard => Event::Selection { offer: None },
                SelectionTarget::Primary => Event::PrimarySelection { offer: None },
            };
            let _ = transport.post_event(device.object, event);
            return;
        };

        let mime_types: Vec<String> = self
            .sources
            .get(handle)
            .map(|source| source.mime_types.iter().cloned().collect())
            .unwrap_or_default();

        let offer_object = match transport.create_server_object(
            device.client,
            Interface::DataOffer,
            device.version,
            Some(device.object),
        ) {
            Ok(object) => object,
            Err(err) => {
                debug!(?err, "failed to create selection offer");
                return;
            }
        };

        let offer_handle = self.offers.insert(OfferInner::new_selection(
            offer_object,
            device.client,
            device.object,
            handle,
            target,
        ));
        self.offer_by_object.insert(offer_object, offer_handle);

        let _ = transport.post_event(device.object, Event::DataOffer { id: offer_object });
        for mime_type in mime_types {
            let _ = transport.post_event(offer_object, Event::Offer { mime_type });
        }
        let event = match target {
            SelectionTarget::Clipboard => Event::Selection {
                offer: Some(offer_object),
            },
            SelectionTarget::Primary => Event::PrimarySelection {
                offer: Some(offer_object),
            },
        };
        let _ = transport.post_event(device.object, event);
    }
}
