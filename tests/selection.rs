//! Clipboard and control-device flows across several clients.

mod common;

use std::io::{Read, Write};

use common::{drain_errors, drain_events, TestState};
use quench::selection::{SeatId, SelectionTarget};
use quench::transport::{ClientId, Event, NewId, ObjectId, ProtocolError, Request, Transport};
use quench::utils::SERIAL_COUNTER;

fn bind_selection_manager(
    transport: &mut Transport,
    state: &TestState,
    client: ClientId,
    version: u32,
) -> ObjectId {
    transport
        .bind_global(
            client,
            state.selection.selection_global().unwrap(),
            NewId(1),
            version,
        )
        .unwrap()
}

fn data_device(
    transport: &mut Transport,
    state: &mut TestState,
    manager: ObjectId,
    seat: SeatId,
) -> ObjectId {
    quench::dispatch(transport, state, manager, Request::GetDevice { id: NewId(2), seat });
    transport.object(manager.client(), 2).unwrap()
}

fn source_with_mimes(
    transport: &mut Transport,
    state: &mut TestState,
    manager: ObjectId,
    id: u32,
    mimes: &[&str],
) -> ObjectId {
    quench::dispatch(transport, state, manager, Request::CreateSource { id: NewId(id) });
    let source = transport.object(manager.client(), id).unwrap();
    for mime in mimes {
        quench::dispatch(
            transport,
            state,
            source,
            Request::Offer {
                mime_type: mime.to_string(),
            },
        );
    }
    source
}

#[test]
fn clipboard_handoff_through_a_pipe() {
    let (mut transport, mut state) = TestState::new();
    let seat = state.selection.new_seat();
    let owner = transport.insert_client();
    let receiver = transport.insert_client();

    let mgr_owner = bind_selection_manager(&mut transport, &state, owner, 3);
    let mgr_receiver = bind_selection_manager(&mut transport, &state, receiver, 3);
    let dev_owner = data_device(&mut transport, &mut state, mgr_owner, seat);
    let _dev_receiver = data_device(&mut transport, &mut state, mgr_receiver, seat);

    state
        .selection
        .set_clipboard_focus(&mut transport, seat, Some(receiver));
    drain_events(&mut transport, receiver);

    let source = source_with_mimes(
        &mut transport,
        &mut state,
        mgr_owner,
        3,
        &["text/plain", "text/html"],
    );
    let serial = SERIAL_COUNTER.next_serial();
    quench::dispatch(
        &mut transport,
        &mut state,
        dev_owner,
        Request::SetSelection {
            source: Some(source),
            serial,
        },
    );

    assert_eq!(
        state.selections_seen,
        vec![(
            seat,
            SelectionTarget::Clipboard,
            Some(vec!["text/plain".to_string(), "text/html".to_string()])
        )]
    );

    // The focused client hears: offer introduction, the mime list in offer
    // order, then the selection itself.
    let events = drain_events(&mut transport, receiver);
    let offer = match &events[0] {
        (_, Event::DataOffer { id }) => *id,
        other => panic!("expected data_offer first, got {other:?}"),
    };
    let mimes: Vec<_> = events
        .iter()
        .filter_map(|(object, event)| match event {
            Event::Offer { mime_type } if *object == offer => Some(mime_type.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(mimes, ["text/plain", "text/html"]);
    assert!(matches!(
        events.last(),
        Some((_, Event::Selection { offer: Some(o) })) if *o == offer
    ));

    // Receive hands the pipe to the source owner; the bytes never touch the
    // compositor.
    let (read_end, write_end) = rustix::pipe::pipe().unwrap();
    quench::dispatch(
        &mut transport,
        &mut state,
        offer,
        Request::Receive {
            mime_type: "text/plain".to_string(),
            fd: write_end,
        },
    );

    let events = drain_events(&mut transport, owner);
    let fd = match events.into_iter().next() {
        Some((object, Event::Send { mime_type, fd })) => {
            assert_eq!(object, source);
            assert_eq!(mime_type, "text/plain");
            fd
        }
        other => panic!("expected send, got {other:?}"),
    };

    let mut writer = std::fs::File::from(fd);
    writer.write_all(b"hello clipboard").unwrap();
    drop(writer);

    let mut content = String::new();
    std::fs::File::from(read_end)
        .read_to_string(&mut content)
        .unwrap();
    assert_eq!(content, "hello clipboard");
}

#[test]
fn replacement_cancels_previous_and_refreshes_control() {
    let (mut transport, mut state) = TestState::new();
    let seat = state.selection.new_seat();
    let first = transport.insert_client();
    let second = transport.insert_client();
    let watcher = transport.insert_client();

    let mgr_first = bind_selection_manager(&mut transport, &state, first, 3);
    let mgr_second = bind_selection_manager(&mut transport, &state, second, 3);
    let dev_first = data_device(&mut transport, &mut state, mgr_first, seat);
    let dev_second = data_device(&mut transport, &mut state, mgr_second, seat);

    let control_mgr = transport
        .bind_global(watcher, state.selection.control_global().unwrap(), NewId(1), 2)
        .unwrap();
    quench::dispatch(
        &mut transport,
        &mut state,
        control_mgr,
        Request::GetControlDevice { id: NewId(2), seat },
    );
    let control_dev = transport.object(watcher, 2).unwrap();
    // Fresh control devices are told the (empty) selections right away.
    let events = drain_events(&mut transport, watcher);
    assert!(matches!(events[0], (_, Event::Selection { offer: None })));
    assert!(matches!(events[1], (_, Event::PrimarySelection { offer: None })));

    let source_a = source_with_mimes(&mut transport, &mut state, mgr_first, 3, &["text/plain"]);
    quench::dispatch(
        &mut transport,
        &mut state,
        dev_first,
        Request::SetSelection {
            source: Some(source_a),
            serial: SERIAL_COUNTER.next_serial(),
        },
    );
    let events = drain_events(&mut transport, watcher);
    assert!(matches!(events[0], (_, Event::DataOffer { .. })));

    let source_b = source_with_mimes(&mut transport, &mut state, mgr_second, 3, &["image/png"]);
    quench::dispatch(
        &mut transport,
        &mut state,
        dev_second,
        Request::SetSelection {
            source: Some(source_b),
            serial: SERIAL_COUNTER.next_serial(),
        },
    );

    // The replaced source hears exactly one cancelled.
    let cancelled = drain_events(&mut transport, first)
        .into_iter()
        .filter(|(object, event)| *object == source_a && matches!(event, Event::Cancelled))
        .count();
    assert_eq!(cancelled, 1);

    // The watcher gets a fresh offer carrying the new mime list.
    let events = drain_events(&mut transport, watcher);
    let offer = match &events[0] {
        (object, Event::DataOffer { id }) => {
            assert_eq!(*object, control_dev);
            *id
        }
        other => panic!("expected data_offer, got {other:?}"),
    };
    assert!(events
        .iter()
        .any(|(object, event)| *object == offer
            && matches!(event, Event::Offer { mime_type } if mime_type == "image/png")));

    // Replaying the same source is a no-op: nothing new anywhere.
    quench::dispatch(
        &mut transport,
        &mut state,
        dev_second,
        Request::SetSelection {
            source: Some(source_b),
            serial: SERIAL_COUNTER.next_serial(),
        },
    );
    assert!(drain_events(&mut transport, watcher).is_empty());
    assert!(drain_events(&mut transport, second).is_empty());
}

#[test]
fn stale_serial_is_silently_rejected() {
    let (mut transport, mut state) = TestState::new();
    let seat = state.selection.new_seat();
    let client = transport.insert_client();

    let manager = bind_selection_manager(&mut transport, &state, client, 3);
    let device = data_device(&mut transport, &mut state, manager, seat);

    let old_serial = SERIAL_COUNTER.next_serial();
    let fresh_serial = SERIAL_COUNTER.next_serial();

    let source_a = source_with_mimes(&mut transport, &mut state, manager, 3, &["text/plain"]);
    quench::dispatch(
        &mut transport,
        &mut state,
        device,
        Request::SetSelection {
            source: Some(source_a),
            serial: fresh_serial,
        },
    );
    assert_eq!(state.selections_seen.len(), 1);

    // A second set with an older serial is dropped without an error and
    // without disturbing the installed source.
    let source_b = source_with_mimes(&mut transport, &mut state, manager, 4, &["text/html"]);
    quench::dispatch(
        &mut transport,
        &mut state,
        device,
        Request::SetSelection {
            source: Some(source_b),
            serial: old_serial,
        },
    );
    assert_eq!(state.selections_seen.len(), 1);
    let cancelled = drain_events(&mut transport, client)
        .into_iter()
        .filter(|(object, event)| *object == source_a && matches!(event, Event::Cancelled))
        .count();
    assert_eq!(cancelled, 0);
    assert_eq!(
        state
            .selection
            .selection_mime_types(seat, SelectionTarget::Clipboard),
        Some(vec!["text/plain".to_string()])
    );
}

#[test]
fn control_echoing_the_selection_back_is_an_error() {
    let (mut transport, mut state) = TestState::new();
    let seat = state.selection.new_seat();
    let watcher = transport.insert_client();

    let control_mgr = transport
        .bind_global(watcher, state.selection.control_global().unwrap(), NewId(1), 2)
        .unwrap();
    quench::dispatch(
        &mut transport,
        &mut state,
        control_mgr,
        Request::GetControlDevice { id: NewId(2), seat },
    );
    let control_dev = transport.object(watcher, 2).unwrap();
    drain_events(&mut transport, watcher);

    let source = source_with_mimes(&mut transport, &mut state, control_mgr, 3, &["text/plain"]);
    quench::dispatch(
        &mut transport,
        &mut state,
        control_dev,
        Request::ControlSetSelection {
            source: Some(source),
        },
    );
    assert_eq!(state.selections_seen.len(), 1);
    assert!(!transport.is_doomed(watcher));

    // Offering the installed source back would loop the clipboard manager
    // through itself.
    quench::dispatch(
        &mut transport,
        &mut state,
        control_dev,
        Request::ControlSetSelection {
            source: Some(source),
        },
    );
    assert_eq!(drain_errors(&mut transport, watcher).len(), 1);
    assert!(transport.is_doomed(watcher));
}

#[test]
fn released_control_device_hears_finished() {
    let (mut transport, mut state) = TestState::new();
    let seat = state.selection.new_seat();
    let watcher = transport.insert_client();

    let control_mgr = transport
        .bind_global(watcher, state.selection.control_global().unwrap(), NewId(1), 2)
        .unwrap();
    quench::dispatch(
        &mut transport,
        &mut state,
        control_mgr,
        Request::GetControlDevice { id: NewId(2), seat },
    );
    let control_dev = transport.object(watcher, 2).unwrap();
    drain_events(&mut transport, watcher);

    quench::dispatch(&mut transport, &mut state, control_dev, Request::Release);
    let events = drain_events(&mut transport, watcher);
    assert!(events
        .iter()
        .any(|(object, event)| *object == control_dev
            && matches!(event, Event::ControlFinished)));
    assert!(!transport.alive(control_dev));

    // A regular data device detaches silently.
    let other = transport.insert_client();
    let manager = bind_selection_manager(&mut transport, &state, other, 3);
    let device = data_device(&mut transport, &mut state, manager, seat);
    quench::dispatch(&mut transport, &mut state, device, Request::Release);
    assert!(drain_events(&mut transport, other)
        .iter()
        .all(|(_, event)| !matches!(event, Event::ControlFinished)));
    assert!(!transport.alive(device));
}

#[test]
fn v1_control_device_never_hears_about_primary() {
    let (mut transport, mut state) = TestState::new();
    let seat = state.selection.new_seat();
    let watcher = transport.insert_client();

    let control_mgr = transport
        .bind_global(watcher, state.selection.control_global().unwrap(), NewId(1), 1)
        .unwrap();
    quench::dispatch(
        &mut transport,
        &mut state,
        control_mgr,
        Request::GetControlDevice { id: NewId(2), seat },
    );
    let events = drain_events(&mut transport, watcher);
    assert_eq!(events.len(), 1);
    assert!(matches!(events[0], (_, Event::Selection { offer: None })));
}

#[test]
fn v3_requests_on_v1_objects_are_an_error() {
    let (mut transport, mut state) = TestState::new();
    let seat = state.selection.new_seat();
    let owner = transport.insert_client();
    let receiver = transport.insert_client();

    let mgr_owner = bind_selection_manager(&mut transport, &state, owner, 3);
    let mgr_receiver = bind_selection_manager(&mut transport, &state, receiver, 1);
    let dev_owner = data_device(&mut transport, &mut state, mgr_owner, seat);
    let _dev_receiver = data_device(&mut transport, &mut state, mgr_receiver, seat);
    state
        .selection
        .set_clipboard_focus(&mut transport, seat, Some(receiver));
    drain_events(&mut transport, receiver);

    let source = source_with_mimes(&mut transport, &mut state, mgr_owner, 3, &["text/plain"]);
    quench::dispatch(
        &mut transport,
        &mut state,
        dev_owner,
        Request::SetSelection {
            source: Some(source),
            serial: SERIAL_COUNTER.next_serial(),
        },
    );
    let events = drain_events(&mut transport, receiver);
    let offer = match &events[0] {
        (_, Event::DataOffer { id }) => *id,
        other => panic!("expected data_offer, got {other:?}"),
    };

    // The offer inherited the device's v1 binding, where `finish` does not
    // exist yet.
    quench::dispatch(&mut transport, &mut state, offer, Request::Finish);
    assert_eq!(
        drain_errors(&mut transport, receiver),
        vec![ProtocolError::InvalidMethod.code()]
    );
    assert!(transport.is_doomed(receiver));
}

#[test]
fn disconnect_clears_the_owned_selection() {
    let (mut transport, mut state) = TestState::new();
    let seat = state.selection.new_seat();
    let owner = transport.insert_client();
    let other = transport.insert_client();

    let mgr_owner = bind_selection_manager(&mut transport, &state, owner, 3);
    let mgr_other = bind_selection_manager(&mut transport, &state, other, 3);
    let dev_owner = data_device(&mut transport, &mut state, mgr_owner, seat);
    let _dev_other = data_device(&mut transport, &mut state, mgr_other, seat);
    state
        .selection
        .set_clipboard_focus(&mut transport, seat, Some(other));
    drain_events(&mut transport, other);

    let source = source_with_mimes(&mut transport, &mut state, mgr_owner, 3, &["text/plain"]);
    quench::dispatch(
        &mut transport,
        &mut state,
        dev_owner,
        Request::SetSelection {
            source: Some(source),
            serial: SERIAL_COUNTER.next_serial(),
        },
    );
    drain_events(&mut transport, other);

    quench::client_disconnected(&mut transport, &mut state, owner);

    // The focused client sees the selection go away.
    state
        .selection
        .set_clipboard_focus(&mut transport, seat, Some(other));
    let events = drain_events(&mut transport, other);
    assert!(matches!(
        events.last(),
        Some((_, Event::Selection { offer: None }))
    ));
    assert_eq!(
        state
            .selection
            .selection_mime_types(seat, SelectionTarget::Clipboard),
        None
    );
}
