//! Shared fixture: a compositor-like state with scripted outputs and a
//! loopback capture bus.

#![allow(dead_code)]

use std::cell::RefCell;
use std::io;
use std::rc::Rc;
use std::sync::Arc;

use quench::capture::{
    CaptureBuffer, CaptureConnection, CaptureHandler, CaptureSource, CaptureState, ConsumerEvent,
    CursorSnapshot, DamageList, OutputFrames, OutputId, OutputSource, RegionSource, StreamError,
    WindowId,
};
use quench::selection::{
    SeatId, SelectionHandler, SelectionState, SelectionTarget, SurfaceId, ToplevelAttachment,
};
use quench::transport::{ClientId, Event, ObjectId, OutboundMessage, Transport};
use quench::utils::{Point, Rectangle};

/// Scripted scene feed for one output, shared with the test body.
#[derive(Debug)]
pub struct OutputScript {
    pub geometry: Rectangle<i32>,
    /// Damage reported by the next `take_damage` call, then cleared.
    pub pending: Vec<Rectangle<i32>>,
    /// Byte value `render_section` writes into every touched pixel.
    pub fill: u8,
    pub alive: bool,
}

#[derive(Debug)]
pub struct ScriptedOutput(pub Rc<RefCell<OutputScript>>);

impl OutputFrames for ScriptedOutput {
    fn geometry(&self) -> Rectangle<i32> {
        self.0.borrow().geometry
    }

    fn refresh_rate(&self) -> u32 {
        60_000
    }

    fn take_damage(&mut self) -> DamageList {
        self.0.borrow_mut().pending.drain(..).collect()
    }

    fn render_section(
        &mut self,
        target: &mut CaptureBuffer,
        src: Rectangle<i32>,
        dst: Point<i32>,
        _cursor: Option<&CursorSnapshot>,
    ) -> Result<(), StreamError> {
        let fill = self.0.borrow().fill;
        let stride = target.stride() as usize;
        let data = target
            .shm_data_mut()
            .ok_or_else(|| StreamError::RenderFailed("shm buffer expected".into()))?;
        for row in 0..src.size.h {
            let y = (dst.y + row) as usize;
            let from = y * stride + dst.x as usize * 4;
            let to = from + src.size.w as usize * 4;
            data[from..to].fill(fill);
        }
        Ok(())
    }

    fn alive(&self) -> bool {
        self.0.borrow().alive
    }
}

pub struct TestState {
    pub selection: SelectionState,
    pub capture: CaptureState,
    /// Pre-opened bus connection, usually the loopback.
    pub connection: Option<Arc<CaptureConnection>>,
    /// Consumer event channels handed over by `stream_ready`.
    pub channels: Vec<(u32, calloop::channel::Channel<ConsumerEvent>)>,
    /// Outputs the capture hooks build sources from, indexed by `OutputId`.
    pub outputs: Vec<Rc<RefCell<OutputScript>>>,
    pub cursor: Option<CursorSnapshot>,
    /// `new_selection` notifications, oldest first.
    pub selections_seen: Vec<(SeatId, SelectionTarget, Option<Vec<String>>)>,
    pub drags_started: Vec<(SeatId, Option<SurfaceId>)>,
    pub drops: Vec<(SeatId, Option<ToplevelAttachment>)>,
}

impl TestState {
    pub fn new() -> (Transport, TestState) {
        let mut transport = Transport::new();
        let mut state = TestState {
            selection: SelectionState::new(),
            capture: CaptureState::new(),
            connection: None,
            channels: Vec::new(),
            outputs: Vec::new(),
            cursor: None,
            selections_seen: Vec::new(),
            drags_started: Vec::new(),
            drops: Vec::new(),
        };
        state.selection.create_globals(&mut transport);
        state.capture.create_global(&mut transport);
        (transport, state)
    }

    pub fn add_output(&mut self, geometry: Rectangle<i32>, fill: u8) -> Rc<RefCell<OutputScript>> {
        let script = Rc::new(RefCell::new(OutputScript {
            geometry,
            pending: Vec::new(),
            fill,
            alive: true,
        }));
        self.outputs.push(script.clone());
        script
    }

    fn boxed_outputs(&self) -> Vec<Box<dyn OutputFrames>> {
        self.outputs
            .iter()
            .map(|script| Box::new(ScriptedOutput(script.clone())) as Box<dyn OutputFrames>)
            .collect()
    }
}

impl SelectionHandler for TestState {
    fn selection_state(&mut self) -> &mut SelectionState {
        &mut self.selection
    }

    fn new_selection(
        &mut self,
        seat: SeatId,
        target: SelectionTarget,
        mime_types: Option<Vec<String>>,
    ) {
        self.selections_seen.push((seat, target, mime_types));
    }

    fn drag_started(&mut self, seat: SeatId, icon: Option<SurfaceId>) {
        self.drags_started.push((seat, icon));
    }

    fn dropped(&mut self, seat: SeatId, toplevel: Option<ToplevelAttachment>) {
        self.drops.push((seat, toplevel));
    }
}

impl CaptureHandler for TestState {
    fn capture_state(&mut self) -> &mut CaptureState {
        &mut self.capture
    }

    fn output_source(&mut self, output: OutputId) -> Option<Box<dyn CaptureSource>> {
        let script = self.outputs.get(output.0 as usize)?.clone();
        Some(Box::new(OutputSource::new(Box::new(ScriptedOutput(script)))))
    }

    fn window_source(&mut self, _window: WindowId) -> Option<Box<dyn CaptureSource>> {
        None
    }

    fn region_source(&mut self, rect: Rectangle<i32>, scale: f64) -> Option<Box<dyn CaptureSource>> {
        if self.outputs.is_empty() {
            return None;
        }
        Some(Box::new(RegionSource::new(rect, scale, self.boxed_outputs())))
    }

    fn open_connection(&mut self) -> io::Result<Arc<CaptureConnection>> {
        self.connection
            .clone()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "no capture bus"))
    }

    fn stream_ready(&mut self, node_id: u32, events: calloop::channel::Channel<ConsumerEvent>) {
        self.channels.push((node_id, events));
    }

    fn cursor_snapshot(&mut self) -> Option<CursorSnapshot> {
        self.cursor.clone()
    }
}

/// Forward everything the bus consumers sent into the capture state machine.
pub fn pump_consumers(transport: &mut Transport, state: &mut TestState) {
    let channels = std::mem::take(&mut state.channels);
    for (node_id, channel) in &channels {
        while let Ok(event) = channel.try_recv() {
            quench::capture::consumer_event(transport, state, *node_id, event);
        }
    }
    state.channels = channels;
}

/// All queued messages for `client`, leaving the queue empty.
pub fn drain(transport: &mut Transport, client: ClientId) -> Vec<OutboundMessage> {
    transport.drain_messages(client)
}

/// Only the events, panicking on a queued protocol error.
pub fn drain_events(transport: &mut Transport, client: ClientId) -> Vec<(ObjectId, Event)> {
    drain(transport, client)
        .into_iter()
        .map(|message| match message {
            OutboundMessage::Event { object, event } => (object, event),
            OutboundMessage::Error { code, message, .. } => {
                panic!("unexpected protocol error {code}: {message}")
            }
        })
        .collect()
}

/// The error codes in the queue, dropping everything else.
pub fn drain_errors(transport: &mut Transport, client: ClientId) -> Vec<u32> {
    drain(transport, client)
        .into_iter()
        .filter_map(|message| match message {
            OutboundMessage::Error { code, .. } => Some(code),
            OutboundMessage::Event { .. } => None,
        })
        .collect()
}
