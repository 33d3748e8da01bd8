//! Process-local object broker.
//!
//! This module hosts the typed protocol objects owned by connected clients,
//! routes requests to them and queues events back, preserving per-client FIFO
//! ordering. It is deliberately *not* a general purpose IPC bus: the set of
//! interfaces is the closed [`Interface`] enum and all payloads are typed
//! Rust values, file descriptors included.
//!
//! Objects form a forest per client: destroying a parent destroys its
//! children first, and disconnecting a client destroys everything leaf-first.
//! The broker only records interface, version and lineage; the per-object
//! *state* lives in the owning subsystem ([`selection`](crate::selection),
//! [`capture`](crate::capture)), keyed by [`ObjectId`]. Ids carry a
//! generation so a stale reference to a destroyed-and-reused id is detected
//! instead of aliasing a new object.
//!
//! Every object has a version negotiated at bind time; events above that
//! version are never queued ([`Transport::post_event`] drops them). A
//! malformed request is answered with [`Transport::post_error`], which queues
//! a fatal error message and dooms the client; the compositor itself never
//! aborts on client input.

use std::collections::{HashMap, VecDeque};

use tracing::{debug, trace};

mod error;
mod message;

pub use error::{ProtocolError, TransportError};
pub use message::{Event, NewId, OutboundMessage, Request};

/// Lowest object id reserved for server-created objects.
///
/// Client-chosen ids must stay below this, mirroring the wayland id space
/// split.
pub const SERVER_ID_BASE: u32 = 0xFF00_0000;

/// The interfaces this broker can host.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Interface {
    /// Selection manager global; creates sources and per-seat devices.
    SeatSelectionManager,
    /// Privileged control manager global for clipboard managers.
    ControlManager,
    /// A client's offer of transferable content.
    DataSource,
    /// Per-seat, focus-scoped selection and drag endpoint.
    DataDevice,
    /// Receiver-side view of a data source.
    DataOffer,
    /// Privileged selection observer, exempt from focus.
    ControlDevice,
    /// Capture manager global.
    CaptureManager,
    /// One live capture stream.
    CaptureStream,
}

impl Interface {
    /// Highest version of this interface the compositor implements.
    pub fn max_version(self) -> u32 {
        match self {
            Interface::SeatSelectionManager => 3,
            Interface::DataSource | Interface::DataDevice | Interface::DataOffer => 3,
            Interface::ControlManager | Interface::ControlDevice => 2,
            Interface::CaptureManager | Interface::CaptureStream => 1,
        }
    }
}

/// Identifier of a connected client.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(pub(crate) u32);

/// Identifier of a protocol object, scoped to one client.
///
/// Carries a generation: once the object is destroyed, the id never resolves
/// again, even if the numeric id is reused.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct ObjectId {
    pub(crate) client: ClientId,
    pub(crate) id: u32,
    pub(crate) generation: u32,
}

impl ObjectId {
    /// The client owning this object.
    pub fn client(&self) -> ClientId {
        self.client
    }

    /// The numeric protocol id.
    pub fn protocol_id(&self) -> u32 {
        self.id
    }

    /// Whether both objects belong to the same client.
    pub fn same_client_as(&self, other: &ObjectId) -> bool {
        self.client == other.client
    }
}

/// Handle to an advertised global.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct GlobalId(usize);

/// An object destroyed as part of a teardown, reported to the dispatcher so
/// per-kind destructors can run before the next dispatch.
#[derive(Debug, Copy, Clone)]
pub struct DestroyedObject {
    /// The destroyed object
    pub id: ObjectId,
    /// Its interface
    pub interface: Interface,
}

#[derive(Debug)]
struct GlobalEntry {
    interface: Interface,
    version: u32,
    alive: bool,
}

#[derive(Debug)]
struct ObjectEntry {
    interface: Interface,
    version: u32,
    generation: u32,
    parent: Option<u32>,
    children: Vec<u32>,
}

#[derive(Debug, Default)]
struct ClientState {
    objects: HashMap<u32, ObjectEntry>,
    queue: VecDeque<OutboundMessage>,
    next_generation: u32,
    next_server_id: u32,
    doomed: bool,
}

/// The object broker.
#[derive(Debug, Default)]
pub struct Transport {
    clients: HashMap<ClientId, ClientState>,
    globals: Vec<GlobalEntry>,
    next_client: u32,
}

impl Transport {
    /// Create an empty broker with no globals and no clients.
    pub fn new() -> Self {
        Default::default()
    }

    /// Publish a global singleton clients may bind.
    pub fn create_global(&mut self, interface: Interface, version: u32) -> GlobalId {
        debug_assert!(version <= interface.max_version());
        self.globals.push(GlobalEntry {
            interface,
            version,
            alive: true,
        });
        GlobalId(self.globals.len() - 1)
    }

    /// Stop advertising a global. Already-bound objects stay alive.
    pub fn remove_global(&mut self, global: GlobalId) {
        if let Some(entry) = self.globals.get_mut(global.0) {
            entry.alive = false;
        }
    }

    /// Register a newly connected client.
    pub fn insert_client(&mut self) -> ClientId {
        let id = ClientId(self.next_client);
        self.next_client += 1;
        self.clients.insert(
            id,
            ClientState {
                next_server_id: SERVER_ID_BASE,
                ..Default::default()
            },
        );
        id
    }

    /// Whether the client is still connected.
    pub fn is_connected(&self, client: ClientId) -> bool {
        self.clients.contains_key(&client)
    }

    /// Whether the client committed a fatal error and awaits disconnection.
    pub fn is_doomed(&self, client: ClientId) -> bool {
        self.clients.get(&client).map(|c| c.doomed).unwrap_or(false)
    }

    /// Bind a global, creating a per-client root object for it.
    ///
    /// The bound version is the smaller of the advertised version and the
    /// client's request.
    pub fn bind_global(
        &mut self,
        client: ClientId,
        global: GlobalId,
        id: NewId,
        version: u32,
    ) -> Result<ObjectId, TransportError> {
        let entry = self.globals.get(global.0).ok_or(TransportError::DeadGlobal)?;
        if !entry.alive {
            return Err(TransportError::DeadGlobal);
        }
        let (interface, bound) = (entry.interface, entry.version.min(version));
        self.new_object(client, id.0, interface, bound, None)
    }

    /// Create an object in response to a client request carrying a `new_id`.
    ///
    /// The new object is a child of `parent` and inherits its version.
    pub fn create_child(
        &mut self,
        parent: ObjectId,
        interface: Interface,
        id: NewId,
    ) -> Result<ObjectId, TransportError> {
        if id.0 >= SERVER_ID_BASE {
            return Err(TransportError::IdInUse(id.0));
        }
        let version = self.entry(parent)?.version;
        self.new_object(parent.client, id.0, interface, version, Some(parent.id))
    }

    /// Create a server-side object (e.g. a data offer) on a client.
    ///
    /// The id is allocated from the server range; `version` is usually the
    /// version of the device the object is emitted through.
    pub fn create_server_object(
        &mut self,
        client: ClientId,
        interface: Interface,
        version: u32,
        parent: Option<ObjectId>,
    ) -> Result<ObjectId, TransportError> {
        let parent_id = match parent {
            Some(p) => {
                self.entry(p)?;
                Some(p.id)
            }
            None => None,
        };
        let state = self
            .clients
            .get_mut(&client)
            .ok_or(TransportError::UnknownClient(client))?;
        let id = state.next_server_id;
        state.next_server_id += 1;
        self.new_object(client, id, interface, version, parent_id)
    }

    fn new_object(
        &mut self,
        client: ClientId,
        id: u32,
        interface: Interface,
        version: u32,
        parent: Option<u32>,
    ) -> Result<ObjectId, TransportError> {
        let state = self
            .clients
            .get_mut(&client)
            .ok_or(TransportError::UnknownClient(client))?;
        if state.objects.contains_key(&id) {
            return Err(TransportError::IdInUse(id));
        }
        state.next_generation += 1;
        let generation = state.next_generation;
        state.objects.insert(
            id,
            ObjectEntry {
                interface,
                version,
                generation,
                parent,
                children: Vec::new(),
            },
        );
        if let Some(parent) = parent {
            if let Some(parent_entry) = state.objects.get_mut(&parent) {
                parent_entry.children.push(id);
            }
        }
        trace!(?client, id, ?interface, version, "created object");
        Ok(ObjectId {
            client,
            id,
            generation,
        })
    }

    fn entry(&self, object: ObjectId) -> Result<&ObjectEntry, TransportError> {
        let state = self
            .clients
            .get(&object.client)
            .ok_or(TransportError::UnknownClient(object.client))?;
        let entry = state
            .objects
            .get(&object.id)
            .ok_or(TransportError::DeadObject(object))?;
        if entry.generation != object.generation {
            return Err(TransportError::DeadObject(object));
        }
        Ok(entry)
    }

    /// Whether the object still exists.
    pub fn alive(&self, object: ObjectId) -> bool {
        self.entry(object).is_ok()
    }

    /// Resolve a client's numeric id to the live object behind it, as needed
    /// when decoding ids out of incoming client messages.
    pub fn object(&self, client: ClientId, id: u32) -> Option<ObjectId> {
        let entry = self.clients.get(&client)?.objects.get(&id)?;
        Some(ObjectId {
            client,
            id,
            generation: entry.generation,
        })
    }

    /// The interface of a live object.
    pub fn interface(&self, object: ObjectId) -> Result<Interface, TransportError> {
        self.entry(object).map(|e| e.interface)
    }

    /// The negotiated version of a live object.
    pub fn version(&self, object: ObjectId) -> Result<u32, TransportError> {
        self.entry(object).map(|e| e.version)
    }

    /// Check that `object` is live and of the expected interface.
    pub fn expect_interface(
        &self,
        object: ObjectId,
        expected: Interface,
    ) -> Result<(), TransportError> {
        let found = self.interface(object)?;
        if found != expected {
            return Err(TransportError::WrongInterface {
                object,
                found,
                expected,
            });
        }
        Ok(())
    }

    /// Queue an event for delivery to the object's client.
    ///
    /// Events newer than the object's bound version are silently discarded;
    /// they must never reach the client.
    pub fn post_event(&mut self, object: ObjectId, event: Event) -> Result<(), TransportError> {
        let entry = self.entry(object)?;
        if event.since(entry.interface) > entry.version {
            trace!(?object, ?event, "discarding event above bound version");
            return Ok(());
        }
        let state = self.clients.get_mut(&object.client).unwrap();
        state.queue.push_back(OutboundMessage::Event { object, event });
        Ok(())
    }

    /// Queue a fatal protocol error and doom the client.
    ///
    /// The embedder is expected to flush the queue and then call
    /// [`crate::client_disconnected`] before dispatching anything further
    /// from this client.
    pub fn post_error(&mut self, object: ObjectId, error: ProtocolError, message: impl Into<String>) {
        let message = message.into();
        debug!(?object, ?error, message, "protocol error");
        if let Some(state) = self.clients.get_mut(&object.client) {
            state.queue.push_back(OutboundMessage::Error {
                object,
                code: error.code(),
                message,
            });
            state.doomed = true;
        }
    }

    /// Destroy an object and, leaf-first, all of its children.
    ///
    /// Returns the destroyed objects in destruction order so the dispatcher
    /// can run per-kind destructors synchronously before the next dispatch.
    pub fn destroy_object(&mut self, object: ObjectId) -> Vec<DestroyedObject> {
        let mut destroyed = Vec::new();
        if self.entry(object).is_err() {
            return destroyed;
        }
        self.destroy_recursive(object.client, object.id, &mut destroyed);
        // Unlink from the parent's child list.
        if let Some(state) = self.clients.get_mut(&object.client) {
            for entry in state.objects.values_mut() {
                entry.children.retain(|&c| c != object.id);
            }
        }
        destroyed
    }

    fn destroy_recursive(&mut self, client: ClientId, id: u32, out: &mut Vec<DestroyedObject>) {
        let Some(state) = self.clients.get_mut(&client) else {
            return;
        };
        let Some(entry) = state.objects.get(&id) else {
            return;
        };
        let children = entry.children.clone();
        for child in children {
            self.destroy_recursive(client, child, out);
        }
        let state = self.clients.get_mut(&client).unwrap();
        if let Some(entry) = state.objects.remove(&id) {
            out.push(DestroyedObject {
                id: ObjectId {
                    client,
                    id,
                    generation: entry.generation,
                },
                interface: entry.interface,
            });
        }
    }

    /// Disconnect a client, destroying all of its objects leaf-first.
    ///
    /// Returns the destroyed objects in destruction order. The client's
    /// event queue is discarded.
    pub fn disconnect_client(&mut self, client: ClientId) -> Vec<DestroyedObject> {
        let mut destroyed = Vec::new();
        let Some(state) = self.clients.get(&client) else {
            return destroyed;
        };
        let roots: Vec<u32> = state
            .objects
            .iter()
            .filter(|(_, e)| e.parent.is_none())
            .map(|(&id, _)| id)
            .collect();
        for root in roots {
            self.destroy_recursive(client, root, &mut destroyed);
        }
        self.clients.remove(&client);
        debug!(?client, objects = destroyed.len(), "client disconnected");
        destroyed
    }

    /// Drain all queued messages for a client, in FIFO order.
    pub fn drain_messages(&mut self, client: ClientId) -> Vec<OutboundMessage> {
        self.clients
            .get_mut(&client)
            .map(|state| state.queue.drain(..).collect())
            .unwrap_or_default()
    }

    /// Pop the oldest queued message for a client.
    pub fn next_message(&mut self, client: ClientId) -> Option<OutboundMessage> {
        self.clients.get_mut(&client)?.queue.pop_front()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_destruction_is_leaf_first() {
        let mut transport = Transport::new();
        let global = transport.create_global(Interface::SeatSelectionManager, 1);
        let client = transport.insert_client();
        let manager = transport.bind_global(client, global, NewId(1), 1).unwrap();
        let device = transport
            .create_child(manager, Interface::DataDevice, NewId(2))
            .unwrap();
        let offer = transport
            .create_server_object(client, Interface::DataOffer, 3, Some(device))
            .unwrap();

        let destroyed = transport.destroy_object(manager);
        let order: Vec<u32> = destroyed.iter().map(|d| d.id.id).collect();
        assert_eq!(order, vec![offer.id, device.id, manager.id]);
        assert!(!transport.alive(offer));
    }

    #[test]
    fn stale_generation_does_not_resolve() {
        let mut transport = Transport::new();
        let global = transport.create_global(Interface::SeatSelectionManager, 1);
        let client = transport.insert_client();
        let obj = transport.bind_global(client, global, NewId(1), 1).unwrap();
        transport.destroy_object(obj);
        // Same numeric id, fresh object.
        let replacement = transport.bind_global(client, global, NewId(1), 1).unwrap();
        assert!(transport.alive(replacement));
        assert!(!transport.alive(obj));
    }

    #[test]
    fn version_gates_events() {
        let mut transport = Transport::new();
        let global = transport.create_global(Interface::SeatSelectionManager, 1);
        let client = transport.insert_client();
        let manager = transport.bind_global(client, global, NewId(1), 1).unwrap();
        // A v1 source must not see the v3 dnd_finished event.
        let source = transport
            .create_server_object(client, Interface::DataSource, 1, Some(manager))
            .unwrap();
        transport.drain_messages(client);
        transport.post_event(source, Event::DndFinished).unwrap();
        assert!(transport.next_message(client).is_none());
        transport.post_event(source, Event::Cancelled).unwrap();
        assert!(matches!(
            transport.next_message(client),
            Some(OutboundMessage::Event {
                event: Event::Cancelled,
                ..
            })
        ));
    }

    #[test]
    fn error_dooms_client() {
        let mut transport = Transport::new();
        let global = transport.create_global(Interface::SeatSelectionManager, 1);
        let client = transport.insert_client();
        let obj = transport.bind_global(client, global, NewId(1), 1).unwrap();
        transport.post_error(obj, ProtocolError::InvalidObject, "no such object");
        assert!(transport.is_doomed(client));
    }
}
