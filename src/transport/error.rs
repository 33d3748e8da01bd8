use super::{ClientId, Interface, ObjectId};

/// Errors raised by transport operations.
///
/// All of these are scoped to a single client; none of them are fatal to the
/// compositor.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The referenced client is not connected.
    #[error("client {0:?} is not connected")]
    UnknownClient(ClientId),
    /// The referenced object does not exist or was destroyed.
    #[error("object {0:?} is dead or was never created")]
    DeadObject(ObjectId),
    /// An object id points at an object of an unexpected interface.
    #[error("object {object:?} is a {found:?}, expected {expected:?}")]
    WrongInterface {
        /// The offending object
        object: ObjectId,
        /// Interface the object actually has
        found: Interface,
        /// Interface the operation required
        expected: Interface,
    },
    /// A client re-used an object id that is still in use.
    #[error("object id {0} is already in use")]
    IdInUse(u32),
    /// The referenced global was removed.
    #[error("the global is no longer advertised")]
    DeadGlobal,
}

/// A protocol violation committed by a client.
///
/// Posting one of these through [`Transport::post_error`](super::Transport::post_error)
/// queues a fatal error event and dooms the client; the embedder is expected
/// to follow up with a disconnect on the next dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolError {
    /// Request sent to an object of the wrong interface, or after destruction.
    InvalidObject,
    /// A `new_id` collided with a live object.
    InvalidNewId,
    /// `finish` called on an offer that cannot be finished.
    InvalidFinish,
    /// An invalid action mask or preferred action.
    InvalidAction,
    /// `start_drag` with an invalid or stale serial/grab.
    InvalidGrab,
    /// A control device re-used the seat's current source, or raced a drag.
    InvalidSource,
    /// An invalid cursor mode or capture argument.
    InvalidArgument,
    /// A request introduced after the version the object was bound at.
    InvalidMethod,
}

impl ProtocolError {
    /// Wire error code, assigned in declaration order.
    pub fn code(self) -> u32 {
        self as u32
    }
}
