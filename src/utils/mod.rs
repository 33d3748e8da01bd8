//! Various utilities functions and types

mod clock;
mod geometry;
pub(crate) mod ids;
mod serial;

pub use self::clock::{Clock, Monotonic, Time};
pub use self::geometry::{Point, Rectangle, Size};
pub use self::serial::{Serial, SerialCounter, SERIAL_COUNTER};
