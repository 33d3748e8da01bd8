//! Process-wide id allocation for seats.
//!
//! Ids are handed out monotonically and never recycled, so a stale
//! [`SeatId`](crate::selection::SeatId) can never alias a newer seat.

macro_rules! id_gen {
    ($mod_name:ident) => {
        mod $mod_name {
            use std::sync::atomic::{AtomicUsize, Ordering};

            static NEXT: AtomicUsize = AtomicUsize::new(0);

            pub(crate) fn next() -> usize {
                let id = NEXT.fetch_add(1, Ordering::Relaxed);
                if id == usize::MAX {
                    panic!("out of ids");
                }
                id
            }
        }
    };
}

pub(crate) use id_gen;
