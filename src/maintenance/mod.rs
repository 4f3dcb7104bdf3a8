//! Background housekeeping of the mirrors directory.

mod cleaner;
mod idle_gc;

pub use cleaner::{CleanupStats, MirrorCleaner};
pub use idle_gc::{GcStats, IdleGc, IdleGcHandle};
