//! Pieces shared by every ember crate: logging bootstrap, the shutdown
//! signal, and the clock abstraction used for all wall-clock decisions.

pub mod clock;
pub mod logging;

pub use clock::{Clock, ManualClock, SystemClock};
pub use tracing;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Shutdown,
    Finalised,
}
