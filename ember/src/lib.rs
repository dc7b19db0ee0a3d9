pub mod control_handler;
pub mod controller;
pub mod seed;

pub use control_handler::EmberControlHandler;
pub use controller::{Daemon, Ember};
