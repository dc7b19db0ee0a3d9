//! Control protocol for managing a running ember instance
//!
//! This module provides an IPC mechanism using Unix domain sockets to:
//! - Schedule, start, pause, resume and cancel campaigns
//! - Report on a single campaign or list campaigns by status
//! - Check that the engine is alive and how much work it has queued
//!
//! The protocol uses bincode for efficient serialization.

pub mod client;
pub mod error;
pub mod protocol;
pub mod server;

pub use client::ControlClient;
pub use error::{ControlError, Result};
pub use protocol::{
    CampaignCommand, PROTOCOL_VERSION, Request, RequestCommand, Response, ResponseData,
    ResponsePayload, SystemCommand, SystemStatus,
};
pub use server::{CommandHandler, ControlServer};

/// Default path for the control socket
pub const DEFAULT_CONTROL_SOCKET: &str = "/tmp/ember.sock";
