//! Control protocol types and framing
//!
//! Every message on the socket is a 4-byte big-endian length followed by that
//! many bytes of bincode (legacy configuration, serde encoding).

use std::fmt::{Display, Formatter};

use chrono::{DateTime, Utc};
use ember_delivery::CampaignReport;
use ember_store::{CampaignId, CampaignStatus};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{ControlError, Result};

/// Current protocol version
pub const PROTOCOL_VERSION: u32 = 1;

/// Request sent to the control server (versioned wrapper)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// Protocol version
    pub version: u32,
    /// The actual command to execute
    pub command: RequestCommand,
}

/// Request command types
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RequestCommand {
    /// Campaign lifecycle and reporting commands
    Campaign(CampaignCommand),
    /// System management commands
    System(SystemCommand),
}

/// Campaign commands
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CampaignCommand {
    /// Report on one campaign
    Status { id: CampaignId },
    /// List campaigns, optionally only those with one status
    List { status: Option<CampaignStatus> },
    /// Schedule a draft to start later
    Schedule { id: CampaignId, at: DateTime<Utc> },
    /// Start a draft or scheduled campaign now
    Start { id: CampaignId },
    /// Pause a sending campaign
    Pause { id: CampaignId },
    /// Resume a paused campaign
    Resume { id: CampaignId },
    /// Cancel a campaign that has not started
    Cancel { id: CampaignId },
}

impl CampaignCommand {
    /// Short verb for logs and messages
    #[must_use]
    pub const fn verb(&self) -> &'static str {
        match self {
            Self::Status { .. } => "status",
            Self::List { .. } => "list",
            Self::Schedule { .. } => "schedule",
            Self::Start { .. } => "start",
            Self::Pause { .. } => "pause",
            Self::Resume { .. } => "resume",
            Self::Cancel { .. } => "cancel",
        }
    }
}

/// System management commands
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SystemCommand {
    /// Health check / ping
    Ping,
    /// Get system status and statistics
    Status,
}

/// Response from the control server (versioned wrapper)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    /// Protocol version
    pub version: u32,
    /// The actual response payload
    pub payload: ResponsePayload,
}

/// Response payload types
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ResponsePayload {
    /// Command succeeded
    Ok,
    /// Command succeeded with data
    Data(Box<ResponseData>),
    /// Command failed with error message
    Error(String),
}

/// Response data types
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ResponseData {
    /// One campaign
    Campaign(Box<CampaignReport>),
    /// Several campaigns
    Campaigns(Vec<CampaignReport>),
    /// System status information
    SystemStatus(SystemStatus),
    /// Simple string message
    Message(String),
}

/// System status information
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemStatus {
    /// Server version
    pub version: String,
    /// Uptime in seconds
    pub uptime_secs: u64,
    /// Jobs waiting in the scheduler
    pub queued_jobs: usize,
    /// Number of campaigns in each non-empty status
    pub campaigns_by_status: Vec<(CampaignStatus, usize)>,
}

impl Display for SystemStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Version:      {}", self.version)?;
        writeln!(f, "Uptime:       {}", format_duration(self.uptime_secs))?;
        writeln!(f, "Queued jobs:  {}", self.queued_jobs)?;

        if self.campaigns_by_status.is_empty() {
            return writeln!(f, "Campaigns:    none");
        }

        writeln!(f, "Campaigns:")?;
        for (status, count) in &self.campaigns_by_status {
            writeln!(f, "  {:<18} {count}", status.as_str())?;
        }
        Ok(())
    }
}

/// Format a duration in seconds as `1d 2h 3m 4s`, dropping leading zero units
#[must_use]
pub fn format_duration(secs: u64) -> String {
    let days = secs / 86_400;
    let hours = (secs % 86_400) / 3_600;
    let minutes = (secs % 3_600) / 60;
    let seconds = secs % 60;

    if days > 0 {
        format!("{days}d {hours}h {minutes}m {seconds}s")
    } else if hours > 0 {
        format!("{hours}h {minutes}m {seconds}s")
    } else if minutes > 0 {
        format!("{minutes}m {seconds}s")
    } else {
        format!("{seconds}s")
    }
}

impl Request {
    /// Create a new request with the current protocol version
    #[must_use]
    pub const fn new(command: RequestCommand) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            command,
        }
    }

    #[must_use]
    pub const fn campaign(command: CampaignCommand) -> Self {
        Self::new(RequestCommand::Campaign(command))
    }

    #[must_use]
    pub const fn system(command: SystemCommand) -> Self {
        Self::new(RequestCommand::System(command))
    }

    /// Check if the request version is compatible with the current version
    #[must_use]
    pub const fn is_version_compatible(&self) -> bool {
        self.version == PROTOCOL_VERSION
    }
}

impl Response {
    /// Create an error response
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            payload: ResponsePayload::Error(message.into()),
        }
    }

    /// Create a success response with no data
    #[must_use]
    pub const fn ok() -> Self {
        Self {
            version: PROTOCOL_VERSION,
            payload: ResponsePayload::Ok,
        }
    }

    /// Create a response with data
    #[must_use]
    pub fn data(data: ResponseData) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            payload: ResponsePayload::Data(Box::new(data)),
        }
    }

    /// A plain text response
    #[must_use]
    pub fn message(message: impl Into<String>) -> Self {
        Self::data(ResponseData::Message(message.into()))
    }

    /// Check if the response indicates success (not an error)
    #[must_use]
    pub const fn is_success(&self) -> bool {
        !matches!(self.payload, ResponsePayload::Error(_))
    }

    /// Check if the response version is compatible with the current version
    #[must_use]
    pub const fn is_version_compatible(&self) -> bool {
        self.version == PROTOCOL_VERSION
    }
}

/// Write one length-prefixed frame
pub(crate) async fn write_frame<W, T>(stream: &mut W, value: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let bytes = bincode::serde::encode_to_vec(value, bincode::config::legacy())?;
    let len = u32::try_from(bytes.len())
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

    stream.write_all(&len.to_be_bytes()).await?;
    stream.write_all(&bytes).await?;
    stream.flush().await?;

    Ok(())
}

/// Read one length-prefixed frame of at most `max` bytes
pub(crate) async fn read_frame<R, T>(stream: &mut R, max: u32) -> Result<T>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            ControlError::ConnectionClosed
        } else {
            ControlError::Io(e)
        }
    })?;

    let size = u32::from_be_bytes(len_buf);
    if size > max {
        return Err(ControlError::FrameTooLarge { size, max });
    }

    let mut bytes = vec![0u8; size as usize];
    stream.read_exact(&mut bytes).await?;

    let (value, _) = bincode::serde::decode_from_slice(&bytes, bincode::config::legacy())?;
    Ok(value)
}
