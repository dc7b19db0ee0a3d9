//! Command-line utility for managing the ember daemon
//!
//! This tool talks to a running daemon over its control socket:
//! - Campaign lifecycle (schedule, start, pause, resume, cancel)
//! - Campaign reports, once or continuously in watch mode
//! - System status and health checks

use std::time::Duration;

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use ember_control::{
    CampaignCommand, ControlClient, DEFAULT_CONTROL_SOCKET, Request, ResponseData,
    ResponsePayload, SystemCommand,
};
use ember_delivery::CampaignReport;
use ember_store::{CampaignId, CampaignStatus};

/// Command-line utility for managing the ember daemon
#[derive(Parser, Debug)]
#[command(name = "emberctl")]
#[command(about = "Manage the ember campaign delivery daemon", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to the control socket
    #[arg(short = 'c', long, default_value = DEFAULT_CONTROL_SOCKET)]
    control_socket: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Campaign lifecycle and reports
    Campaign {
        #[command(subcommand)]
        action: CampaignAction,
    },
    /// System status and health
    System {
        #[command(subcommand)]
        action: SystemAction,
    },
}

#[derive(Subcommand, Debug)]
enum CampaignAction {
    /// List campaigns
    List {
        /// Only campaigns with this status (e.g. `sending`, `paused`)
        #[arg(long)]
        status: Option<CampaignStatus>,
    },
    /// Show one campaign's report
    Status {
        id: CampaignId,

        /// Watch mode - continuously update the report
        #[arg(long)]
        watch: bool,

        /// Update interval in seconds (for watch mode)
        #[arg(long, default_value = "2")]
        interval: u64,
    },
    /// Schedule a draft to start at an RFC 3339 time
    Schedule { id: CampaignId, at: DateTime<Utc> },
    /// Start a draft or scheduled campaign now
    Start { id: CampaignId },
    /// Pause a sending campaign
    Pause { id: CampaignId },
    /// Resume a paused campaign
    Resume { id: CampaignId },
    /// Cancel a campaign that has not started sending
    Cancel { id: CampaignId },
}

#[derive(Subcommand, Debug)]
enum SystemAction {
    /// Check if the daemon is responding
    Ping,
    /// Get system status and statistics
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    let client = check_control_socket(&cli.control_socket)?;

    match cli.command {
        Commands::Campaign { action } => handle_campaign_command(client, action).await,
        Commands::System { action } => handle_system_command(&client, action).await,
    }
}

/// Check control socket connectivity and return client
fn check_control_socket(socket_path: &str) -> anyhow::Result<ControlClient> {
    let client = ControlClient::new(socket_path);

    if let Err(e) = client.check_socket_exists() {
        anyhow::bail!(
            "Cannot connect to the ember control socket at {socket_path}.\n\
             Error: {e}\n\
             \n\
             Is ember running?\n\
             You can configure the socket path with --control-socket or in ember.config.ron"
        );
    }

    Ok(client)
}

fn print_reports(reports: &[CampaignReport]) {
    if reports.is_empty() {
        println!("No campaigns");
        return;
    }

    println!(
        "{:<28} {:<18} {:>8} {:>8} {:>7}  {:<}",
        "CAMPAIGN ID", "STATUS", "SENT", "TOTAL", "DONE", "NAME"
    );
    println!("{}", "-".repeat(90));
    for report in reports {
        println!(
            "{:<28} {:<18} {:>8} {:>8} {:>6.1}%  {}",
            report.id.to_string(),
            report.status.as_str(),
            report.sent_count,
            report.total_recipients,
            report.percent_complete,
            report.name
        );
    }
    println!("\nTotal: {} campaign(s)", reports.len());
}

fn print_payload(payload: ResponsePayload) -> anyhow::Result<()> {
    match payload {
        ResponsePayload::Ok => println!("✓ Command completed successfully"),
        ResponsePayload::Data(data) => match *data {
            ResponseData::Campaign(report) => println!("{report}"),
            ResponseData::Campaigns(reports) => print_reports(&reports),
            ResponseData::SystemStatus(status) => {
                println!("=== ember System Status ===\n");
                print!("{status}");
            }
            ResponseData::Message(message) => println!("✓ {message}"),
        },
        ResponsePayload::Error(err) => anyhow::bail!("Server error: {err}"),
    }
    Ok(())
}

/// Handle campaign commands
async fn handle_campaign_command(
    client: ControlClient,
    action: CampaignAction,
) -> anyhow::Result<()> {
    let command = match action {
        CampaignAction::Status {
            id,
            watch: true,
            interval,
        } => return watch_campaign(client, id, interval).await,
        CampaignAction::Status { id, .. } => CampaignCommand::Status { id },
        CampaignAction::List { status } => CampaignCommand::List { status },
        CampaignAction::Schedule { id, at } => CampaignCommand::Schedule { id, at },
        CampaignAction::Start { id } => CampaignCommand::Start { id },
        CampaignAction::Pause { id } => CampaignCommand::Pause { id },
        CampaignAction::Resume { id } => CampaignCommand::Resume { id },
        CampaignAction::Cancel { id } => CampaignCommand::Cancel { id },
    };

    let response = client.send_request(Request::campaign(command)).await?;
    print_payload(response.payload)
}

/// Redraw a campaign's report until it reaches a terminal status
async fn watch_campaign(client: ControlClient, id: CampaignId, interval: u64) -> anyhow::Result<()> {
    let client = client.with_persistent_connection();

    loop {
        let response = client
            .send_request(Request::campaign(CampaignCommand::Status { id }))
            .await?;

        // Clear screen
        print!("\x1B[2J\x1B[1;1H");

        let terminal = matches!(
            &response.payload,
            ResponsePayload::Data(data)
                if matches!(data.as_ref(), ResponseData::Campaign(report) if report.status.is_terminal())
        );
        print_payload(response.payload)?;

        if terminal {
            return Ok(());
        }

        println!("\nPress Ctrl+C to exit");
        tokio::time::sleep(Duration::from_secs(interval)).await;
    }
}

/// Handle system management commands
async fn handle_system_command(client: &ControlClient, action: SystemAction) -> anyhow::Result<()> {
    match action {
        SystemAction::Ping => {
            client.send_request(Request::system(SystemCommand::Ping)).await?;
            println!("✓ ember is running");
            Ok(())
        }
        SystemAction::Status => {
            let response = client
                .send_request(Request::system(SystemCommand::Status))
                .await?;
            print_payload(response.payload)
        }
    }
}
