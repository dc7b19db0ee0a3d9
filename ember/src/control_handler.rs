//! Control handler for the ember daemon
//!
//! Implements [`CommandHandler`] on top of the [`CampaignService`] trait so
//! the control socket never reaches into processor internals.

use std::{sync::Arc, time::Instant};

use async_trait::async_trait;
use ember_common::tracing;
use ember_control::{
    CampaignCommand, CommandHandler, ControlError, Request, RequestCommand, Response,
    ResponseData, SystemCommand, SystemStatus,
};
use ember_delivery::{CampaignService, DeliveryError};

/// Handler for control commands
pub struct EmberControlHandler {
    service: Arc<dyn CampaignService>,
    /// Server start time for uptime calculation
    start_time: Instant,
}

impl EmberControlHandler {
    #[must_use]
    pub fn new(service: Arc<dyn CampaignService>) -> Self {
        Self {
            service,
            start_time: Instant::now(),
        }
    }
}

fn server_error(e: &DeliveryError) -> ControlError {
    ControlError::ServerError(e.to_string())
}

#[async_trait]
impl CommandHandler for EmberControlHandler {
    async fn handle_request(&self, request: Request) -> ember_control::Result<Response> {
        match request.command {
            RequestCommand::Campaign(command) => self.handle_campaign_command(command).await,
            RequestCommand::System(command) => self.handle_system_command(command).await,
        }
    }
}

impl EmberControlHandler {
    async fn handle_campaign_command(
        &self,
        command: CampaignCommand,
    ) -> ember_control::Result<Response> {
        tracing::debug!(verb = command.verb(), "Handling campaign command");

        let changed = match &command {
            CampaignCommand::Status { id } => {
                let report = self.service.report(id).await.map_err(|e| server_error(&e))?;
                return Ok(Response::data(ResponseData::Campaign(Box::new(report))));
            }
            CampaignCommand::List { status } => {
                let reports = self
                    .service
                    .list(*status)
                    .await
                    .map_err(|e| server_error(&e))?;
                return Ok(Response::data(ResponseData::Campaigns(reports)));
            }
            CampaignCommand::Schedule { id, at } => self.service.schedule_campaign(id, *at).await,
            CampaignCommand::Start { id } => self.service.start_campaign(id).await,
            CampaignCommand::Pause { id } => self.service.pause_campaign(id).await,
            CampaignCommand::Resume { id } => self.service.resume_campaign(id).await,
            CampaignCommand::Cancel { id } => self.service.cancel_campaign(id).await,
        }
        .map_err(|e| server_error(&e))?;

        if !changed {
            return Ok(Response::error(format!(
                "Campaign cannot {} in its current state",
                command.verb()
            )));
        }

        let message = match command {
            CampaignCommand::Schedule { id, at } => format!("Campaign {id} scheduled for {at}"),
            CampaignCommand::Start { id } => format!("Campaign {id} started"),
            CampaignCommand::Pause { id } => format!("Campaign {id} paused"),
            CampaignCommand::Resume { id } => format!("Campaign {id} resumed"),
            CampaignCommand::Cancel { id } => format!("Campaign {id} cancelled"),
            CampaignCommand::Status { .. } | CampaignCommand::List { .. } => String::new(),
        };
        Ok(Response::message(message))
    }

    async fn handle_system_command(
        &self,
        command: SystemCommand,
    ) -> ember_control::Result<Response> {
        match command {
            SystemCommand::Ping => Ok(Response::ok()),

            SystemCommand::Status => {
                let engine = self
                    .service
                    .engine_status()
                    .await
                    .map_err(|e| server_error(&e))?;

                let status = SystemStatus {
                    version: env!("CARGO_PKG_VERSION").to_string(),
                    uptime_secs: self.start_time.elapsed().as_secs(),
                    queued_jobs: engine.queued_jobs,
                    campaigns_by_status: engine.campaigns_by_status,
                };

                Ok(Response::data(ResponseData::SystemStatus(status)))
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use chrono::{DateTime, Utc};
    use ember_control::ResponsePayload;
    use ember_delivery::{CampaignReport, EngineStatus};
    use ember_store::{
        AccountId, Campaign, CampaignId, CampaignStatus, ListId, SendStats, StoreError,
    };
    use pretty_assertions::assert_eq;

    use super::*;

    /// Accepts every command while `accept` is set
    struct FakeService {
        campaign: Campaign,
        accept: AtomicBool,
    }

    impl FakeService {
        fn new() -> Self {
            Self {
                campaign: Campaign::new(AccountId::generate(), ListId::generate(), "Spring", "Hi"),
                accept: AtomicBool::new(true),
            }
        }

        fn check(&self, id: &CampaignId) -> ember_delivery::Result<()> {
            if *id == self.campaign.id {
                Ok(())
            } else {
                Err(StoreError::CampaignNotFound(*id).into())
            }
        }

        fn answer(&self, id: &CampaignId) -> ember_delivery::Result<bool> {
            self.check(id)?;
            Ok(self.accept.load(Ordering::SeqCst))
        }
    }

    #[async_trait]
    impl CampaignService for FakeService {
        async fn report(&self, id: &CampaignId) -> ember_delivery::Result<CampaignReport> {
            self.check(id)?;
            Ok(CampaignReport::new(&self.campaign, &SendStats::default(), 0))
        }

        async fn list(
            &self,
            status: Option<CampaignStatus>,
        ) -> ember_delivery::Result<Vec<CampaignReport>> {
            Ok(if status.is_none_or(|s| s == self.campaign.status) {
                vec![CampaignReport::new(&self.campaign, &SendStats::default(), 0)]
            } else {
                Vec::new()
            })
        }

        async fn engine_status(&self) -> ember_delivery::Result<EngineStatus> {
            Ok(EngineStatus {
                queued_jobs: 4,
                campaigns_by_status: vec![(CampaignStatus::Draft, 1)],
            })
        }

        async fn schedule_campaign(
            &self,
            id: &CampaignId,
            _at: DateTime<Utc>,
        ) -> ember_delivery::Result<bool> {
            self.answer(id)
        }

        async fn start_campaign(&self, id: &CampaignId) -> ember_delivery::Result<bool> {
            self.answer(id)
        }

        async fn pause_campaign(&self, id: &CampaignId) -> ember_delivery::Result<bool> {
            self.answer(id)
        }

        async fn resume_campaign(&self, id: &CampaignId) -> ember_delivery::Result<bool> {
            self.answer(id)
        }

        async fn cancel_campaign(&self, id: &CampaignId) -> ember_delivery::Result<bool> {
            self.answer(id)
        }
    }

    fn handler() -> (EmberControlHandler, Arc<FakeService>) {
        let service = Arc::new(FakeService::new());
        (
            EmberControlHandler::new(Arc::clone(&service) as Arc<dyn CampaignService>),
            service,
        )
    }

    fn message(response: Response) -> String {
        match response.payload {
            ResponsePayload::Data(data) => match *data {
                ResponseData::Message(message) => message,
                other => panic!("Expected Message, got {other:?}"),
            },
            other => panic!("Expected Data response, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_start_reports_success() {
        let (handler, service) = handler();
        let id = service.campaign.id;

        let response = handler
            .handle_request(Request::campaign(CampaignCommand::Start { id }))
            .await
            .unwrap();
        assert_eq!(message(response), format!("Campaign {id} started"));
    }

    #[tokio::test]
    async fn test_refused_command_is_an_error_response() {
        let (handler, service) = handler();
        service.accept.store(false, Ordering::SeqCst);

        let response = handler
            .handle_request(Request::campaign(CampaignCommand::Resume {
                id: service.campaign.id,
            }))
            .await
            .unwrap();
        match response.payload {
            ResponsePayload::Error(message) => {
                assert_eq!(message, "Campaign cannot resume in its current state");
            }
            other => panic!("Expected Error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unknown_campaign_is_a_server_error() {
        let (handler, _service) = handler();

        let result = handler
            .handle_request(Request::campaign(CampaignCommand::Status {
                id: CampaignId::generate(),
            }))
            .await;
        assert!(matches!(result, Err(ControlError::ServerError(_))));
    }

    #[tokio::test]
    async fn test_list_and_status() {
        let (handler, service) = handler();

        let response = handler
            .handle_request(Request::campaign(CampaignCommand::List {
                status: Some(CampaignStatus::Draft),
            }))
            .await
            .unwrap();
        match response.payload {
            ResponsePayload::Data(data) => match *data {
                ResponseData::Campaigns(reports) => {
                    assert_eq!(reports.len(), 1);
                    assert_eq!(reports[0].id, service.campaign.id);
                }
                other => panic!("Expected Campaigns, got {other:?}"),
            },
            other => panic!("Expected Data response, got {other:?}"),
        }

        let response = handler
            .handle_request(Request::system(SystemCommand::Status))
            .await
            .unwrap();
        match response.payload {
            ResponsePayload::Data(data) => match *data {
                ResponseData::SystemStatus(status) => {
                    assert_eq!(status.version, env!("CARGO_PKG_VERSION"));
                    assert_eq!(status.queued_jobs, 4);
                    assert_eq!(status.campaigns_by_status, vec![(CampaignStatus::Draft, 1)]);
                }
                other => panic!("Expected SystemStatus, got {other:?}"),
            },
            other => panic!("Expected Data response, got {other:?}"),
        }
    }
}
