//! Request/reply intake for job submission and cancellation over NATS.

use anyhow::Result;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use strata_core::variables::VariableMap;
use strata_core::{FlowId, JobId};
use strata_scheduler::Scheduler;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitRequest {
    /// Flow the job belongs to; a fresh flow when omitted.
    #[serde(default)]
    pub flow_id: Option<FlowId>,
    pub yaml: String,
    #[serde(default)]
    pub variables: VariableMap,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubmitReply {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<JobId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub build_number: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CancelReply {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub async fn handle_submit(scheduler: &Scheduler, payload: &[u8]) -> SubmitReply {
    let request: SubmitRequest = match serde_json::from_slice(payload) {
        Ok(request) => request,
        Err(e) => {
            return SubmitReply {
                error: Some(format!("invalid request: {}", e)),
                ..Default::default()
            };
        }
    };

    let flow_id = request.flow_id.unwrap_or_default();
    match scheduler
        .create_job(flow_id, &request.yaml, request.variables)
        .await
    {
        Ok(job) => SubmitReply {
            job_id: Some(job.id),
            build_number: Some(job.build_number),
            error: None,
        },
        Err(e) => SubmitReply {
            error: Some(e.to_string()),
            ..Default::default()
        },
    }
}

/// The payload is the job id as text.
pub async fn handle_cancel(scheduler: &Scheduler, payload: &[u8]) -> CancelReply {
    let text = String::from_utf8_lossy(payload);
    let job_id = match text.trim().parse::<JobId>() {
        Ok(id) => id,
        Err(_) => {
            return CancelReply {
                ok: false,
                error: Some(format!("invalid job id: {}", text.trim())),
            };
        }
    };

    match scheduler.cancel(job_id).await {
        Ok(()) => CancelReply {
            ok: true,
            error: None,
        },
        Err(e) => CancelReply {
            ok: false,
            error: Some(e.to_string()),
        },
    }
}

pub async fn serve_submissions(
    client: async_nats::Client,
    subject: String,
    scheduler: Arc<Scheduler>,
) -> Result<()> {
    let mut requests = client.subscribe(subject.clone()).await?;
    info!(subject = %subject, "Accepting job submissions");

    while let Some(message) = requests.next().await {
        let reply = handle_submit(&scheduler, &message.payload).await;
        if let Some(error) = &reply.error {
            warn!(error = %error, "Job submission rejected");
        }
        respond(&client, message.reply, &reply).await;
    }
    Ok(())
}

pub async fn serve_cancellations(
    client: async_nats::Client,
    subject: String,
    scheduler: Arc<Scheduler>,
) -> Result<()> {
    let mut requests = client.subscribe(subject.clone()).await?;
    info!(subject = %subject, "Accepting cancellations");

    while let Some(message) = requests.next().await {
        let reply = handle_cancel(&scheduler, &message.payload).await;
        respond(&client, message.reply, &reply).await;
    }
    Ok(())
}

async fn respond<T: Serialize>(
    client: &async_nats::Client,
    reply_to: Option<async_nats::Subject>,
    body: &T,
) {
    let Some(reply_to) = reply_to else {
        debug!("Request without reply subject");
        return;
    };
    match serde_json::to_vec(body) {
        Ok(bytes) => {
            if let Err(e) = client.publish(reply_to, bytes.into()).await {
                warn!(error = %e, "Failed to send reply");
            }
        }
        Err(e) => warn!(error = %e, "Failed to encode reply"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_core::ports::QueueService;
    use strata_scheduler::memory::*;
    use strata_scheduler::{AgentRegistry, CmdDispatcher, DistributedLock, SchedulerConfig};

    const PIPELINE: &str = r#"
steps:
  - name: build
    script: make
"#;

    fn scheduler() -> Scheduler {
        let config = SchedulerConfig::default();
        let queues: Arc<dyn QueueService> = Arc::new(InMemoryQueueService::new());
        let events = Arc::new(InMemoryEventBus::new());
        Scheduler::new(
            config.clone(),
            Arc::new(AgentRegistry::new(
                Arc::new(InMemoryAgentRepository::new()),
                queues.clone(),
                events.clone(),
            )),
            Arc::new(DistributedLock::new(Arc::new(InMemoryLockService::new()))),
            Arc::new(CmdDispatcher::new(
                Arc::new(InMemoryPluginRepository::new()),
                queues,
                config,
            )),
            Arc::new(InMemoryJobRepository::new()),
            events,
        )
    }

    #[tokio::test]
    async fn test_submit_creates_job() {
        let scheduler = scheduler();
        let flow_id = FlowId::new();
        let request = serde_json::json!({
            "flow_id": flow_id,
            "yaml": PIPELINE,
            "variables": { "FLOW_BRANCH": "main" },
        });

        let reply = handle_submit(&scheduler, request.to_string().as_bytes()).await;
        assert_eq!(reply.error, None);
        assert_eq!(reply.build_number, Some(1));

        let job = scheduler
            .job(reply.job_id.unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.flow_id, flow_id);
        assert_eq!(job.context.get("FLOW_BRANCH"), Some("main"));

        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_submit_reports_errors() {
        let scheduler = scheduler();

        let reply = handle_submit(&scheduler, b"not json").await;
        assert!(reply.error.unwrap().starts_with("invalid request"));

        let request = serde_json::json!({ "yaml": "steps: [" });
        let reply = handle_submit(&scheduler, request.to_string().as_bytes()).await;
        assert_eq!(reply.job_id, None);
        assert!(reply.error.is_some());
    }

    #[tokio::test]
    async fn test_cancel_replies() {
        let scheduler = scheduler();

        let reply = handle_cancel(&scheduler, b"nonsense").await;
        assert!(!reply.ok);

        let unknown = JobId::new().to_string();
        let reply = handle_cancel(&scheduler, unknown.as_bytes()).await;
        assert!(!reply.ok);
        assert!(reply.error.unwrap().contains("not found"));

        let request = serde_json::json!({ "yaml": PIPELINE });
        let submitted = handle_submit(&scheduler, request.to_string().as_bytes()).await;
        let job_id = submitted.job_id.unwrap();

        let reply = handle_cancel(&scheduler, job_id.to_string().as_bytes()).await;
        assert_eq!(reply, CancelReply { ok: true, error: None });

        let job = scheduler.wait(job_id).await.unwrap();
        assert_eq!(job.status, strata_core::job::JobStatus::Cancelled);
    }
}
