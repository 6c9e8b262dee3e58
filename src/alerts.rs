use chrono::Utc;
use reqwest::Client;
use serde_json::json;
use tracing::{error, info, instrument, warn};

use crate::config::{Alert, Webhook};
use crate::evaluation::ResultEvaluation;
use crate::{JobId, NodeRef, ResultValue};

/// Message sent when a job starts failing its evaluations.
pub fn violation_message(job_id: JobId, value: &ResultValue) -> String {
    format!("Job {job_id} has caused an error! The value {value} failed an evaluation.")
}

/// Message sent when a failing job passes again.
pub fn recovery_message(job_id: JobId) -> String {
    format!("Job {job_id} is back within normal parameters")
}

/// Delivers evaluation notifications for one aggregator.
#[derive(Debug, Clone)]
pub struct AlertManager {
    client: Client,
    alert: Option<Alert>,
    source: NodeRef,
}

impl AlertManager {
    pub fn new(alert: Option<Alert>, source: NodeRef) -> Self {
        Self {
            client: Client::new(),
            alert,
            source,
        }
    }

    /// Reports a transition of a job's evaluation state. Only the first
    /// violation of a streak and its recovery produce a notification.
    #[instrument(skip(self, value))]
    pub async fn send_evaluation_alert(
        &self,
        evaluation: ResultEvaluation,
        job_id: JobId,
        value: &ResultValue,
    ) {
        match evaluation {
            ResultEvaluation::StartsToFail => {
                let message = violation_message(job_id, value);
                warn!("{message}");
                self.notify(&message).await;
            }
            ResultEvaluation::BackToOk => {
                let message = recovery_message(job_id);
                info!("{message}");
                self.notify(&message).await;
            }
            ResultEvaluation::Failing => {
                error!("job {job_id} still failing with value {value}");
            }
            ResultEvaluation::Ok => {}
        }
    }

    async fn notify(&self, message: &str) {
        match &self.alert {
            Some(Alert::Webhook(webhook)) => self.send_webhook_alert(webhook, message).await,
            None => {}
        }
    }

    #[instrument(skip(self, webhook))]
    async fn send_webhook_alert(&self, webhook: &Webhook, message: &str) {
        let payload = json!({
            "message": message,
            "aggregator": self.source.address(),
            "timestamp": Utc::now().to_rfc3339()
        });

        match self.client.post(&webhook.url).json(&payload).send().await {
            Ok(response) => {
                if response.status().is_success() {
                    info!("Successfully sent webhook alert");
                } else {
                    error!("Webhook alert failed with status: {}", response.status());
                }
            }
            Err(e) => {
                error!("Failed to send webhook alert: {}", e);
            }
        }
    }
}
