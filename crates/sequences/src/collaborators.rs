//! Interfaces to the systems the engine drives but does not own: the CRM
//! contact store, mail transport, task and notification services, webhook
//! caller, and the content provider that produces email copy.

use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use outreach_core::config::TimeoutConfig;
use outreach_core::{OutreachError, OutreachResult};
use serde::{Deserialize, Serialize};

use crate::types::{EmailVariant, Enrollment, NotifyChannel, TaskPriority};

/// The slice of a CRM contact the engine reads and writes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContactRecord {
    pub id: String,
    pub email: String,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub company: Option<String>,
    #[serde(default)]
    pub stage: Option<String>,
    #[serde(default)]
    pub lead_score: Option<f64>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub fields: HashMap<String, serde_json::Value>,
}

impl ContactRecord {
    pub fn new(id: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            email: email.into(),
            ..Default::default()
        }
    }

    /// Looks up a built-in attribute or custom field by name.
    pub fn field(&self, name: &str) -> Option<serde_json::Value> {
        let text = |v: &Option<String>| v.clone().map(serde_json::Value::String);
        match name {
            "email" => Some(serde_json::Value::String(self.email.clone())),
            "first_name" => text(&self.first_name),
            "last_name" => text(&self.last_name),
            "company" => text(&self.company),
            "stage" => text(&self.stage),
            "lead_score" => self.lead_score.map(|s| serde_json::json!(s)),
            other => self.fields.get(other).cloned(),
        }
    }

    /// Flattened string view captured into an enrollment at enroll time.
    pub fn personalization(&self) -> HashMap<String, String> {
        let mut data = HashMap::new();
        data.insert("email".to_string(), self.email.clone());
        if let Some(first) = &self.first_name {
            data.insert("first_name".to_string(), first.clone());
        }
        if let Some(last) = &self.last_name {
            data.insert("last_name".to_string(), last.clone());
        }
        let full = [self.first_name.as_deref(), self.last_name.as_deref()]
            .into_iter()
            .flatten()
            .collect::<Vec<_>>()
            .join(" ");
        if !full.is_empty() {
            data.insert("full_name".to_string(), full);
        }
        if let Some(company) = &self.company {
            data.insert("company".to_string(), company.clone());
        }
        for (key, value) in &self.fields {
            let rendered = match value {
                serde_json::Value::String(s) => s.clone(),
                serde_json::Value::Null => continue,
                other => other.to_string(),
            };
            data.entry(key.clone()).or_insert(rendered);
        }
        data
    }
}

/// Read/write access to contact records.
#[async_trait]
pub trait ContactStore: Send + Sync {
    async fn get(&self, contact_id: &str) -> OutreachResult<Option<ContactRecord>>;
    async fn update_field(
        &self,
        contact_id: &str,
        field: &str,
        value: serde_json::Value,
    ) -> OutreachResult<()>;
    async fn add_tag(&self, contact_id: &str, tag: &str) -> OutreachResult<()>;
    async fn remove_tag(&self, contact_id: &str, tag: &str) -> OutreachResult<()>;
}

/// A fully rendered message handed to the transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundEmail {
    pub to: String,
    pub subject: String,
    pub html_body: String,
    pub text_body: Option<String>,
    pub metadata: HashMap<String, String>,
}

#[async_trait]
pub trait MailTransport: Send + Sync {
    /// Returns the transport's delivery id. Failures are `OutreachError::Transport`.
    async fn send(&self, email: &OutboundEmail) -> OutreachResult<String>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRequest {
    pub title: String,
    pub description: String,
    pub assignee: Option<String>,
    pub due_date: DateTime<Utc>,
    pub priority: TaskPriority,
}

#[async_trait]
pub trait TaskService: Send + Sync {
    async fn create_task(&self, task: &TaskRequest) -> OutreachResult<String>;
}

#[async_trait]
pub trait NotificationService: Send + Sync {
    async fn notify(
        &self,
        recipient: &str,
        message: &str,
        channel: NotifyChannel,
    ) -> OutreachResult<()>;
}

#[async_trait]
pub trait WebhookCaller: Send + Sync {
    /// Returns the response status. Failures are `OutreachError::Webhook`.
    async fn post(
        &self,
        url: &str,
        payload: &serde_json::Value,
        headers: &HashMap<String, String>,
        timeout_ms: u64,
    ) -> OutreachResult<u16>;
}

/// Unrendered email copy; tokens are substituted afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailContent {
    pub subject: String,
    pub html_body: String,
    pub text_body: Option<String>,
}

/// Source of email copy for a chosen variant. Generated-content backends
/// plug in here; the default passes the variant's own copy through.
#[async_trait]
pub trait ContentProvider: Send + Sync {
    async fn compose(
        &self,
        variant: &EmailVariant,
        contact: &ContactRecord,
        enrollment: &Enrollment,
    ) -> OutreachResult<EmailContent>;
}

pub struct VariantContent;

#[async_trait]
impl ContentProvider for VariantContent {
    async fn compose(
        &self,
        variant: &EmailVariant,
        _contact: &ContactRecord,
        _enrollment: &Enrollment,
    ) -> OutreachResult<EmailContent> {
        Ok(EmailContent {
            subject: variant.subject.clone(),
            html_body: variant.html_body.clone(),
            text_body: variant.text_body.clone(),
        })
    }
}

/// Everything the step executor calls out to.
#[derive(Clone)]
pub struct Collaborators {
    pub contacts: Arc<dyn ContactStore>,
    pub mail: Arc<dyn MailTransport>,
    pub tasks: Arc<dyn TaskService>,
    pub notifications: Arc<dyn NotificationService>,
    pub webhooks: Arc<dyn WebhookCaller>,
    pub content: Arc<dyn ContentProvider>,
    pub timeouts: TimeoutConfig,
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators")
            .field("timeouts", &self.timeouts)
            .finish()
    }
}

/// Runs a collaborator call under its own deadline so one slow dependency
/// cannot hold up the rest of the batch.
pub async fn bounded<T, F>(operation: &str, timeout_ms: u64, call: F) -> OutreachResult<T>
where
    F: Future<Output = OutreachResult<T>>,
{
    match tokio::time::timeout(Duration::from_millis(timeout_ms), call).await {
        Ok(result) => result,
        Err(_) => Err(OutreachError::Timeout {
            operation: operation.to_string(),
            timeout_ms,
        }),
    }
}
