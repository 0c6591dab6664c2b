//! In-process collaborator implementations.
//!
//! Used by the daemon's demo mode and by tests. Outbound calls are logged
//! and recorded rather than delivered; each recorder can be switched into a
//! failing mode to exercise the engine's retry path.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use outreach_core::config::TimeoutConfig;
use outreach_core::{OutreachError, OutreachResult};
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::collaborators::{
    Collaborators, ContactRecord, ContactStore, MailTransport, NotificationService, OutboundEmail,
    TaskRequest, TaskService, VariantContent, WebhookCaller,
};
use crate::types::NotifyChannel;

/// Contact records held in a concurrent map.
#[derive(Default)]
pub struct InMemoryContacts {
    contacts: DashMap<String, ContactRecord>,
}

impl InMemoryContacts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&self, contact: ContactRecord) {
        self.contacts.insert(contact.id.clone(), contact);
    }

    pub fn snapshot(&self, contact_id: &str) -> Option<ContactRecord> {
        self.contacts.get(contact_id).map(|c| c.clone())
    }

    fn missing(contact_id: &str) -> OutreachError {
        OutreachError::Collaborator(format!("contact {} not found", contact_id))
    }
}

#[async_trait]
impl ContactStore for InMemoryContacts {
    async fn get(&self, contact_id: &str) -> OutreachResult<Option<ContactRecord>> {
        Ok(self.snapshot(contact_id))
    }

    async fn update_field(
        &self,
        contact_id: &str,
        field: &str,
        value: serde_json::Value,
    ) -> OutreachResult<()> {
        let mut contact = self
            .contacts
            .get_mut(contact_id)
            .ok_or_else(|| Self::missing(contact_id))?;
        match field {
            "stage" if value.is_string() => contact.stage = value.as_str().map(str::to_string),
            "lead_score" if value.is_number() => contact.lead_score = value.as_f64(),
            _ => {
                contact.fields.insert(field.to_string(), value);
            }
        }
        Ok(())
    }

    async fn add_tag(&self, contact_id: &str, tag: &str) -> OutreachResult<()> {
        self.contacts
            .get_mut(contact_id)
            .ok_or_else(|| Self::missing(contact_id))?
            .tags
            .insert(tag.to_string());
        Ok(())
    }

    async fn remove_tag(&self, contact_id: &str, tag: &str) -> OutreachResult<()> {
        self.contacts
            .get_mut(contact_id)
            .ok_or_else(|| Self::missing(contact_id))?
            .tags
            .remove(tag);
        Ok(())
    }
}

/// Mail transport that records messages instead of delivering them.
#[derive(Default)]
pub struct RecordingMailer {
    sent: Mutex<Vec<OutboundEmail>>,
    failing: AtomicBool,
}

impl RecordingMailer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<OutboundEmail> {
        self.sent.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.sent.lock().len()
    }
}

#[async_trait]
impl MailTransport for RecordingMailer {
    async fn send(&self, email: &OutboundEmail) -> OutreachResult<String> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(OutreachError::Transport(format!(
                "transport rejected message to {}",
                email.to
            )));
        }
        let delivery_id = format!("msg-{}", uuid::Uuid::new_v4());
        info!(to = %email.to, subject = %email.subject, delivery_id = %delivery_id, "Email queued");
        self.sent.lock().push(email.clone());
        Ok(delivery_id)
    }
}

#[derive(Default)]
pub struct RecordingTasks {
    tasks: Mutex<Vec<TaskRequest>>,
}

impl RecordingTasks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tasks(&self) -> Vec<TaskRequest> {
        self.tasks.lock().clone()
    }
}

#[async_trait]
impl TaskService for RecordingTasks {
    async fn create_task(&self, task: &TaskRequest) -> OutreachResult<String> {
        info!(title = %task.title, assignee = ?task.assignee, "Task created");
        let mut tasks = self.tasks.lock();
        tasks.push(task.clone());
        Ok(format!("task-{}", tasks.len()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentNotification {
    pub recipient: String,
    pub message: String,
    pub channel: NotifyChannel,
}

#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<SentNotification>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<SentNotification> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl NotificationService for RecordingNotifier {
    async fn notify(
        &self,
        recipient: &str,
        message: &str,
        channel: NotifyChannel,
    ) -> OutreachResult<()> {
        info!(recipient = %recipient, ?channel, "Notification sent");
        self.sent.lock().push(SentNotification {
            recipient: recipient.to_string(),
            message: message.to_string(),
            channel,
        });
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct WebhookCall {
    pub url: String,
    pub payload: serde_json::Value,
    pub headers: HashMap<String, String>,
    pub timeout_ms: u64,
}

/// Webhook caller that records posts and answers with a fixed status.
#[derive(Default)]
pub struct RecordingWebhooks {
    calls: Mutex<Vec<WebhookCall>>,
    failing: AtomicBool,
    delay_ms: AtomicU64,
}

impl RecordingWebhooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Makes every post sleep before answering.
    pub fn set_delay_ms(&self, delay_ms: u64) {
        self.delay_ms.store(delay_ms, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<WebhookCall> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl WebhookCaller for RecordingWebhooks {
    async fn post(
        &self,
        url: &str,
        payload: &serde_json::Value,
        headers: &HashMap<String, String>,
        timeout_ms: u64,
    ) -> OutreachResult<u16> {
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
        }
        self.calls.lock().push(WebhookCall {
            url: url.to_string(),
            payload: payload.clone(),
            headers: headers.clone(),
            timeout_ms,
        });
        if self.failing.load(Ordering::SeqCst) {
            return Err(OutreachError::Webhook(format!("{} answered 502", url)));
        }
        debug!(url = %url, "Webhook delivered");
        Ok(200)
    }
}

/// One of each in-process collaborator, with handles kept for inspection.
#[derive(Clone, Default)]
pub struct InMemoryBackends {
    pub contacts: Arc<InMemoryContacts>,
    pub mailer: Arc<RecordingMailer>,
    pub tasks: Arc<RecordingTasks>,
    pub notifier: Arc<RecordingNotifier>,
    pub webhooks: Arc<RecordingWebhooks>,
}

impl InMemoryBackends {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn collaborators(&self, timeouts: TimeoutConfig) -> Collaborators {
        Collaborators {
            contacts: self.contacts.clone(),
            mail: self.mailer.clone(),
            tasks: self.tasks.clone(),
            notifications: self.notifier.clone(),
            webhooks: self.webhooks.clone(),
            content: Arc::new(VariantContent),
            timeouts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_contact_mutations() {
        let contacts = InMemoryContacts::new();
        contacts.upsert(ContactRecord::new("c-1", "a@example.com"));

        contacts.add_tag("c-1", "nurture").await.unwrap();
        contacts
            .update_field("c-1", "stage", serde_json::json!("mql"))
            .await
            .unwrap();
        contacts
            .update_field("c-1", "region", serde_json::json!("emea"))
            .await
            .unwrap();

        let record = contacts.get("c-1").await.unwrap().unwrap();
        assert!(record.tags.contains("nurture"));
        assert_eq!(record.stage.as_deref(), Some("mql"));
        assert_eq!(record.fields["region"], serde_json::json!("emea"));

        contacts.remove_tag("c-1", "nurture").await.unwrap();
        assert!(contacts.snapshot("c-1").unwrap().tags.is_empty());
        assert!(contacts.add_tag("missing", "x").await.is_err());
    }

    #[tokio::test]
    async fn test_mailer_failure_mode() {
        let mailer = RecordingMailer::new();
        let email = OutboundEmail {
            to: "a@example.com".into(),
            subject: "Hello".into(),
            html_body: "<p>Hi</p>".into(),
            text_body: None,
            metadata: HashMap::new(),
        };
        assert!(mailer.send(&email).await.unwrap().starts_with("msg-"));
        mailer.set_failing(true);
        assert!(matches!(mailer.send(&email).await, Err(OutreachError::Transport(_))));
        assert_eq!(mailer.count(), 1);
    }
}
