use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use minijinja::{context, Environment};
use tracing::{debug, warn};

use crate::config::NotificationsConfig;
use crate::runtime::Runtime;

const DISPATCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Human message line per event, shared by all sinks.
const MESSAGE_TEMPLATE: &str = "{{ icon }} [{{ project }}/{{ environment }}]\
{% if service %} {{ service }}:{% endif %} {{ message }}\
{% if duration %} ({{ duration }}s){% endif %}";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    DeployStarted,
    DeployDone,
    DeployFailed,
    RollbackStarted,
    RollbackDone,
    DriftDetected,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::DeployStarted => "deploy_started",
            EventKind::DeployDone => "deploy_done",
            EventKind::DeployFailed => "deploy_failed",
            EventKind::RollbackStarted => "rollback_started",
            EventKind::RollbackDone => "rollback_done",
            EventKind::DriftDetected => "drift_detected",
        }
    }

    fn icon(&self) -> &'static str {
        match self {
            EventKind::DeployStarted | EventKind::RollbackStarted => "🚀",
            EventKind::DeployDone | EventKind::RollbackDone => "✅",
            EventKind::DeployFailed => "❌",
            EventKind::DriftDetected => "⚠️",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Event {
    pub kind: EventKind,
    pub project: String,
    pub environment: String,
    pub service: Option<String>,
    pub message: String,
    pub duration: Option<f64>,
    pub details: BTreeMap<String, String>,
}

impl Event {
    pub fn new(kind: EventKind, project: &str, environment: &str, message: &str) -> Self {
        Self {
            kind,
            project: project.to_string(),
            environment: environment.to_string(),
            service: None,
            message: message.to_string(),
            duration: None,
            details: BTreeMap::new(),
        }
    }

    pub fn with_service(mut self, service: &str) -> Self {
        self.service = Some(service.to_string());
        self
    }

    pub fn with_duration(mut self, seconds: f64) -> Self {
        self.duration = Some(seconds);
        self
    }

    pub fn with_detail(mut self, key: &str, value: &str) -> Self {
        self.details.insert(key.to_string(), value.to_string());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SinkKind {
    Slack,
    Discord,
    Webhook,
}

struct Sink {
    kind: SinkKind,
    url: String,
}

/// Fire-and-forget webhook dispatch. Delivery failures are logged, never
/// surfaced to the operation that emitted the event.
pub struct Notifier {
    runtime: Arc<Runtime>,
    sinks: Vec<Sink>,
}

impl Notifier {
    pub fn from_config(runtime: Arc<Runtime>, config: &NotificationsConfig) -> Self {
        let mut sinks = Vec::new();
        if let Some(url) = &config.slack {
            sinks.push(Sink {
                kind: SinkKind::Slack,
                url: url.clone(),
            });
        }
        if let Some(url) = &config.discord {
            sinks.push(Sink {
                kind: SinkKind::Discord,
                url: url.clone(),
            });
        }
        if let Some(url) = &config.webhook {
            sinks.push(Sink {
                kind: SinkKind::Webhook,
                url: url.clone(),
            });
        }
        Self { runtime, sinks }
    }

    /// Post the event to every configured sink in the background.
    pub fn dispatch(&self, event: &Event) {
        for sink in &self.sinks {
            let payload = match render_payload(sink.kind, event) {
                Ok(payload) => payload,
                Err(err) => {
                    warn!("notification payload failed to render: {:#}", err);
                    continue;
                }
            };

            let client = self.runtime.http().clone();
            let url = sink.url.clone();
            let kind = event.kind.as_str();
            tokio::spawn(async move {
                let result = client
                    .post(&url)
                    .timeout(DISPATCH_TIMEOUT)
                    .json(&payload)
                    .send()
                    .await;
                match result {
                    Ok(resp) if resp.status().is_success() => {
                        debug!("notification {} delivered", kind)
                    }
                    Ok(resp) => warn!(
                        "notification {} rejected with status {}",
                        kind,
                        resp.status()
                    ),
                    Err(err) => warn!("notification {} failed: {}", kind, err),
                }
            });
        }
    }
}

fn render_message(event: &Event) -> Result<String> {
    let mut env = Environment::new();
    env.add_template("message", MESSAGE_TEMPLATE)
        .context("Failed to load message template")?;
    let tmpl = env.get_template("message").unwrap();
    tmpl.render(context! {
        icon => event.kind.icon(),
        project => &event.project,
        environment => &event.environment,
        service => &event.service,
        message => &event.message,
        duration => event.duration.map(|d| format!("{:.1}", d)),
    })
    .context("Failed to render message template")
}

/// Sink-specific JSON envelope for an event.
fn render_payload(kind: SinkKind, event: &Event) -> Result<serde_json::Value> {
    let line = render_message(event)?;
    let payload = match kind {
        SinkKind::Slack => serde_json::json!({ "text": line }),
        SinkKind::Discord => serde_json::json!({ "content": line }),
        SinkKind::Webhook => serde_json::json!({
            "event": event.kind.as_str(),
            "project": event.project,
            "environment": event.environment,
            "service": event.service,
            "message": event.message,
            "duration": event.duration,
            "details": event.details,
            "timestamp": Utc::now().to_rfc3339(),
        }),
    };
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event() -> Event {
        Event::new(
            EventKind::DeployDone,
            "blog",
            "production",
            "deployment finished",
        )
        .with_service("web")
        .with_duration(12.34)
        .with_detail("record", "dep-20240101-000000")
    }

    #[test]
    fn message_carries_project_env_service_and_duration() {
        let line = render_message(&event()).unwrap();
        assert!(line.contains("[blog/production]"));
        assert!(line.contains("web:"));
        assert!(line.contains("deployment finished"));
        assert!(line.contains("(12.3s)"));
    }

    #[test]
    fn slack_and_discord_envelopes_differ_in_key_only() {
        let slack = render_payload(SinkKind::Slack, &event()).unwrap();
        let discord = render_payload(SinkKind::Discord, &event()).unwrap();
        assert!(slack.get("text").is_some());
        assert!(discord.get("content").is_some());
        assert_eq!(slack["text"], discord["content"]);
    }

    #[test]
    fn webhook_envelope_is_structured() {
        let payload = render_payload(SinkKind::Webhook, &event()).unwrap();
        assert_eq!(payload["event"], "deploy_done");
        assert_eq!(payload["project"], "blog");
        assert_eq!(payload["service"], "web");
        assert_eq!(payload["details"]["record"], "dep-20240101-000000");
        assert!(payload["timestamp"].is_string());
    }

    #[test]
    fn event_without_service_renders_cleanly() {
        let event = Event::new(EventKind::DriftDetected, "blog", "production", "2 drift(s)");
        let line = render_message(&event).unwrap();
        assert!(line.contains("[blog/production] 2 drift(s)"));
    }
}
