use crate::alert::evaluator::Notifier;
use async_trait::async_trait;
use serde_json::json;
use std::time::Duration;

/// Validate that a webhook URL is safe to call (http/https, no private or loopback hosts).
pub fn validate_webhook_url(url: &str) -> Result<(), String> {
    let parsed = url::Url::parse(url).map_err(|e| format!("invalid URL: {e}"))?;
    match parsed.scheme() {
        "https" => {}
        "http" => {
            tracing::warn!(url = url, "webhook URL uses HTTP; HTTPS is recommended");
        }
        scheme => return Err(format!("unsupported scheme: {scheme}")),
    }
    if let Some(host) = parsed.host_str() {
        if host == "localhost"
            || host == "127.0.0.1"
            || host == "[::1]"
            || host == "::1"
            || host.starts_with("10.")
            || host.starts_with("192.168.")
            || host.starts_with("169.254.")
            || (host.starts_with("172.")
                && host
                    .split('.')
                    .nth(1)
                    .and_then(|s| s.parse::<u8>().ok())
                    .is_some_and(|n| (16..=31).contains(&n)))
        {
            return Err(format!(
                "webhook URL must not point to private/loopback address: {host}"
            ));
        }
    }
    Ok(())
}

/// Where a rule's notifications go.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChannelConfig {
    /// Chat webhook taking a plain text payload.
    Slack { webhook_url: String },
    /// Generic HTTP webhook taking `{message, metric, value}`.
    Webhook { url: String },
}

impl ChannelConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            ChannelConfig::Slack { .. } => "slack",
            ChannelConfig::Webhook { .. } => "webhook",
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        match self {
            ChannelConfig::Slack { webhook_url } => validate_webhook_url(webhook_url),
            ChannelConfig::Webhook { url } => validate_webhook_url(url),
        }
    }
}

/// What a fired rule reports.
#[derive(Debug, Clone, PartialEq)]
pub struct AlertNotification {
    pub rule_name: String,
    pub metric: String,
    pub value: f64,
    pub comparator: String,
    pub threshold: f64,
    pub project_id: Option<String>,
}

impl AlertNotification {
    pub fn message(&self) -> String {
        format!(
            "Alert \"{}\": {} is {:.2} ({} {}){}",
            self.rule_name,
            self.metric,
            self.value,
            self.comparator,
            self.threshold,
            self.project_id
                .as_deref()
                .map(|p| format!(" in project {p}"))
                .unwrap_or_default(),
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("webhook responded with status {0}")]
    Status(u16),
}

/// Sends alert notifications to chat and generic webhooks.
pub struct AlertDispatcher {
    client: reqwest::Client,
}

impl AlertDispatcher {
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self { client })
    }

    async fn send_slack(&self, url: &str, alert: &AlertNotification) -> Result<(), DispatchError> {
        let payload = json!({ "text": alert.message() });
        let resp = self.client.post(url).json(&payload).send().await?;
        if !resp.status().is_success() {
            return Err(DispatchError::Status(resp.status().as_u16()));
        }
        tracing::info!(rule = %alert.rule_name, "slack alert sent");
        Ok(())
    }

    async fn send_generic(&self, url: &str, alert: &AlertNotification) -> Result<(), DispatchError> {
        let payload = json!({
            "message": alert.message(),
            "metric": alert.metric,
            "value": alert.value,
        });
        let resp = self.client.post(url).json(&payload).send().await?;
        if !resp.status().is_success() {
            return Err(DispatchError::Status(resp.status().as_u16()));
        }
        tracing::info!(rule = %alert.rule_name, "webhook alert sent");
        Ok(())
    }
}

#[async_trait]
impl Notifier for AlertDispatcher {
    async fn notify(
        &self,
        channel: &ChannelConfig,
        alert: &AlertNotification,
    ) -> Result<(), DispatchError> {
        match channel {
            ChannelConfig::Slack { webhook_url } => self.send_slack(webhook_url, alert).await,
            ChannelConfig::Webhook { url } => self.send_generic(url, alert).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_webhook_url_rejects_private_hosts() {
        assert!(validate_webhook_url("https://hooks.slack.com/services/T/B/X").is_ok());
        assert!(validate_webhook_url("https://localhost/hook").is_err());
        assert!(validate_webhook_url("http://10.0.0.4/hook").is_err());
        assert!(validate_webhook_url("http://172.20.1.1/hook").is_err());
        assert!(validate_webhook_url("http://172.40.1.1/hook").is_ok());
        assert!(validate_webhook_url("ftp://example.com/hook").is_err());
        assert!(validate_webhook_url("not a url").is_err());
    }

    #[test]
    fn test_channel_config_serde_is_tagged() {
        let channel = ChannelConfig::Webhook {
            url: "https://example.com/hook".to_string(),
        };
        let json = serde_json::to_value(&channel).unwrap();
        assert_eq!(json["type"], "webhook");
        assert_eq!(json["url"], "https://example.com/hook");

        let slack: ChannelConfig =
            serde_json::from_str(r#"{"type":"slack","webhook_url":"https://hooks.slack.com/x"}"#)
                .unwrap();
        assert_eq!(slack.kind(), "slack");
    }

    #[test]
    fn test_notification_message_carries_rule_metric_value_and_threshold() {
        let alert = AlertNotification {
            rule_name: "Traffic spike".to_string(),
            metric: "events_per_minute".to_string(),
            value: 150.0,
            comparator: ">".to_string(),
            threshold: 100.0,
            project_id: Some("shop".to_string()),
        };
        let msg = alert.message();
        assert!(msg.contains("Traffic spike"));
        assert!(msg.contains("events_per_minute"));
        assert!(msg.contains("150.00"));
        assert!(msg.contains("> 100"));
        assert!(msg.contains("shop"));
    }
}
