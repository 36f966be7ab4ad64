//! Outbound notifications. Every attempt is made once and written to
//! `notification_logs`, whatever the outcome.

use anyhow::{anyhow, Context};
use chrono::Utc;
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use log::{info, warn};
use rusqlite::Connection;
use serde_json::json;
use std::time::Duration;

use crate::config::{SmtpSettings, WhatsappSettings};
use crate::logging::sanitize_message;

pub const STATUS_SUCCESS: &str = "SUCCESS";
pub const STATUS_FAILURE: &str = "FAILURE";

const SEND_TIMEOUT: Duration = Duration::from_secs(30);

pub trait Channel {
    fn name(&self) -> &'static str;

    /// Sends one message. The returned text goes into the log's details.
    fn send(&self, recipient: &str, subject: &str, body: &str) -> anyhow::Result<String>;
}

pub struct EmailChannel {
    settings: SmtpSettings,
}

impl EmailChannel {
    pub fn new(settings: SmtpSettings) -> Self {
        Self { settings }
    }

    fn transport(&self, host: &str) -> anyhow::Result<SmtpTransport> {
        let s = &self.settings;
        let mut builder = if s.use_tls {
            SmtpTransport::starttls_relay(host).context("smtp tls setup")?
        } else {
            SmtpTransport::builder_dangerous(host)
        };
        builder = builder.port(s.port).timeout(Some(SEND_TIMEOUT));
        if let (Some(user), Some(password)) = (&s.user, &s.password) {
            builder = builder.credentials(Credentials::new(user.clone(), password.clone()));
        }
        Ok(builder.build())
    }
}

impl Channel for EmailChannel {
    fn name(&self) -> &'static str {
        "EMAIL"
    }

    fn send(&self, recipient: &str, subject: &str, body: &str) -> anyhow::Result<String> {
        let host = self
            .settings
            .host
            .as_deref()
            .ok_or_else(|| anyhow!("smtp host is not configured"))?;
        let from = self
            .settings
            .from_address
            .as_deref()
            .or(self.settings.user.as_deref())
            .ok_or_else(|| anyhow!("smtp sender address is not configured"))?;
        let from: Mailbox = from.parse().context("invalid sender address")?;
        let to: Mailbox = recipient.parse().context("invalid recipient address")?;

        let message = Message::builder()
            .from(from)
            .to(to)
            .subject(subject)
            .header(ContentType::TEXT_PLAIN)
            .body(body.to_string())
            .context("build e-mail")?;
        let response = self.transport(host)?.send(&message).context("smtp send")?;
        Ok(format!("smtp {}", response.code()))
    }
}

pub struct WhatsappChannel {
    settings: WhatsappSettings,
}

impl WhatsappChannel {
    pub fn new(settings: WhatsappSettings) -> Self {
        Self { settings }
    }
}

impl Channel for WhatsappChannel {
    fn name(&self) -> &'static str {
        "WHATSAPP"
    }

    fn send(&self, recipient: &str, _subject: &str, body: &str) -> anyhow::Result<String> {
        let url = self
            .settings
            .api_url
            .as_deref()
            .ok_or_else(|| anyhow!("whatsapp api url is not configured"))?;
        let client = reqwest::blocking::Client::builder()
            .timeout(SEND_TIMEOUT)
            .build()
            .context("http client")?;
        let mut request = client
            .post(url)
            .json(&json!({ "to": recipient, "message": body }));
        if let Some(token) = self.settings.api_token.as_deref() {
            request = request.bearer_auth(token);
        }
        let response = request.send().context("whatsapp request")?;
        let status = response.status();
        if !status.is_success() {
            return Err(anyhow!("whatsapp api answered http {}", status.as_u16()));
        }
        Ok(format!("http {}", status.as_u16()))
    }
}

pub fn record(
    conn: &Connection,
    channel: &str,
    recipient: &str,
    subject: Option<&str>,
    status: &str,
    details: &str,
    guardian_id: Option<&str>,
) {
    if let Err(e) = conn.execute(
        "INSERT INTO notification_logs(at, channel, recipient, subject, status, details, guardian_id)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        (
            Utc::now().to_rfc3339(),
            channel,
            recipient,
            subject,
            status,
            sanitize_message(details, 500),
            guardian_id,
        ),
    ) {
        warn!(
            "event=notification_log_write module=notify status=error channel={} error={}",
            channel, e
        );
    }
}

/// Sends through `channel` and logs the attempt. Returns whether it went out.
pub fn deliver(
    conn: &Connection,
    channel: &dyn Channel,
    recipient: &str,
    subject: &str,
    body: &str,
    guardian_id: Option<&str>,
) -> bool {
    let (status, details) = match channel.send(recipient, subject, body) {
        Ok(d) => (STATUS_SUCCESS, d),
        Err(e) => (STATUS_FAILURE, format!("{e:#}")),
    };
    if status == STATUS_SUCCESS {
        info!(
            "event=notification_sent module=notify status=ok channel={}",
            channel.name()
        );
    } else {
        warn!(
            "event=notification_sent module=notify status=error channel={}",
            channel.name()
        );
    }
    record(
        conn,
        channel.name(),
        recipient,
        Some(subject),
        status,
        &details,
        guardian_id,
    );
    status == STATUS_SUCCESS
}
