use std::time::Duration;

use anyhow::{Context, Result};
use lettre::{
    Message, SmtpTransport, Transport,
    message::{Mailbox, MultiPart},
    transport::smtp::authentication::Credentials,
};
use log::{error, info};
use serde::Serialize;

use crate::{
    config::{NotifyConfig, SmtpConfig},
    domain::without_wildcard,
    issuance::{dns_providers::http, flow::RunReport},
};

const SMTP_TIMEOUT: Duration = Duration::from_secs(30);
const SMTPS_PORT: u16 = 465;

/// Operator-facing summary of a run.
#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    pub success: bool,
    pub domains: Vec<String>,
    pub subject: String,
    pub error: Option<String>,
    pub text_body: String,
    pub html_body: String,
}

impl Notification {
    pub fn from_report(report: &RunReport) -> Self {
        let primary = report
            .domains
            .first()
            .map(|domain| without_wildcard(domain))
            .unwrap_or("unknown");
        let outcome = if report.success { "succeeded" } else { "failed" };
        let subject = format!("ACME certificate issuance {outcome} - {primary}");
        let log_text = report.log.to_string();

        let mut text_body = format!(
            "Time: {}\nDomains: {}\nResult: {}\n",
            report.finished_at.format("%Y-%m-%d %H:%M:%S UTC"),
            report.domains.join(", "),
            outcome
        );
        if let Some(err) = &report.error {
            text_body.push_str(&format!("Error: {err}\n"));
        }
        if let Some(cert) = &report.certificate {
            text_body.push_str(&format!(
                "Expires: {}\nFingerprint: {}\n",
                cert.not_after.format("%Y-%m-%d"),
                cert.fingerprint
            ));
        }
        text_body.push('\n');
        text_body.push_str(&log_text);

        let mut rows = vec![
            (
                "Time",
                report
                    .finished_at
                    .format("%Y-%m-%d %H:%M:%S UTC")
                    .to_string(),
            ),
            ("Domains", report.domains.join(", ")),
            ("Result", outcome.to_string()),
        ];
        if let Some(err) = &report.error {
            rows.push(("Error", err.clone()));
        }
        if let Some(cert) = &report.certificate {
            rows.push(("Expires", cert.not_after.format("%Y-%m-%d").to_string()));
        }
        let rows: String = rows
            .iter()
            .map(|(label, value)| {
                format!(
                    "<tr><th align=\"left\">{}</th><td>{}</td></tr>",
                    label,
                    escape_html(value)
                )
            })
            .collect();
        let html_body = format!(
            "<html><body><h2>{}</h2><table border=\"1\" cellpadding=\"4\">{}</table>\
             <h3>Run log</h3><pre>{}</pre></body></html>",
            escape_html(&subject),
            rows,
            escape_html(&log_text)
        );

        Self {
            success: report.success,
            domains: report.domains.clone(),
            subject,
            error: report.error.clone(),
            text_body,
            html_body,
        }
    }
}

pub trait Notifier {
    fn id(&self) -> &'static str;
    fn notify(&self, notification: &Notification) -> Result<()>;
}

/// Writes the summary to the log.
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn id(&self) -> &'static str {
        "log"
    }

    fn notify(&self, notification: &Notification) -> Result<()> {
        if notification.success {
            info!("[notify] {}", notification.subject);
        } else {
            error!("[notify] {}", notification.subject);
        }
        Ok(())
    }
}

/// POSTs the notification as JSON.
pub struct WebhookNotifier {
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

impl Notifier for WebhookNotifier {
    fn id(&self) -> &'static str {
        "webhook"
    }

    fn notify(&self, notification: &Notification) -> Result<()> {
        let response = http::HttpClient::shared()
            .post(&self.url)
            .json(notification)
            .send()
            .with_context(|| format!("failed to reach webhook {}", self.url))?;
        http::ensure_success("Webhook", response)?;
        info!("[notify] webhook delivered: {}", notification.subject);
        Ok(())
    }
}

/// Sends the text and HTML bodies as one multipart message.
pub struct EmailNotifier {
    smtp: SmtpConfig,
    password: String,
}

impl EmailNotifier {
    /// Resolves the SMTP password up front so a missing secret fails before the run.
    pub fn new(smtp: SmtpConfig) -> Result<Self> {
        let password = smtp.resolve_password()?;
        Ok(Self { smtp, password })
    }

    fn message(&self, notification: &Notification) -> Result<Message> {
        let sender: Mailbox = self
            .smtp
            .sender
            .parse()
            .with_context(|| format!("invalid sender address {}", self.smtp.sender))?;
        let mut builder = Message::builder()
            .from(sender)
            .subject(notification.subject.clone());
        for recipient in &self.smtp.recipients {
            let mailbox: Mailbox = recipient
                .parse()
                .with_context(|| format!("invalid recipient address {recipient}"))?;
            builder = builder.to(mailbox);
        }
        builder
            .multipart(MultiPart::alternative_plain_html(
                notification.text_body.clone(),
                notification.html_body.clone(),
            ))
            .context("failed to build notification email")
    }

    fn transport(&self) -> Result<SmtpTransport> {
        let builder = if self.smtp.port == SMTPS_PORT {
            SmtpTransport::relay(&self.smtp.host)
        } else {
            SmtpTransport::starttls_relay(&self.smtp.host)
        }
        .with_context(|| format!("failed to set up SMTP relay {}", self.smtp.host))?;
        Ok(builder
            .port(self.smtp.port)
            .credentials(Credentials::new(
                self.smtp.sender.clone(),
                self.password.clone(),
            ))
            .timeout(Some(SMTP_TIMEOUT))
            .build())
    }
}

impl Notifier for EmailNotifier {
    fn id(&self) -> &'static str {
        "email"
    }

    fn notify(&self, notification: &Notification) -> Result<()> {
        let message = self.message(notification)?;
        self.transport()?
            .send(&message)
            .with_context(|| format!("failed to send mail via {}", self.smtp.host))?;
        info!(
            "[notify] mail sent to {}: {}",
            self.smtp.recipients.join(", "),
            notification.subject
        );
        Ok(())
    }
}

pub fn notifier_from_config(config: &NotifyConfig) -> Result<Box<dyn Notifier>> {
    match config {
        NotifyConfig::Log => Ok(Box::new(LogNotifier)),
        NotifyConfig::Webhook { url } => Ok(Box::new(WebhookNotifier::new(url.clone()))),
        NotifyConfig::Email(smtp) => Ok(Box::new(EmailNotifier::new(smtp.clone())?)),
    }
}

/// Delivers a notification; failures are logged and never change the run outcome.
pub fn deliver(notifier: &dyn Notifier, notification: &Notification) {
    if let Err(err) = notifier.notify(notification) {
        error!("[notify] {} notifier failed: {:#}", notifier.id(), err);
    }
}

fn escape_html(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            other => escaped.push(other),
        }
    }
    escaped
}
