//! SMTP email client.
//!
//! The rendered payload is `{"subject": .., "text": .., "html": ..}` with
//! `html` optional. Transport settings come from the target:
//!
//! - `smtp_host`, `smtp_port`, `from`, `to` from the endpoint definition
//! - `username` / `password` credentials enable SMTP AUTH
//! - `tls` credential: `starttls` (default), `tls` (implicit TLS) or `none`

use async_trait::async_trait;
use lettre::message::{header::ContentType, Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials as SmtpCredentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use publishing::{Delivery, DeliveryError, Provider, PublisherClient, Target, TargetEndpoint};
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use crate::error::ChannelError;

#[derive(Debug, Deserialize)]
struct EmailPayload {
    subject: String,
    text: String,
    #[serde(default)]
    html: Option<String>,
}

/// Sends alerts through an SMTP relay.
pub struct EmailClient {
    timeout: Duration,
}

impl EmailClient {
    #[must_use]
    pub const fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    fn transport(&self, target: &Target) -> Result<AsyncSmtpTransport<Tokio1Executor>, ChannelError> {
        let TargetEndpoint::Smtp { host, port, .. } = &target.endpoint else {
            return Err(ChannelError::Endpoint(format!(
                "email target {} has no SMTP endpoint",
                target.id
            )));
        };

        let creds = &target.credentials;
        let builder = match creds.get("tls").unwrap_or("starttls") {
            "none" => AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(host),
            "tls" => AsyncSmtpTransport::<Tokio1Executor>::relay(host)?,
            _ => AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(host)?,
        };
        let mut builder = builder.port(*port).timeout(Some(self.timeout));
        if let Some(username) = creds.get("username") {
            builder = builder.credentials(SmtpCredentials::new(
                username.to_string(),
                creds.get("password").unwrap_or_default().to_string(),
            ));
        }
        Ok(builder.build())
    }

    fn message(target: &Target, payload: &serde_json::Value) -> Result<Message, ChannelError> {
        let TargetEndpoint::Smtp { from, to, .. } = &target.endpoint else {
            return Err(ChannelError::Endpoint(format!(
                "email target {} has no SMTP endpoint",
                target.id
            )));
        };
        let payload: EmailPayload = serde_json::from_value(payload.clone())
            .map_err(|e| ChannelError::Payload(format!("email payload: {e}")))?;

        let mut builder = Message::builder()
            .from(from.parse::<Mailbox>()?)
            .subject(payload.subject);
        for recipient in to {
            builder = builder.to(recipient.parse::<Mailbox>()?);
        }

        let message = match payload.html {
            Some(html) => builder.multipart(
                MultiPart::alternative()
                    .singlepart(
                        SinglePart::builder()
                            .header(ContentType::TEXT_PLAIN)
                            .body(payload.text),
                    )
                    .singlepart(
                        SinglePart::builder()
                            .header(ContentType::TEXT_HTML)
                            .body(html),
                    ),
            )?,
            None => builder.header(ContentType::TEXT_PLAIN).body(payload.text)?,
        };
        Ok(message)
    }

    async fn deliver(&self, target: &Target, payload: &serde_json::Value) -> Result<Delivery, ChannelError> {
        let message = Self::message(target, payload)?;
        let mailer = self.transport(target)?;
        let response = mailer.send(message).await?;
        debug!(target_id = %target.id, code = %response.code(), "Email accepted by relay");
        Ok(Delivery { http_status: None })
    }

    async fn check(&self, target: &Target) -> Result<(), ChannelError> {
        let mailer = self.transport(target)?;
        if mailer.test_connection().await? {
            Ok(())
        } else {
            let host = match &target.endpoint {
                TargetEndpoint::Smtp { host, port, .. } => format!("{host}:{port}"),
                TargetEndpoint::Http { url } => url.clone(),
            };
            Err(ChannelError::SmtpUnreachable(host))
        }
    }
}

#[async_trait]
impl PublisherClient for EmailClient {
    fn provider(&self) -> Provider {
        Provider::Email
    }

    async fn send(&self, target: &Target, payload: &serde_json::Value) -> Result<Delivery, DeliveryError> {
        Ok(self.deliver(target, payload).await?)
    }

    async fn probe(&self, target: &Target) -> Result<(), DeliveryError> {
        Ok(self.check(target).await?)
    }
}
