use super::{EmailComposer, NotificationError, NotificationKind, Notifier, ReceiptContext};
use async_trait::async_trait;
use serde::Serialize;
use tracing::{info, instrument, warn};

#[derive(Debug, Serialize)]
struct OutboundEmail<'a> {
    from: &'a str,
    to: [&'a str; 1],
    subject: &'a str,
    text: &'a str,
    html: &'a str,
    tags: [EmailTag<'a>; 1],
}

#[derive(Debug, Serialize)]
struct EmailTag<'a> {
    name: &'static str,
    value: &'a str,
}

/// Sends through an HTTP mail API that accepts a JSON message with a bearer key.
pub struct MailApiNotifier {
    http: reqwest::Client,
    api_url: String,
    api_key: String,
    from: String,
    composer: EmailComposer,
}

impl MailApiNotifier {
    pub fn new(
        http: reqwest::Client,
        api_url: impl Into<String>,
        api_key: impl Into<String>,
        from: impl Into<String>,
        composer: EmailComposer,
    ) -> Self {
        Self {
            http,
            api_url: api_url.into(),
            api_key: api_key.into(),
            from: from.into(),
            composer,
        }
    }
}

#[async_trait]
impl Notifier for MailApiNotifier {
    #[instrument(skip(self, kind, context, to), fields(kind = %kind, reference = %context.reference()))]
    async fn send(
        &self,
        kind: NotificationKind,
        context: &ReceiptContext,
        to: &str,
    ) -> Result<(), NotificationError> {
        if !to.contains('@') {
            return Err(NotificationError::InvalidRecipient(to.to_string()));
        }

        let message = self.composer.compose(kind, context);
        let payload = OutboundEmail {
            from: &self.from,
            to: [to],
            subject: &message.subject,
            text: &message.text,
            html: &message.html,
            tags: [EmailTag {
                name: "kind",
                value: kind.as_ref(),
            }],
        };

        let response = self
            .http
            .post(&self.api_url)
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .await
            .map_err(|e| NotificationError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), "mail API rejected message");
            return Err(NotificationError::Rejected {
                status: status.as_u16(),
                body: body.chars().take(200).collect(),
            });
        }

        info!("email sent");
        Ok(())
    }
}

/// Logs what would have been sent. Used when no mail API key is configured.
#[derive(Debug, Default)]
pub struct LogNotifier {
    composer: EmailComposer,
}

impl LogNotifier {
    pub fn new(composer: EmailComposer) -> Self {
        Self { composer }
    }
}

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(
        &self,
        kind: NotificationKind,
        context: &ReceiptContext,
        to: &str,
    ) -> Result<(), NotificationError> {
        let message = self.composer.compose(kind, context);
        info!(
            kind = %kind,
            to = %mask_email(to),
            subject = %message.subject,
            "email delivery disabled; message logged only"
        );
        Ok(())
    }
}

/// `ada@example.com` -> `a***@example.com`
pub fn mask_email(address: &str) -> String {
    match address.split_once('@') {
        Some((local, domain)) => {
            let first = local.chars().next().map(String::from).unwrap_or_default();
            format!("{}***@{}", first, domain)
        }
        None => "***".to_string(),
    }
}
