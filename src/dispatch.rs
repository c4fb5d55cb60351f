//! Reminder dispatcher collaborator.
//!
//! The workflow calls [`ReminderDispatcher::send`] from inside a durable step,
//! so a successful send is recorded and never repeated on replay. The
//! provided [`TemplateDispatcher`] renders a reminder e-mail and hands it to
//! a [`MailTransport`]; how the message actually leaves the process is up to
//! the transport.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tera::{Context as TeraContext, Tera};
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use crate::schedule::{ReminderOffsets, reminder_label};
use crate::subscription::Subscription;
use crate::substrate::{Clock, StepError};

/// Sender address used when none is configured.
pub const DEFAULT_MAIL_FROM: &str = "reminders@localhost";

/// Proof that a reminder was handed off. Recorded as the step result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchReceipt {
    pub label: String,
    pub recipient: String,
    pub message_id: Option<String>,
    pub sent_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error("transient dispatch failure: {0}")]
    Transient(String),

    #[error("permanent dispatch failure: {0}")]
    Permanent(String),
}

// Dispatch steps run with zero retries and a failed dispatch fails the run,
// whatever kind of failure the transport reported.
impl From<DispatchError> for StepError {
    fn from(err: DispatchError) -> Self {
        StepError::fatal(err.to_string())
    }
}

/// Sends one reminder for one subscription.
#[async_trait]
pub trait ReminderDispatcher: Send + Sync {
    async fn send(
        &self,
        label: &str,
        subscription: &Subscription,
    ) -> Result<DispatchReceipt, DispatchError>;
}

// ============================================================================
// Mail transport
// ============================================================================

/// A rendered reminder e-mail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailMessage {
    pub from: String,
    pub to: String,
    pub subject: String,
    pub html: String,
}

/// Delivers rendered mail. Returns the provider's message id, if any.
#[async_trait]
pub trait MailTransport: Send + Sync {
    async fn deliver(&self, message: &MailMessage) -> Result<Option<String>, DispatchError>;
}

/// Transport that only logs the message. Used when no mail provider is wired.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingTransport;

#[async_trait]
impl MailTransport for TracingTransport {
    async fn deliver(&self, message: &MailMessage) -> Result<Option<String>, DispatchError> {
        let message_id = Uuid::new_v4().to_string();
        info!(
            to = %message.to,
            subject = %message.subject,
            message_id = %message_id,
            "reminder email sent"
        );
        Ok(Some(message_id))
    }
}

// ============================================================================
// Template dispatcher
// ============================================================================

const SUBJECT_TEMPLATE: &str =
    "{% if days_left == 1 %}Final Reminder: {{ subscription_name }} renews tomorrow!\
     {% else %}Reminder: Your {{ subscription_name }} subscription renews in {{ days_left }} days{% endif %}";

const BODY_TEMPLATE: &str = r#"<div style="font-family: sans-serif; max-width: 600px; margin: 0 auto;">
  <p>Hello <strong>{{ user_name }}</strong>,</p>
  <p>Your <strong>{{ subscription_name }}</strong> subscription is set to renew on
     <strong>{{ renewal_date }}</strong>{% if days_left == 1 %} (tomorrow){% else %} ({{ days_left }} days from now){% endif %}.</p>
  <table>
    <tr><td>Plan</td><td>{{ plan_name }}</td></tr>
    {% if price %}<tr><td>Price</td><td>{{ price }}</td></tr>{% endif %}
    {% if payment_method %}<tr><td>Payment method</td><td>{{ payment_method }}</td></tr>{% endif %}
  </table>
  <p>If you'd like to make changes or cancel, please do so before the renewal date.</p>
</div>"#;

/// Dispatcher that renders a reminder e-mail per label and delivers it
/// through a [`MailTransport`].
pub struct TemplateDispatcher<T> {
    transport: T,
    templates: Tera,
    /// Reminder label -> days before renewal.
    labels: HashMap<String, u32>,
    from: String,
    clock: Arc<dyn Clock>,
}

impl<T: MailTransport> TemplateDispatcher<T> {
    /// Build a dispatcher that knows the labels produced for `offsets`.
    pub fn new(
        transport: T,
        offsets: &ReminderOffsets,
        from: impl Into<String>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, DispatchError> {
        let mut templates = Tera::default();
        templates
            .add_raw_templates(vec![
                ("reminder_subject.txt", SUBJECT_TEMPLATE),
                ("reminder_body.html", BODY_TEMPLATE),
            ])
            .map_err(|err| DispatchError::Permanent(format!("invalid email template: {err}")))?;

        let labels = offsets
            .days()
            .iter()
            .map(|&days| (reminder_label(days), days))
            .collect();

        Ok(Self {
            transport,
            templates,
            labels,
            from: from.into(),
            clock,
        })
    }

    /// Render the e-mail for `label` without sending it.
    pub fn render(
        &self,
        label: &str,
        subscription: &Subscription,
    ) -> Result<MailMessage, DispatchError> {
        if subscription.user.email.trim().is_empty() {
            return Err(DispatchError::Permanent(format!(
                "subscription {} has no recipient email",
                subscription.id
            )));
        }

        let days_left = *self
            .labels
            .get(label)
            .ok_or_else(|| DispatchError::Permanent(format!("invalid email type: {label}")))?;

        let context = mail_context(subscription, days_left);
        let subject = self
            .templates
            .render("reminder_subject.txt", &context)
            .map_err(|err| DispatchError::Permanent(format!("failed to render subject: {err}")))?;
        let html = self
            .templates
            .render("reminder_body.html", &context)
            .map_err(|err| DispatchError::Permanent(format!("failed to render body: {err}")))?;

        Ok(MailMessage {
            from: self.from.clone(),
            to: subscription.user.email.clone(),
            subject,
            html,
        })
    }
}

#[async_trait]
impl<T: MailTransport> ReminderDispatcher for TemplateDispatcher<T> {
    async fn send(
        &self,
        label: &str,
        subscription: &Subscription,
    ) -> Result<DispatchReceipt, DispatchError> {
        info!(subscription_id = %subscription.id, label, "triggering reminder");

        let message = self.render(label, subscription)?;
        let message_id = self.transport.deliver(&message).await?;

        Ok(DispatchReceipt {
            label: label.to_string(),
            recipient: message.to,
            message_id,
            sent_at: self.clock.now(),
        })
    }
}

fn mail_context(subscription: &Subscription, days_left: u32) -> TeraContext {
    let mut context = TeraContext::new();
    context.insert("user_name", &subscription.user.name);
    context.insert("subscription_name", &subscription.name);
    context.insert("plan_name", &subscription.name);
    context.insert(
        "renewal_date",
        &subscription.renewal_date.format("%b %-d, %Y").to_string(),
    );
    context.insert("days_left", &days_left);
    context.insert("price", &format_price(subscription));
    context.insert("payment_method", &subscription.payment_method);
    context
}

/// `USD 15.99 (monthly)`, or `None` without a price.
fn format_price(subscription: &Subscription) -> Option<String> {
    let price = subscription.price?;
    let mut rendered = match subscription.currency.as_deref() {
        Some(currency) => format!("{currency} {price:.2}"),
        None => format!("{price:.2}"),
    };
    if let Some(frequency) = subscription.frequency.as_deref() {
        rendered.push_str(&format!(" ({frequency})"));
    }
    Some(rendered)
}
