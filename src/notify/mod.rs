//! Notification fan-out.
//!
//! Every recipient gets its own retry loop and all loops run concurrently,
//! so one dead chat never delays or fails delivery to the others.

pub mod message;
pub mod telegram;

use crate::backoff::{linear, retry};
use async_trait::async_trait;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, warn};

pub use message::{format_alert, format_heartbeat};
pub use telegram::TelegramChannel;

#[derive(Error, Debug)]
pub enum DeliveryError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("API error {status}: {body}")]
    Api { status: u16, body: String },
}

#[async_trait]
pub trait NotificationChannel: Send + Sync {
    async fn send(&self, recipient: &str, text: &str) -> Result<(), DeliveryError>;
}

#[derive(Debug)]
pub struct DeliveryOutcome {
    pub recipient: String,
    pub attempts: u32,
    pub result: Result<(), DeliveryError>,
}

impl DeliveryOutcome {
    pub fn delivered(&self) -> bool {
        self.result.is_ok()
    }
}

/// Per-recipient outcomes, in recipient order.
#[derive(Debug, Default)]
pub struct DispatchReport {
    pub outcomes: Vec<DeliveryOutcome>,
}

impl DispatchReport {
    pub fn delivered(&self) -> usize {
        self.outcomes.iter().filter(|o| o.delivered()).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.delivered()
    }

    /// No recipient got the message (vacuously false with no recipients).
    pub fn all_failed(&self) -> bool {
        !self.outcomes.is_empty() && self.delivered() == 0
    }

    pub fn outcome(&self, recipient: &str) -> Option<&DeliveryOutcome> {
        self.outcomes.iter().find(|o| o.recipient == recipient)
    }
}

pub struct Dispatcher {
    channel: Arc<dyn NotificationChannel>,
    max_retries: u32,
    backoff_base: Duration,
}

impl Dispatcher {
    pub fn new(channel: Arc<dyn NotificationChannel>, max_retries: u32, backoff_base: Duration) -> Self {
        Self {
            channel,
            max_retries,
            backoff_base,
        }
    }

    pub async fn dispatch(&self, recipients: &[String], text: &str) -> DispatchReport {
        let outcomes = join_all(recipients.iter().map(|r| self.deliver(r, text))).await;
        let report = DispatchReport { outcomes };
        if report.failed() > 0 {
            warn!(
                delivered = report.delivered(),
                failed = report.failed(),
                "some recipients were not notified"
            );
        }
        report
    }

    async fn deliver(&self, recipient: &str, text: &str) -> DeliveryOutcome {
        let max = self.max_retries.max(1);
        let result = retry(max, linear(self.backoff_base), |attempt| async move {
            let sent = self.channel.send(recipient, text).await;
            if let Err(ref e) = sent {
                warn!(recipient = %recipient, attempt, max, error = %e, "delivery attempt failed");
            }
            sent
        })
        .await;

        match result {
            Ok(((), attempts)) => {
                info!(recipient = %recipient, attempt = attempts, "message delivered");
                DeliveryOutcome {
                    recipient: recipient.to_string(),
                    attempts,
                    result: Ok(()),
                }
            }
            Err((e, attempts)) => {
                error!(recipient = %recipient, attempts, error = %e, "giving up on recipient");
                DeliveryOutcome {
                    recipient: recipient.to_string(),
                    attempts,
                    result: Err(e),
                }
            }
        }
    }
}
