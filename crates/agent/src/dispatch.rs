use anyhow::{Context, Result};
use async_trait::async_trait;
use thiserror::Error;

use frontdesk_core::config::DispatchConfig;
use frontdesk_core::ConfirmedBooking;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("booking sink rejected the request: {0}")]
    Rejected(String),
    #[error("booking sink unreachable: {0}")]
    Transport(String),
    #[error("booking sink call timed out")]
    Timeout,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DispatchAck {
    pub reference: String,
}

/// Performs the external side effect for a confirmed booking. The runtime
/// guarantees a single invocation per confirmed session via the store's
/// compare-and-swap; the idempotency key on the booking is defense in depth
/// for sinks that support one.
#[async_trait]
pub trait BookingDispatcher: Send + Sync {
    async fn dispatch(&self, booking: &ConfirmedBooking) -> Result<DispatchAck, DispatchError>;
}

#[async_trait]
impl<T: BookingDispatcher + ?Sized> BookingDispatcher for std::sync::Arc<T> {
    async fn dispatch(&self, booking: &ConfirmedBooking) -> Result<DispatchAck, DispatchError> {
        (**self).dispatch(booking).await
    }
}

/// Posts the booking to the staff notification webhook.
pub struct WebhookDispatcher {
    http: reqwest::Client,
    url: String,
}

impl WebhookDispatcher {
    pub fn from_config(config: &DispatchConfig) -> Result<Option<Self>> {
        if !config.enabled {
            return Ok(None);
        }
        let url = config
            .webhook_url
            .clone()
            .context("dispatch.enabled requires dispatch.webhook_url")?;
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()
            .context("building dispatch http client")?;

        Ok(Some(Self { http, url }))
    }
}

#[async_trait]
impl BookingDispatcher for WebhookDispatcher {
    async fn dispatch(&self, booking: &ConfirmedBooking) -> Result<DispatchAck, DispatchError> {
        let response = self
            .http
            .post(&self.url)
            .header("Idempotency-Key", &booking.booking_key)
            .json(booking)
            .send()
            .await
            .map_err(|err| {
                if err.is_timeout() {
                    DispatchError::Timeout
                } else {
                    DispatchError::Transport(err.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(DispatchError::Rejected(format!("sink returned {status}")));
        }

        Ok(DispatchAck { reference: booking.booking_key.clone() })
    }
}

/// Preview-mode sink: logs the booking and acknowledges. Used until a real
/// webhook is configured, and by tests.
#[derive(Default)]
pub struct NoopDispatcher;

#[async_trait]
impl BookingDispatcher for NoopDispatcher {
    async fn dispatch(&self, booking: &ConfirmedBooking) -> Result<DispatchAck, DispatchError> {
        tracing::info!(
            event_name = "dispatch.preview_ack",
            user_id = %booking.user_id.0,
            booking_key = %booking.booking_key,
            "preview dispatcher acknowledged booking without a side effect"
        );
        Ok(DispatchAck { reference: booking.booking_key.clone() })
    }
}
