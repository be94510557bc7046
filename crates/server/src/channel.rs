use anyhow::Result;
use async_trait::async_trait;
use tracing::{error, info};

use frontdesk_agent::runtime::{InboundMessage, IntakeRuntime};
use frontdesk_agent::{BookingDispatcher, FieldExtractor};
use frontdesk_core::{Reply, UserId};
use frontdesk_store::SessionStore;

/// Transport seam between the messaging provider and the intake runtime.
/// Implementations own delivery; the serve loop owns ordering, so replies go
/// out in the same order messages came in.
#[async_trait]
pub trait MessageChannel: Send {
    /// Next inbound message, or `None` once the channel is closed.
    async fn next_message(&mut self) -> Option<InboundMessage>;

    async fn deliver(&mut self, user_id: &UserId, reply: Reply) -> Result<()>;
}

/// Placeholder transport used until a messaging provider is wired in. It
/// closes immediately, leaving the process to idle on the shutdown signal.
#[derive(Default)]
pub struct NoopChannel;

#[async_trait]
impl MessageChannel for NoopChannel {
    async fn next_message(&mut self) -> Option<InboundMessage> {
        info!(
            event_name = "channel.noop_idle",
            correlation_id = "bootstrap",
            "no messaging channel configured; inbound processing is idle"
        );
        None
    }

    async fn deliver(&mut self, _user_id: &UserId, _reply: Reply) -> Result<()> {
        Ok(())
    }
}

/// Pumps the channel until it closes. Store corruption is the only runtime
/// error that escapes a turn, and it stops the loop.
pub async fn serve<S, E, D, C>(runtime: &IntakeRuntime<S, E, D>, channel: &mut C) -> Result<()>
where
    S: SessionStore,
    E: FieldExtractor,
    D: BookingDispatcher,
    C: MessageChannel,
{
    while let Some(message) = channel.next_message().await {
        match runtime.handle_message(&message).await {
            Ok(reply) => channel.deliver(&message.user_id, reply).await?,
            Err(store_error) => {
                error!(
                    event_name = "channel.turn_fatal",
                    correlation_id = %message.message_id,
                    user_id = %message.user_id.0,
                    error = %store_error,
                    "session store failure ended inbound processing"
                );
                return Err(store_error.into());
            }
        }
    }
    Ok(())
}
