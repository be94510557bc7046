use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use frontdesk_store::SessionStore;

/// Spawns the background task that evicts idle sessions. Runs at half the
/// idle window so a session never outlives roughly 1.5x its allowance.
pub fn spawn<S>(store: Arc<S>, idle_secs: u64) -> JoinHandle<()>
where
    S: SessionStore + 'static,
{
    let period = StdDuration::from_secs((idle_secs / 2).max(1));
    let idle = Duration::seconds(idle_secs as i64);

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        // The first tick fires immediately; skip it so startup stays quiet.
        ticker.tick().await;

        loop {
            ticker.tick().await;
            match store.sweep_expired(Utc::now(), idle).await {
                Ok(0) => {}
                Ok(swept) => {
                    info!(
                        event_name = "sweeper.sessions_evicted",
                        correlation_id = "sweeper",
                        swept,
                        "evicted idle sessions"
                    );
                }
                Err(error) => {
                    warn!(
                        event_name = "sweeper.sweep_failed",
                        correlation_id = "sweeper",
                        error = %error,
                        "session sweep failed; will retry next tick"
                    );
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{Duration, Utc};

    use frontdesk_core::{Session, UserId};
    use frontdesk_store::{InMemorySessionStore, SessionStore};

    use super::spawn;

    #[tokio::test(start_paused = true)]
    async fn sweeper_evicts_idle_sessions_on_its_period() {
        let store = Arc::new(InMemorySessionStore::new());

        let mut stale = Session::new(UserId("whatsapp:+911".to_string()), Utc::now());
        stale.updated_at = Utc::now() - Duration::minutes(45);
        store.upsert(stale).await.expect("seed stale session");

        let handle = spawn(Arc::clone(&store), 30 * 60);

        // Advance past the 15 minute period under the paused clock.
        tokio::time::sleep(std::time::Duration::from_secs(16 * 60)).await;

        assert!(store
            .get(&UserId("whatsapp:+911".to_string()))
            .await
            .expect("get")
            .is_none());
        handle.abort();
    }
}
