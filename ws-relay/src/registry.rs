use std::{collections::HashMap, sync::Arc};

use futures::Stream;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::{
    endpoint::{ConnectionError, SharedEndpoint},
    envelope::MemberId,
    relay::{AdmitError, Relay},
};

/// Directory of live relays keyed by channel name.
///
/// Cloning is cheap and every clone shares the same directory. Construct one
/// at startup and hand it to whatever accepts connections.
#[derive(Clone, Default)]
pub struct Registry {
    relays: Arc<Mutex<HashMap<String, Arc<Relay>>>>,
}

/// Point-in-time view of one channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSummary {
    pub channel: String,
    pub members: usize,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the live relay for `channel`, installing a fresh one if there
    /// is none or the existing one has been retired.
    pub async fn get_or_create(&self, channel: &str) -> Arc<Relay> {
        let mut relays = self.relays.lock().await;
        if let Some(relay) = relays.get(channel) {
            if !relay.is_retired() {
                return Arc::clone(relay);
            }
        }

        debug!(%channel, "creating relay");
        let relay = Arc::new(Relay::new(channel));
        relays.insert(channel.to_string(), Arc::clone(&relay));
        relay
    }

    /// Drops the entry for `channel` if its relay has been retired. A missing
    /// entry, or one already replaced by a live relay, is left alone.
    pub async fn remove(&self, channel: &str) {
        let mut relays = self.relays.lock().await;
        if relays.get(channel).is_some_and(|relay| relay.is_retired()) {
            relays.remove(channel);
            debug!(%channel, "removed empty relay");
        }
    }

    pub async fn contains(&self, channel: &str) -> bool {
        self.relays.lock().await.contains_key(channel)
    }

    pub async fn channel_count(&self) -> usize {
        self.relays.lock().await.len()
    }

    pub async fn member_count(&self, channel: &str) -> usize {
        let relay = self.relays.lock().await.get(channel).cloned();
        match relay {
            Some(relay) => relay.member_count().await,
            None => 0,
        }
    }

    /// Channels sorted by name with their member counts.
    pub async fn snapshot(&self) -> Vec<ChannelSummary> {
        let relays: Vec<Arc<Relay>> = self.relays.lock().await.values().cloned().collect();

        let mut summaries = Vec::with_capacity(relays.len());
        for relay in relays {
            summaries.push(ChannelSummary {
                channel: relay.channel().to_string(),
                members: relay.member_count().await,
            });
        }
        summaries.sort_by(|a, b| a.channel.cmp(&b.channel));
        summaries
    }

    /// Drives one connection for its whole lifetime: joins it to the relay
    /// for `channel`, routes everything it sends, and cleans up once
    /// `inbound` ends or fails.
    pub async fn connect<S>(&self, channel: &str, endpoint: SharedEndpoint, inbound: S)
    where
        S: Stream<Item = Result<String, ConnectionError>> + Unpin,
    {
        let relay = self.get_or_create(channel).await;
        let (relay, member) = self.admit_or_retry(channel, relay, endpoint).await;
        let departure = Departure::new(self.clone(), Arc::clone(&relay), member);

        relay.serve(member, inbound).await;
        departure.run().await;
    }

    /// Admits `endpoint` to `relay`, moving on to the replacement whenever
    /// the relay turns out to be retired.
    ///
    /// Each retry follows a departure that emptied the channel between
    /// lookup and admission, so there is no fixed retry count.
    async fn admit_or_retry(
        &self,
        channel: &str,
        mut relay: Arc<Relay>,
        endpoint: SharedEndpoint,
    ) -> (Arc<Relay>, MemberId) {
        loop {
            match relay.admit(Arc::clone(&endpoint)).await {
                Ok(member) => return (relay, member),
                Err(AdmitError::Retired(_)) => {
                    debug!(%channel, "relay retired before admission, retrying");
                    relay = self.get_or_create(channel).await;
                }
            }
        }
    }

    /// Departs `member` and drops the channel entry once its relay is
    /// retired. Safe to repeat: a second call still removes the entry.
    async fn leave(&self, relay: &Relay, member: MemberId) {
        let emptied = relay.depart(member).await;
        if emptied || relay.is_retired() {
            self.remove(relay.channel()).await;
        }
        if emptied {
            info!(channel = %relay.channel(), "channel closed");
        }
    }
}

/// Runs departure cleanup exactly once: inline through [`Departure::run`],
/// or on the runtime if the connection future is dropped first.
struct Departure {
    registry: Registry,
    relay: Arc<Relay>,
    member: MemberId,
    pending: bool,
}

impl Departure {
    fn new(registry: Registry, relay: Arc<Relay>, member: MemberId) -> Self {
        Self {
            registry,
            relay,
            member,
            pending: true,
        }
    }

    /// Cleanup stays pending until `leave` completes, so aborting this
    /// future part way through hands the rest to the drop guard.
    async fn run(mut self) {
        self.registry.leave(&self.relay, self.member).await;
        self.pending = false;
    }
}

impl Drop for Departure {
    fn drop(&mut self) {
        if !self.pending {
            return;
        }

        let registry = self.registry.clone();
        let relay = Arc::clone(&self.relay);
        let member = self.member;
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move { registry.leave(&relay, member).await });
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::{channel::mpsc, future::BoxFuture};
    use tokio::time::timeout;

    use super::*;
    use crate::endpoint::Endpoint;

    struct Silent;

    impl Endpoint for Silent {
        fn send(&self, _text: String) -> BoxFuture<'_, Result<(), ConnectionError>> {
            Box::pin(async { Ok(()) })
        }
    }

    #[tokio::test]
    async fn get_or_create_returns_the_same_live_relay() {
        let registry = Registry::new();
        let first = registry.get_or_create("room").await;
        let second = registry.get_or_create("room").await;
        let other = registry.get_or_create("lobby").await;

        assert!(Arc::ptr_eq(&first, &second));
        assert!(!Arc::ptr_eq(&first, &other));
        assert_eq!(registry.channel_count().await, 2);
    }

    #[tokio::test]
    async fn remove_is_a_no_op_for_absent_or_live_channels() {
        let registry = Registry::new();
        registry.remove("missing").await;

        let relay = registry.get_or_create("room").await;
        relay.admit(Arc::new(Silent)).await.expect("admit");
        registry.remove("room").await;

        assert!(registry.contains("room").await);
        assert_eq!(registry.member_count("room").await, 1);
    }

    #[tokio::test]
    async fn retired_relay_is_replaced_and_removed() {
        let registry = Registry::new();
        let relay = registry.get_or_create("room").await;
        let member = relay.admit(Arc::new(Silent)).await.expect("admit");
        assert!(relay.depart(member).await);

        let fresh = registry.get_or_create("room").await;
        assert!(!Arc::ptr_eq(&relay, &fresh));

        // A stale removal for the retired relay leaves the fresh one in place.
        registry.remove("room").await;
        assert!(registry.contains("room").await);

        let member = fresh.admit(Arc::new(Silent)).await.expect("admit");
        assert_eq!(member, MemberId::new(1), "a fresh relay restarts its ids");
    }

    #[tokio::test]
    async fn snapshot_lists_channels_by_name() {
        let registry = Registry::new();
        for channel in ["/b", "/a"] {
            let relay = registry.get_or_create(channel).await;
            relay.admit(Arc::new(Silent)).await.expect("admit");
        }

        let snapshot = registry.snapshot().await;
        assert_eq!(
            snapshot,
            vec![
                ChannelSummary {
                    channel: "/a".into(),
                    members: 1
                },
                ChannelSummary {
                    channel: "/b".into(),
                    members: 1
                },
            ]
        );
    }

    #[tokio::test]
    async fn admission_moves_past_a_relay_retired_after_lookup() {
        let registry = Registry::new();
        let stale = registry.get_or_create("room").await;
        let first = stale.admit(Arc::new(Silent)).await.expect("admit");
        assert!(stale.depart(first).await);

        let (relay, member) = registry
            .admit_or_retry("room", Arc::clone(&stale), Arc::new(Silent))
            .await;

        assert!(!Arc::ptr_eq(&relay, &stale));
        assert_eq!(member, MemberId::new(1));
        assert!(Arc::ptr_eq(&registry.get_or_create("room").await, &relay));
        assert_eq!(registry.member_count("room").await, 1);
    }

    #[tokio::test]
    async fn aborting_during_cleanup_still_removes_the_channel() {
        let registry = Registry::new();
        let (inbound_tx, inbound) = mpsc::unbounded::<Result<String, ConnectionError>>();
        let task = tokio::spawn({
            let registry = registry.clone();
            async move { registry.connect("room", Arc::new(Silent), inbound).await }
        });

        timeout(Duration::from_secs(1), async {
            while registry.member_count("room").await != 1 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("member was admitted");
        let relay = registry.get_or_create("room").await;

        // Holding the directory lock parks cleanup between departure and removal.
        let directory = registry.relays.lock().await;
        drop(inbound_tx);
        timeout(Duration::from_secs(1), async {
            while !relay.is_retired() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("member departed");

        task.abort();
        let _ = task.await;
        drop(directory);

        timeout(Duration::from_secs(1), async {
            while registry.contains("room").await {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("retired relay left in the directory");
    }
}
