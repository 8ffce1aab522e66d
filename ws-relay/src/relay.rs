use std::{
    collections::BTreeMap,
    sync::atomic::{AtomicBool, AtomicU64, Ordering},
};

use futures::{Stream, StreamExt};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, trace};

use crate::{
    endpoint::{ConnectionError, SharedEndpoint},
    envelope::{Envelope, Inbound, MemberId, Target},
};

/// Membership and routing state for one channel.
///
/// Ids start at 1 and are never handed out twice by the same relay. Once the
/// last member departs the relay is retired and refuses further admissions;
/// the registry replaces it with a fresh one.
///
/// Nothing awaits an endpoint while the membership lock is held: every
/// delivery is queued on the member's [`Outbox`].
pub struct Relay {
    channel: String,
    members: Mutex<BTreeMap<MemberId, Outbox>>,
    next_id: AtomicU64,
    retired: AtomicBool,
}

#[derive(Debug, Error)]
pub enum AdmitError {
    #[error("relay for channel '{0}' has emptied and no longer admits members")]
    Retired(String),
}

/// Ordered delivery queue in front of one member's endpoint.
///
/// Pushing never waits. A writer task drains the queue into the endpoint one
/// message at a time, so a slow or stalled endpoint only holds up its own
/// queue. The writer exits once the outbox is dropped and the queue is empty.
struct Outbox {
    queue: mpsc::UnboundedSender<String>,
}

impl Outbox {
    fn open(member: MemberId, endpoint: SharedEndpoint) -> Self {
        let (queue, mut pending) = mpsc::unbounded_channel::<String>();
        tokio::spawn(async move {
            while let Some(text) = pending.recv().await {
                if let Err(error) = endpoint.send(text).await {
                    debug!(%member, %error, "dropping message for unreachable member");
                }
            }
        });

        Self { queue }
    }

    fn push(&self, text: String) {
        // Fails only once the writer task is gone, i.e. during runtime shutdown.
        let _ = self.queue.send(text);
    }
}

impl Relay {
    pub fn new(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            members: Mutex::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
            retired: AtomicBool::new(false),
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::SeqCst)
    }

    /// Current member ids in admission order.
    pub async fn member_ids(&self) -> Vec<MemberId> {
        self.members.lock().await.keys().copied().collect()
    }

    pub async fn member_count(&self) -> usize {
        self.members.lock().await.len()
    }

    fn next_id(&self) -> MemberId {
        MemberId::new(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Admits a connection and returns its id.
    ///
    /// The newcomer's queue gets its own id, then one `join` per existing
    /// member. Existing members then get the newcomer's `join`, and only
    /// after that is the newcomer added to the membership. All of it happens
    /// under one lock acquisition, so concurrent admissions each see a
    /// consistent roster and the newcomer's roster precedes any live traffic.
    pub async fn admit(&self, endpoint: SharedEndpoint) -> Result<MemberId, AdmitError> {
        let mut members = self.members.lock().await;
        if self.is_retired() {
            return Err(AdmitError::Retired(self.channel.clone()));
        }

        let id = self.next_id();
        let outbox = Outbox::open(id, endpoint);
        outbox.push(Envelope::identity(id).to_string());
        for existing in members.keys() {
            outbox.push(Envelope::join(*existing).to_string());
        }

        fan_out(&members, id, Envelope::join(id).to_string());
        members.insert(id, outbox);

        info!(channel = %self.channel, member = %id, members = members.len(), "member joined");
        Ok(id)
    }

    /// Best-effort delivery of `payload` from `source`. Never fails: absent
    /// targets and broken peers are dropped.
    pub async fn route(&self, source: MemberId, target: &Target, payload: &str) {
        let text = Envelope::text(source, payload).to_string();

        match target {
            Target::Broadcast => {
                let members = self.members.lock().await;
                fan_out(&members, source, text);
            }
            Target::Member(id) => match self.members.lock().await.get(id) {
                Some(outbox) => outbox.push(text),
                None => trace!(
                    channel = %self.channel,
                    %source,
                    to = %id,
                    "dropping message for absent member"
                ),
            },
            Target::Unknown(token) => trace!(
                channel = %self.channel,
                %source,
                to = %token,
                "dropping message for unknown target"
            ),
        }
    }

    /// Reads `inbound` until it ends or fails, routing every message.
    ///
    /// Malformed messages are dropped and reading continues. Departure is
    /// left to the caller.
    pub async fn serve<S>(&self, member: MemberId, mut inbound: S)
    where
        S: Stream<Item = Result<String, ConnectionError>> + Unpin,
    {
        while let Some(message) = inbound.next().await {
            let text = match message {
                Ok(text) => text,
                Err(error) => {
                    debug!(channel = %self.channel, %member, %error, "connection failed");
                    break;
                }
            };

            match Inbound::parse(&text) {
                Ok(Inbound { target, payload }) => self.route(member, &target, &payload).await,
                Err(error) => {
                    debug!(channel = %self.channel, %member, %error, "dropping malformed message")
                }
            }
        }
    }

    /// Removes `member` and queues its `quit` for whoever remains.
    ///
    /// Returns `true` when this departure emptied the relay, in which case
    /// the relay is now retired. Departing an absent member does nothing.
    pub async fn depart(&self, member: MemberId) -> bool {
        let mut members = self.members.lock().await;
        if members.remove(&member).is_none() {
            return false;
        }

        fan_out(&members, member, Envelope::quit(member).to_string());
        let emptied = members.is_empty();
        if emptied {
            self.retired.store(true, Ordering::SeqCst);
        }

        info!(channel = %self.channel, %member, members = members.len(), "member left");
        emptied
    }
}

/// Queues `text` for every member except `skip`. Each member's writer task
/// delivers independently, so one failed or slow delivery affects only its
/// own peer.
fn fan_out(members: &BTreeMap<MemberId, Outbox>, skip: MemberId, text: String) {
    for (_, outbox) in members.iter().filter(|(id, _)| **id != skip) {
        outbox.push(text.clone());
    }
}
