//! Versioned configuration container with change notification.
//!
//! Every `update` publishes a new immutable snapshot with the next version.
//! Publishing never waits for subscribers; how a slow subscriber is treated
//! depends on [`BacklogPolicy`].

use std::ops::Deref;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

use crate::telemetry::{default_sink, Component, ResourceEvent, SharedSink};

/// What happens when a subscriber falls behind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BacklogPolicy {
    /// The subscriber skips the oldest unread snapshots.
    #[default]
    DropOldest,
    /// The subscriber is disconnected once its backlog is full.
    DisconnectSlow,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigDataOptions {
    /// Unread snapshots buffered per subscriber.
    pub backlog: usize,
    pub policy: BacklogPolicy,
}

impl Default for ConfigDataOptions {
    fn default() -> Self {
        Self {
            backlog: 16,
            policy: BacklogPolicy::DropOldest,
        }
    }
}

/// One published configuration value.
#[derive(Debug)]
pub struct ConfigSnapshot<T> {
    pub version: u64,
    pub value: Arc<T>,
}

impl<T> Clone for ConfigSnapshot<T> {
    fn clone(&self) -> Self {
        Self {
            version: self.version,
            value: self.value.clone(),
        }
    }
}

impl<T> Deref for ConfigSnapshot<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

/// Snapshot handed to a disconnected subscriber after its buffered items.
type FinalSlot<T> = Arc<Mutex<Option<ConfigSnapshot<T>>>>;

struct DirectSubscriber<T> {
    tx: mpsc::Sender<ConfigSnapshot<T>>,
    last: FinalSlot<T>,
}

enum Publisher<T> {
    Broadcast(broadcast::Sender<ConfigSnapshot<T>>),
    Direct {
        backlog: usize,
        subscribers: Vec<DirectSubscriber<T>>,
    },
}

struct ConfigInner<T> {
    current: RwLock<ConfigSnapshot<T>>,
    /// Serializes updates so versions are published in order.
    publisher: Mutex<Publisher<T>>,
    sink: SharedSink,
}

/// Shared configuration value. Clones share the same container.
pub struct ConfigData<T> {
    inner: Arc<ConfigInner<T>>,
}

impl<T> Clone for ConfigData<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Send + Sync + 'static> ConfigData<T> {
    pub fn new(value: T, options: ConfigDataOptions) -> Self {
        Self::with_sink(value, options, default_sink())
    }

    pub fn with_sink(value: T, options: ConfigDataOptions, sink: SharedSink) -> Self {
        let backlog = options.backlog.max(1);
        let publisher = match options.policy {
            BacklogPolicy::DropOldest => Publisher::Broadcast(broadcast::channel(backlog).0),
            BacklogPolicy::DisconnectSlow => Publisher::Direct {
                backlog,
                subscribers: Vec::new(),
            },
        };
        Self {
            inner: Arc::new(ConfigInner {
                current: RwLock::new(ConfigSnapshot {
                    version: 0,
                    value: Arc::new(value),
                }),
                publisher: Mutex::new(publisher),
                sink,
            }),
        }
    }

    /// Latest published snapshot.
    pub fn current(&self) -> ConfigSnapshot<T> {
        self.inner.current.read().clone()
    }

    pub fn version(&self) -> u64 {
        self.inner.current.read().version
    }

    /// Publish a new value and return its version.
    pub fn update(&self, value: T) -> u64 {
        let mut publisher = self.inner.publisher.lock();
        let snapshot = {
            let mut current = self.inner.current.write();
            *current = ConfigSnapshot {
                version: current.version + 1,
                value: Arc::new(value),
            };
            current.clone()
        };
        let version = snapshot.version;

        let mut disconnected = 0usize;
        match &mut *publisher {
            Publisher::Broadcast(tx) => {
                // No receivers is not an error.
                let _ = tx.send(snapshot);
            }
            Publisher::Direct { subscribers, .. } => {
                subscribers.retain(|sub| match sub.tx.try_send(snapshot.clone()) {
                    Ok(()) => true,
                    Err(mpsc::error::TrySendError::Full(latest)) => {
                        // Set before the sender drops so the receiver sees it
                        // once the buffer is drained.
                        *sub.last.lock() = Some(latest);
                        disconnected += 1;
                        false
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => false,
                });
            }
        }
        drop(publisher);

        debug!(version, "configuration updated");
        self.inner
            .sink
            .record(ResourceEvent::new(Component::Shared, "config_update").context(format!("version={version}")));
        if disconnected > 0 {
            warn!(version, disconnected, "slow configuration subscribers disconnected");
            self.inner.sink.record(
                ResourceEvent::new(Component::Shared, "config_disconnect")
                    .success(false)
                    .context(format!("disconnected={disconnected}")),
            );
        }
        version
    }

    /// Receive every snapshot published after this call.
    pub fn subscribe(&self) -> Subscription<T> {
        let mut publisher = self.inner.publisher.lock();
        let receiver = match &mut *publisher {
            Publisher::Broadcast(tx) => Receiver::Broadcast(tx.subscribe()),
            Publisher::Direct { backlog, subscribers } => {
                let (tx, rx) = mpsc::channel(*backlog);
                let last: FinalSlot<T> = Arc::new(Mutex::new(None));
                subscribers.push(DirectSubscriber { tx, last: last.clone() });
                Receiver::Direct { rx, last }
            }
        };
        Subscription { receiver, skipped: 0 }
    }

    /// Subscribers still connected.
    pub fn subscriber_count(&self) -> usize {
        match &*self.inner.publisher.lock() {
            Publisher::Broadcast(tx) => tx.receiver_count(),
            Publisher::Direct { subscribers, .. } => {
                subscribers.iter().filter(|sub| !sub.tx.is_closed()).count()
            }
        }
    }
}

enum Receiver<T> {
    Broadcast(broadcast::Receiver<ConfigSnapshot<T>>),
    Direct {
        rx: mpsc::Receiver<ConfigSnapshot<T>>,
        last: FinalSlot<T>,
    },
}

/// Stream of configuration snapshots with strictly increasing versions.
pub struct Subscription<T> {
    receiver: Receiver<T>,
    skipped: u64,
}

impl<T> Subscription<T> {
    /// Next snapshot, or `None` once the container is gone or this
    /// subscriber was disconnected. A disconnected subscriber still receives
    /// the snapshot that was current when it was cut off.
    pub async fn recv(&mut self) -> Option<ConfigSnapshot<T>> {
        match &mut self.receiver {
            Receiver::Broadcast(rx) => loop {
                match rx.recv().await {
                    Ok(snapshot) => return Some(snapshot),
                    Err(broadcast::error::RecvError::Lagged(n)) => self.skipped += n,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            },
            Receiver::Direct { rx, last } => match rx.recv().await {
                Some(snapshot) => Some(snapshot),
                None => last.lock().take(),
            },
        }
    }

    /// Snapshots dropped because this subscriber lagged.
    pub fn skipped(&self) -> u64 {
        self.skipped
    }
}
