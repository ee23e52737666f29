// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::mpsc;
use url::Url;

use crate::error::LoadErrorKind;
use crate::model::Podcast;

/// Progress of one feed load, as reported to listeners
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    Connecting,
    /// Percentage of the feed body received, when the length is known
    Downloading(u8),
    Parsing,
}

/// Lifecycle events for one podcast load
#[derive(Debug, Clone)]
pub enum LoadEvent {
    Progress {
        podcast: Url,
        progress: Progress,
    },
    /// The load succeeded; carries the updated snapshot and how many of
    /// its episodes the metadata store considers new
    Loaded {
        podcast: Arc<Podcast>,
        new_episodes: usize,
    },
    /// The load failed with a classified error; the podcast's previous
    /// snapshot (if any) remains queryable
    Failed {
        podcast: Url,
        error: LoadErrorKind,
    },
    /// A logo fetch outside the parse cycle completed
    LogoLoaded { podcast: Arc<Podcast> },
}

/// Changes to the subscribed podcast list
#[derive(Debug, Clone)]
pub enum ListEvent {
    Added(Arc<Podcast>),
    Removed(Url),
}

/// The podcast identity an event is about, used for filtered delivery
pub trait Subject {
    fn subject(&self) -> &Url;
}

impl Subject for LoadEvent {
    fn subject(&self) -> &Url {
        match self {
            LoadEvent::Progress { podcast, .. } => podcast,
            LoadEvent::Loaded { podcast, .. } => podcast.url(),
            LoadEvent::Failed { podcast, .. } => podcast,
            LoadEvent::LogoLoaded { podcast } => podcast.url(),
        }
    }
}

impl Subject for ListEvent {
    fn subject(&self) -> &Url {
        match self {
            ListEvent::Added(podcast) => podcast.url(),
            ListEvent::Removed(url) => url,
        }
    }
}

type DetachHook = Arc<dyn Fn(Option<&Url>) + Send + Sync>;

struct Slot<E> {
    tx: mpsc::UnboundedSender<E>,
    filter: Option<Url>,
}

struct BusInner<E> {
    next_id: u64,
    subscribers: HashMap<u64, Slot<E>>,
    detach_hook: Option<DetachHook>,
}

/// Fan-out point for lifecycle events.
///
/// Every subscriber gets its own ordered queue; emission is serialized,
/// so all subscribers observe the same global event order — the
/// single-callback-context guarantee without a dedicated thread.
/// Subscriptions detach on drop and a detached subscriber is never
/// delivered another event.
pub struct EventBus<E> {
    inner: Arc<Mutex<BusInner<E>>>,
}

impl<E> Clone for EventBus<E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<E: Clone + Subject> EventBus<E> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(BusInner {
                next_id: 0,
                subscribers: HashMap::new(),
                detach_hook: None,
            })),
        }
    }

    /// Subscribe to every event on this bus
    pub fn subscribe(&self) -> Subscription<E> {
        self.subscribe_to(None)
    }

    /// Subscribe to events about one podcast identity only
    pub fn subscribe_to(&self, filter: Option<Url>) -> Subscription<E> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock().expect("event bus poisoned");
        let id = inner.next_id;
        inner.next_id += 1;
        inner.subscribers.insert(
            id,
            Slot {
                tx,
                filter: filter.clone(),
            },
        );

        Subscription {
            id,
            filter,
            rx,
            bus: Arc::downgrade(&self.inner),
        }
    }

    /// Install a hook invoked with the subscription's filter whenever a
    /// subscriber detaches. The loader uses this for best-effort load
    /// cancellation.
    pub fn set_detach_hook(&self, hook: impl Fn(Option<&Url>) + Send + Sync + 'static) {
        let mut inner = self.inner.lock().expect("event bus poisoned");
        inner.detach_hook = Some(Arc::new(hook));
    }

    /// Deliver an event to every subscriber whose filter matches
    pub fn emit(&self, event: E) {
        let inner = self.inner.lock().expect("event bus poisoned");
        for slot in inner.subscribers.values() {
            let interested = slot
                .filter
                .as_ref()
                .is_none_or(|filter| filter == event.subject());
            if interested {
                let _ = slot.tx.send(event.clone());
            }
        }
    }

    /// Whether any live subscriber would receive events about `subject`
    pub fn has_interest(&self, subject: &Url) -> bool {
        let inner = self.inner.lock().expect("event bus poisoned");
        inner
            .subscribers
            .values()
            .any(|slot| slot.filter.as_ref().is_none_or(|filter| filter == subject))
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().expect("event bus poisoned").subscribers.len()
    }
}

impl<E: Clone + Subject> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle to a registered listener. Dropping it unsubscribes.
pub struct Subscription<E> {
    id: u64,
    filter: Option<Url>,
    rx: mpsc::UnboundedReceiver<E>,
    bus: Weak<Mutex<BusInner<E>>>,
}

impl<E> Subscription<E> {
    /// Receive the next event, `None` once the bus is gone
    pub async fn recv(&mut self) -> Option<E> {
        self.rx.recv().await
    }

    /// Non-blocking receive, for polling callers
    pub fn try_recv(&mut self) -> Option<E> {
        self.rx.try_recv().ok()
    }
}

impl<E> Drop for Subscription<E> {
    fn drop(&mut self) {
        let Some(bus) = self.bus.upgrade() else {
            return;
        };
        let hook = {
            let mut inner = bus.lock().expect("event bus poisoned");
            inner.subscribers.remove(&self.id);
            inner.detach_hook.clone()
        };
        if let Some(hook) = hook {
            hook(self.filter.as_ref());
        }
    }
}
