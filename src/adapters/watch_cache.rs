//! Watch-backed local cache and event delivery

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::{Stream, StreamExt};
use kube::runtime::reflector::{self, ObjectRef, Store};
use kube::runtime::watcher::{self, watcher, Event};
use kube::runtime::WatchStreamExt;
use kube::{Api, Resource};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::ClusterResource;
use crate::error::{Error, Result};

/// Read path of a watch cache. Reads never reach the API server.
pub trait ObjectCache<K>: Send + Sync {
    /// Cached object with the given identity
    fn get(&self, namespace: &str, name: &str) -> Option<Arc<K>>;

    /// Whether the initial list has been fully delivered
    fn has_synced(&self) -> bool;
}

/// A change delivered by an [`Informer`]
#[derive(Debug)]
pub enum Notification<'a, K> {
    /// Object was added or modified
    Applied(&'a K),
    /// Object was deleted
    Deleted(&'a K),
}

impl<'a, K> Notification<'a, K> {
    pub fn object(&self) -> &'a K {
        match self {
            Notification::Applied(obj) | Notification::Deleted(obj) => obj,
        }
    }
}

/// Reflector store shared between an [`Informer`] and its readers
pub struct WatchCache<K: Resource<DynamicType = ()> + 'static> {
    store: Store<K>,
    synced: Arc<AtomicBool>,
}

impl<K: Resource<DynamicType = ()> + Clone + 'static> Clone for WatchCache<K> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            synced: self.synced.clone(),
        }
    }
}

impl<K: ClusterResource> WatchCache<K> {
    /// Empty cache and the writer that fills it
    pub(crate) fn new() -> (Self, reflector::store::Writer<K>) {
        let (store, writer) = reflector::store();
        let cache = Self {
            store,
            synced: Arc::new(AtomicBool::new(false)),
        };
        (cache, writer)
    }

    /// Hand every reflected event of `events` to `handler` until `shutdown`
    /// fires or the stream ends.
    ///
    /// `events` must already be reflected into this cache. Objects of a
    /// (re)list are only swapped into the store on `InitDone`, so they are
    /// delivered then, followed by a deletion for every object the relist no
    /// longer contains. A handler therefore always reads state at least as
    /// new as the notification it got.
    pub async fn dispatch<St, H>(&self, events: St, shutdown: CancellationToken, mut handler: H)
    where
        St: Stream<Item = watcher::Result<Event<K>>>,
        H: FnMut(Notification<'_, K>),
    {
        let kind = K::kind(&()).to_string();
        futures::pin_mut!(events);
        // Objects before the relist started, and the relisted objects so far
        let mut relist: Option<(Vec<Arc<K>>, Vec<K>)> = None;

        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => break,
                event = events.next() => event,
            };

            match event {
                Some(Ok(Event::Apply(obj))) => handler(Notification::Applied(&obj)),
                Some(Ok(Event::Delete(obj))) => handler(Notification::Deleted(&obj)),
                Some(Ok(Event::Init)) => {
                    debug!(kind = %kind, "Watch (re)listing");
                    relist = Some((self.store.state(), Vec::new()));
                }
                Some(Ok(Event::InitApply(obj))) => match relist.as_mut() {
                    Some((_, listed)) => listed.push(obj),
                    None => handler(Notification::Applied(&obj)),
                },
                Some(Ok(Event::InitDone)) => {
                    if !self.synced.swap(true, Ordering::AcqRel) {
                        info!(kind = %kind, "Watch cache synced");
                    }
                    let Some((previous, listed)) = relist.take() else {
                        continue;
                    };
                    let present: HashSet<ObjectRef<K>> =
                        listed.iter().map(ObjectRef::from_obj).collect();
                    for obj in &listed {
                        handler(Notification::Applied(obj));
                    }
                    for obj in &previous {
                        if !present.contains(&ObjectRef::from_obj(obj.as_ref())) {
                            handler(Notification::Deleted(obj.as_ref()));
                        }
                    }
                }
                Some(Err(e)) => {
                    warn!(kind = %kind, error = %e, "Watch error, backing off");
                }
                None => break,
            }
        }

        info!(kind = %kind, "Watch stopped");
    }

    /// Wait until the initial list has been applied to the store
    pub async fn wait_for_sync(&self) -> Result<()> {
        self.store
            .wait_until_ready()
            .await
            .map_err(|_| Error::CacheSync(format!("{} watch stopped before syncing", K::kind(&()))))
    }
}

impl<K: ClusterResource> ObjectCache<K> for WatchCache<K> {
    fn get(&self, namespace: &str, name: &str) -> Option<Arc<K>> {
        self.store.get(&ObjectRef::new(name).within(namespace))
    }

    fn has_synced(&self) -> bool {
        self.synced.load(Ordering::Acquire)
    }
}

/// Watches one resource type, keeps a [`WatchCache`] up to date and hands
/// every change to an event handler.
pub struct Informer<K: ClusterResource> {
    api: Api<K>,
    config: watcher::Config,
    writer: reflector::store::Writer<K>,
    cache: WatchCache<K>,
}

impl<K: ClusterResource> Informer<K> {
    pub fn new(api: Api<K>, config: watcher::Config) -> Self {
        let (cache, writer) = WatchCache::new();
        Self {
            api,
            config,
            writer,
            cache,
        }
    }

    /// Read handle onto the informer's store
    pub fn cache(&self) -> WatchCache<K> {
        self.cache.clone()
    }

    /// Drive the watch until `shutdown` fires.
    ///
    /// `handler` runs on the watch task for every add, update and delete and
    /// must not block; it is expected to do nothing more than enqueue a key.
    /// Watch errors are retried with the default backoff.
    pub async fn run<H>(self, shutdown: CancellationToken, handler: H)
    where
        H: FnMut(Notification<'_, K>) + Send,
    {
        info!(kind = %K::kind(&()), "Starting watch");
        let events = watcher(self.api, self.config)
            .default_backoff()
            .reflect(self.writer);
        self.cache.dispatch(events, shutdown, handler).await;
    }
}
