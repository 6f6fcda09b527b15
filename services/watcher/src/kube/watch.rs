//! Watch streams over `kube::runtime::watcher`.
//!
//! The watcher lists, then watches, and relists from scratch whenever the
//! watch falls too far behind. A relist only reports what still exists, so
//! `ObjectTracker` remembers every live object and reports the ones missing
//! from a finished relist as deleted.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Debug;

use bridge_events::{Instance, WatchEvent, WorkloadGroup};
use futures_util::{future, stream, StreamExt};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Resource};
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::cluster::EventStream;

/// Objects the tracker can tell apart within one namespace.
pub trait Tracked: Clone {
    fn tracking_key(&self) -> &str;
}

impl Tracked for Instance {
    fn tracking_key(&self) -> &str {
        &self.name
    }
}

impl Tracked for WorkloadGroup {
    fn tracking_key(&self) -> &str {
        &self.name
    }
}

/// Turns raw watcher events into `WatchEvent`s.
#[derive(Debug)]
pub struct ObjectTracker<T> {
    known: BTreeMap<String, T>,
    /// Keys seen since the current relist started.
    relisting: Option<BTreeSet<String>>,
}

impl<T> Default for ObjectTracker<T> {
    fn default() -> Self {
        Self {
            known: BTreeMap::new(),
            relisting: None,
        }
    }
}

impl<T: Tracked> ObjectTracker<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, event: watcher::Event<T>) -> Vec<WatchEvent<T>> {
        match event {
            watcher::Event::Apply(object) => vec![self.upsert(object)],
            watcher::Event::Delete(object) => {
                self.known.remove(object.tracking_key());
                vec![WatchEvent::Deleted(object)]
            }
            watcher::Event::Init => {
                self.relisting = Some(BTreeSet::new());
                Vec::new()
            }
            watcher::Event::InitApply(object) => {
                if let Some(seen) = &mut self.relisting {
                    seen.insert(object.tracking_key().to_string());
                }
                vec![self.upsert(object)]
            }
            watcher::Event::InitDone => {
                let Some(seen) = self.relisting.take() else {
                    return Vec::new();
                };
                let gone: Vec<String> = self
                    .known
                    .keys()
                    .filter(|key| !seen.contains(*key))
                    .cloned()
                    .collect();

                gone.iter()
                    .filter_map(|key| self.known.remove(key))
                    .map(WatchEvent::Deleted)
                    .collect()
            }
        }
    }

    /// Number of live objects.
    pub fn len(&self) -> usize {
        self.known.len()
    }

    fn upsert(&mut self, object: T) -> WatchEvent<T> {
        match self
            .known
            .insert(object.tracking_key().to_string(), object.clone())
        {
            Some(_) => WatchEvent::Modified(object),
            None => WatchEvent::Added(object),
        }
    }
}

fn translate<K, T>(event: watcher::Event<K>, convert: fn(K) -> T) -> watcher::Event<T> {
    match event {
        watcher::Event::Apply(object) => watcher::Event::Apply(convert(object)),
        watcher::Event::Delete(object) => watcher::Event::Delete(convert(object)),
        watcher::Event::Init => watcher::Event::Init,
        watcher::Event::InitApply(object) => watcher::Event::InitApply(convert(object)),
        watcher::Event::InitDone => watcher::Event::InitDone,
    }
}

/// Watch every object `api` covers, converted with `convert`.
///
/// Failed requests are logged and retried with the watcher's backoff; the
/// stream itself never ends.
pub fn watch_objects<K, T>(
    api: Api<K>,
    resource: &'static str,
    convert: fn(K) -> T,
) -> EventStream<T>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + 'static,
    T: Tracked + Send + 'static,
{
    let mut tracker = ObjectTracker::new();

    let events = watcher(api, watcher::Config::default())
        .default_backoff()
        .filter_map(move |result| {
            future::ready(match result {
                Ok(event) => Some(event),
                Err(e) => {
                    warn!(resource, error = %e, "Watch request failed; retrying");
                    None
                }
            })
        })
        .flat_map(move |event| {
            let relisted = matches!(event, watcher::Event::InitDone);
            let events = tracker.apply(translate(event, convert));
            if relisted {
                debug!(resource, live = tracker.len(), gone = events.len(), "Relist complete");
            }
            stream::iter(events)
        });

    Box::pin(events)
}
