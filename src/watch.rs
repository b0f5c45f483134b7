//! Long-lived list-then-watch loops over arbitrary kinds.
//!
//! The stream first lists the collection (synthesizing `ADDED` events for
//! every item in server order), then follows the watch endpoint from the
//! list's resource version. Disconnects resume from the last observed
//! version; an HTTP 410 Gone restarts from a fresh list, so callers never
//! see duplicates unless the server replays.
use std::collections::VecDeque;
use std::pin::Pin;

use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    api::{ApiObject, ListParams, ObjectList},
    discovery::ObjectClass,
    error::ErrorResponse,
    Client, Error, Result,
};

/// A raw event returned from a watch query.
#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(tag = "type", content = "object", rename_all = "UPPERCASE")]
pub enum WatchEvent<K> {
    /// A resource was added
    Added(K),
    /// A resource was modified
    Modified(K),
    /// A resource was deleted
    Deleted(K),
    /// The server sent a resource-version checkpoint
    Bookmark(K),
    /// The server returned an in-band error
    Error(ErrorResponse),
}

/// The phase of an emitted `(phase, object)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchPhase {
    /// Present in the initial list, or newly created
    Added,
    /// Changed since last seen
    Modified,
    /// Removed from the collection
    Deleted,
    /// Resource-version checkpoint, no object change
    Bookmark,
}

const GONE: u16 = 410;

type EventStream = Pin<Box<dyn Stream<Item = Result<WatchEvent<Value>>> + Send>>;

struct Watcher {
    client: Client,
    class: ObjectClass,
    namespace: Option<String>,
    params: ListParams,
}

enum Step {
    Start { since: Option<String> },
    InitialEvents {
        queue: VecDeque<Value>,
        resource_version: String,
    },
    Watching {
        resource_version: String,
        events: EventStream,
    },
}

impl Watcher {
    fn wrap(&self, value: Value) -> ApiObject {
        ApiObject::new(self.class.clone(), value).with_client(self.client.clone())
    }

    async fn list(&self) -> Result<Step> {
        let req = self
            .class
            .list_request(self.namespace.as_deref(), &self.params)?;
        let list: ObjectList = self.client.request(req).await?;
        Ok(Step::InitialEvents {
            queue: list.items.into(),
            resource_version: list
                .metadata
                .resource_version
                .unwrap_or_else(|| "0".into()),
        })
    }

    async fn start_watch(&self, resource_version: String) -> Result<Step> {
        let req = self.class.watch_request(
            self.namespace.as_deref(),
            &self.params,
            &resource_version,
        )?;
        let events = self.client.request_events::<Value>(req).await?;
        Ok(Step::Watching {
            resource_version,
            events: Box::pin(events),
        })
    }
}

/// Watch a collection, yielding ordered `(phase, object)` pairs forever.
///
/// Within one connection server ordering is preserved; across reconnects the
/// stream resumes at the last delivered resource version.
pub(crate) fn watch_objects(
    client: Client,
    class: ObjectClass,
    namespace: Option<String>,
    params: ListParams,
    since: Option<String>,
) -> impl Stream<Item = Result<(WatchPhase, ApiObject)>> + Send {
    let watcher = Watcher {
        client,
        class,
        namespace,
        params,
    };
    futures::stream::try_unfold(
        (watcher, Step::Start { since }),
        |(watcher, mut step)| async move {
            loop {
                match step {
                    Step::Start { since } => {
                        step = match since {
                            None => watcher.list().await?,
                            Some(rv) => watcher.start_watch(rv).await?,
                        };
                    }
                    Step::InitialEvents {
                        mut queue,
                        resource_version,
                    } => match queue.pop_front() {
                        Some(item) => {
                            let obj = watcher.wrap(item);
                            return Ok(Some((
                                (WatchPhase::Added, obj),
                                (
                                    watcher,
                                    Step::InitialEvents {
                                        queue,
                                        resource_version,
                                    },
                                ),
                            )));
                        }
                        None => {
                            step = watcher.start_watch(resource_version).await?;
                        }
                    },
                    Step::Watching {
                        mut resource_version,
                        mut events,
                    } => match events.next().await {
                        Some(Ok(WatchEvent::Error(er))) if er.code == GONE => {
                            tracing::debug!("watch expired ({}), relisting", er.message);
                            step = Step::Start { since: None };
                        }
                        Some(Ok(WatchEvent::Error(er))) => return Err(Error::Api(er)),
                        Some(Ok(event)) => {
                            let (phase, value) = match event {
                                WatchEvent::Added(v) => (WatchPhase::Added, v),
                                WatchEvent::Modified(v) => (WatchPhase::Modified, v),
                                WatchEvent::Deleted(v) => (WatchPhase::Deleted, v),
                                WatchEvent::Bookmark(v) => (WatchPhase::Bookmark, v),
                                WatchEvent::Error(_) => unreachable!("handled above"),
                            };
                            if let Some(rv) = value
                                .pointer("/metadata/resourceVersion")
                                .and_then(Value::as_str)
                            {
                                resource_version = rv.to_string();
                            }
                            let obj = watcher.wrap(value);
                            return Ok(Some((
                                (phase, obj),
                                (
                                    watcher,
                                    Step::Watching {
                                        resource_version,
                                        events,
                                    },
                                ),
                            )));
                        }
                        Some(Err(e)) => {
                            // A dropped connection is a disconnect, not a
                            // cancellation; resume where we left off.
                            tracing::warn!(
                                "watch stream failed ({}), resuming from {}",
                                e,
                                resource_version
                            );
                            step = watcher.start_watch(resource_version).await?;
                        }
                        None => {
                            // Server closed the poll; resume where we left off.
                            tracing::trace!(
                                "watch poll ended, resuming from {}",
                                resource_version
                            );
                            step = watcher.start_watch(resource_version).await?;
                        }
                    },
                }
            }
        },
    )
}

impl Client {
    /// Watch resources by kind reference.
    ///
    /// Without `since` the stream begins with a synthetic `ADDED` event per
    /// currently listed object; with `since` it follows changes after that
    /// resource version only.
    pub async fn watch(
        &self,
        kind: &str,
        namespace: Option<&str>,
        lp: &ListParams,
        since: Option<String>,
    ) -> Result<impl Stream<Item = Result<(WatchPhase, ApiObject)>>> {
        let class = self.resolve_class(kind, true).await?;
        let namespace = match namespace {
            Some(ns) => Some(ns.to_string()),
            None if class.namespaced => Some(self.namespace()),
            None => None,
        };
        Ok(watch_objects(
            self.clone(),
            class,
            namespace,
            lp.clone(),
            since,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn watch_events_deserialize() {
        let line = r#"{"type":"ADDED","object":{"metadata":{"name":"p","resourceVersion":"5"}}}"#;
        match serde_json::from_str::<WatchEvent<Value>>(line).unwrap() {
            WatchEvent::Added(obj) => {
                assert_eq!(obj["metadata"]["resourceVersion"], "5");
            }
            other => panic!("unexpected event {:?}", other),
        }

        let line = r#"{"type":"ERROR","object":{"kind":"Status","status":"Failure","message":"too old","reason":"Expired","code":410}}"#;
        match serde_json::from_str::<WatchEvent<Value>>(line).unwrap() {
            WatchEvent::Error(er) => assert_eq!(er.code, 410),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn watch_events_serialize_roundtrip() {
        let event = WatchEvent::Modified(serde_json::json!({"metadata": {"name": "x"}}));
        let line = serde_json::to_string(&event).unwrap();
        assert!(line.contains(r#""type":"MODIFIED""#));
        match serde_json::from_str::<WatchEvent<Value>>(&line).unwrap() {
            WatchEvent::Modified(obj) => assert_eq!(obj["metadata"]["name"], "x"),
            other => panic!("unexpected event {:?}", other),
        }
    }
}
