//! Log Repository
//!
//! Per-execution ring of log entries with live fan-out to followers.

use chrono::{DateTime, Utc};
use futures::Stream;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};
use tokio::sync::broadcast;
use tracing::warn;

use keel_core::domain::log::LogEntry;

const LIVE_CAPACITY: usize = 256;

struct OwnerLog {
    entries: VecDeque<LogEntry>,
    /// `None` once the owner is finished; followers then only get history
    live: Option<broadcast::Sender<LogEntry>>,
}

impl OwnerLog {
    fn new() -> Self {
        Self {
            entries: VecDeque::new(),
            live: Some(broadcast::channel(LIVE_CAPACITY).0),
        }
    }
}

pub struct LogStore {
    retention: usize,
    owners: Mutex<HashMap<String, OwnerLog>>,
}

impl LogStore {
    /// Keeps at most `retention` entries per owner, dropping the oldest
    pub fn new(retention: usize) -> Self {
        Self {
            retention: retention.max(1),
            owners: Mutex::new(HashMap::new()),
        }
    }

    pub fn append(&self, owner: &str, entries: Vec<LogEntry>) {
        if entries.is_empty() {
            return;
        }

        let mut owners = self.owners.lock().unwrap_or_else(PoisonError::into_inner);
        let log = owners
            .entry(owner.to_string())
            .or_insert_with(OwnerLog::new);

        for entry in entries {
            if let Some(live) = &log.live {
                // no followers is fine
                let _ = live.send(entry.clone());
            }
            log.entries.push_back(entry);
            if log.entries.len() > self.retention {
                log.entries.pop_front();
            }
        }
    }

    /// Entries strictly after `since`, or all of them
    pub fn query_since(&self, owner: &str, since: Option<DateTime<Utc>>) -> Vec<LogEntry> {
        let owners = self.owners.lock().unwrap_or_else(PoisonError::into_inner);
        owners
            .get(owner)
            .map(|log| filter_since(&log.entries, since))
            .unwrap_or_default()
    }

    /// Replays history after `since`, then (with `follow`) forwards new
    /// entries until the owner is finished or the consumer goes away
    pub fn stream_since(
        &self,
        owner: &str,
        since: Option<DateTime<Utc>>,
        follow: bool,
    ) -> impl Stream<Item = LogEntry> + Send + 'static {
        let (history, live) = {
            let mut owners = self.owners.lock().unwrap_or_else(PoisonError::into_inner);
            let log = owners
                .entry(owner.to_string())
                .or_insert_with(OwnerLog::new);
            let live = if follow {
                log.live.as_ref().map(|tx| tx.subscribe())
            } else {
                None
            };
            (filter_since(&log.entries, since), live)
        };
        let owner = owner.to_string();

        async_stream::stream! {
            for entry in history {
                yield entry;
            }

            let Some(mut rx) = live else {
                return;
            };
            loop {
                match rx.recv().await {
                    Ok(entry) => yield entry,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(owner = %owner, skipped = n, "log follower lagged, entries dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }

    /// Ends all follow streams of `owner`; history stays queryable
    pub fn finish(&self, owner: &str) {
        let mut owners = self.owners.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(log) = owners.get_mut(owner) {
            log.live = None;
        }
    }
}

fn filter_since(entries: &VecDeque<LogEntry>, since: Option<DateTime<Utc>>) -> Vec<LogEntry> {
    entries
        .iter()
        .filter(|e| since.is_none_or(|since| e.timestamp > since))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use futures::StreamExt;
    use keel_core::domain::log::LogSource;

    fn entry(content: &str, at: DateTime<Utc>) -> LogEntry {
        LogEntry {
            source: LogSource::Stdout,
            content: content.to_string(),
            timestamp: at,
        }
    }

    #[test]
    fn test_retention_drops_oldest() {
        let store = LogStore::new(2);
        let now = Utc::now();
        store.append(
            "exec-1",
            vec![entry("a", now), entry("b", now), entry("c", now)],
        );

        let contents: Vec<_> = store
            .query_since("exec-1", None)
            .into_iter()
            .map(|e| e.content)
            .collect();
        assert_eq!(contents, vec!["b", "c"]);
    }

    #[test]
    fn test_query_since_is_strict() {
        let store = LogStore::new(10);
        let t0 = Utc::now();
        store.append(
            "exec-1",
            vec![entry("a", t0), entry("b", t0 + Duration::seconds(1))],
        );

        let after = store.query_since("exec-1", Some(t0));
        assert_eq!(after.len(), 1);
        assert_eq!(after[0].content, "b");
        assert!(store.query_since("other", None).is_empty());
    }

    #[tokio::test]
    async fn test_stream_history_then_live() {
        let store = LogStore::new(10);
        let now = Utc::now();
        store.append("exec-1", vec![entry("old", now)]);

        let mut stream = Box::pin(store.stream_since("exec-1", None, true));
        assert_eq!(stream.next().await.unwrap().content, "old");

        store.append("exec-1", vec![entry("new", now)]);
        assert_eq!(stream.next().await.unwrap().content, "new");

        store.finish("exec-1");
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_stream_without_follow_ends_after_history() {
        let store = LogStore::new(10);
        store.append("exec-1", vec![entry("only", Utc::now())]);

        let entries: Vec<_> = store.stream_since("exec-1", None, false).collect().await;
        assert_eq!(entries.len(), 1);
    }
}
