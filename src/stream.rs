//! Sequenced publish/subscribe of tracker state.
//!
//! Two kinds of topics exist: `trackers`, carrying a snapshot of the most
//! recently touched trackers, and `query-result:<job_id>`, carrying the
//! outcome of the job's latest run. Each topic owns a sequence counter that
//! is bumped under the channel's write lock, so every subscriber sees
//! strictly increasing sequence numbers. A slow subscriber may skip
//! intermediate messages, but only ever lands on the latest one.
//!
//! Sequence numbers are wall-clock milliseconds, bumped by one when two
//! messages land in the same millisecond. A cursor handed out before a
//! restart therefore stays below everything published after it.

use crate::db::models::{Tracker, TrackerStatus, TrackerWithJob};
use crate::export::{ExportFormat, ExportWriter};
use crate::query::ResultRow;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tracing::debug;

const QUERY_RESULT_PREFIX: &str = "query-result:";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    Trackers,
    QueryResult(i32),
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Topic::Trackers => f.write_str("trackers"),
            Topic::QueryResult(job_id) => write!(f, "{}{}", QUERY_RESULT_PREFIX, job_id),
        }
    }
}

impl FromStr for Topic {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "trackers" {
            return Ok(Topic::Trackers);
        }
        s.strip_prefix(QUERY_RESULT_PREFIX)
            .and_then(|id| id.parse().ok())
            .map(Topic::QueryResult)
            .ok_or_else(|| format!("unknown topic: {}", s))
    }
}

/// Client-facing view of one tracker.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackerView {
    pub id: i64,
    pub job_id: i32,
    pub job_name: String,
    pub database: String,
    pub scheduled_on: Option<DateTime<Utc>>,
    pub triggered_by: String,
    pub ran_on: Option<DateTime<Utc>>,
    pub duration_ms: i64,
    pub status: String,
    pub row_count: Option<i64>,
    pub header: Vec<String>,
    pub error_message: Option<String>,
    #[serde(rename = "error_ext")]
    pub error_ext: Vec<String>,
    pub csv_url: Option<String>,
    pub xlsx_url: Option<String>,
}

impl TrackerView {
    pub fn new(tracker: &Tracker, job_name: &str, database: &str, exports: &ExportWriter) -> Self {
        // Artifacts are only downloadable while the result is valid.
        let downloadable = tracker.is_success();
        TrackerView {
            id: tracker.id,
            job_id: tracker.job_id,
            job_name: job_name.to_string(),
            database: database.to_string(),
            scheduled_on: tracker.scheduled_on,
            triggered_by: tracker.triggered_by.clone(),
            ran_on: tracker.ran_on,
            duration_ms: tracker.duration_ms,
            status: tracker.status.clone(),
            row_count: tracker.row_count,
            header: tracker.header_names(),
            error_message: tracker.error_message.clone(),
            error_ext: tracker.error_lines(),
            csv_url: tracker
                .csv_path
                .as_ref()
                .filter(|_| downloadable)
                .map(|_| exports.url_for(tracker.id, ExportFormat::Csv)),
            xlsx_url: tracker
                .xlsx_path
                .as_ref()
                .filter(|_| downloadable)
                .map(|_| exports.url_for(tracker.id, ExportFormat::Xlsx)),
        }
    }

    pub fn from_joined(row: &TrackerWithJob, exports: &ExportWriter) -> Self {
        Self::new(&row.tracker, &row.job_name, &row.database_name, exports)
    }

    fn is_active(&self) -> bool {
        self.status
            .parse::<TrackerStatus>()
            .map(|status| !status.is_final())
            .unwrap_or(false)
    }
}

/// One tracker with the stored preview rows of its result.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackerDetail {
    #[serde(flatten)]
    pub view: TrackerView,
    pub rows_preview: Vec<ResultRow>,
}

impl TrackerDetail {
    pub fn from_joined(row: &TrackerWithJob, exports: &ExportWriter) -> Self {
        let rows_preview = row
            .tracker
            .rows_preview
            .as_ref()
            .and_then(|v| v.as_array())
            .map(|rows| rows.iter().filter_map(|r| r.as_object().cloned()).collect())
            .unwrap_or_default();

        TrackerDetail {
            view: TrackerView::from_joined(row, exports),
            rows_preview,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrackersMessage {
    pub seq: u64,
    pub trackers: Vec<TrackerView>,
}

/// Outcome of one run: status 0 on success, negative on failure.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResultMessage {
    pub seq: u64,
    pub status: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tracker_id: Option<i64>,
    pub header: Vec<String>,
    pub data: Vec<ResultRow>,
    pub error: Option<String>,
    #[serde(rename = "error_ext")]
    pub error_ext: Vec<String>,
}

impl QueryResultMessage {
    pub fn success(tracker_id: Option<i64>, header: Vec<String>, data: Vec<ResultRow>) -> Self {
        QueryResultMessage {
            seq: 0,
            status: 0,
            tracker_id,
            header,
            data,
            error: None,
            error_ext: Vec::new(),
        }
    }

    pub fn failure(tracker_id: Option<i64>, error: String, error_ext: Vec<String>) -> Self {
        QueryResultMessage {
            seq: 0,
            status: -1,
            tracker_id,
            header: Vec::new(),
            data: Vec::new(),
            error: Some(error),
            error_ext,
        }
    }
}

/// A message on any topic.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum TopicMessage {
    Trackers(Arc<TrackersMessage>),
    QueryResult(Arc<QueryResultMessage>),
}

impl TopicMessage {
    pub fn seq(&self) -> u64 {
        match self {
            TopicMessage::Trackers(m) => m.seq,
            TopicMessage::QueryResult(m) => m.seq,
        }
    }
}

pub trait Sequenced {
    fn seq(&self) -> u64;
}

impl Sequenced for TrackersMessage {
    fn seq(&self) -> u64 {
        self.seq
    }
}

impl Sequenced for QueryResultMessage {
    fn seq(&self) -> u64 {
        self.seq
    }
}

struct TopicChannel<M> {
    seq: AtomicU64,
    tx: watch::Sender<Option<Arc<M>>>,
}

impl<M: Sequenced> TopicChannel<M> {
    fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self {
            seq: AtomicU64::new(0),
            tx,
        }
    }

    /// Assigns the next sequence number and replaces the latest message.
    fn publish(&self, build: impl FnOnce(u64) -> M) -> u64 {
        let mut assigned = 0;
        self.tx.send_modify(|slot| {
            let now = u64::try_from(Utc::now().timestamp_millis()).unwrap_or_default();
            assigned = now.max(self.seq.load(Ordering::SeqCst) + 1);
            self.seq.store(assigned, Ordering::SeqCst);
            *slot = Some(Arc::new(build(assigned)));
        });
        assigned
    }

    fn latest(&self) -> Option<Arc<M>> {
        self.tx.borrow().clone()
    }

    /// A cursor ahead of this topic's counter came from an earlier process
    /// or a forged header, and gets the current message.
    fn subscribe(&self, after_seq: u64) -> Subscription<M> {
        let current = self.seq.load(Ordering::SeqCst);
        Subscription {
            rx: self.tx.subscribe(),
            last_seq: if after_seq > current { 0 } else { after_seq },
        }
    }
}

/// A subscriber's cursor on one topic.
pub struct Subscription<M> {
    rx: watch::Receiver<Option<Arc<M>>>,
    last_seq: u64,
}

impl<M: Sequenced> Subscription<M> {
    /// Waits for a message newer than the last one returned. The current
    /// message is returned first. `None` once the topic is closed.
    pub async fn next(&mut self) -> Option<Arc<M>> {
        loop {
            let current = self.rx.borrow_and_update().clone();
            if let Some(message) = current {
                if message.seq() > self.last_seq {
                    self.last_seq = message.seq();
                    return Some(message);
                }
            }
            if self.rx.changed().await.is_err() {
                return None;
            }
        }
    }
}

pub enum TopicSubscription {
    Trackers(Subscription<TrackersMessage>),
    QueryResult(Subscription<QueryResultMessage>),
}

impl TopicSubscription {
    pub async fn next(&mut self) -> Option<TopicMessage> {
        match self {
            TopicSubscription::Trackers(sub) => sub.next().await.map(TopicMessage::Trackers),
            TopicSubscription::QueryResult(sub) => {
                sub.next().await.map(TopicMessage::QueryResult)
            }
        }
    }
}

/// Trackers in the snapshot, stamped with a logical clock on every touch.
#[derive(Default)]
struct Snapshot {
    clock: u64,
    entries: HashMap<i64, (u64, TrackerView)>,
}

impl Snapshot {
    fn touch(&mut self, view: TrackerView) {
        self.clock += 1;
        self.entries.insert(view.id, (self.clock, view));
    }

    /// Shrinks to `size`. Finished trackers go before active ones, least
    /// recently touched first. `keep` is never evicted.
    fn evict_to(&mut self, size: usize, keep: Option<i64>) {
        while self.entries.len() > size {
            let victim = self
                .entries
                .iter()
                .filter(|(id, _)| Some(**id) != keep)
                .min_by_key(|(_, (touched, view))| (view.is_active(), *touched))
                .map(|(id, _)| *id);
            match victim {
                Some(id) => {
                    self.entries.remove(&id);
                }
                None => break,
            }
        }
    }

    fn newest_first(&self) -> Vec<TrackerView> {
        let mut views: Vec<TrackerView> =
            self.entries.values().map(|(_, view)| view.clone()).collect();
        views.sort_by(|a, b| b.id.cmp(&a.id));
        views
    }
}

struct Inner {
    snapshot_size: usize,
    trackers: Mutex<Snapshot>,
    trackers_topic: TopicChannel<TrackersMessage>,
    query_topics: Mutex<HashMap<i32, Arc<TopicChannel<QueryResultMessage>>>>,
}

#[derive(Clone)]
pub struct TrackerStream {
    inner: Arc<Inner>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl TrackerStream {
    pub fn new(snapshot_size: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                snapshot_size: snapshot_size.max(1),
                trackers: Mutex::new(Snapshot::default()),
                trackers_topic: TopicChannel::new(),
                query_topics: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Replaces the snapshot with `views` (newest first), e.g. at startup.
    pub fn seed(&self, views: Vec<TrackerView>) {
        let mut trackers = lock(&self.inner.trackers);
        *trackers = Snapshot::default();
        for view in views.into_iter().rev() {
            trackers.touch(view);
        }
        self.publish_snapshot(&mut trackers, None);
    }

    /// Records a tracker state change and publishes a fresh snapshot. The
    /// touched tracker is always part of it.
    pub fn publish_tracker(&self, view: TrackerView) -> u64 {
        let mut trackers = lock(&self.inner.trackers);
        let tracker_id = view.id;
        trackers.touch(view);
        let seq = self.publish_snapshot(&mut trackers, Some(tracker_id));
        debug!(tracker_id = tracker_id, seq = seq, "Published trackers snapshot");
        seq
    }

    /// Replaces trackers already in the snapshot without changing their
    /// recency, e.g. after an expiry sweep. Publishes only if one was present.
    pub fn refresh_trackers(&self, views: Vec<TrackerView>) -> Option<u64> {
        let mut trackers = lock(&self.inner.trackers);
        let mut refreshed = 0;
        for view in views {
            if let Some(entry) = trackers.entries.get_mut(&view.id) {
                entry.1 = view;
                refreshed += 1;
            }
        }
        if refreshed == 0 {
            return None;
        }
        let seq = self.publish_snapshot(&mut trackers, None);
        debug!(trackers = refreshed, seq = seq, "Published refreshed trackers snapshot");
        Some(seq)
    }

    fn publish_snapshot(&self, trackers: &mut Snapshot, keep: Option<i64>) -> u64 {
        trackers.evict_to(self.inner.snapshot_size, keep);
        let newest_first = trackers.newest_first();
        self.inner
            .trackers_topic
            .publish(|seq| TrackersMessage {
                seq,
                trackers: newest_first,
            })
    }

    pub fn publish_query_result(&self, job_id: i32, message: QueryResultMessage) -> u64 {
        let topic = self.query_topic(job_id);
        let seq = topic.publish(|seq| QueryResultMessage { seq, ..message });
        debug!(job_id = job_id, seq = seq, "Published query result");
        seq
    }

    fn query_topic(&self, job_id: i32) -> Arc<TopicChannel<QueryResultMessage>> {
        lock(&self.inner.query_topics)
            .entry(job_id)
            .or_insert_with(|| Arc::new(TopicChannel::new()))
            .clone()
    }

    /// Closes a job's query-result topic. Open subscriptions end.
    pub fn close_job(&self, job_id: i32) {
        lock(&self.inner.query_topics).remove(&job_id);
    }

    pub fn trackers_snapshot(&self) -> Arc<TrackersMessage> {
        self.inner
            .trackers_topic
            .latest()
            .unwrap_or_else(|| {
                Arc::new(TrackersMessage {
                    seq: 0,
                    trackers: Vec::new(),
                })
            })
    }

    pub fn latest_query_result(&self, job_id: i32) -> Option<Arc<QueryResultMessage>> {
        lock(&self.inner.query_topics)
            .get(&job_id)
            .and_then(|topic| topic.latest())
    }

    /// Subscribes to `topic`, skipping messages with `seq <= after_seq`.
    pub fn subscribe(&self, topic: Topic, after_seq: u64) -> TopicSubscription {
        match topic {
            Topic::Trackers => {
                TopicSubscription::Trackers(self.inner.trackers_topic.subscribe(after_seq))
            }
            Topic::QueryResult(job_id) => {
                TopicSubscription::QueryResult(self.query_topic(job_id).subscribe(after_seq))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::local::ExportsConfig;
    use crate::db::models::fixtures;
    use std::time::Duration;

    fn view(id: i64, status: &str) -> TrackerView {
        TrackerView {
            id,
            job_id: 1,
            job_name: "daily-report".to_string(),
            database: "sales".to_string(),
            scheduled_on: None,
            triggered_by: "schedule".to_string(),
            ran_on: None,
            duration_ms: 0,
            status: status.to_string(),
            row_count: None,
            header: Vec::new(),
            error_message: None,
            error_ext: Vec::new(),
            csv_url: None,
            xlsx_url: None,
        }
    }

    fn exports() -> ExportWriter {
        ExportWriter::new(&ExportsConfig {
            directory: std::env::temp_dir(),
            base_url: "/trackers".to_string(),
            result_valid_seconds: 60,
        })
    }

    fn snapshot_ids(stream: &TrackerStream) -> Vec<(i64, String)> {
        stream
            .trackers_snapshot()
            .trackers
            .iter()
            .map(|t| (t.id, t.status.clone()))
            .collect()
    }

    #[test]
    fn test_topic_parsing() {
        assert_eq!("trackers".parse::<Topic>(), Ok(Topic::Trackers));
        assert_eq!("query-result:12".parse::<Topic>(), Ok(Topic::QueryResult(12)));
        assert!("query-result:abc".parse::<Topic>().is_err());
        assert!("jobs".parse::<Topic>().is_err());
        assert_eq!(Topic::QueryResult(3).to_string(), "query-result:3");
    }

    #[test]
    fn test_snapshot_keeps_newest_trackers() {
        let stream = TrackerStream::new(3);
        let mut last = 0;
        for id in 1..=5 {
            last = stream.publish_tracker(view(id, "pending"));
        }

        let snapshot = stream.trackers_snapshot();
        let ids: Vec<i64> = snapshot.trackers.iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![5, 4, 3]);
        assert_eq!(snapshot.seq, last);
    }

    #[test]
    fn test_finished_tracker_is_published_after_newer_ones() {
        let stream = TrackerStream::new(2);
        stream.publish_tracker(view(1, "running"));
        stream.publish_tracker(view(2, "success"));
        stream.publish_tracker(view(3, "success"));
        assert_eq!(
            snapshot_ids(&stream),
            vec![(3, "success".to_string()), (1, "running".to_string())]
        );

        stream.publish_tracker(view(1, "success"));
        assert_eq!(
            snapshot_ids(&stream),
            vec![(3, "success".to_string()), (1, "success".to_string())]
        );
    }

    #[test]
    fn test_touched_tracker_is_never_evicted() {
        let stream = TrackerStream::new(2);
        stream.publish_tracker(view(1, "running"));
        stream.publish_tracker(view(2, "running"));
        stream.publish_tracker(view(3, "failed"));

        assert_eq!(
            snapshot_ids(&stream),
            vec![(3, "failed".to_string()), (2, "running".to_string())]
        );
    }

    #[test]
    fn test_update_replaces_tracker_in_snapshot() {
        let stream = TrackerStream::new(10);
        stream.publish_tracker(view(1, "pending"));
        stream.publish_tracker(view(1, "running"));

        let snapshot = stream.trackers_snapshot();
        assert_eq!(snapshot.trackers.len(), 1);
        assert_eq!(snapshot.trackers[0].status, "running");
    }

    #[test]
    fn test_refresh_only_touches_known_trackers() {
        let stream = TrackerStream::new(10);
        stream.publish_tracker(view(1, "success"));
        stream.publish_tracker(view(2, "success"));

        assert_eq!(stream.refresh_trackers(vec![view(9, "expired")]), None);

        let seq = stream.refresh_trackers(vec![view(1, "expired"), view(9, "expired")]);
        assert!(seq.is_some());
        assert_eq!(
            snapshot_ids(&stream),
            vec![(2, "success".to_string()), (1, "expired".to_string())]
        );
    }

    #[test]
    fn test_seq_follows_the_wall_clock() {
        let before = u64::try_from(Utc::now().timestamp_millis()).unwrap_or_default();
        let stream = TrackerStream::new(10);

        let first = stream.publish_tracker(view(1, "pending"));
        let second = stream.publish_tracker(view(1, "running"));

        assert!(first >= before);
        assert!(second > first);
    }

    #[tokio::test]
    async fn test_subscribe_delivers_current_snapshot_first() {
        let stream = TrackerStream::new(10);
        stream.publish_tracker(view(1, "pending"));
        let current = stream.publish_tracker(view(1, "running"));

        let mut sub = stream.subscribe(Topic::Trackers, 0);
        let first = sub.next().await.expect("snapshot");
        assert_eq!(first.seq(), current);

        let update = stream.publish_tracker(view(1, "success"));
        let second = sub.next().await.expect("update");
        assert_eq!(second.seq(), update);
        assert!(second.seq() > first.seq());
    }

    #[tokio::test]
    async fn test_resubscribe_skips_seen_messages() {
        let stream = TrackerStream::new(10);
        let seen = stream.publish_tracker(view(1, "pending"));

        let mut sub = stream.subscribe(Topic::Trackers, seen);
        let pending = tokio::time::timeout(Duration::from_millis(50), sub.next()).await;
        assert!(pending.is_err(), "already-seen snapshot must not be replayed");
    }

    #[tokio::test]
    async fn test_cursor_from_before_restart_gets_current_snapshot() {
        let previous = TrackerStream::new(10);
        let mut cursor = 0;
        for id in 1..=40 {
            cursor = previous.publish_tracker(view(id, "success"));
        }

        let restarted = TrackerStream::new(10);
        restarted.seed(vec![view(40, "success")]);
        restarted.publish_tracker(view(41, "pending"));

        let mut sub = restarted.subscribe(Topic::Trackers, cursor);
        let message = tokio::time::timeout(Duration::from_secs(1), sub.next())
            .await
            .expect("reconnecting client must get the current snapshot")
            .expect("topic open");
        assert_eq!(message.seq(), restarted.trackers_snapshot().seq);
        match message {
            TopicMessage::Trackers(m) => assert_eq!(m.trackers[0].id, 41),
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_cursor_ahead_of_topic_is_reset() {
        let stream = TrackerStream::new(10);
        let current = stream.publish_tracker(view(1, "pending"));

        let mut sub = stream.subscribe(Topic::Trackers, current + 1_000_000);
        let message = tokio::time::timeout(Duration::from_secs(1), sub.next())
            .await
            .expect("cursor from elsewhere must get the current snapshot")
            .expect("topic open");
        assert_eq!(message.seq(), current);
    }

    #[tokio::test]
    async fn test_seq_strictly_increases_under_concurrent_publishers() {
        let stream = TrackerStream::new(5);
        let mut sub = stream.subscribe(Topic::Trackers, 0);

        let mut handles = Vec::new();
        for worker in 0..4i64 {
            let stream = stream.clone();
            handles.push(tokio::spawn(async move {
                for n in 0..50 {
                    stream.publish_tracker(view(worker * 100 + n, "running"));
                    tokio::task::yield_now().await;
                }
            }));
        }

        let reader = tokio::spawn(async move {
            let mut seen = Vec::new();
            while let Ok(Some(message)) =
                tokio::time::timeout(Duration::from_millis(200), sub.next()).await
            {
                seen.push(message.seq());
            }
            seen
        });

        for handle in handles {
            handle.await.expect("publisher");
        }
        let seen = reader.await.expect("reader");

        assert!(!seen.is_empty());
        assert!(seen.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(seen.last().copied(), Some(stream.trackers_snapshot().seq));
    }

    #[tokio::test]
    async fn test_query_result_topic() {
        let stream = TrackerStream::new(10);
        let mut sub = stream.subscribe(Topic::QueryResult(7), 0);

        let published = stream.publish_query_result(
            7,
            QueryResultMessage::failure(Some(1), "boom".to_string(), vec!["code: 1".to_string()]),
        );

        let message = sub.next().await.expect("message");
        match message {
            TopicMessage::QueryResult(m) => {
                assert_eq!(m.seq, published);
                assert_eq!(m.status, -1);
                assert_eq!(m.error_ext, vec!["code: 1"]);
            }
            other => panic!("unexpected message: {:?}", other),
        }

        assert!(stream.latest_query_result(8).is_none());
    }

    #[tokio::test]
    async fn test_close_job_ends_subscription() {
        let stream = TrackerStream::new(10);
        let mut sub = stream.subscribe(Topic::QueryResult(4), 0);

        stream.close_job(4);

        assert!(sub.next().await.is_none());
    }

    #[test]
    fn test_view_carries_result_summary() {
        let mut tracker = fixtures::tracker(3, 1, TrackerStatus::Failed);
        tracker.header = Some(serde_json::json!(["id", "name"]));
        tracker.error_message = Some("syntax error".to_string());
        tracker.error_ext = Some(serde_json::json!(["code: 42601"]));
        tracker.csv_path = Some("/tmp/result_tid_3.csv".to_string());

        let view = TrackerView::new(&tracker, "daily-report", "sales", &exports());
        assert_eq!(view.header, vec!["id", "name"]);
        assert_eq!(view.error_ext, vec!["code: 42601"]);
        assert_eq!(view.csv_url, None);

        let json = serde_json::to_value(&view).expect("serialize");
        assert_eq!(json["error_ext"], serde_json::json!(["code: 42601"]));
        assert_eq!(json["header"], serde_json::json!(["id", "name"]));
    }

    #[test]
    fn test_detail_includes_preview_rows() {
        let mut tracker = fixtures::tracker(5, 2, TrackerStatus::Success);
        tracker.header = Some(serde_json::json!(["id"]));
        tracker.rows_preview = Some(serde_json::json!([{"id": 1}, {"id": 2}]));
        tracker.csv_path = Some("/tmp/result_tid_5.csv".to_string());
        let row = TrackerWithJob {
            tracker,
            job_name: "numbers".to_string(),
            database_name: "sales".to_string(),
        };

        let detail = TrackerDetail::from_joined(&row, &exports());
        assert_eq!(detail.rows_preview.len(), 2);
        assert_eq!(detail.view.csv_url.as_deref(), Some("/trackers/5/result/csv"));

        let json = serde_json::to_value(&detail).expect("serialize");
        assert_eq!(json["jobName"], "numbers");
        assert_eq!(json["rowsPreview"][1]["id"], 2);
    }

    #[test]
    fn test_query_result_message_shape() {
        let message = QueryResultMessage::success(None, vec!["id".to_string()], Vec::new());
        let json = serde_json::to_value(&message).expect("serialize");

        assert_eq!(
            json,
            serde_json::json!({
                "seq": 0,
                "status": 0,
                "header": ["id"],
                "data": [],
                "error": null,
                "error_ext": []
            })
        );
    }
}
