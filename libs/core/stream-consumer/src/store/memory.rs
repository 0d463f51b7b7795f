//! In-process stream store
//!
//! Models the parts of Redis stream semantics the engine relies on: entry
//! IDs, consumer groups with a last-delivered cursor, the pending entries
//! list with delivery counts, consumer idle times and blocking reads.
//! Time is measured with `tokio::time::Instant` so paused-clock tests can
//! drive idle thresholds deterministically.

use super::{AutoClaimed, ConsumerInfo, PendingEntry, StreamEntry, StreamStore};
use crate::error::{StreamError, StreamResult};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::Notify;
use tokio::time::Instant;

type EntryId = (u64, u64);

#[derive(Debug)]
struct Pending {
    consumer: String,
    delivered_at: Instant,
    delivery_count: u64,
}

#[derive(Debug, Default)]
struct Group {
    last_delivered: EntryId,
    pel: BTreeMap<EntryId, Pending>,
    consumers: HashMap<String, Instant>,
}

impl Group {
    fn touch(&mut self, consumer: &str, now: Instant) {
        self.consumers.insert(consumer.to_string(), now);
    }
}

#[derive(Debug, Default)]
struct Stream {
    entries: BTreeMap<EntryId, HashMap<String, Vec<u8>>>,
    last_id: EntryId,
    groups: HashMap<String, Group>,
}

fn to_entry(id: EntryId, fields: &HashMap<String, Vec<u8>>) -> StreamEntry {
    StreamEntry {
        id: format_id(id),
        fields: fields.clone(),
    }
}

/// Stream store kept entirely in memory.
#[derive(Debug)]
pub struct MemoryStore {
    streams: Mutex<HashMap<String, Stream>>,
    appended: Notify,
    epoch_ms: u64,
    started: Instant,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let epoch_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        Self {
            streams: Mutex::new(HashMap::new()),
            appended: Notify::new(),
            epoch_ms,
            started: Instant::now(),
        }
    }

    /// Number of entries currently in `stream`.
    pub fn stream_len(&self, stream: &str) -> usize {
        self.lock().get(stream).map_or(0, |s| s.entries.len())
    }

    /// Number of pending (delivered, unacknowledged) entries in the group.
    pub fn pending_count(&self, stream: &str, group: &str) -> usize {
        self.lock()
            .get(stream)
            .and_then(|s| s.groups.get(group))
            .map_or(0, |g| g.pel.len())
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Stream>> {
        // A panic while holding the lock leaves the maps consistent, so keep going
        self.streams
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn now_ms(&self) -> u64 {
        self.epoch_ms + self.started.elapsed().as_millis() as u64
    }

    fn next_id(&self, last: EntryId) -> EntryId {
        let ms = self.now_ms();
        if ms > last.0 {
            (ms, 0)
        } else {
            (last.0, last.1 + 1)
        }
    }

    fn try_read(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> StreamResult<Vec<StreamEntry>> {
        let now = Instant::now();
        let mut streams = self.lock();
        let s = streams.get_mut(stream).ok_or_else(|| no_group(stream, group))?;
        let g = s.groups.get_mut(group).ok_or_else(|| no_group(stream, group))?;
        g.touch(consumer, now);

        let start = (g.last_delivered.0, g.last_delivered.1.saturating_add(1));
        let ids: Vec<EntryId> = s
            .entries
            .range(start..)
            .take(count.max(1))
            .map(|(id, _)| *id)
            .collect();

        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            g.last_delivered = id;
            g.pel.insert(
                id,
                Pending {
                    consumer: consumer.to_string(),
                    delivered_at: now,
                    delivery_count: 1,
                },
            );
            if let Some(fields) = s.entries.get(&id) {
                out.push(to_entry(id, fields));
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl StreamStore for MemoryStore {
    async fn group_create(
        &self,
        stream: &str,
        group: &str,
        start_id: &str,
        mkstream: bool,
    ) -> StreamResult<()> {
        let mut streams = self.lock();
        if !streams.contains_key(stream) {
            if !mkstream {
                return Err(StreamError::Protocol(format!(
                    "stream '{stream}' does not exist and MKSTREAM was not requested"
                )));
            }
            streams.insert(stream.to_string(), Stream::default());
        }
        let s = streams
            .get_mut(stream)
            .ok_or_else(|| no_group(stream, group))?;

        if s.groups.contains_key(group) {
            return Err(StreamError::GroupExists {
                stream: stream.to_string(),
                group: group.to_string(),
            });
        }

        let last_delivered = if start_id == "$" {
            s.last_id
        } else {
            parse_id(start_id)?
        };
        s.groups.insert(
            group.to_string(),
            Group {
                last_delivered,
                ..Group::default()
            },
        );
        Ok(())
    }

    async fn group_create_consumer(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
    ) -> StreamResult<bool> {
        let now = Instant::now();
        let mut streams = self.lock();
        let g = streams
            .get_mut(stream)
            .and_then(|s| s.groups.get_mut(group))
            .ok_or_else(|| no_group(stream, group))?;

        if g.consumers.contains_key(consumer) {
            return Ok(false);
        }
        g.touch(consumer, now);
        Ok(true)
    }

    async fn group_delete_consumer(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
    ) -> StreamResult<u64> {
        let mut streams = self.lock();
        let g = streams
            .get_mut(stream)
            .and_then(|s| s.groups.get_mut(group))
            .ok_or_else(|| no_group(stream, group))?;

        g.consumers.remove(consumer);
        let before = g.pel.len();
        g.pel.retain(|_, p| p.consumer != consumer);
        Ok((before - g.pel.len()) as u64)
    }

    async fn group_read(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> StreamResult<Vec<StreamEntry>> {
        let deadline = Instant::now() + block;
        loop {
            // Register interest before looking so an append in between is not missed
            let notified = self.appended.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let entries = self.try_read(stream, group, consumer, count)?;
            if !entries.is_empty() {
                return Ok(entries);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn ack(&self, stream: &str, group: &str, entry_id: &str) -> StreamResult<bool> {
        let id = parse_id(entry_id)?;
        let mut streams = self.lock();
        let removed = streams
            .get_mut(stream)
            .and_then(|s| s.groups.get_mut(group))
            .and_then(|g| g.pel.remove(&id))
            .is_some();
        Ok(removed)
    }

    async fn auto_claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        start_id: &str,
        count: usize,
    ) -> StreamResult<AutoClaimed> {
        let start = parse_id(start_id)?;
        let now = Instant::now();
        let mut streams = self.lock();
        let s = streams.get_mut(stream).ok_or_else(|| no_group(stream, group))?;
        let Stream { entries, groups, .. } = s;
        let g = groups.get_mut(group).ok_or_else(|| no_group(stream, group))?;
        g.touch(consumer, now);

        let mut claimed = AutoClaimed {
            next_start_id: "0-0".to_string(),
            ..AutoClaimed::default()
        };
        let candidates: Vec<EntryId> = g
            .pel
            .range(start..)
            .filter(|(_, p)| now.saturating_duration_since(p.delivered_at) >= min_idle)
            .map(|(id, _)| *id)
            .collect();

        let limit = count.max(1);
        for (taken, id) in candidates.iter().enumerate() {
            if taken == limit {
                claimed.next_start_id = format_id(*id);
                break;
            }
            match entries.get(id) {
                Some(fields) => {
                    if let Some(p) = g.pel.get_mut(id) {
                        p.consumer = consumer.to_string();
                        p.delivered_at = now;
                        p.delivery_count += 1;
                    }
                    claimed.entries.push(to_entry(*id, fields));
                }
                None => {
                    g.pel.remove(id);
                    claimed.deleted_ids.push(format_id(*id));
                }
            }
        }
        Ok(claimed)
    }

    async fn pending_entry(
        &self,
        stream: &str,
        group: &str,
        entry_id: &str,
    ) -> StreamResult<Option<PendingEntry>> {
        let id = parse_id(entry_id)?;
        let now = Instant::now();
        let streams = self.lock();
        let g = streams
            .get(stream)
            .and_then(|s| s.groups.get(group))
            .ok_or_else(|| no_group(stream, group))?;

        Ok(g.pel.get(&id).map(|p| PendingEntry {
            id: format_id(id),
            consumer: p.consumer.clone(),
            idle: now.saturating_duration_since(p.delivered_at),
            delivery_count: p.delivery_count,
        }))
    }

    async fn consumers_info(&self, stream: &str, group: &str) -> StreamResult<Vec<ConsumerInfo>> {
        let now = Instant::now();
        let streams = self.lock();
        let g = streams
            .get(stream)
            .and_then(|s| s.groups.get(group))
            .ok_or_else(|| no_group(stream, group))?;

        let mut infos: Vec<ConsumerInfo> = g
            .consumers
            .iter()
            .map(|(name, seen_at)| ConsumerInfo {
                name: name.clone(),
                pending: g.pel.values().filter(|p| &p.consumer == name).count() as u64,
                idle: now.saturating_duration_since(*seen_at),
            })
            .collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(infos)
    }

    async fn append(
        &self,
        stream: &str,
        max_len: Option<usize>,
        field: &str,
        value: &[u8],
    ) -> StreamResult<String> {
        let id = {
            let mut streams = self.lock();
            let s = streams.entry(stream.to_string()).or_default();
            let id = self.next_id(s.last_id);
            s.last_id = id;
            s.entries
                .insert(id, HashMap::from([(field.to_string(), value.to_vec())]));

            if let Some(max_len) = max_len {
                while s.entries.len() > max_len {
                    if s.entries.pop_first().is_none() {
                        break;
                    }
                }
            }
            id
        };
        self.appended.notify_waiters();
        Ok(format_id(id))
    }

    async fn ping(&self) -> StreamResult<()> {
        Ok(())
    }
}

fn no_group(stream: &str, group: &str) -> StreamError {
    StreamError::NoGroup {
        stream: stream.to_string(),
        group: group.to_string(),
    }
}

fn format_id(id: EntryId) -> String {
    format!("{}-{}", id.0, id.1)
}

fn parse_id(raw: &str) -> StreamResult<EntryId> {
    let invalid = || StreamError::Protocol(format!("invalid stream ID '{raw}'"));
    let (ms, seq) = match raw.split_once('-') {
        Some((ms, seq)) => (ms, seq),
        None => (raw, "0"),
    };
    let ms = ms.parse().map_err(|_| invalid())?;
    let seq = seq.parse().map_err(|_| invalid())?;
    Ok((ms, seq))
}
