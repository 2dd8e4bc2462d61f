//! In-memory stream log for tests/dev.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::log::{ReadFrom, StreamEntry, StreamError, StreamLog};

/// In-memory stream log with consumer groups.
///
/// - No IO
/// - Entry ids are `"{seq}-0"`, increasing per stream
/// - Blocking reads wait on a condition variable woken by appends
#[derive(Debug, Default)]
pub struct InMemoryStreamLog {
    state: Mutex<State>,
    appended: Condvar,
}

#[derive(Debug, Default)]
struct State {
    streams: HashMap<String, StreamData>,
}

#[derive(Debug, Default)]
struct StreamData {
    entries: VecDeque<Entry>,
    last_seq: u64,
    groups: HashMap<String, Group>,
}

#[derive(Debug, Clone)]
struct Entry {
    seq: u64,
    fields: Vec<(String, String)>,
}

#[derive(Debug, Default)]
struct Group {
    last_delivered: u64,
    pending: BTreeMap<u64, PendingEntry>,
}

#[derive(Debug)]
struct PendingEntry {
    consumer: String,
    delivered_at: Instant,
    delivery_count: u64,
}

impl InMemoryStreamLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries currently retained in `stream`.
    pub fn len(&self, stream: &str) -> usize {
        self.lock()
            .map(|s| s.streams.get(stream).map_or(0, |d| d.entries.len()))
            .unwrap_or(0)
    }

    pub fn is_empty(&self, stream: &str) -> bool {
        self.len(stream) == 0
    }

    /// Snapshot of every retained entry of `stream`, oldest first.
    pub fn entries(&self, stream: &str) -> Vec<StreamEntry> {
        let Ok(state) = self.lock() else {
            return Vec::new();
        };
        state
            .streams
            .get(stream)
            .map(|d| d.entries.iter().map(|e| to_stream_entry(e, 0)).collect())
            .unwrap_or_default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>, StreamError> {
        self.state
            .lock()
            .map_err(|_| StreamError::Command("stream log lock poisoned".into()))
    }
}

fn entry_id(seq: u64) -> String {
    format!("{seq}-0")
}

fn parse_seq(id: &str) -> Option<u64> {
    id.split_once('-')
        .map_or(id, |(seq, _)| seq)
        .parse()
        .ok()
}

fn to_stream_entry(entry: &Entry, delivery_count: u64) -> StreamEntry {
    StreamEntry {
        id: entry_id(entry.seq),
        fields: entry.fields.clone(),
        delivery_count,
    }
}

fn find_entry(entries: &VecDeque<Entry>, seq: u64) -> Option<&Entry> {
    entries
        .binary_search_by_key(&seq, |e| e.seq)
        .ok()
        .and_then(|idx| entries.get(idx))
}

fn no_group(stream: &str, group: &str) -> StreamError {
    StreamError::NoGroup {
        stream: stream.to_string(),
        group: group.to_string(),
    }
}

fn group_mut<'a>(
    state: &'a mut State,
    stream: &str,
    group: &str,
) -> Result<(&'a VecDeque<Entry>, &'a mut Group), StreamError> {
    let data = state
        .streams
        .get_mut(stream)
        .ok_or_else(|| no_group(stream, group))?;
    let StreamData { entries, groups, .. } = data;
    let g = groups.get_mut(group).ok_or_else(|| no_group(stream, group))?;
    Ok((entries, g))
}

impl StreamLog for InMemoryStreamLog {
    fn append(
        &self,
        stream: &str,
        fields: &[(String, String)],
        max_len: Option<usize>,
    ) -> Result<String, StreamError> {
        let mut state = self.lock()?;
        let data = state.streams.entry(stream.to_string()).or_default();

        data.last_seq += 1;
        let seq = data.last_seq;
        data.entries.push_back(Entry {
            seq,
            fields: fields.to_vec(),
        });

        if let Some(max) = max_len {
            while data.entries.len() > max {
                data.entries.pop_front();
            }
        }

        drop(state);
        self.appended.notify_all();
        Ok(entry_id(seq))
    }

    fn ensure_group(&self, stream: &str, group: &str) -> Result<(), StreamError> {
        let mut state = self.lock()?;
        state
            .streams
            .entry(stream.to_string())
            .or_default()
            .groups
            .entry(group.to_string())
            .or_default();
        Ok(())
    }

    fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        from: ReadFrom,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>, StreamError> {
        let deadline = Instant::now() + block;
        let mut state = self.lock()?;

        loop {
            let now = Instant::now();
            {
                let (entries, g) = group_mut(&mut state, stream, group)?;

                match from {
                    ReadFrom::Pending => {
                        let owned: Vec<u64> = g
                            .pending
                            .iter()
                            .filter(|(_, p)| p.consumer == consumer)
                            .map(|(seq, _)| *seq)
                            .take(count)
                            .collect();

                        let mut out = Vec::with_capacity(owned.len());
                        for seq in owned {
                            match find_entry(entries, seq) {
                                Some(entry) => {
                                    let delivered = g.pending.get(&seq).map_or(0, |p| p.delivery_count);
                                    out.push(to_stream_entry(entry, delivered));
                                }
                                // Trimmed away while pending.
                                None => {
                                    g.pending.remove(&seq);
                                }
                            }
                        }
                        return Ok(out);
                    }
                    ReadFrom::New => {
                        let batch: Vec<Entry> = entries
                            .iter()
                            .filter(|e| e.seq > g.last_delivered)
                            .take(count)
                            .cloned()
                            .collect();

                        if !batch.is_empty() {
                            let mut out = Vec::with_capacity(batch.len());
                            for entry in &batch {
                                g.last_delivered = entry.seq;
                                g.pending.insert(
                                    entry.seq,
                                    PendingEntry {
                                        consumer: consumer.to_string(),
                                        delivered_at: now,
                                        delivery_count: 1,
                                    },
                                );
                                out.push(to_stream_entry(entry, 1));
                            }
                            return Ok(out);
                        }
                    }
                }
            }

            if now >= deadline {
                return Ok(Vec::new());
            }

            state = self
                .appended
                .wait_timeout(state, deadline - now)
                .map_err(|_| StreamError::Command("stream log lock poisoned".into()))?
                .0;
        }
    }

    fn ack(&self, stream: &str, group: &str, ids: &[String]) -> Result<u64, StreamError> {
        let mut state = self.lock()?;
        let (_, g) = group_mut(&mut state, stream, group)?;

        let acked = ids
            .iter()
            .filter_map(|id| parse_seq(id))
            .filter(|seq| g.pending.remove(seq).is_some())
            .count();
        Ok(acked as u64)
    }

    fn claim_stale(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<StreamEntry>, StreamError> {
        let now = Instant::now();
        let mut state = self.lock()?;
        let (entries, g) = group_mut(&mut state, stream, group)?;

        let stale: Vec<u64> = g
            .pending
            .iter()
            .filter(|(_, p)| now.saturating_duration_since(p.delivered_at) >= min_idle)
            .map(|(seq, _)| *seq)
            .take(count)
            .collect();

        let mut out = Vec::with_capacity(stale.len());
        for seq in stale {
            let Some(entry) = find_entry(entries, seq) else {
                g.pending.remove(&seq);
                continue;
            };
            if let Some(p) = g.pending.get_mut(&seq) {
                p.consumer = consumer.to_string();
                p.delivered_at = now;
                p.delivery_count += 1;
                out.push(to_stream_entry(entry, p.delivery_count));
            }
        }
        Ok(out)
    }

    fn pending_count(&self, stream: &str, group: &str) -> Result<u64, StreamError> {
        let mut state = self.lock()?;
        let (_, g) = group_mut(&mut state, stream, group)?;
        Ok(g.pending.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn fields(v: &str) -> Vec<(String, String)> {
        vec![("payload".to_string(), v.to_string())]
    }

    #[test]
    fn group_starts_at_the_beginning_of_the_stream() {
        let log = InMemoryStreamLog::new();
        log.append("s", &fields("a"), None).unwrap();
        log.ensure_group("s", "g").unwrap();
        log.ensure_group("s", "g").unwrap();

        let got = log
            .read_group("s", "g", "c1", ReadFrom::New, 10, Duration::ZERO)
            .unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].delivery_count, 1);
    }

    #[test]
    fn unacked_entries_stay_pending_for_their_consumer() {
        let log = InMemoryStreamLog::new();
        log.ensure_group("s", "g").unwrap();
        let id = log.append("s", &fields("a"), None).unwrap();

        log.read_group("s", "g", "c1", ReadFrom::New, 10, Duration::ZERO)
            .unwrap();
        assert_eq!(log.pending_count("s", "g").unwrap(), 1);

        let mine = log
            .read_group("s", "g", "c1", ReadFrom::Pending, 10, Duration::ZERO)
            .unwrap();
        let theirs = log
            .read_group("s", "g", "c2", ReadFrom::Pending, 10, Duration::ZERO)
            .unwrap();
        assert_eq!(mine.len(), 1);
        assert!(theirs.is_empty());

        assert_eq!(log.ack("s", "g", &[id.clone()]).unwrap(), 1);
        assert_eq!(log.ack("s", "g", &[id]).unwrap(), 0);
        assert_eq!(log.pending_count("s", "g").unwrap(), 0);
    }

    #[test]
    fn claim_transfers_ownership_and_counts_deliveries() {
        let log = InMemoryStreamLog::new();
        log.ensure_group("s", "g").unwrap();
        log.append("s", &fields("a"), None).unwrap();
        log.read_group("s", "g", "crashed", ReadFrom::New, 10, Duration::ZERO)
            .unwrap();

        let none = log
            .claim_stale("s", "g", "rescuer", Duration::from_secs(3600), 10)
            .unwrap();
        assert!(none.is_empty());

        let claimed = log
            .claim_stale("s", "g", "rescuer", Duration::ZERO, 10)
            .unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].delivery_count, 2);

        let owned = log
            .read_group("s", "g", "rescuer", ReadFrom::Pending, 10, Duration::ZERO)
            .unwrap();
        assert_eq!(owned.len(), 1);
    }

    #[test]
    fn append_trims_to_max_len() {
        let log = InMemoryStreamLog::new();
        for i in 0..5 {
            log.append("s", &fields(&i.to_string()), Some(3)).unwrap();
        }
        let kept = log.entries("s");
        assert_eq!(kept.len(), 3);
        assert_eq!(kept[0].fields[0].1, "2");
    }

    #[test]
    fn missing_group_is_an_error() {
        let log = InMemoryStreamLog::new();
        let err = log
            .read_group("s", "g", "c", ReadFrom::New, 1, Duration::ZERO)
            .unwrap_err();
        assert!(matches!(err, StreamError::NoGroup { .. }));
    }

    #[test]
    fn blocking_read_wakes_on_append() {
        let log = Arc::new(InMemoryStreamLog::new());
        log.ensure_group("s", "g").unwrap();

        let writer = {
            let log = log.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(50));
                log.append("s", &fields("late"), None).unwrap();
            })
        };

        let got = log
            .read_group("s", "g", "c", ReadFrom::New, 10, Duration::from_secs(5))
            .unwrap();
        writer.join().unwrap();
        assert_eq!(got.len(), 1);
    }

    #[test]
    fn blocking_read_times_out_empty() {
        let log = InMemoryStreamLog::new();
        log.ensure_group("s", "g").unwrap();
        let got = log
            .read_group("s", "g", "c", ReadFrom::New, 10, Duration::from_millis(20))
            .unwrap();
        assert!(got.is_empty());
    }
}
