//! Redis Streams-backed stream log.
//!
//! - Append: `XADD key MAXLEN ~ N * field value ...`
//! - Groups: `XGROUP CREATE key group 0 MKSTREAM` (`BUSYGROUP` is success)
//! - Reads: `XREADGROUP` with `>` (blocking) or `0` (own pending, never blocks)
//! - Reclaim: `XPENDING ... IDLE` followed by `XCLAIM`
//!
//! Every call opens its own connection with read/write timeouts equal to the
//! configured I/O timeout; blocking reads must stay shorter than that.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use redis::Value;
use tracing::{debug, instrument};

use firstsip_streams::{ReadFrom, StreamEntry, StreamError, StreamLog};

const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct RedisStreamLog {
    client: Arc<redis::Client>,
    io_timeout: Duration,
}

fn command_error(op: &str, e: redis::RedisError) -> StreamError {
    StreamError::Command(format!("{op} failed: {e}"))
}

impl RedisStreamLog {
    pub fn new(redis_url: impl AsRef<str>) -> Result<Self, StreamError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| StreamError::Connection(e.to_string()))?;
        Ok(Self {
            client: Arc::new(client),
            io_timeout: DEFAULT_IO_TIMEOUT,
        })
    }

    pub fn with_io_timeout(mut self, io_timeout: Duration) -> Self {
        self.io_timeout = io_timeout;
        self
    }

    pub fn io_timeout(&self) -> Duration {
        self.io_timeout
    }

    fn conn(&self) -> Result<redis::Connection, StreamError> {
        let conn = self
            .client
            .get_connection_with_timeout(self.io_timeout)
            .map_err(|e| StreamError::Connection(e.to_string()))?;
        conn.set_read_timeout(Some(self.io_timeout))
            .and_then(|_| conn.set_write_timeout(Some(self.io_timeout)))
            .map_err(|e| StreamError::Connection(e.to_string()))?;
        Ok(conn)
    }

    /// Delivery counts of `consumer`'s pending entries, keyed by id.
    fn own_delivery_counts(
        &self,
        conn: &mut redis::Connection,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<HashMap<String, u64>, StreamError> {
        let rows: Vec<(String, String, u64, u64)> = redis::cmd("XPENDING")
            .arg(stream)
            .arg(group)
            .arg("-")
            .arg("+")
            .arg(count)
            .arg(consumer)
            .query(conn)
            .map_err(|e| group_error(stream, group, "XPENDING", e))?;
        Ok(rows.into_iter().map(|(id, _, _, n)| (id, n)).collect())
    }
}

fn group_error(stream: &str, group: &str, op: &str, e: redis::RedisError) -> StreamError {
    if e.code() == Some("NOGROUP") {
        StreamError::NoGroup {
            stream: stream.to_string(),
            group: group.to_string(),
        }
    } else {
        command_error(op, e)
    }
}

fn as_string(value: &Value) -> Option<String> {
    match value {
        Value::Data(data) => Some(String::from_utf8_lossy(data).into_owned()),
        Value::Status(s) => Some(s.clone()),
        _ => None,
    }
}

/// Parse `[id, [field, value, ...]]`. Entries deleted by trimming come back as nil.
fn parse_entry(entry: &Value) -> Result<Option<StreamEntry>, StreamError> {
    let parts = match entry {
        Value::Bulk(parts) => parts,
        Value::Nil => return Ok(None),
        _ => return Err(StreamError::Decode("invalid entry format".into())),
    };
    let [id, body, ..] = parts.as_slice() else {
        return Err(StreamError::Decode("entry too short".into()));
    };

    let id = as_string(id).ok_or_else(|| StreamError::Decode("invalid entry id".into()))?;
    let fields = match body {
        Value::Bulk(items) => items
            .chunks(2)
            .filter_map(|kv| match kv {
                [k, v] => Some((as_string(k)?, as_string(v)?)),
                _ => None,
            })
            .collect(),
        Value::Nil => return Ok(None),
        _ => return Err(StreamError::Decode("invalid entry fields".into())),
    };

    Ok(Some(StreamEntry {
        id,
        fields,
        delivery_count: 0,
    }))
}

fn parse_entries(value: &Value) -> Result<Vec<StreamEntry>, StreamError> {
    match value {
        Value::Bulk(entries) => {
            let mut out = Vec::with_capacity(entries.len());
            for entry in entries {
                if let Some(parsed) = parse_entry(entry)? {
                    out.push(parsed);
                }
            }
            Ok(out)
        }
        Value::Nil => Ok(Vec::new()),
        _ => Err(StreamError::Decode("invalid entry list".into())),
    }
}

/// `XREADGROUP` reply: nil on timeout, else `[[stream, [entries]]]`.
fn parse_read_reply(reply: &Value, stream: &str) -> Result<Vec<StreamEntry>, StreamError> {
    let streams = match reply {
        Value::Nil => return Ok(Vec::new()),
        Value::Bulk(streams) => streams,
        _ => return Err(StreamError::Decode("invalid XREADGROUP reply".into())),
    };

    for item in streams {
        if let Value::Bulk(pair) = item {
            if let [name, entries] = pair.as_slice() {
                if as_string(name).as_deref() == Some(stream) {
                    return parse_entries(entries);
                }
            }
        }
    }
    Ok(Vec::new())
}

impl StreamLog for RedisStreamLog {
    #[instrument(skip(self, fields), fields(stream = %stream), err)]
    fn append(
        &self,
        stream: &str,
        fields: &[(String, String)],
        max_len: Option<usize>,
    ) -> Result<String, StreamError> {
        let mut conn = self.conn()?;
        let mut cmd = redis::cmd("XADD");
        cmd.arg(stream);
        if let Some(n) = max_len {
            cmd.arg("MAXLEN").arg("~").arg(n);
        }
        cmd.arg("*");
        for (k, v) in fields {
            cmd.arg(k).arg(v);
        }
        cmd.query(&mut conn).map_err(|e| command_error("XADD", e))
    }

    fn ensure_group(&self, stream: &str, group: &str) -> Result<(), StreamError> {
        let mut conn = self.conn()?;
        let created: redis::RedisResult<String> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(stream)
            .arg(group)
            .arg("0")
            .arg("MKSTREAM")
            .query(&mut conn);

        match created {
            Ok(_) => {
                debug!(stream, group, "consumer group created");
                Ok(())
            }
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(command_error("XGROUP CREATE", e)),
        }
    }

    #[instrument(skip(self), err)]
    fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        from: ReadFrom,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>, StreamError> {
        let mut conn = self.conn()?;
        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP").arg(group).arg(consumer).arg("COUNT").arg(count);
        if from == ReadFrom::New {
            cmd.arg("BLOCK").arg(block.as_millis() as u64);
        }
        cmd.arg("STREAMS").arg(stream);
        cmd.arg(match from {
            ReadFrom::New => ">",
            ReadFrom::Pending => "0",
        });

        let reply: Value = match cmd.query(&mut conn) {
            Ok(reply) => reply,
            Err(e) if e.is_timeout() => return Ok(Vec::new()),
            Err(e) => return Err(group_error(stream, group, "XREADGROUP", e)),
        };
        let mut entries = parse_read_reply(&reply, stream)?;

        match from {
            ReadFrom::New => entries.iter_mut().for_each(|e| e.delivery_count = 1),
            ReadFrom::Pending if !entries.is_empty() => {
                let counts = self.own_delivery_counts(&mut conn, stream, group, consumer, count)?;
                for entry in &mut entries {
                    entry.delivery_count = counts.get(&entry.id).copied().unwrap_or(0);
                }
            }
            ReadFrom::Pending => {}
        }
        Ok(entries)
    }

    fn ack(&self, stream: &str, group: &str, ids: &[String]) -> Result<u64, StreamError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn()?;
        redis::cmd("XACK")
            .arg(stream)
            .arg(group)
            .arg(ids)
            .query(&mut conn)
            .map_err(|e| group_error(stream, group, "XACK", e))
    }

    #[instrument(skip(self), err)]
    fn claim_stale(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<StreamEntry>, StreamError> {
        let mut conn = self.conn()?;
        let min_idle_ms = min_idle.as_millis() as u64;

        let stale: Vec<(String, String, u64, u64)> = redis::cmd("XPENDING")
            .arg(stream)
            .arg(group)
            .arg("IDLE")
            .arg(min_idle_ms)
            .arg("-")
            .arg("+")
            .arg(count)
            .query(&mut conn)
            .map_err(|e| group_error(stream, group, "XPENDING", e))?;
        if stale.is_empty() {
            return Ok(Vec::new());
        }

        let counts: HashMap<String, u64> = stale.iter().map(|(id, _, _, n)| (id.clone(), *n)).collect();
        let ids: Vec<&String> = stale.iter().map(|(id, ..)| id).collect();

        let reply: Value = redis::cmd("XCLAIM")
            .arg(stream)
            .arg(group)
            .arg(consumer)
            .arg(min_idle_ms)
            .arg(&ids)
            .query(&mut conn)
            .map_err(|e| group_error(stream, group, "XCLAIM", e))?;

        let mut entries = parse_entries(&reply)?;
        for entry in &mut entries {
            // XCLAIM counts as one more delivery.
            entry.delivery_count = counts.get(&entry.id).map_or(0, |n| n + 1);
        }
        Ok(entries)
    }

    fn pending_count(&self, stream: &str, group: &str) -> Result<u64, StreamError> {
        let mut conn = self.conn()?;
        let summary: Value = redis::cmd("XPENDING")
            .arg(stream)
            .arg(group)
            .query(&mut conn)
            .map_err(|e| group_error(stream, group, "XPENDING", e))?;

        match summary {
            Value::Bulk(items) => match items.first() {
                Some(Value::Int(n)) => Ok((*n).max(0) as u64),
                _ => Ok(0),
            },
            _ => Err(StreamError::Decode("invalid XPENDING summary".into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(s: &str) -> Value {
        Value::Data(s.as_bytes().to_vec())
    }

    #[test]
    fn parses_read_reply() {
        let reply = Value::Bulk(vec![Value::Bulk(vec![
            data("plugin:results"),
            Value::Bulk(vec![
                Value::Bulk(vec![
                    data("1-0"),
                    Value::Bulk(vec![data("correlation_id"), data("r1"), data("payload"), data("{}")]),
                ]),
                Value::Bulk(vec![data("2-0"), Value::Nil]),
            ]),
        ])]);

        let entries = parse_read_reply(&reply, "plugin:results").unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, "1-0");
        assert_eq!(
            entries[0].fields,
            vec![
                ("correlation_id".to_string(), "r1".to_string()),
                ("payload".to_string(), "{}".to_string()),
            ]
        );
    }

    #[test]
    fn timeout_reply_is_empty() {
        assert!(parse_read_reply(&Value::Nil, "s").unwrap().is_empty());
    }

    #[test]
    fn malformed_entry_is_a_decode_error() {
        let reply = Value::Bulk(vec![Value::Int(3)]);
        assert!(matches!(parse_entries(&reply), Err(StreamError::Decode(_))));
    }
}
