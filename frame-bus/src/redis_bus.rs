use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;

use trinetra_types::{CameraId, Frame, FrameMeta};

use crate::{record_publish_drop, BusEntry, EntryId, FrameBus, FrameBusError, Result};

const META_FIELD: &str = "meta";
const JPEG_FIELD: &str = "jpeg";

/// Field map of one stream entry as returned by XREADGROUP/XCLAIM.
type Fields = HashMap<String, Vec<u8>>;
type StreamEntries = Vec<(String, Fields)>;
type ReadReply = Option<Vec<(String, StreamEntries)>>;
/// Rows of XPENDING: (id, consumer, idle_ms, delivery_count).
type PendingRows = Vec<(String, String, u64, u64)>;

/// Frame bus over Redis Streams.
///
/// One stream per camera, capped with `XADD MAXLEN ~` (approximate trim,
/// which is why the capacity invariant carries a small slack). Consumer
/// groups are created lazily with `MKSTREAM` on first consume, and crash
/// recovery uses `XPENDING`/`XCLAIM` rather than `XAUTOCLAIM` so the reply
/// shapes are stable across Redis 6.2 and 7.
#[derive(Clone)]
pub struct RedisFrameBus {
    conn: redis::aio::MultiplexedConnection,
    maxlen: usize,
    known_groups: Arc<Mutex<HashSet<(String, String)>>>,
}

impl RedisFrameBus {
    pub async fn connect(url: &str, maxlen: usize) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        Ok(Self {
            conn,
            maxlen,
            known_groups: Arc::new(Mutex::new(HashSet::new())),
        })
    }

    async fn ensure_group(&self, stream: &str, group: &str) -> Result<()> {
        {
            let known = self.known_groups.lock();
            if known.contains(&(stream.to_string(), group.to_string())) {
                return Ok(());
            }
        }
        let mut conn = self.conn.clone();
        let created: std::result::Result<(), redis::RedisError> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(stream)
            .arg(group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;
        match created {
            Ok(()) => tracing::debug!(stream, group, "consumer group created"),
            // Group already exists: fine, another consumer won the race.
            Err(e) if e.code() == Some("BUSYGROUP") => {}
            Err(e) => return Err(e.into()),
        }
        self.known_groups
            .lock()
            .insert((stream.to_string(), group.to_string()));
        Ok(())
    }
}

fn decode_entry(stream: &str, id: &str, mut fields: Fields) -> Result<BusEntry> {
    let id: EntryId = id.parse()?;
    let meta_raw = fields
        .remove(META_FIELD)
        .ok_or_else(|| FrameBusError::MalformedEntry(format!("{stream}/{id}: missing meta")))?;
    let meta: FrameMeta = serde_json::from_slice(&meta_raw)
        .map_err(|e| FrameBusError::MalformedEntry(format!("{stream}/{id}: {e}")))?;
    let jpeg = fields
        .remove(JPEG_FIELD)
        .ok_or_else(|| FrameBusError::MalformedEntry(format!("{stream}/{id}: missing jpeg")))?;
    Ok(BusEntry {
        stream: stream.to_string(),
        id,
        meta,
        jpeg: bytes::Bytes::from(jpeg),
    })
}

#[async_trait::async_trait]
impl FrameBus for RedisFrameBus {
    async fn publish(&self, frame: &Frame) -> Result<EntryId> {
        let stream = frame.meta.camera_id.frame_stream_key();
        let meta = serde_json::to_vec(&frame.meta)
            .map_err(|e| FrameBusError::MalformedEntry(e.to_string()))?;
        let mut conn = self.conn.clone();
        let added: std::result::Result<String, redis::RedisError> = redis::cmd("XADD")
            .arg(&stream)
            .arg("MAXLEN")
            .arg("~")
            .arg(self.maxlen)
            .arg("*")
            .arg(META_FIELD)
            .arg(meta)
            .arg(JPEG_FIELD)
            .arg(frame.jpeg.as_ref())
            .query_async(&mut conn)
            .await;
        match added {
            Ok(id) => id.parse(),
            Err(e) => {
                // Failure policy: the frame is gone, count it and tell the
                // caller so its own drop accounting stays truthful.
                record_publish_drop(frame.meta.camera_id.as_str());
                Err(e.into())
            }
        }
    }

    async fn consume(
        &self,
        group: &str,
        consumer: &str,
        streams: &[String],
        count: usize,
        block_ms: u64,
    ) -> Result<Vec<BusEntry>> {
        for stream in streams {
            self.ensure_group(stream, group).await?;
        }
        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP")
            .arg(group)
            .arg(consumer)
            .arg("COUNT")
            .arg(count)
            .arg("BLOCK")
            .arg(block_ms)
            .arg("STREAMS");
        for stream in streams {
            cmd.arg(stream);
        }
        for _ in streams {
            cmd.arg(">");
        }
        let mut conn = self.conn.clone();
        let reply: ReadReply = cmd.query_async(&mut conn).await?;
        let mut out = Vec::new();
        for (stream, entries) in reply.unwrap_or_default() {
            for (id, fields) in entries {
                out.push(decode_entry(&stream, &id, fields)?);
            }
        }
        Ok(out)
    }

    async fn ack(&self, group: &str, stream: &str, ids: &[EntryId]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut cmd = redis::cmd("XACK");
        cmd.arg(stream).arg(group);
        for id in ids {
            cmd.arg(id.to_string());
        }
        let mut conn = self.conn.clone();
        let _acked: u64 = cmd.query_async(&mut conn).await?;
        Ok(())
    }

    async fn reclaim(
        &self,
        group: &str,
        consumer: &str,
        stream: &str,
        idle_ms: u64,
    ) -> Result<Vec<BusEntry>> {
        self.ensure_group(stream, group).await?;
        let mut conn = self.conn.clone();
        let pending: PendingRows = redis::cmd("XPENDING")
            .arg(stream)
            .arg(group)
            .arg("IDLE")
            .arg(idle_ms)
            .arg("-")
            .arg("+")
            .arg(1000)
            .query_async(&mut conn)
            .await?;
        if pending.is_empty() {
            return Ok(Vec::new());
        }
        let mut cmd = redis::cmd("XCLAIM");
        cmd.arg(stream)
            .arg(group)
            .arg(consumer)
            .arg(idle_ms);
        for (id, _owner, _idle, _deliveries) in &pending {
            cmd.arg(id);
        }
        let claimed: StreamEntries = cmd.query_async(&mut conn).await?;
        let mut out = Vec::new();
        for (id, fields) in claimed {
            out.push(decode_entry(stream, &id, fields)?);
        }
        Ok(out)
    }

    async fn length(&self, camera_id: &CameraId) -> Result<usize> {
        let mut conn = self.conn.clone();
        let len: usize = redis::cmd("XLEN")
            .arg(camera_id.frame_stream_key())
            .query_async(&mut conn)
            .await?;
        Ok(len)
    }

    fn maxlen(&self) -> usize {
        self.maxlen
    }

    async fn store_checkpoint(&self, key: &str, blob: &[u8]) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(blob)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn load_checkpoint(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.conn.clone();
        let blob: Option<Vec<u8>> = redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await?;
        Ok(blob)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_entry_rejects_missing_fields() {
        let mut fields = Fields::new();
        fields.insert(JPEG_FIELD.to_string(), vec![0xff, 0xd8]);
        match decode_entry("frames:cam_01", "5-0", fields) {
            Err(FrameBusError::MalformedEntry(msg)) => assert!(msg.contains("missing meta")),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn decode_entry_roundtrip() {
        use trinetra_types::{FrameIndex, FrameMeta, Timestamp};
        let meta = FrameMeta {
            camera_id: CameraId::new("cam_01"),
            frame_index: FrameIndex(3),
            ingest_ts: Timestamp::from_f64(12.5),
            frame_ts: None,
        };
        let mut fields = Fields::new();
        fields.insert(META_FIELD.to_string(), serde_json::to_vec(&meta).unwrap());
        fields.insert(JPEG_FIELD.to_string(), vec![1, 2, 3]);
        let entry = decode_entry("frames:cam_01", "17-2", fields).unwrap();
        assert_eq!(entry.id, EntryId::new(17, 2));
        assert_eq!(entry.meta, meta);
        assert_eq!(entry.jpeg.as_ref(), &[1, 2, 3]);
    }
}
