//! Durable outbox for async replication payloads
//!
//! Record format: [MAGIC][SEQUENCE][OP][BODY_LEN][BODY][CRC32]
//!
//! `ENQUEUE` records carry a bincode-encoded [`AsyncPayload`], `ACK` records
//! carry nothing and retire the sequence they name. Replaying the file
//! yields the payloads still awaiting delivery, so a restarted node resumes
//! where it stopped. The file is truncated whenever nothing is pending.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::common::{crc32, Error, NodeId, Result, SyncPolicy};
use crate::node::transport::AsyncPayload;

const OUTBOX_MAGIC: [u8; 4] = [0x41, 0x4F, 0x42, 0x31]; // "AOB1"
const OP_ENQUEUE: u8 = 1;
const OP_ACK: u8 = 2;

/// Upper bound on a single record body
const MAX_BODY_LEN: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboxEntry {
    pub sequence: u64,
    pub payload: AsyncPayload,
    /// Failed delivery attempts since this process started
    pub attempts: u32,
}

#[derive(Debug)]
enum Record {
    Enqueue { sequence: u64, payload: AsyncPayload },
    Ack { sequence: u64 },
}

pub struct Outbox {
    path: PathBuf,
    writer: BufWriter<File>,
    next_sequence: u64,
    sync_policy: SyncPolicy,
    pending: BTreeMap<u64, OutboxEntry>,
}

impl Outbox {
    /// Open or create the outbox, replaying any pending payloads.
    pub fn open(path: impl AsRef<Path>, sync_policy: SyncPolicy) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let (pending, next_sequence, valid_len) = Self::replay(&path)?;

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(&path)?;

        // Appending after a torn record would hide everything written later
        if file.metadata()?.len() > valid_len {
            tracing::warn!(
                "Outbox {} has a corrupted tail, truncating to {} bytes",
                path.display(),
                valid_len
            );
            file.set_len(valid_len)?;
        }

        if !pending.is_empty() {
            tracing::info!(
                "Outbox {} holds {} pending payloads",
                path.display(),
                pending.len()
            );
        }

        Ok(Self {
            path,
            writer: BufWriter::new(file),
            next_sequence,
            sync_policy,
            pending,
        })
    }

    /// Returns pending entries, the next sequence and the length of the
    /// intact prefix of the file.
    fn replay(path: &Path) -> Result<(BTreeMap<u64, OutboxEntry>, u64, u64)> {
        let mut pending = BTreeMap::new();
        let mut next_sequence = 0u64;
        let mut valid_len = 0u64;

        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok((pending, 0, 0)),
            Err(e) => return Err(e.into()),
        };

        let mut reader = BufReader::new(file);
        loop {
            match Self::read_record(&mut reader) {
                Ok(Some((Record::Enqueue { sequence, payload }, size))) => {
                    valid_len += size;
                    next_sequence = next_sequence.max(sequence + 1);
                    pending.insert(
                        sequence,
                        OutboxEntry {
                            sequence,
                            payload,
                            attempts: 0,
                        },
                    );
                }
                Ok(Some((Record::Ack { sequence }, size))) => {
                    valid_len += size;
                    next_sequence = next_sequence.max(sequence + 1);
                    pending.remove(&sequence);
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!("Outbox replay stopped at corrupted record: {}", e);
                    break;
                }
            }
        }

        Ok((pending, next_sequence, valid_len))
    }

    /// Durably record a payload; returns its sequence number.
    pub fn append(&mut self, payload: AsyncPayload) -> Result<u64> {
        let body = bincode::serialize(&payload)
            .map_err(|e| Error::Outbox(format!("encode failed: {}", e)))?;

        let sequence = self.next_sequence;
        self.write_record(sequence, OP_ENQUEUE, &body)?;
        self.maybe_sync()?;
        self.next_sequence += 1;

        self.pending.insert(
            sequence,
            OutboxEntry {
                sequence,
                payload,
                attempts: 0,
            },
        );
        Ok(sequence)
    }

    /// Retire a payload, delivered or given up on.
    pub fn ack(&mut self, sequence: u64) -> Result<()> {
        if self.pending.remove(&sequence).is_none() {
            return Ok(());
        }

        if self.pending.is_empty() {
            return self.truncate();
        }

        self.write_record(sequence, OP_ACK, &[])?;
        self.maybe_sync()
    }

    /// Retire every pending payload for `key` addressed to `target`.
    pub fn discard(&mut self, key: &str, target: &NodeId) -> Result<usize> {
        let stale: Vec<u64> = self
            .pending
            .values()
            .filter(|e| e.payload.key == key && e.payload.target == *target)
            .map(|e| e.sequence)
            .collect();
        for sequence in &stale {
            self.ack(*sequence)?;
        }
        Ok(stale.len())
    }

    pub fn contains(&self, sequence: u64) -> bool {
        self.pending.contains_key(&sequence)
    }

    /// Count a failed attempt; returns the new total.
    pub fn record_failure(&mut self, sequence: u64) -> u32 {
        match self.pending.get_mut(&sequence) {
            Some(entry) => {
                entry.attempts += 1;
                entry.attempts
            }
            None => 0,
        }
    }

    /// Pending payloads grouped by target, each group in enqueue order.
    pub fn pending_by_target(&self) -> BTreeMap<NodeId, Vec<OutboxEntry>> {
        let mut groups: BTreeMap<NodeId, Vec<OutboxEntry>> = BTreeMap::new();
        for entry in self.pending.values() {
            groups
                .entry(entry.payload.target.clone())
                .or_default()
                .push(entry.clone());
        }
        groups
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    fn write_record(&mut self, sequence: u64, op: u8, body: &[u8]) -> Result<()> {
        let len = (body.len() as u32).to_le_bytes();

        self.writer.write_all(&OUTBOX_MAGIC)?;
        self.writer.write_all(&sequence.to_le_bytes())?;
        self.writer.write_all(&[op])?;
        self.writer.write_all(&len)?;
        self.writer.write_all(body)?;

        let mut checksum_data = Vec::with_capacity(13 + body.len());
        checksum_data.extend_from_slice(&sequence.to_le_bytes());
        checksum_data.push(op);
        checksum_data.extend_from_slice(&len);
        checksum_data.extend_from_slice(body);
        self.writer.write_all(&crc32(&checksum_data).to_le_bytes())?;

        Ok(())
    }

    /// Read one record and its encoded size
    fn read_record<R: Read>(reader: &mut R) -> Result<Option<(Record, u64)>> {
        let mut magic = [0u8; 4];
        match reader.read_exact(&mut magic) {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }

        if magic != OUTBOX_MAGIC {
            return Err(Error::Outbox("invalid magic".into()));
        }

        let mut seq_bytes = [0u8; 8];
        reader.read_exact(&mut seq_bytes)?;
        let sequence = u64::from_le_bytes(seq_bytes);

        let mut op = [0u8; 1];
        reader.read_exact(&mut op)?;

        let mut len_bytes = [0u8; 4];
        reader.read_exact(&mut len_bytes)?;
        let len = u32::from_le_bytes(len_bytes) as usize;
        if len > MAX_BODY_LEN {
            return Err(Error::Outbox(format!("record body too large: {}", len)));
        }

        let mut body = vec![0u8; len];
        reader.read_exact(&mut body)?;

        let mut checksum_bytes = [0u8; 4];
        reader.read_exact(&mut checksum_bytes)?;

        let mut checksum_data = Vec::with_capacity(13 + len);
        checksum_data.extend_from_slice(&seq_bytes);
        checksum_data.push(op[0]);
        checksum_data.extend_from_slice(&len_bytes);
        checksum_data.extend_from_slice(&body);
        if crc32(&checksum_data) != u32::from_le_bytes(checksum_bytes) {
            return Err(Error::Outbox("checksum mismatch".into()));
        }

        let size = (4 + 8 + 1 + 4 + len + 4) as u64;
        let record = match op[0] {
            OP_ENQUEUE => {
                let payload = bincode::deserialize(&body)
                    .map_err(|e| Error::Outbox(format!("decode failed: {}", e)))?;
                Record::Enqueue { sequence, payload }
            }
            OP_ACK => Record::Ack { sequence },
            other => return Err(Error::Outbox(format!("unknown op code: {}", other))),
        };
        Ok(Some((record, size)))
    }

    fn maybe_sync(&mut self) -> Result<()> {
        match self.sync_policy {
            SyncPolicy::Always => {
                self.writer.flush()?;
                self.writer.get_ref().sync_all()?;
            }
            SyncPolicy::Interval => {
                self.writer.flush()?;
            }
            SyncPolicy::Never => {}
        }
        Ok(())
    }

    /// Drop all records. Sequence numbers keep increasing.
    fn truncate(&mut self) -> Result<()> {
        self.writer.flush()?;

        let file = OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(&self.path)?;
        drop(file);

        let file = OpenOptions::new().append(true).read(true).open(&self.path)?;
        self.writer = BufWriter::new(file);
        Ok(())
    }

    pub fn sync(&mut self) -> Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn payload(key: &str, target: &str) -> AsyncPayload {
        AsyncPayload {
            key: key.into(),
            value: format!("value-{}", key),
            target: NodeId::new(target),
            primary: NodeId::new("http://n1"),
            sync: Some(NodeId::new("http://n2")),
        }
    }

    #[test]
    fn test_outbox_reopen_keeps_pending() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("outbox.log");

        {
            let mut outbox = Outbox::open(&path, SyncPolicy::Always).unwrap();
            let a = outbox.append(payload("a", "http://n3")).unwrap();
            let b = outbox.append(payload("b", "http://n3")).unwrap();
            outbox.append(payload("c", "http://n4")).unwrap();
            assert_eq!((a, b), (0, 1));

            outbox.ack(a).unwrap();
            outbox.sync().unwrap();
        }

        let mut outbox = Outbox::open(&path, SyncPolicy::Always).unwrap();
        assert_eq!(outbox.len(), 2);

        let groups = outbox.pending_by_target();
        assert_eq!(groups[&NodeId::new("http://n3")][0].payload.key, "b");
        assert_eq!(groups[&NodeId::new("http://n4")][0].payload.key, "c");

        // Sequence numbers continue after the replayed ones
        assert_eq!(outbox.append(payload("d", "http://n3")).unwrap(), 3);
    }

    #[test]
    fn test_discard_drops_only_matching_key_and_target() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("outbox.log");

        {
            let mut outbox = Outbox::open(&path, SyncPolicy::Always).unwrap();
            outbox.append(payload("a", "http://n3")).unwrap();
            outbox.append(payload("a", "http://n3")).unwrap();
            outbox.append(payload("a", "http://n4")).unwrap();
            outbox.append(payload("b", "http://n3")).unwrap();

            assert_eq!(outbox.discard("a", &NodeId::new("http://n3")).unwrap(), 2);
            assert!(!outbox.contains(0));
            assert!(outbox.contains(2));
            assert_eq!(outbox.discard("a", &NodeId::new("http://n3")).unwrap(), 0);
        }

        let outbox = Outbox::open(&path, SyncPolicy::Always).unwrap();
        let groups = outbox.pending_by_target();
        assert_eq!(outbox.len(), 2);
        assert_eq!(groups[&NodeId::new("http://n3")][0].payload.key, "b");
        assert_eq!(groups[&NodeId::new("http://n4")][0].payload.key, "a");
    }

    #[test]
    fn test_outbox_truncates_when_drained() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("outbox.log");

        let mut outbox = Outbox::open(&path, SyncPolicy::Always).unwrap();
        let seq = outbox.append(payload("a", "http://n3")).unwrap();
        assert!(std::fs::metadata(&path).unwrap().len() > 0);

        outbox.ack(seq).unwrap();
        assert!(outbox.is_empty());
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 0);

        // Still usable after truncation
        let next = outbox.append(payload("b", "http://n3")).unwrap();
        assert_eq!(next, 1);
        outbox.sync().unwrap();
        drop(outbox);

        let reopened = Outbox::open(&path, SyncPolicy::Always).unwrap();
        assert_eq!(reopened.len(), 1);
    }

    #[test]
    fn test_outbox_stops_at_corrupted_tail() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("outbox.log");

        {
            let mut outbox = Outbox::open(&path, SyncPolicy::Always).unwrap();
            outbox.append(payload("a", "http://n3")).unwrap();
            outbox.append(payload("b", "http://n3")).unwrap();
        }

        // Chop the last byte off the second record
        let len = std::fs::metadata(&path).unwrap().len();
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(len - 1).unwrap();

        {
            let mut outbox = Outbox::open(&path, SyncPolicy::Always).unwrap();
            assert_eq!(outbox.len(), 1);
            // Written after the torn tail was cut off
            outbox.append(payload("c", "http://n3")).unwrap();
        }

        let outbox = Outbox::open(&path, SyncPolicy::Always).unwrap();
        let keys: Vec<String> = outbox.pending_by_target()[&NodeId::new("http://n3")]
            .iter()
            .map(|e| e.payload.key.clone())
            .collect();
        assert_eq!(keys, vec!["a", "c"]);
    }

    #[test]
    fn test_record_failure_counts_attempts() {
        let dir = tempdir().unwrap();
        let mut outbox = Outbox::open(dir.path().join("o.log"), SyncPolicy::Never).unwrap();
        let seq = outbox.append(payload("a", "http://n3")).unwrap();
        assert_eq!(outbox.record_failure(seq), 1);
        assert_eq!(outbox.record_failure(seq), 2);
        assert_eq!(outbox.record_failure(999), 0);
    }
}
