//! A single append-only segment file plus its in-memory key index.

use crate::error::SegmentError;
use crate::record::Record;
use bytes::Bytes;
use nori_observe::{Meter, SegmentEvt, SegmentEvtKind, VizEvent};
use norikv_types::SegmentId;
use parking_lot::{Mutex, RwLock};
use regex::Regex;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

/// Where a segment sits in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentKind {
    Active,
    SealedPlain,
    SealedCompacted,
}

struct AppendState {
    file: File,
    len: u64,
}

/// One segment file and the index of keys it holds.
pub struct Segment {
    id: SegmentId,
    path: PathBuf,
    kind: RwLock<SegmentKind>,
    index: RwLock<HashMap<Bytes, u64>>,
    append: Mutex<Option<AppendState>>,
}

impl Segment {
    /// Creates a brand-new, empty active segment.
    pub fn create_active(dir: &Path, id: SegmentId) -> Result<Self, SegmentError> {
        Self::create_at(&dir.join(plain_filename(id)), id)
    }

    /// Creates a brand-new, empty segment at an explicit path (used by the
    /// compactor, which needs the `compact<ts>-<id>.bin` naming convention).
    pub fn create_at(path: &Path, id: SegmentId) -> Result<Self, SegmentError> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        Ok(Self {
            id,
            path: path.to_path_buf(),
            kind: RwLock::new(SegmentKind::Active),
            index: RwLock::new(HashMap::new()),
            append: Mutex::new(Some(AppendState { file, len: 0 })),
        })
    }

    /// Opens an existing segment file as sealed, rebuilding its index.
    pub fn open_sealed(
        path: PathBuf,
        id: SegmentId,
        kind: SegmentKind,
        meter: &dyn Meter,
    ) -> Result<Self, SegmentError> {
        let index = rebuild_index(&path, id, meter)?;
        Ok(Self {
            id,
            path,
            kind: RwLock::new(kind),
            index: RwLock::new(index),
            append: Mutex::new(None),
        })
    }

    pub fn id(&self) -> SegmentId {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn kind(&self) -> SegmentKind {
        *self.kind.read()
    }

    /// Appends a record, returning the byte offset it was written at.
    pub fn append(&self, record: &Record) -> Result<u64, SegmentError> {
        let mut guard = self.append.lock();
        let state = guard.as_mut().ok_or(SegmentError::Closed)?;

        let offset = state.len;
        let bytes = record.encode();
        state.file.write_all(&bytes)?;
        state.len += bytes.len() as u64;

        self.index.write().insert(record.key.clone(), offset);
        Ok(offset)
    }

    pub fn fsync(&self) -> Result<(), SegmentError> {
        let guard = self.append.lock();
        if let Some(state) = guard.as_ref() {
            state.file.sync_data()?;
        }
        Ok(())
    }

    /// Closes the append handle and seals the segment. Idempotent.
    pub fn seal(&self) {
        *self.append.lock() = None;
        let mut kind = self.kind.write();
        if *kind == SegmentKind::Active {
            *kind = SegmentKind::SealedPlain;
        }
    }

    /// Closes the append handle and seals the segment as a compaction output.
    pub fn seal_as_compacted(&self) {
        *self.append.lock() = None;
        *self.kind.write() = SegmentKind::SealedCompacted;
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        self.index.read().contains_key(key)
    }

    pub fn size_bytes(&self) -> u64 {
        match self.path.metadata() {
            Ok(meta) => meta.len(),
            Err(_) => 0,
        }
    }

    pub fn at_capacity(&self, threshold: u64) -> bool {
        self.size_bytes() >= threshold
    }

    /// Reads the record stored at the indexed offset for `key`.
    ///
    /// Returns `Some(value)` if live, `None` if the most recent record for
    /// the key in this segment is a tombstone.
    pub fn lookup(&self, key: &[u8]) -> Result<Option<Bytes>, SegmentError> {
        let offset = *self
            .index
            .read()
            .get(key)
            .ok_or(SegmentError::NotIndexed)?;
        let record = read_record_at(&self.path, offset)?;
        Ok(if record.tombstone {
            None
        } else {
            Some(record.value)
        })
    }

    /// Reads the record at a given offset directly, for use by the compactor.
    pub fn read_record_at(&self, offset: u64) -> Result<Record, SegmentError> {
        read_record_at(&self.path, offset)
    }

    pub fn delete_file(&self) -> Result<(), SegmentError> {
        std::fs::remove_file(&self.path)?;
        Ok(())
    }
}

fn read_record_at(path: &Path, offset: u64) -> Result<Record, SegmentError> {
    let mut file = File::open(path)?;
    file.seek(SeekFrom::Start(offset))?;
    // A record's header fits well within 4KiB; grow if the key/value are huge.
    let mut buf = vec![0u8; 4096];
    let mut filled = 0usize;
    loop {
        let n = file.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
        if filled < buf.len() {
            break;
        }
        buf.resize(buf.len() * 2, 0);
    }
    buf.truncate(filled);
    let (record, _) = Record::decode(&buf)?;
    Ok(record)
}

/// Rebuilds a segment's key index by scanning its file from the start,
/// resynchronizing one byte at a time past any corrupted or partial record.
/// Each skipped byte emits a `ResyncByte` event through `meter`.
pub fn rebuild_index(
    path: &Path,
    id: SegmentId,
    meter: &dyn Meter,
) -> Result<HashMap<Bytes, u64>, SegmentError> {
    let mut file = File::open(path)?;
    let mut data = Vec::new();
    file.read_to_end(&mut data)?;

    let mut index = HashMap::new();
    let mut pos = 0usize;
    while pos < data.len() {
        match Record::decode(&data[pos..]) {
            Ok((record, consumed)) => {
                index.insert(record.key, pos as u64);
                pos += consumed;
            }
            Err(_) => {
                meter.emit(VizEvent::Segment(SegmentEvt {
                    seg: id.get(),
                    kind: SegmentEvtKind::ResyncByte,
                }));
                pos += 1;
            }
        }
    }
    Ok(index)
}

/// Regex recognizing both plain and compacted segment filenames.
pub fn filename_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^(seg|compact)(\d+)?-(\d+)\.bin$").unwrap())
}

pub fn plain_filename(id: SegmentId) -> String {
    format!("seg-{}.bin", id.get())
}

pub fn compact_filename(timestamp: u64, max_source_id: SegmentId) -> String {
    format!("compact{}-{}.bin", timestamp, max_source_id.get())
}

/// Parses a segment filename into its id and kind, if it matches the
/// recognized naming convention.
pub fn parse_filename(name: &str) -> Option<(SegmentId, SegmentKind)> {
    let caps = filename_pattern().captures(name)?;
    let prefix = &caps[1];
    let id: u64 = caps[3].parse().ok()?;
    let kind = match prefix {
        "seg" => SegmentKind::SealedPlain,
        "compact" => SegmentKind::SealedCompacted,
        _ => return None,
    };
    Some((SegmentId::new(id), kind))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn append_then_lookup_round_trips() {
        let dir = TempDir::new().unwrap();
        let seg = Segment::create_active(dir.path(), SegmentId::new(1)).unwrap();
        seg.append(&Record::put(&b"k"[..], &b"v"[..])).unwrap();
        assert_eq!(seg.lookup(b"k").unwrap(), Some(Bytes::from_static(b"v")));
    }

    #[test]
    fn tombstone_lookup_returns_none() {
        let dir = TempDir::new().unwrap();
        let seg = Segment::create_active(dir.path(), SegmentId::new(1)).unwrap();
        seg.append(&Record::put(&b"k"[..], &b"v"[..])).unwrap();
        seg.append(&Record::delete(&b"k"[..])).unwrap();
        assert_eq!(seg.lookup(b"k").unwrap(), None);
    }

    #[test]
    fn sealed_segment_cannot_append() {
        let dir = TempDir::new().unwrap();
        let seg = Segment::create_active(dir.path(), SegmentId::new(1)).unwrap();
        seg.seal();
        let err = seg.append(&Record::put(&b"k"[..], &b"v"[..])).unwrap_err();
        assert!(matches!(err, SegmentError::Closed));
    }

    #[test]
    fn corrupted_crc_fails_direct_lookup_but_recovery_index_is_empty() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("seg-1.bin");
        let seg = Segment::create_active(dir.path(), SegmentId::new(1)).unwrap();
        seg.append(&Record::put(&b"a"[..], &b"1"[..])).unwrap();

        let mut bytes = std::fs::read(&path).unwrap();
        for b in &mut bytes[0..8] {
            *b = 0;
        }
        std::fs::write(&path, &bytes).unwrap();

        let err = seg.lookup(b"a").unwrap_err();
        assert!(matches!(err, SegmentError::Record(_)));

        let index = rebuild_index(&path, SegmentId::new(1), &nori_observe::NoopMeter).unwrap();
        assert!(index.is_empty());
    }

    #[test]
    fn rebuild_index_skips_corrupted_tail() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("seg-1.bin");
        {
            let seg = Segment::create_active(dir.path(), SegmentId::new(1)).unwrap();
            seg.append(&Record::put(&b"a"[..], &b"1"[..])).unwrap();
        }
        let mut bytes = std::fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        std::fs::write(&path, &bytes).unwrap();

        let index = rebuild_index(&path, SegmentId::new(1), &nori_observe::NoopMeter).unwrap();
        assert!(index.is_empty());
    }

    #[test]
    fn rebuild_index_emits_resync_byte_per_skipped_byte() {
        use nori_observe::{Counter, Gauge, Histogram, VizEvent};
        use std::sync::Mutex;

        struct RecordingMeter {
            events: Mutex<Vec<VizEvent>>,
        }
        impl Meter for RecordingMeter {
            fn counter(&self, _: &'static str, _: &'static [(&'static str, &'static str)]) -> Box<dyn Counter> {
                struct C;
                impl Counter for C {
                    fn inc(&self, _: u64) {}
                }
                Box::new(C)
            }
            fn gauge(&self, _: &'static str, _: &'static [(&'static str, &'static str)]) -> Box<dyn Gauge> {
                struct G;
                impl Gauge for G {
                    fn set(&self, _: i64) {}
                }
                Box::new(G)
            }
            fn histo(
                &self,
                _: &'static str,
                _: &'static [f64],
                _: &'static [(&'static str, &'static str)],
            ) -> Box<dyn Histogram> {
                struct H;
                impl Histogram for H {
                    fn observe(&self, _: f64) {}
                }
                Box::new(H)
            }
            fn emit(&self, evt: VizEvent) {
                self.events.lock().unwrap().push(evt);
            }
        }

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("seg-1.bin");
        {
            let seg = Segment::create_active(dir.path(), SegmentId::new(1)).unwrap();
            seg.append(&Record::put(&b"a"[..], &b"1"[..])).unwrap();
        }
        let mut bytes = std::fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        std::fs::write(&path, &bytes).unwrap();

        let meter = RecordingMeter {
            events: Mutex::new(Vec::new()),
        };
        rebuild_index(&path, SegmentId::new(1), &meter).unwrap();

        let events = meter.events.into_inner().unwrap();
        assert!(!events.is_empty());
        assert!(events.iter().all(|e| matches!(
            e,
            VizEvent::Segment(SegmentEvt {
                kind: SegmentEvtKind::ResyncByte,
                ..
            })
        )));
    }

    #[test]
    fn parses_plain_and_compacted_names() {
        assert_eq!(
            parse_filename("seg-7.bin"),
            Some((SegmentId::new(7), SegmentKind::SealedPlain))
        );
        assert_eq!(
            parse_filename("compact1000-3.bin"),
            Some((SegmentId::new(3), SegmentKind::SealedCompacted))
        );
        assert_eq!(parse_filename("notasegment.txt"), None);
    }
}
