//! Top-level embedded key-value database: a ring of segments plus recovery,
//! rolling, and a background compactor.

use crate::compactor;
use crate::config::{FsyncPolicy, StorageConfig};
use crate::error::StorageError;
use crate::record::Record;
use crate::segment::{parse_filename, Segment, SegmentKind};
use bytes::Bytes;
use nori_observe::{Meter, NoopMeter, SegmentEvt, SegmentEvtKind, VizEvent};
use norikv_types::SegmentId;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{sync_channel, SyncSender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

/// An embedded, single-node, persistent key-value store.
pub struct Database {
    dir: PathBuf,
    max_segment_size: u64,
    fsync_policy: FsyncPolicy,
    meter: Arc<dyn Meter>,
    segments: Arc<RwLock<BTreeMap<SegmentId, Arc<Segment>>>>,
    active_id: Arc<Mutex<SegmentId>>,
    last_fsync: Mutex<Instant>,
    trigger: Mutex<Option<SyncSender<()>>>,
    compactor_thread: Mutex<Option<JoinHandle<()>>>,
}

impl Database {
    /// Opens (creating if necessary) a database at `config.dir`, replaying
    /// any existing segments and starting the background compactor.
    pub fn open(config: StorageConfig) -> Result<Self, StorageError> {
        Self::open_with_meter(config, Arc::new(NoopMeter))
    }

    pub fn open_with_meter(config: StorageConfig, meter: Arc<dyn Meter>) -> Result<Self, StorageError> {
        std::fs::create_dir_all(&config.dir)?;

        let mut segments = BTreeMap::new();
        let mut max_id = 0u64;
        let mut recovered_any = false;

        let mut entries: Vec<_> = std::fs::read_dir(&config.dir)?.collect::<Result<_, _>>()?;
        entries.sort_by_key(|e| e.file_name());
        for entry in entries {
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some((id, kind)) = parse_filename(&name) {
                let seg = Segment::open_sealed(entry.path(), id, kind, meter.as_ref())?;
                max_id = max_id.max(id.get());
                segments.insert(id, Arc::new(seg));
                recovered_any = true;
            }
        }

        let active_id = SegmentId::new(max_id + 1);
        let active = Segment::create_active(&config.dir, active_id)?;
        segments.insert(active_id, Arc::new(active));

        let segments = Arc::new(RwLock::new(segments));
        let active_id_cell = Arc::new(Mutex::new(active_id));
        let (tx, rx) = sync_channel::<()>(1);

        let thread = {
            let dir: Arc<Path> = Arc::from(config.dir.as_path());
            let segments = segments.clone();
            let active_id_cell = active_id_cell.clone();
            let meter = meter.clone();
            thread::spawn(move || compactor::run(dir, segments, active_id_cell, meter, rx))
        };

        let db = Self {
            dir: config.dir.clone(),
            max_segment_size: config.max_segment_size,
            fsync_policy: config.fsync_policy,
            meter,
            segments,
            active_id: active_id_cell,
            last_fsync: Mutex::new(Instant::now()),
            trigger: Mutex::new(Some(tx)),
            compactor_thread: Mutex::new(Some(thread)),
        };

        if recovered_any {
            db.compact();
        }

        tracing::info!(dir = %db.dir.display(), "database started");
        Ok(db)
    }

    /// Stops the background compactor and seals every segment. Idempotent.
    pub fn stop(&self) {
        tracing::info!("database stopping");
        self.trigger.lock().take();
        if let Some(handle) = self.compactor_thread.lock().take() {
            if handle.join().is_err() {
                tracing::warn!("compactor thread panicked");
            }
        }
        for seg in self.segments.read().values() {
            if let Err(err) = seg.fsync() {
                tracing::warn!(segment = %seg.id(), error = %err, "ignoring close failure");
            }
            seg.seal();
        }
    }

    /// Looks up a key. Returns `None` both when the key was never written
    /// and when its most recent record is a tombstone.
    pub fn read(&self, key: &[u8]) -> Result<Option<Bytes>, StorageError> {
        let segments = self.segments.read();
        for seg in segments.values().rev() {
            if seg.contains(key) {
                return Ok(seg.lookup(key)?);
            }
            if seg.kind() == SegmentKind::SealedCompacted {
                // A compacted segment is a closed world for every id at or
                // below its max source: if the key isn't here, it's nowhere.
                return Ok(None);
            }
        }
        Ok(None)
    }

    pub fn write(&self, key: impl Into<Bytes>, value: impl Into<Bytes>) -> Result<(), StorageError> {
        self.append_record(Record::put(key.into(), value.into()))
    }

    pub fn delete(&self, key: impl Into<Bytes>) -> Result<(), StorageError> {
        self.append_record(Record::delete(key.into()))
    }

    /// Signals the background compactor to run a pass. Coalesces with any
    /// pending signal that hasn't been picked up yet.
    pub fn compact(&self) {
        if let Some(tx) = self.trigger.lock().as_ref() {
            let _ = tx.try_send(());
        }
    }

    fn append_record(&self, record: Record) -> Result<(), StorageError> {
        let mut segments = self.segments.write();
        let active_id = *self.active_id.lock();
        let active = segments
            .get(&active_id)
            .expect("active segment is always present")
            .clone();

        active.append(&record)?;
        self.maybe_fsync(&active)?;

        if active.at_capacity(self.max_segment_size) {
            self.roll(&mut segments, active_id)?;
        }
        Ok(())
    }

    fn maybe_fsync(&self, active: &Segment) -> Result<(), StorageError> {
        match self.fsync_policy {
            FsyncPolicy::Always => active.fsync()?,
            FsyncPolicy::Batch(window) => {
                let mut last = self.last_fsync.lock();
                if last.elapsed() >= window {
                    active.fsync()?;
                    *last = Instant::now();
                }
            }
            FsyncPolicy::Os => {}
        }
        Ok(())
    }

    fn roll(
        &self,
        segments: &mut BTreeMap<SegmentId, Arc<Segment>>,
        old_id: SegmentId,
    ) -> Result<(), StorageError> {
        let old = segments.get(&old_id).unwrap().clone();
        let bytes = old.size_bytes();
        old.seal();

        let new_id = old_id.next();
        let new_segment = Segment::create_active(&self.dir, new_id)?;
        segments.insert(new_id, Arc::new(new_segment));
        *self.active_id.lock() = new_id;

        self.meter.emit(VizEvent::Segment(SegmentEvt {
            seg: old_id.get(),
            kind: SegmentEvtKind::Roll { bytes },
        }));
        tracing::debug!(segment = %old_id, new_segment = %new_id, bytes, "segment rolled");

        self.compact();
        Ok(())
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open(dir: &TempDir) -> Database {
        Database::open(StorageConfig::new(dir.path())).unwrap()
    }

    fn open_with_threshold(dir: &TempDir, threshold: u64) -> Database {
        Database::open(StorageConfig::new(dir.path()).max_segment_size(threshold)).unwrap()
    }

    #[test]
    fn round_trip() {
        let dir = TempDir::new().unwrap();
        let db = open(&dir);
        db.write(&b"hello"[..], &b"world"[..]).unwrap();
        assert_eq!(db.read(b"hello").unwrap(), Some(Bytes::from_static(b"world")));
    }

    #[test]
    fn most_recent_write_wins() {
        let dir = TempDir::new().unwrap();
        let db = open(&dir);
        db.write(&b"a"[..], &b"1"[..]).unwrap();
        db.write(&b"a"[..], &b"2"[..]).unwrap();
        assert_eq!(db.read(b"a").unwrap(), Some(Bytes::from_static(b"2")));
    }

    #[test]
    fn tombstone_then_rewrite() {
        let dir = TempDir::new().unwrap();
        let db = open(&dir);
        db.write(&b"a"[..], &b"1"[..]).unwrap();
        db.write(&b"a"[..], &b"2"[..]).unwrap();
        db.delete(&b"a"[..]).unwrap();
        assert_eq!(db.read(b"a").unwrap(), None);
        db.write(&b"a"[..], &b"3"[..]).unwrap();
        assert_eq!(db.read(b"a").unwrap(), Some(Bytes::from_static(b"3")));
    }

    #[test]
    fn rolls_over_small_segments() {
        let dir = TempDir::new().unwrap();
        let db = open_with_threshold(&dir, 50);
        for i in 0..10 {
            let key = format!("k{:02}", i);
            db.write(key.into_bytes(), vec![b'x'; 20]).unwrap();
        }
        assert_eq!(
            db.read(b"k00").unwrap(),
            Some(Bytes::from(vec![b'x'; 20]))
        );
        let segment_count = db.segments.read().len();
        assert!(segment_count > 1);
    }

    #[test]
    fn persists_across_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let db = open(&dir);
            db.write(&b"a"[..], &b"1"[..]).unwrap();
            db.write(&b"b"[..], &b"2"[..]).unwrap();
            db.stop();
        }
        let db = open(&dir);
        assert_eq!(db.read(b"a").unwrap(), Some(Bytes::from_static(b"1")));
        assert_eq!(db.read(b"b").unwrap(), Some(Bytes::from_static(b"2")));
    }

    #[test]
    fn compaction_preserves_reads() {
        let dir = TempDir::new().unwrap();
        // Threshold of 1 forces every single append into its own sealed
        // segment, guaranteeing at least two sealed segments to merge.
        let db = open_with_threshold(&dir, 1);
        db.write(&b"a"[..], &b"x"[..]).unwrap();
        db.write(&b"b"[..], &b"y"[..]).unwrap();
        db.delete(&b"a"[..]).unwrap();
        db.compact();
        // Give the background compactor a moment to run its pass.
        thread::sleep(std::time::Duration::from_millis(200));
        assert_eq!(db.read(b"a").unwrap(), None);
        assert_eq!(db.read(b"b").unwrap(), Some(Bytes::from_static(b"y")));
    }
}
