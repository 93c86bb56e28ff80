//! Background merge of sealed segments into one compacted segment.

use crate::error::StorageError;
use crate::segment::{self, compact_filename, Segment, SegmentKind};
use nori_observe::{CompEvt, CompKind, Meter, VizEvent};
use norikv_types::SegmentId;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::mpsc::Receiver;
use std::sync::Arc;

/// Runs the compactor's receive loop until the trigger channel closes.
///
/// Each wakeup runs at most one pass; rapid repeated signals coalesce
/// because the trigger is a capacity-1 channel.
pub fn run(
    dir: Arc<Path>,
    segments: Arc<RwLock<BTreeMap<SegmentId, Arc<Segment>>>>,
    active_id: Arc<parking_lot::Mutex<SegmentId>>,
    meter: Arc<dyn Meter>,
    rx: Receiver<()>,
) {
    while rx.recv().is_ok() {
        let active = *active_id.lock();
        if let Err(err) = run_once(&dir, &segments, active, meter.as_ref()) {
            tracing::error!(error = %err, "compaction pass abandoned");
        }
    }
}

/// Merges every sealed segment (everything but `active_id`) into one new
/// compacted segment, then deletes the absorbed inputs.
pub fn run_once(
    dir: &Path,
    segments: &RwLock<BTreeMap<SegmentId, Arc<Segment>>>,
    active_id: SegmentId,
    meter: &dyn Meter,
) -> Result<(), StorageError> {
    let inputs: Vec<Arc<Segment>> = {
        let map = segments.read();
        map.iter()
            .filter(|(id, _)| **id != active_id)
            .map(|(_, seg)| seg.clone())
            .collect()
    };

    if inputs.len() < 2 {
        meter.emit(VizEvent::Compaction(CompEvt {
            kind: CompKind::Scheduled,
        }));
        return Ok(());
    }

    meter.emit(VizEvent::Compaction(CompEvt {
        kind: CompKind::Start {
            inputs: inputs.len(),
        },
    }));

    let max_input_id = inputs.iter().map(|s| s.id()).max().unwrap();

    // Rebuild each input's index straight from disk rather than trusting the
    // live, already-held index: a sealed segment's bytes can rot after it was
    // sealed but before a pass notices, and a fresh rebuild applies the same
    // resync-and-skip recovery every other scan gets instead of aborting.
    //
    // Later inputs (higher id) shadow earlier ones for the same key.
    let mut most_recent: std::collections::HashMap<bytes::Bytes, (u64, &Arc<Segment>)> =
        std::collections::HashMap::new();
    for input in &inputs {
        let fresh = segment::rebuild_index(input.path(), input.id(), meter)?;
        for (key, offset) in fresh {
            most_recent.insert(key, (offset, input));
        }
    }

    let timestamp = wall_clock_millis();
    let new_path = dir.join(compact_filename(timestamp, max_input_id));
    let new_segment = Segment::create_at(&new_path, max_input_id)?;

    let mut in_bytes = 0u64;
    for input in &inputs {
        in_bytes += input.size_bytes();
    }

    for (key, (offset, source)) in &most_recent {
        match source.read_record_at(*offset) {
            Ok(record) => new_segment.append(&record)?,
            Err(err) => {
                tracing::warn!(
                    segment = %source.id(),
                    key = ?key,
                    error = %err,
                    "skipping unreadable record during compaction"
                );
            }
        }
    }
    new_segment.fsync()?;
    new_segment.seal_as_compacted();

    let out_bytes = new_segment.size_bytes();
    let new_segment = Arc::new(new_segment);

    {
        let mut map = segments.write();
        map.insert(max_input_id, new_segment);
        let stale_ids: Vec<SegmentId> = map
            .keys()
            .copied()
            .filter(|id| *id < max_input_id)
            .collect();
        for id in stale_ids {
            map.remove(&id);
        }
    }

    for input in &inputs {
        if let Err(err) = input.delete_file() {
            tracing::warn!(segment = %input.id(), error = %err, "failed to delete absorbed segment");
        }
    }

    meter.emit(VizEvent::Compaction(CompEvt {
        kind: CompKind::Finish { in_bytes, out_bytes },
    }));
    Ok(())
}

fn wall_clock_millis() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
