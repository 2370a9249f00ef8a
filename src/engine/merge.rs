//! Merge: rewrites all sealed segments down to their live records,
//! reclaiming the space held by overwritten values and tombstones.

use std::collections::{HashMap, HashSet};
use std::fs::{self, File};
use std::sync::Arc;

use tracing::{debug, info};

use super::{Engine, EngineError, MERGE_DIR};
use crate::index::LogPos;
use crate::record::Key;
use crate::segment::{Segment, segment_path};

impl Engine {
    /// Rewrites every sealed segment down to its live records.
    ///
    /// The surviving records keep their original timestamps and are packed
    /// into fresh segments numbered from 1, staged under the `merge/`
    /// sub-directory and swapped in under the writer-exclusive lock. The
    /// active segment is never touched, and reads and writes stay
    /// available for the whole rewrite phase.
    ///
    /// Returns `Ok(true)` if sealed segments were rewritten, `Ok(false)`
    /// if there was nothing to merge.
    ///
    /// # Crash safety
    ///
    /// Staged files are fsynced before the swap and the swap itself uses
    /// per-file renames. A crash before the swap leaves a staging
    /// directory that the next open removes; a crash mid-swap leaves some
    /// superseded files behind, which is harmless — for every key the
    /// highest replayed segment still holds its newest sealed value — and
    /// a later merge collects them.
    pub fn merge(&self) -> Result<bool, EngineError> {
        if self.config.read_only {
            return Err(EngineError::ReadOnly);
        }

        // 1. Snapshot the sealed segments under a brief read lock. The
        //    rewrite below works on these handles without any lock;
        //    sealed files are immutable.
        let (old_active_id, sealed) = {
            let inner = self.read_lock()?;
            (inner.active.id(), inner.sealed.clone())
        };
        if sealed.is_empty() {
            debug!("merge: no sealed segments");
            return Ok(false);
        }

        // 2. Collect the live entries pointing into the snapshot.
        //    Concurrent writes only target the active segment, so this set
        //    can shrink (overwrites, deletes) but never grow.
        let mut live: Vec<(Key, LogPos)> = Vec::new();
        self.index.iterate(&mut |key, pos| {
            if sealed.contains_key(&pos.segment_id) {
                live.push((key, pos));
            }
        })?;

        // 3. Ascending (segment id, offset) is write order. It also bounds
        //    the output count: one input segment's live records total at
        //    most one segment budget, so packing opens at most one output
        //    per input and the fresh ids stay below the active id.
        live.sort_unstable_by_key(|&(_, pos)| (pos.segment_id, pos.offset));

        // 4. Rewrite the live records into staged segments, preserving
        //    each record's original timestamp.
        let staging = self.dir.join(MERGE_DIR);
        fs::create_dir_all(&staging)?;

        let mut outputs: Vec<Segment> = Vec::new();
        let mut moves: Vec<(Key, LogPos, LogPos)> = Vec::new();
        for (key, old_pos) in live {
            let Some(source) = sealed.get(&old_pos.segment_id) else {
                return Err(EngineError::Internal(format!(
                    "merge source segment {} vanished from snapshot",
                    old_pos.segment_id
                )));
            };

            let record = source.read_with_size(old_pos.offset, old_pos.value_size)?;
            let encoded = record.encode();

            let needs_new = match outputs.last() {
                None => true,
                Some(out) => {
                    out.current_size() + encoded.len() as u64 > self.config.max_file_size
                }
            };
            if needs_new {
                let id = outputs.len() as u32 + 1;
                outputs.push(Segment::open(&staging, id, false)?);
            }
            let Some(out) = outputs.last() else {
                return Err(EngineError::Internal("merge output segment missing".into()));
            };

            let offset = out.append(&encoded)?;
            moves.push((
                key,
                old_pos,
                LogPos {
                    segment_id: out.id(),
                    value_size: old_pos.value_size,
                    offset,
                    timestamp: old_pos.timestamp,
                },
            ));
        }
        for out in &outputs {
            out.flush()?;
        }

        debug!(
            inputs = sealed.len(),
            outputs = outputs.len(),
            records = moves.len(),
            "merge rewrite complete"
        );

        // 5. Swap under the writer-exclusive lock: rename the outputs over
        //    their final names, retarget the index, replace the snapshot's
        //    entries in the sealed map, then delete whatever the outputs
        //    did not overwrite.
        let mut inner = self.write_lock()?;

        let mut merged: HashMap<u32, Arc<Segment>> = HashMap::new();
        for out in &outputs {
            let id = out.id();
            fs::rename(out.path(), segment_path(&self.dir, id))?;
            merged.insert(id, Arc::new(Segment::open(&self.dir, id, true)?));
        }

        // Entries overwritten or deleted during the rewrite keep their
        // newer position; only untouched ones move.
        for (key, old_pos, new_pos) in moves {
            if self.index.get(key)? == Some(old_pos) {
                self.index.put(key, new_pos)?;
            }
        }

        // Sealed segments created by rotations during the rewrite are not
        // part of the snapshot and stay as they are.
        let output_ids: HashSet<u32> = merged.keys().copied().collect();
        for id in sealed.keys() {
            inner.sealed.remove(id);
        }
        let output_count = merged.len();
        inner.sealed.extend(merged);

        for &id in sealed.keys() {
            if !output_ids.contains(&id) {
                fs::remove_file(segment_path(&self.dir, id))?;
            }
        }

        fs::remove_dir_all(&staging)?;
        File::open(&self.dir)?.sync_all()?;

        drop(inner);

        info!(
            inputs = sealed.len(),
            outputs = output_count,
            active_id = old_active_id,
            "merged sealed segments"
        );

        Ok(true)
    }
}
