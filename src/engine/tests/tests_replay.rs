//! Replay tests — rebuilding the index across close → reopen.
//!
//! The index is never persisted; every open replays the segment files in
//! ascending id order and applies records in file order. These tests pin
//! the consequences: reopening is deterministic, the last writer wins
//! across any number of rotations, tombstones survive restarts, and a torn
//! trailing record (a crash mid-append) is dropped instead of poisoning
//! the store.
//!
//! ## See also
//! - [`tests_corruption`] — replay aborting on checksum failures
//! - [`tests_rotation`] — how records spread over segments

#[cfg(test)]
#[allow(non_snake_case)]
mod tests {
    use crate::engine::{Engine, EngineError};
    use crate::engine::tests::helpers::*;
    use crate::record::{LogRecord, RecordKind, now_micros};
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::TempDir;

    /// Appends raw bytes to a segment file, bypassing the engine.
    fn append_raw(path: &std::path::Path, bytes: &[u8]) {
        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .open(path)
            .unwrap();
        file.write_all(bytes).unwrap();
    }

    // ----------------------------------------------------------------
    // Reopen equivalence
    // ----------------------------------------------------------------

    /// # Scenario
    /// A store with puts, overwrites, and deletes spread over many
    /// segments is closed and reopened twice.
    ///
    /// # Starting environment
    /// 128-byte budget; 30 keys inserted, 10 overwritten, 5 deleted —
    /// roughly a dozen segments.
    ///
    /// # Actions
    /// 1. Build the store and record the expected key → value map.
    /// 2. Drop and reopen; compare the full content.
    /// 3. Drop and reopen once more; compare again.
    ///
    /// # Expected behavior
    /// Every reopen reconstructs exactly the same live set — replay is
    /// deterministic and lossless.
    #[test]
    fn replay__reopen_reconstructs_identical_state() {
        let tmp = TempDir::new().unwrap();
        let engine = engine_with_records(tmp.path(), small_segment_config(), 30);
        for key in 0..10 {
            engine.put(key, b"rewritten".to_vec()).unwrap();
        }
        for key in 20..25 {
            engine.delete(key).unwrap();
        }

        let mut expected = HashMap::new();
        for key in (0..20).chain(25..30) {
            expected.insert(key, engine.get(key).unwrap());
        }
        drop(engine);

        for _ in 0..2 {
            let engine = Engine::open(tmp.path(), small_segment_config()).unwrap();

            let mut keys = engine.list_keys().unwrap();
            keys.sort_unstable();
            let mut expected_keys: Vec<_> = expected.keys().copied().collect();
            expected_keys.sort_unstable();
            assert_eq!(keys, expected_keys);

            for (&key, value) in &expected {
                assert_eq!(engine.get(key).unwrap(), *value, "key {key}");
            }
            for key in 20..25 {
                assert!(matches!(engine.get(key), Err(EngineError::KeyNotFound(_))));
            }
            drop(engine);
        }
    }

    /// # Scenario
    /// The newest overwrite of a key wins after reopen, even when older
    /// copies live in earlier segments.
    ///
    /// # Starting environment
    /// 128-byte budget; one key overwritten ten times (three segments).
    ///
    /// # Actions
    /// 1. Put key `1` with generations `0..10`, drop, reopen.
    ///
    /// # Expected behavior
    /// `get(1)` returns generation 9 — ascending (segment, offset) replay
    /// order equals write order.
    #[test]
    fn replay__last_writer_wins_after_reopen() {
        let tmp = TempDir::new().unwrap();
        let engine = Engine::open(tmp.path(), small_segment_config()).unwrap();
        for generation in 0u8..10 {
            engine.put(1, vec![generation; 8]).unwrap();
        }
        drop(engine);

        let engine = Engine::open(tmp.path(), small_segment_config()).unwrap();
        assert_eq!(engine.get(1).unwrap(), vec![9u8; 8]);
        assert_eq!(engine.list_keys().unwrap(), vec![1]);
    }

    /// # Scenario
    /// Tombstones replay too: a key deleted before close stays deleted.
    ///
    /// # Starting environment
    /// 128-byte budget; key 0's record is sealed into segment 1 before
    /// its tombstone lands in a later segment.
    ///
    /// # Actions
    /// 1. Put keys `0..8`, delete key `0`, drop, reopen.
    ///
    /// # Expected behavior
    /// After reopen key 0 is gone and the remaining keys are intact; the
    /// tombstone in the higher segment suppresses the sealed write.
    #[test]
    fn replay__tombstone_survives_reopen() {
        let tmp = TempDir::new().unwrap();
        let engine = engine_with_records(tmp.path(), small_segment_config(), 8);
        engine.delete(0).unwrap();
        drop(engine);

        let engine = Engine::open(tmp.path(), small_segment_config()).unwrap();
        assert!(matches!(engine.get(0), Err(EngineError::KeyNotFound(0))));
        for key in 1..8 {
            assert_eq!(engine.get(key).unwrap(), value_for(key), "key {key}");
        }
    }

    // ----------------------------------------------------------------
    // Torn tails — crash mid-append
    // ----------------------------------------------------------------

    /// # Scenario
    /// The active segment ends in a partial header (crash before the
    /// header hit the disk completely).
    ///
    /// # Starting environment
    /// Store with two complete records; 10 garbage bytes appended to the
    /// active file behind the engine's back.
    ///
    /// # Actions
    /// 1. Reopen read-write.
    /// 2. Put one more key.
    ///
    /// # Expected behavior
    /// The open truncates the file back to the last record boundary
    /// (56 bytes), both old keys survive, and the new record lands on a
    /// clean boundary.
    #[test]
    fn replay__torn_header_is_truncated_on_reopen() {
        let tmp = TempDir::new().unwrap();
        let engine = Engine::open(tmp.path(), small_segment_config()).unwrap();
        engine.put(1, value_for(1)).unwrap();
        engine.put(2, value_for(2)).unwrap();
        drop(engine);

        let segment = tmp.path().join("1.data");
        append_raw(&segment, &[0xFF; 10]);
        assert_eq!(std::fs::metadata(&segment).unwrap().len(), 66);

        let engine = Engine::open(tmp.path(), small_segment_config()).unwrap();
        assert_eq!(std::fs::metadata(&segment).unwrap().len(), 56);

        engine.put(3, value_for(3)).unwrap();
        for key in 1..4 {
            assert_eq!(engine.get(key).unwrap(), value_for(key), "key {key}");
        }
        assert_eq!(std::fs::metadata(&segment).unwrap().len(), 84);
    }

    /// # Scenario
    /// The active segment ends in a complete header whose payload is cut
    /// short (crash between header and payload).
    ///
    /// # Starting environment
    /// Store with one complete record, then the first 20 bytes of a valid
    /// encoded record appended raw.
    ///
    /// # Actions
    /// 1. Reopen read-write.
    ///
    /// # Expected behavior
    /// The torn record is dropped (file truncated to 28 bytes), the
    /// complete record survives, and the half-written key never appears.
    #[test]
    fn replay__torn_payload_is_truncated_on_reopen() {
        let tmp = TempDir::new().unwrap();
        let engine = Engine::open(tmp.path(), small_segment_config()).unwrap();
        engine.put(1, value_for(1)).unwrap();
        drop(engine);

        let torn = LogRecord::new(9, vec![7; 8], RecordKind::Write, now_micros()).encode();
        let segment = tmp.path().join("1.data");
        append_raw(&segment, &torn[..20]);

        let engine = Engine::open(tmp.path(), small_segment_config()).unwrap();
        assert_eq!(std::fs::metadata(&segment).unwrap().len(), 28);
        assert_eq!(engine.get(1).unwrap(), value_for(1));
        assert!(matches!(engine.get(9), Err(EngineError::KeyNotFound(9))));
    }

    /// # Scenario
    /// A read-only open of a store with a torn tail.
    ///
    /// # Starting environment
    /// Store with two complete records plus a partial header.
    ///
    /// # Actions
    /// 1. Open the store read-only.
    ///
    /// # Expected behavior
    /// The open succeeds and serves the complete records; the file is not
    /// modified (read-only mode never truncates).
    #[test]
    fn replay__read_only_serves_valid_prefix_without_truncating() {
        let tmp = TempDir::new().unwrap();
        let engine = Engine::open(tmp.path(), small_segment_config()).unwrap();
        engine.put(1, value_for(1)).unwrap();
        engine.put(2, value_for(2)).unwrap();
        drop(engine);

        let segment = tmp.path().join("1.data");
        append_raw(&segment, &[0xAA; 5]);

        let reader = Engine::open(tmp.path(), read_only_config()).unwrap();
        assert_eq!(reader.get(1).unwrap(), value_for(1));
        assert_eq!(reader.get(2).unwrap(), value_for(2));
        assert_eq!(std::fs::metadata(&segment).unwrap().len(), 61);
    }
}
