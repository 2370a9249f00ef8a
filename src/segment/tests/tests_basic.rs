//! Basic segment tests: append/read round trips, reopen behavior, the
//! replay iterator, and file naming.

#[cfg(test)]
mod tests {
    use crate::record::{LOG_HEADER_SIZE, LogRecord, RecordKind};
    use crate::segment::{Segment, parse_segment_id, segment_path};
    use std::path::Path;
    use tempfile::TempDir;
    use tracing_subscriber::EnvFilter;

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    fn write_record(segment: &Segment, key: i32, value: &[u8], timestamp: i64) -> u64 {
        let record = LogRecord::new(key, value.to_vec(), RecordKind::Write, timestamp);
        segment.append(&record.encode()).unwrap()
    }

    // ============================================================================================
    // Round trips
    // ============================================================================================

    /// # Scenario
    ///
    /// Append one record to a fresh segment and read it back at the
    /// returned offset.
    ///
    /// # Expected behavior
    ///
    /// All fields round-trip; the append offset is 0 and the cursor
    /// advances by the full record size.
    #[test]
    fn test_append_then_read() {
        init_tracing();

        let tmp = TempDir::new().unwrap();
        let segment = Segment::open(tmp.path(), 1, false).unwrap();

        let record = LogRecord::new(111, b"test_value1".to_vec(), RecordKind::Write, 42);
        let encoded = record.encode();
        let offset = segment.append(&encoded).unwrap();

        assert_eq!(offset, 0);
        assert_eq!(segment.current_size(), encoded.len() as u64);

        let read = segment.read(offset).unwrap();
        assert_eq!(read.key, 111);
        assert_eq!(read.value, b"test_value1");
        assert_eq!(read.kind, RecordKind::Write);
        assert_eq!(read.timestamp, 42);
    }

    /// # Scenario
    ///
    /// Write a record, drop the segment, reopen it read-write, append a
    /// second record, then read both.
    ///
    /// # Expected behavior
    ///
    /// Reopening places the cursor at the end of the file, so the second
    /// record lands after the first and both read back intact.
    #[test]
    fn test_reopen_appends_after_existing_records() {
        init_tracing();

        let tmp = TempDir::new().unwrap();

        let first_len;
        {
            let segment = Segment::open(tmp.path(), 1, false).unwrap();
            write_record(&segment, 111, b"test_value1", 1);
            first_len = segment.current_size();
        }

        let segment = Segment::open(tmp.path(), 1, false).unwrap();
        assert_eq!(segment.current_size(), first_len);

        let second_offset = write_record(&segment, 222, b"test_value2", 2);
        assert_eq!(second_offset, first_len);

        let first = segment.read(0).unwrap();
        assert_eq!(first.key, 111);
        assert_eq!(first.value, b"test_value1");

        let second = segment.read(second_offset).unwrap();
        assert_eq!(second.key, 222);
        assert_eq!(second.value, b"test_value2");
    }

    /// # Scenario
    ///
    /// Read a record with `read_with_size` using the value size recorded
    /// at append time.
    ///
    /// # Expected behavior
    ///
    /// The single-read path returns the same record as the two-read path.
    #[test]
    fn test_read_with_size_matches_read() {
        init_tracing();

        let tmp = TempDir::new().unwrap();
        let segment = Segment::open(tmp.path(), 1, false).unwrap();

        let offset = write_record(&segment, 7, b"sized read", 9);

        let a = segment.read(offset).unwrap();
        let b = segment.read_with_size(offset, b"sized read".len() as u16).unwrap();
        assert_eq!(a.key, b.key);
        assert_eq!(a.value, b.value);
        assert_eq!(a.timestamp, b.timestamp);
    }

    /// # Scenario
    ///
    /// Append a tombstone and read it back.
    ///
    /// # Expected behavior
    ///
    /// The record kind is `Delete` and the value is empty.
    #[test]
    fn test_tombstone_round_trip() {
        init_tracing();

        let tmp = TempDir::new().unwrap();
        let segment = Segment::open(tmp.path(), 1, false).unwrap();

        let tombstone = LogRecord::tombstone(111, 77);
        let offset = segment.append(&tombstone.encode()).unwrap();
        assert_eq!(segment.current_size(), LOG_HEADER_SIZE as u64 + 4);

        let read = segment.read(offset).unwrap();
        assert_eq!(read.kind, RecordKind::Delete);
        assert_eq!(read.key, 111);
        assert!(read.value.is_empty());
        assert_eq!(read.timestamp, 77);
    }

    // ============================================================================================
    // Replay iterator
    // ============================================================================================

    /// # Scenario
    ///
    /// Append three records and walk the segment with `replay_iter`.
    ///
    /// # Expected behavior
    ///
    /// The iterator yields all records in append order with the offsets
    /// `append` returned, then terminates cleanly.
    #[test]
    fn test_replay_iter_yields_records_in_order() {
        init_tracing();

        let tmp = TempDir::new().unwrap();
        let segment = Segment::open(tmp.path(), 1, false).unwrap();

        let mut expected = Vec::new();
        for (i, key) in [111, 222, 333].into_iter().enumerate() {
            let value = format!("value-{key}");
            let offset = write_record(&segment, key, value.as_bytes(), i as i64);
            expected.push((offset, key, value));
        }

        let replayed: Vec<_> = segment
            .replay_iter()
            .collect::<Result<Vec<_>, _>>()
            .unwrap();

        assert_eq!(replayed.len(), 3);
        for ((offset, record), (want_offset, want_key, want_value)) in
            replayed.iter().zip(&expected)
        {
            assert_eq!(offset, want_offset);
            assert_eq!(record.key, *want_key);
            assert_eq!(record.value, want_value.as_bytes());
        }
    }

    /// # Scenario
    ///
    /// Replay an empty segment.
    ///
    /// # Expected behavior
    ///
    /// The iterator yields nothing and no error.
    #[test]
    fn test_replay_iter_empty_segment() {
        init_tracing();

        let tmp = TempDir::new().unwrap();
        let segment = Segment::open(tmp.path(), 1, false).unwrap();

        assert_eq!(segment.replay_iter().count(), 0);
    }

    // ============================================================================================
    // Open modes and naming
    // ============================================================================================

    /// # Scenario
    ///
    /// Open a segment read-only after writing it read-write.
    ///
    /// # Expected behavior
    ///
    /// Reads work; the read-only flag is reported; the cursor equals the
    /// file length.
    #[test]
    fn test_read_only_open_of_existing_segment() {
        init_tracing();

        let tmp = TempDir::new().unwrap();
        let size;
        {
            let segment = Segment::open(tmp.path(), 3, false).unwrap();
            write_record(&segment, 111, b"sealed", 5);
            size = segment.current_size();
        }

        let sealed = Segment::open(tmp.path(), 3, true).unwrap();
        assert!(sealed.is_read_only());
        assert_eq!(sealed.current_size(), size);
        assert_eq!(sealed.read(0).unwrap().value, b"sealed");
    }

    /// # Scenario
    ///
    /// Open a segment read-only when no file exists for that id.
    ///
    /// # Expected behavior
    ///
    /// The open fails with an I/O error instead of creating the file.
    #[test]
    fn test_read_only_open_of_missing_segment_fails() {
        init_tracing();

        let tmp = TempDir::new().unwrap();
        assert!(Segment::open(tmp.path(), 9, true).is_err());
        assert!(!segment_path(tmp.path(), 9).exists());
    }

    /// # Scenario
    ///
    /// Build segment paths and parse ids back out of file names.
    ///
    /// # Expected behavior
    ///
    /// Paths follow `<id>.data`; parsing accepts exactly positive decimal
    /// ids with that extension.
    #[test]
    fn test_segment_naming() {
        assert_eq!(segment_path(Path::new("/db"), 1), Path::new("/db/1.data"));
        assert_eq!(
            segment_path(Path::new("/db"), 25),
            Path::new("/db/25.data")
        );

        assert_eq!(parse_segment_id("1.data"), Some(1));
        assert_eq!(parse_segment_id("25.data"), Some(25));
        assert_eq!(parse_segment_id("4294967295.data"), Some(u32::MAX));

        assert_eq!(parse_segment_id("0.data"), None);
        assert_eq!(parse_segment_id("01.data"), None);
        assert_eq!(parse_segment_id("+1.data"), None);
        assert_eq!(parse_segment_id("-1.data"), None);
        assert_eq!(parse_segment_id("1.log"), None);
        assert_eq!(parse_segment_id("1"), None);
        assert_eq!(parse_segment_id("abc.data"), None);
        assert_eq!(parse_segment_id("1x.data"), None);
        assert_eq!(parse_segment_id(".data"), None);
        assert_eq!(parse_segment_id("LOCK"), None);
    }
}
