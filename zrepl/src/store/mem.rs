//! Sparse in-memory block-store engine.
//!
//! Data is kept as a run map keyed by byte offset, each run remembering
//! the io number it was written with. That makes the metadata diff walk
//! and rebuild conflict resolution exact without backing the full volume
//! with real memory, so tests can use multi-GiB volumes freely.

use std::collections::BTreeMap;

use parking_lot::Mutex;
use snafu::ensure;

use super::{BlockStore, DiffVisitor, MetaRun, OutOfRange, StoreError};

#[derive(Debug, Clone)]
struct Run {
    data: Vec<u8>,
    io_num: u64,
}

impl Run {
    fn end(&self, offset: u64) -> u64 {
        offset + self.data.len() as u64
    }
}

#[derive(Debug, Default)]
struct Inner {
    runs: BTreeMap<u64, Run>,
    last_committed: u64,
}

pub struct MemStore {
    size: u64,
    inner: Mutex<Inner>,
}

impl MemStore {
    pub fn new(size: u64) -> Self {
        Self {
            size,
            inner: Mutex::new(Inner::default()),
        }
    }

    fn check_range(&self, offset: u64, len: u64) -> Result<(), StoreError> {
        let end = offset.checked_add(len);
        ensure!(
            end.map(|e| e <= self.size).unwrap_or(false),
            OutOfRange {
                offset,
                len,
                size: self.size
            }
        );
        Ok(())
    }
}

impl Inner {
    /// Insert a run, trimming or splitting whatever it overlaps.
    fn apply(&mut self, offset: u64, data: &[u8], io_num: u64) {
        let end = offset + data.len() as u64;
        let affected: Vec<u64> = self
            .runs
            .range(.. end)
            .filter(|(&off, run)| run.end(off) > offset)
            .map(|(&off, _)| off)
            .collect();

        for off in affected {
            let run = self.runs.remove(&off).unwrap();
            let run_end = run.end(off);
            if off < offset {
                let keep = (offset - off) as usize;
                self.runs.insert(
                    off,
                    Run {
                        data: run.data[.. keep].to_vec(),
                        io_num: run.io_num,
                    },
                );
            }
            if run_end > end {
                let skip = (end - off) as usize;
                self.runs.insert(
                    end,
                    Run {
                        data: run.data[skip ..].to_vec(),
                        io_num: run.io_num,
                    },
                );
            }
        }

        self.runs.insert(
            offset,
            Run {
                data: data.to_vec(),
                io_num,
            },
        );
    }

    /// The portions of `[offset, offset + len)` that a rebuild write with
    /// `io_num` is allowed to touch: everything not already covered by a
    /// run stamped with the same or a newer io number.
    fn writable_segments(
        &self,
        offset: u64,
        data: &[u8],
        io_num: u64,
    ) -> Vec<(u64, Vec<u8>)> {
        let end = offset + data.len() as u64;
        let mut segments = vec![(offset, data.to_vec())];

        for (&off, run) in self.runs.range(.. end) {
            let run_end = run.end(off);
            if run_end <= offset || run.io_num < io_num {
                continue;
            }
            segments = segments
                .into_iter()
                .flat_map(|(seg_off, seg)| {
                    subtract(seg_off, seg, off, run_end)
                })
                .collect();
        }
        segments
    }
}

/// Subtract `[cut_start, cut_end)` from one segment, yielding what is left.
fn subtract(
    seg_off: u64,
    seg: Vec<u8>,
    cut_start: u64,
    cut_end: u64,
) -> Vec<(u64, Vec<u8>)> {
    let seg_end = seg_off + seg.len() as u64;
    if cut_end <= seg_off || cut_start >= seg_end {
        return vec![(seg_off, seg)];
    }
    let mut out = Vec::new();
    if seg_off < cut_start {
        let keep = (cut_start - seg_off) as usize;
        out.push((seg_off, seg[.. keep].to_vec()));
    }
    if cut_end < seg_end {
        let skip = (cut_end - seg_off) as usize;
        out.push((cut_end, seg[skip ..].to_vec()));
    }
    out
}

impl BlockStore for MemStore {
    fn size(&self) -> u64 {
        self.size
    }

    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<(), StoreError> {
        self.check_range(offset, buf.len() as u64)?;
        for b in buf.iter_mut() {
            *b = 0;
        }
        let end = offset + buf.len() as u64;
        let inner = self.inner.lock();
        for (&off, run) in inner.runs.range(.. end) {
            let run_end = run.end(off);
            if run_end <= offset {
                continue;
            }
            let from = off.max(offset);
            let to = run_end.min(end);
            buf[(from - offset) as usize .. (to - offset) as usize]
                .copy_from_slice(
                    &run.data[(from - off) as usize .. (to - off) as usize],
                );
        }
        Ok(())
    }

    fn read_with_metadata(
        &self,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<Vec<MetaRun>, StoreError> {
        self.read(offset, buf)?;
        let end = offset + buf.len() as u64;
        let mut meta = Vec::new();
        let mut cursor = offset;
        let inner = self.inner.lock();
        for (&off, run) in inner.runs.range(.. end) {
            let run_end = run.end(off);
            if run_end <= offset {
                continue;
            }
            let from = off.max(offset);
            let to = run_end.min(end);
            if from > cursor {
                meta.push(MetaRun {
                    io_num: 0,
                    len: from - cursor,
                });
            }
            meta.push(MetaRun {
                io_num: run.io_num,
                len: to - from,
            });
            cursor = to;
        }
        if cursor < end {
            meta.push(MetaRun {
                io_num: 0,
                len: end - cursor,
            });
        }
        Ok(meta)
    }

    fn write(
        &self,
        offset: u64,
        data: &[u8],
        io_num: u64,
        rebuild: bool,
    ) -> Result<(), StoreError> {
        self.check_range(offset, data.len() as u64)?;
        if data.is_empty() {
            return Ok(());
        }
        let mut inner = self.inner.lock();
        if rebuild {
            let segments = inner.writable_segments(offset, data, io_num);
            for (seg_off, seg) in segments {
                inner.apply(seg_off, &seg, io_num);
            }
        } else {
            inner.apply(offset, data, io_num);
        }
        Ok(())
    }

    fn flush(&self) -> Result<(), StoreError> {
        Ok(())
    }

    fn diff(
        &self,
        threshold: u64,
        offset: u64,
        len: u64,
        visit: DiffVisitor,
    ) -> Result<(), StoreError> {
        let end = offset.saturating_add(len).min(self.size);
        // snapshot the qualifying runs so the visitor can issue reads
        // against this store without deadlocking on the inner lock
        let window: Vec<(u64, u64, u64)> = {
            let inner = self.inner.lock();
            inner
                .runs
                .range(.. end)
                .filter(|(&off, run)| {
                    run.end(off) > offset && run.io_num > threshold
                })
                .map(|(&off, run)| {
                    let from = off.max(offset);
                    let to = run.end(off).min(end);
                    (from, to - from, run.io_num)
                })
                .collect()
        };
        for (off, span, io_num) in window {
            visit(off, span, io_num)?;
        }
        Ok(())
    }

    fn last_committed_io_num(&self) -> Result<u64, StoreError> {
        Ok(self.inner.lock().last_committed)
    }

    fn store_last_committed_io_num(
        &self,
        io_num: u64,
    ) -> Result<(), StoreError> {
        self.inner.lock().last_committed = io_num;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    const GIB: u64 = 1024 * 1024 * 1024;

    #[test]
    fn read_of_unwritten_space_is_zero() {
        let store = MemStore::new(4096);
        let mut buf = vec![0xau8; 64];
        store.read(0, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn overwrite_splits_runs() {
        let store = MemStore::new(4096);
        store.write(0, &[1u8; 100], 1, false).unwrap();
        store.write(40, &[2u8; 20], 2, false).unwrap();

        let mut buf = vec![0u8; 100];
        let meta = store.read_with_metadata(0, &mut buf).unwrap();
        assert_eq!(&buf[.. 40], &[1u8; 40][..]);
        assert_eq!(&buf[40 .. 60], &[2u8; 20][..]);
        assert_eq!(&buf[60 ..], &[1u8; 40][..]);
        assert_eq!(
            meta,
            vec![
                MetaRun {
                    io_num: 1,
                    len: 40
                },
                MetaRun {
                    io_num: 2,
                    len: 20
                },
                MetaRun {
                    io_num: 1,
                    len: 40
                },
            ]
        );
    }

    #[test]
    fn metadata_covers_gaps() {
        let store = MemStore::new(4096);
        store.write(100, &[7u8; 50], 9, false).unwrap();

        let mut buf = vec![0u8; 200];
        let meta = store.read_with_metadata(0, &mut buf).unwrap();
        assert_eq!(
            meta,
            vec![
                MetaRun {
                    io_num: 0,
                    len: 100
                },
                MetaRun {
                    io_num: 9,
                    len: 50
                },
                MetaRun {
                    io_num: 0,
                    len: 50
                },
            ]
        );
    }

    #[test]
    fn rebuild_write_does_not_clobber_newer_data() {
        let store = MemStore::new(4096);
        store.write(0, &[9u8; 100], 10, false).unwrap();
        // stale rebuild data overlapping the newer run
        store.write(50, &[1u8; 100], 5, true).unwrap();

        let mut buf = vec![0u8; 150];
        store.read(0, &mut buf).unwrap();
        assert_eq!(&buf[.. 100], &[9u8; 100][..]);
        assert_eq!(&buf[100 ..], &[1u8; 50][..]);
    }

    #[test]
    fn rebuild_write_with_newer_io_num_wins() {
        let store = MemStore::new(4096);
        store.write(0, &[9u8; 100], 3, false).unwrap();
        store.write(50, &[1u8; 100], 5, true).unwrap();

        let mut buf = vec![0u8; 150];
        store.read(0, &mut buf).unwrap();
        assert_eq!(&buf[.. 50], &[9u8; 50][..]);
        assert_eq!(&buf[50 ..], &[1u8; 100][..]);
    }

    #[test]
    fn diff_walk_respects_threshold_and_window() {
        let store = MemStore::new(10 * GIB);
        store.write(0, &[1u8; 512], 3, false).unwrap();
        store.write(GIB, &[2u8; 512], 4, false).unwrap();
        store.write(9 * GIB, &[3u8; 512], 5, false).unwrap();

        let mut seen = Vec::new();
        store
            .diff(3, 0, 10 * GIB, &mut |off, len, io_num| {
                seen.push((off, len, io_num));
                Ok(())
            })
            .unwrap();
        assert_eq!(seen, vec![(GIB, 512, 4), (9 * GIB, 512, 5)]);

        // nothing is newer than the max threshold
        let mut count = 0;
        store
            .diff(u64::MAX, 0, 10 * GIB, &mut |_, _, _| {
                count += 1;
                Ok(())
            })
            .unwrap();
        assert_eq!(count, 0);

        // threshold 0 yields every region ever written
        let mut count = 0;
        store
            .diff(0, 0, 10 * GIB, &mut |_, _, _| {
                count += 1;
                Ok(())
            })
            .unwrap();
        assert_eq!(count, 3);
    }

    #[test]
    fn diff_walk_propagates_visitor_errors() {
        let store = MemStore::new(4096);
        store.write(0, &[1u8; 16], 1, false).unwrap();
        let err = store
            .diff(0, 0, 4096, &mut |_, _, _| {
                Err(StoreError::WalkAborted {
                    reason: "volume went offline".to_string(),
                })
            })
            .unwrap_err();
        assert_matches!(err, StoreError::WalkAborted { .. });
    }

    #[test]
    fn out_of_range_io_is_rejected() {
        let store = MemStore::new(4096);
        let err = store.write(4000, &[0u8; 200], 1, false).unwrap_err();
        assert_matches!(err, StoreError::OutOfRange { .. });

        let mut buf = vec![0u8; 200];
        let err = store.read(4000, &mut buf).unwrap_err();
        assert_matches!(err, StoreError::OutOfRange { .. });
    }

    #[test]
    fn last_committed_round_trips() {
        let store = MemStore::new(4096);
        assert_eq!(store.last_committed_io_num().unwrap(), 0);
        store.store_last_committed_io_num(77).unwrap();
        assert_eq!(store.last_committed_io_num().unwrap(), 77);
    }
}
