use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use super::constants::FRAME_HEADER_SIZE;
use super::raw_frame::FrameHeader;
use super::segment::RawSegment;

/// Incremental scanner over one raw file. Partitions the file into segments of whole events.
///
/// The scanner only walks frame headers, so it is cheap enough to run on every poll. Bytes
/// that were already scanned are never read again; a growing file is picked up where the
/// previous scan stopped. Segment boundaries are always placed between events: an event is
/// only known to be complete once the first frame of the next event (or the end of a closed
/// file) is seen.
#[derive(Debug)]
pub struct RawFileScan {
    id_dat: u32,
    path: PathBuf,
    split_events: Option<u64>,
    scanned_offset: u64,
    last_key: Option<(u32, u16)>,
    chunk: RawSegment,
    last_size: Option<u64>,
    done: bool,
}

impl RawFileScan {
    /// Create a scanner. `split_events` of None hands out the whole file as a single segment.
    pub fn new(id_dat: u32, path: &Path, split_events: Option<u64>) -> Self {
        Self {
            id_dat,
            path: path.to_path_buf(),
            split_events,
            scanned_offset: 0,
            last_key: None,
            chunk: RawSegment::pending(id_dat, path.to_path_buf(), 0),
            last_size: None,
            done: false,
        }
    }

    pub fn id_dat(&self) -> u32 {
        self.id_dat
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All bytes of the file were handed out (ready or dirty)
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Record the size seen at this poll. Returns true if the size did not change since the last poll.
    pub fn observe_size(&mut self, size: u64) -> bool {
        let stable = self.last_size == Some(size);
        self.last_size = Some(size);
        stable
    }

    /// Scan newly appended bytes and emit every segment that became available.
    ///
    /// `closed` declares that the file will not grow anymore; only then is the final partial
    /// chunk emitted. Emitted segments get consecutive sequence numbers starting at `next_seq`.
    pub fn advance(
        &mut self,
        size: u64,
        closed: bool,
        next_seq: &mut u64,
    ) -> Result<Vec<RawSegment>, std::io::Error> {
        let mut emitted = Vec::new();
        if self.done {
            return Ok(emitted);
        }

        let mut reader = BufReader::new(File::open(&self.path)?);
        reader.seek(SeekFrom::Start(self.scanned_offset))?;
        let mut header_bytes = [0u8; FRAME_HEADER_SIZE as usize];

        while self.scanned_offset + FRAME_HEADER_SIZE <= size {
            reader.read_exact(&mut header_bytes)?;
            let header = match FrameHeader::from_bytes(&header_bytes) {
                Ok(h) => h,
                Err(e) => {
                    // Nothing past this point can be framed
                    let reason = format!("unreadable frame at byte {}: {e}", self.scanned_offset);
                    emitted.extend(self.finish_dirty(size, reason, next_seq));
                    return Ok(emitted);
                }
            };
            let frame_size = header.frame_size();
            if self.scanned_offset + frame_size > size {
                // Frame still being written
                break;
            }

            let key = header.event_key();
            if self.last_key != Some(key) {
                if self.last_key.is_some() {
                    self.chunk.n_events += 1;
                    if self.split_events == Some(self.chunk.n_events) {
                        self.chunk.byte_range.end = self.scanned_offset;
                        emitted.push(self.take_chunk(self.scanned_offset, next_seq));
                    }
                }
                self.last_key = Some(key);
            }

            reader.seek_relative((frame_size - FRAME_HEADER_SIZE) as i64)?;
            self.scanned_offset += frame_size;
        }

        if closed {
            if self.scanned_offset != size {
                let reason = format!(
                    "file ends with a truncated frame at byte {} of {}",
                    self.scanned_offset, size
                );
                emitted.extend(self.finish_dirty(size, reason, next_seq));
                return Ok(emitted);
            }
            if self.last_key.take().is_some() {
                self.chunk.n_events += 1;
            }
            self.chunk.byte_range.end = size;
            if self.split_events.is_none() || self.chunk.n_events > 0 {
                emitted.push(self.take_chunk(size, next_seq));
            }
            self.done = true;
        }

        Ok(emitted)
    }

    /// Hand out the current chunk and open a new one at `next_start`
    fn take_chunk(&mut self, next_start: u64, next_seq: &mut u64) -> RawSegment {
        let fresh = RawSegment::pending(self.id_dat, self.path.clone(), next_start);
        let chunk = std::mem::replace(&mut self.chunk, fresh);
        let seq = *next_seq;
        *next_seq += 1;
        chunk.promote(seq)
    }

    /// Everything not yet handed out becomes one dirty segment
    fn finish_dirty(&mut self, size: u64, reason: String, next_seq: &mut u64) -> Option<RawSegment> {
        self.done = true;
        if self.last_key.take().is_some() {
            self.chunk.n_events += 1;
        }
        self.chunk.byte_range.end = size;
        let mut segment = self.take_chunk(size, next_seq);
        segment.mark_dirty(reason);
        Some(segment)
    }
}

/// Split a finished file into segments of `split_events` events.
///
/// With `split_events` of None (configured as -1) the whole file is one segment. Sequence
/// numbers start at 0.
pub fn split_file(
    path: &Path,
    id_dat: u32,
    split_events: Option<u64>,
) -> Result<Vec<RawSegment>, std::io::Error> {
    let size = path.metadata()?.len();
    let mut scan = RawFileScan::new(id_dat, path, split_events);
    let mut next_seq = 0;
    scan.advance(size, true, &mut next_seq)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raw_frame::{RawFrame, RawHit};
    use crate::segment::SegmentState;
    use std::io::Write;

    /// `n_events` events of two slab frames each
    fn write_events(path: &Path, first_cycle: u32, n_events: u32) -> Vec<u8> {
        let mut buffer = Vec::new();
        for ev in 0..n_events {
            for slab in 0..2 {
                RawFrame::new(first_cycle + ev, 10, slab, vec![RawHit::new(1, 2, 500, 300)])
                    .write_to(&mut buffer)
                    .unwrap();
            }
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .unwrap();
        file.write_all(&buffer).unwrap();
        buffer
    }

    #[test]
    fn test_whole_file_is_one_segment() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.dat_0000");
        write_events(&path, 0, 37);
        let segments = split_file(&path, 0, None).unwrap();
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].n_events, 37);
        assert_eq!(segments[0].state, SegmentState::Ready);
        assert_eq!(segments[0].byte_range.end, path.metadata().unwrap().len());
    }

    #[test]
    fn test_empty_file_is_still_one_segment() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.dat_0000");
        std::fs::write(&path, b"").unwrap();
        let segments = split_file(&path, 0, None).unwrap();
        assert_eq!(segments.len(), 1);
        assert!(segments[0].is_empty());
    }

    #[test]
    fn test_split_by_event_count() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.bin_0003");
        write_events(&path, 0, 25);
        let segments = split_file(&path, 3, Some(10)).unwrap();
        let counts: Vec<u64> = segments.iter().map(|s| s.n_events).collect();
        assert_eq!(counts, vec![10, 10, 5]);
        let seqs: Vec<u64> = segments.iter().map(|s| s.seq).collect();
        assert_eq!(seqs, vec![0, 1, 2]);
        assert_eq!(segments[0].byte_range.end, segments[1].byte_range.start);
        assert!(segments.iter().all(|s| s.id_dat == 3));
    }

    #[test]
    fn test_growing_file_keeps_final_chunk_until_closed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.dat_0000");
        write_events(&path, 0, 4);
        let mut scan = RawFileScan::new(0, &path, Some(3));
        let mut next_seq = 0;

        let size = path.metadata().unwrap().len();
        let first = scan.advance(size, false, &mut next_seq).unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].n_events, 3);

        // Half a frame arrives: nothing new can be cut
        let mut partial = Vec::new();
        RawFrame::new(99, 0, 0, vec![RawHit::new(0, 0, 1, 1)])
            .write_to(&mut partial)
            .unwrap();
        let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&partial[..5]).unwrap();
        let size = path.metadata().unwrap().len();
        assert!(scan.advance(size, false, &mut next_seq).unwrap().is_empty());

        file.write_all(&partial[5..]).unwrap();
        let size = path.metadata().unwrap().len();
        let last = scan.advance(size, true, &mut next_seq).unwrap();
        assert_eq!(last.len(), 1);
        assert_eq!(last[0].n_events, 2);
        assert_eq!(last[0].seq, 1);
        assert!(scan.is_done());
    }

    #[test]
    fn test_truncated_closed_file_is_dirty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.dat_0000");
        let buffer = write_events(&path, 0, 3);
        std::fs::write(&path, &buffer[..buffer.len() - 3]).unwrap();
        let segments = split_file(&path, 0, None).unwrap();
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].state, SegmentState::Dirty);
    }

    #[test]
    fn test_bad_magic_marks_rest_dirty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.dat_0000");
        let mut buffer = write_events(&path, 0, 6);
        let frame_len = buffer.len() / 12;
        // Corrupt the first frame of the sixth event
        buffer[frame_len * 10] = 0x00;
        std::fs::write(&path, &buffer).unwrap();
        let segments = split_file(&path, 0, Some(2)).unwrap();
        assert_eq!(segments.len(), 3);
        assert_eq!(segments[0].state, SegmentState::Ready);
        assert_eq!(segments[1].state, SegmentState::Ready);
        assert_eq!(segments[2].state, SegmentState::Dirty);
        assert_eq!(segments[2].byte_range.end, buffer.len() as u64);
    }
}
