/// Upper bound on concurrent range requests per transfer, whatever the configuration says.
pub const MAX_CHUNKS: usize = 8;

/// Inclusive byte range of one chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkRange {
    pub index: usize,
    pub start: u64,
    pub end: u64,
}

impl ChunkRange {
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    pub fn header_value(&self) -> String {
        format!("bytes={}-{}", self.start, self.end)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkPlan {
    Chunked(Vec<ChunkRange>),
    Single,
}

#[derive(Debug, Clone, Copy)]
pub struct ChunkSettings {
    pub chunk_size: u64,
    pub max_chunks: usize,
    pub min_chunked_size: u64,
}

/// Splits `total_size` into `min(max_chunks, 8, ceil(total / chunk_size))` contiguous
/// ranges. The last range ends at `total_size - 1` and absorbs any remainder.
/// Falls back to a single stream when the size is unknown, ranges are not
/// supported, or the file is too small to be worth splitting.
pub fn plan_chunks(total_size: Option<u64>, accepts_ranges: bool, settings: ChunkSettings) -> ChunkPlan {
    let total_size = match total_size {
        Some(size) if accepts_ranges && size > settings.min_chunked_size => size,
        _ => return ChunkPlan::Single,
    };

    let chunk_size = settings.chunk_size.max(1);
    let wanted = (total_size + chunk_size - 1) / chunk_size;
    let count = wanted.min(settings.max_chunks.clamp(1, MAX_CHUNKS) as u64);
    if count < 2 {
        return ChunkPlan::Single;
    }

    let part_size = total_size / count;
    let ranges = (0..count)
        .map(|i| {
            let start = i * part_size;
            let end = if i == count - 1 {
                total_size - 1
            } else {
                (i + 1) * part_size - 1
            };
            ChunkRange {
                index: i as usize,
                start,
                end,
            }
        })
        .collect();
    ChunkPlan::Chunked(ranges)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIB: u64 = 1024 * 1024;

    fn settings() -> ChunkSettings {
        ChunkSettings {
            chunk_size: MIB,
            max_chunks: 8,
            min_chunked_size: MIB,
        }
    }

    fn assert_contiguous(ranges: &[ChunkRange], total: u64) {
        assert_eq!(ranges[0].start, 0);
        for pair in ranges.windows(2) {
            assert_eq!(pair[0].end + 1, pair[1].start);
        }
        assert_eq!(ranges.last().unwrap().end, total - 1);
        assert_eq!(ranges.iter().map(ChunkRange::len).sum::<u64>(), total);
    }

    #[test]
    fn ten_mib_uses_eight_chunks() {
        let total = 10 * MIB;
        match plan_chunks(Some(total), true, settings()) {
            ChunkPlan::Chunked(ranges) => {
                assert_eq!(ranges.len(), 8);
                assert_contiguous(&ranges, total);
            }
            other => panic!("expected chunked plan, got {:?}", other),
        }
    }

    #[test]
    fn chunk_count_follows_size() {
        let total = 3 * MIB + 17;
        match plan_chunks(Some(total), true, settings()) {
            ChunkPlan::Chunked(ranges) => {
                assert_eq!(ranges.len(), 4);
                assert_contiguous(&ranges, total);
                assert_eq!(ranges[3].header_value(), format!("bytes={}-{}", ranges[3].start, total - 1));
            }
            other => panic!("expected chunked plan, got {:?}", other),
        }
    }

    #[test]
    fn falls_back_to_single_stream() {
        assert_eq!(plan_chunks(None, true, settings()), ChunkPlan::Single);
        assert_eq!(plan_chunks(Some(10 * MIB), false, settings()), ChunkPlan::Single);
        assert_eq!(plan_chunks(Some(MIB), true, settings()), ChunkPlan::Single);
    }

    #[test]
    fn configured_chunks_never_exceed_eight() {
        let wide = ChunkSettings {
            max_chunks: 20,
            ..settings()
        };
        match plan_chunks(Some(10 * MIB), true, wide) {
            ChunkPlan::Chunked(ranges) => {
                assert_eq!(ranges.len(), MAX_CHUNKS);
                assert_contiguous(&ranges, 10 * MIB);
            }
            other => panic!("expected chunked plan, got {:?}", other),
        }
    }
}
