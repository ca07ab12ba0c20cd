// Range-worker budget chooser extracted for testing.
// Decides how many parallel byte-range workers a single transfer gets, given
// the file size, how many sibling transfers are active and the global cap.

pub const MIN_RANGE_WORKERS: usize = 1;
pub const MAX_RANGE_WORKERS: usize = 32;

const TINY_FILE: u64 = 8 * 1024 * 1024;
const HUGE_FILE: u64 = 1024 * 1024 * 1024;
const RANGE_SIZE: u64 = 16 * 1024 * 1024;

pub fn choose_range_workers(
    file_size: u64,
    concurrent_files: usize,
    global_max_threads: usize,
    auto_scale: bool,
) -> usize {
    let cap = global_max_threads.clamp(MIN_RANGE_WORKERS, MAX_RANGE_WORKERS);
    if !auto_scale {
        return cap;
    }
    if file_size < TINY_FILE {
        return 1;
    }
    if file_size > HUGE_FILE {
        // very large files always get the maximum worker count
        return MAX_RANGE_WORKERS;
    }

    // medium files: one worker per ~16 MiB range, bounded by the per-file
    // share of the global thread budget
    let ranges = file_size.div_ceil(RANGE_SIZE) as usize;
    let share = cap / concurrent_files.max(1);
    ranges.clamp(1, share.max(1)).clamp(MIN_RANGE_WORKERS, MAX_RANGE_WORKERS)
}

/// Split a file into (offset, length) ranges for `workers` parallel fetchers.
/// Ranges are contiguous, cover the whole file and never overlap.
pub fn split_ranges(total: u64, workers: usize) -> Vec<(u64, u64)> {
    if total == 0 {
        return vec![(0, 0)];
    }
    let n = workers.max(1) as u64;
    let chunk = total.div_ceil(n);
    let mut out = Vec::new();
    let mut off = 0u64;
    while off < total {
        let len = chunk.min(total - off);
        out.push((off, len));
        off += len;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tiny_file_single_worker() {
        assert_eq!(choose_range_workers(1024, 1, 16, true), 1);
        assert_eq!(choose_range_workers(8 * 1024 * 1024 - 1, 5, 16, true), 1);
    }

    #[test]
    fn huge_file_saturates() {
        let t = choose_range_workers(2 * 1024 * 1024 * 1024, 1, 32, true);
        assert_eq!(t, 32);
        // 超过 1 GiB 的文件无视较小的全局线程数，仍取最大值
        assert_eq!(choose_range_workers(2 * 1024 * 1024 * 1024, 1, 8, true), 32);
        assert_eq!(choose_range_workers(3 * HUGE_FILE, 5, 1, true), 32);
    }

    #[test]
    fn medium_file_splits_by_range_size() {
        // 64 MiB -> 4 ranges, plenty of budget
        assert_eq!(choose_range_workers(64 * 1024 * 1024, 1, 16, true), 4);
        // same file but 4 siblings sharing 16 threads -> at most 4 each
        assert_eq!(choose_range_workers(64 * 1024 * 1024, 4, 16, true), 4);
        // 8 siblings -> 2 each
        assert_eq!(choose_range_workers(64 * 1024 * 1024, 8, 16, true), 2);
    }

    #[test]
    fn auto_scale_off_uses_global() {
        assert_eq!(choose_range_workers(100, 3, 12, false), 12);
        assert_eq!(choose_range_workers(100, 3, 99, false), 32);
        assert_eq!(choose_range_workers(100, 3, 0, false), 1);
    }

    #[test]
    fn result_always_in_bounds() {
        for size in [0u64, 1, TINY_FILE, 100 * 1024 * 1024, 3 * HUGE_FILE] {
            for conc in [1usize, 5, 10] {
                for cap in [1usize, 8, 32, 64] {
                    for auto in [true, false] {
                        let t = choose_range_workers(size, conc, cap, auto);
                        assert!((MIN_RANGE_WORKERS..=MAX_RANGE_WORKERS).contains(&t));
                    }
                }
            }
        }
    }

    #[test]
    fn ranges_cover_exactly() {
        for (total, workers) in [(0u64, 4usize), (1, 4), (100, 3), (1 << 26, 5)] {
            let ranges = split_ranges(total, workers);
            let mut expect = 0u64;
            for (off, len) in &ranges {
                assert_eq!(*off, expect);
                expect += len;
            }
            assert_eq!(expect, total.max(0));
            if total == 0 {
                assert_eq!(ranges, vec![(0, 0)]);
            }
        }
    }
}
