// Offset resolution ("group walk").
//
// Resolving every element of every range up front is prohibitive for
// repetitive seeds, so ranges are expanded lazily under two budgets: a
// position-fraction budget bounding how many of a range's positions may
// be tried, and a row-multiplier budget bounding LF-walk work per
// position. Both are boosted by the reporting policy's appetite.
//
// When a range is narrow and some coordinates are already known (from
// the cache), a reference scan around those coordinates can substitute
// for further LF walking; `scan_narrowed` gates the shortcut.

use crate::cache::{CacheIface, CacheKey};
use crate::index::{IndexRange, SeedIndex, SA_SAMPLE_IVAL};
use crate::metrics::WalkMetrics;
use crate::simple_func::SimpleFunc;

/// Window scanned on each side of a known coordinate when the scanner
/// substitutes for the walk.
const SCAN_WINDOW: i64 = 1024;

#[derive(Debug, Clone)]
pub struct OffsetResolver {
    /// How many of a range's positions may be tried, as a function of
    /// the range size.
    pub pos_frac: SimpleFunc,
    /// LF-walk budget per position, as a function of the range size,
    /// in units of the SA sample interval.
    pub row_mult: SimpleFunc,
    /// Enable the reference-scanner shortcut for narrow ranges.
    pub scan_narrowed: bool,
    /// Largest range size the scanner will take over.
    pub narrow_ceil: u64,
    /// Verify the index round-trip law on every resolution.
    pub sanity: bool,
}

impl Default for OffsetResolver {
    fn default() -> Self {
        OffsetResolver {
            // Try at least 1 position plus a fraction of the rest
            pos_frac: SimpleFunc::linear(1.0, 0.25).with_min(1.0),
            row_mult: SimpleFunc::constant(10.0),
            scan_narrowed: false,
            narrow_ceil: 8,
            sanity: false,
        }
    }
}

impl OffsetResolver {
    /// Multiply both budgets by the reporting policy's factor (>= the
    /// number of alignments sought).
    pub fn boosted(&self, factor: f64) -> OffsetResolver {
        let mut r = self.clone();
        r.pos_frac.mult(factor);
        r.row_mult.mult(factor);
        r
    }

    /// Halve both budgets; used for the paired extension path.
    pub fn halved(&self) -> OffsetResolver {
        let mut r = self.clone();
        r.pos_frac.mult(0.5);
        r.row_mult.mult(0.5);
        r
    }

    /// Resolve reference coordinates for `range`, reusing coordinates
    /// cached under `key` and appending newly resolved ones there.
    ///
    /// `query` is the concrete matched string (needed by the scanner
    /// and to reject occurrences that straddle a reference boundary).
    /// Returns (ref id, 0-based offset) pairs, at most the position
    /// budget of them.
    pub fn resolve_range(
        &self,
        idx: &SeedIndex,
        range: IndexRange,
        key: &CacheKey,
        query: &[u8],
        cache: &mut CacheIface,
        wlm: &mut WalkMetrics,
    ) -> Vec<(usize, u64)> {
        if range.is_empty() {
            return Vec::new();
        }
        let size = range.size();
        let max_pos = (self.pos_frac.eval(size as f64).ceil().max(1.0) as u64).min(size);
        let lf_budget_per_pos =
            (self.row_mult.eval(size as f64).ceil().max(1.0) as u64) * SA_SAMPLE_IVAL;

        // Start from whatever this or an earlier read already resolved
        let mut coords: Vec<(usize, u64)> = cache
            .get_current(key)
            .map(|v| v.resolved.clone())
            .unwrap_or_default();
        coords.truncate(max_pos as usize);
        // Cached coordinates were appended in element order; scanner
        // finds below are not, so remember where the ordered prefix ends
        let elt_start = coords.len() as u64;

        // Scanner shortcut: a narrow range with known coordinates can
        // be completed by scanning the reference near those coordinates
        if self.scan_narrowed
            && size <= self.narrow_ceil
            && !coords.is_empty()
            && (coords.len() as u64) < size.min(max_pos)
        {
            let found = self.scan_near(idx, query, &coords);
            for c in found {
                if coords.len() as u64 >= max_pos {
                    break;
                }
                if !coords.contains(&c) {
                    wlm.ref_scans += 1;
                    coords.push(c);
                }
            }
        }

        // Walk the remaining positions under the budgets
        let mut next_elt = elt_start;
        while next_elt < size && (coords.len() as u64) < max_pos.min(size) {
            let mut steps = 0u64;
            match idx.resolve(range, next_elt, &mut steps) {
                Some((rid, off))
                    if fits_reference(idx, rid, off, query.len())
                        && !coords.contains(&(rid, off)) =>
                {
                    if self.sanity {
                        let (win, _) =
                            idx.ref_window(rid, off as i64, off as i64 + query.len() as i64);
                        assert_eq!(
                            win, query,
                            "resolved coordinate does not reproduce the seed pattern"
                        );
                    }
                    wlm.resolves += 1;
                    coords.push((rid, off));
                }
                _ => {
                    wlm.elts_skipped += 1;
                }
            }
            if steps > lf_budget_per_pos {
                // Position was over budget; charge it and stop early
                wlm.elts_skipped += size - next_elt - 1;
                next_elt += 1;
                break;
            }
            next_elt += 1;
        }

        wlm.elts_reported += coords.len() as u64;

        // Keep the cache entry's coordinate list in step
        let cached_len = cache.get_current(key).map(|v| v.resolved.len()).unwrap_or(0);
        if coords.len() > cached_len {
            cache.add_resolved(key, &coords[cached_len..]);
        }
        coords
    }

    /// Scan the reference around known coordinates for more exact
    /// occurrences of `query`. Only nearby occurrences are findable;
    /// the caller falls back to the walk for the rest.
    fn scan_near(
        &self,
        idx: &SeedIndex,
        query: &[u8],
        known: &[(usize, u64)],
    ) -> Vec<(usize, u64)> {
        let mut found = Vec::new();
        let qlen = query.len();
        for &(rid, off) in known {
            let start = off as i64 - SCAN_WINDOW;
            let end = off as i64 + SCAN_WINDOW + qlen as i64;
            let (win, win_start) = idx.ref_window(rid, start, end);
            if win.len() < qlen {
                continue;
            }
            for i in 0..=(win.len() - qlen) {
                if &win[i..i + qlen] == query {
                    let cand = (rid, win_start + i as u64);
                    if !found.contains(&cand) {
                        found.push(cand);
                    }
                }
            }
        }
        found
    }
}

/// An occurrence starting at `off` must lie entirely inside reference
/// `rid`; matches straddling the concatenation boundary are artifacts.
#[inline]
fn fits_reference(idx: &SeedIndex, rid: usize, off: u64, qlen: usize) -> bool {
    off + qlen as u64 <= idx.pattern_length(rid)
}
