// Seed search: mismatch-tolerant index descent.
//
// Each instantiated seed is searched against the index with 0, 1 or 2
// mismatches. The exact case is a plain backward search on the forward
// index. With mismatches the seed is split in half and the descent is
// partitioned into cases so every occurrence is found by exactly one
// branch:
//
//   case A (forward index):  all mismatches in the right half
//   case B (reverse index):  all mismatches in the left half, >= 1
//   case C (forward index):  exactly one mismatch in each half (N=2)
//
// The reverse index puts the original left half early in its backward
// descent, so substitution branches are pruned by the index instead of
// fanning out. Leaf ranges found on the reverse index are rematerialized
// on the forward index (the substituted string is fully determined at a
// leaf) so that resolution always works on forward rows.

use crate::cache::{CacheHit, CacheIface, CacheKey, CacheVal};
use crate::index::{IndexRange, SeedIndex};
use crate::metrics::SeedSearchMetrics;
use crate::random::ReadRng;
use crate::read::Orientation;
use crate::seed::InstantiatedSeed;

/// One deposit in the per-read hit table: a nonempty range plus where
/// in the read the seed came from.
#[derive(Debug, Clone)]
pub struct SeedHit {
    pub range: IndexRange,
    pub template_idx: usize,
    /// Offset from the 5' end of the oriented read.
    pub read_off: usize,
    pub orient: Orientation,
    /// The concrete (possibly substituted) string this range matches.
    pub matched: Vec<u8>,
    /// Mismatches spent reaching this leaf.
    pub edits: u8,
    /// Cache key of the instantiating seed query.
    pub key: CacheKey,
}

impl SeedHit {
    #[inline]
    pub fn seed_len(&self) -> usize {
        self.matched.len()
    }
}

/// Per-read, per-mate table of seed hits, ranked for extension.
#[derive(Debug, Default)]
pub struct SeedResults {
    hits: Vec<SeedHit>,
    pub n_fw: usize,
    pub n_rc: usize,
    ranked: bool,
}

impl SeedResults {
    pub fn clear(&mut self) {
        self.hits.clear();
        self.n_fw = 0;
        self.n_rc = 0;
        self.ranked = false;
    }

    pub fn is_empty(&self) -> bool {
        self.hits.is_empty()
    }

    pub fn len(&self) -> usize {
        self.hits.len()
    }

    pub fn push(&mut self, hit: SeedHit) {
        self.hits.push(hit);
        self.ranked = false;
    }

    /// Rank hits by ascending range size, then descending seed length,
    /// then read offset; runs of equal rank are shuffled by the read's
    /// random stream so repetitive seeds are tried in varying order.
    pub fn rank(&mut self, rnd: &mut ReadRng) {
        self.hits.sort_by(|a, b| {
            a.range
                .size()
                .cmp(&b.range.size())
                .then(b.seed_len().cmp(&a.seed_len()))
                .then(a.read_off.cmp(&b.read_off))
        });
        // Fisher-Yates within each equal-rank run
        let mut i = 0;
        while i < self.hits.len() {
            let mut j = i + 1;
            while j < self.hits.len() && Self::same_rank(&self.hits[i], &self.hits[j]) {
                j += 1;
            }
            for k in ((i + 1)..j).rev() {
                let swap_with = i + rnd.below(k - i + 1);
                self.hits.swap(k, swap_with);
            }
            i = j;
        }
        self.ranked = true;
    }

    fn same_rank(a: &SeedHit, b: &SeedHit) -> bool {
        a.range.size() == b.range.size()
            && a.seed_len() == b.seed_len()
            && a.read_off == b.read_off
    }

    pub fn hits(&self) -> &[SeedHit] {
        debug_assert!(self.ranked || self.hits.is_empty());
        &self.hits
    }

    /// Total occurrences across all hit ranges.
    pub fn total_occurrences(&self) -> u64 {
        self.hits.iter().map(|h| h.range.size()).sum()
    }
}

/// Runs the descent for every instantiated seed of one mate.
pub struct SeedSearcher;

impl SeedSearcher {
    /// Search all seeds, consulting and populating the cache, and
    /// deposit nonzero leaf ranges into `results`.
    pub fn search_all(
        idx: &SeedIndex,
        seeds: &[InstantiatedSeed],
        cache: &mut CacheIface,
        results: &mut SeedResults,
        met: &mut SeedSearchMetrics,
    ) {
        for seed in seeds {
            met.seed_searches += 1;
            let n_count = seed.query.iter().filter(|&&c| c > 3).count();
            if n_count > seed.mms as usize {
                continue; // ambiguous positions exceed the edit budget
            }
            if seed.mms == 0 {
                Self::search_exact(idx, seed, cache, results, met);
            } else {
                Self::search_inexact(idx, seed, cache, results, met);
            }
        }
    }

    fn deposit(
        seed: &InstantiatedSeed,
        matched: Vec<u8>,
        range: IndexRange,
        edits: u8,
        cache: &mut CacheIface,
        results: &mut SeedResults,
        met: &mut SeedSearchMetrics,
    ) {
        debug_assert!(!range.is_empty());
        let leaf_key = CacheKey::new(&matched, seed.orient);
        if cache.insert_current(leaf_key.clone(), CacheVal::new(range)).is_err() {
            // Non-fatal: this leaf just is not memoized
            met.ooms += 1;
        }
        if seed.orient.is_fw() {
            results.n_fw += 1;
        } else {
            results.n_rc += 1;
        }
        results.push(SeedHit {
            range,
            template_idx: seed.template_idx,
            read_off: seed.read_off,
            orient: seed.orient,
            matched,
            edits,
            key: leaf_key,
        });
    }

    fn search_exact(
        idx: &SeedIndex,
        seed: &InstantiatedSeed,
        cache: &mut CacheIface,
        results: &mut SeedResults,
        met: &mut SeedSearchMetrics,
    ) {
        let key = CacheKey::new(&seed.query, seed.orient);
        let range = match cache.lookup(&key) {
            Some((val, hit)) => {
                match hit {
                    CacheHit::Current => met.intra_cache_hits += 1,
                    _ => met.inter_cache_hits += 1,
                }
                val.range
            }
            None => idx.fwd.range_for_counted(&seed.query, &mut met.bwops),
        };
        if !range.is_empty() {
            Self::deposit(seed, seed.query.clone(), range, 0, cache, results, met);
        } else {
            // memoize the miss so sibling seeds skip the descent
            let _ = cache.insert_current(key, CacheVal::new(IndexRange::EMPTY));
        }
    }

    fn search_inexact(
        idx: &SeedIndex,
        seed: &InstantiatedSeed,
        cache: &mut CacheIface,
        results: &mut SeedResults,
        met: &mut SeedSearchMetrics,
    ) {
        let len = seed.query.len();
        let half = len / 2;
        let m = seed.mms;

        // Case A: mismatches confined to the right half (0..=m of them).
        {
            let mut buf = seed.query.clone();
            let mut leaves = Vec::new();
            Self::descend_fwd(
                idx,
                &seed.query,
                &mut buf,
                len,
                idx.fwd.full_range(),
                half,
                m,
                0,
                &mut leaves,
                met,
            );
            for (matched, range, edits) in leaves {
                Self::deposit(seed, matched, range, edits, cache, results, met);
            }
        }

        // Case B: >= 1 mismatch, all in the left half. Searched on the
        // reverse index so the mutable region is met first.
        if let Some(rev) = idx.rev.as_ref() {
            let rev_query: Vec<u8> = seed.query.iter().rev().copied().collect();
            let mut buf = rev_query.clone();
            let mut leaves = Vec::new();
            // In reversed coordinates the original left half occupies
            // the last `half` processed positions... processed first in
            // backward order: positions len-1 down to len-half.
            Self::descend_rev(
                rev,
                &rev_query,
                &mut buf,
                len,
                rev.full_range(),
                len - half,
                m,
                0,
                &mut leaves,
                met,
            );
            for (rev_matched, _rev_range, edits) in leaves {
                // Rematerialize the leaf on the forward index
                let matched: Vec<u8> = rev_matched.iter().rev().copied().collect();
                let range = idx.fwd.range_for_counted(&matched, &mut met.bwops);
                debug_assert!(!range.is_empty());
                if !range.is_empty() {
                    Self::deposit(seed, matched, range, edits, cache, results, met);
                }
            }
        }

        // Case C: exactly one mismatch in each half (only with m == 2).
        if m == 2 {
            let mut buf = seed.query.clone();
            let mut leaves = Vec::new();
            Self::descend_split(
                idx,
                &seed.query,
                &mut buf,
                len,
                idx.fwd.full_range(),
                half,
                0,
                0,
                &mut leaves,
                met,
            );
            for (matched, range, edits) in leaves {
                Self::deposit(seed, matched, range, edits, cache, results, met);
            }
        }
    }

    /// Backward DFS on the forward index; substitutions allowed only at
    /// positions >= `sub_floor`, at most `budget` of them.
    #[allow(clippy::too_many_arguments)]
    fn descend_fwd(
        idx: &SeedIndex,
        query: &[u8],
        buf: &mut Vec<u8>,
        pos: usize,
        range: IndexRange,
        sub_floor: usize,
        budget: u8,
        used: u8,
        leaves: &mut Vec<(Vec<u8>, IndexRange, u8)>,
        met: &mut SeedSearchMetrics,
    ) {
        if range.is_empty() {
            return;
        }
        if pos == 0 {
            leaves.push((buf.clone(), range, used));
            return;
        }
        let p = pos - 1;
        let orig = query[p];
        let may_sub = p >= sub_floor && used < budget;
        for c in 0..4u8 {
            // An N in the query matches nothing: every branch is a sub
            let is_match = c == orig;
            if !is_match && !may_sub {
                continue;
            }
            let cost = if is_match { 0 } else { 1 };
            met.bwops += 1;
            let child = idx.fwd.extend(range, c);
            if child.is_empty() {
                continue;
            }
            if cost > 0 {
                met.edits += 1;
            }
            buf[p] = c;
            Self::descend_fwd(
                idx,
                query,
                buf,
                p,
                child,
                sub_floor,
                budget,
                used + cost,
                leaves,
                met,
            );
            buf[p] = orig;
        }
    }

    /// Backward DFS on the reverse index over the reversed query;
    /// substitutions allowed only at reversed positions >= `sub_floor`
    /// and at least one must be used before a leaf counts.
    #[allow(clippy::too_many_arguments)]
    fn descend_rev(
        rev: &crate::index::FmIndex,
        query: &[u8],
        buf: &mut Vec<u8>,
        pos: usize,
        range: IndexRange,
        sub_floor: usize,
        budget: u8,
        used: u8,
        leaves: &mut Vec<(Vec<u8>, IndexRange, u8)>,
        met: &mut SeedSearchMetrics,
    ) {
        if range.is_empty() {
            return;
        }
        if pos == 0 {
            if used >= 1 {
                leaves.push((buf.clone(), range, used));
            }
            return;
        }
        let p = pos - 1;
        let orig = query[p];
        let may_sub = p >= sub_floor && used < budget;
        for c in 0..4u8 {
            let is_match = c == orig;
            if !is_match && !may_sub {
                continue;
            }
            let cost = if is_match { 0 } else { 1 };
            met.bwops += 1;
            let child = rev.extend(range, c);
            if child.is_empty() {
                continue;
            }
            if cost > 0 {
                met.edits += 1;
            }
            buf[p] = c;
            Self::descend_rev(
                rev, query, buf, p, child, sub_floor, budget, used + cost, leaves, met,
            );
            buf[p] = orig;
        }
    }

    /// Backward DFS on the forward index requiring exactly one
    /// substitution in each half (case C of the two-mismatch search).
    #[allow(clippy::too_many_arguments)]
    fn descend_split(
        idx: &SeedIndex,
        query: &[u8],
        buf: &mut Vec<u8>,
        pos: usize,
        range: IndexRange,
        half: usize,
        used_right: u8,
        used_left: u8,
        leaves: &mut Vec<(Vec<u8>, IndexRange, u8)>,
        met: &mut SeedSearchMetrics,
    ) {
        if range.is_empty() {
            return;
        }
        if pos == half && used_right != 1 {
            return; // right half must have spent exactly one edit
        }
        if pos == 0 {
            if used_left == 1 {
                leaves.push((buf.clone(), range, 2));
            }
            return;
        }
        let p = pos - 1;
        let orig = query[p];
        let in_right = p >= half;
        let used_here = if in_right { used_right } else { used_left };
        let may_sub = used_here < 1;
        for c in 0..4u8 {
            let is_match = c == orig;
            if !is_match && !may_sub {
                continue;
            }
            let cost = if is_match { 0 } else { 1 };
            met.bwops += 1;
            let child = idx.fwd.extend(range, c);
            if child.is_empty() {
                continue;
            }
            if cost > 0 {
                met.edits += 1;
            }
            buf[p] = c;
            let (ur, ul) = if in_right {
                (used_right + cost, used_left)
            } else {
                (used_right, used_left + cost)
            };
            Self::descend_split(idx, query, buf, p, child, half, ur, ul, leaves, met);
            buf[p] = orig;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheIface;
    use crate::read::{encode_base, Read};
    use crate::seed::{instantiate_seeds, SeedTemplate};

    fn codes(s: &str) -> Vec<u8> {
        s.bytes().map(encode_base).collect()
    }

    fn search_fw_only(reference: &str, read_seq: &str, seed_len: usize, mms: u8) -> SeedResults {
        let idx = SeedIndex::build(
            &[("ref0".to_string(), reference.as_bytes().to_vec())],
            mms > 0,
        );
        let qual: String = "I".repeat(read_seq.len());
        let read = Read::from_ascii("r", read_seq, &qual, 99);
        let mut met = SeedSearchMetrics::default();
        let (seeds, _, _) = instantiate_seeds(
            &read,
            &[SeedTemplate::new(seed_len, mms)],
            seed_len,
            false,
            true, // norc
            &mut met,
        );
        let mut cache = CacheIface::new(1 << 20, None, None);
        let mut results = SeedResults::default();
        SeedSearcher::search_all(&idx, &seeds, &mut cache, &mut results, &mut met);
        results
    }

    #[test]
    fn test_exact_seed_found() {
        let res = search_fw_only("ACGTACGTACGTACGT", "GTACGTACG", 5, 0);
        assert!(!res.is_empty());
        for h in res.hits.iter() {
            assert!(h.range.size() > 0);
            assert_eq!(h.edits, 0);
        }
    }

    #[test]
    fn test_one_mismatch_occurrence_found() {
        // Read has a T where the reference has a C at seed position 2
        let reference = "AAAACCCCGGGGTTTTACGT";
        let res = search_fw_only(reference, "AATACCCCG", 8, 1);
        // The 8-mer AATACCCC (one mismatch vs AAAACCCC) must be found
        assert!(
            res.hits.iter().any(|h| h.edits == 1),
            "expected a one-mismatch leaf, got {:?}",
            res.hits
        );
    }

    #[test]
    fn test_mismatch_cases_are_disjoint() {
        // With a read exactly matching the reference, the 1-mm search
        // must find the exact leaf exactly once (case A), plus any true
        // 1-mm neighbors, never the exact leaf twice.
        let reference = "ACGTACGTACGTACGTACGT";
        let res = search_fw_only(reference, "ACGTACGTA", 8, 1);
        let exact: Vec<_> = res.hits.iter().filter(|h| h.edits == 0).collect();
        let mut seen = std::collections::HashSet::new();
        for h in &exact {
            assert!(seen.insert((h.read_off, h.matched.clone())), "duplicate exact leaf");
        }
        assert!(!exact.is_empty());
    }

    #[test]
    fn test_seed_with_too_many_ns_skipped() {
        let res = search_fw_only("ACGTACGTACGTACGT", "ANNTACGTA", 8, 1);
        assert!(res.hits.iter().all(|h| h.edits <= 1));
        // The N-heavy seed at offset 0 cannot produce hits
        assert!(res.hits.iter().all(|h| h.read_off != 0 || !h.matched.contains(&4)));
    }

    #[test]
    fn test_ranking_order() {
        // Build hits by hand and check the rank keys
        let mut res = SeedResults::default();
        let key = CacheKey::new(b"AAAA", Orientation::Fw);
        let mk = |size: u64, len: usize, off: usize| SeedHit {
            range: IndexRange { lo: 0, hi: size },
            template_idx: 0,
            read_off: off,
            orient: Orientation::Fw,
            matched: vec![0; len],
            edits: 0,
            key: key.clone(),
        };
        res.push(mk(10, 5, 0));
        res.push(mk(2, 5, 3));
        res.push(mk(2, 7, 9));
        let mut rnd = ReadRng::seeded(1, 10);
        res.rank(&mut rnd);
        let hits = res.hits();
        // smallest range first; longer seed breaks the tie
        assert_eq!(hits[0].range.size(), 2);
        assert_eq!(hits[0].seed_len(), 7);
        assert_eq!(hits[1].range.size(), 2);
        assert_eq!(hits[2].range.size(), 10);
    }

    #[test]
    fn test_search_uses_cache_on_repeat() {
        let idx = SeedIndex::build(&[("r".to_string(), b"ACGTACGTACGTACGT".to_vec())], false);
        let read = Read::from_ascii("r", "ACGTACGTACGT", "IIIIIIIIIIII", 5);
        let mut met = SeedSearchMetrics::default();
        let (seeds, _, _) =
            instantiate_seeds(&read, &[SeedTemplate::new(4, 0)], 4, false, true, &mut met);
        let mut cache = CacheIface::new(1 << 20, None, None);
        let mut results = SeedResults::default();
        SeedSearcher::search_all(&idx, &seeds, &mut cache, &mut results, &mut met);
        // The read tiles "ACGT" three times: two of them hit the cache
        assert!(met.intra_cache_hits >= 2, "intra hits: {}", met.intra_cache_hits);
    }

    #[test]
    fn test_no_hits_for_absent_pattern() {
        let res = search_fw_only("AAAAAAAAAAAAAAAA", "CCCCCCCCC", 8, 0);
        assert!(res.is_empty());
    }

    #[test]
    fn test_codes_helper() {
        assert_eq!(codes("ACGT"), vec![0, 1, 2, 3]);
    }
}
