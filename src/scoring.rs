// Scoring model.
//
// Converts base-level events (match, mismatch, N, gap open/extend) into
// integer scores, and evaluates the read-length-dependent thresholds:
// minimum valid score, local-alignment floor, N ceiling, and the seed
// interval. All penalties are stored non-negative; callers subtract.

use crate::read::Read;
use crate::simple_func::SimpleFunc;

/// Highest quality value that affects the scaled mismatch penalty.
pub const QUAL_CEILING: u32 = 40;

/// How the mismatch (or N) penalty responds to base quality.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PenaltyKind {
    /// Flat penalty regardless of quality.
    Constant,
    /// `round(max * min(qual, 40) / 40)`.
    QualScaled,
}

/// Immutable scoring parameters, built once from the configuration and
/// shared read-only by every worker.
#[derive(Debug, Clone)]
pub struct Scoring {
    pub match_bonus: i64,
    pub mm_kind: PenaltyKind,
    pub mm_penalty_max: i64,
    /// N penalty; when `n_as_mm` is set an N scores like a
    /// maximum-penalty mismatch instead.
    pub n_penalty: i64,
    pub n_as_mm: bool,
    /// Concatenate mates before applying the N filter.
    pub n_cat_pair: bool,
    pub read_gap_open: i64,
    pub read_gap_extend: i64,
    pub ref_gap_open: i64,
    pub ref_gap_extend: i64,
    pub min_score: SimpleFunc,
    pub score_floor: SimpleFunc,
    pub n_ceiling: SimpleFunc,
    pub seed_interval: SimpleFunc,
    /// Local mode allows positive-scoring sub-paths; end-to-end requires
    /// the whole read.
    pub local: bool,
}

impl Scoring {
    /// End-to-end defaults: match bonus 0, qual-scaled mismatch up to 6,
    /// min score L,-0.6,-0.6.
    pub fn default_end_to_end() -> Self {
        Scoring {
            match_bonus: 0,
            mm_kind: PenaltyKind::QualScaled,
            mm_penalty_max: 6,
            n_penalty: 1,
            n_as_mm: false,
            n_cat_pair: false,
            read_gap_open: 5,
            read_gap_extend: 3,
            ref_gap_open: 5,
            ref_gap_extend: 3,
            min_score: SimpleFunc::linear(-0.6, -0.6),
            score_floor: SimpleFunc::constant(f64::MIN),
            n_ceiling: SimpleFunc::linear(0.0, 0.15),
            seed_interval: SimpleFunc::parse("S,1,1.25").unwrap(),
            local: false,
        }
    }

    /// Local defaults: match bonus 2, min score G,20,8, floor C,0,0.
    pub fn default_local() -> Self {
        Scoring {
            match_bonus: 2,
            min_score: SimpleFunc::parse("G,20,8").unwrap(),
            score_floor: SimpleFunc::constant(0.0),
            local: true,
            ..Scoring::default_end_to_end()
        }
    }

    #[inline]
    pub fn score_match(&self) -> i64 {
        self.match_bonus
    }

    /// Penalty for a mismatch at the given quality (non-negative).
    #[inline]
    pub fn score_mismatch(&self, qual: u8) -> i64 {
        match self.mm_kind {
            PenaltyKind::Constant => self.mm_penalty_max,
            PenaltyKind::QualScaled => {
                let q = (qual as u32).min(QUAL_CEILING);
                ((self.mm_penalty_max as f64) * (q as f64) / (QUAL_CEILING as f64)).round() as i64
            }
        }
    }

    /// Penalty for a position where either base is N (non-negative).
    #[inline]
    pub fn score_n(&self, qual: u8) -> i64 {
        if self.n_as_mm {
            // Treated as a maximum-penalty mismatch
            let _ = qual;
            self.mm_penalty_max
        } else {
            self.n_penalty
        }
    }

    /// Affine cost of a gap of `len` bases in the read (insertion in the
    /// reference frame).
    #[inline]
    pub fn score_read_gap(&self, len: i64) -> i64 {
        self.read_gap_open + len * self.read_gap_extend
    }

    /// Affine cost of a gap of `len` bases in the reference.
    #[inline]
    pub fn score_ref_gap(&self, len: i64) -> i64 {
        self.ref_gap_open + len * self.ref_gap_extend
    }

    /// Minimum valid alignment score for a read of the given length.
    #[inline]
    pub fn min_score(&self, read_len: usize) -> i64 {
        self.min_score.eval_i64(read_len as f64)
    }

    /// Local-alignment score floor; `i64::MIN` in end-to-end mode.
    #[inline]
    pub fn floor(&self, read_len: usize) -> i64 {
        if self.local {
            self.score_floor.eval_i64(read_len as f64)
        } else {
            i64::MIN
        }
    }

    /// Maximum number of Ns tolerated in a read of the given length.
    #[inline]
    pub fn n_ceiling(&self, read_len: usize) -> usize {
        let c = self.n_ceiling.eval_i64(read_len as f64).max(0) as usize;
        c.min(read_len)
    }

    /// Interval between seed positions, at least 1.
    #[inline]
    pub fn interval(&self, read_len: usize) -> usize {
        self.seed_interval.eval(read_len as f64).ceil().max(1.0) as usize
    }

    /// Best achievable score for a read of the given length.
    #[inline]
    pub fn perfect_score(&self, read_len: usize) -> i64 {
        self.match_bonus * read_len as i64
    }

    /// N filter: true when the read passes (N count within the ceiling).
    pub fn n_filter(&self, read: &Read) -> bool {
        let n_count = read.seq.iter().filter(|&&b| b > 3).count();
        n_count <= self.n_ceiling(read.len())
    }

    /// N filter for a pair. With `n_cat_pair` the mates are treated as
    /// one concatenated read; otherwise each is filtered independently.
    pub fn n_filter_pair(&self, rd1: &Read, rd2: Option<&Read>) -> (bool, bool) {
        match rd2 {
            Some(rd2) if self.n_cat_pair => {
                let total_len = rd1.len() + rd2.len();
                let n_count = rd1.seq.iter().chain(rd2.seq.iter()).filter(|&&b| b > 3).count();
                let pass = n_count <= self.n_ceiling(total_len);
                (pass, pass)
            }
            Some(rd2) => (self.n_filter(rd1), self.n_filter(rd2)),
            None => (self.n_filter(rd1), true),
        }
    }

    /// Score filter: can a read of this length reach the minimum score
    /// at all?
    #[inline]
    pub fn score_filter(&self, min_sc: i64, read_len: usize) -> bool {
        self.perfect_score(read_len) >= min_sc
    }

    /// True when base qualities feed into the cost model.
    #[inline]
    pub fn qualities_matter(&self) -> bool {
        self.mm_kind == PenaltyKind::QualScaled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::read::Read;

    fn read_from(seq: &[u8], qual: u8) -> Read {
        Read::from_codes("r0", seq.to_vec(), vec![qual; seq.len()], 7)
    }

    #[test]
    fn test_default_min_score_linear() {
        let sc = Scoring::default_end_to_end();
        // L,-0.6,-0.6 at len 100: -0.6 - 60 = -60.6 -> -61
        assert_eq!(sc.min_score(100), -61);
    }

    #[test]
    fn test_mismatch_qual_scaling() {
        let sc = Scoring::default_end_to_end();
        assert_eq!(sc.score_mismatch(40), 6);
        assert_eq!(sc.score_mismatch(93), 6); // capped at 40
        assert_eq!(sc.score_mismatch(20), 3);
        assert_eq!(sc.score_mismatch(0), 0);
    }

    #[test]
    fn test_mismatch_constant() {
        let mut sc = Scoring::default_end_to_end();
        sc.mm_kind = PenaltyKind::Constant;
        assert_eq!(sc.score_mismatch(2), 6);
    }

    #[test]
    fn test_gap_costs_affine() {
        let sc = Scoring::default_end_to_end();
        assert_eq!(sc.score_read_gap(1), 8);
        assert_eq!(sc.score_read_gap(3), 14);
        assert_eq!(sc.score_ref_gap(2), 11);
    }

    #[test]
    fn test_n_filter() {
        let sc = Scoring::default_end_to_end();
        // 20-base read: ceiling = 0 + 0.15*20 = 3
        let mut codes = vec![0u8; 20];
        codes[0] = 4;
        codes[1] = 4;
        codes[2] = 4;
        assert!(sc.n_filter(&read_from(&codes, 30)));
        codes[3] = 4;
        assert!(!sc.n_filter(&read_from(&codes, 30)));
    }

    #[test]
    fn test_n_filter_pair_concat() {
        let mut sc = Scoring::default_end_to_end();
        sc.n_cat_pair = true;
        // Two 10-base mates: combined ceiling = 3
        let mut codes1 = vec![0u8; 10];
        let codes2 = vec![1u8; 10];
        codes1[0] = 4;
        codes1[1] = 4;
        let (f1, f2) = sc.n_filter_pair(&read_from(&codes1, 30), Some(&read_from(&codes2, 30)));
        assert!(f1 && f2);
    }

    #[test]
    fn test_seed_interval_floor_one() {
        let sc = Scoring::default_end_to_end();
        assert!(sc.interval(1) >= 1);
        assert_eq!(sc.interval(100), 14); // ceil(1 + 12.5)
    }

    #[test]
    fn test_score_filter_end_to_end() {
        let sc = Scoring::default_end_to_end();
        // Perfect score 0 always clears a negative threshold
        assert!(sc.score_filter(sc.min_score(50), 50));
    }
}
