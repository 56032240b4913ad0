// Banded affine-gap dynamic programming.
//
// Two cooperating kernel families:
//
//   * striped vector kernels (8-bit unsigned lanes, then 16-bit signed
//     lanes when 8-bit saturates) compute the best score quickly and
//     reject windows that cannot reach the minimum score;
//   * a scalar banded kernel with a full affine traceback runs only for
//     accepted windows and produces the edit script.
//
// Scores are kept in a shifted representation inside the 8-bit kernel:
// stored = score - (minsc - 1) in end-to-end mode, so a stored zero is
// a dead cell and saturating-at-zero arithmetic prunes below-threshold
// paths exactly (the end-to-end match bonus is zero, so no pruned path
// can recover). Local mode stores raw scores and clamps at zero as
// usual.
//
// Row/column conventions: rows are read positions, columns are window
// offsets. A horizontal move consumes a reference base (read gap, D);
// a vertical move consumes a read base (reference gap, I). The gap
// barrier forbids gap opens within `gap_barrier` read positions of
// either end of the read.

use crate::metrics::SwMetrics;
use crate::random::ReadRng;
use crate::read::BASE_N;
use crate::scoring::Scoring;
use crate::simd::{simd_available, LANES_I16, LANES_U8, V16, V8};

const NEG_INF: i32 = i32::MIN / 2;

/// Traceback encoding: two bits for the H source plus one bit each for
/// "E extended" and "F extended".
const H_STOP: u8 = 0;
const H_DIAG: u8 = 1;
const H_FROM_F: u8 = 2; // vertical, reference gap
const H_FROM_E: u8 = 3; // horizontal, read gap
const E_EXT: u8 = 1 << 2;
const F_EXT: u8 = 1 << 3;

/// Inputs to one DP call.
pub struct DpParams<'a> {
    /// Read codes, 5' to 3' in the orientation being aligned.
    pub query: &'a [u8],
    /// Qualities parallel to `query`.
    pub quals: &'a [u8],
    /// Reference window codes.
    pub ref_win: &'a [u8],
    /// Minimum valid score for this read length.
    pub minsc: i64,
    pub local: bool,
    /// No gap may open within this many read positions of either end.
    pub gap_barrier: usize,
    /// Column of the diagonal through read position 0.
    pub band_center: usize,
    /// Band half-width around that diagonal.
    pub maxhalf: usize,
}

/// A scored edit script anchored in the reference window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwAlignment {
    pub score: i64,
    /// First window column consumed by the alignment.
    pub ref_start: usize,
    /// One past the last window column consumed.
    pub ref_end: usize,
    /// First read position consumed (nonzero only in local mode).
    pub read_start: usize,
    /// One past the last read position consumed.
    pub read_end: usize,
    /// CIGAR-equivalent ops: (op, run) with op in b"MIDS".
    pub cigar: Vec<(u8, u32)>,
}

#[derive(Debug, Clone, Copy)]
struct VectorScore {
    best: i64,
    saturated: bool,
}

/// The DP aligner. Owns all scratch so repeated calls allocate nothing
/// once the buffers have grown to the working size.
pub struct SwAligner {
    use_simd: bool,
    // scalar matrices, row-major (m+1) x (n+1)
    h: Vec<i32>,
    e: Vec<i32>,
    f: Vec<i32>,
    tb: Vec<u8>,
    // striped kernel scratch
    prof_u8: Vec<u8>,
    h_u8: Vec<u8>,
    h2_u8: Vec<u8>,
    e_u8: Vec<u8>,
    prof_i16: Vec<i16>,
    h_i16: Vec<i16>,
    h2_i16: Vec<i16>,
    e_i16: Vec<i16>,
    // candidate end cells from the last scalar fill
    cells: Vec<(i64, usize, usize)>,
}

impl SwAligner {
    pub fn new(use_simd: bool) -> Self {
        SwAligner {
            use_simd: use_simd && simd_available(),
            h: Vec::new(),
            e: Vec::new(),
            f: Vec::new(),
            tb: Vec::new(),
            prof_u8: Vec::new(),
            h_u8: Vec::new(),
            h2_u8: Vec::new(),
            e_u8: Vec::new(),
            prof_i16: Vec::new(),
            h_i16: Vec::new(),
            h2_i16: Vec::new(),
            e_i16: Vec::new(),
            cells: Vec::new(),
        }
    }

    /// Align `query` against the window. Returns the best alignment at
    /// or above the minimum score, or None. `rnd` breaks ties between
    /// equal-ranked end cells.
    pub fn align(
        &mut self,
        sc: &Scoring,
        p: &DpParams,
        rnd: &mut ReadRng,
        met: &mut SwMetrics,
    ) -> Option<SwAlignment> {
        let m = p.query.len();
        let n = p.ref_win.len();
        if m == 0 || n == 0 {
            return None;
        }

        if self.use_simd {
            // Shifted stored values must fit a u8 lane with headroom
            let span = if p.local {
                sc.perfect_score(m)
            } else {
                1 - p.minsc
            };
            let vs = if span < 250 {
                met.dp_u8 += 1;
                let vs = self.vector_score_u8(sc, p);
                if vs.saturated {
                    met.sat_retries += 1;
                    met.dp_i16 += 1;
                    self.vector_score_i16(sc, p)
                } else {
                    vs
                }
            } else {
                met.dp_i16 += 1;
                self.vector_score_i16(sc, p)
            };
            met.cells += (m * n) as u64;
            if vs.best < p.minsc {
                return None; // fast reject, no traceback work
            }
        }

        let best = self.fill_scalar(sc, p);
        if !self.use_simd {
            met.cells += (m * n) as u64;
        }
        if best < p.minsc {
            return None;
        }
        met.backtraces += 1;
        self.backtrace_best(p, rnd)
    }

    /// Candidate end cells of the last fill, ranked by score then row,
    /// ties shuffled by `rnd`.
    fn ranked_cells(&mut self, rnd: &mut ReadRng) -> Vec<(i64, usize, usize)> {
        let mut cells = std::mem::take(&mut self.cells);
        cells.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
        let mut i = 0;
        while i < cells.len() {
            let mut j = i + 1;
            while j < cells.len() && cells[j].0 == cells[i].0 && cells[j].1 == cells[i].1 {
                j += 1;
            }
            for k in ((i + 1)..j).rev() {
                let swap_with = i + rnd.below(k - i + 1);
                cells.swap(k, swap_with);
            }
            i = j;
        }
        cells
    }

    // ===== scalar banded kernel =====

    /// Fill H/E/F plus the traceback matrix inside the band and collect
    /// candidate end cells. Returns the best end-cell score.
    fn fill_scalar(&mut self, sc: &Scoring, p: &DpParams) -> i64 {
        let m = p.query.len();
        let n = p.ref_win.len();
        let w = (m + 1) * (n + 1);
        self.h.clear();
        self.h.resize(w, NEG_INF);
        self.e.clear();
        self.e.resize(w, NEG_INF);
        self.f.clear();
        self.f.resize(w, NEG_INF);
        self.tb.clear();
        self.tb.resize(w, H_STOP);
        self.cells.clear();

        let idx = |i: usize, j: usize| i * (n + 1) + j;
        let oe_rd = (sc.read_gap_open + sc.read_gap_extend) as i32;
        let e_rd = sc.read_gap_extend as i32;
        let oe_rf = (sc.ref_gap_open + sc.ref_gap_extend) as i32;
        let e_rf = sc.ref_gap_extend as i32;

        // Row 0 boundary: free start at any window column
        for j in 0..=n {
            self.h[idx(0, j)] = 0;
        }

        let mut best = NEG_INF as i64;
        for i in 1..=m {
            let qi = p.query[i - 1];
            let qq = p.quals[i - 1];
            // read position i-1; gap opens forbidden near either end
            let in_barrier = (i - 1) < p.gap_barrier || (i - 1) >= m - p.gap_barrier.min(m);
            let diag = p.band_center as i64 + (i as i64 - 1);
            let jlo = (diag - p.maxhalf as i64).max(0) as usize + 1;
            let jhi = ((diag + p.maxhalf as i64) as usize + 1).min(n);
            if jlo > jhi {
                continue;
            }
            for j in jlo..=jhi {
                let rj = p.ref_win[j - 1];
                let cell = if qi >= BASE_N || rj >= BASE_N {
                    -(sc.score_n(qq) as i32)
                } else if qi == rj {
                    sc.score_match() as i32
                } else {
                    -(sc.score_mismatch(qq) as i32)
                };

                // E: horizontal (read gap), arriving from column j-1
                let h_left = self.h[idx(i, j - 1)];
                let e_left = self.e[idx(i, j - 1)];
                let e_open = if in_barrier { NEG_INF } else { h_left.saturating_sub(oe_rd) };
                let e_ext = e_left.saturating_sub(e_rd);
                let (e_val, e_is_ext) = if e_ext > e_open { (e_ext, true) } else { (e_open, false) };
                self.e[idx(i, j)] = e_val;

                // F: vertical (reference gap), arriving from row i-1
                let h_up = self.h[idx(i - 1, j)];
                let f_up = self.f[idx(i - 1, j)];
                let f_open = if in_barrier { NEG_INF } else { h_up.saturating_sub(oe_rf) };
                let f_ext = f_up.saturating_sub(e_rf);
                let (f_val, f_is_ext) = if f_ext > f_open { (f_ext, true) } else { (f_open, false) };
                self.f[idx(i, j)] = f_val;

                let h_diag = self.h[idx(i - 1, j - 1)].saturating_add(cell);
                let mut h_val = h_diag;
                let mut src = H_DIAG;
                if f_val > h_val {
                    h_val = f_val;
                    src = H_FROM_F;
                }
                if e_val > h_val {
                    h_val = e_val;
                    src = H_FROM_E;
                }
                if p.local && h_val < 0 {
                    h_val = 0;
                    src = H_STOP;
                }
                self.h[idx(i, j)] = h_val;
                let mut code = src;
                if e_is_ext {
                    code |= E_EXT;
                }
                if f_is_ext {
                    code |= F_EXT;
                }
                self.tb[idx(i, j)] = code;

                let score = h_val as i64;
                if score >= p.minsc && src != H_STOP {
                    let is_end = if p.local { true } else { i == m };
                    if is_end {
                        if score > best {
                            best = score;
                        }
                        if self.cells.len() < 128 {
                            self.cells.push((score, i, j));
                        } else if let Some(worst) =
                            self.cells.iter().enumerate().min_by_key(|(_, c)| c.0).map(|(k, _)| k)
                        {
                            if self.cells[worst].0 < score {
                                self.cells[worst] = (score, i, j);
                            }
                        }
                    }
                }
            }
        }
        best
    }

    /// Backtrace the best-ranked candidate cell into an edit script.
    fn backtrace_best(&mut self, p: &DpParams, rnd: &mut ReadRng) -> Option<SwAlignment> {
        let n = p.ref_win.len();
        let m = p.query.len();
        let cells = self.ranked_cells(rnd);
        let &(score, end_i, end_j) = cells.first()?;
        let idx = |i: usize, j: usize| i * (n + 1) + j;

        let mut ops: Vec<(u8, u32)> = Vec::new();
        let mut push = |ops: &mut Vec<(u8, u32)>, op: u8| {
            if let Some(last) = ops.last_mut() {
                if last.0 == op {
                    last.1 += 1;
                    return;
                }
            }
            ops.push((op, 1));
        };

        let mut i = end_i;
        let mut j = end_j;
        // 0 = H, 1 = E (horizontal chain), 2 = F (vertical chain)
        let mut state = 0u8;
        loop {
            if state == 0 {
                if i == 0 {
                    break;
                }
                if p.local && self.h[idx(i, j)] == 0 {
                    break;
                }
                let code = self.tb[idx(i, j)];
                match code & 0b11 {
                    H_DIAG => {
                        push(&mut ops, b'M');
                        i -= 1;
                        j -= 1;
                    }
                    H_FROM_E => state = 1,
                    H_FROM_F => state = 2,
                    _ => break, // H_STOP
                }
            } else if state == 1 {
                // horizontal: consume a reference base
                let code = self.tb[idx(i, j)];
                push(&mut ops, b'D');
                j -= 1;
                if code & E_EXT == 0 {
                    state = 0;
                }
            } else {
                // vertical: consume a read base
                let code = self.tb[idx(i, j)];
                push(&mut ops, b'I');
                i -= 1;
                if code & F_EXT == 0 {
                    state = 0;
                }
            }
        }

        let read_start = i;
        let ref_start = j;
        ops.reverse();

        let mut cigar = Vec::new();
        if read_start > 0 {
            cigar.push((b'S', read_start as u32));
        }
        cigar.extend(ops);
        if end_i < m {
            cigar.push((b'S', (m - end_i) as u32));
        }

        debug_assert!(
            p.local || (read_start == 0 && end_i == m),
            "end-to-end alignment must consume the whole read"
        );
        debug_assert_eq!(
            cigar.iter().map(|&(op, l)| if op != b'D' { l } else { 0 }).sum::<u32>(),
            m as u32,
            "CIGAR must account for every read base"
        );

        Some(SwAlignment {
            score,
            ref_start,
            ref_end: end_j,
            read_start,
            read_end: end_i,
            cigar,
        })
    }

    // ===== striped 8-bit kernel =====

    /// Best score via the striped 8-bit kernel, with saturation detect.
    fn vector_score_u8(&mut self, sc: &Scoring, p: &DpParams) -> VectorScore {
        let m = p.query.len();
        let seg = (m + LANES_U8 - 1) / LANES_U8;
        // bias makes every profile entry non-negative
        let max_pen = sc
            .mm_penalty_max
            .max(sc.n_penalty)
            .max(1) as u8;
        let zero_base: i64 = if p.local { 0 } else { p.minsc - 1 };
        let boundary = (0i64 - zero_base) as u8; // stored value of score 0

        // Build the striped profile: prof[s][t*LANES + lane]
        self.prof_u8.clear();
        self.prof_u8.resize(5 * seg * LANES_U8, 0);
        for s in 0..5u8 {
            for t in 0..seg {
                for lane in 0..LANES_U8 {
                    let row = t + lane * seg;
                    let v = if row < m {
                        let q = p.query[row];
                        let qq = p.quals[row];
                        let raw = if q >= BASE_N || s >= BASE_N {
                            -(sc.score_n(qq))
                        } else if q == s {
                            sc.score_match()
                        } else {
                            -(sc.score_mismatch(qq))
                        };
                        (raw + max_pen as i64) as u8
                    } else {
                        0
                    };
                    self.prof_u8[(s as usize * seg + t) * LANES_U8 + lane] = v;
                }
            }
        }

        let stride = seg * LANES_U8;
        self.h_u8.clear();
        self.h_u8.resize(stride, 0);
        self.h2_u8.clear();
        self.h2_u8.resize(stride, 0);
        self.e_u8.clear();
        self.e_u8.resize(stride, 0);

        // Gap-open masks: zero lanes for read rows inside the barrier
        let mut open_mask = vec![0xffu8; stride];
        for t in 0..seg {
            for lane in 0..LANES_U8 {
                let row = t + lane * seg;
                if row < m && (row < p.gap_barrier || row >= m - p.gap_barrier.min(m)) {
                    open_mask[t * LANES_U8 + lane] = 0;
                }
            }
        }

        let oe_rd = (sc.read_gap_open + sc.read_gap_extend) as u8;
        let e_rd = sc.read_gap_extend as u8;
        let oe_rf = (sc.ref_gap_open + sc.ref_gap_extend) as u8;
        let e_rf = sc.ref_gap_extend as u8;

        let last_vec = (m - 1) % seg;
        let last_lane = (m - 1) / seg;

        let mut best_stored = 0u8;
        let mut saturated = false;

        unsafe {
            let v_bias = V8::splat(max_pen);
            let v_sat = V8::splat(255);
            let v_oe_rd = V8::splat(oe_rd);
            let v_e_rd = V8::splat(e_rd);
            let v_oe_rf = V8::splat(oe_rf);
            let v_e_rf = V8::splat(e_rf);
            let mut v_first = [0u8; LANES_U8];
            v_first[0] = boundary;
            let v_first = V8::load(v_first.as_ptr());
            let mut v_max = V8::zero();

            'cols: for &rj in p.ref_win {
                let prof_base = rj.min(4) as usize * seg;
                let mut v_f = V8::zero();
                // Diagonal feed: last stripe of the previous column,
                // shifted down one lane; lane 0 takes the row-0 boundary
                let mut v_h = V8::load(self.h_u8.as_ptr().add((seg - 1) * LANES_U8))
                    .shift_lane()
                    .max(v_first);

                for t in 0..seg {
                    let v_prof = V8::load(self.prof_u8.as_ptr().add((prof_base + t) * LANES_U8));
                    v_h = v_h.adds(v_prof);
                    if v_h.cmpeq(v_sat).movemask() != 0 {
                        saturated = true;
                        break 'cols;
                    }
                    v_h = v_h.subs(v_bias);

                    let v_e = V8::load(self.e_u8.as_ptr().add(t * LANES_U8));
                    v_h = v_h.max(v_e).max(v_f);
                    v_max = v_max.max(v_h);
                    v_h.store(self.h2_u8.as_mut_ptr().add(t * LANES_U8));

                    let v_mask = V8::load(open_mask.as_ptr().add(t * LANES_U8));
                    let v_open_e = v_h.subs(v_oe_rd).and(v_mask);
                    v_e.subs(v_e_rd).max(v_open_e).store(self.e_u8.as_mut_ptr().add(t * LANES_U8));
                    let v_open_f = v_h.subs(v_oe_rf).and(v_mask);
                    v_f = v_f.subs(v_e_rf).max(v_open_f);

                    v_h = V8::load(self.h_u8.as_ptr().add(t * LANES_U8));
                }

                // Lazy F: propagate vertical gaps across stripe seams
                let mut t = 0usize;
                let mut rounds = 0usize;
                v_f = v_f.shift_lane();
                loop {
                    let v_h_cur = V8::load(self.h2_u8.as_ptr().add(t * LANES_U8));
                    let v_new = v_h_cur.max(v_f);
                    // stop when F no longer improves anything
                    if v_new.cmpeq(v_h_cur).movemask() == 0xffff {
                        break;
                    }
                    v_new.store(self.h2_u8.as_mut_ptr().add(t * LANES_U8));
                    v_max = v_max.max(v_new);
                    v_f = v_f.subs(v_e_rf);
                    t += 1;
                    if t == seg {
                        t = 0;
                        v_f = v_f.shift_lane();
                        rounds += 1;
                        if rounds > LANES_U8 {
                            break;
                        }
                    }
                }

                std::mem::swap(&mut self.h_u8, &mut self.h2_u8);

                if !p.local {
                    // End-to-end scores come from the last read row only
                    let v = self.h_u8[last_vec * LANES_U8 + last_lane];
                    if v > best_stored {
                        best_stored = v;
                    }
                }
            }

            if p.local {
                best_stored = v_max.hmax();
            }
        }

        VectorScore {
            best: best_stored as i64 + zero_base,
            saturated,
        }
    }

    // ===== striped 16-bit kernel =====

    /// Best score via the striped 16-bit kernel. Stored values use the
    /// same shifted representation, wide enough for any read length the
    /// engine accepts.
    fn vector_score_i16(&mut self, sc: &Scoring, p: &DpParams) -> VectorScore {
        let m = p.query.len();
        let seg = (m + LANES_I16 - 1) / LANES_I16;
        let zero_base: i64 = if p.local { 0 } else { p.minsc - 1 };
        let boundary = (0i64 - zero_base) as i16;

        self.prof_i16.clear();
        self.prof_i16.resize(5 * seg * LANES_I16, 0);
        for s in 0..5u8 {
            for t in 0..seg {
                for lane in 0..LANES_I16 {
                    let row = t + lane * seg;
                    let v = if row < m {
                        let q = p.query[row];
                        let qq = p.quals[row];
                        let raw = if q >= BASE_N || s >= BASE_N {
                            -(sc.score_n(qq))
                        } else if q == s {
                            sc.score_match()
                        } else {
                            -(sc.score_mismatch(qq))
                        };
                        raw as i16
                    } else {
                        i16::MIN / 2
                    };
                    self.prof_i16[(s as usize * seg + t) * LANES_I16 + lane] = v;
                }
            }
        }

        let stride = seg * LANES_I16;
        self.h_i16.clear();
        self.h_i16.resize(stride, 0);
        self.h2_i16.clear();
        self.h2_i16.resize(stride, 0);
        self.e_i16.clear();
        self.e_i16.resize(stride, 0);

        let mut open_mask = vec![-1i16; stride];
        for t in 0..seg {
            for lane in 0..LANES_I16 {
                let row = t + lane * seg;
                if row < m && (row < p.gap_barrier || row >= m - p.gap_barrier.min(m)) {
                    open_mask[t * LANES_I16 + lane] = 0;
                }
            }
        }

        let oe_rd = (sc.read_gap_open + sc.read_gap_extend) as i16;
        let e_rd = sc.read_gap_extend as i16;
        let oe_rf = (sc.ref_gap_open + sc.ref_gap_extend) as i16;
        let e_rf = sc.ref_gap_extend as i16;

        let last_vec = (m - 1) % seg;
        let last_lane = (m - 1) / seg;

        let mut best_stored = 0i16;

        unsafe {
            let v_zero = V16::splat(0);
            let v_oe_rd = V16::splat(oe_rd);
            let v_e_rd = V16::splat(e_rd);
            let v_oe_rf = V16::splat(oe_rf);
            let v_e_rf = V16::splat(e_rf);
            let mut v_first = [0i16; LANES_I16];
            v_first[0] = boundary;
            let v_first = V16::load(v_first.as_ptr());
            let mut v_max = V16::splat(0);

            for &rj in p.ref_win {
                let prof_base = rj.min(4) as usize * seg;
                let mut v_f = V16::splat(0);
                let mut v_h = V16::load(self.h_i16.as_ptr().add((seg - 1) * LANES_I16))
                    .shift_lane()
                    .max(v_first);

                for t in 0..seg {
                    let v_prof = V16::load(self.prof_i16.as_ptr().add((prof_base + t) * LANES_I16));
                    v_h = v_h.adds(v_prof).max(v_zero);

                    let v_e = V16::load(self.e_i16.as_ptr().add(t * LANES_I16));
                    v_h = v_h.max(v_e).max(v_f);
                    v_max = v_max.max(v_h);
                    v_h.store(self.h2_i16.as_mut_ptr().add(t * LANES_I16));

                    let v_mask = V16::load(open_mask.as_ptr().add(t * LANES_I16));
                    let v_open_e = v_h.subs(v_oe_rd).max(v_zero).and(v_mask);
                    v_e.subs(v_e_rd)
                        .max(v_open_e)
                        .max(v_zero)
                        .store(self.e_i16.as_mut_ptr().add(t * LANES_I16));
                    let v_open_f = v_h.subs(v_oe_rf).max(v_zero).and(v_mask);
                    v_f = v_f.subs(v_e_rf).max(v_open_f).max(v_zero);

                    v_h = V16::load(self.h_i16.as_ptr().add(t * LANES_I16));
                }

                let mut t = 0usize;
                let mut rounds = 0usize;
                v_f = v_f.shift_lane();
                loop {
                    let v_h_cur = V16::load(self.h2_i16.as_ptr().add(t * LANES_I16));
                    let v_new = v_h_cur.max(v_f);
                    let mut same = true;
                    let mut a = [0i16; LANES_I16];
                    let mut b = [0i16; LANES_I16];
                    v_new.store(a.as_mut_ptr());
                    v_h_cur.store(b.as_mut_ptr());
                    for l in 0..LANES_I16 {
                        if a[l] != b[l] {
                            same = false;
                            break;
                        }
                    }
                    if same {
                        break;
                    }
                    v_new.store(self.h2_i16.as_mut_ptr().add(t * LANES_I16));
                    v_max = v_max.max(v_new);
                    v_f = v_f.subs(v_e_rf);
                    t += 1;
                    if t == seg {
                        t = 0;
                        v_f = v_f.shift_lane();
                        rounds += 1;
                        if rounds > LANES_I16 {
                            break;
                        }
                    }
                }

                std::mem::swap(&mut self.h_i16, &mut self.h2_i16);

                if !p.local {
                    let v = self.h_i16[last_vec * LANES_I16 + last_lane];
                    if v > best_stored {
                        best_stored = v;
                    }
                }
            }

            if p.local {
                best_stored = v_max.hmax();
            }
        }

        VectorScore {
            best: best_stored as i64 + zero_base,
            saturated: false,
        }
    }
}
