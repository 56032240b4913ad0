// Extension driver.
//
// Takes the ranked seed-hit table, resolves hits to reference
// coordinates through the group walk, runs the DP aligner on a window
// around each coordinate, and feeds candidates to the reporting sink.
// For paired reads each anchor candidate immediately attempts a mate
// rescue DP in the window implied by the paired-end policy.
//
// Redundant extensions (same diagonal already tried) are counted and
// skipped. The driver stops as soon as the sink's appetite is
// satisfied, or when the hit table is exhausted.

use std::collections::HashSet;

use crate::cache::CacheIface;
use crate::index::SeedIndex;
use crate::metrics::{SwMetrics, WalkMetrics};
use crate::pe::PairedEndPolicy;
use crate::random::ReadRng;
use crate::read::{Orientation, Read};
use crate::scoring::Scoring;
use crate::seed_search::SeedResults;
use crate::sink::{AlnCandidate, SinkWrap};
use crate::swa::{DpParams, SwAligner};
use crate::walk::OffsetResolver;

/// Outcome of driving one mate's hit table.
#[derive(Debug, Clone, Copy)]
pub struct ExtendOutcome {
    /// The sink's appetite was satisfied.
    pub done: bool,
    /// Every hit's budgeted positions were tried.
    pub exhausted: bool,
}

pub struct SwDriver {
    /// DP aligner for the anchor mate.
    sw: SwAligner,
    /// DP aligner for the opposite mate (rescue).
    osw: SwAligner,
    /// Diagonals already extended this read, per mate.
    seen: [HashSet<(usize, i64, bool)>; 2],
}

impl SwDriver {
    pub fn new(use_simd: bool) -> Self {
        SwDriver {
            sw: SwAligner::new(use_simd),
            osw: SwAligner::new(use_simd),
            seen: [HashSet::new(), HashSet::new()],
        }
    }

    /// Reset per-read state. Call once per read, before either mate.
    pub fn next_read(&mut self) {
        self.seen[0].clear();
        self.seen[1].clear();
    }

    /// Extend one mate's seed hits, unpaired.
    #[allow(clippy::too_many_arguments)]
    pub fn extend_unpaired(
        &mut self,
        idx: &SeedIndex,
        sc: &Scoring,
        read: &Read,
        mate: usize,
        hits: &SeedResults,
        resolver: &OffsetResolver,
        dpad: usize,
        maxhalf: usize,
        gap_barrier: usize,
        cache: &mut CacheIface,
        sink: &mut SinkWrap,
        rnd: &mut ReadRng,
        wlm: &mut WalkMetrics,
        swm: &mut SwMetrics,
    ) -> ExtendOutcome {
        let minsc = sc.min_score(read.len());
        for hit in hits.hits() {
            let coords =
                resolver.resolve_range(idx, hit.range, &hit.key, &hit.matched, cache, wlm);
            for (rid, off) in coords {
                if sink.done_with_mate(mate) {
                    return ExtendOutcome { done: true, exhausted: false };
                }
                let diag = off as i64 - hit.read_off as i64;
                if !self.seen[mate].insert((rid, diag, hit.orient.is_fw())) {
                    swm.redundant += 1;
                    continue;
                }
                if let Some(cand) = extend_at(
                    &mut self.sw,
                    idx,
                    sc,
                    read,
                    mate,
                    hit.orient,
                    rid,
                    diag,
                    minsc,
                    dpad,
                    maxhalf,
                    gap_barrier,
                    rnd,
                    swm,
                ) {
                    if !sink.report_unpaired(cand) {
                        swm.redundant += 1;
                    }
                }
            }
        }
        ExtendOutcome {
            done: sink.done_with_mate(mate),
            exhausted: true,
        }
    }

    /// Extend one mate's seed hits as the anchor of a pair. Every
    /// anchor candidate triggers a mate-rescue DP in the policy's
    /// window; concordant combinations go to the sink as pairs, and
    /// the anchor is always retained as an unpaired candidate so the
    /// discordant/mixed fallbacks have material to work with.
    #[allow(clippy::too_many_arguments)]
    pub fn extend_paired(
        &mut self,
        idx: &SeedIndex,
        sc: &Scoring,
        anchor_rd: &Read,
        opp_rd: &Read,
        anchor_mate: usize,
        hits: &SeedResults,
        pe: &PairedEndPolicy,
        resolver: &OffsetResolver,
        dpad: usize,
        maxhalf: usize,
        gap_barrier: usize,
        cache: &mut CacheIface,
        sink: &mut SinkWrap,
        rnd: &mut ReadRng,
        wlm: &mut WalkMetrics,
        swm_seed: &mut SwMetrics,
        swm_mate: &mut SwMetrics,
    ) -> ExtendOutcome {
        let minsc = sc.min_score(anchor_rd.len());
        let opp_minsc = sc.min_score(opp_rd.len());
        for hit in hits.hits() {
            let coords =
                resolver.resolve_range(idx, hit.range, &hit.key, &hit.matched, cache, wlm);
            for (rid, off) in coords {
                if sink.done_with_pairs() {
                    return ExtendOutcome { done: true, exhausted: false };
                }
                let diag = off as i64 - hit.read_off as i64;
                if !self.seen[anchor_mate].insert((rid, diag, hit.orient.is_fw())) {
                    swm_seed.redundant += 1;
                    continue;
                }
                let anchor = match extend_at(
                    &mut self.sw,
                    idx,
                    sc,
                    anchor_rd,
                    anchor_mate,
                    hit.orient,
                    rid,
                    diag,
                    minsc,
                    dpad,
                    maxhalf,
                    gap_barrier,
                    rnd,
                    swm_seed,
                ) {
                    Some(c) => c,
                    None => continue,
                };

                // Mate rescue in the window the policy implies
                let rescued = rescue_mate(
                    &mut self.osw,
                    idx,
                    sc,
                    pe,
                    &anchor,
                    opp_rd,
                    anchor_mate ^ 1,
                    opp_minsc,
                    gap_barrier,
                    rnd,
                    swm_mate,
                );
                let anchor_span = anchor.mate_span();
                let mut paired_up = false;
                if let Some(opp) = rescued {
                    let (s1, s2) = if anchor_mate == 0 {
                        (anchor_span, opp.mate_span())
                    } else {
                        (opp.mate_span(), anchor_span)
                    };
                    if pe.concordant(&s1, &s2) {
                        paired_up = sink.report_concordant(anchor.clone(), opp);
                    }
                }
                if !sink.report_unpaired(anchor) && !paired_up {
                    swm_seed.redundant += 1;
                }
            }
        }
        ExtendOutcome {
            done: sink.done_with_pairs(),
            exhausted: true,
        }
    }
}

/// Run one anchored DP: window the reference around the seed diagonal
/// and align the oriented read.
#[allow(clippy::too_many_arguments)]
fn extend_at(
    sw: &mut SwAligner,
    idx: &SeedIndex,
    sc: &Scoring,
    read: &Read,
    mate: usize,
    orient: Orientation,
    rid: usize,
    diag: i64,
    minsc: i64,
    dpad: usize,
    maxhalf: usize,
    gap_barrier: usize,
    rnd: &mut ReadRng,
    swm: &mut SwMetrics,
) -> Option<AlnCandidate> {
    let qlen = read.len() as i64;
    let win_lo = diag - dpad as i64;
    let win_hi = diag + qlen + dpad as i64;
    let (window, win_start) = idx.ref_window(rid, win_lo, win_hi);
    if window.is_empty() {
        return None;
    }
    let band_center = (diag - win_start as i64).max(0) as usize;

    let query = read.seq_for(orient);
    let quals: Vec<u8> = (0..read.len()).map(|i| read.qual_at(orient, i)).collect();
    let p = DpParams {
        query,
        quals: &quals,
        ref_win: window,
        minsc,
        local: sc.local,
        gap_barrier,
        band_center,
        maxhalf,
    };
    let aln = sw.align(sc, &p, rnd, swm)?;
    Some(AlnCandidate {
        ref_id: rid,
        ref_name: idx.pattern_name(rid).to_string(),
        ref_off: win_start + aln.ref_start as u64,
        orient,
        cigar: aln.cigar,
        score: aln.score,
        mate,
    })
}

/// Mate-finding DP: align the opposite mate inside the fragment window
/// implied by the anchor and the paired-end policy.
#[allow(clippy::too_many_arguments)]
fn rescue_mate(
    osw: &mut SwAligner,
    idx: &SeedIndex,
    sc: &Scoring,
    pe: &PairedEndPolicy,
    anchor: &AlnCandidate,
    opp_rd: &Read,
    opp_mate: usize,
    opp_minsc: i64,
    gap_barrier: usize,
    rnd: &mut ReadRng,
    swm: &mut SwMetrics,
) -> Option<AlnCandidate> {
    let anchor_span = anchor.mate_span();
    let (win_lo, win_hi) = pe.mate_window(&anchor_span, opp_rd.len() as i64);
    let (window, win_start) = idx.ref_window(anchor.ref_id, win_lo, win_hi);
    if window.len() < opp_rd.len() {
        return None;
    }
    let expect_fw = pe.expected_mate_fw(anchor.orient.is_fw());
    let orient = if expect_fw { Orientation::Fw } else { Orientation::Rc };
    let query = opp_rd.seq_for(orient);
    let quals: Vec<u8> = (0..opp_rd.len()).map(|i| opp_rd.qual_at(orient, i)).collect();
    // The rescue band covers the whole window: the mate may land
    // anywhere inside it
    let p = DpParams {
        query,
        quals: &quals,
        ref_win: window,
        minsc: opp_minsc,
        local: sc.local,
        gap_barrier,
        band_center: 0,
        maxhalf: window.len(),
    };
    let aln = osw.align(sc, &p, rnd, swm)?;
    Some(AlnCandidate {
        ref_id: anchor.ref_id,
        ref_name: anchor.ref_name.clone(),
        ref_off: win_start + aln.ref_start as u64,
        orient,
        cigar: aln.cigar,
        score: aln.score,
        mate: opp_mate,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheIface;
    use crate::metrics::SeedSearchMetrics;
    use crate::output::{OutputFormat, OutputSink};
    use crate::seed::{instantiate_seeds, SeedTemplate};
    use crate::seed_search::SeedSearcher;
    use crate::sink::{ReportingParams, SinkWrap};
    use std::io::Write;
    use std::sync::{Arc, Mutex};

    struct VecWriter(Arc<Mutex<Vec<u8>>>);

    impl Write for VecWriter {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn out_sink() -> OutputSink {
        OutputSink::new(
            OutputFormat::Sam,
            Box::new(VecWriter(Arc::new(Mutex::new(Vec::new())))),
        )
    }

    fn seed_and_rank(
        idx: &SeedIndex,
        read: &Read,
        seed_len: usize,
        cache: &mut CacheIface,
    ) -> SeedResults {
        let mut met = SeedSearchMetrics::default();
        let interval = 3;
        let (seeds, _, _) = instantiate_seeds(
            read,
            &[SeedTemplate::new(seed_len, 0)],
            interval,
            false,
            false,
            &mut met,
        );
        let mut results = SeedResults::default();
        SeedSearcher::search_all(idx, &seeds, cache, &mut results, &mut met);
        let mut rnd = ReadRng::seeded(read.seed, 10);
        results.rank(&mut rnd);
        results
    }

    #[test]
    fn test_extend_unpaired_finds_alignment() {
        let reference = "TTGACCAGTACGTACGGATTCAAGGACCTTAG";
        let idx = SeedIndex::build(&[("chr1".to_string(), reference.as_bytes().to_vec())], false);
        let read = Read::from_ascii("r1", "CAGTACGTACGG", "IIIIIIIIIIII", 11);
        let sc = Scoring::default_end_to_end();
        let mut cache = CacheIface::new(1 << 20, None, None);
        let hits = seed_and_rank(&idx, &read, 6, &mut cache);
        assert!(!hits.is_empty());

        let out = out_sink();
        let mut sink = SinkWrap::new(&out, ReportingParams::default(), PairedEndPolicy::default());
        sink.next_read(&read, None);
        let mut driver = SwDriver::new(true);
        driver.next_read();
        let mut rnd = ReadRng::seeded(read.seed, 10);
        let mut wlm = WalkMetrics::default();
        let mut swm = SwMetrics::default();
        let resolver = OffsetResolver::default().boosted(6.0);
        let out = driver.extend_unpaired(
            &idx, &sc, &read, 0, &hits, &resolver, 15, 15, 4, &mut cache, &mut sink, &mut rnd,
            &mut wlm, &mut swm,
        );
        assert!(out.exhausted || out.done);
        assert_eq!(sink.n_unpaired(0), 1);
    }

    #[test]
    fn test_redundant_diagonals_skipped() {
        // A read tiling one diagonal produces several seed hits but
        // only one DP extension
        let reference = "TTGACCAGTACGTACGGATTCAAGGACCTTAG";
        let idx = SeedIndex::build(&[("chr1".to_string(), reference.as_bytes().to_vec())], false);
        let read = Read::from_ascii("r1", "CAGTACGTACGG", "IIIIIIIIIIII", 11);
        let sc = Scoring::default_end_to_end();
        let mut cache = CacheIface::new(1 << 20, None, None);
        let hits = seed_and_rank(&idx, &read, 6, &mut cache);
        assert!(hits.len() > 1, "want multiple seed hits, got {}", hits.len());

        let out = out_sink();
        let mut sink = SinkWrap::new(&out, ReportingParams::default(), PairedEndPolicy::default());
        sink.next_read(&read, None);
        let mut driver = SwDriver::new(true);
        driver.next_read();
        let mut rnd = ReadRng::seeded(read.seed, 10);
        let mut wlm = WalkMetrics::default();
        let mut swm = SwMetrics::default();
        let resolver = OffsetResolver::default().boosted(6.0);
        driver.extend_unpaired(
            &idx, &sc, &read, 0, &hits, &resolver, 15, 15, 4, &mut cache, &mut sink, &mut rnd,
            &mut wlm, &mut swm,
        );
        assert!(swm.redundant > 0);
        assert_eq!(sink.n_unpaired(0), 1);
        // one backtrace: the duplicates never reached the DP
        assert_eq!(swm.backtraces, 1);
    }

    #[test]
    fn test_paired_rescue_concordant() {
        // 1 kb reference; mate1 fw at 50, mate2 is the revcomp of the
        // 30-mer ending at 380 (fragment 330)
        let mut reference = String::new();
        let alphabet = [b'A', b'C', b'G', b'T'];
        let mut x: u64 = 0x2545F4914F6CDD1D;
        for _ in 0..1000 {
            x ^= x << 13;
            x ^= x >> 7;
            x ^= x << 17;
            reference.push(alphabet[(x % 4) as usize] as char);
        }
        let m1_seq = &reference[50..80];
        let m2_tpl = &reference[350..380];
        let m2_seq: String = m2_tpl
            .bytes()
            .rev()
            .map(|b| match b {
                b'A' => 'T',
                b'C' => 'G',
                b'G' => 'C',
                _ => 'A',
            })
            .collect();
        let idx = SeedIndex::build(&[("chr1".to_string(), reference.as_bytes().to_vec())], false);
        let rd1 = Read::from_ascii("p1", m1_seq, &"I".repeat(30), 21);
        let rd2 = Read::from_ascii("p1", &m2_seq, &"I".repeat(30), 22);
        let sc = Scoring::default_end_to_end();
        let pe = PairedEndPolicy {
            min_frag: 100,
            max_frag: 400,
            ..PairedEndPolicy::default()
        };
        let mut cache = CacheIface::new(1 << 20, None, None);
        let hits = seed_and_rank(&idx, &rd1, 20, &mut cache);
        assert!(!hits.is_empty());

        let out = out_sink();
        let mut sink = SinkWrap::new(&out, ReportingParams::default(), pe.clone());
        sink.next_read(&rd1, Some(&rd2));
        let mut driver = SwDriver::new(true);
        driver.next_read();
        let mut rnd = ReadRng::seeded(rd1.seed ^ rd2.seed, 10);
        let mut wlm = WalkMetrics::default();
        let mut swm_seed = SwMetrics::default();
        let mut swm_mate = SwMetrics::default();
        let resolver = OffsetResolver::default().boosted(6.0).halved();
        driver.extend_paired(
            &idx, &sc, &rd1, &rd2, 0, &hits, &pe, &resolver, 15, 15, 4, &mut cache, &mut sink,
            &mut rnd, &mut wlm, &mut swm_seed, &mut swm_mate,
        );
        assert_eq!(sink.n_pairs(), 1, "expected one concordant pair");
        assert!(swm_mate.backtraces >= 1, "mate rescue should have run DP");
    }

    #[test]
    fn test_paired_rescue_fails_outside_window() {
        // mate2 placed far outside the fragment range: no pair, but the
        // anchor is retained for the discordant/mixed path
        let mut reference = String::new();
        let alphabet = [b'A', b'C', b'G', b'T'];
        let mut x: u64 = 0x9E3779B97F4A7C15;
        for _ in 0..3000 {
            x ^= x << 13;
            x ^= x >> 7;
            x ^= x << 17;
            reference.push(alphabet[(x % 4) as usize] as char);
        }
        let m1_seq = &reference[50..80];
        let idx = SeedIndex::build(&[("chr1".to_string(), reference.as_bytes().to_vec())], false);
        let rd1 = Read::from_ascii("p1", m1_seq, &"I".repeat(30), 21);
        // mate2 from position 2000, far beyond max_frag
        let m2_tpl = &reference[2000..2030];
        let m2_seq: String = m2_tpl
            .bytes()
            .rev()
            .map(|b| match b {
                b'A' => 'T',
                b'C' => 'G',
                b'G' => 'C',
                _ => 'A',
            })
            .collect();
        let rd2 = Read::from_ascii("p1", &m2_seq, &"I".repeat(30), 22);
        let sc = Scoring::default_end_to_end();
        let pe = PairedEndPolicy {
            min_frag: 100,
            max_frag: 400,
            ..PairedEndPolicy::default()
        };
        let mut cache = CacheIface::new(1 << 20, None, None);
        let hits = seed_and_rank(&idx, &rd1, 20, &mut cache);

        let out = out_sink();
        let mut sink = SinkWrap::new(&out, ReportingParams::default(), pe.clone());
        sink.next_read(&rd1, Some(&rd2));
        let mut driver = SwDriver::new(true);
        driver.next_read();
        let mut rnd = ReadRng::seeded(rd1.seed ^ rd2.seed, 10);
        let mut wlm = WalkMetrics::default();
        let mut swm_seed = SwMetrics::default();
        let mut swm_mate = SwMetrics::default();
        let resolver = OffsetResolver::default().boosted(6.0);
        driver.extend_paired(
            &idx, &sc, &rd1, &rd2, 0, &hits, &pe, &resolver, 15, 15, 4, &mut cache, &mut sink,
            &mut rnd, &mut wlm, &mut swm_seed, &mut swm_mate,
        );
        assert_eq!(sink.n_pairs(), 0);
        assert_eq!(sink.n_unpaired(0), 1);
    }
}
