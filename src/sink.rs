// Reporting sink: the per-read policy state machine plus mapping
// quality.
//
// The wrapper accumulates candidate alignments while the extension
// driver runs, decides when the reporting policy's appetite is
// satisfied, and renders final records at read finalization. A read
// whose canonical sequence equals the previous read's short-circuits
// the whole pipeline: the previous outcome is replayed under the new
// name.

use crate::metrics::ReportingMetrics;
use crate::output::{sam_flags, OutRecord, OutputSink};
use crate::pe::{MateSpan, PairedEndPolicy};
use crate::random::ReadRng;
use crate::read::{Orientation, Read};
use crate::scoring::Scoring;

/// Reporting mode: exactly one of -M, -k, -a.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportMode {
    /// Report the single best alignment with a MAPQ informed by up to
    /// N+1 discovered alternatives (-M N).
    BestWithMapq(usize),
    /// Report up to K valid alignments (-k K).
    TopK(usize),
    /// Report all valid alignments (-a).
    All,
}

#[derive(Debug, Clone)]
pub struct ReportingParams {
    pub mode: ReportMode,
    /// Emit discordant pairs when no concordant pair exists.
    pub discord: bool,
    /// Emit unpaired alignments for paired reads when no pair exists.
    pub mixed: bool,
}

impl Default for ReportingParams {
    fn default() -> Self {
        ReportingParams {
            mode: ReportMode::BestWithMapq(5),
            discord: true,
            mixed: true,
        }
    }
}

impl ReportingParams {
    /// How many records per mate (or pairs) the sink emits.
    pub fn emit_limit(&self) -> usize {
        match self.mode {
            ReportMode::BestWithMapq(_) => 1,
            ReportMode::TopK(k) => k.max(1),
            ReportMode::All => usize::MAX,
        }
    }

    /// How many alignments the search should keep looking for before
    /// the sink is satisfied.
    pub fn search_appetite(&self) -> usize {
        match self.mode {
            ReportMode::BestWithMapq(n) => n.saturating_add(1),
            ReportMode::TopK(k) => k.max(1),
            ReportMode::All => usize::MAX,
        }
    }

    /// Walk-budget boost: at least the number of alignments sought.
    pub fn boost_factor(&self) -> f64 {
        match self.mode {
            ReportMode::BestWithMapq(n) => (n + 1) as f64,
            ReportMode::TopK(k) => k.max(1) as f64,
            ReportMode::All => 16.0, // unbounded appetite, bounded budget
        }
    }

    /// MAPQ is only meaningful in best-with-MAPQ mode; -k/-a emit 255.
    pub fn mapq_meaningful(&self) -> bool {
        matches!(self.mode, ReportMode::BestWithMapq(_))
    }
}

/// Mapping quality, V2 table. Monotone in the gap between best and
/// second best, truncated to [0, 42]. `perfect` is the best achievable
/// score for the read, `minsc` the validity threshold.
pub fn mapq_v2(best: i64, secbest: Option<i64>, minsc: i64, perfect: i64) -> u32 {
    let diff = ((perfect - minsc).max(1)) as f64;
    let best_over = (best - minsc) as f64;
    let ret: u32 = match secbest {
        None => {
            let r = best_over / diff;
            if r >= 0.8 {
                42
            } else if r >= 0.7 {
                40
            } else if r >= 0.6 {
                24
            } else if r >= 0.5 {
                23
            } else if r >= 0.4 {
                8
            } else if r >= 0.3 {
                3
            } else {
                0
            }
        }
        Some(sec) => {
            let gap = ((best - sec).max(0)) as f64;
            let hi = best_over >= 0.8 * diff;
            if gap >= diff {
                if hi { 39 } else { 33 }
            } else if gap >= 0.8 * diff {
                if hi { 38 } else { 27 }
            } else if gap >= 0.6 * diff {
                if hi { 37 } else { 26 }
            } else if gap >= 0.5 * diff {
                if hi { 36 } else { 22 }
            } else if gap >= 0.4 * diff {
                if hi { 34 } else { 17 }
            } else if gap >= 0.3 * diff {
                if hi { 32 } else { 14 }
            } else if gap >= 0.2 * diff {
                if hi { 30 } else { 11 }
            } else if gap >= 0.1 * diff {
                if hi { 28 } else { 9 }
            } else if gap > 0.0 {
                if hi { 25 } else { 6 }
            } else if hi {
                1
            } else {
                0
            }
        }
    };
    ret.min(42)
}

/// A candidate alignment produced by the extension driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlnCandidate {
    pub ref_id: usize,
    /// Reference name, carried so records render without index access.
    pub ref_name: String,
    /// 0-based leftmost reference offset.
    pub ref_off: u64,
    pub orient: Orientation,
    /// CIGAR-equivalent ops over b"MIDS".
    pub cigar: Vec<(u8, u32)>,
    pub score: i64,
    /// Which mate this aligns: 0 or 1.
    pub mate: usize,
}

impl AlnCandidate {
    /// Reference bases consumed.
    pub fn ref_span(&self) -> u64 {
        self.cigar
            .iter()
            .map(|&(op, l)| if op == b'M' || op == b'D' { l as u64 } else { 0 })
            .sum()
    }

    pub fn mate_span(&self) -> MateSpan {
        MateSpan {
            ref_id: self.ref_id,
            start: self.ref_off as i64,
            end: (self.ref_off + self.ref_span()) as i64,
            fw: self.orient.is_fw(),
        }
    }

    /// Identity used for redundancy checks.
    pub fn pos_key(&self) -> (usize, u64, bool) {
        (self.ref_id, self.ref_off, self.orient.is_fw())
    }
}

/// The per-read reporting state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkState {
    Init,
    Seeded,
    Extending,
    Reported,
    Unaligned,
}

/// Per-mate filter verdicts, all true when the mate may be aligned.
#[derive(Debug, Clone, Copy, Default)]
pub struct FilterFlags {
    pub n_filt: bool,
    pub sc_filt: bool,
    pub len_filt: bool,
    pub qc_filt: bool,
}

impl FilterFlags {
    pub fn pass(&self) -> bool {
        self.n_filt && self.sc_filt && self.len_filt && self.qc_filt
    }
}

/// What the previous read produced, for the same-read short-circuit.
#[derive(Debug, Clone, Default)]
struct Replay {
    canon: Vec<u8>,
    canon_mate: Vec<u8>,
    records: Vec<OutRecord>,
    aligned: bool,
}

/// Per-worker wrapper around the shared output sink.
pub struct SinkWrap<'a> {
    out: &'a OutputSink,
    pub rp: ReportingParams,
    pe_policy: PairedEndPolicy,
    state: SinkState,
    /// Unpaired candidates per mate.
    cands: [Vec<AlnCandidate>; 2],
    /// Concordant pairs (anchor candidate, opposite candidate).
    pairs: Vec<(AlnCandidate, AlnCandidate)>,
    replay: Option<Replay>,
}

impl<'a> SinkWrap<'a> {
    pub fn new(out: &'a OutputSink, rp: ReportingParams, pe_policy: PairedEndPolicy) -> Self {
        SinkWrap {
            out,
            rp,
            pe_policy,
            state: SinkState::Init,
            cands: [Vec::new(), Vec::new()],
            pairs: Vec::new(),
            replay: None,
        }
    }

    pub fn state(&self) -> SinkState {
        self.state
    }

    /// Begin a read. Returns true when the read's canonical sequence
    /// (and its mate's) matches the previous read and the previous
    /// outcome can be replayed.
    pub fn next_read(&mut self, rd1: &Read, rd2: Option<&Read>) -> bool {
        self.state = SinkState::Init;
        self.cands[0].clear();
        self.cands[1].clear();
        self.pairs.clear();
        if let Some(rep) = &self.replay {
            let mate_canon: &[u8] = rd2.map(|r| r.canonical()).unwrap_or(&[]);
            if rep.canon == rd1.canonical() && rep.canon_mate == mate_canon {
                return true;
            }
        }
        false
    }

    /// Replay the previous read's records under the new name. The new
    /// read must still pass the same filters; a failed filter demotes
    /// the replay to unaligned records.
    pub fn replay_previous(
        &mut self,
        rd1: &Read,
        rd2: Option<&Read>,
        filters_pass: bool,
        rpm: &mut ReportingMetrics,
    ) -> std::io::Result<()> {
        let rep = self.replay.clone().unwrap_or_default();
        if !filters_pass || !rep.aligned {
            self.emit_unaligned_all(rd1, rd2, rpm)?;
            self.state = SinkState::Unaligned;
            return Ok(());
        }
        for template in rep.records.iter() {
            let mut rec = template.clone();
            let rd = if rec.flag & sam_flags::LAST_IN_PAIR != 0 {
                rd2.unwrap_or(rd1)
            } else {
                rd1
            };
            rec.qname = rd.name.clone();
            let orient = if rec.flag & sam_flags::REVERSE != 0 {
                Orientation::Rc
            } else {
                Orientation::Fw
            };
            rec.qual = rd.qual_ascii(orient);
            self.out.emit_record(&rec)?;
            rpm.records += 1;
        }
        self.state = SinkState::Reported;
        Ok(())
    }

    /// Mark that seeding finished for both mates.
    pub fn seeded(&mut self) {
        if self.state == SinkState::Init {
            self.state = SinkState::Seeded;
        }
    }

    /// Record an unpaired candidate. Duplicate positions are dropped.
    /// Returns false when the candidate was redundant.
    pub fn report_unpaired(&mut self, cand: AlnCandidate) -> bool {
        self.state = SinkState::Extending;
        let mate = cand.mate;
        if self.cands[mate].iter().any(|c| c.pos_key() == cand.pos_key()) {
            return false;
        }
        self.cands[mate].push(cand);
        true
    }

    /// Record a concordant pair. Stored normalized as (mate 1, mate 2)
    /// so the same pair found from either anchor deduplicates.
    pub fn report_concordant(&mut self, anchor: AlnCandidate, opposite: AlnCandidate) -> bool {
        self.state = SinkState::Extending;
        let (m1, m2) = if anchor.mate == 0 {
            (anchor, opposite)
        } else {
            (opposite, anchor)
        };
        let key = (m1.pos_key(), m2.pos_key());
        if self
            .pairs
            .iter()
            .any(|(a, o)| (a.pos_key(), o.pos_key()) == key)
        {
            return false;
        }
        self.pairs.push((m1, m2));
        true
    }

    /// True when the policy has seen enough for this mate.
    pub fn done_with_mate(&self, mate: usize) -> bool {
        let appetite = self.rp.search_appetite();
        if !self.pairs.is_empty() && self.pairs.len() >= appetite {
            return true;
        }
        self.cands[mate].len() >= appetite
    }

    /// True when the policy has seen enough pairs.
    pub fn done_with_pairs(&self) -> bool {
        self.pairs.len() >= self.rp.search_appetite()
    }

    pub fn n_pairs(&self) -> usize {
        self.pairs.len()
    }

    pub fn n_unpaired(&self, mate: usize) -> usize {
        self.cands[mate].len()
    }

    /// Best and second-best scores among this mate's candidates.
    fn best_two(cands: &[AlnCandidate]) -> (Option<i64>, Option<i64>) {
        let mut best = None;
        let mut second = None;
        for c in cands {
            match best {
                None => best = Some(c.score),
                Some(b) if c.score > b => {
                    second = best;
                    best = Some(c.score);
                }
                _ => match second {
                    None => second = Some(c.score),
                    Some(s) if c.score > s => second = Some(c.score),
                    _ => {}
                },
            }
        }
        (best, second)
    }

    /// Finalize the read: apply the reporting policy, compute MAPQ,
    /// emit records, and stash the outcome for same-read replay.
    #[allow(clippy::too_many_arguments)]
    pub fn finish_read(
        &mut self,
        sc: &Scoring,
        rd1: &Read,
        rd2: Option<&Read>,
        filt: [FilterFlags; 2],
        _exhausted: [bool; 2],
        rnd: &mut ReadRng,
        rpm: &mut ReportingMetrics,
    ) -> std::io::Result<()> {
        let paired = rd2.is_some();
        let mut emitted: Vec<OutRecord> = Vec::new();
        let mut aligned = false;

        if paired && !self.pairs.is_empty() {
            // Concordant pairs, best combined score first
            let mut pairs = std::mem::take(&mut self.pairs);
            pairs.sort_by(|a, b| (b.0.score + b.1.score).cmp(&(a.0.score + a.1.score)));
            shuffle_equal_pairs(&mut pairs, rnd);
            let limit = self.rp.emit_limit().min(pairs.len());
            let (best_pair, second_pair) = {
                let mut scores = pairs.iter().map(|(a, o)| a.score + o.score);
                let b = scores.next();
                (b, scores.next())
            };
            for (i, (m1, m2)) in pairs.iter().enumerate().take(limit) {
                let perfect = sc.perfect_score(rd1.len()) + sc.perfect_score(rd2.unwrap().len());
                let minsc2 = sc.min_score(rd1.len()) + sc.min_score(rd2.unwrap().len());
                let mapq = if self.rp.mapq_meaningful() {
                    mapq_v2(best_pair.unwrap(), second_pair, minsc2, perfect)
                } else {
                    255
                };
                let secondary = i > 0;
                let (r1, r2) = pair_records(rd1, rd2.unwrap(), m1, m2, mapq, true, secondary);
                emitted.push(r1);
                emitted.push(r2);
                rpm.concordant_pairs += 1;
            }
            aligned = true;
        } else if paired
            && self.rp.discord
            && self.cands[0].len() == 1
            && self.cands[1].len() == 1
        {
            // A unique alignment for each mate with no rescued pair.
            // Concordant by the policy after the fact is still a proper
            // pair; otherwise it goes out discordant.
            let m1 = self.cands[0][0].clone();
            let m2 = self.cands[1][0].clone();
            let proper = self.pe_policy.concordant(&m1.mate_span(), &m2.mate_span());
            let mapq = if self.rp.mapq_meaningful() {
                let perfect = sc.perfect_score(rd1.len()) + sc.perfect_score(rd2.unwrap().len());
                let minsc2 = sc.min_score(rd1.len()) + sc.min_score(rd2.unwrap().len());
                mapq_v2(m1.score + m2.score, None, minsc2, perfect)
            } else {
                255
            };
            let (r1, r2) = pair_records(rd1, rd2.unwrap(), &m1, &m2, mapq, proper, false);
            emitted.push(r1);
            emitted.push(r2);
            if proper {
                rpm.concordant_pairs += 1;
            } else {
                rpm.discordant_pairs += 1;
            }
            aligned = true;
        } else {
            // Unpaired reporting, per mate (mixed mode for pairs)
            let reads = [Some(rd1), rd2];
            let other_aligned = [!self.cands[1].is_empty(), !self.cands[0].is_empty()];
            for mate in 0..2 {
                let rd = match reads[mate] {
                    Some(r) => r,
                    None => continue,
                };
                if paired && !self.rp.mixed {
                    continue;
                }
                if self.cands[mate].is_empty() {
                    continue;
                }
                let mut cands = std::mem::take(&mut self.cands[mate]);
                cands.sort_by(|a, b| b.score.cmp(&a.score));
                shuffle_equal(&mut cands, rnd);
                let (best, second) = Self::best_two(&cands);
                let mapq = if self.rp.mapq_meaningful() {
                    mapq_v2(
                        best.unwrap(),
                        second,
                        sc.min_score(rd.len()),
                        sc.perfect_score(rd.len()),
                    )
                } else {
                    255
                };
                let limit = self.rp.emit_limit().min(cands.len());
                for (i, c) in cands.iter().enumerate().take(limit) {
                    let mut rec = unpaired_record(rd, c, mapq);
                    if paired {
                        rec.flag |= sam_flags::PAIRED
                            | if mate == 0 {
                                sam_flags::FIRST_IN_PAIR
                            } else {
                                sam_flags::LAST_IN_PAIR
                            };
                        if !other_aligned[mate] {
                            rec.flag |= sam_flags::MATE_UNMAPPED;
                        }
                        if let Some(last) = rec.tags.last_mut() {
                            *last = "YT:Z:UP".to_string();
                        }
                    }
                    if i > 0 {
                        rec.flag |= sam_flags::SECONDARY;
                    }
                    emitted.push(rec);
                    rpm.unpaired_aligned += 1;
                }
                aligned = true;
            }
        }

        if !aligned {
            self.emit_unaligned_all(rd1, rd2, rpm)?;
            self.state = SinkState::Unaligned;
        } else {
            for rec in &mut emitted {
                if rec.flag & sam_flags::LAST_IN_PAIR != 0 {
                    if !filt[1].qc_filt {
                        rec.flag |= sam_flags::QC_FAIL;
                    }
                } else if !filt[0].qc_filt {
                    rec.flag |= sam_flags::QC_FAIL;
                }
                self.out.emit_record(rec)?;
                rpm.records += 1;
            }
            self.state = SinkState::Reported;
        }

        self.replay = Some(Replay {
            canon: rd1.canonical().to_vec(),
            canon_mate: rd2.map(|r| r.canonical().to_vec()).unwrap_or_default(),
            records: emitted,
            aligned,
        });
        Ok(())
    }

    fn emit_unaligned_all(
        &self,
        rd1: &Read,
        rd2: Option<&Read>,
        rpm: &mut ReportingMetrics,
    ) -> std::io::Result<()> {
        let paired = rd2.is_some();
        let reads = [Some(rd1), rd2];
        for (mate, rd) in reads.iter().enumerate() {
            let rd = match rd {
                Some(r) => r,
                None => continue,
            };
            let mut flag = sam_flags::UNMAPPED;
            if paired {
                flag |= sam_flags::PAIRED
                    | sam_flags::MATE_UNMAPPED
                    | if mate == 0 {
                        sam_flags::FIRST_IN_PAIR
                    } else {
                        sam_flags::LAST_IN_PAIR
                    };
            }
            self.out.emit_record(&OutRecord {
                qname: rd.name.clone(),
                flag,
                seq: rd.seq_ascii(Orientation::Fw),
                qual: rd.qual_ascii(Orientation::Fw),
                tags: vec!["YT:Z:UU".to_string()],
                ..OutRecord::default()
            })?;
            rpm.records += 1;
            rpm.unaligned += 1;
        }
        Ok(())
    }
}

/// Render one unpaired record. Candidates carry the reference name so
/// the replay path needs no index access.
fn unpaired_record(rd: &Read, c: &AlnCandidate, mapq: u32) -> OutRecord {
    let mut flag = 0u16;
    if !c.orient.is_fw() {
        flag |= sam_flags::REVERSE;
    }
    OutRecord {
        qname: rd.name.clone(),
        flag,
        rname: Some(c.ref_name.clone()),
        pos: c.ref_off + 1,
        mapq,
        cigar: c.cigar.clone(),
        seq: rd.seq_ascii(c.orient),
        qual: rd.qual_ascii(c.orient),
        tags: vec![format!("AS:i:{}", c.score), "YT:Z:UU".to_string()],
        ..OutRecord::default()
    }
}

/// Render both records of a pair (concordant or discordant).
fn pair_records(
    rd1: &Read,
    rd2: &Read,
    m1: &AlnCandidate,
    m2: &AlnCandidate,
    mapq: u32,
    proper: bool,
    secondary: bool,
) -> (OutRecord, OutRecord) {
    let s1 = m1.mate_span();
    let s2 = m2.mate_span();
    let frag = PairedEndPolicy::fragment_len(&s1, &s2);
    // sign: leftmost mate positive
    let (t1, t2) = if s1.start < s2.start || (s1.start == s2.start && s1.end <= s2.end) {
        (frag, -frag)
    } else {
        (-frag, frag)
    };
    let same_ref = m1.ref_id == m2.ref_id;
    let yt = if proper { "YT:Z:CP" } else { "YT:Z:DP" };

    let mut mk = |rd: &Read, c: &AlnCandidate, other: &AlnCandidate, first: bool, tlen: i64| {
        let mut flag = sam_flags::PAIRED;
        if proper {
            flag |= sam_flags::PROPER_PAIR;
        }
        if !c.orient.is_fw() {
            flag |= sam_flags::REVERSE;
        }
        if !other.orient.is_fw() {
            flag |= sam_flags::MATE_REVERSE;
        }
        flag |= if first {
            sam_flags::FIRST_IN_PAIR
        } else {
            sam_flags::LAST_IN_PAIR
        };
        if secondary {
            flag |= sam_flags::SECONDARY;
        }
        OutRecord {
            qname: rd.name.clone(),
            flag,
            rname: Some(c.ref_name.clone()),
            pos: c.ref_off + 1,
            mapq,
            cigar: c.cigar.clone(),
            rnext: Some(if same_ref {
                "=".to_string()
            } else {
                other.ref_name.clone()
            }),
            pnext: other.ref_off + 1,
            tlen: if same_ref { tlen } else { 0 },
            seq: rd.seq_ascii(c.orient),
            qual: rd.qual_ascii(c.orient),
            tags: vec![format!("AS:i:{}", c.score), yt.to_string()],
        }
    };
    (mk(rd1, m1, m2, true, t1), mk(rd2, m2, m1, false, t2))
}

fn shuffle_equal(cands: &mut [AlnCandidate], rnd: &mut ReadRng) {
    let mut i = 0;
    while i < cands.len() {
        let mut j = i + 1;
        while j < cands.len() && cands[j].score == cands[i].score {
            j += 1;
        }
        for k in ((i + 1)..j).rev() {
            let swap_with = i + rnd.below(k - i + 1);
            cands.swap(k, swap_with);
        }
        i = j;
    }
}

fn shuffle_equal_pairs(pairs: &mut [(AlnCandidate, AlnCandidate)], rnd: &mut ReadRng) {
    let mut i = 0;
    while i < pairs.len() {
        let score = |p: &(AlnCandidate, AlnCandidate)| p.0.score + p.1.score;
        let mut j = i + 1;
        while j < pairs.len() && score(&pairs[j]) == score(&pairs[i]) {
            j += 1;
        }
        for k in ((i + 1)..j).rev() {
            let swap_with = i + rnd.below(k - i + 1);
            pairs.swap(k, swap_with);
        }
        i = j;
    }
}
