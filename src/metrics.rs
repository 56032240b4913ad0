// Per-worker metric counters and the global merge/report cycle.
//
// Workers accumulate into plain structs and fold them into a shared
// accumulator every `MERGE_IVAL` reads; thread 0 renders an interval
// line. Non-fatal events (cache OOMs, saturation retries) surface only
// here, never as log spam.

use std::io::Write;
use std::sync::Mutex;
use std::time::Instant;

/// How many reads a worker processes between merges into the global
/// accumulator.
pub const MERGE_IVAL: u64 = 16;

/// Outer loop: reads in, bases in, filter outcomes, same-read
/// short-circuits.
#[derive(Debug, Default, Clone)]
pub struct OuterLoopMetrics {
    pub reads: u64,
    pub bases: u64,
    /// Reads short-circuited because they equal the previous read.
    pub sr_reads: u64,
    pub sr_bases: u64,
    /// Mates rejected by the N/score/length/QC filters.
    pub filt_reads: u64,
    pub filt_bases: u64,
    /// Mates passing all filters.
    pub unfilt_reads: u64,
    pub unfilt_bases: u64,
}

impl OuterLoopMetrics {
    pub fn merge(&mut self, o: &OuterLoopMetrics) {
        self.reads += o.reads;
        self.bases += o.bases;
        self.sr_reads += o.sr_reads;
        self.sr_bases += o.sr_bases;
        self.filt_reads += o.filt_reads;
        self.filt_bases += o.filt_bases;
        self.unfilt_reads += o.unfilt_reads;
        self.unfilt_bases += o.unfilt_bases;
    }
}

/// Seed instantiation and index descent counters.
#[derive(Debug, Default, Clone)]
pub struct SeedSearchMetrics {
    pub seeds_instantiated: u64,
    pub seed_searches: u64,
    /// Index extension operations performed.
    pub bwops: u64,
    /// Mismatch edits taken during descents.
    pub edits: u64,
    /// Seeds abandoned because a cache insert failed.
    pub ooms: u64,
    /// Hits served from the current-read cache.
    pub intra_cache_hits: u64,
    /// Hits served from the local or shared cache.
    pub inter_cache_hits: u64,
}

impl SeedSearchMetrics {
    pub fn merge(&mut self, o: &SeedSearchMetrics) {
        self.seeds_instantiated += o.seeds_instantiated;
        self.seed_searches += o.seed_searches;
        self.bwops += o.bwops;
        self.edits += o.edits;
        self.ooms += o.ooms;
        self.intra_cache_hits += o.intra_cache_hits;
        self.inter_cache_hits += o.inter_cache_hits;
    }
}

/// Offset-resolution ("group walk") counters.
#[derive(Debug, Default, Clone)]
pub struct WalkMetrics {
    /// Range elements resolved to reference coordinates.
    pub resolves: u64,
    /// Resolutions short-cut by the reference scanner.
    pub ref_scans: u64,
    /// Elements reported to the extension driver.
    pub elts_reported: u64,
    /// Elements skipped because their range was exhausted or over budget.
    pub elts_skipped: u64,
}

impl WalkMetrics {
    pub fn merge(&mut self, o: &WalkMetrics) {
        self.resolves += o.resolves;
        self.ref_scans += o.ref_scans;
        self.elts_reported += o.elts_reported;
        self.elts_skipped += o.elts_skipped;
    }
}

/// Dynamic-programming counters, kept separately for seed extension and
/// mate rescue.
#[derive(Debug, Default, Clone)]
pub struct SwMetrics {
    /// 8-bit kernel invocations.
    pub dp_u8: u64,
    /// 16-bit kernel invocations (including saturation retries).
    pub dp_i16: u64,
    /// 8-bit runs that saturated and were retried at 16 bits.
    pub sat_retries: u64,
    /// DP cells filled.
    pub cells: u64,
    /// Backtraces performed.
    pub backtraces: u64,
    /// Candidates rejected as redundant with an existing hit.
    pub redundant: u64,
}

impl SwMetrics {
    pub fn merge(&mut self, o: &SwMetrics) {
        self.dp_u8 += o.dp_u8;
        self.dp_i16 += o.dp_i16;
        self.sat_retries += o.sat_retries;
        self.cells += o.cells;
        self.backtraces += o.backtraces;
        self.redundant += o.redundant;
    }
}

/// Final reporting outcomes.
#[derive(Debug, Default, Clone)]
pub struct ReportingMetrics {
    pub concordant_pairs: u64,
    pub discordant_pairs: u64,
    pub unpaired_aligned: u64,
    pub unaligned: u64,
    pub records: u64,
}

impl ReportingMetrics {
    pub fn merge(&mut self, o: &ReportingMetrics) {
        self.concordant_pairs += o.concordant_pairs;
        self.discordant_pairs += o.discordant_pairs;
        self.unpaired_aligned += o.unpaired_aligned;
        self.unaligned += o.unaligned;
        self.records += o.records;
    }
}

/// A worker's complete counter bundle.
#[derive(Debug, Default, Clone)]
pub struct Metrics {
    pub olm: OuterLoopMetrics,
    pub sdm: SeedSearchMetrics,
    pub wlm: WalkMetrics,
    pub swm_seed: SwMetrics,
    pub swm_mate: SwMetrics,
    pub rpm: ReportingMetrics,
}

impl Metrics {
    pub fn merge(&mut self, o: &Metrics) {
        self.olm.merge(&o.olm);
        self.sdm.merge(&o.sdm);
        self.wlm.merge(&o.wlm);
        self.swm_seed.merge(&o.swm_seed);
        self.swm_mate.merge(&o.swm_mate);
        self.rpm.merge(&o.rpm);
    }

    pub fn clear(&mut self) {
        *self = Metrics::default();
    }
}

/// Global accumulator shared by all workers. Tracks both cumulative
/// totals and the delta since the last interval report.
pub struct MetricsAggregator {
    inner: Mutex<AggInner>,
    start: Instant,
}

struct AggInner {
    total: Metrics,
    interval: Metrics,
}

impl MetricsAggregator {
    pub fn new() -> Self {
        MetricsAggregator {
            inner: Mutex::new(AggInner {
                total: Metrics::default(),
                interval: Metrics::default(),
            }),
            start: Instant::now(),
        }
    }

    /// Fold a worker's partial counters in and reset them.
    pub fn merge_from(&self, m: &mut Metrics) {
        let mut inner = self.inner.lock().unwrap();
        inner.total.merge(m);
        inner.interval.merge(m);
        m.clear();
    }

    pub fn total(&self) -> Metrics {
        self.inner.lock().unwrap().total.clone()
    }

    /// Render one tab-separated metrics line (cumulative then interval
    /// columns) and reset the interval counters. Timestamps are seconds
    /// since startup, so successive lines are monotone.
    pub fn report_interval(&self, out: &mut dyn Write) -> std::io::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let elapsed = self.start.elapsed().as_secs();
        let t = &inner.total;
        writeln!(
            out,
            "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}",
            elapsed,
            t.olm.reads,
            t.olm.bases,
            t.olm.filt_reads,
            t.olm.sr_reads,
            t.sdm.seed_searches,
            t.sdm.bwops,
            t.sdm.intra_cache_hits,
            t.sdm.inter_cache_hits,
            t.sdm.ooms,
            t.wlm.resolves,
            t.swm_seed.dp_u8,
            t.swm_seed.dp_i16,
            t.swm_seed.sat_retries,
            t.rpm.concordant_pairs,
            t.rpm.discordant_pairs,
            t.rpm.unpaired_aligned,
            t.rpm.unaligned,
            inner.interval.olm.reads,
        )?;
        inner.interval.clear();
        Ok(())
    }

    /// Column header preceding the first metrics line.
    pub fn report_header(out: &mut dyn Write) -> std::io::Result<()> {
        writeln!(
            out,
            "secs\treads\tbases\tfilt\tsame\tseeds\tbwops\tintra\tinter\tooms\tresolves\tdp8\tdp16\tsat\tconc\tdisc\tunp\tunal\tival_reads"
        )
    }
}

impl Default for MetricsAggregator {
    fn default() -> Self {
        MetricsAggregator::new()
    }
}
