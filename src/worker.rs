// Worker runtime.
//
// One worker per OS thread. A reader thread drains the pattern source
// into a bounded channel; workers pull read pairs, run the full
// per-read pipeline (filters, seeding, search, extension, reporting)
// with no mid-read suspension, and fold their counters into the global
// aggregator every few reads. Thread 0 also renders the periodic
// metrics line. Shutdown is cooperative: the channel closing drains
// the workers.

use std::io::Write;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Instant;

use crossbeam_channel::bounded;

use crate::cache::{CacheIface, SharedCache};
use crate::errors::AlnError;
use crate::extend::SwDriver;
use crate::fastq::{PatternSource, ReadPair};
use crate::index::SeedIndex;
use crate::metrics::{Metrics, MetricsAggregator, MERGE_IVAL};
use crate::opts::AlnOpts;
use crate::output::OutputSink;
use crate::random::ReadRng;
use crate::read::Read;
use crate::scoring::Scoring;
use crate::seed::{instantiate_seeds, SeedTemplate};
use crate::seed_search::{SeedResults, SeedSearcher};
use crate::sink::{FilterFlags, SinkWrap};
use crate::walk::OffsetResolver;

/// Everything the workers share read-only (or behind a lock).
pub struct AlignEnv<'a> {
    pub idx: &'a SeedIndex,
    pub opts: &'a AlnOpts,
    pub out: &'a OutputSink,
    pub agg: &'a MetricsAggregator,
    pub shared_cache: Option<Arc<SharedCache>>,
    pub met_out: Option<&'a Mutex<Box<dyn Write + Send>>>,
}

/// Run the alignment job to completion over all reads in the source.
pub fn run(env: &AlignEnv, src: PatternSource) -> Result<(), AlnError> {
    let n_threads = env.opts.threads.max(1);
    let (tx, rx) = bounded::<ReadPair>(n_threads * 8);

    let src = Mutex::new(src);
    let reader_err: Mutex<Option<AlnError>> = Mutex::new(None);

    thread::scope(|scope| {
        // Reader: single producer draining the pattern source
        let src_ref = &src;
        let err_ref = &reader_err;
        let reader = scope.spawn(move || {
            let mut src = src_ref.lock().unwrap();
            loop {
                match src.next_pair() {
                    Ok(Some(pair)) => {
                        if tx.send(pair).is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        *err_ref.lock().unwrap() = Some(e);
                        break;
                    }
                }
            }
            drop(tx);
        });

        let mut handles = Vec::new();
        for tid in 0..n_threads {
            let rx = rx.clone();
            handles.push(scope.spawn(move || worker_loop(tid, env, rx)));
        }
        drop(rx);

        reader.join().expect("reader thread panicked");
        for h in handles {
            h.join().expect("worker thread panicked");
        }
    });

    if let Some(e) = reader_err.into_inner().unwrap() {
        return Err(e);
    }
    // Final metrics line after the workers flushed their partials
    if let Some(met) = env.met_out {
        let mut w = met.lock().unwrap();
        env.agg.report_interval(&mut **w)?;
    }
    env.out.finalize()?;
    Ok(())
}

/// One worker: owns its aligners, caches and counters for the whole
/// run.
fn worker_loop(tid: usize, env: &AlignEnv, rx: crossbeam_channel::Receiver<ReadPair>) {
    let opts = env.opts;
    let sc = opts.scoring();
    let templates = [SeedTemplate::new(opts.seed_len, opts.seed_mms)];
    let rp = opts.reporting();
    let pe = opts.pe_policy();

    // Budgets boosted by the reporting appetite; the paired path gets
    // the halved variant
    let resolver = opts.resolver().boosted(rp.boost_factor());
    let resolver_paired = resolver.halved();

    let mut cache = CacheIface::new(
        opts.cache_current_bytes,
        if opts.no_cache { None } else { Some(opts.cache_local_bytes) },
        if opts.no_cache { None } else { env.shared_cache.clone() },
    );
    let mut driver = SwDriver::new(!opts.no_simd);
    let mut sink = SinkWrap::new(env.out, rp, pe.clone());
    let mut met = Metrics::default();
    let mut shs: [SeedResults; 2] = [SeedResults::default(), SeedResults::default()];

    let mut mergei = 0u64;
    let mut last_report = Instant::now();

    log::debug!("worker {} started", tid);

    while let Ok(pair) = rx.recv() {
        process_read(env, opts, &sc, &templates, &pe, &resolver, &resolver_paired, &mut cache,
            &mut driver, &mut sink, &mut shs, &mut met, &pair);

        mergei += 1;
        if mergei == MERGE_IVAL {
            env.agg.merge_from(&mut met);
            mergei = 0;
            if tid == 0 {
                if let Some(mw) = env.met_out {
                    if last_report.elapsed().as_secs() >= opts.met_ival_secs {
                        let mut w = mw.lock().unwrap();
                        let _ = env.agg.report_interval(&mut **w);
                        last_report = Instant::now();
                    }
                }
            }
        }
    }

    // flush partial counters on shutdown
    env.agg.merge_from(&mut met);
    log::debug!("worker {} done", tid);
}

#[allow(clippy::too_many_arguments)]
fn process_read(
    env: &AlignEnv,
    opts: &AlnOpts,
    sc: &Scoring,
    templates: &[SeedTemplate],
    pe: &crate::pe::PairedEndPolicy,
    resolver: &OffsetResolver,
    resolver_paired: &OffsetResolver,
    cache: &mut CacheIface,
    driver: &mut SwDriver,
    sink: &mut SinkWrap,
    shs: &mut [SeedResults; 2],
    met: &mut Metrics,
    pair: &ReadPair,
) {
    let rd1 = &pair.a;
    let rd2 = pair.b.as_ref();
    let paired = rd2.is_some();
    let rdlens = [rd1.len(), rd2.map(|r| r.len()).unwrap_or(0)];

    met.olm.reads += 1;
    met.olm.bases += (rdlens[0] + rdlens[1]) as u64;

    // Same-read short-circuit: replay the previous outcome
    if sink.next_read(rd1, rd2) {
        met.olm.sr_reads += 1;
        met.olm.sr_bases += (rdlens[0] + rdlens[1]) as u64;
        let filters_pass =
            !opts.qc_filter || (rd1.qc_pass && rd2.map_or(true, |r| r.qc_pass));
        if sink.replay_previous(rd1, rd2, filters_pass, &mut met.rpm).is_err() {
            log::error!("output error during replay of read {}", rd1.name);
        }
        return;
    }

    cache.next_read();
    driver.next_read();
    shs[0].clear();
    shs[1].clear();

    // Filters
    let (nf1, nf2) = sc.n_filter_pair(rd1, rd2);
    let mut filt = [FilterFlags::default(), FilterFlags::default()];
    let reads: [Option<&Read>; 2] = [Some(rd1), rd2];
    for mate in 0..2 {
        let rd = match reads[mate] {
            Some(r) => r,
            None => continue,
        };
        let minsc = sc.min_score(rd.len());
        filt[mate] = FilterFlags {
            n_filt: if mate == 0 { nf1 } else { nf2 },
            sc_filt: sc.score_filter(minsc, rd.len()),
            len_filt: rd.len() > opts.seed_mms as usize,
            qc_filt: !opts.qc_filter || rd.qc_pass,
        };
        if rd.len() <= opts.seed_mms as usize {
            log::warn!(
                "read {} has length {} <= {} seed mismatches; skipping",
                rd.name,
                rd.len(),
                opts.seed_mms
            );
        }
    }

    // Seed interval from the combined length when both mates survive
    let interval = if paired && filt[0].pass() && filt[1].pass() {
        sc.interval(rdlens[0] + rdlens[1])
    } else {
        sc.interval(rdlens[0].max(rdlens[1]))
    };

    // Mate order: deterministic but unbiased alternation
    let mut matemap = [0usize, 1usize];
    if paired {
        let mut rnd = ReadRng::seeded(rd1.seed ^ rd2.unwrap().seed, 10);
        if rnd.coin() {
            matemap.swap(0, 1);
        }
    }

    let n_mates = if paired { 2 } else { 1 };
    let mut exhausted = [false, false];
    for &mate in matemap.iter().take(n_mates) {
        let rd = match reads[mate] {
            Some(r) => r,
            None => continue,
        };
        if !filt[mate].pass() {
            met.olm.filt_reads += 1;
            met.olm.filt_bases += rd.len() as u64;
            continue;
        }
        met.olm.unfilt_reads += 1;
        met.olm.unfilt_bases += rd.len() as u64;
        if sink.done_with_mate(mate) {
            continue;
        }

        // Seeding
        let (seeds, n_fw, n_rc) =
            instantiate_seeds(rd, templates, interval, opts.nofw, opts.norc, &mut met.sdm);
        if n_fw + n_rc == 0 {
            exhausted[mate] = true;
            continue;
        }
        SeedSearcher::search_all(env.idx, &seeds, cache, &mut shs[mate], &mut met.sdm);
        sink.seeded();
        if shs[mate].is_empty() {
            exhausted[mate] = true;
            continue;
        }
        let mut rnd = ReadRng::seeded(rd.seed, 10);
        shs[mate].rank(&mut rnd);

        // Extension
        let outcome = if paired {
            driver.extend_paired(
                env.idx,
                sc,
                rd,
                reads[mate ^ 1].unwrap(),
                mate,
                &shs[mate],
                pe,
                resolver_paired,
                opts.dpad,
                opts.maxhalf,
                opts.gap_barrier,
                cache,
                sink,
                &mut rnd,
                &mut met.wlm,
                &mut met.swm_seed,
                &mut met.swm_mate,
            )
        } else {
            driver.extend_unpaired(
                env.idx,
                sc,
                rd,
                mate,
                &shs[mate],
                resolver,
                opts.dpad,
                opts.maxhalf,
                opts.gap_barrier,
                cache,
                sink,
                &mut rnd,
                &mut met.wlm,
                &mut met.swm_seed,
            )
        };
        exhausted[mate] = outcome.exhausted;
        if outcome.done {
            break;
        }
    }

    // Finalize and report
    let seed_xor = rd1.seed ^ rd2.map(|r| r.seed).unwrap_or(0);
    let mut rnd = ReadRng::seeded(seed_xor, 20);
    if sink
        .finish_read(sc, rd1, rd2, filt, exhausted, &mut rnd, &mut met.rpm)
        .is_err()
    {
        log::error!("output error while reporting read {}", rd1.name);
    }
    met.sdm.ooms += cache.finish_read();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::OutputFormat;
    use crate::sink::ReportMode;
    use std::fs::File;
    use std::sync::Arc;

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

    fn write_fastq(dir: &tempfile::TempDir, name: &str, records: &[(String, String)]) -> std::path::PathBuf {
        let path = dir.path().join(name);
        let mut f = File::create(&path).unwrap();
        for (id, seq) in records {
            writeln!(f, "@{}\n{}\n+\n{}", id, seq, "I".repeat(seq.len())).unwrap();
        }
        path
    }

    fn run_job(
        reference: &str,
        reads: &[(String, String)],
        opts: AlnOpts,
    ) -> Vec<String> {
        let dir = tempfile::tempdir().unwrap();
        let p = write_fastq(&dir, "in.fq", reads);
        let idx = SeedIndex::build(
            &[("chr1".to_string(), reference.as_bytes().to_vec())],
            opts.seed_mms > 0,
        );
        let buf = Arc::new(Mutex::new(Vec::new()));
        let out = OutputSink::new(OutputFormat::Sam, Box::new(VecWriter(Arc::clone(&buf))));
        let agg = MetricsAggregator::new();
        let shared = Some(Arc::new(SharedCache::new(opts.cache_shared_bytes)));
        let env = AlignEnv {
            idx: &idx,
            opts: &opts,
            out: &out,
            agg: &agg,
            shared_cache: shared,
            met_out: None,
        };
        let src = PatternSource::open(
            &p,
            None,
            opts.format,
            opts.qual_enc,
            opts.trim5,
            opts.trim3,
            opts.skip,
            opts.upto_bound(),
        )
        .unwrap();
        run(&env, src).unwrap();
        let data = buf.lock().unwrap().clone();
        String::from_utf8(data)
            .unwrap()
            .lines()
            .map(|s| s.to_string())
            .collect()
    }

    fn random_ref(n: usize, mut x: u64) -> String {
        let alphabet = [b'A', b'C', b'G', b'T'];
        let mut s = String::new();
        for _ in 0..n {
            x ^= x << 13;
            x ^= x >> 7;
            x ^= x << 17;
            s.push(alphabet[(x % 4) as usize] as char);
        }
        s
    }

    #[test]
    fn test_single_end_job() {
        let reference = random_ref(500, 0xABCD);
        let read_seq = reference[100..150].to_string();
        let mut opts = AlnOpts::default();
        opts.seed_len = 20;
        let lines = run_job(&reference, &[("r0".to_string(), read_seq)], opts);
        assert_eq!(lines.len(), 1);
        let fields: Vec<&str> = lines[0].split('\t').collect();
        assert_eq!(fields[0], "r0");
        assert_eq!(fields[2], "chr1");
        assert_eq!(fields[3], "101"); // 1-based
        assert_eq!(fields[5], "50M");
    }

    #[test]
    fn test_same_read_short_circuit_counter() {
        let reference = random_ref(500, 0x1234);
        let read_seq = reference[60..100].to_string();
        let mut opts = AlnOpts::default();
        opts.seed_len = 20;
        let dir = tempfile::tempdir().unwrap();
        let p = write_fastq(
            &dir,
            "in.fq",
            &[
                ("a".to_string(), read_seq.clone()),
                ("b".to_string(), read_seq.clone()),
            ],
        );
        let idx = SeedIndex::build(&[("chr1".to_string(), reference.as_bytes().to_vec())], false);
        let buf = Arc::new(Mutex::new(Vec::new()));
        let out = OutputSink::new(OutputFormat::Sam, Box::new(VecWriter(Arc::clone(&buf))));
        let agg = MetricsAggregator::new();
        let env = AlignEnv {
            idx: &idx,
            opts: &opts,
            out: &out,
            agg: &agg,
            shared_cache: None,
            met_out: None,
        };
        let src = PatternSource::open(
            &p, None, opts.format, opts.qual_enc, 0, 0, 0, u64::MAX,
        )
        .unwrap();
        run(&env, src).unwrap();
        let total = agg.total();
        assert_eq!(total.olm.reads, 2);
        assert_eq!(total.olm.sr_reads, 1);
        let outstr = String::from_utf8(buf.lock().unwrap().clone()).unwrap();
        let lines: Vec<&str> = outstr.lines().collect();
        assert_eq!(lines.len(), 2);
        let a: Vec<&str> = lines[0].split('\t').collect();
        let b: Vec<&str> = lines[1].split('\t').collect();
        assert_eq!(a[0], "a");
        assert_eq!(b[0], "b");
        assert_eq!(a[1..], b[1..]);
    }

    #[test]
    fn test_unaligned_read_reported() {
        let reference = random_ref(400, 0x77);
        // a read that cannot be in the reference: all-T homopolymer
        let mut opts = AlnOpts::default();
        opts.seed_len = 20;
        let lines = run_job(
            &reference,
            &[("miss".to_string(), "T".repeat(40))],
            opts,
        );
        // either truly absent (likely) or aligned by chance; check flag
        // consistency instead of asserting absence
        assert_eq!(lines.len(), 1);
        let fields: Vec<&str> = lines[0].split('\t').collect();
        let flag: u16 = fields[1].parse().unwrap();
        if flag & crate::output::sam_flags::UNMAPPED != 0 {
            assert_eq!(fields[2], "*");
            assert_eq!(fields[3], "0");
        }
    }

    #[test]
    fn test_short_read_length_filter() {
        let reference = random_ref(400, 0x99);
        let mut opts = AlnOpts::default();
        opts.seed_len = 22;
        // length 10 < seed length: no seeds, unaligned
        let lines = run_job(&reference, &[("tiny".to_string(), "ACGTACGTAC".to_string())], opts);
        assert_eq!(lines.len(), 1);
        let flag: u16 = lines[0].split('\t').nth(1).unwrap().parse().unwrap();
        assert_ne!(flag & crate::output::sam_flags::UNMAPPED, 0);
    }

    #[test]
    fn test_top_k_reports_k_of_many() {
        // a repeated 40-mer occurring 5 times; -k 3 reports exactly 3
        let unit = random_ref(40, 0x5151);
        let spacer1 = random_ref(20, 0x01);
        let spacer2 = random_ref(20, 0x02);
        let spacer3 = random_ref(20, 0x03);
        let spacer4 = random_ref(20, 0x04);
        let reference = format!(
            "{u}{s1}{u}{s2}{u}{s3}{u}{s4}{u}",
            u = unit,
            s1 = spacer1,
            s2 = spacer2,
            s3 = spacer3,
            s4 = spacer4
        );
        let mut opts = AlnOpts::default();
        opts.seed_len = 20;
        opts.mode = ReportMode::TopK(3);
        let lines = run_job(&reference, &[("rep".to_string(), unit.clone())], opts);
        assert_eq!(lines.len(), 3);
        // all score-tied; positions must come from the set of 5 starts
        let starts: Vec<u64> = (0..5).map(|i| (i * 60 + 1) as u64).collect();
        for l in &lines {
            let pos: u64 = l.split('\t').nth(3).unwrap().parse().unwrap();
            assert!(starts.contains(&pos), "pos {} not an occurrence", pos);
        }
    }
}
