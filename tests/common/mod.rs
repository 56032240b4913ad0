// Shared harness for the integration tests: build an in-memory index,
// write reads to a temp FASTQ, run the full worker pipeline, and hand
// back the emitted records.
#![allow(dead_code)]

use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use seedmap::cache::SharedCache;
use seedmap::fastq::PatternSource;
use seedmap::index::SeedIndex;
use seedmap::metrics::{Metrics, MetricsAggregator};
use seedmap::opts::AlnOpts;
use seedmap::output::{OutputFormat, OutputSink};
use seedmap::worker::{run, AlignEnv};

pub struct VecWriter(pub Arc<Mutex<Vec<u8>>>);

impl Write for VecWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }
    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// A read with explicit qualities (Phred+33 ASCII).
pub type TestRead = (String, String, String);

pub fn write_fastq(dir: &tempfile::TempDir, name: &str, records: &[TestRead]) -> PathBuf {
    let path = dir.path().join(name);
    let mut f = File::create(&path).unwrap();
    for (id, seq, qual) in records {
        writeln!(f, "@{}\n{}\n+\n{}", id, seq, qual).unwrap();
    }
    path
}

pub fn revcomp_str(s: &str) -> String {
    s.bytes()
        .rev()
        .map(|b| match b {
            b'A' => 'T',
            b'C' => 'G',
            b'G' => 'C',
            b'T' => 'A',
            _ => 'N',
        })
        .collect()
}

pub fn random_ref(n: usize, mut x: u64) -> String {
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

pub struct PipelineResult {
    /// Alignment records (header lines stripped).
    pub records: Vec<String>,
    /// Full output including the header.
    pub raw: String,
    pub metrics: Metrics,
}

/// Run the whole pipeline over the given reads.
pub fn run_pipeline(
    reference: &[(&str, &str)],
    reads1: &[TestRead],
    reads2: Option<&[TestRead]>,
    opts: &AlnOpts,
) -> PipelineResult {
    let dir = tempfile::tempdir().unwrap();
    let p1 = write_fastq(&dir, "r1.fq", reads1);
    let p2 = reads2.map(|r| write_fastq(&dir, "r2.fq", r));

    let refs: Vec<(String, Vec<u8>)> = reference
        .iter()
        .map(|(n, s)| (n.to_string(), s.as_bytes().to_vec()))
        .collect();
    let idx = SeedIndex::build(&refs, opts.seed_mms > 0);

    let buf = Arc::new(Mutex::new(Vec::new()));
    let out = OutputSink::new(OutputFormat::Sam, Box::new(VecWriter(Arc::clone(&buf))));
    out.emit_header(&idx, "seedmap (test)").unwrap();
    let agg = MetricsAggregator::new();
    let shared_cache = if opts.no_cache {
        None
    } else {
        Some(Arc::new(SharedCache::new(opts.cache_shared_bytes)))
    };
    let env = AlignEnv {
        idx: &idx,
        opts,
        out: &out,
        agg: &agg,
        shared_cache,
        met_out: None,
    };
    let src = PatternSource::open(
        &p1,
        p2.as_deref(),
        opts.format,
        opts.qual_enc,
        opts.trim5,
        opts.trim3,
        opts.skip,
        opts.upto_bound(),
    )
    .unwrap();
    run(&env, src).unwrap();

    let raw = String::from_utf8(buf.lock().unwrap().clone()).unwrap();
    let records = raw
        .lines()
        .filter(|l| !l.starts_with('@'))
        .map(|l| l.to_string())
        .collect();
    PipelineResult {
        records,
        raw,
        metrics: agg.total(),
    }
}

pub fn field<'a>(record: &'a str, i: usize) -> &'a str {
    record.split('\t').nth(i).unwrap()
}

pub fn flag_of(record: &str) -> u16 {
    field(record, 1).parse().unwrap()
}

pub fn pos_of(record: &str) -> u64 {
    field(record, 3).parse().unwrap()
}

pub fn tag_i64(record: &str, tag: &str) -> Option<i64> {
    let prefix = format!("{}:i:", tag);
    record
        .split('\t')
        .find(|f| f.starts_with(&prefix))
        .and_then(|f| f[prefix.len()..].parse().ok())
}
