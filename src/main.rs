use std::fs::File;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use clap::Parser;

use seedmap::cache::SharedCache;
use seedmap::errors::AlnError;
use seedmap::fastq::PatternSource;
use seedmap::index::SeedIndex;
use seedmap::metrics::MetricsAggregator;
use seedmap::opts::{resolve_report_mode, AlnOpts, InputFormat, QualityEncoding};
use seedmap::output::{OutputFormat, OutputSink};
use seedmap::simd::simd_engine_description;
use seedmap::simple_func::SimpleFunc;
use seedmap::worker::{run, AlignEnv};

#[derive(Parser)]
#[command(name = "seedmap")]
#[command(about = "seedmap - multiseed seed-and-extend short-read aligner", long_about = None)]
#[command(version)]
struct Cli {
    /// Reference FASTA to index and align against
    #[arg(short = 'x', long, value_name = "REF.FA")]
    reference: PathBuf,

    /// Read file(s): one for single-end, two for paired-end
    #[arg(value_name = "READS.FQ", required = true, num_args = 1..=2)]
    reads: Vec<PathBuf>,

    /// Output file (default: stdout)
    #[arg(short = 'S', long, value_name = "FILE")]
    output: Option<PathBuf>,

    // ===== Input =====
    /// Reads are FASTA (no qualities; maximum assumed)
    #[arg(short = 'f', long)]
    fasta: bool,

    /// Skip the first N reads/pairs
    #[arg(short = 's', long, value_name = "INT")]
    skip: Option<u64>,

    /// Stop after the first N reads/pairs past --skip
    #[arg(short = 'u', long, value_name = "INT")]
    upto: Option<u64>,

    /// Trim N bases from the 5' end of each read
    #[arg(short = '5', long, value_name = "INT", default_value = "0")]
    trim5: usize,

    /// Trim N bases from the 3' end of each read
    #[arg(short = '3', long, value_name = "INT", default_value = "0")]
    trim3: usize,

    /// Qualities are Phred+64
    #[arg(long)]
    phred64: bool,

    /// Qualities are Solexa+64
    #[arg(long = "solexa-quals")]
    solexa_quals: bool,

    /// Qualities are space-delimited integers
    #[arg(long = "int-quals")]
    int_quals: bool,

    /// Drop reads whose upstream QC flag is set
    #[arg(long = "qc-filter")]
    qc_filter: bool,

    // ===== Presets =====
    /// Apply the very-fast preset (expands with --local)
    #[arg(long = "very-fast", group = "preset")]
    very_fast: bool,

    /// Apply the fast preset
    #[arg(long, group = "preset")]
    fast: bool,

    /// Apply the sensitive preset (default)
    #[arg(long, group = "preset")]
    sensitive: bool,

    /// Apply the very-sensitive preset
    #[arg(long = "very-sensitive", group = "preset")]
    very_sensitive: bool,

    /// Apply a named preset; %LOCAL% expands against --local
    #[arg(short = 'P', long, value_name = "NAME", group = "preset")]
    preset: Option<String>,

    // ===== Alignment =====
    /// Max mismatches in seed alignment: 0, 1 or 2
    #[arg(short = 'N', long = "seed-mismatches", value_name = "INT")]
    seed_mismatches: Option<u8>,

    /// Length of seed substrings (4-31)
    #[arg(short = 'L', long = "seed-len", value_name = "INT")]
    seed_len: Option<usize>,

    /// Interval between seed substrings as a function of read length
    #[arg(short = 'i', long = "seed-ival", value_name = "FUNC")]
    seed_ival: Option<String>,

    /// Max number of ambiguous bases as a function of read length
    #[arg(long = "n-ceil", value_name = "FUNC")]
    n_ceil: Option<String>,

    /// Reference padding on either side of the DP window
    #[arg(long, value_name = "INT", default_value = "15")]
    dpad: usize,

    /// Band half-width on either side of the seed diagonal
    #[arg(long, value_name = "INT", default_value = "15")]
    maxhalf: usize,

    /// Disallow gaps within INT read positions of either end
    #[arg(long, value_name = "INT", default_value = "4")]
    gbar: usize,

    /// Do not align the forward orientation of reads
    #[arg(long)]
    nofw: bool,

    /// Do not align the reverse-complement orientation of reads
    #[arg(long)]
    norc: bool,

    /// Local alignment (soft clipping allowed)
    #[arg(long, conflicts_with = "end_to_end")]
    local: bool,

    /// End-to-end alignment (default)
    #[arg(long = "end-to-end")]
    end_to_end: bool,

    // ===== Scoring =====
    /// Match bonus (local mode only; must be 0 end-to-end)
    #[arg(long = "ma", value_name = "INT")]
    match_bonus: Option<i64>,

    /// Maximum mismatch penalty
    #[arg(long = "mp", value_name = "INT")]
    mismatch_max: Option<i64>,

    /// Penalty for positions involving N
    #[arg(long = "np", value_name = "INT")]
    n_penalty: Option<i64>,

    /// Read gap open and extend penalties
    #[arg(long = "rdg", value_name = "INT,INT")]
    read_gap: Option<String>,

    /// Reference gap open and extend penalties
    #[arg(long = "rfg", value_name = "INT,INT")]
    ref_gap: Option<String>,

    /// Minimum valid score as a function of read length
    #[arg(long = "score-min", value_name = "FUNC")]
    score_min: Option<String>,

    // ===== Reporting =====
    /// Report up to K alignments per read
    #[arg(short = 'k', value_name = "INT")]
    khits: Option<usize>,

    /// Report all alignments
    #[arg(short = 'a', long = "all")]
    all_hits: bool,

    /// Report the best alignment, MAPQ aware of up to N+1 others
    #[arg(short = 'M', value_name = "INT")]
    best_m: Option<usize>,

    /// Suppress discordant pair reporting
    #[arg(long = "no-discordant")]
    no_discordant: bool,

    /// Suppress unpaired reporting for paired reads
    #[arg(long = "no-mixed")]
    no_mixed: bool,

    // ===== Paired-end =====
    /// Minimum fragment length
    #[arg(short = 'I', long = "minins", value_name = "INT", default_value = "0")]
    min_frag: i64,

    /// Maximum fragment length
    #[arg(short = 'X', long = "maxins", value_name = "INT", default_value = "500")]
    max_frag: i64,

    /// Mates align forward/reverse-complement (default)
    #[arg(long, group = "pe_orient")]
    fr: bool,

    /// Mates align reverse-complement/forward
    #[arg(long, group = "pe_orient")]
    rf: bool,

    /// Mates align forward/forward
    #[arg(long, group = "pe_orient")]
    ff: bool,

    /// Accept mates that extend past each other
    #[arg(long)]
    dovetail: bool,

    /// Reject pairs where one mate contains the other
    #[arg(long = "no-contain")]
    no_contain: bool,

    /// Reject pairs whose mates overlap
    #[arg(long = "no-overlap")]
    no_overlap: bool,

    // ===== Offset resolution =====
    /// Use the reference scanner for narrowed seed ranges
    #[arg(long = "scan-narrowed")]
    scan_narrowed: bool,

    // ===== Performance =====
    /// Number of alignment threads
    #[arg(short = 'p', long, value_name = "INT")]
    threads: Option<usize>,

    /// Memory-map the reference file
    #[arg(long)]
    mm: bool,

    /// Disable the vector DP kernels
    #[arg(long = "no-simd")]
    no_simd: bool,

    /// Disable the thread-local and process-shared alignment caches
    #[arg(long = "no-cache")]
    no_cache: bool,

    /// Byte budget for the current-read cache
    #[arg(long = "cache-current-bytes", value_name = "BYTES")]
    cache_current_bytes: Option<usize>,

    /// Byte budget for the thread-local cache
    #[arg(long = "cache-local-bytes", value_name = "BYTES")]
    cache_local_bytes: Option<usize>,

    /// Byte budget for the process-shared cache; 0 disables that scope
    #[arg(long = "cache-shared-bytes", value_name = "BYTES")]
    cache_shared_bytes: Option<usize>,

    // ===== Metrics =====
    /// Seconds between metrics lines
    #[arg(long = "met", value_name = "INT", default_value = "1")]
    met_ival: u64,

    /// Write metrics to FILE
    #[arg(long = "met-file", value_name = "FILE")]
    met_file: Option<PathBuf>,

    /// Write metrics to standard error
    #[arg(long = "met-stderr")]
    met_stderr: bool,

    /// Enable expensive invariant checks
    #[arg(long)]
    sanity: bool,

    /// Verbosity: 1=error, 2=warning, 3=message, 4+=debugging
    #[arg(short = 'v', long, value_name = "INT", default_value = "3")]
    verbosity: i32,
}

fn build_opts(cli: &Cli) -> Result<AlnOpts, AlnError> {
    // --end-to-end and --local conflict at the parser; the default is
    // end-to-end
    debug_assert!(!(cli.local && cli.end_to_end));
    let mut opts = AlnOpts::default_for(cli.local);

    // Default preset first, then any explicit preset; explicit flags
    // are applied afterwards and win on scalars
    let default_preset = AlnOpts::expand_preset_name("sensitive%LOCAL%", cli.local);
    opts.apply_preset(&default_preset)?;
    let chosen = if cli.very_fast {
        Some("very-fast%LOCAL%".to_string())
    } else if cli.fast {
        Some("fast%LOCAL%".to_string())
    } else if cli.sensitive {
        Some("sensitive%LOCAL%".to_string())
    } else if cli.very_sensitive {
        Some("very-sensitive%LOCAL%".to_string())
    } else {
        cli.preset.clone()
    };
    if let Some(name) = chosen {
        let expanded = AlnOpts::expand_preset_name(&name, cli.local);
        opts.apply_preset(&expanded)?;
    }

    // Input
    if cli.fasta {
        opts.format = InputFormat::Fasta;
    }
    let enc_flags = [cli.phred64, cli.solexa_quals, cli.int_quals];
    if enc_flags.iter().filter(|&&x| x).count() > 1 {
        return Err(AlnError::config(
            "give at most one of --phred64, --solexa-quals, --int-quals",
        ));
    }
    opts.qual_enc = if cli.phred64 {
        QualityEncoding::Phred64
    } else if cli.solexa_quals {
        QualityEncoding::Solexa
    } else if cli.int_quals {
        QualityEncoding::IntQuals
    } else {
        QualityEncoding::Phred33
    };
    opts.skip = cli.skip.unwrap_or(0);
    opts.upto = cli.upto;
    opts.trim5 = cli.trim5;
    opts.trim3 = cli.trim3;
    opts.qc_filter = cli.qc_filter;

    // Alignment
    if let Some(n) = cli.seed_mismatches {
        opts.seed_mms = n;
    }
    if let Some(l) = cli.seed_len {
        opts.seed_len = l;
    }
    if let Some(f) = &cli.seed_ival {
        opts.interval = SimpleFunc::parse(f).map_err(AlnError::Config)?;
    }
    if let Some(f) = &cli.n_ceil {
        opts.n_ceiling = SimpleFunc::parse(f).map_err(AlnError::Config)?;
    }
    opts.dpad = cli.dpad;
    opts.maxhalf = cli.maxhalf;
    opts.gap_barrier = cli.gbar;
    opts.nofw = cli.nofw;
    opts.norc = cli.norc;

    // Scoring
    if let Some(b) = cli.match_bonus {
        opts.match_bonus = b;
    }
    if let Some(p) = cli.mismatch_max {
        opts.mm_penalty_max = p;
    }
    if let Some(p) = cli.n_penalty {
        opts.n_penalty = p;
    }
    if let Some(s) = &cli.read_gap {
        let (open, extend) = parse_pair(s)?;
        opts.read_gap_open = open;
        opts.read_gap_extend = extend;
    }
    if let Some(s) = &cli.ref_gap {
        let (open, extend) = parse_pair(s)?;
        opts.ref_gap_open = open;
        opts.ref_gap_extend = extend;
    }
    if let Some(f) = &cli.score_min {
        opts.score_min = SimpleFunc::parse(f).map_err(AlnError::Config)?;
    }

    // Reporting: -k/-a/-M are mutually exclusive, hard error
    if let Some(mode) = resolve_report_mode(cli.khits, cli.all_hits, cli.best_m)? {
        opts.mode = mode;
    }
    opts.no_discordant = cli.no_discordant;
    opts.no_mixed = cli.no_mixed;

    // Paired-end
    opts.min_frag = cli.min_frag;
    opts.max_frag = cli.max_frag;
    opts.orient = if cli.rf {
        seedmap::pe::PairOrientation::Rf
    } else if cli.ff {
        seedmap::pe::PairOrientation::Ff
    } else {
        seedmap::pe::PairOrientation::Fr
    };
    opts.dovetail = cli.dovetail;
    opts.no_contain = cli.no_contain;
    opts.no_overlap = cli.no_overlap;

    opts.scan_narrowed = cli.scan_narrowed;

    // Performance
    opts.threads = cli.threads.unwrap_or_else(num_cpus::get).max(1);
    opts.mm_index = cli.mm;
    opts.no_simd = cli.no_simd;

    // Cache budgets
    opts.no_cache = cli.no_cache;
    if let Some(bytes) = cli.cache_current_bytes {
        opts.cache_current_bytes = bytes;
    }
    if let Some(bytes) = cli.cache_local_bytes {
        opts.cache_local_bytes = bytes;
    }
    if let Some(bytes) = cli.cache_shared_bytes {
        opts.cache_shared_bytes = bytes;
    }

    opts.met_ival_secs = cli.met_ival.max(1);
    opts.met_file = cli.met_file.clone();
    opts.met_stderr = cli.met_stderr;
    opts.sanity = cli.sanity;

    opts.validate()?;
    Ok(opts)
}

fn parse_pair(s: &str) -> Result<(i64, i64), AlnError> {
    let parts: Vec<&str> = s.split(',').collect();
    if parts.len() != 2 {
        return Err(AlnError::config(format!("expected INT,INT: {}", s)));
    }
    let a = parts[0]
        .trim()
        .parse::<i64>()
        .map_err(|_| AlnError::config(format!("invalid integer: {}", parts[0])))?;
    let b = parts[1]
        .trim()
        .parse::<i64>()
        .map_err(|_| AlnError::config(format!("invalid integer: {}", parts[1])))?;
    Ok((a, b))
}

/// Load the reference FASTA, optionally memory-mapped.
fn load_reference(path: &PathBuf, use_mmap: bool) -> Result<Vec<(String, Vec<u8>)>, AlnError> {
    use bio::io::fasta;
    let mut refs = Vec::new();
    let parse = |reader: fasta::Reader<io::BufReader<&[u8]>>| -> Result<Vec<(String, Vec<u8>)>, AlnError> {
        let mut out = Vec::new();
        for rec in reader.records() {
            let rec = rec.map_err(|e| {
                AlnError::IndexFormat(format!("bad FASTA record in {}: {}", path.display(), e))
            })?;
            out.push((rec.id().to_string(), rec.seq().to_vec()));
        }
        Ok(out)
    };
    if use_mmap {
        let file = File::open(path)?;
        let map = unsafe { memmap2::Mmap::map(&file)? };
        refs.extend(parse(fasta::Reader::new(&map[..]))?);
    } else {
        let data = std::fs::read(path)?;
        refs.extend(parse(fasta::Reader::new(&data[..]))?);
    }
    if refs.is_empty() {
        return Err(AlnError::IndexFormat(format!(
            "no sequences in reference {}",
            path.display()
        )));
    }
    Ok(refs)
}

fn real_main() -> Result<(), AlnError> {
    let cli = Cli::parse();

    let log_level = match cli.verbosity {
        v if v <= 1 => log::LevelFilter::Error,
        2 => log::LevelFilter::Warn,
        3 => log::LevelFilter::Info,
        4 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    env_logger::Builder::from_default_env()
        .filter_level(log_level)
        .format_timestamp(None)
        .format_target(false)
        .init();

    let opts = build_opts(&cli)?;

    log::info!("Using SIMD engine: {}", simd_engine_description());
    log::info!("Loading reference: {}", cli.reference.display());
    let refs = load_reference(&cli.reference, opts.mm_index)?;
    let with_reverse = opts.seed_mms > 0;
    let idx = SeedIndex::build(&refs, with_reverse);
    log::info!(
        "Indexed {} sequence(s), {} bases{}",
        idx.n_patterns(),
        idx.text().len(),
        if with_reverse { " (forward + reverse)" } else { "" }
    );

    let writer: Box<dyn Write + Send> = match &cli.output {
        Some(p) => Box::new(io::BufWriter::new(File::create(p)?)),
        None => Box::new(io::BufWriter::new(io::stdout())),
    };
    let out = OutputSink::new(OutputFormat::Sam, writer);
    let cmdline = std::env::args().collect::<Vec<_>>().join(" ");
    out.emit_header(&idx, &cmdline)?;

    let met_out: Option<Mutex<Box<dyn Write + Send>>> = if let Some(p) = &opts.met_file {
        Some(Mutex::new(Box::new(io::BufWriter::new(File::create(p)?))))
    } else if opts.met_stderr {
        Some(Mutex::new(Box::new(io::stderr())))
    } else {
        None
    };
    let agg = MetricsAggregator::new();
    if let Some(mw) = &met_out {
        let mut w = mw.lock().unwrap();
        MetricsAggregator::report_header(&mut **w)?;
    }

    let shared_cache = if opts.no_cache || opts.cache_shared_bytes == 0 {
        None
    } else {
        Some(Arc::new(SharedCache::new(opts.cache_shared_bytes)))
    };

    let src = PatternSource::open(
        &cli.reads[0],
        cli.reads.get(1).map(|p| p.as_path()),
        opts.format,
        opts.qual_enc,
        opts.trim5,
        opts.trim3,
        opts.skip,
        opts.upto_bound(),
    )?;

    log::info!(
        "Aligning with {} thread(s), seed length {}, {} seed mismatch(es)",
        opts.threads,
        opts.seed_len,
        opts.seed_mms
    );

    let env = AlignEnv {
        idx: &idx,
        opts: &opts,
        out: &out,
        agg: &agg,
        shared_cache,
        met_out: met_out.as_ref(),
    };
    run(&env, src)?;

    let total = agg.total();
    log::info!(
        "{} reads; {} aligned concordantly, {} discordantly, {} unpaired, {} unaligned",
        total.olm.reads,
        total.rpm.concordant_pairs,
        total.rpm.discordant_pairs,
        total.rpm.unpaired_aligned,
        total.rpm.unaligned
    );
    Ok(())
}

fn main() {
    if let Err(e) = real_main() {
        eprintln!("seedmap: {}", e);
        std::process::exit(e.exit_code());
    }
}
