// Alignment options.
//
// One immutable record built by the argument parser and threaded
// through construction of every component; nothing reads configuration
// at alignment time from anywhere else. Presets expand to combinations
// of reporting mode, seed mismatches, seed length and seed interval,
// with a %LOCAL% marker in the preset name substituted against the
// local flag before lookup.

use std::path::PathBuf;

use crate::cache::{CURRENT_CACHE_BYTES, LOCAL_CACHE_BYTES, SHARED_CACHE_BYTES};
use crate::errors::AlnError;
use crate::pe::{PairOrientation, PairedEndPolicy};
use crate::scoring::{PenaltyKind, Scoring};
use crate::simple_func::SimpleFunc;
use crate::sink::{ReportMode, ReportingParams};
use crate::walk::OffsetResolver;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputFormat {
    Fastq,
    Fasta,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QualityEncoding {
    Phred33,
    Phred64,
    Solexa,
    IntQuals,
}

#[derive(Debug, Clone)]
pub struct AlnOpts {
    // Alignment
    pub seed_len: usize,
    pub seed_mms: u8,
    pub interval: SimpleFunc,
    pub n_ceiling: SimpleFunc,
    /// Reference padding around the seed diagonal for DP windows.
    pub dpad: usize,
    /// Band half-width on one side of the diagonal.
    pub maxhalf: usize,
    pub gap_barrier: usize,
    pub nofw: bool,
    pub norc: bool,
    pub local: bool,

    // Scoring
    pub match_bonus: i64,
    pub mm_penalty_max: i64,
    pub mm_qual_scaled: bool,
    pub n_penalty: i64,
    pub n_cat_pair: bool,
    pub read_gap_open: i64,
    pub read_gap_extend: i64,
    pub ref_gap_open: i64,
    pub ref_gap_extend: i64,
    pub score_min: SimpleFunc,
    pub score_floor: SimpleFunc,

    // Reporting
    pub mode: ReportMode,
    pub no_discordant: bool,
    pub no_mixed: bool,

    // Paired-end
    pub min_frag: i64,
    pub max_frag: i64,
    pub orient: PairOrientation,
    pub dovetail: bool,
    pub no_contain: bool,
    pub no_overlap: bool,

    // Input
    pub format: InputFormat,
    pub qual_enc: QualityEncoding,
    pub skip: u64,
    pub upto: Option<u64>,
    pub trim5: usize,
    pub trim3: usize,
    pub qc_filter: bool,

    // Offset resolution
    pub pos_frac: SimpleFunc,
    pub row_mult: SimpleFunc,
    pub scan_narrowed: bool,

    // Caches
    pub cache_current_bytes: usize,
    pub cache_local_bytes: usize,
    /// Zero disables the process-shared scope.
    pub cache_shared_bytes: usize,
    pub no_cache: bool,

    // Performance
    pub threads: usize,
    pub mm_index: bool,
    pub no_simd: bool,

    // Metrics
    pub met_ival_secs: u64,
    pub met_file: Option<PathBuf>,
    pub met_stderr: bool,

    pub sanity: bool,
}

impl Default for AlnOpts {
    fn default() -> Self {
        AlnOpts {
            seed_len: 22,
            seed_mms: 0,
            interval: SimpleFunc::parse("S,1,1.25").unwrap(),
            n_ceiling: SimpleFunc::linear(0.0, 0.15),
            dpad: 15,
            maxhalf: 15,
            gap_barrier: 4,
            nofw: false,
            norc: false,
            local: false,

            match_bonus: 0,
            mm_penalty_max: 6,
            mm_qual_scaled: true,
            n_penalty: 1,
            n_cat_pair: false,
            read_gap_open: 5,
            read_gap_extend: 3,
            ref_gap_open: 5,
            ref_gap_extend: 3,
            score_min: SimpleFunc::linear(-0.6, -0.6),
            score_floor: SimpleFunc::constant(f64::MIN),

            mode: ReportMode::BestWithMapq(5),
            no_discordant: false,
            no_mixed: false,

            min_frag: 0,
            max_frag: 500,
            orient: PairOrientation::Fr,
            dovetail: false,
            no_contain: false,
            no_overlap: false,

            format: InputFormat::Fastq,
            qual_enc: QualityEncoding::Phred33,
            skip: 0,
            upto: None,
            trim5: 0,
            trim3: 0,
            qc_filter: false,

            pos_frac: SimpleFunc::linear(1.0, 0.25).with_min(1.0),
            row_mult: SimpleFunc::constant(10.0),
            scan_narrowed: false,

            cache_current_bytes: CURRENT_CACHE_BYTES,
            cache_local_bytes: LOCAL_CACHE_BYTES,
            cache_shared_bytes: SHARED_CACHE_BYTES,
            no_cache: false,

            threads: 1,
            mm_index: false,
            no_simd: false,

            met_ival_secs: 1,
            met_file: None,
            met_stderr: false,

            sanity: false,
        }
    }
}

impl AlnOpts {
    /// Defaults for the chosen alignment mode. Local mode switches the
    /// match bonus, minimum-score and floor functions.
    pub fn default_for(local: bool) -> Self {
        let mut o = AlnOpts::default();
        if local {
            o.local = true;
            o.match_bonus = 2;
            o.score_min = SimpleFunc::parse("G,20,8").unwrap();
            o.score_floor = SimpleFunc::constant(0.0);
        }
        o
    }

    /// Substitute the %LOCAL% marker in a preset name.
    pub fn expand_preset_name(name: &str, local: bool) -> String {
        name.replace("%LOCAL%", if local { "-local" } else { "" })
    }

    /// Apply a named preset. The name must already be %LOCAL%-expanded.
    /// Presets set the reporting mode, seed mismatches, seed length and
    /// seed interval; explicit flags applied afterwards win.
    pub fn apply_preset(&mut self, name: &str) -> Result<(), AlnError> {
        let (mode_n, mms, len, ival) = match name {
            "very-fast" => (1, 0, 22, "S,1,2.50"),
            "fast" => (5, 0, 22, "S,1,2.50"),
            "sensitive" => (5, 0, 22, "S,1,1.25"),
            "very-sensitive" => (5, 0, 20, "S,1,0.50"),
            "very-fast-local" => (1, 0, 25, "S,1,2.00"),
            "fast-local" => (2, 0, 22, "S,1,1.75"),
            "sensitive-local" => (2, 0, 20, "S,1,0.75"),
            "very-sensitive-local" => (3, 0, 20, "S,1,0.50"),
            other => {
                return Err(AlnError::config(format!("unknown preset: {}", other)));
            }
        };
        self.mode = ReportMode::BestWithMapq(mode_n);
        self.seed_mms = mms;
        self.seed_len = len;
        self.interval = SimpleFunc::parse(ival).map_err(AlnError::Config)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), AlnError> {
        if !(4..=31).contains(&self.seed_len) {
            return Err(AlnError::config(format!(
                "seed length must be in 4..=31, got {}",
                self.seed_len
            )));
        }
        if self.seed_mms > 2 {
            return Err(AlnError::config(format!(
                "seed mismatches must be 0, 1 or 2, got {}",
                self.seed_mms
            )));
        }
        if self.seed_mms as usize > self.seed_len {
            return Err(AlnError::config(
                "seed mismatch budget exceeds seed length",
            ));
        }
        if self.nofw && self.norc {
            return Err(AlnError::config(
                "--nofw and --norc together leave nothing to align",
            ));
        }
        if self.min_frag > self.max_frag {
            return Err(AlnError::config(format!(
                "minimum fragment length {} exceeds maximum {}",
                self.min_frag, self.max_frag
            )));
        }
        if self.mm_penalty_max < 0
            || self.n_penalty < 0
            || self.read_gap_open < 0
            || self.read_gap_extend < 0
            || self.ref_gap_open < 0
            || self.ref_gap_extend < 0
        {
            return Err(AlnError::config("penalties must be non-negative"));
        }
        if !self.local && self.match_bonus != 0 {
            return Err(AlnError::config(
                "match bonus must be 0 in end-to-end mode",
            ));
        }
        if let ReportMode::TopK(0) = self.mode {
            return Err(AlnError::config("-k must be at least 1"));
        }
        if self.threads == 0 {
            return Err(AlnError::config("thread count must be at least 1"));
        }
        Ok(())
    }

    /// First read ordinal past the processing window. The addition
    /// saturates rather than relying on an overflow comparison.
    pub fn upto_bound(&self) -> u64 {
        match self.upto {
            Some(u) => self.skip.saturating_add(u),
            None => u64::MAX,
        }
    }

    pub fn scoring(&self) -> Scoring {
        Scoring {
            match_bonus: self.match_bonus,
            mm_kind: if self.mm_qual_scaled {
                PenaltyKind::QualScaled
            } else {
                PenaltyKind::Constant
            },
            mm_penalty_max: self.mm_penalty_max,
            n_penalty: self.n_penalty,
            n_as_mm: false,
            n_cat_pair: self.n_cat_pair,
            read_gap_open: self.read_gap_open,
            read_gap_extend: self.read_gap_extend,
            ref_gap_open: self.ref_gap_open,
            ref_gap_extend: self.ref_gap_extend,
            min_score: self.score_min,
            score_floor: self.score_floor,
            n_ceiling: self.n_ceiling,
            seed_interval: self.interval,
            local: self.local,
        }
    }

    pub fn pe_policy(&self) -> PairedEndPolicy {
        PairedEndPolicy {
            orient: self.orient,
            min_frag: self.min_frag,
            max_frag: self.max_frag,
            local: self.local,
            flipped_ok: false,
            dovetail_ok: self.dovetail,
            contain_ok: !self.no_contain,
            overlap_ok: !self.no_overlap,
            expand_to_frag: true,
        }
    }

    pub fn reporting(&self) -> ReportingParams {
        ReportingParams {
            mode: self.mode,
            discord: !self.no_discordant,
            mixed: !self.no_mixed,
        }
    }

    /// Base offset resolver; the worker boosts it by the reporting
    /// policy factor and halves it again for the paired path.
    pub fn resolver(&self) -> OffsetResolver {
        OffsetResolver {
            pos_frac: self.pos_frac,
            row_mult: self.row_mult,
            scan_narrowed: self.scan_narrowed,
            narrow_ceil: 8,
            sanity: self.sanity,
        }
    }
}

/// Enforce the -k/-a/-M exclusivity as a hard error.
pub fn resolve_report_mode(
    k: Option<usize>,
    all: bool,
    best_m: Option<usize>,
) -> Result<Option<ReportMode>, AlnError> {
    let given = [k.is_some(), all, best_m.is_some()]
        .iter()
        .filter(|&&x| x)
        .count();
    if given > 1 {
        return Err(AlnError::config(
            "-k, -a and -M are mutually exclusive; give at most one",
        ));
    }
    Ok(if let Some(k) = k {
        Some(ReportMode::TopK(k))
    } else if all {
        Some(ReportMode::All)
    } else {
        best_m.map(ReportMode::BestWithMapq)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preset_name_expansion() {
        assert_eq!(
            AlnOpts::expand_preset_name("sensitive%LOCAL%", true),
            "sensitive-local"
        );
        assert_eq!(
            AlnOpts::expand_preset_name("sensitive%LOCAL%", false),
            "sensitive"
        );
    }

    #[test]
    fn test_preset_then_flags_last_wins() {
        // applying a preset then an explicit seed length equals the
        // expanded configuration with the flag applied after
        let mut a = AlnOpts::default();
        a.apply_preset("very-fast").unwrap();
        a.seed_len = 18;
        let mut b = AlnOpts::default();
        b.mode = ReportMode::BestWithMapq(1);
        b.seed_mms = 0;
        b.seed_len = 18;
        b.interval = SimpleFunc::parse("S,1,2.50").unwrap();
        assert_eq!(a.seed_len, b.seed_len);
        assert_eq!(a.mode, b.mode);
        assert_eq!(a.interval.eval(100.0), b.interval.eval(100.0));
    }

    #[test]
    fn test_unknown_preset_rejected() {
        assert!(AlnOpts::default().apply_preset("turbo").is_err());
    }

    #[test]
    fn test_validation_bounds() {
        let mut o = AlnOpts::default();
        o.seed_len = 3;
        assert!(o.validate().is_err());
        o.seed_len = 32;
        assert!(o.validate().is_err());
        o.seed_len = 22;
        assert!(o.validate().is_ok());
        o.seed_mms = 3;
        assert!(o.validate().is_err());
    }

    #[test]
    fn test_report_mode_exclusive() {
        assert!(resolve_report_mode(Some(2), true, None).is_err());
        assert!(resolve_report_mode(Some(2), false, Some(1)).is_err());
        assert_eq!(
            resolve_report_mode(Some(3), false, None).unwrap(),
            Some(ReportMode::TopK(3))
        );
        assert_eq!(resolve_report_mode(None, false, None).unwrap(), None);
    }

    #[test]
    fn test_upto_saturates() {
        let mut o = AlnOpts::default();
        o.skip = u64::MAX - 5;
        o.upto = Some(100);
        assert_eq!(o.upto_bound(), u64::MAX);
        o.skip = 10;
        o.upto = Some(5);
        assert_eq!(o.upto_bound(), 15);
    }

    #[test]
    fn test_match_bonus_forced_zero_end_to_end() {
        let mut o = AlnOpts::default();
        o.match_bonus = 2;
        assert!(o.validate().is_err());
        let l = AlnOpts::default_for(true);
        assert!(l.validate().is_ok());
        assert_eq!(l.match_bonus, 2);
    }
}
