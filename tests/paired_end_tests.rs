// End-to-end scenarios for paired-end alignment.

mod common;

use common::*;
use seedmap::opts::AlnOpts;
use seedmap::output::sam_flags;

fn pe_opts() -> AlnOpts {
    let mut o = AlnOpts::default();
    o.seed_len = 20;
    o.min_frag = 100;
    o.max_frag = 400;
    o
}

/// Mate pair drawn from a reference: mate 1 forward at `p1`, mate 2 the
/// reverse complement of the window ending at `p2_end`.
fn make_pair(
    reference: &str,
    p1: usize,
    p2_end: usize,
    len: usize,
) -> (Vec<TestRead>, Vec<TestRead>) {
    let m1 = reference[p1..p1 + len].to_string();
    let m2 = revcomp_str(&reference[p2_end - len..p2_end]);
    (
        vec![("pair0".to_string(), m1, "I".repeat(len))],
        vec![("pair0".to_string(), m2, "I".repeat(len))],
    )
}

#[test]
fn concordant_fr_pair() {
    // Mate 1 fw at 50, mate 2 rc ending at 380 in a 1 kb reference:
    // fragment 330, inside the 100-400 window
    let reference_str = random_ref(1000, 0xD00D);
    let reference = [("chr1", reference_str.as_str())];
    let (r1, r2) = make_pair(&reference_str, 50, 380, 30);
    let res = run_pipeline(&reference, &r1, Some(&r2[..]), &pe_opts());
    assert_eq!(res.records.len(), 2);
    assert_eq!(res.metrics.rpm.concordant_pairs, 1);

    let rec1 = res.records.iter().find(|r| flag_of(r) & sam_flags::FIRST_IN_PAIR != 0).unwrap();
    let rec2 = res.records.iter().find(|r| flag_of(r) & sam_flags::LAST_IN_PAIR != 0).unwrap();
    for rec in [rec1, rec2] {
        let f = flag_of(rec);
        assert_ne!(f & sam_flags::PAIRED, 0);
        assert_ne!(f & sam_flags::PROPER_PAIR, 0);
        assert!(rec.contains("YT:Z:CP"));
        assert_eq!(field(rec, 6), "=");
    }
    assert_eq!(pos_of(rec1), 51);
    assert_eq!(pos_of(rec2), 351);
    // mate 1 is the leftmost: positive fragment length
    let t1: i64 = field(rec1, 8).parse().unwrap();
    let t2: i64 = field(rec2, 8).parse().unwrap();
    assert_eq!(t1, 330);
    assert_eq!(t2, -330);
    // strands: mate 1 forward, mate 2 reverse
    assert_eq!(flag_of(rec1) & sam_flags::REVERSE, 0);
    assert_ne!(flag_of(rec2) & sam_flags::REVERSE, 0);
    assert_ne!(flag_of(rec1) & sam_flags::MATE_REVERSE, 0);
}

#[test]
fn discordant_pair_when_fragment_too_long() {
    // Mate 2 at 2000, far outside the fragment window: with discordant
    // reporting on, both mates come back paired but not proper
    let reference_str = random_ref(3000, 0xFACE);
    let reference = [("chr1", reference_str.as_str())];
    let (r1, r2) = make_pair(&reference_str, 50, 2030, 30);
    let res = run_pipeline(&reference, &r1, Some(&r2[..]), &pe_opts());
    assert_eq!(res.records.len(), 2);
    assert_eq!(res.metrics.rpm.concordant_pairs, 0);
    assert_eq!(res.metrics.rpm.discordant_pairs, 1);
    for rec in &res.records {
        let f = flag_of(rec);
        assert_ne!(f & sam_flags::PAIRED, 0);
        assert_eq!(f & sam_flags::PROPER_PAIR, 0);
        assert!(rec.contains("YT:Z:DP"));
    }
}

#[test]
fn no_discordant_suppresses_pairing() {
    let reference_str = random_ref(3000, 0xFACE);
    let reference = [("chr1", reference_str.as_str())];
    let (r1, r2) = make_pair(&reference_str, 50, 2030, 30);
    let mut opts = pe_opts();
    opts.no_discordant = true;
    let res = run_pipeline(&reference, &r1, Some(&r2[..]), &opts);
    // mixed mode still reports each mate on its own
    assert_eq!(res.records.len(), 2);
    assert_eq!(res.metrics.rpm.discordant_pairs, 0);
    for rec in &res.records {
        assert!(rec.contains("YT:Z:UP"), "expected unpaired-mate record: {}", rec);
    }
}

#[test]
fn no_mixed_and_no_discordant_leaves_unaligned() {
    let reference_str = random_ref(3000, 0xFACE);
    let reference = [("chr1", reference_str.as_str())];
    let (r1, r2) = make_pair(&reference_str, 50, 2030, 30);
    let mut opts = pe_opts();
    opts.no_discordant = true;
    opts.no_mixed = true;
    let res = run_pipeline(&reference, &r1, Some(&r2[..]), &opts);
    assert_eq!(res.records.len(), 2);
    for rec in &res.records {
        assert_ne!(flag_of(rec) & sam_flags::UNMAPPED, 0);
    }
}

#[test]
fn rf_policy_rejects_fr_pair() {
    let reference_str = random_ref(1000, 0xD00D);
    let reference = [("chr1", reference_str.as_str())];
    let (r1, r2) = make_pair(&reference_str, 50, 380, 30);
    let mut opts = pe_opts();
    opts.orient = seedmap::pe::PairOrientation::Rf;
    let res = run_pipeline(&reference, &r1, Some(&r2[..]), &opts);
    assert_eq!(res.metrics.rpm.concordant_pairs, 0);
}

#[test]
fn fragment_bounds_respected() {
    // Fragment 330 fails a 100-300 window
    let reference_str = random_ref(1000, 0xD00D);
    let reference = [("chr1", reference_str.as_str())];
    let (r1, r2) = make_pair(&reference_str, 50, 380, 30);
    let mut opts = pe_opts();
    opts.max_frag = 300;
    let res = run_pipeline(&reference, &r1, Some(&r2[..]), &opts);
    assert_eq!(res.metrics.rpm.concordant_pairs, 0);
}

#[test]
fn paired_runs_are_deterministic() {
    let reference_str = random_ref(1000, 0x3E3E);
    let reference = [("chr1", reference_str.as_str())];
    let (r1, r2) = make_pair(&reference_str, 120, 420, 30);
    let run_once = || run_pipeline(&reference, &r1, Some(&r2[..]), &pe_opts()).raw;
    assert_eq!(run_once(), run_once());
}
