// Read source.
//
// Wraps bio's FASTQ/FASTA readers with transparent gzip, quality
// normalization to 0-93 integers, fixed end trims, and the skip/upto
// window. Reads come out numbered, seeded for tie-breaks, and paired
// when two files are given.

use std::fs::File;
use std::io::{self, BufReader, Read as IoRead};
use std::path::Path;

use bio::io::{fasta, fastq};
use flate2::read::MultiGzDecoder;

use crate::errors::AlnError;
use crate::opts::{InputFormat, QualityEncoding};
use crate::read::{encode_base, Read};

/// One delivery from the source.
#[derive(Debug)]
pub struct ReadPair {
    pub a: Read,
    pub b: Option<Read>,
}

enum RecordIter {
    Fastq(fastq::Records<BufReader<Box<dyn IoRead + Send>>>),
    Fasta(fasta::Records<BufReader<Box<dyn IoRead + Send>>>),
}

impl RecordIter {
    /// Next (name, seq, raw quals); FASTA records fake maximum quality.
    fn next_record(&mut self) -> io::Result<Option<(String, Vec<u8>, Vec<u8>)>> {
        match self {
            RecordIter::Fastq(records) => match records.next() {
                None => Ok(None),
                Some(Err(e)) => Err(io::Error::new(io::ErrorKind::InvalidData, e)),
                Some(Ok(rec)) => Ok(Some((
                    rec.id().to_string(),
                    rec.seq().to_vec(),
                    rec.qual().to_vec(),
                ))),
            },
            RecordIter::Fasta(records) => match records.next() {
                None => Ok(None),
                Some(Err(e)) => Err(io::Error::new(io::ErrorKind::InvalidData, e)),
                Some(Ok(rec)) => {
                    let quals = vec![b'I'; rec.seq().len()];
                    Ok(Some((rec.id().to_string(), rec.seq().to_vec(), quals)))
                }
            },
        }
    }
}

/// Open a possibly-gzipped file by extension sniff.
fn open_maybe_gz(path: &Path) -> io::Result<Box<dyn IoRead + Send>> {
    let file = File::open(path)?;
    if path.extension().map(|e| e == "gz").unwrap_or(false) {
        Ok(Box::new(MultiGzDecoder::new(file)))
    } else {
        Ok(Box::new(file))
    }
}

fn open_records(path: &Path, format: InputFormat) -> io::Result<RecordIter> {
    let reader = BufReader::new(open_maybe_gz(path)?);
    Ok(match format {
        InputFormat::Fastq => RecordIter::Fastq(fastq::Reader::from_bufread(reader).records()),
        InputFormat::Fasta => RecordIter::Fasta(fasta::Reader::from_bufread(reader).records()),
    })
}

/// Normalize one raw quality string to 0-93 integers.
pub fn normalize_quals(raw: &[u8], enc: QualityEncoding, seq_len: usize) -> Result<Vec<u8>, String> {
    let clamp = |v: i32| -> u8 { v.clamp(0, 93) as u8 };
    match enc {
        QualityEncoding::Phred33 => Ok(raw.iter().map(|&b| clamp(b as i32 - 33)).collect()),
        QualityEncoding::Phred64 => Ok(raw.iter().map(|&b| clamp(b as i32 - 64)).collect()),
        QualityEncoding::Solexa => Ok(raw
            .iter()
            .map(|&b| {
                // Solexa odds to Phred scale
                let s = b as f64 - 64.0;
                let p = 10.0 * (1.0 + 10f64.powf(s / 10.0)).log10();
                clamp(p.round() as i32)
            })
            .collect()),
        QualityEncoding::IntQuals => {
            let text = std::str::from_utf8(raw).map_err(|_| "invalid integer quality string")?;
            let vals: Result<Vec<u8>, String> = text
                .split_whitespace()
                .map(|tok| {
                    tok.parse::<i32>()
                        .map(clamp)
                        .map_err(|_| format!("invalid integer quality: {}", tok))
                })
                .collect();
            let vals = vals?;
            if vals.len() != seq_len {
                return Err(format!(
                    "integer quality count {} does not match read length {}",
                    vals.len(),
                    seq_len
                ));
            }
            Ok(vals)
        }
    }
}

/// Deterministic per-read seed folded from name and sequence.
fn fold_seed(name: &str, seq: &[u8], ordinal: u64) -> u64 {
    let mut h: u64 = 0xcbf29ce484222325;
    for b in name.bytes().chain(seq.iter().copied()) {
        h ^= b as u64;
        h = h.wrapping_mul(0x100000001b3);
    }
    h ^ ordinal.rotate_left(32)
}

/// Pattern source: single or paired files, skip/upto window applied
/// before delivery. Not itself thread-safe; the worker runtime owns it
/// behind a reader thread.
pub struct PatternSource {
    r1: RecordIter,
    r2: Option<RecordIter>,
    enc: QualityEncoding,
    trim5: usize,
    trim3: usize,
    skip: u64,
    upto_bound: u64,
    next_ordinal: u64,
}

impl PatternSource {
    #[allow(clippy::too_many_arguments)]
    pub fn open(
        path1: &Path,
        path2: Option<&Path>,
        format: InputFormat,
        enc: QualityEncoding,
        trim5: usize,
        trim3: usize,
        skip: u64,
        upto_bound: u64,
    ) -> Result<Self, AlnError> {
        let r1 = open_records(path1, format)?;
        let r2 = match path2 {
            Some(p) => Some(open_records(p, format)?),
            None => None,
        };
        Ok(PatternSource {
            r1,
            r2,
            enc,
            trim5,
            trim3,
            skip,
            upto_bound,
            next_ordinal: 0,
        })
    }

    fn build_read(
        &self,
        name: String,
        seq_raw: Vec<u8>,
        qual_raw: Vec<u8>,
        ordinal: u64,
    ) -> Result<Read, AlnError> {
        let quals = normalize_quals(&qual_raw, self.enc, seq_raw.len())
            .map_err(AlnError::Config)?;
        let mut codes: Vec<u8> = seq_raw.iter().map(|&b| encode_base(b)).collect();
        let mut quals = quals;
        // 5' then 3' fixed trims
        let t5 = self.trim5.min(codes.len());
        codes.drain(..t5);
        quals.drain(..t5);
        let t3 = self.trim3.min(codes.len());
        codes.truncate(codes.len() - t3);
        quals.truncate(quals.len() - t3);
        let seed = fold_seed(&name, &codes, ordinal);
        let mut rd = Read::from_codes(&name, codes, quals, seed);
        rd.ordinal = ordinal;
        Ok(rd)
    }

    /// Next pair inside the skip/upto window; None when drained.
    pub fn next_pair(&mut self) -> Result<Option<ReadPair>, AlnError> {
        loop {
            let ordinal = self.next_ordinal;
            if ordinal >= self.upto_bound {
                return Ok(None);
            }
            let rec1 = match self.r1.next_record()? {
                Some(r) => r,
                None => return Ok(None),
            };
            let rec2 = match &mut self.r2 {
                Some(r2) => match r2.next_record()? {
                    Some(r) => Some(r),
                    None => {
                        return Err(AlnError::Config(
                            "mate files have unequal record counts".to_string(),
                        ));
                    }
                },
                None => None,
            };
            self.next_ordinal += 1;
            if ordinal < self.skip {
                continue;
            }
            let a = self.build_read(rec1.0, rec1.1, rec1.2, ordinal)?;
            let b = match rec2 {
                Some(r) => Some(self.build_read(r.0, r.1, r.2, ordinal)?),
                None => None,
            };
            return Ok(Some(ReadPair { a, b }));
        }
    }
}
