// Output sink.
//
// A tagged sum over record formats with a common surface: emit the
// header once, then records, then finalize. The tab-separated SAM-style
// format is the one concrete variant today. The sink serializes writes
// behind a mutex; records carry no cross-read ordering guarantee.

use std::io::Write;
use std::sync::Mutex;

use crate::index::SeedIndex;

/// SAM flag bits.
pub mod sam_flags {
    pub const PAIRED: u16 = 0x1;
    pub const PROPER_PAIR: u16 = 0x2;
    pub const UNMAPPED: u16 = 0x4;
    pub const MATE_UNMAPPED: u16 = 0x8;
    pub const REVERSE: u16 = 0x10;
    pub const MATE_REVERSE: u16 = 0x20;
    pub const FIRST_IN_PAIR: u16 = 0x40;
    pub const LAST_IN_PAIR: u16 = 0x80;
    pub const SECONDARY: u16 = 0x100;
    pub const QC_FAIL: u16 = 0x200;
}

/// Longest query name emitted; longer names are truncated.
pub const MAX_QNAME: usize = 255;

/// One output record, format-independent.
#[derive(Debug, Clone, Default)]
pub struct OutRecord {
    pub qname: String,
    pub flag: u16,
    /// Reference name, or None for unaligned.
    pub rname: Option<String>,
    /// 1-based leftmost position; 0 for unaligned.
    pub pos: u64,
    pub mapq: u32,
    /// CIGAR ops (op, run); empty renders "*".
    pub cigar: Vec<(u8, u32)>,
    /// Mate reference: None -> "*", Some("=") allowed.
    pub rnext: Option<String>,
    pub pnext: u64,
    pub tlen: i64,
    pub seq: String,
    pub qual: String,
    /// Optional tags, already rendered ("AS:i:-3").
    pub tags: Vec<String>,
}

/// Format selector; add variants here as formats appear.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Sam,
}

/// Shared, lock-guarded sink.
pub struct OutputSink {
    format: OutputFormat,
    writer: Mutex<Box<dyn Write + Send>>,
}

impl OutputSink {
    pub fn new(format: OutputFormat, writer: Box<dyn Write + Send>) -> Self {
        OutputSink {
            format,
            writer: Mutex::new(writer),
        }
    }

    /// Emit the header. Must precede any record.
    pub fn emit_header(&self, idx: &SeedIndex, cmdline: &str) -> std::io::Result<()> {
        match self.format {
            OutputFormat::Sam => {
                let mut w = self.writer.lock().unwrap();
                writeln!(w, "@HD\tVN:1.0\tSO:unsorted")?;
                for ann in idx.anns() {
                    writeln!(w, "@SQ\tSN:{}\tLN:{}", ann.name, ann.len)?;
                }
                writeln!(
                    w,
                    "@PG\tID:{}\tPN:{}\tVN:{}\tCL:{}",
                    env!("CARGO_PKG_NAME"),
                    env!("CARGO_PKG_NAME"),
                    env!("CARGO_PKG_VERSION"),
                    cmdline
                )?;
                Ok(())
            }
        }
    }

    pub fn emit_record(&self, rec: &OutRecord) -> std::io::Result<()> {
        match self.format {
            OutputFormat::Sam => {
                let mut name = rec.qname.as_str();
                if name.len() > MAX_QNAME {
                    name = &name[..MAX_QNAME];
                }
                let cigar = render_cigar(&rec.cigar);
                let mut w = self.writer.lock().unwrap();
                write!(
                    w,
                    "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}",
                    name,
                    rec.flag,
                    rec.rname.as_deref().unwrap_or("*"),
                    rec.pos,
                    rec.mapq,
                    cigar,
                    rec.rnext.as_deref().unwrap_or("*"),
                    rec.pnext,
                    rec.tlen,
                    if rec.seq.is_empty() { "*" } else { &rec.seq },
                    if rec.qual.is_empty() { "*" } else { &rec.qual },
                )?;
                for tag in &rec.tags {
                    write!(w, "\t{}", tag)?;
                }
                writeln!(w)?;
                Ok(())
            }
        }
    }

    /// Flush buffered output.
    pub fn finalize(&self) -> std::io::Result<()> {
        self.writer.lock().unwrap().flush()
    }
}

pub fn render_cigar(cigar: &[(u8, u32)]) -> String {
    if cigar.is_empty() {
        return "*".to_string();
    }
    let mut s = String::new();
    for &(op, run) in cigar {
        s.push_str(&run.to_string());
        s.push(op as char);
    }
    s
}
