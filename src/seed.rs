// Seed templates and instantiation.
//
// A template is (offset, length, allowed mismatches). Instantiation
// tiles the template along the read at the configured interval and
// yields one concrete query per surviving position and orientation.

use crate::metrics::SeedSearchMetrics;
use crate::read::{Orientation, Read};

#[derive(Debug, Clone, Copy)]
pub struct SeedTemplate {
    /// Shift added to every tiled position.
    pub offset: usize,
    /// Seed length in bases.
    pub len: usize,
    /// Allowed mismatches during the index descent: 0, 1 or 2.
    pub mms: u8,
}

impl SeedTemplate {
    pub fn new(len: usize, mms: u8) -> Self {
        SeedTemplate { offset: 0, len, mms }
    }

    /// Configuration-time validation: the mismatch budget must fit the
    /// template and the descent supports at most 2 mismatches.
    pub fn validate(&self) -> Result<(), String> {
        if self.len == 0 {
            return Err("Seed length must be positive".to_string());
        }
        if self.mms as usize > self.len {
            return Err(format!(
                "Seed allows {} mismatches but is only {} bases long",
                self.mms, self.len
            ));
        }
        if self.mms > 2 {
            return Err(format!("At most 2 seed mismatches supported, got {}", self.mms));
        }
        Ok(())
    }
}

/// A concrete seed: a substring of one orientation of the read.
#[derive(Debug, Clone)]
pub struct InstantiatedSeed {
    pub template_idx: usize,
    /// Offset from the 5' end of the oriented read.
    pub read_off: usize,
    pub orient: Orientation,
    /// Base codes of the query substring (may contain N).
    pub query: Vec<u8>,
    pub mms: u8,
}

/// Tile `templates` along the read at `interval`, producing seeds for
/// each orientation not suppressed by `nofw`/`norc`.
///
/// Returns the instantiated seeds plus (n_fw, n_rc). A read no longer
/// than the template yields nothing for that template.
pub fn instantiate_seeds(
    read: &Read,
    templates: &[SeedTemplate],
    interval: usize,
    nofw: bool,
    norc: bool,
    met: &mut SeedSearchMetrics,
) -> (Vec<InstantiatedSeed>, usize, usize) {
    debug_assert!(interval >= 1);
    let mut out = Vec::new();
    let mut n_fw = 0usize;
    let mut n_rc = 0usize;
    let rdlen = read.len();
    for (ti, tpl) in templates.iter().enumerate() {
        if rdlen <= tpl.len {
            continue;
        }
        let mut pos = tpl.offset;
        while pos + tpl.len <= rdlen {
            for orient in [Orientation::Fw, Orientation::Rc] {
                if (orient.is_fw() && nofw) || (!orient.is_fw() && norc) {
                    continue;
                }
                let src = read.seq_for(orient);
                let query = src[pos..pos + tpl.len].to_vec();
                if orient.is_fw() {
                    n_fw += 1;
                } else {
                    n_rc += 1;
                }
                out.push(InstantiatedSeed {
                    template_idx: ti,
                    read_off: pos,
                    orient,
                    query,
                    mms: tpl.mms,
                });
            }
            pos += interval;
        }
    }
    met.seeds_instantiated += out.len() as u64;
    (out, n_fw, n_rc)
}
