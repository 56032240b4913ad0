// Paired-end policy.
//
// Decides whether two mate alignments form a concordant pair, and
// projects the window an unaligned mate must land in given an aligned
// anchor. Orientations follow the usual naming: FR means the upstream
// mate aligns forward and the downstream mate reverse-complement.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairOrientation {
    Ff,
    Fr,
    Rf,
    Rr,
}

/// One mate's placement, as the policy sees it.
#[derive(Debug, Clone, Copy)]
pub struct MateSpan {
    pub ref_id: usize,
    /// Leftmost reference position.
    pub start: i64,
    /// One past the rightmost reference position.
    pub end: i64,
    pub fw: bool,
}

#[derive(Debug, Clone)]
pub struct PairedEndPolicy {
    pub orient: PairOrientation,
    pub min_frag: i64,
    pub max_frag: i64,
    pub local: bool,
    /// Accept pairs whose mates appear in swapped upstream/downstream
    /// order relative to the policy.
    pub flipped_ok: bool,
    /// Accept mates extending past each other's far ends.
    pub dovetail_ok: bool,
    /// Accept one mate's span containing the other's.
    pub contain_ok: bool,
    /// Accept overlapping mates.
    pub overlap_ok: bool,
    /// Grow the rescue window to the fragment limit rather than the
    /// mate length.
    pub expand_to_frag: bool,
}

impl Default for PairedEndPolicy {
    fn default() -> Self {
        PairedEndPolicy {
            orient: PairOrientation::Fr,
            min_frag: 0,
            max_frag: 500,
            local: false,
            flipped_ok: false,
            dovetail_ok: false,
            contain_ok: true,
            overlap_ok: true,
            expand_to_frag: true,
        }
    }
}

impl PairedEndPolicy {
    /// Fragment length implied by two placements: outermost extent.
    pub fn fragment_len(m1: &MateSpan, m2: &MateSpan) -> i64 {
        m1.end.max(m2.end) - m1.start.min(m2.start)
    }

    /// True when the two mates form a concordant pair under this
    /// policy. `m1` is mate 1, `m2` is mate 2.
    pub fn concordant(&self, m1: &MateSpan, m2: &MateSpan) -> bool {
        if m1.ref_id != m2.ref_id {
            return false;
        }
        let frag = Self::fragment_len(m1, m2);
        if frag < self.min_frag || frag > self.max_frag {
            return false;
        }

        // Assign upstream/downstream roles from the strand pattern.
        // For FR the forward mate plays upstream; for FF the strand of
        // the pair decides which mate number leads.
        let (up, dn) = match self.orient {
            PairOrientation::Fr => match (m1.fw, m2.fw) {
                (true, false) => (m1, m2),
                (false, true) => (m2, m1),
                _ => return false,
            },
            PairOrientation::Rf => match (m1.fw, m2.fw) {
                (false, true) => (m1, m2),
                (true, false) => (m2, m1),
                _ => return false,
            },
            PairOrientation::Ff => match (m1.fw, m2.fw) {
                (true, true) => (m1, m2),
                (false, false) => (m2, m1),
                _ => return false,
            },
            PairOrientation::Rr => match (m1.fw, m2.fw) {
                (false, false) => (m1, m2),
                (true, true) => (m2, m1),
                _ => return false,
            },
        };

        let contained =
            (up.start <= dn.start && dn.end <= up.end) || (dn.start <= up.start && up.end <= dn.end);
        if contained {
            return self.contain_ok;
        }
        let overlap = up.start < dn.end && dn.start < up.end;
        if overlap && !self.overlap_ok {
            return false;
        }

        // The upstream role must actually sit upstream; raggedness past
        // either end is dovetailing, a wholesale swap is a flipped pair.
        let proper_order = up.start <= dn.start && up.end <= dn.end;
        if proper_order {
            return true;
        }
        let fully_flipped = dn.start <= up.start && dn.end <= up.end;
        if fully_flipped && self.flipped_ok {
            return true;
        }
        self.dovetail_ok
    }

    /// Expected strand of the opposite mate given the anchor's strand.
    pub fn expected_mate_fw(&self, anchor_fw: bool) -> bool {
        match self.orient {
            PairOrientation::Fr | PairOrientation::Rf => !anchor_fw,
            PairOrientation::Ff | PairOrientation::Rr => anchor_fw,
        }
    }

    /// Reference window the opposite mate must fall in, given an
    /// aligned anchor. Returns (window start, window end) in reference
    /// coordinates; the window covers every placement whose implied
    /// fragment length is within bounds.
    pub fn mate_window(&self, anchor: &MateSpan, mate_len: i64) -> (i64, i64) {
        // Downstream iff the anchor plays the upstream role
        let anchor_upstream = match self.orient {
            PairOrientation::Fr => anchor.fw,
            PairOrientation::Rf => !anchor.fw,
            // same-strand policies: use strand to orient the pair
            PairOrientation::Ff => anchor.fw,
            PairOrientation::Rr => !anchor.fw,
        };
        let grow = if self.expand_to_frag {
            self.max_frag
        } else {
            mate_len.max(1)
        };
        if anchor_upstream {
            // fragment measured from the anchor's start to the mate's end
            let lo = anchor.start + self.min_frag - mate_len;
            let hi = anchor.start + grow.max(self.min_frag);
            (lo, hi)
        } else {
            let lo = anchor.end - grow.max(self.min_frag);
            let hi = anchor.end - self.min_frag + mate_len;
            (lo, hi)
        }
    }
}
