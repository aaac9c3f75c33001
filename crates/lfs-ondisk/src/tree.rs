//! Buddy summary trees.
//!
//! A [`SummaryTree`] is the 4-ary tree embedded in every dmap and dmapctl
//! page. Each leaf describes one unit (a bitmap word, or a child page) and
//! holds the log2 size of the largest free buddy run led by that unit; each
//! internal node holds the max of its four children; the root is the largest
//! free buddy anywhere under the page.
//!
//! A free run larger than one unit is recorded only at its *leading* leaf;
//! the trailing leaves hold [`NOFREE`]. [`SummaryTree::split`] carves such a
//! run down when part of it is allocated, [`SummaryTree::join`] re-merges
//! freed buddies (buddy located by XOR of leaf index with the buddy span),
//! and [`SummaryTree::back_split`] reconstructs intermediate split state when
//! an operation lands on a trailing (`NOFREE`) leaf.
//!
//! The tree is stored root-first: node `i`'s children are `4i+1 ..= 4i+4`,
//! leaves occupy the tail of the array starting at `leafidx`.

use lfs_types::{
    CTLLEAFIND, CTLTREESIZE, DBWORD, L2BPERDMAP, L2DBWORD, L2LPERCTL, L2LPERDMAP, LEAFIND,
    LPERCTL, LPERDMAP, NOFREE, ParseError, TREESIZE, read_le_u32,
};
use thiserror::Error;

/// Consistency violations detected while manipulating a summary tree.
///
/// These are "should never happen" conditions: the tree disagrees with
/// itself or with the bitmap it summarizes. Callers convert them into a
/// fatal corruption error; there is no repair strategy.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TreeError {
    #[error("join mismatch at leaf {leafno}: buddy {buddy} holds {buddy_val}, expected {expected}")]
    JoinMismatch {
        leafno: usize,
        buddy: usize,
        buddy_val: i8,
        expected: i8,
    },
    #[error("back split at leaf {leafno} found no covering buddy")]
    BackSplitOverrun { leafno: usize },
    #[error("node {node} promises order {promised} but no child satisfies it")]
    DescentDeadEnd { node: usize, promised: i8 },
}

/// log2 of the largest free (zero) aligned bit run in a bitmap word, or
/// [`NOFREE`] if every bit is set. The most-significant bit of the word is
/// the lowest-numbered block.
#[must_use]
pub fn max_bud_word(word: u32) -> i8 {
    if word == 0 {
        return l2_as_i8(L2DBWORD);
    }
    for l2 in (0..L2DBWORD).rev() {
        let width = 1_u32 << l2;
        let mask = (1_u32 << width) - 1;
        let mut pos = 0_u32;
        while pos < DBWORD {
            if (word >> (DBWORD - pos - width)) & mask == 0 {
                return l2_as_i8(l2);
            }
            pos += width;
        }
    }
    NOFREE
}

fn l2_as_i8(l2: u32) -> i8 {
    // Orders are at most L2BPERDMAP + 2 * L2LPERCTL = 33, well within i8.
    i8::try_from(l2).expect("buddy order fits i8")
}

/// A buddy summary tree (dmap or dmapctl flavor).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SummaryTree {
    nleafs: usize,
    l2nleafs: u32,
    leafidx: usize,
    height: u32,
    budmin: i8,
    stree: Vec<i8>,
}

impl SummaryTree {
    /// Empty (all-`NOFREE`) tree in dmap shape: 256 leaves, one per bitmap
    /// word, minimum buddy order `L2DBWORD`.
    #[must_use]
    pub fn new_dmap() -> Self {
        Self {
            nleafs: LPERDMAP,
            l2nleafs: L2LPERDMAP,
            leafidx: LEAFIND,
            height: 5,
            budmin: l2_as_i8(L2DBWORD),
            stree: vec![NOFREE; TREESIZE],
        }
    }

    /// Empty tree in dmapctl shape for the given control level: 1024 leaves,
    /// one per child page, minimum buddy order `L2BPERDMAP + level * L2LPERCTL`.
    #[must_use]
    pub fn new_ctl(level: u32) -> Self {
        Self {
            nleafs: LPERCTL,
            l2nleafs: L2LPERCTL,
            leafidx: CTLLEAFIND,
            height: 6,
            budmin: l2_as_i8(L2BPERDMAP + level * L2LPERCTL),
            stree: vec![NOFREE; CTLTREESIZE],
        }
    }

    #[must_use]
    pub fn nleafs(&self) -> usize {
        self.nleafs
    }

    /// Minimum buddy order representable by a single leaf.
    #[must_use]
    pub fn budmin(&self) -> i8 {
        self.budmin
    }

    /// Value of leaf `leafno`.
    #[must_use]
    pub fn leaf(&self, leafno: usize) -> i8 {
        self.stree[self.leafidx + leafno]
    }

    /// Largest free buddy order anywhere under this tree.
    #[must_use]
    pub fn root(&self) -> i8 {
        self.stree[0]
    }

    /// Leaves spanned by a buddy of order `size` (`size >= budmin`).
    fn budsize(&self, size: i8) -> usize {
        1_usize << u32::from(u8::try_from(size - self.budmin).expect("size >= budmin"))
    }

    /// Set leaf `leafno` to `newval` and propagate the change rootward.
    ///
    /// Parents are rewritten only while their max actually changes, pruning
    /// redundant writes on the common path.
    pub fn adjust(&mut self, leafno: usize, newval: i8) {
        let mut idx = self.leafidx + leafno;
        if self.stree[idx] == newval {
            return;
        }
        self.stree[idx] = newval;
        while idx > 0 {
            idx = (idx - 1) / 4;
            let base = 4 * idx + 1;
            let max = (base..base + 4)
                .map(|c| self.stree[c])
                .max()
                .expect("internal node has four children");
            if self.stree[idx] == max {
                break;
            }
            self.stree[idx] = max;
        }
    }

    /// Split the buddy led by `leafno` down to order `splitsz`, then set the
    /// leaf to `newval`.
    ///
    /// Each cut frees the upper half at its own (one smaller) order; callers
    /// must ensure `splitsz >= budmin` and `leaf(leafno) != NOFREE`.
    pub fn split(&mut self, leafno: usize, splitsz: i8, newval: i8) {
        if self.leaf(leafno) > self.budmin {
            let mut cursz = self.leaf(leafno) - 1;
            let mut budsz = self.budsize(cursz);
            while cursz >= splitsz {
                self.adjust(leafno ^ budsz, cursz);
                cursz -= 1;
                budsz >>= 1;
            }
        }
        self.adjust(leafno, newval);
    }

    /// Reconstruct split state so that `leafno` leads its own buddy.
    ///
    /// Needed when an operation lands on a trailing (`NOFREE`) leaf of a
    /// larger free buddy: the covering buddy is located by walking aligned
    /// prefixes, then cut in half repeatedly toward `leafno`.
    pub fn back_split(&mut self, leafno: usize) -> Result<(), TreeError> {
        if self.leaf(leafno) != NOFREE {
            return Ok(());
        }

        let mut bsz = 2_usize;
        let mut lead;
        loop {
            lead = leafno & !(bsz - 1);
            if self.leaf(lead) != NOFREE {
                break;
            }
            bsz <<= 1;
            if bsz > self.nleafs {
                return Err(TreeError::BackSplitOverrun { leafno });
            }
        }

        if self.leaf(lead) <= self.budmin
            || lead + self.budsize(self.leaf(lead)) <= leafno
        {
            // The found leaf does not actually cover leafno.
            return Err(TreeError::BackSplitOverrun { leafno });
        }

        while self.leaf(leafno) == NOFREE {
            let size = self.leaf(lead);
            if size <= self.budmin {
                return Err(TreeError::BackSplitOverrun { leafno });
            }
            let half = self.budsize(size - 1);
            let right = lead + half;
            self.adjust(lead, size - 1);
            self.adjust(right, size - 1);
            if leafno >= right {
                lead = right;
            }
        }
        Ok(())
    }

    /// Record `leafno` becoming free at order `newval`, merging with equal
    /// free buddies as far as possible.
    ///
    /// A buddy holding a *larger* value than the join candidate means the
    /// tree no longer describes the bitmap — reported, never patched over.
    pub fn join(&mut self, leafno: usize, newval: i8) -> Result<(), TreeError> {
        let mut leafno = leafno;
        let mut newval = newval;
        if newval >= self.budmin {
            let mut budsz = self.budsize(newval);
            while budsz < self.nleafs {
                let buddy = leafno ^ budsz;
                if newval > self.leaf(buddy) {
                    break;
                }
                if newval < self.leaf(buddy) {
                    return Err(TreeError::JoinMismatch {
                        leafno,
                        buddy,
                        buddy_val: self.leaf(buddy),
                        expected: newval,
                    });
                }

                // The leading leaf absorbs the pair; the other goes NOFREE.
                if leafno < buddy {
                    self.adjust(buddy, NOFREE);
                } else {
                    self.adjust(leafno, NOFREE);
                    leafno = buddy;
                }
                newval += 1;
                budsz <<= 1;
            }
        }
        self.adjust(leafno, newval);
        Ok(())
    }

    /// Value of an arbitrary tree node by array index (root = 0).
    #[must_use]
    pub fn node(&self, idx: usize) -> i8 {
        self.stree[idx]
    }

    /// Find a leaf leading a free buddy of order >= `l2size`.
    ///
    /// Returns `Ok(None)` when the root already rules it out. A node whose
    /// value promises `l2size` but whose children all deny it is a dead end —
    /// the tree is internally inconsistent.
    pub fn find_leaf(&self, l2size: i8) -> Result<Option<usize>, TreeError> {
        self.find_leaf_from(0, l2size)
    }

    /// [`find_leaf`](Self::find_leaf) restricted to the subtree rooted at
    /// array index `node` (allocation-group subtree searches start below the
    /// root).
    pub fn find_leaf_from(&self, node: usize, l2size: i8) -> Result<Option<usize>, TreeError> {
        if self.stree[node] < l2size {
            return Ok(None);
        }
        let mut idx = node;
        while idx < self.leafidx {
            let base = 4 * idx + 1;
            let child = (base..base + 4).find(|&c| self.stree[c] >= l2size);
            match child {
                Some(c) => idx = c,
                None => {
                    return Err(TreeError::DescentDeadEnd {
                        node: idx,
                        promised: l2size,
                    });
                }
            }
        }
        Ok(Some(idx - self.leafidx))
    }

    /// Replace every leaf and rebuild the internal nodes bottom-up.
    pub fn rebuild(&mut self, leaf_values: &[i8]) {
        assert_eq!(leaf_values.len(), self.nleafs, "leaf count mismatch");
        self.stree[self.leafidx..].copy_from_slice(leaf_values);
        for idx in (0..self.leafidx).rev() {
            let base = 4 * idx + 1;
            self.stree[idx] = (base..base + 4)
                .map(|c| self.stree[c])
                .max()
                .expect("internal node has four children");
        }
    }

    /// Merge adjacent fully-free leaves into larger buddies, in place.
    ///
    /// Used when building a tree from scratch off a bitmap: leaves must hold
    /// per-unit max orders first; pairs both holding exactly the current
    /// order combine, the leader taking order + 1 and the trailer `NOFREE`.
    pub fn merge_buddies(leaf_values: &mut [i8], budmin: i8) {
        let mut l2free = budmin;
        let mut span = 1_usize;
        while span * 2 <= leaf_values.len() {
            let mut i = 0;
            while i + span < leaf_values.len() {
                if leaf_values[i] == l2free && leaf_values[i + span] == l2free {
                    leaf_values[i] = l2free + 1;
                    leaf_values[i + span] = NOFREE;
                }
                i += span * 2;
            }
            l2free += 1;
            span *= 2;
        }
    }

    // ── Embedded codec ──────────────────────────────────────────────────────
    //
    // Layout (little-endian):
    //   +0   u32 nleafs
    //   +4   u32 l2nleafs
    //   +8   u32 leafidx
    //   +12  u32 height
    //   +16  i8  budmin
    //   +17  i8  stree[len]
    //
    // `encoded_len` depends on the flavor: 17 + 341 for dmaps, 17 + 1365 for
    // dmapctls.

    /// Bytes this tree occupies inside its page.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        17 + self.stree.len()
    }

    /// Serialize into `out` at `offset`.
    pub fn encode_into(&self, out: &mut [u8], offset: usize) {
        let nleafs = u32::try_from(self.nleafs).expect("nleafs fits u32");
        let leafidx = u32::try_from(self.leafidx).expect("leafidx fits u32");
        out[offset..offset + 4].copy_from_slice(&nleafs.to_le_bytes());
        out[offset + 4..offset + 8].copy_from_slice(&self.l2nleafs.to_le_bytes());
        out[offset + 8..offset + 12].copy_from_slice(&leafidx.to_le_bytes());
        out[offset + 12..offset + 16].copy_from_slice(&self.height.to_le_bytes());
        out[offset + 16] = self.budmin.cast_unsigned();
        for (i, v) in self.stree.iter().enumerate() {
            out[offset + 17 + i] = v.cast_unsigned();
        }
    }

    /// Deserialize a tree of the same flavor as `template` from `data` at
    /// `offset`, validating the stored geometry against the template's.
    pub fn decode_from(
        template: &Self,
        data: &[u8],
        offset: usize,
    ) -> Result<Self, ParseError> {
        let nleafs = read_le_u32(data, offset)? as usize;
        let l2nleafs = read_le_u32(data, offset + 4)?;
        let leafidx = read_le_u32(data, offset + 8)? as usize;
        let height = read_le_u32(data, offset + 12)?;
        if nleafs != template.nleafs
            || l2nleafs != template.l2nleafs
            || leafidx != template.leafidx
            || height != template.height
        {
            return Err(ParseError::InvalidField {
                field: "summary_tree",
                reason: "geometry does not match page flavor",
            });
        }
        let end = offset + 17 + template.stree.len();
        if end > data.len() {
            return Err(ParseError::InsufficientData {
                needed: template.stree.len() + 17,
                offset,
                actual: data.len().saturating_sub(offset),
            });
        }
        let budmin = data[offset + 16].cast_signed();
        if budmin != template.budmin {
            return Err(ParseError::InvalidField {
                field: "budmin",
                reason: "does not match page flavor",
            });
        }
        let stree: Vec<i8> = data[offset + 17..end]
            .iter()
            .map(|b| b.cast_signed())
            .collect();
        Ok(Self {
            nleafs: template.nleafs,
            l2nleafs: template.l2nleafs,
            leafidx: template.leafidx,
            height: template.height,
            budmin: template.budmin,
            stree,
        })
    }
}
