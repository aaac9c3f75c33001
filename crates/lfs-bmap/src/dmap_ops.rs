//! Bit-level dmap mutations.
//!
//! These operate on a single decoded [`DmapPage`]: flip working-map bits and
//! keep the embedded summary tree exact (invariant: every node equals the
//! true max free buddy order of its subtree), or flip persistent-map bits
//! with no tree at all. Callers own page locking, control-tree propagation,
//! and counter accounting.
//!
//! Every disagreement between the request, the bitmap, and the tree is an
//! error here — never patched over. The owner converts these into fatal
//! corruption reports.

use lfs_ondisk::dmap::{ONES, word_mask};
use lfs_ondisk::{DmapPage, TreeError, max_bud_word};
use lfs_types::{DBWORD, L2DBWORD, L2LPERDMAP, NOFREE};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub(crate) enum BitsError {
    #[error("{0}")]
    State(String),
    #[error(transparent)]
    Tree(#[from] TreeError),
}

pub(crate) type BitsResult<T> = std::result::Result<T, BitsError>;

/// First-fit bit offset of a free run of `1 << l2nb` bits within `word`
/// (MSB-first), or `None` when no such run exists.
pub(crate) fn find_bits(word: u32, l2nb: u32) -> Option<u32> {
    debug_assert!(l2nb < L2DBWORD);
    let nb = 1_u32 << l2nb;
    let mut mask = word_mask(0, nb);
    let mut bitno = 0_u32;
    while mask != 0 {
        if mask & !word == mask {
            return Some(bitno);
        }
        mask >>= 1;
        bitno += 1;
    }
    None
}

fn range_in_dmap(dp: &DmapPage, blkno: u64, nblocks: u64) -> BitsResult<u32> {
    let off = blkno
        .checked_sub(dp.start.0)
        .ok_or_else(|| BitsError::State(format!("block {blkno} precedes dmap start")))?;
    let end = off
        .checked_add(nblocks)
        .ok_or_else(|| BitsError::State("block range overflow".to_owned()))?;
    if end > u64::from(dp.nblocks) {
        return Err(BitsError::State(format!(
            "range {blkno}+{nblocks} exceeds dmap of {} blocks",
            dp.nblocks
        )));
    }
    u32::try_from(off).map_err(|_| BitsError::State("dmap offset overflow".to_owned()))
}

fn floor_log2(n: u32) -> u32 {
    debug_assert!(n >= 1);
    31 - n.leading_zeros()
}

/// Largest buddy order (in words, log2) that an aligned run starting at word
/// `w` with `left` words can carry.
fn run_order(w: usize, left: u32) -> u32 {
    let align = if w == 0 {
        L2LPERDMAP
    } else {
        w.trailing_zeros().min(L2LPERDMAP)
    };
    align.min(floor_log2(left))
}

/// Allocate `nblocks` working-map bits at absolute block `blkno`.
///
/// Splits the summary tree so the allocated run is isolated and every freed
/// split half is recorded at its own order. Fails if any target bit is
/// already set or the tree disagrees with the bitmap.
pub(crate) fn alloc_bits(dp: &mut DmapPage, blkno: u64, nblocks: u64) -> BitsResult<()> {
    let budmin = dp.tree.budmin();
    let mut dbitno = range_in_dmap(dp, blkno, nblocks)?;
    let mut rem = u32::try_from(nblocks).map_err(|_| {
        BitsError::State("single-dmap allocation exceeds u32 blocks".to_owned())
    })?;

    while rem > 0 {
        let word = (dbitno >> L2DBWORD) as usize;
        let wbit = dbitno & (DBWORD - 1);
        let nb = rem.min(DBWORD - wbit);

        if nb < DBWORD {
            // Partial word: mask the bits, then re-derive the leaf from the
            // word contents (splitting any covering buddy down first).
            let mask = word_mask(wbit, nb);
            if dp.wmap[word] & mask != 0 {
                return Err(BitsError::State(format!(
                    "allocating already-allocated blocks at {blkno} (word {word})"
                )));
            }
            dp.wmap[word] |= mask;
            if dp.tree.leaf(word) == NOFREE {
                dp.tree.back_split(word)?;
            }
            dp.tree.split(word, budmin, max_bud_word(dp.wmap[word]));
            dbitno += nb;
            rem -= nb;
        } else {
            // One or more whole words: fill them, then retire the covering
            // buddies run by aligned run.
            let nwords = (rem >> L2DBWORD) as usize;
            for w in word..word + nwords {
                if dp.wmap[w] != 0 {
                    return Err(BitsError::State(format!(
                        "allocating already-allocated blocks at {blkno} (word {w})"
                    )));
                }
                dp.wmap[w] = ONES;
            }

            let mut w = word;
            let mut left = u32::try_from(nwords).expect("word count fits u32");
            while left > 0 {
                if dp.tree.leaf(w) == NOFREE {
                    dp.tree.back_split(w)?;
                }
                let k = run_order(w, left);
                let size = i8::try_from(k + L2DBWORD).expect("order fits i8");
                if dp.tree.leaf(w) < size {
                    return Err(BitsError::State(format!(
                        "summary tree order {} at word {w} below free run order {size}",
                        dp.tree.leaf(w)
                    )));
                }
                dp.tree.split(w, size, NOFREE);
                w += 1 << k;
                left -= 1 << k;
            }

            let bits = u32::try_from(nwords).expect("word count fits u32") << L2DBWORD;
            dbitno += bits;
            rem -= bits;
        }
    }

    dp.nfree -= u32::try_from(nblocks).expect("checked above");
    Ok(())
}

/// Free `nblocks` working-map bits at absolute block `blkno`, joining freed
/// runs with their buddies (buddy found via XOR of leaf index with the buddy
/// span) as far as orders match.
pub(crate) fn free_bits(dp: &mut DmapPage, blkno: u64, nblocks: u64) -> BitsResult<()> {
    let mut dbitno = range_in_dmap(dp, blkno, nblocks)?;
    let mut rem = u32::try_from(nblocks)
        .map_err(|_| BitsError::State("single-dmap free exceeds u32 blocks".to_owned()))?;

    while rem > 0 {
        let word = (dbitno >> L2DBWORD) as usize;
        let wbit = dbitno & (DBWORD - 1);
        let nb = rem.min(DBWORD - wbit);

        if nb < DBWORD {
            let mask = word_mask(wbit, nb);
            if dp.wmap[word] & mask != mask {
                return Err(BitsError::State(format!(
                    "freeing not-allocated blocks at {blkno} (word {word})"
                )));
            }
            dp.wmap[word] &= !mask;
            dp.tree.join(word, max_bud_word(dp.wmap[word]))?;
            dbitno += nb;
            rem -= nb;
        } else {
            let nwords = (rem >> L2DBWORD) as usize;
            for w in word..word + nwords {
                if dp.wmap[w] != ONES {
                    return Err(BitsError::State(format!(
                        "freeing not-allocated blocks at {blkno} (word {w})"
                    )));
                }
                dp.wmap[w] = 0;
            }

            let mut w = word;
            let mut left = u32::try_from(nwords).expect("word count fits u32");
            while left > 0 {
                let k = run_order(w, left);
                let size = i8::try_from(k + L2DBWORD).expect("order fits i8");
                dp.tree.join(w, size)?;
                w += 1 << k;
                left -= 1 << k;
            }

            let bits = u32::try_from(nwords).expect("word count fits u32") << L2DBWORD;
            dbitno += bits;
            rem -= bits;
        }
    }

    dp.nfree += u32::try_from(nblocks).expect("checked above");
    Ok(())
}

/// Flip persistent-map bits for a durable delta. The summary tree describes
/// the working map only and is untouched here.
pub(crate) fn update_pmap(dp: &mut DmapPage, set: bool, blkno: u64, nblocks: u64) -> BitsResult<()> {
    let mut dbitno = range_in_dmap(dp, blkno, nblocks)?;
    let mut rem = u32::try_from(nblocks)
        .map_err(|_| BitsError::State("single-dmap pmap update exceeds u32 blocks".to_owned()))?;

    while rem > 0 {
        let word = (dbitno >> L2DBWORD) as usize;
        let wbit = dbitno & (DBWORD - 1);
        let nb = rem.min(DBWORD - wbit);
        let mask = word_mask(wbit, nb);

        if set {
            if dp.pmap[word] & mask != 0 {
                return Err(BitsError::State(format!(
                    "persistent map already records blocks at {blkno} (word {word})"
                )));
            }
            dp.pmap[word] |= mask;
        } else {
            if dp.pmap[word] & mask != mask {
                return Err(BitsError::State(format!(
                    "persistent map does not record blocks at {blkno} (word {word})"
                )));
            }
            dp.pmap[word] &= !mask;
        }
        dbitno += nb;
        rem -= nb;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use lfs_types::{BPERDMAP, BlockAddr};

    fn full_dmap() -> DmapPage {
        DmapPage::format(BlockAddr(0), u32::try_from(BPERDMAP).expect("fits"))
    }

    #[test]
    fn find_bits_first_fit() {
        assert_eq!(find_bits(0, 0), Some(0));
        assert_eq!(find_bits(0, 4), Some(0));
        // First 4 blocks taken: an 8-bit run first fits at bit 4.
        assert_eq!(find_bits(0xF000_0000, 3), Some(4));
        // Only a trailing bit free.
        assert_eq!(find_bits(!1_u32, 0), Some(31));
        assert_eq!(find_bits(ONES, 0), None);
        // 16 free bits exist but no aligned-scan run of 32.
        assert_eq!(find_bits(0x0000_FFFF, 4), Some(0));
    }

    #[test]
    fn alloc_within_one_word_updates_leaf() {
        let mut dp = full_dmap();
        alloc_bits(&mut dp, 3, 4).expect("alloc");
        assert_eq!(dp.nfree, 8188);
        assert_eq!(dp.wmap[0], word_mask(3, 4));
        // Word 0 now partially allocated: leaf re-derived from contents.
        assert_eq!(dp.tree.leaf(0), max_bud_word(dp.wmap[0]));
        // Tree matches a from-scratch rebuild.
        assert_eq!(dp.recompute_tree(), dp.tree);
    }

    #[test]
    fn alloc_whole_words_marks_nofree() {
        let mut dp = full_dmap();
        alloc_bits(&mut dp, 64, 128).expect("alloc 4 words");
        assert_eq!(dp.nfree, 8064);
        assert!(dp.wmap[2..6].iter().all(|&w| w == ONES));
        for w in 2..6 {
            assert_eq!(dp.tree.leaf(w), NOFREE, "word {w}");
        }
        assert_eq!(dp.recompute_tree(), dp.tree);
    }

    #[test]
    fn alloc_spanning_partial_and_full_words() {
        let mut dp = full_dmap();
        // 16 bits of word 0, all of words 1-2, 8 bits of word 3.
        alloc_bits(&mut dp, 16, 88).expect("alloc");
        assert_eq!(dp.nfree, 8192 - 88);
        assert_eq!(dp.wmap[0], word_mask(16, 16));
        assert_eq!(dp.wmap[1], ONES);
        assert_eq!(dp.wmap[2], ONES);
        assert_eq!(dp.wmap[3], word_mask(0, 8));
        assert_eq!(dp.recompute_tree(), dp.tree);
    }

    #[test]
    fn double_alloc_is_rejected() {
        let mut dp = full_dmap();
        alloc_bits(&mut dp, 0, 32).expect("first");
        let err = alloc_bits(&mut dp, 16, 32).expect_err("overlap");
        assert!(matches!(err, BitsError::State(_)));
    }

    #[test]
    fn free_rejoins_buddies_to_prior_state() {
        let mut dp = full_dmap();
        let pristine = dp.tree.clone();

        alloc_bits(&mut dp, 256, 512).expect("alloc");
        free_bits(&mut dp, 256, 512).expect("free");

        assert_eq!(dp.nfree, 8192);
        assert!(dp.wmap.iter().all(|&w| w == 0));
        // Incremental split/join returned the tree to its pristine shape.
        assert_eq!(dp.tree, pristine);
    }

    #[test]
    fn interleaved_split_join_matches_recompute() {
        let mut dp = full_dmap();
        alloc_bits(&mut dp, 0, 100).expect("a");
        alloc_bits(&mut dp, 4096, 2048).expect("b");
        free_bits(&mut dp, 0, 100).expect("free a");
        alloc_bits(&mut dp, 200, 37).expect("c");
        free_bits(&mut dp, 4096, 2048).expect("free b");
        free_bits(&mut dp, 200, 37).expect("free c");

        assert_eq!(dp.nfree, 8192);
        assert_eq!(dp.recompute_tree(), dp.tree);
        assert_eq!(dp.tree, full_dmap().tree);
    }

    #[test]
    fn free_of_free_blocks_is_rejected() {
        let mut dp = full_dmap();
        let err = free_bits(&mut dp, 0, 8).expect_err("nothing allocated");
        assert!(matches!(err, BitsError::State(_)));
    }

    #[test]
    fn pmap_updates_are_independent_of_tree() {
        let mut dp = full_dmap();
        let tree_before = dp.tree.clone();
        update_pmap(&mut dp, true, 100, 50).expect("set");
        assert_eq!(dp.tree, tree_before);
        assert!(dp.pmap[3] != 0);
        assert!(dp.wmap.iter().all(|&w| w == 0));

        assert!(update_pmap(&mut dp, true, 100, 1).is_err());
        update_pmap(&mut dp, false, 100, 50).expect("clear");
        assert!(dp.pmap.iter().all(|&w| w == 0));
        assert!(update_pmap(&mut dp, false, 100, 1).is_err());
    }

    #[test]
    fn range_validation() {
        let mut dp = DmapPage::format(BlockAddr(8192), 100);
        assert!(alloc_bits(&mut dp, 0, 8).is_err()); // precedes start
        assert!(alloc_bits(&mut dp, 8192 + 96, 8).is_err()); // past nblocks
        alloc_bits(&mut dp, 8192, 100).expect("whole short dmap");
        assert_eq!(dp.nfree, 0);
    }

    #[test]
    fn alloc_from_trailing_word_back_splits() {
        let mut dp = full_dmap();
        // Word 5 is a trailing member of the order-13 buddy; allocating
        // there first exercises the back split.
        alloc_bits(&mut dp, 5 * 32 + 7, 3).expect("mid-buddy alloc");
        assert_eq!(dp.wmap[5], word_mask(7, 3));
        assert_eq!(dp.recompute_tree(), dp.tree);

        free_bits(&mut dp, 5 * 32 + 7, 3).expect("free");
        assert_eq!(dp.tree, full_dmap().tree);
    }
}
