//! # Chain Reorganization
//!
//! Rewrites an overflow chain into a properly sized run of single-page
//! chains and teaches the model the new boundaries.
//!
//! Interactions with concurrent work:
//!
//! - A flush targeting the same chain serializes with us on the head's
//!   exclusive fix. If the flush wins, we block and reorganize the
//!   result afterwards. If we win, the flush's chain fix observes the
//!   model change and falls back to per-key re-routing.
//! - Readers already holding shared fixes on chain pages finish first;
//!   we cannot acquire the exclusive fixes until they do. Readers
//!   arriving later block at the head and then revalidate against the
//!   model.
//!
//! Publication runs back-to-front. Until the head itself is rewritten,
//! a reader walking the old chain still sees a consistent old layout;
//! the new trailing pages only become reachable through model entries
//! whose intervals sit above the old head's entry, and the head rewrite
//! (position 0, done last) is the linearization point.

use eyre::{ensure, Result};
use tracing::{debug, trace};

use crate::storage::page::{self, PageMut, PutResult};
use crate::storage::{FixedFrame, PageId};

use super::chain;
use super::merge::ChainMergeIter;
use super::DbShared;

pub(crate) fn reorganize_chain(shared: &DbShared, head_id: PageId) -> Result<()> {
    // The head's exclusive fix is the arbitration point; a concurrent
    // flush that holds it finishes first, after which the mapping check
    // passes again (a rewritten chain keeps its head page and lower
    // boundary at position 0).
    let chain = loop {
        match chain::fix_overflow_chain(&shared.pool, &shared.model, head_id, true, None)? {
            Some(chain) => break chain,
            None => {
                trace!(page = %head_id, "reorganization retrying chain fix");
                std::thread::yield_now();
            }
        }
    };

    // Scheduled twice: another thread already flattened this chain.
    if chain.len() == 1 {
        chain.unfix_all(false);
        return Ok(());
    }

    let records_per_page = shared
        .options
        .key_hints
        .records_per_page(shared.options.page_size);
    let old_len = chain.len();

    // First pass over the sorted chain: count records and pick the new
    // boundary keys by fixed stride. The chain's own boundaries bracket
    // them; every link inherited the head's interval at creation.
    let (boundaries, record_count, images) = {
        let pages = chain.pages()?;
        let lower = pages[0].lower().to_vec();
        let upper = pages[0].upper().map(|u| u.to_vec());

        let mut boundaries = vec![lower];
        let mut record_count = 0usize;
        for (key, _) in ChainMergeIter::new(&pages) {
            if record_count > 0 && record_count % records_per_page == 0 {
                boundaries.push(key.to_vec());
            }
            record_count += 1;
        }
        let new_len = record_count.div_ceil(records_per_page).max(1);
        ensure!(
            boundaries.len() == new_len,
            "boundary selection produced {} boundaries for {} pages",
            boundaries.len(),
            new_len
        );

        // Second pass: materialize the new page images in memory.
        let page_size = shared.options.page_size;
        let mut images = Vec::with_capacity(new_len);
        for index in 0..new_len {
            let mut image = vec![0u8; page_size];
            let image_upper = if index + 1 < new_len {
                Some(boundaries[index + 1].as_slice())
            } else {
                upper.as_deref()
            };
            page::init(&mut image, &boundaries[index], image_upper, false)?;
            images.push(image);
        }
        let mut index = 0usize;
        for (key, value) in ChainMergeIter::new(&pages) {
            let mut target = PageMut::from_bytes(&mut images[index / records_per_page])?;
            ensure!(
                target.put(key, value)? == PutResult::Done,
                "reorganized record does not fit its new page"
            );
            index += 1;
        }
        (boundaries, record_count, images)
    };

    // Publish back-to-front: positions beyond the old chain get freshly
    // allocated pages, old positions are overwritten in place. Each
    // published page becomes a single-page chain with its own model
    // entry; overwriting position 0 last keeps stalled readers on a
    // consistent old layout until the whole rewrite is visible.
    let new_len = images.len();
    let mut frames: Vec<Option<FixedFrame<'_>>> =
        chain.into_frames().into_iter().map(Some).collect();
    for index in (0..new_len).rev() {
        let mut frame = if index < old_len {
            frames[index].take().expect("old chain frame taken twice")
        } else {
            let id = shared.files.allocate_page()?;
            shared.pool.fix(id, true, true)?
        };
        frame.data_mut().copy_from_slice(&images[index]);
        shared.model.insert(boundaries[index].clone(), frame.page_id());
        frame.unfix(true);
    }
    // A shrinking rewrite leaves surplus old pages unreferenced; they
    // are released untouched.
    for frame in frames.into_iter().flatten() {
        frame.unfix(false);
    }

    debug!(
        page = %head_id,
        old_pages = old_len,
        new_pages = new_len,
        records = record_count,
        "reorganized overflow chain"
    );
    Ok(())
}
