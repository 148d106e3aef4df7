//! Paged change scans shared by the store implementations.

use std::collections::VecDeque;

use futures::{
    StreamExt,
    stream::{self, BoxStream},
};

use crate::{error::StoreResult, types::Change};

/// One fetched page of a change sequence.
#[derive(Debug, Default)]
pub(crate) struct Page {
    pub(crate) changes: Vec<Change>,
    /// Highest sequence number the page covered, present or not.
    pub(crate) scanned_to: u64,
}

/// Progress of a scan over sequence numbers `(after, head]`.
#[derive(Debug)]
pub(crate) struct ScanState {
    after: u64,
    head: u64,
    buffer: VecDeque<Change>,
    done: bool,
}

impl ScanState {
    pub(crate) fn new(after: u64, head: u64) -> Self {
        Self { after, head, buffer: VecDeque::new(), done: false }
    }
}

/// Turns a page fetcher into a lazy change stream.
///
/// `fetch(after, head)` returns the next page strictly after `after`. The
/// stream ends once `head` is reached, when a page makes no progress, or
/// right after yielding the first error.
pub(crate) fn changes<'a, F, Fut>(state: ScanState, fetch: F) -> BoxStream<'a, StoreResult<Change>>
where
    F: FnMut(u64, u64) -> Fut + Send + 'a,
    Fut: Future<Output = StoreResult<Page>> + Send + 'a,
{
    stream::unfold((state, fetch), |(mut state, mut fetch)| async move {
        loop {
            if let Some(change) = state.buffer.pop_front() {
                return Some((Ok(change), (state, fetch)));
            }
            if state.done || state.after >= state.head {
                return None;
            }
            match fetch(state.after, state.head).await {
                Ok(page) if page.scanned_to <= state.after => return None,
                Ok(page) => {
                    state.after = page.scanned_to;
                    state.buffer.extend(page.changes);
                },
                Err(err) => {
                    state.done = true;
                    return Some((Err(err), (state, fetch)));
                },
            }
        }
    })
    .boxed()
}
