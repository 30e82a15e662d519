//! Response Aggregator - reassembles per-backend results in request order

use multinet_core::{BackendRef, BackendResult, Entry, EntryError, MultinetResponse, ResponseEntry};
use tracing::warn;

use crate::router::RequestBatch;

/// Raw result of one backend batch, ready for merging
pub struct BatchOutcome {
    pub backend: BackendRef,
    /// Request positions per item, as produced by the router
    pub positions: Vec<Vec<usize>>,
    pub result: BackendResult<Vec<ResponseEntry>>,
}

impl BatchOutcome {
    pub fn new<T>(batch: &RequestBatch<T>, result: BackendResult<Vec<ResponseEntry>>) -> Self {
        Self {
            backend: batch.backend_ref().clone(),
            positions: batch.positions.clone(),
            result,
        }
    }
}

/// Merge backend outcomes into one response with exactly one result per
/// requested entry, in request order.
///
/// A whole-batch error is copied to every entry of that batch. A backend
/// returning too few results has the missing positions reported as
/// device errors.
pub fn merge(
    order: &[Entry],
    outcomes: Vec<BatchOutcome>,
    unroutable: Vec<(usize, EntryError)>,
) -> MultinetResponse {
    let mut slots: Vec<Option<ResponseEntry>> = vec![None; order.len()];

    for (position, err) in unroutable {
        if let Some(slot) = slots.get_mut(position) {
            *slot = Some(ResponseEntry::Error(err));
        }
    }

    for outcome in outcomes {
        match outcome.result {
            Ok(results) => {
                if results.len() != outcome.positions.len() {
                    warn!(
                        backend = %outcome.backend,
                        expected = outcome.positions.len(),
                        actual = results.len(),
                        "Backend returned misaligned results"
                    );
                }
                let mut results = results.into_iter();
                for positions in &outcome.positions {
                    let response = results.next().unwrap_or_else(|| {
                        ResponseEntry::Error(EntryError::device(
                            None,
                            format!(
                                "Backend '{}' returned too few results",
                                outcome.backend
                            ),
                        ))
                    });
                    fill(&mut slots, positions, response);
                }
            }
            Err(err) => {
                let response = ResponseEntry::Error(EntryError::from(&err));
                for positions in &outcome.positions {
                    fill(&mut slots, positions, response.clone());
                }
            }
        }
    }

    order
        .iter()
        .cloned()
        .zip(slots)
        .map(|(entry, slot)| {
            let response = slot.unwrap_or_else(|| {
                ResponseEntry::Error(EntryError::device(None, "No result for entry"))
            });
            (entry, response)
        })
        .collect()
}

fn fill(slots: &mut [Option<ResponseEntry>], positions: &[usize], response: ResponseEntry) {
    for &position in positions {
        if let Some(slot) = slots.get_mut(position) {
            *slot = Some(response.clone());
        }
    }
}
