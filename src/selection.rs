use tracing::{debug, info};

use crate::models::CandidateItem;
use crate::TARGET_PIPELINE;

/// A retained candidate with its assigned rank, starting at 1.
#[derive(Debug, Clone)]
pub struct RankedCandidate {
    pub item: CandidateItem,
    pub selection_rank: u32,
}

/// Output of selection: the bounded working set plus the near-miss set.
/// Near-misses are reporting-only and never promoted into downstream work.
#[derive(Debug, Clone)]
pub struct SelectionOutcome {
    pub selected: Vec<RankedCandidate>,
    pub near_misses: Vec<CandidateItem>,
}

/// Bounds the working set to the top-N candidates above a confidence
/// threshold, in stable rank order: confidence descending, ties broken by
/// original discovery order. Identical input and parameters always produce
/// identical output and ranks.
pub fn select(
    candidates: &[CandidateItem],
    threshold: f64,
    max_count: usize,
    near_miss_margin: f64,
) -> SelectionOutcome {
    let mut eligible: Vec<&CandidateItem> = candidates
        .iter()
        .filter(|item| item.confidence >= threshold)
        .collect();

    // Stable sort keeps original order within equal confidences.
    eligible.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let selected: Vec<RankedCandidate> = eligible
        .into_iter()
        .take(max_count)
        .enumerate()
        .map(|(index, item)| RankedCandidate {
            item: item.clone(),
            selection_rank: (index + 1) as u32,
        })
        .collect();

    let near_misses: Vec<CandidateItem> = candidates
        .iter()
        .filter(|item| {
            item.confidence < threshold && item.confidence >= threshold - near_miss_margin
        })
        .cloned()
        .collect();

    info!(
        target: TARGET_PIPELINE,
        "Selected {} of {} candidates (threshold {:.2}, cap {}), {} near-misses",
        selected.len(),
        candidates.len(),
        threshold,
        max_count,
        near_misses.len()
    );
    for ranked in &selected {
        debug!(
            target: TARGET_PIPELINE,
            "Rank {}: {} (confidence {:.2})",
            ranked.selection_rank,
            ranked.item.id,
            ranked.item.confidence
        );
    }

    SelectionOutcome {
        selected,
        near_misses,
    }
}
