//! Greedy multi-objective re-ranking (MMR-style selection).
//!
//! Given a scored [`CandidateSet`], pick `k` items one at a time by maximal
//! marginal gain:
//!
//! ```text
//! marginal(i) = α·relevance(i) − β·max_{j∈S} sim(i, j) + γ·retention(i)
//! ```
//!
//! where `S` is the already-selected set, `sim` is cosine similarity over
//! the item feature vectors clamped to `[0, 1]`, and the max over an empty
//! `S` is 0.  Ties break by higher relevance, then lower item id — same
//! stats + config always yield the same list.
//!
//! Complexity is `O(k·n)`: after each pick, every unselected candidate only
//! updates its running max similarity against the one newly added item.
//!
//! ## Latency policy
//!
//! The orchestrator passes a deadline; the selection loop checks elapsed
//! time after each step.  On expiry the remaining slots are filled in pure
//! relevance-descending order from the unselected remainder.  Missing the
//! deadline is not acceptable; partial diversity optimization is.  The
//! fallback is reported as [`RerankNote::DeadlineFallback`] — a guardrail
//! signal, never an error.

use std::time::Instant;

use crate::{CandidateSet, ObjectiveWeights, RankedList, TIEBREAK_EPS};

/// Cosine similarity of two feature vectors, clamped to `[0, 1]`.
///
/// Symmetric and bounded; zero-length or zero-norm vectors score 0 so that
/// featureless items never attract a diversity penalty.
pub fn similarity(a: &[f64], b: &[f64]) -> f64 {
    let n = a.len().min(b.len());
    if n == 0 {
        return 0.0;
    }
    let mut dot = 0.0;
    let mut na = 0.0;
    let mut nb = 0.0;
    for i in 0..n {
        dot += a[i] * b[i];
        na += a[i] * a[i];
        nb += b[i] * b[i];
    }
    let denom = na.sqrt() * nb.sqrt();
    if denom <= 0.0 || !denom.is_finite() {
        return 0.0;
    }
    (dot / denom).clamp(0.0, 1.0)
}

/// Typed notes explaining how a re-ranking decision unfolded.
///
/// Notes are intentionally small, typed, and stable.  Prefer adding new
/// variants over changing existing semantics.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum RerankNote {
    /// Full greedy selection completed within the deadline.
    CompletedGreedy,

    /// The deadline expired after `selected` greedy steps; `filled` slots
    /// were completed in pure relevance-descending order.
    DeadlineFallback { selected: usize, filled: usize },

    /// Requested `k` exceeded the candidate count; the list saturates at
    /// the candidate count.
    SaturatedCandidates { requested_k: usize, n: usize },
}

/// One greedy selection step, log-ready.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RerankStep {
    /// Position assigned (0-based).
    pub position: usize,
    /// Item chosen at this position.
    pub chosen: u64,
    /// Marginal gain of the chosen item at selection time.
    pub marginal: f64,
    /// Max similarity of the chosen item against the prior selection.
    pub max_similarity: f64,
}

/// Output of one re-ranking call: the list plus its audit trail.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RerankDecision {
    /// The final ranked list.
    pub ranked: RankedList,
    /// Per-step records for the greedy phase (fallback fills carry no step).
    pub steps: Vec<RerankStep>,
    /// True if the deadline expired and relevance-order fill was used.
    pub fallback_used: bool,
    /// Audit notes describing why this list happened.
    pub notes: Vec<RerankNote>,
    /// The weights used to compute this decision.
    pub weights: ObjectiveWeights,
}

impl RerankDecision {
    /// Sum over selected items of their max similarity to the items chosen
    /// before them — the realized intra-list similarity penalty.
    ///
    /// Used by the β-monotonicity property: increasing the diversity weight
    /// must never increase this total.
    pub fn realized_similarity_penalty(&self) -> f64 {
        self.steps.iter().map(|s| s.max_similarity).sum()
    }
}

/// Re-rank `candidates` into a list of `min(k, n)` items.
///
/// `deadline`, when present, bounds the greedy loop; see the module docs
/// for the fallback semantics.  Pass `None` for offline use (policy
/// evaluation) where only determinism matters.
///
/// # Example
///
/// ```rust
/// use rankgate::{rerank, CandidateSet, Item, ObjectiveWeights};
///
/// let items = vec![
///     Item { id: 1, relevance: 0.9, topic: 1, creator: 0, retention: 0.0, features: vec![1.0, 0.0] },
///     Item { id: 2, relevance: 0.85, topic: 1, creator: 0, retention: 0.0, features: vec![1.0, 0.0] },
///     Item { id: 3, relevance: 0.5, topic: 2, creator: 0, retention: 0.0, features: vec![0.0, 1.0] },
/// ];
/// let cs = CandidateSet::new(items).unwrap();
/// let w = ObjectiveWeights { relevance: 1.0, diversity: 0.5, retention: 0.0 };
/// let d = rerank(&cs, &w, 2, None);
/// assert_eq!(d.ranked.ids, vec![1, 3]); // redundancy pushed item 2 out
/// ```
pub fn rerank(
    candidates: &CandidateSet,
    weights: &ObjectiveWeights,
    k: usize,
    deadline: Option<Instant>,
) -> RerankDecision {
    let items = candidates.items();
    let n = items.len();
    let target = k.min(n);

    let mut notes = Vec::new();
    if k > n {
        notes.push(RerankNote::SaturatedCandidates { requested_k: k, n });
    }

    // Running max similarity of each unselected candidate against the
    // selected set; updated incrementally against the newest pick only.
    let mut max_sim = vec![0.0_f64; n];
    let mut selected = vec![false; n];

    let mut ids = Vec::with_capacity(target);
    let mut steps = Vec::with_capacity(target);
    let mut fallback_used = false;

    while ids.len() < target {
        if let Some(d) = deadline {
            if Instant::now() >= d {
                fallback_used = true;
                break;
            }
        }

        let mut best: Option<usize> = None;
        let mut best_marginal = f64::NEG_INFINITY;
        for (i, it) in items.iter().enumerate() {
            if selected[i] {
                continue;
            }
            let marginal = weights.relevance * it.relevance - weights.diversity * max_sim[i]
                + weights.retention * it.retention;
            let better = marginal > best_marginal + TIEBREAK_EPS
                || ((marginal - best_marginal).abs() <= TIEBREAK_EPS
                    && best.map(|b| beats_tie(it, &items[b])).unwrap_or(true));
            if better {
                best_marginal = marginal;
                best = Some(i);
            }
        }

        // target <= n guarantees an unselected candidate exists.
        let Some(chosen) = best else { break };
        selected[chosen] = true;
        steps.push(RerankStep {
            position: ids.len(),
            chosen: items[chosen].id,
            marginal: best_marginal,
            max_similarity: max_sim[chosen],
        });
        ids.push(items[chosen].id);

        for (i, it) in items.iter().enumerate() {
            if selected[i] {
                continue;
            }
            let s = similarity(&it.features, &items[chosen].features);
            if s > max_sim[i] {
                max_sim[i] = s;
            }
        }
    }

    if fallback_used {
        let greedy = ids.len();
        let mut rest: Vec<&crate::Item> = items
            .iter()
            .enumerate()
            .filter(|(i, _)| !selected[*i])
            .map(|(_, it)| it)
            .collect();
        rest.sort_by(|a, b| {
            b.relevance
                .total_cmp(&a.relevance)
                .then_with(|| a.id.cmp(&b.id))
        });
        let fill = target - greedy;
        ids.extend(rest.iter().take(fill).map(|it| it.id));
        notes.push(RerankNote::DeadlineFallback {
            selected: greedy,
            filled: fill,
        });
    } else {
        notes.push(RerankNote::CompletedGreedy);
    }

    RerankDecision {
        ranked: RankedList { ids },
        steps,
        fallback_used,
        notes,
        weights: *weights,
    }
}

/// Tie order within `TIEBREAK_EPS` of marginal gain: higher relevance wins,
/// then lower item id.
fn beats_tie(a: &crate::Item, b: &crate::Item) -> bool {
    if (a.relevance - b.relevance).abs() > TIEBREAK_EPS {
        a.relevance > b.relevance
    } else {
        a.id < b.id
    }
}
