//! `rankgate`: deterministic feed-ranking decision core with offline policy gating.
//!
//! Two tightly coupled halves:
//!
//! - An **online path**: a scored candidate set goes through a greedy
//!   multi-objective re-ranker ([`rerank`]) that trades relevance against
//!   diversity and retention under a latency deadline, sequenced by an
//!   orchestrator ([`Orchestrator`]) that degrades gracefully when stages
//!   run long.
//! - An **offline path**: logged bandit feedback ([`LogRecord`]) plus a
//!   candidate [`Policy`] go through a counterfactual evaluator
//!   ([`evaluate`]) producing IPS/SNIPS value estimates with support
//!   diagnostics, which the decision layer ([`ship_decision`]) combines with
//!   guardrails into a ship/no-ship verdict — *before* any online exposure.
//!
//! Both halves reason about the same notion of "policy": a pure function
//! from context + candidates to a ranked list (or a single action, its
//! top-1 collapse).  [`RerankPolicy`] is the bridge: it evaluates the exact
//! re-ranker configuration you would serve.
//!
//! **Goals:**
//! - **Deterministic by default**: same inputs + config + seed → same
//!   ranked list, same estimate, same verdict.
//! - **Degradation over failure**: deadline misses and thin support are
//!   reported as typed notes and flags, never errors.
//! - **Audit-friendly**: every decision carries an envelope explaining why
//!   it happened, serializable behind the `serde` feature.
//! - **Small n**: candidate sets are hundreds of items, not millions.
//!
//! **Non-goals:**
//! - Not a model-training or calibration library (relevance scores arrive
//!   as a black-box calibrated function).
//! - Not a retrieval engine (candidate generation is a trait seam).
//! - No storage, dashboards, or network protocol — this is a library-level
//!   engine invoked by an external serving shell.
//!
//! # Lifecycle
//!
//! ```rust
//! use rankgate::{
//!     evaluate, ship_decision, EvalConfig, LoggedActionPolicy, ObjectiveWeights,
//!     RerankPolicy, ShipConfig, Simulator, SimulatorConfig,
//! };
//!
//! // Offline: generate biased logs with known propensities, evaluate a
//! // candidate policy counterfactually, gate the change.
//! let sim = Simulator::generate(SimulatorConfig::default(), 7);
//! let baseline = evaluate(
//!     &sim.catalog,
//!     &sim.records,
//!     &LoggedActionPolicy,
//!     EvalConfig::default(),
//! );
//! let candidate = evaluate(
//!     &sim.catalog,
//!     &sim.records,
//!     &RerankPolicy::new(ObjectiveWeights::default()),
//!     EvalConfig::default(),
//! );
//! let verdict = ship_decision(&baseline, &candidate, &[], ShipConfig::default());
//! println!("ship = {}", verdict.ship);
//! ```

#![forbid(unsafe_code)]

/// Epsilon used for floating-point tie-breaking in selection scoring.
///
/// This avoids exact equality comparisons on f64 marginal gains and provides
/// a stable threshold across all selection paths (greedy selection,
/// relevance fallback fill).
pub(crate) const TIEBREAK_EPS: f64 = 1e-12;

mod rerank;
pub use rerank::*;

mod evaluate;
pub use evaluate::*;

mod simulate;
pub use simulate::*;

mod serve;
pub use serve::*;

mod decision;
pub use decision::*;

pub const RANKGATE_VERSION: &str = env!("CARGO_PKG_VERSION");

// ============================================================================
// Errors
// ============================================================================

/// Crate-level error taxonomy.
///
/// Only genuinely fatal conditions are errors.  Deadline misses and thin
/// estimator support are *not* here: they surface as
/// [`RerankNote::DeadlineFallback`] and [`EvaluationResult::low_support`]
/// respectively, because the documented response to both is to keep going.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Error {
    /// Candidate set was empty; the caller must supply a default feed.
    #[error("candidate set is empty")]
    EmptyCandidateSet,

    /// Two candidates shared an item id within one request.
    #[error("duplicate item id {0} in candidate set")]
    DuplicateItemId(u64),

    /// A logged record failed validation (non-positive propensity, or a
    /// reward without a logged action).  Fatal for that record only:
    /// batch evaluation skips and counts it.
    #[error("malformed log record (context {context_id}): {reason}")]
    MalformedLogRecord { context_id: u64, reason: String },

    /// The external relevance scorer (or its artifact) is unavailable.
    /// The orchestrator responds with retrieval-order ranking.
    #[error("relevance model unavailable: {0}")]
    ModelUnavailable(String),
}

// ============================================================================
// Core data model
// ============================================================================

/// One scored feed candidate, immutable once scored for a request.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Item {
    /// Identifier, unique within a request.
    pub id: u64,
    /// Calibrated relevance score in `[0, 1]`.
    pub relevance: f64,
    /// Topic / category label.
    pub topic: u32,
    /// Creator identifier.
    pub creator: u32,
    /// Retention-proxy score in `[0, 1]`.
    pub retention: f64,
    /// Feature vector used for pairwise similarity.
    pub features: Vec<f64>,
}

/// Validated, ordered candidate set for one request.
///
/// Invariants established at construction: non-empty, no duplicate item
/// ids.  Created per request and discarded after the response.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CandidateSet {
    items: Vec<Item>,
}

impl CandidateSet {
    /// Validate and wrap a candidate list.
    ///
    /// Returns [`Error::EmptyCandidateSet`] or [`Error::DuplicateItemId`]
    /// on invalid input; both are fatal for the single request.
    pub fn new(items: Vec<Item>) -> Result<Self, Error> {
        if items.is_empty() {
            return Err(Error::EmptyCandidateSet);
        }
        let mut seen = std::collections::BTreeSet::new();
        for it in &items {
            if !seen.insert(it.id) {
                return Err(Error::DuplicateItemId(it.id));
            }
        }
        Ok(Self { items })
    }

    /// Candidates in retrieval order.
    pub fn items(&self) -> &[Item] {
        &self.items
    }

    /// Number of candidates.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the set is empty (never true for a constructed set).
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Final ordered ranking for one request.
///
/// Positions are implicit: `ids[0]` is rank 0.  Length is
/// `min(requested_k, candidate_count)`; every id originates in the input
/// [`CandidateSet`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RankedList {
    /// Item ids in rank order.
    pub ids: Vec<u64>,
}

impl RankedList {
    /// Number of ranked slots.
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// Whether the list is empty.
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// The top-1 item, if any.
    pub fn top(&self) -> Option<u64> {
        self.ids.first().copied()
    }
}

/// Objective weights for the re-ranker's scalarized marginal gain.
///
/// These are externally supplied configuration — cohort- or
/// session-dependent variation is the caller's concern, never hardcoded
/// here.  `Default` matches the weights the reference experiments ran with.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ObjectiveWeights {
    /// α: weight on calibrated relevance.
    pub relevance: f64,
    /// β: weight on the max-similarity diversity penalty.
    pub diversity: f64,
    /// γ: weight on the retention proxy.
    pub retention: f64,
}

impl Default for ObjectiveWeights {
    fn default() -> Self {
        Self {
            relevance: 1.0,
            diversity: 0.3,
            retention: 0.2,
        }
    }
}
