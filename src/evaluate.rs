//! Counterfactual off-policy evaluation: IPS and SNIPS.
//!
//! Consumes a batch of logged bandit records and a target [`Policy`] and
//! estimates the value the target would have realized, without deploying
//! it.  The correction at the heart of both estimators is the importance
//! weight
//!
//! ```text
//! w_e = 1[π(x_e) = a_e] / max(p_e, ε)
//! ```
//!
//! Only events where the target policy reproduces the logged action
//! contribute; clipping at `ε` bounds every weight by `1/ε`, trading a
//! little bias for bounded variance.
//!
//! - **IPS** divides by the number of events `N` — unbiased when the
//!   logged propensities are exact.
//! - **SNIPS** divides by the realized weight sum `Σw` — slightly biased,
//!   materially lower variance when the weight distribution is skewed.
//!
//! Thin support never fails an evaluation: the estimate is reported with
//! `low_support = true` and it is the decision layer's job to refuse to
//! ship on it.  Only malformed records are rejected, and those are skipped
//! and counted per record rather than aborting the batch.

use std::collections::BTreeMap;

use crate::Error;

// ============================================================================
// Logged events and the catalog
// ============================================================================

/// One logged interaction record, as persisted by the logging policy.
///
/// `reward` is present only for the shown action — feedback is selective
/// (missing-not-at-random) by construction.  Records are immutable and
/// append-only; the evaluator treats the batch as a static log.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct LogRecord {
    /// Context identifier (e.g. a user/request key).
    pub context_id: u64,
    /// Context features visible to policies.
    pub context: Vec<f64>,
    /// The action (item id) the logging policy showed.  `None` only occurs
    /// in malformed input.
    pub action: Option<u64>,
    /// Probability the logging policy assigned to `action`; must be in
    /// `(0, 1]`.
    pub propensity: f64,
    /// Observed reward for the shown action, when feedback arrived.
    pub reward: Option<f64>,
    /// Event time, milliseconds since an arbitrary epoch.
    pub timestamp_ms: u64,
}

impl LogRecord {
    /// Validate this record for evaluation.
    ///
    /// Rejects: non-finite or non-positive propensity, propensity above 1,
    /// a reward recorded without a logged action.
    pub fn validate(&self) -> Result<(), Error> {
        if !self.propensity.is_finite() || self.propensity <= 0.0 || self.propensity > 1.0 {
            return Err(Error::MalformedLogRecord {
                context_id: self.context_id,
                reason: format!("propensity {} outside (0, 1]", self.propensity),
            });
        }
        if self.reward.is_some() && self.action.is_none() {
            return Err(Error::MalformedLogRecord {
                context_id: self.context_id,
                reason: "reward present without a logged action".to_string(),
            });
        }
        Ok(())
    }
}

/// The item universe policies choose from: id → feature vector.
///
/// Shared by the generator, target policies and serving; iteration order is
/// stable (`BTreeMap`) so policy argmaxes are reproducible.
#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Catalog {
    items: BTreeMap<u64, Vec<f64>>,
}

impl Catalog {
    /// Build a catalog from (id, features) pairs.  Later duplicates win.
    pub fn new(items: impl IntoIterator<Item = (u64, Vec<f64>)>) -> Self {
        Self {
            items: items.into_iter().collect(),
        }
    }

    /// Features for an item, if present.
    pub fn features(&self, id: u64) -> Option<&[f64]> {
        self.items.get(&id).map(|v| v.as_slice())
    }

    /// Iterate items in stable id order.
    pub fn iter(&self) -> impl Iterator<Item = (u64, &[f64])> + '_ {
        self.items.iter().map(|(id, f)| (*id, f.as_slice()))
    }

    /// Number of items.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the catalog is empty.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

// ============================================================================
// Policies
// ============================================================================

/// A target policy: a pure function from context + catalog to one action.
///
/// Evaluated entities are policies, never raw models.  Implementations must
/// be deterministic given their inputs — the evaluator calls `choose` once
/// per event and two runs over the same log must agree.
pub trait Policy {
    /// Choose an action (item id) for the given context.  `None` means the
    /// policy abstains for this context.
    fn choose(&self, context: &[f64], catalog: &Catalog) -> Option<u64>;

    /// Whether this policy reproduces `record`'s logged action.
    ///
    /// The default compares [`Policy::choose`] against the logged action;
    /// abstention never matches, so an abstaining policy contributes zero
    /// weight rather than inheriting the logging policy's value.
    fn matches(&self, record: &LogRecord, catalog: &Catalog) -> bool {
        match (self.choose(&record.context, catalog), record.action) {
            (Some(target), Some(logged)) => target == logged,
            _ => false,
        }
    }
}

/// Baseline policy: repeat whatever the logging policy showed.
///
/// Represents the current production system; its IPS estimate is a sanity
/// anchor (every well-formed event matches, weights are `1/p`).
///
/// Its choice depends on the event rather than the context, so `choose`
/// abstains and [`Policy::matches`] is overridden to reproduce every
/// logged action.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggedActionPolicy;

impl Policy for LoggedActionPolicy {
    fn choose(&self, _context: &[f64], _catalog: &Catalog) -> Option<u64> {
        None
    }

    fn matches(&self, record: &LogRecord, _catalog: &Catalog) -> bool {
        record.action.is_some()
    }
}

/// Greedy policy over a caller-supplied scoring function.
///
/// The usual adapter for "policy = argmax of a calibrated model score";
/// deterministic tie-break on lower item id via stable catalog order.
pub struct GreedyScorePolicy<F>
where
    F: Fn(&[f64], &[f64]) -> f64,
{
    score: F,
}

impl<F> GreedyScorePolicy<F>
where
    F: Fn(&[f64], &[f64]) -> f64,
{
    /// `score(context, item_features) -> value`; higher wins.
    pub fn new(score: F) -> Self {
        Self { score }
    }
}

impl<F> Policy for GreedyScorePolicy<F>
where
    F: Fn(&[f64], &[f64]) -> f64,
{
    fn choose(&self, context: &[f64], catalog: &Catalog) -> Option<u64> {
        let mut best: Option<(u64, f64)> = None;
        for (id, feats) in catalog.iter() {
            let s = (self.score)(context, feats);
            let replace = match best {
                None => true,
                Some((_, b)) => s > b,
            };
            if replace {
                best = Some((id, s));
            }
        }
        best.map(|(id, _)| id)
    }
}

/// The serving re-ranker, packaged as an evaluable [`Policy`].
///
/// This is the bridge between the two halves of the crate: the evaluator
/// gates exactly the (weights, scorer) configuration the orchestrator would
/// serve.  As an action policy its choice is the ranked list's top-1; use
/// [`RerankPolicy::rank`] when the full list is wanted.
pub struct RerankPolicy<F = fn(&[f64], &[f64]) -> f64>
where
    F: Fn(&[f64], &[f64]) -> f64,
{
    weights: crate::ObjectiveWeights,
    score: F,
}

/// Default calibrated relevance proxy: dot product of context and item
/// features mapped from `[-1, 1]` onto `[0, 1]`.
fn dot_calibrated(context: &[f64], item: &[f64]) -> f64 {
    let n = context.len().min(item.len());
    let dot: f64 = (0..n).map(|i| context[i] * item[i]).sum();
    ((dot + 1.0) / 2.0).clamp(0.0, 1.0)
}

impl RerankPolicy {
    /// Re-rank policy with the default calibrated dot-product relevance.
    pub fn new(weights: crate::ObjectiveWeights) -> Self {
        Self {
            weights,
            score: dot_calibrated,
        }
    }
}

impl<F> RerankPolicy<F>
where
    F: Fn(&[f64], &[f64]) -> f64,
{
    /// Re-rank policy over a caller-supplied calibrated scorer
    /// (`score(context, item_features) -> [0, 1]`).
    pub fn with_scorer(weights: crate::ObjectiveWeights, score: F) -> Self {
        Self { weights, score }
    }

    /// The full ranked list this policy would serve for `context`.
    pub fn rank(&self, context: &[f64], catalog: &Catalog, k: usize) -> crate::RankedList {
        let items: Vec<crate::Item> = catalog
            .iter()
            .map(|(id, feats)| crate::Item {
                id,
                relevance: (self.score)(context, feats).clamp(0.0, 1.0),
                topic: 0,
                creator: 0,
                retention: 0.0,
                features: feats.to_vec(),
            })
            .collect();
        match crate::CandidateSet::new(items) {
            Ok(set) => crate::rerank(&set, &self.weights, k, None).ranked,
            Err(_) => crate::RankedList::default(),
        }
    }
}

impl<F> Policy for RerankPolicy<F>
where
    F: Fn(&[f64], &[f64]) -> f64,
{
    fn choose(&self, context: &[f64], catalog: &Catalog) -> Option<u64> {
        self.rank(context, catalog, 1).top()
    }
}

// ============================================================================
// Configuration and results
// ============================================================================

/// Evaluator configuration.
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct EvalConfig {
    /// Propensity clipping floor ε; bounds every weight by `1/ε`.
    pub epsilon: f64,
    /// Low-support threshold: flag when `ESS < min_ess_fraction · N`.
    pub min_ess_fraction: f64,
    /// Tolerance on the `1/ε` weight bound before flagging low support.
    pub weight_bound_tolerance: f64,
    /// Two-sided normal quantile for confidence intervals (1.96 ≈ 95%).
    pub ci_z: f64,
}

impl Default for EvalConfig {
    fn default() -> Self {
        Self {
            epsilon: 0.01,
            min_ess_fraction: 0.10,
            weight_bound_tolerance: 1e-9,
            ci_z: 1.96,
        }
    }
}

/// Clip a logged propensity to the floor `ε`.
pub fn clip_propensity(p: f64, epsilon: f64) -> f64 {
    p.max(epsilon)
}

/// Point estimates and diagnostics from one evaluation run.
///
/// Derived, read-only output; the low-support flag degrades trust rather
/// than suppressing the estimate.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct EvaluationResult {
    /// IPS point estimate (`Σ w·r / N`).
    pub ips: f64,
    /// SNIPS point estimate (`Σ w·r / Σ w`; 0 when no event matched).
    pub snips: f64,
    /// Sample variance of the per-event weighted reward (IPS scale).
    pub ips_variance: f64,
    /// Normalized-weight variance approximation for SNIPS.
    pub snips_variance: f64,
    /// 95%-style confidence interval around the IPS estimate.
    pub ips_ci: (f64, f64),
    /// Confidence interval around the SNIPS estimate.
    pub snips_ci: (f64, f64),
    /// Effective sample size `(Σw)² / Σw²`.
    pub ess: f64,
    /// Events contributing (valid records), the IPS denominator.
    pub n_events: u64,
    /// Events where the target policy matched the logged action.
    pub n_matched: u64,
    /// Fraction of matched events whose propensity was clipped up to ε.
    pub clip_rate: f64,
    /// Malformed records skipped during ingestion.
    pub n_skipped: u64,
    /// Estimate is reported but unreliable: thin effective support.
    pub low_support: bool,
}

// ============================================================================
// Accumulator (mergeable partial sums)
// ============================================================================

/// Associative partial sums for one evaluation batch.
///
/// Event contributions are idempotent per record and order-independent, so
/// a log can be partitioned, accumulated per partition, and [`merge`]d —
/// failed partitions just re-run.
///
/// [`merge`]: EvalAccumulator::merge
#[derive(Debug, Clone, Copy, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct EvalAccumulator {
    /// Σ w·r over matched events.
    pub sum_wr: f64,
    /// Σ (w·r)² over matched events.
    pub sum_wr_sq: f64,
    /// Σ w²·r over matched events (for the SNIPS variance approximation).
    pub sum_w_sq_r: f64,
    /// Σ w over matched events.
    pub sum_w: f64,
    /// Σ w² over matched events.
    pub sum_w_sq: f64,
    /// Valid events seen (matched or not).
    pub n_events: u64,
    /// Matched events.
    pub n_matched: u64,
    /// Matched events whose raw propensity was below ε.
    pub n_clipped: u64,
    /// Malformed records skipped.
    pub n_skipped: u64,
    /// Max single importance weight observed.
    pub max_weight: f64,
}

impl EvalAccumulator {
    /// Fold one record into the sums.
    ///
    /// `matched` is whether the target policy reproduces this record's
    /// logged action (see [`Policy::matches`]).
    pub fn push(&mut self, record: &LogRecord, matched: bool, cfg: &EvalConfig) {
        if record.validate().is_err() {
            self.n_skipped += 1;
            return;
        }
        self.n_events += 1;

        if !matched || record.action.is_none() {
            return;
        }
        self.n_matched += 1;

        if record.propensity < cfg.epsilon {
            self.n_clipped += 1;
        }
        let w = 1.0 / clip_propensity(record.propensity, cfg.epsilon);
        // Selective feedback: an unmatched reward cannot exist (validated),
        // a matched event without feedback contributes reward 0.
        let r = record.reward.unwrap_or(0.0);
        self.sum_wr += w * r;
        self.sum_wr_sq += (w * r) * (w * r);
        self.sum_w_sq_r += w * w * r;
        self.sum_w += w;
        self.sum_w_sq += w * w;
        if w > self.max_weight {
            self.max_weight = w;
        }
    }

    /// Combine two partition accumulators.  Associative and commutative.
    pub fn merge(&self, other: &Self) -> Self {
        Self {
            sum_wr: self.sum_wr + other.sum_wr,
            sum_wr_sq: self.sum_wr_sq + other.sum_wr_sq,
            sum_w_sq_r: self.sum_w_sq_r + other.sum_w_sq_r,
            sum_w: self.sum_w + other.sum_w,
            sum_w_sq: self.sum_w_sq + other.sum_w_sq,
            n_events: self.n_events + other.n_events,
            n_matched: self.n_matched + other.n_matched,
            n_clipped: self.n_clipped + other.n_clipped,
            n_skipped: self.n_skipped + other.n_skipped,
            max_weight: self.max_weight.max(other.max_weight),
        }
    }

    /// Finalize the sums into estimates and diagnostics.
    pub fn finish(&self, cfg: &EvalConfig) -> EvaluationResult {
        let n = self.n_events as f64;
        let ips = if self.n_events == 0 {
            0.0
        } else {
            self.sum_wr / n
        };
        let snips = if self.sum_w > 0.0 {
            self.sum_wr / self.sum_w
        } else {
            0.0
        };

        // Sample variance of w·r over all N events (zeros included):
        // E[x²] − mean², with Bessel correction when N > 1.
        let ips_variance = if self.n_events > 1 {
            let raw = self.sum_wr_sq / n - ips * ips;
            (raw * n / (n - 1.0)).max(0.0)
        } else {
            0.0
        };
        // Delta-method approximation: Var(SNIPS) ≈ Σ w²·(r − V̂)² / (Σw)²,
        // expanded as Σw²r² − 2·V̂·Σw²r + V̂²·Σw² over the tracked sums.
        let snips_variance = if self.sum_w > 0.0 && self.n_events > 1 {
            let num =
                self.sum_wr_sq - 2.0 * snips * self.sum_w_sq_r + snips * snips * self.sum_w_sq;
            (num / (self.sum_w * self.sum_w)).max(0.0)
        } else {
            0.0
        };

        let ips_half = if self.n_events > 0 {
            cfg.ci_z * (ips_variance / n.max(1.0)).sqrt()
        } else {
            0.0
        };
        let snips_half = cfg.ci_z * snips_variance.sqrt();

        let ess = if self.sum_w_sq > 0.0 {
            (self.sum_w * self.sum_w) / self.sum_w_sq
        } else {
            0.0
        };
        let clip_rate = if self.n_matched > 0 {
            self.n_clipped as f64 / self.n_matched as f64
        } else {
            0.0
        };

        let weight_bound = 1.0 / cfg.epsilon;
        let low_support = self.n_events == 0
            || ess < cfg.min_ess_fraction * n
            || self.max_weight > weight_bound + cfg.weight_bound_tolerance;

        EvaluationResult {
            ips,
            snips,
            ips_variance,
            snips_variance,
            ips_ci: (ips - ips_half, ips + ips_half),
            snips_ci: (snips - snips_half, snips + snips_half),
            ess,
            n_events: self.n_events,
            n_matched: self.n_matched,
            clip_rate,
            n_skipped: self.n_skipped,
            low_support,
        }
    }
}

// ============================================================================
// Batch evaluation
// ============================================================================

/// Evaluate a target policy over a static logged batch.
///
/// Malformed records are skipped and counted ([`EvaluationResult::n_skipped`]);
/// thin support sets [`EvaluationResult::low_support`] instead of failing.
///
/// # Example
///
/// ```rust
/// use rankgate::{evaluate, Catalog, EvalConfig, GreedyScorePolicy, LogRecord};
///
/// let catalog = Catalog::new(vec![(0, vec![0.9]), (1, vec![-0.4])]);
/// let records = vec![LogRecord {
///     context_id: 1,
///     context: vec![1.0],
///     action: Some(0),
///     propensity: 0.1,
///     reward: Some(1.0),
///     timestamp_ms: 0,
/// }];
/// // Policy: prefer positively-scored items for this context.
/// let policy = GreedyScorePolicy::new(|ctx: &[f64], item: &[f64]| ctx[0] * item[0]);
/// let res = evaluate(&catalog, &records, &policy, EvalConfig::default());
/// // Single matching event, propensity 0.1, ε = 0.01 → weight 10, N = 1.
/// assert!((res.ips - 10.0).abs() < 1e-12);
/// ```
pub fn evaluate<P: Policy>(
    catalog: &Catalog,
    records: &[LogRecord],
    policy: &P,
    cfg: EvalConfig,
) -> EvaluationResult {
    let mut acc = EvalAccumulator::default();
    for rec in records {
        acc.push(rec, policy.matches(rec, catalog), &cfg);
    }
    acc.finish(&cfg)
}
