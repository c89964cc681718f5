//! Serving orchestrator: retrieve → score → re-rank under one budget.
//!
//! The orchestrator owns no model logic.  Candidate retrieval, relevance
//! scoring and retention estimation are trait seams so callers (and tests)
//! substitute doubles without touching global state.  What it does own is
//! the clock: cumulative elapsed time is tracked against a total request
//! budget, and whatever remains when the re-ranker starts becomes the
//! re-ranker's deadline.
//!
//! Degradation ladder, preferred top to bottom:
//!
//! 1. Everything on time → full greedy re-ranking.
//! 2. Scoring ran long → skip retention enrichment (stale-but-fast values)
//!    before invoking the re-ranker.
//! 3. Re-rank deadline expires mid-selection → pure-relevance fill for the
//!    remaining slots ([`RerankNote::DeadlineFallback`]).
//! 4. Scorer unavailable → retrieval-order ranking, no crash.
//!
//! Every rung is a recorded guardrail breach (atomic counter, safe across a
//! worker pool of independent requests) plus a typed [`ServeNote`], never
//! an error.  Cancellation is deadline-based: once the budget is spent the
//! orchestrator commits to the fallback path — it does not retry slow
//! stages.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;

use crate::{rerank, CandidateSet, Error, Item, ObjectiveWeights, RankedList, RerankNote};

// ============================================================================
// External seams
// ============================================================================

/// Per-request context handed to every stage.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RequestContext {
    /// Requesting user.
    pub user_id: u64,
    /// Context feature vector (visible to scorers).
    pub features: Vec<f64>,
}

/// An unscored candidate as produced by external retrieval.
///
/// `cached_retention` is the stale-but-fast retention value reused when
/// enrichment is skipped under latency pressure.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Candidate {
    pub id: u64,
    pub topic: u32,
    pub creator: u32,
    pub features: Vec<f64>,
    pub cached_retention: f64,
}

/// External candidate retrieval (ANN / heuristic recall, deduplicated
/// upstream).  Returns a bounded set in retrieval order.
pub trait CandidateSource {
    fn retrieve(&self, ctx: &RequestContext) -> Result<Vec<Candidate>, Error>;
}

/// External calibrated relevance model: deterministic given inputs, output
/// in `[0, 1]`.
pub trait RelevanceScorer {
    fn score(&self, ctx: &RequestContext, item_features: &[f64]) -> Result<f64, Error>;
}

/// Optional retention enrichment, recomputed per request when the budget
/// allows.
pub trait RetentionModel {
    fn retention(&self, ctx: &RequestContext, candidate: &Candidate) -> f64;
}

/// No-op retention model for deployments without enrichment.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRetentionModel;

impl RetentionModel for NoRetentionModel {
    fn retention(&self, _ctx: &RequestContext, candidate: &Candidate) -> f64 {
        candidate.cached_retention
    }
}

// ============================================================================
// Model snapshot handle
// ============================================================================

/// Load-once, atomically-reloadable scorer snapshot.
///
/// The artifact is immutable after load; many in-flight requests read it
/// unsynchronized.  [`ScorerHandle::reload`] establishes a *new* immutable
/// snapshot and switches readers over atomically — it never mutates in
/// place, so readers holding the old `Arc` finish on the old model.
#[derive(Debug)]
pub struct ScorerHandle<S> {
    inner: ArcSwap<S>,
}

impl<S: RelevanceScorer> ScorerHandle<S> {
    /// Wrap an initial scorer artifact.
    pub fn new(scorer: S) -> Self {
        Self {
            inner: ArcSwap::from_pointee(scorer),
        }
    }

    /// Current snapshot; cheap, lock-free.
    pub fn load(&self) -> Arc<S> {
        self.inner.load_full()
    }

    /// Swap in a freshly loaded artifact.  Rare-path; safe concurrently
    /// with any number of `load`s.
    pub fn reload(&self, scorer: S) {
        self.inner.store(Arc::new(scorer));
    }
}

// ============================================================================
// Configuration, notes, output
// ============================================================================

/// Orchestrator configuration.
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ServeConfig {
    /// Total request budget.
    pub budget: Duration,
    /// Target output size.
    pub k: usize,
    /// Re-ranker objective weights.
    pub weights: ObjectiveWeights,
    /// Skip retention enrichment when more than this fraction of the budget
    /// is already spent after scoring (clamped to `[0, 1]`).
    pub enrich_budget_fraction: f64,
}

impl Default for ServeConfig {
    fn default() -> Self {
        Self {
            budget: Duration::from_millis(60),
            k: 10,
            weights: ObjectiveWeights::default(),
            enrich_budget_fraction: 0.5,
        }
    }
}

/// Typed notes describing how one serve call unfolded.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ServeNote {
    /// All stages completed within budget.
    Completed,
    /// Retention enrichment was skipped; cached values were reused.
    EnrichmentSkipped { elapsed_ms: u64 },
    /// The re-ranker hit its deadline and filled remaining slots by pure
    /// relevance order.
    RerankDeadlineFallback { selected: usize, filled: usize },
    /// The relevance scorer failed; the list is retrieval-order.
    ScorerFallback { reason: String },
}

/// Wall-clock per-stage timings for one request.
#[derive(Debug, Clone, Copy, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct StageTimings {
    pub retrieve_ms: u64,
    pub score_ms: u64,
    pub enrich_ms: u64,
    pub rerank_ms: u64,
    pub total_ms: u64,
}

/// Output of one [`Orchestrator::serve`] call.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ServeDecision {
    /// The final ranked list.
    pub ranked: RankedList,
    /// Audit notes for this request.
    pub notes: Vec<ServeNote>,
    /// Per-stage wall-clock timings.
    pub timings: StageTimings,
    /// Process-lifetime guardrail breach total after this request.
    pub breaches_total: u64,
}

// ============================================================================
// Orchestrator
// ============================================================================

/// Sequences retrieval → scoring → enrichment → re-ranking for independent,
/// stateless requests.
///
/// The only cross-request state is the scorer snapshot (immutable, swapped
/// atomically) and the breach counter (atomic); everything else is created
/// per request and discarded with the response.
pub struct Orchestrator<C, S, R = NoRetentionModel> {
    source: C,
    scorer: ScorerHandle<S>,
    retention: R,
    cfg: ServeConfig,
    breaches: AtomicU64,
}

impl<C, S> Orchestrator<C, S, NoRetentionModel>
where
    C: CandidateSource,
    S: RelevanceScorer,
{
    /// Orchestrator without retention enrichment.
    pub fn new(source: C, scorer: S, cfg: ServeConfig) -> Self {
        Self::with_retention(source, scorer, NoRetentionModel, cfg)
    }
}

impl<C, S, R> Orchestrator<C, S, R>
where
    C: CandidateSource,
    S: RelevanceScorer,
    R: RetentionModel,
{
    /// Orchestrator with a retention enrichment model.
    pub fn with_retention(source: C, scorer: S, retention: R, cfg: ServeConfig) -> Self {
        Self {
            source,
            scorer: ScorerHandle::new(scorer),
            retention,
            cfg,
            breaches: AtomicU64::new(0),
        }
    }

    /// The scorer snapshot handle, for explicit artifact reloads.
    pub fn scorer(&self) -> &ScorerHandle<S> {
        &self.scorer
    }

    /// Guardrail breaches recorded since construction.
    pub fn breach_count(&self) -> u64 {
        self.breaches.load(Ordering::Relaxed)
    }

    /// Serve one request.
    ///
    /// Errors only on conditions with no sensible degraded answer: failed
    /// retrieval, or an invalid candidate set (empty / duplicate ids) — the
    /// caller must then supply a default feed.  Scorer failure and deadline
    /// pressure degrade instead; see the module docs.
    pub fn serve(&self, ctx: &RequestContext) -> Result<ServeDecision, Error> {
        let start = Instant::now();
        let deadline = start + self.cfg.budget;
        let mut notes = Vec::new();
        let mut timings = StageTimings::default();

        // -------- Retrieval (external) --------
        let t = Instant::now();
        let candidates = self.source.retrieve(ctx)?;
        timings.retrieve_ms = t.elapsed().as_millis() as u64;
        if candidates.is_empty() {
            return Err(Error::EmptyCandidateSet);
        }

        // -------- Relevance scoring --------
        let t = Instant::now();
        let scorer = self.scorer.load();
        let mut scored: Vec<(f64, &Candidate)> = Vec::with_capacity(candidates.len());
        let mut scorer_failure: Option<Error> = None;
        for c in &candidates {
            match scorer.score(ctx, &c.features) {
                Ok(s) => scored.push((s.clamp(0.0, 1.0), c)),
                Err(e) => {
                    scorer_failure = Some(e);
                    break;
                }
            }
        }
        timings.score_ms = t.elapsed().as_millis() as u64;

        if let Some(err) = scorer_failure {
            // ModelUnavailable: degrade to retrieval-order ranking.
            self.breaches.fetch_add(1, Ordering::Relaxed);
            notes.push(ServeNote::ScorerFallback {
                reason: err.to_string(),
            });
            let ids: Vec<u64> = candidates.iter().map(|c| c.id).take(self.cfg.k).collect();
            timings.total_ms = start.elapsed().as_millis() as u64;
            return Ok(ServeDecision {
                ranked: RankedList { ids },
                notes,
                timings,
                breaches_total: self.breach_count(),
            });
        }

        // -------- Retention enrichment (optional, droppable) --------
        let t = Instant::now();
        let frac = self.cfg.enrich_budget_fraction.clamp(0.0, 1.0);
        let soft_deadline = start + self.cfg.budget.mul_f64(frac);
        let enrich = Instant::now() < soft_deadline;
        if !enrich {
            self.breaches.fetch_add(1, Ordering::Relaxed);
            notes.push(ServeNote::EnrichmentSkipped {
                elapsed_ms: start.elapsed().as_millis() as u64,
            });
        }
        let items: Vec<Item> = scored
            .iter()
            .map(|(relevance, c)| Item {
                id: c.id,
                relevance: *relevance,
                topic: c.topic,
                creator: c.creator,
                retention: if enrich {
                    self.retention.retention(ctx, c).clamp(0.0, 1.0)
                } else {
                    c.cached_retention.clamp(0.0, 1.0)
                },
                features: c.features.clone(),
            })
            .collect();
        timings.enrich_ms = t.elapsed().as_millis() as u64;

        // -------- Re-rank with the remaining budget --------
        let t = Instant::now();
        let set = CandidateSet::new(items)?;
        let decision = rerank(&set, &self.cfg.weights, self.cfg.k, Some(deadline));
        timings.rerank_ms = t.elapsed().as_millis() as u64;

        if decision.fallback_used {
            self.breaches.fetch_add(1, Ordering::Relaxed);
            for n in &decision.notes {
                if let RerankNote::DeadlineFallback { selected, filled } = n {
                    notes.push(ServeNote::RerankDeadlineFallback {
                        selected: *selected,
                        filled: *filled,
                    });
                }
            }
        }
        if notes.is_empty() {
            notes.push(ServeNote::Completed);
        }

        timings.total_ms = start.elapsed().as_millis() as u64;
        Ok(ServeDecision {
            ranked: decision.ranked,
            notes,
            timings,
            breaches_total: self.breach_count(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedSource(Vec<Candidate>);
    impl CandidateSource for FixedSource {
        fn retrieve(&self, _ctx: &RequestContext) -> Result<Vec<Candidate>, Error> {
            Ok(self.0.clone())
        }
    }

    /// Scores by the first feature; optionally sleeps to simulate overrun.
    struct DotScorer {
        delay: Duration,
    }
    impl RelevanceScorer for DotScorer {
        fn score(&self, _ctx: &RequestContext, item_features: &[f64]) -> Result<f64, Error> {
            if !self.delay.is_zero() {
                std::thread::sleep(self.delay);
            }
            Ok(item_features.first().copied().unwrap_or(0.0))
        }
    }

    struct BrokenScorer;
    impl RelevanceScorer for BrokenScorer {
        fn score(&self, _ctx: &RequestContext, _item_features: &[f64]) -> Result<f64, Error> {
            Err(Error::ModelUnavailable("artifact missing".to_string()))
        }
    }

    fn candidate(id: u64, lead_feature: f64) -> Candidate {
        Candidate {
            id,
            topic: (id % 3) as u32,
            creator: 0,
            features: vec![lead_feature, 0.0],
            cached_retention: 0.5,
        }
    }

    fn ctx() -> RequestContext {
        RequestContext {
            user_id: 1,
            features: vec![0.7],
        }
    }

    #[test]
    fn happy_path_completes_within_budget() {
        let source = FixedSource(vec![
            candidate(1, 0.9),
            candidate(2, 0.4),
            candidate(3, 0.7),
        ]);
        let orch = Orchestrator::new(source, DotScorer { delay: Duration::ZERO }, ServeConfig::default());
        let d = orch.serve(&ctx()).unwrap();
        assert_eq!(d.ranked.len(), 3);
        assert_eq!(d.notes, vec![ServeNote::Completed]);
        assert_eq!(orch.breach_count(), 0);
    }

    #[test]
    fn broken_scorer_falls_back_to_retrieval_order() {
        let source = FixedSource(vec![
            candidate(5, 0.1),
            candidate(2, 0.9),
            candidate(9, 0.5),
        ]);
        let cfg = ServeConfig {
            k: 2,
            ..ServeConfig::default()
        };
        let orch = Orchestrator::new(source, BrokenScorer, cfg);
        let d = orch.serve(&ctx()).unwrap();
        assert_eq!(d.ranked.ids, vec![5, 2], "retrieval order, truncated to k");
        assert!(matches!(d.notes[0], ServeNote::ScorerFallback { .. }));
        assert_eq!(orch.breach_count(), 1);
    }

    #[test]
    fn slow_scoring_skips_enrichment_and_records_breach() {
        struct CountingRetention;
        impl RetentionModel for CountingRetention {
            fn retention(&self, _ctx: &RequestContext, _c: &Candidate) -> f64 {
                panic!("enrichment must be skipped when the soft budget is gone");
            }
        }
        let source = FixedSource(vec![candidate(1, 0.9), candidate(2, 0.4)]);
        let cfg = ServeConfig {
            budget: Duration::from_millis(20),
            enrich_budget_fraction: 0.25,
            ..ServeConfig::default()
        };
        let orch = Orchestrator::with_retention(
            source,
            DotScorer { delay: Duration::from_millis(8) },
            CountingRetention,
            cfg,
        );
        let d = orch.serve(&ctx()).unwrap();
        assert!(d
            .notes
            .iter()
            .any(|n| matches!(n, ServeNote::EnrichmentSkipped { .. })));
        assert!(orch.breach_count() >= 1);
        assert_eq!(d.ranked.len(), 2);
    }

    #[test]
    fn empty_retrieval_is_fatal_for_the_request() {
        let orch = Orchestrator::new(
            FixedSource(vec![]),
            DotScorer { delay: Duration::ZERO },
            ServeConfig::default(),
        );
        assert!(matches!(orch.serve(&ctx()), Err(Error::EmptyCandidateSet)));
    }

    #[test]
    fn duplicate_candidates_are_fatal_for_the_request() {
        let orch = Orchestrator::new(
            FixedSource(vec![candidate(1, 0.9), candidate(1, 0.8)]),
            DotScorer { delay: Duration::ZERO },
            ServeConfig::default(),
        );
        assert!(matches!(orch.serve(&ctx()), Err(Error::DuplicateItemId(1))));
    }

    #[test]
    fn scorer_reload_switches_snapshot_atomically() {
        struct ConstScorer(f64);
        impl RelevanceScorer for ConstScorer {
            fn score(&self, _ctx: &RequestContext, _f: &[f64]) -> Result<f64, Error> {
                Ok(self.0)
            }
        }
        let handle = ScorerHandle::new(ConstScorer(0.2));
        let old = handle.load();
        handle.reload(ConstScorer(0.8));
        // The old snapshot is still valid for readers that hold it.
        assert_eq!(old.score(&ctx(), &[]).unwrap(), 0.2);
        assert_eq!(handle.load().score(&ctx(), &[]).unwrap(), 0.8);
    }
}
