//! Ship/no-ship gating: evaluator output against guardrail thresholds.
//!
//! The offline pipeline ends here: a candidate policy's counterfactual
//! estimate is compared to the production baseline's, guardrail metrics are
//! checked for regression, and the result is a single structured verdict an
//! external CLI/report renderer can consume.  The verdict carries typed
//! notes so a reviewer can see *why* a change was blocked without replaying
//! the evaluation.

use crate::EvaluationResult;

/// Direction a guardrail metric must respect relative to its baseline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ConstraintKind {
    /// Observed must stay at or below baseline (+ tolerance), e.g. latency,
    /// deadline-fallback rate.
    AtMost,
    /// Observed must stay at or above baseline (− tolerance), e.g. diversity
    /// coverage, retention proxy.
    AtLeast,
}

/// One guardrail metric check: baseline vs. observed under a constraint.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct GuardrailSnapshot {
    /// Metric name, e.g. `"deadline_fallback_rate"`.
    pub name: String,
    /// Value under the current production policy.
    pub baseline: f64,
    /// Value under the candidate policy.
    pub observed: f64,
    /// Which direction counts as a regression.
    pub kind: ConstraintKind,
    /// Whether the constraint held (significance verdict).
    pub pass: bool,
}

impl GuardrailSnapshot {
    /// Build a snapshot, deciding `pass` from the constraint direction with
    /// an absolute `tolerance` slack.
    pub fn check(
        name: impl Into<String>,
        baseline: f64,
        observed: f64,
        kind: ConstraintKind,
        tolerance: f64,
    ) -> Self {
        let tol = tolerance.abs();
        let pass = match kind {
            ConstraintKind::AtMost => observed <= baseline + tol,
            ConstraintKind::AtLeast => observed >= baseline - tol,
        };
        Self {
            name: name.into(),
            baseline,
            observed,
            kind,
            pass,
        }
    }
}

/// Decision-layer configuration.
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ShipConfig {
    /// Minimum SNIPS lift (candidate − baseline) required to ship.
    pub min_snips_lift: f64,
    /// Refuse to ship when either side is flagged low-support.
    pub require_support: bool,
    /// Flag (and note) when IPS and SNIPS disagree by more than this on the
    /// candidate — a skewed-weights smell even when support looks fine.
    pub max_estimator_disagreement: f64,
}

impl Default for ShipConfig {
    fn default() -> Self {
        Self {
            min_snips_lift: 0.0,
            require_support: true,
            max_estimator_disagreement: 0.25,
        }
    }
}

/// Typed reasons attached to a [`ShipVerdict`].
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum VerdictNote {
    /// Candidate SNIPS beat the baseline by at least the required lift.
    SufficientLift { lift: f64 },
    /// Candidate SNIPS lift was below the required minimum.
    InsufficientLift { lift: f64, required: f64 },
    /// The candidate evaluation was flagged low-support.
    CandidateLowSupport { ess: f64, n_events: u64 },
    /// The baseline evaluation was flagged low-support.
    BaselineLowSupport { ess: f64, n_events: u64 },
    /// IPS and SNIPS disagree beyond tolerance on the candidate.
    EstimatorDisagreement { ips: f64, snips: f64 },
    /// A named guardrail regressed.
    GuardrailBreached { name: String },
}

/// Condensed estimate block for the external report renderer.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct EstimateSummary {
    pub ips: f64,
    pub snips: f64,
    pub ess: f64,
    pub low_support: bool,
}

impl From<&EvaluationResult> for EstimateSummary {
    fn from(r: &EvaluationResult) -> Self {
        Self {
            ips: r.ips,
            snips: r.snips,
            ess: r.ess,
            low_support: r.low_support,
        }
    }
}

/// The structured ship/no-ship verdict.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ShipVerdict {
    /// Safe to proceed to online exposure (A/B test), per this evaluation.
    pub ship: bool,
    /// Candidate policy estimate.
    pub estimate: EstimateSummary,
    /// Baseline policy estimate.
    pub baseline: EstimateSummary,
    /// Guardrail checks, as supplied.
    pub guardrails: Vec<GuardrailSnapshot>,
    /// Why the verdict came out this way.
    pub notes: Vec<VerdictNote>,
}

/// Combine evaluator output and guardrails into a verdict.
///
/// Ship requires, jointly: SNIPS lift ≥ [`ShipConfig::min_snips_lift`],
/// adequate support on both evaluations (when `require_support`), and every
/// guardrail passing.  Estimator disagreement is advisory: it adds a note
/// but blocks only through the support flag it usually accompanies.
///
/// # Example
///
/// ```rust
/// use rankgate::{
///     evaluate, ship_decision, EvalConfig, LoggedActionPolicy, ShipConfig,
///     Simulator, SimulatorConfig,
/// };
///
/// let sim = Simulator::generate(SimulatorConfig::default(), 1);
/// let base = evaluate(&sim.catalog, &sim.records, &LoggedActionPolicy, EvalConfig::default());
/// // Gating a policy against itself: zero lift, default config refuses.
/// let v = ship_decision(&base, &base, &[], ShipConfig { min_snips_lift: 0.01, ..ShipConfig::default() });
/// assert!(!v.ship);
/// ```
pub fn ship_decision(
    baseline: &EvaluationResult,
    candidate: &EvaluationResult,
    guardrails: &[GuardrailSnapshot],
    cfg: ShipConfig,
) -> ShipVerdict {
    let mut notes = Vec::new();
    let mut ship = true;

    let lift = candidate.snips - baseline.snips;
    if lift >= cfg.min_snips_lift {
        notes.push(VerdictNote::SufficientLift { lift });
    } else {
        ship = false;
        notes.push(VerdictNote::InsufficientLift {
            lift,
            required: cfg.min_snips_lift,
        });
    }

    if cfg.require_support {
        if candidate.low_support {
            ship = false;
            notes.push(VerdictNote::CandidateLowSupport {
                ess: candidate.ess,
                n_events: candidate.n_events,
            });
        }
        if baseline.low_support {
            ship = false;
            notes.push(VerdictNote::BaselineLowSupport {
                ess: baseline.ess,
                n_events: baseline.n_events,
            });
        }
    }

    if (candidate.ips - candidate.snips).abs() > cfg.max_estimator_disagreement {
        notes.push(VerdictNote::EstimatorDisagreement {
            ips: candidate.ips,
            snips: candidate.snips,
        });
    }

    for g in guardrails {
        if !g.pass {
            ship = false;
            notes.push(VerdictNote::GuardrailBreached {
                name: g.name.clone(),
            });
        }
    }

    ShipVerdict {
        ship,
        estimate: EstimateSummary::from(candidate),
        baseline: EstimateSummary::from(baseline),
        guardrails: guardrails.to_vec(),
        notes,
    }
}
