//! Synthetic bandit log generator with a known biased logging policy.
//!
//! Produces logged interaction records whose recorded propensity **exactly**
//! equals the probability mass the logging policy put on the sampled action
//! — the invariant the whole IPS/SNIPS machinery depends on.  Feedback is
//! selective by construction: a reward is drawn only for the one action
//! actually shown.
//!
//! Two compartments, never merged:
//!
//! - The **logged surface** ([`Simulation::catalog`],
//!   [`Simulation::records`]) is everything evaluation code may see.
//! - The **ground truth** lives behind [`Oracle`], which exposes only
//!   aggregate policy values for validating evaluator correctness in tests.
//!   The reward function itself is private to this module, so downstream
//!   code cannot silently cheat.
//!
//! The world model is deliberately small: users carry a scalar preference
//! in `[-1, 1]`, items a scalar attribute in `[-1, 1]`; the logging policy
//! soft-maxes a noisy `pref·attr` estimate (over-exploiting high scorers),
//! and the hidden truth is `P(reward) = sigmoid(2·pref·attr)`.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};

use crate::{Catalog, LogRecord, Policy};

/// Generator configuration.
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SimulatorConfig {
    /// Number of distinct user contexts.
    pub n_users: usize,
    /// Catalog size (actions the logging policy chooses among).
    pub n_items: usize,
    /// Number of logged events to produce.
    pub n_events: usize,
    /// Std-dev of the noise the logging policy adds to its score estimate.
    /// Larger values flatten the logging distribution (more exploration).
    pub noise_std: f64,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            n_users: 200,
            n_items: 20,
            n_events: 2_000,
            noise_std: 0.3,
        }
    }
}

/// One generated world: logged surface plus the walled-off truth.
#[derive(Debug, Clone)]
pub struct Simulation {
    /// Item universe (id → features); visible to policies and the evaluator.
    pub catalog: Catalog,
    /// Logged events with exact propensities; visible to the evaluator.
    pub records: Vec<LogRecord>,
    /// Test-only ground-truth surface.  Exposes aggregate values, never the
    /// reward function.
    pub oracle: Oracle,
}

/// Seeded synthetic-log generator.
#[derive(Debug, Clone, Copy)]
pub struct Simulator;

impl Simulator {
    /// Generate a world and its logged events.  Deterministic: the same
    /// `(cfg, seed)` always yields identical records and oracle values.
    pub fn generate(cfg: SimulatorConfig, seed: u64) -> Simulation {
        let mut rng = StdRng::seed_from_u64(seed);
        let n_users = cfg.n_users.max(1);
        let n_items = cfg.n_items.max(1);

        let user_prefs: Vec<f64> = (0..n_users).map(|_| rng.random_range(-1.0..1.0)).collect();
        let item_attrs: Vec<f64> = (0..n_items).map(|_| rng.random_range(-1.0..1.0)).collect();

        let catalog = Catalog::new(
            item_attrs
                .iter()
                .enumerate()
                .map(|(i, &a)| (i as u64, vec![a])),
        );

        let noise = Normal::new(0.0, cfg.noise_std.max(f64::MIN_POSITIVE));
        let mut records = Vec::with_capacity(cfg.n_events);
        for t in 0..cfg.n_events {
            let user = rng.random_range(0..n_users);
            let pref = user_prefs[user];

            // Biased logging policy: noisy relevance estimate, softmax.
            let scores: Vec<f64> = item_attrs
                .iter()
                .map(|&a| {
                    let eps = match &noise {
                        Ok(d) => d.sample(&mut rng),
                        Err(_) => 0.0,
                    };
                    pref * a + eps
                })
                .collect();
            let probs = softmax(&scores);
            let action = sample_categorical(&probs, &mut rng);
            // Correctness-critical: the recorded propensity is exactly the
            // mass the policy put on the sampled action.
            let propensity = probs[action];

            // Hidden truth, consulted only for the one shown action.
            let p_reward = true_reward_prob(pref, item_attrs[action]);
            let reward = if rng.random::<f64>() < p_reward { 1.0 } else { 0.0 };

            records.push(LogRecord {
                context_id: user as u64,
                context: vec![pref],
                action: Some(action as u64),
                propensity,
                reward: Some(reward),
                timestamp_ms: t as u64,
            });
        }

        let oracle = Oracle {
            user_prefs,
            catalog: catalog.clone(),
        };

        Simulation {
            catalog,
            records,
            oracle,
        }
    }
}

/// Ground-truth reward probability.  Private: only the generator and the
/// oracle may consult it.
fn true_reward_prob(user_pref: f64, item_attr: f64) -> f64 {
    let logit = 2.0 * user_pref * item_attr;
    1.0 / (1.0 + (-logit).exp())
}

/// Numerically stable softmax (shifts by the max before exponentiating).
pub(crate) fn softmax(scores: &[f64]) -> Vec<f64> {
    let max = scores.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let exps: Vec<f64> = scores.iter().map(|s| (s - max).exp()).collect();
    let sum: f64 = exps.iter().sum();
    if sum <= 0.0 || !sum.is_finite() {
        let u = 1.0 / scores.len().max(1) as f64;
        return vec![u; scores.len()];
    }
    exps.iter().map(|e| e / sum).collect()
}

/// Sample an index from a probability vector (inverse-CDF walk).
pub(crate) fn sample_categorical(probs: &[f64], rng: &mut StdRng) -> usize {
    let u: f64 = rng.random();
    let mut cum = 0.0;
    for (i, p) in probs.iter().enumerate() {
        cum += p;
        if u < cum {
            return i;
        }
    }
    // Floating-point shortfall: the last index is the safe fallback.
    probs.len().saturating_sub(1)
}

// ============================================================================
// Oracle (test-only ground-truth surface)
// ============================================================================

/// Aggregate ground-truth values for validating evaluator correctness.
///
/// Deliberately narrow: you can ask for the true expected reward of a
/// policy, but not for the reward function itself or any per-event truth.
#[derive(Debug, Clone)]
pub struct Oracle {
    user_prefs: Vec<f64>,
    catalog: Catalog,
}

impl Oracle {
    /// True expected per-event reward of `policy`: the exact mean over the
    /// user population of the hidden reward probability at the policy's
    /// chosen item.
    ///
    /// Contexts where the policy abstains (`choose` returns `None`, e.g.
    /// [`crate::LoggedActionPolicy`]) are skipped.
    pub fn policy_value<P: Policy>(&self, policy: &P) -> f64 {
        let mut sum = 0.0;
        let mut n = 0u64;
        for &pref in &self.user_prefs {
            let ctx = [pref];
            let Some(choice) = policy.choose(&ctx, &self.catalog) else {
                continue;
            };
            let Some(feats) = self.catalog.features(choice) else {
                continue;
            };
            sum += true_reward_prob(pref, feats[0]);
            n += 1;
        }
        if n == 0 {
            0.0
        } else {
            sum / n as f64
        }
    }

    /// Number of user contexts the oracle averages over.
    pub fn n_contexts(&self) -> usize {
        self.user_prefs.len()
    }
}
