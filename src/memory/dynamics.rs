//! Salience decay and reinforcement.
//!
//! Pure functions over `f64` salience values. Every result is clamped to
//! `[0.0, 1.0]`; callers persist what these return.

use crate::config::{DynamicsConfig, IngestionConfig, SectorsConfig};
use crate::memory::types::Sector;

pub fn clamp_unit(x: f64) -> f64 {
    if x.is_nan() {
        0.0
    } else {
        x.clamp(0.0, 1.0)
    }
}

/// Where a memory sits among the append-only segments.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SegmentPosition {
    pub index: i64,
    pub max: i64,
}

/// Decay and reinforcement rules, built once from config.
#[derive(Debug, Clone)]
pub struct SalienceDynamics {
    lambdas: [f64; 5],
    alpha: f64,
    trace_eta: f64,
    dedup_boost: f64,
    feedback_alpha: f64,
    neighbor_gamma: f64,
    neighbor_decay_per_day: f64,
    pub consolidation_threshold: f64,
    pub default_boost: f64,
}

impl SalienceDynamics {
    pub fn new(sectors: &SectorsConfig, dynamics: &DynamicsConfig, ingestion: &IngestionConfig) -> Self {
        let mut lambdas = [0.0; 5];
        for sector in Sector::ALL {
            lambdas[sector.index()] = sectors.get(sector).decay_lambda;
        }
        Self {
            lambdas,
            alpha: dynamics.alpha_reinforce,
            trace_eta: dynamics.trace_eta,
            dedup_boost: ingestion.dedup_boost,
            feedback_alpha: dynamics.feedback_alpha,
            neighbor_gamma: dynamics.neighbor_gamma,
            neighbor_decay_per_day: dynamics.neighbor_decay_per_day,
            consolidation_threshold: dynamics.consolidation_threshold,
            default_boost: dynamics.reinforce_boost,
        }
    }

    pub fn decay_rate(&self, sector: Sector) -> f64 {
        self.lambdas[sector.index()]
    }

    /// Salience after `days` without recall.
    ///
    /// With a known segment position the rate shrinks by `1 - sqrt(index / max)`.
    /// A floor of `alpha * (1 - e^(-rate * days))` is added back.
    pub fn calc_decay(
        &self,
        sector: Sector,
        initial: f64,
        days: f64,
        segment: Option<SegmentPosition>,
    ) -> f64 {
        self.decay_with_rate(self.decay_rate(sector), initial, days, segment)
    }

    /// [`Self::calc_decay`] with an explicit base rate, for rows that carry their own.
    pub fn decay_with_rate(
        &self,
        lambda: f64,
        initial: f64,
        days: f64,
        segment: Option<SegmentPosition>,
    ) -> f64 {
        let mut rate = lambda;
        if let Some(pos) = segment {
            if pos.max > 0 {
                let progress = (pos.index.max(0) as f64 / pos.max as f64).min(1.0);
                rate *= 1.0 - progress.sqrt();
            }
        }
        let days = days.max(0.0);
        let retained = (-rate * days).exp();
        clamp_unit(initial * retained + self.alpha * (1.0 - retained))
    }

    /// Retrieval-trace reinforcement: `s + eta * (1 - s)`.
    pub fn trace_reinforce(&self, salience: f64) -> f64 {
        clamp_unit(salience + self.trace_eta * (1.0 - salience))
    }

    /// Explicit reinforcement: `s + boost`, capped at 1.
    pub fn reinforce(&self, salience: f64, boost: f64) -> f64 {
        clamp_unit(salience + boost)
    }

    /// Flat bump applied when an ingest merges into an existing memory.
    pub fn dedup_reinforce(&self, salience: f64) -> f64 {
        clamp_unit(salience + self.dedup_boost)
    }

    /// Exponential moving average of relevance scores.
    pub fn feedback_ema(&self, previous: f64, score: f64) -> f64 {
        (1.0 - self.feedback_alpha) * previous + self.feedback_alpha * score
    }

    /// Secondary boost a recalled memory passes to a direct graph neighbor.
    /// Only flows downhill and fades with the neighbor's idle time.
    pub fn propagate_to_neighbor(&self, source: f64, neighbor: f64, neighbor_idle_days: f64) -> f64 {
        let boost = self.neighbor_gamma
            * (source - neighbor).max(0.0)
            * (-self.neighbor_decay_per_day * neighbor_idle_days.max(0.0)).exp();
        clamp_unit(neighbor + boost)
    }

    /// Starting salience for a memory with `additional` secondary sectors.
    pub fn initial_salience(ingestion: &IngestionConfig, additional: usize) -> f64 {
        clamp_unit(ingestion.initial_salience + ingestion.salience_per_sector * additional as f64)
    }
}
