//! Pure weight-update math: `new_weight = current · time_decay · frequency ·
//! context · emotion · recency`, clamped to `[MIN_WEIGHT, MAX_WEIGHT]`.

use chrono::{DateTime, Duration, Utc};

use crate::model::clamp_weight;

pub const TIME_DECAY_BASE: f64 = 0.995;
pub const FREQUENCY_FACTOR_RECENT: f64 = 1.1;
pub const FREQUENCY_FACTOR_STALE: f64 = 0.98;
pub const CONTEXT_FACTOR_RELATED: f64 = 1.2;
pub const CONTEXT_FACTOR_UNRELATED: f64 = 1.0;
pub const EMOTION_FACTOR_FLAGGED: f64 = 1.15;
pub const EMOTION_FACTOR_NEUTRAL: f64 = 1.0;
pub const RECENCY_BOOST_FRESH: f64 = 1.3;
pub const RECENCY_BOOST_STALE: f64 = 1.0;

/// The inputs needed to compute one weight update. Each boolean captures a
/// pre-evaluated condition rather than a raw timestamp, so the same
/// function serves lifecycle ticks, evaluator updates, and retrieval-side
/// access recording.
#[derive(Debug, Clone, Copy)]
pub struct Factors {
    pub age_days: f64,
    pub accessed_within_last_day: bool,
    pub currently_topic_related: bool,
    pub emotionally_flagged: bool,
    pub accessed_within_last_30_min: bool,
}

impl Factors {
    /// Derive factors from timestamps and flags, the form callers actually
    /// have on hand.
    pub fn from_timestamps(
        created_at: DateTime<Utc>,
        last_accessed: DateTime<Utc>,
        now: DateTime<Utc>,
        currently_topic_related: bool,
        emotionally_flagged: bool,
    ) -> Self {
        let age = now.signed_duration_since(created_at);
        let since_access = now.signed_duration_since(last_accessed);
        Self {
            age_days: (age.num_seconds() as f64 / 86_400.0).max(0.0),
            accessed_within_last_day: since_access <= Duration::days(1),
            currently_topic_related,
            emotionally_flagged,
            accessed_within_last_30_min: since_access <= Duration::minutes(30),
        }
    }

    pub fn time_decay(&self) -> f64 {
        TIME_DECAY_BASE.powf(self.age_days)
    }

    pub fn frequency_factor(&self) -> f64 {
        if self.accessed_within_last_day {
            FREQUENCY_FACTOR_RECENT
        } else {
            FREQUENCY_FACTOR_STALE
        }
    }

    pub fn context_factor(&self) -> f64 {
        if self.currently_topic_related {
            CONTEXT_FACTOR_RELATED
        } else {
            CONTEXT_FACTOR_UNRELATED
        }
    }

    pub fn emotion_factor(&self) -> f64 {
        if self.emotionally_flagged {
            EMOTION_FACTOR_FLAGGED
        } else {
            EMOTION_FACTOR_NEUTRAL
        }
    }

    pub fn recency_boost(&self) -> f64 {
        if self.accessed_within_last_30_min {
            RECENCY_BOOST_FRESH
        } else {
            RECENCY_BOOST_STALE
        }
    }
}

/// The result of applying one weight update: the new clamped weight plus
/// the individual factor values, kept around for monitor/debug output.
#[derive(Debug, Clone, Copy)]
pub struct WeightUpdate {
    pub previous_weight: f64,
    pub new_weight: f64,
    pub factors: Factors,
}

pub fn apply(current_weight: f64, factors: Factors) -> WeightUpdate {
    let multiplier = factors.time_decay()
        * factors.frequency_factor()
        * factors.context_factor()
        * factors.emotion_factor()
        * factors.recency_boost();
    let new_weight = clamp_weight(current_weight * multiplier);
    WeightUpdate { previous_weight: current_weight, new_weight, factors }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_access_boosts_weight() {
        let factors = Factors {
            age_days: 0.0,
            accessed_within_last_day: true,
            currently_topic_related: true,
            emotionally_flagged: true,
            accessed_within_last_30_min: true,
        };
        let update = apply(5.0, factors);
        assert!(update.new_weight > 5.0);
    }

    #[test]
    fn stale_unrelated_access_decays_weight() {
        let factors = Factors {
            age_days: 60.0,
            accessed_within_last_day: false,
            currently_topic_related: false,
            emotionally_flagged: false,
            accessed_within_last_30_min: false,
        };
        let update = apply(5.0, factors);
        assert!(update.new_weight < 5.0);
    }

    #[test]
    fn result_is_always_clamped() {
        let factors = Factors {
            age_days: 0.0,
            accessed_within_last_day: true,
            currently_topic_related: true,
            emotionally_flagged: true,
            accessed_within_last_30_min: true,
        };
        let update = apply(9.99, factors);
        assert!(update.new_weight <= 10.0);

        let decaying = Factors {
            age_days: 3650.0,
            accessed_within_last_day: false,
            currently_topic_related: false,
            emotionally_flagged: false,
            accessed_within_last_30_min: false,
        };
        let floor = apply(0.11, decaying);
        assert!(floor.new_weight >= 0.1);
    }

    #[test]
    fn time_decay_matches_formula() {
        let factors = Factors {
            age_days: 10.0,
            accessed_within_last_day: false,
            currently_topic_related: false,
            emotionally_flagged: false,
            accessed_within_last_30_min: false,
        };
        assert!((factors.time_decay() - 0.995f64.powf(10.0)).abs() < 1e-9);
    }
}
