//! Sequence pattern recognition.
//!
//! Detects forward, backward and strided scans over block numbers without
//! locking onto a single fixed stride. Distances are sampled between
//! adjacent and next-to-adjacent history entries so a single outlier does
//! not break the pattern; a 75% agreement threshold suppresses spurious
//! prefetch on random access.

use std::collections::{HashMap, VecDeque};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PredictionType {
    /// Return the full prediction.
    All,
    /// Suppress block numbers already predicted earlier.
    Continue,
}

pub struct PrefetchOracle {
    max_prediction: usize,
    sequence_capacity: usize,
    /// Deduplicated most-recent-first access history.
    sequence: VecDeque<i64>,
    past_predictions: VecDeque<i64>,
}

impl PrefetchOracle {
    pub fn new(max_prediction: usize) -> Self {
        let sequence_capacity = if max_prediction > 8 {
            max_prediction + 2
        } else {
            10
        };
        Self {
            max_prediction,
            sequence_capacity,
            sequence: VecDeque::new(),
            past_predictions: VecDeque::new(),
        }
    }

    /// Record a block access. Re-accessing a number already in the history
    /// changes nothing.
    pub fn add(&mut self, number: u64) {
        let number = number as i64;
        if self.sequence.contains(&number) {
            return;
        }
        self.sequence.push_front(number);
        if self.sequence.len() > self.sequence_capacity {
            self.sequence.pop_back();
        }
    }

    /// Predict future block accesses, at most `min(length, max_prediction)`.
    pub fn predict(&mut self, length: usize, prediction_type: PredictionType) -> Vec<u64> {
        let length = length.min(self.max_prediction);

        if self.sequence.len() < 3 {
            return Vec::new();
        }

        // Signed distances with their witnessing elements.
        let mut distances: HashMap<i64, Vec<i64>> = HashMap::new();
        for (i, &current) in self.sequence.iter().enumerate() {
            if let Some(&next) = self.sequence.get(i + 1) {
                distances.entry(current - next).or_default().push(current);
            }
            if let Some(&skip) = self.sequence.get(i + 2) {
                distances.entry(current - skip).or_default().push(current);
            }
        }

        let Some((&distance, witnesses)) =
            distances.iter().max_by_key(|(_, witnesses)| witnesses.len())
        else {
            return Vec::new();
        };

        if witnesses.len() < (self.sequence.len() as f64 * 0.75) as usize {
            return Vec::new();
        }

        let front = witnesses[0];
        let mut prediction: Vec<i64> = Vec::new();
        for i in 1..=witnesses.len() {
            let p = front + i as i64 * distance;
            // Block numbers below one do not exist.
            if p > 0 && prediction.len() < length {
                prediction.push(p);
            }
        }

        if prediction_type == PredictionType::Continue {
            prediction.retain(|p| !self.past_predictions.contains(p));
        }

        for &p in &prediction {
            self.past_predictions.push_front(p);
        }
        self.past_predictions.truncate(self.sequence_capacity);

        prediction.into_iter().map(|p| p as u64).collect()
    }
}
