use serde::Serialize;
use std::collections::VecDeque;

use crate::classifier::{BoxType, CATALOG};
use crate::config::StabilizationConfig;

/// Snapshot of the tracker after a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StabilizationSnapshot {
    pub majority: Option<BoxType>,
    pub last_stable_type: Option<BoxType>,
    pub consecutive_count: u32,
    pub confirmed: bool,
}

/// Debounces per-frame classifications.
///
/// `last_stable_type` follows the latest frame majority as soon as it
/// changes; `consecutive_count` tracks how many frames in a row agreed.
/// Confirmation (`consecutive_count >= confirm_count`) is reported
/// separately and never delays `last_stable_type`.
pub struct StabilizationTracker {
    history: VecDeque<BoxType>,
    capacity: usize,
    last_stable_type: Option<BoxType>,
    consecutive_count: u32,
    confirm_count: u32,
}

impl StabilizationTracker {
    pub fn new(config: &StabilizationConfig) -> Self {
        Self {
            history: VecDeque::with_capacity(config.history_capacity),
            capacity: config.history_capacity,
            last_stable_type: None,
            consecutive_count: 0,
            confirm_count: config.confirm_count,
        }
    }

    /// Feeds the valid labels of one frame.
    pub fn update(&mut self, labels: &[BoxType]) -> StabilizationSnapshot {
        let majority = majority_label(labels);

        match majority {
            Some(current) => {
                self.history.push_back(current);
                while self.history.len() > self.capacity {
                    self.history.pop_front();
                }

                if self.last_stable_type == Some(current) {
                    self.consecutive_count += 1;
                } else {
                    self.consecutive_count = 1;
                    self.last_stable_type = Some(current);
                }
            }
            None => {
                self.consecutive_count = 0;
                self.last_stable_type = None;
            }
        }

        StabilizationSnapshot {
            majority,
            last_stable_type: self.last_stable_type,
            consecutive_count: self.consecutive_count,
            confirmed: self.is_confirmed(),
        }
    }

    pub fn last_stable_type(&self) -> Option<BoxType> {
        self.last_stable_type
    }

    pub fn consecutive_count(&self) -> u32 {
        self.consecutive_count
    }

    pub fn is_confirmed(&self) -> bool {
        self.last_stable_type.is_some() && self.consecutive_count >= self.confirm_count
    }

    pub fn history(&self) -> &VecDeque<BoxType> {
        &self.history
    }
}

/// Most frequent catalog label; ties go to the earlier catalog entry.
pub fn majority_label(labels: &[BoxType]) -> Option<BoxType> {
    let mut counts = [0usize; CATALOG.len()];
    for label in labels {
        if let Some(index) = label.catalog_index() {
            counts[index] += 1;
        }
    }

    let mut best: Option<(usize, usize)> = None;
    for (index, &count) in counts.iter().enumerate() {
        if count > 0 && best.map_or(true, |(_, best_count)| count > best_count) {
            best = Some((index, count));
        }
    }
    best.map(|(index, _)| CATALOG[index].box_type)
}
