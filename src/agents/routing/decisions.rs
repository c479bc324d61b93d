use std::cmp::Ordering;

use super::filters::Candidate;

/// Combines an agent's load into a single score. Lower is better.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoadScorer {
    pub cpu_weight: f64,
    pub memory_weight: f64,
    pub queue_weight: f64,
    /// Queue depth that counts as fully loaded for scoring.
    pub queue_norm: u32,
}

impl Default for LoadScorer {
    fn default() -> Self {
        Self {
            cpu_weight: 0.4,
            memory_weight: 0.4,
            queue_weight: 0.2,
            queue_norm: 10,
        }
    }
}

impl LoadScorer {
    pub fn score(&self, candidate: &Candidate) -> f64 {
        let Some(load) = candidate.agent.load else {
            return 0.0;
        };
        let queue = if self.queue_norm == 0 {
            0.0
        } else {
            (f64::from(load.queue_depth) / f64::from(self.queue_norm)).min(1.0)
        };
        self.cpu_weight * load.cpu_fraction + self.memory_weight * load.memory_fraction + self.queue_weight * queue
    }

    /// Orders candidates best first: lowest score, then lowest queue depth,
    /// then agent id. The order is total, so equal inputs rank equally.
    pub fn rank(&self, mut candidates: Vec<Candidate>) -> Vec<Candidate> {
        candidates.sort_by(|a, b| self.compare(a, b));
        candidates
    }

    fn compare(&self, a: &Candidate, b: &Candidate) -> Ordering {
        self.score(a)
            .total_cmp(&self.score(b))
            .then_with(|| a.agent.queue_depth().cmp(&b.agent.queue_depth()))
            .then_with(|| a.agent.id.cmp(&b.agent.id))
    }
}
