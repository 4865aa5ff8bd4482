//! Assignment engine
//!
//! Given one pending task and a point-in-time worker snapshot, pick the
//! worker that should run it. Every strategy sees the same eligibility
//! filter first: the worker must be online or busy and have a free slot.
//!
//! Strategies are a closed enum selected by configuration. All of them are
//! pure over the snapshot except round-robin, whose cursor lives in
//! [`Assigner`].

use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering as CmpOrdering;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use thiserror::Error;

use crate::model::{Task, Worker};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AssignError {
    #[error("no eligible worker for task {0}")]
    NoEligibleWorker(String),
}

pub type Result<T> = std::result::Result<T, AssignError>;

/// How a worker is chosen among the eligible set
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Smallest load percentage, ties broken by worker id
    #[default]
    LeastLoaded,
    /// Rotating cursor over eligible workers ordered by id
    RoundRobin,
    /// Uniform pick
    Random,
    /// Tag-subset candidates first, least-loaded among them, then fallback
    Tags,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::LeastLoaded => "least_loaded",
            Strategy::RoundRobin => "round_robin",
            Strategy::Random => "random",
            Strategy::Tags => "tags",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Strategy plus the shared round-robin cursor
#[derive(Debug, Default)]
pub struct Assigner {
    strategy: Strategy,
    cursor: AtomicUsize,
}

impl Assigner {
    pub fn new(strategy: Strategy) -> Self {
        Self {
            strategy,
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    /// Choose a worker id for `task` from `workers`
    ///
    /// The snapshot may be stale; the caller must re-check capacity when it
    /// reserves the slot.
    pub fn select(&self, task: &Task, workers: &[Worker]) -> Result<String> {
        let mut eligible: Vec<&Worker> = workers.iter().filter(|w| w.is_eligible()).collect();
        if eligible.is_empty() {
            return Err(AssignError::NoEligibleWorker(task.id.clone()));
        }
        eligible.sort_by(|a, b| a.id.cmp(&b.id));

        let chosen = match self.strategy {
            Strategy::LeastLoaded => least_loaded(&eligible),
            Strategy::RoundRobin => self.round_robin(&eligible),
            Strategy::Random => random(&eligible),
            Strategy::Tags => by_tags(task, &eligible),
        };

        chosen
            .map(|worker| worker.id.clone())
            .ok_or_else(|| AssignError::NoEligibleWorker(task.id.clone()))
    }

    /// Move the round-robin cursor past the last pick
    ///
    /// Called once the chosen worker's slot is actually reserved, so a
    /// refused reservation does not skip anyone.
    pub fn advance(&self) {
        if self.strategy == Strategy::RoundRobin {
            self.cursor.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn round_robin<'a>(&self, eligible: &[&'a Worker]) -> Option<&'a Worker> {
        let position = self.cursor.load(Ordering::Relaxed);
        eligible.get(position % eligible.len()).copied()
    }
}

/// Ties go to the lowest id
fn least_loaded<'a>(eligible: &[&'a Worker]) -> Option<&'a Worker> {
    eligible.iter().copied().min_by(|a, b| {
        a.load_percentage()
            .partial_cmp(&b.load_percentage())
            .unwrap_or(CmpOrdering::Equal)
            .then_with(|| a.id.cmp(&b.id))
    })
}

fn random<'a>(eligible: &[&'a Worker]) -> Option<&'a Worker> {
    eligible.choose(&mut rand::thread_rng()).copied()
}

fn by_tags<'a>(task: &Task, eligible: &[&'a Worker]) -> Option<&'a Worker> {
    let wanted = task.tags();
    let candidates: Vec<&Worker> = eligible
        .iter()
        .copied()
        .filter(|w| w.capabilities.matches_tags(&wanted))
        .collect();

    if candidates.is_empty() {
        tracing::debug!(task_id = %task.id, "No worker matches requested tags, falling back to least loaded");
        return least_loaded(eligible);
    }
    least_loaded(&candidates)
}
