//! Reproducible per-category task order.

use std::sync::Arc;

use ahash::AHashMap;
use log::debug;
use parking_lot::Mutex;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;

use crate::error::{NrtError, Result};
use crate::task::{Task, TaskLog};

/// Seed of the subset selection. Fixed so every run replays the same tasks.
const SELECTION_SEED: u64 = 0;

/// Default number of tasks kept per category.
pub const DEFAULT_TASKS_PER_CATEGORY: usize = 5;

#[derive(Debug)]
struct CategoryQueue {
    tasks: Vec<Arc<Task>>,
    order: Vec<usize>,
    cursor: usize,
    rng: StdRng,
}

impl CategoryQueue {
    fn new(tasks: Vec<Arc<Task>>, rng: StdRng) -> Self {
        let mut queue = CategoryQueue {
            order: (0..tasks.len()).collect(),
            tasks,
            cursor: 0,
            rng,
        };
        queue.order.shuffle(&mut queue.rng);
        queue
    }

    fn next(&mut self) -> Arc<Task> {
        if self.cursor == self.order.len() {
            self.order.shuffle(&mut self.rng);
            self.cursor = 0;
        }
        let task = Arc::clone(&self.tasks[self.order[self.cursor]]);
        self.cursor += 1;
        task
    }
}

/// Hands out tasks per category in an order fixed by the seed.
///
/// Two schedulers built from the same log, seed and `tasks_per_category`
/// return the same sequence from `next_task` for every category.
#[derive(Debug)]
pub struct TaskScheduler {
    categories: Vec<String>,
    queues: AHashMap<String, Mutex<CategoryQueue>>,
}

impl TaskScheduler {
    /// Build a scheduler over `log`.
    ///
    /// Each category keeps at most `tasks_per_category` of its tasks. Fails if
    /// a task does not parse or if the log is empty.
    pub fn new(log: &TaskLog, seed: u64, tasks_per_category: usize) -> Result<Self> {
        if tasks_per_category == 0 {
            return Err(NrtError::invalid_config("tasks_per_category must be positive"));
        }
        if log.is_empty() {
            return Err(NrtError::query("task log has no tasks"));
        }

        let mut selection = StdRng::seed_from_u64(SELECTION_SEED);
        let mut categories = Vec::new();
        let mut queues = AHashMap::new();

        for (rank, category) in log.categories().into_iter().enumerate() {
            let mut tasks = log
                .entries_for(category)
                .map(|entry| {
                    Task::new(entry.category.as_str(), entry.text.as_str())
                        .map(Arc::new)
                        .map_err(|e| NrtError::query(format!("line {}: {e}", entry.line)))
                })
                .collect::<Result<Vec<_>>>()?;
            tasks.shuffle(&mut selection);
            tasks.truncate(tasks_per_category);

            debug!("category {category}: {} tasks", tasks.len());
            let rng = StdRng::seed_from_u64(seed.wrapping_add(rank as u64));
            queues.insert(category.to_string(), Mutex::new(CategoryQueue::new(tasks, rng)));
            categories.push(category.to_string());
        }

        Ok(TaskScheduler { categories, queues })
    }

    /// Categories in the order they first appear in the log.
    pub fn categories(&self) -> &[String] {
        &self.categories
    }

    /// Number of tasks kept for `category`.
    pub fn task_count(&self, category: &str) -> usize {
        self.queues
            .get(category)
            .map(|queue| queue.lock().tasks.len())
            .unwrap_or(0)
    }

    /// The next task of `category`.
    pub fn next_task(&self, category: &str) -> Result<Arc<Task>> {
        let queue = self
            .queues
            .get(category)
            .ok_or_else(|| NrtError::query(format!("unknown task category {category:?}")))?;
        Ok(queue.lock().next())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LOG: &str = "\
Term: united
Term: states
Term: america
Term: people
Term: government
Term: history
Term: world
Prefix: uni*
Prefix: sta*
Respell: unitde
";

    fn texts(scheduler: &TaskScheduler, category: &str, n: usize) -> Vec<String> {
        (0..n)
            .map(|_| scheduler.next_task(category).unwrap().text().to_string())
            .collect()
    }

    #[test]
    fn test_same_seed_same_order() {
        let log = TaskLog::parse(LOG).unwrap();
        let a = TaskScheduler::new(&log, 42, 5).unwrap();
        let b = TaskScheduler::new(&log, 42, 5).unwrap();

        for category in ["Term", "Prefix", "Respell"] {
            assert_eq!(texts(&a, category, 23), texts(&b, category, 23));
        }
    }

    #[test]
    fn test_subset_is_capped_and_independent_of_seed() {
        let log = TaskLog::parse(LOG).unwrap();
        let a = TaskScheduler::new(&log, 1, 5).unwrap();
        let b = TaskScheduler::new(&log, 2, 5).unwrap();
        assert_eq!(a.task_count("Term"), 5);
        assert_eq!(a.task_count("Prefix"), 2);

        let mut seen_a = texts(&a, "Term", 5);
        let mut seen_b = texts(&b, "Term", 5);
        seen_a.sort();
        seen_b.sort();
        assert_eq!(seen_a, seen_b);
    }

    #[test]
    fn test_every_task_once_per_round() {
        let log = TaskLog::parse(LOG).unwrap();
        let scheduler = TaskScheduler::new(&log, 9, 10).unwrap();
        for _ in 0..3 {
            let mut round = texts(&scheduler, "Term", 7);
            round.sort();
            round.dedup();
            assert_eq!(round.len(), 7);
        }
    }

    #[test]
    fn test_categories_and_unknown_category() {
        let log = TaskLog::parse(LOG).unwrap();
        let scheduler = TaskScheduler::new(&log, 0, 5).unwrap();
        assert_eq!(scheduler.categories(), ["Term", "Prefix", "Respell"]);
        assert!(matches!(scheduler.next_task("Fuzzy1"), Err(NrtError::Query(_))));
    }

    #[test]
    fn test_rejects_bad_input() {
        assert!(TaskScheduler::new(&TaskLog::parse("").unwrap(), 0, 5).is_err());
        let log = TaskLog::parse(LOG).unwrap();
        assert!(TaskScheduler::new(&log, 0, 0).is_err());
        let bad = TaskLog::parse("Fuzzy: x~9\n").unwrap();
        assert!(TaskScheduler::new(&bad, 0, 5).is_err());
    }
}
