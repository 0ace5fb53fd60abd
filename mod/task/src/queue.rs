use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Mutex;

use crate::model::Task;

/// Heap entry. Ordered so the max-heap pops the highest priority first and,
/// within a priority, the earliest-created task first.
struct TaskItem {
    task: Task,
}

impl PartialEq for TaskItem {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for TaskItem {}

impl PartialOrd for TaskItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TaskItem {
    fn cmp(&self, other: &Self) -> Ordering {
        self.task
            .priority
            .cmp(&other.task.priority)
            .then_with(|| other.task.created_at.cmp(&self.task.created_at))
    }
}

/// Thread-safe priority queue of admitted tasks awaiting dispatch.
pub struct PriorityQueue {
    items: Mutex<BinaryHeap<TaskItem>>,
}

impl Default for PriorityQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl PriorityQueue {
    pub fn new() -> Self {
        Self {
            items: Mutex::new(BinaryHeap::new()),
        }
    }

    pub fn enqueue(&self, task: Task) {
        self.items.lock().unwrap().push(TaskItem { task });
    }

    pub fn dequeue(&self) -> Option<Task> {
        self.items.lock().unwrap().pop().map(|item| item.task)
    }

    /// Highest-priority task without removing it.
    pub fn peek_id(&self) -> Option<String> {
        self.items
            .lock()
            .unwrap()
            .peek()
            .map(|item| item.task.id.clone())
    }

    pub fn len(&self) -> usize {
        self.items.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().unwrap().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::sample_task;

    fn task(priority: i64, created_at: &str) -> Task {
        let mut task = sample_task();
        task.priority = priority;
        task.created_at = created_at.into();
        task
    }

    #[test]
    fn higher_priority_pops_first() {
        let queue = PriorityQueue::new();
        queue.enqueue(task(1, "2026-01-01T00:00:00+00:00"));
        queue.enqueue(task(9, "2026-01-01T00:00:02+00:00"));
        queue.enqueue(task(5, "2026-01-01T00:00:01+00:00"));

        assert_eq!(queue.dequeue().unwrap().priority, 9);
        assert_eq!(queue.dequeue().unwrap().priority, 5);
        assert_eq!(queue.dequeue().unwrap().priority, 1);
        assert!(queue.dequeue().is_none());
    }

    #[test]
    fn equal_priority_is_fifo_by_creation() {
        let queue = PriorityQueue::new();
        let older = task(5, "2026-01-01T00:00:00+00:00");
        let newer = task(5, "2026-01-01T00:00:05+00:00");
        let older_id = older.id.clone();
        let newer_id = newer.id.clone();

        queue.enqueue(newer);
        queue.enqueue(older);

        assert_eq!(queue.dequeue().unwrap().id, older_id);
        assert_eq!(queue.dequeue().unwrap().id, newer_id);
    }

    #[test]
    fn peek_does_not_remove() {
        let queue = PriorityQueue::new();
        let t = task(5, "2026-01-01T00:00:00+00:00");
        let id = t.id.clone();
        queue.enqueue(t);

        assert_eq!(queue.peek_id().as_deref(), Some(id.as_str()));
        assert_eq!(queue.len(), 1);
        assert!(!queue.is_empty());
    }

    #[test]
    fn interleaved_drain_stays_ordered() {
        let queue = PriorityQueue::new();
        for (priority, ts) in [
            (3, "2026-01-01T00:00:00+00:00"),
            (7, "2026-01-01T00:00:01+00:00"),
            (7, "2026-01-01T00:00:00+00:00"),
            (10, "2026-01-01T00:00:09+00:00"),
        ] {
            queue.enqueue(task(priority, ts));
        }

        let order: Vec<(i64, String)> = std::iter::from_fn(|| queue.dequeue())
            .map(|t| (t.priority, t.created_at))
            .collect();
        assert_eq!(
            order,
            vec![
                (10, "2026-01-01T00:00:09+00:00".to_string()),
                (7, "2026-01-01T00:00:00+00:00".to_string()),
                (7, "2026-01-01T00:00:01+00:00".to_string()),
                (3, "2026-01-01T00:00:00+00:00".to_string()),
            ]
        );
    }
}
