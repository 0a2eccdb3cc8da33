use std::collections::VecDeque;
use std::sync::Mutex;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Manual,
    Schedule,
    Remote,
}

impl Trigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Trigger::Manual => "manual",
            Trigger::Schedule => "schedule",
            Trigger::Remote => "remote",
        }
    }
}

#[derive(Debug, Clone)]
pub enum TaskTarget {
    Check { monitor_id: String },
    Script { job_id: String, run_id: String, payload: serde_json::Value },
}

#[derive(Debug, Clone)]
pub struct Task {
    pub id: String,
    pub trigger: Trigger,
    pub target: TaskTarget,
}

#[derive(Debug, Error)]
#[error("execution capacity exhausted ({running} running, {queued} queued)")]
pub struct CapacityError {
    pub running: usize,
    pub queued: usize,
}

#[derive(Debug)]
pub enum Admitted {
    /// A running slot was free; the caller must execute the task now.
    Run(Task),
    Enqueued,
}

struct QueueState {
    running: usize,
    queued: VecDeque<Task>,
}

/// Global execution gate: at most `running_capacity` tasks execute at once,
/// at most `queued_capacity` wait behind them. Anything past that is
/// rejected rather than buffered.
pub struct AdmissionQueue {
    state: Mutex<QueueState>,
    running_capacity: usize,
    queued_capacity: usize,
}

impl AdmissionQueue {
    pub fn new(running_capacity: usize, queued_capacity: usize) -> Self {
        AdmissionQueue {
            state: Mutex::new(QueueState { running: 0, queued: VecDeque::new() }),
            running_capacity,
            queued_capacity,
        }
    }

    pub fn submit(&self, task: Task) -> Result<Admitted, CapacityError> {
        let mut state = self.state.lock().unwrap();
        if state.running < self.running_capacity {
            state.running += 1;
            Ok(Admitted::Run(task))
        } else if state.queued.len() < self.queued_capacity {
            state.queued.push_back(task);
            Ok(Admitted::Enqueued)
        } else {
            Err(CapacityError { running: state.running, queued: state.queued.len() })
        }
    }

    /// Marks one running task finished. If a task was waiting, its promotion
    /// inherits the freed slot and the caller must execute it.
    pub fn complete(&self) -> Option<Task> {
        let mut state = self.state.lock().unwrap();
        match state.queued.pop_front() {
            Some(next) => Some(next),
            None => {
                state.running = state.running.saturating_sub(1);
                None
            }
        }
    }

    pub fn counts(&self) -> (usize, usize) {
        let state = self.state.lock().unwrap();
        (state.running, state.queued.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(id: &str) -> Task {
        Task {
            id: id.to_string(),
            trigger: Trigger::Manual,
            target: TaskTarget::Check { monitor_id: format!("mon-{id}") },
        }
    }

    #[test]
    fn admits_until_running_capacity_then_queues() {
        let q = AdmissionQueue::new(2, 2);
        assert!(matches!(q.submit(task("a")), Ok(Admitted::Run(_))));
        assert!(matches!(q.submit(task("b")), Ok(Admitted::Run(_))));
        assert!(matches!(q.submit(task("c")), Ok(Admitted::Enqueued)));
        assert_eq!(q.counts(), (2, 1));
    }

    #[test]
    fn rejects_when_saturated_without_mutating_counts() {
        let q = AdmissionQueue::new(1, 1);
        q.submit(task("a")).unwrap();
        q.submit(task("b")).unwrap();
        let err = q.submit(task("c")).unwrap_err();
        assert_eq!((err.running, err.queued), (1, 1));
        assert_eq!(q.counts(), (1, 1));
    }

    #[test]
    fn completion_promotes_in_fifo_order() {
        let q = AdmissionQueue::new(1, 3);
        q.submit(task("a")).unwrap();
        q.submit(task("b")).unwrap();
        q.submit(task("c")).unwrap();
        let next = q.complete().unwrap();
        assert_eq!(next.id, "b");
        // promoted task inherits the slot, so running stays at capacity
        assert_eq!(q.counts(), (1, 1));
        let next = q.complete().unwrap();
        assert_eq!(next.id, "c");
        assert_eq!(q.counts(), (1, 0));
    }

    #[test]
    fn completion_with_empty_queue_frees_the_slot() {
        let q = AdmissionQueue::new(1, 1);
        q.submit(task("a")).unwrap();
        assert!(q.complete().is_none());
        assert_eq!(q.counts(), (0, 0));
        // freed slot admits again
        assert!(matches!(q.submit(task("d")), Ok(Admitted::Run(_))));
    }

    #[test]
    fn counts_stay_bounded_under_churn() {
        let q = AdmissionQueue::new(3, 2);
        for i in 0..200 {
            if i % 3 == 0 {
                q.complete();
            } else {
                let _ = q.submit(task(&i.to_string()));
            }
            let (running, queued) = q.counts();
            assert!(running <= 3, "running {} exceeded capacity at step {}", running, i);
            assert!(queued <= 2, "queued {} exceeded capacity at step {}", queued, i);
        }
    }
}
