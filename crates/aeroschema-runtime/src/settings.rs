use std::time::Duration;

/// Worker pool and deadline of one Run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSettings {
    /// Parallel extraction workers; clamped to `1..=MAX_WORKERS`.
    pub workers: usize,
    pub run_timeout: Duration,
    /// Subtrees buffered between the parser and the pool. Defaults to twice
    /// the worker count.
    pub queue_depth: Option<usize>,
}

impl RunSettings {
    pub const DEFAULT_WORKERS: usize = 12;
    pub const MAX_WORKERS: usize = 64;
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

    pub fn workers(&self) -> usize {
        self.workers.clamp(1, Self::MAX_WORKERS)
    }

    pub fn queue_depth(&self) -> usize {
        self.queue_depth.unwrap_or(2 * self.workers()).max(1)
    }
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            workers: Self::DEFAULT_WORKERS,
            run_timeout: Self::DEFAULT_TIMEOUT,
            queue_depth: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_count_is_clamped() {
        let zero = RunSettings {
            workers: 0,
            ..RunSettings::default()
        };
        assert_eq!(zero.workers(), 1);
        assert_eq!(zero.queue_depth(), 2);

        let huge = RunSettings {
            workers: 1000,
            ..RunSettings::default()
        };
        assert_eq!(huge.workers(), RunSettings::MAX_WORKERS);
    }

    #[test]
    fn explicit_queue_depth_wins() {
        let s = RunSettings {
            queue_depth: Some(3),
            ..RunSettings::default()
        };
        assert_eq!(s.queue_depth(), 3);
        assert_eq!(RunSettings::default().queue_depth(), 24);
    }
}
