//! Common types for the reconfig environment abstraction.

/// Identity of a cooperative task.
///
/// Every task spawned through a [`ReconfigContext`](crate::ReconfigContext)
/// gets a unique, monotonically increasing id. Channels that care about
/// *who* is calling (single-writer signals, for example) compare task ids,
/// which is why driver objects replay calls from one dedicated task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(pub u64);

impl TaskId {
    /// Returns the raw numeric id.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "task#{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_id_display() {
        assert_eq!(TaskId(7).to_string(), "task#7");
        assert_eq!(TaskId(7).as_u64(), 7);
    }
}
