use serde::Serialize;

/// STOPPED -> STARTING -> RUNNING -> STOPPING -> STOPPED
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConsumerState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl ConsumerState {
    pub fn as_gauge(&self) -> i64 {
        match self {
            ConsumerState::Stopped => 0,
            ConsumerState::Starting => 1,
            ConsumerState::Running => 2,
            ConsumerState::Stopping => 3,
        }
    }
}

/// What happened to the messages still in flight when shutdown began.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    /// Finished inside the grace period and eligible for commit
    pub completed: usize,
    /// Aborted or interrupted; left uncommitted for redelivery
    pub abandoned: usize,
}
