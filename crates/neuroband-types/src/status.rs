use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;

pub const STATUS_LOG_CAPACITY: usize = 100;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackendState {
    Starting,
    Running,
    Stopping,
    Stopped,
    Error,
}

impl fmt::Display for BackendState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendState::Starting => write!(f, "starting"),
            BackendState::Running => write!(f, "running"),
            BackendState::Stopping => write!(f, "stopping"),
            BackendState::Stopped => write!(f, "stopped"),
            BackendState::Error => write!(f, "error"),
        }
    }
}

/// Snapshot of the supervised backend process, broadcast to observers on
/// every state change. The log ring keeps the most recent backend output
/// lines, oldest evicted first.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BackendStatus {
    pub state: BackendState,
    pub pid: Option<u32>,
    pub port: u16,
    pub uptime_secs: u64,
    pub last_error: Option<String>,
    pub recent_logs: VecDeque<String>,
}

impl BackendStatus {
    pub fn stopped(port: u16) -> Self {
        Self {
            state: BackendState::Stopped,
            pid: None,
            port,
            uptime_secs: 0,
            last_error: None,
            recent_logs: VecDeque::with_capacity(STATUS_LOG_CAPACITY),
        }
    }

    pub fn push_log(&mut self, line: String) {
        if self.recent_logs.len() >= STATUS_LOG_CAPACITY {
            self.recent_logs.pop_front();
        }
        self.recent_logs.push_back(line);
    }

    pub fn is_running(&self) -> bool {
        self.state == BackendState::Running
    }
}
