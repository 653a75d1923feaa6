use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionPhase {
    Idle,
    Connecting,
    Open,
    Closed,
}

/// WebSocket close code sent by a backend that is up but not yet ready to
/// serve the stream. Recorded like any other close; callers may inspect it
/// to decide whether a retry is worthwhile.
pub const CLOSE_CODE_TRY_AGAIN_LATER: u16 = 1013;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConnectionState {
    pub phase: ConnectionPhase,
    pub endpoint: Option<String>,
    pub attempts: u32,
    pub last_close: Option<CloseInfo>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CloseInfo {
    pub code: u16,
    pub reason: String,
}

impl ConnectionState {
    pub fn idle() -> Self {
        Self {
            phase: ConnectionPhase::Idle,
            endpoint: None,
            attempts: 0,
            last_close: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.phase == ConnectionPhase::Open
    }
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::idle()
    }
}
