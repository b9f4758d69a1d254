//! Small shared value types referenced by both the event bus and the
//! session: state change announcements and well-known state names.

/// A lifecycle/state announcement delivered on the event bus as a `State`
/// event. `params` is an open-ended payload (e.g. a hangup reason).
#[derive(Debug, Clone, PartialEq)]
pub struct StateChange {
    pub state: String,
    pub params: Vec<serde_json::Value>,
}

impl StateChange {
    pub fn new(state: impl Into<String>) -> Self {
        Self {
            state: state.into(),
            params: Vec::new(),
        }
    }

    pub fn with_params(state: impl Into<String>, params: Vec<serde_json::Value>) -> Self {
        Self {
            state: state.into(),
            params,
        }
    }
}

/// Well-known state names. `WILDCARD` matches any state in `Session::on`.
pub mod states {
    pub const BEGIN: &str = "begin";
    pub const END: &str = "end";
    pub const HANGUP: &str = "hangup";
    pub const SPEAKING_START: &str = "speaking.start";
    pub const SILENCE_START: &str = "silence.start";
    pub const TRANSCRIBING: &str = "transcribing";
    pub const SYNTHESIZING: &str = "synthesizing";
    pub const PLAY_START: &str = "play.start";
    pub const PLAY_STOP: &str = "play.stop";
    pub const COMPLETED: &str = "completed";
    pub const INTERRUPTION: &str = "interruption";
    pub const WILDCARD: &str = "*";
}

/// Direction a transport connector moves data in, relative to the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Input: packets flow from the transport into the session.
    Rx,
    /// Output: packets flow from the session to the transport.
    Tx,
}
