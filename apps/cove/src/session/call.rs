use crate::protocol::CallAction;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CallState {
    #[default]
    Idle,
    Requesting,
    Incoming,
    Connecting,
    Active,
}

/// What the orchestrator has to do after a call transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallEffect {
    /// Tell the peer about our action.
    Notify(CallAction),
    /// Reply `busy` without changing state.
    ReplyBusy,
    /// Attach local media; the host also renegotiates.
    StartMedia,
    StopMedia,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidTransition {
    pub state: CallState,
    pub action: CallAction,
}

/// Call-invite state machine. Transitions return the side effects to perform.
#[derive(Debug, Default)]
pub struct CallMachine {
    state: CallState,
}

impl CallMachine {
    pub fn state(&self) -> CallState {
        self.state
    }

    pub fn local(&mut self, action: CallAction) -> Result<Vec<CallEffect>, InvalidTransition> {
        use CallAction::*;
        use CallState::*;
        let (next, effects) = match (self.state, action) {
            (Idle, Request) => (Requesting, vec![CallEffect::Notify(Request)]),
            (Incoming, Accept) => (
                Connecting,
                vec![CallEffect::Notify(Accept), CallEffect::StartMedia],
            ),
            (Incoming, Reject) => (Idle, vec![CallEffect::Notify(Reject)]),
            (Requesting, Cancel) => (Idle, vec![CallEffect::Notify(Cancel)]),
            (Connecting | Active, End) => {
                (Idle, vec![CallEffect::Notify(End), CallEffect::StopMedia])
            }
            (state, action) => return Err(InvalidTransition { state, action }),
        };
        self.state = next;
        Ok(effects)
    }

    /// Applies the peer's action. Unexpected actions are ignored.
    pub fn remote(&mut self, action: CallAction) -> Vec<CallEffect> {
        use CallAction::*;
        use CallState::*;
        let (next, effects) = match (self.state, action) {
            (Idle, Request) => (Incoming, Vec::new()),
            (_, Request) => return vec![CallEffect::ReplyBusy],
            (Requesting, Accept) => (Connecting, vec![CallEffect::StartMedia]),
            (Requesting, Reject | Busy) => (Idle, Vec::new()),
            (Incoming, Cancel) => (Idle, Vec::new()),
            (Connecting | Active, End) => (Idle, vec![CallEffect::StopMedia]),
            (Incoming | Requesting, End) => (Idle, Vec::new()),
            (state, _) => (state, Vec::new()),
        };
        self.state = next;
        effects
    }

    /// A media offer/answer exchange completed.
    pub fn media_negotiated(&mut self) -> bool {
        if self.state == CallState::Connecting {
            self.state = CallState::Active;
            true
        } else {
            false
        }
    }

    /// Drops back to idle, e.g. when the link is torn down. Returns whether anything changed.
    pub fn reset(&mut self) -> bool {
        let changed = self.state != CallState::Idle;
        self.state = CallState::Idle;
        changed
    }
}
