//! Optimistic on/off state for a device output.

/// Toggle state as the panel shows it.
///
/// A request moves to `Pending` and shows the target straight away. The
/// command outcome then either confirms the target or rolls back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToggleState {
    Confirmed(bool),
    Pending { previous: bool, target: bool },
    /// Last request failed; `value` is the rolled back state
    Failed { value: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToggleAction {
    Request(bool),
    Succeeded,
    Failed,
}

impl Default for ToggleState {
    fn default() -> Self {
        ToggleState::Confirmed(false)
    }
}

impl ToggleState {
    /// Value to display: the target while pending.
    pub fn value(&self) -> bool {
        match *self {
            ToggleState::Confirmed(value) => value,
            ToggleState::Pending { target, .. } => target,
            ToggleState::Failed { value } => value,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, ToggleState::Pending { .. })
    }

    /// Apply `action`. Requests while pending and outcomes without a
    /// pending request leave the state untouched.
    pub fn reduce(self, action: ToggleAction) -> Self {
        match (self, action) {
            (ToggleState::Pending { .. }, ToggleAction::Request(_)) => self,
            (state, ToggleAction::Request(target)) => ToggleState::Pending {
                previous: state.value(),
                target,
            },
            (ToggleState::Pending { target, .. }, ToggleAction::Succeeded) => {
                ToggleState::Confirmed(target)
            }
            (ToggleState::Pending { previous, .. }, ToggleAction::Failed) => {
                ToggleState::Failed { value: previous }
            }
            (state, _) => state,
        }
    }

    pub fn label(&self) -> String {
        let value = if self.value() { "on" } else { "off" };
        match self {
            ToggleState::Confirmed(_) => value.to_string(),
            ToggleState::Pending { .. } => format!("{} (pending)", value),
            ToggleState::Failed { .. } => format!("{} (failed)", value),
        }
    }
}
