use std::collections::BTreeSet;
use std::sync::{Arc, RwLock};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GateState {
    #[default]
    Active,
    Paused,
}

#[derive(Debug, Default)]
struct GateInner {
    all: GateState,
    targets: BTreeSet<String>,
}

/// Operator switch that lets cycles run or skips them, globally or per target.
#[derive(Clone, Default)]
pub struct WatchGate {
    state: Arc<RwLock<GateInner>>,
}

impl WatchGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pause(&self, target: Option<&str>) {
        if let Ok(mut guard) = self.state.write() {
            match target {
                Some(id) => {
                    guard.targets.insert(id.to_string());
                }
                None => guard.all = GateState::Paused,
            }
        }
    }

    /// `None` lifts the global pause and every per-target pause.
    pub fn resume(&self, target: Option<&str>) {
        if let Ok(mut guard) = self.state.write() {
            match target {
                Some(id) => {
                    guard.targets.remove(id);
                }
                None => {
                    guard.all = GateState::Active;
                    guard.targets.clear();
                }
            }
        }
    }

    pub fn status(&self) -> GateState {
        self.state.read().map(|g| g.all).unwrap_or(GateState::Paused)
    }

    pub fn is_paused(&self, target: &str) -> bool {
        self.state
            .read()
            .map(|g| g.all == GateState::Paused || g.targets.contains(target))
            .unwrap_or(true)
    }
}
