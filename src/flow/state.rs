//! Run-level state machine and its transition table.

use crate::stage::BranchKind;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Status of a run. `Done` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FlowState {
    Validated,
    Scanning,
    Branching,
    Joining,
    Artifacts,
    Done,
    Failed,
}

impl FlowState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validated => "VALIDATED",
            Self::Scanning => "SCANNING",
            Self::Branching => "BRANCHING",
            Self::Joining => "JOINING",
            Self::Artifacts => "ARTIFACTS",
            Self::Done => "DONE",
            Self::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

impl fmt::Display for FlowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FlowState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "VALIDATED" => Ok(Self::Validated),
            "SCANNING" => Ok(Self::Scanning),
            "BRANCHING" => Ok(Self::Branching),
            "JOINING" => Ok(Self::Joining),
            "ARTIFACTS" => Ok(Self::Artifacts),
            "DONE" => Ok(Self::Done),
            "FAILED" => Ok(Self::Failed),
            _ => Err(format!("Invalid flow state: {}", s)),
        }
    }
}

/// Events that move a run between states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowEvent {
    ScanDispatched,
    ScanSucceeded,
    /// One branch reached its terminal outcome; the run stays in `Branching`.
    BranchResolved,
    AllBranchesResolved,
    SynthesisSucceeded,
    ArtifactsMaterialized,
    Unrecoverable,
}

/// `(from, event, to)` edges a run may take.
pub const TRANSITIONS: &[(FlowState, FlowEvent, FlowState)] = &[
    (FlowState::Validated, FlowEvent::ScanDispatched, FlowState::Scanning),
    (FlowState::Validated, FlowEvent::Unrecoverable, FlowState::Failed),
    (FlowState::Scanning, FlowEvent::ScanSucceeded, FlowState::Branching),
    (FlowState::Scanning, FlowEvent::Unrecoverable, FlowState::Failed),
    (FlowState::Branching, FlowEvent::BranchResolved, FlowState::Branching),
    (FlowState::Branching, FlowEvent::AllBranchesResolved, FlowState::Joining),
    (FlowState::Branching, FlowEvent::Unrecoverable, FlowState::Failed),
    (FlowState::Joining, FlowEvent::SynthesisSucceeded, FlowState::Artifacts),
    (FlowState::Joining, FlowEvent::Unrecoverable, FlowState::Failed),
    (FlowState::Artifacts, FlowEvent::ArtifactsMaterialized, FlowState::Done),
    (FlowState::Artifacts, FlowEvent::Unrecoverable, FlowState::Failed),
];

/// Target state for `event` fired in `from`, if the table allows it.
pub fn next_state(from: FlowState, event: FlowEvent) -> Option<FlowState> {
    TRANSITIONS
        .iter()
        .find(|(f, e, _)| *f == from && *e == event)
        .map(|(_, _, to)| *to)
}

/// Whether `from -> to` is an edge of the table.
pub fn is_valid_edge(from: FlowState, to: FlowState) -> bool {
    TRANSITIONS.iter().any(|(f, _, t)| *f == from && *t == to)
}

/// Pipeline node a transition is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowNode {
    Start,
    Scanner,
    Branch(BranchKind),
    Join,
    Artifacts,
}

impl FlowNode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Scanner => "scanner",
            Self::Branch(kind) => kind.as_str(),
            Self::Join => "join",
            Self::Artifacts => "artifacts",
        }
    }
}

impl fmt::Display for FlowNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FlowNode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "start" => Ok(Self::Start),
            "scanner" => Ok(Self::Scanner),
            "join" => Ok(Self::Join),
            "artifacts" => Ok(Self::Artifacts),
            other => other
                .parse::<BranchKind>()
                .map(Self::Branch)
                .map_err(|_| format!("Invalid flow node: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(FlowState::Done.is_terminal());
        assert!(FlowState::Failed.is_terminal());
        assert!(!FlowState::Branching.is_terminal());
        assert!(!FlowState::Validated.is_terminal());
    }

    #[test]
    fn test_happy_path_follows_table() {
        let mut state = FlowState::Validated;
        for event in [
            FlowEvent::ScanDispatched,
            FlowEvent::ScanSucceeded,
            FlowEvent::BranchResolved,
            FlowEvent::AllBranchesResolved,
            FlowEvent::SynthesisSucceeded,
            FlowEvent::ArtifactsMaterialized,
        ] {
            state = next_state(state, event).expect("edge should exist");
        }
        assert_eq!(state, FlowState::Done);
    }

    #[test]
    fn test_every_non_terminal_state_can_fail() {
        for state in [
            FlowState::Validated,
            FlowState::Scanning,
            FlowState::Branching,
            FlowState::Joining,
            FlowState::Artifacts,
        ] {
            assert_eq!(
                next_state(state, FlowEvent::Unrecoverable),
                Some(FlowState::Failed)
            );
        }
    }

    #[test]
    fn test_terminal_states_have_no_outgoing_edges() {
        for (from, _, _) in TRANSITIONS {
            assert!(!from.is_terminal());
        }
        assert!(!is_valid_edge(FlowState::Done, FlowState::Failed));
        assert!(!is_valid_edge(FlowState::Failed, FlowState::Scanning));
    }

    #[test]
    fn test_skipping_stages_is_rejected() {
        assert!(!is_valid_edge(FlowState::Validated, FlowState::Branching));
        assert!(!is_valid_edge(FlowState::Scanning, FlowState::Joining));
        assert!(!is_valid_edge(FlowState::Joining, FlowState::Branching));
        assert!(is_valid_edge(FlowState::Branching, FlowState::Branching));
    }

    #[test]
    fn test_state_and_node_parse() {
        for (_, _, to) in TRANSITIONS {
            assert_eq!(to.as_str().parse::<FlowState>().unwrap(), *to);
        }
        assert_eq!(
            "security".parse::<FlowNode>().unwrap(),
            FlowNode::Branch(BranchKind::Security)
        );
        assert_eq!("join".parse::<FlowNode>().unwrap(), FlowNode::Join);
        assert!("roadmap".parse::<FlowNode>().is_err());
    }
}
