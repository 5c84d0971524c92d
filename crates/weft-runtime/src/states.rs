//! Step lifecycle state machine.
//!
//! Three transition tables — statement, block, yield — each a total map
//! on its domain with `StatementComplete` as the single terminal sink.
//! The table governing a step is selected once from its object type; the
//! evaluator drives each step through at most one transition per
//! iteration.
//!
//! `EventTransmit` is a side-state, not a table entry: a statement step
//! enters it from `StatementCaptureBegin` when its facet is an event
//! facet, and leaves it only through an external `continue_step`
//! (→ `StatementCaptureEnd`) or `fail_step` (→ `StatementError`).

use serde::{Deserialize, Serialize};

/// Lifecycle state of a step record.
///
/// Serialized in the dotted form the original wire format uses
/// (`"state.Created"`, `"state.EventTransmit"`, …).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StepState {
    #[serde(rename = "state.Created")]
    Created,
    #[serde(rename = "state.FacetInitBegin")]
    FacetInitBegin,
    #[serde(rename = "state.FacetInitEnd")]
    FacetInitEnd,
    #[serde(rename = "state.MixinBlocksBegin")]
    MixinBlocksBegin,
    #[serde(rename = "state.MixinBlocksEnd")]
    MixinBlocksEnd,
    #[serde(rename = "state.StatementBlocksBegin")]
    StatementBlocksBegin,
    #[serde(rename = "state.StatementBlocksEnd")]
    StatementBlocksEnd,
    #[serde(rename = "state.StatementCaptureBegin")]
    StatementCaptureBegin,
    #[serde(rename = "state.StatementCaptureEnd")]
    StatementCaptureEnd,
    #[serde(rename = "state.StatementComplete")]
    StatementComplete,
    #[serde(rename = "state.StatementError")]
    StatementError,
    #[serde(rename = "state.EventTransmit")]
    EventTransmit,
    #[serde(rename = "state.BlockInitBegin")]
    BlockInitBegin,
    #[serde(rename = "state.BlockInitEnd")]
    BlockInitEnd,
    #[serde(rename = "state.BlockExecutionBegin")]
    BlockExecutionBegin,
    #[serde(rename = "state.BlockExecutionContinue")]
    BlockExecutionContinue,
    #[serde(rename = "state.BlockExecutionEnd")]
    BlockExecutionEnd,
}

impl StepState {
    /// Terminal states: nothing advances past these.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::StatementComplete | Self::StatementError)
    }

    /// Successful terminal state.
    pub fn is_complete(self) -> bool {
        self == Self::StatementComplete
    }

    /// Error sink.
    pub fn is_error(self) -> bool {
        self == Self::StatementError
    }
}

impl std::fmt::Display for StepState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Render the serialized dotted form.
        let s = match self {
            Self::Created => "state.Created",
            Self::FacetInitBegin => "state.FacetInitBegin",
            Self::FacetInitEnd => "state.FacetInitEnd",
            Self::MixinBlocksBegin => "state.MixinBlocksBegin",
            Self::MixinBlocksEnd => "state.MixinBlocksEnd",
            Self::StatementBlocksBegin => "state.StatementBlocksBegin",
            Self::StatementBlocksEnd => "state.StatementBlocksEnd",
            Self::StatementCaptureBegin => "state.StatementCaptureBegin",
            Self::StatementCaptureEnd => "state.StatementCaptureEnd",
            Self::StatementComplete => "state.StatementComplete",
            Self::StatementError => "state.StatementError",
            Self::EventTransmit => "state.EventTransmit",
            Self::BlockInitBegin => "state.BlockInitBegin",
            Self::BlockInitEnd => "state.BlockInitEnd",
            Self::BlockExecutionBegin => "state.BlockExecutionBegin",
            Self::BlockExecutionContinue => "state.BlockExecutionContinue",
            Self::BlockExecutionEnd => "state.BlockExecutionEnd",
        };
        f.write_str(s)
    }
}

/// Discriminant selecting which transition table governs a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ObjectType {
    Workflow,
    VariableAssignment,
    YieldAssignment,
    AndThen,
    AndMap,
    AndMatch,
    Block,
    Foreach,
}

impl ObjectType {
    /// Block types own child steps and use the block table.
    pub fn is_block(self) -> bool {
        matches!(
            self,
            Self::AndThen | Self::AndMap | Self::AndMatch | Self::Block | Self::Foreach
        )
    }

    /// Statement types materialize a single facet invocation.
    pub fn is_statement(self) -> bool {
        matches!(self, Self::VariableAssignment | Self::YieldAssignment)
    }
}

/// A transition table: `(from, to)` pairs forming a total map on the
/// table's domain.
pub type TransitionTable = &'static [(StepState, StepState)];

use StepState::*;

/// Statement table, used by `VariableAssignment` and `Workflow`.
pub const STEP_TRANSITIONS: TransitionTable = &[
    (Created, FacetInitBegin),
    (FacetInitBegin, FacetInitEnd),
    (FacetInitEnd, MixinBlocksBegin),
    (MixinBlocksBegin, MixinBlocksEnd),
    (MixinBlocksEnd, StatementBlocksBegin),
    (StatementBlocksBegin, StatementBlocksEnd),
    (StatementBlocksEnd, StatementCaptureBegin),
    (StatementCaptureBegin, StatementCaptureEnd),
    (StatementCaptureEnd, StatementComplete),
];

/// Block table, used by `AndThen`, `AndMap`, `AndMatch`, `Block`,
/// `Foreach`. `BlockExecutionContinue` re-enters itself while unresolved
/// children remain; the table records only the advancing edge.
pub const BLOCK_TRANSITIONS: TransitionTable = &[
    (Created, BlockInitBegin),
    (BlockInitBegin, BlockInitEnd),
    (BlockInitEnd, BlockExecutionBegin),
    (BlockExecutionBegin, BlockExecutionContinue),
    (BlockExecutionContinue, BlockExecutionEnd),
    (BlockExecutionEnd, StatementComplete),
];

/// Yield table, used by `YieldAssignment`: the statement table with the
/// mixin and block phases pruned.
pub const YIELD_TRANSITIONS: TransitionTable = &[
    (Created, FacetInitBegin),
    (FacetInitBegin, FacetInitEnd),
    (FacetInitEnd, StatementCaptureBegin),
    (StatementCaptureBegin, StatementCaptureEnd),
    (StatementCaptureEnd, StatementComplete),
];

/// Select the transition table for an object type.
pub fn select_transitions(object_type: ObjectType) -> TransitionTable {
    match object_type {
        ObjectType::Workflow | ObjectType::VariableAssignment => STEP_TRANSITIONS,
        ObjectType::YieldAssignment => YIELD_TRANSITIONS,
        ObjectType::AndThen
        | ObjectType::AndMap
        | ObjectType::AndMatch
        | ObjectType::Block
        | ObjectType::Foreach => BLOCK_TRANSITIONS,
    }
}

/// Next state in the table, or `None` for terminal / unknown states.
pub fn get_next_state(state: StepState, table: TransitionTable) -> Option<StepState> {
    table
        .iter()
        .find(|(from, _)| *from == state)
        .map(|(_, to)| *to)
}

/// Whether `from -> to` is a legal committed transition for the given
/// object type: the table's next-state, the error sink, or the
/// `EventTransmit` entry/exit edges.
pub fn is_valid_transition(object_type: ObjectType, from: StepState, to: StepState) -> bool {
    if to == StepState::StatementError {
        return true;
    }
    if from == to {
        // Re-entrant block execution is the only non-advancing hold.
        return from == StepState::BlockExecutionContinue;
    }
    match (from, to) {
        (StepState::StatementCaptureBegin, StepState::EventTransmit) => true,
        (StepState::EventTransmit, StepState::StatementCaptureEnd) => true,
        _ => get_next_state(from, select_transitions(object_type)) == Some(to),
    }
}
