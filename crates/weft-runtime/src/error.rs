//! Runtime error taxonomy.

use crate::states::StepState;

/// Errors raised by the evaluator and its collaborators.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RuntimeError {
    /// State machine advancement requested from a state outside the
    /// step's transition table.
    #[error("invalid step state {state} for step {step_id}")]
    InvalidStepState { step_id: String, state: StepState },

    /// Step lookup failed.
    #[error("step not found: {0}")]
    StepNotFound(String),

    /// Block lookup failed.
    #[error("block not found: {0}")]
    BlockNotFound(String),

    /// A reference named something that does not exist in the
    /// environment.
    #[error("unresolved reference: {0}")]
    Reference(String),

    /// The evaluator attempted to reduce a step whose sibling dependency
    /// was not complete. Indicates a defect in the compiled program.
    #[error("dependency not satisfied for statement {0}")]
    DependencyNotSatisfied(String),

    /// Reducer failure: type mismatch, division by zero, index out of
    /// range.
    #[error("evaluation error: {0}")]
    Evaluation(String),

    /// Committed state does not match the table's next-state for the
    /// committed prior state.
    #[error("invalid transition {from} -> {to}")]
    InvalidTransition { from: StepState, to: StepState },

    /// A concurrent writer won the compare-and-set; reload and retry.
    #[error("version mismatch on step {0}")]
    VersionMismatch(String),

    /// Handler module/entrypoint could not be resolved.
    #[error("load error: {0}")]
    Load(String),

    /// Handler ran and failed.
    #[error("handler error: {0}")]
    Handler(String),

    /// Subprocess handler timed out or exited non-zero.
    #[error("subprocess error: {0}")]
    Subprocess(String),

    /// Persistence failure.
    #[error("store error: {0}")]
    Store(String),
}

impl RuntimeError {
    /// Stable kind label carried on user-visible execution errors.
    pub fn kind_str(&self) -> &'static str {
        match self {
            Self::InvalidStepState { .. } => "InvalidStepState",
            Self::StepNotFound(_) => "StepNotFound",
            Self::BlockNotFound(_) => "BlockNotFound",
            Self::Reference(_) => "ReferenceError",
            Self::DependencyNotSatisfied(_) => "DependencyNotSatisfied",
            Self::Evaluation(_) => "EvaluationError",
            Self::InvalidTransition { .. } => "InvalidTransition",
            Self::VersionMismatch(_) => "VersionMismatch",
            Self::Load(_) => "LoadError",
            Self::Handler(_) => "HandlerError",
            Self::Subprocess(_) => "SubprocessError",
            Self::Store(_) => "StoreError",
        }
    }
}
