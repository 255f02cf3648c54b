use crate::api::Error;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Operation {
    AddComment,
    DeleteComment,
    ToggleLike,
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Operation::AddComment => "add comment",
            Operation::DeleteComment => "delete comment",
            Operation::ToggleLike => "update like",
        })
    }
}

/// A failed user operation, whose optimistic effects have already been rolled back
#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
#[error("Failed to {op}: {error}")]
pub struct MutationError {
    pub op: Operation,
    #[source]
    pub error: Error,
}

impl MutationError {
    pub fn new(op: Operation, error: Error) -> MutationError {
        MutationError { op, error }
    }

    pub fn kind(&self) -> &Error {
        &self.error
    }
}
