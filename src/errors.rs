//! Analysis errors definition.

use crate::code::{Addr, Label};
use thiserror::Error;

pub type AnalysisResult<T> = Result<T, AnalysisError>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AnalysisError {
    #[error("the code object contains no instructions")]
    NoCode,

    #[error("duplicate label {0}")]
    DuplicateLabel(Label),

    #[error("jump to undefined label {0} at {1}")]
    UndefinedLabel(Label, Addr),

    #[error("no analysis results are available")]
    NotAnalyzed,

    #[error("no exit point was reached, the final state does not exist")]
    NoFinalState,
}
