use crate::base::JobId;

#[derive(Debug, Display, Error, From)]
pub enum SquallError {
    /// The registry has no entry for this id. Ids of evicted jobs are
    /// indistinguishable from ids that were never handed out.
    #[from(skip)]
    #[display("Unknown job: {_0}")]
    UnknownJob(#[error(not(source))] JobId),

    /// The job observed its stop flag at a checkpoint and unwound.
    #[from(skip)]
    #[display("Job was stopped: {_0}")]
    JobStopped(#[error(not(source))] JobId),

    #[display("Evaluation failed: {}", _0)]
    Eval(#[error(not(source))] String),

    #[display("Squall error: {}", _0)]
    Other(#[error(not(source))] &'static str),
}

pub type SquallResult<T> = Result<T, SquallError>;
