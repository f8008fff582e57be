mod repl_error;

pub use repl_error::ReplError;

pub type CResult<T> = Result<T, ReplError>;
