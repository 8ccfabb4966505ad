use thiserror::Error;

/// Errors from option validation.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum OptionError {
    /// The option is not declared in the module's schema.
    #[error("undeclared option: {0}")]
    Undeclared(String),

    /// The supplied value cannot be coerced to the declared type.
    #[error("option {option}: expected {expected}, got {found}")]
    Coercion {
        option: String,
        expected: String,
        found: String,
    },

    /// The option values could not be encoded.
    #[error("cannot encode options: {0}")]
    Encoding(String),
}

pub type OptionResult<T> = Result<T, OptionError>;
