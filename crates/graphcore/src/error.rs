use thiserror::Error;

#[derive(Error, Debug)]
pub enum GraphError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Illegal state: {0}")]
    IllegalState(String),

    #[error("Cannot compute node '{node}' ({operation}): parameter '{parameter}' {reason}")]
    Computation {
        node: String,
        operation: String,
        parameter: String,
        reason: String,
    },

    #[error("Operation {operation} failed on node '{node}' with arguments [{arguments}]: {source}")]
    Invocation {
        node: String,
        operation: String,
        arguments: String,
        #[source]
        source: OperationError,
    },
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExpressionError {
    #[error("Cannot parse '{expression}' at {position}: {message}")]
    Parse {
        expression: String,
        position: usize,
        message: String,
    },

    #[error("Unknown identifier '{identifier}' (evaluating for '{node}')")]
    UnknownIdentifier { identifier: String, node: String },

    #[error("Expression '{expression}' evaluates to {actual}, expected {expected}")]
    Type {
        expression: String,
        expected: String,
        actual: String,
    },

    #[error("Arithmetic error in '{expression}': {message}")]
    Arithmetic { expression: String, message: String },
}

/// Errors raised by the closures wrapped inside an operation.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum OperationError {
    #[error("Missing argument: {0}")]
    MissingArgument(String),

    #[error("Invalid argument type for '{field}': expected {expected}, got {actual}")]
    InvalidArgumentType {
        field: String,
        expected: String,
        actual: String,
    },

    #[error("Execution failed: {0}")]
    Failed(String),
}
