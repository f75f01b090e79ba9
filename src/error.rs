use std::path::PathBuf;

use thiserror::Error;

/// Result type alias using [`FeaError`].
pub type Result<T> = std::result::Result<T, FeaError>;

/// Errors that terminate a dataset run. None of them are retried.
#[derive(Error, Debug)]
pub enum FeaError {
    /// Malformed arguments, dataset files or configuration.
    #[error("input error: {0}")]
    Input(String),

    /// Requested sample row does not exist in the dataset file.
    #[error("sample index {index} out of range: {path} holds {rows} rows")]
    InvalidInputIndex {
        index: usize,
        rows: usize,
        path: PathBuf,
    },

    /// A material or displacement query landed outside the mesh.
    #[error("point ({x}, {y}) lies outside the domain")]
    DomainQueryOutOfRange { x: f64, y: f64 },

    #[error("mesher error: {0}")]
    Mesher(String),

    /// Linear algebra breakdown inside a Newton iteration.
    #[error("solver error: {0}")]
    Solver(String),

    #[error(
        "load step {step} (applied displacement {applied}) failed to converge after \
         {iterations} iterations, residual norm {residual:.3e}"
    )]
    NonlinearConvergenceFailure {
        step: usize,
        applied: f64,
        iterations: usize,
        residual: f64,
    },

    #[error("failed to write {path}: {source}")]
    OutputWriteFailure {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl FeaError {
    /// Process exit code reported by the binary for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            FeaError::Input(_) => 2,
            FeaError::NonlinearConvergenceFailure { .. } => 3,
            FeaError::InvalidInputIndex { .. } => 4,
            FeaError::DomainQueryOutOfRange { .. } => 5,
            FeaError::Mesher(_) => 6,
            FeaError::Solver(_) => 7,
            FeaError::OutputWriteFailure { .. } => 8,
        }
    }

    pub(crate) fn write_failure(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        FeaError::OutputWriteFailure {
            path: path.into(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_are_distinct_and_nonzero() {
        let errors = [
            FeaError::Input("x".into()),
            FeaError::NonlinearConvergenceFailure {
                step: 1,
                applied: 0.1,
                iterations: 50,
                residual: 1.0,
            },
            FeaError::InvalidInputIndex {
                index: 3,
                rows: 2,
                path: PathBuf::from("a.txt"),
            },
            FeaError::DomainQueryOutOfRange { x: -1.0, y: 0.0 },
            FeaError::Mesher("x".into()),
            FeaError::Solver("x".into()),
            FeaError::write_failure("out", std::io::Error::other("disk full")),
        ];

        let mut codes: Vec<i32> = errors.iter().map(FeaError::exit_code).collect();
        assert!(codes.iter().all(|c| *c != 0));
        codes.sort();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
    }

    #[test]
    fn convergence_failure_message_names_step() {
        let err = FeaError::NonlinearConvergenceFailure {
            step: 7,
            applied: 4.0,
            iterations: 50,
            residual: 2.5e-3,
        };
        let msg = err.to_string();
        assert!(msg.contains("load step 7"));
        assert!(msg.contains("applied displacement 4"));
    }
}
