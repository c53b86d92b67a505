//! Errors that abort a run

use std::path::PathBuf;

use thiserror::Error;

use crate::diagnostics::Diagnostics;
use crate::image::ImageError;

/// Failures that leave nothing to verify
#[derive(Debug, Error)]
pub enum CheckError {
    #[error(transparent)]
    Image(#[from] ImageError),

    #[error("unable to load contracts from file {}", path.display())]
    Contracts {
        path: PathBuf,
        diagnostics: Diagnostics,
    },

    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl CheckError {
    /// Positioned warnings explaining the failure, if any.
    pub fn diagnostics(&self) -> Option<&Diagnostics> {
        match self {
            CheckError::Contracts { diagnostics, .. } => Some(diagnostics),
            _ => None,
        }
    }
}
