// SPDX-FileCopyrightText: 2025 Timothy Pogue
//
// SPDX-License-Identifier: ISC

use std::result;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ControllerError {
    #[error("kube api error: {0}")]
    KubeError(#[from] kube::Error),
    #[error("not found: {0}")]
    NotFoundError(String),
    #[error("conflict: {0}")]
    ConflictError(String),
    #[error("cluster {cluster} unreachable: {message}")]
    RemoteUnreachableError { cluster: String, message: String },
    #[error("owned elsewhere: {0}")]
    OwnershipError(String),
    #[error("invariant violated: {0}")]
    InvariantViolationError(String),
    #[error("missing object key: {0}")]
    MissingObjectKeyError(&'static str),
    #[error("serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
    #[error("kubeconfig error: {0}")]
    KubeconfigError(String),
    #[error("finalizer error: {0}")]
    FinalizerError(String),
    #[error("unknown error: {0}")]
    UnknownError(String),
}

impl ControllerError {
    pub fn unreachable(cluster: &str, message: impl ToString) -> Self {
        ControllerError::RemoteUnreachableError {
            cluster: cluster.to_string(),
            message: message.to_string(),
        }
    }

    /// Machine readable reason used when the error is surfaced as a condition
    pub fn reason(&self) -> &'static str {
        match self {
            ControllerError::RemoteUnreachableError { .. } => "ServiceClusterUnreachable",
            ControllerError::ConflictError(_) => "Conflict",
            ControllerError::NotFoundError(_) => "NotFound",
            ControllerError::OwnershipError(_) => "OwnedElsewhere",
            ControllerError::InvariantViolationError(_) => "InvariantViolation",
            ControllerError::KubeconfigError(_) => "InvalidKubeconfig",
            _ => "Error",
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, ControllerError::ConflictError(_))
    }
}

pub type Result<T> = result::Result<T, ControllerError>;
