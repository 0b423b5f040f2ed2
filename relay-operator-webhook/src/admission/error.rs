use thiserror::Error;
use std::result::Result;

use relay_operator_controller::error::ControllerError;

#[derive(Error, Debug)]
pub enum AdmissionError {
    #[error("invalid group: {0} is not of the form <serviceCluster>.<providerNamespace>")]
    InvalidGroup(String),
    #[error("no ObjectMirror in {0} mirrors {1}")]
    NotMirrored(String, String),
    #[error("namespace {0} is not yet set up in ServiceCluster {1}")]
    MappingNotReady(String, String),
    #[error("rejected by ServiceCluster {0}: {1}")]
    Rejected(String, String),
    #[error("missing field: {0}")]
    MissingField(&'static str),
    #[error(transparent)]
    ControllerError(#[from] ControllerError),
}

pub type AdmissionResult<T> = Result<T, AdmissionError>;
