//! Error types.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use trust_dns_proto::error::ProtoError;

/// The step of the publishing procedure a failure happened in. The recovery action differs per
/// stage: a `Validate` failure means nothing reached the daemon, a `Reload` failure means the
/// artifact is in place but the daemon may still be serving the previous configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Render,
    Validate,
    Activate,
    Reload,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Render => "render",
            Stage::Validate => "validate",
            Stage::Activate => "activate",
            Stage::Reload => "reload",
        };
        f.write_str(name)
    }
}

/// Error enumerates the possible hostcrab error states.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Returned when a publishing step for `target` (a zone, a vhost, certificate material)
    /// fails. Wraps the underlying cause and tags it with the [`Stage`] it happened in.
    #[error("{stage} stage failed for {target}")]
    Stage {
        stage: Stage,
        target: String,
        #[source]
        source: Box<Error>,
    },

    /// Returned when the backend's native syntax checker rejects a rendered artifact. The
    /// previously active artifact is left in place and the daemon is not reloaded.
    #[error("{target} failed validation: {output}")]
    Invalid { target: String, output: String },

    /// Returned when an external command exits unsuccessfully.
    #[error("command `{command}` exited with status {status:?}: {output}")]
    CommandFailed {
        command: String,
        status: Option<i32>,
        output: String,
    },

    /// Returned when an external command does not finish within its timeout. The child process
    /// is killed.
    #[error("command `{command}` timed out after {timeout:?}")]
    CommandTimeout { command: String, timeout: Duration },

    /// Returned when the ACME transport fails to produce certificate material.
    #[error("certificate request for {domain} failed: {reason}")]
    Acme { domain: String, reason: String },

    /// Returned when a private key does not belong to the certificate it is installed with.
    /// Raised before any driver is called.
    #[error("certificate and private key do not match")]
    CertificateMismatch,

    /// Returned when certificate material can't be parsed.
    #[error("invalid certificate: {0}")]
    InvalidCertificate(String),

    /// Returned when a private key can't be sealed or unsealed.
    #[error("private key sealing failed: {0}")]
    Seal(String),

    /// Returned when a certificate lifecycle transition isn't permitted.
    #[error("certificate for {domain} can't move from {from} to {to}")]
    InvalidTransition {
        domain: String,
        from: String,
        to: String,
    },

    #[error("domain \"{0}\" not found")]
    DomainNotFound(String),

    #[error("zone \"{0}\" not found")]
    ZoneNotFound(String),

    #[error("record {id} not found in zone \"{zone}\"")]
    RecordNotFound { zone: String, id: u64 },

    #[error("no certificate for \"{0}\"")]
    CertificateNotFound(String),

    /// Returned for hostnames that aren't valid DNS names.
    #[error("invalid domain name \"{0}\"")]
    InvalidName(String),

    /// Returned when a DNS record fails validation before it is rendered.
    #[error("invalid {record_type} record \"{name}\": {reason}")]
    InvalidRecord {
        name: String,
        record_type: String,
        reason: String,
    },

    /// Returned when removing a record the zone can't exist without (its SOA, or its last apex
    /// NS record).
    #[error("record \"{0}\" is required by the zone and can't be removed")]
    ProtectedRecord(String),

    /// Returned when a document root is outside the owning account's home directory.
    #[error("document root {path:?} is outside of {home:?}")]
    InvalidDocumentRoot { path: PathBuf, home: PathBuf },

    /// Returned when the configuration file is structurally valid JSON but semantically
    /// unusable.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Returned when a generic IO error occurs.
    #[error("an IO error occurred")]
    IO(#[from] std::io::Error),

    /// Returned when processing JSON from disk (the config, the state store) fails due to
    /// invalid JSON content.
    #[error("invalid JSON")]
    InvalidJSON(#[from] serde_json::Error),

    /// Returned when the PowerDNS database can't be read or written.
    #[error("record table error: {0}")]
    Database(#[from] sea_orm::DbErr),

    /// Returned when a DNS name can't be parsed.
    #[error("DNS error")]
    DNSError(#[from] ProtoError),
}

impl Error {
    /// Wrap this error with the publishing stage it happened in. Errors that already carry a
    /// stage keep their original one.
    pub fn at(self, stage: Stage, target: impl Into<String>) -> Error {
        match self {
            err @ (Error::Stage { .. } | Error::Invalid { .. }) => err,
            err => Error::Stage {
                stage,
                target: target.into(),
                source: Box::new(err),
            },
        }
    }

    /// The publishing stage this error is tagged with, if any.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            Error::Stage { stage, .. } => Some(*stage),
            Error::Invalid { .. } => Some(Stage::Validate),
            _ => None,
        }
    }
}

/// Extension for tagging fallible publishing steps with their [`Stage`].
pub trait StageExt<T> {
    fn at_stage(self, stage: Stage, target: &str) -> Result<T, Error>;
}

impl<T, E: Into<Error>> StageExt<T> for Result<T, E> {
    fn at_stage(self, stage: Stage, target: &str) -> Result<T, Error> {
        self.map_err(|err| err.into().at(stage, target))
    }
}
