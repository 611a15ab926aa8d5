use thiserror::Error;

use super::issuer::IssuerError;

/// Failures of an issuance run.
///
/// Domain-level failures abort the whole orchestration: DNS-01 multi-domain orders
/// are all-or-nothing.
#[derive(Error, Debug)]
pub enum IssuanceError {
    #[error("invalid domain format: {domain:?}")]
    InvalidDomainFormat { domain: String },
    #[error("challenge for {domain} is missing its {field}")]
    IncompleteChallenge { domain: String, field: &'static str },
    #[error("challenge validation failed for {domain}: authorization status {status}")]
    ChallengeValidationFailed { domain: String, status: String },
    #[error("challenge validation for {domain} timed out after {attempts} attempt(s)")]
    ChallengeValidationTimeout { domain: String, attempts: u32 },
    #[error("no DNS-01 challenge found in order")]
    NoChallengeFound,
    #[error(transparent)]
    Authority(#[from] IssuerError),
    #[error("DNS provider error: {0:#}")]
    DnsProvider(#[source] anyhow::Error),
    #[error("key material error: {0:#}")]
    KeyMaterial(#[source] anyhow::Error),
    #[error("certificate storage error: {0:#}")]
    Storage(#[source] anyhow::Error),
    #[error("configuration invalid: {0}")]
    Config(String),
}
