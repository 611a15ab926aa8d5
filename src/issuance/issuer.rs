use std::fmt;

use thiserror::Error;

/// Operations the issuance workflow needs from a certificate authority.
///
/// Implementations own protocol plumbing (directory discovery, JWS signing, nonce
/// handling). Retrying transport failures, if any, happens inside the
/// implementation; errors returned here are propagated unchanged.
pub trait CertificateAuthority {
    /// Discovers the directory. Calling it again once initialized is a no-op.
    fn bootstrap(&self) -> Result<(), IssuerError>;
    /// Registers or loads the account bound to the configured account key.
    fn ensure_account(&self, contact_email: &str) -> Result<(), IssuerError>;
    fn create_order(&self, request: &OrderRequest) -> Result<OrderHandle, IssuerError>;
    fn authorizations(&self, order: &OrderHandle) -> Result<Vec<Authorization>, IssuerError>;
    /// Tells the authority the challenge response is in place.
    fn answer_challenge(&self, challenge: &ChallengeHandle) -> Result<(), IssuerError>;
    fn poll_authorization(
        &self,
        authorization: &AuthorizationHandle,
    ) -> Result<AuthorizationStatus, IssuerError>;
    /// Finalizes the order with the certificate key and returns the full chain PEM.
    fn finalize_and_fetch(
        &self,
        order: &OrderHandle,
        private_key_pem: &str,
    ) -> Result<String, IssuerError>;
}

/// Everything needed to place an order: the requested names (first one is the
/// primary identity) and the PEM encoded CSR covering them.
#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub domains: Vec<String>,
    pub csr_pem: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OrderHandle {
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AuthorizationHandle {
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChallengeHandle {
    pub id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeKind {
    Dns01,
    Http01,
    TlsAlpn01,
    Other,
}

impl ChallengeKind {
    pub fn from_type(raw: &str) -> Self {
        match raw {
            "dns-01" => Self::Dns01,
            "http-01" => Self::Http01,
            "tls-alpn-01" => Self::TlsAlpn01,
            _ => Self::Other,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Challenge {
    pub handle: ChallengeHandle,
    pub kind: ChallengeKind,
    /// Value to publish for the challenge; for DNS-01 this is the TXT content.
    pub proof: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthorizationStatus {
    Pending,
    Valid,
    Invalid,
    Expired,
    Deactivated,
    Revoked,
    Other(String),
}

impl fmt::Display for AuthorizationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => f.write_str("pending"),
            Self::Valid => f.write_str("valid"),
            Self::Invalid => f.write_str("invalid"),
            Self::Expired => f.write_str("expired"),
            Self::Deactivated => f.write_str("deactivated"),
            Self::Revoked => f.write_str("revoked"),
            Self::Other(raw) => f.write_str(raw),
        }
    }
}

/// Authority-side proof-of-control object for one domain in an order.
#[derive(Debug, Clone)]
pub struct Authorization {
    pub handle: AuthorizationHandle,
    /// Requested name including the `*.` prefix for wildcard authorizations.
    pub domain: String,
    pub status: AuthorizationStatus,
    pub challenges: Vec<Challenge>,
}

impl Authorization {
    pub fn find_challenge(&self, kind: ChallengeKind) -> Option<&Challenge> {
        self.challenges.iter().find(|challenge| challenge.kind == kind)
    }
}

#[derive(Error, Debug)]
pub enum IssuerError {
    #[error("issuer unavailable: {0}")]
    Unavailable(String),
    #[error("issuer configuration invalid: {0}")]
    InvalidConfig(String),
    #[error("issuer operation failed: {0}")]
    Operation(String),
}
