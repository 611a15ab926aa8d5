use log::{info, warn};

use crate::domain::{DnsCoordinate, decompose};

use super::error::IssuanceError;
use super::issuer::{Authorization, AuthorizationHandle, ChallengeHandle, ChallengeKind};

/// One domain's DNS-01 challenge, ready for orchestration.
#[derive(Debug, Clone)]
pub struct ChallengeDescriptor {
    domain: String,
    authorization: AuthorizationHandle,
    challenge: ChallengeHandle,
    validation_value: String,
}

impl ChallengeDescriptor {
    pub fn new(
        domain: impl Into<String>,
        authorization: AuthorizationHandle,
        challenge: ChallengeHandle,
        validation_value: impl Into<String>,
    ) -> Result<Self, IssuanceError> {
        let domain = domain.into();
        let validation_value = validation_value.into();
        let missing = if domain.trim().is_empty() {
            Some("domain")
        } else if authorization.id.is_empty() {
            Some("authorization handle")
        } else if challenge.id.is_empty() {
            Some("challenge handle")
        } else if validation_value.is_empty() {
            Some("validation value")
        } else {
            None
        };
        if let Some(field) = missing {
            return Err(IssuanceError::IncompleteChallenge { domain, field });
        }
        Ok(Self {
            domain,
            authorization,
            challenge,
            validation_value,
        })
    }

    /// Builds the descriptor from an authorization's DNS-01 challenge. Returns
    /// `Ok(None)` when the authorization offers no DNS-01 challenge.
    pub fn from_authorization(authz: &Authorization) -> Result<Option<Self>, IssuanceError> {
        let Some(challenge) = authz.find_challenge(ChallengeKind::Dns01) else {
            return Ok(None);
        };
        let proof = challenge.proof.clone().unwrap_or_default();
        Self::new(
            authz.domain.clone(),
            authz.handle.clone(),
            challenge.handle.clone(),
            proof,
        )
        .map(Some)
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn authorization(&self) -> &AuthorizationHandle {
        &self.authorization
    }

    pub fn challenge(&self) -> &ChallengeHandle {
        &self.challenge
    }

    pub fn validation_value(&self) -> &str {
        &self.validation_value
    }
}

/// Collects one descriptor per authorization that carries a DNS-01 challenge.
pub fn collect_dns_challenges(
    authorizations: &[Authorization],
) -> Result<Vec<ChallengeDescriptor>, IssuanceError> {
    let mut descriptors = Vec::with_capacity(authorizations.len());
    for authz in authorizations {
        match ChallengeDescriptor::from_authorization(authz)? {
            Some(descriptor) => {
                info!(
                    "[challenge] {} expects TXT value {}",
                    descriptor.domain(),
                    descriptor.validation_value()
                );
                descriptors.push(descriptor);
            }
            None => warn!(
                "[challenge] authorization for {} offers no dns-01 challenge; skipping",
                authz.domain
            ),
        }
    }
    if descriptors.is_empty() {
        return Err(IssuanceError::NoChallengeFound);
    }
    Ok(descriptors)
}

/// Cleanup unit: the TXT record published for one requested domain.
///
/// Identity is `(host_record, domain)`; `base_domain` is derived from `domain` and
/// carried along so cleanup can address the DNS zone.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RecordKey {
    pub host_record: String,
    pub domain: String,
    pub base_domain: String,
}

impl RecordKey {
    pub fn new(domain: &str, coordinate: &DnsCoordinate) -> Self {
        Self {
            host_record: coordinate.host_record.clone(),
            domain: domain.to_string(),
            base_domain: coordinate.base_domain.clone(),
        }
    }

    pub fn for_domain(domain: &str) -> Result<Self, IssuanceError> {
        let coordinate = decompose(domain)?;
        Ok(Self::new(domain, &coordinate))
    }

    /// True when both keys address the same DNS record name.
    pub fn shares_record_with(&self, other: &RecordKey) -> bool {
        self.host_record == other.host_record && self.base_domain == other.base_domain
    }

    pub fn record_name(&self) -> String {
        format!("{}.{}", self.host_record, self.base_domain)
    }
}

/// Insertion-ordered, duplicate-free set of records this run published.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupSet {
    keys: Vec<RecordKey>,
}

impl CleanupSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `key` unless already present; returns whether it was added.
    pub fn insert(&mut self, key: RecordKey) -> bool {
        if self.keys.contains(&key) {
            return false;
        }
        self.keys.push(key);
        true
    }

    pub fn contains(&self, key: &RecordKey) -> bool {
        self.keys.contains(key)
    }

    /// True when an earlier entry already published under the same record name.
    pub fn has_record_for(&self, key: &RecordKey) -> bool {
        self.keys.iter().any(|existing| existing.shares_record_with(key))
    }

    pub fn iter(&self) -> impl Iterator<Item = &RecordKey> {
        self.keys.iter()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

impl IntoIterator for CleanupSet {
    type Item = RecordKey;
    type IntoIter = std::vec::IntoIter<RecordKey>;

    fn into_iter(self) -> Self::IntoIter {
        self.keys.into_iter()
    }
}
