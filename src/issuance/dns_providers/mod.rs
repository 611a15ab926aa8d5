use anyhow::{Result, anyhow};

use crate::{config::DnsProviderConfig, domain::normalize_domain};

mod cloudflare;
mod digitalocean;
pub(crate) mod http;
mod memory;
mod retry;

pub use cloudflare::CloudflareProvider;
pub use digitalocean::DigitalOceanProvider;
pub use memory::{MemoryDnsProvider, StoredRecord};
pub use retry::retry_with_backoff;

pub const TXT_RECORD: &str = "TXT";

/// Record CRUD against a DNS hosting provider.
///
/// Records are addressed the way registrars present them: the zone's base domain
/// plus a host record relative to it (`_acme-challenge.www` in `example.com`).
pub trait DnsRecordProvider {
    fn id(&self) -> &'static str;

    /// Creates the record, or updates the existing record of that name and type so
    /// it carries `value`. Returns the provider's record id.
    fn upsert_record(
        &self,
        base_domain: &str,
        host_record: &str,
        record_type: &str,
        value: &str,
        ttl: u32,
    ) -> Result<String>;

    /// Deletes every record of that name and type. Returns how many were removed;
    /// deleting a name with no records is not an error.
    fn delete_records(&self, base_domain: &str, host_record: &str, record_type: &str)
    -> Result<usize>;
}

pub(crate) fn matches_zone(base_domain: &str, zone_name: &str) -> bool {
    let base_domain = match normalize_domain(base_domain) {
        Ok(value) => value,
        Err(_) => return false,
    };
    let zone_name = match normalize_domain(zone_name) {
        Ok(value) => value,
        Err(_) => return false,
    };
    zone_name == base_domain || base_domain.ends_with(&format!(".{}", zone_name))
}

pub(crate) fn fqdn(base_domain: &str, host_record: &str) -> String {
    let base_domain = base_domain.trim_end_matches('.');
    match host_record {
        "" | "@" => base_domain.to_string(),
        host => format!("{}.{}", host.trim_end_matches('.'), base_domain),
    }
}

/// Builds the provider selected in configuration, resolving API tokens.
pub fn provider_from_config(config: &DnsProviderConfig) -> Result<Box<dyn DnsRecordProvider>> {
    match config {
        DnsProviderConfig::Cloudflare(credentials) => {
            let token = credentials.resolve_token("Cloudflare")?;
            Ok(Box::new(CloudflareProvider::new(token)))
        }
        DnsProviderConfig::Digitalocean(credentials) => {
            let token = credentials.resolve_token("DigitalOcean")?;
            Ok(Box::new(DigitalOceanProvider::new(token)))
        }
        DnsProviderConfig::Memory => Ok(Box::new(MemoryDnsProvider::new())),
    }
}

pub(crate) fn require_txt(provider: &str, record_type: &str) -> Result<()> {
    if record_type.eq_ignore_ascii_case(TXT_RECORD) {
        Ok(())
    } else {
        Err(anyhow!(
            "{provider} adapter only manages TXT records (got {record_type})"
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::{fqdn, matches_zone};

    #[test]
    fn matches_exact_zone_name() {
        assert!(matches_zone("example.com", "example.com"));
        assert!(!matches_zone("example.com", "other.com"));
    }

    #[test]
    fn matches_subdomain_suffix() {
        assert!(matches_zone("sub.example.com", "example.com"));
        assert!(!matches_zone("example.com", "sub.example.com"));
    }

    #[test]
    fn matches_idn_suffix() {
        assert!(matches_zone("testé.ezs3.net", "ezs3.net"));
        assert!(matches_zone("xn--test-epa.ezs3.net", "ezs3.net"));
        assert!(matches_zone("testé.fr", "xn--test-epa.fr"));
        assert!(!matches_zone("example.com", "xn--test-epa.fr"));
    }

    #[test]
    fn fqdn_joins_host_record_and_base() {
        assert_eq!(
            fqdn("example.com", "_acme-challenge.www"),
            "_acme-challenge.www.example.com"
        );
        assert_eq!(fqdn("example.com.", "@"), "example.com");
    }
}
