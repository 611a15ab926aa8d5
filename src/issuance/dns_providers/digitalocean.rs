use anyhow::{Context, Result, anyhow};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{DnsRecordProvider, http, require_txt, retry::retry_provider_verification};

const API_BASE: &str = "https://api.digitalocean.com/v2";

/// DigitalOcean DNS. Records live under a domain and are named relative to it,
/// which maps directly onto base domain plus host record.
pub struct DigitalOceanProvider {
    api_token: String,
}

#[derive(Serialize)]
struct DigitalOceanDnsRecord<'a> {
    #[serde(rename = "type")]
    record_type: &'a str,
    name: &'a str,
    data: &'a str,
    ttl: u32,
}

#[derive(Deserialize)]
struct DigitalOceanDnsRecordResponse {
    domain_record: DigitalOceanDnsRecordItem,
}

#[derive(Deserialize)]
struct DigitalOceanDnsRecordListResponse {
    domain_records: Vec<DigitalOceanDnsRecordItem>,
}

#[derive(Deserialize)]
struct DigitalOceanDnsRecordItem {
    id: u64,
    #[serde(default)]
    name: String,
    #[serde(default)]
    data: Option<String>,
}

impl DigitalOceanProvider {
    pub fn new(api_token: String) -> Self {
        Self { api_token }
    }

    /// DigitalOcean quotes TXT data itself, so values are stored bare.
    fn normalize_txt_content(value: &str) -> String {
        value.trim().trim_matches('"').trim().to_string()
    }

    fn relative_name(host_record: &str) -> &str {
        match host_record.trim_end_matches('.') {
            "" => "@",
            name => name,
        }
    }

    fn list_records(
        &self,
        domain: &str,
        host_record: &str,
        record_type: &str,
    ) -> Result<Vec<DigitalOceanDnsRecordItem>> {
        let relative = Self::relative_name(host_record);
        let fqdn = super::fqdn(domain, relative);
        let client = http::HttpClient::shared();
        let response = http::bearer(
            client.get(format!(
                "{API_BASE}/domains/{domain}/records?type={record_type}&name={fqdn}"
            )),
            &self.api_token,
        )
        .send()
        .context("Failed to list DigitalOcean DNS records")?;

        let list: DigitalOceanDnsRecordListResponse =
            http::ensure_success("DigitalOcean", response)?
                .json()
                .context("Failed to parse DigitalOcean DNS record list")?;

        // The name filter expects a FQDN while records carry relative names; match both.
        Ok(list
            .domain_records
            .into_iter()
            .filter(|record| record.name == relative || record.name == fqdn)
            .collect())
    }

    fn fetch_record_data(&self, domain: &str, record_id: u64) -> Result<Option<String>> {
        let client = http::HttpClient::shared();
        let response = http::bearer(
            client.get(format!("{API_BASE}/domains/{domain}/records/{record_id}")),
            &self.api_token,
        )
        .send()
        .context("Failed to fetch DigitalOcean DNS record")?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let record: DigitalOceanDnsRecordResponse = http::ensure_success("DigitalOcean", response)?
            .json()
            .context("Failed to parse DigitalOcean DNS record response")?;
        Ok(record.domain_record.data)
    }
}

impl DnsRecordProvider for DigitalOceanProvider {
    fn id(&self) -> &'static str {
        "digitalocean"
    }

    fn upsert_record(
        &self,
        base_domain: &str,
        host_record: &str,
        record_type: &str,
        value: &str,
        ttl: u32,
    ) -> Result<String> {
        require_txt("DigitalOcean", record_type)?;
        let relative = Self::relative_name(host_record);
        let data = Self::normalize_txt_content(value);
        let record = DigitalOceanDnsRecord {
            record_type,
            name: relative,
            data: &data,
            ttl,
        };
        let client = http::HttpClient::shared();

        let existing = self.list_records(base_domain, host_record, record_type)?;
        let record_id = match existing.first() {
            Some(current)
                if current
                    .data
                    .as_deref()
                    .is_some_and(|current| Self::normalize_txt_content(current) == data) =>
            {
                info!(
                    "[dns-digitalocean] {}.{} already carries the expected value",
                    relative, base_domain
                );
                return Ok(current.id.to_string());
            }
            Some(current) => {
                let response = http::bearer(
                    client.put(format!(
                        "{API_BASE}/domains/{base_domain}/records/{}",
                        current.id
                    )),
                    &self.api_token,
                )
                .json(&record)
                .send()
                .context("Failed to update DigitalOcean DNS record")?;
                http::ensure_success("DigitalOcean", response)?;
                info!(
                    "[dns-digitalocean] updated {}.{} (id {})",
                    relative, base_domain, current.id
                );
                current.id
            }
            None => {
                let response = http::bearer(
                    client.post(format!("{API_BASE}/domains/{base_domain}/records")),
                    &self.api_token,
                )
                .json(&record)
                .send()
                .context("Failed to create DigitalOcean DNS record")?;
                let created: DigitalOceanDnsRecordResponse =
                    http::ensure_success("DigitalOcean", response)?
                        .json()
                        .context("Failed to parse DigitalOcean DNS record response")?;
                info!(
                    "[dns-digitalocean] created {}.{} (id {})",
                    relative, base_domain, created.domain_record.id
                );
                created.domain_record.id
            }
        };

        retry_provider_verification(
            &format!("{relative}.{base_domain}"),
            "DigitalOcean record verification",
            Duration::from_secs(3),
            Duration::from_millis(500),
            || {
                Ok(self
                    .fetch_record_data(base_domain, record_id)?
                    .is_some_and(|current| Self::normalize_txt_content(&current) == data))
            },
        )
        .map_err(|err| anyhow!("DigitalOcean record verification failed: {err}"))?;

        Ok(record_id.to_string())
    }

    fn delete_records(
        &self,
        base_domain: &str,
        host_record: &str,
        record_type: &str,
    ) -> Result<usize> {
        require_txt("DigitalOcean", record_type)?;
        let records = self.list_records(base_domain, host_record, record_type)?;
        let client = http::HttpClient::shared();

        let mut deleted = 0;
        for record in records {
            let response = http::bearer(
                client.delete(format!(
                    "{API_BASE}/domains/{base_domain}/records/{}",
                    record.id
                )),
                &self.api_token,
            )
            .send()
            .context("Failed to delete DigitalOcean DNS record")?;

            if response.status() == reqwest::StatusCode::NOT_FOUND {
                debug!("[dns-digitalocean] record {} already deleted (404)", record.id);
                continue;
            }
            http::ensure_success("DigitalOcean", response)?;
            deleted += 1;
        }
        info!(
            "[dns-digitalocean] deleted {} record(s) at {}.{}",
            deleted,
            Self::relative_name(host_record),
            base_domain
        );
        Ok(deleted)
    }
}
