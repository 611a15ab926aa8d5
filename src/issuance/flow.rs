use std::{fmt, path::PathBuf};

use chrono::{DateTime, Utc};
use log::{Level, error, info, log, warn};
use serde::Serialize;
use uuid::Uuid;

use crate::storage::{CertificateBundle, CertificateStore, CertificateSummary};

use super::{
    challenge::{CleanupSet, collect_dns_challenges},
    delay::Sleeper,
    dns_providers::{DnsRecordProvider, TXT_RECORD},
    error::IssuanceError,
    issuer::{CertificateAuthority, OrderRequest},
    keys::{KeySpec, build_csr, generate_account_key, generate_private_key},
    orchestrator::{ChallengeOrchestrator, PollPolicy},
};

/// One timestamped line of a run's log.
#[derive(Debug, Clone, Serialize)]
pub struct RunLogEntry {
    pub at: DateTime<Utc>,
    #[serde(serialize_with = "serialize_level")]
    pub level: Level,
    pub message: String,
}

fn serialize_level<S: serde::Serializer>(level: &Level, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(level.as_str())
}

/// Step-by-step record of a run, kept alongside the regular log output so it can
/// be attached to the report and notification.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunLog {
    entries: Vec<RunLogEntry>,
}

impl RunLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, level: Level, message: impl Into<String>) {
        let message = message.into();
        log!(level, "[issuance] {}", message);
        self.entries.push(RunLogEntry {
            at: Utc::now(),
            level,
            message,
        });
    }

    pub fn info(&mut self, message: impl Into<String>) {
        self.record(Level::Info, message);
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        self.record(Level::Warn, message);
    }

    pub fn error(&mut self, message: impl Into<String>) {
        self.record(Level::Error, message);
    }

    pub fn entries(&self) -> &[RunLogEntry] {
        &self.entries
    }
}

impl fmt::Display for RunLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for entry in &self.entries {
            writeln!(
                f,
                "{} {:<5} {}",
                entry.at.format("%Y-%m-%d %H:%M:%S"),
                entry.level,
                entry.message
            )?;
        }
        Ok(())
    }
}

/// What cleanup did with each record the run published.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CleanupReport {
    /// `domain -> record name` pairs whose delete call succeeded.
    pub removed: Vec<(String, String)>,
    /// `domain -> error` pairs whose delete call failed.
    pub failed: Vec<(String, String)>,
}

/// Outcome of one issuance run.
#[derive(Debug, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub success: bool,
    pub domains: Vec<String>,
    pub error: Option<String>,
    #[serde(skip)]
    pub failure: Option<IssuanceError>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub cleanup: CleanupReport,
    pub certificate: Option<CertificateSummary>,
    pub files: Vec<PathBuf>,
    pub log: RunLog,
}

/// Immutable inputs of a run.
#[derive(Debug, Clone)]
pub struct WorkflowSettings {
    pub contact_email: String,
    /// Normalized, first entry is the certificate's primary identity.
    pub domains: Vec<String>,
    pub account_key_pem: String,
    pub key_spec: KeySpec,
    pub reuse_private_key: bool,
    pub poll_policy: PollPolicy,
}

struct Issued {
    certificate: Option<CertificateSummary>,
    files: Vec<PathBuf>,
}

/// Loads the saved account key or generates a new one. The authority client needs
/// it before the workflow starts.
pub fn resolve_account_key(store: &dyn CertificateStore) -> Result<String, IssuanceError> {
    match store.load_account_key().map_err(IssuanceError::KeyMaterial)? {
        Some(pem) => Ok(pem),
        None => generate_account_key().map_err(IssuanceError::KeyMaterial),
    }
}

/// Runs one DNS-01 issuance end to end.
pub struct IssuanceWorkflow<'a> {
    authority: &'a dyn CertificateAuthority,
    dns: &'a dyn DnsRecordProvider,
    store: &'a dyn CertificateStore,
    sleeper: &'a dyn Sleeper,
    settings: WorkflowSettings,
}

impl<'a> IssuanceWorkflow<'a> {
    pub fn new(
        authority: &'a dyn CertificateAuthority,
        dns: &'a dyn DnsRecordProvider,
        store: &'a dyn CertificateStore,
        sleeper: &'a dyn Sleeper,
        settings: WorkflowSettings,
    ) -> Self {
        Self {
            authority,
            dns,
            store,
            sleeper,
            settings,
        }
    }

    /// Never fails: every error ends up in the report. Published records are
    /// removed whatever the outcome.
    pub fn run(&self) -> RunReport {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let mut run_log = RunLog::new();
        run_log.info(format!(
            "run {} started for {}",
            run_id,
            self.settings.domains.join(", ")
        ));

        let mut cleanup = CleanupSet::new();
        let result = self.issue(&mut run_log, &mut cleanup);
        let cleanup_report = self.cleanup(&cleanup, &mut run_log);

        let (issued, failure) = match result {
            Ok(issued) => {
                run_log.info("certificate issued and saved");
                (Some(issued), None)
            }
            Err(err) => {
                run_log.error(format!("run failed: {err}"));
                (None, Some(err))
            }
        };
        let (certificate, files) = issued
            .map(|issued| (issued.certificate, issued.files))
            .unwrap_or_default();

        RunReport {
            run_id,
            success: failure.is_none(),
            domains: self.settings.domains.clone(),
            error: failure.as_ref().map(ToString::to_string),
            failure,
            started_at,
            finished_at: Utc::now(),
            cleanup: cleanup_report,
            certificate,
            files,
            log: run_log,
        }
    }

    fn issue(&self, run_log: &mut RunLog, cleanup: &mut CleanupSet) -> Result<Issued, IssuanceError> {
        let settings = &self.settings;

        self.authority.bootstrap()?;
        run_log.info("certificate authority directory ready");
        self.authority.ensure_account(&settings.contact_email)?;
        run_log.info(format!("account ready for {}", settings.contact_email));

        let private_key_pem = self.certificate_key(run_log)?;
        let csr_pem =
            build_csr(&private_key_pem, &settings.domains).map_err(IssuanceError::KeyMaterial)?;
        run_log.info(format!(
            "CSR built: CN={} with {} SAN(s)",
            settings.domains[0],
            settings.domains.len()
        ));

        let order = self.authority.create_order(&OrderRequest {
            domains: settings.domains.clone(),
            csr_pem,
        })?;
        run_log.info(format!("order {} created", order.id));

        let authorizations = self.authority.authorizations(&order)?;
        let descriptors = collect_dns_challenges(&authorizations)?;
        run_log.info(format!(
            "{} DNS-01 challenge(s) to satisfy out of {} authorization(s)",
            descriptors.len(),
            authorizations.len()
        ));

        let orchestrator = ChallengeOrchestrator::new(
            self.authority,
            self.dns,
            self.sleeper,
            settings.poll_policy.clone(),
        );
        let outcome = orchestrator.run(&descriptors);
        *cleanup = outcome.cleanup;
        for (domain, state) in &outcome.transitions {
            run_log.record(Level::Debug, format!("{domain}: {state:?}"));
        }
        outcome.result?;
        run_log.info("all challenges validated; finalizing order");

        let chain_pem = self
            .authority
            .finalize_and_fetch(&order, &private_key_pem)?;
        run_log.info("certificate chain downloaded");

        let certificate = match CertificateSummary::from_chain(&chain_pem) {
            Ok(summary) => {
                run_log.info(format!(
                    "serial {} valid {} to {} (sha256 {})",
                    summary.serial,
                    summary.not_before.format("%Y-%m-%d"),
                    summary.not_after.format("%Y-%m-%d"),
                    summary.fingerprint
                ));
                Some(summary)
            }
            Err(err) => {
                run_log.warn(format!("could not summarize issued certificate: {err:#}"));
                None
            }
        };

        let files = self
            .store
            .save(&CertificateBundle {
                account_key_pem: settings.account_key_pem.clone(),
                private_key_pem,
                chain_pem,
            })
            .map_err(IssuanceError::Storage)?;
        run_log.info(format!("saved {} file(s)", files.len()));

        Ok(Issued { certificate, files })
    }

    fn certificate_key(&self, run_log: &mut RunLog) -> Result<String, IssuanceError> {
        if self.settings.reuse_private_key {
            match self.store.load_certificate_key() {
                Ok(Some(pem)) => {
                    run_log.info("reusing existing certificate key");
                    return Ok(pem);
                }
                Ok(None) => run_log.info("no existing certificate key; generating one"),
                Err(err) => return Err(IssuanceError::KeyMaterial(err)),
            }
        }
        let pem = generate_private_key(self.settings.key_spec).map_err(IssuanceError::KeyMaterial)?;
        run_log.info(format!("generated certificate key ({:?})", self.settings.key_spec));
        Ok(pem)
    }

    fn cleanup(&self, cleanup: &CleanupSet, run_log: &mut RunLog) -> CleanupReport {
        let mut report = CleanupReport::default();
        if cleanup.is_empty() {
            info!("[cleanup] nothing to remove");
            return report;
        }
        run_log.info(format!("removing {} challenge record(s)", cleanup.len()));

        for key in cleanup.iter() {
            let record_name = key.record_name();
            match self
                .dns
                .delete_records(&key.base_domain, &key.host_record, TXT_RECORD)
            {
                Ok(removed) => {
                    info!(
                        "[cleanup] {} ({}): {} record(s) removed",
                        key.domain, record_name, removed
                    );
                    report.removed.push((key.domain.clone(), record_name));
                }
                Err(err) => {
                    error!("[cleanup] {} ({}) failed: {:#}", key.domain, record_name, err);
                    run_log.warn(format!("cleanup of {record_name} failed: {err:#}"));
                    report.failed.push((key.domain.clone(), format!("{err:#}")));
                }
            }
        }
        if !report.failed.is_empty() {
            warn!(
                "[cleanup] {} record(s) may need manual removal",
                report.failed.len()
            );
        }
        report
    }
}
