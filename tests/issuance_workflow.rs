mod common;

use dns01_issuer::{
    issuance::{
        IssuanceError, IssuanceWorkflow, PollPolicy, RunReport, WorkflowSettings,
        dns_providers::MemoryDnsProvider,
        issuer::AuthorizationStatus,
        keys::{KeyCurve, KeySpec, generate_account_key},
    },
    storage::{CertificateStore, FileCertificateStore},
};

use common::{FakeAuthority, RecordingSleeper, paths_in, temp_dir};

fn settings(domains: &[&str]) -> WorkflowSettings {
    WorkflowSettings {
        contact_email: "ops@example.com".into(),
        domains: domains.iter().map(|domain| domain.to_string()).collect(),
        account_key_pem: generate_account_key().expect("account key"),
        key_spec: KeySpec::Ecdsa(KeyCurve::P256),
        reuse_private_key: false,
        poll_policy: PollPolicy::default(),
    }
}

struct Harness {
    authority: FakeAuthority,
    dns: MemoryDnsProvider,
    store: FileCertificateStore,
    sleeper: RecordingSleeper,
}

impl Harness {
    fn new(authority: FakeAuthority) -> Self {
        Self {
            authority,
            dns: MemoryDnsProvider::new(),
            store: FileCertificateStore::new(paths_in(&temp_dir()), None),
            sleeper: RecordingSleeper::default(),
        }
    }

    fn run(&self, settings: WorkflowSettings) -> RunReport {
        IssuanceWorkflow::new(
            &self.authority,
            &self.dns,
            &self.store,
            &self.sleeper,
            settings,
        )
        .run()
    }
}

#[test]
fn apex_and_wildcard_share_one_record_and_are_both_cleaned() {
    let harness = Harness::new(FakeAuthority::new());

    let report = harness.run(settings(&["example.com", "*.example.com"]));

    assert!(report.success, "{:?}", report.error);
    assert_eq!(
        harness.dns.upserts(),
        vec!["_acme-challenge.example.com", "_acme-challenge.example.com"]
    );
    // initial delay for the apex; settle delay then initial delay for the wildcard
    assert_eq!(harness.sleeper.waits_secs(), vec![5, 60, 5]);
    assert_eq!(report.cleanup.removed.len(), 2);
    assert!(
        report
            .cleanup
            .removed
            .iter()
            .all(|(_, name)| name == "_acme-challenge.example.com")
    );
    assert!(harness.dns.records().is_empty());
    assert_eq!(
        harness.authority.calls(),
        vec![
            "bootstrap",
            "account:ops@example.com",
            "create_order",
            "answer:dns:example.com",
            "answer:dns:*.example.com",
            "finalize",
        ]
    );
}

#[test]
fn successful_run_persists_certificate_and_summary() {
    let harness = Harness::new(FakeAuthority::new());

    let report = harness.run(settings(&["example.com", "www.example.com"]));

    assert!(report.success);
    assert_eq!(report.files.len(), 4);
    assert!(report.files.iter().all(|path| path.exists()));
    let summary = report.certificate.as_ref().expect("certificate summary");
    assert_eq!(summary.subject_names, vec!["example.com", "www.example.com"]);
    assert!(
        harness
            .store
            .load_certificate_key()
            .expect("load key")
            .is_some()
    );
    assert!(report.log.entries().len() > 5);
}

#[test]
fn rejected_order_publishes_and_deletes_nothing() {
    let harness = Harness::new(FakeAuthority::rejecting_orders());

    let report = harness.run(settings(&["example.com"]));

    assert!(!report.success);
    assert!(matches!(report.failure, Some(IssuanceError::Authority(_))));
    assert!(report.cleanup.removed.is_empty());
    assert!(harness.dns.upserts().is_empty());
    assert!(harness.dns.deletions().is_empty());
    assert!(report.files.is_empty());
}

#[test]
fn upsert_failure_on_second_domain_cleans_only_the_first() {
    let harness = Harness::new(FakeAuthority::new());
    harness
        .dns
        .fail_upserts_for("_acme-challenge.www.example.com");

    let report = harness.run(settings(&["example.com", "www.example.com", "api.example.com"]));

    assert!(matches!(report.failure, Some(IssuanceError::DnsProvider(_))));
    assert_eq!(harness.dns.deletions(), vec!["_acme-challenge.example.com"]);
    assert_eq!(report.cleanup.removed.len(), 1);
    assert_eq!(report.cleanup.removed[0].0, "example.com");
    // the third domain is never attempted
    assert!(
        !harness
            .dns
            .upserts()
            .contains(&"_acme-challenge.api.example.com".to_string())
    );
    assert!(!harness.authority.calls().contains(&"finalize".to_string()));
}

#[test]
fn timed_out_validation_still_removes_its_record() {
    let authority = FakeAuthority::new();
    authority.script("www.example.com", vec![AuthorizationStatus::Pending]);
    let harness = Harness::new(authority);

    let report = harness.run(settings(&["example.com", "www.example.com"]));

    match &report.failure {
        Some(IssuanceError::ChallengeValidationTimeout { domain, attempts }) => {
            assert_eq!(domain, "www.example.com");
            assert_eq!(*attempts, 10);
        }
        other => panic!("expected timeout, got {other:?}"),
    }
    assert_eq!(
        harness.dns.deletions(),
        vec![
            "_acme-challenge.example.com",
            "_acme-challenge.www.example.com"
        ]
    );
    assert!(harness.dns.records().is_empty());
}

#[test]
fn invalid_authorization_fails_the_run() {
    let authority = FakeAuthority::new();
    authority.script(
        "example.com",
        vec![AuthorizationStatus::Pending, AuthorizationStatus::Invalid],
    );
    let harness = Harness::new(authority);

    let report = harness.run(settings(&["example.com"]));

    assert!(matches!(
        report.failure,
        Some(IssuanceError::ChallengeValidationFailed { .. })
    ));
    assert!(report.error.as_deref().unwrap_or_default().contains("invalid"));
    assert_eq!(report.cleanup.removed.len(), 1);
}

#[test]
fn order_without_dns01_fails_before_publishing() {
    let harness = Harness::new(FakeAuthority::without_dns01());

    let report = harness.run(settings(&["example.com"]));

    assert!(matches!(report.failure, Some(IssuanceError::NoChallengeFound)));
    assert!(harness.dns.upserts().is_empty());
    assert!(harness.dns.deletions().is_empty());
}

#[test]
fn cleanup_failure_does_not_change_the_outcome() {
    let harness = Harness::new(FakeAuthority::new());
    harness
        .dns
        .fail_deletes_for("_acme-challenge.www.example.com");

    let report = harness.run(settings(&["example.com", "www.example.com"]));

    assert!(report.success);
    assert_eq!(report.cleanup.removed.len(), 1);
    assert_eq!(report.cleanup.failed.len(), 1);
    assert_eq!(report.cleanup.failed[0].0, "www.example.com");
}

#[test]
fn existing_certificate_key_is_reused_when_requested() {
    let harness = Harness::new(FakeAuthority::new());
    let mut first = settings(&["example.com"]);
    first.reuse_private_key = true;
    assert!(harness.run(first).success);
    let saved = harness
        .store
        .load_certificate_key()
        .expect("load")
        .expect("saved key");

    let mut second = settings(&["example.com"]);
    second.reuse_private_key = true;
    let report = harness.run(second);

    assert!(report.success);
    assert_eq!(
        harness.store.load_certificate_key().expect("load").as_deref(),
        Some(saved.as_str())
    );
}
