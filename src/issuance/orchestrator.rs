use std::time::Duration;

use log::{error, info, warn};

use crate::domain::decompose;

use super::{
    challenge::{ChallengeDescriptor, CleanupSet, RecordKey},
    delay::Sleeper,
    dns_providers::{DnsRecordProvider, TXT_RECORD},
    error::IssuanceError,
    issuer::{AuthorizationStatus, CertificateAuthority},
};

/// Timing knobs for publishing and validating challenges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollPolicy {
    pub record_ttl: u32,
    /// Extra wait before validating a record name an earlier domain already used.
    pub settle_delay: Duration,
    pub initial_delay: Duration,
    pub poll_interval: Duration,
    pub max_attempts: u32,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            record_ttl: 600,
            settle_delay: Duration::from_secs(60),
            initial_delay: Duration::from_secs(5),
            poll_interval: Duration::from_secs(5),
            max_attempts: 10,
        }
    }
}

/// Lifecycle of one domain's challenge. Every terminal state is reached through
/// `Polling`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeState {
    Published,
    ResponseSubmitted,
    Polling,
    Valid,
    Invalid,
    TimedOut,
}

/// Result of an orchestration run. `cleanup` is populated even when `result` is an
/// error so the caller can remove whatever was published.
#[derive(Debug)]
pub struct OrchestrationOutcome {
    pub cleanup: CleanupSet,
    pub result: Result<(), IssuanceError>,
    /// Per-domain state transitions in the order they happened.
    pub transitions: Vec<(String, ChallengeState)>,
}

/// Publishes, submits and validates DNS-01 challenges one domain at a time.
///
/// Domains are never validated concurrently: domains that share a record name
/// (apex and wildcard) would otherwise overwrite each other's pending value.
pub struct ChallengeOrchestrator<'a> {
    authority: &'a dyn CertificateAuthority,
    dns: &'a dyn DnsRecordProvider,
    sleeper: &'a dyn Sleeper,
    policy: PollPolicy,
}

impl<'a> ChallengeOrchestrator<'a> {
    pub fn new(
        authority: &'a dyn CertificateAuthority,
        dns: &'a dyn DnsRecordProvider,
        sleeper: &'a dyn Sleeper,
        policy: PollPolicy,
    ) -> Self {
        Self {
            authority,
            dns,
            sleeper,
            policy,
        }
    }

    pub fn run(&self, descriptors: &[ChallengeDescriptor]) -> OrchestrationOutcome {
        let mut cleanup = CleanupSet::new();
        let mut transitions = Vec::new();
        info!(
            "[challenge] validating {} domain(s) sequentially via {}",
            descriptors.len(),
            self.dns.id()
        );

        for descriptor in descriptors {
            if let Err(err) = self.process(descriptor, &mut cleanup, &mut transitions) {
                error!(
                    "[challenge] {} failed, aborting remaining domains: {}",
                    descriptor.domain(),
                    err
                );
                return OrchestrationOutcome {
                    cleanup,
                    result: Err(err),
                    transitions,
                };
            }
        }

        info!("[challenge] all {} domain(s) validated", descriptors.len());
        OrchestrationOutcome {
            cleanup,
            result: Ok(()),
            transitions,
        }
    }

    fn process(
        &self,
        descriptor: &ChallengeDescriptor,
        cleanup: &mut CleanupSet,
        transitions: &mut Vec<(String, ChallengeState)>,
    ) -> Result<(), IssuanceError> {
        let domain = descriptor.domain();
        let coordinate = decompose(domain)?;
        let key = RecordKey::new(domain, &coordinate);
        info!(
            "[challenge] ---------- {}: publishing TXT {} in {} ----------",
            domain, coordinate.host_record, coordinate.base_domain
        );

        let record_id = self
            .dns
            .upsert_record(
                &coordinate.base_domain,
                &coordinate.host_record,
                TXT_RECORD,
                descriptor.validation_value(),
                self.policy.record_ttl,
            )
            .map_err(IssuanceError::DnsProvider)?;
        transitions.push((domain.to_string(), ChallengeState::Published));
        info!(
            "[challenge] {} published as record {} (ttl {}s)",
            domain, record_id, self.policy.record_ttl
        );

        // The record now exists, so it is ours to remove whatever happens next.
        let reused = cleanup.has_record_for(&key);
        cleanup.insert(key);
        if reused {
            info!(
                "[challenge] {} reuses {}; waiting {}s for the new value to settle",
                domain,
                coordinate.record_name(),
                self.policy.settle_delay.as_secs()
            );
            self.sleeper.sleep(self.policy.settle_delay);
        }

        self.authority.answer_challenge(descriptor.challenge())?;
        transitions.push((domain.to_string(), ChallengeState::ResponseSubmitted));
        info!(
            "[challenge] {} response submitted; first status check in {}s",
            domain,
            self.policy.initial_delay.as_secs()
        );

        transitions.push((domain.to_string(), ChallengeState::Polling));
        let terminal = self.await_validation(descriptor);
        let state = match &terminal {
            Ok(()) => ChallengeState::Valid,
            Err(IssuanceError::ChallengeValidationTimeout { .. }) => ChallengeState::TimedOut,
            Err(_) => ChallengeState::Invalid,
        };
        transitions.push((domain.to_string(), state));
        terminal
    }

    fn await_validation(&self, descriptor: &ChallengeDescriptor) -> Result<(), IssuanceError> {
        let domain = descriptor.domain();
        let max_attempts = self.policy.max_attempts;
        self.sleeper.sleep(self.policy.initial_delay);

        for attempt in 1..=max_attempts {
            let status = self.authority.poll_authorization(descriptor.authorization())?;
            info!(
                "[challenge] {} status: {} (attempt {}/{}, interval {}s)",
                domain,
                status,
                attempt,
                max_attempts,
                self.policy.poll_interval.as_secs()
            );
            match status {
                AuthorizationStatus::Valid => {
                    info!("[challenge] {} validated", domain);
                    return Ok(());
                }
                AuthorizationStatus::Pending => {
                    if attempt < max_attempts {
                        self.sleeper.sleep(self.policy.poll_interval);
                    }
                }
                other => {
                    return Err(IssuanceError::ChallengeValidationFailed {
                        domain: domain.to_string(),
                        status: other.to_string(),
                    });
                }
            }
        }

        warn!(
            "[challenge] {} still pending after {} attempt(s)",
            domain, max_attempts
        );
        Err(IssuanceError::ChallengeValidationTimeout {
            domain: domain.to_string(),
            attempts: max_attempts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::issuance::{
        dns_providers::MemoryDnsProvider,
        issuer::{
            Authorization, AuthorizationHandle, ChallengeHandle, IssuerError, OrderHandle,
            OrderRequest,
        },
    };
    use std::{
        cell::RefCell,
        collections::{HashMap, VecDeque},
    };

    #[derive(Default)]
    struct RecordingSleeper {
        waits: RefCell<Vec<Duration>>,
    }

    impl Sleeper for RecordingSleeper {
        fn sleep(&self, duration: Duration) {
            self.waits.borrow_mut().push(duration);
        }
    }

    /// Answers polls from a per-authorization script; the last entry repeats.
    #[derive(Default)]
    struct ScriptedAuthority {
        scripts: RefCell<HashMap<String, VecDeque<AuthorizationStatus>>>,
        answered: RefCell<Vec<String>>,
        polls: RefCell<Vec<String>>,
    }

    impl ScriptedAuthority {
        fn script(&self, authz: &str, statuses: Vec<AuthorizationStatus>) {
            self.scripts
                .borrow_mut()
                .insert(authz.to_string(), statuses.into());
        }
    }

    impl CertificateAuthority for ScriptedAuthority {
        fn bootstrap(&self) -> Result<(), IssuerError> {
            Ok(())
        }

        fn ensure_account(&self, _contact_email: &str) -> Result<(), IssuerError> {
            Ok(())
        }

        fn create_order(&self, _request: &OrderRequest) -> Result<OrderHandle, IssuerError> {
            Err(IssuerError::Operation("not used".into()))
        }

        fn authorizations(&self, _order: &OrderHandle) -> Result<Vec<Authorization>, IssuerError> {
            Ok(Vec::new())
        }

        fn answer_challenge(&self, challenge: &ChallengeHandle) -> Result<(), IssuerError> {
            self.answered.borrow_mut().push(challenge.id.clone());
            Ok(())
        }

        fn poll_authorization(
            &self,
            authorization: &AuthorizationHandle,
        ) -> Result<AuthorizationStatus, IssuerError> {
            self.polls.borrow_mut().push(authorization.id.clone());
            let mut scripts = self.scripts.borrow_mut();
            let script = scripts
                .get_mut(&authorization.id)
                .ok_or_else(|| IssuerError::Operation("unknown authorization".into()))?;
            if script.len() > 1 {
                Ok(script.pop_front().unwrap_or(AuthorizationStatus::Pending))
            } else {
                Ok(script.front().cloned().unwrap_or(AuthorizationStatus::Pending))
            }
        }

        fn finalize_and_fetch(
            &self,
            _order: &OrderHandle,
            _private_key_pem: &str,
        ) -> Result<String, IssuerError> {
            Err(IssuerError::Operation("not used".into()))
        }
    }

    fn descriptor(domain: &str) -> ChallengeDescriptor {
        ChallengeDescriptor::new(
            domain,
            AuthorizationHandle {
                id: format!("authz:{domain}"),
            },
            ChallengeHandle {
                id: format!("chall:{domain}"),
            },
            format!("value-for-{domain}"),
        )
        .unwrap()
    }

    fn pending_then_valid(pending: usize) -> Vec<AuthorizationStatus> {
        let mut statuses = vec![AuthorizationStatus::Pending; pending];
        statuses.push(AuthorizationStatus::Valid);
        statuses
    }

    fn secs(values: &[u64]) -> Vec<Duration> {
        values.iter().map(|v| Duration::from_secs(*v)).collect()
    }

    #[test]
    fn valid_on_last_attempt_succeeds() {
        let authority = ScriptedAuthority::default();
        authority.script("authz:example.com", pending_then_valid(9));
        let dns = MemoryDnsProvider::new();
        let sleeper = RecordingSleeper::default();
        let orchestrator =
            ChallengeOrchestrator::new(&authority, &dns, &sleeper, PollPolicy::default());

        let outcome = orchestrator.run(&[descriptor("example.com")]);

        assert!(outcome.result.is_ok());
        assert_eq!(authority.polls.borrow().len(), 10);
        // initial delay plus nine intervals between ten polls
        assert_eq!(*sleeper.waits.borrow(), secs(&[5; 10]));
        assert_eq!(outcome.cleanup.len(), 1);
    }

    #[test]
    fn pending_for_every_attempt_times_out() {
        let authority = ScriptedAuthority::default();
        authority.script("authz:example.com", vec![AuthorizationStatus::Pending]);
        let dns = MemoryDnsProvider::new();
        let sleeper = RecordingSleeper::default();
        let orchestrator =
            ChallengeOrchestrator::new(&authority, &dns, &sleeper, PollPolicy::default());

        let outcome = orchestrator.run(&[descriptor("example.com")]);

        assert!(matches!(
            outcome.result,
            Err(IssuanceError::ChallengeValidationTimeout { attempts: 10, .. })
        ));
        assert_eq!(authority.polls.borrow().len(), 10);
        assert_eq!(
            outcome.transitions.last(),
            Some(&("example.com".to_string(), ChallengeState::TimedOut))
        );
    }

    #[test]
    fn invalid_status_fails_without_further_polls() {
        let authority = ScriptedAuthority::default();
        authority.script(
            "authz:example.com",
            vec![
                AuthorizationStatus::Pending,
                AuthorizationStatus::Invalid,
                AuthorizationStatus::Valid,
            ],
        );
        authority.script("authz:www.example.com", pending_then_valid(0));
        let dns = MemoryDnsProvider::new();
        let sleeper = RecordingSleeper::default();
        let orchestrator =
            ChallengeOrchestrator::new(&authority, &dns, &sleeper, PollPolicy::default());

        let outcome =
            orchestrator.run(&[descriptor("example.com"), descriptor("www.example.com")]);

        match outcome.result {
            Err(IssuanceError::ChallengeValidationFailed { domain, status }) => {
                assert_eq!(domain, "example.com");
                assert_eq!(status, "invalid");
            }
            other => panic!("expected ChallengeValidationFailed, got {other:?}"),
        }
        assert_eq!(authority.polls.borrow().len(), 2);
        // remaining domains are not attempted
        assert_eq!(*authority.answered.borrow(), vec!["chall:example.com"]);
        assert_eq!(dns.upserts(), vec!["_acme-challenge.example.com"]);
        // the published record is still handed back for cleanup
        assert_eq!(outcome.cleanup.len(), 1);
    }

    #[test]
    fn other_terminal_statuses_fail_immediately() {
        for status in [
            AuthorizationStatus::Expired,
            AuthorizationStatus::Deactivated,
            AuthorizationStatus::Other("processing".into()),
        ] {
            let authority = ScriptedAuthority::default();
            authority.script("authz:example.com", vec![status.clone()]);
            let dns = MemoryDnsProvider::new();
            let sleeper = RecordingSleeper::default();
            let orchestrator =
                ChallengeOrchestrator::new(&authority, &dns, &sleeper, PollPolicy::default());
            let outcome = orchestrator.run(&[descriptor("example.com")]);
            assert!(matches!(
                outcome.result,
                Err(IssuanceError::ChallengeValidationFailed { .. })
            ));
            assert_eq!(authority.polls.borrow().len(), 1);
        }
    }

    #[test]
    fn wildcard_after_apex_waits_for_settle_and_shares_record() {
        let authority = ScriptedAuthority::default();
        authority.script("authz:example.com", pending_then_valid(0));
        authority.script("authz:*.example.com", pending_then_valid(1));
        let dns = MemoryDnsProvider::new();
        let sleeper = RecordingSleeper::default();
        let orchestrator =
            ChallengeOrchestrator::new(&authority, &dns, &sleeper, PollPolicy::default());

        let outcome = orchestrator.run(&[descriptor("example.com"), descriptor("*.example.com")]);

        assert!(outcome.result.is_ok());
        // apex: initial delay; wildcard: settle, initial delay, one interval
        assert_eq!(*sleeper.waits.borrow(), secs(&[5, 60, 5, 5]));
        assert_eq!(outcome.cleanup.len(), 2);
        let names: Vec<String> = outcome.cleanup.iter().map(RecordKey::record_name).collect();
        assert_eq!(names[0], names[1]);
        assert_eq!(dns.records().len(), 1);
        assert_eq!(
            dns.record("_acme-challenge.example.com").unwrap().value,
            "value-for-*.example.com"
        );
    }

    #[test]
    fn distinct_records_do_not_wait_for_settle() {
        let authority = ScriptedAuthority::default();
        authority.script("authz:example.com", pending_then_valid(0));
        authority.script("authz:www.example.com", pending_then_valid(0));
        let dns = MemoryDnsProvider::new();
        let sleeper = RecordingSleeper::default();
        let orchestrator =
            ChallengeOrchestrator::new(&authority, &dns, &sleeper, PollPolicy::default());

        let outcome =
            orchestrator.run(&[descriptor("example.com"), descriptor("www.example.com")]);

        assert!(outcome.result.is_ok());
        assert_eq!(*sleeper.waits.borrow(), secs(&[5, 5]));
        assert_eq!(dns.records().len(), 2);
    }

    #[test]
    fn duplicate_descriptors_yield_one_cleanup_entry() {
        let authority = ScriptedAuthority::default();
        authority.script("authz:example.com", vec![AuthorizationStatus::Valid]);
        let dns = MemoryDnsProvider::new();
        let sleeper = RecordingSleeper::default();
        let orchestrator =
            ChallengeOrchestrator::new(&authority, &dns, &sleeper, PollPolicy::default());

        let outcome = orchestrator.run(&[descriptor("example.com"), descriptor("example.com")]);

        assert!(outcome.result.is_ok());
        assert_eq!(outcome.cleanup.len(), 1);
    }

    #[test]
    fn upsert_failure_aborts_and_keeps_earlier_cleanup() {
        let authority = ScriptedAuthority::default();
        authority.script("authz:example.com", vec![AuthorizationStatus::Valid]);
        authority.script("authz:www.example.com", vec![AuthorizationStatus::Valid]);
        let dns = MemoryDnsProvider::new();
        dns.fail_upserts_for("_acme-challenge.www.example.com");
        let sleeper = RecordingSleeper::default();
        let orchestrator =
            ChallengeOrchestrator::new(&authority, &dns, &sleeper, PollPolicy::default());

        let outcome =
            orchestrator.run(&[descriptor("example.com"), descriptor("www.example.com")]);

        assert!(matches!(outcome.result, Err(IssuanceError::DnsProvider(_))));
        let domains: Vec<&str> = outcome.cleanup.iter().map(|k| k.domain.as_str()).collect();
        assert_eq!(domains, vec!["example.com"]);
        assert_eq!(*authority.answered.borrow(), vec!["chall:example.com"]);
    }

    #[test]
    fn invalid_domain_fails_before_publishing() {
        let authority = ScriptedAuthority::default();
        let dns = MemoryDnsProvider::new();
        let sleeper = RecordingSleeper::default();
        let orchestrator =
            ChallengeOrchestrator::new(&authority, &dns, &sleeper, PollPolicy::default());

        let outcome = orchestrator.run(&[descriptor("localhost")]);

        assert!(matches!(
            outcome.result,
            Err(IssuanceError::InvalidDomainFormat { .. })
        ));
        assert!(dns.upserts().is_empty());
        assert!(outcome.cleanup.is_empty());
    }

    #[test]
    fn every_domain_passes_through_polling() {
        let authority = ScriptedAuthority::default();
        authority.script("authz:example.com", vec![AuthorizationStatus::Valid]);
        let dns = MemoryDnsProvider::new();
        let sleeper = RecordingSleeper::default();
        let orchestrator =
            ChallengeOrchestrator::new(&authority, &dns, &sleeper, PollPolicy::default());

        let outcome = orchestrator.run(&[descriptor("example.com")]);

        let states: Vec<ChallengeState> =
            outcome.transitions.iter().map(|(_, state)| *state).collect();
        assert_eq!(
            states,
            vec![
                ChallengeState::Published,
                ChallengeState::ResponseSubmitted,
                ChallengeState::Polling,
                ChallengeState::Valid,
            ]
        );
    }
}
