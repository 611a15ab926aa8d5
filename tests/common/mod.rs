#![allow(dead_code)]

use std::{
    cell::RefCell,
    collections::{HashMap, VecDeque},
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use dns01_issuer::{
    config::CertificatePaths,
    issuance::{
        delay::Sleeper,
        issuer::{
            Authorization, AuthorizationHandle, AuthorizationStatus, CertificateAuthority,
            Challenge, ChallengeHandle, ChallengeKind, IssuerError, OrderHandle, OrderRequest,
        },
    },
};
use rcgen::{BasicConstraints, CertificateParams, IsCa, KeyPair};
use uuid::Uuid;

#[derive(Default)]
pub struct RecordingSleeper {
    waits: RefCell<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn waits_secs(&self) -> Vec<u64> {
        self.waits.borrow().iter().map(Duration::as_secs).collect()
    }
}

impl Sleeper for RecordingSleeper {
    fn sleep(&self, duration: Duration) {
        self.waits.borrow_mut().push(duration);
    }
}

/// Scripted certificate authority. Every authorization offers http-01 and dns-01
/// unless told otherwise; polls return scripted statuses (the last one repeats) and
/// default to `valid`.
#[derive(Default)]
pub struct FakeAuthority {
    reject_orders: bool,
    without_dns01: bool,
    scripts: RefCell<HashMap<String, VecDeque<AuthorizationStatus>>>,
    orders: RefCell<HashMap<String, Vec<String>>>,
    pub calls: RefCell<Vec<String>>,
}

impl FakeAuthority {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rejecting_orders() -> Self {
        Self {
            reject_orders: true,
            ..Self::default()
        }
    }

    pub fn without_dns01() -> Self {
        Self {
            without_dns01: true,
            ..Self::default()
        }
    }

    pub fn script(&self, domain: &str, statuses: Vec<AuthorizationStatus>) {
        self.scripts
            .borrow_mut()
            .insert(format!("authz:{domain}"), statuses.into());
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.borrow().clone()
    }

    fn call(&self, name: impl Into<String>) {
        self.calls.borrow_mut().push(name.into());
    }
}

impl CertificateAuthority for FakeAuthority {
    fn bootstrap(&self) -> Result<(), IssuerError> {
        self.call("bootstrap");
        Ok(())
    }

    fn ensure_account(&self, contact_email: &str) -> Result<(), IssuerError> {
        self.call(format!("account:{contact_email}"));
        Ok(())
    }

    fn create_order(&self, request: &OrderRequest) -> Result<OrderHandle, IssuerError> {
        self.call("create_order");
        assert!(request.csr_pem.contains("CERTIFICATE REQUEST"));
        if self.reject_orders {
            return Err(IssuerError::Operation(
                "CSR does not match requested identifiers".into(),
            ));
        }
        let id = format!("order-{}", self.orders.borrow().len() + 1);
        self.orders
            .borrow_mut()
            .insert(id.clone(), request.domains.clone());
        Ok(OrderHandle { id })
    }

    fn authorizations(&self, order: &OrderHandle) -> Result<Vec<Authorization>, IssuerError> {
        let orders = self.orders.borrow();
        let domains = orders
            .get(&order.id)
            .ok_or_else(|| IssuerError::Operation("unknown order".into()))?;
        Ok(domains
            .iter()
            .map(|domain| {
                let mut challenges = vec![Challenge {
                    handle: ChallengeHandle {
                        id: format!("http:{domain}"),
                    },
                    kind: ChallengeKind::Http01,
                    proof: None,
                }];
                if !self.without_dns01 {
                    challenges.push(Challenge {
                        handle: ChallengeHandle {
                            id: format!("dns:{domain}"),
                        },
                        kind: ChallengeKind::Dns01,
                        proof: Some(format!("proof-{domain}")),
                    });
                }
                Authorization {
                    handle: AuthorizationHandle {
                        id: format!("authz:{domain}"),
                    },
                    domain: domain.clone(),
                    status: AuthorizationStatus::Pending,
                    challenges,
                }
            })
            .collect())
    }

    fn answer_challenge(&self, challenge: &ChallengeHandle) -> Result<(), IssuerError> {
        self.call(format!("answer:{}", challenge.id));
        Ok(())
    }

    fn poll_authorization(
        &self,
        authorization: &AuthorizationHandle,
    ) -> Result<AuthorizationStatus, IssuerError> {
        let mut scripts = self.scripts.borrow_mut();
        let status = match scripts.get_mut(&authorization.id) {
            Some(script) if script.len() > 1 => script.pop_front(),
            Some(script) => script.front().cloned(),
            None => None,
        };
        Ok(status.unwrap_or(AuthorizationStatus::Valid))
    }

    fn finalize_and_fetch(
        &self,
        order: &OrderHandle,
        private_key_pem: &str,
    ) -> Result<String, IssuerError> {
        self.call("finalize");
        assert!(private_key_pem.contains("PRIVATE KEY"));
        let domains = self
            .orders
            .borrow()
            .get(&order.id)
            .cloned()
            .ok_or_else(|| IssuerError::Operation("unknown order".into()))?;
        Ok(sample_chain(&domains))
    }
}

/// Leaf for `domains` signed by a throwaway CA, leaf first.
pub fn sample_chain(domains: &[String]) -> String {
    let mut ca_params =
        CertificateParams::new(vec!["ca.example.net".to_string()]).expect("ca params");
    ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    let ca_key = KeyPair::generate().expect("ca key");
    let ca = ca_params.self_signed(&ca_key).expect("create ca cert");

    let leaf_params = CertificateParams::new(domains.to_vec()).expect("leaf params");
    let leaf_key = KeyPair::generate().expect("leaf key");
    let leaf = leaf_params
        .signed_by(&leaf_key, &ca, &ca_key)
        .expect("create leaf cert");
    format!("{}{}", leaf.pem(), ca.pem())
}

pub fn temp_dir() -> PathBuf {
    let dir = std::env::temp_dir().join(format!("dns01-workflow-{}", Uuid::new_v4()));
    fs::create_dir_all(&dir).expect("create temp dir");
    dir
}

pub fn paths_in(dir: &Path) -> CertificatePaths {
    CertificatePaths {
        account_key: dir.join("keys/account.key"),
        private_key: dir.join("keys/example.com.key"),
        certificate: dir.join("certs/example.com.crt"),
        full_chain: dir.join("certs/example.com-chain.crt"),
    }
}
