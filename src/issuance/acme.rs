use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, MutexGuard,
        mpsc::{self, Receiver, RecvTimeoutError, TryRecvError},
    },
    thread,
    time::Duration,
};

use acme_lib::{
    Account, Directory, DirectoryUrl, Error as AcmeError,
    api::ApiAuth,
    order::{Auth, NewOrder},
    persist::{Persist, PersistKey, PersistKind},
};
use log::{debug, info, warn};
use uuid::Uuid;

use super::issuer::{
    Authorization, AuthorizationHandle, AuthorizationStatus, CertificateAuthority, Challenge,
    ChallengeHandle, ChallengeKind, IssuerError, OrderHandle, OrderRequest,
};

const MAX_FINALIZE_REFRESHES: u32 = 10;
/// How long `answer_challenge` waits for the challenge POST to fail fast.
const ANSWER_GRACE: Duration = Duration::from_secs(2);
/// acme-lib's message when the authority rejects a challenge.
const VALIDATION_FAILED_PREFIX: &str = "Validation failed";

type ValidationResult = Result<(), IssuerError>;

/// In-memory persistence for acme-lib that avoids disk I/O and lets us seed the ACME account key.
#[derive(Clone, Default)]
pub struct EphemeralPersist {
    inner: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl EphemeralPersist {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed_account_key(&self, realm: &str, pem: &[u8]) -> Result<(), AcmeError> {
        let key = PersistKey::new(realm, PersistKind::AccountPrivateKey, "acme_account");
        self.put(&key, pem)
    }
}

impl Persist for EphemeralPersist {
    fn put(&self, key: &PersistKey, value: &[u8]) -> acme_lib::Result<()> {
        let mut lock = self
            .inner
            .lock()
            .map_err(|e| AcmeError::Other(e.to_string()))?;
        lock.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn get(&self, key: &PersistKey) -> acme_lib::Result<Option<Vec<u8>>> {
        let lock = self
            .inner
            .lock()
            .map_err(|e| AcmeError::Other(e.to_string()))?;
        Ok(lock.get(&key.to_string()).cloned())
    }
}

/// Where a handle handed out by this adapter points.
#[derive(Debug, Clone)]
struct HandleTarget {
    order_id: String,
    /// Requested name, `*.`-prefixed for wildcard authorizations.
    identity: String,
}

impl HandleTarget {
    fn validation_key(&self) -> String {
        format!("{}/{}", self.order_id, self.identity)
    }
}

#[derive(Default)]
struct State {
    directory: Option<Directory<EphemeralPersist>>,
    account: Option<Account<EphemeralPersist>>,
    orders: HashMap<String, NewOrder<EphemeralPersist>>,
    authorizations: HashMap<String, HandleTarget>,
    challenges: HashMap<String, HandleTarget>,
    /// Background validations still running, keyed by `order/identity`.
    validations: HashMap<String, Receiver<ValidationResult>>,
}

/// `CertificateAuthority` backed by acme-lib.
///
/// acme-lib's challenge `validate` posts the response and then blocks until the
/// authorization leaves `pending`, with no attempt cap. `answer_challenge` runs it on
/// a worker thread and returns after a short grace period, so the caller's own
/// bounded polling decides when to give up. Errors from the worker other than a
/// validation verdict surface from `answer_challenge` or the next poll.
pub struct AcmeLibAuthority {
    directory_url: String,
    account_key_pem: String,
    persist: EphemeralPersist,
    challenge_poll: Duration,
    finalize_poll: Duration,
    state: Mutex<State>,
}

impl AcmeLibAuthority {
    pub fn new(
        directory_url: impl Into<String>,
        account_key_pem: impl Into<String>,
        challenge_poll: Duration,
        finalize_poll: Duration,
    ) -> Self {
        Self {
            directory_url: directory_url.into(),
            account_key_pem: account_key_pem.into(),
            persist: EphemeralPersist::new(),
            challenge_poll,
            finalize_poll,
            state: Mutex::new(State::default()),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>, IssuerError> {
        self.state
            .lock()
            .map_err(|_| IssuerError::Operation("ACME client state poisoned".into()))
    }

    fn find_auth(
        order: &NewOrder<EphemeralPersist>,
        target: &HandleTarget,
    ) -> Result<Auth<EphemeralPersist>, IssuerError> {
        order
            .authorizations()
            .map_err(operation)?
            .into_iter()
            .find(|auth| auth_identity(auth) == target.identity)
            .ok_or_else(|| {
                IssuerError::Operation(format!(
                    "authorization for {} no longer present in order",
                    target.identity
                ))
            })
    }
}

impl CertificateAuthority for AcmeLibAuthority {
    fn bootstrap(&self) -> Result<(), IssuerError> {
        let mut state = self.lock()?;
        if state.directory.is_some() {
            return Ok(());
        }
        let directory = Directory::from_url(
            self.persist.clone(),
            DirectoryUrl::Other(&self.directory_url),
        )
        .map_err(|e| IssuerError::Unavailable(format!("{}: {e}", self.directory_url)))?;
        info!("[acme] directory loaded from {}", self.directory_url);
        state.directory = Some(directory);
        Ok(())
    }

    fn ensure_account(&self, contact_email: &str) -> Result<(), IssuerError> {
        let mut state = self.lock()?;
        if state.account.is_some() {
            return Ok(());
        }
        let directory = state
            .directory
            .as_ref()
            .ok_or_else(|| IssuerError::InvalidConfig("directory not bootstrapped".into()))?;

        self.persist
            .seed_account_key(contact_email, self.account_key_pem.as_bytes())
            .map_err(operation)?;
        let account = directory
            .account_with_realm(contact_email, Some(vec![format!("mailto:{contact_email}")]))
            .map_err(operation)?;
        info!("[acme] account ready for {}", contact_email);
        state.account = Some(account);
        Ok(())
    }

    fn create_order(&self, request: &OrderRequest) -> Result<OrderHandle, IssuerError> {
        let mut state = self.lock()?;
        let account = state
            .account
            .as_ref()
            .ok_or_else(|| IssuerError::InvalidConfig("account not registered".into()))?;
        let primary = request
            .domains
            .first()
            .ok_or_else(|| IssuerError::InvalidConfig("primary domain missing".into()))?;
        let alt_names: Vec<&str> = request.domains.iter().skip(1).map(String::as_str).collect();

        let order = account.new_order(primary, &alt_names).map_err(operation)?;
        // acme-lib derives its own CSR from the certificate key at finalization.
        debug!(
            "[acme] CSR prepared for {} ({} bytes)",
            primary,
            request.csr_pem.len()
        );

        let order_id = Uuid::new_v4().to_string();
        info!(
            "[acme] order {} created for {}",
            order_id,
            request.domains.join(", ")
        );
        state.orders.insert(order_id.clone(), order);
        Ok(OrderHandle { id: order_id })
    }

    fn authorizations(&self, order: &OrderHandle) -> Result<Vec<Authorization>, IssuerError> {
        let mut state = self.lock()?;
        let auths = state
            .orders
            .get(&order.id)
            .ok_or_else(|| IssuerError::Operation(format!("unknown order {}", order.id)))?
            .authorizations()
            .map_err(operation)?;

        let mut authorizations = Vec::with_capacity(auths.len());
        for auth in &auths {
            let identity = auth_identity(auth);
            let target = HandleTarget {
                order_id: order.id.clone(),
                identity: identity.clone(),
            };
            let authz_id = Uuid::new_v4().to_string();
            state.authorizations.insert(authz_id.clone(), target.clone());

            let mut challenges = Vec::new();
            for api_challenge in &auth.api_auth().challenges {
                let kind = ChallengeKind::from_type(&api_challenge._type);
                let challenge_id = Uuid::new_v4().to_string();
                let proof = match kind {
                    ChallengeKind::Dns01 => {
                        state.challenges.insert(challenge_id.clone(), target.clone());
                        Some(auth.dns_challenge().dns_proof())
                    }
                    _ => None,
                };
                challenges.push(Challenge {
                    handle: ChallengeHandle { id: challenge_id },
                    kind,
                    proof,
                });
            }

            authorizations.push(Authorization {
                handle: AuthorizationHandle { id: authz_id },
                domain: identity,
                status: auth_status(auth),
                challenges,
            });
        }
        Ok(authorizations)
    }

    fn answer_challenge(&self, challenge: &ChallengeHandle) -> Result<(), IssuerError> {
        let state = self.lock()?;
        let target = state
            .challenges
            .get(&challenge.id)
            .ok_or_else(|| IssuerError::Operation(format!("unknown challenge {}", challenge.id)))?;
        let order = state
            .orders
            .get(&target.order_id)
            .ok_or_else(|| IssuerError::Operation(format!("unknown order {}", target.order_id)))?;
        let auth = Self::find_auth(order, target)?;
        let target = target.clone();

        info!("[acme] submitting dns-01 response for {}", target.identity);
        let poll_millis = u64::try_from(self.challenge_poll.as_millis()).unwrap_or(u64::MAX);
        let challenge = auth.dns_challenge();
        let identity = target.identity.clone();
        let (tx, rx) = mpsc::channel();
        thread::Builder::new()
            .name(format!("acme-validate-{identity}"))
            .spawn(move || {
                let result = validation_outcome(&identity, challenge.validate(poll_millis));
                // The receiver is gone once the run has moved on.
                let _ = tx.send(result);
            })
            .map_err(|e| IssuerError::Operation(format!("failed to start validation: {e}")))?;
        drop(state);

        match await_answer(&rx, ANSWER_GRACE) {
            Some(result) => result,
            None => {
                debug!(
                    "[acme] dns-01 response for {} accepted, validation continues",
                    target.identity
                );
                self.lock()?
                    .validations
                    .insert(target.validation_key(), rx);
                Ok(())
            }
        }
    }

    fn poll_authorization(
        &self,
        authorization: &AuthorizationHandle,
    ) -> Result<AuthorizationStatus, IssuerError> {
        let mut state = self.lock()?;
        let target = state
            .authorizations
            .get(&authorization.id)
            .cloned()
            .ok_or_else(|| {
                IssuerError::Operation(format!("unknown authorization {}", authorization.id))
            })?;

        let key = target.validation_key();
        let worker = state.validations.get(&key).map(Receiver::try_recv);
        match worker {
            Some(Ok(result)) => {
                state.validations.remove(&key);
                result?;
            }
            Some(Err(TryRecvError::Disconnected)) => {
                state.validations.remove(&key);
            }
            Some(Err(TryRecvError::Empty)) | None => {}
        }

        let order = state
            .orders
            .get(&target.order_id)
            .ok_or_else(|| IssuerError::Operation(format!("unknown order {}", target.order_id)))?;
        let auth = Self::find_auth(order, &target)?;
        Ok(auth_status(&auth))
    }

    fn finalize_and_fetch(
        &self,
        order: &OrderHandle,
        private_key_pem: &str,
    ) -> Result<String, IssuerError> {
        let mut new_order = {
            let mut state = self.lock()?;
            state.authorizations.retain(|_, target| target.order_id != order.id);
            state.challenges.retain(|_, target| target.order_id != order.id);
            let prefix = format!("{}/", order.id);
            state.validations.retain(|key, _| !key.starts_with(&prefix));
            state
                .orders
                .remove(&order.id)
                .ok_or_else(|| IssuerError::Operation(format!("unknown order {}", order.id)))?
        };

        let mut refreshes = 0;
        let csr_order = loop {
            if let Some(csr) = new_order.confirm_validations() {
                break csr;
            }
            if refreshes >= MAX_FINALIZE_REFRESHES {
                return Err(IssuerError::Operation(format!(
                    "order {} not ready after {} refreshes",
                    order.id, refreshes
                )));
            }
            refreshes += 1;
            std::thread::sleep(self.finalize_poll);
            new_order.refresh().map_err(operation)?;
        };

        let finalize_millis = u64::try_from(self.finalize_poll.as_millis()).unwrap_or(u64::MAX);
        let cert_order = csr_order
            .finalize(private_key_pem, finalize_millis)
            .map_err(operation)?;
        let certificate = cert_order.download_and_save_cert().map_err(operation)?;
        info!("[acme] certificate downloaded for order {}", order.id);
        Ok(certificate.certificate().to_string())
    }
}

fn operation(err: AcmeError) -> IssuerError {
    IssuerError::Operation(err.to_string())
}

/// Transport failures mean the authority could not be reached; anything else the
/// library reports is an operation error.
fn classify(err: AcmeError) -> IssuerError {
    match err {
        AcmeError::Call(message) => IssuerError::Unavailable(message),
        AcmeError::Io(err) => IssuerError::Unavailable(err.to_string()),
        other => operation(other),
    }
}

/// A rejected challenge is not an error here: the authorization status carries it.
fn validation_outcome(identity: &str, result: Result<(), AcmeError>) -> ValidationResult {
    match result {
        Ok(()) => Ok(()),
        Err(AcmeError::Other(message)) if message.starts_with(VALIDATION_FAILED_PREFIX) => {
            warn!("[acme] dns-01 validation for {} reported: {}", identity, message);
            Ok(())
        }
        Err(err) => Err(classify(err)),
    }
}

/// `None` when the worker is still running after `grace`.
fn await_answer(rx: &Receiver<ValidationResult>, grace: Duration) -> Option<ValidationResult> {
    match rx.recv_timeout(grace) {
        Ok(result) => Some(result),
        Err(RecvTimeoutError::Timeout) => None,
        Err(RecvTimeoutError::Disconnected) => Some(Err(IssuerError::Operation(
            "dns-01 validation worker exited without a result".into(),
        ))),
    }
}

/// acme-lib reports wildcard authorizations by their bare name plus a flag.
fn auth_identity(auth: &Auth<EphemeralPersist>) -> String {
    if auth.api_auth().wildcard.unwrap_or(false) {
        format!("*.{}", auth.domain_name())
    } else {
        auth.domain_name().to_string()
    }
}

fn auth_status(auth: &Auth<EphemeralPersist>) -> AuthorizationStatus {
    api_status(auth.api_auth())
}

fn api_status(api: &ApiAuth) -> AuthorizationStatus {
    if api.is_status_valid() {
        AuthorizationStatus::Valid
    } else if api.is_status_pending() {
        AuthorizationStatus::Pending
    } else if api.is_status_invalid() {
        AuthorizationStatus::Invalid
    } else if api.is_status_expired() {
        AuthorizationStatus::Expired
    } else if api.is_status_deactivated() {
        AuthorizationStatus::Deactivated
    } else if api.is_status_revoked() {
        AuthorizationStatus::Revoked
    } else {
        AuthorizationStatus::Other(api.status.clone())
    }
}
