//! Public-key authentication with per-connection policy caching.
//!
//! An SSH client typically offers the same key twice: once as a bare probe
//! and once with a signature. The authenticator resolves the policy at most
//! once per (username, key) pair and remembers it for the lifetime of the
//! connection. Once a key has authenticated, the identity is pinned: a
//! later attempt with a different key is rejected outright.

use std::sync::Arc;

use anyhow::Result;
use tracing::{debug, warn};

use crate::keys;
use crate::policy::{Policy, PolicyResolver};

pub enum AuthOutcome {
    Accept(Arc<dyn Policy>),
    Reject,
}

struct CacheSlot {
    username: String,
    fingerprint: String,
    policy: Arc<dyn Policy>,
}

pub struct Authenticator {
    resolver: Arc<dyn PolicyResolver>,
    slot: Option<CacheSlot>,
    done: bool,
}

impl Authenticator {
    pub fn new(resolver: Arc<dyn PolicyResolver>) -> Self {
        Self {
            resolver,
            slot: None,
            done: false,
        }
    }

    /// Whether a signed authentication has succeeded on this connection.
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// The policy of the authenticated identity, once authentication is done.
    pub fn policy(&self) -> Option<Arc<dyn Policy>> {
        if self.done {
            self.slot.as_ref().map(|slot| slot.policy.clone())
        } else {
            None
        }
    }

    /// A key probe (no signature yet). Accepting tells the client that
    /// signing with this key is worth the effort.
    pub async fn offer(&mut self, username: &str, key: &russh::keys::PublicKey) -> AuthOutcome {
        self.lookup(username, key).await
    }

    /// A signed authentication request. The signature itself has already
    /// been verified by the transport; this decides whether the key maps
    /// to a policy.
    pub async fn verify(&mut self, username: &str, key: &russh::keys::PublicKey) -> AuthOutcome {
        let outcome = self.lookup(username, key).await;
        if let AuthOutcome::Accept(_) = outcome {
            self.done = true;
        }
        outcome
    }

    async fn lookup(&mut self, username: &str, key: &russh::keys::PublicKey) -> AuthOutcome {
        let fingerprint = keys::fingerprint(key);

        if let Some(slot) = &self.slot {
            if slot.username == username && slot.fingerprint == fingerprint {
                return AuthOutcome::Accept(slot.policy.clone());
            }
            if self.done {
                // The connection already authenticated as someone else.
                warn!(
                    user = %username,
                    fingerprint = %fingerprint,
                    authenticated = %slot.fingerprint,
                    "rejecting identity switch after authentication"
                );
                return AuthOutcome::Reject;
            }
            // Pre-auth the client is free to try another identity, but the
            // old cache entry no longer applies.
            self.slot = None;
        }

        match self.resolver.resolve(username, key).await {
            Ok(Some(policy)) => {
                debug!(user = %username, fingerprint = %fingerprint, policy = %policy.label(), "key resolved");
                self.slot = Some(CacheSlot {
                    username: username.to_string(),
                    fingerprint,
                    policy: policy.clone(),
                });
                AuthOutcome::Accept(policy)
            }
            Ok(None) => {
                debug!(user = %username, fingerprint = %fingerprint, "unknown key");
                AuthOutcome::Reject
            }
            Err(e) => {
                // Resolver trouble fails this attempt only; nothing is
                // cached, so a retry hits the resolver again.
                warn!(user = %username, fingerprint = %fingerprint, error = %e, "policy resolution failed");
                AuthOutcome::Reject
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::DenyAllPolicy;
    use async_trait::async_trait;
    use russh::keys::ssh_key::rand_core::OsRng;
    use russh::keys::{Algorithm, PrivateKey, PublicKey};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn test_key() -> PublicKey {
        PrivateKey::random(&mut OsRng, Algorithm::Ed25519)
            .unwrap()
            .public_key()
            .clone()
    }

    struct CountingResolver {
        calls: AtomicUsize,
        accept: bool,
        fail: bool,
    }

    impl CountingResolver {
        fn accepting() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                accept: true,
                fail: false,
            }
        }

        fn rejecting() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                accept: false,
                fail: false,
            }
        }

        fn failing() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                accept: false,
                fail: true,
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl PolicyResolver for CountingResolver {
        async fn resolve(
            &self,
            _username: &str,
            _key: &PublicKey,
        ) -> Result<Option<Arc<dyn Policy>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("directory offline");
            }
            if self.accept {
                Ok(Some(Arc::new(DenyAllPolicy::new("test"))))
            } else {
                Ok(None)
            }
        }
    }

    #[tokio::test]
    async fn probe_then_verify_resolves_once() {
        let resolver = Arc::new(CountingResolver::accepting());
        let mut auth = Authenticator::new(resolver.clone());
        let key = test_key();

        assert!(matches!(
            auth.offer("ops", &key).await,
            AuthOutcome::Accept(_)
        ));
        assert!(!auth.is_done());
        assert!(auth.policy().is_none());

        assert!(matches!(
            auth.verify("ops", &key).await,
            AuthOutcome::Accept(_)
        ));
        assert!(auth.is_done());
        assert!(auth.policy().is_some());

        assert_eq!(resolver.calls(), 1);
    }

    #[tokio::test]
    async fn changing_keys_before_auth_resolves_again() {
        let resolver = Arc::new(CountingResolver::accepting());
        let mut auth = Authenticator::new(resolver.clone());

        auth.offer("ops", &test_key()).await;
        auth.offer("ops", &test_key()).await;
        assert_eq!(resolver.calls(), 2);
    }

    #[tokio::test]
    async fn changing_username_before_auth_resolves_again() {
        let resolver = Arc::new(CountingResolver::accepting());
        let mut auth = Authenticator::new(resolver.clone());
        let key = test_key();

        auth.offer("ops", &key).await;
        auth.offer("admin", &key).await;
        assert_eq!(resolver.calls(), 2);
    }

    #[tokio::test]
    async fn different_key_after_auth_is_rejected() {
        let resolver = Arc::new(CountingResolver::accepting());
        let mut auth = Authenticator::new(resolver.clone());
        let key = test_key();

        auth.verify("ops", &key).await;
        assert!(auth.is_done());

        assert!(matches!(
            auth.verify("ops", &test_key()).await,
            AuthOutcome::Reject
        ));
        // The rejection never consulted the resolver and the original
        // identity stays in place.
        assert_eq!(resolver.calls(), 1);
        assert!(auth.policy().is_some());
    }

    #[tokio::test]
    async fn unknown_keys_are_not_cached() {
        let resolver = Arc::new(CountingResolver::rejecting());
        let mut auth = Authenticator::new(resolver.clone());
        let key = test_key();

        assert!(matches!(auth.offer("ops", &key).await, AuthOutcome::Reject));
        assert!(matches!(auth.offer("ops", &key).await, AuthOutcome::Reject));
        // No negative caching: each attempt asks the resolver.
        assert_eq!(resolver.calls(), 2);
        assert!(!auth.is_done());
    }

    #[tokio::test]
    async fn resolver_errors_reject_the_attempt_only() {
        let resolver = Arc::new(CountingResolver::failing());
        let mut auth = Authenticator::new(resolver.clone());
        let key = test_key();

        assert!(matches!(
            auth.verify("ops", &key).await,
            AuthOutcome::Reject
        ));
        assert!(!auth.is_done());
        assert!(matches!(
            auth.verify("ops", &key).await,
            AuthOutcome::Reject
        ));
        assert_eq!(resolver.calls(), 2);
    }
}
