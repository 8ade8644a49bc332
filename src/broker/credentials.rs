/// Credential Lifecycle Manager
///
/// Hands out an access token that the provider currently accepts, probing a
/// cached one first and otherwise minting and exchanging request tokens
/// under the bound enforced by [`RefreshMachine`].

use crate::broker::endpoints::ProviderEndpoints;
use crate::broker::login::RequestTokenSource;
use crate::broker::refresh::{RefreshEvent, RefreshMachine, RefreshState};
use crate::broker::session::{ProbeOutcome, SessionApi};
use crate::config::{AccountConfig, AccountSecrets, BrokerConfig};
use crate::error::{Error, Result};
use crate::storage::CredentialStore;
use arc_swap::ArcSwap;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub struct CredentialManager {
    store: CredentialStore,
    config: ArcSwap<BrokerConfig>,
    session: Arc<dyn SessionApi>,
    login: Arc<dyn RequestTokenSource>,
    endpoints: ProviderEndpoints,
    // one refresh per api key at a time so two callers never burn each other's request token
    refresh_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl CredentialManager {
    pub fn new(
        store: CredentialStore,
        config: Arc<BrokerConfig>,
        session: Arc<dyn SessionApi>,
        login: Arc<dyn RequestTokenSource>,
        endpoints: ProviderEndpoints,
    ) -> Self {
        Self {
            store,
            config: ArcSwap::new(config),
            session,
            login,
            endpoints,
            refresh_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Swap in a freshly loaded broker config; refreshes already running keep their snapshot.
    pub fn reload(&self, config: Arc<BrokerConfig>) {
        self.config.store(config);
    }

    pub fn config(&self) -> Arc<BrokerConfig> {
        self.config.load_full()
    }

    /// Return an access token for `api_key` the provider accepts right now.
    ///
    /// Every provider call and the wait for another caller's refresh give up
    /// as soon as `cancel` fires.
    pub async fn get_valid_access_token(
        &self,
        api_key: &str,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let config = self.config.load_full();
        let account = config.account(api_key).ok_or_else(|| {
            Error::Configuration(format!("no broker account configured for api key {api_key}"))
        })?;
        let secrets = account.secrets()?;

        let lock = self.refresh_lock(api_key).await;
        let _guard = tokio::select! {
            guard = lock.lock_owned() => guard,
            _ = cancel.cancelled() => return Err(cancelled(api_key)),
        };

        let row = self.store.get(api_key).await?;
        let mut consumed = row.as_ref().and_then(|r| r.consumed_request_token.clone());
        let mut machine = match row {
            Some(row) => RefreshMachine::new(row.access_token, row.request_token),
            None => RefreshMachine::new(None, None),
        };
        let mut login_error = None;

        loop {
            let event = match machine.state().clone() {
                RefreshState::Probing { access_token } => {
                    let outcome = tokio::select! {
                        outcome = self.session.probe(api_key, &access_token) => outcome,
                        _ = cancel.cancelled() => return Err(cancelled(api_key)),
                    };
                    match outcome {
                        ProbeOutcome::Valid => RefreshEvent::ProbeSucceeded,
                        outcome => {
                            info!("🔄 Access token for {} not usable ({:?})", secrets.name, outcome);
                            RefreshEvent::ProbeFailed
                        }
                    }
                }
                RefreshState::NeedsRequestToken => {
                    match self
                        .mint(&config, account, &secrets, consumed.as_deref(), cancel)
                        .await
                    {
                        Ok(request_token) => {
                            self.store.store_request_token(api_key, &request_token).await?;
                            RefreshEvent::RequestTokenMinted(request_token)
                        }
                        Err(e) => {
                            let reason = e.to_string();
                            login_error = Some(e);
                            RefreshEvent::LoginFailed(reason)
                        }
                    }
                }
                RefreshState::Exchanging { request_token } => {
                    let outcome = tokio::select! {
                        outcome = self.session.exchange(&secrets, &request_token) => Some(outcome),
                        _ = cancel.cancelled() => None,
                    };
                    // an interrupted exchange may still have reached the provider
                    self.store.consume_request_token(api_key, &request_token).await?;
                    consumed = Some(request_token);
                    match outcome {
                        None => return Err(cancelled(api_key)),
                        Some(Ok(access_token)) => {
                            self.store.store_access_token(api_key, &access_token).await?;
                            RefreshEvent::ExchangeSucceeded(access_token)
                        }
                        Some(Err(e)) => {
                            warn!(
                                "⚠️ Exchange attempt {} for {} failed: {}",
                                machine.exchange_attempts() + 1,
                                secrets.name,
                                e
                            );
                            RefreshEvent::ExchangeFailed(e.to_string())
                        }
                    }
                }
                RefreshState::Valid { access_token } => {
                    info!("✅ Valid access token for {}", secrets.name);
                    return Ok(access_token);
                }
                RefreshState::Failed { reason } => {
                    return Err(login_error.unwrap_or_else(|| Error::Credential {
                        api_key: api_key.to_string(),
                        attempts: machine.exchange_attempts(),
                        reason,
                    }));
                }
            };
            machine.apply(event);
        }
    }

    /// Login URL a human would use for this account
    pub fn manual_login_url(&self, api_key: &str) -> String {
        self.endpoints.connect_login_url(api_key)
    }

    async fn refresh_lock(&self, api_key: &str) -> Arc<Mutex<()>> {
        let mut locks = self.refresh_locks.lock().await;
        Arc::clone(locks.entry(api_key.to_string()).or_default())
    }

    /// Fresh request token: automated login first, then the operator-supplied one.
    async fn mint(
        &self,
        config: &BrokerConfig,
        account: &AccountConfig,
        secrets: &AccountSecrets,
        consumed: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<String> {
        if config.auto_login {
            let minted = tokio::select! {
                minted = self.login.mint(secrets) => minted,
                _ = cancel.cancelled() => return Err(cancelled(&secrets.api_key)),
            };
            match minted {
                Ok(token) => return Ok(token),
                Err(e) => warn!("❌ Automated login for {} failed: {}", secrets.name, e),
            }
        } else {
            info!("Automated login disabled for {}", secrets.name);
        }

        let login_url = self.manual_login_url(&secrets.api_key);
        info!("--------------------------------");
        info!("🔑 Log in to the broker for {} at:", secrets.name);
        info!("{}", login_url);
        info!("then put the request token from the callback URL into the broker config");
        info!("--------------------------------");

        match account.manual_request_token() {
            Some(token) if Some(token) != consumed => {
                info!("📥 Using request token from broker config for {}", secrets.name);
                Ok(token.to_string())
            }
            _ => Err(Error::ManualLoginRequired {
                api_key: secrets.api_key.clone(),
                login_url,
            }),
        }
    }
}

fn cancelled(api_key: &str) -> Error {
    Error::Task(format!("token acquisition for {api_key} cancelled"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::database::test_pool;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    async fn token(manager: &CredentialManager, api_key: &str) -> Result<String> {
        manager
            .get_valid_access_token(api_key, &CancellationToken::new())
            .await
    }

    struct ScriptedSession {
        probe: ProbeOutcome,
        // Some(token) succeeds, None fails; empty script fails
        exchanges: StdMutex<VecDeque<Option<String>>>,
        exchanged: StdMutex<Vec<String>>,
        exchange_delay: Duration,
    }

    impl ScriptedSession {
        fn new(probe: ProbeOutcome, exchanges: Vec<Option<&str>>) -> Arc<Self> {
            Self::slow(probe, exchanges, Duration::ZERO)
        }

        fn slow(probe: ProbeOutcome, exchanges: Vec<Option<&str>>, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                probe,
                exchanges: StdMutex::new(
                    exchanges.into_iter().map(|e| e.map(String::from)).collect(),
                ),
                exchanged: StdMutex::new(Vec::new()),
                exchange_delay: delay,
            })
        }

        fn exchanged(&self) -> Vec<String> {
            self.exchanged.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl SessionApi for ScriptedSession {
        async fn probe(&self, _api_key: &str, _access_token: &str) -> ProbeOutcome {
            self.probe
        }

        async fn exchange(&self, _account: &AccountSecrets, request_token: &str) -> Result<String> {
            self.exchanged.lock().unwrap().push(request_token.to_string());
            tokio::time::sleep(self.exchange_delay).await;
            match self.exchanges.lock().unwrap().pop_front().flatten() {
                Some(token) => Ok(token),
                None => Err(Error::Authentication("token rejected".into())),
            }
        }
    }

    struct CountingLogin {
        calls: AtomicU32,
        fail: bool,
        delay: Duration,
    }

    impl CountingLogin {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicU32::new(0),
                fail,
                delay: Duration::ZERO,
            })
        }

        fn hanging() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicU32::new(0),
                fail: false,
                delay: Duration::from_secs(30),
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl RequestTokenSource for CountingLogin {
        async fn mint(&self, _account: &AccountSecrets) -> Result<String> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            tokio::time::sleep(self.delay).await;
            if self.fail {
                Err(Error::Authentication("2FA rejected".into()))
            } else {
                Ok(format!("rt-{n}"))
            }
        }
    }

    fn account(request_token: Option<&str>) -> AccountConfig {
        AccountConfig {
            name: "Primary".into(),
            api_key: "k1".into(),
            api_secret: "s1".into(),
            user_id: "AB1234".into(),
            password: "pw".into(),
            totp_token: "JBSWY3DPEHPK3PXP".into(),
            request_token: request_token.map(String::from),
        }
    }

    fn manager(
        store: CredentialStore,
        config: BrokerConfig,
        session: Arc<ScriptedSession>,
        login: Arc<CountingLogin>,
    ) -> CredentialManager {
        CredentialManager::new(
            store,
            Arc::new(config),
            session,
            login,
            ProviderEndpoints::new("http://web", "http://api"),
        )
    }

    fn config(auto_login: bool, account: AccountConfig) -> BrokerConfig {
        BrokerConfig {
            auto_login,
            accounts: vec![account],
        }
    }

    #[tokio::test]
    async fn valid_cached_token_needs_no_login() {
        let (_dir, pool) = test_pool().await;
        let store = CredentialStore::new(pool);
        store.store_access_token("k1", "at-cached").await.unwrap();

        let session = ScriptedSession::new(ProbeOutcome::Valid, vec![]);
        let login = CountingLogin::new(false);
        let manager = manager(store, config(true, account(None)), session.clone(), login.clone());

        assert_eq!(token(&manager, "k1").await.unwrap(), "at-cached");
        assert_eq!(login.calls(), 0);
        assert!(session.exchanged().is_empty());
    }

    #[tokio::test]
    async fn expired_token_gives_up_after_three_fresh_exchanges() {
        let (_dir, pool) = test_pool().await;
        let store = CredentialStore::new(pool);
        store.store_access_token("k1", "at-old").await.unwrap();

        let session = ScriptedSession::new(ProbeOutcome::Expired, vec![None, None, None, None]);
        let login = CountingLogin::new(false);
        let manager = manager(
            store.clone(),
            config(true, account(None)),
            session.clone(),
            login.clone(),
        );

        let err = token(&manager, "k1").await.unwrap_err();
        assert!(
            matches!(err, Error::Credential { attempts: 3, .. }),
            "{err:?}"
        );
        assert_eq!(login.calls(), 3);
        assert_eq!(session.exchanged(), vec!["rt-1", "rt-2", "rt-3"]);

        let row = store.get("k1").await.unwrap().unwrap();
        assert_eq!(row.request_token, None);
        assert_eq!(row.access_token.as_deref(), Some("at-old"));
    }

    #[tokio::test]
    async fn second_exchange_recovers_and_persists() {
        let (_dir, pool) = test_pool().await;
        let store = CredentialStore::new(pool);
        store.store_access_token("k1", "at-old").await.unwrap();

        let session =
            ScriptedSession::new(ProbeOutcome::Unreachable, vec![None, Some("at-new")]);
        let login = CountingLogin::new(false);
        let manager = manager(
            store.clone(),
            config(true, account(None)),
            session.clone(),
            login.clone(),
        );

        assert_eq!(token(&manager, "k1").await.unwrap(), "at-new");
        assert_eq!(login.calls(), 2);

        let row = store.get("k1").await.unwrap().unwrap();
        assert_eq!(row.access_token.as_deref(), Some("at-new"));
        assert_eq!(row.request_token, None);
        assert_eq!(row.consumed_request_token.as_deref(), Some("rt-2"));
    }

    #[tokio::test]
    async fn stored_request_token_is_exchanged_before_logging_in() {
        let (_dir, pool) = test_pool().await;
        let store = CredentialStore::new(pool);
        store.store_request_token("k1", "rt-stored").await.unwrap();

        let session = ScriptedSession::new(ProbeOutcome::Expired, vec![Some("at-1")]);
        let login = CountingLogin::new(false);
        let manager = manager(store, config(true, account(None)), session.clone(), login.clone());

        assert_eq!(token(&manager, "k1").await.unwrap(), "at-1");
        assert_eq!(login.calls(), 0);
        assert_eq!(session.exchanged(), vec!["rt-stored"]);
    }

    #[tokio::test]
    async fn manual_token_is_used_once() {
        let (_dir, pool) = test_pool().await;
        let store = CredentialStore::new(pool);

        let session = ScriptedSession::new(ProbeOutcome::Expired, vec![Some("at-1")]);
        let login = CountingLogin::new(false);
        let manager = manager(
            store.clone(),
            config(false, account(Some("manual-1"))),
            session.clone(),
            login.clone(),
        );

        assert_eq!(token(&manager, "k1").await.unwrap(), "at-1");
        assert_eq!(login.calls(), 0);
        assert_eq!(session.exchanged(), vec!["manual-1"]);

        // the access token dies; the same pasted token must not be replayed
        store.clear("k1").await.unwrap();
        store.consume_request_token("k1", "manual-1").await.unwrap();
        let err = token(&manager, "k1").await.unwrap_err();
        match err {
            Error::ManualLoginRequired { api_key, login_url } => {
                assert_eq!(api_key, "k1");
                assert_eq!(login_url, "http://web/connect/login?api_key=k1&v=3");
            }
            other => panic!("expected ManualLoginRequired, got {other:?}"),
        }
        assert_eq!(session.exchanged(), vec!["manual-1"]);
    }

    #[tokio::test]
    async fn failed_emulation_without_manual_token_asks_for_login() {
        let (_dir, pool) = test_pool().await;
        let store = CredentialStore::new(pool);

        let session = ScriptedSession::new(ProbeOutcome::Expired, vec![]);
        let login = CountingLogin::new(true);
        let manager = manager(store, config(true, account(None)), session.clone(), login.clone());

        let err = token(&manager, "k1").await.unwrap_err();
        assert!(matches!(err, Error::ManualLoginRequired { .. }), "{err:?}");
        assert_eq!(login.calls(), 1);
        assert!(session.exchanged().is_empty());
    }

    #[tokio::test]
    async fn missing_secrets_fail_before_any_call() {
        let (_dir, pool) = test_pool().await;
        let store = CredentialStore::new(pool);

        let session = ScriptedSession::new(ProbeOutcome::Valid, vec![]);
        let login = CountingLogin::new(false);
        let incomplete = AccountConfig {
            totp_token: String::new(),
            ..account(None)
        };
        let manager = manager(store, config(true, incomplete), session.clone(), login.clone());

        let err = token(&manager, "k1").await.unwrap_err();
        assert!(matches!(err, Error::Configuration(_)), "{err:?}");
        assert!(err.to_string().contains("totp_token"));
        assert_eq!(login.calls(), 0);

        let err = token(&manager, "unknown").await.unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[tokio::test]
    async fn rejected_exchange_then_failed_login_asks_for_manual_login() {
        let (_dir, pool) = test_pool().await;
        let store = CredentialStore::new(pool);
        store.store_request_token("k1", "rt-stale").await.unwrap();

        let session = ScriptedSession::new(ProbeOutcome::Expired, vec![None]);
        let login = CountingLogin::new(true);
        let manager = manager(
            store.clone(),
            config(true, account(None)),
            session.clone(),
            login.clone(),
        );

        let err = token(&manager, "k1").await.unwrap_err();
        assert!(matches!(err, Error::ManualLoginRequired { .. }), "{err:?}");
        assert_eq!(session.exchanged(), vec!["rt-stale"]);
        assert_eq!(login.calls(), 1);

        let row = store.get("k1").await.unwrap().unwrap();
        assert_eq!(row.request_token, None);
        assert_eq!(row.consumed_request_token.as_deref(), Some("rt-stale"));
    }

    #[tokio::test]
    async fn overlapping_callers_share_one_exchange() {
        let (_dir, pool) = test_pool().await;
        let store = CredentialStore::new(pool);
        store.store_request_token("k1", "rt-stored").await.unwrap();

        let session = ScriptedSession::slow(
            ProbeOutcome::Valid,
            vec![Some("at-1")],
            Duration::from_millis(100),
        );
        let login = CountingLogin::new(false);
        let manager = manager(store, config(true, account(None)), session.clone(), login.clone());

        let (first, second) = tokio::join!(token(&manager, "k1"), token(&manager, "k1"));
        assert_eq!(first.unwrap(), "at-1");
        assert_eq!(second.unwrap(), "at-1");
        assert_eq!(session.exchanged(), vec!["rt-stored"]);
        assert_eq!(login.calls(), 0);
    }

    #[tokio::test]
    async fn cancellation_interrupts_a_hanging_login() {
        let (_dir, pool) = test_pool().await;
        let store = CredentialStore::new(pool);

        let session = ScriptedSession::new(ProbeOutcome::Expired, vec![]);
        let login = CountingLogin::hanging();
        let manager = manager(store, config(true, account(None)), session.clone(), login.clone());

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            manager.get_valid_access_token("k1", &cancel),
        )
        .await
        .expect("token acquisition ignored cancellation");

        let err = result.unwrap_err();
        assert!(matches!(&err, Error::Task(msg) if msg.contains("cancelled")), "{err:?}");
        assert_eq!(login.calls(), 1);
        assert!(session.exchanged().is_empty());
    }

    #[tokio::test]
    async fn reload_swaps_the_account_roster() {
        let (_dir, pool) = test_pool().await;
        let store = CredentialStore::new(pool);
        store.store_access_token("k1", "at-cached").await.unwrap();

        let session = ScriptedSession::new(ProbeOutcome::Valid, vec![]);
        let login = CountingLogin::new(false);
        let manager = manager(store, BrokerConfig::default(), session, login);

        assert!(matches!(token(&manager, "k1").await, Err(Error::Configuration(_))));

        manager.reload(Arc::new(config(true, account(None))));
        assert_eq!(manager.config().accounts.len(), 1);
        assert_eq!(token(&manager, "k1").await.unwrap(), "at-cached");
    }
}
