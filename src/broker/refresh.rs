/// Token refresh state machine
///
/// Pure bookkeeping for one `get_valid_access_token` call. The credential
/// manager performs the I/O each state asks for and feeds the outcome back
/// as an event; the machine owns the exchange-attempt bound.

/// First exchange plus two re-login cycles
pub const MAX_EXCHANGE_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshState {
    /// Check a cached access token against the provider
    Probing { access_token: String },
    /// Run the login flow for a fresh request token
    NeedsRequestToken,
    /// Trade a request token for an access token
    Exchanging { request_token: String },
    Valid { access_token: String },
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshEvent {
    ProbeSucceeded,
    ProbeFailed,
    RequestTokenMinted(String),
    LoginFailed(String),
    ExchangeSucceeded(String),
    ExchangeFailed(String),
}

#[derive(Debug)]
pub struct RefreshMachine {
    state: RefreshState,
    cached_request_token: Option<String>,
    exchange_attempts: u32,
    max_exchange_attempts: u32,
}

impl RefreshMachine {
    /// Start from whatever the credential row holds.
    pub fn new(access_token: Option<String>, request_token: Option<String>) -> Self {
        let (state, cached_request_token) = match (access_token, request_token) {
            (Some(access_token), request_token) => {
                (RefreshState::Probing { access_token }, request_token)
            }
            (None, Some(request_token)) => (RefreshState::Exchanging { request_token }, None),
            (None, None) => (RefreshState::NeedsRequestToken, None),
        };
        Self {
            state,
            cached_request_token,
            exchange_attempts: 0,
            max_exchange_attempts: MAX_EXCHANGE_ATTEMPTS,
        }
    }

    pub fn state(&self) -> &RefreshState {
        &self.state
    }

    pub fn exchange_attempts(&self) -> u32 {
        self.exchange_attempts
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.state,
            RefreshState::Valid { .. } | RefreshState::Failed { .. }
        )
    }

    pub fn apply(&mut self, event: RefreshEvent) -> &RefreshState {
        let current = std::mem::replace(&mut self.state, RefreshState::NeedsRequestToken);
        self.state = match (current, event) {
            (RefreshState::Probing { access_token }, RefreshEvent::ProbeSucceeded) => {
                RefreshState::Valid { access_token }
            }
            (RefreshState::Probing { .. }, RefreshEvent::ProbeFailed) => {
                match self.cached_request_token.take() {
                    Some(request_token) => RefreshState::Exchanging { request_token },
                    None => RefreshState::NeedsRequestToken,
                }
            }
            (RefreshState::NeedsRequestToken, RefreshEvent::RequestTokenMinted(request_token)) => {
                RefreshState::Exchanging { request_token }
            }
            (RefreshState::NeedsRequestToken, RefreshEvent::LoginFailed(reason)) => {
                RefreshState::Failed { reason }
            }
            (RefreshState::Exchanging { .. }, RefreshEvent::ExchangeSucceeded(access_token)) => {
                self.exchange_attempts += 1;
                RefreshState::Valid { access_token }
            }
            (RefreshState::Exchanging { .. }, RefreshEvent::ExchangeFailed(reason)) => {
                self.exchange_attempts += 1;
                if self.exchange_attempts >= self.max_exchange_attempts {
                    RefreshState::Failed { reason }
                } else {
                    RefreshState::NeedsRequestToken
                }
            }
            (state @ (RefreshState::Valid { .. } | RefreshState::Failed { .. }), _) => state,
            (state, event) => RefreshState::Failed {
                reason: format!("unexpected {:?} while {:?}", event, state),
            },
        };
        &self.state
    }
}
