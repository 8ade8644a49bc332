/// Brokerage provider integration
///
/// Everything that talks to the provider: the login emulator that mints
/// request tokens, the session API that exchanges and probes tokens, the
/// credential manager that ties both to the credential store, and the trade
/// fetch used by the daily task.

pub mod credentials;
pub mod endpoints;
pub mod login;
pub mod refresh;
pub mod session;
pub mod totp;
pub mod trades;

pub use credentials::CredentialManager;
pub use endpoints::ProviderEndpoints;
pub use login::{LoginFlowEmulator, RequestTokenSource};
pub use refresh::{RefreshEvent, RefreshMachine, RefreshState};
pub use session::{BrokerSession, ProbeOutcome, SessionApi};
pub use trades::Trade;
