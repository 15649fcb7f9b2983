//! Integration with the GitHub App: installation lifecycle, installation
//! tokens and inbound webhooks.

pub mod gateway;
pub mod install_state;
pub mod provider;
pub mod token_cache;
pub mod webhook;

pub use gateway::{GatewayError, VcsGateway, WebhookEnvelope, WebhookOutcome};
pub use install_state::InstallStateStore;
pub use provider::{
    Branch, GithubClient, InstallationAccount, InstallationToken, ProviderError, VcsProvider,
};
pub use token_cache::InstallationTokenCache;
