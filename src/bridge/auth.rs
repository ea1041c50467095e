//! SSH authentication strategies.
//!
//! A small strategy chain: password, private key file, SSH agent.
//! Strategies run in the order they were added; the first success
//! wins. When the caller supplies no credentials the chain falls back
//! to the agent.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use russh::{client, keys};
use tracing::debug;

use super::session::ShellClientHandler;

#[async_trait]
pub trait AuthStrategy: Send + Sync {
    /// Try to authenticate; `Ok(false)` means the credentials were
    /// rejected, `Err` means the attempt itself failed.
    async fn authenticate(
        &self,
        handle: &mut client::Handle<ShellClientHandler>,
        username: &str,
    ) -> Result<bool, String>;

    fn name(&self) -> &'static str;
}

pub struct PasswordAuth {
    password: String,
}

#[async_trait]
impl AuthStrategy for PasswordAuth {
    async fn authenticate(
        &self,
        handle: &mut client::Handle<ShellClientHandler>,
        username: &str,
    ) -> Result<bool, String> {
        let result = handle
            .authenticate_password(username, &self.password)
            .await
            .map_err(|e| format!("Password authentication failed: {}", e))?;
        Ok(result.success())
    }

    fn name(&self) -> &'static str {
        "password"
    }
}

pub struct KeyAuth {
    key_path: PathBuf,
}

#[async_trait]
impl AuthStrategy for KeyAuth {
    async fn authenticate(
        &self,
        handle: &mut client::Handle<ShellClientHandler>,
        username: &str,
    ) -> Result<bool, String> {
        let key_pair = keys::load_secret_key(&self.key_path, None)
            .map_err(|e| format!("Failed to load private key {:?}: {}", self.key_path, e))?;

        // RSA keys negotiate the strongest hash the server supports.
        let hash_alg = handle
            .best_supported_rsa_hash()
            .await
            .ok()
            .flatten()
            .flatten();

        let key = keys::PrivateKeyWithHashAlg::new(Arc::new(key_pair), hash_alg);
        let result = handle
            .authenticate_publickey(username, key)
            .await
            .map_err(|e| format!("Key authentication failed: {}", e))?;
        Ok(result.success())
    }

    fn name(&self) -> &'static str {
        "key"
    }
}

pub struct AgentAuth;

#[async_trait]
impl AuthStrategy for AgentAuth {
    async fn authenticate(
        &self,
        handle: &mut client::Handle<ShellClientHandler>,
        username: &str,
    ) -> Result<bool, String> {
        let mut agent = keys::agent::client::AgentClient::connect_env()
            .await
            .map_err(|e| format!("Failed to connect to SSH agent: {}", e))?;

        let identities = agent
            .request_identities()
            .await
            .map_err(|e| format!("Failed to list SSH agent identities: {}", e))?;

        if identities.is_empty() {
            return Err("No identities found in SSH agent".to_string());
        }

        for identity in identities {
            debug!("trying agent identity {:?}", identity.comment());
            let hash_alg = handle
                .best_supported_rsa_hash()
                .await
                .ok()
                .flatten()
                .flatten();

            match handle
                .authenticate_publickey_with(username, identity.clone(), hash_alg, &mut agent)
                .await
            {
                Ok(result) if result.success() => return Ok(true),
                Ok(_) => continue,
                Err(e) => {
                    debug!("agent identity error: {}, trying next", e);
                    continue;
                }
            }
        }

        Err("Agent authentication failed: no identities accepted".to_string())
    }

    fn name(&self) -> &'static str {
        "agent"
    }
}

/// Ordered set of strategies, first success wins.
pub struct AuthChain {
    strategies: Vec<Box<dyn AuthStrategy>>,
}

impl AuthChain {
    pub fn new() -> Self {
        Self {
            strategies: Vec::new(),
        }
    }

    /// Build the chain for the given credentials, falling back to the
    /// SSH agent when nothing explicit was supplied.
    pub fn for_credentials(password: Option<&str>, key_path: Option<&str>) -> Self {
        let mut chain = Self::new();
        if let Some(password) = password {
            chain.strategies.push(Box::new(PasswordAuth {
                password: password.to_string(),
            }));
        }
        if let Some(key_path) = key_path {
            chain.strategies.push(Box::new(KeyAuth {
                key_path: PathBuf::from(key_path),
            }));
        }
        if chain.strategies.is_empty() {
            chain.strategies.push(Box::new(AgentAuth));
        }
        chain
    }

    pub async fn authenticate(
        &self,
        handle: &mut client::Handle<ShellClientHandler>,
        username: &str,
    ) -> Result<bool, String> {
        let mut last_error = None;

        for strategy in &self.strategies {
            debug!("trying authentication strategy: {}", strategy.name());
            match strategy.authenticate(handle, username).await {
                Ok(true) => return Ok(true),
                Ok(false) => {
                    last_error = Some(format!("{} authentication rejected", strategy.name()));
                }
                Err(e) => last_error = Some(e),
            }
        }

        Err(last_error.unwrap_or_else(|| "All authentication methods failed".to_string()))
    }

    #[cfg(test)]
    fn names(&self) -> Vec<&'static str> {
        self.strategies.iter().map(|s| s.name()).collect()
    }
}

impl Default for AuthChain {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_password_only() {
        let chain = AuthChain::for_credentials(Some("secret"), None);
        assert_eq!(chain.names(), vec!["password"]);
    }

    #[test]
    fn test_key_only() {
        let chain = AuthChain::for_credentials(None, Some("/home/op/.ssh/id_ed25519"));
        assert_eq!(chain.names(), vec!["key"]);
    }

    #[test]
    fn test_password_tried_before_key() {
        let chain = AuthChain::for_credentials(Some("secret"), Some("/id_rsa"));
        assert_eq!(chain.names(), vec!["password", "key"]);
    }

    #[test]
    fn test_agent_fallback_when_no_credentials() {
        let chain = AuthChain::for_credentials(None, None);
        assert_eq!(chain.names(), vec!["agent"]);
    }

    #[test]
    fn test_chain_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<AuthChain>();
    }
}
