use std::path::{Component, PathBuf};

use cellar_fs::RewriteRule;

use crate::config::CellarConfig;

/// The machine-specific values that get swapped for placeholders.
///
/// Always passed explicitly; nothing below this type reads the process
/// environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewriteContext {
    pub home:       PathBuf,
    pub username:   String,
    pub home_token: String,
    pub user_token: String,
}

impl RewriteContext {
    /// Context with the default placeholder tokens. The orchestrators swap
    /// them for their configured tokens before running.
    pub fn new(home: impl Into<PathBuf>, username: impl Into<String>) -> Self {
        let defaults = CellarConfig::default();
        Self {
            home:       home.into(),
            username:   username.into(),
            home_token: defaults.home_token,
            user_token: defaults.user_token,
        }
    }

    pub fn with_tokens(mut self, home_token: impl Into<String>, user_token: impl Into<String>) -> Self {
        self.home_token = home_token.into();
        self.user_token = user_token.into();
        self
    }

    /// Tokens from `config`, keeping home and login name.
    pub fn with_config_tokens(self, config: &CellarConfig) -> Self {
        self.with_tokens(config.home_token.clone(), config.user_token.clone())
    }

    /// Current user's home and login name, with tokens from `config`.
    pub fn detect(config: &CellarConfig) -> crate::Result<Self> {
        let home = cellar_platform::user::home()?;
        let username = cellar_platform::user::username()?;
        Ok(Self::new(home, username).with_config_tokens(config))
    }

    /// Real values to placeholders: home first, then the login name.
    pub fn externalize_rules(&self) -> Vec<RewriteRule> {
        let mut rules = Vec::with_capacity(2);
        if let Some(home) = self.home_fragment() {
            rules.push(RewriteRule::new(home, self.home_token.clone()));
        }
        if !self.username.is_empty() {
            rules.push(RewriteRule::new(self.username.clone(), self.user_token.clone()));
        }
        rules
    }

    /// Placeholders back to real values, in the same order.
    pub fn internalize_rules(&self) -> Vec<RewriteRule> {
        let mut rules = Vec::with_capacity(2);
        if let Some(home) = self.home_fragment() {
            rules.push(RewriteRule::new(self.home_token.clone(), home));
        }
        if !self.username.is_empty() {
            rules.push(RewriteRule::new(self.user_token.clone(), self.username.clone()));
        }
        rules
    }

    /// The home path as text, or `None` for a path too short to rewrite
    /// safely (empty or `/`).
    fn home_fragment(&self) -> Option<String> {
        let has_name = self.home.components().any(|c| matches!(c, Component::Normal(_)));
        if !has_name {
            return None;
        }
        let text = self.home.to_string_lossy();
        Some(text.trim_end_matches('/').to_string())
    }
}
