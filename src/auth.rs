use log::debug;

use crate::config::Config;
use crate::error::{CIFetchError, Result};
use crate::models::CiKind;

#[derive(Clone)]
pub struct Token(String);

impl From<&str> for Token {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl Token {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<redacted>")
    }
}

const GITHUB_TOKEN_VARS: [&str; 2] = ["GH_TOKEN", "GITHUB_TOKEN"];
const TRAVIS_TOKEN_VAR: &str = "TRAVIS_TOKEN";
const APPVEYOR_TOKEN_VAR: &str = "APPVEYOR_TOKEN";

/// Credentials for every provider enabled in the configuration
#[derive(Debug, Default, Clone)]
pub struct Tokens {
    pub github: Option<Token>,
    pub travis: Option<Token>,
    pub appveyor: Option<Token>,
}

impl Tokens {
    /// Collect tokens from the environment, failing on the first enabled
    /// provider whose credential is missing.
    pub fn from_env(config: &Config) -> Result<Self> {
        Self::collect(config, |name| std::env::var(name).ok())
    }

    fn collect(config: &Config, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let find = |names: &[&str]| {
            names
                .iter()
                .filter_map(|name| lookup(*name))
                .map(|value| value.trim().to_string())
                .find(|value| !value.is_empty())
                .map(|value| Token::from(value.as_str()))
        };

        let mut tokens = Self::default();
        let ci = &config.ci;

        // Travis needs GitHub to resolve pull-request head commits
        if ci.github.is_some() || ci.travis.is_some() {
            tokens.github = Some(find(&GITHUB_TOKEN_VARS).ok_or_else(|| {
                CIFetchError::MissingCredential(
                    "GitHub token not found; set GH_TOKEN or GITHUB_TOKEN".to_string(),
                )
            })?);
        }
        if ci.travis.is_some() {
            tokens.travis = Some(find(&[TRAVIS_TOKEN_VAR]).ok_or_else(|| {
                CIFetchError::MissingCredential(
                    "Travis token not set; set TRAVIS_TOKEN".to_string(),
                )
            })?);
        }
        if ci.appveyor.is_some() {
            tokens.appveyor = Some(find(&[APPVEYOR_TOKEN_VAR]).ok_or_else(|| {
                CIFetchError::MissingCredential(
                    "Appveyor API key not set; set APPVEYOR_TOKEN".to_string(),
                )
            })?);
        }

        debug!("Collected credentials: {tokens:?}");
        Ok(tokens)
    }

    pub fn require(&self, ci: CiKind) -> Result<&Token> {
        let token = match ci {
            CiKind::GitHub => self.github.as_ref(),
            CiKind::Travis => self.travis.as_ref(),
            CiKind::Appveyor => self.appveyor.as_ref(),
        };
        token.ok_or_else(|| CIFetchError::MissingCredential(format!("no token for {ci}")))
    }
}
