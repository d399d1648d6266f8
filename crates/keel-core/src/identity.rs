//! Browser identities for outbound page fetches.

use rand::Rng;
use rand::seq::IndexedRandom;
use serde::Serialize;
use url::Url;

/// The client fingerprint presented on one fetch attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClientIdentity {
    pub user_agent: String,
    pub accept_language: String,
}

impl ClientIdentity {
    pub fn new(user_agent: impl Into<String>, accept_language: impl Into<String>) -> Self {
        Self {
            user_agent: user_agent.into(),
            accept_language: accept_language.into(),
        }
    }
}

const BROWSERS: &[(&str, &str)] = &[
    (
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/129.0.0.0 Safari/537.36",
        "en-US,en;q=0.9",
    ),
    (
        "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.6 Safari/605.1.15",
        "en-US,en;q=0.9",
    ),
    (
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:131.0) Gecko/20100101 Firefox/131.0",
        "en-US,en;q=0.5",
    ),
    (
        "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/128.0.0.0 Safari/537.36",
        "en-GB,en;q=0.9",
    ),
    (
        "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/129.0.0.0 Safari/537.36",
        "en-US,en;q=0.8",
    ),
    (
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/129.0.0.0 Safari/537.36 Edg/129.0.0.0",
        "en-US,en;q=0.9,de;q=0.6",
    ),
];

/// A pool of realistic browser identities to rotate through.
#[derive(Debug, Clone)]
pub struct IdentityPool {
    identities: Vec<ClientIdentity>,
}

impl IdentityPool {
    /// Returns `None` for an empty list.
    pub fn new(identities: Vec<ClientIdentity>) -> Option<Self> {
        if identities.is_empty() {
            None
        } else {
            Some(Self { identities })
        }
    }

    /// Current desktop browsers.
    pub fn browsers() -> Self {
        Self {
            identities: BROWSERS
                .iter()
                .map(|(ua, lang)| ClientIdentity::new(*ua, *lang))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }

    /// A random identity whose user agent differs from `previous`.
    ///
    /// A single-entry pool has nothing to rotate to and returns its only
    /// identity.
    pub fn next_different(&self, previous: Option<&ClientIdentity>) -> &ClientIdentity {
        let mut rng = rand::rng();
        let candidates: Vec<&ClientIdentity> = self
            .identities
            .iter()
            .filter(|id| previous.is_none_or(|prev| prev.user_agent != id.user_agent))
            .collect();

        match candidates.choose(&mut rng) {
            Some(identity) => *identity,
            None => &self.identities[rng.random_range(0..self.identities.len())],
        }
    }
}

impl Default for IdentityPool {
    fn default() -> Self {
        Self::browsers()
    }
}

/// A plausible referer for a request to `url`: the site's own front page
/// or a search engine.
pub fn referer_for(url: &Url) -> Option<String> {
    let host = url.host_str()?;
    let options = [
        format!("{}://{}/", url.scheme(), host),
        "https://www.google.com/".to_string(),
        "https://www.bing.com/".to_string(),
        "https://duckduckgo.com/".to_string(),
    ];
    options.choose(&mut rand::rng()).cloned()
}
