use async_trait::async_trait;

/// Which upstream a token is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    Airtable,
    GoogleSheets,
}

/// An OAuth access token. Debug output never shows the secret.
#[derive(Clone)]
pub struct AccessToken {
    secret: String,
}

impl AccessToken {
    pub fn new(secret: impl Into<String>) -> Self {
        Self { secret: secret.into() }
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }
}

impl std::fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AccessToken(***)")
    }
}

/// Supplies per-user tokens. Obtained fresh on every run; the engine never
/// caches tokens. Refreshing expired tokens is the implementation's business.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn for_user(&self, user_id: &str, provider: Provider) -> anyhow::Result<AccessToken>;
}

/// Token provider backed by environment variables, for single-tenant
/// deployments and local runs.
pub struct EnvTokenProvider;

#[async_trait]
impl TokenProvider for EnvTokenProvider {
    async fn for_user(&self, _user_id: &str, provider: Provider) -> anyhow::Result<AccessToken> {
        let var = match provider {
            Provider::Airtable => "BASESYNC_AIRTABLE_TOKEN",
            Provider::GoogleSheets => "BASESYNC_GOOGLE_TOKEN",
        };
        let secret = std::env::var(var)
            .map_err(|_| anyhow::anyhow!("{var} is not set"))?;
        Ok(AccessToken::new(secret))
    }
}
