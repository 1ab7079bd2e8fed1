use anyhow::{anyhow, Result};

type Build<T> = Box<dyn Fn() -> Result<T> + Send + Sync>;

/// A named way of constructing a model (e.g. accelerated vs. plain CPU).
pub struct Provider<T> {
    name: String,
    build: Build<T>,
}

/// Ordered list of providers tried at initialization.
///
/// The first provider that builds successfully wins; every failure is logged
/// and suppressed. The chain is reusable, so pools can resolve one model
/// instance per worker.
pub struct ProviderChain<T> {
    providers: Vec<Provider<T>>,
}

impl<T> ProviderChain<T> {
    pub fn new() -> Self {
        Self {
            providers: Vec::new(),
        }
    }

    /// Chain with a single provider.
    pub fn single<F>(name: &str, build: F) -> Self
    where
        F: Fn() -> Result<T> + Send + Sync + 'static,
    {
        Self::new().with(name, build)
    }

    /// Append a provider. Earlier providers take precedence.
    pub fn with<F>(mut self, name: &str, build: F) -> Self
    where
        F: Fn() -> Result<T> + Send + Sync + 'static,
    {
        self.providers.push(Provider {
            name: name.to_string(),
            build: Box::new(build),
        });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// Provider names in precedence order.
    pub fn names(&self) -> Vec<&str> {
        self.providers.iter().map(|p| p.name.as_str()).collect()
    }

    /// Build from the first provider that succeeds.
    pub fn resolve(&self) -> Result<(String, T)> {
        let mut failures = Vec::new();
        for provider in &self.providers {
            match (provider.build)() {
                Ok(model) => {
                    log::info!("provider '{}' initialized", provider.name);
                    return Ok((provider.name.clone(), model));
                }
                Err(err) => {
                    log::warn!("provider '{}' unavailable: {:#}", provider.name, err);
                    failures.push(format!("{}: {}", provider.name, err));
                }
            }
        }
        if failures.is_empty() {
            return Err(anyhow!("no providers registered"));
        }
        Err(anyhow!("all providers failed ({})", failures.join("; ")))
    }
}

impl<T> Default for ProviderChain<T> {
    fn default() -> Self {
        Self::new()
    }
}
