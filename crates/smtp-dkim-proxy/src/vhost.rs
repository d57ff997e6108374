use crate::config::{ProxyConfig, VirtualHostConfig};
use crate::dkim::SigningConfig;
use crate::pipeline::SigningPipeline;
use crate::upstream::{UpstreamConfig, UpstreamSession};
use anyhow::Context;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// Deliberately vague so that a client cannot tell an unknown
/// domain apart from a bad password
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthError {
    #[error("authentication failed")]
    Failed,
    #[error("authentication required")]
    Required,
}

/// One served domain: where its mail goes and how it is signed
#[derive(Debug)]
pub struct VirtualHost {
    pub domain: String,
    pub description: String,
    pub upstream: UpstreamConfig,
    pub signing: SigningConfig,
    pub pipeline: SigningPipeline,
}

impl VirtualHost {
    pub async fn from_config(
        config: &ProxyConfig,
        vhost: &VirtualHostConfig,
    ) -> anyhow::Result<Self> {
        let signing = SigningConfig::from_virtual_host(vhost, &config.header_keys)?;
        let upstream =
            UpstreamConfig::from_virtual_host(vhost, &config.domain, config.upstream_timeouts)?;
        let signer = signing.build_signer().await?;
        let pipeline = SigningPipeline::new(
            vhost
                .received_by
                .clone()
                .unwrap_or_else(|| config.domain.clone()),
            signer,
            config.signing_failure,
            config.spool_limit(),
        );

        let description = if vhost.description.is_empty() {
            format!("{} via {}", signing.domain, upstream.address)
        } else {
            vhost.description.clone()
        };

        Ok(Self {
            domain: signing.domain.clone(),
            description,
            upstream,
            signing,
            pipeline,
        })
    }
}

/// Maps served domains to their virtual hosts.
/// Built once at startup and only read afterwards.
#[derive(Debug, Default)]
pub struct Registry {
    hosts: HashMap<String, Arc<VirtualHost>>,
}

impl Registry {
    pub async fn from_config(config: &ProxyConfig) -> anyhow::Result<Self> {
        let mut registry = Self::default();
        for (idx, vhost) in config.virtual_hosts.iter().enumerate() {
            let host = VirtualHost::from_config(config, vhost)
                .await
                .with_context(|| {
                    format!("unable to setup virtual host #{idx} ({})", vhost.domain)
                })?;
            registry
                .insert(host)
                .with_context(|| format!("unable to setup virtual host #{idx}"))?;
        }
        Ok(registry)
    }

    pub fn insert(&mut self, host: VirtualHost) -> anyhow::Result<()> {
        if self.hosts.contains_key(&host.domain) {
            anyhow::bail!("duplicate virtual host domain {}", host.domain);
        }
        tracing::info!("virtual host {}: {}", host.domain, host.description);
        self.hosts.insert(host.domain.clone(), Arc::new(host));
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    pub fn get(&self, domain: &str) -> Option<&Arc<VirtualHost>> {
        self.hosts.get(&domain.to_ascii_lowercase())
    }

    /// Map a `local-part@domain` identity to the virtual host that
    /// serves its domain
    pub fn resolve(&self, identity: &str) -> Result<Arc<VirtualHost>, AuthError> {
        let (_local, domain) = identity.rsplit_once('@').ok_or(AuthError::Failed)?;
        if domain.is_empty() {
            return Err(AuthError::Failed);
        }
        self.get(domain).cloned().ok_or(AuthError::Failed)
    }

    /// Resolve the identity and have its upstream verify the
    /// credentials. The reason for a failure is logged, but the
    /// caller only ever learns that authentication failed.
    pub async fn login(
        &self,
        identity: &str,
        password: &str,
    ) -> Result<(Arc<VirtualHost>, UpstreamSession), AuthError> {
        let host = self.resolve(identity).inspect_err(|_| {
            tracing::info!("authentication for {identity:?} failed: no such virtual host");
        })?;

        match host.upstream.login(identity, password).await {
            Ok(upstream) => {
                tracing::info!("{identity} authenticated via {}", host.upstream.address);
                Ok((host, upstream))
            }
            Err(err) => {
                tracing::info!("authentication for {identity:?} failed: {err:#}");
                Err(AuthError::Failed)
            }
        }
    }
}
