use crate::config::VirtualHostConfig;
use rfc5321::{
    ClientError, EsmtpParameter, ForwardPath, Response, ReversePath, SmtpClient,
    SmtpClientTimeouts, TlsOptions,
};
use serde::Deserialize;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};

#[derive(Deserialize, Debug, Default, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum UpstreamSecurity {
    /// TLS from the first byte
    #[default]
    Tls,
    /// Plain text, upgraded via STARTTLS when the upstream offers it
    StartTls,
    /// Plain text only
    None,
}

#[derive(Error, Debug)]
pub enum UpstreamError {
    #[error("upstream {address}: {source}")]
    Client {
        address: String,
        #[source]
        source: ClientError,
    },
    #[error("upstream {address} does not support authentication")]
    AuthUnsupported { address: String },
}

impl UpstreamError {
    /// The upstream's own response, when the failure was the
    /// upstream turning down a command
    pub fn rejection(&self) -> Option<&Response> {
        match self {
            Self::Client { source, .. } => source.rejection(),
            Self::AuthUnsupported { .. } => None,
        }
    }
}

/// How to reach the upstream server of a virtual host.
/// Acts as the factory for upstream sessions.
#[derive(Debug, Clone, PartialEq)]
pub struct UpstreamConfig {
    pub address: String,
    pub security: UpstreamSecurity,
    pub lmtp: bool,
    /// Name used to validate the upstream certificate and for LHLO
    pub host: String,
    /// Name we announce in EHLO
    pub local_name: String,
    pub tls: TlsOptions,
    pub timeouts: SmtpClientTimeouts,
}

fn host_part(address: &str) -> &str {
    match address.rsplit_once(':') {
        Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => {
            host.trim_start_matches('[').trim_end_matches(']')
        }
        _ => address,
    }
}

impl UpstreamConfig {
    pub fn from_virtual_host(
        vhost: &VirtualHostConfig,
        serving_domain: &str,
        timeouts: SmtpClientTimeouts,
    ) -> anyhow::Result<Self> {
        let address = vhost.upstream.trim().to_string();
        if address.is_empty() {
            anyhow::bail!("no upstream address specified");
        }
        if vhost.lmtp && vhost.upstream_security != UpstreamSecurity::None {
            anyhow::bail!("LMTP upstreams require upstream_security = \"none\"");
        }

        let host = match &vhost.upstream_host {
            Some(host) => host.clone(),
            None if vhost.lmtp => "localhost".to_string(),
            None => host_part(&address).to_string(),
        };

        Ok(Self {
            address,
            security: vhost.upstream_security,
            lmtp: vhost.lmtp,
            host,
            local_name: vhost
                .local_name
                .clone()
                .unwrap_or_else(|| serving_domain.to_string()),
            tls: TlsOptions {
                insecure: vhost.upstream_insecure_tls,
            },
            timeouts,
        })
    }

    fn client_error(&self, source: ClientError) -> UpstreamError {
        UpstreamError::Client {
            address: self.address.clone(),
            source,
        }
    }

    async fn open_client(&self) -> Result<SmtpClient, ClientError> {
        if self.lmtp {
            #[cfg(unix)]
            return SmtpClient::new_unix(&self.address, &self.host, self.timeouts).await;
            #[cfg(not(unix))]
            return Err(ClientError::Io(std::io::Error::other(
                "LMTP requires unix domain sockets",
            )));
        }

        match self.security {
            UpstreamSecurity::Tls => {
                SmtpClient::new_tls(self.address.as_str(), &self.host, &self.tls, self.timeouts)
                    .await
            }
            UpstreamSecurity::StartTls | UpstreamSecurity::None => {
                let mut client = SmtpClient::new(self.address.as_str(), self.timeouts).await?;
                client.set_hostname(&self.host);
                Ok(client)
            }
        }
    }

    async fn establish(&self) -> Result<SmtpClient, ClientError> {
        let mut client = self.open_client().await?;
        client.read_greeting().await?;

        if self.lmtp {
            client.lhlo(&self.local_name).await?;
            return Ok(client);
        }

        let caps = client.ehlo(&self.local_name).await?;
        if self.security == UpstreamSecurity::StartTls {
            if caps.contains_key("STARTTLS") {
                client.starttls(&self.tls).await?;
                client.ehlo(&self.local_name).await?;
            } else {
                tracing::warn!(
                    "upstream {} does not offer STARTTLS, continuing without TLS",
                    self.address
                );
            }
        }

        Ok(client)
    }

    /// Open a new session to the upstream
    pub async fn connect(&self) -> Result<UpstreamSession, UpstreamError> {
        let client = self
            .establish()
            .await
            .map_err(|err| self.client_error(err))?;
        tracing::debug!("connected to upstream {}", self.address);
        Ok(UpstreamSession {
            client,
            address: self.address.clone(),
            lmtp: self.lmtp,
            accepted_recipients: 0,
        })
    }

    /// Open a new session and authenticate it with the client's
    /// credentials. Nothing is retained if any step fails.
    pub async fn login(&self, username: &str, password: &str) -> Result<UpstreamSession, UpstreamError> {
        if self.lmtp {
            return Err(UpstreamError::AuthUnsupported {
                address: self.address.clone(),
            });
        }
        let mut session = self.connect().await?;
        session.auth_plain(username, password).await?;
        Ok(session)
    }
}

/// A single live connection to an upstream server
#[derive(Debug)]
pub struct UpstreamSession {
    client: SmtpClient,
    address: String,
    lmtp: bool,
    accepted_recipients: usize,
}

impl UpstreamSession {
    fn wrap<T>(&self, result: Result<T, ClientError>) -> Result<T, UpstreamError> {
        result.map_err(|source| UpstreamError::Client {
            address: self.address.clone(),
            source,
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn is_lmtp(&self) -> bool {
        self.lmtp
    }

    pub fn is_connected(&self) -> bool {
        self.client.is_connected()
    }

    pub async fn auth_plain(&mut self, username: &str, password: &str) -> Result<(), UpstreamError> {
        if self.lmtp {
            return Err(UpstreamError::AuthUnsupported {
                address: self.address.clone(),
            });
        }
        let result = self.client.auth_plain(username, Some(password)).await;
        self.wrap(result)
    }

    pub async fn reset(&mut self) -> Result<Response, UpstreamError> {
        self.accepted_recipients = 0;
        let result = self.client.rset().await;
        self.wrap(result)
    }

    pub async fn mail(
        &mut self,
        from: &ReversePath,
        parameters: &[EsmtpParameter],
    ) -> Result<Response, UpstreamError> {
        self.accepted_recipients = 0;
        let result = self.client.mail_from(from, parameters).await;
        self.wrap(result)
    }

    pub async fn rcpt(
        &mut self,
        to: &ForwardPath,
        parameters: &[EsmtpParameter],
    ) -> Result<Response, UpstreamError> {
        let result = self.client.rcpt_to(to, parameters).await;
        if result.is_ok() {
            self.accepted_recipients += 1;
        }
        self.wrap(result)
    }

    /// Transfer the message. For LMTP, every accepted recipient gets
    /// its own response; the first failure among them is reported,
    /// otherwise the final success.
    ///
    /// DATA is only issued once the first bytes of `body` are
    /// available; if `body` fails before that point the upstream
    /// session remains usable.
    pub async fn data<R: AsyncRead + Unpin>(&mut self, body: R) -> Result<Response, UpstreamError> {
        let mut body = BufReader::new(body);
        if let Err(err) = body.fill_buf().await {
            return Err(UpstreamError::Client {
                address: self.address.clone(),
                source: ClientError::DataSource(err),
            });
        }

        let result = self.client.send_data_stream(body).await;
        let mut response = self.wrap(result)?;
        let mut first_failure = None;

        if self.lmtp {
            for _ in 1..self.accepted_recipients {
                if first_failure.is_none() && !response.is_success() {
                    first_failure = Some(response.clone());
                }
                let result = self.client.read_data_dot_response().await;
                response = self.wrap(result)?;
            }
        }

        let response = first_failure.unwrap_or(response);
        if response.is_success() {
            Ok(response)
        } else {
            Err(UpstreamError::Client {
                address: self.address.clone(),
                source: ClientError::Rejected(response),
            })
        }
    }

    pub async fn logout(&mut self) -> Result<Response, UpstreamError> {
        let result = self.client.quit().await;
        self.wrap(result)
    }
}
