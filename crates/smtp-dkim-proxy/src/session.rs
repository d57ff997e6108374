use crate::pipeline::MessageId;
use crate::upstream::{UpstreamError, UpstreamSession};
use crate::vhost::{AuthError, Registry, VirtualHost};
use rfc5321::{EsmtpParameter, ForwardPath, Response, ReversePath};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::AsyncRead;
use tracing::Instrument;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error("session is closed")]
    Closed,
    #[error("bad sequence of commands: {0}")]
    BadSequence(&'static str),
    #[error("rejected by upstream: {}", .0.to_single_line())]
    Rejected(Response),
    #[error(transparent)]
    Transport(UpstreamError),
}

impl From<UpstreamError> for SessionError {
    fn from(err: UpstreamError) -> Self {
        match err.rejection() {
            Some(response) => Self::Rejected(response.clone()),
            None => Self::Transport(err),
        }
    }
}

struct BoundSession {
    identity: String,
    vhost: Arc<VirtualHost>,
    upstream: UpstreamSession,
    sender: Option<ReversePath>,
    recipients: Vec<ForwardPath>,
}

impl BoundSession {
    async fn reset(&mut self) {
        self.sender.take();
        self.recipients.clear();
        if let Err(err) = self.upstream.reset().await {
            tracing::debug!("upstream RSET failed: {err:#}");
        }
    }
}

enum State {
    Unauthenticated,
    Bound(Box<BoundSession>),
    Closed,
}

/// The state of one client connection: who they are, which upstream
/// they are bound to and the envelope that is being built up
pub struct ConnectionSession {
    state: State,
}

impl Default for ConnectionSession {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionSession {
    pub fn new() -> Self {
        Self {
            state: State::Unauthenticated,
        }
    }

    fn bound(&mut self) -> Result<&mut BoundSession, SessionError> {
        match &mut self.state {
            State::Bound(bound) => Ok(bound),
            State::Unauthenticated => Err(AuthError::Required.into()),
            State::Closed => Err(SessionError::Closed),
        }
    }

    pub fn is_authenticated(&self) -> bool {
        matches!(self.state, State::Bound(_))
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.state, State::Closed)
    }

    pub fn identity(&self) -> Option<&str> {
        match &self.state {
            State::Bound(bound) => Some(&bound.identity),
            _ => None,
        }
    }

    pub fn virtual_host(&self) -> Option<&Arc<VirtualHost>> {
        match &self.state {
            State::Bound(bound) => Some(&bound.vhost),
            _ => None,
        }
    }

    pub fn sender(&self) -> Option<&ReversePath> {
        match &self.state {
            State::Bound(bound) => bound.sender.as_ref(),
            _ => None,
        }
    }

    pub fn recipients(&self) -> &[ForwardPath] {
        match &self.state {
            State::Bound(bound) => &bound.recipients,
            _ => &[],
        }
    }

    /// Verify the credentials and bind this session to the
    /// virtual host of the identity's domain
    pub async fn authenticate(
        &mut self,
        registry: &Registry,
        identity: &str,
        password: &str,
    ) -> Result<(), SessionError> {
        match self.state {
            State::Unauthenticated => {}
            State::Bound(_) => return Err(SessionError::BadSequence("already authenticated")),
            State::Closed => return Err(SessionError::Closed),
        }

        let (vhost, upstream) = registry.login(identity, password).await?;
        self.state = State::Bound(Box::new(BoundSession {
            identity: identity.to_string(),
            vhost,
            upstream,
            sender: None,
            recipients: vec![],
        }));
        Ok(())
    }

    /// Abandon the current envelope. While bound, the upstream always
    /// gets an RSET, even when nothing is in progress locally.
    /// Before authenticating this does nothing.
    pub async fn reset(&mut self) {
        let State::Bound(bound) = &mut self.state else {
            return;
        };
        bound.reset().await;
    }

    pub async fn mail(
        &mut self,
        from: ReversePath,
        parameters: &[EsmtpParameter],
    ) -> Result<Response, SessionError> {
        let bound = self.bound()?;
        if bound.sender.is_some() {
            return Err(SessionError::BadSequence("nested MAIL command"));
        }
        let response = bound.upstream.mail(&from, parameters).await?;
        bound.sender.replace(from);
        Ok(response)
    }

    pub async fn rcpt(
        &mut self,
        to: ForwardPath,
        parameters: &[EsmtpParameter],
    ) -> Result<Response, SessionError> {
        let bound = self.bound()?;
        if bound.sender.is_none() {
            return Err(SessionError::BadSequence("need MAIL before RCPT"));
        }
        let response = bound.upstream.rcpt(&to, parameters).await?;
        bound.recipients.push(to);
        Ok(response)
    }

    /// Check the preconditions for DATA, so that the client can
    /// be told to go ahead before the transfer begins
    pub fn can_accept_data(&mut self) -> Result<(), SessionError> {
        let bound = self.bound()?;
        if bound.sender.is_none() {
            return Err(SessionError::BadSequence("need MAIL before DATA"));
        }
        if bound.recipients.is_empty() {
            return Err(SessionError::BadSequence("need RCPT before DATA"));
        }
        Ok(())
    }

    /// Sign and relay the message read from `body`.
    /// The envelope is reset afterwards, whatever the outcome.
    pub async fn data<R>(&mut self, body: R) -> Result<Response, SessionError>
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        self.can_accept_data()?;
        let bound = self.bound()?;

        let id = MessageId::generate();
        let from = bound
            .sender
            .as_ref()
            .map(|s| s.to_string())
            .unwrap_or_default();
        let to: Vec<String> = bound.recipients.iter().map(|r| r.to_string()).collect();
        let span = tracing::info_span!("message", id = %id, from = %from, to = ?to);

        let result = async {
            tracing::info!("relaying message via {}", bound.upstream.address());
            let (stream, producer) = bound.vhost.pipeline.transform(&id, body);
            let result = bound.upstream.data(stream).await;
            producer.abort();
            match &result {
                Ok(response) => tracing::info!("accepted: {}", response.to_single_line()),
                Err(err) => tracing::warn!("delivery failed: {err:#}"),
            }
            result
        }
        .instrument(span)
        .await;

        // The upstream has concluded the transaction one way or another;
        // its own envelope is already clear
        bound.sender.take();
        bound.recipients.clear();

        if let Err(err) = &result {
            if err.rejection().is_none() && bound.upstream.is_connected() {
                bound.reset().await;
            }
        }

        Ok(result?)
    }

    /// Reset and close the upstream session. The session cannot be
    /// used afterwards.
    pub async fn logout(&mut self) -> Result<(), SessionError> {
        match std::mem::replace(&mut self.state, State::Closed) {
            State::Closed => Err(SessionError::Closed),
            State::Unauthenticated => Ok(()),
            State::Bound(mut bound) => {
                bound.reset().await;
                bound.upstream.logout().await?;
                tracing::debug!("{} logged out", bound.identity);
                Ok(())
            }
        }
    }
}
