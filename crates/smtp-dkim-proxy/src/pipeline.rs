use crate::dkim::{MessageSigner, SigningError};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use data_encoding::HEXUPPER;
use serde::Deserialize;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc::Sender;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::io::StreamReader;
use tracing::Instrument;

pub const PRODUCT_NAME: &str = "smtp-dkim-proxy";

const CHUNK_SIZE: usize = 64 * 1024;

/// What to do with a message that could not be signed
#[derive(Deserialize, Debug, Default, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SigningFailurePolicy {
    /// Relay the message without a signature
    #[default]
    DeliverUnsigned,
    /// Fail the DATA transfer
    Reject,
}

/// Short random identifier used to correlate the log lines and
/// the trace header of a single message
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MessageId(String);

impl MessageId {
    pub fn generate() -> Self {
        Self(HEXUPPER.encode(&rand::random::<[u8; 5]>()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        fmt.write_str(&self.0)
    }
}

pub fn trace_header(by_domain: &str, id: &MessageId, when: DateTime<Utc>) -> String {
    format!(
        "Received: by {by_domain} ({PRODUCT_NAME}) with ESMTPSA id {id};\r\n\t{}\r\n",
        when.format("%a, %-d %b %Y %H:%M:%S %z (UTC)")
    )
}

/// The transformed message, as seen by the consumer
pub type MessageStream = StreamReader<ReceiverStream<std::io::Result<Bytes>>, Bytes>;

pub struct SigningPipeline {
    by_domain: String,
    signer: Arc<dyn MessageSigner>,
    policy: SigningFailurePolicy,
    spool_limit: usize,
}

impl std::fmt::Debug for SigningPipeline {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        fmt.debug_struct("SigningPipeline")
            .field("by_domain", &self.by_domain)
            .field("policy", &self.policy)
            .field("spool_limit", &self.spool_limit)
            .finish()
    }
}

enum Spooled {
    Complete(Vec<u8>),
    Overflow(Vec<u8>),
}

impl SigningPipeline {
    pub fn new(
        by_domain: impl Into<String>,
        signer: Arc<dyn MessageSigner>,
        policy: SigningFailurePolicy,
        spool_limit: usize,
    ) -> Self {
        Self {
            by_domain: by_domain.into(),
            signer,
            policy,
            spool_limit,
        }
    }

    pub fn by_domain(&self) -> &str {
        &self.by_domain
    }

    /// Start producing the transformed version of `input`.
    ///
    /// The returned stream yields the trace header, then the signature
    /// header (when signing succeeded) and then the original message.
    /// At most one chunk is buffered between the producer and the
    /// consumer. Dropping the stream causes the producer to stop;
    /// the join handle can be used to abort it outright.
    pub fn transform<R>(&self, id: &MessageId, input: R) -> (MessageStream, JoinHandle<()>)
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let (tx, rx) = tokio::sync::mpsc::channel(1);
        let producer = Producer {
            header: trace_header(&self.by_domain, id, Utc::now()),
            signer: self.signer.clone(),
            policy: self.policy,
            spool_limit: self.spool_limit,
            tx,
        };
        let handle = tokio::spawn(producer.run(input).in_current_span());
        (StreamReader::new(ReceiverStream::new(rx)), handle)
    }
}

struct Producer {
    header: String,
    signer: Arc<dyn MessageSigner>,
    policy: SigningFailurePolicy,
    spool_limit: usize,
    tx: Sender<std::io::Result<Bytes>>,
}

/// The consumer went away; there is nobody left to tell
struct Disconnected;

impl Producer {
    async fn run<R: AsyncRead + Unpin>(self, mut input: R) {
        if self.produce(&mut input).await.is_err() {
            tracing::debug!("consumer closed the message stream early");
        }
        // Dropping self.tx here signals the end of the message
    }

    async fn send(&self, data: Bytes) -> Result<(), Disconnected> {
        self.tx.send(Ok(data)).await.map_err(|_| Disconnected)
    }

    async fn send_error(&self, err: std::io::Error) -> Result<(), Disconnected> {
        self.tx.send(Err(err)).await.map_err(|_| Disconnected)
    }

    async fn send_spool(&self, spool: Bytes) -> Result<(), Disconnected> {
        let mut offset = 0;
        while offset < spool.len() {
            let end = (offset + CHUNK_SIZE).min(spool.len());
            self.send(spool.slice(offset..end)).await?;
            offset = end;
        }
        Ok(())
    }

    /// Read from the input, giving up if the consumer goes away
    /// while we wait
    async fn read<R: AsyncRead + Unpin>(
        &self,
        input: &mut R,
        buf: &mut [u8],
    ) -> Result<std::io::Result<usize>, Disconnected> {
        tokio::select! {
            result = input.read(buf) => Ok(result),
            _ = self.tx.closed() => Err(Disconnected),
        }
    }

    async fn spool<R: AsyncRead + Unpin>(
        &self,
        input: &mut R,
    ) -> Result<std::io::Result<Spooled>, Disconnected> {
        let mut spool = Vec::new();
        let mut buf = vec![0u8; CHUNK_SIZE];
        loop {
            let size = match self.read(input, &mut buf).await? {
                Ok(0) => return Ok(Ok(Spooled::Complete(spool))),
                Ok(size) => size,
                Err(err) => return Ok(Err(err)),
            };
            spool.extend_from_slice(&buf[0..size]);
            if spool.len() > self.spool_limit {
                return Ok(Ok(Spooled::Overflow(spool)));
            }
        }
    }

    /// Signing is CPU bound, so it runs on the blocking pool. The
    /// task gets its own handle on the spool.
    async fn sign(&self, spool: &Bytes) -> Result<String, SigningError> {
        let signer = self.signer.clone();
        let spool = spool.clone();
        tracing::debug!("signing {} bytes", spool.len());
        tokio::task::spawn_blocking(move || signer.sign(&spool))
            .await
            .map_err(|err| SigningError::Task(err.to_string()))?
    }

    async fn produce<R: AsyncRead + Unpin>(&self, input: &mut R) -> Result<(), Disconnected> {
        // Nothing is emitted until the spool is complete and the signing
        // outcome is known, so a consumer sees a failure before any
        // message data
        let (spool, signature) = match self.spool(input).await? {
            Ok(Spooled::Complete(spool)) => {
                let spool = Bytes::from(spool);
                let signature = self.sign(&spool).await;
                (spool, signature)
            }
            Ok(Spooled::Overflow(spool)) => (
                Bytes::from(spool),
                Err(SigningError::MessageTooLarge {
                    limit: self.spool_limit,
                }),
            ),
            Err(err) => {
                tracing::error!("failed to read message: {err:#}");
                return self.send_error(err).await;
            }
        };

        match signature {
            Ok(header) => {
                tracing::info!("signed");
                self.send(Bytes::from(self.header.clone())).await?;
                self.send(Bytes::from(header)).await?;
                self.send_spool(spool).await
            }
            Err(err) => {
                tracing::warn!("unable to sign message: {err:#}");
                match self.policy {
                    SigningFailurePolicy::Reject => {
                        self.send_error(std::io::Error::other(format!(
                            "unable to sign message: {err}"
                        )))
                        .await
                    }
                    SigningFailurePolicy::DeliverUnsigned => {
                        self.send(Bytes::from(self.header.clone())).await?;
                        self.recover(spool, input).await.inspect_err(|_| {
                            tracing::error!("unable to recover: message stream closed");
                        })
                    }
                }
            }
        }
    }

    /// Replay what was consumed by the signing attempt, followed
    /// by the remainder of the input
    async fn recover<R: AsyncRead + Unpin>(
        &self,
        spool: Bytes,
        input: &mut R,
    ) -> Result<(), Disconnected> {
        self.send_spool(spool).await?;

        let mut buf = vec![0u8; CHUNK_SIZE];
        loop {
            match self.read(input, &mut buf).await? {
                Ok(0) => break,
                Ok(size) => self.send(Bytes::copy_from_slice(&buf[0..size])).await?,
                Err(err) => {
                    tracing::error!("unable to recover: {err:#}");
                    return self.send_error(err).await;
                }
            }
        }

        tracing::info!("recovered, relaying unsigned");
        Ok(())
    }
}
