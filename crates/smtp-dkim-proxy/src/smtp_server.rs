use crate::config::ProxyConfig;
use crate::session::{ConnectionSession, SessionError};
use crate::vhost::{AuthError, Registry};
use bytes::Bytes;
use data_encoding::BASE64;
use rfc5321::{Command, EsmtpParameter};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
    BufWriter, ReadHalf, WriteHalf,
};
use tokio::sync::mpsc::Sender;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::io::StreamReader;
use tracing::instrument;

const MAX_LINE_LEN: u64 = 4096;
const BODY_CHUNK_SIZE: usize = 64 * 1024;

/// Settings shared by every client connection
#[derive(Debug)]
pub struct ServerParams {
    pub hostname: String,
    pub registry: Arc<Registry>,
    pub max_message_bytes: usize,
    pub max_recipients: usize,
    pub allow_insecure_auth: bool,
    pub idle_timeout: Duration,
    pub write_timeout: Duration,
}

impl ServerParams {
    pub fn from_config(config: &ProxyConfig, registry: Arc<Registry>) -> Self {
        Self {
            hostname: config.domain.clone(),
            registry,
            max_message_bytes: config.max_message_bytes,
            max_recipients: config.max_recipients,
            allow_insecure_auth: config.allow_insecure_auth(),
            idle_timeout: config.idle_timeout,
            write_timeout: config.write_timeout,
        }
    }
}

enum ClientLine {
    Line(String),
    Disconnected,
    IdleTimeout,
}

/// How reading a message body from the client ended
#[derive(Debug, PartialEq, Eq)]
enum BodyOutcome {
    Complete,
    TooLarge,
    Disconnected,
    IdleTimeout,
}

pub struct SmtpServer<T> {
    reader: BufReader<ReadHalf<T>>,
    writer: BufWriter<WriteHalf<T>>,
    params: Arc<ServerParams>,
    session: ConnectionSession,
    said_hello: Option<String>,
    tls_active: bool,
    peer_address: SocketAddr,
}

/// Map a session failure to what we tell the client
fn error_response(err: &SessionError) -> String {
    match err {
        SessionError::Auth(AuthError::Failed) => {
            "535 5.7.8 Authentication credentials invalid\r\n".to_string()
        }
        SessionError::Auth(AuthError::Required) => {
            "530 5.7.0 Authentication required\r\n".to_string()
        }
        SessionError::Closed => "421 4.3.0 Session closed\r\n".to_string(),
        SessionError::BadSequence(reason) => format!("503 5.5.1 Bad sequence of commands: {reason}\r\n"),
        SessionError::Rejected(response) => response.to_wire(),
        SessionError::Transport(_) => {
            "451 4.3.0 Upstream server unavailable, try again later\r\n".to_string()
        }
    }
}

fn decode_base64_text(text: &str) -> Option<String> {
    let decoded = BASE64.decode(text.trim().as_bytes()).ok()?;
    String::from_utf8(decoded).ok()
}

/// Split an RFC 4616 PLAIN response into the identity and password
fn parse_sasl_plain(text: &str) -> Option<(String, String)> {
    let decoded = BASE64.decode(text.trim().as_bytes()).ok()?;
    let mut fields = decoded.split(|&b| b == 0);
    let authz = fields.next()?;
    let authc = fields.next()?;
    let passwd = fields.next()?;
    if fields.next().is_some() {
        return None;
    }
    if !authz.is_empty() && authz != authc {
        // We don't support acting on behalf of another identity
        return None;
    }
    Some((
        String::from_utf8(authc.to_vec()).ok()?,
        String::from_utf8(passwd.to_vec()).ok()?,
    ))
}

impl<T: AsyncRead + AsyncWrite + Send + 'static> SmtpServer<T> {
    pub async fn run(
        socket: T,
        peer_address: SocketAddr,
        tls_active: bool,
        params: Arc<ServerParams>,
    ) -> anyhow::Result<()> {
        let (reader, writer) = tokio::io::split(socket);
        let reader = tokio::io::BufReader::new(reader);
        let writer = tokio::io::BufWriter::new(writer);
        let mut server = SmtpServer {
            reader,
            writer,
            params,
            session: ConnectionSession::new(),
            said_hello: None,
            tls_active,
            peer_address,
        };

        match server.process().await {
            Ok(()) => {
                if !server.session.is_closed() {
                    server.session.logout().await.ok();
                }
                Ok(())
            }
            Err(err) => {
                server
                    .write_response(421, "4.3.0 technical difficulties")
                    .await
                    .ok();
                // Dropping the session closes the upstream connection
                Err(err)
            }
        }
    }

    fn auth_permitted(&self) -> bool {
        self.tls_active || self.params.allow_insecure_auth
    }

    async fn write_wire(&mut self, text: &str) -> anyhow::Result<()> {
        let duration = self.params.write_timeout;
        tokio::time::timeout(duration, async {
            self.writer.write_all(text.as_bytes()).await?;
            self.writer.flush().await
        })
        .await
        .map_err(|_| anyhow::anyhow!("timed out after {duration:?} writing to client"))??;
        Ok(())
    }

    async fn write_response<S: AsRef<str>>(&mut self, status: u16, message: S) -> anyhow::Result<()> {
        let message = message.as_ref();
        if message.is_empty() {
            return self.write_wire(&format!("{status} \r\n")).await;
        }

        let mut text = String::new();
        let mut lines = message.lines().peekable();
        while let Some(line) = lines.next() {
            let is_last = lines.peek().is_none();
            let sep = if is_last { ' ' } else { '-' };
            text.push_str(&format!("{status}{sep}{line}\r\n"));
        }
        self.write_wire(&text).await
    }

    async fn write_session_error(&mut self, err: &SessionError) -> anyhow::Result<()> {
        match err {
            SessionError::Transport(source) => tracing::warn!("{source:#}"),
            err => tracing::debug!("{err:#}"),
        }
        self.write_wire(&error_response(err)).await
    }

    async fn read_line(&mut self) -> anyhow::Result<ClientLine> {
        let mut line = String::new();
        let mut limited = (&mut self.reader).take(MAX_LINE_LEN);
        match tokio::time::timeout(self.params.idle_timeout, limited.read_line(&mut line)).await {
            Err(_) => Ok(ClientLine::IdleTimeout),
            Ok(Ok(0)) => Ok(ClientLine::Disconnected),
            Ok(Ok(_)) => Ok(ClientLine::Line(line)),
            Ok(Err(err)) => Err(err.into()),
        }
    }

    /// Read a SASL continuation line. Returns None if the client
    /// cancelled the exchange.
    async fn read_sasl_response(&mut self, challenge: &str) -> anyhow::Result<Option<String>> {
        self.write_response(334, challenge).await?;
        match self.read_line().await? {
            ClientLine::Line(line) => {
                let line = line.trim_end().to_string();
                if line == "*" {
                    Ok(None)
                } else {
                    Ok(Some(line))
                }
            }
            ClientLine::Disconnected => anyhow::bail!("client disconnected during AUTH"),
            ClientLine::IdleTimeout => anyhow::bail!("client timed out during AUTH"),
        }
    }

    async fn handle_auth(
        &mut self,
        sasl_mech: &str,
        initial_response: Option<String>,
    ) -> anyhow::Result<()> {
        if self.said_hello.is_none() {
            return self.write_response(503, "5.5.1 Send EHLO first").await;
        }
        if self.session.is_authenticated() {
            return self.write_response(503, "5.5.1 Already authenticated").await;
        }
        if !self.auth_permitted() {
            return self
                .write_response(
                    523,
                    "5.7.10 Encryption required for requested authentication mechanism",
                )
                .await;
        }

        let credentials = match sasl_mech {
            "PLAIN" => {
                let response = match initial_response {
                    // A lone "=" is an empty initial response
                    Some(r) if r != "=" => Some(r),
                    _ => self.read_sasl_response("").await?,
                };
                match response {
                    None => None,
                    Some(response) => match parse_sasl_plain(&response) {
                        Some(creds) => Some(creds),
                        None => {
                            return self
                                .write_response(501, "5.5.2 Cannot decode AUTH PLAIN response")
                                .await;
                        }
                    },
                }
            }
            "LOGIN" => {
                let username = match initial_response {
                    Some(r) => Some(r),
                    None => self.read_sasl_response("VXNlcm5hbWU6").await?,
                };
                let Some(username) = username else {
                    return self.write_response(501, "5.0.0 Authentication cancelled").await;
                };
                let Some(username) = decode_base64_text(&username) else {
                    return self
                        .write_response(501, "5.5.2 Cannot decode AUTH LOGIN response")
                        .await;
                };
                let Some(password) = self.read_sasl_response("UGFzc3dvcmQ6").await? else {
                    return self.write_response(501, "5.0.0 Authentication cancelled").await;
                };
                let Some(password) = decode_base64_text(&password) else {
                    return self
                        .write_response(501, "5.5.2 Cannot decode AUTH LOGIN response")
                        .await;
                };
                Some((username, password))
            }
            _ => {
                return self
                    .write_response(504, "5.5.4 Unrecognized authentication type")
                    .await;
            }
        };

        let Some((username, password)) = credentials else {
            return self.write_response(501, "5.0.0 Authentication cancelled").await;
        };

        let registry = self.params.registry.clone();
        match self
            .session
            .authenticate(&registry, &username, &password)
            .await
        {
            Ok(()) => {
                tracing::info!("{} authenticated as {username}", self.peer_address);
                self.write_response(235, "2.7.0 Authentication successful")
                    .await
            }
            Err(err) => self.write_session_error(&err).await,
        }
    }

    async fn handle_data(&mut self) -> anyhow::Result<Option<BodyOutcome>> {
        if let Err(err) = self.session.can_accept_data() {
            self.write_session_error(&err).await?;
            return Ok(None);
        }
        self.write_response(354, "Start mail input; end with <CRLF>.<CRLF>")
            .await?;

        let (tx, rx) = tokio::sync::mpsc::channel(1);
        let body = StreamReader::new(ReceiverStream::new(rx));
        let (outcome, result) = tokio::join!(
            read_message_body(
                &mut self.reader,
                tx,
                self.params.max_message_bytes,
                self.params.idle_timeout
            ),
            self.session.data(body)
        );
        let outcome = outcome?;

        match outcome {
            BodyOutcome::Complete => match result {
                Ok(response) => {
                    self.write_wire(&response.to_wire()).await?;
                }
                Err(err) => {
                    self.write_session_error(&err).await?;
                }
            },
            BodyOutcome::TooLarge => {
                tracing::info!(
                    "message from {} exceeds {} bytes",
                    self.peer_address,
                    self.params.max_message_bytes
                );
                self.write_response(552, "5.3.4 Message size exceeds fixed maximum message size")
                    .await?;
            }
            BodyOutcome::Disconnected | BodyOutcome::IdleTimeout => {}
        }

        Ok(Some(outcome))
    }

    #[instrument(skip(self), fields(peer = %self.peer_address))]
    async fn process(&mut self) -> anyhow::Result<()> {
        self.write_response(
            220,
            format!("{} ESMTP Service Ready", self.params.hostname),
        )
        .await?;

        loop {
            let line = match self.read_line().await? {
                ClientLine::Line(line) => line,
                ClientLine::Disconnected => return Ok(()),
                ClientLine::IdleTimeout => {
                    self.write_response(421, "4.4.2 Idle timeout, closing connection")
                        .await?;
                    return Ok(());
                }
            };
            let line = line.trim_end();

            match Command::parse(line) {
                Err(err) => {
                    self.write_response(
                        501,
                        format!("5.5.2 Syntax error in command or arguments: {err}"),
                    )
                    .await?;
                }
                Ok(Command::Quit) => {
                    self.session.logout().await.ok();
                    self.write_response(221, "2.0.0 Bye").await?;
                    return Ok(());
                }
                Ok(Command::Ehlo(domain)) => {
                    self.session.reset().await;
                    let mut text = format!(
                        "{} Hello {domain}\nPIPELINING\n8BITMIME\nENHANCEDSTATUSCODES\nSIZE {}",
                        self.params.hostname, self.params.max_message_bytes
                    );
                    if self.auth_permitted() {
                        text.push_str("\nAUTH PLAIN LOGIN");
                    }
                    self.write_response(250, text).await?;
                    self.said_hello.replace(domain.to_string());
                }
                Ok(Command::Helo(domain)) => {
                    self.session.reset().await;
                    self.write_response(250, format!("{} Hello {domain}", self.params.hostname))
                        .await?;
                    self.said_hello.replace(domain.to_string());
                }
                Ok(Command::Auth {
                    sasl_mech,
                    initial_response,
                }) => {
                    self.handle_auth(&sasl_mech, initial_response).await?;
                }
                Ok(Command::MailFrom {
                    address,
                    parameters,
                }) => {
                    if self.said_hello.is_none() {
                        self.write_response(503, "5.5.1 Send EHLO first").await?;
                        continue;
                    }

                    let mut relayed: Vec<EsmtpParameter> = vec![];
                    let mut too_big = false;
                    for param in parameters {
                        if param.name.eq_ignore_ascii_case("SIZE") {
                            let size = param.value.as_deref().and_then(|v| v.parse::<usize>().ok());
                            too_big = size.is_some_and(|size| size > self.params.max_message_bytes);
                        } else {
                            relayed.push(param);
                        }
                    }
                    if too_big {
                        self.write_response(
                            552,
                            "5.3.4 Message size exceeds fixed maximum message size",
                        )
                        .await?;
                        continue;
                    }

                    match self.session.mail(address, &relayed).await {
                        Ok(_) => self.write_response(250, "2.1.0 OK").await?,
                        Err(err) => self.write_session_error(&err).await?,
                    }
                }
                Ok(Command::RcptTo {
                    address,
                    parameters,
                }) => {
                    if self.session.recipients().len() >= self.params.max_recipients {
                        self.write_response(452, "4.5.3 Too many recipients").await?;
                        continue;
                    }
                    match self.session.rcpt(address, &parameters).await {
                        Ok(_) => self.write_response(250, "2.1.5 OK").await?,
                        Err(err) => self.write_session_error(&err).await?,
                    }
                }
                Ok(Command::Data) => match self.handle_data().await? {
                    Some(BodyOutcome::Disconnected) => {
                        anyhow::bail!("client disconnected during DATA")
                    }
                    Some(BodyOutcome::IdleTimeout) => {
                        self.write_response(421, "4.4.2 Idle timeout, closing connection")
                            .await?;
                        anyhow::bail!("client timed out during DATA");
                    }
                    _ => {}
                },
                Ok(Command::Rset) => {
                    self.session.reset().await;
                    self.write_response(250, "2.0.0 OK").await?;
                }
                Ok(Command::Noop(_)) => {
                    self.write_response(250, "2.0.0 OK").await?;
                }
                Ok(Command::Vrfy(_)) => {
                    self.write_response(252, "2.5.0 Cannot VRFY user").await?;
                }
                Ok(Command::Help(_)) => {
                    self.write_response(
                        214,
                        "2.0.0 Supported: EHLO HELO AUTH MAIL RCPT DATA RSET NOOP QUIT",
                    )
                    .await?;
                }
                Ok(
                    Command::Expn(_)
                    | Command::StartTls
                    | Command::Lhlo(_)
                    | Command::DataDot,
                ) => {
                    self.write_response(502, "5.5.1 Command not implemented")
                        .await?;
                }
            }
        }
    }
}

/// Copy the dot-terminated message body from the client into `tx`,
/// removing the transparency dots.
///
/// Reading continues up to the final dot even once the consumer has
/// gone away or the size limit was exceeded, so that the client and
/// server stay in step. Exceeding the limit is reported to the
/// consumer as an error so that a partial message is never completed.
async fn read_message_body<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    tx: Sender<std::io::Result<Bytes>>,
    max_size: usize,
    idle_timeout: Duration,
) -> anyhow::Result<BodyOutcome> {
    let mut chunk = Vec::with_capacity(BODY_CHUNK_SIZE);
    let mut total = 0;
    let mut tx = Some(tx);
    let mut line = Vec::new();

    loop {
        line.clear();
        let size = match tokio::time::timeout(idle_timeout, reader.read_until(b'\n', &mut line))
            .await
        {
            Err(_) => {
                if let Some(tx) = tx.take() {
                    tx.send(Err(std::io::Error::other("client timed out")))
                        .await
                        .ok();
                }
                return Ok(BodyOutcome::IdleTimeout);
            }
            Ok(Ok(size)) => size,
            Ok(Err(err)) => {
                // A dropped sender would read as a complete body
                if let Some(tx) = tx.take() {
                    tx.send(Err(std::io::Error::new(err.kind(), err.to_string())))
                        .await
                        .ok();
                }
                return Err(err.into());
            }
        };
        if size == 0 {
            if let Some(tx) = tx.take() {
                tx.send(Err(std::io::Error::other("client disconnected")))
                    .await
                    .ok();
            }
            return Ok(BodyOutcome::Disconnected);
        }

        if line == b".\r\n" || line == b".\n" {
            break;
        }

        let data = line.strip_prefix(b".").unwrap_or(&line);
        total += data.len();

        if total > max_size {
            if let Some(tx) = tx.take() {
                tx.send(Err(std::io::Error::other("message too large")))
                    .await
                    .ok();
            }
            continue;
        }

        if let Some(sender) = &tx {
            chunk.extend_from_slice(data);
            if chunk.len() >= BODY_CHUNK_SIZE {
                let data = Bytes::from(std::mem::take(&mut chunk));
                if sender.send(Ok(data)).await.is_err() {
                    // The upstream transfer is over; keep draining
                    tx.take();
                }
            }
        }
    }

    if total > max_size {
        return Ok(BodyOutcome::TooLarge);
    }
    if let Some(sender) = tx.take() {
        if !chunk.is_empty() {
            sender.send(Ok(Bytes::from(chunk))).await.ok();
        }
    }
    Ok(BodyOutcome::Complete)
}
