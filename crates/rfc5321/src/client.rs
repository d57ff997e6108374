use crate::client_types::{parse_response_line, Response, ResponseBuilder, SmtpClientTimeouts};
use crate::parser::{Command, Domain, EsmtpParameter, ForwardPath, ReversePath};
use crate::tls::TlsOptions;
use crate::traits::{AsyncReadAndWrite, BoxedAsyncReadAndWrite};
use data_encoding::BASE64;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::time::timeout;
use tokio_rustls::rustls::pki_types::ServerName;

const MAX_LINE_LEN: usize = 4096;
const DATA_CHUNK_SIZE: usize = 64 * 1024;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("response is not UTF8")]
    Utf8(#[from] std::string::FromUtf8Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Malformed Response: {0}")]
    MalformedResponseLine(String),
    #[error("Response line is too long")]
    ResponseTooLong,
    #[error("Not connected")]
    NotConnected,
    #[error("Command rejected: {}", .0.to_single_line())]
    Rejected(Response),
    #[error("TLS: {0} is not a valid DNS name")]
    InvalidDnsName(String),
    #[error("TLS configuration error: {0}")]
    TlsConfig(#[from] tokio_rustls::rustls::Error),
    #[error("TLS handshake with {hostname} failed: {error}")]
    TlsHandshake {
        hostname: String,
        error: std::io::Error,
    },
    #[error("Timed Out after {duration:?} connecting to {address}")]
    TimeOutConnect { address: String, duration: Duration },
    #[error("Timed Out waiting {duration:?} for response to {command:?}")]
    TimeOutResponse {
        command: Option<Command>,
        duration: Duration,
    },
    #[error("Timed Out writing {duration:?} {command:?}")]
    TimeOutRequest {
        command: Command,
        duration: Duration,
    },
    #[error("Timed Out sending message payload data")]
    TimeOutData,
    #[error("Failed reading message payload: {0}")]
    DataSource(std::io::Error),
}

impl ClientError {
    /// Returns the response from the peer when the error was
    /// caused by the peer rejecting a command
    pub fn rejection(&self) -> Option<&Response> {
        match self {
            Self::Rejected(response) => Some(response),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EsmtpCapability {
    pub name: String,
    pub param: Option<String>,
}

#[derive(Debug)]
pub struct SmtpClient {
    socket: Option<BoxedAsyncReadAndWrite>,
    hostname: String,
    capabilities: HashMap<String, EsmtpCapability>,
    read_buffer: Vec<u8>,
    timeouts: SmtpClientTimeouts,
}

fn extract_hostname(hostname: &str) -> &str {
    // Just the hostname, without any :port
    let fields: Vec<&str> = hostname.rsplitn(2, ':').collect();
    let hostname = if fields.len() == 2 {
        fields[1]
    } else {
        hostname
    };

    if hostname.starts_with('[') && hostname.ends_with(']') {
        &hostname[1..hostname.len() - 1]
    } else {
        hostname
    }
}

async fn connect_tcp<A: ToSocketAddrs + ToString>(
    addr: A,
    timeouts: &SmtpClientTimeouts,
) -> Result<TcpStream, ClientError> {
    let address = addr.to_string();
    let stream = match timeout(timeouts.connect_timeout, TcpStream::connect(addr)).await {
        Ok(result) => result?,
        Err(_) => {
            return Err(ClientError::TimeOutConnect {
                address,
                duration: timeouts.connect_timeout,
            })
        }
    };
    // No need for Nagle with SMTP request/response
    stream.set_nodelay(true)?;
    Ok(stream)
}

impl SmtpClient {
    /// Establish a plain text TCP connection
    pub async fn new<A: ToSocketAddrs + ToString + Clone>(
        addr: A,
        timeouts: SmtpClientTimeouts,
    ) -> Result<Self, ClientError> {
        let stream = connect_tcp(addr.clone(), &timeouts).await?;
        Ok(Self::with_stream(stream, addr.to_string(), timeouts))
    }

    /// Establish a TCP connection and immediately perform a TLS
    /// handshake over it, before any SMTP traffic takes place.
    /// `tls_hostname` is the name that the certificate is checked against.
    pub async fn new_tls<A: ToSocketAddrs + ToString + Clone>(
        addr: A,
        tls_hostname: &str,
        options: &TlsOptions,
        timeouts: SmtpClientTimeouts,
    ) -> Result<Self, ClientError> {
        let stream = connect_tcp(addr, &timeouts).await?;
        let hostname = extract_hostname(tls_hostname).to_string();
        let server_name = server_name(&hostname)?;
        let connector = options.build_tls_connector()?;

        let stream = match timeout(
            timeouts.starttls_timeout,
            connector.connect(server_name, stream),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(error)) => return Err(ClientError::TlsHandshake { hostname, error }),
            Err(_) => {
                return Err(ClientError::TimeOutConnect {
                    address: hostname,
                    duration: timeouts.starttls_timeout,
                })
            }
        };

        Ok(Self::with_stream(stream, tls_hostname, timeouts))
    }

    /// Connect to a local LMTP (or SMTP) service via a unix domain socket
    #[cfg(unix)]
    pub async fn new_unix<P: AsRef<std::path::Path>>(
        path: P,
        peer_hostname: &str,
        timeouts: SmtpClientTimeouts,
    ) -> Result<Self, ClientError> {
        let path = path.as_ref();
        let stream = match timeout(
            timeouts.connect_timeout,
            tokio::net::UnixStream::connect(path),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => {
                return Err(ClientError::TimeOutConnect {
                    address: path.display().to_string(),
                    duration: timeouts.connect_timeout,
                })
            }
        };
        Ok(Self::with_stream(stream, peer_hostname, timeouts))
    }

    pub fn with_stream<S: AsyncReadAndWrite + 'static, H: AsRef<str>>(
        stream: S,
        peer_hostname: H,
        timeouts: SmtpClientTimeouts,
    ) -> Self {
        let hostname = extract_hostname(peer_hostname.as_ref()).to_string();

        Self {
            socket: Some(Box::new(stream)),
            hostname,
            capabilities: HashMap::new(),
            read_buffer: Vec::with_capacity(1024),
            timeouts,
        }
    }

    pub fn timeouts(&self) -> &SmtpClientTimeouts {
        &self.timeouts
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// Override the name used to validate the peer certificate
    /// during STARTTLS
    pub fn set_hostname(&mut self, hostname: &str) {
        self.hostname = extract_hostname(hostname).to_string();
    }

    pub fn capabilities(&self) -> &HashMap<String, EsmtpCapability> {
        &self.capabilities
    }

    pub fn is_connected(&self) -> bool {
        self.socket.is_some()
    }

    async fn read_line(
        &mut self,
        timeout_duration: Duration,
        cmd: Option<&Command>,
    ) -> Result<String, ClientError> {
        let mut too_long = false;
        loop {
            if let Some(i) = memchr::memmem::find(&self.read_buffer, b"\r\n") {
                if too_long {
                    self.read_buffer.drain(0..i + 2);
                    return Err(ClientError::ResponseTooLong);
                }

                let line = String::from_utf8(self.read_buffer[0..i].to_vec());
                self.read_buffer.drain(0..i + 2);
                return Ok(line?);
            }
            if self.read_buffer.len() > MAX_LINE_LEN {
                // Keep a trailing CR in case the LF is in the next read
                let keep = usize::from(self.read_buffer.last() == Some(&b'\r'));
                let len = self.read_buffer.len();
                self.read_buffer.drain(0..len - keep);
                too_long = true;
            }

            // Didn't find a complete line, fill up the rest of the buffer
            let mut data = [0u8; MAX_LINE_LEN];
            let size = match self.socket.as_mut() {
                Some(s) => match timeout(timeout_duration, s.read(&mut data)).await {
                    Ok(result) => result?,
                    Err(_) => {
                        return Err(ClientError::TimeOutResponse {
                            command: cmd.cloned(),
                            duration: timeout_duration,
                        })
                    }
                },
                None => return Err(ClientError::NotConnected),
            };
            if size == 0 {
                self.socket.take();
                return Err(ClientError::NotConnected);
            }
            self.read_buffer.extend_from_slice(&data[0..size]);
        }
    }

    pub async fn read_response(
        &mut self,
        command: Option<&Command>,
        timeout_duration: Duration,
    ) -> Result<Response, ClientError> {
        if let Some(sock) = self.socket.as_mut() {
            sock.flush().await?;
        }

        let mut line = self.read_line(timeout_duration, command).await?;
        tracing::trace!("recv<-{}: {line}", self.hostname);
        let mut parsed = parse_response_line(&line).map_err(ClientError::MalformedResponseLine)?;
        let mut builder = ResponseBuilder::new(&parsed);

        let subsequent_line_timeout_duration = Duration::from_secs(60).min(timeout_duration);
        while !parsed.is_final {
            line = self
                .read_line(subsequent_line_timeout_duration, command)
                .await?;
            tracing::trace!("recv<-{}: {line}", self.hostname);
            parsed = parse_response_line(&line).map_err(ClientError::MalformedResponseLine)?;
            builder
                .add_line(&parsed)
                .map_err(ClientError::MalformedResponseLine)?;
            if parsed.is_final {
                break;
            }
        }

        let response = builder.build(command.map(|cmd| cmd.encode()));
        tracing::trace!(
            "{}: {command:?} response: {}",
            self.hostname,
            response.to_single_line()
        );

        Ok(response)
    }

    async fn write_command(&mut self, command: &Command) -> Result<(), ClientError> {
        let line = command.encode();
        tracing::trace!("send->{}: {}", self.hostname, line.trim_end());
        let duration = command.client_timeout_request(&self.timeouts);
        match self.socket.as_mut() {
            Some(socket) => match timeout(duration, socket.write_all(line.as_bytes())).await {
                Ok(result) => result.map_err(|_| ClientError::NotConnected),
                Err(_) => Err(ClientError::TimeOutRequest {
                    command: command.clone(),
                    duration,
                }),
            },
            None => Err(ClientError::NotConnected),
        }
    }

    pub async fn send_command(&mut self, command: &Command) -> Result<Response, ClientError> {
        self.write_command(command).await?;
        self.read_response(Some(command), command.client_timeout(&self.timeouts))
            .await
    }

    /// Read the banner sent by the server when the connection is
    /// established; anything other than a 220 is a rejection
    pub async fn read_greeting(&mut self) -> Result<Response, ClientError> {
        let response = self
            .read_response(None, self.timeouts.connect_timeout)
            .await?;
        if response.code != 220 {
            return Err(ClientError::Rejected(response));
        }
        Ok(response)
    }

    pub async fn ehlo(
        &mut self,
        ehlo_name: &str,
    ) -> Result<&HashMap<String, EsmtpCapability>, ClientError> {
        self.hello(Command::Ehlo(Domain::Name(ehlo_name.to_string())))
            .await
    }

    /// The LMTP equivalent of EHLO
    pub async fn lhlo(
        &mut self,
        lhlo_name: &str,
    ) -> Result<&HashMap<String, EsmtpCapability>, ClientError> {
        self.hello(Command::Lhlo(Domain::Name(lhlo_name.to_string())))
            .await
    }

    async fn hello(
        &mut self,
        command: Command,
    ) -> Result<&HashMap<String, EsmtpCapability>, ClientError> {
        let response = self.send_command(&command).await?;
        if response.code != 250 {
            return Err(ClientError::Rejected(response));
        }

        let mut capabilities = HashMap::new();

        for line in response.content.lines().skip(1) {
            let mut fields = line.splitn(2, ' ');
            if let Some(name) = fields.next() {
                let param = fields.next().map(|s| s.to_string());
                let cap = EsmtpCapability {
                    name: name.to_string(),
                    param,
                };
                capabilities.insert(name.to_ascii_uppercase(), cap);
            }
        }

        self.capabilities = capabilities;
        Ok(&self.capabilities)
    }

    pub async fn auth_plain(
        &mut self,
        username: &str,
        password: Option<&str>,
    ) -> Result<(), ClientError> {
        // RFC 4616 says that the format is:
        // [authzid] NUL authcid NUL passwd
        let password = password.unwrap_or("");
        let payload = format!("\x00{username}\x00{password}");
        let payload = BASE64.encode(payload.as_bytes());

        let response = self
            .send_command(&Command::Auth {
                sasl_mech: "PLAIN".to_string(),
                initial_response: Some(payload),
            })
            .await?;

        if response.code != 235 {
            return Err(ClientError::Rejected(response));
        }

        Ok(())
    }

    /// Upgrade the current plain text session to TLS.
    /// The capabilities learned from the prior EHLO are discarded;
    /// the caller must issue EHLO again.
    pub async fn starttls(&mut self, options: &TlsOptions) -> Result<(), ClientError> {
        let resp = self.send_command(&Command::StartTls).await?;
        if resp.code != 220 {
            return Err(ClientError::Rejected(resp));
        }

        let server_name = server_name(&self.hostname)?;
        let connector = options.build_tls_connector()?;
        let socket = self.socket.take().ok_or(ClientError::NotConnected)?;
        self.capabilities.clear();
        self.read_buffer.clear();

        match timeout(
            self.timeouts.starttls_timeout,
            connector.connect(server_name, socket),
        )
        .await
        {
            Ok(Ok(stream)) => {
                self.socket.replace(Box::new(stream));
                Ok(())
            }
            Ok(Err(error)) => Err(ClientError::TlsHandshake {
                hostname: self.hostname.clone(),
                error,
            }),
            Err(_) => Err(ClientError::TimeOutResponse {
                command: Some(Command::StartTls),
                duration: self.timeouts.starttls_timeout,
            }),
        }
    }

    pub async fn mail_from(
        &mut self,
        address: &ReversePath,
        parameters: &[EsmtpParameter],
    ) -> Result<Response, ClientError> {
        let response = self
            .send_command(&Command::MailFrom {
                address: address.clone(),
                parameters: parameters.to_vec(),
            })
            .await?;
        if response.code != 250 {
            return Err(ClientError::Rejected(response));
        }
        Ok(response)
    }

    pub async fn rcpt_to(
        &mut self,
        address: &ForwardPath,
        parameters: &[EsmtpParameter],
    ) -> Result<Response, ClientError> {
        let response = self
            .send_command(&Command::RcptTo {
                address: address.clone(),
                parameters: parameters.to_vec(),
            })
            .await?;
        if !matches!(response.code, 250 | 251) {
            return Err(ClientError::Rejected(response));
        }
        Ok(response)
    }

    pub async fn rset(&mut self) -> Result<Response, ClientError> {
        let response = self.send_command(&Command::Rset).await?;
        if response.code != 250 {
            return Err(ClientError::Rejected(response));
        }
        Ok(response)
    }

    /// Say goodbye and close the connection.
    /// The connection is closed even if the server misbehaves.
    pub async fn quit(&mut self) -> Result<Response, ClientError> {
        let result = self.send_command(&Command::Quit).await;
        if let Some(mut socket) = self.socket.take() {
            socket.shutdown().await.ok();
        }
        let response = result?;
        if response.code != 221 {
            return Err(ClientError::Rejected(response));
        }
        Ok(response)
    }

    async fn write_data(&mut self, data: &[u8]) -> Result<(), ClientError> {
        let duration = Command::Data.client_timeout_request(&self.timeouts);
        let socket = self.socket.as_mut().ok_or(ClientError::NotConnected)?;
        match timeout(duration, socket.write_all(data)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => {
                self.socket.take();
                Err(ClientError::Io(err))
            }
            Err(_) => {
                self.socket.take();
                Err(ClientError::TimeOutData)
            }
        }
    }

    /// Issue DATA, then stream the content of `reader` to the server,
    /// dot-stuffing as we go, and terminate it with the final dot.
    ///
    /// Returns the response to the final dot without interpreting
    /// its code: an LMTP server will follow it with one more response
    /// per additional accepted recipient, which can be collected via
    /// `read_data_dot_response`.
    ///
    /// If `reader` fails, the connection is abandoned without sending
    /// the final dot, so that a partial message can never be accepted.
    pub async fn send_data_stream<R: AsyncRead + Unpin>(
        &mut self,
        mut reader: R,
    ) -> Result<Response, ClientError> {
        let data_resp = self.send_command(&Command::Data).await?;
        if data_resp.code != 354 {
            return Err(ClientError::Rejected(data_resp));
        }

        let mut stuffer = DotStuffer::default();
        let mut buf = vec![0u8; DATA_CHUNK_SIZE];
        let mut stuffed = Vec::with_capacity(DATA_CHUNK_SIZE + 1024);
        let mut total = 0;

        loop {
            let size = match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(size) => size,
                Err(err) => {
                    self.socket.take();
                    return Err(ClientError::DataSource(err));
                }
            };
            total += size;
            stuffed.clear();
            stuffer.stuff(&buf[0..size], &mut stuffed);
            self.write_data(&stuffed).await?;
        }

        tracing::trace!("message data was {total} bytes");
        let marker = stuffer.terminator();
        tracing::trace!("send->{}: {}", self.hostname, marker.escape_ascii());
        self.write_data(marker).await?;

        self.read_data_dot_response().await
    }

    pub async fn read_data_dot_response(&mut self) -> Result<Response, ClientError> {
        let data_dot = Command::DataDot;
        self.read_response(Some(&data_dot), data_dot.client_timeout(&self.timeouts))
            .await
    }
}

fn server_name(hostname: &str) -> Result<ServerName<'static>, ClientError> {
    ServerName::try_from(hostname.to_string())
        .map_err(|_| ClientError::InvalidDnsName(hostname.to_string()))
}

/// Incrementally applies RFC 5321 section 4.5.2 transparency to a
/// message that arrives in arbitrarily sized chunks
#[derive(Debug)]
pub struct DotStuffer {
    at_line_start: bool,
    last_byte: Option<u8>,
}

impl Default for DotStuffer {
    fn default() -> Self {
        Self {
            at_line_start: true,
            last_byte: None,
        }
    }
}

impl DotStuffer {
    pub fn stuff(&mut self, data: &[u8], out: &mut Vec<u8>) {
        let Some(&last) = data.last() else {
            return;
        };

        if self.at_line_start && data[0] == b'.' {
            out.push(b'.');
        }

        let mut last_idx = 0;
        for i in memchr::memchr_iter(b'\n', data) {
            out.extend_from_slice(&data[last_idx..=i]);
            if data.get(i + 1) == Some(&b'.') {
                out.push(b'.');
            }
            last_idx = i + 1;
        }
        out.extend_from_slice(&data[last_idx..]);

        self.at_line_start = last == b'\n';
        self.last_byte = Some(last);
    }

    /// The sequence that ends the DATA phase, taking care to
    /// terminate an unterminated final line first
    pub fn terminator(&self) -> &'static [u8] {
        match self.last_byte {
            Some(b'\n') => b".\r\n",
            _ => b"\r\n.\r\n",
        }
    }
}
