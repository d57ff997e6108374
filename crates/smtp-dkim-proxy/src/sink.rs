//! An in-process SMTP/LMTP server that records what it receives.
//!
//! Some addresses provoke failures, keyed on the local part:
//! a sender of `mailfail` is refused at MAIL, `datafail` is refused
//! after the final dot, recipients starting with `reject` are refused
//! at RCPT and, over LMTP, `lmtpfail` gets a transient failure in the
//! per-recipient DATA responses.
use data_encoding::BASE64;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;

#[derive(Debug, Clone)]
pub struct SinkConfig {
    pub lmtp: bool,
    /// Any user name is accepted along with this password
    pub password: String,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            lmtp: false,
            password: "secret".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub sender: String,
    pub recipients: Vec<String>,
    pub body: Vec<u8>,
}

#[derive(Default)]
struct Journal {
    commands: Mutex<Vec<String>>,
    deliveries: Mutex<Vec<Delivery>>,
    closed: Mutex<usize>,
}

pub struct SinkServer {
    address: String,
    journal: Arc<Journal>,
    task: tokio::task::JoinHandle<()>,
}

impl Drop for SinkServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn local_part(path: &str) -> &str {
    path.rsplit_once('@').map(|(local, _)| local).unwrap_or(path)
}

fn angle_addr(args: &str) -> String {
    match (args.find('<'), args.find('>')) {
        (Some(start), Some(end)) if start < end => args[start + 1..end].to_string(),
        _ => args.split_whitespace().next().unwrap_or("").to_string(),
    }
}

impl SinkServer {
    pub async fn start(config: SinkConfig) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let journal = Arc::new(Journal::default());
        let config = Arc::new(config);

        let task = tokio::spawn({
            let journal = journal.clone();
            async move {
                while let Ok((socket, _peer)) = listener.accept().await {
                    tokio::spawn(handle_client(socket, config.clone(), journal.clone()));
                }
            }
        });

        Self {
            address,
            journal,
            task,
        }
    }

    #[cfg(unix)]
    pub async fn start_unix(path: &std::path::Path, config: SinkConfig) -> Self {
        let listener = tokio::net::UnixListener::bind(path).unwrap();
        let journal = Arc::new(Journal::default());
        let config = Arc::new(config);

        let task = tokio::spawn({
            let journal = journal.clone();
            async move {
                while let Ok((socket, _peer)) = listener.accept().await {
                    tokio::spawn(handle_client(socket, config.clone(), journal.clone()));
                }
            }
        });

        Self {
            address: path.display().to_string(),
            journal,
            task,
        }
    }

    pub fn address(&self) -> String {
        self.address.clone()
    }

    pub fn commands(&self) -> Vec<String> {
        self.journal.commands.lock().clone()
    }

    pub fn deliveries(&self) -> Vec<Delivery> {
        self.journal.deliveries.lock().clone()
    }

    /// How many client connections have ended, for whatever reason
    pub fn closed_connections(&self) -> usize {
        *self.journal.closed.lock()
    }
}

async fn handle_client<S>(socket: S, config: Arc<SinkConfig>, journal: Arc<Journal>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    converse(socket, &config, &journal).await;
    *journal.closed.lock() += 1;
}

async fn converse<S>(socket: S, config: &SinkConfig, journal: &Journal)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (reader, mut writer) = tokio::io::split(socket);
    let mut reader = BufReader::new(reader);
    let mut sender: Option<String> = None;
    let mut recipients: Vec<String> = vec![];

    macro_rules! reply {
        ($text:expr) => {
            if writer.write_all($text.as_bytes()).await.is_err() {
                return;
            }
        };
    }

    let greeting = if config.lmtp { "LMTP" } else { "ESMTP" };
    reply!(format!("220 sink.example.com {greeting} ready\r\n"));

    loop {
        let mut line = String::new();
        match reader.read_line(&mut line).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
        let line = line.trim_end().to_string();
        journal.commands.lock().push(line.clone());

        let (verb, args) = line.split_once(' ').unwrap_or((line.as_str(), ""));
        match verb.to_ascii_uppercase().as_str() {
            "EHLO" | "LHLO" => {
                reply!("250-sink.example.com\r\n250-AUTH PLAIN\r\n250-8BITMIME\r\n250 PIPELINING\r\n");
            }
            "AUTH" => {
                let payload = args.split_whitespace().nth(1).unwrap_or("");
                let decoded = BASE64.decode(payload.as_bytes()).unwrap_or_default();
                let fields: Vec<&[u8]> = decoded.split(|&b| b == 0).collect();
                if fields.len() == 3 && fields[2] == config.password.as_bytes() {
                    reply!("235 2.7.0 Authentication successful\r\n");
                } else {
                    reply!("535 5.7.8 Authentication credentials invalid\r\n");
                }
            }
            "MAIL" => {
                let addr = angle_addr(&args[args.find(':').map(|i| i + 1).unwrap_or(0)..]);
                if local_part(&addr) == "mailfail" {
                    reply!("550 5.1.0 Sender refused\r\n");
                } else {
                    sender.replace(addr);
                    recipients.clear();
                    reply!("250 2.1.0 OK\r\n");
                }
            }
            "RCPT" => {
                let addr = angle_addr(&args[args.find(':').map(|i| i + 1).unwrap_or(0)..]);
                if sender.is_none() {
                    reply!("503 5.5.1 need MAIL first\r\n");
                } else if local_part(&addr).starts_with("reject") {
                    reply!("550 5.1.1 No such user\r\n");
                } else {
                    recipients.push(addr);
                    reply!("250 2.1.5 OK\r\n");
                }
            }
            "DATA" => {
                if recipients.is_empty() {
                    reply!("503 5.5.1 need RCPT first\r\n");
                    continue;
                }
                reply!("354 Start mail input; end with <CRLF>.<CRLF>\r\n");

                let mut body = vec![];
                loop {
                    let mut data = vec![];
                    match reader.read_until(b'\n', &mut data).await {
                        Ok(0) | Err(_) => return,
                        Ok(_) => {}
                    }
                    if data == b".\r\n" {
                        break;
                    }
                    let data = data.strip_prefix(b".").unwrap_or(&data);
                    body.extend_from_slice(data);
                }

                let from = sender.take().unwrap_or_default();
                let rcpts = std::mem::take(&mut recipients);

                if config.lmtp {
                    for rcpt in &rcpts {
                        if local_part(rcpt) == "lmtpfail" {
                            reply!(format!("452 4.2.2 <{rcpt}> Mailbox full\r\n"));
                        } else {
                            reply!(format!("250 2.0.0 <{rcpt}> Delivered\r\n"));
                        }
                    }
                } else if local_part(&from) == "datafail" {
                    reply!("554 5.7.1 Message refused\r\n");
                    continue;
                } else {
                    reply!("250 2.0.0 Queued\r\n");
                }

                journal.deliveries.lock().push(Delivery {
                    sender: from,
                    recipients: rcpts,
                    body,
                });
            }
            "RSET" => {
                sender.take();
                recipients.clear();
                reply!("250 2.0.0 OK\r\n");
            }
            "NOOP" => {
                reply!("250 2.0.0 OK\r\n");
            }
            "QUIT" => {
                reply!("221 2.0.0 Bye\r\n");
                return;
            }
            _ => {
                reply!("502 5.5.2 Command not recognized\r\n");
            }
        }
    }
}
