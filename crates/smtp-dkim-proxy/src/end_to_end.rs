//! Drive the proxy with a real SMTP client, relaying into sink servers
use crate::config::ProxyConfig;
use crate::dkim::test::verify;
use crate::server::Listener;
use crate::sink::{SinkConfig, SinkServer};
use crate::vhost::test::test_config;
use crate::vhost::Registry;
use data_encoding::BASE64;
use k9::assert_equal;
use mail_auth::DkimResult;
use rfc5321::{ForwardPath, ReversePath, SmtpClient, SmtpClientTimeouts};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

async fn start_proxy(mut config: ProxyConfig) -> SocketAddr {
    config.listen = Some("127.0.0.1:0".to_string());
    let registry = Registry::from_config(&config).await.unwrap();
    let listener = Listener::bind(&config, Arc::new(registry)).await.unwrap();
    let (addr, _handle) = listener.start().unwrap();
    addr
}

async fn login(proxy: SocketAddr, identity: &str, password: &str) -> SmtpClient {
    let mut client = SmtpClient::new(
        proxy.to_string(),
        SmtpClientTimeouts::uniform(Duration::from_secs(10)),
    )
    .await
    .unwrap();
    client.read_greeting().await.unwrap();
    let caps = client.ehlo("client.example.org").await.unwrap();
    assert!(caps.contains_key("AUTH"));
    client.auth_plain(identity, Some(password)).await.unwrap();
    client
}

fn message(from: &str, subject: &str) -> Vec<u8> {
    format!(
        "From: <{from}>\r\nTo: <bob@example.org>\r\nSubject: {subject}\r\n\
         Date: Fri, 1 Jan 2021 00:00:01 +0000\r\nMessage-ID: <{subject}@example>\r\n\r\n\
         Hello\r\n.leading dot\r\n"
    )
    .into_bytes()
}

/// A raw client for exercising exchanges that SmtpClient doesn't speak
struct RawClient {
    reader: BufReader<tokio::net::tcp::OwnedReadHalf>,
    writer: tokio::net::tcp::OwnedWriteHalf,
}

impl RawClient {
    async fn connect(proxy: SocketAddr) -> Self {
        let (reader, writer) = TcpStream::connect(proxy).await.unwrap().into_split();
        let mut client = Self {
            reader: BufReader::new(reader),
            writer,
        };
        assert!(client.response().await.starts_with("220 "));
        client
    }

    /// Read a complete, possibly multi-line, response
    async fn response(&mut self) -> String {
        let mut text = String::new();
        loop {
            let mut line = String::new();
            let size = self.reader.read_line(&mut line).await.unwrap();
            assert!(size > 0, "connection closed; got {text:?} so far");
            text.push_str(&line);
            if line.as_bytes().get(3) != Some(&b'-') {
                return text;
            }
        }
    }

    async fn command(&mut self, line: &str) -> String {
        self.writer
            .write_all(format!("{line}\r\n").as_bytes())
            .await
            .unwrap();
        self.response().await
    }
}

#[tokio::test]
async fn signed_relay() {
    let sink = SinkServer::start(SinkConfig::default()).await;
    let proxy = start_proxy(test_config(&[("example.com", sink.address())])).await;

    let mut client = login(proxy, "alice@example.com", "secret").await;
    client
        .mail_from(&ReversePath::try_from("alice@example.com").unwrap(), &[])
        .await
        .unwrap();
    client
        .rcpt_to(&ForwardPath::try_from("bob@example.org").unwrap(), &[])
        .await
        .unwrap();
    let body = message("alice@example.com", "greetings");
    let response = client.send_data_stream(body.as_slice()).await.unwrap();
    // The upstream response is relayed verbatim
    assert_equal!(response.code, 250);
    assert_equal!(response.content, "Queued");
    client.quit().await.unwrap();

    let deliveries = sink.deliveries();
    assert_equal!(deliveries.len(), 1);
    let delivery = &deliveries[0];
    assert_equal!(delivery.sender, "alice@example.com");
    assert_equal!(delivery.recipients, vec!["bob@example.org".to_string()]);

    let text = String::from_utf8(delivery.body.clone()).unwrap();
    assert!(text.starts_with("Received: by mx.example.com (smtp-dkim-proxy) with ESMTPSA id "));
    let signature = text.find("\r\nDKIM-Signature: ").unwrap();
    assert!(text[signature..].contains("d=example.com"));
    assert!(delivery.body.ends_with(&body));
    assert_equal!(
        verify("example.com", &delivery.body).await,
        vec![DkimResult::Pass]
    );

    // Authenticated with the caller's credentials, then logged out
    let commands = sink.commands();
    assert!(commands.iter().any(|c| c.starts_with("AUTH PLAIN ")));
    assert_equal!(commands.last().map(|c| c.as_str()), Some("QUIT"));
}

#[tokio::test]
async fn domains_are_isolated() {
    let sink_a = SinkServer::start(SinkConfig::default()).await;
    let sink_b = SinkServer::start(SinkConfig::default()).await;
    let proxy = start_proxy(test_config(&[
        ("example.com", sink_a.address()),
        ("example.net", sink_b.address()),
    ]))
    .await;

    async fn send(proxy: SocketAddr, domain: &str, count: usize) {
        let sender = format!("user@{domain}");
        let mut client = login(proxy, &sender, "secret").await;
        for n in 0..count {
            client
                .mail_from(&ReversePath::try_from(sender.as_str()).unwrap(), &[])
                .await
                .unwrap();
            client
                .rcpt_to(&ForwardPath::try_from("bob@example.org").unwrap(), &[])
                .await
                .unwrap();
            let body = message(&sender, &format!("{domain}-{n}"));
            let response = client.send_data_stream(body.as_slice()).await.unwrap();
            assert_equal!(response.code, 250);
        }
        client.quit().await.unwrap();
    }

    tokio::join!(send(proxy, "example.com", 3), send(proxy, "example.net", 3));

    for (sink, domain) in [(&sink_a, "example.com"), (&sink_b, "example.net")] {
        let deliveries = sink.deliveries();
        assert_equal!(deliveries.len(), 3);
        for (n, delivery) in deliveries.iter().enumerate() {
            assert_equal!(delivery.sender, format!("user@{domain}"));
            let text = String::from_utf8_lossy(&delivery.body);
            assert!(text.contains(&format!("Subject: {domain}-{n}\r\n")));
            assert!(text.contains(&format!("d={domain};")));
            assert_equal!(verify(domain, &delivery.body).await, vec![DkimResult::Pass]);
        }
    }
}

#[tokio::test]
async fn authentication_failures_are_indistinguishable() {
    let sink = SinkServer::start(SinkConfig::default()).await;
    let proxy = start_proxy(test_config(&[("example.com", sink.address())])).await;

    let mut replies = vec![];
    for (identity, password) in [
        ("alice@unknown.example", "secret"),
        ("alice@example.com", "wrong"),
        ("alice", "secret"),
    ] {
        let mut client = RawClient::connect(proxy).await;
        client.command("EHLO client.example.org").await;
        let payload = BASE64.encode(format!("\0{identity}\0{password}").as_bytes());
        replies.push(client.command(&format!("AUTH PLAIN {payload}")).await);

        // Still unauthenticated
        let reply = client.command("MAIL FROM:<alice@example.com>").await;
        assert_equal!(reply, "530 5.7.0 Authentication required\r\n");
    }

    for reply in replies {
        assert_equal!(reply, "535 5.7.8 Authentication credentials invalid\r\n");
    }
}

#[tokio::test]
async fn auth_login_and_cancellation() {
    let sink = SinkServer::start(SinkConfig::default()).await;
    let proxy = start_proxy(test_config(&[("example.com", sink.address())])).await;

    let mut client = RawClient::connect(proxy).await;
    assert_equal!(
        client.command("AUTH LOGIN").await,
        "503 5.5.1 Send EHLO first\r\n"
    );
    let ehlo = client.command("EHLO client.example.org").await;
    assert!(ehlo.contains("250-AUTH PLAIN LOGIN\r\n") || ehlo.contains("250 AUTH PLAIN LOGIN\r\n"));

    assert_equal!(client.command("AUTH LOGIN").await, "334 VXNlcm5hbWU6\r\n");
    assert_equal!(
        client.command("*").await,
        "501 5.0.0 Authentication cancelled\r\n"
    );

    assert_equal!(client.command("AUTH CRAM-MD5").await, "504 5.5.4 Unrecognized authentication type\r\n");

    assert_equal!(client.command("AUTH LOGIN").await, "334 VXNlcm5hbWU6\r\n");
    assert_equal!(
        client.command(&BASE64.encode(b"alice@example.com")).await,
        "334 UGFzc3dvcmQ6\r\n"
    );
    assert_equal!(
        client.command(&BASE64.encode(b"secret")).await,
        "235 2.7.0 Authentication successful\r\n"
    );
    assert_equal!(
        client.command("AUTH PLAIN").await,
        "503 5.5.1 Already authenticated\r\n"
    );
    assert_equal!(client.command("QUIT").await, "221 2.0.0 Bye\r\n");
}

#[tokio::test]
async fn plaintext_auth_can_be_refused() {
    let sink = SinkServer::start(SinkConfig::default()).await;
    let mut config = test_config(&[("example.com", sink.address())]);
    config.allow_insecure_auth = Some(false);
    let proxy = start_proxy(config).await;

    let mut client = RawClient::connect(proxy).await;
    let ehlo = client.command("EHLO client.example.org").await;
    assert!(!ehlo.contains("AUTH"));
    assert_equal!(
        client.command("AUTH PLAIN").await,
        "523 5.7.10 Encryption required for requested authentication mechanism\r\n"
    );
}

#[tokio::test]
async fn envelope_limits() {
    let sink = SinkServer::start(SinkConfig::default()).await;
    let mut config = test_config(&[("example.com", sink.address())]);
    config.max_recipients = 2;
    config.max_message_bytes = 100;
    let proxy = start_proxy(config).await;

    let mut client = RawClient::connect(proxy).await;
    client.command("EHLO client.example.org").await;
    let payload = BASE64.encode(b"\0alice@example.com\0secret");
    client.command(&format!("AUTH PLAIN {payload}")).await;

    assert_equal!(
        client.command("MAIL FROM:<alice@example.com> SIZE=1000").await,
        "552 5.3.4 Message size exceeds fixed maximum message size\r\n"
    );
    assert_equal!(
        client.command("MAIL FROM:<alice@example.com> SIZE=50").await,
        "250 2.1.0 OK\r\n"
    );
    // SIZE is not relayed
    assert!(sink
        .commands()
        .iter()
        .any(|c| c == "MAIL FROM:<alice@example.com>"));

    assert_equal!(client.command("RCPT TO:<a@example.org>").await, "250 2.1.5 OK\r\n");
    assert!(client
        .command("RCPT TO:<reject@example.org>")
        .await
        .starts_with("550 5.1.1 "));
    assert_equal!(client.command("RCPT TO:<b@example.org>").await, "250 2.1.5 OK\r\n");
    assert_equal!(
        client.command("RCPT TO:<c@example.org>").await,
        "452 4.5.3 Too many recipients\r\n"
    );

    assert!(client.command("DATA").await.starts_with("354 "));
    let mut body = String::from("Subject: big\r\n\r\n");
    for _ in 0..10 {
        body.push_str("0123456789abcdef\r\n");
    }
    body.push_str(".");
    assert_equal!(
        client.command(&body).await,
        "552 5.3.4 Message size exceeds fixed maximum message size\r\n"
    );
    assert!(sink.deliveries().is_empty());

    // The envelope was reset; the connection remains usable
    assert_equal!(
        client.command("RCPT TO:<a@example.org>").await,
        "503 5.5.1 Bad sequence of commands: need MAIL before RCPT\r\n"
    );
    assert_equal!(
        client.command("MAIL FROM:<alice@example.com>").await,
        "250 2.1.0 OK\r\n"
    );
    client.command("RCPT TO:<a@example.org>").await;
    assert!(client.command("DATA").await.starts_with("354 "));
    assert_equal!(
        client.command("Subject: small\r\n\r\nok\r\n.").await,
        "250 2.0.0 Queued\r\n"
    );
    assert_equal!(sink.deliveries().len(), 1);
}

#[tokio::test]
async fn upstream_rejection_is_relayed() {
    let sink = SinkServer::start(SinkConfig::default()).await;
    let proxy = start_proxy(test_config(&[("example.com", sink.address())])).await;

    let mut client = RawClient::connect(proxy).await;
    client.command("EHLO client.example.org").await;
    let payload = BASE64.encode(b"\0datafail@example.com\0secret");
    client.command(&format!("AUTH PLAIN {payload}")).await;
    assert_equal!(
        client.command("MAIL FROM:<mailfail@example.com>").await,
        "550 5.1.0 Sender refused\r\n"
    );
    client.command("MAIL FROM:<datafail@example.com>").await;
    client.command("RCPT TO:<a@example.org>").await;
    client.command("DATA").await;
    assert_equal!(
        client.command("Subject: x\r\n\r\nx\r\n.").await,
        "554 5.7.1 Message refused\r\n"
    );
    assert_equal!(client.command("NOOP").await, "250 2.0.0 OK\r\n");
    assert_equal!(client.command("RSET").await, "250 2.0.0 OK\r\n");
}

#[tokio::test]
async fn idle_clients_are_disconnected() {
    let sink = SinkServer::start(SinkConfig::default()).await;
    let mut config = test_config(&[("example.com", sink.address())]);
    config.idle_timeout = Duration::from_millis(200);
    let proxy = start_proxy(config).await;

    let mut client = RawClient::connect(proxy).await;
    client.command("EHLO client.example.org").await;
    let payload = BASE64.encode(b"\0alice@example.com\0secret");
    client.command(&format!("AUTH PLAIN {payload}")).await;
    assert_equal!(
        client.response().await,
        "421 4.4.2 Idle timeout, closing connection\r\n"
    );

    // Give the proxy a moment to close its upstream connection
    for _ in 0..50 {
        if sink.commands().last().map(|c| c.as_str()) == Some("QUIT") {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_equal!(sink.commands().last().map(|c| c.as_str()), Some("QUIT"));
}

#[tokio::test]
async fn client_vanishing_mid_body_delivers_nothing() {
    let sink = SinkServer::start(SinkConfig::default()).await;
    let proxy = start_proxy(test_config(&[("example.com", sink.address())])).await;

    let mut client = RawClient::connect(proxy).await;
    client.command("EHLO client.example.org").await;
    let payload = BASE64.encode(b"\0alice@example.com\0secret");
    assert!(client
        .command(&format!("AUTH PLAIN {payload}"))
        .await
        .starts_with("235 "));
    let closed = sink.closed_connections();
    client.command("MAIL FROM:<alice@example.com>").await;
    client.command("RCPT TO:<bob@example.org>").await;
    assert!(client.command("DATA").await.starts_with("354 "));
    client
        .writer
        .write_all(b"Subject: partial\r\n\r\nthe first line\r\nand the second")
        .await
        .unwrap();
    client.writer.flush().await.unwrap();
    drop(client);

    for _ in 0..100 {
        if sink.closed_connections() > closed {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_equal!(sink.closed_connections(), closed + 1);
    assert!(sink.deliveries().is_empty());

    // Torn down without a message transfer or a polite QUIT
    let commands = sink.commands();
    assert!(!commands.iter().any(|c| c == "DATA" || c == "QUIT"));
}
