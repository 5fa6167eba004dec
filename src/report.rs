//! Summary report delivery.
//!
//! The report is a MIME multipart email carrying the result artifact as a base64
//! attachment, sent over SMTP (EHLO, STARTTLS or implicit TLS, optional AUTH PLAIN,
//! MAIL FROM, RCPT TO, DATA). It is sent once per run, at shutdown.
//!
//! Credentials only ever travel inside TLS. A plaintext connection with a username
//! and password configured fails before anything is sent.

use anyhow::{anyhow, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::Utc;
use rustls::pki_types::ServerName;
use serde::Deserialize;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::error::PipelineError;

pub const REPORT_SUBJECT: &str = "Face Recognition Summary Report";
pub const REPORT_BODY: &str = "Please find the attached Face Recognition Summary Report";
pub const DEFAULT_SMTP_TIMEOUT: Duration = Duration::from_secs(30);

const BASE64_LINE: usize = 76;
const MAX_REPLY_LINES: usize = 64;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EmailMessage {
    pub sender: String,
    pub receiver: String,
    pub subject: String,
    pub body: String,
    pub attachment: Option<PathBuf>,
}

impl EmailMessage {
    /// The end-of-run report with the result artifact attached.
    pub fn summary_report(sender: &str, receiver: &str, attachment: PathBuf) -> Self {
        Self {
            sender: sender.to_string(),
            receiver: receiver.to_string(),
            subject: REPORT_SUBJECT.to_string(),
            body: REPORT_BODY.to_string(),
            attachment: Some(attachment),
        }
    }

    /// Render as RFC 5322 text with CRLF line endings. Reads the attachment.
    pub fn to_mime(&self, boundary: &str) -> Result<String> {
        let mut out = String::new();
        push_line(&mut out, &format!("From: {}", self.sender));
        push_line(&mut out, &format!("To: {}", self.receiver));
        push_line(&mut out, &format!("Subject: {}", self.subject));
        push_line(&mut out, &format!("Date: {}", Utc::now().to_rfc2822()));
        push_line(&mut out, "MIME-Version: 1.0");
        push_line(
            &mut out,
            &format!("Content-Type: multipart/mixed; boundary=\"{}\"", boundary),
        );
        push_line(&mut out, "");

        push_line(&mut out, &format!("--{}", boundary));
        push_line(&mut out, "Content-Type: text/plain; charset=utf-8");
        push_line(&mut out, "Content-Transfer-Encoding: 8bit");
        push_line(&mut out, "");
        for line in self.body.lines() {
            push_line(&mut out, line);
        }

        if let Some(path) = &self.attachment {
            let bytes = std::fs::read(path)
                .with_context(|| format!("failed to read attachment {}", path.display()))?;
            let filename = attachment_name(path);
            push_line(&mut out, &format!("--{}", boundary));
            push_line(
                &mut out,
                &format!("Content-Type: {}; name=\"{}\"", content_type(path), filename),
            );
            push_line(&mut out, "Content-Transfer-Encoding: base64");
            push_line(
                &mut out,
                &format!("Content-Disposition: attachment; filename=\"{}\"", filename),
            );
            push_line(&mut out, "");
            let encoded = BASE64.encode(bytes);
            for chunk in encoded.as_bytes().chunks(BASE64_LINE) {
                push_line(&mut out, &String::from_utf8_lossy(chunk));
            }
        }

        push_line(&mut out, &format!("--{}--", boundary));
        Ok(out)
    }
}

fn push_line(out: &mut String, line: &str) {
    out.push_str(line);
    out.push_str("\r\n");
}

fn attachment_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().replace('"', ""))
        .unwrap_or_else(|| "report".to_string())
}

fn content_type(path: &Path) -> &'static str {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("csv") => "text/csv",
        _ => "application/octet-stream",
    }
}

/// Lines starting with `.` get an extra `.` so the server doesn't read them as
/// the end of DATA.
fn dot_stuff(message: &str) -> String {
    let mut out = String::with_capacity(message.len() + 16);
    for line in message.split_inclusive("\r\n") {
        if line.starts_with('.') {
            out.push('.');
        }
        out.push_str(line);
    }
    out
}

/// Sends a report somewhere.
pub trait Mailer: Send {
    fn send(&mut self, message: &EmailMessage) -> Result<(), PipelineError>;
}

/// How the SMTP connection is protected.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
pub enum SmtpSecurity {
    /// Connect in the clear, then upgrade with STARTTLS before anything else (port 587).
    #[default]
    #[serde(rename = "starttls")]
    StartTls,
    /// TLS from the first byte (port 465).
    #[serde(rename = "tls")]
    Tls,
    /// No encryption. Credentials are never sent over such a connection.
    #[serde(rename = "none")]
    Plaintext,
}

#[derive(Clone, PartialEq, Eq)]
pub struct SmtpConfig {
    /// `host:port` of the SMTP server.
    pub addr: String,
    pub helo: String,
    pub security: SmtpSecurity,
    pub username: Option<String>,
    pub password: Option<String>,
    pub timeout: Duration,
}

impl SmtpConfig {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            helo: "facewatch".to_string(),
            security: SmtpSecurity::default(),
            username: None,
            password: None,
            timeout: DEFAULT_SMTP_TIMEOUT,
        }
    }

    fn credentials(&self) -> Option<(&str, &str)> {
        match (&self.username, &self.password) {
            (Some(username), Some(password)) => Some((username, password)),
            _ => None,
        }
    }

    /// Host part of `addr`, used as the TLS server name.
    fn host(&self) -> &str {
        let host = match self.addr.rsplit_once(':') {
            Some((host, port)) if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) => {
                host
            }
            _ => self.addr.as_str(),
        };
        host.trim_start_matches('[').trim_end_matches(']')
    }
}

impl std::fmt::Debug for SmtpConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmtpConfig")
            .field("addr", &self.addr)
            .field("helo", &self.helo)
            .field("security", &self.security)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("timeout", &self.timeout)
            .finish()
    }
}

type TlsStream = rustls::StreamOwned<rustls::ClientConnection, TcpStream>;

pub struct SmtpMailer {
    config: SmtpConfig,
}

impl SmtpMailer {
    pub fn new(config: SmtpConfig) -> Self {
        Self { config }
    }

    fn deliver(&self, message: &EmailMessage) -> Result<()> {
        if self.config.credentials().is_some() && self.config.security == SmtpSecurity::Plaintext {
            return Err(anyhow!(
                "refusing to send smtp credentials over an unencrypted connection"
            ));
        }

        let boundary = format!(
            "facewatch-{}-{}",
            std::process::id(),
            Utc::now().timestamp_nanos_opt().unwrap_or_default()
        );
        let mime = message.to_mime(&boundary)?;

        let stream = self.connect()?;
        match self.config.security {
            SmtpSecurity::Plaintext => {
                let mut session = SmtpSession::new(stream);
                session.expect(&[220])?;
                let capabilities = session.ehlo(&self.config.helo)?;
                self.transact(session, &capabilities, false, message, &mime)
            }
            SmtpSecurity::Tls => {
                let mut session = SmtpSession::new(self.start_tls(stream)?);
                session.expect(&[220])?;
                let capabilities = session.ehlo(&self.config.helo)?;
                self.transact(session, &capabilities, true, message, &mime)
            }
            SmtpSecurity::StartTls => {
                let mut session = SmtpSession::new(stream);
                session.expect(&[220])?;
                let capabilities = session.ehlo(&self.config.helo)?;
                if !capabilities.has("STARTTLS") {
                    return Err(anyhow!(
                        "smtp server {} does not offer STARTTLS",
                        self.config.addr
                    ));
                }
                session.command("STARTTLS", &[220])?;
                let stream = session.into_inner()?;

                // Capabilities from before the upgrade are discarded (RFC 3207).
                let mut session = SmtpSession::new(self.start_tls(stream)?);
                let capabilities = session.ehlo(&self.config.helo)?;
                self.transact(session, &capabilities, true, message, &mime)
            }
        }
    }

    fn connect(&self) -> Result<TcpStream> {
        let addr = self
            .config
            .addr
            .to_socket_addrs()
            .with_context(|| format!("resolve smtp server {}", self.config.addr))?
            .next()
            .ok_or_else(|| anyhow!("smtp server {} did not resolve", self.config.addr))?;
        let stream = TcpStream::connect_timeout(&addr, self.config.timeout)
            .with_context(|| format!("connect to smtp server {}", self.config.addr))?;
        stream.set_read_timeout(Some(self.config.timeout))?;
        stream.set_write_timeout(Some(self.config.timeout))?;
        Ok(stream)
    }

    /// Client side of a TLS session, verified against the webpki root set.
    /// The handshake runs on the first read or write.
    fn start_tls(&self, stream: TcpStream) -> Result<TlsStream> {
        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let config = rustls::ClientConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .context("configure smtp tls")?
        .with_root_certificates(roots)
        .with_no_client_auth();

        let host = self.config.host();
        let server_name = ServerName::try_from(host.to_string())
            .map_err(|_| anyhow!("invalid smtp server name '{}'", host))?;
        let connection = rustls::ClientConnection::new(Arc::new(config), server_name)
            .context("start smtp tls session")?;
        Ok(rustls::StreamOwned::new(connection, stream))
    }

    fn transact<S: Read + Write>(
        &self,
        mut session: SmtpSession<S>,
        capabilities: &Capabilities,
        encrypted: bool,
        message: &EmailMessage,
        mime: &str,
    ) -> Result<()> {
        if let Some((username, password)) = self.config.credentials() {
            if !encrypted {
                return Err(anyhow!(
                    "refusing to send smtp credentials over an unencrypted connection"
                ));
            }
            if !capabilities.auth_mechanism("PLAIN") {
                return Err(anyhow!(
                    "smtp server {} does not offer AUTH PLAIN",
                    self.config.addr
                ));
            }
            let token = BASE64.encode(format!("\0{}\0{}", username, password));
            session.command(&format!("AUTH PLAIN {}", token), &[235])?;
        }

        session.command(&format!("MAIL FROM:<{}>", message.sender), &[250])?;
        session.command(&format!("RCPT TO:<{}>", message.receiver), &[250, 251])?;
        session.command("DATA", &[354])?;

        session.write_raw(dot_stuff(mime).as_bytes())?;
        session.command(".", &[250])?;

        // The message is accepted at this point; a failed QUIT is not a send failure.
        if let Err(err) = session.command("QUIT", &[221]) {
            log::debug!("smtp QUIT failed: {:#}", err);
        }
        Ok(())
    }
}

impl Mailer for SmtpMailer {
    fn send(&mut self, message: &EmailMessage) -> Result<(), PipelineError> {
        self.deliver(message)
            .map_err(|err| PipelineError::SendFailed(format!("{:#}", err)))
    }
}

/// EHLO keywords, upper-cased, greeting line excluded.
#[derive(Debug)]
struct Capabilities {
    keywords: Vec<String>,
}

impl Capabilities {
    fn parse(ehlo_reply: &str) -> Self {
        Self {
            keywords: ehlo_reply
                .lines()
                .skip(1)
                .map(|line| line.trim().to_ascii_uppercase())
                .filter(|line| !line.is_empty())
                .collect(),
        }
    }

    fn has(&self, keyword: &str) -> bool {
        self.keywords
            .iter()
            .any(|line| line.split_whitespace().next() == Some(keyword))
    }

    fn auth_mechanism(&self, mechanism: &str) -> bool {
        self.keywords.iter().any(|line| {
            let mut words = line.split_whitespace();
            words.next() == Some("AUTH") && words.any(|word| word == mechanism)
        })
    }
}

struct SmtpSession<S: Read + Write> {
    stream: BufReader<S>,
}

impl<S: Read + Write> SmtpSession<S> {
    fn new(stream: S) -> Self {
        Self {
            stream: BufReader::new(stream),
        }
    }

    /// Give back the transport for a TLS upgrade.
    fn into_inner(self) -> Result<S> {
        if !self.stream.buffer().is_empty() {
            return Err(anyhow!("smtp server sent data ahead of the TLS handshake"));
        }
        Ok(self.stream.into_inner())
    }

    fn ehlo(&mut self, helo: &str) -> Result<Capabilities> {
        let reply = self.command(&format!("EHLO {}", helo), &[250])?;
        Ok(Capabilities::parse(&reply))
    }

    fn write_raw(&mut self, bytes: &[u8]) -> Result<()> {
        let writer = self.stream.get_mut();
        writer.write_all(bytes)?;
        writer.flush()?;
        Ok(())
    }

    fn command(&mut self, line: &str, accepted: &[u16]) -> Result<String> {
        let writer = self.stream.get_mut();
        writer.write_all(line.as_bytes())?;
        writer.write_all(b"\r\n")?;
        writer.flush()?;
        let verb = line.split_whitespace().next().unwrap_or(line);
        self.expect(accepted)
            .with_context(|| format!("smtp {} rejected", verb))
    }

    /// Read one (possibly multi-line) reply and check its code.
    fn expect(&mut self, accepted: &[u16]) -> Result<String> {
        let mut text = String::new();
        for _ in 0..MAX_REPLY_LINES {
            let mut line = String::new();
            if self.stream.read_line(&mut line)? == 0 {
                return Err(anyhow!("smtp server closed the connection"));
            }
            let line = line.trim_end();
            let code: u16 = line
                .get(..3)
                .and_then(|c| c.parse().ok())
                .ok_or_else(|| anyhow!("malformed smtp reply: {}", line))?;
            text.push_str(line.get(4..).unwrap_or(""));
            text.push('\n');
            if line.as_bytes().get(3) == Some(&b'-') {
                continue;
            }
            if accepted.contains(&code) {
                return Ok(text);
            }
            return Err(anyhow!("unexpected smtp reply {}: {}", code, text.trim_end()));
        }
        Err(anyhow!("smtp reply too long"))
    }
}
