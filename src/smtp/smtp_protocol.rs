//! SMTP conversation state machine.
//!
//! One `SmtpProtocol` drives a single client connection: it reads command
//! lines, tracks the session state, accumulates the DATA payload, and
//! writes replies. Replies that depend on work outside the protocol are
//! left to the caller and signalled through `SmtpCommandResult` — the
//! final `250 Ok: queued as <id>` can only be written once the store
//! insert has succeeded.

use std::sync::Arc;

use anyhow::Result;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use log::{debug, trace};
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter, ReadBuf,
};
use tokio::net::TcpStream;

use crate::auth::{AuthRequest, CredentialVerifier};
use crate::message::{Envelope, Message, Path};

/// Maximum accepted line length in octets, excluding CRLF (RFC 5321
/// §4.5.3.1.6). Longer lines draw a 500 but do not end the session.
pub const MAX_LINE_LENGTH: usize = 1000;

/// A connection that may have been upgraded to TLS in place.
pub enum AnyStream {
    Plain(TcpStream),
    Tls(tokio_rustls::server::TlsStream<TcpStream>),
}

impl AsyncRead for AnyStream {
    fn poll_read(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        match &mut *self {
            AnyStream::Plain(s) => std::pin::Pin::new(s).poll_read(cx, buf),
            AnyStream::Tls(s) => std::pin::Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for AnyStream {
    fn poll_write(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        data: &[u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
        match &mut *self {
            AnyStream::Plain(s) => std::pin::Pin::new(s).poll_write(cx, data),
            AnyStream::Tls(s) => std::pin::Pin::new(s).poll_write(cx, data),
        }
    }

    fn poll_flush(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        match &mut *self {
            AnyStream::Plain(s) => std::pin::Pin::new(s).poll_flush(cx),
            AnyStream::Tls(s) => std::pin::Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        match &mut *self {
            AnyStream::Plain(s) => std::pin::Pin::new(s).poll_shutdown(cx),
            AnyStream::Tls(s) => std::pin::Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// States of an SMTP conversation.
#[derive(Debug, Clone, PartialEq)]
pub enum SmtpState {
    /// Terminal error state; the connection is being torn down.
    Invalid,
    /// Connected, greeting sent, awaiting HELO/EHLO.
    Establish,
    /// Greeted; a transaction may begin.
    Greeted,
    /// Reverse-path accepted, awaiting RCPT TO.
    Mail,
    /// At least one forward-path accepted; more RCPT or DATA may follow.
    Rcpt,
    /// Accumulating message payload until the lone-dot terminator.
    Data,
    /// QUIT acknowledged; the connection closes.
    Quit,
    /// Awaiting the base64 PLAIN credential payload.
    AuthPlain,
    /// Awaiting the LOGIN username, then the password.
    AuthLogin { username: Option<String> },
    /// Awaiting the CRAM-MD5 response to the issued challenge.
    AuthCramMd5 { challenge: String },
    /// 220 sent; the caller is upgrading the socket to TLS.
    StartTls,
}

/// Outcome of processing one command line.
#[derive(Debug)]
pub enum SmtpCommandResult {
    /// Reply written (if any); read the next line.
    Continue,
    /// QUIT acknowledged; close the connection.
    Quit,
    /// `220 Ready to start TLS` written; the caller must perform the TLS
    /// handshake on the underlying socket and build a fresh protocol.
    StartTls,
    /// DATA terminator received and the message assembled. The caller
    /// inserts it into the store and then confirms with
    /// `250 Ok: queued as <id>`; the client never sees a 250 for a
    /// message that is not retrievable.
    Received(Box<Message>),
}

/// Envelope under construction across MAIL/RCPT/DATA. Parsed paths and
/// the raw argument text are carried side by side so the stored message
/// can preserve the wire form.
#[derive(Default)]
struct EnvelopeBuilder {
    helo: String,
    from: Option<(Path, String)>,
    to: Vec<(Path, String)>,
    data: String,
}

impl EnvelopeBuilder {
    /// Clears the transaction but keeps the recorded helo.
    fn reset(&mut self) {
        self.from = None;
        self.to.clear();
        self.data.clear();
    }
}

/// State machine and buffered I/O for one SMTP connection.
pub struct SmtpProtocol {
    reader: BufReader<tokio::io::ReadHalf<AnyStream>>,
    writer: BufWriter<tokio::io::WriteHalf<AnyStream>>,
    state: SmtpState,
    envelope: EnvelopeBuilder,
    hostname: String,
    verifier: Arc<dyn CredentialVerifier>,
    starttls_available: bool,
    tls_active: bool,
}

impl SmtpProtocol {
    pub fn new(
        stream: AnyStream,
        hostname: String,
        verifier: Arc<dyn CredentialVerifier>,
        starttls_available: bool,
        tls_active: bool,
    ) -> Self {
        let (reader, writer) = tokio::io::split(stream);

        SmtpProtocol {
            reader: BufReader::new(reader),
            writer: BufWriter::new(writer),
            state: SmtpState::Establish,
            envelope: EnvelopeBuilder::default(),
            hostname,
            verifier,
            starttls_available,
            tls_active,
        }
    }

    /// Sends the `220` service-ready banner. Call once, right after the
    /// connection (or TLS upgrade) is established.
    pub async fn send_greeting(&mut self) -> Result<()> {
        let banner = format!("220 {} ESMTP", self.hostname);
        self.write_line(&banner).await
    }

    pub fn state(&self) -> &SmtpState {
        &self.state
    }

    /// Marks the session unusable. Set by the caller on timeout or fatal
    /// I/O error before dropping the connection.
    pub fn invalidate(&mut self) {
        self.state = SmtpState::Invalid;
    }

    /// Reunites the split halves, handing the raw stream back for a
    /// STARTTLS upgrade.
    pub fn into_stream(self) -> AnyStream {
        self.reader.into_inner().unsplit(self.writer.into_inner())
    }

    /// Reads one line, tolerating bare LF and stripping the terminator.
    /// Returns `None` at EOF. Invalid UTF-8 is replaced rather than
    /// rejected so 8-bit payloads survive capture.
    pub async fn read_line(&mut self) -> Result<Option<String>> {
        let mut buffer = Vec::new();
        let bytes_read = self.reader.read_until(b'\n', &mut buffer).await?;
        if bytes_read == 0 {
            return Ok(None);
        }

        let line = String::from_utf8_lossy(&buffer);
        let line = line.trim_end_matches(['\r', '\n']).to_string();
        trace!("SMTP read: {:?}", line);
        Ok(Some(line))
    }

    /// Writes a reply line, appending CRLF and flushing immediately.
    pub async fn write_line(&mut self, line: &str) -> Result<()> {
        trace!("SMTP write: {:?}", line);
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.write_all(b"\r\n").await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Processes one line from the client according to the current state.
    pub async fn process_command(&mut self, line: &str) -> Result<SmtpCommandResult> {
        debug!("SMTP({:?}): processing {:?}", self.state, line);

        if line.len() > MAX_LINE_LENGTH {
            self.write_line("500 Line too long").await?;
            return Ok(SmtpCommandResult::Continue);
        }

        match self.state.clone() {
            SmtpState::Data => self.process_data_line(line).await,
            SmtpState::AuthPlain => self.finish_auth_plain(line).await,
            SmtpState::AuthLogin { username } => self.process_auth_login(username, line).await,
            SmtpState::AuthCramMd5 { challenge } => {
                self.finish_auth_cram_md5(&challenge, line).await
            }
            _ => self.process_verb(line).await,
        }
    }

    async fn process_verb(&mut self, line: &str) -> Result<SmtpCommandResult> {
        let (verb, remainder) = match line.split_once(char::is_whitespace) {
            Some((verb, remainder)) => (verb.to_ascii_uppercase(), remainder.trim()),
            None => (line.to_ascii_uppercase(), ""),
        };

        match verb.as_str() {
            "HELO" => self.handle_helo(remainder, false).await,
            "EHLO" => self.handle_helo(remainder, true).await,
            "MAIL" => self.handle_mail(remainder).await,
            "RCPT" => self.handle_rcpt(remainder).await,
            "DATA" => self.handle_data().await,
            "RSET" => {
                self.envelope.reset();
                self.state = SmtpState::Greeted;
                self.write_line("250 Ok").await?;
                Ok(SmtpCommandResult::Continue)
            }
            "NOOP" => {
                self.write_line("250 Ok").await?;
                Ok(SmtpCommandResult::Continue)
            }
            "QUIT" => {
                self.state = SmtpState::Quit;
                self.write_line("221 Bye").await?;
                Ok(SmtpCommandResult::Quit)
            }
            "STARTTLS" => self.handle_starttls().await,
            "AUTH" => self.handle_auth(remainder).await,
            "VRFY" | "EXPN" | "HELP" | "TURN" => {
                self.write_line("502 Command not implemented").await?;
                Ok(SmtpCommandResult::Continue)
            }
            _ => {
                self.write_line("500 Unrecognised command").await?;
                Ok(SmtpCommandResult::Continue)
            }
        }
    }

    /// HELO/EHLO: record the client identity and (re)start the session.
    /// Accepted mid-transaction as well, discarding any envelope built so
    /// far, which is what a client expects after STARTTLS or AUTH.
    async fn handle_helo(&mut self, domain: &str, extended: bool) -> Result<SmtpCommandResult> {
        if domain.is_empty() {
            self.write_line("501 Domain argument required").await?;
            return Ok(SmtpCommandResult::Continue);
        }

        self.envelope.reset();
        self.envelope.helo = domain.to_string();
        self.state = SmtpState::Greeted;

        if extended {
            self.write_line(&format!("250-{}", self.hostname)).await?;
            self.write_line("250-PIPELINING").await?;
            self.write_line("250-8BITMIME").await?;
            self.write_line("250-AUTH PLAIN LOGIN CRAM-MD5").await?;
            if self.starttls_available && !self.tls_active {
                self.write_line("250-STARTTLS").await?;
            }
            self.write_line("250 SIZE 0").await?;
        } else {
            self.write_line(&format!("250 {}", self.hostname)).await?;
        }
        Ok(SmtpCommandResult::Continue)
    }

    async fn handle_mail(&mut self, remainder: &str) -> Result<SmtpCommandResult> {
        if self.state != SmtpState::Greeted {
            self.write_line("503 Bad sequence of commands").await?;
            return Ok(SmtpCommandResult::Continue);
        }

        let Some(argument) = strip_prefix_ignore_case(remainder, "FROM:") else {
            self.write_line("501 Syntax error in MAIL parameters").await?;
            return Ok(SmtpCommandResult::Continue);
        };

        let mut parts = argument.trim().split_whitespace();
        let addr_text = extract_address(parts.next().unwrap_or(""));
        for param in parts {
            // SIZE is advertised as 0 (no fixed limit) and BODY=8BITMIME
            // is implied by the capability list, so parameters are noted
            // and dropped.
            trace!("Ignoring MAIL parameter {:?}", param);
        }

        match Path::parse(&addr_text) {
            Ok(path) => {
                self.state = SmtpState::Mail;
                self.envelope.from = Some((path, addr_text.clone()));
                self.write_line(&format!("250 Sender {} ok", addr_text)).await?;
            }
            Err(e) => {
                debug!("Rejected MAIL FROM {:?}: {}", addr_text, e);
                self.write_line("501 Syntax error in MAIL parameters").await?;
            }
        }
        Ok(SmtpCommandResult::Continue)
    }

    async fn handle_rcpt(&mut self, remainder: &str) -> Result<SmtpCommandResult> {
        if !matches!(self.state, SmtpState::Mail | SmtpState::Rcpt) {
            self.write_line("503 Bad sequence of commands").await?;
            return Ok(SmtpCommandResult::Continue);
        }

        let Some(argument) = strip_prefix_ignore_case(remainder, "TO:") else {
            self.write_line("501 Syntax error in RCPT parameters").await?;
            return Ok(SmtpCommandResult::Continue);
        };

        let addr_text =
            extract_address(argument.trim().split_whitespace().next().unwrap_or(""));
        match Path::parse(&addr_text) {
            // The forward-path must name an actual mailbox; <> is only
            // meaningful as a reverse-path.
            Ok(path) if path.mailbox.is_some() => {
                self.state = SmtpState::Rcpt;
                self.envelope.to.push((path, addr_text.clone()));
                self.write_line(&format!("250 Recipient {} ok", addr_text)).await?;
            }
            _ => {
                debug!("Rejected RCPT TO {:?}", addr_text);
                self.write_line("501 Syntax error in RCPT parameters").await?;
            }
        }
        Ok(SmtpCommandResult::Continue)
    }

    async fn handle_data(&mut self) -> Result<SmtpCommandResult> {
        if self.state != SmtpState::Rcpt || self.envelope.to.is_empty() {
            self.write_line("503 Bad sequence of commands").await?;
            return Ok(SmtpCommandResult::Continue);
        }

        self.envelope.data.clear();
        self.state = SmtpState::Data;
        self.write_line("354 End data with <CR><LF>.<CR><LF>").await?;
        Ok(SmtpCommandResult::Continue)
    }

    /// One payload line. A lone dot finalizes the message; a leading
    /// doubled dot is collapsed back to one (dot-stuffing reversal).
    async fn process_data_line(&mut self, line: &str) -> Result<SmtpCommandResult> {
        if line == "." {
            let message = self.finalize_message();
            self.envelope.reset();
            self.state = SmtpState::Greeted;
            return Ok(SmtpCommandResult::Received(Box::new(message)));
        }

        match line.strip_prefix("..") {
            Some(rest) => {
                self.envelope.data.push('.');
                self.envelope.data.push_str(rest);
            }
            None => self.envelope.data.push_str(line),
        }
        self.envelope.data.push_str("\r\n");
        Ok(SmtpCommandResult::Continue)
    }

    fn finalize_message(&mut self) -> Message {
        let (from, raw_from) = self
            .envelope
            .from
            .take()
            .unwrap_or((Path::empty(), String::new()));
        let (to, raw_to): (Vec<Path>, Vec<String>) = self.envelope.to.drain(..).unzip();

        let raw = Envelope {
            from: raw_from,
            to: raw_to,
            data: std::mem::take(&mut self.envelope.data),
            helo: self.envelope.helo.clone(),
        };
        Message::new(from, to, raw, &self.hostname)
    }

    async fn handle_starttls(&mut self) -> Result<SmtpCommandResult> {
        if self.tls_active {
            self.write_line("454 TLS session already active").await?;
            return Ok(SmtpCommandResult::Continue);
        }
        if !self.starttls_available {
            self.write_line("454 TLS not available").await?;
            return Ok(SmtpCommandResult::Continue);
        }
        if self.state != SmtpState::Greeted {
            self.write_line("503 Bad sequence of commands").await?;
            return Ok(SmtpCommandResult::Continue);
        }

        self.state = SmtpState::StartTls;
        self.write_line("220 Ready to start TLS").await?;
        Ok(SmtpCommandResult::StartTls)
    }

    async fn handle_auth(&mut self, remainder: &str) -> Result<SmtpCommandResult> {
        if self.state != SmtpState::Greeted {
            self.write_line("503 Bad sequence of commands").await?;
            return Ok(SmtpCommandResult::Continue);
        }

        let mut parts = remainder.split_whitespace();
        let mechanism = parts
            .next()
            .map(str::to_ascii_uppercase)
            .unwrap_or_default();
        let initial = parts.next();

        match mechanism.as_str() {
            "PLAIN" => match initial {
                Some(payload) => self.finish_auth_plain(payload).await,
                None => {
                    self.state = SmtpState::AuthPlain;
                    self.write_line("334 ").await?;
                    Ok(SmtpCommandResult::Continue)
                }
            },
            "LOGIN" => match initial {
                Some(payload) => {
                    let Some(username) = decode_base64(payload) else {
                        return self.fail_auth("501 Malformed AUTH input").await;
                    };
                    self.state = SmtpState::AuthLogin {
                        username: Some(username),
                    };
                    self.write_line("334 UGFzc3dvcmQ6").await?;
                    Ok(SmtpCommandResult::Continue)
                }
                None => {
                    self.state = SmtpState::AuthLogin { username: None };
                    self.write_line("334 VXNlcm5hbWU6").await?;
                    Ok(SmtpCommandResult::Continue)
                }
            },
            "CRAM-MD5" => {
                let challenge = format!(
                    "<{:x}.{:x}@{}>",
                    rand::random::<u32>(),
                    rand::random::<u32>(),
                    self.hostname
                );
                let encoded = BASE64.encode(challenge.as_bytes());
                self.state = SmtpState::AuthCramMd5 { challenge };
                self.write_line(&format!("334 {}", encoded)).await?;
                Ok(SmtpCommandResult::Continue)
            }
            _ => {
                self.write_line("504 Unsupported authentication mechanism").await?;
                Ok(SmtpCommandResult::Continue)
            }
        }
    }

    /// Decodes the PLAIN payload (`authzid NUL authcid NUL password`) and
    /// consults the verifier.
    async fn finish_auth_plain(&mut self, payload: &str) -> Result<SmtpCommandResult> {
        if payload == "*" {
            return self.fail_auth("501 Authentication cancelled").await;
        }
        let Some(decoded) = decode_base64(payload) else {
            return self.fail_auth("501 Malformed AUTH input").await;
        };

        let fields: Vec<&str> = decoded.split('\0').collect();
        let &[_, identity, secret] = fields.as_slice() else {
            return self.fail_auth("501 Malformed AUTH input").await;
        };

        let accepted = self
            .verifier
            .verify(&AuthRequest::Plain { identity, secret });
        self.conclude_auth(accepted, identity).await
    }

    async fn process_auth_login(
        &mut self,
        username: Option<String>,
        payload: &str,
    ) -> Result<SmtpCommandResult> {
        if payload == "*" {
            return self.fail_auth("501 Authentication cancelled").await;
        }
        let Some(decoded) = decode_base64(payload) else {
            return self.fail_auth("501 Malformed AUTH input").await;
        };

        match username {
            None => {
                self.state = SmtpState::AuthLogin {
                    username: Some(decoded),
                };
                self.write_line("334 UGFzc3dvcmQ6").await?;
                Ok(SmtpCommandResult::Continue)
            }
            Some(identity) => {
                let accepted = self.verifier.verify(&AuthRequest::Login {
                    identity: &identity,
                    secret: &decoded,
                });
                self.conclude_auth(accepted, &identity).await
            }
        }
    }

    /// The CRAM-MD5 response is `username SP hex-digest`, base64 encoded.
    async fn finish_auth_cram_md5(
        &mut self,
        challenge: &str,
        payload: &str,
    ) -> Result<SmtpCommandResult> {
        if payload == "*" {
            return self.fail_auth("501 Authentication cancelled").await;
        }
        let Some(decoded) = decode_base64(payload) else {
            return self.fail_auth("501 Malformed AUTH input").await;
        };
        let Some((identity, digest)) = decoded.rsplit_once(' ') else {
            return self.fail_auth("501 Malformed AUTH input").await;
        };

        let accepted = self.verifier.verify(&AuthRequest::CramMd5 {
            identity,
            digest,
            challenge,
        });
        self.conclude_auth(accepted, identity).await
    }

    async fn conclude_auth(
        &mut self,
        accepted: bool,
        identity: &str,
    ) -> Result<SmtpCommandResult> {
        self.state = SmtpState::Greeted;
        if accepted {
            debug!("Authentication succeeded for {:?}", identity);
            self.write_line("235 Authentication successful").await?;
        } else {
            debug!("Authentication failed for {:?}", identity);
            self.write_line("535 Authentication credentials invalid").await?;
        }
        Ok(SmtpCommandResult::Continue)
    }

    async fn fail_auth(&mut self, reply: &str) -> Result<SmtpCommandResult> {
        self.state = SmtpState::Greeted;
        self.write_line(reply).await?;
        Ok(SmtpCommandResult::Continue)
    }
}

/// Strips the surrounding angle brackets from a path argument, if present.
fn extract_address(param: &str) -> String {
    let param = param.trim();
    param
        .strip_prefix('<')
        .and_then(|p| p.strip_suffix('>'))
        .unwrap_or(param)
        .to_string()
}

fn strip_prefix_ignore_case<'a>(text: &'a str, prefix: &str) -> Option<&'a str> {
    if text.len() >= prefix.len() && text[..prefix.len()].eq_ignore_ascii_case(prefix) {
        Some(&text[prefix.len()..])
    } else {
        None
    }
}

fn decode_base64(payload: &str) -> Option<String> {
    let bytes = BASE64.decode(payload.trim().as_bytes()).ok()?;
    Some(String::from_utf8_lossy(&bytes).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{cram_md5_digest, AcceptAny, AuthFile};
    use std::collections::HashMap;
    use tokio::io::{AsyncReadExt, AsyncWriteExt as _};
    use tokio::net::TcpListener;

    struct DenyAll;

    impl CredentialVerifier for DenyAll {
        fn verify(&self, _request: &AuthRequest<'_>) -> bool {
            false
        }
    }

    async fn connected_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (accepted.unwrap().0, client.unwrap())
    }

    async fn protocol_with(
        verifier: Arc<dyn CredentialVerifier>,
        starttls: bool,
    ) -> (SmtpProtocol, TcpStream) {
        let (server, client) = connected_pair().await;
        let protocol = SmtpProtocol::new(
            AnyStream::Plain(server),
            "test.example".to_string(),
            verifier,
            starttls,
            false,
        );
        (protocol, client)
    }

    async fn protocol() -> (SmtpProtocol, TcpStream) {
        protocol_with(Arc::new(AcceptAny), false).await
    }

    /// Reads until a complete reply has arrived: the last line must end in
    /// CRLF and carry a space (not a hyphen) after the status code, so
    /// multi-line EHLO replies are collected whole.
    async fn read_reply(client: &mut TcpStream) -> String {
        let mut collected = Vec::new();
        let mut buffer = [0u8; 1024];
        loop {
            let n = client.read(&mut buffer).await.unwrap();
            assert!(n > 0, "connection closed while awaiting reply");
            collected.extend_from_slice(&buffer[..n]);
            let text = String::from_utf8_lossy(&collected);
            if let Some(body) = text.strip_suffix("\r\n") {
                let last = body.rsplit("\r\n").next().unwrap_or("");
                if last.len() >= 4 && last.as_bytes()[3] == b' ' {
                    return text.into_owned();
                }
            }
        }
    }

    /// Feeds one command line through the protocol and returns the result
    /// and the reply text. Not for DATA payload lines, which produce no
    /// reply; use `send_data_line` there.
    async fn exchange(
        protocol: &mut SmtpProtocol,
        client: &mut TcpStream,
        line: &str,
    ) -> (SmtpCommandResult, String) {
        let result = send_data_line(protocol, client, line).await;
        let reply = read_reply(client).await;
        (result, reply)
    }

    /// Writes a line and processes it without awaiting a reply.
    async fn send_data_line(
        protocol: &mut SmtpProtocol,
        client: &mut TcpStream,
        line: &str,
    ) -> SmtpCommandResult {
        client
            .write_all(format!("{}\r\n", line).as_bytes())
            .await
            .unwrap();
        let read = protocol.read_line().await.unwrap().unwrap();
        protocol.process_command(&read).await.unwrap()
    }

    #[tokio::test]
    async fn greeting_carries_hostname() {
        let (mut protocol, mut client) = protocol().await;
        protocol.send_greeting().await.unwrap();
        assert_eq!(read_reply(&mut client).await, "220 test.example ESMTP\r\n");
        assert_eq!(protocol.state(), &SmtpState::Establish);
    }

    #[tokio::test]
    async fn ehlo_advertises_capabilities() {
        let (mut protocol, mut client) = protocol().await;
        let (_, reply) = exchange(&mut protocol, &mut client, "EHLO client.example").await;

        assert!(reply.starts_with("250-test.example\r\n"));
        assert!(reply.contains("250-PIPELINING\r\n"));
        assert!(reply.contains("250-8BITMIME\r\n"));
        assert!(reply.contains("250-AUTH PLAIN LOGIN CRAM-MD5\r\n"));
        assert!(!reply.contains("STARTTLS"), "no TLS configured");
        assert!(reply.ends_with("250 SIZE 0\r\n"));
        assert_eq!(protocol.state(), &SmtpState::Greeted);
    }

    #[tokio::test]
    async fn ehlo_advertises_starttls_when_configured() {
        let (mut protocol, mut client) = protocol_with(Arc::new(AcceptAny), true).await;
        let (_, reply) = exchange(&mut protocol, &mut client, "EHLO client.example").await;
        assert!(reply.contains("250-STARTTLS\r\n"));
    }

    #[tokio::test]
    async fn full_transaction_produces_message() {
        let (mut protocol, mut client) = protocol().await;

        exchange(&mut protocol, &mut client, "EHLO x").await;
        let (_, reply) = exchange(&mut protocol, &mut client, "MAIL FROM:<a@b>").await;
        assert_eq!(reply, "250 Sender a@b ok\r\n");
        assert_eq!(protocol.state(), &SmtpState::Mail);

        let (_, reply) = exchange(&mut protocol, &mut client, "RCPT TO:<c@d>").await;
        assert_eq!(reply, "250 Recipient c@d ok\r\n");
        assert_eq!(protocol.state(), &SmtpState::Rcpt);

        let (_, reply) = exchange(&mut protocol, &mut client, "DATA").await;
        assert!(reply.starts_with("354"));

        for line in ["Subject: t", "", "hi"] {
            let result = send_data_line(&mut protocol, &mut client, line).await;
            assert!(matches!(result, SmtpCommandResult::Continue));
        }

        let result = send_data_line(&mut protocol, &mut client, ".").await;
        let SmtpCommandResult::Received(message) = result else {
            panic!("expected Received, got {:?}", result);
        };
        assert_eq!(message.from.address(), "a@b");
        assert_eq!(message.to[0].address(), "c@d");
        assert_eq!(message.content.get("Subject"), vec!["t"]);
        assert_eq!(message.content.body, "hi\r\n");
        assert_eq!(message.raw.helo, "x");
        assert_eq!(message.raw.from, "a@b");
        assert_eq!(message.raw.to, vec!["c@d".to_string()]);
        assert_eq!(message.raw.data, "Subject: t\r\n\r\nhi\r\n");
        assert_eq!(message.content.size, message.raw.data.len());
        assert_eq!(protocol.state(), &SmtpState::Greeted);
    }

    #[tokio::test]
    async fn data_lines_produce_no_replies() {
        let (mut protocol, mut client) = protocol().await;
        exchange(&mut protocol, &mut client, "EHLO x").await;
        exchange(&mut protocol, &mut client, "MAIL FROM:<a@b>").await;
        exchange(&mut protocol, &mut client, "RCPT TO:<c@d>").await;
        exchange(&mut protocol, &mut client, "DATA").await;

        client.write_all(b"line one\r\nline two\r\n").await.unwrap();
        for _ in 0..2 {
            let read = protocol.read_line().await.unwrap().unwrap();
            let result = protocol.process_command(&read).await.unwrap();
            assert!(matches!(result, SmtpCommandResult::Continue));
        }
        let result = send_data_line(&mut protocol, &mut client, ".").await;
        assert!(matches!(result, SmtpCommandResult::Received(_)));
    }

    #[tokio::test]
    async fn data_reverses_dot_stuffing() {
        let (mut protocol, mut client) = protocol().await;
        exchange(&mut protocol, &mut client, "EHLO x").await;
        exchange(&mut protocol, &mut client, "MAIL FROM:<a@b>").await;
        exchange(&mut protocol, &mut client, "RCPT TO:<c@d>").await;
        exchange(&mut protocol, &mut client, "DATA").await;

        for line in ["..hello", "...world"] {
            send_data_line(&mut protocol, &mut client, line).await;
        }
        let result = send_data_line(&mut protocol, &mut client, ".").await;

        let SmtpCommandResult::Received(message) = result else {
            panic!("expected Received");
        };
        assert_eq!(message.raw.data, ".hello\r\n..world\r\n");
    }

    #[tokio::test]
    async fn out_of_sequence_commands_get_503() {
        let (mut protocol, mut client) = protocol().await;

        let (_, reply) = exchange(&mut protocol, &mut client, "MAIL FROM:<a@b>").await;
        assert!(reply.starts_with("503"));
        assert_eq!(protocol.state(), &SmtpState::Establish);

        exchange(&mut protocol, &mut client, "EHLO x").await;
        let (_, reply) = exchange(&mut protocol, &mut client, "DATA").await;
        assert!(reply.starts_with("503"));

        let (_, reply) = exchange(&mut protocol, &mut client, "RCPT TO:<c@d>").await;
        assert!(reply.starts_with("503"));
    }

    #[tokio::test]
    async fn rset_clears_envelope() {
        let (mut protocol, mut client) = protocol().await;
        exchange(&mut protocol, &mut client, "EHLO x").await;
        exchange(&mut protocol, &mut client, "MAIL FROM:<a@b>").await;

        let (_, reply) = exchange(&mut protocol, &mut client, "RSET").await;
        assert_eq!(reply, "250 Ok\r\n");
        assert_eq!(protocol.state(), &SmtpState::Greeted);

        let (_, reply) = exchange(&mut protocol, &mut client, "MAIL FROM:<e@f>").await;
        assert!(reply.starts_with("250"));
    }

    #[tokio::test]
    async fn noop_leaves_state_unchanged() {
        let (mut protocol, mut client) = protocol().await;
        exchange(&mut protocol, &mut client, "EHLO x").await;
        exchange(&mut protocol, &mut client, "MAIL FROM:<a@b>").await;

        let (_, reply) = exchange(&mut protocol, &mut client, "NOOP").await;
        assert_eq!(reply, "250 Ok\r\n");
        assert_eq!(protocol.state(), &SmtpState::Mail);
    }

    #[tokio::test]
    async fn quit_ends_session() {
        let (mut protocol, mut client) = protocol().await;
        let (result, reply) = exchange(&mut protocol, &mut client, "QUIT").await;
        assert!(matches!(result, SmtpCommandResult::Quit));
        assert_eq!(reply, "221 Bye\r\n");
        assert_eq!(protocol.state(), &SmtpState::Quit);
    }

    #[tokio::test]
    async fn starttls_without_tls_config_is_refused() {
        let (mut protocol, mut client) = protocol().await;
        exchange(&mut protocol, &mut client, "EHLO x").await;
        let (_, reply) = exchange(&mut protocol, &mut client, "STARTTLS").await;
        assert!(reply.starts_with("454"));
        assert_eq!(protocol.state(), &SmtpState::Greeted);
    }

    #[tokio::test]
    async fn starttls_requires_greeting_first() {
        let (mut protocol, mut client) = protocol_with(Arc::new(AcceptAny), true).await;
        let (_, reply) = exchange(&mut protocol, &mut client, "STARTTLS").await;
        assert!(reply.starts_with("503"));
    }

    #[tokio::test]
    async fn starttls_hands_control_to_caller() {
        let (mut protocol, mut client) = protocol_with(Arc::new(AcceptAny), true).await;
        exchange(&mut protocol, &mut client, "EHLO x").await;
        let (result, reply) = exchange(&mut protocol, &mut client, "STARTTLS").await;
        assert!(matches!(result, SmtpCommandResult::StartTls));
        assert_eq!(reply, "220 Ready to start TLS\r\n");
        assert_eq!(protocol.state(), &SmtpState::StartTls);
    }

    #[tokio::test]
    async fn auth_plain_inline_accepts_and_rejects() {
        let payload = BASE64.encode(b"\0alice\0wonder");

        let (mut protocol, mut client) = protocol().await;
        exchange(&mut protocol, &mut client, "EHLO x").await;
        let (_, reply) =
            exchange(&mut protocol, &mut client, &format!("AUTH PLAIN {}", payload)).await;
        assert_eq!(reply, "235 Authentication successful\r\n");
        assert_eq!(protocol.state(), &SmtpState::Greeted);

        let (mut protocol, mut client) = protocol_with(Arc::new(DenyAll), false).await;
        exchange(&mut protocol, &mut client, "EHLO x").await;
        let (_, reply) =
            exchange(&mut protocol, &mut client, &format!("AUTH PLAIN {}", payload)).await;
        assert_eq!(reply, "535 Authentication credentials invalid\r\n");
        assert_eq!(protocol.state(), &SmtpState::Greeted);
    }

    #[tokio::test]
    async fn auth_plain_two_step() {
        let (mut protocol, mut client) = protocol().await;
        exchange(&mut protocol, &mut client, "EHLO x").await;

        let (_, reply) = exchange(&mut protocol, &mut client, "AUTH PLAIN").await;
        assert_eq!(reply, "334 \r\n");
        assert_eq!(protocol.state(), &SmtpState::AuthPlain);

        let payload = BASE64.encode(b"\0alice\0wonder");
        let (_, reply) = exchange(&mut protocol, &mut client, &payload).await;
        assert_eq!(reply, "235 Authentication successful\r\n");
    }

    #[tokio::test]
    async fn auth_login_prompts_for_both_credentials() {
        let mut credentials = HashMap::new();
        credentials.insert("alice".to_string(), "wonder".to_string());
        let verifier = Arc::new(AuthFile::with_credentials(credentials));

        let (mut protocol, mut client) = protocol_with(verifier, false).await;
        exchange(&mut protocol, &mut client, "EHLO x").await;

        let (_, reply) = exchange(&mut protocol, &mut client, "AUTH LOGIN").await;
        assert_eq!(reply, "334 VXNlcm5hbWU6\r\n");

        let (_, reply) = exchange(&mut protocol, &mut client, &BASE64.encode(b"alice")).await;
        assert_eq!(reply, "334 UGFzc3dvcmQ6\r\n");

        let (_, reply) = exchange(&mut protocol, &mut client, &BASE64.encode(b"wonder")).await;
        assert_eq!(reply, "235 Authentication successful\r\n");
    }

    #[tokio::test]
    async fn auth_cram_md5_verifies_challenge_digest() {
        let mut credentials = HashMap::new();
        credentials.insert("tim".to_string(), "tanstaaftanstaaf".to_string());
        let verifier = Arc::new(AuthFile::with_credentials(credentials));

        let (mut protocol, mut client) = protocol_with(verifier, false).await;
        exchange(&mut protocol, &mut client, "EHLO x").await;

        let (_, reply) = exchange(&mut protocol, &mut client, "AUTH CRAM-MD5").await;
        let encoded = reply.trim_end().strip_prefix("334 ").unwrap();
        let challenge =
            String::from_utf8(BASE64.decode(encoded.as_bytes()).unwrap()).unwrap();
        assert!(challenge.ends_with("@test.example>"));

        let digest = cram_md5_digest("tanstaaftanstaaf", &challenge);
        let response = BASE64.encode(format!("tim {}", digest).as_bytes());
        let (_, reply) = exchange(&mut protocol, &mut client, &response).await;
        assert_eq!(reply, "235 Authentication successful\r\n");
    }

    #[tokio::test]
    async fn auth_cancel_returns_to_greeted() {
        let (mut protocol, mut client) = protocol().await;
        exchange(&mut protocol, &mut client, "EHLO x").await;
        exchange(&mut protocol, &mut client, "AUTH LOGIN").await;

        let (_, reply) = exchange(&mut protocol, &mut client, "*").await;
        assert!(reply.starts_with("501"));
        assert_eq!(protocol.state(), &SmtpState::Greeted);
    }

    #[tokio::test]
    async fn unknown_auth_mechanism_gets_504() {
        let (mut protocol, mut client) = protocol().await;
        exchange(&mut protocol, &mut client, "EHLO x").await;
        let (_, reply) = exchange(&mut protocol, &mut client, "AUTH XOAUTH2 abc").await;
        assert!(reply.starts_with("504"));
    }

    #[tokio::test]
    async fn overlong_line_draws_500_but_keeps_session() {
        let (mut protocol, mut client) = protocol().await;
        exchange(&mut protocol, &mut client, "EHLO x").await;

        let long = format!("NOOP {}", "a".repeat(MAX_LINE_LENGTH));
        let (_, reply) = exchange(&mut protocol, &mut client, &long).await;
        assert_eq!(reply, "500 Line too long\r\n");

        let (_, reply) = exchange(&mut protocol, &mut client, "NOOP").await;
        assert_eq!(reply, "250 Ok\r\n");
    }

    #[tokio::test]
    async fn unrecognised_and_unimplemented_commands() {
        let (mut protocol, mut client) = protocol().await;
        let (_, reply) = exchange(&mut protocol, &mut client, "BOGUS").await;
        assert!(reply.starts_with("500"));
        let (_, reply) = exchange(&mut protocol, &mut client, "VRFY alice").await;
        assert!(reply.starts_with("502"));
    }

    #[tokio::test]
    async fn null_reverse_path_is_accepted() {
        let (mut protocol, mut client) = protocol().await;
        exchange(&mut protocol, &mut client, "EHLO x").await;
        let (_, reply) = exchange(&mut protocol, &mut client, "MAIL FROM:<>").await;
        assert!(reply.starts_with("250"));
        assert_eq!(protocol.state(), &SmtpState::Mail);
    }

    #[tokio::test]
    async fn mail_size_parameter_is_tolerated() {
        let (mut protocol, mut client) = protocol().await;
        exchange(&mut protocol, &mut client, "EHLO x").await;
        let (_, reply) =
            exchange(&mut protocol, &mut client, "MAIL FROM:<a@b> SIZE=1024").await;
        assert_eq!(reply, "250 Sender a@b ok\r\n");
    }
}
