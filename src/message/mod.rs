//! Data model for captured messages.
//!
//! Defines the parsed SMTP envelope types (`MailboxAddress`, `Path`), the
//! RFC 5322 content representation (`Content`), and the stored `Message`
//! that ties the parsed form to the raw on-the-wire envelope. Parsing the
//! raw payload into `Content` is deterministic, so a stored message can
//! always be re-parsed from `raw.data`.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use log::debug;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Maximum octets in the local part of an address (RFC 5321 §4.5.3.1.1).
pub const MAX_LOCAL_PART_LENGTH: usize = 64;
/// Maximum octets in the domain of an address (RFC 5321 §4.5.3.1.2).
pub const MAX_DOMAIN_LENGTH: usize = 255;

/// Process-lifetime counter backing message id generation.
static MESSAGE_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Errors produced while parsing envelope addresses.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AddressError {
    #[error("address has an empty local part")]
    EmptyLocalPart,
    #[error("address has an empty domain")]
    EmptyDomain,
    #[error("address contains an illegal character")]
    IllegalCharacter,
    #[error("local part exceeds {MAX_LOCAL_PART_LENGTH} octets")]
    LocalPartTooLong,
    #[error("domain exceeds {MAX_DOMAIN_LENGTH} octets")]
    DomainTooLong,
    #[error("address is missing the domain separator")]
    MissingDomain,
}

/// A `local-part@domain` pair from an SMTP envelope path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MailboxAddress {
    pub local_part: String,
    pub domain: String,
}

impl MailboxAddress {
    /// Parses `local@domain`, validating both parts.
    ///
    /// The split is on the last `@` so local parts containing `@` inside
    /// quoting are not mangled further than the wire form already is.
    pub fn parse(addr: &str) -> Result<Self, AddressError> {
        let (local_part, domain) = addr.rsplit_once('@').ok_or(AddressError::MissingDomain)?;

        if local_part.is_empty() {
            return Err(AddressError::EmptyLocalPart);
        }
        if domain.is_empty() {
            return Err(AddressError::EmptyDomain);
        }
        if local_part.len() > MAX_LOCAL_PART_LENGTH {
            return Err(AddressError::LocalPartTooLong);
        }
        if domain.len() > MAX_DOMAIN_LENGTH {
            return Err(AddressError::DomainTooLong);
        }

        let illegal =
            |c: char| c.is_control() || c.is_whitespace() || c == '<' || c == '>';
        if local_part.chars().any(illegal) || domain.chars().any(illegal) {
            return Err(AddressError::IllegalCharacter);
        }

        Ok(MailboxAddress {
            local_part: local_part.to_string(),
            domain: domain.to_string(),
        })
    }
}

impl fmt::Display for MailboxAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.local_part, self.domain)
    }
}

/// A parsed SMTP reverse-path or forward-path.
///
/// `mailbox` is `None` for the empty reverse-path `<>` used by bounces.
/// Source-routing hops are retained verbatim but never used for routing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Path {
    pub relays: Vec<String>,
    pub mailbox: Option<MailboxAddress>,
}

impl Path {
    /// An empty path, i.e. the null reverse-path `<>`.
    pub fn empty() -> Self {
        Path {
            relays: Vec::new(),
            mailbox: None,
        }
    }

    /// Parses a path as it appears in `MAIL FROM:` / `RCPT TO:` arguments.
    ///
    /// Accepts the address with or without the surrounding angle brackets,
    /// and an optional `@relay1,@relay2:` source-route prefix.
    pub fn parse(path: &str) -> Result<Self, AddressError> {
        let inner = path
            .strip_prefix('<')
            .and_then(|p| p.strip_suffix('>'))
            .unwrap_or(path)
            .trim();

        if inner.is_empty() {
            return Ok(Path::empty());
        }

        let (route, addr) = match inner.split_once(':') {
            Some((route, addr)) if route.starts_with('@') => (Some(route), addr),
            _ => (None, inner),
        };

        let relays = route
            .map(|r| r.split(',').map(str::to_string).collect())
            .unwrap_or_default();

        Ok(Path {
            relays,
            mailbox: Some(MailboxAddress::parse(addr)?),
        })
    }

    /// `local@domain` for a non-empty path, the empty string for `<>`.
    pub fn address(&self) -> String {
        self.mailbox
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_default()
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.mailbox {
            Some(mailbox) => write!(f, "{}", mailbox),
            None => Ok(()),
        }
    }
}

/// A single message header as received, casing and order preserved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Header {
    pub name: String,
    pub value: String,
}

/// Parsed RFC 5322 content: ordered headers plus the verbatim body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Content {
    pub headers: Vec<Header>,
    pub body: String,
    pub size: usize,
}

impl Content {
    /// Parses raw message data into headers and body.
    ///
    /// Headers run until the first empty line; continuation lines (leading
    /// whitespace) are folded into the preceding value with their interior
    /// whitespace intact. The body is everything after the separator,
    /// verbatim. Lines lacking a `:` in the header section are skipped.
    pub fn parse(raw: &str) -> Self {
        let (header_block, body) = match raw.split_once("\r\n\r\n") {
            Some((headers, body)) => (headers, body),
            None => match raw.split_once("\n\n") {
                Some((headers, body)) => (headers, body),
                None => (raw, ""),
            },
        };

        let mut headers: Vec<Header> = Vec::new();
        for line in header_block.lines() {
            if line.starts_with(' ') || line.starts_with('\t') {
                if let Some(last) = headers.last_mut() {
                    last.value.push_str("\r\n");
                    last.value.push_str(line);
                }
                continue;
            }
            match line.split_once(':') {
                Some((name, value)) => headers.push(Header {
                    name: name.to_string(),
                    value: value.trim_start().to_string(),
                }),
                None => debug!("Skipping malformed header line: {:?}", line),
            }
        }

        Content {
            headers,
            body: body.to_string(),
            size: raw.len(),
        }
    }

    /// Values of every header whose name matches, case-insensitively, in
    /// received order.
    pub fn get(&self, name: &str) -> Vec<&str> {
        self.headers
            .iter()
            .filter(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_str())
            .collect()
    }

    /// Re-serializes the content. Header names, header order, and the body
    /// survive byte-for-byte.
    pub fn to_wire(&self) -> String {
        let mut out = String::with_capacity(self.size);
        for header in &self.headers {
            out.push_str(&header.name);
            out.push_str(": ");
            out.push_str(&header.value);
            out.push_str("\r\n");
        }
        out.push_str("\r\n");
        out.push_str(&self.body);
        out
    }
}

/// The on-the-wire envelope and payload, preserved for later re-parsing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Envelope {
    pub from: String,
    pub to: Vec<String>,
    pub data: String,
    pub helo: String,
}

/// A captured message: parsed envelope, parsed content, and the raw form.
///
/// Messages are immutable once constructed; the store never hands out a
/// mutable view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Message {
    pub id: String,
    pub from: Path,
    pub to: Vec<Path>,
    pub content: Content,
    pub created: DateTime<Utc>,
    pub raw: Envelope,
}

impl Message {
    /// Builds a message from a completed SMTP transaction.
    ///
    /// `content` derives deterministically from `raw.data`; `created` is
    /// the construction time; the id comes from the process-wide sequence
    /// suffixed with the configured hostname.
    pub fn new(from: Path, to: Vec<Path>, raw: Envelope, hostname: &str) -> Self {
        let content = Content::parse(&raw.data);
        Message {
            id: next_message_id(hostname),
            from,
            to,
            content,
            created: Utc::now(),
            raw,
        }
    }
}

/// Returns the next storage id: a monotonic counter plus host suffix,
/// unique for the process lifetime and never reused.
pub fn next_message_id(hostname: &str) -> String {
    let seq = MESSAGE_SEQUENCE.fetch_add(1, Ordering::Relaxed) + 1;
    format!("{}@{}", seq, hostname)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_simple_address() {
        let addr = MailboxAddress::parse("alice@example.com").unwrap();
        assert_eq!(addr.local_part, "alice");
        assert_eq!(addr.domain, "example.com");
        assert_eq!(addr.to_string(), "alice@example.com");
    }

    #[test]
    fn reject_malformed_addresses() {
        assert_eq!(
            MailboxAddress::parse("alice"),
            Err(AddressError::MissingDomain)
        );
        assert_eq!(
            MailboxAddress::parse("@example.com"),
            Err(AddressError::EmptyLocalPart)
        );
        assert_eq!(MailboxAddress::parse("alice@"), Err(AddressError::EmptyDomain));
        assert_eq!(
            MailboxAddress::parse("al ice@example.com"),
            Err(AddressError::IllegalCharacter)
        );
        assert_eq!(
            MailboxAddress::parse(&format!("{}@example.com", "a".repeat(65))),
            Err(AddressError::LocalPartTooLong)
        );
        assert_eq!(
            MailboxAddress::parse(&format!("a@{}", "d".repeat(256))),
            Err(AddressError::DomainTooLong)
        );
    }

    #[test]
    fn parse_path_variants() {
        let path = Path::parse("<bob@example.org>").unwrap();
        assert_eq!(path.address(), "bob@example.org");
        assert!(path.relays.is_empty());

        let bare = Path::parse("bob@example.org").unwrap();
        assert_eq!(bare, path);

        let null = Path::parse("<>").unwrap();
        assert!(null.mailbox.is_none());
        assert_eq!(null.address(), "");
    }

    #[test]
    fn parse_source_routed_path() {
        let path = Path::parse("<@relay1.example,@relay2.example:user@dest.example>").unwrap();
        assert_eq!(
            path.relays,
            vec!["@relay1.example".to_string(), "@relay2.example".to_string()]
        );
        assert_eq!(path.address(), "user@dest.example");
    }

    #[test]
    fn parse_content_headers_and_body() {
        let content = Content::parse("Subject: t\r\nFrom: a@b\r\n\r\nhi\r\n");
        assert_eq!(content.get("Subject"), vec!["t"]);
        assert_eq!(content.get("subject"), vec!["t"]);
        assert_eq!(content.get("From"), vec!["a@b"]);
        assert_eq!(content.body, "hi\r\n");
        assert_eq!(content.size, "Subject: t\r\nFrom: a@b\r\n\r\nhi\r\n".len());
    }

    #[test]
    fn parse_content_folds_continuations() {
        let content =
            Content::parse("Subject: first\r\n second line\r\nX-Other: v\r\n\r\nbody");
        assert_eq!(
            content.get("Subject"),
            vec!["first\r\n second line"]
        );
        assert_eq!(content.get("X-Other"), vec!["v"]);
    }

    #[test]
    fn parse_content_without_separator() {
        let content = Content::parse("Subject: only headers\r\nX-Last: v");
        assert_eq!(content.get("Subject"), vec!["only headers"]);
        assert_eq!(content.body, "");
    }

    #[test]
    fn content_round_trips_names_order_and_body() {
        let raw = "Subject: t\r\nX-One: 1\r\nx-two: 2\r\n\r\nbody line\r\n.dot\r\n";
        let content = Content::parse(raw);
        assert_eq!(content.to_wire(), raw);

        let reparsed = Content::parse(&content.to_wire());
        let names: Vec<&str> = reparsed.headers.iter().map(|h| h.name.as_str()).collect();
        assert_eq!(names, vec!["Subject", "X-One", "x-two"]);
        assert_eq!(reparsed.body, "body line\r\n.dot\r\n");
    }

    #[test]
    fn repeated_headers_keep_order() {
        let content = Content::parse("Received: a\r\nReceived: b\r\n\r\n");
        assert_eq!(content.get("Received"), vec!["a", "b"]);
    }

    #[test]
    fn message_ids_are_unique_and_suffixed() {
        let a = next_message_id("test.example");
        let b = next_message_id("test.example");
        assert_ne!(a, b);
        assert!(a.ends_with("@test.example"));
        assert!(b.ends_with("@test.example"));
    }

    #[test]
    fn message_from_envelope_parses_content() {
        let raw = Envelope {
            from: "a@b".to_string(),
            to: vec!["c@d".to_string()],
            data: "Subject: t\r\n\r\nhi\r\n".to_string(),
            helo: "client.example".to_string(),
        };
        let message = Message::new(
            Path::parse("a@b").unwrap(),
            vec![Path::parse("c@d").unwrap()],
            raw,
            "test.example",
        );
        assert_eq!(message.content.get("Subject"), vec!["t"]);
        assert_eq!(message.content.body, "hi\r\n");
        assert_eq!(message.content.size, message.raw.data.len());
        assert!(message.created <= Utc::now());
    }
}
