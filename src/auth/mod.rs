//! SMTP credential verification.
//!
//! The protocol session consults a [`CredentialVerifier`] and never learns
//! where credentials live. Two implementations are provided: [`AcceptAny`],
//! the default for a capture tool that wants to observe clients rather than
//! gatekeep them, and [`AuthFile`], a flat-file reader for when rejecting
//! bad credentials is part of the test.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use hmac::{Hmac, Mac};
use log::{debug, warn};
use md5::Md5;

/// One authentication attempt, as assembled by the protocol session.
#[derive(Debug)]
pub enum AuthRequest<'a> {
    /// RFC 4616 `PLAIN`: identity and password from the decoded payload.
    Plain { identity: &'a str, secret: &'a str },
    /// `LOGIN`: identity and password collected over two prompts.
    Login { identity: &'a str, secret: &'a str },
    /// RFC 2195 `CRAM-MD5`: the hex digest the client computed over the
    /// challenge we issued.
    CramMd5 {
        identity: &'a str,
        digest: &'a str,
        challenge: &'a str,
    },
}

impl AuthRequest<'_> {
    /// The identity the client claims, independent of mechanism.
    pub fn identity(&self) -> &str {
        match self {
            AuthRequest::Plain { identity, .. }
            | AuthRequest::Login { identity, .. }
            | AuthRequest::CramMd5 { identity, .. } => identity,
        }
    }
}

/// Decides whether an authentication attempt succeeds.
pub trait CredentialVerifier: Send + Sync {
    fn verify(&self, request: &AuthRequest<'_>) -> bool;
}

/// Accepts every credential. A capture server's default: the point is to
/// see what the client sends, not to keep it out.
pub struct AcceptAny;

impl CredentialVerifier for AcceptAny {
    fn verify(&self, request: &AuthRequest<'_>) -> bool {
        debug!("Accepting credentials for {} (no auth file)", request.identity());
        true
    }
}

/// Flat-file credential store: one `username:password` pair per line.
/// Blank lines and lines starting with `#` are skipped.
///
/// Passwords are kept in the clear because CRAM-MD5 verification needs the
/// shared secret itself, not a one-way hash of it.
pub struct AuthFile {
    credentials: HashMap<String, String>,
}

impl AuthFile {
    /// Reads credentials from `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read auth file {}", path.display()))?;
        Ok(Self::parse(&contents))
    }

    /// Parses auth file contents. Malformed lines are logged and skipped.
    pub fn parse(contents: &str) -> Self {
        let mut credentials = HashMap::new();
        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            match line.split_once(':') {
                Some((user, password)) => {
                    credentials.insert(user.to_string(), password.to_string());
                }
                None => warn!("Skipping malformed auth file line: {:?}", line),
            }
        }
        AuthFile { credentials }
    }

    /// Builds a verifier from in-memory credentials.
    pub fn with_credentials(credentials: HashMap<String, String>) -> Self {
        AuthFile { credentials }
    }
}

impl CredentialVerifier for AuthFile {
    fn verify(&self, request: &AuthRequest<'_>) -> bool {
        let Some(stored) = self.credentials.get(request.identity()) else {
            return false;
        };

        match request {
            AuthRequest::Plain { secret, .. } | AuthRequest::Login { secret, .. } => {
                stored == secret
            }
            AuthRequest::CramMd5 {
                digest, challenge, ..
            } => cram_md5_digest(stored, challenge).eq_ignore_ascii_case(digest),
        }
    }
}

/// HMAC-MD5 of `challenge` keyed by `secret`, as lowercase hex — the digest
/// a CRAM-MD5 client is expected to return.
pub fn cram_md5_digest(secret: &str, challenge: &str) -> String {
    let mut mac =
        Hmac::<Md5>::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(challenge.as_bytes());
    mac.finalize()
        .into_bytes()
        .iter()
        .map(|byte| format!("{:02x}", byte))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accept_any_accepts_everything() {
        let verifier = AcceptAny;
        assert!(verifier.verify(&AuthRequest::Plain {
            identity: "anyone",
            secret: "anything",
        }));
    }

    #[test]
    fn parse_skips_comments_and_blanks() {
        let file = AuthFile::parse("# comment\n\nalice:wonder\nbob:builder\nmalformed\n");
        assert!(file.verify(&AuthRequest::Plain {
            identity: "alice",
            secret: "wonder",
        }));
        assert!(file.verify(&AuthRequest::Login {
            identity: "bob",
            secret: "builder",
        }));
        assert!(!file.verify(&AuthRequest::Plain {
            identity: "malformed",
            secret: "",
        }));
    }

    #[test]
    fn rejects_wrong_password_and_unknown_user() {
        let file = AuthFile::parse("alice:wonder\n");
        assert!(!file.verify(&AuthRequest::Plain {
            identity: "alice",
            secret: "nope",
        }));
        assert!(!file.verify(&AuthRequest::Plain {
            identity: "carol",
            secret: "wonder",
        }));
    }

    #[test]
    fn cram_md5_matches_rfc_2195_example() {
        // Test vector from RFC 2195 §2.
        let digest = cram_md5_digest(
            "tanstaaftanstaaf",
            "<1896.697170952@postoffice.reston.mci.net>",
        );
        assert_eq!(digest, "b913a602c7eda7a495b4e6e7334d3890");
    }

    #[test]
    fn cram_md5_verify_is_case_insensitive_on_digest() {
        let file = AuthFile::parse("tim:tanstaaftanstaaf\n");
        let challenge = "<1896.697170952@postoffice.reston.mci.net>";
        assert!(file.verify(&AuthRequest::CramMd5 {
            identity: "tim",
            digest: "B913A602C7EDA7A495B4E6E7334D3890",
            challenge,
        }));
        assert!(!file.verify(&AuthRequest::CramMd5 {
            identity: "tim",
            digest: "deadbeef",
            challenge,
        }));
    }
}
