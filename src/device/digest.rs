//! HTTP Digest access authentication (RFC 2617 / RFC 7616, MD5 family).

use md5::{Digest, Md5};
use parking_lot::Mutex;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DigestError {
    #[error("заголовок WWW-Authenticate не содержит схему Digest")]
    NotDigest,
    #[error("в challenge отсутствует поле {0}")]
    MissingField(&'static str),
    #[error("неподдерживаемый алгоритм {0}")]
    UnsupportedAlgorithm(String),
    #[error("неподдерживаемый qop {0}")]
    UnsupportedQop(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algorithm {
    Md5,
    Md5Sess,
}

impl Algorithm {
    fn as_str(self) -> &'static str {
        match self {
            Algorithm::Md5 => "MD5",
            Algorithm::Md5Sess => "MD5-sess",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    pub realm: String,
    pub nonce: String,
    pub opaque: Option<String>,
    /// `Some("auth")` when the server offers it, `None` for RFC 2069 servers.
    pub qop: Option<String>,
    pub algorithm: Algorithm,
}

impl Challenge {
    pub fn parse(header: &str) -> Result<Self, DigestError> {
        let header = header.trim();
        let (scheme, params) = header.split_once(' ').ok_or(DigestError::NotDigest)?;
        if !scheme.eq_ignore_ascii_case("digest") {
            return Err(DigestError::NotDigest);
        }

        let params = parse_params(params);
        let get = |name: &str| {
            params
                .iter()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.clone())
        };

        let realm = get("realm").ok_or(DigestError::MissingField("realm"))?;
        let nonce = get("nonce").ok_or(DigestError::MissingField("nonce"))?;
        let algorithm = match get("algorithm") {
            None => Algorithm::Md5,
            Some(a) if a.eq_ignore_ascii_case("md5") => Algorithm::Md5,
            Some(a) if a.eq_ignore_ascii_case("md5-sess") => Algorithm::Md5Sess,
            Some(a) => return Err(DigestError::UnsupportedAlgorithm(a)),
        };
        let qop = match get("qop") {
            None => None,
            Some(offered) => {
                if offered
                    .split(',')
                    .any(|q| q.trim().eq_ignore_ascii_case("auth"))
                {
                    Some("auth".to_string())
                } else {
                    return Err(DigestError::UnsupportedQop(offered));
                }
            }
        };

        Ok(Self {
            realm,
            nonce,
            opaque: get("opaque"),
            qop,
            algorithm,
        })
    }

    /// Picks the Digest challenge out of possibly several `WWW-Authenticate` values.
    pub fn from_headers<'a>(values: impl IntoIterator<Item = &'a str>) -> Result<Self, DigestError> {
        let mut last_err = DigestError::NotDigest;
        for value in values {
            match Self::parse(value) {
                Ok(challenge) => return Ok(challenge),
                Err(err) => last_err = err,
            }
        }
        Err(last_err)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Credentials<'a> {
    pub username: &'a str,
    pub password: &'a str,
}

pub fn authorization(
    challenge: &Challenge,
    creds: Credentials<'_>,
    method: &str,
    uri: &str,
    nc: u32,
    cnonce: &str,
) -> String {
    let mut ha1 = md5_hex(&format!(
        "{}:{}:{}",
        creds.username, challenge.realm, creds.password
    ));
    if challenge.algorithm == Algorithm::Md5Sess {
        ha1 = md5_hex(&format!("{ha1}:{}:{cnonce}", challenge.nonce));
    }
    let ha2 = md5_hex(&format!("{method}:{uri}"));

    let response = match &challenge.qop {
        Some(qop) => md5_hex(&format!(
            "{ha1}:{}:{nc:08x}:{cnonce}:{qop}:{ha2}",
            challenge.nonce
        )),
        None => md5_hex(&format!("{ha1}:{}:{ha2}", challenge.nonce)),
    };

    let mut header = format!(
        "Digest username=\"{}\", realm=\"{}\", nonce=\"{}\", uri=\"{}\", algorithm={}, response=\"{}\"",
        creds.username,
        challenge.realm,
        challenge.nonce,
        uri,
        challenge.algorithm.as_str(),
        response
    );
    if let Some(qop) = &challenge.qop {
        header.push_str(&format!(", qop={qop}, nc={nc:08x}, cnonce=\"{cnonce}\""));
    }
    if let Some(opaque) = &challenge.opaque {
        header.push_str(&format!(", opaque=\"{opaque}\""));
    }
    header
}

/// Per-session digest state: the last challenge and its nonce count, so
/// requests after the first go out pre-authorized.
#[derive(Debug)]
pub struct DigestSession {
    username: String,
    password: String,
    state: Mutex<Option<(Challenge, u32)>>,
}

impl DigestSession {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            state: Mutex::new(None),
        }
    }

    pub fn remember(&self, challenge: Challenge) {
        *self.state.lock() = Some((challenge, 0));
    }

    pub fn forget(&self) {
        *self.state.lock() = None;
    }

    /// `Authorization` value for the next request, if a challenge is cached.
    pub fn authorize(&self, method: &str, uri: &str) -> Option<String> {
        let mut guard = self.state.lock();
        let (challenge, nc) = guard.as_mut()?;
        *nc = nc.wrapping_add(1);
        let cnonce = Uuid::new_v4().simple().to_string();
        Some(authorization(
            challenge,
            Credentials {
                username: &self.username,
                password: &self.password,
            },
            method,
            uri,
            *nc,
            &cnonce,
        ))
    }
}

fn md5_hex(input: &str) -> String {
    hex::encode(Md5::digest(input.as_bytes()))
}

pub(crate) fn parse_params(input: &str) -> Vec<(String, String)> {
    let mut out = Vec::new();
    let mut rest = input.trim();

    while !rest.is_empty() {
        let Some(eq) = rest.find('=') else {
            break;
        };
        let key = rest[..eq]
            .trim()
            .trim_start_matches(',')
            .trim()
            .to_ascii_lowercase();
        rest = rest[eq + 1..].trim_start();

        let value = if let Some(quoted) = rest.strip_prefix('"') {
            let mut value = String::new();
            let mut escaped = false;
            let mut end = quoted.len();
            for (i, c) in quoted.char_indices() {
                if escaped {
                    value.push(c);
                    escaped = false;
                } else if c == '\\' {
                    escaped = true;
                } else if c == '"' {
                    end = i + 1;
                    break;
                } else {
                    value.push(c);
                }
            }
            rest = &quoted[end..];
            value
        } else {
            let end = rest.find(',').unwrap_or(rest.len());
            let value = rest[..end].trim().to_string();
            rest = &rest[end..];
            value
        };

        rest = rest.trim_start().trim_start_matches(',').trim_start();
        out.push((key, value));
    }

    out
}
