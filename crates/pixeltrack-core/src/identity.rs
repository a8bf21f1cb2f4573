//! Identity hashing: deterministic keys for aggregate rows.
//!
//! # Scheme v1
//!
//! Both ids are lowercase hex SHA-256 digests over a domain-separated input:
//!
//! ```text
//! subject_id = SHA256("pixeltrack/v1/subject" 0x00 subject)
//! pair_id    = SHA256("pixeltrack/v1/pair" 0x00 u64_le(len(subject)) subject recipient)
//! ```
//!
//! Text is hashed verbatim as UTF-8. No trimming or case folding is applied,
//! so `"Welcome"` and `"welcome "` are different subjects. The length prefix
//! keeps `("a:b", "c")` and `("a", "b:c")` apart.
//!
//! The digests partition and deduplicate rows; they are not a security
//! boundary.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{Error, Result};

/// Version of the hashing scheme documented above. Bump it (and the domain
/// tags) if the encoding ever changes.
pub const HASH_SCHEME_VERSION: u32 = 1;

const SUBJECT_DOMAIN: &[u8] = b"pixeltrack/v1/subject";
const PAIR_DOMAIN: &[u8] = b"pixeltrack/v1/pair";

/// Length of a rendered id: 32 digest bytes as hex.
const ID_LEN: usize = 64;

// ─── Id newtypes ─────────────────────────────────────────────────────────────

/// Key of a subject aggregate; a pure function of the subject text.
#[derive(
  Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct SubjectId(String);

/// Key of a recipient-pair aggregate; a pure function of
/// `(subject, recipient)`.
#[derive(
  Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct PairId(String);

fn validate(s: &str) -> Result<()> {
  let ok = s.len() == ID_LEN
    && s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
  if ok { Ok(()) } else { Err(Error::InvalidId(s.to_owned())) }
}

impl SubjectId {
  /// Accept an id produced by [`hash_subject`], e.g. from a URL path.
  pub fn parse(s: &str) -> Result<Self> {
    validate(s)?;
    Ok(Self(s.to_owned()))
  }

  pub fn as_str(&self) -> &str { &self.0 }
}

impl PairId {
  pub fn parse(s: &str) -> Result<Self> {
    validate(s)?;
    Ok(Self(s.to_owned()))
  }

  pub fn as_str(&self) -> &str { &self.0 }
}

impl fmt::Display for SubjectId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

impl fmt::Display for PairId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

// ─── Hashing ─────────────────────────────────────────────────────────────────

/// Derive the subject id. Empty text is a valid (degenerate) subject.
pub fn hash_subject(subject: &str) -> SubjectId {
  let mut hasher = Sha256::new();
  hasher.update(SUBJECT_DOMAIN);
  hasher.update([0u8]);
  hasher.update(subject.as_bytes());
  SubjectId(hex::encode(hasher.finalize()))
}

/// Derive the pair id. Either component may be empty.
pub fn hash_pair(subject: &str, recipient: &str) -> PairId {
  let mut hasher = Sha256::new();
  hasher.update(PAIR_DOMAIN);
  hasher.update([0u8]);
  hasher.update((subject.len() as u64).to_le_bytes());
  hasher.update(subject.as_bytes());
  hasher.update(recipient.as_bytes());
  PairId(hex::encode(hasher.finalize()))
}

// ─── EventKeys ───────────────────────────────────────────────────────────────

/// Everything the store needs to address the rows touched by one event:
/// both ids plus the texts they were derived from (kept for display).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventKeys {
  pub subject_id: SubjectId,
  pub pair_id:    PairId,
  pub subject:    String,
  pub recipient:  String,
}

impl EventKeys {
  pub fn derive(subject: &str, recipient: &str) -> Self {
    Self {
      subject_id: hash_subject(subject),
      pair_id:    hash_pair(subject, recipient),
      subject:    subject.to_owned(),
      recipient:  recipient.to_owned(),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn subject_hash_matches_published_vector() {
    assert_eq!(
      hash_subject("Welcome").as_str(),
      "b1769e3421845d76d5f0a7353578ff5186d81645a7c88425d3c850a55c995a80"
    );
  }

  #[test]
  fn pair_hash_matches_published_vector() {
    assert_eq!(
      hash_pair("Welcome", "a@x.com").as_str(),
      "b6c835615522542b90079b903e1ce78c211c9800cdf936092285a98ab762911f"
    );
  }

  #[test]
  fn hashing_is_deterministic() {
    for _ in 0..3 {
      assert_eq!(hash_subject("Launch"), hash_subject("Launch"));
      assert_eq!(hash_pair("Launch", "b@y.com"), hash_pair("Launch", "b@y.com"));
    }
  }

  #[test]
  fn empty_inputs_hash_without_error() {
    assert_eq!(
      hash_subject("").as_str(),
      "0feeb95aaa60874bd988ecbf6c833a350838d9cf398351b5a4d3b0651737d4c5"
    );
    assert_eq!(hash_pair("", ""), hash_pair("", ""));
    assert_ne!(hash_pair("", "a@x.com"), hash_pair("a@x.com", ""));
  }

  #[test]
  fn text_is_taken_verbatim() {
    assert_ne!(hash_subject("Welcome"), hash_subject("welcome"));
    assert_ne!(hash_subject("Welcome"), hash_subject("Welcome "));
  }

  #[test]
  fn length_prefix_separates_ambiguous_splits() {
    assert_ne!(hash_pair("a:b", "c"), hash_pair("a", "b:c"));
    assert_ne!(hash_pair("ab", "c"), hash_pair("a", "bc"));
  }

  #[test]
  fn parse_rejects_non_hex_and_wrong_length() {
    let good = hash_subject("x");
    assert_eq!(SubjectId::parse(good.as_str()).unwrap(), good);
    assert!(SubjectId::parse("abc").is_err());
    assert!(SubjectId::parse(&"Z".repeat(64)).is_err());
    assert!(PairId::parse(&good.as_str().to_uppercase()).is_err());
  }

  #[test]
  fn ids_serialize_as_plain_strings() {
    let id = hash_subject("Welcome");
    let json = serde_json::to_string(&id).unwrap();
    assert_eq!(json, format!("\"{id}\""));
  }
}
