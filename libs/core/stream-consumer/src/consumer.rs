//! Consumer identity
//!
//! Every process joins the group under a fresh, human-traceable name:
//! `"{group}-consumer-{10 lowercase base32 chars}"`.

use std::fmt;

const BASE32_ALPHABET: &[u8; 32] = b"abcdefghijklmnopqrstuvwxyz234567";
const SUFFIX_LEN: usize = 10;

/// Stream, group and consumer name this process consumes as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerIdentity {
    stream: String,
    group: String,
    name: String,
}

impl ConsumerIdentity {
    /// Identity with a freshly generated consumer name.
    pub fn generate(stream: impl Into<String>, group: impl Into<String>) -> Self {
        let group = group.into();
        let name = generate_consumer_name(&group);
        Self::new(stream, group, name)
    }

    /// Identity with an explicit consumer name.
    pub fn new(
        stream: impl Into<String>,
        group: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            stream: stream.into(),
            group: group.into(),
            name: name.into(),
        }
    }

    pub fn stream(&self) -> &str {
        &self.stream
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for ConsumerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.stream, self.group, self.name)
    }
}

/// Generate `"{group}-consumer-xxxxxxxxxx"` from 50 random bits.
pub fn generate_consumer_name(group: &str) -> String {
    let bits: u64 = rand::random();
    let suffix: String = (0..SUFFIX_LEN)
        .map(|i| {
            let shift = 64 - 5 * (i + 1);
            BASE32_ALPHABET[((bits >> shift) & 0x1f) as usize] as char
        })
        .collect();
    format!("{group}-consumer-{suffix}")
}
