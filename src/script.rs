//! Server-side Lua scripts
//!
//! Scripts are hashed at construction so callers can try `EVALSHA` first and
//! fall back to `EVAL` when the server cache misses with `NOSCRIPT`.

use bytes::Bytes;
use lazy_static::lazy_static;
use sha1::{Digest, Sha1};

lazy_static! {
    static ref NAMESPACE_SCAN: Script = Script::new(include_str!("scripts/scan.lua"));
}

/// A Lua script plus its SHA1 digest
#[derive(Debug, Clone)]
pub struct Script {
    source: String,
    sha: String,
}

impl Script {
    /// Create a script from Lua source
    pub fn new(source: impl Into<String>) -> Self {
        let source = source.into();
        let sha = hex::encode(Sha1::digest(source.as_bytes()));

        Self { source, sha }
    }

    /// SHA1 digest of the source, as lowercase hex
    #[must_use]
    pub fn sha(&self) -> &str {
        &self.sha
    }

    /// Lua source code
    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    /// `EVAL` frames for this script with zero keys
    #[must_use]
    pub fn eval_frames(&self, args: &[&str]) -> Vec<Bytes> {
        let mut frames = vec![
            Bytes::from_static(b"EVAL"),
            Bytes::copy_from_slice(self.source.as_bytes()),
            Bytes::from_static(b"0"),
        ];
        frames.extend(args.iter().map(|a| Bytes::copy_from_slice(a.as_bytes())));
        frames
    }

    /// `EVALSHA` frames for this script with zero keys
    #[must_use]
    pub fn evalsha_frames(&self, args: &[&str]) -> Vec<Bytes> {
        let mut frames = vec![
            Bytes::from_static(b"EVALSHA"),
            Bytes::copy_from_slice(self.sha.as_bytes()),
            Bytes::from_static(b"0"),
        ];
        frames.extend(args.iter().map(|a| Bytes::copy_from_slice(a.as_bytes())));
        frames
    }
}

/// The embedded namespace-aggregation script
#[must_use]
pub fn namespace_scan_script() -> &'static Script {
    &NAMESPACE_SCAN
}
