// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use std::sync::Arc;

/// Decides whether a key column read back from an array slot is well formed.
///
/// The read path uses this to tell a recoverable inconsistency (a well-formed
/// but unexpected key, which is re-pointed) from an irrecoverable one (a
/// malformed key, whose slot is dropped).
pub trait KeyPolicy {
    /// Returns `true` if `key` is a plausible key under the configured order.
    fn is_wellformed(&self, key: &[u8]) -> bool;
}

/// Shared key policy handle.
pub type SharedKeyPolicy = Arc<dyn KeyPolicy + Send + Sync>;

/// Accepts any key that is not entirely zero bytes.
///
/// A zeroed key column marks a deleted slot, so it is never a valid key.
#[derive(Copy, Clone, Debug, Default)]
pub struct AnyKey;

impl KeyPolicy for AnyKey {
    fn is_wellformed(&self, key: &[u8]) -> bool {
        key.iter().any(|&b| b != 0)
    }
}

/// Accepts keys made of printable ASCII, optionally zero-padded at the end.
#[derive(Copy, Clone, Debug, Default)]
pub struct AsciiKey;

impl KeyPolicy for AsciiKey {
    fn is_wellformed(&self, key: &[u8]) -> bool {
        let trimmed = match key.iter().position(|&b| b == 0) {
            Some(0) => return false,
            Some(n) => {
                // padding must run to the end
                if key.iter().skip(n).any(|&b| b != 0) {
                    return false;
                }
                &key[..n]
            }
            None => key,
        };

        trimmed.iter().all(|b| (0x20..0x7F).contains(b))
    }
}
