// # Branch Identifiers
//
// `XidKey` is the immutable, hashable identity of one XA transaction branch:
// format id, global transaction id, branch qualifier. Each server tracks its
// own branch of a distributed transaction under this key independently.

use std::hash::{Hash, Hasher};

/// XA flag values, wire-compatible with the JTA `XAResource` constants.
pub mod flags {
    pub const TMNOFLAGS: i32 = 0x0000_0000;
    pub const TMENDRSCAN: i32 = 0x0080_0000;
    pub const TMSTARTRSCAN: i32 = 0x0100_0000;
    pub const TMJOIN: i32 = 0x0020_0000;
    pub const TMSUSPEND: i32 = 0x0200_0000;
    pub const TMSUCCESS: i32 = 0x0400_0000;
    pub const TMRESUME: i32 = 0x0800_0000;
    pub const TMFAIL: i32 = 0x2000_0000;
    pub const TMONEPHASE: i32 = 0x4000_0000;
}

/// XA error codes, wire-compatible with the `XAException` constants.
pub mod errors {
    pub const XA_OK: i32 = 0;
    pub const XAER_ASYNC: i32 = -2;
    pub const XAER_RMERR: i32 = -3;
    pub const XAER_NOTA: i32 = -4;
    pub const XAER_INVAL: i32 = -5;
    pub const XAER_PROTO: i32 = -6;
    pub const XAER_RMFAIL: i32 = -7;
    pub const XAER_DUPID: i32 = -8;
}

/// Immutable branch identifier with a precomputed hash.
///
/// The hash is computed once at construction; branch maps are consulted on
/// every XA verb, so lookups should not rehash the byte arrays each time.
#[derive(Debug, Clone, Eq)]
pub struct XidKey {
    format_id: i32,
    gtrid: Vec<u8>,
    bqual: Vec<u8>,
    cached_hash: u64,
}

impl XidKey {
    pub fn new(format_id: i32, gtrid: Vec<u8>, bqual: Vec<u8>) -> Self {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        format_id.hash(&mut hasher);
        gtrid.hash(&mut hasher);
        bqual.hash(&mut hasher);
        let cached_hash = hasher.finish();
        Self {
            format_id,
            gtrid,
            bqual,
            cached_hash,
        }
    }

    /// Generates a fresh transaction-manager style xid. Used by tests and
    /// the demo client; real transaction managers supply their own.
    pub fn generate() -> Self {
        let gtrid = uuid::Uuid::new_v4().as_bytes().to_vec();
        Self::new(1, gtrid, vec![1])
    }

    pub fn format_id(&self) -> i32 {
        self.format_id
    }

    pub fn gtrid(&self) -> &[u8] {
        &self.gtrid
    }

    pub fn bqual(&self) -> &[u8] {
        &self.bqual
    }
}

impl PartialEq for XidKey {
    fn eq(&self, other: &Self) -> bool {
        self.cached_hash == other.cached_hash
            && self.format_id == other.format_id
            && self.gtrid == other.gtrid
            && self.bqual == other.bqual
    }
}

impl Hash for XidKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.cached_hash);
    }
}

impl std::fmt::Display for XidKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "xid[{},", self.format_id)?;
        for b in &self.gtrid {
            write!(f, "{:02x}", b)?;
        }
        write!(f, ",")?;
        for b in &self.bqual {
            write!(f, "{:02x}", b)?;
        }
        write!(f, "]")
    }
}
