// # XA Transaction Support
//
// Branch identifiers, JTA-compatible flag and error constants, and the
// server-side branch registry with its dual-condition session lifecycle.

pub mod registry;
pub mod xid;

pub use registry::{BranchState, ReleaseAction, TerminateAction, TxContext, XaTransactionRegistry};
pub use xid::XidKey;
