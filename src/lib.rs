//! An RPC runtime layered over a pluggable network abstraction with
//! two-sided tagged messaging and one-sided remote memory access.

mod addr;
mod codec;
mod completion;
mod endpoint;
mod error;
mod mem;
mod msgbuf;
mod op;
mod registry;
mod rpc;
mod tag;

pub mod transport;
pub mod type_alias;
pub mod wire;

pub use self::addr::AddrId;
pub use self::codec::{Proc, ProcFn, ProcOp};
pub use self::endpoint::Endpoint;
pub use self::error::{Error, Result};
pub use self::mem::{MemAccess, MemHandle};
pub use self::msgbuf::MsgBuf;
pub use self::op::{OpCallback, OpId, OpOutcome, OpOutput};
pub use self::rpc::{Request, Rpc};

#[cfg(test)]
mod tests;
