//! Bookkeeping for outstanding asynchronous operations.

use crate::addr::AddrId;
use crate::error::Result;
use crate::msgbuf::MsgBuf;
use crate::type_alias::Tag;

/// Identifier of a posted operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OpId(pub(crate) u64);

/// Kind-specific completion payload handed to the operation callback.
///
/// Buffers owned by the operation while it was outstanding travel back to
/// the caller here; a receive buffer's length is the actual delivered size.
pub enum OpOutput {
    Lookup { addr: AddrId },
    SendUnexpected { buf: MsgBuf },
    SendExpected { buf: MsgBuf },
    RecvUnexpected {
        buf: MsgBuf,
        /// Originating peer; absent when the operation never matched an
        /// arrival (e.g. it was cancelled).
        source: Option<AddrId>,
        tag: Tag,
    },
    RecvExpected { buf: MsgBuf },
    Put,
    Get,
}

/// Terminal outcome of an operation.
pub struct OpOutcome {
    pub result: Result<()>,
    pub output: OpOutput,
}

/// Completion callback attached to an operation at post time. Fired exactly
/// once, never under a runtime lock.
pub type OpCallback = Box<dyn FnOnce(OpOutcome) + Send>;

/// Kind tag plus payload of an outstanding operation.
pub(crate) enum OpKind {
    Lookup { addr: AddrId },
    SendUnexpected { buf: MsgBuf },
    SendExpected { buf: MsgBuf },
    RecvUnexpected { buf: MsgBuf },
    RecvExpected { tag: Tag, buf: MsgBuf },
    Put,
    Get,
}

/// A posted operation: its kind-specific payload and completion callback.
pub(crate) struct OpRecord {
    pub id: OpId,
    pub kind: OpKind,
    callback: Option<OpCallback>,
    completed: bool,
}

impl OpRecord {
    pub fn new(id: OpId, kind: OpKind, callback: OpCallback) -> Self {
        Self {
            id,
            kind,
            callback: Some(callback),
            completed: false,
        }
    }

    /// Deliver the terminal completion. `output` maps the operation payload
    /// (buffers included) into the callback-visible form. Consuming the
    /// record is what makes the false-to-true completion transition happen
    /// exactly once.
    pub fn finish(self, result: Result<()>, output: impl FnOnce(OpKind) -> OpOutput) {
        debug_assert!(!self.completed, "operation completed twice");
        let OpRecord { kind, callback, .. } = self;
        if let Some(cb) = callback {
            cb(OpOutcome {
                result,
                output: output(kind),
            });
        }
    }
}
