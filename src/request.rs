//! Pending RPC requests.

use std::sync::{Arc, Mutex, OnceLock};

use quanta::Instant;

use crate::proto::{Proto, ReqHandler};
use crate::svc::{CodecStream, Lookahead, RpcHeader};
use crate::xprt::Xprt;

/// Kind of a pending request, driving classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReqKind {
    /// Inbound client call.
    NfsRequest,

    /// Server-originated callback (NFSv4 CB path).
    NfsCall,

    /// 9P front-end request; classified low-latency.
    NineP,
}

/// One pending RPC.
///
/// Built by the decoder, mutated only while exclusively owned, then shared
/// via `Arc`: one reference for the queue, one for the decoding caller. The
/// codec stream and argument slots stay behind mutexes because only one
/// stage touches them at a time, and that is not visible to the type system.
pub struct Req {
    kind: ReqKind,
    proto: Proto,
    xprt: Arc<Xprt>,

    /// Codec state for this message; dropped with the request.
    stream: Mutex<Option<CodecStream>>,

    /// Decoded call header.
    pub(crate) header: RpcHeader,

    /// Classification hints from the partial decoder.
    pub(crate) lookahead: Lookahead,

    /// Handler resolved by the protocol validator.
    pub(crate) handler: Option<ReqHandler>,

    /// Decoded argument area, filled by the codec's checksum pass.
    arg: Mutex<Option<CodecStream>>,

    /// Stamped when the request goes on a queue.
    time_queued: OnceLock<Instant>,
}

impl Req {
    /// Allocate a request bound to `(xprt, stream)`.
    pub fn new(kind: ReqKind, xprt: Arc<Xprt>, stream: CodecStream) -> Self {
        Self {
            kind,
            proto: xprt.proto(),
            xprt,
            stream: Mutex::new(Some(stream)),
            header: RpcHeader::default(),
            lookahead: Lookahead::empty(),
            handler: None,
            arg: Mutex::new(None),
            time_queued: OnceLock::new(),
        }
    }

    #[inline]
    pub fn kind(&self) -> ReqKind {
        self.kind
    }

    #[inline]
    pub fn proto(&self) -> Proto {
        self.proto
    }

    #[inline]
    pub fn xprt(&self) -> &Arc<Xprt> {
        &self.xprt
    }

    #[inline]
    pub fn header(&self) -> &RpcHeader {
        &self.header
    }

    #[inline]
    pub fn lookahead(&self) -> Lookahead {
        self.lookahead
    }

    /// Run `f` over the codec stream, if still present.
    pub fn with_stream<R>(&self, f: impl FnOnce(&mut CodecStream) -> R) -> Option<R> {
        self.stream.lock().unwrap().as_mut().map(f)
    }

    /// Store the decoded argument area.
    pub fn set_arg(&self, arg: CodecStream) {
        *self.arg.lock().unwrap() = Some(arg);
    }

    /// Take the decoded argument area out of the request.
    pub fn take_arg(&self) -> Option<CodecStream> {
        self.arg.lock().unwrap().take()
    }

    /// Stamp the enqueue time. Later calls keep the first stamp.
    pub(crate) fn stamp_queued(&self) {
        let _ = self.time_queued.set(Instant::now());
    }

    /// Time spent queued so far, if the request was ever enqueued.
    pub fn queued_for(&self) -> Option<std::time::Duration> {
        self.time_queued.get().map(|t| t.elapsed())
    }
}

impl std::fmt::Debug for Req {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Req")
            .field("kind", &self.kind)
            .field("proto", &self.proto)
            .field("xid", &self.header.xid)
            .field("xprt", &self.xprt.id())
            .finish()
    }
}
