//! In-process message fabric backing every communicator.
//!
//! Each rank of a [`Universe`](crate::Universe) runs on its own thread and owns
//! one inbox. Senders never block (mailboxes are unbounded), so a symmetric
//! shift where every rank sends before it receives cannot deadlock.
//!
//! Besides data, the fabric carries two control messages: an abort notice that
//! fails every later operation on the receiving rank, and a departure notice
//! so a rank blocked on a peer that already returned gets
//! [`Error::PeerExited`] instead of waiting forever.

use crate::datatype::Payload;
use crate::error::{Error, Result};
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::sync::Arc;

/// Communication context of the world communicator.
pub(crate) const WORLD_CONTEXT: u32 = 0;

pub(crate) enum Body {
    Data(Payload),
    Abort { origin: i32, code: i32 },
    Departed,
}

pub(crate) struct Envelope {
    context: u32,
    source: i32,
    tag: i32,
    body: Body,
}

impl Envelope {
    fn matches(&self, context: u32, source: i32, tag: i32) -> bool {
        self.context == context && self.source == source && self.tag == tag
    }
}

/// Shared state of one universe: a sender per rank and the abort verdict.
pub(crate) struct Fabric {
    mailboxes: Vec<Sender<Envelope>>,
    abort: Mutex<Option<(i32, i32)>>,
}

impl Fabric {
    /// Create a fabric with `size` mailboxes, returning the matching inboxes.
    pub(crate) fn new(size: usize) -> (Arc<Self>, Vec<Receiver<Envelope>>) {
        let (mailboxes, inboxes): (Vec<_>, Vec<_>) = (0..size).map(|_| unbounded()).unzip();
        let fabric = Fabric {
            mailboxes,
            abort: Mutex::new(None),
        };
        (Arc::new(fabric), inboxes)
    }

    pub(crate) fn size(&self) -> usize {
        self.mailboxes.len()
    }

    fn aborted(&self) -> Option<Error> {
        let state = *self.abort.lock();
        state.map(|(origin, code)| Error::Aborted { origin, code })
    }

    fn post(&self, dest: i32, envelope: Envelope) -> Result<()> {
        let mailbox = self
            .mailboxes
            .get(dest as usize)
            .ok_or(Error::InvalidRank(dest))?;
        mailbox
            .send(envelope)
            .map_err(|_| Error::PeerExited(dest))
    }

    /// Record an abort and notify every rank. Only the first abort wins.
    pub(crate) fn abort(&self, origin: i32, code: i32) -> Error {
        let mut state = self.abort.lock();
        if let Some((origin, code)) = *state {
            return Error::Aborted { origin, code };
        }
        *state = Some((origin, code));
        drop(state);

        tracing::warn!(origin, code, "collective abort");
        for mailbox in &self.mailboxes {
            // A rank that already returned has nothing left to cancel.
            let _ = mailbox.send(Envelope {
                context: WORLD_CONTEXT,
                source: origin,
                tag: 0,
                body: Body::Abort { origin, code },
            });
        }
        Error::Aborted { origin, code }
    }

    /// Tell every other rank that `rank` will not send anything more.
    pub(crate) fn depart(&self, rank: i32) {
        for (dest, mailbox) in self.mailboxes.iter().enumerate() {
            if dest as i32 == rank {
                continue;
            }
            let _ = mailbox.send(Envelope {
                context: WORLD_CONTEXT,
                source: rank,
                tag: 0,
                body: Body::Departed,
            });
        }
    }
}

/// One rank's view of the fabric. Owned by the rank's thread only.
pub(crate) struct Endpoint {
    rank: i32,
    fabric: Arc<Fabric>,
    inbox: Receiver<Envelope>,
    pending: RefCell<VecDeque<Envelope>>,
    departed: RefCell<Vec<bool>>,
    aborted: Cell<Option<(i32, i32)>>,
    next_context: Cell<u32>,
}

impl Endpoint {
    pub(crate) fn new(rank: i32, fabric: Arc<Fabric>, inbox: Receiver<Envelope>) -> Self {
        let size = fabric.size();
        Endpoint {
            rank,
            fabric,
            inbox,
            pending: RefCell::new(VecDeque::new()),
            departed: RefCell::new(vec![false; size]),
            aborted: Cell::new(None),
            next_context: Cell::new(WORLD_CONTEXT + 1),
        }
    }

    pub(crate) fn rank(&self) -> i32 {
        self.rank
    }

    pub(crate) fn size(&self) -> i32 {
        self.fabric.size() as i32
    }

    /// Next communication context. Every rank allocates contexts in the same
    /// collective order, so the values agree without any exchange.
    pub(crate) fn allocate_context(&self) -> u32 {
        let context = self.next_context.get();
        self.next_context.set(context + 1);
        context
    }

    fn check_aborted(&self) -> Result<()> {
        if let Some((origin, code)) = self.aborted.get() {
            return Err(Error::Aborted { origin, code });
        }
        Ok(())
    }

    pub(crate) fn send(&self, context: u32, dest: i32, tag: i32, payload: Payload) -> Result<()> {
        self.check_aborted()?;
        if let Some(err) = self.fabric.aborted() {
            return Err(err);
        }
        self.fabric.post(
            dest,
            Envelope {
                context,
                source: self.rank,
                tag,
                body: Body::Data(payload),
            },
        )
    }

    /// Block until a message from `source` with `tag` arrives on `context`.
    ///
    /// Messages for other (context, source, tag) triples are queued in arrival
    /// order, so matching is non-overtaking per sender.
    pub(crate) fn recv(&self, context: u32, source: i32, tag: i32) -> Result<Payload> {
        {
            let mut pending = self.pending.borrow_mut();
            if let Some(pos) = pending.iter().position(|e| e.matches(context, source, tag)) {
                if let Some(Envelope {
                    body: Body::Data(payload),
                    ..
                }) = pending.remove(pos)
                {
                    return Ok(payload);
                }
            }
        }
        self.check_aborted()?;
        if self.has_departed(source) {
            return Err(Error::PeerExited(source));
        }

        loop {
            let Envelope {
                context: got_context,
                source: got_source,
                tag: got_tag,
                body,
            } = self
                .inbox
                .recv()
                .map_err(|_| Error::Internal("fabric closed".into()))?;
            match body {
                Body::Data(payload)
                    if (got_context, got_source, got_tag) == (context, source, tag) =>
                {
                    return Ok(payload);
                }
                Body::Data(payload) => self.pending.borrow_mut().push_back(Envelope {
                    context: got_context,
                    source: got_source,
                    tag: got_tag,
                    body: Body::Data(payload),
                }),
                Body::Abort { origin, code } => {
                    self.aborted.set(Some((origin, code)));
                    return Err(Error::Aborted { origin, code });
                }
                Body::Departed => {
                    self.mark_departed(got_source);
                    if got_source == source {
                        return Err(Error::PeerExited(source));
                    }
                }
            }
        }
    }

    pub(crate) fn abort(&self, code: i32) -> Error {
        let err = self.fabric.abort(self.rank, code);
        if let Error::Aborted { origin, code } = err {
            self.aborted.set(Some((origin, code)));
        }
        err
    }

    /// Announce that this rank will not send anything more.
    pub(crate) fn depart(&self) {
        self.fabric.depart(self.rank);
    }

    fn has_departed(&self, rank: i32) -> bool {
        self.departed
            .borrow()
            .get(rank as usize)
            .copied()
            .unwrap_or(false)
    }

    fn mark_departed(&self, rank: i32) {
        if let Some(flag) = self.departed.borrow_mut().get_mut(rank as usize) {
            *flag = true;
        }
    }
}
