//! The actor: an event dispatcher, an identity, a mailbox, and a table of
//! links to peer actors with per-peer outgoing queues.
//!
//! [`ThreadMessager`] implements the link/unlink handshake and the stop
//! drain. Everything except the [`Inbox`] is owned by the actor's current
//! owning thread and is mutated without locks.
//!
//! # Link handshake
//!
//! 1. A calls `link(B)`: A's table is untouched; `RequestLink(A)` goes into
//!    B's mailbox.
//! 2. B processes `RequestLink`: unless stopping, B replies
//!    `ConfirmLink(B)`, inserts A and raises `PeerLinked(A)`.
//! 3. A processes `ConfirmLink`: A inserts B and raises `PeerLinked(B)`.
//!
//! Unlinking mirrors this with `RequestUnlink` / `ConfirmUnlink`. Stopping
//! sends `RequestUnlink` to every peer and raises `MessagerStopped` once
//! the table is empty at the end of [`process_outgoing`].
//!
//! [`process_outgoing`]: ThreadMessager::process_outgoing

use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use smallvec::SmallVec;

use tether_core::{
    Event, EventDispatcher, EventKind, Identity, LinkError, Message, NotLinkedError,
    NotSubscribedError, OwnershipError, Payload, Priority, SubscriptionId, ThreadToken,
};

use crate::mailbox::{Control, Inbox, PeerRef, ThreadMessage};

/// Resolves an identity to a live actor's reply address.
///
/// Implemented by the simulation registry so actors can link by identity
/// without holding the registry itself.
pub trait PeerDirectory<M>: Send + Sync {
    /// The peer registered under `id`, if any.
    fn resolve(&self, id: Identity) -> Option<PeerRef<M>>;
}

struct LinkedPeer<M> {
    peer: PeerRef<M>,
    outgoing: Vec<ThreadMessage<M>>,
}

impl<M> LinkedPeer<M> {
    fn new(peer: PeerRef<M>) -> Self {
        Self {
            peer,
            outgoing: Vec::new(),
        }
    }
}

// ── MessagerContext ───────────────────────────────────────────────

/// Actor state handed mutably to every subscriber callback.
///
/// Callbacks use it to send to peers, change links, or request a stop
/// while the dispatcher that invoked them is borrowed.
pub struct MessagerContext<M, W> {
    identity: Identity,
    inbox: Arc<Inbox<M>>,
    links: IndexMap<Identity, LinkedPeer<M>>,
    /// Raised right after the current dispatch returns.
    pending: SmallVec<[Event<M>; 4]>,
    /// Raised at the start of the next `process_incoming`.
    queued: Vec<Event<M>>,
    keep_looping: bool,
    directory: Option<Arc<dyn PeerDirectory<M>>>,
    world: W,
}

impl<M: Payload, W> MessagerContext<M, W> {
    /// This actor's identity.
    pub fn identity(&self) -> Identity {
        self.identity
    }

    /// User state attached to the actor.
    pub fn world(&self) -> &W {
        &self.world
    }

    /// Mutable user state attached to the actor.
    pub fn world_mut(&mut self) -> &mut W {
        &mut self.world
    }

    /// Whether the stop drain is in progress.
    pub fn is_stopping(&self) -> bool {
        self.inbox.is_stopping()
    }

    /// Whether `peer` is in the local link table.
    pub fn is_linked(&self, peer: Identity) -> bool {
        self.links.contains_key(&peer)
    }

    /// Number of linked peers.
    pub fn link_count(&self) -> usize {
        self.links.len()
    }

    /// Linked peers in link order.
    pub fn linked_peers(&self) -> impl Iterator<Item = Identity> + '_ {
        self.links.keys().copied()
    }

    /// Whether the tick loop should keep running.
    pub fn keep_looping(&self) -> bool {
        self.keep_looping
    }

    /// Ask the enclosing tick loop to exit after the current tick.
    pub fn stop_looping(&mut self) {
        self.keep_looping = false;
    }

    /// Defer `event` to the start of the next `process_incoming`.
    pub fn post_queued(&mut self, event: Event<M>) {
        self.queued.push(event);
    }

    fn owned_by_caller(&self) -> bool {
        self.inbox.owner().owned_by_caller()
    }

    /// Queue `payload` for `target`, sent as this actor.
    pub fn post_to_other(&mut self, target: Identity, payload: M) -> Result<(), NotLinkedError> {
        let message = Message::new(self.identity, payload);
        self.forward_to_other(target, message)
    }

    /// Queue an existing message for `target`. The message keeps its
    /// original sender.
    pub fn forward_to_other(
        &mut self,
        target: Identity,
        message: Message<M>,
    ) -> Result<(), NotLinkedError> {
        debug_assert!(self.owned_by_caller(), "post_to_other from non-owner");
        match self.links.get_mut(&target) {
            Some(linked) => {
                linked.outgoing.push(ThreadMessage::Deliver(message));
                Ok(())
            }
            None => {
                log::warn!("{} tried to send to unlinked {target}", self.identity);
                Err(NotLinkedError { target })
            }
        }
    }

    /// Queue several payloads for `target`, preserving their order.
    pub fn post_many_to_other<I>(&mut self, target: Identity, payloads: I) -> Result<(), NotLinkedError>
    where
        I: IntoIterator<Item = M>,
    {
        debug_assert!(self.owned_by_caller(), "post_many_to_other from non-owner");
        let sender = self.identity;
        match self.links.get_mut(&target) {
            Some(linked) => {
                linked.outgoing.extend(
                    payloads
                        .into_iter()
                        .map(|p| ThreadMessage::Deliver(Message::new(sender, p))),
                );
                Ok(())
            }
            None => {
                log::warn!("{sender} tried to send to unlinked {target}");
                Err(NotLinkedError { target })
            }
        }
    }

    /// Queue one shared message for every linked peer. Returns the number
    /// of recipients.
    pub fn broadcast(&mut self, payload: M) -> usize {
        debug_assert!(self.owned_by_caller(), "broadcast from non-owner");
        let message = Message::new(self.identity, payload);
        for linked in self.links.values_mut() {
            linked.outgoing.push(ThreadMessage::Deliver(message.clone()));
        }
        self.links.len()
    }

    /// Start the link handshake with `peer`.
    pub fn link(&mut self, peer: &PeerRef<M>) -> Result<(), LinkError> {
        if !self.owned_by_caller() {
            log::error!("{} link() from {}, not the owner", self.identity, ThreadToken::current());
            return Err(LinkError::NotOwner);
        }
        let id = peer.id();
        if id == self.identity {
            return Err(LinkError::SelfLink);
        }
        if self.is_stopping() {
            return Err(LinkError::Stopping);
        }
        if self.links.contains_key(&id) {
            return Err(LinkError::AlreadyLinked { peer: id });
        }
        let inbox = peer.resolve().ok_or(LinkError::PeerGone { peer: id })?;
        inbox
            .post_from_other(ThreadMessage::RequestLink(self.inbox.peer_ref()))
            .map_err(|_| LinkError::PeerGone { peer: id })?;
        log::debug!("{} requested link to {id}", self.identity);
        Ok(())
    }

    /// Start the link handshake with the peer registered under `id`.
    pub fn link_id(&mut self, id: Identity) -> Result<(), LinkError> {
        if id == self.identity {
            return Err(LinkError::SelfLink);
        }
        let peer = self
            .directory
            .as_ref()
            .and_then(|d| d.resolve(id))
            .ok_or(LinkError::UnknownPeer { peer: id })?;
        self.link(&peer)
    }

    /// Start the unlink handshake with `peer`.
    pub fn unlink(&mut self, peer: Identity) -> Result<(), LinkError> {
        if !self.owned_by_caller() {
            log::error!("{} unlink() from {}, not the owner", self.identity, ThreadToken::current());
            return Err(LinkError::NotOwner);
        }
        if peer == self.identity {
            return Err(LinkError::SelfLink);
        }
        if !self.links.contains_key(&peer) {
            return Err(LinkError::NotLinked { peer });
        }
        self.request_unlink(peer);
        Ok(())
    }

    /// Begin the stop drain: refuse new links and ask every peer to
    /// unlink. Idempotent.
    pub fn request_stop(&mut self) {
        if self.is_stopping() {
            return;
        }
        self.inbox.set_stopping(true);
        log::debug!("{} stopping with {} link(s)", self.identity, self.links.len());
        let peers: SmallVec<[Identity; 8]> = self.links.keys().copied().collect();
        for id in peers {
            self.request_unlink(id);
        }
    }

    /// Send `RequestUnlink` to a linked peer, flushing what is still owed
    /// to it first. A peer that can no longer be reached is unlinked
    /// locally.
    fn request_unlink(&mut self, id: Identity) {
        let me = self.inbox.peer_ref();
        let Some(linked) = self.links.get_mut(&id) else {
            return;
        };
        let sent = match linked.peer.resolve() {
            Some(inbox) => {
                inbox.post_batch_from_other(&mut linked.outgoing)
                    && inbox
                        .post_from_other(ThreadMessage::RequestUnlink(me))
                        .is_ok()
            }
            None => false,
        };
        if sent {
            log::debug!("{} requested unlink from {id}", self.identity);
        } else {
            log::warn!("{} cannot reach {id}; unlinking locally", self.identity);
            self.drop_link(id);
            self.pending.push(Event::PeerUnlinked(id));
        }
    }

    /// Remove `id` from the table, handing any unsent messages to it first.
    fn drop_link(&mut self, id: Identity) -> bool {
        let Some(mut linked) = self.links.shift_remove(&id) else {
            return false;
        };
        if !linked.outgoing.is_empty() {
            let unsent = linked.outgoing.len();
            let delivered = linked
                .peer
                .resolve()
                .is_some_and(|inbox| inbox.post_batch_from_other(&mut linked.outgoing));
            if !delivered {
                log::warn!("{} dropped {unsent} message(s) for {id}", self.identity);
            }
        }
        true
    }
}

// ── ThreadMessager ────────────────────────────────────────────────

/// A message-passing actor owned by one thread at a time.
///
/// `W` is user state reachable from every callback through
/// [`MessagerContext::world_mut`].
pub struct ThreadMessager<M: Payload, W = ()> {
    dispatcher: EventDispatcher<Event<M>, MessagerContext<M, W>>,
    ctx: MessagerContext<M, W>,
    /// Second half of the mailbox double buffer.
    incoming: Vec<ThreadMessage<M>>,
}

impl<M: Payload, W> ThreadMessager<M, W> {
    /// A new actor with a random identity.
    pub fn new(world: W) -> Self {
        Self::with_identity(Identity::generate(), world)
    }

    /// A new actor with a fixed identity.
    pub fn with_identity(identity: Identity, world: W) -> Self {
        Self {
            dispatcher: EventDispatcher::new(),
            ctx: MessagerContext {
                identity,
                inbox: Inbox::new(identity),
                links: IndexMap::new(),
                pending: SmallVec::new(),
                queued: Vec::new(),
                keep_looping: true,
                directory: None,
                world,
            },
            incoming: Vec::new(),
        }
    }

    /// This actor's identity.
    pub fn identity(&self) -> Identity {
        self.ctx.identity
    }

    /// The mailbox, shareable with any thread.
    pub fn inbox(&self) -> &Arc<Inbox<M>> {
        &self.ctx.inbox
    }

    /// A reply address for other actors.
    pub fn peer_ref(&self) -> PeerRef<M> {
        self.ctx.inbox.peer_ref()
    }

    /// Install the directory used by [`link_id`](Self::link_id).
    pub fn set_directory(&mut self, directory: Arc<dyn PeerDirectory<M>>) {
        self.ctx.directory = Some(directory);
    }

    /// Actor state as seen by callbacks.
    pub fn context(&self) -> &MessagerContext<M, W> {
        &self.ctx
    }

    /// Mutable actor state.
    pub fn context_mut(&mut self) -> &mut MessagerContext<M, W> {
        &mut self.ctx
    }

    /// User state.
    pub fn world(&self) -> &W {
        &self.ctx.world
    }

    /// Mutable user state.
    pub fn world_mut(&mut self) -> &mut W {
        &mut self.ctx.world
    }

    /// Subscribe `callback` to events of `kind`.
    pub fn subscribe<F>(
        &mut self,
        kind: EventKind<M::Kind>,
        priority: Priority,
        callback: F,
    ) -> SubscriptionId
    where
        F: FnMut(&mut MessagerContext<M, W>, &Event<M>) + Send + 'static,
    {
        self.dispatcher.subscribe(kind, priority, callback)
    }

    /// Remove a subscription.
    pub fn unsubscribe(
        &mut self,
        kind: EventKind<M::Kind>,
        id: SubscriptionId,
    ) -> Result<(), NotSubscribedError> {
        self.dispatcher.unsubscribe(kind, id)
    }

    /// Number of subscribers for `kind`.
    pub fn subscriber_count(&self, kind: EventKind<M::Kind>) -> usize {
        self.dispatcher.subscriber_count(kind)
    }

    /// Raise `event` to subscribers now.
    pub fn post_event(&mut self, event: Event<M>) {
        self.dispatch(&event);
    }

    /// Raise `event` at the start of the next `process_incoming`.
    pub fn post_queued(&mut self, event: Event<M>) {
        self.dispatcher.post_queued(event);
    }

    /// Deliver a message that did not come over a link.
    ///
    /// When the calling thread owns the actor the message is dispatched
    /// immediately; otherwise it goes through the mailbox. Returns `false`
    /// if the mailbox is closed.
    pub fn post_from_unattested(&mut self, message: Message<M>) -> bool {
        if self.ctx.owned_by_caller() {
            self.dispatch(&Event::Message(message));
            true
        } else {
            self.ctx.inbox.post_unattested(message)
        }
    }

    /// See [`MessagerContext::post_to_other`].
    pub fn post_to_other(&mut self, target: Identity, payload: M) -> Result<(), NotLinkedError> {
        self.ctx.post_to_other(target, payload)
    }

    /// See [`MessagerContext::post_many_to_other`].
    pub fn post_many_to_other<I>(&mut self, target: Identity, payloads: I) -> Result<(), NotLinkedError>
    where
        I: IntoIterator<Item = M>,
    {
        self.ctx.post_many_to_other(target, payloads)
    }

    /// See [`MessagerContext::broadcast`].
    pub fn broadcast(&mut self, payload: M) -> usize {
        self.ctx.broadcast(payload)
    }

    /// See [`MessagerContext::link`].
    pub fn link(&mut self, peer: &PeerRef<M>) -> Result<(), LinkError> {
        self.ctx.link(peer)
    }

    /// See [`MessagerContext::link_id`].
    pub fn link_id(&mut self, id: Identity) -> Result<(), LinkError> {
        self.ctx.link_id(id)
    }

    /// See [`MessagerContext::unlink`].
    pub fn unlink(&mut self, peer: Identity) -> Result<(), LinkError> {
        let result = self.ctx.unlink(peer);
        self.flush_pending();
        result
    }

    /// See [`MessagerContext::request_stop`].
    pub fn request_stop(&mut self) {
        self.ctx.request_stop();
        self.flush_pending();
    }

    /// Whether the stop drain is in progress.
    pub fn is_stopping(&self) -> bool {
        self.ctx.is_stopping()
    }

    /// Whether `peer` is in the local link table.
    pub fn is_linked(&self, peer: Identity) -> bool {
        self.ctx.is_linked(peer)
    }

    /// Number of linked peers.
    pub fn link_count(&self) -> usize {
        self.ctx.link_count()
    }

    /// Linked peers in link order.
    pub fn linked_peers(&self) -> impl Iterator<Item = Identity> + '_ {
        self.ctx.linked_peers()
    }

    /// Whether the tick loop should keep running.
    pub fn keep_looping(&self) -> bool {
        self.ctx.keep_looping
    }

    fn check_owner(&self, op: &str) -> bool {
        let owned = self.ctx.owned_by_caller();
        if !owned {
            log::error!(
                "{op} on {} from {}, owner is {:?}",
                self.ctx.identity,
                ThreadToken::current(),
                self.ctx.inbox.owner().owner()
            );
        }
        debug_assert!(owned, "{op} called from a thread that does not own the actor");
        owned
    }

    fn dispatch(&mut self, event: &Event<M>) {
        self.dispatcher.post(&mut self.ctx, event);
        self.flush_pending();
    }

    fn flush_pending(&mut self) {
        while !self.ctx.pending.is_empty() {
            let pending = std::mem::take(&mut self.ctx.pending);
            for event in &pending {
                self.dispatcher.post(&mut self.ctx, event);
            }
        }
    }

    /// Run deferred events, then drain the mailbox in FIFO order.
    pub fn process_incoming(&mut self) {
        if !self.check_owner("process_incoming") {
            return;
        }
        for event in self.ctx.queued.drain(..) {
            self.dispatcher.post_queued(event);
        }
        self.dispatcher.process_queue(&mut self.ctx);
        self.flush_pending();

        let mut incoming = std::mem::take(&mut self.incoming);
        self.ctx.inbox.take_all(&mut incoming);
        for envelope in incoming.drain(..) {
            self.handle(envelope);
        }
        self.incoming = incoming;
    }

    /// Hand each peer's outgoing queue to its mailbox. Raises
    /// `MessagerStopped` once a stopping actor has no links left.
    pub fn process_outgoing(&mut self) {
        if !self.check_owner("process_outgoing") {
            return;
        }
        let me = self.ctx.identity;
        let mut lost: SmallVec<[Identity; 4]> = SmallVec::new();
        for (id, linked) in self.ctx.links.iter_mut() {
            if linked.outgoing.is_empty() {
                continue;
            }
            let delivered = linked
                .peer
                .resolve()
                .is_some_and(|inbox| inbox.post_batch_from_other(&mut linked.outgoing));
            if !delivered {
                log::warn!(
                    "{me} dropping {} message(s) for unreachable peer {id}",
                    linked.outgoing.len()
                );
                linked.outgoing.clear();
                lost.push(*id);
            }
        }
        for id in lost {
            self.ctx.links.shift_remove(&id);
            self.dispatch(&Event::PeerUnlinked(id));
        }

        if self.ctx.is_stopping() && self.ctx.links.is_empty() {
            log::debug!("{me} drained all links");
            self.dispatch(&Event::MessagerStopped);
        }
    }

    fn handle(&mut self, envelope: ThreadMessage<M>) {
        match envelope {
            ThreadMessage::RequestLink(peer) => self.on_request_link(peer),
            ThreadMessage::ConfirmLink(peer) => self.on_confirm_link(peer),
            ThreadMessage::RequestUnlink(peer) => self.on_request_unlink(peer),
            ThreadMessage::ConfirmUnlink(peer) => self.on_confirm_unlink(peer),
            ThreadMessage::Deliver(message) => self.dispatch(&Event::Message(message)),
            ThreadMessage::Control(Control::RequestStop) => {
                self.dispatch(&Event::StopRequested);
                self.request_stop();
            }
            ThreadMessage::Control(Control::AcquireRequested) => {
                self.dispatch(&Event::AcquireRequested);
            }
            ThreadMessage::Control(Control::AttemptFreeMemory) => {
                self.shrink_to_fit();
                self.dispatch(&Event::AttemptFreeMemory);
            }
        }
    }

    fn on_request_link(&mut self, peer: PeerRef<M>) {
        let me = self.ctx.identity;
        let id = peer.id();
        if id == me {
            log::warn!("{me} ignoring link request from itself");
            return;
        }
        if self.ctx.is_stopping() {
            log::debug!("{me} rejected link from {id}: stopping");
            return;
        }
        let Some(inbox) = peer.resolve() else {
            log::debug!("{me} rejected link from {id}: requester gone");
            return;
        };
        if inbox
            .post_from_other(ThreadMessage::ConfirmLink(self.ctx.inbox.peer_ref()))
            .is_err()
        {
            log::debug!("{me} rejected link from {id}: requester closed");
            return;
        }
        if self.ctx.links.contains_key(&id) {
            log::debug!("{me} re-confirmed existing link to {id}");
            return;
        }
        self.ctx.links.insert(id, LinkedPeer::new(peer));
        log::debug!("{me} linked {id} (requested)");
        self.dispatch(&Event::PeerLinked(id));
    }

    fn on_confirm_link(&mut self, peer: PeerRef<M>) {
        let me = self.ctx.identity;
        let id = peer.id();
        if self.ctx.links.contains_key(&id) {
            log::debug!("{me} already linked to {id}");
            return;
        }
        self.ctx.links.insert(id, LinkedPeer::new(peer));
        log::debug!("{me} linked {id} (confirmed)");
        self.dispatch(&Event::PeerLinked(id));
        if self.ctx.is_stopping() {
            log::debug!("{me} link to {id} confirmed while stopping; unlinking");
            self.ctx.request_unlink(id);
            self.flush_pending();
        }
    }

    fn on_request_unlink(&mut self, peer: PeerRef<M>) {
        let me = self.ctx.identity;
        let id = peer.id();
        if self.ctx.drop_link(id) {
            log::debug!("{me} unlinked {id} (requested)");
            self.dispatch(&Event::PeerUnlinked(id));
        } else {
            log::debug!("{me} got unlink request from unlinked {id}; confirming anyway");
        }
        let confirmed = peer.resolve().is_some_and(|inbox| {
            inbox
                .post_from_other(ThreadMessage::ConfirmUnlink(self.ctx.inbox.peer_ref()))
                .is_ok()
        });
        if !confirmed {
            log::debug!("{me} could not confirm unlink to {id}");
        }
    }

    fn on_confirm_unlink(&mut self, peer: PeerRef<M>) {
        let me = self.ctx.identity;
        let id = peer.id();
        if self.ctx.drop_link(id) {
            log::debug!("{me} unlinked {id} (confirmed)");
            self.dispatch(&Event::PeerUnlinked(id));
        } else {
            log::debug!("{me} got unlink confirmation from unlinked {id}");
        }
    }

    /// Claim the actor for the calling thread and open the mailbox.
    pub fn messager_start(&mut self) -> Result<(), OwnershipError> {
        self.ctx.inbox.owner().claim()?;
        self.ctx.inbox.open();
        self.ctx.inbox.set_stopping(false);
        self.ctx.keep_looping = true;
        log::debug!("{} claimed by {}", self.ctx.identity, ThreadToken::current());
        Ok(())
    }

    /// Close the mailbox, settle whatever handshakes were still in it,
    /// and release the actor.
    ///
    /// Leftover `RequestUnlink`s are confirmed and leftover `ConfirmLink`s
    /// are answered with `RequestUnlink`, so no peer is left holding a
    /// link to a closed actor. Any links still in the table are dropped.
    pub fn messager_stop(&mut self) {
        if !self.check_owner("messager_stop") {
            return;
        }
        let me = self.ctx.identity;
        let reply_to = self.ctx.inbox.peer_ref();
        let mut dropped = 0usize;
        for envelope in self.ctx.inbox.close() {
            let (peer, reply) = match envelope {
                ThreadMessage::RequestUnlink(peer) => {
                    (peer, ThreadMessage::ConfirmUnlink(reply_to.clone()))
                }
                ThreadMessage::ConfirmLink(peer) => {
                    (peer, ThreadMessage::RequestUnlink(reply_to.clone()))
                }
                ThreadMessage::Deliver(_) => {
                    dropped += 1;
                    continue;
                }
                ThreadMessage::RequestLink(_)
                | ThreadMessage::ConfirmUnlink(_)
                | ThreadMessage::Control(_) => continue,
            };
            if let Some(inbox) = peer.resolve() {
                let _ = inbox.post_from_other(reply);
            }
        }
        if dropped > 0 {
            log::warn!("{me} dropped {dropped} undelivered message(s) on stop");
        }

        if !self.ctx.links.is_empty() {
            log::warn!("{me} stopped with {} live link(s)", self.ctx.links.len());
            let peers: SmallVec<[Identity; 8]> = self.ctx.links.keys().copied().collect();
            for id in peers {
                self.ctx.request_unlink(id);
                if self.ctx.drop_link(id) {
                    self.dispatch(&Event::PeerUnlinked(id));
                }
            }
            self.flush_pending();
        }

        self.ctx.inbox.set_stopping(false);
        self.ctx.keep_looping = false;
        if self.ctx.inbox.owner().is_owned() {
            if let Err(e) = self.ctx.inbox.owner().release() {
                log::error!("{me} could not release ownership: {e}");
            }
        }
        log::debug!("{me} released");
    }

    /// Release spare capacity in every queue.
    pub fn shrink_to_fit(&mut self) {
        self.dispatcher.shrink_to_fit();
        self.incoming.shrink_to_fit();
        self.ctx.inbox.shrink_to_fit();
        for linked in self.ctx.links.values_mut() {
            linked.outgoing.shrink_to_fit();
        }
        self.ctx.links.shrink_to_fit();
        self.ctx.pending.shrink_to_fit();
        self.ctx.queued.shrink_to_fit();
    }
}

impl<M: Payload, W> fmt::Debug for ThreadMessager<M, W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadMessager")
            .field("identity", &self.ctx.identity)
            .field("links", &self.ctx.links.len())
            .field("stopping", &self.ctx.is_stopping())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    enum Note {
        Num(u32),
        Text(&'static str),
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    enum NoteKind {
        Num,
        Text,
    }

    impl Payload for Note {
        type Kind = NoteKind;
        fn kind(&self) -> NoteKind {
            match self {
                Note::Num(_) => NoteKind::Num,
                Note::Text(_) => NoteKind::Text,
            }
        }
    }

    #[derive(Clone, Debug, PartialEq)]
    enum Seen {
        Linked(Identity),
        Unlinked(Identity),
        Num(Identity, u32),
        Stopped,
        Freed,
        Custom,
    }

    type Log = Vec<Seen>;
    type Actor = ThreadMessager<Note, Log>;

    fn actor(n: u64) -> Actor {
        let mut m = Actor::with_identity(Identity::from_parts(0, n), Log::new());
        m.subscribe(EventKind::PeerLinked, Priority::NORMAL, |ctx, ev| {
            if let Event::PeerLinked(id) = ev {
                ctx.world_mut().push(Seen::Linked(*id));
            }
        });
        m.subscribe(EventKind::PeerUnlinked, Priority::NORMAL, |ctx, ev| {
            if let Event::PeerUnlinked(id) = ev {
                ctx.world_mut().push(Seen::Unlinked(*id));
            }
        });
        m.subscribe(
            EventKind::Message(NoteKind::Num),
            Priority::NORMAL,
            |ctx, ev| {
                if let Event::Message(msg) = ev {
                    if let Note::Num(n) = msg.payload() {
                        ctx.world_mut().push(Seen::Num(msg.sender(), *n));
                    }
                }
            },
        );
        m.subscribe(EventKind::MessagerStopped, Priority::NORMAL, |ctx, _| {
            ctx.world_mut().push(Seen::Stopped);
        });
        m.subscribe(EventKind::AttemptFreeMemory, Priority::NORMAL, |ctx, _| {
            ctx.world_mut().push(Seen::Freed);
        });
        m.messager_start().unwrap();
        m
    }

    fn pump(actors: &mut [&mut Actor]) {
        for _ in 0..8 {
            for a in actors.iter_mut() {
                a.process_incoming();
            }
            for a in actors.iter_mut() {
                a.process_outgoing();
            }
        }
    }

    fn linked_pair() -> (Actor, Actor) {
        let mut a = actor(1);
        let mut b = actor(2);
        a.link(&b.peer_ref()).unwrap();
        pump(&mut [&mut a, &mut b]);
        (a, b)
    }

    #[test]
    fn link_handshake_is_symmetric() {
        let mut a = actor(1);
        let mut b = actor(2);
        a.link(&b.peer_ref()).unwrap();
        assert!(!a.is_linked(b.identity()));

        b.process_incoming();
        assert!(b.is_linked(a.identity()));
        assert!(!a.is_linked(b.identity()));

        a.process_incoming();
        assert!(a.is_linked(b.identity()));
        assert_eq!(a.world(), &vec![Seen::Linked(b.identity())]);
        assert_eq!(b.world(), &vec![Seen::Linked(a.identity())]);
    }

    #[test]
    fn link_preconditions() {
        let (mut a, b) = linked_pair();
        assert_eq!(a.link(&a.peer_ref()), Err(LinkError::SelfLink));
        assert_eq!(
            a.link(&b.peer_ref()),
            Err(LinkError::AlreadyLinked { peer: b.identity() })
        );

        let gone = actor(3).peer_ref();
        assert_eq!(
            a.link(&gone),
            Err(LinkError::PeerGone { peer: gone.id() })
        );

        a.request_stop();
        let c = actor(4);
        assert_eq!(a.link(&c.peer_ref()), Err(LinkError::Stopping));
    }

    #[test]
    fn link_id_without_directory_is_unknown() {
        let mut a = actor(1);
        let id = Identity::from_parts(9, 9);
        assert_eq!(a.link_id(id), Err(LinkError::UnknownPeer { peer: id }));
        assert_eq!(a.link_id(a.identity()), Err(LinkError::SelfLink));
    }

    #[test]
    fn send_to_unlinked_fails() {
        let mut a = actor(1);
        let target = Identity::from_parts(0, 2);
        assert_eq!(
            a.post_to_other(target, Note::Num(1)),
            Err(NotLinkedError { target })
        );
        let me = a.identity();
        assert!(a.post_to_other(me, Note::Num(1)).is_err());
    }

    #[test]
    fn messages_arrive_in_send_order() {
        let (mut a, mut b) = linked_pair();
        let sender = a.identity();
        for n in 0..5 {
            a.post_to_other(b.identity(), Note::Num(n)).unwrap();
        }
        a.post_many_to_other(b.identity(), (5..10).map(Note::Num))
            .unwrap();
        pump(&mut [&mut a, &mut b]);
        let got: Vec<u32> = b
            .world()
            .iter()
            .filter_map(|s| match s {
                Seen::Num(from, n) if *from == sender => Some(*n),
                _ => None,
            })
            .collect();
        assert_eq!(got, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn broadcast_shares_one_message() {
        let mut a = actor(1);
        let mut b = actor(2);
        let mut c = actor(3);
        a.link(&b.peer_ref()).unwrap();
        a.link(&c.peer_ref()).unwrap();
        pump(&mut [&mut a, &mut b, &mut c]);
        assert_eq!(a.broadcast(Note::Num(42)), 2);
        pump(&mut [&mut a, &mut b, &mut c]);
        assert!(b.world().contains(&Seen::Num(a.identity(), 42)));
        assert!(c.world().contains(&Seen::Num(a.identity(), 42)));
    }

    #[test]
    fn unlink_handshake_is_symmetric() {
        let (mut a, mut b) = linked_pair();
        a.unlink(b.identity()).unwrap();
        assert!(a.is_linked(b.identity()));
        pump(&mut [&mut a, &mut b]);
        assert!(!a.is_linked(b.identity()));
        assert!(!b.is_linked(a.identity()));
        assert!(a.world().contains(&Seen::Unlinked(b.identity())));
        assert!(b.world().contains(&Seen::Unlinked(a.identity())));
        assert_eq!(
            a.unlink(b.identity()),
            Err(LinkError::NotLinked { peer: b.identity() })
        );
    }

    #[test]
    fn messages_queued_before_unlink_are_delivered() {
        let (mut a, mut b) = linked_pair();
        a.post_to_other(b.identity(), Note::Num(7)).unwrap();
        a.unlink(b.identity()).unwrap();
        pump(&mut [&mut a, &mut b]);
        assert!(b.world().contains(&Seen::Num(a.identity(), 7)));
    }

    #[test]
    fn stop_drains_every_link() {
        let mut a = actor(1);
        let mut b = actor(2);
        let mut c = actor(3);
        a.link(&b.peer_ref()).unwrap();
        c.link(&a.peer_ref()).unwrap();
        pump(&mut [&mut a, &mut b, &mut c]);
        assert_eq!(a.link_count(), 2);

        a.request_stop();
        a.request_stop();
        assert!(a.is_stopping());
        pump(&mut [&mut a, &mut b, &mut c]);
        assert_eq!(a.link_count(), 0);
        assert_eq!(b.link_count(), 0);
        assert_eq!(c.link_count(), 0);
        assert!(a.world().contains(&Seen::Stopped));
        assert!(b.world().contains(&Seen::Unlinked(a.identity())));
        assert!(c.world().contains(&Seen::Unlinked(a.identity())));
    }

    #[test]
    fn stopping_actor_rejects_link_requests() {
        let mut a = actor(1);
        let mut b = actor(2);
        b.request_stop();
        a.link(&b.peer_ref()).unwrap();
        pump(&mut [&mut a, &mut b]);
        assert!(!a.is_linked(b.identity()));
        assert!(!b.is_linked(a.identity()));
    }

    #[test]
    fn stray_unlink_request_is_still_confirmed() {
        let mut a = actor(1);
        let mut b = actor(2);
        b.inbox()
            .post_from_other(ThreadMessage::RequestUnlink(a.peer_ref()))
            .unwrap();
        b.process_incoming();
        assert!(b.world().is_empty());
        let mut got = Vec::new();
        a.inbox().take_all(&mut got);
        assert!(matches!(got.as_slice(), [ThreadMessage::ConfirmUnlink(p)] if p.id() == b.identity()));
    }

    #[test]
    fn confirm_while_stopping_unlinks_immediately() {
        let mut a = actor(1);
        let mut b = actor(2);
        a.link(&b.peer_ref()).unwrap();
        b.process_incoming();
        a.request_stop();
        pump(&mut [&mut a, &mut b]);
        assert_eq!(a.link_count(), 0);
        assert_eq!(b.link_count(), 0);
        assert!(a.world().contains(&Seen::Stopped));
    }

    #[test]
    fn stop_settles_leftover_handshakes() {
        let mut a = actor(1);
        let mut b = actor(2);
        b.inbox()
            .post_from_other(ThreadMessage::RequestUnlink(a.peer_ref()))
            .unwrap();
        b.inbox()
            .post_from_other(ThreadMessage::Deliver(Message::new(a.identity(), Note::Num(1))))
            .unwrap();
        b.messager_stop();
        assert!(!b.inbox().is_open());
        assert!(!b.inbox().owner().is_owned());

        let mut got = Vec::new();
        a.inbox().take_all(&mut got);
        assert!(matches!(got.as_slice(), [ThreadMessage::ConfirmUnlink(_)]));
        assert!(a.link(&b.peer_ref()).is_err());
    }

    #[test]
    fn stop_with_live_links_unlinks_peers() {
        let (mut a, mut b) = linked_pair();
        a.messager_stop();
        assert_eq!(a.link_count(), 0);
        assert!(a.world().contains(&Seen::Unlinked(b.identity())));
        b.process_incoming();
        assert!(!b.is_linked(a.identity()));
    }

    #[test]
    fn freed_peer_is_unlinked_on_flush() {
        let (mut a, b) = linked_pair();
        let gone = b.identity();
        drop(b);
        a.post_to_other(gone, Note::Num(1)).unwrap();
        a.process_outgoing();
        assert!(!a.is_linked(gone));
        assert_eq!(a.world().last(), Some(&Seen::Unlinked(gone)));
    }

    #[test]
    fn unattested_from_owner_dispatches_immediately() {
        let mut a = actor(1);
        let sender = Identity::from_parts(7, 7);
        assert!(a.post_from_unattested(Message::new(sender, Note::Num(3))));
        assert_eq!(a.world(), &vec![Seen::Num(sender, 3)]);
        assert!(a.inbox().is_empty());
    }

    #[test]
    fn unattested_from_other_thread_waits_for_mailbox() {
        let mut a = actor(1);
        let inbox = Arc::clone(a.inbox());
        let sender = Identity::from_parts(7, 7);
        std::thread::spawn(move || {
            assert!(inbox.post_unattested(Message::new(sender, Note::Num(5))));
            assert!(inbox.post_many_unattested(vec![Message::new(sender, Note::Text("x"))]));
        })
        .join()
        .unwrap();
        assert!(a.world().is_empty());
        a.process_incoming();
        assert_eq!(a.world(), &vec![Seen::Num(sender, 5)]);
    }

    #[test]
    fn queued_events_run_at_next_incoming() {
        let mut a = actor(1);
        a.subscribe(EventKind::SimulationStart, Priority::NORMAL, |ctx, _| {
            ctx.world_mut().push(Seen::Custom);
            ctx.post_queued(Event::SimulationStop);
        });
        a.subscribe(EventKind::SimulationStop, Priority::NORMAL, |ctx, _| {
            ctx.world_mut().push(Seen::Custom);
        });
        a.post_queued(Event::SimulationStart);
        assert!(a.world().is_empty());
        a.process_incoming();
        assert_eq!(a.world().len(), 1);
        a.process_incoming();
        assert_eq!(a.world().len(), 2);
    }

    #[test]
    fn control_messages_raise_events() {
        let mut a = actor(1);
        a.inbox().post_control(Control::AttemptFreeMemory);
        a.inbox().post_control(Control::RequestStop);
        a.process_incoming();
        a.process_outgoing();
        assert_eq!(a.world(), &vec![Seen::Freed, Seen::Stopped]);
        assert!(a.is_stopping());
    }

    #[test]
    fn callbacks_can_reply_through_context() {
        let (mut a, mut b) = linked_pair();
        b.subscribe(EventKind::Message(NoteKind::Text), Priority::NORMAL, |ctx, ev| {
            if let Event::Message(msg) = ev {
                let _ = ctx.post_to_other(msg.sender(), Note::Num(99));
            }
        });
        a.post_to_other(b.identity(), Note::Text("ping")).unwrap();
        pump(&mut [&mut a, &mut b]);
        assert!(a.world().contains(&Seen::Num(b.identity(), 99)));
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "broadcast from non-owner")]
    fn broadcast_from_non_owner_asserts() {
        let mut a = Actor::with_identity(Identity::from_parts(0, 1), Log::new());
        let inbox = Arc::clone(a.inbox());
        std::thread::spawn(move || inbox.owner().claim().unwrap())
            .join()
            .unwrap();
        a.broadcast(Note::Num(1));
    }
}
