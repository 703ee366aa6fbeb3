//! # Handler Pipeline
//!
//! An ordered chain of duplex handlers between two immovable sentinels,
//! *head* and *tail*. Inbound events originate at the head and travel
//! toward the tail; outbound messages enter at the tail and travel toward
//! the head, where they are handed to the connection engine.
//!
//! The chain is an arena of nodes indexed by stable ids; `prev`/`next` are
//! ids, removal nulls both links, and slots are never reused, so a stale
//! context can be detected instead of aliasing a newer handler. Every
//! handler invocation runs inside a [`HandlerContext`] bound to its node;
//! `propagate_*` forwards the event to the next appropriate neighbour, and
//! a handler that does not call it consumes the event.
//!
//! Error policy: a failure raised by an inbound hook is re-dispatched to
//! the *same* handler's `handle_inbound_failure`; a failure from that hook,
//! or from any outbound hook, is a protocol violation that terminates the
//! connection (surfaced as an `Err` from the `fire_*` entry points).
//! Failures never cross the sentinels: the tail discards unhandled events.
//!
//! Propagation is synchronous on the connection's event loop; handlers must
//! not block. Mutating the chain from inside a propagation is allowed and
//! takes effect immediately; a removed context refuses further propagation.

use std::any::Any;

use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::message::Message;

/// Opaque payload for user-defined events traveling the pipeline.
pub type UserEvent = Box<dyn Any + Send>;

/// Events that travel inbound (head → tail).
#[derive(Debug)]
pub enum InboundEvent {
    /// A decoded message from the peer.
    Message(Message),
    /// A failure being offered to handlers before it tears anything down.
    Failure(Error),
    /// The connection became active (SASL + Hello complete).
    Active,
    /// The connection became inactive; no further messages will follow.
    Inactive,
    /// An application-defined event.
    User(UserEvent),
}

/// The capability set of a pipeline handler.
///
/// Every method has a propagating default, so a handler implements only
/// the hooks it cares about, exactly like extending an adapter class.
pub trait Handler: Send {
    /// Called right after the handler joins a pipeline.
    fn on_handler_added(&mut self, _ctx: &mut HandlerContext<'_>) -> Result<()> {
        Ok(())
    }

    /// Called right after the handler leaves a pipeline.
    fn on_handler_removed(&mut self, _ctx: &mut HandlerContext<'_>) -> Result<()> {
        Ok(())
    }

    fn handle_inbound_message(&mut self, ctx: &mut HandlerContext<'_>, msg: Message) -> Result<()> {
        ctx.propagate_inbound_message(msg)
    }

    fn handle_inbound_failure(&mut self, ctx: &mut HandlerContext<'_>, error: Error) -> Result<()> {
        ctx.propagate_inbound_failure(error)
    }

    fn on_connection_active(&mut self, ctx: &mut HandlerContext<'_>) -> Result<()> {
        ctx.propagate_connection_active()
    }

    fn on_connection_inactive(&mut self, ctx: &mut HandlerContext<'_>) -> Result<()> {
        ctx.propagate_connection_inactive()
    }

    fn handle_user_event(&mut self, ctx: &mut HandlerContext<'_>, event: UserEvent) -> Result<()> {
        ctx.propagate_user_event(event)
    }

    fn handle_outbound_message(
        &mut self,
        ctx: &mut HandlerContext<'_>,
        msg: Message,
    ) -> Result<()> {
        ctx.propagate_outbound_message(msg)
    }
}

type NodeId = usize;

struct Node {
    name: String,
    prev: Option<NodeId>,
    next: Option<NodeId>,
    /// Taken out while the handler runs, so the pipeline stays borrowable
    /// from inside the handler's context.
    handler: Option<Box<dyn Handler>>,
}

/// No-op handler occupying the sentinel slots. The dispatch loops stop at
/// the sentinel ids, so these hooks never run.
struct Sentinel;

impl Handler for Sentinel {}

/// The handler chain of one connection.
pub struct Pipeline {
    nodes: Vec<Option<Node>>,
    head: NodeId,
    tail: NodeId,
    /// Messages that reached the head during nested dispatches; the engine
    /// drains and writes them after every fire.
    outbound_ready: Vec<Message>,
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl Pipeline {
    pub fn new() -> Self {
        let head = Node {
            name: "head".to_owned(),
            prev: None,
            next: Some(1),
            handler: Some(Box::new(Sentinel)),
        };
        let tail = Node {
            name: "tail".to_owned(),
            prev: Some(0),
            next: None,
            handler: Some(Box::new(Sentinel)),
        };
        Pipeline {
            nodes: vec![Some(head), Some(tail)],
            head: 0,
            tail: 1,
            outbound_ready: Vec::new(),
        }
    }

    /// Insert a named handler just before the tail.
    pub fn add_last(&mut self, name: &str, handler: Box<dyn Handler>) -> Result<()> {
        if self.find(name).is_some() {
            return Err(Error::HandlerExists(name.to_owned()));
        }
        let id = self.nodes.len();
        let prev = self.node(self.tail).prev.expect("tail always has a prev");
        self.nodes.push(Some(Node {
            name: name.to_owned(),
            prev: Some(prev),
            next: Some(self.tail),
            handler: Some(handler),
        }));
        self.node_mut(prev).next = Some(id);
        self.node_mut(self.tail).prev = Some(id);
        debug!(name, "handler added to pipeline");

        self.with_handler(id, |handler, ctx| handler.on_handler_added(ctx))
            .unwrap_or(Ok(()))
    }

    /// Remove a named handler. Sentinels cannot be removed.
    pub fn remove(&mut self, name: &str) -> Result<()> {
        let id = self
            .find(name)
            .ok_or_else(|| Error::PipelineViolation(format!("no handler named {name:?}")))?;
        if id == self.head || id == self.tail {
            return Err(Error::PipelineViolation(
                "head and tail cannot be removed".into(),
            ));
        }
        let node = self.nodes[id].take().expect("found node exists");
        if let Some(prev) = node.prev {
            self.node_mut(prev).next = node.next;
        }
        if let Some(next) = node.next {
            self.node_mut(next).prev = node.prev;
        }
        debug!(name, "handler removed from pipeline");

        match node.handler {
            Some(mut handler) => {
                let mut ctx = HandlerContext::new(self, id, name.to_owned());
                handler.on_handler_removed(&mut ctx)
            }
            // The handler removed itself: its box lives on the frame that
            // is dispatching it right now. That frame runs the removal
            // hook and drops the handler once the current hook returns.
            None => Ok(()),
        }
    }

    /// Names of the user handlers, head to tail.
    pub fn handler_names(&self) -> Vec<String> {
        let mut names = Vec::new();
        let mut current = self.node(self.head).next;
        while let Some(id) = current {
            if id == self.tail {
                break;
            }
            if let Some(node) = &self.nodes[id] {
                names.push(node.name.clone());
                current = node.next;
            } else {
                break;
            }
        }
        names
    }

    /// Offer an inbound message to the chain. `Ok(Some)` returns a message
    /// that traversed every handler unconsumed; the engine applies its
    /// default routing to it.
    pub fn fire_inbound_message(&mut self, msg: Message) -> Result<Option<Message>> {
        let entry = self.node(self.head).next;
        match self.run_inbound(entry, InboundEvent::Message(msg))? {
            Some(InboundEvent::Message(msg)) => Ok(Some(msg)),
            _ => Ok(None),
        }
    }

    /// Offer an inbound failure to the chain; unhandled failures are
    /// discarded at the tail.
    pub fn fire_inbound_failure(&mut self, error: Error) -> Result<()> {
        let entry = self.node(self.head).next;
        if let Some(InboundEvent::Failure(error)) = self.run_inbound(entry, InboundEvent::Failure(error))? {
            warn!(%error, "inbound failure reached the tail unhandled, discarding");
        }
        Ok(())
    }

    pub fn fire_connection_active(&mut self) -> Result<()> {
        let entry = self.node(self.head).next;
        self.run_inbound(entry, InboundEvent::Active)?;
        Ok(())
    }

    pub fn fire_connection_inactive(&mut self) -> Result<()> {
        let entry = self.node(self.head).next;
        self.run_inbound(entry, InboundEvent::Inactive)?;
        Ok(())
    }

    pub fn fire_user_event(&mut self, event: UserEvent) -> Result<()> {
        let entry = self.node(self.head).next;
        self.run_inbound(entry, InboundEvent::User(event))?;
        Ok(())
    }

    /// Run an outbound message from the tail toward the head. `Ok(Some)`
    /// is the message as the head hands it to the engine; `Ok(None)` means
    /// a handler consumed it.
    pub fn fire_outbound_message(&mut self, msg: Message) -> Result<Option<Message>> {
        let entry = self.node(self.tail).prev;
        self.run_outbound(entry, msg)
    }

    /// Messages emitted toward the engine by handlers during dispatch.
    pub fn drain_outbound(&mut self) -> Vec<Message> {
        std::mem::take(&mut self.outbound_ready)
    }

    fn find(&self, name: &str) -> Option<NodeId> {
        self.nodes
            .iter()
            .position(|n| n.as_ref().map_or(false, |n| n.name == name))
    }

    fn node(&self, id: NodeId) -> &Node {
        self.nodes[id].as_ref().expect("live node id")
    }

    fn node_mut(&mut self, id: NodeId) -> &mut Node {
        self.nodes[id].as_mut().expect("live node id")
    }

    /// Take a node's handler, run `f` with a context, and restore the
    /// handler if the node survived the call. `None` when the slot is
    /// empty (node removed, or its handler is already running further up
    /// the call stack).
    fn with_handler<R>(
        &mut self,
        id: NodeId,
        f: impl FnOnce(&mut Box<dyn Handler>, &mut HandlerContext<'_>) -> R,
    ) -> Option<R> {
        let (mut handler, name) = {
            let node = self.nodes.get_mut(id)?.as_mut()?;
            (node.handler.take()?, node.name.clone())
        };
        let result = {
            let mut ctx = HandlerContext::new(self, id, name.clone());
            let result = f(&mut handler, &mut ctx);
            let followups = ctx.take_followups();
            drop(ctx);
            self.apply_followups(followups);
            result
        };
        if let Some(Some(node)) = self.nodes.get_mut(id) {
            node.handler = Some(handler);
        } else {
            // The node vanished during the call (the handler removed
            // itself); its removal hook runs here, off the chain, before
            // the handler is dropped.
            let mut ctx = HandlerContext::new(self, id, name);
            if let Err(error) = handler.on_handler_removed(&mut ctx) {
                warn!(%error, "removal hook failed for self-removed handler");
            }
        }
        Some(result)
    }

    /// Process propagations recorded by a context after its handler
    /// returned: nested outbound walks initiated from inbound hooks (and
    /// vice versa) run here, once the handler's own borrow has ended.
    fn apply_followups(&mut self, followups: Followups) {
        if let Some((next, msg)) = followups.outbound {
            match self.run_outbound(next, msg) {
                Ok(Some(msg)) => self.outbound_ready.push(msg),
                Ok(None) => {}
                Err(error) => warn!(%error, "nested outbound dispatch failed"),
            }
        }
    }

    fn run_inbound(
        &mut self,
        from: Option<NodeId>,
        mut event: InboundEvent,
    ) -> Result<Option<InboundEvent>> {
        let mut current = from;
        while let Some(id) = current {
            if id == self.tail {
                return Ok(Some(event));
            }
            let outcome = self.with_handler(id, |handler, ctx| {
                let result = match event {
                    InboundEvent::Message(msg) => handler.handle_inbound_message(ctx, msg),
                    InboundEvent::Failure(error) => {
                        return match handler.handle_inbound_failure(ctx, error) {
                            // A failure inside the failure hook terminates
                            // the connection.
                            Err(fatal) => Err(fatal),
                            Ok(()) => Ok(ctx.take_inbound_hop()),
                        };
                    }
                    InboundEvent::Active => handler.on_connection_active(ctx),
                    InboundEvent::Inactive => handler.on_connection_inactive(ctx),
                    InboundEvent::User(user) => handler.handle_user_event(ctx, user),
                };
                match result {
                    Ok(()) => Ok(ctx.take_inbound_hop()),
                    Err(error) => {
                        // Report the failure to this handler's own failure
                        // hook; only a failure from that hook is fatal.
                        debug!(name = ctx.name(), %error, "inbound hook failed");
                        ctx.clear_hops();
                        handler.handle_inbound_failure(ctx, error)?;
                        Ok(ctx.take_inbound_hop())
                    }
                }
            });
            match outcome {
                // The node was vacated mid-dispatch (removed by a neighbour
                // while its id was already recorded as the next hop). Its
                // links are nulled, so the event cannot continue; it is
                // dropped like any other consumed event.
                None => {
                    warn!("inbound dispatch reached a vacated node, event dropped");
                    return Ok(None);
                }
                Some(Ok(Some((next, ev)))) => {
                    event = ev;
                    current = next;
                }
                Some(Ok(None)) => return Ok(None),
                Some(Err(fatal)) => return Err(fatal),
            }
        }
        Ok(None)
    }

    fn run_outbound(
        &mut self,
        from: Option<NodeId>,
        mut msg: Message,
    ) -> Result<Option<Message>> {
        let mut current = from;
        while let Some(id) = current {
            if id == self.head {
                return Ok(Some(msg));
            }
            let outcome = self.with_handler(id, |handler, ctx| {
                match handler.handle_outbound_message(ctx, msg) {
                    Ok(()) => Ok(ctx.take_outbound_hop()),
                    // An outbound failure terminates the connection.
                    Err(fatal) => Err(fatal),
                }
            });
            match outcome {
                None => {
                    warn!("outbound dispatch reached a vacated node, message dropped");
                    return Ok(None);
                }
                Some(Ok(Some((next, m)))) => {
                    msg = m;
                    current = next;
                }
                Some(Ok(None)) => return Ok(None),
                Some(Err(fatal)) => return Err(fatal),
            }
        }
        Ok(None)
    }
}

/// Followup work a context records for after its handler returns.
#[derive(Default)]
struct Followups {
    outbound: Option<(Option<NodeId>, Message)>,
}

/// The view a handler gets of its pipeline while one of its hooks runs.
pub struct HandlerContext<'a> {
    pipeline: &'a mut Pipeline,
    node: NodeId,
    name: String,
    inbound_hop: Option<(Option<NodeId>, InboundEvent)>,
    outbound_hop: Option<(Option<NodeId>, Message)>,
    followup_outbound: Option<(Option<NodeId>, Message)>,
}

impl<'a> HandlerContext<'a> {
    fn new(pipeline: &'a mut Pipeline, node: NodeId, name: String) -> Self {
        HandlerContext {
            pipeline,
            node,
            name,
            inbound_hop: None,
            outbound_hop: None,
            followup_outbound: None,
        }
    }

    /// The handler's registered name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// True once this handler has been removed from the chain.
    pub fn is_removed(&self) -> bool {
        self.pipeline
            .nodes
            .get(self.node)
            .map_or(true, Option::is_none)
    }

    fn live_node(&self) -> Result<&Node> {
        self.pipeline
            .nodes
            .get(self.node)
            .and_then(Option::as_ref)
            .ok_or(Error::HandlerRemoved)
    }

    fn record_inbound(&mut self, event: InboundEvent) -> Result<()> {
        let next = self.live_node()?.next;
        if self.inbound_hop.is_some() {
            return Err(Error::PipelineViolation(
                "event already propagated from this hook".into(),
            ));
        }
        self.inbound_hop = Some((next, event));
        Ok(())
    }

    /// Forward a message to the next inbound handler (toward the tail).
    pub fn propagate_inbound_message(&mut self, msg: Message) -> Result<()> {
        self.record_inbound(InboundEvent::Message(msg))
    }

    /// Forward a failure to the next inbound handler (toward the tail).
    pub fn propagate_inbound_failure(&mut self, error: Error) -> Result<()> {
        self.record_inbound(InboundEvent::Failure(error))
    }

    pub fn propagate_connection_active(&mut self) -> Result<()> {
        self.record_inbound(InboundEvent::Active)
    }

    pub fn propagate_connection_inactive(&mut self) -> Result<()> {
        self.record_inbound(InboundEvent::Inactive)
    }

    pub fn propagate_user_event(&mut self, event: UserEvent) -> Result<()> {
        self.record_inbound(InboundEvent::User(event))
    }

    /// Forward a message to the next outbound handler (toward the head).
    /// From an inbound hook this starts an outbound traversal at this
    /// handler's position once the hook returns.
    pub fn propagate_outbound_message(&mut self, msg: Message) -> Result<()> {
        let prev = self.live_node()?.prev;
        if self.outbound_hop.is_some() || self.followup_outbound.is_some() {
            return Err(Error::PipelineViolation(
                "message already propagated from this hook".into(),
            ));
        }
        self.outbound_hop = Some((prev, msg));
        Ok(())
    }

    /// Add a handler at the end of the chain (before the tail).
    pub fn add_last(&mut self, name: &str, handler: Box<dyn Handler>) -> Result<()> {
        self.pipeline.add_last(name, handler)
    }

    /// Remove a handler by name.
    pub fn remove(&mut self, name: &str) -> Result<()> {
        self.pipeline.remove(name)
    }

    fn take_inbound_hop(&mut self) -> Option<(Option<NodeId>, InboundEvent)> {
        // An outbound propagation recorded by an inbound hook becomes
        // followup work.
        if self.outbound_hop.is_some() {
            self.followup_outbound = self.outbound_hop.take();
        }
        self.inbound_hop.take()
    }

    fn take_outbound_hop(&mut self) -> Option<(Option<NodeId>, Message)> {
        self.outbound_hop.take()
    }

    fn clear_hops(&mut self) {
        self.inbound_hop = None;
        self.outbound_hop = None;
    }

    fn take_followups(&mut self) -> Followups {
        Followups {
            outbound: self.followup_outbound.take(),
        }
    }
}
