//! Per-process receive state: posted receives, registrations, blocked streams.
//!
//! A [`ReceiveContext`] never owns streams. It refers to them by
//! [`StreamId`]; the engine's stream table owns them and only the engine's
//! deferred-delete drain reclaims them.

use std::collections::{HashMap, VecDeque};

use tracing::{debug, error, warn};

use crate::config::DuplicateRegistrationPolicy;
use crate::error::{ReceiveError, ReceiveResult};
use crate::memory::{MemoryRegion, RdmaOrigin, SharedHeap};
use crate::packet::{ConversationKey, MessageHeader, NodeId, Pid};
use crate::providers::{HostInterface, NeedReceive};
use crate::stream::{StreamId, StreamTable};

/// Matching predicate of a posted receive.
///
/// `None` fields are wildcards. The scope always has to match exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatchSpec {
    /// Required sender, if any
    pub source: Option<(NodeId, Pid)>,
    /// Required tag, if any
    pub tag: Option<u32>,
    /// Communicator-like scope
    pub scope: u32,
}

impl MatchSpec {
    /// Accept any sender and any tag within `scope`.
    pub fn any(scope: u32) -> Self {
        Self {
            source: None,
            tag: None,
            scope,
        }
    }

    /// Restrict to one sender.
    pub fn from_source(mut self, node: NodeId, pid: Pid) -> Self {
        self.source = Some((node, pid));
        self
    }

    /// Restrict to one tag.
    pub fn with_tag(mut self, tag: u32) -> Self {
        self.tag = Some(tag);
        self
    }

    /// Whether a header from the sender in `key` satisfies this predicate.
    pub fn accepts(&self, key: &ConversationKey, header: &MessageHeader) -> bool {
        if header.scope != self.scope {
            return false;
        }
        if let Some((node, pid)) = self.source {
            if node != key.source_node || pid != key.source_pid {
                return false;
            }
        }
        match self.tag {
            Some(tag) => tag == header.tag,
            None => true,
        }
    }
}

/// A host buffer ready to receive one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostedReceive {
    /// Which headers this receive accepts
    pub matcher: MatchSpec,
    /// Buffer size in bytes
    pub capacity: usize,
    /// Opaque host handle returned in the completion
    pub cookie: u64,
}

impl PostedReceive {
    /// Create a posted receive.
    pub fn new(matcher: MatchSpec, capacity: usize, cookie: u64) -> Self {
        Self {
            matcher,
            capacity,
            cookie,
        }
    }
}

/// What happened to a receive handed to [`ReceiveContext::post_receive`].
#[derive(Debug, PartialEq, Eq)]
pub enum PostOutcome {
    /// Appended to the posted-receive queue
    Queued,
    /// Accepted by the blocked stream at the head of the queue, which must
    /// resume with this entry
    Resume(StreamId, PostedReceive),
}

/// Receive state of one local process.
#[derive(Debug)]
pub struct ReceiveContext {
    pid: Pid,
    posted: VecDeque<PostedReceive>,
    blocked: VecDeque<StreamId>,
    regions: HashMap<u16, MemoryRegion>,
    origins: HashMap<u16, RdmaOrigin>,
    heap: SharedHeap,
    doomed: Vec<StreamId>,
    duplicate_policy: DuplicateRegistrationPolicy,
    torn_down: bool,
}

impl ReceiveContext {
    /// Create an empty context for `pid`.
    pub fn new(pid: Pid, heap_bytes: usize, duplicate_policy: DuplicateRegistrationPolicy) -> Self {
        Self {
            pid,
            posted: VecDeque::new(),
            blocked: VecDeque::new(),
            regions: HashMap::new(),
            origins: HashMap::new(),
            heap: SharedHeap::new(heap_bytes),
            doomed: Vec::new(),
            duplicate_policy,
            torn_down: false,
        }
    }

    /// Process served by this context.
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Offer a receive to the first blocked stream, or queue it.
    ///
    /// Only the head of the blocked queue is considered so that blocked
    /// headers are satisfied in arrival order.
    pub fn post_receive(&mut self, entry: PostedReceive, streams: &StreamTable) -> PostOutcome {
        if let Some(&head) = self.blocked.front() {
            let accepted = streams
                .pending_match(head)
                .is_some_and(|(key, header)| entry.matcher.accepts(&key, &header));
            if accepted {
                self.blocked.pop_front();
                debug!(pid = %self.pid, stream = head.0, cookie = entry.cookie, "Posted receive resumes blocked stream");
                return PostOutcome::Resume(head, entry);
            }
        }
        self.posted.push_back(entry);
        PostOutcome::Queued
    }

    /// Pop the blocked head when an already queued receive accepts it.
    ///
    /// Called after a resume so that a receive posted ahead of its turn
    /// reaches the stream once the streams before it are served.
    pub fn resume_next(&mut self, streams: &StreamTable) -> Option<(StreamId, PostedReceive)> {
        let head = *self.blocked.front()?;
        let (key, header) = streams.pending_match(head)?;
        let entry = self.find_match(&key, &header)?;
        self.blocked.pop_front();
        debug!(pid = %self.pid, stream = head.0, cookie = entry.cookie, "Queued receive resumes next blocked stream");
        Some((head, entry))
    }

    /// Remove and return the first posted receive accepting `header`.
    pub fn find_match(&mut self, key: &ConversationKey, header: &MessageHeader) -> Option<PostedReceive> {
        let index = self
            .posted
            .iter()
            .position(|entry| entry.matcher.accepts(key, header))?;
        self.posted.remove(index)
    }

    /// Park `stream` until a matching receive is posted and tell the host.
    pub fn need_receive<H: HostInterface>(&mut self, stream: StreamId, notice: NeedReceive, host: &H) {
        debug!(pid = %self.pid, stream = stream.0, tag = notice.tag, length = notice.length, "Stream waiting for a posted receive");
        self.blocked.push_back(stream);
        host.need_receive(notice);
    }

    /// Register `region` under `rgn`.
    ///
    /// Returns the region it replaced, if any.
    pub fn register_memory_region(
        &mut self,
        rgn: u16,
        region: MemoryRegion,
    ) -> ReceiveResult<Option<MemoryRegion>> {
        if self.regions.contains_key(&rgn) {
            self.reject_duplicate(rgn, "memory region")?;
        }
        Ok(self.regions.insert(rgn, region))
    }

    /// Drop the region registered under `rgn`.
    pub fn deregister_memory_region(&mut self, rgn: u16) -> Option<MemoryRegion> {
        self.regions.remove(&rgn)
    }

    /// Region registered under `rgn`.
    pub fn memory_region(&self, rgn: u16) -> Option<&MemoryRegion> {
        self.regions.get(&rgn)
    }

    pub(crate) fn memory_region_mut(&mut self, rgn: u16) -> Option<&mut MemoryRegion> {
        self.regions.get_mut(&rgn)
    }

    /// Register `origin` under the correlation key `key`.
    ///
    /// Returns the origin it replaced, if any.
    pub fn register_rdma_origin(
        &mut self,
        key: u16,
        origin: RdmaOrigin,
    ) -> ReceiveResult<Option<RdmaOrigin>> {
        if self.origins.contains_key(&key) {
            self.reject_duplicate(key, "rdma origin")?;
        }
        Ok(self.origins.insert(key, origin))
    }

    /// Origin registered under `key`.
    pub fn rdma_origin(&self, key: u16) -> Option<&RdmaOrigin> {
        self.origins.get(&key)
    }

    /// Consume the origin registered under `key`.
    pub(crate) fn take_rdma_origin(&mut self, key: u16) -> Option<RdmaOrigin> {
        self.origins.remove(&key)
    }

    /// Shared heap of this process.
    pub fn heap(&self) -> &SharedHeap {
        &self.heap
    }

    pub(crate) fn heap_mut(&mut self) -> &mut SharedHeap {
        &mut self.heap
    }

    /// Queue `stream` for reclamation at the end of the current pass.
    pub fn schedule_deferred_delete(&mut self, stream: StreamId) {
        debug!(pid = %self.pid, stream = stream.0, "Stream scheduled for deferred delete");
        self.doomed.push(stream);
    }

    /// Whether any stream is waiting to be reclaimed.
    pub fn has_deferred_deletes(&self) -> bool {
        !self.doomed.is_empty()
    }

    pub(crate) fn take_deferred_deletes(&mut self) -> Vec<StreamId> {
        std::mem::take(&mut self.doomed)
    }

    /// Number of queued posted receives.
    pub fn posted_count(&self) -> usize {
        self.posted.len()
    }

    /// Number of streams waiting for a posted receive.
    pub fn blocked_count(&self) -> usize {
        self.blocked.len()
    }

    fn is_clean(&self) -> bool {
        self.posted.is_empty()
            && self.blocked.is_empty()
            && self.regions.is_empty()
            && self.origins.is_empty()
    }

    fn leak(&self) -> ReceiveError {
        ReceiveError::TeardownLeak {
            pid: self.pid,
            posted: self.posted.len(),
            blocked: self.blocked.len(),
            regions: self.regions.len(),
            origins: self.origins.len(),
        }
    }

    /// Destroy the context, failing if anything is still queued or registered.
    pub fn teardown(mut self) -> ReceiveResult<()> {
        self.torn_down = true;
        if self.is_clean() {
            Ok(())
        } else {
            Err(self.leak())
        }
    }

    fn reject_duplicate(&self, key: u16, table: &str) -> ReceiveResult<()> {
        match self.duplicate_policy {
            DuplicateRegistrationPolicy::Overwrite => {
                warn!(pid = %self.pid, key, table, "Registration key reused, overwriting");
                Ok(())
            }
            DuplicateRegistrationPolicy::Reject => {
                Err(ReceiveError::DuplicateRegistration { pid: self.pid, key })
            }
        }
    }
}

impl Drop for ReceiveContext {
    fn drop(&mut self) {
        if !self.torn_down && !self.is_clean() {
            error!(error = %self.leak(), "Receive context dropped without teardown");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> ConversationKey {
        ConversationKey::new(NodeId(1), Pid(2), Pid(0))
    }

    fn header(tag: u32) -> MessageHeader {
        MessageHeader {
            tag,
            scope: 0,
            length: 16,
        }
    }

    #[test]
    fn match_spec_honours_wildcards() {
        let any = MatchSpec::any(0);
        assert!(any.accepts(&key(), &header(5)));
        assert!(!MatchSpec::any(1).accepts(&key(), &header(5)));

        let tagged = MatchSpec::any(0).with_tag(5);
        assert!(tagged.accepts(&key(), &header(5)));
        assert!(!tagged.accepts(&key(), &header(6)));

        let sourced = MatchSpec::any(0).from_source(NodeId(1), Pid(2));
        assert!(sourced.accepts(&key(), &header(9)));
        let other = MatchSpec::any(0).from_source(NodeId(1), Pid(3));
        assert!(!other.accepts(&key(), &header(9)));
    }

    #[test]
    fn find_match_takes_first_accepting_entry() {
        let mut ctx = ReceiveContext::new(Pid(0), 64, DuplicateRegistrationPolicy::Overwrite);
        let streams = StreamTable::new();
        ctx.post_receive(PostedReceive::new(MatchSpec::any(0).with_tag(1), 8, 10), &streams);
        ctx.post_receive(PostedReceive::new(MatchSpec::any(0), 8, 11), &streams);
        ctx.post_receive(PostedReceive::new(MatchSpec::any(0), 8, 12), &streams);

        let found = ctx.find_match(&key(), &header(2)).expect("wildcard entry");
        assert_eq!(found.cookie, 11);
        assert_eq!(ctx.posted_count(), 2);

        assert!(ctx.find_match(&key(), &MessageHeader { scope: 4, ..header(1) }).is_none());
        assert_eq!(ctx.posted_count(), 2);

        ctx.find_match(&key(), &header(1));
        ctx.find_match(&key(), &header(1));
        assert!(ctx.teardown().is_ok());
    }

    #[test]
    fn registration_round_trip() {
        let mut ctx = ReceiveContext::new(Pid(0), 64, DuplicateRegistrationPolicy::Overwrite);
        let region = MemoryRegion::from_bytes(3, vec![1, 2, 3]);

        assert_eq!(ctx.register_memory_region(3, region.clone()), Ok(None));
        assert_eq!(ctx.memory_region(3), Some(&region));
        assert_eq!(ctx.deregister_memory_region(3), Some(region));
        assert!(ctx.teardown().is_ok());
    }

    #[test]
    fn duplicate_keys_follow_policy() {
        let mut lenient = ReceiveContext::new(Pid(0), 64, DuplicateRegistrationPolicy::Overwrite);
        lenient
            .register_rdma_origin(1, RdmaOrigin::new(1, 8))
            .expect("first registration");
        let replaced = lenient
            .register_rdma_origin(1, RdmaOrigin::new(2, 8))
            .expect("overwrite allowed");
        assert_eq!(replaced, Some(RdmaOrigin::new(1, 8)));
        assert_eq!(lenient.rdma_origin(1), Some(&RdmaOrigin::new(2, 8)));
        lenient.take_rdma_origin(1);

        let mut strict = ReceiveContext::new(Pid(1), 64, DuplicateRegistrationPolicy::Reject);
        strict
            .register_memory_region(4, MemoryRegion::zeroed(1, 4))
            .expect("first registration");
        let result = strict.register_memory_region(4, MemoryRegion::zeroed(2, 4));
        assert_eq!(
            result,
            Err(ReceiveError::DuplicateRegistration { pid: Pid(1), key: 4 })
        );
        assert_eq!(strict.memory_region(4).map(|r| r.cookie), Some(1));
        strict.deregister_memory_region(4);

        assert!(lenient.teardown().is_ok());
        assert!(strict.teardown().is_ok());
    }

    #[test]
    fn teardown_with_outstanding_state_is_a_leak() {
        let mut ctx = ReceiveContext::new(Pid(5), 64, DuplicateRegistrationPolicy::Overwrite);
        let streams = StreamTable::new();
        ctx.post_receive(PostedReceive::new(MatchSpec::any(0), 8, 1), &streams);
        ctx.register_memory_region(0, MemoryRegion::zeroed(0, 8))
            .expect("registration");

        assert_eq!(
            ctx.teardown(),
            Err(ReceiveError::TeardownLeak {
                pid: Pid(5),
                posted: 1,
                blocked: 0,
                regions: 1,
                origins: 0,
            })
        );
    }
}
