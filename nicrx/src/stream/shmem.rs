use tracing::{debug, warn};

use super::{MemoryAccess, StreamCore, StreamEnv, StreamState};
use crate::error::{ReceiveError, ReceiveResult};
use crate::memory::RdmaOrigin;
use crate::packet::{Opcode, Packet, Response, ShmemHeader, ShmemOp};
use crate::providers::{Completion, NicProviders};

const WORD: usize = 8;

/// Shared-memory operation against the destination process's heap.
///
/// The header's op picks one private handler; each handler owns its own
/// response and completion behavior.
#[derive(Debug)]
pub(crate) struct ShmemStream {
    header: ShmemHeader,
    /// Atomic waiting for its NIC access slot.
    executing: bool,
    written: usize,
    origin: Option<(u16, RdmaOrigin)>,
    data: Vec<u8>,
    previous: Option<u64>,
}

impl ShmemStream {
    pub(crate) fn new(header: ShmemHeader) -> Self {
        Self {
            header,
            executing: false,
            written: 0,
            origin: None,
            data: Vec::new(),
            previous: None,
        }
    }

    pub(crate) fn awaiting_resource(&self) -> bool {
        self.executing
    }

    pub(crate) fn handle_first_packet<P: NicProviders>(
        &mut self,
        core: &mut StreamCore,
        packet: Packet,
        env: &mut StreamEnv<'_, P>,
    ) -> ReceiveResult<()> {
        core.state = StreamState::Receiving;
        debug!(key = %core.key, op = ?self.header.op, addr = self.header.addr, length = self.header.length, "Shared-memory header");
        match self.header.op {
            ShmemOp::Put => self.handle_put(core, packet.payload, env),
            ShmemOp::Get => self.handle_get(core, env),
            ShmemOp::GetResp => self.handle_get_resp(core, packet.payload, env),
            ShmemOp::FetchAdd | ShmemOp::Add | ShmemOp::CompareSwap | ShmemOp::Swap => {
                self.handle_atomic(core, env)
            }
            ShmemOp::Ack => Ok(()),
        }
    }

    pub(crate) fn handle_body_packet<P: NicProviders>(
        &mut self,
        core: &mut StreamCore,
        packet: Packet,
        env: &mut StreamEnv<'_, P>,
    ) -> ReceiveResult<()> {
        match self.header.op {
            ShmemOp::Put => self.write_heap(core, &packet.payload, env),
            ShmemOp::GetResp => {
                self.fill_origin(core, packet.payload, env);
                Ok(())
            }
            op => {
                warn!(key = %core.key, ?op, bytes = packet.payload_size, "Ignoring body packet on shared-memory op");
                Ok(())
            }
        }
    }

    pub(crate) fn on_memory_complete<P: NicProviders>(
        &mut self,
        core: &mut StreamCore,
        access: MemoryAccess,
        env: &mut StreamEnv<'_, P>,
    ) -> ReceiveResult<()> {
        match (self.header.op, access) {
            (ShmemOp::Get, MemoryAccess::HostRead) => self.serve_get(core, env),
            (op, MemoryAccess::NicAccess) if op.is_atomic() => self.execute_atomic(core, env),
            _ => Ok(()),
        }
    }

    fn handle_put<P: NicProviders>(
        &mut self,
        core: &mut StreamCore,
        payload: Vec<u8>,
        env: &mut StreamEnv<'_, P>,
    ) -> ReceiveResult<()> {
        let header = self.header;
        let heap_len = env.ctx.heap().len();
        if header.addr.saturating_add(header.length) > heap_len {
            return Err(core.out_of_bounds(header.addr, header.length, heap_len));
        }
        self.write_heap(core, &payload, env)
    }

    fn handle_get<P: NicProviders>(
        &mut self,
        core: &mut StreamCore,
        env: &mut StreamEnv<'_, P>,
    ) -> ReceiveResult<()> {
        let header = self.header;
        let heap = env.ctx.heap();
        if heap.read(header.addr, header.length).is_none() {
            return Err(core.out_of_bounds(header.addr, header.length, heap.len()));
        }
        core.issue(MemoryAccess::HostRead, header.length, env);
        Ok(())
    }

    fn handle_get_resp<P: NicProviders>(
        &mut self,
        core: &mut StreamCore,
        payload: Vec<u8>,
        env: &mut StreamEnv<'_, P>,
    ) -> ReceiveResult<()> {
        let key = self.header.resp_key;
        let origin = env
            .ctx
            .take_rdma_origin(key)
            .ok_or(ReceiveError::UnknownOrigin {
                pid: core.key.dest_pid,
                key,
            })?;
        self.origin = Some((key, origin));
        self.fill_origin(core, payload, env);
        Ok(())
    }

    fn handle_atomic<P: NicProviders>(
        &mut self,
        core: &mut StreamCore,
        env: &mut StreamEnv<'_, P>,
    ) -> ReceiveResult<()> {
        let heap = env.ctx.heap();
        if heap.load_u64(self.header.addr).is_none() {
            return Err(core.out_of_bounds(self.header.addr, WORD, heap.len()));
        }
        self.executing = true;
        core.issue(MemoryAccess::NicAccess, WORD, env);
        Ok(())
    }

    fn write_heap<P: NicProviders>(
        &mut self,
        core: &mut StreamCore,
        payload: &[u8],
        env: &mut StreamEnv<'_, P>,
    ) -> ReceiveResult<()> {
        if payload.is_empty() {
            return Ok(());
        }
        let addr = self.header.addr + self.written;
        if self.written + payload.len() > self.header.length {
            return Err(core.out_of_bounds(addr, payload.len(), self.header.addr + self.header.length));
        }
        let heap = env.ctx.heap_mut();
        if !heap.write(addr, payload) {
            return Err(core.out_of_bounds(addr, payload.len(), heap.len()));
        }
        self.written += payload.len();
        core.issue(MemoryAccess::HostWrite, payload.len(), env);
        Ok(())
    }

    fn fill_origin<P: NicProviders>(
        &mut self,
        core: &mut StreamCore,
        payload: Vec<u8>,
        env: &mut StreamEnv<'_, P>,
    ) {
        if payload.is_empty() {
            return;
        }
        let capacity = self.origin.as_ref().map_or(0, |(_, origin)| origin.capacity);
        let stored = payload.len().min(capacity.saturating_sub(self.data.len()));
        self.data.extend_from_slice(&payload[..stored]);
        core.issue(MemoryAccess::HostWrite, stored, env);
    }

    fn serve_get<P: NicProviders>(
        &mut self,
        core: &mut StreamCore,
        env: &mut StreamEnv<'_, P>,
    ) -> ReceiveResult<()> {
        let header = self.header;
        let heap = env.ctx.heap();
        let payload = heap
            .read(header.addr, header.length)
            .ok_or_else(|| core.out_of_bounds(header.addr, header.length, heap.len()))?
            .to_vec();
        self.reply(core, ShmemOp::GetResp, payload, env);
        Ok(())
    }

    fn execute_atomic<P: NicProviders>(
        &mut self,
        core: &mut StreamCore,
        env: &mut StreamEnv<'_, P>,
    ) -> ReceiveResult<()> {
        let header = self.header;
        let heap = env.ctx.heap_mut();
        let old = heap
            .load_u64(header.addr)
            .ok_or_else(|| core.out_of_bounds(header.addr, WORD, heap.len()))?;
        let new = match header.op {
            ShmemOp::FetchAdd | ShmemOp::Add => old.wrapping_add(header.operand),
            ShmemOp::CompareSwap if old == header.compare => header.operand,
            ShmemOp::Swap => header.operand,
            _ => old,
        };
        heap.store_u64(header.addr, new);
        self.executing = false;
        self.previous = Some(old);
        debug!(key = %core.key, op = ?header.op, addr = header.addr, old, new, "Atomic executed");

        if header.op == ShmemOp::Add {
            self.reply(core, ShmemOp::Ack, Vec::new(), env);
        } else {
            self.reply(core, ShmemOp::GetResp, old.to_le_bytes().to_vec(), env);
        }
        Ok(())
    }

    fn reply<P: NicProviders>(
        &self,
        core: &StreamCore,
        op: ShmemOp,
        payload: Vec<u8>,
        env: &mut StreamEnv<'_, P>,
    ) {
        env.respond(Response {
            dest_node: core.key.source_node,
            dest_pid: core.key.source_pid,
            source_pid: core.key.dest_pid,
            opcode: Opcode::Shmem(ShmemHeader {
                op,
                addr: self.header.addr,
                length: payload.len(),
                operand: 0,
                compare: 0,
                resp_key: self.header.resp_key,
            }),
            payload,
        });
    }

    pub(crate) fn complete<P: NicProviders>(
        &mut self,
        core: &StreamCore,
        env: &mut StreamEnv<'_, P>,
    ) -> ReceiveResult<Completion> {
        let pid = core.key.dest_pid;
        let header = self.header;
        Ok(match header.op {
            ShmemOp::Put => {
                self.reply(core, ShmemOp::Ack, Vec::new(), env);
                Completion::Shmem {
                    pid,
                    op: header.op,
                    addr: header.addr,
                    previous: None,
                }
            }
            ShmemOp::GetResp => {
                let (key, origin) = self.origin.take().ok_or(ReceiveError::UnknownOrigin {
                    pid,
                    key: header.resp_key,
                })?;
                Completion::OriginFilled {
                    pid,
                    key,
                    cookie: origin.cookie,
                    data: std::mem::take(&mut self.data),
                }
            }
            ShmemOp::Ack => Completion::ShmemAck {
                pid,
                source_node: core.key.source_node,
                key: header.resp_key,
            },
            op => Completion::Shmem {
                pid,
                op,
                addr: header.addr,
                previous: self.previous,
            },
        })
    }
}
