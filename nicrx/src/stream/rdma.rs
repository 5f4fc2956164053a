use tracing::{debug, warn};

use super::{MemoryAccess, StreamCore, StreamEnv, StreamState};
use crate::error::{ReceiveError, ReceiveResult};
use crate::memory::RdmaOrigin;
use crate::packet::{Opcode, Packet, RdmaHeader, RdmaOp, Response};
use crate::providers::{Completion, NicProviders};

/// RDMA put, get or get response. No receive matching is involved.
#[derive(Debug)]
pub(crate) struct RdmaStream {
    header: RdmaHeader,
    /// Region translation in progress; body packets must wait.
    translating: bool,
    /// Put payload that arrived with the header, written once translated.
    held: Vec<u8>,
    written: usize,
    origin: Option<(u16, RdmaOrigin)>,
    data: Vec<u8>,
    served: usize,
}

impl RdmaStream {
    pub(crate) fn new(header: RdmaHeader) -> Self {
        Self {
            header,
            translating: false,
            held: Vec::new(),
            written: 0,
            origin: None,
            data: Vec::new(),
            served: 0,
        }
    }

    pub(crate) fn awaiting_resource(&self) -> bool {
        self.translating
    }

    pub(crate) fn handle_first_packet<P: NicProviders>(
        &mut self,
        core: &mut StreamCore,
        packet: Packet,
        env: &mut StreamEnv<'_, P>,
    ) -> ReceiveResult<()> {
        core.state = StreamState::Receiving;
        let pid = core.key.dest_pid;
        let header = self.header;
        match header.op {
            RdmaOp::Put => {
                let region = env
                    .ctx
                    .memory_region(header.region)
                    .ok_or(ReceiveError::UnknownRegion {
                        pid,
                        region: header.region,
                    })?;
                let end = header.offset.saturating_add(header.length);
                if end > region.len() {
                    return Err(core.out_of_bounds(header.offset, header.length, region.len()));
                }
                debug!(key = %core.key, region = header.region, offset = header.offset, length = header.length, "RDMA put translating region");
                self.translating = true;
                self.held = packet.payload;
                core.issue(MemoryAccess::NicAccess, 0, env);
            }
            RdmaOp::Get => {
                let region = env
                    .ctx
                    .memory_region(header.region)
                    .ok_or(ReceiveError::UnknownRegion {
                        pid,
                        region: header.region,
                    })?;
                if region.read(header.offset, header.length).is_none() {
                    return Err(core.out_of_bounds(header.offset, header.length, region.len()));
                }
                debug!(key = %core.key, region = header.region, length = header.length, "RDMA get reading host memory");
                core.issue(MemoryAccess::HostRead, header.length, env);
            }
            RdmaOp::GetResp => {
                let origin = env
                    .ctx
                    .take_rdma_origin(header.resp_key)
                    .ok_or(ReceiveError::UnknownOrigin {
                        pid,
                        key: header.resp_key,
                    })?;
                debug!(key = %core.key, resp_key = header.resp_key, "RDMA get response matched origin");
                self.origin = Some((header.resp_key, origin));
                self.fill_origin(core, packet.payload, env);
            }
        }
        Ok(())
    }

    pub(crate) fn handle_body_packet<P: NicProviders>(
        &mut self,
        core: &mut StreamCore,
        packet: Packet,
        env: &mut StreamEnv<'_, P>,
    ) -> ReceiveResult<()> {
        match self.header.op {
            RdmaOp::Put => self.write_region(core, &packet.payload, env),
            RdmaOp::GetResp => {
                self.fill_origin(core, packet.payload, env);
                Ok(())
            }
            RdmaOp::Get => {
                warn!(key = %core.key, bytes = packet.payload_size, "Ignoring body packet on RDMA get");
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
            (RdmaOp::Put, MemoryAccess::NicAccess) => {
                self.translating = false;
                let held = std::mem::take(&mut self.held);
                self.write_region(core, &held, env)
            }
            (RdmaOp::Get, MemoryAccess::HostRead) => self.serve_get(core, env),
            _ => Ok(()),
        }
    }

    fn write_region<P: NicProviders>(
        &mut self,
        core: &mut StreamCore,
        payload: &[u8],
        env: &mut StreamEnv<'_, P>,
    ) -> ReceiveResult<()> {
        if payload.is_empty() {
            return Ok(());
        }
        let header = self.header;
        let offset = header.offset + self.written;
        if self.written + payload.len() > header.length {
            return Err(core.out_of_bounds(offset, payload.len(), header.offset + header.length));
        }
        let region = env
            .ctx
            .memory_region_mut(header.region)
            .ok_or(ReceiveError::UnknownRegion {
                pid: core.key.dest_pid,
                region: header.region,
            })?;
        if !region.write(offset, payload) {
            return Err(core.out_of_bounds(offset, payload.len(), region.len()));
        }
        self.written += payload.len();
        core.issue(MemoryAccess::HostWrite, payload.len(), env);
        Ok(())
    }

    fn serve_get<P: NicProviders>(
        &mut self,
        core: &mut StreamCore,
        env: &mut StreamEnv<'_, P>,
    ) -> ReceiveResult<()> {
        let header = self.header;
        let region = env
            .ctx
            .memory_region(header.region)
            .ok_or(ReceiveError::UnknownRegion {
                pid: core.key.dest_pid,
                region: header.region,
            })?;
        let payload = region
            .read(header.offset, header.length)
            .ok_or_else(|| core.out_of_bounds(header.offset, header.length, region.len()))?
            .to_vec();
        self.served = payload.len();
        env.respond(Response {
            dest_node: core.key.source_node,
            dest_pid: core.key.source_pid,
            source_pid: core.key.dest_pid,
            opcode: Opcode::Rdma(RdmaHeader {
                op: RdmaOp::GetResp,
                region: header.region,
                offset: header.offset,
                length: payload.len(),
                resp_key: header.resp_key,
            }),
            payload,
        });
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

    pub(crate) fn complete(&mut self, core: &StreamCore) -> ReceiveResult<Completion> {
        let pid = core.key.dest_pid;
        let header = self.header;
        Ok(match header.op {
            RdmaOp::Put => Completion::RdmaPut {
                pid,
                region: header.region,
                offset: header.offset,
                length: self.written,
            },
            RdmaOp::Get => Completion::RdmaGetServed {
                pid,
                region: header.region,
                length: self.served,
            },
            RdmaOp::GetResp => {
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
        })
    }
}
