//! Remote procedures owned by one fusionee.
//!
//! A [`FusionCall`] is a world-wide identifier whose handler lives only in
//! the owning process. Invocations from the owner run the handler in-line on
//! the calling thread; everyone else marshals a call frame to the owner,
//! whose dispatch thread resolves the handler by id and replies keyed by a
//! per-invocation serial.
//!
//! One-way calls flagged [`CallFlags::QUEUE`] are batched per thread; see
//! [`WorldConfig::call_batch_limit`](crate::WorldConfig).

use std::fmt;

use tracing::{debug, warn};

use fusion_wire::{CallFlags, CallFrame, CallId, CallReply, FusionId, ReplyStatus, SharedPtr};

use crate::world::World;
use crate::{FusionError, Result};

/// What a handler did with an invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallHandlerResult {
    /// Reply to the caller with this value
    Return(i32),
    /// Reply later through [`FusionCall::return_value`]
    Retain,
}

/// One invocation as seen by the handler
#[derive(Debug, Clone, Copy)]
pub struct CallContext<'a> {
    /// The call being invoked
    pub call_id: CallId,
    /// Invoking fusionee; [`FusionId::WORLD`] for watch and dispatch callbacks
    pub caller: FusionId,
    /// Serial to answer with [`FusionCall::return_value`]; zero when no
    /// reply is expected
    pub serial: u32,
    /// Integer argument
    pub arg: i32,
    /// Shared pointer argument
    pub ptr: SharedPtr,
    /// Variable-length input
    pub data: &'a [u8],
    /// Largest output the caller accepts
    pub ret_size: usize,
    /// Whether the handler runs in-line in the caller's thread
    pub local: bool,
}

impl CallContext<'_> {
    /// Whether the caller waits for a reply
    pub const fn expects_reply(&self) -> bool {
        self.serial != 0
    }
}

/// Output buffer of a variable-length handler, capped at the caller's size
#[derive(Debug, Default)]
pub struct CallOutput {
    data: Vec<u8>,
    limit: usize,
}

impl CallOutput {
    fn new(limit: usize) -> Self {
        Self {
            data: Vec::new(),
            limit,
        }
    }

    /// Append `bytes`, returning how many fit
    pub fn write(&mut self, bytes: &[u8]) -> usize {
        let room = self.limit.saturating_sub(self.data.len());
        let take = room.min(bytes.len());
        self.data.extend_from_slice(&bytes[..take]);
        take
    }

    /// Bytes written so far
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Remaining capacity
    pub fn remaining(&self) -> usize {
        self.limit.saturating_sub(self.data.len())
    }

    fn into_bytes(self) -> Vec<u8> {
        self.data
    }
}

type SimpleHandler = dyn Fn(&CallContext<'_>) -> CallHandlerResult + Send + Sync;
type OutputHandler = dyn Fn(&CallContext<'_>, &mut CallOutput) -> CallHandlerResult + Send + Sync;

pub(crate) enum CallHandler {
    Simple(Box<SimpleHandler>),
    Output(Box<OutputHandler>),
}

impl CallHandler {
    fn invoke(&self, context: &CallContext<'_>, output: &mut CallOutput) -> CallHandlerResult {
        match self {
            Self::Simple(handler) => handler(context),
            Self::Output(handler) => handler(context, output),
        }
    }
}

/// Run an inbound invocation and answer it. `local` marks world-originated
/// invocations that never crossed the backend.
pub(crate) fn serve(world: &World, frame: CallFrame, local: bool) {
    let Some(handler) = world.call_handler(frame.call_id) else {
        debug!("{} has no handler for {}", world.fusion_id(), frame.call_id);
        if frame.expects_reply() {
            reply(world, CallReply::destroyed(frame.call_id, frame.serial));
        }
        return;
    };

    let context = CallContext {
        call_id: frame.call_id,
        caller: frame.caller,
        serial: if frame.expects_reply() { frame.serial } else { 0 },
        arg: frame.arg,
        ptr: frame.ptr,
        data: &frame.data,
        ret_size: frame.ret_size as usize,
        local,
    };
    let mut output = CallOutput::new(context.ret_size);
    let result = handler.invoke(&context, &mut output);

    if !frame.expects_reply() {
        return;
    }
    match result {
        CallHandlerResult::Return(value) => reply(
            world,
            CallReply::ok(frame.call_id, frame.serial, value, output.into_bytes()),
        ),
        CallHandlerResult::Retain => {}
    }
}

fn reply(world: &World, reply: CallReply) {
    let call = reply.call_id;
    if let Err(e) = world.backend().call_return(reply) {
        warn!("reply for {call} lost: {e}");
    }
}

/// Handle on a remote procedure
#[derive(Clone)]
pub struct FusionCall {
    world: World,
    id: CallId,
    owner: FusionId,
}

impl FusionCall {
    /// Create a call handled by `handler` in this process
    pub fn init<F>(world: &World, handler: F) -> Result<Self>
    where
        F: Fn(&CallContext<'_>) -> CallHandlerResult + Send + Sync + 'static,
    {
        Self::register(world, CallHandler::Simple(Box::new(handler)))
    }

    /// Create a call whose handler also produces variable-length output
    pub fn init3<F>(world: &World, handler: F) -> Result<Self>
    where
        F: Fn(&CallContext<'_>, &mut CallOutput) -> CallHandlerResult + Send + Sync + 'static,
    {
        Self::register(world, CallHandler::Output(Box::new(handler)))
    }

    fn register(world: &World, handler: CallHandler) -> Result<Self> {
        let id = world.backend().call_new()?;
        world.register_call(id, handler);
        debug!("{} created {id}", world.fusion_id());
        Ok(Self {
            world: world.clone(),
            id,
            owner: world.fusion_id(),
        })
    }

    /// Attach to a call created by any fusionee
    pub fn open(world: &World, id: CallId) -> Result<Self> {
        let owner = world.backend().call_owner(id)?;
        Ok(Self {
            world: world.clone(),
            id,
            owner,
        })
    }

    /// Call id
    pub const fn id(&self) -> CallId {
        self.id
    }

    /// Owning fusionee
    pub const fn owner(&self) -> FusionId {
        self.owner
    }

    /// Owning fusionee, re-read from the world
    pub fn get_owner(&self) -> Result<FusionId> {
        self.world.backend().call_owner(self.id)
    }

    /// Invoke with an integer and a shared pointer
    pub fn execute(&self, flags: CallFlags, arg: i32, ptr: SharedPtr) -> Result<i32> {
        self.invoke(flags, arg, ptr, Vec::new(), 0)
            .map(|(value, _)| value)
    }

    /// Invoke with variable-length input
    pub fn execute2(&self, flags: CallFlags, arg: i32, data: &[u8]) -> Result<i32> {
        self.invoke(flags, arg, SharedPtr::NULL, data.to_vec(), 0)
            .map(|(value, _)| value)
    }

    /// Invoke with variable-length input and output of at most `ret_size`
    /// bytes. One-way invocations return no output.
    pub fn execute3(
        &self,
        flags: CallFlags,
        arg: i32,
        data: &[u8],
        ret_size: usize,
    ) -> Result<Vec<u8>> {
        self.invoke(flags, arg, SharedPtr::NULL, data.to_vec(), ret_size)
            .map(|(_, output)| output)
    }

    fn invoke(
        &self,
        flags: CallFlags,
        arg: i32,
        ptr: SharedPtr,
        data: Vec<u8>,
        ret_size: usize,
    ) -> Result<(i32, Vec<u8>)> {
        let me = self.world.fusion_id();
        if self.owner == me && !flags.contains(CallFlags::NO_DIRECT) {
            return self.invoke_local(arg, ptr, &data, ret_size);
        }

        let ret_size = u32::try_from(ret_size)
            .map_err(|_| FusionError::InvalidArgument(format!("return size {ret_size}")))?;
        let mut frame = CallFrame {
            call_id: self.id,
            serial: 0,
            caller: me,
            flags,
            arg,
            ptr,
            ret_size,
            data,
        };

        let backend = self.world.backend();
        if flags.contains(CallFlags::ONE_WAY) && flags.contains(CallFlags::QUEUE) {
            self.world.batcher().push(backend, self.owner, frame)?;
            return Ok((0, Vec::new()));
        }

        self.world.batcher().flush_current(backend)?;
        if frame.expects_reply() {
            frame.serial = backend.mint()?;
        }
        match backend.call_execute(self.owner, frame)? {
            None => Ok((0, Vec::new())),
            Some(reply) if reply.status == ReplyStatus::Destroyed => Err(FusionError::Destroyed),
            Some(reply) => Ok((reply.value, reply.data)),
        }
    }

    fn invoke_local(
        &self,
        arg: i32,
        ptr: SharedPtr,
        data: &[u8],
        ret_size: usize,
    ) -> Result<(i32, Vec<u8>)> {
        let handler = self
            .world
            .call_handler(self.id)
            .ok_or(FusionError::Destroyed)?;
        let context = CallContext {
            call_id: self.id,
            caller: self.world.fusion_id(),
            serial: 0,
            arg,
            ptr,
            data,
            ret_size,
            local: true,
        };
        let mut output = CallOutput::new(ret_size);
        match handler.invoke(&context, &mut output) {
            CallHandlerResult::Return(value) => Ok((value, output.into_bytes())),
            CallHandlerResult::Retain => {
                let _ = FusionError::bug(format!(
                    "{} retained a local invocation that has no serial",
                    self.id
                ));
                Ok((0, output.into_bytes()))
            }
        }
    }

    /// Answer an invocation whose handler returned [`CallHandlerResult::Retain`]
    pub fn return_value(&self, serial: u32, value: i32) -> Result<()> {
        self.return_data(serial, value, Vec::new())
    }

    /// [`FusionCall::return_value`] with variable-length output
    pub fn return_data(&self, serial: u32, value: i32, data: Vec<u8>) -> Result<()> {
        if self.owner != self.world.fusion_id() {
            return Err(FusionError::bug(format!(
                "{} answered by {} which does not own it",
                self.id,
                self.world.fusion_id()
            )));
        }
        if serial == 0 {
            return Err(FusionError::InvalidArgument(
                "serial zero has no waiting caller".to_string(),
            ));
        }
        self.world
            .backend()
            .call_return(CallReply::ok(self.id, serial, value, data))
    }

    /// Destroy the call; callers blocked on it fail Destroyed
    pub fn destroy(self) -> Result<()> {
        if self.owner != self.world.fusion_id() {
            return Err(FusionError::bug(format!(
                "{} destroyed by {} which does not own it",
                self.id,
                self.world.fusion_id()
            )));
        }
        self.world.unregister_call(self.id);
        self.world.backend().call_destroy(self.id)
    }
}

impl fmt::Debug for FusionCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FusionCall")
            .field("id", &self.id)
            .field("owner", &self.owner)
            .finish_non_exhaustive()
    }
}
