//! Syscall bridge between the engine and a sandboxed game-logic module
//!
//! Every message on the bridge is a [`Frame`]: a 32-bit id followed by the
//! bincode encoding of the message's argument tuple. Ids pack a major number
//! (which sub-bridge owns the message) in the high 16 bits and a minor number
//! in the low 16 bits. Two ids are reserved: [`ID_REPLY`] carries the reply of
//! a synchronous message and [`ID_EXIT`] asks the module to stop.
//!
//! Synchronous messages block the sender until the paired reply arrives.
//! While waiting, the sender keeps serving messages from the other side so a
//! module can issue syscalls from inside an engine call.

pub mod channel;
pub mod command_buffer;
pub mod guest;
pub mod host;

pub use channel::{channel_pair, Channel};
pub use command_buffer::{shared_command_buffer, CommandBuffer, SharedCommandBuffer};
pub use host::VmHost;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

pub const ID_REPLY: u32 = 0xFFFF_FFFF;
pub const ID_EXIT: u32 = 0xFFFF_FFFE;

/// First field of the handshake; changes only if the handshake itself changes
pub const ABI_VERSION_DETECTION: u32 = 1;
pub const SYSCALL_ABI_VERSION: &str = "0.1.0";
pub const HAS_COMPATIBILITY_BREAKING_CHANGES: bool = false;

/// Default receive timeout on the engine side (`vm.timeout`)
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);

/// How long a stopping in-process module gets before its thread is detached
pub const EXIT_GRACE: Duration = Duration::from_millis(500);

/// Sub-bridges, selected by the major number of a message id
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Major {
    /// The module's own entry points and the engine services specific to it
    Qvm = 0,
    /// Filesystem, cvars, commands, logging
    CommonServices = 1,
    /// Batched low-latency calls
    CommandBuffer = 2,
}

impl Major {
    pub fn from_raw(raw: u16) -> Option<Self> {
        match raw {
            0 => Some(Major::Qvm),
            1 => Some(Major::CommonServices),
            2 => Some(Major::CommandBuffer),
            _ => None,
        }
    }
}

pub const fn make_id(major: Major, minor: u16) -> u32 {
    ((major as u32) << 16) | minor as u32
}

pub fn split_id(id: u32) -> (u16, u16) {
    ((id >> 16) as u16, (id & 0xFFFF) as u16)
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VmError {
    #[error("Couldn't load the {name} gamelogic module: it is built for a newer version of the engine")]
    NewerModule { name: String },

    #[error("Couldn't load the {name} gamelogic module: it is built for an older version of the engine")]
    OlderModule { name: String },

    #[error("Couldn't load the {name} gamelogic module: it uses ABI version {module} but this engine uses {engine}")]
    AbiMismatch {
        name: String,
        module: String,
        engine: String,
    },

    #[error("Couldn't load the {name} gamelogic module: it has compatibility-breaking ABI changes but the engine uses the vanilla {abi} ABI")]
    ModuleCompatBreak { name: String, abi: String },

    #[error("Couldn't load the {name} gamelogic module: the engine has compatibility-breaking ABI changes but the module uses the vanilla {abi} ABI")]
    EngineCompatBreak { name: String, abi: String },

    #[error("timed out waiting for a message from the module")]
    Timeout,

    #[error("the module channel is closed")]
    Disconnected,

    #[error("failed to decode message {id:#x}: {reason}")]
    Decode { id: u32, reason: String },

    #[error("unhandled syscall {major}:{minor}")]
    UnhandledSyscall { major: u16, minor: u16 },

    #[error("the module is not running")]
    NotRunning,
}

/// One message on the bridge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub id: u32,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new<T: Serialize>(id: u32, args: &T) -> Result<Self, VmError> {
        let payload = bincode::serialize(args).map_err(|e| VmError::Decode {
            id,
            reason: e.to_string(),
        })?;
        Ok(Self { id, payload })
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, VmError> {
        bincode::deserialize(&self.payload).map_err(|e| VmError::Decode {
            id: self.id,
            reason: e.to_string(),
        })
    }

    pub fn major(&self) -> u16 {
        split_id(self.id).0
    }

    pub fn minor(&self) -> u16 {
        split_id(self.id).1
    }
}

/// A message type with a fixed id and argument tuple
pub trait Message {
    const ID: u32;
    type Args: Serialize + DeserializeOwned;
}

/// A message whose sender blocks until the reply arrives
pub trait SyncMessage: Message {
    type Reply: Serialize + DeserializeOwned;
}

/// ABI identity exchanged when a module starts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbiInfo {
    pub detection: u32,
    pub version: String,
    pub compat_breaking: bool,
}

impl AbiInfo {
    /// The ABI this build speaks
    pub fn current() -> Self {
        Self {
            detection: ABI_VERSION_DETECTION,
            version: SYSCALL_ABI_VERSION.to_string(),
            compat_breaking: HAS_COMPATIBILITY_BREAKING_CHANGES,
        }
    }

    /// Handshake frame: the id slot carries the detection number
    pub fn to_frame(&self) -> Result<Frame, VmError> {
        Frame::new(self.detection, &(self.version.clone(), self.compat_breaking))
    }

    pub fn from_frame(frame: &Frame) -> Result<Self, VmError> {
        let (version, compat_breaking): (String, bool) = frame.decode()?;
        Ok(Self {
            detection: frame.id,
            version,
            compat_breaking,
        })
    }

    /// Accepts a module's handshake or explains which side is newer
    pub fn check_module(&self, name: &str, module: &AbiInfo) -> Result<(), VmError> {
        let name = name.to_string();
        if module.detection != self.detection {
            return Err(if module.detection > self.detection {
                VmError::NewerModule { name }
            } else {
                VmError::OlderModule { name }
            });
        }
        if module.version != self.version {
            return Err(VmError::AbiMismatch {
                name,
                module: module.version.clone(),
                engine: self.version.clone(),
            });
        }
        match (module.compat_breaking, self.compat_breaking) {
            (true, false) => Err(VmError::ModuleCompatBreak {
                name,
                abi: self.version.clone(),
            }),
            (false, true) => Err(VmError::EngineCompatBreak {
                name,
                abi: self.version.clone(),
            }),
            _ => Ok(()),
        }
    }
}
