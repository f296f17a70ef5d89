//! Engine side of a loaded game-logic module

use super::channel::{channel_pair, Channel};
use super::{AbiInfo, Frame, Message, SyncMessage, VmError, EXIT_GRACE, ID_EXIT};
use log::{debug, info, warn};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

#[derive(Default)]
struct ExitSignal {
    exited: Mutex<bool>,
    condition: Condvar,
}

/// A running module and the channel to it
///
/// Any error returned by a call is fatal for the module: the owner must
/// [`free`](VmHost::free) it and load a fresh one.
pub struct VmHost {
    name: String,
    channel: Option<Channel>,
    thread: Option<JoinHandle<()>>,
    exit: Arc<ExitSignal>,
}

impl VmHost {
    /// Runs `entry` on its own thread and performs the ABI handshake
    pub fn spawn_in_process<F>(name: &str, timeout: Duration, entry: F) -> Result<Self, VmError>
    where
        F: FnOnce(Channel) + Send + 'static,
    {
        let start = Instant::now();
        let (engine, module) = channel_pair();
        let exit = Arc::new(ExitSignal::default());

        let signal = Arc::clone(&exit);
        let thread = thread::Builder::new()
            .name(format!("vm-{}", name))
            .spawn(move || {
                entry(module);
                *signal.exited.lock() = true;
                signal.condition.notify_all();
            })
            .map_err(|_| VmError::NotRunning)?;

        let mut host = Self {
            name: name.to_string(),
            channel: Some(engine),
            thread: Some(thread),
            exit,
        };
        host.handshake(timeout)?;
        info!(
            "Loaded {} VM module in {} msec",
            host.name,
            start.elapsed().as_millis()
        );
        Ok(host)
    }

    /// Wraps a channel to a module started elsewhere and performs the handshake
    pub fn from_channel(name: &str, channel: Channel, timeout: Duration) -> Result<Self, VmError> {
        let mut host = Self {
            name: name.to_string(),
            channel: Some(channel),
            thread: None,
            exit: Arc::new(ExitSignal::default()),
        };
        host.handshake(timeout)?;
        Ok(host)
    }

    fn handshake(&mut self, timeout: Duration) -> Result<(), VmError> {
        let channel = self.channel.as_mut().ok_or(VmError::NotRunning)?;
        channel.set_recv_timeout(Some(timeout));
        let frame = channel.recv_frame()?;
        let module = AbiInfo::from_frame(&frame)?;
        AbiInfo::current().check_module(&self.name, &module)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_active(&self) -> bool {
        self.channel.is_some()
    }

    pub fn channel(&self) -> Result<&Channel, VmError> {
        self.channel.as_ref().ok_or(VmError::NotRunning)
    }

    pub fn send_msg<M: Message>(&self, args: &M::Args) -> Result<(), VmError> {
        self.channel()?.send_msg::<M>(args)
    }

    /// Synchronous call; `syscalls` serves the module's calls made meanwhile
    pub fn send_sync<M, H>(&self, args: &M::Args, syscalls: H) -> Result<M::Reply, VmError>
    where
        M: SyncMessage,
        H: FnMut(Frame, &Channel) -> Result<(), VmError>,
    {
        self.channel()?.send_sync::<M, H>(args, syscalls)
    }

    /// Asks the module to exit and releases it
    ///
    /// An in-process module gets a short grace period; a thread that does
    /// not stop in time is detached rather than blocking shutdown.
    pub fn free(&mut self) {
        let channel = match self.channel.take() {
            Some(channel) => channel,
            None => return,
        };
        if let Err(e) = channel.send_frame(Frame {
            id: ID_EXIT,
            payload: Vec::new(),
        }) {
            debug!("Error sending exit message to {}: {}", self.name, e);
        }
        drop(channel);

        let thread = match self.thread.take() {
            Some(thread) => thread,
            None => return,
        };

        let exited = {
            let mut exited = self.exit.exited.lock();
            if !*exited {
                self.exit.condition.wait_for(&mut exited, EXIT_GRACE);
            }
            *exited
        };

        if exited {
            info!("Waiting for the {} VM thread...", self.name);
            if thread.join().is_err() {
                warn!("The {} VM thread panicked", self.name);
            }
        } else {
            warn!("The {} VM thread doesn't seem to stop, detaching it", self.name);
            drop(thread);
        }
    }
}

impl Drop for VmHost {
    fn drop(&mut self) {
        self.free();
    }
}
