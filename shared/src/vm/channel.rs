//! In-process message channel for the syscall bridge

use super::{Frame, Message, SyncMessage, VmError, ID_EXIT, ID_REPLY};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use log::trace;
use std::time::Duration;

/// One end of a bidirectional frame channel
#[derive(Debug)]
pub struct Channel {
    tx: Sender<Frame>,
    rx: Receiver<Frame>,
    recv_timeout: Option<Duration>,
}

/// Creates the two connected ends of a channel
pub fn channel_pair() -> (Channel, Channel) {
    let (a_tx, a_rx) = unbounded();
    let (b_tx, b_rx) = unbounded();
    (
        Channel {
            tx: a_tx,
            rx: b_rx,
            recv_timeout: None,
        },
        Channel {
            tx: b_tx,
            rx: a_rx,
            recv_timeout: None,
        },
    )
}

impl Channel {
    /// Bounds every receive; `None` blocks indefinitely
    pub fn set_recv_timeout(&mut self, timeout: Option<Duration>) {
        self.recv_timeout = timeout;
    }

    pub fn send_frame(&self, frame: Frame) -> Result<(), VmError> {
        trace!("send {:#x} ({} bytes)", frame.id, frame.payload.len());
        self.tx.send(frame).map_err(|_| VmError::Disconnected)
    }

    pub fn recv_frame(&self) -> Result<Frame, VmError> {
        match self.recv_timeout {
            Some(timeout) => self.rx.recv_timeout(timeout).map_err(|e| match e {
                RecvTimeoutError::Timeout => VmError::Timeout,
                RecvTimeoutError::Disconnected => VmError::Disconnected,
            }),
            None => self.rx.recv().map_err(|_| VmError::Disconnected),
        }
    }

    /// Sends an asynchronous message
    pub fn send_msg<M: Message>(&self, args: &M::Args) -> Result<(), VmError> {
        self.send_frame(Frame::new(M::ID, args)?)
    }

    /// Sends a synchronous message and waits for its reply
    ///
    /// Frames from the other side that arrive before the reply are passed to
    /// `handler`, which may answer them through the channel it is given.
    pub fn send_sync<M, H>(&self, args: &M::Args, mut handler: H) -> Result<M::Reply, VmError>
    where
        M: SyncMessage,
        H: FnMut(Frame, &Channel) -> Result<(), VmError>,
    {
        self.send_frame(Frame::new(M::ID, args)?)?;
        loop {
            let frame = self.recv_frame()?;
            match frame.id {
                ID_REPLY => return frame.decode(),
                ID_EXIT => return Err(VmError::Disconnected),
                _ => handler(frame, self)?,
            }
        }
    }

    /// Answers the synchronous message currently being handled
    pub fn reply<M: SyncMessage>(&self, reply: &M::Reply) -> Result<(), VmError> {
        self.send_frame(Frame::new(ID_REPLY, reply)?)
    }
}

#[cfg(test)]
mod tests {
    use super::super::{make_id, Major};
    use super::*;

    struct Add;
    impl Message for Add {
        const ID: u32 = make_id(Major::Qvm, 1);
        type Args = (i32, i32);
    }
    impl SyncMessage for Add {
        type Reply = i32;
    }

    struct Log;
    impl Message for Log {
        const ID: u32 = make_id(Major::CommonServices, 3);
        type Args = String;
    }

    #[test]
    fn test_sync_call_serves_nested_messages() {
        let (engine, module) = channel_pair();

        let worker = std::thread::spawn(move || {
            let frame = module.recv_frame().unwrap();
            let (a, b): (i32, i32) = frame.decode().unwrap();
            module.send_msg::<Log>(&format!("adding {} and {}", a, b)).unwrap();
            module.reply::<Add>(&(a + b)).unwrap();
        });

        let mut logged = Vec::new();
        let sum = engine
            .send_sync::<Add, _>(&(2, 3), |frame, _| {
                assert_eq!(frame.id, Log::ID);
                logged.push(frame.decode::<String>()?);
                Ok(())
            })
            .unwrap();

        worker.join().unwrap();
        assert_eq!(sum, 5);
        assert_eq!(logged, vec!["adding 2 and 3".to_string()]);
    }

    #[test]
    fn test_receive_timeout() {
        let (mut engine, _module) = channel_pair();
        engine.set_recv_timeout(Some(Duration::from_millis(10)));
        assert_eq!(engine.recv_frame(), Err(VmError::Timeout));
    }

    #[test]
    fn test_closed_channel() {
        let (engine, module) = channel_pair();
        drop(module);
        assert_eq!(engine.recv_frame(), Err(VmError::Disconnected));
        assert_eq!(engine.send_msg::<Log>(&"x".to_string()), Err(VmError::Disconnected));
    }
}
