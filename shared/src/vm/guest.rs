//! Module side of the syscall bridge

use super::channel::Channel;
use super::{AbiInfo, Frame, VmError, ID_EXIT};
use log::debug;

/// Entry loop of a module
///
/// Announces `abi` to the engine, then hands every incoming frame to
/// `dispatch` until the engine sends [`ID_EXIT`] or closes the channel.
pub fn vm_main<D>(channel: Channel, abi: AbiInfo, mut dispatch: D) -> Result<(), VmError>
where
    D: FnMut(Frame, &Channel) -> Result<(), VmError>,
{
    channel.send_frame(abi.to_frame()?)?;

    loop {
        let frame = channel.recv_frame()?;
        if frame.id == ID_EXIT {
            debug!("Module received exit request");
            return Ok(());
        }
        dispatch(frame, &channel)?;
    }
}

#[cfg(test)]
mod tests {
    use super::super::channel_pair;
    use super::*;

    #[test]
    fn test_exit_ends_the_loop() {
        let (engine, module) = channel_pair();
        let worker = std::thread::spawn(move || {
            let mut seen = Vec::new();
            let result = vm_main(module, AbiInfo::current(), |frame, _| {
                seen.push(frame.id);
                Ok(())
            });
            (result, seen)
        });

        let handshake = engine.recv_frame().unwrap();
        assert_eq!(AbiInfo::from_frame(&handshake).unwrap(), AbiInfo::current());
        engine.send_frame(Frame { id: 3, payload: Vec::new() }).unwrap();
        engine.send_frame(Frame { id: ID_EXIT, payload: Vec::new() }).unwrap();

        let (result, seen) = worker.join().unwrap();
        assert_eq!(result, Ok(()));
        assert_eq!(seen, vec![3]);
    }
}
