//! Reflection flood guard for `getinfo` and `getstatus`
//!
//! Status replies are much larger than the requests, so a spoofed source
//! address turns the server into an amplifier. The guard remembers the last
//! [`MAX_INFO_RECEIPTS`] answered requests and refuses to answer when all of
//! them fall inside the window, or when one network already got its share.

use log::{debug, info};
use shared::protocol::MAX_INFO_RECEIPTS;
use shared::NetAddress;

pub const RECEIPT_WINDOW_MSEC: i32 = 2000;
/// Replies one network may get inside the window
pub const MAX_SPECIFIC_RECEIPTS: usize = 5;
const LOG_INTERVAL_MSEC: i32 = 1000;

#[derive(Debug, Clone, Copy)]
struct Receipt {
    address: NetAddress,
    time: i32,
}

#[derive(Debug)]
pub struct DrdosGuard {
    receipts: Vec<Receipt>,
    last_global_log: Option<i32>,
    last_specific_log: Option<i32>,
}

impl Default for DrdosGuard {
    fn default() -> Self {
        Self::new()
    }
}

fn log_due(last: &mut Option<i32>, now: i32) -> bool {
    match *last {
        Some(at) if now.wrapping_sub(at) < LOG_INTERVAL_MSEC => false,
        _ => {
            *last = Some(now);
            true
        }
    }
}

impl DrdosGuard {
    pub fn new() -> Self {
        Self {
            receipts: vec![
                Receipt {
                    address: NetAddress::Bad,
                    time: 0,
                };
                MAX_INFO_RECEIPTS
            ],
            last_global_log: None,
            last_specific_log: None,
        }
    }

    /// Decides whether to ignore a status request from `from`, recording it
    /// when it will be answered
    pub fn should_block(&mut self, from: &NetAddress, now: i32) -> bool {
        if from.is_lan() {
            return false;
        }
        if !from.is_ip() {
            return true;
        }
        let Some(mut key) = from.masked() else {
            return true;
        };
        key.set_port(0);

        let mut global = 0;
        let mut specific = 0;
        let mut oldest = 0;
        let mut oldest_time = i32::MAX;
        for (i, receipt) in self.receipts.iter().enumerate() {
            if receipt.time.wrapping_add(RECEIPT_WINDOW_MSEC) > now {
                // slots never used do not count against the global limit
                if receipt.time != 0 {
                    global += 1;
                }
                if receipt.address == key {
                    specific += 1;
                }
            }
            if receipt.time < oldest_time {
                oldest_time = receipt.time;
                oldest = i;
            }
        }

        if global == MAX_INFO_RECEIPTS {
            if log_due(&mut self.last_global_log, now) {
                info!("Detected flood of getinfo/getstatus connectionless packets");
            }
            return true;
        }
        if specific >= MAX_SPECIFIC_RECEIPTS {
            if log_due(&mut self.last_specific_log, now) {
                debug!(
                    "Possible DRDoS attack to address {}, ignoring getinfo/getstatus connectionless packet",
                    from
                );
            }
            return true;
        }

        self.receipts[oldest] = Receipt { address: key, time: now };
        false
    }
}
