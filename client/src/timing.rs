//! Server time reconciliation
//!
//! The client renders at `server_time`, an estimate of the server clock
//! derived from the local clock plus `server_time_delta`. Each new snapshot
//! corrects the delta in one of three ways depending on how far off it was:
//! a large error snaps to the new value, a medium one halves the gap, and
//! jitter-sized errors drift by a millisecond or two. The presented time
//! never runs backwards.

use crate::config::TimeAdjustConfig;
use crate::state::ClientError;
use log::{debug, trace};

#[derive(Debug, Clone, Default)]
pub struct ServerClock {
    /// Time the game layer renders at
    pub server_time: i32,
    /// Last value of `server_time`; it never goes below this
    pub old_server_time: i32,
    /// Server time of the snapshot used on the previous frame
    pub old_frame_server_time: i32,
    pub server_time_delta: i32,
    /// Set when we got close to running past the latest snapshot
    pub extrapolated_snapshot: bool,
    /// A snapshot arrived since the last adjustment
    pub new_snapshots: bool,
}

impl ServerClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts the clock on the first valid snapshot of a level
    pub fn first_snapshot(&mut self, snap_server_time: i32, realtime: i32) {
        self.server_time_delta = snap_server_time.wrapping_sub(realtime);
        self.old_server_time = snap_server_time;
        self.old_frame_server_time = snap_server_time;
        self.server_time = snap_server_time;
        self.extrapolated_snapshot = false;
        self.new_snapshots = false;
        debug!("Server time delta initialised to {}", self.server_time_delta);
    }

    /// Corrects the delta after a new snapshot
    ///
    /// Demo playback keeps the delta fixed so replay stays deterministic.
    pub fn adjust_time_delta(
        &mut self,
        snap_server_time: i32,
        realtime: i32,
        config: &TimeAdjustConfig,
        demo_playing: bool,
    ) {
        self.new_snapshots = false;
        if demo_playing {
            return;
        }

        let new_delta = snap_server_time.wrapping_sub(realtime);
        let delta_delta = (i64::from(new_delta) - i64::from(self.server_time_delta)).abs();

        if delta_delta > i64::from(config.reset_msec) {
            self.server_time_delta = new_delta;
            self.server_time = self.server_time.max(snap_server_time);
            self.old_server_time = self.server_time;
            debug!("<RESET> delta {}", new_delta);
        } else if delta_delta > i64::from(config.fast_msec) {
            // fast adjust, cut the difference in half; the midpoint always fits
            self.server_time_delta = ((i64::from(self.server_time_delta) + i64::from(new_delta)) >> 1) as i32;
            trace!("<FAST> delta {}", self.server_time_delta);
        } else if self.extrapolated_snapshot {
            self.extrapolated_snapshot = false;
            self.server_time_delta = self.server_time_delta.wrapping_sub(config.slow_down_msec);
            trace!("<SLOW> -{}", config.slow_down_msec);
        } else {
            self.server_time_delta = self.server_time_delta.wrapping_add(config.slow_up_msec);
            trace!("<SLOW> +{}", config.slow_up_msec);
        }
    }

    /// Advances `server_time` for this frame against the current snapshot
    pub fn set_cgame_time(
        &mut self,
        snap_server_time: i32,
        realtime: i32,
        time_nudge: i32,
        config: &TimeAdjustConfig,
        demo_playing: bool,
    ) -> Result<i32, ClientError> {
        if snap_server_time < self.old_frame_server_time {
            return Err(ClientError::Drop(
                "snapshot server time went backwards".to_string(),
            ));
        }
        self.old_frame_server_time = snap_server_time;

        self.server_time = realtime
            .wrapping_add(self.server_time_delta)
            .wrapping_sub(time_nudge);
        // guard against the delta shrinking below the last presented time
        if self.server_time < self.old_server_time {
            self.server_time = self.old_server_time;
        }
        self.old_server_time = self.server_time;

        if realtime.wrapping_add(self.server_time_delta)
            >= snap_server_time.wrapping_sub(config.extrapolation_margin_msec)
        {
            self.extrapolated_snapshot = true;
        }

        if self.new_snapshots {
            self.adjust_time_delta(snap_server_time, realtime, config, demo_playing);
        }
        Ok(self.server_time)
    }
}
