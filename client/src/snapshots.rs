//! Snapshot store and gamestate parsing
//!
//! Every valid snapshot the server sends is kept in a ring of
//! [`PACKET_BACKUP`] entries indexed by its message number, so a later
//! snapshot can be delta decoded against it and the game layer can ask for
//! any snapshot still in the window.

use crate::state::{ClientError, ClientEvent, ClientState, ConnState};
use log::{debug, info, warn};
use shared::message::{EntityDelta, EntityState, Gamestate, PlayerState, SnapshotMessage};
use shared::protocol::{CS_SYSTEMINFO, MAX_CONFIGSTRINGS, PACKET_BACKUP, PACKET_MASK};
use shared::reliable::ReliableReceiver;
use std::collections::BTreeMap;

/// Ping reported when no sent packet matches the snapshot
pub const UNKNOWN_PING: i32 = 999;

/// One decoded snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientSnapshot {
    /// Decoded completely; only valid snapshots are delta bases
    pub valid: bool,
    pub snap_flags: i32,
    pub server_time: i32,
    /// Channel sequence the snapshot arrived with
    pub message_num: i32,
    /// Message this one was delta encoded against; -1 for a full snapshot
    pub delta_num: i32,
    pub ping: i32,
    pub player_state: PlayerState,
    /// Sorted by entity number
    pub entities: Vec<EntityState>,
    /// Server command sequence at the time the snapshot was parsed
    pub server_command_num: i32,
}

/// Send time of one outgoing packet, used to measure ping
#[derive(Debug, Clone, Copy, Default)]
pub struct OutPacket {
    pub cmd_number: i32,
    /// Server time of the newest usercmd in the packet
    pub server_time: i32,
    pub realtime: i32,
}

/// Configstrings and baselines of the current level
#[derive(Debug, Clone)]
pub struct LevelState {
    pub configstrings: Vec<String>,
    pub baselines: BTreeMap<u16, EntityState>,
    pub client_num: i32,
}

impl Default for LevelState {
    fn default() -> Self {
        Self {
            configstrings: vec![String::new(); MAX_CONFIGSTRINGS],
            baselines: BTreeMap::new(),
            client_num: -1,
        }
    }
}

impl LevelState {
    pub fn configstring(&self, index: usize) -> &str {
        self.configstrings.get(index).map_or("", String::as_str)
    }
}

fn slot(message_num: i32) -> usize {
    message_num as u32 as usize & PACKET_MASK
}

/// Applies entity deltas to the entities of `old`
///
/// Entities not mentioned carry over unchanged; an entity missing from `old`
/// is decoded against its baseline.
pub fn apply_entity_deltas(
    old: &[EntityState],
    deltas: &[EntityDelta],
    baselines: &BTreeMap<u16, EntityState>,
) -> Vec<EntityState> {
    let mut entities: BTreeMap<u16, EntityState> = old.iter().map(|e| (e.number, *e)).collect();
    for delta in deltas {
        if delta.removed {
            entities.remove(&delta.number);
            continue;
        }
        let base = entities
            .get(&delta.number)
            .or_else(|| baselines.get(&delta.number))
            .copied()
            .unwrap_or(EntityState {
                number: delta.number,
                ..Default::default()
            });
        entities.insert(delta.number, delta.apply(&base));
    }
    entities.into_values().collect()
}

impl ClientState {
    /// Decodes a snapshot that arrived in message `message_num`
    pub(crate) fn parse_snapshot(&mut self, message: SnapshotMessage, message_num: i32) {
        let mut snap = ClientSnapshot {
            server_command_num: self.server_commands.sequence(),
            server_time: message.server_time,
            message_num,
            snap_flags: message.snap_flags,
            ..Default::default()
        };

        let old_entities: &[EntityState] = if message.delta_num == 0 {
            snap.delta_num = -1;
            snap.valid = true;
            &[]
        } else {
            snap.delta_num = message_num.wrapping_sub(i32::from(message.delta_num));
            let old = &self.snapshots[slot(snap.delta_num)];
            if !old.valid {
                // the frame we were delta'd against was dropped
                warn!("Delta from invalid frame (not supposed to happen!).");
            } else if old.message_num != snap.delta_num {
                // it is in the ring, but a newer message overwrote it
                debug!("Delta frame too old.");
            } else {
                snap.valid = true;
            }
            &old.entities
        };

        snap.entities = apply_entity_deltas(old_entities, &message.entities, &self.level.baselines);
        snap.player_state = message.player_state;

        if !snap.valid {
            return;
        }

        // invalidate the slots of every message we skipped
        let mut old_message_num = self.snap.message_num.wrapping_add(1);
        if snap.message_num.wrapping_sub(old_message_num) >= PACKET_BACKUP as i32 {
            old_message_num = snap.message_num.wrapping_sub(PACKET_BACKUP as i32 - 1);
        }
        while old_message_num.wrapping_sub(snap.message_num) < 0 {
            self.snapshots[slot(old_message_num)].valid = false;
            old_message_num = old_message_num.wrapping_add(1);
        }

        snap.ping = self.snapshot_ping(snap.player_state.command_time);

        self.snapshots[slot(snap.message_num)] = snap.clone();
        self.snap = snap;
        self.clock.new_snapshots = true;
    }

    /// Round trip of the newest packet whose commands the snapshot includes
    fn snapshot_ping(&self, command_time: i32) -> i32 {
        let Some(netchan) = &self.netchan else {
            return UNKNOWN_PING;
        };
        let newest = netchan.outgoing_sequence.wrapping_sub(1);
        for back in 0..PACKET_BACKUP as i32 {
            let packet = &self.out_packets[slot(newest.wrapping_sub(back))];
            if packet.realtime == 0 && packet.server_time == 0 {
                continue;
            }
            if command_time >= packet.server_time {
                return self.realtime.wrapping_sub(packet.realtime);
            }
        }
        UNKNOWN_PING
    }

    /// Message number of the newest valid snapshot and its server time
    pub fn current_snapshot_number(&self) -> (i32, i32) {
        (self.snap.message_num, self.snap.server_time)
    }

    /// Looks up a snapshot still held in the ring
    ///
    /// Asking for a snapshot newer than anything received is an error.
    /// `Ok(None)` means it fell out of the window or never decoded.
    pub fn get_snapshot(&self, number: i32) -> Result<Option<&ClientSnapshot>, ClientError> {
        if number.wrapping_sub(self.snap.message_num) > 0 {
            return Err(ClientError::Drop(format!(
                "get_snapshot: requested snapshot {} is newer than {}",
                number, self.snap.message_num
            )));
        }
        if self.snap.message_num.wrapping_sub(number) >= PACKET_BACKUP as i32 {
            return Ok(None);
        }
        let snap = &self.snapshots[slot(number)];
        if !snap.valid || snap.message_num != number {
            return Ok(None);
        }
        Ok(Some(snap))
    }

    /// Installs a new gamestate, wiping everything from the previous level
    pub(crate) fn parse_gamestate(&mut self, gamestate: Gamestate) -> Result<(), ClientError> {
        self.connect_packet_count = 0;
        self.clear_level();

        // commands before the gamestate are already reflected in it
        self.server_commands = ReliableReceiver::starting_at(gamestate.command_sequence);
        self.last_executed_server_command = gamestate.command_sequence;

        for (index, value) in gamestate.configstrings {
            let index = usize::from(index);
            if index >= MAX_CONFIGSTRINGS {
                return Err(ClientError::Drop(format!(
                    "configstring index {} > MAX_CONFIGSTRINGS",
                    index
                )));
            }
            self.level.configstrings[index] = value;
        }
        for baseline in gamestate.baselines {
            self.level.baselines.insert(baseline.number, baseline);
        }
        self.level.client_num = gamestate.client_num;
        info!("Gamestate received, client number {}", gamestate.client_num);

        self.system_info_changed();
        self.init_downloads()
    }

    /// Picks up engine values from the systeminfo configstring
    pub(crate) fn system_info_changed(&mut self) {
        let info = shared::InfoMap::parse(self.level.configstring(CS_SYSTEMINFO));
        self.server_id = crate::state::leading_int(info.value_for("sv_serverid"));
        // a demo never talks to the server that recorded it
        if self.demo.is_playing() {
            return;
        }
        self.server_paks = info
            .value_for("sv_paks")
            .split_whitespace()
            .map(str::to_string)
            .collect();
    }

    /// Every download is finished: load the level and wait for a snapshot
    pub(crate) fn downloads_complete(&mut self) {
        if self.downloaded_any {
            self.downloaded_any = false;
            // the server resends the gamestate so we see the new paks
            self.add_reliable_command("donedl");
            return;
        }
        self.state = ConnState::Loading;
        self.events.push(ClientEvent::GamestateLoaded);
        // the game layer loads synchronously
        self.state = ConnState::Primed;
        debug!("Loading complete, client primed");
    }

    pub(crate) fn clear_level(&mut self) {
        self.level = LevelState::default();
        self.snap = ClientSnapshot::default();
        self.snapshots = vec![ClientSnapshot::default(); PACKET_BACKUP];
        self.clock = Default::default();
        self.big_configstring = None;
    }
}
