//! Reliable commands from the server
//!
//! Commands are stored by sequence as they arrive and executed strictly in
//! order when the snapshot that follows them is processed. The engine
//! handles `disconnect`, configstring updates and the big configstring
//! chunks itself; everything else goes to the game layer.

use crate::state::{leading_int, ClientError, ClientEvent, ClientState, ConnState};
use log::{debug, info, warn};
use shared::args::{escape, Args};
use shared::message::ReliableCommand;
use shared::protocol::{CS_SYSTEMINFO, MAX_CONFIGSTRINGS};
use shared::reliable::ReliableError;

/// Longest configstring that can be assembled from chunks
pub const BIG_INFO_STRING: usize = 8192;

/// A configstring being assembled from `bcs0`/`bcs1`/`bcs2` parts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BigConfigstring {
    pub index: String,
    pub text: String,
}

impl ClientState {
    /// Records a command from a server message
    pub(crate) fn store_server_command(&mut self, command: ReliableCommand) -> Result<(), ClientError> {
        if !self.server_commands.store(command.sequence, &command.text) {
            return Ok(());
        }
        debug!("serverCommand: {} : {}", command.sequence, command.text);

        // with no game layer loaded yet nothing else would notice a drop
        if self.state < ConnState::Primed && Args::parse(&command.text).argv(0) == "disconnect" {
            self.last_executed_server_command = command.sequence;
            return Err(disconnect_reason(&Args::parse(&command.text)));
        }
        Ok(())
    }

    /// Runs every stored command up to and including `latest`, in order
    pub fn execute_new_server_commands(&mut self, latest: i32) -> Result<(), ClientError> {
        while self.last_executed_server_command.wrapping_sub(latest) < 0 {
            let sequence = self.last_executed_server_command.wrapping_add(1);
            let command = self.get_server_command(sequence);
            self.last_executed_server_command = sequence;
            if let Some(text) = command? {
                self.events.push(ClientEvent::ServerCommand(text));
            }
        }
        Ok(())
    }

    /// Executes one command; returns the text the game layer should see
    pub fn get_server_command(&mut self, sequence: i32) -> Result<Option<String>, ClientError> {
        let text = match self.server_commands.get(sequence) {
            Ok(text) => text.to_string(),
            // a demo may start partway through the command stream
            Err(ReliableError::CycledOut { .. }) if self.demo.is_playing() => return Ok(None),
            Err(ReliableError::CycledOut { requested, latest }) => {
                return Err(ClientError::Drop(format!(
                    "get_server_command: a reliable command was cycled out ({} at {})",
                    requested, latest
                )));
            }
            Err(e) => return Err(e.into()),
        };
        debug!("get_server_command: {}: {}", sequence, text);

        let args = Args::parse(&text);
        match args.argv(0) {
            "disconnect" => Err(disconnect_reason(&args)),
            "bcs0" => {
                self.big_configstring = Some(BigConfigstring {
                    index: args.argv(1).to_string(),
                    text: args.argv(2).to_string(),
                });
                Ok(None)
            }
            "bcs1" => {
                self.append_big_configstring(args.argv(2))?;
                Ok(None)
            }
            "bcs2" => {
                self.append_big_configstring(args.argv(2))?;
                let Some(big) = self.big_configstring.take() else {
                    return Ok(None);
                };
                let assembled = format!("cs {} {}", big.index, escape(&big.text));
                self.configstring_modified(&Args::parse(&assembled))?;
                Ok(Some(assembled))
            }
            "cs" => {
                self.configstring_modified(&args)?;
                Ok(Some(text))
            }
            "map_restart" => {
                // usercmds from before the restart mean nothing now
                self.cmds.clear();
                Ok(Some(text))
            }
            "popup" => {
                self.events.push(ClientEvent::Popup(args.argv(1).to_string()));
                Ok(None)
            }
            "pubkey_decrypt" => {
                self.events
                    .push(ClientEvent::PubkeyDecrypt(args.argv(1).to_string()));
                Ok(None)
            }
            _ => Ok(Some(text)),
        }
    }

    fn append_big_configstring(&mut self, part: &str) -> Result<(), ClientError> {
        let Some(big) = self.big_configstring.as_mut() else {
            warn!("bcs part without a bcs0, ignored");
            return Ok(());
        };
        if big.text.len() + part.len() >= BIG_INFO_STRING {
            return Err(ClientError::Drop("bcs exceeded BIG_INFO_STRING".to_string()));
        }
        big.text.push_str(part);
        Ok(())
    }

    /// `cs <index> <value>`
    fn configstring_modified(&mut self, args: &Args) -> Result<(), ClientError> {
        let index = leading_int(args.argv(1));
        if index < 0 || index as usize >= MAX_CONFIGSTRINGS {
            return Err(ClientError::Drop("configstring > MAX_CONFIGSTRINGS".to_string()));
        }
        let index = index as usize;
        let value = args.argv(2);
        if self.level.configstrings[index] == value {
            return Ok(());
        }
        self.level.configstrings[index] = value.to_string();

        if index == CS_SYSTEMINFO {
            let old_server_id = self.server_id;
            self.system_info_changed();
            if self.server_id != old_server_id {
                info!("Server id changed from {} to {}", old_server_id, self.server_id);
            }
        }
        Ok(())
    }
}

fn disconnect_reason(args: &Args) -> ClientError {
    if args.argc() >= 2 {
        ClientError::Drop(format!("Server disconnected: {}", args.argv(1)))
    } else {
        ClientError::Drop("Server disconnected".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;

    fn primed() -> ClientState {
        let mut client = ClientState::new(ClientConfig::default());
        client.state = ConnState::Primed;
        client
    }

    fn command(sequence: i32, text: &str) -> ReliableCommand {
        ReliableCommand {
            sequence,
            text: text.to_string(),
        }
    }

    fn game_commands(client: &ClientState) -> Vec<String> {
        client
            .events
            .iter()
            .filter_map(|e| match e {
                ClientEvent::ServerCommand(text) => Some(text.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_commands_run_once_in_order() {
        let mut client = primed();
        for (sequence, text) in [(1, "print a"), (2, "print b"), (1, "print a"), (3, "print c")] {
            client.store_server_command(command(sequence, text)).unwrap();
        }
        client.execute_new_server_commands(2).unwrap();
        client.execute_new_server_commands(2).unwrap();
        client.store_server_command(command(3, "print c")).unwrap();
        client.execute_new_server_commands(3).unwrap();

        assert_eq!(game_commands(&client), vec!["print a", "print b", "print c"]);
    }

    #[test]
    fn test_requesting_unreceived_command_fails() {
        let mut client = primed();
        client.store_server_command(command(1, "print a")).unwrap();
        assert!(matches!(
            client.execute_new_server_commands(2),
            Err(ClientError::Reliable(ReliableError::NotReceived { .. }))
        ));
    }

    #[test]
    fn test_cycled_out_gap() {
        let mut client = primed();
        client.store_server_command(command(300, "print late")).unwrap();
        assert!(matches!(client.get_server_command(10), Err(ClientError::Drop(_))));
    }

    #[test]
    fn test_configstring_and_systeminfo() {
        let mut client = primed();
        let cs = format!("cs {} {}", CS_SYSTEMINFO, escape("\\sv_serverid\\42\\sv_paks\\base extra"));
        client.store_server_command(command(1, &cs)).unwrap();
        client.execute_new_server_commands(1).unwrap();

        assert_eq!(client.server_id, 42);
        assert_eq!(client.server_paks, vec!["base", "extra"]);
        assert_eq!(game_commands(&client), vec![cs]);

        client.store_server_command(command(2, "cs 5000 x")).unwrap();
        assert!(client.execute_new_server_commands(2).is_err());
    }

    #[test]
    fn test_big_configstring_assembly() {
        let mut client = primed();
        let first = "a".repeat(1000);
        let last = "b c";
        client.store_server_command(command(1, &format!("bcs0 3 {}", first))).unwrap();
        client.store_server_command(command(2, &format!("bcs1 3 {}", first))).unwrap();
        client.store_server_command(command(3, &format!("bcs2 3 {}", escape(last)))).unwrap();
        client.execute_new_server_commands(3).unwrap();

        let expected = format!("{}{}{}", first, first, last);
        assert_eq!(client.level.configstring(3), expected);
        assert_eq!(game_commands(&client).len(), 1);
    }

    #[test]
    fn test_big_configstring_limit() {
        let mut client = primed();
        let chunk = "x".repeat(1000);
        client.store_server_command(command(1, &format!("bcs0 3 {}", chunk))).unwrap();
        for sequence in 2..=9 {
            client.store_server_command(command(sequence, &format!("bcs1 3 {}", chunk))).unwrap();
        }
        match client.execute_new_server_commands(9) {
            Err(ClientError::Drop(reason)) => assert_eq!(reason, "bcs exceeded BIG_INFO_STRING"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_engine_commands() {
        let mut client = primed();
        client.cmds.push(Default::default());
        client.store_server_command(command(1, "map_restart")).unwrap();
        client.store_server_command(command(2, "popup menu_team")).unwrap();
        client.execute_new_server_commands(2).unwrap();
        assert!(client.cmds.is_empty());
        assert!(client.events.contains(&ClientEvent::Popup("menu_team".to_string())));

        client.store_server_command(command(3, "disconnect \"kicked by admin\"")).unwrap();
        match client.execute_new_server_commands(3) {
            Err(ClientError::Drop(reason)) => assert_eq!(reason, "Server disconnected: kicked by admin"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_disconnect_before_primed_is_immediate() {
        let mut client = primed();
        client.state = ConnState::Connected;
        assert!(client.store_server_command(command(1, "disconnect")).is_err());
    }
}
