//! Master server heartbeats
//!
//! Each configured master gets `heartbeat <tag>` every [`HEARTBEAT_MSEC`],
//! and immediately when the population changes in a way a server browser
//! cares about. Master names are resolved through the [`AddressBook`], so a
//! master whose lookup is still pending is simply skipped until a later
//! frame.

use crate::config::{NetworkScope, ServerPrivate};
use crate::state::ServerState;
use log::{info, warn};
use shared::dns::{AddressBook, NetFamily};
use shared::protocol::{HEARTBEAT_FOR_MASTER, HEARTBEAT_MSEC, MAX_MASTER_SERVERS, PORT_MASTER};
use shared::NetAddress;
use std::collections::HashMap;

#[derive(Default)]
pub struct Heartbeats {
    book: Option<AddressBook>,
    /// Earliest time of the next heartbeat per master; missing means due
    next_time: HashMap<String, i32>,
    warned_scope: bool,
}

impl Heartbeats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_address_book(book: AddressBook) -> Self {
        Self {
            book: Some(book),
            ..Self::default()
        }
    }

    /// Makes every master due on the next frame
    pub fn force(&mut self) {
        self.next_time.clear();
    }

    fn is_due(&self, master: &str, now: i32) -> bool {
        self.next_time
            .get(master)
            .map_or(true, |&at| now.wrapping_sub(at) >= 0)
    }

    /// Resolved addresses of `master`, empty while the lookup is pending
    fn resolve(&self, master: &str) -> Vec<NetAddress> {
        let Some(book) = &self.book else {
            return Vec::new();
        };
        [NetFamily::Ipv4, NetFamily::Ipv6]
            .into_iter()
            .map(|family| book.query(master, family))
            .filter(|address| *address != NetAddress::Bad)
            .map(|mut address| {
                if address.port() == 0 {
                    address.set_port(PORT_MASTER);
                }
                address
            })
            .collect()
    }

    pub fn shutdown(&mut self) {
        if let Some(book) = self.book.as_mut() {
            book.shutdown();
        }
    }
}

impl ServerState {
    /// Sends `heartbeat <tag>` to every master that is due
    pub(crate) fn master_heartbeat(&mut self, tag: &str, now: i32) {
        if self.config.private >= ServerPrivate::NoAdvert {
            return;
        }
        if self.config.network_scope < NetworkScope::Internet {
            if !self.heartbeats.warned_scope {
                warn!("Not sending master heartbeat because sv_networkScope is local");
                self.heartbeats.warned_scope = true;
            }
            return;
        }

        let masters: Vec<String> = self
            .config
            .master_servers
            .iter()
            .filter(|m| !m.is_empty())
            .take(MAX_MASTER_SERVERS)
            .cloned()
            .collect();
        for master in masters {
            if !self.heartbeats.is_due(&master, now) {
                continue;
            }
            let addresses = self.heartbeats.resolve(&master);
            if addresses.is_empty() {
                continue;
            }
            self.heartbeats
                .next_time
                .insert(master.clone(), now.wrapping_add(HEARTBEAT_MSEC));

            for address in addresses {
                info!("Sending heartbeat to {} ({})", master, address);
                self.send_oob(address, &format!("heartbeat {}\n", tag));
            }
        }
    }

    /// Tells the masters the server is going away
    pub(crate) fn master_shutdown(&mut self, now: i32) {
        self.heartbeats.force();
        self.master_heartbeat(&format!("{}-dead", HEARTBEAT_FOR_MASTER), now);
        self.heartbeats.shutdown();
    }
}
