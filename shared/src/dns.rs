//! Background hostname resolution with a cache
//!
//! The frame loop never blocks on DNS. [`AddressBook::query`] returns whatever
//! is cached (initially [`NetAddress::Bad`]) and queues the name for the
//! resolver thread. When idle the thread refreshes entries older than the
//! stale age; entries older than the expiry age are no longer returned.

use crate::address::NetAddress;
use log::{debug, info, warn};
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, VecDeque};
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

pub const STALE_AGE: Duration = Duration::from_secs(3 * 60);
pub const EXPIRED_AGE: Duration = Duration::from_secs(60 * 60);

/// Address families a lookup may return
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NetFamily {
    Ipv4,
    Ipv6,
    Any,
}

/// Performs a blocking lookup; runs on the resolver thread only
pub trait HostResolver: Send + Sync + 'static {
    fn resolve(&self, host: &str, family: NetFamily) -> NetAddress;
}

/// Resolver backed by the operating system
#[derive(Debug, Default)]
pub struct SystemResolver {
    pub default_port: u16,
}

impl SystemResolver {
    fn lookup_target(&self, host: &str) -> String {
        if host.parse::<SocketAddr>().is_ok() {
            return host.to_string();
        }
        if let Ok(ip) = host.parse::<IpAddr>() {
            return SocketAddr::new(ip, self.default_port).to_string();
        }
        match host.rsplit_once(':') {
            Some((_, port)) if port.parse::<u16>().is_ok() => host.to_string(),
            _ => format!("{}:{}", host, self.default_port),
        }
    }
}

impl HostResolver for SystemResolver {
    fn resolve(&self, host: &str, family: NetFamily) -> NetAddress {
        let target = self.lookup_target(host);
        let addrs = match target.to_socket_addrs() {
            Ok(addrs) => addrs,
            Err(e) => {
                debug!("Lookup of {} failed: {}", host, e);
                return NetAddress::Bad;
            }
        };

        addrs
            .map(NetAddress::from)
            .find(|addr| match family {
                NetFamily::Ipv4 => matches!(addr, NetAddress::Ip(_)),
                NetFamily::Ipv6 => matches!(addr, NetAddress::Ip6(_)),
                NetFamily::Any => true,
            })
            .unwrap_or(NetAddress::Bad)
    }
}

type Key = (String, NetFamily);

#[derive(Debug, Clone)]
struct Entry {
    address: NetAddress,
    resolved_at: Option<Instant>,
}

#[derive(Default)]
struct State {
    entries: HashMap<Key, Entry>,
    queue: VecDeque<Key>,
    halt: bool,
}

struct Shared {
    state: Mutex<State>,
    wakeup: Condvar,
    stale_age: Duration,
    expired_age: Duration,
}

/// Cache of resolved hostnames served by a dedicated thread
pub struct AddressBook {
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
}

impl AddressBook {
    pub fn new<R: HostResolver>(resolver: R) -> Self {
        Self::with_ages(resolver, STALE_AGE, EXPIRED_AGE)
    }

    pub fn with_ages<R: HostResolver>(resolver: R, stale_age: Duration, expired_age: Duration) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(State::default()),
            wakeup: Condvar::new(),
            stale_age,
            expired_age,
        });

        let worker = Arc::clone(&shared);
        let thread = thread::Builder::new()
            .name("dns".to_string())
            .spawn(move || resolver_loop(worker, resolver))
            .map_err(|e| warn!("Failed to start resolver thread: {}", e))
            .ok();

        Self { shared, thread }
    }

    /// Cached address for `host`, queueing a lookup when missing or stale
    pub fn query(&self, host: &str, family: NetFamily) -> NetAddress {
        let mut state = self.shared.state.lock();
        if state.halt {
            warn!("Address lookup for {} after resolver shutdown", host);
            return NetAddress::Bad;
        }

        let key = (host.to_string(), family);
        let now = Instant::now();
        let cached = state.entries.get(&key).cloned();
        let (address, needs_lookup) = match cached {
            Some(Entry {
                address,
                resolved_at: Some(at),
            }) => {
                let age = now.duration_since(at);
                if age >= self.shared.expired_age {
                    (NetAddress::Bad, true)
                } else {
                    (address, age >= self.shared.stale_age)
                }
            }
            Some(Entry { resolved_at: None, .. }) => (NetAddress::Bad, false),
            None => {
                state.entries.insert(
                    key.clone(),
                    Entry {
                        address: NetAddress::Bad,
                        resolved_at: None,
                    },
                );
                (NetAddress::Bad, true)
            }
        };

        if needs_lookup && !state.queue.contains(&key) {
            state.queue.push_back(key);
            self.shared.wakeup.notify_one();
        }
        address
    }

    /// Stops the resolver thread and waits for it
    pub fn shutdown(&mut self) {
        {
            let mut state = self.shared.state.lock();
            state.halt = true;
            self.shared.wakeup.notify_all();
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("Resolver thread panicked");
            }
            info!("Address resolver stopped");
        }
    }
}

impl Drop for AddressBook {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn resolver_loop<R: HostResolver>(shared: Arc<Shared>, resolver: R) {
    loop {
        let key = {
            let mut state = shared.state.lock();
            loop {
                if state.halt {
                    return;
                }
                if let Some(key) = state.queue.pop_front() {
                    break key;
                }
                if let Some(key) = oldest_stale(&state, shared.stale_age) {
                    break key;
                }
                shared
                    .wakeup
                    .wait_for(&mut state, Duration::from_millis(250));
            }
        };

        let address = resolver.resolve(&key.0, key.1);
        debug!("Resolved {} to {}", key.0, address);

        let mut state = shared.state.lock();
        let expired_age = shared.expired_age;
        let now = Instant::now();
        state.entries.insert(
            key,
            Entry {
                address,
                resolved_at: Some(now),
            },
        );
        state.entries.retain(|_, entry| {
            entry
                .resolved_at
                .map_or(true, |at| now.duration_since(at) < expired_age)
        });
    }
}

fn oldest_stale(state: &State, stale_age: Duration) -> Option<Key> {
    let now = Instant::now();
    state
        .entries
        .iter()
        .filter_map(|(key, entry)| entry.resolved_at.map(|at| (key, at)))
        .filter(|(_, at)| now.duration_since(*at) >= stale_age)
        .min_by_key(|(_, at)| *at)
        .map(|(key, _)| key.clone())
}
