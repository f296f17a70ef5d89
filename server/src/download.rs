//! In-band pak downloads and HTTP redirects
//!
//! A client missing a pak asks for it with `download <name>`. Unless the
//! server redirects it to an HTTP mirror, the file is streamed inside
//! regular server messages as numbered blocks. At most
//! [`MAX_DOWNLOAD_WINDOW`] blocks are in flight; the client acknowledges each
//! one with `nextdl <block>`. A zero-length block marks the end of file.
//! Unacknowledged blocks are resent after one second.

use crate::client_manager::{Client, ClientNum, ClientState};
use crate::config::ServerConfig;
use crate::state::ServerState;
use log::{debug, info, warn};
use shared::message::DownloadMessage;
use shared::protocol::{MAX_DOWNLOAD_BLKSIZE, MAX_DOWNLOAD_WINDOW};
use shared::Args;
use std::collections::HashMap;
use std::fmt;
use std::io::{self, Cursor, Read};
use std::path::PathBuf;

/// Time after which an unacknowledged window is resent
const RESEND_MSEC: i32 = 1000;

/// Where downloadable paks come from
pub trait PakSource: Send {
    fn size(&self, name: &str) -> io::Result<u64>;
    fn open(&self, name: &str) -> io::Result<Box<dyn Read + Send>>;
}

/// Pak names are bare file names with a pak extension
pub fn valid_pak_name(name: &str) -> bool {
    !name.is_empty()
        && !name.contains("..")
        && !name.contains(|c: char| matches!(c, '/' | '\\' | ':'))
        && (name.ends_with(".dpk") || name.ends_with(".pk3"))
}

fn invalid_name(name: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, format!("invalid pak name {}", name))
}

/// Paks stored as files in one directory
#[derive(Debug, Clone)]
pub struct DirectorySource {
    root: PathBuf,
}

impl DirectorySource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path(&self, name: &str) -> io::Result<PathBuf> {
        if !valid_pak_name(name) {
            return Err(invalid_name(name));
        }
        Ok(self.root.join(name))
    }
}

impl PakSource for DirectorySource {
    fn size(&self, name: &str) -> io::Result<u64> {
        Ok(std::fs::metadata(self.path(name)?)?.len())
    }

    fn open(&self, name: &str) -> io::Result<Box<dyn Read + Send>> {
        Ok(Box::new(std::fs::File::open(self.path(name)?)?))
    }
}

/// Paks held in memory
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    files: HashMap<String, Vec<u8>>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: &str, data: Vec<u8>) {
        self.files.insert(name.to_string(), data);
    }

    fn lookup(&self, name: &str) -> io::Result<&Vec<u8>> {
        if !valid_pak_name(name) {
            return Err(invalid_name(name));
        }
        self.files
            .get(name)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, name.to_string()))
    }
}

impl PakSource for MemorySource {
    fn size(&self, name: &str) -> io::Result<u64> {
        Ok(self.lookup(name)?.len() as u64)
    }

    fn open(&self, name: &str) -> io::Result<Box<dyn Read + Send>> {
        Ok(Box::new(Cursor::new(self.lookup(name)?.clone())))
    }
}

/// Per-client download state
#[derive(Default)]
pub struct Download {
    /// Requested file; empty when no download is in progress
    pub name: String,
    file: Option<Box<dyn Read + Send>>,
    size: i32,
    count: i32,
    /// Next block to read from the file
    current_block: i32,
    /// Next block the client has to acknowledge
    client_block: i32,
    /// Next block to transmit
    xmit_block: i32,
    blocks: Vec<Vec<u8>>,
    eof: bool,
    send_time: i32,
    /// The client was told to fetch the file over HTTP
    pub www_dl: bool,
    /// The client acknowledged the redirect and is downloading
    pub www_ing: bool,
    /// The redirect failed; use the fallback URL or in-band transfer next
    pub fallback: bool,
    pub url: String,
    notify_begin: bool,
    notify_redirect: bool,
}

impl fmt::Debug for Download {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Download")
            .field("name", &self.name)
            .field("size", &self.size)
            .field("count", &self.count)
            .field("client_block", &self.client_block)
            .field("xmit_block", &self.xmit_block)
            .field("www_dl", &self.www_dl)
            .field("www_ing", &self.www_ing)
            .finish()
    }
}

impl Download {
    pub fn is_active(&self) -> bool {
        !self.name.is_empty()
    }

    /// Ends the transfer and releases the file
    pub fn close(&mut self) {
        self.file = None;
        self.name.clear();
        self.blocks.clear();
    }

    /// Ends the transfer and forgets every redirect flag
    ///
    /// `close` keeps `fallback` so the next `download` of the same file skips
    /// the redirect; a dropped session must not carry any of it over.
    pub fn reset(&mut self) {
        *self = Download::default();
    }

    fn slot(block: i32) -> usize {
        block.rem_euclid(MAX_DOWNLOAD_WINDOW as i32) as usize
    }

    fn block_len(&self, block: i32) -> usize {
        self.blocks.get(Self::slot(block)).map_or(0, Vec::len)
    }

    fn store_block(&mut self, block: i32, data: Vec<u8>) {
        if self.blocks.len() < MAX_DOWNLOAD_WINDOW {
            self.blocks.resize(MAX_DOWNLOAD_WINDOW, Vec::new());
        }
        self.blocks[Self::slot(block)] = data;
    }
}

fn bad_download(download: &mut Download, message: String) -> DownloadMessage {
    download.name.clear();
    DownloadMessage::Block {
        block: 0,
        total_size: Some(-1),
        data: message.into_bytes(),
    }
}

/// Download traffic to append to the next message for `client`
pub fn write_download(
    client: &mut Client,
    config: &ServerConfig,
    paks: &dyn PakSource,
    now: i32,
) -> Vec<DownloadMessage> {
    let mut out = Vec::new();
    let num = client.num;
    let download = &mut client.download;

    if !download.is_active() || download.www_ing {
        return out;
    }

    let mut tell_rate = false;
    if download.file.is_none() {
        if download.notify_begin {
            download.notify_begin = false;
            info!("clientDownload: {} : beginning \"{}\"", num, download.name);
        }

        if !config.allow_download {
            info!("clientDownload: {} : \"{}\" download disabled", num, download.name);
            let message = format!(
                "Could not download \"{}\" because autodownloading is disabled on the server.\n\n\
                 You will need to get this file elsewhere before you can connect to this server.\n",
                download.name
            );
            out.push(bad_download(download, message));
            return out;
        }

        if config.www_download {
            let size = paks
                .size(&download.name)
                .ok()
                .and_then(|s| i32::try_from(s).ok());

            if !download.fallback {
                match size {
                    Some(size) if !config.www_base_url.is_empty() => {
                        download.url = format!("{}/{}", config.www_base_url, download.name);
                        if download.notify_redirect {
                            download.notify_redirect = false;
                            info!("Redirecting client '{}' to {}", client.name, download.url);
                        }
                        download.www_dl = true;
                        out.push(DownloadMessage::Redirect {
                            url: download.url.clone(),
                            size,
                            base_len: config.www_base_url.len() + 1,
                        });
                        return out;
                    }
                    Some(_) => {}
                    None => warn!(
                        "Client '{}': couldn't extract file size for {}",
                        client.name, download.name
                    ),
                }
            } else {
                download.fallback = false;
                download.www_dl = true;
                if !config.www_fallback_url.is_empty() {
                    info!(
                        "clientDownload: sending client '{}' to fallback URL '{}'",
                        client.name, config.www_fallback_url
                    );
                    download.url = format!("{}/{}", config.www_fallback_url, download.name);
                    out.push(DownloadMessage::Redirect {
                        url: download.url.clone(),
                        size: size.unwrap_or(0),
                        base_len: config.www_fallback_url.len() + 1,
                    });
                    return out;
                }
                warn!(
                    "Client '{}': falling back to regular downloading for failed file {}",
                    client.name, download.name
                );
            }
        }

        download.www_dl = false;
        let opened = paks.size(&download.name).and_then(|size| {
            let size = i32::try_from(size)
                .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "file too large"))?;
            Ok((size, paks.open(&download.name)?))
        });
        match opened {
            Ok((size, file)) => {
                download.file = Some(file);
                download.size = size;
            }
            Err(e) => {
                info!(
                    "clientDownload: {} : \"{}\" file not found on server ({})",
                    num, download.name, e
                );
                let message = format!(
                    "File \"{}\" not found on server for autodownloading.\n",
                    download.name
                );
                out.push(bad_download(download, message));
                return out;
            }
        }

        download.current_block = 0;
        download.client_block = 0;
        download.xmit_block = 0;
        download.count = 0;
        download.eof = false;
        tell_rate = true;
    }

    // fill the window
    while download.current_block - download.client_block < MAX_DOWNLOAD_WINDOW as i32
        && download.size != download.count
    {
        let mut block = Vec::with_capacity(MAX_DOWNLOAD_BLKSIZE);
        let read = match download.file.as_mut() {
            Some(file) => file
                .take(MAX_DOWNLOAD_BLKSIZE as u64)
                .read_to_end(&mut block),
            None => Ok(0),
        };
        match read {
            Ok(0) | Err(_) => {
                // treat as end of file
                download.count = download.size;
                break;
            }
            Ok(len) => {
                download.count += len as i32;
                let current = download.current_block;
                download.store_block(current, block);
                download.current_block += 1;
            }
        }
    }

    if download.count == download.size
        && !download.eof
        && download.current_block - download.client_block < MAX_DOWNLOAD_WINDOW as i32
    {
        let current = download.current_block;
        download.store_block(current, Vec::new());
        download.current_block += 1;
        download.eof = true;
    }

    let mut rate = client.rate;
    if config.dl_max_rate < rate {
        rate = config.dl_max_rate;
        if tell_rate {
            info!("'{}' downloading at sv_dl_maxrate ({})", client.name, config.dl_max_rate);
        }
    } else if tell_rate {
        info!("'{}' downloading at rate {}", client.name, rate);
    }

    let mut blocks_per_snap = if rate <= 0 {
        1
    } else {
        (rate * client.snapshot_msec / 1000 + MAX_DOWNLOAD_BLKSIZE as i32) / MAX_DOWNLOAD_BLKSIZE as i32
    };

    while blocks_per_snap > 0 {
        blocks_per_snap -= 1;
        if download.client_block == download.current_block {
            break;
        }
        if download.xmit_block == download.current_block {
            if now - download.send_time > RESEND_MSEC {
                download.xmit_block = download.client_block;
            } else {
                break;
            }
        }

        let xmit = download.xmit_block;
        let data = download
            .blocks
            .get(Download::slot(xmit))
            .cloned()
            .unwrap_or_default();
        out.push(DownloadMessage::Block {
            block: xmit as u16,
            total_size: if xmit == 0 { Some(download.size) } else { None },
            data,
        });
        debug!("clientDownload: {}: writing block {}", num, xmit);

        download.xmit_block += 1;
        download.send_time = now;
    }

    out
}

impl ServerState {
    /// `download <name>`
    pub(crate) fn begin_download(&mut self, num: ClientNum, args: &Args) {
        let Some(client) = self.clients.get_mut(num) else {
            return;
        };
        client.download.close();
        if args.argc() < 2 {
            return;
        }
        client.download.notify_begin = true;
        client.download.notify_redirect = true;
        client.download.name = args.argv(1).to_string();
    }

    /// `stopdl`
    pub(crate) fn stop_download(&mut self, num: ClientNum) {
        if let Some(client) = self.clients.get_mut(num) {
            if client.download.is_active() {
                debug!("clientDownload: {}: file \"{}\" aborted", num, client.download.name);
            }
            client.download.close();
        }
    }

    /// `donedl`: resend the gamestate so the client picks up the new paks
    pub(crate) fn done_download(&mut self, num: ClientNum) {
        let Some(client) = self.clients.get(num) else {
            return;
        };
        if client.state == ClientState::Active {
            return;
        }
        debug!("clientDownload: {} Done", client.name);
        self.send_client_gamestate(num);
    }

    /// `nextdl <block>`: acknowledgement of the oldest block in flight
    pub(crate) fn next_download(&mut self, num: ClientNum, args: &Args) {
        let Ok(block) = args.argv(1).parse::<i32>() else {
            return;
        };
        let now = self.time;
        let Some(client) = self.clients.get_mut(num) else {
            return;
        };
        let download = &mut client.download;

        if block == download.client_block {
            debug!("clientDownload: {}: client acknowledge of block {}", num, block);
            if download.eof && download.block_len(download.client_block) == 0 {
                info!("clientDownload: {} : file \"{}\" completed", num, download.name);
                download.close();
                return;
            }
            download.send_time = now;
            download.client_block += 1;
            return;
        }

        self.drop_client(num, "broken download");
    }

    /// `wwwdl <ack|done|fail|chkfail>`
    pub(crate) fn www_download(&mut self, num: ClientNum, args: &Args) {
        if args.argc() < 2 {
            return;
        }
        let subcommand = args.argv(1).to_ascii_lowercase();
        let Some(client) = self.clients.get_mut(num) else {
            return;
        };
        let download = &mut client.download;

        if !download.www_dl {
            info!("unexpected wwwdl '{}' for client '{}'", subcommand, client.name);
            self.drop_client(num, &format!("unexpected wwwdl {}", subcommand));
            return;
        }

        if subcommand == "ack" {
            if download.www_ing {
                warn!("dupe wwwdl ack from client '{}'", client.name);
            }
            download.www_ing = true;
            return;
        }

        if !download.www_ing {
            info!("unexpected wwwdl '{}' for client '{}'", subcommand, client.name);
            self.drop_client(num, &format!("unexpected wwwdl {}", subcommand));
            return;
        }

        match subcommand.as_str() {
            "done" => {
                download.name.clear();
                download.www_ing = false;
            }
            "fail" | "chkfail" => {
                if subcommand == "chkfail" {
                    warn!(
                        "client '{}' reports that the redirect download for '{}' had wrong checksum",
                        client.name, download.name
                    );
                }
                download.name.clear();
                download.www_ing = false;
                download.fallback = true;
                self.send_client_gamestate(num);
            }
            _ => {
                info!("unknown wwwdl subcommand '{}' for client '{}'", subcommand, client.name);
                self.drop_client(num, &format!("unknown wwwdl subcommand '{}'", subcommand));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::LocalGame;
    use shared::NetAddress;
    use std::net::SocketAddrV4;

    fn downloading_client(name: &str) -> Client {
        let mut client = Client::new(ClientNum(0));
        client.rate = 25000;
        client.snapshot_msec = 50;
        client.download.name = name.to_string();
        client
    }

    fn paks(size: usize) -> MemorySource {
        let mut paks = MemorySource::new();
        paks.insert("map-plat23_1.0.dpk", (0..size).map(|i| i as u8).collect());
        paks
    }

    fn no_redirect() -> ServerConfig {
        ServerConfig {
            www_download: false,
            ..Default::default()
        }
    }

    #[test]
    fn test_pak_names() {
        assert!(valid_pak_name("map-plat23_1.0.dpk"));
        assert!(!valid_pak_name("../secret.dpk"));
        assert!(!valid_pak_name("dir/file.pk3"));
        assert!(!valid_pak_name("config.cfg"));
        assert!(MemorySource::new().open("../x.dpk").is_err());
    }

    #[test]
    fn test_first_block_carries_size_and_window_limits_reads() {
        let mut client = downloading_client("map-plat23_1.0.dpk");
        let source = paks(MAX_DOWNLOAD_BLKSIZE * 20);

        let out = write_download(&mut client, &no_redirect(), &source, 0);
        // 25000 * 50 / 1000 = 1250 bytes per snapshot rounds up to one block
        assert_eq!(out.len(), 1);
        match &out[0] {
            DownloadMessage::Block { block, total_size, data } => {
                assert_eq!(*block, 0);
                assert_eq!(*total_size, Some((MAX_DOWNLOAD_BLKSIZE * 20) as i32));
                assert_eq!(data.len(), MAX_DOWNLOAD_BLKSIZE);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(client.download.current_block, MAX_DOWNLOAD_WINDOW as i32);
    }

    #[test]
    fn test_window_stalls_then_resends() {
        let mut client = downloading_client("map-plat23_1.0.dpk");
        client.rate = 90000;
        let config = ServerConfig {
            dl_max_rate: 1_000_000,
            ..no_redirect()
        };
        let source = paks(MAX_DOWNLOAD_BLKSIZE * 20);

        let out = write_download(&mut client, &config, &source, 0);
        assert_eq!(out.len(), 3);
        let mut sent = out.len();
        let mut now = 0;
        while sent < MAX_DOWNLOAD_WINDOW {
            now += 50;
            sent += write_download(&mut client, &config, &source, now).len();
        }
        assert_eq!(sent, MAX_DOWNLOAD_WINDOW);

        // window full and nothing acknowledged
        assert!(write_download(&mut client, &config, &source, now + 500).is_empty());

        let resent = write_download(&mut client, &config, &source, now + 1001);
        assert!(matches!(resent[0], DownloadMessage::Block { block: 0, .. }));
    }

    #[test]
    fn test_missing_file_is_reported() {
        let mut client = downloading_client("other_1.0.dpk");
        let out = write_download(&mut client, &no_redirect(), &paks(10), 0);
        match &out[0] {
            DownloadMessage::Block { block, total_size, data } => {
                assert_eq!(*block, 0);
                assert_eq!(*total_size, Some(-1));
                assert!(String::from_utf8_lossy(data).contains("not found on server"));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(!client.download.is_active());
    }

    #[test]
    fn test_redirect_then_fallback() {
        let mut client = downloading_client("map-plat23_1.0.dpk");
        let config = ServerConfig {
            www_base_url: "http://dl.example.net/pkg".to_string(),
            www_fallback_url: "http://mirror.example.net".to_string(),
            ..Default::default()
        };
        let source = paks(100);

        let out = write_download(&mut client, &config, &source, 0);
        assert_eq!(
            out,
            vec![DownloadMessage::Redirect {
                url: "http://dl.example.net/pkg/map-plat23_1.0.dpk".to_string(),
                size: 100,
                base_len: "http://dl.example.net/pkg".len() + 1,
            }]
        );
        assert!(client.download.www_dl);

        client.download.fallback = true;
        let out = write_download(&mut client, &config, &source, 0);
        assert!(matches!(
            &out[0],
            DownloadMessage::Redirect { url, .. } if url == "http://mirror.example.net/map-plat23_1.0.dpk"
        ));
        assert!(!client.download.fallback);
    }

    #[test]
    fn test_small_file_ends_with_empty_block() {
        let mut client = downloading_client("map-plat23_1.0.dpk");
        client.rate = 90000;
        let config = ServerConfig {
            dl_max_rate: 90000,
            ..no_redirect()
        };
        let out = write_download(&mut client, &config, &paks(10), 0);
        assert_eq!(out.len(), 2);
        assert!(matches!(&out[1], DownloadMessage::Block { block: 1, data, .. } if data.is_empty()));
    }

    /// A connected client that was redirected to `http://dl.example.net`
    fn redirected(state: &mut ServerState) -> ClientNum {
        let num = ClientNum(0);
        let client = state.clients.get_mut(num).unwrap();
        client.reset(NetAddress::Ip(SocketAddrV4::new([203, 0, 113, 9].into(), 27961)), 7);
        client.state = ClientState::Connected;
        client.name = "Fetcher".to_string();
        client.download.name = "map-plat23_1.0.dpk".to_string();
        client.download.www_dl = true;
        num
    }

    fn server() -> ServerState {
        ServerState::new(ServerConfig::default(), Box::new(LocalGame::new()), 0).unwrap()
    }

    fn wwwdl(state: &mut ServerState, num: ClientNum, subcommand: &str) {
        state.www_download(num, &Args::parse(&format!("wwwdl {}", subcommand)));
    }

    fn download(state: &ServerState, num: ClientNum) -> &Download {
        &state.clients.get(num).unwrap().download
    }

    fn slot_state(state: &ServerState, num: ClientNum) -> ClientState {
        state.clients.get(num).unwrap().state
    }

    #[test]
    fn test_www_ack_then_done() {
        let mut state = server();
        let num = redirected(&mut state);

        wwwdl(&mut state, num, "ack");
        assert!(download(&state, num).www_ing);
        // a repeated ack is tolerated
        wwwdl(&mut state, num, "ACK");
        assert!(download(&state, num).www_ing);
        assert_eq!(slot_state(&state, num), ClientState::Connected);

        wwwdl(&mut state, num, "done");
        let dl = download(&state, num);
        assert!(!dl.is_active());
        assert!(!dl.www_ing);
        assert!(!dl.fallback);
        assert_eq!(slot_state(&state, num), ClientState::Connected);
    }

    #[test]
    fn test_www_failure_falls_back_and_resends_gamestate() {
        for failure in ["fail", "chkfail"] {
            let mut state = server();
            let num = redirected(&mut state);
            wwwdl(&mut state, num, "ack");
            state.drain_outgoing();

            wwwdl(&mut state, num, failure);
            let dl = download(&state, num);
            assert!(dl.fallback, "{} should set the fallback flag", failure);
            assert!(!dl.www_ing);
            assert!(!dl.is_active());
            assert_eq!(slot_state(&state, num), ClientState::Primed);
            assert_eq!(state.drain_outgoing().len(), 1);
        }
    }

    #[test]
    fn test_unexpected_wwwdl_drops_the_client() {
        // no redirect was sent
        let mut state = server();
        let num = redirected(&mut state);
        state.clients.get_mut(num).unwrap().download.www_dl = false;
        wwwdl(&mut state, num, "ack");
        assert_eq!(slot_state(&state, num), ClientState::Zombie);

        // done before ack
        let mut state = server();
        let num = redirected(&mut state);
        wwwdl(&mut state, num, "done");
        assert_eq!(slot_state(&state, num), ClientState::Zombie);
    }

    #[test]
    fn test_unknown_wwwdl_subcommand_drops_the_client() {
        let mut state = server();
        let num = redirected(&mut state);
        wwwdl(&mut state, num, "ack");
        wwwdl(&mut state, num, "maybe");
        assert_eq!(slot_state(&state, num), ClientState::Zombie);
    }

    #[test]
    fn test_wwwdl_without_subcommand_is_ignored() {
        let mut state = server();
        let num = redirected(&mut state);
        state.www_download(num, &Args::parse("wwwdl"));
        assert_eq!(slot_state(&state, num), ClientState::Connected);
        assert!(!download(&state, num).www_ing);
    }

    #[test]
    fn test_fallback_after_chkfail_goes_in_band() {
        let mut state = server();
        state.config.www_base_url = "http://dl.example.net".to_string();
        let num = redirected(&mut state);
        wwwdl(&mut state, num, "ack");
        wwwdl(&mut state, num, "chkfail");

        // the client asks again after the fresh gamestate
        state.begin_download(num, &Args::parse("download map-plat23_1.0.dpk"));
        assert!(download(&state, num).fallback);

        let source = paks(10);
        let out = write_download(state.clients.get_mut(num).unwrap(), &state.config, &source, 0);
        assert!(matches!(&out[0], DownloadMessage::Block { block: 0, total_size: Some(10), .. }));
        let dl = download(&state, num);
        assert!(!dl.www_dl);
        assert!(!dl.fallback);
    }

    #[test]
    fn test_drop_after_chkfail_clears_download_flags() {
        let mut state = server();
        let num = redirected(&mut state);
        wwwdl(&mut state, num, "ack");
        wwwdl(&mut state, num, "chkfail");
        assert!(download(&state, num).www_dl);
        assert!(download(&state, num).fallback);

        state.drop_client(num, "disconnected");
        let dl = download(&state, num);
        assert!(!dl.is_active());
        assert!(!dl.www_dl);
        assert!(!dl.www_ing);
        assert!(!dl.fallback);
    }
}
