//! Demo recording and playback
//!
//! A demo is the stream of channel payloads the client received, each stored
//! as `sequence: i32 LE, length: i32 LE, bytes`, and ended by a `-1, -1`
//! record. Recording starts with a synthesized gamestate and then waits for
//! the first full snapshot, so the file never depends on a frame it lacks.
//! Playback feeds the records back through the normal message parser.

use crate::state::{ClientError, ClientState, ConnState};
use log::{debug, info, warn};
use shared::message::{Gamestate, ServerMessage, ServerOp};
use shared::netchan::{NetChan, NetSource};
use shared::protocol::{MAX_MSGLEN, PROTOCOL_VERSION};
use shared::NetAddress;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DemoError {
    #[error("You must be in a level to record.")]
    NotInLevel,

    #[error("Already recording.")]
    AlreadyRecording,

    #[error("Not recording a demo.")]
    NotRecording,

    #[error("Demo file was truncated")]
    Truncated,

    #[error("Illegal demo message length {0}")]
    BadLength(i32),

    #[error("Demo error: {0}")]
    Io(#[from] io::Error),

    #[error("Could not encode gamestate: {0}")]
    Encode(#[from] shared::ProtocolError),
}

/// File extension of demos for the current protocol
pub fn demo_extension() -> String {
    format!("dm_{}", PROTOCOL_VERSION)
}

pub struct DemoWriter<W: Write> {
    out: W,
    messages: usize,
}

impl<W: Write> DemoWriter<W> {
    pub fn new(out: W) -> Self {
        Self { out, messages: 0 }
    }

    pub fn write_message(&mut self, sequence: i32, payload: &[u8]) -> Result<(), DemoError> {
        let len = i32::try_from(payload.len()).map_err(|_| DemoError::BadLength(i32::MAX))?;
        self.out.write_all(&sequence.to_le_bytes())?;
        self.out.write_all(&len.to_le_bytes())?;
        self.out.write_all(payload)?;
        self.messages += 1;
        Ok(())
    }

    pub fn messages(&self) -> usize {
        self.messages
    }

    /// Writes the end marker and hands back the sink
    pub fn finish(mut self) -> Result<W, DemoError> {
        self.out.write_all(&(-1i32).to_le_bytes())?;
        self.out.write_all(&(-1i32).to_le_bytes())?;
        self.out.flush()?;
        Ok(self.out)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DemoRecord {
    Message { sequence: i32, payload: Vec<u8> },
    End,
}

pub struct DemoReader<R: Read> {
    input: R,
}

fn read_i32<R: Read>(input: &mut R) -> Result<Option<i32>, DemoError> {
    let mut bytes = [0u8; 4];
    let mut filled = 0;
    while filled < bytes.len() {
        match input.read(&mut bytes[filled..]) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => return Err(DemoError::Truncated),
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(Some(i32::from_le_bytes(bytes)))
}

impl<R: Read> DemoReader<R> {
    pub fn new(input: R) -> Self {
        Self { input }
    }

    /// Next record; a file that simply stops counts as ended
    pub fn read_message(&mut self) -> Result<DemoRecord, DemoError> {
        let Some(sequence) = read_i32(&mut self.input)? else {
            return Ok(DemoRecord::End);
        };
        let len = read_i32(&mut self.input)?.ok_or(DemoError::Truncated)?;
        if len == -1 {
            return Ok(DemoRecord::End);
        }
        if len < 0 || len as usize > MAX_MSGLEN {
            return Err(DemoError::BadLength(len));
        }

        let mut payload = vec![0; len as usize];
        self.input.read_exact(&mut payload).map_err(|e| match e.kind() {
            ErrorKind::UnexpectedEof => DemoError::Truncated,
            _ => DemoError::Io(e),
        })?;
        Ok(DemoRecord::Message { sequence, payload })
    }
}

type DemoSink = DemoWriter<Box<dyn Write + Send>>;
type DemoSource = DemoReader<Box<dyn Read + Send>>;

#[derive(Default)]
pub enum Demo {
    #[default]
    Idle,
    Recording {
        name: String,
        writer: DemoSink,
        /// No full snapshot seen yet; nothing is written meanwhile
        waiting: bool,
    },
    Playing {
        name: String,
        reader: DemoSource,
        first_frame_skipped: bool,
    },
}

impl std::fmt::Debug for Demo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Demo::Idle => write!(f, "Idle"),
            Demo::Recording { name, waiting, .. } => write!(f, "Recording({}, waiting: {})", name, waiting),
            Demo::Playing { name, .. } => write!(f, "Playing({})", name),
        }
    }
}

impl Demo {
    pub fn is_playing(&self) -> bool {
        matches!(self, Demo::Playing { .. })
    }

    pub fn is_recording(&self) -> bool {
        matches!(self, Demo::Recording { .. })
    }

    /// Recording but still waiting for a full snapshot
    pub fn is_waiting(&self) -> bool {
        matches!(self, Demo::Recording { waiting: true, .. })
    }
}

impl ClientState {
    fn demo_path(&self, name: &str) -> PathBuf {
        let extension = demo_extension();
        let file = if name.ends_with(&format!(".{}", extension)) {
            name.to_string()
        } else {
            format!("{}.{}", name, extension)
        };
        self.config.demo_dir.join(file)
    }

    /// `demo_record [name]`; picks the first free `demoNNNN` when unnamed
    pub fn demo_record(&mut self, name: Option<&str>) -> Result<PathBuf, DemoError> {
        if self.demo.is_recording() {
            return Err(DemoError::AlreadyRecording);
        }
        if self.state != ConnState::Active {
            return Err(DemoError::NotInLevel);
        }

        let name = match name {
            Some(name) => name.to_string(),
            None => (0..10000)
                .map(|n| format!("demo{:04}", n))
                .find(|n| !self.demo_path(n).exists())
                .unwrap_or_else(|| "demo9999".to_string()),
        };
        let path = self.demo_path(&name);
        fs::create_dir_all(&self.config.demo_dir)?;
        let file = File::create(&path)?;
        info!("recording to {}", path.display());
        self.start_recording(&name, Box::new(BufWriter::new(file)))?;
        Ok(path)
    }

    /// Begins recording into `out` with the current level as the first record
    pub fn start_recording(&mut self, name: &str, out: Box<dyn Write + Send>) -> Result<(), DemoError> {
        if self.demo.is_recording() {
            return Err(DemoError::AlreadyRecording);
        }
        let Some(netchan) = &self.netchan else {
            return Err(DemoError::NotInLevel);
        };

        let gamestate = Gamestate {
            command_sequence: self.server_commands.sequence(),
            configstrings: self
                .level
                .configstrings
                .iter()
                .enumerate()
                .filter(|(_, value)| !value.is_empty())
                .map(|(index, value)| (index as u16, value.clone()))
                .collect(),
            baselines: self.level.baselines.values().copied().collect(),
            client_num: self.level.client_num,
        };
        let message = ServerMessage {
            reliable_acknowledge: self.reliable.sequence(),
            ops: vec![ServerOp::Gamestate(gamestate)],
        };

        let mut writer = DemoWriter::new(out);
        writer.write_message(netchan.incoming_sequence, &message.encode()?)?;
        self.demo = Demo::Recording {
            name: name.to_string(),
            writer,
            waiting: true,
        };
        Ok(())
    }

    /// `demo_record_stop`
    pub fn demo_record_stop(&mut self) -> Result<(), DemoError> {
        match std::mem::take(&mut self.demo) {
            Demo::Recording { name, writer, .. } => {
                let messages = writer.messages();
                writer.finish()?;
                info!("Stopped demo {} after {} messages", name, messages);
                Ok(())
            }
            other => {
                self.demo = other;
                Err(DemoError::NotRecording)
            }
        }
    }

    /// A full snapshot arrived; the demo can start from here
    pub(crate) fn demo_full_snapshot(&mut self) {
        if let Demo::Recording { waiting, .. } = &mut self.demo {
            if *waiting {
                debug!("demo recording got its first full snapshot");
            }
            *waiting = false;
        }
    }

    /// Appends a received channel payload to the demo being recorded
    pub(crate) fn record_demo_message(&mut self, sequence: i32, payload: &[u8]) {
        let Demo::Recording { writer, waiting, .. } = &mut self.demo else {
            return;
        };
        if *waiting {
            return;
        }
        if let Err(e) = writer.write_message(sequence, payload) {
            warn!("Demo write failed, recording stopped: {}", e);
            self.demo = Demo::Idle;
        }
    }

    /// `demo_play <name>`
    pub fn demo_play(&mut self, name: &str) -> Result<(), ClientError> {
        let path = self.demo_path(name);
        let file = File::open(&path).map_err(DemoError::from)?;
        info!("playing demo {}", path.display());
        self.play_demo(name, Box::new(BufReader::new(file)))
    }

    /// Replaces any session with playback from `input` and reads up to the
    /// point where the level is loaded
    pub fn play_demo(&mut self, name: &str, input: Box<dyn Read + Send>) -> Result<(), ClientError> {
        self.disconnect();
        self.state = ConnState::Connected;
        self.netchan = Some(NetChan::new(NetSource::Client, NetAddress::Loopback, self.config.qport));
        self.demo = Demo::Playing {
            name: name.to_string(),
            reader: DemoReader::new(input),
            first_frame_skipped: false,
        };

        while self.state >= ConnState::Connected && self.state < ConnState::Primed {
            self.read_demo_message()?;
        }
        Ok(())
    }

    /// Parses the next recorded message; the end of the file ends the session
    pub(crate) fn read_demo_message(&mut self) -> Result<(), ClientError> {
        let Demo::Playing { reader, .. } = &mut self.demo else {
            return Ok(());
        };
        let (sequence, payload) = match reader.read_message() {
            Ok(DemoRecord::Message { sequence, payload }) => (sequence, payload),
            Ok(DemoRecord::End) => {
                self.demo_completed();
                return Ok(());
            }
            Err(e) => {
                warn!("{}", e);
                self.demo_completed();
                return Ok(());
            }
        };

        if let Some(netchan) = self.netchan.as_mut() {
            netchan.incoming_sequence = sequence;
        }
        self.last_packet_time = self.realtime;
        self.parse_server_message(&payload, sequence)
    }

    fn demo_completed(&mut self) {
        if let Demo::Playing { name, .. } = &self.demo {
            info!("Demo {} completed", name);
        }
        self.drop_connection("Demo completed");
    }

    /// Advances playback in step with the presented server time
    pub(crate) fn demo_frame(&mut self) -> Result<(), ClientError> {
        if self.state == ConnState::Primed {
            // the first snapshot must not arrive on the gamestate's frame
            if let Demo::Playing { first_frame_skipped, .. } = &mut self.demo {
                if !*first_frame_skipped {
                    *first_frame_skipped = true;
                    return Ok(());
                }
            }
            return self.read_demo_message();
        }

        while self.state == ConnState::Active
            && self.demo.is_playing()
            && self.clock.server_time >= self.snap.server_time
        {
            let before = self.snap.message_num;
            self.read_demo_message()?;
            if self.snap.message_num == before && self.state == ConnState::Active {
                // a record without a snapshot; keep going next frame
                break;
            }
        }
        Ok(())
    }
}
