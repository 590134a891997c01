//! # Record/replay sessions
//!
//! Time-travel debugging over a gdb-serial link to an external
//! recorder/replayer. [`record`] drives the recorder and validates the
//! produced recording; [`replay`] spawns the replay server, connects to
//! it, and yields an ordinary [`Process`] whose driver happens to speak
//! the serial protocol.
//!
//! On top of the connection sits the [`ReplaySession`]: checkpoints
//! (persisted to a session file shared with the replayer's own
//! bookmarks), time resolution and travel, the volatile mode needed for
//! inferior function calls, and the end-of-history stop rewrite.

pub mod conn;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::addr::Addr;
use crate::driver::{Driver, StopEvent, StopKind, Tid, SIGKILL, SIGTRAP};
use crate::errors::{DebuggerError, Result};
use crate::process::Process;
use crate::regs::Registers;
use crate::sym::SymbolOracle;

pub use conn::{Direction, GdbConn, StopPacket};

/// First bytes of a LiveRecorder recording.
pub const RECORDING_MAGIC: &[u8; 22] = b"HD\x10\x00\x00\x00UndoDB recording";

/// First words a checkpoint note must not begin with; they collide with
/// the replayer's own bookmark query syntax.
const RESERVED_NOTE_WORDS: &[&str] = &[
    "annotation",
    "bookmark",
    "end",
    "event",
    "inferior",
    "pc",
    "redo",
    "start",
    "time",
    "undo",
    "wallclock",
];

/// A named point in recorded history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Checkpoint {
    /// Monotonic id, starting at 1.
    pub id: u64,
    /// Position, either raw (`<hex bbcount>,<hex pc>`) or rendered for
    /// display by [`ReplaySession::checkpoints`].
    pub when: String,
    pub note: String,
}

/// On-disk session format, shared with the replayer's bookmarks.
#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct SessionFile {
    bookmarks: BTreeMap<String, BookmarkTime>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct BookmarkTime {
    bbcount: u64,
    pc: u64,
}

/// Where a `restart` position resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TravelTarget {
    Start,
    End,
    Time(u64, u64),
}

/// Checkpoint bookkeeping, separate from the connection so it can be
/// saved, loaded and resolved without a live server.
#[derive(Debug, Default)]
pub(crate) struct SessionState {
    checkpoints: BTreeMap<u64, Checkpoint>,
    next_id: u64,
}

impl SessionState {
    pub(crate) fn new() -> Self {
        Self {
            checkpoints: BTreeMap::new(),
            next_id: 1,
        }
    }

    pub(crate) fn create(&mut self, when: String, note: String) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.checkpoints.insert(id, Checkpoint { id, when, note });
        id
    }

    pub(crate) fn remove(&mut self, id: u64) -> Option<Checkpoint> {
        self.checkpoints.remove(&id)
    }

    pub(crate) fn list(&self) -> Vec<Checkpoint> {
        self.checkpoints.values().cloned().collect()
    }

    /// Resolve a user-specified position into a travel target. Accepts
    /// the empty string or `start`, `end`, `cN`, a decimal bbcount (with
    /// or without `,` digit grouping), or `bbcount:0xPC`.
    pub(crate) fn resolve(&self, pos: &str) -> Result<TravelTarget> {
        match pos {
            "" | "start" => return Ok(TravelTarget::Start),
            "end" => return Ok(TravelTarget::End),
            _ => {}
        }
        if let Some(rest) = pos.strip_prefix('c') {
            if let Ok(id) = rest.parse::<u64>() {
                let cp = self
                    .checkpoints
                    .get(&id)
                    .ok_or(DebuggerError::UnknownCheckpoint(id))?;
                let (bbcount, pc) = conn::parse_server_time(&cp.when)?;
                return Ok(TravelTarget::Time(bbcount, pc));
            }
        }
        let cleaned = pos.replace(',', "");
        let parsed = if let Some((bb, pc)) = cleaned.split_once(':') {
            let pc = pc.strip_prefix("0x").ok_or(()).and_then(|hex| {
                u64::from_str_radix(hex, 16).map_err(|_| ())
            });
            match (bb.parse::<u64>(), pc) {
                (Ok(bb), Ok(pc)) => Some(TravelTarget::Time(bb, pc)),
                _ => None,
            }
        } else {
            cleaned.parse::<u64>().ok().map(|bb| TravelTarget::Time(bb, 0))
        };
        parsed.ok_or_else(|| {
            DebuggerError::Parse(format!(
                "could not parse time or checkpoint argument: {pos:?}"
            ))
        })
    }

    /// Persist the checkpoints as bookmarks. Notes are deduplicated with
    /// `-N` suffixes, visiting longer notes first so that re-saving a
    /// previously suffixed set does not cascade into `note-0-0`.
    pub(crate) fn save_to(&self, path: &Path) -> Result<()> {
        let mut ordered: Vec<&Checkpoint> = self.checkpoints.values().collect();
        ordered.sort_by(|a, b| b.note.len().cmp(&a.note.len()));

        let mut bookmarks = BTreeMap::new();
        for cp in ordered {
            let mut name = cp.note.clone();
            let mut i = 0;
            while bookmarks.contains_key(&name) {
                name = format!("{}-{}", cp.note, i);
                i += 1;
            }
            let (bbcount, pc) = conn::parse_server_time(&cp.when)?;
            bookmarks.insert(name, BookmarkTime { bbcount, pc });
        }

        let json = serde_json::to_string_pretty(&SessionFile { bookmarks })?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Load a session file, replacing the current state. Unknown fields
    /// in the file are rejected.
    pub(crate) fn load_from(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let file: SessionFile = serde_json::from_str(&raw)?;
        let mut state = Self::new();
        for (note, time) in file.bookmarks {
            state.create(format!("{:x},{:x}", time.bbcount, time.pc), note);
        }
        Ok(state)
    }
}

/// Validate a checkpoint note against the replayer's bookmark naming
/// rules, so saved sessions interoperate with its own bookmarks.
pub fn validate_note(note: &str) -> Result<()> {
    let Some(first) = note.chars().next() else {
        return Err(DebuggerError::InvalidCheckpointNote(
            "note must not be empty".into(),
        ));
    };
    if first == ' ' {
        return Err(DebuggerError::InvalidCheckpointNote(
            "note must not start with a space".into(),
        ));
    }
    if first.is_ascii_digit() {
        return Err(DebuggerError::InvalidCheckpointNote(
            "note must not start with a digit".into(),
        ));
    }
    if matches!(first, ',' | '-' | '$') {
        return Err(DebuggerError::InvalidCheckpointNote(format!(
            "note must not start with character: {first}"
        )));
    }
    let first_word = note.split(' ').next().unwrap_or("");
    if RESERVED_NOTE_WORDS.contains(&first_word) {
        return Err(DebuggerError::InvalidCheckpointNote(format!(
            "note must not start with reserved word: {first_word}"
        )));
    }
    Ok(())
}

/// Render a position in recorded history the way the replayer prints
/// times: a digit-grouped bbcount and a hex PC.
pub fn time_string(bbcount: u64, pc: u64) -> String {
    let digits = bbcount.to_string();
    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3);
    let lead = digits.len() % 3;
    for (i, c) in digits.chars().enumerate() {
        if i != 0 && (i + 3 - lead) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(c);
    }
    format!("{grouped}:{pc:#x}")
}

/// Session-level state of a replay target.
pub struct ReplaySession {
    conn: Arc<Mutex<GdbConn>>,
    state: SessionState,
    volatile: Arc<AtomicBool>,
    session_path: Option<PathBuf>,
}

/// Deactivates volatile mode when dropped, whether or not the inferior
/// call that needed it succeeded.
pub struct VolatileGuard {
    conn: Arc<Mutex<GdbConn>>,
    flag: Arc<AtomicBool>,
}

impl Drop for VolatileGuard {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
        if let Err(e) = lock(&self.conn).set_debuggee_volatile(false) {
            warn!("could not leave volatile mode: {e}");
        }
    }
}

fn lock(conn: &Arc<Mutex<GdbConn>>) -> MutexGuard<'_, GdbConn> {
    conn.lock().expect("gdb connection mutex poisoned")
}

impl ReplaySession {
    fn new(conn: Arc<Mutex<GdbConn>>, session_path: Option<PathBuf>) -> Self {
        let mut session = Self {
            conn,
            state: SessionState::new(),
            volatile: Arc::new(AtomicBool::new(false)),
            session_path: session_path.clone(),
        };
        // restoring the previous session is best-effort
        if let Some(path) = &session_path {
            match SessionState::load_from(path) {
                Ok(state) => {
                    debug!(
                        "restored {} checkpoint(s) from {}",
                        state.checkpoints.len(),
                        path.display()
                    );
                    session.state = state;
                }
                Err(e) => debug!("no prior session restored: {e}"),
            }
        }
        session
    }

    fn is_volatile(&self) -> bool {
        self.volatile.load(Ordering::SeqCst)
    }

    /// Create a checkpoint at the current time.
    pub fn checkpoint(&mut self, note: &str) -> Result<u64> {
        if self.is_volatile() {
            panic!("tried to create a checkpoint in volatile mode");
        }
        validate_note(note)?;
        let when = lock(&self.conn).get_time_raw()?;
        let id = self.state.create(when, note.to_string());
        self.save();
        Ok(id)
    }

    /// All checkpoints, with their positions rendered for display.
    pub fn checkpoints(&mut self) -> Result<Vec<Checkpoint>> {
        self.state
            .list()
            .into_iter()
            .map(|mut cp| {
                let (bbcount, pc) = conn::parse_server_time(&cp.when)?;
                cp.when = time_string(bbcount, pc);
                Ok(cp)
            })
            .collect()
    }

    pub fn clear_checkpoint(&mut self, id: u64) -> Result<()> {
        self.state
            .remove(id)
            .ok_or(DebuggerError::UnknownCheckpoint(id))?;
        self.save();
        Ok(())
    }

    /// Travel to a position in recorded history; see
    /// [`SessionState::resolve`] for the accepted forms.
    pub fn restart(&mut self, pos: &str) -> Result<()> {
        if self.is_volatile() {
            // volatile mode only exists during an inferior call; a
            // restart in that window is a bug in the caller
            panic!("attempted to restart in volatile mode");
        }
        let target = self.state.resolve(pos)?;
        let mut conn = lock(&self.conn);
        conn.clear_interrupt()?;
        match target {
            TravelTarget::Start => {
                let (min, _) = conn.get_log_extent()?;
                conn.goto_time(min, 0)?;
            }
            TravelTarget::End => conn.goto_record_mode()?,
            TravelTarget::Time(bbcount, pc) => conn.goto_time(bbcount, pc)?,
        }
        if let Err(e) = conn.reset_progress_indicator() {
            warn!("could not reset the progress indicator: {e}");
        }
        Ok(())
    }

    /// Position in recorded history as `[replaying P% bbcount:pc]`.
    pub fn when(&mut self) -> Result<String> {
        let mut conn = lock(&self.conn);
        let (bbcount, pc) = conn.get_time()?;
        let (min, max) = conn.get_log_extent()?;
        let perc = if min == max {
            100
        } else {
            (bbcount.saturating_sub(min)) * 100 / (max - min)
        };
        Ok(format!("[replaying {perc}% {}]", time_string(bbcount, pc)))
    }

    pub fn change_direction(&mut self, dir: Direction) -> Result<()> {
        lock(&self.conn).direction = dir;
        Ok(())
    }

    pub fn direction(&self) -> Direction {
        lock(&self.conn).direction
    }

    /// Enter volatile mode for an inferior function call. The returned
    /// guard leaves it again on drop; volatile mode does not nest, and
    /// trying to re-enter it is a bug in the caller.
    pub fn activate_volatile(&self) -> Result<VolatileGuard> {
        if self.volatile.swap(true, Ordering::SeqCst) {
            panic!("tried to activate volatile mode when already active");
        }
        if let Err(e) = lock(&self.conn).set_debuggee_volatile(true) {
            self.volatile.store(false, Ordering::SeqCst);
            return Err(e);
        }
        Ok(VolatileGuard {
            conn: self.conn.clone(),
            flag: self.volatile.clone(),
        })
    }

    /// Hook before a continue: make sure progress indication can run.
    pub(crate) fn continue_pre(&self) -> Result<()> {
        if self.is_volatile() {
            return Ok(());
        }
        lock(&self.conn).clear_interrupt()
    }

    /// Hook after a continue, on success and failure alike.
    pub(crate) fn continue_post(&self) {
        if self.is_volatile() {
            return;
        }
        if let Err(e) = lock(&self.conn).reset_progress_indicator() {
            warn!("could not reset the progress indicator: {e}");
        }
    }

    fn save(&self) {
        let Some(path) = &self.session_path else {
            return;
        };
        if let Err(e) = self.state.save_to(path) {
            warn!("could not save the session file: {e}");
        }
    }
}

/// Driver over the gdb-serial connection of a replay server.
pub struct GdbDriver {
    conn: Arc<Mutex<GdbConn>>,
    pid: i32,
    threads: Vec<Tid>,
    resume_pending: bool,
    server: Option<Child>,
}

impl GdbDriver {
    fn classify(&mut self, sp: StopPacket) -> Result<StopEvent> {
        let sp = self.rewrite_end_of_history(sp)?;
        match sp {
            StopPacket::Stopped { sig, tid } => {
                if sig == SIGKILL {
                    // the rewrite above, or the server's own convention:
                    // recorded history ran out while going forward
                    let status = lock(&self.conn).get_exit_code()?;
                    return Ok(StopEvent {
                        tid,
                        kind: StopKind::Exit { status },
                        signal: sig,
                    });
                }
                if !self.threads.contains(&tid) {
                    self.threads.push(tid);
                }
                let kind = if sig == SIGTRAP {
                    StopKind::Trap
                } else {
                    StopKind::Signal
                };
                Ok(StopEvent {
                    tid,
                    kind,
                    signal: sig,
                })
            }
            StopPacket::Exited { code } => Ok(StopEvent {
                tid: self.pid,
                kind: StopKind::Exit { status: code },
                signal: 0,
            }),
            StopPacket::Terminated { sig } => Ok(StopEvent {
                tid: self.pid,
                kind: StopKind::Exit {
                    status: -(sig as i32),
                },
                signal: sig,
            }),
        }
    }

    /// At the end of recorded history the stop signal becomes SIGKILL,
    /// matching the convention of compatible recorders, so that higher
    /// layers can tell recorded-history exhaustion from a live exit.
    fn rewrite_end_of_history(&mut self, sp: StopPacket) -> Result<StopPacket> {
        if !matches!(sp, StopPacket::Stopped { .. }) {
            return Ok(sp);
        }
        if lock(&self.conn).at_end_of_history()? {
            Ok(sp.with_signal(SIGKILL))
        } else {
            Ok(sp)
        }
    }
}

impl Driver for GdbDriver {
    fn pid(&self) -> i32 {
        self.pid
    }

    fn list_threads(&mut self) -> Result<Vec<Tid>> {
        Ok(self.threads.clone())
    }

    fn wait(&mut self) -> Result<StopEvent> {
        if self.resume_pending {
            lock(&self.conn).send_continue()?;
            self.resume_pending = false;
        }
        let sp = lock(&self.conn).read_stop()?;
        self.classify(sp)
    }

    fn wait_thread(&mut self, _tid: Tid) -> Result<StopEvent> {
        let sp = lock(&self.conn).read_stop()?;
        self.classify(sp)
    }

    fn cont(&mut self, _tid: Tid, _signal: u8) -> Result<()> {
        // the serial protocol resumes the whole target; per-thread
        // resume requests collapse into one continue at wait time
        self.resume_pending = true;
        Ok(())
    }

    fn single_step(&mut self, _tid: Tid) -> Result<()> {
        lock(&self.conn).send_step()
    }

    fn halt(&mut self) -> Result<()> {
        lock(&self.conn).interrupt()
    }

    fn register_thread(&mut self, tid: Tid) -> Result<()> {
        if !self.threads.contains(&tid) {
            self.threads.push(tid);
        }
        Ok(())
    }

    fn read_memory(&mut self, _tid: Tid, addr: Addr, n: usize) -> Result<Vec<u8>> {
        if n == 0 {
            return Ok(Vec::new());
        }
        lock(&self.conn).read_memory(addr, n)
    }

    fn write_memory(&mut self, _tid: Tid, addr: Addr, data: &[u8]) -> Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        lock(&self.conn).write_memory(addr, data)
    }

    fn get_regs(&mut self, _tid: Tid) -> Result<Registers> {
        lock(&self.conn).read_registers()
    }

    fn set_regs(&mut self, _tid: Tid, regs: &Registers) -> Result<()> {
        lock(&self.conn).write_registers(regs)
    }

    fn peek_user(&mut self, _tid: Tid, _offset: u64) -> Result<u64> {
        Err(DebuggerError::Io(std::io::Error::other(
            "no user area on a replay target",
        )))
    }

    fn poke_user(&mut self, _tid: Tid, _offset: u64, _word: u64) -> Result<()> {
        Err(DebuggerError::Io(std::io::Error::other(
            "no user area on a replay target",
        )))
    }

    fn supports_hardware_breakpoints(&self) -> bool {
        false
    }

    fn set_hw_breakpoint(&mut self, _tid: Tid, _slot: usize, _addr: Addr) -> Result<()> {
        Err(DebuggerError::OutOfSlots)
    }

    fn clear_hw_breakpoint(&mut self, _tid: Tid, _slot: usize) -> Result<()> {
        Err(DebuggerError::OutOfSlots)
    }

    fn detach(&mut self, _kill: bool) -> Result<()> {
        // a replay target is never left running; drop the server too
        let _ = lock(&self.conn).exec("D");
        if let Some(mut server) = self.server.take() {
            let _ = server.kill();
            let _ = server.wait();
        }
        Ok(())
    }
}

impl Drop for GdbDriver {
    fn drop(&mut self) {
        if let Some(mut server) = self.server.take() {
            let _ = server.kill();
            let _ = server.wait();
        }
    }
}

// ------------------------------------------------------------- entry points

/// Whether `path` is a LiveRecorder recording, judged by its magic.
pub fn is_recording(path: &Path) -> Result<bool> {
    let mut file = std::fs::File::open(path)?;
    let mut magic = [0u8; RECORDING_MAGIC.len()];
    match std::io::Read::read_exact(&mut file, &mut magic) {
        Ok(()) => Ok(&magic == RECORDING_MAGIC),
        Err(_) => Ok(false),
    }
}

fn find_in_path(name: &str) -> Option<PathBuf> {
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.is_file())
}

/// Full path of the replay server, found next to the replayer binary.
fn server_path() -> Result<PathBuf> {
    let server_file = match crate::arch::Arch::host() {
        crate::arch::Arch::X86_64 => "udbserver_x64",
        crate::arch::Arch::Arm64 => "udbserver_arm64",
    };
    let udb = find_in_path("udb").ok_or(DebuggerError::BackendUnavailable)?;
    let udb = std::fs::canonicalize(udb)?;
    let dir = udb.parent().ok_or(DebuggerError::BackendUnavailable)?;
    Ok(dir.join(server_file))
}

/// Check that the recorder and replay server are installed.
pub fn backend_available() -> Result<()> {
    let server = server_path()?;
    if !server.is_file() || find_in_path("live-record").is_none() {
        return Err(DebuggerError::BackendUnavailable);
    }
    Ok(())
}

fn free_port() -> Result<u16> {
    let listener = std::net::TcpListener::bind(("127.0.0.1", 0))?;
    Ok(listener.local_addr()?.port())
}

/// Record an execution of `cmd`, returning the recording path.
pub fn record(cmd: &[String], cwd: Option<&Path>) -> Result<PathBuf> {
    backend_available()?;
    if cmd.is_empty() {
        return Err(DebuggerError::Parse("nothing to record".into()));
    }
    let recording = std::env::temp_dir().join(format!(
        "undo-{}-{:x}",
        std::process::id(),
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default()
    ));

    let mut recorder = Command::new("live-record");
    recorder.arg("-o").arg(&recording).args(cmd);
    if let Some(dir) = cwd {
        recorder.current_dir(dir);
    }
    info!("recording {:?}", cmd.join(" "));
    // the target itself may fail; only the produced file decides
    let _ = recorder.status();

    if !matches!(is_recording(&recording), Ok(true)) {
        let _ = std::fs::remove_file(&recording);
        return Err(DebuggerError::NotARecording(
            recording.to_string_lossy().to_string(),
        ));
    }
    Ok(recording)
}

/// Replay a recording, returning a stopped [`Process`] positioned at the
/// start of history.
pub fn replay(recording: &Path, oracle: Arc<dyn SymbolOracle>) -> Result<Process> {
    backend_available()?;
    if !matches!(is_recording(recording), Ok(true)) {
        return Err(DebuggerError::NotARecording(
            recording.to_string_lossy().to_string(),
        ));
    }

    let port = free_port()?;
    let server = server_path()?;
    let child = Command::new(&server)
        .arg("--load-file")
        .arg(recording)
        .arg("--connect-port")
        .arg(port.to_string())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|_| DebuggerError::BackendUnavailable)?;
    info!("replaying {} via {}", recording.display(), server.display());

    let mut child = child;
    let setup = (|| -> Result<(GdbConn, Tid, Option<PathBuf>)> {
        let mut conn = GdbConn::connect(port)?;
        let pid = match conn.query_stop()? {
            StopPacket::Stopped { tid, .. } => tid,
            other => {
                return Err(DebuggerError::Parse(format!(
                    "replay target not stopped: {other:?}"
                )))
            }
        };
        let session_path = match session_file_path(&mut conn) {
            Ok(path) => Some(path),
            Err(e) => {
                debug!("no session file available: {e}");
                None
            }
        };
        Ok((conn, pid, session_path))
    })();
    let (conn, pid, session_path) = match setup {
        Ok(parts) => parts,
        Err(e) => {
            let _ = child.kill();
            let _ = child.wait();
            return Err(e);
        }
    };

    let conn = Arc::new(Mutex::new(conn));
    let session = ReplaySession::new(conn.clone(), session_path);
    let driver = GdbDriver {
        conn,
        pid,
        threads: vec![pid],
        resume_pending: false,
        server: Some(child),
    };
    Ok(Process::from_parts(
        Box::new(driver),
        vec![pid],
        oracle,
        Some(session),
    ))
}

/// Record an execution and immediately replay it.
pub fn record_and_replay(
    cmd: &[String],
    cwd: Option<&Path>,
    oracle: Arc<dyn SymbolOracle>,
) -> Result<(Process, PathBuf)> {
    let recording = record(cmd, cwd)?;
    let process = replay(&recording, oracle)?;
    Ok((process, recording))
}

/// Session files live under the replayer's data directory, keyed by the
/// recording UUID: `$XDG_DATA_HOME/undo/sessions/<uuid>.json`, with
/// `~/.local/share` standing in when `XDG_DATA_HOME` is unset.
fn session_file_path(conn: &mut GdbConn) -> Result<PathBuf> {
    let uuid = conn.session_uuid()?;
    let data_dir = std::env::var_os("XDG_DATA_HOME")
        .map(PathBuf::from)
        .or_else(|| {
            std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".local/share"))
        })
        .ok_or_else(|| DebuggerError::Parse("no home directory".into()))?;
    let sessions = data_dir.join("undo").join("sessions");
    std::fs::create_dir_all(&sessions)?;
    Ok(sessions.join(format!("{uuid}.json")))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_validate_note() {
        validate_note("before the bug").unwrap();
        validate_note("checkpoint1").unwrap();
        assert!(validate_note("").is_err());
        assert!(validate_note(" padded").is_err());
        assert!(validate_note("1st try").is_err());
        assert!(validate_note(",comma").is_err());
        assert!(validate_note("-dash").is_err());
        assert!(validate_note("$dollar").is_err());
        for word in RESERVED_NOTE_WORDS {
            assert!(validate_note(&format!("{word} here")).is_err());
            assert!(validate_note(word).is_err());
        }
        // reserved words only match as the whole first word
        validate_note("ending soon").unwrap();
        validate_note("undoing").unwrap();
    }

    #[test]
    fn test_time_string_grouping() {
        assert_eq!(time_string(0, 0), "0:0x0");
        assert_eq!(time_string(999, 0x40), "999:0x40");
        assert_eq!(time_string(1000, 0), "1,000:0x0");
        assert_eq!(time_string(1234567, 0xabc), "1,234,567:0xabc");
        assert_eq!(time_string(1000000, 0), "1,000,000:0x0");
    }

    #[test]
    fn test_resolve_positions() {
        let mut state = SessionState::new();
        let id = state.create("1a,40".into(), "one".into());
        assert_eq!(id, 1);

        assert_eq!(state.resolve("").unwrap(), TravelTarget::Start);
        assert_eq!(state.resolve("start").unwrap(), TravelTarget::Start);
        assert_eq!(state.resolve("end").unwrap(), TravelTarget::End);
        assert_eq!(state.resolve("c1").unwrap(), TravelTarget::Time(0x1a, 0x40));
        assert!(matches!(
            state.resolve("c7"),
            Err(DebuggerError::UnknownCheckpoint(7))
        ));
        assert_eq!(state.resolve("1234").unwrap(), TravelTarget::Time(1234, 0));
        assert_eq!(
            state.resolve("1,234,567").unwrap(),
            TravelTarget::Time(1234567, 0)
        );
        assert_eq!(
            state.resolve("1234:0xdead").unwrap(),
            TravelTarget::Time(1234, 0xdead)
        );
        assert!(state.resolve("sideways").is_err());
        assert!(state.resolve("12:dead").is_err());
    }

    #[test]
    fn test_checkpoint_ids_are_monotonic() {
        let mut state = SessionState::new();
        assert_eq!(state.create("1,0".into(), "a".into()), 1);
        assert_eq!(state.create("2,0".into(), "b".into()), 2);
        state.remove(1).unwrap();
        // removed ids are not reused
        assert_eq!(state.create("3,0".into(), "c".into()), 3);
    }

    fn temp_session_path(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("coretap-session-{tag}-{}.json", std::process::id()))
    }

    #[test]
    fn test_session_roundtrip() {
        let path = temp_session_path("roundtrip");
        let mut state = SessionState::new();
        state.create("1a,40".into(), "one".into());
        state.create("2b,0".into(), "two".into());
        state.save_to(&path).unwrap();

        let loaded = SessionState::load_from(&path).unwrap();
        let notes: Vec<String> = loaded.list().into_iter().map(|c| c.note).collect();
        assert!(notes.contains(&"one".to_string()));
        assert!(notes.contains(&"two".to_string()));
        let whens: Vec<String> = loaded.list().into_iter().map(|c| c.when).collect();
        assert!(whens.contains(&"1a,40".to_string()));
        assert!(whens.contains(&"2b,0".to_string()));
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_duplicate_notes_get_suffixes_without_cascading() {
        let path = temp_session_path("dedup");
        let mut state = SessionState::new();
        state.create("1,0".into(), "test".into());
        state.create("2,0".into(), "test".into());
        state.save_to(&path).unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        let file: SessionFile = serde_json::from_str(&raw).unwrap();
        let mut names: Vec<&String> = file.bookmarks.keys().collect();
        names.sort();
        assert_eq!(names, ["test", "test-0"]);

        // re-saving the loaded set must not produce test-0-0
        let reloaded = SessionState::load_from(&path).unwrap();
        reloaded.save_to(&path).unwrap();
        let raw = std::fs::read_to_string(&path).unwrap();
        let file: SessionFile = serde_json::from_str(&raw).unwrap();
        let mut names: Vec<&String> = file.bookmarks.keys().collect();
        names.sort();
        assert_eq!(names, ["test", "test-0"]);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_session_file_rejects_unknown_fields() {
        let path = temp_session_path("unknown");
        std::fs::write(
            &path,
            r#"{ "bookmarks": {}, "surprise": true }"#,
        )
        .unwrap();
        assert!(SessionState::load_from(&path).is_err());
        std::fs::write(
            &path,
            r#"{ "bookmarks": { "note": { "bbcount": 3, "pc": 7, "extra": 1 } } }"#,
        )
        .unwrap();
        assert!(SessionState::load_from(&path).is_err());
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_recording_magic_detection() {
        let path = temp_session_path("magic");
        std::fs::write(&path, b"ELF not a recording").unwrap();
        assert!(!is_recording(&path).unwrap());
        let mut data = RECORDING_MAGIC.to_vec();
        data.extend_from_slice(b"trailing recording data");
        std::fs::write(&path, &data).unwrap();
        assert!(is_recording(&path).unwrap());
        std::fs::remove_file(&path).unwrap();
    }
}
