//! gdb-remote serial connection to a replay server.
//!
//! Implements just enough of the gdb serial protocol for time travel:
//! packet framing with checksums and acks, run-length decoding, the
//! continue/step/stop-reply cycle (forward and reverse), register and
//! memory transfer, and the `vUDB` vendor extension the replayer speaks.

use std::io::{BufReader, Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, trace, warn};

use crate::addr::Addr;
use crate::driver::Tid;
use crate::errors::{DebuggerError, Result};
use crate::regs::Registers;

/// Direction of travel for continue and step on a recorded target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Direction {
    Forward,
    Backward,
}

/// A parsed stop reply (`T`, `S`, `W` or `X` packet).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopPacket {
    /// `T`/`S`: the target stopped with a signal.
    Stopped { sig: u8, tid: Tid },
    /// `W`: the target exited with a code.
    Exited { code: i32 },
    /// `X`: the target was terminated by a signal.
    Terminated { sig: u8 },
}

impl StopPacket {
    pub fn with_signal(self, sig: u8) -> Self {
        match self {
            StopPacket::Stopped { tid, .. } => StopPacket::Stopped { sig, tid },
            other => other,
        }
    }
}

pub struct GdbConn {
    writer: TcpStream,
    reader: BufReader<TcpStream>,
    pub direction: Direction,
}

impl GdbConn {
    /// Connect to a freshly spawned server, retrying while it boots.
    pub fn connect(port: u16) -> Result<Self> {
        let addr = format!("127.0.0.1:{port}");
        let mut last_err = None;
        for _ in 0..50 {
            match TcpStream::connect(&addr) {
                Ok(stream) => {
                    stream.set_nodelay(true)?;
                    let reader = BufReader::new(stream.try_clone()?);
                    debug!("connected to replay server on {addr}");
                    return Ok(Self {
                        writer: stream,
                        reader,
                        direction: Direction::Forward,
                    });
                }
                Err(e) => {
                    last_err = Some(e);
                    std::thread::sleep(Duration::from_millis(100));
                }
            }
        }
        Err(last_err
            .map(DebuggerError::Io)
            .unwrap_or(DebuggerError::BackendUnavailable))
    }

    fn send(&mut self, payload: &str) -> Result<()> {
        let checksum: u8 = payload.bytes().fold(0u8, u8::wrapping_add);
        let frame = format!("${payload}#{checksum:02x}");
        trace!("-> {frame}");
        self.writer.write_all(frame.as_bytes())?;
        self.writer.flush()?;
        // the ack for our packet
        loop {
            match self.read_byte()? {
                b'+' => return Ok(()),
                b'-' => {
                    warn!("replay server rejected a packet, resending");
                    self.writer.write_all(frame.as_bytes())?;
                    self.writer.flush()?;
                }
                other => {
                    return Err(DebuggerError::Parse(format!(
                        "expected ack, got {:#x}",
                        other
                    )))
                }
            }
        }
    }

    fn read_byte(&mut self) -> Result<u8> {
        let mut byte = [0u8; 1];
        self.reader.read_exact(&mut byte)?;
        Ok(byte[0])
    }

    /// Read one `$...#cs` frame, undoing escapes and run-length encoding.
    fn recv(&mut self) -> Result<String> {
        loop {
            match self.read_byte()? {
                b'$' => break,
                b'+' | b'-' => continue,
                other => {
                    return Err(DebuggerError::Parse(format!(
                        "expected packet start, got {:#x}",
                        other
                    )))
                }
            }
        }
        let mut raw = Vec::new();
        let mut sum = 0u8;
        loop {
            let b = self.read_byte()?;
            if b == b'#' {
                break;
            }
            sum = sum.wrapping_add(b);
            raw.push(b);
        }
        let mut cs = [0u8; 2];
        self.reader.read_exact(&mut cs)?;
        let sent = u8::from_str_radix(std::str::from_utf8(&cs).unwrap_or("zz"), 16)
            .map_err(|_| DebuggerError::Parse("bad packet checksum".into()))?;
        if sent != sum {
            self.writer.write_all(b"-")?;
            return Err(DebuggerError::Parse("packet checksum mismatch".into()));
        }
        self.writer.write_all(b"+")?;
        self.writer.flush()?;

        // undo escaping (0x7d) and run-length encoding (*)
        let mut out = Vec::with_capacity(raw.len());
        let mut i = 0;
        while i < raw.len() {
            match raw[i] {
                0x7d if i + 1 < raw.len() => {
                    out.push(raw[i + 1] ^ 0x20);
                    i += 2;
                }
                b'*' if i + 1 < raw.len() && !out.is_empty() => {
                    let count = raw[i + 1].saturating_sub(29) as usize;
                    let last = *out.last().unwrap();
                    out.extend(std::iter::repeat(last).take(count));
                    i += 2;
                }
                b => {
                    out.push(b);
                    i += 1;
                }
            }
        }
        let text = String::from_utf8_lossy(&out).to_string();
        trace!("<- {text}");
        Ok(text)
    }

    /// Send a command and read its reply.
    pub fn exec(&mut self, cmd: &str) -> Result<String> {
        self.send(cmd)?;
        let resp = self.recv()?;
        if resp.starts_with('E') && resp.len() == 3 {
            return Err(DebuggerError::Parse(format!(
                "error reply to {cmd:?}: {resp}"
            )));
        }
        Ok(resp)
    }

    /// Execute a `vUDB` vendor command.
    pub fn vudb(&mut self, args: &[&str]) -> Result<String> {
        assert!(!args.is_empty(), "vUDB requires at least one argument");
        let mut cmd = String::from("vUDB");
        for arg in args {
            cmd.push(';');
            cmd.push_str(arg);
        }
        self.exec(&cmd)
    }

    // --------------------------------------------------------- run control

    /// Ask for the current (initial) stop reply.
    pub fn query_stop(&mut self) -> Result<StopPacket> {
        let resp = self.exec("?")?;
        parse_stop_packet(&resp)
    }

    /// Send a continue in the current direction. The stop reply is read
    /// separately with [`Self::read_stop`].
    pub fn send_continue(&mut self) -> Result<()> {
        match self.direction {
            Direction::Forward => self.send("c"),
            Direction::Backward => self.send("bc"),
        }
    }

    /// Send a single-step in the current direction.
    pub fn send_step(&mut self) -> Result<()> {
        match self.direction {
            Direction::Forward => self.send("s"),
            Direction::Backward => self.send("bs"),
        }
    }

    /// Read the stop reply of an in-flight continue or step.
    pub fn read_stop(&mut self) -> Result<StopPacket> {
        let resp = self.recv()?;
        parse_stop_packet(&resp)
    }

    /// Send the gdb interrupt byte to stop a running target.
    pub fn interrupt(&mut self) -> Result<()> {
        self.writer.write_all(&[0x03])?;
        self.writer.flush()?;
        Ok(())
    }

    // ------------------------------------------------------ registers, mem

    pub fn read_registers(&mut self) -> Result<Registers> {
        let resp = self.exec("g")?;
        parse_registers(&resp)
    }

    pub fn write_registers(&mut self, regs: &Registers) -> Result<()> {
        let resp = self.exec(&format!("G{}", encode_registers(regs)))?;
        expect_ok("G", &resp)
    }

    pub fn read_memory(&mut self, addr: Addr, n: usize) -> Result<Vec<u8>> {
        let resp = self.exec(&format!("m{:x},{:x}", addr.u64(), n))?;
        let bytes = from_hex(&resp)?;
        if bytes.len() != n {
            return Err(DebuggerError::OutOfBounds { addr, len: n });
        }
        Ok(bytes)
    }

    pub fn write_memory(&mut self, addr: Addr, data: &[u8]) -> Result<usize> {
        let resp = self.exec(&format!(
            "M{:x},{:x}:{}",
            addr.u64(),
            data.len(),
            to_hex(data)
        ))?;
        expect_ok("M", &resp)?;
        Ok(data.len())
    }

    // --------------------------------------------------------- vUDB verbs

    /// Current position in recorded history as `(bbcount, pc)`.
    pub fn get_time(&mut self) -> Result<(u64, u64)> {
        let resp = self.vudb(&["get_time"])?;
        parse_server_time(&resp)
    }

    /// Current position, in the raw serial representation.
    pub fn get_time_raw(&mut self) -> Result<String> {
        let (bbcount, pc) = self.get_time()?;
        Ok(format!("{bbcount:x},{pc:x}"))
    }

    /// Minimum and maximum bbcount of recorded history.
    pub fn get_log_extent(&mut self) -> Result<(u64, u64)> {
        let resp = self.vudb(&["get_log_extent"])?;
        parse_server_time(&resp)
    }

    /// `get_info` fields, split on `;` and `,`.
    pub fn get_info(&mut self) -> Result<Vec<String>> {
        let resp = self.vudb(&["get_info"])?;
        Ok(resp
            .split(|c| c == ';' || c == ',')
            .map(str::to_string)
            .collect())
    }

    /// Whether the session sits at the end of recorded history.
    pub fn at_end_of_history(&mut self) -> Result<bool> {
        let fields = self.get_info()?;
        Ok(fields
            .iter()
            .any(|f| f == "has_exited" || f == "at_event_log_end"))
    }

    /// Exit code recorded for the target, zero when it has not exited.
    /// Positive for a normal exit, negative signal number otherwise.
    pub fn get_exit_code(&mut self) -> Result<i32> {
        let fields = self.get_info()?;
        let Some(idx) = fields.iter().position(|f| f == "has_exited") else {
            return Ok(0);
        };
        let raw = fields
            .get(idx + 1)
            .ok_or_else(|| DebuggerError::Parse("has_exited without a status".into()))?;
        let wait_status = i64::from_str_radix(raw, 16)
            .map_err(|_| DebuggerError::Parse(format!("bad exit status: {raw}")))? as i32;
        // decode a wait(2) status word
        let sig = wait_status & 0x7f;
        if sig != 0 {
            Ok(-sig)
        } else {
            Ok((wait_status >> 8) & 0xff)
        }
    }

    /// UUID identifying the recording session, from `get_recording_ids`.
    pub fn session_uuid(&mut self) -> Result<String> {
        let resp = self.vudb(&["get_recording_ids"])?;
        let uuids: Vec<&str> = resp.split(';').collect();
        if uuids.len() != 3 || uuids[1].is_empty() {
            // the protocol guarantees three ids; anything else is a bug
            panic!("unexpected response from get_recording_ids: {resp:?}");
        }
        Ok(uuids[1].to_string())
    }

    pub fn goto_time(&mut self, bbcount: u64, pc: u64) -> Result<()> {
        self.vudb(&["goto_time", &format!("{bbcount:x}"), &format!("{pc:x}")])?;
        Ok(())
    }

    pub fn goto_record_mode(&mut self) -> Result<()> {
        self.vudb(&["goto_record_mode"])?;
        Ok(())
    }

    pub fn set_debuggee_volatile(&mut self, on: bool) -> Result<()> {
        self.vudb(&["set_debuggee_volatile", if on { "1" } else { "0" }])?;
        Ok(())
    }

    pub fn clear_interrupt(&mut self) -> Result<()> {
        self.vudb(&["clear_interrupt"])?;
        Ok(())
    }

    pub fn reset_progress_indicator(&mut self) -> Result<()> {
        self.vudb(&["reset_progress_indicator"])?;
        Ok(())
    }
}

fn expect_ok(cmd: &str, resp: &str) -> Result<()> {
    if resp == "OK" {
        Ok(())
    } else {
        Err(DebuggerError::Parse(format!(
            "unexpected reply to {cmd}: {resp:?}"
        )))
    }
}

/// Parse a `<hex>,<hex>` pair, the wire form of both times and extents.
pub fn parse_server_time(resp: &str) -> Result<(u64, u64)> {
    let (a, b) = resp
        .split_once(',')
        .ok_or_else(|| DebuggerError::Parse(format!("malformed time: {resp:?}")))?;
    let bbcount = u64::from_str_radix(a, 16)
        .map_err(|_| DebuggerError::Parse(format!("malformed bbcount: {a:?}")))?;
    let pc = u64::from_str_radix(b, 16)
        .map_err(|_| DebuggerError::Parse(format!("malformed pc: {b:?}")))?;
    Ok((bbcount, pc))
}

pub fn parse_stop_packet(resp: &str) -> Result<StopPacket> {
    let mut chars = resp.chars();
    match chars.next() {
        Some('T') => {
            let sig = u8::from_str_radix(resp.get(1..3).unwrap_or(""), 16)
                .map_err(|_| DebuggerError::Parse(format!("bad stop packet: {resp:?}")))?;
            let tid = resp
                .get(3..)
                .and_then(|rest| {
                    rest.split(';').find_map(|field| {
                        let (key, value) = field.split_once(':')?;
                        if key != "thread" {
                            return None;
                        }
                        // either a bare tid or the p<pid>.<tid> form
                        let tid_part = value.rsplit('.').next()?;
                        i64::from_str_radix(tid_part, 16).ok()
                    })
                })
                .unwrap_or(1) as Tid;
            Ok(StopPacket::Stopped { sig, tid })
        }
        Some('S') => {
            let sig = u8::from_str_radix(resp.get(1..3).unwrap_or(""), 16)
                .map_err(|_| DebuggerError::Parse(format!("bad stop packet: {resp:?}")))?;
            Ok(StopPacket::Stopped { sig, tid: 1 })
        }
        Some('W') => {
            let code = i32::from_str_radix(resp.get(1..).unwrap_or("").split(';').next().unwrap_or(""), 16)
                .map_err(|_| DebuggerError::Parse(format!("bad exit packet: {resp:?}")))?;
            Ok(StopPacket::Exited { code })
        }
        Some('X') => {
            let sig = u8::from_str_radix(resp.get(1..3).unwrap_or(""), 16)
                .map_err(|_| DebuggerError::Parse(format!("bad exit packet: {resp:?}")))?;
            Ok(StopPacket::Terminated { sig })
        }
        _ => Err(DebuggerError::Parse(format!(
            "unrecognised stop packet: {resp:?}"
        ))),
    }
}

/// Register order of the x86-64 `g`/`G` packet.
const G_PACKET_ORDER: usize = 17;

pub fn parse_registers(hex: &str) -> Result<Registers> {
    let bytes = from_hex(hex)?;
    if bytes.len() < G_PACKET_ORDER * 8 + 4 {
        return Err(DebuggerError::Parse(format!(
            "short g packet: {} bytes",
            bytes.len()
        )));
    }
    let u64_at = |i: usize| -> u64 {
        u64::from_le_bytes(bytes[i * 8..i * 8 + 8].try_into().unwrap())
    };
    let mut regs = Registers {
        rax: u64_at(0),
        rbx: u64_at(1),
        rcx: u64_at(2),
        rdx: u64_at(3),
        rsi: u64_at(4),
        rdi: u64_at(5),
        rbp: u64_at(6),
        rsp: u64_at(7),
        r8: u64_at(8),
        r9: u64_at(9),
        r10: u64_at(10),
        r11: u64_at(11),
        r12: u64_at(12),
        r13: u64_at(13),
        r14: u64_at(14),
        r15: u64_at(15),
        rip: u64_at(16),
        ..Registers::default()
    };
    let base = G_PACKET_ORDER * 8;
    let u32_at = |i: usize| -> u64 {
        u32::from_le_bytes(bytes[base + i * 4..base + i * 4 + 4].try_into().unwrap()) as u64
    };
    regs.eflags = u32_at(0);
    if bytes.len() >= base + 7 * 4 {
        regs.cs = u32_at(1);
        regs.ss = u32_at(2);
        regs.ds = u32_at(3);
        regs.es = u32_at(4);
        regs.fs = u32_at(5);
        regs.gs = u32_at(6);
    }
    Ok(regs)
}

pub fn encode_registers(regs: &Registers) -> String {
    let mut bytes = Vec::with_capacity(G_PACKET_ORDER * 8 + 7 * 4);
    for v in [
        regs.rax, regs.rbx, regs.rcx, regs.rdx, regs.rsi, regs.rdi, regs.rbp, regs.rsp,
        regs.r8, regs.r9, regs.r10, regs.r11, regs.r12, regs.r13, regs.r14, regs.r15,
        regs.rip,
    ] {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    for v in [
        regs.eflags, regs.cs, regs.ss, regs.ds, regs.es, regs.fs, regs.gs,
    ] {
        bytes.extend_from_slice(&(v as u32).to_le_bytes());
    }
    to_hex(&bytes)
}

pub fn to_hex(data: &[u8]) -> String {
    let mut s = String::with_capacity(data.len() * 2);
    for b in data {
        s.push_str(&format!("{b:02x}"));
    }
    s
}

pub fn from_hex(s: &str) -> Result<Vec<u8>> {
    if s.len() % 2 != 0 {
        return Err(DebuggerError::Parse("odd-length hex reply".into()));
    }
    (0..s.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&s[i..i + 2], 16)
                .map_err(|_| DebuggerError::Parse(format!("bad hex reply: {s:?}")))
        })
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse_server_time() {
        assert_eq!(parse_server_time("1a2b,40").unwrap(), (0x1a2b, 0x40));
        assert!(parse_server_time("1a2b").is_err());
        assert!(parse_server_time("xyz,40").is_err());
    }

    #[test]
    fn test_parse_stop_packets() {
        assert_eq!(
            parse_stop_packet("T05thread:p2a.2b;").unwrap(),
            StopPacket::Stopped { sig: 5, tid: 0x2b }
        );
        assert_eq!(
            parse_stop_packet("T09thread:3;").unwrap(),
            StopPacket::Stopped { sig: 9, tid: 3 }
        );
        assert_eq!(
            parse_stop_packet("S05").unwrap(),
            StopPacket::Stopped { sig: 5, tid: 1 }
        );
        assert_eq!(parse_stop_packet("W00").unwrap(), StopPacket::Exited { code: 0 });
        assert_eq!(parse_stop_packet("X09").unwrap(), StopPacket::Terminated { sig: 9 });
        assert!(parse_stop_packet("vStopped").is_err());
    }

    #[test]
    fn test_stop_packet_signal_rewrite() {
        let sp = StopPacket::Stopped { sig: 5, tid: 1 };
        assert_eq!(
            sp.with_signal(9),
            StopPacket::Stopped { sig: 9, tid: 1 }
        );
        let exited = StopPacket::Exited { code: 0 };
        assert_eq!(exited.with_signal(9), exited);
    }

    #[test]
    fn test_register_packet_roundtrip() {
        let mut regs = Registers::default();
        regs.rax = 0x1122334455667788;
        regs.rip = 0xdeadbeef;
        regs.eflags = 0x246;
        regs.cs = 0x33;
        let parsed = parse_registers(&encode_registers(&regs)).unwrap();
        assert_eq!(parsed, regs);
    }

    #[test]
    fn test_hex_roundtrip() {
        let data = vec![0x00, 0xcc, 0xff, 0x7d];
        assert_eq!(from_hex(&to_hex(&data)).unwrap(), data);
        assert!(from_hex("abc").is_err());
        assert!(from_hex("zz").is_err());
    }

    #[test]
    fn test_exit_code_decoding() {
        // wait statuses: normal exit 3 => 0x0300, SIGKILL => 9
        assert_eq!(decode_wait_status(0x0300), 3);
        assert_eq!(decode_wait_status(9), -9);
        assert_eq!(decode_wait_status(0), 0);
    }

    fn decode_wait_status(wait_status: i32) -> i32 {
        let sig = wait_status & 0x7f;
        if sig != 0 {
            -sig
        } else {
            (wait_status >> 8) & 0xff
        }
    }
}
