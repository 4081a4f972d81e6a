//! GDB remote serial protocol stub
//!
//! Serves one packet at a time from any byte stream, usually a TCP
//! connection accepted with `GdbRemote::accept`. Continue runs the core in
//! slices until something stops it; use the core's `ControlHandle` from
//! another thread to interrupt a running target.

use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream};

use crate::debugger::{StopReason, WatchKind};
use crate::error::PsxError;
use crate::system::CpuCore;

use self::reply::Reply;

pub(super) mod reply;

pub type GdbResult = Result<(), ()>;

/// Cycles run between stop checks while continuing
const RUN_SLICE_CYCLES: u64 = 1_000_000;

/// GDB expects the 38 integer registers followed by the FPU ones
const GDB_REGISTER_COUNT: u32 = 73;
const CPU_REGISTER_COUNT: u32 = 38;

pub struct GdbRemote<S: Read + Write> {
    remote: S,
}

impl GdbRemote<TcpStream> {
    /// Wait for GDB to connect
    pub fn accept(listener: &TcpListener) -> io::Result<Self> {
        info!("Debugger waiting for gdb connection...");
        let (stream, sockaddr) = listener.accept()?;
        info!("Connection from {}", sockaddr);
        Ok(GdbRemote::new(stream))
    }
}

impl<S: Read + Write> GdbRemote<S> {
    pub fn new(remote: S) -> Self {
        GdbRemote { remote }
    }

    /// Serve requests until GDB detaches, kills the target or the stream
    /// closes
    pub fn serve_session(&mut self, core: &mut CpuCore) {
        while self.serve(core).is_ok() {}
        info!("GDB session over");
    }

    /// Serve a single remote request. `Err` ends the session.
    pub fn serve(&mut self, core: &mut CpuCore) -> GdbResult {
        match self.next_packet() {
            PacketResult::Ok(packet) => {
                self.ack()?;
                self.handle_packet(core, &packet)
            }
            PacketResult::BadChecksum(_) => self.nack(),
            PacketResult::EndOfStream => Err(()),
        }
    }

    fn next_packet(&mut self) -> PacketResult {
        enum State {
            WaitForStart,
            InPacket,
            WaitForCheckSum,
            WaitForCheckSum2(u8),
        }

        let mut state = State::WaitForStart;
        let mut packet = Vec::new();
        let mut csum = 0u8;

        for r in (&mut self.remote).bytes() {
            let byte = match r {
                Ok(b) => b,
                Err(e) => {
                    warn!("GDB remote error: {}", e);
                    return PacketResult::EndOfStream;
                }
            };

            match state {
                State::WaitForStart => {
                    if byte == b'$' {
                        state = State::InPacket;
                    }
                }
                State::InPacket => {
                    if byte == b'#' {
                        state = State::WaitForCheckSum;
                    } else {
                        packet.push(byte);
                        csum = csum.wrapping_add(byte);
                    }
                }
                State::WaitForCheckSum => match ascii_hex(byte) {
                    Some(b) => state = State::WaitForCheckSum2(b),
                    None => {
                        warn!("Got invalid GDB checksum char {}", byte);
                        return PacketResult::BadChecksum(packet);
                    }
                },
                State::WaitForCheckSum2(c1) => {
                    return match ascii_hex(byte) {
                        Some(c2) if (c1 << 4) | c2 == csum => PacketResult::Ok(packet),
                        Some(c2) => {
                            warn!(
                                "Got invalid GDB checksum: {:x} {:x}",
                                (c1 << 4) | c2,
                                csum
                            );
                            PacketResult::BadChecksum(packet)
                        }
                        None => {
                            warn!("Got invalid GDB checksum char {}", byte);
                            PacketResult::BadChecksum(packet)
                        }
                    };
                }
            }
        }

        debug!("GDB remote end of stream");
        PacketResult::EndOfStream
    }

    fn write_raw(&mut self, data: &[u8]) -> GdbResult {
        self.remote
            .write_all(data)
            .and_then(|_| self.remote.flush())
            .map_err(|e| warn!("Couldn't send data to GDB remote: {}", e))
    }

    fn ack(&mut self) -> GdbResult {
        self.write_raw(b"+")
    }

    /// Request packet retransmission
    fn nack(&mut self) -> GdbResult {
        self.write_raw(b"-")
    }

    fn handle_packet(&mut self, core: &mut CpuCore, packet: &[u8]) -> GdbResult {
        let Some((&command, args)) = packet.split_first() else {
            return self.send_empty_reply();
        };

        match command {
            b'?' => self.send_status(),
            b'g' => self.read_registers(core),
            b'p' => self.read_register(core, args),
            b'm' => self.read_memory(core, args),
            b'M' => self.write_memory(core, args),
            b'c' => self.resume(core, args),
            b's' => self.step(core, args),
            b'Z' => self.add_breakpoint(core, args),
            b'z' => self.del_breakpoint(core, args),
            b'q' => self.handle_query(args),
            b'D' => {
                let debugger = core.debugger_mut();
                debugger.clear_breakpoints();
                debugger.clear_watchpoints();
                // already running is fine
                let _ = core.resume();
                self.send_ok()?;
                Err(())
            }
            b'k' => {
                self.send_ok()?;
                Err(())
            }
            _ => self.send_empty_reply(),
        }
    }

    fn send_reply(&mut self, reply: Reply) -> GdbResult {
        self.write_raw(&reply.into_packet())
    }

    fn send_empty_reply(&mut self) -> GdbResult {
        self.send_reply(Reply::new())
    }

    fn send_string(&mut self, string: &[u8]) -> GdbResult {
        let mut reply = Reply::new();
        reply.push(string);
        self.send_reply(reply)
    }

    fn send_error(&mut self) -> GdbResult {
        self.send_string(b"E01")
    }

    fn send_ok(&mut self) -> GdbResult {
        self.send_string(b"OK")
    }

    fn send_status(&mut self) -> GdbResult {
        self.send_string(b"S05")
    }

    fn send_stop(&mut self, reason: StopReason) -> GdbResult {
        match reason {
            StopReason::StopRequested => self.send_string(b"S02"),
            StopReason::Watchpoint { address, kind, .. } => {
                let name = match kind {
                    WatchKind::Write => "watch",
                    WatchKind::Read => "rwatch",
                };
                self.send_string(format!("T05{}:{:08x};", name, address).as_bytes())
            }
            _ => self.send_status(),
        }
    }

    fn register(core: &CpuCore, index: u32) -> Option<u32> {
        let cpu = core.cpu();
        let value = match index {
            0..=31 => cpu.regs.gpr[index as usize],
            32 => cpu.cop0.sr,
            33 => cpu.regs.lo,
            34 => cpu.regs.hi,
            35 => cpu.cop0.bad_vaddr,
            36 => cpu.cop0.cause,
            37 => cpu.regs.pc,
            _ => return None,
        };
        Some(value)
    }

    fn read_registers(&mut self, core: &mut CpuCore) -> GdbResult {
        let mut reply = Reply::new();
        for index in 0..CPU_REGISTER_COUNT {
            reply.push_u32(Self::register(core, index).unwrap_or(0));
        }
        // No FPU: report the rest as unavailable
        for _ in CPU_REGISTER_COUNT..GDB_REGISTER_COUNT {
            reply.push(b"xxxxxxxx");
        }
        self.send_reply(reply)
    }

    fn read_register(&mut self, core: &mut CpuCore, args: &[u8]) -> GdbResult {
        let index = parse_hex(args)?;
        match Self::register(core, index) {
            Some(value) => {
                let mut reply = Reply::new();
                reply.push_u32(value);
                self.send_reply(reply)
            }
            None if index < GDB_REGISTER_COUNT => self.send_string(b"xxxxxxxx"),
            None => self.send_error(),
        }
    }

    /// `ADDR,LEN`. Stops at the first unreadable byte.
    fn read_memory(&mut self, core: &mut CpuCore, args: &[u8]) -> GdbResult {
        let (addr, len) = parse_addr_len(args)?;
        if len == 0 {
            return self.send_error();
        }

        let mut reply = Reply::new();
        let mut sent = 0;
        for i in 0..len {
            let addr = addr.wrapping_add(i);
            match core.bus().peek_word(addr) {
                Some(word) => reply.push_u8((word >> ((addr & 3) * 8)) as u8),
                None => break,
            }
            sent += 1;
        }

        if sent == 0 {
            self.send_error()
        } else {
            self.send_reply(reply)
        }
    }

    /// `ADDR,LEN:DATA`, RAM and scratchpad only
    fn write_memory(&mut self, core: &mut CpuCore, args: &[u8]) -> GdbResult {
        let mut parts = args.splitn(2, |&b| b == b':');
        let addr_len = parts.next().ok_or(())?;
        let data = parts.next().ok_or(())?;
        let (addr, len) = parse_addr_len(addr_len)?;

        if data.len() < len as usize * 2 {
            return self.send_error();
        }

        let bus = core.bus_mut();
        for (i, pair) in data.chunks(2).take(len as usize).enumerate() {
            let byte = (parse_hex(pair)? & 0xff) as u32;
            let addr = addr.wrapping_add(i as u32);
            let shift = (addr & 3) * 8;
            let Some(word) = bus.peek_word(addr) else {
                return self.send_error();
            };
            let word = (word & !(0xff << shift)) | (byte << shift);
            if bus.poke_word(addr, word).is_err() {
                return self.send_error();
            }
        }

        self.send_ok()
    }

    fn jump_if_requested(core: &mut CpuCore, args: &[u8]) -> GdbResult {
        if !args.is_empty() {
            let addr = parse_hex(args)?;
            core.cpu_mut().regs.jump_to(addr);
        }
        Ok(())
    }

    /// Continue until a breakpoint, a watchpoint or a stop request
    fn resume(&mut self, core: &mut CpuCore, args: &[u8]) -> GdbResult {
        Self::jump_if_requested(core, args)?;
        // a core that isn't paused just keeps running
        let _ = core.resume();

        loop {
            if let Some(reason) = core.run(RUN_SLICE_CYCLES).stop {
                return self.send_stop(reason);
            }
        }
    }

    fn step(&mut self, core: &mut CpuCore, args: &[u8]) -> GdbResult {
        Self::jump_if_requested(core, args)?;
        core.step();
        self.send_status()
    }

    fn add_breakpoint(&mut self, core: &mut CpuCore, args: &[u8]) -> GdbResult {
        // command lists are not supported
        if args.contains(&b';') {
            return self.send_error();
        }

        let (btype, addr, kind) = parse_breakpoint(args)?;
        let debugger = core.debugger_mut();
        let result = match btype {
            // 32 bit MIPS mode is the only breakpoint kind
            b'0' if kind == b'4' => debugger.add_breakpoint(addr),
            b'0' => return self.send_error(),
            b'2' => debugger.add_watchpoint(addr, WatchKind::Write),
            b'3' => debugger.add_watchpoint(addr, WatchKind::Read),
            _ => return self.send_empty_reply(),
        };

        match result {
            Ok(()) | Err(PsxError::DuplicateBreakpoint(_)) => self.send_ok(),
            Err(_) => self.send_error(),
        }
    }

    fn del_breakpoint(&mut self, core: &mut CpuCore, args: &[u8]) -> GdbResult {
        let (btype, addr, _kind) = parse_breakpoint(args)?;
        let debugger = core.debugger_mut();
        let result = match btype {
            b'0' => debugger.remove_breakpoint(addr),
            b'2' => debugger.remove_watchpoint(addr, WatchKind::Write),
            b'3' => debugger.remove_watchpoint(addr, WatchKind::Read),
            _ => return self.send_empty_reply(),
        };

        match result {
            Ok(()) => self.send_ok(),
            Err(_) => self.send_error(),
        }
    }

    fn handle_query(&mut self, args: &[u8]) -> GdbResult {
        if args.starts_with(b"Supported") {
            self.send_string(b"PacketSize=1000;swbreak+;hwbreak+")
        } else if args.starts_with(b"Attached") {
            self.send_string(b"1")
        } else {
            self.send_empty_reply()
        }
    }
}

enum PacketResult {
    Ok(Vec<u8>),
    BadChecksum(Vec<u8>),
    EndOfStream,
}

/// Value of one hexadecimal ASCII digit
fn ascii_hex(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(10 + b - b'a'),
        b'A'..=b'F' => Some(10 + b - b'A'),
        _ => None,
    }
}

fn parse_hex(hex: &[u8]) -> Result<u32, ()> {
    if hex.is_empty() || hex.len() > 8 {
        return Err(());
    }
    hex.iter().try_fold(0u32, |v, &b| {
        ascii_hex(b).map(|h| (v << 4) | u32::from(h)).ok_or(())
    })
}

/// `addr,len`, both hexadecimal
fn parse_addr_len(args: &[u8]) -> Result<(u32, u32), ()> {
    let args: Vec<_> = args.split(|&b| b == b',').collect();
    match args.as_slice() {
        [addr, len] => Ok((parse_hex(addr)?, parse_hex(len)?)),
        _ => Err(()),
    }
}

/// `type,addr,kind` with single character type and kind
fn parse_breakpoint(args: &[u8]) -> Result<(u8, u32, u8), ()> {
    let args: Vec<_> = args.split(|&b| b == b',').collect();
    match args.as_slice() {
        [&[btype], addr, &[kind]] => Ok((btype, parse_hex(addr)?, kind)),
        _ => Err(()),
    }
}
