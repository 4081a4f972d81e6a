// Save states for the CPU core
//
// Layout: 8 byte magic, little endian version and CRC32 of the payload,
// then the gzip compressed bincode payload. The header is read before
// anything is decompressed so foreign files are rejected early.
use std::fs;
use std::io::{Read, Write};
use std::path::Path;

use byteorder::{ByteOrder, LittleEndian};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};

use crate::error::{PsxError, Result};
use crate::psx::bus::Bus;
use crate::psx::cache::{CacheControl, ICache};
use crate::psx::cpu::cop0::Cop0;
use crate::psx::cpu::cop2::Cop2Registers;
use crate::psx::cpu::exception::PendingException;
use crate::psx::cpu::registers::Registers;
use crate::psx::cpu::Cpu;
use crate::psx::memory_control::MemoryControl;
use crate::psx::memory_map::{RAM_SIZE, SCRATCHPAD_SIZE};

pub const SAVE_STATE_MAGIC: &[u8; 8] = b"R3KSTATE";
/// Version written by this build
pub const SAVE_STATE_VERSION: u32 = 2;
/// Oldest version this build still loads
pub const SAVE_STATE_MIN_VERSION: u32 = 2;

const HEADER_SIZE: usize = 16;

/// Parsed fixed size header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SaveStateHeader {
    pub version: u32,
    pub checksum: u32,
}

impl SaveStateHeader {
    fn write(&self, out: &mut Vec<u8>) {
        let mut raw = [0u8; HEADER_SIZE];
        raw[..8].copy_from_slice(SAVE_STATE_MAGIC);
        LittleEndian::write_u32(&mut raw[8..12], self.version);
        LittleEndian::write_u32(&mut raw[12..16], self.checksum);
        out.extend_from_slice(&raw);
    }

    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_SIZE {
            return Err(PsxError::save_state("read header", "file too short"));
        }
        if &data[..8] != SAVE_STATE_MAGIC {
            return Err(PsxError::BadSaveStateMagic);
        }
        Ok(SaveStateHeader {
            version: LittleEndian::read_u32(&data[8..12]),
            checksum: LittleEndian::read_u32(&data[12..16]),
        })
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct MemoryState {
    pub main_ram: Vec<u8>,
    pub scratchpad: Vec<u8>,
}

/// Everything the CPU core needs to resume at a block boundary. Blocks and
/// compiled code are never saved, `needs_block_invalidation` tells the
/// loader to drop whatever it has cached.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SaveState {
    pub emulator_version: String,
    pub timestamp: u64,
    pub regs: Registers,
    pub cop0: Cop0,
    pub icache: ICache,
    pub cop2: Cop2Registers,
    pub cycles: u64,
    pub pending_exception: Option<PendingException>,
    pub icache_emulation: bool,
    pub memory: MemoryState,
    pub memory_control: MemoryControl,
    pub cache_control: u32,
    pub needs_block_invalidation: bool,
}

impl SaveState {
    /// Snapshot the CPU and the memory it owns
    pub fn capture(cpu: &mut Cpu, bus: &Bus) -> Self {
        let timestamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();

        SaveState {
            emulator_version: crate::VERSION.to_string(),
            timestamp,
            regs: cpu.regs.clone(),
            cop0: cpu.cop0.clone(),
            icache: cpu.icache.clone(),
            cop2: cpu.cop2.snapshot(),
            cycles: cpu.cycles,
            pending_exception: cpu.pending_exception().copied(),
            icache_emulation: cpu.icache_emulation(),
            memory: MemoryState {
                main_ram: bus.ram().to_vec(),
                scratchpad: bus.scratchpad().to_vec(),
            },
            memory_control: bus.memory_control().clone(),
            cache_control: bus.cache_control().bits(),
            needs_block_invalidation: true,
        }
    }

    /// Install this state. The caller flushes its block caches when
    /// `needs_block_invalidation` is set.
    pub fn apply(&self, cpu: &mut Cpu, bus: &mut Bus) -> Result<()> {
        self.validate()?;
        cpu.regs = self.regs.clone();
        cpu.cop0 = self.cop0.clone();
        cpu.set_icache_emulation(self.icache_emulation);
        cpu.icache = self.icache.clone();
        cpu.cop2.restore(&self.cop2);
        cpu.cycles = self.cycles;
        cpu.set_pending_exception(self.pending_exception);

        bus.restore_memory(&self.memory.main_ram, &self.memory.scratchpad);
        bus.set_memory_control(self.memory_control.clone());
        bus.set_cache_control(CacheControl::from_bits_truncate(self.cache_control));
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.memory.main_ram.len() != RAM_SIZE as usize {
            return Err(PsxError::save_state("validate", "Invalid RAM size"));
        }
        if self.memory.scratchpad.len() != SCRATCHPAD_SIZE as usize {
            return Err(PsxError::save_state("validate", "Invalid scratchpad size"));
        }
        Ok(())
    }

    /// Serialize save state to compressed bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let payload =
            bincode::serialize(self).map_err(|e| PsxError::save_state("serialize", e))?;

        let mut out = Vec::with_capacity(HEADER_SIZE + payload.len() / 4);
        SaveStateHeader {
            version: SAVE_STATE_VERSION,
            checksum: crc32fast::hash(&payload),
        }
        .write(&mut out);

        let mut encoder = GzEncoder::new(out, Compression::default());
        encoder
            .write_all(&payload)
            .map_err(|e| PsxError::save_state("compress", e))?;
        encoder.finish().map_err(|e| PsxError::save_state("finalize", e))
    }

    /// Deserialize save state from compressed bytes
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let header = SaveStateHeader::parse(data)?;
        if header.version < SAVE_STATE_MIN_VERSION || header.version > SAVE_STATE_VERSION {
            return Err(PsxError::UnsupportedSaveStateVersion {
                version: header.version,
                min: SAVE_STATE_MIN_VERSION,
                max: SAVE_STATE_VERSION,
            });
        }

        let mut payload = Vec::new();
        GzDecoder::new(&data[HEADER_SIZE..])
            .read_to_end(&mut payload)
            .map_err(|e| PsxError::save_state("decompress", e))?;

        let got = crc32fast::hash(&payload);
        if got != header.checksum {
            return Err(PsxError::SaveStateChecksum {
                expected: header.checksum,
                got,
            });
        }

        let state: SaveState = bincode::deserialize(&payload)
            .map_err(|e| PsxError::save_state("deserialize", e))?;
        state.validate()?;
        Ok(state)
    }

    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        let bytes = self.to_bytes()?;
        fs::write(path, bytes)?;
        info!("Saved state to {}", path.display());
        Ok(())
    }

    pub fn load_from_file(path: &Path) -> Result<Self> {
        let bytes = fs::read(path)?;
        let state = Self::from_bytes(&bytes)?;
        info!(
            "Loaded state from {} (written by {})",
            path.display(),
            state.emulator_version
        );
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::psx::bus::NullPeripherals;
    use crate::psx::cpu::cop2::RegisterFileCop2;

    fn sample() -> SaveState {
        let bus = Bus::new(Box::new(NullPeripherals));
        let mut cpu = Cpu::new(Box::new(RegisterFileCop2::new()));
        cpu.regs.gpr[4] = 0xdead_beef;
        SaveState::capture(&mut cpu, &bus)
    }

    #[test]
    fn test_header_is_checked_before_payload() {
        let mut bytes = sample().to_bytes().unwrap();
        assert_eq!(&bytes[..8], SAVE_STATE_MAGIC);

        LittleEndian::write_u32(&mut bytes[8..12], SAVE_STATE_VERSION + 1);
        match SaveState::from_bytes(&bytes) {
            Err(PsxError::UnsupportedSaveStateVersion { version, min, max }) => {
                assert_eq!(version, SAVE_STATE_VERSION + 1);
                assert_eq!((min, max), (SAVE_STATE_MIN_VERSION, SAVE_STATE_VERSION));
            }
            other => panic!("unexpected {:?}", other.map(|_| ())),
        }

        bytes[0] = b'X';
        assert!(matches!(
            SaveState::from_bytes(&bytes),
            Err(PsxError::BadSaveStateMagic)
        ));
    }

    #[test]
    fn test_checksum_mismatch_is_rejected() {
        let mut bytes = sample().to_bytes().unwrap();
        let stored = LittleEndian::read_u32(&bytes[12..16]);
        LittleEndian::write_u32(&mut bytes[12..16], stored ^ 1);
        assert!(matches!(
            SaveState::from_bytes(&bytes),
            Err(PsxError::SaveStateChecksum { .. })
        ));
    }

    #[test]
    fn test_bytes_round_trip_keeps_registers() {
        let state = SaveState::from_bytes(&sample().to_bytes().unwrap()).unwrap();
        assert_eq!(state.regs.gpr[4], 0xdead_beef);
        assert!(state.needs_block_invalidation);
    }
}
