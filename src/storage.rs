//! Flash persistence for the energy totals
//!
//! The region is an append-only log of fixed-size records spread over every
//! sector of the partition:
//!
//! ```text
//! record + 0   accumulated energy (kWh, f64 LE)
//! record + 8   accumulated cost (f64 LE)
//! record + 16  sequence number (u32 LE)
//! record + 20  CRC16 over bytes 0..20 (u16 LE)
//! record + 22  unused, left erased
//! ```
//!
//! A save programs the next erased slot. A sector is erased only when the
//! log enters it, so each sector sees one erase per lap of the region. Load
//! picks the valid record with the highest sequence number; an erased or
//! torn region loads as zero.

use crate::MeterError;
use crate::energy::EnergyState;
use embedded_storage::nor_flash::NorFlash;
use log::{debug, info, warn};

/// Size of one log slot
pub const RECORD_SIZE: usize = 32;

const ENERGY_OFFSET: usize = 0;
const COST_OFFSET: usize = 8;
const SEQUENCE_OFFSET: usize = 16;
const CRC_OFFSET: usize = 20;

/// Relative difference above which a stored cost is reported as stale
const COST_DRIFT_TOLERANCE: f64 = 1e-9;

/// One decoded log entry
#[derive(Debug, Clone, Copy, PartialEq)]
struct Record {
    energy_kwh: f64,
    cost: f64,
    sequence: u32,
}

impl Record {
    fn encode(&self) -> [u8; RECORD_SIZE] {
        let mut raw = [0xFF; RECORD_SIZE];
        raw[ENERGY_OFFSET..ENERGY_OFFSET + 8].copy_from_slice(&self.energy_kwh.to_le_bytes());
        raw[COST_OFFSET..COST_OFFSET + 8].copy_from_slice(&self.cost.to_le_bytes());
        raw[SEQUENCE_OFFSET..SEQUENCE_OFFSET + 4].copy_from_slice(&self.sequence.to_le_bytes());
        let crc = crc16(&raw[..CRC_OFFSET]);
        raw[CRC_OFFSET..CRC_OFFSET + 2].copy_from_slice(&crc.to_le_bytes());
        raw
    }

    /// `None` for erased slots and for slots failing the CRC
    fn decode(raw: &[u8; RECORD_SIZE]) -> Option<Self> {
        if is_erased(raw) {
            return None;
        }

        let stored_crc = u16::from_le_bytes([raw[CRC_OFFSET], raw[CRC_OFFSET + 1]]);
        if stored_crc != crc16(&raw[..CRC_OFFSET]) {
            return None;
        }

        let mut energy = [0u8; 8];
        energy.copy_from_slice(&raw[ENERGY_OFFSET..ENERGY_OFFSET + 8]);
        let mut cost = [0u8; 8];
        cost.copy_from_slice(&raw[COST_OFFSET..COST_OFFSET + 8]);
        let mut sequence = [0u8; 4];
        sequence.copy_from_slice(&raw[SEQUENCE_OFFSET..SEQUENCE_OFFSET + 4]);

        Some(Self {
            energy_kwh: f64::from_le_bytes(energy),
            cost: f64::from_le_bytes(cost),
            sequence: u32::from_le_bytes(sequence),
        })
    }
}

/// Energy totals logged to a NOR flash region
pub struct EnergyStore<F> {
    flash: F,
    base: u32,
    slot_count: u32,
    next_slot: u32,
    sequence: u32,
    rate_per_kwh: f64,
}

impl<F: NorFlash> EnergyStore<F> {
    /// Log over `region_size` bytes starting at `base`.
    ///
    /// The region must be sector aligned and span at least two sectors;
    /// otherwise every save fails and load returns zero.
    pub fn new(flash: F, base: u32, region_size: u32, rate_per_kwh: f64) -> Self {
        let sector = F::ERASE_SIZE as u32;
        let usable = F::ERASE_SIZE % RECORD_SIZE == 0
            && RECORD_SIZE % F::WRITE_SIZE == 0
            && base % sector == 0
            && region_size % sector == 0
            && region_size >= 2 * sector;

        if !usable {
            warn!(
                "[STORE] Region {:#x}+{:#x} does not fit {} byte sectors",
                base, region_size, sector
            );
        }

        Self {
            flash,
            base,
            slot_count: if usable {
                region_size / RECORD_SIZE as u32
            } else {
                0
            },
            next_slot: 0,
            sequence: 0,
            rate_per_kwh,
        }
    }

    /// Read the newest valid record, falling back to zero.
    ///
    /// Cost is derived from energy and the current rate; a stored cost that
    /// disagrees is logged and replaced.
    pub fn load(&mut self, now_ms: u64) -> EnergyState {
        let mut newest: Option<(u32, Record)> = None;

        for slot in 0..self.slot_count {
            let mut raw = [0u8; RECORD_SIZE];
            if self.flash.read(self.slot_offset(slot), &mut raw).is_err() {
                warn!("[STORE] Failed to read energy log, starting from zero");
                return EnergyState::zero(now_ms);
            }

            if let Some(record) = Record::decode(&raw) {
                if newest.is_none_or(|(_, best)| record.sequence > best.sequence) {
                    newest = Some((slot, record));
                }
            }
        }

        let Some((slot, record)) = newest else {
            info!("[STORE] No stored energy, starting from zero");
            return EnergyState::zero(now_ms);
        };

        self.sequence = record.sequence;
        self.next_slot = (slot + 1) % self.slot_count;
        debug!("[STORE] Newest record #{} in slot {}", record.sequence, slot);

        if !record.energy_kwh.is_finite() {
            info!("[STORE] Stored energy is not a number, starting from zero");
        } else if record.energy_kwh < 0.0 {
            warn!(
                "[STORE] Stored energy {} is negative, starting from zero",
                record.energy_kwh
            );
        }

        let state = EnergyState::restored(record.energy_kwh, self.rate_per_kwh, now_ms);

        if record.cost.is_finite() && cost_drifted(record.cost, state.cost) {
            warn!(
                "[STORE] Stored cost {} does not match {} kWh at rate {}, using {}",
                record.cost, state.energy_kwh, self.rate_per_kwh, state.cost
            );
        }

        info!(
            "[STORE] Loaded totals: {} kWh, cost {}",
            state.energy_kwh, state.cost
        );
        state
    }

    /// Append energy and cost as one record
    pub fn save(&mut self, state: &EnergyState) -> Result<(), MeterError> {
        let sector = F::ERASE_SIZE as u32;

        for _ in 0..self.slot_count {
            let offset = self.slot_offset(self.next_slot);
            self.next_slot = (self.next_slot + 1) % self.slot_count;

            if (offset - self.base) % sector == 0 {
                self.flash
                    .erase(offset, offset + sector)
                    .map_err(|_| MeterError::StorageError)?;
                debug!("[STORE] Erased sector at {:#x}", offset);
            } else if !self.slot_is_erased(offset)? {
                // Torn or foreign data, leave it alone
                continue;
            }

            let record = Record {
                energy_kwh: state.energy_kwh,
                cost: state.cost,
                sequence: self.sequence.wrapping_add(1),
            };
            self.flash
                .write(offset, &record.encode())
                .map_err(|_| MeterError::StorageError)?;
            self.sequence = record.sequence;
            return Ok(());
        }

        Err(MeterError::StorageError)
    }

    /// Release the underlying device
    pub fn into_inner(self) -> F {
        self.flash
    }

    fn slot_offset(&self, slot: u32) -> u32 {
        self.base + slot * RECORD_SIZE as u32
    }

    fn slot_is_erased(&mut self, offset: u32) -> Result<bool, MeterError> {
        let mut raw = [0u8; RECORD_SIZE];
        self.flash
            .read(offset, &mut raw)
            .map_err(|_| MeterError::StorageError)?;
        Ok(is_erased(&raw))
    }
}

fn is_erased(raw: &[u8]) -> bool {
    raw.iter().all(|&b| b == 0xFF)
}

/// CRC-16/MODBUS
fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &byte in data {
        crc ^= byte as u16;
        for _ in 0..8 {
            crc = if crc & 1 != 0 {
                (crc >> 1) ^ 0xA001
            } else {
                crc >> 1
            };
        }
    }
    crc
}

fn cost_drifted(stored: f64, expected: f64) -> bool {
    let scale = libm::fabs(expected).max(1.0);
    libm::fabs(stored - expected) > COST_DRIFT_TOLERANCE * scale
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use embedded_storage::nor_flash::{ErrorType, NorFlashError, NorFlashErrorKind, ReadNorFlash};

    pub(crate) const SECTOR_SIZE: usize = 256;
    pub(crate) const SECTOR_COUNT: usize = 4;
    pub(crate) const REGION_SIZE: u32 = (SECTOR_SIZE * SECTOR_COUNT) as u32;
    const SLOTS_PER_SECTOR: usize = SECTOR_SIZE / RECORD_SIZE;

    /// RAM-backed NOR flash that starts erased. Writes can only clear bits.
    pub(crate) struct MemoryFlash {
        pub bytes: [u8; SECTOR_SIZE * SECTOR_COUNT],
        pub fail_reads: bool,
        pub fail_writes: bool,
        pub writes: usize,
        pub erases: [usize; SECTOR_COUNT],
    }

    impl MemoryFlash {
        pub(crate) fn erased() -> Self {
            Self {
                bytes: [0xFF; SECTOR_SIZE * SECTOR_COUNT],
                fail_reads: false,
                fail_writes: false,
                writes: 0,
                erases: [0; SECTOR_COUNT],
            }
        }
    }

    #[derive(Debug)]
    pub(crate) struct FlashFault;

    impl NorFlashError for FlashFault {
        fn kind(&self) -> NorFlashErrorKind {
            NorFlashErrorKind::Other
        }
    }

    impl ErrorType for MemoryFlash {
        type Error = FlashFault;
    }

    impl ReadNorFlash for MemoryFlash {
        const READ_SIZE: usize = 1;

        fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
            if self.fail_reads {
                return Err(FlashFault);
            }
            let start = offset as usize;
            bytes.copy_from_slice(&self.bytes[start..start + bytes.len()]);
            Ok(())
        }

        fn capacity(&self) -> usize {
            self.bytes.len()
        }
    }

    impl NorFlash for MemoryFlash {
        const WRITE_SIZE: usize = 4;
        const ERASE_SIZE: usize = SECTOR_SIZE;

        fn erase(&mut self, from: u32, to: u32) -> Result<(), Self::Error> {
            assert_eq!(from as usize % SECTOR_SIZE, 0);
            assert_eq!(to as usize % SECTOR_SIZE, 0);
            if self.fail_writes {
                return Err(FlashFault);
            }
            self.bytes[from as usize..to as usize].fill(0xFF);
            for sector in from as usize / SECTOR_SIZE..to as usize / SECTOR_SIZE {
                self.erases[sector] += 1;
            }
            Ok(())
        }

        fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
            assert_eq!(offset as usize % Self::WRITE_SIZE, 0);
            if self.fail_writes {
                return Err(FlashFault);
            }
            let start = offset as usize;
            for (cell, byte) in self.bytes[start..start + bytes.len()].iter_mut().zip(bytes) {
                *cell &= *byte;
            }
            self.writes += 1;
            Ok(())
        }
    }

    /// Flash holding one valid record in slot 0
    pub(crate) fn with_record(energy_kwh: f64, cost: f64) -> MemoryFlash {
        let mut flash = MemoryFlash::erased();
        let record = Record {
            energy_kwh,
            cost,
            sequence: 1,
        };
        flash.bytes[..RECORD_SIZE].copy_from_slice(&record.encode());
        flash
    }

    pub(crate) fn flash_mut(store: &mut EnergyStore<MemoryFlash>) -> &mut MemoryFlash {
        &mut store.flash
    }

    /// Energy as a freshly booted store would see it
    pub(crate) fn reload_energy(flash: MemoryFlash) -> f64 {
        EnergyStore::new(flash, 0, REGION_SIZE, 6.5)
            .load(0)
            .energy_kwh
    }

    fn log_store(flash: MemoryFlash) -> EnergyStore<MemoryFlash> {
        EnergyStore::new(flash, 0, REGION_SIZE, 6.5)
    }

    fn totals(energy_kwh: f64) -> EnergyState {
        EnergyState::restored(energy_kwh, 6.5, 0)
    }

    #[test]
    fn erased_flash_loads_as_zero() {
        let mut store = log_store(MemoryFlash::erased());
        let state = store.load(100);
        assert_eq!(state.energy_kwh, 0.0);
        assert_eq!(state.cost, 0.0);
        assert_eq!(state.last_update_ms, 100);
    }

    #[test]
    fn nan_fields_default_to_zero() {
        let mut store = log_store(with_record(f64::NAN, f64::NAN));
        assert_eq!(store.load(0).energy_kwh, 0.0);

        let mut store = log_store(with_record(2.0, f64::NAN));
        let state = store.load(0);
        assert_eq!(state.energy_kwh, 2.0);
        assert_eq!(state.cost, 13.0);
    }

    #[test]
    fn read_failure_loads_as_zero() {
        let mut flash = with_record(5.0, 32.5);
        flash.fail_reads = true;
        let mut store = log_store(flash);
        assert_eq!(store.load(0), EnergyState::zero(0));
    }

    #[test]
    fn save_then_load_keeps_totals() {
        let mut store = log_store(MemoryFlash::erased());
        store.load(0);
        store.save(&totals(12.25)).unwrap();

        let flash = store.into_inner();
        assert_eq!(flash.writes, 1);
        assert_eq!(&flash.bytes[..8], &12.25f64.to_le_bytes());
        assert_eq!(&flash.bytes[8..16], &(12.25f64 * 6.5).to_le_bytes());

        let loaded = EnergyStore::new(flash, 0, REGION_SIZE, 6.5).load(0);
        assert_eq!(loaded.energy_kwh, 12.25);
        assert_eq!(loaded.cost, 12.25 * 6.5);
    }

    #[test]
    fn newest_record_wins() {
        let mut store = log_store(MemoryFlash::erased());
        store.load(0);
        for energy in [1.0, 2.0, 3.0] {
            store.save(&totals(energy)).unwrap();
        }
        assert_eq!(reload_energy(store.into_inner()), 3.0);
    }

    #[test]
    fn corrupt_newest_record_falls_back_to_previous() {
        let mut store = log_store(MemoryFlash::erased());
        store.load(0);
        store.save(&totals(1.0)).unwrap();
        store.save(&totals(2.0)).unwrap();

        let mut flash = store.into_inner();
        flash.bytes[RECORD_SIZE + 3] ^= 0x10;
        assert_eq!(reload_energy(flash), 1.0);
    }

    #[test]
    fn append_continues_after_reboot() {
        let mut store = log_store(MemoryFlash::erased());
        store.load(0);
        store.save(&totals(1.0)).unwrap();
        store.save(&totals(2.0)).unwrap();

        let mut store = EnergyStore::new(store.into_inner(), 0, REGION_SIZE, 6.5);
        assert_eq!(store.load(0).energy_kwh, 2.0);
        store.save(&totals(3.0)).unwrap();

        let flash = store.into_inner();
        assert_eq!(flash.erases, [1, 0, 0, 0]);
        assert!(!is_erased(&flash.bytes[2 * RECORD_SIZE..3 * RECORD_SIZE]));
        assert_eq!(reload_energy(flash), 3.0);
    }

    #[test]
    fn torn_slot_is_skipped() {
        let mut store = log_store(MemoryFlash::erased());
        store.load(0);
        store.save(&totals(1.0)).unwrap();

        let mut flash = store.into_inner();
        flash.bytes[RECORD_SIZE] = 0x00;

        let mut store = EnergyStore::new(flash, 0, REGION_SIZE, 6.5);
        store.load(0);
        store.save(&totals(2.0)).unwrap();

        let flash = store.into_inner();
        assert_eq!(flash.bytes[RECORD_SIZE], 0x00);
        assert_eq!(reload_energy(flash), 2.0);
    }

    #[test]
    fn erases_stay_bounded_across_laps() {
        let mut store = log_store(MemoryFlash::erased());
        store.load(0);

        let slots = SLOTS_PER_SECTOR * SECTOR_COUNT;
        let saves = slots * 3 + 5;
        for n in 0..saves {
            store.save(&totals(n as f64)).unwrap();
        }

        let flash = store.into_inner();
        assert_eq!(flash.writes, saves);
        // One erase per sector per lap, spread evenly
        let total: usize = flash.erases.iter().sum();
        assert_eq!(total, saves.div_ceil(SLOTS_PER_SECTOR));
        let max = *flash.erases.iter().max().unwrap();
        let min = *flash.erases.iter().min().unwrap();
        assert!(max - min <= 1, "erases = {:?}", flash.erases);
        assert_eq!(reload_energy(flash), (saves - 1) as f64);
    }

    #[test]
    fn stale_cost_is_recomputed_from_rate() {
        // written by firmware with a different tariff
        let mut store = log_store(with_record(10.0, 50.0));
        let state = store.load(0);
        assert_eq!(state.cost, 65.0);
    }

    #[test]
    fn write_failure_is_reported() {
        let mut flash = MemoryFlash::erased();
        flash.fail_writes = true;
        let mut store = log_store(flash);
        assert_eq!(
            store.save(&EnergyState::zero(0)),
            Err(MeterError::StorageError)
        );
    }

    #[test]
    fn misaligned_region_is_unusable() {
        let mut store = EnergyStore::new(MemoryFlash::erased(), 16, REGION_SIZE - 16, 6.5);
        assert_eq!(store.load(0), EnergyState::zero(0));
        assert_eq!(store.save(&totals(1.0)), Err(MeterError::StorageError));
    }

    #[test]
    fn crc_matches_modbus_check_value() {
        assert_eq!(crc16(b"123456789"), 0x4B37);
    }
}
