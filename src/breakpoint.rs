//! # Breakpoints
//!
//! The breakpoint table owns every breakpoint in the target. Hardware
//! breakpoints are preferred: the four x86 debug register slots are
//! allocated lowest-first, and when all four are taken (or the backend
//! has no debug registers) the table falls back to patching the trap
//! instruction over the original bytes, which are kept for restore on
//! clear.
//!
//! A *temp* breakpoint is an ordinary breakpoint marked for automatic
//! removal at the next stop that observes any breakpoint; the stepping
//! primitives of the process controller are built from them.

use std::collections::{BTreeMap, HashMap};
use std::fmt::Display;

use serde::Serialize;
use tracing::{debug, trace};

use crate::addr::Addr;
use crate::arch::Arch;
use crate::driver::{Driver, Tid};
use crate::errors::{DebuggerError, Result};
use crate::sym::{Location, SymbolOracle};

/// How many hardware breakpoint slots the architecture offers (DR0..DR3).
pub const HW_SLOTS: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum BreakpointKind {
    /// A patched trap instruction; `original` holds the overwritten bytes.
    Software { original: Vec<u8> },
    /// A debug register slot in 0..4.
    Hardware { slot: usize },
}

#[derive(Debug, Clone, Serialize)]
pub struct Breakpoint {
    /// Unique positive id, assigned in creation order starting at 1.
    pub id: u32,
    pub addr: Addr,
    pub kind: BreakpointKind,
    /// Cleared automatically at the next stop that observes a breakpoint.
    pub temp: bool,
    /// Opaque condition expression, evaluated by higher layers.
    pub cond: Option<String>,
    /// Source location resolved when the breakpoint was created.
    pub location: Location,
    pub total_hit_count: u64,
    /// Hits per goroutine id, for goroutines known to the symbol layer.
    pub hit_count: HashMap<i64, u64>,
}

impl Breakpoint {
    pub fn is_hardware(&self) -> bool {
        matches!(self.kind, BreakpointKind::Hardware { .. })
    }

    pub(crate) fn hit(&mut self, goroutine: Option<i64>) {
        self.total_hit_count += 1;
        if let Some(gid) = goroutine {
            *self.hit_count.entry(gid).or_insert(0) += 1;
        }
    }
}

impl Display for Breakpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Breakpoint {} at {} {}:{}",
            self.id, self.addr, self.location.file, self.location.line
        )
    }
}

/// The process-wide breakpoint table.
pub struct BreakpointTable {
    by_addr: BTreeMap<Addr, Breakpoint>,
    /// Which address occupies each debug register slot.
    hw_slots: [Option<Addr>; HW_SLOTS],
    next_id: u32,
    arch: Arch,
}

impl BreakpointTable {
    pub fn new(arch: Arch) -> Self {
        Self {
            by_addr: BTreeMap::new(),
            hw_slots: [None; HW_SLOTS],
            next_id: 1,
            arch,
        }
    }

    /// Install a breakpoint at `addr`.
    ///
    /// `tid` is the thread the installation is performed through; ptrace
    /// requires the target to be in a signal-delivery stop for it.
    pub fn set(
        &mut self,
        driver: &mut dyn Driver,
        oracle: &dyn SymbolOracle,
        tid: Tid,
        addr: Addr,
        temp: bool,
        cond: Option<String>,
    ) -> Result<&Breakpoint> {
        if self.by_addr.contains_key(&addr) {
            return Err(DebuggerError::BreakpointExists(addr));
        }
        let location = oracle
            .pc_to_line(addr)
            .ok_or(DebuggerError::InvalidAddress(addr))?;

        let kind = match self.install_hardware(driver, tid, addr) {
            Ok(slot) => BreakpointKind::Hardware { slot },
            Err(e) => {
                trace!("falling back to a software breakpoint at {addr}: {e}");
                let trap = self.arch.breakpoint_instruction();
                let original = driver.read_memory(tid, addr, trap.len())?;
                driver.write_memory(tid, addr, trap)?;
                BreakpointKind::Software { original }
            }
        };

        let id = self.next_id;
        self.next_id += 1;
        let bp = Breakpoint {
            id,
            addr,
            kind,
            temp,
            cond,
            location,
            total_hit_count: 0,
            hit_count: HashMap::new(),
        };
        debug!("set {bp}");
        Ok(self.by_addr.entry(addr).or_insert(bp))
    }

    fn install_hardware(
        &mut self,
        driver: &mut dyn Driver,
        tid: Tid,
        addr: Addr,
    ) -> Result<usize> {
        if !driver.supports_hardware_breakpoints() {
            return Err(DebuggerError::OutOfSlots);
        }
        let slot = self
            .hw_slots
            .iter()
            .position(|s| s.is_none())
            .ok_or(DebuggerError::OutOfSlots)?;
        driver.set_hw_breakpoint(tid, slot, addr)?;
        self.hw_slots[slot] = Some(addr);
        Ok(slot)
    }

    /// Remove the breakpoint at `addr`, restoring the original bytes or
    /// freeing the debug register slot, and return it.
    pub fn clear(
        &mut self,
        driver: &mut dyn Driver,
        tid: Tid,
        addr: Addr,
    ) -> Result<Breakpoint> {
        let bp = self
            .by_addr
            .remove(&addr)
            .ok_or(DebuggerError::NoBreakpoint(addr))?;
        match &bp.kind {
            BreakpointKind::Hardware { slot } => {
                driver.clear_hw_breakpoint(tid, *slot)?;
                self.hw_slots[*slot] = None;
            }
            BreakpointKind::Software { original } => {
                driver.write_memory(tid, addr, original)?;
            }
        }
        debug!("cleared {bp}");
        Ok(bp)
    }

    /// Remove every breakpoint. Used before detaching without killing.
    pub fn clear_all(&mut self, driver: &mut dyn Driver, tid: Tid) -> Result<()> {
        for addr in self.addresses() {
            self.clear(driver, tid, addr)?;
        }
        Ok(())
    }

    /// Forget every temp breakpoint without touching the target. For
    /// targets that are already gone.
    pub(crate) fn drop_temps(&mut self) {
        let temps: Vec<Addr> = self
            .by_addr
            .values()
            .filter(|bp| bp.temp)
            .map(|bp| bp.addr)
            .collect();
        for addr in temps {
            if let Some(bp) = self.by_addr.remove(&addr) {
                if let BreakpointKind::Hardware { slot } = bp.kind {
                    self.hw_slots[slot] = None;
                }
            }
        }
    }

    /// Remove every temp breakpoint.
    pub fn clear_temps(&mut self, driver: &mut dyn Driver, tid: Tid) -> Result<()> {
        let temps: Vec<Addr> = self
            .by_addr
            .values()
            .filter(|bp| bp.temp)
            .map(|bp| bp.addr)
            .collect();
        for addr in temps {
            self.clear(driver, tid, addr)?;
        }
        Ok(())
    }

    pub fn get(&self, addr: Addr) -> Option<&Breakpoint> {
        self.by_addr.get(&addr)
    }

    pub(crate) fn get_mut(&mut self, addr: Addr) -> Option<&mut Breakpoint> {
        self.by_addr.get_mut(&addr)
    }

    pub fn find_by_id(&self, id: u32) -> Option<&Breakpoint> {
        self.by_addr.values().find(|bp| bp.id == id)
    }

    /// All breakpoints, in address order.
    pub fn list(&self) -> impl Iterator<Item = &Breakpoint> {
        self.by_addr.values()
    }

    pub fn addresses(&self) -> Vec<Addr> {
        self.by_addr.keys().copied().collect()
    }

    pub fn has_temps(&self) -> bool {
        self.by_addr.values().any(|bp| bp.temp)
    }

    pub fn is_empty(&self) -> bool {
        self.by_addr.is_empty()
    }

    pub fn arch(&self) -> Arch {
        self.arch
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::driver::mock::MockDriver;
    use crate::sym::TableOracle;

    fn oracle() -> TableOracle {
        let mut o = TableOracle::new();
        o.add_function(
            "main.main",
            Addr::from(0x1000usize),
            Addr::from(0x1100usize),
            "main.go",
            5,
        );
        o
    }

    fn driver() -> MockDriver {
        MockDriver::new(100, 0x1000, 0x100)
    }

    #[test]
    fn test_prefers_hardware_in_slot_order_then_software() {
        let mut table = BreakpointTable::new(Arch::X86_64);
        let mut drv = driver();
        let o = oracle();
        for i in 0..5 {
            let addr = Addr::from(0x1000usize + i * 8);
            table.set(&mut drv, &o, 100, addr, false, None).unwrap();
        }
        let kinds: Vec<_> = table.list().map(|bp| bp.kind.clone()).collect();
        assert_eq!(kinds[0], BreakpointKind::Hardware { slot: 0 });
        assert_eq!(kinds[1], BreakpointKind::Hardware { slot: 1 });
        assert_eq!(kinds[2], BreakpointKind::Hardware { slot: 2 });
        assert_eq!(kinds[3], BreakpointKind::Hardware { slot: 3 });
        match &kinds[4] {
            BreakpointKind::Software { original } => assert_eq!(original.len(), 1),
            other => panic!("expected a software breakpoint, got {other:?}"),
        }
        // the fifth breakpoint patched the trap byte
        assert_eq!(drv.mem[4 * 8], 0xcc);
    }

    #[test]
    fn test_duplicate_address_rejected() {
        let mut table = BreakpointTable::new(Arch::X86_64);
        let mut drv = driver();
        let o = oracle();
        let addr = Addr::from(0x1010usize);
        table.set(&mut drv, &o, 100, addr, false, None).unwrap();
        assert!(matches!(
            table.set(&mut drv, &o, 100, addr, false, None),
            Err(DebuggerError::BreakpointExists(_))
        ));
    }

    #[test]
    fn test_unresolvable_address_rejected() {
        let mut table = BreakpointTable::new(Arch::X86_64);
        let mut drv = driver();
        let o = oracle();
        assert!(matches!(
            table.set(&mut drv, &o, 100, Addr::from(0x9000usize), false, None),
            Err(DebuggerError::InvalidAddress(_))
        ));
    }

    #[test]
    fn test_freed_slot_is_reused() {
        let mut table = BreakpointTable::new(Arch::X86_64);
        let mut drv = driver();
        let o = oracle();
        for i in 0..4 {
            let addr = Addr::from(0x1000usize + i * 8);
            table.set(&mut drv, &o, 100, addr, false, None).unwrap();
        }
        table.clear(&mut drv, 100, Addr::from(0x1008usize)).unwrap();
        let bp = table
            .set(&mut drv, &o, 100, Addr::from(0x1080usize), false, None)
            .unwrap();
        assert_eq!(bp.kind, BreakpointKind::Hardware { slot: 1 });
    }

    #[test]
    fn test_ids_are_monotonic_from_one() {
        let mut table = BreakpointTable::new(Arch::X86_64);
        let mut drv = driver();
        let o = oracle();
        let a = Addr::from(0x1000usize);
        let b = Addr::from(0x1008usize);
        assert_eq!(table.set(&mut drv, &o, 100, a, false, None).unwrap().id, 1);
        assert_eq!(table.set(&mut drv, &o, 100, b, false, None).unwrap().id, 2);
        // cleared ids are not reused
        table.clear(&mut drv, 100, a).unwrap();
        let c = Addr::from(0x1010usize);
        assert_eq!(table.set(&mut drv, &o, 100, c, false, None).unwrap().id, 3);
    }

    #[test]
    fn test_clear_unknown_address() {
        let mut table = BreakpointTable::new(Arch::X86_64);
        let mut drv = driver();
        assert!(matches!(
            table.clear(&mut drv, 100, Addr::from(0x1000usize)),
            Err(DebuggerError::NoBreakpoint(_))
        ));
    }

    #[test]
    fn test_software_breakpoint_memory_contract() {
        let mut table = BreakpointTable::new(Arch::X86_64);
        let mut drv = driver();
        drv.hw_supported = false;
        let o = oracle();
        let addr = Addr::from(0x1020usize);
        drv.mem[0x20] = 0x55; // push rbp
        let before = drv.mem.clone();

        table.set(&mut drv, &o, 100, addr, false, None).unwrap();
        // installed: memory shows the trap, the table holds the original
        assert_eq!(drv.mem[0x20], 0xcc);
        match &table.get(addr).unwrap().kind {
            BreakpointKind::Software { original } => assert_eq!(original, &[0x55]),
            other => panic!("expected software breakpoint, got {other:?}"),
        }

        let bp = table.clear(&mut drv, 100, addr).unwrap();
        assert_eq!(bp.addr, addr);
        assert_eq!(drv.mem, before);
        assert!(table.is_empty());
    }
}
