//! Interrupt routing and delivery (§4.4).
//!
//! Each VCPU owns one [`InterruptState`]: a pending hardware-vector queue
//! (raised by `raise_irq`), a pending "virtual IRQ" slot used by device
//! models that want to assert a specific vector directly, and a software
//! interrupt (`INT n`) slot used by instruction emulation. The VM as a
//! whole owns an ordered list of [`InterruptRouter`]s (not a single fixed
//! controller — Palacios' `vmm_intr.c` chains a PIC-equivalent and an
//! IOAPIC-equivalent router and asks each in turn), plus an optional
//! passthrough hook for interrupts that should go straight to hardware
//! without VMM involvement.

use std::collections::BinaryHeap;

/// One pending hardware interrupt, ordered so the highest vector (by x86
/// convention, higher vectors preempt lower ones at the same priority
/// class) is delivered first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct PendingVector(u8);

/// What a VCPU currently has waiting for delivery.
#[derive(Debug, Default)]
pub struct InterruptState {
    irqs: BinaryHeap<PendingVector>,
    virq: Option<u8>,
    swintr: Option<u8>,
    /// NMI is delivered out of band from the vector queues (§4.4: "NMI
    /// bypasses normal priority").
    nmi_pending: bool,
}

impl InterruptState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a normal external interrupt vector.
    pub fn raise_irq(&mut self, vector: u8) {
        self.irqs.push(PendingVector(vector));
    }

    /// Assert a specific vector a device model wants delivered directly,
    /// bypassing the router chain (Palacios' `v3_raise_virq`).
    pub fn raise_virq(&mut self, vector: u8) {
        self.virq = Some(vector);
    }

    /// Queue a vector produced by emulating a software interrupt
    /// instruction (`INT n`) rather than external hardware.
    pub fn raise_swintr(&mut self, vector: u8) {
        self.swintr = Some(vector);
    }

    pub fn raise_nmi(&mut self) {
        self.nmi_pending = true;
    }

    /// True if anything is waiting to be injected.
    pub fn pending(&self) -> bool {
        self.nmi_pending || self.virq.is_some() || self.swintr.is_some() || !self.irqs.is_empty()
    }

    /// Pick the next vector to inject, in priority order: NMI, then
    /// directly-asserted virtual IRQ, then software interrupt, then the
    /// highest-priority queued hardware IRQ. Does not remove it — call
    /// `ack` once the dispatcher confirms hardware accepted the injection.
    pub fn peek(&self) -> Option<PendingDelivery> {
        if self.nmi_pending {
            return Some(PendingDelivery::Nmi);
        }
        if let Some(v) = self.virq {
            return Some(PendingDelivery::Vector(v));
        }
        if let Some(v) = self.swintr {
            return Some(PendingDelivery::Vector(v));
        }
        self.irqs.peek().map(|v| PendingDelivery::Vector(v.0))
    }

    /// Remove whatever `peek` most recently returned, once hardware has
    /// accepted it.
    pub fn ack(&mut self, delivered: PendingDelivery) {
        match delivered {
            PendingDelivery::Nmi => self.nmi_pending = false,
            PendingDelivery::Vector(v) => {
                if self.virq == Some(v) {
                    self.virq = None;
                } else if self.swintr == Some(v) {
                    self.swintr = None;
                } else {
                    self.irqs.pop();
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingDelivery {
    Nmi,
    Vector(u8),
}

/// A source of IRQ-to-vector routing decisions, e.g. a PIC-equivalent
/// (IRQ 0-15, fixed mapping) or an IOAPIC-equivalent (IRQ-to-vector table
/// configured by the guest). The VM tries each router in registration
/// order; the first one that claims the IRQ wins (§4.4: "a VM owns a list
/// of routers, tried in order, not a single fixed controller").
pub trait InterruptRouter: Send {
    /// Translate a host-side IRQ line number into a hardware vector, if
    /// this router owns that line.
    fn route(&self, irq_line: u32) -> Option<u8>;

    /// A human-readable name for diagnostics.
    fn name(&self) -> &str;
}

/// Tries each router in order and raises the first matching vector on the
/// given core's pending state.
pub fn route_and_raise(
    routers: &[Box<dyn InterruptRouter>],
    irq_line: u32,
    core: &mut InterruptState,
) -> bool {
    for router in routers {
        if let Some(vector) = router.route(irq_line) {
            core.raise_irq(vector);
            return true;
        }
    }
    false
}

/// A fixed, static IRQ-line-to-vector table, the common case for a simple
/// PIC-equivalent router (IRQ `n` always maps to vector `base + n`).
pub struct StaticIrqRouter {
    name: &'static str,
    base_vector: u8,
    line_count: u32,
}

impl StaticIrqRouter {
    pub fn new(name: &'static str, base_vector: u8, line_count: u32) -> Self {
        Self {
            name,
            base_vector,
            line_count,
        }
    }
}

impl InterruptRouter for StaticIrqRouter {
    fn route(&self, irq_line: u32) -> Option<u8> {
        if irq_line < self.line_count {
            Some(self.base_vector.wrapping_add(irq_line as u8))
        } else {
            None
        }
    }

    fn name(&self) -> &str {
        self.name
    }
}

/// An IRQ line explicitly configured to bypass VMM routing entirely and go
/// straight to the host's own interrupt controller (§4.4's passthrough
/// hook, used for host devices directly assigned to the guest).
pub struct PassthroughTable {
    lines: std::collections::BTreeSet<u32>,
}

impl Default for PassthroughTable {
    fn default() -> Self {
        Self::new()
    }
}

impl PassthroughTable {
    pub fn new() -> Self {
        Self {
            lines: std::collections::BTreeSet::new(),
        }
    }

    pub fn mark_passthrough(&mut self, irq_line: u32) {
        self.lines.insert(irq_line);
    }

    pub fn is_passthrough(&self, irq_line: u32) -> bool {
        self.lines.contains(&irq_line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nmi_preempts_everything_else() {
        let mut state = InterruptState::new();
        state.raise_irq(0x20);
        state.raise_virq(0x30);
        state.raise_nmi();
        assert_eq!(state.peek(), Some(PendingDelivery::Nmi));
    }

    #[test]
    fn virq_preempts_queued_hardware_irqs() {
        let mut state = InterruptState::new();
        state.raise_irq(0x20);
        state.raise_virq(0x41);
        assert_eq!(state.peek(), Some(PendingDelivery::Vector(0x41)));
    }

    #[test]
    fn higher_vector_hardware_irq_is_served_first() {
        let mut state = InterruptState::new();
        state.raise_irq(0x20);
        state.raise_irq(0x41);
        assert_eq!(state.peek(), Some(PendingDelivery::Vector(0x41)));
        state.ack(PendingDelivery::Vector(0x41));
        assert_eq!(state.peek(), Some(PendingDelivery::Vector(0x20)));
    }

    #[test]
    fn router_chain_tries_each_in_order() {
        let routers: Vec<Box<dyn InterruptRouter>> = vec![
            Box::new(StaticIrqRouter::new("pic", 0x20, 16)),
            Box::new(StaticIrqRouter::new("ioapic", 0x40, 24)),
        ];
        let mut core = InterruptState::new();
        assert!(route_and_raise(&routers, 5, &mut core));
        assert_eq!(core.peek(), Some(PendingDelivery::Vector(0x25)));

        let mut core2 = InterruptState::new();
        assert!(!route_and_raise(&routers, 100, &mut core2));
    }

    #[test]
    fn passthrough_table_tracks_marked_lines() {
        let mut table = PassthroughTable::new();
        assert!(!table.is_passthrough(9));
        table.mark_passthrough(9);
        assert!(table.is_passthrough(9));
    }
}


