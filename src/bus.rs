//! Host-side signal lines and interrupt plumbing
//!
//! Interrupt handlers only translate line changes into [`Event`]s pushed onto
//! a lock-free queue; all state changes happen when the main loop drains it.

use core::ops::{Deref, DerefMut};

use crate::error::BusError;

/// Interrupt sources that can be held off around critical sections
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature="defmt", derive(defmt::Format))]
pub enum Irq {
    /// Stepper phase line changes
    Phase,
    /// Bit clock of the nibble stream
    Tick,
}

/// Lines between the emulator and the host computer
pub trait HostBus {
    /// Stepper phase lines, phase 0 in bit 0
    fn phases(&mut self) -> u8;

    /// Drive enable line for drive 0 or 1
    fn drive_enabled(&mut self, drive: usize) -> bool;

    /// Drive the read data line for one bit cell
    fn set_read_data(&mut self, level: bool);

    /// Write-protect sense line seen by a Disk II controller
    fn set_write_protect(&mut self, protected: bool);

    /// SmartPort request line from the host
    fn req(&mut self) -> bool;

    /// SmartPort acknowledge line to the host
    fn set_ack(&mut self, high: bool);

    /// Next byte shifted in from the host, if one is ready
    fn recv_byte(&mut self) -> Option<u8>;

    /// Shift one byte out to the host
    fn send_byte(&mut self, byte: u8);

    /// Free running microsecond counter, allowed to wrap
    fn micros(&mut self) -> u32;

    fn suspend(&mut self, irq: Irq);

    fn resume(&mut self, irq: Irq);

    /// Activity indicator
    fn set_activity(&mut self, _on: bool) {}
}

/// Spin until `cond` holds or `timeout_us` has elapsed
pub fn wait_for<B, F>(bus: &mut B, timeout_us: u32, mut cond: F) -> Result<(), BusError>
where
    B: HostBus,
    F: FnMut(&mut B) -> bool,
{
    let start = bus.micros();
    loop {
        if cond(bus) {
            return Ok(());
        }
        if bus.micros().wrapping_sub(start) >= timeout_us {
            return Err(BusError::Timeout);
        }
    }
}

/// Holds an interrupt source off until dropped
pub struct Suspended<'a, B: HostBus> {
    bus: &'a mut B,
    irq: Irq,
}

impl <'a, B: HostBus> Suspended<'a, B> {
    pub fn new(bus: &'a mut B, irq: Irq) -> Self {
        bus.suspend(irq);
        Self { bus, irq }
    }
}

impl <'a, B: HostBus> Deref for Suspended<'a, B> {
    type Target = B;

    fn deref(&self) -> &B {
        self.bus
    }
}

impl <'a, B: HostBus> DerefMut for Suspended<'a, B> {
    fn deref_mut(&mut self) -> &mut B {
        self.bus
    }
}

impl <'a, B: HostBus> Drop for Suspended<'a, B> {
    fn drop(&mut self) {
        self.bus.resume(self.irq);
    }
}

/// Something an interrupt handler observed
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature="defmt", derive(defmt::Format))]
pub enum Event {
    /// Bit clock elapsed, shift the next nibble stream bit
    Tick,
    /// Phase lines changed to the contained pattern
    Phase(u8),
    /// Host wrote a byte while the write request was held
    WriteByte(u8),
    /// Host released the write request
    WriteEnd,
}

/// Events buffered between interrupt handlers and the main loop
pub const EVENT_CAPACITY: usize = 64;

pub type EventQueue = heapless::spsc::Queue<Event, EVENT_CAPACITY>;
