// SPDX-License-Identifier: Apache-2.0

use std::io::{stdout, Error, Result, Write};
use std::ops::Deref;

use vm_superio::serial::NoEvents;
use vm_superio::{Serial, Trigger};
use vmm_sys_util::eventfd::EventFd;

pub const SERIAL_PORT_BASE: u16 = 0x3f8;
/// A 16550-compatible UART exposes 8 consecutive byte registers.
pub const SERIAL_PORT_LAST_REGISTER: u16 = SERIAL_PORT_BASE + 7;

pub struct EventFdTrigger(EventFd);

impl Trigger for EventFdTrigger {
    type E = Error;

    fn trigger(&self) -> Result<()> {
        self.write(1)
    }
}

impl Deref for EventFdTrigger {
    type Target = EventFd;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl EventFdTrigger {
    pub fn new(flag: i32) -> Result<Self> {
        Ok(EventFdTrigger(EventFd::new(flag)?))
    }
    pub fn try_clone(&self) -> Result<Self> {
        Ok(EventFdTrigger((**self).try_clone()?))
    }
}

/// Where the emulated UART's output bytes end up. The Service VM console is
/// explicitly out of scope for the core substrate (spec.md §1 lists
/// "UART/console/debug printing" as an external collaborator); this is kept
/// only so the guest has somewhere to write its early boot output.
pub(crate) type SerialOut = Box<dyn Write + Send>;

pub(crate) struct LumperSerial {
    // evenfd allows for the device to send interrupts to the guest.
    eventfd: EventFdTrigger,

    // serial is the actual serial device.
    pub serial: Serial<EventFdTrigger, NoEvents, SerialOut>,
}

impl LumperSerial {
    pub fn new(out: SerialOut) -> Result<Self> {
        let eventfd = EventFdTrigger::new(libc::EFD_NONBLOCK).unwrap();

        Ok(LumperSerial {
            eventfd: eventfd.try_clone()?,
            serial: Serial::new(eventfd.try_clone()?, out),
        })
    }

    /// Console bound to the host's standard output (the default).
    pub fn stdout() -> Result<Self> {
        Self::new(Box::new(stdout()))
    }

    pub fn eventfd(&self) -> Result<EventFd> {
        Ok(self.eventfd.try_clone()?.0)
    }
}
