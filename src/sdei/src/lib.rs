// Copyright 2021 Red Hat, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Software Delegated Exception Interface (SDEI) emulation.
//!
//! The VM owns an [`SdeiKvm`] holding the firmware event definitions and the
//! events the guest has bound handlers to. Every vCPU owns an [`SdeiVcpu`]
//! with its pending event instances and the register context saved while a
//! handler runs. Locks nest registry first, vCPU second, never the other way
//! around.

#[macro_use]
extern crate log;

mod defs;
mod deliver;
mod event;
mod hypercall;
mod ioctl;
mod registry;
pub mod uapi;
mod vcpu;

use std::fmt::{self, Display};
use std::result;

pub use defs::*;
pub use event::{SdeiEvent, SdeiKvmEvent, SdeiNotifier, SdeiNotifyState};
pub use hypercall::{hypercall, is_sdei_call, SdeiExit};
pub use registry::{SdeiKvm, DEFAULT_EVENTS};
pub use vcpu::SdeiVcpu;

/// Errors reported to the host side (ioctls, injection and notifier setup).
#[derive(Debug, PartialEq, Eq)]
pub enum Error {
    /// SDEI is not available on this VM or vCPU.
    NotSupported,
    /// The event number is outside the virtual event namespace.
    InvalidEventNumber(u64),
    /// No firmware definition exists for the event.
    UndefinedEvent(u64),
    /// The event is already defined or bound.
    EventExists(u64),
    /// The guest has not bound a handler to the event.
    EventNotBound(u64),
    /// The event is not registered and enabled on the target vCPU.
    EventNotReady(u64),
    /// The target vCPU has event delivery masked.
    VcpuMasked,
    /// The event cannot be delivered at the next guest entry.
    CannotDeliver(u64),
    /// No pending instance of the event exists on the vCPU.
    EventNotPending(u64),
    /// The instance is being handled by the guest.
    EventRunning(u64),
    /// The vCPU still has queued or running events.
    VcpuBusy,
    /// A state blob passed by userspace is inconsistent.
    InvalidState,
    /// The bound event cursor reached the end of the list.
    NoMoreEvents,
    /// Unknown admin command.
    UnknownCommand(u32),
    /// Allocation failure.
    OutOfMemory,
}

impl Error {
    /// Errno a KVM ioctl reports for this error.
    pub fn errno(&self) -> i32 {
        match self {
            Error::NotSupported | Error::EventNotReady(_) | Error::VcpuMasked => libc::EPERM,
            Error::InvalidEventNumber(_)
            | Error::UndefinedEvent(_)
            | Error::InvalidState
            | Error::UnknownCommand(_) => libc::EINVAL,
            Error::EventExists(_) => libc::EEXIST,
            Error::EventNotBound(_) | Error::EventNotPending(_) | Error::NoMoreEvents => {
                libc::ENOENT
            }
            Error::CannotDeliver(_) => libc::ENOSPC,
            Error::EventRunning(_) => libc::EINPROGRESS,
            Error::VcpuBusy => libc::EBUSY,
            Error::OutOfMemory => libc::ENOMEM,
        }
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use self::Error::*;

        match self {
            NotSupported => write!(f, "SDEI is not supported"),
            InvalidEventNumber(num) => write!(f, "Invalid SDEI event number {num:#x}"),
            UndefinedEvent(num) => write!(f, "SDEI event {num:#x} is not defined"),
            EventExists(num) => write!(f, "SDEI event {num:#x} already exists"),
            EventNotBound(num) => write!(f, "SDEI event {num:#x} has no registered handler"),
            EventNotReady(num) => write!(f, "SDEI event {num:#x} is not registered and enabled"),
            VcpuMasked => write!(f, "SDEI events are masked on the vCPU"),
            CannotDeliver(num) => write!(f, "SDEI event {num:#x} cannot be delivered now"),
            EventNotPending(num) => write!(f, "SDEI event {num:#x} is not pending"),
            EventRunning(num) => write!(f, "SDEI event {num:#x} is being handled"),
            VcpuBusy => write!(f, "vCPU has queued or running SDEI events"),
            InvalidState => write!(f, "Inconsistent SDEI state"),
            NoMoreEvents => write!(f, "No more bound SDEI events"),
            UnknownCommand(cmd) => write!(f, "Unknown SDEI command {cmd}"),
            OutOfMemory => write!(f, "Out of memory allocating SDEI state"),
        }
    }
}

pub type Result<T> = result::Result<T, Error>;
