// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Per VM and per vCPU owners of the SDEI and asynchronous page fault state,
//! as a VMM drives them from its vCPU threads.

#[macro_use]
extern crate log;

/// Log initialization.
pub mod logger;
/// Wrapper for configuring the VM.
pub mod vmm_config;
/// VM and vCPU state.
pub mod vstate;

#[cfg(test)]
mod tests;

pub use vstate::{HostPageFill, Vcpu, VcpuEmulation, Vm};

use std::fmt::{Display, Formatter};
use std::io;

use vmm_config::VmConfigError;

/// Errors associated with the VM and its vCPUs.
#[derive(Debug)]
pub enum Error {
    /// Asynchronous page faults could not be set up.
    AsyncPf(apf::Error),
    /// Asynchronous page faults are not enabled for this VM.
    AsyncPfUnavailable,
    /// Invalid VM configuration.
    Config(VmConfigError),
    /// Cannot create the vCPU kick eventfd.
    EventFd(io::Error),
    /// Invalid guest memory configuration.
    GuestMemoryMmap(vm_memory::Error),
    /// The configuration asks for an irqchip but none was provided.
    MissingIrqchip,
    /// An SDEI admin command failed.
    Sdei(sdei::Error),
    /// SDEI is disabled for this VM.
    SdeiUnavailable,
    /// The vCPU index is out of range.
    VcpuIndex(usize),
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        use self::Error::*;

        match self {
            AsyncPf(e) => write!(f, "Asynchronous page fault error: {e}"),
            AsyncPfUnavailable => write!(f, "Asynchronous page faults are not enabled"),
            Config(e) => write!(f, "Invalid VM configuration: {e}"),
            EventFd(e) => write!(f, "Cannot create the vCPU kick eventfd: {e}"),
            GuestMemoryMmap(e) => write!(f, "Guest memory error: {e:?}"),
            MissingIrqchip => write!(f, "No interrupt controller was provided"),
            Sdei(e) => write!(f, "SDEI error: {e}"),
            SdeiUnavailable => write!(f, "SDEI is not enabled"),
            VcpuIndex(idx) => write!(f, "Invalid vCPU index: {idx}"),
        }
    }
}

impl Error {
    /// Errno a KVM ioctl reports for this error.
    pub fn errno(&self) -> i32 {
        use self::Error::*;

        match self {
            AsyncPf(e) => e.errno(),
            Sdei(e) => e.errno(),
            AsyncPfUnavailable | SdeiUnavailable => libc::EPERM,
            EventFd(e) => e.raw_os_error().unwrap_or(libc::EIO),
            GuestMemoryMmap(_) => libc::ENOMEM,
            Config(_) | MissingIrqchip | VcpuIndex(_) => libc::EINVAL,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
