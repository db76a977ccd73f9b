// Copyright 2021 Red Hat, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Asynchronous page faults.
//!
//! When a guest access faults on a page the host has to bring in from slow
//! storage, the vCPU is not blocked. The guest is told the page is not
//! present through an SDEI event, schedules something else, and later gets an
//! interrupt once a worker thread has made the page resident.

#[macro_use]
extern crate log;

mod cache;
mod control;
mod queue;
mod slots;
pub mod uapi;

use std::io;

pub use cache::ApfCache;
pub use control::{AsyncPfKvm, AsyncPfVcpu, IrqLine, VcpuKick};
pub use queue::{ArchAsyncPf, AsyncPfWork, PageFill};
pub use slots::GfnSlots;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("guest memory access failed: {0}")]
    GuestMemory(#[from] vm_memory::GuestMemoryError),
    #[error("control block at {0:#x} is not backed by guest memory")]
    InvalidControlBlock(u64),
    #[error("offset {0:#x} is outside the shared cache")]
    CacheOffset(usize),
    #[error("shared cache is not initialized")]
    CacheNotInitialized,
    #[error("asynchronous page faults are not available")]
    NotAvailable,
    #[error("unknown command {0}")]
    InvalidCommand(u32),
    #[error("cannot update the control block")]
    ControlUpdate,
    #[error("cannot start the page fill worker: {0}")]
    WorkerSpawn(#[source] io::Error),
}

impl Error {
    /// Errno a KVM ioctl reports for this error.
    pub fn errno(&self) -> i32 {
        match self {
            Error::GuestMemory(_) | Error::InvalidControlBlock(_) => libc::EFAULT,
            Error::CacheOffset(_) | Error::CacheNotInitialized | Error::InvalidCommand(_) => {
                libc::EINVAL
            }
            Error::NotAvailable => libc::EPERM,
            Error::ControlUpdate => libc::EIO,
            Error::WorkerSpawn(e) => e.raw_os_error().unwrap_or(libc::EIO),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
