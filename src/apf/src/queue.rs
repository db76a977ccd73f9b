// Copyright 2021 Red Hat, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crossbeam_channel::Receiver;

use crate::control::AsyncPfVcpu;
use crate::uapi::ASYNC_PF_PER_VCPU;

/// Makes guest pages resident on behalf of a faulting vCPU.
pub trait PageFill: Send + Sync {
    /// Brings the page backing `hva` in. Runs on the worker thread and may
    /// block for as long as it takes.
    fn fill(&self, hva: u64);
    /// Installs the stage-2 mapping for `gpa` before the guest is told the
    /// page is ready.
    fn map(&self, gpa: u64, write_fault: bool);
}

/// Architecture part of an outstanding fault.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ArchAsyncPf {
    pub token: u32,
    pub gfn: u64,
    pub esr: u64,
}

#[derive(Debug)]
pub struct AsyncPfWork {
    pub gpa: u64,
    pub hva: u64,
    pub arch: ArchAsyncPf,
    /// Wakes every task parked on a not-present notification.
    pub wakeup_all: bool,
    notpresent_injected: AtomicBool,
    cancelled: AtomicBool,
}

impl AsyncPfWork {
    pub(crate) fn new(gpa: u64, hva: u64, arch: ArchAsyncPf) -> Self {
        AsyncPfWork {
            gpa,
            hva,
            arch,
            wakeup_all: false,
            notpresent_injected: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
        }
    }

    fn wakeup() -> Self {
        AsyncPfWork {
            wakeup_all: true,
            ..AsyncPfWork::new(0, 0, ArchAsyncPf::default())
        }
    }

    pub fn notpresent_injected(&self) -> bool {
        self.notpresent_injected.load(Ordering::Acquire)
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

#[derive(Default)]
struct QueueInner {
    /// Works submitted and not yet retired.
    queue: Vec<Arc<AsyncPfWork>>,
    /// Filled works waiting for the vCPU, oldest first.
    done: VecDeque<Arc<AsyncPfWork>>,
    queued: usize,
}

#[derive(Default)]
pub(crate) struct AsyncPfQueue {
    inner: Mutex<QueueInner>,
}

impl AsyncPfQueue {
    pub fn queued(&self) -> usize {
        self.inner.lock().unwrap().queued
    }

    fn add(&self, work: Arc<AsyncPfWork>) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.queued >= ASYNC_PF_PER_VCPU || inner.queue.try_reserve(1).is_err() {
            return false;
        }
        inner.queue.push(work);
        inner.queued += 1;
        true
    }

    /// Returns true when `work` is the first entry on an empty done list.
    fn complete(&self, work: Arc<AsyncPfWork>) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if work.is_cancelled() {
            return false;
        }
        let first = inner.done.is_empty();
        inner.done.push_back(work);
        first
    }

    pub fn has_completion(&self) -> bool {
        !self.inner.lock().unwrap().done.is_empty()
    }

    pub fn first_done(&self) -> Option<Arc<AsyncPfWork>> {
        self.inner.lock().unwrap().done.front().cloned()
    }

    fn pop_done(&self) -> Option<Arc<AsyncPfWork>> {
        self.inner.lock().unwrap().done.pop_front()
    }

    fn retire(&self, work: &Arc<AsyncPfWork>) {
        let mut inner = self.inner.lock().unwrap();
        inner.queue.retain(|w| !Arc::ptr_eq(w, work));
        inner.queued = inner.queued.saturating_sub(1);
    }

    /// Returns false when completions are already waiting, since those will
    /// wake the guest anyway.
    fn push_wakeup_all(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if !inner.done.is_empty() {
            return false;
        }
        inner.done.push_back(Arc::new(AsyncPfWork::wakeup()));
        inner.queued += 1;
        true
    }

    fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        for work in inner.queue.drain(..) {
            work.cancelled.store(true, Ordering::Release);
        }
        inner.done.clear();
        inner.queued = 0;
    }
}

pub(crate) struct PageFillJob {
    vcpu: Arc<AsyncPfVcpu>,
    work: Arc<AsyncPfWork>,
}

/// Spawns the thread that fills pages for every vCPU of a VM. It exits once
/// all senders are gone.
pub(crate) fn start_page_fill_worker(
    filler: Arc<dyn PageFill>,
    receiver: Receiver<PageFillJob>,
) -> io::Result<()> {
    std::thread::Builder::new()
        .name("apf worker".into())
        .spawn(move || {
            while let Ok(job) = receiver.recv() {
                if !job.work.is_cancelled() {
                    filler.fill(job.work.hva);
                }
                job.vcpu.page_filled(job.work);
            }
            debug!("apf worker exiting");
        })?;
    Ok(())
}

impl AsyncPfVcpu {
    /// Queues an asynchronous fill of `gpa` and tells the guest the page is
    /// not present. Returns false if the fault has to be handled
    /// synchronously.
    pub(crate) fn queue_work(self: &Arc<Self>, gpa: u64, hva: u64, arch: ArchAsyncPf) -> bool {
        if self.queue.queued() >= ASYNC_PF_PER_VCPU {
            return false;
        }

        let work = Arc::new(AsyncPfWork::new(gpa, hva, arch));
        if !self.queue.add(work.clone()) {
            return false;
        }

        let injected = self.page_not_present(&work);
        work.notpresent_injected.store(injected, Ordering::Release);

        let job = PageFillJob {
            vcpu: self.clone(),
            work,
        };
        if let Err(e) = self.kvm().submit(job) {
            error!("apf worker is gone, completing gpa {:#x} inline", gpa);
            self.page_filled(e.into_inner().work);
        }
        true
    }

    pub(crate) fn page_filled(&self, work: Arc<AsyncPfWork>) {
        if self.queue.complete(work) {
            self.page_present_queued();
        }
    }

    /// Hands filled pages back to the guest, as many as the shared cache
    /// allows.
    pub fn check_completion(&self) {
        while self.queue.has_completion() && self.can_dequeue_page_present() {
            let work = match self.queue.pop_done() {
                Some(work) => work,
                None => break,
            };

            self.page_ready(&work);
            self.page_present(&work);
            self.queue.retire(&work);
        }
    }

    pub(crate) fn wakeup_all(&self) {
        if self.queue.push_wakeup_all() {
            self.page_present_queued();
        }
    }

    pub fn clear_completion_queue(&self) {
        self.queue.clear();
    }

    pub fn queued(&self) -> usize {
        self.queue.queued()
    }
}
