// Copyright 2021 Red Hat, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use arch::aarch64::esr;
use arch::aarch64::regs::pstate_is_priv;
use arch::aarch64::smccc::{
    SMCCC_RET_INVALID_PARAMETER, SMCCC_RET_NOT_REQUIRED, SMCCC_RET_NOT_SUPPORTED,
    SMCCC_RET_SUCCESS,
};
use arch::VcpuRegs;
use crossbeam_channel::{SendError, Sender};
use sdei::{SdeiKvm, SdeiNotifier, SdeiNotifyState, SdeiVcpu};
use vm_memory::{GuestAddress, GuestMemory, GuestMemoryMmap};

use crate::cache::ApfCache;
use crate::queue::{
    start_page_fill_worker, ArchAsyncPf, AsyncPfQueue, AsyncPfWork, PageFill, PageFillJob,
};
use crate::slots::GfnSlots;
use crate::uapi::*;
use crate::{Error, Result};

/// Interrupt line used to signal page-ready notifications.
pub trait IrqLine: Send + Sync {
    fn set_irq(&self, vcpu_idx: usize, irq: u32, level: bool) -> io::Result<()>;
}

/// Forces a vCPU back to its guest-entry checkpoint.
pub type VcpuKick = Box<dyn Fn() + Send + Sync>;

/// VM-wide asynchronous page fault state.
pub struct AsyncPfKvm {
    mem: GuestMemoryMmap,
    irqchip: Option<Arc<dyn IrqLine>>,
    sdei: Option<Arc<SdeiKvm>>,
    filler: Arc<dyn PageFill>,
    vcpus: Mutex<Vec<Weak<AsyncPfVcpu>>>,
    worker: Sender<PageFillJob>,
}

impl AsyncPfKvm {
    pub fn new(
        mem: GuestMemoryMmap,
        irqchip: Option<Arc<dyn IrqLine>>,
        sdei: Option<Arc<SdeiKvm>>,
        filler: Arc<dyn PageFill>,
    ) -> Result<Arc<Self>> {
        let (sender, receiver) = crossbeam_channel::unbounded();
        start_page_fill_worker(filler.clone(), receiver).map_err(Error::WorkerSpawn)?;

        Ok(Arc::new(AsyncPfKvm {
            mem,
            irqchip,
            sdei,
            filler,
            vcpus: Mutex::new(Vec::new()),
            worker: sender,
        }))
    }

    pub fn mem(&self) -> &GuestMemoryMmap {
        &self.mem
    }

    pub fn create_vcpu(
        self: &Arc<Self>,
        vcpu_idx: usize,
        vcpu_id: u32,
        sdei: Option<Arc<SdeiVcpu>>,
        kick: VcpuKick,
    ) -> Arc<AsyncPfVcpu> {
        let vcpu = Arc::new(AsyncPfVcpu {
            vcpu_idx,
            vcpu_id,
            kvm: self.clone(),
            sdei,
            control: Mutex::new(AsyncPfControl::default()),
            queue: AsyncPfQueue::default(),
            request: AtomicBool::new(false),
            kick,
        });

        let mut vcpus = self.vcpus.lock().unwrap();
        vcpus.retain(|v| v.strong_count() > 0);
        vcpus.push(Arc::downgrade(&vcpu));
        vcpu
    }

    fn vcpu(&self, vcpu_idx: usize) -> Option<Arc<AsyncPfVcpu>> {
        self.vcpus
            .lock()
            .unwrap()
            .iter()
            .filter_map(Weak::upgrade)
            .find(|v| v.vcpu_idx == vcpu_idx)
    }

    pub(crate) fn submit(
        &self,
        job: PageFillJob,
    ) -> std::result::Result<(), SendError<PageFillJob>> {
        self.worker.send(job)
    }

    pub fn vm_ioctl(&self, cmd: &mut KvmArmAsyncPfCmd) -> Result<()> {
        match cmd.cmd {
            KVM_ARM_ASYNC_PF_CMD_GET_VERSION => {
                cmd.version = KVM_ASYNC_PF_VERSION;
                Ok(())
            }
            _ => {
                warn!("unknown async PF VM command {}", cmd.cmd);
                Err(Error::InvalidCommand(cmd.cmd))
            }
        }
    }
}

/// Routes SDEI dispatch notifications back to the owning vCPU.
struct SdeiBridge(Weak<AsyncPfKvm>);

impl SdeiNotifier for SdeiBridge {
    fn notify(&self, vcpu_idx: usize, num: u64, state: SdeiNotifyState) {
        if let Some(vcpu) = self.0.upgrade().and_then(|kvm| kvm.vcpu(vcpu_idx)) {
            vcpu.sdei_notify(num, state);
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct AsyncPfControl {
    control_block: u64,
    send_user_only: bool,
    sdei_event_num: u64,
    irq: u32,
    notpresent_pending: bool,
    notpresent_token: u32,
    pageready_pending: bool,
    id: u32,
    cache: Option<ApfCache>,
    slots: GfnSlots,
}

impl AsyncPfControl {
    fn is_enabled(&self) -> bool {
        AsyncPfControlFlags::from_bits_truncate(self.control_block)
            .contains(AsyncPfControlFlags::ENABLED)
    }
}

/// Per-vCPU asynchronous page fault state.
pub struct AsyncPfVcpu {
    vcpu_idx: usize,
    vcpu_id: u32,
    kvm: Arc<AsyncPfKvm>,
    sdei: Option<Arc<SdeiVcpu>>,
    control: Mutex<AsyncPfControl>,
    pub(crate) queue: AsyncPfQueue,
    request: AtomicBool,
    kick: VcpuKick,
}

impl AsyncPfVcpu {
    pub fn idx(&self) -> usize {
        self.vcpu_idx
    }

    pub(crate) fn kvm(&self) -> &AsyncPfKvm {
        &self.kvm
    }

    fn lock(&self) -> MutexGuard<'_, AsyncPfControl> {
        self.control.lock().unwrap()
    }

    pub fn make_request(&self) {
        self.request.store(true, Ordering::Release);
    }

    /// Consumes a pending completion request.
    pub fn check_request(&self) -> bool {
        self.request.swap(false, Ordering::AcqRel)
    }

    pub fn is_enabled(&self) -> bool {
        self.lock().is_enabled()
    }

    fn read_cache(&self, ctl: &AsyncPfControl, offset: usize) -> Result<u32> {
        ctl.cache
            .as_ref()
            .ok_or(Error::CacheNotInitialized)?
            .read(self.kvm.mem(), offset)
    }

    fn write_cache(&self, ctl: &AsyncPfControl, offset: usize, val: u32) -> Result<()> {
        ctl.cache
            .as_ref()
            .ok_or(Error::CacheNotInitialized)?
            .write(self.kvm.mem(), offset, val)
    }

    fn read_notification(&self, ctl: &AsyncPfControl) -> Option<(u32, u32)> {
        let read = self
            .read_cache(ctl, PV_APF_REASON_OFFSET)
            .and_then(|reason| Ok((reason, self.read_cache(ctl, PV_APF_TOKEN_OFFSET)?)));
        match read {
            Ok(notification) => Some(notification),
            Err(e) => {
                error!("vcpu {}: cannot read async PF cache: {}", self.vcpu_idx, e);
                None
            }
        }
    }

    fn write_notification(&self, ctl: &AsyncPfControl, reason: u32, token: u32) -> Result<()> {
        self.write_cache(ctl, PV_APF_TOKEN_OFFSET, token)?;
        self.write_cache(ctl, PV_APF_REASON_OFFSET, reason)
    }

    fn clear_notification(&self, ctl: &AsyncPfControl) {
        if let Err(e) = self.write_notification(ctl, 0, 0) {
            error!("vcpu {}: cannot clear async PF cache: {}", self.vcpu_idx, e);
        }
    }

    /// Whether a fault taken with `pstate` may be reported to the guest as
    /// not present instead of being resolved synchronously.
    pub fn not_present_allowed(&self, pstate: u64) -> bool {
        let ctl = self.lock();
        if !ctl.is_enabled() {
            return false;
        }
        if ctl.send_user_only && pstate_is_priv(pstate) {
            return false;
        }
        if self.kvm.irqchip.is_none() {
            return false;
        }
        match &self.sdei {
            Some(sdei) if !sdei.has_active_event() => (),
            _ => return false,
        }

        matches!(self.read_notification(&ctl), Some((0, 0)))
    }

    /// Whether a not-present notification is outstanding for `gfn`.
    pub fn is_gfn_pending(&self, gfn: u64) -> bool {
        self.lock().slots.find(gfn)
    }

    /// Starts an asynchronous fill for a stage-2 fault on `gpa`. Returns
    /// false when the fault has to be handled synchronously.
    pub fn setup_async_pf(self: &Arc<Self>, esr: u64, gpa: u64, gfn: u64) -> bool {
        let hva = match self.kvm.mem().get_host_address(GuestAddress(gpa)) {
            Ok(hva) => hva as u64,
            Err(_) => return false,
        };

        let token = {
            let mut ctl = self.lock();
            let token = (ctl.id << 12) | self.vcpu_id;
            ctl.id = ctl.id.wrapping_add(1);
            token
        };

        self.queue_work(gpa, hva, ArchAsyncPf { token, gfn, esr })
    }

    pub(crate) fn page_not_present(&self, work: &AsyncPfWork) -> bool {
        let mut ctl = self.lock();
        let token = work.arch.token;

        ctl.slots.add(work.arch.gfn);
        if let Err(e) = self.write_notification(&ctl, KVM_PV_REASON_PAGE_NOT_PRESENT, token) {
            error!(
                "vcpu {}: cannot notify page not present for token {:#x}: {}",
                self.vcpu_idx, token, e
            );
            self.clear_notification(&ctl);
            ctl.slots.remove(work.arch.gfn);
            return false;
        }

        ctl.notpresent_pending = true;
        ctl.notpresent_token = token;
        let num = ctl.sdei_event_num;
        drop(ctl);

        let injected = match (&self.kvm.sdei, &self.sdei) {
            (Some(kvm), Some(vcpu)) => vcpu.inject(kvm, num, true),
            _ => Err(sdei::Error::NotSupported),
        };
        match injected {
            Ok(()) => true,
            Err(e) => {
                debug!("vcpu {}: page not present not injected: {}", self.vcpu_idx, e);
                self.withdraw_not_present(work);
                false
            }
        }
    }

    /// Undoes the cache and slot updates of a not-present notification the
    /// guest will never see.
    fn withdraw_not_present(&self, work: &AsyncPfWork) {
        let mut ctl = self.lock();
        if !ctl.notpresent_pending || ctl.notpresent_token != work.arch.token {
            return;
        }
        ctl.notpresent_pending = false;
        ctl.notpresent_token = 0;
        ctl.slots.remove(work.arch.gfn);
        self.clear_notification(&ctl);
    }

    pub(crate) fn page_present_queued(&self) {
        self.make_request();
        if !self.lock().pageready_pending {
            (self.kick)();
        }
    }

    pub(crate) fn can_dequeue_page_present(&self) -> bool {
        let ctl = self.lock();
        if !ctl.is_enabled() {
            return true;
        }

        let allowed = self.page_present_allowed(&ctl);
        // Retry from the next guest entry.
        if !allowed {
            self.make_request();
        }
        allowed
    }

    fn page_present_allowed(&self, ctl: &AsyncPfControl) -> bool {
        if ctl.pageready_pending {
            return false;
        }

        let (reason, token) = match self.read_notification(ctl) {
            Some(notification) => notification,
            None => return false,
        };

        // The page came in before the guest saw the not-present
        // notification. Let page_present() withdraw it.
        if ctl.notpresent_pending {
            let work = match self.queue.first_done() {
                Some(work) => work,
                None => return false,
            };
            if reason == KVM_PV_REASON_PAGE_NOT_PRESENT
                && work.arch.token == ctl.notpresent_token
                && token == ctl.notpresent_token
            {
                self.make_request();
                return true;
            }
        }

        reason == 0 && token == 0
    }

    pub(crate) fn page_ready(&self, work: &AsyncPfWork) {
        if work.wakeup_all {
            return;
        }
        if !self.kvm.mem().address_in_range(GuestAddress(work.gpa)) {
            return;
        }
        self.kvm
            .filler
            .map(work.gpa, esr::is_write_fault(work.arch.esr));
    }

    pub(crate) fn page_present(&self, work: &AsyncPfWork) {
        let mut ctl = self.lock();

        let token = if work.wakeup_all {
            !0
        } else {
            ctl.slots.remove(work.arch.gfn);
            if ctl.notpresent_pending
                && ctl.notpresent_token == work.arch.token
                && self.cancel_not_present(ctl.sdei_event_num)
            {
                ctl.notpresent_pending = false;
                ctl.notpresent_token = 0;
                self.clear_notification(&ctl);
                return;
            }
            // The guest never saw this token.
            if !work.notpresent_injected() {
                return;
            }
            work.arch.token
        };

        if let Err(e) = self.write_notification(&ctl, KVM_PV_REASON_PAGE_READY, token) {
            error!(
                "vcpu {}: cannot notify page ready for token {:#x}: {}",
                self.vcpu_idx, token, e
            );
            self.clear_notification(&ctl);
            return;
        }

        ctl.pageready_pending = true;
        let irq = ctl.irq;
        drop(ctl);

        self.set_irq(irq, true);
    }

    fn cancel_not_present(&self, num: u64) -> bool {
        match (&self.kvm.sdei, &self.sdei) {
            (Some(kvm), Some(vcpu)) => vcpu.cancel(kvm, num).is_ok(),
            _ => false,
        }
    }

    fn set_irq(&self, irq: u32, level: bool) {
        if let Some(irqchip) = &self.kvm.irqchip {
            if let Err(e) = irqchip.set_irq(self.vcpu_idx, irq, level) {
                error!(
                    "vcpu {}: cannot set async PF irq {} to {}: {}",
                    self.vcpu_idx, irq, level, e
                );
            }
        }
    }

    fn sdei_notify(&self, num: u64, state: SdeiNotifyState) {
        let mut ctl = self.lock();
        if num != ctl.sdei_event_num {
            error!(
                "vcpu {}: notified for SDEI event {:#x}, expected {:#x}",
                self.vcpu_idx, num, ctl.sdei_event_num
            );
            return;
        }

        match state {
            SdeiNotifyState::Delivered => {
                if ctl.notpresent_pending {
                    ctl.notpresent_pending = false;
                    ctl.notpresent_token = 0;
                }
            }
            SdeiNotifyState::Completed => (),
        }
    }

    fn enable(&self, data: u64) -> i64 {
        if self.kvm.irqchip.is_none() {
            return SMCCC_RET_NOT_SUPPORTED;
        }

        let mut ctl = self.lock();
        let enable = AsyncPfControlFlags::from_bits_truncate(data);
        if ctl.is_enabled() == enable.contains(AsyncPfControlFlags::ENABLED) {
            debug!(
                "vcpu {}: async PF already {}",
                self.vcpu_idx,
                if ctl.is_enabled() { "enabled" } else { "disabled" }
            );
            return SMCCC_RET_NOT_REQUIRED;
        }

        if !enable.contains(AsyncPfControlFlags::ENABLED) {
            self.clear_completion_queue();
            ctl.control_block = data;
            debug!("vcpu {}: async PF disabled", self.vcpu_idx);
            return SMCCC_RET_SUCCESS;
        }

        if ctl.sdei_event_num == 0 || ctl.irq == 0 {
            error!(
                "vcpu {}: async PF needs an SDEI event ({:#x}) and an irq ({})",
                self.vcpu_idx, ctl.sdei_event_num, ctl.irq
            );
            return SMCCC_RET_INVALID_PARAMETER;
        }

        let sdei = match &self.kvm.sdei {
            Some(sdei) => sdei,
            None => return SMCCC_RET_NOT_SUPPORTED,
        };
        let bridge = Arc::new(SdeiBridge(Arc::downgrade(&self.kvm)));
        if let Err(e) = sdei.register_notifier(ctl.sdei_event_num, bridge) {
            error!("vcpu {}: cannot attach to SDEI event: {}", self.vcpu_idx, e);
            return SMCCC_RET_NOT_SUPPORTED;
        }

        let gpa = data & KVM_ASYNC_PF_ADDR_MASK;
        match ApfCache::new(self.kvm.mem(), gpa, PV_APF_CACHE_LEN) {
            Ok(cache) => ctl.cache = Some(cache),
            Err(e) => {
                error!("vcpu {}: cannot map async PF cache: {}", self.vcpu_idx, e);
                return SMCCC_RET_NOT_SUPPORTED;
            }
        }

        ctl.slots.reset();
        ctl.send_user_only = !enable.contains(AsyncPfControlFlags::SEND_ALWAYS);
        ctl.control_block = data;
        drop(ctl);

        self.wakeup_all();
        debug!("vcpu {}: async PF enabled at {:#x}", self.vcpu_idx, gpa);
        SMCCC_RET_SUCCESS
    }

    fn irq_ack(&self) {
        let mut ctl = self.lock();
        if !ctl.pageready_pending {
            return;
        }
        ctl.pageready_pending = false;
        let irq = ctl.irq;
        drop(ctl);

        self.set_irq(irq, false);
        self.check_completion();
    }

    /// Handles the vendor hypercall; the sub-function is in x1.
    pub fn hypercall(&self, regs: &mut VcpuRegs) {
        let mut ret = SMCCC_RET_SUCCESS;
        let mut val = 0;

        match regs.smccc_arg(1) {
            ARM_SMCCC_KVM_FUNC_ASYNC_PF_VERSION => val = u64::from(KVM_ASYNC_PF_VERSION),
            ARM_SMCCC_KVM_FUNC_ASYNC_PF_SLOTS => val = ASYNC_PF_PER_VCPU as u64,
            ARM_SMCCC_KVM_FUNC_ASYNC_PF_SDEI => val = self.lock().sdei_event_num,
            ARM_SMCCC_KVM_FUNC_ASYNC_PF_IRQ => val = u64::from(self.lock().irq),
            ARM_SMCCC_KVM_FUNC_ASYNC_PF_ENABLE => {
                ret = self.enable((regs.smccc_arg(3) << 32) | regs.smccc_arg(2));
            }
            ARM_SMCCC_KVM_FUNC_ASYNC_PF_IRQ_ACK => self.irq_ack(),
            _ => ret = SMCCC_RET_NOT_SUPPORTED,
        }

        regs.smccc_set_retval(ret as u64, val, 0, 0);
    }

    pub fn vcpu_ioctl(&self, cmd: &mut KvmArmAsyncPfCmd) -> Result<()> {
        match cmd.cmd {
            KVM_ARM_ASYNC_PF_CMD_GET_SDEI => cmd.sdei = self.lock().sdei_event_num,
            KVM_ARM_ASYNC_PF_CMD_GET_IRQ => cmd.irq = self.lock().irq,
            KVM_ARM_ASYNC_PF_CMD_GET_CONTROL => cmd.control = self.lock().control_block,
            KVM_ARM_ASYNC_PF_CMD_SET_SDEI => self.lock().sdei_event_num = cmd.sdei,
            KVM_ARM_ASYNC_PF_CMD_SET_IRQ => self.lock().irq = cmd.irq,
            KVM_ARM_ASYNC_PF_CMD_SET_CONTROL => {
                if self.enable(cmd.control) != SMCCC_RET_SUCCESS {
                    warn!("vcpu {}: cannot restore async PF control", self.vcpu_idx);
                    return Err(Error::ControlUpdate);
                }
            }
            _ => {
                warn!("vcpu {}: unknown async PF command {}", self.vcpu_idx, cmd.cmd);
                return Err(Error::InvalidCommand(cmd.cmd));
            }
        }
        Ok(())
    }
}
