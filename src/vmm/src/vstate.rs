// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::io;
use std::sync::Arc;

use apf::uapi::KvmArmAsyncPfCmd;
use apf::{AsyncPfKvm, AsyncPfVcpu, IrqLine, PageFill, VcpuKick};
use arch::aarch64::layout::{DRAM_MEM_START, PAGE_SHIFT};
use arch::aarch64::smccc::{ARM_SMCCC_VENDOR_HYP_KVM_ASYNC_PF_FUNC, SMCCC_RET_NOT_SUPPORTED};
use arch::VcpuRegs;
use sdei::uapi::KvmSdeiCmd;
use sdei::{SdeiExit, SdeiKvm, SdeiVcpu};
use vm_memory::{GuestAddress, GuestMemoryMmap};
use vmm_sys_util::eventfd::{EventFd, EFD_NONBLOCK};

use crate::vmm_config::VmConfig;
use crate::{Error, Result};

/// Brings a guest page in by touching its host mapping.
pub struct HostPageFill;

impl PageFill for HostPageFill {
    fn fill(&self, hva: u64) {
        // Safe because `hva` was translated from guest memory, and the async
        // PF state holding that memory outlives every queued fill.
        let _ = unsafe { std::ptr::read_volatile(hva as *const u8) };
    }

    fn map(&self, _gpa: u64, _write_fault: bool) {}
}

/// Outcome of handling a guest trap.
#[derive(Debug, PartialEq, Eq)]
pub enum VcpuEmulation {
    Handled,
    /// The guest asked to take a pending interrupt right away.
    InjectIrq,
}

/// A wrapper around the firmware services state of a VM.
pub struct Vm {
    vcpu_count: usize,
    mem: GuestMemoryMmap,
    sdei: Option<Arc<SdeiKvm>>,
    apf: Option<Arc<AsyncPfKvm>>,
}

impl Vm {
    /// Builds guest memory and the SDEI and async PF state from `config`.
    /// An SDEI table the registry refuses leaves SDEI disabled.
    pub fn new(
        config: &VmConfig,
        irqchip: Option<Arc<dyn IrqLine>>,
        filler: Arc<dyn PageFill>,
    ) -> Result<Self> {
        config.validate().map_err(Error::Config)?;

        let irqchip = match (config.irqchip, irqchip) {
            (true, None) => return Err(Error::MissingIrqchip),
            (true, irqchip) => irqchip,
            (false, _) => None,
        };

        let mem = GuestMemoryMmap::from_ranges(&[(
            GuestAddress(DRAM_MEM_START),
            config.mem_size_mib << 20,
        )])
        .map_err(Error::GuestMemoryMmap)?;

        let sdei = if config.sdei {
            let sdei = SdeiKvm::new(&config.sdei_events).map(Arc::new);
            if sdei.is_none() {
                warn!("Cannot create the SDEI registry, SDEI is disabled");
            }
            sdei
        } else {
            None
        };

        let apf = if config.async_pf {
            Some(
                AsyncPfKvm::new(mem.clone(), irqchip, sdei.clone(), filler)
                    .map_err(Error::AsyncPf)?,
            )
        } else {
            None
        };

        Ok(Vm {
            vcpu_count: usize::from(config.vcpu_count),
            mem,
            sdei,
            apf,
        })
    }

    pub fn mem(&self) -> &GuestMemoryMmap {
        &self.mem
    }

    pub fn sdei(&self) -> Option<&Arc<SdeiKvm>> {
        self.sdei.as_ref()
    }

    pub fn create_vcpu(&self, idx: usize) -> Result<Vcpu> {
        if idx >= self.vcpu_count {
            return Err(Error::VcpuIndex(idx));
        }

        let sdei = match &self.sdei {
            Some(_) => SdeiVcpu::new(idx).map(Arc::new),
            None => None,
        };

        let kick_evt = EventFd::new(EFD_NONBLOCK).map_err(Error::EventFd)?;
        let apf = match &self.apf {
            Some(kvm) => {
                let evt = kick_evt.try_clone().map_err(Error::EventFd)?;
                let kick: VcpuKick = Box::new(move || {
                    if let Err(e) = evt.write(1) {
                        error!("Failed to kick vcpu {idx}: {e}");
                    }
                });
                Some(kvm.create_vcpu(idx, idx as u32, sdei.clone(), kick))
            }
            None => None,
        };

        Ok(Vcpu {
            idx,
            regs: VcpuRegs::default(),
            sdei_kvm: self.sdei.clone(),
            sdei,
            apf,
            kick_evt,
        })
    }

    /// VM wide SDEI admin commands.
    pub fn sdei_ioctl(&self, cmd: &mut KvmSdeiCmd) -> Result<()> {
        self.sdei
            .as_ref()
            .ok_or(Error::SdeiUnavailable)?
            .vm_ioctl(cmd)
            .map_err(Error::Sdei)
    }

    /// VM wide async PF admin commands.
    pub fn apf_ioctl(&self, cmd: &mut KvmArmAsyncPfCmd) -> Result<()> {
        self.apf
            .as_ref()
            .ok_or(Error::AsyncPfUnavailable)?
            .vm_ioctl(cmd)
            .map_err(Error::AsyncPf)
    }
}

impl Drop for Vm {
    fn drop(&mut self) {
        if let Some(sdei) = &self.sdei {
            sdei.destroy();
        }
    }
}

/// A wrapper around the firmware services state of a vCPU.
pub struct Vcpu {
    idx: usize,
    regs: VcpuRegs,
    sdei_kvm: Option<Arc<SdeiKvm>>,
    sdei: Option<Arc<SdeiVcpu>>,
    apf: Option<Arc<AsyncPfVcpu>>,
    kick_evt: EventFd,
}

impl Vcpu {
    pub fn idx(&self) -> usize {
        self.idx
    }

    pub fn regs(&self) -> &VcpuRegs {
        &self.regs
    }

    pub fn regs_mut(&mut self) -> &mut VcpuRegs {
        &mut self.regs
    }

    pub fn sdei(&self) -> Option<&Arc<SdeiVcpu>> {
        self.sdei.as_ref()
    }

    /// Becomes readable when a completed page fill needs this vCPU.
    pub fn kick_evt(&self) -> &EventFd {
        &self.kick_evt
    }

    /// Handles an HVC or SMC exit, routing by the SMCCC function id in x0.
    pub fn handle_hypercall(&mut self) -> VcpuEmulation {
        let func_id = self.regs.smccc_function();

        if sdei::is_sdei_call(func_id) {
            let exit = sdei::hypercall(
                self.sdei_kvm.as_deref(),
                self.sdei.as_deref(),
                &mut self.regs,
            );
            return match exit {
                SdeiExit::Handled => VcpuEmulation::Handled,
                SdeiExit::InjectIrq => VcpuEmulation::InjectIrq,
            };
        }

        match (&self.apf, func_id) {
            (Some(apf), ARM_SMCCC_VENDOR_HYP_KVM_ASYNC_PF_FUNC) => apf.hypercall(&mut self.regs),
            _ => {
                debug!("vcpu {}: unsupported hypercall {func_id:#x}", self.idx);
                self.regs
                    .smccc_set_retval(SMCCC_RET_NOT_SUPPORTED as u64, 0, 0, 0);
            }
        }
        VcpuEmulation::Handled
    }

    /// Runs before every guest entry: hands completed pages back, then
    /// diverts into a pending SDEI handler.
    pub fn pre_enter(&mut self) {
        // Only clears the wakeup; the request flags carry the work.
        match self.kick_evt.read() {
            Ok(_) => (),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => (),
            Err(e) => error!("Failed to read the kick eventfd of vcpu {}: {e}", self.idx),
        }

        if let Some(apf) = &self.apf {
            if apf.check_request() {
                apf.check_completion();
            }
        }

        if let (Some(kvm), Some(sdei)) = (&self.sdei_kvm, &self.sdei) {
            if sdei.check_request() {
                sdei.deliver(kvm, &mut self.regs);
            }
        }
    }

    /// Offers a stage 2 fault on `gpa` to the async PF machinery. Returns
    /// true when the guest was told the page is not present and may resume,
    /// false when the caller has to resolve the fault synchronously.
    pub fn handle_page_fault(&mut self, esr: u64, gpa: u64) -> bool {
        let apf = match &self.apf {
            Some(apf) => apf,
            None => return false,
        };

        let gfn = gpa >> PAGE_SHIFT;
        if apf.is_gfn_pending(gfn) || !apf.not_present_allowed(self.regs.pstate) {
            return false;
        }
        apf.setup_async_pf(esr, gpa, gfn)
    }

    /// Per vCPU SDEI admin commands.
    pub fn sdei_ioctl(&self, cmd: &mut KvmSdeiCmd) -> Result<()> {
        match (&self.sdei_kvm, &self.sdei) {
            (Some(kvm), Some(sdei)) => sdei.vcpu_ioctl(kvm, cmd).map_err(Error::Sdei),
            _ => Err(Error::SdeiUnavailable),
        }
    }

    /// Per vCPU async PF admin commands.
    pub fn apf_ioctl(&self, cmd: &mut KvmArmAsyncPfCmd) -> Result<()> {
        self.apf
            .as_ref()
            .ok_or(Error::AsyncPfUnavailable)?
            .vcpu_ioctl(cmd)
            .map_err(Error::AsyncPf)
    }
}

impl Drop for Vcpu {
    fn drop(&mut self) {
        if let Some(apf) = &self.apf {
            apf.clear_completion_queue();
        }
        if let (Some(kvm), Some(sdei)) = (&self.sdei_kvm, &self.sdei) {
            sdei.destroy(kvm);
        }
    }
}
