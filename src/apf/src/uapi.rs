// Copyright 2021 Red Hat, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::mem::{offset_of, size_of};

use bitflags::bitflags;

/// Outstanding asynchronous faults per vCPU.
pub const ASYNC_PF_PER_VCPU: usize = 64;

/// v1.0.0
pub const KVM_ASYNC_PF_VERSION: u32 = 0x010000;

pub const ARM_SMCCC_KVM_FUNC_ASYNC_PF_VERSION: u64 = 0;
pub const ARM_SMCCC_KVM_FUNC_ASYNC_PF_SLOTS: u64 = 1;
pub const ARM_SMCCC_KVM_FUNC_ASYNC_PF_SDEI: u64 = 2;
pub const ARM_SMCCC_KVM_FUNC_ASYNC_PF_IRQ: u64 = 3;
pub const ARM_SMCCC_KVM_FUNC_ASYNC_PF_ENABLE: u64 = 4;
pub const ARM_SMCCC_KVM_FUNC_ASYNC_PF_IRQ_ACK: u64 = 5;

bitflags! {
    /// Low bits of the control word passed to ASYNC_PF_ENABLE. The rest is
    /// the guest physical address of a 64 byte aligned `KvmVcpuPvApfData`.
    pub struct AsyncPfControlFlags: u64 {
        const ENABLED = 1 << 0;
        const SEND_ALWAYS = 1 << 1;
    }
}

pub const KVM_ASYNC_PF_ADDR_MASK: u64 = !0x3f;

pub const KVM_PV_REASON_PAGE_NOT_PRESENT: u32 = 1;
pub const KVM_PV_REASON_PAGE_READY: u32 = 2;

/// Notification block shared with the guest.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct KvmVcpuPvApfData {
    pub reason: u32,
    pub token: u32,
    pub pad: [u8; 56],
}

impl Default for KvmVcpuPvApfData {
    fn default() -> Self {
        KvmVcpuPvApfData {
            reason: 0,
            token: 0,
            pad: [0; 56],
        }
    }
}

pub const PV_APF_REASON_OFFSET: usize = offset_of!(KvmVcpuPvApfData, reason);
pub const PV_APF_TOKEN_OFFSET: usize = offset_of!(KvmVcpuPvApfData, token);
/// Only reason and token are accessed by the host.
pub const PV_APF_CACHE_LEN: usize = PV_APF_TOKEN_OFFSET + size_of::<u32>();

pub const KVM_ARM_ASYNC_PF_CMD_GET_VERSION: u32 = 0;
pub const KVM_ARM_ASYNC_PF_CMD_GET_SDEI: u32 = 1;
pub const KVM_ARM_ASYNC_PF_CMD_GET_IRQ: u32 = 2;
pub const KVM_ARM_ASYNC_PF_CMD_GET_CONTROL: u32 = 3;
pub const KVM_ARM_ASYNC_PF_CMD_SET_SDEI: u32 = 4;
pub const KVM_ARM_ASYNC_PF_CMD_SET_IRQ: u32 = 5;
pub const KVM_ARM_ASYNC_PF_CMD_SET_CONTROL: u32 = 6;

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct KvmArmAsyncPfCmd {
    pub cmd: u32,
    pub version: u32,
    pub sdei: u64,
    pub irq: u32,
    pub control: u64,
}

impl KvmArmAsyncPfCmd {
    pub fn new(cmd: u32) -> Self {
        KvmArmAsyncPfCmd {
            cmd,
            ..Default::default()
        }
    }
}
