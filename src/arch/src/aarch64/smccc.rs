// Copyright 2019 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use super::regs::VcpuRegs;

pub const ARM_SMCCC_FAST_CALL: u32 = 1;
pub const ARM_SMCCC_TYPE_SHIFT: u32 = 31;

pub const ARM_SMCCC_SMC_64: u32 = 1;
pub const ARM_SMCCC_CALL_CONV_SHIFT: u32 = 30;

pub const ARM_SMCCC_OWNER_MASK: u32 = 0x3f;
pub const ARM_SMCCC_OWNER_SHIFT: u32 = 24;
pub const ARM_SMCCC_FUNC_MASK: u32 = 0xffff;

pub const ARM_SMCCC_OWNER_ARCH: u32 = 0;
pub const ARM_SMCCC_OWNER_STANDARD: u32 = 4;
pub const ARM_SMCCC_OWNER_VENDOR_HYP: u32 = 6;

pub const SMCCC_RET_SUCCESS: i64 = 0;
pub const SMCCC_RET_NOT_SUPPORTED: i64 = -1;
pub const SMCCC_RET_NOT_REQUIRED: i64 = -2;
pub const SMCCC_RET_INVALID_PARAMETER: i64 = -3;

/// Builds an SMCCC function identifier.
pub const fn call_val(call_type: u32, calling_convention: u32, owner: u32, func: u32) -> u32 {
    (call_type << ARM_SMCCC_TYPE_SHIFT)
        | (calling_convention << ARM_SMCCC_CALL_CONV_SHIFT)
        | ((owner & ARM_SMCCC_OWNER_MASK) << ARM_SMCCC_OWNER_SHIFT)
        | (func & ARM_SMCCC_FUNC_MASK)
}

/// Vendor specific hypervisor service used for asynchronous page faults.
pub const ARM_SMCCC_VENDOR_HYP_KVM_ASYNC_PF_FUNC_ID: u32 = 2;
pub const ARM_SMCCC_VENDOR_HYP_KVM_ASYNC_PF_FUNC: u32 = call_val(
    ARM_SMCCC_FAST_CALL,
    ARM_SMCCC_SMC_64,
    ARM_SMCCC_OWNER_VENDOR_HYP,
    ARM_SMCCC_VENDOR_HYP_KVM_ASYNC_PF_FUNC_ID,
);

impl VcpuRegs {
    /// Function identifier of a trapped HVC/SMC, held in w0.
    pub fn smccc_function(&self) -> u32 {
        self.reg(0) as u32
    }

    /// Argument `n` of a trapped call. Arguments live in x1 to x17.
    pub fn smccc_arg(&self, n: usize) -> u64 {
        self.reg(n)
    }

    pub fn smccc_set_retval(&mut self, a0: u64, a1: u64, a2: u64, a3: u64) {
        self.set_reg(0, a0);
        self.set_reg(1, a1);
        self.set_reg(2, a2);
        self.set_reg(3, a3);
    }
}
