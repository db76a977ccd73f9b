// Copyright 2019 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

pub const PSR_MODE_EL0T: u64 = 0x0000_0000;
pub const PSR_MODE_EL1T: u64 = 0x0000_0004;
pub const PSR_MODE_EL1H: u64 = 0x0000_0005;
pub const PSR_MODE_MASK: u64 = 0x0000_000f;
pub const PSR_MODE32_BIT: u64 = 0x0000_0010;
pub const PSR_F_BIT: u64 = 0x0000_0040;
pub const PSR_I_BIT: u64 = 0x0000_0080;
pub const PSR_A_BIT: u64 = 0x0000_0100;
pub const PSR_D_BIT: u64 = 0x0000_0200;

/// User mode of an AArch32 guest.
pub const PSR_AA32_MODE_USR: u64 = 0x0000_0010;
pub const PSR_AA32_MODE_MASK: u64 = 0x0000_001f;

/// DAIF bits set when the vCPU is diverted into an exception handler.
pub const PSTATE_DAIF_BITS: u64 = PSR_D_BIT | PSR_A_BIT | PSR_I_BIT | PSR_F_BIT;

/// Number of general purpose registers, x0 to x30.
pub const NR_GP_REGS: usize = 31;

/// Core register file of a vCPU as seen by the hypervisor.
///
/// Reads of register 31 return zero and writes to it are discarded, which is
/// how the zero register behaves for the trapped instructions we emulate.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VcpuRegs {
    pub regs: [u64; NR_GP_REGS],
    pub sp: u64,
    pub pc: u64,
    pub pstate: u64,
    pub spsr_el1: u64,
}

impl VcpuRegs {
    pub fn reg(&self, idx: usize) -> u64 {
        self.regs.get(idx).copied().unwrap_or(0)
    }

    pub fn set_reg(&mut self, idx: usize, val: u64) {
        if let Some(reg) = self.regs.get_mut(idx) {
            *reg = val;
        }
    }
}

/// Whether `pstate` is above EL0 (or outside USR mode for AArch32).
pub fn pstate_is_priv(pstate: u64) -> bool {
    if pstate & PSR_MODE32_BIT != 0 {
        (pstate & PSR_AA32_MODE_MASK) != PSR_AA32_MODE_USR
    } else {
        (pstate & PSR_MODE_MASK) != PSR_MODE_EL0T
    }
}

/// PSTATE the vCPU gets when it is diverted to an EL1 handler: EL1h,
/// AArch64, with every DAIF bit set.
pub fn handler_pstate(pstate: u64) -> u64 {
    let pstate = pstate & !(PSR_MODE_MASK | PSR_MODE32_BIT);
    pstate | PSTATE_DAIF_BITS | PSR_MODE_EL1H
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_register() {
        let mut regs = VcpuRegs::default();
        regs.set_reg(31, 0xdead);
        assert_eq!(regs.reg(31), 0);
        regs.set_reg(30, 0xbeef);
        assert_eq!(regs.reg(30), 0xbeef);
    }

    #[test]
    fn test_pstate_is_priv() {
        assert!(!pstate_is_priv(PSR_MODE_EL0T));
        assert!(pstate_is_priv(PSR_MODE_EL1H));
        assert!(pstate_is_priv(PSR_MODE_EL1T | PSR_I_BIT));
        assert!(!pstate_is_priv(PSR_MODE32_BIT | PSR_AA32_MODE_USR));
        // AArch32 SVC.
        assert!(pstate_is_priv(PSR_MODE32_BIT | 0x13));
    }

    #[test]
    fn test_handler_pstate() {
        let pstate = handler_pstate(PSR_MODE_EL0T | (1 << 29));
        assert_eq!(pstate & PSR_MODE_MASK, PSR_MODE_EL1H);
        assert_eq!(pstate & PSTATE_DAIF_BITS, PSTATE_DAIF_BITS);
        // Condition flags survive.
        assert_ne!(pstate & (1 << 29), 0);
        assert_eq!(handler_pstate(PSR_MODE32_BIT | 0x13) & PSR_MODE32_BIT, 0);
    }
}
