// Copyright 2019 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

pub const EC_IABT_LOW: u64 = 0x20;
pub const EC_DATAABORT: u64 = 0x24;

const ESR_EC_SHIFT: u64 = 26;
const ESR_EC_MASK: u64 = 0x3f;
const ESR_DABT_WNR: u64 = 1 << 6;
const ESR_DABT_S1PTW: u64 = 1 << 7;

pub fn exception_class(esr: u64) -> u64 {
    (esr >> ESR_EC_SHIFT) & ESR_EC_MASK
}

/// Whether a stage 2 abort needs write access to be resolved. Stage 1 page
/// table walks always write (access flag updates), instruction aborts never
/// do.
pub fn is_write_fault(esr: u64) -> bool {
    if esr & ESR_DABT_S1PTW != 0 {
        return true;
    }

    if exception_class(esr) == EC_IABT_LOW {
        return false;
    }

    esr & ESR_DABT_WNR != 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_fault() {
        let dabt = EC_DATAABORT << ESR_EC_SHIFT;
        assert!(!is_write_fault(dabt));
        assert!(is_write_fault(dabt | ESR_DABT_WNR));
        assert!(is_write_fault(dabt | ESR_DABT_S1PTW));

        let iabt = EC_IABT_LOW << ESR_EC_SHIFT;
        assert!(!is_write_fault(iabt | ESR_DABT_WNR));
        assert!(is_write_fault(iabt | ESR_DABT_S1PTW));
        assert_eq!(exception_class(iabt), EC_IABT_LOW);
    }
}
