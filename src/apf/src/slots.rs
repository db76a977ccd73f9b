// Copyright 2021 Red Hat, Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::uapi::ASYNC_PF_PER_VCPU;

const GOLDEN_RATIO_32: u32 = 0x61C8_8647;
const HASH_BITS: u32 = ASYNC_PF_PER_VCPU.trailing_zeros();
const EMPTY: u64 = !0;

fn hash(gfn: u64) -> usize {
    ((gfn as u32).wrapping_mul(GOLDEN_RATIO_32) >> (32 - HASH_BITS)) as usize
}

fn next_probe(key: usize) -> usize {
    (key + 1) & (ASYNC_PF_PER_VCPU - 1)
}

/// Guest frame numbers with a not-present notification outstanding.
///
/// Open addressing with linear probing; removal shifts the following run back
/// so lookups never need tombstones.
#[derive(Debug)]
pub struct GfnSlots {
    gfns: [u64; ASYNC_PF_PER_VCPU],
}

impl Default for GfnSlots {
    fn default() -> Self {
        GfnSlots {
            gfns: [EMPTY; ASYNC_PF_PER_VCPU],
        }
    }
}

impl GfnSlots {
    pub fn reset(&mut self) {
        self.gfns = [EMPTY; ASYNC_PF_PER_VCPU];
    }

    /// Returns false when every slot is taken.
    pub fn add(&mut self, gfn: u64) -> bool {
        let mut key = hash(gfn);
        for _ in 0..ASYNC_PF_PER_VCPU {
            if self.gfns[key] == EMPTY {
                self.gfns[key] = gfn;
                return true;
            }
            key = next_probe(key);
        }
        false
    }

    fn slot(&self, gfn: u64) -> usize {
        let mut key = hash(gfn);
        for _ in 0..ASYNC_PF_PER_VCPU {
            if self.gfns[key] == gfn || self.gfns[key] == EMPTY {
                break;
            }
            key = next_probe(key);
        }
        key
    }

    pub fn find(&self, gfn: u64) -> bool {
        self.gfns[self.slot(gfn)] == gfn
    }

    pub fn remove(&mut self, gfn: u64) {
        let mut i = self.slot(gfn);
        if self.gfns[i] != gfn {
            return;
        }

        let mut j = i;
        loop {
            self.gfns[i] = EMPTY;
            loop {
                j = next_probe(j);
                if self.gfns[j] == EMPTY {
                    return;
                }
                let k = hash(self.gfns[j]);
                // Entry j may only move to i if its home slot does not lie
                // cyclically in (i, j].
                let stays = if i <= j {
                    i < k && k <= j
                } else {
                    i < k || k <= j
                };
                if !stays {
                    break;
                }
            }
            self.gfns[i] = self.gfns[j];
            i = j;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Collects gfns sharing the home slot of `seed`.
    fn colliding(seed: u64, count: usize) -> Vec<u64> {
        let home = hash(seed);
        (seed..)
            .filter(|gfn| hash(*gfn) == home)
            .take(count)
            .collect()
    }

    #[test]
    fn test_add_find_remove() {
        let mut slots = GfnSlots::default();
        assert!(!slots.find(0x10));
        assert!(slots.add(0x10));
        assert!(slots.add(0x11));
        assert!(slots.find(0x10));
        assert!(slots.find(0x11));

        slots.remove(0x10);
        assert!(!slots.find(0x10));
        assert!(slots.find(0x11));

        // Removing an absent gfn is a no-op.
        slots.remove(0x10);
        assert!(slots.find(0x11));
    }

    #[test]
    fn test_remove_shifts_collisions_back() {
        let mut slots = GfnSlots::default();
        let gfns = colliding(0x1000, 3);
        for gfn in &gfns {
            assert!(slots.add(*gfn));
        }

        slots.remove(gfns[0]);
        assert!(!slots.find(gfns[0]));
        assert!(slots.find(gfns[1]));
        assert!(slots.find(gfns[2]));

        slots.remove(gfns[1]);
        assert!(slots.find(gfns[2]));
    }

    #[test]
    fn test_full_table() {
        let mut slots = GfnSlots::default();
        for gfn in 0..ASYNC_PF_PER_VCPU as u64 {
            assert!(slots.add(gfn));
        }
        assert!(!slots.add(0x4242));
        for gfn in 0..ASYNC_PF_PER_VCPU as u64 {
            assert!(slots.find(gfn));
        }

        slots.reset();
        assert!(!slots.find(0));
        assert!(slots.add(0x4242));
    }
}
