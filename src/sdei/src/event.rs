// Copyright 2021 Red Hat, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use crate::defs::{SDEI_EVENT_PRIORITY_CRITICAL, SDEI_EVENT_TYPE_PRIVATE};
use crate::uapi::{
    SdeiEventState, SdeiKvmEventState, KVM_SDEI_BITMAP_WORDS, KVM_SDEI_MAX_VCPUS,
};

/// Transition reported to the owner of an event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SdeiNotifyState {
    /// The handler was entered on the vCPU.
    Delivered,
    /// The guest issued EVENT_COMPLETE for it.
    Completed,
}

/// Callback attached to an event definition. Invoked from the vCPU thread
/// with no SDEI lock held.
pub trait SdeiNotifier: Send + Sync {
    fn notify(&self, vcpu_idx: usize, num: u64, state: SdeiNotifyState);
}

impl<F> SdeiNotifier for F
where
    F: Fn(usize, u64, SdeiNotifyState) + Send + Sync,
{
    fn notify(&self, vcpu_idx: usize, num: u64, state: SdeiNotifyState) {
        self(vcpu_idx, num, state)
    }
}

/// A firmware event the guest may bind a handler to.
pub struct SdeiEvent {
    state: SdeiEventState,
    notifier: Mutex<Option<Arc<dyn SdeiNotifier>>>,
}

impl SdeiEvent {
    pub fn new(state: SdeiEventState) -> Self {
        SdeiEvent {
            state,
            notifier: Mutex::new(None),
        }
    }

    pub fn state(&self) -> SdeiEventState {
        self.state
    }

    pub fn num(&self) -> u64 {
        self.state.num
    }

    pub fn is_private(&self) -> bool {
        self.state.type_ == SDEI_EVENT_TYPE_PRIVATE
    }

    pub fn is_critical(&self) -> bool {
        self.state.priority == SDEI_EVENT_PRIORITY_CRITICAL
    }

    pub(crate) fn set_notifier(&self, notifier: Arc<dyn SdeiNotifier>) {
        *self.notifier.lock().unwrap() = Some(notifier);
    }

    pub(crate) fn notifier(&self) -> Option<Arc<dyn SdeiNotifier>> {
        self.notifier.lock().unwrap().clone()
    }
}

fn alloc_slots() -> Option<Box<[AtomicU64]>> {
    let mut slots = Vec::new();
    slots.try_reserve_exact(KVM_SDEI_MAX_VCPUS).ok()?;
    slots.extend((0..KVM_SDEI_MAX_VCPUS).map(|_| AtomicU64::new(0)));
    Some(slots.into_boxed_slice())
}

macro_rules! slot_bitmap_accessors {
    ($field:ident, $test:ident, $set:ident, $clear:ident, $empty:ident) => {
        pub fn $test(&self, index: usize) -> bool {
            self.$field[index / 64].load(Ordering::Acquire) & (1 << (index % 64)) != 0
        }

        pub(crate) fn $set(&self, index: usize) {
            self.$field[index / 64].fetch_or(1 << (index % 64), Ordering::AcqRel);
        }

        pub(crate) fn $clear(&self, index: usize) {
            self.$field[index / 64].fetch_and(!(1 << (index % 64)), Ordering::AcqRel);
        }

        pub fn $empty(&self) -> bool {
            self.$field.iter().all(|w| w.load(Ordering::Acquire) == 0)
        }
    };
}

/// An event with at least one handler bound by the guest.
///
/// Slot `n` holds the handler of vCPU `n` for private events; shared events
/// only use slot 0. The per slot state is only modified with the registry
/// lock held but may be read without it.
pub struct SdeiKvmEvent {
    kse: Arc<SdeiEvent>,
    refcount: AtomicU32,
    route_mode: AtomicU8,
    route_affinity: AtomicU64,
    entries: Box<[AtomicU64]>,
    params: Box<[AtomicU64]>,
    registered: [AtomicU64; KVM_SDEI_BITMAP_WORDS],
    enabled: [AtomicU64; KVM_SDEI_BITMAP_WORDS],
}

impl SdeiKvmEvent {
    pub(crate) fn new(kse: Arc<SdeiEvent>) -> Option<Self> {
        Some(SdeiKvmEvent {
            kse,
            refcount: AtomicU32::new(0),
            route_mode: AtomicU8::new(0),
            route_affinity: AtomicU64::new(0),
            entries: alloc_slots()?,
            params: alloc_slots()?,
            registered: Default::default(),
            enabled: Default::default(),
        })
    }

    pub(crate) fn from_state(kse: Arc<SdeiEvent>, state: &SdeiKvmEventState) -> Option<Self> {
        let kske = Self::new(kse)?;
        kske.set_route(state.route_mode, state.route_affinity);
        kske.refcount.store(state.refcount, Ordering::Release);
        for index in 0..KVM_SDEI_MAX_VCPUS {
            kske.entries[index].store(state.entries[index], Ordering::Relaxed);
            kske.params[index].store(state.params[index], Ordering::Relaxed);
        }
        for word in 0..KVM_SDEI_BITMAP_WORDS {
            kske.registered[word].store(state.registered[word], Ordering::Release);
            kske.enabled[word].store(state.enabled[word], Ordering::Release);
        }
        Some(kske)
    }

    pub fn state(&self) -> SdeiKvmEventState {
        let mut state = SdeiKvmEventState {
            num: self.num(),
            refcount: self.refcount(),
            route_mode: self.route_mode(),
            route_affinity: self.route_affinity(),
            ..Default::default()
        };
        for index in 0..KVM_SDEI_MAX_VCPUS {
            state.entries[index] = self.entry(index);
            state.params[index] = self.param(index);
        }
        for word in 0..KVM_SDEI_BITMAP_WORDS {
            state.registered[word] = self.registered[word].load(Ordering::Acquire);
            state.enabled[word] = self.enabled[word].load(Ordering::Acquire);
        }
        state
    }

    pub fn event(&self) -> &Arc<SdeiEvent> {
        &self.kse
    }

    pub fn num(&self) -> u64 {
        self.kse.num()
    }

    /// Slot used by the vCPU with index `vcpu_idx`.
    pub fn slot(&self, vcpu_idx: usize) -> usize {
        if self.kse.is_private() {
            vcpu_idx
        } else {
            0
        }
    }

    slot_bitmap_accessors!(
        registered,
        is_registered,
        set_registered,
        clear_registered,
        registered_empty
    );
    slot_bitmap_accessors!(enabled, is_enabled, set_enabled, clear_enabled, enabled_empty);

    pub fn entry(&self, index: usize) -> u64 {
        self.entries[index].load(Ordering::Acquire)
    }

    pub fn param(&self, index: usize) -> u64 {
        self.params[index].load(Ordering::Acquire)
    }

    pub(crate) fn set_handler(&self, index: usize, entry: u64, param: u64) {
        self.entries[index].store(entry, Ordering::Release);
        self.params[index].store(param, Ordering::Release);
    }

    pub fn route_mode(&self) -> u8 {
        self.route_mode.load(Ordering::Acquire)
    }

    pub fn route_affinity(&self) -> u64 {
        self.route_affinity.load(Ordering::Acquire)
    }

    pub(crate) fn set_route(&self, mode: u8, affinity: u64) {
        self.route_mode.store(mode, Ordering::Release);
        self.route_affinity.store(affinity, Ordering::Release);
    }

    /// Number of vCPU instances referencing this event, summed over their
    /// own reference counts.
    pub fn refcount(&self) -> u32 {
        self.refcount.load(Ordering::Acquire)
    }

    pub(crate) fn get(&self) {
        self.refcount.fetch_add(1, Ordering::AcqRel);
    }

    /// Drops `count` references and returns how many are left.
    pub(crate) fn put(&self, count: u32) -> u32 {
        let prev = self.refcount.fetch_sub(count, Ordering::AcqRel);
        debug_assert!(prev >= count);
        prev - count
    }

    /// Whether nothing keeps the event alive any more.
    pub(crate) fn is_unused(&self) -> bool {
        self.refcount() == 0 && self.registered_empty()
    }
}
