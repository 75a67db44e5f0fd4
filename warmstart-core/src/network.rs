// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Per-VM network resources.
//!
//! The [`ResourcePool`] trait is the boundary to whatever provisions tap
//! devices, addresses and MACs. [`AddressPool`] is the in-process
//! implementation: it carves the configured IPv4 range into /30 blocks (one
//! per VM, gateway on `.1`, guest on `.2`) and keeps the per-VM bookkeeping.
//! Creating the host-side devices themselves is left to the host's network
//! provisioning.

use std::collections::BTreeSet;
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;
use std::sync::Mutex;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::error::{HardValidationError, ResourcePoolError};
use crate::types::VmId;

/// Prefix length of each per-VM block.
pub const VM_SUBNET_PREFIX: u8 = 30;
const ADDRESSES_PER_VM: u32 = 4;

/// IPv4 range in CIDR notation, base address masked to the prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Cidr {
    base: Ipv4Addr,
    prefix: u8,
}

impl Ipv4Cidr {
    pub fn new(addr: Ipv4Addr, prefix: u8) -> Result<Self, HardValidationError> {
        if !(8..=28).contains(&prefix) {
            return Err(HardValidationError::InvalidFieldValue {
                field: "network.cidr",
                value: format!("{}/{}", addr, prefix),
                reason: "Prefix length must be between 8 and 28".to_string(),
            });
        }
        let mask = u32::MAX << (32 - prefix);
        Ok(Self {
            base: Ipv4Addr::from(u32::from(addr) & mask),
            prefix,
        })
    }

    pub fn base(&self) -> Ipv4Addr {
        self.base
    }

    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    /// Number of /30 blocks the range holds.
    pub fn slots(&self) -> usize {
        ((1u64 << (32 - self.prefix)) / ADDRESSES_PER_VM as u64) as usize
    }

    fn nth(&self, offset: u32) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.base) + offset)
    }
}

impl Default for Ipv4Cidr {
    fn default() -> Self {
        Self {
            base: Ipv4Addr::new(172, 16, 0, 0),
            prefix: 16,
        }
    }
}

impl fmt::Display for Ipv4Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.base, self.prefix)
    }
}

impl FromStr for Ipv4Cidr {
    type Err = HardValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| HardValidationError::InvalidFieldValue {
            field: "network.cidr",
            value: s.to_string(),
            reason: reason.to_string(),
        };

        let (addr, prefix) = s
            .split_once('/')
            .ok_or_else(|| invalid("Expected <address>/<prefix>"))?;
        let addr = addr
            .parse::<Ipv4Addr>()
            .map_err(|_| invalid("Invalid IPv4 address"))?;
        let prefix = prefix
            .parse::<u8>()
            .map_err(|_| invalid("Invalid prefix length"))?;

        Self::new(addr, prefix)
    }
}

/// Network identity assigned to one VM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmNetwork {
    pub mac_address: String,
    pub host_dev_name: String,
    pub primary_address: Ipv4Addr,
    pub gateway_address: Ipv4Addr,
    pub prefix_len: u8,
}

impl VmNetwork {
    /// Primary address with its prefix, as the guest kernel expects it.
    pub fn primary_cidr(&self) -> String {
        format!("{}/{}", self.primary_address, self.prefix_len)
    }
}

/// Allocator of per-VM network resources, keyed by VM ID.
#[async_trait]
pub trait ResourcePool: Send + Sync {
    /// Allocate a network identity for `vm_id`. Allocating twice for the same
    /// ID is an error, never an overwrite.
    async fn allocate(&self, vm_id: VmId, host_iface: &str) -> Result<VmNetwork, ResourcePoolError>;

    async fn free(&self, vm_id: VmId) -> Result<(), ResourcePoolError>;

    /// Recreate the VM's tap device so it can be attached again by a restore.
    async fn recreate_network_device(&self, vm_id: VmId, host_iface: &str) -> Result<(), ResourcePoolError>;

    fn network(&self, vm_id: VmId) -> Option<VmNetwork>;

    /// Tear down everything the pool created on the host.
    async fn remove_bridges(&self);
}

#[derive(Debug)]
struct Allocation {
    slot: usize,
    network: VmNetwork,
    host_iface: String,
    device_generation: u32,
}

#[derive(Debug, Default)]
struct Slots {
    next: usize,
    released: BTreeSet<usize>,
}

/// In-process address pool backed by a CIDR range.
#[derive(Debug)]
pub struct AddressPool {
    cidr: Ipv4Cidr,
    slots: Mutex<Slots>,
    vms: DashMap<VmId, Allocation>,
}

impl AddressPool {
    pub fn new(cidr: Ipv4Cidr) -> Self {
        Self {
            cidr,
            slots: Mutex::new(Slots::default()),
            vms: DashMap::new(),
        }
    }

    pub fn cidr(&self) -> Ipv4Cidr {
        self.cidr
    }

    pub fn allocated_count(&self) -> usize {
        self.vms.len()
    }

    pub fn is_allocated(&self, vm_id: VmId) -> bool {
        self.vms.contains_key(&vm_id)
    }

    /// How many times the VM's device has been recreated since allocation.
    pub fn device_generation(&self, vm_id: VmId) -> Option<u32> {
        self.vms.get(&vm_id).map(|a| a.device_generation)
    }

    fn take_slot(&self) -> Result<usize, ResourcePoolError> {
        let mut slots = self
            .slots
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        if let Some(slot) = slots.released.pop_first() {
            return Ok(slot);
        }

        // Slot 0 would put the gateway on the network address.
        let capacity = self.cidr.slots();
        let slot = slots.next + 1;
        if slot >= capacity {
            return Err(ResourcePoolError::Exhausted {
                capacity: capacity.saturating_sub(1),
            });
        }
        slots.next = slot;
        Ok(slot)
    }

    fn release_slot(&self, slot: usize) {
        self.slots
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .released
            .insert(slot);
    }

    fn network_for(&self, vm_id: VmId, slot: usize) -> VmNetwork {
        let offset = slot as u32 * ADDRESSES_PER_VM;
        let bytes = (slot as u32).to_be_bytes();
        VmNetwork {
            mac_address: format!(
                "02:FC:{:02X}:{:02X}:{:02X}:{:02X}",
                bytes[0], bytes[1], bytes[2], bytes[3]
            ),
            host_dev_name: format!("fc-{}-tap0", vm_id),
            primary_address: self.cidr.nth(offset + 2),
            gateway_address: self.cidr.nth(offset + 1),
            prefix_len: VM_SUBNET_PREFIX,
        }
    }
}

#[async_trait]
impl ResourcePool for AddressPool {
    async fn allocate(&self, vm_id: VmId, host_iface: &str) -> Result<VmNetwork, ResourcePoolError> {
        match self.vms.entry(vm_id) {
            Entry::Occupied(_) => Err(ResourcePoolError::AlreadyAllocated { vm_id }),
            Entry::Vacant(vacant) => {
                let slot = self.take_slot()?;
                let network = self.network_for(vm_id, slot);

                tracing::debug!(
                    vm_id = %vm_id,
                    address = %network.primary_address,
                    tap = %network.host_dev_name,
                    "Allocated VM network"
                );

                vacant.insert(Allocation {
                    slot,
                    network: network.clone(),
                    host_iface: host_iface.to_string(),
                    device_generation: 0,
                });
                Ok(network)
            }
        }
    }

    async fn free(&self, vm_id: VmId) -> Result<(), ResourcePoolError> {
        let (_, allocation) = self
            .vms
            .remove(&vm_id)
            .ok_or(ResourcePoolError::NotAllocated { vm_id })?;
        self.release_slot(allocation.slot);
        tracing::debug!(vm_id = %vm_id, "Freed VM network");
        Ok(())
    }

    async fn recreate_network_device(&self, vm_id: VmId, host_iface: &str) -> Result<(), ResourcePoolError> {
        let mut allocation = self
            .vms
            .get_mut(&vm_id)
            .ok_or(ResourcePoolError::NotAllocated { vm_id })?;

        if allocation.host_iface != host_iface {
            return Err(ResourcePoolError::Device {
                vm_id,
                reason: format!(
                    "tap was created on '{}', not '{}'",
                    allocation.host_iface, host_iface
                ),
            });
        }

        allocation.device_generation += 1;
        tracing::debug!(
            vm_id = %vm_id,
            tap = %allocation.network.host_dev_name,
            generation = allocation.device_generation,
            "Recreated tap device"
        );
        Ok(())
    }

    fn network(&self, vm_id: VmId) -> Option<VmNetwork> {
        self.vms.get(&vm_id).map(|a| a.network.clone())
    }

    async fn remove_bridges(&self) {
        let count = self.vms.len();
        self.vms.clear();
        *self
            .slots
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Slots::default();
        tracing::info!(released = count, cidr = %self.cidr, "Removed VM network devices");
    }
}
