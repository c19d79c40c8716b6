//! Clients for the services the gateway depends on but does not own

pub mod device_registry;
pub mod media_allocator;

#[cfg(test)]
pub use device_registry::MockDeviceRegistry;
pub use device_registry::{DeviceCredential, DeviceRegistry, HttpDeviceRegistry, StaticDeviceRegistry};
#[cfg(test)]
pub use media_allocator::MockMediaAllocator;
pub use media_allocator::{MediaAllocator, SrsMediaAllocator};
