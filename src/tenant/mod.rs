//! Tenant Module
//!
//! Which isolated backend a principal's data lives in:
//!
//! - `descriptor.rs`: profile records, connection descriptors, tenant ids
//! - `resolver.rs`: control-plane lookup and live watch

pub mod descriptor;
pub mod resolver;

pub use descriptor::{
    AssetStoreDescriptor, ConnectionDescriptor, ProfileRecord, RawDescriptor, Resolution,
    TenantConfig, TenantId,
};
pub use resolver::{DescriptorWatch, TenantConfigResolver};
