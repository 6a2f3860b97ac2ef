//! IP address primitives: CIDR arithmetic, pool identities and records,
//! and the predefined pool catalogs.

pub mod cidr;
pub mod predefined;
pub mod types;

// Re-export commonly used types
pub use cidr::{AssignedAddress, Cidr, CidrError};
pub use types::{AddressRange, PoolData, SubnetKey};
