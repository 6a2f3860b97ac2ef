//! Error taxonomy for pool and address allocation.
//!
//! Errors fall into a handful of classes that decide how the allocator reacts:
//! client errors and capacity errors are surfaced immediately, maskable and
//! retry errors are consumed by the request loops, internal errors are logged
//! and surfaced.

use crate::store::StoreError;

/// Errors returned by the allocator and its address spaces
#[derive(Debug, thiserror::Error)]
pub enum IpamError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("not implemented: {0}")]
    NotImplemented(String),

    /// The chosen pool was invalidated by a concurrent actor; pick another one.
    #[error("{0}")]
    Maskable(String),

    /// The store rejected a write because the version token was stale.
    #[error("{0}")]
    Retry(String),

    #[error("invalid address space")]
    InvalidAddressSpace,

    #[error("invalid address pool")]
    InvalidPool,

    #[error("invalid address subpool")]
    InvalidSubPool,

    #[error("requested pool overlaps with an existing pool on this address space")]
    PoolOverlap,

    #[error("could not find an available, non-overlapping IPv{0} address pool among the defaults to assign to the network")]
    NoAvailablePool(u8),

    #[error("no available addresses on this pool")]
    NoAvailableIps,

    #[error("requested address is already allocated")]
    IpAlreadyAllocated,

    #[error("requested address is out of range")]
    IpOutOfRange,

    #[error("internal error: {0}")]
    Internal(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl IpamError {
    /// Store version conflict; refresh and retry the same request.
    pub fn is_retryable(&self) -> bool {
        matches!(self, IpamError::Retry(_))
    }

    /// Pool choice invalidated; re-select and retry from the top.
    pub fn is_maskable(&self) -> bool {
        matches!(self, IpamError::Maskable(_))
    }

    /// Errors caused by the caller's input, never retried.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            IpamError::BadRequest(_)
                | IpamError::InvalidAddressSpace
                | IpamError::InvalidPool
                | IpamError::InvalidSubPool
                | IpamError::PoolOverlap
                | IpamError::IpOutOfRange
                | IpamError::Forbidden(_)
                | IpamError::NotImplemented(_)
        )
    }

    /// Capacity exhaustion the user can act on.
    pub fn is_capacity_error(&self) -> bool {
        matches!(self, IpamError::NoAvailableIps | IpamError::NoAvailablePool(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(IpamError::Retry("stale".into()).is_retryable());
        assert!(!IpamError::Retry("stale".into()).is_maskable());
        assert!(IpamError::Maskable("taken".into()).is_maskable());
        assert!(IpamError::InvalidSubPool.is_client_error());
        assert!(IpamError::NoAvailablePool(4).is_capacity_error());
        assert!(!IpamError::Internal("boom".into()).is_client_error());
    }

    #[test]
    fn test_messages() {
        assert_eq!(
            IpamError::NoAvailablePool(6).to_string(),
            "could not find an available, non-overlapping IPv6 address pool among the defaults to assign to the network"
        );
        let err: IpamError = StoreError::KeyModified.into();
        assert!(matches!(err, IpamError::Store(StoreError::KeyModified)));
    }
}
