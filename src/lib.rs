//! # Netpool - IP address management over a shared versioned store
//!
//! This library hands out non-overlapping CIDR pools from named address spaces
//! and, within each pool, individual IP addresses. No two callers ever receive
//! the same pool or the same address, including callers in different processes
//! that share a backing key-value store.
//!
//! ## Overview
//!
//! Two address spaces exist by default: `LocalDefault` for host-scoped
//! networks and `GlobalDefault` for networks shared across hosts. Each keeps a
//! database of pools keyed by a pool identity whose string form is the public
//! pool id. Root pools own a bitmap of their addresses; sub-pools restrict
//! allocation to an ordinal window of their root's bitmap.
//!
//! ## Key Features
//!
//! - **Optimistic concurrency**: updates are computed on a private copy and
//!   installed with compare-and-swap; stale copies are retried from a fresh read
//! - **Predefined catalogs**: pools chosen automatically when none is requested
//! - **Overlap detection**: root pools in one address space never intersect
//! - **Self-repair**: bitmaps are recreated from the store and checked at start-up
//! - **Reference counting**: requesting an existing explicit pool reuses it
//!
//! ## Architecture
//!
//! - `ip`: CIDR arithmetic, pool identities and records, predefined catalogs
//! - `store`: versioned key-value store trait with memory and file backends
//! - `bitseq`: persisted run-length bitmap of allocated ordinals
//! - `ipam`: address-space databases and the top-level allocator
//! - `config`: YAML configuration and allocator construction
//! - `error`: the error taxonomy shared by all of the above
//!
//! ## Example Usage
//!
//! ```rust
//! use std::collections::HashMap;
//! use netpool::ipam::{Allocator, LOCAL_ADDRESS_SPACE};
//!
//! let allocator = Allocator::new(None, None)?;
//! let pool = allocator.request_pool(LOCAL_ADDRESS_SPACE, "", "", &HashMap::new(), false)?;
//! assert_eq!(pool.pool.to_string(), "172.17.0.0/16");
//!
//! let (addr, _) = allocator.request_address(&pool.pool_id, None, &HashMap::new())?;
//! assert_eq!(addr.to_string(), "172.17.0.1/16");
//!
//! allocator.release_address(&pool.pool_id, addr.ip)?;
//! allocator.release_pool(&pool.pool_id)?;
//! # Ok::<(), netpool::error::IpamError>(())
//! ```
//!
//! ## Error Handling
//!
//! Library operations return [`error::IpamError`]; conflict errors are consumed
//! by the retry loops and never reach the caller on eventual success. The binary
//! and configuration loader use `color_eyre` for reporting with context.

pub mod bitseq;
pub mod config;
pub mod error;
pub mod ip;
pub mod ipam;
pub mod store;

pub use error::IpamError;
pub use ipam::Allocator;
