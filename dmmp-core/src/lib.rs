// vim: tw=80
//! Multipath block I/O routing and asynchronous bulk copying
//!
//! The two halves are independent.  [`mpath::Multipath`] routes requests for
//! one logical device over several physical paths, failing over between paths
//! and priority groups.  [`kcopyd::Kcopyd`] copies or zeroes sector ranges
//! between devices in the background, using a bounded pool of buffers.

// I don't find this lint very helpful
#![allow(clippy::type_complexity)]

pub mod hw_handler;
pub mod io;
pub mod kcopyd;
pub mod memdev;
pub mod mpath;
pub mod page_pool;
pub mod path_selector;
pub mod registry;
pub mod table;
pub mod types;
pub mod util;
pub mod workqueue;

pub use crate::types::*;
pub use crate::util::*;
