//! Storage engine internals
//!
//! On-disk regions (`layout`, `backstore`, `header`, `keycount`, `journal`,
//! `metadata`), integrity (`merkle`, `counter`), key material (`secret`,
//! `keys`, `cipher`) and the runtime that ties them together (`swap`,
//! `device`, `dispatch`).

pub mod backstore;
pub mod bitmask;
pub mod cipher;
pub mod counter;
pub mod device;
pub mod dispatch;
pub mod error;
pub mod header;
pub mod journal;
pub mod keycount;
pub mod keys;
pub mod layout;
pub mod merkle;
pub mod metadata;
pub mod secret;
pub mod swap;

pub use device::{Capabilities, Device, DeviceStats};
