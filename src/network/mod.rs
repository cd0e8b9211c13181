//! Host-side network fabric: the bridge device and per-VM tap devices.

mod tap;

pub use tap::{NetworkFabric, TapError};
