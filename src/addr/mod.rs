//! Private address coordination
//!
//! Allocates non-conflicting IPv4 /24 prefixes to downstreams and tracks
//! upstream prefixes so conflicts can be detected and reported.

pub mod coordinator;

pub use coordinator::{
    PrivateAddressCoordinator, BLUETOOTH_IFACE_ADDRESS, PREFIX_LENGTH, WIFI_P2P_IFACE_ADDRESS,
};
