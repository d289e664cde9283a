pub mod kdf;

pub use kdf::{derive_transport_keys, identity_key, k1, k2, k3, s1, DerivedKeyMaterial};
