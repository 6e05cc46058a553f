//! Kernel Fingerprint: a content hash over entry function identity,
//! monomorphised type arguments, target device class, and the subset of
//! `ContextProperties` that influences lowering.

use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};

use crate::config::ContextProperties;
use crate::device::DeviceClass;

/// Opaque, content-addressed identity of a compiled kernel: a 32-byte
/// content hash that only needs to be deterministic within a process, not
/// cryptographically strong. `DefaultHasher` (SipHash) gives us a 64-bit
/// digest; we fold it twice with different seeds to fill out the 32 bytes
/// without pulling in a dedicated hashing crate.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint(pub [u8; 32]);

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint(")?;
        for byte in &self.0[..8] {
            write!(f, "{:02x}", byte)?;
        }
        write!(f, "..)")
    }
}

/// Inputs that together determine a kernel's fingerprint. `entry_name` and
/// `type_args` identify *which* kernel and its monomorphisation; `device_class`
/// and `props` identify *how* it would be lowered.
pub struct FingerprintInputs<'a> {
    pub entry_name: &'a str,
    pub type_args: &'a [&'a str],
    pub device_class: DeviceClass,
    pub props: &'a ContextProperties,
}

pub fn compute(inputs: &FingerprintInputs<'_>) -> Fingerprint {
    let mut h1 = DefaultHasher::new();
    0xA5A5_5A5A_u64.hash(&mut h1);
    hash_inputs(inputs, &mut h1);

    let mut h2 = DefaultHasher::new();
    0xC3C3_3C3C_u64.hash(&mut h2);
    hash_inputs(inputs, &mut h2);

    let d1 = h1.finish();
    let d2 = h2.finish();
    let mut out = [0u8; 32];
    out[0..8].copy_from_slice(&d1.to_le_bytes());
    out[8..16].copy_from_slice(&d2.to_le_bytes());
    out[16..24].copy_from_slice(&d1.to_be_bytes());
    out[24..32].copy_from_slice(&d2.to_be_bytes());
    Fingerprint(out)
}

fn hash_inputs(inputs: &FingerprintInputs<'_>, hasher: &mut DefaultHasher) {
    inputs.entry_name.hash(hasher);
    inputs.type_args.len().hash(hasher);
    for arg in inputs.type_args {
        arg.hash(hasher);
    }
    inputs.device_class.hash(hasher);
    inputs.props.fingerprint_bits().hash(hasher);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props() -> ContextProperties {
        ContextProperties::new()
    }

    #[test]
    fn identical_inputs_fingerprint_identically() {
        let props = props();
        let a = compute(&FingerprintInputs {
            entry_name: "scan_inclusive",
            type_args: &["i32"],
            device_class: DeviceClass::Cpu,
            props: &props,
        });
        let b = compute(&FingerprintInputs {
            entry_name: "scan_inclusive",
            type_args: &["i32"],
            device_class: DeviceClass::Cpu,
            props: &props,
        });
        assert_eq!(a, b);
    }

    #[test]
    fn differing_type_args_fingerprint_differently() {
        let props = props();
        let a = compute(&FingerprintInputs {
            entry_name: "scan_inclusive",
            type_args: &["i32"],
            device_class: DeviceClass::Cpu,
            props: &props,
        });
        let b = compute(&FingerprintInputs {
            entry_name: "scan_inclusive",
            type_args: &["f32"],
            device_class: DeviceClass::Cpu,
            props: &props,
        });
        assert_ne!(a, b);
    }

    #[test]
    fn differing_device_class_fingerprints_differently() {
        let props = props();
        let a = compute(&FingerprintInputs {
            entry_name: "scan_inclusive",
            type_args: &["i32"],
            device_class: DeviceClass::Cpu,
            props: &props,
        });
        let b = compute(&FingerprintInputs {
            entry_name: "scan_inclusive",
            type_args: &["i32"],
            device_class: DeviceClass::Ptx,
            props: &props,
        });
        assert_ne!(a, b);
    }
}
