//! Mesh key derivation functions.
//!
//! `s1`, `k1`, `k2` and `k3` as defined by the Bluetooth mesh profile. All three are
//! built on AES-CMAC with a 128-bit key, so a peer deriving from the same
//! network key gets bit-identical results.

use aes::cipher::generic_array::GenericArray;
use aes::Aes128;
use cmac::{Cmac, Mac};
use zeroize::Zeroizing;

use crate::constants::keys::{KEY_LENGTH, NID_MASK};
use crate::types::Key128;

const ZERO_KEY: [u8; KEY_LENGTH] = [0u8; KEY_LENGTH];

/// Transport material derived from one network key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DerivedKeyMaterial {
    /// 7-bit network identifier carried in every network PDU
    pub nid: u8,
    pub encryption_key: Key128,
    pub privacy_key: Key128,
}

fn aes_cmac(key: &[u8; KEY_LENGTH], parts: &[&[u8]]) -> [u8; KEY_LENGTH] {
    let mut mac = <Cmac<Aes128> as Mac>::new(GenericArray::from_slice(key));
    for part in parts {
        mac.update(part);
    }
    mac.finalize().into_bytes().into()
}

/// s1(M) = AES-CMAC with an all-zero key.
pub fn s1(m: &[u8]) -> [u8; KEY_LENGTH] {
    aes_cmac(&ZERO_KEY, &[m])
}

/// k1(N, SALT, P) = CMAC_T(P) with T = CMAC_SALT(N).
pub fn k1(n: &[u8], salt: &[u8; KEY_LENGTH], p: &[u8]) -> Key128 {
    let t = Zeroizing::new(aes_cmac(salt, &[n]));
    Key128::from_bytes(aes_cmac(&t, &[p]))
}

/// Node identity key advertised by proxy nodes: k1(N, s1("nkik"), "id128" || 0x01).
pub fn identity_key(network_key: &Key128) -> Key128 {
    k1(&network_key.as_bytes()[..], &s1(b"nkik"), b"id128\x01")
}

/// k2(N, P): NID, encryption key and privacy key.
pub fn k2(n: &Key128, p: &[u8]) -> DerivedKeyMaterial {
    let salt = s1(b"smk2");
    let t = Zeroizing::new(aes_cmac(&salt, &[&n.as_bytes()[..]]));

    // T1 = CMAC_T(T0 || P || 0x01) with T0 empty, then each block chains the previous one.
    let t1 = Zeroizing::new(aes_cmac(&t, &[p, &[0x01u8][..]]));
    let t2 = aes_cmac(&t, &[&t1[..], p, &[0x02u8][..]]);
    let t3 = aes_cmac(&t, &[&t2[..], p, &[0x03u8][..]]);

    DerivedKeyMaterial {
        nid: t1[KEY_LENGTH - 1] & NID_MASK,
        encryption_key: Key128::from_bytes(t2),
        privacy_key: Key128::from_bytes(t3),
    }
}

/// k3(N): the 64-bit network ID advertised in secure network beacons.
pub fn k3(n: &Key128) -> [u8; 8] {
    let salt = s1(b"smk3");
    let t = Zeroizing::new(aes_cmac(&salt, &[&n.as_bytes()[..]]));
    let out = aes_cmac(&t, &[&b"id64"[..], &[0x01u8][..]]);

    let mut id = [0u8; 8];
    id.copy_from_slice(&out[KEY_LENGTH - 8..]);
    id
}

/// Derives transport keys for `network_key` with the fixed `p` input.
pub fn derive_transport_keys(network_key: &Key128, p: &[u8]) -> DerivedKeyMaterial {
    k2(network_key, p)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::keys::K2_MASTER_INPUT;

    // Mesh profile sample data.
    const SAMPLE_NET_KEY: &str = "7dd7364cd842ad18c17c2b820c84c3d6";

    #[test]
    fn test_s1_sample() {
        assert_eq!(hex::encode(s1(b"test")), "b73cefbd641ef2ea598c2b6efb62f79c");
    }

    #[test]
    fn test_k2_master_sample() {
        let net_key = Key128::from_hex(SAMPLE_NET_KEY).unwrap();
        let material = k2(&net_key, &K2_MASTER_INPUT);

        assert_eq!(material.nid, 0x68);
        assert_eq!(
            material.encryption_key.to_hex(),
            "0953fa93e7caac9638f58820220a398e"
        );
        assert_eq!(
            material.privacy_key.to_hex(),
            "8b84eedec100067d670971dd2aa700cf"
        );
    }

    #[test]
    fn test_k1_sample() {
        let n = hex::decode("3216d1509884b533248541792b877f98").unwrap();
        let salt: [u8; KEY_LENGTH] = hex::decode("2ba14ffa0df84a2831938d57d276cab4")
            .unwrap()
            .try_into()
            .unwrap();
        let p = hex::decode("5a09d60797eeb4478aada59db3352a0d").unwrap();
        assert_eq!(k1(&n, &salt, &p).to_hex(), "f6ed15a8934afbe7d83e8dcb57fcf5d7");
    }

    #[test]
    fn test_identity_key_sample() {
        let net_key = Key128::from_hex(SAMPLE_NET_KEY).unwrap();
        assert_eq!(
            identity_key(&net_key).to_hex(),
            "84396c435ac48560b5965385253e210c"
        );
    }

    #[test]
    fn test_k3_sample() {
        let net_key = Key128::from_hex(SAMPLE_NET_KEY).unwrap();
        assert_eq!(hex::encode(k3(&net_key)), "3ecaff672f673370");
    }

    #[test]
    fn test_derivation_is_deterministic() {
        let net_key = Key128::from_bytes([0x42; 16]);
        let first = derive_transport_keys(&net_key, &K2_MASTER_INPUT);
        let second = derive_transport_keys(&net_key, &K2_MASTER_INPUT);
        assert_eq!(first, second);
        assert!(first.nid <= 0x7F);

        let other = derive_transport_keys(&Key128::from_bytes([0x43; 16]), &K2_MASTER_INPUT);
        assert_ne!(first, other);
    }
}
