//! SRP-6a client (spec ref: §4.2 Authenticator, "SRP path").
//!
//! Grounded in `pyicloud_ipd/base.py::_authenticate_srp` and its nested
//! `SrpPassword.encode()`, which layers Apple's own password pre-hash
//! (`s2k`/`s2k_fo`) underneath the textbook RFC 5054 exchange and disables
//! the username term in `x` (`srp.no_username_in_x()`). The group, `k`, `x`,
//! `u`, `S`, `M1`/`M2` derivations below follow the same construction as the
//! reference `srp` library's SHA-256/2048-bit configuration.

use num_bigint::BigUint;
use rand::RngCore;
use sha2::{Digest, Sha256};

/// RFC 5054 2048-bit group modulus (identical to the RFC 3526 group 14
/// prime), matching `srp.NG_2048`.
const N_HEX: &str = concat!(
    "AC6BDB41324A9A9BF166DE5E1389582FAF72B665",
    "1987EE07FC3192943DB56050A37329CBB4A099ED",
    "8193E0757767A13DD52312AB4B03310DCD7F48A9",
    "DA04FD50E8083969EDB767B0CF6095179A163AB3",
    "661A05FBD5FAAAE82918A9962F0B93B855F97993",
    "EC975EEAA80D740ADBF4FF747359D041D5C33EA7",
    "1D281E446B14773BCA97B43A23FB801676BD207A",
    "2364A59220B1285E14E1D3FB7E1D5D6C3A1E6A8E",
    "01E1D8A7937F2C8B4A9FA2A",
);
const G_VAL: u32 = 2;

/// The two password pre-hash protocols Apple's `signin/init` response may
/// select. `s2k` feeds the raw SHA-256 digest into PBKDF2; `s2k_fo` feeds
/// its lowercase hex encoding instead ("fo" = "first obfuscation").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum S2kProtocol {
    S2k,
    S2kFo,
}

impl S2kProtocol {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "s2k" => Some(Self::S2k),
            "s2k_fo" => Some(Self::S2kFo),
            _ => None,
        }
    }
}

/// Apple's password pre-hash: SHA-256 the raw password, then PBKDF2-HMAC-SHA256
/// the resulting digest (or its hex form) with the server-supplied salt and
/// iteration count, to a 32-byte key. This key stands in for `P` in the
/// standard SRP `x = H(s, H(P))` derivation below.
pub fn derive_password_key(protocol: S2kProtocol, password: &str, salt: &[u8], iterations: u32) -> [u8; 32] {
    let password_hash = Sha256::digest(password.as_bytes());
    let digest: Vec<u8> = match protocol {
        S2kProtocol::S2k => password_hash.to_vec(),
        S2kProtocol::S2kFo => hex::encode(password_hash).into_bytes(),
    };
    let mut out = [0u8; 32];
    pbkdf2::pbkdf2_hmac::<Sha256>(&digest, salt, iterations, &mut out);
    out
}

fn sha256(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// Big-endian encoding padded (on the left with zero bytes) to the byte
/// length of the group modulus, as RFC 5054's `PAD()` requires before
/// hashing any group element.
fn pad(value: &BigUint, len: usize) -> Vec<u8> {
    let raw = value.to_bytes_be();
    if raw.len() >= len {
        return raw;
    }
    let mut out = vec![0u8; len - raw.len()];
    out.extend_from_slice(&raw);
    out
}

pub struct SrpGroup {
    pub n: BigUint,
    pub g: BigUint,
    byte_len: usize,
}

impl SrpGroup {
    pub fn rfc5054_2048() -> Self {
        let n = BigUint::parse_bytes(N_HEX.as_bytes(), 16).expect("valid RFC5054 group constant");
        let byte_len = n.to_bytes_be().len();
        Self { n, g: BigUint::from(G_VAL), byte_len }
    }

    fn k(&self) -> BigUint {
        let hash = sha256(&[&pad(&self.n, self.byte_len), &pad(&self.g, self.byte_len)]);
        BigUint::from_bytes_be(&hash)
    }
}

/// Client-side SRP-6a state, from key generation through the final shared
/// proof. One instance is used for exactly one login attempt.
pub struct SrpClient {
    group: SrpGroup,
    a: BigUint,
    a_pub: BigUint,
}

impl SrpClient {
    /// Generates the client's ephemeral private key `a` and public key
    /// `A = g^a mod N` (step 1: "client generates private key a... and
    /// public key A, sends to server").
    pub fn new() -> Self {
        let group = SrpGroup::rfc5054_2048();
        let mut rng = rand::thread_rng();
        let mut a_bytes = [0u8; 32];
        rng.fill_bytes(&mut a_bytes);
        let a = BigUint::from_bytes_be(&a_bytes);
        let a_pub = group.g.modpow(&a, &group.n);
        Self { group, a, a_pub }
    }

    pub fn public_key(&self) -> Vec<u8> {
        pad(&self.a_pub, self.group.byte_len)
    }

    /// Step 3: folds the server's `salt`/`B` and the pre-hashed password key
    /// into the session proof, returning `(M1, M2, session_key)`.
    ///
    /// `no_username_in_x` means `x` omits the account name term: `x = H(s,
    /// H(password_key))` rather than RFC 5054's `x = H(s, H(I | ':' | P))`.
    pub fn process_challenge(
        &self,
        account_name: &str,
        password_key: &[u8],
        salt: &[u8],
        b_pub: &[u8],
    ) -> Result<(Vec<u8>, Vec<u8>, Vec<u8>), anyhow::Error> {
        let zero = BigUint::from(0u32);
        let b = BigUint::from_bytes_be(b_pub);
        if b == zero || &b % &self.group.n == zero {
            anyhow::bail!("server sent invalid public value B");
        }

        let u_hash = sha256(&[&self.public_key(), &pad(&b, self.group.byte_len)]);
        let u = BigUint::from_bytes_be(&u_hash);
        if u == zero {
            anyhow::bail!("derived scrambling parameter u is zero");
        }

        let x_hash = sha256(&[salt, &sha256(&[password_key])]);
        let x = BigUint::from_bytes_be(&x_hash);

        let k = self.group.k();
        let gx = self.group.g.modpow(&x, &self.group.n);
        let kgx = (&k * &gx) % &self.group.n;
        // (B - k*g^x) mod N, keeping the operand non-negative for modpow.
        let base = (&self.group.n + &b - &kgx) % &self.group.n;
        let exponent = &self.a + (&u * &x);
        let s = base.modpow(&exponent, &self.group.n);
        let session_key = sha256(&[&pad(&s, self.group.byte_len)]).to_vec();

        let hash_n = sha256(&[&pad(&self.group.n, self.group.byte_len)]);
        let hash_g = sha256(&[&pad(&self.group.g, self.group.byte_len)]);
        let xor_ng: Vec<u8> = hash_n.iter().zip(hash_g.iter()).map(|(a, b)| a ^ b).collect();
        let hash_i = sha256(&[account_name.as_bytes()]);

        let m1 = sha256(&[
            &xor_ng,
            &hash_i,
            salt,
            &self.public_key(),
            &pad(&b, self.group.byte_len),
            &session_key,
        ])
        .to_vec();

        let m2 = sha256(&[&self.public_key(), &m1, &session_key]).to_vec();

        Ok((m1, m2, session_key))
    }
}

impl Default for SrpClient {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derive_password_key_differs_by_protocol() {
        let salt = b"some-salt";
        let s2k = derive_password_key(S2kProtocol::S2k, "hunter2", salt, 1000);
        let s2k_fo = derive_password_key(S2kProtocol::S2kFo, "hunter2", salt, 1000);
        assert_ne!(s2k, s2k_fo);
    }

    #[test]
    fn derive_password_key_is_deterministic() {
        let salt = b"some-salt";
        let a = derive_password_key(S2kProtocol::S2k, "hunter2", salt, 1000);
        let b = derive_password_key(S2kProtocol::S2k, "hunter2", salt, 1000);
        assert_eq!(a, b);
    }

    #[test]
    fn public_key_is_nonzero_and_correct_length() {
        let client = SrpClient::new();
        let pubkey = client.public_key();
        assert_eq!(pubkey.len(), 256);
        assert!(pubkey.iter().any(|&b| b != 0));
    }

    #[test]
    fn process_challenge_rejects_zero_b() {
        let client = SrpClient::new();
        let zero_b = vec![0u8; 256];
        let result = client.process_challenge("user@example.com", &[0u8; 32], b"salt", &zero_b);
        assert!(result.is_err());
    }

    #[test]
    fn process_challenge_produces_stable_proof_for_fixed_inputs() {
        // Two clients with independently generated `a` must not collide on
        // M1 for the same inputs; this is a sanity smoke test, not a
        // known-answer vector (no reference vector ships with the pack).
        let client_one = SrpClient::new();
        let client_two = SrpClient::new();
        let salt = b"fixed-salt-value";
        let b_pub = vec![3u8; 256];
        let key = [7u8; 32];
        let (m1_one, _, _) = client_one
            .process_challenge("user@example.com", &key, salt, &b_pub)
            .unwrap();
        let (m1_two, _, _) = client_two
            .process_challenge("user@example.com", &key, salt, &b_pub)
            .unwrap();
        assert_ne!(m1_one, m1_two);
    }
}
