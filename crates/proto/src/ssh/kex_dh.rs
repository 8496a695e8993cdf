//! Classic Diffie-Hellman key exchange (RFC 4253 Section 8, RFC 4419,
//! RFC 8268).
//!
//! Implements the fixed-group methods:
//!
//! - diffie-hellman-group1-sha1 (Oakley Group 2, 1024-bit)
//! - diffie-hellman-group14-sha1 / -sha256 (2048-bit)
//! - diffie-hellman-group16-sha512 (4096-bit)
//!
//! and the negotiated-group methods
//! diffie-hellman-group-exchange-sha1 / -sha256.
//!
//! # Security
//!
//! - Peer public values are validated to lie in (1, p-1)
//! - Ephemeral exponents are zeroized on drop
//! - Group-exchange moduli outside the requested size window are rejected

use bytes::BytesMut;
use num_bigint::{BigUint, RandBigInt};
use once_cell::sync::Lazy;
use skiff_platform::{SkiffError, SkiffResult};
use zeroize::Zeroize;

use crate::ssh::kex::{ExchangeContext, HashAlg, KexMethod, KexOutcome, KexProgress};
use crate::ssh::keys::SharedSecret;
use crate::ssh::wire;

/// SSH_MSG_KEXDH_INIT (fixed groups).
pub const MSG_KEXDH_INIT: u8 = 30;
/// SSH_MSG_KEXDH_REPLY (fixed groups).
pub const MSG_KEXDH_REPLY: u8 = 31;

/// SSH_MSG_KEX_DH_GEX_GROUP.
pub const MSG_KEX_DH_GEX_GROUP: u8 = 31;
/// SSH_MSG_KEX_DH_GEX_INIT.
pub const MSG_KEX_DH_GEX_INIT: u8 = 32;
/// SSH_MSG_KEX_DH_GEX_REPLY.
pub const MSG_KEX_DH_GEX_REPLY: u8 = 33;
/// SSH_MSG_KEX_DH_GEX_REQUEST.
pub const MSG_KEX_DH_GEX_REQUEST: u8 = 34;

/// Smallest modulus we accept from group exchange, in bits.
pub const GEX_MIN_BITS: u32 = 2048;
/// Preferred group-exchange modulus size, in bits.
pub const GEX_PREFERRED_BITS: u32 = 3072;
/// Largest modulus we accept from group exchange, in bits.
pub const GEX_MAX_BITS: u32 = 8192;

/// Oakley Group 2 prime (RFC 2409), used by diffie-hellman-group1-sha1.
static GROUP1_P: Lazy<BigUint> = Lazy::new(|| {
    BigUint::from_bytes_be(
        &hex::decode(concat!(
            "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD129024E08",
            "8A67CC74020BBEA63B139B22514A08798E3404DDEF9519B3CD3A431B",
            "302B0A6DF25F14374FE1356D6D51C245E485B576625E7EC6F44C42E9",
            "A637ED6B0BFF5CB6F406B7EDEE386BFB5A899FA5AE9F24117C4B1FE6",
            "49286651ECE65381FFFFFFFFFFFFFFFF"
        ))
        .expect("valid hex"),
    )
});

/// 2048-bit MODP group 14 prime (RFC 3526).
static GROUP14_P: Lazy<BigUint> = Lazy::new(|| {
    BigUint::from_bytes_be(
        &hex::decode(concat!(
            "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD129024E08",
            "8A67CC74020BBEA63B139B22514A08798E3404DDEF9519B3CD3A431B",
            "302B0A6DF25F14374FE1356D6D51C245E485B576625E7EC6F44C42E9",
            "A637ED6B0BFF5CB6F406B7EDEE386BFB5A899FA5AE9F24117C4B1FE6",
            "49286651ECE45B3DC2007CB8A163BF0598DA48361C55D39A69163FA8",
            "FD24CF5F83655D23DCA3AD961C62F356208552BB9ED529077096966D",
            "670C354E4ABC9804F1746C08CA18217C32905E462E36CE3BE39E772C",
            "180E86039B2783A2EC07A28FB5C55DF06F4C52C9DE2BCBF695581718",
            "3995497CEA956AE515D2261898FA051015728E5A8AACAA68FFFFFFFF",
            "FFFFFFFF"
        ))
        .expect("valid hex"),
    )
});

/// 4096-bit MODP group 16 prime (RFC 3526).
static GROUP16_P: Lazy<BigUint> = Lazy::new(|| {
    BigUint::from_bytes_be(
        &hex::decode(concat!(
            "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD129024E08",
            "8A67CC74020BBEA63B139B22514A08798E3404DDEF9519B3CD3A431B",
            "302B0A6DF25F14374FE1356D6D51C245E485B576625E7EC6F44C42E9",
            "A637ED6B0BFF5CB6F406B7EDEE386BFB5A899FA5AE9F24117C4B1FE6",
            "49286651ECE45B3DC2007CB8A163BF0598DA48361C55D39A69163FA8",
            "FD24CF5F83655D23DCA3AD961C62F356208552BB9ED529077096966D",
            "670C354E4ABC9804F1746C08CA18217C32905E462E36CE3BE39E772C",
            "180E86039B2783A2EC07A28FB5C55DF06F4C52C9DE2BCBF695581718",
            "3995497CEA956AE515D2261898FA051015728E5A8AAAC42DAD33170D",
            "04507A33A85521ABDF1CBA64ECFB850458DBEF0A8AEA71575D060C7D",
            "B3970F85A6E1E4C7ABF5AE8CDB0933D71E8C94E04A25619DCEE3D226",
            "1AD2EE6BF12FFA06D98A0864D87602733EC86A64521F2B18177B200C",
            "BBE117577A615D6C770988C0BAD946E208E24FA074E5AB3143DB5BFC",
            "E0FD108E4B82D120A92108011A723C12A787E6D788719A10BDBA5B26",
            "99C327186AF4E23C1A946834B6150BDA2583E9CA2AD44CE8DBBBC2DB",
            "04DE8EF92E8EFC141FBECAA6287C59474E6BC05D99B2964FA090C3A2",
            "233BA186515BE7ED1F612970CEE2D7AFB81BDD762170481CD0069127",
            "D5B05AA993B4EA988D8FDDC186FFB7DC90A6C08F4DF435C934063199",
            "FFFFFFFFFFFFFFFF"
        ))
        .expect("valid hex"),
    )
});

/// Generator shared by all MODP groups in use.
static GENERATOR: Lazy<BigUint> = Lazy::new(|| BigUint::from(2u32));

/// Fixed MODP groups of the catalogue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DhGroup {
    /// 1024-bit Oakley Group 2.
    Group1,
    /// 2048-bit MODP group.
    Group14,
    /// 4096-bit MODP group.
    Group16,
}

impl DhGroup {
    fn prime(&self) -> &'static BigUint {
        match self {
            DhGroup::Group1 => &GROUP1_P,
            DhGroup::Group14 => &GROUP14_P,
            DhGroup::Group16 => &GROUP16_P,
        }
    }
}

/// Generates an ephemeral exponent in (1, p-1) and the corresponding
/// public value.
fn generate_keypair(p: &BigUint, g: &BigUint) -> (Vec<u8>, Vec<u8>) {
    let mut rng = rand::thread_rng();
    let p_minus_one = p - 1u32;
    let x = rng.gen_biguint_range(&BigUint::from(2u32), &p_minus_one);
    let e = g.modpow(&x, p);
    (x.to_bytes_be(), e.to_bytes_be())
}

/// Validates a peer public value: 1 < y < p-1.
fn validate_public(y: &BigUint, p: &BigUint) -> SkiffResult<()> {
    if y <= &BigUint::from(1u32) || y >= &(p - 1u32) {
        return Err(SkiffError::KexFailed(
            "peer DH public value out of range".to_string(),
        ));
    }
    Ok(())
}

/// Fixed-group Diffie-Hellman exchange.
pub struct DhExchange {
    group: DhGroup,
    hash: HashAlg,
    /// Ephemeral exponent, big-endian. Zeroized on drop.
    private: Vec<u8>,
    /// Our public value e.
    public: Vec<u8>,
    sent_init: bool,
}

impl DhExchange {
    /// Creates an exchange for a fixed group.
    ///
    /// `sha2` selects the SHA-2 flavor of the method name; group16
    /// always hashes with SHA-512.
    pub fn new(group: DhGroup, sha2: bool) -> Self {
        let hash = match (group, sha2) {
            (DhGroup::Group16, _) => HashAlg::Sha512,
            (_, true) => HashAlg::Sha256,
            (_, false) => HashAlg::Sha1,
        };
        let (private, public) = generate_keypair(group.prime(), &GENERATOR);
        Self {
            group,
            hash,
            private,
            public,
            sent_init: false,
        }
    }
}

impl Drop for DhExchange {
    fn drop(&mut self) {
        self.private.zeroize();
    }
}

impl KexMethod for DhExchange {
    fn name(&self) -> &'static str {
        match (self.group, self.hash) {
            (DhGroup::Group1, _) => "diffie-hellman-group1-sha1",
            (DhGroup::Group14, HashAlg::Sha1) => "diffie-hellman-group14-sha1",
            (DhGroup::Group14, _) => "diffie-hellman-group14-sha256",
            (DhGroup::Group16, _) => "diffie-hellman-group16-sha512",
        }
    }

    fn hash(&self, data: &[u8]) -> Vec<u8> {
        self.hash.digest(data)
    }

    fn start(&mut self, _ctx: &ExchangeContext) -> SkiffResult<Vec<Vec<u8>>> {
        self.sent_init = true;
        let mut buf = BytesMut::new();
        wire::write_u8(&mut buf, MSG_KEXDH_INIT);
        wire::write_mpint(&mut buf, &self.public);
        Ok(vec![buf.to_vec()])
    }

    fn on_message(&mut self, payload: &[u8], ctx: &ExchangeContext) -> SkiffResult<KexProgress> {
        let mut offset = 0;
        let msg_type = wire::read_u8(payload, &mut offset)?;
        if msg_type != MSG_KEXDH_REPLY || !self.sent_init {
            return Err(SkiffError::KexFailed(format!(
                "unexpected message {} during {}",
                msg_type,
                self.name()
            )));
        }

        let host_key_blob = wire::read_string(payload, &mut offset)?;
        let f_bytes = wire::read_mpint(payload, &mut offset)?;
        let signature_blob = wire::read_string(payload, &mut offset)?;

        let p = self.group.prime();
        let f = BigUint::from_bytes_be(&f_bytes);
        validate_public(&f, p)?;

        let x = BigUint::from_bytes_be(&self.private);
        let k = f.modpow(&x, p).to_bytes_be();

        let mut hash_input = BytesMut::new();
        ctx.write_hash_prelude(&mut hash_input, &host_key_blob);
        wire::write_mpint(&mut hash_input, &self.public);
        wire::write_mpint(&mut hash_input, &f_bytes);
        wire::write_mpint(&mut hash_input, &k);
        let exchange_hash = self.hash.digest(&hash_input);

        Ok(KexProgress::Done(Box::new(KexOutcome {
            exchange_hash,
            shared_secret: SharedSecret::Mpint(k),
            host_key_blob,
            signature_blob,
        })))
    }
}

enum GexState {
    AwaitGroup,
    AwaitReply {
        p: BigUint,
        g: BigUint,
        private: Vec<u8>,
        public: Vec<u8>,
    },
    Done,
}

/// Diffie-Hellman group exchange (RFC 4419).
pub struct DhGexExchange {
    hash: HashAlg,
    state: GexState,
}

impl DhGexExchange {
    /// Creates a group-exchange method; `sha2` selects SHA-256.
    pub fn new(sha2: bool) -> Self {
        Self {
            hash: if sha2 { HashAlg::Sha256 } else { HashAlg::Sha1 },
            state: GexState::AwaitGroup,
        }
    }
}

impl Drop for DhGexExchange {
    fn drop(&mut self) {
        if let GexState::AwaitReply { private, .. } = &mut self.state {
            private.zeroize();
        }
    }
}

impl KexMethod for DhGexExchange {
    fn name(&self) -> &'static str {
        if self.hash == HashAlg::Sha256 {
            "diffie-hellman-group-exchange-sha256"
        } else {
            "diffie-hellman-group-exchange-sha1"
        }
    }

    fn hash(&self, data: &[u8]) -> Vec<u8> {
        self.hash.digest(data)
    }

    fn start(&mut self, _ctx: &ExchangeContext) -> SkiffResult<Vec<Vec<u8>>> {
        let mut buf = BytesMut::new();
        wire::write_u8(&mut buf, MSG_KEX_DH_GEX_REQUEST);
        wire::write_u32(&mut buf, GEX_MIN_BITS);
        wire::write_u32(&mut buf, GEX_PREFERRED_BITS);
        wire::write_u32(&mut buf, GEX_MAX_BITS);
        Ok(vec![buf.to_vec()])
    }

    fn on_message(&mut self, payload: &[u8], ctx: &ExchangeContext) -> SkiffResult<KexProgress> {
        let mut offset = 0;
        let msg_type = wire::read_u8(payload, &mut offset)?;

        match (&self.state, msg_type) {
            (GexState::AwaitGroup, MSG_KEX_DH_GEX_GROUP) => {
                let p_bytes = wire::read_mpint(payload, &mut offset)?;
                let g_bytes = wire::read_mpint(payload, &mut offset)?;
                let p = BigUint::from_bytes_be(&p_bytes);
                let g = BigUint::from_bytes_be(&g_bytes);

                let bits = p.bits() as u32;
                if !(GEX_MIN_BITS..=GEX_MAX_BITS).contains(&bits) {
                    return Err(SkiffError::KexFailed(format!(
                        "server proposed a {}-bit group outside [{}, {}]",
                        bits, GEX_MIN_BITS, GEX_MAX_BITS
                    )));
                }
                if g < BigUint::from(2u32) {
                    return Err(SkiffError::KexFailed(
                        "server proposed generator below 2".to_string(),
                    ));
                }

                let (private, public) = generate_keypair(&p, &g);
                let mut buf = BytesMut::new();
                wire::write_u8(&mut buf, MSG_KEX_DH_GEX_INIT);
                wire::write_mpint(&mut buf, &public);

                self.state = GexState::AwaitReply {
                    p,
                    g,
                    private,
                    public,
                };
                Ok(KexProgress::Continue(vec![buf.to_vec()]))
            }
            (GexState::AwaitReply { .. }, MSG_KEX_DH_GEX_REPLY) => {
                let host_key_blob = wire::read_string(payload, &mut offset)?;
                let f_bytes = wire::read_mpint(payload, &mut offset)?;
                let signature_blob = wire::read_string(payload, &mut offset)?;

                let GexState::AwaitReply {
                    p,
                    g,
                    mut private,
                    public,
                } = std::mem::replace(&mut self.state, GexState::Done)
                else {
                    unreachable!("state checked above");
                };

                let f = BigUint::from_bytes_be(&f_bytes);
                validate_public(&f, &p)?;

                let x = BigUint::from_bytes_be(&private);
                private.zeroize();
                let k = f.modpow(&x, &p).to_bytes_be();

                let mut hash_input = BytesMut::new();
                ctx.write_hash_prelude(&mut hash_input, &host_key_blob);
                wire::write_u32(&mut hash_input, GEX_MIN_BITS);
                wire::write_u32(&mut hash_input, GEX_PREFERRED_BITS);
                wire::write_u32(&mut hash_input, GEX_MAX_BITS);
                wire::write_mpint(&mut hash_input, &p.to_bytes_be());
                wire::write_mpint(&mut hash_input, &g.to_bytes_be());
                wire::write_mpint(&mut hash_input, &public);
                wire::write_mpint(&mut hash_input, &f_bytes);
                wire::write_mpint(&mut hash_input, &k);
                let exchange_hash = self.hash.digest(&hash_input);

                Ok(KexProgress::Done(Box::new(KexOutcome {
                    exchange_hash,
                    shared_secret: SharedSecret::Mpint(k),
                    host_key_blob,
                    signature_blob,
                })))
            }
            (_, other) => Err(SkiffError::KexFailed(format!(
                "unexpected message {} during {}",
                other,
                self.name()
            ))),
        }
    }
}
