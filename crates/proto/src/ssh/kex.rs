//! Key exchange negotiation and driver (RFC 4253 Section 7).
//!
//! This module holds:
//!
//! - [`KexInit`]: the SSH_MSG_KEXINIT message
//! - [`KexMethod`]: the trait every key-exchange method implements, with
//!   a factory keyed by negotiated name
//! - [`KexDriver`]: the per-exchange state machine fed by the transport
//!   with method-range messages (numbers 30-49) until it yields a
//!   [`KexOutcome`]
//!
//! The driver is used for the initial exchange and for rekeys; only the
//! initial exchange advertises and honors the strict-KEX markers.

use bytes::BytesMut;
use rand::RngCore;
use skiff_platform::{SkiffError, SkiffResult};

use crate::ssh::algorithms::{self, AlgorithmCatalog, NegotiatedAlgorithms};
use crate::ssh::keys::SharedSecret;
use crate::ssh::message::MessageType;
use crate::ssh::wire;

/// SSH_MSG_KEXINIT message (RFC 4253 Section 7.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KexInit {
    cookie: [u8; 16],
    kex_algorithms: Vec<String>,
    server_host_key_algorithms: Vec<String>,
    encryption_client_to_server: Vec<String>,
    encryption_server_to_client: Vec<String>,
    mac_client_to_server: Vec<String>,
    mac_server_to_client: Vec<String>,
    compression_client_to_server: Vec<String>,
    compression_server_to_client: Vec<String>,
    languages_client_to_server: Vec<String>,
    languages_server_to_client: Vec<String>,
    first_kex_packet_follows: bool,
}

impl KexInit {
    /// Builds a KEXINIT from the catalogue with a fresh random cookie.
    ///
    /// `initial` appends the strict-KEX client marker to the kex list.
    pub fn new(catalog: &AlgorithmCatalog, initial: bool) -> Self {
        let mut cookie = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut cookie);

        Self {
            cookie,
            kex_algorithms: catalog.kex_names(initial),
            server_host_key_algorithms: catalog.host_key.clone(),
            encryption_client_to_server: catalog.cipher.clone(),
            encryption_server_to_client: catalog.cipher.clone(),
            mac_client_to_server: catalog.mac.clone(),
            mac_server_to_client: catalog.mac.clone(),
            compression_client_to_server: catalog.compression.clone(),
            compression_server_to_client: catalog.compression.clone(),
            languages_client_to_server: vec![],
            languages_server_to_client: vec![],
            first_kex_packet_follows: false,
        }
    }

    /// Returns the cookie.
    pub fn cookie(&self) -> &[u8; 16] {
        &self.cookie
    }

    /// Returns the key exchange algorithms.
    pub fn kex_algorithms(&self) -> &[String] {
        &self.kex_algorithms
    }

    /// Returns the server host key algorithms.
    pub fn server_host_key_algorithms(&self) -> &[String] {
        &self.server_host_key_algorithms
    }

    /// Returns the encryption algorithms, client to server.
    pub fn encryption_client_to_server(&self) -> &[String] {
        &self.encryption_client_to_server
    }

    /// Returns the encryption algorithms, server to client.
    pub fn encryption_server_to_client(&self) -> &[String] {
        &self.encryption_server_to_client
    }

    /// Returns the MAC algorithms, client to server.
    pub fn mac_client_to_server(&self) -> &[String] {
        &self.mac_client_to_server
    }

    /// Returns the MAC algorithms, server to client.
    pub fn mac_server_to_client(&self) -> &[String] {
        &self.mac_server_to_client
    }

    /// Returns the compression algorithms, client to server.
    pub fn compression_client_to_server(&self) -> &[String] {
        &self.compression_client_to_server
    }

    /// Returns the compression algorithms, server to client.
    pub fn compression_server_to_client(&self) -> &[String] {
        &self.compression_server_to_client
    }

    /// Returns whether a guessed kex packet follows.
    pub fn first_kex_packet_follows(&self) -> bool {
        self.first_kex_packet_follows
    }

    /// Serializes the message (RFC 4253 Section 7.1 layout).
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        wire::write_u8(&mut buf, MessageType::KexInit as u8);
        buf.extend_from_slice(&self.cookie);
        wire::write_name_list(&mut buf, &self.kex_algorithms);
        wire::write_name_list(&mut buf, &self.server_host_key_algorithms);
        wire::write_name_list(&mut buf, &self.encryption_client_to_server);
        wire::write_name_list(&mut buf, &self.encryption_server_to_client);
        wire::write_name_list(&mut buf, &self.mac_client_to_server);
        wire::write_name_list(&mut buf, &self.mac_server_to_client);
        wire::write_name_list(&mut buf, &self.compression_client_to_server);
        wire::write_name_list(&mut buf, &self.compression_server_to_client);
        wire::write_name_list(&mut buf, &self.languages_client_to_server);
        wire::write_name_list(&mut buf, &self.languages_server_to_client);
        wire::write_bool(&mut buf, self.first_kex_packet_follows);
        wire::write_u32(&mut buf, 0); // reserved
        buf.to_vec()
    }

    /// Parses a KEXINIT message.
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        let mut offset = 0;
        let msg_type = wire::read_u8(data, &mut offset)?;
        if msg_type != MessageType::KexInit as u8 {
            return Err(SkiffError::Protocol(format!(
                "expected SSH_MSG_KEXINIT, got {}",
                msg_type
            )));
        }
        if data.len() < offset + 16 {
            return Err(SkiffError::MalformedPacket(
                "KEXINIT missing cookie".to_string(),
            ));
        }
        let mut cookie = [0u8; 16];
        cookie.copy_from_slice(&data[offset..offset + 16]);
        offset += 16;

        let kex_algorithms = wire::read_name_list(data, &mut offset)?;
        let server_host_key_algorithms = wire::read_name_list(data, &mut offset)?;
        let encryption_client_to_server = wire::read_name_list(data, &mut offset)?;
        let encryption_server_to_client = wire::read_name_list(data, &mut offset)?;
        let mac_client_to_server = wire::read_name_list(data, &mut offset)?;
        let mac_server_to_client = wire::read_name_list(data, &mut offset)?;
        let compression_client_to_server = wire::read_name_list(data, &mut offset)?;
        let compression_server_to_client = wire::read_name_list(data, &mut offset)?;
        let languages_client_to_server = wire::read_name_list(data, &mut offset)?;
        let languages_server_to_client = wire::read_name_list(data, &mut offset)?;
        let first_kex_packet_follows = wire::read_bool(data, &mut offset)?;
        let _reserved = wire::read_u32(data, &mut offset)?;

        Ok(Self {
            cookie,
            kex_algorithms,
            server_host_key_algorithms,
            encryption_client_to_server,
            encryption_server_to_client,
            mac_client_to_server,
            mac_server_to_client,
            compression_client_to_server,
            compression_server_to_client,
            languages_client_to_server,
            languages_server_to_client,
            first_kex_packet_follows,
        })
    }
}

/// SSH_MSG_NEWKEYS (RFC 4253 Section 7.3): a single byte, value 21.
pub fn newkeys_payload() -> Vec<u8> {
    vec![MessageType::NewKeys as u8]
}

/// Hash function families used by the kex methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlg {
    /// SHA-1 (legacy methods only)
    Sha1,
    /// SHA-256
    Sha256,
    /// SHA-384
    Sha384,
    /// SHA-512
    Sha512,
}

impl HashAlg {
    /// Hashes `data` with this algorithm.
    pub fn digest(&self, data: &[u8]) -> Vec<u8> {
        use sha1::Digest as _;
        match self {
            HashAlg::Sha1 => sha1::Sha1::digest(data).to_vec(),
            HashAlg::Sha256 => sha2::Sha256::digest(data).to_vec(),
            HashAlg::Sha384 => sha2::Sha384::digest(data).to_vec(),
            HashAlg::Sha512 => sha2::Sha512::digest(data).to_vec(),
        }
    }
}

/// The identification strings and KEXINIT payloads an exchange hash is
/// computed over.
#[derive(Debug, Clone)]
pub struct ExchangeContext {
    /// Client identification string, without CR LF.
    pub client_version: String,
    /// Server identification string, without CR LF.
    pub server_version: String,
    /// Client KEXINIT payload.
    pub client_kexinit: Vec<u8>,
    /// Server KEXINIT payload.
    pub server_kexinit: Vec<u8>,
}

impl ExchangeContext {
    /// Writes `string V_C || string V_S || string I_C || string I_S ||
    /// string K_S` into a hash input buffer.
    pub fn write_hash_prelude(&self, buf: &mut BytesMut, host_key_blob: &[u8]) {
        wire::write_utf8(buf, &self.client_version);
        wire::write_utf8(buf, &self.server_version);
        wire::write_string(buf, &self.client_kexinit);
        wire::write_string(buf, &self.server_kexinit);
        wire::write_string(buf, host_key_blob);
    }
}

/// Result of a completed key exchange.
pub struct KexOutcome {
    /// The exchange hash `H`.
    pub exchange_hash: Vec<u8>,
    /// The shared secret `K` in its hash encoding.
    pub shared_secret: SharedSecret,
    /// The server's host key blob `K_S`.
    pub host_key_blob: Vec<u8>,
    /// The server's signature over `H`.
    pub signature_blob: Vec<u8>,
}

impl std::fmt::Debug for KexOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KexOutcome")
            .field("exchange_hash", &hex::encode(&self.exchange_hash))
            .field("shared_secret", &"<redacted>")
            .finish()
    }
}

/// Progress of an ongoing exchange.
pub enum KexProgress {
    /// The method produced messages to send and awaits more input.
    Continue(Vec<Vec<u8>>),
    /// The exchange is complete.
    Done(Box<KexOutcome>),
}

/// A key exchange method (spec: DH fixed groups, DH group exchange,
/// ECDH, Curve25519, hybrid KEM).
pub trait KexMethod: Send {
    /// The negotiated algorithm name.
    fn name(&self) -> &'static str;

    /// The method's hash function, also used for key derivation.
    fn hash(&self, data: &[u8]) -> Vec<u8>;

    /// Returns the client's opening message(s).
    fn start(&mut self, ctx: &ExchangeContext) -> SkiffResult<Vec<Vec<u8>>>;

    /// Feeds one method-range message (numbers 30-49).
    fn on_message(&mut self, payload: &[u8], ctx: &ExchangeContext) -> SkiffResult<KexProgress>;
}

/// Creates the method implementation for a negotiated kex name.
pub fn make_kex_method(name: &str) -> SkiffResult<Box<dyn KexMethod>> {
    use crate::ssh::kex_dh::{DhExchange, DhGexExchange, DhGroup};
    use crate::ssh::kex_ecdh::{Curve25519Exchange, EcdhExchange, NistCurve};
    use crate::ssh::kex_hybrid::{MlKem768X25519Exchange, Sntrup761X25519Exchange};

    match name {
        "mlkem768x25519-sha256" => Ok(Box::new(MlKem768X25519Exchange::new()?)),
        "sntrup761x25519-sha512@openssh.com" => Ok(Box::new(Sntrup761X25519Exchange::new()?)),
        "curve25519-sha256" | "curve25519-sha256@libssh.org" => {
            Ok(Box::new(Curve25519Exchange::new()?))
        }
        "ecdh-sha2-nistp256" => Ok(Box::new(EcdhExchange::new(NistCurve::P256)?)),
        "ecdh-sha2-nistp384" => Ok(Box::new(EcdhExchange::new(NistCurve::P384)?)),
        "ecdh-sha2-nistp521" => Ok(Box::new(EcdhExchange::new(NistCurve::P521)?)),
        "diffie-hellman-group1-sha1" => Ok(Box::new(DhExchange::new(DhGroup::Group1, false))),
        "diffie-hellman-group14-sha1" => Ok(Box::new(DhExchange::new(DhGroup::Group14, false))),
        "diffie-hellman-group14-sha256" => Ok(Box::new(DhExchange::new(DhGroup::Group14, true))),
        "diffie-hellman-group16-sha512" => Ok(Box::new(DhExchange::new(DhGroup::Group16, true))),
        "diffie-hellman-group-exchange-sha1" => Ok(Box::new(DhGexExchange::new(false))),
        "diffie-hellman-group-exchange-sha256" => Ok(Box::new(DhGexExchange::new(true))),
        other => Err(SkiffError::KexFailed(format!(
            "no implementation for kex method {}",
            other
        ))),
    }
}

/// Drives one key exchange from KEXINIT payloads to a [`KexOutcome`].
pub struct KexDriver {
    ctx: ExchangeContext,
    method: Box<dyn KexMethod>,
    negotiated: NegotiatedAlgorithms,
    server_strict: bool,
    discard_guessed_packet: bool,
}

impl KexDriver {
    /// Negotiates algorithms and prepares the method.
    ///
    /// Returns the driver plus the client's opening kex messages.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client_version: &str,
        server_version: &str,
        client_kexinit: Vec<u8>,
        server_kexinit: Vec<u8>,
        initial: bool,
    ) -> SkiffResult<(Self, Vec<Vec<u8>>)> {
        let client = KexInit::from_bytes(&client_kexinit)?;
        let server = KexInit::from_bytes(&server_kexinit)?;

        let negotiated = algorithms::negotiate(&client, &server)?;
        let server_strict =
            initial && algorithms::server_offers_strict_kex(server.kex_algorithms());

        // A wrong server guess means its first kex packet must be
        // discarded (RFC 4253 Section 7).
        let discard_guessed_packet = server.first_kex_packet_follows()
            && server.kex_algorithms().first().map(String::as_str)
                != Some(negotiated.kex.as_str());

        let mut method = make_kex_method(&negotiated.kex)?;
        let ctx = ExchangeContext {
            client_version: client_version.to_string(),
            server_version: server_version.to_string(),
            client_kexinit,
            server_kexinit,
        };
        let outgoing = method.start(&ctx)?;

        Ok((
            Self {
                ctx,
                method,
                negotiated,
                server_strict,
                discard_guessed_packet,
            },
            outgoing,
        ))
    }

    /// Returns the negotiated algorithm set.
    pub fn negotiated(&self) -> &NegotiatedAlgorithms {
        &self.negotiated
    }

    /// Returns whether the server enabled strict-KEX mode.
    pub fn server_strict(&self) -> bool {
        self.server_strict
    }

    /// Hashes data with the method's hash function.
    pub fn hash(&self, data: &[u8]) -> Vec<u8> {
        self.method.hash(data)
    }

    /// Feeds one method-range message to the exchange.
    pub fn on_message(&mut self, payload: &[u8]) -> SkiffResult<KexProgress> {
        if self.discard_guessed_packet {
            self.discard_guessed_packet = false;
            return Ok(KexProgress::Continue(vec![]));
        }
        self.method.on_message(payload, &self.ctx)
    }
}

impl std::fmt::Debug for KexDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KexDriver")
            .field("method", &self.method.name())
            .field("strict", &self.server_strict)
            .finish()
    }
}
