//! Algorithm catalogue and negotiation (RFC 4253 Section 7.1).
//!
//! The catalogue is a set of ordered name lists, one per negotiation slot.
//! Order is preference order: for each slot the first client-preferred name
//! that also appears in the server's offer wins. AEAD ciphers suppress the
//! corresponding MAC slot.
//!
//! The strict-KEX pseudo-algorithms (`kex-strict-c-v00@openssh.com`,
//! `kex-strict-s-v00@openssh.com`) travel in the kex name-list of the
//! *initial* KEXINIT only and never match as real algorithms; the same
//! applies to the RFC 8308 `ext-info-*` markers, which are tolerated but
//! not negotiated.

use skiff_platform::{SkiffError, SkiffResult};

use crate::ssh::compress::CompressionAlgorithm;
use crate::ssh::crypto::{CipherAlgorithm, MacAlgorithm};
use crate::ssh::kex::KexInit;

/// Strict-KEX marker a client places in its initial kex list.
pub const KEX_STRICT_CLIENT: &str = "kex-strict-c-v00@openssh.com";
/// Strict-KEX marker a server places in its initial kex list.
pub const KEX_STRICT_SERVER: &str = "kex-strict-s-v00@openssh.com";
/// RFC 8308 marker: client supports SSH_MSG_EXT_INFO.
pub const EXT_INFO_CLIENT: &str = "ext-info-c";
/// RFC 8308 marker: server supports SSH_MSG_EXT_INFO.
pub const EXT_INFO_SERVER: &str = "ext-info-s";

/// Pseudo-algorithm names that may appear in a kex list but never win
/// negotiation.
fn is_pseudo_kex(name: &str) -> bool {
    matches!(
        name,
        KEX_STRICT_CLIENT | KEX_STRICT_SERVER | EXT_INFO_CLIENT | EXT_INFO_SERVER
    )
}

/// Ordered client-side algorithm preferences.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlgorithmCatalog {
    /// Key exchange methods, most preferred first.
    pub kex: Vec<String>,
    /// Server host key algorithms.
    pub host_key: Vec<String>,
    /// Ciphers (used for both directions).
    pub cipher: Vec<String>,
    /// MACs (used for both directions).
    pub mac: Vec<String>,
    /// Compression (used for both directions).
    pub compression: Vec<String>,
}

impl AlgorithmCatalog {
    /// Returns the kex name-list to advertise.
    ///
    /// The strict-KEX client marker and the RFC 8308 `ext-info-c` marker
    /// are appended only for the initial KEXINIT of a session.
    pub fn kex_names(&self, initial: bool) -> Vec<String> {
        let mut names = self.kex.clone();
        if initial {
            names.push(EXT_INFO_CLIENT.to_string());
            names.push(KEX_STRICT_CLIENT.to_string());
        }
        names
    }
}

impl Default for AlgorithmCatalog {
    fn default() -> Self {
        let s = |names: &[&str]| names.iter().map(|n| n.to_string()).collect::<Vec<_>>();
        Self {
            kex: s(&[
                "mlkem768x25519-sha256",
                "sntrup761x25519-sha512@openssh.com",
                "curve25519-sha256",
                "curve25519-sha256@libssh.org",
                "ecdh-sha2-nistp256",
                "ecdh-sha2-nistp384",
                "ecdh-sha2-nistp521",
                "diffie-hellman-group-exchange-sha256",
                "diffie-hellman-group-exchange-sha1",
                "diffie-hellman-group16-sha512",
                "diffie-hellman-group14-sha256",
                "diffie-hellman-group14-sha1",
                "diffie-hellman-group1-sha1",
            ]),
            host_key: s(&[
                "ssh-ed25519",
                "ecdsa-sha2-nistp256",
                "ecdsa-sha2-nistp384",
                "ecdsa-sha2-nistp521",
                "rsa-sha2-512",
                "rsa-sha2-256",
                "ssh-rsa",
            ]),
            cipher: s(&[
                "aes128-ctr",
                "aes192-ctr",
                "aes256-ctr",
                "aes128-gcm@openssh.com",
                "aes256-gcm@openssh.com",
                "chacha20-poly1305@openssh.com",
                "aes128-cbc",
                "aes192-cbc",
                "aes256-cbc",
            ]),
            mac: s(&[
                "hmac-sha2-256",
                "hmac-sha2-512",
                "hmac-sha1",
                "hmac-sha2-256-etm@openssh.com",
                "hmac-sha2-512-etm@openssh.com",
                "hmac-sha1-etm@openssh.com",
            ]),
            compression: s(&["none", "zlib@openssh.com"]),
        }
    }
}

/// The outcome of KEXINIT negotiation: one algorithm per slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiatedAlgorithms {
    /// Key exchange method name.
    pub kex: String,
    /// Host key algorithm name.
    pub host_key: String,
    /// Cipher, client to server.
    pub cipher_c2s: CipherAlgorithm,
    /// Cipher, server to client.
    pub cipher_s2c: CipherAlgorithm,
    /// MAC, client to server (`None` when the cipher is AEAD).
    pub mac_c2s: Option<MacAlgorithm>,
    /// MAC, server to client (`None` when the cipher is AEAD).
    pub mac_s2c: Option<MacAlgorithm>,
    /// Compression, client to server.
    pub compression_c2s: CompressionAlgorithm,
    /// Compression, server to client.
    pub compression_s2c: CompressionAlgorithm,
}

/// Picks the first client-preferred name that the server also offers.
pub fn select_algorithm(
    slot: &str,
    client_list: &[String],
    server_list: &[String],
) -> SkiffResult<String> {
    for client_alg in client_list {
        if client_alg.is_empty() || is_pseudo_kex(client_alg) {
            continue;
        }
        if server_list.contains(client_alg) {
            return Ok(client_alg.clone());
        }
    }
    Err(SkiffError::KexFailed(format!(
        "no common {} algorithm: client={:?}, server={:?}",
        slot, client_list, server_list
    )))
}

/// Negotiates all slots between our KEXINIT and the server's.
pub fn negotiate(client: &KexInit, server: &KexInit) -> SkiffResult<NegotiatedAlgorithms> {
    let kex = select_algorithm("kex", client.kex_algorithms(), server.kex_algorithms())?;
    let host_key = select_algorithm(
        "host key",
        client.server_host_key_algorithms(),
        server.server_host_key_algorithms(),
    )?;

    let cipher_c2s_name = select_algorithm(
        "cipher (client to server)",
        client.encryption_client_to_server(),
        server.encryption_client_to_server(),
    )?;
    let cipher_s2c_name = select_algorithm(
        "cipher (server to client)",
        client.encryption_server_to_client(),
        server.encryption_server_to_client(),
    )?;
    let cipher_c2s = CipherAlgorithm::from_name(&cipher_c2s_name)
        .ok_or_else(|| SkiffError::KexFailed(format!("unknown cipher {}", cipher_c2s_name)))?;
    let cipher_s2c = CipherAlgorithm::from_name(&cipher_s2c_name)
        .ok_or_else(|| SkiffError::KexFailed(format!("unknown cipher {}", cipher_s2c_name)))?;

    // AEAD ciphers carry their own integrity protection; the MAC slot is
    // not consulted for them (and need not even overlap).
    let mac_c2s = if cipher_c2s.is_aead() {
        None
    } else {
        let name = select_algorithm(
            "MAC (client to server)",
            client.mac_client_to_server(),
            server.mac_client_to_server(),
        )?;
        Some(
            MacAlgorithm::from_name(&name)
                .ok_or_else(|| SkiffError::KexFailed(format!("unknown MAC {}", name)))?,
        )
    };
    let mac_s2c = if cipher_s2c.is_aead() {
        None
    } else {
        let name = select_algorithm(
            "MAC (server to client)",
            client.mac_server_to_client(),
            server.mac_server_to_client(),
        )?;
        Some(
            MacAlgorithm::from_name(&name)
                .ok_or_else(|| SkiffError::KexFailed(format!("unknown MAC {}", name)))?,
        )
    };

    let compression_c2s_name = select_algorithm(
        "compression (client to server)",
        client.compression_client_to_server(),
        server.compression_client_to_server(),
    )?;
    let compression_s2c_name = select_algorithm(
        "compression (server to client)",
        client.compression_server_to_client(),
        server.compression_server_to_client(),
    )?;
    let compression_c2s = CompressionAlgorithm::from_name(&compression_c2s_name).ok_or_else(
        || SkiffError::KexFailed(format!("unknown compression {}", compression_c2s_name)),
    )?;
    let compression_s2c = CompressionAlgorithm::from_name(&compression_s2c_name).ok_or_else(
        || SkiffError::KexFailed(format!("unknown compression {}", compression_s2c_name)),
    )?;

    Ok(NegotiatedAlgorithms {
        kex,
        host_key,
        cipher_c2s,
        cipher_s2c,
        mac_c2s,
        mac_s2c,
        compression_c2s,
        compression_s2c,
    })
}

/// Returns whether the server's initial kex list enables strict-KEX mode.
pub fn server_offers_strict_kex(server_kex_list: &[String]) -> bool {
    server_kex_list.iter().any(|n| n == KEX_STRICT_SERVER)
}
