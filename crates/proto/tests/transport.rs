//! End-to-end transport tests against a scripted in-process server.
//!
//! The "server" speaks real SSH over a duplex pipe using the crate's own
//! record layer with the directions swapped, an ephemeral Ed25519 host
//! key, and curve25519-sha256 key exchange. Every test exercises the
//! full client path: identification, KEXINIT, key exchange, NEWKEYS,
//! and the connection protocol.

use bytes::BytesMut;
use ed25519_dalek::Signer as _;
use sha2::Digest as _;
use skiff_platform::{SkiffError, SkiffResult};
use skiff_proto::ssh::algorithms::{negotiate, AlgorithmCatalog, NegotiatedAlgorithms};
use skiff_proto::ssh::client::{SshClient, SshClientConfig};
use skiff_proto::ssh::compress::{Compressor, Decompressor};
use skiff_proto::ssh::crypto::{Cipher, CipherDirection, MacKey};
use skiff_proto::ssh::kex::KexInit;
use skiff_proto::ssh::keys::{derive_key_material, SharedSecret};
use skiff_proto::ssh::message::MessageType;
use skiff_proto::ssh::packet::{PacketOpener, PacketSealer};
use skiff_proto::ssh::wire;
use skiff_proto::ssh::auth::NoneAuthenticator;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
use tokio::time::{timeout, Duration};

const STRICT_SERVER: &str = "kex-strict-s-v00@openssh.com";

struct ServerOptions {
    banners: Vec<&'static str>,
    catalog: AlgorithmCatalog,
    strict_marker: bool,
    ignore_before_kexinit: bool,
    accept_auth: bool,
    ext_info_after_newkeys: bool,
}

impl Default for ServerOptions {
    fn default() -> Self {
        let mut catalog = AlgorithmCatalog::default();
        catalog.kex = vec!["curve25519-sha256".to_string()];
        catalog.host_key = vec!["ssh-ed25519".to_string()];
        catalog.cipher = vec!["aes128-ctr".to_string()];
        catalog.mac = vec!["hmac-sha2-256".to_string()];
        Self {
            banners: vec![],
            catalog,
            strict_marker: false,
            ignore_before_kexinit: false,
            accept_auth: false,
            ext_info_after_newkeys: false,
        }
    }
}

struct ServerConn {
    read: ReadHalf<DuplexStream>,
    write: WriteHalf<DuplexStream>,
    opener: PacketOpener,
    sealer: PacketSealer,
    negotiated: NegotiatedAlgorithms,
    session_id: Vec<u8>,
    client_version: String,
    server_version: String,
    strict: bool,
}

impl ServerConn {
    async fn recv(&mut self) -> SkiffResult<Vec<u8>> {
        Ok(self.opener.read_packet(&mut self.read).await?.payload)
    }

    async fn send(&mut self, payload: Vec<u8>) -> SkiffResult<()> {
        let wire = self.sealer.seal(&payload)?;
        self.write.write_all(&wire).await.map_err(SkiffError::Io)?;
        self.write.flush().await.map_err(SkiffError::Io)?;
        Ok(())
    }
}

fn sha256(data: &[u8]) -> Vec<u8> {
    sha2::Sha256::digest(data).to_vec()
}

/// Runs the server half of version exchange and one curve25519 kex.
async fn server_handshake(stream: DuplexStream, opts: ServerOptions) -> SkiffResult<ServerConn> {
    let (mut read, mut write) = tokio::io::split(stream);

    // Identification, preceded by optional banner lines.
    for banner in &opts.banners {
        write
            .write_all(format!("{}\r\n", banner).as_bytes())
            .await
            .map_err(SkiffError::Io)?;
    }
    let server_version = "SSH-2.0-ScriptedServer_1.0";
    write
        .write_all(format!("{}\r\n", server_version).as_bytes())
        .await
        .map_err(SkiffError::Io)?;

    let mut client_version = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        read.read_exact(&mut byte).await.map_err(SkiffError::Io)?;
        if byte[0] == b'\n' {
            break;
        }
        if byte[0] != b'\r' {
            client_version.push(byte[0]);
        }
    }
    let client_version = String::from_utf8(client_version).expect("ascii ident");

    let mut opener = PacketOpener::new();
    let mut sealer = PacketSealer::new();

    // KEXINIT exchange.
    if opts.ignore_before_kexinit {
        let ignore = skiff_proto::ssh::message::ignore_message(b"padding");
        let wire_bytes = sealer.seal(&ignore)?;
        write.write_all(&wire_bytes).await.map_err(SkiffError::Io)?;
    }

    let mut catalog = opts.catalog.clone();
    if opts.strict_marker {
        catalog.kex.push(STRICT_SERVER.to_string());
    }
    let server_kexinit = KexInit::new(&catalog, false).to_bytes();
    let wire_bytes = sealer.seal(&server_kexinit)?;
    write.write_all(&wire_bytes).await.map_err(SkiffError::Io)?;

    let client_kexinit = opener.read_packet(&mut read).await?.payload;
    assert_eq!(client_kexinit[0], MessageType::KexInit as u8);

    let negotiated = negotiate(
        &KexInit::from_bytes(&client_kexinit)?,
        &KexInit::from_bytes(&server_kexinit)?,
    )?;
    assert_eq!(negotiated.kex, "curve25519-sha256");

    // SSH_MSG_KEX_ECDH_INIT
    let ecdh_init = opener.read_packet(&mut read).await?.payload;
    assert_eq!(ecdh_init[0], 30);
    let mut offset = 1;
    let q_c = wire::read_string(&ecdh_init, &mut offset)?;
    let q_c_array: [u8; 32] = q_c.as_slice().try_into().expect("x25519 key");

    let server_secret = x25519_dalek::EphemeralSecret::random_from_rng(rand::rngs::OsRng);
    let q_s = x25519_dalek::PublicKey::from(&server_secret);
    let k = server_secret
        .diffie_hellman(&x25519_dalek::PublicKey::from(q_c_array))
        .as_bytes()
        .to_vec();

    let signing_key = ed25519_dalek::SigningKey::generate(&mut rand::rngs::OsRng);
    let mut host_key_blob = BytesMut::new();
    wire::write_utf8(&mut host_key_blob, "ssh-ed25519");
    wire::write_string(&mut host_key_blob, signing_key.verifying_key().as_bytes());

    let mut hash_input = BytesMut::new();
    wire::write_utf8(&mut hash_input, &client_version);
    wire::write_utf8(&mut hash_input, server_version);
    wire::write_string(&mut hash_input, &client_kexinit);
    wire::write_string(&mut hash_input, &server_kexinit);
    wire::write_string(&mut hash_input, &host_key_blob);
    wire::write_string(&mut hash_input, &q_c);
    wire::write_string(&mut hash_input, q_s.as_bytes());
    wire::write_mpint(&mut hash_input, &k);
    let exchange_hash = sha256(&hash_input);

    let signature = signing_key.sign(&exchange_hash);
    let mut sig_blob = BytesMut::new();
    wire::write_utf8(&mut sig_blob, "ssh-ed25519");
    wire::write_string(&mut sig_blob, &signature.to_bytes());

    let mut reply = BytesMut::new();
    wire::write_u8(&mut reply, 31);
    wire::write_string(&mut reply, &host_key_blob);
    wire::write_string(&mut reply, q_s.as_bytes());
    wire::write_string(&mut reply, &sig_blob);
    let wire_bytes = sealer.seal(&reply)?;
    write.write_all(&wire_bytes).await.map_err(SkiffError::Io)?;

    // NEWKEYS both ways, then install.
    let wire_bytes = sealer.seal(&[MessageType::NewKeys as u8])?;
    write.write_all(&wire_bytes).await.map_err(SkiffError::Io)?;
    let client_newkeys = opener.read_packet(&mut read).await?.payload;
    assert_eq!(client_newkeys, vec![MessageType::NewKeys as u8]);

    let mut conn = ServerConn {
        read,
        write,
        opener,
        sealer,
        negotiated,
        session_id: exchange_hash.clone(),
        client_version,
        server_version: server_version.to_string(),
        strict: opts.strict_marker,
    };
    install_server_keys(&mut conn, &SharedSecret::Mpint(k), &exchange_hash, true)?;

    // RFC 8308: EXT_INFO as the first packet under the new keys.
    if opts.ext_info_after_newkeys {
        assert!(client_kexinit_advertises(&client_kexinit, "ext-info-c"));
        conn.send(ext_info_payload()).await?;
    }

    if opts.accept_auth {
        accept_none_auth(&mut conn).await?;
    }

    Ok(conn)
}

fn client_kexinit_advertises(client_kexinit: &[u8], name: &str) -> bool {
    KexInit::from_bytes(client_kexinit)
        .expect("client kexinit parses")
        .kex_algorithms()
        .iter()
        .any(|n| n == name)
}

fn ext_info_payload() -> Vec<u8> {
    let mut buf = BytesMut::new();
    wire::write_u8(&mut buf, MessageType::ExtInfo as u8);
    wire::write_u32(&mut buf, 1);
    wire::write_utf8(&mut buf, "server-sig-algs");
    wire::write_utf8(&mut buf, "ssh-ed25519");
    buf.to_vec()
}

fn install_server_keys(
    conn: &mut ServerConn,
    shared: &SharedSecret,
    exchange_hash: &[u8],
    initial: bool,
) -> SkiffResult<()> {
    let km = derive_key_material(
        &sha256,
        shared,
        exchange_hash,
        &conn.session_id,
        &conn.negotiated,
    );

    // Directions are swapped relative to the client.
    let seal_cipher = Cipher::new(
        conn.negotiated.cipher_s2c,
        CipherDirection::Encrypt,
        &km.enc_s2c,
        &km.iv_s2c,
    )?;
    let open_cipher = Cipher::new(
        conn.negotiated.cipher_c2s,
        CipherDirection::Decrypt,
        &km.enc_c2s,
        &km.iv_c2s,
    )?;
    let seal_mac = match conn.negotiated.mac_s2c {
        Some(alg) => Some(MacKey::new(alg, &km.mac_s2c)?),
        None => None,
    };
    let open_mac = match conn.negotiated.mac_c2s {
        Some(alg) => Some(MacKey::new(alg, &km.mac_c2s)?),
        None => None,
    };

    let (compressor, decompressor) = if initial {
        (
            Some(Compressor::new(conn.negotiated.compression_s2c)),
            Some(Decompressor::new(conn.negotiated.compression_c2s)),
        )
    } else {
        (None, None)
    };

    conn.sealer.install(Some(seal_cipher), seal_mac, compressor);
    conn.opener.install(Some(open_cipher), open_mac, decompressor);
    if conn.strict {
        conn.sealer.reset_seq();
        conn.opener.reset_seq();
    }
    conn.sealer.mark_initial_kex_complete();
    conn.opener.mark_initial_kex_complete();
    Ok(())
}

/// Accepts `ssh-userauth` and a "none" authentication request.
async fn accept_none_auth(conn: &mut ServerConn) -> SkiffResult<()> {
    let service_request = conn.recv().await?;
    assert_eq!(service_request[0], MessageType::ServiceRequest as u8);

    let mut accept = BytesMut::new();
    wire::write_u8(&mut accept, MessageType::ServiceAccept as u8);
    wire::write_utf8(&mut accept, "ssh-userauth");
    conn.send(accept.to_vec()).await?;

    let auth_request = conn.recv().await?;
    assert_eq!(auth_request[0], MessageType::UserauthRequest as u8);
    conn.send(vec![MessageType::UserauthSuccess as u8]).await?;
    Ok(())
}

/// Answers one client-initiated rekey (curve25519 again).
async fn server_handle_rekey(conn: &mut ServerConn) -> SkiffResult<()> {
    let client_kexinit = conn.recv().await?;
    assert_eq!(client_kexinit[0], MessageType::KexInit as u8);

    let mut catalog = AlgorithmCatalog::default();
    catalog.kex = vec!["curve25519-sha256".to_string()];
    catalog.host_key = vec!["ssh-ed25519".to_string()];
    catalog.cipher = vec![conn.negotiated.cipher_s2c.name().to_string()];
    catalog.mac = vec!["hmac-sha2-256".to_string()];
    let server_kexinit = KexInit::new(&catalog, false).to_bytes();
    conn.send(server_kexinit.clone()).await?;

    let ecdh_init = conn.recv().await?;
    assert_eq!(ecdh_init[0], 30);
    let mut offset = 1;
    let q_c = wire::read_string(&ecdh_init, &mut offset)?;
    let q_c_array: [u8; 32] = q_c.as_slice().try_into().expect("x25519 key");

    let server_secret = x25519_dalek::EphemeralSecret::random_from_rng(rand::rngs::OsRng);
    let q_s = x25519_dalek::PublicKey::from(&server_secret);
    let k = server_secret
        .diffie_hellman(&x25519_dalek::PublicKey::from(q_c_array))
        .as_bytes()
        .to_vec();

    let signing_key = ed25519_dalek::SigningKey::generate(&mut rand::rngs::OsRng);
    let mut host_key_blob = BytesMut::new();
    wire::write_utf8(&mut host_key_blob, "ssh-ed25519");
    wire::write_string(&mut host_key_blob, signing_key.verifying_key().as_bytes());

    let mut hash_input = BytesMut::new();
    wire::write_utf8(&mut hash_input, &conn.client_version);
    wire::write_utf8(&mut hash_input, &conn.server_version);
    wire::write_string(&mut hash_input, &client_kexinit);
    wire::write_string(&mut hash_input, &server_kexinit);
    wire::write_string(&mut hash_input, &host_key_blob);
    wire::write_string(&mut hash_input, &q_c);
    wire::write_string(&mut hash_input, q_s.as_bytes());
    wire::write_mpint(&mut hash_input, &k);
    let exchange_hash = sha256(&hash_input);

    let signature = signing_key.sign(&exchange_hash);
    let mut sig_blob = BytesMut::new();
    wire::write_utf8(&mut sig_blob, "ssh-ed25519");
    wire::write_string(&mut sig_blob, &signature.to_bytes());

    let mut reply = BytesMut::new();
    wire::write_u8(&mut reply, 31);
    wire::write_string(&mut reply, &host_key_blob);
    wire::write_string(&mut reply, q_s.as_bytes());
    wire::write_string(&mut reply, &sig_blob);
    conn.send(reply.to_vec()).await?;

    conn.send(vec![MessageType::NewKeys as u8]).await?;
    let client_newkeys = conn.recv().await?;
    assert_eq!(client_newkeys, vec![MessageType::NewKeys as u8]);

    install_server_keys(conn, &SharedSecret::Mpint(k), &exchange_hash, false)?;
    Ok(())
}

fn client_config() -> SshClientConfig {
    let mut config = SshClientConfig::default();
    config.operation_timeout = Duration::from_secs(5);
    config
}

async fn connect_pair(
    opts: ServerOptions,
    config: SshClientConfig,
) -> (SkiffResult<SshClient>, tokio::task::JoinHandle<SkiffResult<ServerConn>>) {
    let (client_stream, server_stream) = tokio::io::duplex(1 << 20);
    let server = tokio::spawn(server_handshake(server_stream, opts));
    let (read, write) = tokio::io::split(client_stream);
    let client = timeout(
        Duration::from_secs(10),
        SshClient::connect_on_stream(Box::new(read), Box::new(write), config),
    )
    .await
    .expect("connect must not hang");
    (client, server)
}

/// Version line tolerance: banner lines before the identification are
/// skipped and surfaced.
#[tokio::test]
async fn test_connect_with_banner_lines() {
    let opts = ServerOptions {
        banners: vec!["Hello", "Welcome to example.org"],
        ..Default::default()
    };
    let (client, server) = connect_pair(opts, client_config()).await;
    let client = client.expect("connect succeeds despite banner");
    assert_eq!(
        client.banners(),
        &["Hello".to_string(), "Welcome to example.org".to_string()]
    );
    assert_eq!(client.server_version().software(), "ScriptedServer_1.0");
    assert!(client.session_id().is_some());
    server.await.unwrap().expect("server side completes");
}

/// Algorithm selection: the first client-preferred cipher present in
/// the server's offer wins. The server derives keys for aes128-ctr; a
/// wrong selection would fail the MAC on the first encrypted packet.
#[tokio::test]
async fn test_algorithm_selection_first_client_match() {
    let mut opts = ServerOptions::default();
    opts.catalog.cipher = vec!["aes256-ctr".to_string(), "aes128-ctr".to_string()];
    let (client, server) = connect_pair(opts, client_config()).await;
    let client = client.expect("connect succeeds");
    let mut conn = server.await.unwrap().expect("server side completes");
    assert_eq!(conn.negotiated.cipher_c2s.name(), "aes128-ctr");

    // Prove the negotiated keys interoperate.
    let client_handle = tokio::spawn(async move {
        let channel = client.open_session_channel().await.expect("open channel");
        (client, channel)
    });
    let open = conn.recv().await.unwrap();
    assert_eq!(open[0], MessageType::ChannelOpen as u8);
    let mut offset = 1;
    let _type = wire::read_string(&open, &mut offset).unwrap();
    let sender = wire::read_u32(&open, &mut offset).unwrap();
    let mut confirm = BytesMut::new();
    wire::write_u8(&mut confirm, MessageType::ChannelOpenConfirmation as u8);
    wire::write_u32(&mut confirm, sender);
    wire::write_u32(&mut confirm, 7);
    wire::write_u32(&mut confirm, 1 << 20);
    wire::write_u32(&mut confirm, 32768);
    conn.send(confirm.to_vec()).await.unwrap();

    let (_client, channel) = client_handle.await.unwrap();
    assert_eq!(channel.remote_id(), 7);
}

/// Strict KEX: the server's KEXINIT must be the very first packet.
#[tokio::test]
async fn test_strict_kexinit_after_ignore_fails() {
    let opts = ServerOptions {
        strict_marker: true,
        ignore_before_kexinit: true,
        ..Default::default()
    };
    let (client, server) = connect_pair(opts, client_config()).await;
    let err = client.err().expect("strict violation must fail connect");
    assert!(matches!(err, SkiffError::KexFailed(_)), "got {:?}", err);
    let _ = server.await;
}

/// Strict KEX: sequence numbers reset to zero after NEWKEYS. The
/// scripted server resets its own counters; traffic only flows if the
/// client does too.
#[tokio::test]
async fn test_strict_kex_sequence_reset() {
    let opts = ServerOptions {
        strict_marker: true,
        ..Default::default()
    };
    let (client, server) = connect_pair(opts, client_config()).await;
    let client = client.expect("strict connect succeeds");
    let mut conn = server.await.unwrap().expect("server side completes");
    assert_eq!(conn.sealer.seq(), 0);
    assert_eq!(conn.opener.seq(), 0);

    // Exchange one round of global-request traffic under the reset
    // sequence numbers (HMAC binds the sequence number, so any skew
    // would be a MAC failure).
    let client_handle =
        tokio::spawn(async move { client.global_request("test@skiff", true, vec![]).await });
    let request = conn.recv().await.unwrap();
    assert_eq!(request[0], MessageType::GlobalRequest as u8);
    conn.send(vec![MessageType::RequestSuccess as u8])
        .await
        .unwrap();
    assert!(client_handle.await.unwrap().unwrap());
}

/// Unknown message numbers are answered with UNIMPLEMENTED carrying the
/// offending sequence number.
#[tokio::test]
async fn test_unknown_message_answered_with_unimplemented() {
    let (client, server) = connect_pair(ServerOptions::default(), client_config()).await;
    let _client = client.expect("connect succeeds");
    let mut conn = server.await.unwrap().expect("server side completes");

    let seq_of_bogus = conn.sealer.seq();
    conn.send(vec![200]).await.unwrap();

    let reply = conn.recv().await.unwrap();
    assert_eq!(reply[0], MessageType::Unimplemented as u8);
    let mut offset = 1;
    assert_eq!(wire::read_u32(&reply, &mut offset).unwrap(), seq_of_bogus);
}

/// EOF and CLOSE leave the wire in order after the last data packet,
/// and the channel handle is released only after the peer's CLOSE.
#[tokio::test]
async fn test_channel_data_eof_close_ordering() {
    let (client, server) = connect_pair(ServerOptions::default(), client_config()).await;
    let client = client.expect("connect succeeds");
    let mut conn = server.await.unwrap().expect("server side completes");

    let client_handle = tokio::spawn(async move {
        let channel = client.open_session_channel().await.expect("open channel");
        channel.write(b"one hundred bytes of payload").await.unwrap();
        channel.close().await.unwrap();
        (client, channel)
    });

    // CHANNEL_OPEN -> confirmation.
    let open = conn.recv().await.unwrap();
    assert_eq!(open[0], MessageType::ChannelOpen as u8);
    let mut offset = 1;
    let _type = wire::read_string(&open, &mut offset).unwrap();
    let sender = wire::read_u32(&open, &mut offset).unwrap();
    let mut confirm = BytesMut::new();
    wire::write_u8(&mut confirm, MessageType::ChannelOpenConfirmation as u8);
    wire::write_u32(&mut confirm, sender);
    wire::write_u32(&mut confirm, 3);
    wire::write_u32(&mut confirm, 1 << 20);
    wire::write_u32(&mut confirm, 32768);
    conn.send(confirm.to_vec()).await.unwrap();

    // DATA, then EOF, then CLOSE, in exactly that order.
    let data = conn.recv().await.unwrap();
    assert_eq!(data[0], MessageType::ChannelData as u8);
    let eof = conn.recv().await.unwrap();
    assert_eq!(eof[0], MessageType::ChannelEof as u8);
    let close = conn.recv().await.unwrap();
    assert_eq!(close[0], MessageType::ChannelClose as u8);

    // The close() call must still be pending until our CLOSE crosses.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!client_handle.is_finished());

    let mut close_reply = BytesMut::new();
    wire::write_u8(&mut close_reply, MessageType::ChannelClose as u8);
    wire::write_u32(&mut close_reply, sender);
    conn.send(close_reply.to_vec()).await.unwrap();

    let (_client, channel) = client_handle.await.unwrap();
    assert_eq!(
        channel.state(),
        skiff_proto::ssh::channel::ChannelState::Closed
    );
}

/// A server-sent DISCONNECT surfaces as the session's fatal error.
#[tokio::test]
async fn test_server_disconnect_surfaces() {
    let (client, server) = connect_pair(ServerOptions::default(), client_config()).await;
    let client = client.expect("connect succeeds");
    let mut conn = server.await.unwrap().expect("server side completes");

    let mut disconnect = BytesMut::new();
    wire::write_u8(&mut disconnect, MessageType::Disconnect as u8);
    wire::write_u32(&mut disconnect, 11);
    wire::write_utf8(&mut disconnect, "bye");
    wire::write_utf8(&mut disconnect, "");
    conn.send(disconnect.to_vec()).await.unwrap();

    // The failing receive task must unblock new operations.
    let result = timeout(Duration::from_secs(5), client.open_session_channel()).await;
    assert!(result.expect("must not hang").is_err());
    assert!(client.last_error().expect("fatal recorded").contains("bye"));
}

/// Client-initiated rekey: new keys on both sides, session id frozen.
#[tokio::test]
async fn test_rekey_completes_and_traffic_continues() {
    let (client, server) = connect_pair(ServerOptions::default(), client_config()).await;
    let client = client.expect("connect succeeds");
    let mut conn = server.await.unwrap().expect("server side completes");

    let session_id_before = client.session_id().unwrap();

    let rekey_client = tokio::spawn(async move {
        client.rekey().await.expect("rekey completes");
        client
    });
    server_handle_rekey(&mut conn).await.expect("server rekey");
    let client = rekey_client.await.unwrap();

    assert_eq!(client.session_id().unwrap(), session_id_before);

    // Traffic still flows under the new keys.
    let client_handle =
        tokio::spawn(async move { client.global_request("probe@skiff", true, vec![]).await });
    let request = conn.recv().await.unwrap();
    assert_eq!(request[0], MessageType::GlobalRequest as u8);
    conn.send(vec![MessageType::RequestFailure as u8])
        .await
        .unwrap();
    assert!(!client_handle.await.unwrap().unwrap());
}

/// The authenticator hook runs between transport and connection
/// protocol.
#[tokio::test]
async fn test_none_authenticator_roundtrip() {
    let opts = ServerOptions {
        accept_auth: true,
        ..Default::default()
    };
    let mut config = client_config();
    config.authenticator = Some(Box::new(NoneAuthenticator {
        username: "skiff".to_string(),
    }));
    let (client, server) = connect_pair(opts, config).await;
    let client = client.expect("authenticated connect succeeds");
    server.await.unwrap().expect("server side completes");
    assert!(client.session_id().is_some());
}

/// The host-key veto callback aborts the connection before NEWKEYS.
#[tokio::test]
async fn test_host_key_veto_aborts() {
    let mut config = client_config();
    config.host_key_callback = Some(Box::new(|algorithm, _blob| {
        assert_eq!(algorithm, "ssh-ed25519");
        false
    }));
    let (client, server) = connect_pair(ServerOptions::default(), config).await;
    let err = client.err().expect("vetoed connect must fail");
    assert!(matches!(err, SkiffError::KexFailed(_)));
    let _ = server.await;
}

/// ChaCha20-Poly1305 negotiation: AEAD suppresses the MAC slot and the
/// record layer still interoperates.
#[tokio::test]
async fn test_chacha20_poly1305_transport() {
    let mut opts = ServerOptions::default();
    opts.catalog.cipher = vec!["chacha20-poly1305@openssh.com".to_string()];
    opts.catalog.mac = vec![];
    let mut config = client_config();
    config.transport.catalog.cipher = vec!["chacha20-poly1305@openssh.com".to_string()];

    let (client, server) = connect_pair(opts, config).await;
    let client = client.expect("chacha connect succeeds");
    let mut conn = server.await.unwrap().expect("server side completes");
    assert!(conn.negotiated.mac_c2s.is_none());

    let client_handle =
        tokio::spawn(async move { client.global_request("probe@skiff", true, vec![]).await });
    let request = conn.recv().await.unwrap();
    assert_eq!(request[0], MessageType::GlobalRequest as u8);
    conn.send(vec![MessageType::RequestSuccess as u8])
        .await
        .unwrap();
    assert!(client_handle.await.unwrap().unwrap());
}

/// ETM MACs keep the length field cleartext but authenticated.
#[tokio::test]
async fn test_etm_mac_transport() {
    let mut opts = ServerOptions::default();
    opts.catalog.mac = vec!["hmac-sha2-256-etm@openssh.com".to_string()];
    let mut config = client_config();
    config.transport.catalog.mac = vec!["hmac-sha2-256-etm@openssh.com".to_string()];

    let (client, server) = connect_pair(opts, config).await;
    let client = client.expect("etm connect succeeds");
    let mut conn = server.await.unwrap().expect("server side completes");

    let client_handle =
        tokio::spawn(async move { client.global_request("probe@skiff", true, vec![]).await });
    let request = conn.recv().await.unwrap();
    assert_eq!(request[0], MessageType::GlobalRequest as u8);
    conn.send(vec![MessageType::RequestSuccess as u8])
        .await
        .unwrap();
    assert!(client_handle.await.unwrap().unwrap());
}

/// Inbound channel data is delivered through the channel handle.
#[tokio::test]
async fn test_inbound_channel_data() {
    let (client, server) = connect_pair(ServerOptions::default(), client_config()).await;
    let client = client.expect("connect succeeds");
    let mut conn = server.await.unwrap().expect("server side completes");

    let client_handle = tokio::spawn(async move {
        let channel = client.open_session_channel().await.expect("open channel");
        let data = channel.read().await.expect("read");
        (client, data)
    });

    let open = conn.recv().await.unwrap();
    let mut offset = 1;
    let _type = wire::read_string(&open, &mut offset).unwrap();
    let sender = wire::read_u32(&open, &mut offset).unwrap();
    let mut confirm = BytesMut::new();
    wire::write_u8(&mut confirm, MessageType::ChannelOpenConfirmation as u8);
    wire::write_u32(&mut confirm, sender);
    wire::write_u32(&mut confirm, 0);
    wire::write_u32(&mut confirm, 1 << 20);
    wire::write_u32(&mut confirm, 32768);
    conn.send(confirm.to_vec()).await.unwrap();

    let mut data = BytesMut::new();
    wire::write_u8(&mut data, MessageType::ChannelData as u8);
    wire::write_u32(&mut data, sender);
    wire::write_string(&mut data, b"remote says hi");
    conn.send(data.to_vec()).await.unwrap();

    let (_client, received) = client_handle.await.unwrap();
    assert_eq!(received, Some(b"remote says hi".to_vec()));
}

/// EXT_INFO arriving between the server's NEWKEYS and SERVICE_ACCEPT is
/// skipped, not treated as a protocol error.
#[tokio::test]
async fn test_ext_info_before_service_accept() {
    let opts = ServerOptions {
        accept_auth: true,
        ext_info_after_newkeys: true,
        ..Default::default()
    };
    let mut config = client_config();
    config.authenticator = Some(Box::new(NoneAuthenticator {
        username: "skiff".to_string(),
    }));
    let (client, server) = connect_pair(opts, config).await;
    let client = client.expect("connect survives EXT_INFO before SERVICE_ACCEPT");
    server.await.unwrap().expect("server side completes");
    assert!(client.session_id().is_some());
}

/// Without an authenticator the post-NEWKEYS EXT_INFO reaches the
/// receive task, which must tolerate it and keep dispatching.
#[tokio::test]
async fn test_ext_info_without_authenticator() {
    let opts = ServerOptions {
        ext_info_after_newkeys: true,
        ..Default::default()
    };
    let (client, server) = connect_pair(opts, client_config()).await;
    let client = client.expect("connect succeeds");
    let mut conn = server.await.unwrap().expect("server side completes");

    // Traffic after the tolerated EXT_INFO proves the transport is
    // still healthy.
    let client_handle =
        tokio::spawn(async move { client.global_request("probe@skiff", true, vec![]).await });
    let request = conn.recv().await.unwrap();
    assert_eq!(request[0], MessageType::GlobalRequest as u8);
    conn.send(vec![MessageType::RequestSuccess as u8])
        .await
        .unwrap();
    assert!(client_handle.await.unwrap().unwrap());
}
