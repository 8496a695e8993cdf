//! SSH client session surface.
//!
//! [`SshClient::connect`] performs the full establishment sequence:
//!
//! 1. TCP connection (or any supplied byte stream)
//! 2. identification exchange with banner tolerance
//! 3. initial key exchange, host-key verification and veto callback
//! 4. the `ssh-userauth` service request and the configured
//!    [`Authenticator`]
//! 5. connection protocol: channels, global requests, keepalive
//!
//! # Concurrency model
//!
//! A single writer task owns the outbound record layer and the write
//! half of the stream, so packets leave the socket in sequence-number
//! order no matter how many callers race. A single receive task owns
//! the inbound record layer and dispatches strictly in arrival order.
//! Every blocking wait also watches the session's fatal-error channel,
//! so a dying transport unblocks all waiters.
//!
//! Rekeys may be initiated by either side at any time; while one is in
//! flight the writer holds back non-kex packets, which satisfies the
//! strict-KEX rule that only kex messages cross between KEXINIT and
//! NEWKEYS.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use skiff_platform::{SkiffError, SkiffResult};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch, Notify, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::ssh::auth::{AuthExchange, AuthOutcome, Authenticator};
use crate::ssh::channel::{Channel, ChannelShared};
use crate::ssh::compress::{Compressor, Decompressor};
use crate::ssh::connection::{
    channel_failure, channel_open_failure, request_failure, ChannelData, ChannelExtendedData,
    ChannelOpen, ChannelOpenConfirmation, ChannelOpenFailure, ChannelOpenFailureReason,
    ChannelRequest, ChannelType, ChannelWindowAdjust, GlobalRequest,
};
use crate::ssh::crypto::{Cipher, CipherDirection, MacKey};
use crate::ssh::hostkey::{self, HostKeyAlgorithm};
use crate::ssh::kex::{newkeys_payload, KexDriver, KexInit, KexOutcome, KexProgress};
use crate::ssh::keys::derive_key_material;
use crate::ssh::message::{
    DebugMsg, Disconnect, DisconnectReason, MessageType, ServiceAccept, ServiceRequest,
    Unimplemented,
};
use crate::ssh::packet::{PacketOpener, PacketSealer};
use crate::ssh::session::KeepaliveTask;
use crate::ssh::transport::{State, TransportConfig, TransportState};
use crate::ssh::version::{read_identification, Version};

/// Boxed read half of the session's byte stream.
pub(crate) type IoReader = Box<dyn AsyncRead + Send + Unpin>;
/// Boxed write half of the session's byte stream.
pub(crate) type IoWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Host-key veto callback: `(algorithm name, key blob) -> accept`.
pub type HostKeyCallback = Box<dyn Fn(&str, &[u8]) -> bool + Send + Sync>;
/// Banner callback, invoked for pre-auth banners.
pub type BannerCallback = Box<dyn Fn(&str) + Send + Sync>;

/// Commands consumed by the writer task, in submission order.
pub(crate) enum Outbound {
    /// Seal and write one payload. Packets flagged `during_kex` bypass
    /// the rekey hold-back.
    Packet {
        /// Message payload (uncompressed, unframed).
        payload: Vec<u8>,
        /// Whether this packet belongs to an ongoing key exchange.
        during_kex: bool,
    },
    /// Start holding back non-kex packets.
    BeginKex,
    /// Install freshly derived outbound keys.
    InstallSeal {
        cipher: Box<Cipher>,
        mac: Option<MacKey>,
        compressor: Option<Compressor>,
    },
    /// Reset the outbound sequence number (strict-KEX).
    ResetSealSeq,
    /// Key exchange finished: release held packets.
    EndKex {
        /// True for the first exchange of the session.
        initial: bool,
    },
    /// Activate delayed outbound compression (auth success).
    ActivateCompression,
    /// Flush and stop the writer.
    Shutdown,
}

impl Outbound {
    pub(crate) fn kind(&self) -> &'static str {
        match self {
            Outbound::Packet { .. } => "packet",
            Outbound::BeginKex => "begin-kex",
            Outbound::InstallSeal { .. } => "install-seal",
            Outbound::ResetSealSeq => "reset-seal-seq",
            Outbound::EndKex { .. } => "end-kex",
            Outbound::ActivateCompression => "activate-compression",
            Outbound::Shutdown => "shutdown",
        }
    }
}

/// Handle for submitting work to the writer task.
#[derive(Clone)]
pub(crate) struct PacketSink {
    tx: mpsc::UnboundedSender<Outbound>,
}

impl PacketSink {
    pub(crate) fn new(tx: mpsc::UnboundedSender<Outbound>) -> Self {
        Self { tx }
    }

    /// Queues an ordinary packet.
    pub(crate) fn send_packet(&self, payload: Vec<u8>) -> SkiffResult<()> {
        self.command(Outbound::Packet {
            payload,
            during_kex: false,
        })
    }

    /// Queues a kex-class packet, exempt from the rekey hold-back.
    pub(crate) fn send_kex_packet(&self, payload: Vec<u8>) -> SkiffResult<()> {
        self.command(Outbound::Packet {
            payload,
            during_kex: true,
        })
    }

    pub(crate) fn command(&self, cmd: Outbound) -> SkiffResult<()> {
        self.tx
            .send(cmd)
            .map_err(|_| SkiffError::ConnectionLost)
    }
}

/// Keys produced by one completed key exchange.
struct NewKeysSet {
    seal_cipher: Box<Cipher>,
    seal_mac: Option<MacKey>,
    seal_compressor: Option<Compressor>,
    open_cipher: Box<Cipher>,
    open_mac: Option<MacKey>,
    open_decompressor: Option<Decompressor>,
    strict: bool,
}

/// Key exchange progress as seen by the receive loop.
enum KexState {
    /// No exchange in flight.
    Idle,
    /// We sent KEXINIT and await the peer's.
    Init { our_kexinit: Vec<u8> },
    /// Both KEXINITs exchanged, method running.
    Exchanging(Box<KexDriver>),
    /// Our NEWKEYS is out; waiting for the peer's to install these.
    AwaitNewKeys {
        open_cipher: Box<Cipher>,
        open_mac: Option<MacKey>,
        open_decompressor: Option<Decompressor>,
        strict: bool,
    },
}

impl KexState {
    fn is_idle(&self) -> bool {
        matches!(self, KexState::Idle)
    }
}

/// SSH client configuration.
pub struct SshClientConfig {
    /// Transport configuration: identification, catalogue, rekey limits.
    pub transport: TransportConfig,
    /// Budget for the whole connect sequence.
    pub connect_timeout: Duration,
    /// Budget for per-operation waits (service accept, channel open,
    /// channel request replies).
    pub operation_timeout: Duration,
    /// Interval for keepalive global requests; `None` disables them.
    pub keepalive_interval: Option<Duration>,
    /// Host-key veto callback. `None` accepts any verified host key.
    pub host_key_callback: Option<HostKeyCallback>,
    /// Callback for authentication banners and pre-identification
    /// banner lines.
    pub banner_callback: Option<BannerCallback>,
    /// The authenticator to run after the transport is up. `None` skips
    /// user authentication entirely.
    pub authenticator: Option<Box<dyn Authenticator>>,
}

impl Default for SshClientConfig {
    fn default() -> Self {
        Self {
            transport: TransportConfig::default(),
            connect_timeout: Duration::from_secs(30),
            operation_timeout: Duration::from_secs(30),
            keepalive_interval: None,
            host_key_callback: None,
            banner_callback: None,
            authenticator: None,
        }
    }
}

// Manual Debug: the callbacks and authenticator are not Debug.
impl std::fmt::Debug for SshClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshClientConfig")
            .field("transport", &self.transport)
            .field("connect_timeout", &self.connect_timeout)
            .field("operation_timeout", &self.operation_timeout)
            .field("keepalive_interval", &self.keepalive_interval)
            .field(
                "host_key_callback",
                &self.host_key_callback.as_ref().map(|_| "<callback>"),
            )
            .field(
                "banner_callback",
                &self.banner_callback.as_ref().map(|_| "<callback>"),
            )
            .field(
                "authenticator",
                &self.authenticator.as_ref().map(|_| "<authenticator>"),
            )
            .finish()
    }
}

/// Shared session state.
pub(crate) struct SessionInner {
    sink: PacketSink,
    state: Mutex<TransportState>,
    channels: Mutex<HashMap<u32, Arc<ChannelShared>>>,
    next_channel_id: AtomicU32,
    channel_slots: Arc<Semaphore>,
    global_replies: Mutex<VecDeque<oneshot::Sender<bool>>>,
    kex: Mutex<KexState>,
    rekey_done: Notify,
    fatal_tx: watch::Sender<Option<Arc<SkiffError>>>,
    fatal_rx: watch::Receiver<Option<Arc<SkiffError>>>,
    incoming_tx: mpsc::UnboundedSender<Channel>,
    client_version: String,
    server_version: String,
    host_key_callback: Option<HostKeyCallback>,
    operation_timeout: Duration,
}

impl SessionInner {
    /// Records a fatal error, moves to `Closing`, and wakes all waiters.
    fn fail(&self, error: SkiffError, disconnect: Option<DisconnectReason>) {
        if self.fatal_rx.borrow().is_some() {
            return;
        }
        warn!(error = %error, "transport failure");
        if let Some(reason) = disconnect {
            let msg = Disconnect::new(reason, &error.to_string());
            let _ = self.sink.send_kex_packet(msg.to_bytes());
        }
        let _ = self.sink.command(Outbound::Shutdown);
        {
            let mut state = self.state.lock().expect("state lock");
            let _ = state.transition(State::Closing);
        }
        let _ = self.fatal_tx.send(Some(Arc::new(error)));
        self.rekey_done.notify_waiters();
    }

    fn fatal_error(&self) -> Option<SkiffError> {
        self.fatal_rx
            .borrow()
            .as_ref()
            .map(|e| SkiffError::Protocol(e.to_string()))
    }

    /// Verifies the kex outcome and derives both directions' keys.
    fn build_new_keys(
        &self,
        driver: &KexDriver,
        outcome: &KexOutcome,
        initial: bool,
    ) -> SkiffResult<NewKeysSet> {
        let negotiated = driver.negotiated();

        let algorithm = HostKeyAlgorithm::from_name(&negotiated.host_key).ok_or_else(|| {
            SkiffError::KexFailed(format!(
                "no implementation for host key algorithm {}",
                negotiated.host_key
            ))
        })?;
        hostkey::verify_signature(
            algorithm,
            &outcome.host_key_blob,
            &outcome.signature_blob,
            &outcome.exchange_hash,
        )?;

        // The application's veto runs synchronously, before NEWKEYS goes
        // out.
        if let Some(cb) = &self.host_key_callback {
            if !cb(algorithm.name(), &outcome.host_key_blob) {
                return Err(SkiffError::KexFailed(
                    "host key rejected by application".to_string(),
                ));
            }
        }

        let (session_id, strict, auth_complete) = {
            let mut state = self.state.lock().expect("state lock");
            if initial && driver.server_strict() {
                state.enable_strict_kex();
            }
            state.set_session_id(&outcome.exchange_hash);
            (
                state.session_id().expect("session id just set").to_vec(),
                state.strict_kex(),
                state.auth_complete(),
            )
        };

        let hash = move |data: &[u8]| driver.hash(data);
        let km = derive_key_material(
            &hash,
            &outcome.shared_secret,
            &outcome.exchange_hash,
            &session_id,
            negotiated,
        );

        let seal_cipher = Cipher::new(
            negotiated.cipher_c2s,
            CipherDirection::Encrypt,
            &km.enc_c2s,
            &km.iv_c2s,
        )?;
        let open_cipher = Cipher::new(
            negotiated.cipher_s2c,
            CipherDirection::Decrypt,
            &km.enc_s2c,
            &km.iv_s2c,
        )?;
        let seal_mac = match negotiated.mac_c2s {
            Some(alg) => Some(MacKey::new(alg, &km.mac_c2s)?),
            None => None,
        };
        let open_mac = match negotiated.mac_s2c {
            Some(alg) => Some(MacKey::new(alg, &km.mac_s2c)?),
            None => None,
        };

        // Compression streams survive rekeys: fresh ones are created
        // only on the initial exchange (delayed activation happens at
        // auth success).
        let (seal_compressor, open_decompressor) = if initial {
            let mut compressor = Compressor::new(negotiated.compression_c2s);
            let mut decompressor = Decompressor::new(negotiated.compression_s2c);
            if auth_complete {
                compressor.activate();
                decompressor.activate();
            }
            (Some(compressor), Some(decompressor))
        } else {
            (None, None)
        };

        Ok(NewKeysSet {
            seal_cipher: Box::new(seal_cipher),
            seal_mac,
            seal_compressor,
            open_cipher: Box::new(open_cipher),
            open_mac,
            open_decompressor,
            strict,
        })
    }

    /// Pushes our NEWKEYS and the outbound half of a key set; returns
    /// the state that waits for the peer's NEWKEYS.
    fn emit_newkeys(&self, set: NewKeysSet, initial: bool) -> SkiffResult<KexState> {
        self.sink.send_kex_packet(newkeys_payload())?;
        self.sink.command(Outbound::InstallSeal {
            cipher: set.seal_cipher,
            mac: set.seal_mac,
            compressor: set.seal_compressor,
        })?;
        if set.strict {
            self.sink.command(Outbound::ResetSealSeq)?;
        }
        self.sink.command(Outbound::EndKex { initial })?;
        Ok(KexState::AwaitNewKeys {
            open_cipher: set.open_cipher,
            open_mac: set.open_mac,
            open_decompressor: set.open_decompressor,
            strict: set.strict,
        })
    }

    /// Begins a client-initiated rekey.
    fn start_rekey(&self) -> SkiffResult<()> {
        let mut kex = self.kex.lock().expect("kex lock");
        if !kex.is_idle() {
            return Err(SkiffError::KexFailed(
                "key exchange already in progress".to_string(),
            ));
        }
        {
            let mut state = self.state.lock().expect("state lock");
            state.transition(State::Rekey)?;
        }
        let our_kexinit = {
            let state = self.state.lock().expect("state lock");
            KexInit::new(&state.config().catalog, false).to_bytes()
        };
        self.sink.command(Outbound::BeginKex)?;
        self.sink.send_kex_packet(our_kexinit.clone())?;
        *kex = KexState::Init { our_kexinit };
        debug!("rekey initiated");
        Ok(())
    }

    /// Sends a global request, optionally waiting for the FIFO-matched
    /// verdict.
    async fn global_request(
        &self,
        name: &str,
        want_reply: bool,
        payload: Vec<u8>,
    ) -> SkiffResult<bool> {
        let reply_rx = if want_reply {
            let (tx, rx) = oneshot::channel();
            self.global_replies
                .lock()
                .expect("global replies lock")
                .push_back(tx);
            Some(rx)
        } else {
            None
        };

        let msg = GlobalRequest {
            request_name: name.to_string(),
            want_reply,
            payload,
        };
        self.sink.send_packet(msg.to_bytes())?;

        match reply_rx {
            None => Ok(true),
            Some(rx) => {
                let mut fatal = self.fatal_rx.clone();
                let wait = async move {
                    tokio::select! {
                        verdict = rx => verdict.map_err(|_| SkiffError::ConnectionLost),
                        _ = fatal.changed() => Err(SkiffError::ConnectionLost),
                    }
                };
                tokio::time::timeout(self.operation_timeout, wait)
                    .await
                    .map_err(|_| SkiffError::Timeout("global request reply".to_string()))?
            }
        }
    }
}

/// An established SSH client session.
pub struct SshClient {
    inner: Arc<SessionInner>,
    writer_task: JoinHandle<()>,
    recv_task: Option<JoinHandle<()>>,
    keepalive: Option<KeepaliveTask>,
    incoming_rx: mpsc::UnboundedReceiver<Channel>,
    server_version: Version,
    banners: Vec<String>,
}

impl SshClient {
    /// Connects with the default configuration.
    pub async fn connect(addr: &str) -> SkiffResult<Self> {
        Self::connect_with_config(addr, SshClientConfig::default()).await
    }

    /// Connects to `addr` and establishes the transport.
    pub async fn connect_with_config(addr: &str, config: SshClientConfig) -> SkiffResult<Self> {
        let connect_timeout = config.connect_timeout;
        let stream = tokio::time::timeout(connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| SkiffError::Timeout("TCP connect".to_string()))?
            .map_err(SkiffError::Io)?;
        stream.set_nodelay(true).map_err(SkiffError::Io)?;
        let (read, write) = stream.into_split();
        tokio::time::timeout(
            connect_timeout,
            Self::connect_on_stream(Box::new(read), Box::new(write), config),
        )
        .await
        .map_err(|_| SkiffError::Timeout("SSH connection establishment".to_string()))?
    }

    /// Connects with cancellation support.
    ///
    /// On cancellation the pending connection is dropped; no transport
    /// escapes in a half-open state.
    pub async fn connect_async(
        addr: &str,
        config: SshClientConfig,
        cancel: CancellationToken,
    ) -> SkiffResult<Self> {
        tokio::select! {
            result = Self::connect_with_config(addr, config) => result,
            _ = cancel.cancelled() => Err(SkiffError::Timeout("connect cancelled".to_string())),
        }
    }

    /// Establishes a session over an already-connected byte stream.
    pub async fn connect_on_stream(
        mut io_read: IoReader,
        mut io_write: IoWriter,
        mut config: SshClientConfig,
    ) -> SkiffResult<Self> {
        // 1. Identification exchange.
        let our_version = config.transport.version.clone();
        io_write
            .write_all(&our_version.to_wire_format())
            .await
            .map_err(SkiffError::Io)?;
        io_write.flush().await.map_err(SkiffError::Io)?;

        let (server_version, banners) = read_identification(&mut io_read).await?;
        if let Some(cb) = &config.banner_callback {
            for line in &banners {
                cb(line);
            }
        }
        debug!(peer = %server_version, "identification exchanged");

        // 2. Session plumbing: writer task, shared state.
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let sink = PacketSink::new(out_tx);
        let (fatal_tx, fatal_rx) = watch::channel(None);
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();

        let mut transport = TransportState::new(config.transport.clone());
        transport.set_peer_version(server_version.clone());
        transport.transition(State::Versioned)?;
        transport.transition(State::Kex)?;
        let max_channels = transport.config().max_channels;

        let inner = Arc::new(SessionInner {
            sink: sink.clone(),
            state: Mutex::new(transport),
            channels: Mutex::new(HashMap::new()),
            next_channel_id: AtomicU32::new(0),
            channel_slots: Arc::new(Semaphore::new(max_channels)),
            global_replies: Mutex::new(VecDeque::new()),
            kex: Mutex::new(KexState::Idle),
            rekey_done: Notify::new(),
            fatal_tx,
            fatal_rx,
            incoming_tx,
            client_version: our_version.to_string(),
            server_version: server_version.to_string(),
            host_key_callback: config.host_key_callback.take(),
            operation_timeout: config.operation_timeout,
        });

        let writer_task = tokio::spawn(run_writer(
            out_rx,
            PacketSealer::new(),
            io_write,
            Arc::clone(&inner),
        ));

        // 3. Initial key exchange.
        let mut opener = PacketOpener::new();
        let result = initial_kex(&inner, &mut opener, &mut io_read).await;
        if let Err(e) = result {
            inner.fail(
                SkiffError::Protocol(e.to_string()),
                Some(DisconnectReason::KeyExchangeFailed),
            );
            return Err(e);
        }

        // 4. User authentication.
        if let Some(mut authenticator) = config.authenticator.take() {
            let outcome = match authenticate(
                &inner,
                &mut opener,
                &mut io_read,
                authenticator.as_mut(),
                config.banner_callback.as_ref(),
            )
            .await
            {
                Ok(outcome) => outcome,
                Err(e) => {
                    inner.fail(
                        SkiffError::Auth(e.to_string()),
                        Some(DisconnectReason::ByApplication),
                    );
                    return Err(e);
                }
            };
            if outcome != AuthOutcome::Success {
                let err = SkiffError::Auth("authentication failed".to_string());
                inner.fail(
                    SkiffError::Auth("authentication failed".to_string()),
                    Some(DisconnectReason::NoMoreAuthMethodsAvailable),
                );
                return Err(err);
            }
            {
                let mut state = inner.state.lock().expect("state lock");
                state.set_auth_complete();
            }
            inner.sink.command(Outbound::ActivateCompression)?;
            opener.activate_compression();
        }

        // 5. Hand the read half to the receive task.
        let recv_task = tokio::spawn(run_receive_loop(Arc::clone(&inner), opener, io_read));

        let mut client = Self {
            inner,
            writer_task,
            recv_task: Some(recv_task),
            keepalive: None,
            incoming_rx,
            server_version,
            banners,
        };

        if let Some(interval) = config.keepalive_interval {
            client.start_keepalive(interval);
        }

        Ok(client)
    }

    fn start_keepalive(&mut self, interval: Duration) {
        let inner = Arc::clone(&self.inner);
        let mut task = KeepaliveTask::new(interval);
        task.start(move || {
            let inner = Arc::clone(&inner);
            async move {
                // Servers commonly answer REQUEST_FAILURE; any reply at
                // all proves liveness. A dead transport errors out.
                match inner
                    .global_request("keepalive@openssh.com", true, vec![])
                    .await
                {
                    Ok(_) => Ok(()),
                    Err(e @ SkiffError::Timeout(_)) => {
                        inner.fail(
                            SkiffError::Timeout("keepalive went unanswered".to_string()),
                            Some(DisconnectReason::ConnectionLost),
                        );
                        Err(e)
                    }
                    Err(e) => Err(e),
                }
            }
        });
        self.keepalive = Some(task);
    }

    /// Returns the server's identification.
    pub fn server_version(&self) -> &Version {
        &self.server_version
    }

    /// Returns banner lines received before the identification.
    pub fn banners(&self) -> &[String] {
        &self.banners
    }

    /// Returns the session identifier (first exchange hash).
    pub fn session_id(&self) -> Option<Vec<u8>> {
        self.inner
            .state
            .lock()
            .expect("state lock")
            .session_id()
            .map(|s| s.to_vec())
    }

    /// Returns the fatal error that tore the transport down, if any.
    pub fn last_error(&self) -> Option<String> {
        self.inner
            .fatal_rx
            .borrow()
            .as_ref()
            .map(|e| e.to_string())
    }

    /// Initiates a rekey and waits for it to complete.
    pub async fn rekey(&self) -> SkiffResult<()> {
        self.inner.start_rekey()?;
        let mut fatal = self.inner.fatal_rx.clone();
        loop {
            let notified = self.inner.rekey_done.notified();
            tokio::pin!(notified);
            if let Some(err) = self.inner.fatal_error() {
                return Err(err);
            }
            if self.inner.kex.lock().expect("kex lock").is_idle() {
                return Ok(());
            }
            tokio::select! {
                _ = &mut notified => {}
                _ = fatal.changed() => {}
            }
        }
    }

    /// Sends a global request and returns the peer's verdict.
    pub async fn global_request(
        &self,
        name: &str,
        want_reply: bool,
        payload: Vec<u8>,
    ) -> SkiffResult<bool> {
        self.inner.global_request(name, want_reply, payload).await
    }

    /// Opens a session channel.
    pub async fn open_session_channel(&self) -> SkiffResult<Channel> {
        self.open_channel(ChannelType::Session).await
    }

    /// Opens a direct-tcpip channel.
    pub async fn open_direct_tcpip(
        &self,
        host: &str,
        port: u32,
        originator_address: &str,
        originator_port: u32,
    ) -> SkiffResult<Channel> {
        self.open_channel(ChannelType::DirectTcpip {
            host: host.to_string(),
            port,
            originator_address: originator_address.to_string(),
            originator_port,
        })
        .await
    }

    /// Accepts the next server-initiated (forwarded-tcpip) channel.
    pub async fn accept_forwarded(&mut self) -> Option<Channel> {
        self.incoming_rx.recv().await
    }

    async fn open_channel(&self, channel_type: ChannelType) -> SkiffResult<Channel> {
        // The session semaphore caps concurrent channels.
        let mut fatal = self.inner.fatal_rx.clone();
        if let Some(err) = self.inner.fatal_error() {
            return Err(err);
        }
        let permit = tokio::select! {
            permit = Arc::clone(&self.inner.channel_slots).acquire_owned() => {
                permit.map_err(|_| SkiffError::ConnectionLost)?
            }
            _ = fatal.changed() => return Err(SkiffError::ConnectionLost),
        };
        if let Some(err) = self.inner.fatal_error() {
            return Err(err);
        }

        let local_id = self.inner.next_channel_id.fetch_add(1, Ordering::Relaxed);
        let shared = ChannelShared::new();
        self.inner
            .channels
            .lock()
            .expect("channels lock")
            .insert(local_id, Arc::clone(&shared));

        let open = ChannelOpen::new(channel_type, local_id);
        if let Err(e) = self.inner.sink.send_packet(open.to_bytes()) {
            self.inner
                .channels
                .lock()
                .expect("channels lock")
                .remove(&local_id);
            return Err(e);
        }

        let mut channel = Channel::new(
            local_id,
            Arc::clone(&shared),
            self.inner.sink.clone(),
            self.inner.fatal_rx.clone(),
            Some(permit),
        );
        channel.set_reply_timeout(self.inner.operation_timeout);

        let opened =
            tokio::time::timeout(self.inner.operation_timeout, channel.wait_open()).await;
        match opened {
            Ok(Ok(())) => Ok(channel),
            Ok(Err(e)) => {
                self.inner
                    .channels
                    .lock()
                    .expect("channels lock")
                    .remove(&local_id);
                Err(e)
            }
            Err(_) => {
                self.inner
                    .channels
                    .lock()
                    .expect("channels lock")
                    .remove(&local_id);
                Err(SkiffError::Timeout("channel open".to_string()))
            }
        }
    }

    /// Sends DISCONNECT, shuts the transport down, and joins the
    /// receive task.
    pub async fn disconnect(&mut self, reason: DisconnectReason, description: &str) {
        if let Some(task) = self.keepalive.as_mut() {
            task.stop();
        }
        let msg = Disconnect::new(reason, description);
        let _ = self.inner.sink.send_packet(msg.to_bytes());
        let _ = self.inner.sink.command(Outbound::Shutdown);
        {
            let mut state = self.inner.state.lock().expect("state lock");
            let _ = state.transition(State::Closing);
        }
        let _ = self.inner.fatal_tx.send(Some(Arc::new(SkiffError::Disconnected {
            code: reason as u32,
            description: description.to_string(),
        })));

        if let Some(task) = self.recv_task.take() {
            task.abort();
            let _ = task.await;
        }
        let _ = (&mut self.writer_task).await;
    }
}

impl Drop for SshClient {
    fn drop(&mut self) {
        if let Some(task) = self.recv_task.take() {
            task.abort();
        }
        self.writer_task.abort();
    }
}

impl std::fmt::Debug for SshClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshClient")
            .field("server_version", &self.server_version)
            .finish()
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// The writer task: owns the outbound record layer and write half.
async fn run_writer(
    mut rx: mpsc::UnboundedReceiver<Outbound>,
    mut sealer: PacketSealer,
    mut io: IoWriter,
    inner: Arc<SessionInner>,
) {
    let mut holding_kex = false;
    let mut held: VecDeque<Vec<u8>> = VecDeque::new();

    while let Some(cmd) = rx.recv().await {
        match cmd {
            Outbound::Packet { payload, during_kex } => {
                if holding_kex && !during_kex {
                    held.push_back(payload);
                    continue;
                }
                if let Err(e) = write_packet(&mut sealer, &mut io, &inner, payload).await {
                    inner.fail(e, None);
                    break;
                }
            }
            Outbound::BeginKex => holding_kex = true,
            Outbound::InstallSeal {
                cipher,
                mac,
                compressor,
            } => sealer.install(Some(*cipher), mac, compressor),
            Outbound::ResetSealSeq => sealer.reset_seq(),
            Outbound::EndKex { initial } => {
                if initial {
                    sealer.mark_initial_kex_complete();
                }
                holding_kex = false;
                let mut failed = false;
                while let Some(payload) = held.pop_front() {
                    if let Err(e) = write_packet(&mut sealer, &mut io, &inner, payload).await {
                        inner.fail(e, None);
                        failed = true;
                        break;
                    }
                }
                if failed {
                    break;
                }
            }
            Outbound::ActivateCompression => sealer.activate_compression(),
            Outbound::Shutdown => break,
        }
    }

    let _ = io.shutdown().await;
    debug!("writer task stopped");
}

async fn write_packet(
    sealer: &mut PacketSealer,
    io: &mut IoWriter,
    inner: &Arc<SessionInner>,
    payload: Vec<u8>,
) -> SkiffResult<()> {
    let wire = sealer.seal(&payload)?;
    io.write_all(&wire).await.map_err(SkiffError::Io)?;
    io.flush().await.map_err(SkiffError::Io)?;
    inner
        .state
        .lock()
        .expect("state lock")
        .add_bytes(wire.len() as u64);
    Ok(())
}

/// Message classes legal between KEXINIT and NEWKEYS under strict-KEX.
fn strict_kex_allows(msg_num: u8) -> bool {
    matches!(msg_num, 1 | 20 | 21 | 30..=49)
}

/// Drives the initial key exchange inline, before any task owns the
/// read half.
async fn initial_kex(
    inner: &Arc<SessionInner>,
    opener: &mut PacketOpener,
    io_read: &mut IoReader,
) -> SkiffResult<()> {
    let our_kexinit = {
        let state = inner.state.lock().expect("state lock");
        KexInit::new(&state.config().catalog, true).to_bytes()
    };
    inner.sink.command(Outbound::BeginKex)?;
    inner.sink.send_kex_packet(our_kexinit.clone())?;

    // Wait for the peer's KEXINIT, remembering its sequence number for
    // the strict-KEX first-packet rule.
    let (server_kexinit, kexinit_seq) = loop {
        let packet = opener.read_packet(io_read).await?;
        match packet.payload.first().copied() {
            Some(20) => break (packet.payload, packet.seq),
            Some(2) | Some(4) => continue, // IGNORE / DEBUG, pre-strict
            Some(other) => {
                return Err(SkiffError::Protocol(format!(
                    "expected SSH_MSG_KEXINIT, got {}",
                    other
                )))
            }
            None => return Err(SkiffError::MalformedPacket("empty packet".to_string())),
        }
    };

    let (mut driver, outgoing) = KexDriver::new(
        &inner.client_version,
        &inner.server_version,
        our_kexinit,
        server_kexinit,
        true,
    )?;

    // Strict-KEX: the server's KEXINIT must be the very first packet of
    // the connection.
    if driver.server_strict() && kexinit_seq != 0 {
        return Err(SkiffError::KexFailed(format!(
            "strict-KEX violation: KEXINIT arrived at sequence {}",
            kexinit_seq
        )));
    }
    let strict = driver.server_strict();

    for msg in outgoing {
        inner.sink.send_kex_packet(msg)?;
    }

    // Run the method to completion.
    let outcome = loop {
        let packet = opener.read_packet(io_read).await?;
        let msg_num = *packet
            .payload
            .first()
            .ok_or_else(|| SkiffError::MalformedPacket("empty packet".to_string()))?;
        match msg_num {
            30..=49 => match driver.on_message(&packet.payload)? {
                KexProgress::Continue(msgs) => {
                    for msg in msgs {
                        inner.sink.send_kex_packet(msg)?;
                    }
                }
                KexProgress::Done(outcome) => break outcome,
            },
            2 | 4 if !strict => continue,
            1 => {
                let msg = Disconnect::from_bytes(&packet.payload)?;
                return Err(SkiffError::Disconnected {
                    code: msg.reason_code,
                    description: msg.description,
                });
            }
            other => {
                return Err(SkiffError::KexFailed(format!(
                    "unexpected message {} during initial key exchange",
                    other
                )))
            }
        }
    };

    let set = inner.build_new_keys(&driver, &outcome, true)?;
    let strict = set.strict;
    let await_state = inner.emit_newkeys(set, true)?;
    let KexState::AwaitNewKeys {
        open_cipher,
        open_mac,
        open_decompressor,
        ..
    } = await_state
    else {
        unreachable!("emit_newkeys returns AwaitNewKeys");
    };

    // Wait for the peer's NEWKEYS and install the inbound keys.
    loop {
        let packet = opener.read_packet(io_read).await?;
        match packet.payload.first().copied() {
            Some(21) => break,
            Some(2) | Some(4) if !strict => continue,
            Some(1) => {
                let msg = Disconnect::from_bytes(&packet.payload)?;
                return Err(SkiffError::Disconnected {
                    code: msg.reason_code,
                    description: msg.description,
                });
            }
            Some(other) => {
                return Err(SkiffError::KexFailed(format!(
                    "expected SSH_MSG_NEWKEYS, got {}",
                    other
                )))
            }
            None => return Err(SkiffError::MalformedPacket("empty packet".to_string())),
        }
    }
    opener.install(Some(*open_cipher), open_mac, open_decompressor);
    if strict {
        opener.reset_seq();
    }
    opener.mark_initial_kex_complete();

    let mut state = inner.state.lock().expect("state lock");
    state.transition(State::Running)?;
    state.reset_rekey_tracking(now_secs());
    debug!("initial key exchange complete");
    Ok(())
}

/// Requests the `ssh-userauth` service and runs the authenticator.
async fn authenticate(
    inner: &Arc<SessionInner>,
    opener: &mut PacketOpener,
    io_read: &mut IoReader,
    authenticator: &mut dyn Authenticator,
    banner_cb: Option<&BannerCallback>,
) -> SkiffResult<AuthOutcome> {
    inner
        .sink
        .send_packet(ServiceRequest::new("ssh-userauth").to_bytes())?;

    let operation_timeout = inner.operation_timeout;
    let accept = tokio::time::timeout(operation_timeout, async {
        loop {
            let packet = opener.read_packet(io_read).await?;
            match packet.payload.first().copied() {
                Some(6) => return ServiceAccept::from_bytes(&packet.payload),
                Some(2) | Some(4) => continue,
                // RFC 8308: EXT_INFO may arrive right after NEWKEYS.
                Some(7) => {
                    debug!("ignoring SSH_MSG_EXT_INFO");
                    continue;
                }
                Some(1) => {
                    let msg = Disconnect::from_bytes(&packet.payload)?;
                    return Err(SkiffError::Disconnected {
                        code: msg.reason_code,
                        description: msg.description,
                    });
                }
                Some(other) => {
                    return Err(SkiffError::Protocol(format!(
                        "expected SSH_MSG_SERVICE_ACCEPT, got {}",
                        other
                    )))
                }
                None => return Err(SkiffError::MalformedPacket("empty packet".to_string())),
            }
        }
    })
    .await
    .map_err(|_| SkiffError::Timeout("service accept".to_string()))??;

    if accept.service != "ssh-userauth" {
        return Err(SkiffError::Protocol(format!(
            "server accepted unexpected service {}",
            accept.service
        )));
    }

    let mut exchange = AuthExchange {
        sink: &inner.sink,
        opener,
        io: io_read,
        banner_cb,
    };
    authenticator.authenticate(&mut exchange).await
}

/// The receive task: owns the inbound record layer, dispatches in
/// arrival order.
async fn run_receive_loop(inner: Arc<SessionInner>, mut opener: PacketOpener, mut io: IoReader) {
    loop {
        let packet = match opener.read_packet(&mut io).await {
            Ok(packet) => packet,
            Err(e) => {
                let reason = match &e {
                    SkiffError::MacFailure | SkiffError::Decryption(_) => {
                        Some(DisconnectReason::MacError)
                    }
                    SkiffError::ConnectionLost | SkiffError::Io(_) => None,
                    _ => Some(DisconnectReason::ProtocolError),
                };
                inner.fail(e, reason);
                break;
            }
        };

        {
            let mut state = inner.state.lock().expect("state lock");
            state.add_bytes(packet.payload.len() as u64);
        }

        if let Err(e) = dispatch(&inner, &mut opener, &packet.payload, packet.seq) {
            let fatal = e.is_fatal();
            if fatal {
                let reason = match &e {
                    SkiffError::KexFailed(_) => Some(DisconnectReason::KeyExchangeFailed),
                    // Never answer a DISCONNECT with another DISCONNECT.
                    SkiffError::Disconnected { .. } => None,
                    _ => Some(DisconnectReason::ProtocolError),
                };
                inner.fail(e, reason);
                break;
            } else {
                warn!(error = %e, "non-fatal dispatch error");
            }
        }

        if inner.fatal_rx.borrow().is_some() {
            break;
        }

        // Automatic rekey by volume or age.
        let wants_rekey = {
            let state = inner.state.lock().expect("state lock");
            state.needs_rekey(now_secs())
        };
        if wants_rekey && inner.kex.lock().expect("kex lock").is_idle() {
            if let Err(e) = inner.start_rekey() {
                warn!(error = %e, "automatic rekey failed to start");
            }
        }
    }

    // Wake everything still waiting on channel state.
    let channels = inner.channels.lock().expect("channels lock");
    for shared in channels.values() {
        shared.notify.notify_waiters();
    }
    debug!("receive task stopped");
}

/// Routes one inbound payload. Errors marked fatal tear the transport
/// down.
fn dispatch(
    inner: &Arc<SessionInner>,
    opener: &mut PacketOpener,
    payload: &[u8],
    seq: u32,
) -> SkiffResult<()> {
    let msg_num = *payload
        .first()
        .ok_or_else(|| SkiffError::MalformedPacket("empty packet".to_string()))?;

    // Strict-KEX: between KEXINIT and NEWKEYS only kex messages may
    // arrive.
    {
        let kex = inner.kex.lock().expect("kex lock");
        let strict = inner.state.lock().expect("state lock").strict_kex();
        if strict && !kex.is_idle() && !strict_kex_allows(msg_num) {
            return Err(SkiffError::KexFailed(format!(
                "message {} received during strict key exchange",
                msg_num
            )));
        }
    }

    match MessageType::from_u8(msg_num) {
        Some(MessageType::Disconnect) => {
            let msg = Disconnect::from_bytes(payload)?;
            Err(SkiffError::Disconnected {
                code: msg.reason_code,
                description: msg.description,
            })
        }
        Some(MessageType::Ignore) => Ok(()),
        Some(MessageType::Debug) => {
            if let Ok(msg) = DebugMsg::from_bytes(payload) {
                if msg.always_display {
                    warn!(message = %msg.message, "peer debug");
                } else {
                    debug!(message = %msg.message, "peer debug");
                }
            }
            Ok(())
        }
        Some(MessageType::Unimplemented) => {
            if let Ok(msg) = Unimplemented::from_bytes(payload) {
                warn!(seq = msg.sequence_number, "peer rejected a packet");
            }
            Ok(())
        }
        Some(MessageType::ExtInfo) => {
            debug!("ignoring SSH_MSG_EXT_INFO");
            Ok(())
        }
        Some(MessageType::KexInit) => handle_kexinit(inner, payload),
        Some(MessageType::NewKeys) => handle_peer_newkeys(inner, opener),
        Some(MessageType::UserauthBanner) => {
            debug!("banner outside authentication ignored");
            Ok(())
        }
        Some(MessageType::GlobalRequest) => {
            let msg = GlobalRequest::from_bytes(payload)?;
            debug!(name = %msg.request_name, "inbound global request");
            if msg.want_reply {
                inner.sink.send_packet(request_failure())?;
            }
            Ok(())
        }
        Some(MessageType::RequestSuccess) | Some(MessageType::RequestFailure) => {
            let verdict = msg_num == MessageType::RequestSuccess as u8;
            let waiter = inner
                .global_replies
                .lock()
                .expect("global replies lock")
                .pop_front();
            match waiter {
                Some(tx) => {
                    let _ = tx.send(verdict);
                    Ok(())
                }
                None => Err(SkiffError::Protocol(
                    "global reply with no outstanding request".to_string(),
                )),
            }
        }
        Some(MessageType::ChannelOpen) => handle_inbound_open(inner, payload),
        Some(MessageType::ChannelOpenConfirmation) => {
            let msg = ChannelOpenConfirmation::from_bytes(payload)?;
            with_channel(inner, msg.recipient_channel, |shared| {
                shared.handle_open_confirmation(&msg);
                Ok(())
            })
        }
        Some(MessageType::ChannelOpenFailure) => {
            let msg = ChannelOpenFailure::from_bytes(payload)?;
            let result = with_channel(inner, msg.recipient_channel, |shared| {
                shared.handle_open_failure(&msg);
                Ok(())
            });
            inner
                .channels
                .lock()
                .expect("channels lock")
                .remove(&msg.recipient_channel);
            result
        }
        Some(MessageType::ChannelWindowAdjust) => {
            let msg = ChannelWindowAdjust::from_bytes(payload)?;
            with_channel(inner, msg.recipient_channel, |shared| {
                shared.handle_window_adjust(&msg);
                Ok(())
            })
        }
        Some(MessageType::ChannelData) => {
            let msg = ChannelData::from_bytes(payload)?;
            with_channel(inner, msg.recipient_channel, |shared| {
                shared.handle_data(msg.data, false)
            })
        }
        Some(MessageType::ChannelExtendedData) => {
            let msg = ChannelExtendedData::from_bytes(payload)?;
            with_channel(inner, msg.recipient_channel, |shared| {
                shared.handle_data(msg.data, true)
            })
        }
        Some(MessageType::ChannelEof) => {
            let id = crate::ssh::connection::recipient_channel(payload)?;
            with_channel(inner, id, |shared| {
                shared.handle_eof();
                Ok(())
            })
        }
        Some(MessageType::ChannelClose) => {
            let id = crate::ssh::connection::recipient_channel(payload)?;
            let reply = {
                let channels = inner.channels.lock().expect("channels lock");
                match channels.get(&id) {
                    Some(shared) => shared.handle_close(),
                    None => {
                        warn!(channel = id, "CLOSE for unknown channel");
                        None
                    }
                }
            };
            if let Some(remote_id) = reply {
                inner
                    .sink
                    .send_packet(crate::ssh::connection::channel_close(remote_id))?;
            }
            inner.channels.lock().expect("channels lock").remove(&id);
            Ok(())
        }
        Some(MessageType::ChannelRequest) => {
            let msg = ChannelRequest::from_bytes(payload)?;
            debug!(
                channel = msg.recipient_channel,
                request = %msg.request_type,
                "inbound channel request"
            );
            if msg.want_reply {
                let remote_id = {
                    let channels = inner.channels.lock().expect("channels lock");
                    channels
                        .get(&msg.recipient_channel)
                        .map(|shared| shared.inner.lock().expect("channel lock").remote_id)
                };
                if let Some(remote_id) = remote_id {
                    inner.sink.send_packet(channel_failure(remote_id))?;
                }
            }
            Ok(())
        }
        Some(MessageType::ChannelSuccess) => {
            let id = crate::ssh::connection::recipient_channel(payload)?;
            with_channel(inner, id, |shared| {
                shared.handle_reply(true);
                Ok(())
            })
        }
        Some(MessageType::ChannelFailure) => {
            let id = crate::ssh::connection::recipient_channel(payload)?;
            with_channel(inner, id, |shared| {
                shared.handle_reply(false);
                Ok(())
            })
        }
        Some(MessageType::ServiceRequest) | Some(MessageType::ServiceAccept) => Err(
            SkiffError::Protocol(format!("unexpected service message {}", msg_num)),
        ),
        Some(MessageType::UserauthRequest)
        | Some(MessageType::UserauthFailure)
        | Some(MessageType::UserauthSuccess) => {
            debug!(msg = msg_num, "authentication message outside auth phase");
            Ok(())
        }
        None => {
            // Method-range numbers belong to an active kex; everything
            // else is answered with UNIMPLEMENTED.
            if (30..=49).contains(&msg_num) {
                return handle_kex_method_message(inner, payload);
            }
            debug!(msg = msg_num, seq, "unknown message number");
            inner
                .sink
                .send_packet(Unimplemented::new(seq).to_bytes())?;
            Ok(())
        }
    }
}

fn with_channel(
    inner: &Arc<SessionInner>,
    id: u32,
    f: impl FnOnce(&ChannelShared) -> SkiffResult<()>,
) -> SkiffResult<()> {
    let shared = {
        let channels = inner.channels.lock().expect("channels lock");
        channels.get(&id).cloned()
    };
    match shared {
        Some(shared) => f(&shared),
        None => {
            warn!(channel = id, "message for unknown channel");
            Ok(())
        }
    }
}

/// Handles a KEXINIT in the running state: either the peer answers our
/// rekey, or it initiates one.
fn handle_kexinit(inner: &Arc<SessionInner>, payload: &[u8]) -> SkiffResult<()> {
    let mut kex = inner.kex.lock().expect("kex lock");
    match std::mem::replace(&mut *kex, KexState::Idle) {
        KexState::Idle => {
            // Peer-initiated rekey.
            {
                let mut state = inner.state.lock().expect("state lock");
                state.transition(State::Rekey)?;
            }
            let our_kexinit = {
                let state = inner.state.lock().expect("state lock");
                KexInit::new(&state.config().catalog, false).to_bytes()
            };
            inner.sink.command(Outbound::BeginKex)?;
            inner.sink.send_kex_packet(our_kexinit.clone())?;
            let (driver, outgoing) = KexDriver::new(
                &inner.client_version,
                &inner.server_version,
                our_kexinit,
                payload.to_vec(),
                false,
            )?;
            for msg in outgoing {
                inner.sink.send_kex_packet(msg)?;
            }
            *kex = KexState::Exchanging(Box::new(driver));
            Ok(())
        }
        KexState::Init { our_kexinit } => {
            let (driver, outgoing) = KexDriver::new(
                &inner.client_version,
                &inner.server_version,
                our_kexinit,
                payload.to_vec(),
                false,
            )?;
            for msg in outgoing {
                inner.sink.send_kex_packet(msg)?;
            }
            *kex = KexState::Exchanging(Box::new(driver));
            Ok(())
        }
        other => {
            *kex = other;
            Err(SkiffError::KexFailed(
                "KEXINIT received during an ongoing key exchange".to_string(),
            ))
        }
    }
}

/// Handles a method-range (30-49) message while a rekey is in flight.
fn handle_kex_method_message(inner: &Arc<SessionInner>, payload: &[u8]) -> SkiffResult<()> {
    let mut kex = inner.kex.lock().expect("kex lock");
    match std::mem::replace(&mut *kex, KexState::Idle) {
        KexState::Exchanging(mut driver) => match driver.on_message(payload)? {
            KexProgress::Continue(msgs) => {
                for msg in msgs {
                    inner.sink.send_kex_packet(msg)?;
                }
                *kex = KexState::Exchanging(driver);
                Ok(())
            }
            KexProgress::Done(outcome) => {
                let set = inner.build_new_keys(&driver, &outcome, false)?;
                *kex = inner.emit_newkeys(set, false)?;
                Ok(())
            }
        },
        other => {
            *kex = other;
            Err(SkiffError::Protocol(format!(
                "kex method message {} outside a key exchange",
                payload.first().copied().unwrap_or(0)
            )))
        }
    }
}

/// Handles the peer's NEWKEYS at the end of a rekey.
fn handle_peer_newkeys(inner: &Arc<SessionInner>, opener: &mut PacketOpener) -> SkiffResult<()> {
    let mut kex = inner.kex.lock().expect("kex lock");
    match std::mem::replace(&mut *kex, KexState::Idle) {
        KexState::AwaitNewKeys {
            open_cipher,
            open_mac,
            open_decompressor,
            strict,
        } => {
            opener.install(Some(*open_cipher), open_mac, open_decompressor);
            if strict {
                opener.reset_seq();
            }
            {
                let mut state = inner.state.lock().expect("state lock");
                state.transition(State::Running)?;
                state.reset_rekey_tracking(now_secs());
            }
            inner.rekey_done.notify_waiters();
            debug!("rekey complete");
            Ok(())
        }
        other => {
            *kex = other;
            Err(SkiffError::Protocol(
                "unexpected SSH_MSG_NEWKEYS".to_string(),
            ))
        }
    }
}

/// Handles a server-initiated channel open (forwarded-tcpip).
fn handle_inbound_open(inner: &Arc<SessionInner>, payload: &[u8]) -> SkiffResult<()> {
    let msg = ChannelOpen::from_bytes(payload)?;
    if !matches!(msg.channel_type, ChannelType::ForwardedTcpip { .. }) {
        inner.sink.send_packet(channel_open_failure(
            msg.sender_channel,
            ChannelOpenFailureReason::AdministrativelyProhibited,
            "channel type not accepted",
        ))?;
        return Ok(());
    }

    let permit = match Arc::clone(&inner.channel_slots).try_acquire_owned() {
        Ok(permit) => permit,
        Err(_) => {
            inner.sink.send_packet(channel_open_failure(
                msg.sender_channel,
                ChannelOpenFailureReason::ResourceShortage,
                "too many channels",
            ))?;
            return Ok(());
        }
    };

    let local_id = inner.next_channel_id.fetch_add(1, Ordering::Relaxed);
    let shared = ChannelShared::new();
    shared.handle_open_confirmation(&ChannelOpenConfirmation {
        recipient_channel: local_id,
        sender_channel: msg.sender_channel,
        initial_window_size: msg.initial_window_size,
        maximum_packet_size: msg.maximum_packet_size,
    });
    inner
        .channels
        .lock()
        .expect("channels lock")
        .insert(local_id, Arc::clone(&shared));

    inner
        .sink
        .send_packet(crate::ssh::connection::channel_open_confirmation(
            msg.sender_channel,
            local_id,
        ))?;

    let mut channel = Channel::new(
        local_id,
        shared,
        inner.sink.clone(),
        inner.fatal_rx.clone(),
        Some(permit),
    );
    channel.set_reply_timeout(inner.operation_timeout);
    if inner.incoming_tx.send(channel).is_err() {
        debug!("forwarded channel dropped: nobody is accepting");
    }
    Ok(())
}
