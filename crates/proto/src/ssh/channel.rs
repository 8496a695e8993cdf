//! Channel multiplexer state (RFC 4254 Section 5).
//!
//! Each channel tracks independent send and receive windows:
//!
//! - **Send path**: user data is split into blocks of
//!   `min(remote_window, remote_max_packet)`; each CHANNEL_DATA
//!   decrements the remote window and a writer with no window blocks
//!   until the peer sends WINDOW_ADJUST.
//! - **Receive path**: inbound data decrements the local window; once
//!   half the window has been consumed a WINDOW_ADJUST replenishes it to
//!   2^31-1.
//! - **Close protocol**: EOF is sent before CLOSE, and the channel is
//!   released only when both sides' CLOSE messages have crossed the
//!   wire. Data arriving after our CLOSE is discarded; writes after
//!   close fail with [`SkiffError::ChannelClosed`].
//!
//! Every blocking wait also wakes on the session's fatal-error watch so
//! a dying receive task unblocks all channel users.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use skiff_platform::{SkiffError, SkiffResult};
use tokio::sync::{oneshot, watch, Notify, OwnedSemaphorePermit};
use tracing::{debug, warn};

use crate::ssh::client::PacketSink;
use crate::ssh::connection::{
    channel_close, channel_eof, ChannelData, ChannelOpenConfirmation, ChannelOpenFailure,
    ChannelRequest, ChannelWindowAdjust, LOCAL_MAX_PACKET_SIZE, LOCAL_WINDOW_SIZE,
};

/// Channel lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// CHANNEL_OPEN sent, waiting for the peer's verdict.
    Opening,
    /// Open in both directions.
    Open,
    /// We sent EOF; we can still receive.
    EofSent,
    /// We sent CLOSE and are waiting for the peer's CLOSE.
    CloseSent,
    /// Both CLOSE messages have crossed; the channel is dead.
    Closed,
}

pub(crate) struct ChannelInner {
    pub(crate) state: ChannelState,
    pub(crate) remote_id: u32,
    pub(crate) remote_window: u32,
    pub(crate) remote_max_packet: u32,
    pub(crate) local_window: u32,
    recv: VecDeque<Vec<u8>>,
    recv_ext: VecDeque<Vec<u8>>,
    eof_received: bool,
    close_received: bool,
    open_result: Option<SkiffResult<()>>,
    pending_replies: VecDeque<oneshot::Sender<bool>>,
}

/// Shared channel state: the dispatcher updates it, the handle waits on
/// it.
pub(crate) struct ChannelShared {
    pub(crate) inner: Mutex<ChannelInner>,
    pub(crate) notify: Notify,
}

impl ChannelShared {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(ChannelInner {
                state: ChannelState::Opening,
                remote_id: 0,
                remote_window: 0,
                remote_max_packet: 0,
                local_window: LOCAL_WINDOW_SIZE,
                recv: VecDeque::new(),
                recv_ext: VecDeque::new(),
                eof_received: false,
                close_received: false,
                open_result: None,
                pending_replies: VecDeque::new(),
            }),
            notify: Notify::new(),
        })
    }

    pub(crate) fn handle_open_confirmation(&self, conf: &ChannelOpenConfirmation) {
        let mut inner = self.inner.lock().expect("channel lock");
        inner.remote_id = conf.sender_channel;
        inner.remote_window = conf.initial_window_size;
        inner.remote_max_packet = conf.maximum_packet_size;
        inner.state = ChannelState::Open;
        inner.open_result = Some(Ok(()));
        drop(inner);
        self.notify.notify_waiters();
    }

    pub(crate) fn handle_open_failure(&self, failure: &ChannelOpenFailure) {
        let mut inner = self.inner.lock().expect("channel lock");
        inner.state = ChannelState::Closed;
        inner.open_result = Some(Err(SkiffError::Protocol(format!(
            "channel open refused ({:?}): {}",
            failure.reason, failure.description
        ))));
        drop(inner);
        self.notify.notify_waiters();
    }

    /// Enqueues inbound data, enforcing the local window.
    pub(crate) fn handle_data(&self, data: Vec<u8>, extended: bool) -> SkiffResult<()> {
        let mut inner = self.inner.lock().expect("channel lock");
        if matches!(inner.state, ChannelState::CloseSent | ChannelState::Closed) {
            // Data racing our CLOSE is dropped.
            return Ok(());
        }
        if data.len() as u64 > u64::from(LOCAL_MAX_PACKET_SIZE) {
            return Err(SkiffError::Protocol(format!(
                "peer sent {} bytes, above the advertised packet limit",
                data.len()
            )));
        }
        if data.len() as u64 > u64::from(inner.local_window) {
            return Err(SkiffError::Protocol(
                "peer overflowed the receive window".to_string(),
            ));
        }
        inner.local_window -= data.len() as u32;
        if extended {
            inner.recv_ext.push_back(data);
        } else {
            inner.recv.push_back(data);
        }
        drop(inner);
        self.notify.notify_waiters();
        Ok(())
    }

    pub(crate) fn handle_window_adjust(&self, adjust: &ChannelWindowAdjust) {
        let mut inner = self.inner.lock().expect("channel lock");
        inner.remote_window = inner.remote_window.saturating_add(adjust.bytes_to_add);
        drop(inner);
        self.notify.notify_waiters();
    }

    pub(crate) fn handle_eof(&self) {
        let mut inner = self.inner.lock().expect("channel lock");
        inner.eof_received = true;
        drop(inner);
        self.notify.notify_waiters();
    }

    /// Records the peer's CLOSE.
    ///
    /// Returns `Some(remote_id)` when we still owe the peer our own
    /// CLOSE (it closed first); the dispatcher sends it and the channel
    /// is fully closed either way.
    pub(crate) fn handle_close(&self) -> Option<u32> {
        let mut inner = self.inner.lock().expect("channel lock");
        inner.close_received = true;
        inner.eof_received = true;
        let reply = match inner.state {
            ChannelState::Open | ChannelState::EofSent | ChannelState::Opening => {
                Some(inner.remote_id)
            }
            ChannelState::CloseSent | ChannelState::Closed => None,
        };
        inner.state = ChannelState::Closed;
        drop(inner);
        self.notify.notify_waiters();
        reply
    }

    pub(crate) fn handle_reply(&self, success: bool) {
        let sender = {
            let mut inner = self.inner.lock().expect("channel lock");
            inner.pending_replies.pop_front()
        };
        match sender {
            Some(tx) => {
                let _ = tx.send(success);
            }
            None => warn!("channel reply with no outstanding request"),
        }
    }
}

/// A handle to one multiplexed channel.
pub struct Channel {
    local_id: u32,
    shared: Arc<ChannelShared>,
    sink: PacketSink,
    fatal: watch::Receiver<Option<Arc<SkiffError>>>,
    /// Budget for request-reply waits; `None` waits indefinitely.
    reply_timeout: Option<std::time::Duration>,
    /// Holds one slot of the session's channel semaphore for the
    /// lifetime of this handle.
    _permit: Option<OwnedSemaphorePermit>,
}

impl Channel {
    pub(crate) fn new(
        local_id: u32,
        shared: Arc<ChannelShared>,
        sink: PacketSink,
        fatal: watch::Receiver<Option<Arc<SkiffError>>>,
        permit: Option<OwnedSemaphorePermit>,
    ) -> Self {
        Self {
            local_id,
            shared,
            sink,
            fatal,
            reply_timeout: None,
            _permit: permit,
        }
    }

    /// Sets the per-request reply timeout.
    pub(crate) fn set_reply_timeout(&mut self, timeout: std::time::Duration) {
        self.reply_timeout = Some(timeout);
    }

    /// Returns the local channel id.
    pub fn local_id(&self) -> u32 {
        self.local_id
    }

    /// Returns the peer's channel id.
    pub fn remote_id(&self) -> u32 {
        self.shared.inner.lock().expect("channel lock").remote_id
    }

    /// Returns the current lifecycle state.
    pub fn state(&self) -> ChannelState {
        self.shared.inner.lock().expect("channel lock").state
    }

    fn fatal_error(&self) -> Option<SkiffError> {
        self.fatal
            .borrow()
            .as_ref()
            .map(|e| SkiffError::Protocol(e.to_string()))
    }

    /// Waits until `check` yields a value, waking on channel events and
    /// on transport death.
    async fn wait_for<T>(
        &self,
        mut check: impl FnMut(&mut ChannelInner) -> Option<SkiffResult<T>>,
    ) -> SkiffResult<T> {
        let mut fatal = self.fatal.clone();
        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);

            if let Some(err) = self.fatal_error() {
                return Err(err);
            }
            {
                let mut inner = self.shared.inner.lock().expect("channel lock");
                if let Some(result) = check(&mut inner) {
                    return result;
                }
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = fatal.changed() => {}
            }
        }
    }

    /// Waits for the peer's OPEN_CONFIRMATION or OPEN_FAILURE.
    pub(crate) async fn wait_open(&self) -> SkiffResult<()> {
        self.wait_for(|inner| inner.open_result.take()).await
    }

    /// Writes data, fragmenting to `min(remote_window, remote_max_packet)`
    /// and blocking while the remote window is exhausted.
    pub async fn write(&self, data: &[u8]) -> SkiffResult<()> {
        let mut written = 0usize;
        while written < data.len() {
            let chunk = self
                .wait_for(|inner| {
                    match inner.state {
                        ChannelState::Open => {}
                        ChannelState::Opening => return None,
                        _ => return Some(Err(SkiffError::ChannelClosed)),
                    }
                    let budget = inner.remote_window.min(inner.remote_max_packet) as usize;
                    if budget == 0 {
                        return None;
                    }
                    let take = budget.min(data.len() - written);
                    inner.remote_window -= take as u32;
                    Some(Ok((inner.remote_id, take)))
                })
                .await?;

            let (remote_id, take) = chunk;
            let msg = ChannelData {
                recipient_channel: remote_id,
                data: data[written..written + take].to_vec(),
            };
            self.sink.send_packet(msg.to_bytes())?;
            written += take;
        }
        Ok(())
    }

    /// Reads the next block of channel data.
    ///
    /// Returns `Ok(None)` once the peer has sent EOF and the buffer is
    /// drained.
    pub async fn read(&self) -> SkiffResult<Option<Vec<u8>>> {
        let data = self
            .wait_for(|inner| {
                if let Some(data) = inner.recv.pop_front() {
                    return Some(Ok(Some(data)));
                }
                if inner.eof_received || matches!(inner.state, ChannelState::Closed) {
                    return Some(Ok(None));
                }
                None
            })
            .await?;
        if data.is_some() {
            self.replenish_window()?;
        }
        Ok(data)
    }

    /// Reads the next block of extended (stderr) data, if any is queued.
    pub fn read_extended(&self) -> Option<Vec<u8>> {
        let data = self
            .shared
            .inner
            .lock()
            .expect("channel lock")
            .recv_ext
            .pop_front();
        if data.is_some() {
            let _ = self.replenish_window();
        }
        data
    }

    /// Tops the local window back up to 2^31-1 once half is consumed.
    fn replenish_window(&self) -> SkiffResult<()> {
        let adjust = {
            let mut inner = self.shared.inner.lock().expect("channel lock");
            let consumed = LOCAL_WINDOW_SIZE - inner.local_window;
            if consumed < LOCAL_WINDOW_SIZE / 2 {
                return Ok(());
            }
            inner.local_window = LOCAL_WINDOW_SIZE;
            ChannelWindowAdjust {
                recipient_channel: inner.remote_id,
                bytes_to_add: consumed,
            }
        };
        debug!(
            channel = self.local_id,
            bytes = adjust.bytes_to_add,
            "replenishing receive window"
        );
        self.sink.send_packet(adjust.to_bytes())
    }

    /// Sends a CHANNEL_REQUEST. With `want_reply`, waits for the matching
    /// SUCCESS/FAILURE (replies arrive in FIFO order) and returns the
    /// verdict; without, returns `true` immediately.
    pub async fn request(
        &self,
        request_type: &str,
        payload: Vec<u8>,
        want_reply: bool,
    ) -> SkiffResult<bool> {
        let (remote_id, reply_rx) = {
            let mut inner = self.shared.inner.lock().expect("channel lock");
            if !matches!(inner.state, ChannelState::Open | ChannelState::EofSent) {
                return Err(SkiffError::ChannelClosed);
            }
            let rx = if want_reply {
                let (tx, rx) = oneshot::channel();
                inner.pending_replies.push_back(tx);
                Some(rx)
            } else {
                None
            };
            (inner.remote_id, rx)
        };

        let msg = ChannelRequest {
            recipient_channel: remote_id,
            request_type: request_type.to_string(),
            want_reply,
            payload,
        };
        self.sink.send_packet(msg.to_bytes())?;

        match reply_rx {
            None => Ok(true),
            Some(rx) => {
                let mut fatal = self.fatal.clone();
                let wait = async move {
                    tokio::select! {
                        verdict = rx => verdict.map_err(|_| SkiffError::ChannelClosed),
                        _ = fatal.changed() => Err(SkiffError::ConnectionLost),
                    }
                };
                match self.reply_timeout {
                    None => wait.await,
                    Some(budget) => tokio::time::timeout(budget, wait)
                        .await
                        .map_err(|_| SkiffError::Timeout("channel request reply".to_string()))?,
                }
            }
        }
    }

    /// Sends EOF: no more data will be written.
    pub fn eof(&self) -> SkiffResult<()> {
        let remote_id = {
            let mut inner = self.shared.inner.lock().expect("channel lock");
            match inner.state {
                ChannelState::Open => {
                    inner.state = ChannelState::EofSent;
                    inner.remote_id
                }
                ChannelState::EofSent => return Ok(()),
                _ => return Err(SkiffError::ChannelClosed),
            }
        };
        self.sink.send_packet(channel_eof(remote_id))
    }

    /// Closes the channel: EOF (if not yet sent), CLOSE, then waits for
    /// the peer's CLOSE before releasing the channel.
    pub async fn close(&self) -> SkiffResult<()> {
        let (remote_id, send_eof, send_close) = {
            let mut inner = self.shared.inner.lock().expect("channel lock");
            match inner.state {
                ChannelState::Open => {
                    inner.state = ChannelState::CloseSent;
                    (inner.remote_id, true, true)
                }
                ChannelState::EofSent => {
                    inner.state = ChannelState::CloseSent;
                    (inner.remote_id, false, true)
                }
                ChannelState::CloseSent | ChannelState::Closed => (inner.remote_id, false, false),
                ChannelState::Opening => return Err(SkiffError::ChannelClosed),
            }
        };

        if send_eof {
            self.sink.send_packet(channel_eof(remote_id))?;
        }
        if send_close {
            self.sink.send_packet(channel_close(remote_id))?;
        }

        self.wait_for(|inner| {
            if inner.close_received {
                inner.state = ChannelState::Closed;
                Some(Ok(()))
            } else {
                None
            }
        })
        .await
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        let remote_id = {
            let mut inner = self.shared.inner.lock().expect("channel lock");
            match inner.state {
                ChannelState::Open | ChannelState::EofSent => {
                    inner.state = ChannelState::CloseSent;
                    Some(inner.remote_id)
                }
                _ => None,
            }
        };
        if let Some(remote_id) = remote_id {
            let _ = self.sink.send_packet(channel_close(remote_id));
        }
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("local_id", &self.local_id)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::client::{Outbound, PacketSink};
    use crate::ssh::message::MessageType;
    use tokio::sync::mpsc;

    fn test_channel() -> (
        Channel,
        Arc<ChannelShared>,
        mpsc::UnboundedReceiver<Outbound>,
        watch::Sender<Option<Arc<SkiffError>>>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (fatal_tx, fatal_rx) = watch::channel(None);
        let shared = ChannelShared::new();
        let channel = Channel::new(0, Arc::clone(&shared), PacketSink::new(tx), fatal_rx, None);
        (channel, shared, rx, fatal_tx)
    }

    fn open_with(shared: &ChannelShared, window: u32, max_packet: u32) {
        shared.handle_open_confirmation(&ChannelOpenConfirmation {
            recipient_channel: 0,
            sender_channel: 42,
            initial_window_size: window,
            maximum_packet_size: max_packet,
        });
    }

    fn sent_payload(outbound: Outbound) -> Vec<u8> {
        match outbound {
            Outbound::Packet { payload, .. } => payload,
            other => panic!("expected a packet, got {:?}", other.kind()),
        }
    }

    #[tokio::test]
    async fn test_open_confirmation_unblocks_wait() {
        let (channel, shared, _rx, _fatal) = test_channel();
        open_with(&shared, 1024, 256);
        channel.wait_open().await.unwrap();
        assert_eq!(channel.state(), ChannelState::Open);
        assert_eq!(channel.remote_id(), 42);
    }

    #[tokio::test]
    async fn test_open_failure_propagates() {
        let (channel, shared, _rx, _fatal) = test_channel();
        shared.handle_open_failure(&ChannelOpenFailure {
            recipient_channel: 0,
            reason: crate::ssh::connection::ChannelOpenFailureReason::ResourceShortage,
            description: "no slots".to_string(),
        });
        assert!(channel.wait_open().await.is_err());
    }

    #[tokio::test]
    async fn test_write_fragments_by_window_and_packet() {
        let (channel, shared, mut rx, _fatal) = test_channel();
        open_with(&shared, 16, 10);

        // 26 bytes against window 16, max packet 10: 10 + 6 go out, then
        // the writer blocks.
        let data = vec![0xabu8; 26];
        let writer = tokio::spawn(async move {
            channel.write(&data).await.unwrap();
            channel
        });

        let first = ChannelData::from_bytes(&sent_payload(rx.recv().await.unwrap())).unwrap();
        assert_eq!(first.data.len(), 10);
        assert_eq!(first.recipient_channel, 42);
        let second = ChannelData::from_bytes(&sent_payload(rx.recv().await.unwrap())).unwrap();
        assert_eq!(second.data.len(), 6);

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err(), "writer must block on zero window");

        // +9 window: a 9-byte packet, then blocked again on the last byte.
        shared.handle_window_adjust(&ChannelWindowAdjust {
            recipient_channel: 0,
            bytes_to_add: 9,
        });
        let third = ChannelData::from_bytes(&sent_payload(rx.recv().await.unwrap())).unwrap();
        assert_eq!(third.data.len(), 9);

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());

        shared.handle_window_adjust(&ChannelWindowAdjust {
            recipient_channel: 0,
            bytes_to_add: 100,
        });
        let fourth = ChannelData::from_bytes(&sent_payload(rx.recv().await.unwrap())).unwrap();
        assert_eq!(fourth.data.len(), 1);

        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_read_returns_data_then_eof() {
        let (channel, shared, _rx, _fatal) = test_channel();
        open_with(&shared, 1024, 256);

        shared.handle_data(b"hello".to_vec(), false).unwrap();
        shared.handle_eof();

        assert_eq!(channel.read().await.unwrap(), Some(b"hello".to_vec()));
        assert_eq!(channel.read().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_window_overflow_rejected() {
        let (_channel, shared, _rx, _fatal) = test_channel();
        open_with(&shared, 1024, 256);
        {
            let mut inner = shared.inner.lock().unwrap();
            inner.local_window = 3;
        }
        assert!(shared.handle_data(vec![0u8; 4], false).is_err());
    }

    #[tokio::test]
    async fn test_data_after_close_discarded() {
        let (channel, shared, mut rx, _fatal) = test_channel();
        open_with(&shared, 1024, 256);

        let closer = tokio::spawn(async move {
            channel.close().await.unwrap();
            channel
        });

        // EOF then CLOSE, in that order.
        assert_eq!(
            sent_payload(rx.recv().await.unwrap())[0],
            MessageType::ChannelEof as u8
        );
        assert_eq!(
            sent_payload(rx.recv().await.unwrap())[0],
            MessageType::ChannelClose as u8
        );

        // Data racing our CLOSE is silently dropped.
        shared.handle_data(b"late".to_vec(), false).unwrap();
        assert!(shared.inner.lock().unwrap().recv.is_empty());

        // We closed first, so no reply CLOSE is owed.
        assert!(shared.handle_close().is_none());
        let channel = closer.await.unwrap();
        assert_eq!(channel.state(), ChannelState::Closed);
    }

    #[tokio::test]
    async fn test_write_after_close_fails() {
        let (channel, shared, _rx, _fatal) = test_channel();
        open_with(&shared, 1024, 256);
        {
            let mut inner = shared.inner.lock().unwrap();
            inner.state = ChannelState::CloseSent;
        }
        assert!(matches!(
            channel.write(b"nope").await,
            Err(SkiffError::ChannelClosed)
        ));
    }

    #[tokio::test]
    async fn test_request_reply_fifo() {
        let (channel, shared, mut rx, _fatal) = test_channel();
        open_with(&shared, 1024, 256);

        let channel = Arc::new(channel);
        let c1 = Arc::clone(&channel);
        let first = tokio::spawn(async move { c1.request("exec", vec![], true).await });
        // Ensure the first request is registered before the second.
        let _ = rx.recv().await.unwrap();
        let c2 = Arc::clone(&channel);
        let second = tokio::spawn(async move { c2.request("env", vec![], true).await });
        let _ = rx.recv().await.unwrap();

        // FIFO: first verdict goes to the first request.
        shared.handle_reply(true);
        shared.handle_reply(false);

        assert!(first.await.unwrap().unwrap());
        assert!(!second.await.unwrap().unwrap());
    }

    #[tokio::test]
    async fn test_request_without_reply_returns_immediately() {
        let (channel, shared, mut rx, _fatal) = test_channel();
        open_with(&shared, 1024, 256);
        assert!(channel.request("shell", vec![], false).await.unwrap());
        let req =
            ChannelRequest::from_bytes(&sent_payload(rx.recv().await.unwrap())).unwrap();
        assert!(!req.want_reply);
    }

    #[tokio::test]
    async fn test_fatal_error_unblocks_writer() {
        let (channel, shared, _rx, fatal) = test_channel();
        open_with(&shared, 0, 10);

        let writer = tokio::spawn(async move { channel.write(b"stuck").await });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        fatal
            .send(Some(Arc::new(SkiffError::ConnectionLost)))
            .unwrap();
        assert!(writer.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_window_replenish_after_half_consumed() {
        let (channel, shared, mut rx, _fatal) = test_channel();
        open_with(&shared, 1024, 256);

        // Drain more than half the local window.
        {
            let mut inner = shared.inner.lock().unwrap();
            inner.local_window = LOCAL_WINDOW_SIZE / 2 - 1;
        }
        shared.handle_data(b"x".to_vec(), false).unwrap();
        channel.read().await.unwrap();

        let adjust =
            ChannelWindowAdjust::from_bytes(&sent_payload(rx.recv().await.unwrap())).unwrap();
        assert_eq!(adjust.recipient_channel, 42);
        assert_eq!(
            adjust.bytes_to_add,
            LOCAL_WINDOW_SIZE - (LOCAL_WINDOW_SIZE / 2 - 2)
        );
        assert_eq!(
            shared.inner.lock().unwrap().local_window,
            LOCAL_WINDOW_SIZE
        );
    }
}
