//! Request/response correlation over one duplex byte stream.
//!
//! A reader task owns the read half of the transport and feeds every
//! inbound byte through a [PacketParser]. Responses are matched to
//! in-flight requests by sequence id. Device-initiated requests go to a
//! registered handler channel if one exists, otherwise to the subscription
//! callbacks for that command pair.
//!
//! Writes are serialized one frame at a time; unrelated exchanges freely
//! interleave between frames.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Weak,
    },
    time::Duration,
};

use bytes::Bytes;
use dashmap::{mapref::entry::Entry, DashMap};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf},
    sync::{mpsc, oneshot},
};
use tokio_util::sync::CancellationToken;

use crate::{
    payload::PayloadWriter,
    pending::{Pending, PendingTable},
    Attribute, CommandPair, DecodeError, Error, Packet, PacketParser, PeerId, Result,
};

const READ_BUFFER_LEN: usize = 4096;

/// Peer ids and timing for one dispatcher.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Our peer id, written as the sender of every request.
    pub sender_id: u8,
    /// The device's peer id.
    pub receiver_id: u8,
    /// How long `send` waits for a response.
    pub request_timeout: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            sender_id: PeerId::HOST,
            receiver_id: PeerId::CONTROLLER,
            request_timeout: Duration::from_secs(5),
        }
    }
}

/// Handle returned by [Dispatcher::subscribe], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Callback = Arc<dyn Fn(&Packet) + Send + Sync>;

struct State {
    table: PendingTable,
    subscriptions: HashMap<CommandPair, Vec<(SubscriptionId, Callback)>>,
    closed: bool,
}

/// Multiplexes requests, responses, subscriptions, and device-initiated
/// requests over a single transport.
pub struct Dispatcher {
    config: DispatcherConfig,
    writer: tokio::sync::Mutex<Box<dyn AsyncWrite + Send + Unpin>>,
    state: parking_lot::Mutex<State>,
    handlers: DashMap<CommandPair, mpsc::UnboundedSender<Packet>>,
    shutdown: CancellationToken,
    close_reason: parking_lot::Mutex<Option<String>>,
    next_subscription: AtomicU64,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("config", &self.config)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    /// Take ownership of `transport` and start the reader task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new<T>(transport: T, config: DispatcherConfig) -> Arc<Self>
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(transport);
        let shutdown = CancellationToken::new();

        let dispatcher = Arc::new(Self {
            config,
            writer: tokio::sync::Mutex::new(Box::new(writer)),
            state: parking_lot::Mutex::new(State {
                table: PendingTable::new(),
                subscriptions: HashMap::new(),
                closed: false,
            }),
            handlers: DashMap::new(),
            shutdown: shutdown.clone(),
            close_reason: parking_lot::Mutex::new(None),
            next_subscription: AtomicU64::new(0),
        });

        tokio::spawn(read_loop(Arc::downgrade(&dispatcher), reader, shutdown));

        dispatcher
    }

    /// Send a request and wait for the matching response.
    ///
    /// The response is returned as-is; checking its result code is up to
    /// the caller (see [check_result]).
    pub async fn send(&self, command: CommandPair, payload: Bytes) -> Result<Packet> {
        let (reply, response) = oneshot::channel();
        let sequence = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(Error::Closed);
            }
            state.table.insert(command, reply)?
        };

        // Frees the slot if this future is dropped or times out.
        let _slot = SlotGuard {
            dispatcher: self,
            sequence,
        };

        let request = Packet::request(
            self.config.sender_id,
            self.config.receiver_id,
            sequence,
            command,
            payload,
        );
        self.write(&request).await?;

        match tokio::time::timeout(self.config.request_timeout, response).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::ConnectionLost),
            Err(_) => {
                tracing::debug!(command = %command, sequence, "request timed out");
                Err(Error::Timeout { command })
            }
        }
    }

    /// Ask the device to push `command` every `interval` and invoke
    /// `callback` for each push.
    ///
    /// The callback runs on the reader task and must not block.
    pub async fn subscribe<F>(&self, command: CommandPair, interval: Duration, callback: F) -> Result<SubscriptionId>
    where
        F: Fn(&Packet) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed));
        {
            let mut state = self.state.lock();
            if state.closed {
                return Err(Error::Closed);
            }
            state
                .subscriptions
                .entry(command)
                .or_default()
                .push((id, Arc::new(callback)));
        }

        let interval_ms = u16::try_from(interval.as_millis()).unwrap_or(u16::MAX);
        let payload = PayloadWriter::new()
            .u8(command.main)
            .u8(command.sub)
            .u16(interval_ms)
            .finish()?;

        let acked = self
            .send(CommandPair::SUBSCRIBE, payload)
            .await
            .and_then(|response| check_result(&response));
        if let Err(err) = acked {
            self.remove_subscription(command, id);
            return Err(err);
        }

        Ok(id)
    }

    /// Remove one subscription. When it was the last one for `command`,
    /// the device is told to stop pushing.
    pub async fn unsubscribe(&self, command: CommandPair, id: SubscriptionId) -> Result<()> {
        if !self.remove_subscription(command, id) || self.is_closed() {
            return Ok(());
        }

        let payload = PayloadWriter::new().u8(command.main).u8(command.sub).finish()?;
        let response = self.send(CommandPair::UNSUBSCRIBE, payload).await?;
        check_result(&response)
    }

    /// Returns true when no subscriptions remain for `command`.
    fn remove_subscription(&self, command: CommandPair, id: SubscriptionId) -> bool {
        let mut state = self.state.lock();
        let Some(subscriptions) = state.subscriptions.get_mut(&command) else {
            return false;
        };
        subscriptions.retain(|(sid, _)| *sid != id);
        if subscriptions.is_empty() {
            state.subscriptions.remove(&command);
            true
        } else {
            false
        }
    }

    /// Route device-initiated requests for `command` to the returned
    /// channel until [Dispatcher::remove_handler] is called.
    ///
    /// Handlers outlive transport teardown; whoever registers one removes it.
    pub fn set_handler(&self, command: CommandPair) -> Result<mpsc::UnboundedReceiver<Packet>> {
        if self.is_closed() {
            return Err(Error::Closed);
        }

        match self.handlers.entry(command) {
            Entry::Occupied(entry) if !entry.get().is_closed() => Err(Error::HandlerBusy(command)),
            entry => {
                let (tx, rx) = mpsc::unbounded_channel();
                entry.insert(tx);
                Ok(rx)
            }
        }
    }

    /// Stop routing device-initiated requests for `command`.
    pub fn remove_handler(&self, command: CommandPair) {
        self.handlers.remove(&command);
    }

    /// Reply to a device-initiated request.
    pub async fn ack(&self, request: &Packet, payload: Bytes) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        self.write(&Packet::response_to(request, payload)).await
    }

    /// Tear down: reject every pending request with
    /// [Error::ConnectionLost], drop all subscriptions, and shut the
    /// transport down.
    pub async fn close(&self) {
        self.teardown("closed by host");
        let mut writer = self.writer.lock().await;
        if let Err(err) = writer.shutdown().await {
            tracing::debug!(error = %err, "transport shutdown failed");
        }
    }

    /// Whether the dispatcher has been torn down.
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Resolves once the dispatcher is torn down, for any reason.
    pub async fn closed(&self) {
        self.shutdown.cancelled().await
    }

    /// Why the dispatcher was torn down, if it was.
    pub fn close_reason(&self) -> Option<String> {
        self.close_reason.lock().clone()
    }

    /// Requests awaiting a response.
    pub fn in_flight(&self) -> usize {
        self.state.lock().table.len()
    }

    /// Registered subscription callbacks across all command pairs.
    pub fn subscription_count(&self) -> usize {
        self.state.lock().subscriptions.values().map(Vec::len).sum()
    }

    async fn write(&self, packet: &Packet) -> Result<()> {
        let bytes = packet.encode()?;
        let mut writer = self.writer.lock().await;
        let written = match writer.write_all(&bytes).await {
            Ok(()) => writer.flush().await,
            Err(err) => Err(err),
        };
        drop(writer);

        if let Err(err) = written {
            tracing::warn!(error = %err, command = %packet.command, "transport write failed");
            self.teardown(format!("transport write failed: {err}"));
            return Err(err.into());
        }
        Ok(())
    }

    fn route(&self, packet: Packet) {
        match packet.attribute {
            Attribute::Response => self.resolve(packet),
            Attribute::Request => self.deliver(packet),
        }
    }

    fn resolve(&self, packet: Packet) {
        let pending = {
            let mut state = self.state.lock();
            let Some(pending) = state.table.take(packet.sequence) else {
                tracing::warn!(
                    sequence = packet.sequence,
                    command = %packet.command,
                    "response for unknown sequence id"
                );
                return;
            };
            if pending.command != packet.command {
                tracing::warn!(
                    sequence = packet.sequence,
                    expected = %pending.command,
                    actual = %packet.command,
                    "response command does not match request"
                );
                state.table.restore(pending);
                return;
            }
            pending
        };

        let Pending {
            created_at, reply, ..
        } = pending;
        tracing::trace!(
            sequence = packet.sequence,
            command = %packet.command,
            elapsed = ?created_at.elapsed(),
            "response"
        );
        // The caller may have given up already.
        let _ = reply.send(Ok(packet));
    }

    fn deliver(&self, mut packet: Packet) {
        let command = packet.command;

        let stale = match self.handlers.get(&command) {
            Some(handler) => match handler.send(packet) {
                Ok(()) => return,
                Err(mpsc::error::SendError(returned)) => {
                    packet = returned;
                    true
                }
            },
            None => false,
        };
        if stale {
            self.handlers.remove_if(&command, |_, tx| tx.is_closed());
        }

        let callbacks: Vec<Callback> = self
            .state
            .lock()
            .subscriptions
            .get(&command)
            .map(|subscriptions| subscriptions.iter().map(|(_, callback)| callback.clone()).collect())
            .unwrap_or_default();

        if callbacks.is_empty() {
            tracing::trace!(command = %command, sequence = packet.sequence, "unhandled device request");
            return;
        }

        for callback in callbacks {
            callback(&packet);
        }
    }

    fn teardown(&self, reason: impl Into<String>) {
        let drained = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.subscriptions.clear();
            state.table.drain()
        };

        let reason = reason.into();
        tracing::info!(reason = %reason, rejected = drained.len(), "dispatcher closed");
        *self.close_reason.lock() = Some(reason);

        for pending in drained {
            let _ = pending.reply.send(Err(Error::ConnectionLost));
        }
        self.shutdown.cancel();
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

struct SlotGuard<'a> {
    dispatcher: &'a Dispatcher,
    sequence: u16,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        self.dispatcher.state.lock().table.take(self.sequence);
    }
}

/// Fail unless the response's leading result byte is `0`.
pub fn check_result(response: &Packet) -> Result<()> {
    match response.result() {
        Some(0) => Ok(()),
        Some(result) => Err(Error::Command {
            command: response.command,
            result,
        }),
        None => Err(DecodeError::Truncated {
            needed: 1,
            remaining: 0,
        }
        .into()),
    }
}

async fn read_loop<R>(dispatcher: Weak<Dispatcher>, mut reader: ReadHalf<R>, shutdown: CancellationToken)
where
    R: AsyncRead,
{
    let mut parser = PacketParser::new();
    let mut buf = vec![0u8; READ_BUFFER_LEN];

    let reason = loop {
        let read = tokio::select! {
            _ = shutdown.cancelled() => return,
            read = reader.read(&mut buf) => read,
        };

        match read {
            Ok(0) => break "transport closed by peer".to_owned(),
            Ok(n) => {
                parser.push(&buf[..n]);
                let Some(dispatcher) = dispatcher.upgrade() else {
                    return;
                };
                while let Some(frame) = parser.next_packet() {
                    match frame {
                        Ok(packet) => dispatcher.route(packet),
                        Err(err) => tracing::warn!(error = %err, "dropping malformed frame"),
                    }
                }
            }
            Err(err) => break format!("transport read failed: {err}"),
        }
    };

    if let Some(dispatcher) = dispatcher.upgrade() {
        dispatcher.teardown(reason);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use pretty_assertions::assert_eq;
    use testresult::TestResult;

    use super::*;
    use crate::test_device::TestDevice;

    fn connect() -> (Arc<Dispatcher>, TestDevice) {
        let (transport, device) = TestDevice::pair();
        (Dispatcher::new(transport, DispatcherConfig::default()), device)
    }

    #[tokio::test]
    async fn test_out_of_order_responses() -> TestResult {
        let (dispatcher, mut device) = connect();

        let calls: Vec<_> = (0..4u8)
            .map(|i| {
                let dispatcher = dispatcher.clone();
                tokio::spawn(async move { dispatcher.send(CommandPair::EXECUTE_GCODE, Bytes::from(vec![i])).await })
            })
            .collect();

        let mut requests = Vec::new();
        for _ in 0..4 {
            requests.push(device.recv().await);
        }
        let mut sequences: Vec<_> = requests.iter().map(|r| r.sequence).collect();
        sequences.sort_unstable();
        sequences.dedup();
        assert_eq!(sequences.len(), 4);

        for request in requests.iter().rev() {
            device.reply(request, vec![0, request.data[0]]).await;
        }

        for (i, call) in calls.into_iter().enumerate() {
            let response = call.await??;
            assert_eq!(response.data[1], i as u8);
        }
        assert_eq!(dispatcher.in_flight(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_oversized_request_is_refused_without_teardown() -> TestResult {
        let (dispatcher, mut device) = connect();

        let oversized = Bytes::from(vec![0; crate::packet::MAX_PAYLOAD_LEN + 5]);
        let result = dispatcher.send(CommandPair::EXECUTE_GCODE, oversized).await;
        assert!(matches!(result, Err(Error::PayloadTooLarge { .. })));
        assert_eq!(dispatcher.in_flight(), 0);
        assert!(!dispatcher.is_closed());

        let call = {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move { dispatcher.send(CommandPair::HOME, Bytes::from_static(&[0])).await })
        };
        let request = device.recv().await;
        assert_eq!(request.command, CommandPair::HOME);
        device.reply(&request, vec![0]).await;
        assert_eq!(call.await??.result(), Some(0));
        Ok(())
    }

    #[tokio::test]
    async fn test_close_rejects_pending_and_clears_subscriptions() -> TestResult {
        let (dispatcher, mut device) = connect();

        let subscribe = tokio::spawn({
            let dispatcher = dispatcher.clone();
            async move {
                dispatcher
                    .subscribe(CommandPair::HEARTBEAT, Duration::from_secs(1), |_| {})
                    .await
            }
        });
        let request = device.recv().await;
        assert_eq!(request.command, CommandPair::SUBSCRIBE);
        assert_eq!(&request.data[..], &[0x01, 0xa0, 0xe8, 0x03]);
        device.reply(&request, vec![0]).await;
        subscribe.await??;
        assert_eq!(dispatcher.subscription_count(), 1);

        let calls: Vec<_> = (0..3)
            .map(|_| {
                let dispatcher = dispatcher.clone();
                tokio::spawn(async move { dispatcher.send(CommandPair::HOME, Bytes::from_static(&[0])).await })
            })
            .collect();
        for _ in 0..3 {
            device.recv().await;
        }
        assert_eq!(dispatcher.in_flight(), 3);

        dispatcher.close().await;

        for call in calls {
            assert!(matches!(call.await?, Err(Error::ConnectionLost)));
        }
        assert_eq!(dispatcher.subscription_count(), 0);
        assert_eq!(dispatcher.in_flight(), 0);
        assert!(matches!(
            dispatcher.send(CommandPair::HOME, Bytes::new()).await,
            Err(Error::Closed)
        ));
        assert!(matches!(
            dispatcher.subscribe(CommandPair::HEARTBEAT, Duration::from_secs(1), |_| {}).await,
            Err(Error::Closed)
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_subscription_fan_out() -> TestResult {
        let (dispatcher, mut device) = connect();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let mut ids = Vec::new();
        for tag in 0..2u8 {
            let tx = tx.clone();
            let subscribe = tokio::spawn({
                let dispatcher = dispatcher.clone();
                async move {
                    dispatcher
                        .subscribe(CommandPair::HEARTBEAT, Duration::from_secs(1), move |packet| {
                            let _ = tx.send((tag, packet.data[1]));
                        })
                        .await
                }
            });
            let request = device.recv().await;
            device.reply(&request, vec![0]).await;
            ids.push(subscribe.await??);
        }

        device.push(CommandPair::HEARTBEAT, 0, vec![0, 1]).await;
        device.push(CommandPair::HEARTBEAT, 0, vec![0, 2]).await;

        let mut seen = Vec::new();
        for _ in 0..4 {
            seen.push(rx.recv().await.ok_or("callback channel closed")?);
        }
        assert_eq!(seen, vec![(0, 1), (1, 1), (0, 2), (1, 2)]);

        // Removing the first leaves the command subscribed; no request goes out.
        dispatcher.unsubscribe(CommandPair::HEARTBEAT, ids[0]).await?;
        assert_eq!(dispatcher.subscription_count(), 1);

        let unsubscribe = tokio::spawn({
            let dispatcher = dispatcher.clone();
            let id = ids[1];
            async move { dispatcher.unsubscribe(CommandPair::HEARTBEAT, id).await }
        });
        let request = device.recv().await;
        assert_eq!(request.command, CommandPair::UNSUBSCRIBE);
        assert_eq!(&request.data[..], &[0x01, 0xa0]);
        device.reply(&request, vec![0]).await;
        unsubscribe.await??;
        assert_eq!(dispatcher.subscription_count(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_rejected_subscription_is_removed() -> TestResult {
        let (dispatcher, mut device) = connect();

        let subscribe = tokio::spawn({
            let dispatcher = dispatcher.clone();
            async move {
                dispatcher
                    .subscribe(CommandPair::LASER_INFO, Duration::from_secs(1), |_| {})
                    .await
            }
        });
        let request = device.recv().await;
        device.reply(&request, vec![7]).await;

        assert!(matches!(subscribe.await?, Err(Error::Command { result: 7, .. })));
        assert_eq!(dispatcher.subscription_count(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_handler_and_ack() -> TestResult {
        let (dispatcher, mut device) = connect();
        let mut requests = dispatcher.set_handler(CommandPair::UPLOAD_CHUNK)?;
        assert!(matches!(
            dispatcher.set_handler(CommandPair::UPLOAD_CHUNK),
            Err(Error::HandlerBusy(_))
        ));

        device.push(CommandPair::UPLOAD_CHUNK, 41, vec![1, 2, 3]).await;
        let request = requests.recv().await.ok_or("handler channel closed")?;
        assert_eq!(request.sequence, 41);

        dispatcher.ack(&request, Bytes::from_static(&[0, 9])).await?;
        let response = device.recv().await;
        assert_eq!(response.attribute, Attribute::Response);
        assert_eq!(response.sequence, 41);
        assert_eq!(response.command, CommandPair::UPLOAD_CHUNK);
        assert_eq!(response.receiver_id, PeerId::CONTROLLER);
        assert_eq!(&response.data[..], &[0, 9]);

        // Handlers survive teardown until their owner removes them.
        dispatcher.close().await;
        assert_eq!(dispatcher.handlers.len(), 1);
        dispatcher.remove_handler(CommandPair::UPLOAD_CHUNK);
        assert!(dispatcher.handlers.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_dropped_handler_falls_back_to_subscriptions() -> TestResult {
        let (dispatcher, mut device) = connect();
        let hits = Arc::new(AtomicUsize::new(0));

        let subscribe = tokio::spawn({
            let dispatcher = dispatcher.clone();
            let hits = hits.clone();
            async move {
                dispatcher
                    .subscribe(CommandPair::BED_INFO, Duration::from_secs(1), move |_| {
                        hits.fetch_add(1, Ordering::SeqCst);
                    })
                    .await
            }
        });
        let request = device.recv().await;
        device.reply(&request, vec![0]).await;
        subscribe.await??;

        drop(dispatcher.set_handler(CommandPair::BED_INFO)?);
        device.push(CommandPair::BED_INFO, 0, vec![0]).await;

        // A second handler can register once the stale one is gone.
        tokio::time::timeout(Duration::from_secs(1), async {
            while hits.load(Ordering::SeqCst) == 0 {
                tokio::task::yield_now().await;
            }
        })
        .await?;
        assert!(dispatcher.set_handler(CommandPair::BED_INFO).is_ok());
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_frees_slot() -> TestResult {
        let (dispatcher, mut device) = connect();

        let call = tokio::spawn({
            let dispatcher = dispatcher.clone();
            async move { dispatcher.send(CommandPair::MACHINE_INFO, Bytes::new()).await }
        });
        let request = device.recv().await;

        assert!(matches!(
            call.await?,
            Err(Error::Timeout {
                command: CommandPair::MACHINE_INFO
            })
        ));
        assert_eq!(dispatcher.in_flight(), 0);

        // A late response is dropped without disturbing anything.
        device.reply(&request, vec![0]).await;
        tokio::task::yield_now().await;
        assert!(!dispatcher.is_closed());
        Ok(())
    }

    #[tokio::test]
    async fn test_mismatched_response_is_ignored() -> TestResult {
        let (dispatcher, mut device) = connect();

        let call = tokio::spawn({
            let dispatcher = dispatcher.clone();
            async move { dispatcher.send(CommandPair::HOME, Bytes::from_static(&[0])).await }
        });
        let request = device.recv().await;

        let mut wrong = Packet::response_to(&request, Bytes::from_static(&[0]));
        wrong.command = CommandPair::MOVE;
        device.send(&wrong).await;
        device.reply(&request, vec![0]).await;

        let response = call.await??;
        assert_eq!(response.command, CommandPair::HOME);
        Ok(())
    }

    #[tokio::test]
    async fn test_peer_close_rejects_pending() -> TestResult {
        let (dispatcher, mut device) = connect();

        let call = tokio::spawn({
            let dispatcher = dispatcher.clone();
            async move { dispatcher.send(CommandPair::HOME, Bytes::from_static(&[0])).await }
        });
        device.recv().await;
        drop(device);

        assert!(matches!(call.await?, Err(Error::ConnectionLost)));
        dispatcher.closed().await;
        assert_eq!(dispatcher.close_reason().as_deref(), Some("transport closed by peer"));
        Ok(())
    }

    #[test]
    fn test_check_result() {
        let request = Packet::request(0, 2, 1, CommandPair::HOME, Bytes::new());
        assert!(check_result(&Packet::response_to(&request, Bytes::from_static(&[0]))).is_ok());
        assert!(matches!(
            check_result(&Packet::response_to(&request, Bytes::from_static(&[3]))),
            Err(Error::Command { result: 3, .. })
        ));
        assert!(matches!(
            check_result(&Packet::response_to(&request, Bytes::new())),
            Err(Error::Decode(_))
        ));
    }
}
