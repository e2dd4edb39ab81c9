use log::{debug, error, info, warn};
use serde::Serialize;
use serde_json::Value;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot, watch, Mutex as AsyncMutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, timeout, MissedTickBehavior};

use crate::bus::SubscriptionRegistry;
use crate::codec::stream::{encode_message, StreamDecoder};
use crate::diagnostics::LinkMetrics;
use crate::network::state::ConnectionState;
use crate::prelude::{LinkError, LinkResult, RelayConfig};

/// Self-healing TCP link to the partner station.
///
/// `start` spawns a supervisor that connects, runs the heartbeat and receive
/// tasks for the live session, and reconnects after the session is lost.
/// Outbound writes share one socket half behind an async mutex; `submit` queues
/// frames for a single writer task so callbacks never block on the socket.
/// `close` waits for frames queued before it to be written.
#[derive(Clone)]
pub struct NetworkRelay {
    inner: Arc<RelayInner>,
}

struct RelayInner {
    config: RelayConfig,
    runtime: Handle,
    state: Mutex<ConnectionState>,
    writer: AsyncMutex<Option<OwnedWriteHalf>>,
    session: Mutex<Option<Arc<Session>>>,
    stop: watch::Sender<bool>,
    outbound: mpsc::UnboundedSender<Outbound>,
    outbound_rx: Mutex<Option<mpsc::UnboundedReceiver<Outbound>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    connected: SubscriptionRegistry<()>,
    disconnected: SubscriptionRegistry<()>,
    data_received: SubscriptionRegistry<Value>,
    state_changed: SubscriptionRegistry<ConnectionState>,
    metrics: Arc<LinkMetrics>,
}

enum Outbound {
    Frame(Vec<u8>),
    /// Acknowledged once everything queued ahead of it has been handled.
    Flush(oneshot::Sender<()>),
}

/// One established connection. Torn down exactly once.
struct Session {
    lost: Notify,
    closed: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Session {
    fn new() -> Self {
        Self {
            lost: Notify::new(),
            closed: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        }
    }

    fn track(&self, task: JoinHandle<()>) {
        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.push(task);
        }
    }

    fn abort_tasks(&self) {
        if let Ok(mut tasks) = self.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
    }
}

impl NetworkRelay {
    pub fn new(config: RelayConfig, runtime: Handle, metrics: Arc<LinkMetrics>) -> Self {
        let (stop, _) = watch::channel(false);
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(RelayInner {
                config,
                runtime,
                state: Mutex::new(ConnectionState::Disconnected),
                writer: AsyncMutex::new(None),
                session: Mutex::new(None),
                stop,
                outbound,
                outbound_rx: Mutex::new(Some(outbound_rx)),
                tasks: Mutex::new(Vec::new()),
                connected: SubscriptionRegistry::new("partner-connected"),
                disconnected: SubscriptionRegistry::new("partner-disconnected"),
                data_received: SubscriptionRegistry::new("partner-data"),
                state_changed: SubscriptionRegistry::new("connection-state"),
                metrics,
            }),
        }
    }

    pub fn from_current(config: RelayConfig, metrics: Arc<LinkMetrics>) -> LinkResult<Self> {
        let runtime = Handle::try_current().map_err(|e| LinkError::Runtime(e.to_string()))?;
        Ok(Self::new(config, runtime, metrics))
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    pub fn connected(&self) -> &SubscriptionRegistry<()> {
        &self.inner.connected
    }

    pub fn disconnected(&self) -> &SubscriptionRegistry<()> {
        &self.inner.disconnected
    }

    /// Every JSON message decoded from the partner.
    pub fn data_received(&self) -> &SubscriptionRegistry<Value> {
        &self.inner.data_received
    }

    pub fn state_changed(&self) -> &SubscriptionRegistry<ConnectionState> {
        &self.inner.state_changed
    }

    /// Spawns the connection supervisor and the outbound writer. Idempotent.
    pub fn start(&self) {
        let Ok(mut tasks) = self.inner.tasks.lock() else {
            return;
        };
        if !tasks.is_empty() {
            debug!("Relay already started");
            return;
        }
        let stopped = *self.inner.stop.borrow();
        if stopped {
            warn!("Relay has been closed; not restarting");
            return;
        }

        info!("Starting relay to {}", self.inner.config.address());
        tasks.push(self.inner.runtime.spawn(self.inner.clone().supervise()));
        let outbound = self
            .inner
            .outbound_rx
            .lock()
            .ok()
            .and_then(|mut rx| rx.take());
        if let Some(outbound) = outbound {
            tasks.push(
                self.inner
                    .runtime
                    .spawn(self.inner.clone().drain_outbound(outbound)),
            );
        }
    }

    /// Encodes and writes one message. Without a connection the message is
    /// dropped with a warning and `Ok` is returned.
    pub async fn send<T: Serialize + ?Sized>(&self, message: &T) -> LinkResult<()> {
        if !self.is_connected() {
            warn!("Not connected to partner station; message not sent");
            self.inner.metrics.record_dropped();
            return Ok(());
        }
        let frame = encode_message(message)?;
        self.inner.write_frame(&frame).await
    }

    /// Queues a message for the writer task without blocking.
    pub fn submit<T: Serialize + ?Sized>(&self, message: &T) -> LinkResult<()> {
        let frame = encode_message(message)?;
        self.inner
            .outbound
            .send(Outbound::Frame(frame))
            .map_err(|_| LinkError::NotConnected)
    }

    /// Writes out already queued frames, stops reconnecting, tears down the
    /// live session and joins the relay's tasks. A task that outlives the join
    /// timeout is aborted.
    pub async fn close(&self) {
        let started = self
            .inner
            .tasks
            .lock()
            .map(|tasks| !tasks.is_empty())
            .unwrap_or(false);
        if started {
            self.inner.flush_outbound().await;
        }
        self.inner.stop.send_replace(true);

        let tasks = self
            .inner
            .tasks
            .lock()
            .map(|mut tasks| std::mem::take(&mut *tasks))
            .unwrap_or_default();
        let join_timeout = self.inner.config.join_timeout();
        for mut task in tasks {
            if timeout(join_timeout, &mut task).await.is_err() {
                warn!("Relay task still running after {:?}; aborting", join_timeout);
                task.abort();
            }
        }

        if let Some(session) = self.inner.current_session() {
            self.inner.end_session(&session).await;
        }
        self.inner.set_state(ConnectionState::Disconnected);
    }
}

impl RelayInner {
    fn state(&self) -> ConnectionState {
        self.state.lock().map(|s| *s).unwrap_or_default()
    }

    fn set_state(&self, next: ConnectionState) {
        let changed = match self.state.lock() {
            Ok(mut state) => {
                let changed = *state != next;
                *state = next;
                changed
            }
            Err(_) => false,
        };
        if changed {
            debug!("Connection state -> {}", next);
            self.state_changed.publish(&next);
        }
    }

    fn current_session(&self) -> Option<Arc<Session>> {
        self.session.lock().ok().and_then(|s| s.clone())
    }

    fn signal_lost(&self) {
        if let Some(session) = self.current_session() {
            session.lost.notify_one();
        }
    }

    async fn supervise(self: Arc<Self>) {
        let mut stop = self.stop.subscribe();
        while let Some(stream) = self.connect(&mut stop).await {
            let session = self.begin_session(stream).await;
            tokio::select! {
                _ = session.lost.notified() => warn!("Connection to partner station lost"),
                _ = stop.changed() => debug!("Relay stop requested"),
            }
            self.end_session(&session).await;
        }
        debug!("Relay supervisor exited");
    }

    /// Attempts to connect until it succeeds, the relay is stopped or the
    /// retry cap is reached.
    async fn connect(&self, stop: &mut watch::Receiver<bool>) -> Option<TcpStream> {
        let address = self.config.address();
        let mut failures: u32 = 0;
        loop {
            let stopped = *stop.borrow();
            if stopped {
                return None;
            }

            self.set_state(ConnectionState::Connecting);
            self.metrics.record_connect_attempt();
            let attempt = timeout(
                self.config.connect_timeout(),
                TcpStream::connect(address.as_str()),
            );
            let result = tokio::select! {
                result = attempt => result,
                _ = stop.changed() => {
                    self.set_state(ConnectionState::Disconnected);
                    return None;
                }
            };
            match result {
                Ok(Ok(stream)) => return Some(stream),
                Ok(Err(err)) => error!("Connecting to {} failed: {}", address, err),
                Err(_) => error!("Connecting to {} timed out", address),
            }

            failures += 1;
            if let Some(max) = self.config.max_retries {
                if failures >= max {
                    error!("Giving up on {} after {} failed attempts", address, failures);
                    self.set_state(ConnectionState::Disconnected);
                    return None;
                }
            }

            tokio::select! {
                _ = sleep(self.config.retry_delay()) => {}
                _ = stop.changed() => {
                    self.set_state(ConnectionState::Disconnected);
                    return None;
                }
            }
        }
    }

    async fn begin_session(self: &Arc<Self>, stream: TcpStream) -> Arc<Session> {
        if let Err(err) = stream.set_nodelay(true) {
            debug!("Could not disable Nagle: {}", err);
        }
        let peer = stream
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| self.config.address());
        let (reader, writer) = stream.into_split();
        *self.writer.lock().await = Some(writer);

        let session = Arc::new(Session::new());
        if let Ok(mut current) = self.session.lock() {
            *current = Some(session.clone());
        }

        self.metrics.record_connection();
        self.set_state(ConnectionState::Connected);
        info!("Connected to partner station at {}", peer);
        self.connected.publish(&());

        session.track(
            self.runtime
                .spawn(self.clone().receive_loop(reader, session.clone())),
        );
        session.track(self.runtime.spawn(self.clone().heartbeat_loop(session.clone())));
        session
    }

    async fn end_session(&self, session: &Arc<Session>) {
        if session.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        session.abort_tasks();
        if let Ok(mut current) = self.session.lock() {
            if current.as_ref().is_some_and(|c| Arc::ptr_eq(c, session)) {
                *current = None;
            }
        }

        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            if let Err(err) = writer.shutdown().await {
                debug!("Socket shutdown failed: {}", err);
            }
        }

        self.set_state(ConnectionState::Disconnected);
        info!("Closed partner station connection");
        self.disconnected.publish(&());
    }

    async fn receive_loop(self: Arc<Self>, mut reader: OwnedReadHalf, session: Arc<Session>) {
        let mut decoder = StreamDecoder::with_limit(self.config.max_frame_bytes);
        let mut buffer = vec![0u8; self.config.read_buffer_bytes.max(1)];
        loop {
            match reader.read(&mut buffer).await {
                Ok(0) => {
                    warn!("Partner station closed the connection");
                    break;
                }
                Ok(n) => {
                    for message in decoder.feed(&buffer[..n]) {
                        self.metrics.record_received();
                        debug!("Received from partner: {}", message);
                        self.data_received.publish(&message);
                    }
                }
                Err(err) => {
                    error!("Receiving from partner station failed: {}", err);
                    break;
                }
            }
        }
        session.lost.notify_one();
    }

    async fn heartbeat_loop(self: Arc<Self>, session: Arc<Session>) {
        let mut ticker = interval(self.config.heartbeat_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(err) = self.probe().await {
                warn!("Heartbeat failed: {}", err);
                break;
            }
        }
        session.lost.notify_one();
    }

    /// Zero-byte send followed by a check of the socket's pending error.
    async fn probe(&self) -> io::Result<()> {
        let mut writer = self.writer.lock().await;
        let Some(stream) = writer.as_mut() else {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "no socket"));
        };
        let _ = stream.write(&[]).await?;
        match stream.as_ref().take_error()? {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn write_frame(&self, frame: &[u8]) -> LinkResult<()> {
        let mut writer = self.writer.lock().await;
        let Some(stream) = writer.as_mut() else {
            warn!("Not connected to partner station; message not sent");
            self.metrics.record_dropped();
            return Ok(());
        };
        if let Err(err) = stream.write_all(frame).await {
            drop(writer);
            error!("Sending to partner station failed: {}", err);
            self.metrics.record_dropped();
            self.signal_lost();
            return Err(err.into());
        }
        self.metrics.record_sent();
        Ok(())
    }

    async fn drain_outbound(self: Arc<Self>, mut outbound: mpsc::UnboundedReceiver<Outbound>) {
        let mut stop = self.stop.subscribe();
        loop {
            tokio::select! {
                biased;
                item = outbound.recv() => match item {
                    Some(item) => self.deliver(item).await,
                    None => break,
                },
                _ = stop.changed() => {
                    while let Ok(item) = outbound.try_recv() {
                        self.deliver(item).await;
                    }
                    break;
                }
            }
        }
        debug!("Relay writer exited");
    }

    async fn deliver(&self, item: Outbound) {
        match item {
            Outbound::Frame(frame) => {
                if !self.state().is_connected() {
                    warn!("Not connected to partner station; queued message dropped");
                    self.metrics.record_dropped();
                } else if self.write_frame(&frame).await.is_err() {
                    debug!("Queued message lost with the connection");
                }
            }
            Outbound::Flush(done) => {
                let _ = done.send(());
            }
        }
    }

    /// Waits until every frame queued before this call has been handled.
    async fn flush_outbound(&self) {
        let (done, flushed) = oneshot::channel();
        if self.outbound.send(Outbound::Flush(done)).is_err() {
            return;
        }
        let limit = self.config.join_timeout();
        if timeout(limit, flushed).await.is_err() {
            warn!("Outbound queue not drained within {:?}", limit);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tokio::net::TcpListener;

    fn config(port: u16) -> RelayConfig {
        RelayConfig {
            host: "127.0.0.1".to_string(),
            port,
            retry_delay_ms: 50,
            max_retries: None,
            heartbeat_interval_ms: 50,
            connect_timeout_ms: 500,
            read_buffer_bytes: 64,
            max_frame_bytes: 1024,
            join_timeout_ms: 500,
        }
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        for _ in 0..300 {
            if condition() {
                return true;
            }
            sleep(Duration::from_millis(10)).await;
        }
        condition()
    }

    async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap())
            .await
            .unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    /// Closes with an RST instead of a FIN.
    #[allow(deprecated)]
    fn reset(stream: TcpStream) {
        stream.set_linger(Some(Duration::ZERO)).unwrap();
        drop(stream);
    }

    /// Hands the relay a live socket without running the supervisor.
    async fn install(relay: &NetworkRelay, stream: TcpStream) -> (OwnedReadHalf, Arc<Session>) {
        let (reader, writer) = stream.into_split();
        *relay.inner.writer.lock().await = Some(writer);
        let session = Arc::new(Session::new());
        *relay.inner.session.lock().unwrap() = Some(session.clone());
        relay.inner.set_state(ConnectionState::Connected);
        (reader, session)
    }

    fn counter(registry: &SubscriptionRegistry<()>) -> Arc<AtomicUsize> {
        let count = Arc::new(AtomicUsize::new(0));
        let inner = count.clone();
        registry.subscribe(move |_| {
            inner.fetch_add(1, Ordering::SeqCst);
        });
        count
    }

    #[tokio::test]
    async fn sends_and_receives_json_lines() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let relay = NetworkRelay::from_current(config(port), Arc::new(LinkMetrics::new())).unwrap();

        let received = Arc::new(Mutex::new(Vec::new()));
        {
            let received = received.clone();
            relay
                .data_received()
                .subscribe(move |v: &Value| received.lock().unwrap().push(v.clone()));
        }

        relay.start();
        let (server, _) = listener.accept().await.unwrap();
        assert!(wait_until(|| relay.is_connected()).await);

        relay.send(&json!({"altitude": 120.5})).await.unwrap();
        relay.submit(&json!({"altitude": 121.0})).unwrap();

        let (read_half, mut write_half) = server.into_split();
        let mut lines = BufReader::new(read_half).lines();
        let first = lines.next_line().await.unwrap().unwrap();
        let second = lines.next_line().await.unwrap().unwrap();
        assert_eq!(serde_json::from_str::<Value>(&first).unwrap(), json!({"altitude": 120.5}));
        assert_eq!(serde_json::from_str::<Value>(&second).unwrap(), json!({"altitude": 121.0}));

        write_half.write_all(b"{\"cmd\":").await.unwrap();
        sleep(Duration::from_millis(20)).await;
        write_half.write_all(b"\"ping\"}\nnot json\n").await.unwrap();
        assert!(wait_until(|| received.lock().unwrap().len() == 1).await);
        assert_eq!(received.lock().unwrap()[0], json!({"cmd": "ping"}));

        relay.close().await;
    }

    #[tokio::test]
    async fn reconnects_after_peer_drops() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let relay = NetworkRelay::from_current(config(port), Arc::new(LinkMetrics::new())).unwrap();

        let states = Arc::new(Mutex::new(Vec::new()));
        {
            let states = states.clone();
            relay
                .state_changed()
                .subscribe(move |s: &ConnectionState| states.lock().unwrap().push(*s));
        }
        let connected = counter(relay.connected());
        let disconnected = counter(relay.disconnected());

        relay.start();
        let (first, _) = listener.accept().await.unwrap();
        assert!(wait_until(|| relay.is_connected()).await);
        drop(first);

        let (_second, _) = listener.accept().await.unwrap();
        assert!(wait_until(|| connected.load(Ordering::SeqCst) == 2).await);
        assert_eq!(disconnected.load(Ordering::SeqCst), 1);
        assert_eq!(
            *states.lock().unwrap(),
            vec![
                ConnectionState::Connecting,
                ConnectionState::Connected,
                ConnectionState::Disconnected,
                ConnectionState::Connecting,
                ConnectionState::Connected,
            ]
        );

        relay.close().await;
        assert_eq!(disconnected.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn send_while_disconnected_is_a_no_op() {
        let metrics = Arc::new(LinkMetrics::new());
        let relay = NetworkRelay::from_current(config(9), metrics.clone()).unwrap();

        relay.send(&json!({"altitude": 1})).await.unwrap();

        assert_eq!(relay.state(), ConnectionState::Disconnected);
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.messages_dropped, 1);
        assert_eq!(snapshot.messages_sent, 0);
    }

    #[tokio::test]
    async fn close_shuts_the_socket_and_notifies() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let relay = NetworkRelay::from_current(config(port), Arc::new(LinkMetrics::new())).unwrap();
        let disconnected = counter(relay.disconnected());

        relay.start();
        let (mut server, _) = listener.accept().await.unwrap();
        assert!(wait_until(|| relay.is_connected()).await);

        relay.close().await;
        assert_eq!(disconnected.load(Ordering::SeqCst), 1);
        assert_eq!(relay.state(), ConnectionState::Disconnected);

        let mut buf = [0u8; 8];
        let n = timeout(Duration::from_secs(2), server.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);

        relay.start();
        assert_eq!(relay.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn gives_up_after_retry_cap() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let metrics = Arc::new(LinkMetrics::new());
        let mut config = config(port);
        config.max_retries = Some(2);
        config.retry_delay_ms = 10;
        let relay = NetworkRelay::from_current(config, metrics.clone()).unwrap();
        let connected = counter(relay.connected());

        relay.start();
        assert!(wait_until(|| metrics.snapshot().connect_attempts == 2
            && relay.state() == ConnectionState::Disconnected)
        .await);
        sleep(Duration::from_millis(100)).await;
        assert_eq!(metrics.snapshot().connect_attempts, 2);
        assert_eq!(connected.load(Ordering::SeqCst), 0);

        relay.close().await;
    }

    #[tokio::test]
    async fn queued_frames_are_written_before_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let relay = NetworkRelay::from_current(config(port), Arc::new(LinkMetrics::new())).unwrap();

        relay.start();
        let (server, _) = listener.accept().await.unwrap();
        assert!(wait_until(|| relay.is_connected()).await);

        for altitude in 0..3 {
            relay.submit(&json!({ "altitude": altitude })).unwrap();
        }
        relay.close().await;

        let mut lines = BufReader::new(server).lines();
        for altitude in 0..3 {
            let line = timeout(Duration::from_secs(2), lines.next_line())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            assert_eq!(
                serde_json::from_str::<Value>(&line).unwrap(),
                json!({ "altitude": altitude })
            );
        }
        assert!(lines.next_line().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn heartbeat_detects_a_reset_peer() {
        let relay = NetworkRelay::from_current(config(9), Arc::new(LinkMetrics::new())).unwrap();
        let (client, server) = socket_pair().await;
        let (_reader, session) = install(&relay, client).await;
        assert!(relay.inner.probe().await.is_ok());

        reset(server);
        sleep(Duration::from_millis(50)).await;
        assert!(relay.inner.probe().await.is_err());
        // the pending socket error is consumed by now; the send itself fails
        assert!(relay.inner.probe().await.is_err());

        let heartbeat = tokio::spawn(relay.inner.clone().heartbeat_loop(session.clone()));
        timeout(Duration::from_secs(2), heartbeat)
            .await
            .unwrap()
            .unwrap();
        timeout(Duration::from_secs(2), session.lost.notified())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn failed_write_marks_the_session_lost() {
        let metrics = Arc::new(LinkMetrics::new());
        let relay = NetworkRelay::from_current(config(9), metrics.clone()).unwrap();
        let (client, server) = socket_pair().await;
        let (_reader, session) = install(&relay, client).await;

        reset(server);
        sleep(Duration::from_millis(50)).await;
        assert!(relay.send(&json!({"altitude": 3})).await.is_err());

        timeout(Duration::from_secs(2), session.lost.notified())
            .await
            .unwrap();
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.messages_dropped, 1);
        assert_eq!(snapshot.messages_sent, 0);
    }

    #[tokio::test]
    async fn reset_peer_reconnects_within_the_retry_delay() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut config = config(port);
        config.retry_delay_ms = 2000;
        let retry_delay = config.retry_delay();
        let relay = NetworkRelay::from_current(config, Arc::new(LinkMetrics::new())).unwrap();
        let connected = counter(relay.connected());
        let disconnected = counter(relay.disconnected());

        relay.start();
        let (first, _) = listener.accept().await.unwrap();
        assert!(wait_until(|| relay.is_connected()).await);

        let dropped_at = std::time::Instant::now();
        reset(first);
        let (_second, _) = timeout(retry_delay, listener.accept())
            .await
            .unwrap()
            .unwrap();
        assert!(wait_until(|| connected.load(Ordering::SeqCst) == 2).await);
        assert!(dropped_at.elapsed() < retry_delay);
        assert_eq!(disconnected.load(Ordering::SeqCst), 1);

        relay.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn failed_attempts_are_spaced_by_the_retry_delay() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let metrics = Arc::new(LinkMetrics::new());
        let mut config = config(port);
        config.max_retries = Some(3);
        config.retry_delay_ms = 2000;
        let relay = NetworkRelay::from_current(config, metrics.clone()).unwrap();

        let started = tokio::time::Instant::now();
        relay.start();
        timeout(Duration::from_secs(30), async {
            while !(metrics.snapshot().connect_attempts == 3
                && relay.state() == ConnectionState::Disconnected)
            {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        // two delays between three attempts, each attempt bounded by the
        // connect timeout
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(4), "{:?}", elapsed);
        assert!(elapsed <= Duration::from_millis(5600), "{:?}", elapsed);

        relay.close().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn close_abandons_a_task_that_outlives_the_join_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut config = config(port);
        config.join_timeout_ms = 100;
        let relay = NetworkRelay::from_current(config, Arc::new(LinkMetrics::new())).unwrap();

        let released = Arc::new(AtomicUsize::new(0));
        {
            let released = released.clone();
            relay.disconnected().subscribe(move |_| {
                std::thread::sleep(Duration::from_millis(800));
                released.fetch_add(1, Ordering::SeqCst);
            });
        }

        relay.start();
        let (_server, _) = listener.accept().await.unwrap();
        assert!(wait_until(|| relay.is_connected()).await);

        let closing = std::time::Instant::now();
        relay.close().await;
        assert!(closing.elapsed() < Duration::from_millis(600));
        assert_eq!(relay.state(), ConnectionState::Disconnected);
        assert!(wait_until(|| released.load(Ordering::SeqCst) == 1).await);
    }
}
