//! Link-layer connection: TCP transport, state machine, timers, windowing
//!
//! One [`Connection`] owns one TCP link to an outstation and runs a dedicated
//! I/O task that is the only code touching the socket and the sequence
//! counters. Callers submit work through an intent channel and observe the
//! link through a state watch and an event stream, so the protocol state
//! machine is never blocked by consumer code.
//!
//! The state machine follows IEC 60870-5-104:
//!
//! ```text
//! Closed --open()--> Connecting --tcp up--> Unconfirmed --STARTDT con--> Active
//! Active --close()--> Stopping --STOPDT con--> Closed
//! any state --error/timeout--> Broken
//! ```
//!
//! Four timers supervise the link: t0 bounds the TCP connect, t1 bounds every
//! awaited confirmation (STARTDT/STOPDT/TESTFR and I-frame acks), t2 delays
//! our supervisory acks, and t3 sends TESTFR keepalives through idle periods.
//! The k/w counters implement the sliding send/ack windows.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch, RwLock};
use tokio::time::{sleep_until, timeout, Instant};
use tokio_util::codec::Framed;
use tracing::{debug, info, trace, warn};

use crate::asdu::Asdu;
use crate::error::{Iec104Error, Result};
use crate::frame::{seq_add, seq_distance, Apci, Apdu, ApduCodec, UFunction};
use crate::types::DEFAULT_PORT;

/// Intents parked while the send window is closed, beyond which submissions
/// are refused
const SEND_QUEUE_LIMIT: usize = 64;

/// Capacity of the intent channel from callers to the I/O task
const INTENT_CHANNEL_SIZE: usize = 32;

/// Capacity of the event channel from the I/O task to the consumer
const EVENT_CHANNEL_SIZE: usize = 256;

/// Link configuration with the IEC 60870-5-104 standard defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Outstation host address
    pub host: String,
    /// Outstation TCP port
    pub port: u16,
    /// Maximum number of unacknowledged I-frames in flight
    pub k: u16,
    /// Received I-frames that force a supervisory acknowledgement
    pub w: u16,
    /// Connection establishment timeout
    pub t0: Duration,
    /// Confirmation timeout (send supervision)
    pub t1: Duration,
    /// Acknowledgement delay (must stay below t1)
    pub t2: Duration,
    /// Idle test-frame period
    pub t3: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            k: 12,
            w: 8,
            t0: Duration::from_secs(30),
            t1: Duration::from_secs(15),
            t2: Duration::from_secs(10),
            t3: Duration::from_secs(20),
        }
    }
}

impl ConnectionConfig {
    /// Validate parameter consistency before opening a link
    pub fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            return Err(Iec104Error::ConfigError("host cannot be empty".to_string()));
        }
        if self.port == 0 {
            return Err(Iec104Error::ConfigError("port cannot be zero".to_string()));
        }
        if self.k == 0 || self.k > 32_767 {
            return Err(Iec104Error::ConfigError(format!(
                "k = {} outside 1..=32767",
                self.k
            )));
        }
        if self.w == 0 || self.w > self.k {
            return Err(Iec104Error::ConfigError(format!(
                "w = {} must be within 1..=k (k = {})",
                self.w, self.k
            )));
        }
        if self.w > self.k * 2 / 3 {
            warn!(
                "w = {} exceeds 2k/3 (k = {}); acknowledgements may arrive late",
                self.w, self.k
            );
        }
        if self.t2 >= self.t1 {
            return Err(Iec104Error::ConfigError(format!(
                "t2 ({:?}) must be shorter than t1 ({:?})",
                self.t2, self.t1
            )));
        }
        if self.t3.is_zero() {
            return Err(Iec104Error::ConfigError("t3 cannot be zero".to_string()));
        }
        Ok(())
    }

    /// `host:port` form used in log messages and registry keys
    pub fn remote(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Observable link state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkState {
    Closed,
    Connecting,
    Unconfirmed,
    Active,
    Stopping,
    Broken,
}

/// Events delivered from the I/O task to the session layer, in arrival order
#[derive(Debug)]
pub enum LinkEvent {
    /// A decoded ASDU from an I-frame
    Asdu(Asdu),
    /// The link terminated; `error` is `None` after a clean STOPDT exchange
    Closed { error: Option<Iec104Error> },
}

/// Link traffic counters
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionStats {
    pub frames_sent: u64,
    pub frames_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub s_frames_sent: u64,
    pub test_frames_sent: u64,
    pub last_activity: Option<DateTime<Utc>>,
}

enum Intent {
    SendAsdu {
        asdu: Asdu,
        done: oneshot::Sender<Result<()>>,
    },
    Stop,
}

/// Handle to a running link
///
/// Cheap to clone-by-reference through `Arc`; dropping the last handle makes
/// the I/O task send STOPDT and close the socket.
#[derive(Debug)]
pub struct Connection {
    config: ConnectionConfig,
    state_rx: watch::Receiver<LinkState>,
    intent_tx: mpsc::Sender<Intent>,
    stats: Arc<RwLock<ConnectionStats>>,
}

impl Connection {
    /// Dial the outstation and drive the link to `Active`
    ///
    /// Returns the connection handle and the event stream the session layer
    /// consumes. Fails with `ConnectTimeout` when TCP does not come up within
    /// t0 and `HandshakeTimeout` when STARTDT is not confirmed within t1.
    pub async fn open(config: ConnectionConfig) -> Result<(Connection, mpsc::Receiver<LinkEvent>)> {
        config.validate()?;
        let remote = config.remote();
        debug!("connecting to {remote}");

        let stream = timeout(config.t0, TcpStream::connect(&remote))
            .await
            .map_err(|_| Iec104Error::ConnectTimeout(remote.clone()))?
            .map_err(|e| Iec104Error::TransportIo(format!("connect to {remote}: {e}")))?;
        stream
            .set_nodelay(true)
            .map_err(|e| Iec104Error::TransportIo(e.to_string()))?;

        let t1 = config.t1;
        let (conn, events) = Self::spawn(config, stream);
        conn.wait_for_state(LinkState::Active, t1).await?;
        info!("link to {remote} active");
        Ok((conn, events))
    }

    /// Run the link over an already-established byte stream
    ///
    /// The production path is [`Connection::open`]; this entry point exists
    /// for in-memory transports in tests and for callers that manage their
    /// own sockets. The STARTDT handshake starts immediately.
    pub fn spawn<S>(config: ConnectionConfig, stream: S) -> (Connection, mpsc::Receiver<LinkEvent>)
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (state_tx, state_rx) = watch::channel(LinkState::Connecting);
        let (intent_tx, intent_rx) = mpsc::channel(INTENT_CHANNEL_SIZE);
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_SIZE);
        let stats = Arc::new(RwLock::new(ConnectionStats::default()));

        let task = IoTask {
            framed: Framed::new(stream, ApduCodec),
            config: config.clone(),
            state: state_tx,
            intent_rx,
            event_tx,
            stats: stats.clone(),
            vs: 0,
            va: 0,
            vr: 0,
            ack_pending: 0,
            intents_open: true,
            parked: VecDeque::new(),
            t1_deadline: None,
            t2_deadline: None,
            t3_deadline: None,
        };
        tokio::spawn(task.run());

        (
            Connection {
                config,
                state_rx,
                intent_tx,
                stats,
            },
            event_rx,
        )
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Current link state
    pub fn state(&self) -> LinkState {
        *self.state_rx.borrow()
    }

    /// Whether data transfer is running
    pub fn is_active(&self) -> bool {
        self.state() == LinkState::Active
    }

    /// Block until the link reaches `target` or the deadline passes
    pub async fn wait_for_state(&self, target: LinkState, deadline: Duration) -> Result<()> {
        let mut rx = self.state_rx.clone();
        let wait = async {
            loop {
                let current = *rx.borrow();
                if current == target {
                    return Ok(());
                }
                if target == LinkState::Active
                    && matches!(current, LinkState::Broken | LinkState::Closed)
                {
                    return Err(Iec104Error::NotConnected);
                }
                rx.changed()
                    .await
                    .map_err(|_| Iec104Error::ChannelClosed("link task exited".to_string()))?;
            }
        };
        timeout(deadline, wait).await.map_err(|_| {
            Iec104Error::HandshakeTimeout(format!(
                "link did not reach {target:?} within {deadline:?}"
            ))
        })?
    }

    /// Queue an ASDU for transmission as an I-frame
    ///
    /// Resolves once the frame is written to the socket (not when the peer
    /// acknowledges it). While the send window is closed the frame is parked
    /// inside the I/O task.
    pub async fn send_asdu(&self, asdu: Asdu) -> Result<()> {
        let (done, ack) = oneshot::channel();
        self.intent_tx
            .send(Intent::SendAsdu { asdu, done })
            .await
            .map_err(|_| Iec104Error::NotConnected)?;
        ack.await
            .map_err(|_| Iec104Error::ChannelClosed("link task dropped the send".to_string()))?
    }

    /// Initiate the STOPDT exchange and close the socket
    pub async fn close(&self) {
        let _ = self.intent_tx.send(Intent::Stop).await;
        // Bounded wait for the clean exchange; the task hard-closes on t1.
        let _ = self
            .wait_for_state(LinkState::Closed, self.config.t1)
            .await;
    }

    /// Snapshot of the traffic counters
    pub async fn stats(&self) -> ConnectionStats {
        self.stats.read().await.clone()
    }
}

struct ParkedSend {
    asdu: Asdu,
    done: oneshot::Sender<Result<()>>,
}

struct IoTask<S> {
    framed: Framed<S, ApduCodec>,
    config: ConnectionConfig,
    state: watch::Sender<LinkState>,
    intent_rx: mpsc::Receiver<Intent>,
    event_tx: mpsc::Sender<LinkEvent>,
    stats: Arc<RwLock<ConnectionStats>>,
    /// Send sequence number of the next outgoing I-frame
    vs: u16,
    /// Highest send sequence number the peer has acknowledged
    va: u16,
    /// Expected send sequence number of the next incoming I-frame
    vr: u16,
    /// Received I-frames not yet acknowledged by us
    ack_pending: u16,
    /// False once every caller handle is gone and the stop began
    intents_open: bool,
    parked: VecDeque<ParkedSend>,
    t1_deadline: Option<Instant>,
    t2_deadline: Option<Instant>,
    t3_deadline: Option<Instant>,
}

impl<S> IoTask<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    async fn run(mut self) {
        self.set_state(LinkState::Unconfirmed);
        if let Err(e) = self.send_u(UFunction::StartDtAct).await {
            self.finish(Some(e)).await;
            return;
        }
        self.t1_deadline = Some(Instant::now() + self.config.t1);

        loop {
            let timer = self.next_deadline();
            tokio::select! {
                frame = self.framed.next() => match frame {
                    Some(Ok(apdu)) => {
                        if let Err(e) = self.handle_frame(apdu).await {
                            self.finish(Some(e)).await;
                            return;
                        }
                        if self.terminal() {
                            return;
                        }
                    }
                    Some(Err(e)) => {
                        self.finish(Some(e)).await;
                        return;
                    }
                    None => {
                        let error = if *self.state.borrow() == LinkState::Stopping {
                            None
                        } else {
                            Some(Iec104Error::TransportIo(
                                "connection closed by peer".to_string(),
                            ))
                        };
                        self.finish(error).await;
                        return;
                    }
                },
                intent = self.intent_rx.recv(), if self.intents_open => {
                    if intent.is_none() {
                        self.intents_open = false;
                    }
                    match intent {
                        Some(Intent::SendAsdu { asdu, done }) => {
                            if let Err(e) = self.submit_send(asdu, done).await {
                                self.finish(Some(e)).await;
                                return;
                            }
                        }
                        Some(Intent::Stop) | None => {
                            if let Err(e) = self.begin_stop().await {
                                self.finish(Some(e)).await;
                                return;
                            }
                            if self.terminal() {
                                return;
                            }
                        }
                    }
                },
                _ = async {
                    match timer {
                        Some(deadline) => sleep_until(deadline).await,
                        None => std::future::pending().await,
                    }
                } => {
                    match self.on_timer().await {
                        Ok(true) => {}
                        Ok(false) => return,
                        Err(e) => {
                            self.finish(Some(e)).await;
                            return;
                        }
                    }
                }
            }
        }
    }

    fn terminal(&self) -> bool {
        matches!(
            *self.state.borrow(),
            LinkState::Closed | LinkState::Broken
        )
    }

    fn set_state(&self, state: LinkState) {
        if *self.state.borrow() != state {
            debug!("{} link state -> {state:?}", self.config.remote());
            let _ = self.state.send(state);
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        [self.t1_deadline, self.t2_deadline, self.t3_deadline]
            .into_iter()
            .flatten()
            .min()
    }

    /// Timer dispatch. `Ok(false)` means the task finished cleanly.
    async fn on_timer(&mut self) -> Result<bool> {
        let now = Instant::now();

        if self.t1_deadline.is_some_and(|d| now >= d) {
            if *self.state.borrow() == LinkState::Stopping {
                // Peer never confirmed STOPDT; hard-close without an error.
                self.finish(None).await;
                return Ok(false);
            }
            return Err(Iec104Error::HandshakeTimeout(format!(
                "{} did not confirm within t1",
                self.config.remote()
            )));
        }

        if self.t2_deadline.is_some_and(|d| now >= d) {
            self.t2_deadline = None;
            if self.ack_pending > 0 {
                self.send_s_frame().await?;
            }
        }

        if self.t3_deadline.is_some_and(|d| now >= d) {
            self.t3_deadline = Some(now + self.config.t3);
            self.send_u(UFunction::TestFrAct).await?;
            self.stats.write().await.test_frames_sent += 1;
            if self.t1_deadline.is_none() {
                self.t1_deadline = Some(now + self.config.t1);
            }
        }

        Ok(true)
    }

    async fn handle_frame(&mut self, apdu: Apdu) -> Result<()> {
        trace!(
            "{} RX {:?} asdu={}",
            self.config.remote(),
            apdu.apci,
            hex::encode(&apdu.asdu)
        );
        {
            let mut stats = self.stats.write().await;
            stats.frames_received += 1;
            stats.bytes_received += (6 + apdu.asdu.len()) as u64;
            stats.last_activity = Some(Utc::now());
        }
        if *self.state.borrow() == LinkState::Active {
            self.t3_deadline = Some(Instant::now() + self.config.t3);
        }

        match apdu.apci {
            Apci::U(func) => self.handle_u_frame(func).await,
            Apci::S { recv_seq } => {
                self.apply_peer_ack(recv_seq)?;
                self.flush_parked().await
            }
            Apci::I { send_seq, recv_seq } => self.handle_i_frame(send_seq, recv_seq, apdu).await,
        }
    }

    async fn handle_u_frame(&mut self, func: UFunction) -> Result<()> {
        match func {
            UFunction::StartDtCon => {
                if *self.state.borrow() == LinkState::Unconfirmed {
                    self.t1_deadline = None;
                    self.t3_deadline = Some(Instant::now() + self.config.t3);
                    self.set_state(LinkState::Active);
                    self.flush_parked().await?;
                } else {
                    warn!("{} unexpected STARTDT con", self.config.remote());
                }
            }
            UFunction::TestFrAct => {
                self.send_u(UFunction::TestFrCon).await?;
            }
            UFunction::TestFrCon => {
                // Keepalive answered; nothing else outstanding clears t1.
                if seq_distance(self.va, self.vs) == 0 {
                    self.t1_deadline = None;
                }
            }
            UFunction::StopDtCon => {
                if *self.state.borrow() == LinkState::Stopping {
                    self.finish(None).await;
                } else {
                    warn!("{} unexpected STOPDT con", self.config.remote());
                }
            }
            UFunction::StopDtAct => {
                let _ = self.send_u(UFunction::StopDtCon).await;
                self.finish(Some(Iec104Error::PeerStopped)).await;
            }
            UFunction::StartDtAct => {
                // Only the controlling station starts data transfer.
                warn!("{} peer sent STARTDT act", self.config.remote());
            }
        }
        Ok(())
    }

    async fn handle_i_frame(&mut self, send_seq: u16, recv_seq: u16, apdu: Apdu) -> Result<()> {
        if *self.state.borrow() != LinkState::Active {
            return Err(Iec104Error::SequenceViolation(format!(
                "I-frame in state {:?}",
                *self.state.borrow()
            )));
        }
        if send_seq != self.vr {
            return Err(Iec104Error::SequenceViolation(format!(
                "expected NS {} got {}",
                self.vr, send_seq
            )));
        }
        self.vr = seq_add(self.vr, 1);
        self.ack_pending += 1;
        self.apply_peer_ack(recv_seq)?;
        self.flush_parked().await?;

        let asdu = Asdu::decode(&apdu.asdu)?;
        if self.event_tx.send(LinkEvent::Asdu(asdu)).await.is_err() {
            // Session layer went away; stop the link.
            return self.begin_stop().await;
        }

        if self.ack_pending >= self.config.w {
            self.send_s_frame().await?;
        } else if self.t2_deadline.is_none() {
            self.t2_deadline = Some(Instant::now() + self.config.t2);
        }
        Ok(())
    }

    /// Fold a peer NR into va; every frame NR must fall inside [va, vs]
    fn apply_peer_ack(&mut self, recv_seq: u16) -> Result<()> {
        let outstanding = seq_distance(self.va, self.vs);
        let acked = seq_distance(self.va, recv_seq);
        if acked > outstanding {
            return Err(Iec104Error::WindowExceeded(format!(
                "peer acknowledged NS {} with only {} frames outstanding (va {}, vs {})",
                recv_seq, outstanding, self.va, self.vs
            )));
        }
        if acked > 0 {
            self.va = recv_seq;
            self.t1_deadline = if seq_distance(self.va, self.vs) == 0 {
                None
            } else {
                Some(Instant::now() + self.config.t1)
            };
        }
        Ok(())
    }

    async fn submit_send(&mut self, asdu: Asdu, done: oneshot::Sender<Result<()>>) -> Result<()> {
        let state = *self.state.borrow();
        match state {
            LinkState::Active => {
                if seq_distance(self.va, self.vs) >= self.config.k {
                    self.park(asdu, done);
                } else {
                    self.write_i_frame(asdu, done).await?;
                }
            }
            LinkState::Unconfirmed | LinkState::Connecting => self.park(asdu, done),
            _ => {
                let _ = done.send(Err(Iec104Error::NotConnected));
            }
        }
        Ok(())
    }

    fn park(&mut self, asdu: Asdu, done: oneshot::Sender<Result<()>>) {
        if self.parked.len() >= SEND_QUEUE_LIMIT {
            let _ = done.send(Err(Iec104Error::WindowExceeded(format!(
                "send queue full ({SEND_QUEUE_LIMIT} frames parked)"
            ))));
            return;
        }
        self.parked.push_back(ParkedSend { asdu, done });
    }

    async fn flush_parked(&mut self) -> Result<()> {
        while *self.state.borrow() == LinkState::Active
            && seq_distance(self.va, self.vs) < self.config.k
        {
            let Some(next) = self.parked.pop_front() else {
                break;
            };
            self.write_i_frame(next.asdu, next.done).await?;
        }
        Ok(())
    }

    async fn write_i_frame(&mut self, asdu: Asdu, done: oneshot::Sender<Result<()>>) -> Result<()> {
        let body = match asdu.encode() {
            Ok(body) => body,
            Err(e) => {
                // Encoding failures are the submitter's problem, not the link's.
                let _ = done.send(Err(e));
                return Ok(());
            }
        };
        let apdu = Apdu::i_frame(self.vs, self.vr, body.into());
        self.write_frame(apdu).await?;

        self.vs = seq_add(self.vs, 1);
        // An I-frame acknowledges everything received so far.
        self.ack_pending = 0;
        self.t2_deadline = None;
        if self.t1_deadline.is_none() {
            self.t1_deadline = Some(Instant::now() + self.config.t1);
        }
        let _ = done.send(Ok(()));
        Ok(())
    }

    async fn send_s_frame(&mut self) -> Result<()> {
        let apdu = Apdu::s_frame(self.vr);
        self.write_frame(apdu).await?;
        self.ack_pending = 0;
        self.t2_deadline = None;
        self.stats.write().await.s_frames_sent += 1;
        Ok(())
    }

    async fn send_u(&mut self, func: UFunction) -> Result<()> {
        self.write_frame(Apdu::u_frame(func)).await
    }

    async fn write_frame(&mut self, apdu: Apdu) -> Result<()> {
        trace!(
            "{} TX {:?} asdu={}",
            self.config.remote(),
            apdu.apci,
            hex::encode(&apdu.asdu)
        );
        let wire_len = (6 + apdu.asdu.len()) as u64;
        self.framed
            .send(apdu)
            .await
            .map_err(|e| Iec104Error::TransportIo(format!("write failed: {e}")))?;
        let mut stats = self.stats.write().await;
        stats.frames_sent += 1;
        stats.bytes_sent += wire_len;
        stats.last_activity = Some(Utc::now());
        if *self.state.borrow() == LinkState::Active {
            drop(stats);
            self.t3_deadline = Some(Instant::now() + self.config.t3);
        }
        Ok(())
    }

    async fn begin_stop(&mut self) -> Result<()> {
        let state = *self.state.borrow();
        match state {
            LinkState::Unconfirmed | LinkState::Active => {
                self.set_state(LinkState::Stopping);
                self.send_u(UFunction::StopDtAct).await?;
                self.t1_deadline = Some(Instant::now() + self.config.t1);
                self.t2_deadline = None;
                self.t3_deadline = None;
            }
            LinkState::Stopping => {}
            _ => self.finish(None).await,
        }
        Ok(())
    }

    async fn finish(&mut self, error: Option<Iec104Error>) {
        let state = if error.is_some() {
            LinkState::Broken
        } else {
            LinkState::Closed
        };
        match &error {
            Some(e) => warn!("{} link down: {e}", self.config.remote()),
            None => info!("{} link closed", self.config.remote()),
        }
        for parked in self.parked.drain(..) {
            let _ = parked.done.send(Err(Iec104Error::NotConnected));
        }
        self.set_state(state);
        let _ = self.event_tx.send(LinkEvent::Closed { error }).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asdu::{Asdu, Element, InformationObject};
    use crate::types::{Cause, Cot, Qds, TypeId, QOI_STATION};

    fn test_config() -> ConnectionConfig {
        ConnectionConfig {
            t0: Duration::from_millis(500),
            t1: Duration::from_millis(400),
            t2: Duration::from_millis(100),
            t3: Duration::from_millis(300),
            ..ConnectionConfig::default()
        }
    }

    async fn expect_apdu(server: &mut Framed<tokio::io::DuplexStream, ApduCodec>) -> Apdu {
        timeout(Duration::from_secs(1), server.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("stream ended")
            .expect("decode failed")
    }

    async fn activate(
        config: ConnectionConfig,
    ) -> (
        Connection,
        mpsc::Receiver<LinkEvent>,
        Framed<tokio::io::DuplexStream, ApduCodec>,
    ) {
        let (local, remote) = tokio::io::duplex(4096);
        let (conn, events) = Connection::spawn(config, local);
        let mut server = Framed::new(remote, ApduCodec);

        let start = expect_apdu(&mut server).await;
        assert_eq!(start.apci, Apci::U(UFunction::StartDtAct));
        server
            .send(Apdu::u_frame(UFunction::StartDtCon))
            .await
            .unwrap();
        conn.wait_for_state(LinkState::Active, Duration::from_secs(1))
            .await
            .unwrap();
        (conn, events, server)
    }

    fn measurement(ns: u16, nr: u16, ioa: u32) -> Apdu {
        let asdu = Asdu::new(
            TypeId::M_ME_NC_1,
            Cot::new(Cause::Spontaneous),
            1,
            vec![InformationObject::new(
                ioa,
                Element::ShortFloat {
                    value: 1.5,
                    qds: Qds::GOOD,
                },
            )],
        );
        Apdu::i_frame(ns, nr, asdu.encode().unwrap().into())
    }

    #[tokio::test]
    async fn test_startdt_handshake() {
        let (conn, _events, _server) = activate(test_config()).await;
        assert!(conn.is_active());
    }

    #[tokio::test]
    async fn test_config_validation() {
        let mut cfg = ConnectionConfig::default();
        cfg.w = 20;
        assert!(cfg.validate().is_err());
        cfg = ConnectionConfig::default();
        cfg.t2 = cfg.t1;
        assert!(cfg.validate().is_err());
        assert!(ConnectionConfig::default().validate().is_ok());
    }

    #[tokio::test]
    async fn test_send_receives_sequenced_i_frame() {
        let (conn, _events, mut server) = activate(test_config()).await;

        conn.send_asdu(Asdu::interrogation(1, QOI_STATION))
            .await
            .unwrap();
        let frame = expect_apdu(&mut server).await;
        assert_eq!(
            frame.apci,
            Apci::I {
                send_seq: 0,
                recv_seq: 0
            }
        );

        conn.send_asdu(Asdu::interrogation(1, QOI_STATION))
            .await
            .unwrap();
        let frame = expect_apdu(&mut server).await;
        assert_eq!(
            frame.apci,
            Apci::I {
                send_seq: 1,
                recv_seq: 0
            }
        );
    }

    #[tokio::test]
    async fn test_window_flush_after_w_frames() {
        let (_conn, mut events, mut server) = activate(test_config()).await;

        for i in 0..8u16 {
            server.send(measurement(i, 0, 100 + i as u32)).await.unwrap();
        }
        // Eight unacknowledged I-frames force an S-frame with NR = 8.
        let frame = expect_apdu(&mut server).await;
        assert_eq!(frame.apci, Apci::S { recv_seq: 8 });

        for _ in 0..8 {
            match events.recv().await.unwrap() {
                LinkEvent::Asdu(asdu) => assert_eq!(asdu.type_id, TypeId::M_ME_NC_1),
                other => panic!("unexpected event {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_sequence_violation_breaks_link() {
        let (conn, mut events, mut server) = activate(test_config()).await;

        // NS 5 when 0 is expected
        server.send(measurement(5, 0, 100)).await.unwrap();

        loop {
            match events.recv().await {
                Some(LinkEvent::Closed { error }) => {
                    assert!(matches!(error, Some(Iec104Error::SequenceViolation(_))));
                    break;
                }
                Some(_) => continue,
                None => panic!("event stream ended without Closed"),
            }
        }
        conn.wait_for_state(LinkState::Broken, Duration::from_secs(1))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_t1_expiry_breaks_link() {
        let (conn, mut events, mut server) = activate(test_config()).await;

        conn.send_asdu(Asdu::interrogation(1, QOI_STATION))
            .await
            .unwrap();
        let _ = expect_apdu(&mut server).await;
        // Never acknowledge; t1 (400 ms) must kill the link.
        loop {
            match events.recv().await {
                Some(LinkEvent::Closed { error }) => {
                    assert!(matches!(error, Some(Iec104Error::HandshakeTimeout(_))));
                    break;
                }
                Some(_) => continue,
                None => panic!("event stream ended without Closed"),
            }
        }
        assert_eq!(conn.state(), LinkState::Broken);
    }

    #[tokio::test]
    async fn test_testfr_act_answered() {
        let (_conn, _events, mut server) = activate(test_config()).await;

        server.send(Apdu::u_frame(UFunction::TestFrAct)).await.unwrap();
        let frame = expect_apdu(&mut server).await;
        assert_eq!(frame.apci, Apci::U(UFunction::TestFrCon));
    }

    #[tokio::test]
    async fn test_idle_t3_sends_testfr() {
        let (_conn, _events, mut server) = activate(test_config()).await;
        // No traffic; within t3 (300 ms) a TESTFR act must appear.
        let frame = expect_apdu(&mut server).await;
        assert_eq!(frame.apci, Apci::U(UFunction::TestFrAct));
        server.send(Apdu::u_frame(UFunction::TestFrCon)).await.unwrap();
    }

    #[tokio::test]
    async fn test_clean_stop() {
        let (conn, mut events, mut server) = activate(test_config()).await;

        let conn2 = conn;
        let closer = tokio::spawn(async move {
            conn2.close().await;
            conn2
        });

        let frame = expect_apdu(&mut server).await;
        assert_eq!(frame.apci, Apci::U(UFunction::StopDtAct));
        server.send(Apdu::u_frame(UFunction::StopDtCon)).await.unwrap();

        let conn = closer.await.unwrap();
        conn.wait_for_state(LinkState::Closed, Duration::from_secs(1))
            .await
            .unwrap();
        match events.recv().await.unwrap() {
            LinkEvent::Closed { error } => assert!(error.is_none()),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_window_full_parks_sends() {
        let mut config = test_config();
        config.k = 2;
        config.w = 1;
        let (conn, _events, mut server) = activate(config).await;

        for _ in 0..2 {
            conn.send_asdu(Asdu::interrogation(1, QOI_STATION))
                .await
                .unwrap();
        }
        let _ = expect_apdu(&mut server).await;
        let _ = expect_apdu(&mut server).await;

        // Window is full (vs - va = 2 = k): the third send parks.
        let conn3 = conn;
        let parked = tokio::spawn(async move {
            conn3
                .send_asdu(Asdu::interrogation(1, QOI_STATION))
                .await
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!parked.is_finished());

        // Acknowledge both outstanding frames; the parked frame flushes.
        server.send(Apdu::s_frame(2)).await.unwrap();
        parked.await.unwrap().unwrap();
        let frame = expect_apdu(&mut server).await;
        assert_eq!(
            frame.apci,
            Apci::I {
                send_seq: 2,
                recv_seq: 0
            }
        );
    }

    #[tokio::test]
    async fn test_interleaved_sequence_tracking() {
        let (conn, _events, mut server) = activate(test_config()).await;

        // Alternate directions and check NS/NR bookkeeping on every frame.
        for i in 0..5u16 {
            server.send(measurement(i, i, 100)).await.unwrap();
            // Our NR in the next send must track vr = i + 1.
            conn.send_asdu(Asdu::interrogation(1, QOI_STATION))
                .await
                .unwrap();
            let frame = expect_apdu(&mut server).await;
            match frame.apci {
                Apci::I { send_seq, recv_seq } => {
                    assert_eq!(send_seq, i);
                    assert_eq!(recv_seq, i + 1);
                }
                other => panic!("unexpected frame {other:?}"),
            }
            server.send(Apdu::s_frame(i + 1)).await.unwrap();
        }
        drop(conn);
        let _ = server.next().await;
    }

    #[tokio::test]
    async fn test_peer_stop_surfaces() {
        let (conn, mut events, mut server) = activate(test_config()).await;

        server.send(Apdu::u_frame(UFunction::StopDtAct)).await.unwrap();
        let frame = expect_apdu(&mut server).await;
        assert_eq!(frame.apci, Apci::U(UFunction::StopDtCon));

        loop {
            match events.recv().await {
                Some(LinkEvent::Closed { error }) => {
                    assert!(matches!(error, Some(Iec104Error::PeerStopped)));
                    break;
                }
                Some(_) => continue,
                None => panic!("event stream ended without Closed"),
            }
        }
        conn.wait_for_state(LinkState::Broken, Duration::from_secs(1))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_interrogation_frame_bytes_on_wire() {
        let (conn, _events, mut server) = activate(test_config()).await;

        conn.send_asdu(Asdu::interrogation(1, QOI_STATION))
            .await
            .unwrap();
        let frame = expect_apdu(&mut server).await;
        let wire = frame.to_bytes().unwrap();
        assert_eq!(
            wire,
            vec![
                0x68, 0x0E, 0x00, 0x00, 0x00, 0x00, 0x64, 0x01, 0x06, 0x00, 0x01, 0x00, 0x00,
                0x00, 0x00, 0x14
            ]
        );
    }
}
