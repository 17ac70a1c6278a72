//! Per-outstation session: command correlation and spontaneous data intake
//!
//! An [`Iec104Client`] owns one [`Connection`] plus the two pieces of session
//! state the link layer knows nothing about: the pending-command table that
//! correlates activation confirmations with their submitters, and the bounded
//! spontaneous queue the reader drains. A demultiplexer task routes every
//! received ASDU by its cause of transmission:
//!
//! - data causes (periodic, background, spontaneous, requested, interrogated,
//!   counter-interrogated) append to the spontaneous queue
//! - activation/deactivation confirmations and terminations resolve the
//!   matching pending command by `(COA, IOA, TypeID)`
//! - the unknown-* mirror causes fail the originating request
//!
//! At most one command per `(COA, IOA, TypeID)` is in flight. Select-before-
//! execute is sequenced entirely inside [`Iec104Client::send_command`]:
//! select (S/E = 1), await a positive confirmation, execute (S/E = 0).

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

use crate::address::Iec104Address;
use crate::asdu::{Asdu, Element, InformationObject};
use crate::connection::{Connection, ConnectionConfig, LinkEvent, LinkState};
use crate::error::{Iec104Error, Result};
use crate::types::{Cause, Cot, Dpi, StepDirection, TypeId};

/// Session configuration for one outstation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Link parameters (host, port, k/w, t0..t3)
    pub connection: ConnectionConfig,
    /// Common address of the outstation
    pub common_addr: u16,
    /// How long to wait for an activation confirmation
    pub command_timeout: Duration,
    /// How long to wait for an activation termination (advisory; some RTUs
    /// never send one)
    pub termination_timeout: Duration,
    /// Spontaneous queue capacity; overflow discards the oldest entries
    pub queue_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            common_addr: 1,
            command_timeout: Duration::from_secs(5),
            termination_timeout: Duration::from_secs(10),
            queue_capacity: 1024,
        }
    }
}

impl ClientConfig {
    /// Registry key: `{ip}-{port}-{coa}`
    pub fn client_id(&self) -> String {
        format!(
            "{}-{}-{}",
            self.connection.host, self.connection.port, self.common_addr
        )
    }
}

/// A decoded information object with its full address and delivery context
#[derive(Debug, Clone, Copy)]
pub struct PointUpdate {
    pub address: Iec104Address,
    pub element: Element,
    /// Outstation time tag; `None` when untagged or flagged invalid
    pub time: Option<DateTime<Utc>>,
    pub cause: Cause,
    pub received_at: DateTime<Utc>,
}

/// Value carried by a control command
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CommandValue {
    Single(bool),
    Double(Dpi),
    Step(StepDirection),
    NormalizedSetpoint(i16),
    ScaledSetpoint(i16),
    FloatSetpoint(f32),
    Bitstring(u32),
}

impl CommandValue {
    /// Control-direction type identifier for this value
    pub fn type_id(&self) -> TypeId {
        match self {
            CommandValue::Single(_) => TypeId::C_SC_NA_1,
            CommandValue::Double(_) => TypeId::C_DC_NA_1,
            CommandValue::Step(_) => TypeId::C_RC_NA_1,
            CommandValue::NormalizedSetpoint(_) => TypeId::C_SE_NA_1,
            CommandValue::ScaledSetpoint(_) => TypeId::C_SE_NB_1,
            CommandValue::FloatSetpoint(_) => TypeId::C_SE_NC_1,
            CommandValue::Bitstring(_) => TypeId::C_BO_NA_1,
        }
    }

    /// Bitstring commands have no S/E bit
    pub fn supports_select(&self) -> bool {
        !matches!(self, CommandValue::Bitstring(_))
    }

    fn element(&self, select: bool) -> Element {
        match *self {
            CommandValue::Single(value) => Element::SingleCommand {
                value,
                qualifier: 0,
                select,
            },
            CommandValue::Double(value) => Element::DoubleCommand {
                value,
                qualifier: 0,
                select,
            },
            CommandValue::Step(direction) => Element::RegulatingStep {
                direction,
                qualifier: 0,
                select,
            },
            CommandValue::NormalizedSetpoint(value) => Element::SetpointNormalized {
                value,
                qualifier: 0,
                select,
            },
            CommandValue::ScaledSetpoint(value) => Element::SetpointScaled {
                value,
                qualifier: 0,
                select,
            },
            CommandValue::FloatSetpoint(value) => Element::SetpointFloat {
                value,
                qualifier: 0,
                select,
            },
            CommandValue::Bitstring(value) => Element::BitstringCommand { value },
        }
    }
}

/// Session counters
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientStatistics {
    pub commands_sent: u64,
    pub commands_confirmed: u64,
    pub commands_failed: u64,
    pub interrogations_sent: u64,
    pub objects_received: u64,
    pub spontaneous_dropped: u64,
    pub last_activity: Option<DateTime<Utc>>,
}

type CommandKey = (u16, u32, u8);

struct PendingCommand {
    sent_at: Instant,
    con_tx: Option<oneshot::Sender<Result<()>>>,
    term_tx: Option<oneshot::Sender<()>>,
}

struct SpontaneousQueue {
    buf: VecDeque<PointUpdate>,
    capacity: usize,
    dropped: u64,
}

impl SpontaneousQueue {
    fn push(&mut self, update: PointUpdate) {
        if self.buf.len() >= self.capacity {
            self.buf.pop_front();
            self.dropped += 1;
        }
        self.buf.push_back(update);
    }
}

/// One master session against one outstation
pub struct Iec104Client {
    config: ClientConfig,
    conn: Arc<RwLock<Option<Arc<Connection>>>>,
    pending: Arc<Mutex<HashMap<CommandKey, PendingCommand>>>,
    queue: Arc<Mutex<SpontaneousQueue>>,
    stats: Arc<RwLock<ClientStatistics>>,
    last_error: Arc<RwLock<Option<Iec104Error>>>,
    /// Earliest instant the next reconnect attempt is permitted
    retry_gate: Arc<RwLock<Option<(Instant, Duration)>>>,
}

impl Iec104Client {
    pub fn new(config: ClientConfig) -> Self {
        let queue_capacity = config.queue_capacity.max(1);
        Self {
            config,
            conn: Arc::new(RwLock::new(None)),
            pending: Arc::new(Mutex::new(HashMap::new())),
            queue: Arc::new(Mutex::new(SpontaneousQueue {
                buf: VecDeque::new(),
                capacity: queue_capacity,
                dropped: 0,
            })),
            stats: Arc::new(RwLock::new(ClientStatistics::default())),
            last_error: Arc::new(RwLock::new(None)),
            retry_gate: Arc::new(RwLock::new(None)),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Registry key: `{ip}-{port}-{coa}`
    pub fn client_id(&self) -> String {
        self.config.client_id()
    }

    /// Open the link and start the session demultiplexer. Idempotent.
    pub async fn connect(&self) -> Result<()> {
        if self.is_connected().await {
            return Ok(());
        }
        let (conn, events) = Connection::open(self.config.connection.clone()).await?;
        self.attach(conn, events).await;
        *self.retry_gate.write().await = None;
        *self.last_error.write().await = None;
        Ok(())
    }

    /// Adopt an already-running link
    ///
    /// The production path is [`Iec104Client::connect`]; this exists for
    /// in-memory transports in tests and for externally managed sockets.
    pub async fn attach(&self, conn: Connection, events: mpsc::Receiver<LinkEvent>) {
        let conn = Arc::new(conn);
        *self.conn.write().await = Some(conn.clone());

        let demux = Demux {
            common_addr: self.config.common_addr,
            remote: self.config.connection.remote(),
            conn: conn.clone(),
            conn_slot: self.conn.clone(),
            pending: self.pending.clone(),
            queue: self.queue.clone(),
            stats: self.stats.clone(),
            last_error: self.last_error.clone(),
        };
        tokio::spawn(demux.run(events));
    }

    /// STOPDT the link and fail everything in flight. Idempotent.
    pub async fn disconnect(&self) {
        let conn = self.conn.write().await.take();
        if let Some(conn) = conn {
            conn.close().await;
        }
        fail_pending(&self.pending, &Iec104Error::NotConnected).await;
    }

    /// True iff the link state is `Active`
    pub async fn is_connected(&self) -> bool {
        match self.conn.read().await.as_ref() {
            Some(conn) => conn.is_active(),
            None => false,
        }
    }

    /// Reconnect a broken link, rate-limited by exponential backoff capped at
    /// t0. Returns quickly with `NotConnected` while the gate is closed.
    pub async fn ensure_connected(&self) -> Result<()> {
        if self.is_connected().await {
            return Ok(());
        }
        {
            let gate = self.retry_gate.read().await;
            if let Some((not_before, _)) = *gate {
                if Instant::now() < not_before {
                    return Err(Iec104Error::NotConnected);
                }
            }
        }
        match self.connect().await {
            Ok(()) => Ok(()),
            Err(e) => {
                let mut gate = self.retry_gate.write().await;
                let next_delay = match *gate {
                    Some((_, delay)) => (delay * 2).min(self.config.connection.t0),
                    None => Duration::from_secs(1),
                };
                *gate = Some((Instant::now() + next_delay, next_delay));
                *self.last_error.write().await = Some(e.clone());
                debug!(
                    "{} reconnect failed, next attempt in {next_delay:?}: {e}",
                    self.client_id()
                );
                Err(e)
            }
        }
    }

    /// Most recent link or command error, if any
    pub async fn last_error(&self) -> Option<Iec104Error> {
        self.last_error.read().await.clone()
    }

    pub async fn statistics(&self) -> ClientStatistics {
        self.stats.read().await.clone()
    }

    /// Drain everything currently in the spontaneous queue (non-blocking)
    pub async fn process_spontaneous(&self) -> Vec<PointUpdate> {
        let mut queue = self.queue.lock().await;
        queue.buf.drain(..).collect()
    }

    /// Objects discarded from the spontaneous queue since startup
    pub async fn spontaneous_dropped(&self) -> u64 {
        self.queue.lock().await.dropped
    }

    /// Issue a station or group interrogation (QOI 20 for general, 21..=36
    /// for groups 1..=16), waiting for the activation confirmation
    pub async fn send_interrogation(&self, qoi: u8) -> Result<()> {
        let key = (self.config.common_addr, 0, TypeId::C_IC_NA_1 as u8);
        let (con_rx, _term_rx) = self.register(key).await?;
        self.stats.write().await.interrogations_sent += 1;

        let result = self
            .send_and_confirm(Asdu::interrogation(self.config.common_addr, qoi), key, con_rx)
            .await;
        // The entry stays until ActTerm so a second interrogation cannot
        // overlap; the demultiplexer clears it.
        result
    }

    /// Issue a counter interrogation (C_CI_NA_1)
    pub async fn send_counter_interrogation(&self, qcc: u8) -> Result<()> {
        let key = (self.config.common_addr, 0, TypeId::C_CI_NA_1 as u8);
        let (con_rx, _term_rx) = self.register(key).await?;
        self.send_and_confirm(
            Asdu::counter_interrogation(self.config.common_addr, qcc),
            key,
            con_rx,
        )
        .await
    }

    /// Synchronize the outstation clock (C_CS_NA_1)
    pub async fn send_clock_sync(&self, time: DateTime<Utc>) -> Result<()> {
        let key = (self.config.common_addr, 0, TypeId::C_CS_NA_1 as u8);
        let (con_rx, _term_rx) = self.register(key).await?;
        let result = self
            .send_and_confirm(Asdu::clock_sync(self.config.common_addr, time), key, con_rx)
            .await;
        self.pending.lock().await.remove(&key);
        result
    }

    /// Link test through the application layer (C_TS_NA_1)
    pub async fn send_test_command(&self) -> Result<()> {
        let key = (self.config.common_addr, 0, TypeId::C_TS_NA_1 as u8);
        let (con_rx, _term_rx) = self.register(key).await?;
        let result = self
            .send_and_confirm(Asdu::test_command(self.config.common_addr), key, con_rx)
            .await;
        self.pending.lock().await.remove(&key);
        result
    }

    /// Request one information object (C_RD_NA_1); the value comes back
    /// through the spontaneous queue with cause `Request`
    pub async fn send_read_command(&self, object_addr: u32) -> Result<()> {
        let conn = self.active_connection().await?;
        conn.send_asdu(Asdu::read_command(self.config.common_addr, object_addr))
            .await
    }

    /// Execute a control command against one point
    ///
    /// With `select_before_execute` the command is sent twice: first with
    /// S/E = 1 and, after a positive confirmation, with S/E = 0. At most one
    /// command per `(COA, IOA, TypeID)` may be in flight.
    pub async fn send_command(
        &self,
        object_addr: u32,
        value: CommandValue,
        select_before_execute: bool,
    ) -> Result<()> {
        let type_id = value.type_id();
        if select_before_execute && !value.supports_select() {
            return Err(Iec104Error::NotSupported(format!(
                "{type_id:?} has no select/execute qualifier"
            )));
        }
        let key = (self.config.common_addr, object_addr, type_id as u8);
        let (con_rx, term_rx) = self.register(key).await?;
        self.stats.write().await.commands_sent += 1;

        let result = self
            .run_command(key, object_addr, value, select_before_execute, con_rx, term_rx)
            .await;

        self.pending.lock().await.remove(&key);
        let mut stats = self.stats.write().await;
        match &result {
            Ok(()) => stats.commands_confirmed += 1,
            Err(_) => stats.commands_failed += 1,
        }
        result
    }

    async fn run_command(
        &self,
        key: CommandKey,
        object_addr: u32,
        value: CommandValue,
        select_before_execute: bool,
        mut con_rx: oneshot::Receiver<Result<()>>,
        term_rx: oneshot::Receiver<()>,
    ) -> Result<()> {
        if select_before_execute {
            self.send_phase(object_addr, value, true).await?;
            self.await_confirmation(con_rx).await?;
            con_rx = self.re_arm(key).await?;
        }

        self.send_phase(object_addr, value, false).await?;
        self.await_confirmation(con_rx).await?;

        // Termination is advisory; a quiet outstation does not fail an
        // already-confirmed command.
        if timeout(self.config.termination_timeout, term_rx).await.is_err() {
            debug!(
                "{} no activation termination for {}.{}.{}",
                self.client_id(),
                key.0,
                key.1,
                key.2
            );
        }
        Ok(())
    }

    async fn send_phase(&self, object_addr: u32, value: CommandValue, select: bool) -> Result<()> {
        let conn = self.active_connection().await?;
        let asdu = Asdu::new(
            value.type_id(),
            Cot::new(Cause::Activation),
            self.config.common_addr,
            vec![InformationObject::new(object_addr, value.element(select))],
        );
        conn.send_asdu(asdu).await
    }

    async fn send_and_confirm(
        &self,
        asdu: Asdu,
        key: CommandKey,
        con_rx: oneshot::Receiver<Result<()>>,
    ) -> Result<()> {
        let conn = match self.active_connection().await {
            Ok(conn) => conn,
            Err(e) => {
                self.pending.lock().await.remove(&key);
                return Err(e);
            }
        };
        if let Err(e) = conn.send_asdu(asdu).await {
            self.pending.lock().await.remove(&key);
            return Err(e);
        }
        match self.await_confirmation(con_rx).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.pending.lock().await.remove(&key);
                Err(e)
            }
        }
    }

    async fn await_confirmation(&self, con_rx: oneshot::Receiver<Result<()>>) -> Result<()> {
        match timeout(self.config.command_timeout, con_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Iec104Error::NotConnected),
            Err(_) => Err(Iec104Error::TimedOut(format!(
                "no confirmation within {:?}",
                self.config.command_timeout
            ))),
        }
    }

    async fn active_connection(&self) -> Result<Arc<Connection>> {
        let guard = self.conn.read().await;
        match guard.as_ref() {
            Some(conn) if conn.state() == LinkState::Active => Ok(conn.clone()),
            _ => Err(Iec104Error::NotConnected),
        }
    }

    async fn register(
        &self,
        key: CommandKey,
    ) -> Result<(oneshot::Receiver<Result<()>>, oneshot::Receiver<()>)> {
        let stale_after = self.config.command_timeout + self.config.termination_timeout;
        let mut pending = self.pending.lock().await;
        if let Some(existing) = pending.get(&key) {
            if existing.sent_at.elapsed() < stale_after {
                return Err(Iec104Error::Duplicate(format!(
                    "{}.{}.{}",
                    key.0, key.1, key.2
                )));
            }
            warn!(
                "{} replacing stale pending command {}.{}.{}",
                self.client_id(),
                key.0,
                key.1,
                key.2
            );
        }
        let (con_tx, con_rx) = oneshot::channel();
        let (term_tx, term_rx) = oneshot::channel();
        pending.insert(
            key,
            PendingCommand {
                sent_at: Instant::now(),
                con_tx: Some(con_tx),
                term_tx: Some(term_tx),
            },
        );
        Ok((con_rx, term_rx))
    }

    /// Re-arm the confirmation channel between the select and execute phases
    async fn re_arm(&self, key: CommandKey) -> Result<oneshot::Receiver<Result<()>>> {
        let mut pending = self.pending.lock().await;
        let entry = pending
            .get_mut(&key)
            .ok_or_else(|| Iec104Error::ChannelClosed("pending entry vanished".to_string()))?;
        let (con_tx, con_rx) = oneshot::channel();
        entry.con_tx = Some(con_tx);
        entry.sent_at = Instant::now();
        Ok(con_rx)
    }
}

async fn fail_pending(
    pending: &Arc<Mutex<HashMap<CommandKey, PendingCommand>>>,
    error: &Iec104Error,
) {
    let mut pending = pending.lock().await;
    for (_, mut entry) in pending.drain() {
        if let Some(tx) = entry.con_tx.take() {
            let _ = tx.send(Err(error.clone()));
        }
    }
}

/// Routes link events into the session state; one task per attached link
struct Demux {
    common_addr: u16,
    remote: String,
    /// The link this task belongs to, so a stale task cannot clobber a
    /// reconnected one
    conn: Arc<Connection>,
    conn_slot: Arc<RwLock<Option<Arc<Connection>>>>,
    pending: Arc<Mutex<HashMap<CommandKey, PendingCommand>>>,
    queue: Arc<Mutex<SpontaneousQueue>>,
    stats: Arc<RwLock<ClientStatistics>>,
    last_error: Arc<RwLock<Option<Iec104Error>>>,
}

impl Demux {
    async fn run(self, mut events: mpsc::Receiver<LinkEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                LinkEvent::Asdu(asdu) => self.route_asdu(asdu).await,
                LinkEvent::Closed { error } => {
                    let owned = {
                        let mut slot = self.conn_slot.write().await;
                        match slot.as_ref() {
                            Some(current) if Arc::ptr_eq(current, &self.conn) => {
                                slot.take();
                                true
                            }
                            Some(_) => false,
                            None => true,
                        }
                    };
                    if owned {
                        if let Some(e) = error {
                            *self.last_error.write().await = Some(e.clone());
                            fail_pending(&self.pending, &e).await;
                        } else {
                            fail_pending(&self.pending, &Iec104Error::NotConnected).await;
                        }
                    }
                    break;
                }
            }
        }
        debug!("{} session demultiplexer stopped", self.remote);
    }

    async fn route_asdu(&self, asdu: Asdu) {
        let cause = asdu.cot.cause;

        if cause.is_data() {
            self.deliver_data(asdu).await;
            return;
        }

        if cause.is_confirmation() {
            self.resolve_confirmation(&asdu).await;
            return;
        }

        if cause.is_unknown_report() {
            self.fail_unknown(&asdu).await;
            return;
        }

        match cause {
            Cause::Initialized => {
                info!("{} outstation (re)initialized", self.remote);
            }
            other => {
                warn!(
                    "{} unhandled cause {other:?} for type {:?}",
                    self.remote, asdu.type_id
                );
            }
        }
    }

    async fn deliver_data(&self, asdu: Asdu) {
        if asdu.common_addr != self.common_addr {
            warn!(
                "{} data for foreign common address {} dropped",
                self.remote, asdu.common_addr
            );
            return;
        }
        let received_at = Utc::now();
        let count = asdu.objects.len() as u64;
        let mut queue = self.queue.lock().await;
        let dropped_before = queue.dropped;
        for object in &asdu.objects {
            let address =
                match Iec104Address::new(asdu.common_addr, object.object_addr, asdu.type_id) {
                    Ok(address) => address,
                    Err(e) => {
                        warn!("{} unaddressable object skipped: {e}", self.remote);
                        continue;
                    }
                };
            queue.push(PointUpdate {
                address,
                element: object.element,
                time: object.time,
                cause: asdu.cot.cause,
                received_at,
            });
        }
        let newly_dropped = queue.dropped - dropped_before;
        drop(queue);

        let mut stats = self.stats.write().await;
        stats.objects_received += count;
        stats.spontaneous_dropped += newly_dropped;
        stats.last_activity = Some(received_at);
    }

    async fn resolve_confirmation(&self, asdu: &Asdu) {
        let Some(object) = asdu.objects.first() else {
            return;
        };
        let key = (asdu.common_addr, object.object_addr, asdu.type_id as u8);
        let mut pending = self.pending.lock().await;
        let Some(entry) = pending.get_mut(&key) else {
            warn!(
                "{} unsolicited {:?} for {}.{}.{}",
                self.remote, asdu.cot.cause, key.0, key.1, key.2
            );
            return;
        };

        match asdu.cot.cause {
            Cause::ActivationCon | Cause::DeactivationCon => {
                if let Some(tx) = entry.con_tx.take() {
                    let result = if asdu.cot.negative {
                        Err(Iec104Error::Rejected(format!(
                            "{}.{}.{}",
                            key.0, key.1, key.2
                        )))
                    } else {
                        Ok(())
                    };
                    let _ = tx.send(result);
                }
                if asdu.cot.negative {
                    pending.remove(&key);
                }
            }
            Cause::ActivationTerm => {
                if let Some(entry) = pending.remove(&key) {
                    if let Some(tx) = entry.term_tx {
                        let _ = tx.send(());
                    }
                }
            }
            _ => {}
        }
    }

    async fn fail_unknown(&self, asdu: &Asdu) {
        let Some(object) = asdu.objects.first() else {
            return;
        };
        let key = (asdu.common_addr, object.object_addr, asdu.type_id as u8);
        let error = match asdu.cot.cause {
            Cause::UnknownTypeId => Iec104Error::NotSupported(format!(
                "outstation does not implement type {:?}",
                asdu.type_id
            )),
            cause => Iec104Error::Rejected(format!(
                "{}.{}.{} refused with {cause:?}",
                key.0, key.1, key.2
            )),
        };
        let mut pending = self.pending.lock().await;
        if let Some(mut entry) = pending.remove(&key) {
            if let Some(tx) = entry.con_tx.take() {
                let _ = tx.send(Err(error));
                return;
            }
        }
        warn!("{} {error}", self.remote);
    }
}
