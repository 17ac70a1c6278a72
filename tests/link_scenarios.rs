//! End-to-end protocol scenarios against a scripted mock outstation
//!
//! Each test wires an [`Iec104Client`] to an in-memory duplex link and plays
//! the outstation side by hand, asserting on the exact frames the master
//! emits: the STARTDT handshake, interrogation activation sequences,
//! select-before-execute command exchanges, window acknowledgement and
//! failure paths.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::io::DuplexStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::codec::Framed;

use voltage_iec104::{
    Apci, Apdu, ApduCodec, Asdu, ClientConfig, CommandValue, Connection, ConnectionConfig, Cot,
    Element, Iec104Client, Iec104Error, InformationObject, LinkEvent, Qds, TypeId, UFunction,
};
use voltage_iec104::types::{Cause, QOI_STATION};

/// Opt-in wire tracing for debugging failing scenarios:
/// `RUST_LOG=voltage_iec104=trace cargo test -- --nocapture`
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// The outstation half of a duplex link with its own sequence bookkeeping
struct Outstation {
    framed: Framed<DuplexStream, ApduCodec>,
    /// Next send sequence number
    vs: u16,
    /// Next expected receive sequence number
    vr: u16,
}

impl Outstation {
    async fn next_apdu(&mut self) -> Apdu {
        timeout(Duration::from_secs(2), self.framed.next())
            .await
            .expect("timed out waiting for a frame from the master")
            .expect("link closed unexpectedly")
            .expect("frame failed to decode")
    }

    /// Read the next frame, asserting it is an I-frame, and track sequencing
    async fn expect_asdu(&mut self) -> Asdu {
        let apdu = self.next_apdu().await;
        match apdu.apci {
            Apci::I { send_seq, .. } => {
                assert_eq!(send_seq, self.vr, "master NS out of sequence");
                self.vr = (self.vr + 1) % 32768;
                Asdu::decode(&apdu.asdu).expect("master sent an undecodable ASDU")
            }
            other => panic!("expected an I-frame, got {other:?}"),
        }
    }

    async fn send_asdu(&mut self, asdu: Asdu) {
        let body = asdu.encode().expect("test ASDU failed to encode");
        self.framed
            .send(Apdu::i_frame(self.vs, self.vr, body.into()))
            .await
            .expect("outstation write failed");
        self.vs = (self.vs + 1) % 32768;
    }

    async fn send_u(&mut self, func: UFunction) {
        self.framed
            .send(Apdu::u_frame(func))
            .await
            .expect("outstation write failed");
    }

    /// Mirror a received command back with a new cause (and P/N bit)
    async fn confirm(&mut self, request: &Asdu, cause: Cause, negative: bool) {
        let mut reply = request.clone();
        reply.cot = if negative {
            Cot::negative(cause)
        } else {
            Cot::new(cause)
        };
        self.send_asdu(reply).await;
    }

    /// Assert that nothing arrives for the given window
    async fn expect_silence(&mut self, window: Duration) {
        if let Ok(frame) = timeout(window, self.framed.next()).await {
            panic!("expected silence, got {frame:?}");
        }
    }
}

fn scenario_config() -> ClientConfig {
    ClientConfig {
        connection: ConnectionConfig {
            // Generous link timers so only scripted traffic appears.
            t1: Duration::from_secs(10),
            t2: Duration::from_secs(8),
            t3: Duration::from_secs(30),
            ..ConnectionConfig::default()
        },
        common_addr: 1,
        command_timeout: Duration::from_millis(500),
        termination_timeout: Duration::from_millis(300),
        queue_capacity: 64,
    }
}

/// Bring up a client over a duplex link, playing the outstation handshake
async fn connect(config: ClientConfig) -> (Arc<Iec104Client>, Outstation) {
    let (local, remote) = tokio::io::duplex(8192);
    let (conn, events) = Connection::spawn(config.connection.clone(), local);
    let mut outstation = Outstation {
        framed: Framed::new(remote, ApduCodec),
        vs: 0,
        vr: 0,
    };

    let start = outstation.next_apdu().await;
    assert_eq!(
        start.to_bytes().unwrap(),
        vec![0x68, 0x04, 0x07, 0x00, 0x00, 0x00],
        "STARTDT act bytes"
    );
    outstation.send_u(UFunction::StartDtCon).await;

    conn.wait_for_state(voltage_iec104::LinkState::Active, Duration::from_secs(2))
        .await
        .expect("link did not activate");

    let client = Arc::new(Iec104Client::new(config));
    client.attach(conn, events).await;
    (client, outstation)
}

fn float_burst(common_addr: u16, cause: Cause, base_ioa: u32, values: &[f32]) -> Asdu {
    let objects = values
        .iter()
        .enumerate()
        .map(|(i, &value)| {
            InformationObject::new(
                base_ioa + i as u32,
                Element::ShortFloat {
                    value,
                    qds: Qds::GOOD,
                },
            )
        })
        .collect();
    Asdu::new(TypeId::M_ME_NC_1, Cot::new(cause), common_addr, objects)
}

#[tokio::test]
async fn happy_path_general_interrogation() {
    init_tracing();
    let (client, mut outstation) = connect(scenario_config()).await;
    assert!(client.is_connected().await);

    let issuer = {
        let client = client.clone();
        tokio::spawn(async move { client.send_interrogation(QOI_STATION).await })
    };

    // The activation request must match the known-good frame byte for byte.
    let apdu = outstation.next_apdu().await;
    assert_eq!(
        apdu.to_bytes().unwrap(),
        vec![
            0x68, 0x0E, 0x00, 0x00, 0x00, 0x00, 0x64, 0x01, 0x06, 0x00, 0x01, 0x00, 0x00, 0x00,
            0x00, 0x14
        ],
        "C_IC_NA_1 activation bytes"
    );
    outstation.vr = 1;
    let request = Asdu::decode(&apdu.asdu).unwrap();
    assert_eq!(request.cot.cause, Cause::Activation);

    outstation.confirm(&request, Cause::ActivationCon, false).await;
    outstation
        .send_asdu(float_burst(
            1,
            Cause::InterrogatedByStation,
            4001,
            &[230.2, 230.4, 49.98],
        ))
        .await;
    outstation.confirm(&request, Cause::ActivationTerm, false).await;

    tokio_test::assert_ok!(issuer.await.unwrap(), "interrogation should confirm");

    // Give the demultiplexer a beat to drain the burst.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let updates = client.process_spontaneous().await;
    assert_eq!(updates.len(), 3);
    assert_eq!(updates[0].address.object_addr(), 4001);
    assert_eq!(updates[2].address.object_addr(), 4003);
    assert!(updates
        .iter()
        .all(|u| u.cause == Cause::InterrogatedByStation));
    match updates[2].element {
        Element::ShortFloat { value, .. } => assert!((value - 49.98).abs() < 1e-3),
        other => panic!("unexpected element {other:?}"),
    }

    // A second drain is empty: the queue is consumed, not copied.
    assert!(client.process_spontaneous().await.is_empty());
}

#[tokio::test]
async fn window_flush_after_eight_frames() {
    let (client, mut outstation) = connect(scenario_config()).await;

    for i in 0..8 {
        outstation
            .send_asdu(float_burst(1, Cause::Spontaneous, 100 + i, &[1.0]))
            .await;
    }

    // w = 8 unacknowledged frames force a supervisory ack carrying NR = 8.
    let apdu = outstation.next_apdu().await;
    assert_eq!(apdu.apci, Apci::S { recv_seq: 8 });

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(client.process_spontaneous().await.len(), 8);
}

#[tokio::test]
async fn select_before_execute_success() {
    let (client, mut outstation) = connect(scenario_config()).await;

    let commander = {
        let client = client.clone();
        tokio::spawn(async move { client.send_command(6001, CommandValue::Single(true), true).await })
    };

    // Phase 1: select with S/E = 1.
    let select = outstation.expect_asdu().await;
    assert_eq!(select.type_id, TypeId::C_SC_NA_1);
    assert_eq!(select.objects[0].object_addr, 6001);
    assert!(select.objects[0].element.is_select());
    outstation.confirm(&select, Cause::ActivationCon, false).await;

    // Phase 2: execute with S/E = 0 and the same state.
    let execute = outstation.expect_asdu().await;
    assert!(!execute.objects[0].element.is_select());
    match execute.objects[0].element {
        Element::SingleCommand { value, .. } => assert!(value),
        ref other => panic!("unexpected element {other:?}"),
    }
    outstation.confirm(&execute, Cause::ActivationCon, false).await;
    outstation.confirm(&execute, Cause::ActivationTerm, false).await;

    commander.await.unwrap().expect("command should succeed");
    let stats = client.statistics().await;
    assert_eq!(stats.commands_sent, 1);
    assert_eq!(stats.commands_confirmed, 1);
    assert_eq!(stats.commands_failed, 0);
}

#[tokio::test]
async fn rejected_select_sends_no_execute() {
    let (client, mut outstation) = connect(scenario_config()).await;

    let commander = {
        let client = client.clone();
        tokio::spawn(async move { client.send_command(6001, CommandValue::Single(true), true).await })
    };

    let select = outstation.expect_asdu().await;
    assert!(select.objects[0].element.is_select());
    outstation.confirm(&select, Cause::ActivationCon, true).await;

    let result = commander.await.unwrap();
    assert!(matches!(result, Err(Iec104Error::Rejected(_))));

    // The master must not send the execute phase after a negative con.
    outstation.expect_silence(Duration::from_millis(200)).await;
    assert_eq!(client.statistics().await.commands_failed, 1);
}

#[tokio::test]
async fn command_timeout_without_confirmation() {
    let (client, mut outstation) = connect(scenario_config()).await;

    let result = client
        .send_command(6002, CommandValue::FloatSetpoint(50.0), false)
        .await;
    assert!(matches!(result, Err(Iec104Error::TimedOut(_))));

    // The frame itself went out.
    let sent = outstation.expect_asdu().await;
    assert_eq!(sent.type_id, TypeId::C_SE_NC_1);

    // The slot frees up for a retry once the failure is reported.
    let retry = {
        let client = client.clone();
        tokio::spawn(async move {
            client
                .send_command(6002, CommandValue::FloatSetpoint(50.0), false)
                .await
        })
    };
    let repeat = outstation.expect_asdu().await;
    outstation.confirm(&repeat, Cause::ActivationCon, false).await;
    outstation.confirm(&repeat, Cause::ActivationTerm, false).await;
    retry.await.unwrap().expect("retry should succeed");
}

#[tokio::test]
async fn duplicate_in_flight_command_refused() {
    let (client, mut outstation) = connect(scenario_config()).await;

    let first = {
        let client = client.clone();
        tokio::spawn(async move {
            client
                .send_command(7001, CommandValue::Double(voltage_iec104::Dpi::On), false)
                .await
        })
    };
    // Wait until the first command is on the wire.
    let request = outstation.expect_asdu().await;

    let second = client
        .send_command(7001, CommandValue::Double(voltage_iec104::Dpi::On), false)
        .await;
    assert!(matches!(second, Err(Iec104Error::Duplicate(_))));

    outstation.confirm(&request, Cause::ActivationCon, false).await;
    outstation.confirm(&request, Cause::ActivationTerm, false).await;
    first.await.unwrap().unwrap();
}

#[tokio::test]
async fn unacknowledged_send_breaks_the_link() {
    let mut config = scenario_config();
    config.connection.t1 = Duration::from_millis(300);
    config.connection.t2 = Duration::from_millis(100);
    config.command_timeout = Duration::from_secs(2);
    let (client, mut outstation) = connect(config).await;

    // The outstation swallows the command and never acknowledges; t1 must
    // tear the link down and the pending command must fail.
    let result = client
        .send_command(6001, CommandValue::Single(true), false)
        .await;
    assert!(result.is_err());
    assert!(!client.is_connected().await);
    match client.last_error().await {
        Some(Iec104Error::HandshakeTimeout(_)) => {}
        other => panic!("expected a handshake timeout, got {other:?}"),
    }
    drop(outstation);
}

#[tokio::test]
async fn clock_sync_round_trip() {
    use chrono::TimeZone;
    let (client, mut outstation) = connect(scenario_config()).await;

    let ts = chrono::Utc
        .with_ymd_and_hms(2024, 6, 15, 12, 34, 56)
        .unwrap()
        + chrono::Duration::milliseconds(789);

    let syncer = {
        let client = client.clone();
        tokio::spawn(async move { client.send_clock_sync(ts).await })
    };

    let request = outstation.expect_asdu().await;
    assert_eq!(request.type_id, TypeId::C_CS_NA_1);
    match request.objects[0].element {
        Element::ClockSync { time } => assert_eq!(time, ts),
        ref other => panic!("unexpected element {other:?}"),
    }
    outstation.confirm(&request, Cause::ActivationCon, false).await;

    syncer.await.unwrap().expect("clock sync should confirm");
}

#[tokio::test]
async fn spontaneous_data_between_exchanges() {
    let (client, mut outstation) = connect(scenario_config()).await;

    // Time-tagged spontaneous traffic with no request outstanding.
    use chrono::TimeZone;
    let tag = chrono::Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
    let asdu = Asdu::new(
        TypeId::M_SP_TB_1,
        Cot::new(Cause::Spontaneous),
        1,
        vec![InformationObject::with_time(
            900,
            Element::SinglePoint {
                value: true,
                qds: Qds::GOOD,
            },
            tag,
        )],
    );
    outstation.send_asdu(asdu).await;

    tokio::time::sleep(Duration::from_millis(50)).await;
    let updates = client.process_spontaneous().await;
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].address.object_addr(), 900);
    assert_eq!(updates[0].time, Some(tag));
    assert_eq!(updates[0].cause, Cause::Spontaneous);
}

#[tokio::test]
async fn read_command_data_returns_with_cause_request() {
    let (client, mut outstation) = connect(scenario_config()).await;

    client.send_read_command(4100).await.unwrap();

    let request = outstation.expect_asdu().await;
    assert_eq!(request.type_id, TypeId::C_RD_NA_1);
    assert_eq!(request.objects[0].object_addr, 4100);

    outstation
        .send_asdu(float_burst(1, Cause::Request, 4100, &[11.5]))
        .await;

    tokio::time::sleep(Duration::from_millis(50)).await;
    let updates = client.process_spontaneous().await;
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].cause, Cause::Request);
}

#[tokio::test]
async fn disconnect_fails_pending_and_is_clean() {
    let (client, mut outstation) = connect(scenario_config()).await;

    let commander = {
        let client = client.clone();
        tokio::spawn(async move { client.send_command(6001, CommandValue::Single(true), false).await })
    };
    let _request = outstation.expect_asdu().await;

    let closer = tokio::spawn(async move {
        client.disconnect().await;
        client
    });

    // STOPDT act arrives; confirm it so the close is clean.
    loop {
        let apdu = outstation.next_apdu().await;
        if apdu.apci == Apci::U(UFunction::StopDtAct) {
            outstation.send_u(UFunction::StopDtCon).await;
            break;
        }
    }

    let client = closer.await.unwrap();
    assert!(!client.is_connected().await);
    assert!(commander.await.unwrap().is_err());
}

#[tokio::test]
async fn raw_link_events_preserve_arrival_order() {
    // Exercise the Connection surface directly, without a client on top.
    let config = ConnectionConfig {
        t1: Duration::from_secs(10),
        t2: Duration::from_secs(8),
        t3: Duration::from_secs(30),
        ..ConnectionConfig::default()
    };
    let (local, remote) = tokio::io::duplex(8192);
    let (conn, mut events): (Connection, mpsc::Receiver<LinkEvent>) =
        Connection::spawn(config, local);
    let mut outstation = Outstation {
        framed: Framed::new(remote, ApduCodec),
        vs: 0,
        vr: 0,
    };
    let _ = outstation.next_apdu().await;
    outstation.send_u(UFunction::StartDtCon).await;
    conn.wait_for_state(voltage_iec104::LinkState::Active, Duration::from_secs(2))
        .await
        .unwrap();

    for i in 0..5u32 {
        outstation
            .send_asdu(float_burst(1, Cause::Periodic, 100 + i, &[i as f32]))
            .await;
    }

    for i in 0..5u32 {
        match timeout(Duration::from_secs(1), events.recv()).await {
            Ok(Some(LinkEvent::Asdu(asdu))) => {
                assert_eq!(asdu.objects[0].object_addr, 100 + i);
            }
            other => panic!("expected an ASDU event, got {other:?}"),
        }
    }
}
