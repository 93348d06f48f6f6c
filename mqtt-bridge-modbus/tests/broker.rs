//! The rumqttc event loop against a minimal MQTT 3.1.1 broker on loopback.

use std::sync::Arc;
use std::time::Duration;

use maison_common::{MqttConfig, parse_config};
use mqtt_bridge_modbus::bus::{BusError, ConnectionState, MqttBus};
use mqtt_bridge_modbus::config::ModbusBridgeConfig;
use mqtt_bridge_modbus::fieldbus::FieldBusClient;
use mqtt_bridge_modbus::mock::MockLink;
use mqtt_bridge_modbus::supervisor::{StopReason, Supervisor};
use mqtt_bridge_modbus::translator::CommandTranslator;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_test::assert_ok;

const COMMAND: &str = "maison/commande";
const RESPONSE: &str = "maison/reponse";
const WAIT: Duration = Duration::from_secs(5);

const CONNECT: u8 = 1;
const PUBLISH: u8 = 3;
const SUBSCRIBE: u8 = 8;
const PINGREQ: u8 = 12;
const DISCONNECT: u8 = 14;

/// Read one control packet, returning its first header byte and body.
async fn read_packet(stream: &mut TcpStream) -> (u8, Vec<u8>) {
    let header = stream.read_u8().await.unwrap();

    let mut len = 0usize;
    let mut shift = 0;
    loop {
        let byte = stream.read_u8().await.unwrap();
        len |= ((byte & 0x7f) as usize) << shift;
        if byte & 0x80 == 0 {
            break;
        }
        shift += 7;
    }

    let mut body = vec![0; len];
    stream.read_exact(&mut body).await.unwrap();
    (header, body)
}

/// Next packet of type `kind`, skipping keep-alive pings.
async fn expect_packet(stream: &mut TcpStream, kind: u8) -> (u8, Vec<u8>) {
    loop {
        let (header, body) = timeout(WAIT, read_packet(stream)).await.unwrap();
        match header >> 4 {
            PINGREQ => stream.write_all(&[0xd0, 0x00]).await.unwrap(),
            found => {
                assert_eq!(found, kind, "unexpected packet type");
                return (header, body);
            }
        }
    }
}

fn read_string(bytes: &[u8]) -> (String, &[u8]) {
    let len = u16::from_be_bytes([bytes[0], bytes[1]]) as usize;
    let text = String::from_utf8(bytes[2..2 + len].to_vec()).unwrap();
    (text, &bytes[2 + len..])
}

/// Accept a client, acknowledge its CONNECT and its SUBSCRIBE.
///
/// Returns the stream and the subscribed topic filter.
async fn accept_session(listener: &TcpListener) -> (TcpStream, String) {
    let (mut stream, _) = timeout(WAIT, listener.accept()).await.unwrap().unwrap();

    expect_packet(&mut stream, CONNECT).await;
    stream.write_all(&[0x20, 0x02, 0x00, 0x00]).await.unwrap();

    let (_, body) = expect_packet(&mut stream, SUBSCRIBE).await;
    let (pkid, filters) = body.split_at(2);
    let (topic, _qos) = read_string(filters);
    stream
        .write_all(&[0x90, 0x03, pkid[0], pkid[1], 0x00])
        .await
        .unwrap();

    (stream, topic)
}

async fn send_publish(stream: &mut TcpStream, topic: &str, payload: &[u8]) {
    let mut body = Vec::new();
    body.extend_from_slice(&(topic.len() as u16).to_be_bytes());
    body.extend_from_slice(topic.as_bytes());
    body.extend_from_slice(payload);

    let mut packet = vec![0x30, body.len() as u8];
    packet.extend_from_slice(&body);
    stream.write_all(&packet).await.unwrap();
}

async fn expect_publish(stream: &mut TcpStream) -> (String, String) {
    let (_, body) = expect_packet(stream, PUBLISH).await;
    let (topic, payload) = read_string(&body);
    (topic, String::from_utf8(payload.to_vec()).unwrap())
}

fn mqtt_config(port: u16) -> MqttConfig {
    let mut config = MqttConfig::new("127.0.0.1");
    config.port = port;
    config
}

#[tokio::test]
async fn test_commands_survive_broker_reconnect() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let link = MockLink::new();
    let field_bus = Arc::new(FieldBusClient::new(Duration::from_secs(3)));
    field_bus.attach(link.clone()).await;

    let (bus, mut bus_loop) = MqttBus::new(&mqtt_config(port));
    let translator = CommandTranslator::new(field_bus, bus, 0, RESPONSE);
    bus_loop.route(COMMAND, Arc::new(translator));
    let handle = bus_loop.spawn();

    let (mut stream, topic) = accept_session(&listener).await;
    assert_eq!(topic, COMMAND);

    send_publish(&mut stream, COMMAND, b"1").await;
    assert_eq!(
        expect_publish(&mut stream).await,
        (RESPONSE.to_string(), "Commande 1 envoyée".to_string())
    );

    // Broker goes away; the client reconnects and subscribes again.
    drop(stream);
    let (mut stream, topic) = accept_session(&listener).await;
    assert_eq!(topic, COMMAND);

    send_publish(&mut stream, COMMAND, b"abc").await;
    assert_eq!(
        expect_publish(&mut stream).await,
        (RESPONSE.to_string(), "Commande invalide".to_string())
    );
    assert_eq!(handle.state(), ConnectionState::Connected);

    assert_ok!(handle.stop().await);
    let (header, _) = expect_packet(&mut stream, DISCONNECT).await;
    assert_eq!(header, 0xe0);

    assert_eq!(link.writes(), vec![(0, 1)]);
}

#[tokio::test]
async fn test_reconnect_limit_stops_bus_loop() {
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };

    let mut config = mqtt_config(port);
    config.reconnect.max_attempts = Some(0);
    let (_bus, bus_loop) = MqttBus::new(&config);
    let handle = bus_loop.spawn();

    timeout(WAIT, async {
        while !handle.is_finished() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    assert!(matches!(
        handle.stop().await,
        Err(BusError::ReconnectLimit(1))
    ));
}

#[tokio::test]
async fn test_unreachable_broker_ends_in_bus_lost() {
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };

    let mut config: ModbusBridgeConfig = parse_config(
        r#"{
            mqtt: { host: "127.0.0.1" },
            modbus: { connection: { type: "rtu", port: "/dev/serial0" } }
        }"#,
    )
    .unwrap();
    config.mqtt.port = port;
    config.mqtt.reconnect.max_attempts = Some(0);

    let (bus, bus_loop) = MqttBus::new(&config.mqtt);
    let mut supervisor: Supervisor<MockLink, _> = Supervisor::new(&config, bus);
    supervisor.attach_bus(bus_loop.spawn());

    let reason = timeout(WAIT, supervisor.run_until(std::future::pending()))
        .await
        .unwrap();
    assert_eq!(reason, StopReason::BusLost);

    supervisor.shutdown().await;
}
