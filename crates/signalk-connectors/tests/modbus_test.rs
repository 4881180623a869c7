use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::Mutex;

use signalk_bus::Publisher;
use signalk_connectors::modbus::{ModbusClientError, ModbusConnector};
use signalk_connectors::{Connector, ConnectorConfig, RawEmitter, RegisterGroup};
use signalk_protocol::modbus::{extract_header, inject_header, FunctionCode, ModbusHeader};
use signalk_protocol::RawStamper;

#[derive(Default)]
struct SlaveData {
    registers: HashMap<u16, u16>,
    coils: HashMap<u16, bool>,
}

/// Minimal Modbus TCP slave serving one connection at a time.
struct MockSlave {
    address: String,
    data: Arc<Mutex<SlaveData>>,
}

impl MockSlave {
    async fn start() -> Self {
        let mut data = SlaveData::default();
        for i in 0..20 {
            data.registers.insert(i, (i + 1) * 100);
            data.coils.insert(i, i % 2 == 0);
        }
        let data = Arc::new(Mutex::new(data));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();

        let served = data.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let data = served.clone();
                tokio::spawn(async move {
                    let _ = Self::handle_client(stream, data).await;
                });
            }
        });
        Self { address, data }
    }

    async fn handle_client(
        mut stream: TcpStream,
        data: Arc<Mutex<SlaveData>>,
    ) -> std::io::Result<()> {
        loop {
            let mut mbap = [0u8; 7];
            stream.read_exact(&mut mbap).await?;
            let len = u16::from_be_bytes([mbap[4], mbap[5]]) as usize;
            let mut pdu = vec![0u8; len - 1];
            stream.read_exact(&mut pdu).await?;

            let reply = Self::process(&pdu, &mut *data.lock().await);
            let mut frame = mbap[..4].to_vec();
            frame.extend_from_slice(&((reply.len() + 1) as u16).to_be_bytes());
            frame.push(mbap[6]);
            frame.extend_from_slice(&reply);
            stream.write_all(&frame).await?;
        }
    }

    fn process(pdu: &[u8], data: &mut SlaveData) -> Vec<u8> {
        let fc = pdu[0];
        let addr = u16::from_be_bytes([pdu[1], pdu[2]]);
        let word = u16::from_be_bytes([pdu[3], pdu[4]]);
        match fc {
            1 | 2 => {
                let mut packed = vec![0u8; (word as usize + 7) / 8];
                for i in 0..word {
                    if data.coils.get(&(addr + i)).copied().unwrap_or(false) {
                        packed[i as usize / 8] |= 1 << (i % 8);
                    }
                }
                let mut reply = vec![fc, packed.len() as u8];
                reply.extend(packed);
                reply
            }
            3 | 4 => {
                let mut reply = vec![fc, (word * 2) as u8];
                for i in 0..word {
                    let v = data.registers.get(&(addr + i)).copied().unwrap_or(0);
                    reply.extend_from_slice(&v.to_be_bytes());
                }
                reply
            }
            5 => {
                data.coils.insert(addr, word == 0xFF00);
                pdu.to_vec()
            }
            6 => {
                data.registers.insert(addr, word);
                pdu.to_vec()
            }
            15 => {
                for i in 0..word {
                    let on = (pdu[6 + i as usize / 8] >> (i % 8)) & 1 == 1;
                    data.coils.insert(addr + i, on);
                }
                pdu[..5].to_vec()
            }
            16 => {
                for i in 0..word {
                    let at = 6 + 2 * i as usize;
                    data.registers
                        .insert(addr + i, u16::from_be_bytes([pdu[at], pdu[at + 1]]));
                }
                pdu[..5].to_vec()
            }
            _ => vec![fc | 0x80, 1],
        }
    }
}

fn group(function_code: FunctionCode, address: u16, count: u16) -> RegisterGroup {
    RegisterGroup {
        slave: 1,
        function_code,
        address,
        count,
        interval_ms: 50,
    }
}

fn connector_for(slave: &MockSlave, groups: Vec<RegisterGroup>) -> ModbusConnector {
    let mut config = ConnectorConfig::new("plc", "modbus", &format!("modbus://{}", slave.address));
    config.register_groups = groups;
    ModbusConnector::new(&config).unwrap()
}

#[tokio::test]
async fn test_polls_register_groups_into_raw_payloads() {
    let slave = MockSlave::start().await;
    let connector = Arc::new(connector_for(
        &slave,
        vec![
            group(FunctionCode::ReadHoldingRegisters, 0, 2),
            group(FunctionCode::ReadCoils, 0, 10),
        ],
    ));

    let publisher = Publisher::new(64);
    let sub = publisher.subscribe();
    let emitter = RawEmitter::new("plc", "modbus", publisher);
    let poller = {
        let c = connector.clone();
        tokio::spawn(async move { c.publish(emitter).await })
    };

    let mut registers = None;
    let mut coils = None;
    while registers.is_none() || coils.is_none() {
        let raw = tokio::time::timeout(Duration::from_secs(5), sub.recv_raw())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(raw.connector, "plc");
        let (header, _) = extract_header(&raw.payload).unwrap();
        match header.function {
            FunctionCode::ReadHoldingRegisters => registers = Some(raw.payload.to_vec()),
            FunctionCode::ReadCoils => coils = Some(raw.payload.to_vec()),
            other => panic!("unexpected function {other}"),
        }
    }
    poller.abort();

    assert_eq!(
        registers.unwrap(),
        vec![0x01, 0x00, 0x03, 0x00, 0x00, 0x00, 0x02, 0x00, 0x64, 0x00, 0xC8]
    );
    // Coils 0, 2, 4, 6, 8 are on; payload order packs coil 0 into the top bit.
    assert_eq!(
        coils.unwrap(),
        vec![0x01, 0x00, 0x01, 0x00, 0x00, 0x00, 0x0A, 0xAA, 0x80]
    );
}

#[tokio::test]
async fn test_write_back_registers_and_coils() {
    let slave = MockSlave::start().await;
    let connector = connector_for(&slave, Vec::new());

    let commands = Publisher::new(16);
    let sub = commands.subscribe();
    let mut stamper = RawStamper::new("ops", "modbus");
    let writes = [
        (
            ModbusHeader::new(1, FunctionCode::WriteSingleRegister, 5, 1).unwrap(),
            vec![0x12, 0x34],
        ),
        (
            ModbusHeader::new(1, FunctionCode::WriteMultipleRegisters, 10, 2).unwrap(),
            vec![0x00, 0x01, 0x00, 0x02],
        ),
        (
            ModbusHeader::new(1, FunctionCode::WriteMultipleCoils, 0, 3).unwrap(),
            vec![0b0110_0000],
        ),
        // Read function codes are ignored on the write path.
        (
            ModbusHeader::new(1, FunctionCode::ReadHoldingRegisters, 0, 1).unwrap(),
            vec![],
        ),
    ];
    for (header, data) in &writes {
        let raw = stamper.stamp(inject_header(header, data)).unwrap();
        commands.publish(raw.encode().unwrap()).unwrap();
    }
    commands.close();

    connector.subscribe(sub).await.unwrap();

    let data = slave.data.lock().await;
    assert_eq!(data.registers[&5], 0x1234);
    assert_eq!(data.registers[&10], 1);
    assert_eq!(data.registers[&11], 2);
    assert_eq!(
        (data.coils[&0], data.coils[&1], data.coils[&2]),
        (false, true, true)
    );
    assert_eq!(data.registers[&0], 100);
}

fn connector_at(address: &str, timeout_ms: u64, reconnect_ms: u64) -> ModbusConnector {
    let mut config = ConnectorConfig::new("plc", "modbus", &format!("modbus://{address}"));
    config.timeout_ms = timeout_ms;
    config.reconnect_ms = reconnect_ms;
    ModbusConnector::new(&config).unwrap()
}

#[tokio::test]
async fn test_unresponsive_slave_is_bounded_by_request_timeout() {
    // A listener that never accepts, with its backlog filled so further
    // handshakes stall.
    let socket = TcpSocket::new_v4().unwrap();
    socket.bind("127.0.0.1:0".parse().unwrap()).unwrap();
    let listener = socket.listen(0).unwrap();
    let address = listener.local_addr().unwrap().to_string();
    let mut fillers = Vec::new();
    for _ in 0..4 {
        if let Ok(Ok(stream)) =
            tokio::time::timeout(Duration::from_millis(100), TcpStream::connect(&address)).await
        {
            fillers.push(stream);
        }
    }

    let connector = connector_at(&address, 200, 60_000);
    let header = ModbusHeader::new(1, FunctionCode::ReadHoldingRegisters, 0, 2).unwrap();
    let bus = connector.bus();

    let write_header = ModbusHeader::new(1, FunctionCode::WriteSingleRegister, 5, 1).unwrap();

    let started = tokio::time::Instant::now();
    let (poll, write_back) = tokio::join!(
        bus.read(&header),
        bus.write(
            &write_header,
            &[0x00, 0x01]
        ),
    );
    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(matches!(poll, Err(ModbusClientError::Timeout)));
    assert!(write_back.is_err());
    drop(listener);
}

#[tokio::test]
async fn test_failed_connect_backs_off_before_redialing() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();
    drop(listener);

    let connector = connector_at(&address, 200, 60_000);
    let header = ModbusHeader::new(1, FunctionCode::ReadHoldingRegisters, 0, 2).unwrap();

    let first = connector.bus().read(&header).await;
    assert!(matches!(first, Err(ModbusClientError::Io(_))));

    match connector.bus().read(&header).await {
        Err(ModbusClientError::Reconnecting(wait)) => {
            assert!(wait > Duration::from_secs(50) && wait <= Duration::from_secs(60));
        }
        other => panic!("expected back-off, got {other:?}"),
    }
}
