//! Modbus TCP (MBAP) and RTU (serial) transports.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_serial::SerialStream;

use super::pdu::{crc16, rtu_remaining};
use super::ModbusClientError;

pub enum Transport {
    Tcp {
        stream: TcpStream,
        transaction: u16,
    },
    Rtu {
        port: SerialStream,
    },
}

impl Transport {
    pub async fn connect_tcp(addr: &str) -> Result<Self, ModbusClientError> {
        let stream = TcpStream::connect(addr).await?;
        let _ = stream.set_nodelay(true);
        Ok(Transport::Tcp {
            stream,
            transaction: 0,
        })
    }

    pub fn rtu(port: SerialStream) -> Self {
        Transport::Rtu { port }
    }

    /// Send one request PDU and return the response PDU.
    pub async fn request(
        &mut self,
        slave: u8,
        pdu: &[u8],
        timeout: Duration,
    ) -> Result<Vec<u8>, ModbusClientError> {
        let exchange = async {
            match self {
                Transport::Tcp {
                    stream,
                    transaction,
                } => {
                    *transaction = transaction.wrapping_add(1);
                    tcp_exchange(stream, *transaction, slave, pdu).await
                }
                Transport::Rtu { port } => rtu_exchange(port, slave, pdu).await,
            }
        };
        tokio::time::timeout(timeout, exchange)
            .await
            .map_err(|_| ModbusClientError::Timeout)?
    }
}

async fn tcp_exchange<S>(
    stream: &mut S,
    transaction: u16,
    slave: u8,
    pdu: &[u8],
) -> Result<Vec<u8>, ModbusClientError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut frame = Vec::with_capacity(7 + pdu.len());
    frame.extend_from_slice(&transaction.to_be_bytes());
    frame.extend_from_slice(&0u16.to_be_bytes());
    frame.extend_from_slice(&((pdu.len() + 1) as u16).to_be_bytes());
    frame.push(slave);
    frame.extend_from_slice(pdu);
    stream.write_all(&frame).await?;

    let mut mbap = [0u8; 7];
    stream.read_exact(&mut mbap).await?;
    let got_transaction = u16::from_be_bytes([mbap[0], mbap[1]]);
    if got_transaction != transaction {
        return Err(ModbusClientError::Framing(format!(
            "transaction {got_transaction}, expected {transaction}"
        )));
    }
    let len = u16::from_be_bytes([mbap[4], mbap[5]]) as usize;
    if !(2..=254).contains(&len) {
        return Err(ModbusClientError::Framing(format!("MBAP length {len}")));
    }
    let mut response = vec![0u8; len - 1];
    stream.read_exact(&mut response).await?;
    Ok(response)
}

async fn rtu_exchange<S>(port: &mut S, slave: u8, pdu: &[u8]) -> Result<Vec<u8>, ModbusClientError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut frame = Vec::with_capacity(pdu.len() + 3);
    frame.push(slave);
    frame.extend_from_slice(pdu);
    let crc = crc16(&frame);
    frame.extend_from_slice(&crc.to_le_bytes());
    port.write_all(&frame).await?;

    let mut head = [0u8; 3];
    port.read_exact(&mut head).await?;
    if head[0] != slave {
        return Err(ModbusClientError::Framing(format!(
            "reply from slave {}, expected {slave}",
            head[0]
        )));
    }
    let mut rest = vec![0u8; rtu_remaining(head[1], head[2])];
    port.read_exact(&mut rest).await?;

    let mut full = head.to_vec();
    full.extend_from_slice(&rest);
    let body_len = full.len() - 2;
    let expected = crc16(&full[..body_len]);
    let got = u16::from_le_bytes([full[body_len], full[body_len + 1]]);
    if expected != got {
        return Err(ModbusClientError::Framing("CRC mismatch".to_string()));
    }
    Ok(full[1..body_len].to_vec())
}
