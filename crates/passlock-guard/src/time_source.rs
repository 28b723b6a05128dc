//! Trusted time sources
//!
//! Lockout timing must not depend on the device clock, which the user
//! controls. Every timestamp the guard records or compares comes from a
//! [`TrustedTimeProvider`]. The shipped provider asks NTP servers directly
//! over SNTP and never falls back to the local clock.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use thiserror::Error;
use tokio::net::{lookup_host, UdpSocket};
use tokio::time::timeout;
use tracing::debug;

/// NTP epoch is Jan 1, 1900. Unix epoch is Jan 1, 1970
const NTP_UNIX_OFFSET: i64 = 2_208_988_800;

/// SNTP packet size
const NTP_PACKET_SIZE: usize = 48;

/// LI=0, VN=3, Mode=3 (client)
const NTP_CLIENT_REQUEST: u8 = 0x1B;

/// Random transmit timestamp the server must echo as its originate timestamp
pub(crate) type RequestNonce = [u8; 8];

/// Errors from a trusted time source
#[derive(Debug, Error)]
pub enum TimeError {
    #[error("time server unreachable: {0}")]
    Unreachable(String),

    #[error("time server {0} did not answer in time")]
    Timeout(String),

    #[error("invalid response from time server: {0}")]
    InvalidResponse(String),

    #[error("all time servers failed")]
    AllServersFailed,

    #[error("no time servers configured")]
    NoServers,
}

/// Source of network-synchronized time
#[async_trait]
pub trait TrustedTimeProvider: Send + Sync {
    /// Current trusted time
    async fn now(&self) -> Result<DateTime<Utc>, TimeError>;
}

/// SNTP client that tries each configured server in order
#[derive(Debug, Clone)]
pub struct SntpTimeProvider {
    servers: Vec<String>,
    timeout: Duration,
}

impl SntpTimeProvider {
    /// Servers used when none are configured
    pub const DEFAULT_SERVERS: [&'static str; 4] = [
        "time.google.com:123",
        "time.cloudflare.com:123",
        "pool.ntp.org:123",
        "time.nist.gov:123",
    ];

    /// Create a provider for the given `host:port` servers
    pub fn new(servers: Vec<String>, timeout: Duration) -> Self {
        Self { servers, timeout }
    }

    /// Servers queried, in order
    pub fn servers(&self) -> &[String] {
        &self.servers
    }

    /// Query a single server, trying each address it resolves to
    async fn query(&self, server: &str) -> Result<DateTime<Utc>, TimeError> {
        let addrs = lookup_host(server)
            .await
            .map_err(|e| TimeError::Unreachable(format!("{}: {}", server, e)))?;

        let mut last_error = None;
        for addr in addrs {
            match self.query_addr(addr).await {
                Ok(time) => return Ok(time),
                Err(e) => {
                    debug!("NTP query to {} ({}) failed: {}", server, addr, e);
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            TimeError::Unreachable(format!("{}: no addresses resolved", server))
        }))
    }

    /// Query one resolved address over a socket connected to it, so datagrams
    /// from any other peer are dropped
    async fn query_addr(&self, addr: SocketAddr) -> Result<DateTime<Utc>, TimeError> {
        let local: SocketAddr = if addr.is_ipv6() {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(local)
            .await
            .map_err(|e| TimeError::Unreachable(format!("socket bind failed: {}", e)))?;
        socket
            .connect(addr)
            .await
            .map_err(|e| TimeError::Unreachable(format!("{}: {}", addr, e)))?;

        let nonce: RequestNonce = rand::random();
        let request = build_request(&nonce);
        socket
            .send(&request)
            .await
            .map_err(|e| TimeError::Unreachable(format!("{}: {}", addr, e)))?;

        let mut response = [0u8; NTP_PACKET_SIZE];
        let len = timeout(self.timeout, socket.recv(&mut response))
            .await
            .map_err(|_| TimeError::Timeout(addr.to_string()))?
            .map_err(|e| TimeError::Unreachable(format!("{}: {}", addr, e)))?;

        parse_response(&response[..len], &nonce)
    }
}

impl Default for SntpTimeProvider {
    fn default() -> Self {
        Self::new(
            Self::DEFAULT_SERVERS.iter().map(|s| s.to_string()).collect(),
            Duration::from_secs(5),
        )
    }
}

#[async_trait]
impl TrustedTimeProvider for SntpTimeProvider {
    async fn now(&self) -> Result<DateTime<Utc>, TimeError> {
        if self.servers.is_empty() {
            return Err(TimeError::NoServers);
        }

        for server in &self.servers {
            match self.query(server).await {
                Ok(time) => {
                    debug!("Trusted time from {}: {}", server, time);
                    return Ok(time);
                }
                Err(e) => {
                    debug!("Failed to query NTP server {}: {}", server, e);
                }
            }
        }

        Err(TimeError::AllServersFailed)
    }
}

/// Build an SNTP client request carrying `nonce` as its transmit timestamp
pub(crate) fn build_request(nonce: &RequestNonce) -> [u8; NTP_PACKET_SIZE] {
    let mut request = [0u8; NTP_PACKET_SIZE];
    request[0] = NTP_CLIENT_REQUEST;
    request[40..48].copy_from_slice(nonce);
    request
}

/// Extract the transmit timestamp from the server's answer to the request
/// carrying `nonce`
pub(crate) fn parse_response(
    packet: &[u8],
    nonce: &RequestNonce,
) -> Result<DateTime<Utc>, TimeError> {
    if packet.len() < NTP_PACKET_SIZE {
        return Err(TimeError::InvalidResponse(format!(
            "short packet ({} bytes)",
            packet.len()
        )));
    }

    // Originate timestamp (bytes 24-31) echoes the request
    if packet[24..32] != nonce[..] {
        return Err(TimeError::InvalidResponse(
            "originate timestamp does not match request".to_string(),
        ));
    }

    let leap_indicator = packet[0] >> 6;
    let mode = packet[0] & 0x07;
    let stratum = packet[1];

    if leap_indicator == 3 {
        return Err(TimeError::InvalidResponse(
            "server clock not synchronized".to_string(),
        ));
    }
    if mode != 4 && mode != 5 {
        return Err(TimeError::InvalidResponse(format!("unexpected mode {}", mode)));
    }
    if stratum == 0 {
        return Err(TimeError::InvalidResponse("kiss-of-death".to_string()));
    }

    // Transmit timestamp (bytes 40-47)
    let seconds = u32::from_be_bytes([packet[40], packet[41], packet[42], packet[43]]);
    let fraction = u32::from_be_bytes([packet[44], packet[45], packet[46], packet[47]]);

    if seconds == 0 && fraction == 0 {
        return Err(TimeError::InvalidResponse(
            "empty transmit timestamp".to_string(),
        ));
    }

    // Era 1 starts in 2036; timestamps with the high bit clear belong to it
    let ntp_seconds = if seconds & 0x8000_0000 == 0 {
        seconds as i64 + (1i64 << 32)
    } else {
        seconds as i64
    };
    let nanos = ((fraction as u64 * 1_000_000_000) >> 32) as u32;

    Utc.timestamp_opt(ntp_seconds - NTP_UNIX_OFFSET, nanos)
        .single()
        .ok_or_else(|| TimeError::InvalidResponse("timestamp out of range".to_string()))
}

#[cfg(test)]
pub(crate) fn encode_response(
    time: DateTime<Utc>,
    nonce: &RequestNonce,
) -> [u8; NTP_PACKET_SIZE] {
    let mut packet = [0u8; NTP_PACKET_SIZE];
    packet[0] = 0x1C; // LI=0, VN=3, Mode=4 (server)
    packet[1] = 2;
    packet[24..32].copy_from_slice(nonce);
    let seconds = (time.timestamp() + NTP_UNIX_OFFSET) as u32;
    let fraction = ((time.timestamp_subsec_nanos() as u64) << 32) / 1_000_000_000;
    packet[40..44].copy_from_slice(&seconds.to_be_bytes());
    packet[44..48].copy_from_slice(&(fraction as u32).to_be_bytes());
    packet
}
