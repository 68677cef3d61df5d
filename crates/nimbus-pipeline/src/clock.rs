//! Pipeline clocks and the UDP network time protocol.
//!
//! The clock master publishes a [`NetTimeProvider`]; every other job
//! in the flow attaches a [`NetClientClock`] pointed at it and runs
//! its pipeline on the shared time base. The protocol is one 8-byte
//! datagram each way: any ping is answered with the provider's current
//! time in nanoseconds, big-endian.

use std::net::SocketAddr;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{PipelineError, PipelineResult};

/// Wall-clock nanoseconds.
pub fn system_now_ns() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

/// UDP time server answering pings with the local clock.
pub struct NetTimeProvider {
    addr: SocketAddr,
    task: JoinHandle<()>,
}

impl NetTimeProvider {
    /// Bind on `port` (0 picks a free one) and start answering.
    pub async fn publish(port: u16) -> PipelineResult<Self> {
        let socket = UdpSocket::bind(("0.0.0.0", port)).await?;
        let addr = socket.local_addr()?;
        debug!(%addr, "net time provider up");
        let task = tokio::spawn(async move {
            let mut buf = [0u8; 16];
            loop {
                match socket.recv_from(&mut buf).await {
                    Ok((_, peer)) => {
                        let reply = system_now_ns().to_be_bytes();
                        if let Err(e) = socket.send_to(&reply, peer).await {
                            warn!(error = %e, "net time reply failed");
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "net time provider recv failed");
                        return;
                    }
                }
            }
        });
        Ok(Self { addr, task })
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }
}

impl Drop for NetTimeProvider {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Client clock slaved to a [`NetTimeProvider`].
///
/// One round trip estimates the offset between the local clock and
/// the provider's, assuming symmetric network delay.
pub struct NetClientClock {
    offset_ns: i64,
    base_time_ns: i64,
}

impl NetClientClock {
    pub async fn attach(host: &str, port: u16, base_time_ns: i64) -> PipelineResult<Self> {
        let socket = UdpSocket::bind(("0.0.0.0", 0)).await?;
        socket.connect((host, port)).await?;

        let t0 = system_now_ns();
        socket.send(&t0.to_be_bytes()).await?;
        let mut buf = [0u8; 8];
        let n = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            socket.recv(&mut buf),
        )
        .await
        .map_err(|_| PipelineError::Clock("time provider did not answer".to_string()))??;
        if n != 8 {
            return Err(PipelineError::Clock(format!("short time reply: {n} bytes")));
        }
        let t1 = system_now_ns();
        let server = i64::from_be_bytes(buf);

        let offset_ns = server - (t0 + t1) / 2;
        debug!(offset_ns, "net client clock attached");
        Ok(Self {
            offset_ns,
            base_time_ns,
        })
    }

    /// Current time on the shared clock.
    pub fn now_ns(&self) -> i64 {
        system_now_ns() + self.offset_ns
    }

    /// Time elapsed on the shared base.
    pub fn running_time_ns(&self) -> i64 {
        self.now_ns() - self.base_time_ns
    }

    pub fn base_time_ns(&self) -> i64 {
        self.base_time_ns
    }
}

/// Which clock a pipeline runs on.
pub enum ClockSource {
    System { base_time_ns: i64 },
    Net(NetClientClock),
}

impl ClockSource {
    pub fn system() -> Self {
        ClockSource::System {
            base_time_ns: system_now_ns(),
        }
    }

    pub fn base_time_ns(&self) -> i64 {
        match self {
            ClockSource::System { base_time_ns } => *base_time_ns,
            ClockSource::Net(clock) => clock.base_time_ns(),
        }
    }

    pub fn now_ns(&self) -> i64 {
        match self {
            ClockSource::System { .. } => system_now_ns(),
            ClockSource::Net(clock) => clock.now_ns(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn client_slaves_to_provider() {
        let provider = NetTimeProvider::publish(0).await.unwrap();
        let base = system_now_ns();
        let clock = NetClientClock::attach("127.0.0.1", provider.port(), base)
            .await
            .unwrap();

        // Same host, same clock: the offset must be tiny.
        assert!(clock.offset_ns.abs() < 1_000_000_000);
        assert!(clock.running_time_ns() >= 0);
    }

    #[tokio::test]
    async fn attach_to_dead_port_times_out() {
        tokio::time::pause();
        let pending = NetClientClock::attach("127.0.0.1", 1, 0);
        tokio::pin!(pending);
        // Paused time auto-advances when the runtime is idle.
        assert!(pending.await.is_err());
    }
}
