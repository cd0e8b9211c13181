//! Readiness probing: wait for the in-guest agent to answer TCP connects.

use std::time::Duration;

use thiserror::Error;
use tokio::net::TcpStream;
use tokio::time::{self, Instant};

/// Port the in-guest agent listens on.
const AGENT_PORT: u16 = 8080;

/// Overall deadline for a VM to become ready.
const READY_DEADLINE: Duration = Duration::from_secs(30);

/// Interval between connect attempts.
const PROBE_INTERVAL: Duration = Duration::from_secs(1);

/// Per-attempt connect timeout.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
#[error("VM at {guest_ip} did not become ready within {deadline:?}")]
pub struct ReadinessError {
    pub guest_ip: String,
    pub deadline: Duration,
}

/// Poll `<guest_ip>:8080` until a TCP connect succeeds or the 30s
/// deadline elapses. The first successful connect wins and is closed
/// immediately — this only probes reachability, not health semantics.
pub async fn wait_until_ready(guest_ip: &str) -> Result<(), ReadinessError> {
    wait_until_ready_on(guest_ip, AGENT_PORT).await
}

async fn wait_until_ready_on(guest_ip: &str, port: u16) -> Result<(), ReadinessError> {
    let deadline = Instant::now() + READY_DEADLINE;
    let addr = format!("{guest_ip}:{port}");

    loop {
        if Instant::now() >= deadline {
            return Err(ReadinessError {
                guest_ip: guest_ip.to_string(),
                deadline: READY_DEADLINE,
            });
        }

        match time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => {
                drop(stream);
                return Ok(());
            }
            _ => {
                time::sleep(PROBE_INTERVAL).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_ready_once_agent_listens() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((_, _)) = listener.accept().await else {
                    break;
                };
            }
        });

        let result = wait_until_ready_on(&addr.ip().to_string(), addr.port()).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_never_ready_times_out() {
        // Nothing listens on this port; the probe should eventually give
        // up rather than hang forever. Use a short deadline indirectly by
        // bounding the test itself.
        let result = time::timeout(
            Duration::from_millis(500),
            wait_until_ready_on("127.0.0.1", 1),
        )
        .await;
        // The readiness deadline is 30s, far longer than our test budget,
        // so we only assert it hasn't falsely succeeded yet.
        assert!(result.is_err());
    }

    #[test]
    fn test_constants_match_contract() {
        assert_eq!(READY_DEADLINE, Duration::from_secs(30));
        assert_eq!(PROBE_INTERVAL, Duration::from_secs(1));
        assert_eq!(CONNECT_TIMEOUT, Duration::from_secs(2));
        assert_eq!(AGENT_PORT, 8080);
    }
}
