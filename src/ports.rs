use log::warn;
use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;
use tokio::time::{sleep, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Wait until [addr] can be bound again, meaning whatever held it has
/// fully exited. The operating system does not always release a bound UDP
/// port the instant its process dies, so this is polled rather than slept
/// through. Returns false when the port was still held at the deadline.
pub async fn await_release(addr: SocketAddr, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        match UdpSocket::bind(addr) {
            Ok(probe) => {
                drop(probe);
                return true;
            }
            Err(_) if Instant::now() >= deadline => {
                warn!("udp port {} still in use after {:?}", addr, timeout);
                return false;
            }
            Err(_) => sleep(POLL_INTERVAL).await,
        }
    }
}
