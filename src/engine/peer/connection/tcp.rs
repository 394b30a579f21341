use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time;

const RETRY_DELAY: Duration = Duration::from_secs(1);

/// Dials `host:port`, retrying a few times since roster peers start in no
/// particular order.
pub async fn connect(host: &str, port: u16, retries: u32) -> std::io::Result<TcpStream> {
    let mut attempt = 0;

    loop {
        match TcpStream::connect((host, port)).await {
            Ok(stream) => {
                stream.set_nodelay(true)?;
                return Ok(stream);
            }
            Err(e) if attempt < retries => {
                attempt += 1;
                tracing::debug!("connect to {host}:{port} failed ({e}), retry {attempt}/{retries}");
                time::sleep(RETRY_DELAY).await;
            }
            Err(e) => return Err(e),
        }
    }
}
