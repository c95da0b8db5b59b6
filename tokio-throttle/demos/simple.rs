use std::sync::Arc;

use tokio::{
    io::{self, AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
};
use tokio_throttle::{
    listener::ThrottledListener,
    utils::meter::{Meter, MeteredStream},
};

const PAYLOAD: usize = 256 * 1024;

#[tokio::main(flavor = "current_thread")]
async fn main() -> io::Result<()> {
    let mut listener = ThrottledListener::new(TcpListener::bind("127.0.0.1:0").await?);
    listener.set_capacity(128 * 1024);
    listener.set_conn_capacity(64 * 1024);
    let addr = listener.get_ref().local_addr()?;

    let client = tokio::spawn(async move {
        let mut stream = TcpStream::connect(addr).await?;
        stream.write_all(&vec![0u8; PAYLOAD]).await?;
        stream.shutdown().await
    });

    let (stream, peer) = listener.accept().await?;
    let meter = Arc::new(Meter::new());
    let mut stream = MeteredStream::new(stream, meter.clone());

    let mut buf = vec![0u8; 16 * 1024];
    while stream.read(&mut buf).await? > 0 {}

    client.await.map_err(io::Error::other)??;
    println!(
        "{peer}: {} bytes in {:?} ({:.0} B/s, {:+.1}% vs 64 KiB/s)",
        meter.total(),
        meter.elapsed(),
        meter.rate_bps().unwrap_or_default(),
        meter.accuracy(64.0 * 1024.0).unwrap_or_default() * 100.0,
    );
    Ok(())
}
