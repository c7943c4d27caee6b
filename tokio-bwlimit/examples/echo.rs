use tokio::{
    io::{self, AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    time::Instant,
};
use tokio_bwlimit::{LimitBandwidthExt, Quota};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> io::Result<()> {
    let shutdown = CancellationToken::new();
    let listener = TcpListener::bind("127.0.0.1:0")
        .await?
        .limit_bandwidth(shutdown.clone());
    let addr = listener.local_addr()?;

    // echo server: 1 KiB/s back to each client, 2 KiB/s shared
    listener.set_conn_limits(Quota::new(1024.0, Some(256)), Quota::unlimited());
    listener.set_global_limits(Quota::new(2048.0, Some(256)), Quota::unlimited());

    tokio::spawn(async move {
        while let Ok((mut conn, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 256];
                loop {
                    match conn.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if conn.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });

    let clients = (0..3).map(|i| {
        tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await?;
            let start = Instant::now();
            let payload = vec![b'x'; 2048];
            let (mut reader, mut writer) = stream.split();

            let (_, echoed) = tokio::try_join!(writer.write_all(&payload), async {
                let mut echoed = vec![0u8; payload.len()];
                reader.read_exact(&mut echoed).await.map(|_| echoed)
            })?;
            assert_eq!(echoed, payload);

            println!("client {i}: 2 KiB echoed in {:?}", start.elapsed());
            io::Result::Ok(())
        })
    });

    for client in clients.collect::<Vec<_>>() {
        client.await??;
    }

    shutdown.cancel();
    Ok(())
}
