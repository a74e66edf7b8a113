use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

/// Bidirectionally copies bytes between `a` and `b` until either direction
/// terminates, then tears down both. Deliberately not
/// `tokio::io::copy_bidirectional`: that helper lets the still-open
/// direction drain to completion after the other half-closes, whereas this
/// relay reports the first direction to finish and discards the other's
/// outcome, matching the "first task wins" teardown this core requires.
pub(crate) async fn relay<A, B>(a: A, b: B) -> std::io::Result<()>
where
    A: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    B: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut ar, mut aw) = tokio::io::split(a);
    let (mut br, mut bw) = tokio::io::split(b);

    let a_to_b = tokio::spawn(async move {
        let result = tokio::io::copy(&mut ar, &mut bw).await;
        let _ = bw.shutdown().await;
        result
    });
    let b_to_a = tokio::spawn(async move {
        let result = tokio::io::copy(&mut br, &mut aw).await;
        let _ = aw.shutdown().await;
        result
    });

    let outcome = tokio::select! {
        res = a_to_b => { b_to_a.abort(); res }
        res = b_to_a => { a_to_b.abort(); res }
    };

    match outcome {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(e)) => Err(e),
        Err(join_err) => Err(std::io::Error::other(join_err)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncReadExt};

    #[tokio::test]
    async fn relay_forwards_both_directions_until_eof() {
        let (client, mut client_remote) = duplex(64);
        let (outbound, mut outbound_remote) = duplex(64);

        let relay_task = tokio::spawn(relay(client, outbound));

        client_remote.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        outbound_remote.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        outbound_remote.write_all(b"pong").await.unwrap();
        let mut buf = [0u8; 4];
        client_remote.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        drop(outbound_remote);
        drop(client_remote);
        let _ = relay_task.await.unwrap();
    }
}
