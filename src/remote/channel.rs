//! Length-delimited JSON framing over any byte stream.
//!
//! Messages are processed strictly in arrival order by a single reader loop
//! per connection; writes go through an unbounded channel drained by a
//! single writer task, so callbacks can send from synchronous contexts.

use futures::SinkExt;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_util::bytes::Bytes;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::remote::message::RemoteNodeMessage;

pub struct MessageReader<R> {
    inner: FramedRead<R, LengthDelimitedCodec>,
}

impl<R: AsyncRead + Unpin> MessageReader<R> {
    /// Next message, `None` when the peer closed the connection.
    pub async fn next(&mut self) -> Option<Result<RemoteNodeMessage>> {
        match self.inner.next().await {
            None => None,
            Some(Err(error)) => Some(Err(error.into())),
            Some(Ok(frame)) => Some(serde_json::from_slice(&frame).map_err(Into::into)),
        }
    }
}

pub struct MessageWriter<W> {
    inner: FramedWrite<W, LengthDelimitedCodec>,
}

impl<W: AsyncWrite + Unpin> MessageWriter<W> {
    pub async fn send(&mut self, message: &RemoteNodeMessage) -> Result<()> {
        let frame = serde_json::to_vec(message)?;
        self.inner.send(Bytes::from(frame)).await?;
        Ok(())
    }
}

/// Splits a stream into a framed writer/reader pair.
pub fn split<S>(stream: S) -> (MessageWriter<WriteHalf<S>>, MessageReader<ReadHalf<S>>)
where
    S: AsyncRead + AsyncWrite,
{
    let (read, write) = tokio::io::split(stream);
    (
        MessageWriter {
            inner: FramedWrite::new(write, LengthDelimitedCodec::new()),
        },
        MessageReader {
            inner: FramedRead::new(read, LengthDelimitedCodec::new()),
        },
    )
}

/// Spawns the writer task for a connection. Senders are cheap to clone and
/// usable from non-async callbacks. The task ends — dropping its stream half
/// so the peer observes the close — when the token fires, every sender is
/// dropped, or the peer becomes unwritable.
pub fn spawn_writer<W>(
    mut writer: MessageWriter<W>,
    shutdown: CancellationToken,
) -> mpsc::UnboundedSender<RemoteNodeMessage>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, mut rx) = mpsc::unbounded_channel::<RemoteNodeMessage>();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                message = rx.recv() => match message {
                    None => break,
                    Some(message) => {
                        if let Err(error) = writer.send(&message).await {
                            tracing::warn!(error = %error, "Failed to write message, closing connection");
                            break;
                        }
                    }
                }
            }
        }
    });
    tx
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn framed_messages_round_trip_in_order() {
        let (client, server) = tokio::io::duplex(4096);
        let (mut writer, _) = split(client);
        let (_, mut reader) = split(server);

        for init_id in 0..3 {
            writer
                .send(&RemoteNodeMessage::Init {
                    function_init_id: init_id,
                })
                .await
                .unwrap();
        }
        drop(writer);

        for expected in 0..3 {
            match reader.next().await.unwrap().unwrap() {
                RemoteNodeMessage::Init { function_init_id } => {
                    assert_eq!(function_init_id, expected)
                }
                other => panic!("unexpected message {other:?}"),
            }
        }
        assert!(reader.next().await.is_none());
    }
}
