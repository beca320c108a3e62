//! Dispatcher-side listener: accepts node-host connections and registers one
//! invoker per connection.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::dispatcher::JobDispatcher;
use crate::error::{CalcGridError, Result};
use crate::identifier::IdentifierMap;
use crate::remote::channel;
use crate::remote::invoker::RemoteNodeJobInvoker;
use crate::remote::message::RemoteNodeMessage;

pub struct RemoteNodeServer {
    dispatcher: JobDispatcher,
    identifiers: Arc<dyn IdentifierMap>,
    function_init_id: u64,
}

impl RemoteNodeServer {
    pub fn new(
        dispatcher: JobDispatcher,
        identifiers: Arc<dyn IdentifierMap>,
        function_init_id: u64,
    ) -> Self {
        Self {
            dispatcher,
            identifiers,
            function_init_id,
        }
    }

    /// Listens for node hosts until shutdown is signalled.
    pub async fn run(self, addr: SocketAddr, shutdown: CancellationToken) -> Result<()> {
        let listener = TcpListener::bind(addr).await?;
        tracing::info!(addr = %listener.local_addr()?, "Remote node server listening");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Remote node server shutting down");
                    return Ok(());
                }
                accepted = listener.accept() => {
                    let (stream, peer) = accepted?;
                    tracing::info!(%peer, "Node host connected");
                    let dispatcher = self.dispatcher.clone();
                    let identifiers = self.identifiers.clone();
                    let function_init_id = self.function_init_id;
                    tokio::spawn(async move {
                        if let Err(error) =
                            serve_connection(dispatcher, identifiers, function_init_id, stream).await
                        {
                            tracing::warn!(%peer, error = %error, "Node host connection ended with error");
                        }
                    });
                }
            }
        }
    }
}

/// Performs the `Init`/`Ready` handshake, registers the invoker, then pumps
/// inbound messages into it until the connection drops.
pub async fn serve_connection<S>(
    dispatcher: JobDispatcher,
    identifiers: Arc<dyn IdentifierMap>,
    function_init_id: u64,
    stream: S,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (writer, mut reader) = channel::split(stream);
    let writer_shutdown = CancellationToken::new();
    let _writer_guard = writer_shutdown.clone().drop_guard();
    let outbound = channel::spawn_writer(writer, writer_shutdown);
    outbound
        .send(RemoteNodeMessage::Init { function_init_id })
        .map_err(|_| CalcGridError::ConnectionLost)?;

    let (capacity, host_id) = match reader.next().await {
        Some(Ok(RemoteNodeMessage::Ready { capacity, host_id })) => (capacity, host_id),
        Some(Ok(other)) => {
            return Err(CalcGridError::Protocol(format!(
                "expected Ready, got {other:?}"
            )))
        }
        Some(Err(error)) => return Err(error),
        None => return Err(CalcGridError::ConnectionLost),
    };
    tracing::info!(host_id = %host_id, capacity, "Node host ready");

    let invoker = RemoteNodeJobInvoker::new(outbound, host_id, capacity, identifiers);
    dispatcher.register_job_invoker(invoker.clone()).await;

    while let Some(message) = reader.next().await {
        match message {
            Ok(message) => invoker.handle_message(message),
            Err(error) => {
                tracing::warn!(error = %error, "Connection error from node host");
                break;
            }
        }
    }
    invoker.connection_lost();
    Ok(())
}
