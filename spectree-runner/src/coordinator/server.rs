// Copyright (c) The spectree Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The coordinator's TCP shell.

use crate::{
    coordinator::{
        handler::ServerHandler,
        protocol::{Request, read_frame, write_frame},
    },
    errors::ProtocolError,
    reporter::Reporter,
};
use std::{net::SocketAddr, sync::Arc};
use tokio::{
    io::BufReader,
    net::{TcpListener, TcpStream},
    task::JoinHandle,
};
use tracing::{debug, info};

/// Serves the coordinator protocol for one suite run.
///
/// Binding spawns the accept loop; the server keeps serving until dropped
/// or until [`completed`](Self::completed) resolves and the caller drops
/// it. Bind to port 0 to let the OS pick a free port, then hand
/// [`address`](Self::address) to the workers.
pub struct CoordinatorServer {
    local_addr: SocketAddr,
    handler: Arc<ServerHandler>,
    accept_task: JoinHandle<()>,
}

impl CoordinatorServer {
    /// Binds and starts serving. Must be called within a tokio runtime.
    pub async fn bind(
        addr: &str,
        parallel_total: usize,
        reporter: Arc<dyn Reporter>,
    ) -> Result<Self, ProtocolError> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let handler = Arc::new(ServerHandler::new(parallel_total, reporter));
        let accept_task = tokio::spawn(accept_loop(listener, Arc::clone(&handler)));
        info!(%local_addr, parallel_total, "coordinator listening");
        Ok(Self {
            local_addr,
            handler,
            accept_task,
        })
    }

    /// The bound socket address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The address workers should connect to.
    pub fn address(&self) -> String {
        self.local_addr.to_string()
    }

    /// The underlying state machine, for registering liveness probes.
    pub fn handler(&self) -> &Arc<ServerHandler> {
        &self.handler
    }

    /// Resolves once every worker has posted its end-of-run summary.
    pub async fn completed(&self) {
        self.handler.done().cancelled().await;
    }
}

impl Drop for CoordinatorServer {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

async fn accept_loop(listener: TcpListener, handler: Arc<ServerHandler>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let handler = Arc::clone(&handler);
                tokio::spawn(async move {
                    if let Err(err) = serve_connection(stream, &handler).await {
                        debug!(%peer, %err, "coordinator connection ended with an error");
                    }
                });
            }
            Err(err) => {
                debug!(%err, "coordinator accept failed");
            }
        }
    }
}

async fn serve_connection(
    stream: TcpStream,
    handler: &ServerHandler,
) -> Result<(), ProtocolError> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    while let Some(request) = read_frame::<_, Request>(&mut reader).await? {
        let response = handler.handle(request);
        write_frame(&mut write_half, &response).await?;
    }
    Ok(())
}
