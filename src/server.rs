//! Inbound RPC server.
//!
//! Each accepted connection gets its own task that decodes requests and
//! hands them to the main loop over a rendezvous channel, then waits for
//! the response before reading the next request. Idle connections
//! recheck the shutdown signal at the idle timeout. Shutdown waits for
//! every connection task before returning.

use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinSet;
use tracing::{debug, trace, warn};

use crate::message::{read_request, write_response, Request, Response};
use crate::transport::{Conn, Listener};

/// A decoded inbound request paired with its response slot.
pub(crate) struct InboundRpc {
    pub(crate) req: Request,
    pub(crate) resp_tx: oneshot::Sender<Response>,
}

/// Accept loop. Runs until the shutdown signal flips.
pub(crate) async fn serve(
    mut listener: Box<dyn Listener>,
    rpc_tx: mpsc::Sender<InboundRpc>,
    mut shutdown_rx: watch::Receiver<bool>,
    idle_timeout: Duration,
) {
    let addr = listener.local_addr();
    debug!(%addr, "rpc server listening");

    let mut conns = JoinSet::new();
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok(conn) => {
                    conns.spawn(handle_conn(
                        conn,
                        rpc_tx.clone(),
                        shutdown_rx.clone(),
                        idle_timeout,
                    ));
                }
                Err(e) => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                    warn!(%addr, error = %e, "accept failed");
                }
            },
        }
    }

    drop(listener);
    // barrier: every connection task observes shutdown within the idle
    // timeout
    while conns.join_next().await.is_some() {}
    debug!(%addr, "rpc server stopped");
}

async fn handle_conn(
    mut conn: Conn,
    rpc_tx: mpsc::Sender<InboundRpc>,
    mut shutdown_rx: watch::Receiver<bool>,
    idle_timeout: Duration,
) {
    loop {
        let req = tokio::select! {
            _ = shutdown_rx.changed() => return,
            read = tokio::time::timeout(idle_timeout, read_request(&mut conn)) => match read {
                Err(_) => {
                    if *shutdown_rx.borrow() {
                        return;
                    }
                    continue;
                }
                Ok(Ok(req)) => req,
                Ok(Err(e)) => {
                    trace!(error = %e, "connection closed");
                    return;
                }
            },
        };

        let (resp_tx, resp_rx) = oneshot::channel();
        if rpc_tx.send(InboundRpc { req, resp_tx }).await.is_err() {
            return;
        }
        let resp = tokio::select! {
            _ = shutdown_rx.changed() => return,
            resp = resp_rx => match resp {
                Ok(resp) => resp,
                Err(_) => return,
            },
        };
        if let Err(e) = write_response(&mut conn, &resp).await {
            trace!(error = %e, "write response failed");
            return;
        }
    }
}
