//! Background listener threads.
//!
//! Each remote listener owns one named OS thread driving a single-threaded
//! tokio runtime. The socket is bound on that thread; the receive/accept
//! loop races a shutdown channel so `stop()` can interrupt it from any
//! thread.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::mpsc;
use std::thread::{self, JoinHandle};
use tokio::sync::{oneshot, watch};

use rollback_common::TransportError;

/// Observable listener lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Listening,
    /// Stopped on request, or after an unrecoverable socket error
    Stopped,
}

/// Handle to a running listener. Dropping it stops the listener.
pub struct ListenerHandle {
    name: &'static str,
    local_addr: SocketAddr,
    state: watch::Receiver<ListenerState>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl ListenerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn state(&self) -> ListenerState {
        *self.state.borrow()
    }

    /// Watch for the transition to `Stopped`
    pub fn subscribe(&self) -> watch::Receiver<ListenerState> {
        self.state.clone()
    }

    /// Stop the listener and join its thread
    pub fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }

        let Some(thread) = self.thread.take() else {
            return;
        };
        // the last registry reference may be released on the listener thread itself
        if thread.thread().id() == thread::current().id() {
            return;
        }
        if thread.join().is_err() {
            tracing::error!(listener = self.name, "Listener thread panicked");
        }
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Spawn a listener thread.
///
/// `bind` runs on the new thread inside the runtime context and must return
/// the socket plus its local address. `serve` then runs until shutdown or
/// an unrecoverable error. Returns once the socket is bound.
pub(crate) fn spawn_listener<T, B, S, F>(
    name: &'static str,
    bind: B,
    serve: S,
) -> Result<ListenerHandle, TransportError>
where
    T: 'static,
    B: FnOnce() -> io::Result<(T, SocketAddr)> + Send + 'static,
    S: FnOnce(T, oneshot::Receiver<()>) -> F + Send + 'static,
    F: Future<Output = Result<(), TransportError>> + 'static,
{
    let (ready_tx, ready_rx) = mpsc::sync_channel::<Result<SocketAddr, TransportError>>(1);
    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let (state_tx, state_rx) = watch::channel(ListenerState::Listening);

    let thread = thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(source) => {
                    let _ = ready_tx.send(Err(TransportError::Io {
                        action: "building listener runtime",
                        source,
                    }));
                    return;
                }
            };

            let bound = {
                let _guard = runtime.enter();
                bind()
            };
            let (socket, addr) = match bound {
                Ok(bound) => bound,
                Err(source) => {
                    let _ = ready_tx.send(Err(TransportError::Io {
                        action: "binding listener socket",
                        source,
                    }));
                    return;
                }
            };

            if ready_tx.send(Ok(addr)).is_err() {
                return;
            }
            tracing::info!(listener = name, addr = %addr, "Listener started");

            match runtime.block_on(serve(socket, shutdown_rx)) {
                Ok(()) => tracing::info!(listener = name, "Listener stopped"),
                Err(e) => tracing::error!(
                    listener = name,
                    error = %e,
                    "Listener failed, remote signals are no longer received"
                ),
            }
            let _ = state_tx.send(ListenerState::Stopped);
        })
        .map_err(|source| TransportError::Io {
            action: "spawning listener thread",
            source,
        })?;

    let local_addr = match ready_rx.recv() {
        Ok(Ok(addr)) => addr,
        Ok(Err(e)) => {
            let _ = thread.join();
            return Err(e);
        }
        Err(_) => {
            let _ = thread.join();
            return Err(TransportError::Io {
                action: "starting listener",
                source: io::Error::other("listener thread exited before binding"),
            });
        }
    };

    Ok(ListenerHandle {
        name,
        local_addr,
        state: state_rx,
        shutdown_tx: Some(shutdown_tx),
        thread: Some(thread),
    })
}
