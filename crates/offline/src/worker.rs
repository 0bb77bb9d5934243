//! Runs a [`Dispatcher`] on its own task and exposes it to the page through a
//! message channel.

use serde_json::Value;
use thiserror::Error;
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tracing::{info, warn};

use crate::dispatcher::{
    ControlMessage, ControlReply, DispatchError, Dispatched, Dispatcher, LifecycleState,
};
use crate::fetch::FetchRequest;
use crate::sync::{QueueKind, SyncReport};

const COMMAND_BUFFER: usize = 64;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("offline worker has stopped")]
    Stopped,
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

enum Command {
    Fetch {
        request: FetchRequest,
        reply: oneshot::Sender<Dispatched>,
    },
    Message {
        message: ControlMessage,
        reply: oneshot::Sender<ControlReply>,
    },
    Sync {
        tag: String,
        reply: oneshot::Sender<Result<SyncReport, DispatchError>>,
    },
    Queue {
        kind: QueueKind,
        endpoint: String,
        payload: Value,
        reply: oneshot::Sender<Result<u64, DispatchError>>,
    },
    State {
        reply: oneshot::Sender<LifecycleState>,
    },
}

/// Page-side handle to the running worker. Cloning shares the channel.
#[derive(Clone)]
pub struct WorkerHandle {
    commands: mpsc::Sender<Command>,
}

impl WorkerHandle {
    pub async fn fetch(&self, request: FetchRequest) -> Result<Dispatched, WorkerError> {
        self.call(|reply| Command::Fetch { request, reply }).await
    }

    pub async fn post_message(&self, message: ControlMessage) -> Result<ControlReply, WorkerError> {
        self.call(|reply| Command::Message { message, reply }).await
    }

    pub async fn sync(&self, tag: &str) -> Result<SyncReport, WorkerError> {
        let tag = tag.to_string();
        Ok(self.call(|reply| Command::Sync { tag, reply }).await??)
    }

    pub async fn queue(
        &self,
        kind: QueueKind,
        endpoint: &str,
        payload: Value,
    ) -> Result<u64, WorkerError> {
        let endpoint = endpoint.to_string();
        Ok(self
            .call(|reply| Command::Queue {
                kind,
                endpoint,
                payload,
                reply,
            })
            .await??)
    }

    pub async fn state(&self) -> Result<LifecycleState, WorkerError> {
        self.call(|reply| Command::State { reply }).await
    }

    async fn call<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, WorkerError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(build(tx))
            .await
            .map_err(|_| WorkerError::Stopped)?;
        rx.await.map_err(|_| WorkerError::Stopped)
    }
}

/// Installs the dispatcher, activates it when configured to, then serves
/// commands until every handle is dropped. Fetches, control messages and
/// syncs run on their own tasks so a slow network never stalls the loop.
pub fn spawn(dispatcher: Dispatcher) -> (WorkerHandle, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<Command>(COMMAND_BUFFER);

    let task = tokio::spawn(async move {
        match dispatcher.install().await {
            Ok(()) if dispatcher.config().activate_on_install => {
                if let Err(err) = dispatcher.activate().await {
                    warn!(stage = "offline", error = %err, "activation failed");
                }
            }
            Ok(()) => {}
            Err(err) => warn!(stage = "offline", error = %err, "install failed"),
        }
        info!(stage = "offline", state = ?dispatcher.state(), "offline worker ready");

        while let Some(command) = rx.recv().await {
            match command {
                Command::Fetch { request, reply } => {
                    let dispatcher = dispatcher.clone();
                    tokio::spawn(async move {
                        let _ = reply.send(dispatcher.handle_fetch(request).await);
                    });
                }
                Command::Message { message, reply } => {
                    let dispatcher = dispatcher.clone();
                    tokio::spawn(async move {
                        let _ = reply.send(dispatcher.handle_message(message).await);
                    });
                }
                Command::Sync { tag, reply } => {
                    let dispatcher = dispatcher.clone();
                    tokio::spawn(async move {
                        let _ = reply.send(dispatcher.sync(&tag).await);
                    });
                }
                Command::Queue {
                    kind,
                    endpoint,
                    payload,
                    reply,
                } => {
                    let _ = reply.send(dispatcher.queue(kind, &endpoint, payload));
                }
                Command::State { reply } => {
                    let _ = reply.send(dispatcher.state());
                }
            }
        }
        info!(stage = "offline", "offline worker stopped");
    });

    (WorkerHandle { commands: tx }, task)
}
