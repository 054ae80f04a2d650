use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing_futures::Instrument;

use super::dispatcher::HostDispatcher;
use super::InvokeChannel;
use crate::error::{StorageError, StorageResult};

struct Envelope {
    command: String,
    args: Value,
    reply: oneshot::Sender<StorageResult<Value>>,
}

/// The UI side of the host channel.
///
/// Requests are queued to the host task and each gets its own reply
/// channel, so concurrent callers never see each other's results.
#[derive(Clone)]
pub struct IpcClient {
    tx: mpsc::Sender<Envelope>,
}

/// Starts the host loop on the current runtime.
///
/// The loop exits once every `IpcClient` handle has been dropped.
pub fn spawn(dispatcher: HostDispatcher, capacity: usize) -> (IpcClient, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<Envelope>(capacity.max(1));

    let handle = tokio::spawn(async move {
        info!("host channel is ready");

        while let Some(envelope) = rx.recv().await {
            let dispatcher = dispatcher.clone();
            let span = debug_span!("host-request", command = %envelope.command);

            tokio::spawn(
                async move {
                    let result = dispatcher.handle(&envelope.command, envelope.args).await;
                    if envelope.reply.send(result).is_err() {
                        warn!("caller went away before the host replied");
                    }
                }
                .instrument(span),
            );
        }

        info!("host channel closed");
    });

    (IpcClient { tx }, handle)
}

#[async_trait]
impl InvokeChannel for IpcClient {
    async fn invoke(&self, command: &str, args: Value) -> StorageResult<Value> {
        let (reply, rx) = oneshot::channel();
        let envelope = Envelope {
            command: command.to_string(),
            args,
            reply,
        };

        self.tx
            .send(envelope)
            .await
            .map_err(|_| StorageError::transport("host channel is closed"))?;

        rx.await
            .map_err(|_| StorageError::transport("host dropped the request"))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::commands;
    use serde_json::json;
    use tempfile::TempDir;

    #[tokio::test]
    async fn requests_travel_through_the_channel() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let (client, _handle) = spawn(HostDispatcher::new().with_root(temp.path()), 8);

        client
            .invoke(
                commands::FS_SAVE_IMAGE,
                json!({"path": "x.png", "data": base64::encode(b"hi")}),
            )
            .await?;

        let loaded = client
            .invoke(commands::FS_LOAD_IMAGE, json!({"path": "x.png"}))
            .await?;
        assert_eq!(loaded, json!(base64::encode(b"hi")));
        Ok(())
    }

    #[tokio::test]
    async fn concurrent_callers_get_their_own_replies() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let (client, _handle) = spawn(HostDispatcher::new().with_root(temp.path()), 2);

        let mut tasks = vec![];
        for i in 0..16u8 {
            let client = client.clone();
            tasks.push(tokio::spawn(async move {
                let path = format!("{}.png", i);
                client
                    .invoke(
                        commands::FS_SAVE_IMAGE,
                        json!({"path": &path, "data": base64::encode([i])}),
                    )
                    .await?;
                client
                    .invoke(commands::FS_LOAD_IMAGE, json!({ "path": path }))
                    .await
            }));
        }

        for (i, task) in tasks.into_iter().enumerate() {
            let value = task.await??;
            assert_eq!(value, json!(base64::encode([i as u8])));
        }
        Ok(())
    }

    #[tokio::test]
    async fn closed_host_is_a_transport_error() {
        let (client, handle) = spawn(HostDispatcher::new(), 1);
        handle.abort();
        let _ = handle.await;

        let err = client
            .invoke(commands::FS_LIST_IMAGES, json!({"directory": "x"}))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Transport(_)));
    }
}
