//! Inbound data transfers and their correlation with download requests.

use crate::error::{WireError, WireResult};
use crate::message::DataTransferMessage;
use crate::pending::PendingTable;
use futures::future::BoxFuture;
use peermesh_types::{EndpointId, MessageId};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

/// Matches inbound data streams to the downloads waiting for them.
pub struct DataHandler {
    /// Completed with the written file; the context is the target path.
    pending: PendingTable<PathBuf, PathBuf>,
}

impl DataHandler {
    pub fn new() -> Self {
        Self {
            pending: PendingTable::new(),
        }
    }

    /// Expect a stream from `endpoint` answering `request`, to be written
    /// to `path`.
    pub fn forward_data(
        &self,
        endpoint: EndpointId,
        request: MessageId,
        path: PathBuf,
        timeout: Duration,
    ) -> BoxFuture<'static, WireResult<PathBuf>> {
        self.pending.register((endpoint, request), path, timeout)
    }

    /// Write an inbound stream to its target file and complete the waiting
    /// download. Returns `false` when nobody was waiting for it.
    pub async fn process_data(&self, transfer: DataTransferMessage) -> bool {
        let key = (transfer.sender.clone(), transfer.responding_to);
        let Some(waiter) = self.pending.take(&key) else {
            debug!(
                endpoint = %transfer.sender,
                responding_to = %transfer.responding_to,
                "Discarding unexpected data transfer"
            );
            return false;
        };

        let path = waiter.context.clone();
        let result = write_file(&path, &transfer.data).await.map(|_| path);
        if let Err(e) = &result {
            warn!(endpoint = %transfer.sender, error = %e, "Writing transferred data failed");
        }
        waiter.complete(result);
        true
    }

    /// Drop one wait registered with [`forward_data`](Self::forward_data).
    pub fn cancel_data(&self, endpoint: &EndpointId, request: MessageId) -> bool {
        self.pending.cancel(&(endpoint.clone(), request))
    }

    pub fn on_endpoint_signed_off(&self, endpoint: &EndpointId) {
        let cancelled = self.pending.cancel_endpoint(endpoint);
        if cancelled > 0 {
            debug!(endpoint = %endpoint, cancelled, "Cancelled pending downloads");
        }
    }

    pub fn on_local_channel_closed(&self) {
        self.pending.cancel_all();
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

impl Default for DataHandler {
    fn default() -> Self {
        Self::new()
    }
}

async fn write_file(path: &Path, data: &[u8]) -> WireResult<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }
    tokio::fs::write(path, data).await.map_err(WireError::Io)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn transfer(
        sender: &EndpointId,
        responding_to: MessageId,
        data: &'static [u8],
    ) -> DataTransferMessage {
        DataTransferMessage {
            id: MessageId::new(),
            sender: sender.clone(),
            receiver: EndpointId::new("local", 1),
            responding_to,
            data: Bytes::from_static(data),
        }
    }

    #[tokio::test]
    async fn test_stream_is_written_and_completes() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("nested").join("file.bin");
        let handler = DataHandler::new();
        let remote = EndpointId::new("remote", 2);
        let request = MessageId::new();

        let wait =
            handler.forward_data(remote.clone(), request, target.clone(), Duration::from_secs(5));
        assert!(handler.process_data(transfer(&remote, request, b"contents")).await);

        assert_eq!(wait.await.unwrap(), target);
        assert_eq!(tokio::fs::read(&target).await.unwrap(), b"contents");
    }

    #[tokio::test]
    async fn test_unexpected_stream_is_discarded() {
        let handler = DataHandler::new();
        assert!(
            !handler
                .process_data(transfer(&EndpointId::new("x", 1), MessageId::new(), b"?"))
                .await
        );
    }

    #[tokio::test]
    async fn test_write_failure_fails_wait() {
        let dir = tempfile::tempdir().unwrap();
        // A directory cannot be overwritten as a file.
        let target = dir.path().to_path_buf();
        let handler = DataHandler::new();
        let remote = EndpointId::new("remote", 2);
        let request = MessageId::new();

        let wait = handler.forward_data(remote.clone(), request, target, Duration::from_secs(5));
        handler.process_data(transfer(&remote, request, b"x")).await;
        assert!(matches!(wait.await, Err(WireError::Io(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_stream_times_out() {
        let handler = DataHandler::new();
        let wait = handler.forward_data(
            EndpointId::new("remote", 2),
            MessageId::new(),
            PathBuf::from("never.bin"),
            Duration::from_secs(1),
        );
        assert!(matches!(wait.await, Err(WireError::Timeout(_))));
        assert_eq!(handler.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_cancellation() {
        let handler = DataHandler::new();
        let remote = EndpointId::new("remote", 2);
        let wait = handler.forward_data(
            remote.clone(),
            MessageId::new(),
            PathBuf::from("a"),
            Duration::from_secs(5),
        );
        let other = handler.forward_data(
            EndpointId::new("b", 1),
            MessageId::new(),
            PathBuf::from("b"),
            Duration::from_secs(5),
        );

        handler.on_endpoint_signed_off(&remote);
        assert!(matches!(wait.await, Err(WireError::Cancelled)));

        handler.on_local_channel_closed();
        assert!(matches!(other.await, Err(WireError::Cancelled)));
    }
}
