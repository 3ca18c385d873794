//! Message channel between pages and an intercepting layer.
//!
//! The layer runs as its own task. Pages hold a cheap [`CacheHandle`] and
//! talk to it with request/reply messages; every reply is correlated through
//! its own oneshot channel.

use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::error::{Error, Result};

use super::traits::{
  ActivateReport, CacheMessage, CacheReply, InstallReport, InterceptLayer, InterceptRequest,
  Intercepted,
};

const CHANNEL_CAPACITY: usize = 64;

enum Command {
  Install(oneshot::Sender<Result<InstallReport>>),
  Activate(oneshot::Sender<Result<ActivateReport>>),
  Intercept(InterceptRequest, oneshot::Sender<Result<Intercepted>>),
  Message(CacheMessage, oneshot::Sender<CacheReply>),
}

/// Client side of the channel.
#[derive(Clone)]
pub struct CacheHandle {
  tx: mpsc::Sender<Command>,
}

impl CacheHandle {
  pub async fn install(&self) -> Result<InstallReport> {
    let (reply, rx) = oneshot::channel();
    self.send(Command::Install(reply)).await?;
    rx.await.map_err(|_| closed())?
  }

  pub async fn activate(&self) -> Result<ActivateReport> {
    let (reply, rx) = oneshot::channel();
    self.send(Command::Activate(reply)).await?;
    rx.await.map_err(|_| closed())?
  }

  pub async fn intercept(&self, request: InterceptRequest) -> Result<Intercepted> {
    let (reply, rx) = oneshot::channel();
    self.send(Command::Intercept(request, reply)).await?;
    rx.await.map_err(|_| closed())?
  }

  /// Post a page message and wait for the layer's reply.
  pub async fn post(&self, message: CacheMessage) -> Result<CacheReply> {
    let (reply, rx) = oneshot::channel();
    self.send(Command::Message(message, reply)).await?;
    rx.await.map_err(|_| closed())
  }

  async fn send(&self, command: Command) -> Result<()> {
    self.tx.send(command).await.map_err(|_| closed())
  }
}

fn closed() -> Error {
  Error::Http("cache worker is gone".into())
}

/// Run `layer` in its own task.
///
/// Lifecycle commands run one at a time, in order. Intercepts and messages
/// run concurrently. The task ends once every handle is dropped.
pub fn spawn<L: InterceptLayer + 'static>(layer: L) -> (CacheHandle, JoinHandle<()>) {
  let (tx, mut rx) = mpsc::channel(CHANNEL_CAPACITY);
  let layer = Arc::new(layer);

  let task = tokio::spawn(async move {
    while let Some(command) = rx.recv().await {
      match command {
        Command::Install(reply) => {
          let _ = reply.send(layer.on_install().await);
        }
        Command::Activate(reply) => {
          let _ = reply.send(layer.on_activate().await);
        }
        Command::Intercept(request, reply) => {
          let layer = Arc::clone(&layer);
          tokio::spawn(async move {
            let _ = reply.send(layer.on_intercept(request).await);
          });
        }
        Command::Message(message, reply) => {
          let layer = Arc::clone(&layer);
          tokio::spawn(async move {
            let _ = reply.send(layer.on_message(message).await);
          });
        }
      }
    }
    tracing::debug!("Cache worker stopped");
  });

  (CacheHandle { tx }, task)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::layer::tests::MockUpstream;
  use crate::cache::{CachedResponse, HashStatus, ResourceCache, ResourceRoutes};
  use crate::db::Store;
  use url::Url;

  #[tokio::test]
  async fn test_round_trip_through_worker() {
    let store = Arc::new(Store::open_in_memory().unwrap());
    let upstream = Arc::new(MockUpstream::default());
    upstream.respond(
      "https://forms.example.org/transform/xform/abc",
      CachedResponse::new(200, r#"{"hash":"abc123"}"#),
    );
    upstream.respond(
      "https://forms.example.org/transform/xform/hash/abc",
      CachedResponse::new(200, r#"{"hash":"abc123"}"#),
    );
    let routes = ResourceRoutes::new("https://forms.example.org", "").unwrap();
    let (handle, task) = spawn(ResourceCache::new(store, upstream, routes, "1"));

    handle.install().await.unwrap();
    handle.activate().await.unwrap();

    let payload = Url::parse("https://forms.example.org/transform/xform/abc").unwrap();
    let first = handle.intercept(InterceptRequest::get(payload)).await.unwrap();
    assert!(matches!(first, Intercepted::Respond { .. }));

    let reply = handle
      .post(CacheMessage::CheckFormHash {
        survey_id: "abc".into(),
        url: "https://forms.example.org/x/abc".into(),
      })
      .await
      .unwrap();
    assert_eq!(reply.status, HashStatus::FormUpToDate);

    drop(handle);
    task.await.unwrap();
  }
}
