use std::time::Duration;
use tokio::sync::{broadcast, mpsc};

use formsync::survey::FormEvent;

/// Events driving the watch loop
#[derive(Debug)]
pub enum Event {
  /// A cached survey changed or disappeared
  Form(FormEvent),
  /// Periodic tick for queue status reporting
  Tick,
  /// Ctrl-C
  Shutdown,
}

/// Merges form events, a tick timer and Ctrl-C into one stream
pub struct EventHandler {
  rx: mpsc::UnboundedReceiver<Event>,
}

impl EventHandler {
  pub fn new(mut forms: broadcast::Receiver<FormEvent>, tick_rate: Duration) -> Self {
    let (tx, rx) = mpsc::unbounded_channel();

    let form_tx = tx.clone();
    tokio::spawn(async move {
      loop {
        match forms.recv().await {
          Ok(event) => {
            if form_tx.send(Event::Form(event)).is_err() {
              break;
            }
          }
          Err(broadcast::error::RecvError::Lagged(missed)) => {
            tracing::warn!(missed, "Dropped form events");
          }
          Err(broadcast::error::RecvError::Closed) => break,
        }
      }
    });

    let tick_tx = tx.clone();
    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(tick_rate);
      ticker.tick().await;
      loop {
        ticker.tick().await;
        if tick_tx.send(Event::Tick).is_err() {
          break;
        }
      }
    });

    tokio::spawn(async move {
      if tokio::signal::ctrl_c().await.is_ok() {
        let _ = tx.send(Event::Shutdown);
      }
    });

    Self { rx }
  }

  /// Receive the next event
  pub async fn next(&mut self) -> Option<Event> {
    self.rx.recv().await
  }
}
