//! Spawned turns with an abort/wait handle.

use std::sync::Arc;

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use super::processor::TurnProcessor;
use super::types::{TurnOutcome, TurnRequest, TurnResult};
use crate::error::KilnError;
use crate::session::{AssistantMessage, MessageError};

/// Handle for an in-flight turn.
#[derive(Debug)]
pub struct TurnHandle {
    session_id: String,
    message_id: String,
    cancel: CancellationToken,
    result_rx: oneshot::Receiver<TurnResult>,
}

impl TurnHandle {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    /// Request cancellation. Returns `false` if already requested.
    pub fn abort(&self) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        self.cancel.cancel();
        true
    }

    /// Wait for the turn to settle.
    pub async fn wait(self) -> TurnResult {
        match self.result_rx.await {
            Ok(result) => result,
            Err(_) => {
                let mut message = AssistantMessage::new(self.message_id, self.session_id);
                message.error = Some(MessageError::from(&KilnError::Canceled));
                message.finish = Some("error".to_string());
                TurnResult {
                    outcome: TurnOutcome::Error,
                    message,
                    steps: 0,
                }
            }
        }
    }
}

/// Starts turns on the tokio runtime.
#[derive(Debug, Clone)]
pub struct TurnRunner {
    processor: Arc<TurnProcessor>,
}

impl TurnRunner {
    pub fn new(processor: Arc<TurnProcessor>) -> Self {
        Self { processor }
    }

    pub fn processor(&self) -> &Arc<TurnProcessor> {
        &self.processor
    }

    pub fn start(&self, request: TurnRequest) -> TurnHandle {
        let cancel = CancellationToken::new();
        let (result_tx, result_rx) = oneshot::channel();
        let handle = TurnHandle {
            session_id: request.session_id.clone(),
            message_id: request.message_id.clone(),
            cancel: cancel.clone(),
            result_rx,
        };

        let processor = self.processor.clone();
        tokio::spawn(async move {
            let result = processor.process(request, cancel).await;
            let _ = result_tx.send(result);
        });
        handle
    }
}
