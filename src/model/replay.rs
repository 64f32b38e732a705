//! Scripted model that replays prepared rounds. Used by tests and demos.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::{EventStream, ModelRequest, ModelStream, StreamEvent};
use crate::error::{KilnError, Result};

/// One scripted step of a round.
#[derive(Debug, Clone)]
pub enum ReplayStep {
    Event(StreamEvent),
    /// Raise a provider error and end the round.
    Fail {
        status: Option<u16>,
        message: String,
        retryable: bool,
    },
    Delay(Duration),
    /// Produce nothing more until cancelled.
    Hang,
}

impl ReplayStep {
    pub fn fail(status: u16, message: impl Into<String>) -> Self {
        Self::Fail {
            status: Some(status),
            message: message.into(),
            retryable: false,
        }
    }
}

impl From<StreamEvent> for ReplayStep {
    fn from(event: StreamEvent) -> Self {
        Self::Event(event)
    }
}

/// Each `open` consumes the next round; the request is recorded.
#[derive(Debug)]
pub struct ReplayModel {
    id: String,
    rounds: Mutex<VecDeque<Vec<ReplayStep>>>,
    requests: Mutex<Vec<ModelRequest>>,
}

impl ReplayModel {
    pub fn new(rounds: Vec<Vec<ReplayStep>>) -> Self {
        Self {
            id: "replay".to_string(),
            rounds: Mutex::new(rounds.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Requests seen so far, in order.
    pub fn requests(&self) -> Vec<ModelRequest> {
        self.requests
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    pub fn remaining_rounds(&self) -> usize {
        self.rounds.lock().map(|r| r.len()).unwrap_or_default()
    }
}

#[async_trait]
impl ModelStream for ReplayModel {
    fn model_id(&self) -> &str {
        &self.id
    }

    async fn open(&self, request: &ModelRequest, cancel: CancellationToken) -> Result<EventStream> {
        let round = self
            .rounds
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pop_front()
            .ok_or_else(|| KilnError::InvalidState("replay script exhausted".into()))?;
        self.requests
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(request.clone());

        let stream = async_stream::stream! {
            for step in round {
                if cancel.is_cancelled() {
                    return;
                }
                match step {
                    ReplayStep::Event(event) => yield Ok(event),
                    ReplayStep::Fail { status, message, retryable } => {
                        yield Err(KilnError::Provider { status, message, retryable });
                        return;
                    }
                    ReplayStep::Delay(duration) => {
                        tokio::select! {
                            _ = cancel.cancelled() => return,
                            _ = tokio::time::sleep(duration) => {}
                        }
                    }
                    ReplayStep::Hang => {
                        cancel.cancelled().await;
                        return;
                    }
                }
            }
        };
        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn request() -> ModelRequest {
        ModelRequest {
            session_id: "ses_1".into(),
            messages: vec![],
            tools: vec![],
        }
    }

    #[tokio::test]
    async fn replays_rounds_in_order() {
        let model = ReplayModel::new(vec![
            vec![StreamEvent::StartStep.into()],
            vec![ReplayStep::fail(503, "busy")],
        ]);
        let cancel = CancellationToken::new();

        let first: Vec<_> = model.open(&request(), cancel.clone()).await.unwrap().collect().await;
        assert_eq!(first.len(), 1);
        assert!(matches!(first[0], Ok(StreamEvent::StartStep)));

        let second: Vec<_> = model.open(&request(), cancel.clone()).await.unwrap().collect().await;
        assert!(matches!(&second[0], Err(err) if err.is_retryable()));

        assert!(model.open(&request(), cancel).await.is_err());
        assert_eq!(model.requests().len(), 2);
    }

    #[tokio::test]
    async fn hang_ends_on_cancel() {
        let model = ReplayModel::new(vec![vec![ReplayStep::Hang]]);
        let cancel = CancellationToken::new();
        let mut stream = model.open(&request(), cancel.clone()).await.unwrap();
        cancel.cancel();
        assert!(stream.next().await.is_none());
    }
}
