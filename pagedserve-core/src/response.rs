use serde::Serialize;

use crate::error::{Error, Result};
use crate::sequence::{RequestId, StopReason};

/// Deltas of one engine step.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StepOutput {
    /// One token per sequence that ran this step, in batch order.
    pub new_tokens: Vec<(RequestId, u32)>,
    pub finished: Vec<RequestId>,
    /// Requests aborted through an `EngineHandle` at the start of this step.
    pub aborted: Vec<RequestId>,
    pub preempted: Vec<RequestId>,
}

impl StepOutput {
    pub fn is_empty(&self) -> bool {
        self.new_tokens.is_empty()
            && self.finished.is_empty()
            && self.aborted.is_empty()
            && self.preempted.is_empty()
    }
}

/// Final result of one request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct GenerationOutput {
    pub request_id: RequestId,
    pub prompt_tokens: Vec<u32>,
    pub token_ids: Vec<u32>,
    pub text: String,
    pub finish_reason: StopReason,
    pub num_preemptions: usize,
}

impl GenerationOutput {
    /// `Err` for requests that did not complete.
    pub fn into_result(self) -> Result<Self> {
        match self.finish_reason {
            StopReason::Canceled => Err(Error::AbortedByUser(self.request_id)),
            StopReason::Error => Err(Error::RequestFailed(self.request_id)),
            StopReason::Eos | StopReason::Length => Ok(self),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn output(finish_reason: StopReason) -> GenerationOutput {
        GenerationOutput {
            request_id: 4,
            prompt_tokens: vec![1],
            token_ids: vec![2],
            text: "b".into(),
            finish_reason,
            num_preemptions: 0,
        }
    }

    #[test]
    fn canceled_output_is_an_error() {
        assert!(output(StopReason::Length).into_result().is_ok());
        assert!(matches!(
            output(StopReason::Canceled).into_result(),
            Err(Error::AbortedByUser(4))
        ));
        assert!(matches!(
            output(StopReason::Error).into_result(),
            Err(Error::RequestFailed(4))
        ));
    }

    #[test]
    fn serializes_finish_reason() {
        let json = serde_json::to_value(output(StopReason::Eos)).unwrap();
        assert_eq!(json["finish_reason"], "eos");
        for reason in [
            StopReason::Eos,
            StopReason::Length,
            StopReason::Canceled,
            StopReason::Error,
        ] {
            assert_eq!(
                serde_json::to_value(reason).unwrap(),
                serde_json::Value::String(reason.to_string())
            );
        }
    }
}
