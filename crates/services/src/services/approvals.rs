//! Pending human decisions for paused steps.
//!
//! When an assisted workflow pauses, the step's task parks on a oneshot
//! receiver registered here. The HTTP layer resolves the wait with a
//! [`StepDecision`]; cancellation unblocks it through the workflow's token
//! instead. No polling anywhere.

use std::collections::HashMap;

use tokio::sync::{Mutex, oneshot};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq)]
pub enum StepDecision {
    Approve,
    Reject { feedback: Option<String> },
    Retry { input: Option<String> },
    Skip { reason: Option<String> },
}

struct PendingDecision {
    workflow_id: Uuid,
    sender: oneshot::Sender<StepDecision>,
}

#[derive(Default)]
pub struct Approvals {
    pending: Mutex<HashMap<Uuid, PendingDecision>>,
}

impl Approvals {
    pub fn new() -> Self {
        Self::default()
    }

    /// Park a step. Re-registering the same step replaces the stale wait,
    /// whose receiver then resolves with a channel error.
    pub async fn register(
        &self,
        workflow_id: Uuid,
        step_id: Uuid,
    ) -> oneshot::Receiver<StepDecision> {
        let (sender, receiver) = oneshot::channel();
        self.pending.lock().await.insert(
            step_id,
            PendingDecision {
                workflow_id,
                sender,
            },
        );
        receiver
    }

    /// Deliver a decision. Returns false when nothing was waiting.
    pub async fn resolve(&self, step_id: Uuid, decision: StepDecision) -> bool {
        let entry = self.pending.lock().await.remove(&step_id);
        match entry {
            Some(pending) => pending.sender.send(decision).is_ok(),
            None => false,
        }
    }

    pub async fn discard(&self, step_id: Uuid) {
        self.pending.lock().await.remove(&step_id);
    }

    pub async fn is_waiting(&self, step_id: Uuid) -> bool {
        self.pending.lock().await.contains_key(&step_id)
    }

    /// Whether any step of the workflow is still parked. Drives the
    /// workflow's `needs_attention` flag.
    pub async fn waiting_for_workflow(&self, workflow_id: Uuid) -> bool {
        self.pending
            .lock()
            .await
            .values()
            .any(|pending| pending.workflow_id == workflow_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolve_delivers_to_the_registered_waiter() {
        let approvals = Approvals::new();
        let workflow_id = Uuid::new_v4();
        let step_id = Uuid::new_v4();

        let receiver = approvals.register(workflow_id, step_id).await;
        assert!(approvals.is_waiting(step_id).await);
        assert!(approvals.waiting_for_workflow(workflow_id).await);

        assert!(approvals.resolve(step_id, StepDecision::Approve).await);
        assert_eq!(receiver.await.unwrap(), StepDecision::Approve);

        assert!(!approvals.is_waiting(step_id).await);
        assert!(!approvals.waiting_for_workflow(workflow_id).await);
    }

    #[tokio::test]
    async fn resolve_without_a_waiter_reports_false() {
        let approvals = Approvals::new();
        assert!(
            !approvals
                .resolve(Uuid::new_v4(), StepDecision::Skip { reason: None })
                .await
        );
    }

    #[tokio::test]
    async fn reregistering_replaces_the_stale_wait() {
        let approvals = Approvals::new();
        let workflow_id = Uuid::new_v4();
        let step_id = Uuid::new_v4();

        let stale = approvals.register(workflow_id, step_id).await;
        let fresh = approvals.register(workflow_id, step_id).await;

        // The stale receiver resolves with an error, the fresh one wins.
        assert!(stale.await.is_err());
        assert!(
            approvals
                .resolve(step_id, StepDecision::Retry { input: None })
                .await
        );
        assert_eq!(fresh.await.unwrap(), StepDecision::Retry { input: None });
    }

    #[tokio::test]
    async fn discard_drops_the_wait() {
        let approvals = Approvals::new();
        let step_id = Uuid::new_v4();
        let receiver = approvals.register(Uuid::new_v4(), step_id).await;

        approvals.discard(step_id).await;
        assert!(receiver.await.is_err());
        assert!(!approvals.resolve(step_id, StepDecision::Approve).await);
    }
}
