//! Enrollment activation and domain event emission.
//!
//! Activation is protected by a storage-level uniqueness constraint on
//! `(user_id, course_id)` rather than an application lock, because it can
//! be triggered from more than one causal path: payment success (inside
//! the reconciliation commit) and the free-course direct path here. A
//! uniqueness conflict is success, not an error.
//!
//! `CourseEnrolled` is published after commit on a broadcast channel for
//! downstream notification/analytics collaborators; their delivery
//! semantics are out of scope.

use std::sync::Arc;
use uuid::Uuid;

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::info;

use crate::repository::{ActivationOutcome, Repository, RepositoryError};
use crate::state_machine::state::{CourseId, UserId};

/// Capacity of the domain event channel. Slow subscribers lag rather than
/// block the engine.
const DOMAIN_EVENT_CAPACITY: usize = 256;

/// Events this engine emits for external collaborators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum DomainEvent {
    CourseEnrolled {
        user_id: UserId,
        course_id: CourseId,
        /// None for free-course enrollments.
        payment_intent_id: Option<Uuid>,
    },
}

/// Creates enrollment records exactly once per `(user, course)` pair and
/// announces them.
pub struct EnrollmentActivator {
    repository: Arc<dyn Repository>,
    events: broadcast::Sender<DomainEvent>,
}

impl EnrollmentActivator {
    pub fn new(repository: Arc<dyn Repository>) -> Self {
        let (events, _) = broadcast::channel(DOMAIN_EVENT_CAPACITY);
        Self { repository, events }
    }

    /// Subscribe to domain events emitted after commit.
    pub fn subscribe(&self) -> broadcast::Receiver<DomainEvent> {
        self.events.subscribe()
    }

    /// Activate an enrollment outside the payment path (free courses).
    ///
    /// Safe under concurrent calls for the same pair; the loser of the
    /// race observes `AlreadyEnrolled` and no second event is published.
    pub async fn activate(
        &self,
        user_id: &UserId,
        course_id: &CourseId,
        payment_intent_id: Option<Uuid>,
    ) -> Result<ActivationOutcome, RepositoryError> {
        let outcome = self
            .repository
            .activate_enrollment(user_id, course_id, payment_intent_id)
            .await?;

        match outcome {
            ActivationOutcome::Created => {
                info!("enrolled user {} in course {}", user_id, course_id);
                self.publish_enrolled(user_id.clone(), course_id.clone(), payment_intent_id);
            }
            ActivationOutcome::AlreadyEnrolled => {
                info!(
                    "user {} already enrolled in course {}, treating as success",
                    user_id, course_id
                );
            }
        }

        Ok(outcome)
    }

    /// Publish `CourseEnrolled` for an enrollment that was committed as
    /// part of a reconciliation unit of work.
    pub(crate) fn publish_enrolled(
        &self,
        user_id: UserId,
        course_id: CourseId,
        payment_intent_id: Option<Uuid>,
    ) {
        // send() errs only when nobody is subscribed, which is fine.
        let _ = self.events.send(DomainEvent::CourseEnrolled {
            user_id,
            course_id,
            payment_intent_id,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::InMemoryRepository;

    #[tokio::test]
    async fn test_activate_publishes_once() {
        let repository = Arc::new(InMemoryRepository::new());
        let activator = EnrollmentActivator::new(repository);
        let mut events = activator.subscribe();

        let user = UserId::from("user_1");
        let course = CourseId::from("course_1");

        let first = activator.activate(&user, &course, None).await.unwrap();
        assert_eq!(first, ActivationOutcome::Created);

        let second = activator.activate(&user, &course, None).await.unwrap();
        assert_eq!(second, ActivationOutcome::AlreadyEnrolled);

        // Exactly one event for the pair.
        let event = events.try_recv().unwrap();
        assert_eq!(
            event,
            DomainEvent::CourseEnrolled {
                user_id: user,
                course_id: course,
                payment_intent_id: None,
            }
        );
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_concurrent_activation_single_row() {
        let repository = Arc::new(InMemoryRepository::new());
        let activator = Arc::new(EnrollmentActivator::new(repository.clone()));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let activator = activator.clone();
            handles.push(tokio::spawn(async move {
                activator
                    .activate(&UserId::from("user_1"), &CourseId::from("course_1"), None)
                    .await
                    .unwrap()
            }));
        }

        let mut created = 0;
        for handle in handles {
            if handle.await.unwrap() == ActivationOutcome::Created {
                created += 1;
            }
        }
        assert_eq!(created, 1, "the constraint admits exactly one creator");

        let enrollment = repository
            .find_enrollment(&UserId::from("user_1"), &CourseId::from("course_1"))
            .await
            .unwrap();
        assert!(enrollment.is_some());
    }
}
