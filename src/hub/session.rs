use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, error::TrySendError};
use uuid::Uuid;

/// One serialized envelope, shared between every queue it is fanned out to.
pub type Frame = Arc<str>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Driver,
    Customer,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Driver => "driver",
            Role::Customer => "customer",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "driver" => Ok(Role::Driver),
            "customer" => Ok(Role::Customer),
            other => Err(format!("unknown user_type: {other}, expected driver/customer")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushError {
    Full,
    Closed,
}

/// A connected peer as the hub sees it: identity plus the sending half of its
/// outbound queue. The receiving half belongs to the session's outbound loop.
pub struct Session {
    id: Uuid,
    user_id: String,
    role: Role,
    delivery_id: Option<String>,
    outbox: Mutex<Option<mpsc::Sender<Frame>>>,
}

impl Session {
    /// `delivery_id` is only kept for customers; drivers never watch a delivery.
    pub fn new(
        user_id: impl Into<String>,
        role: Role,
        delivery_id: Option<String>,
        queue_size: usize,
    ) -> (Arc<Self>, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(queue_size);
        let delivery_id = match role {
            Role::Customer => delivery_id.filter(|id| !id.is_empty()),
            Role::Driver => None,
        };

        let session = Self {
            id: Uuid::new_v4(),
            user_id: user_id.into(),
            role,
            delivery_id,
            outbox: Mutex::new(Some(tx)),
        };

        (Arc::new(session), rx)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn delivery_id(&self) -> Option<&str> {
        self.delivery_id.as_deref()
    }

    /// Enqueues without waiting.
    pub fn try_send(&self, frame: Frame) -> Result<(), PushError> {
        match self.outbox().as_ref() {
            Some(tx) => tx.try_send(frame).map_err(|err| match err {
                TrySendError::Full(_) => PushError::Full,
                TrySendError::Closed(_) => PushError::Closed,
            }),
            None => Err(PushError::Closed),
        }
    }

    /// Drops the sender so the outbound loop observes end-of-queue once it
    /// has drained what is already buffered. Returns `false` if the queue was
    /// already closed.
    pub(crate) fn close(&self) -> bool {
        self.outbox().take().is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.outbox().is_none()
    }

    fn outbox(&self) -> MutexGuard<'_, Option<mpsc::Sender<Frame>>> {
        self.outbox.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("user_id", &self.user_id)
            .field("role", &self.role)
            .field("delivery_id", &self.delivery_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::{PushError, Role, Session};

    #[test]
    fn drivers_never_carry_a_delivery_id() {
        let (driver, _rx) = Session::new("driver-1", Role::Driver, Some("d-1".to_string()), 4);
        let (customer, _rx2) =
            Session::new("customer-1", Role::Customer, Some("d-1".to_string()), 4);
        let (blank, _rx3) = Session::new("customer-2", Role::Customer, Some(String::new()), 4);

        assert_eq!(driver.delivery_id(), None);
        assert_eq!(customer.delivery_id(), Some("d-1"));
        assert_eq!(blank.delivery_id(), None);
    }

    #[test]
    fn full_queue_rejects_without_blocking() {
        let (session, _rx) = Session::new("customer-1", Role::Customer, None, 1);

        assert_eq!(session.try_send(Arc::from("one")), Ok(()));
        assert_eq!(session.try_send(Arc::from("two")), Err(PushError::Full));
    }

    #[tokio::test]
    async fn close_ends_the_queue_after_buffered_frames() {
        let (session, mut rx) = Session::new("customer-1", Role::Customer, None, 4);
        session.try_send(Arc::from("last")).unwrap();

        assert!(session.close());
        assert!(!session.close());
        assert!(session.is_closed());
        assert_eq!(session.try_send(Arc::from("late")), Err(PushError::Closed));

        assert_eq!(rx.recv().await.as_deref(), Some("last"));
        assert_eq!(rx.recv().await, None);
    }

    #[test]
    fn role_parses_from_query_values() {
        assert_eq!("driver".parse::<Role>(), Ok(Role::Driver));
        assert_eq!("customer".parse::<Role>(), Ok(Role::Customer));
        assert!("admin".parse::<Role>().is_err());
    }
}
