// Panic isolation helpers for consumer execution
use std::any::Any;
use tokio::task::JoinError;

/// Why a spawned consumer task did not return normally
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskFailure {
    Panicked(String),
    Cancelled,
}

/// Classify a join error of a consumer task
pub fn classify_join_error(err: JoinError) -> TaskFailure {
    if err.is_panic() {
        TaskFailure::Panicked(panic_message(err.into_panic().as_ref()))
    } else {
        TaskFailure::Cancelled
    }
}

/// Extract the panic message from a panic payload
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_panicking_task_is_classified() {
        let handle = tokio::spawn(async {
            panic!("consumer exploded");
        });
        let err = handle.await.unwrap_err();
        assert_eq!(
            classify_join_error(err),
            TaskFailure::Panicked("consumer exploded".to_string())
        );
    }

    #[tokio::test]
    async fn test_aborted_task_is_cancelled() {
        let handle = tokio::spawn(async {
            tokio::time::sleep(std::time::Duration::from_secs(60)).await;
        });
        handle.abort();
        let err = handle.await.unwrap_err();
        assert_eq!(classify_join_error(err), TaskFailure::Cancelled);
    }
}
