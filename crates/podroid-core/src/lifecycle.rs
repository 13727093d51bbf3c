use crate::CoreError;
use podroid_store::ContainerStatus;

pub fn validate_transition(from: ContainerStatus, to: ContainerStatus) -> Result<(), CoreError> {
    let valid = matches!(
        (from, to),
        (
            ContainerStatus::Created | ContainerStatus::Stopped | ContainerStatus::Exited,
            ContainerStatus::Running
        ) | (
            ContainerStatus::Running,
            ContainerStatus::Stopped | ContainerStatus::Exited
        ) | (
            ContainerStatus::Created
                | ContainerStatus::Running
                | ContainerStatus::Stopped
                | ContainerStatus::Exited,
            ContainerStatus::Removed
        )
    );

    if valid {
        Ok(())
    } else {
        Err(CoreError::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        })
    }
}
