use std::collections::HashMap;

use super::types::TaskState;

pub fn valid_state_transition(src: &TaskState, dst: &TaskState) -> bool {
    let state_transition_map: HashMap<TaskState, Vec<TaskState>> = {
        let mut map = HashMap::new();
        map.insert(
            TaskState::Pending,
            vec![TaskState::Running, TaskState::Aborted, TaskState::Canceled],
        );
        map.insert(
            TaskState::Running,
            vec![
                TaskState::Completed,
                TaskState::Failed,
                TaskState::StatesFailed,
                TaskState::Aborted,
                TaskState::Canceled,
            ],
        );
        // A feature setup failure is followed by the abort it triggers.
        map.insert(
            TaskState::StatesFailed,
            vec![TaskState::Aborted, TaskState::Canceled],
        );
        map.insert(TaskState::Completed, vec![]);
        map.insert(TaskState::Failed, vec![]);
        map.insert(TaskState::Aborted, vec![]);
        map.insert(TaskState::Canceled, vec![]);
        map
    };

    if let Some(valid_states) = state_transition_map.get(src) {
        valid_states.contains(dst)
    } else {
        false
    }
}
