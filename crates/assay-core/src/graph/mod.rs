pub mod engine;

pub use engine::{DEFAULT_STALE_AFTER, StalePolicy, TaskGraph, TaskResolution, skip_event};

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet};

use crate::models::{CoreError, CoreErrorKind, Task, TaskDefinition, TaskList, TaskStatus};

pub type GraphResult<T> = Result<T, CoreError>;

/// Kahn's algorithm over `(name, dependencies)` nodes. Returns node indices
/// in execution order; among nodes that are ready at the same time the one
/// declared first wins.
pub fn topological_order(nodes: &[(&str, &BTreeSet<String>)]) -> GraphResult<Vec<usize>> {
    let mut index = BTreeMap::new();
    for (position, (name, _)) in nodes.iter().enumerate() {
        if name.trim().is_empty() {
            return Err(validation_error(format!(
                "node at position {position} has an empty name"
            )));
        }
        if index.insert(*name, position).is_some() {
            return Err(validation_error(format!("'{name}' is declared more than once")));
        }
    }

    let mut indegree = vec![0usize; nodes.len()];
    let mut dependents = vec![Vec::new(); nodes.len()];
    for (position, (name, dependencies)) in nodes.iter().enumerate() {
        for dependency in dependencies.iter() {
            let Some(&upstream) = index.get(dependency.as_str()) else {
                return Err(validation_error(format!(
                    "'{name}' depends on unknown '{dependency}'"
                )));
            };
            indegree[position] += 1;
            dependents[upstream].push(position);
        }
    }

    let mut ready: BTreeSet<usize> = (0..nodes.len())
        .filter(|position| indegree[*position] == 0)
        .collect();
    let mut order = Vec::with_capacity(nodes.len());
    while let Some(next) = ready.pop_first() {
        order.push(next);
        for &dependent in &dependents[next] {
            indegree[dependent] -= 1;
            if indegree[dependent] == 0 {
                ready.insert(dependent);
            }
        }
    }

    if order.len() != nodes.len() {
        let cyclic: Vec<&str> = (0..nodes.len())
            .filter(|position| indegree[*position] > 0)
            .map(|position| nodes[position].0)
            .collect();
        return Err(validation_error(format!(
            "dependency cycle among: {}",
            cyclic.join(", ")
        )));
    }

    Ok(order)
}

pub fn validate_definitions(definitions: &[TaskDefinition]) -> GraphResult<()> {
    let nodes: Vec<_> = definitions
        .iter()
        .map(|definition| (definition.name.as_str(), &definition.dependencies))
        .collect();
    topological_order(&nodes).map(|_| ())
}

pub fn validate_task_list(list: &TaskList) -> GraphResult<()> {
    let nodes: Vec<_> = list
        .tasks
        .iter()
        .map(|task| (task.name.as_str(), &task.dependencies))
        .collect();
    topological_order(&nodes).map(|_| ())
}

/// Pending tasks whose dependencies are all passing, best candidate first:
/// higher priority, then declaration order.
pub fn runnable(list: &TaskList) -> Vec<&Task> {
    let mut candidates: Vec<(usize, &Task)> = list
        .tasks
        .iter()
        .enumerate()
        .filter(|(_, task)| task.status == TaskStatus::Pending && list.dependencies_passing(task))
        .collect();
    candidates.sort_by_key(|(position, task)| (Reverse(task.priority.unwrap_or(0)), *position));
    candidates.into_iter().map(|(_, task)| task).collect()
}

pub fn next_runnable(list: &TaskList) -> Option<&Task> {
    runnable(list).into_iter().next()
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BlockedTask<'a> {
    pub task: &'a Task,
    /// Nearest failing or skipped ancestor.
    pub blocked_by: &'a str,
}

/// Pending tasks that cannot run until a failing or skipped ancestor is
/// resolved. Tasks that are only waiting on pending or running work are not
/// blocked.
pub fn blocked(list: &TaskList) -> Vec<BlockedTask<'_>> {
    let mut memo = BTreeMap::new();
    list.tasks
        .iter()
        .filter(|task| task.status == TaskStatus::Pending)
        .filter_map(|task| {
            blocking_ancestor(list, task, &mut memo).map(|blocked_by| BlockedTask {
                task,
                blocked_by,
            })
        })
        .collect()
}

fn blocking_ancestor<'a>(
    list: &'a TaskList,
    task: &'a Task,
    memo: &mut BTreeMap<&'a str, Option<&'a str>>,
) -> Option<&'a str> {
    if let Some(known) = memo.get(task.name.as_str()) {
        return *known;
    }
    memo.insert(task.name.as_str(), None);

    let mut found = None;
    for dependency in &task.dependencies {
        let Some(upstream) = list.get(dependency) else {
            continue;
        };
        found = match upstream.status {
            TaskStatus::Failing | TaskStatus::Skipped => Some(upstream.name.as_str()),
            TaskStatus::Passing => None,
            _ => blocking_ancestor(list, upstream, memo),
        };
        if found.is_some() {
            break;
        }
    }

    memo.insert(task.name.as_str(), found);
    found
}

fn validation_error(message: String) -> CoreError {
    CoreError::new(CoreErrorKind::ValidationError, message)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::{blocked, next_runnable, runnable, topological_order, validate_definitions};
    use crate::models::{CoreErrorKind, Task, TaskDefinition, TaskList, TaskStatus};

    fn list(definitions: Vec<TaskDefinition>) -> TaskList {
        TaskList {
            tasks: definitions.into_iter().map(Task::from_definition).collect(),
        }
    }

    fn set_status(list: &mut TaskList, name: &str, status: TaskStatus) {
        list.get_mut(name).unwrap().status = status;
    }

    #[test]
    fn ties_break_by_declaration_order() {
        let none = BTreeSet::new();
        let on_a: BTreeSet<String> = ["a".to_string()].into();
        let nodes = vec![("c", &on_a), ("a", &none), ("b", &none)];
        assert_eq!(topological_order(&nodes).unwrap(), vec![1, 2, 0]);
    }

    #[test]
    fn cycles_and_dangling_dependencies_are_rejected() {
        let cycle = vec![
            TaskDefinition::new("qc").depends_on("align"),
            TaskDefinition::new("align").depends_on("qc"),
        ];
        let error = validate_definitions(&cycle).unwrap_err();
        assert_eq!(error.kind, CoreErrorKind::ValidationError);
        assert!(error.message.contains("cycle"));

        let dangling = vec![TaskDefinition::new("align").depends_on("basecall")];
        let error = validate_definitions(&dangling).unwrap_err();
        assert!(error.message.contains("unknown 'basecall'"));

        let duplicate = vec![TaskDefinition::new("qc"), TaskDefinition::new("qc")];
        assert!(validate_definitions(&duplicate).is_err());
    }

    #[test]
    fn next_runnable_waits_for_passing_dependencies() {
        let mut tasks = list(vec![
            TaskDefinition::new("qc"),
            TaskDefinition::new("align").depends_on("qc"),
        ]);
        assert_eq!(next_runnable(&tasks).unwrap().name, "qc");

        set_status(&mut tasks, "qc", TaskStatus::InProgress);
        assert!(next_runnable(&tasks).is_none());

        set_status(&mut tasks, "qc", TaskStatus::Passing);
        assert_eq!(next_runnable(&tasks).unwrap().name, "align");
    }

    #[test]
    fn priority_outranks_declaration_order() {
        let tasks = list(vec![
            TaskDefinition::new("monitor"),
            TaskDefinition::new("qc").priority(5),
            TaskDefinition::new("basecall").priority(5),
        ]);
        let names: Vec<_> = runnable(&tasks).iter().map(|task| task.name.as_str()).collect();
        assert_eq!(names, vec!["qc", "basecall", "monitor"]);
    }

    #[test]
    fn failing_task_blocks_only_its_descendants() {
        let mut tasks = list(vec![
            TaskDefinition::new("basecall"),
            TaskDefinition::new("qc").depends_on("basecall"),
            TaskDefinition::new("align").depends_on("qc"),
            TaskDefinition::new("monitor"),
        ]);
        set_status(&mut tasks, "basecall", TaskStatus::Failing);

        let blocked = blocked(&tasks);
        let names: Vec<_> = blocked.iter().map(|entry| entry.task.name.as_str()).collect();
        assert_eq!(names, vec!["qc", "align"]);
        assert!(blocked.iter().all(|entry| entry.blocked_by == "basecall"));
        assert_eq!(next_runnable(&tasks).unwrap().name, "monitor");
    }
}
