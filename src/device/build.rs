use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The stage a task is put in when none was pushed.
pub const UNKNOWN_STAGE: &str = "<Unknown stage>";

/// A task within a stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    /// Task name.
    pub name: String,
    /// When it was pushed.
    pub start: DateTime<Utc>,
}

/// A stage of a build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stage {
    /// Stage name.
    pub name: String,
    /// When it was pushed.
    pub start: DateTime<Utc>,
    /// Stack of tasks, innermost last.
    pub tasks: Vec<Task>,
}

/// A step (stage or task) as shown to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    /// Name.
    pub name: String,
    /// When it was pushed.
    pub start: DateTime<Utc>,
}

/// Changes an external build system makes to a running build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", content = "value", rename_all = "camelCase")]
pub enum BuildOp {
    /// Enter a stage.
    PushStage(String),
    /// Leave the current stage.
    PopStage,
    /// Enter a task in the current stage.
    PushTask(String),
    /// Leave the current task.
    PopTask,
    /// The build finished. Ends it.
    Result(bool),
}

/// A build an external system is running on a device.
///
/// Cloning it keeps the build going on a replacement device after a reload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Build {
    device: String,
    name: String,
    link: Option<String>,
    start: DateTime<Utc>,
    stages: Vec<Stage>,
    result: Option<bool>,
    external: bool,
    ended: bool,
}

/// A build as shown to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildSnapshot {
    /// Name of the device the build runs on.
    pub device: String,
    /// Build name.
    pub name: String,
    /// Link to the build's page.
    pub link: Option<String>,
    /// When it started.
    pub start: DateTime<Utc>,
    /// Innermost stage.
    pub stage: Option<Step>,
    /// Innermost task of the innermost stage.
    pub task: Option<Step>,
    /// Pass or fail, when known.
    pub result: Option<bool>,
    /// Started by an external system rather than a user.
    pub external: bool,
    /// No longer the device's current build.
    pub ended: bool,
}

impl Build {
    /// A fresh build with no stages.
    pub fn new(device: &str, name: &str, link: Option<String>, external: bool) -> Self {
        Self {
            device: device.into(),
            name: name.into(),
            link,
            start: Utc::now(),
            stages: vec![],
            result: None,
            external,
            ended: false,
        }
    }

    /// Build name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Pass or fail, when known.
    pub fn result(&self) -> Option<bool> {
        self.result
    }

    /// True once the build is no longer current.
    pub fn is_ended(&self) -> bool {
        self.ended
    }

    /// Innermost stage.
    pub fn current_stage(&self) -> Option<&Stage> {
        self.stages.last()
    }

    /// Innermost task.
    pub fn current_task(&self) -> Option<&Task> {
        self.current_stage().and_then(|stage| stage.tasks.last())
    }

    /// Enter a stage.
    pub fn push_stage(&mut self, name: &str) {
        self.stages.push(Stage {
            name: name.into(),
            start: Utc::now(),
            tasks: vec![],
        });
    }

    /// Leave the current stage, if any.
    pub fn pop_stage(&mut self) -> Option<Stage> {
        self.stages.pop()
    }

    /// Enter a task. Without a stage, one is made up.
    pub fn push_task(&mut self, name: &str) {
        if self.stages.is_empty() {
            self.push_stage(UNKNOWN_STAGE);
        }

        if let Some(stage) = self.stages.last_mut() {
            stage.tasks.push(Task {
                name: name.into(),
                start: Utc::now(),
            });
        }
    }

    /// Leave the current task, if any.
    pub fn pop_task(&mut self) -> Option<Task> {
        self.stages.last_mut().and_then(|stage| stage.tasks.pop())
    }

    /// Set the outcome.
    pub fn set_result(&mut self, result: bool) {
        self.result = Some(result);
    }

    pub(crate) fn end(&mut self) {
        self.ended = true;
    }

    /// Apply an operation other than [`BuildOp::Result`], which the device handles.
    pub(crate) fn apply(&mut self, op: &BuildOp) {
        match op {
            BuildOp::PushStage(name) => self.push_stage(name),
            BuildOp::PopStage => {
                self.pop_stage();
            }
            BuildOp::PushTask(name) => self.push_task(name),
            BuildOp::PopTask => {
                self.pop_task();
            }
            BuildOp::Result(result) => self.set_result(*result),
        }
    }

    /// The build as shown to clients.
    pub fn snapshot(&self) -> BuildSnapshot {
        let step = |name: &str, start: DateTime<Utc>| Step {
            name: name.into(),
            start,
        };

        BuildSnapshot {
            device: self.device.clone(),
            name: self.name.clone(),
            link: self.link.clone(),
            start: self.start,
            stage: self
                .current_stage()
                .map(|stage| step(&stage.name, stage.start)),
            task: self.current_task().map(|task| step(&task.name, task.start)),
            result: self.result,
            external: self.external,
            ended: self.ended,
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn stages_and_tasks_nest() {
        let mut build = Build::new("bench-1", "smoke-test", None, false);

        build.push_stage("boot");
        build.push_task("flash");
        build.push_task("verify");

        let snapshot = build.snapshot();
        assert_eq!(snapshot.stage.unwrap().name, "boot");
        assert_eq!(snapshot.task.unwrap().name, "verify");

        build.pop_task();
        assert_eq!(build.current_task().unwrap().name, "flash");
        build.pop_stage();
        assert!(build.current_stage().is_none());
        assert!(build.current_task().is_none());
    }

    #[test]
    fn task_without_stage_gets_unknown_stage() {
        let mut build = Build::new("bench-1", "smoke-test", None, false);

        build.push_task("flash");

        assert_eq!(build.current_stage().unwrap().name, UNKNOWN_STAGE);
        assert_eq!(build.current_task().unwrap().name, "flash");
    }

    #[test]
    fn popping_empty_is_fine() {
        let mut build = Build::new("bench-1", "smoke-test", None, false);

        assert!(build.pop_task().is_none());
        assert!(build.pop_stage().is_none());
    }

    #[test]
    fn op_json() {
        let op: BuildOp = serde_json::from_str(r#"{"op":"pushStage","value":"boot"}"#).unwrap();
        assert_eq!(op, BuildOp::PushStage("boot".into()));

        let op: BuildOp = serde_json::from_str(r#"{"op":"popTask"}"#).unwrap();
        assert_eq!(op, BuildOp::PopTask);

        let op: BuildOp = serde_json::from_str(r#"{"op":"result","value":true}"#).unwrap();
        assert_eq!(op, BuildOp::Result(true));
    }
}
