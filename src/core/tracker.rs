//! # Task Tracker
//!
//! A hierarchical record of every operation performed during one invocation. Nodes live in
//! an arena owned by a single mutex; a [`Task`] is a cheap, clonable handle (tree + index).
//! Ownership flows strictly from the root down through child index lists, and the parent
//! index is only used to compute a node's lineage.
//!
//! Every state change or output line anywhere in the tree invokes the registered
//! [`TaskHandler`] synchronously, on the caller's thread, after the tree lock is released.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

/// The state of a single task node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskState {
    Pending,
    InProgress,
    Success,
    Failed,
    Warning,
}

impl TaskState {
    /// True for `Success`, `Failed` and `Warning`.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Warning)
    }

    fn rank(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::InProgress => 1,
            Self::Success | Self::Failed | Self::Warning => 2,
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Pending => "Pending",
            Self::InProgress => "In Progress",
            Self::Success => "OK",
            Self::Failed => "Failed",
            Self::Warning => "Warning",
        };
        f.write_str(label)
    }
}

/// An owned, point-in-time copy of a task subtree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskSnapshot {
    pub name: String,
    pub state: TaskState,
    pub output: Vec<String>,
    pub children: Vec<TaskSnapshot>,
}

impl TaskSnapshot {
    /// Depth-first search for a node by its path below this one.
    pub fn find(&self, path: &[&str]) -> Option<&Self> {
        match path.split_first() {
            None => Some(self),
            Some((head, rest)) => self
                .children
                .iter()
                .find(|c| c.name == *head)
                .and_then(|c| c.find(rest)),
        }
    }

    /// Counts nodes (this one included) in the given state.
    pub fn count_in_state(&self, state: TaskState) -> usize {
        let own = usize::from(self.state == state);
        own + self
            .children
            .iter()
            .map(|c| c.count_in_state(state))
            .sum::<usize>()
    }
}

/// What the handler receives on every change.
#[derive(Debug)]
pub struct TaskUpdate {
    /// The node that changed.
    pub task: Task,
    /// A snapshot of the whole tree taken right after the change.
    pub root: TaskSnapshot,
}

/// The single integration point with presentation. It runs on the producer's thread, so it
/// must not block for long.
pub type TaskHandler = Arc<dyn Fn(&TaskUpdate) + Send + Sync>;

#[derive(Debug)]
struct Node {
    name: String,
    state: TaskState,
    output: Vec<String>,
    children: Vec<usize>,
    parent: Option<usize>,
}

impl Node {
    fn new(name: String, parent: Option<usize>) -> Self {
        Self {
            name,
            state: TaskState::Pending,
            output: Vec::new(),
            children: Vec::new(),
            parent,
        }
    }
}

#[derive(Debug, Default)]
struct TaskTree {
    nodes: Vec<Node>,
}

impl TaskTree {
    fn node(&self, id: usize) -> Option<&Node> {
        self.nodes.get(id)
    }

    fn node_mut(&mut self, id: usize) -> Option<&mut Node> {
        self.nodes.get_mut(id)
    }

    fn snapshot(&self, id: usize) -> Option<TaskSnapshot> {
        let node = self.node(id)?;
        Some(TaskSnapshot {
            name: node.name.clone(),
            state: node.state,
            output: node.output.clone(),
            children: node
                .children
                .iter()
                .filter_map(|&child| self.snapshot(child))
                .collect(),
        })
    }
}

struct Shared {
    tree: Mutex<TaskTree>,
    handler: Option<TaskHandler>,
}

/// A handle to one node of a task tree.
#[derive(Clone)]
pub struct Task {
    shared: Arc<Shared>,
    id: usize,
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("lineage", &self.lineage())
            .finish()
    }
}

impl Task {
    /// Creates the root of a new tree. `handler` is called on every change in the tree.
    pub fn new_root(name: impl Into<String>, handler: Option<TaskHandler>) -> Self {
        let tree = TaskTree {
            nodes: vec![Node::new(name.into(), None)],
        };
        Self {
            shared: Arc::new(Shared {
                tree: Mutex::new(tree),
                handler,
            }),
            id: 0,
        }
    }

    fn lock(&self) -> MutexGuard<'_, TaskTree> {
        // A poisoned tree is still structurally valid; keep reporting into it.
        self.shared
            .tree
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Returns the child with this name, creating it if absent. Repeated calls with the
    /// same name address the same node.
    pub fn child(&self, name: &str) -> Self {
        let mut tree = self.lock();
        let existing = tree.node(self.id).and_then(|node| {
            node.children
                .iter()
                .copied()
                .find(|&c| tree.node(c).is_some_and(|n| n.name == name))
        });
        let id = match existing {
            Some(id) => id,
            None => {
                let id = tree.nodes.len();
                tree.nodes.push(Node::new(name.to_string(), Some(self.id)));
                if let Some(parent) = tree.node_mut(self.id) {
                    parent.children.push(id);
                }
                id
            }
        };
        Self {
            shared: Arc::clone(&self.shared),
            id,
        }
    }

    /// Moves this node to `state` and appends `output`.
    ///
    /// States only move forward: Pending, then InProgress, then one terminal state. A
    /// backwards or repeated terminal transition is ignored (the output is still kept).
    pub fn set_state<I, S>(&self, state: TaskState, output: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        {
            let mut tree = self.lock();
            let Some(node) = tree.node_mut(self.id) else {
                return;
            };
            if state.rank() > node.state.rank() {
                node.state = state;
            } else if state != node.state {
                log::warn!(
                    "Ignoring task transition {:?} -> {:?} for '{}'.",
                    node.state,
                    state,
                    node.name
                );
            }
            node.output.extend(output.into_iter().map(Into::into));
        }
        self.notify();
    }

    /// Shorthand for a state change without output.
    pub fn set(&self, state: TaskState) {
        self.set_state(state, std::iter::empty::<String>());
    }

    /// Appends a line without changing state.
    pub fn add_output(&self, line: impl Into<String>) {
        {
            let mut tree = self.lock();
            if let Some(node) = tree.node_mut(self.id) {
                node.output.push(line.into());
            }
        }
        self.notify();
    }

    pub fn name(&self) -> String {
        self.lock()
            .node(self.id)
            .map(|n| n.name.clone())
            .unwrap_or_default()
    }

    pub fn state(&self) -> TaskState {
        self.lock()
            .node(self.id)
            .map_or(TaskState::Pending, |n| n.state)
    }

    pub fn output(&self) -> Vec<String> {
        self.lock()
            .node(self.id)
            .map(|n| n.output.clone())
            .unwrap_or_default()
    }

    /// Handles to the direct children, in creation order.
    pub fn children(&self) -> Vec<Self> {
        let tree = self.lock();
        tree.node(self.id)
            .map(|n| n.children.clone())
            .unwrap_or_default()
            .into_iter()
            .map(|id| Self {
                shared: Arc::clone(&self.shared),
                id,
            })
            .collect()
    }

    /// Names from the root down to this node.
    pub fn lineage(&self) -> Vec<String> {
        let tree = self.lock();
        let mut names = Vec::new();
        let mut current = Some(self.id);
        while let Some(id) = current {
            let Some(node) = tree.node(id) else { break };
            names.push(node.name.clone());
            current = node.parent;
        }
        names.reverse();
        names
    }

    /// A stable display key for this node (`root/child/grandchild`).
    pub fn lineage_key(&self) -> String {
        self.lineage().join("/")
    }

    /// Snapshot of this node's subtree.
    pub fn snapshot(&self) -> TaskSnapshot {
        self.lock().snapshot(self.id).unwrap_or(TaskSnapshot {
            name: String::new(),
            state: TaskState::Pending,
            output: Vec::new(),
            children: Vec::new(),
        })
    }

    /// Snapshot of the whole tree this node belongs to.
    pub fn root_snapshot(&self) -> TaskSnapshot {
        Self {
            shared: Arc::clone(&self.shared),
            id: 0,
        }
        .snapshot()
    }

    fn notify(&self) {
        if let Some(handler) = &self.shared.handler {
            let update = TaskUpdate {
                task: self.clone(),
                root: self.root_snapshot(),
            };
            handler(&update);
        }
    }
}
