// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Activity definitions and the cached workflow definition.
//!
//! An [`Activity`] is a stateless definition: everything that varies per run lives on
//! the [`ActivityInstance`](crate::instance::ActivityInstance) and its environment.
//! [`WorkflowDefinition::new`] walks the tree once, assigns every activity (including
//! argument and variable expressions) a stable [`ActivityId`] in pre-order, and
//! computes an identity hash used to reject images persisted for another tree.
//!
//! Continuations are not closures. A child completion, a bookmark resumption or a
//! fault handler is recorded as `(owner instance, callback name)` and dispatched back
//! to the owner's activity through the `on_*` methods below, which is what lets queued
//! work items survive serialization.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::bookmark::Bookmark;
use crate::context::{ActivityContext, FaultContext, TransactionContext};
use crate::error::{ActivityFault, ExecutorError, Result};
use crate::instance::{CompletedInstance, InstanceInfo};

/// Position of an activity in its workflow definition (pre-order index).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActivityId(pub u32);

impl ActivityId {
    /// The root activity of every definition.
    pub const ROOT: ActivityId = ActivityId(0);
}

impl fmt::Display for ActivityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Direction of an argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArgumentDirection {
    /// Value flows into the activity.
    In,
    /// Value flows out of the activity on successful completion.
    Out,
    /// Both.
    InOut,
}

/// Where an argument or variable gets its value from.
#[derive(Debug, Clone)]
pub enum Binding {
    /// No value; the location starts as `null`.
    Unbound,
    /// A constant.
    Literal(Value),
    /// A variable or argument visible from the parent's environment.
    Variable(String),
    /// An expression activity whose result becomes the value.
    Expression(Arc<dyn Activity>),
}

/// Declared argument of an activity.
#[derive(Debug, Clone)]
pub struct ArgumentSpec {
    /// Argument name, unique per activity.
    pub name: String,
    /// Direction.
    pub direction: ArgumentDirection,
    /// Value source (for `In`/`InOut`) or copy-out target (`Variable` for `Out`/`InOut`).
    pub binding: Binding,
}

impl ArgumentSpec {
    /// An `In` argument.
    pub fn input(name: impl Into<String>, binding: Binding) -> Self {
        Self {
            name: name.into(),
            direction: ArgumentDirection::In,
            binding,
        }
    }

    /// An `Out` argument, copied into `target` in the parent's scope when the activity closes.
    pub fn output_to(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            direction: ArgumentDirection::Out,
            binding: Binding::Variable(target.into()),
        }
    }

    /// An unbound `Out` argument. On the root activity it becomes a workflow output.
    pub fn output(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            direction: ArgumentDirection::Out,
            binding: Binding::Unbound,
        }
    }

    /// An `InOut` argument aliasing `variable` in the parent's scope.
    pub fn in_out(name: impl Into<String>, variable: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            direction: ArgumentDirection::InOut,
            binding: Binding::Variable(variable.into()),
        }
    }
}

/// Declared variable of an activity, visible to the activity and its descendants.
#[derive(Debug, Clone)]
pub struct VariableSpec {
    /// Variable name, unique per activity.
    pub name: String,
    /// Initial value.
    pub default: Binding,
}

impl VariableSpec {
    /// A variable with a constant default.
    pub fn new(name: impl Into<String>, default: Value) -> Self {
        Self {
            name: name.into(),
            default: Binding::Literal(default),
        }
    }

    /// A variable initialized by an expression activity.
    pub fn computed(name: impl Into<String>, expression: Arc<dyn Activity>) -> Self {
        Self {
            name: name.into(),
            default: Binding::Expression(expression),
        }
    }
}

/// Name used when an activity receives a callback it does not know.
pub fn unknown_callback(activity: &str, callback: &str) -> ActivityFault {
    ActivityFault::invalid_operation(format!(
        "activity '{}' has no callback named '{}'",
        activity, callback
    ))
}

/// A unit of executable behavior.
///
/// Only [`execute`](Activity::execute) and [`display_name`](Activity::display_name) are
/// required. Callback methods receive the name that was registered when the
/// continuation was created.
pub trait Activity: Send + Sync + fmt::Debug {
    /// Name used in tracking records and logs.
    fn display_name(&self) -> &str;

    /// Child activities that this activity may schedule, in declaration order.
    fn children(&self) -> Vec<Arc<dyn Activity>> {
        Vec::new()
    }

    /// Declared arguments.
    fn arguments(&self) -> Vec<ArgumentSpec> {
        Vec::new()
    }

    /// Declared variables.
    fn variables(&self) -> Vec<VariableSpec> {
        Vec::new()
    }

    /// Run the activity body.
    fn execute(&self, ctx: &mut ActivityContext<'_>) -> std::result::Result<(), ActivityFault>;

    /// Handle a cancellation request. The default cancels children and lets the
    /// executor close out outstanding bookmarks.
    fn cancel(&self, ctx: &mut ActivityContext<'_>) -> std::result::Result<(), ActivityFault> {
        ctx.default_cancel();
        Ok(())
    }

    /// Called while the instance is being torn down by an abort. Must not fail.
    fn abort(&self, _instance: &InstanceInfo, _reason: &ActivityFault) {}

    /// A bookmark created by this instance was resumed.
    fn on_bookmark_resumed(
        &self,
        _ctx: &mut ActivityContext<'_>,
        callback: &str,
        _bookmark: &Bookmark,
        _value: Value,
    ) -> std::result::Result<(), ActivityFault> {
        Err(unknown_callback(self.display_name(), callback))
    }

    /// A child scheduled with a completion callback finished.
    fn on_child_completed(
        &self,
        _ctx: &mut ActivityContext<'_>,
        callback: &str,
        _child: &CompletedInstance,
    ) -> std::result::Result<(), ActivityFault> {
        Err(unknown_callback(self.display_name(), callback))
    }

    /// A fault propagated out of a child scheduled with a fault callback.
    /// Call [`FaultContext::handle`] to stop propagation.
    fn on_child_faulted(
        &self,
        _ctx: &mut ActivityContext<'_>,
        callback: &str,
        _fault: &mut FaultContext,
    ) -> std::result::Result<(), ActivityFault> {
        Err(unknown_callback(self.display_name(), callback))
    }

    /// A requested transaction context was granted.
    fn on_transaction_context(
        &self,
        _ctx: &mut ActivityContext<'_>,
        callback: &str,
        _transaction: &mut TransactionContext,
    ) -> std::result::Result<(), ActivityFault> {
        Err(unknown_callback(self.display_name(), callback))
    }

    /// An async operation started by this instance completed.
    fn on_operation_completed(
        &self,
        _ctx: &mut ActivityContext<'_>,
        callback: &str,
        _value: Value,
    ) -> std::result::Result<(), ActivityFault> {
        Err(unknown_callback(self.display_name(), callback))
    }
}

#[derive(Debug, Clone)]
pub(crate) enum ResolvedBinding {
    Unbound,
    Literal(Value),
    Variable(String),
    Expression(ActivityId),
}

#[derive(Debug, Clone)]
pub(crate) struct ResolvedArgument {
    pub name: String,
    pub direction: ArgumentDirection,
    pub binding: ResolvedBinding,
}

#[derive(Debug, Clone)]
pub(crate) struct ResolvedVariable {
    pub name: String,
    pub default: ResolvedBinding,
}

/// Cached metadata for one activity of a definition.
#[derive(Debug)]
pub struct ActivityNode {
    activity: Arc<dyn Activity>,
    parent: Option<ActivityId>,
    children: Vec<ActivityId>,
    pub(crate) arguments: Vec<ResolvedArgument>,
    pub(crate) variables: Vec<ResolvedVariable>,
}

impl ActivityNode {
    /// The activity.
    pub fn activity(&self) -> &Arc<dyn Activity> {
        &self.activity
    }

    /// Parent in the definition tree.
    pub fn parent(&self) -> Option<ActivityId> {
        self.parent
    }

    /// Children in declaration order (expressions excluded).
    pub fn children(&self) -> &[ActivityId] {
        &self.children
    }

    /// Whether instances need their own environment.
    pub fn declares_symbols(&self) -> bool {
        !self.arguments.is_empty() || !self.variables.is_empty()
    }
}

/// A workflow program: an activity tree with cached metadata.
#[derive(Debug)]
pub struct WorkflowDefinition {
    nodes: Vec<ActivityNode>,
    identity: String,
}

impl WorkflowDefinition {
    /// Cache metadata for the tree rooted at `root`.
    pub fn new(root: Arc<dyn Activity>) -> Result<Self> {
        let mut nodes = Vec::new();
        register(&mut nodes, root, None)?;

        let mut hasher = Sha256::new();
        for (index, node) in nodes.iter().enumerate() {
            hasher.update(format!(
                "{}|{:?}|{}|",
                index,
                node.parent.map(|p| p.0),
                node.activity.display_name()
            ));
            for argument in &node.arguments {
                hasher.update(format!("a:{}:{:?};", argument.name, argument.direction));
            }
            for variable in &node.variables {
                hasher.update(format!("v:{};", variable.name));
            }
            hasher.update("\n");
        }
        let identity = format!("{:x}", hasher.finalize());

        Ok(Self { nodes, identity })
    }

    /// Id of the root activity.
    pub fn root(&self) -> ActivityId {
        ActivityId::ROOT
    }

    /// SHA-256 identity of the tree shape.
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Number of activities, expressions included.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the definition is empty (never true for a built definition).
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Metadata for `id`.
    pub fn node(&self, id: ActivityId) -> Result<&ActivityNode> {
        self.nodes
            .get(id.0 as usize)
            .ok_or(ExecutorError::ActivityNotFound { activity: id })
    }

    /// The activity for `id`.
    pub fn activity(&self, id: ActivityId) -> Result<&Arc<dyn Activity>> {
        self.node(id).map(|node| &node.activity)
    }
}

fn register(
    nodes: &mut Vec<ActivityNode>,
    activity: Arc<dyn Activity>,
    parent: Option<ActivityId>,
) -> Result<ActivityId> {
    let id = ActivityId(
        u32::try_from(nodes.len())
            .map_err(|_| ExecutorError::InvalidDefinition("too many activities".to_string()))?,
    );
    let arguments = activity.arguments();
    let variables = activity.variables();
    let children = activity.children();

    let mut names = HashSet::new();
    for name in arguments
        .iter()
        .map(|a| a.name.as_str())
        .chain(variables.iter().map(|v| v.name.as_str()))
    {
        if !names.insert(name) {
            return Err(ExecutorError::InvalidDefinition(format!(
                "activity '{}' declares '{}' more than once",
                activity.display_name(),
                name
            )));
        }
    }

    nodes.push(ActivityNode {
        activity: Arc::clone(&activity),
        parent,
        children: Vec::new(),
        arguments: Vec::new(),
        variables: Vec::new(),
    });

    let mut resolved_arguments = Vec::with_capacity(arguments.len());
    for argument in arguments {
        if argument.direction == ArgumentDirection::Out
            && matches!(argument.binding, Binding::Expression(_) | Binding::Literal(_))
        {
            return Err(ExecutorError::InvalidDefinition(format!(
                "out argument '{}' of '{}' can only bind to a variable",
                argument.name,
                activity.display_name()
            )));
        }
        let binding = resolve_binding(nodes, argument.binding, id)?;
        resolved_arguments.push(ResolvedArgument {
            name: argument.name,
            direction: argument.direction,
            binding,
        });
    }

    let mut resolved_variables = Vec::with_capacity(variables.len());
    for variable in variables {
        let default = resolve_binding(nodes, variable.default, id)?;
        resolved_variables.push(ResolvedVariable {
            name: variable.name,
            default,
        });
    }

    let mut child_ids = Vec::with_capacity(children.len());
    for child in children {
        child_ids.push(register(nodes, child, Some(id))?);
    }

    let node = &mut nodes[id.0 as usize];
    node.arguments = resolved_arguments;
    node.variables = resolved_variables;
    node.children = child_ids;
    Ok(id)
}

fn resolve_binding(
    nodes: &mut Vec<ActivityNode>,
    binding: Binding,
    owner: ActivityId,
) -> Result<ResolvedBinding> {
    Ok(match binding {
        Binding::Unbound => ResolvedBinding::Unbound,
        Binding::Literal(value) => ResolvedBinding::Literal(value),
        Binding::Variable(name) => ResolvedBinding::Variable(name),
        Binding::Expression(expression) => {
            ResolvedBinding::Expression(register(nodes, expression, Some(owner))?)
        }
    })
}
