//! Activation behavior for checkable inputs
//!
//! A click on a checkbox or radio button flips its checkedness before any
//! listener runs. If a listener cancels the click the change is undone;
//! otherwise `input` and then `change` fire at the element.

use super::tree::{NodeArena, NodeId};
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationKind {
    Checkbox,
    Radio,
}

impl ActivationKind {
    pub fn of(tree: &NodeArena, node: NodeId) -> Option<Self> {
        match tree.input_type(node)?.as_str() {
            "checkbox" => Some(ActivationKind::Checkbox),
            "radio" => Some(ActivationKind::Radio),
            _ => None,
        }
    }
}

/// What pre-activation changed, so it can be undone
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivationState {
    pub target: NodeId,
    pub kind: ActivationKind,
    pub was_checked: bool,
    /// Radio that was checked in the group before the click
    pub previously_checked: Option<NodeId>,
}

/// Legacy pre-activation: toggle a checkbox, or check a radio and uncheck
/// the rest of its group
pub fn pre_activate(tree: &mut NodeArena, node: NodeId) -> Result<Option<ActivationState>> {
    let Some(kind) = ActivationKind::of(tree, node) else {
        return Ok(None);
    };
    let was_checked = tree.checked(node);
    let mut state = ActivationState {
        target: node,
        kind,
        was_checked,
        previously_checked: None,
    };
    match kind {
        ActivationKind::Checkbox => tree.set_checked(node, !was_checked)?,
        ActivationKind::Radio => {
            for other in tree.radio_group(node) {
                if tree.checked(other) {
                    state.previously_checked = Some(other);
                    tree.set_checked(other, false)?;
                }
            }
            tree.set_checked(node, true)?;
        }
    }
    Ok(Some(state))
}

/// Legacy canceled-activation: restore what `pre_activate` changed
pub fn cancel_activation(tree: &mut NodeArena, state: &ActivationState) -> Result<()> {
    tree.set_checked(state.target, state.was_checked)?;
    if let Some(previous) = state.previously_checked {
        tree.set_checked(previous, true)?;
    }
    Ok(())
}

/// Events fired by the activation behavior, in order
pub fn post_activation_events(state: &ActivationState) -> &'static [&'static str] {
    match state.kind {
        ActivationKind::Checkbox => &["input", "change"],
        ActivationKind::Radio if !state.was_checked => &["input", "change"],
        ActivationKind::Radio => &[],
    }
}
