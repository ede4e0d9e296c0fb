//! Autogrouping (spec §4.2, component C2).
//!
//! Fuses groupable child resources into a parent at graph-build time.
//! A resource opts in to either role by overriding
//! [`Resource::as_group_parent`]/[`Resource::as_group_child`]; the
//! algorithm itself is generic over any `Resource` implementor, the
//! same way the engine's lifecycle driver is generic.

use std::collections::HashSet;
use std::sync::Arc;

use super::{Resource, ResourceId};

/// "Will I accept this child?", implemented by a resource that can act
/// as a grouping parent (e.g. a DHCP server accepting host/range
/// children).
pub trait GroupParent: Send + Sync {
    fn group_cmp(&self, candidate: &dyn Resource) -> bool;

    /// Record `child` as absorbed. The parent now drives the child's
    /// `init`/`cleanup`/handler logic; the child no longer schedules
    /// its own `watch`.
    fn absorb(&self, child: Arc<dyn Resource>);
}

/// "The name of my intended parent, or none for any", implemented by a
/// groupable child resource.
pub trait GroupChild: Send + Sync {
    /// Whether this resource is eligible for grouping at all.
    fn groupable(&self) -> bool {
        true
    }

    fn parent_name(&self) -> Option<&str>;
}

/// One grouping decision: either the child was absorbed into a parent,
/// or grouping was refused (ambiguous or no match).
#[derive(Debug)]
pub enum Grouping {
    Absorbed { child: ResourceId, parent: ResourceId },
    Refused { child: ResourceId, reason: String },
}

/// Run the autogrouping algorithm over `resources` in a deterministic
/// order (sorted by `(kind, name)`, spec §4.2 step 1). Returns the
/// decisions made, and the subset of `resources` that were **not**
/// absorbed (still schedule independently).
pub fn autogroup(resources: Vec<Arc<dyn Resource>>) -> (Vec<Grouping>, Vec<Arc<dyn Resource>>) {
    let mut ordered = resources;
    ordered.sort_by_key(|r| r.id());

    let mut decisions = Vec::new();
    let mut absorbed: HashSet<ResourceId> = HashSet::new();

    for child in &ordered {
        let Some(group_child) = child.as_group_child() else {
            continue;
        };

        if !group_child.groupable() {
            continue;
        }

        let wanted = group_child.parent_name();

        let candidates: Vec<&Arc<dyn Resource>> = ordered
            .iter()
            .filter(|p| p.id() != child.id())
            .filter(|p| p.as_group_parent().is_some())
            .filter(|p| p.as_group_parent().unwrap().group_cmp(child.as_ref()))
            .filter(|p| match wanted {
                Some(name) => p.id().name == name,
                None => true,
            })
            .collect();

        match (wanted, candidates.as_slice()) {
            (_, []) => {
                decisions.push(Grouping::Refused {
                    child: child.id(),
                    reason: "no accepting parent found".to_string(),
                });
            }
            (_, [parent]) => {
                parent.as_group_parent().unwrap().absorb(child.clone());
                absorbed.insert(child.id());
                decisions.push(Grouping::Absorbed {
                    child: child.id(),
                    parent: parent.id(),
                });
            }
            (None, _many) => {
                // Spec §4.2 step 2 and §9(c): the child named no
                // parent and several accept it. Undefined upstream;
                // we choose to refuse rather than guess.
                decisions.push(Grouping::Refused {
                    child: child.id(),
                    reason: "ambiguous: multiple parents accept and no server was named"
                        .to_string(),
                });
            }
            (Some(_), _many) => {
                // The child named a parent but more than one resource
                // shares that name — a configuration bug upstream of
                // autogrouping. Refuse rather than pick arbitrarily.
                decisions.push(Grouping::Refused {
                    child: child.id(),
                    reason: "ambiguous: multiple resources share the named parent".to_string(),
                });
            }
        }
    }

    let remaining = ordered
        .into_iter()
        .filter(|r| !absorbed.contains(&r.id()))
        .collect();

    (decisions, remaining)
}
