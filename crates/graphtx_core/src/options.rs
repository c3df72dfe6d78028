//! Transaction options and their inheritance.
//!
//! The recognized option set is closed: every option is a named flag with a
//! default, an inheritable marker, and an explicit inheritance policy carried
//! as a plain function value. A child transaction's merged map is built by
//! seeding it with the caller-supplied explicit values and then running every
//! registered policy, in registration order, against the parent's merged map.

use std::collections::HashMap;

/// The recognized transaction options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OptionKey {
    /// The transaction may not mutate the graph.
    ReadOnly,
    /// Suppress the postcommit notification for this transaction's
    /// contribution.
    Silent,
    /// Skip model validation during commit.
    NoValidation,
    /// Do not retain this transaction's delta for the undo history.
    NoUndo,
    /// Suppress mutation capture entirely.
    ///
    /// Changes made under this option are not recorded and therefore cannot
    /// be rolled back; use only for non-observable bookkeeping.
    NoNotifications,
    /// Let a child transaction suppress the merge of its delta into its
    /// parent, so a wrapped external operation's undo cannot run twice when
    /// non-model transactions nest.
    AllowChangePropagationBlocking,
    /// Marker stamped on a parent once a child actually blocked change
    /// propagation; stops `AllowChangePropagationBlocking` from propagating
    /// further down.
    BlockingApplied,
}

/// An owned set of option values.
///
/// Option maps are never shared between transactions; each transaction owns
/// its merged copy.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OptionMap {
    values: HashMap<OptionKey, bool>,
}

impl OptionMap {
    /// Creates an empty option map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style setter.
    #[must_use]
    pub fn with(mut self, key: OptionKey, value: bool) -> Self {
        self.values.insert(key, value);
        self
    }

    /// Sets an option value.
    pub fn insert(&mut self, key: OptionKey, value: bool) {
        self.values.insert(key, value);
    }

    /// Returns the explicit value for a key, if one is present.
    #[must_use]
    pub fn get(&self, key: OptionKey) -> Option<bool> {
        self.values.get(&key).copied()
    }

    /// Returns true if the option is present and set.
    ///
    /// Absent options read as their default, which is `false` for every
    /// recognized option.
    #[must_use]
    pub fn is_set(&self, key: OptionKey) -> bool {
        self.values.get(&key).copied().unwrap_or(false)
    }

    /// Returns true if no explicit values are present.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// How an option's value propagates from a parent's merged map into a child.
///
/// `force = true` overrides a child's pre-existing explicit value; `force =
/// false` only fills in absent keys.
pub type InheritPolicy = fn(parent: &OptionMap, child: &mut OptionMap, key: OptionKey, force: bool);

/// Describes one recognized option.
pub struct OptionDef {
    /// The option key.
    pub key: OptionKey,
    /// Default value when neither the caller nor inheritance provides one.
    pub default: bool,
    /// Whether the option participates in inheritance at all.
    pub inheritable: bool,
    /// Whether this option's policy overrides explicit child values.
    pub force: bool,
    /// The inheritance policy.
    pub inherit: InheritPolicy,
}

/// Fills the child's value from the parent, honoring `force`.
pub fn inherit_value(parent: &OptionMap, child: &mut OptionMap, key: OptionKey, force: bool) {
    if let Some(value) = parent.get(key) {
        if force || child.get(key).is_none() {
            child.insert(key, value);
        }
    }
}

/// Never propagates anything.
pub fn inherit_nothing(_parent: &OptionMap, _child: &mut OptionMap, _key: OptionKey, _force: bool) {}

/// Like [`inherit_value`], unless the child already carries the
/// more specific [`OptionKey::BlockingApplied`] marker.
pub fn inherit_unless_blocked(parent: &OptionMap, child: &mut OptionMap, key: OptionKey, force: bool) {
    if parent.is_set(OptionKey::BlockingApplied) || child.is_set(OptionKey::BlockingApplied) {
        return;
    }
    inherit_value(parent, child, key, force);
}

/// The ordered table of recognized options.
pub struct OptionRegistry {
    defs: Vec<OptionDef>,
}

impl OptionRegistry {
    /// Returns the standard registry, in fixed registration order.
    #[must_use]
    pub fn standard() -> Self {
        Self {
            defs: vec![
                OptionDef {
                    key: OptionKey::ReadOnly,
                    default: false,
                    inheritable: false,
                    force: false,
                    inherit: inherit_nothing,
                },
                OptionDef {
                    key: OptionKey::Silent,
                    default: false,
                    inheritable: true,
                    force: false,
                    inherit: inherit_value,
                },
                OptionDef {
                    key: OptionKey::NoValidation,
                    default: false,
                    inheritable: true,
                    force: false,
                    inherit: inherit_value,
                },
                OptionDef {
                    key: OptionKey::NoUndo,
                    default: false,
                    inheritable: true,
                    force: false,
                    inherit: inherit_value,
                },
                OptionDef {
                    key: OptionKey::NoNotifications,
                    default: false,
                    inheritable: true,
                    force: false,
                    inherit: inherit_value,
                },
                OptionDef {
                    key: OptionKey::AllowChangePropagationBlocking,
                    default: false,
                    inheritable: true,
                    force: false,
                    inherit: inherit_unless_blocked,
                },
                OptionDef {
                    key: OptionKey::BlockingApplied,
                    default: false,
                    inheritable: false,
                    force: false,
                    inherit: inherit_nothing,
                },
            ],
        }
    }

    /// Creates a registry from an explicit ordered definition list.
    #[must_use]
    pub fn with_defs(defs: Vec<OptionDef>) -> Self {
        Self { defs }
    }

    /// Returns the registered definitions in registration order.
    #[must_use]
    pub fn defs(&self) -> &[OptionDef] {
        &self.defs
    }

    /// Builds a child's merged option map.
    ///
    /// Caller-supplied explicit values seed the map; every registered policy
    /// then runs in registration order against the parent's merged map (when
    /// there is one). Policies with `force` set override explicit values.
    #[must_use]
    pub fn merge(&self, parent: Option<&OptionMap>, explicit: OptionMap) -> OptionMap {
        let mut child = explicit;
        if let Some(parent) = parent {
            for def in &self.defs {
                if def.inheritable {
                    (def.inherit)(parent, &mut child, def.key, def.force);
                }
            }
        }
        child
    }
}

impl std::fmt::Debug for OptionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OptionRegistry")
            .field("len", &self.defs.len())
            .finish_non_exhaustive()
    }
}
