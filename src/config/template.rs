use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::core::error::{MapError, Result};
use crate::core::types::TypePair;
use crate::mapper::strategies::ConversionTable;
use crate::mapper::{DynAsyncMergeFn, DynAsyncNewFn, DynMatchFn, DynMergeFn, DynNewFn};
use crate::reflect::info::{TypeInfo, ability};
use crate::reflect::registry::TypeRegistry;
use crate::reflect::shape::{Bindings, TypeShape};

// ========================================
// Constraints
// ========================================

/// Requirement a template places on one of its variables. A template is a
/// candidate for a pair only when every constraint holds for the bound
/// types.
#[derive(Debug, Clone, PartialEq)]
pub enum Constraint {
    Cloneable,
    Defaultable,
    Copyable,
    Equatable,
    Hashable,
    Ordered,
    /// Usable as an entity key component set.
    KeyLike,
    /// The bound type declares the named ability; argument shapes may refer
    /// to other variables of the same template.
    Implements {
        name: &'static str,
        args: Vec<TypeShape>,
    },
    /// A registered conversion exists from this variable's type into the
    /// referenced variable's type.
    ConvertibleTo(u8),
}

// ========================================
// Template definition
// ========================================

/// What a matched template receives to manufacture its concrete map
/// function: the requested pair, the resolved per-variable type infos and
/// shapes, and the shared registry and conversion table.
pub struct TemplateArgs {
    pub pair: TypePair,
    pub registry: Arc<TypeRegistry>,
    pub conversions: Arc<ConversionTable>,
    infos: BTreeMap<u8, Arc<TypeInfo>>,
    shapes: Bindings,
}

impl TemplateArgs {
    pub fn info(&self, var: u8) -> Result<&Arc<TypeInfo>> {
        self.infos.get(&var).ok_or_else(|| {
            MapError::Configuration(format!("template variable ${var} is not bound"))
        })
    }

    pub fn shape(&self, var: u8) -> Option<&TypeShape> {
        self.shapes.get(var)
    }
}

pub enum TemplateFactory {
    New(Arc<dyn Fn(&TemplateArgs) -> Result<DynNewFn> + Send + Sync>),
    Merge(Arc<dyn Fn(&TemplateArgs) -> Result<DynMergeFn> + Send + Sync>),
    Match(Arc<dyn Fn(&TemplateArgs) -> Result<DynMatchFn> + Send + Sync>),
    AsyncNew(Arc<dyn Fn(&TemplateArgs) -> Result<DynAsyncNewFn> + Send + Sync>),
    AsyncMerge(Arc<dyn Fn(&TemplateArgs) -> Result<DynAsyncMergeFn> + Send + Sync>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TemplateKind {
    New,
    Merge,
    Match,
    AsyncNew,
    AsyncMerge,
}

impl TemplateFactory {
    pub fn kind(&self) -> TemplateKind {
        match self {
            Self::New(_) => TemplateKind::New,
            Self::Merge(_) => TemplateKind::Merge,
            Self::Match(_) => TemplateKind::Match,
            Self::AsyncNew(_) => TemplateKind::AsyncNew,
            Self::AsyncMerge(_) => TemplateKind::AsyncMerge,
        }
    }
}

/// An open map: a pair of shapes with variables, constraints on those
/// variables and a factory that builds the concrete map function once a
/// requested pair matches.
pub struct MapTemplate {
    pub name: String,
    pub from: TypeShape,
    pub to: TypeShape,
    pub constraints: Vec<(u8, Constraint)>,
    pub factory: TemplateFactory,
    pub(crate) index: usize,
}

impl MapTemplate {
    /// Ambiguity order: templates binding fewer distinct variables beat
    /// more generic ones, then fewer variable occurrences, then the larger
    /// shape, then registration order. Total, so resolution is
    /// deterministic.
    pub(crate) fn specificity(&self) -> (usize, usize, Reverse<usize>, usize) {
        let mut vars = BTreeSet::new();
        self.from.collect_vars(&mut vars);
        self.to.collect_vars(&mut vars);
        (
            vars.len(),
            self.from.var_occurrences() + self.to.var_occurrences(),
            Reverse(self.from.node_count() + self.to.node_count()),
            self.index,
        )
    }

    /// Tries to match this template against a requested ground pair,
    /// resolving bindings and checking constraints. `None` when the
    /// template does not apply.
    pub(crate) fn try_match(
        &self,
        pair: TypePair,
        from_shape: &TypeShape,
        to_shape: &TypeShape,
        registry: &Arc<TypeRegistry>,
        conversions: &Arc<ConversionTable>,
    ) -> Option<TemplateArgs> {
        let mut shapes = Bindings::new();
        if !crate::reflect::shape::unify(&self.from, from_shape, &mut shapes) {
            return None;
        }
        if !crate::reflect::shape::unify(&self.to, to_shape, &mut shapes) {
            return None;
        }

        // Every bound variable must name a registered type; templates work
        // through capability vtables, so an unknown type cannot satisfy
        // anything.
        let mut infos = BTreeMap::new();
        for (var, shape) in shapes.iter() {
            let info = registry.by_shape(shape)?;
            infos.insert(var, info.clone());
        }

        for (var, constraint) in &self.constraints {
            let info = infos.get(var)?;
            if !constraint_holds(constraint, info, &infos, &shapes, conversions) {
                return None;
            }
        }

        Some(TemplateArgs {
            pair,
            registry: registry.clone(),
            conversions: conversions.clone(),
            infos,
            shapes,
        })
    }
}

fn constraint_holds(
    constraint: &Constraint,
    info: &Arc<TypeInfo>,
    infos: &BTreeMap<u8, Arc<TypeInfo>>,
    shapes: &Bindings,
    conversions: &Arc<ConversionTable>,
) -> bool {
    match constraint {
        Constraint::Cloneable => info.can_clone(),
        Constraint::Defaultable => info.can_default(),
        Constraint::Copyable => info.is_copyable(),
        Constraint::Equatable => info.can_eq(),
        Constraint::Hashable => info.can_hash(),
        Constraint::Ordered => info.can_ord(),
        Constraint::KeyLike => info.is_key_like(),
        Constraint::Implements { name, args } => {
            let mut ground_args = Vec::with_capacity(args.len());
            for arg in args {
                match arg.substitute(shapes) {
                    Some(s) => ground_args.push(s),
                    None => return false,
                }
            }
            // Built-in one-word abilities also answer their capability
            // checks, so `Implements("Clone")` and `Cloneable` agree.
            if ground_args.is_empty() {
                match *name {
                    n if n == ability::CLONE => return info.can_clone(),
                    n if n == ability::DEFAULT => return info.can_default(),
                    n if n == ability::COPY => return info.is_copyable(),
                    n if n == ability::EQ => return info.can_eq(),
                    n if n == ability::HASH => return info.can_hash(),
                    n if n == ability::ORD => return info.can_ord(),
                    n if n == ability::KEY => return info.is_key_like(),
                    _ => {}
                }
            }
            info.has_ability(name, &ground_args)
        }
        Constraint::ConvertibleTo(other) => match infos.get(other) {
            Some(target) => conversions.can_convert(TypePair::new(info.key(), target.key())),
            None => false,
        },
    }
}
