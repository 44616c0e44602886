use std::any::Any;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::core::types::TypeKey;

// ========================================
// Type shapes
// ========================================

/// Structural description of a type, used to match open map templates
/// against closed requested pairs. `Atom` is a leaf type, `Ctor` a named
/// constructor applied to argument shapes, `Var` a template placeholder.
///
/// Matching is purely syntactic: `Vec<$0>` matches `Vec<i32>` because the
/// constructor names line up, never because of any subtype relation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TypeShape {
    Atom(TypeKey),
    Ctor {
        name: &'static str,
        args: Vec<TypeShape>,
    },
    Var(u8),
}

pub mod ctor {
    //! Constructor names used by the built-in registrations.

    pub const VEC: &str = "Vec";
    pub const VEC_DEQUE: &str = "VecDeque";
    pub const HASH_SET: &str = "HashSet";
    pub const BTREE_SET: &str = "BTreeSet";
    pub const HASH_MAP: &str = "HashMap";
    pub const BTREE_MAP: &str = "BTreeMap";
    pub const BOXED_SLICE: &str = "boxed_slice";
    pub const SHARED_SLICE: &str = "shared_slice";
    pub const OPTION: &str = "Option";
    pub const TUPLE2: &str = "tuple2";
    pub const TUPLE3: &str = "tuple3";
}

impl TypeShape {
    pub fn atom<T: Any>() -> Self {
        Self::Atom(TypeKey::of::<T>())
    }

    pub fn atom_key(key: TypeKey) -> Self {
        Self::Atom(key)
    }

    pub fn ctor(name: &'static str, args: Vec<TypeShape>) -> Self {
        Self::Ctor { name, args }
    }

    pub fn var(index: u8) -> Self {
        Self::Var(index)
    }

    pub fn vec_of(elem: TypeShape) -> Self {
        Self::ctor(ctor::VEC, vec![elem])
    }

    pub fn deque_of(elem: TypeShape) -> Self {
        Self::ctor(ctor::VEC_DEQUE, vec![elem])
    }

    pub fn hash_set_of(elem: TypeShape) -> Self {
        Self::ctor(ctor::HASH_SET, vec![elem])
    }

    pub fn btree_set_of(elem: TypeShape) -> Self {
        Self::ctor(ctor::BTREE_SET, vec![elem])
    }

    pub fn hash_map_of(key: TypeShape, value: TypeShape) -> Self {
        Self::ctor(ctor::HASH_MAP, vec![key, value])
    }

    pub fn btree_map_of(key: TypeShape, value: TypeShape) -> Self {
        Self::ctor(ctor::BTREE_MAP, vec![key, value])
    }

    pub fn option_of(inner: TypeShape) -> Self {
        Self::ctor(ctor::OPTION, vec![inner])
    }

    pub fn tuple2(a: TypeShape, b: TypeShape) -> Self {
        Self::ctor(ctor::TUPLE2, vec![a, b])
    }

    pub fn tuple3(a: TypeShape, b: TypeShape, c: TypeShape) -> Self {
        Self::ctor(ctor::TUPLE3, vec![a, b, c])
    }

    /// A shape with no variables describes exactly one closed type.
    pub fn is_ground(&self) -> bool {
        match self {
            Self::Atom(_) => true,
            Self::Var(_) => false,
            Self::Ctor { args, .. } => args.iter().all(TypeShape::is_ground),
        }
    }

    pub fn collect_vars(&self, out: &mut BTreeSet<u8>) {
        match self {
            Self::Atom(_) => {}
            Self::Var(v) => {
                out.insert(*v);
            }
            Self::Ctor { args, .. } => {
                for a in args {
                    a.collect_vars(out);
                }
            }
        }
    }

    pub fn var_occurrences(&self) -> usize {
        match self {
            Self::Atom(_) => 0,
            Self::Var(_) => 1,
            Self::Ctor { args, .. } => args.iter().map(TypeShape::var_occurrences).sum(),
        }
    }

    pub fn node_count(&self) -> usize {
        match self {
            Self::Atom(_) | Self::Var(_) => 1,
            Self::Ctor { args, .. } => 1 + args.iter().map(TypeShape::node_count).sum::<usize>(),
        }
    }

    /// Replaces every variable with its binding. `None` if a variable is
    /// unbound.
    pub fn substitute(&self, bindings: &Bindings) -> Option<TypeShape> {
        match self {
            Self::Atom(_) => Some(self.clone()),
            Self::Var(v) => bindings.get(*v).cloned(),
            Self::Ctor { name, args } => {
                let mut out = Vec::with_capacity(args.len());
                for a in args {
                    out.push(a.substitute(bindings)?);
                }
                Some(Self::Ctor { name, args: out })
            }
        }
    }
}

impl fmt::Display for TypeShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Atom(key) => f.write_str(key.short_name()),
            Self::Var(v) => write!(f, "${}", v),
            Self::Ctor { name, args } if *name == ctor::TUPLE2 || *name == ctor::TUPLE3 => {
                f.write_str("(")?;
                for (i, a) in args.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", a)?;
                }
                f.write_str(")")
            }
            Self::Ctor { name, args } => {
                write!(f, "{}<", name)?;
                for (i, a) in args.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", a)?;
                }
                f.write_str(">")
            }
        }
    }
}

// ========================================
// Bindings and unification
// ========================================

/// Variable assignments accumulated while matching one template against one
/// requested pair. Bound shapes are always ground.
#[derive(Debug, Clone, Default)]
pub struct Bindings(BTreeMap<u8, TypeShape>);

impl Bindings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, var: u8) -> Option<&TypeShape> {
        self.0.get(&var)
    }

    pub fn iter(&self) -> impl Iterator<Item = (u8, &TypeShape)> {
        self.0.iter().map(|(k, v)| (*k, v))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn bind(&mut self, var: u8, shape: &TypeShape) -> bool {
        match self.0.get(&var) {
            Some(existing) => existing == shape,
            None => {
                self.0.insert(var, shape.clone());
                true
            }
        }
    }
}

/// Matches a template shape against a ground shape, accumulating variable
/// bindings. The same variable appearing twice must bind to the same ground
/// shape, which is what lets one template tie its source and destination
/// sides together.
pub fn unify(pattern: &TypeShape, ground: &TypeShape, bindings: &mut Bindings) -> bool {
    match (pattern, ground) {
        (TypeShape::Var(v), g) => g.is_ground() && bindings.bind(*v, g),
        (TypeShape::Atom(a), TypeShape::Atom(b)) => a == b,
        (
            TypeShape::Ctor { name: pn, args: pa },
            TypeShape::Ctor { name: gn, args: ga },
        ) => pn == gn && pa.len() == ga.len() && pa.iter().zip(ga).all(|(p, g)| unify(p, g, bindings)),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn i32_shape() -> TypeShape {
        TypeShape::atom::<i32>()
    }

    fn string_shape() -> TypeShape {
        TypeShape::atom::<String>()
    }

    #[test]
    fn unifies_ctor_with_var() {
        let pattern = TypeShape::vec_of(TypeShape::var(0));
        let ground = TypeShape::vec_of(i32_shape());
        let mut b = Bindings::new();
        assert!(unify(&pattern, &ground, &mut b));
        assert_eq!(b.get(0), Some(&i32_shape()));
    }

    #[test]
    fn repeated_var_must_bind_consistently() {
        let pattern = TypeShape::tuple2(TypeShape::var(0), TypeShape::var(0));
        let mut b = Bindings::new();
        assert!(unify(
            &pattern,
            &TypeShape::tuple2(i32_shape(), i32_shape()),
            &mut b
        ));

        let mut b = Bindings::new();
        assert!(!unify(
            &pattern,
            &TypeShape::tuple2(i32_shape(), string_shape()),
            &mut b
        ));
    }

    #[test]
    fn ctor_names_are_not_interchangeable() {
        let pattern = TypeShape::vec_of(TypeShape::var(0));
        let ground = TypeShape::hash_set_of(i32_shape());
        let mut b = Bindings::new();
        assert!(!unify(&pattern, &ground, &mut b));
    }

    #[test]
    fn nested_binding_is_structural() {
        // Vec<$0> against Vec<Vec<i32>> binds $0 to the whole inner shape.
        let pattern = TypeShape::vec_of(TypeShape::var(0));
        let ground = TypeShape::vec_of(TypeShape::vec_of(i32_shape()));
        let mut b = Bindings::new();
        assert!(unify(&pattern, &ground, &mut b));
        assert_eq!(b.get(0), Some(&TypeShape::vec_of(i32_shape())));
    }

    #[test]
    fn substitute_rebuilds_ground_shape() {
        let pattern = TypeShape::hash_map_of(TypeShape::var(0), TypeShape::var(1));
        let ground = TypeShape::hash_map_of(i32_shape(), string_shape());
        let mut b = Bindings::new();
        assert!(unify(&pattern, &ground, &mut b));
        assert_eq!(pattern.substitute(&b), Some(ground));
    }

    #[test]
    fn display_renders_tuples_and_ctors() {
        let shape = TypeShape::hash_map_of(
            i32_shape(),
            TypeShape::tuple2(string_shape(), TypeShape::var(1)),
        );
        assert_eq!(shape.to_string(), "HashMap<i32, (String, $1)>");
    }
}
