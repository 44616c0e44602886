/// Open map templates resolved against closed pairs
///
/// Precedence of exact maps over templates, specificity between templates,
/// constraint screening, factory decline fall-through and memoization.
/// Run with: cargo test --test template_resolution_tests
use std::sync::Arc;

use dynamap::config::Constraint;
use dynamap::reflect::TypeShape;
use dynamap::{DynValue, MapError, MapKind, MapperBuilder};

#[test]
fn test_exact_map_beats_template() {
    let mapper = MapperBuilder::new()
        .maps(|m| {
            m.new_map::<i32, i32, _>(|n, _| Ok(n.map(|n| n + 1000)))
                .new_template(
                    "clone-any",
                    TypeShape::var(0),
                    TypeShape::var(0),
                    vec![(0, Constraint::Cloneable)],
                    |args| {
                        let info = args.info(0)?.clone();
                        Ok(Arc::new(move |src, _ctx| {
                            if let Some(s) = src.downcast_ref::<String>().ok().flatten() {
                                return Ok(DynValue::new(format!("{s}~t")));
                            }
                            Ok(info.clone_value(src)?)
                        }))
                    },
                )
        })
        .build()
        .unwrap();

    // The closed registration wins over the matching template.
    let bumped: i32 = mapper.map(&1).unwrap();
    assert_eq!(bumped, 1001);

    // A pair only the template covers runs the template.
    let marked: String = mapper.map(&String::from("x")).unwrap();
    assert_eq!(marked, "x~t");
}

#[test]
fn test_more_specific_template_wins() {
    let mapper = MapperBuilder::new()
        .maps(|m| {
            m.new_template(
                "bump-i32",
                TypeShape::atom::<i32>(),
                TypeShape::atom::<i32>(),
                vec![],
                |_args| {
                    Ok(Arc::new(|src, _ctx| {
                        let n = src.downcast_ref::<i32>()?.copied().unwrap_or(0);
                        Ok(DynValue::new(n + 1))
                    }))
                },
            )
            .new_template(
                "clone-any",
                TypeShape::var(0),
                TypeShape::var(0),
                vec![(0, Constraint::Cloneable)],
                |args| {
                    let info = args.info(0)?.clone();
                    Ok(Arc::new(move |src, _ctx| Ok(info.clone_value(src)?)))
                },
            )
        })
        .build()
        .unwrap();

    // Both templates match (i32, i32); the ground one is more specific.
    let bumped: i32 = mapper.map(&7).unwrap();
    assert_eq!(bumped, 8);

    // Pairs outside the ground template still reach the open one.
    let cloned: u64 = mapper.map(&9u64).unwrap();
    assert_eq!(cloned, 9);
}

#[test]
fn test_constraint_screens_candidate_types() {
    #[derive(Clone)]
    struct Opaque;

    let mapper = MapperBuilder::new()
        .types(|t| t.register::<Opaque>(|i| i.cloneable()))
        .maps(|m| {
            m.new_template(
                "name-ordered",
                TypeShape::var(0),
                TypeShape::atom::<String>(),
                vec![(0, Constraint::Ordered)],
                |args| {
                    let name = args.pair.from.name();
                    Ok(Arc::new(move |_src, _ctx| {
                        Ok(DynValue::new(format!("ordered:{name}")))
                    }))
                },
            )
        })
        .build()
        .unwrap();

    // i64 is ordered, so the template applies and outranks the built-in
    // rendering conversion.
    let named: String = mapper.map(&42i64).unwrap();
    assert_eq!(named, "ordered:i64");

    // Opaque carries no ordering ability; the template is not a candidate.
    let err = mapper.map::<Opaque, String>(&Opaque).unwrap_err();
    assert!(err.is_not_found(), "got: {err}");
}

#[test]
fn test_declining_factory_falls_through() {
    let mapper = MapperBuilder::new()
        .maps(|m| {
            m.new_template(
                "only-strings",
                TypeShape::var(0),
                TypeShape::atom::<String>(),
                vec![],
                |args| {
                    if args.pair.from != dynamap::TypeKey::of::<String>() {
                        return Err(MapError::not_found(args.pair, MapKind::New));
                    }
                    Ok(Arc::new(|_src, _ctx| Ok(DynValue::new(String::from("kept")))))
                },
            )
            .new_template(
                "name-any",
                TypeShape::var(0),
                TypeShape::atom::<String>(),
                vec![],
                |args| {
                    let name = args.pair.from.name();
                    Ok(Arc::new(move |_src, _ctx| {
                        Ok(DynValue::new(format!("name:{name}")))
                    }))
                },
            )
        })
        .build()
        .unwrap();

    // The first candidate declines bool and the next one answers.
    let named: String = mapper.map(&true).unwrap();
    assert_eq!(named, "name:bool");
}

#[test]
fn test_template_resolutions_are_memoized() {
    let mapper = MapperBuilder::new()
        .maps(|m| {
            m.new_template(
                "clone-any",
                TypeShape::var(0),
                TypeShape::var(0),
                vec![(0, Constraint::Cloneable)],
                |args| {
                    let info = args.info(0)?.clone();
                    Ok(Arc::new(move |src, _ctx| Ok(info.clone_value(src)?)))
                },
            )
        })
        .build()
        .unwrap();

    let _: String = mapper.map(&String::from("warm")).unwrap();
    let before = mapper.config().cache_stats();

    let _: String = mapper.map(&String::from("again")).unwrap();
    let after = mapper.config().cache_stats();

    assert!(after.hits > before.hits, "{before:?} then {after:?}");
    assert!(after.entries >= 1);
}
