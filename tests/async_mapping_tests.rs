/// Async mapping, cancellation and bounded parallelism
///
/// Async calls cover sync registrations, cancellation propagates unwrapped
/// and collection fan-out respects the parallelism width.
/// Run with: cargo test --test async_mapping_tests
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use dynamap::{MapError, MapperBuilder};
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn test_async_map_covers_sync_registrations() {
    let mapper = MapperBuilder::new()
        .maps(|m| m.new_map::<i32, String, _>(|n, _| Ok(n.map(|n| format!("#{n}")))))
        .build()
        .unwrap();

    let out = mapper.map_async::<i32, String>(Some(&7)).await.unwrap();
    assert_eq!(out.as_deref(), Some("#7"));
}

#[tokio::test]
async fn test_registered_async_map() {
    let mapper = MapperBuilder::new()
        .maps(|m| {
            m.async_new_map::<i32, String, _, _>(|n, _ctx| async move {
                tokio::time::sleep(Duration::from_millis(1)).await;
                Ok(n.map(|n| format!("async#{n}")))
            })
        })
        .build()
        .unwrap();

    let out = mapper.map_async::<i32, String>(Some(&3)).await.unwrap();
    assert_eq!(out.as_deref(), Some("async#3"));
}

#[tokio::test]
async fn test_async_registration_beats_sync_for_same_pair() {
    let mapper = MapperBuilder::new()
        .maps(|m| {
            m.new_map::<i32, String, _>(|n, _| Ok(n.map(|n| format!("sync#{n}"))))
                .async_new_map::<i32, String, _, _>(|n, _ctx| async move {
                    Ok(n.map(|n| format!("async#{n}")))
                })
        })
        .build()
        .unwrap();

    // The async call prefers the native async registration.
    let out = mapper.map_async::<i32, String>(Some(&1)).await.unwrap();
    assert_eq!(out.as_deref(), Some("async#1"));

    // The sync call only sees the sync one.
    let out: String = mapper.map(&1).unwrap();
    assert_eq!(out, "sync#1");
}

#[tokio::test]
async fn test_registered_async_merge() {
    let mapper = MapperBuilder::new()
        .maps(|m| {
            m.async_merge_map::<i32, Vec<i32>, _, _>(|n, d, _ctx| async move {
                let mut d = d.unwrap_or_default();
                if let Some(n) = n {
                    d.push(n);
                }
                Ok(Some(d))
            })
        })
        .build()
        .unwrap();

    let mut dest = Some(vec![1]);
    mapper
        .merge_async::<i32, Vec<i32>>(Some(&2), &mut dest)
        .await
        .unwrap();
    assert_eq!(dest, Some(vec![1, 2]));
}

#[tokio::test]
async fn test_async_merge_covers_sync_registration() {
    let mapper = MapperBuilder::new()
        .maps(|m| {
            m.merge_map::<i32, String, _>(|n, d, _| {
                Ok(match (n, d) {
                    (Some(n), Some(mut d)) => {
                        d.push_str(&format!("+{n}"));
                        Some(d)
                    }
                    (Some(n), None) => Some(n.to_string()),
                    (None, d) => d,
                })
            })
        })
        .build()
        .unwrap();

    let mut dest = Some(String::from("base"));
    mapper
        .merge_async::<i32, String>(Some(&5), &mut dest)
        .await
        .unwrap();
    assert_eq!(dest.as_deref(), Some("base+5"));
}

#[tokio::test]
async fn test_pre_cancelled_token_stops_the_call() {
    let mapper = MapperBuilder::new()
        .maps(|m| m.new_map::<i32, String, _>(|n, _| Ok(n.map(|n| n.to_string()))))
        .build()
        .unwrap();

    let token = CancellationToken::new();
    token.cancel();

    let err = mapper
        .map_async_with_token::<i32, String>(Some(&1), token)
        .await
        .unwrap_err();
    assert!(err.is_cancelled(), "got: {err}");
}

#[tokio::test]
async fn test_cancellation_observed_between_elements() {
    let seen = Arc::new(AtomicUsize::new(0));

    let mapper = MapperBuilder::new()
        .types(|t| {
            t.collection::<Vec<i32>>(|e| e.cloneable())
                .collection::<Vec<String>>(|e| e.cloneable())
        })
        .service(seen.clone())
        .maps(|m| {
            m.async_new_map::<i32, String, _, _>(|n, ctx| {
                let seen = ctx.service::<AtomicUsize>();
                if n == Some(2) {
                    ctx.cancellation().cancel();
                }
                async move {
                    if let Some(seen) = seen {
                        seen.fetch_add(1, Ordering::Relaxed);
                    }
                    Ok(n.map(|n| n.to_string()))
                }
            })
        })
        .build()
        .unwrap();

    let err = mapper
        .map_async::<Vec<i32>, Vec<String>>(Some(&vec![1, 2, 3, 4]))
        .await
        .unwrap_err();
    assert!(err.is_cancelled(), "got: {err}");

    // Elements after the cancellation point never ran.
    assert_eq!(seen.load(Ordering::Relaxed), 2);
}

struct Gauge {
    current: AtomicUsize,
    max: AtomicUsize,
}

impl Gauge {
    fn enter(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max.fetch_max(now, Ordering::SeqCst);
    }
    fn exit(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn test_parallelism_is_bounded_and_keeps_order() {
    let gauge = Arc::new(Gauge {
        current: AtomicUsize::new(0),
        max: AtomicUsize::new(0),
    });

    let mapper = MapperBuilder::new()
        .types(|t| {
            t.collection::<Vec<i32>>(|e| e.cloneable())
                .collection::<Vec<String>>(|e| e.cloneable())
        })
        .parallelism(2)
        .service(gauge.clone())
        .maps(|m| {
            m.async_new_map::<i32, String, _, _>(|n, ctx| {
                let gauge = ctx.service::<Gauge>();
                async move {
                    if let Some(g) = &gauge {
                        g.enter();
                    }
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    if let Some(g) = &gauge {
                        g.exit();
                    }
                    Ok(n.map(|n| format!("#{n}")))
                }
            })
        })
        .build()
        .unwrap();

    let out = mapper
        .map_async::<Vec<i32>, Vec<String>>(Some(&vec![1, 2, 3, 4, 5, 6]))
        .await
        .unwrap()
        .unwrap();

    // Results land in source order regardless of completion order.
    assert_eq!(out, vec!["#1", "#2", "#3", "#4", "#5", "#6"]);
    assert_eq!(gauge.max.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_failing_element_surfaces_over_cancelled_siblings() {
    let mapper = MapperBuilder::new()
        .types(|t| {
            t.collection::<Vec<i32>>(|e| e.cloneable())
                .collection::<Vec<String>>(|e| e.cloneable())
        })
        .parallelism(2)
        .maps(|m| {
            m.async_new_map::<i32, String, _, _>(|n, _ctx| async move {
                if n == Some(3) {
                    anyhow::bail!("element 3 exploded");
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
                Ok(n.map(|n| n.to_string()))
            })
        })
        .build()
        .unwrap();

    let err = mapper
        .map_async::<Vec<i32>, Vec<String>>(Some(&vec![1, 2, 3, 4, 5, 6]))
        .await
        .unwrap_err();

    assert!(
        matches!(err, MapError::CollectionFailure { .. }),
        "got: {err}"
    );
    assert!(!err.is_cancelled());
}
