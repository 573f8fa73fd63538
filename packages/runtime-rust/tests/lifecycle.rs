//! End-to-end lifecycle scenarios driven through `ScopeManager`.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};

use parking_lot::Mutex;
use scopes_runtime::{
    AttributeValue, FailureSource, RenewalAware, ScopeError, ScopeKind, ScopeManager,
    ScopeManagerConfig, ScopeObject, Value,
};

type Log = Arc<Mutex<Vec<String>>>;

/// Records "+kind:id" on begin and "-kind:id" on end for every kind.
fn recording_manager(config: ScopeManagerConfig) -> (ScopeManager, Log) {
    let manager = ScopeManager::new(config);
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    for kind in ScopeKind::ALL {
        let l = Arc::clone(&log);
        manager.register_begin_listener(kind, move |s| {
            l.lock().push(format!("+{}:{}", s.kind(), s.id()));
            Ok(())
        });
        let l = Arc::clone(&log);
        manager.register_end_listener(kind, move |s| {
            l.lock().push(format!("-{}:{}", s.kind(), s.id()));
            Ok(())
        });
    }
    (manager, log)
}

fn take(log: &Log) -> Vec<String> {
    std::mem::take(&mut *log.lock())
}

#[test]
fn request_end_leaves_session_and_application_valid() {
    let (manager, log) = recording_manager(ScopeManagerConfig::default());

    let request = manager
        .on_request_begin("app1", "req1", "sess1")
        .unwrap()
        .into_result()
        .unwrap();
    assert!(request.is_valid());
    assert_eq!(request.parent_id(), Some("sess1"));
    assert_eq!(
        take(&log),
        vec![
            "+global:global",
            "+application:app1",
            "+session:sess1",
            "+request:req1"
        ]
    );

    manager.on_request_end().unwrap().into_result().unwrap();

    assert!(request.is_destroyed());
    assert!(manager.request_scope("req1").is_none());
    assert!(manager.session_scope("sess1").unwrap().is_valid());
    assert!(manager.application_scope("app1").unwrap().is_valid());
    assert!(manager.global_scope().unwrap().is_valid());
    assert_eq!(take(&log), vec!["-request:req1"]);
}

#[test]
fn second_request_reuses_existing_scopes() {
    let (manager, log) = recording_manager(ScopeManagerConfig::default());
    manager.on_request_begin("app1", "req1", "sess1").unwrap().into_result().unwrap();
    manager.on_request_end().unwrap().into_result().unwrap();
    take(&log);

    manager.on_request_begin("app1", "req2", "sess1").unwrap().into_result().unwrap();
    assert_eq!(take(&log), vec!["+request:req2"]);
    assert_eq!(manager.active_count(ScopeKind::Session), 1);
    assert_eq!(manager.active_count(ScopeKind::Application), 1);
}

#[test]
fn request_end_without_begin_reports_error() {
    let manager = ScopeManager::default();
    let err = manager.on_request_end().unwrap_err();
    assert!(matches!(err, ScopeError::NoActiveRequest));
    assert!(err.is_already_gone());
}

#[test]
fn empty_ids_are_rejected_before_anything_is_created() {
    let manager = ScopeManager::default();
    assert!(matches!(
        manager.on_request_begin("", "r", "s"),
        Err(ScopeError::EmptyId {
            kind: ScopeKind::Application
        })
    ));
    assert!(matches!(
        manager.on_request_begin("a", "", "s"),
        Err(ScopeError::EmptyId {
            kind: ScopeKind::Request
        })
    ));
    assert!(matches!(
        manager.on_request_begin("a", "r", ""),
        Err(ScopeError::EmptyId {
            kind: ScopeKind::Session
        })
    ));
    assert!(!manager.is_global_scope_present());
}

#[test]
fn current_scope_lookups_follow_the_thread() {
    let manager = ScopeManager::default();
    assert!(manager.current_request_scope().is_none());

    manager.on_request_begin("shop", "r1", "s1").unwrap().into_result().unwrap();
    assert_eq!(manager.current_request_scope().unwrap().id(), "r1");
    assert_eq!(manager.current_session_scope().unwrap().id(), "s1");
    assert_eq!(manager.current_application_scope().unwrap().id(), "shop");

    std::thread::scope(|t| {
        t.spawn(|| assert!(manager.current_request_scope().is_none()));
    });

    manager.on_request_end().unwrap().into_result().unwrap();
    assert!(manager.current_request_scope().is_none());
}

#[test]
fn concurrent_first_creation_yields_one_session() {
    const THREADS: usize = 16;
    let manager = ScopeManager::default();
    let session_begins = Arc::new(AtomicUsize::new(0));
    let global_begins = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&session_begins);
    manager.register_begin_listener(ScopeKind::Session, move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });
    let counter = Arc::clone(&global_begins);
    manager.register_begin_listener(ScopeKind::Global, move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });

    let barrier = Barrier::new(THREADS);
    let observed: Vec<_> = std::thread::scope(|t| {
        let handles: Vec<_> = (0..THREADS)
            .map(|n| {
                let (manager, barrier) = (&manager, &barrier);
                t.spawn(move || {
                    barrier.wait();
                    let request_id = format!("req{n}");
                    manager
                        .on_request_begin("app1", &request_id, "sess1")
                        .unwrap()
                        .into_result()
                        .unwrap();
                    let session = manager.current_session_scope().unwrap();
                    manager.on_request_end().unwrap().into_result().unwrap();
                    session
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert_eq!(session_begins.load(Ordering::SeqCst), 1);
    assert_eq!(global_begins.load(Ordering::SeqCst), 1);
    let winner = manager.session_scope("sess1").unwrap();
    assert!(observed.iter().all(|s| Arc::ptr_eq(s, &winner)));
    assert_eq!(manager.active_count(ScopeKind::Request), 0);
}

#[test]
fn concurrent_session_end_notifies_exactly_once() {
    const THREADS: usize = 8;
    let manager = ScopeManager::default();
    let ends = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&ends);
    manager.register_end_listener(ScopeKind::Session, move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });

    manager.on_request_begin("app1", "req1", "sess1").unwrap().into_result().unwrap();
    manager.on_request_end().unwrap().into_result().unwrap();
    let session = manager.session_scope("sess1").unwrap();

    let barrier = Barrier::new(THREADS);
    let results: Vec<_> = std::thread::scope(|t| {
        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                t.spawn(|| {
                    barrier.wait();
                    manager.on_session_end("sess1").map(|t| t.is_clean())
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let winners = results.iter().filter(|r| matches!(r, Ok(true))).count();
    let not_found = results
        .iter()
        .filter(|r| matches!(r, Err(ScopeError::NotFound { kind: ScopeKind::Session, .. })))
        .count();
    assert_eq!(winners, 1);
    assert_eq!(not_found, THREADS - 1);
    assert_eq!(ends.load(Ordering::SeqCst), 1);
    assert!(session.is_destroyed());
    assert!(manager.session_scope("sess1").is_none());
}

#[derive(Debug)]
struct ShoppingCart {
    items: Mutex<Vec<String>>,
}

impl ScopeObject for ShoppingCart {
    fn is_renewal_aware(&self) -> bool {
        true
    }
}

#[test]
fn renewal_aware_attributes_survive_session_renewal() {
    let manager = ScopeManager::default();
    let session = manager.ensure_session_scope("old").unwrap().into_result().unwrap();
    session
        .set(
            "cart",
            AttributeValue::object(ShoppingCart {
                items: Mutex::new(vec!["book".to_string()]),
            }),
        )
        .unwrap();
    session.set("user", RenewalAware::new(Value::from("alice"))).unwrap();
    session.set("csrf", "one-time-token").unwrap();

    let child = manager
        .ensure_session_application_scope("old", "shop")
        .unwrap()
        .into_result()
        .unwrap();
    child.set("prefs", RenewalAware::new(Value::from("dark"))).unwrap();
    child.set("scratch", 1).unwrap();

    let renewed = manager.renew_session("old", "new").unwrap().into_result().unwrap();

    assert!(session.is_destroyed());
    assert!(child.is_destroyed());
    assert!(manager.session_scope("old").is_none());
    assert_eq!(renewed.id(), "new");

    let cart = renewed.get_object::<ShoppingCart>("cart").unwrap();
    assert_eq!(*cart.items.lock(), vec!["book"]);
    let user = renewed.get_object::<RenewalAware<Value>>("user").unwrap();
    assert_eq!(user.get().as_str(), Some("alice"));
    assert!(!renewed.contains("csrf"));

    let renewed_child = manager.session_application_scope("new", "shop").unwrap();
    assert_eq!(renewed_child.id(), "new.shop");
    assert!(renewed_child.contains("prefs"));
    assert!(!renewed_child.contains("scratch"));
}

/// Renewal-aware resource that records being torn down.
#[derive(Debug, Default)]
struct Pool {
    closed: std::sync::atomic::AtomicBool,
}

impl ScopeObject for Pool {
    fn is_renewal_aware(&self) -> bool {
        true
    }

    fn on_scope_destruction(&self, _: ScopeKind, _: &str) -> anyhow::Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Resource without renewal that must be torn down with its session.
#[derive(Debug, Default)]
struct Socket {
    closed: std::sync::atomic::AtomicBool,
}

impl ScopeObject for Socket {
    fn on_scope_destruction(&self, _: ScopeKind, _: &str) -> anyhow::Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[test]
fn renewed_session_receives_live_objects() {
    let manager = ScopeManager::default();
    let session = manager.ensure_session_scope("old").unwrap().into_result().unwrap();
    let pool = Arc::new(Pool::default());
    let socket = Arc::new(Socket::default());
    session
        .set("pool", Arc::clone(&pool) as Arc<dyn ScopeObject>)
        .unwrap();
    session
        .set("socket", Arc::clone(&socket) as Arc<dyn ScopeObject>)
        .unwrap();
    let child = manager
        .ensure_session_application_scope("old", "shop")
        .unwrap()
        .into_result()
        .unwrap();
    let child_pool = Arc::new(Pool::default());
    child
        .set("pool", Arc::clone(&child_pool) as Arc<dyn ScopeObject>)
        .unwrap();

    let renewed = manager.renew_session("old", "new").unwrap().into_result().unwrap();

    assert!(session.is_destroyed());
    assert!(socket.closed.load(Ordering::SeqCst));
    assert!(!pool.closed.load(Ordering::SeqCst));
    assert!(!child_pool.closed.load(Ordering::SeqCst));

    let carried = renewed.get_object::<Pool>("pool").unwrap();
    assert!(Arc::ptr_eq(&carried, &pool));
    assert!(!renewed.contains("socket"));
    let renewed_child = manager.session_application_scope("new", "shop").unwrap();
    assert!(Arc::ptr_eq(
        &renewed_child.get_object::<Pool>("pool").unwrap(),
        &child_pool
    ));

    manager.on_session_end("new").unwrap().into_result().unwrap();
    assert!(!pool.closed.load(Ordering::SeqCst));
}

#[test]
fn session_end_hands_over_renewal_aware_objects_without_teardown() {
    let manager = ScopeManager::default();
    let session = manager.ensure_session_scope("s").unwrap().into_result().unwrap();
    let pool = Arc::new(Pool::default());
    session
        .set("pool", Arc::clone(&pool) as Arc<dyn ScopeObject>)
        .unwrap();

    let snapshot = manager.on_session_end("s").unwrap().into_result().unwrap();

    assert!(!pool.closed.load(Ordering::SeqCst));
    assert!(snapshot.attributes["pool"].downcast::<Pool>().is_some());

    // Once the global scope ends, nothing carries the object further.
    let fresh = manager.ensure_session_scope("t").unwrap().into_result().unwrap();
    fresh.set_all(snapshot.attributes).unwrap();
    manager.on_global_end().unwrap().into_result().unwrap();
    assert!(pool.closed.load(Ordering::SeqCst));
}

#[test]
fn recreating_a_session_during_its_end_keeps_the_new_children() {
    const ROUNDS: usize = 200;
    let manager = ScopeManager::default();
    for round in 0..ROUNDS {
        manager.ensure_session_scope("s").unwrap().into_result().unwrap();
        manager
            .ensure_session_application_scope("s", "app")
            .unwrap()
            .into_result()
            .unwrap();

        let barrier = Barrier::new(2);
        let recreated = std::thread::scope(|t| {
            let ender = t.spawn(|| {
                barrier.wait();
                manager.on_session_end("s").map(|t| t.into_parts().0)
            });
            let creator = t.spawn(|| {
                barrier.wait();
                let session = manager.ensure_session_scope("s").unwrap().into_parts().0;
                let child = manager
                    .ensure_session_application_scope("s", "app")
                    .ok()
                    .map(|t| t.into_parts().0);
                (session, child)
            });
            let snapshot = ender.join().unwrap();
            assert!(snapshot.is_ok(), "round {round}: {snapshot:?}");
            creator.join().unwrap()
        });

        // When the creator's session is the one left active, the child it
        // attached afterwards belongs to that session and must be untouched.
        let (session, child) = recreated;
        let current = manager.session_scope("s");
        if let (Some(current), Some(child)) = (current, child) {
            if Arc::ptr_eq(&current, &session) {
                assert!(current.is_valid(), "round {round}");
                assert!(child.is_valid(), "round {round}: live child was torn down");
                let registered = manager.session_application_scope("s", "app").unwrap();
                assert!(Arc::ptr_eq(&registered, &child), "round {round}");
            }
        }
        // Start the next round from a clean slate.
        let _ = manager.on_session_end("s");
    }
}

#[test]
fn session_end_returns_renewal_snapshot() {
    let manager = ScopeManager::default();
    let session = manager.ensure_session_scope("s").unwrap().into_result().unwrap();
    session.set("keep", RenewalAware::new(Value::Int(1))).unwrap();
    session.set("drop", 2).unwrap();

    let snapshot = manager.on_session_end("s").unwrap().into_result().unwrap();
    assert_eq!(snapshot.session_id, "s");
    assert_eq!(snapshot.attributes.len(), 1);
    assert!(snapshot.attributes.contains_key("keep"));
    assert!(snapshot.session_applications.is_empty());
}

#[test]
fn session_end_destroys_session_applications_first() {
    let (manager, log) = recording_manager(ScopeManagerConfig::default());
    manager.ensure_session_scope("s1").unwrap().into_result().unwrap();
    let shop = manager
        .ensure_session_application_scope("s1", "shop")
        .unwrap()
        .into_result()
        .unwrap();
    manager
        .ensure_session_application_scope("s1", "admin")
        .unwrap()
        .into_result()
        .unwrap();
    assert_eq!(shop.parent_id(), Some("s1"));
    assert_eq!(manager.active_count(ScopeKind::SessionApplication), 2);
    take(&log);

    manager.on_session_end("s1").unwrap().into_result().unwrap();

    assert_eq!(
        take(&log),
        vec![
            "-session_application:s1.admin",
            "-session_application:s1.shop",
            "-session:s1"
        ]
    );
    assert!(shop.is_destroyed());
    assert_eq!(manager.active_count(ScopeKind::SessionApplication), 0);
}

#[test]
fn session_application_requires_session() {
    let manager = ScopeManager::default();
    assert!(matches!(
        manager.ensure_session_application_scope("missing", "shop"),
        Err(ScopeError::NotFound {
            kind: ScopeKind::Session,
            ..
        })
    ));

    manager.ensure_session_scope("s").unwrap().into_result().unwrap();
    manager
        .ensure_session_application_scope("s", "shop")
        .unwrap()
        .into_result()
        .unwrap();
    manager
        .on_session_application_end("s", "shop")
        .unwrap()
        .into_result()
        .unwrap();
    assert!(manager.session_application_scope("s", "shop").is_none());
    assert!(matches!(
        manager.on_session_application_end("s", "shop"),
        Err(ScopeError::NotFound { .. })
    ));
    assert!(manager.session_scope("s").unwrap().is_valid());
}

#[test]
fn application_end_leaves_sessions_alone() {
    let manager = ScopeManager::default();
    manager.on_request_begin("app1", "r1", "s1").unwrap().into_result().unwrap();
    manager.on_request_end().unwrap().into_result().unwrap();

    let app = manager.application_scope("app1").unwrap();
    manager.on_application_end("app1").unwrap().into_result().unwrap();
    assert!(app.is_destroyed());
    assert!(manager.session_scope("s1").unwrap().is_valid());
    assert!(matches!(
        manager.on_application_end("app1"),
        Err(ScopeError::NotFound { .. })
    ));
}

#[test]
fn global_end_cascades_child_first_and_is_terminal() {
    let (manager, log) = recording_manager(ScopeManagerConfig::default());
    manager.on_request_begin("app1", "r1", "s1").unwrap().into_result().unwrap();
    manager
        .ensure_session_application_scope("s1", "app1")
        .unwrap()
        .into_result()
        .unwrap();
    let request = manager.current_request_scope().unwrap();
    take(&log);

    manager.on_global_end().unwrap().into_result().unwrap();

    assert_eq!(
        take(&log),
        vec![
            "-request:r1",
            "-session_application:s1.app1",
            "-session:s1",
            "-application:app1",
            "-global:global"
        ]
    );
    assert!(request.is_destroyed());
    assert!(manager.has_global_ended());
    assert!(!manager.is_global_scope_present());
    assert!(manager.current_request_scope().is_none());

    assert!(matches!(
        manager.on_request_begin("app1", "r2", "s1"),
        Err(ScopeError::GlobalScopeEnded)
    ));
    assert!(matches!(
        manager.on_global_end(),
        Err(ScopeError::AlreadyDestroyed {
            kind: ScopeKind::Global,
            ..
        })
    ));
}

#[test]
fn request_ended_by_global_end_reports_already_destroyed() {
    let manager = ScopeManager::default();
    let barrier = Barrier::new(2);
    std::thread::scope(|t| {
        t.spawn(|| {
            manager.on_request_begin("a", "r1", "s").unwrap().into_result().unwrap();
            barrier.wait();
            barrier.wait();
            let err = manager.on_request_end().unwrap_err();
            assert!(matches!(err, ScopeError::AlreadyDestroyed { .. }));
        });
        barrier.wait();
        manager.on_global_end().unwrap().into_result().unwrap();
        barrier.wait();
    });
}

#[test]
fn listener_failures_do_not_block_teardown() {
    let manager = ScopeManager::default();
    let reached = Arc::new(AtomicUsize::new(0));
    manager.register_end_listener(ScopeKind::Request, |_| anyhow::bail!("audit sink offline"));
    manager.register_end_listener(ScopeKind::Request, |_| panic!("listener bug"));
    let counter = Arc::clone(&reached);
    manager.register_end_listener(ScopeKind::Request, move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });

    let request = manager
        .on_request_begin("a", "r1", "s1")
        .unwrap()
        .into_result()
        .unwrap();
    let transition = manager.on_request_end().unwrap();

    assert_eq!(reached.load(Ordering::SeqCst), 1);
    assert!(request.is_destroyed());
    assert_eq!(transition.failures().len(), 2);
    assert!(transition
        .failures()
        .iter()
        .all(|f| matches!(f.source, FailureSource::Listener(_))));
    let err = transition.into_result().unwrap_err();
    assert!(matches!(err, ScopeError::ListenerFailures(f) if f.len() == 2));
}

#[test]
fn begin_listener_failure_still_yields_valid_request() {
    let manager = ScopeManager::default();
    manager.register_begin_listener(ScopeKind::Session, |_| anyhow::bail!("quota service down"));

    let transition = manager.on_request_begin("a", "r1", "s1").unwrap();
    assert_eq!(transition.failures().len(), 1);
    let (request, _) = transition.into_parts();
    assert!(request.is_valid());
    assert!(manager.session_scope("s1").unwrap().is_valid());
}

#[test]
fn request_guard_ends_request_on_unwind() {
    let (manager, log) = recording_manager(ScopeManagerConfig::default());
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        let guard = manager.begin_request("a", "r1", "s1").unwrap();
        guard.scope().set("step", 1).unwrap();
        panic!("handler failed");
    }));
    assert!(result.is_err());
    assert!(manager.request_scope("r1").is_none());
    assert!(manager.current_request_scope().is_none());
    assert_eq!(take(&log).last().map(String::as_str), Some("-request:r1"));
}

#[test]
fn request_guard_end_reports_outcome() {
    let manager = ScopeManager::default();
    let guard = manager.begin_request("a", "r1", "s1").unwrap();
    assert!(guard.begin_failures().is_empty());
    let scope = Arc::clone(guard.scope());
    guard.end().unwrap().into_result().unwrap();
    assert!(scope.is_destroyed());
    assert!(matches!(
        manager.on_request_end(),
        Err(ScopeError::NoActiveRequest)
    ));
}

#[test]
fn stale_request_is_replaced_by_default() {
    let manager = ScopeManager::default();
    let first = manager.on_request_begin("a", "r1", "s1").unwrap().into_result().unwrap();
    let second = manager.on_request_begin("a", "r2", "s1").unwrap().into_result().unwrap();

    assert!(first.is_destroyed());
    assert!(second.is_valid());
    assert_eq!(manager.current_request_scope().unwrap().id(), "r2");
    assert_eq!(manager.active_count(ScopeKind::Request), 1);
}

#[test]
fn stale_request_is_rejected_when_replacement_disabled() {
    let manager = ScopeManager::new(ScopeManagerConfig {
        replace_stale_request: false,
        ..ScopeManagerConfig::default()
    });
    manager.on_request_begin("a", "r1", "s1").unwrap().into_result().unwrap();
    assert!(matches!(
        manager.on_request_begin("a", "r2", "s1"),
        Err(ScopeError::RequestAlreadyActive { id }) if id == "r1"
    ));
    assert!(manager.request_scope("r2").is_none());
}

#[test]
fn duplicate_request_id_is_rejected() {
    let manager = ScopeManager::default();
    manager.on_request_begin("a", "r1", "s1").unwrap().into_result().unwrap();
    std::thread::scope(|t| {
        t.spawn(|| {
            assert!(matches!(
                manager.on_request_begin("a", "r1", "s2"),
                Err(ScopeError::DuplicateRequest { id }) if id == "r1"
            ));
            // The session was still created for the rejected request.
            assert!(manager.session_scope("s2").is_some());
        });
    });
}

#[test]
fn dropping_manager_ends_everything() {
    let ends = Arc::new(AtomicUsize::new(0));
    let session = {
        let manager = ScopeManager::default();
        let counter = Arc::clone(&ends);
        for kind in ScopeKind::ALL {
            let counter = Arc::clone(&counter);
            manager.register_end_listener(kind, move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }
        manager.on_request_begin("a", "r1", "s1").unwrap().into_result().unwrap();
        manager.on_request_end().unwrap().into_result().unwrap();
        manager.session_scope("s1").unwrap()
    };
    // request + session + application + global
    assert_eq!(ends.load(Ordering::SeqCst), 4);
    assert!(session.is_destroyed());
}
