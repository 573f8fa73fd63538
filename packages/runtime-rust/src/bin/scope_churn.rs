//! Drives a `ScopeManager` with concurrent request and session churn and
//! reports what was created and destroyed.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use clap::Parser;
use scopes_runtime::telemetry::init_tracing;
use scopes_runtime::{AttributeValue, RenewalAware, ScopeKind, ScopeManager, ScopeManagerConfig, Value};

#[derive(Debug, Parser)]
#[command(name = "scope-churn", about = "Concurrent scope lifecycle churn")]
struct Args {
    /// Worker threads issuing requests.
    #[arg(long, env = "SCOPES_THREADS", default_value_t = 8)]
    threads: usize,
    /// Requests issued by each worker.
    #[arg(long, env = "SCOPES_REQUESTS", default_value_t = 1_000)]
    requests: usize,
    /// Distinct session ids shared by all workers.
    #[arg(long, env = "SCOPES_SESSIONS", default_value_t = 16)]
    sessions: usize,
    /// Distinct application ids.
    #[arg(long, env = "SCOPES_APPLICATIONS", default_value_t = 2)]
    applications: usize,
    /// Renew every session halfway through the run.
    #[arg(long, env = "SCOPES_RENEW")]
    renew: bool,
    /// Log scope begin/end at info level.
    #[arg(long, env = "SCOPES_DEBUG_LIFECYCLE")]
    debug_lifecycle: bool,
    /// Emit JSON log lines.
    #[arg(long, env = "SCOPES_JSON_LOGS")]
    json_logs: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing("info", args.json_logs)?;

    let manager = ScopeManager::new(ScopeManagerConfig {
        debug_lifecycle: args.debug_lifecycle,
        ..ScopeManagerConfig::default()
    });

    let begun = Arc::new(AtomicU64::new(0));
    let ended = Arc::new(AtomicU64::new(0));
    for kind in ScopeKind::ALL {
        let counter = Arc::clone(&begun);
        manager.register_begin_listener(kind, move |_| {
            counter.fetch_add(1, Ordering::Relaxed);
            Ok(())
        });
        let counter = Arc::clone(&ended);
        manager.register_end_listener(kind, move |_| {
            counter.fetch_add(1, Ordering::Relaxed);
            Ok(())
        });
    }

    let sessions = args.sessions.max(1);
    let applications = args.applications.max(1);
    let run_phase = |phase: &str| -> anyhow::Result<()> {
        std::thread::scope(|workers| {
            let handles: Vec<_> = (0..args.threads)
                .map(|worker| {
                    let manager = &manager;
                    workers.spawn(move || -> anyhow::Result<()> {
                        for n in 0..args.requests {
                            let session_id = format!("session-{}", (worker + n) % sessions);
                            let application_id = format!("app-{}", n % applications);
                            let request_id = format!("{phase}-{}", uuid::Uuid::new_v4());

                            let guard =
                                manager.begin_request(&application_id, &request_id, &session_id)?;
                            guard.scope().set("worker", i64::try_from(worker)?)?;
                            if let Some(session) = manager.current_session_scope() {
                                session.run_atomic(|attrs| {
                                    let hits = attrs.get_i64("hits").unwrap_or(0);
                                    attrs.set("hits", hits + 1);
                                })?;
                                session.compute_if_absent("user", || {
                                    AttributeValue::from(RenewalAware::new(Value::from(
                                        session_id.clone(),
                                    )))
                                })?;
                            }
                            guard.end()?.into_result()?;
                        }
                        Ok(())
                    })
                })
                .collect();
            handles.into_iter().try_for_each(|handle| {
                handle
                    .join()
                    .map_err(|_| anyhow::anyhow!("worker panicked"))?
            })
        })
    };

    run_phase("first")?;
    if args.renew {
        for session_id in manager.session_ids() {
            let renewed = format!("{session_id}-renewed");
            manager.renew_session(&session_id, &renewed)?.into_result()?;
        }
        run_phase("second")?;
    }

    let hits: i64 = manager
        .session_ids()
        .iter()
        .filter_map(|id| manager.session_scope(id))
        .filter_map(|session| session.get_i64("hits"))
        .sum();
    tracing::info!(
        sessions = manager.active_count(ScopeKind::Session),
        applications = manager.active_count(ScopeKind::Application),
        session_hits = hits,
        "churn finished"
    );

    manager.on_global_end()?.into_result()?;
    tracing::info!(
        begun = begun.load(Ordering::Relaxed),
        ended = ended.load(Ordering::Relaxed),
        "all scopes ended"
    );
    Ok(())
}
