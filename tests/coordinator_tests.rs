use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tier_orchestrator::config::ProbeConfig;
use tier_orchestrator::error::{Error, Result};
use tier_orchestrator::{CoordinatorState, EventKind, Orchestrator, ServerState};

mod common;
use common::{
    assert_pid_invariant, config, drain, in_tier, never_healthy, sh, sleeper, wait_for_state,
    with_probe, with_restart,
};

/// Position of the first event matching `pred`.
fn position(events: &[EventKind], pred: impl Fn(&EventKind) -> bool) -> usize {
    events
        .iter()
        .position(pred)
        .unwrap_or_else(|| panic!("event not found in {:?}", events))
}

#[tokio::test]
async fn test_flaky_server_recovers_within_budget() -> Result<()> {
    let dir = TempDir::new().unwrap();
    let counter = dir.path().join("runs");
    let counter = counter.display();

    // Crashes on its first three runs, stays up on the fourth.
    let script = format!(
        "n=$(cat {counter} 2>/dev/null || echo 0); n=$((n+1)); echo $n > {counter}; \
         if [ $n -le 3 ]; then exit 1; fi; exec sleep 30"
    );
    let probe = ProbeConfig::Command {
        command: "sh".to_string(),
        args: vec![
            "-c".to_string(),
            format!("[ \"$(cat {counter})\" -ge 4 ]"),
        ],
    };

    let flaky = with_probe(with_restart(in_tier(sh(&script), 1, &["a"]), 3, 0), probe);
    let orchestrator = Orchestrator::new(config(vec![("a", sleeper()), ("b", flaky)]))?;
    let mut rx = orchestrator.events().subscribe_all();

    orchestrator.start_all().await?;

    assert_eq!(orchestrator.coordinator_state()?, CoordinatorState::AllStarted);
    let a = orchestrator.server_status("a")?;
    let b = orchestrator.server_status("b")?;
    assert_eq!(a.state, ServerState::Running);
    assert_eq!(b.state, ServerState::Running);
    assert_eq!(b.restart_count, 3);
    assert_pid_invariant(&orchestrator);

    let events = drain(&mut rx);
    let tier0 = position(&events, |e| matches!(e, EventKind::TierHealthy { tier: 0 }));
    let b_starting = position(
        &events,
        |e| matches!(e, EventKind::ServerStarting { server, .. } if server == "b"),
    );
    let tier1 = position(&events, |e| matches!(e, EventKind::TierHealthy { tier: 1 }));
    assert!(tier0 < b_starting);
    assert!(b_starting < tier1);

    // Calling again once everything is up is a no-op
    orchestrator.start_all().await?;

    let forced = orchestrator.shutdown().await?;
    assert!(forced.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_exhausted_budget_aborts_startup() -> Result<()> {
    // Default process probe: a crash right after spawn must not pass the tier.
    let crasher = with_restart(in_tier(sh("exit 1"), 1, &["a"]), 2, 0);
    let orchestrator = Orchestrator::new(config(vec![("a", sleeper()), ("b", crasher)]))?;
    let mut rx = orchestrator.events().subscribe_all();

    let result = orchestrator.start_all().await;
    match result {
        Err(Error::StartupFailed { tier, servers, .. }) => {
            assert_eq!(tier, 1);
            assert_eq!(servers, vec!["b".to_string()]);
        }
        other => panic!("expected startup failure, got {:?}", other),
    }

    assert_eq!(
        orchestrator.coordinator_state()?,
        CoordinatorState::Aborted { tier: 1 }
    );
    assert_eq!(orchestrator.server_status("b")?.state, ServerState::Failed);
    assert_eq!(orchestrator.server_status("b")?.restart_count, 2);
    // Everything that was running has been stopped
    assert_eq!(orchestrator.server_status("a")?.state, ServerState::Stopped);
    assert_pid_invariant(&orchestrator);

    let events = drain(&mut rx);
    let first = position(
        &events,
        |e| matches!(e, EventKind::ServerRestarting { server, attempt: 1, .. } if server == "b"),
    );
    let second = position(
        &events,
        |e| matches!(e, EventKind::ServerRestarting { server, attempt: 2, .. } if server == "b"),
    );
    let failed = position(
        &events,
        |e| matches!(e, EventKind::ServerFailed { server, restarts: 2, .. } if server == "b"),
    );
    let aborted = position(&events, |e| matches!(e, EventKind::StartupAborted { tier: 1, .. }));
    assert!(first < second);
    assert!(second < failed);
    assert!(failed < aborted);
    assert!(!events.iter().any(|e| matches!(e, EventKind::TierHealthy { tier: 1 })));
    assert!(
        !events
            .iter()
            .any(|e| matches!(e, EventKind::ServerStarted { server, .. } if server == "b"))
    );
    Ok(())
}

#[tokio::test]
async fn test_shutdown_stops_tiers_in_descending_order() -> Result<()> {
    let orchestrator = Orchestrator::new(config(vec![
        ("a0", sleeper()),
        ("b0", sleeper()),
        ("a1", in_tier(sleeper(), 1, &["a0"])),
        ("b1", in_tier(sleeper(), 1, &["b0"])),
        ("a2", in_tier(sleeper(), 2, &["a1", "b1"])),
        ("b2", in_tier(sleeper(), 2, &[])),
    ]))?;
    let tiers: HashMap<String, u32> = orchestrator
        .registry()
        .list()
        .into_iter()
        .map(|d| (d.name.clone(), d.tier))
        .collect();

    orchestrator.start_all().await?;
    let mut rx = orchestrator.events().subscribe_all();

    let forced = orchestrator.shutdown_all(Duration::from_secs(5)).await?;
    assert!(forced.is_empty());

    let stopped: Vec<u32> = drain(&mut rx)
        .into_iter()
        .filter_map(|e| match e {
            EventKind::ServerStopped { server, forced, .. } => {
                assert!(!forced);
                Some(tiers[&server])
            }
            _ => None,
        })
        .collect();

    assert_eq!(stopped.len(), 6);
    assert!(
        stopped.windows(2).all(|pair| pair[0] >= pair[1]),
        "stop order by tier was {:?}",
        stopped
    );
    for status in orchestrator.status()? {
        assert_eq!(status.state, ServerState::Stopped);
    }

    // Shutdown is terminal
    assert!(matches!(
        orchestrator.start_all().await,
        Err(Error::ShutdownRequested)
    ));
    Ok(())
}

#[tokio::test]
async fn test_tier_timeout_aborts_startup() -> Result<()> {
    let mut config = config(vec![
        ("slow", with_probe(sleeper(), never_healthy())),
        ("late", in_tier(sleeper(), 1, &["slow"])),
    ]);
    config.startup.tier_timeout_ms = 300;
    let orchestrator = Orchestrator::new(config)?;

    let started = Instant::now();
    let result = orchestrator.start_all().await;
    assert!(started.elapsed() < Duration::from_secs(5));

    match result {
        Err(Error::StartupFailed {
            tier,
            servers,
            reason,
        }) => {
            assert_eq!(tier, 0);
            assert_eq!(servers, vec!["slow".to_string()]);
            assert!(reason.contains("Timed out"), "reason was {}", reason);
        }
        other => panic!("expected startup failure, got {:?}", other),
    }

    assert_eq!(orchestrator.server_status("slow")?.state, ServerState::Stopped);
    // The next tier was never attempted
    let late = orchestrator.server_status("late")?;
    assert_eq!(late.state, ServerState::Stopped);
    assert_eq!(late.started_at, None);
    Ok(())
}

#[tokio::test]
async fn test_partially_healthy_tier_names_only_offenders() -> Result<()> {
    let mut config = config(vec![
        ("good", sleeper()),
        ("bad", with_probe(sleeper(), never_healthy())),
    ]);
    config.startup.tier_timeout_ms = 1500;
    let orchestrator = Orchestrator::new(config)?;
    let mut rx = orchestrator.events().subscribe_all();

    let result = orchestrator.start_all().await;
    match result {
        Err(Error::StartupFailed { tier, servers, .. }) => {
            assert_eq!(tier, 0);
            assert_eq!(servers, vec!["bad".to_string()]);
        }
        other => panic!("expected startup failure, got {:?}", other),
    }

    let events = drain(&mut rx);
    assert!(
        events
            .iter()
            .any(|e| matches!(e, EventKind::ServerStarted { server, .. } if server == "good"))
    );
    assert!(!events.iter().any(|e| matches!(e, EventKind::TierHealthy { .. })));
    assert_eq!(
        orchestrator.coordinator_state()?,
        CoordinatorState::Aborted { tier: 0 }
    );
    // The healthy member is stopped along with the rest
    assert_eq!(orchestrator.server_status("good")?.state, ServerState::Stopped);
    assert_eq!(orchestrator.server_status("bad")?.state, ServerState::Stopped);
    Ok(())
}

#[tokio::test]
async fn test_critical_failure_aborts_later_tier() -> Result<()> {
    // Up long enough to pass its tier, then dies for good.
    let mut db = with_restart(sh("sleep 1.5; exit 1"), 0, 0);
    db.critical = true;
    let app = with_probe(in_tier(sleeper(), 1, &["db"]), never_healthy());

    let orchestrator = Orchestrator::new(config(vec![("db", db), ("app", app)]))?;

    let started = Instant::now();
    let result = orchestrator.start_all().await;
    assert!(started.elapsed() < Duration::from_secs(5));

    match result {
        Err(Error::StartupFailed {
            tier,
            servers,
            reason,
        }) => {
            assert_eq!(tier, 1);
            assert_eq!(servers, vec!["db".to_string()]);
            assert!(reason.contains("db"), "reason was {}", reason);
        }
        other => panic!("expected startup failure, got {:?}", other),
    }
    assert_eq!(orchestrator.server_status("db")?.state, ServerState::Failed);
    assert!(wait_for_state(&orchestrator, "app", ServerState::Stopped, Duration::from_secs(5)).await);

    // A critical server is still failed, so a new attempt aborts at once
    let started = Instant::now();
    let result = orchestrator.start_all().await;
    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(matches!(result, Err(Error::StartupFailed { tier: 0, .. })));
    assert_eq!(orchestrator.server_status("app")?.state, ServerState::Stopped);
    Ok(())
}

#[tokio::test]
async fn test_shutdown_interrupts_startup() -> Result<()> {
    let orchestrator = Arc::new(Orchestrator::new(config(vec![
        ("stuck", with_probe(sleeper(), never_healthy())),
        ("next", in_tier(sleeper(), 1, &["stuck"])),
    ]))?);
    let mut rx = orchestrator.events().subscribe_all();

    let startup = {
        let orchestrator = Arc::clone(&orchestrator);
        tokio::spawn(async move { orchestrator.start_all().await })
    };

    assert!(wait_for_state(&orchestrator, "stuck", ServerState::Starting, Duration::from_secs(5)).await);
    orchestrator.shutdown().await?;

    let result = tokio::time::timeout(Duration::from_secs(5), startup)
        .await
        .expect("startup returned")
        .expect("startup did not panic");
    assert!(matches!(result, Err(Error::ShutdownRequested)));

    assert_eq!(orchestrator.server_status("stuck")?.state, ServerState::Stopped);
    assert_eq!(orchestrator.server_status("next")?.started_at, None);
    assert!(drain(&mut rx)
        .iter()
        .any(|e| matches!(e, EventKind::StartupAborted { tier: 0, .. })));
    Ok(())
}
