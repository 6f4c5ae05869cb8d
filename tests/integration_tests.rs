//! Integration tests for the workflow coordinator
//!
//! These tests drive whole event cycles against a workflow document in a
//! temporary directory, plus property checks of the scheduling invariants.

use baton_rs::baton::coordinator::{CompletionEvent, Disposition, WorkflowCoordinator};
use baton_rs::baton::handoff::{HandoffSite, RetryState};
use baton_rs::baton::workflow::graph::{DependencyResolver, ExecutionScheduler, StatusTransitioner};
use baton_rs::baton::workflow::loader::{validate, WorkflowLoader};
use baton_rs::baton::workflow::state::{GraphStore, JsonGraphStore};
use baton_rs::baton::workflow::types::{Step, StepId, StepStatus, Workflow, WorkflowStatus};
use baton_rs::common::config::CoordinatorConfig;
use baton_rs::common::error::{BatonError, TransitionError};
use chrono::Utc;
use proptest::prelude::*;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

// ============================================================================
// Helpers
// ============================================================================

fn config_in(dir: &TempDir) -> CoordinatorConfig {
    CoordinatorConfig {
        workflow_path: dir.path().join("workflow.json"),
        lock_timeout: Duration::from_secs(5),
        ..CoordinatorConfig::default()
    }
}

fn coordinator_with(config: CoordinatorConfig) -> WorkflowCoordinator<JsonGraphStore> {
    WorkflowCoordinator::new(JsonGraphStore::from_config(&config), config)
}

fn diamond(max_parallel: usize) -> Workflow {
    Workflow::new(
        "diamond",
        vec![
            Step::new(1, "researcher", "collect sources", vec![]),
            Step::new(2, "analyst", "collect metrics", vec![]),
            Step::new(3, "writer", "write report", vec![StepId::Int(1), StepId::Int(2)]),
        ],
        max_parallel,
    )
}

fn dispatched_ids(disposition: &Disposition) -> Vec<StepId> {
    match disposition {
        Disposition::Dispatch { steps, .. } => steps.iter().map(|s| s.id.clone()).collect(),
        other => panic!("Expected dispatch, got {:?}", other),
    }
}

// ============================================================================
// Scheduling Scenarios
// ============================================================================

#[tokio::test]
async fn test_diamond_runs_to_completion() {
    let dir = TempDir::new().unwrap();
    let coord = coordinator_with(config_in(&dir));
    coord.initialize(diamond(2), false).await.unwrap();

    let plan = coord.plan().await.unwrap();
    assert_eq!(plan.available, vec![StepId::Int(1), StepId::Int(2)]);
    assert_eq!(plan.next_recommended, vec![StepId::Int(1), StepId::Int(2)]);

    let started = coord.dispatch().await.unwrap();
    assert_eq!(started.len(), 2);
    let wf = coord.status().await.unwrap();
    assert_eq!(wf.status, WorkflowStatus::InProgress);
    assert_eq!(wf.execution_state.can_start_more, 0);

    let first = coord
        .handle_event(&CompletionEvent::new("researcher", "Sources gathered. TASK COMPLETE"))
        .await
        .unwrap();
    assert!(dispatched_ids(&first).is_empty());

    let second = coord
        .handle_event(&CompletionEvent::new(
            "analyst",
            "Metrics ready.\nHANDOFF_TOKEN: METRICS_DONE\nNext: @writer",
        ))
        .await
        .unwrap();
    assert_eq!(dispatched_ids(&second), vec![StepId::Int(3)]);

    let last = coord
        .handle_event(&CompletionEvent::new("writer", "Report written. TASK COMPLETE"))
        .await
        .unwrap();
    match last {
        Disposition::Dispatch {
            workflow_completed, ..
        } => assert!(workflow_completed),
        other => panic!("Expected dispatch, got {:?}", other),
    }

    let wf = coord.status().await.unwrap();
    assert_eq!(wf.status, WorkflowStatus::Completed);
    assert!(wf.steps.iter().all(|s| s.result.is_some()));
}

#[tokio::test]
async fn test_step_cannot_complete_before_its_dependencies() {
    let dir = TempDir::new().unwrap();
    let coord = coordinator_with(config_in(&dir));
    let initial = coord.initialize(diamond(2), false).await.unwrap();

    let err = coord
        .complete_step(&StepId::Int(3), "done early")
        .await
        .unwrap_err();
    match err {
        BatonError::Transition(TransitionError::DependenciesUnmet { step, pending }) => {
            assert_eq!(step, StepId::Int(3));
            assert_eq!(pending, vec![StepId::Int(1), StepId::Int(2)]);
        }
        other => panic!("Expected unmet dependencies, got {:?}", other),
    }

    let rescue =
        CompletionEvent::new("general-purpose", "TASK COMPLETE").for_step(StepId::Int(3));
    assert!(matches!(
        coord.handle_event(&rescue).await.unwrap_err(),
        BatonError::Transition(TransitionError::DependenciesUnmet { .. })
    ));

    assert_eq!(coord.status().await.unwrap(), initial);
}

#[tokio::test]
async fn test_single_slot_budget_picks_lowest_id() {
    let dir = TempDir::new().unwrap();
    let coord = coordinator_with(config_in(&dir));
    let wf = Workflow::new(
        "serial",
        vec![
            Step::new(2, "b", "second", vec![]),
            Step::new(1, "a", "first", vec![]),
        ],
        1,
    );
    coord.initialize(wf, false).await.unwrap();

    let plan = coord.plan().await.unwrap();
    assert_eq!(plan.next_recommended, vec![StepId::Int(1)]);
}

#[tokio::test]
async fn test_mixed_id_kinds_from_yaml_plan() {
    let dir = TempDir::new().unwrap();
    let plan_path = dir.path().join("plan.yaml");
    std::fs::write(
        &plan_path,
        r#"
goal: release
steps:
  - id: 1
    agent: builder
    task: build artifacts
    status: pending
    depends_on: []
  - id: publish
    agent: publisher
    task: publish artifacts
    status: pending
    depends_on: [1]
"#,
    )
    .unwrap();

    let wf = WorkflowLoader::with_budget(2).load_plan(&plan_path).unwrap();
    let coord = coordinator_with(config_in(&dir));
    coord.initialize(wf, false).await.unwrap();

    let disposition = coord
        .handle_event(&CompletionEvent::new("builder", "TASK COMPLETE"))
        .await
        .unwrap();
    assert_eq!(
        dispatched_ids(&disposition),
        vec![StepId::Str("publish".to_string())]
    );
}

// ============================================================================
// Handoff Retry And Escalation
// ============================================================================

#[tokio::test]
async fn test_malformed_reports_escalate_and_persist() {
    let dir = TempDir::new().unwrap();
    let coord = coordinator_with(config_in(&dir));
    coord.initialize(diamond(2), false).await.unwrap();

    let bad = CompletionEvent::new("researcher", "I think I'm done, over to the writer");

    let first = coord.handle_event(&bad).await.unwrap();
    assert!(matches!(first, Disposition::Retry { attempt: 1, .. }));
    assert_eq!(first.exit_code(), 1);

    // Retry state survives between separate invocations
    let site = HandoffSite::new(&StepId::Int(1), "researcher");
    let wf = coord.status().await.unwrap();
    assert_eq!(wf.handoffs.get(&site), RetryState::Retrying { attempts: 1 });

    let second = coord.handle_event(&bad).await.unwrap();
    assert!(matches!(second, Disposition::Retry { attempt: 2, .. }));

    let third = coord.handle_event(&bad).await.unwrap();
    match &third {
        Disposition::Escalate {
            attempts,
            fallback_agent,
            instruction,
            ..
        } => {
            assert_eq!(*attempts, 3);
            assert_eq!(fallback_agent, "general-purpose");
            assert!(instruction.contains("collect sources"));
        }
        other => panic!("Expected escalation, got {:?}", other),
    }
    assert_eq!(third.exit_code(), 2);

    let fourth = coord.handle_event(&bad).await.unwrap();
    assert!(matches!(fourth, Disposition::Escalate { attempts: 4, .. }));

    // Escalation leaves the graph alone
    let wf = coord.status().await.unwrap();
    assert_eq!(wf.step(&StepId::Int(1)).unwrap().status, StepStatus::Pending);

    // The fallback actor finishes the step explicitly
    let rescue = CompletionEvent::new("general-purpose", "TASK COMPLETE").for_step(StepId::Int(1));
    let disposition = coord.handle_event(&rescue).await.unwrap();
    assert_eq!(disposition.exit_code(), 0);
    let wf = coord.status().await.unwrap();
    assert_eq!(wf.step(&StepId::Int(1)).unwrap().status, StepStatus::Completed);
    // The escalated site of the original agent is gone with the step
    assert!(wf.handoffs.is_empty());
}

#[tokio::test]
async fn test_wellformed_report_resets_retry_counter() {
    let dir = TempDir::new().unwrap();
    let coord = coordinator_with(config_in(&dir));
    coord.initialize(diamond(2), false).await.unwrap();
    coord.start_step(&StepId::Int(1)).await.unwrap();

    let bad = CompletionEvent::new("researcher", "HANDOFF_TOKEN: done-ish @writer");
    assert!(matches!(
        coord.handle_event(&bad).await.unwrap(),
        Disposition::Retry { attempt: 1, .. }
    ));

    let good = CompletionEvent::new("researcher", "HANDOFF_TOKEN: SOURCES_OK @writer");
    let disposition = coord.handle_event(&good).await.unwrap();
    match disposition {
        Disposition::Dispatch {
            handoff_target,
            handoff_token,
            ..
        } => {
            assert_eq!(handoff_target.as_deref(), Some("writer"));
            assert_eq!(handoff_token.as_deref(), Some("SOURCES_OK"));
        }
        other => panic!("Expected dispatch, got {:?}", other),
    }

    let wf = coord.status().await.unwrap();
    assert!(wf.handoffs.is_empty());
}

// ============================================================================
// Terminal State
// ============================================================================

#[tokio::test]
async fn test_last_completion_marks_workflow_completed() {
    let dir = TempDir::new().unwrap();
    let coord = coordinator_with(config_in(&dir));
    let wf = Workflow::new("one", vec![Step::new(1, "solo", "do it", vec![])], 1);
    coord.initialize(wf, false).await.unwrap();
    coord.start_step(&StepId::Int(1)).await.unwrap();

    coord
        .handle_event(&CompletionEvent::new("solo", "WORK COMPLETE"))
        .await
        .unwrap();

    let wf = coord.status().await.unwrap();
    assert_eq!(wf.status, WorkflowStatus::Completed);

    let err = coord
        .complete_step(&StepId::Int(1), "again")
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        BatonError::Transition(TransitionError::WorkflowCompleted)
    ));
}

#[tokio::test]
async fn test_completed_workflow_is_archived_when_configured() {
    let dir = TempDir::new().unwrap();
    let config = CoordinatorConfig {
        archive_completed: true,
        ..config_in(&dir)
    };
    let coord = coordinator_with(config);
    let wf = Workflow::new("one", vec![Step::new(1, "solo", "do it", vec![])], 1);
    coord.initialize(wf, false).await.unwrap();

    coord.complete_step(&StepId::Int(1), "done").await.unwrap();

    assert!(!coord.store().exists().await);
    let archived: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
        .filter(|n| n.ends_with(".archived.json"))
        .collect();
    assert_eq!(archived.len(), 1);
}

// ============================================================================
// Concurrency
// ============================================================================

#[tokio::test]
async fn test_concurrent_events_do_not_lose_updates() {
    let dir = TempDir::new().unwrap();
    let config = config_in(&dir);
    let agents = ["a", "b", "c", "d"];
    let steps = agents
        .iter()
        .enumerate()
        .map(|(i, agent)| Step::new(i as i64 + 1, agent, "work", vec![]))
        .collect();

    let coord = Arc::new(coordinator_with(config.clone()));
    coord
        .initialize(Workflow::new("fan-out", steps, 4), false)
        .await
        .unwrap();
    coord.dispatch().await.unwrap();

    let mut handles = Vec::new();
    for agent in agents {
        // Separate coordinators model separate processes
        let coord = coordinator_with(config.clone());
        handles.push(tokio::spawn(async move {
            coord
                .handle_event(&CompletionEvent::new(agent, "TASK COMPLETE"))
                .await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let wf = coord.status().await.unwrap();
    assert_eq!(wf.count_with_status(StepStatus::Completed), 4);
    assert_eq!(wf.status, WorkflowStatus::Completed);
    // init + dispatch + four events
    assert_eq!(wf.version, 6);
    assert!(!dir.path().join("workflow.json.lock").exists());
}

#[tokio::test]
async fn test_sweep_flags_long_running_steps() {
    let dir = TempDir::new().unwrap();
    let coord = coordinator_with(config_in(&dir));
    let mut wf = diamond(2);
    StatusTransitioner::start(&mut wf, &StepId::Int(1), Utc::now() - chrono::Duration::hours(2))
        .unwrap();
    StatusTransitioner::start(&mut wf, &StepId::Int(2), Utc::now()).unwrap();
    coord.initialize(wf, false).await.unwrap();

    let stale = coord.sweep_stale(Duration::from_secs(3600)).await.unwrap();
    assert_eq!(stale.len(), 1);
    assert_eq!(stale[0].id, StepId::Int(1));
    assert!(stale[0].age_secs >= 7200);
}

// ============================================================================
// Property Tests
// ============================================================================

/// Random DAG: step i may only depend on lower-numbered steps
fn build_dag(size: usize, masks: &[u32], max_parallel: usize) -> Workflow {
    let steps = (1..=size)
        .map(|i| {
            let deps = (1..i)
                .filter(|j| masks[i - 1] & (1 << (j - 1)) != 0)
                .map(|j| StepId::Int(j as i64))
                .collect();
            Step::new(i as i64, &format!("agent-{}", i % 3), "task", deps)
        })
        .collect();
    Workflow::new("random", steps, max_parallel)
}

fn check_invariants(wf: &Workflow) {
    assert!(wf.in_progress_count() <= wf.max_parallel());
    assert!(validate(wf).is_ok());

    for id in DependencyResolver::available(wf) {
        let step = wf.step(&id).unwrap();
        assert_eq!(step.status, StepStatus::Pending);
        for dep in &step.depends_on {
            assert_eq!(wf.step(dep).unwrap().status, StepStatus::Completed);
        }
    }

    let mut again = wf.clone();
    again.refresh();
    assert_eq!(again.status, wf.evaluate_status());
    again.refresh();
    assert_eq!(again.status, wf.evaluate_status());
}

proptest! {
    #[test]
    fn prop_scheduling_invariants_hold(
        size in 1usize..10,
        max_parallel in 1usize..4,
        masks in prop::collection::vec(any::<u32>(), 10),
        ops in prop::collection::vec(0usize..64, 0..40),
    ) {
        let mut wf = build_dag(size, &masks, max_parallel);
        check_invariants(&wf);

        for op in ops {
            let before: Vec<StepStatus> = wf.steps.iter().map(|s| s.status).collect();

            if op % 2 == 0 {
                let plan = ExecutionScheduler::plan(&wf);
                prop_assert!(plan.next_recommended.len() <= plan.can_start_more);
                for id in plan.next_recommended {
                    StatusTransitioner::start(&mut wf, &id, Utc::now()).unwrap();
                }
            } else {
                let running: Vec<StepId> = wf
                    .steps
                    .iter()
                    .filter(|s| s.status == StepStatus::InProgress)
                    .map(|s| s.id.clone())
                    .collect();
                if !running.is_empty() {
                    let id = &running[(op / 2) % running.len()];
                    StatusTransitioner::complete(&mut wf, id, "ok".to_string()).unwrap();
                }
            }
            wf.refresh();

            for (old, step) in before.iter().zip(&wf.steps) {
                prop_assert!(*old <= step.status);
            }
            check_invariants(&wf);
        }
    }

    #[test]
    fn prop_dispatch_loop_always_finishes(
        size in 1usize..10,
        max_parallel in 1usize..4,
        masks in prop::collection::vec(any::<u32>(), 10),
    ) {
        let mut wf = build_dag(size, &masks, max_parallel);

        // Each round starts the recommended batch and completes the lowest running step
        for _ in 0..(size * 2) {
            if wf.is_completed() {
                break;
            }
            for id in ExecutionScheduler::plan(&wf).next_recommended {
                StatusTransitioner::start(&mut wf, &id, Utc::now()).unwrap();
            }
            let running = wf
                .steps
                .iter()
                .filter(|s| s.status == StepStatus::InProgress)
                .map(|s| s.id.clone())
                .min();
            prop_assert!(running.is_some());
            if let Some(id) = running {
                StatusTransitioner::complete(&mut wf, &id, "ok".to_string()).unwrap();
            }
            wf.refresh();
        }

        prop_assert!(wf.is_completed());
        prop_assert_eq!(wf.status, WorkflowStatus::Completed);
    }
}
