//! Supervision scenarios: the call gate, dismissal, cascades, queued input,
//! and restart from the persisted store.

use std::sync::Arc;
use std::time::Duration;

use hive::agent::{AgentHandle, AgentSnapshot};
use hive::core::commitment::{Check, Commitment};
use hive::core::types::{AgentState, DoneBehavior, ReapReason};
use hive::events::{Destination, EventBus, MessageKind, Notification};
use hive::io::records::{load_agents, read_agent};
use hive::orchestrator::{Ack, Orchestrator, Services, ToolError};
use hive::spawner::{Initiator, SpawnConfig, SpawnError};
use hive::test_support::{
    CountingMessenger, ScriptStep, ScriptedChecks, ScriptedMessenger, harness, test_config,
};

const WAIT: Duration = Duration::from_secs(10);

async fn wait_until<F>(handle: &AgentHandle, predicate: F) -> AgentSnapshot
where
    F: FnMut(&AgentSnapshot) -> bool,
{
    tokio::time::timeout(WAIT, handle.wait_for(predicate))
        .await
        .expect("condition not reached in time")
        .expect("agent exited first")
}

async fn eventually<F>(mut condition: F)
where
    F: FnMut() -> bool,
{
    tokio::time::timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn call_gate_bounds_concurrent_agents() {
    let messenger = Arc::new(CountingMessenger::new(Duration::from_millis(50), "on it"));
    let mut config = test_config();
    config.messenger.max_in_flight = 2;
    let h = harness(config, messenger.clone(), Arc::new(ScriptedChecks::new())).await;
    let root = h.orchestrator.root().id();

    let mut agents = Vec::new();
    for i in 0..8 {
        let handle = h
            .orchestrator
            .spawner()
            .spawn(Initiator::Parent(root), SpawnConfig::assigned(format!("task {i}")))
            .await
            .expect("spawn");
        agents.push(handle);
    }
    for agent in &agents {
        wait_until(agent, |s| s.last_reply.is_some()).await;
    }

    assert_eq!(messenger.total_calls(), 8);
    assert!(messenger.max_in_flight() <= 2, "peak {}", messenger.max_in_flight());
    assert_eq!(h.orchestrator.in_flight(), 0);
    assert_eq!(h.orchestrator.status().len(), 9);
}

#[tokio::test]
async fn concurrent_spawns_with_one_name_yield_one_agent() {
    let h = harness(
        test_config(),
        Arc::new(ScriptedMessenger::new().reply_with("ok")),
        Arc::new(ScriptedChecks::new()),
    )
    .await;
    let spawner = h.orchestrator.spawner();
    let (first, second) = tokio::join!(
        spawner.spawn(Initiator::User, SpawnConfig::default().named("scribe")),
        spawner.spawn(Initiator::User, SpawnConfig::default().named("scribe")),
    );
    let outcomes = [first.is_ok(), second.is_ok()];
    assert_eq!(outcomes.iter().filter(|ok| **ok).count(), 1);
    let err = first.err().or(second.err()).expect("one failure");
    assert!(matches!(err, SpawnError::NameTaken(_)));
    assert!(h.orchestrator.validate().is_empty());
}

#[tokio::test]
async fn dismissal_during_verification_is_deferred() {
    let messenger = Arc::new(
        ScriptedMessenger::new().script("ship the release", vec![ScriptStep::text("DONE")]),
    );
    let checks = Arc::new(ScriptedChecks::new().delay(Duration::from_millis(300)));
    let h = harness(test_config(), messenger, checks).await;
    let agent = h
        .orchestrator
        .spawner()
        .spawn(
            Initiator::Parent(h.orchestrator.root().id()),
            SpawnConfig::assigned("ship the release")
                .with_commitment(Commitment::new("tagged", Check::shell("git tag -l v1"))),
        )
        .await
        .expect("spawn");

    wait_until(&agent, |s| s.state == AgentState::Verifying).await;
    let err = h
        .orchestrator
        .add_commitment(agent.id(), Commitment::new("late", Check::shell("true")))
        .await
        .expect_err("verifying");
    assert!(matches!(err, ToolError::Verifying(_)));
    assert_eq!(
        h.orchestrator.dismiss_worker(agent.id()).await.expect("dismiss"),
        Ack::Deferred
    );

    let last = wait_until(&agent, |s| s.retired).await;
    assert_eq!(last.state, AgentState::Done);
    assert_eq!(last.commitments.len(), 1);
    assert_eq!(
        h.orchestrator.dismiss_worker(agent.id()).await.expect("again"),
        Ack::AlreadyDismissed
    );
}

#[tokio::test]
async fn reaping_a_parent_reaps_its_children() {
    let h = harness(
        test_config(),
        Arc::new(ScriptedMessenger::new().reply_with("thinking")),
        Arc::new(ScriptedChecks::new()),
    )
    .await;
    let spawner = h.orchestrator.spawner();
    let lead = spawner
        .spawn(
            Initiator::Parent(h.orchestrator.root().id()),
            SpawnConfig::assigned("lead the migration"),
        )
        .await
        .expect("lead");
    let helper = spawner
        .spawn(Initiator::Parent(lead.id()), SpawnConfig::assigned("port the schema"))
        .await
        .expect("helper");

    assert_eq!(
        h.orchestrator.dismiss_worker(lead.id()).await.expect("dismiss"),
        Ack::Dismissed
    );
    let lead_last = wait_until(&lead, |s| s.retired).await;
    assert_eq!(lead_last.reap_reason, Some(ReapReason::ExternalReap));
    let helper_last = wait_until(&helper, |s| s.retired).await;
    assert_eq!(helper_last.state, AgentState::FailedReaped);
    assert_eq!(helper_last.reap_reason, Some(ReapReason::ParentReaped));

    let root = h.orchestrator.root().clone();
    wait_until(&root, |s| s.children.is_empty()).await;
    assert_eq!(h.orchestrator.status().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn spawning_under_a_departing_parent_leaves_no_orphan() {
    let h = harness(
        test_config(),
        Arc::new(ScriptedMessenger::new().reply_with("thinking")),
        Arc::new(ScriptedChecks::new()),
    )
    .await;
    let spawner = h.orchestrator.spawner();
    let root = h.orchestrator.root().id();

    for round in 0..20 {
        let lead = spawner
            .spawn(Initiator::Parent(root), SpawnConfig::assigned(format!("lead round {round}")))
            .await
            .expect("lead");
        let (child, ack) = tokio::join!(
            spawner.spawn(Initiator::Parent(lead.id()), SpawnConfig::assigned("sub task")),
            h.orchestrator.dismiss_worker(lead.id()),
        );
        assert_eq!(ack.expect("dismiss"), Ack::Dismissed);
        match child {
            Ok(child) => {
                let last = wait_until(&child, |s| s.retired).await;
                assert_eq!(last.reap_reason, Some(ReapReason::ParentReaped));
            }
            Err(err) => assert!(
                matches!(
                    err,
                    SpawnError::ParentNotFound(_) | SpawnError::ParentTerminal { .. }
                ),
                "unexpected error {err}"
            ),
        }
        eventually(|| h.orchestrator.status().len() == 1).await;
        wait_until(h.orchestrator.root(), |s| s.children.is_empty()).await;
        assert!(h.orchestrator.validate().is_empty());
    }
}

#[tokio::test]
async fn dismissing_a_hung_call_frees_its_gate_slot() {
    let messenger = Arc::new(
        ScriptedMessenger::new().script("crawl the archive", vec![ScriptStep::Hang]),
    );
    let mut config = test_config();
    config.messenger.timeout_secs = 600;
    let h = harness(config, messenger, Arc::new(ScriptedChecks::new())).await;
    let agent = h
        .orchestrator
        .spawner()
        .spawn(
            Initiator::Parent(h.orchestrator.root().id()),
            SpawnConfig::assigned("crawl the archive"),
        )
        .await
        .expect("spawn");
    eventually(|| h.orchestrator.in_flight() == 1).await;
    assert_eq!(agent.state(), AgentState::Working);

    assert_eq!(
        h.orchestrator.dismiss_worker(agent.id()).await.expect("dismiss"),
        Ack::Dismissed
    );
    let last = wait_until(&agent, |s| s.retired).await;
    assert_eq!(last.state, AgentState::FailedReaped);
    assert_eq!(last.reap_reason, Some(ReapReason::ExternalReap));
    eventually(|| h.orchestrator.in_flight() == 0).await;

    let root = h.orchestrator.root().clone();
    let view = wait_until(&root, |s| {
        s.notices.iter().any(|n| n.message.kind == MessageKind::Reaped)
    })
    .await;
    let notice = view
        .notices
        .iter()
        .find(|n| n.message.kind == MessageKind::Reaped)
        .expect("reaped notice");
    assert!(notice.message.text.contains("externalReap"));
}

#[tokio::test]
async fn messages_to_finished_agents_are_refused() {
    let messenger = Arc::new(
        ScriptedMessenger::new().script("write the report", vec![ScriptStep::text("DONE")]),
    );
    let h = harness(test_config(), messenger, Arc::new(ScriptedChecks::new())).await;
    let agent = h
        .orchestrator
        .spawner()
        .spawn(
            Initiator::Parent(h.orchestrator.root().id()),
            SpawnConfig::assigned("write the report").with_done_behavior(DoneBehavior::WaitIdle),
        )
        .await
        .expect("spawn");

    wait_until(&agent, |s| s.state == AgentState::Done).await;
    assert!(h.orchestrator.agent(agent.id()).is_some());
    let err = h
        .orchestrator
        .send_message(agent.id(), "one more thing")
        .expect_err("done");
    assert!(matches!(
        err,
        ToolError::AgentTerminal {
            state: AgentState::Done,
            ..
        }
    ));

    assert_eq!(
        h.orchestrator.dismiss_worker(agent.id()).await.expect("dismiss"),
        Ack::Dismissed
    );
    let err = h
        .orchestrator
        .send_message(agent.id(), "hello?")
        .expect_err("gone");
    assert!(matches!(err, ToolError::AgentGone(_)));
}

#[tokio::test]
async fn queued_input_is_returned_when_agent_leaves() {
    let messenger = Arc::new(ScriptedMessenger::new().script(
        "index the docs",
        vec![ScriptStep::delayed(Duration::from_millis(150), "DONE")],
    ));
    let h = harness(test_config(), messenger, Arc::new(ScriptedChecks::new())).await;
    let mut events = h.orchestrator.subscribe();
    let id = h
        .orchestrator
        .summon_worker(Some("index the docs".into()), None)
        .await
        .expect("summon");
    h.orchestrator
        .send_message(id, "also index the changelog")
        .expect("queued");
    let agent = h.orchestrator.agent(id).expect("live");
    assert_eq!(wait_until(&agent, |s| s.queued == 1).await.queued, 1);

    let last = wait_until(&agent, |s| s.retired).await;
    assert_eq!(last.state, AgentState::Done);

    let failure = tokio::time::timeout(WAIT, async {
        loop {
            let event = events.recv().await.expect("event");
            if let Notification::Bubbled {
                destination,
                message,
                ..
            } = event.notification
                && message.kind == MessageKind::DeliveryFailure
            {
                return (destination, message);
            }
        }
    })
    .await
    .expect("delivery failure published");
    assert_eq!(failure.0, Destination::User);
    assert!(failure.1.text.contains("also index the changelog"));
}

#[tokio::test]
async fn check_queue_drains_input_before_completing() {
    let messenger = Arc::new(ScriptedMessenger::new().script(
        "triage the issues",
        vec![
            ScriptStep::delayed(Duration::from_millis(150), "DONE"),
            ScriptStep::text("labelled the new issue"),
        ],
    ));
    let h = harness(test_config(), messenger.clone(), Arc::new(ScriptedChecks::new())).await;
    let agent = h
        .orchestrator
        .spawner()
        .spawn(
            Initiator::Parent(h.orchestrator.root().id()),
            SpawnConfig::assigned("triage the issues").with_done_behavior(DoneBehavior::CheckQueue),
        )
        .await
        .expect("spawn");
    h.orchestrator
        .send_message(agent.id(), "a new issue just came in")
        .expect("queued");

    let last = wait_until(&agent, |s| s.retired).await;
    assert_eq!(last.state, AgentState::Done);
    let prompts = messenger.prompts();
    assert_eq!(prompts.len(), 2);
    assert!(prompts[1].contains("a new issue just came in"));
}

#[tokio::test]
async fn events_replay_in_publish_order() {
    let messenger = Arc::new(
        ScriptedMessenger::new().script("tidy the readme", vec![ScriptStep::text("DONE")]),
    );
    let h = harness(test_config(), messenger, Arc::new(ScriptedChecks::new())).await;
    let mut live = h.orchestrator.subscribe();
    let id = h
        .orchestrator
        .summon_worker(Some("tidy the readme".into()), None)
        .await
        .expect("summon");
    let agent = h.orchestrator.agent(id).expect("live");
    wait_until(&agent, |s| s.retired).await;
    let root = h.orchestrator.root().clone();
    wait_until(&root, |s| {
        s.notices.iter().any(|n| n.message.kind == MessageKind::Completed)
    })
    .await;

    let replayed = EventBus::replay(h.store.as_ref()).expect("replay");
    let mut seen = Vec::new();
    while let Ok(event) = live.try_recv() {
        seen.push(event);
    }
    assert!(!seen.is_empty());
    let tail = &replayed[replayed.len() - seen.len()..];
    assert_eq!(tail, seen.as_slice());
    assert!(replayed.windows(2).all(|pair| pair[0].seq < pair[1].seq));
    assert!(seen.iter().any(|event| matches!(
        &event.notification,
        Notification::Spawned { agent_id, .. } if *agent_id == id
    )));
    assert!(seen.iter().any(|event| matches!(
        &event.notification,
        Notification::Retired { agent_id, .. } if *agent_id == id
    )));
}

#[tokio::test]
async fn restart_resumes_root_and_retires_leftover_workers() {
    let h = harness(
        test_config(),
        Arc::new(ScriptedMessenger::new().reply_with("ok")),
        Arc::new(ScriptedChecks::new()),
    )
    .await;
    let root_id = h.orchestrator.root().id();
    let worker = h
        .orchestrator
        .summon_worker(None, Some("scout".into()))
        .await
        .expect("summon");

    let restarted = Orchestrator::start(
        &test_config(),
        h.workdir.path().to_path_buf(),
        Services {
            store: h.store.clone(),
            messenger: Arc::new(ScriptedMessenger::new()),
            checks: Arc::new(ScriptedChecks::new()),
        },
    )
    .expect("restart");
    assert_eq!(restarted.root().id(), root_id);
    assert_eq!(restarted.status().len(), 1);
    assert!(read_agent(h.store.as_ref(), worker).expect("worker").retired);

    // The freed name can be used again by the new process.
    let again = restarted
        .summon_worker(None, Some("scout".into()))
        .await
        .expect("summon again");
    assert_ne!(again, worker);
    let live: Vec<_> = load_agents(h.store.as_ref())
        .expect("load")
        .into_iter()
        .filter(|record| !record.retired)
        .map(|record| record.name)
        .collect();
    assert_eq!(live.len(), 2);
    assert!(live.contains(&"scout".to_string()));
}
