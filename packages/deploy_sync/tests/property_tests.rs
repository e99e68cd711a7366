use proptest::prelude::*;

use deploy_sync::progress::{
    DeploymentProgressAggregator, DeploymentStatus, MAX_NON_TERMINAL_PROGRESS, StageCatalog,
};
use deploy_sync::protocol::{DeploymentReport, DeploymentStart, StageStatus, StageUpdate};
use deploy_sync::transcript::{ChatMessage, ChatTranscript};

// --- Generators ---

fn arb_stage_id() -> impl Strategy<Value = String> {
    let ids: Vec<String> = StageCatalog::default()
        .stages()
        .iter()
        .map(|s| s.id.clone())
        .collect();
    prop_oneof![
        8 => proptest::sample::select(ids),
        1 => Just("not_a_stage".to_string()),
    ]
}

fn arb_status() -> impl Strategy<Value = StageStatus> {
    prop_oneof![
        Just(StageStatus::Pending),
        Just(StageStatus::InProgress),
        Just(StageStatus::Success),
        Just(StageStatus::Error),
    ]
}

fn arb_update() -> impl Strategy<Value = StageUpdate> {
    (
        arb_stage_id(),
        arb_status(),
        proptest::collection::vec("[a-c]{1,2}", 0..3),
    )
        .prop_map(|(stage, status, details)| StageUpdate {
            stage,
            status,
            message: None,
            details,
        })
}

#[derive(Debug, Clone)]
enum Event {
    Update(StageUpdate),
    Restart(String),
}

fn arb_event() -> impl Strategy<Value = Event> {
    prop_oneof![
        6 => arb_update().prop_map(Event::Update),
        1 => "d-[0-9]".prop_map(Event::Restart),
    ]
}

fn start(id: &str) -> DeploymentStart {
    DeploymentStart {
        deployment_id: id.to_string(),
        resume_stage: None,
        resume_progress: None,
    }
}

// --- Deployment progress invariants ---

proptest! {
    #[test]
    fn overall_progress_is_monotonic_and_capped(events in proptest::collection::vec(arb_event(), 1..60)) {
        let mut agg = DeploymentProgressAggregator::default();
        agg.start(&start("d-0"), false);
        let mut last = 0u8;

        for event in &events {
            match event {
                Event::Update(update) => { agg.apply_update(update); }
                Event::Restart(id) => { agg.start(&start(id), false); }
            }
            let p = agg.progress().unwrap();
            prop_assert!(p.overall_progress >= last, "{} < {}", p.overall_progress, last);
            prop_assert!(p.overall_progress <= MAX_NON_TERMINAL_PROGRESS);
            last = p.overall_progress;
        }
    }

    #[test]
    fn terminal_stages_stay_terminal(events in proptest::collection::vec(arb_event(), 1..60)) {
        let mut agg = DeploymentProgressAggregator::default();
        agg.start(&start("d-0"), false);
        let mut failed = false;

        for event in &events {
            let before: Vec<StageStatus> =
                agg.progress().unwrap().stages.iter().map(|s| s.status).collect();
            match event {
                Event::Update(update) => { agg.apply_update(update); }
                Event::Restart(id) => { agg.start(&start(id), false); }
            }
            let p = agg.progress().unwrap();
            for (old, stage) in before.iter().zip(&p.stages) {
                if old.is_terminal() && !failed {
                    prop_assert_eq!(*old, stage.status, "stage {} left a terminal state", stage.id);
                }
                prop_assert!(stage.status.rank() >= old.rank() || *old == StageStatus::Error);
            }
            failed = failed || p.status == DeploymentStatus::Failed;
        }
    }

    #[test]
    fn stage_details_are_append_only(events in proptest::collection::vec(arb_event(), 1..60)) {
        let mut agg = DeploymentProgressAggregator::default();
        agg.start(&start("d-0"), false);

        for event in &events {
            let before: Vec<Vec<String>> =
                agg.progress().unwrap().stages.iter().map(|s| s.details.clone()).collect();
            match event {
                Event::Update(update) => { agg.apply_update(update); }
                Event::Restart(id) => { agg.start(&start(id), false); }
            }
            for (old, stage) in before.iter().zip(&agg.progress().unwrap().stages) {
                prop_assert!(stage.details.starts_with(old));
                if let Event::Update(update) = event {
                    if update.stage == stage.id {
                        prop_assert!(stage.details.ends_with(&update.details));
                        prop_assert!(stage.details.len() <= old.len() + update.details.len());
                    }
                }
            }
        }
    }

    #[test]
    fn restart_never_resets_stages(
        updates in proptest::collection::vec(arb_update(), 1..30),
        new_id in "d-[0-9]{1,3}",
    ) {
        let mut agg = DeploymentProgressAggregator::default();
        agg.start(&start("d-0"), false);
        for update in &updates {
            agg.apply_update(update);
        }
        let before = agg.progress().unwrap().clone();

        agg.start(&start(&new_id), false);
        let after = agg.progress().unwrap();
        prop_assert_eq!(&after.deployment_id, &new_id);
        prop_assert!(after.overall_progress >= before.overall_progress);
        for (old, new) in before.stages.iter().zip(&after.stages) {
            prop_assert_eq!(old.status, new.status);
            prop_assert_eq!(&old.details, &new.details);
        }
    }

    #[test]
    fn completion_always_reaches_100(
        updates in proptest::collection::vec(arb_update(), 0..20),
        success in proptest::option::of(any::<bool>()),
        url in proptest::option::of("https://[a-z]{3,8}\\.run\\.app"),
    ) {
        let mut agg = DeploymentProgressAggregator::default();
        agg.start(&start("d-0"), false);
        for update in &updates {
            agg.apply_update(update);
        }
        let report = DeploymentReport { success, url, ..Default::default() };
        agg.complete(&report);

        let p = agg.progress().unwrap();
        prop_assert_eq!(p.overall_progress, 100);
        let expected = if report.succeeded() { DeploymentStatus::Success } else { DeploymentStatus::Failed };
        prop_assert_eq!(p.status, expected);
    }
}

// --- Transcript invariants ---

#[derive(Debug, Clone)]
enum Entry {
    Progress(String),
    Message(String),
}

fn arb_entry() -> impl Strategy<Value = Entry> {
    prop_oneof![
        "[a-z ]{1,12}".prop_map(Entry::Progress),
        "[a-z ]{1,12}".prop_map(Entry::Message),
    ]
}

proptest! {
    #[test]
    fn progress_runs_collapse(entries in proptest::collection::vec(arb_entry(), 0..40)) {
        let mut transcript = ChatTranscript::default();
        let mut expected = 0usize;
        let mut in_progress_run = false;

        for entry in &entries {
            match entry {
                Entry::Progress(text) => {
                    transcript.upsert_progress(text, None);
                    if !in_progress_run {
                        expected += 1;
                        in_progress_run = true;
                    }
                }
                Entry::Message(text) => {
                    transcript.append(ChatMessage::assistant(text.as_str()));
                    expected += 1;
                    in_progress_run = false;
                }
            }
        }

        prop_assert_eq!(transcript.len(), expected);
        let mut ids: Vec<&str> = transcript.messages().iter().map(|m| m.id.as_str()).collect();
        ids.sort_unstable();
        ids.dedup();
        prop_assert_eq!(ids.len(), transcript.len());
    }
}
