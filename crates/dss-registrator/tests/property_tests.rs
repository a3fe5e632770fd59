//! Property tests for the undo table and the rollback stack

use dss_common::ErrorClass;
use dss_registrator::policy::{Progress, RollbackPolicy, UndoAction};
use dss_registrator::rollback::{RollbackCommand, RollbackStack};
use dss_registrator::storage::processor::DefaultStorageProcessor;
use dss_registrator::TransactionId;
use proptest::prelude::*;
use std::collections::BTreeMap;
use std::path::Path;
use walkdir::WalkDir;

fn class() -> impl Strategy<Value = ErrorClass> {
    proptest::sample::select(ErrorClass::ALL.to_vec())
}

fn progress() -> impl Strategy<Value = Progress> {
    proptest::sample::select(Progress::ALL.to_vec())
}

fn action() -> impl Strategy<Value = UndoAction> {
    prop_oneof![Just(UndoAction::None), Just(UndoAction::Delete), Just(UndoAction::MoveToError)]
}

fn files(root: &Path) -> BTreeMap<String, Vec<u8>> {
    WalkDir::new(root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| {
            let relative = e.path().strip_prefix(root).unwrap().to_string_lossy().into_owned();
            (relative, std::fs::read(e.path()).unwrap())
        })
        .collect()
}

proptest! {
    #[test]
    fn prop_decision_is_total_and_deterministic(class in class(), progress in progress()) {
        let policy = RollbackPolicy::default();
        let first = policy.decide(class, progress);
        prop_assert_eq!(first, policy.decide(class, progress));
        prop_assert_eq!(first, RollbackPolicy::default_action(class));
    }

    #[test]
    fn prop_interruption_always_leaves_content(
        overrides in proptest::collection::vec((class(), proptest::option::of(progress()), action()), 0..8),
        progress in progress(),
    ) {
        let mut policy = RollbackPolicy::default();
        for (class, cell, action) in overrides {
            if class != ErrorClass::Interruption {
                policy = policy.with_override(class, cell, action).unwrap();
            } else {
                prop_assert!(policy.clone().with_override(class, cell, action).is_err());
            }
        }
        prop_assert_eq!(policy.decide(ErrorClass::Interruption, progress), UndoAction::None);
    }

    #[test]
    fn prop_override_touches_only_its_cell(
        class in class(),
        target in progress(),
        other in progress(),
        action in action(),
    ) {
        prop_assume!(class != ErrorClass::Interruption);
        let policy = RollbackPolicy::default().with_override(class, Some(target), action).unwrap();
        prop_assert_eq!(policy.decide(class, target), action);
        if other != target {
            prop_assert_eq!(policy.decide(class, other), RollbackPolicy::default_action(class));
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_rollback_restores_moved_and_created_files(
        contents in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 0..64), 0..6),
        created in 0usize..4,
        replay_from_disk in any::<bool>(),
    ) {
        let dir = tempfile::tempdir().unwrap();
        let incoming = dir.path().join("incoming");
        let staging = dir.path().join("staging");
        std::fs::create_dir_all(&incoming).unwrap();
        std::fs::create_dir_all(&staging).unwrap();
        for (i, content) in contents.iter().enumerate() {
            std::fs::write(incoming.join(format!("file-{}", i)), content).unwrap();
        }
        let before = files(&incoming);

        let id = TransactionId::new();
        let workspace = staging.join(id.to_string());
        let mut stack = RollbackStack::new(&staging, id);
        stack.push(RollbackCommand::CreateDirectory { path: workspace.clone() }).unwrap();
        std::fs::create_dir_all(&workspace).unwrap();

        for i in 0..contents.len() {
            let from = incoming.join(format!("file-{}", i));
            let to = workspace.join(format!("moved-{}", i));
            stack.push(RollbackCommand::MoveFile { from: from.clone(), to: to.clone() }).unwrap();
            std::fs::rename(&from, &to).unwrap();
        }
        for i in 0..created {
            let path = workspace.join(format!("new-{}", i));
            stack.push(RollbackCommand::CreateFile { path: path.clone() }).unwrap();
            std::fs::write(&path, b"scratch").unwrap();
        }

        let processor = DefaultStorageProcessor::default();
        if replay_from_disk {
            let mut loaded = RollbackStack::load(stack.path()).unwrap();
            prop_assert_eq!(loaded.len(), stack.len());
            loaded.rollback(&processor).unwrap();
        } else {
            stack.rollback(&processor).unwrap();
        }

        prop_assert_eq!(files(&incoming), before);
        prop_assert!(!workspace.exists());
        prop_assert!(RollbackStack::list_persisted(&staging).unwrap().is_empty());
    }
}
