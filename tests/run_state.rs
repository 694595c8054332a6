use dagrun::engine::RunState;
use dagrun::exec::TerminationSignal;
use dagrun::types::TaskStatus;
use dagrun_test_utils::TaskGraphBuilder;

fn id(s: &str) -> String {
    s.to_string()
}

fn diamond() -> dagrun::dag::TaskGraph {
    TaskGraphBuilder::new()
        .task("a:build", &[])
        .task("b:build", &["a:build"])
        .task("c:build", &["a:build"])
        .task("d:build", &["b:build", "c:build"])
        .task("e:build", &[])
        .build()
}

#[test]
fn failure_skips_every_transitive_dependent() {
    let graph = diamond();
    let mut state = RunState::new(&graph, false);

    let recorded = state.complete(&[(id("a:build"), TaskStatus::Failure)]);

    assert_eq!(recorded[0], (id("a:build"), TaskStatus::Failure));
    for dependent in ["b:build", "c:build", "d:build"] {
        assert_eq!(state.status(dependent), Some(TaskStatus::Skipped), "{dependent}");
    }
    assert_eq!(state.status("e:build"), None, "unrelated task untouched");
    assert_eq!(recorded.len(), 4, "d:build is recorded once despite two paths");
    assert!(!state.is_bailed());
}

#[test]
fn first_status_wins() {
    let graph = diamond();
    let mut state = RunState::new(&graph, false);

    state.complete(&[(id("e:build"), TaskStatus::Success)]);
    let recorded = state.complete(&[(id("e:build"), TaskStatus::Failure)]);

    assert!(recorded.is_empty());
    assert_eq!(state.status("e:build"), Some(TaskStatus::Success));
}

#[test]
fn bail_sets_the_flag_instead_of_propagating() {
    let graph = diamond();
    let mut state = RunState::new(&graph, true);

    let recorded = state.complete(&[(id("a:build"), TaskStatus::Failure)]);

    assert_eq!(recorded, vec![(id("a:build"), TaskStatus::Failure)]);
    assert!(state.is_bailed());
    assert_eq!(state.status("b:build"), None);
}

#[test]
fn cache_statuses_do_not_propagate() {
    let graph = diamond();
    let mut state = RunState::new(&graph, false);

    state.complete(&[(id("a:build"), TaskStatus::LocalCache)]);

    assert_eq!(state.statuses().len(), 1);
}

#[test]
fn exit_code_is_first_failure_in_declaration_order() {
    let graph = diamond();
    let mut state = RunState::new(&graph, false);

    state.record_exit_code(&id("e:build"), 3);
    state.complete(&[(id("e:build"), TaskStatus::Failure)]);
    state.record_exit_code(&id("a:build"), 7);
    state.complete(&[(id("a:build"), TaskStatus::Failure)]);

    let outcome = state.outcome(None);
    assert_eq!(outcome.exit_code(), 7, "a:build is declared before e:build");
    assert!(outcome.has_failures());
}

#[test]
fn exit_code_defaults_to_one_without_recorded_code() {
    let graph = diamond();
    let mut state = RunState::new(&graph, false);
    state.complete(&[(id("e:build"), TaskStatus::Failure)]);

    assert_eq!(state.outcome(None).exit_code(), 1);
}

#[test]
fn exit_code_reflects_the_interrupting_signal() {
    let graph = diamond();
    let mut state = RunState::new(&graph, false);
    state.complete(&[(id("e:build"), TaskStatus::Success)]);

    assert_eq!(state.outcome(Some(TerminationSignal::Interrupt)).exit_code(), 130);
    assert_eq!(state.outcome(Some(TerminationSignal::Terminate)).exit_code(), 143);
    assert_eq!(state.outcome(None).exit_code(), 0);
}
