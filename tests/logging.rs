use clap::Parser;
use dagrun::cli::{CliArgs, LogLevel};
use dagrun::logging::resolve_level;
use tracing::Level;

#[test]
fn cli_flag_wins_over_environment() {
    assert_eq!(resolve_level(Some(LogLevel::Debug), Some("error")), Level::DEBUG);
}

#[test]
fn environment_is_used_without_a_flag() {
    assert_eq!(resolve_level(None, Some(" WARNING ")), Level::WARN);
    assert_eq!(resolve_level(None, Some("trace")), Level::TRACE);
}

#[test]
fn falls_back_to_info() {
    assert_eq!(resolve_level(None, None), Level::INFO);
    assert_eq!(resolve_level(None, Some("loud")), Level::INFO);
}

#[test]
fn cli_defaults_and_flags_parse() {
    let args = CliArgs::parse_from(["dagrun"]);
    assert_eq!(args.config, "Dagrun.toml");
    assert_eq!(args.parallel, None);
    assert!(!args.dry_run);

    let args = CliArgs::parse_from([
        "dagrun",
        "--config",
        "ci/Dagrun.toml",
        "--parallel",
        "6",
        "--bail",
        "--project",
        "web",
        "--log-level",
        "trace",
        "--profile",
        "trace.json",
    ]);
    assert_eq!(args.config, "ci/Dagrun.toml");
    assert_eq!(args.parallel, Some(6));
    assert!(args.bail);
    assert_eq!(args.project.as_deref(), Some("web"));
    assert!(matches!(args.log_level, Some(LogLevel::Trace)));
    assert_eq!(args.profile.as_deref(), Some(std::path::Path::new("trace.json")));
}
