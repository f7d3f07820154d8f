use std::path::PathBuf;

use chrono::{Duration, Local, TimeZone, Utc};
use homebox_backup::error::{BackupError, StepExecutionError, StepFailure};
use homebox_backup::plan::PlanBuilder;
use homebox_backup::settings::BackupProfile;
use homebox_backup::types::{BackupOptions, BackupResult, ContainerDescriptor, RunStatus, StepKind};
use homebox_backup::ui::{parse_choice, parse_confirmation, render_containers, render_plan, render_result};

fn containers() -> Vec<ContainerDescriptor> {
    vec![
        ContainerDescriptor::new("a1b2c3d4e5f6", "homebox", "ghcr.io/hay-kot/homebox:latest")
            .with_mount("/data", "/srv/homebox"),
        ContainerDescriptor::new("d4e5f6a7b8c9", "postgres-db", "postgres:16"),
    ]
}

fn result(status: RunStatus) -> BackupResult {
    let started_at = Utc::now();
    BackupResult {
        status,
        archive_remote_path: Some("/tmp/homebox_backup_20240309_140507_0000beef.tar.gz".to_string()),
        archive_local_path: Some(PathBuf::from("/backups/homebox_backup_20240309_140507_0000beef.tar.gz")),
        log: Vec::new(),
        error: None,
        cleanup_error: None,
        started_at,
        finished_at: started_at + Duration::seconds(42),
    }
}

#[test]
fn test_parse_choice_is_one_based() {
    assert_eq!(parse_choice("1", 3), Some(0));
    assert_eq!(parse_choice(" 3\n", 3), Some(2));
    assert_eq!(parse_choice("0", 3), None);
    assert_eq!(parse_choice("4", 3), None);
    assert_eq!(parse_choice("two", 3), None);
    assert_eq!(parse_choice("", 3), None);
    assert_eq!(parse_choice("1", 0), None);
}

#[test]
fn test_parse_confirmation_defaults_to_no() {
    assert!(parse_confirmation("y\n"));
    assert!(parse_confirmation("YES"));
    assert!(parse_confirmation("  Yes "));
    assert!(!parse_confirmation("\n"));
    assert!(!parse_confirmation("n"));
    assert!(!parse_confirmation("yep"));
}

#[test]
fn test_render_containers_lists_mounts() {
    let out = render_containers(&containers());
    let lines: Vec<&str> = out.lines().collect();

    assert_eq!(lines.len(), 3);
    assert!(lines[0].starts_with("  1. homebox (ghcr.io/hay-kot/homebox:latest)"));
    assert!(lines[1].contains("/data -> /srv/homebox"));
    assert!(lines[2].starts_with("  2. postgres-db"));
}

#[test]
fn test_render_plan_shows_every_command() {
    let list = containers();
    let now = Local.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap();
    let plan = PlanBuilder::new(BackupProfile::default())
        .build_at(
            Some(&list[1]),
            Some(&list[0]),
            &BackupOptions {
                include_other_files: true,
                destination: std::env::temp_dir(),
            },
            now,
        )
        .unwrap();

    let out = render_plan(&plan);
    assert!(out.starts_with(&format!("Backup plan {}", plan.backup_name())));
    assert!(out.contains("homebox_backup_20240309_140507_"));
    for step in plan.steps() {
        assert!(out.contains(step.kind.display_name()));
        for command in &step.commands {
            assert!(out.contains(&format!("$ {command}")));
        }
    }
    assert!(out.contains(&format!("download {} to", plan.remote_archive())));
    assert!(out.contains("7. remote cleanup"));
}

#[test]
fn test_render_result_success() {
    let out = render_result(&result(RunStatus::Success));
    assert!(out.starts_with("Backup success after 42s"));
    assert!(out.contains("saved to: /backups/homebox_backup_20240309_140507_0000beef.tar.gz"));
    assert!(out.contains("remote archive: /tmp/homebox_backup_20240309_140507_0000beef.tar.gz"));
    assert!(!out.contains("error"));
}

#[test]
fn test_render_result_keeps_both_errors() {
    let mut failed = result(RunStatus::Failure);
    failed.archive_local_path = None;
    failed.error = Some(BackupError::Cancelled {
        before: StepKind::Archive,
    });
    failed.cleanup_error = Some(
        StepExecutionError::new(
            StepKind::Cleanup,
            StepFailure::NonZeroExit {
                command: "rm -rf /tmp/homebox_backup_x".to_string(),
                exit_code: 1,
                stderr: "Permission denied".to_string(),
            },
        )
        .into(),
    );

    let out = render_result(&failed);
    assert!(out.starts_with("Backup failure"));
    assert!(!out.contains("saved to"));
    assert!(out.contains("error: backup cancelled before archive creation"));
    assert!(out.contains("cleanup error: remote cleanup failed"));
    assert!(out.contains("Permission denied"));
}
